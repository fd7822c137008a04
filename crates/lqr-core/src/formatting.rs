//! Telegram-HTML message bodies produced by the relay.

use crate::domain::Question;

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Truncate to `max_chars` characters, appending `...` when shortened.
pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

/// Body forwarded to each responder. Replying to this message routes the answer.
pub fn format_fanout(question: &Question, max_len: usize) -> String {
    let header = format!(
        "❓ <b>Question #{}</b> from user <code>{}</code>\n\n",
        question.id, question.user_id
    );
    let footer = "\n\n<i>Reply to this message to answer.</i>";
    let budget = max_len.saturating_sub(header.len() + footer.len() + 16).max(64);
    let body = escape_html(&truncate_text(&question.text, budget));
    format!("{header}{body}{footer}")
}

/// Body delivered to the original sender once a responder answered.
pub fn format_answer(question: &Question, answer: &str, max_len: usize) -> String {
    let quoted = escape_html(&truncate_text(&question.text, 500));
    let head = format!("📨 <b>Your question:</b>\n{quoted}\n\n<b>Answer:</b>\n");
    let budget = max_len.saturating_sub(head.len() + 16).max(64);
    format!("{head}{}", escape_html(&truncate_text(answer, budget)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{QuestionId, QuestionState, UserId};
    use chrono::Utc;

    fn question(text: &str) -> Question {
        Question {
            id: QuestionId(5),
            user_id: UserId(42),
            delivery_ref: None,
            text: text.to_string(),
            state: QuestionState::Open,
            answer_text: None,
            answered_by: None,
            created_at: Utc::now(),
            answered_at: None,
        }
    }

    #[test]
    fn escapes_html() {
        let s = r#"<a href="x&y">"#;
        assert_eq!(escape_html(s), "&lt;a href=&quot;x&amp;y&quot;&gt;");
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_text("привет", 10), "привет");
        assert_eq!(truncate_text("привет", 3), "при...");
    }

    #[test]
    fn fanout_names_question_and_sender_and_escapes_text() {
        let html = format_fanout(&question("Is <this> legal?"), 4000);
        assert!(html.contains("#5"));
        assert!(html.contains("<code>42</code>"));
        assert!(html.contains("Is &lt;this&gt; legal?"));
        assert!(html.contains("Reply to this message"));
    }

    #[test]
    fn long_bodies_respect_message_limit() {
        let long = "x".repeat(10_000);
        assert!(format_fanout(&question(&long), 4000).len() <= 4000);
        assert!(format_answer(&question("q"), &long, 4000).len() <= 4000);
    }

    #[test]
    fn answer_quotes_question() {
        let html = format_answer(&question("Deposit?"), "Yes, within 14 days", 4000);
        assert!(html.contains("Deposit?"));
        assert!(html.contains("Yes, within 14 days"));
    }
}
