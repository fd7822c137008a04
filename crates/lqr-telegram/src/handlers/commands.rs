use std::sync::Arc;

use teloxide::prelude::*;
use tracing::warn;

use lqr_core::{
    domain::{Question, QuestionId, UserId},
    formatting::{escape_html, truncate_text},
    relay::{QuotaStatus, RelayStats},
};

use super::{
    callback::{faq_keyboard, start_keyboard},
    send_html,
    text::{responder_error_text, routed_text},
};
use crate::router::AppState;

const OPEN_QUESTIONS_PAGE: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    Faq,
    Ask,
    Quota,
    Questions,
    Answer { id: QuestionId, text: String },
    Stats,
    Unknown(String),
}

impl BotCommand {
    /// Telegram may send `/cmd@botname arg1 ...`.
    pub fn parse(text: &str) -> Self {
        let mut parts = text.trim().splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or("").trim();
        let rest = parts.next().unwrap_or("").trim();

        let cmd = first
            .trim_start_matches('/')
            .split('@')
            .next()
            .unwrap_or("")
            .to_lowercase();

        match cmd.as_str() {
            "start" => BotCommand::Start,
            "help" => BotCommand::Help,
            "faq" => BotCommand::Faq,
            "ask" => BotCommand::Ask,
            "quota" => BotCommand::Quota,
            "questions" => BotCommand::Questions,
            "stats" => BotCommand::Stats,
            "answer" => parse_answer(rest).unwrap_or(BotCommand::Unknown(cmd)),
            _ => BotCommand::Unknown(cmd),
        }
    }

    fn responder_only(&self) -> bool {
        matches!(
            self,
            BotCommand::Questions | BotCommand::Answer { .. } | BotCommand::Stats
        )
    }
}

fn parse_answer(rest: &str) -> Option<BotCommand> {
    let mut parts = rest.splitn(2, char::is_whitespace);
    let id = parts.next()?.trim().trim_start_matches('#').parse::<i64>().ok()?;
    let text = parts.next().unwrap_or("").trim();
    if text.is_empty() {
        return None;
    }
    Some(BotCommand::Answer {
        id: QuestionId(id),
        text: text.to_string(),
    })
}

pub(crate) fn welcome_text(quota: &QuotaStatus) -> String {
    format!(
        "👋 <b>Welcome!</b>\n\nBrowse the FAQ or ask a lawyer directly. You can ask {} question(s) this session.",
        quota.remaining()
    )
}

fn help_text(is_responder: bool) -> String {
    let mut lines = vec![
        "<b>Commands</b>",
        "/start - start a new session",
        "/faq - frequently asked questions",
        "/ask - how to ask a question",
        "/quota - questions left",
    ];
    if is_responder {
        lines.extend([
            "",
            "<b>Responder</b>",
            "/questions - open questions",
            "/answer &lt;id&gt; &lt;text&gt; - answer by id",
            "/stats - usage statistics",
            "Reply to a forwarded question to answer it.",
        ]);
    }
    lines.join("\n")
}

fn format_open_questions(questions: &[Question]) -> String {
    if questions.is_empty() {
        return "No open questions.".to_string();
    }
    let mut lines = vec![format!("<b>Open questions ({})</b>", questions.len())];
    for q in questions {
        lines.push(format!(
            "\n#{} from <code>{}</code> at {}\n{}",
            q.id,
            q.user_id,
            q.created_at.format("%Y-%m-%d %H:%M"),
            escape_html(&truncate_text(&q.text, 200))
        ));
    }
    lines.join("\n")
}

fn format_stats(stats: &RelayStats) -> String {
    format!(
        "📊 <b>Statistics</b>\n\nSessions started: {}\nFAQ views: {}\nQuestions: {}\nAnswered: {}\nResponder answers: {}",
        stats.starts, stats.faq_views, stats.questions, stats.answered, stats.responder_answers
    )
}

pub async fn handle_command(
    bot: Bot,
    msg: Message,
    user_id: UserId,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let chat_id = msg.chat.id;
    let command = BotCommand::parse(msg.text().unwrap_or(""));
    let relay = &state.relay;
    let is_responder = relay.is_responder(user_id);

    // Responder commands look unknown to everyone else.
    if command.responder_only() && !is_responder {
        send_html(&bot, chat_id, &help_text(false), None).await;
        return Ok(());
    }

    match command {
        BotCommand::Start => {
            let html = match relay.start_session(user_id).await {
                Ok(quota) => welcome_text(&quota),
                Err(e) => {
                    warn!(user_id = user_id.0, error = %e, "start failed");
                    e.user_message(None)
                }
            };
            send_html(&bot, chat_id, &html, Some(start_keyboard())).await;
        }

        BotCommand::Help => {
            send_html(&bot, chat_id, &help_text(is_responder), None).await;
        }

        BotCommand::Faq => match relay.faqs().await {
            Ok(faqs) => {
                send_html(
                    &bot,
                    chat_id,
                    "<b>Frequently asked questions</b>",
                    Some(faq_keyboard(&faqs)),
                )
                .await
            }
            Err(e) => send_html(&bot, chat_id, &e.user_message(None), None).await,
        },

        BotCommand::Ask => {
            send_html(&bot, chat_id, "✍️ Type your question in one message.", None).await;
        }

        BotCommand::Quota => {
            let html = match relay.quota_status(user_id).await {
                Ok(q) => format!("Questions left: {} of {}.", q.remaining(), q.limit),
                Err(e) => e.user_message(None),
            };
            send_html(&bot, chat_id, &html, None).await;
        }

        BotCommand::Questions => {
            let html = match relay.open_questions(user_id, OPEN_QUESTIONS_PAGE).await {
                Ok(open) => format_open_questions(&open),
                Err(e) => responder_error_text(&e),
            };
            send_html(&bot, chat_id, &html, None).await;
        }

        BotCommand::Answer { id, text } => {
            let html = match relay.answer_question(user_id, id, &text).await {
                Ok(routed) => routed_text(&routed),
                Err(e) => responder_error_text(&e),
            };
            send_html(&bot, chat_id, &html, None).await;
        }

        BotCommand::Stats => {
            let html = match relay.stats(user_id).await {
                Ok(stats) => format_stats(&stats),
                Err(e) => responder_error_text(&e),
            };
            send_html(&bot, chat_id, &html, None).await;
        }

        BotCommand::Unknown(cmd) => {
            let html = format!(
                "Unknown command: /{}\n\n{}",
                escape_html(&cmd),
                help_text(is_responder)
            );
            send_html(&bot, chat_id, &html, None).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_bot_suffix_and_case() {
        assert_eq!(BotCommand::parse("/start"), BotCommand::Start);
        assert_eq!(BotCommand::parse("/FAQ@robolaw_bot"), BotCommand::Faq);
        assert_eq!(BotCommand::parse("  /questions  "), BotCommand::Questions);
        assert_eq!(
            BotCommand::parse("/restart"),
            BotCommand::Unknown("restart".to_string())
        );
    }

    #[test]
    fn parses_answer_with_id_and_text() {
        assert_eq!(
            BotCommand::parse("/answer 12 Yes, within 14 days"),
            BotCommand::Answer {
                id: QuestionId(12),
                text: "Yes, within 14 days".to_string()
            }
        );
        assert_eq!(
            BotCommand::parse("/answer #3 ok"),
            BotCommand::Answer {
                id: QuestionId(3),
                text: "ok".to_string()
            }
        );
    }

    #[test]
    fn malformed_answer_is_unknown() {
        assert!(matches!(BotCommand::parse("/answer"), BotCommand::Unknown(_)));
        assert!(matches!(BotCommand::parse("/answer 12"), BotCommand::Unknown(_)));
        assert!(matches!(BotCommand::parse("/answer x hi"), BotCommand::Unknown(_)));
    }

    #[test]
    fn responder_commands_are_flagged() {
        assert!(BotCommand::Stats.responder_only());
        assert!(!BotCommand::Quota.responder_only());
    }

    #[test]
    fn help_lists_responder_tools_only_for_responders() {
        assert!(!help_text(false).contains("/answer"));
        assert!(help_text(true).contains("/answer"));
    }

    #[test]
    fn empty_open_list_has_placeholder() {
        assert_eq!(format_open_questions(&[]), "No open questions.");
    }
}
