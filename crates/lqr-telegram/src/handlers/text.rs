use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{info, warn};

use lqr_core::{
    domain::UserId,
    errors::RelayError,
    relay::{Routed, Submitted},
    resolver::MatchedBy,
};

use super::send_html;
use crate::{message_ref, router::AppState};

/// Plain text from an end user is a new question.
pub async fn handle_user_text(
    bot: Bot,
    msg: Message,
    user_id: UserId,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let text = msg.text().unwrap_or("").trim();
    if text.is_empty() {
        return Ok(());
    }

    let reply = match state.relay.submit_question(user_id, text).await {
        Ok(submitted) => submitted_text(&submitted),
        Err(e) => {
            info!(user_id = user_id.0, error = %e, "question not accepted");
            e.user_message(state.cfg.escalation_contact.as_deref())
        }
    };
    send_html(&bot, msg.chat.id, &reply, None).await;
    Ok(())
}

/// Plain text from a responder answers the question it replies to.
pub async fn handle_responder_text(
    bot: Bot,
    msg: Message,
    responder_id: UserId,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let text = msg.text().unwrap_or("").trim();
    if text.is_empty() {
        return Ok(());
    }

    let reference = msg.reply_to_message().map(message_ref);
    let reply = match state.relay.submit_reply(responder_id, text, reference).await {
        Ok(routed) => routed_text(&routed),
        Err(e) => {
            warn!(responder_id = responder_id.0, error = %e, "reply not routed");
            responder_error_text(&e)
        }
    };
    send_html(&bot, msg.chat.id, &reply, None).await;
    Ok(())
}

pub(crate) fn submitted_text(submitted: &Submitted) -> String {
    format!(
        "✅ Your question #{} was sent to a lawyer. Please wait for the answer.\nQuestions left: {} of {}.",
        submitted.question.id,
        submitted.quota.remaining(),
        submitted.quota.limit
    )
}

pub(crate) fn routed_text(routed: &Routed) -> String {
    let mut out = if routed.delivered {
        format!(
            "✅ Answer to question #{} sent to user <code>{}</code>.",
            routed.question.id, routed.user_id
        )
    } else {
        format!(
            "⚠️ Answer to question #{} was saved but could not be delivered to user <code>{}</code>.",
            routed.question.id, routed.user_id
        )
    };
    if routed.matched_by == MatchedBy::LatestOpen {
        out.push_str(
            "\n<i>Matched to the newest open question. Reply to the forwarded message to be exact.</i>",
        );
    }
    out
}

pub(crate) fn responder_error_text(e: &RelayError) -> String {
    match e {
        RelayError::InvalidState => "This question has already been answered.".to_string(),
        other => other.user_message(None),
    }
}
