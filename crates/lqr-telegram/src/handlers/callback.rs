use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup},
};
use tracing::{debug, warn};

use lqr_core::{
    domain::{FaqEntry, UserId},
    formatting::escape_html,
};

use super::{commands::welcome_text, send_html};
use crate::router::AppState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    ShowFaq,
    FaqItem(i64),
    AskQuestion,
    BackToStart,
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        match data {
            "show_faq" => Some(CallbackAction::ShowFaq),
            "ask_question" => Some(CallbackAction::AskQuestion),
            "back_to_start" => Some(CallbackAction::BackToStart),
            other => other
                .strip_prefix("faq_")
                .and_then(|id| id.parse::<i64>().ok())
                .map(CallbackAction::FaqItem),
        }
    }

    pub fn data(&self) -> String {
        match self {
            CallbackAction::ShowFaq => "show_faq".to_string(),
            CallbackAction::FaqItem(id) => format!("faq_{id}"),
            CallbackAction::AskQuestion => "ask_question".to_string(),
            CallbackAction::BackToStart => "back_to_start".to_string(),
        }
    }
}

fn button(label: &str, action: CallbackAction) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(label.to_string(), action.data())
}

pub(crate) fn start_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![button("FAQ", CallbackAction::ShowFaq)],
        vec![button("Ask a question", CallbackAction::AskQuestion)],
    ])
}

pub(crate) fn faq_keyboard(faqs: &[FaqEntry]) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = faqs
        .iter()
        .map(|f| vec![button(&f.question, CallbackAction::FaqItem(f.id))])
        .collect();
    rows.push(vec![button("Back", CallbackAction::BackToStart)]);
    InlineKeyboardMarkup::new(rows)
}

fn back_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button("Back to FAQ", CallbackAction::ShowFaq)]])
}

fn format_faq(entry: &FaqEntry) -> String {
    format!(
        "❓ <b>{}</b>\n\n{}",
        escape_html(&entry.question),
        escape_html(&entry.answer)
    )
}

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let cb_id = q.id.clone();
    let user_id = UserId(q.from.id.0 as i64);
    let chat_id = q.message.as_ref().map(|m| m.chat.id);
    let action = q.data.as_deref().and_then(CallbackAction::parse);

    // Always answer the callback query so the client stops spinning.
    if let Err(e) = bot.answer_callback_query(cb_id).await {
        debug!(error = %e, "answer_callback_query failed");
    }

    let (Some(chat_id), Some(action)) = (chat_id, action) else {
        debug!(data = ?q.data, "ignoring callback without chat or known action");
        return Ok(());
    };

    let relay = &state.relay;
    match action {
        CallbackAction::ShowFaq => match relay.faqs().await {
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

        CallbackAction::FaqItem(id) => match relay.faq(user_id, id).await {
            Ok(Some(entry)) => {
                send_html(&bot, chat_id, &format_faq(&entry), Some(back_keyboard())).await
            }
            Ok(None) => send_html(&bot, chat_id, "This FAQ entry no longer exists.", None).await,
            Err(e) => send_html(&bot, chat_id, &e.user_message(None), None).await,
        },

        CallbackAction::AskQuestion => {
            let html = match relay.quota_status(user_id).await {
                Ok(q) if q.remaining() == 0 => lqr_core::errors::RelayError::QuotaExceeded {
                    limit: q.limit,
                }
                .user_message(state.cfg.escalation_contact.as_deref()),
                Ok(_) => "✍️ Type your question in one message.".to_string(),
                Err(e) => {
                    warn!(user_id = user_id.0, error = %e, "quota lookup failed");
                    e.user_message(None)
                }
            };
            send_html(&bot, chat_id, &html, None).await;
        }

        CallbackAction::BackToStart => {
            let html = match relay.quota_status(user_id).await {
                Ok(q) => welcome_text(&q),
                Err(e) => e.user_message(None),
            };
            send_html(&bot, chat_id, &html, Some(start_keyboard())).await;
        }
    }
    Ok(())
}
