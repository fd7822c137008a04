//! Telegram update handlers.
//!
//! Each handler is a small adapter that:
//! - parses the update once into a command, callback action or plain text
//! - calls the matching relay operation
//! - renders the outcome back into the chat

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, InlineKeyboardMarkup, Message, ParseMode},
};
use tracing::warn;

use lqr_core::domain::UserId;

use crate::router::AppState;

mod callback;
mod commands;
mod text;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user_id) = msg.from().map(|u| UserId(u.id.0 as i64)) else {
        return Ok(());
    };

    let Some(text) = msg.text() else {
        send_html(
            &bot,
            msg.chat.id,
            "Only text messages are supported. Please type your question.",
            None,
        )
        .await;
        return Ok(());
    };

    if text.starts_with('/') {
        return commands::handle_command(bot, msg, user_id, state).await;
    }

    // Sequentialize plain text per chat.
    let _guard = state.chat_locks.lock_chat(msg.chat.id.0).await;
    if state.relay.is_responder(user_id) {
        text::handle_responder_text(bot, msg, user_id, state).await
    } else {
        text::handle_user_text(bot, msg, user_id, state).await
    }
}

/// Best-effort HTML send; failures are logged, never propagated to the dispatcher.
pub(crate) async fn send_html(
    bot: &Bot,
    chat_id: teloxide::types::ChatId,
    html: &str,
    markup: Option<InlineKeyboardMarkup>,
) {
    let mut req = bot
        .send_message(chat_id, html.to_string())
        .parse_mode(ParseMode::Html);
    if let Some(markup) = markup {
        req = req.reply_markup(markup);
    }
    if let Err(e) = req.await {
        warn!(chat_id = chat_id.0, error = %e, "failed to send message");
    }
}
