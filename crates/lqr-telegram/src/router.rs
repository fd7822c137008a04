use std::{collections::HashMap, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use lqr_core::{
    config::Config,
    messaging::{port::MessagingPort, throttled::ThrottledMessenger},
    relay::{Relay, RelayPorts},
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub relay: Arc<Relay>,
    pub chat_locks: Arc<ChatLocks>,
}

/// Serializes handling of updates from the same chat so questions are charged
/// in the order they were sent.
#[derive(Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub async fn lock_chat(&self, chat_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            if map.len() >= PRUNE_AT && !map.contains_key(&chat_id) {
                retain_held(&mut map);
            }
            map.entry(chat_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Chat locks kept before unheld ones are dropped.
const PRUNE_AT: usize = 1024;

/// An entry only the map references has no holder and no waiter.
fn retain_held(map: &mut HashMap<i64, Arc<Mutex<()>>>) {
    map.retain(|_, lock| Arc::strong_count(lock) > 1);
}

/// Telegram messenger behind the outbound throttle. 429 RetryAfter is still
/// retried once inside the adapter.
pub fn build_messenger(cfg: &Config, bot: Bot) -> Arc<dyn MessagingPort> {
    let raw: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot));
    Arc::new(ThrottledMessenger::new(raw, cfg.throttle()))
}

pub async fn run_polling(cfg: Arc<Config>, ports: RelayPorts) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => info!(username = %me.username(), "bot started"),
        Err(e) => warn!(error = %e, "get_me failed; continuing"),
    }
    info!(
        responders = cfg.responders.len(),
        question_limit = cfg.question_limit,
        strict_reply_matching = cfg.strict_reply_matching,
        "relay configured"
    );

    let messenger = build_messenger(&cfg, bot.clone());
    let relay = Arc::new(Relay::new(cfg.relay_settings(), ports, messenger));

    let state = Arc::new(AppState {
        cfg,
        relay,
        chat_locks: Arc::new(ChatLocks::default()),
    });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn chat_lock_serializes_same_chat() {
        let locks = Arc::new(ChatLocks::default());
        let guard = locks.lock_chat(1).await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock_chat(1).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different chat is not blocked.
        let _unrelated = locks.lock_chat(2).await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn unheld_chat_locks_are_pruned() {
        let locks = ChatLocks::default();
        for chat in 1..=3 {
            drop(locks.lock_chat(chat).await);
        }
        let _held = locks.lock_chat(4).await;

        let mut map = locks.inner.lock().await;
        assert_eq!(map.len(), 4);
        retain_held(&mut map);
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![4]);
    }
}
