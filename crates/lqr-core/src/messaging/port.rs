use async_trait::async_trait;

use crate::{
    domain::{DeliveryRef, UserId},
    messaging::types::MessagingCapabilities,
    Result,
};

/// Outbound capability the relay consumes from its transport.
///
/// Used both for fan-out to responders and for delivering an answer back to
/// the original sender. The returned reference identifies the sent message so
/// replies to it can be correlated later.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn deliver(&self, target: UserId, html: &str) -> Result<DeliveryRef>;
}
