//! Persistence ports and the SQLite adapter behind them.
//!
//! Every persistence failure crosses this boundary as a [`StoreError`]; callers
//! never see backend-specific error types.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{DeliveryRef, FaqEntry, Question, QuestionId, UserId};

pub mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("delivery reference already attached")]
    AlreadyAttached,

    #[error("invalid state transition")]
    InvalidState,

    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    /// Questions a user may submit before the ledger refuses reservations.
    pub quota_limit: u32,
    /// Upper bound for any single storage call.
    pub timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            quota_limit: 3,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a quota reservation. `consumed` is the count after the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reservation {
    Allowed { consumed: u32 },
    LimitExceeded { consumed: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuestionCounts {
    pub total: u64,
    pub answered: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    FaqAccess,
    UserQuestion,
    ResponderAnswer,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::FaqAccess => "faq_access",
            EventKind::UserQuestion => "user_question",
            EventKind::ResponderAnswer => "responder_answer",
        }
    }
}

/// Durable record of relayed questions.
#[async_trait]
pub trait QuestionStore: Send + Sync {
    /// Insert a new OPEN question without a delivery reference.
    async fn create(&self, user_id: UserId, text: &str) -> StoreResult<Question>;

    /// Set the primary delivery reference. Re-attaching the same reference is a
    /// no-op; a different one (or one owned by another question) is `AlreadyAttached`.
    async fn attach_delivery_ref(
        &self,
        question_id: QuestionId,
        delivery_ref: DeliveryRef,
        responder_id: UserId,
    ) -> StoreResult<()>;

    /// Record an additional fan-out copy of the question so replies to it resolve too.
    async fn link_delivery_ref(
        &self,
        question_id: QuestionId,
        delivery_ref: DeliveryRef,
        responder_id: UserId,
    ) -> StoreResult<()>;

    async fn find_by_delivery_ref(&self, delivery_ref: DeliveryRef) -> StoreResult<Question>;

    /// Most recently created OPEN question, optionally restricted to one sender.
    async fn find_latest_open(&self, user_id: Option<UserId>) -> StoreResult<Question>;

    async fn question(&self, question_id: QuestionId) -> StoreResult<Question>;

    /// Conditional `OPEN -> ANSWERED` transition. Unknown ids and already
    /// answered questions both fail with `InvalidState`.
    async fn mark_answered(
        &self,
        question_id: QuestionId,
        answer_text: &str,
        responder_id: UserId,
    ) -> StoreResult<Question>;

    /// OPEN questions, oldest first.
    async fn list_open(&self, limit: usize) -> StoreResult<Vec<Question>>;

    async fn counts(&self) -> StoreResult<QuestionCounts>;
}

/// Per-user question quota.
///
/// Reservations are eager: `check_and_reserve` increments on success and the
/// caller must `rollback` if the question never gets stored.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    fn limit(&self) -> u32;

    async fn check_and_reserve(&self, user_id: UserId) -> StoreResult<Reservation>;

    async fn rollback(&self, user_id: UserId) -> StoreResult<()>;

    async fn reset(&self, user_id: UserId) -> StoreResult<()>;

    async fn get(&self, user_id: UserId) -> StoreResult<u32>;
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn record(&self, kind: EventKind, user_id: Option<UserId>) -> StoreResult<()>;

    async fn count_events(&self, kind: EventKind) -> StoreResult<u64>;
}

#[async_trait]
pub trait FaqCatalog: Send + Sync {
    async fn list_faqs(&self) -> StoreResult<Vec<FaqEntry>>;

    async fn faq(&self, id: i64) -> StoreResult<FaqEntry>;
}
