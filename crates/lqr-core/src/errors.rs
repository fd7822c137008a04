use crate::{domain::UserId, formatting::escape_html, storage::StoreError};

/// Core error type for process-level failures (startup, wiring).
///
/// Relay operations report their outcomes through [`RelayError`] instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Typed failures of the two relay entry points.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("question limit of {limit} reached")]
    QuotaExceeded { limit: u32 },

    /// Transient infrastructure failure; the transport may retry.
    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("user {0} is not a responder")]
    NotAuthorized(UserId),

    #[error("no open question matches this reply")]
    NoMatchingQuestion,

    #[error("delivery reference already attached to a question")]
    AlreadyAttached,

    #[error("question is not open")]
    InvalidState,
}

impl RelayError {
    /// Protocol violations: fatal to the operation, never to the process.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, RelayError::AlreadyAttached | RelayError::InvalidState)
    }

    /// Telegram-HTML text safe to show to a chat participant. Storage failures
    /// never leak detail.
    pub fn user_message(&self, escalation_contact: Option<&str>) -> String {
        match self {
            RelayError::QuotaExceeded { limit } => {
                let mut msg = format!("You have used all {limit} of your questions.");
                match escalation_contact {
                    Some(contact) => {
                        msg.push_str(&format!(
                            " To learn more, contact a lawyer directly: {}",
                            escape_html(contact)
                        ))
                    }
                    None => msg.push_str(" Send /start to begin a new session."),
                }
                msg
            }
            RelayError::NoMatchingQuestion => "Could not find an open question for this reply. \
Reply directly to the forwarded question, or use /answer &lt;id&gt; &lt;text&gt;."
                .to_string(),
            RelayError::NotAuthorized(_) => "This action is not available.".to_string(),
            RelayError::Storage(_)
            | RelayError::AlreadyAttached
            | RelayError::InvalidState => {
                "Something went wrong on our side. Please try again in a moment.".to_string()
            }
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyAttached => RelayError::AlreadyAttached,
            StoreError::InvalidState => RelayError::InvalidState,
            other => RelayError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn quota_message_mentions_limit_and_contact() {
        let msg = RelayError::QuotaExceeded { limit: 3 }.user_message(Some("+7 999 000-00-00"));
        assert!(msg.contains('3'));
        assert!(msg.contains("+7 999 000-00-00"));
    }

    #[test]
    fn storage_message_hides_details() {
        let msg = RelayError::Storage("disk I/O error at /var/db".to_string()).user_message(None);
        assert!(!msg.contains("/var/db"));
        assert!(msg.contains("try again"));
    }

    #[test]
    fn store_errors_map_onto_relay_taxonomy() {
        assert_eq!(
            RelayError::from(StoreError::InvalidState),
            RelayError::InvalidState
        );
        assert_eq!(
            RelayError::from(StoreError::AlreadyAttached),
            RelayError::AlreadyAttached
        );
        assert!(matches!(
            RelayError::from(StoreError::Timeout(Duration::from_secs(1))),
            RelayError::Storage(_)
        ));
        assert!(matches!(
            RelayError::from(StoreError::NotFound),
            RelayError::Storage(_)
        ));
    }

    #[test]
    fn invariant_violations_are_flagged() {
        assert!(RelayError::InvalidState.is_invariant_violation());
        assert!(RelayError::AlreadyAttached.is_invariant_violation());
        assert!(!RelayError::NoMatchingQuestion.is_invariant_violation());
    }

    #[test]
    fn every_message_is_valid_telegram_html() {
        let contact = Some("Legal & Co <desk>");
        let all = [
            RelayError::QuotaExceeded { limit: 3 },
            RelayError::Storage("x".to_string()),
            RelayError::NotAuthorized(UserId(1)),
            RelayError::NoMatchingQuestion,
            RelayError::AlreadyAttached,
            RelayError::InvalidState,
        ];
        for e in &all {
            for c in [None, contact] {
                let msg = e.user_message(c);
                assert!(!msg.contains('<') && !msg.contains('>'), "raw markup in {msg:?}");
            }
        }

        let quota = RelayError::QuotaExceeded { limit: 3 }.user_message(contact);
        assert!(quota.contains("Legal &amp; Co &lt;desk&gt;"));
        assert!(RelayError::NoMatchingQuestion
            .user_message(None)
            .contains("/answer &lt;id&gt; &lt;text&gt;"));
    }
}
