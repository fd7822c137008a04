//! Maps a responder's reply onto exactly one open question.
//!
//! Resolution order:
//! 1. If the reply carries a reference (the message it replies to), look the
//!    question up by that delivery reference. A hit is authoritative: if the
//!    referenced question is already answered the reply is rejected rather
//!    than re-routed.
//! 2. If the reference is missing or unknown, fall back to the most recently
//!    created OPEN question across all users.
//! 3. With no OPEN question at all, resolution fails.
//!
//! The fallback in step 2 is only correct while a single question is
//! outstanding. With several users waiting it can hand a reply to the wrong
//! person. Deployments with concurrent traffic should run with
//! [`MatchPolicy::StrictReference`], which disables the fallback.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    domain::{DeliveryRef, Question},
    errors::RelayError,
    storage::{QuestionStore, StoreError},
};

/// How a reply was tied to its question.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchedBy {
    /// The reply referenced a tracked delivery of the question.
    Reference,
    /// Heuristic: the newest OPEN question at resolution time.
    LatestOpen,
    /// The responder named the question id explicitly.
    ExplicitId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    #[default]
    ReferenceWithFallback,
    StrictReference,
}

#[derive(Clone, Debug)]
pub struct Resolution {
    pub question: Question,
    pub matched_by: MatchedBy,
}

pub struct ReplyResolver {
    store: Arc<dyn QuestionStore>,
    policy: MatchPolicy,
}

impl ReplyResolver {
    pub fn new(store: Arc<dyn QuestionStore>, policy: MatchPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub async fn resolve(
        &self,
        reference: Option<DeliveryRef>,
    ) -> std::result::Result<Resolution, RelayError> {
        if let Some(reference) = reference {
            match self.store.find_by_delivery_ref(reference).await {
                Ok(question) if question.is_open() => {
                    return Ok(Resolution {
                        question,
                        matched_by: MatchedBy::Reference,
                    });
                }
                Ok(question) => {
                    debug!(
                        question_id = question.id.0,
                        reference = %reference,
                        "reply references an answered question"
                    );
                    return Err(RelayError::NoMatchingQuestion);
                }
                Err(StoreError::NotFound) => {
                    debug!(reference = %reference, "reply references an untracked message");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self.policy == MatchPolicy::StrictReference {
            return Err(RelayError::NoMatchingQuestion);
        }

        match self.store.find_latest_open(None).await {
            Ok(question) => {
                warn!(
                    question_id = question.id.0,
                    user_id = question.user_id.0,
                    "reply matched by latest-open fallback; may be misrouted if several questions are open"
                );
                Ok(Resolution {
                    question,
                    matched_by: MatchedBy::LatestOpen,
                })
            }
            Err(StoreError::NotFound) => Err(RelayError::NoMatchingQuestion),
            Err(e) => Err(e.into()),
        }
    }
}
