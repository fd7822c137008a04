//! Relay orchestrator: the two entry points the transport calls into.
//!
//! `submit_question` charges quota, persists the question and fans it out to
//! the responders. `submit_reply` resolves a responder's reply to a question,
//! marks it answered and delivers the answer to the original sender.
//!
//! The relay keeps no mutable state of its own; every invariant is enforced by
//! conditional updates in the store, so any number of workers may share it.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::{
    domain::{DeliveryRef, FaqEntry, Question, QuestionId, UserId},
    errors::RelayError,
    formatting::{format_answer, format_fanout},
    messaging::port::MessagingPort,
    resolver::{MatchPolicy, MatchedBy, ReplyResolver, Resolution},
    security::is_authorized,
    storage::{
        EventKind, EventLog, FaqCatalog, QuestionStore, QuotaLedger, Reservation, StoreError,
    },
};

pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[derive(Clone, Debug)]
pub struct RelaySettings {
    /// Responder user ids: fan-out targets and the only users allowed to answer.
    pub responders: Vec<i64>,
    /// Disable the latest-open fallback and require an exact reference.
    pub strict_reply_matching: bool,
    pub max_message_len: usize,
}

/// The persistence ports the relay runs against.
#[derive(Clone)]
pub struct RelayPorts {
    pub questions: Arc<dyn QuestionStore>,
    pub quota: Arc<dyn QuotaLedger>,
    pub events: Arc<dyn EventLog>,
    pub faqs: Arc<dyn FaqCatalog>,
}

impl RelayPorts {
    /// Use one store for every port.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: QuestionStore + QuotaLedger + EventLog + FaqCatalog + 'static,
    {
        Self {
            questions: store.clone(),
            quota: store.clone(),
            events: store.clone(),
            faqs: store,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Submitted {
    pub question: Question,
    /// Responders whose copy was delivered and recorded.
    pub delivered_to: usize,
    pub quota: QuotaStatus,
}

#[derive(Clone, Debug)]
pub struct Routed {
    /// The original sender the answer belongs to.
    pub user_id: UserId,
    pub question: Question,
    pub matched_by: MatchedBy,
    /// Whether the answer reached the original sender.
    pub delivered: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaStatus {
    pub consumed: u32,
    pub limit: u32,
}

impl QuotaStatus {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.consumed)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub starts: u64,
    pub faq_views: u64,
    pub questions: u64,
    pub answered: u64,
    pub responder_answers: u64,
}

pub struct Relay {
    settings: RelaySettings,
    ports: RelayPorts,
    messenger: Arc<dyn MessagingPort>,
    resolver: ReplyResolver,
}

impl Relay {
    pub fn new(settings: RelaySettings, ports: RelayPorts, messenger: Arc<dyn MessagingPort>) -> Self {
        let policy = if settings.strict_reply_matching {
            MatchPolicy::StrictReference
        } else {
            MatchPolicy::ReferenceWithFallback
        };
        let resolver = ReplyResolver::new(ports.questions.clone(), policy);
        Self {
            settings,
            ports,
            messenger,
            resolver,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn is_responder(&self, user_id: UserId) -> bool {
        is_authorized(Some(user_id), &self.settings.responders)
    }

    /// Accept a question from an end user.
    pub async fn submit_question(&self, user_id: UserId, text: &str) -> RelayResult<Submitted> {
        let limit = self.ports.quota.limit();
        let consumed = match self.ports.quota.check_and_reserve(user_id).await? {
            Reservation::Allowed { consumed } => consumed,
            Reservation::LimitExceeded { consumed } => {
                info!(user_id = user_id.0, consumed, limit, "question rejected: quota exhausted");
                return Err(RelayError::QuotaExceeded { limit });
            }
        };

        let question = match self.ports.questions.create(user_id, text).await {
            Ok(q) => q,
            Err(e) => {
                warn!(user_id = user_id.0, error = %e, "failed to store question");
                if let Err(rb) = self.ports.quota.rollback(user_id).await {
                    error!(
                        user_id = user_id.0,
                        error = %rb,
                        "failed to release quota reservation for unstored question"
                    );
                }
                return Err(RelayError::Storage(e.to_string()));
            }
        };

        self.record_event(EventKind::UserQuestion, Some(user_id)).await;

        let (question, delivered_to) = self.fan_out(question).await?;
        info!(
            question_id = question.id.0,
            user_id = user_id.0,
            delivered_to,
            consumed,
            "question accepted"
        );

        Ok(Submitted {
            question,
            delivered_to,
            quota: QuotaStatus { consumed, limit },
        })
    }

    /// Route a responder's reply back to whoever asked the matching question.
    pub async fn submit_reply(
        &self,
        responder_id: UserId,
        reply_text: &str,
        reference: Option<DeliveryRef>,
    ) -> RelayResult<Routed> {
        self.authorize(responder_id)?;
        let Resolution {
            question,
            matched_by,
        } = self.resolver.resolve(reference).await?;
        self.complete(responder_id, question, reply_text, matched_by)
            .await
    }

    /// Answer a question named by id.
    pub async fn answer_question(
        &self,
        responder_id: UserId,
        question_id: QuestionId,
        reply_text: &str,
    ) -> RelayResult<Routed> {
        self.authorize(responder_id)?;
        let question = match self.ports.questions.question(question_id).await {
            Ok(q) if q.is_open() => q,
            Ok(_) | Err(StoreError::NotFound) => return Err(RelayError::NoMatchingQuestion),
            Err(e) => return Err(e.into()),
        };
        self.complete(responder_id, question, reply_text, MatchedBy::ExplicitId)
            .await
    }

    pub async fn open_questions(
        &self,
        responder_id: UserId,
        limit: usize,
    ) -> RelayResult<Vec<Question>> {
        self.authorize(responder_id)?;
        Ok(self.ports.questions.list_open(limit).await?)
    }

    pub async fn stats(&self, responder_id: UserId) -> RelayResult<RelayStats> {
        self.authorize(responder_id)?;
        let events = &self.ports.events;
        let counts = self.ports.questions.counts().await?;
        Ok(RelayStats {
            starts: events.count_events(EventKind::Start).await?,
            faq_views: events.count_events(EventKind::FaqAccess).await?,
            questions: counts.total,
            answered: counts.answered,
            responder_answers: events.count_events(EventKind::ResponderAnswer).await?,
        })
    }

    /// A fresh session: the user's quota starts over.
    pub async fn start_session(&self, user_id: UserId) -> RelayResult<QuotaStatus> {
        self.record_event(EventKind::Start, Some(user_id)).await;
        self.ports.quota.reset(user_id).await?;
        Ok(QuotaStatus {
            consumed: 0,
            limit: self.ports.quota.limit(),
        })
    }

    pub async fn quota_status(&self, user_id: UserId) -> RelayResult<QuotaStatus> {
        Ok(QuotaStatus {
            consumed: self.ports.quota.get(user_id).await?,
            limit: self.ports.quota.limit(),
        })
    }

    pub async fn faqs(&self) -> RelayResult<Vec<FaqEntry>> {
        Ok(self.ports.faqs.list_faqs().await?)
    }

    pub async fn faq(&self, user_id: UserId, id: i64) -> RelayResult<Option<FaqEntry>> {
        let entry = match self.ports.faqs.faq(id).await {
            Ok(entry) => entry,
            Err(StoreError::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.record_event(EventKind::FaqAccess, Some(user_id)).await;
        Ok(Some(entry))
    }

    fn authorize(&self, responder_id: UserId) -> RelayResult<()> {
        if self.is_responder(responder_id) {
            return Ok(());
        }
        warn!(user_id = responder_id.0, "responder action from unauthorized user");
        Err(RelayError::NotAuthorized(responder_id))
    }

    /// Deliver the question to every responder and record each delivery.
    ///
    /// Failed deliveries are skipped; a question nobody received stays OPEN
    /// without a delivery reference.
    async fn fan_out(&self, question: Question) -> RelayResult<(Question, usize)> {
        let body = format_fanout(&question, self.max_message_len());
        let mut primary: Option<DeliveryRef> = None;
        let mut delivered = 0usize;

        for &responder in &self.settings.responders {
            let responder = UserId(responder);
            let delivery_ref = match self.messenger.deliver(responder, &body).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(
                        question_id = question.id.0,
                        responder_id = responder.0,
                        error = %e,
                        "fan-out delivery failed"
                    );
                    continue;
                }
            };

            let recorded = if primary.is_none() {
                self.ports
                    .questions
                    .attach_delivery_ref(question.id, delivery_ref, responder)
                    .await
            } else {
                self.ports
                    .questions
                    .link_delivery_ref(question.id, delivery_ref, responder)
                    .await
            };

            match recorded {
                Ok(()) => {
                    primary.get_or_insert(delivery_ref);
                    delivered += 1;
                }
                Err(e @ (StoreError::AlreadyAttached | StoreError::InvalidState)) => {
                    let e = RelayError::from(e);
                    log_failure(&e, question.id);
                    return Err(e);
                }
                Err(e) => {
                    // Replies to this copy will not resolve by reference.
                    error!(
                        question_id = question.id.0,
                        responder_id = responder.0,
                        delivery_ref = %delivery_ref,
                        error = %e,
                        "failed to record fan-out delivery"
                    );
                }
            }
        }

        if delivered == 0 {
            warn!(question_id = question.id.0, "question reached no responder");
        }

        Ok((
            Question {
                delivery_ref: primary,
                ..question
            },
            delivered,
        ))
    }

    async fn complete(
        &self,
        responder_id: UserId,
        question: Question,
        reply_text: &str,
        matched_by: MatchedBy,
    ) -> RelayResult<Routed> {
        let answered = match self
            .ports
            .questions
            .mark_answered(question.id, reply_text, responder_id)
            .await
        {
            Ok(q) => q,
            Err(e) => {
                let e = RelayError::from(e);
                log_failure(&e, question.id);
                return Err(e);
            }
        };

        self.record_event(EventKind::ResponderAnswer, Some(responder_id))
            .await;

        let body = format_answer(&answered, reply_text, self.max_message_len());
        let delivered = match self.messenger.deliver(answered.user_id, &body).await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    question_id = answered.id.0,
                    user_id = answered.user_id.0,
                    error = %e,
                    "failed to deliver answer to original sender"
                );
                false
            }
        };

        info!(
            question_id = answered.id.0,
            user_id = answered.user_id.0,
            responder_id = responder_id.0,
            matched_by = ?matched_by,
            delivered,
            "reply routed"
        );

        Ok(Routed {
            user_id: answered.user_id,
            question: answered,
            matched_by,
            delivered,
        })
    }

    /// Best-effort: a lost event never fails the user's request.
    async fn record_event(&self, kind: EventKind, user_id: Option<UserId>) {
        if let Err(e) = self.ports.events.record(kind, user_id).await {
            warn!(event = kind.as_str(), error = %e, "failed to record event");
        }
    }

    fn max_message_len(&self) -> usize {
        self.settings
            .max_message_len
            .min(self.messenger.capabilities().max_message_len)
    }
}

fn log_failure(e: &RelayError, question_id: QuestionId) {
    if e.is_invariant_violation() {
        error!(question_id = question_id.0, error = %e, "relay invariant violated");
    } else {
        warn!(question_id = question_id.0, error = %e, "relay operation failed");
    }
}
