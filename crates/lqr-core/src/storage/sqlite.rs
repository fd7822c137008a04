//! SQLite-backed implementation of the storage ports.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use crate::domain::{DeliveryRef, FaqEntry, Question, QuestionId, QuestionState, UserId};

use super::{
    EventKind, EventLog, FaqCatalog, QuestionCounts, QuestionStore, QuotaLedger, Reservation,
    StoreError, StoreOptions, StoreResult,
};

const QUESTION_COLUMNS: &str = "q.id, q.user_id, q.delivery_ref, q.text, q.state, \
     q.answer_text, q.answered_by, q.created_at, q.answered_at";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS questions (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id      INTEGER NOT NULL,
        delivery_ref TEXT UNIQUE,
        text         TEXT NOT NULL,
        state        TEXT NOT NULL DEFAULT 'OPEN' CHECK (state IN ('OPEN', 'ANSWERED')),
        answer_text  TEXT,
        answered_by  INTEGER,
        created_at   TEXT NOT NULL,
        answered_at  TEXT
    );

    CREATE TABLE IF NOT EXISTS deliveries (
        delivery_ref TEXT PRIMARY KEY,
        question_id  INTEGER NOT NULL REFERENCES questions(id),
        responder_id INTEGER NOT NULL,
        created_at   TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS quota (
        user_id  INTEGER PRIMARY KEY,
        consumed INTEGER NOT NULL DEFAULT 0 CHECK (consumed >= 0)
    );

    CREATE TABLE IF NOT EXISTS faqs (
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        question TEXT NOT NULL,
        answer   TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS events (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        kind       TEXT NOT NULL,
        user_id    INTEGER,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_questions_created_at ON questions(created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_questions_state ON questions(state);
    CREATE INDEX IF NOT EXISTS idx_deliveries_question ON deliveries(question_id);
    CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
";

const DEFAULT_FAQS: &[(&str, &str)] = &[
    (
        "How do I draw up a contract?",
        "Include in the contract:\n- the parties\n- the subject\n- the price\n- the deadlines\n- the liability of the parties\nIt is best to have a lawyer review it.",
    ),
    (
        "What should I do if I am dismissed?",
        "Check whether the dismissal complies with the Labour Code. You can challenge it in court or file a complaint with the labour inspectorate.",
    ),
    (
        "How do I contest a fine?",
        "File a complaint with the traffic police or the court within 10 days of receiving the fine.",
    ),
    (
        "How do I return a defective product?",
        "You can return a product within 14 days. If it is defective you may demand a refund or a replacement.",
    ),
    (
        "How do I ask a question?",
        "Send /start and choose \"Ask a question\", or simply type your question.",
    ),
];

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// SQLite store implementing every persistence port of the relay.
///
/// The connection sits behind a mutex and every call runs on the blocking
/// pool, bounded by the configured timeout.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    opts: StoreOptions,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. `":memory:"` gives an
    /// ephemeral database.
    pub fn open(path: impl AsRef<Path>, opts: StoreOptions) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn, opts)
    }

    pub fn open_in_memory(opts: StoreOptions) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, opts)
    }

    fn init(conn: Connection, opts: StoreOptions) -> StoreResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.busy_timeout(opts.timeout)?;
        conn.execute_batch(SCHEMA)?;
        seed_faqs(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            opts,
        })
    }

    pub fn options(&self) -> StoreOptions {
        self.opts
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// The timeout covers waiting for the connection. A call that times out
    /// never runs; once `f` has started it is awaited to completion, bounded
    /// by SQLite's `busy_timeout`, so `Timeout` always means nothing was written.
    async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let claim = Arc::new(AtomicU8::new(PENDING));
        let task_claim = claim.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Backend(format!("database lock poisoned: {e}")))?;
            if task_claim
                .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(StoreError::Timeout(Duration::ZERO));
            }
            f(&mut conn)
        });

        let joined = match tokio::time::timeout(self.opts.timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                if claim
                    .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Err(StoreError::Timeout(self.opts.timeout));
                }
                debug!("storage call started before its deadline; waiting for it");
                task.await
            }
        };

        match joined {
            Ok(res) => res,
            Err(e) => Err(StoreError::Backend(format!("storage task failed: {e}"))),
        }
    }

    /// Hold the connection, as a long-running call would.
    #[cfg(test)]
    pub(crate) fn block_connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

fn seed_faqs(conn: &Connection) -> StoreResult<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM faqs", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }
    for (question, answer) in DEFAULT_FAQS {
        conn.execute(
            "INSERT INTO faqs (question, answer) VALUES (?1, ?2)",
            params![question, answer],
        )?;
    }
    Ok(())
}

fn timestamp(dt: DateTime<Utc>) -> String {
    // Fixed width so lexical order equals chronological order.
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {raw}: {e}")))
}

fn row_to_question(row: &Row<'_>) -> rusqlite::Result<Question> {
    let delivery_ref = row
        .get::<_, Option<String>>(2)?
        .map(|s| s.parse::<DeliveryRef>().map_err(|e| conversion_error(2, e)))
        .transpose()?;
    let state_raw: String = row.get(4)?;
    let state = QuestionState::parse(&state_raw)
        .ok_or_else(|| conversion_error(4, format!("unknown question state {state_raw}")))?;
    let created_at = parse_timestamp(7, &row.get::<_, String>(7)?)?;
    let answered_at = row
        .get::<_, Option<String>>(8)?
        .map(|s| parse_timestamp(8, &s))
        .transpose()?;

    Ok(Question {
        id: QuestionId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        delivery_ref,
        text: row.get(3)?,
        state,
        answer_text: row.get(5)?,
        answered_by: row.get::<_, Option<i64>>(6)?.map(UserId),
        created_at,
        answered_at,
    })
}

fn load_question(conn: &Connection, id: QuestionId) -> StoreResult<Question> {
    conn.query_row(
        &format!("SELECT {QUESTION_COLUMNS} FROM questions q WHERE q.id = ?1"),
        params![id.0],
        row_to_question,
    )
    .optional()?
    .ok_or(StoreError::NotFound)
}

/// Question currently owning `delivery_ref`, if any.
fn delivery_owner(conn: &Connection, delivery_ref: &str) -> StoreResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT question_id FROM deliveries WHERE delivery_ref = ?1",
            params![delivery_ref],
            |r| r.get(0),
        )
        .optional()?)
}

#[async_trait]
impl QuestionStore for SqliteStore {
    async fn create(&self, user_id: UserId, text: &str) -> StoreResult<Question> {
        let text = text.to_string();
        self.execute(move |conn| {
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO questions (user_id, text, state, created_at) VALUES (?1, ?2, 'OPEN', ?3)",
                params![user_id.0, text, timestamp(created_at)],
            )?;
            let id = QuestionId(conn.last_insert_rowid());
            load_question(conn, id)
        })
        .await
    }

    async fn attach_delivery_ref(
        &self,
        question_id: QuestionId,
        delivery_ref: DeliveryRef,
        responder_id: UserId,
    ) -> StoreResult<()> {
        self.execute(move |conn| {
            let encoded = delivery_ref.to_string();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<Option<String>> = tx
                .query_row(
                    "SELECT delivery_ref FROM questions WHERE id = ?1",
                    params![question_id.0],
                    |r| r.get(0),
                )
                .optional()?;
            match current {
                None => return Err(StoreError::NotFound),
                Some(Some(existing)) if existing == encoded => return Ok(()),
                Some(Some(_)) => return Err(StoreError::AlreadyAttached),
                Some(None) => {}
            }
            if let Some(owner) = delivery_owner(&tx, &encoded)? {
                if owner != question_id.0 {
                    return Err(StoreError::AlreadyAttached);
                }
            }

            tx.execute(
                "UPDATE questions SET delivery_ref = ?1 WHERE id = ?2 AND delivery_ref IS NULL",
                params![encoded, question_id.0],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO deliveries (delivery_ref, question_id, responder_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![encoded, question_id.0, responder_id.0, timestamp(Utc::now())],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn link_delivery_ref(
        &self,
        question_id: QuestionId,
        delivery_ref: DeliveryRef,
        responder_id: UserId,
    ) -> StoreResult<()> {
        self.execute(move |conn| {
            let encoded = delivery_ref.to_string();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM questions WHERE id = ?1",
                    params![question_id.0],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound);
            }
            match delivery_owner(&tx, &encoded)? {
                Some(owner) if owner == question_id.0 => return Ok(()),
                Some(_) => return Err(StoreError::AlreadyAttached),
                None => {}
            }

            tx.execute(
                "INSERT INTO deliveries (delivery_ref, question_id, responder_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![encoded, question_id.0, responder_id.0, timestamp(Utc::now())],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn find_by_delivery_ref(&self, delivery_ref: DeliveryRef) -> StoreResult<Question> {
        self.execute(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {QUESTION_COLUMNS} FROM deliveries d
                     JOIN questions q ON q.id = d.question_id
                     WHERE d.delivery_ref = ?1"
                ),
                params![delivery_ref.to_string()],
                row_to_question,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn find_latest_open(&self, user_id: Option<UserId>) -> StoreResult<Question> {
        self.execute(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {QUESTION_COLUMNS} FROM questions q
                     WHERE q.state = 'OPEN' AND (?1 IS NULL OR q.user_id = ?1)
                     ORDER BY q.created_at DESC, q.id DESC
                     LIMIT 1"
                ),
                params![user_id.map(|u| u.0)],
                row_to_question,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn question(&self, question_id: QuestionId) -> StoreResult<Question> {
        self.execute(move |conn| load_question(conn, question_id)).await
    }

    async fn mark_answered(
        &self,
        question_id: QuestionId,
        answer_text: &str,
        responder_id: UserId,
    ) -> StoreResult<Question> {
        let answer_text = answer_text.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE questions
                 SET state = 'ANSWERED', answer_text = ?1, answered_by = ?2, answered_at = ?3
                 WHERE id = ?4 AND state = 'OPEN'",
                params![
                    answer_text,
                    responder_id.0,
                    timestamp(Utc::now()),
                    question_id.0
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::InvalidState);
            }
            load_question(conn, question_id)
        })
        .await
    }

    async fn list_open(&self, limit: usize) -> StoreResult<Vec<Question>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {QUESTION_COLUMNS} FROM questions q
                 WHERE q.state = 'OPEN'
                 ORDER BY q.created_at ASC, q.id ASC
                 LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit], row_to_question)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn counts(&self) -> StoreResult<QuestionCounts> {
        self.execute(|conn| {
            let (total, answered): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(state = 'ANSWERED'), 0) FROM questions",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            Ok(QuestionCounts {
                total: total.max(0) as u64,
                answered: answered.max(0) as u64,
            })
        })
        .await
    }
}

#[async_trait]
impl QuotaLedger for SqliteStore {
    fn limit(&self) -> u32 {
        self.opts.quota_limit
    }

    async fn check_and_reserve(&self, user_id: UserId) -> StoreResult<Reservation> {
        let limit = self.opts.quota_limit;
        self.execute(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO quota (user_id, consumed) VALUES (?1, 0)
                 ON CONFLICT(user_id) DO NOTHING",
                params![user_id.0],
            )?;
            // Row-level guard: the increment only happens below the limit.
            let changed = tx.execute(
                "UPDATE quota SET consumed = consumed + 1 WHERE user_id = ?1 AND consumed < ?2",
                params![user_id.0, limit],
            )?;
            let consumed: u32 = tx.query_row(
                "SELECT consumed FROM quota WHERE user_id = ?1",
                params![user_id.0],
                |r| r.get(0),
            )?;
            tx.commit()?;

            Ok(if changed == 1 {
                Reservation::Allowed { consumed }
            } else {
                Reservation::LimitExceeded { consumed }
            })
        })
        .await
    }

    async fn rollback(&self, user_id: UserId) -> StoreResult<()> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE quota SET consumed = consumed - 1 WHERE user_id = ?1 AND consumed > 0",
                params![user_id.0],
            )?;
            Ok(())
        })
        .await
    }

    async fn reset(&self, user_id: UserId) -> StoreResult<()> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO quota (user_id, consumed) VALUES (?1, 0)
                 ON CONFLICT(user_id) DO UPDATE SET consumed = 0",
                params![user_id.0],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, user_id: UserId) -> StoreResult<u32> {
        self.execute(move |conn| {
            let consumed: Option<u32> = conn
                .query_row(
                    "SELECT consumed FROM quota WHERE user_id = ?1",
                    params![user_id.0],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(consumed.unwrap_or(0))
        })
        .await
    }
}

#[async_trait]
impl EventLog for SqliteStore {
    async fn record(&self, kind: EventKind, user_id: Option<UserId>) -> StoreResult<()> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO events (kind, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![kind.as_str(), user_id.map(|u| u.0), timestamp(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn count_events(&self, kind: EventKind) -> StoreResult<u64> {
        self.execute(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM events WHERE kind = ?1",
                params![kind.as_str()],
                |r| r.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
        .await
    }
}

#[async_trait]
impl FaqCatalog for SqliteStore {
    async fn list_faqs(&self) -> StoreResult<Vec<FaqEntry>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare("SELECT id, question, answer FROM faqs ORDER BY id")?;
            let rows = stmt
                .query_map([], |r| {
                    Ok(FaqEntry {
                        id: r.get(0)?,
                        question: r.get(1)?,
                        answer: r.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn faq(&self, id: i64) -> StoreResult<FaqEntry> {
        self.execute(move |conn| {
            conn.query_row(
                "SELECT id, question, answer FROM faqs WHERE id = ?1",
                params![id],
                |r| {
                    Ok(FaqEntry {
                        id: r.get(0)?,
                        question: r.get(1)?,
                        answer: r.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MessageId, MessageRef};

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(StoreOptions::default()).unwrap()
    }

    fn dref(chat: i64, msg: i32) -> DeliveryRef {
        MessageRef {
            chat_id: ChatId(chat),
            message_id: MessageId(msg),
        }
    }

    #[tokio::test]
    async fn create_starts_open_without_delivery_ref() {
        let s = store();
        let q = s.create(UserId(42), "Can I get my deposit back?").await.unwrap();
        assert_eq!(q.id, QuestionId(1));
        assert_eq!(q.user_id, UserId(42));
        assert_eq!(q.state, QuestionState::Open);
        assert!(q.delivery_ref.is_none());
        assert!(q.answer_text.is_none());
    }

    #[tokio::test]
    async fn attach_is_at_most_once() {
        let s = store();
        let q = s.create(UserId(1), "q").await.unwrap();

        s.attach_delivery_ref(q.id, dref(99, 10), UserId(99)).await.unwrap();
        // Same reference again is harmless.
        s.attach_delivery_ref(q.id, dref(99, 10), UserId(99)).await.unwrap();

        let err = s
            .attach_delivery_ref(q.id, dref(99, 11), UserId(99))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::AlreadyAttached);

        let stored = s.question(q.id).await.unwrap();
        assert_eq!(stored.delivery_ref, Some(dref(99, 10)));
    }

    #[tokio::test]
    async fn delivery_ref_cannot_point_at_two_questions() {
        let s = store();
        let a = s.create(UserId(1), "a").await.unwrap();
        let b = s.create(UserId(2), "b").await.unwrap();

        s.attach_delivery_ref(a.id, dref(99, 10), UserId(99)).await.unwrap();
        assert_eq!(
            s.attach_delivery_ref(b.id, dref(99, 10), UserId(99)).await.unwrap_err(),
            StoreError::AlreadyAttached
        );
        assert_eq!(
            s.link_delivery_ref(b.id, dref(99, 10), UserId(99)).await.unwrap_err(),
            StoreError::AlreadyAttached
        );
    }

    #[tokio::test]
    async fn attach_to_unknown_question_is_not_found() {
        let s = store();
        assert_eq!(
            s.attach_delivery_ref(QuestionId(7), dref(1, 1), UserId(1))
                .await
                .unwrap_err(),
            StoreError::NotFound
        );
    }

    #[tokio::test]
    async fn linked_copies_resolve_to_their_question() {
        let s = store();
        let q = s.create(UserId(1), "q").await.unwrap();
        s.attach_delivery_ref(q.id, dref(98, 5), UserId(98)).await.unwrap();
        s.link_delivery_ref(q.id, dref(99, 6), UserId(99)).await.unwrap();

        assert_eq!(s.find_by_delivery_ref(dref(98, 5)).await.unwrap().id, q.id);
        assert_eq!(s.find_by_delivery_ref(dref(99, 6)).await.unwrap().id, q.id);
        assert_eq!(
            s.find_by_delivery_ref(dref(99, 7)).await.unwrap_err(),
            StoreError::NotFound
        );
        // The primary reference is untouched by linked copies.
        assert_eq!(s.question(q.id).await.unwrap().delivery_ref, Some(dref(98, 5)));
    }

    #[tokio::test]
    async fn latest_open_prefers_newest_and_skips_answered() {
        let s = store();
        let a = s.create(UserId(1), "a").await.unwrap();
        let b = s.create(UserId(2), "b").await.unwrap();

        assert_eq!(s.find_latest_open(None).await.unwrap().id, b.id);
        assert_eq!(s.find_latest_open(Some(UserId(1))).await.unwrap().id, a.id);

        s.mark_answered(b.id, "done", UserId(99)).await.unwrap();
        assert_eq!(s.find_latest_open(None).await.unwrap().id, a.id);

        s.mark_answered(a.id, "done", UserId(99)).await.unwrap();
        assert_eq!(s.find_latest_open(None).await.unwrap_err(), StoreError::NotFound);
    }

    #[tokio::test]
    async fn mark_answered_is_transition_once() {
        let s = store();
        let q = s.create(UserId(1), "q").await.unwrap();

        let answered = s.mark_answered(q.id, "yes", UserId(99)).await.unwrap();
        assert_eq!(answered.state, QuestionState::Answered);
        assert_eq!(answered.answer_text.as_deref(), Some("yes"));
        assert_eq!(answered.answered_by, Some(UserId(99)));
        assert!(answered.answered_at.is_some());

        assert_eq!(
            s.mark_answered(q.id, "yes", UserId(99)).await.unwrap_err(),
            StoreError::InvalidState
        );
        assert_eq!(
            s.mark_answered(QuestionId(404), "yes", UserId(99)).await.unwrap_err(),
            StoreError::InvalidState
        );
    }

    #[tokio::test]
    async fn quota_reserves_up_to_limit_and_rolls_back() {
        let s = store();
        let u = UserId(42);
        for expected in 1..=3 {
            assert_eq!(
                s.check_and_reserve(u).await.unwrap(),
                Reservation::Allowed { consumed: expected }
            );
        }
        assert_eq!(
            s.check_and_reserve(u).await.unwrap(),
            Reservation::LimitExceeded { consumed: 3 }
        );
        assert_eq!(QuotaLedger::get(&s, u).await.unwrap(), 3);

        s.rollback(u).await.unwrap();
        assert_eq!(QuotaLedger::get(&s, u).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn quota_rollback_never_goes_negative() {
        let s = store();
        s.rollback(UserId(5)).await.unwrap();
        s.check_and_reserve(UserId(5)).await.unwrap();
        s.rollback(UserId(5)).await.unwrap();
        s.rollback(UserId(5)).await.unwrap();
        assert_eq!(QuotaLedger::get(&s, UserId(5)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn quota_reset_is_idempotent() {
        let s = store();
        let u = UserId(7);
        s.reset(u).await.unwrap();
        for _ in 0..3 {
            s.check_and_reserve(u).await.unwrap();
        }
        s.reset(u).await.unwrap();
        s.reset(u).await.unwrap();
        assert_eq!(QuotaLedger::get(&s, u).await.unwrap(), 0);
        assert_eq!(QuotaLedger::get(&s, UserId(8)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_open_is_oldest_first_and_counts_track_answers() {
        let s = store();
        let a = s.create(UserId(1), "a").await.unwrap();
        let b = s.create(UserId(2), "b").await.unwrap();
        let c = s.create(UserId(3), "c").await.unwrap();
        s.mark_answered(b.id, "x", UserId(99)).await.unwrap();

        let open: Vec<_> = s.list_open(10).await.unwrap().into_iter().map(|q| q.id).collect();
        assert_eq!(open, vec![a.id, c.id]);
        assert_eq!(s.list_open(1).await.unwrap().len(), 1);

        assert_eq!(
            s.counts().await.unwrap(),
            QuestionCounts {
                total: 3,
                answered: 1
            }
        );
    }

    #[tokio::test]
    async fn faqs_are_seeded_once() {
        let s = store();
        let faqs = s.list_faqs().await.unwrap();
        assert_eq!(faqs.len(), DEFAULT_FAQS.len());
        let first = s.faq(faqs[0].id).await.unwrap();
        assert_eq!(first, faqs[0]);
        assert_eq!(s.faq(999).await.unwrap_err(), StoreError::NotFound);
    }

    #[tokio::test]
    async fn events_are_counted_per_kind() {
        let s = store();
        s.record(EventKind::Start, Some(UserId(1))).await.unwrap();
        s.record(EventKind::Start, Some(UserId(2))).await.unwrap();
        s.record(EventKind::FaqAccess, None).await.unwrap();
        assert_eq!(s.count_events(EventKind::Start).await.unwrap(), 2);
        assert_eq!(s.count_events(EventKind::FaqAccess).await.unwrap(), 1);
        assert_eq!(s.count_events(EventKind::ResponderAnswer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sqlite3");

        let id = {
            let s = SqliteStore::open(&path, StoreOptions::default()).unwrap();
            let q = s.create(UserId(42), "persist me").await.unwrap();
            s.attach_delivery_ref(q.id, dref(99, 1), UserId(99)).await.unwrap();
            s.check_and_reserve(UserId(42)).await.unwrap();
            q.id
        };

        let s = SqliteStore::open(&path, StoreOptions::default()).unwrap();
        let q = s.find_by_delivery_ref(dref(99, 1)).await.unwrap();
        assert_eq!(q.id, id);
        assert_eq!(q.text, "persist me");
        assert_eq!(QuotaLedger::get(&s, UserId(42)).await.unwrap(), 1);
        assert_eq!(s.list_faqs().await.unwrap().len(), DEFAULT_FAQS.len());
    }

    fn short_timeout_store() -> SqliteStore {
        SqliteStore::open_in_memory(StoreOptions {
            quota_limit: 3,
            timeout: Duration::from_millis(50),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn timed_out_reservation_is_never_applied() {
        let s = short_timeout_store();

        let held = s.block_connection();
        let res = s.check_and_reserve(UserId(42)).await;
        assert_eq!(res, Err(StoreError::Timeout(Duration::from_millis(50))));
        drop(held);

        assert_eq!(QuotaLedger::get(&s, UserId(42)).await.unwrap(), 0);
        assert_eq!(
            s.check_and_reserve(UserId(42)).await.unwrap(),
            Reservation::Allowed { consumed: 1 }
        );
    }

    #[tokio::test]
    async fn timed_out_create_leaves_no_question() {
        let s = short_timeout_store();

        let held = s.block_connection();
        let err = s.create(UserId(42), "lost").await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        drop(held);

        assert_eq!(s.counts().await.unwrap().total, 0);
        assert_eq!(s.find_latest_open(None).await.unwrap_err(), StoreError::NotFound);
    }
}
