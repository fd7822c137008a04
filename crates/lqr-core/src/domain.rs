use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Identifier of an outbound message, returned by the messaging port and used
/// later to correlate a responder's reply with the question it answers.
pub type DeliveryRef = MessageRef;

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat_id.0, self.message_id.0)
    }
}

impl FromStr for MessageRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chat, msg) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed message ref: {s}"))?;
        let chat_id = chat
            .parse::<i64>()
            .map_err(|e| format!("malformed chat id in {s}: {e}"))?;
        let message_id = msg
            .parse::<i32>()
            .map_err(|e| format!("malformed message id in {s}: {e}"))?;
        Ok(Self {
            chat_id: ChatId(chat_id),
            message_id: MessageId(message_id),
        })
    }
}

/// Private chats share their id with the user, so a user can always be
/// addressed as a chat.
impl From<UserId> for ChatId {
    fn from(u: UserId) -> Self {
        ChatId(u.0)
    }
}

/// Store-assigned question id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuestionId(pub i64);

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuestionState {
    Open,
    Answered,
}

impl QuestionState {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionState::Open => "OPEN",
            QuestionState::Answered => "ANSWERED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(QuestionState::Open),
            "ANSWERED" => Some(QuestionState::Answered),
            _ => None,
        }
    }
}

/// A relayed question. Rows are never deleted; the table doubles as the audit trail.
#[derive(Clone, Debug, PartialEq)]
pub struct Question {
    pub id: QuestionId,
    pub user_id: UserId,
    pub delivery_ref: Option<DeliveryRef>,
    pub text: String,
    pub state: QuestionState,
    pub answer_text: Option<String>,
    pub answered_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

impl Question {
    pub fn is_open(&self) -> bool {
        self.state == QuestionState::Open
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaqEntry {
    pub id: i64,
    pub question: String,
    pub answer: String,
}
