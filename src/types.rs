use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

const BUTTON_PREFIX: &str = "ans";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub(crate) struct QuestionId(String);

impl QuestionId {
    pub(crate) fn from_sequence(seq: u64) -> Self {
        QuestionId(format!("q{seq}"))
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        let digits = raw.strip_prefix('q')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(QuestionId(raw.to_string()))
    }
}

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct AnswerOption {
    pub(crate) label: String,
    pub(crate) value: String,
    pub(crate) description: Option<String>,
}

impl AnswerOption {
    pub(crate) fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum QuestionStatus {
    Pending,
    Answered,
    Expired,
}

/// Everything the ingress knows about a question before it is registered.
#[derive(Debug, Clone, Default)]
pub(crate) struct NewQuestion {
    pub(crate) prompt_text: String,
    pub(crate) header: Option<String>,
    pub(crate) options: Vec<AnswerOption>,
    pub(crate) multi_select: bool,
    pub(crate) terminal_location: String,
    pub(crate) session_id: Option<String>,
    pub(crate) cwd: Option<String>,
}

/// Place of a question within a multi-question hook. Answers to a batch are
/// held until every member is answered, then typed in `position` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct BatchSlot {
    pub(crate) batch: u64,
    /// 1-based.
    pub(crate) position: usize,
    pub(crate) size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct PendingQuestion {
    pub(crate) id: QuestionId,
    pub(crate) prompt_text: String,
    pub(crate) header: Option<String>,
    pub(crate) options: Vec<AnswerOption>,
    pub(crate) multi_select: bool,
    pub(crate) terminal_location: String,
    pub(crate) session_id: Option<String>,
    pub(crate) cwd: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) outbound_message_id: Option<i64>,
    pub(crate) status: QuestionStatus,
    pub(crate) answer: Option<String>,
    pub(crate) resolved_at: Option<DateTime<Utc>>,
    pub(crate) batch: Option<BatchSlot>,
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl PendingQuestion {
    pub(crate) fn is_pending(&self) -> bool {
        self.status == QuestionStatus::Pending
    }

    /// Project directory name shown in the chat, if the hook sent a cwd.
    pub(crate) fn project_name(&self) -> Option<&str> {
        let cwd = self.cwd.as_deref()?.trim_end_matches('/');
        cwd.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

/// Quick-reply button payload: `ans:<question id>:<option index>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ButtonPayload {
    pub(crate) question_id: QuestionId,
    pub(crate) option_index: usize,
}

impl ButtonPayload {
    pub(crate) fn encode(question_id: &QuestionId, option_index: usize) -> String {
        format!("{BUTTON_PREFIX}:{question_id}:{option_index}")
    }

    pub(crate) fn decode(data: &str) -> Option<Self> {
        let mut parts = data.splitn(3, ':');
        if parts.next()? != BUTTON_PREFIX {
            return None;
        }
        let question_id = QuestionId::parse(parts.next()?)?;
        let option_index = parts.next()?.parse().ok()?;
        Some(ButtonPayload {
            question_id,
            option_index,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InboundEvent {
    pub(crate) update_id: i64,
    pub(crate) chat_id: i64,
    pub(crate) kind: InboundKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InboundKind {
    Button {
        callback_id: String,
        message_id: Option<i64>,
        data: String,
    },
    Reply {
        message_id: i64,
        reply_to: i64,
        text: String,
    },
    Plain {
        message_id: i64,
        text: String,
    },
}

/// Agent went idle; relayed as a notice and never registered.
#[derive(Debug, Clone)]
pub(crate) struct StopEvent {
    pub(crate) terminal_location: String,
    pub(crate) stop_reason: String,
    pub(crate) cwd: Option<String>,
}
