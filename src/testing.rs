//! In-memory fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::bridges::{MessagingGateway, QuestionMessage, UpdateBatch, UpdateSource};
use crate::{InboundEvent, InboundKind, QuestionId, RelayError, TerminalInjector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sent {
    Question { id: QuestionId, message_id: i64 },
    Notice(String),
    Reply { to: i64, text: String },
    ButtonAnswer { callback_id: String, text: String },
    ClearButtons(i64),
    Rejected { chat_id: i64, text: String },
}

pub(crate) struct RecordingGateway {
    sent: Mutex<Vec<Sent>>,
    next_message_id: AtomicI64,
    fail: AtomicBool,
}

impl RecordingGateway {
    pub(crate) fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            next_message_id: AtomicI64::new(100),
            fail: AtomicBool::new(false),
        }
    }

    pub(crate) fn failing() -> Self {
        let gateway = Self::new();
        gateway.fail.store(true, Ordering::SeqCst);
        gateway
    }

    fn record(&self, entry: Sent) -> Result<(), RelayError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::Delivery("network down".to_string()));
        }
        self.sent.lock().unwrap().push(entry);
        Ok(())
    }

    pub(crate) fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn notices(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Notice(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn replies(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Reply { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn button_answers(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::ButtonAnswer { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl MessagingGateway for RecordingGateway {
    fn send_question(&self, message: &QuestionMessage) -> Result<i64, RelayError> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        self.record(Sent::Question {
            id: message.question.id.clone(),
            message_id,
        })?;
        Ok(message_id)
    }

    fn send_notice(&self, text: &str) -> Result<(), RelayError> {
        self.record(Sent::Notice(text.to_string()))
    }

    fn reply_to(&self, message_id: i64, text: &str) -> Result<(), RelayError> {
        self.record(Sent::Reply {
            to: message_id,
            text: text.to_string(),
        })
    }

    fn answer_button(&self, callback_id: &str, text: &str) -> Result<(), RelayError> {
        self.record(Sent::ButtonAnswer {
            callback_id: callback_id.to_string(),
            text: text.to_string(),
        })
    }

    fn clear_buttons(&self, message_id: i64) -> Result<(), RelayError> {
        self.record(Sent::ClearButtons(message_id))
    }

    fn reject_chat(&self, chat_id: i64, _message_id: i64, text: &str) -> Result<(), RelayError> {
        self.record(Sent::Rejected {
            chat_id,
            text: text.to_string(),
        })
    }
}

pub(crate) struct RecordingInjector {
    deliveries: Mutex<Vec<(String, String)>>,
    batches: Mutex<Vec<(String, Vec<String>)>>,
    succeed: bool,
}

impl RecordingInjector {
    pub(crate) fn new() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            succeed: true,
        }
    }

    pub(crate) fn broken() -> Self {
        Self {
            succeed: false,
            ..Self::new()
        }
    }

    pub(crate) fn deliveries(&self) -> Vec<(String, String)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub(crate) fn batches(&self) -> Vec<(String, Vec<String>)> {
        self.batches.lock().unwrap().clone()
    }
}

impl TerminalInjector for RecordingInjector {
    fn deliver(&self, location: &str, text: &str) -> bool {
        self.deliveries
            .lock()
            .unwrap()
            .push((location.to_string(), text.to_string()));
        self.succeed
    }

    fn deliver_batch(&self, location: &str, answers: &[String]) -> bool {
        self.batches
            .lock()
            .unwrap()
            .push((location.to_string(), answers.to_vec()));
        self.succeed
    }
}

/// Replays canned poll results, then raises the shutdown flag.
pub(crate) struct ScriptedSource {
    batches: Mutex<VecDeque<Result<UpdateBatch, RelayError>>>,
    cursors: Mutex<Vec<Option<i64>>>,
    shutdown: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub(crate) fn new(
        batches: Vec<Result<UpdateBatch, RelayError>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            cursors: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub(crate) fn cursors(&self) -> Vec<Option<i64>> {
        self.cursors.lock().unwrap().clone()
    }
}

impl UpdateSource for ScriptedSource {
    fn poll_updates(&self, cursor: Option<i64>) -> Result<UpdateBatch, RelayError> {
        self.cursors.lock().unwrap().push(cursor);
        match self.batches.lock().unwrap().pop_front() {
            Some(result) => result,
            None => {
                self.shutdown.store(true, Ordering::SeqCst);
                Ok(UpdateBatch {
                    events: Vec::new(),
                    next_cursor: cursor,
                })
            }
        }
    }
}

pub(crate) fn button(update_id: i64, chat_id: i64, data: &str) -> InboundEvent {
    InboundEvent {
        update_id,
        chat_id,
        kind: InboundKind::Button {
            callback_id: format!("cb{update_id}"),
            message_id: None,
            data: data.to_string(),
        },
    }
}

pub(crate) fn reply(update_id: i64, chat_id: i64, reply_to: i64, text: &str) -> InboundEvent {
    InboundEvent {
        update_id,
        chat_id,
        kind: InboundKind::Reply {
            message_id: 1000 + update_id,
            reply_to,
            text: text.to_string(),
        },
    }
}

pub(crate) fn plain(update_id: i64, chat_id: i64, text: &str) -> InboundEvent {
    InboundEvent {
        update_id,
        chat_id,
        kind: InboundKind::Plain {
            message_id: 1000 + update_id,
            text: text.to_string(),
        },
    }
}
