use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::{BatchSlot, NewQuestion, PendingQuestion, QuestionId, QuestionStatus, RelayError};

pub(crate) const DEFAULT_MAX_PENDING: usize = 64;
pub(crate) const DEFAULT_RETENTION_SECS: u64 = 600;

/// Where a multi-question batch stands after one of its members was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BatchProgress {
    Waiting { answered: usize, size: usize },
    /// Every member answered; answers in question order. Reported once.
    Complete(Vec<String>),
    /// A member expired or was purged, or the batch was already submitted.
    Closed,
}

#[derive(Default)]
struct RegistryState {
    next_seq: u64,
    next_batch: u64,
    questions: HashMap<QuestionId, PendingQuestion>,
    by_message: HashMap<i64, QuestionId>,
    submitted: HashSet<u64>,
}

impl RegistryState {
    fn pending_count(&self) -> usize {
        self.questions.values().filter(|q| q.is_pending()).count()
    }

    fn insert(
        &mut self,
        question: NewQuestion,
        created_at: DateTime<Utc>,
        batch: Option<BatchSlot>,
    ) -> QuestionId {
        self.next_seq += 1;
        let seq = self.next_seq;
        let id = QuestionId::from_sequence(seq);
        let entry = PendingQuestion {
            id: id.clone(),
            prompt_text: question.prompt_text,
            header: question.header,
            options: question.options,
            multi_select: question.multi_select,
            terminal_location: question.terminal_location,
            session_id: question.session_id,
            cwd: question.cwd,
            created_at,
            outbound_message_id: None,
            status: QuestionStatus::Pending,
            answer: None,
            resolved_at: None,
            batch,
            seq,
        };
        info!(question = %id, location = %entry.terminal_location, "registered question");
        self.questions.insert(id.clone(), entry);
        id
    }
}

/// Thread-safe store of outstanding questions.
///
/// Every method takes the lock once and releases it before returning, so
/// callers can never hold it across a network or tmux call.
pub(crate) struct QuestionRegistry {
    state: Mutex<RegistryState>,
    max_pending: usize,
    retention: Duration,
}

impl Default for QuestionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING, DEFAULT_RETENTION_SECS)
    }
}

impl QuestionRegistry {
    pub(crate) fn new(max_pending: usize, retention_secs: u64) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            max_pending: max_pending.max(1),
            retention: Duration::seconds(retention_secs as i64),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register(&self, question: NewQuestion) -> Result<QuestionId, RelayError> {
        self.register_at(question, Utc::now())
    }

    pub(crate) fn register_at(
        &self,
        question: NewQuestion,
        created_at: DateTime<Utc>,
    ) -> Result<QuestionId, RelayError> {
        let mut state = self.lock();
        if state.pending_count() >= self.max_pending {
            return Err(RelayError::Capacity {
                limit: self.max_pending,
            });
        }
        Ok(state.insert(question, created_at, None))
    }

    /// Registers all questions of one hook, or none of them when they do not
    /// fit. More than one question forms a batch answered as a unit.
    pub(crate) fn register_batch(
        &self,
        questions: Vec<NewQuestion>,
    ) -> Result<Vec<QuestionId>, RelayError> {
        self.register_batch_at(questions, Utc::now())
    }

    pub(crate) fn register_batch_at(
        &self,
        questions: Vec<NewQuestion>,
        created_at: DateTime<Utc>,
    ) -> Result<Vec<QuestionId>, RelayError> {
        let mut state = self.lock();
        if state.pending_count() + questions.len() > self.max_pending {
            return Err(RelayError::Capacity {
                limit: self.max_pending,
            });
        }
        let size = questions.len();
        let batch = if size > 1 {
            state.next_batch += 1;
            Some(state.next_batch)
        } else {
            None
        };
        let ids = questions
            .into_iter()
            .enumerate()
            .map(|(idx, question)| {
                let slot = batch.map(|batch| BatchSlot {
                    batch,
                    position: idx + 1,
                    size,
                });
                state.insert(question, created_at, slot)
            })
            .collect();
        Ok(ids)
    }

    /// Checks whether every member of `batch` is answered. `Complete` is
    /// handed out at most once per batch.
    pub(crate) fn batch_progress(&self, batch: u64) -> BatchProgress {
        let mut state = self.lock();
        if state.submitted.contains(&batch) {
            return BatchProgress::Closed;
        }
        let mut members: Vec<(usize, usize, &PendingQuestion)> = state
            .questions
            .values()
            .filter_map(|q| {
                q.batch
                    .filter(|slot| slot.batch == batch)
                    .map(|slot| (slot.position, slot.size, q))
            })
            .collect();
        let Some(size) = members.first().map(|(_, size, _)| *size) else {
            return BatchProgress::Closed;
        };
        if members.len() < size
            || members
                .iter()
                .any(|(_, _, q)| q.status == QuestionStatus::Expired)
        {
            return BatchProgress::Closed;
        }
        let answered = members
            .iter()
            .filter(|(_, _, q)| q.status == QuestionStatus::Answered)
            .count();
        if answered < size {
            return BatchProgress::Waiting { answered, size };
        }
        members.sort_by_key(|(position, _, _)| *position);
        let answers: Vec<String> = members
            .iter()
            .map(|(_, _, q)| q.answer.clone().unwrap_or_default())
            .collect();
        drop(members);
        state.submitted.insert(batch);
        debug!(batch, "batch complete");
        BatchProgress::Complete(answers)
    }

    pub(crate) fn attach_outbound_message(
        &self,
        id: &QuestionId,
        message_id: i64,
    ) -> Result<(), RelayError> {
        let mut state = self.lock();
        let entry = state
            .questions
            .get_mut(id)
            .filter(|q| q.is_pending())
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;
        match entry.outbound_message_id {
            Some(existing) if existing == message_id => return Ok(()),
            Some(existing) => {
                return Err(RelayError::NotFound(format!(
                    "{id} already bound to message {existing}"
                )));
            }
            None => entry.outbound_message_id = Some(message_id),
        }
        state.by_message.insert(message_id, id.clone());
        debug!(question = %id, message_id, "attached outbound message");
        Ok(())
    }

    /// Newest pending question; registration order breaks timestamp ties.
    pub(crate) fn most_recent_pending(&self) -> Option<PendingQuestion> {
        let state = self.lock();
        state
            .questions
            .values()
            .filter(|q| q.is_pending())
            .max_by_key(|q| (q.created_at, q.seq))
            .cloned()
    }

    pub(crate) fn resolve(
        &self,
        id: &QuestionId,
        chosen_value: &str,
    ) -> Result<PendingQuestion, RelayError> {
        let mut state = self.lock();
        let entry = state
            .questions
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;
        if !entry.is_pending() {
            return Err(RelayError::AlreadyResolved(id.clone()));
        }
        entry.status = QuestionStatus::Answered;
        entry.answer = Some(chosen_value.to_string());
        entry.resolved_at = Some(Utc::now());
        info!(question = %id, "question answered");
        Ok(entry.clone())
    }

    /// Expires pending questions older than `timeout_secs` and purges
    /// resolved entries past the retention window. Returns the newly expired
    /// questions so the caller can notify the chat outside the lock.
    pub(crate) fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        timeout_secs: u64,
    ) -> Vec<PendingQuestion> {
        let timeout = Duration::seconds(timeout_secs as i64);
        let mut state = self.lock();
        let mut expired = Vec::new();
        for entry in state.questions.values_mut() {
            if entry.is_pending() && now - entry.created_at > timeout {
                entry.status = QuestionStatus::Expired;
                entry.resolved_at = Some(now);
                info!(question = %entry.id, "question expired");
                expired.push(entry.clone());
            }
        }

        let retention = self.retention;
        let stale: Vec<QuestionId> = state
            .questions
            .values()
            .filter(|q| q.resolved_at.is_some_and(|at| now - at > retention))
            .map(|q| q.id.clone())
            .collect();
        for id in stale {
            if let Some(entry) = state.questions.remove(&id) {
                if let Some(message_id) = entry.outbound_message_id {
                    state.by_message.remove(&message_id);
                }
                debug!(question = %id, "purged resolved question");
            }
        }
        let live: HashSet<u64> = state
            .questions
            .values()
            .filter_map(|q| q.batch.map(|slot| slot.batch))
            .collect();
        state.submitted.retain(|batch| live.contains(batch));

        expired.sort_by_key(|q| q.seq);
        expired
    }

    pub(crate) fn find_by_message_id(&self, message_id: i64) -> Option<PendingQuestion> {
        let state = self.lock();
        let id = state.by_message.get(&message_id)?;
        state.questions.get(id).cloned()
    }

    pub(crate) fn get(&self, id: &QuestionId) -> Option<PendingQuestion> {
        self.lock().questions.get(id).cloned()
    }

    /// Option chosen by a button tap, as `(label, value)`.
    pub(crate) fn option_value(
        &self,
        id: &QuestionId,
        index: usize,
    ) -> Result<(String, String), RelayError> {
        let state = self.lock();
        let entry = state
            .questions
            .get(id)
            .filter(|q| q.is_pending())
            .ok_or_else(|| RelayError::UnknownQuestion(id.clone()))?;
        let option = entry.options.get(index).ok_or_else(|| {
            RelayError::MalformedReply(format!("{id} has no option {index}"))
        })?;
        Ok((option.label.clone(), option.value.clone()))
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending_count()
    }
}
