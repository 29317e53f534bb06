use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::bridges::{MessagingGateway, UpdateSource, expired_notice_text};
use crate::{CorrelationEngine, InboundEvent, Outcome, QuestionRegistry, RelayError};

const ERROR_BACKOFF: Duration = Duration::from_secs(2);
const BACKOFF_SLICE: Duration = Duration::from_millis(100);

/// Main loop: long-polls the chat for replies, hands each event to the
/// correlation engine, and expires stale questions between polls.
pub(crate) struct ReplyPoller<'a, S: UpdateSource> {
    source: &'a S,
    engine: CorrelationEngine,
    registry: Arc<QuestionRegistry>,
    gateway: Arc<dyn MessagingGateway>,
    timeout_secs: u64,
    sweep_interval: Duration,
    error_backoff: Duration,
    cursor: Option<i64>,
    last_sweep: Option<Instant>,
}

impl<'a, S: UpdateSource> ReplyPoller<'a, S> {
    pub(crate) fn new(
        source: &'a S,
        engine: CorrelationEngine,
        registry: Arc<QuestionRegistry>,
        gateway: Arc<dyn MessagingGateway>,
        timeout_secs: u64,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            source,
            engine,
            registry,
            gateway,
            timeout_secs,
            sweep_interval,
            error_backoff: ERROR_BACKOFF,
            cursor: None,
            last_sweep: None,
        }
    }

    pub(crate) fn run(&mut self, shutdown: &AtomicBool) {
        info!("polling for replies");
        while !shutdown.load(Ordering::SeqCst) {
            if self.last_sweep.is_none_or(|at| at.elapsed() >= self.sweep_interval) {
                self.sweep(Utc::now());
                self.last_sweep = Some(Instant::now());
            }
            if let Err(err) = self.poll_once() {
                warn!("poll failed: {err}");
                self.back_off(shutdown);
            }
        }
    }

    /// One long-poll round. Returns the number of events handled.
    pub(crate) fn poll_once(&mut self) -> Result<usize, RelayError> {
        let batch = self.source.poll_updates(self.cursor)?;
        if batch.next_cursor > self.cursor {
            self.cursor = batch.next_cursor;
        }
        let count = batch.events.len();
        for event in &batch.events {
            self.handle_event(event);
        }
        Ok(count)
    }

    fn handle_event(&self, event: &InboundEvent) {
        match self.engine.handle(event) {
            Ok(Outcome::Delivered {
                question,
                location,
                injected,
                ..
            }) => info!(question = %question, location = %location, injected, "reply relayed"),
            Ok(Outcome::Recorded {
                question,
                answered,
                size,
            }) => info!(question = %question, answered, size, "batch answer held"),
            Ok(Outcome::NoActiveQuestion) => debug!(update = event.update_id, "no active question"),
            Err(RelayError::Unauthorized { .. }) => {}
            Err(err) => debug!(update = event.update_id, "event not relayed: {err}"),
        }
    }

    /// Expires overdue questions and tells the chat about each one.
    pub(crate) fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired = self.registry.sweep_expired(now, self.timeout_secs);
        for question in &expired {
            if let Err(err) = self.gateway.send_notice(&expired_notice_text(question)) {
                warn!(question = %question.id, "failed to send expiry notice: {err}");
            }
            if let Some(message_id) = question.outbound_message_id.filter(|_| !question.options.is_empty()) {
                if let Err(err) = self.gateway.clear_buttons(message_id) {
                    debug!(question = %question.id, "could not clear buttons: {err}");
                }
            }
        }
        expired.len()
    }

    fn back_off(&self, shutdown: &AtomicBool) {
        let deadline = Instant::now() + self.error_backoff;
        while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
            thread::sleep(BACKOFF_SLICE.min(self.error_backoff));
        }
    }
}
