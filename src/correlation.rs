//! Matches inbound chat replies to registered questions.
//!
//! Resolution order for an event from the authorized chat:
//!
//! 1. a button tap names its question directly;
//! 2. a reply-to reference is matched against the message each question was
//!    sent as;
//! 3. anything else goes to the most recent pending question.
//!
//! Rule 3 means an unqualified reply while several questions are pending
//! answers the newest one. Replying to a specific message is the way to
//! target an older question.
//!
//! Questions raised together by one hook form a batch. Their answers are
//! held until the last one arrives, then typed in question order and
//! submitted with a final Enter.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bridges::MessagingGateway;
use crate::{
    BatchProgress, ButtonPayload, InboundEvent, InboundKind, PendingQuestion, QuestionId,
    QuestionRegistry, QuestionStatus, RelayError, TerminalInjector,
};

const NO_ACTIVE_QUESTION: &str = "No pending questions from the agent";
const UNAUTHORIZED: &str = "Unauthorized. This bot is private.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Text was handed to the terminal; `answers` is above one for a batch.
    Delivered {
        question: QuestionId,
        location: String,
        text: String,
        answers: usize,
        injected: bool,
    },
    /// Answer stored; other questions of the same batch are still open.
    Recorded {
        question: QuestionId,
        answered: usize,
        size: usize,
    },
    NoActiveQuestion,
}

pub(crate) struct CorrelationEngine {
    authorized_chat: i64,
    registry: Arc<QuestionRegistry>,
    gateway: Arc<dyn MessagingGateway>,
    injector: Arc<dyn TerminalInjector>,
    notify_delivery_failures: bool,
}

impl CorrelationEngine {
    pub(crate) fn new(
        authorized_chat: i64,
        registry: Arc<QuestionRegistry>,
        gateway: Arc<dyn MessagingGateway>,
        injector: Arc<dyn TerminalInjector>,
        notify_delivery_failures: bool,
    ) -> Self {
        Self {
            authorized_chat,
            registry,
            gateway,
            injector,
            notify_delivery_failures,
        }
    }

    pub(crate) fn handle(&self, event: &InboundEvent) -> Result<Outcome, RelayError> {
        if event.chat_id != self.authorized_chat {
            warn!(chat_id = event.chat_id, "rejecting event from unauthorized chat");
            self.reject(event);
            return Err(RelayError::Unauthorized {
                chat_id: event.chat_id,
            });
        }

        match &event.kind {
            InboundKind::Button {
                callback_id,
                message_id,
                data,
            } => self.handle_button(callback_id, *message_id, data),
            InboundKind::Reply {
                message_id,
                reply_to,
                text,
            } => match self.registry.find_by_message_id(*reply_to) {
                Some(question) if question.is_pending() => {
                    self.resolve_text(&question.id, text, *message_id)
                }
                Some(question) => {
                    self.feedback(self.gateway.reply_to(*message_id, stale_text(&question)));
                    Err(RelayError::UnknownQuestion(question.id))
                }
                None => {
                    debug!(reply_to, "reply to an untracked message, using latest question");
                    self.handle_plain(text, *message_id)
                }
            },
            InboundKind::Plain { message_id, text } => self.handle_plain(text, *message_id),
        }
    }

    /// Tells a foreign chat it is not served. Never touches the registry.
    fn reject(&self, event: &InboundEvent) {
        let result = match &event.kind {
            InboundKind::Button { callback_id, .. } => {
                self.gateway.answer_button(callback_id, UNAUTHORIZED)
            }
            InboundKind::Reply { message_id, .. } | InboundKind::Plain { message_id, .. } => {
                self.gateway.reject_chat(event.chat_id, *message_id, UNAUTHORIZED)
            }
        };
        self.feedback(result);
    }

    fn handle_button(
        &self,
        callback_id: &str,
        message_id: Option<i64>,
        data: &str,
    ) -> Result<Outcome, RelayError> {
        let Some(payload) = ButtonPayload::decode(data) else {
            self.feedback(self.gateway.answer_button(callback_id, "Unknown action"));
            return Err(RelayError::MalformedReply(data.to_string()));
        };
        let id = payload.question_id;

        let (label, value) = match self.registry.option_value(&id, payload.option_index) {
            Ok(choice) => choice,
            Err(RelayError::UnknownQuestion(_)) => return Err(self.stale_button(callback_id, &id)),
            Err(err) => {
                self.feedback(self.gateway.answer_button(callback_id, "Invalid option"));
                return Err(err);
            }
        };
        let question = match self.registry.resolve(&id, &value) {
            Ok(question) => question,
            Err(_) => return Err(self.stale_button(callback_id, &id)),
        };

        let outcome = self.settle(&question, &value);
        let ack = match &outcome {
            Outcome::Delivered {
                injected: true,
                answers: 1,
                ..
            } => format!("Sent: {label}"),
            Outcome::Delivered {
                injected: true,
                answers,
                ..
            } => format!("Sent {answers} answers"),
            Outcome::Delivered { .. } if self.notify_delivery_failures => {
                "Failed to send - check tmux".to_string()
            }
            Outcome::Delivered { .. } | Outcome::NoActiveQuestion => "Answer recorded".to_string(),
            Outcome::Recorded { answered, size, .. } => {
                format!("Selected: {label} ({answered}/{size})")
            }
        };
        self.feedback(self.gateway.answer_button(callback_id, &ack));
        if let Some(mid) = question.outbound_message_id.or(message_id) {
            self.feedback(self.gateway.clear_buttons(mid));
        }
        Ok(outcome)
    }

    fn stale_button(&self, callback_id: &str, id: &QuestionId) -> RelayError {
        let text = match self.registry.get(id) {
            Some(question) => stale_text(&question),
            None => "Question expired",
        };
        self.feedback(self.gateway.answer_button(callback_id, text));
        RelayError::UnknownQuestion(id.clone())
    }

    fn handle_plain(&self, text: &str, message_id: i64) -> Result<Outcome, RelayError> {
        match self.registry.most_recent_pending() {
            Some(question) => self.resolve_text(&question.id, text, message_id),
            None => {
                info!("reply received with no pending question");
                self.feedback(self.gateway.reply_to(message_id, NO_ACTIVE_QUESTION));
                Ok(Outcome::NoActiveQuestion)
            }
        }
    }

    fn resolve_text(
        &self,
        id: &QuestionId,
        text: &str,
        message_id: i64,
    ) -> Result<Outcome, RelayError> {
        let question = match self.registry.resolve(id, text) {
            Ok(question) => question,
            Err(err) => {
                let notice = self
                    .registry
                    .get(id)
                    .map(|q| stale_text(&q))
                    .unwrap_or("Question expired");
                self.feedback(self.gateway.reply_to(message_id, notice));
                debug!(question = %id, "late reply: {err}");
                return Err(RelayError::UnknownQuestion(id.clone()));
            }
        };

        let outcome = self.settle(&question, text);
        if let Some(mid) = question.outbound_message_id {
            if !question.options.is_empty() {
                self.feedback(self.gateway.clear_buttons(mid));
            }
        }
        // A failed injection gets no confirmation; the optional notice was
        // already sent by `report_failure`.
        let confirmation = match &outcome {
            Outcome::Delivered {
                injected: true,
                answers: 1,
                location,
                ..
            } => Some(format!("Sent to {location}")),
            Outcome::Delivered {
                injected: true,
                answers,
                location,
                ..
            } => Some(format!("Sent {answers} answers to {location}")),
            Outcome::Recorded { answered, size, .. } => {
                Some(format!("Recorded answer {answered}/{size}"))
            }
            Outcome::Delivered { .. } | Outcome::NoActiveQuestion => None,
        };
        if let Some(confirmation) = confirmation {
            self.feedback(self.gateway.reply_to(message_id, &confirmation));
        }
        Ok(outcome)
    }

    /// Types a freshly resolved answer, or holds it until its batch is
    /// complete.
    fn settle(&self, question: &PendingQuestion, value: &str) -> Outcome {
        let location = &question.terminal_location;
        let Some(slot) = question.batch else {
            let injected = self.injector.deliver(location, value);
            if !injected {
                self.report_failure(question);
            }
            return delivered(question, value.to_string(), 1, injected);
        };

        match self.registry.batch_progress(slot.batch) {
            BatchProgress::Waiting { answered, size } => {
                debug!(question = %question.id, answered, size, "holding batch answer");
                Outcome::Recorded {
                    question: question.id.clone(),
                    answered,
                    size,
                }
            }
            BatchProgress::Complete(answers) => {
                let injected = self.injector.deliver_batch(location, &answers);
                if !injected {
                    self.report_failure(question);
                }
                delivered(question, answers.join("\n"), answers.len(), injected)
            }
            BatchProgress::Closed => {
                warn!(question = %question.id, "batch can no longer be submitted");
                delivered(question, value.to_string(), 1, false)
            }
        }
    }

    fn report_failure(&self, question: &PendingQuestion) {
        warn!(
            question = %question.id,
            location = %question.terminal_location,
            "answer could not be typed into the terminal"
        );
        if self.notify_delivery_failures {
            let notice = format!(
                "Failed to send response to {} - check the tmux session",
                question.terminal_location
            );
            self.feedback(self.gateway.send_notice(&notice));
        }
    }

    fn feedback(&self, result: Result<(), RelayError>) {
        if let Err(err) = result {
            debug!("chat feedback not delivered: {err}");
        }
    }
}

fn stale_text(question: &PendingQuestion) -> &'static str {
    match question.status {
        QuestionStatus::Answered => "Already answered",
        QuestionStatus::Expired | QuestionStatus::Pending => "Question expired",
    }
}

fn delivered(question: &PendingQuestion, text: String, answers: usize, injected: bool) -> Outcome {
    Outcome::Delivered {
        question: question.id.clone(),
        location: question.terminal_location.clone(),
        text,
        answers,
        injected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::dispatch_question;
    use crate::testing::{RecordingGateway, RecordingInjector, Sent, button, plain, reply};
    use crate::{AnswerOption, NewQuestion};
    use chrono::{DateTime, Utc};

    const CHAT: i64 = 4242;

    struct Harness {
        registry: Arc<QuestionRegistry>,
        gateway: Arc<RecordingGateway>,
        injector: Arc<RecordingInjector>,
        engine: CorrelationEngine,
    }

    fn harness_with(injector: RecordingInjector, notify_delivery_failures: bool) -> Harness {
        let registry = Arc::new(QuestionRegistry::default());
        let gateway = Arc::new(RecordingGateway::new());
        let injector = Arc::new(injector);
        let engine = CorrelationEngine::new(
            CHAT,
            registry.clone(),
            gateway.clone(),
            injector.clone(),
            notify_delivery_failures,
        );
        Harness {
            registry,
            gateway,
            injector,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingInjector::new(), false)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    impl Harness {
        fn ask(&self, prompt: &str, options: &[(&str, &str)], location: &str) -> (QuestionId, i64) {
            self.ask_at(prompt, options, location, Utc::now())
        }

        fn ask_at(
            &self,
            prompt: &str,
            options: &[(&str, &str)],
            location: &str,
            created_at: DateTime<Utc>,
        ) -> (QuestionId, i64) {
            let id = self
                .registry
                .register_at(
                    NewQuestion {
                        prompt_text: prompt.to_string(),
                        options: options
                            .iter()
                            .map(|(label, value)| AnswerOption::new(*label, *value))
                            .collect(),
                        terminal_location: location.to_string(),
                        ..NewQuestion::default()
                    },
                    created_at,
                )
                .unwrap();
            dispatch_question(&self.registry, self.gateway.as_ref(), &id, 1, 1);
            let message_id = self.registry.get(&id).unwrap().outbound_message_id.unwrap();
            (id, message_id)
        }
    }

    #[test]
    fn button_tap_resolves_and_types_the_option_value() {
        let h = harness();
        let (id, message_id) = h.ask(
            "Pick DB",
            &[("PostgreSQL", "postgres"), ("SQLite", "sqlite")],
            "main:0.0",
        );

        let outcome = h
            .engine
            .handle(&button(1, CHAT, &ButtonPayload::encode(&id, 1)))
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Delivered {
                question: id.clone(),
                location: "main:0.0".to_string(),
                text: "sqlite".to_string(),
                answers: 1,
                injected: true,
            }
        );
        assert_eq!(h.registry.get(&id).unwrap().status, QuestionStatus::Answered);
        assert_eq!(
            h.injector.deliveries(),
            vec![("main:0.0".to_string(), "sqlite".to_string())]
        );
        assert_eq!(h.gateway.button_answers(), vec!["Sent: SQLite".to_string()]);
        assert!(h.gateway.sent().contains(&Sent::ClearButtons(message_id)));
    }

    #[test]
    fn button_value_round_trips_exactly() {
        let h = harness();
        let (id, _) = h.ask("Choose", &[("A", "a"), ("B", "b")], "dev:1.2");
        h.engine
            .handle(&button(1, CHAT, &ButtonPayload::encode(&id, 1)))
            .unwrap();
        assert_eq!(
            h.injector.deliveries(),
            vec![("dev:1.2".to_string(), "b".to_string())]
        );
    }

    #[test]
    fn second_tap_on_same_question_is_stale() {
        let h = harness();
        let (id, _) = h.ask("Choose", &[("A", "a"), ("B", "b")], "dev:1.2");
        let data = ButtonPayload::encode(&id, 0);

        h.engine.handle(&button(1, CHAT, &data)).unwrap();
        let second = h.engine.handle(&button(2, CHAT, &data));

        assert!(matches!(second, Err(RelayError::UnknownQuestion(_))));
        assert_eq!(h.injector.deliveries().len(), 1);
        assert_eq!(h.gateway.button_answers().last().unwrap(), "Already answered");
    }

    #[test]
    fn tap_on_unknown_question_reports_expiry() {
        let h = harness();
        let result = h.engine.handle(&button(1, CHAT, "ans:q77:0"));
        assert!(matches!(result, Err(RelayError::UnknownQuestion(_))));
        assert_eq!(h.gateway.button_answers(), vec!["Question expired".to_string()]);
        assert!(h.injector.deliveries().is_empty());
    }

    #[test]
    fn malformed_button_data_is_rejected() {
        let h = harness();
        let result = h.engine.handle(&button(1, CHAT, "submit"));
        assert!(matches!(result, Err(RelayError::MalformedReply(_))));
        assert_eq!(h.gateway.button_answers(), vec!["Unknown action".to_string()]);
    }

    #[test]
    fn out_of_range_option_leaves_question_pending() {
        let h = harness();
        let (id, _) = h.ask("Choose", &[("A", "a")], "dev:1.2");
        let result = h.engine.handle(&button(1, CHAT, &ButtonPayload::encode(&id, 9)));
        assert!(matches!(result, Err(RelayError::MalformedReply(_))));
        assert!(h.registry.get(&id).unwrap().is_pending());
    }

    #[test]
    fn reply_to_resolves_the_referenced_question_with_free_text() {
        let h = harness();
        let (older, older_msg) = h.ask_at("First?", &[], "a:0.0", at(0));
        let (newer, _) = h.ask_at("Second?", &[], "b:0.0", at(5));

        h.engine
            .handle(&reply(1, CHAT, older_msg, "use the cache"))
            .unwrap();

        assert_eq!(h.registry.get(&older).unwrap().status, QuestionStatus::Answered);
        assert!(h.registry.get(&newer).unwrap().is_pending());
        assert_eq!(
            h.injector.deliveries(),
            vec![("a:0.0".to_string(), "use the cache".to_string())]
        );
        assert_eq!(h.gateway.replies(), vec!["Sent to a:0.0".to_string()]);
    }

    #[test]
    fn reply_to_expired_question_is_unknown() {
        let h = harness();
        let (id, message_id) = h.ask_at("Old?", &[("A", "a")], "main:0.0", at(0));

        let expired = h.registry.sweep_expired(at(3700), 3600);
        assert_eq!(expired.len(), 1);
        assert_eq!(h.registry.get(&id).unwrap().status, QuestionStatus::Expired);

        let result = h.engine.handle(&reply(1, CHAT, message_id, "a"));
        assert!(matches!(result, Err(RelayError::UnknownQuestion(_))));
        assert!(h.injector.deliveries().is_empty());
        assert_eq!(h.gateway.replies(), vec!["Question expired".to_string()]);
    }

    #[test]
    fn reply_to_untracked_message_falls_back_to_latest_question() {
        let h = harness();
        let (id, _) = h.ask("Continue?", &[], "main:0.0");
        h.engine.handle(&reply(1, CHAT, 5555, "yes")).unwrap();
        assert_eq!(h.registry.get(&id).unwrap().status, QuestionStatus::Answered);
    }

    // Ambiguous plain replies go to the newest question. This is the
    // documented fallback heuristic, not a guarantee of the intended target.
    #[test]
    fn plain_reply_goes_to_most_recent_question_when_several_are_pending() {
        let h = harness();
        let (x, _) = h.ask_at("X?", &[], "x:0.0", at(0));
        let (y, _) = h.ask_at("Y?", &[], "y:0.0", at(5));

        h.engine.handle(&plain(1, CHAT, "go ahead")).unwrap();

        assert!(h.registry.get(&x).unwrap().is_pending());
        assert_eq!(h.registry.get(&y).unwrap().status, QuestionStatus::Answered);
        assert_eq!(
            h.injector.deliveries(),
            vec![("y:0.0".to_string(), "go ahead".to_string())]
        );
    }

    #[test]
    fn plain_reply_without_pending_question_is_reported() {
        let h = harness();
        let outcome = h.engine.handle(&plain(1, CHAT, "hello?")).unwrap();
        assert_eq!(outcome, Outcome::NoActiveQuestion);
        assert_eq!(h.gateway.replies(), vec![NO_ACTIVE_QUESTION.to_string()]);
        assert!(h.injector.deliveries().is_empty());
    }

    #[test]
    fn unauthorized_chat_is_refused_without_touching_questions() {
        let h = harness();
        let (id, message_id) = h.ask("Pick", &[("A", "a")], "main:0.0");

        for event in [
            button(1, 999, &ButtonPayload::encode(&id, 0)),
            reply(2, 999, message_id, "a"),
            plain(3, 999, "a"),
        ] {
            let result = h.engine.handle(&event);
            assert!(matches!(result, Err(RelayError::Unauthorized { chat_id: 999 })));
        }

        assert!(h.registry.get(&id).unwrap().is_pending());
        assert!(h.injector.deliveries().is_empty());
        assert!(h.gateway.replies().is_empty());
        assert_eq!(h.gateway.button_answers(), vec![UNAUTHORIZED.to_string()]);
        let rejected: Vec<Sent> = h
            .gateway
            .sent()
            .into_iter()
            .filter(|s| matches!(s, Sent::Rejected { .. }))
            .collect();
        assert_eq!(
            rejected,
            vec![
                Sent::Rejected {
                    chat_id: 999,
                    text: UNAUTHORIZED.to_string()
                };
                2
            ]
        );
    }

    #[test]
    fn injection_failure_is_not_confirmed_by_default() {
        let h = harness_with(RecordingInjector::broken(), false);
        let (free_text, _) = h.ask_at("Free text?", &[], "gone:0.0", at(0));
        let (pick, _) = h.ask_at("Pick", &[("A", "a")], "gone:0.0", at(5));

        let tapped = h
            .engine
            .handle(&button(1, CHAT, &ButtonPayload::encode(&pick, 0)))
            .unwrap();
        let typed = h.engine.handle(&plain(2, CHAT, "hi")).unwrap();

        assert!(matches!(tapped, Outcome::Delivered { injected: false, .. }));
        assert!(matches!(typed, Outcome::Delivered { injected: false, .. }));
        assert_eq!(h.registry.get(&pick).unwrap().status, QuestionStatus::Answered);
        assert_eq!(h.registry.get(&free_text).unwrap().status, QuestionStatus::Answered);
        assert!(h.gateway.notices().is_empty());
        assert!(h.gateway.replies().is_empty());
        assert_eq!(h.gateway.button_answers(), vec!["Answer recorded".to_string()]);
    }

    #[test]
    fn injection_failure_notice_when_enabled() {
        let h = harness_with(RecordingInjector::broken(), true);
        let (pick, _) = h.ask("Pick", &[("A", "a")], "gone:0.0");
        h.engine
            .handle(&button(1, CHAT, &ButtonPayload::encode(&pick, 0)))
            .unwrap();
        h.ask("Free text?", &[], "gone:0.0");
        h.engine.handle(&plain(2, CHAT, "hi")).unwrap();

        assert_eq!(h.gateway.notices().len(), 2);
        assert!(h.gateway.notices()[0].contains("gone:0.0"));
        assert!(h.gateway.replies().is_empty());
        assert_eq!(
            h.gateway.button_answers(),
            vec!["Failed to send - check tmux".to_string()]
        );
    }

    #[test]
    fn batch_answers_are_typed_in_question_order_once_all_arrive() {
        let h = harness();
        let ids = h
            .registry
            .register_batch(vec![
                NewQuestion {
                    prompt_text: "Pick DB".to_string(),
                    options: vec![AnswerOption::new("A", "a"), AnswerOption::new("B", "b")],
                    terminal_location: "main:0.0".to_string(),
                    ..NewQuestion::default()
                },
                NewQuestion {
                    prompt_text: "Notes?".to_string(),
                    terminal_location: "main:0.0".to_string(),
                    ..NewQuestion::default()
                },
            ])
            .unwrap();
        for (idx, id) in ids.iter().enumerate() {
            dispatch_question(&h.registry, h.gateway.as_ref(), id, idx + 1, ids.len());
        }
        let second_msg = h.registry.get(&ids[1]).unwrap().outbound_message_id.unwrap();

        let first = h.engine.handle(&reply(1, CHAT, second_msg, "keep it small")).unwrap();
        assert_eq!(
            first,
            Outcome::Recorded {
                question: ids[1].clone(),
                answered: 1,
                size: 2,
            }
        );
        assert!(h.injector.batches().is_empty());
        assert_eq!(h.gateway.replies(), vec!["Recorded answer 1/2".to_string()]);

        let second = h
            .engine
            .handle(&button(2, CHAT, &ButtonPayload::encode(&ids[0], 1)))
            .unwrap();
        assert!(matches!(
            second,
            Outcome::Delivered {
                answers: 2,
                injected: true,
                ..
            }
        ));
        assert_eq!(
            h.injector.batches(),
            vec![(
                "main:0.0".to_string(),
                vec!["b".to_string(), "keep it small".to_string()]
            )]
        );
        assert!(h.injector.deliveries().is_empty());
        assert_eq!(h.gateway.button_answers(), vec!["Sent 2 answers".to_string()]);
    }
}
