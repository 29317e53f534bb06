pub(crate) mod telegram;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{error, info, warn};

use crate::{
    CorrelationEngine, IngressServer, PendingQuestion, QuestionId, QuestionRegistry, RelayConfig,
    RelayError, ReplyPoller, StopEvent, TmuxInjector, token_hint,
};
use self::telegram::TelegramGateway;

/// A question as it is rendered into one chat message.
#[derive(Debug, Clone)]
pub(crate) struct QuestionMessage {
    pub(crate) question: PendingQuestion,
    /// 1-based position within the hook event that raised it.
    pub(crate) position: usize,
    pub(crate) total: usize,
}

/// Outbound side of the chat service. Implementations are bound to the
/// single authorized chat at construction.
pub(crate) trait MessagingGateway: Send + Sync {
    /// Returns the remote message id used to match reply-to references.
    fn send_question(&self, message: &QuestionMessage) -> Result<i64, RelayError>;
    fn send_notice(&self, text: &str) -> Result<(), RelayError>;
    fn reply_to(&self, message_id: i64, text: &str) -> Result<(), RelayError>;
    fn answer_button(&self, callback_id: &str, text: &str) -> Result<(), RelayError>;
    fn clear_buttons(&self, message_id: i64) -> Result<(), RelayError>;
    /// Answers a message from a chat other than the authorized one.
    fn reject_chat(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), RelayError>;
}

#[derive(Debug, Default)]
pub(crate) struct UpdateBatch {
    pub(crate) events: Vec<crate::InboundEvent>,
    /// Cursor for the next poll; never behind the cursor that was passed in.
    pub(crate) next_cursor: Option<i64>,
}

/// Pull interface for inbound chat events.
pub(crate) trait UpdateSource {
    fn poll_updates(&self, cursor: Option<i64>) -> Result<UpdateBatch, RelayError>;
}

pub(crate) fn stop_notice_text(event: &StopEvent) -> String {
    let mut lines = vec![
        "*Agent is waiting for input*".to_string(),
        format!("_Reason: {}_", event.stop_reason),
        format!("_Pane: {}_", event.terminal_location),
    ];
    if let Some(project) = event
        .cwd
        .as_deref()
        .map(|cwd| cwd.trim_end_matches('/'))
        .and_then(|cwd| cwd.rsplit('/').next())
        .filter(|name| !name.is_empty())
    {
        lines.push(format!("_Project: {project}_"));
    }
    lines.join("\n")
}

pub(crate) fn expired_notice_text(question: &PendingQuestion) -> String {
    format!(
        "Question expired without an answer: {} ({})",
        question.prompt_text.trim(),
        question.terminal_location
    )
}

/// Sends one question and records its message id. Failures are logged and
/// leave the question pending without a message id.
pub(crate) fn dispatch_question(
    registry: &QuestionRegistry,
    gateway: &dyn MessagingGateway,
    id: &QuestionId,
    position: usize,
    total: usize,
) {
    let Some(question) = registry.get(id) else {
        error!(question = %id, "dispatch for unregistered question");
        return;
    };
    let message = QuestionMessage {
        question,
        position,
        total,
    };
    match gateway.send_question(&message) {
        Ok(message_id) => {
            if let Err(err) = registry.attach_outbound_message(id, message_id) {
                error!(question = %id, "could not attach message {message_id}: {err}");
            }
        }
        Err(err) => warn!(question = %id, "failed to send question: {err}"),
    }
}

pub(crate) fn run_relay(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "starting relay: token {}, authorized chat {}",
        token_hint(&config.bot_token),
        config.chat_id
    );

    let gateway = Arc::new(TelegramGateway::new(
        &config.api_base,
        &config.bot_token,
        config.chat_id,
        config.send_timeout(),
        config.poll_timeout_secs,
        config.poll_limit,
    ));
    match gateway.identify() {
        Ok(name) => info!("connected to Telegram as @{name}"),
        Err(err) => warn!("could not verify bot token: {err}"),
    }

    let registry = Arc::new(QuestionRegistry::new(config.max_pending, config.retention_secs));
    let injector = Arc::new(TmuxInjector::with_program(config.tmux_program.clone()));
    let engine = CorrelationEngine::new(
        config.chat_id,
        registry.clone(),
        gateway.clone(),
        injector,
        config.notify_delivery_failures,
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let server = IngressServer::bind(&config.bind_addr(), registry.clone(), gateway.clone())?;
    match server.local_addr() {
        Some(addr) => info!("ingress listening on http://{addr}"),
        None => info!("ingress listening on {}", config.bind_addr()),
    }
    let ingress_shutdown = shutdown.clone();
    let ingress = thread::spawn(move || server.run(&ingress_shutdown));

    let mut poller = ReplyPoller::new(
        gateway.as_ref(),
        engine,
        registry,
        gateway.clone(),
        config.question_timeout_secs,
        config.sweep_interval(),
    );
    poller.run(&shutdown);

    shutdown.store(true, Ordering::SeqCst);
    if ingress.join().is_err() {
        error!("ingress thread panicked");
    }
    info!("relay stopped");
    Ok(())
}
