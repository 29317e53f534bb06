//! Loopback HTTP endpoint the agent hooks post to.
//!
//! The accept loop only hands each connection to a short-lived worker
//! thread. The worker reads the body, responds to the hook, and only then
//! sends anything to the chat, so a slow client or chat API never stalls
//! other hooks.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tiny_http::{Method, Request, Response, Server};
use tracing::{debug, error, info, warn};

use crate::bridges::{MessagingGateway, dispatch_question, stop_notice_text};
use crate::{AnswerOption, NewQuestion, QuestionId, QuestionRegistry, RelayError, StopEvent};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const ACCEPT_POLL: Duration = Duration::from_millis(500);
const UNKNOWN_LOCATION: &str = "unknown";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NotifyRequest {
    tmux_location: Option<String>,
    session_id: Option<String>,
    cwd: Option<String>,
    tool_input: Option<ToolInput>,
    questions: Option<Vec<HookQuestion>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ToolInput {
    questions: Vec<HookQuestion>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HookQuestion {
    question: String,
    header: Option<String>,
    options: Vec<HookOption>,
    #[serde(rename = "multiSelect")]
    multi_select: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HookOption {
    label: String,
    description: Option<String>,
    value: Option<String>,
}

impl From<HookOption> for AnswerOption {
    fn from(option: HookOption) -> Self {
        let value = option
            .value
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| option.label.clone());
        AnswerOption {
            label: option.label,
            value,
            description: option.description.filter(|d| !d.trim().is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    #[serde(default)]
    tmux_location: Option<String>,
    #[serde(default = "default_stop_reason")]
    stop_reason: String,
    #[serde(default)]
    cwd: Option<String>,
}

fn default_stop_reason() -> String {
    "completed".to_string()
}

fn location_or_unknown(location: Option<String>) -> String {
    location
        .map(|loc| loc.trim().to_string())
        .filter(|loc| !loc.is_empty())
        .unwrap_or_else(|| UNKNOWN_LOCATION.to_string())
}

/// Work left over once the HTTP response is decided.
#[derive(Debug)]
enum Job {
    Questions(Vec<QuestionId>),
    Stop(StopEvent),
}

#[derive(Debug)]
struct Reply {
    status: u16,
    body: Value,
    job: Option<Job>,
}

impl Reply {
    fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            job: None,
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::new(status, json!({ "error": message }))
    }
}

pub(crate) struct IngressServer {
    server: Server,
    handler: Handler,
}

/// Per-request work: everything after accept runs on a worker thread.
#[derive(Clone)]
struct Handler {
    registry: Arc<QuestionRegistry>,
    gateway: Arc<dyn MessagingGateway>,
}

impl IngressServer {
    pub(crate) fn bind(
        addr: &str,
        registry: Arc<QuestionRegistry>,
        gateway: Arc<dyn MessagingGateway>,
    ) -> io::Result<Self> {
        let server = Server::http(addr).map_err(|err| io::Error::other(format!("bind {addr}: {err}")))?;
        Ok(Self {
            server,
            handler: Handler { registry, gateway },
        })
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    /// Serves until `shutdown` is raised.
    pub(crate) fn run(self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::SeqCst) {
            match self.server.recv_timeout(ACCEPT_POLL) {
                Ok(Some(request)) => self.spawn_worker(request),
                Ok(None) => {}
                Err(err) => {
                    error!("ingress accept failed: {err}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        debug!("ingress stopped");
    }

    fn spawn_worker(&self, request: Request) {
        let handler = self.handler.clone();
        let spawned = thread::Builder::new()
            .name("askrelay-request".to_string())
            .spawn(move || handler.handle(request));
        if let Err(err) = spawned {
            error!("could not start request thread: {err}");
        }
    }
}

impl Handler {
    /// Responds first, then runs any outbound job on the same thread.
    fn handle(&self, mut request: Request) {
        if request
            .remote_addr()
            .is_some_and(|peer| !peer.ip().is_loopback())
        {
            warn!(peer = ?request.remote_addr(), "rejecting non-loopback request");
            respond_json(request, Reply::error(403, "forbidden"));
            return;
        }

        let method = request.method().clone();
        let path = request
            .url()
            .split('?')
            .next()
            .unwrap_or("/")
            .to_string();

        let body = if method == Method::Post {
            match read_request_body(&mut request) {
                Ok(body) => body,
                Err(reply) => {
                    respond_json(request, reply);
                    return;
                }
            }
        } else {
            String::new()
        };

        let mut reply = self.route(&method, &path, &body);
        let job = reply.job.take();
        respond_json(request, reply);
        if let Some(job) = job {
            run_job(&self.registry, self.gateway.as_ref(), job);
        }
    }

    fn route(&self, method: &Method, path: &str, body: &str) -> Reply {
        match (method, path) {
            (Method::Get, "/health") => Reply::new(
                200,
                json!({ "status": "ok", "pending": self.registry.pending_count() }),
            ),
            (Method::Post, "/stop") => handle_stop(body),
            (Method::Post, _) => handle_notify(&self.registry, body),
            _ => Reply::error(405, "method_not_allowed"),
        }
    }
}

fn run_job(registry: &QuestionRegistry, gateway: &dyn MessagingGateway, job: Job) {
    match job {
        Job::Questions(ids) => {
            let total = ids.len();
            for (index, id) in ids.iter().enumerate() {
                dispatch_question(registry, gateway, id, index + 1, total);
            }
        }
        Job::Stop(event) => {
            if let Err(err) = gateway.send_notice(&stop_notice_text(&event)) {
                warn!(location = %event.terminal_location, "failed to send stop notice: {err}");
            }
        }
    }
}

/// Registers every question in the hook payload as one batch.
///
/// Registration is all-or-nothing: if the batch does not fit under the
/// pending limit nothing is registered and the hook gets a 503.
fn handle_notify(registry: &QuestionRegistry, body: &str) -> Reply {
    let request: NotifyRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(err) => {
            debug!("rejecting notify payload: {err}");
            return Reply::error(400, "invalid_json");
        }
    };

    let questions = request
        .tool_input
        .map(|input| input.questions)
        .filter(|questions| !questions.is_empty())
        .or(request.questions)
        .unwrap_or_default();
    if questions.is_empty() {
        return Reply::error(400, "no_questions");
    }

    let location = location_or_unknown(request.tmux_location);
    let batch = questions
        .into_iter()
        .map(|hook| NewQuestion {
            prompt_text: hook.question,
            header: hook.header.filter(|h| !h.trim().is_empty()),
            options: hook.options.into_iter().map(AnswerOption::from).collect(),
            multi_select: hook.multi_select,
            terminal_location: location.clone(),
            session_id: request.session_id.clone(),
            cwd: request.cwd.clone(),
        })
        .collect();

    match registry.register_batch(batch) {
        Ok(ids) => Reply {
            job: Some(Job::Questions(ids.clone())),
            ..Reply::new(200, json!({ "status": "accepted", "question_ids": ids }))
        },
        Err(err @ RelayError::Capacity { .. }) => {
            warn!(location = %location, "{err}");
            Reply::error(503, "capacity")
        }
        Err(err) => {
            error!("failed to register questions: {err}");
            Reply::error(500, "register_failed")
        }
    }
}

fn handle_stop(body: &str) -> Reply {
    let request: StopRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(err) => {
            debug!("rejecting stop payload: {err}");
            return Reply::error(400, "invalid_json");
        }
    };
    let event = StopEvent {
        terminal_location: location_or_unknown(request.tmux_location),
        stop_reason: request.stop_reason,
        cwd: request.cwd.filter(|cwd| !cwd.is_empty()),
    };
    info!(location = %event.terminal_location, reason = %event.stop_reason, "agent stopped");
    Reply {
        job: Some(Job::Stop(event)),
        ..Reply::new(200, json!({ "status": "accepted" }))
    }
}

fn json_content_type() -> tiny_http::Header {
    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("static header is valid")
}

fn read_request_body(request: &mut Request) -> Result<String, Reply> {
    let mut body = String::new();
    let mut reader = request.as_reader().take((MAX_BODY_BYTES + 1) as u64);
    if let Err(err) = reader.read_to_string(&mut body) {
        warn!("failed to read request body: {err}");
        return Err(Reply::error(400, "bad_request"));
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(Reply::error(413, "payload_too_large"));
    }
    Ok(body)
}

fn respond_json(request: Request, reply: Reply) {
    let body = serde_json::to_string(&reply.body)
        .unwrap_or_else(|_| "{\"error\":\"serialize\"}".to_string());
    let response = Response::from_string(body)
        .with_status_code(reply.status)
        .with_header(json_content_type());
    if let Err(err) = request.respond(response) {
        debug!("failed to write response: {err}");
    }
}
