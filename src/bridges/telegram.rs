use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::bridges::{MessagingGateway, QuestionMessage, UpdateBatch, UpdateSource};
use crate::{ButtonPayload, InboundEvent, InboundKind, PendingQuestion, RelayError};

pub(crate) const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const MAX_MESSAGE_CHARS: usize = 3900;
const MAX_BUTTON_CHARS: usize = 40;
const POLL_GRACE_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramUpdateResponse {
    pub(crate) ok: bool,
    #[serde(default)]
    pub(crate) result: Vec<TelegramUpdate>,
    #[serde(default)]
    pub(crate) description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramUpdate {
    pub(crate) update_id: i64,
    #[serde(default)]
    pub(crate) message: Option<TelegramMessage>,
    #[serde(default)]
    pub(crate) callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramUser {
    pub(crate) id: i64,
    #[serde(default)]
    pub(crate) username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramCallbackQuery {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) from: Option<TelegramUser>,
    #[serde(default)]
    pub(crate) message: Option<Box<TelegramMessage>>,
    #[serde(default)]
    pub(crate) data: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramMessage {
    pub(crate) chat: TelegramChat,
    #[serde(default)]
    pub(crate) message_id: Option<i64>,
    #[serde(default)]
    pub(crate) text: Option<String>,
    #[serde(default)]
    pub(crate) caption: Option<String>,
    #[serde(default)]
    pub(crate) reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramChat {
    pub(crate) id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Markdown body for a question message.
pub(crate) fn render_question(message: &QuestionMessage) -> String {
    let question = &message.question;
    let mut lines = vec!["*Agent needs input*".to_string()];
    if let Some(project) = question.project_name() {
        lines.push(format!("_Project: {project}_"));
    }
    lines.push(format!("_Pane: {}_", question.terminal_location));
    lines.push(String::new());

    let numbering = if message.total > 1 {
        format!("Q{}/{}: ", message.position, message.total)
    } else {
        String::new()
    };
    let header = question
        .header
        .as_deref()
        .filter(|h| !h.trim().is_empty())
        .map(|h| format!("[{h}] "))
        .unwrap_or_default();
    lines.push(format!("*{numbering}{header}{}*", question.prompt_text.trim()));

    for (idx, option) in question.options.iter().enumerate() {
        match option.description.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(description) => lines.push(format!("  {}. {} - {description}", idx + 1, option.label)),
            None => lines.push(format!("  {}. {}", idx + 1, option.label)),
        }
    }
    if question.multi_select {
        lines.push("  _(Multiple selections allowed)_".to_string());
    }

    lines.push(String::new());
    if question.options.is_empty() {
        lines.push("_Reply to this message with your answer_".to_string());
    } else {
        lines.push("_Reply to this message or tap a button_".to_string());
    }
    truncate_chars(&lines.join("\n"), MAX_MESSAGE_CHARS)
}

/// One quick-reply button per option, one option per row.
pub(crate) fn inline_keyboard(question: &PendingQuestion) -> Option<Value> {
    if question.options.is_empty() {
        return None;
    }
    let rows: Vec<Value> = question
        .options
        .iter()
        .enumerate()
        .map(|(idx, option)| {
            json!([{
                "text": truncate_chars(&option.label, MAX_BUTTON_CHARS),
                "callback_data": ButtonPayload::encode(&question.id, idx),
            }])
        })
        .collect();
    Some(json!({ "inline_keyboard": rows }))
}

/// Converts a raw update into an inbound event. Updates carrying nothing the
/// relay understands (stickers, photos, empty callbacks) yield `None`.
pub(crate) fn parse_update(update: &TelegramUpdate) -> Option<InboundEvent> {
    if let Some(cb) = &update.callback_query {
        let data = cb.data.clone()?;
        let chat_id = cb
            .message
            .as_ref()
            .map(|m| m.chat.id)
            .or_else(|| cb.from.as_ref().map(|u| u.id))?;
        return Some(InboundEvent {
            update_id: update.update_id,
            chat_id,
            kind: InboundKind::Button {
                callback_id: cb.id.clone(),
                message_id: cb.message.as_ref().and_then(|m| m.message_id),
                data,
            },
        });
    }

    let msg = update.message.as_ref()?;
    let text = msg
        .text
        .as_deref()
        .or(msg.caption.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())?
        .to_string();
    let message_id = msg.message_id?;
    let kind = match msg.reply_to_message.as_ref().and_then(|r| r.message_id) {
        Some(reply_to) => InboundKind::Reply {
            message_id,
            reply_to,
            text,
        },
        None => InboundKind::Plain { message_id, text },
    };
    Some(InboundEvent {
        update_id: update.update_id,
        chat_id: msg.chat.id,
        kind,
    })
}

/// Telegram Bot API client bound to the single authorized chat.
pub(crate) struct TelegramGateway {
    agent: ureq::Agent,
    poll_agent: ureq::Agent,
    base_url: String,
    chat_id: i64,
    poll_timeout: u64,
    poll_limit: usize,
}

impl TelegramGateway {
    pub(crate) fn new(
        api_base: &str,
        token: &str,
        chat_id: i64,
        send_timeout: Duration,
        poll_timeout: u64,
        poll_limit: usize,
    ) -> Self {
        let base_url = format!("{}/bot{token}", api_base.trim_end_matches('/'));
        let agent = ureq::AgentBuilder::new().timeout(send_timeout).build();
        let poll_agent = ureq::AgentBuilder::new()
            .timeout_connect(send_timeout)
            .timeout_read(Duration::from_secs(poll_timeout + POLL_GRACE_SECS))
            .build();
        Self {
            agent,
            poll_agent,
            base_url,
            chat_id,
            poll_timeout,
            poll_limit,
        }
    }

    fn post(&self, method: &str, payload: Value) -> Result<ureq::Response, ureq::Error> {
        self.agent
            .post(&format!("{}/{method}", self.base_url))
            .set("content-type", "application/json")
            .send_json(payload)
    }

    fn call<T: for<'de> Deserialize<'de>>(&self, method: &str, payload: Value) -> Result<T, RelayError> {
        let response = self.post(method, payload)?;
        decode_result(method, response)
    }

    /// Sends with Markdown first. Agent prompts often carry unbalanced `_` or
    /// `*`, so a 400 "can't parse entities" is retried once as plain text;
    /// every other failure is returned as is, since the first attempt may
    /// already have been delivered.
    fn send_message_to(
        &self,
        chat_id: i64,
        text: &str,
        reply_markup: Option<&Value>,
        reply_to: Option<i64>,
    ) -> Result<TelegramMessage, RelayError> {
        let text = truncate_chars(text, MAX_MESSAGE_CHARS);
        let build = |markdown: bool| {
            let mut payload = json!({
                "chat_id": chat_id,
                "text": text,
            });
            if markdown {
                payload["parse_mode"] = json!("Markdown");
            }
            if let Some(markup) = reply_markup {
                payload["reply_markup"] = markup.clone();
            }
            if let Some(mid) = reply_to {
                payload["reply_to_message_id"] = json!(mid);
                payload["allow_sending_without_reply"] = json!(true);
            }
            payload
        };
        match self.post("sendMessage", build(true)) {
            Ok(response) => decode_result("sendMessage", response),
            Err(ureq::Error::Status(400, response)) => {
                let body = response.into_string().unwrap_or_default();
                if !rejects_markup(&body) {
                    return Err(RelayError::http_status(400, &body));
                }
                debug!("markdown rejected, retrying as plain text");
                self.call("sendMessage", build(false))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn send_message_ext(
        &self,
        text: &str,
        reply_markup: Option<&Value>,
        reply_to: Option<i64>,
    ) -> Result<TelegramMessage, RelayError> {
        self.send_message_to(self.chat_id, text, reply_markup, reply_to)
    }

    /// Bot username, used to check the credential at startup.
    pub(crate) fn identify(&self) -> Result<String, RelayError> {
        let me: TelegramUser = self.call("getMe", json!({}))?;
        Ok(me.username.unwrap_or_else(|| me.id.to_string()))
    }
}

impl MessagingGateway for TelegramGateway {
    fn send_question(&self, message: &QuestionMessage) -> Result<i64, RelayError> {
        let text = render_question(message);
        let markup = inline_keyboard(&message.question);
        let sent = self.send_message_ext(&text, markup.as_ref(), None)?;
        sent.message_id
            .ok_or_else(|| RelayError::Delivery("sendMessage returned no message_id".to_string()))
    }

    fn send_notice(&self, text: &str) -> Result<(), RelayError> {
        self.send_message_ext(text, None, None).map(|_| ())
    }

    fn reply_to(&self, message_id: i64, text: &str) -> Result<(), RelayError> {
        self.send_message_ext(text, None, Some(message_id)).map(|_| ())
    }

    fn answer_button(&self, callback_id: &str, text: &str) -> Result<(), RelayError> {
        let payload = json!({
            "callback_query_id": callback_id,
            "text": truncate_chars(text, 200),
        });
        self.call::<bool>("answerCallbackQuery", payload).map(|_| ())
    }

    fn clear_buttons(&self, message_id: i64) -> Result<(), RelayError> {
        let payload = json!({
            "chat_id": self.chat_id,
            "message_id": message_id,
            "reply_markup": { "inline_keyboard": [] },
        });
        self.call::<Value>("editMessageReplyMarkup", payload).map(|_| ())
    }

    fn reject_chat(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), RelayError> {
        self.send_message_to(chat_id, text, None, Some(message_id)).map(|_| ())
    }
}

impl UpdateSource for TelegramGateway {
    fn poll_updates(&self, cursor: Option<i64>) -> Result<UpdateBatch, RelayError> {
        let mut request = self
            .poll_agent
            .get(&format!("{}/getUpdates", self.base_url))
            .query("limit", &self.poll_limit.to_string())
            .query("timeout", &self.poll_timeout.to_string())
            .query("allowed_updates", r#"["message","callback_query"]"#);
        if let Some(offset) = cursor {
            request = request.query("offset", &offset.to_string());
        }

        let payload: TelegramUpdateResponse = request
            .call()?
            .into_json()
            .map_err(|e| RelayError::Delivery(format!("getUpdates decode: {e}")))?;
        if !payload.ok {
            let reason = payload.description.unwrap_or_else(|| "ok=false".to_string());
            return Err(RelayError::Delivery(format!("getUpdates: {reason}")));
        }
        Ok(batch_from_updates(payload.result, cursor))
    }
}

fn decode_result<T: for<'de> Deserialize<'de>>(
    method: &str,
    response: ureq::Response,
) -> Result<T, RelayError> {
    let response: TelegramApiResponse<T> = response
        .into_json()
        .map_err(|e| RelayError::Delivery(format!("{method} decode: {e}")))?;
    if !response.ok {
        let reason = response.description.unwrap_or_else(|| "ok=false".to_string());
        return Err(RelayError::Delivery(format!("{method}: {reason}")));
    }
    response
        .result
        .ok_or_else(|| RelayError::Delivery(format!("{method}: empty result")))
}

/// True when a 400 body says the Markdown could not be parsed.
fn rejects_markup(body: &str) -> bool {
    serde_json::from_str::<TelegramApiResponse<Value>>(body)
        .ok()
        .and_then(|response| response.description)
        .is_some_and(|description| description.to_lowercase().contains("parse entities"))
}

pub(crate) fn batch_from_updates(updates: Vec<TelegramUpdate>, cursor: Option<i64>) -> UpdateBatch {
    let mut next_cursor = cursor;
    let mut events = Vec::new();
    for update in &updates {
        let candidate = update.update_id + 1;
        if next_cursor.is_none_or(|current| candidate > current) {
            next_cursor = Some(candidate);
        }
        match parse_update(update) {
            Some(event) => events.push(event),
            None => warn!(update_id = update.update_id, "ignoring unsupported update"),
        }
    }
    UpdateBatch {
        events,
        next_cursor,
    }
}
