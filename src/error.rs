use thiserror::Error;

use crate::QuestionId;

/// Failures raised while relaying questions and replies.
///
/// None of these are fatal to the daemon: the poll loop and the ingress
/// handler log them per event and move on.
#[derive(Debug, Error)]
pub(crate) enum RelayError {
    #[error("event from unauthorized chat {chat_id}")]
    Unauthorized { chat_id: i64 },

    #[error("question {0} is not pending")]
    UnknownQuestion(QuestionId),

    #[error("question {0} was already resolved")]
    AlreadyResolved(QuestionId),

    #[error("delivery to messaging service failed: {0}")]
    Delivery(String),

    #[error("no registry entry for {0}")]
    NotFound(String),

    #[error("too many outstanding questions (limit {limit})")]
    Capacity { limit: usize },

    #[error("malformed reply: {0}")]
    MalformedReply(String),
}

impl RelayError {
    pub(crate) fn http_status(code: u16, body: &str) -> Self {
        let body: String = body.chars().take(200).collect();
        RelayError::Delivery(format!("HTTP {code}: {body}"))
    }
}

impl From<ureq::Error> for RelayError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, response) => {
                RelayError::http_status(code, &response.into_string().unwrap_or_default())
            }
            ureq::Error::Transport(transport) => RelayError::Delivery(transport.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("{0}")]
    Inconsistent(String),

    #[error("config file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
