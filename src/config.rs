use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::bridges::telegram::DEFAULT_API_BASE;
use crate::registry::{DEFAULT_MAX_PENDING, DEFAULT_RETENTION_SECS};
use crate::{ConfigError, ServeArgs};

pub(crate) const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_HTTP_PORT: u16 = 8642;
pub(crate) const DEFAULT_QUESTION_TIMEOUT_SECS: u64 = 3600;
pub(crate) const DEFAULT_POLL_TIMEOUT_SECS: u64 = 25;
pub(crate) const DEFAULT_POLL_LIMIT: usize = 50;
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub(crate) const DEFAULT_SEND_TIMEOUT_SECS: u64 = 5;
const MAX_POLL_TIMEOUT_SECS: u64 = 50;

/// Optional JSON config file. Every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct FileConfig {
    pub(crate) bot_token: Option<String>,
    pub(crate) chat_id: Option<i64>,
    pub(crate) http_host: Option<String>,
    pub(crate) http_port: Option<u16>,
    pub(crate) question_timeout_seconds: Option<u64>,
    pub(crate) poll_timeout_seconds: Option<u64>,
    pub(crate) poll_limit: Option<usize>,
    pub(crate) sweep_interval_seconds: Option<u64>,
    pub(crate) retention_seconds: Option<u64>,
    pub(crate) max_pending: Option<usize>,
    pub(crate) send_timeout_seconds: Option<u64>,
    pub(crate) notify_delivery_failures: Option<bool>,
    pub(crate) api_base: Option<String>,
    pub(crate) tmux_program: Option<String>,
}

pub(crate) fn env_optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// A missing file means defaults; any other read failure is an error.
pub(crate) fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(data) => serde_json::from_str(&data).map_err(|source| ConfigError::File {
            path: path.display().to_string(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

fn redact<S: Serializer>(token: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&token_hint(token))
}

/// First few characters of the bot token, safe to log.
pub(crate) fn token_hint(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{prefix}...")
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RelayConfig {
    #[serde(serialize_with = "redact")]
    pub(crate) bot_token: String,
    pub(crate) chat_id: i64,
    pub(crate) http_host: String,
    pub(crate) http_port: u16,
    pub(crate) question_timeout_secs: u64,
    pub(crate) poll_timeout_secs: u64,
    pub(crate) poll_limit: usize,
    pub(crate) sweep_interval_secs: u64,
    pub(crate) retention_secs: u64,
    pub(crate) max_pending: usize,
    pub(crate) send_timeout_secs: u64,
    pub(crate) notify_delivery_failures: bool,
    pub(crate) api_base: String,
    pub(crate) tmux_program: String,
}

impl RelayConfig {
    pub(crate) fn bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub(crate) fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub(crate) fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(None),
    }
}

/// Resolves CLI flags, then environment, then the config file, then defaults.
pub(crate) fn resolve_config(
    args: &ServeArgs,
    env: impl Fn(&str) -> Option<String>,
    file: FileConfig,
) -> Result<RelayConfig, ConfigError> {
    let bot_token = args
        .token
        .clone()
        .or_else(|| env("TELEGRAM_BOT_TOKEN"))
        .or(file.bot_token)
        .filter(|t| !t.trim().is_empty())
        .ok_or(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;

    let chat_id = match args.chat_id {
        Some(id) => id,
        None => parse_env::<i64>(&env, "TELEGRAM_CHAT_ID")?
            .or(file.chat_id)
            .ok_or(ConfigError::Missing("TELEGRAM_CHAT_ID"))?,
    };
    if chat_id == 0 {
        return Err(ConfigError::Invalid {
            name: "TELEGRAM_CHAT_ID",
            value: "0".to_string(),
        });
    }

    let http_host = args
        .host
        .clone()
        .or_else(|| env("HTTP_HOST"))
        .or(file.http_host)
        .unwrap_or_else(|| DEFAULT_HTTP_HOST.to_string());
    let http_port = match args.port {
        Some(port) => port,
        None => parse_env::<u16>(&env, "HTTP_PORT")?
            .or(file.http_port)
            .unwrap_or(DEFAULT_HTTP_PORT),
    };
    let question_timeout_secs = match args.question_timeout {
        Some(secs) => secs,
        None => parse_env::<u64>(&env, "QUESTION_TIMEOUT_SECONDS")?
            .or(file.question_timeout_seconds)
            .unwrap_or(DEFAULT_QUESTION_TIMEOUT_SECS),
    };
    let poll_timeout_secs = match args.poll_timeout {
        Some(secs) => secs,
        None => parse_env::<u64>(&env, "POLL_TIMEOUT_SECONDS")?
            .or(file.poll_timeout_seconds)
            .unwrap_or(DEFAULT_POLL_TIMEOUT_SECS),
    };
    let api_base = env("TELEGRAM_API_BASE")
        .or(file.api_base)
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

    let config = RelayConfig {
        bot_token,
        chat_id,
        http_host,
        http_port,
        question_timeout_secs,
        poll_timeout_secs,
        poll_limit: args.poll_limit.or(file.poll_limit).unwrap_or(DEFAULT_POLL_LIMIT),
        sweep_interval_secs: args
            .sweep_interval
            .or(file.sweep_interval_seconds)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        retention_secs: args
            .retention
            .or(file.retention_seconds)
            .unwrap_or(DEFAULT_RETENTION_SECS),
        max_pending: args.max_pending.or(file.max_pending).unwrap_or(DEFAULT_MAX_PENDING),
        send_timeout_secs: args
            .send_timeout
            .or(file.send_timeout_seconds)
            .unwrap_or(DEFAULT_SEND_TIMEOUT_SECS),
        notify_delivery_failures: args.notify_delivery_failures
            || file.notify_delivery_failures.unwrap_or(false),
        api_base,
        tmux_program: file.tmux_program.unwrap_or_else(|| "tmux".to_string()),
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &RelayConfig) -> Result<(), ConfigError> {
    if config.question_timeout_secs == 0 {
        return Err(ConfigError::Invalid {
            name: "QUESTION_TIMEOUT_SECONDS",
            value: "0".to_string(),
        });
    }
    if config.sweep_interval_secs == 0 || config.sweep_interval_secs >= config.question_timeout_secs {
        return Err(ConfigError::Inconsistent(format!(
            "sweep interval ({}s) must be positive and smaller than the question timeout ({}s)",
            config.sweep_interval_secs, config.question_timeout_secs
        )));
    }
    if config.poll_timeout_secs > MAX_POLL_TIMEOUT_SECS {
        return Err(ConfigError::Invalid {
            name: "POLL_TIMEOUT_SECONDS",
            value: config.poll_timeout_secs.to_string(),
        });
    }
    if config.poll_limit == 0 || config.poll_limit > 100 {
        return Err(ConfigError::Invalid {
            name: "poll-limit",
            value: config.poll_limit.to_string(),
        });
    }
    if config.send_timeout_secs == 0 {
        return Err(ConfigError::Invalid {
            name: "send-timeout",
            value: "0".to_string(),
        });
    }
    Ok(())
}
