use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "askrelay")]
#[command(about = "Relay coding-agent questions to Telegram and type the answers back into tmux", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the relay daemon (HTTP ingress + Telegram long-polling).
    Serve(ServeArgs),

    /// Print the resolved configuration with the bot token redacted.
    Config(ServeArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub(crate) struct ServeArgs {
    /// JSON config file; flags and environment override its values
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
    /// Telegram bot token (env: TELEGRAM_BOT_TOKEN)
    #[arg(long)]
    pub(crate) token: Option<String>,
    /// The only chat allowed to answer (env: TELEGRAM_CHAT_ID)
    #[arg(long, allow_negative_numbers = true)]
    pub(crate) chat_id: Option<i64>,
    /// Ingress bind host (env: HTTP_HOST)
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Ingress bind port (env: HTTP_PORT)
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Seconds before an unanswered question expires (env: QUESTION_TIMEOUT_SECONDS)
    #[arg(long)]
    pub(crate) question_timeout: Option<u64>,
    /// Long-poll timeout in seconds (env: POLL_TIMEOUT_SECONDS)
    #[arg(long)]
    pub(crate) poll_timeout: Option<u64>,
    /// Max updates per poll
    #[arg(long)]
    pub(crate) poll_limit: Option<usize>,
    /// Seconds between expiry sweeps
    #[arg(long)]
    pub(crate) sweep_interval: Option<u64>,
    /// Seconds to remember answered/expired questions for duplicate replies
    #[arg(long)]
    pub(crate) retention: Option<u64>,
    /// Max outstanding questions
    #[arg(long)]
    pub(crate) max_pending: Option<usize>,
    /// Timeout in seconds for outbound Telegram calls
    #[arg(long)]
    pub(crate) send_timeout: Option<u64>,
    /// Tell the chat when an answer could not be typed into tmux
    #[arg(long)]
    pub(crate) notify_delivery_failures: bool,
}
