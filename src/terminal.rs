//! Keystroke injection into tmux panes.
//!
//! Delivery is fire-and-forget: tmux gives no acknowledgment that the agent
//! consumed the text, so a `true` result only means the commands ran.

use std::process::Command;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

const UNKNOWN_LOCATION: &str = "unknown";
/// Time the agent's picker needs between keystrokes of a multi-answer submit.
const BATCH_KEY_PAUSE: Duration = Duration::from_millis(800);

pub(crate) trait TerminalInjector: Send + Sync {
    /// Types `text` into the pane at `location` and presses Enter.
    fn deliver(&self, location: &str, text: &str) -> bool;

    /// Types each answer followed by Enter, in order, then one more Enter to
    /// submit the whole form.
    fn deliver_batch(&self, location: &str, answers: &[String]) -> bool;
}

/// Session part of a `session:window.pane` location.
pub(crate) fn session_of(location: &str) -> Option<&str> {
    let location = location.trim();
    if location.is_empty() || location == UNKNOWN_LOCATION {
        return None;
    }
    let session = location.split(':').next().unwrap_or(location);
    if session.is_empty() { None } else { Some(session) }
}

pub(crate) fn literal_keys_args<'a>(location: &'a str, text: &'a str) -> [&'a str; 5] {
    ["send-keys", "-t", location, "-l", text]
}

pub(crate) fn enter_key_args(location: &str) -> [&str; 4] {
    ["send-keys", "-t", location, "Enter"]
}

pub(crate) struct TmuxInjector {
    program: String,
    pause: Duration,
}

impl TmuxInjector {
    pub(crate) fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            pause: BATCH_KEY_PAUSE,
        }
    }

    fn has_session(&self, location: &str) -> bool {
        let Some(session) = session_of(location) else {
            warn!(location, "unknown terminal location, cannot inject response");
            return false;
        };
        if let Err(err) = self.run(&["has-session", "-t", session]) {
            warn!(session, "tmux session not found: {err}");
            return false;
        }
        true
    }

    fn type_line(&self, location: &str, text: &str) -> Result<(), String> {
        self.run(&literal_keys_args(location, text))?;
        self.run(&enter_key_args(location))
    }

    fn run(&self, args: &[&str]) -> Result<(), String> {
        let output = Command::new(&self.program).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                format!("{} not available", self.program)
            } else {
                e.to_string()
            }
        })?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{} {} failed: {}", self.program, args[0], stderr.trim()))
        }
    }
}

impl TerminalInjector for TmuxInjector {
    fn deliver(&self, location: &str, text: &str) -> bool {
        if !self.has_session(location) {
            return false;
        }
        if let Err(err) = self.type_line(location, text) {
            error!(location, "tmux send-keys failed: {err}");
            return false;
        }
        info!(location, "injected response into tmux");
        true
    }

    fn deliver_batch(&self, location: &str, answers: &[String]) -> bool {
        if !self.has_session(location) {
            return false;
        }
        for answer in answers {
            if let Err(err) = self.type_line(location, answer) {
                error!(location, "tmux send-keys failed: {err}");
                return false;
            }
            thread::sleep(self.pause);
        }
        thread::sleep(self.pause);
        if let Err(err) = self.run(&enter_key_args(location)) {
            error!(location, "tmux submit failed: {err}");
            return false;
        }
        info!(location, count = answers.len(), "injected responses into tmux and submitted");
        true
    }
}
