//! Run progress reporting for the CLI.
//!
//! Renders task transitions on **stderr** so stdout remains parseable for
//! scripts. Subscribes to the task's watch channel and prints each state
//! change once, in either human or JSON form.

use std::io::Write;

use crate::task::{TaskHandle, TaskState};

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }
}

/// Spawn a printer that follows the task until it reaches a terminal state.
/// Returns immediately in `Off` mode.
pub fn spawn_printer(mode: ProgressMode, task: &TaskHandle) -> Option<tokio::task::JoinHandle<()>> {
    if mode == ProgressMode::Off {
        return None;
    }

    let mut rx = task.subscribe();
    Some(tokio::spawn(async move {
        loop {
            let status = rx.borrow_and_update().clone();
            render(mode, &status.state);
            if status.state.is_terminal() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }))
}

fn render(mode: ProgressMode, state: &TaskState) {
    let line = match mode {
        ProgressMode::Off => return,
        ProgressMode::Human => match state {
            TaskState::Pending => "run  pending\n".to_string(),
            TaskState::Progress {
                stage,
                progress,
                message,
            } => {
                format!("run  {:<14} {:>3}%  {}\n", stage, progress, message)
            }
            TaskState::Success { .. } => "run  done\n".to_string(),
            TaskState::Failure { error } => format!("run  failed: {}\n", error),
        },
        ProgressMode::Json => {
            let obj = match state {
                TaskState::Pending => serde_json::json!({
                    "event": "progress",
                    "state": "PENDING",
                }),
                TaskState::Progress {
                    stage,
                    progress,
                    message,
                } => serde_json::json!({
                    "event": "progress",
                    "state": "PROGRESS",
                    "stage": stage,
                    "progress": progress,
                    "message": message,
                }),
                TaskState::Success { result } => serde_json::json!({
                    "event": "progress",
                    "state": "SUCCESS",
                    "result": result,
                }),
                TaskState::Failure { error } => serde_json::json!({
                    "event": "progress",
                    "state": "FAILURE",
                    "error": error,
                }),
            };
            match serde_json::to_string(&obj) {
                Ok(line) => format!("{}\n", line),
                Err(_) => return,
            }
        }
    };

    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(line.as_bytes());
    let _ = stderr.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modes() {
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("human"), Some(ProgressMode::Human));
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("verbose"), None);
    }
}
