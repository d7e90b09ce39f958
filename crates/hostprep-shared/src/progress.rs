//! Signals extracted from the free-text output of an external tool.

use serde::{Deserialize, Serialize};

/// One signal produced while scanning tool output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Percent complete, always within 0..=100
    Progress { percent: f64 },
    /// The tool reported an error in its output
    Error {
        code: Option<String>,
        message: String,
    },
    /// Raw text of one output chunk
    Log { text: String },
    /// The tool reported (or implied by exiting) success
    Done,
    /// The process exited
    Close { exit_code: Option<i32> },
}

impl ProgressEvent {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Format for debug display
    pub fn format_debug(&self) -> String {
        match self {
            Self::Progress { percent } => format!("progress {:.1}%", percent),
            Self::Error { code, message } => match code {
                Some(code) => format!("error [{}] {}", code, message),
                None => format!("error {}", message),
            },
            Self::Log { text } => format!("log {:?}", text),
            Self::Done => "done".to_string(),
            Self::Close { exit_code } => match exit_code {
                Some(code) => format!("close (exit {})", code),
                None => "close (signal)".to_string(),
            },
        }
    }
}
