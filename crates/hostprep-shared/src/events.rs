//! Provisioning events delivered on an event channel.
//!
//! The union is closed: a consumer (or a transport bridge) matches on the
//! variant and forwards the serialized tag and payload, never the raw
//! driver arguments.

use serde::{Deserialize, Serialize};

/// Which of the two feature toggles an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeaturePhase {
    /// Hypervisor platform feature (runs first)
    Hypervisor,
    /// Linux subsystem feature (runs only after a clean hypervisor phase)
    Subsystem,
}

impl FeaturePhase {
    fn transport_prefix(self) -> &'static str {
        match self {
            Self::Hypervisor => "vmp",
            Self::Subsystem => "wsl",
        }
    }
}

impl std::fmt::Display for FeaturePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hypervisor => write!(f, "hypervisor"),
            Self::Subsystem => write!(f, "subsystem"),
        }
    }
}

/// Which downloadable package an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Package {
    /// Compatibility subsystem update package
    Subsystem,
    /// Container engine installer
    Engine,
}

impl Package {
    fn transport_prefix(self) -> &'static str {
        match self {
            Self::Subsystem => "wsl",
            Self::Engine => "docker",
        }
    }
}

impl std::fmt::Display for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subsystem => write!(f, "subsystem"),
            Self::Engine => write!(f, "engine"),
        }
    }
}

/// Byte accounting for one download.
///
/// `total == 0` means the server did not advertise a length. `error` is set
/// on the last status of a download that broke off; the step's error event
/// follows it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub total: u64,
    pub downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadStatus {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            downloaded: 0,
            error: None,
        }
    }

    /// Same byte counts, marked as broken off
    pub fn failed(&self, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..self.clone()
        }
    }

    pub fn is_length_known(&self) -> bool {
        self.total > 0
    }

    /// Fraction in 0.0..=1.0, `None` when the length is unknown
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.downloaded as f64 / self.total as f64).min(1.0))
    }
}

/// Emitted once per successful install action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub needs_restart: bool,
}

/// Runtime failure taxonomy for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// External tool or installer could not be launched
    ToolSpawn,
    /// The tool reported an error in its own output
    ToolOutput,
    /// Network or stream failure while retrieving a payload
    Download,
    /// Process exited with an unrecognized code
    ExitCode,
}

/// Error payload carried by error events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: FailureKind,
    /// Short code where derivable (tool error code or exit code)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl StepError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Event emitted by a step driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProvisionEvent {
    FeatureProgress {
        phase: FeaturePhase,
        percent: f64,
    },
    FeatureLog {
        phase: FeaturePhase,
        text: String,
    },
    FeatureError {
        phase: FeaturePhase,
        error: StepError,
    },
    /// Exactly one per phase, on success and on failure
    FeatureComplete {
        phase: FeaturePhase,
        success: bool,
    },
    DownloadStarted {
        package: Package,
        status: DownloadStatus,
    },
    DownloadProgress {
        package: Package,
        status: DownloadStatus,
    },
    InstallComplete {
        package: Package,
        result: CompletionResult,
    },
    InstallError {
        package: Package,
        error: StepError,
    },
}

impl ProvisionEvent {
    /// Name of the event on the presentation transport
    pub fn transport_name(&self) -> String {
        match self {
            Self::FeatureProgress { phase, .. }
            | Self::FeatureLog { phase, .. }
            | Self::FeatureError { phase, .. } => {
                format!("{}-event", phase.transport_prefix())
            }
            Self::FeatureComplete { phase, .. } => {
                format!("{}-event-complete", phase.transport_prefix())
            }
            Self::DownloadStarted { package, .. } => {
                format!("{}-install-started", package.transport_prefix())
            }
            Self::DownloadProgress { package, .. } | Self::InstallError { package, .. } => {
                format!("{}-install-event", package.transport_prefix())
            }
            Self::InstallComplete { package, .. } => {
                format!("{}-install-complete", package.transport_prefix())
            }
        }
    }

    /// The error payload, if this is an error event
    pub fn error(&self) -> Option<&StepError> {
        match self {
            Self::FeatureError { error, .. } | Self::InstallError { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    /// Wrap for forwarding across a process boundary
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            name: self.transport_name(),
            event: self.clone(),
        }
    }
}

/// Named event as forwarded over a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub name: String,
    pub event: ProvisionEvent,
}

impl EventEnvelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
