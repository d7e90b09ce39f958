//! Shared types for hostprep components.
//!
//! The data model the provisioning engine produces and a consumer
//! (terminal UI, desktop shell, transport bridge) reads: the step ordinal,
//! raw tool-output signals, and the closed event union carried on an
//! event channel.

pub mod error;
pub mod events;
pub mod progress;
pub mod step;

pub use error::HostprepError;
pub use events::{
    CompletionResult, DownloadStatus, EventEnvelope, FailureKind, FeaturePhase, Package,
    ProvisionEvent, StepError,
};
pub use progress::ProgressEvent;
pub use step::Step;
