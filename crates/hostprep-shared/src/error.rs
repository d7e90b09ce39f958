//! Error types for hostprep.
//!
//! Only caller errors and local failures live here. Failures of a running
//! step travel on its event channel as [`crate::StepError`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostprepError {
    #[error("Invalid step {0}: expected an action number between 1 and 3")]
    InvalidStep(u32),

    #[error("No provisioner available for platform '{0}'")]
    UnsupportedPlatform(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reboot failed: {0}")]
    Reboot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostprepError {
    pub fn code(&self) -> i32 {
        match self {
            HostprepError::InvalidStep(_) => -32602,
            HostprepError::UnsupportedPlatform(_) => -32001,
            HostprepError::Config(_) => -32002,
            HostprepError::Reboot(_) => -32003,
            HostprepError::Io(_) => -32006,
        }
    }
}
