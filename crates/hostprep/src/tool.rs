//! External command templates.
//!
//! Every tool the engine drives (feature tool, probes, installers, reboot)
//! is a configurable program plus argument template, so the same drivers
//! run against the real Windows tools or against stand-ins in tests.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Hide console windows of spawned tools
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Failure to run a tool to completion
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("{program} exited with code {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Program plus argument template.
///
/// Arguments may contain `{name}` placeholders filled by [`ToolCommand::render`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Substitute `{key}` placeholders in the program and every argument
    pub fn render(&self, vars: &[(&str, &str)]) -> Self {
        let fill = |text: &str| {
            vars.iter().fold(text.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), value)
            })
        };
        Self {
            program: fill(&self.program),
            args: self.args.iter().map(|arg| fill(arg)).collect(),
        }
    }

    /// Append extra arguments after the template
    pub fn with_args<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(extra.into_iter().map(Into::into));
        self
    }

    /// Build a tokio command with no stdin and a hidden window
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    }

    /// Human-readable command line for logs
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Run to completion within `limit` and return stdout.
    ///
    /// A timed-out process is killed. A non-zero exit is a failure.
    pub async fn capture(&self, limit: Duration) -> Result<Vec<u8>, ToolError> {
        debug!("capture: {}", self.display());
        let mut cmd = self.to_command();
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ToolError::Spawn {
                    program: self.program.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(ToolError::Timeout {
                    program: self.program.clone(),
                    secs: limit.as_secs(),
                })
            }
        };

        if !output.status.success() {
            return Err(ToolError::NonZeroExit {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}
