//! Privileged OS feature toggling.
//!
//! Runs the feature tool once per feature, scans its combined stdout and
//! stderr with a [`ToolOutputParser`] and republishes what it finds as
//! phase-labelled events. Every phase ends with exactly one
//! `FeatureComplete`.

use hostprep_shared::{FailureKind, FeaturePhase, ProgressEvent, ProvisionEvent, StepError};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{event_channel, EventChannel, EventSink};
use crate::config::Config;
use crate::parser::ToolOutputParser;
use crate::tool::ToolCommand;

const READ_BUF: usize = 4096;

/// Fixed argument template; `{feature}` is the feature name
pub const ENABLE_ARGS: [&str; 5] = [
    "/online",
    "/enable-feature",
    "/featurename:{feature}",
    "/all",
    "/norestart",
];

/// Drives the feature tool
#[derive(Debug, Clone)]
pub struct FeatureToggler {
    tool: ToolCommand,
    restart_code: i32,
}

impl FeatureToggler {
    /// `tool` is the program (plus any leading arguments) the feature
    /// arguments are appended to
    pub fn new(tool: ToolCommand, restart_code: i32) -> Self {
        Self { tool, restart_code }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.tools.feature_tool.clone(),
            config.features.restart_code,
        )
    }

    /// Full command line for one feature
    pub fn command_for(&self, feature: &str, extra_args: &[String]) -> ToolCommand {
        let mut template = self.tool.clone().with_args(ENABLE_ARGS);
        template.args.extend(extra_args.iter().cloned());
        template.render(&[("feature", feature)])
    }

    /// Enable one feature in the background
    pub fn enable(&self, phase: FeaturePhase, feature: &str, extra_args: &[String]) -> EventChannel {
        let (sink, channel) = event_channel();
        let toggler = self.clone();
        let command = self.command_for(feature, extra_args);

        tokio::spawn(async move {
            toggler.run_phase(phase, &command, &sink).await;
        });
        channel
    }

    /// Hypervisor feature, then the subsystem feature only if the first
    /// phase completed cleanly
    pub fn enable_virtualization_then_subsystem(
        &self,
        hypervisor: &str,
        subsystem: &str,
        extra_args: &[String],
    ) -> EventChannel {
        let (sink, channel) = event_channel();
        let toggler = self.clone();
        let first = self.command_for(hypervisor, extra_args);
        let second = self.command_for(subsystem, extra_args);

        tokio::spawn(async move {
            if !toggler
                .run_phase(FeaturePhase::Hypervisor, &first, &sink)
                .await
            {
                warn!("Hypervisor feature failed, not enabling the subsystem feature");
                return;
            }
            toggler
                .run_phase(FeaturePhase::Subsystem, &second, &sink)
                .await;
        });
        channel
    }

    /// Run one phase to completion. Returns whether it succeeded.
    async fn run_phase(&self, phase: FeaturePhase, command: &ToolCommand, sink: &EventSink) -> bool {
        info!("Enabling {} feature: {}", phase, command.display());
        let success = match self.drive(phase, command, sink).await {
            Ok(success) => success,
            Err(error) => {
                sink.emit(ProvisionEvent::FeatureError { phase, error }).await;
                false
            }
        };
        if !success {
            warn!("{} feature failed", phase);
        }
        sink.emit(ProvisionEvent::FeatureComplete { phase, success })
            .await;
        success
    }

    /// `Ok(false)` means the tool reported an error that is already on the
    /// channel.
    async fn drive(
        &self,
        phase: FeaturePhase,
        command: &ToolCommand,
        sink: &EventSink,
    ) -> Result<bool, StepError> {
        let mut cmd = command.to_command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| {
            StepError::new(
                FailureKind::ToolSpawn,
                format!("failed to launch {}: {}", command.program, e),
            )
        })?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone()));
        }
        drop(tx);

        let mut parser = ToolOutputParser::new();
        while let Some(chunk) = rx.recv().await {
            for event in parser.feed(&chunk) {
                relay(phase, event, sink).await;
            }
        }

        let status = child.wait().await.map_err(|e| {
            StepError::new(
                FailureKind::ToolSpawn,
                format!("lost track of {}: {}", command.program, e),
            )
        })?;
        debug!("{} feature tool exited: {:?}", phase, status.code());

        for event in parser.finish(status.code()) {
            relay(phase, event, sink).await;
        }
        if parser.saw_error() {
            return Ok(false);
        }

        match status.code() {
            Some(0) => Ok(true),
            Some(code) if code == self.restart_code => {
                info!("{} feature enabled, restart pending", phase);
                Ok(true)
            }
            Some(code) => Err(StepError::new(
                FailureKind::ExitCode,
                format!("feature tool exited with code {}", code),
            )
            .with_code(code.to_string())),
            None => Err(StepError::new(
                FailureKind::ExitCode,
                "feature tool was terminated before it exited",
            )),
        }
    }
}

/// Forward one parser event under the phase label
async fn relay(phase: FeaturePhase, event: ProgressEvent, sink: &EventSink) {
    debug!("{} feature tool: {}", phase, event.format_debug());
    let event = match event {
        ProgressEvent::Progress { percent } => ProvisionEvent::FeatureProgress { phase, percent },
        ProgressEvent::Log { text } => ProvisionEvent::FeatureLog { phase, text },
        ProgressEvent::Error { code, message } => {
            let mut error = StepError::new(FailureKind::ToolOutput, message);
            error.code = code;
            ProvisionEvent::FeatureError { phase, error }
        }
        ProgressEvent::Done | ProgressEvent::Close { .. } => return,
    };
    sink.emit(event).await;
}

async fn pump<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUF];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("feature tool output read failed: {}", e);
                break;
            }
        }
    }
}
