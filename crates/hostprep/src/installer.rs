//! Streamed download followed by an unattended install.
//!
//! The payload is written to disk chunk by chunk as it arrives, with one
//! status event per chunk, and then launched with its silent-install
//! arguments. The exit code decides between completion, completion with a
//! pending restart, and failure.

use hostprep_shared::{
    CompletionResult, DownloadStatus, FailureKind, Package, ProvisionEvent, StepError,
};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::channel::{event_channel, EventChannel, EventSink};
use crate::tool::ToolCommand;

/// How an installer's exit code is interpreted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPolicy {
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,
    /// Success, but the host must restart
    #[serde(default)]
    pub restart_codes: Vec<i32>,
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            success_codes: default_success_codes(),
            restart_codes: Vec::new(),
        }
    }
}

impl ExitPolicy {
    /// `None` (killed by a signal) and unlisted codes are failures
    pub fn interpret(&self, code: Option<i32>) -> Result<CompletionResult, StepError> {
        match code {
            Some(code) if self.restart_codes.contains(&code) => Ok(CompletionResult {
                needs_restart: true,
            }),
            Some(code) if self.success_codes.contains(&code) => Ok(CompletionResult {
                needs_restart: false,
            }),
            Some(code) => Err(StepError::new(
                FailureKind::ExitCode,
                format!("installer exited with code {}", code),
            )
            .with_code(code.to_string())),
            None => Err(StepError::new(
                FailureKind::ExitCode,
                "installer was terminated before it exited",
            )),
        }
    }
}

/// One downloadable package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSpec {
    pub url: String,
    /// File name inside the download directory
    pub file_name: String,
    /// Application to start (detached) after a successful install
    #[serde(default)]
    pub launch_after_install: Option<PathBuf>,
    /// Install command; `{payload}` is the downloaded file
    pub launch: ToolCommand,
    #[serde(default)]
    pub exit_policy: ExitPolicy,
}

/// Downloads and runs one package
#[derive(Debug, Clone)]
pub struct StreamingInstaller {
    package: Package,
    spec: PackageSpec,
    client: reqwest::Client,
}

impl StreamingInstaller {
    pub fn new(package: Package, spec: PackageSpec, client: reqwest::Client) -> Self {
        Self {
            package,
            spec,
            client,
        }
    }

    /// Start download then install in the background.
    ///
    /// `install_args` are appended to the configured launch template.
    /// Must be called inside a tokio runtime.
    pub fn download_and_run(
        &self,
        url: &str,
        destination: &Path,
        install_args: &[String],
    ) -> EventChannel {
        let (sink, channel) = event_channel();
        let installer = self.clone();
        let url = url.to_string();
        let destination = destination.to_path_buf();
        let install_args = install_args.to_vec();

        tokio::spawn(async move {
            installer
                .run(&url, &destination, &install_args, &sink)
                .await;
        });

        channel
    }

    /// Configured URL, given destination, no extra arguments
    pub fn start(&self, destination: &Path) -> EventChannel {
        let url = self.spec.url.clone();
        self.download_and_run(&url, destination, &[])
    }

    async fn run(&self, url: &str, destination: &Path, install_args: &[String], sink: &EventSink) {
        info!("Downloading {} package from {}", self.package, url);

        let response = match self.fetch(url).await {
            Ok(response) => response,
            Err(error) => {
                warn!("{} download failed: {}", self.package, error);
                self.fail(sink, error).await;
                return;
            }
        };
        let total = response.content_length().unwrap_or(0);
        self.install_stream(total, response.bytes_stream(), destination, install_args, sink)
            .await;
    }

    async fn fetch(&self, url: &str) -> Result<reqwest::Response, StepError> {
        self.client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(download_error)
    }

    /// Announce a payload of `total` bytes, persist it from `stream`, then
    /// install it. Every outcome ends in exactly one terminal event.
    pub async fn install_stream<S, B, E>(
        &self,
        total: u64,
        stream: S,
        destination: &Path,
        install_args: &[String],
        sink: &EventSink,
    ) where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        sink.emit(ProvisionEvent::DownloadStarted {
            package: self.package,
            status: DownloadStatus::new(total),
        })
        .await;

        match write_stream(self.package, total, stream, destination, sink).await {
            Ok(status) => info!(
                "Downloaded {} bytes to {}",
                status.downloaded,
                destination.display()
            ),
            Err(error) => {
                warn!("{} download failed: {}", self.package, error);
                self.fail(sink, error).await;
                return;
            }
        }

        let payload = destination.to_string_lossy();
        let command = self
            .spec
            .launch
            .render(&[("payload", &*payload)])
            .with_args(install_args.iter().cloned());

        match run_installer(&command, &self.spec.exit_policy).await {
            Ok(result) => {
                info!(
                    "{} installed (needs_restart={})",
                    self.package, result.needs_restart
                );
                if let Some(app) = &self.spec.launch_after_install {
                    launch_detached(app);
                }
                sink.emit(ProvisionEvent::InstallComplete {
                    package: self.package,
                    result,
                })
                .await;
            }
            Err(error) => {
                warn!("{} install failed: {}", self.package, error);
                self.fail(sink, error).await;
            }
        }
    }

    async fn fail(&self, sink: &EventSink, error: StepError) {
        sink.emit(ProvisionEvent::InstallError {
            package: self.package,
            error,
        })
        .await;
    }
}

fn download_error(e: impl Display) -> StepError {
    StepError::new(FailureKind::Download, e.to_string())
}

/// Persist a byte stream to `destination`, reporting after every chunk.
///
/// `total == 0` means unknown length. More bytes than an advertised length
/// is a failure. A stream that breaks off is reported once more, with the
/// error set, before the error is returned.
pub async fn write_stream<S, B, E>(
    package: Package,
    total: u64,
    stream: S,
    destination: &Path,
    sink: &EventSink,
) -> Result<DownloadStatus, StepError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(download_error)?;
    }
    let mut file = File::create(destination).await.map_err(download_error)?;
    let mut status = DownloadStatus::new(total);

    tokio::pin!(stream);
    while let Some(chunk) = stream.next().await {
        let written = match chunk {
            Ok(chunk) => append(&mut file, &mut status, chunk.as_ref()).await,
            Err(e) => Err(download_error(e)),
        };
        if let Err(error) = written {
            sink.emit(ProvisionEvent::DownloadProgress {
                package,
                status: status.failed(error.message.clone()),
            })
            .await;
            return Err(error);
        }
        sink.emit(ProvisionEvent::DownloadProgress {
            package,
            status: status.clone(),
        })
        .await;
    }

    file.flush().await.map_err(download_error)?;
    file.sync_all().await.map_err(download_error)?;
    Ok(status)
}

async fn append(file: &mut File, status: &mut DownloadStatus, bytes: &[u8]) -> Result<(), StepError> {
    let downloaded = status.downloaded + bytes.len() as u64;
    if status.total > 0 && downloaded > status.total {
        return Err(StepError::new(
            FailureKind::Download,
            format!(
                "received {} bytes, server advertised {}",
                downloaded, status.total
            ),
        ));
    }
    file.write_all(bytes).await.map_err(download_error)?;
    status.downloaded = downloaded;
    Ok(())
}

/// Launch the installer silently and interpret its exit code
pub async fn run_installer(
    command: &ToolCommand,
    policy: &ExitPolicy,
) -> Result<CompletionResult, StepError> {
    info!("Running installer: {}", command.display());
    let mut cmd = command.to_command();
    cmd.stdout(Stdio::null()).stderr(Stdio::null());

    let status = match cmd.status().await {
        Ok(status) => status,
        Err(e) => {
            return Err(StepError::new(
                FailureKind::ToolSpawn,
                format!("Installer launch failed: {}", e),
            ))
        }
    };
    debug!("installer exited: {:?}", status.code());
    policy.interpret(status.code())
}

/// Start an application without waiting for it. Failures are only logged.
pub fn launch_detached(app: &Path) {
    let mut cmd = std::process::Command::new(app);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        cmd.creation_flags(DETACHED_PROCESS);
    }

    match cmd.spawn() {
        Ok(child) => debug!("launched {} (pid {})", app.display(), child.id()),
        Err(e) => warn!("Could not launch {}: {}", app.display(), e),
    }
}
