//! Configuration management for hostprep.
//!
//! Loads settings from `--config`, `$HOSTPREP_CONFIG` or
//! `<config dir>/hostprep/config.toml`, otherwise uses defaults that target
//! a Windows host (DISM, PowerShell, WSL MSI, Docker Desktop).

use hostprep_shared::HostprepError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::installer::{ExitPolicy, PackageSpec};
use crate::simulated::Scenario;
use crate::tool::ToolCommand;

/// Environment override for the config file location
pub const CONFIG_ENV: &str = "HOSTPREP_CONFIG";

/// Pinned subsystem update package
pub const SUBSYSTEM_URL: &str =
    "https://github.com/microsoft/WSL/releases/download/2.5.10/wsl.2.5.10.0.x64.msi";

/// Container engine installer
pub const ENGINE_URL: &str =
    "https://desktop.docker.com/win/main/amd64/Docker%20Desktop%20Installer.exe";

/// Scheduled task that resumes the flow at next logon
pub const RESUME_TASK: &str = "hostprep-resume";

/// Provisioner implementation to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Windows on Windows hosts, unsupported elsewhere
    #[default]
    Auto,
    Windows,
    Simulated,
}

/// External tools driven by the Windows provisioner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Feature tool; feature arguments are appended
    #[serde(default = "default_feature_tool")]
    pub feature_tool: ToolCommand,

    /// Shell used for the feature-state query; the script is appended
    #[serde(default = "default_feature_query")]
    pub feature_query: ToolCommand,

    /// Subsystem version query
    #[serde(default = "default_subsystem_version")]
    pub subsystem_version: ToolCommand,

    /// Engine client version query (used when no endpoint is configured)
    #[serde(default = "default_engine_version")]
    pub engine_version: ToolCommand,

    /// Immediate OS restart
    #[serde(default = "default_reboot")]
    pub reboot: ToolCommand,

    /// Register `{exe} flow` to start at next logon; `{exe}` is filled in
    #[serde(default = "default_autostart")]
    pub autostart: ToolCommand,

    /// Remove the logon registration once the host is provisioned
    #[serde(default = "default_autostart_remove")]
    pub autostart_remove: ToolCommand,
}

fn default_feature_tool() -> ToolCommand {
    ToolCommand::new("dism.exe", Vec::<String>::new())
}

fn default_feature_query() -> ToolCommand {
    ToolCommand::new("powershell.exe", ["-NoProfile", "-NonInteractive", "-Command"])
}

fn default_subsystem_version() -> ToolCommand {
    ToolCommand::new("wsl.exe", ["--version"])
}

fn default_engine_version() -> ToolCommand {
    ToolCommand::new("docker", ["version", "--format", "{{.Server.Version}}"])
}

fn default_reboot() -> ToolCommand {
    ToolCommand::new("shutdown", ["/r", "/t", "0"])
}

fn default_autostart() -> ToolCommand {
    ToolCommand::new(
        "schtasks",
        [
            "/Create", "/F", "/SC", "ONLOGON", "/RL", "HIGHEST", "/TN", RESUME_TASK, "/TR",
            "\"{exe}\" flow",
        ],
    )
}

fn default_autostart_remove() -> ToolCommand {
    ToolCommand::new("schtasks", ["/Delete", "/TN", RESUME_TASK, "/F"])
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            feature_tool: default_feature_tool(),
            feature_query: default_feature_query(),
            subsystem_version: default_subsystem_version(),
            engine_version: default_engine_version(),
            reboot: default_reboot(),
            autostart: default_autostart(),
            autostart_remove: default_autostart_remove(),
        }
    }
}

/// OS features enabled in the first step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    /// Enabled first
    #[serde(default = "default_hypervisor_feature")]
    pub hypervisor: String,

    /// Enabled only after the hypervisor feature succeeds
    #[serde(default = "default_subsystem_feature")]
    pub subsystem: String,

    /// `State` value that counts as enabled in the feature query
    #[serde(default = "default_enabled_state")]
    pub enabled_state: String,

    /// Feature tool exit code meaning "enabled, restart pending"
    #[serde(default = "default_feature_restart_code")]
    pub restart_code: i32,
}

fn default_hypervisor_feature() -> String {
    "VirtualMachinePlatform".to_string()
}

fn default_subsystem_feature() -> String {
    "Microsoft-Windows-Subsystem-Linux".to_string()
}

fn default_enabled_state() -> String {
    "2".to_string()
}

fn default_feature_restart_code() -> i32 {
    3010
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            hypervisor: default_hypervisor_feature(),
            subsystem: default_subsystem_feature(),
            enabled_state: default_enabled_state(),
            restart_code: default_feature_restart_code(),
        }
    }
}

/// Probe timing and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbesConfig {
    /// Per-probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// How long the engine may take to answer before it counts as missing
    #[serde(default = "default_engine_window")]
    pub engine_window_secs: u64,

    /// Pause between engine attempts in milliseconds
    #[serde(default = "default_engine_retry")]
    pub engine_retry_ms: u64,

    /// Lowest acceptable subsystem major version
    #[serde(default = "default_subsystem_major")]
    pub subsystem_required_major: u32,

    /// Engine HTTP endpoint (`http://host:port`); the CLI client is used when unset
    #[serde(default)]
    pub engine_endpoint: Option<String>,
}

fn default_probe_timeout() -> u64 {
    15
}

fn default_engine_window() -> u64 {
    30
}

fn default_engine_retry() -> u64 {
    1_000
}

fn default_subsystem_major() -> u32 {
    2
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_probe_timeout(),
            engine_window_secs: default_engine_window(),
            engine_retry_ms: default_engine_retry(),
            subsystem_required_major: default_subsystem_major(),
            engine_endpoint: None,
        }
    }
}

impl ProbesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn engine_window(&self) -> Duration {
        Duration::from_secs(self.engine_window_secs)
    }

    pub fn engine_retry(&self) -> Duration {
        Duration::from_millis(self.engine_retry_ms)
    }
}

/// Simulated backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub scenario: Scenario,

    /// Delay between simulated progress events in milliseconds
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
}

fn default_tick() -> u64 {
    120
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            scenario: Scenario::default(),
            tick_ms: default_tick(),
        }
    }
}

fn default_subsystem_package() -> PackageSpec {
    PackageSpec {
        url: SUBSYSTEM_URL.to_string(),
        file_name: "wsl_update_x64.msi".to_string(),
        launch: ToolCommand::new("msiexec.exe", ["/i", "{payload}", "/qn", "/norestart"]),
        exit_policy: ExitPolicy {
            success_codes: vec![0],
            restart_codes: vec![3010],
        },
        launch_after_install: None,
    }
}

fn default_engine_package() -> PackageSpec {
    PackageSpec {
        url: ENGINE_URL.to_string(),
        file_name: "DockerDesktopInstaller.exe".to_string(),
        launch: ToolCommand::new(
            "{payload}",
            ["install", "--quiet", "--accept-license", "--backend=wsl-2"],
        ),
        exit_policy: ExitPolicy {
            success_codes: vec![0],
            restart_codes: Vec::new(),
        },
        launch_after_install: Some(PathBuf::from(
            r"C:\Program Files\Docker\Docker\Docker Desktop.exe",
        )),
    }
}

fn default_download_dir() -> PathBuf {
    std::env::temp_dir().join("hostprep")
}

/// Full configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: Backend,

    /// Where payloads are written before they run
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub features: FeaturesConfig,

    #[serde(default)]
    pub probes: ProbesConfig,

    #[serde(default = "default_subsystem_package")]
    pub subsystem: PackageSpec,

    #[serde(default = "default_engine_package")]
    pub engine: PackageSpec,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            download_dir: default_download_dir(),
            tools: ToolsConfig::default(),
            features: FeaturesConfig::default(),
            probes: ProbesConfig::default(),
            subsystem: default_subsystem_package(),
            engine: default_engine_package(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hostprep").join("config.toml"))
    }

    /// Load config.
    ///
    /// An explicit path (argument or environment) must exist and parse.
    /// The default location falls back to defaults when missing or invalid.
    pub fn load(explicit: Option<&Path>) -> Result<Self, HostprepError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        if let Some(path) = explicit.map(Path::to_path_buf).or(from_env) {
            return Self::load_from_path(&path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from_path(&path).or_else(|e| {
                warn!("Ignoring {}: {}", path.display(), e);
                Ok(Config::default())
            }),
            _ => Ok(Config::default()),
        }
    }

    /// Load config from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, HostprepError> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)
            .map_err(|e| HostprepError::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Render as TOML (for `hostprep config`)
    pub fn to_toml(&self) -> Result<String, HostprepError> {
        toml::to_string_pretty(self).map_err(|e| HostprepError::Config(e.to_string()))
    }

    /// Destination path of a package payload
    pub fn payload_path(&self, package: &PackageSpec) -> PathBuf {
        self.download_dir.join(&package.file_name)
    }
}
