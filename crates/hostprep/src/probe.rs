//! System-state probes.
//!
//! Each probe answers one question about the live host. The controller
//! treats any [`ProbeFailure`] as "requirement not met", so probes report
//! failures instead of hiding them and the caller decides.
//!
//! Production code uses [`HostProbe`], which runs the configured tools.
//! Tests use [`FakeSystemProbe`] with pre-configured answers.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{Config, FeaturesConfig, ProbesConfig, ToolsConfig};
use crate::tool::ToolError;

/// A system-state query that could not produce an answer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("failed to launch {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("{program} exited with code {code:?}")]
    NonZeroExit { program: String, code: Option<i32> },

    #[error("unparseable output: {0}")]
    Unparseable(String),

    #[error("engine endpoint: {0}")]
    Http(String),
}

impl From<ToolError> for ProbeFailure {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::Spawn { program, source } => Self::Spawn {
                program,
                message: source.to_string(),
            },
            ToolError::Timeout { program, secs } => Self::Timeout { program, secs },
            ToolError::NonZeroExit { program, code, .. } => Self::NonZeroExit { program, code },
        }
    }
}

/// Queries the controller needs to compute the current step
#[async_trait]
pub trait SystemProbe: Send + Sync {
    /// Whether both required OS features are enabled
    async fn features_enabled(&self) -> Result<bool, ProbeFailure>;

    /// Major version of the installed compatibility subsystem
    async fn subsystem_major(&self) -> Result<u32, ProbeFailure>;

    /// Version reported by the running container engine
    async fn engine_version(&self) -> Result<String, ProbeFailure>;
}

// ============================================================================
// Host probe (production)
// ============================================================================

/// Probes the real host through the configured tools
#[derive(Debug, Clone)]
pub struct HostProbe {
    tools: ToolsConfig,
    features: FeaturesConfig,
    probes: ProbesConfig,
    client: reqwest::Client,
}

impl HostProbe {
    pub fn new(config: &Config, client: reqwest::Client) -> Self {
        Self {
            tools: config.tools.clone(),
            features: config.features.clone(),
            probes: config.probes.clone(),
            client,
        }
    }

    /// Shell script appended to the feature-query command.
    ///
    /// `-FeatureName` binds a single name, so all features are listed and
    /// filtered instead.
    pub fn feature_query_script(&self) -> String {
        format!(
            "$names = @({}, {}); Get-WindowsOptionalFeature -Online | \
             Where-Object {{ $_.FeatureName -in $names }} | \
             Select-Object FeatureName,State | ConvertTo-Json -Compress",
            ps_quote(&self.features.hypervisor),
            ps_quote(&self.features.subsystem)
        )
    }

    async fn engine_attempt(&self, limit: Duration) -> Result<String, ProbeFailure> {
        match &self.probes.engine_endpoint {
            Some(endpoint) => engine_version_http(&self.client, endpoint, limit).await,
            None => {
                let out = self.tools.engine_version.capture(limit).await?;
                let version = String::from_utf8_lossy(&out).trim().to_string();
                if version.is_empty() {
                    return Err(ProbeFailure::Unparseable(
                        "engine client printed no version".to_string(),
                    ));
                }
                Ok(version)
            }
        }
    }
}

#[async_trait]
impl SystemProbe for HostProbe {
    async fn features_enabled(&self) -> Result<bool, ProbeFailure> {
        let query = self
            .tools
            .feature_query
            .clone()
            .with_args([self.feature_query_script()]);
        let out = query.capture(self.probes.timeout()).await?;
        let states = parse_feature_states(&out)?;
        debug!("feature states: {:?}", states);

        let enabled = [&self.features.hypervisor, &self.features.subsystem]
            .iter()
            .all(|name| states.get(name.as_str()) == Some(&self.features.enabled_state));
        Ok(enabled)
    }

    async fn subsystem_major(&self) -> Result<u32, ProbeFailure> {
        let out = self
            .tools
            .subsystem_version
            .capture(self.probes.timeout())
            .await?;
        let text = decode_tool_output(&out);
        parse_subsystem_major(&text).ok_or_else(|| {
            ProbeFailure::Unparseable(format!("no version line in {:?}", text.trim()))
        })
    }

    /// Retried until the reachability window elapses; the engine can take a
    /// while to answer right after it starts.
    async fn engine_version(&self) -> Result<String, ProbeFailure> {
        let deadline = Instant::now() + self.probes.engine_window();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.engine_attempt(self.probes.timeout()).await {
                Ok(version) => return Ok(version),
                Err(e) => {
                    debug!("engine probe attempt {} failed: {}", attempt, e);
                    if Instant::now() + self.probes.engine_retry() >= deadline {
                        return Err(e);
                    }
                }
            }
            tokio::time::sleep(self.probes.engine_retry()).await;
        }
    }
}

/// Single-quoted PowerShell literal
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `GET {endpoint}/version`, reading the `Version` field
pub async fn engine_version_http(
    client: &reqwest::Client,
    endpoint: &str,
    limit: Duration,
) -> Result<String, ProbeFailure> {
    let url = format!("{}/version", endpoint.trim_end_matches('/'));
    let body: Value = client
        .get(&url)
        .timeout(limit)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| ProbeFailure::Http(e.to_string()))?
        .json()
        .await
        .map_err(|e| ProbeFailure::Http(e.to_string()))?;

    body.get("Version")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProbeFailure::Unparseable(format!("no Version in {}", body)))
}

/// Feature name to state from `ConvertTo-Json` output.
///
/// Accepts a single object or an array; `State` may be a number or a string.
pub fn parse_feature_states(raw: &[u8]) -> Result<HashMap<String, String>, ProbeFailure> {
    let text = decode_tool_output(raw);
    let text = text.trim();
    if text.is_empty() {
        return Err(ProbeFailure::Unparseable("empty feature query output".to_string()));
    }
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProbeFailure::Unparseable(e.to_string()))?;

    let entries = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        other => {
            return Err(ProbeFailure::Unparseable(format!(
                "unexpected feature query output: {}",
                other
            )))
        }
    };

    let mut states = HashMap::new();
    for entry in entries {
        let Some(name) = entry.get("FeatureName").and_then(Value::as_str) else {
            continue;
        };
        let state = match entry.get("State") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        states.insert(name.to_string(), state);
    }
    Ok(states)
}

/// Decode tool output that may be UTF-16LE (as the subsystem tool prints it)
/// or UTF-8.
pub fn decode_tool_output(raw: &[u8]) -> String {
    let looks_utf16 = raw.len() >= 2 && raw.iter().skip(1).step_by(2).any(|&b| b == 0);
    let text = if looks_utf16 {
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(raw).into_owned()
    };
    text.replace(['\u{feff}', '\0'], "")
}

/// Major version from `key: value` lines, using the `WSL version` line.
pub fn parse_subsystem_major(text: &str) -> Option<u32> {
    text.split("\r\n")
        .flat_map(|line| line.split('\n'))
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("WSL version"))
        .and_then(|(_, value)| value.trim().split('.').next()?.trim().parse().ok())
}

// ============================================================================
// Fake probe (testing)
// ============================================================================

#[derive(Debug, Clone)]
struct FakeState {
    features_enabled: bool,
    subsystem_major: Option<u32>,
    engine_version: Option<String>,
}

/// Fake probe with mutable answers and call counters
#[derive(Debug)]
pub struct FakeSystemProbe {
    state: Mutex<FakeState>,
    feature_calls: AtomicUsize,
    subsystem_calls: AtomicUsize,
    engine_calls: AtomicUsize,
}

impl FakeSystemProbe {
    /// Nothing installed
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                features_enabled: false,
                subsystem_major: None,
                engine_version: None,
            }),
            feature_calls: AtomicUsize::new(0),
            subsystem_calls: AtomicUsize::new(0),
            engine_calls: AtomicUsize::new(0),
        }
    }

    /// Everything installed
    pub fn provisioned() -> Self {
        Self::new()
            .with_features(true)
            .with_subsystem(Some(2))
            .with_engine(Some("27.0.3"))
    }

    pub fn with_features(self, enabled: bool) -> Self {
        self.set_features(enabled);
        self
    }

    pub fn with_subsystem(self, major: Option<u32>) -> Self {
        self.set_subsystem(major);
        self
    }

    pub fn with_engine(self, version: Option<&str>) -> Self {
        self.set_engine(version);
        self
    }

    pub fn set_features(&self, enabled: bool) {
        self.state().features_enabled = enabled;
    }

    pub fn set_subsystem(&self, major: Option<u32>) {
        self.state().subsystem_major = major;
    }

    pub fn set_engine(&self, version: Option<&str>) {
        self.state().engine_version = version.map(str::to_string);
    }

    /// Calls to `features_enabled`, `subsystem_major` and `engine_version`
    pub fn call_counts(&self) -> (usize, usize, usize) {
        (
            self.feature_calls.load(Ordering::SeqCst),
            self.subsystem_calls.load(Ordering::SeqCst),
            self.engine_calls.load(Ordering::SeqCst),
        )
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn missing(what: &str) -> ProbeFailure {
        ProbeFailure::NonZeroExit {
            program: format!("fake:{}", what),
            code: Some(1),
        }
    }
}

impl Default for FakeSystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemProbe for FakeSystemProbe {
    async fn features_enabled(&self) -> Result<bool, ProbeFailure> {
        self.feature_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().features_enabled)
    }

    async fn subsystem_major(&self) -> Result<u32, ProbeFailure> {
        self.subsystem_calls.fetch_add(1, Ordering::SeqCst);
        self.state()
            .subsystem_major
            .ok_or_else(|| Self::missing("subsystem"))
    }

    async fn engine_version(&self) -> Result<String, ProbeFailure> {
        self.engine_calls.fetch_add(1, Ordering::SeqCst);
        self.state()
            .engine_version
            .clone()
            .ok_or_else(|| Self::missing("engine"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    const WSL_OUTPUT: &str = "WSL version: 2.5.10.0\r\nKernel version: 6.6.87.2-1\r\n\
                              WSLg version: 1.0.66\r\nWindows version: 10.0.22631.5472\r\n";

    #[test]
    fn test_parse_subsystem_major_utf16() {
        let text = decode_tool_output(&utf16le(WSL_OUTPUT));
        assert_eq!(parse_subsystem_major(&text), Some(2));
    }

    #[test]
    fn test_parse_subsystem_major_utf8() {
        assert_eq!(parse_subsystem_major("WSL version: 1.2.5.0\n"), Some(1));
        // WSLg line must not be taken for the WSL line
        assert_eq!(parse_subsystem_major("WSLg version: 1.0.66\r\n"), None);
        assert_eq!(parse_subsystem_major("WSL version: preview\r\n"), None);
        assert_eq!(parse_subsystem_major(""), None);
    }

    #[test]
    fn test_decode_strips_bom() {
        let mut raw = vec![0xff, 0xfe];
        raw.extend(utf16le("WSL version: 2.0.0"));
        assert_eq!(decode_tool_output(&raw), "WSL version: 2.0.0");
    }

    #[test]
    fn test_parse_feature_states_array() {
        let raw = br#"[{"FeatureName":"VirtualMachinePlatform","State":2},{"FeatureName":"Microsoft-Windows-Subsystem-Linux","State":"Disabled"}]"#;
        let states = parse_feature_states(raw).unwrap();
        assert_eq!(states["VirtualMachinePlatform"], "2");
        assert_eq!(states["Microsoft-Windows-Subsystem-Linux"], "Disabled");
    }

    #[test]
    fn test_parse_feature_states_single_object() {
        let raw = br#"{"FeatureName":"VirtualMachinePlatform","State":2}"#;
        assert_eq!(parse_feature_states(raw).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_feature_states_garbage() {
        assert!(matches!(
            parse_feature_states(b"Get-WindowsOptionalFeature : Access denied"),
            Err(ProbeFailure::Unparseable(_))
        ));
        assert!(parse_feature_states(b"  ").is_err());
    }

    #[test]
    fn test_tool_error_conversion() {
        let failure: ProbeFailure = ToolError::Timeout {
            program: "wsl.exe".to_string(),
            secs: 15,
        }
        .into();
        assert_eq!(
            failure,
            ProbeFailure::Timeout {
                program: "wsl.exe".to_string(),
                secs: 15
            }
        );
    }

    #[test]
    fn test_feature_query_filters_full_list() {
        let probe = HostProbe::new(&Config::default(), reqwest::Client::new());
        assert_eq!(
            probe.feature_query_script(),
            "$names = @('VirtualMachinePlatform', 'Microsoft-Windows-Subsystem-Linux'); \
             Get-WindowsOptionalFeature -Online | Where-Object { $_.FeatureName -in $names } | \
             Select-Object FeatureName,State | ConvertTo-Json -Compress"
        );
    }

    #[test]
    fn test_feature_query_never_binds_feature_name() {
        let mut config = Config::default();
        config.features.hypervisor = "O'Brien".to_string();
        let script = HostProbe::new(&config, reqwest::Client::new()).feature_query_script();
        assert!(!script.contains("-FeatureName"));
        assert!(script.contains("'O''Brien'"));
    }

    #[tokio::test]
    async fn test_fake_probe_counts_and_updates() {
        let fake = FakeSystemProbe::new();
        assert_eq!(fake.features_enabled().await, Ok(false));
        assert!(fake.subsystem_major().await.is_err());

        fake.set_subsystem(Some(2));
        assert_eq!(fake.subsystem_major().await, Ok(2));
        assert_eq!(fake.call_counts(), (1, 2, 0));
    }

    #[cfg(unix)]
    mod host {
        use super::*;
        use crate::tool::ToolCommand;

        fn config_with(tools: ToolsConfig) -> Config {
            let mut config = Config::default();
            config.tools = tools;
            config.probes.engine_window_secs = 1;
            config.probes.engine_retry_ms = 100;
            config.probes.timeout_secs = 5;
            config
        }

        fn sh(script: &str) -> ToolCommand {
            ToolCommand::new("sh", ["-c", script])
        }

        #[tokio::test]
        async fn test_host_features_enabled() {
            let tools = ToolsConfig {
                // The query script is appended as $0 and ignored
                feature_query: sh(
                    r#"echo '[{"FeatureName":"VirtualMachinePlatform","State":2},{"FeatureName":"Microsoft-Windows-Subsystem-Linux","State":2}]'"#,
                ),
                ..ToolsConfig::default()
            };
            let probe = HostProbe::new(&config_with(tools), reqwest::Client::new());
            assert_eq!(probe.features_enabled().await, Ok(true));
        }

        #[tokio::test]
        async fn test_host_features_one_disabled() {
            let tools = ToolsConfig {
                feature_query: sh(
                    r#"echo '[{"FeatureName":"VirtualMachinePlatform","State":2},{"FeatureName":"Microsoft-Windows-Subsystem-Linux","State":6}]'"#,
                ),
                ..ToolsConfig::default()
            };
            let probe = HostProbe::new(&config_with(tools), reqwest::Client::new());
            assert_eq!(probe.features_enabled().await, Ok(false));
        }

        #[tokio::test]
        async fn test_host_subsystem_major() {
            let tools = ToolsConfig {
                subsystem_version: sh(r"printf 'WSL version: 2.5.10.0\r\nKernel version: 6.6\r\n'"),
                ..ToolsConfig::default()
            };
            let probe = HostProbe::new(&config_with(tools), reqwest::Client::new());
            assert_eq!(probe.subsystem_major().await, Ok(2));
        }

        #[tokio::test]
        async fn test_host_subsystem_missing_tool() {
            let tools = ToolsConfig {
                subsystem_version: ToolCommand::new("hostprep-missing-wsl", ["--version"]),
                ..ToolsConfig::default()
            };
            let probe = HostProbe::new(&config_with(tools), reqwest::Client::new());
            assert!(matches!(
                probe.subsystem_major().await,
                Err(ProbeFailure::Spawn { .. })
            ));
        }

        #[tokio::test]
        async fn test_host_engine_gives_up_after_window() {
            let tools = ToolsConfig {
                engine_version: sh("echo 'Cannot connect to the Docker daemon' >&2; exit 1"),
                ..ToolsConfig::default()
            };
            let probe = HostProbe::new(&config_with(tools), reqwest::Client::new());

            let started = std::time::Instant::now();
            let result = probe.engine_version().await;
            assert!(matches!(result, Err(ProbeFailure::NonZeroExit { .. })));
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn test_host_engine_cli_version() {
            let tools = ToolsConfig {
                engine_version: sh("echo 27.0.3"),
                ..ToolsConfig::default()
            };
            let probe = HostProbe::new(&config_with(tools), reqwest::Client::new());
            assert_eq!(probe.engine_version().await, Ok("27.0.3".to_string()));
        }
    }
}
