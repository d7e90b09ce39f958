//! Provisioning controller.
//!
//! The [`Provisioner`] trait is the whole contract a consumer sees: compute
//! the current step from live probes, start one action, or restart the
//! host. [`WindowsProvisioner`] drives the real tools; the simulated
//! backend fakes the same contract in memory. [`select_provisioner`] picks
//! one once at startup.

use async_trait::async_trait;
use hostprep_shared::{HostprepError, Package, Step};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channel::EventChannel;
use crate::config::{Backend, Config};
use crate::installer::StreamingInstaller;
use crate::probe::{HostProbe, SystemProbe};
use crate::simulated::SimulatedProvisioner;
use crate::toggler::FeatureToggler;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Step state machine over a host
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Least-satisfied prerequisite. Never fails: a probe that cannot
    /// answer counts as "not satisfied".
    async fn probe_current_step(&self) -> Step;

    /// Start the action with the given 1-based number and return its
    /// events. Runtime failures arrive on the channel; only an out-of-range
    /// number is rejected here.
    async fn execute_step(&self, action: u32) -> Result<EventChannel, HostprepError>;

    /// Arrange a resume at next logon, then restart the host now
    async fn request_immediate_reboot(&self) -> Result<(), HostprepError>;

    /// Drop the resume-at-logon registration once nothing is left to do.
    /// Failures are logged only.
    async fn clear_resume(&self);

    /// Backend name for logs and status output
    fn name(&self) -> &'static str;
}

/// Pick the provisioner for this host
pub fn select_provisioner(config: &Config) -> Result<Arc<dyn Provisioner>, HostprepError> {
    let backend = match config.backend {
        Backend::Auto if cfg!(windows) => Backend::Windows,
        Backend::Auto => {
            return Err(HostprepError::UnsupportedPlatform(
                std::env::consts::OS.to_string(),
            ))
        }
        other => other,
    };
    debug!("Selected {:?} backend", backend);

    match backend {
        Backend::Simulated => Ok(Arc::new(SimulatedProvisioner::new(
            config.simulation.clone(),
        ))),
        _ => Ok(Arc::new(WindowsProvisioner::new(config.clone())?)),
    }
}

/// Provisioner for a Windows host
pub struct WindowsProvisioner {
    config: Config,
    probe: Arc<dyn SystemProbe>,
    toggler: FeatureToggler,
    client: reqwest::Client,
}

impl WindowsProvisioner {
    /// Probe the real host
    pub fn new(config: Config) -> Result<Self, HostprepError> {
        let client = http_client()?;
        let probe = Arc::new(HostProbe::new(&config, client.clone()));
        Ok(Self::with_probe(config, probe, client))
    }

    /// Use a custom probe (fake in tests)
    pub fn with_probe(config: Config, probe: Arc<dyn SystemProbe>, client: reqwest::Client) -> Self {
        let toggler = FeatureToggler::from_config(&config);
        Self {
            config,
            probe,
            toggler,
            client,
        }
    }

    fn installer(&self, package: Package) -> EventChannel {
        let spec = match package {
            Package::Subsystem => &self.config.subsystem,
            Package::Engine => &self.config.engine,
        };
        let destination = self.config.payload_path(spec);
        StreamingInstaller::new(package, spec.clone(), self.client.clone()).start(&destination)
    }
}

/// Client shared by downloads and the engine endpoint probe
pub fn http_client() -> Result<reqwest::Client, HostprepError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("hostprep/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| HostprepError::Config(format!("HTTP client: {}", e)))
}

#[async_trait]
impl Provisioner for WindowsProvisioner {
    async fn probe_current_step(&self) -> Step {
        match self.probe.features_enabled().await {
            Ok(true) => {}
            Ok(false) => {
                info!("Required Windows features are not enabled");
                return Step::NeedFeatures;
            }
            Err(e) => {
                warn!("Feature probe failed, assuming not enabled: {}", e);
                return Step::NeedFeatures;
            }
        }

        let required = self.config.probes.subsystem_required_major;
        match self.probe.subsystem_major().await {
            Ok(major) if major >= required => debug!("subsystem major version {}", major),
            Ok(major) => {
                info!("Subsystem version {} is below {}", major, required);
                return Step::NeedSubsystem;
            }
            Err(e) => {
                warn!("Subsystem probe failed, assuming not installed: {}", e);
                return Step::NeedSubsystem;
            }
        }

        match self.probe.engine_version().await {
            Ok(version) => {
                debug!("engine version {}", version);
                Step::Complete
            }
            Err(e) => {
                warn!("Engine probe failed, assuming not installed: {}", e);
                Step::NeedEngine
            }
        }
    }

    async fn execute_step(&self, action: u32) -> Result<EventChannel, HostprepError> {
        let step = Step::from_action_number(action).ok_or(HostprepError::InvalidStep(action))?;
        info!("Executing step {} ({})", action, step.title());

        let features = &self.config.features;
        let channel = match step {
            Step::NeedFeatures => self.toggler.enable_virtualization_then_subsystem(
                &features.hypervisor,
                &features.subsystem,
                &[],
            ),
            Step::NeedSubsystem => self.installer(Package::Subsystem),
            Step::NeedEngine => self.installer(Package::Engine),
            Step::Complete => return Err(HostprepError::InvalidStep(action)),
        };
        Ok(channel)
    }

    async fn request_immediate_reboot(&self) -> Result<(), HostprepError> {
        let timeout = self.config.probes.timeout();

        match std::env::current_exe() {
            Ok(exe) => {
                let exe_path = exe.to_string_lossy();
                let autostart = self.config.tools.autostart.render(&[("exe", &*exe_path)]);
                match autostart.capture(timeout).await {
                    Ok(_) => info!("Registered {} to resume at next logon", exe.display()),
                    Err(e) => warn!("Could not register resume at logon: {}", e),
                }
            }
            Err(e) => warn!("Could not resolve current executable: {}", e),
        }

        let reboot = &self.config.tools.reboot;
        info!("Requesting restart: {}", reboot.display());
        reboot
            .capture(timeout)
            .await
            .map_err(|e| HostprepError::Reboot(e.to_string()))?;
        Ok(())
    }

    async fn clear_resume(&self) {
        let remove = &self.config.tools.autostart_remove;
        match remove.capture(self.config.probes.timeout()).await {
            Ok(_) => info!("Removed resume at logon"),
            // Nothing was registered when no restart was needed
            Err(e) => debug!("Resume at logon not removed: {}", e),
        }
    }

    fn name(&self) -> &'static str {
        "windows"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::FakeSystemProbe;

    fn provisioner(probe: Arc<FakeSystemProbe>) -> WindowsProvisioner {
        WindowsProvisioner::with_probe(Config::default(), probe, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_probe_order_stops_at_first_unmet() {
        let probe = Arc::new(FakeSystemProbe::new());
        let p = provisioner(probe.clone());
        assert_eq!(p.probe_current_step().await, Step::NeedFeatures);
        // Later probes are not consulted once one is unmet
        assert_eq!(probe.call_counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_subsystem_below_required_major() {
        let probe = Arc::new(
            FakeSystemProbe::new()
                .with_features(true)
                .with_subsystem(Some(1)),
        );
        assert_eq!(
            provisioner(probe).probe_current_step().await,
            Step::NeedSubsystem
        );
    }

    #[tokio::test]
    async fn test_fully_provisioned() {
        let probe = Arc::new(FakeSystemProbe::provisioned());
        assert_eq!(provisioner(probe).probe_current_step().await, Step::Complete);
    }

    #[tokio::test]
    async fn test_invalid_action_numbers() {
        let p = provisioner(Arc::new(FakeSystemProbe::new()));
        for action in [0, 4, 99] {
            match p.execute_step(action).await {
                Err(HostprepError::InvalidStep(n)) => assert_eq!(n, action),
                other => panic!("unexpected: {:?}", other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_auto_backend_off_windows() {
        if cfg!(windows) {
            return;
        }
        let err = select_provisioner(&Config::default()).err().unwrap();
        assert!(matches!(err, HostprepError::UnsupportedPlatform(_)));
    }

    #[test]
    fn test_simulated_backend_selected() {
        let mut config = Config::default();
        config.backend = Backend::Simulated;
        assert_eq!(select_provisioner(&config).unwrap().name(), "simulated");
    }
}
