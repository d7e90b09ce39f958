//! In-memory provisioner.
//!
//! Emits the same event shapes as the real drivers on a timer and keeps a
//! tiny host state, so consumers can be exercised end to end on any OS.
//! A failure scenario fails its action once; running the action again
//! succeeds.

use async_trait::async_trait;
use hostprep_shared::{
    CompletionResult, DownloadStatus, FailureKind, FeaturePhase, HostprepError, Package,
    ProvisionEvent, Step, StepError,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channel::{event_channel, EventChannel, EventSink};
use crate::config::SimulationConfig;
use crate::controller::Provisioner;

const SUBSYSTEM_BYTES: u64 = 150 * 1024 * 1024;
const ENGINE_BYTES: u64 = 650 * 1024 * 1024;
const DOWNLOAD_TICKS: u64 = 8;
const FEATURE_INCREMENT: f64 = 12.5;
const FEATURE_FAIL_AT: f64 = 50.0;
const DOWNLOAD_FAIL_AT_PERCENT: u64 = 25;

/// Simulated host behaviour
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Every action succeeds
    #[default]
    Happy,
    /// The subsystem install asks for a restart
    NeedsRestart,
    /// The hypervisor feature reports an error
    FeatureFail,
    /// The subsystem download breaks off
    SubsystemFail,
    /// The engine download breaks off
    EngineFail,
}

#[derive(Debug, Default)]
struct SimState {
    features: bool,
    subsystem: bool,
    engine: bool,
    failure_spent: bool,
}

#[derive(Debug, Clone)]
struct Simulation {
    scenario: Scenario,
    tick: Duration,
    state: Arc<Mutex<SimState>>,
}

impl Simulation {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once for the matching scenario
    fn take_failure(&self, scenario: Scenario) -> bool {
        if self.scenario != scenario {
            return false;
        }
        let mut state = self.state();
        !std::mem::replace(&mut state.failure_spent, true)
    }

    async fn tick(&self) {
        if !self.tick.is_zero() {
            tokio::time::sleep(self.tick).await;
        }
    }

    async fn enable_features(&self, sink: &EventSink) {
        for phase in [FeaturePhase::Hypervisor, FeaturePhase::Subsystem] {
            let fail = phase == FeaturePhase::Hypervisor && self.take_failure(Scenario::FeatureFail);
            sink.emit(ProvisionEvent::FeatureLog {
                phase,
                text: "Enabling feature(s)\r\n".to_string(),
            })
            .await;

            let mut percent = 0.0;
            let success = loop {
                self.tick().await;
                percent = f64::min(percent + FEATURE_INCREMENT, 100.0);
                sink.emit(ProvisionEvent::FeatureProgress { phase, percent })
                    .await;

                if fail && percent >= FEATURE_FAIL_AT {
                    let error = StepError::new(
                        FailureKind::ToolOutput,
                        "Error: 0x800f0954 The feature could not be enabled.",
                    )
                    .with_code("0x800f0954");
                    sink.emit(ProvisionEvent::FeatureError { phase, error }).await;
                    break false;
                }
                if percent >= 100.0 {
                    break true;
                }
            };

            sink.emit(ProvisionEvent::FeatureComplete { phase, success })
                .await;
            if !success {
                warn!("Simulated {} feature failure", phase);
                return;
            }
        }
        self.state().features = true;
    }

    async fn install(&self, package: Package, sink: &EventSink) {
        let (total, failure, message) = match package {
            Package::Subsystem => (
                SUBSYSTEM_BYTES,
                Scenario::SubsystemFail,
                "Network error downloading WSL package.",
            ),
            Package::Engine => (
                ENGINE_BYTES,
                Scenario::EngineFail,
                "Network error downloading Docker installer.",
            ),
        };
        let fail = self.take_failure(failure);
        let chunk = (total / DOWNLOAD_TICKS).max(1);

        let mut status = DownloadStatus::new(total);
        sink.emit(ProvisionEvent::DownloadStarted {
            package,
            status: status.clone(),
        })
        .await;

        while status.downloaded < total {
            self.tick().await;
            status.downloaded = (status.downloaded + chunk).min(total);

            if fail && status.downloaded * 100 >= total * DOWNLOAD_FAIL_AT_PERCENT {
                warn!("Simulated {} download failure", package);
                sink.emit(ProvisionEvent::DownloadProgress {
                    package,
                    status: status.failed(message),
                })
                .await;
                sink.emit(ProvisionEvent::InstallError {
                    package,
                    error: StepError::new(FailureKind::Download, message),
                })
                .await;
                return;
            }
            sink.emit(ProvisionEvent::DownloadProgress {
                package,
                status: status.clone(),
            })
            .await;
        }

        let needs_restart = package == Package::Subsystem && self.scenario == Scenario::NeedsRestart;
        {
            let mut state = self.state();
            match package {
                Package::Subsystem => state.subsystem = true,
                Package::Engine => state.engine = true,
            }
        }
        sink.emit(ProvisionEvent::InstallComplete {
            package,
            result: CompletionResult { needs_restart },
        })
        .await;
    }
}

/// Provisioner that simulates a Windows host
pub struct SimulatedProvisioner {
    sim: Simulation,
}

impl SimulatedProvisioner {
    pub fn new(settings: SimulationConfig) -> Self {
        info!("Using simulated host ({:?})", settings.scenario);
        Self {
            sim: Simulation {
                scenario: settings.scenario,
                tick: Duration::from_millis(settings.tick_ms),
                state: Arc::new(Mutex::new(SimState::default())),
            },
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.sim.scenario
    }
}

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    async fn probe_current_step(&self) -> Step {
        let state = self.sim.state();
        if !state.features {
            Step::NeedFeatures
        } else if !state.subsystem {
            Step::NeedSubsystem
        } else if !state.engine {
            Step::NeedEngine
        } else {
            Step::Complete
        }
    }

    async fn execute_step(&self, action: u32) -> Result<EventChannel, HostprepError> {
        let step = Step::from_action_number(action).ok_or(HostprepError::InvalidStep(action))?;
        info!("Simulating step {} ({})", action, step.title());

        let (sink, channel) = event_channel();
        let sim = self.sim.clone();
        tokio::spawn(async move {
            match step {
                Step::NeedFeatures => sim.enable_features(&sink).await,
                Step::NeedSubsystem => sim.install(Package::Subsystem, &sink).await,
                Step::NeedEngine => sim.install(Package::Engine, &sink).await,
                Step::Complete => {}
            }
        });
        Ok(channel)
    }

    async fn request_immediate_reboot(&self) -> Result<(), HostprepError> {
        info!("Simulated restart; host state is kept");
        Ok(())
    }

    async fn clear_resume(&self) {
        debug!("Simulated resume registration cleared");
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(scenario: Scenario) -> SimulatedProvisioner {
        SimulatedProvisioner::new(SimulationConfig {
            scenario,
            tick_ms: 0,
        })
    }

    #[tokio::test]
    async fn test_happy_flow_advances_each_step() {
        let sim = instant(Scenario::Happy);
        for expected in [Step::NeedFeatures, Step::NeedSubsystem, Step::NeedEngine] {
            let step = sim.probe_current_step().await;
            assert_eq!(step, expected);
            let action = step.action_number().unwrap();
            let summary = sim.execute_step(action).await.unwrap().subscribe(|_| {}).await;
            assert!(summary.succeeded());
            assert!(!summary.needs_restart);
        }
        assert_eq!(sim.probe_current_step().await, Step::Complete);
    }

    #[tokio::test]
    async fn test_feature_fail_blocks_second_phase_once() {
        let sim = instant(Scenario::FeatureFail);
        let events = sim.execute_step(1).await.unwrap().collect().await;

        let completions: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProvisionEvent::FeatureComplete { .. }))
            .collect();
        assert_eq!(
            completions,
            vec![&ProvisionEvent::FeatureComplete {
                phase: FeaturePhase::Hypervisor,
                success: false
            }]
        );
        assert!(!events.iter().any(|e| matches!(
            e,
            ProvisionEvent::FeatureProgress {
                phase: FeaturePhase::Subsystem,
                ..
            }
        )));
        assert_eq!(sim.probe_current_step().await, Step::NeedFeatures);

        // Retry succeeds
        let summary = sim.execute_step(1).await.unwrap().subscribe(|_| {}).await;
        assert!(summary.succeeded());
        assert_eq!(sim.probe_current_step().await, Step::NeedSubsystem);
    }

    #[tokio::test]
    async fn test_needs_restart_on_subsystem() {
        let sim = instant(Scenario::NeedsRestart);
        sim.execute_step(1).await.unwrap().collect().await;
        let summary = sim.execute_step(2).await.unwrap().subscribe(|_| {}).await;
        assert!(summary.needs_restart);
    }

    #[tokio::test]
    async fn test_engine_download_failure() {
        let sim = instant(Scenario::EngineFail);
        let summary = sim.execute_step(3).await.unwrap().subscribe(|_| {}).await;
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].kind, FailureKind::Download);
        assert!(!summary.completed);
    }

    #[tokio::test]
    async fn test_broken_download_status_carries_error() {
        let sim = instant(Scenario::SubsystemFail);
        let events = sim.execute_step(2).await.unwrap().collect().await;

        let n = events.len();
        assert!(events[n - 1].is_error());
        match &events[n - 2] {
            ProvisionEvent::DownloadProgress { status, .. } => {
                assert!(status.error.is_some());
                assert!(status.downloaded < SUBSYSTEM_BYTES);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_progress_is_cumulative() {
        let sim = instant(Scenario::Happy);
        let events = sim.execute_step(2).await.unwrap().collect().await;
        let downloaded: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ProvisionEvent::DownloadProgress { status, .. } => Some(status.downloaded),
                _ => None,
            })
            .collect();
        assert_eq!(downloaded.len() as u64, DOWNLOAD_TICKS);
        assert!(downloaded.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(downloaded.last(), Some(&SUBSYSTEM_BYTES));
    }

    #[tokio::test]
    async fn test_invalid_action() {
        let sim = instant(Scenario::Happy);
        assert!(matches!(
            sim.execute_step(0).await,
            Err(HostprepError::InvalidStep(0))
        ));
    }
}
