//! Host provisioning engine.
//!
//! Brings a Windows host from "nothing installed" to "container engine
//! running" in three resumable actions: enable the hypervisor and Linux
//! subsystem features, install the subsystem update package, install the
//! container engine. The current step is always recomputed from live
//! probes, and every action reports through an [`EventChannel`].

pub mod channel;
pub mod config;
pub mod controller;
pub mod installer;
pub mod logging;
pub mod parser;
pub mod probe;
pub mod simulated;
pub mod toggler;
pub mod tool;

pub use channel::{event_channel, EventChannel, EventSink, StepSummary};
pub use config::{Backend, Config};
pub use controller::{select_provisioner, Provisioner, WindowsProvisioner};
pub use installer::{ExitPolicy, PackageSpec, StreamingInstaller};
pub use parser::ToolOutputParser;
pub use probe::{FakeSystemProbe, HostProbe, ProbeFailure, SystemProbe};
pub use simulated::{Scenario, SimulatedProvisioner};
pub use toggler::FeatureToggler;
pub use tool::{ToolCommand, ToolError};
