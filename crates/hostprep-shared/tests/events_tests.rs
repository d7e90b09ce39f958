//! Tests for the provisioning event union and its transport names.

use hostprep_shared::{
    CompletionResult, DownloadStatus, EventEnvelope, FailureKind, FeaturePhase, Package,
    ProvisionEvent, StepError,
};

#[test]
fn test_feature_transport_names() {
    let progress = ProvisionEvent::FeatureProgress {
        phase: FeaturePhase::Hypervisor,
        percent: 12.5,
    };
    assert_eq!(progress.transport_name(), "vmp-event");

    let complete = ProvisionEvent::FeatureComplete {
        phase: FeaturePhase::Subsystem,
        success: true,
    };
    assert_eq!(complete.transport_name(), "wsl-event-complete");

    let error = ProvisionEvent::FeatureError {
        phase: FeaturePhase::Subsystem,
        error: StepError::new(FailureKind::ToolOutput, "boom"),
    };
    assert_eq!(error.transport_name(), "wsl-event");
}

#[test]
fn test_install_transport_names() {
    let started = ProvisionEvent::DownloadStarted {
        package: Package::Subsystem,
        status: DownloadStatus::new(10),
    };
    assert_eq!(started.transport_name(), "wsl-install-started");

    let progress = ProvisionEvent::DownloadProgress {
        package: Package::Engine,
        status: DownloadStatus {
            total: 10,
            downloaded: 5,
            error: None,
        },
    };
    assert_eq!(progress.transport_name(), "docker-install-event");

    let failed = ProvisionEvent::InstallError {
        package: Package::Engine,
        error: StepError::new(FailureKind::Download, "connection reset"),
    };
    // Errors share the progress channel, as the presentation layer expects
    assert_eq!(failed.transport_name(), "docker-install-event");

    let done = ProvisionEvent::InstallComplete {
        package: Package::Subsystem,
        result: CompletionResult {
            needs_restart: true,
        },
    };
    assert_eq!(done.transport_name(), "wsl-install-complete");
}

#[test]
fn test_envelope_json_shape() {
    let event = ProvisionEvent::InstallComplete {
        package: Package::Subsystem,
        result: CompletionResult {
            needs_restart: true,
        },
    };
    let json = event.to_envelope().to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(value["name"], "wsl-install-complete");
    assert_eq!(value["event"]["type"], "install_complete");
    assert_eq!(value["event"]["package"], "subsystem");
    assert_eq!(value["event"]["result"]["needs_restart"], true);
}

#[test]
fn test_envelope_parses_back() {
    let line = r#"{"name":"vmp-event","event":{"type":"feature_error","phase":"hypervisor","error":{"kind":"tool_output","code":"0x800f0954","message":"Error: 0x800f0954"}}}"#;
    let envelope = EventEnvelope::from_json(line).unwrap();

    assert_eq!(envelope.name, "vmp-event");
    let error = envelope.event.error().unwrap();
    assert_eq!(error.kind, FailureKind::ToolOutput);
    assert_eq!(error.code.as_deref(), Some("0x800f0954"));
}

#[test]
fn test_error_code_omitted_when_absent() {
    let error = StepError::new(FailureKind::ToolSpawn, "dism.exe not found");
    let json = serde_json::to_string(&error).unwrap();
    assert!(!json.contains("code"));
}

#[test]
fn test_is_error() {
    let ok = ProvisionEvent::FeatureComplete {
        phase: FeaturePhase::Hypervisor,
        success: false,
    };
    assert!(!ok.is_error());

    let err = ProvisionEvent::InstallError {
        package: Package::Subsystem,
        error: StepError::new(FailureKind::ExitCode, "exit 1").with_code("1"),
    };
    assert!(err.is_error());
}
