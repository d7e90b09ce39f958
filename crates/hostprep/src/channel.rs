//! Event channel between a step driver and its consumer.
//!
//! One producer (the driver task) and one logical subscriber per step
//! execution. The receiver exists before the driver starts, so nothing is
//! missed; there is no replay for a second subscriber. The channel closes
//! when the driver finishes, which is the consumer's end-of-step signal.

use hostprep_shared::{ProvisionEvent, StepError};
use tokio::sync::mpsc;
use tracing::debug;

/// Buffered events before the driver waits for the consumer
pub const CHANNEL_CAPACITY: usize = 256;

/// Create a connected sink/channel pair
pub fn event_channel() -> (EventSink, EventChannel) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (EventSink { tx }, EventChannel { rx })
}

/// Producer half, held by the driver
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ProvisionEvent>,
}

impl EventSink {
    /// Deliver an event. A vanished subscriber is not an error for the driver.
    pub async fn emit(&self, event: ProvisionEvent) {
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event).await {
            debug!("subscriber gone, dropping {}", event.transport_name());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, returned by `execute_step`
#[derive(Debug)]
pub struct EventChannel {
    rx: mpsc::Receiver<ProvisionEvent>,
}

impl EventChannel {
    /// Next event, `None` once the driver has finished
    pub async fn recv(&mut self) -> Option<ProvisionEvent> {
        self.rx.recv().await
    }

    /// Drive the channel to completion, handing every event to `on_event`.
    pub async fn subscribe<F>(mut self, mut on_event: F) -> StepSummary
    where
        F: FnMut(&ProvisionEvent),
    {
        let mut summary = StepSummary::default();
        while let Some(event) = self.rx.recv().await {
            on_event(&event);
            summary.record(&event);
        }
        summary
    }

    /// Collect every event until the driver finishes
    pub async fn collect(mut self) -> Vec<ProvisionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

/// What a consumer saw over one step execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepSummary {
    pub events: usize,
    pub errors: Vec<StepError>,
    pub needs_restart: bool,
    /// At least one install or feature phase reported completion
    pub completed: bool,
}

impl StepSummary {
    fn record(&mut self, event: &ProvisionEvent) {
        self.events += 1;
        match event {
            ProvisionEvent::FeatureError { error, .. } | ProvisionEvent::InstallError { error, .. } => {
                self.errors.push(error.clone());
            }
            ProvisionEvent::FeatureComplete { success: true, .. } => {
                self.completed = true;
            }
            ProvisionEvent::InstallComplete { result, .. } => {
                self.completed = true;
                self.needs_restart |= result.needs_restart;
            }
            _ => {}
        }
    }

    pub fn succeeded(&self) -> bool {
        self.completed && self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostprep_shared::{CompletionResult, FailureKind, FeaturePhase, Package};

    #[tokio::test]
    async fn test_channel_closes_when_sink_dropped() {
        let (sink, channel) = event_channel();
        tokio::spawn(async move {
            sink.emit(ProvisionEvent::FeatureProgress {
                phase: FeaturePhase::Hypervisor,
                percent: 10.0,
            })
            .await;
        });

        let events = channel.collect().await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_emit_after_subscriber_dropped_does_not_panic() {
        let (sink, channel) = event_channel();
        drop(channel);
        assert!(sink.is_closed());
        sink.emit(ProvisionEvent::FeatureComplete {
            phase: FeaturePhase::Hypervisor,
            success: true,
        })
        .await;
    }

    #[tokio::test]
    async fn test_subscribe_summarizes() {
        let (sink, channel) = event_channel();
        tokio::spawn(async move {
            sink.emit(ProvisionEvent::InstallComplete {
                package: Package::Subsystem,
                result: CompletionResult {
                    needs_restart: true,
                },
            })
            .await;
        });

        let mut seen = Vec::new();
        let summary = channel.subscribe(|e| seen.push(e.transport_name())).await;
        assert_eq!(seen, vec!["wsl-install-complete".to_string()]);
        assert!(summary.succeeded());
        assert!(summary.needs_restart);
    }

    #[tokio::test]
    async fn test_subscribe_records_errors() {
        let (sink, channel) = event_channel();
        tokio::spawn(async move {
            sink.emit(ProvisionEvent::InstallError {
                package: Package::Engine,
                error: StepError::new(FailureKind::Download, "reset"),
            })
            .await;
        });

        let summary = channel.subscribe(|_| {}).await;
        assert!(!summary.succeeded());
        assert_eq!(summary.errors.len(), 1);
    }
}
