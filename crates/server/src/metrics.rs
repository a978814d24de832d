//! Prometheus metrics for the stratus server.

use prometheus::{CounterVec, IntCounter, Opts, Registry, TextEncoder};
use stratus_core::{OperationKind, OperationStatus};
use stratus_ports::{EventReceiver, LifecycleEvent};
use tracing::debug;

/// Registry plus the counter handles the server increments.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    operations_created: CounterVec,
    operations_finished: CounterVec,
    orchestrations_created: IntCounter,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let operations_created = CounterVec::new(
            Opts::new(
                "stratus_operations_created_total",
                "Lifecycle operations accepted",
            ),
            &["kind"],
        )?;
        let operations_finished = CounterVec::new(
            Opts::new(
                "stratus_operations_finished_total",
                "Lifecycle operations finished",
            ),
            &["kind", "status"],
        )?;
        let orchestrations_created = IntCounter::new(
            "stratus_orchestrations_created_total",
            "Orchestrations accepted",
        )?;

        registry.register(Box::new(operations_created.clone()))?;
        registry.register(Box::new(operations_finished.clone()))?;
        registry.register(Box::new(orchestrations_created.clone()))?;

        Ok(Self {
            registry,
            operations_created,
            operations_finished,
            orchestrations_created,
        })
    }

    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&self.registry.gather())
    }

    pub fn operation_created(&self, kind: OperationKind) {
        self.operations_created
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn operation_finished(&self, kind: OperationKind, status: OperationStatus) {
        self.operations_finished
            .with_label_values(&[kind.as_str(), status.as_str()])
            .inc();
    }

    pub fn orchestration_created(&self) {
        self.orchestrations_created.inc();
    }

    /// Feed finished-operation counters from the event bus until the bus
    /// closes.
    pub fn observe(self, mut receiver: EventReceiver) {
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                if let LifecycleEvent::OperationFinished { kind, status, .. } = event {
                    self.operation_finished(kind, status);
                }
            }
            debug!("metrics event listener stopped");
        });
    }
}
