//! Fire-and-forget telemetry. Records are handed to the shell, which owns
//! batching and delivery; nothing ever flows back into the core.

use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct Telemetry<E> {
    context: CapabilityContext<TelemetryOperation, E>,
}

impl<Ev> Capability<Ev> for Telemetry<Ev> {
    type Operation = TelemetryOperation;
    type MappedSelf<MappedEv> = Telemetry<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Telemetry::new(self.context.map_event(f))
    }
}

impl<E> Telemetry<E>
where
    E: Send + 'static,
{
    pub fn new(context: CapabilityContext<TelemetryOperation, E>) -> Self {
        Self { context }
    }

    pub fn event(&self, name: &str, fields: &[(&str, &str)]) {
        self.record(TelemetryRecord::Event {
            name: name.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        });
    }

    pub fn counter(&self, name: &str, value: u64) {
        self.record(TelemetryRecord::Counter {
            name: name.to_string(),
            value,
        });
    }

    pub fn error(&self, code: &str, message: &str) {
        self.record(TelemetryRecord::Error {
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    fn record(&self, record: TelemetryRecord) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context
                .notify_shell(TelemetryOperation::Record(record))
                .await;
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TelemetryOperation {
    Record(TelemetryRecord),
}

impl Operation for TelemetryOperation {
    type Output = ();
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TelemetryRecord {
    Event {
        name: String,
        fields: Vec<(String, String)>,
    },
    Counter {
        name: String,
        value: u64,
    },
    Error {
        code: String,
        message: String,
    },
}
