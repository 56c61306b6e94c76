//! One-shot timers driven by the shell. Every timer carries a caller-chosen
//! id so a later cancel (or a stale fire) can be matched up again.

use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct Timer<E> {
    context: CapabilityContext<TimerOperation, E>,
}

impl<Ev> Capability<Ev> for Timer<Ev> {
    type Operation = TimerOperation;
    type MappedSelf<MappedEv> = Timer<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Timer::new(self.context.map_event(f))
    }
}

impl<E> Timer<E>
where
    E: Send + 'static,
{
    pub fn new(context: CapabilityContext<TimerOperation, E>) -> Self {
        Self { context }
    }

    /// Arms a one-shot timer. The event fires only if the shell reports the
    /// timer as fired; a cancelled timer produces no event.
    pub fn after<F>(&self, id: u64, millis: u64, make_event: F)
    where
        F: FnOnce(u64) -> E + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let output = context
                .request_from_shell(TimerOperation::Start { id, millis })
                .await;
            if let TimerOutput::Fired { id } = output {
                context.update_app(make_event(id));
            }
        });
    }

    /// Cancels a previously armed timer. Cancelling an unknown or already
    /// fired id is a no-op on the shell side.
    pub fn cancel(&self, id: u64) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(TimerOperation::Cancel { id }).await;
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimerOperation {
    Start { id: u64, millis: u64 },
    Cancel { id: u64 },
}

impl Operation for TimerOperation {
    type Output = TimerOutput;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimerOutput {
    Fired { id: u64 },
    Cancelled { id: u64 },
}
