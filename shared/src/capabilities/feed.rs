//! Realtime device feed. The shell owns the transport (typically a realtime
//! database connection); the core subscribes to snapshots of every tracked
//! device and publishes its own position onto the same channel.

use crux_core::capability::{Capability, CapabilityContext, Operation};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct Feed<E> {
    context: CapabilityContext<FeedOperation, E>,
}

impl<Ev> Capability<Ev> for Feed<Ev> {
    type Operation = FeedOperation;
    type MappedSelf<MappedEv> = Feed<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Feed::new(self.context.map_event(f))
    }
}

impl<E> Feed<E>
where
    E: Send + 'static,
{
    pub fn new(context: CapabilityContext<FeedOperation, E>) -> Self {
        Self { context }
    }

    /// Subscribes to the feed. The shell keeps resolving the same request
    /// with whole-feed snapshots until [`Self::unsubscribe`] is called.
    pub fn subscribe<F>(&self, make_event: F)
    where
        F: Fn(FeedSnapshot) -> E + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let mut snapshots = context.stream_from_shell(FeedOperation::Subscribe);
            while let Some(snapshot) = snapshots.next().await {
                context.update_app(make_event(snapshot));
            }
        });
    }

    /// Publishes this device's latest position to the feed.
    pub fn publish(&self, device: FeedDevice) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context
                .notify_shell(FeedOperation::Publish { device })
                .await;
        });
    }

    pub fn unsubscribe(&self) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(FeedOperation::Unsubscribe).await;
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FeedOperation {
    Subscribe,
    Publish { device: FeedDevice },
    Unsubscribe,
}

impl Operation for FeedOperation {
    type Output = FeedSnapshot;
}

/// One device's entry in the feed. Coordinates are unvalidated here; the
/// reducer validates before anything reaches the map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedDevice {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Provider timestamp, passed through untouched.
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// The complete current state of the feed. Snapshots replace each other
/// wholesale; there is no incremental diffing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedSnapshot {
    pub devices: Vec<FeedDevice>,
}
