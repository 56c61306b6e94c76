//! Device positioning capability: permission requests and the continuous
//! position watch the shell feeds back as a stream.

use crux_core::capability::{Capability, CapabilityContext, Operation};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone)]
pub struct Location<E> {
    context: CapabilityContext<LocationOperation, E>,
}

impl<Ev> Capability<Ev> for Location<Ev> {
    type Operation = LocationOperation;
    type MappedSelf<MappedEv> = Location<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Location::new(self.context.map_event(f))
    }
}

impl<E> Location<E>
where
    E: Send + 'static,
{
    pub fn new(context: CapabilityContext<LocationOperation, E>) -> Self {
        Self { context }
    }

    /// Asks the shell for positioning permission. Resolves once with the
    /// platform's decision.
    pub fn request_permission<F>(&self, make_event: F)
    where
        F: FnOnce(PermissionOutcome) -> E + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let outcome = context
                .request_from_shell(LocationOperation::RequestPermission)
                .await;
            if let LocationResponse::Permission(outcome) = outcome {
                context.update_app(make_event(outcome));
            }
        });
    }

    /// Starts a position watch. The shell keeps resolving the same request
    /// with fixes (or watch errors) until [`Self::clear_watch`] is called.
    pub fn watch_position<F>(&self, time_interval_ms: u64, distance_interval_m: u32, make_event: F)
    where
        F: Fn(Result<GpsFix, WatchError>) -> E + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let mut fixes = context.stream_from_shell(LocationOperation::WatchPosition {
                time_interval_ms,
                distance_interval_m,
            });
            while let Some(response) = fixes.next().await {
                if let LocationResponse::Fix(fix) = response {
                    context.update_app(make_event(fix));
                }
            }
        });
    }

    /// Tears down the active watch on the shell side.
    pub fn clear_watch(&self) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(LocationOperation::ClearWatch).await;
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LocationOperation {
    RequestPermission,
    WatchPosition {
        time_interval_ms: u64,
        distance_interval_m: u32,
    },
    ClearWatch,
}

impl Operation for LocationOperation {
    type Output = LocationResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LocationResponse {
    Permission(PermissionOutcome),
    Fix(Result<GpsFix, WatchError>),
}

/// The platform's answer to a permission request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    Denied,
    /// Parental controls or an MDM profile block the request outright.
    Restricted,
}

/// One fix from the platform's location services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters, when the platform reports one.
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchError {
    #[error("location services are disabled")]
    ServicesDisabled,
    #[error("position unavailable: {0}")]
    Unavailable(String),
}
