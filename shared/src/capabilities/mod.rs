mod feed;
mod location;
mod telemetry;
mod timer;

pub use self::feed::{Feed, FeedDevice, FeedOperation, FeedSnapshot};
pub use self::location::{
    GpsFix, Location, LocationOperation, LocationResponse, PermissionOutcome, WatchError,
};
pub use self::telemetry::{Telemetry, TelemetryOperation, TelemetryRecord};
pub use self::timer::{Timer, TimerOperation, TimerOutput};

pub use crux_core::render::Render;
pub use crux_http::Http;
pub use crux_kv::KeyValue;

use crate::{App, Event};

pub type AppRender = Render<Event>;
pub type AppHttp = Http<Event>;
pub type AppKv = KeyValue<Event>;
pub type AppLocation = Location<Event>;
pub type AppTimer = Timer<Event>;
pub type AppFeed = Feed<Event>;
pub type AppTelemetry = Telemetry<Event>;

// The derive names each Effect variant after the field's written
// capability type, so the fields spell the generics out.
#[derive(crux_core::macros::Effect)]
#[effect(app = "App")]
pub struct Capabilities {
    pub render: Render<Event>,
    pub http: Http<Event>,
    pub key_value: KeyValue<Event>,
    pub location: Location<Event>,
    pub timer: Timer<Event>,
    pub feed: Feed<Event>,
    pub telemetry: Telemetry<Event>,
}
