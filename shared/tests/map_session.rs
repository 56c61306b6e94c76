use crux_core::testing::AppTester;
use crux_core::Request;
use crux_http::protocol::{HttpRequest, HttpResponse, HttpResult};
use crux_kv::error::KeyValueError;
use crux_kv::value::Value;
use crux_kv::{KeyValueOperation, KeyValueResponse, KeyValueResult};

use gpslink_core::capabilities::{
    FeedDevice, FeedOperation, FeedSnapshot, GpsFix, LocationOperation, LocationResponse,
    PermissionOutcome, TimerOperation, TimerOutput,
};
use gpslink_core::geo::{Region, ValidatedCoordinate, ZoomLevel};
use gpslink_core::places::PlacesProvider;
use gpslink_core::tracker::{LocationReading, ReadingId};
use gpslink_core::{
    App, CachedMapState, Effect, Event, HttpOutcome, LoadPhase, Model, SessionConfig, ToastKind,
    ViewState, DEFAULT_ZOOM_STEP, ROUTE_OVERVIEW_ZOOM_STEP,
};

#[derive(Default)]
struct Outgoing {
    http: Vec<Request<HttpRequest>>,
    kv: Vec<Request<KeyValueOperation>>,
    location: Vec<Request<LocationOperation>>,
    timers: Vec<Request<TimerOperation>>,
    feed: Vec<Request<FeedOperation>>,
    rendered: bool,
}

fn split_effects(effects: Vec<Effect>) -> Outgoing {
    let mut out = Outgoing::default();
    for effect in effects {
        match effect {
            Effect::Http(request) => out.http.push(request),
            Effect::KeyValue(request) => out.kv.push(request),
            Effect::Location(request) => out.location.push(request),
            Effect::Timer(request) => out.timers.push(request),
            Effect::Feed(request) => out.feed.push(request),
            Effect::Render(_) => out.rendered = true,
            Effect::Telemetry(_) => {}
        }
    }
    out
}

/// Runs every event produced by a resolved request back through the app
/// and collects the resulting effects.
fn feed(app: &AppTester<App, Effect>, model: &mut Model, events: Vec<Event>) -> Outgoing {
    let mut effects = Vec::new();
    for event in events {
        effects.extend(app.update(event, model).effects);
    }
    split_effects(effects)
}

fn armed_timer_id(request: &Request<TimerOperation>, expected_millis: u64) -> u64 {
    match &request.operation {
        TimerOperation::Start { id, millis } => {
            assert_eq!(*millis, expected_millis);
            *id
        }
        TimerOperation::Cancel { .. } => panic!("expected an armed timer"),
    }
}

fn take_start_timer(timers: Vec<Request<TimerOperation>>, millis: u64) -> Request<TimerOperation> {
    timers
        .into_iter()
        .find(|t| matches!(&t.operation, TimerOperation::Start { millis: m, .. } if *m == millis))
        .unwrap_or_else(|| panic!("no timer armed for {millis}ms"))
}

fn http_ok(body: &[u8]) -> HttpResult {
    HttpResult::Ok(HttpResponse::ok().body(body.to_vec()).build())
}

fn kv_found(bytes: Vec<u8>) -> KeyValueResult {
    KeyValueResult::Ok {
        response: KeyValueResponse::Get {
            value: Value::Bytes(bytes),
        },
    }
}

fn kv_missing() -> KeyValueResult {
    KeyValueResult::Ok {
        response: KeyValueResponse::Get { value: Value::None },
    }
}

fn coord(lat: f64, lon: f64) -> ValidatedCoordinate {
    ValidatedCoordinate::new(lat, lon).unwrap()
}

const READING_A: &[u8] =
    br#"{"latitude": "14.6300", "longitude": "121.1300", "id": "A", "dateTimeTrack": "2024-05-01 10:15:00"}"#;
const READING_B: &[u8] = br#"{"latitude": 14.64, "longitude": 121.14, "id": "B"}"#;

const ROUTE_THREE_POINTS: &[u8] = br#"{"code":"Ok","routes":[{"geometry":{"type":"LineString","coordinates":[[121.1224,14.6256],[121.126,14.628],[121.13,14.63]]}}]}"#;
const ROUTE_TWO_POINTS: &[u8] = br#"{"code":"Ok","routes":[{"geometry":{"type":"LineString","coordinates":[[121.1224,14.6256],[121.14,14.64]]}}]}"#;

#[test]
fn test_open_to_ready_and_staleness_walk() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    // 1. Opening the screen asks for the token, permission, and the feed.
    let update = app.update(
        Event::ScreenOpened(Box::new(SessionConfig::default())),
        &mut model,
    );
    let mut fx = split_effects(update.effects);
    assert!(fx.rendered);
    assert!(fx.http.is_empty());
    assert!(matches!(app.view(&model).state, ViewState::Loading));

    assert_eq!(fx.kv.len(), 1);
    let mut token_read = fx.kv.remove(0);
    assert_eq!(
        token_read.operation,
        KeyValueOperation::Get {
            key: "authToken".to_string()
        }
    );

    let mut permission = fx.location.remove(0);
    assert_eq!(permission.operation, LocationOperation::RequestPermission);

    let mut feed_sub = fx.feed.remove(0);
    assert_eq!(feed_sub.operation, FeedOperation::Subscribe);

    // 2. Token present: polling starts with an authorized fetch, a fetch
    // deadline, and the interval timer.
    let update = app
        .resolve(&mut token_read, kv_found(b"tok-123".to_vec()))
        .expect("token read resolves");
    let mut fx = feed(&app, &mut model, update.events);

    assert_eq!(fx.http.len(), 1);
    let mut tracker_http = fx.http.remove(0);
    assert_eq!(
        tracker_http.operation.url,
        "https://api.tracker.example.com/location/getcurrent"
    );
    assert!(tracker_http
        .operation
        .headers
        .iter()
        .any(|h| h.name == "authorization" && h.value == "Bearer tok-123"));

    let mut cache_read = fx.kv.remove(0);
    match &cache_read.operation {
        KeyValueOperation::Get { key } => assert!(key.starts_with("map/state/v1_")),
        other => panic!("expected the snapshot read, got {other:?}"),
    }

    let mut poll_timer = take_start_timer(fx.timers, 5_000);

    // 3. No snapshot for this user; nothing changes.
    let update = app
        .resolve(&mut cache_read, kv_missing())
        .expect("cache read resolves");
    let fx = feed(&app, &mut model, update.events);
    assert!(fx.http.is_empty());

    // 4. Permission granted starts the GPS watch.
    let update = app
        .resolve(
            &mut permission,
            LocationResponse::Permission(PermissionOutcome::Granted),
        )
        .expect("permission resolves");
    let mut fx = feed(&app, &mut model, update.events);
    assert!(model.permission.is_granted());

    let mut watch = fx.location.remove(0);
    assert_eq!(
        watch.operation,
        LocationOperation::WatchPosition {
            time_interval_ms: 5_000,
            distance_interval_m: 10,
        }
    );

    // 5. First fix places this device and publishes it on the feed.
    let update = app
        .resolve(
            &mut watch,
            LocationResponse::Fix(Ok(GpsFix {
                latitude: 14.6256,
                longitude: 121.1224,
                accuracy_m: Some(8.0),
            })),
        )
        .expect("fix resolves");
    let mut fx = feed(&app, &mut model, update.events);

    assert_eq!(model.device_fix, Some(coord(14.6256, 121.1224)));
    match &fx.feed.remove(0).operation {
        FeedOperation::Publish { device } => assert_eq!(device.device_id, "primary-device"),
        other => panic!("expected a publish, got {other:?}"),
    }
    assert_eq!(model.phase, LoadPhase::Initializing);

    // 6. First reading recenters the region, kicks off the route and the
    // places lookup, and persists the snapshot.
    let update = app
        .resolve(&mut tracker_http, http_ok(READING_A))
        .expect("tracker fetch resolves");
    let mut fx = feed(&app, &mut model, update.events);

    assert_eq!(model.region.center.as_tuple(), (14.63, 121.13));
    assert_eq!(
        model.initial_region.map(|r| r.zoom.step()),
        Some(DEFAULT_ZOOM_STEP)
    );
    assert!(!model.poller.is_stale());
    assert_eq!(model.phase, LoadPhase::Initializing);

    assert_eq!(fx.http.len(), 2);
    let mut route_http = fx
        .http
        .remove(fx.http.iter().position(|r| r.operation.url.contains("/route/v1/driving/")).unwrap());
    assert!(route_http
        .operation
        .url
        .contains("121.1224,14.6256;121.13,14.63"));
    let mut places_http = fx.http.remove(0);
    assert!(places_http.operation.url.contains("interpreter?data="));

    let written = fx.kv.remove(0);
    match &written.operation {
        KeyValueOperation::Set { key, value } => {
            assert!(key.starts_with("map/state/v1_"));
            let snapshot: CachedMapState =
                ciborium::de::from_reader(value.as_slice()).expect("snapshot decodes");
            assert_eq!(snapshot.reading.coordinate.as_tuple(), (14.63, 121.13));
        }
        other => panic!("expected the snapshot write, got {other:?}"),
    }

    // 7. Route concluded: every milestone is met, the map is interactive.
    let update = app
        .resolve(&mut route_http, http_ok(ROUTE_THREE_POINTS))
        .expect("route resolves");
    feed(&app, &mut model, update.events);

    assert_eq!(model.phase, LoadPhase::Ready);
    assert_eq!(model.route.len(), 3);

    let view = app.view(&model);
    let ViewState::Ready { map } = view.state else {
        panic!("expected the ready map");
    };
    assert!(map.stale_notice.is_none());
    assert!(map.can_navigate);
    assert!(map.route_summary.unwrap().ends_with("drive"));
    let marker_ids: Vec<&str> = map.markers.iter().map(|m| m.device_id.as_str()).collect();
    assert_eq!(marker_ids, ["A", "primary-device"]);

    // 8. Places resolve into the ranked overlay.
    let places_body = br#"{"elements":[{"type":"node","id":1,"lat":14.631,"lon":121.131,"tags":{"name":"Kanto Grill","amenity":"restaurant"}}]}"#;
    let update = app
        .resolve(&mut places_http, http_ok(places_body))
        .expect("places resolve");
    feed(&app, &mut model, update.events);
    assert_eq!(model.places.len(), 1);
    assert_eq!(model.places[0].name, "Kanto Grill");

    // 9. Second poll returns the identical reading: the stale notice shows
    // and nothing else moves.
    let poll_id = armed_timer_id(&poll_timer, 5_000);
    let update = app
        .resolve(&mut poll_timer, TimerOutput::Fired { id: poll_id })
        .expect("poll timer fires");
    let mut fx = feed(&app, &mut model, update.events);

    let mut tracker_http = fx.http.remove(0);
    let mut poll_timer = take_start_timer(fx.timers, 5_000);

    let update = app
        .resolve(&mut tracker_http, http_ok(READING_A))
        .expect("tracker fetch resolves");
    let fx = feed(&app, &mut model, update.events);

    assert!(model.poller.is_stale());
    assert_eq!(model.region.center.as_tuple(), (14.63, 121.13));
    assert_eq!(model.route.len(), 3);
    assert!(fx.http.is_empty(), "no route or places refresh for a stale reading");
    assert!(fx.kv.is_empty(), "no snapshot write for a stale reading");

    let view = app.view(&model);
    let ViewState::Ready { map } = view.state else {
        panic!("expected the ready map");
    };
    assert!(map.stale_notice.is_some());

    // 10. A new reading clears the signal, recenters, and re-routes.
    let poll_id = armed_timer_id(&poll_timer, 5_000);
    let update = app
        .resolve(&mut poll_timer, TimerOutput::Fired { id: poll_id })
        .expect("poll timer fires");
    let mut fx = feed(&app, &mut model, update.events);
    let mut tracker_http = fx.http.remove(0);

    let update = app
        .resolve(&mut tracker_http, http_ok(READING_B))
        .expect("tracker fetch resolves");
    let mut fx = feed(&app, &mut model, update.events);

    assert!(!model.poller.is_stale());
    assert_eq!(model.region.center.as_tuple(), (14.64, 121.14));

    let mut route_http = fx
        .http
        .remove(fx.http.iter().position(|r| r.operation.url.contains("/route/v1/driving/")).unwrap());
    let update = app
        .resolve(&mut route_http, http_ok(ROUTE_TWO_POINTS))
        .expect("route resolves");
    feed(&app, &mut model, update.events);
    assert_eq!(model.route.len(), 2);

    let view = app.view(&model);
    let ViewState::Ready { map } = view.state else {
        panic!("expected the ready map");
    };
    assert!(map.stale_notice.is_none());

    // 11. Closing tears everything down and snapshots one last time.
    let update = app.update(Event::ScreenClosed, &mut model);
    let fx = split_effects(update.effects);

    assert!(fx
        .location
        .iter()
        .any(|r| r.operation == LocationOperation::ClearWatch));
    assert!(fx
        .feed
        .iter()
        .any(|r| r.operation == FeedOperation::Unsubscribe));
    assert!(fx
        .timers
        .iter()
        .any(|r| matches!(r.operation, TimerOperation::Cancel { .. })));
    assert!(fx
        .kv
        .iter()
        .any(|r| matches!(&r.operation, KeyValueOperation::Set { .. })));
    assert!(!model.screen_active);

    // 12. Events after teardown are dropped.
    let update = app.update(Event::ZoomInPressed, &mut model);
    let fx = split_effects(update.effects);
    assert!(!fx.rendered);
    assert_eq!(model.region.zoom.step(), DEFAULT_ZOOM_STEP);
}

#[test]
fn test_permission_denied_blocks_ready_but_not_polling() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let update = app.update(
        Event::ScreenOpened(Box::new(SessionConfig::default())),
        &mut model,
    );
    let mut fx = split_effects(update.effects);
    let mut permission = fx.location.remove(0);

    let update = app
        .resolve(
            &mut permission,
            LocationResponse::Permission(PermissionOutcome::Denied),
        )
        .expect("permission resolves");
    let fx = feed(&app, &mut model, update.events);

    assert!(fx.rendered);
    assert_eq!(model.phase, LoadPhase::PermissionDenied);
    assert!(fx.location.is_empty(), "no GPS watch without permission");

    let view = app.view(&model);
    match view.state {
        ViewState::PermissionDenied { permission_state } => {
            assert!(permission_state.is_denied());
        }
        other => panic!("expected the permission screen, got {other:?}"),
    }
    assert_eq!(
        view.error.map(|e| e.error_code),
        Some("LOCATION_PERMISSION_DENIED".to_string())
    );

    // Remote polling is independent of the local permission.
    let update = app.update(Event::TokenLoaded(Ok(Some(b"tok".to_vec()))), &mut model);
    let fx = split_effects(update.effects);
    assert_eq!(fx.http.len(), 1);

    let body = READING_A.to_vec();
    app.update(
        Event::RemoteFetched {
            generation: 1,
            outcome: Box::new(Ok(HttpOutcome { status: 200, body })),
        },
        &mut model,
    );

    assert_eq!(model.region.center.as_tuple(), (14.63, 121.13));
    assert_eq!(model.phase, LoadPhase::PermissionDenied, "denial is terminal");
}

#[test]
fn test_missing_token_fails_init_as_configuration() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    app.update(
        Event::ScreenOpened(Box::new(SessionConfig::default())),
        &mut model,
    );
    let update = app.update(Event::TokenLoaded(Ok(None)), &mut model);
    let fx = split_effects(update.effects);

    assert!(fx.rendered);
    assert!(fx.http.is_empty(), "no polling without a token");
    assert_eq!(model.phase, LoadPhase::InitError);

    let view = app.view(&model);
    assert!(matches!(view.state, ViewState::LoadFailed { .. }));
    assert_eq!(
        view.error.map(|e| e.error_code),
        Some("CONFIG_ERROR".to_string())
    );
}

#[test]
fn test_token_read_failure_fails_init_as_storage() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    app.update(
        Event::ScreenOpened(Box::new(SessionConfig::default())),
        &mut model,
    );
    let update = app.update(
        Event::TokenLoaded(Err(KeyValueError::Io {
            message: "disk unavailable".to_string(),
        })),
        &mut model,
    );
    let fx = split_effects(update.effects);

    assert!(fx.http.is_empty());
    assert_eq!(model.phase, LoadPhase::InitError);
    assert_eq!(
        app.view(&model).error.map(|e| e.error_code),
        Some("STORAGE_ERROR".to_string())
    );
}

#[test]
fn test_straggler_response_leaves_live_fetch_deadline_armed() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let update = app.update(
        Event::ScreenOpened(Box::new(SessionConfig::default())),
        &mut model,
    );
    let mut fx = split_effects(update.effects);
    let mut token_read = fx.kv.remove(0);

    let update = app
        .resolve(&mut token_read, kv_found(b"tok".to_vec()))
        .expect("token read resolves");
    let mut fx = feed(&app, &mut model, update.events);

    // First attempt in flight, with its deadline and the interval timer.
    let mut stale_http = fx.http.remove(0);
    let deadline_pos = fx
        .timers
        .iter()
        .position(|t| matches!(&t.operation, TimerOperation::Start { millis, .. } if *millis == 10_000))
        .expect("fetch deadline armed");
    let mut first_deadline = fx.timers.remove(deadline_pos);
    let mut poll_timer = take_start_timer(fx.timers, 5_000);

    // The deadline fires before any response; a retry is scheduled.
    let deadline_id = armed_timer_id(&first_deadline, 10_000);
    let update = app
        .resolve(&mut first_deadline, TimerOutput::Fired { id: deadline_id })
        .expect("deadline fires");
    let fx = feed(&app, &mut model, update.events);
    let mut retry_timer = take_start_timer(fx.timers, 2_000);

    // The retry attempt goes out with a fresh deadline.
    let retry_id = armed_timer_id(&retry_timer, 2_000);
    let update = app
        .resolve(&mut retry_timer, TimerOutput::Fired { id: retry_id })
        .expect("retry timer fires");
    let mut fx = feed(&app, &mut model, update.events);
    let mut live_http = fx.http.remove(0);
    let live_deadline = take_start_timer(fx.timers, 10_000);
    let live_deadline_id = armed_timer_id(&live_deadline, 10_000);
    assert_eq!(model.fetch_deadline, Some(live_deadline_id));

    // The first attempt's response straggles in. It must not touch the
    // live attempt's deadline or conclude the running cycle.
    let update = app
        .resolve(&mut stale_http, http_ok(READING_A))
        .expect("straggler resolves");
    let fx = feed(&app, &mut model, update.events);

    assert!(fx.timers.is_empty(), "the live deadline stays armed");
    assert_eq!(model.fetch_deadline, Some(live_deadline_id));
    assert!(model.poller.is_in_flight());
    assert!(model.last_reading.is_none(), "a superseded reading is dropped");

    // The live attempt completes normally and cancels its own deadline.
    let update = app
        .resolve(&mut live_http, http_ok(READING_A))
        .expect("live fetch resolves");
    let fx = feed(&app, &mut model, update.events);

    assert!(fx.timers.iter().any(
        |t| matches!(t.operation, TimerOperation::Cancel { id } if id == live_deadline_id)
    ));
    assert!(!model.poller.is_in_flight());
    assert_eq!(model.region.center.as_tuple(), (14.63, 121.13));

    // Polling stays live: the next tick issues a fresh request.
    let poll_id = armed_timer_id(&poll_timer, 5_000);
    let update = app
        .resolve(&mut poll_timer, TimerOutput::Fired { id: poll_id })
        .expect("poll timer fires");
    let fx = feed(&app, &mut model, update.events);
    assert_eq!(fx.http.len(), 1, "the next cycle fetches");
}

/// Drives the screen to a resolved first reading with a fix, skipping the
/// shell round-trips that test_open_to_ready_and_staleness_walk covers.
fn open_with_reading(app: &AppTester<App, Effect>, model: &mut Model, config: SessionConfig) {
    app.update(Event::ScreenOpened(Box::new(config)), model);
    app.update(Event::TokenLoaded(Ok(Some(b"tok".to_vec()))), model);
    app.update(Event::PermissionUpdated(PermissionOutcome::Granted), model);
    app.update(
        Event::DeviceFixReceived(Box::new(Ok(GpsFix {
            latitude: 14.6256,
            longitude: 121.1224,
            accuracy_m: None,
        }))),
        model,
    );
    app.update(
        Event::RemoteFetched {
            generation: 1,
            outcome: Box::new(Ok(HttpOutcome {
                status: 200,
                body: READING_A.to_vec(),
            })),
        },
        model,
    );
}

#[test]
fn test_navigate_recenters_to_route_overview() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    open_with_reading(&app, &mut model, SessionConfig::default());

    // The automatic route attempt concludes without moving the region.
    app.update(
        Event::RouteFetched {
            generation: model.route_generation,
            outcome: Box::new(Ok(HttpOutcome {
                status: 200,
                body: ROUTE_THREE_POINTS.to_vec(),
            })),
        },
        &mut model,
    );
    assert_eq!(model.phase, LoadPhase::Ready);
    assert_eq!(model.region.center.as_tuple(), (14.63, 121.13));
    assert_eq!(model.region.zoom.step(), DEFAULT_ZOOM_STEP);

    let update = app.update(Event::NavigatePressed, &mut model);
    let fx = split_effects(update.effects);
    assert_eq!(fx.http.len(), 1, "navigate issues one route request");

    let update = app.update(
        Event::RouteFetched {
            generation: model.route_generation,
            outcome: Box::new(Ok(HttpOutcome {
                status: 200,
                body: ROUTE_THREE_POINTS.to_vec(),
            })),
        },
        &mut model,
    );
    let fx = split_effects(update.effects);

    // Overview frames the route midpoint at the wider overview zoom, and
    // the move refreshes the places overlay.
    assert_eq!(model.region.center.as_tuple(), (14.628, 121.126));
    assert_eq!(model.region.zoom.step(), ROUTE_OVERVIEW_ZOOM_STEP);
    assert_eq!(fx.http.len(), 1);
    assert!(fx.http[0].operation.url.contains("interpreter?data="));
}

#[test]
fn test_recenter_restores_initial_view_and_clears_route() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    open_with_reading(&app, &mut model, SessionConfig::default());
    app.update(
        Event::RouteFetched {
            generation: model.route_generation,
            outcome: Box::new(Ok(HttpOutcome {
                status: 200,
                body: ROUTE_THREE_POINTS.to_vec(),
            })),
        },
        &mut model,
    );
    assert_eq!(model.route.len(), 3);

    // Navigate frames the route overview away from the initial region.
    app.update(Event::NavigatePressed, &mut model);
    app.update(
        Event::RouteFetched {
            generation: model.route_generation,
            outcome: Box::new(Ok(HttpOutcome {
                status: 200,
                body: ROUTE_THREE_POINTS.to_vec(),
            })),
        },
        &mut model,
    );
    assert_eq!(model.region.zoom.step(), ROUTE_OVERVIEW_ZOOM_STEP);

    // Recenter restores the initial region and wipes the route overlay.
    let update = app.update(Event::RecenterPressed, &mut model);
    let fx = split_effects(update.effects);

    assert_eq!(model.region.center.as_tuple(), (14.63, 121.13));
    assert_eq!(model.region.zoom.step(), DEFAULT_ZOOM_STEP);
    assert!(model.selected_device.is_none());
    assert!(model.route.is_empty());
    assert_eq!(fx.http.len(), 1, "the restored center refreshes places");
}

#[test]
fn test_recenter_abandons_an_in_flight_route_attempt() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    open_with_reading(&app, &mut model, SessionConfig::default());

    // The automatic route attempt from the first reading is still open.
    assert!(model.route_attempt.is_some());
    let stale_generation = model.route_generation;

    let update = app.update(Event::RecenterPressed, &mut model);
    let fx = split_effects(update.effects);
    assert!(model.route_attempt.is_none());
    assert!(fx
        .timers
        .iter()
        .any(|t| matches!(t.operation, TimerOperation::Cancel { .. })));

    // The abandoned attempt's response cannot redraw the overlay.
    app.update(
        Event::RouteFetched {
            generation: stale_generation,
            outcome: Box::new(Ok(HttpOutcome {
                status: 200,
                body: ROUTE_THREE_POINTS.to_vec(),
            })),
        },
        &mut model,
    );
    assert!(model.route.is_empty());
}

#[test]
fn test_selecting_a_device_centers_at_default_zoom_and_clears_route() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    open_with_reading(&app, &mut model, SessionConfig::default());
    app.update(
        Event::RouteFetched {
            generation: model.route_generation,
            outcome: Box::new(Ok(HttpOutcome {
                status: 200,
                body: ROUTE_THREE_POINTS.to_vec(),
            })),
        },
        &mut model,
    );
    assert_eq!(model.route.len(), 3);

    app.update(
        Event::FeedUpdated(FeedSnapshot {
            devices: vec![FeedDevice {
                device_id: "kid-watch".to_string(),
                latitude: 14.70,
                longitude: 121.20,
                timestamp: None,
            }],
        }),
        &mut model,
    );

    // Widen the view first so selection provably resets the zoom.
    app.update(Event::ZoomOutPressed, &mut model);
    assert_eq!(model.region.zoom.step(), DEFAULT_ZOOM_STEP - 1);

    let update = app.update(
        Event::DeviceSelected {
            device_id: "kid-watch".to_string(),
        },
        &mut model,
    );
    let fx = split_effects(update.effects);

    assert_eq!(model.region.center.as_tuple(), (14.70, 121.20));
    assert_eq!(model.region.zoom.step(), DEFAULT_ZOOM_STEP);
    assert_eq!(
        model.selected_device.as_ref().map(|d| d.as_str()),
        Some("kid-watch")
    );
    assert!(model.route.is_empty(), "selection discards the old route");
    assert_eq!(fx.http.len(), 1, "a moved center refreshes places");

    // Zoom changes the span only; the overlay is untouched.
    let update = app.update(Event::ZoomInPressed, &mut model);
    let fx = split_effects(update.effects);
    assert_eq!(model.region.zoom.step(), DEFAULT_ZOOM_STEP + 1);
    assert!(fx.http.is_empty(), "zoom alone never refreshes places");
}

#[test]
fn test_selecting_a_vanished_device_surfaces_a_notice() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    open_with_reading(&app, &mut model, SessionConfig::default());

    let update = app.update(
        Event::DeviceSelected {
            device_id: "gone-device".to_string(),
        },
        &mut model,
    );
    let fx = split_effects(update.effects);

    assert!(fx.rendered);
    assert!(model.selected_device.is_none());
    assert_eq!(
        model.region.center.as_tuple(),
        (14.63, 121.13),
        "the map does not move"
    );

    let toast = app.view(&model).toast.expect("a notice is shown");
    assert_eq!(toast.kind, ToastKind::Info);
    assert!(toast.message.contains("no longer on the map"));
}

#[test]
fn test_warm_cache_restores_last_map_until_live_data() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    app.update(
        Event::ScreenOpened(Box::new(SessionConfig::default())),
        &mut model,
    );
    app.update(Event::TokenLoaded(Ok(Some(b"tok".to_vec()))), &mut model);

    let cached = CachedMapState {
        reading: LocationReading {
            coordinate: coord(14.55, 121.05),
            source_id: Some(ReadingId::new("cached-1")),
            captured_at: Some("2024-04-30 22:00:00".to_string()),
        },
        region: Region::new(coord(14.55, 121.05), ZoomLevel::new(7)),
    };
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&cached, &mut bytes).expect("snapshot serializes");

    app.update(Event::CachedStateLoaded(Ok(Some(bytes))), &mut model);

    assert_eq!(model.region.center.as_tuple(), (14.55, 121.05));
    assert_eq!(model.region.zoom.step(), 7);
    assert_eq!(
        model
            .last_reading
            .as_ref()
            .and_then(|r| r.source_id.as_ref())
            .map(ReadingId::as_str),
        Some("cached-1")
    );
    assert_eq!(model.phase, LoadPhase::Initializing, "a snapshot is not live data");
    assert!(!model.poller.is_stale());

    // A live reading with the same id as the snapshot is still fresh; the
    // restored state never seeds the staleness gate.
    let body = br#"{"latitude": 14.63, "longitude": 121.13, "id": "cached-1"}"#.to_vec();
    app.update(
        Event::RemoteFetched {
            generation: 1,
            outcome: Box::new(Ok(HttpOutcome { status: 200, body })),
        },
        &mut model,
    );

    assert!(!model.poller.is_stale());
    assert_eq!(model.region.center.as_tuple(), (14.63, 121.13));

    // A snapshot arriving after live data is discarded.
    let stale_snapshot = CachedMapState {
        reading: LocationReading {
            coordinate: coord(10.0, 100.0),
            source_id: None,
            captured_at: None,
        },
        region: Region::new(coord(10.0, 100.0), ZoomLevel::new(2)),
    };
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&stale_snapshot, &mut bytes).expect("snapshot serializes");
    app.update(Event::CachedStateLoaded(Ok(Some(bytes))), &mut model);

    assert_eq!(model.region.center.as_tuple(), (14.63, 121.13));
}

#[test]
fn test_places_fallback_switches_provider_once() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let config = SessionConfig {
        places_fallback: Some(PlacesProvider::Geoapify {
            api_key: "k-test".to_string(),
        }),
        ..SessionConfig::default()
    };

    app.update(Event::ScreenOpened(Box::new(config)), &mut model);
    app.update(Event::TokenLoaded(Ok(Some(b"tok".to_vec()))), &mut model);
    app.update(
        Event::RemoteFetched {
            generation: 1,
            outcome: Box::new(Ok(HttpOutcome {
                status: 200,
                body: READING_A.to_vec(),
            })),
        },
        &mut model,
    );

    // Primary fails: the fallback provider is asked instead.
    let update = app.update(
        Event::PlacesFetched {
            generation: model.places_generation,
            outcome: Box::new(Ok(HttpOutcome {
                status: 500,
                body: Vec::new(),
            })),
        },
        &mut model,
    );
    let fx = split_effects(update.effects);
    assert_eq!(fx.http.len(), 1);
    assert!(fx.http[0].operation.url.contains("apiKey=k-test"));

    let geoapify_body = br#"{"type":"FeatureCollection","features":[{"type":"Feature","geometry":{"type":"Point","coordinates":[121.131,14.631]},"properties":{"place_id":"p1","name":"Cafe Uno","categories":["catering.cafe"]}}]}"#.to_vec();
    app.update(
        Event::PlacesFetched {
            generation: model.places_generation,
            outcome: Box::new(Ok(HttpOutcome {
                status: 200,
                body: geoapify_body,
            })),
        },
        &mut model,
    );
    assert_eq!(model.places.len(), 1);
    assert_eq!(model.places[0].name, "Cafe Uno");

    // A later cycle where both providers fail keeps the previous overlay.
    app.update(
        Event::PollTick {
            timer_id: model.poll_timer.expect("poll timer armed"),
        },
        &mut model,
    );
    app.update(
        Event::RemoteFetched {
            generation: 2,
            outcome: Box::new(Ok(HttpOutcome {
                status: 200,
                body: READING_B.to_vec(),
            })),
        },
        &mut model,
    );

    app.update(
        Event::PlacesFetched {
            generation: model.places_generation,
            outcome: Box::new(Ok(HttpOutcome {
                status: 500,
                body: Vec::new(),
            })),
        },
        &mut model,
    );
    let update = app.update(
        Event::PlacesFetched {
            generation: model.places_generation,
            outcome: Box::new(Ok(HttpOutcome {
                status: 500,
                body: Vec::new(),
            })),
        },
        &mut model,
    );
    let fx = split_effects(update.effects);

    assert!(fx.http.is_empty(), "the fallback is not retried");
    assert_eq!(model.places.len(), 1, "a failed refresh keeps the old overlay");
    assert_eq!(model.places[0].name, "Cafe Uno");
}
