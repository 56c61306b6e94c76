#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

//! Core of the family map screen: polls the tracked device's position,
//! merges it with the local GPS fix and the realtime device feed, derives
//! the driving route and nearby places, and owns region/zoom/selection
//! state. The shell renders [`ViewModel`] and feeds [`Event`]s back in.

pub mod capabilities;
pub mod geo;
pub mod places;
pub mod route;
pub mod tracker;

use std::collections::HashMap;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;
use zeroize::Zeroizing;

use crux_kv::error::KeyValueError;

use crate::capabilities::{FeedSnapshot, GpsFix, PermissionOutcome, WatchError};
use crate::geo::{CoordinateError, Region, ValidatedCoordinate, ZoomLevel};
use crate::places::{PlaceCategory, PlaceOfInterest, PlacesError, PlacesProvider};
use crate::route::{RouteError, RouteProvider};
use crate::tracker::{LocationReading, Poller, RetryPolicy, TrackerError};

pub use app::App;
pub use capabilities::{Capabilities, Effect};

pub const AUTH_TOKEN_KEY: &str = "authToken";
pub const STATE_CACHE_VERSION: u32 = 1;
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const FALLBACK_CENTER_LAT: f64 = 14.6256;
pub const FALLBACK_CENTER_LON: f64 = 121.1224;
pub const DEFAULT_ZOOM_STEP: usize = 5;
pub const ROUTE_OVERVIEW_ZOOM_STEP: usize = 3;
pub const REMOTE_POLL_INTERVAL_MS: u64 = 5_000;
pub const FETCH_MAX_ATTEMPTS: u32 = 3;
pub const FETCH_RETRY_DELAY_MS: u64 = 2_000;
pub const FETCH_TIMEOUT_MS: u64 = 10_000;
pub const ROUTE_TIMEOUT_MS: u64 = 15_000;
pub const PLACES_TIMEOUT_MS: u64 = 15_000;
pub const GPS_TIME_INTERVAL_MS: u64 = 5_000;
pub const GPS_DISTANCE_INTERVAL_M: u32 = 10;
pub const PLACES_SEARCH_RADIUS_M: u32 = 500;
pub const MAX_PLACES: usize = 5;
pub const TRACKED_DEVICE_FALLBACK_ID: &str = "tracked-device";

/// Descending span ladder the map zoom steps through. Index 0 is the
/// widest view; the last index is the tightest.
pub const SPAN_ZOOM_LADDER: &[f64] = &[
    0.5, 0.25, 0.1, 0.05, 0.02, 0.01, 0.005, 0.002, 0.001, 0.0005, 0.0002,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Configuration,
    Validation,
    Storage,
    Deserialization,
    Location,
    LocationPermissionDenied,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Configuration => "CONFIG_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::Location => "LOCATION_ERROR",
            Self::LocationPermissionDenied => "LOCATION_PERMISSION_DENIED",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::Storage | Self::Location => {
                ErrorSeverity::Transient
            }

            Self::Authentication
            | Self::Configuration
            | Self::Validation
            | Self::LocationPermissionDenied
            | Self::Unknown => ErrorSeverity::Permanent,

            Self::Deserialization | Self::InvalidState | Self::Internal => ErrorSeverity::Fatal,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::Storage | Self::Location
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub retry_after_ms: Option<u64>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            retry_after_ms: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => "Your session has expired. Please sign in again.".into(),
            ErrorKind::Configuration => {
                "The app is not configured correctly. Please update and try again.".into()
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::Storage => {
                "Unable to save data locally. Please free up some storage space.".into()
            }
            ErrorKind::Deserialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::Location => {
                "Unable to determine your location. Please check your GPS settings.".into()
            }
            ErrorKind::LocationPermissionDenied => {
                "Location access is required. Please enable location permissions in Settings."
                    .into()
            }
            ErrorKind::InvalidState => {
                "The app is in an invalid state. Please restart the app.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = match status {
            400 => ErrorKind::Validation,
            401 | 403 => ErrorKind::Authentication,
            408 => ErrorKind::Timeout,
            404 | 429 | 500..=599 => ErrorKind::Network,
            _ => ErrorKind::Unknown,
        };

        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorResponse>(b).ok())
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: String,
}

pub type AppResult<T> = Result<T, AppError>;

impl From<CoordinateError> for AppError {
    fn from(e: CoordinateError) -> Self {
        Self::new(ErrorKind::Validation, e.to_string())
    }
}

impl From<TrackerError> for AppError {
    fn from(e: TrackerError) -> Self {
        let kind = match &e {
            TrackerError::MalformedBody(_) => ErrorKind::Deserialization,
            TrackerError::InvalidCoordinate(_) => ErrorKind::Validation,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<RouteError> for AppError {
    fn from(e: RouteError) -> Self {
        let kind = match &e {
            RouteError::NoRoute | RouteError::ProviderStatus(_) => ErrorKind::Network,
            RouteError::MalformedResponse(_) | RouteError::Geometry(_) => {
                ErrorKind::Deserialization
            }
        };
        Self::new(kind, e.to_string())
    }
}

impl From<PlacesError> for AppError {
    fn from(e: PlacesError) -> Self {
        let PlacesError::MalformedResponse(_) = &e;
        Self::new(ErrorKind::Deserialization, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    #[default]
    Unknown,
    Requesting,
    Granted,
    Denied,
    Restricted,
}

impl PermissionState {
    #[must_use]
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }

    #[must_use]
    pub const fn is_denied(self) -> bool {
        matches!(self, Self::Denied | Self::Restricted)
    }

    #[must_use]
    pub const fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl From<PermissionOutcome> for PermissionState {
    fn from(outcome: PermissionOutcome) -> Self {
        match outcome {
            PermissionOutcome::Granted => Self::Granted,
            PermissionOutcome::Denied => Self::Denied,
            PermissionOutcome::Restricted => Self::Restricted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToastMessage {
    pub message: String,
    pub kind: ToastKind,
    pub duration_ms: u64,
}

impl ToastMessage {
    #[must_use]
    pub fn new(message: impl Into<String>, kind: ToastKind) -> Self {
        Self {
            message: message.into(),
            kind,
            duration_ms: kind.default_duration_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl ToastKind {
    #[must_use]
    pub const fn default_duration_ms(self) -> u64 {
        match self {
            Self::Info => 3000,
            Self::Success => 2000,
            Self::Warning => 4000,
            Self::Error => 5000,
        }
    }
}

/// Session token for the tracker backend. The raw string never appears in
/// logs or the view; it is exposed only to build the Authorization header
/// and to derive the warm-start cache key.
#[derive(Debug, Clone)]
pub struct AuthToken(SecretString);

impl AuthToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::new(token.into()))
    }

    /// Promotes raw bytes read from the token store. Surrounding
    /// whitespace is tolerated; anything that is not otherwise a
    /// non-empty UTF-8 string is rejected.
    pub fn from_bytes(bytes: Vec<u8>) -> AppResult<Self> {
        let bytes = Zeroizing::new(bytes);
        let text = std::str::from_utf8(&bytes).map_err(|_| {
            AppError::new(
                ErrorKind::Authentication,
                "Stored session token is not valid UTF-8",
            )
        })?;

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(AppError::new(
                ErrorKind::Authentication,
                "Stored session token is empty",
            ));
        }

        Ok(Self::new(trimmed))
    }

    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0.expose_secret())
    }

    /// Storage key for this user's warm-start snapshot. Hashed so the
    /// token itself never lands in a storage key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let hash = blake3::hash(self.0.expose_secret().as_bytes());
        format!(
            "map/state/v{}_{}",
            STATE_CACHE_VERSION,
            &hash.to_hex()[..16]
        )
    }
}

/// Validated, normalized base URL of the tracker backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApiBase(String);

impl ApiBase {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let url = Url::parse(raw).map_err(|e| {
            AppError::new(ErrorKind::Configuration, "Invalid API base URL")
                .with_internal(e.to_string())
        })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(AppError::new(
                ErrorKind::Configuration,
                format!("Unsupported API scheme: {}", url.scheme()),
            ));
        }

        Ok(Self(raw.trim_end_matches('/').to_string()))
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.0, path.trim_start_matches('/'))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ApiBase {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ApiBase> for String {
    fn from(base: ApiBase) -> Self {
        base.0
    }
}

/// Everything the shell hands over when the map screen opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub api_base: ApiBase,
    /// Name this device publishes itself under on the feed.
    pub device_name: String,
    pub route_provider: RouteProvider,
    pub places_primary: PlacesProvider,
    #[serde(default)]
    pub places_fallback: Option<PlacesProvider>,
    #[serde(default = "default_place_categories")]
    pub place_categories: Vec<PlaceCategory>,
    #[serde(default)]
    pub fetch_retry: RetryPolicy,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_place_categories() -> Vec<PlaceCategory> {
    vec![PlaceCategory::Restaurant]
}

const fn default_poll_interval_ms() -> u64 {
    REMOTE_POLL_INTERVAL_MS
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base: ApiBase("https://api.tracker.example.com".into()),
            device_name: "primary-device".into(),
            route_provider: RouteProvider::Osrm {
                base_url: "https://router.project-osrm.org".into(),
            },
            places_primary: PlacesProvider::Overpass {
                endpoint: "https://overpass-api.de/api/interpreter".into(),
            },
            places_fallback: None,
            place_categories: default_place_categories(),
            fetch_retry: RetryPolicy::default(),
            poll_interval_ms: REMOTE_POLL_INTERVAL_MS,
        }
    }
}

/// Status and raw body of a completed HTTP exchange, as events carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpOutcome {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    #[default]
    Initializing,
    Ready,
    PermissionDenied,
    InitError,
}

/// Milestones the screen must pass before the map is interactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InitProgress {
    pub permission_granted: bool,
    pub device_fix: bool,
    pub remote_reading: bool,
    /// The first route attempt finished, successfully or not. A failed
    /// route leaves the overlay empty but does not hold the screen in
    /// the loading state.
    pub route_concluded: bool,
}

impl InitProgress {
    #[must_use]
    pub const fn is_complete(self) -> bool {
        self.permission_granted && self.device_fix && self.remote_reading && self.route_concluded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// This device, placed from the local GPS fix.
    SelfDevice,
    /// The remotely tracked device, placed from the latest reading.
    Tracked,
    /// Any other device seen on the realtime feed.
    Peer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMarker {
    pub id: DeviceId,
    pub coordinate: ValidatedCoordinate,
    pub timestamp: Option<String>,
    pub kind: MarkerKind,
}

/// In-flight route request. A new request supersedes the old one by
/// bumping the generation; the stored deadline timer is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteAttempt {
    pub generation: u64,
    pub deadline_timer: u64,
    pub user_initiated: bool,
}

/// In-flight places request, remembering which provider was asked and the
/// center distances will be measured from.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacesAttempt {
    pub generation: u64,
    pub deadline_timer: u64,
    pub provider: PlacesProvider,
    pub center: ValidatedCoordinate,
    pub fallback_armed: bool,
}

/// Snapshot persisted per user so a reopened screen starts from the last
/// known map instead of a blank one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMapState {
    pub reading: LocationReading,
    pub region: Region,
}

#[derive(Default)]
pub struct Model {
    pub screen_active: bool,
    pub phase: LoadPhase,
    pub init: InitProgress,
    pub config: Option<SessionConfig>,
    pub auth_token: Option<AuthToken>,
    pub permission: PermissionState,
    pub region: Region,
    pub initial_region: Option<Region>,
    pub device_fix: Option<ValidatedCoordinate>,
    pub poller: Poller,
    pub last_reading: Option<LocationReading>,
    pub feed_markers: Vec<DeviceMarker>,
    pub selected_device: Option<DeviceId>,
    pub route: Vec<ValidatedCoordinate>,
    pub places: Vec<PlaceOfInterest>,
    pub next_timer_id: u64,
    pub poll_timer: Option<u64>,
    pub fetch_deadline: Option<u64>,
    pub route_attempt: Option<RouteAttempt>,
    pub places_attempt: Option<PlacesAttempt>,
    pub route_generation: u64,
    pub places_generation: u64,
    pub active_error: Option<AppError>,
    pub active_toast: Option<ToastMessage>,
}

impl Model {
    pub fn set_error(&mut self, error: AppError) {
        self.active_error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.active_error = None;
    }

    pub fn show_toast(&mut self, message: impl Into<String>, kind: ToastKind) {
        self.active_toast = Some(ToastMessage::new(message, kind));
    }

    pub fn clear_toast(&mut self) {
        self.active_toast = None;
    }

    pub fn alloc_timer_id(&mut self) -> u64 {
        self.next_timer_id += 1;
        self.next_timer_id
    }

    pub fn maybe_promote_ready(&mut self) {
        if self.phase == LoadPhase::Initializing && self.init.is_complete() {
            self.phase = LoadPhase::Ready;
        }
    }

    /// Where the marker with this id currently sits, checking this
    /// device, the tracked reading, and the feed in that order.
    #[must_use]
    pub fn marker_position(&self, id: &DeviceId) -> Option<ValidatedCoordinate> {
        if let Some(config) = self.config.as_ref() {
            if config.device_name == id.as_str() {
                return self.device_fix;
            }
        }

        if let Some(reading) = self.last_reading.as_ref() {
            if reading.source_id.as_ref().map(tracker::ReadingId::as_str) == Some(id.as_str()) {
                return Some(reading.coordinate);
            }
        }

        self.feed_markers
            .iter()
            .find(|m| &m.id == id)
            .map(|m| m.coordinate)
    }

    /// Navigation target: the selected device if it is still on the map,
    /// otherwise the tracked reading.
    #[must_use]
    pub fn route_destination(&self) -> Option<ValidatedCoordinate> {
        if let Some(id) = self.selected_device.as_ref() {
            if let Some(coordinate) = self.marker_position(id) {
                return Some(coordinate);
            }
        }
        self.last_reading.as_ref().map(|r| r.coordinate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    Noop,

    /// The map screen mounted; carries the session configuration.
    ScreenOpened(Box<SessionConfig>),
    ScreenClosed,

    TokenLoaded(Result<Option<Vec<u8>>, KeyValueError>),
    CachedStateLoaded(Result<Option<Vec<u8>>, KeyValueError>),
    CachePersisted(Result<Option<Vec<u8>>, KeyValueError>),

    PermissionUpdated(PermissionOutcome),
    DeviceFixReceived(Box<Result<GpsFix, WatchError>>),

    PollTick {
        timer_id: u64,
    },
    PollRetry {
        generation: u64,
    },
    FetchDeadline {
        generation: u64,
    },
    RemoteFetched {
        generation: u64,
        outcome: Box<Result<HttpOutcome, String>>,
    },

    NavigatePressed,
    RouteFetched {
        generation: u64,
        outcome: Box<Result<HttpOutcome, String>>,
    },
    RouteDeadline {
        generation: u64,
    },

    PlacesFetched {
        generation: u64,
        outcome: Box<Result<HttpOutcome, String>>,
    },
    PlacesDeadline {
        generation: u64,
    },

    FeedUpdated(FeedSnapshot),

    ZoomInPressed,
    ZoomOutPressed,
    RecenterPressed,
    DeviceSelected {
        device_id: String,
    },

    DismissError,
    DismissToast,
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::ScreenOpened(_) => "screen_opened",
            Self::ScreenClosed => "screen_closed",
            Self::TokenLoaded(_) => "token_loaded",
            Self::CachedStateLoaded(_) => "cached_state_loaded",
            Self::CachePersisted(_) => "cache_persisted",
            Self::PermissionUpdated(_) => "permission_updated",
            Self::DeviceFixReceived(_) => "device_fix_received",
            Self::PollTick { .. } => "poll_tick",
            Self::PollRetry { .. } => "poll_retry",
            Self::FetchDeadline { .. } => "fetch_deadline",
            Self::RemoteFetched { .. } => "remote_fetched",
            Self::NavigatePressed => "navigate_pressed",
            Self::RouteFetched { .. } => "route_fetched",
            Self::RouteDeadline { .. } => "route_deadline",
            Self::PlacesFetched { .. } => "places_fetched",
            Self::PlacesDeadline { .. } => "places_deadline",
            Self::FeedUpdated(_) => "feed_updated",
            Self::ZoomInPressed => "zoom_in_pressed",
            Self::ZoomOutPressed => "zoom_out_pressed",
            Self::RecenterPressed => "recenter_pressed",
            Self::DeviceSelected { .. } => "device_selected",
            Self::DismissError => "dismiss_error",
            Self::DismissToast => "dismiss_toast",
        }
    }

    #[must_use]
    pub const fn is_user_initiated(&self) -> bool {
        matches!(
            self,
            Self::NavigatePressed
                | Self::ZoomInPressed
                | Self::ZoomOutPressed
                | Self::RecenterPressed
                | Self::DeviceSelected { .. }
                | Self::DismissError
                | Self::DismissToast
        )
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::Noop
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ViewState {
    Loading,
    PermissionDenied {
        permission_state: PermissionState,
    },
    LoadFailed {
        message: String,
        is_retryable: bool,
    },
    Ready {
        map: MapView,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MapView {
    pub center_lat: f64,
    pub center_lon: f64,
    pub lat_span: f64,
    pub lon_span: f64,
    pub zoom_step: usize,
    pub can_zoom_in: bool,
    pub can_zoom_out: bool,
    pub markers: Vec<MarkerView>,
    pub route: Vec<(f64, f64)>,
    pub route_summary: Option<String>,
    pub places: Vec<PlaceView>,
    pub stale_notice: Option<String>,
    pub can_navigate: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MarkerView {
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    pub kind: MarkerKind,
    pub is_selected: bool,
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlaceView {
    pub id: String,
    pub name: String,
    pub category: String,
    pub lat: f64,
    pub lon: f64,
    pub distance_text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserFacingError {
    pub message: String,
    pub is_transient: bool,
    pub is_retryable: bool,
    pub error_code: String,
}

impl From<&AppError> for UserFacingError {
    fn from(e: &AppError) -> Self {
        Self {
            message: e.user_facing_message(),
            is_transient: e.severity == ErrorSeverity::Transient,
            is_retryable: e.is_retryable(),
            error_code: e.code().to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToastView {
    pub message: String,
    pub kind: ToastKind,
    pub duration_ms: u64,
}

impl From<&ToastMessage> for ToastView {
    fn from(t: &ToastMessage) -> Self {
        Self {
            message: t.message.clone(),
            kind: t.kind,
            duration_ms: t.duration_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ViewModel {
    pub state: ViewState,
    pub error: Option<UserFacingError>,
    pub toast: Option<ToastView>,
    pub is_fetching: bool,
}

pub mod app {
    use super::*;
    use crate::capabilities::FeedDevice;
    use crate::geo::format_distance;
    use crate::places::{rank_places, PlacesQuery};
    use crate::route::{route_length_m, route_midpoint};
    use crate::tracker::{FailureOutcome, Freshness, TickDecision, CURRENT_LOCATION_PATH};
    use tracing::{debug, warn};

    #[derive(Default)]
    pub struct App;

    impl App {
        fn http_outcome(
            result: crux_http::Result<crux_http::Response<Vec<u8>>>,
        ) -> Result<HttpOutcome, String> {
            match result {
                Ok(mut response) => Ok(HttpOutcome {
                    status: u16::from(response.status()),
                    body: response.take_body().unwrap_or_default(),
                }),
                Err(e) => Err(e.to_string()),
            }
        }

        fn fail_init(model: &mut Model, caps: &Capabilities, error: AppError) {
            caps.telemetry.error(error.code(), &error.message);
            model.phase = LoadPhase::InitError;
            model.set_error(error);
        }

        fn schedule_poll_tick(model: &mut Model, caps: &Capabilities) {
            let interval = model
                .config
                .as_ref()
                .map_or(REMOTE_POLL_INTERVAL_MS, |c| c.poll_interval_ms);

            let timer_id = model.alloc_timer_id();
            model.poll_timer = Some(timer_id);
            caps.timer
                .after(timer_id, interval, |id| Event::PollTick { timer_id: id });
        }

        fn begin_polling(model: &mut Model, caps: &Capabilities) {
            match model.poller.begin_tick() {
                TickDecision::Fetch {
                    generation,
                    attempt,
                } => Self::send_tracker_fetch(model, caps, generation, attempt),
                TickDecision::SkipInFlight => {}
            }
            Self::schedule_poll_tick(model, caps);
        }

        fn send_tracker_fetch(
            model: &mut Model,
            caps: &Capabilities,
            generation: u64,
            attempt: u32,
        ) {
            let (url, bearer) = {
                let Some(config) = model.config.as_ref() else {
                    return;
                };
                let Some(token) = model.auth_token.as_ref() else {
                    return;
                };
                (
                    config.api_base.endpoint(CURRENT_LOCATION_PATH),
                    token.bearer(),
                )
            };

            let deadline_id = model.alloc_timer_id();
            model.fetch_deadline = Some(deadline_id);
            caps.timer.after(deadline_id, FETCH_TIMEOUT_MS, move |_| {
                Event::FetchDeadline { generation }
            });

            debug!(attempt, "requesting tracked device position");
            caps.telemetry.counter("tracker.fetch", 1);

            caps.http
                .get(&url)
                .header("authorization", bearer.as_str())
                .header("accept", "application/json")
                .send(move |result| Event::RemoteFetched {
                    generation,
                    outcome: Box::new(Self::http_outcome(result)),
                });
        }

        fn handle_tracker_failure(
            model: &mut Model,
            caps: &Capabilities,
            generation: u64,
            error: &AppError,
        ) {
            caps.telemetry.error(error.code(), &error.message);
            warn!(code = error.code(), "tracker fetch attempt failed");

            match model.poller.on_failure(generation) {
                FailureOutcome::Retry {
                    generation,
                    attempt,
                    delay_ms,
                } => {
                    debug!(attempt, delay_ms, "scheduling tracker retry");
                    let timer_id = model.alloc_timer_id();
                    caps.timer
                        .after(timer_id, delay_ms, move |_| Event::PollRetry { generation });
                }
                FailureOutcome::GaveUp { attempts } => {
                    caps.telemetry.counter("tracker.gave_up", 1);
                    warn!(attempts, "tracker fetch cycle exhausted its attempts");
                    model.show_toast(
                        "The tracked device's location is temporarily unavailable.",
                        ToastKind::Warning,
                    );
                    caps.render.render();
                }
                FailureOutcome::Ignored => {}
            }
        }

        fn apply_fresh_reading(model: &mut Model, caps: &Capabilities, reading: LocationReading) {
            let center = reading.coordinate;
            model.last_reading = Some(reading);
            model.init.remote_reading = true;

            let previous_center = model.region.center;
            model.region = model.region.with_center(center);

            if model.initial_region.is_none() {
                model.initial_region = Some(Region::new(center, ZoomLevel::default()));
            }

            if model.device_fix.is_some() {
                Self::send_route(model, caps, false);
            }

            if previous_center != center {
                Self::refresh_places(model, caps);
            }

            model.maybe_promote_ready();
            Self::persist_map_state(model, caps);
        }

        fn conclude_init_route(model: &mut Model) {
            model.init.route_concluded = true;
            model.maybe_promote_ready();
        }

        /// Recenter and reselection discard the drawn route. An attempt
        /// still in flight is abandoned so its result cannot redraw it.
        fn drop_route_overlay(model: &mut Model, caps: &Capabilities) {
            model.route.clear();
            if let Some(attempt) = model.route_attempt.take() {
                caps.timer.cancel(attempt.deadline_timer);
                Self::conclude_init_route(model);
            }
        }

        fn send_route(model: &mut Model, caps: &Capabilities, user_initiated: bool) {
            let Some(origin) = model.device_fix else {
                if user_initiated {
                    model.show_toast("Waiting for a GPS fix before navigating.", ToastKind::Info);
                }
                return;
            };
            let Some(destination) = model.route_destination() else {
                if user_initiated {
                    model.show_toast("No tracked location to navigate to yet.", ToastKind::Info);
                }
                return;
            };
            let url = {
                let Some(config) = model.config.as_ref() else {
                    return;
                };
                config.route_provider.request_url(origin, destination)
            };

            model.route_generation += 1;
            let generation = model.route_generation;

            if let Some(previous) = model.route_attempt.take() {
                caps.timer.cancel(previous.deadline_timer);
            }

            let deadline_timer = model.alloc_timer_id();
            model.route_attempt = Some(RouteAttempt {
                generation,
                deadline_timer,
                user_initiated,
            });
            caps.timer
                .after(deadline_timer, ROUTE_TIMEOUT_MS, move |_| {
                    Event::RouteDeadline { generation }
                });

            caps.telemetry.counter("route.request", 1);
            caps.http
                .get(&url)
                .header("accept", "application/json")
                .send(move |result| Event::RouteFetched {
                    generation,
                    outcome: Box::new(Self::http_outcome(result)),
                });
        }

        fn route_attempt_failed(
            model: &mut Model,
            caps: &Capabilities,
            user_initiated: bool,
            error: &AppError,
        ) {
            caps.telemetry.error(error.code(), &error.message);
            warn!(code = error.code(), "route resolution failed");

            model.route.clear();
            if user_initiated {
                model.show_toast("Couldn't find a driving route right now.", ToastKind::Error);
            }
            Self::conclude_init_route(model);
        }

        fn refresh_places(model: &mut Model, caps: &Capabilities) {
            let Some(provider) = model.config.as_ref().map(|c| c.places_primary.clone()) else {
                return;
            };
            Self::send_places(model, caps, provider, false);
        }

        fn send_places(
            model: &mut Model,
            caps: &Capabilities,
            provider: PlacesProvider,
            fallback_armed: bool,
        ) {
            let center = model.region.center;
            let categories = model
                .config
                .as_ref()
                .map_or_else(default_place_categories, |c| c.place_categories.clone());

            let query = PlacesQuery {
                center,
                radius_m: PLACES_SEARCH_RADIUS_M,
                categories,
            };
            let url = provider.request_url(&query);

            model.places_generation += 1;
            let generation = model.places_generation;

            if let Some(previous) = model.places_attempt.take() {
                caps.timer.cancel(previous.deadline_timer);
            }

            let deadline_timer = model.alloc_timer_id();
            caps.timer
                .after(deadline_timer, PLACES_TIMEOUT_MS, move |_| {
                    Event::PlacesDeadline { generation }
                });
            model.places_attempt = Some(PlacesAttempt {
                generation,
                deadline_timer,
                provider,
                center,
                fallback_armed,
            });

            caps.telemetry.counter("places.request", 1);
            caps.http
                .get(&url)
                .header("accept", "application/json")
                .send(move |result| Event::PlacesFetched {
                    generation,
                    outcome: Box::new(Self::http_outcome(result)),
                });
        }

        fn places_attempt_failed(
            model: &mut Model,
            caps: &Capabilities,
            attempt: &PlacesAttempt,
            error: &AppError,
        ) {
            caps.telemetry.error(error.code(), &error.message);
            warn!(provider = attempt.provider.label(), "places lookup failed");

            let fallback = model
                .config
                .as_ref()
                .and_then(|c| c.places_fallback.clone());
            match fallback {
                Some(provider) if !attempt.fallback_armed => {
                    caps.telemetry.counter("places.fallback", 1);
                    Self::send_places(model, caps, provider, true);
                }
                _ => {
                    // The overlay is advisory; keep whatever we had.
                }
            }
        }

        fn persist_map_state(model: &Model, caps: &Capabilities) {
            let Some(token) = model.auth_token.as_ref() else {
                return;
            };
            let Some(reading) = model.last_reading.as_ref() else {
                return;
            };

            let snapshot = CachedMapState {
                reading: reading.clone(),
                region: model.region,
            };

            let mut bytes = Vec::new();
            if let Err(e) = ciborium::ser::into_writer(&snapshot, &mut bytes) {
                caps.telemetry
                    .error("cache_serialize_failed", &e.to_string());
                return;
            }

            caps.key_value
                .set(token.cache_key(), bytes, Event::CachePersisted);
        }

        fn teardown(model: &mut Model, caps: &Capabilities) {
            caps.location.clear_watch();
            caps.feed.unsubscribe();

            if let Some(timer) = model.poll_timer.take() {
                caps.timer.cancel(timer);
            }
            if let Some(timer) = model.fetch_deadline.take() {
                caps.timer.cancel(timer);
            }
            if let Some(attempt) = model.route_attempt.take() {
                caps.timer.cancel(attempt.deadline_timer);
            }
            if let Some(attempt) = model.places_attempt.take() {
                caps.timer.cancel(attempt.deadline_timer);
            }

            Self::persist_map_state(model, caps);
            model.poller.abort();
            model.screen_active = false;

            caps.telemetry.event("map_session_closed", &[]);
        }

        fn build_markers(model: &Model) -> Vec<MarkerView> {
            let mut markers: Vec<DeviceMarker> = Vec::with_capacity(model.feed_markers.len() + 2);

            if let (Some(config), Some(fix)) = (model.config.as_ref(), model.device_fix) {
                markers.push(DeviceMarker {
                    id: DeviceId::new(config.device_name.clone()),
                    coordinate: fix,
                    timestamp: None,
                    kind: MarkerKind::SelfDevice,
                });
            }

            if let Some(reading) = model.last_reading.as_ref() {
                let id = reading.source_id.as_ref().map_or_else(
                    || DeviceId::new(TRACKED_DEVICE_FALLBACK_ID),
                    |sid| DeviceId::new(sid.as_str()),
                );
                markers.push(DeviceMarker {
                    id,
                    coordinate: reading.coordinate,
                    timestamp: reading.captured_at.clone(),
                    kind: MarkerKind::Tracked,
                });
            }

            // The live fix and reading are fresher than their feed echoes.
            for marker in &model.feed_markers {
                if markers.iter().any(|m| m.id == marker.id) {
                    continue;
                }
                markers.push(marker.clone());
            }

            markers.sort_by(|a, b| a.id.cmp(&b.id));

            markers
                .into_iter()
                .map(|m| MarkerView {
                    is_selected: model.selected_device.as_ref() == Some(&m.id),
                    device_id: m.id.to_string(),
                    lat: m.coordinate.lat(),
                    lon: m.coordinate.lon(),
                    kind: m.kind,
                    timestamp: m.timestamp,
                })
                .collect()
        }

        fn build_map_view(model: &Model) -> MapView {
            let places = model
                .places
                .iter()
                .map(|p| PlaceView {
                    id: p.id.as_str().to_string(),
                    name: p.name.clone(),
                    category: p.category.clone(),
                    lat: p.coordinate.lat(),
                    lon: p.coordinate.lon(),
                    distance_text: format_distance(p.distance_m),
                })
                .collect();

            let route: Vec<(f64, f64)> = model.route.iter().map(|c| (c.lat(), c.lon())).collect();
            let route_summary = (!model.route.is_empty())
                .then(|| format!("{} drive", format_distance(route_length_m(&model.route))));

            let stale_notice = model
                .poller
                .is_stale()
                .then(|| "The tracked device has not reported a new location.".to_string());

            MapView {
                center_lat: model.region.center.lat(),
                center_lon: model.region.center.lon(),
                lat_span: model.region.lat_span(),
                lon_span: model.region.lon_span(),
                zoom_step: model.region.zoom.step(),
                can_zoom_in: !model.region.zoom.is_narrowest(),
                can_zoom_out: !model.region.zoom.is_widest(),
                markers: Self::build_markers(model),
                route,
                route_summary,
                places,
                stale_notice,
                can_navigate: model.device_fix.is_some() && model.route_destination().is_some(),
            }
        }
    }

    impl crux_core::App for App {
        type Event = Event;
        type Model = Model;
        type ViewModel = ViewModel;
        type Capabilities = Capabilities;

        fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
            let event_name = event.name();
            caps.telemetry.counter(&format!("event.{event_name}"), 1);

            if event.is_user_initiated() {
                caps.telemetry
                    .event("user_action", &[("event", event_name)]);
            }

            // Everything except a fresh open is dropped once the screen
            // has been torn down; capability completions can straggle.
            if !model.screen_active && !matches!(event, Event::ScreenOpened(_)) {
                debug!(event = event_name, "dropping event for closed screen");
                return;
            }

            match event {
                Event::Noop => {}

                Event::ScreenOpened(config) => {
                    if model.screen_active {
                        Self::teardown(model, caps);
                    }

                    let config = *config;
                    let poller = Poller::with_policy(config.fetch_retry);
                    *model = Model {
                        screen_active: true,
                        permission: PermissionState::Requesting,
                        poller,
                        config: Some(config),
                        ..Model::default()
                    };

                    caps.telemetry.event("map_session_opened", &[]);

                    caps.key_value
                        .get(AUTH_TOKEN_KEY.to_string(), Event::TokenLoaded);
                    caps.location.request_permission(Event::PermissionUpdated);
                    caps.feed.subscribe(Event::FeedUpdated);

                    caps.render.render();
                }

                Event::ScreenClosed => {
                    Self::teardown(model, caps);
                }

                Event::TokenLoaded(result) => {
                    match result {
                        Ok(Some(bytes)) => match AuthToken::from_bytes(bytes) {
                            Ok(token) => {
                                caps.key_value
                                    .get(token.cache_key(), Event::CachedStateLoaded);
                                model.auth_token = Some(token);
                                caps.telemetry.event("session_token_loaded", &[]);
                                Self::begin_polling(model, caps);
                            }
                            Err(error) => Self::fail_init(model, caps, error),
                        },
                        Ok(None) => Self::fail_init(
                            model,
                            caps,
                            AppError::new(ErrorKind::Configuration, "No session token found"),
                        ),
                        Err(e) => Self::fail_init(
                            model,
                            caps,
                            AppError::new(ErrorKind::Storage, "Could not read the session token")
                                .with_internal(e.to_string()),
                        ),
                    }
                    caps.render.render();
                }

                Event::CachedStateLoaded(result) => match result {
                    Ok(Some(bytes)) => {
                        match ciborium::de::from_reader::<CachedMapState, _>(bytes.as_slice()) {
                            Ok(snapshot) if model.last_reading.is_none() => {
                                model.region = snapshot.region;
                                model.last_reading = Some(snapshot.reading);
                                caps.telemetry.counter("cache.restored", 1);
                                caps.render.render();
                            }
                            Ok(_) => {
                                // A live reading already landed; keep it.
                            }
                            Err(e) => {
                                warn!(error = %e, "discarding unreadable map snapshot");
                                caps.telemetry.error("cache_decode_failed", &e.to_string());
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "map snapshot read failed");
                        caps.telemetry.error("cache_read_failed", &e.to_string());
                    }
                },

                Event::CachePersisted(result) => {
                    if let Err(e) = result {
                        warn!(error = %e, "map snapshot write failed");
                        caps.telemetry.counter("cache.write_failed", 1);
                    }
                }

                Event::PermissionUpdated(outcome) => {
                    model.permission = outcome.into();
                    match outcome {
                        PermissionOutcome::Granted => {
                            model.init.permission_granted = true;
                            caps.location.watch_position(
                                GPS_TIME_INTERVAL_MS,
                                GPS_DISTANCE_INTERVAL_M,
                                |fix| Event::DeviceFixReceived(Box::new(fix)),
                            );
                            model.maybe_promote_ready();
                        }
                        PermissionOutcome::Denied | PermissionOutcome::Restricted => {
                            model.phase = LoadPhase::PermissionDenied;
                            model.set_error(AppError::new(
                                ErrorKind::LocationPermissionDenied,
                                "Location permission was not granted",
                            ));
                            caps.telemetry.counter("permission.denied", 1);
                        }
                    }
                    caps.render.render();
                }

                Event::DeviceFixReceived(result) => match *result {
                    Ok(fix) => match ValidatedCoordinate::new(fix.latitude, fix.longitude) {
                        Ok(coordinate) => {
                            let first_fix = model.device_fix.is_none();
                            model.device_fix = Some(coordinate);
                            model.init.device_fix = true;

                            if let Some(config) = model.config.as_ref() {
                                caps.feed.publish(FeedDevice {
                                    device_id: config.device_name.clone(),
                                    latitude: coordinate.lat(),
                                    longitude: coordinate.lon(),
                                    timestamp: None,
                                });
                            }

                            if first_fix
                                && model.last_reading.is_some()
                                && !model.init.route_concluded
                            {
                                Self::send_route(model, caps, false);
                            }

                            model.maybe_promote_ready();
                            caps.render.render();
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping invalid device fix");
                            caps.telemetry.error("invalid_device_fix", &e.to_string());
                        }
                    },
                    Err(watch_error) => {
                        caps.telemetry.error("gps_watch", &watch_error.to_string());
                        model.show_toast("GPS is unavailable right now.", ToastKind::Warning);
                        caps.render.render();
                    }
                },

                Event::PollTick { timer_id } => {
                    if model.poll_timer != Some(timer_id) {
                        debug!("ignoring tick from a cancelled poll timer");
                        return;
                    }

                    Self::schedule_poll_tick(model, caps);

                    match model.poller.begin_tick() {
                        TickDecision::Fetch {
                            generation,
                            attempt,
                        } => Self::send_tracker_fetch(model, caps, generation, attempt),
                        TickDecision::SkipInFlight => {
                            debug!("poll tick skipped; a fetch cycle is still running");
                            caps.telemetry.counter("tracker.tick_skipped", 1);
                        }
                    }
                }

                Event::PollRetry { generation } => {
                    if let Some(retry) = model.poller.begin_retry(generation) {
                        Self::send_tracker_fetch(model, caps, retry.generation, retry.attempt);
                    }
                }

                Event::FetchDeadline { generation } => {
                    if model.poller.is_current(generation) {
                        model.fetch_deadline = None;
                    }
                    caps.telemetry.counter("tracker.deadline", 1);
                    Self::handle_tracker_failure(
                        model,
                        caps,
                        generation,
                        &AppError::new(ErrorKind::Timeout, "Tracker fetch timed out"),
                    );
                }

                Event::RemoteFetched {
                    generation,
                    outcome,
                } => {
                    // A straggler from a superseded attempt must not cancel
                    // the live attempt's deadline.
                    if model.poller.is_current(generation) {
                        if let Some(deadline) = model.fetch_deadline.take() {
                            caps.timer.cancel(deadline);
                        }
                    }

                    match *outcome {
                        Ok(response) if response.is_success() => {
                            match tracker::parse_reading(&response.body) {
                                Ok(reading) => match model.poller.on_success(generation, &reading)
                                {
                                    Some(Freshness::Fresh) => {
                                        Self::apply_fresh_reading(model, caps, reading);
                                        caps.render.render();
                                    }
                                    Some(Freshness::Unchanged) => {
                                        // Same record as last time. Region and
                                        // route stay put; the view surfaces
                                        // the stale notice.
                                        caps.telemetry.counter("tracker.unchanged", 1);
                                        caps.render.render();
                                    }
                                    None => {
                                        caps.telemetry.counter("tracker.superseded", 1);
                                    }
                                },
                                Err(parse_err) => Self::handle_tracker_failure(
                                    model,
                                    caps,
                                    generation,
                                    &AppError::from(parse_err),
                                ),
                            }
                        }
                        Ok(response) => Self::handle_tracker_failure(
                            model,
                            caps,
                            generation,
                            &AppError::from_http_status(response.status, Some(&response.body)),
                        ),
                        Err(transport) => Self::handle_tracker_failure(
                            model,
                            caps,
                            generation,
                            &AppError::new(ErrorKind::Network, "Tracker fetch failed")
                                .with_internal(transport),
                        ),
                    }
                }

                Event::NavigatePressed => {
                    Self::send_route(model, caps, true);
                    caps.render.render();
                }

                Event::RouteFetched {
                    generation,
                    outcome,
                } => {
                    let attempt = match model.route_attempt {
                        Some(attempt) if attempt.generation == generation => {
                            model.route_attempt = None;
                            caps.timer.cancel(attempt.deadline_timer);
                            attempt
                        }
                        _ => {
                            caps.telemetry.counter("route.superseded", 1);
                            return;
                        }
                    };

                    match *outcome {
                        Ok(response) if response.is_success() => {
                            let parsed = {
                                let Some(config) = model.config.as_ref() else {
                                    return;
                                };
                                config.route_provider.parse_route(&response.body)
                            };

                            match parsed {
                                Ok(path) => {
                                    model.route = path;
                                    caps.telemetry.counter("route.resolved", 1);

                                    if attempt.user_initiated {
                                        if let Some(mid) = route_midpoint(&model.route) {
                                            let moved = model.region.center != mid;
                                            model.region = Region::new(
                                                mid,
                                                ZoomLevel::new(ROUTE_OVERVIEW_ZOOM_STEP),
                                            );
                                            if moved {
                                                Self::refresh_places(model, caps);
                                            }
                                        }
                                    }
                                    Self::conclude_init_route(model);
                                }
                                Err(RouteError::NoRoute) => {
                                    model.route.clear();
                                    if attempt.user_initiated {
                                        model.show_toast(
                                            "No driving route found between you and the device.",
                                            ToastKind::Info,
                                        );
                                    }
                                    caps.telemetry.counter("route.empty", 1);
                                    Self::conclude_init_route(model);
                                }
                                Err(e) => Self::route_attempt_failed(
                                    model,
                                    caps,
                                    attempt.user_initiated,
                                    &AppError::from(e),
                                ),
                            }
                        }
                        Ok(response) => Self::route_attempt_failed(
                            model,
                            caps,
                            attempt.user_initiated,
                            &AppError::from_http_status(response.status, Some(&response.body)),
                        ),
                        Err(transport) => Self::route_attempt_failed(
                            model,
                            caps,
                            attempt.user_initiated,
                            &AppError::new(ErrorKind::Network, "Route request failed")
                                .with_internal(transport),
                        ),
                    }

                    caps.render.render();
                }

                Event::RouteDeadline { generation } => {
                    let attempt = match model.route_attempt {
                        Some(attempt) if attempt.generation == generation => {
                            model.route_attempt = None;
                            attempt
                        }
                        _ => return,
                    };

                    Self::route_attempt_failed(
                        model,
                        caps,
                        attempt.user_initiated,
                        &AppError::new(ErrorKind::Timeout, "Route request timed out"),
                    );
                    caps.render.render();
                }

                Event::PlacesFetched {
                    generation,
                    outcome,
                } => {
                    if model.places_attempt.as_ref().map(|a| a.generation) != Some(generation) {
                        caps.telemetry.counter("places.superseded", 1);
                        return;
                    }
                    let Some(attempt) = model.places_attempt.take() else {
                        return;
                    };
                    caps.timer.cancel(attempt.deadline_timer);

                    match *outcome {
                        Ok(response) if response.is_success() => {
                            match attempt.provider.parse_places(&response.body) {
                                Ok(candidates) => {
                                    model.places =
                                        rank_places(attempt.center, candidates, MAX_PLACES);
                                    caps.telemetry.counter("places.resolved", 1);
                                    caps.render.render();
                                }
                                Err(e) => Self::places_attempt_failed(
                                    model,
                                    caps,
                                    &attempt,
                                    &AppError::from(e),
                                ),
                            }
                        }
                        Ok(response) => Self::places_attempt_failed(
                            model,
                            caps,
                            &attempt,
                            &AppError::from_http_status(response.status, Some(&response.body)),
                        ),
                        Err(transport) => Self::places_attempt_failed(
                            model,
                            caps,
                            &attempt,
                            &AppError::new(ErrorKind::Network, "Places request failed")
                                .with_internal(transport),
                        ),
                    }
                }

                Event::PlacesDeadline { generation } => {
                    if model.places_attempt.as_ref().map(|a| a.generation) != Some(generation) {
                        return;
                    }
                    let Some(attempt) = model.places_attempt.take() else {
                        return;
                    };

                    Self::places_attempt_failed(
                        model,
                        caps,
                        &attempt,
                        &AppError::new(ErrorKind::Timeout, "Places request timed out"),
                    );
                }

                Event::FeedUpdated(snapshot) => {
                    let own_name = model.config.as_ref().map(|c| c.device_name.clone());
                    let tracked_id = model
                        .last_reading
                        .as_ref()
                        .and_then(|r| r.source_id.as_ref())
                        .map(|id| id.as_str().to_string());

                    let received = snapshot.devices.len();
                    model.feed_markers = snapshot
                        .devices
                        .into_iter()
                        .filter_map(|device| {
                            let coordinate =
                                ValidatedCoordinate::new(device.latitude, device.longitude).ok()?;
                            let kind = if Some(&device.device_id) == own_name.as_ref() {
                                MarkerKind::SelfDevice
                            } else if Some(&device.device_id) == tracked_id.as_ref() {
                                MarkerKind::Tracked
                            } else {
                                MarkerKind::Peer
                            };
                            Some(DeviceMarker {
                                id: DeviceId::new(device.device_id),
                                coordinate,
                                timestamp: device.timestamp,
                                kind,
                            })
                        })
                        .collect();

                    let dropped = received - model.feed_markers.len();
                    if dropped > 0 {
                        caps.telemetry
                            .counter("feed.dropped_invalid", dropped as u64);
                    }

                    caps.render.render();
                }

                Event::ZoomInPressed => {
                    model.region = model.region.zoomed_in();
                    caps.render.render();
                }

                Event::ZoomOutPressed => {
                    model.region = model.region.zoomed_out();
                    caps.render.render();
                }

                Event::RecenterPressed => {
                    let target = model.initial_region.unwrap_or_else(|| {
                        model
                            .last_reading
                            .as_ref()
                            .map_or_else(Region::default, |r| {
                                Region::new(r.coordinate, ZoomLevel::default())
                            })
                    });

                    let center_changed = model.region.center != target.center;
                    model.region = target;
                    model.selected_device = None;
                    Self::drop_route_overlay(model, caps);

                    if center_changed {
                        Self::refresh_places(model, caps);
                    }
                    caps.render.render();
                }

                Event::DeviceSelected { device_id } => {
                    let id = DeviceId::new(device_id);
                    match model.marker_position(&id) {
                        Some(coordinate) => {
                            model.selected_device = Some(id);
                            let center_changed = model.region.center != coordinate;
                            model.region = Region::new(coordinate, ZoomLevel::default());
                            Self::drop_route_overlay(model, caps);

                            if center_changed {
                                Self::refresh_places(model, caps);
                            }
                            caps.render.render();
                        }
                        None => {
                            debug!("selected device is not on the map");
                            model.show_toast(
                                "That device is no longer on the map.",
                                ToastKind::Info,
                            );
                            caps.render.render();
                        }
                    }
                }

                Event::DismissError => {
                    model.clear_error();
                    caps.render.render();
                }

                Event::DismissToast => {
                    model.clear_toast();
                    caps.render.render();
                }
            }
        }

        fn view(&self, model: &Model) -> ViewModel {
            let state = match model.phase {
                LoadPhase::Initializing => ViewState::Loading,
                LoadPhase::PermissionDenied => ViewState::PermissionDenied {
                    permission_state: model.permission,
                },
                LoadPhase::InitError => ViewState::LoadFailed {
                    message: model.active_error.as_ref().map_or_else(
                        || "Something went wrong while opening the map.".into(),
                        AppError::user_facing_message,
                    ),
                    is_retryable: model
                        .active_error
                        .as_ref()
                        .is_some_and(AppError::is_retryable),
                },
                LoadPhase::Ready => ViewState::Ready {
                    map: Self::build_map_view(model),
                },
            };

            ViewModel {
                state,
                error: model.active_error.as_ref().map(UserFacingError::from),
                toast: model.active_toast.as_ref().map(ToastView::from),
                is_fetching: model.poller.is_in_flight(),
            }
        }
    }
}
