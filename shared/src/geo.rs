//! Geodesic math and map-region primitives.
//!
//! Everything here is pure: coordinate validation, great-circle distance,
//! the encoded-polyline codec used by the directions provider, and the
//! discrete zoom ladder the map region moves on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DEFAULT_ZOOM_STEP, EARTH_RADIUS_M, FALLBACK_CENTER_LAT, FALLBACK_CENTER_LON, SPAN_ZOOM_LADDER};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PolylineError {
    #[error("Encoded polyline contains invalid byte {byte:#04x} at offset {offset}")]
    InvalidByte { byte: u8, offset: usize },
    #[error("Encoded polyline ends mid-sequence at offset {offset}")]
    Truncated { offset: usize },
    #[error("Encoded polyline has a latitude with no matching longitude")]
    MissingLongitude,
    #[error("Decoded point {index} is not a valid coordinate: {source}")]
    InvalidPoint {
        index: usize,
        source: CoordinateError,
    },
}

/// Plain lat/lon pair, unvalidated. Wire types deserialize into this
/// before being promoted to [`ValidatedCoordinate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    #[must_use]
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn validate(self) -> Result<ValidatedCoordinate, CoordinateError> {
        ValidatedCoordinate::new(self.lat, self.lon)
    }
}

/// A coordinate that has passed range and finiteness checks. The only way
/// to construct one is through [`ValidatedCoordinate::new`], so any value
/// of this type is safe to feed into distance math and the view.
/// Deserialization funnels through the same check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LatLon", into = "LatLon")]
pub struct ValidatedCoordinate {
    lat: f64,
    lon: f64,
}

impl ValidatedCoordinate {
    pub fn new(lat: f64, lon: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !lon.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(CoordinateError::LongitudeOutOfRange(lon));
        }
        Ok(Self { lat, lon })
    }

    #[must_use]
    pub const fn lat(self) -> f64 {
        self.lat
    }

    #[must_use]
    pub const fn lon(self) -> f64 {
        self.lon
    }

    #[must_use]
    pub const fn as_tuple(self) -> (f64, f64) {
        (self.lat, self.lon)
    }

    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        haversine_distance(self, other)
    }
}

impl Default for ValidatedCoordinate {
    fn default() -> Self {
        Self { lat: 0.0, lon: 0.0 }
    }
}

impl TryFrom<(f64, f64)> for ValidatedCoordinate {
    type Error = CoordinateError;

    fn try_from((lat, lon): (f64, f64)) -> Result<Self, Self::Error> {
        Self::new(lat, lon)
    }
}

impl TryFrom<LatLon> for ValidatedCoordinate {
    type Error = CoordinateError;

    fn try_from(value: LatLon) -> Result<Self, Self::Error> {
        Self::new(value.lat, value.lon)
    }
}

impl From<ValidatedCoordinate> for LatLon {
    fn from(coord: ValidatedCoordinate) -> Self {
        Self {
            lat: coord.lat,
            lon: coord.lon,
        }
    }
}

#[must_use]
pub fn is_valid_coordinate(lat: f64, lon: f64) -> bool {
    ValidatedCoordinate::new(lat, lon).is_ok()
}

/// Great-circle distance in meters on the mean-radius sphere.
///
/// Identical inputs short-circuit to exactly 0.0 so callers can rely on
/// the zero property without floating-point noise.
#[must_use]
pub fn haversine_distance(p1: ValidatedCoordinate, p2: ValidatedCoordinate) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (p1.lat - p2.lat).abs() < EPSILON && (p1.lon - p2.lon).abs() < EPSILON {
        return 0.0;
    }

    let lat1_rad = p1.lat.to_radians();
    let lat2_rad = p2.lat.to_radians();
    let delta_lat = (p2.lat - p1.lat).to_radians();
    let delta_lon = (p2.lon - p1.lon).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);

    // Rounding can push `a` a hair outside [0, 1], which would NaN the asin.
    let a = a.clamp(0.0, 1.0);

    let c = 2.0 * a.sqrt().asin();

    let result = EARTH_RADIUS_M * c;

    if result.is_finite() {
        result
    } else {
        f64::MAX
    }
}

#[must_use]
pub fn format_distance(meters: f64) -> String {
    if !meters.is_finite() || meters < 0.0 {
        return "Unknown".to_string();
    }

    if meters < 1000.0 {
        format!("{meters:.0} m")
    } else if meters < 10_000.0 {
        format!("{:.1} km", meters / 1000.0)
    } else {
        format!("{:.0} km", meters / 1000.0)
    }
}

/// Decodes a Google-style encoded polyline (1e-5 precision) into validated
/// points. Unlike the usual permissive decoders this one rejects malformed
/// input: truncated 5-bit sequences, bytes outside the printable window,
/// and decoded points that fall outside coordinate range all produce a
/// [`PolylineError`] instead of garbage coordinates.
pub fn decode_polyline(encoded: &str) -> Result<Vec<ValidatedCoordinate>, PolylineError> {
    const CHUNK_BITS: u32 = 5;
    const CONTINUE_MASK: i64 = 0x20;

    let bytes = encoded.as_bytes();
    let mut points = Vec::new();
    let mut offset = 0usize;
    let mut lat_e5: i64 = 0;
    let mut lon_e5: i64 = 0;

    fn next_delta(bytes: &[u8], offset: &mut usize) -> Result<i64, PolylineError> {
        let mut result: i64 = 0;
        let mut shift: u32 = 0;
        loop {
            let Some(&byte) = bytes.get(*offset) else {
                return Err(PolylineError::Truncated { offset: *offset });
            };
            if !(63..=126).contains(&byte) {
                return Err(PolylineError::InvalidByte {
                    byte,
                    offset: *offset,
                });
            }
            *offset += 1;

            let chunk = i64::from(byte) - 63;
            result |= (chunk & (CONTINUE_MASK - 1)) << shift;
            shift += CHUNK_BITS;
            if chunk & CONTINUE_MASK == 0 {
                break;
            }
            if shift > 60 {
                // A well-formed delta fits easily; anything longer is garbage.
                return Err(PolylineError::Truncated { offset: *offset });
            }
        }
        if result & 1 == 1 {
            Ok(!(result >> 1))
        } else {
            Ok(result >> 1)
        }
    }

    while offset < bytes.len() {
        lat_e5 += next_delta(bytes, &mut offset)?;
        if offset >= bytes.len() {
            return Err(PolylineError::MissingLongitude);
        }
        lon_e5 += next_delta(bytes, &mut offset)?;

        let index = points.len();
        let point = ValidatedCoordinate::new(lat_e5 as f64 / 1e5, lon_e5 as f64 / 1e5)
            .map_err(|source| PolylineError::InvalidPoint { index, source })?;
        points.push(point);
    }

    Ok(points)
}

/// Discrete zoom position on [`SPAN_ZOOM_LADDER`]. Step 0 is the widest
/// span; stepping past either end of the ladder is a no-op. Deserialized
/// values are clamped onto the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "usize", into = "usize")]
pub struct ZoomLevel(usize);

impl ZoomLevel {
    #[must_use]
    pub fn new(step: usize) -> Self {
        Self(step.min(SPAN_ZOOM_LADDER.len() - 1))
    }

    #[must_use]
    pub const fn step(self) -> usize {
        self.0
    }

    #[must_use]
    pub fn span(self) -> f64 {
        SPAN_ZOOM_LADDER[self.0]
    }

    #[must_use]
    pub fn zoomed_in(self) -> Self {
        Self::new(self.0.saturating_add(1))
    }

    #[must_use]
    pub const fn zoomed_out(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    #[must_use]
    pub const fn is_widest(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn is_narrowest(self) -> bool {
        self.0 == SPAN_ZOOM_LADDER.len() - 1
    }
}

impl Default for ZoomLevel {
    fn default() -> Self {
        Self::new(DEFAULT_ZOOM_STEP)
    }
}

impl From<usize> for ZoomLevel {
    fn from(step: usize) -> Self {
        Self::new(step)
    }
}

impl From<ZoomLevel> for usize {
    fn from(zoom: ZoomLevel) -> Self {
        zoom.0
    }
}

/// Visible map window: a validated center plus a ladder position. Spans
/// are always read off the ladder, so a region can never hold an arbitrary
/// or non-monotonic zoom value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub center: ValidatedCoordinate,
    pub zoom: ZoomLevel,
}

impl Region {
    #[must_use]
    pub const fn new(center: ValidatedCoordinate, zoom: ZoomLevel) -> Self {
        Self { center, zoom }
    }

    #[must_use]
    pub fn lat_span(self) -> f64 {
        self.zoom.span()
    }

    #[must_use]
    pub fn lon_span(self) -> f64 {
        self.zoom.span()
    }

    #[must_use]
    pub const fn with_center(self, center: ValidatedCoordinate) -> Self {
        Self {
            center,
            zoom: self.zoom,
        }
    }

    #[must_use]
    pub fn zoomed_in(self) -> Self {
        Self {
            center: self.center,
            zoom: self.zoom.zoomed_in(),
        }
    }

    #[must_use]
    pub const fn zoomed_out(self) -> Self {
        Self {
            center: self.center,
            zoom: self.zoom.zoomed_out(),
        }
    }
}

impl Default for Region {
    fn default() -> Self {
        let center = ValidatedCoordinate::new(FALLBACK_CENTER_LAT, FALLBACK_CENTER_LON)
            .unwrap_or_default();
        Self {
            center,
            zoom: ZoomLevel::default(),
        }
    }
}
