//! Route resolution: building the directions request for the configured
//! provider and parsing its response into an ordered, validated path.
//!
//! Resolution is single-shot. Any failure here collapses to "no route" at
//! the reducer, which clears the overlay; nothing is cached or retried.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::geo::{haversine_distance, PolylineError, ValidatedCoordinate};

const DIRECTIONS_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/directions/json";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RouteError {
    #[error("No route between the requested points")]
    NoRoute,
    #[error("Directions response is malformed: {0}")]
    MalformedResponse(String),
    #[error("Directions provider rejected the request: {0}")]
    ProviderStatus(String),
    #[error("Route geometry failed to decode: {0}")]
    Geometry(#[from] PolylineError),
}

/// Which directions service the session talks to. Both styles resolve a
/// driving route; they differ in how the geometry comes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteProvider {
    /// Google-Directions-compatible API. Geometry is an encoded polyline
    /// decoded with [`crate::geo::decode_polyline`].
    Directions { api_key: String },
    /// OSRM-compatible API. Geometry arrives as a GeoJSON `LineString`
    /// in longitude-latitude order.
    Osrm { base_url: String },
}

impl RouteProvider {
    #[must_use]
    pub fn request_url(
        &self,
        origin: ValidatedCoordinate,
        destination: ValidatedCoordinate,
    ) -> String {
        match self {
            Self::Directions { api_key } => format!(
                "{DIRECTIONS_ENDPOINT}?origin={},{}&destination={},{}&mode=driving&key={}",
                origin.lat(),
                origin.lon(),
                destination.lat(),
                destination.lon(),
                api_key,
            ),
            Self::Osrm { base_url } => format!(
                "{}/route/v1/driving/{},{};{},{}?overview=full&geometries=geojson",
                base_url.trim_end_matches('/'),
                origin.lon(),
                origin.lat(),
                destination.lon(),
                destination.lat(),
            ),
        }
    }

    pub fn parse_route(&self, body: &[u8]) -> Result<Vec<ValidatedCoordinate>, RouteError> {
        let path = match self {
            Self::Directions { .. } => parse_directions(body)?,
            Self::Osrm { .. } => parse_osrm(body)?,
        };
        if path.is_empty() {
            return Err(RouteError::NoRoute);
        }
        Ok(path)
    }
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    overview_polyline: OverviewPolyline,
}

#[derive(Debug, Deserialize)]
struct OverviewPolyline {
    #[serde(default)]
    points: String,
}

fn parse_directions(body: &[u8]) -> Result<Vec<ValidatedCoordinate>, RouteError> {
    let response: DirectionsResponse = serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "directions body did not parse");
        RouteError::MalformedResponse(e.to_string())
    })?;

    match response.status.as_str() {
        "OK" => {}
        "ZERO_RESULTS" => return Err(RouteError::NoRoute),
        other => return Err(RouteError::ProviderStatus(other.to_string())),
    }

    let Some(route) = response.routes.first() else {
        return Err(RouteError::NoRoute);
    };

    Ok(crate::geo::decode_polyline(&route.overview_polyline.points)?)
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    #[serde(default)]
    code: String,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: geojson::Geometry,
}

fn parse_osrm(body: &[u8]) -> Result<Vec<ValidatedCoordinate>, RouteError> {
    let response: OsrmResponse = serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "osrm body did not parse");
        RouteError::MalformedResponse(e.to_string())
    })?;

    match response.code.as_str() {
        "Ok" => {}
        "NoRoute" => return Err(RouteError::NoRoute),
        other => return Err(RouteError::ProviderStatus(other.to_string())),
    }

    let Some(route) = response.routes.first() else {
        return Err(RouteError::NoRoute);
    };

    let geojson::Value::LineString(positions) = &route.geometry.value else {
        return Err(RouteError::MalformedResponse(
            "route geometry is not a LineString".into(),
        ));
    };

    positions
        .iter()
        .map(|position| {
            let (Some(&lon), Some(&lat)) = (position.first(), position.get(1)) else {
                return Err(RouteError::MalformedResponse(
                    "position with fewer than two ordinates".into(),
                ));
            };
            ValidatedCoordinate::new(lat, lon)
                .map_err(|e| RouteError::MalformedResponse(e.to_string()))
        })
        .collect()
}

/// Point the map centers on when fitting a resolved route: the middle
/// vertex of the path.
#[must_use]
pub fn route_midpoint(path: &[ValidatedCoordinate]) -> Option<ValidatedCoordinate> {
    if path.is_empty() {
        None
    } else {
        Some(path[path.len() / 2])
    }
}

/// Sum of the great-circle leg lengths, for the route summary line.
#[must_use]
pub fn route_length_m(path: &[ValidatedCoordinate]) -> f64 {
    path.windows(2)
        .map(|leg| haversine_distance(leg[0], leg[1]))
        .sum()
}
