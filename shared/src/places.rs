//! Nearby-places lookup: query building and response parsing for the two
//! interchangeable providers, plus the ranking that turns raw candidates
//! into the overlay's top results.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::geo::{haversine_distance, LatLon, ValidatedCoordinate};

const GEOAPIFY_ENDPOINT: &str = "https://api.geoapify.com/v2/places";
const PROVIDER_RESULT_LIMIT: u32 = 20;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlacesError {
    #[error("Places response is malformed: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceCategory {
    Restaurant,
    Cafe,
    Pharmacy,
    Hospital,
}

impl PlaceCategory {
    #[must_use]
    pub const fn overpass_amenity(self) -> &'static str {
        match self {
            Self::Restaurant => "restaurant",
            Self::Cafe => "cafe",
            Self::Pharmacy => "pharmacy",
            Self::Hospital => "hospital",
        }
    }

    #[must_use]
    pub const fn geoapify_category(self) -> &'static str {
        match self {
            Self::Restaurant => "catering.restaurant",
            Self::Cafe => "catering.cafe",
            Self::Pharmacy => "healthcare.pharmacy",
            Self::Hospital => "healthcare.hospital",
        }
    }
}

/// Provider-scoped identity of a place, used only for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaceId(String);

impl PlaceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Candidate straight off the wire, before validation and ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceCandidate {
    pub id: PlaceId,
    pub name: String,
    pub category: String,
    pub position: LatLon,
}

/// Ranked, distance-annotated place shown on the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOfInterest {
    pub id: PlaceId,
    pub name: String,
    pub category: String,
    pub coordinate: ValidatedCoordinate,
    pub distance_m: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacesQuery {
    pub center: ValidatedCoordinate,
    pub radius_m: u32,
    pub categories: Vec<PlaceCategory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacesProvider {
    /// Overpass-compatible endpoint queried with Overpass QL through
    /// `interpreter?data=`.
    Overpass { endpoint: String },
    /// Geoapify-compatible places API returning GeoJSON features.
    Geoapify { api_key: String },
}

impl PlacesProvider {
    /// Short label for telemetry and notices.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Overpass { .. } => "overpass",
            Self::Geoapify { .. } => "geoapify",
        }
    }

    #[must_use]
    pub fn request_url(&self, query: &PlacesQuery) -> String {
        match self {
            Self::Overpass { endpoint } => {
                let data = url::form_urlencoded::Serializer::new(String::new())
                    .append_pair("data", &overpass_query(query))
                    .finish();
                format!("{}?{data}", endpoint.trim_end_matches('/'))
            }
            Self::Geoapify { api_key } => {
                let categories = query
                    .categories
                    .iter()
                    .map(|c| c.geoapify_category())
                    .collect::<Vec<_>>()
                    .join(",");
                let (lat, lon) = query.center.as_tuple();
                format!(
                    "{GEOAPIFY_ENDPOINT}?categories={categories}\
                     &filter=circle:{lon},{lat},{radius}\
                     &bias=proximity:{lon},{lat}\
                     &limit={PROVIDER_RESULT_LIMIT}&apiKey={api_key}",
                    radius = query.radius_m,
                )
            }
        }
    }

    pub fn parse_places(&self, body: &[u8]) -> Result<Vec<PlaceCandidate>, PlacesError> {
        match self {
            Self::Overpass { .. } => parse_overpass(body),
            Self::Geoapify { .. } => parse_geoapify(body),
        }
    }
}

fn overpass_query(query: &PlacesQuery) -> String {
    let (lat, lon) = query.center.as_tuple();
    let radius = query.radius_m;

    let mut selectors = String::new();
    for category in &query.categories {
        let amenity = category.overpass_amenity();
        // Ways and relations carry their position in `center`, hence `out center`.
        for kind in ["node", "way", "relation"] {
            selectors.push_str(&format!(
                "{kind}[\"amenity\"=\"{amenity}\"](around:{radius},{lat},{lon});"
            ));
        }
    }

    format!("[out:json][timeout:10];({selectors});out center;")
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    #[serde(rename = "type")]
    kind: String,
    id: i64,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    center: Option<OverpassCenter>,
    #[serde(default)]
    tags: OverpassTags,
}

#[derive(Debug, Deserialize)]
struct OverpassCenter {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Default, Deserialize)]
struct OverpassTags {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    amenity: Option<String>,
}

fn parse_overpass(body: &[u8]) -> Result<Vec<PlaceCandidate>, PlacesError> {
    let response: OverpassResponse = serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "overpass body did not parse");
        PlacesError::MalformedResponse(e.to_string())
    })?;

    let candidates = response
        .elements
        .into_iter()
        .filter_map(|element| {
            let position = match (element.lat, element.lon, element.center) {
                (Some(lat), Some(lon), _) => LatLon::new(lat, lon),
                (_, _, Some(center)) => LatLon::new(center.lat, center.lon),
                _ => return None,
            };
            Some(PlaceCandidate {
                id: PlaceId::new(format!("{}/{}", element.kind, element.id)),
                name: element
                    .tags
                    .name
                    .unwrap_or_else(|| "Unnamed place".to_string()),
                category: element
                    .tags
                    .amenity
                    .unwrap_or_else(|| "unknown".to_string()),
                position,
            })
        })
        .collect();

    Ok(candidates)
}

fn parse_geoapify(body: &[u8]) -> Result<Vec<PlaceCandidate>, PlacesError> {
    let collection: geojson::FeatureCollection = serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "geoapify body did not parse");
        PlacesError::MalformedResponse(e.to_string())
    })?;

    let candidates = collection
        .features
        .into_iter()
        .filter_map(|feature| {
            let geometry = feature.geometry?;
            let geojson::Value::Point(position) = geometry.value else {
                return None;
            };
            let (&lon, &lat) = (position.first()?, position.get(1)?);

            let properties = feature.properties?;
            let id = properties.get("place_id")?.as_str()?.to_string();
            let name = properties
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("Unnamed place")
                .to_string();
            let category = properties
                .get("categories")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();

            Some(PlaceCandidate {
                id: PlaceId::new(id),
                name,
                category,
                position: LatLon::new(lat, lon),
            })
        })
        .collect();

    Ok(candidates)
}

/// Deduplicates by id, validates positions, annotates distance from the
/// query center, sorts ascending, and keeps the closest `limit`.
#[must_use]
pub fn rank_places(
    center: ValidatedCoordinate,
    candidates: Vec<PlaceCandidate>,
    limit: usize,
) -> Vec<PlaceOfInterest> {
    let mut seen = HashSet::new();

    let mut ranked: Vec<PlaceOfInterest> = candidates
        .into_iter()
        .filter_map(|candidate| {
            if !seen.insert(candidate.id.clone()) {
                return None;
            }
            let coordinate = candidate.position.validate().ok()?;
            Some(PlaceOfInterest {
                distance_m: haversine_distance(center, coordinate),
                id: candidate.id,
                name: candidate.name,
                category: candidate.category,
                coordinate,
            })
        })
        .collect();

    ranked.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn center() -> ValidatedCoordinate {
        ValidatedCoordinate::new(14.6256, 121.1224).unwrap()
    }

    fn query() -> PlacesQuery {
        PlacesQuery {
            center: center(),
            radius_m: 500,
            categories: vec![PlaceCategory::Restaurant],
        }
    }

    fn candidate(id: &str, lat: f64, lon: f64) -> PlaceCandidate {
        PlaceCandidate {
            id: PlaceId::new(id),
            name: format!("Place {id}"),
            category: "restaurant".into(),
            position: LatLon::new(lat, lon),
        }
    }

    mod query_tests {
        use super::*;

        #[test]
        fn test_overpass_query_shape() {
            let ql = overpass_query(&query());
            assert!(ql.starts_with("[out:json][timeout:10];("));
            assert!(ql.contains("node[\"amenity\"=\"restaurant\"](around:500,14.6256,121.1224);"));
            assert!(ql.contains("way[\"amenity\"=\"restaurant\"]"));
            assert!(ql.ends_with(");out center;"));
        }

        #[test]
        fn test_overpass_url_is_form_encoded() {
            let provider = PlacesProvider::Overpass {
                endpoint: "https://overpass.example.com/api/interpreter".into(),
            };
            let url = provider.request_url(&query());
            assert!(url.starts_with("https://overpass.example.com/api/interpreter?data="));
            // The QL must be percent-encoded, not raw.
            assert!(!url.contains('['));
            assert!(url.contains("%5Bout%3Ajson%5D"));
        }

        #[test]
        fn test_geoapify_url_filters_by_circle() {
            let provider = PlacesProvider::Geoapify {
                api_key: "k123".into(),
            };
            let url = provider.request_url(&query());
            assert!(url.contains("categories=catering.restaurant"));
            assert!(url.contains("filter=circle:121.1224,14.6256,500"));
            assert!(url.contains("apiKey=k123"));
        }
    }

    mod overpass_tests {
        use super::*;

        #[test]
        fn test_parses_nodes_and_way_centers() {
            let body = br#"{
                "elements": [
                    {"type": "node", "id": 1, "lat": 14.626, "lon": 121.123,
                     "tags": {"name": "Kanin Corner", "amenity": "restaurant"}},
                    {"type": "way", "id": 2,
                     "center": {"lat": 14.627, "lon": 121.124},
                     "tags": {"amenity": "restaurant"}},
                    {"type": "node", "id": 3}
                ]
            }"#;

            let provider = PlacesProvider::Overpass {
                endpoint: "https://overpass.example.com/api/interpreter".into(),
            };
            let candidates = provider.parse_places(body).expect("parses");

            assert_eq!(candidates.len(), 2);
            assert_eq!(candidates[0].id, PlaceId::new("node/1"));
            assert_eq!(candidates[0].name, "Kanin Corner");
            assert_eq!(candidates[1].id, PlaceId::new("way/2"));
            assert_eq!(candidates[1].name, "Unnamed place");
            assert!((candidates[1].position.lat - 14.627).abs() < 1e-9);
        }

        #[test]
        fn test_malformed_body_is_rejected() {
            let provider = PlacesProvider::Overpass {
                endpoint: "https://overpass.example.com/api/interpreter".into(),
            };
            assert!(matches!(
                provider.parse_places(b"<html>gateway timeout</html>"),
                Err(PlacesError::MalformedResponse(_))
            ));
        }
    }

    mod geoapify_tests {
        use super::*;

        #[test]
        fn test_parses_feature_collection() {
            let body = br#"{
                "type": "FeatureCollection",
                "features": [
                    {
                        "type": "Feature",
                        "geometry": {"type": "Point", "coordinates": [121.123, 14.626]},
                        "properties": {
                            "place_id": "p-1",
                            "name": "Lugaw Republic",
                            "categories": ["catering.restaurant"]
                        }
                    },
                    {
                        "type": "Feature",
                        "geometry": {"type": "Point", "coordinates": [121.124, 14.627]},
                        "properties": {"place_id": "p-2"}
                    }
                ]
            }"#;

            let provider = PlacesProvider::Geoapify {
                api_key: "k".into(),
            };
            let candidates = provider.parse_places(body).expect("parses");

            assert_eq!(candidates.len(), 2);
            assert_eq!(candidates[0].id, PlaceId::new("p-1"));
            assert_eq!(candidates[0].name, "Lugaw Republic");
            assert_eq!(candidates[0].category, "catering.restaurant");
            assert!((candidates[0].position.lat - 14.626).abs() < 1e-9);
            assert_eq!(candidates[1].name, "Unnamed place");
        }
    }

    mod ranking_tests {
        use super::*;

        #[test]
        fn test_seven_candidates_keep_closest_five_sorted() {
            let c = center();
            // Offsets in increasing distance order, shuffled on input.
            let candidates = vec![
                candidate("d", c.lat() + 0.004, c.lon()),
                candidate("a", c.lat() + 0.001, c.lon()),
                candidate("g", c.lat() + 0.007, c.lon()),
                candidate("b", c.lat() + 0.002, c.lon()),
                candidate("f", c.lat() + 0.006, c.lon()),
                candidate("c", c.lat() + 0.003, c.lon()),
                candidate("e", c.lat() + 0.005, c.lon()),
            ];

            let ranked = rank_places(c, candidates, 5);

            let ids: Vec<&str> = ranked.iter().map(|p| p.id.as_str()).collect();
            assert_eq!(ids, ["a", "b", "c", "d", "e"]);
            for pair in ranked.windows(2) {
                assert!(pair[0].distance_m <= pair[1].distance_m);
            }
        }

        #[test]
        fn test_duplicate_ids_are_collapsed() {
            let c = center();
            let candidates = vec![
                candidate("a", c.lat() + 0.001, c.lon()),
                candidate("a", c.lat() + 0.002, c.lon()),
                candidate("b", c.lat() + 0.003, c.lon()),
            ];

            let ranked = rank_places(c, candidates, 5);
            assert_eq!(ranked.len(), 2);
            assert_eq!(ranked[0].id, PlaceId::new("a"));
        }

        #[test]
        fn test_invalid_positions_are_dropped() {
            let c = center();
            let candidates = vec![
                candidate("a", c.lat() + 0.001, c.lon()),
                candidate("bad", 120.0, 500.0),
            ];

            let ranked = rank_places(c, candidates, 5);
            assert_eq!(ranked.len(), 1);
        }

        #[test]
        fn test_distance_annotation_matches_haversine() {
            let c = center();
            let candidates = vec![candidate("a", c.lat() + 0.001, c.lon())];
            let ranked = rank_places(c, candidates, 5);

            let expected = haversine_distance(
                c,
                ValidatedCoordinate::new(c.lat() + 0.001, c.lon()).unwrap(),
            );
            assert!((ranked[0].distance_m - expected).abs() < 1e-6);
        }
    }
}
