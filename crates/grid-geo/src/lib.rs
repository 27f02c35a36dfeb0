//! Geocoding and geodesic distance for PlayGrid placement decisions.
//!
//! [`Geocoder`] resolves `(city, region, country)` tuples against a
//! Nominatim-style gazetteer with a process-lifetime cache; [`distance_km`]
//! is the Haversine great-circle distance. Gazetteer failures degrade to
//! unknown rather than propagating: placement ranking continues with the
//! candidates it can resolve.

#![forbid(unsafe_code)]

use grid_proto::Coord;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const EARTH_RADIUS_KM: f64 = 6371.0;
const GAZETTEER_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("coordinate out of domain: lat {lat}, lon {lon}")]
    BadCoord { lat: f64, lon: f64 },
}

// ─── Distance ────────────────────────────────────────────────────────────────

/// Great-circle distance in kilometres (Haversine, R = 6371 km).
pub fn distance_km(a: Coord, b: Coord) -> Result<f64, GeoError> {
    for c in [a, b] {
        if !c.is_valid() {
            return Err(GeoError::BadCoord { lat: c.lat, lon: c.lon });
        }
    }

    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().asin();

    Ok(EARTH_RADIUS_KM * c)
}

// ─── Geocoder ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GazetteerHit {
    lat: String,
    lon: String,
}

/// Place-name resolver with a process-local cache.
///
/// Successful resolutions and definitive "no such place" answers are cached
/// for the process lifetime (`None` marks unresolvable tuples so they are
/// not looked up again). Transport errors are not cached; the next resolve
/// for the same tuple retries.
pub struct Geocoder {
    client: reqwest::Client,
    base_url: String,
    cache: RwLock<HashMap<String, Option<Coord>>>,
}

impl Geocoder {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(GAZETTEER_TIMEOUT_SECS))
            .user_agent("playgrid-gridd/0.1")
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a place triple to a coordinate. `None` means unknown: either
    /// the gazetteer had no answer, or the lookup failed this time.
    pub async fn resolve(
        &self,
        city: &str,
        region: Option<&str>,
        country: Option<&str>,
    ) -> Option<Coord> {
        let key = cache_key(city, region, country);

        if let Some(cached) = self.cache.read().get(&key) {
            return *cached;
        }

        match self.lookup(city, region, country).await {
            Ok(resolved) => {
                // Cache hits and definitive misses alike.
                self.cache.write().insert(key, resolved);
                resolved
            }
            Err(e) => {
                warn!(city, error = %e, "gazetteer lookup failed, treating as unknown");
                None
            }
        }
    }

    /// Pre-seed a cache entry. Used for static region tables and tests.
    pub fn prime(&self, city: &str, region: Option<&str>, country: Option<&str>, coord: Coord) {
        self.cache
            .write()
            .insert(cache_key(city, region, country), Some(coord));
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    async fn lookup(
        &self,
        city: &str,
        region: Option<&str>,
        country: Option<&str>,
    ) -> Result<Option<Coord>, reqwest::Error> {
        let mut query: Vec<(&str, &str)> =
            vec![("city", city), ("format", "json"), ("limit", "1")];
        if let Some(region) = region {
            query.push(("state", region));
        }
        if let Some(country) = country {
            query.push(("country", country));
        }

        let hits: Vec<GazetteerHit> = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(hit) = hits.first() else {
            debug!(city, "gazetteer returned no match");
            return Ok(None);
        };

        let (Ok(lat), Ok(lon)) = (hit.lat.parse::<f64>(), hit.lon.parse::<f64>()) else {
            debug!(city, "gazetteer returned unparseable coordinates");
            return Ok(None);
        };

        let coord = Coord::new(lat, lon);
        if !coord.is_valid() {
            debug!(city, lat, lon, "gazetteer coordinate out of domain");
            return Ok(None);
        }
        Ok(Some(coord))
    }
}

fn cache_key(city: &str, region: Option<&str>, country: Option<&str>) -> String {
    format!(
        "{}|{}|{}",
        city.trim().to_lowercase(),
        region.unwrap_or("").trim().to_lowercase(),
        country.unwrap_or("").trim().to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const NYC: Coord = Coord { lat: 40.7128, lon: -74.0060 };
    const BOSTON: Coord = Coord { lat: 42.3601, lon: -71.0589 };
    const DALLAS: Coord = Coord { lat: 32.7767, lon: -96.7970 };

    #[test]
    fn test_distance_zero_for_same_point() {
        assert_eq!(distance_km(NYC, NYC).unwrap(), 0.0);
    }

    #[test]
    fn test_distance_symmetric() {
        let ab = distance_km(NYC, BOSTON).unwrap();
        let ba = distance_km(BOSTON, NYC).unwrap();
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn test_distance_known_pairs() {
        // NYC–Boston is roughly 306 km great-circle.
        let d = distance_km(NYC, BOSTON).unwrap();
        assert!((d - 306.0).abs() < 5.0, "got {d}");

        // NYC–Dallas is roughly 2200 km; Dallas is much further than Boston.
        let d2 = distance_km(NYC, DALLAS).unwrap();
        assert!(d2 > 2100.0 && d2 < 2300.0, "got {d2}");
    }

    #[test]
    fn test_distance_triangle_inequality() {
        let ab = distance_km(NYC, BOSTON).unwrap();
        let bc = distance_km(BOSTON, DALLAS).unwrap();
        let ac = distance_km(NYC, DALLAS).unwrap();
        assert!(ac <= ab + bc + 0.5);
    }

    #[test]
    fn test_distance_rejects_bad_domain() {
        let bad = Coord::new(91.0, 0.0);
        assert!(matches!(
            distance_km(bad, NYC),
            Err(GeoError::BadCoord { .. })
        ));
        let bad_lon = Coord::new(0.0, 181.0);
        assert!(distance_km(NYC, bad_lon).is_err());
    }

    #[test]
    fn test_distance_origin_is_in_domain() {
        // (0, 0) is a legal coordinate, not a sentinel.
        let origin = Coord::new(0.0, 0.0);
        assert!(distance_km(origin, NYC).unwrap() > 0.0);
    }

    #[test]
    fn test_cache_key_normalization() {
        assert_eq!(
            cache_key(" Boston ", Some("MA"), Some("US")),
            cache_key("boston", Some("ma"), Some("us"))
        );
        assert_ne!(
            cache_key("boston", None, Some("us")),
            cache_key("boston", Some("ma"), Some("us"))
        );
    }

    #[tokio::test]
    async fn test_primed_cache_resolves_without_network() {
        // Unroutable base URL: any real lookup would fail.
        let geocoder = Geocoder::new("http://127.0.0.1:1/none");
        geocoder.prime("Boston", Some("MA"), Some("US"), BOSTON);

        let resolved = geocoder.resolve("boston", Some("ma"), Some("us")).await;
        assert_eq!(resolved, Some(BOSTON));
        assert_eq!(geocoder.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_unknown_and_uncached() {
        let geocoder = Geocoder::new("http://127.0.0.1:1/none");
        let resolved = geocoder.resolve("Nowhere", None, None).await;
        assert_eq!(resolved, None);
        // Failures are retried next time; nothing was cached.
        assert_eq!(geocoder.cache_len(), 0);
    }
}
