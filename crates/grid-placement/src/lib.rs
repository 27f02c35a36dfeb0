//! Placement ranking for PlayGrid session hosts.
//!
//! Given a user coordinate and a provider, the [`Optimizer`] returns a
//! ranked list of placements; the head is the recommendation.
//!
//! TensorDock placements rank marketplace inventory by geodesic distance
//! with price as the tiebreak. Fly placements ask the external
//! location-finder service for proximity-ordered regions and fall back
//! deterministically to a static region table when that service is
//! unavailable. The optimizer is a pure query: its only side effects are
//! geocoder cache writes.

#![forbid(unsafe_code)]

use grid_geo::{Geocoder, distance_km};
use grid_proto::{Coord, GpuOffer, PlacementChoice, PlacementSource, Provider};
use grid_providers::{DriverError, TensorDockDriver, fly_region_table};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const FINDER_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no placement candidate satisfies the requirements")]
    NoCandidate,

    #[error(transparent)]
    Inventory(#[from] DriverError),
}

/// Minimum capability requirements for an inventory placement.
#[derive(Debug, Clone, Copy)]
pub struct Requirements {
    pub min_vcpu: u32,
    pub min_memory_gib: u32,
    pub min_gpu_count: u32,
}

// ─── Location-finder client ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FinderResponse {
    regions: Vec<FinderRegion>,
}

#[derive(Debug, Deserialize)]
struct FinderRegion {
    code: String,
}

/// Client for the external region-finder service: proximity-ordered named
/// regions for a coordinate.
pub struct RegionFinder {
    client: reqwest::Client,
    base_url: String,
    project: String,
}

impl RegionFinder {
    pub fn new(base_url: &str, project: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FINDER_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
        }
    }

    async fn nearest_regions(&self, coord: Coord) -> Result<Vec<String>, reqwest::Error> {
        let resp: FinderResponse = self
            .client
            .get(format!("{}/v1/regions", self.base_url))
            .query(&[
                ("proximity", format!("{},{}", coord.lat, coord.lon)),
                ("project", self.project.clone()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp.regions.into_iter().map(|r| r.code).collect())
    }
}

// ─── Optimizer ───────────────────────────────────────────────────────────────

pub struct Optimizer {
    geocoder: Arc<Geocoder>,
    tensordock: Option<Arc<TensorDockDriver>>,
    finder: RegionFinder,
}

impl Optimizer {
    pub fn new(
        geocoder: Arc<Geocoder>,
        tensordock: Option<Arc<TensorDockDriver>>,
        finder: RegionFinder,
    ) -> Self {
        Self { geocoder, tensordock, finder }
    }

    /// Ranked placements for a provider. The head is the recommendation.
    pub async fn candidates(
        &self,
        provider: Provider,
        user_coord: Option<Coord>,
        requirements: Requirements,
    ) -> Result<Vec<PlacementChoice>, PlacementError> {
        match provider {
            Provider::TensorDock => {
                let driver = self
                    .tensordock
                    .as_ref()
                    .ok_or(PlacementError::NoCandidate)?;
                let offers = driver.list_inventory().await?;
                self.rank_offers(user_coord, requirements, offers).await
            }
            Provider::Fly => Ok(self.rank_fly_regions(user_coord).await),
        }
    }

    /// Rank inventory offers: filter minima + dedicated address, geocode
    /// each candidate, sort ascending by (distance, price). Candidates that
    /// resolve to unknown keep infinite distance and sink to the tail.
    pub async fn rank_offers(
        &self,
        user_coord: Option<Coord>,
        requirements: Requirements,
        offers: Vec<GpuOffer>,
    ) -> Result<Vec<PlacementChoice>, PlacementError> {
        let eligible: Vec<GpuOffer> = offers
            .into_iter()
            .filter(|o| {
                o.dedicated_address
                    && o.meets(
                        requirements.min_vcpu,
                        requirements.min_memory_gib,
                        requirements.min_gpu_count,
                    )
            })
            .collect();

        if eligible.is_empty() {
            // Short-circuit: no geocoding work for an empty candidate set.
            return Err(PlacementError::NoCandidate);
        }

        let mut ranked: Vec<PlacementChoice> = Vec::with_capacity(eligible.len());
        for offer in eligible {
            let distance = match user_coord {
                Some(user) => {
                    let resolved = self
                        .geocoder
                        .resolve(&offer.city, offer.region.as_deref(), Some(&offer.country))
                        .await;
                    match resolved {
                        Some(node) => distance_km(user, node)
                            .inspect_err(|e| {
                                warn!(city = %offer.city, error = %e, "geocoded node out of domain")
                            })
                            .unwrap_or(f64::INFINITY),
                        None => f64::INFINITY,
                    }
                }
                None => f64::INFINITY,
            };

            ranked.push(PlacementChoice {
                provider: Provider::TensorDock,
                region: offer.region.clone(),
                source: PlacementSource::Local,
                distance_km: if distance.is_finite() { Some(distance) } else { None },
                offer: Some(offer),
            });
        }

        if user_coord.is_some() {
            ranked.sort_by(|a, b| {
                let da = a.distance_km.unwrap_or(f64::INFINITY);
                let db = b.distance_km.unwrap_or(f64::INFINITY);
                da.total_cmp(&db).then_with(|| {
                    let pa = a.offer.as_ref().map_or(f64::INFINITY, |o| o.price_per_hour);
                    let pb = b.offer.as_ref().map_or(f64::INFINITY, |o| o.price_per_hour);
                    pa.total_cmp(&pb)
                })
            });
        } else {
            // Without a user coordinate, rank by price alone.
            ranked.sort_by(|a, b| {
                let pa = a.offer.as_ref().map_or(f64::INFINITY, |o| o.price_per_hour);
                let pb = b.offer.as_ref().map_or(f64::INFINITY, |o| o.price_per_hour);
                pa.total_cmp(&pb)
            });
        }

        debug!(count = ranked.len(), "ranked inventory placements");
        Ok(ranked)
    }

    /// Fly region ranking. Remote path: the location-finder's
    /// proximity-ordered list (`source=remote`). Any failure falls back to
    /// the static region table ranked by geodesic distance (`source=local`).
    pub async fn rank_fly_regions(&self, user_coord: Option<Coord>) -> Vec<PlacementChoice> {
        if let Some(coord) = user_coord {
            match self.finder.nearest_regions(coord).await {
                Ok(codes) if !codes.is_empty() => {
                    info!(head = %codes[0], "location finder returned region ranking");
                    return codes
                        .into_iter()
                        .map(|code| PlacementChoice {
                            provider: Provider::Fly,
                            region: Some(code),
                            offer: None,
                            source: PlacementSource::Remote,
                            distance_km: None,
                        })
                        .collect();
                }
                Ok(_) => {
                    warn!("location finder returned empty ranking, falling back to static table");
                }
                Err(e) => {
                    warn!(error = %e, "location finder unavailable, falling back to static table");
                }
            }
        }

        self.static_fly_ranking(user_coord)
    }

    fn static_fly_ranking(&self, user_coord: Option<Coord>) -> Vec<PlacementChoice> {
        let mut regions: Vec<(String, Option<f64>)> = fly_region_table()
            .into_iter()
            .map(|(code, region_coord)| {
                let distance = user_coord
                    .and_then(|user| distance_km(user, region_coord).ok());
                (code.to_string(), distance)
            })
            .collect();

        if user_coord.is_some() {
            regions.sort_by(|a, b| {
                a.1.unwrap_or(f64::INFINITY).total_cmp(&b.1.unwrap_or(f64::INFINITY))
            });
        }

        regions
            .into_iter()
            .map(|(code, distance)| PlacementChoice {
                provider: Provider::Fly,
                region: Some(code),
                offer: None,
                source: PlacementSource::Local,
                distance_km: distance,
            })
            .collect()
    }
}
