//! Billing rollup for PlayGrid.
//!
//! A pure query over persisted host records and the static rate table:
//! per-host elapsed time within a window, priced by
//! `(tier, platform family, provider)` with a per-family multiplier.
//! The supervisor consults [`month_to_date_window`] + [`rollup`] for its
//! spend-cap check; the same computation backs the `/billing` read API.

#![forbid(unsafe_code)]

use chrono::{DateTime, Datelike, TimeZone, Utc};
use grid_proto::{GpuTier, HostRecord, PlatformProfile, Provider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("rate table error: {0}")]
    RateTable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

// ─── Rate table ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateEntry {
    pub tier: GpuTier,
    pub family: String,
    pub provider: Provider,
    pub hourly_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RateFile {
    rates: Vec<RateEntry>,
    #[serde(default)]
    family_multipliers: HashMap<String, f64>,
}

/// Immutable after load: `(tier, family, provider) → hourly rate`.
pub struct RateTable {
    rates: HashMap<(GpuTier, String, Provider), f64>,
    multipliers: HashMap<String, f64>,
}

impl RateTable {
    pub fn load(path: &Path) -> Result<Self, BillingError> {
        let data = std::fs::read_to_string(path)?;
        let file: RateFile = serde_json::from_str(&data)?;
        Self::from_entries(file.rates, file.family_multipliers)
    }

    pub fn from_entries(
        entries: Vec<RateEntry>,
        multipliers: HashMap<String, f64>,
    ) -> Result<Self, BillingError> {
        let mut rates = HashMap::new();
        for entry in entries {
            if entry.hourly_rate < 0.0 {
                return Err(BillingError::RateTable(format!(
                    "negative rate for {}/{}/{}",
                    entry.tier, entry.family, entry.provider
                )));
            }
            let key = (entry.tier, entry.family.clone(), entry.provider);
            if rates.insert(key, entry.hourly_rate).is_some() {
                return Err(BillingError::RateTable(format!(
                    "duplicate rate entry for {}/{}/{}",
                    entry.tier, entry.family, entry.provider
                )));
            }
        }
        Ok(Self { rates, multipliers })
    }

    pub fn rate(&self, tier: GpuTier, family: &str, provider: Provider) -> Option<f64> {
        self.rates.get(&(tier, family.to_string(), provider)).copied()
    }

    pub fn multiplier(&self, family: &str) -> f64 {
        self.multipliers.get(family).copied().unwrap_or(1.0)
    }
}

// ─── Rollup ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub provider: Option<Provider>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostUsage {
    pub host_id: String,
    pub user_id: String,
    pub platform: String,
    pub provider: Provider,
    pub tier: GpuTier,
    pub hours: f64,
    pub hourly_rate: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingTotals {
    pub hours: f64,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub per_host: Vec<HostUsage>,
    pub totals: BillingTotals,
}

/// Round a money value to 4 decimal places; applied before every sum.
fn round_money(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Elapsed billable hours for one host within the window, capped at the
/// session ceiling.
fn elapsed_hours(host: &HostRecord, query: &BillingQuery, max_session_hours: f64) -> f64 {
    let start = host.created_at.max(query.from);
    let end = host.last_activity.min(query.to);
    let seconds = (end - start).num_seconds();
    if seconds <= 0 {
        return 0.0;
    }
    (seconds as f64 / 3600.0).clamp(0.0, max_session_hours)
}

/// Aggregate per-host usage against the rate table.
///
/// Hosts outside the filters or with zero billable time are omitted from
/// `per_host`. A missing rate entry prices the host at zero and is logged;
/// billing gaps are an operator problem, not a request failure.
pub fn rollup(
    hosts: &[HostRecord],
    profiles: &[PlatformProfile],
    rates: &RateTable,
    query: &BillingQuery,
) -> BillingReport {
    let by_platform: HashMap<&str, &PlatformProfile> =
        profiles.iter().map(|p| (p.platform.as_str(), p)).collect();

    let mut per_host = Vec::new();
    let mut total_hours = 0.0;
    let mut total_cost = 0.0;

    for host in hosts {
        if let Some(provider) = query.provider
            && host.provider != provider
        {
            continue;
        }
        if let Some(user_id) = &query.user_id
            && &host.user_id != user_id
        {
            continue;
        }

        let profile = by_platform.get(host.platform.as_str());
        let family = profile.map_or("unknown", |p| p.family.as_str());
        let max_hours = profile.map_or(f64::INFINITY, |p| p.max_session_hours);

        let hours = elapsed_hours(host, query, max_hours);
        if hours <= 0.0 {
            continue;
        }

        let hourly_rate = match rates.rate(host.tier, family, host.provider) {
            Some(rate) => rate,
            None => {
                warn!(
                    host_id = %host.host_id,
                    tier = %host.tier,
                    family,
                    provider = %host.provider,
                    "no rate table entry, pricing at zero"
                );
                0.0
            }
        };

        let cost = round_money(hours * hourly_rate * rates.multiplier(family));
        total_hours += hours;
        total_cost += cost;

        per_host.push(HostUsage {
            host_id: host.host_id.clone(),
            user_id: host.user_id.clone(),
            platform: host.platform.clone(),
            provider: host.provider,
            tier: host.tier,
            hours: round_money(hours),
            hourly_rate,
            cost,
        });
    }

    BillingReport {
        window_start: query.from,
        window_end: query.to,
        per_host,
        totals: BillingTotals {
            hours: round_money(total_hours),
            estimated_cost: round_money(total_cost),
        },
    }
}

/// The current calendar month as a billing window: first of the month
/// (00:00 UTC) to `now`.
pub fn month_to_date_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (start, now)
}
