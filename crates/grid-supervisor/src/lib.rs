//! Health supervision for the PlayGrid fleet.
//!
//! Two periodic passes share one scheduler task: the minute-scale liveness
//! sweep (agent probes, strike accounting, idle and session-length
//! enforcement, spend-cap checks) and the day-scale long-stopped sweep.
//! Probe decisions are pure functions over a [`ProbeOutcome`] so the
//! decision matrix is testable without any network; the sweep shell applies
//! the resulting actions through the narrow
//! [`StateTransitioner`](grid_orchestrator::StateTransitioner) capability
//! and must never leak a running host.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use grid_billing::{BillingQuery, RateTable, month_to_date_window, rollup};
use grid_orchestrator::StateTransitioner;
use grid_persist::{HostStore, ProfileStore};
use grid_proto::{GpuTier, HostRecord, HostState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consecutive failed probes before a host is declared an orphan.
pub const MAX_UNHEALTHY_STRIKES: u32 = 3;

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub liveness_interval: Duration,
    /// Percentage jitter applied to each liveness cycle.
    pub liveness_jitter_pct: u32,
    pub idle_threshold: Duration,
    pub stopped_ttl: Duration,
    pub long_stopped_interval: Duration,
    pub probe_timeout: Duration,
    pub monthly_soft_cap_usd: f64,
    pub monthly_hard_cap_usd: f64,
    /// Session ceiling fallback when the platform profile carries none.
    pub max_session_hours_low: f64,
    pub max_session_hours_mid: f64,
    pub max_session_hours_high: f64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(900),
            liveness_jitter_pct: 10,
            idle_threshold: Duration::from_secs(600),
            stopped_ttl: Duration::from_secs(172_800),
            long_stopped_interval: Duration::from_secs(86_400),
            probe_timeout: Duration::from_secs(5),
            monthly_soft_cap_usd: 400.0,
            monthly_hard_cap_usd: 500.0,
            max_session_hours_low: 4.0,
            max_session_hours_mid: 6.0,
            max_session_hours_high: 8.0,
        }
    }
}

impl SupervisorSettings {
    fn fallback_session_hours(&self, tier: GpuTier) -> f64 {
        match tier {
            GpuTier::Low => self.max_session_hours_low,
            GpuTier::Mid => self.max_session_hours_mid,
            GpuTier::High => self.max_session_hours_high,
        }
    }
}

// ─── Probe model ─────────────────────────────────────────────────────────────

/// Body of the agent's `/health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub connected_clients: u32,
    #[serde(default)]
    pub idle_since: Option<DateTime<Utc>>,
    pub session_duration_secs: u64,
}

#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Healthy(AgentHealth),
    /// Timeout, connection refused, non-2xx, or unparseable body.
    Unreachable(String),
}

/// What the sweep must do for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAction {
    /// Healthy: reset strikes, refresh activity.
    ClearStrikes,
    /// Probe failed, but the host has strikes left.
    Strike,
    /// Third consecutive failed probe: orphaned host.
    FailAndDestroy,
    /// Idle past the threshold: transition to IDLE and stop.
    IdleStop,
    /// Session exceeded its ceiling: hard stop.
    HardStop,
}

/// The liveness decision matrix, free of I/O.
pub fn classify_probe(
    host: &HostRecord,
    outcome: &ProbeOutcome,
    now: DateTime<Utc>,
    idle_threshold: Duration,
    max_session_hours: f64,
) -> SweepAction {
    match outcome {
        ProbeOutcome::Unreachable(_) => {
            if host.unhealthy_strikes + 1 >= MAX_UNHEALTHY_STRIKES {
                SweepAction::FailAndDestroy
            } else {
                SweepAction::Strike
            }
        }
        ProbeOutcome::Healthy(health) => {
            if health.connected_clients == 0
                && let Some(idle_since) = health.idle_since
                && now.signed_duration_since(idle_since).num_seconds()
                    > idle_threshold.as_secs() as i64
            {
                return SweepAction::IdleStop;
            }
            if (health.session_duration_secs as f64 / 3600.0) > max_session_hours {
                return SweepAction::HardStop;
            }
            SweepAction::ClearStrikes
        }
    }
}

/// True when a stopped host has aged past the retention TTL.
pub fn is_long_stopped(host: &HostRecord, now: DateTime<Utc>, ttl: Duration) -> bool {
    host.state == HostState::Stopped
        && now.signed_duration_since(host.updated_at).num_seconds() > ttl.as_secs() as i64
}

/// Per-cycle delay with deterministic ±jitter derived from the clock's
/// subsecond component; the stack carries no RNG and spread is all that
/// matters here.
pub fn jittered_interval(interval: Duration, jitter_pct: u32, now: DateTime<Utc>) -> Duration {
    if jitter_pct == 0 {
        return interval;
    }
    let span_ms = interval.as_millis() as i64 * jitter_pct as i64 / 100;
    let seed = now.timestamp_subsec_micros() as i64;
    let offset_ms = (seed % (2 * span_ms + 1)) - span_ms;
    let base_ms = interval.as_millis() as i64;
    Duration::from_millis((base_ms + offset_ms).max(0) as u64)
}

// ─── Sweep report ────────────────────────────────────────────────────────────

/// Summary of one liveness pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub swept: u32,
    pub healthy: u32,
    pub strikes: u32,
    pub failed: u32,
    pub idle_stopped: u32,
    pub hard_stopped: u32,
    pub month_cost_usd: f64,
    pub spend_warning: bool,
    pub mass_drained: u32,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

pub struct Supervisor {
    hosts: Arc<HostStore>,
    profiles: Arc<ProfileStore>,
    rates: Arc<RateTable>,
    transitioner: Arc<dyn StateTransitioner>,
    settings: SupervisorSettings,
    client: reqwest::Client,
}

impl Supervisor {
    pub fn new(
        hosts: Arc<HostStore>,
        profiles: Arc<ProfileStore>,
        rates: Arc<RateTable>,
        transitioner: Arc<dyn StateTransitioner>,
        settings: SupervisorSettings,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.probe_timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { hosts, profiles, rates, transitioner, settings, client }
    }

    /// Scheduler loop: liveness on a jittered minute-scale cadence, the
    /// long-stopped sweep folded in on its day-scale interval.
    pub async fn run(self: Arc<Self>) {
        info!(
            liveness_secs = self.settings.liveness_interval.as_secs(),
            long_stopped_secs = self.settings.long_stopped_interval.as_secs(),
            "supervisor started"
        );
        let mut next_long_sweep = tokio::time::Instant::now() + self.settings.long_stopped_interval;

        loop {
            let delay = jittered_interval(
                self.settings.liveness_interval,
                self.settings.liveness_jitter_pct,
                Utc::now(),
            );
            tokio::time::sleep(delay).await;

            let report = self.liveness_sweep().await;
            debug!(?report, "liveness sweep complete");

            if tokio::time::Instant::now() >= next_long_sweep {
                let destroyed = self.long_stopped_sweep().await;
                info!(destroyed, "long-stopped sweep complete");
                next_long_sweep += self.settings.long_stopped_interval;
            }
        }
    }

    /// One liveness pass over all live hosts.
    pub async fn liveness_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        // Spend-cap check comes first; a hard-cap breach drains the fleet
        // and skips probing (the hosts are on their way down anyway).
        report.month_cost_usd = self.month_to_date_cost();
        if report.month_cost_usd > self.settings.monthly_hard_cap_usd {
            warn!(
                cost = report.month_cost_usd,
                cap = self.settings.monthly_hard_cap_usd,
                "monthly hard cap exceeded, draining fleet"
            );
            report.spend_warning = true;
            report.mass_drained = self.mass_drain().await;
            return report;
        }
        if report.month_cost_usd > self.settings.monthly_soft_cap_usd {
            warn!(
                cost = report.month_cost_usd,
                cap = self.settings.monthly_soft_cap_usd,
                "monthly soft cap exceeded"
            );
            report.spend_warning = true;
        }

        let live = self.hosts.in_states(&[
            HostState::Ready,
            HostState::Running,
            HostState::Idle,
        ]);
        report.swept = live.len() as u32;

        for host in live {
            let outcome = self.probe(&host).await;
            let max_hours = self
                .profiles
                .get(&host.platform)
                .map(|p| p.max_session_hours)
                .unwrap_or_else(|| self.settings.fallback_session_hours(host.tier));

            let action = classify_probe(
                &host,
                &outcome,
                Utc::now(),
                self.settings.idle_threshold,
                max_hours,
            );
            self.apply(&host, action, &outcome, &mut report).await;
        }

        report
    }

    async fn apply(
        &self,
        host: &HostRecord,
        action: SweepAction,
        outcome: &ProbeOutcome,
        report: &mut SweepReport,
    ) {
        let host_id = host.host_id.as_str();
        match action {
            SweepAction::ClearStrikes => {
                report.healthy += 1;
                let result = self.hosts.update(host_id, |h| {
                    h.unhealthy_strikes = 0;
                    h.last_activity = Utc::now();
                });
                if let Err(e) = result {
                    warn!(host_id, error = %e, "failed to refresh host activity");
                }
            }
            SweepAction::Strike => {
                report.strikes += 1;
                let result = self.hosts.update(host_id, |h| {
                    h.unhealthy_strikes += 1;
                });
                match result {
                    Ok(updated) => {
                        warn!(host_id, strikes = updated.unhealthy_strikes, "liveness probe failed")
                    }
                    Err(e) => warn!(host_id, error = %e, "failed to record strike"),
                }
            }
            SweepAction::FailAndDestroy => {
                report.failed += 1;
                let reason = match outcome {
                    ProbeOutcome::Unreachable(detail) => {
                        format!("agent unreachable for {MAX_UNHEALTHY_STRIKES} sweeps: {detail}")
                    }
                    ProbeOutcome::Healthy(_) => "strike limit reached".to_string(),
                };
                if let Err(e) = self.transitioner.mark_failed(host_id, &reason).await {
                    warn!(host_id, error = %e, "failed to mark orphan host");
                }
            }
            SweepAction::IdleStop => {
                report.idle_stopped += 1;
                info!(host_id, "idle past threshold, stopping");
                if let Err(e) = self.transitioner.request_idle_stop(host_id).await {
                    warn!(host_id, error = %e, "idle stop failed");
                }
            }
            SweepAction::HardStop => {
                report.hard_stopped += 1;
                warn!(host_id, "session exceeded its ceiling, hard stopping");
                if let Err(e) = self
                    .transitioner
                    .request_stop(host_id, "max session hours exceeded")
                    .await
                {
                    warn!(host_id, error = %e, "hard stop failed");
                }
            }
        }
    }

    /// Destroy hosts that have sat in STOPPED past the retention TTL.
    pub async fn long_stopped_sweep(&self) -> u32 {
        let now = Utc::now();
        let mut destroyed = 0;
        for host in self.hosts.in_states(&[HostState::Stopped]) {
            if is_long_stopped(&host, now, self.settings.stopped_ttl) {
                match self
                    .transitioner
                    .request_destroy(&host.host_id, "stopped past retention TTL")
                    .await
                {
                    Ok(()) => destroyed += 1,
                    Err(e) => warn!(host_id = %host.host_id, error = %e, "long-stopped destroy failed"),
                }
            }
        }
        destroyed
    }

    fn month_to_date_cost(&self) -> f64 {
        let (from, to) = month_to_date_window(Utc::now());
        let hosts = self.hosts.all();
        let profiles = self.profiles.all();
        let report = rollup(
            &hosts,
            &profiles,
            &self.rates,
            &BillingQuery { from, to, provider: None, user_id: None },
        );
        report.totals.estimated_cost
    }

    /// Hard-cap breach: stop every host that is not already stopped or
    /// terminal, regardless of activity.
    async fn mass_drain(&self) -> u32 {
        let mut drained = 0;
        let live = self.hosts.in_states(&[
            HostState::Creating,
            HostState::Configuring,
            HostState::Ready,
            HostState::Running,
            HostState::Idle,
        ]);
        for host in live {
            match self
                .transitioner
                .request_stop(&host.host_id, "monthly hard spend cap exceeded")
                .await
            {
                Ok(()) => drained += 1,
                Err(e) => warn!(host_id = %host.host_id, error = %e, "mass drain stop failed"),
            }
        }
        drained
    }

    async fn probe(&self, host: &HostRecord) -> ProbeOutcome {
        let Some(address) = &host.address else {
            return ProbeOutcome::Unreachable("host has no address".to_string());
        };
        let url = format!("http://{address}:{}/health", host.agent_port);

        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => return ProbeOutcome::Unreachable(e.to_string()),
        };
        if !response.status().is_success() {
            return ProbeOutcome::Unreachable(format!("status {}", response.status()));
        }
        match response.json::<AgentHealth>().await {
            Ok(health) => ProbeOutcome::Healthy(health),
            Err(e) => ProbeOutcome::Unreachable(format!("unparseable health body: {e}")),
        }
    }
}
