//! Session orchestration for PlayGrid.
//!
//! The [`Orchestrator`] owns the host lifecycle state machine: it accepts
//! session requests, walks platform provider preferences, drives the
//! multi-step provisioning pipeline as a background task, and applies agent
//! callbacks. All state changes go through the host store's compare-and-set
//! transition so concurrent attempts collapse deterministically.
//!
//! The supervisor reaches back into the orchestrator only through the
//! narrow [`StateTransitioner`] capability.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use grid_persist::{HostStore, ProfileStore, StoreError, TransitionOutcome};
use grid_placement::{Optimizer, PlacementError, Requirements};
use grid_proto::{
    Coord, EndedEvent, GpuTier, HostRecord, HostState, IdleEvent, PlacementChoice,
    PlatformProfile, Provider, SaveEvent, SaveSlot, SessionManifest, StartedEvent,
    validate_user_id,
};
use grid_providers::{BootstrapSpec, CreateRequest, DriverError, HostDriver};
use grid_billing::RateTable;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Retries after the first failed adapter `create` attempt.
const MAX_CREATE_RETRIES: u32 = 3;
const RETRY_INITIAL_SECS: u64 = 2;
const RETRY_CAP_SECS: u64 = 30;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("gone: {0}")]
    Gone(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient providers: {0}")]
    InsufficientProviders(String),

    #[error("provisioning capacity exhausted")]
    Overloaded,

    #[error("provider error (retryable: {retryable}): {message}")]
    Provider { retryable: bool, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DriverError> for OrchestratorError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotFound => Self::NotFound("provider resource".to_string()),
            DriverError::Timeout => Self::Provider {
                retryable: false,
                message: "timed out waiting for provider".to_string(),
            },
            DriverError::Provider { retryable, message } => Self::Provider { retryable, message },
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::HostNotFound(id) => Self::NotFound(id),
            StoreError::PlatformNotFound(p) => Self::UnknownPlatform(p),
            StoreError::Io(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<PlacementError> for OrchestratorError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::NoCandidate => {
                Self::InsufficientProviders("no placement candidate".to_string())
            }
            PlacementError::Inventory(e) => e.into(),
        }
    }
}

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_inflight_provisions: usize,
    pub auto_stop_timeout_secs: u64,
    /// Base URL agents use to reach this control plane.
    pub public_base_url: String,
    /// PEM bundle handed to agents for client-certificate streaming auth.
    pub client_cert_pem: String,
    pub ready_ceiling_low_secs: u64,
    pub ready_ceiling_mid_secs: u64,
    pub ready_ceiling_high_secs: u64,
}

impl OrchestratorSettings {
    pub fn ready_ceiling(&self, tier: GpuTier) -> Duration {
        let secs = match tier {
            GpuTier::Low => self.ready_ceiling_low_secs,
            GpuTier::Mid => self.ready_ceiling_mid_secs,
            GpuTier::High => self.ready_ceiling_high_secs,
        };
        Duration::from_secs(secs)
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_inflight_provisions: 32,
            auto_stop_timeout_secs: 900,
            public_base_url: "http://127.0.0.1:8780".to_string(),
            client_cert_pem: String::new(),
            ready_ceiling_low_secs: 600,
            ready_ceiling_mid_secs: 600,
            ready_ceiling_high_secs: 600,
        }
    }
}

// ─── Session request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub user_id: String,
    pub platform: String,
    pub user_coord: Option<Coord>,
    pub save_ref: Option<String>,
}

// ─── StateTransitioner capability ────────────────────────────────────────────

/// Narrow capability the supervisor uses to request state changes without
/// holding the whole orchestrator.
#[async_trait]
pub trait StateTransitioner: Send + Sync {
    /// Drive a live host toward STOPPED and stop the provider instance.
    async fn request_stop(&self, host_id: &str, reason: &str) -> Result<(), OrchestratorError>;

    /// Idle-timeout action: RUNNING → IDLE, stop the provider instance,
    /// then IDLE → STOPPED once the stop call returns.
    async fn request_idle_stop(&self, host_id: &str) -> Result<(), OrchestratorError>;

    /// Destroy a stopped host (long-stopped sweep).
    async fn request_destroy(&self, host_id: &str, reason: &str) -> Result<(), OrchestratorError>;

    /// Mark a host FAILED (orphan / strike-out) and destroy the provider
    /// instance exactly once.
    async fn mark_failed(&self, host_id: &str, reason: &str) -> Result<(), OrchestratorError>;
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

struct OrchestratorInner {
    hosts: Arc<HostStore>,
    profiles: Arc<ProfileStore>,
    drivers: HashMap<Provider, Arc<dyn HostDriver>>,
    optimizer: Arc<Optimizer>,
    rates: Arc<RateTable>,
    settings: OrchestratorSettings,
    provision_permits: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        hosts: Arc<HostStore>,
        profiles: Arc<ProfileStore>,
        drivers: HashMap<Provider, Arc<dyn HostDriver>>,
        optimizer: Arc<Optimizer>,
        rates: Arc<RateTable>,
        settings: OrchestratorSettings,
    ) -> Self {
        let provision_permits = Arc::new(Semaphore::new(settings.max_inflight_provisions));
        Self {
            inner: Arc::new(OrchestratorInner {
                hosts,
                profiles,
                drivers,
                optimizer,
                rates,
                settings,
                provision_permits,
            }),
        }
    }

    pub fn hosts(&self) -> Arc<HostStore> {
        self.inner.hosts.clone()
    }

    pub fn profiles(&self) -> Arc<ProfileStore> {
        self.inner.profiles.clone()
    }

    pub fn rates(&self) -> Arc<RateTable> {
        self.inner.rates.clone()
    }

    pub fn optimizer(&self) -> Arc<Optimizer> {
        self.inner.optimizer.clone()
    }

    fn driver(&self, provider: Provider) -> Option<Arc<dyn HostDriver>> {
        self.inner.drivers.get(&provider).cloned()
    }

    // ─── Public operations ──────────────────────────────────────────────────

    /// Request a streaming session: return the user's existing host for the
    /// platform if one is live, otherwise select a provider and start
    /// provisioning in the background.
    pub async fn request_session(
        &self,
        req: SessionRequest,
    ) -> Result<HostRecord, OrchestratorError> {
        if !validate_user_id(&req.user_id) {
            return Err(OrchestratorError::BadRequest("invalid user_id".to_string()));
        }
        if let Some(coord) = req.user_coord
            && !coord.is_valid()
        {
            return Err(OrchestratorError::BadRequest(format!(
                "coordinate out of domain: {}, {}",
                coord.lat, coord.lon
            )));
        }

        let profile = self
            .inner
            .profiles
            .get(&req.platform)
            .ok_or_else(|| OrchestratorError::UnknownPlatform(req.platform.clone()))?;

        // Dedupe: one non-terminal host per (user, platform).
        if let Some(existing) = self.inner.hosts.find_active(&req.user_id, &req.platform) {
            info!(host_id = %existing.host_id, state = %existing.state, "returning existing session host");
            if existing.state == HostState::Stopped {
                self.spawn_restart(existing.host_id.clone());
            }
            return Ok(existing);
        }

        let (provider, tier) = self.select_provider(&profile)?;

        // Backpressure: refuse immediately when the provisioning pool is full.
        let permit = self
            .inner
            .provision_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| OrchestratorError::Overloaded)?;

        let host = HostRecord::new(
            &req.user_id,
            &req.platform,
            tier,
            provider,
            req.user_coord,
            req.save_ref.clone(),
            self.inner.settings.auto_stop_timeout_secs,
        );
        let record = host.clone();
        self.inner.hosts.insert(host);
        info!(host_id = %record.host_id, provider = %provider, tier = %tier, "session host persisted, provisioning queued");

        let this = self.clone();
        let host_id = record.host_id.clone();
        tokio::spawn(async move {
            this.run_provisioning(&host_id, &profile).await;
            drop(permit);
        });

        Ok(record)
    }

    /// Walk the profile's preference list in priority order, skipping
    /// disabled entries, providers without a registered driver, and entries
    /// whose cost cap is exceeded by the rate table.
    fn select_provider(
        &self,
        profile: &PlatformProfile,
    ) -> Result<(Provider, GpuTier), OrchestratorError> {
        for pref in profile.ordered_preferences() {
            if !pref.enabled {
                continue;
            }
            if !self.inner.drivers.contains_key(&pref.provider) {
                debug!(provider = %pref.provider, "preference skipped: provider not registered");
                continue;
            }
            let tier = pref.tier_override.unwrap_or(profile.default_tier);
            if let Some(cap) = pref.hourly_cost_cap
                && let Some(rate) = self.inner.rates.rate(tier, &profile.family, pref.provider)
                && rate > cap
            {
                debug!(provider = %pref.provider, rate, cap, "preference skipped: rate exceeds cost cap");
                continue;
            }
            return Ok((pref.provider, tier));
        }
        Err(OrchestratorError::InsufficientProviders(format!(
            "no enabled, affordable provider for platform '{}'",
            profile.platform
        )))
    }

    /// Stop a session. Idempotent: already-stopped returns ok, terminal
    /// hosts return Gone.
    pub async fn stop_session(&self, host_id: &str) -> Result<(), OrchestratorError> {
        let host = self
            .inner
            .hosts
            .get(host_id)
            .ok_or_else(|| OrchestratorError::NotFound(host_id.to_string()))?;

        if host.state.is_terminal() {
            return Err(OrchestratorError::Gone(format!(
                "host is {}",
                host.state
            )));
        }

        let outcome = self.inner.hosts.transition(
            host_id,
            &[HostState::Running, HostState::Idle, HostState::Ready],
            HostState::Stopped,
        )?;

        match outcome {
            TransitionOutcome::Applied => {
                info!(host_id, "session stop requested");
                self.spawn_provider_call(host, ProviderCall::Stop);
                Ok(())
            }
            TransitionOutcome::AlreadyThere => Ok(()),
            TransitionOutcome::Rejected { actual } => Err(OrchestratorError::Conflict(format!(
                "cannot stop host in {actual}"
            ))),
        }
    }

    /// Destroy a session. Idempotent; also releases provider-side remnants
    /// of FAILED hosts without changing their state.
    pub async fn destroy_session(&self, host_id: &str) -> Result<(), OrchestratorError> {
        let host = self
            .inner
            .hosts
            .get(host_id)
            .ok_or_else(|| OrchestratorError::NotFound(host_id.to_string()))?;

        match host.state {
            HostState::Destroyed => Ok(()),
            HostState::Failed => {
                // Terminal, but the provider may still hold an instance.
                self.spawn_provider_call(host, ProviderCall::Destroy);
                Ok(())
            }
            _ => {
                let outcome = self.inner.hosts.transition(
                    host_id,
                    &[
                        HostState::Creating,
                        HostState::Configuring,
                        HostState::Ready,
                        HostState::Running,
                        HostState::Idle,
                        HostState::Stopped,
                    ],
                    HostState::Destroyed,
                )?;
                if outcome == TransitionOutcome::Applied {
                    info!(host_id, "session destroy requested");
                    self.spawn_provider_call(host, ProviderCall::Destroy);
                }
                Ok(())
            }
        }
    }

    /// The persisted record, no provider call.
    pub fn describe_session(&self, host_id: &str) -> Result<HostRecord, OrchestratorError> {
        self.inner
            .hosts
            .get(host_id)
            .ok_or_else(|| OrchestratorError::NotFound(host_id.to_string()))
    }

    // ─── Provisioning pipeline ──────────────────────────────────────────────

    async fn run_provisioning(&self, host_id: &str, profile: &PlatformProfile) {
        if let Err(e) = self.provision_steps(host_id, profile).await {
            match e {
                ProvisionAbort::Cancelled => {
                    info!(host_id, "provisioning cancelled, host destroyed");
                }
                ProvisionAbort::Failed(reason) => {
                    warn!(host_id, reason = %reason, "provisioning failed");
                    self.fail_host(host_id, &reason);
                }
            }
        }
    }

    async fn provision_steps(
        &self,
        host_id: &str,
        profile: &PlatformProfile,
    ) -> Result<(), ProvisionAbort> {
        let host = self
            .inner
            .hosts
            .get(host_id)
            .ok_or_else(|| ProvisionAbort::Failed("host record vanished".to_string()))?;
        let driver = self
            .driver(host.provider)
            .ok_or_else(|| ProvisionAbort::Failed(format!("no driver for {}", host.provider)))?;

        // Step 1: placement.
        self.check_cancelled(host_id, &driver).await?;
        let requirements = Requirements {
            min_vcpu: profile.min_vcpu,
            min_memory_gib: profile.min_memory_gib,
            min_gpu_count: profile.min_gpu_count,
        };
        let candidates = self
            .inner
            .optimizer
            .candidates(host.provider, host.user_coord, requirements)
            .await
            .map_err(|e| ProvisionAbort::Failed(e.to_string()))?;
        let placement = candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProvisionAbort::Failed("no placement candidate".to_string()))?;
        debug!(host_id, region = ?placement.region, source = ?placement.source, "placement selected");

        // Step 2: create, with bounded retries on retryable errors.
        self.check_cancelled(host_id, &driver).await?;
        let create_req = self.build_create_request(&host, profile, placement.clone());
        let outcome = with_retries("create", || driver.create(&create_req))
            .await
            .map_err(|e| ProvisionAbort::Failed(format!("create: {e}")))?;

        let handle = outcome.provider_handle.clone();
        self.inner
            .hosts
            .update(host_id, |h| {
                // A concurrent destroy may have won; terminal records are
                // immutable and the artifact is cleaned up below.
                if !h.state.is_terminal() {
                    h.provider_handle = Some(outcome.provider_handle.clone());
                    h.provider_metadata.extend(outcome.provider_metadata.clone());
                    h.placement_source = Some(placement.source);
                }
            })
            .map_err(|e| ProvisionAbort::Failed(e.to_string()))?;

        // Step 3: wait for the provider to report running + addressed.
        if self.is_cancelled(host_id) {
            self.best_effort_destroy(&driver, &handle).await;
            return Err(ProvisionAbort::Cancelled);
        }
        let ceiling = self.inner.settings.ready_ceiling(host.tier);
        let address = match driver.wait_ready(&handle, ceiling).await {
            Ok(address) => address,
            Err(e) => {
                self.best_effort_destroy(&driver, &handle).await;
                return Err(ProvisionAbort::Failed(format!("wait_ready: {e}")));
            }
        };

        // Step 4: configure the environment.
        if self.is_cancelled(host_id) {
            self.best_effort_destroy(&driver, &handle).await;
            return Err(ProvisionAbort::Cancelled);
        }
        let outcome = self
            .inner
            .hosts
            .transition(host_id, &[HostState::Creating], HostState::Configuring)
            .map_err(|e| ProvisionAbort::Failed(e.to_string()))?;
        if outcome != TransitionOutcome::Applied {
            self.best_effort_destroy(&driver, &handle).await;
            return Err(ProvisionAbort::Cancelled);
        }

        let bootstrap = self.bootstrap_spec(&self.describe_refreshed(host_id)?, profile);
        if let Err(e) = driver.prepare_environment(&handle, &address, &bootstrap).await {
            self.best_effort_destroy(&driver, &handle).await;
            return Err(ProvisionAbort::Failed(format!("environment setup: {e}")));
        }

        // Step 5: ready.
        self.inner
            .hosts
            .update(host_id, |h| {
                h.address = Some(address.clone());
                h.environment_ready = true;
            })
            .map_err(|e| ProvisionAbort::Failed(e.to_string()))?;
        let outcome = self
            .inner
            .hosts
            .transition(host_id, &[HostState::Configuring], HostState::Ready)
            .map_err(|e| ProvisionAbort::Failed(e.to_string()))?;
        if outcome != TransitionOutcome::Applied {
            self.best_effort_destroy(&driver, &handle).await;
            return Err(ProvisionAbort::Cancelled);
        }

        info!(host_id, address = %address, "host ready");
        Ok(())
    }

    /// Restart path for a deduplicated STOPPED host: start the provider
    /// instance and re-enter through CONFIGURING → READY.
    fn spawn_restart(&self, host_id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.restart_host(&host_id).await {
                warn!(host_id = %host_id, error = %e, "implicit restart failed");
                this.fail_host(&host_id, &format!("restart: {e}"));
            }
        });
    }

    async fn restart_host(&self, host_id: &str) -> Result<(), OrchestratorError> {
        let outcome = self.inner.hosts.transition(
            host_id,
            &[HostState::Stopped],
            HostState::Configuring,
        )?;
        if outcome != TransitionOutcome::Applied {
            // Another caller is already restarting (or the host moved on).
            return Ok(());
        }

        let host = self.describe_session(host_id)?;
        let driver = self
            .driver(host.provider)
            .ok_or_else(|| OrchestratorError::Internal(format!("no driver for {}", host.provider)))?;
        let handle = host.provider_handle.clone().ok_or_else(|| {
            OrchestratorError::Internal("stopped host has no provider handle".to_string())
        })?;

        driver.start(&handle).await?;
        let ceiling = self.inner.settings.ready_ceiling(host.tier);
        let address = driver.wait_ready(&handle, ceiling).await?;

        self.inner.hosts.update(host_id, |h| {
            h.address = Some(address.clone());
        })?;
        self.inner
            .hosts
            .transition(host_id, &[HostState::Configuring], HostState::Ready)?;
        info!(host_id, "stopped host restarted");
        Ok(())
    }

    fn build_create_request(
        &self,
        host: &HostRecord,
        profile: &PlatformProfile,
        placement: PlacementChoice,
    ) -> CreateRequest {
        let mut tags = HashMap::new();
        tags.insert("managed_by".to_string(), "playgrid".to_string());
        tags.insert("user_id".to_string(), host.user_id.clone());
        tags.insert("platform".to_string(), host.platform.clone());

        CreateRequest {
            name: format!("pg-{}-{}", host.user_id, &host.host_id[3..11.min(host.host_id.len())]),
            tier: host.tier,
            placement,
            ssh_key: None,
            tags,
            auto_stop_timeout_secs: host.auto_stop_timeout_secs,
            bootstrap: self.bootstrap_spec(host, profile),
        }
    }

    fn bootstrap_spec(&self, host: &HostRecord, profile: &PlatformProfile) -> BootstrapSpec {
        BootstrapSpec {
            manifest_url: format!(
                "{}/hosts/{}/manifest",
                self.inner.settings.public_base_url, host.vm_token
            ),
            vm_token: host.vm_token.clone(),
            agent_port: host.agent_port,
            app_image: profile.app_image.clone(),
        }
    }

    fn describe_refreshed(&self, host_id: &str) -> Result<HostRecord, ProvisionAbort> {
        self.inner
            .hosts
            .get(host_id)
            .ok_or_else(|| ProvisionAbort::Failed("host record vanished".to_string()))
    }

    fn is_cancelled(&self, host_id: &str) -> bool {
        self.inner
            .hosts
            .get(host_id)
            .is_none_or(|h| h.state == HostState::Destroyed)
    }

    async fn check_cancelled(
        &self,
        host_id: &str,
        driver: &Arc<dyn HostDriver>,
    ) -> Result<(), ProvisionAbort> {
        if self.is_cancelled(host_id) {
            if let Some(host) = self.inner.hosts.get(host_id)
                && let Some(handle) = host.provider_handle
            {
                self.best_effort_destroy(driver, &handle).await;
            }
            return Err(ProvisionAbort::Cancelled);
        }
        Ok(())
    }

    async fn best_effort_destroy(&self, driver: &Arc<dyn HostDriver>, handle: &str) {
        if let Err(e) = driver.destroy(handle).await {
            warn!(handle, error = %e, "best-effort destroy failed");
        }
    }

    /// Terminal failure: record the reason and mark FAILED. Loses quietly if
    /// the host reached a terminal state first.
    fn fail_host(&self, host_id: &str, reason: &str) {
        match self.inner.hosts.get(host_id) {
            Some(host) if !host.state.is_terminal() => {}
            _ => return,
        }
        if let Err(e) = self.inner.hosts.update(host_id, |h| {
            h.last_error = Some(reason.to_string());
        }) {
            error!(host_id, error = %e, "failed to record error reason");
            return;
        }
        let result = self.inner.hosts.transition(
            host_id,
            &[
                HostState::Creating,
                HostState::Configuring,
                HostState::Ready,
                HostState::Running,
                HostState::Idle,
            ],
            HostState::Failed,
        );
        match result {
            Ok(TransitionOutcome::Applied) => {
                warn!(host_id, reason, "host marked FAILED");
            }
            Ok(_) => {}
            Err(e) => error!(host_id, error = %e, "failed to mark host FAILED"),
        }
    }

    fn spawn_provider_call(&self, host: HostRecord, call: ProviderCall) {
        let Some(handle) = host.provider_handle.clone() else {
            debug!(host_id = %host.host_id, "no provider handle, skipping {call:?}");
            return;
        };
        let Some(driver) = self.driver(host.provider) else {
            warn!(host_id = %host.host_id, provider = %host.provider, "no driver registered for provider call");
            return;
        };
        tokio::spawn(async move {
            let result = match call {
                ProviderCall::Stop => driver.stop(&handle).await,
                ProviderCall::Destroy => driver.destroy(&handle).await,
            };
            if let Err(e) = result {
                warn!(host_id = %host.host_id, ?call, error = %e, "provider call failed");
            }
        });
    }

    // ─── Agent callbacks ────────────────────────────────────────────────────

    /// Manifest fetch, keyed by the host's agent token.
    pub fn manifest_for_token(&self, vm_token: &str) -> Result<SessionManifest, OrchestratorError> {
        let host = self
            .inner
            .hosts
            .find_by_token(vm_token)
            .ok_or_else(|| OrchestratorError::NotFound("unknown vm token".to_string()))?;
        let profile = self
            .inner
            .profiles
            .get(&host.platform)
            .ok_or_else(|| OrchestratorError::UnknownPlatform(host.platform.clone()))?;

        let save_filename = host
            .save_ref
            .as_deref()
            .and_then(|r| r.rsplit('/').next())
            .map(String::from);

        Ok(SessionManifest {
            session_id: host.host_id.replacen("pg-", "sess-", 1),
            host_id: host.host_id.clone(),
            user_id: host.user_id.clone(),
            platform: host.platform.clone(),
            app_image: profile.app_image.clone(),
            rom_ref: profile.rom_ref.clone(),
            save_ref: host.save_ref.clone(),
            save_filename,
            firmware_ref: profile.firmware_ref.clone(),
            fake_time: profile.fake_time,
            app_config: profile.app_config.clone(),
            resolution: profile.resolution.clone(),
            fps: profile.fps,
            codec: profile.codec,
            client_cert: self.inner.settings.client_cert_pem.clone(),
            dual_screen: profile.dual_screen.clone(),
        })
    }

    /// `started`: READY → RUNNING, anchor the session clock.
    pub async fn handle_started(
        &self,
        host_id: &str,
        event: StartedEvent,
    ) -> Result<(), OrchestratorError> {
        let host = self.describe_session(host_id)?;
        match seq_disposition(&host, event.seq) {
            SeqDisposition::Duplicate => return Ok(()),
            SeqDisposition::OutOfOrder => {
                warn!(host_id, seq = ?event.seq, last = ?host.last_seq, "dropping out-of-order started event");
                return Ok(());
            }
            SeqDisposition::Apply => {}
        }

        let outcome =
            self.inner
                .hosts
                .transition(host_id, &[HostState::Ready], HostState::Running)?;
        match outcome {
            TransitionOutcome::Applied | TransitionOutcome::AlreadyThere => {
                self.inner.hosts.update(host_id, |h| {
                    h.last_activity = event.started_at;
                    h.session_started_at = Some(event.started_at);
                    apply_seq(h, event.seq);
                })?;
                info!(host_id, "session running");
                Ok(())
            }
            TransitionOutcome::Rejected { actual } => {
                warn!(host_id, state = %actual, "started callback for host not in READY");
                Ok(())
            }
        }
    }

    /// `save_event`: replace-not-increment save-slot arithmetic. Accepted in
    /// any state, including STOPPED; the session is not re-opened, but an
    /// IDLE host counts it as activity.
    pub async fn handle_save_event(
        &self,
        host_id: &str,
        event: SaveEvent,
    ) -> Result<(), OrchestratorError> {
        let host = self.describe_session(host_id)?;
        match seq_disposition(&host, event.seq) {
            SeqDisposition::Duplicate => return Ok(()),
            SeqDisposition::OutOfOrder => {
                warn!(host_id, seq = ?event.seq, last = ?host.last_seq, "dropping out-of-order save event");
                return Ok(());
            }
            SeqDisposition::Apply => {}
        }

        let session_started = host.session_started_at.unwrap_or(event.wall_clock);
        let elapsed = (event.wall_clock - session_started).num_seconds().max(0);
        let accumulated = event.base_accumulated_seconds + elapsed;

        self.inner.hosts.update(host_id, |h| {
            let newer = h
                .save_slot
                .as_ref()
                .is_none_or(|slot| event.wall_clock > slot.wall_clock);
            if newer {
                h.save_slot = Some(SaveSlot {
                    slot_id: event.save_slot_id.clone(),
                    accumulated_seconds: accumulated,
                    wall_clock: event.wall_clock,
                });
            }
            h.saves_mounted = true;
            h.last_activity = h.last_activity.max(event.wall_clock);
            apply_seq(h, event.seq);
        })?;

        // Save traffic is activity: an idle session is live again.
        let _ = self
            .inner
            .hosts
            .transition(host_id, &[HostState::Idle], HostState::Running)?;

        debug!(host_id, accumulated, "save slot updated");
        Ok(())
    }

    /// `idle`: RUNNING → IDLE.
    pub async fn handle_idle(
        &self,
        host_id: &str,
        event: IdleEvent,
    ) -> Result<(), OrchestratorError> {
        let host = self.describe_session(host_id)?;
        match seq_disposition(&host, event.seq) {
            SeqDisposition::Duplicate => return Ok(()),
            SeqDisposition::OutOfOrder => {
                warn!(host_id, seq = ?event.seq, last = ?host.last_seq, "dropping out-of-order idle event");
                return Ok(());
            }
            SeqDisposition::Apply => {}
        }

        let _ = self
            .inner
            .hosts
            .transition(host_id, &[HostState::Running], HostState::Idle)?;
        self.inner.hosts.update(host_id, |h| {
            h.last_client_disconnect = Some(event.last_client_disconnect);
            apply_seq(h, event.seq);
        })?;
        info!(host_id, "session idle");
        Ok(())
    }

    /// `ended`: any live state → STOPPED, stop the provider instance.
    pub async fn handle_ended(
        &self,
        host_id: &str,
        event: EndedEvent,
    ) -> Result<(), OrchestratorError> {
        let host = self.describe_session(host_id)?;
        if host.state.is_terminal() {
            return Ok(());
        }
        match seq_disposition(&host, event.seq) {
            SeqDisposition::Duplicate => return Ok(()),
            SeqDisposition::OutOfOrder => {
                warn!(host_id, seq = ?event.seq, last = ?host.last_seq, "dropping out-of-order ended event");
                return Ok(());
            }
            SeqDisposition::Apply => {}
        }

        let outcome = self.inner.hosts.transition(
            host_id,
            &[
                HostState::Creating,
                HostState::Configuring,
                HostState::Ready,
                HostState::Running,
                HostState::Idle,
            ],
            HostState::Stopped,
        )?;
        self.inner.hosts.update(host_id, |h| {
            h.last_activity = event.ended_at;
            apply_seq(h, event.seq);
        })?;
        if outcome == TransitionOutcome::Applied {
            info!(host_id, "session ended");
            self.spawn_provider_call(host, ProviderCall::Stop);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum ProviderCall {
    Stop,
    Destroy,
}

enum ProvisionAbort {
    Cancelled,
    Failed(String),
}

// ─── Sequence handling ───────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum SeqDisposition {
    Apply,
    Duplicate,
    OutOfOrder,
}

fn seq_disposition(host: &HostRecord, seq: Option<u64>) -> SeqDisposition {
    match (host.last_seq, seq) {
        (Some(last), Some(s)) if s == last => SeqDisposition::Duplicate,
        (Some(last), Some(s)) if s < last => SeqDisposition::OutOfOrder,
        _ => SeqDisposition::Apply,
    }
}

fn apply_seq(host: &mut HostRecord, seq: Option<u64>) {
    if let Some(s) = seq {
        host.last_seq = Some(s);
    }
}

// ─── Retries ─────────────────────────────────────────────────────────────────

/// Retry a driver call on retryable errors: exponential backoff starting at
/// 2 s, doubling, capped at 30 s.
async fn with_retries<T, F, Fut>(op: &str, mut f: F) -> Result<T, DriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DriverError>>,
{
    let mut delay = Duration::from_secs(RETRY_INITIAL_SECS);
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.retryable() && attempt < MAX_CREATE_RETRIES => {
                attempt += 1;
                warn!(op, attempt, delay_secs = delay.as_secs(), error = %e, "retrying provider call");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(RETRY_CAP_SECS));
            }
            Err(e) => return Err(e),
        }
    }
}

// ─── StateTransitioner impl ──────────────────────────────────────────────────

#[async_trait]
impl StateTransitioner for Orchestrator {
    async fn request_stop(&self, host_id: &str, reason: &str) -> Result<(), OrchestratorError> {
        let host = self.describe_session(host_id)?;
        if host.state.is_terminal() || host.state == HostState::Stopped {
            return Ok(());
        }
        let outcome = self.inner.hosts.transition(
            host_id,
            &[
                HostState::Creating,
                HostState::Configuring,
                HostState::Ready,
                HostState::Running,
                HostState::Idle,
            ],
            HostState::Stopped,
        )?;
        if outcome == TransitionOutcome::Applied {
            info!(host_id, reason, "supervisor stop");
            self.spawn_provider_call(host, ProviderCall::Stop);
        }
        Ok(())
    }

    async fn request_idle_stop(&self, host_id: &str) -> Result<(), OrchestratorError> {
        let host = self.describe_session(host_id)?;
        let outcome = self
            .inner
            .hosts
            .transition(host_id, &[HostState::Running], HostState::Idle)?;
        if outcome != TransitionOutcome::Applied {
            // Lost the CAS: another caller is already driving this host
            // through the idle-stop path (or it moved on). Idempotent-ok.
            return Ok(());
        }

        if let (Some(handle), Some(driver)) =
            (host.provider_handle.clone(), self.driver(host.provider))
        {
            if let Err(e) = driver.stop(&handle).await {
                warn!(host_id, error = %e, "idle stop: provider stop failed");
                return Err(e.into());
            }
        }

        let _ = self
            .inner
            .hosts
            .transition(host_id, &[HostState::Idle], HostState::Stopped)?;
        info!(host_id, "idle host stopped");
        Ok(())
    }

    async fn request_destroy(&self, host_id: &str, reason: &str) -> Result<(), OrchestratorError> {
        let host = self.describe_session(host_id)?;
        if host.state == HostState::Destroyed {
            return Ok(());
        }
        let outcome = self.inner.hosts.transition(
            host_id,
            &[HostState::Stopped],
            HostState::Destroyed,
        )?;
        if outcome == TransitionOutcome::Applied {
            info!(host_id, reason, "supervisor destroy");
            self.spawn_provider_call(host, ProviderCall::Destroy);
        }
        Ok(())
    }

    async fn mark_failed(&self, host_id: &str, reason: &str) -> Result<(), OrchestratorError> {
        let host = self.describe_session(host_id)?;
        if host.state.is_terminal() {
            return Ok(());
        }
        self.inner.hosts.update(host_id, |h| {
            h.last_error = Some(reason.to_string());
        })?;
        let outcome = self.inner.hosts.transition(
            host_id,
            &[
                HostState::Creating,
                HostState::Configuring,
                HostState::Ready,
                HostState::Running,
                HostState::Idle,
            ],
            HostState::Failed,
        )?;
        if outcome == TransitionOutcome::Applied {
            warn!(host_id, reason, "supervisor marked host FAILED");
            // The winner of the CAS issues the destroy exactly once.
            self.spawn_provider_call(host, ProviderCall::Destroy);
        }
        Ok(())
    }
}
