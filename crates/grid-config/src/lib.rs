//! Startup configuration for the PlayGrid control plane.
//!
//! Loaded once at startup from a JSON file; `PLAYGRID_*` environment
//! variables override file values, and serde defaults apply where both are
//! absent.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

// ─── Groups ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Root directory for JSON state snapshots.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_hosts_collection")]
    pub hosts_collection: String,
    #[serde(default = "default_platforms_collection")]
    pub platforms_collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorDockConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tensordock_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_flyctl")]
    pub binary_path: PathBuf,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_tensordock")]
    pub tensordock: TensorDockConfig,
    #[serde(default = "default_fly")]
    pub fly: FlyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConfig {
    /// Gazetteer (place-name → coordinate) endpoint.
    #[serde(default = "default_gazetteer_url")]
    pub gazetteer_url: String,
    /// Region-finder service endpoint for the named-region provider.
    #[serde(default = "default_location_finder_url")]
    pub location_finder_url: String,
    #[serde(default)]
    pub location_finder_project: String,
}

/// Per-tier values, explicit rather than keyed maps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerTierHours {
    pub low: f64,
    pub mid: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerTierSecs {
    pub low: u64,
    pub mid: u64,
    pub high: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,
    /// Jitter applied to each liveness cycle, as a percentage of the interval.
    #[serde(default = "default_jitter_pct")]
    pub liveness_jitter_pct: u32,
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,
    #[serde(default = "default_stopped_ttl")]
    pub stopped_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub long_stopped_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_soft_cap")]
    pub monthly_soft_cap_usd: f64,
    #[serde(default = "default_hard_cap")]
    pub monthly_hard_cap_usd: f64,
    /// Fallback session ceiling per tier when the platform profile has none.
    #[serde(default = "default_tier_hours")]
    pub max_session_hours: PerTierHours,
    /// `wait_ready` ceiling per tier during provisioning.
    #[serde(default = "default_tier_ready")]
    pub ready_ceiling_secs: PerTierSecs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "default_rate_table")]
    pub rate_table_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Externally reachable base URL for agent manifest fetches. Falls back
    /// to `http://{bind_addr}:{port}`.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// PEM bundle served to agents inside the session manifest.
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Cap on concurrently-running provisioning tasks; excess session
    /// requests are refused immediately.
    #[serde(default = "default_max_inflight")]
    pub max_inflight_provisions: usize,
    #[serde(default = "default_auto_stop")]
    pub auto_stop_timeout_secs: u64,
}

/// Top-level control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default = "default_persistence")]
    pub persistence: PersistenceConfig,
    #[serde(default = "default_providers")]
    pub providers: ProvidersConfig,
    #[serde(default = "default_external")]
    pub external: ExternalConfig,
    #[serde(default = "default_supervisor")]
    pub supervisor: SupervisorConfig,
    #[serde(default = "default_billing")]
    pub billing: BillingConfig,
    #[serde(default = "default_api")]
    pub api: ApiConfig,
    #[serde(default = "default_orchestrator")]
    pub orchestrator: OrchestratorConfig,
}

// ─── Defaults ────────────────────────────────────────────────────────────────

fn default_true() -> bool { true }
fn default_state_path() -> PathBuf { PathBuf::from("/var/lib/playgrid") }
fn default_hosts_collection() -> String { "hosts".to_string() }
fn default_platforms_collection() -> String { "platforms".to_string() }
fn default_tensordock_url() -> String { "https://marketplace.tensordock.com/api/v0".to_string() }
fn default_flyctl() -> PathBuf { PathBuf::from("flyctl") }
fn default_gazetteer_url() -> String { "https://nominatim.openstreetmap.org".to_string() }
fn default_location_finder_url() -> String { "https://regions.playgrid.gg".to_string() }
fn default_liveness_interval() -> u64 { 900 }
fn default_jitter_pct() -> u32 { 10 }
fn default_idle_threshold() -> u64 { 600 }
fn default_stopped_ttl() -> u64 { 172_800 }
fn default_sweep_interval() -> u64 { 86_400 }
fn default_probe_timeout() -> u64 { 5 }
fn default_soft_cap() -> f64 { 400.0 }
fn default_hard_cap() -> f64 { 500.0 }
fn default_rate_table() -> PathBuf { PathBuf::from("/etc/playgrid/rates.json") }
fn default_bind() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8780 }
fn default_max_inflight() -> usize { 32 }
fn default_auto_stop() -> u64 { 900 }

fn default_tier_hours() -> PerTierHours {
    PerTierHours { low: 4.0, mid: 6.0, high: 8.0 }
}

fn default_tier_ready() -> PerTierSecs {
    PerTierSecs { low: 600, mid: 600, high: 600 }
}

fn default_persistence() -> PersistenceConfig {
    PersistenceConfig {
        state_path: default_state_path(),
        hosts_collection: default_hosts_collection(),
        platforms_collection: default_platforms_collection(),
    }
}

fn default_tensordock() -> TensorDockConfig {
    TensorDockConfig {
        enabled: true,
        base_url: default_tensordock_url(),
        api_token: String::new(),
    }
}

fn default_fly() -> FlyConfig {
    FlyConfig {
        enabled: true,
        binary_path: default_flyctl(),
        config_path: None,
    }
}

fn default_providers() -> ProvidersConfig {
    ProvidersConfig { tensordock: default_tensordock(), fly: default_fly() }
}

fn default_external() -> ExternalConfig {
    ExternalConfig {
        gazetteer_url: default_gazetteer_url(),
        location_finder_url: default_location_finder_url(),
        location_finder_project: String::new(),
    }
}

fn default_supervisor() -> SupervisorConfig {
    SupervisorConfig {
        liveness_interval_secs: default_liveness_interval(),
        liveness_jitter_pct: default_jitter_pct(),
        idle_threshold_secs: default_idle_threshold(),
        stopped_ttl_secs: default_stopped_ttl(),
        long_stopped_interval_secs: default_sweep_interval(),
        probe_timeout_secs: default_probe_timeout(),
        monthly_soft_cap_usd: default_soft_cap(),
        monthly_hard_cap_usd: default_hard_cap(),
        max_session_hours: default_tier_hours(),
        ready_ceiling_secs: default_tier_ready(),
    }
}

fn default_billing() -> BillingConfig {
    BillingConfig { rate_table_path: default_rate_table() }
}

fn default_api() -> ApiConfig {
    ApiConfig {
        bind_addr: default_bind(),
        port: default_port(),
        cors_origins: Vec::new(),
        public_base_url: None,
        client_cert_path: None,
    }
}

fn default_orchestrator() -> OrchestratorConfig {
    OrchestratorConfig {
        max_inflight_provisions: default_max_inflight(),
        auto_stop_timeout_secs: default_auto_stop(),
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            persistence: default_persistence(),
            providers: default_providers(),
            external: default_external(),
            supervisor: default_supervisor(),
            billing: default_billing(),
            api: default_api(),
            orchestrator: default_orchestrator(),
        }
    }
}

// ─── Load / save / env overrides ─────────────────────────────────────────────

impl GridConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Invalid(format!("read {}: {e}", path.display())))?;
        let mut config: Self = serde_json::from_str(&data)
            .map_err(|e| ConfigError::Invalid(format!("parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        config.validate()?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Apply `PLAYGRID_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        if let Some(v) = var("PLAYGRID_STATE_PATH") {
            self.persistence.state_path = PathBuf::from(v);
        }
        if let Some(v) = var("PLAYGRID_TENSORDOCK_URL") {
            self.providers.tensordock.base_url = v;
        }
        if let Some(v) = var("PLAYGRID_TENSORDOCK_TOKEN") {
            self.providers.tensordock.api_token = v;
        }
        if let Some(v) = var("PLAYGRID_TENSORDOCK_ENABLED") {
            self.providers.tensordock.enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = var("PLAYGRID_FLY_BIN") {
            self.providers.fly.binary_path = PathBuf::from(v);
        }
        if let Some(v) = var("PLAYGRID_FLY_CONFIG") {
            self.providers.fly.config_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("PLAYGRID_FLY_ENABLED") {
            self.providers.fly.enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = var("PLAYGRID_GAZETTEER_URL") {
            self.external.gazetteer_url = v;
        }
        if let Some(v) = var("PLAYGRID_LOCATION_FINDER_URL") {
            self.external.location_finder_url = v;
        }
        if let Some(v) = var("PLAYGRID_LOCATION_FINDER_PROJECT") {
            self.external.location_finder_project = v;
        }
        if let Some(v) = var("PLAYGRID_RATE_TABLE") {
            self.billing.rate_table_path = PathBuf::from(v);
        }
        if let Some(v) = var("PLAYGRID_API_BIND") {
            self.api.bind_addr = v;
        }
        if let Some(v) = var("PLAYGRID_PUBLIC_BASE_URL") {
            self.api.public_base_url = Some(v);
        }
        if let Some(v) = var("PLAYGRID_API_PORT")
            && let Ok(port) = v.parse()
        {
            self.api.port = port;
        }
        if let Some(v) = var("PLAYGRID_LIVENESS_INTERVAL_SECS")
            && let Ok(secs) = v.parse()
        {
            self.supervisor.liveness_interval_secs = secs;
        }
        if let Some(v) = var("PLAYGRID_IDLE_THRESHOLD_SECS")
            && let Ok(secs) = v.parse()
        {
            self.supervisor.idle_threshold_secs = secs;
        }
        if let Some(v) = var("PLAYGRID_STOPPED_TTL_SECS")
            && let Ok(secs) = v.parse()
        {
            self.supervisor.stopped_ttl_secs = secs;
        }
        if let Some(v) = var("PLAYGRID_MONTHLY_SOFT_CAP")
            && let Ok(cap) = v.parse()
        {
            self.supervisor.monthly_soft_cap_usd = cap;
        }
        if let Some(v) = var("PLAYGRID_MONTHLY_HARD_CAP")
            && let Ok(cap) = v.parse()
        {
            self.supervisor.monthly_hard_cap_usd = cap;
        }
        if let Some(v) = var("PLAYGRID_MAX_INFLIGHT")
            && let Ok(n) = v.parse()
        {
            self.orchestrator.max_inflight_provisions = n;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.providers.tensordock.enabled && !self.providers.fly.enabled {
            return Err(ConfigError::Invalid(
                "at least one provider must be enabled".to_string(),
            ));
        }
        if self.providers.tensordock.enabled && self.providers.tensordock.api_token.is_empty() {
            return Err(ConfigError::Invalid(
                "tensordock enabled but api_token is empty".to_string(),
            ));
        }
        if self.supervisor.monthly_hard_cap_usd < self.supervisor.monthly_soft_cap_usd {
            return Err(ConfigError::Invalid(
                "monthly hard cap below soft cap".to_string(),
            ));
        }
        if self.supervisor.liveness_jitter_pct > 50 {
            return Err(ConfigError::Invalid(
                "liveness jitter above 50% defeats the sweep cadence".to_string(),
            ));
        }
        if self.orchestrator.max_inflight_provisions == 0 {
            return Err(ConfigError::Invalid(
                "max_inflight_provisions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GridConfig::default();
        assert_eq!(config.supervisor.liveness_interval_secs, 900);
        assert_eq!(config.supervisor.idle_threshold_secs, 600);
        assert_eq!(config.supervisor.stopped_ttl_secs, 172_800);
        assert_eq!(config.orchestrator.max_inflight_provisions, 32);
        assert_eq!(config.persistence.hosts_collection, "hosts");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        let mut config = GridConfig::default();
        config.providers.tensordock.api_token = "td-token".to_string();
        config.api.port = 9090;
        config.save(&path).expect("save");

        let loaded = GridConfig::load(&path).expect("load");
        assert_eq!(loaded.api.port, 9090);
        assert_eq!(loaded.providers.tensordock.api_token, "td-token");
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"providers": {"tensordock": {"enabled": false}}, "api": {"port": 1234}}"#,
        )
        .expect("write");

        let loaded = GridConfig::load(&path).expect("load");
        assert!(!loaded.providers.tensordock.enabled);
        assert!(loaded.providers.fly.enabled);
        assert_eq!(loaded.api.port, 1234);
        assert_eq!(loaded.supervisor.liveness_interval_secs, 900);
    }

    #[test]
    fn test_validate_rejects_all_disabled() {
        let mut config = GridConfig::default();
        config.providers.tensordock.enabled = false;
        config.providers.fly.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_caps() {
        let mut config = GridConfig::default();
        config.providers.tensordock.enabled = false;
        config.supervisor.monthly_soft_cap_usd = 600.0;
        config.supervisor.monthly_hard_cap_usd = 500.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_token_when_enabled() {
        let mut config = GridConfig::default();
        config.providers.tensordock.api_token.clear();
        assert!(config.validate().is_err());
        config.providers.tensordock.api_token = "t".to_string();
        assert!(config.validate().is_ok());
    }
}
