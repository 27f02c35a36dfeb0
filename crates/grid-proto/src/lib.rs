//! Domain types for the PlayGrid session control plane.
//!
//! Defines the vocabulary shared between the orchestrator, the provider
//! adapters, the supervisor, and the public API: hosts, tiers, platform
//! profiles, the session manifest, and agent callback payloads.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ─── Provider & Tier ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    TensorDock,
    Fly,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TensorDock => write!(f, "tensordock"),
            Self::Fly => write!(f, "fly"),
        }
    }
}

/// Coarse capability class of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuTier {
    Low,
    Mid,
    High,
}

impl GpuTier {
    /// Port the on-host agent listens on for this tier.
    pub fn default_agent_port(&self) -> u16 {
        match self {
            Self::Low => 8701,
            Self::Mid => 8702,
            Self::High => 8703,
        }
    }

    /// Ceiling for `wait_ready` during provisioning, in seconds.
    pub fn default_ready_ceiling_secs(&self) -> u64 {
        600
    }
}

impl std::fmt::Display for GpuTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Mid => write!(f, "mid"),
            Self::High => write!(f, "high"),
        }
    }
}

// ─── Host lifecycle ──────────────────────────────────────────────────────────

/// Persisted state of a host. Transitions are CAS-serialized per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostState {
    Creating,
    Configuring,
    Ready,
    Running,
    Idle,
    Stopped,
    Destroyed,
    Failed,
}

impl HostState {
    /// DESTROYED and FAILED accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }

    /// True when the host is expected to answer agent health probes.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Idle)
    }

    /// Whether `self → to` is a declared edge of the lifecycle graph.
    ///
    /// STOPPED → CONFIGURING is the implicit-restart edge: a deduplicated
    /// stopped host is started and re-enters through the normal ready path.
    pub fn can_transition(&self, to: HostState) -> bool {
        use HostState::*;
        match self {
            Creating => matches!(to, Configuring | Stopped | Destroyed | Failed),
            Configuring => matches!(to, Ready | Stopped | Destroyed | Failed),
            Ready => matches!(to, Running | Stopped | Destroyed | Failed),
            Running => matches!(to, Idle | Stopped | Destroyed | Failed),
            Idle => matches!(to, Running | Stopped | Destroyed | Failed),
            Stopped => matches!(to, Configuring | Destroyed),
            Destroyed | Failed => false,
        }
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Configuring => "CONFIGURING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Idle => "IDLE",
            Self::Stopped => "STOPPED",
            Self::Destroyed => "DESTROYED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// The shared vocabulary provider-reported states translate into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleState {
    Creating,
    Running,
    Stopped,
    Failed,
    Destroyed,
    #[default]
    Unknown,
}

// ─── Coordinates ─────────────────────────────────────────────────────────────

/// A geodesic coordinate. Latitude in [-90, 90], longitude in [-180, 180].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
}

impl Coord {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

// ─── Host record ─────────────────────────────────────────────────────────────

/// Save-slot bookkeeping attached to a host. Updated by `save_event`
/// callbacks with the replace-not-increment rule: the event with the
/// largest wall clock wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveSlot {
    pub slot_id: Option<String>,
    pub accumulated_seconds: i64,
    pub wall_clock: DateTime<Utc>,
}

/// Where a placement decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementSource {
    /// Ranked by the external location-finder service.
    Remote,
    /// Ranked locally (inventory distance sort or static region table).
    Local,
}

/// A provisioned compute instance hosting one streaming session.
///
/// Records are never deleted; terminal states are retained for billing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub host_id: String,
    pub user_id: String,
    pub platform: String,
    pub tier: GpuTier,
    pub provider: Provider,

    /// Set once the provider accepts the create call; null only in CREATING.
    pub provider_handle: Option<String>,
    #[serde(default)]
    pub provider_metadata: HashMap<String, String>,

    pub address: Option<String>,
    pub agent_port: u16,

    pub state: HostState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub auto_stop_timeout_secs: u64,

    pub user_coord: Option<Coord>,
    #[serde(default)]
    pub placement_source: Option<PlacementSource>,

    /// Monotonic true-once readiness flags.
    #[serde(default)]
    pub environment_ready: bool,
    #[serde(default)]
    pub saves_mounted: bool,

    /// Opaque token the on-host agent presents to fetch its manifest.
    pub vm_token: String,

    pub save_ref: Option<String>,
    #[serde(default)]
    pub save_slot: Option<SaveSlot>,

    /// Set by the `started` callback; anchors save-event arithmetic.
    #[serde(default)]
    pub session_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_client_disconnect: Option<DateTime<Utc>>,

    /// Consecutive failed liveness probes; reset on any healthy response.
    #[serde(default)]
    pub unhealthy_strikes: u32,

    /// Highest agent callback sequence number applied so far.
    #[serde(default)]
    pub last_seq: Option<u64>,

    #[serde(default)]
    pub last_error: Option<String>,

    /// Optimistic-concurrency counter, bumped on every persisted write.
    #[serde(default)]
    pub version: u64,
}

impl HostRecord {
    /// New record in CREATING, as persisted by `request_session`.
    pub fn new(
        user_id: &str,
        platform: &str,
        tier: GpuTier,
        provider: Provider,
        user_coord: Option<Coord>,
        save_ref: Option<String>,
        auto_stop_timeout_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            host_id: format!("pg-{}", Uuid::new_v4()),
            user_id: user_id.to_string(),
            platform: platform.to_string(),
            tier,
            provider,
            provider_handle: None,
            provider_metadata: HashMap::new(),
            address: None,
            agent_port: tier.default_agent_port(),
            state: HostState::Creating,
            created_at: now,
            updated_at: now,
            last_activity: now,
            auto_stop_timeout_secs,
            user_coord,
            placement_source: None,
            environment_ready: false,
            saves_mounted: false,
            vm_token: Uuid::new_v4().simple().to_string(),
            save_ref,
            save_slot: None,
            session_started_at: None,
            last_client_disconnect: None,
            unhealthy_strikes: 0,
            last_seq: None,
            last_error: None,
            version: 0,
        }
    }
}

// ─── Platform profiles ───────────────────────────────────────────────────────

/// One entry of a profile's ordered provider preference list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPreference {
    pub provider: Provider,
    pub priority: u32,
    pub enabled: bool,
    #[serde(default)]
    pub tier_override: Option<GpuTier>,
    #[serde(default)]
    pub hourly_cost_cap: Option<f64>,
}

/// Streaming output codec offered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Hevc,
    Av1,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Layout for platforms that render two screens (top/bottom).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DualScreen {
    pub enabled: bool,
    pub top: Rect,
    pub bottom: Rect,
}

/// Configuration describing how a given platform should be hosted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformProfile {
    pub platform: String,
    /// Rate-table grouping key (e.g. "handheld", "console").
    pub family: String,

    pub min_vcpu: u32,
    pub min_memory_gib: u32,
    pub min_gpu_count: u32,
    pub requires_gpu: bool,
    pub max_session_hours: f64,

    pub default_tier: GpuTier,
    pub preferences: Vec<ProviderPreference>,

    // Manifest passthroughs, opaque to the core.
    pub app_image: String,
    #[serde(default)]
    pub rom_ref: Option<String>,
    #[serde(default)]
    pub firmware_ref: Option<String>,
    #[serde(default)]
    pub app_config: serde_json::Value,
    pub resolution: String,
    pub fps: u32,
    pub codec: Codec,
    #[serde(default)]
    pub dual_screen: Option<DualScreen>,
    /// Optional in-game clock spoof handed through to the agent.
    #[serde(default)]
    pub fake_time: Option<DateTime<Utc>>,
}

impl PlatformProfile {
    /// A profile must have at least one enabled preference, and priorities
    /// must be unique within the list.
    pub fn validate(&self) -> Result<(), String> {
        if !self.preferences.iter().any(|p| p.enabled) {
            return Err(format!(
                "profile '{}' has no enabled provider preference",
                self.platform
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for pref in &self.preferences {
            if !seen.insert(pref.priority) {
                return Err(format!(
                    "profile '{}' has duplicate preference priority {}",
                    self.platform, pref.priority
                ));
            }
        }
        if self.platform.is_empty() {
            return Err("profile platform tag must not be empty".to_string());
        }
        Ok(())
    }

    /// Preferences in priority order (lowest number first).
    pub fn ordered_preferences(&self) -> Vec<&ProviderPreference> {
        let mut prefs: Vec<&ProviderPreference> = self.preferences.iter().collect();
        prefs.sort_by_key(|p| p.priority);
        prefs
    }
}

// ─── Session manifest ────────────────────────────────────────────────────────

/// Immutable per-session payload the on-host agent fetches to know what
/// to run. Passthrough fields come from the platform profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: String,
    pub host_id: String,
    pub user_id: String,
    pub platform: String,
    pub app_image: String,
    pub rom_ref: Option<String>,
    pub save_ref: Option<String>,
    pub save_filename: Option<String>,
    pub firmware_ref: Option<String>,
    pub fake_time: Option<DateTime<Utc>>,
    pub app_config: serde_json::Value,
    pub resolution: String,
    pub fps: u32,
    pub codec: Codec,
    pub client_cert: String,
    pub dual_screen: Option<DualScreen>,
}

// ─── Agent callbacks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedEvent {
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveEvent {
    pub wall_clock: DateTime<Utc>,
    #[serde(default)]
    pub save_slot_id: Option<String>,
    pub base_accumulated_seconds: i64,
    #[serde(default)]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleEvent {
    pub last_client_disconnect: DateTime<Utc>,
    #[serde(default)]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndedEvent {
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub seq: Option<u64>,
}

// ─── Placement ───────────────────────────────────────────────────────────────

/// A normalized inventory node offered by the inventory provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuOffer {
    pub offer_id: String,
    pub city: String,
    #[serde(default)]
    pub region: Option<String>,
    pub country: String,
    pub vcpu: u32,
    pub memory_gib: u32,
    pub gpu_count: u32,
    pub price_per_hour: f64,
    pub dedicated_address: bool,
}

impl GpuOffer {
    pub fn meets(&self, min_vcpu: u32, min_memory_gib: u32, min_gpu_count: u32) -> bool {
        self.vcpu >= min_vcpu && self.memory_gib >= min_memory_gib && self.gpu_count >= min_gpu_count
    }
}

/// A chosen (provider, physical location) for a host to be created in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementChoice {
    pub provider: Provider,
    /// Named region code (Fly path).
    pub region: Option<String>,
    /// Selected inventory node (TensorDock path).
    pub offer: Option<GpuOffer>,
    pub source: PlacementSource,
    /// Geodesic distance from the user, when a user coordinate was given
    /// and the candidate resolved. Infinity marks unresolvable candidates.
    pub distance_km: Option<f64>,
}

// ─── Validation helpers ──────────────────────────────────────────────────────

/// Host ids are generated internally but arrive back via URLs; keep the
/// character set tight.
pub fn validate_host_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn validate_user_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_profile() -> PlatformProfile {
        PlatformProfile {
            platform: "plat-a".to_string(),
            family: "handheld".to_string(),
            min_vcpu: 4,
            min_memory_gib: 8,
            min_gpu_count: 1,
            requires_gpu: true,
            max_session_hours: 6.0,
            default_tier: GpuTier::Mid,
            preferences: vec![
                ProviderPreference {
                    provider: Provider::TensorDock,
                    priority: 1,
                    enabled: true,
                    tier_override: None,
                    hourly_cost_cap: Some(1.25),
                },
                ProviderPreference {
                    provider: Provider::Fly,
                    priority: 2,
                    enabled: true,
                    tier_override: Some(GpuTier::Low),
                    hourly_cost_cap: None,
                },
            ],
            app_image: "registry.playgrid.gg/emu/plat-a:12".to_string(),
            rom_ref: Some("roms/plat-a/game.bin".to_string()),
            firmware_ref: None,
            app_config: json!({"scale": 2}),
            resolution: "1280x720".to_string(),
            fps: 60,
            codec: Codec::H264,
            dual_screen: None,
            fake_time: None,
        }
    }

    #[test]
    fn test_provider_display() {
        assert_eq!(Provider::TensorDock.to_string(), "tensordock");
        assert_eq!(Provider::Fly.to_string(), "fly");
    }

    #[test]
    fn test_tier_agent_ports() {
        assert_eq!(GpuTier::Low.default_agent_port(), 8701);
        assert_eq!(GpuTier::Mid.default_agent_port(), 8702);
        assert_eq!(GpuTier::High.default_agent_port(), 8703);
    }

    #[test]
    fn test_state_transitions_follow_graph() {
        use HostState::*;
        assert!(Creating.can_transition(Configuring));
        assert!(Configuring.can_transition(Ready));
        assert!(Ready.can_transition(Running));
        assert!(Running.can_transition(Idle));
        assert!(Idle.can_transition(Running));
        assert!(Running.can_transition(Stopped));
        assert!(Stopped.can_transition(Destroyed));
        // implicit restart edge
        assert!(Stopped.can_transition(Configuring));
        // no skipping
        assert!(!Creating.can_transition(Running));
        assert!(!Ready.can_transition(Idle));
        // terminal
        assert!(!Destroyed.can_transition(Creating));
        assert!(!Failed.can_transition(Stopped));
    }

    #[test]
    fn test_terminal_states() {
        assert!(HostState::Destroyed.is_terminal());
        assert!(HostState::Failed.is_terminal());
        assert!(!HostState::Stopped.is_terminal());
        assert!(!HostState::Running.is_terminal());
    }

    #[test]
    fn test_coord_domain() {
        assert!(Coord::new(0.0, 0.0).is_valid());
        assert!(Coord::new(-90.0, 180.0).is_valid());
        assert!(!Coord::new(91.0, 0.0).is_valid());
        assert!(!Coord::new(0.0, -180.5).is_valid());
    }

    #[test]
    fn test_new_host_record_invariants() {
        let host = HostRecord::new(
            "u1",
            "plat-a",
            GpuTier::Mid,
            Provider::TensorDock,
            Some(Coord::new(40.7128, -74.006)),
            None,
            900,
        );
        assert_eq!(host.state, HostState::Creating);
        assert!(host.provider_handle.is_none());
        assert!(!host.environment_ready);
        assert_eq!(host.agent_port, 8702);
        assert!(validate_host_id(&host.host_id));
        assert!(!host.vm_token.is_empty());
    }

    #[test]
    fn test_profile_validation() {
        let profile = sample_profile();
        assert!(profile.validate().is_ok());

        let mut no_enabled = profile.clone();
        for p in &mut no_enabled.preferences {
            p.enabled = false;
        }
        assert!(no_enabled.validate().is_err());

        let mut dup_priority = profile.clone();
        dup_priority.preferences[1].priority = 1;
        assert!(dup_priority.validate().is_err());
    }

    #[test]
    fn test_ordered_preferences() {
        let mut profile = sample_profile();
        profile.preferences.reverse();
        let ordered = profile.ordered_preferences();
        assert_eq!(ordered[0].priority, 1);
        assert_eq!(ordered[0].provider, Provider::TensorDock);
    }

    #[test]
    fn test_manifest_json_round_trip() {
        let manifest = SessionManifest {
            session_id: "sess-1".to_string(),
            host_id: "pg-abc".to_string(),
            user_id: "u1".to_string(),
            platform: "plat-a".to_string(),
            app_image: "registry.playgrid.gg/emu/plat-a:12".to_string(),
            rom_ref: Some("roms/game.bin".to_string()),
            save_ref: Some("saves/u1/slot0".to_string()),
            save_filename: Some("slot0.sav".to_string()),
            firmware_ref: None,
            fake_time: Some("2024-03-01T09:00:00Z".parse().unwrap()),
            app_config: json!({"scale": 2, "layers": ["bg", "sprites"]}),
            resolution: "1280x720".to_string(),
            fps: 60,
            codec: Codec::Hevc,
            dual_screen: Some(DualScreen {
                enabled: true,
                top: Rect { x: 0, y: 0, w: 1280, h: 400 },
                bottom: Rect { x: 280, y: 400, w: 720, h: 320 },
            }),
            client_cert: "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----".to_string(),
        };

        let json = serde_json::to_string(&manifest).expect("serialize");
        let back: SessionManifest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_codec_wire_names() {
        assert_eq!(serde_json::to_string(&Codec::H264).unwrap(), "\"h264\"");
        assert_eq!(serde_json::to_string(&Codec::Av1).unwrap(), "\"av1\"");
    }

    #[test]
    fn test_offer_meets_minima() {
        let offer = GpuOffer {
            offer_id: "o-1".to_string(),
            city: "Boston".to_string(),
            region: Some("MA".to_string()),
            country: "US".to_string(),
            vcpu: 8,
            memory_gib: 16,
            gpu_count: 1,
            price_per_hour: 0.45,
            dedicated_address: true,
        };
        assert!(offer.meets(4, 8, 1));
        assert!(!offer.meets(16, 8, 1));
        assert!(!offer.meets(4, 32, 1));
    }

    #[test]
    fn test_validate_ids() {
        assert!(validate_host_id("pg-123e4567-e89b"));
        assert!(!validate_host_id(""));
        assert!(!validate_host_id("bad id with spaces"));
        assert!(validate_user_id("u1"));
        assert!(!validate_user_id(""));
    }

    #[test]
    fn test_host_state_wire_format() {
        assert_eq!(
            serde_json::to_string(&HostState::Creating).unwrap(),
            "\"CREATING\""
        );
        assert_eq!(
            serde_json::to_string(&HostState::Destroyed).unwrap(),
            "\"DESTROYED\""
        );
    }
}
