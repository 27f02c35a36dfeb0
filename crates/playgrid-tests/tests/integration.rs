//! End-to-end flows across the PlayGrid crates:
//! - provisioning through the orchestrator with a scripted driver
//! - supervisor sweeps driving idle stop, orphan destruction, mass drain
//! - concurrent stop collapse (exactly one provider side effect)
//! - placement fallback + manifest assembly

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use grid_billing::{RateEntry, RateTable};
use grid_geo::Geocoder;
use grid_orchestrator::{
    Orchestrator, OrchestratorSettings, SessionRequest, StateTransitioner,
};
use grid_persist::{HostStore, ProfileStore};
use grid_placement::{Optimizer, RegionFinder};
use grid_providers::{CreateOutcome, CreateRequest, DriverError, DriverStatus, HostDriver};
use grid_proto::{
    Codec, Coord, GpuTier, HostRecord, HostState, LifecycleState, PlatformProfile, Provider,
    ProviderPreference, StartedEvent,
};
use grid_supervisor::{AgentHealth, Supervisor, SupervisorSettings};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ─── Scripted driver ──────────────────────────────────────────────────────────

struct ScriptedDriver {
    calls: Mutex<Vec<String>>,
}

impl ScriptedDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()) })
    }

    fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }
}

#[async_trait]
impl HostDriver for ScriptedDriver {
    fn provider(&self) -> Provider {
        Provider::Fly
    }

    async fn create(&self, _req: &CreateRequest) -> Result<CreateOutcome, DriverError> {
        self.calls.lock().push("create".to_string());
        Ok(CreateOutcome {
            provider_handle: "m-0001".to_string(),
            provider_metadata: HashMap::new(),
        })
    }

    async fn describe(&self, _handle: &str) -> Result<DriverStatus, DriverError> {
        self.calls.lock().push("describe".to_string());
        Ok(DriverStatus {
            provider_state: "running".to_string(),
            address: Some("10.0.0.5".to_string()),
        })
    }

    async fn start(&self, _handle: &str) -> Result<(), DriverError> {
        self.calls.lock().push("start".to_string());
        Ok(())
    }

    async fn stop(&self, _handle: &str) -> Result<(), DriverError> {
        self.calls.lock().push("stop".to_string());
        Ok(())
    }

    async fn destroy(&self, _handle: &str) -> Result<(), DriverError> {
        self.calls.lock().push("destroy".to_string());
        Ok(())
    }

    fn translate(&self, provider_state: &str) -> LifecycleState {
        match provider_state {
            "running" => LifecycleState::Running,
            "stopped" => LifecycleState::Stopped,
            _ => LifecycleState::Unknown,
        }
    }
}

// ─── Fixture ─────────────────────────────────────────────────────────────────

struct World {
    orchestrator: Orchestrator,
    hosts: Arc<HostStore>,
    profiles: Arc<ProfileStore>,
    rates: Arc<RateTable>,
    driver: Arc<ScriptedDriver>,
    _dir: tempfile::TempDir,
}

fn profile() -> PlatformProfile {
    PlatformProfile {
        platform: "plat-a".to_string(),
        family: "handheld".to_string(),
        min_vcpu: 4,
        min_memory_gib: 8,
        min_gpu_count: 0,
        requires_gpu: false,
        max_session_hours: 6.0,
        default_tier: GpuTier::Mid,
        preferences: vec![ProviderPreference {
            provider: Provider::Fly,
            priority: 1,
            enabled: true,
            tier_override: None,
            hourly_cost_cap: None,
        }],
        app_image: "registry.playgrid.gg/emu/plat-a:12".to_string(),
        rom_ref: Some("roms/plat-a/game.bin".to_string()),
        firmware_ref: None,
        app_config: serde_json::json!({"scale": 2}),
        resolution: "1280x720".to_string(),
        fps: 60,
        codec: Codec::H264,
        dual_screen: None,
        fake_time: None,
    }
}

fn world() -> World {
    let dir = tempfile::tempdir().expect("tempdir");
    let hosts = Arc::new(HostStore::open(dir.path(), "hosts"));
    let profiles = Arc::new(ProfileStore::open(dir.path(), "platforms"));
    profiles.put(profile()).expect("profile");

    let geocoder = Arc::new(Geocoder::new("http://127.0.0.1:1/none"));
    let finder = RegionFinder::new("http://127.0.0.1:1/none", "pg-it");
    let optimizer = Arc::new(Optimizer::new(geocoder, None, finder));

    let rates = Arc::new(
        RateTable::from_entries(
            vec![RateEntry {
                tier: GpuTier::Mid,
                family: "handheld".to_string(),
                provider: Provider::Fly,
                hourly_rate: 12.0,
            }],
            HashMap::new(),
        )
        .expect("rates"),
    );

    let driver = ScriptedDriver::new();
    let mut drivers: HashMap<Provider, Arc<dyn HostDriver>> = HashMap::new();
    drivers.insert(Provider::Fly, driver.clone());

    let orchestrator = Orchestrator::new(
        hosts.clone(),
        profiles.clone(),
        drivers,
        optimizer,
        rates.clone(),
        OrchestratorSettings::default(),
    );
    World { orchestrator, hosts, profiles, rates, driver, _dir: dir }
}

fn supervisor_for(world: &World, settings: SupervisorSettings) -> Arc<Supervisor> {
    let transitioner: Arc<dyn StateTransitioner> = Arc::new(world.orchestrator.clone());
    Arc::new(Supervisor::new(
        world.hosts.clone(),
        world.profiles.clone(),
        world.rates.clone(),
        transitioner,
        settings,
    ))
}

fn request() -> SessionRequest {
    SessionRequest {
        user_id: "u1".to_string(),
        platform: "plat-a".to_string(),
        user_coord: Some(Coord::new(40.7128, -74.0060)),
        save_ref: None,
    }
}

async fn wait_for_state(world: &World, host_id: &str, state: HostState) {
    for _ in 0..500 {
        if world.hosts.get(host_id).unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {state}, host is {}",
        world.hosts.get(host_id).unwrap().state
    );
}

/// Insert a host directly in the given state, bypassing provisioning.
fn seeded_host(world: &World, state: HostState) -> HostRecord {
    let mut host = HostRecord::new(
        "u-seed",
        "plat-a",
        GpuTier::Mid,
        Provider::Fly,
        None,
        None,
        900,
    );
    host.state = state;
    host.provider_handle = Some("m-seeded".to_string());
    host.address = Some("127.0.0.1".to_string());
    host.agent_port = 1; // unroutable unless a test rebinds it
    let record = host.clone();
    world.hosts.insert(host);
    record
}

/// Serve a fixed agent `/health` body on an ephemeral port.
async fn spawn_agent_stub(health: AgentHealth) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let app = Router::new()
        .route(
            "/health",
            get(|State(h): State<AgentHealth>| async move { Json(h) }),
        )
        .with_state(health);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    port
}

fn liveness_settings() -> SupervisorSettings {
    SupervisorSettings {
        probe_timeout: Duration::from_secs(1),
        ..SupervisorSettings::default()
    }
}

// ─── Provisioning lifecycle ──────────────────────────────────────────────────

#[tokio::test]
async fn test_session_reaches_running_via_agent_callback() {
    let world = world();
    let host = world.orchestrator.request_session(request()).await.expect("request");
    assert_eq!(host.state, HostState::Creating);

    wait_for_state(&world, &host.host_id, HostState::Ready).await;
    let ready = world.hosts.get(&host.host_id).unwrap();
    assert_eq!(ready.address.as_deref(), Some("10.0.0.5"));
    assert!(ready.environment_ready);

    // The agent fetches its manifest by token, then reports started.
    let manifest = world
        .orchestrator
        .manifest_for_token(&ready.vm_token)
        .expect("manifest");
    assert_eq!(manifest.app_image, "registry.playgrid.gg/emu/plat-a:12");
    assert_eq!(manifest.codec, Codec::H264);

    world
        .orchestrator
        .handle_started(&host.host_id, StartedEvent { started_at: Utc::now(), seq: Some(1) })
        .await
        .expect("started");
    assert_eq!(world.hosts.get(&host.host_id).unwrap().state, HostState::Running);
}

#[tokio::test]
async fn test_concurrent_stops_collapse_to_one_provider_call() {
    let world = world();
    let host = world.orchestrator.request_session(request()).await.expect("request");
    wait_for_state(&world, &host.host_id, HostState::Ready).await;

    let (a, b, c) = tokio::join!(
        world.orchestrator.stop_session(&host.host_id),
        world.orchestrator.stop_session(&host.host_id),
        world.orchestrator.stop_session(&host.host_id),
    );
    a.expect("stop a");
    b.expect("stop b");
    c.expect("stop c");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(world.hosts.get(&host.host_id).unwrap().state, HostState::Stopped);
    assert_eq!(world.driver.count("stop"), 1);
}

#[tokio::test]
async fn test_destroy_during_provisioning_cleans_up() {
    let world = world();
    let host = world.orchestrator.request_session(request()).await.expect("request");
    world.orchestrator.destroy_session(&host.host_id).await.expect("destroy");

    // The provisioning task observes DESTROYED between steps and either
    // never creates, or destroys what it created.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let terminal = world.hosts.get(&host.host_id).unwrap();
    assert_eq!(terminal.state, HostState::Destroyed);
    if world.driver.count("create") > 0 {
        assert!(world.driver.count("destroy") >= 1);
    }
}

// ─── Supervisor scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn test_idle_timeout_stops_host_within_one_cycle() {
    let world = world();
    let host = seeded_host(&world, HostState::Running);

    // Agent reports no clients, idle for 11 minutes against a 10 minute
    // threshold.
    let port = spawn_agent_stub(AgentHealth {
        connected_clients: 0,
        idle_since: Some(Utc::now() - ChronoDuration::minutes(11)),
        session_duration_secs: 3600,
    })
    .await;
    world
        .hosts
        .update(&host.host_id, |h| h.agent_port = port)
        .expect("rebind agent port");

    let supervisor = supervisor_for(&world, liveness_settings());
    let report = supervisor.liveness_sweep().await;

    assert_eq!(report.idle_stopped, 1);
    assert_eq!(world.hosts.get(&host.host_id).unwrap().state, HostState::Stopped);
    assert_eq!(world.driver.count("stop"), 1);
}

#[tokio::test]
async fn test_healthy_host_survives_sweep_and_resets_strikes() {
    let world = world();
    let host = seeded_host(&world, HostState::Running);
    world
        .hosts
        .update(&host.host_id, |h| h.unhealthy_strikes = 2)
        .expect("prime strikes");

    let port = spawn_agent_stub(AgentHealth {
        connected_clients: 3,
        idle_since: None,
        session_duration_secs: 1800,
    })
    .await;
    world
        .hosts
        .update(&host.host_id, |h| h.agent_port = port)
        .expect("rebind agent port");

    let supervisor = supervisor_for(&world, liveness_settings());
    let report = supervisor.liveness_sweep().await;

    assert_eq!(report.healthy, 1);
    let refreshed = world.hosts.get(&host.host_id).unwrap();
    assert_eq!(refreshed.state, HostState::Running);
    assert_eq!(refreshed.unhealthy_strikes, 0);
}

#[tokio::test]
async fn test_session_over_ceiling_is_hard_stopped() {
    let world = world();
    let host = seeded_host(&world, HostState::Running);

    // 7 hours against the profile's 6 hour ceiling, with a client connected.
    let port = spawn_agent_stub(AgentHealth {
        connected_clients: 1,
        idle_since: None,
        session_duration_secs: 7 * 3600,
    })
    .await;
    world
        .hosts
        .update(&host.host_id, |h| h.agent_port = port)
        .expect("rebind agent port");

    let supervisor = supervisor_for(&world, liveness_settings());
    let report = supervisor.liveness_sweep().await;

    assert_eq!(report.hard_stopped, 1);
    assert_eq!(world.hosts.get(&host.host_id).unwrap().state, HostState::Stopped);
}

#[tokio::test]
async fn test_orphan_host_fails_after_three_strikes_destroy_called_once() {
    let world = world();
    // Port 1 is never listening: every probe is connection-refused.
    let host = seeded_host(&world, HostState::Running);

    let supervisor = supervisor_for(&world, liveness_settings());
    supervisor.liveness_sweep().await;
    supervisor.liveness_sweep().await;
    assert_eq!(world.hosts.get(&host.host_id).unwrap().unhealthy_strikes, 2);

    let report = supervisor.liveness_sweep().await;
    assert_eq!(report.failed, 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let failed = world.hosts.get(&host.host_id).unwrap();
    assert_eq!(failed.state, HostState::Failed);
    assert_eq!(world.driver.count("destroy"), 1);

    // FAILED hosts leave the sweep set: no repeat destroy.
    supervisor.liveness_sweep().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(world.driver.count("destroy"), 1);
}

#[tokio::test]
async fn test_hard_spend_cap_drains_fleet_but_new_requests_proceed() {
    let world = world();
    // Three hosts, each ~2h at $12/h → $72 month-to-date, hard cap $50.
    for _ in 0..3 {
        let host = seeded_host(&world, HostState::Running);
        world
            .hosts
            .update(&host.host_id, |h| {
                h.created_at = Utc::now() - ChronoDuration::hours(2);
                h.last_activity = Utc::now();
            })
            .expect("age host");
    }

    let supervisor = supervisor_for(
        &world,
        SupervisorSettings {
            monthly_soft_cap_usd: 20.0,
            monthly_hard_cap_usd: 50.0,
            probe_timeout: Duration::from_secs(1),
            ..SupervisorSettings::default()
        },
    );
    let report = supervisor.liveness_sweep().await;
    assert!(report.spend_warning);
    assert_eq!(report.mass_drained, 3);

    tokio::time::sleep(Duration::from_millis(100)).await;
    for host in world.hosts.all() {
        if host.user_id == "u-seed" {
            assert_eq!(host.state, HostState::Stopped);
        }
    }

    // The cap drains running cost; it does not block new session requests.
    let host = world.orchestrator.request_session(request()).await.expect("request");
    wait_for_state(&world, &host.host_id, HostState::Ready).await;
}

#[tokio::test]
async fn test_long_stopped_host_destroyed_by_sweep() {
    let world = world();
    let mut aged = HostRecord::new("u-old", "plat-a", GpuTier::Mid, Provider::Fly, None, None, 900);
    aged.state = HostState::Stopped;
    aged.provider_handle = Some("m-old".to_string());
    aged.updated_at = Utc::now() - ChronoDuration::hours(72);
    let aged_id = aged.host_id.clone();
    world.hosts.insert(aged);

    let supervisor = supervisor_for(&world, liveness_settings());
    let destroyed = supervisor.long_stopped_sweep().await;
    assert_eq!(destroyed, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(world.hosts.get(&aged_id).unwrap().state, HostState::Destroyed);
    assert_eq!(world.driver.count("destroy"), 1);

    // Destroy is not repeated for already-destroyed hosts.
    let destroyed_again = supervisor.long_stopped_sweep().await;
    assert_eq!(destroyed_again, 0);
}

// ─── Billing over real records ───────────────────────────────────────────────

#[tokio::test]
async fn test_billing_rollup_reflects_seeded_usage() {
    let world = world();
    let host = seeded_host(&world, HostState::Stopped);
    world
        .hosts
        .update(&host.host_id, |h| {
            h.created_at = Utc::now() - ChronoDuration::hours(3);
            h.last_activity = Utc::now() - ChronoDuration::hours(1);
        })
        .expect("age host");

    let now = Utc::now();
    let report = grid_billing::rollup(
        &world.hosts.all(),
        &world.profiles.all(),
        &world.rates,
        &grid_billing::BillingQuery {
            from: now - ChronoDuration::days(7),
            to: now,
            provider: None,
            user_id: Some("u-seed".to_string()),
        },
    );

    assert_eq!(report.per_host.len(), 1);
    // ~2 billable hours at $12/h
    assert!((report.totals.estimated_cost - 24.0).abs() < 0.5);
}
