//! Provider adapters for PlayGrid host provisioning.
//!
//! Two heterogeneous providers sit behind the common [`HostDriver`]
//! contract: TensorDock (GPU marketplace, REST inventory + instance API)
//! and Fly (named regions, driven through the `flyctl` command-line tool).
//! Adapters translate vendor status strings into the shared
//! [`LifecycleState`] vocabulary and never retry internally; retry policy
//! belongs to the orchestrator.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use grid_proto::{Coord, GpuOffer, GpuTier, LifecycleState, PlacementChoice, Provider};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

const HTTP_CONNECT_TIMEOUT_SECS: u64 = 15;
const HTTP_TOTAL_TIMEOUT_SECS: u64 = 60;
const READY_POLL_SECS: u64 = 10;
const CLI_BUFFER_LINES: usize = 256;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("provider resource not found")]
    NotFound,

    #[error("timed out waiting for host readiness")]
    Timeout,

    #[error("provider error (retryable: {retryable}): {message}")]
    Provider { retryable: bool, message: String },
}

impl DriverError {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Provider { retryable: true, .. })
    }

    fn from_http(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::NOT_FOUND {
                return Self::NotFound;
            }
            return Self::Provider {
                retryable: status.is_server_error(),
                message: format!("http {status}: {err}"),
            };
        }
        // Transport-level failures are worth retrying.
        Self::Provider { retryable: true, message: err.to_string() }
    }
}

// ─── HostDriver contract ─────────────────────────────────────────────────────

/// What the orchestrator asks a provider to create.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub tier: GpuTier,
    pub placement: PlacementChoice,
    pub ssh_key: Option<String>,
    pub tags: HashMap<String, String>,
    pub auto_stop_timeout_secs: u64,
    /// How the on-host agent finds its manifest once the host is up.
    pub bootstrap: BootstrapSpec,
}

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub provider_handle: String,
    pub provider_metadata: HashMap<String, String>,
}

/// Raw provider view of a host: vendor status string plus address, if any.
#[derive(Debug, Clone)]
pub struct DriverStatus {
    pub provider_state: String,
    pub address: Option<String>,
}

/// Context for the out-of-band environment setup step.
#[derive(Debug, Clone)]
pub struct BootstrapSpec {
    pub manifest_url: String,
    pub vm_token: String,
    pub agent_port: u16,
    pub app_image: String,
}

/// Common contract both provider adapters implement.
///
/// `destroy` is idempotent: destroying an already-gone host succeeds.
/// `wait_ready` has a default implementation polling `describe`; a zero
/// `max_wait` times out before the first poll.
#[async_trait]
pub trait HostDriver: Send + Sync {
    fn provider(&self) -> Provider;

    async fn create(&self, req: &CreateRequest) -> Result<CreateOutcome, DriverError>;
    async fn describe(&self, handle: &str) -> Result<DriverStatus, DriverError>;
    async fn start(&self, handle: &str) -> Result<(), DriverError>;
    async fn stop(&self, handle: &str) -> Result<(), DriverError>;
    async fn destroy(&self, handle: &str) -> Result<(), DriverError>;

    /// Total mapping from vendor status strings into the shared vocabulary.
    fn translate(&self, provider_state: &str) -> LifecycleState;

    /// Out-of-band environment setup once the host is reachable.
    /// Default is a no-op for providers whose image boots the agent itself.
    async fn prepare_environment(
        &self,
        _handle: &str,
        _address: &str,
        _bootstrap: &BootstrapSpec,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    /// Poll `describe` until the host is running with an address, up to
    /// `max_wait`. Returns the address.
    async fn wait_ready(&self, handle: &str, max_wait: Duration) -> Result<String, DriverError> {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::Timeout);
            }

            let status = self.describe(handle).await?;
            let state = self.translate(&status.provider_state);

            if state == LifecycleState::Running
                && let Some(address) = status.address
            {
                return Ok(address);
            }
            if matches!(state, LifecycleState::Failed | LifecycleState::Destroyed) {
                return Err(DriverError::Provider {
                    retryable: false,
                    message: format!("host entered {} while waiting for readiness", status.provider_state),
                });
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(remaining.min(Duration::from_secs(READY_POLL_SECS))).await;
        }
    }
}

// ─── Agent bootstrap ─────────────────────────────────────────────────────────

/// Render the remote install script for a freshly provisioned host.
///
/// The script installs the streaming agent, writes its config with the
/// manifest URL baked in, and brings it up under systemd. Mirrors what the
/// base images do for providers that boot the agent directly.
pub fn agent_bootstrap_script(
    manifest_url: &str,
    vm_token: &str,
    agent_port: u16,
    app_image: &str,
) -> String {
    let agent_url = std::env::var("PLAYGRID_AGENT_BINARY_URL").unwrap_or_else(|_| {
        "https://releases.playgrid.gg/agent/latest/playgrid-agent-linux-amd64".to_string()
    });

    format!(
        r#"#!/bin/bash
set -euo pipefail
export DEBIAN_FRONTEND=noninteractive
apt-get update -qq
apt-get install -y -qq curl wget ca-certificates
mkdir -p /usr/local/bin /etc/playgrid-agent /var/log/playgrid-agent
wget -q -O /usr/local/bin/playgrid-agent "{agent_url}"
chmod +x /usr/local/bin/playgrid-agent
cat > /etc/playgrid-agent/config.json << 'CONFIG_EOF'
{{
  "manifest_url": "{manifest_url}",
  "vm_token": "{vm_token}",
  "listen_port": {agent_port},
  "app_image": "{app_image}"
}}
CONFIG_EOF
cat > /etc/systemd/system/playgrid-agent.service << 'SERVICE_EOF'
[Unit]
Description=PlayGrid Streaming Agent
After=network.target
[Service]
Type=simple
ExecStart=/usr/local/bin/playgrid-agent run --config /etc/playgrid-agent/config.json
Restart=always
RestartSec=10
StandardOutput=journal
StandardError=journal
SyslogIdentifier=playgrid-agent
[Install]
WantedBy=multi-user.target
SERVICE_EOF
systemctl daemon-reload && systemctl enable playgrid-agent && systemctl start playgrid-agent
echo "playgrid agent bootstrap complete"
"#
    )
}

// ─── TensorDock adapter ──────────────────────────────────────────────────────

fn tensordock_sizing(tier: &GpuTier) -> (u32, u32, u32) {
    // (vcpu, ram_gib, gpu_count)
    match tier {
        GpuTier::Low => (4, 8, 1),
        GpuTier::Mid => (8, 16, 1),
        GpuTier::High => (16, 32, 2),
    }
}

pub struct TensorDockDriver {
    api_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl TensorDockDriver {
    pub fn new(base_url: &str, api_token: String) -> Self {
        Self {
            api_token,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_client(),
        }
    }

    /// Fetch the marketplace inventory, normalized for the optimizer.
    pub async fn list_inventory(&self) -> Result<Vec<GpuOffer>, DriverError> {
        let resp: TensorDockInventoryResponse = self
            .client
            .get(format!("{}/inventory", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(DriverError::from_http)?
            .error_for_status()
            .map_err(DriverError::from_http)?
            .json()
            .await
            .map_err(DriverError::from_http)?;

        let offers: Vec<GpuOffer> = resp
            .nodes
            .into_iter()
            .map(|n| GpuOffer {
                offer_id: n.id,
                city: n.location.city,
                region: n.location.region,
                country: n.location.country,
                vcpu: n.specs.vcpu_count,
                memory_gib: n.specs.ram_gib,
                gpu_count: n.specs.gpu_count,
                price_per_hour: n.price_per_hour,
                dedicated_address: n.networking.dedicated_ip,
            })
            .collect();

        info!(count = offers.len(), "listed TensorDock inventory");
        Ok(offers)
    }
}

#[async_trait]
impl HostDriver for TensorDockDriver {
    fn provider(&self) -> Provider {
        Provider::TensorDock
    }

    async fn create(&self, req: &CreateRequest) -> Result<CreateOutcome, DriverError> {
        let offer = req.placement.offer.as_ref().ok_or_else(|| DriverError::Provider {
            retryable: false,
            message: "tensordock create requires an inventory node selection".to_string(),
        })?;
        let (vcpu, ram_gib, gpu_count) = tensordock_sizing(&req.tier);
        info!(name = %req.name, offer = %offer.offer_id, tier = %req.tier, "creating TensorDock instance");

        let body = serde_json::json!({
            "hostnode_id": offer.offer_id,
            "name": req.name,
            "vcpu_count": vcpu,
            "ram_gib": ram_gib,
            "gpu_count": gpu_count,
            "image": "ubuntu-22.04",
            "ssh_key": req.ssh_key,
            "tags": req.tags,
        });

        let resp: TensorDockInstanceResponse = self
            .client
            .post(format!("{}/instances", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(DriverError::from_http)?
            .error_for_status()
            .map_err(DriverError::from_http)?
            .json()
            .await
            .map_err(DriverError::from_http)?;

        let mut metadata = HashMap::new();
        metadata.insert("node_city".to_string(), offer.city.clone());
        metadata.insert("node_country".to_string(), offer.country.clone());
        metadata.insert("price_per_hour".to_string(), offer.price_per_hour.to_string());

        info!(handle = %resp.instance.id, "TensorDock instance accepted");
        Ok(CreateOutcome {
            provider_handle: resp.instance.id,
            provider_metadata: metadata,
        })
    }

    async fn describe(&self, handle: &str) -> Result<DriverStatus, DriverError> {
        let resp: TensorDockInstanceResponse = self
            .client
            .get(format!("{}/instances/{handle}", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(DriverError::from_http)?
            .error_for_status()
            .map_err(DriverError::from_http)?
            .json()
            .await
            .map_err(DriverError::from_http)?;

        Ok(DriverStatus {
            provider_state: resp.instance.status,
            address: resp.instance.ip_address,
        })
    }

    async fn start(&self, handle: &str) -> Result<(), DriverError> {
        self.instance_action(handle, "start").await
    }

    async fn stop(&self, handle: &str) -> Result<(), DriverError> {
        self.instance_action(handle, "stop").await
    }

    async fn destroy(&self, handle: &str) -> Result<(), DriverError> {
        let result = self
            .client
            .delete(format!("{}/instances/{handle}", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(DriverError::from_http)?
            .error_for_status();

        match result {
            Ok(_) => {
                info!(handle, "TensorDock instance deleted");
                Ok(())
            }
            Err(e) => match DriverError::from_http(e) {
                // Already gone: destroy is idempotent.
                DriverError::NotFound => Ok(()),
                other => Err(other),
            },
        }
    }

    fn translate(&self, provider_state: &str) -> LifecycleState {
        match provider_state {
            "creating" | "provisioning" | "installing" | "queued" => LifecycleState::Creating,
            "running" => LifecycleState::Running,
            "stopped" | "stopping" | "off" => LifecycleState::Stopped,
            "failed" | "error" => LifecycleState::Failed,
            "destroyed" | "deleted" | "terminated" => LifecycleState::Destroyed,
            _ => LifecycleState::Unknown,
        }
    }

    /// TensorDock images boot bare; push the agent install script to the
    /// bootstrap listener the base image ships on the agent port.
    async fn prepare_environment(
        &self,
        handle: &str,
        address: &str,
        bootstrap: &BootstrapSpec,
    ) -> Result<(), DriverError> {
        debug!(handle, address, "running remote agent install");
        let script = agent_bootstrap_script(
            &bootstrap.manifest_url,
            &bootstrap.vm_token,
            bootstrap.agent_port,
            &bootstrap.app_image,
        );

        self.client
            .post(format!("http://{address}:{}/bootstrap", bootstrap.agent_port))
            .body(script)
            .send()
            .await
            .map_err(DriverError::from_http)?
            .error_for_status()
            .map_err(DriverError::from_http)?;

        info!(handle, address, "remote agent install accepted");
        Ok(())
    }
}

impl TensorDockDriver {
    async fn instance_action(&self, handle: &str, action: &str) -> Result<(), DriverError> {
        self.client
            .post(format!("{}/instances/{handle}/{action}", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(DriverError::from_http)?
            .error_for_status()
            .map_err(DriverError::from_http)?;
        info!(handle, action, "TensorDock instance action accepted");
        Ok(())
    }
}

// ─── TensorDock API types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TensorDockInventoryResponse {
    nodes: Vec<TensorDockNode>,
}

#[derive(Debug, Deserialize)]
struct TensorDockNode {
    id: String,
    location: TensorDockLocation,
    specs: TensorDockSpecs,
    price_per_hour: f64,
    networking: TensorDockNetworking,
}

#[derive(Debug, Deserialize)]
struct TensorDockLocation {
    city: String,
    #[serde(default)]
    region: Option<String>,
    country: String,
}

#[derive(Debug, Deserialize)]
struct TensorDockSpecs {
    vcpu_count: u32,
    ram_gib: u32,
    gpu_count: u32,
}

#[derive(Debug, Deserialize)]
struct TensorDockNetworking {
    #[serde(default)]
    dedicated_ip: bool,
}

#[derive(Debug, Deserialize)]
struct TensorDockInstanceResponse {
    instance: TensorDockInstance,
}

#[derive(Debug, Deserialize)]
struct TensorDockInstance {
    id: String,
    status: String,
    #[serde(default)]
    ip_address: Option<String>,
}

// ─── Fly adapter ─────────────────────────────────────────────────────────────

fn fly_sizing(tier: &GpuTier) -> (u32, u32) {
    // (cpus, memory_mb)
    match tier {
        GpuTier::Low => (4, 8192),
        GpuTier::Mid => (8, 16384),
        GpuTier::High => (16, 32768),
    }
}

/// Bounded rolling buffer for child-process output lines.
pub struct RollingBuffer {
    capacity: usize,
    lines: VecDeque<String>,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, lines: VecDeque::with_capacity(capacity) }
    }

    pub fn push_line(&mut self, line: &str) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn push_output(&mut self, text: &str) {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.push_line(line);
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Last `n` lines joined with newlines.
    pub fn tail(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct FlyDriver {
    binary_path: PathBuf,
    config_path: Option<PathBuf>,
    output: Mutex<RollingBuffer>,
}

impl FlyDriver {
    pub fn new(binary_path: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self {
            binary_path,
            config_path,
            output: Mutex::new(RollingBuffer::new(CLI_BUFFER_LINES)),
        }
    }

    /// Recent tool output, for diagnostics.
    pub fn output_tail(&self, n: usize) -> String {
        self.output.lock().tail(n)
    }

    async fn run(&self, args: &[String]) -> Result<String, DriverError> {
        let mut cmd = Command::new(&self.binary_path);
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        cmd.args(args);
        debug!(tool = %self.binary_path.display(), ?args, "invoking fly tool");

        let output = cmd.output().await.map_err(|e| DriverError::Provider {
            retryable: false,
            message: format!("failed to spawn {}: {e}", self.binary_path.display()),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        {
            let mut buffer = self.output.lock();
            buffer.push_output(&stdout);
            buffer.push_output(&stderr);
        }

        if output.status.success() {
            Ok(stdout)
        } else {
            let message = stderr.trim().to_string();
            warn!(?args, exit = ?output.status.code(), "fly tool failed: {message}");
            if message.to_lowercase().contains("not found") {
                return Err(DriverError::NotFound);
            }
            Err(DriverError::Provider { retryable: false, message })
        }
    }
}

#[derive(Debug, Deserialize)]
struct FlyMachine {
    id: String,
    state: String,
    #[serde(default)]
    private_ip: Option<String>,
}

#[async_trait]
impl HostDriver for FlyDriver {
    fn provider(&self) -> Provider {
        Provider::Fly
    }

    async fn create(&self, req: &CreateRequest) -> Result<CreateOutcome, DriverError> {
        let region = req.placement.region.as_deref().ok_or_else(|| DriverError::Provider {
            retryable: false,
            message: "fly create requires a region code".to_string(),
        })?;
        let (cpus, memory_mb) = fly_sizing(&req.tier);
        info!(name = %req.name, region, tier = %req.tier, "creating Fly machine");

        let args = vec![
            "create".to_string(),
            "--name".to_string(),
            req.name.clone(),
            "--cpu".to_string(),
            cpus.to_string(),
            "--memory".to_string(),
            memory_mb.to_string(),
            "--region".to_string(),
            region.to_string(),
            "--auto-stop-timeout".to_string(),
            req.auto_stop_timeout_secs.to_string(),
            "--image".to_string(),
            req.bootstrap.app_image.clone(),
            "--env".to_string(),
            format!("MANIFEST_URL={}", req.bootstrap.manifest_url),
            "--env".to_string(),
            format!("VM_TOKEN={}", req.bootstrap.vm_token),
            "--json".to_string(),
        ];

        let stdout = self.run(&args).await?;
        let machine: FlyMachine =
            serde_json::from_str(stdout.trim()).map_err(|e| DriverError::Provider {
                retryable: false,
                message: format!("unparseable fly create output: {e}"),
            })?;

        let mut metadata = HashMap::new();
        metadata.insert("region".to_string(), region.to_string());
        metadata.insert("tool_output".to_string(), self.output.lock().tail(20));

        info!(handle = %machine.id, "Fly machine accepted");
        Ok(CreateOutcome { provider_handle: machine.id, provider_metadata: metadata })
    }

    async fn describe(&self, handle: &str) -> Result<DriverStatus, DriverError> {
        let args = vec!["describe".to_string(), handle.to_string(), "--json".to_string()];
        let stdout = self.run(&args).await?;
        let machine: FlyMachine =
            serde_json::from_str(stdout.trim()).map_err(|e| DriverError::Provider {
                retryable: false,
                message: format!("unparseable fly describe output: {e}"),
            })?;
        Ok(DriverStatus { provider_state: machine.state, address: machine.private_ip })
    }

    async fn start(&self, handle: &str) -> Result<(), DriverError> {
        self.run(&["start".to_string(), handle.to_string()]).await.map(|_| ())
    }

    async fn stop(&self, handle: &str) -> Result<(), DriverError> {
        self.run(&["stop".to_string(), handle.to_string()]).await.map(|_| ())
    }

    async fn destroy(&self, handle: &str) -> Result<(), DriverError> {
        match self.run(&["destroy".to_string(), handle.to_string()]).await {
            Ok(_) => Ok(()),
            Err(DriverError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn translate(&self, provider_state: &str) -> LifecycleState {
        match provider_state {
            "created" | "starting" | "launching" | "replacing" => LifecycleState::Creating,
            "started" | "running" => LifecycleState::Running,
            "stopped" | "stopping" | "suspended" => LifecycleState::Stopped,
            "failed" => LifecycleState::Failed,
            "destroyed" | "destroying" => LifecycleState::Destroyed,
            _ => LifecycleState::Unknown,
        }
    }

    // prepare_environment: default no-op. Fly machines boot the agent image
    // directly, so there is no remote install step.
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(HTTP_TOTAL_TIMEOUT_SECS))
        .build()
        .expect("failed to build HTTP client")
}

// ─── Static geodata for the Fly fallback table ───────────────────────────────

/// Published coordinates of Fly regions, used when the location-finder
/// service is unavailable.
pub fn fly_region_table() -> Vec<(&'static str, Coord)> {
    vec![
        ("iad", Coord { lat: 38.9531, lon: -77.4565 }),  // Ashburn
        ("ewr", Coord { lat: 40.6895, lon: -74.1745 }),  // Newark
        ("ord", Coord { lat: 41.9786, lon: -87.9048 }),  // Chicago
        ("dfw", Coord { lat: 32.8998, lon: -97.0403 }),  // Dallas
        ("sjc", Coord { lat: 37.3639, lon: -121.9289 }), // San Jose
        ("lax", Coord { lat: 33.9416, lon: -118.4085 }), // Los Angeles
        ("sea", Coord { lat: 47.4502, lon: -122.3088 }), // Seattle
        ("yyz", Coord { lat: 43.6777, lon: -79.6248 }),  // Toronto
        ("lhr", Coord { lat: 51.4700, lon: -0.4543 }),   // London
        ("ams", Coord { lat: 52.3105, lon: 4.7683 }),    // Amsterdam
        ("fra", Coord { lat: 50.0379, lon: 8.5622 }),    // Frankfurt
        ("cdg", Coord { lat: 49.0097, lon: 2.5479 }),    // Paris
        ("nrt", Coord { lat: 35.7720, lon: 140.3929 }),  // Tokyo
        ("sin", Coord { lat: 1.3644, lon: 103.9915 }),   // Singapore
        ("syd", Coord { lat: -33.9399, lon: 151.1753 }), // Sydney
        ("gru", Coord { lat: -23.4356, lon: -46.4731 }), // São Paulo
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_proto::PlacementSource;

    fn tensordock() -> TensorDockDriver {
        TensorDockDriver::new("https://marketplace.tensordock.com/api/v0", "test-token".to_string())
    }

    fn fly() -> FlyDriver {
        FlyDriver::new(PathBuf::from("/nonexistent/flyctl"), None)
    }

    #[test]
    fn test_tensordock_translation_total() {
        let driver = tensordock();
        assert_eq!(driver.translate("creating"), LifecycleState::Creating);
        assert_eq!(driver.translate("provisioning"), LifecycleState::Creating);
        assert_eq!(driver.translate("running"), LifecycleState::Running);
        assert_eq!(driver.translate("stopped"), LifecycleState::Stopped);
        assert_eq!(driver.translate("error"), LifecycleState::Failed);
        assert_eq!(driver.translate("deleted"), LifecycleState::Destroyed);
        assert_eq!(driver.translate("some-new-vendor-state"), LifecycleState::Unknown);
        assert_eq!(driver.translate(""), LifecycleState::Unknown);
    }

    #[test]
    fn test_fly_translation_total() {
        let driver = fly();
        assert_eq!(driver.translate("created"), LifecycleState::Creating);
        assert_eq!(driver.translate("started"), LifecycleState::Running);
        assert_eq!(driver.translate("suspended"), LifecycleState::Stopped);
        assert_eq!(driver.translate("failed"), LifecycleState::Failed);
        assert_eq!(driver.translate("destroyed"), LifecycleState::Destroyed);
        assert_eq!(driver.translate("warming-up"), LifecycleState::Unknown);
    }

    #[test]
    fn test_sizing_monotonic() {
        let (low_cpu, low_ram, _) = tensordock_sizing(&GpuTier::Low);
        let (high_cpu, high_ram, _) = tensordock_sizing(&GpuTier::High);
        assert!(high_cpu > low_cpu);
        assert!(high_ram > low_ram);

        let (fly_low, _) = fly_sizing(&GpuTier::Low);
        let (fly_high, _) = fly_sizing(&GpuTier::High);
        assert!(fly_high > fly_low);
    }

    #[test]
    fn test_rolling_buffer_bounded() {
        let mut buffer = RollingBuffer::new(3);
        for i in 0..10 {
            buffer.push_line(&format!("line {i}"));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.tail(3), "line 7\nline 8\nline 9");
        assert_eq!(buffer.tail(1), "line 9");
    }

    #[test]
    fn test_rolling_buffer_skips_blank_lines() {
        let mut buffer = RollingBuffer::new(10);
        buffer.push_output("one\n\n  \ntwo\n");
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.tail(10), "one\ntwo");
    }

    #[test]
    fn test_bootstrap_script_contains_key_elements() {
        let script = agent_bootstrap_script(
            "https://api.playgrid.gg/hosts/tok-abc/manifest",
            "tok-abc",
            8702,
            "registry.playgrid.gg/emu/plat-a:12",
        );
        assert!(script.contains("tok-abc"));
        assert!(script.contains("8702"));
        assert!(script.contains("playgrid-agent"));
        assert!(script.contains("systemctl"));
    }

    #[test]
    fn test_fly_region_table_coords_valid() {
        for (code, coord) in fly_region_table() {
            assert!(coord.is_valid(), "region {code} has invalid coord");
            assert_eq!(code.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_wait_ready_zero_wait_times_out_immediately() {
        // Deadline is already reached, so no describe call is issued; a
        // driver pointed at a dead binary would otherwise error differently.
        let driver = fly();
        let result = driver.wait_ready("m-123", Duration::ZERO).await;
        assert!(matches!(result, Err(DriverError::Timeout)));
    }

    #[tokio::test]
    async fn test_fly_spawn_failure_is_not_retryable() {
        let driver = fly();
        let err = driver.start("m-123").await.unwrap_err();
        match err {
            DriverError::Provider { retryable, .. } => assert!(!retryable),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_create_request_shape() {
        let req = CreateRequest {
            name: "pg-u1-abc".to_string(),
            tier: GpuTier::Mid,
            placement: PlacementChoice {
                provider: Provider::Fly,
                region: Some("ewr".to_string()),
                offer: None,
                source: PlacementSource::Local,
                distance_km: Some(12.0),
            },
            ssh_key: None,
            tags: HashMap::new(),
            auto_stop_timeout_secs: 900,
            bootstrap: BootstrapSpec {
                manifest_url: "https://api.playgrid.gg/hosts/tok/manifest".to_string(),
                vm_token: "tok".to_string(),
                agent_port: 8702,
                app_image: "registry.playgrid.gg/emu/plat-a:12".to_string(),
            },
        };
        assert_eq!(req.placement.provider, Provider::Fly);
    }
}
