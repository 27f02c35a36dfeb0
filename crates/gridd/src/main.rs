//! gridd — the PlayGrid control-plane daemon.
//!
//! Serves the public session API and the agent callback API, and runs the
//! health supervisor that enforces idle, liveness, and spend invariants.

mod api;

use anyhow::Context;
use api::AppState;
use clap::{Parser, Subcommand};
use grid_config::GridConfig;
use grid_geo::Geocoder;
use grid_orchestrator::{Orchestrator, OrchestratorSettings, StateTransitioner};
use grid_persist::{HostStore, ProfileStore};
use grid_placement::{Optimizer, RegionFinder};
use grid_providers::{FlyDriver, HostDriver, TensorDockDriver};
use grid_proto::Provider;
use grid_supervisor::{Supervisor, SupervisorSettings};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "gridd")]
#[command(about = "PlayGrid control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane (API server + supervisor)
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/playgrid/config.json")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/playgrid/config.json")]
        output: PathBuf,
    },

    /// Validate a config file and exit
    CheckConfig {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/playgrid/config.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("gridd=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::InitConfig { output } => init_config(output),
        Commands::CheckConfig { config } => check_config(config),
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting gridd");
    let config = GridConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Stores
    let state_path = &config.persistence.state_path;
    let hosts = Arc::new(HostStore::open(state_path, &config.persistence.hosts_collection));
    let profiles = Arc::new(ProfileStore::open(
        state_path,
        &config.persistence.platforms_collection,
    ));

    // Provider drivers
    let mut drivers: HashMap<Provider, Arc<dyn HostDriver>> = HashMap::new();
    let tensordock = if config.providers.tensordock.enabled {
        let driver = Arc::new(TensorDockDriver::new(
            &config.providers.tensordock.base_url,
            config.providers.tensordock.api_token.clone(),
        ));
        drivers.insert(Provider::TensorDock, driver.clone());
        info!("tensordock driver registered");
        Some(driver)
    } else {
        None
    };
    if config.providers.fly.enabled {
        let driver = Arc::new(FlyDriver::new(
            config.providers.fly.binary_path.clone(),
            config.providers.fly.config_path.clone(),
        ));
        drivers.insert(Provider::Fly, driver);
        info!("fly driver registered");
    }

    // Placement
    let geocoder = Arc::new(Geocoder::new(&config.external.gazetteer_url));
    let finder = RegionFinder::new(
        &config.external.location_finder_url,
        &config.external.location_finder_project,
    );
    let optimizer = Arc::new(Optimizer::new(geocoder, tensordock, finder));

    // Billing
    let rates = Arc::new(
        grid_billing::RateTable::load(&config.billing.rate_table_path)
            .with_context(|| format!("loading {}", config.billing.rate_table_path.display()))?,
    );

    // Orchestrator
    let public_base_url = config
        .api
        .public_base_url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", config.api.bind_addr, config.api.port));
    let client_cert_pem = match &config.api.client_cert_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => String::new(),
    };
    let settings = OrchestratorSettings {
        max_inflight_provisions: config.orchestrator.max_inflight_provisions,
        auto_stop_timeout_secs: config.orchestrator.auto_stop_timeout_secs,
        public_base_url,
        client_cert_pem,
        ready_ceiling_low_secs: config.supervisor.ready_ceiling_secs.low,
        ready_ceiling_mid_secs: config.supervisor.ready_ceiling_secs.mid,
        ready_ceiling_high_secs: config.supervisor.ready_ceiling_secs.high,
    };
    let orchestrator = Orchestrator::new(
        hosts.clone(),
        profiles.clone(),
        drivers,
        optimizer,
        rates.clone(),
        settings,
    );

    // Supervisor
    let supervisor_settings = SupervisorSettings {
        liveness_interval: Duration::from_secs(config.supervisor.liveness_interval_secs),
        liveness_jitter_pct: config.supervisor.liveness_jitter_pct,
        idle_threshold: Duration::from_secs(config.supervisor.idle_threshold_secs),
        stopped_ttl: Duration::from_secs(config.supervisor.stopped_ttl_secs),
        long_stopped_interval: Duration::from_secs(config.supervisor.long_stopped_interval_secs),
        probe_timeout: Duration::from_secs(config.supervisor.probe_timeout_secs),
        monthly_soft_cap_usd: config.supervisor.monthly_soft_cap_usd,
        monthly_hard_cap_usd: config.supervisor.monthly_hard_cap_usd,
        max_session_hours_low: config.supervisor.max_session_hours.low,
        max_session_hours_mid: config.supervisor.max_session_hours.mid,
        max_session_hours_high: config.supervisor.max_session_hours.high,
    };
    let transitioner: Arc<dyn StateTransitioner> = Arc::new(orchestrator.clone());
    let supervisor = Arc::new(Supervisor::new(
        hosts,
        profiles,
        rates,
        transitioner,
        supervisor_settings,
    ));
    tokio::spawn(supervisor.run());

    // API server
    let state = Arc::new(AppState { orchestrator });
    let router = api::build_router(state, &config.api.cors_origins);
    let addr = format!("{}:{}", config.api.bind_addr, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "API listening");

    axum::serve(listener, router).await.context("API server exited")?;
    Ok(())
}

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    let config = GridConfig::default();
    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Set the TensorDock API token (file or PLAYGRID_TENSORDOCK_TOKEN),");
    println!("point billing.rate_table_path at your rate file, then run:");
    println!("  gridd run --config {}", output.display());
    Ok(())
}

fn check_config(config_path: PathBuf) -> anyhow::Result<()> {
    match GridConfig::load(&config_path) {
        Ok(config) => {
            println!("Config OK: {}", config_path.display());
            println!("  state path:   {}", config.persistence.state_path.display());
            println!(
                "  providers:    tensordock={} fly={}",
                config.providers.tensordock.enabled, config.providers.fly.enabled
            );
            println!(
                "  api:          {}:{}",
                config.api.bind_addr, config.api.port
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Config invalid: {e}");
            std::process::exit(1);
        }
    }
}
