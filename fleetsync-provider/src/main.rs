//! fleetsync: plan and apply device configuration policies.
//!
//! `plan` diffs two assignment files offline. `simulate` applies a manifest
//! against the in-memory eventually consistent API, which is how the
//! convergence behavior is exercised without a tenant.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fleetsync_core::{OpContext, diff_relationships};
use fleetsync_provider::clients::SimulatedFleetApi;
use fleetsync_provider::model::Assignment;
use fleetsync_provider::{Manifest, PolicyResource, ProviderConfig, apply_manifest};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// fleetsync policy convergence tool
#[derive(Parser, Debug)]
#[command(name = "fleetsync", version, about)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the assignment operations that turn OBSERVED into DESIRED
    Plan {
        /// JSON array of desired assignments
        #[arg(long)]
        desired: PathBuf,

        /// JSON array of assignments currently on the policy
        #[arg(long)]
        observed: PathBuf,
    },

    /// Apply a manifest against the simulated fleet API
    Simulate {
        /// JSON manifest of desired policies
        #[arg(long)]
        manifest: PathBuf,

        /// Provider configuration (TOML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Reads a write stays invisible for
        #[arg(long, default_value = "2")]
        visibility_lag: u32,

        /// Latency of every simulated call in milliseconds
        #[arg(long, default_value = "0")]
        latency_ms: u64,

        /// Delete every policy again after applying it
        #[arg(long)]
        teardown: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fleetsync=info,fleetsync_core=info,fleetsync_provider=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Plan { desired, observed } => plan(&desired, &observed),
        Commands::Simulate {
            manifest,
            config,
            visibility_lag,
            latency_ms,
            teardown,
        } => {
            simulate(
                &manifest,
                config.as_deref(),
                visibility_lag,
                Duration::from_millis(latency_ms),
                teardown,
            )
            .await
        }
    }
}

fn read_assignments(path: &Path) -> Result<Vec<Assignment>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn plan(desired: &Path, observed: &Path) -> Result<()> {
    let plan = diff_relationships(read_assignments(desired)?, read_assignments(observed)?);
    for target in &plan.duplicate_keys {
        warn!("Desired assignments list {} more than once", target);
    }
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn simulate(
    manifest_path: &Path,
    config_path: Option<&Path>,
    visibility_lag: u32,
    latency: Duration,
    teardown: bool,
) -> Result<()> {
    let config = match config_path {
        Some(path) => ProviderConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ProviderConfig::from_env().context("invalid FLEETSYNC_* environment")?,
    };
    let manifest = Manifest::load(manifest_path)?;

    info!(
        "Simulating {} policies (visibility lag {}, latency {:?})",
        manifest.policies.len(),
        visibility_lag,
        latency
    );

    let api = Arc::new(
        SimulatedFleetApi::new()
            .with_visibility_lag(visibility_lag)
            .with_latency(latency),
    );
    let resource = PolicyResource::new(api.clone(), config);

    let token = CancellationToken::new();
    let ctx = OpContext::background().with_cancellation(token.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight operations");
            token.cancel();
        }
    });

    let outcomes = apply_manifest(&resource, &ctx, &manifest, teardown).await;
    println!("{}", serde_json::to_string_pretty(&outcomes)?);

    info!(
        "Remote now holds {} policies (peak concurrent calls {})",
        api.policy_count().await,
        api.peak_in_flight().await
    );

    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    if failed > 0 {
        bail!("{failed} of {} policies failed to converge", outcomes.len());
    }
    Ok(())
}
