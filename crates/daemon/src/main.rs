#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Qualification daemon: runs the run controller and the status syncer over
//! an in-memory store seeded from a file.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use qualification_controller::builder::TemplateJobBuilder;
use qualification_controller::resolver::StaticResolver;
use qualification_controller::store::{InMemoryStore, LabelSelector, ObjectStore};
use qualification_controller::{ControllerConfig, Manager};
use qualification_core::model::{ExecutionJob, QualificationRun};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod seed;
mod simulator;

use crate::seed::Seed;

#[derive(Parser, Debug)]
#[command(name = "qualification-daemon", version, about = "Qualification run controllers")]
struct Args {
    /// Namespace whose runs and jobs are reconciled.
    #[arg(long, default_value = "ci")]
    namespace: String,

    /// Concurrent reconciliations per controller.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// YAML file with build configurations and runs to create.
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,

    /// Attempts of a conflicting status write.
    #[arg(long, default_value_t = 5)]
    conflict_retries: u32,

    /// Deadline for a created job to become readable, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    visibility_timeout_ms: u64,

    /// Interval between visibility checks, in milliseconds.
    #[arg(long, default_value_t = 100)]
    visibility_poll_ms: u64,

    /// Full relist period in seconds.
    #[arg(long, default_value_t = 600)]
    resync_secs: u64,

    /// Wait for active jobs of a deleted run instead of aborting them.
    #[arg(long, default_value_t = false)]
    no_abort_on_delete: bool,

    /// Keep a deleted run's jobs once its finalizer is released.
    #[arg(long, default_value_t = false)]
    keep_jobs: bool,

    /// Advance jobs Triggered -> Pending -> Success on a timer.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Simulator tick in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    tick_ms: u64,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    run_for_secs: Option<u64>,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: self.namespace.clone(),
            workers: self.workers,
            conflict_retries: self.conflict_retries,
            visibility_poll_interval: Duration::from_millis(self.visibility_poll_ms),
            visibility_timeout: Duration::from_millis(self.visibility_timeout_ms),
            resync_interval: Duration::from_secs(self.resync_secs),
            abort_on_delete: !self.no_abort_on_delete,
            delete_jobs_on_cleanup: !self.keep_jobs,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.controller_config();
    let seed = match &args.seed {
        Some(path) => Seed::load(path).await?,
        None => Seed::default(),
    };
    tracing::info!(
        configs = seed.configs.len(),
        runs = seed.runs.len(),
        "loaded seed"
    );

    let runs = Arc::new(InMemoryStore::<QualificationRun>::new());
    let jobs = Arc::new(InMemoryStore::<ExecutionJob>::new());
    let manager = Manager::new(
        config.clone(),
        runs.clone(),
        jobs.clone(),
        Arc::new(StaticResolver::new(seed.configs)),
        Arc::new(TemplateJobBuilder::default()),
    )
    .context("invalid controller configuration")?;

    for run in seed.runs {
        let name = run.metadata.name.clone();
        runs.create(run)
            .await
            .with_context(|| format!("creating seeded run {name}"))?;
    }

    let simulator = args.simulate.then(|| {
        simulator::spawn(
            jobs.clone(),
            config.namespace.clone(),
            Duration::from_millis(args.tick_ms),
        )
    });

    tracing::info!(namespace = %config.namespace, "daemon starting");
    manager
        .run(shutdown_signal(args.run_for_secs.map(Duration::from_secs)))
        .await;
    if let Some(task) = simulator {
        task.abort();
    }

    let statuses: Vec<serde_json::Value> = runs
        .list(&config.namespace, &LabelSelector::everything())
        .await?
        .into_iter()
        .map(|run| serde_json::json!({ "name": run.metadata.name, "status": run.status }))
        .collect();
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

async fn shutdown_signal(run_for: Option<Duration>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    match run_for {
        Some(limit) => tokio::select! {
            _ = ctrl_c => {}
            _ = tokio::time::sleep(limit) => {}
        },
        None => ctrl_c.await,
    }
    tracing::info!("shutdown requested");
}
