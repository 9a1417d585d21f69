//! Capstan CLI
//!

#![deny(missing_docs)]

mod cmd;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use time::OffsetDateTime;

use capstan_core::config::CapstanConfig;
use capstan_core::cycle::{self, CycleDeps, CycleReport};
use capstan_core::errors::CycleError;
use capstan_core::fetch;
use capstan_core::logging::{self, error, info, warn};
use capstan_core::project;
use capstan_core::store::{FsObjectStore, SnapshotStore};
use capstan_core::{fetch_credentials, ObjectStore};
use capstan_okta::OktaConnector;
use capstan_quicksight::QuickSightConnector;

use cmd::{CapstanArgs, CapstanCommand};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CapstanArgs::parse();
    logging::setup(args.log_level);

    match &args.command {
        CapstanCommand::Init {
            project_name,
            overwrite,
        } => init(project_name, *overwrite)?,

        CapstanCommand::Fetch => fetch_snapshot().await?,

        CapstanCommand::Diff => diff().await?,

        CapstanCommand::Apply => apply().await?,

        CapstanCommand::Run { every } => run(every).await?,
    }

    Ok(())
}

fn init(project_name: &Option<String>, overwrite: bool) -> Result<()> {
    let dir = project_name
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let cfg_path = project::capstan_cfg_path(&dir);
    if cfg_path.exists() && !overwrite {
        bail!(
            "{} already exists. Use --overwrite to replace it.",
            cfg_path.display()
        );
    }

    std::fs::create_dir_all(&dir).context("Creating project directory")?;
    let mut config = CapstanConfig::new();
    config.set_name(
        project_name
            .clone()
            .unwrap_or_else(|| "capstan".to_owned()),
    );
    std::fs::write(&cfg_path, config.to_yaml()?).context("Writing capstan.yaml")?;
    std::fs::create_dir_all(dir.join(project::data_dir())).context("Creating data directory")?;

    info!("Created capstan project at {}", dir.display());
    info!("Add your okta and quicksight entries to ~/.capstan/connectors.yaml to get started.");
    Ok(())
}

fn load_config() -> Result<CapstanConfig> {
    CapstanConfig::read_from_file(project::capstan_cfg_path_local())
        .context("Reading capstan config file. Are you in a capstan project directory?")
}

fn snapshot_store() -> SnapshotStore {
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(project::data_dir()));
    SnapshotStore::new(store)
}

fn connectors() -> Result<(OktaConnector, QuickSightConnector)> {
    let creds_path = project::connectors_cfg_path()
        .ok_or_else(|| anyhow!("could not locate a home directory for connector credentials"))?;
    let creds = fetch_credentials(creds_path)?;
    let okta = OktaConnector::new(
        creds
            .get("okta")
            .ok_or_else(|| anyhow!("no okta entry in connectors.yaml"))?,
    )?;
    let quicksight = QuickSightConnector::new(
        creds
            .get("quicksight")
            .ok_or_else(|| anyhow!("no quicksight entry in connectors.yaml"))?,
    )?;
    Ok((okta, quicksight))
}

async fn fetch_snapshot() -> Result<()> {
    let config = load_config()?;
    let store = snapshot_store();
    let (okta, _) = connectors()?;

    let snapshot = fetch::fetch_identity(&okta, &config.identity).await?;
    let now = OffsetDateTime::now_utc().unix_timestamp();
    store.write_identity_snapshot(now, &snapshot).await?;

    info!(
        "fetched {} governed users; snapshot written to the store",
        snapshot.users.len()
    );
    Ok(())
}

async fn diff() -> Result<()> {
    let config = load_config()?;
    let store = snapshot_store();
    let (okta, quicksight) = connectors()?;
    let deps = CycleDeps {
        identity: &okta,
        target: &quicksight,
        store: &store,
    };

    let diffs = cycle::plan(&deps, &config).await?;
    if diffs.is_empty() {
        println!("No changes needed.");
    } else {
        print!("{diffs}");
    }
    for skip in &diffs.skips {
        println!("{} {skip}", "skipped:".yellow());
    }
    Ok(())
}

async fn apply() -> Result<()> {
    let config = load_config()?;
    let store = snapshot_store();
    let (okta, quicksight) = connectors()?;
    let deps = CycleDeps {
        identity: &okta,
        target: &quicksight,
        store: &store,
    };

    let report = cycle::run_cycle(&deps, &config).await?;
    print_report(&report);
    Ok(())
}

async fn run(every: &Option<u64>) -> Result<()> {
    let config = load_config()?;
    let store = snapshot_store();
    let (okta, quicksight) = connectors()?;
    let deps = CycleDeps {
        identity: &okta,
        target: &quicksight,
        store: &store,
    };

    let every = every.unwrap_or(config.cycle.interval_secs);
    info!("reconciling every {every}s; press ctrl-c to stop");
    let mut interval = tokio::time::interval(Duration::from_secs(every));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match cycle::run_cycle(&deps, &config).await {
            Ok(report) => print_report(&report),
            Err(CycleError::InProgress { holder, .. }) => {
                info!("a cycle is already in progress ({holder}); skipping this trigger")
            }
            Err(e) => error!("cycle failed: {e}"),
        }
    }
}

fn print_report(report: &CycleReport) {
    if let Some(reason) = &report.no_op_reason {
        warn!("cycle {} did not reconcile: {reason}", report.cycle_id);
        return;
    }
    let Some(apply) = &report.apply else {
        return;
    };

    println!(
        "cycle {} finished in {}s",
        report.cycle_id,
        report.finished_unix - report.started_unix
    );
    println!(
        "  {}",
        format!("{} succeeded", apply.succeeded.len()).green()
    );
    for failed in &apply.failed {
        println!(
            "  {} {} ({})",
            "failed:".red(),
            failed.op,
            if failed.retryable {
                "will retry next cycle"
            } else {
                "terminal"
            }
        );
        println!("    {}", failed.error);
    }
    for skip in &apply.skips {
        println!("  {} {skip}", "skipped:".yellow());
    }
    if !apply.not_attempted.is_empty() {
        println!(
            "  {}",
            format!(
                "{} not attempted (deadline exceeded)",
                apply.not_attempted.len()
            )
            .yellow()
        );
    }
}
