mod cli;
mod config;
mod summary;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use engine_logging::{engine_error, engine_info, engine_warn, LogDestination};
use harvester_engine::{
    ensure_state_dir, load_proxy_list, stores_in, Orchestrator, ProxyEndpoint, ReqwestExecutor,
};

use crate::cli::Cli;
use crate::config::HarvestConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            engine_error!("{:#}", err);
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = HarvestConfig::load(cli.config.as_deref())?;
    cli.apply_to(&mut config);

    engine_logging::initialize(
        &LogDestination::default(),
        engine_logging::parse_level(&config.log_level),
    );

    let run = config.harvest_run()?;
    ensure_state_dir(&config.state_dir)
        .with_context(|| format!("state directory {:?}", config.state_dir))?;
    let orchestrator = Orchestrator::new(
        run,
        config.units.clone(),
        proxies(&config)?,
        stores_in(&config.state_dir),
        Arc::new(ReqwestExecutor::new(config.fetch.settings())),
    )?;

    if cli.reset {
        orchestrator.reset()?;
        println!("Progress and proxy statistics cleared.");
        return Ok(ExitCode::SUCCESS);
    }
    if cli.status {
        summary::print_status(&orchestrator.status()?);
        return Ok(ExitCode::SUCCESS);
    }
    if orchestrator.selected_units().is_empty() {
        bail!("no units to harvest; list them under `units` in the config file");
    }

    engine_info!(
        "Harvesting {} unit(s) with state in {:?}",
        orchestrator.selected_units().len(),
        config.state_dir
    );
    let outcome = tokio::select! {
        outcome = orchestrator.run() => outcome,
        _ = tokio::signal::ctrl_c() => {
            engine_warn!("Interrupted; in-flight units will be retried on the next run");
            summary::print_report(&orchestrator.report());
            return Ok(ExitCode::from(130));
        }
    };

    match outcome {
        Ok(report) => {
            summary::print_report(&report);
            Ok(if report.failed == 0 && report.remaining == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Err(err) => {
            summary::print_report(&orchestrator.report());
            Err(err.into())
        }
    }
}

/// Proxy file entries followed by inline ones; duplicates collapse.
fn proxies(config: &HarvestConfig) -> anyhow::Result<Vec<ProxyEndpoint>> {
    let mut endpoints = match &config.proxy_file {
        Some(path) => load_proxy_list(path)?,
        None => Vec::new(),
    };
    for line in &config.proxies {
        let endpoint = ProxyEndpoint::parse(line)?;
        if endpoints
            .iter()
            .all(|known| known.identity != endpoint.identity)
        {
            endpoints.push(endpoint);
        }
    }
    Ok(endpoints)
}
