use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use k8snetlook::check::{CheckContext, CheckTally, build_plan, run_plan};
use k8snetlook::cli::Args;
use k8snetlook::config::{Config, FileConfig};
use k8snetlook::error::ProbeError;
use k8snetlook::export::{CheckStream, RunReport, export_json};
use k8snetlook::probe::{EchoProber, IcmpProber, detect_default_gateway};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    setup_tracing(args.verbose);

    let file = match args.config {
        Some(ref path) => FileConfig::load(path)?,
        None => FileConfig::load_default()?,
    };
    let config = Config::from_sources(&args, &file, |key| std::env::var(key).ok());

    let gateway = config.gateway.or_else(|| detect_default_gateway(false));

    // Raw ICMP is acquired once; without it the ICMP checks report why
    let icmp: Result<Arc<dyn EchoProber>, ProbeError> =
        IcmpProber::new(config.icmp_timeout).map(|prober| Arc::new(prober) as Arc<dyn EchoProber>);
    if let Err(ref e) = icmp {
        warn!("ICMP checks will fail: {}", e);
    }

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let plan = build_plan(&config, gateway);
    if plan.is_empty() {
        anyhow::bail!(
            "Nothing to check. Give a destination (--dst), API server, or DNS settings; see --help"
        );
    }

    let ctx = CheckContext::new(config, icmp, cancel.clone())
        .context("Failed to set up probes")?
        .with_gateway(gateway);

    info!(checks = plan.len(), "starting run");
    let started_at = Utc::now();
    let mut tally = CheckTally::new();
    // Stream checks as they finish; a dead stdout stops output but not the run
    let mut stream = (!args.json).then(|| CheckStream::new(std::io::stdout()));
    let reports = run_plan(&ctx, &plan, &mut tally, |report| {
        if let Some(stream) = stream.as_mut() {
            stream.write_check(report);
        }
    })
    .await;

    if args.json {
        let mut stdout = std::io::stdout().lock();
        export_json(&RunReport::new(started_at, reports, &tally), &mut stdout)?;
        stdout.flush()?;
    } else if let Some(stream) = stream {
        stream.finish(&tally)?;
    }

    if cancel.is_cancelled() {
        eprintln!("Interrupted after {} of {} checks", tally.executed(), plan.len());
        std::process::exit(130);
    }
    if !tally.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
