//! epcd - SGX EPC Usage Accounting Daemon
//!
//! Reads raw enclave lifecycle records from a file, FIFO, or stdin, keeps
//! per-task and per-container EPC totals, and maintains the per-container
//! `blocked` flag.  Also ships the registration side:
//! - `register` / `unregister`: edit the persisted state file; a running
//!   daemon picks the change up on its next registration sync
//! - `hook`: OCI runtime hook reading container state from stdin

use anyhow::{bail, Context, Result};
use epc_core::registration::{cgroup_v2_root, HookState};
use epc_core::{
    init_logging, Aggregator, AggregatorConfig, EventSource, PersistedState, RecordStreamSource,
    Registration,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn print_help() {
    println!("epcd - SGX EPC usage accounting v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  epcd [OPTIONS]");
    println!("  epcd register --state FILE --key KEY --cgroup-id ID --limit QUANTITY");
    println!("  epcd unregister --state FILE --key KEY");
    println!("  epcd hook [--cleanup] --state FILE");
    println!();
    println!("OPTIONS:");
    println!("  -c, --config FILE     JSON aggregator configuration");
    println!("  -e, --events FILE     Raw event record stream (default: stdin)");
    println!("  -s, --snapshot FILE   Persisted state to restore from and save to");
    println!("  -h, --help            Print this help message");
    println!("  -v, --version         Print version information");
    println!();
    println!("DESCRIPTION:");
    println!("  Applies enclave CREATE/DELETE records to per-task and per-container EPC");
    println!("  totals and flags containers whose usage exceeds their configured limit.");
    println!("  Stops on SIGINT/SIGTERM or when the event stream closes.");
    println!();
    println!("  QUANTITY accepts Kubernetes notation, e.g. 64Mi, 1G, 4096.");
}

fn usage_error(msg: &str) -> ! {
    eprintln!("error: {}", msg);
    eprintln!("Run 'epcd --help' for usage information.");
    std::process::exit(1);
}

/// Value following a flag, or a usage error.
fn flag_value(args: &[String], i: &mut usize, flag: &str) -> String {
    *i += 1;
    match args.get(*i) {
        Some(value) => value.clone(),
        None => usage_error(&format!("'{}' requires a value", flag)),
    }
}

#[derive(Debug, Default)]
struct RunOptions {
    config: Option<PathBuf>,
    events: Option<PathBuf>,
    snapshot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("register") => return cmd_register(&args[2..]),
        Some("unregister") => return cmd_unregister(&args[2..]),
        Some("hook") => return cmd_hook(&args[2..]),
        _ => {}
    }

    let mut options = RunOptions::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("epcd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "-c" | "--config" => options.config = Some(flag_value(&args, &mut i, "--config").into()),
            "-e" | "--events" => options.events = Some(flag_value(&args, &mut i, "--events").into()),
            "-s" | "--snapshot" => {
                options.snapshot = Some(flag_value(&args, &mut i, "--snapshot").into())
            }
            arg => usage_error(&format!("unrecognized argument '{}'", arg)),
        }
        i += 1;
    }

    init_logging();
    run_daemon(options).await
}

async fn run_daemon(options: RunOptions) -> Result<()> {
    let mut config = match &options.config {
        Some(path) => AggregatorConfig::from_file(path)?,
        None => AggregatorConfig::default(),
    };
    if options.snapshot.is_some() {
        config.snapshot_path = options.snapshot.clone();
    }
    config.validate()?;

    let aggregator = Aggregator::with_config(config.clone())?;
    if let Some(path) = &config.snapshot_path {
        if let Some(state) = PersistedState::load(path)
            .with_context(|| format!("Failed to load persisted state {}", path.display()))?
        {
            aggregator.restore(&state)?;
        }
    }

    let mut source: Box<dyn EventSource> = match &options.events {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open event stream {}", path.display()))?;
            info!(path = %path.display(), "Reading events from file");
            Box::new(RecordStreamSource::new(file))
        }
        None => {
            info!("Reading events from stdin");
            Box::new(RecordStreamSource::new(tokio::io::stdin()))
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));
    if let Some(path) = &config.snapshot_path {
        tokio::spawn(sync_registrations_loop(
            aggregator.clone(),
            path.clone(),
            config.registration_sync_interval(),
            shutdown.clone(),
        ));
    }

    let result = aggregator.run(source.as_mut(), shutdown.clone()).await;
    shutdown.cancel();

    info!("Metrics: {}", aggregator.metrics().snapshot().summary());
    if let Some(path) = &config.snapshot_path {
        aggregator
            .checkpoint(path)
            .with_context(|| format!("Failed to save persisted state {}", path.display()))?;
    }

    match result {
        Ok(summary) => {
            info!(?summary, "epcd exiting");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "epcd stopped on a fatal error");
            Err(e.into())
        }
    }
}

/// Re-read registrations written by `register`, `unregister`, and `hook`
/// until shutdown.
async fn sync_registrations_loop(
    aggregator: Arc<Aggregator>,
    path: PathBuf,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = aggregator.reload_registrations(&path) {
                    warn!(path = %path.display(), error = %e, "Registration sync failed");
                }
            }
        }
    }
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error = %e, "Cannot install SIGTERM handler");
                None
            }
        };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = async {
            match terminate.as_mut() {
                Some(signal) => { signal.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}

// ── registration subcommands ──────────────────────────────────────────

/// Load persisted state into a fresh aggregator, run `f`, and save back.
fn with_state<F>(state_path: &Path, f: F) -> Result<()>
where
    F: FnOnce(&Aggregator) -> Result<()>,
{
    let aggregator = Aggregator::new();
    if let Some(state) = PersistedState::load(state_path)
        .with_context(|| format!("Failed to load persisted state {}", state_path.display()))?
    {
        aggregator.restore(&state)?;
    }
    f(&aggregator)?;
    aggregator
        .persisted_state()?
        .save(state_path)
        .with_context(|| format!("Failed to save persisted state {}", state_path.display()))?;
    Ok(())
}

fn cmd_register(args: &[String]) -> Result<()> {
    let mut state = None;
    let mut key = None;
    let mut cgroup_id = None;
    let mut limit = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--state" => state = Some(PathBuf::from(flag_value(args, &mut i, "--state"))),
            "--key" => key = Some(flag_value(args, &mut i, "--key")),
            "--cgroup-id" => cgroup_id = Some(flag_value(args, &mut i, "--cgroup-id")),
            "--limit" => limit = Some(flag_value(args, &mut i, "--limit")),
            arg => usage_error(&format!("unrecognized argument '{}'", arg)),
        }
        i += 1;
    }

    let (Some(state), Some(key), Some(cgroup_id), Some(limit)) = (state, key, cgroup_id, limit)
    else {
        usage_error("register requires --state, --key, --cgroup-id and --limit");
    };
    let cgroup_id: u64 = cgroup_id
        .parse()
        .with_context(|| format!("Invalid cgroup id '{}'", cgroup_id))?;
    let registration = Registration {
        container_key: key,
        cgroup_id,
        limit_bytes: epc_core::registration::parse_quantity(&limit)?,
    };

    init_logging();
    with_state(&state, |aggregator| {
        aggregator.register_container(&registration)?;
        Ok(())
    })
}

fn cmd_unregister(args: &[String]) -> Result<()> {
    let mut state = None;
    let mut key = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--state" => state = Some(PathBuf::from(flag_value(args, &mut i, "--state"))),
            "--key" => key = Some(flag_value(args, &mut i, "--key")),
            arg => usage_error(&format!("unrecognized argument '{}'", arg)),
        }
        i += 1;
    }

    let (Some(state), Some(key)) = (state, key) else {
        usage_error("unregister requires --state and --key");
    };

    init_logging();
    with_state(&state, |aggregator| {
        aggregator.unregister_container(&key)?;
        Ok(())
    })
}

fn cmd_hook(args: &[String]) -> Result<()> {
    let mut state = None;
    let mut cleanup = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--cleanup" => cleanup = true,
            "--state" => state = Some(PathBuf::from(flag_value(args, &mut i, "--state"))),
            arg => usage_error(&format!("unrecognized argument '{}'", arg)),
        }
        i += 1;
    }
    let Some(state) = state else {
        usage_error("hook requires --state");
    };

    init_logging();
    let hook = HookState::from_reader(std::io::stdin().lock())
        .context("Failed to read OCI hook state from stdin")?;
    let bundle = hook.bundle_config()?;

    if cleanup {
        let key = bundle.container_key()?;
        return with_state(&state, |aggregator| {
            aggregator.unregister_container(&key)?;
            Ok(())
        });
    }

    let registration = bundle.registration(&cgroup_v2_root())?;
    if registration.limit_bytes == 0 {
        bail!("EPC limit for container {} is zero", registration.container_key);
    }
    with_state(&state, |aggregator| {
        aggregator.register_container(&registration)?;
        Ok(())
    })
}
