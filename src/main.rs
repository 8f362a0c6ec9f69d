//! cgtproxy: cgroup-based transparent proxy control plane
//!
//! This is the main entry point for the production daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./cgtproxy
//!
//! # Run with custom configuration
//! sudo ./cgtproxy -c /path/to/config.json
//!
//! # Print the firewall state that would be installed, then exit
//! cgtproxy --dry-run
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use cgtproxy::config::{create_default_config, load_config, Config};
use cgtproxy::error::CgtproxyError;
use cgtproxy::monitor::CgroupMonitor;
use cgtproxy::nft::{NftCliConnector, PolicyCompiler, RecordingConnector};
use cgtproxy::route::{PolicyRouting, RouteManager, RouteMatcher};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Print staged firewall state without touching the kernel
    dry_run: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/cgtproxy/config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut dry_run = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "--dry-run" => {
                    dry_run = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("cgtproxy v{}", cgtproxy::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
            dry_run,
        }
    }
}

fn print_help() {
    println!(
        r#"cgtproxy v{}

Transparent proxy control plane driven by cgroup-v2 membership.

USAGE:
    cgtproxy [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/cgtproxy/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    --dry-run               Print the firewall state that would be installed, then exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    RUST_LOG                Tracing filter directives (overrides log.level)

REQUIREMENTS:
    - Linux with cgroup v2 mounted (unified hierarchy)
    - nftables (the nft binary) and TPROXY kernel support
    - CAP_NET_ADMIN capability (or root)

EXAMPLE:
    # Route everything under /proxied.slice through the listener on :7893
    cgtproxy -g -c /etc/cgtproxy/config.json
    sudo cgtproxy -c /etc/cgtproxy/config.json
"#,
        cgtproxy::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("tokio=warn".parse().expect("static directive"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Render the full install sequence without a kernel
async fn dry_run(config: &Config) -> Result<()> {
    let recorder = RecordingConnector::new();
    let mut compiler = PolicyCompiler::new(
        recorder.clone(),
        &config.cgroup_root,
        config.bypass_prefixes(),
    );
    compiler.connect().await?;
    compiler.install().await?;
    compiler.add_listeners(&config.tproxies).await?;

    for batch in recorder.applied() {
        print!("{}", batch.render());
    }
    Ok(())
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    if args.dry_run {
        return dry_run(&config).await;
    }

    init_logging(&config);

    info!("cgtproxy v{}", cgtproxy::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    if !config.cgroup_root.is_dir() {
        warn!(
            "cgroup root {:?} is not a directory; is cgroup v2 mounted?",
            config.cgroup_root
        );
    }

    // Assemble the pipeline: monitor → events → route manager → kernel
    let (monitor, events) = CgroupMonitor::new(&config.cgroup_root, config.monitor.event_buffer)?;

    let connector = NftCliConnector::new();
    let compiler = PolicyCompiler::new(connector, &config.cgroup_root, config.bypass_prefixes());
    let matcher = RouteMatcher::from_rules(&config.rules)?;

    let mut marks: Vec<u32> = config.tproxies.values().map(|t| t.mark).collect();
    marks.sort_unstable();
    let policy = PolicyRouting::new(config.route_table, marks);

    let mut manager = RouteManager::new(compiler, matcher, policy, config.tproxies.clone(), events);
    manager
        .setup()
        .await
        .map_err(|e| anyhow::anyhow!("Setup failed: {}", CgtproxyError::from(e)))?;

    let (shutdown_tx, _) = broadcast::channel(4);
    let mut monitor_handle = tokio::spawn(monitor.run(shutdown_tx.subscribe()));
    let mut manager_handle = tokio::spawn(manager.run(shutdown_tx.subscribe()));

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let mut monitor_finished = false;
    let mut manager_finished = false;
    let run_result: Result<()> = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
            Ok(())
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
            Ok(())
        }
        result = &mut manager_handle => {
            manager_finished = true;
            task_outcome("Route manager", result)
        }
        result = &mut monitor_handle => {
            monitor_finished = true;
            task_outcome("Cgroup monitor", result)
        }
    };

    // Graceful shutdown: signal both tasks, then wait for teardown
    info!("Shutting down...");
    let _ = shutdown_tx.send(());

    if !monitor_finished {
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut monitor_handle).await;
    }
    if !manager_finished {
        match tokio::time::timeout(Duration::from_secs(10), &mut manager_handle).await {
            Ok(Ok(Err(e))) => warn!("Route manager exited with error: {e}"),
            Ok(Err(e)) => warn!("Route manager task panicked: {e}"),
            Err(_) => warn!("Route manager did not shut down within 10s"),
            Ok(Ok(Ok(()))) => {}
        }
    }

    info!("Shutdown complete");
    run_result
}

/// Classify a finished pipeline task through the aggregate error type:
/// recoverable errors turn into a warning and a clean shutdown, anything
/// else fails the process.
fn task_outcome<E: Into<CgtproxyError>>(
    name: &str,
    result: std::result::Result<std::result::Result<(), E>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            let error: CgtproxyError = e.into();
            if error.is_recoverable() {
                warn!("{name} exited with recoverable error: {error}");
                Ok(())
            } else {
                Err(anyhow::anyhow!("{name} failed: {error}"))
            }
        }
        Err(e) => Err(anyhow::anyhow!("{name} task panicked: {e}")),
    }
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await
}
