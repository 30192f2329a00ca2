//! meshwall - directory-driven port allow-lists for iptables
//!
//! Run from cron or a systemd timer as root. Each run fetches the service
//! catalog, works out which access rules apply to this host, and rotates the
//! managed iptables chain of every port whose allow-list changed.
//!
//! # Usage
//!
//! ```bash
//! meshwall                                 # Enforce the configured rules
//! meshwall check                           # Report what a sync would change
//! meshwall list                            # Show installed managed chains
//! meshwall --catalog-file catalog.json -v  # Use a local catalog, debug logs
//! meshwall --config /etc/meshwall.json --hostname db-1
//! ```

use clap::{Parser, Subcommand};
use meshwall::agent::{Agent, Mode, RunReport};
use meshwall::audit::AuditLog;
use meshwall::config::{AgentConfig, load_config};
use meshwall::core::error::{Error, IptablesErrorPattern, Result};
use meshwall::core::filter::ChainStateReader;
use meshwall::core::iptables::IptablesFilter;
use meshwall::directory::{CatalogSource, FileRepository, HttpRepository, ServiceDirectory};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{Level, info, warn};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "meshwall")]
#[command(version = build::PKG_VERSION)]
#[command(about = "Reconcile directory-driven port allow-lists into iptables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (default: ~/.config/meshwall/config.json)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Read the catalog from a JSON file instead of HTTP
    #[arg(long, global = true, value_name = "PATH")]
    catalog_file: Option<PathBuf>,

    /// Catalog endpoint to query
    #[arg(long, global = true, value_name = "URL")]
    catalog_url: Option<String>,

    /// Node name to look up instead of the kernel hostname
    #[arg(long, global = true)]
    hostname: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Enforce the configured rules (default)
    Sync,
    /// Report what a sync would rebuild and purge without touching iptables
    Check,
    /// List installed managed chains and the addresses they permit
    List,
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };

    if let Some(path) = &cli.log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_ansi(false)
                    .with_writer(file)
                    .init();
                return;
            }
            Err(e) => eprintln!("Cannot open log file {}: {e}", path.display()),
        }
    }

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    info!(
        "meshwall {} ({} built {})",
        build::PKG_VERSION,
        build::SHORT_COMMIT,
        build::BUILD_TIME
    );

    // The control loop is strictly sequential
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(&cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn report_error(error: &Error) {
    eprintln!("Error: {error}");

    if let Some(message) = error.filter_message() {
        let translation = IptablesErrorPattern::match_error(message);
        eprintln!("{}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
    }
}

/// Applies command-line overrides on top of the file configuration.
fn apply_overrides(config: &mut AgentConfig, cli: &Cli) {
    if let Some(path) = &cli.catalog_file {
        config.catalog_file = Some(path.clone());
    }
    if let Some(url) = &cli.catalog_url {
        config.catalog_url.clone_from(url);
        config.catalog_file = None;
    }
    if let Some(hostname) = &cli.hostname {
        config.hostname = Some(hostname.clone());
    }
}

fn catalog_source(config: &AgentConfig) -> Result<CatalogSource> {
    Ok(match &config.catalog_file {
        Some(path) => CatalogSource::File(FileRepository::new(path)),
        None => CatalogSource::Http(HttpRepository::new(
            &config.catalog_url,
            Duration::from_secs(config.http_timeout_secs),
        )?),
    })
}

async fn handle_cli(cli: &Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref()).await?;
    apply_overrides(&mut config, cli);
    config.validate()?;

    if !nix::unistd::getuid().is_root() {
        info!("Not running as root, iptables calls will be elevated");
    }

    let filter = IptablesFilter::new(&config.table, &config.hook_chain, config.protocol);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::List => list(&filter).await,
        command => {
            let mode = match command {
                Commands::Check => Mode::Check,
                _ => Mode::Enforce,
            };
            let report = run(&config, filter, mode).await?;
            print_report(&report);
            Ok(())
        }
    }
}

async fn run(config: &AgentConfig, filter: IptablesFilter, mode: Mode) -> Result<RunReport> {
    let hostname = match &config.hostname {
        Some(hostname) => hostname.clone(),
        None => meshwall::utils::local_hostname()?,
    };

    let directory = ServiceDirectory::load(&catalog_source(config)?).await?;

    let mut agent = Agent::new(filter).with_mode(mode);
    if config.audit && mode == Mode::Enforce {
        match AuditLog::new() {
            Ok(audit) => agent = agent.with_audit(audit),
            Err(e) => warn!("Audit log unavailable: {e}"),
        }
    }

    agent.run(&config.rules, &directory, &hostname).await
}

async fn list(filter: &IptablesFilter) -> Result<()> {
    let ports = filter.list_managed_chains().await?;
    if ports.is_empty() {
        println!("No managed chains installed.");
        return Ok(());
    }

    for port in ports {
        let chain = meshwall::core::chain::live_name(port);
        let addresses = filter.current_addresses(&chain).await?;
        println!("{chain} (port {port}): {} permitted", addresses.len());
        for addr in addresses {
            println!("    {addr}");
        }
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let (rebuilt, purged) = match report.mode {
        Mode::Enforce => ("Rebuilt", "Purged"),
        Mode::Check => ("Would rebuild", "Would purge"),
    };
    let ports = |ports: &[u16]| {
        ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };

    println!("Host address: {}", report.local_address);
    println!("{rebuilt}: [{}]", ports(&report.rebuilt));
    println!("Unchanged: [{}]", ports(&report.unchanged));
    println!("{purged}: [{}]", ports(&report.purge.removed));

    for (port, error) in &report.purge.failed {
        println!("✗ Failed to purge port {port}: {error}");
    }
    if let Some(error) = &report.purge_error {
        println!("✗ Purge skipped: {error}");
    }
}
