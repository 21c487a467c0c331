//! VPN verdict CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use vpn_verdict::store::{self, migrate};
use vpn_verdict::{Config, VerdictStore, VpnGuard};

#[derive(Parser, Debug)]
#[command(name = "vpn-verdict")]
#[command(about = "Decide whether IPs belong to VPNs by aggregating third-party sources")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "vpn-verdict.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a single IP and print the assessment as JSON
    Check {
        ip: String,

        /// Player UUID to record alongside the lookup
        #[arg(long)]
        player: Option<Uuid>,
    },

    /// Copy every table from one storage engine to another
    Migrate {
        /// Source engine name under storage.engines
        #[arg(long)]
        from: String,

        /// Target engine name under storage.engines
        #[arg(long)]
        to: String,

        /// Rows per page
        #[arg(long, default_value_t = 1000)]
        page_size: usize,

        /// Clear the target before copying
        #[arg(long)]
        truncate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    match args.command {
        Some(Command::Check { ip, player }) => check(config, &ip, player).await,
        Some(Command::Migrate {
            from,
            to,
            page_size,
            truncate,
        }) => migrate_engines(&config, &from, &to, page_size, truncate).await,
        None => anyhow::bail!("no command given, see --help"),
    }
}

async fn check(config: Config, ip: &str, player: Option<Uuid>) -> Result<()> {
    let guard = VpnGuard::new(config)?;
    let result = guard.check(ip, player).await;
    guard.shutdown().await;

    let assessment = result?;
    println!("{}", serde_json::to_string_pretty(&assessment)?);
    Ok(())
}

async fn migrate_engines(
    config: &Config,
    from: &str,
    to: &str,
    page_size: usize,
    truncate: bool,
) -> Result<()> {
    if from == to {
        anyhow::bail!("--from and --to must name different engines");
    }

    let engine = |name: &str| {
        config
            .storage
            .engines
            .get(name)
            .with_context(|| format!("storage engine '{}' is not defined", name))
    };
    let source = store::open(from, engine(from)?)?;
    let target = store::open(to, engine(to)?)?;

    let result = migrate(source.as_ref(), target.as_ref(), page_size, truncate).await;
    source.close().await;
    target.close().await;

    let report = result?;
    println!(
        "Migrated {} IPs, {} players and {} verdicts from '{}' to '{}'",
        report.ips, report.players, report.verdicts, from, to
    );
    Ok(())
}
