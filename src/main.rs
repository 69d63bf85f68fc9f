use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use fabmon::agent::Agent;
use fabmon::config::Config;

const COMMIT: Option<&str> = option_env!("GIT_COMMIT");

/// Fabric performance poller and health scorer.
#[derive(Parser)]
#[command(name = "fabmon", version, about)]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (e.g. "debug" or "fabmon::scheduler=trace"); overrides
    /// `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print build information and exit.
    Version,
    /// Load and validate the configuration, print the effective settings and exit.
    Check,
}

fn build_info() -> String {
    format!(
        "fabmon {} ({}, {}-{})",
        env!("CARGO_PKG_VERSION"),
        COMMIT.unwrap_or("dev"),
        std::env::consts::ARCH,
        std::env::consts::OS,
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Version)) {
        println!("{}", build_info());
        return Ok(());
    }

    let Some(config_path) = cli.config else {
        anyhow::bail!("no configuration given, pass --config <FILE>");
    };
    let cfg = Config::load(&config_path)?;

    if matches!(cli.command, Some(Command::Check)) {
        print_effective(&config_path, &cfg);
        return Ok(());
    }

    init_tracing(cli.log_level.as_deref().unwrap_or(&cfg.log_level))?;
    info!(build = %build_info(), config = %config_path.display(), "fabmon starting");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("fabmon-worker")
        .build()
        .context("creating async runtime")?
        .block_on(run(cfg, &config_path))
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter).with_context(|| format!("bad log filter {filter:?}"))?;
    fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

fn print_effective(path: &Path, cfg: &Config) {
    println!("config:        {}", path.display());
    println!("endpoint:      {}", cfg.fabric.endpoint);
    println!("refresh rate:  {:?}", cfg.refresh_rate);
    println!(
        "pools:         {} recurring, {} background (queue {})",
        cfg.scheduler.recurring_pool_size,
        cfg.scheduler.background_pool_size,
        cfg.scheduler.background_queue_size,
    );
    println!("event window:  {:?}", cfg.events.window);
    println!("groups:        {}", cfg.monitor.groups.join(", "));
    if cfg.persistence.enabled {
        println!(
            "persistence:   {} every {:?}",
            cfg.persistence.path.display(),
            cfg.persistence.throttle,
        );
    } else {
        println!("persistence:   off");
    }
    println!("metrics:       {}", cfg.health.addr);
}

enum Received {
    Stop(&'static str),
    Reload,
}

struct Signals {
    int: Signal,
    term: Signal,
    hup: Signal,
}

impl Signals {
    fn install() -> Result<Self> {
        let listen = |kind: SignalKind, name: &str| {
            signal(kind).with_context(|| format!("installing {name} handler"))
        };
        Ok(Self {
            int: listen(SignalKind::interrupt(), "SIGINT")?,
            term: listen(SignalKind::terminate(), "SIGTERM")?,
            hup: listen(SignalKind::hangup(), "SIGHUP")?,
        })
    }

    async fn next(&mut self) -> Received {
        tokio::select! {
            _ = self.int.recv() => Received::Stop("SIGINT"),
            _ = self.term.recv() => Received::Stop("SIGTERM"),
            _ = self.hup.recv() => Received::Reload,
        }
    }
}

async fn run(cfg: Config, config_path: &Path) -> Result<()> {
    let mut signals = Signals::install()?;

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    loop {
        match signals.next().await {
            Received::Stop(name) => {
                info!(signal = name, "stopping");
                break;
            }
            Received::Reload => {
                info!(path = %config_path.display(), "SIGHUP, reloading configuration");
                let applied = match Config::load(config_path) {
                    Ok(cfg) => agent.reload(cfg).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = applied {
                    error!(error = %e, "reload failed, keeping current settings");
                }
            }
        }
    }

    agent.stop().await?;
    info!("fabmon stopped");
    Ok(())
}
