use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::fmt::time::FormatTime;

use spider::config;
use spider::error::{Result, SpiderError};
use spider::manager::SessionManager;
use spider::probe::LatencyProbe;
use spider::registry::ProxyRegistry;
use spider::scheduler::Scheduler;
use spider::session::SessionContext;
use spider::store::{DataStore, MySqlStore};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "spider", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision namespaces and run the scraping fleet
    Start(ConfigArgs),
    /// Run one proxy latency sweep and exit
    Probe(ConfigArgs),
    /// Tear down namespaces and veth devices left by a previous run
    Cleanup,
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to the spider YAML config
    #[arg(long, env = "SPIDER_CONFIG", default_value = "spider.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Start(args) => run_start(args).await,
        Command::Probe(args) => run_probe(args).await,
        Command::Cleanup => {
            netns_pool::cleanup_host().await;
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_start(args: ConfigArgs) -> Result<()> {
    let config = config::load(&args.config).await?;

    let store: Arc<dyn DataStore> = Arc::new(MySqlStore::connect(&config.database_url).await?);
    store.clear_proxy_usage_flags().await?;
    info!("stale proxy usage flags cleared");

    let netns = Arc::new(netns_pool::NetnsPool::initialize(config.sessions.max_sessions).await?);
    if netns.size() == 0 {
        return Err(SpiderError::Setup(
            "no namespace came up; the spider needs root or CAP_NET_ADMIN".into(),
        ));
    }

    let registry = Arc::new(ProxyRegistry::new(
        Arc::clone(&store),
        config.proxies.strict_delay_filter,
    ));
    let context = Arc::new(SessionContext {
        netns: Arc::clone(&netns),
        registry: Arc::clone(&registry),
        child_command: config.child_command.clone(),
        session_timeout: config.session_timeout(),
    });

    let manager = SessionManager::new(context, config.sessions.max_sessions);
    manager.initialize().await?;

    let supervisor = SessionManager::spawn_supervisor(
        Arc::clone(&manager),
        Duration::from_secs(config.sessions.supervisor_interval_secs),
    );
    let health = SessionManager::spawn_health_check(
        Arc::clone(&manager),
        Duration::from_secs(config.sessions.health_check_interval_secs),
    );

    let probe = Arc::new(LatencyProbe::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        &config.probe,
    ));
    let probe_task = tokio::spawn(probe.run());

    let scheduler = Scheduler::new(store, registry, Arc::clone(&manager), &config);

    tokio::select! {
        () = scheduler.run() => {}
        () = shutdown_signal() => {}
    }

    supervisor.abort();
    health.abort();
    probe_task.abort();
    manager.shutdown().await;
    netns.teardown().await;
    info!("spider stopped");
    Ok(())
}

async fn run_probe(args: ConfigArgs) -> Result<()> {
    let config = config::load(&args.config).await?;
    let store: Arc<dyn DataStore> = Arc::new(MySqlStore::connect(&config.database_url).await?);
    let registry = Arc::new(ProxyRegistry::new(
        Arc::clone(&store),
        config.proxies.strict_delay_filter,
    ));
    let probe = LatencyProbe::new(store, registry, &config.probe);
    probe.sweep().await;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => info!("received SIGTERM, stopping"),
        _ = recv_signal(&mut sigint) => info!("received SIGINT, stopping"),
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
