use std::path::PathBuf;

use clap::Parser;
use spoor_collect::{init_schema, run_acceptor, CollectorState, DEFAULT_PORT};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "spoor-collect",
    about = "Collects trace entries over TCP into a SQLite trace database"
)]
struct Cli {
    /// Trace database file; opened if present, created otherwise.
    /// Env: SPOOR_DB
    #[arg(short = 'o', long = "database")]
    database: Option<PathBuf>,

    /// Ingest port, bound on all interfaces.
    #[arg(short = 'p', long = "port", conflicts_with = "listen")]
    port: Option<u16>,

    /// Full listen address for instrumented processes, when binding to
    /// one interface. Env: SPOOR_LISTEN
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async {
            if let Err(err) = run(cli).await {
                eprintln!("{err}");
                std::process::exit(1);
            }
        });
}

async fn run(cli: Cli) -> Result<(), String> {
    let db_path = cli
        .database
        .or_else(|| std::env::var("SPOOR_DB").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("spoor-trace.db"));
    let listen = cli
        .listen
        .or_else(|| std::env::var("SPOOR_LISTEN").ok())
        .unwrap_or_else(|| format!("0.0.0.0:{}", cli.port.unwrap_or(DEFAULT_PORT)));

    let state = CollectorState::new(db_path.clone());
    init_schema(state.db())
        .map_err(|e| format!("failed to init trace database {}: {e}", db_path.display()))?;

    // A bind failure is the one fatal startup error.
    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| format!("failed to bind ingest listener on {listen}: {e}"))?;
    info!(%listen, db = %db_path.display(), "spoor-collect ingest listener ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let acceptor = tokio::spawn(run_acceptor(listener, state, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("await ctrl-c: {e}"))?;
    info!("shutdown requested, draining connections");
    let _ = shutdown_tx.send(true);

    // The acceptor stops accepting, gives in-flight transactions their
    // grace period, then returns.
    acceptor
        .await
        .map_err(|e| format!("acceptor task failed: {e}"))?;
    Ok(())
}
