use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracery_core::{Collaborator, DisabledCollaborator, TraceryConfig};
use tracing_subscriber::{fmt, EnvFilter};

use tracery_server::router::AppState;
use tracery_server::server;
use tracery_server::subsystems::finalize::Pipeline;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "tracery.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match TraceryConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let pool = match tracery_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match tracery_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ SQLite available: {}", v),
            Err(e) => {
                println!("❌ SQLite check failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Tracery DB health check passed");
        return Ok(());
    }

    tracery_core::db::init_schema(&pool).await?;

    let collaborator: Arc<dyn Collaborator> =
        match tracery_core::create_collaborator(&config.collaborator) {
            Ok(c) => Arc::from(c),
            Err(e) => {
                tracing::warn!("Collaborator unavailable, every stage will fall back: {}", e);
                Arc::new(DisabledCollaborator)
            }
        };

    let pipeline = Pipeline::from_config(&config, collaborator);
    let state = AppState::new(pool, pipeline);

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let socket_path = shellexpand::tilde(&config.service.socket_path).into_owned();
    server::run_unix_server(&socket_path, state, tx.subscribe()).await?;

    Ok(())
}
