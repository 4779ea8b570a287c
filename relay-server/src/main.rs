use clap::Parser;
use relay_core::{ModelSettings, PgHistoryStore, RelayConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use relay_server::bridge::Bridge;
use relay_server::dispatch;
use relay_server::telegram::TelegramClient;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "relay.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match RelayConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // Connect to DB
    let pool = match relay_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if config.database.run_migrations {
        if let Err(e) = relay_core::db::run_migrations(&pool).await {
            eprintln!("Failed to apply schema: {}", e);
            std::process::exit(1);
        }
    }

    let telegram = TelegramClient::new(
        &config.telegram.token,
        &config.telegram.api_url,
        config.telegram.poll_timeout_seconds,
    )?;

    if args.health {
        match relay_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match telegram.get_me().await {
            Ok(me) => println!("✅ Telegram bot authenticated: @{}", me.username.unwrap_or(me.first_name)),
            Err(e) => {
                println!("❌ Telegram authentication failed: {}", e);
                std::process::exit(1);
            }
        }

        println!("✅ Relay health check passed");
        return Ok(());
    }

    match telegram.get_me().await {
        Ok(me) => tracing::info!(
            bot = %me.username.unwrap_or(me.first_name),
            "Bot successfully authenticated"
        ),
        Err(e) => {
            eprintln!("Failed to authenticate bot: {}", e);
            std::process::exit(1);
        }
    }

    let bridge = Arc::new(Bridge::new(
        Arc::new(PgHistoryStore::new(pool)),
        Arc::new(telegram.clone()),
        ModelSettings::from(&config.model),
        config.bot.clone(),
    )?);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    dispatch::run_dispatcher(telegram.inbound(), bridge, cancel).await;

    Ok(())
}
