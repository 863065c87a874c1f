//! Spreadwatch: exchange spread monitor with demo and live market data
//!
//! Usage:
//!   spreadwatch serve --port 3001              Launch the JSON API and dashboard
//!   spreadwatch markets                        Print the ranked spread table once
//!   spreadwatch credentials add ...            Store a credential set

mod api;
mod config;

use anyhow::Context;
use axum::Router;
use clap::{Parser, Subcommand};
use engine::{
    CredentialDraft, CredentialStore, ExchangeHub, MarketQuote, MarketSnapshot, ModeController,
    QuoteSource, ReqwestTransport, WsTransport,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::api::AppState;
use crate::config::AppConfig;

pub(crate) const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "spreadwatch")]
#[command(about = "Exchange spread monitor with demo and live market data", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Keep credentials in memory only (nothing is written to disk)
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the web server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Print the ranked spread table once
    Markets {
        /// Use live data through this stored credential set id
        #[arg(long)]
        live: Option<String>,
    },
    /// List supported exchanges and the credential fields they need
    Exchanges,
    /// Manage stored credential sets
    Credentials {
        #[command(subcommand)]
        action: CredentialCommand,
    },
}

#[derive(Subcommand)]
enum CredentialCommand {
    /// List stored sets (secrets are masked)
    List,
    /// Validate and store a new set
    Add {
        /// Label for the set
        #[arg(long)]
        name: String,
        /// Exchange id, see `spreadwatch exchanges`
        #[arg(long)]
        exchange: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        secret_key: String,
        /// Additional exchange field as NAME=VALUE (repeatable)
        #[arg(long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,
    },
    /// Delete a set by id (unknown ids are ignored)
    Delete { id: String },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,spreadwatch=debug")
    } else {
        EnvFilter::new("info,engine=info,persistence=info,spreadwatch=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let mut config = AppConfig::from_env()?;
    config.ephemeral = cli.ephemeral;

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(&config, &host, port).await?,
        Commands::Markets { live } => cmd_markets(&config, live).await?,
        Commands::Exchanges => cmd_exchanges(&config),
        Commands::Credentials { action } => cmd_credentials(&config, action).await?,
    }

    Ok(())
}

async fn build_hub(config: &AppConfig) -> anyhow::Result<Arc<ExchangeHub>> {
    let backend = config.open_backend().await.map_err(|e| {
        error!("Failed to open credential store: {:#}", e);
        e
    })?;
    let store = Arc::new(CredentialStore::new(backend, Arc::new(config.registry())));

    let request_timeout = config.engine.fetch_timeout.max(config.engine.handshake_timeout);
    let http = ReqwestTransport::new(request_timeout)?;

    Ok(Arc::new(ExchangeHub::new(
        config.engine.clone(),
        store,
        ModeController::new(),
        Arc::new(http),
        Arc::new(WsTransport),
    )))
}

// ============================================================================
// Serve command: Axum web server
// ============================================================================

async fn cmd_serve(config: &AppConfig, host: &str, port: u16) -> anyhow::Result<()> {
    info!("Spreadwatch v{} starting...", APP_VERSION);

    let hub = build_hub(config).await?;
    let poller = Arc::new(hub.poller());
    poller.start();

    let state = AppState {
        hub: hub.clone(),
        poller: poller.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Static dashboard next to the executable, else ./dist
    let exe_path = std::env::current_exe().unwrap_or_default();
    let exe_dir = exe_path.parent().unwrap_or(std::path::Path::new("."));
    let dist_dir = exe_dir.join("dist");
    let static_dir = if dist_dir.exists() {
        dist_dir
    } else {
        std::path::PathBuf::from("dist")
    };

    let app = Router::new()
        .nest("/api", api::routes(state))
        .fallback_service(ServeDir::new(&static_dir))
        .layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    println!("\n=== Spreadwatch v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET    /api/health                   - Health check");
    println!("  GET    /api/exchanges                - Supported exchanges");
    println!("  GET    /api/credentials              - Stored credential sets (masked)");
    println!("  POST   /api/credentials              - Save a credential set");
    println!("  GET    /api/credentials/:id          - One credential set (masked)");
    println!("  DELETE /api/credentials/:id          - Delete a credential set");
    println!("  POST   /api/credentials/:id/connect  - Connection test");
    println!("  GET    /api/connection               - Active connection status");
    println!("  POST   /api/connection/disconnect    - Close the active connection");
    println!("  GET    /api/mode                     - Demo/live mode");
    println!("  POST   /api/mode/toggle              - Toggle demo mode");
    println!("  GET    /api/markets                  - Latest ranked spreads");
    println!("  POST   /api/markets/refresh          - Poll now");
    println!("\n  Credential store: {}", store_label(config));
    println!(
        "  Poll interval: {}s",
        config.engine.poll_interval.as_secs_f64()
    );
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl+C received, shutting down...");
        })
        .await?;

    poller.stop();
    hub.disconnect();
    Ok(())
}

fn store_label(config: &AppConfig) -> String {
    if config.ephemeral {
        "in-memory".to_string()
    } else {
        config.store_path.display().to_string()
    }
}

// ============================================================================
// Markets command: one-shot ranked table
// ============================================================================

async fn cmd_markets(config: &AppConfig, live: Option<String>) -> anyhow::Result<()> {
    let hub = build_hub(config).await?;

    if let Some(id) = live.as_deref() {
        let status = hub
            .connect_credentials(id)
            .await
            .with_context(|| format!("connecting credential set {id}"))?;
        info!(
            exchange = status.exchange_id.as_deref().unwrap_or_default(),
            "Connected, switching to live data"
        );
        hub.mode().toggle_demo_mode();
    }

    let poller = hub.poller();
    let snapshot = poller.refresh().await;
    hub.disconnect();

    if let Some(err) = &snapshot.last_error {
        anyhow::bail!("market fetch failed: {err}");
    }
    print_snapshot(&snapshot);
    Ok(())
}

fn print_snapshot(snapshot: &MarketSnapshot) {
    let source = match &snapshot.source {
        QuoteSource::Synthetic => "demo data".to_string(),
        QuoteSource::Live { exchange_id } => format!("live: {exchange_id}"),
    };
    println!("\nTop {} spreads ({})", snapshot.quotes.len(), source);
    println!(
        "  {:>3}  {:<14} {:>14} {:>14} {:>12} {:>9} {:>16} {:>12}",
        "#", "Symbol", "Bid", "Ask", "Spread", "Spread%", "Volume 24h", "Change 24h"
    );
    println!("  {}", "-".repeat(102));
    for (i, q) in snapshot.quotes.iter().enumerate() {
        print_quote(i + 1, q);
    }
}

fn print_quote(rank: usize, q: &MarketQuote) {
    println!(
        "  {:>3}  {:<14} {:>14} {:>14} {:>12} {:>8}% {:>16} {:>12}",
        rank,
        q.symbol,
        round(q.bid, 6),
        round(q.ask, 6),
        round(q.spread, 6),
        round(q.spread_pct, 4),
        round(q.volume_24h, 2),
        round(q.price_change_24h, 4),
    );
}

fn round(value: Decimal, dp: u32) -> String {
    value.round_dp(dp).normalize().to_string()
}

// ============================================================================
// Exchanges / credentials commands
// ============================================================================

fn cmd_exchanges(config: &AppConfig) {
    let registry = config.registry();
    println!("\nSupported exchanges:");
    for d in registry.list() {
        println!("\n  {} ({})  {}", d.name, d.id, d.description);
        println!("    REST:   {}", d.base_url);
        println!("    Stream: {}", d.ws_url);
        println!("    Features: {}", d.features.join(", "));
        for field in &d.required_fields {
            match &field.description {
                Some(desc) => println!("    - {:<14} {}", field.name, desc),
                None => println!("    - {}", field.name),
            }
        }
    }
}

async fn cmd_credentials(config: &AppConfig, action: CredentialCommand) -> anyhow::Result<()> {
    let hub = build_hub(config).await?;
    let store = hub.store();

    match action {
        CredentialCommand::List => {
            let sets = store.list().await?;
            if sets.is_empty() {
                println!("No credential sets stored.");
                return Ok(());
            }
            println!(
                "  {:<16} {:<20} {:<10} {:<12} {}",
                "ID", "Name", "Exchange", "API key", "Extra fields"
            );
            for s in sets.iter().map(|s| s.summary()) {
                println!(
                    "  {:<16} {:<20} {:<10} {:<12} {}",
                    s.id,
                    s.name,
                    s.exchange_id,
                    s.api_key_hint,
                    s.additional_fields.join(", ")
                );
            }
        }
        CredentialCommand::Add {
            name,
            exchange,
            api_key,
            secret_key,
            fields,
        } => {
            let mut draft = CredentialDraft::new(&name, &exchange, &api_key, &secret_key);
            for raw in &fields {
                let (field, value) = raw
                    .split_once('=')
                    .with_context(|| format!("--field expects NAME=VALUE, got {raw:?}"))?;
                draft = draft.with_field(field.trim(), value);
            }
            let set = store.save(draft).await?;
            println!("Saved credential set {} ({} on {})", set.id, set.name, set.exchange_id);
            if config.ephemeral {
                warn!("--ephemeral is set; the credential set was not persisted");
            }
        }
        CredentialCommand::Delete { id } => {
            hub.delete_credentials(&id).await?;
            println!("Deleted credential set {id} (if it existed)");
        }
    }
    Ok(())
}
