//! Ensemble server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with self-signed certificate (development)
//! ensemble-server --bind 0.0.0.0:4433
//!
//! # Start with TLS certificate (production)
//! ensemble-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem
//! ```

use clap::Parser;
use ensemble_server::{RoomConfig, Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Ensemble room relay server
#[derive(Parser, Debug)]
#[command(name = "ensemble-server")]
#[command(about = "Ensemble property replication relay")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Player cap per room
    #[arg(long, default_value = "16")]
    max_players: usize,

    /// Maximum number of open rooms
    #[arg(long, default_value = "256")]
    max_rooms: usize,

    /// Byte budget of one room's property store
    #[arg(long, default_value = "524288")]
    max_store_bytes: usize,

    /// Byte budget of one player's properties
    #[arg(long, default_value = "16384")]
    max_player_bytes: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Ensemble server starting");
    tracing::info!("Binding to {}", args.bind);

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("No TLS certificate provided - using self-signed certificate");
        tracing::warn!("Clients must skip certificate verification to connect");
    }

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        rooms: RoomConfig {
            max_players: args.max_players,
            max_rooms: args.max_rooms,
            max_store_bytes: args.max_store_bytes,
            max_player_bytes: args.max_player_bytes,
        },
    };

    let server = Server::bind(config)?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
