//! Huddle server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with self-signed certificate (development)
//! huddle-server --bind 0.0.0.0:4433
//!
//! # Persist room messages and require identity tokens on join
//! huddle-server --document-store redb://huddle.redb --identity-credentials identity.toml
//! ```

use std::time::Duration;

use clap::Parser;
use huddle_core::{Codec, DriverKind, DriverRef, DriverRegistry, GroupConfig};
use huddle_server::{Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Huddle chat server
#[derive(Parser, Debug)]
#[command(name = "huddle-server")]
#[command(about = "Session-group chat server")]
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

    /// Per-session push timeout in milliseconds (0 disables it)
    #[arg(long, default_value = "5000")]
    push_timeout_ms: u64,

    /// Outbound queue depth per connection
    #[arg(long, default_value = "256")]
    outbound_capacity: usize,

    /// Seconds between traffic and room-count log lines
    #[arg(long, default_value = "60")]
    stats_interval_secs: u64,

    /// Encode pushes as CBOR instead of JSON
    #[arg(long)]
    cbor: bool,

    /// Document store URI for message persistence
    #[arg(long)]
    document_store: Option<String>,

    /// Identity provider credentials file; joins require a token when set
    #[arg(long)]
    identity_credentials: Option<String>,

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

    tracing::info!("huddle server starting");

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("No TLS certificate provided - using self-signed certificate");
    }

    let registry = DriverRegistry::new();
    if let Some(uri) = &args.document_store {
        registry.install(DriverRef::connect(DriverKind::DocumentStore, uri).await?);
    }
    if let Some(path) = &args.identity_credentials {
        registry.install(DriverRef::connect(DriverKind::IdentityProvider, path).await?);
    }

    let push_timeout = (args.push_timeout_ms > 0).then(|| Duration::from_millis(args.push_timeout_ms));
    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        group: GroupConfig { codec: if args.cbor { Codec::Cbor } else { Codec::Json }, push_timeout },
        outbound_capacity: args.outbound_capacity,
        stats_interval: Duration::from_secs(args.stats_interval_secs.max(1)),
    };

    let server = Server::bind(config, registry.clone())?;
    tracing::info!(addr = %server.local_addr()?, "server listening");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
    }

    server.shutdown().await;
    registry.shutdown();

    Ok(())
}
