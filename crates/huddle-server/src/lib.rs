//! Huddle chat server.
//!
//! Production runtime wiring [`huddle_core`] groups to QUIC clients: Quinn for
//! transport, Tokio for the async runtime.
//!
//! # Components
//!
//! - [`Server`]: accept loop and per-connection tasks
//! - [`QuinnTransport`]: QUIC endpoint with TLS 1.3
//! - [`Connection`]: the [`huddle_core::Session`] of one client
//! - [`Lifetime`]: on-closed hooks run when a client goes away
//! - [`RoomManager`]: chat rooms (`room.join`, `room.message`)
//! - [`TrafficStats`]: inbound/outbound byte counters
//! - [`wire`]: packet framing

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod lifetime;
pub mod room;
mod session;
mod stats;
mod transport;
pub mod wire;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::BytesMut;
pub use error::ServerError;
use huddle_core::{GroupConfig, Session};
use huddle_drivers::DriverRegistry;
pub use lifetime::Lifetime;
pub use room::{RoomError, RoomManager};
pub use session::{Connection, DEFAULT_OUTBOUND_CAPACITY, SessionError};
pub use stats::{DEFAULT_STATS_INTERVAL, TrafficSnapshot, TrafficStats};
pub use transport::{ALPN_PROTOCOL, QuinnConnection, QuinnTransport};
use wire::{HEADER_SIZE, Packet, PacketHeader};

/// Source of connection ids, unique for the life of the process.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// Tuning shared by every room
    pub group: GroupConfig,
    /// Outbound queue depth per connection
    pub outbound_capacity: usize,
    /// Interval between traffic and room-count log lines
    pub stats_interval: Duration,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            group: GroupConfig::default(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

/// State shared by every connection task.
struct Shared {
    rooms: Arc<RoomManager>,
    lifetime: Lifetime,
    stats: Arc<TrafficStats>,
    outbound_capacity: usize,
}

/// Production huddle server.
pub struct Server {
    transport: QuinnTransport,
    shared: Arc<Shared>,
    stats_interval: Duration,
}

impl Server {
    /// Bind a server whose rooms use the drivers installed in `registry`.
    pub fn bind(config: ServerRuntimeConfig, registry: DriverRegistry) -> Result<Self, ServerError> {
        let transport = QuinnTransport::bind(
            &config.bind_address,
            config.cert_path.as_deref(),
            config.key_path.as_deref(),
        )?;

        let rooms = Arc::new(RoomManager::new(registry, config.group));
        let lifetime = Lifetime::new();
        {
            let rooms = Arc::clone(&rooms);
            lifetime.on_closed(move |connection| {
                let rooms = Arc::clone(&rooms);
                async move { rooms.leave(&connection).await }
            });
        }

        let shared = Arc::new(Shared {
            rooms,
            lifetime,
            stats: Arc::new(TrafficStats::default()),
            outbound_capacity: config.outbound_capacity,
        });

        Ok(Self { transport, shared, stats_interval: config.stats_interval })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Room manager serving this server's clients.
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.shared.rooms
    }

    /// Traffic counters.
    pub fn stats(&self) -> &Arc<TrafficStats> {
        &self.shared.stats
    }

    /// Accept connections until the endpoint is closed.
    pub async fn run(&self) -> Result<(), ServerError> {
        tracing::info!(addr = %self.transport.local_addr()?, "server starting");

        let stats_reporter = self.shared.stats.spawn_reporter(self.stats_interval);
        let rooms_reporter = self.shared.rooms.spawn_reporter(self.stats_interval);

        let result = loop {
            match self.transport.accept().await {
                Ok(Some(connection)) => {
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(connection, shared).await {
                            tracing::warn!(error = %e, "connection error");
                        }
                    });
                },
                Ok(None) => break Ok(()),
                Err(e) => tracing::warn!(error = %e, "accept error"),
            }
        };

        stats_reporter.abort();
        rooms_reporter.abort();
        result
    }

    /// Close every room and stop accepting connections.
    pub async fn shutdown(&self) {
        self.shared.rooms.shutdown().await;
        self.transport.close();
        tracing::info!("server shut down");
    }
}

/// Serve one QUIC connection until it closes.
async fn handle_connection(transport: QuinnConnection, shared: Arc<Shared>) -> Result<(), ServerError> {
    let session_id = next_session_id();
    let remote = transport.remote_addr();
    tracing::debug!(session_id, %remote, "new connection");

    let outbound_stream = transport.open_uni().await?;
    let (session, outbound) = Connection::new(session_id, shared.outbound_capacity, Some(transport.clone()));
    let writer = tokio::spawn(Connection::write_outbound(
        session_id,
        outbound,
        outbound_stream,
        Arc::clone(&shared.stats),
    ));

    loop {
        match transport.accept_bi().await {
            Ok((send, recv)) => {
                drop(send);
                let session = Arc::clone(&session);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(&session, recv, &shared).await {
                        tracing::debug!(session_id = session.id(), error = %e, "stream error");
                    }
                });
            },
            Err(e) => {
                tracing::debug!(session_id, error = %e, "connection closed");
                break;
            },
        }
    }

    shared.lifetime.closed(session).await;
    writer.abort();
    Ok(())
}

/// Read packets from one client stream and hand them to the rooms.
async fn handle_stream(
    session: &Arc<Connection>,
    mut recv: quinn::RecvStream,
    shared: &Shared,
) -> Result<(), ServerError> {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        buf.clear();
        buf.resize(HEADER_SIZE, 0);
        if let Err(e) = recv.read_exact(&mut buf[..HEADER_SIZE]).await {
            // Clean end of stream or a reset; either way the stream is done
            tracing::trace!(session_id = session.id(), error = %e, "stream ended");
            return Ok(());
        }

        let header = PacketHeader::parse(&buf)?;
        let body_len = header.body_len();
        buf.resize(HEADER_SIZE + body_len, 0);
        recv.read_exact(&mut buf[HEADER_SIZE..])
            .await
            .map_err(|e| ServerError::Transport(format!("packet body read failed: {e}")))?;

        let packet = Packet::from_parts(header, &buf[HEADER_SIZE..])?;
        shared.stats.record_inbound(packet.encoded_len());

        let route = packet.route.clone();
        if let Err(e) = shared.rooms.handle(session, packet).await {
            tracing::warn!(session_id = session.id(), route = %route, error = %e, "handler failed");
        }
    }
}
