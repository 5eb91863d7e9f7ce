//! scuttled server - main service loop

use crate::config::Config;
use crate::engine::{Notification, Scuttlebutt};
use crate::kv::{Entry, KvStore};
use crate::session::PeerStream;
use scuttlebutt_net::{pump, Transport, TransportError};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Store error: {0}")]
    Store(#[from] scuttlebutt_core::Error),
    #[error("Config error: {0}")]
    Config(String),
}

/// Server state
pub struct Server {
    config: Config,
    engine: Scuttlebutt<KvStore>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a server and apply the configured initial writes
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let id = config
            .source_id()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let writes = config
            .initial_writes()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let engine = Scuttlebutt::builder(KvStore::new()).id(id).build();
        for (key, value) in writes {
            engine.set(key, value)?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            engine,
            shutdown_tx,
        })
    }

    pub fn engine(&self) -> &Scuttlebutt<KvStore> {
        &self.engine
    }

    /// Bind the configured address and run
    pub async fn run(&self) -> Result<(), ServerError> {
        let transport = Transport::bind(self.config.listen).await?;
        self.serve(transport).await
    }

    /// Run on an already bound transport until shutdown
    pub async fn serve(&self, transport: Transport) -> Result<(), ServerError> {
        info!(
            "Starting scuttled on {} (id: {})",
            transport.local_addr()?,
            self.engine.id()
        );

        for addr in &self.config.peers {
            self.spawn_dial(*addr);
        }

        let stats_handle = self.spawn_stats_task();
        let notify_handle = self.spawn_notification_task();

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = transport.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            self.replicate(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        self.engine.dispose();
        stats_handle.abort();
        notify_handle.abort();

        Ok(())
    }

    /// Run one session over a connection
    fn replicate(&self, stream: TcpStream, addr: SocketAddr) {
        let options = self.config.session_options().with_name(addr.to_string());
        let PeerStream { link, session } = self.engine.create_stream(options);

        tokio::spawn(async move {
            if let Err(e) = pump(stream, link).await {
                warn!("Connection error from {}: {}", addr, e);
            }
            // Connection is gone; the session has nothing left to do
            session.abort();
            debug!("Connection to {} closed", addr);
        });
    }

    fn spawn_dial(&self, addr: SocketAddr) {
        let engine = self.engine.clone();
        let options = self.config.session_options().with_name(addr.to_string());

        tokio::spawn(async move {
            match Transport::connect(addr).await {
                Ok(stream) => {
                    info!("Connected to peer {}", addr);
                    let PeerStream { link, session } = engine.create_stream(options);
                    if let Err(e) = pump(stream, link).await {
                        warn!("Connection error to {}: {}", addr, e);
                    }
                    session.abort();
                }
                Err(e) => warn!("Failed to connect to {}: {}", addr, e),
            }
        });
    }

    /// Spawn periodic stats logging
    fn spawn_stats_task(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.engine.clone();
        let interval_secs = self.config.stats_interval_secs.max(1);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = ServerStats::of(&engine);
                        info!(
                            streams = stats.stream_count,
                            keys = stats.key_count,
                            sources = stats.source_count,
                            "Stats"
                        );
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Spawn logging of engine notifications
    fn spawn_notification_task(&self) -> tokio::task::JoinHandle<()> {
        let mut notifications = self.engine.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.recv() => {
                        match notification {
                            Ok(notification) => log_notification(&notification),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Dropped {} notifications", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats::of(&self.engine)
    }
}

fn log_notification(notification: &Notification<Entry>) {
    match notification {
        Notification::Accepted(update) => {
            debug!(key = %update.payload.0, source = %update.source, "Accepted")
        }
        Notification::UnverifiedData(update) => {
            warn!(source = %update.source, "Unverified update")
        }
        Notification::Error(e) => warn!("Engine error: {}", e),
        Notification::Unstream(remaining) => debug!(remaining, "Session closed"),
        Notification::Dispose => info!("Sessions disposed"),
        Notification::OldData(_) | Notification::Unclone(_) => {}
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub stream_count: usize,
    pub key_count: usize,
    pub source_count: usize,
}

impl ServerStats {
    fn of(engine: &Scuttlebutt<KvStore>) -> Self {
        Self {
            stream_count: engine.streams(),
            key_count: engine.read(KvStore::len),
            source_count: engine.clock().len(),
        }
    }
}
