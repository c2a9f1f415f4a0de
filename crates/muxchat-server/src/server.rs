//! TCP listener and top-level server wiring.
//!
//! This module:
//! - Listens on the configured address/port.
//! - Accepts new TCP connections and wraps them in a `TcpTransport`.
//! - Reads the client key (the first message on a connection).
//! - Puts the client online, runs its dispatch loop, and takes it offline
//!   when the loop ends.
//! - Runs the registry's capacity supervisor for the server's lifetime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::handlers;
use crate::registry::ConnectionRegistry;
use crate::transport::{Connection, TcpTransport, Transport};

/// Longest accepted client key.
pub const MAX_KEY_LEN: usize = 256;

/// Time a new connection gets to announce its key.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Server {
    config: Config,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_online));
        let mut dispatcher = Dispatcher::new(registry, config.max_payload_bytes);
        handlers::register_builtin(&mut dispatcher);
        dispatcher.set_error_handler(|err| warn!(error = %err, "connection closed on error"));

        Server {
            config,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.dispatcher.registry()
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.config.socket_addr_string();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot listen on {}", addr))?;
        info!(addr = %addr, "listening");
        Ok(listener)
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let supervisor = self.registry().supervise(self.config.supervise_interval());

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        // Usually fd exhaustion; keep serving the clients we have.
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            debug!(peer = %peer_addr, "accepted connection");

            let transport = TcpTransport::new(
                stream,
                self.config.max_payload_bytes,
                self.config.read_deadline(),
            )
            .with_write_deadline(self.config.write_deadline());
            let conn: Connection = Arc::new(transport);
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                handle_connection(dispatcher, conn).await;
            });
        }

        supervisor.stop().await;
        info!("server stopped accepting connections");
        Ok(())
    }
}

/// Read the client key announced as the first message.
pub async fn read_client_key(conn: &dyn Transport) -> anyhow::Result<String> {
    let raw = match tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.receive()).await {
        Ok(received) => received?,
        Err(_) => bail!("no client key within {:?}", HANDSHAKE_TIMEOUT),
    };
    let Some(raw) = raw else {
        bail!("connection closed before sending a client key");
    };
    if raw.is_empty() || raw.len() > MAX_KEY_LEN {
        bail!("client key must be 1..={} bytes, got {}", MAX_KEY_LEN, raw.len());
    }
    let key = std::str::from_utf8(&raw).context("client key is not UTF-8")?;
    Ok(key.to_string())
}

async fn handle_connection(dispatcher: Arc<Dispatcher>, conn: Connection) {
    let peer = conn.peer();
    let key = match read_client_key(&*conn).await {
        Ok(key) => key,
        Err(e) => {
            warn!(peer = %peer, error = %e, "handshake failed");
            conn.close().await;
            return;
        }
    };

    let registry = dispatcher.registry();
    if registry.is_full() {
        warn!(key = %key, max = registry.max_online(), "registry reports full");
    }
    if dispatcher.online(key.clone(), conn.clone()).await {
        info!(key = %key, peer = %peer, "client online");
    } else {
        warn!(key = %key, peer = %peer, "already online; new connection is not registered");
    }

    let exit = dispatcher.serve(conn.clone()).await;
    registry.remove_if_same(&key, &conn).await;
    info!(key = %key, exit = ?exit, "client offline");
}

/// Run the server with the given configuration until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let server = Server::new(config);
    let listener = server.bind().await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, shutting down");
            }
            shutdown.cancel();
        });
    }

    server.serve(listener, shutdown).await
}
