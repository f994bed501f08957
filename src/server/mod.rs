//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and runs each one as a [`connection`] state
//! machine on its own task. The server owns every live connection: they are
//! tracked in a registry while they run and aborted when the server shuts
//! down, so no connection outlives the server.

pub mod connection;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::context::Context;
use crate::router::{HandlerResult, Router};

use self::connection::Connection;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Live connections keyed by a per-server id.
#[derive(Debug, Default)]
struct Registry {
    next_id: AtomicU64,
    peers: Mutex<HashMap<u64, SocketAddr>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, SocketAddr>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(self: &Arc<Self>, peer: SocketAddr) -> RegistryGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, peer);
        RegistryGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Removes its connection from the registry when the connection task ends
/// or is aborted.
struct RegistryGuard {
    registry: Arc<Registry>,
    id: u64,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

/// The embhttp HTTP server.
///
/// Binds to a TCP address, holds the route table and runs every accepted
/// connection until it closes, times out or the server shuts down.
///
/// # Examples
///
/// ```rust,no_run
/// use embhttp::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut server = Server::bind("127.0.0.1:8080").await?;
///     server.register("/hello", |ctx| {
///         ctx.respond(200, "text/plain", b"Hello!")?;
///         Ok(())
///     });
///     server.run().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
    config: ServerConfig,
    registry: Arc<Registry>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Binds the server to the given TCP address with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        Self::bind_with_config(addr, ServerConfig::default()).await
    }

    /// Binds the server to `addr` using `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] for an unusable configuration and
    /// [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind_with_config(
        addr: impl AsRef<str>,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            local_addr,
            router: Router::new(),
            config,
            registry: Arc::new(Registry::default()),
            shutdown: Arc::new(shutdown),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registers `handler` for `path`. See [`Router::register`].
    pub fn register<H>(&mut self, path: impl Into<String>, handler: H) -> &mut Self
    where
        H: Fn(&mut Context<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.router.register(path, handler);
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Returns a handle for observing and stopping the running server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
            registry: Arc::clone(&self.registry),
            local_addr: self.local_addr,
        }
    }

    /// Accepts connections until [`ServerHandle::shutdown`] is called.
    ///
    /// Each connection runs on its own Tokio task. Failed accepts are logged
    /// and serving continues. On shutdown the listener is closed, every live
    /// connection is aborted and awaited, and the route table is dropped.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok(())` once shut down; the signature leaves
    /// room for fatal listener errors.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self {
            listener,
            local_addr,
            router,
            config,
            registry,
            shutdown,
        } = self;

        let router = Arc::new(router);
        let mut stop = shutdown.subscribe();
        let mut tasks = JoinSet::new();

        info!(address = %local_addr, routes = router.len(), "embhttp listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        debug!(peer = %peer, "connection accepted");

                        let guard = registry.track(peer);
                        let conn = Connection::new(stream, peer, Arc::clone(&router), &config);
                        tasks.spawn(async move {
                            let _guard = guard;
                            if let Err(e) = conn.run().await {
                                warn!(peer = %peer, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => match accept_backoff(&e) {
                        None => debug!(error = %e, "transient accept failure"),
                        Some(pause) => {
                            error!(error = %e, backoff = ?pause, "failed to accept connection");
                            tokio::time::sleep(pause).await;
                        }
                    },
                },
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "connection task panicked");
                        }
                    }
                }
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            }
        }

        drop(listener);
        let live = registry.len();
        tasks.shutdown().await;
        drop(router);
        info!(address = %local_addr, aborted = live, "embhttp stopped");
        Ok(())
    }
}

/// Pause after a failed accept before polling the listener again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// Transient failures are retried at once. Anything else (descriptor
// exhaustion, mostly) leaves the listener readable, so back off instead of
// spinning on it.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

/// Cloneable handle to a [`Server`] that has been moved into [`Server::run`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: Arc<watch::Sender<bool>>,
    registry: Arc<Registry>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Stops the server: no more accepts, every live connection is destroyed.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Number of connections currently alive.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Peer addresses of the live connections, in no particular order.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.registry.lock().values().copied().collect()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
