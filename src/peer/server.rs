//! Accepting side: one listener, many peers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Server                    │
//! │           (single port)                 │
//! │  ┌─────────────────────────────────┐    │
//! │  │ ConnectionId=a → Peer (loop a)  │    │
//! │  │ ConnectionId=b → Peer (loop b)  │    │
//! │  │ ConnectionId=c → Peer (loop c)  │    │
//! │  └─────────────────────────────────┘    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! All peers share one [`Router`]. A peer is dropped from the registry as
//! soon as its connection closes.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::context::ConnectionContext;
use crate::error::Result;
use crate::identifiers::ConnectionId;
use crate::options::PeerOptions;
use crate::router::Router;
use crate::transport::{AcceptedRequest, WsTransport};

use super::core::Peer;

// ============================================================================
// Constants
// ============================================================================

/// Default bind address (localhost).
pub const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// How often the accept loop checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Server
// ============================================================================

/// WebSocket server that spawns a [`Peer`] per connection.
///
/// # Example
///
/// ```ignore
/// let server = Server::bind(DEFAULT_BIND_IP, 0, Arc::new(router), PeerOptions::new()).await?;
/// println!("listening on {}", server.ws_url());
///
/// for peer in server.peers() {
///     peer.event("announcement", json!({ "text": "hello" }));
/// }
///
/// server.shutdown().await;
/// ```
pub struct Server {
    /// Bound address.
    local_addr: SocketAddr,

    /// Router shared by all peers.
    router: Arc<Router>,

    /// Options applied to every peer.
    options: PeerOptions,

    /// Live peers.
    peers: RwLock<FxHashMap<ConnectionId, Peer>>,

    /// Shutdown flag.
    shutdown: AtomicBool,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Server - Constructor
// ============================================================================

impl Server {
    /// Binds `ip:port` (port `0` picks a free one) and starts accepting.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`](crate::Error::Config) if `options` are invalid
    /// - [`Error::Io`](crate::Error::Io) if binding fails
    pub async fn bind(ip: IpAddr, port: u16, router: Arc<Router>, options: PeerOptions) -> Result<Arc<Self>> {
        options.validate()?;

        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;

        let server = Arc::new(Self {
            local_addr,
            router,
            options,
            peers: RwLock::new(FxHashMap::default()),
            shutdown: AtomicBool::new(false),
        });

        let accepting = Arc::clone(&server);
        tokio::spawn(async move {
            accepting.accept_loop(listener).await;
        });

        info!(addr = %local_addr, routes = server.router.len(), "Server started");

        Ok(server)
    }
}

// ============================================================================
// Server - Public API
// ============================================================================

impl Server {
    /// Returns the URL clients connect to.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the number of live connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Returns the peer for `id`, if still connected.
    #[must_use]
    pub fn peer(&self, id: ConnectionId) -> Option<Peer> {
        self.peers.read().get(&id).cloned()
    }

    /// Returns handles to every live peer.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }
}

// ============================================================================
// Server - Lifecycle
// ============================================================================

impl Server {
    /// Forgets a peer and closes it.
    pub fn remove(&self, id: ConnectionId) {
        let removed = self.peers.write().remove(&id);

        if let Some(peer) = removed {
            peer.close();
            debug!(conn = %id, "Peer removed");
        }
    }

    /// Stops accepting and closes every connection.
    pub async fn shutdown(&self) {
        info!("Server shutting down");

        self.shutdown.store(true, Ordering::SeqCst);

        let peers: Vec<_> = {
            let mut map = self.peers.write();
            map.drain().map(|(_, peer)| peer).collect()
        };

        for peer in &peers {
            peer.close();
        }

        for peer in &peers {
            if timeout(Duration::from_secs(5), peer.closed()).await.is_err() {
                warn!(conn = %peer.id(), "Peer did not close in time");
            }
        }

        info!(closed = peers.len(), "Server shutdown complete");
    }
}

// ============================================================================
// Server - Accept Loop
// ============================================================================

impl Server {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("Accept loop shutting down");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            warn!(error = %e, %addr, "Connection handling failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(%addr, "New TCP connection");

        let (transport, events, accepted) = WsTransport::accept(stream).await?;
        let context = self.context_for(&accepted, addr);
        let id = context.id;

        let peer = Peer::spawn(
            transport,
            events,
            Arc::clone(&self.router),
            context,
            self.options.clone(),
        );

        if self.shutdown.load(Ordering::SeqCst) {
            peer.close();
            return Ok(());
        }

        self.peers.write().insert(id, peer.clone());
        info!(conn = %id, %addr, path = %accepted.path, "Peer connected");

        // Deregister once closed; Weak so the watcher does not keep us alive.
        let registry = Arc::downgrade(&self);
        tokio::spawn(async move {
            peer.closed().await;
            forget(&registry, id);
        });

        Ok(())
    }

    fn context_for(&self, accepted: &AcceptedRequest, addr: SocketAddr) -> ConnectionContext {
        let host = accepted
            .host
            .as_deref()
            .and_then(|h| Url::parse(&format!("ws://{h}")).ok())
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.local_addr.ip().to_string());

        ConnectionContext::new("ws", host, self.local_addr.port(), accepted.path.clone())
            .with_headers(accepted.headers.clone())
            .with_remote_address(addr)
    }
}

fn forget(registry: &Weak<Server>, id: ConnectionId) {
    if let Some(server) = registry.upgrade()
        && server.peers.write().remove(&id).is_some()
    {
        debug!(conn = %id, "Closed peer deregistered");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{Value, json};

    use crate::error::Error;
    use crate::protocol::now_ms;
    use crate::router::{Handlers, handler};
    use crate::transport::ConnectionState;

    const WAIT: Duration = Duration::from_secs(5);

    fn server_router() -> Arc<Router> {
        let handlers = Handlers::new()
            .with(
                "getProfile",
                handler(|_ctx, call| async move {
                    let id = call.data["id"].as_i64().unwrap_or_default();
                    if id == 0 {
                        return Err(Error::handler("NO_PROFILE", "profile 0 does not exist"));
                    }
                    Ok(json!({"id": id, "name": "ada"}))
                }),
            )
            .with(
                "whoami",
                handler(|ctx, _call| async move {
                    Ok::<_, Error>(json!({
                        "peer": ctx.peer_info.as_ref().clone(),
                        "path": ctx.path.clone(),
                        "agent": ctx.header("sec-websocket-version"),
                    }))
                }),
            );

        let mut router = Router::new();
        router.register("getProfile", &handlers, "user").expect("register");
        router.register("whoami", &handlers, "user").expect("register");
        Arc::new(router)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition in time");
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::bind(DEFAULT_BIND_IP, 0, Arc::new(Router::new()), PeerOptions::new())
            .await
            .expect("bind");
        assert!(server.port() > 0);
        assert_eq!(server.ws_url(), format!("ws://127.0.0.1:{}", server.port()));
        assert_eq!(server.connection_count(), 0);
        assert!(server.peers().is_empty());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_options() {
        let options = PeerOptions::new().with_max_pending(0);
        let result = Server::bind(DEFAULT_BIND_IP, 0, Arc::new(Router::new()), options).await;
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_end_to_end_request_and_handshake() {
        let server = Server::bind(DEFAULT_BIND_IP, 0, server_router(), PeerOptions::new())
            .await
            .expect("bind");

        let client = Peer::builder()
            .handshake(json!({"client": "e2e", "version": 3}))
            .connect(&format!("{}/socket", server.ws_url()))
            .expect("connect");

        // Queued while connecting, flushed after the handshake.
        let early = client.request("getProfile", json!({"id": 7}));
        timeout(WAIT, client.wait_open()).await.expect("in time").expect("open");

        let profile = timeout(WAIT, early).await.expect("in time").expect("ok");
        assert_eq!(profile, json!({"id": 7, "name": "ada"}));

        let me = timeout(WAIT, client.request("whoami", Value::Null))
            .await
            .expect("in time")
            .expect("ok");
        assert_eq!(me["peer"]["client"], "e2e");
        assert_eq!(me["path"], "/socket");
        assert_eq!(me["agent"], "13");

        let failure = timeout(WAIT, client.request("getProfile", json!({"id": 0})))
            .await
            .expect("in time");
        match failure {
            Err(Error::Remote { code, message }) => {
                assert_eq!(code, "NO_PROFILE");
                assert_eq!(message, "profile 0 does not exist");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let unknown = timeout(WAIT, client.request("getProfil", json!({})))
            .await
            .expect("in time");
        assert!(matches!(unknown, Err(Error::Remote { code, .. }) if code == "UNKNOWN_API"));

        assert_eq!(server.connection_count(), 1);
        server.shutdown().await;
        timeout(WAIT, client.closed()).await.expect("client closed");
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_server_calls_client() {
        let server = Server::bind(DEFAULT_BIND_IP, 0, Arc::new(Router::new()), PeerOptions::new())
            .await
            .expect("bind");

        let client_handlers = Handlers::new().with(
            "notify",
            handler(|ctx, call| async move {
                Ok::<_, Error>(json!({"seen": call.data["text"], "label": ctx.label()}))
            }),
        );
        let mut client_router = Router::new();
        client_router
            .register("notify", &client_handlers, "server")
            .expect("register");

        let client = Peer::builder()
            .router(Arc::new(client_router))
            .connect(&server.ws_url())
            .expect("connect");
        timeout(WAIT, client.wait_open()).await.expect("in time").expect("open");

        wait_until(|| server.connection_count() == 1).await;
        let server_side = server.peers().pop().expect("registered");
        assert!(server.peer(server_side.id()).is_some());

        let answer = timeout(WAIT, server_side.request("notify", json!({"text": "hi"})))
            .await
            .expect("in time")
            .expect("ok");
        assert_eq!(answer, json!({"seen": "hi", "label": "req:notify"}));

        let sent = timeout(WAIT, server_side.event_at("tick", now_ms(), json!({"n": 1})))
            .await
            .expect("in time");
        assert!(sent.is_ok());

        client.close();
        timeout(WAIT, client.closed()).await.expect("client closed");
        wait_until(|| server.connection_count() == 0).await;

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_closes_peer() {
        let server = Server::bind(DEFAULT_BIND_IP, 0, Arc::new(Router::new()), PeerOptions::new())
            .await
            .expect("bind");
        let client = Peer::builder().connect(&server.ws_url()).expect("connect");
        timeout(WAIT, client.wait_open()).await.expect("in time").expect("open");

        wait_until(|| server.connection_count() == 1).await;
        let id = server.peers()[0].id();
        server.remove(id);

        assert!(server.peer(id).is_none());
        timeout(WAIT, client.closed()).await.expect("client closed");
        server.shutdown().await;
    }
}
