//! Peer handle and per-connection event loop.
//!
//! Every connection is driven by one tokio task that exclusively owns its
//! [`Multiplexer`]. The task `select!`s over:
//!
//! - transport callbacks ([`TransportEvent`])
//! - commands from cloned [`Peer`] handles
//! - the housekeeping interval
//! - handler invocations that finished
//!
//! Only this task mutates the pending table, so no locking is involved.
//! Handler invocations run concurrently as futures polled by the same task;
//! their results are written back as `REQ_RESP` frames.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::context::{ConnectionContext, derive_context};
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::mux::{Inbound, Multiplexer, ResultHandle};
use crate::options::PeerOptions;
use crate::protocol::{Call, HANDSHAKE, MessageKind, Reply, now_ms};
use crate::router::Router;
use crate::transport::{ConnectionState, Transport, TransportEvent};

// ============================================================================
// Types
// ============================================================================

/// A handler invocation in flight. Requests yield the reply to send.
type Invocation = BoxFuture<'static, Option<Reply>>;

/// Instructions from [`Peer`] handles to the event loop.
enum Command {
    Request {
        name: String,
        payload: Value,
        timeout: Option<Duration>,
        tx: oneshot::Sender<Result<Value>>,
    },
    Event {
        kind: MessageKind,
        name: String,
        ts: i64,
        payload: Value,
        tx: oneshot::Sender<Result<()>>,
    },
    WaitOpen {
        tx: oneshot::Sender<Result<()>>,
    },
    Close,
}

// ============================================================================
// Peer
// ============================================================================

/// Handle to one live connection.
///
/// Cheap to clone. Outbound calls are submitted in the order they are
/// made; each returns a [`ResultHandle`] to await. When every handle is
/// dropped the connection is closed.
///
/// # Example
///
/// ```ignore
/// let peer = Peer::builder().connect("ws://127.0.0.1:9000/socket")?;
/// peer.wait_open().await?;
///
/// let profile = peer.request("getProfile", json!({ "id": 7 })).await?;
/// peer.event("viewed", json!({ "id": 7 })).await?;
/// ```
#[derive(Clone)]
pub struct Peer {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    context: watch::Receiver<Arc<ConnectionContext>>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Peer - Spawning
// ============================================================================

impl Peer {
    /// Creates a builder for a client peer.
    #[inline]
    #[must_use]
    pub fn builder() -> super::PeerBuilder {
        super::PeerBuilder::new()
    }

    /// Starts the event loop for `transport` and returns its handle.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn<T>(
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        router: Arc<Router>,
        context: ConnectionContext,
        options: PeerOptions,
    ) -> Self
    where
        T: Transport + Send + 'static,
    {
        let id = context.id;
        let base = Arc::new(context);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(transport.state());
        let (context_tx, context_rx) = watch::channel(Arc::clone(&base));

        let interval = options.housekeeping_interval;
        let event_loop = PeerLoop {
            mux: Multiplexer::new(transport, options),
            router,
            base,
            state_tx,
            context_tx,
        };

        tokio::spawn(event_loop.run(events, commands_rx, interval));
        debug!(conn = %id, "Peer spawned");

        Self {
            id,
            commands: commands_tx,
            state: state_rx,
            context: context_rx,
        }
    }
}

// ============================================================================
// Peer - Public API
// ============================================================================

impl Peer {
    /// Connection identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Current base context, including the remote handshake once received.
    #[must_use]
    pub fn context(&self) -> Arc<ConnectionContext> {
        Arc::clone(&self.context.borrow())
    }

    /// Sends a request with the configured default timeout.
    pub fn request(&self, name: impl Into<String>, payload: Value) -> ResultHandle<Value> {
        self.submit_request(name.into(), payload, None)
    }

    /// Sends a request that is rejected with
    /// [`Error::RequestTimeout`] if no response arrives within `timeout`.
    pub fn request_with_timeout(
        &self,
        name: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> ResultHandle<Value> {
        self.submit_request(name.into(), payload, Some(timeout))
    }

    /// Sends an `EVENT` stamped now.
    pub fn event(&self, name: impl Into<String>, payload: Value) -> ResultHandle<()> {
        self.submit_event(MessageKind::Event, name.into(), now_ms(), payload)
    }

    /// Sends an `EVENT` with an explicit timestamp.
    pub fn event_at(&self, name: impl Into<String>, ts: i64, payload: Value) -> ResultHandle<()> {
        self.submit_event(MessageKind::Event, name.into(), ts, payload)
    }

    /// Sends an `EPH_EVENT` stamped now.
    pub fn ephemeral_event(&self, name: impl Into<String>, payload: Value) -> ResultHandle<()> {
        self.submit_event(MessageKind::EphemeralEvent, name.into(), now_ms(), payload)
    }

    /// Sends a `SYS_EVENT` stamped now.
    ///
    /// The handshake name is reserved and rejected with
    /// [`Error::ReservedName`].
    pub fn system_event(&self, name: impl Into<String>, payload: Value) -> ResultHandle<()> {
        let name = name.into();
        if name == HANDSHAKE {
            let (tx, handle) = ResultHandle::channel();
            let _ = tx.send(Err(Error::reserved_name(name)));
            return handle;
        }
        self.submit_event(MessageKind::SystemEvent, name, now_ms(), payload)
    }

    /// Resolves once the transport is open.
    ///
    /// Fails with [`Error::Connection`] if the connection attempt fails, or
    /// [`Error::NotConnected`] if it closes first.
    pub fn wait_open(&self) -> ResultHandle<()> {
        let (tx, handle) = ResultHandle::channel();
        let _ = self.commands.send(Command::WaitOpen { tx });
        handle
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Starts closing the connection.
    ///
    /// Everything still pending is rejected with [`Error::NotConnected`]
    /// once the transport confirms the close.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    fn submit_request(&self, name: String, payload: Value, timeout: Option<Duration>) -> ResultHandle<Value> {
        let (tx, handle) = ResultHandle::channel();
        // A closed loop drops the command, which rejects the handle.
        let _ = self.commands.send(Command::Request {
            name,
            payload,
            timeout,
            tx,
        });
        handle
    }

    fn submit_event(&self, kind: MessageKind, name: String, ts: i64, payload: Value) -> ResultHandle<()> {
        let (tx, handle) = ResultHandle::channel();
        let _ = self.commands.send(Command::Event {
            kind,
            name,
            ts,
            payload,
            tx,
        });
        handle
    }
}

// ============================================================================
// PeerLoop
// ============================================================================

/// State owned by the event loop task.
struct PeerLoop<T: Transport> {
    mux: Multiplexer<T>,
    router: Arc<Router>,
    base: Arc<ConnectionContext>,
    state_tx: watch::Sender<ConnectionState>,
    context_tx: watch::Sender<Arc<ConnectionContext>>,
}

impl<T: Transport + Send + 'static> PeerLoop<T> {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        interval: Duration,
    ) {
        let conn = self.base.id;
        let mut housekeeping = tokio::time::interval(interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut invocations: FuturesUnordered<Invocation> = FuturesUnordered::new();
        let mut handles_alive = true;

        loop {
            tokio::select! {
                // Transport callbacks
                event = events.recv() => {
                    match event {
                        Some(TransportEvent::Open) => {
                            info!(conn = %conn, "Connection open");
                            self.mux.on_open();
                            self.publish_state();
                        }

                        Some(TransportEvent::Message(text)) => {
                            if let Some(inbound) = self.mux.on_message(&text)
                                && let Some(invocation) = self.dispatch(inbound)
                            {
                                invocations.push(invocation);
                            }
                        }

                        Some(TransportEvent::Drained) => self.mux.housekeep(),

                        Some(TransportEvent::Error(message)) => {
                            warn!(conn = %conn, error = %message, "Transport error");
                            self.mux.on_error(&message);
                        }

                        Some(TransportEvent::Close) | None => {
                            info!(conn = %conn, "Connection closed");
                            self.mux.on_close();
                            self.publish_state();
                            break;
                        }
                    }
                }

                // Peer handle commands
                command = commands.recv(), if handles_alive => {
                    match command {
                        Some(command) => self.execute(command),
                        None => {
                            debug!(conn = %conn, "All peer handles dropped, closing");
                            handles_alive = false;
                            self.mux.close();
                        }
                    }
                }

                // Housekeeping
                _ = housekeeping.tick() => {
                    self.mux.housekeep();
                    self.publish_state();
                }

                // Finished handler invocations
                Some(reply) = invocations.next(), if !invocations.is_empty() => {
                    if let Some(reply) = reply {
                        self.mux.respond(reply);
                    }
                }
            }
        }

        if !invocations.is_empty() {
            debug!(conn = %conn, count = invocations.len(), "Abandoning in-flight handlers");
        }
        debug!(conn = %conn, "Peer loop terminated");
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Request {
                name,
                payload,
                timeout,
                tx,
            } => {
                let timeout = timeout.or(self.mux.options().request_timeout);
                self.mux.submit_request(name, payload, timeout, tx);
            }
            Command::Event {
                kind,
                name,
                ts,
                payload,
                tx,
            } => self.mux.submit_event(kind, name, ts, payload, tx),
            Command::WaitOpen { tx } => self.mux.register_open_waiter(tx),
            Command::Close => {
                debug!(conn = %self.base.id, "Close requested");
                self.mux.close();
            }
        }
    }

    /// Turns an inbound call into a handler invocation.
    fn dispatch(&mut self, inbound: Inbound) -> Option<Invocation> {
        match inbound {
            Inbound::Handshake(call) => {
                let next = self.base.with_peer_info(call.data, call.ts, now_ms());
                info!(
                    conn = %self.base.id,
                    ms_offset = next.server.ms_offset,
                    "Handshake received"
                );
                self.replace_base(next);
                None
            }

            Inbound::Request(call) => {
                let ctx = derive_context(&self.base, format!("req:{}", call.name));
                let header = Call::new(call.name.clone(), call.seq, call.ts, Value::Null);
                let router = Arc::clone(&self.router);

                Some(
                    async move {
                        let reply = match router.route_request(ctx, call).await {
                            Ok(data) => Reply::success(&header, data),
                            Err(e) => Reply::failure(&header, &e),
                        };
                        Some(reply)
                    }
                    .boxed(),
                )
            }

            Inbound::Event { kind, call } => {
                if call.ts > 0 {
                    let next = self.base.with_last_event_ts(call.ts);
                    self.replace_base(next);
                }

                let prefix = match kind {
                    MessageKind::SystemEvent => "sys",
                    MessageKind::EphemeralEvent => "eph",
                    _ => "evt",
                };
                let ctx = derive_context(&self.base, format!("{prefix}:{}", call.name));
                let router = Arc::clone(&self.router);

                Some(
                    async move {
                        // Failures are logged by the router; events get no reply.
                        let _ = router.route_event(ctx, call).await;
                        None
                    }
                    .boxed(),
                )
            }
        }
    }

    fn replace_base(&mut self, next: ConnectionContext) {
        self.base = Arc::new(next);
        self.context_tx.send_replace(Arc::clone(&self.base));
    }

    fn publish_state(&self) {
        let state = self.mux.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::time::timeout;

    use crate::router::{Handlers, handler};
    use crate::transport::testing::MockTransport;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        peer: Peer,
        transport: MockTransport,
        events: mpsc::UnboundedSender<TransportEvent>,
    }

    fn harness(router: Router, options: PeerOptions) -> Harness {
        let transport = MockTransport::new(ConnectionState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = Peer::spawn(
            transport.clone(),
            events_rx,
            Arc::new(router),
            ConnectionContext::new("ws", "localhost", 9000, "/"),
            options,
        );
        Harness {
            peer,
            transport,
            events: events_tx,
        }
    }

    fn echo_router() -> Router {
        let handlers = Handlers::new()
            .with(
                "echo",
                handler(|_ctx, call| async move { Ok::<_, Error>(call.data) }),
            )
            .with(
                "whoami",
                handler(|ctx, _call| async move {
                    Ok::<_, Error>(json!({
                        "label": ctx.label(),
                        "peer": ctx.peer_info.as_ref().clone(),
                        "offset": ctx.server.ms_offset,
                    }))
                }),
            );

        let mut router = Router::new();
        router.register("echo", &handlers, "public").expect("register");
        router.register("whoami", &handlers, "public").expect("register");
        router
    }

    async fn open(h: &Harness) {
        h.transport.set_state(ConnectionState::Open);
        h.events.send(TransportEvent::Open).expect("loop alive");
        timeout(WAIT, h.peer.wait_open())
            .await
            .expect("open in time")
            .expect("open");
    }

    async fn written_count(transport: &MockTransport, count: usize) -> Vec<Value> {
        timeout(WAIT, async {
            loop {
                let written = transport.written_values();
                if written.len() >= count {
                    return written;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frames in time")
    }

    #[tokio::test]
    async fn test_request_round_trip_through_loop() {
        let h = harness(Router::new(), PeerOptions::new());
        open(&h).await;
        assert_eq!(h.peer.state(), ConnectionState::Open);

        let handle = h.peer.request("ping", json!({}));
        let written = written_count(&h.transport, 1).await;
        assert_eq!(written[0]["type"], "REQUEST");
        let seq = written[0]["seq"].as_u64().expect("seq");

        let reply = json!({"type": "REQ_RESP", "name": "ping", "seq": seq, "ts": 1, "data": "pong"});
        h.events.send(TransportEvent::Message(reply.to_string())).expect("loop alive");

        let result = timeout(WAIT, handle).await.expect("in time").expect("ok");
        assert_eq!(result, json!("pong"));
    }

    #[tokio::test]
    async fn test_inbound_request_is_answered() {
        let h = harness(echo_router(), PeerOptions::new());
        open(&h).await;

        let request = json!({"type": "REQUEST", "name": "echo", "seq": 3, "ts": 1, "data": {"a": 1}});
        h.events.send(TransportEvent::Message(request.to_string())).expect("loop alive");

        let written = written_count(&h.transport, 1).await;
        assert_eq!(written[0]["type"], "REQ_RESP");
        assert_eq!(written[0]["seq"], 3);
        assert_eq!(written[0]["data"]["a"], 1);
        assert!(written[0]["errorCode"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_api_answered_with_structured_error() {
        let h = harness(echo_router(), PeerOptions::new());
        open(&h).await;

        let request = json!({"type": "REQUEST", "name": "getProfil", "seq": 8, "ts": 1, "data": {}});
        h.events.send(TransportEvent::Message(request.to_string())).expect("loop alive");

        let written = written_count(&h.transport, 1).await;
        assert_eq!(written[0]["seq"], 8);
        assert_eq!(written[0]["errorCode"], "UNKNOWN_API");
        assert_eq!(h.peer.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_handshake_updates_context() {
        let h = harness(echo_router(), PeerOptions::new());
        open(&h).await;

        let handshake = json!({"type": "SYS_EVENT", "name": HANDSHAKE, "seq": 1, "ts": now_ms(), "data": {"client": "cli"}});
        h.events.send(TransportEvent::Message(handshake.to_string())).expect("loop alive");

        let request = json!({"type": "REQUEST", "name": "whoami", "seq": 1, "ts": 1, "data": null});
        h.events.send(TransportEvent::Message(request.to_string())).expect("loop alive");

        let written = written_count(&h.transport, 1).await;
        assert_eq!(written[0]["data"]["peer"]["client"], "cli");
        assert_eq!(written[0]["data"]["label"], "req:whoami");
        assert_eq!(h.peer.context().peer_info["client"], "cli");
    }

    #[tokio::test]
    async fn test_event_updates_last_event_ts() {
        let h = harness(Router::new(), PeerOptions::new());
        open(&h).await;

        let event = json!({"type": "EVENT", "name": "unhandled", "seq": 9, "ts": 4242, "data": null});
        h.events.send(TransportEvent::Message(event.to_string())).expect("loop alive");

        timeout(WAIT, async {
            while h.peer.context().server.last_event_ts != 4242 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("context updated");
        assert!(h.transport.written().is_empty());
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_later_calls() {
        let h = harness(Router::new(), PeerOptions::new());
        let pending = h.peer.request("never", json!(null));

        h.transport.set_state(ConnectionState::Closed);
        h.events.send(TransportEvent::Close).expect("loop alive");

        assert!(matches!(
            timeout(WAIT, pending).await.expect("in time"),
            Err(Error::NotConnected)
        ));
        timeout(WAIT, h.peer.closed()).await.expect("closed in time");
        assert_eq!(h.peer.state(), ConnectionState::Closed);

        let late = h.peer.request("late", json!(null));
        assert!(matches!(
            timeout(WAIT, late).await.expect("in time"),
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_command_closes_transport() {
        let h = harness(Router::new(), PeerOptions::new());
        open(&h).await;

        h.peer.close();
        timeout(WAIT, async {
            while h.transport.close_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("close reached transport");
    }

    #[tokio::test]
    async fn test_housekeeping_flushes_after_backpressure() {
        let options = PeerOptions::new().with_housekeeping_interval(Duration::from_millis(20));
        let h = harness(Router::new(), options);
        open(&h).await;

        h.transport.set_buffered(100);
        let event = h.peer.event("log", json!({"msg": "x"}));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(h.transport.written().is_empty());

        h.transport.set_buffered(0);
        timeout(WAIT, event).await.expect("in time").expect("flushed");
        assert_eq!(h.transport.written().len(), 1);
    }

    #[tokio::test]
    async fn test_request_timeout_through_loop() {
        let options = PeerOptions::new().with_housekeeping_interval(Duration::from_millis(10));
        let h = harness(Router::new(), options);
        open(&h).await;

        let result = timeout(
            WAIT,
            h.peer.request_with_timeout("slow", json!(null), Duration::from_millis(30)),
        )
        .await
        .expect("in time");
        assert!(result.is_err_and(|e| e.is_timeout()));
    }

    #[tokio::test]
    async fn test_reserved_system_event_rejected() {
        let h = harness(Router::new(), PeerOptions::new());
        let result = h.peer.system_event(HANDSHAKE, json!(null)).await;
        assert!(matches!(result, Err(Error::ReservedName { .. })));
    }
}
