//! WebSocket transport and its IO task.
//!
//! Each [`WsTransport`] spawns one tokio task owning the socket. The task:
//!
//! - forwards inbound text frames as [`TransportEvent::Message`]
//! - sends frames handed to [`Transport::write`] in order
//! - tracks unsent bytes for [`Transport::buffered_amount`]
//! - reports `Open` / `Drained` / `Close` / `Error`

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};

use super::{ConnectionState, Transport, TransportEvent};

// ============================================================================
// Types
// ============================================================================

/// Receiving end of a transport's lifecycle callbacks.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Instructions for the IO task.
enum Outbound {
    /// Send one text frame.
    Frame(String),
    /// Close the socket.
    Close,
}

/// State shared between the handle and the IO task.
#[derive(Debug)]
struct Shared {
    state: Mutex<ConnectionState>,
    buffered: AtomicUsize,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }
}

// ============================================================================
// AcceptedRequest
// ============================================================================

/// What the server side learned from the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct AcceptedRequest {
    /// Request path.
    pub path: String,
    /// `Host` header, if sent.
    pub host: Option<String>,
    /// All headers with valid UTF-8 values; names are lower-case.
    pub headers: FxHashMap<String, String>,
}

impl AcceptedRequest {
    fn from_request(request: &Request) -> Self {
        let headers: FxHashMap<String, String> = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        Self {
            path: request.uri().path().to_string(),
            host: headers.get("host").cloned(),
            headers,
        }
    }
}

// ============================================================================
// WsTransport
// ============================================================================

/// Handle to a WebSocket driven by a background task.
///
/// Cloning shares the same socket.
#[derive(Clone)]
pub struct WsTransport {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("state", &self.state())
            .field("buffered", &self.buffered_amount())
            .finish()
    }
}

impl WsTransport {
    fn channel(initial: ConnectionState) -> (Self, mpsc::UnboundedReceiver<Outbound>, Arc<Shared>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(initial),
            buffered: AtomicUsize::new(0),
        });
        let transport = Self {
            shared: Arc::clone(&shared),
            outbound,
        };
        (transport, outbound_rx, shared)
    }

    /// Starts connecting to `url` and returns immediately in `Connecting`.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `url` is not a valid `ws://` or
    /// `wss://` URL. Connection failures are reported as events.
    pub fn connect(url: &str) -> Result<(Self, TransportEvents)> {
        let target = parse_ws_url(url)?;
        let (transport, outbound_rx, shared) = Self::channel(ConnectionState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            match tokio_tungstenite::connect_async(target.as_str()).await {
                Ok((ws_stream, _response)) => {
                    info!(url = %target, "WebSocket connection established");
                    run_io(ws_stream, outbound_rx, shared, events_tx).await;
                }
                Err(e) => {
                    let e = Error::from(e);
                    warn!(url = %target, error = %e, "WebSocket connect failed");
                    shared.set_state(ConnectionState::Closed);
                    let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                    let _ = events_tx.send(TransportEvent::Close);
                }
            }
        });

        Ok((transport, events_rx))
    }

    /// Upgrades an accepted TCP stream to a WebSocket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] if the upgrade fails.
    pub async fn accept(stream: TcpStream) -> Result<(Self, TransportEvents, AcceptedRequest)> {
        let mut accepted = AcceptedRequest::default();

        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
                accepted = AcceptedRequest::from_request(request);
                Ok(response)
            },
        )
        .await?;

        let (transport, events) = Self::from_stream(ws_stream);
        Ok((transport, events, accepted))
    }

    /// Wraps an already established WebSocket stream.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_stream<S>(ws_stream: WebSocketStream<S>) -> (Self, TransportEvents)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (transport, outbound_rx, shared) = Self::channel(ConnectionState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_io(ws_stream, outbound_rx, shared, events_tx));
        (transport, events_rx)
    }
}

impl Transport for WsTransport {
    fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    fn write(&self, frame: String) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::NotConnected);
        }

        let len = frame.len();
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);

        self.outbound.send(Outbound::Frame(frame)).map_err(|_| {
            self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
            Error::NotConnected
        })
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

// ============================================================================
// IO Task
// ============================================================================

/// Drives one socket until either side closes it.
async fn run_io<S>(
    ws_stream: WebSocketStream<S>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_write, mut ws_read) = ws_stream.split();

    shared.set_state(ConnectionState::Open);
    let _ = events.send(TransportEvent::Open);

    loop {
        tokio::select! {
            // Incoming frames from the remote peer
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Message(text.as_str().to_owned()));
                    }

                    Some(Ok(binary @ Message::Binary(_))) => match binary.into_text() {
                        Ok(text) => {
                            let _ = events.send(TransportEvent::Message(text.as_str().to_owned()));
                        }
                        Err(e) => warn!(error = %Error::from(e), "Dropping non UTF-8 binary frame"),
                    },

                    Some(Ok(Message::Close(_))) => {
                        debug!("WebSocket closed by remote");
                        break;
                    }

                    Some(Err(e)) => {
                        let e = Error::from(e);
                        error!(error = %e, "WebSocket error");
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }

                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }

                    // Ping/Pong are answered by tungstenite
                    _ => {}
                }
            }

            // Frames queued by the multiplexer
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(frame)) => {
                        let len = frame.len();
                        let sent = ws_write.send(Message::Text(frame.into())).await;
                        let before = shared.buffered.fetch_sub(len, Ordering::AcqRel);

                        if let Err(e) = sent.map_err(Error::from) {
                            warn!(error = %e, "Failed to send frame");
                            let _ = events.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                        trace!(bytes = len, "Frame sent");

                        if before == len {
                            let _ = events.send(TransportEvent::Drained);
                        }
                    }

                    Some(Outbound::Close) => {
                        debug!("Close requested");
                        let _ = ws_write.close().await;
                        break;
                    }

                    None => {
                        debug!("Transport handle dropped");
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        }
    }

    shared.set_state(ConnectionState::Closed);
    shared.buffered.store(0, Ordering::Release);
    let _ = events.send(TransportEvent::Close);

    debug!("Transport task terminated");
}

/// Validates a client URL.
pub(crate) fn parse_ws_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| Error::config(format!("invalid URL {url}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(Error::config(format!("unsupported URL scheme: {other}"))),
    }
}

// ============================================================================
// Tests
// ============================================================================
