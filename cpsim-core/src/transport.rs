//! Transport collaborator
//!
//! The engine only needs a bidirectional message channel: open it with a URL and a
//! subprotocol, write bytes into it and receive lifecycle events out of it. That
//! contract is the [`Transport`] trait. Two implementations ship with the crate:
//!
//! - [`WsTransport`]: WebSocket client on tokio-tungstenite (ws:// and wss://)
//! - [`MemoryTransport`]: in-process channel pair whose far end ([`MemoryPeer`]) is
//!   driven by the caller, used to script a central system in tests and demos

use std::borrow::Cow;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
        Message,
    },
};
use tracing::{debug, error, info, warn};

use crate::ocpp::{decode, encode, Frame};

/// Close code used when the channel ends without a close handshake
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code sent for an orderly local disconnect
pub const NORMAL_CLOSURE: u16 = 1000;

/// Lifecycle events a transport reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(Vec<u8>),
    Closed { code: u16, reason: String },
    Error(String),
}

/// Requests from the owner to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Write(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Owner's end of one opened channel.
///
/// Dropping the link abandons the channel; the transport winds down on its own.
#[derive(Debug)]
pub struct TransportLink {
    pub commands: mpsc::Sender<TransportCommand>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens message channels to a central system
pub trait Transport: Send + Sync + 'static {
    /// Start opening a channel. Completion is reported as `TransportEvent::Opened`
    /// (or `Error`/`Closed`) on the returned link.
    fn open(&self, url: &str, subprotocol: &str) -> TransportLink;
}

// ============================================================================
// WebSocket
// ============================================================================

/// WebSocket transport on tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsTransport {
    pub max_message_size: usize,
    pub max_frame_size: usize,
    pub channel_capacity: usize,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
            channel_capacity: 64,
        }
    }
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

impl Transport for WsTransport {
    fn open(&self, url: &str, subprotocol: &str) -> TransportLink {
        let (command_tx, command_rx) = mpsc::channel(self.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(self.channel_capacity);

        let ws_config = WebSocketConfig {
            max_message_size: Some(self.max_message_size),
            max_frame_size: Some(self.max_frame_size),
            ..Default::default()
        };

        tokio::spawn(run_websocket(
            url.to_string(),
            subprotocol.to_string(),
            ws_config,
            command_rx,
            event_tx,
        ));

        TransportLink {
            commands: command_tx,
            events: event_rx,
        }
    }
}

async fn run_websocket(
    url: String,
    subprotocol: String,
    ws_config: WebSocketConfig,
    commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            error!("Invalid WebSocket request for {}: {}", url, e);
            abort(&events, e.to_string()).await;
            return;
        }
    };
    match HeaderValue::from_str(&subprotocol) {
        Ok(value) => {
            request
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
        Err(e) => {
            abort(&events, format!("invalid subprotocol {:?}: {}", subprotocol, e)).await;
            return;
        }
    }

    info!("Connecting to {} ({})", url, subprotocol);

    let (ws_stream, response) = match connect_async_with_config(request, Some(ws_config), false).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("WebSocket connection failed: {}", e);
            abort(&events, e.to_string()).await;
            return;
        }
    };

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(subprotocol.as_str()) {
        warn!(
            "Central system did not accept subprotocol {}, got: {:?}",
            subprotocol, accepted
        );
    }

    if events.send(TransportEvent::Opened).await.is_err() {
        return;
    }

    let (ws_tx, mut ws_rx) = ws_stream.split();

    // Writes run on their own task so a stalled socket never blocks event delivery
    let writer = tokio::spawn(write_websocket(ws_tx, commands, events.clone()));

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(TransportEvent::Message(text.as_bytes().to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if events.send(TransportEvent::Message(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                            None => (1005, String::new()),
                        };
                        info!("WebSocket closed by server: {} {}", code, reason);
                        let _ = events.send(TransportEvent::Closed { code, reason }).await;
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong is answered by tungstenite
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        abort(&events, e.to_string()).await;
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        let _ = events
                            .send(TransportEvent::Closed {
                                code: ABNORMAL_CLOSURE,
                                reason: String::new(),
                            })
                            .await;
                        break;
                    }
                }
            }

            // Owner dropped the link, or the writer already reported the end
            _ = events.closed() => break,
        }
    }

    writer.abort();
    debug!("WebSocket reader stopped");
}

async fn write_websocket<S>(
    mut ws_tx: S,
    mut commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
) where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    while let Some(cmd) = commands.recv().await {
        match cmd {
            TransportCommand::Write(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    error!("Failed to send WebSocket message: {}", e);
                    abort(&events, e.to_string()).await;
                    return;
                }
            }
            TransportCommand::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: Cow::Owned(reason.clone()),
                };
                if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
                    debug!("Close handshake failed: {}", e);
                }
                let _ = events.send(TransportEvent::Closed { code, reason }).await;
                return;
            }
        }
    }

    debug!("Transport link dropped, closing socket");
    let _ = ws_tx.close().await;
}

/// Report a failure followed by an abnormal closure
async fn abort(events: &mpsc::Sender<TransportEvent>, message: String) {
    let _ = events.send(TransportEvent::Error(message)).await;
    let _ = events
        .send(TransportEvent::Closed {
            code: ABNORMAL_CLOSURE,
            reason: String::new(),
        })
        .await;
}

// ============================================================================
// In-memory
// ============================================================================

const MEMORY_CHANNEL_CAPACITY: usize = 256;

/// In-process transport; each `open` hands a [`MemoryPeer`] to the acceptor
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    acceptor: mpsc::UnboundedSender<MemoryPeer>,
}

/// Receives the far end of every channel opened through a [`MemoryTransport`]
#[derive(Debug)]
pub struct MemoryAcceptor {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryAcceptor) {
        let (acceptor, peers) = mpsc::unbounded_channel();
        (Self { acceptor }, MemoryAcceptor { peers })
    }
}

impl Transport for MemoryTransport {
    fn open(&self, url: &str, subprotocol: &str) -> TransportLink {
        let (command_tx, command_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);

        let peer = MemoryPeer {
            url: url.to_string(),
            subprotocol: subprotocol.to_string(),
            events: event_tx.clone(),
            writes: command_rx,
        };

        if self.acceptor.send(peer).is_err() {
            // Nobody is listening; behave like an unreachable host
            let _ = event_tx.try_send(TransportEvent::Error("connection refused".into()));
            let _ = event_tx.try_send(TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: String::new(),
            });
        }

        TransportLink {
            commands: command_tx,
            events: event_rx,
        }
    }
}

impl MemoryAcceptor {
    /// Next opened channel, or None once the transport is gone
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

/// Central-system side of an in-memory channel
#[derive(Debug)]
pub struct MemoryPeer {
    url: String,
    subprotocol: String,
    events: mpsc::Sender<TransportEvent>,
    writes: mpsc::Receiver<TransportCommand>,
}

impl MemoryPeer {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    /// Complete the opening handshake
    pub async fn open(&self) {
        self.emit(TransportEvent::Opened).await;
    }

    pub async fn send_text(&self, text: &str) {
        self.emit(TransportEvent::Message(text.as_bytes().to_vec()))
            .await;
    }

    pub async fn send_frame(&self, frame: &Frame) {
        self.emit(TransportEvent::Message(encode(frame))).await;
    }

    /// Answer a CALL with a CALLRESULT
    pub async fn reply(&self, id: &str, payload: Value) {
        self.send_frame(&Frame::result(id, payload)).await;
    }

    pub async fn close(&self, code: u16, reason: &str) {
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        })
        .await;
    }

    /// Fail the channel the way a broken socket does
    pub async fn fail(&self, message: &str) {
        self.emit(TransportEvent::Error(message.to_string())).await;
        self.close(ABNORMAL_CLOSURE, "").await;
    }

    /// Next command written by the charge point
    pub async fn next_command(&mut self) -> Option<TransportCommand> {
        self.writes.recv().await
    }

    /// Next frame written by the charge point; None on close or end of channel
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.writes.recv().await? {
                TransportCommand::Write(bytes) => match decode(&bytes) {
                    Ok(frame) => return Some(frame),
                    Err(e) => warn!("Peer received undecodable frame: {}", e),
                },
                TransportCommand::Close { .. } => return None,
            }
        }
    }

    /// Next CALL written by the charge point as (id, action, payload), skipping replies
    pub async fn next_call(&mut self) -> Option<(String, String, Value)> {
        loop {
            if let Frame::Call {
                id,
                action,
                payload,
            } = self.next_frame().await?
            {
                return Some((id, action, payload));
            }
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Charge point side of {} is gone", self.url);
        }
    }
}
