//! Connection manager
//!
//! One actor task per charge point identity owns the transport link, the correlation
//! table and the frame log. Everything else talks to it through a cloneable
//! [`ConnectionHandle`], so socket writes and correlation ids are serialized by
//! construction. Lifecycle:
//!
//! ```text
//! Disconnected --connect--> Connecting --opened--> Connected --close/closed/error--> Disconnected
//! ```
//!
//! On closure the correlation table is drained first, the CLOSE pseudo-frame is
//! logged, and only then is `Disconnected` published and the disconnect count bumped.
//! The session simulator and the heartbeat watch that count and stop their timers.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::correlation::{CorrelationTable, PendingReply};
use crate::error::EngineError;
use crate::frame_log::{Direction, FrameLog, LogEntry, LogFilter};
use crate::ocpp::{decode, encode, Action, Frame};
use crate::persistence::PersistEvent;
use crate::transport::{
    Transport, TransportCommand, TransportEvent, TransportLink, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Reason logged for a local disconnect
pub const CLIENT_DISCONNECT: &str = "Client disconnect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// CALL received from the central system, awaiting a handler
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCall {
    pub id: String,
    pub action: String,
    pub payload: Value,
}

enum ConnCommand {
    Connect {
        url: String,
        subprotocol: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Call {
        action: String,
        payload: Value,
        reply: oneshot::Sender<Result<PendingReply, EngineError>>,
    },
    Reply {
        frame: Frame,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Frames {
        filter: Option<LogFilter>,
        reply: oneshot::Sender<Vec<LogEntry>>,
    },
    ClearFrames,
    SetLogPaused(bool),
}

/// Cloneable front end of the connection actor
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<ConnCommand>,
    state: watch::Receiver<ConnectionState>,
    disconnects: watch::Receiver<u64>,
}

impl ConnectionHandle {
    /// Open the channel; resolves once the transport reports it open
    pub async fn connect(
        &self,
        url: impl Into<String>,
        subprotocol: impl Into<String>,
    ) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(ConnCommand::Connect {
            url: url.into(),
            subprotocol: subprotocol.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::Shutdown)?
    }

    /// Close the channel locally; no-op when already disconnected
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(ConnCommand::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Send a CALL and return the handle to its reply
    pub async fn submit(
        &self,
        action: impl Into<String>,
        payload: Value,
    ) -> Result<PendingReply, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(ConnCommand::Call {
            action: action.into(),
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::Shutdown)?
    }

    /// Send a CALL and wait for its CALLRESULT payload
    pub async fn call(&self, action: impl Into<String>, payload: Value) -> Result<Value, EngineError> {
        self.submit(action, payload).await?.wait().await
    }

    /// Typed CALL for the actions the engine issues itself
    pub async fn call_typed<Req, Resp>(&self, action: Action, request: &Req) -> Result<Resp, EngineError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let result = self.call(action.as_str(), payload).await?;
        serde_json::from_value(result)
            .map_err(|e| EngineError::Protocol(format!("malformed {} response: {}", action.as_str(), e)))
    }

    /// Send a CALLRESULT or CALLERROR answering an inbound CALL
    pub async fn reply(&self, frame: Frame) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(ConnCommand::Reply { frame, reply }).await?;
        rx.await.map_err(|_| EngineError::Shutdown)?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Count of links torn down so far. Bumped once per teardown, so a drop is
    /// observable even when a reconnect lands before the watcher looks.
    pub fn watch_disconnects(&self) -> watch::Receiver<u64> {
        self.disconnects.clone()
    }

    /// Frame log snapshot, most recent first
    pub async fn frames(&self) -> Vec<LogEntry> {
        self.query_frames(None).await
    }

    pub async fn filtered_frames(&self, filter: LogFilter) -> Vec<LogEntry> {
        self.query_frames(Some(filter)).await
    }

    pub async fn clear_frames(&self) {
        let _ = self.send(ConnCommand::ClearFrames).await;
    }

    pub async fn set_log_paused(&self, paused: bool) {
        let _ = self.send(ConnCommand::SetLogPaused(paused)).await;
    }

    async fn query_frames(&self, filter: Option<LogFilter>) -> Vec<LogEntry> {
        let (reply, rx) = oneshot::channel();
        if self.send(ConnCommand::Frames { filter, reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn send(&self, command: ConnCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Shutdown)
    }
}

/// Start the connection actor.
///
/// Inbound CALLs are forwarded to `inbound`; appended frames and log clears are
/// reported to `persist` when given.
pub fn spawn_connection(
    transport: Arc<dyn Transport>,
    engine: &EngineConfig,
    frame_log: FrameLog,
    inbound: mpsc::UnboundedSender<InboundCall>,
    persist: Option<mpsc::UnboundedSender<PersistEvent>>,
) -> (ConnectionHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(engine.channel_capacity.max(1));
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (disconnects_tx, disconnects_rx) = watch::channel(0);

    let actor = ConnectionActor {
        transport,
        request_timeout: engine.request_timeout,
        state: state_tx,
        disconnects: disconnects_tx,
        table: CorrelationTable::new(),
        frame_log,
        link: None,
        target: None,
        pending_connect: None,
        inbound,
        persist,
    };
    let task = tokio::spawn(actor.run(command_rx));

    (
        ConnectionHandle {
            commands: command_tx,
            state: state_rx,
            disconnects: disconnects_rx,
        },
        task,
    )
}

struct ConnectionActor {
    transport: Arc<dyn Transport>,
    request_timeout: Option<Duration>,
    state: watch::Sender<ConnectionState>,
    disconnects: watch::Sender<u64>,
    table: CorrelationTable,
    frame_log: FrameLog,
    link: Option<TransportLink>,
    /// URL and subprotocol of the current attempt
    target: Option<(String, String)>,
    pending_connect: Option<oneshot::Sender<Result<(), EngineError>>>,
    inbound: mpsc::UnboundedSender<InboundCall>,
    persist: Option<mpsc::UnboundedSender<PersistEvent>>,
}

impl ConnectionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<ConnCommand>) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }

                event = next_event(&mut self.link) => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            warn!("Transport dropped its event channel");
                            self.handle_closed(ABNORMAL_CLOSURE, String::new());
                        }
                    }
                }

                _ = sweep.tick() => {
                    if let Some(timeout) = self.request_timeout {
                        self.table.expire(Instant::now(), timeout);
                    }
                }
            }
        }

        debug!("Connection handles dropped, shutting down actor");
        if let Some(link) = self.link.take() {
            let _ = link.commands.try_send(TransportCommand::Close {
                code: NORMAL_CLOSURE,
                reason: CLIENT_DISCONNECT.to_string(),
            });
        }
        self.table.drain_on_disconnect();
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn handle_command(&mut self, cmd: ConnCommand) {
        match cmd {
            ConnCommand::Connect {
                url,
                subprotocol,
                reply,
            } => {
                if self.current() != ConnectionState::Disconnected {
                    let _ = reply.send(Err(EngineError::AlreadyConnected));
                    return;
                }

                info!("Connecting to {} ({})", url, subprotocol);
                self.link = Some(self.transport.open(&url, &subprotocol));
                self.target = Some((url, subprotocol));
                self.pending_connect = Some(reply);
                self.state.send_replace(ConnectionState::Connecting);
            }

            ConnCommand::Disconnect { reply } => {
                if let Some(link) = &self.link {
                    let _ = link.commands.try_send(TransportCommand::Close {
                        code: NORMAL_CLOSURE,
                        reason: CLIENT_DISCONNECT.to_string(),
                    });
                    info!("Disconnecting");
                    self.handle_closed(NORMAL_CLOSURE, CLIENT_DISCONNECT.to_string());
                }
                let _ = reply.send(());
            }

            ConnCommand::Call {
                action,
                payload,
                reply,
            } => {
                let _ = reply.send(self.send_call(action, payload));
            }

            ConnCommand::Reply { frame, reply } => {
                let result = if self.current() == ConnectionState::Connected {
                    self.write(frame)
                } else {
                    warn!("Dropping reply {} while not connected", frame.id());
                    Err(EngineError::NotConnected)
                };
                let _ = reply.send(result);
            }

            ConnCommand::Frames { filter, reply } => {
                let frames = match filter {
                    Some(filter) => self.frame_log.filtered(&filter),
                    None => self.frame_log.snapshot(),
                };
                let _ = reply.send(frames);
            }

            ConnCommand::ClearFrames => {
                self.frame_log.clear();
                self.notify(PersistEvent::ClearFrames);
            }

            ConnCommand::SetLogPaused(paused) => {
                self.frame_log.set_paused(paused);
            }
        }
    }

    fn send_call(&mut self, action: String, payload: Value) -> Result<PendingReply, EngineError> {
        if self.current() != ConnectionState::Connected {
            return Err(EngineError::NotConnected);
        }

        let frame = Frame::call(action.clone(), payload);
        let id = frame.id().to_string();
        let pending = self.table.register(id.clone(), action)?;

        if let Err(e) = self.write(frame) {
            self.table.forget(&id);
            return Err(e);
        }
        Ok(pending)
    }

    /// Encode, queue and log an outbound wire frame. Never waits on the transport.
    fn write(&mut self, frame: Frame) -> Result<(), EngineError> {
        let link = self.link.as_ref().ok_or(EngineError::NotConnected)?;
        let bytes = encode(&frame);
        debug!("Sending: {}", String::from_utf8_lossy(&bytes));

        link.commands
            .try_send(TransportCommand::Write(bytes))
            .map_err(|e| match e {
                TrySendError::Full(_) => EngineError::Transport("write queue full".into()),
                TrySendError::Closed(_) => EngineError::Transport("transport channel closed".into()),
            })?;

        self.record(Direction::Out, frame);
        Ok(())
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.current() != ConnectionState::Connecting {
                    warn!("Ignoring open event while {:?}", self.current());
                    return;
                }
                let (url, subprotocol) = self.target.clone().unwrap_or_default();
                info!("Connected to {}", url);
                self.record(Direction::Out, Frame::Opened { url, subprotocol });
                self.state.send_replace(ConnectionState::Connected);
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Ok(()));
                }
            }

            TransportEvent::Message(bytes) => self.handle_message(&bytes),

            TransportEvent::Closed { code, reason } => {
                info!("Connection closed: {} {}", code, reason);
                self.handle_closed(code, reason);
            }

            TransportEvent::Error(message) => {
                error!("Transport error: {}", message);
                self.record(
                    Direction::In,
                    Frame::TransportError {
                        message: message.clone(),
                    },
                );
                let pending = self.pending_connect.take();
                self.handle_closed(ABNORMAL_CLOSURE, String::new());
                if let Some(reply) = pending {
                    let _ = reply.send(Err(EngineError::Transport(message)));
                }
            }
        }
    }

    fn handle_message(&mut self, bytes: &[u8]) {
        debug!("Received: {}", String::from_utf8_lossy(bytes));

        let frame = match decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                let message = e.to_string();
                warn!("{}", EngineError::from(e));
                self.record(Direction::In, Frame::DecodeError { message });
                return;
            }
        };

        self.record(Direction::In, frame.clone());

        match frame {
            Frame::Call {
                id,
                action,
                payload,
            } => {
                if self
                    .inbound
                    .send(InboundCall {
                        id,
                        action,
                        payload,
                    })
                    .is_err()
                {
                    warn!("No dispatcher running, inbound CALL dropped");
                }
            }
            Frame::CallResult { id, payload } => {
                if !self.table.resolve(&id, payload) {
                    debug!("{}", EngineError::Protocol(format!("no pending CALL with id {}", id)));
                }
            }
            Frame::CallError {
                id,
                code,
                description,
                details,
            } => {
                if !self.table.reject(&id, code, description, details) {
                    debug!("{}", EngineError::Protocol(format!("no pending CALL with id {}", id)));
                }
            }
            _ => {}
        }
    }

    /// Tear down the current link: drain, log, then publish `Disconnected`
    fn handle_closed(&mut self, code: u16, reason: String) {
        if self.link.is_none() && self.current() == ConnectionState::Disconnected {
            return;
        }

        self.table.drain_on_disconnect();
        self.record(
            Direction::In,
            Frame::Closed {
                code,
                reason: reason.clone(),
            },
        );
        self.link = None;
        self.target = None;
        self.state.send_replace(ConnectionState::Disconnected);
        self.disconnects.send_modify(|count| *count += 1);

        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(EngineError::Transport(format!(
                "closed before open: {} {}",
                code, reason
            ))));
        }
    }

    fn record(&mut self, direction: Direction, frame: Frame) {
        let entry = LogEntry::new(direction, frame);
        if self.persist.is_some() && !self.frame_log.is_paused() {
            self.notify(PersistEvent::Frame(entry.clone()));
        }
        self.frame_log.append(entry);
    }

    fn notify(&self, event: PersistEvent) {
        if let Some(persist) = &self.persist {
            if persist.send(event).is_err() {
                debug!("Persister gone, state change not saved");
            }
        }
    }
}

async fn next_event(link: &mut Option<TransportLink>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::{ErrorCode, FrameKind};
    use crate::transport::{MemoryAcceptor, MemoryPeer, MemoryTransport};
    use serde_json::json;

    struct Fixture {
        handle: ConnectionHandle,
        acceptor: MemoryAcceptor,
        inbound: mpsc::UnboundedReceiver<InboundCall>,
    }

    fn fixture(engine: EngineConfig) -> Fixture {
        let (transport, acceptor) = MemoryTransport::new();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_connection(
            Arc::new(transport),
            &engine,
            FrameLog::new(engine.frame_log_capacity),
            inbound_tx,
            None,
        );
        Fixture {
            handle,
            acceptor,
            inbound,
        }
    }

    async fn connected(fx: &mut Fixture) -> MemoryPeer {
        let handle = fx.handle.clone();
        let connecting = tokio::spawn(async move { handle.connect("ws://csms/ocpp/CP1", "ocpp1.6").await });
        let peer = fx.acceptor.accept().await.unwrap();
        peer.open().await;
        connecting.await.unwrap().unwrap();
        peer
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut fx = fixture(EngineConfig::default());
        let mut states = fx.handle.watch();
        assert_eq!(fx.handle.state(), ConnectionState::Disconnected);

        let handle = fx.handle.clone();
        let connecting = tokio::spawn(async move { handle.connect("ws://csms/ocpp/CP1", "ocpp1.6").await });
        let peer = fx.acceptor.accept().await.unwrap();

        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);

        assert!(matches!(
            fx.handle.connect("ws://csms/ocpp/CP1", "ocpp1.6").await,
            Err(EngineError::AlreadyConnected)
        ));

        peer.open().await;
        connecting.await.unwrap().unwrap();
        assert_eq!(fx.handle.state(), ConnectionState::Connected);

        fx.handle.disconnect().await;
        assert_eq!(fx.handle.state(), ConnectionState::Disconnected);

        let kinds: Vec<_> = fx.handle.frames().await.iter().map(|e| e.frame.kind()).collect();
        assert_eq!(kinds, vec![FrameKind::Close, FrameKind::Open]);
    }

    #[tokio::test]
    async fn test_call_requires_connection() {
        let fx = fixture(EngineConfig::default());
        assert!(matches!(
            fx.handle.call("Heartbeat", json!({})).await,
            Err(EngineError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let mut fx = fixture(EngineConfig::default());
        let mut peer = connected(&mut fx).await;

        let handle = fx.handle.clone();
        let call = tokio::spawn(async move { handle.call("Heartbeat", json!({})).await });

        let (id, action, _) = peer.next_call().await.unwrap();
        assert_eq!(action, "Heartbeat");
        peer.reply(&id, json!({"currentTime": "2026-01-01T00:00:00Z"})).await;

        let payload = call.await.unwrap().unwrap();
        assert_eq!(payload["currentTime"], "2026-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_call_error_reply() {
        let mut fx = fixture(EngineConfig::default());
        let mut peer = connected(&mut fx).await;

        let handle = fx.handle.clone();
        let call = tokio::spawn(async move { handle.call("DataTransfer", json!({})).await });

        let (id, _, _) = peer.next_call().await.unwrap();
        peer.send_frame(&Frame::error(id, ErrorCode::NotSupported, "nope"))
            .await;

        match call.await.unwrap() {
            Err(EngineError::Remote { code, .. }) => assert_eq!(code, ErrorCode::NotSupported),
            other => panic!("Expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_drains_before_disconnected() {
        let mut fx = fixture(EngineConfig::default());
        let mut peer = connected(&mut fx).await;

        let mut pending = Vec::new();
        for _ in 0..3 {
            pending.push(fx.handle.submit("MeterValues", json!({})).await.unwrap());
        }
        for _ in 0..3 {
            peer.next_call().await.unwrap();
        }

        let mut states = fx.handle.watch();
        states.borrow_and_update();
        peer.close(1001, "going away").await;
        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), ConnectionState::Disconnected);

        for reply in pending {
            assert!(matches!(reply.wait().await, Err(EngineError::ConnectionClosed)));
        }

        let frames = fx.handle.frames().await;
        assert_eq!(
            frames[0].frame,
            Frame::Closed {
                code: 1001,
                reason: "going away".into()
            }
        );
        assert_eq!(frames[0].direction, Direction::In);
    }

    #[tokio::test]
    async fn test_malformed_input_keeps_connection() {
        let mut fx = fixture(EngineConfig::default());
        let peer = connected(&mut fx).await;

        peer.send_text("not json at all").await;
        peer.send_text(r#"[3, "unknown-id", {}]"#).await;
        peer.send_text(r#"[2, "c1", "Foo", {}]"#).await;

        let call = fx.inbound.recv().await.unwrap();
        assert_eq!(call.action, "Foo");
        assert_eq!(fx.handle.state(), ConnectionState::Connected);

        let kinds: Vec<_> = fx.handle.frames().await.iter().map(|e| e.frame.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                FrameKind::Call,
                FrameKind::CallResult,
                FrameKind::ParseErr,
                FrameKind::Open
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_error_forces_disconnect() {
        let mut fx = fixture(EngineConfig::default());
        let peer = connected(&mut fx).await;
        let pending = fx.handle.submit("Heartbeat", json!({})).await.unwrap();

        peer.fail("connection reset").await;
        assert!(matches!(pending.wait().await, Err(EngineError::ConnectionClosed)));

        let mut states = fx.handle.watch();
        while *states.borrow_and_update() != ConnectionState::Disconnected {
            states.changed().await.unwrap();
        }

        let kinds: Vec<_> = fx.handle.frames().await.iter().map(|e| e.frame.kind()).collect();
        assert_eq!(kinds[0], FrameKind::Close);
        assert_eq!(kinds[1], FrameKind::Error);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (transport, acceptor) = MemoryTransport::new();
        drop(acceptor);
        let (inbound_tx, _inbound) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_connection(
            Arc::new(transport),
            &EngineConfig::default(),
            FrameLog::default(),
            inbound_tx,
            None,
        );

        assert!(matches!(
            handle.connect("ws://nowhere/CP1", "ocpp1.6").await,
            Err(EngineError::Transport(_))
        ));
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        // A later attempt is allowed
        assert!(handle.connect("ws://nowhere/CP1", "ocpp1.6").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let engine = EngineConfig {
            request_timeout: Some(Duration::from_secs(3)),
            ..Default::default()
        };
        let mut fx = fixture(engine);
        let _peer = connected(&mut fx).await;

        let pending = fx.handle.submit("Authorize", json!({"idTag": "X"})).await.unwrap();
        match pending.wait().await {
            Err(EngineError::RequestTimeout { action }) => assert_eq!(action, "Authorize"),
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert_eq!(fx.handle.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_does_not_block_actor() {
        let engine = EngineConfig {
            request_timeout: Some(Duration::from_secs(3)),
            frame_log_capacity: 1000,
            ..Default::default()
        };
        let mut fx = fixture(engine);
        // Peer never reads, so the write queue fills up
        let peer = connected(&mut fx).await;

        let mut pending = Vec::new();
        let mut refused = 0;
        for _ in 0..300 {
            match fx.handle.submit("Heartbeat", json!({})).await {
                Ok(reply) => pending.push(reply),
                Err(EngineError::Transport(reason)) => {
                    assert_eq!(reason, "write queue full");
                    refused += 1;
                }
                Err(e) => panic!("Unexpected error: {:?}", e),
            }
        }
        assert!(refused > 0);
        assert_eq!(pending.len() + refused, 300);

        // Still answering queries, and only queued CALLs were logged
        let calls = fx
            .handle
            .filtered_frames(LogFilter {
                kind: Some(FrameKind::Call),
                ..Default::default()
            })
            .await;
        assert_eq!(calls.len(), pending.len());

        match pending.remove(0).wait().await {
            Err(EngineError::RequestTimeout { action }) => assert_eq!(action, "Heartbeat"),
            other => panic!("Expected timeout, got {:?}", other),
        }

        let mut states = fx.handle.watch();
        peer.fail("connection reset").await;
        states
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(matches!(
            fx.handle.submit("Heartbeat", json!({})).await,
            Err(EngineError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unexpected_result_is_ignored() {
        let mut fx = fixture(EngineConfig::default());
        let mut peer = connected(&mut fx).await;

        peer.reply("never-sent", json!({})).await;
        let pending = fx.handle.submit("Heartbeat", json!({})).await.unwrap();
        let (id, _, _) = peer.next_call().await.unwrap();
        peer.reply(&id, json!({"currentTime": "2024-01-01T00:00:00Z"})).await;

        assert!(pending.wait().await.is_ok());
        assert_eq!(fx.handle.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_malformed_typed_response() {
        let mut fx = fixture(EngineConfig::default());
        let mut peer = connected(&mut fx).await;

        let handle = fx.handle.clone();
        let call = tokio::spawn(async move {
            handle
                .call_typed::<_, crate::ocpp::BootNotificationResponse>(
                    Action::BootNotification,
                    &json!({"chargePointVendor": "V", "chargePointModel": "M"}),
                )
                .await
        });
        let (id, action, _) = peer.next_call().await.unwrap();
        assert_eq!(action, "BootNotification");
        peer.reply(&id, json!({"status": 5})).await;

        match call.await.unwrap() {
            Err(EngineError::Protocol(message)) => {
                assert!(message.starts_with("malformed BootNotification response"))
            }
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_paused_log_and_clear() {
        let mut fx = fixture(EngineConfig::default());
        let peer = connected(&mut fx).await;

        // Queries are answered in command order, inbound CALLs in event order
        fx.handle.set_log_paused(true).await;
        fx.handle.frames().await;
        peer.send_text(r#"[3, "a", {}]"#).await;
        peer.send_text(r#"[2, "sync-1", "Ping", {}]"#).await;
        fx.inbound.recv().await.unwrap();

        fx.handle.set_log_paused(false).await;
        fx.handle.frames().await;
        peer.send_text(r#"[3, "b", {}]"#).await;
        peer.send_text(r#"[2, "sync-2", "Ping", {}]"#).await;
        fx.inbound.recv().await.unwrap();

        let filter = LogFilter {
            kind: Some(FrameKind::CallResult),
            ..Default::default()
        };
        let results = fx.handle.filtered_frames(filter).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].frame.id(), "b");

        fx.handle.clear_frames().await;
        assert!(fx.handle.frames().await.is_empty());
    }
}
