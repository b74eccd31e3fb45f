//! Inbound CALL dispatch
//!
//! CALLs from the central system are routed by action name to a [`Handler`]. The
//! registry starts with the built-in handlers and accepts more at build time. Actions
//! without a handler are answered with a `NotImplemented` CALLERROR; the connection
//! stays up.
//!
//! The dispatcher task runs handlers one at a time in arrival order. A handler may
//! issue its own CALLs (RemoteStartTransaction runs Authorize and StartTransaction
//! before answering); replies to those keep flowing because the connection actor
//! is a separate task.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::connection::{ConnectionHandle, InboundCall};
use crate::ocpp::{
    Action, ChangeConfigurationRequest, ErrorCode, Frame, GetConfigurationRequest,
    GetConfigurationResponse, KeyValue, RemoteStartTransactionRequest,
    RemoteStopTransactionRequest, StatusResponse, StopReason,
};
use crate::simulator::SessionHandle;

/// Id tag used when RemoteStartTransaction does not name one
pub const REMOTE_ID_TAG: &str = "REMOTE";

/// What a handler answers with
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerReply {
    Result(Value),
    Error { code: ErrorCode, description: String },
}

impl HandlerReply {
    pub fn result<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_value(payload) {
            Ok(value) => HandlerReply::Result(value),
            Err(e) => HandlerReply::Error {
                code: ErrorCode::InternalError,
                description: e.to_string(),
            },
        }
    }

    pub fn into_frame(self, id: impl Into<String>) -> Frame {
        match self {
            HandlerReply::Result(payload) => Frame::result(id, payload),
            HandlerReply::Error { code, description } => Frame::error(id, code, description),
        }
    }
}

/// Deserialize a CALL payload, or the FormationViolation reply to send instead
pub fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T, HandlerReply> {
    // OCPP-J peers sometimes send null for an empty payload
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| HandlerReply::Error {
        code: ErrorCode::FormationViolation,
        description: e.to_string(),
    })
}

/// Configuration keys reported by GetConfiguration
#[derive(Debug, Default)]
pub struct ConfigurationCatalog {
    entries: RwLock<BTreeMap<String, KeyValue>>,
}

impl ConfigurationCatalog {
    /// Catalog with `HeartbeatInterval`, `MeterValueSampleInterval` and `NumberOfConnectors`
    pub fn new(heartbeat_secs: u64, sample_secs: u64, connectors: u32) -> Self {
        let catalog = Self::default();
        catalog.insert("HeartbeatInterval", heartbeat_secs.to_string(), false);
        catalog.insert("MeterValueSampleInterval", sample_secs.to_string(), false);
        catalog.insert("NumberOfConnectors", connectors.to_string(), true);
        catalog
    }

    pub fn insert(&self, key: &str, value: String, readonly: bool) {
        self.entries.write().insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                readonly,
                value: Some(value),
            },
        );
    }

    /// Update a writable key; false for readonly or unknown keys
    pub fn set(&self, key: &str, value: &str) -> bool {
        match self.entries.write().get_mut(key) {
            Some(entry) if !entry.readonly => {
                entry.value = Some(value.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).and_then(|e| e.value.clone())
    }

    /// All entries, or only the requested ones; unknown keys are left out
    pub fn select(&self, keys: Option<&[String]>) -> Vec<KeyValue> {
        let entries = self.entries.read();
        match keys {
            Some(keys) if !keys.is_empty() => entries
                .values()
                .filter(|entry| keys.contains(&entry.key))
                .cloned()
                .collect(),
            _ => entries.values().cloned().collect(),
        }
    }
}

/// Engine services available to handlers for one inbound CALL
#[derive(Clone)]
pub struct HandlerContext {
    pub call_id: String,
    pub session: SessionHandle,
    pub runtime: Arc<RwLock<RuntimeConfig>>,
    pub catalog: Arc<ConfigurationCatalog>,
}

pub trait Handler: Send + Sync {
    /// Action name this handler answers
    fn action(&self) -> &str;

    fn handle<'a>(&'a self, payload: Value, ctx: &'a HandlerContext) -> BoxFuture<'a, HandlerReply>;
}

/// Handlers keyed by action name
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RemoteStartTransactionHandler));
        registry.register(Arc::new(RemoteStopTransactionHandler));
        registry.register(Arc::new(AcceptHandler(Action::Reset)));
        registry.register(Arc::new(AcceptHandler(Action::ChangeAvailability)));
        registry.register(Arc::new(ChangeConfigurationHandler));
        registry.register(Arc::new(GetConfigurationHandler));
        registry
    }

    /// Add a handler; returns the one it replaces, if any
    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Option<Arc<dyn Handler>> {
        self.handlers.insert(handler.action().to_string(), handler)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<_> = self.handlers.keys().cloned().collect();
        actions.sort();
        actions
    }

    /// Run the handler for `call` and build the reply frame
    pub async fn dispatch(&self, call: InboundCall, ctx: &HandlerContext) -> Frame {
        let handler = match self.handlers.get(&call.action) {
            Some(handler) => handler.clone(),
            None => {
                let description = match call.action.parse::<Action>() {
                    Ok(action) => format!("Action {} not handled by this charge point", action),
                    Err(unknown) => unknown.to_string(),
                };
                warn!("No handler for {} ({}): {}", call.action, call.id, description);
                return Frame::error(call.id, ErrorCode::NotImplemented, description);
            }
        };

        debug!("Dispatching {} ({})", call.action, call.id);
        let reply = handler.handle(call.payload, ctx).await;
        if let HandlerReply::Error { code, description } = &reply {
            warn!("{} ({}) answered with {}: {}", call.action, call.id, code, description);
        }
        reply.into_frame(call.id)
    }
}

/// Start the dispatcher; it ends when the connection stops forwarding CALLs
pub fn spawn_dispatcher(
    registry: Arc<HandlerRegistry>,
    base: HandlerContext,
    connection: ConnectionHandle,
    mut inbound: mpsc::UnboundedReceiver<InboundCall>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(call) = inbound.recv().await {
            let ctx = HandlerContext {
                call_id: call.id.clone(),
                ..base.clone()
            };
            let frame = registry.dispatch(call, &ctx).await;
            if let Err(e) = connection.reply(frame).await {
                warn!("Failed to reply to {}: {}", ctx.call_id, e);
            }
        }
        debug!("Dispatcher stopped");
    })
}

// ============================================================================
// Built-in handlers
// ============================================================================

fn status_reply(accepted: bool) -> HandlerReply {
    if accepted {
        HandlerReply::result(&StatusResponse::accepted())
    } else {
        HandlerReply::result(&StatusResponse::rejected())
    }
}

/// Starts a session through the same flow as a local start
pub struct RemoteStartTransactionHandler;

impl Handler for RemoteStartTransactionHandler {
    fn action(&self) -> &str {
        Action::RemoteStartTransaction.as_str()
    }

    fn handle<'a>(&'a self, payload: Value, ctx: &'a HandlerContext) -> BoxFuture<'a, HandlerReply> {
        Box::pin(async move {
            let request: RemoteStartTransactionRequest = match parse_payload(payload) {
                Ok(request) => request,
                Err(reply) => return reply,
            };

            let connector_id = request
                .connector_id
                .unwrap_or_else(|| ctx.runtime.read().connector_id);
            let id_tag = request
                .id_tag
                .filter(|tag| !tag.trim().is_empty())
                .unwrap_or_else(|| REMOTE_ID_TAG.to_string());

            match ctx.session.start(connector_id, id_tag).await {
                Ok(transaction_id) => {
                    info!("Remote start accepted, transaction {}", transaction_id);
                    status_reply(true)
                }
                Err(e) => {
                    warn!("RemoteStartTransaction ({}) rejected: {}", ctx.call_id, e);
                    status_reply(false)
                }
            }
        })
    }
}

/// Stops the active session
pub struct RemoteStopTransactionHandler;

impl Handler for RemoteStopTransactionHandler {
    fn action(&self) -> &str {
        Action::RemoteStopTransaction.as_str()
    }

    fn handle<'a>(&'a self, payload: Value, ctx: &'a HandlerContext) -> BoxFuture<'a, HandlerReply> {
        Box::pin(async move {
            let request: RemoteStopTransactionRequest = match parse_payload(payload) {
                Ok(request) => request,
                Err(reply) => return reply,
            };

            match ctx
                .session
                .stop_transaction(request.transaction_id, StopReason::Remote)
                .await
            {
                Ok(()) => status_reply(true),
                Err(e) => {
                    warn!("RemoteStopTransaction ({}) rejected: {}", ctx.call_id, e);
                    status_reply(false)
                }
            }
        })
    }
}

/// Accepts the request without acting on it
pub struct AcceptHandler(pub Action);

impl Handler for AcceptHandler {
    fn action(&self) -> &str {
        self.0.as_str()
    }

    fn handle<'a>(&'a self, _payload: Value, _ctx: &'a HandlerContext) -> BoxFuture<'a, HandlerReply> {
        Box::pin(async move { status_reply(true) })
    }
}

/// Always accepts; writable catalog keys take the new value
pub struct ChangeConfigurationHandler;

impl Handler for ChangeConfigurationHandler {
    fn action(&self) -> &str {
        Action::ChangeConfiguration.as_str()
    }

    fn handle<'a>(&'a self, payload: Value, ctx: &'a HandlerContext) -> BoxFuture<'a, HandlerReply> {
        Box::pin(async move {
            let request: ChangeConfigurationRequest = match parse_payload(payload) {
                Ok(request) => request,
                Err(reply) => return reply,
            };
            if !ctx.catalog.set(&request.key, &request.value) {
                debug!("ChangeConfiguration of {} not stored", request.key);
            }
            status_reply(true)
        })
    }
}

pub struct GetConfigurationHandler;

impl Handler for GetConfigurationHandler {
    fn action(&self) -> &str {
        Action::GetConfiguration.as_str()
    }

    fn handle<'a>(&'a self, payload: Value, ctx: &'a HandlerContext) -> BoxFuture<'a, HandlerReply> {
        Box::pin(async move {
            let request: GetConfigurationRequest = match parse_payload(payload) {
                Ok(request) => request,
                Err(reply) => return reply,
            };
            HandlerReply::result(&GetConfigurationResponse {
                configuration_key: ctx.catalog.select(request.key.as_deref()),
                unknown_key: Vec::new(),
            })
        })
    }
}
