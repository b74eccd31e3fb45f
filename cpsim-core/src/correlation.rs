//! Request/response correlation
//!
//! Every CALL this engine sends is registered here under its message id together
//! with the sending half of a oneshot channel. The first matching CALLRESULT or
//! CALLERROR removes the entry and completes the channel, so a continuation can run
//! at most once; closing the connection or exceeding the request timeout completes
//! whatever is left. The table is owned by the connection actor and never shared.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::ocpp::ErrorCode;

/// How an outstanding CALL ended without a CALLRESULT
#[derive(Debug, Clone, PartialEq)]
pub enum CallFailure {
    /// CALLERROR reply from the central system
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },
    /// The connection went away before a reply arrived
    ConnectionClosed,
    /// No reply within the configured request timeout
    Timeout { action: String },
}

impl From<CallFailure> for EngineError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Remote {
                code,
                description,
                details,
            } => EngineError::Remote {
                code,
                description,
                details,
            },
            CallFailure::ConnectionClosed => EngineError::ConnectionClosed,
            CallFailure::Timeout { action } => EngineError::RequestTimeout { action },
        }
    }
}

pub type CallOutcome = Result<Value, CallFailure>;

/// Outstanding request awaiting its reply
#[derive(Debug)]
pub struct PendingRequest {
    pub id: String,
    pub action: String,
    pub issued_at: Instant,
    reply_tx: oneshot::Sender<CallOutcome>,
}

impl PendingRequest {
    fn complete(self, outcome: CallOutcome) {
        if self.reply_tx.send(outcome).is_err() {
            debug!("Caller of {} ({}) no longer waiting", self.action, self.id);
        }
    }
}

/// Receiving side of a registered request
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    action: String,
    rx: oneshot::Receiver<CallOutcome>,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// Wait for the reply payload
    pub async fn wait(self) -> Result<Value, EngineError> {
        match self.rx.await {
            Ok(outcome) => outcome.map_err(EngineError::from),
            // The table was dropped with the entry still in it
            Err(_) => Err(EngineError::ConnectionClosed),
        }
    }
}

/// Per-connection map from message id to outstanding request
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<String, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request; the id must not already be outstanding
    pub fn register(
        &mut self,
        id: impl Into<String>,
        action: impl Into<String>,
    ) -> Result<PendingReply, EngineError> {
        let id = id.into();
        if self.pending.contains_key(&id) {
            return Err(EngineError::DuplicateId(id));
        }

        let action = action.into();
        let (reply_tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingRequest {
                id: id.clone(),
                action: action.clone(),
                issued_at: Instant::now(),
                reply_tx,
            },
        );

        Ok(PendingReply { id, action, rx })
    }

    /// Complete a request with its CALLRESULT payload.
    ///
    /// Returns false when no request with this id is outstanding.
    pub fn resolve(&mut self, id: &str, payload: Value) -> bool {
        match self.pending.remove(id) {
            Some(request) => {
                debug!("Resolved {} ({})", request.action, id);
                request.complete(Ok(payload));
                true
            }
            None => {
                warn!("CALLRESULT for unknown message id {}", id);
                false
            }
        }
    }

    /// Complete a request with a CALLERROR.
    ///
    /// Returns false when no request with this id is outstanding.
    pub fn reject(&mut self, id: &str, code: ErrorCode, description: String, details: Value) -> bool {
        match self.pending.remove(id) {
            Some(request) => {
                debug!("Rejected {} ({}): {} {}", request.action, id, code, description);
                request.complete(Err(CallFailure::Remote {
                    code,
                    description,
                    details,
                }));
                true
            }
            None => {
                warn!("CALLERROR for unknown message id {}", id);
                false
            }
        }
    }

    /// Fail every outstanding request with `ConnectionClosed`
    pub fn drain_on_disconnect(&mut self) -> usize {
        let count = self.pending.len();
        for (_, request) in self.pending.drain() {
            request.complete(Err(CallFailure::ConnectionClosed));
        }
        if count > 0 {
            warn!("Connection closed with {} request(s) outstanding", count);
        }
        count
    }

    /// Fail every request issued at least `timeout` before `now`
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .pending
            .values()
            .filter(|request| now.saturating_duration_since(request.issued_at) >= timeout)
            .map(|request| request.id.clone())
            .collect();

        for id in &expired {
            if let Some(request) = self.pending.remove(id) {
                warn!("{} ({}) timed out after {:?}", request.action, id, timeout);
                let action = request.action.clone();
                request.complete(Err(CallFailure::Timeout { action }));
            }
        }

        expired
    }

    /// Drop a registration without completing it (used when the write itself failed)
    pub fn forget(&mut self, id: &str) -> Option<PendingRequest> {
        self.pending.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_once() {
        let mut table = CorrelationTable::new();
        let reply = table.register("m1", "Heartbeat").unwrap();

        assert!(table.resolve("m1", json!({"currentTime": "now"})));
        assert!(!table.resolve("m1", json!({"second": true})));
        assert!(!table.reject("m1", ErrorCode::GenericError, String::new(), json!({})));

        let payload = reply.wait().await.unwrap();
        assert_eq!(payload["currentTime"], "now");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_reject_carries_code() {
        let mut table = CorrelationTable::new();
        let reply = table.register("m2", "StartTransaction").unwrap();

        assert!(table.reject(
            "m2",
            ErrorCode::InternalError,
            "boom".into(),
            json!({})
        ));

        match reply.wait().await {
            Err(EngineError::Remote { code, description, .. }) => {
                assert_eq!(code, ErrorCode::InternalError);
                assert_eq!(description, "boom");
            }
            other => panic!("Expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_id() {
        let mut table = CorrelationTable::new();
        let _reply = table.register("dup", "Heartbeat").unwrap();
        assert!(matches!(
            table.register("dup", "Heartbeat"),
            Err(EngineError::DuplicateId(id)) if id == "dup"
        ));
    }

    #[tokio::test]
    async fn test_id_reuse_after_resolution() {
        let mut table = CorrelationTable::new();
        let first = table.register("reuse", "Heartbeat").unwrap();
        table.resolve("reuse", json!({}));
        first.wait().await.unwrap();

        assert!(table.register("reuse", "Heartbeat").is_ok());
    }

    #[tokio::test]
    async fn test_drain_rejects_everything() {
        let mut table = CorrelationTable::new();
        let replies: Vec<_> = (0..3)
            .map(|i| table.register(format!("m{}", i), "MeterValues").unwrap())
            .collect();

        assert_eq!(table.drain_on_disconnect(), 3);
        assert!(table.is_empty());

        for reply in replies {
            assert!(matches!(reply.wait().await, Err(EngineError::ConnectionClosed)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_only_old_requests() {
        let mut table = CorrelationTable::new();
        let old = table.register("old", "Authorize").unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        let _fresh = table.register("fresh", "Heartbeat").unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let expired = table.expire(Instant::now(), Duration::from_secs(30));
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(table.contains("fresh"));

        match old.wait().await {
            Err(EngineError::RequestTimeout { action }) => assert_eq!(action, "Authorize"),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }
}
