//! Charge point engine
//!
//! [`ChargePoint`] wires one identity's actors together (connection, session
//! simulator, dispatcher, persister, heartbeat) and exposes the local command surface.
//! It is a cheap cloneable handle; the tasks are aborted when the last clone drops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ChargePointConfig, EngineConfig, RuntimeConfig, SimulationConfig, SimulatorConfig};
use crate::connection::{spawn_connection, ConnectionHandle, ConnectionState};
use crate::dispatch::{spawn_dispatcher, ConfigurationCatalog, Handler, HandlerContext, HandlerRegistry};
use crate::error::{EngineError, SessionError};
use crate::frame_log::{self, FrameLog, LogEntry, LogFilter};
use crate::ocpp::{
    Action, AuthorizeRequest, AuthorizeResponse, BootNotificationRequest,
    BootNotificationResponse, ChargePointErrorCode, ChargePointStatus, HeartbeatRequest,
    StatusNotificationRequest, StopReason,
};
use crate::persistence::{spawn_persister, PersistEvent, PersistedState, StateStore};
use crate::simulator::{spawn_session, SessionHandle, TransactionState};
use crate::transport::{Transport, WsTransport};

/// Builds a [`ChargePoint`]
pub struct ChargePointBuilder {
    config: SimulatorConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn StateStore>>,
    handlers: HandlerRegistry,
    keep_config: bool,
}

impl ChargePointBuilder {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            transport: None,
            store: None,
            handlers: HandlerRegistry::with_builtin(),
            keep_config: false,
        }
    }

    /// Transport used to reach the central system (WebSocket by default)
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Store to restore from at build time and save to afterwards
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add or replace an inbound CALL handler
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.register(handler);
        self
    }

    /// Replace the whole handler registry
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Restore only frames and SoC from the store; the builder's config wins
    pub fn keep_config(mut self) -> Self {
        self.keep_config = true;
        self
    }

    /// Restore persisted state and start the engine tasks
    pub async fn build(self) -> Result<ChargePoint, EngineError> {
        let ChargePointBuilder {
            config,
            transport,
            store,
            handlers,
            keep_config,
        } = self;

        let SimulatorConfig {
            mut charge_point,
            mut runtime,
            simulation,
            engine,
        } = config;

        let mut soc_percent = simulation.initial_soc_percent;
        let mut frames = FrameLog::new(engine.frame_log_capacity);

        if let Some(store) = &store {
            match load(store.clone(), charge_point.effective_cp_id().to_string()).await {
                Ok(Some(saved)) => {
                    info!(
                        "Restored state for {} ({} frames)",
                        charge_point.effective_cp_id(),
                        saved.frames.len()
                    );
                    if !keep_config {
                        charge_point = saved.config;
                        runtime = saved.runtime;
                    }
                    if let Some(soc) = saved.soc_percent {
                        soc_percent = soc;
                    }
                    frames.restore(saved.frames);
                }
                Ok(None) => debug!("No saved state for {}", charge_point.effective_cp_id()),
                Err(e) => warn!("Ignoring saved state: {}", e),
            }
        }

        let persist = store.map(|store| {
            let initial = PersistedState {
                config: charge_point.clone(),
                runtime: runtime.clone(),
                frames: frames.snapshot(),
                soc_percent: Some(soc_percent),
            };
            spawn_persister(store, initial, engine.frame_log_capacity)
        });
        let (persist_tx, persist_task) = match persist {
            Some((tx, task)) => (Some(tx), Some(task)),
            None => (None, None),
        };

        let transport: Arc<dyn Transport> = match transport {
            Some(transport) => transport,
            None => Arc::new(WsTransport::new()),
        };
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (connection, connection_task) =
            spawn_connection(transport, &engine, frames, inbound_tx, persist_tx.clone());
        let (session, session_task) =
            spawn_session(connection.clone(), &simulation, soc_percent, persist_tx.clone());

        let catalog = Arc::new(ConfigurationCatalog::new(
            engine.default_heartbeat_interval.as_secs(),
            simulation.telemetry_tick.as_secs().max(1),
            1,
        ));
        let runtime = Arc::new(RwLock::new(runtime));

        let dispatcher_task = spawn_dispatcher(
            Arc::new(handlers),
            HandlerContext {
                call_id: String::new(),
                session: session.clone(),
                runtime: runtime.clone(),
                catalog: catalog.clone(),
            },
            connection.clone(),
            inbound_rx,
        );

        let mut tasks = vec![connection_task, session_task, dispatcher_task];
        tasks.extend(persist_task);

        Ok(ChargePoint {
            inner: Arc::new(Inner {
                config: RwLock::new(charge_point),
                runtime,
                simulation,
                engine,
                connection,
                session,
                catalog,
                persist: persist_tx,
                heartbeat: Mutex::new(None),
                tasks,
            }),
        })
    }
}

async fn load(store: Arc<dyn StateStore>, cp_id: String) -> Result<Option<PersistedState>, EngineError> {
    tokio::task::spawn_blocking(move || store.load_state(&cp_id))
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?
}

struct Inner {
    config: RwLock<ChargePointConfig>,
    runtime: Arc<RwLock<RuntimeConfig>>,
    simulation: SimulationConfig,
    engine: EngineConfig,
    connection: ConnectionHandle,
    session: SessionHandle,
    catalog: Arc<ConfigurationCatalog>,
    persist: Option<mpsc::UnboundedSender<PersistEvent>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            heartbeat.abort();
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// One simulated charge point
#[derive(Clone)]
pub struct ChargePoint {
    inner: Arc<Inner>,
}

impl ChargePoint {
    pub fn builder(config: SimulatorConfig) -> ChargePointBuilder {
        ChargePointBuilder::new(config)
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Open the connection to the configured endpoint
    pub async fn connect(&self) -> Result<(), EngineError> {
        let (url, subprotocol) = {
            let config = self.inner.config.read();
            (config.endpoint_url()?, config.protocol.as_str())
        };
        self.inner.connection.connect(url, subprotocol).await
    }

    pub async fn disconnect(&self) {
        self.inner.connection.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch()
    }

    // ------------------------------------------------------------------
    // Local actions
    // ------------------------------------------------------------------

    /// Send BootNotification and (re)arm the heartbeat with the granted interval
    pub async fn boot_notification(&self) -> Result<BootNotificationResponse, EngineError> {
        let request = {
            let config = self.inner.config.read();
            BootNotificationRequest {
                charge_point_vendor: config.vendor.clone(),
                charge_point_model: config.model.clone(),
                firmware_version: config.firmware_version.clone(),
            }
        };

        let response: BootNotificationResponse = self
            .inner
            .connection
            .call_typed(Action::BootNotification, &request)
            .await?;

        let period = self.inner.engine.heartbeat_interval(response.interval);
        info!("Boot {:?}, heartbeat every {:?}", response.status, period);
        self.inner
            .catalog
            .insert("HeartbeatInterval", period.as_secs().to_string(), false);
        self.arm_heartbeat(period);

        Ok(response)
    }

    fn arm_heartbeat(&self, period: Duration) {
        let task = tokio::spawn(run_heartbeat(self.inner.connection.clone(), period));
        if let Some(previous) = self.inner.heartbeat.lock().replace(task) {
            previous.abort();
        }
    }

    pub async fn send_heartbeat(&self) -> Result<Value, EngineError> {
        self.inner
            .connection
            .call_typed(Action::Heartbeat, &HeartbeatRequest {})
            .await
    }

    /// Authorize `id_tag`, or the runtime id tag when None
    pub async fn authorize(&self, id_tag: Option<&str>) -> Result<AuthorizeResponse, EngineError> {
        let id_tag = match id_tag {
            Some(tag) => tag.to_string(),
            None => self.inner.runtime.read().id_tag.clone(),
        };
        self.inner
            .connection
            .call_typed(Action::Authorize, &AuthorizeRequest { id_tag })
            .await
    }

    /// StatusNotification for the runtime connector
    pub async fn send_status_notification(
        &self,
        status: ChargePointStatus,
        error_code: ChargePointErrorCode,
    ) -> Result<Value, EngineError> {
        let request = StatusNotificationRequest {
            connector_id: self.inner.runtime.read().connector_id,
            error_code,
            status,
            timestamp: Utc::now(),
        };
        self.inner
            .connection
            .call_typed(Action::StatusNotification, &request)
            .await
    }

    /// MeterValues with the current register, outside the telemetry cadence
    pub async fn send_meter_values(&self) -> Result<Value, EngineError> {
        let mut request = self.inner.session.meter_values_request();
        if request.connector_id == 0 {
            request.connector_id = self.inner.runtime.read().connector_id;
        }
        self.inner
            .connection
            .call_typed(Action::MeterValues, &request)
            .await
    }

    /// Any other CALL
    pub async fn call(&self, action: &str, payload: Value) -> Result<Value, EngineError> {
        self.inner.connection.call(action, payload).await
    }

    /// Start a session on the runtime connector with the runtime id tag
    pub async fn start_session(&self) -> Result<i64, SessionError> {
        let (connector_id, id_tag) = {
            let runtime = self.inner.runtime.read();
            (runtime.connector_id, runtime.id_tag.clone())
        };
        self.inner.session.start(connector_id, id_tag).await
    }

    pub async fn start_session_with(&self, connector_id: u32, id_tag: &str) -> Result<i64, SessionError> {
        self.inner.session.start(connector_id, id_tag).await
    }

    pub async fn stop_session(&self) -> Result<(), SessionError> {
        self.inner.session.stop(StopReason::Local).await
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.inner.session.state()
    }

    pub fn watch_transaction(&self) -> watch::Receiver<TransactionState> {
        self.inner.session.watch()
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn config(&self) -> ChargePointConfig {
        self.inner.config.read().clone()
    }

    pub fn runtime(&self) -> RuntimeConfig {
        self.inner.runtime.read().clone()
    }

    pub fn simulation(&self) -> &SimulationConfig {
        &self.inner.simulation
    }

    pub fn cp_id(&self) -> String {
        self.inner.config.read().effective_cp_id().to_string()
    }

    /// Edit the connection config; takes effect at the next connect
    pub fn update_config(&self, edit: impl FnOnce(&mut ChargePointConfig)) {
        let updated = {
            let mut config = self.inner.config.write();
            edit(&mut config);
            config.clone()
        };
        self.persist(PersistEvent::Config(updated));
    }

    pub fn update_runtime(&self, edit: impl FnOnce(&mut RuntimeConfig)) {
        let updated = {
            let mut runtime = self.inner.runtime.write();
            edit(&mut runtime);
            runtime.clone()
        };
        self.persist(PersistEvent::Runtime(updated));
    }

    /// Current value of a GetConfiguration key
    pub fn configuration_value(&self, key: &str) -> Option<String> {
        self.inner.catalog.get(key)
    }

    // ------------------------------------------------------------------
    // Frame log
    // ------------------------------------------------------------------

    /// Logged frames, most recent first
    pub async fn frame_log(&self) -> Vec<LogEntry> {
        self.inner.connection.frames().await
    }

    pub async fn filtered_frames(&self, filter: LogFilter) -> Vec<LogEntry> {
        self.inner.connection.filtered_frames(filter).await
    }

    pub async fn clear_frames(&self) {
        self.inner.connection.clear_frames().await;
    }

    pub async fn set_log_paused(&self, paused: bool) {
        self.inner.connection.set_log_paused(paused).await;
    }

    /// Frame log as pretty JSON
    pub async fn export_frames(&self) -> Result<String, EngineError> {
        Ok(frame_log::export(&self.frame_log().await)?)
    }

    fn persist(&self, event: PersistEvent) {
        if let Some(persist) = &self.inner.persist {
            let _ = persist.send(event);
        }
    }
}

/// Send Heartbeat every `period` until the connection leaves `Connected`
async fn run_heartbeat(connection: ConnectionHandle, period: Duration) {
    let mut disconnects = connection.watch_disconnects();
    disconnects.borrow_and_update();
    if connection.state() != ConnectionState::Connected {
        return;
    }

    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let result: Result<Value, EngineError> =
                    connection.call_typed(Action::Heartbeat, &HeartbeatRequest {}).await;
                if let Err(e) = result {
                    warn!("Heartbeat failed: {}", e);
                }
            }
            _ = disconnects.changed() => {
                debug!("Heartbeat stopped");
                break;
            }
        }
    }
}
