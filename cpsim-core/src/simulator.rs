//! Transaction simulator
//!
//! A session actor owns the [`TransactionState`] and is the only code that mutates
//! it. Starting a session runs Authorize then StartTransaction, and on success arms
//! two ticker tasks:
//!
//! - physical tick: perturbs power/current with bounded jitter and advances SoC
//! - telemetry tick: integrates energy over elapsed time and emits MeterValues
//!
//! Tickers never touch the state; they post `Tick` messages stamped with the epoch
//! they were armed in. Disarming aborts them and bumps the epoch, so a tick that was
//! already queued when a stop began is discarded instead of applied. The actor also
//! watches the connection's disconnect count and halts the session on every teardown.

use std::ops::Range;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SimulationConfig;
use crate::connection::ConnectionHandle;
use crate::error::{EngineError, SessionError};
use crate::ocpp::{
    Action, AuthorizationStatus, AuthorizeRequest, AuthorizeResponse, ChargePointErrorCode,
    ChargePointStatus, Measurand, MeterValue, MeterValuesRequest, SampledValue,
    StartTransactionRequest, StartTransactionResponse, StatusNotificationRequest, StopReason,
    StopTransactionRequest, UnitOfMeasure,
};
use crate::persistence::PersistEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionPhase {
    #[default]
    Idle,
    Preparing,
    Charging,
    Finishing,
}

/// Snapshot of the simulated charging session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionState {
    pub connector_id: u32,
    pub id_tag: String,
    pub transaction_id: Option<i64>,
    pub meter_start_wh: u64,
    /// Energy delivered in this session
    pub energy_wh: f64,
    pub soc_percent: f64,
    pub power_kw: f64,
    pub current_a: f64,
    pub phase: SessionPhase,
}

impl TransactionState {
    pub fn idle(soc_percent: f64) -> Self {
        Self {
            connector_id: 0,
            id_tag: String::new(),
            transaction_id: None,
            meter_start_wh: 0,
            energy_wh: 0.0,
            soc_percent: soc_percent.clamp(0.0, 100.0),
            power_kw: 0.0,
            current_a: 0.0,
            phase: SessionPhase::Idle,
        }
    }

    /// Energy register value reported to the central system
    pub fn meter_register_wh(&self) -> u64 {
        self.meter_start_wh + self.energy_wh.max(0.0).floor() as u64
    }

    pub fn is_active(&self) -> bool {
        self.phase != SessionPhase::Idle
    }
}

/// Battery and power model driven by the two ticks
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeCurve {
    pub target_power_kw: f64,
    pub nominal_current_a: f64,
    pub jitter_fraction: f64,
    pub soc_step_percent: f64,
}

impl ChargeCurve {
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            target_power_kw: config.target_power_kw.max(0.0),
            nominal_current_a: config.nominal_current_a.max(0.0),
            jitter_fraction: config.effective_jitter(),
            soc_step_percent: config.soc_step_percent.max(0.0),
        }
    }

    /// Perturb power and current around their targets and advance SoC
    pub fn physical_tick<R: Rng + ?Sized>(&self, state: &mut TransactionState, rng: &mut R) {
        let sample = if self.jitter_fraction > 0.0 {
            rng.gen_range(-self.jitter_fraction..=self.jitter_fraction)
        } else {
            0.0
        };

        state.power_kw = (self.target_power_kw * (1.0 + sample)).max(0.0);
        state.current_a = ((self.nominal_current_a * (1.0 + sample)) * 10.0).round().max(0.0) / 10.0;
        state.soc_percent = (state.soc_percent + self.soc_step_percent).clamp(0.0, 100.0);
    }

    /// Integrate energy at the current power over `elapsed`
    pub fn accumulate(&self, state: &mut TransactionState, elapsed: Duration) {
        let added_wh = state.power_kw.max(0.0) * elapsed.as_secs_f64() / 3600.0 * 1000.0;
        state.energy_wh += added_wh;
    }
}

/// MeterValues payload for the current state
pub fn meter_values_request(state: &TransactionState) -> MeterValuesRequest {
    let sample = |value: String, measurand: Measurand, unit: UnitOfMeasure| SampledValue {
        value,
        measurand: Some(measurand),
        unit: Some(unit),
    };

    MeterValuesRequest {
        connector_id: state.connector_id,
        transaction_id: state.transaction_id,
        meter_value: vec![MeterValue {
            timestamp: Utc::now(),
            sampled_value: vec![
                sample(
                    state.meter_register_wh().to_string(),
                    Measurand::EnergyActiveImportRegister,
                    UnitOfMeasure::Wh,
                ),
                sample(
                    format!("{:.0}", state.power_kw * 1000.0),
                    Measurand::PowerActiveImport,
                    UnitOfMeasure::W,
                ),
                sample(
                    format!("{:.1}", state.current_a),
                    Measurand::CurrentImport,
                    UnitOfMeasure::A,
                ),
                sample(
                    format!("{:.1}", state.soc_percent),
                    Measurand::SoC,
                    UnitOfMeasure::Percent,
                ),
            ],
        }],
    }
}

enum SessionCommand {
    Start {
        connector_id: u32,
        id_tag: String,
        reply: oneshot::Sender<Result<i64, SessionError>>,
    },
    Stop {
        transaction_id: Option<i64>,
        reason: StopReason,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickKind {
    Physical,
    Telemetry,
}

#[derive(Debug, Clone, Copy)]
struct Tick {
    kind: TickKind,
    epoch: u64,
}

/// Cloneable front end of the session actor
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<TransactionState>,
}

impl SessionHandle {
    /// Run Authorize and StartTransaction; returns the transaction id
    pub async fn start(&self, connector_id: u32, id_tag: impl Into<String>) -> Result<i64, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Start {
                connector_id,
                id_tag: id_tag.into(),
                reply,
            })
            .await
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Stop the active session
    pub async fn stop(&self, reason: StopReason) -> Result<(), SessionError> {
        self.stop_transaction(None, reason).await
    }

    /// Stop the active session if it carries `transaction_id` (any session when None)
    pub async fn stop_transaction(
        &self,
        transaction_id: Option<i64>,
        reason: StopReason,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Stop {
                transaction_id,
                reason,
                reply,
            })
            .await
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    pub fn state(&self) -> TransactionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TransactionState> {
        self.state.clone()
    }

    pub fn meter_values_request(&self) -> MeterValuesRequest {
        meter_values_request(&self.state.borrow())
    }
}

/// Start the session actor for one connector of a charge point
pub fn spawn_session(
    connection: ConnectionHandle,
    config: &SimulationConfig,
    initial_soc_percent: f64,
    persist: Option<mpsc::UnboundedSender<PersistEvent>>,
) -> (SessionHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (tick_tx, tick_rx) = mpsc::channel(4);
    let initial = TransactionState::idle(initial_soc_percent);
    let (state_tx, state_rx) = watch::channel(initial.clone());

    let mut disconnects = connection.watch_disconnects();
    disconnects.borrow_and_update();

    let actor = SessionActor {
        connection,
        curve: ChargeCurve::from_config(config),
        physical_tick: config.physical_tick,
        telemetry_tick: config.telemetry_tick,
        meter_start_wh: config.meter_start_wh.clone(),
        rng: StdRng::from_entropy(),
        state: initial,
        published: state_tx,
        epoch: 0,
        tickers: Vec::new(),
        tick_tx,
        last_accumulated: Instant::now(),
        persist,
    };
    let task = tokio::spawn(actor.run(command_rx, tick_rx, disconnects));

    (
        SessionHandle {
            commands: command_tx,
            state: state_rx,
        },
        task,
    )
}

struct SessionActor {
    connection: ConnectionHandle,
    curve: ChargeCurve,
    physical_tick: Duration,
    telemetry_tick: Duration,
    meter_start_wh: Range<u64>,
    rng: StdRng,
    state: TransactionState,
    published: watch::Sender<TransactionState>,
    epoch: u64,
    tickers: Vec<JoinHandle<()>>,
    tick_tx: mpsc::Sender<Tick>,
    last_accumulated: Instant,
    persist: Option<mpsc::UnboundedSender<PersistEvent>>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut ticks: mpsc::Receiver<Tick>,
        mut disconnects: watch::Receiver<u64>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }

                Some(tick) = ticks.recv() => self.handle_tick(tick).await,

                changed = disconnects.changed() => {
                    if changed.is_err() {
                        self.halt("connection actor stopped");
                        break;
                    }
                    disconnects.borrow_and_update();
                    self.halt("connection lost");
                }
            }
        }

        self.disarm();
        debug!("Session actor stopped");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Start {
                connector_id,
                id_tag,
                reply,
            } => {
                let result = self.start(connector_id, id_tag).await;
                let _ = reply.send(result);
            }
            SessionCommand::Stop {
                transaction_id,
                reason,
                reply,
            } => {
                let result = self.stop(transaction_id, reason).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn start(&mut self, connector_id: u32, id_tag: String) -> Result<i64, SessionError> {
        if self.state.is_active() {
            return Err(SessionError::AlreadyActive);
        }

        info!("Starting session on connector {} for {}", connector_id, id_tag);
        self.state = TransactionState {
            connector_id,
            id_tag: id_tag.clone(),
            phase: SessionPhase::Preparing,
            ..TransactionState::idle(self.state.soc_percent)
        };
        self.publish();

        match self.begin_transaction(connector_id, &id_tag).await {
            Ok(transaction_id) => {
                self.state.transaction_id = Some(transaction_id);
                self.state.power_kw = self.curve.target_power_kw;
                self.state.current_a = self.curve.nominal_current_a;
                self.state.phase = SessionPhase::Charging;
                self.arm();
                self.publish();
                info!("Transaction {} charging", transaction_id);
                self.notify_status(ChargePointStatus::Charging);
                Ok(transaction_id)
            }
            Err(e) => {
                warn!("Session start failed: {}", e);
                self.state.phase = SessionPhase::Idle;
                self.publish();
                Err(e)
            }
        }
    }

    async fn begin_transaction(&mut self, connector_id: u32, id_tag: &str) -> Result<i64, SessionError> {
        let auth: AuthorizeResponse = self
            .connection
            .call_typed(
                Action::Authorize,
                &AuthorizeRequest {
                    id_tag: id_tag.to_string(),
                },
            )
            .await
            .map_err(|e| SessionError::StartFailed(Box::new(e)))?;
        check_authorized(auth.id_tag_info.map(|info| info.status))?;

        let meter_start = if self.meter_start_wh.is_empty() {
            self.meter_start_wh.start
        } else {
            self.rng.gen_range(self.meter_start_wh.clone())
        };
        self.state.meter_start_wh = meter_start;

        let started: StartTransactionResponse = self
            .connection
            .call_typed(
                Action::StartTransaction,
                &StartTransactionRequest {
                    connector_id,
                    id_tag: id_tag.to_string(),
                    meter_start,
                    timestamp: Utc::now(),
                },
            )
            .await
            .map_err(|e| SessionError::StartFailed(Box::new(e)))?;
        check_authorized(started.id_tag_info.map(|info| info.status))?;

        Ok(match started.transaction_id {
            Some(id) => id,
            None => {
                let id = self.rng.gen_range(1..100_000);
                warn!("StartTransaction reply has no transactionId, using {}", id);
                id
            }
        })
    }

    async fn stop(&mut self, transaction_id: Option<i64>, reason: StopReason) -> Result<(), SessionError> {
        if self.state.phase != SessionPhase::Charging {
            return Err(SessionError::NoActiveSession);
        }
        let active = self.state.transaction_id.ok_or(SessionError::NoActiveSession)?;
        if let Some(requested) = transaction_id {
            if requested != active {
                return Err(SessionError::UnknownTransaction(requested));
            }
        }

        info!("Stopping transaction {} ({:?})", active, reason);
        self.state.phase = SessionPhase::Finishing;
        self.accumulate();
        self.publish();

        let request = StopTransactionRequest {
            transaction_id: active,
            id_tag: self.state.id_tag.clone(),
            meter_stop: self.state.meter_register_wh(),
            timestamp: Utc::now(),
            reason,
        };
        let result: Result<serde_json::Value, EngineError> = self
            .connection
            .call_typed(Action::StopTransaction, &request)
            .await;

        match result {
            Ok(_) => {
                self.disarm();
                self.state.transaction_id = None;
                self.state.power_kw = 0.0;
                self.state.current_a = 0.0;
                self.state.phase = SessionPhase::Idle;
                self.publish();
                self.save_soc();
                info!("Transaction {} stopped at {} Wh", active, request.meter_stop);
                self.notify_status(ChargePointStatus::Available);
                Ok(())
            }
            Err(e) => {
                warn!("StopTransaction for {} failed: {}", active, e);
                // Timers were never disarmed; the session keeps charging
                self.state.phase = SessionPhase::Charging;
                self.publish();
                Err(SessionError::StopFailed(Box::new(e)))
            }
        }
    }

    async fn handle_tick(&mut self, tick: Tick) {
        if tick.epoch != self.epoch || self.state.phase != SessionPhase::Charging {
            return;
        }

        match tick.kind {
            TickKind::Physical => {
                self.curve.physical_tick(&mut self.state, &mut self.rng);
                self.publish();
            }
            TickKind::Telemetry => {
                self.accumulate();
                self.publish();
                self.send_meter_values();

                if self.state.soc_percent >= 100.0 {
                    info!("Battery full, stopping session");
                    if let Err(e) = self.stop(None, StopReason::EVDisconnected).await {
                        warn!("Automatic stop failed: {}", e);
                    }
                }
            }
        }
    }

    /// Cancel the session without protocol traffic
    fn halt(&mut self, why: &str) {
        if !self.state.is_active() && self.tickers.is_empty() {
            return;
        }

        warn!(
            "Halting session {:?} on connector {}: {}",
            self.state.transaction_id, self.state.connector_id, why
        );
        self.disarm();
        self.state.transaction_id = None;
        self.state.power_kw = 0.0;
        self.state.current_a = 0.0;
        self.state.phase = SessionPhase::Idle;
        self.publish();
        self.save_soc();
    }

    fn arm(&mut self) {
        self.disarm();
        self.last_accumulated = Instant::now();
        self.tickers.push(tokio::spawn(run_ticker(
            self.physical_tick,
            TickKind::Physical,
            self.epoch,
            self.tick_tx.clone(),
        )));
        self.tickers.push(tokio::spawn(run_ticker(
            self.telemetry_tick,
            TickKind::Telemetry,
            self.epoch,
            self.tick_tx.clone(),
        )));
    }

    fn disarm(&mut self) {
        for ticker in self.tickers.drain(..) {
            ticker.abort();
        }
        self.epoch += 1;
    }

    fn accumulate(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_accumulated);
        self.last_accumulated = now;
        self.curve.accumulate(&mut self.state, elapsed);
    }

    fn publish(&self) {
        self.published.send_replace(self.state.clone());
    }

    fn save_soc(&self) {
        if let Some(persist) = &self.persist {
            let _ = persist.send(PersistEvent::Soc(self.state.soc_percent));
        }
    }

    fn send_meter_values(&self) {
        let request = meter_values_request(&self.state);
        let connection = self.connection.clone();
        tokio::spawn(async move {
            let result: Result<serde_json::Value, EngineError> =
                connection.call_typed(Action::MeterValues, &request).await;
            if let Err(e) = result {
                warn!("MeterValues failed: {}", e);
            }
        });
    }

    fn notify_status(&self, status: ChargePointStatus) {
        let request = StatusNotificationRequest {
            connector_id: self.state.connector_id,
            error_code: ChargePointErrorCode::NoError,
            status,
            timestamp: Utc::now(),
        };
        let connection = self.connection.clone();
        tokio::spawn(async move {
            let result: Result<serde_json::Value, EngineError> =
                connection.call_typed(Action::StatusNotification, &request).await;
            if let Err(e) = result {
                warn!("StatusNotification({:?}) failed: {}", status, e);
            }
        });
    }
}

fn check_authorized(status: Option<AuthorizationStatus>) -> Result<(), SessionError> {
    match status {
        None | Some(AuthorizationStatus::Accepted) => Ok(()),
        Some(status) => Err(SessionError::NotAuthorized(status)),
    }
}

async fn run_ticker(period: Duration, kind: TickKind, epoch: u64, ticks: mpsc::Sender<Tick>) {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if ticks.send(Tick { kind, epoch }).await.is_err() {
            break;
        }
    }
}
