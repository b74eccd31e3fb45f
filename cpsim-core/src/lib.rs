//! # Charge Point Simulator Engine
//!
//! OCPP-J 1.6 charge point simulator: connects to a central system (CSMS) over
//! WebSocket, issues local actions, answers remote commands and runs a simulated
//! charging session that produces meter values.
//!
//! ## Architecture
//!
//! ```text
//! OCPP CSMS (Backend)
//!       │ WebSocket, subprotocol ocpp1.6
//!       ▼
//! ┌──────────────────────────────────────────────┐
//! │  Transport (WsTransport / MemoryTransport)   │
//! └─────────────┬────────────────────────────────┘
//!               │ TransportEvent / TransportCommand
//!               ▼
//! ┌──────────────────────────────────────────────┐
//! │  Connection actor                            │
//! │  ┌───────────┐ ┌─────────────┐ ┌───────────┐ │
//! │  │ Codec     │ │ Correlation │ │ Frame log │ │
//! │  └───────────┘ └─────────────┘ └───────────┘ │
//! └──────┬───────────────────────────▲───────────┘
//!        │ inbound CALLs             │ calls / replies
//!        ▼                           │
//! ┌──────────────┐   remote    ┌─────┴──────────┐
//! │  Dispatcher  │────────────►│ Session actor  │
//! │  (handlers)  │  start/stop │ (transaction,  │
//! └──────────────┘             │  tickers)      │
//!                              └────────────────┘
//!               all state changes ──► Persister ──► StateStore
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use cpsim_core::{ChargePoint, SimulatorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SimulatorConfig::new("CP-001", "ws://localhost:9000/ocpp");
//!
//!     let cp = ChargePoint::builder(config).build().await?;
//!     cp.connect().await?;
//!     cp.boot_notification().await?;
//!
//!     let transaction_id = cp.start_session().await?;
//!     println!("charging, transaction {}", transaction_id);
//!     cp.stop_session().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Remote commands
//!
//! | Action | Reply |
//! |--------|-------|
//! | RemoteStartTransaction | Accepted, then starts a session |
//! | RemoteStopTransaction | Accepted, then stops the session |
//! | Reset / ChangeAvailability | Accepted |
//! | ChangeConfiguration | Accepted |
//! | GetConfiguration | configuration catalog |
//! | anything else | CALLERROR NotImplemented |

pub mod charge_point;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod frame_log;
pub mod ocpp;
pub mod persistence;
pub mod registry;
pub mod simulator;
pub mod transport;

pub use charge_point::{ChargePoint, ChargePointBuilder};
pub use config::{
    ChargePointConfig, EngineConfig, Protocol, RuntimeConfig, SimulationConfig, SimulatorConfig,
};
pub use connection::{ConnectionHandle, ConnectionState, InboundCall};
pub use dispatch::{Handler, HandlerContext, HandlerRegistry, HandlerReply};
pub use error::{EngineError, SessionError};
pub use frame_log::{Direction, FrameLog, LogEntry, LogFilter};
pub use persistence::{JsonFileStore, MemoryStore, PersistedState, StateStore};
pub use registry::ChargePointRegistry;
pub use simulator::{SessionPhase, TransactionState};
pub use transport::{MemoryTransport, Transport, WsTransport};

// Re-export key protocol types
pub use ocpp::{Action, ErrorCode, Frame, FrameKind};
