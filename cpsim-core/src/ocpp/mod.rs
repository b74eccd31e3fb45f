//! OCPP-J protocol layer
//!
//! - `frame`: positional JSON framing (CALL, CALLRESULT, CALLERROR) and log pseudo-frames
//! - `action`: action names with built-in behavior
//! - `types`: OCPP 1.6-J payloads

pub mod action;
pub mod frame;
pub mod types;

pub use action::{Action, UnknownAction};
pub use frame::{decode, encode, ErrorCode, Frame, FrameError, FrameKind, MessageType};
pub use types::*;
