// src/core/mod.rs

//! The central module containing the core logic and data structures of Vigil.

pub mod checker;
pub mod checkresult;
pub mod cluster;
pub mod errors;
pub mod events;
pub mod flapping;
pub mod notification;
pub mod objects;
pub mod processor;
pub mod replay;
pub mod runtime_ops;
pub mod state;
pub mod tasks;
pub mod timeperiod;

pub use checkresult::{CheckResult, CheckState, StateType};
pub use errors::VigilError;
pub use events::{Event, EventBus, EventKind};
pub use state::{EngineInit, EngineState};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time as seconds with sub-second precision.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
