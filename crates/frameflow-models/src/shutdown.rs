//! Shutdown lifecycle states.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the process-wide shutdown coordinator.
///
/// `Running -> ShuttingDown -> {Completed | TimedOut}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ShutdownState {
    #[default]
    Running = 0,
    ShuttingDown = 1,
    Completed = 2,
    TimedOut = 3,
}

impl ShutdownState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownState::Running => "running",
            ShutdownState::ShuttingDown => "shutting_down",
            ShutdownState::Completed => "completed",
            ShutdownState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ShutdownState::Completed | ShutdownState::TimedOut)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`as_u8`](Self::as_u8); unknown values map to `Running`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ShutdownState::ShuttingDown,
            2 => ShutdownState::Completed,
            3 => ShutdownState::TimedOut,
            _ => ShutdownState::Running,
        }
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
