//! Core types used throughout Mau.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Result codes surfaced by the proxy façade.
///
/// The first failure observed by a session is sticky: later failures do not
/// overwrite it, and `Success` never replaces a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ResultCode {
    /// No failure observed.
    #[default]
    Success = 0,
    /// A caller-supplied parameter was invalid.
    InvalidArgument = 1,
    /// Server hostname resolution failed after all retries.
    ResolveFailed = 2,
    /// The UDP listen port could not be bound.
    BindFailed = 3,
    /// A persistent socket send failure occurred.
    SendFailed = 4,
    /// A buffer allocation failed on a path that must report it.
    AllocationFailed = 5,
    /// The proxy has been shut down.
    Shutdown = 6,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ResultCode::InvalidArgument,
            2 => ResultCode::ResolveFailed,
            3 => ResultCode::BindFailed,
            4 => ResultCode::SendFailed,
            5 => ResultCode::AllocationFailed,
            6 => ResultCode::Shutdown,
            _ => ResultCode::Success,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::Success => "success",
            ResultCode::InvalidArgument => "invalid_argument",
            ResultCode::ResolveFailed => "resolve_failed",
            ResultCode::BindFailed => "bind_failed",
            ResultCode::SendFailed => "send_failed",
            ResultCode::AllocationFailed => "allocation_failed",
            ResultCode::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

/// Write-once-to-nonzero result slot shared between the worker and API
/// callers. The first failure wins; `Success` never overwrites a failure.
#[derive(Debug, Default)]
pub struct StickyResult(AtomicU8);

impl StickyResult {
    pub fn new() -> Self {
        Self(AtomicU8::new(ResultCode::Success as u8))
    }

    /// Record a failure. No-op for `Success` or if a failure is already set.
    pub fn set(&self, code: ResultCode) {
        if code.is_success() {
            return;
        }
        let _ = self.0.compare_exchange(
            ResultCode::Success as u8,
            code as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn get(&self) -> ResultCode {
        ResultCode::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Relay direction through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client to server.
    C2s,
    /// Server to client.
    S2c,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::C2s => "c2s",
            Direction::S2c => "s2c",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
