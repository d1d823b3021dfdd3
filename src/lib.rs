//! # Mau
//!
//! UDP network-impairment proxy for deterministic testing of real-time
//! protocols (games, voice, custom reliability layers).
//!
//! Mau binds a UDP port and transparently relays datagrams between a client
//! and a server while simulating the imperfections of a wide-area link:
//! propagation delay, bursty packet loss (Gilbert–Elliott), bandwidth-limited
//! router queueing with optional Random Early Detection, reordering,
//! duplication, and corruption. All impairment decisions come from a seeded
//! PRNG, so a test run can be reproduced exactly.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Proxy (façade)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  ProxySession (worker loop)                 │
//! │   ┌───────────────────────┐   ┌───────────────────────┐     │
//! │   │ DeliveryChannel C2S   │   │ DeliveryChannel S2C   │     │
//! │   │  loss → dup → corrupt │   │  loss → dup → corrupt │     │
//! │   │  → router → delivery  │   │  → router → delivery  │     │
//! │   └───────────────────────┘   └───────────────────────┘     │
//! ├─────────────────────────────────────────────────────────────┤
//! │          Shared UDP socket / buffer pool / clock            │
//! └─────────────────────────────────────────────────────────────┘
//!
//! Each direction owns a time-sorted delivery queue and a fluid-model router
//! queue; a single worker thread drives socket reads, the inject mailbox, and
//! the delivery timers of both directions.

#![warn(clippy::all, clippy::pedantic)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)] // Intentional usec arithmetic
#![allow(clippy::cast_precision_loss)]      // Acceptable for rate math
#![allow(clippy::cast_sign_loss)]           // Delays are always positive
#![allow(clippy::doc_markdown)]             // ASCII diagrams in docs

pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod model;
pub mod proxy;
pub mod queue;
pub mod session;
pub mod types;

pub use config::{ChannelConfig, ProxyConfig};
pub use error::{Error, Result};
pub use proxy::Proxy;
pub use types::ResultCode;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum transmission unit for relayed datagrams
pub const MAX_MTU: usize = 1500;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::ChannelStatsSnapshot;
    pub use crate::config::{ChannelConfig, ProxyConfig};
    pub use crate::error::{Error, Result};
    pub use crate::proxy::{Proxy, ProxyStats};
    pub use crate::types::{Direction, ResultCode};
}
