//! # relay-router
//!
//! Untrusted relay router for the shroud network.
//!
//! The router accepts TCP connections, agrees a session key with each peer
//! and then dispatches sealed requests:
//! - joins clients to groups keyed by a shared-secret hash
//! - queues chat, browse and search notices in per-client inboxes
//! - relays file chunks from uploader to downloader through bounded queues
//! - sweeps idle clients, expired spam records and stalled transfers
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                    ┌── Client B
//!            │   sealed frames    │
//!            ├───────────────────►│
//!        ┌───┴────────────────────┴───┐
//!        │        relay-router        │
//!        │  arena + side tables       │
//!        │  sweep task  /  HTTP       │
//!        └────────────────────────────┘
//! ```
//!
//! The router never sees chat payloads or file contents in the clear:
//! both are sealed with the group key before they reach the session cipher.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod dispatch;
pub mod error;
pub mod http;
pub mod limits;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sweep;
pub mod table;

pub use config::Config;
pub use error::{ProtocolError, RelayError, SweepError};
pub use protocol::serve;
pub use server::{RelayRouter, RouterEvent, RouterMetrics};
pub use sweep::{spawn_sweep_task, SweepReport};
pub use table::EntityId;
