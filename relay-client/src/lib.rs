//! # relay-client
//!
//! Client library for the shroud relay network.
//!
//! ## Features
//!
//! - **Session encryption**: X25519 key exchange per connection, sealed
//!   requests under the negotiated AEAD
//! - **Group encryption**: chat payloads are sealed with a key only group
//!   members can derive
//! - **Phase machine**: work is queued as phases and run by a background
//!   task that reconnects on failure
//! - **Chunked transfers**: uploads and downloads run as their own jobs
//!   with windowed chunks and backoff
//! - **Transport abstraction**: TCP, or a mock for tests
//!
//! ## Example
//!
//! ```ignore
//! use relay_client::{ClientConfig, ClientEvent, RelayClient};
//!
//! let config = ClientConfig::from_passphrase("relay.example.net:4433", "our secret")?
//!     .with_name("alice");
//! let (client, mut events) = RelayClient::tcp(config)?;
//! client.spawn();
//! client.start();
//! client.chat("hello");
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod connection;
pub mod error;
pub mod runner;
mod share;
pub mod transfer;
pub mod transport;

pub use client::{
    ClientConfig, ClientEvent, RelayClient, DEFAULT_JOB_TIMEOUT, DEFAULT_MAX_RETRIES,
    DEFAULT_PING_INTERVAL, MAX_RETRIES_LIMIT,
};
pub use connection::Connection;
pub use error::ClientError;
pub use runner::{MachineHandle, PhaseHandler, ERROR_DELAY};
pub use transfer::Direction;
pub use transport::{MockTransport, TcpTransport, Transport, TransportError};
