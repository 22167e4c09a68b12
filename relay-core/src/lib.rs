//! # relay-core
//!
//! Pure session and transfer lifecycle logic for the shroud relay
//! (no I/O, instant tests).
//!
//! This crate implements the queues, trackers, guards and state machines of
//! the relay engine without any network or disk I/O:
//! - [`timeout`] - the monotonic stopwatch every expiry decision uses
//! - [`chunk`] - upload and download chunk windows
//! - [`transfer`] - progress, retry and backoff per transfer
//! - [`spam`] - sliding-window abuse detection
//! - [`channel`] / [`crypto`] - per-session cipher and algorithm selection
//! - [`machine`] - the protocol phase sequencer
//!
//! The actual I/O is performed by `relay-client` and `relay-router`, which
//! interpret the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod chunk;
pub mod crypto;
pub mod machine;
pub mod spam;
pub mod timeout;
pub mod transfer;

pub use channel::SessionChannel;
pub use chunk::{
    Chunk, DownloadQueue, UploadQueue, Window, BUFFER_CHUNKS, DEFAULT_BUFFER_SIZE,
    DEFAULT_CHUNK_DRIFT, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
pub use crypto::{
    Argon2Params, CipherKind, CryptoError, EphemeralKeyPair, GroupKey, GroupSecret, HashKind,
    KdfKind, SessionCipher,
};
pub use machine::{Action, Event, Machine, Phase, Status, Step};
pub use spam::{SpamConfig, SpamGuard};
pub use timeout::Timeout;
pub use transfer::{Transfer, TransferRecord, BACKOFF_MS};
