//! # relay-types
//!
//! Wire format types for the shroud relay network.
//!
//! This crate provides the foundational types used across all relay crates:
//! - [`ClientId`], [`GroupId`], [`SessionId`], [`TransferId`] - Identity types
//! - [`Message`] - Outer frame bodies (handshake, sealed envelope)
//! - [`Request`] / [`Response`] - Session-encrypted protocol payloads
//! - [`read_frame`] / [`write_frame`] - Length-prefixed framing
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod frame;
mod ids;
mod messages;

pub use error::WireError;
pub use frame::{frame_length, read_frame, write_frame, FRAME_HEADER_LEN, MAX_FRAME_SIZE};
pub use ids::{ClientId, GroupId, SessionId, TransferId};
pub use messages::{
    Browse, BrowseListing, BrowseRequest, BrowseResult, Chat, ChatMessage, ChunkData, CipherKind,
    Download, Handshake, HandshakeAck, Inbox, InboxItem, Join, Joined, Member, MemberLeft, Members,
    Message, Rejected, Request, Response, ResponseBody, ResponseStatus, RouterInfo, Sealed, Search,
    SearchMatches, SearchRequest, SearchResult, ShareEntry, TransferNotice, TransferOpened,
    TransferRequest, Upload, UploadAck, PROTOCOL_VERSION,
};
