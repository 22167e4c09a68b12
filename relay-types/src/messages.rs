//! Protocol messages for the relay network.
//!
//! [`Message`] is the outer frame body. Everything after the handshake
//! travels inside [`Sealed`], whose payload is a session-encrypted
//! [`Request`] (client to router) or [`Response`] (router to client).

use serde::{Deserialize, Serialize};

use crate::{ClientId, GroupId, SessionId, TransferId, WireError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Symmetric cipher negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CipherKind {
    /// AES-256 in Galois/Counter mode.
    #[default]
    Aes256Gcm,
    /// ChaCha20-Poly1305 with 96-bit nonces.
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305 with 192-bit nonces.
    XChaCha20Poly1305,
}

/// Outer frame body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Client opens a session
    Handshake(Handshake),
    /// Router accepts a session
    HandshakeAck(HandshakeAck),
    /// Session-encrypted request or response
    Sealed(Sealed),
    /// Router refuses the connection
    Rejected(Rejected),
}

impl Message {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }
}

/// First message on a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol version spoken by the client
    pub version: u8,
    /// Cipher the client wants for this session
    pub cipher: CipherKind,
    /// Client's ephemeral X25519 public key
    pub public_key: [u8; 32],
}

/// Router's answer to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    /// Protocol version spoken by the router
    pub version: u8,
    /// Session assigned to this connection
    pub session_id: SessionId,
    /// Router's ephemeral X25519 public key
    pub public_key: [u8; 32],
}

/// Encrypted envelope.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    /// Session this payload belongs to
    pub session_id: SessionId,
    /// Request number, echoed by the router in its reply
    pub seq: u64,
    /// nonce || ciphertext
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for Sealed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealed")
            .field("session_id", &self.session_id)
            .field("seq", &self.seq)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Connection refused before a session was established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejected {
    /// Human-readable reason
    pub reason: String,
}

/// Requests a client sends inside a [`Sealed`] envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Register as a client of a group
    Join(Join),
    /// Keep this session open as a long-lived tunnel
    Tunnel,
    /// List the other members of the group
    Group,
    /// Ask a member for a listing of a shared path
    Browse(Browse),
    /// Broadcast a search to the group
    Search(Search),
    /// Answer a member's browse request
    BrowseResult(BrowseResult),
    /// Answer a member's search
    SearchResult(SearchResult),
    /// Open a relayed transfer from an uploader
    Transfer(TransferRequest),
    /// Push one chunk of an open transfer (uploader side)
    Upload(Upload),
    /// Pull the next chunk of an open transfer (downloader side)
    Download(Download),
    /// Relay a group-encrypted chat message
    Chat(Chat),
    /// Router information
    Info,
    /// Keepalive, drains the inbox
    Ping,
    /// Leave the router
    Quit,
}

impl Request {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Join(_) => "join",
            Request::Tunnel => "tunnel",
            Request::Group => "group",
            Request::Browse(_) => "browse",
            Request::Search(_) => "search",
            Request::BrowseResult(_) => "browse_result",
            Request::SearchResult(_) => "search_result",
            Request::Transfer(_) => "transfer",
            Request::Upload(_) => "upload",
            Request::Download(_) => "download",
            Request::Chat(_) => "chat",
            Request::Info => "info",
            Request::Ping => "ping",
            Request::Quit => "quit",
        }
    }
}

/// Join a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    /// Display name shown to other members
    pub name: String,
    /// Group to join
    pub group_id: GroupId,
}

/// Browse a member's shared path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Browse {
    /// Member to ask
    pub target: ClientId,
    /// Path within the member's shares
    pub path: String,
}

/// Search every member's shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Search {
    /// Search terms
    pub keywords: String,
}

/// One entry of a shared listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEntry {
    /// Name relative to the browsed path
    pub name: String,
    /// Size in bytes, 0 for directories
    pub size: u64,
    /// Whether the entry is a directory
    pub dir: bool,
}

/// Listing sent back to a member that browsed us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseResult {
    /// Member that asked
    pub target: ClientId,
    /// Path that was browsed
    pub path: String,
    /// Matching entries
    pub entries: Vec<ShareEntry>,
}

/// Matches sent back to a member that searched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Member that asked
    pub target: ClientId,
    /// Terms that were searched
    pub keywords: String,
    /// Matching shares
    pub results: Vec<ShareEntry>,
}

/// Downloader asks the router to open a transfer from an uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Member holding the file
    pub uploader: ClientId,
    /// Shared file name
    pub file_name: String,
    /// File size in bytes
    pub file_size: u64,
}

/// One uploaded chunk.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    /// Transfer this chunk belongs to
    pub transfer_id: TransferId,
    /// Byte offset within the file
    pub offset: u64,
    /// Chunk bytes
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upload")
            .field("transfer_id", &self.transfer_id)
            .field("offset", &self.offset)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Request the next buffered chunk.
///
/// `confirmed` is how many leading bytes the downloader has written. Chunks
/// handed out below it are released; anything handed out above it and not
/// yet received is delivered again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    /// Transfer to pull from
    pub transfer_id: TransferId,
    /// Contiguous bytes written so far
    pub confirmed: u64,
    /// Offsets received past `confirmed`
    pub received: Vec<u64>,
}

/// Chat message. The payload is encrypted with the group key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Private message recipient, or the whole group when `None`
    pub target: Option<ClientId>,
    /// nonce || ciphertext under the group key
    pub payload: Vec<u8>,
}

/// Router outcome for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Request completed
    Ok,
    /// Request accepted, result delivered later
    Accepted,
    /// Nothing available yet
    NoContent,
    /// Malformed or out-of-order request
    BadRequest,
    /// Caller is not joined or not a party to the resource
    Unauthorized,
    /// Unknown client, group or transfer
    NotFound,
    /// Rate limit exceeded
    TooManyRequests,
    /// Resource full, retry after backoff
    Busy,
    /// Feature disabled on this router
    NotImplemented,
    /// Router-side failure
    InternalError,
}

impl ResponseStatus {
    /// `Ok`, `Accepted` or `NoContent`.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Accepted | Self::NoContent)
    }

    /// The caller did something the router refused.
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            Self::BadRequest | Self::Unauthorized | Self::NotFound | Self::TooManyRequests
        )
    }

    /// Router-side condition, worth retrying.
    pub fn is_server_error(self) -> bool {
        matches!(self, Self::Busy | Self::NotImplemented | Self::InternalError)
    }
}

/// Router answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Outcome
    pub status: ResponseStatus,
    /// Payload, [`ResponseBody::Empty`] for most errors
    pub body: ResponseBody,
}

impl Response {
    /// `Ok` with a body.
    pub fn ok(body: ResponseBody) -> Self {
        Self {
            status: ResponseStatus::Ok,
            body,
        }
    }

    /// A status with an empty body.
    pub fn status(status: ResponseStatus) -> Self {
        Self {
            status,
            body: ResponseBody::Empty,
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }
}

/// Response payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseBody {
    /// No payload
    Empty,
    /// Result of [`Request::Join`]
    Joined(Joined),
    /// Result of [`Request::Group`]
    Members(Members),
    /// Result of [`Request::Transfer`]
    TransferOpened(TransferOpened),
    /// Result of [`Request::Upload`]
    UploadAck(UploadAck),
    /// Result of [`Request::Download`]
    Chunk(ChunkData),
    /// Every chunk of the transfer has been delivered
    TransferDone,
    /// Result of [`Request::Info`]
    Info(RouterInfo),
    /// Result of [`Request::Ping`]
    Inbox(Inbox),
}

/// Join result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Joined {
    /// Identifier assigned by the router
    pub client_id: ClientId,
    /// Router's message of the day
    pub motd: Option<String>,
}

/// One group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member's client id
    pub client_id: ClientId,
    /// Member's display name
    pub name: String,
}

/// Group listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Members {
    /// Everyone in the group except the caller
    pub members: Vec<Member>,
}

/// Parameters of a newly opened transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOpened {
    /// Transfer identifier
    pub transfer_id: TransferId,
    /// Chunk size the uploader should use
    pub chunk_size: u64,
    /// Maximum in-flight spread, 0 when disabled
    pub chunk_drift: u64,
    /// Router-side buffer in bytes
    pub buffer_size: u64,
}

/// Chunk accepted by the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    /// Offset of the accepted chunk
    pub offset: u64,
}

/// One relayed chunk.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkData {
    /// Byte offset within the file
    pub offset: u64,
    /// Chunk bytes
    pub data: Vec<u8>,
}

impl std::fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkData")
            .field("offset", &self.offset)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Router status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterInfo {
    /// Router display name
    pub name: String,
    /// Router version
    pub version: String,
    /// Message of the day
    pub motd: Option<String>,
    /// Joined clients
    pub clients: u64,
    /// Live groups
    pub groups: u64,
    /// Live transfers
    pub transfers: u64,
}

/// Items waiting for a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbox {
    /// Oldest first
    pub items: Vec<InboxItem>,
}

/// Something relayed to a client between pings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboxItem {
    /// Chat from another member
    Chat(ChatMessage),
    /// Another member wants a listing
    Browse(BrowseRequest),
    /// Another member is searching
    Search(SearchRequest),
    /// Listing from a member we browsed
    BrowseResult(BrowseListing),
    /// Matches from a member we searched
    SearchResult(SearchMatches),
    /// Another member wants one of our files
    TransferRequested(TransferNotice),
    /// A member joined the group
    MemberJoined(Member),
    /// A member left or was evicted
    MemberLeft(MemberLeft),
}

/// Relayed chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender
    pub from: ClientId,
    /// Whether this was a private message
    pub private: bool,
    /// nonce || ciphertext under the group key
    pub payload: Vec<u8>,
}

/// Relayed browse request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseRequest {
    /// Requester
    pub from: ClientId,
    /// Requested path
    pub path: String,
}

/// Relayed search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Requester
    pub from: ClientId,
    /// Search terms
    pub keywords: String,
}

/// Relayed browse answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseListing {
    /// Member that answered
    pub from: ClientId,
    /// Path that was browsed
    pub path: String,
    /// Entries under that path
    pub entries: Vec<ShareEntry>,
}

/// Relayed search answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatches {
    /// Member that answered
    pub from: ClientId,
    /// Terms that were searched
    pub keywords: String,
    /// Matching shares
    pub results: Vec<ShareEntry>,
}

/// Tells an uploader to start pushing a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferNotice {
    /// Transfer to push into
    pub transfer_id: TransferId,
    /// Downloader
    pub from: ClientId,
    /// Requested file
    pub file_name: String,
    /// Expected size
    pub file_size: u64,
    /// Chunk size to use
    pub chunk_size: u64,
    /// Maximum in-flight spread
    pub chunk_drift: u64,
}

/// Member departure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberLeft {
    /// Departed member
    pub client_id: ClientId,
}
