//! Router state: the entity arena, its side tables and metrics.
//!
//! [`RelayRouter`] owns every table the dispatcher and the sweep loop touch.
//! Removal always goes through [`RelayRouter::remove_session`] or
//! [`RelayRouter::remove_transfer`] so that the tables stay consistent, and
//! [`RouterEvent`]s are sent only after the table operation has returned.

use crate::config::Config;
use crate::error::SweepError;
use crate::limits::RateLimits;
use crate::table::{Arena, EntityId, EntityKind, Table};
use relay_core::{Chunk, DownloadQueue, SpamGuard, Timeout};
use relay_types::{ClientId, GroupId, InboxItem, MemberLeft, SessionId, TransferId};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Notify};

/// Items kept per client between pings; older items are dropped first.
pub const INBOX_LIMIT: usize = 256;

/// Longest accepted display name, in bytes.
pub const MAX_NAME_LEN: usize = 64;

const EVENT_CAPACITY: usize = 256;

/// Operational metrics for monitoring router activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// Total connections accepted (before handshake).
    pub connections_total: AtomicU64,
    /// Total sealed requests dispatched.
    pub requests_total: AtomicU64,
    /// Chat messages relayed to at least one inbox.
    pub chats_relayed: AtomicU64,
    /// Chat messages dropped by the spam guard.
    pub chats_dropped: AtomicU64,
    /// Transfers opened.
    pub transfers_total: AtomicU64,
    /// Chunk bytes accepted from uploaders.
    pub bytes_received: AtomicU64,
    /// Chunk bytes handed to downloaders.
    pub bytes_sent: AtomicU64,
    /// Clients evicted by the sweep loop.
    pub clients_evicted: AtomicU64,
    /// Transfers evicted by the sweep loop.
    pub transfers_evicted: AtomicU64,
    /// Total rate limit rejections (connection + message + global).
    pub rate_limit_hits: AtomicU64,
    /// Total protocol errors (bad frames, failed decryption, ...).
    pub errors_total: AtomicU64,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A client left or was evicted.
    ClientRemoved {
        /// The departed client.
        client_id: ClientId,
        /// Its group.
        group_id: GroupId,
    },
    /// The first member of a group joined.
    GroupAdded(GroupId),
    /// The last member of a group left.
    GroupRemoved(GroupId),
    /// A group's membership changed.
    GroupRefreshed(GroupId),
    /// A transfer completed or was evicted.
    TransferRemoved(TransferId),
}

/// Per-connection component.
#[derive(Debug)]
pub(crate) struct SessionRecord {
    pub(crate) session_id: SessionId,
    pub(crate) peer: SocketAddr,
    pub(crate) idle: Timeout,
    pub(crate) closed: Arc<Notify>,
}

/// Component attached to a session once it joins.
#[derive(Debug)]
pub(crate) struct ClientRecord {
    pub(crate) client_id: ClientId,
    pub(crate) name: String,
    pub(crate) group_id: GroupId,
    pub(crate) guard: SpamGuard,
    pub(crate) inbox: VecDeque<InboxItem>,
}

impl ClientRecord {
    pub(crate) fn push(&mut self, item: InboxItem) {
        if self.inbox.len() >= INBOX_LIMIT {
            self.inbox.pop_front();
        }
        self.inbox.push_back(item);
    }
}

/// Component of a transfer entity.
#[derive(Debug)]
pub(crate) struct RelayedTransfer {
    pub(crate) transfer_id: TransferId,
    pub(crate) uploader: ClientId,
    pub(crate) downloader: ClientId,
    pub(crate) file_name: String,
    pub(crate) queue: DownloadQueue,
    pub(crate) seen: HashSet<u64>,
    /// Handed to the downloader, not yet confirmed. Keyed by offset.
    pub(crate) in_flight: BTreeMap<u64, Chunk>,
    pub(crate) clock: Timeout,
}

impl RelayedTransfer {
    /// Queued and unconfirmed bytes together fill the buffer.
    pub(crate) fn is_full(&self) -> bool {
        let in_flight: u64 = self.in_flight.values().map(|c| c.size).sum();
        self.queue.buffer_used() + in_flight >= self.queue.buffer_limit()
    }

    /// Release in-flight chunks the downloader has written or holds.
    pub(crate) fn confirm(&mut self, confirmed: u64, received: &[u64]) {
        self.in_flight
            .retain(|offset, chunk| chunk.end() > confirmed && !received.contains(offset));
    }

    /// Every chunk was queued, handed out and confirmed.
    pub(crate) fn is_done(&self) -> bool {
        self.queue.is_done() && self.in_flight.is_empty()
    }
}

/// The router.
pub struct RelayRouter {
    config: Config,
    rate_limits: RateLimits,
    metrics: RouterMetrics,
    events: broadcast::Sender<RouterEvent>,
    pub(crate) arena: Arena,
    pub(crate) session_ids: Table<SessionId, EntityId>,
    pub(crate) sessions: Table<EntityId, SessionRecord>,
    pub(crate) client_ids: Table<ClientId, EntityId>,
    pub(crate) clients: Table<EntityId, ClientRecord>,
    pub(crate) groups: Table<GroupId, Vec<ClientId>>,
    pub(crate) spam: Table<ClientId, Timeout>,
    pub(crate) transfer_ids: Table<TransferId, EntityId>,
    pub(crate) transfers: Table<EntityId, RelayedTransfer>,
}

impl std::fmt::Debug for RelayRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRouter")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("sessions", &self.sessions.len())
            .field("clients", &self.clients.len())
            .field("transfers", &self.transfers.len())
            .finish_non_exhaustive()
    }
}

impl RelayRouter {
    /// Create a router. `config` should already be validated.
    pub fn new(config: Config) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            rate_limits,
            metrics: RouterMetrics::default(),
            events,
            arena: Arena::new(),
            session_ids: Table::new(),
            sessions: Table::new(),
            client_ids: Table::new(),
            clients: Table::new(),
            groups: Table::new(),
            spam: Table::new(),
            transfer_ids: Table::new(),
            transfers: Table::new(),
        }
    }

    /// Get the router configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// Receive lifecycle notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: RouterEvent) {
        tracing::trace!(?event, "router event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Live sessions, joined or not.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Joined clients.
    pub fn client_count(&self) -> usize {
        self.client_ids.len()
    }

    /// Groups with at least one member.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Live transfers.
    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    /// Clients currently marked as spamming.
    pub fn spam_count(&self) -> usize {
        self.spam.len()
    }

    /// Whether `client_id` is currently marked as spamming.
    pub fn is_spamming(&self, client_id: &ClientId) -> bool {
        self.spam.contains(client_id)
    }

    /// Register a freshly handshaken connection.
    ///
    /// The returned [`Notify`] fires when the session is removed, so the
    /// connection task can hang up.
    pub fn open_session(&self, peer: SocketAddr) -> (EntityId, SessionId, Arc<Notify>) {
        self.open_session_at(peer, Instant::now())
    }

    /// [`open_session`](Self::open_session) at `now`.
    pub fn open_session_at(
        &self,
        peer: SocketAddr,
        now: Instant,
    ) -> (EntityId, SessionId, Arc<Notify>) {
        let entity = self.arena.spawn(EntityKind::Session);
        let session_id = SessionId::new();
        let closed = Arc::new(Notify::new());
        self.sessions.insert(
            entity,
            SessionRecord {
                session_id,
                peer,
                idle: Timeout::started_at(now),
                closed: closed.clone(),
            },
        );
        self.session_ids.insert(session_id, entity);
        tracing::debug!(%entity, %session_id, %peer, "session opened");
        (entity, session_id, closed)
    }

    /// Client joined on session `entity`, if any.
    pub fn client_of(&self, entity: EntityId) -> Option<ClientId> {
        self.clients.with(&entity, |c| c.client_id)
    }

    /// Session entity of `client_id`, if joined.
    pub fn entity_of(&self, client_id: &ClientId) -> Option<EntityId> {
        self.client_ids.get_cloned(client_id)
    }

    /// Append `item` to `to`'s inbox. False if `to` is not joined.
    pub(crate) fn deliver(&self, to: &ClientId, item: InboxItem) -> bool {
        let Some(entity) = self.client_ids.get_cloned(to) else {
            return false;
        };
        self.clients.with_mut(&entity, |c| c.push(item)).is_some()
    }

    /// Evict session `entity` and its client, if it has one.
    ///
    /// Returns `Ok(false)` if the session was already gone. Every table is
    /// cleaned up even when an inconsistency is reported.
    pub fn remove_session(&self, entity: EntityId) -> Result<bool, SweepError> {
        let Some(session) = self.sessions.remove(&entity) else {
            return Ok(false);
        };
        let mut result = Ok(true);

        if self.arena.despawn(entity).is_none() {
            result = Err(SweepError::MissingEntity(entity));
        }
        self.session_ids.remove(&session.session_id);
        session.closed.notify_one();

        if let Some(client) = self.clients.remove(&entity) {
            if let Err(e) = self.remove_client(client) {
                result = result.and(Err(e));
            }
        }

        tracing::debug!(%entity, session_id = %session.session_id, peer = %session.peer, "session removed");
        result
    }

    fn remove_client(&self, record: ClientRecord) -> Result<(), SweepError> {
        let client_id = record.client_id;
        let group_id = record.group_id;
        let mut result = Ok(());

        self.client_ids.remove(&client_id);

        let remaining = self.groups.with_mut(&group_id, |members| {
            members.retain(|m| *m != client_id);
            members.clone()
        });
        match remaining {
            Some(members) if members.is_empty() => {
                if self.groups.remove_if(&group_id, Vec::is_empty).is_some() {
                    self.emit(RouterEvent::GroupRemoved(group_id));
                }
            }
            Some(members) => {
                for member in &members {
                    self.deliver(member, InboxItem::MemberLeft(MemberLeft { client_id }));
                }
                self.emit(RouterEvent::GroupRefreshed(group_id));
            }
            None => {
                result = Err(SweepError::MissingGroup {
                    client: client_id,
                    group: group_id,
                });
            }
        }

        self.remove_spam(&client_id);

        let stranded = self
            .transfers
            .select(|_, t| t.uploader == client_id || t.downloader == client_id);
        for entity in stranded {
            self.remove_transfer_entity(entity);
        }

        tracing::info!(client = %client_id, name = %record.name, group = %group_id, "client removed");
        self.emit(RouterEvent::ClientRemoved {
            client_id,
            group_id,
        });
        result
    }

    /// Drop `client_id`'s spam record. The client itself stays.
    pub fn remove_spam(&self, client_id: &ClientId) -> bool {
        self.spam.remove(client_id).is_some()
    }

    /// Remove a transfer and its buffered chunks.
    pub fn remove_transfer(&self, transfer_id: &TransferId) -> bool {
        match self.transfer_ids.get_cloned(transfer_id) {
            Some(entity) => self.remove_transfer_entity(entity),
            None => false,
        }
    }

    pub(crate) fn remove_transfer_entity(&self, entity: EntityId) -> bool {
        let Some(transfer) = self.transfers.remove(&entity) else {
            return false;
        };
        self.transfer_ids.remove(&transfer.transfer_id);
        if self.arena.despawn(entity).is_none() {
            tracing::error!(%entity, transfer = %transfer.transfer_id, "transfer had no arena entry");
        }
        tracing::debug!(
            transfer = %transfer.transfer_id,
            file = %transfer.file_name,
            buffered = transfer.queue.buffer_used(),
            "transfer removed"
        );
        self.emit(RouterEvent::TransferRemoved(transfer.transfer_id));
        true
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
