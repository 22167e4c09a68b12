//! High-level relay client.
//!
//! [`RelayClient`] owns a [`Connection`] and a phase machine. The
//! application queues work (chat, browse, downloads, ...) and the runner
//! task carries it out in order, reconnecting and re-joining when the
//! session drops. Everything the router pushes back arrives as
//! [`ClientEvent`]s on an unbounded channel.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::{
    CipherKind, GroupKey, GroupSecret, HashKind, KdfKind, Phase, Status, Step, Timeout, BACKOFF_MS,
};
use relay_types::{
    Browse, BrowseResult, Chat, ClientId, GroupId, InboxItem, Join, Member, Request, Response,
    ResponseBody, ResponseStatus, RouterInfo, Search, SearchResult, ShareEntry, TransferId,
    TransferNotice, TransferRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::ClientError;
use crate::runner::{self, MachineHandle, PhaseHandler, ERROR_DELAY};
use crate::share;
use crate::transfer::{Direction, DownloadJob, UploadJob};
use crate::transport::{TcpTransport, Transport, MAX_SOCKET_TIMEOUT, MIN_SOCKET_TIMEOUT};

/// Consecutive failures tolerated before a run is cancelled.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound for [`ClientConfig::with_max_retries`].
pub const MAX_RETRIES_LIMIT: u32 = 16;

/// Keepalive interval once joined.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Idle time after which a transfer job gives up.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Router `host:port`.
    pub router_address: String,
    /// Display name announced on join.
    pub name: String,
    /// Group root secret.
    pub secret: GroupSecret,
    /// Cipher for the session and for group payloads.
    pub cipher: CipherKind,
    /// Hash used to derive the group id.
    pub hash: HashKind,
    /// Per-call socket timeout.
    pub socket_timeout: Duration,
    /// Consecutive failures before a run is cancelled.
    pub max_retries: u32,
    /// Keepalive interval.
    pub ping_interval: Duration,
    /// Longest delay before a failed phase runs again.
    pub error_delay: Duration,
    /// Transfer job idle timeout.
    pub job_timeout: Duration,
}

impl ClientConfig {
    /// Config for `router_address` with the given group secret.
    pub fn new(router_address: impl Into<String>, secret: GroupSecret) -> Self {
        Self {
            router_address: router_address.into(),
            name: "anonymous".to_string(),
            secret,
            cipher: CipherKind::default(),
            hash: HashKind::default(),
            socket_timeout: crate::transport::DEFAULT_SOCKET_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            ping_interval: DEFAULT_PING_INTERVAL,
            error_delay: ERROR_DELAY,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    /// Derive the group secret from a passphrase with Argon2id.
    pub fn from_passphrase(
        router_address: impl Into<String>,
        passphrase: &str,
    ) -> Result<Self, ClientError> {
        let secret = GroupSecret::derive(KdfKind::Argon2id, passphrase)?;
        Ok(Self::new(router_address, secret))
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the cipher.
    pub fn with_cipher(mut self, cipher: CipherKind) -> Self {
        self.cipher = cipher;
        self
    }

    /// Set the group id hash.
    pub fn with_hash(mut self, hash: HashKind) -> Self {
        self.hash = hash;
        self
    }

    /// Set the socket timeout (clamped to 3..=60 seconds).
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout.clamp(MIN_SOCKET_TIMEOUT, MAX_SOCKET_TIMEOUT);
        self
    }

    /// Set the retry limit (at most 16).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.min(MAX_RETRIES_LIMIT);
        self
    }

    /// Set the keepalive interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Cap the delay before a failed phase runs again.
    pub fn with_error_delay(mut self, delay: Duration) -> Self {
        self.error_delay = delay;
        self
    }

    /// Set the transfer job idle timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Group id announced on join.
    pub fn group_id(&self) -> GroupId {
        self.secret.group_id(self.hash)
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("router_address", &self.router_address)
            .field("name", &self.name)
            .field("cipher", &self.cipher)
            .field("hash", &self.hash)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Things the application hears about.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Joined the group.
    Joined {
        /// Id assigned by the router.
        client_id: ClientId,
        /// Router message of the day.
        motd: Option<String>,
    },
    /// Current group membership.
    Members(Vec<Member>),
    /// Someone joined the group.
    MemberJoined(Member),
    /// Someone left the group.
    MemberLeft(ClientId),
    /// Decrypted chat message.
    Chat {
        /// Sender.
        from: ClientId,
        /// Addressed to us only.
        private: bool,
        /// Plaintext.
        text: Vec<u8>,
    },
    /// A member wants a listing of one of our paths.
    BrowseRequested {
        /// Requester.
        from: ClientId,
        /// Requested path.
        path: String,
    },
    /// A member searched the group.
    SearchRequested {
        /// Requester.
        from: ClientId,
        /// Search terms.
        keywords: String,
    },
    /// A member answered our browse.
    BrowseResult {
        /// Member that answered.
        from: ClientId,
        /// Browsed path.
        path: String,
        /// Entries under it.
        entries: Vec<ShareEntry>,
    },
    /// A member answered our search.
    SearchResult {
        /// Member that answered.
        from: ClientId,
        /// Searched terms.
        keywords: String,
        /// Matching shares.
        results: Vec<ShareEntry>,
    },
    /// Router info.
    Info(RouterInfo),
    /// A transfer job started.
    TransferStarted {
        /// Transfer.
        transfer_id: TransferId,
        /// Our side of it.
        direction: Direction,
        /// File name.
        file_name: String,
        /// File size in bytes.
        file_size: u64,
    },
    /// Progress of a running transfer.
    TransferProgress {
        /// Transfer.
        transfer_id: TransferId,
        /// Completed percentage.
        percent: f64,
    },
    /// A transfer job ended.
    TransferFinished {
        /// Transfer.
        transfer_id: TransferId,
        /// Our side of it.
        direction: Direction,
        /// `Success`, `Cancelled` or `Error`.
        status: Status,
    },
    /// The session with the router ended.
    Disconnected,
}

#[derive(Debug, Clone)]
struct OutgoingChat {
    target: Option<ClientId>,
    text: Vec<u8>,
}

/// A browse or search of our own, or our answer to someone else's.
#[derive(Debug, Clone)]
enum Lookup {
    Ask(Request),
    Answer { target: ClientId, query: String },
}

#[derive(Debug, Clone)]
struct PendingDownload {
    request: TransferRequest,
    dest: PathBuf,
}

#[derive(Debug, Default)]
struct ClientState {
    client_id: Option<ClientId>,
    members: Vec<Member>,
    outbox: VecDeque<OutgoingChat>,
    browses: VecDeque<Lookup>,
    searches: VecDeque<Lookup>,
    downloads: VecDeque<PendingDownload>,
    shares: HashMap<String, PathBuf>,
    jobs: Vec<MachineHandle>,
}

/// State shared by the client machine and its transfer jobs.
pub(crate) struct Shared<T: Transport> {
    pub(crate) config: ClientConfig,
    pub(crate) connection: Connection<T>,
    group_key: GroupKey,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: Mutex<ClientState>,
}

impl<T: Transport> Shared<T> {
    pub(crate) fn emit(&self, event: ClientEvent) {
        // Nobody listening is not an error.
        let _ = self.events.send(event);
    }

    fn client_id(&self) -> Option<ClientId> {
        self.state.lock().client_id
    }

    fn kill_jobs(&self) {
        let jobs = std::mem::take(&mut self.state.lock().jobs);
        for job in jobs {
            job.kill();
        }
    }
}

/// Map a failure status to an error naming the request.
pub(crate) fn check(request: &'static str, response: Response) -> Result<Response, ClientError> {
    if response.status.is_success() {
        Ok(response)
    } else {
        Err(ClientError::Status {
            request,
            status: response.status,
        })
    }
}

/// Statuses that will not change on retry; the queued item is dropped.
fn is_rejection(error: &ClientError) -> bool {
    matches!(
        error,
        ClientError::Status {
            status: ResponseStatus::BadRequest
                | ResponseStatus::Unauthorized
                | ResponseStatus::NotFound
                | ResponseStatus::NotImplemented,
            ..
        }
    )
}

/// Relay client.
pub struct RelayClient<T: Transport> {
    shared: Arc<Shared<T>>,
    machine: MachineHandle,
}

impl RelayClient<TcpTransport> {
    /// Client over TCP using the configured socket timeout.
    pub fn tcp(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let transport = TcpTransport::with_timeout(config.socket_timeout);
        Self::new(config, transport)
    }
}

impl<T: Transport + 'static> RelayClient<T> {
    /// Client over `transport`. Nothing happens until [`spawn`](Self::spawn)
    /// and [`start`](Self::start).
    pub fn new(
        config: ClientConfig,
        transport: T,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let group_key = GroupKey::derive(&config.secret, config.cipher)?;
        let (events, receiver) = mpsc::unbounded_channel();
        let connection = Connection::new(transport, config.cipher);

        let shared = Arc::new(Shared {
            config,
            connection,
            group_key,
            events,
            state: Mutex::new(ClientState::default()),
        });

        Ok((
            Self {
                shared,
                machine: MachineHandle::new(),
            },
            receiver,
        ))
    }

    /// Spawn the runner task.
    pub fn spawn(&self) -> JoinHandle<()> {
        runner::spawn(
            self.machine.clone(),
            ClientPhases::new(self.shared.clone()),
        )
    }

    /// Connect and join.
    pub fn start(&self) {
        self.machine.start();
    }

    /// Abort the current run and disconnect.
    pub fn cancel(&self) {
        self.machine.cancel();
    }

    /// Leave the group and disconnect.
    pub fn quit(&self) {
        self.machine.schedule(Phase::Quit);
    }

    /// Stop the runner task for good.
    pub fn shutdown(&self) {
        self.shared.kill_jobs();
        self.machine.kill();
    }

    /// Send `text` to the whole group.
    pub fn chat(&self, text: impl Into<Vec<u8>>) {
        self.queue_chat(None, text.into());
    }

    /// Send `text` to one member.
    pub fn chat_to(&self, target: ClientId, text: impl Into<Vec<u8>>) {
        self.queue_chat(Some(target), text.into());
    }

    fn queue_chat(&self, target: Option<ClientId>, text: Vec<u8>) {
        self.shared
            .state
            .lock()
            .outbox
            .push_back(OutgoingChat { target, text });
        self.machine.schedule(Phase::Chat);
    }

    /// Ask `target` for a listing of `path`.
    pub fn browse(&self, target: ClientId, path: impl Into<String>) {
        let request = Request::Browse(Browse {
            target,
            path: path.into(),
        });
        self.shared.state.lock().browses.push_back(Lookup::Ask(request));
        self.machine.schedule(Phase::Browse);
    }

    /// Search the group.
    pub fn search(&self, keywords: impl Into<String>) {
        let request = Request::Search(Search {
            keywords: keywords.into(),
        });
        self.shared.state.lock().searches.push_back(Lookup::Ask(request));
        self.machine.schedule(Phase::Search);
    }

    /// Send `target` a listing of `path` from our shares.
    ///
    /// The listing is read from disk when the answer is sent.
    pub fn respond_browse(&self, target: ClientId, path: impl Into<String>) {
        self.shared.state.lock().browses.push_back(Lookup::Answer {
            target,
            query: path.into(),
        });
        self.machine.schedule(Phase::Browse);
    }

    /// Send `target` the shares matching `keywords`.
    pub fn respond_search(&self, target: ClientId, keywords: impl Into<String>) {
        self.shared.state.lock().searches.push_back(Lookup::Answer {
            target,
            query: keywords.into(),
        });
        self.machine.schedule(Phase::Search);
    }

    /// Download `file_name` from `uploader` into `dest`.
    pub fn download(
        &self,
        uploader: ClientId,
        file_name: impl Into<String>,
        file_size: u64,
        dest: impl Into<PathBuf>,
    ) {
        self.shared.state.lock().downloads.push_back(PendingDownload {
            request: TransferRequest {
                uploader,
                file_name: file_name.into(),
                file_size,
            },
            dest: dest.into(),
        });
        self.machine.schedule(Phase::Transfer);
    }

    /// Offer `path` under `name` to members who request it.
    pub fn share(&self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.shared
            .state
            .lock()
            .shares
            .insert(name.into(), path.into());
    }

    /// Stop offering `name`.
    pub fn unshare(&self, name: &str) -> bool {
        self.shared.state.lock().shares.remove(name).is_some()
    }

    /// Open a long-lived tunnel.
    pub fn tunnel(&self) {
        self.machine.schedule(Phase::Tunnel);
    }

    /// Refresh group membership.
    pub fn refresh_group(&self) {
        self.machine.schedule(Phase::Group);
    }

    /// Fetch router info.
    pub fn info(&self) {
        self.machine.schedule(Phase::Info);
    }

    /// Poll the inbox now.
    pub fn ping(&self) {
        self.machine.schedule(Phase::Ping);
    }

    /// Id assigned on join.
    pub fn client_id(&self) -> Option<ClientId> {
        self.shared.client_id()
    }

    /// Last known group membership.
    pub fn members(&self) -> Vec<Member> {
        self.shared.state.lock().members.clone()
    }

    /// Group id announced on join.
    pub fn group_id(&self) -> GroupId {
        self.shared.config.group_id()
    }

    /// The client's machine.
    pub fn machine(&self) -> &MachineHandle {
        &self.machine
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection<T> {
        &self.shared.connection
    }
}

/// Phase handler of the client machine.
struct ClientPhases<T: Transport> {
    shared: Arc<Shared<T>>,
    ping_clock: Timeout,
    failures: u32,
    /// Consecutive failures per phase, indexing [`BACKOFF_MS`].
    backoff: HashMap<Phase, usize>,
}

impl<T: Transport + 'static> ClientPhases<T> {
    fn new(shared: Arc<Shared<T>>) -> Self {
        Self {
            shared,
            ping_clock: Timeout::new(),
            failures: 0,
            backoff: HashMap::new(),
        }
    }

    async fn join(&mut self) -> Result<(), ClientError> {
        let shared = &self.shared;
        if !shared.connection.is_open() {
            shared.connection.open(&shared.config.router_address).await?;
        }

        let request = Request::Join(Join {
            name: shared.config.name.clone(),
            group_id: shared.config.group_id(),
        });
        let response = check("join", shared.connection.request(&request).await?)?;
        let ResponseBody::Joined(joined) = response.body else {
            return Err(ClientError::Protocol("join answered without an id".into()));
        };

        shared.state.lock().client_id = Some(joined.client_id);
        self.ping_clock.restart();
        tracing::info!(client = %joined.client_id, "joined group");
        shared.emit(ClientEvent::Joined {
            client_id: joined.client_id,
            motd: joined.motd,
        });
        Ok(())
    }

    /// Send `request`, re-establishing the session first if it dropped.
    async fn request(&mut self, request: Request) -> Result<Response, ClientError> {
        if !self.shared.connection.is_open() || self.shared.client_id().is_none() {
            self.join().await?;
        }
        let response = self.shared.connection.request(&request).await?;
        check(request.kind(), response)
    }

    /// Send the front item of a queue, popping it once the router has it
    /// or has refused it for good.
    async fn send_front<I, F>(
        &mut self,
        peek: impl Fn(&mut ClientState) -> Option<I>,
        pop: impl Fn(&mut ClientState),
        build: F,
    ) -> Result<Option<Response>, ClientError>
    where
        F: FnOnce(I, &Shared<T>) -> Result<Request, ClientError>,
    {
        let Some(item) = peek(&mut self.shared.state.lock()) else {
            return Ok(None);
        };
        let request = build(item, self.shared.as_ref())?;
        self.send_popping(request, pop).await
    }

    async fn send_popping(
        &mut self,
        request: Request,
        pop: impl Fn(&mut ClientState),
    ) -> Result<Option<Response>, ClientError> {
        let kind = request.kind();

        match self.request(request).await {
            Ok(response) => {
                pop(&mut self.shared.state.lock());
                Ok(Some(response))
            }
            Err(error) if is_rejection(&error) => {
                pop(&mut self.shared.state.lock());
                tracing::warn!(request = kind, %error, "dropped");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Our own request, or an answer built from the shares as they are now.
    async fn lookup(&self, lookup: Lookup, phase: Phase) -> Request {
        match lookup {
            Lookup::Ask(request) => request,
            Lookup::Answer { target, query } => {
                let shares = self.shared.state.lock().shares.clone();
                if phase == Phase::Browse {
                    let entries = share::listing(&shares, &query).await;
                    Request::BrowseResult(BrowseResult {
                        target,
                        path: query,
                        entries,
                    })
                } else {
                    let results = share::matching(&shares, &query).await;
                    Request::SearchResult(SearchResult {
                        target,
                        keywords: query,
                        results,
                    })
                }
            }
        }
    }

    fn deliver(&mut self, item: InboxItem) {
        match item {
            InboxItem::Chat(message) => match self.shared.group_key.decrypt(&message.payload) {
                Ok(text) => self.shared.emit(ClientEvent::Chat {
                    from: message.from,
                    private: message.private,
                    text,
                }),
                Err(error) => {
                    tracing::warn!(from = %message.from, %error, "skipping undecryptable chat")
                }
            },
            InboxItem::Browse(browse) => self.shared.emit(ClientEvent::BrowseRequested {
                from: browse.from,
                path: browse.path,
            }),
            InboxItem::Search(search) => self.shared.emit(ClientEvent::SearchRequested {
                from: search.from,
                keywords: search.keywords,
            }),
            InboxItem::BrowseResult(listing) => self.shared.emit(ClientEvent::BrowseResult {
                from: listing.from,
                path: listing.path,
                entries: listing.entries,
            }),
            InboxItem::SearchResult(matches) => self.shared.emit(ClientEvent::SearchResult {
                from: matches.from,
                keywords: matches.keywords,
                results: matches.results,
            }),
            InboxItem::TransferRequested(notice) => self.start_upload(notice),
            InboxItem::MemberJoined(member) => {
                self.shared.state.lock().members.push(member.clone());
                self.shared.emit(ClientEvent::MemberJoined(member));
            }
            InboxItem::MemberLeft(left) => {
                self.shared
                    .state
                    .lock()
                    .members
                    .retain(|m| m.client_id != left.client_id);
                self.shared.emit(ClientEvent::MemberLeft(left.client_id));
            }
        }
    }

    fn start_upload(&mut self, notice: TransferNotice) {
        let path = self.shared.state.lock().shares.get(&notice.file_name).cloned();
        let Some(path) = path else {
            tracing::warn!(file = %notice.file_name, from = %notice.from, "no share by that name");
            return;
        };

        self.shared.emit(ClientEvent::TransferStarted {
            transfer_id: notice.transfer_id,
            direction: Direction::Upload,
            file_name: notice.file_name.clone(),
            file_size: notice.file_size,
        });
        let job = UploadJob::new(self.shared.clone(), notice, path);
        self.spawn_job(job);
    }

    fn spawn_job<H: PhaseHandler + 'static>(&self, job: H) {
        let machine = MachineHandle::new();
        machine.start();
        self.shared.state.lock().jobs.push(machine.clone());
        runner::spawn(machine, job);
    }

    async fn disconnect(&mut self) {
        self.shared.kill_jobs();
        if let Err(error) = self.shared.connection.close().await {
            tracing::debug!(%error, "close failed");
        }
        self.shared.state.lock().client_id = None;
        self.ping_clock.stop();
        self.shared.emit(ClientEvent::Disconnected);
    }

    async fn step(&mut self, phase: Phase, machine: &MachineHandle) -> Result<Step, ClientError> {
        match phase {
            Phase::Start => {
                self.failures = 0;
                Ok(Step::Then(vec![Phase::Handshake, Phase::Join, Phase::Group]))
            }

            Phase::Handshake => {
                let address = self.shared.config.router_address.clone();
                self.shared.connection.open(&address).await?;
                Ok(Step::Next)
            }

            Phase::Join => {
                self.join().await?;
                Ok(Step::Next)
            }

            Phase::Tunnel => {
                self.request(Request::Tunnel).await?;
                Ok(Step::Next)
            }

            Phase::Group => {
                let response = self.request(Request::Group).await?;
                if let ResponseBody::Members(members) = response.body {
                    self.shared.state.lock().members = members.members.clone();
                    self.shared.emit(ClientEvent::Members(members.members));
                }
                Ok(Step::Next)
            }

            Phase::Chat => {
                self.send_front(
                    |s| s.outbox.front().cloned(),
                    |s| {
                        s.outbox.pop_front();
                    },
                    |chat, shared| {
                        Ok(Request::Chat(Chat {
                            target: chat.target,
                            payload: shared.group_key.encrypt(&chat.text)?,
                        }))
                    },
                )
                .await?;
                Ok(self.more(|s| !s.outbox.is_empty()))
            }

            Phase::Browse => {
                let front = self.shared.state.lock().browses.front().cloned();
                if let Some(lookup) = front {
                    let request = self.lookup(lookup, phase).await;
                    self.send_popping(request, |s| {
                        s.browses.pop_front();
                    })
                    .await?;
                }
                Ok(self.more(|s| !s.browses.is_empty()))
            }

            Phase::Search => {
                let front = self.shared.state.lock().searches.front().cloned();
                if let Some(lookup) = front {
                    let request = self.lookup(lookup, phase).await;
                    self.send_popping(request, |s| {
                        s.searches.pop_front();
                    })
                    .await?;
                }
                Ok(self.more(|s| !s.searches.is_empty()))
            }

            Phase::Transfer => {
                let pending = self.shared.state.lock().downloads.front().cloned();
                let response = self
                    .send_front(
                        |s| s.downloads.front().map(|d| d.request.clone()),
                        |s| {
                            s.downloads.pop_front();
                        },
                        |request, _| Ok(Request::Transfer(request)),
                    )
                    .await?;

                if let (Some(response), Some(pending)) = (response, pending) {
                    let ResponseBody::TransferOpened(opened) = response.body else {
                        return Err(ClientError::Protocol("transfer answered without an id".into()));
                    };
                    self.shared.emit(ClientEvent::TransferStarted {
                        transfer_id: opened.transfer_id,
                        direction: Direction::Download,
                        file_name: pending.request.file_name.clone(),
                        file_size: pending.request.file_size,
                    });
                    let job = DownloadJob::new(
                        self.shared.clone(),
                        opened,
                        pending.request.file_size,
                        pending.dest,
                    );
                    self.spawn_job(job);
                }
                Ok(self.more(|s| !s.downloads.is_empty()))
            }

            Phase::Info => {
                let response = self.request(Request::Info).await?;
                if let ResponseBody::Info(info) = response.body {
                    self.shared.emit(ClientEvent::Info(info));
                }
                Ok(Step::Next)
            }

            Phase::Ping => {
                let response = self.request(Request::Ping).await?;
                self.ping_clock.restart();
                if let ResponseBody::Inbox(inbox) = response.body {
                    for item in inbox.items {
                        self.deliver(item);
                    }
                }
                Ok(Step::Next)
            }

            Phase::Quit => {
                if self.shared.connection.is_open() {
                    if let Err(error) = self.shared.connection.request(&Request::Quit).await {
                        tracing::debug!(%error, "quit not acknowledged");
                    }
                }
                self.disconnect().await;
                tracing::info!("left group");
                Ok(Step::Then(vec![Phase::Stop]))
            }

            Phase::Cancel => {
                self.failures = 0;
                self.disconnect().await;
                machine.set_status(Status::Cancelled);
                Ok(Step::Then(vec![Phase::Stop]))
            }

            Phase::Idle => {
                let joined = self.shared.client_id().is_some();
                if joined && self.ping_clock.expired(self.shared.config.ping_interval) {
                    return Ok(Step::Then(vec![Phase::Ping]));
                }
                Ok(machine.default_step(phase))
            }

            other => Ok(machine.default_step(other)),
        }
    }

    fn more(&self, pending: impl Fn(&ClientState) -> bool) -> Step {
        if pending(&self.shared.state.lock()) {
            Step::Stay
        } else {
            Step::Next
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> PhaseHandler for ClientPhases<T> {
    async fn on_phase(&mut self, phase: Phase, machine: &MachineHandle) -> Result<Step, ClientError> {
        let step = self.step(phase, machine).await?;
        if !matches!(phase, Phase::Idle | Phase::Sleep | Phase::Cancel | Phase::Stop) {
            self.failures = 0;
            self.backoff.remove(&phase);
            machine.set_status(Status::Success);
        }
        Ok(step)
    }

    fn timeout(&self) -> bool {
        self.failures > self.shared.config.max_retries
    }

    /// Back off along [`BACKOFF_MS`] per phase, capped by the configured
    /// error delay.
    fn on_error(&mut self, phase: Phase, _error: &ClientError) -> Duration {
        self.failures += 1;
        let index = self.backoff.entry(phase).or_default();
        *index = index.saturating_add(1);
        let wait = Duration::from_millis(BACKOFF_MS[(*index).min(BACKOFF_MS.len() - 1)]);
        wait.min(self.shared.config.error_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::fake_router;
    use crate::transport::MockTransport;
    use relay_types::{ChatMessage, Inbox, Joined, Members};

    fn config() -> ClientConfig {
        let secret = GroupSecret::derive(KdfKind::HkdfSha256, "correct horse").unwrap();
        ClientConfig::new("router:4433", secret)
            .with_name("alice")
            .with_error_delay(Duration::from_millis(5))
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    fn joined(client_id: ClientId) -> Response {
        Response::ok(ResponseBody::Joined(Joined {
            client_id,
            motd: Some("welcome".into()),
        }))
    }

    // =========================================================================
    // Config
    // =========================================================================

    #[test]
    fn config_clamps() {
        let config = config()
            .with_max_retries(100)
            .with_socket_timeout(Duration::from_secs(1));
        assert_eq!(config.max_retries, MAX_RETRIES_LIMIT);
        assert_eq!(config.socket_timeout, MIN_SOCKET_TIMEOUT);
    }

    #[test]
    fn same_passphrase_same_group() {
        let a = GroupSecret::derive(KdfKind::HkdfSha256, "pw").unwrap();
        let b = GroupSecret::derive(KdfKind::HkdfSha256, "pw").unwrap();
        assert_eq!(
            ClientConfig::new("r", a).group_id(),
            ClientConfig::new("r", b).group_id()
        );
    }

    #[test]
    fn config_debug_hides_secret() {
        let debug = format!("{:?}", config());
        assert!(debug.contains("alice"));
        assert!(!debug.contains("secret"));
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn start_joins_and_fetches_group() {
        let me = ClientId::random();
        let peer = Member {
            client_id: ClientId::random(),
            name: "bob".into(),
        };
        let transport = MockTransport::new();
        let members = vec![peer.clone()];
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(join) => {
                assert_eq!(join.name, "alice");
                joined(me)
            }
            Request::Group => Response::ok(ResponseBody::Members(Members {
                members: members.clone(),
            })),
            _ => Response::status(ResponseStatus::Ok),
        });

        let (client, mut events) = RelayClient::new(config(), transport).unwrap();
        let task = client.spawn();
        client.start();

        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Joined {
                client_id: me,
                motd: Some("welcome".into())
            }
        );
        assert_eq!(next_event(&mut events).await, ClientEvent::Members(vec![peer.clone()]));
        assert_eq!(client.client_id(), Some(me));
        assert_eq!(client.members(), vec![peer]);

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn chat_is_encrypted_with_group_key() {
        let me = ClientId::random();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let seen = sent.clone();
        let transport = MockTransport::new();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(me),
            Request::Chat(chat) => {
                seen.lock().push(chat.payload);
                Response::status(ResponseStatus::Ok)
            }
            _ => Response::status(ResponseStatus::Ok),
        });

        let config = config();
        let key = GroupKey::derive(&config.secret, config.cipher).unwrap();
        let (client, mut events) = RelayClient::new(config, transport).unwrap();
        let task = client.spawn();
        client.start();
        next_event(&mut events).await;

        client.chat("hello group");
        tokio::time::timeout(Duration::from_secs(5), async {
            while sent.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let payload = sent.lock()[0].clone();
        assert_ne!(payload, b"hello group".to_vec());
        assert_eq!(key.decrypt(&payload).unwrap(), b"hello group".to_vec());

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn ping_delivers_inbox() {
        let me = ClientId::random();
        let friend = ClientId::random();
        let config = config().with_ping_interval(Duration::from_millis(10));
        let key = GroupKey::derive(&config.secret, config.cipher).unwrap();
        let payload = key.encrypt(b"psst").unwrap();

        let transport = MockTransport::new();
        let mut delivered = false;
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(me),
            Request::Ping if !delivered => {
                delivered = true;
                Response::ok(ResponseBody::Inbox(Inbox {
                    items: vec![
                        InboxItem::Chat(ChatMessage {
                            from: friend,
                            private: true,
                            payload: payload.clone(),
                        }),
                        InboxItem::Chat(ChatMessage {
                            from: friend,
                            private: false,
                            payload: b"not encrypted".to_vec(),
                        }),
                        InboxItem::MemberLeft(relay_types::MemberLeft { client_id: friend }),
                    ],
                }))
            }
            Request::Ping => Response::ok(ResponseBody::Inbox(Inbox { items: vec![] })),
            _ => Response::status(ResponseStatus::Ok),
        });

        let (client, mut events) = RelayClient::new(config, transport).unwrap();
        let task = client.spawn();
        client.start();

        let mut received = Vec::new();
        while received.len() < 2 {
            match next_event(&mut events).await {
                ClientEvent::Chat {
                    from,
                    private,
                    text,
                } => received.push(format!(
                    "{}:{}:{}",
                    from == friend,
                    private,
                    String::from_utf8_lossy(&text)
                )),
                ClientEvent::MemberLeft(id) => {
                    assert_eq!(id, friend);
                    received.push("left".into());
                }
                _ => {}
            }
        }
        // The undecryptable chat is skipped.
        assert_eq!(received, vec!["true:true:psst".to_string(), "left".to_string()]);

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn info_reaches_application() {
        let me = ClientId::random();
        let transport = MockTransport::new();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(me),
            Request::Info => Response::ok(ResponseBody::Info(RouterInfo {
                name: "test router".into(),
                version: "0.1.0".into(),
                motd: None,
                clients: 1,
                groups: 1,
                transfers: 0,
            })),
            _ => Response::status(ResponseStatus::Ok),
        });

        let (client, mut events) = RelayClient::new(config(), transport).unwrap();
        let task = client.spawn();
        client.start();
        client.info();

        loop {
            if let ClientEvent::Info(info) = next_event(&mut events).await {
                assert_eq!(info.name, "test router");
                break;
            }
        }

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn refused_browse_is_dropped() {
        let me = ClientId::random();
        let transport = MockTransport::new();
        let browses = Arc::new(Mutex::new(0));
        let counter = browses.clone();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(me),
            Request::Browse(_) => {
                *counter.lock() += 1;
                Response::status(ResponseStatus::NotFound)
            }
            _ => Response::status(ResponseStatus::Ok),
        });

        let (client, mut events) = RelayClient::new(config(), transport).unwrap();
        let task = client.spawn();
        client.start();
        next_event(&mut events).await;

        client.browse(ClientId::random(), "/music");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*browses.lock(), 1);
        assert!(client.machine().is_active());

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn browse_and_search_answers_come_from_shares() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, b"twelve bytes").unwrap();

        let me = ClientId::random();
        let friend = ClientId::random();
        let answers = Arc::new(Mutex::new(Vec::new()));
        let sink = answers.clone();
        let transport = MockTransport::new();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(me),
            Request::BrowseResult(_) | Request::SearchResult(_) => {
                sink.lock().push(request);
                Response::status(ResponseStatus::Accepted)
            }
            _ => Response::status(ResponseStatus::Ok),
        });

        let (client, mut events) = RelayClient::new(config(), transport).unwrap();
        client.share("notes.txt", &notes);
        let task = client.spawn();
        client.start();
        next_event(&mut events).await;

        client.respond_browse(friend, "/");
        client.respond_search(friend, "NOTES");
        tokio::time::timeout(Duration::from_secs(5), async {
            while answers.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let entry = ShareEntry {
            name: "notes.txt".into(),
            size: 12,
            dir: false,
        };
        let answers = answers.lock().clone();
        assert!(answers.contains(&Request::BrowseResult(BrowseResult {
            target: friend,
            path: "/".into(),
            entries: vec![entry.clone()],
        })));
        assert!(answers.contains(&Request::SearchResult(SearchResult {
            target: friend,
            keywords: "NOTES".into(),
            results: vec![entry],
        })));

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn results_from_members_reach_application() {
        let me = ClientId::random();
        let friend = ClientId::random();
        let config = config().with_ping_interval(Duration::from_millis(10));
        let transport = MockTransport::new();
        let mut delivered = false;
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(me),
            Request::Ping if !delivered => {
                delivered = true;
                Response::ok(ResponseBody::Inbox(Inbox {
                    items: vec![
                        InboxItem::BrowseResult(relay_types::BrowseListing {
                            from: friend,
                            path: "photos".into(),
                            entries: vec![],
                        }),
                        InboxItem::SearchResult(relay_types::SearchMatches {
                            from: friend,
                            keywords: "flac".into(),
                            results: vec![],
                        }),
                    ],
                }))
            }
            Request::Ping => Response::ok(ResponseBody::Inbox(Inbox { items: vec![] })),
            _ => Response::status(ResponseStatus::Ok),
        });

        let (client, mut events) = RelayClient::new(config, transport).unwrap();
        let task = client.spawn();
        client.start();

        let mut browsed = false;
        let mut searched = false;
        while !(browsed && searched) {
            match next_event(&mut events).await {
                ClientEvent::BrowseResult { from, path, .. } => {
                    assert_eq!((from, path.as_str()), (friend, "photos"));
                    browsed = true;
                }
                ClientEvent::SearchResult { from, keywords, .. } => {
                    assert_eq!((from, keywords.as_str()), (friend, "flac"));
                    searched = true;
                }
                _ => {}
            }
        }

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn read_timeout_retries_without_rejoining() {
        let me = ClientId::random();
        let joins = Arc::new(Mutex::new(0));
        let counter = joins.clone();
        let transport = MockTransport::new();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => {
                *counter.lock() += 1;
                joined(me)
            }
            Request::Info => Response::ok(ResponseBody::Info(RouterInfo {
                name: "slow router".into(),
                version: "0.1.0".into(),
                motd: None,
                clients: 1,
                groups: 1,
                transfers: 0,
            })),
            _ => Response::status(ResponseStatus::Ok),
        });

        let (client, mut events) = RelayClient::new(config(), transport.clone()).unwrap();
        let task = client.spawn();
        client.start();
        loop {
            if let ClientEvent::Members(_) = next_event(&mut events).await {
                break;
            }
        }

        transport.fail_next_read(crate::transport::TransportError::Timeout);
        client.info();
        loop {
            match next_event(&mut events).await {
                ClientEvent::Info(info) => {
                    assert_eq!(info.name, "slow router");
                    break;
                }
                ClientEvent::Disconnected => panic!("timeout dropped the session"),
                _ => {}
            }
        }
        assert_eq!(*joins.lock(), 1);
        assert!(client.connection().is_open());

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn backoff_grows_per_phase_and_resets_on_success() {
        let config = config().with_error_delay(Duration::from_secs(3));
        let (client, _events) = RelayClient::new(config, MockTransport::new()).unwrap();
        let machine = MachineHandle::new();
        let mut phases = ClientPhases::new(client.shared.clone());
        let error = ClientError::NotConnected;

        let waits: Vec<u64> = (0..4)
            .map(|_| phases.on_error(Phase::Ping, &error).as_millis() as u64)
            .collect();
        assert_eq!(waits, vec![100, 100, 200, 300]);

        // Each phase backs off on its own.
        assert_eq!(phases.on_error(Phase::Info, &error), Duration::from_millis(100));

        // The configured delay caps the table.
        for _ in 0..10 {
            phases.on_error(Phase::Ping, &error);
        }
        assert_eq!(phases.on_error(Phase::Ping, &error), Duration::from_secs(3));

        phases.on_phase(Phase::Run, &machine).await.unwrap();
        phases.on_error(Phase::Run, &error);
        phases.on_phase(Phase::Run, &machine).await.unwrap();
        assert_eq!(phases.on_error(Phase::Run, &error), Duration::from_millis(100));
        assert_eq!(phases.failures, 1);
    }

    #[tokio::test]
    async fn quit_disconnects() {
        let me = ClientId::random();
        let transport = MockTransport::new();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(me),
            _ => Response::status(ResponseStatus::Ok),
        });

        let (client, mut events) = RelayClient::new(config(), transport.clone()).unwrap();
        let task = client.spawn();
        client.start();
        next_event(&mut events).await;
        client.quit();

        loop {
            if next_event(&mut events).await == ClientEvent::Disconnected {
                break;
            }
        }
        assert!(!transport.is_valid());
        assert_eq!(client.client_id(), None);

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn repeated_failures_cancel_run() {
        let transport = MockTransport::new();
        let config = config().with_max_retries(2);
        let (client, mut events) = RelayClient::new(config, transport.clone()).unwrap();
        let task = client.spawn();

        // Keep the transport refusing.
        let refuser = {
            let transport = transport.clone();
            tokio::spawn(async move {
                loop {
                    transport.fail_next_open("refused");
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        client.start();
        loop {
            if next_event(&mut events).await == ClientEvent::Disconnected {
                break;
            }
        }
        assert_eq!(client.machine().status(), Status::Cancelled);

        refuser.abort();
        client.shutdown();
        task.await.unwrap();
    }
}
