//! Upload and download jobs.
//!
//! Each accepted transfer runs as its own phase machine next to the client
//! machine, sharing the client's connection. Jobs give up after
//! `max_retries` consecutive failures or when their idle clock reaches the
//! job timeout.

use std::collections::{BTreeMap, HashSet};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::chunk::Window;
use relay_core::{Chunk, DownloadQueue, Phase, Step, Transfer, UploadQueue};
use relay_types::{
    ChunkData, Download, Request, ResponseBody, ResponseStatus, TransferId, TransferNotice,
    TransferOpened, Upload,
};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::client::{ClientEvent, Shared};
use crate::error::ClientError;
use crate::runner::{MachineHandle, PhaseHandler};
use crate::transport::Transport;

/// Our side of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We send the file.
    Upload,
    /// We receive the file.
    Download,
}

/// The router will not change its mind about these.
fn is_terminal(status: ResponseStatus) -> bool {
    matches!(
        status,
        ResponseStatus::BadRequest | ResponseStatus::Unauthorized | ResponseStatus::NotFound
    )
}

/// Bookkeeping common to both directions.
struct Job<T: Transport> {
    shared: Arc<Shared<T>>,
    transfer_id: TransferId,
    direction: Direction,
    transfer: Transfer,
}

impl<T: Transport> Job<T> {
    fn gave_up(&self) -> bool {
        self.transfer.record.retry_count() > self.shared.config.max_retries
    }

    fn progress(&self) {
        self.shared.emit(ClientEvent::TransferProgress {
            transfer_id: self.transfer_id,
            percent: self.transfer.record.get_percent(),
        });
    }

    fn finish(&mut self, machine: &MachineHandle) -> Step {
        if !self.transfer.record.is_done() {
            self.transfer.finish();
        }
        let status = self.transfer.record.status();
        tracing::info!(
            transfer = %self.transfer_id,
            direction = ?self.direction,
            ?status,
            bytes = self.transfer.record.total_written(),
            "transfer ended"
        );
        self.shared.emit(ClientEvent::TransferFinished {
            transfer_id: self.transfer_id,
            direction: self.direction,
            status,
        });
        machine.set_status(status);
        machine.kill();
        Step::Next
    }

    fn cancel(&mut self) -> Step {
        if self.stalled() {
            tracing::warn!(transfer = %self.transfer_id, "transfer stalled");
            self.transfer.error();
        } else {
            self.transfer.cancel();
        }
        Step::Then(vec![Phase::Quit])
    }

    fn stalled(&self) -> bool {
        self.transfer.record.is_stalled(self.shared.config.job_timeout)
    }

    fn on_error(&mut self) -> Duration {
        self.transfer.record.retry();
        self.transfer.record.wait();
        self.transfer.record.wait_duration()
    }
}

// =============================================================================
// Upload
// =============================================================================

/// Sends a shared file in chunks as the router asks for it.
pub(crate) struct UploadJob<T: Transport> {
    job: Job<T>,
    path: PathBuf,
    file: Option<File>,
    /// Sent but neither acknowledged nor finally refused.
    retry: Option<Chunk>,
}

impl<T: Transport> UploadJob<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, notice: TransferNotice, path: PathBuf) -> Self {
        let queue = UploadQueue::new(notice.file_size, notice.chunk_size)
            .with_drift(notice.chunk_drift);
        Self {
            job: Job {
                shared,
                transfer_id: notice.transfer_id,
                direction: Direction::Upload,
                transfer: Transfer::new(notice.file_size, Window::Upload(queue)),
            },
            path,
            file: None,
            retry: None,
        }
    }

    fn queue(&mut self) -> &mut UploadQueue {
        match &mut self.job.transfer.window {
            Window::Upload(queue) => queue,
            Window::Download(_) => unreachable!("upload job owns an upload window"),
        }
    }

    async fn open(&mut self) -> Result<(), ClientError> {
        let file = File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        if len < self.job.transfer.record.file_size() {
            return Err(ClientError::Protocol(format!(
                "{} is {} bytes, {} announced",
                self.path.display(),
                len,
                self.job.transfer.record.file_size()
            )));
        }
        self.file = Some(file);
        Ok(())
    }

    async fn read_chunk(&mut self, chunk: &Chunk) -> Result<Vec<u8>, ClientError> {
        let file = self.file.as_mut().ok_or(ClientError::NotConnected)?;
        file.seek(SeekFrom::Start(chunk.offset)).await?;
        let mut data = vec![0; chunk.size as usize];
        file.read_exact(&mut data).await?;
        Ok(data)
    }

    async fn upload(&mut self) -> Result<Step, ClientError> {
        let chunk = match self.retry.take() {
            Some(chunk) => chunk,
            None => match self.queue().next() {
                Some(chunk) => chunk,
                None => return Ok(Step::Then(vec![Phase::Quit])),
            },
        };
        let data = self.read_chunk(&chunk).await?;
        let request = Request::Upload(Upload {
            transfer_id: self.job.transfer_id,
            offset: chunk.offset,
            data,
        });
        self.retry = Some(chunk);
        let response = self.job.shared.connection.request(&request).await?;
        let refused = self.retry.take();

        match response.status {
            ResponseStatus::Ok => {
                let ResponseBody::UploadAck(ack) = response.body else {
                    return Err(ClientError::Protocol("upload answered without an ack".into()));
                };
                if let Some(acked) = self.queue().ack(ack.offset) {
                    self.job.transfer.update(acked.size);
                    self.job.progress();
                }
                if self.job.transfer.record.is_done() {
                    Ok(Step::Then(vec![Phase::Quit]))
                } else {
                    Ok(Step::Stay)
                }
            }
            ResponseStatus::Busy => {
                self.retry = refused;
                self.job.transfer.record.wait();
                Ok(Step::SleepThen(
                    Phase::Upload,
                    self.job.transfer.record.wait_duration(),
                ))
            }
            status if is_terminal(status) => {
                tracing::warn!(transfer = %self.job.transfer_id, ?status, "upload refused");
                self.job.transfer.error();
                Ok(Step::Then(vec![Phase::Quit]))
            }
            status => {
                self.retry = refused;
                Err(ClientError::Status {
                    request: "upload",
                    status,
                })
            }
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> PhaseHandler for UploadJob<T> {
    async fn on_phase(&mut self, phase: Phase, machine: &MachineHandle) -> Result<Step, ClientError> {
        if matches!(phase, Phase::Start | Phase::Upload) && self.job.gave_up() {
            self.job.transfer.error();
            return Ok(Step::Then(vec![Phase::Quit]));
        }

        match phase {
            Phase::Start => {
                self.open().await?;
                self.job.transfer.start();
                Ok(Step::Then(vec![Phase::Upload]))
            }
            Phase::Upload => self.upload().await,
            Phase::Cancel => Ok(self.job.cancel()),
            Phase::Quit => {
                self.file = None;
                Ok(self.job.finish(machine))
            }
            other => Ok(machine.default_step(other)),
        }
    }

    fn timeout(&self) -> bool {
        self.job.stalled()
    }

    fn on_error(&mut self, _phase: Phase, _error: &ClientError) -> Duration {
        self.job.on_error()
    }
}

// =============================================================================
// Download
// =============================================================================

/// Pulls chunks from the router and writes them into place.
pub(crate) struct DownloadJob<T: Transport> {
    job: Job<T>,
    dest: PathBuf,
    file: Option<File>,
    next_write: u64,
    /// Written past `next_write`, offset to end.
    written: BTreeMap<u64, u64>,
    received: HashSet<u64>,
    exhausted: bool,
}

impl<T: Transport> DownloadJob<T> {
    pub(crate) fn new(
        shared: Arc<Shared<T>>,
        opened: TransferOpened,
        file_size: u64,
        dest: PathBuf,
    ) -> Self {
        let buffer = opened.buffer_size.max(opened.chunk_size);
        Self {
            job: Job {
                shared,
                transfer_id: opened.transfer_id,
                direction: Direction::Download,
                transfer: Transfer::new(
                    file_size,
                    Window::Download(DownloadQueue::new(file_size, buffer)),
                ),
            },
            dest,
            file: None,
            next_write: 0,
            written: BTreeMap::new(),
            received: HashSet::new(),
            exhausted: false,
        }
    }

    fn queue(&mut self) -> &mut DownloadQueue {
        match &mut self.job.transfer.window {
            Window::Download(queue) => queue,
            Window::Upload(_) => unreachable!("download job owns a download window"),
        }
    }

    async fn create(&mut self) -> Result<(), ClientError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.dest)
            .await?;
        file.set_len(self.job.transfer.record.file_size()).await?;
        self.file = Some(file);
        Ok(())
    }

    fn accept(&mut self, chunk: ChunkData) -> Result<(), ClientError> {
        let file_size = self.job.transfer.record.file_size();
        let end = chunk.offset.saturating_add(chunk.data.len() as u64);
        if end > file_size {
            return Err(ClientError::Protocol(format!(
                "chunk {}..{} past end of {} byte file",
                chunk.offset, end, file_size
            )));
        }
        if !self.received.insert(chunk.offset) {
            tracing::debug!(offset = chunk.offset, "duplicate chunk");
            return Ok(());
        }
        if !self.queue().push(Chunk::with_data(chunk.offset, chunk.data)) {
            return Err(ClientError::Protocol("chunk rejected by window".into()));
        }
        Ok(())
    }

    /// Write every queued chunk, in file order where possible.
    async fn drain(&mut self) -> Result<(), ClientError> {
        let mut wrote = false;
        loop {
            let next_write = self.next_write;
            let chunk = match self.queue().pop_if(|c| c.offset == next_write) {
                Some(chunk) => chunk,
                None => match self.queue().pop() {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            let file = self.file.as_mut().ok_or(ClientError::NotConnected)?;
            file.seek(SeekFrom::Start(chunk.offset)).await?;
            file.write_all(&chunk.data).await?;

            self.written.insert(chunk.offset, chunk.end());
            while let Some(end) = self.written.remove(&self.next_write) {
                self.next_write = end;
            }
            self.job.transfer.update(chunk.size);
            wrote = true;
        }

        if wrote {
            self.job.progress();
        }
        if self.job.transfer.record.is_done() {
            if let Some(file) = self.file.as_mut() {
                file.sync_all().await?;
            }
        }
        Ok(())
    }

    async fn download(&mut self) -> Result<Step, ClientError> {
        let mut step = Step::Stay;

        if !self.exhausted && !self.queue().is_full() {
            let confirmed = self.next_write;
            let request = Request::Download(Download {
                transfer_id: self.job.transfer_id,
                confirmed,
                received: self
                    .received
                    .iter()
                    .copied()
                    .filter(|offset| *offset >= confirmed)
                    .collect(),
            });
            let response = self.job.shared.connection.request(&request).await?;

            match (response.status, response.body) {
                (ResponseStatus::Ok, ResponseBody::Chunk(chunk)) => self.accept(chunk)?,
                (ResponseStatus::Ok, ResponseBody::TransferDone) => self.exhausted = true,
                (ResponseStatus::NoContent, _) => {
                    self.job.transfer.record.wait();
                    step = Step::SleepThen(Phase::Download, self.job.transfer.record.wait_duration());
                }
                (status, _) if is_terminal(status) => {
                    tracing::warn!(transfer = %self.job.transfer_id, ?status, "download refused");
                    self.job.transfer.error();
                    return Ok(Step::Then(vec![Phase::Quit]));
                }
                (ResponseStatus::Ok, body) => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected download body {:?}",
                        body
                    )))
                }
                (status, _) => {
                    return Err(ClientError::Status {
                        request: "download",
                        status,
                    })
                }
            }
        }

        self.drain().await?;

        if self.job.transfer.record.is_done() {
            return Ok(Step::Then(vec![Phase::Quit]));
        }
        if self.exhausted {
            tracing::warn!(
                transfer = %self.job.transfer_id,
                missing = self.job.transfer.record.remaining(),
                "router finished before the file was complete"
            );
            self.job.transfer.error();
            return Ok(Step::Then(vec![Phase::Quit]));
        }
        Ok(step)
    }
}

#[async_trait]
impl<T: Transport + 'static> PhaseHandler for DownloadJob<T> {
    async fn on_phase(&mut self, phase: Phase, machine: &MachineHandle) -> Result<Step, ClientError> {
        if matches!(phase, Phase::Start | Phase::Download) && self.job.gave_up() {
            self.job.transfer.error();
            return Ok(Step::Then(vec![Phase::Quit]));
        }

        match phase {
            Phase::Start => {
                self.create().await?;
                self.job.transfer.start();
                if self.job.transfer.record.file_size() == 0 {
                    return Ok(Step::Then(vec![Phase::Quit]));
                }
                Ok(Step::Then(vec![Phase::Download]))
            }
            Phase::Download => self.download().await,
            Phase::Cancel => Ok(self.job.cancel()),
            Phase::Quit => {
                self.file = None;
                Ok(self.job.finish(machine))
            }
            other => Ok(machine.default_step(other)),
        }
    }

    fn timeout(&self) -> bool {
        self.job.stalled()
    }

    fn on_error(&mut self, _phase: Phase, _error: &ClientError) -> Duration {
        self.job.on_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, RelayClient};
    use crate::connection::tests::fake_router;
    use crate::transport::MockTransport;
    use parking_lot::Mutex;
    use relay_core::{CipherKind, GroupSecret, KdfKind, Status};
    use relay_types::{ClientId, Inbox, InboxItem, Joined, Response, UploadAck};
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    fn config() -> ClientConfig {
        let secret = GroupSecret::derive(KdfKind::HkdfSha256, "transfer tests").unwrap();
        ClientConfig::new("router:4433", secret)
            .with_error_delay(Duration::from_millis(5))
            .with_ping_interval(Duration::from_millis(10))
    }

    fn joined() -> Response {
        Response::ok(ResponseBody::Joined(Joined {
            client_id: ClientId::random(),
            motd: None,
        }))
    }

    async fn finished(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> (Direction, Status) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Some(ClientEvent::TransferFinished {
                        direction, status, ..
                    }) => return (direction, status),
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("transfer finished in time")
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    // =========================================================================
    // Upload
    // =========================================================================

    #[tokio::test]
    async fn upload_sends_every_chunk_once_acked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.flac");
        let data = content(10_000);
        std::fs::write(&path, &data).unwrap();

        let transfer_id = TransferId::new();
        let received = Arc::new(Mutex::new(BTreeMap::new()));
        let sink = received.clone();
        let mut busy_once = true;
        let mut noticed = false;

        let transport = MockTransport::new();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(),
            Request::Ping if !noticed => {
                noticed = true;
                Response::ok(ResponseBody::Inbox(Inbox {
                    items: vec![InboxItem::TransferRequested(TransferNotice {
                        transfer_id,
                        from: ClientId::random(),
                        file_name: "song.flac".into(),
                        file_size: 10_000,
                        chunk_size: 4096,
                        chunk_drift: 0,
                    })],
                }))
            }
            Request::Upload(upload) => {
                if busy_once {
                    busy_once = false;
                    return Response::status(ResponseStatus::Busy);
                }
                sink.lock().insert(upload.offset, upload.data);
                Response::ok(ResponseBody::UploadAck(UploadAck {
                    offset: upload.offset,
                }))
            }
            _ => Response::ok(ResponseBody::Inbox(Inbox { items: vec![] })),
        });

        let (client, mut events) = RelayClient::new(config(), transport).unwrap();
        client.share("song.flac", &path);
        let task = client.spawn();
        client.start();

        assert_eq!(
            finished(&mut events).await,
            (Direction::Upload, Status::Success)
        );

        let uploaded: Vec<u8> = received.lock().values().flatten().copied().collect();
        assert_eq!(uploaded, data);

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn busy_upload_resends_the_refused_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, content(10_000)).unwrap();

        let offsets = Arc::new(Mutex::new(Vec::new()));
        let sent = offsets.clone();
        let mut busy = 2;
        let mut noticed = false;

        let transport = MockTransport::new();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(),
            Request::Ping if !noticed => {
                noticed = true;
                Response::ok(ResponseBody::Inbox(Inbox {
                    items: vec![InboxItem::TransferRequested(TransferNotice {
                        transfer_id: TransferId::new(),
                        from: ClientId::random(),
                        file_name: "notes.txt".into(),
                        file_size: 10_000,
                        chunk_size: 4096,
                        chunk_drift: 8192,
                    })],
                }))
            }
            Request::Upload(upload) => {
                sent.lock().push(upload.offset);
                if busy > 0 {
                    busy -= 1;
                    return Response::status(ResponseStatus::Busy);
                }
                Response::ok(ResponseBody::UploadAck(UploadAck {
                    offset: upload.offset,
                }))
            }
            _ => Response::ok(ResponseBody::Inbox(Inbox { items: vec![] })),
        });

        let (client, mut events) = RelayClient::new(config(), transport).unwrap();
        client.share("notes.txt", &path);
        let task = client.spawn();
        client.start();

        assert_eq!(
            finished(&mut events).await,
            (Direction::Upload, Status::Success)
        );
        assert_eq!(*offsets.lock(), vec![0, 0, 0, 4096, 8192]);

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_share_is_ignored() {
        let transport = MockTransport::new();
        let uploads = Arc::new(Mutex::new(0));
        let counter = uploads.clone();
        let mut noticed = false;
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(),
            Request::Ping if !noticed => {
                noticed = true;
                Response::ok(ResponseBody::Inbox(Inbox {
                    items: vec![InboxItem::TransferRequested(TransferNotice {
                        transfer_id: TransferId::new(),
                        from: ClientId::random(),
                        file_name: "not-shared.txt".into(),
                        file_size: 10,
                        chunk_size: 4096,
                        chunk_drift: 0,
                    })],
                }))
            }
            Request::Upload(_) => {
                *counter.lock() += 1;
                Response::status(ResponseStatus::Ok)
            }
            _ => Response::ok(ResponseBody::Inbox(Inbox { items: vec![] })),
        });

        let (client, _events) = RelayClient::new(config(), transport).unwrap();
        let task = client.spawn();
        client.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*uploads.lock(), 0);

        client.shutdown();
        task.await.unwrap();
    }

    // =========================================================================
    // Download
    // =========================================================================

    #[tokio::test]
    async fn download_writes_out_of_order_chunks_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("copy.bin");
        let data = content(9_000);
        let transfer_id = TransferId::new();

        // Last chunk first, then a dry spell, then the rest.
        let mut script: Vec<Response> = vec![
            Response::ok(ResponseBody::Chunk(ChunkData {
                offset: 8_000,
                data: data[8_000..].to_vec(),
            })),
            Response::status(ResponseStatus::NoContent),
            Response::ok(ResponseBody::Chunk(ChunkData {
                offset: 0,
                data: data[..4_000].to_vec(),
            })),
            Response::ok(ResponseBody::Chunk(ChunkData {
                offset: 4_000,
                data: data[4_000..8_000].to_vec(),
            })),
            Response::ok(ResponseBody::TransferDone),
        ];
        script.reverse();

        let transport = MockTransport::new();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(),
            Request::Transfer(_) => Response::ok(ResponseBody::TransferOpened(TransferOpened {
                transfer_id,
                chunk_size: 4_000,
                chunk_drift: 0,
                buffer_size: 64_000,
            })),
            Request::Download(_) => script
                .pop()
                .unwrap_or(Response::ok(ResponseBody::TransferDone)),
            _ => Response::ok(ResponseBody::Inbox(Inbox { items: vec![] })),
        });

        let (client, mut events) = RelayClient::new(config(), transport).unwrap();
        let task = client.spawn();
        client.start();
        client.download(ClientId::random(), "original.bin", 9_000, &dest);

        assert_eq!(
            finished(&mut events).await,
            (Direction::Download, Status::Success)
        );
        assert_eq!(std::fs::read(&dest).unwrap(), data);

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn download_reports_what_it_has_written() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("halves.bin");
        let data = content(8_000);
        let transfer_id = TransferId::new();

        let mut script: Vec<Response> = vec![
            Response::ok(ResponseBody::Chunk(ChunkData {
                offset: 4_000,
                data: data[4_000..].to_vec(),
            })),
            Response::ok(ResponseBody::Chunk(ChunkData {
                offset: 0,
                data: data[..4_000].to_vec(),
            })),
        ];
        script.reverse();
        let pulls = Arc::new(Mutex::new(Vec::new()));
        let seen = pulls.clone();

        let transport = MockTransport::new();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(),
            Request::Transfer(_) => Response::ok(ResponseBody::TransferOpened(TransferOpened {
                transfer_id,
                chunk_size: 4_000,
                chunk_drift: 0,
                buffer_size: 64_000,
            })),
            Request::Download(download) => {
                seen.lock().push((download.confirmed, download.received));
                script
                    .pop()
                    .unwrap_or(Response::ok(ResponseBody::TransferDone))
            }
            _ => Response::ok(ResponseBody::Inbox(Inbox { items: vec![] })),
        });

        let (client, mut events) = RelayClient::new(config(), transport).unwrap();
        let task = client.spawn();
        client.start();
        client.download(ClientId::random(), "halves.bin", 8_000, &dest);

        assert_eq!(
            finished(&mut events).await,
            (Direction::Download, Status::Success)
        );
        assert_eq!(*pulls.lock(), vec![(0, vec![]), (0, vec![4_000])]);
        assert_eq!(std::fs::read(&dest).unwrap(), data);

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn download_fails_when_router_runs_dry() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("partial.bin");
        let transfer_id = TransferId::new();
        let mut first = true;

        let transport = MockTransport::new();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(),
            Request::Transfer(_) => Response::ok(ResponseBody::TransferOpened(TransferOpened {
                transfer_id,
                chunk_size: 1_000,
                chunk_drift: 0,
                buffer_size: 16_000,
            })),
            Request::Download(_) if first => {
                first = false;
                Response::ok(ResponseBody::Chunk(ChunkData {
                    offset: 0,
                    data: vec![7; 1_000],
                }))
            }
            Request::Download(_) => Response::ok(ResponseBody::TransferDone),
            _ => Response::ok(ResponseBody::Inbox(Inbox { items: vec![] })),
        });

        let (client, mut events) = RelayClient::new(config(), transport).unwrap();
        let task = client.spawn();
        client.start();
        client.download(ClientId::random(), "big.bin", 5_000, &dest);

        assert_eq!(
            finished(&mut events).await,
            (Direction::Download, Status::Error)
        );

        client.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn download_gives_up_after_removed_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("gone.bin");

        let transport = MockTransport::new();
        fake_router(&transport, CipherKind::Aes256Gcm, move |request| match request {
            Request::Join(_) => joined(),
            Request::Transfer(_) => Response::ok(ResponseBody::TransferOpened(TransferOpened {
                transfer_id: TransferId::new(),
                chunk_size: 1_000,
                chunk_drift: 0,
                buffer_size: 16_000,
            })),
            Request::Download(_) => Response::status(ResponseStatus::NotFound),
            _ => Response::ok(ResponseBody::Inbox(Inbox { items: vec![] })),
        });

        let (client, mut events) = RelayClient::new(config(), transport).unwrap();
        let task = client.spawn();
        client.start();
        client.download(ClientId::random(), "gone.bin", 5_000, &dest);

        assert_eq!(
            finished(&mut events).await,
            (Direction::Download, Status::Error)
        );

        client.shutdown();
        task.await.unwrap();
    }
}
