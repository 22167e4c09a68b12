//! Request dispatch.
//!
//! [`RelayRouter::dispatch`] is synchronous: it only touches tables, never
//! the network, so a session task can call it between reading one frame and
//! writing the next.

use crate::server::{ClientRecord, RelayRouter, RelayedTransfer, RouterEvent, MAX_NAME_LEN};
use crate::table::{EntityId, EntityKind};
use relay_core::{Chunk, SpamGuard, Timeout};
use relay_types::{
    Browse, BrowseListing, BrowseRequest, BrowseResult, Chat, ChatMessage, ChunkData, ClientId,
    Download, GroupId, Inbox, InboxItem, Join, Joined, Member, Members, Request, Response,
    ResponseBody, ResponseStatus, RouterInfo, Search, SearchMatches, SearchRequest, SearchResult,
    TransferId, TransferNotice, TransferOpened, TransferRequest, Upload, UploadAck,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Instant;

/// The joined client behind a request.
#[derive(Debug, Clone, Copy)]
struct Caller {
    entity: EntityId,
    client_id: ClientId,
    group_id: GroupId,
}

enum Pulled {
    Chunk(Chunk),
    Empty,
    Done,
}

impl RelayRouter {
    /// Handle one request from session `entity`.
    pub fn dispatch(&self, entity: EntityId, request: Request) -> Response {
        self.dispatch_at(entity, request, Instant::now())
    }

    /// [`dispatch`](Self::dispatch) at `now`.
    pub fn dispatch_at(&self, entity: EntityId, request: Request, now: Instant) -> Response {
        if self
            .sessions
            .with_mut(&entity, |s| s.idle.restart_at(now))
            .is_none()
        {
            return Response::status(ResponseStatus::Unauthorized);
        }
        Self::bump(&self.metrics().requests_total);

        let kind = request.kind();
        if !matches!(request, Request::Quit) {
            let limits = self.rate_limits();
            if let Err(e) = limits
                .check_message(&entity)
                .and_then(|()| limits.check_global())
            {
                Self::bump(&self.metrics().rate_limit_hits);
                tracing::debug!(%entity, request = kind, error = %e, "rate limited");
                return Response::status(ResponseStatus::TooManyRequests);
            }
        }

        let response = match request {
            Request::Join(join) => self.join(entity, join),
            Request::Info => self.info(),
            Request::Quit => self.quit(entity),
            other => match self.caller(entity) {
                None => Response::status(ResponseStatus::Unauthorized),
                Some(caller) => match other {
                    Request::Tunnel => Response::status(ResponseStatus::Ok),
                    Request::Group => self.group(&caller),
                    Request::Browse(browse) => self.browse(&caller, browse),
                    Request::Search(search) => self.search(&caller, search),
                    Request::BrowseResult(result) => self.browse_result(&caller, result),
                    Request::SearchResult(result) => self.search_result(&caller, result),
                    Request::Chat(chat) => self.chat(&caller, chat, now),
                    Request::Transfer(request) => self.open_transfer(&caller, request, now),
                    Request::Upload(upload) => self.upload(&caller, upload, now),
                    Request::Download(download) => self.download(&caller, download, now),
                    Request::Ping => self.ping(&caller),
                    Request::Join(_) | Request::Info | Request::Quit => {
                        unreachable!("handled before the caller lookup")
                    }
                },
            },
        };

        tracing::trace!(%entity, request = kind, status = ?response.status, "dispatched");
        response
    }

    fn caller(&self, entity: EntityId) -> Option<Caller> {
        self.clients.with(&entity, |c| Caller {
            entity,
            client_id: c.client_id,
            group_id: c.group_id,
        })
    }

    fn member(&self, client_id: &ClientId) -> Option<Member> {
        let entity = self.client_ids.get_cloned(client_id)?;
        self.clients.with(&entity, |c| Member {
            client_id: c.client_id,
            name: c.name.clone(),
        })
    }

    fn others(&self, caller: &Caller) -> Vec<ClientId> {
        let mut members = self.groups.get_cloned(&caller.group_id).unwrap_or_default();
        members.retain(|m| *m != caller.client_id);
        members
    }

    /// `target` is another member of the caller's group.
    fn is_peer(&self, caller: &Caller, target: &ClientId) -> bool {
        *target != caller.client_id
            && self
                .groups
                .with(&caller.group_id, |members| members.contains(target))
                .unwrap_or(false)
    }

    fn join(&self, entity: EntityId, join: Join) -> Response {
        // A retried join whose first answer was lost gets the same id back.
        if let Some((client_id, group_id)) = self.clients.with(&entity, |c| (c.client_id, c.group_id)) {
            if group_id != join.group_id {
                return Response::status(ResponseStatus::BadRequest);
            }
            tracing::debug!(client = %client_id, "join repeated");
            return Response::ok(ResponseBody::Joined(Joined {
                client_id,
                motd: self.config().server.motd.clone(),
            }));
        }
        let name = join.name.trim();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Response::status(ResponseStatus::BadRequest);
        }

        let client_id = ClientId::random();
        let group_id = join.group_id;
        self.clients.insert(
            entity,
            ClientRecord {
                client_id,
                name: name.to_string(),
                group_id,
                guard: SpamGuard::new(self.config().spam_config()),
                inbox: VecDeque::new(),
            },
        );
        self.client_ids.insert(client_id, entity);

        let (created, others) = self.groups.upsert(group_id, Vec::new, |members| {
            let others = members.clone();
            members.push(client_id);
            others
        });

        let member = Member {
            client_id,
            name: name.to_string(),
        };
        for other in &others {
            self.deliver(other, InboxItem::MemberJoined(member.clone()));
        }
        self.emit(if created {
            RouterEvent::GroupAdded(group_id)
        } else {
            RouterEvent::GroupRefreshed(group_id)
        });

        tracing::info!(client = %client_id, name = %member.name, group = %group_id, "client joined");
        Response::ok(ResponseBody::Joined(Joined {
            client_id,
            motd: self.config().server.motd.clone(),
        }))
    }

    fn info(&self) -> Response {
        let server = &self.config().server;
        Response::ok(ResponseBody::Info(RouterInfo {
            name: server.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            motd: server.motd.clone(),
            clients: self.client_count() as u64,
            groups: self.group_count() as u64,
            transfers: self.transfer_count() as u64,
        }))
    }

    fn quit(&self, entity: EntityId) -> Response {
        if let Err(e) = self.remove_session(entity) {
            tracing::error!(%entity, error = %e, "inconsistent tables on quit");
        }
        Response::status(ResponseStatus::Ok)
    }

    fn group(&self, caller: &Caller) -> Response {
        let members = self
            .others(caller)
            .iter()
            .filter_map(|id| self.member(id))
            .collect();
        Response::ok(ResponseBody::Members(Members { members }))
    }

    fn browse(&self, caller: &Caller, browse: Browse) -> Response {
        if !self.is_peer(caller, &browse.target) {
            return Response::status(ResponseStatus::NotFound);
        }
        self.deliver(
            &browse.target,
            InboxItem::Browse(BrowseRequest {
                from: caller.client_id,
                path: browse.path,
            }),
        );
        Response::status(ResponseStatus::Accepted)
    }

    fn search(&self, caller: &Caller, search: Search) -> Response {
        for other in self.others(caller) {
            self.deliver(
                &other,
                InboxItem::Search(SearchRequest {
                    from: caller.client_id,
                    keywords: search.keywords.clone(),
                }),
            );
        }
        Response::status(ResponseStatus::Accepted)
    }

    fn browse_result(&self, caller: &Caller, result: BrowseResult) -> Response {
        if !self.is_peer(caller, &result.target) {
            return Response::status(ResponseStatus::NotFound);
        }
        self.deliver(
            &result.target,
            InboxItem::BrowseResult(BrowseListing {
                from: caller.client_id,
                path: result.path,
                entries: result.entries,
            }),
        );
        Response::status(ResponseStatus::Accepted)
    }

    fn search_result(&self, caller: &Caller, result: SearchResult) -> Response {
        if !self.is_peer(caller, &result.target) {
            return Response::status(ResponseStatus::NotFound);
        }
        self.deliver(
            &result.target,
            InboxItem::SearchResult(SearchMatches {
                from: caller.client_id,
                keywords: result.keywords,
                results: result.results,
            }),
        );
        Response::status(ResponseStatus::Accepted)
    }

    fn chat(&self, caller: &Caller, chat: Chat, now: Instant) -> Response {
        if !self.config().features.message_router {
            return Response::status(ResponseStatus::NotImplemented);
        }
        if self.is_spamming(&caller.client_id) {
            Self::bump(&self.metrics().chats_dropped);
            tracing::debug!(client = %caller.client_id, "chat dropped, client is spamming");
            return Response::status(ResponseStatus::Ok);
        }

        let hash = *blake3::hash(&chat.payload).as_bytes();
        let valid = self
            .clients
            .with_mut(&caller.entity, |c| {
                c.guard.record_request_at(now);
                c.guard.record_chat_at(hash, now);
                c.guard.is_valid_at(now)
            })
            .unwrap_or(false);
        if !valid {
            self.spam.insert(caller.client_id, Timeout::started_at(now));
            Self::bump(&self.metrics().chats_dropped);
            tracing::debug!(client = %caller.client_id, "client marked as spamming");
            return Response::status(ResponseStatus::Ok);
        }

        match chat.target {
            Some(target) => {
                if !self.is_peer(caller, &target) {
                    return Response::status(ResponseStatus::NotFound);
                }
                self.deliver(
                    &target,
                    InboxItem::Chat(ChatMessage {
                        from: caller.client_id,
                        private: true,
                        payload: chat.payload,
                    }),
                );
            }
            None => {
                for other in self.others(caller) {
                    self.deliver(
                        &other,
                        InboxItem::Chat(ChatMessage {
                            from: caller.client_id,
                            private: false,
                            payload: chat.payload.clone(),
                        }),
                    );
                }
            }
        }
        Self::bump(&self.metrics().chats_relayed);
        Response::status(ResponseStatus::Ok)
    }

    fn open_transfer(&self, caller: &Caller, request: TransferRequest, now: Instant) -> Response {
        let config = self.config();
        if !config.features.transfer_router {
            return Response::status(ResponseStatus::NotImplemented);
        }
        if request.uploader == caller.client_id {
            return Response::status(ResponseStatus::BadRequest);
        }
        if !self.is_peer(caller, &request.uploader) {
            return Response::status(ResponseStatus::NotFound);
        }
        if self.transfer_count() >= config.transfer.max_transfers {
            return Response::status(ResponseStatus::Busy);
        }

        let chunk_size = config.transfer.chunk_size;
        let chunk_drift = config.transfer.chunk_drift;
        let buffer_size = config.chunk_buffer();
        let transfer_id = TransferId::new();
        let entity = self.arena.spawn(EntityKind::Transfer);
        self.transfers.insert(
            entity,
            RelayedTransfer {
                transfer_id,
                uploader: request.uploader,
                downloader: caller.client_id,
                file_name: request.file_name.clone(),
                queue: relay_core::DownloadQueue::new(request.file_size, buffer_size),
                seen: HashSet::new(),
                in_flight: BTreeMap::new(),
                clock: Timeout::started_at(now),
            },
        );
        self.transfer_ids.insert(transfer_id, entity);

        self.deliver(
            &request.uploader,
            InboxItem::TransferRequested(TransferNotice {
                transfer_id,
                from: caller.client_id,
                file_name: request.file_name.clone(),
                file_size: request.file_size,
                chunk_size,
                chunk_drift,
            }),
        );
        Self::bump(&self.metrics().transfers_total);
        tracing::info!(
            transfer = %transfer_id,
            from = %request.uploader,
            to = %caller.client_id,
            file = %request.file_name,
            size = request.file_size,
            "transfer opened"
        );

        Response::ok(ResponseBody::TransferOpened(TransferOpened {
            transfer_id,
            chunk_size,
            chunk_drift,
            buffer_size,
        }))
    }

    fn upload(&self, caller: &Caller, upload: Upload, now: Instant) -> Response {
        let Upload {
            transfer_id,
            offset,
            data,
        } = upload;
        let Some(entity) = self.transfer_ids.get_cloned(&transfer_id) else {
            return Response::status(ResponseStatus::NotFound);
        };
        let len = data.len() as u64;

        let outcome = self.transfers.with_mut(&entity, |t| {
            if t.uploader != caller.client_id {
                return Err(ResponseStatus::Unauthorized);
            }
            let in_bounds = offset
                .checked_add(len)
                .is_some_and(|end| end <= t.queue.file_size());
            if len == 0 || !in_bounds {
                return Err(ResponseStatus::BadRequest);
            }
            if t.seen.contains(&offset) {
                return Ok(false);
            }
            if t.is_full() || !t.queue.push(Chunk::with_data(offset, data)) {
                return Err(ResponseStatus::Busy);
            }
            t.seen.insert(offset);
            t.clock.restart_at(now);
            Ok(true)
        });

        match outcome {
            None => Response::status(ResponseStatus::NotFound),
            Some(Err(status)) => Response::status(status),
            Some(Ok(fresh)) => {
                if fresh {
                    self.metrics()
                        .bytes_received
                        .fetch_add(len, std::sync::atomic::Ordering::Relaxed);
                } else {
                    tracing::trace!(transfer = %transfer_id, offset, "duplicate chunk acknowledged");
                }
                Response::ok(ResponseBody::UploadAck(UploadAck { offset }))
            }
        }
    }

    fn download(&self, caller: &Caller, download: Download, now: Instant) -> Response {
        let Download {
            transfer_id,
            confirmed,
            received,
        } = download;
        let Some(entity) = self.transfer_ids.get_cloned(&transfer_id) else {
            return Response::status(ResponseStatus::NotFound);
        };

        let outcome = self.transfers.with_mut(&entity, |t| {
            if t.downloader != caller.client_id {
                return Err(ResponseStatus::Unauthorized);
            }
            t.confirm(confirmed, &received);

            // Still in flight after the downloader reported back: the
            // response carrying it never arrived.
            if let Some(chunk) = t.in_flight.values().next() {
                tracing::debug!(transfer = %transfer_id, offset = chunk.offset, "redelivering chunk");
                t.clock.restart_at(now);
                return Ok(Pulled::Chunk(chunk.clone()));
            }
            Ok(match t.queue.pop() {
                Some(chunk) => {
                    t.clock.restart_at(now);
                    t.in_flight.insert(chunk.offset, chunk.clone());
                    Pulled::Chunk(chunk)
                }
                None if t.is_done() => Pulled::Done,
                None => Pulled::Empty,
            })
        });

        match outcome {
            None => Response::status(ResponseStatus::NotFound),
            Some(Err(status)) => Response::status(status),
            Some(Ok(Pulled::Chunk(chunk))) => {
                self.metrics()
                    .bytes_sent
                    .fetch_add(chunk.size, std::sync::atomic::Ordering::Relaxed);
                Response::ok(ResponseBody::Chunk(ChunkData {
                    offset: chunk.offset,
                    data: chunk.data,
                }))
            }
            Some(Ok(Pulled::Empty)) => Response::status(ResponseStatus::NoContent),
            Some(Ok(Pulled::Done)) => {
                self.remove_transfer_entity(entity);
                tracing::info!(transfer = %transfer_id, "transfer complete");
                Response::ok(ResponseBody::TransferDone)
            }
        }
    }

    fn ping(&self, caller: &Caller) -> Response {
        let items = self
            .clients
            .with_mut(&caller.entity, |c| c.inbox.drain(..).collect())
            .unwrap_or_default();
        Response::ok(ResponseBody::Inbox(Inbox { items }))
    }
}
