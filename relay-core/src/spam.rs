//! Per-client abuse detection.
//!
//! Three sliding windows of event timestamps, each capped at `max_items`.
//! A client is abusive while any window is full; entries age out lazily on
//! the next read.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Thresholds for a [`SpamGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpamConfig {
    /// Events per window before the client is blocked.
    pub max_items: usize,
    /// Window for consecutive requests.
    pub request_timeout: Duration,
    /// Window for repeated identical payloads.
    pub dupe_timeout: Duration,
    /// Window for any requests.
    pub max_timeout: Duration,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            max_items: 3,
            request_timeout: Duration::from_secs(3),
            dupe_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct SpamWindow {
    span: Duration,
    events: VecDeque<Instant>,
}

impl SpamWindow {
    fn new(span: Duration) -> Self {
        Self {
            span,
            events: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.events.front() {
            if now.saturating_duration_since(oldest) >= self.span {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant, max_items: usize) {
        self.prune(now);
        self.events.push_back(now);
        while self.events.len() > max_items {
            self.events.pop_front();
        }
    }

    fn len_at(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.events.len()
    }
}

/// Sliding-window counters for one client.
#[derive(Debug, Clone)]
pub struct SpamGuard {
    config: SpamConfig,
    request: SpamWindow,
    duplicate: SpamWindow,
    burst: SpamWindow,
    last_hash: Option<[u8; 32]>,
}

impl SpamGuard {
    /// A guard with no recorded events.
    pub fn new(config: SpamConfig) -> Self {
        Self {
            config,
            request: SpamWindow::new(config.request_timeout),
            duplicate: SpamWindow::new(config.dupe_timeout),
            burst: SpamWindow::new(config.max_timeout),
            last_hash: None,
        }
    }

    /// Count a protocol request.
    pub fn record_request(&mut self) {
        self.record_request_at(Instant::now());
    }

    /// [`record_request`](Self::record_request) at `now`.
    pub fn record_request_at(&mut self, now: Instant) {
        let max = self.config.max_items;
        self.request.record(now, max);
        self.burst.record(now, max);
    }

    /// Count a chat payload, identified by its hash.
    ///
    /// A hash equal to the previous one counts as a duplicate; a different
    /// hash resets the duplicate window.
    pub fn record_chat(&mut self, text_hash: [u8; 32]) {
        self.record_chat_at(text_hash, Instant::now());
    }

    /// [`record_chat`](Self::record_chat) at `now`.
    pub fn record_chat_at(&mut self, text_hash: [u8; 32], now: Instant) {
        if self.last_hash == Some(text_hash) {
            self.duplicate.record(now, self.config.max_items);
        } else {
            self.duplicate.events.clear();
            self.duplicate.events.push_back(now);
            self.last_hash = Some(text_hash);
        }
    }

    /// True while every window is below `max_items`.
    pub fn is_valid(&mut self) -> bool {
        self.is_valid_at(Instant::now())
    }

    /// [`is_valid`](Self::is_valid) at `now`.
    pub fn is_valid_at(&mut self, now: Instant) -> bool {
        let max = self.config.max_items;
        self.request.len_at(now) < max
            && self.duplicate.len_at(now) < max
            && self.burst.len_at(now) < max
    }

    /// Drop expired entries from all windows.
    pub fn prune_at(&mut self, now: Instant) {
        self.request.prune(now);
        self.duplicate.prune(now);
        self.burst.prune(now);
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.request.events.clear();
        self.duplicate.events.clear();
        self.burst.events.clear();
        self.last_hash = None;
    }

    /// Thresholds in use.
    pub fn config(&self) -> SpamConfig {
        self.config
    }
}

impl Default for SpamGuard {
    fn default() -> Self {
        Self::new(SpamConfig::default())
    }
}
