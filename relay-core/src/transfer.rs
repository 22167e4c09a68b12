//! Per-transfer progress, retry and backoff bookkeeping.
//!
//! [`TransferRecord`] holds the counters and lifecycle flags of one upload
//! or download. [`Transfer`] pairs it with the transfer's chunk [`Window`]
//! so that stopping an unfinished transfer also discards its in-flight
//! chunks.
//!
//! Lifecycle: `idle -> running <-> paused`, `running -> done`. A done
//! transfer may additionally be `cancelled` or `errored`; all three are
//! terminal.

use std::time::Duration;

use crate::chunk::Window;
use crate::machine::Status;
use crate::timeout::Timeout;

/// Backoff delays in milliseconds, indexed by consecutive failures.
pub const BACKOFF_MS: [u64; 10] = [0, 100, 100, 200, 300, 500, 800, 1300, 2100, 3400];

/// Progress and lifecycle state of one transfer.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    file_size: u64,
    progress: u64,
    total_written: u64,
    retry_count: u32,
    wait_index: usize,
    running: bool,
    paused: bool,
    done: bool,
    cancelled: bool,
    errored: bool,
    status: Status,
    /// Idle clock, restarted on every successful update.
    timeout: Timeout,
    /// Throughput clock, started on the first byte of a run.
    timer: Timeout,
}

impl TransferRecord {
    /// A stopped record for a file of `file_size` bytes.
    pub fn new(file_size: u64) -> Self {
        Self {
            file_size,
            progress: 0,
            total_written: 0,
            retry_count: 0,
            wait_index: 0,
            running: false,
            paused: false,
            done: false,
            cancelled: false,
            errored: false,
            status: Status::None,
            timeout: Timeout::new(),
            timer: Timeout::new(),
        }
    }

    /// Begin a run. No-op while already running or once done.
    pub fn start(&mut self) {
        if self.running || self.done {
            return;
        }
        self.running = true;
        self.progress = 0;
        self.status = Status::Pending;
        self.timeout.restart();
        self.timer.stop();
    }

    /// Record `bytes` moved successfully. Ignored unless running.
    ///
    /// Clears the backoff state. Completing the file stops the run and
    /// marks the transfer done.
    pub fn update(&mut self, bytes: u64) {
        if !self.running || self.done {
            return;
        }

        if self.progress == 0 {
            self.timer.restart();
        }
        self.timeout.restart();
        self.status = Status::Success;
        self.retry_count = 0;
        self.wait_index = 0;

        self.progress += bytes;
        self.total_written += bytes;
        debug_assert!(
            self.total_written <= self.file_size,
            "wrote {} bytes of a {} byte file",
            self.total_written,
            self.file_size
        );
        self.total_written = self.total_written.min(self.file_size);

        if self.total_written >= self.file_size {
            self.done = true;
            self.stop();
        }
    }

    /// End the run. Returns `true` when the caller must discard the
    /// transfer's chunk window (the transfer is not done).
    pub fn stop(&mut self) -> bool {
        if self.running {
            self.running = false;
            self.timer.stop();
            self.timeout.stop();
        }
        self.wait_index = 0;
        !self.done
    }

    /// Suspend a running transfer, keeping its window.
    pub fn pause(&mut self) {
        if !self.running || self.paused {
            return;
        }
        self.paused = true;
        self.running = false;
        self.timer.stop();
        self.timeout.stop();
        self.wait_index = 0;
        self.status = Status::Pending;
    }

    /// Continue a paused transfer.
    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        self.start();
    }

    /// Terminate as cancelled. Returns `true` when the window must be
    /// discarded.
    pub fn cancel(&mut self) -> bool {
        self.terminate(Status::Cancelled, |record| record.cancelled = true)
    }

    /// Terminate as errored. Returns `true` when the window must be
    /// discarded.
    pub fn error(&mut self) -> bool {
        self.terminate(Status::Error, |record| record.errored = true)
    }

    /// Terminate cleanly. Returns `true` when the window must be discarded.
    pub fn finish(&mut self) -> bool {
        self.terminate(Status::Success, |_| {})
    }

    fn terminate(&mut self, status: Status, flag: impl FnOnce(&mut Self)) -> bool {
        if self.done {
            return false;
        }
        let discard = self.stop();
        self.done = true;
        flag(self);
        self.retry_count = 0;
        self.paused = false;
        self.status = status;
        discard
    }

    /// Count a retry.
    pub fn retry(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// Count a failed attempt, lengthening the next backoff.
    pub fn wait(&mut self) {
        self.wait_index = self.wait_index.saturating_add(1);
    }

    /// Backoff delay in milliseconds for the current failure streak.
    pub fn get_wait(&self) -> u64 {
        BACKOFF_MS[self.wait_index.min(BACKOFF_MS.len() - 1)]
    }

    /// [`get_wait`](Self::get_wait) as a [`Duration`].
    pub fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.get_wait())
    }

    /// Completed fraction in `[0, 1]`. A done (or empty) transfer is `1.0`.
    pub fn get_ratio(&self) -> f64 {
        if self.done || self.file_size == 0 || self.total_written >= self.file_size {
            return 1.0;
        }
        (self.total_written as f64 / self.file_size as f64).clamp(0.0, 1.0)
    }

    /// [`get_ratio`](Self::get_ratio) as a percentage.
    pub fn get_percent(&self) -> f64 {
        self.get_ratio() * 100.0
    }

    /// Bytes per second over the current run.
    ///
    /// Under one second of run time the raw byte count is returned.
    pub fn get_speed(&self) -> u64 {
        let seconds = self.timer.elapsed().as_secs();
        if seconds == 0 {
            self.progress
        } else {
            self.progress / seconds
        }
    }

    /// Bytes still to move.
    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.total_written)
    }

    /// Estimated time to completion at the current speed.
    pub fn estimated_time(&self) -> Option<Duration> {
        if self.done {
            return Some(Duration::ZERO);
        }
        let speed = self.get_speed();
        if speed == 0 {
            return None;
        }
        Some(Duration::from_secs(self.remaining().div_ceil(speed)))
    }

    /// Time since the last successful update (or start).
    pub fn idle(&self) -> Duration {
        self.timeout.elapsed()
    }

    /// Run time measured from the first byte.
    pub fn elapsed(&self) -> Duration {
        self.timer.elapsed()
    }

    /// Whether the idle clock has reached `threshold`.
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        self.timeout.expired(threshold)
    }

    /// Override the last outcome.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Last outcome.
    pub fn status(&self) -> Status {
        self.status
    }

    /// File size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes moved in the current run.
    pub fn progress(&self) -> u64 {
        self.progress
    }

    /// Bytes moved over the transfer's lifetime.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Retries since the last success.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Consecutive failures since the last success.
    pub fn wait_index(&self) -> usize {
        self.wait_index
    }

    /// Currently moving bytes.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Suspended by [`pause`](Self::pause).
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Terminal.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Terminated by [`cancel`](Self::cancel).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Terminated by [`error`](Self::error).
    pub fn is_errored(&self) -> bool {
        self.errored
    }
}

/// A transfer record together with the chunk window it owns.
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Progress and lifecycle.
    pub record: TransferRecord,
    /// In-flight chunks.
    pub window: Window,
}

impl Transfer {
    /// Pair a fresh record with `window`.
    pub fn new(file_size: u64, window: Window) -> Self {
        Self {
            record: TransferRecord::new(file_size),
            window,
        }
    }

    /// See [`TransferRecord::start`].
    pub fn start(&mut self) {
        self.record.start();
    }

    /// See [`TransferRecord::update`].
    pub fn update(&mut self, bytes: u64) {
        self.record.update(bytes);
    }

    /// Stop, discarding the window of an unfinished transfer.
    pub fn stop(&mut self) {
        if self.record.stop() {
            self.window.clear();
        }
    }

    /// See [`TransferRecord::pause`].
    pub fn pause(&mut self) {
        self.record.pause();
    }

    /// See [`TransferRecord::resume`].
    pub fn resume(&mut self) {
        self.record.resume();
    }

    /// Cancel, discarding the window.
    pub fn cancel(&mut self) {
        if self.record.cancel() {
            self.window.clear();
        }
    }

    /// Fail, discarding the window.
    pub fn error(&mut self) {
        if self.record.error() {
            self.window.clear();
        }
    }

    /// Finish cleanly.
    pub fn finish(&mut self) {
        if self.record.finish() {
            self.window.clear();
        }
    }
}
