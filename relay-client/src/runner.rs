//! Drives a [`Machine`] from a tokio task.
//!
//! The machine itself is pure; this module owns the loop that asks a
//! [`PhaseHandler`] to do the work of the current phase, feeds the result
//! back as [`Event::Stepped`], and sleeps for whatever the machine says.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use relay_core::{Action, Event, Machine, Phase, Status, Step};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::ClientError;

/// Delay before retrying a phase that failed.
pub const ERROR_DELAY: Duration = Duration::from_secs(3);

/// Shared handle to a machine.
///
/// The runner and the application both hold one. Every mutation wakes the
/// runner so an idle machine reacts without waiting out its poll interval.
#[derive(Clone, Default)]
pub struct MachineHandle {
    inner: Arc<Mutex<Machine>>,
    wake: Arc<Notify>,
}

impl MachineHandle {
    /// Handle to a fresh idle machine.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, event: Event) -> Vec<Action> {
        let actions = self.inner.lock().apply(event);
        self.wake.notify_one();
        actions
    }

    fn with<R>(&self, f: impl FnOnce(&mut Machine) -> R) -> R {
        let result = f(&mut self.inner.lock());
        self.wake.notify_one();
        result
    }

    /// Begin a run.
    pub fn start(&self) {
        self.apply(Event::Start);
    }

    /// Wind down to idle.
    pub fn stop(&self) {
        self.apply(Event::Stop);
    }

    /// Resume a stopped run.
    pub fn resume(&self) {
        self.apply(Event::Resume);
    }

    /// Restart from scratch.
    pub fn restart(&self) {
        self.apply(Event::Restart);
    }

    /// Abort the run.
    pub fn cancel(&self) {
        self.apply(Event::Cancel);
    }

    /// Stop the runner for good.
    pub fn kill(&self) {
        self.apply(Event::Kill);
    }

    /// Schedule `phase` after everything already pending.
    pub fn schedule(&self, phase: Phase) {
        self.with(|m| m.schedule(phase));
    }

    /// Record an outcome.
    pub fn set_status(&self, status: Status) {
        self.with(|m| m.set_status(status));
    }

    /// Freeze (or unfreeze) state and status changes.
    pub fn set_ignore(&self, ignore: bool) {
        self.with(|m| m.set_ignore(ignore));
    }

    /// Sleep for `delay` once the current phase completes, then enter `next`.
    pub fn sleep(&self, next: Phase, delay: Duration) {
        self.with(|m| m.sleep(next, delay));
    }

    /// Built-in behaviour of `phase`.
    pub fn default_step(&self, phase: Phase) -> Step {
        self.inner.lock().default_step(phase)
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.lock().phase()
    }

    /// Outcome of the last phase.
    pub fn status(&self) -> Status {
        self.inner.lock().status()
    }

    /// Pending phases, next first.
    pub fn pending(&self) -> Vec<Phase> {
        self.inner.lock().pending().collect()
    }

    /// Not killed.
    pub fn is_active(&self) -> bool {
        self.inner.lock().is_active()
    }

    /// In a run.
    pub fn is_running(&self) -> bool {
        self.inner.lock().is_running()
    }

    /// Copy of the machine as it is now.
    pub fn snapshot(&self) -> Machine {
        self.inner.lock().clone()
    }

    fn current(&self) -> (Phase, u64) {
        let machine = self.inner.lock();
        (machine.phase(), machine.epoch())
    }
}

impl std::fmt::Debug for MachineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let machine = self.inner.lock();
        f.debug_struct("MachineHandle")
            .field("phase", &machine.phase())
            .field("status", &machine.status())
            .finish()
    }
}

/// Work done in each phase.
#[async_trait]
pub trait PhaseHandler: Send {
    /// Do the work of `phase` and say what comes next.
    ///
    /// A panic here is caught by the runner and handled like a
    /// non-transient error.
    async fn on_phase(&mut self, phase: Phase, machine: &MachineHandle)
        -> Result<Step, ClientError>;

    /// Checked before every tick; `true` cancels the run.
    fn timeout(&self) -> bool {
        false
    }

    /// Called when `phase` failed. Returns how long to sleep before the
    /// phase runs again.
    fn on_error(&mut self, _phase: Phase, _error: &ClientError) -> Duration {
        ERROR_DELAY
    }
}

/// Run `handler` against `machine` until the machine is killed.
pub async fn run<H: PhaseHandler>(machine: MachineHandle, mut handler: H) {
    loop {
        if machine.is_running() && handler.timeout() {
            tracing::debug!(phase = %machine.phase(), "timed out");
            machine.apply(Event::TimedOut);
        }

        let (phase, epoch) = machine.current();
        if phase == Phase::None {
            return;
        }

        // A panicking handler fails the phase instead of the runner.
        let result = match AssertUnwindSafe(handler.on_phase(phase, &machine))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(ClientError::Panicked(panic_message(panic.as_ref()))),
        };

        let step = match result {
            Ok(step) => step,
            Err(error) => {
                let delay = handler.on_error(phase, &error);
                tracing::warn!(
                    %phase,
                    %error,
                    delay_ms = delay.as_millis() as u64,
                    "phase failed"
                );
                machine.set_status(if error.is_transient() {
                    Status::Warning
                } else {
                    Status::Error
                });
                Step::SleepThen(phase, delay)
            }
        };

        let actions = machine.inner.lock().apply(Event::Stepped { epoch, step });
        let mut wait = relay_core::machine::YIELD;
        for action in actions {
            match action {
                Action::Enter(next) => tracing::trace!(from = %phase, to = %next, "phase"),
                Action::Wait(delay) => wait = delay,
                Action::Halt => return,
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = machine.wake.notified() => {}
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn [`run`] on the current runtime.
pub fn spawn<H>(machine: MachineHandle, handler: H) -> JoinHandle<()>
where
    H: PhaseHandler + 'static,
{
    tokio::spawn(run(machine, handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records every phase it is asked to run.
    struct Recorder {
        seen: Arc<Mutex<Vec<Phase>>>,
        fail_join: u32,
        timed_out: Arc<AtomicU32>,
    }

    impl Recorder {
        fn new() -> (Self, Arc<Mutex<Vec<Phase>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    seen: seen.clone(),
                    fail_join: 0,
                    timed_out: Arc::new(AtomicU32::new(0)),
                },
                seen,
            )
        }
    }

    #[async_trait]
    impl PhaseHandler for Recorder {
        async fn on_phase(
            &mut self,
            phase: Phase,
            machine: &MachineHandle,
        ) -> Result<Step, ClientError> {
            if phase != Phase::Idle && phase != Phase::Sleep {
                self.seen.lock().push(phase);
            }
            match phase {
                Phase::Start => Ok(Step::Then(vec![Phase::Handshake, Phase::Join, Phase::Quit])),
                Phase::Join if self.fail_join > 0 => {
                    self.fail_join -= 1;
                    Err(ClientError::Transport(TransportError::Timeout))
                }
                Phase::Quit => {
                    machine.kill();
                    Ok(Step::Next)
                }
                other => Ok(machine.default_step(other)),
            }
        }

        fn timeout(&self) -> bool {
            self.timed_out.load(Ordering::SeqCst) > 0
        }

        fn on_error(&mut self, _phase: Phase, _error: &ClientError) -> Duration {
            Duration::from_millis(10)
        }
    }

    // =========================================================================
    // Sequencing
    // =========================================================================

    #[tokio::test]
    async fn runs_scheduled_phases_in_order() {
        let (handler, seen) = Recorder::new();
        let machine = MachineHandle::new();
        machine.start();

        spawn(machine.clone(), handler).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![Phase::Start, Phase::Handshake, Phase::Join, Phase::Quit]
        );
        assert!(!machine.is_active());
    }

    #[tokio::test]
    async fn failed_phase_sleeps_then_retries() {
        let (mut handler, seen) = Recorder::new();
        handler.fail_join = 2;
        let machine = MachineHandle::new();
        machine.start();

        spawn(machine.clone(), handler).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                Phase::Start,
                Phase::Handshake,
                Phase::Join,
                Phase::Join,
                Phase::Join,
                Phase::Quit
            ]
        );
        // Transient failures leave a warning behind.
        assert_eq!(machine.status(), Status::Warning);
    }

    /// Panics the first time it is asked to join.
    struct Fragile {
        inner: Recorder,
        panicked: bool,
    }

    #[async_trait]
    impl PhaseHandler for Fragile {
        async fn on_phase(
            &mut self,
            phase: Phase,
            machine: &MachineHandle,
        ) -> Result<Step, ClientError> {
            if phase == Phase::Join && !self.panicked {
                self.panicked = true;
                panic!("join handler bug");
            }
            self.inner.on_phase(phase, machine).await
        }

        fn on_error(&mut self, phase: Phase, error: &ClientError) -> Duration {
            assert!(matches!(error, ClientError::Panicked(m) if m == "join handler bug"));
            self.inner.on_error(phase, error)
        }
    }

    #[tokio::test]
    async fn panicking_phase_is_retried_not_fatal() {
        let (inner, seen) = Recorder::new();
        let machine = MachineHandle::new();
        machine.start();

        let handler = Fragile {
            inner,
            panicked: false,
        };
        spawn(machine.clone(), handler)
            .await
            .expect("runner survives the panic");

        assert_eq!(
            *seen.lock(),
            vec![Phase::Start, Phase::Handshake, Phase::Join, Phase::Quit]
        );
    }

    #[tokio::test]
    async fn idle_machine_wakes_on_schedule() {
        let (handler, seen) = Recorder::new();
        let machine = MachineHandle::new();
        let task = spawn(machine.clone(), handler);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().is_empty());

        machine.schedule(Phase::Quit);
        task.await.unwrap();
        assert_eq!(*seen.lock(), vec![Phase::Quit]);
    }

    #[tokio::test]
    async fn timeout_cancels_run() {
        let (handler, seen) = Recorder::new();
        let timed_out = handler.timed_out.clone();
        let machine = MachineHandle::new();

        timed_out.store(1, Ordering::SeqCst);
        machine.start();
        let task = spawn(machine.clone(), handler);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Cancel -> Stop -> Idle, and the run never got past start.
        assert!(machine.snapshot().is_idle());
        assert!(!seen.lock().contains(&Phase::Handshake));

        machine.kill();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn kill_halts_runner() {
        let (handler, _) = Recorder::new();
        let machine = MachineHandle::new();
        let task = spawn(machine.clone(), handler);

        machine.kill();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("runner halts")
            .unwrap();
    }
}
