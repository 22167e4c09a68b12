//! Protocol phase sequencer.
//!
//! A pure state machine: [`Machine::on_event`] takes an [`Event`] and
//! returns the next machine plus [`Action`]s for the runner to perform. No
//! I/O happens here; `relay-client` drives the machine from a task and
//! executes the work of each phase.
//!
//! The machine sits in one [`Phase`] at a time and keeps a deque of pending
//! phases. When a phase completes the next pending phase is entered; with
//! nothing pending the machine falls back to [`Phase::Idle`].

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use relay_types::ResponseStatus;

use crate::timeout::Timeout;

/// Poll interval while sleeping.
pub const SLEEP_POLL: Duration = Duration::from_millis(100);

/// Poll interval while idle with nothing pending.
pub const IDLE_POLL: Duration = Duration::from_millis(500);

/// Pause between consecutive phases.
pub const YIELD: Duration = Duration::from_millis(1);

/// One named step of the protocol sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Inactive. Initial state after [`Machine::kill`].
    None,
    /// Resting between explicit starts.
    Idle,
    /// Entry point of a run.
    Start,
    /// Resume a stopped run.
    Resume,
    /// Restart from scratch.
    Restart,
    /// Long-running work loop.
    Run,
    /// Waiting for the sleep clock.
    Sleep,
    /// Key exchange.
    Handshake,
    /// Join a group.
    Join,
    /// Open a long-lived tunnel.
    Tunnel,
    /// Fetch group membership.
    Group,
    /// Browse a member's shares.
    Browse,
    /// Search the group.
    Search,
    /// Open a transfer.
    Transfer,
    /// Pull chunks.
    Download,
    /// Push chunks.
    Upload,
    /// Send chat.
    Chat,
    /// Fetch router info.
    Info,
    /// Keepalive.
    Ping,
    /// Leave.
    Quit,
    /// Abort the run.
    Cancel,
    /// Wind down the run.
    Stop,
}

impl Phase {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::None => "none",
            Phase::Idle => "idle",
            Phase::Start => "start",
            Phase::Resume => "resume",
            Phase::Restart => "restart",
            Phase::Run => "run",
            Phase::Sleep => "sleep",
            Phase::Handshake => "handshake",
            Phase::Join => "join",
            Phase::Tunnel => "tunnel",
            Phase::Group => "group",
            Phase::Browse => "browse",
            Phase::Search => "search",
            Phase::Transfer => "transfer",
            Phase::Download => "download",
            Phase::Upload => "upload",
            Phase::Chat => "chat",
            Phase::Info => "info",
            Phase::Ping => "ping",
            Phase::Quit => "quit",
            Phase::Cancel => "cancel",
            Phase::Stop => "stop",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the last completed phase. Orthogonal to [`Phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// Nothing recorded.
    #[default]
    None,
    /// Completed.
    Success,
    /// Recoverable problem.
    Warning,
    /// Failed.
    Error,
    /// Informational.
    Info,
    /// Waiting on the peer.
    Pending,
    /// Aborted.
    Cancelled,
    /// Unclassified.
    Unknown,
}

impl Status {
    /// `none`, `success`, `info` or `pending`.
    pub fn is_valid(self) -> bool {
        matches!(
            self,
            Status::None | Status::Success | Status::Info | Status::Pending
        )
    }
}

impl From<ResponseStatus> for Status {
    fn from(status: ResponseStatus) -> Self {
        match status {
            ResponseStatus::Ok => Status::Success,
            ResponseStatus::Accepted | ResponseStatus::NoContent | ResponseStatus::Busy => {
                Status::Pending
            }
            ResponseStatus::BadRequest
            | ResponseStatus::Unauthorized
            | ResponseStatus::NotFound
            | ResponseStatus::TooManyRequests => Status::Warning,
            ResponseStatus::NotImplemented | ResponseStatus::InternalError => Status::Error,
        }
    }
}

/// What a phase handler decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Run the same phase again next tick.
    Stay,
    /// Phase complete, enter the next pending phase.
    Next,
    /// Phase complete, schedule these phases at the back first.
    Then(Vec<Phase>),
    /// Phase complete, sleep then enter the given phase.
    SleepThen(Phase, Duration),
}

/// Input to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Begin a run.
    Start,
    /// Wind down.
    Stop,
    /// Resume.
    Resume,
    /// Restart.
    Restart,
    /// Abort.
    Cancel,
    /// Tear down immediately.
    Kill,
    /// The owner's timeout predicate fired.
    TimedOut,
    /// A phase handler finished.
    Stepped {
        /// [`Machine::epoch`] observed when the phase was dispatched.
        epoch: u64,
        /// Handler decision.
        step: Step,
    },
}

/// Work for the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The machine entered this phase.
    Enter(Phase),
    /// Tick again after this long.
    Wait(Duration),
    /// The machine became inactive; stop ticking.
    Halt,
}

/// Phase sequencer state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    phase: Phase,
    pending: VecDeque<Phase>,
    status: Status,
    ignore: bool,
    sleep_delay: Duration,
    sleep_clock: Timeout,
    epoch: u64,
}

impl Machine {
    /// An idle machine.
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            pending: VecDeque::new(),
            status: Status::None,
            ignore: false,
            sleep_delay: Duration::ZERO,
            sleep_clock: Timeout::new(),
            epoch: 0,
        }
    }

    /// Process an event and return the new machine plus actions to execute.
    ///
    /// Control events clear the pending deque and bump the epoch, so a
    /// [`Event::Stepped`] from a phase dispatched before the control event
    /// is discarded.
    pub fn on_event(mut self, event: Event) -> (Self, Vec<Action>) {
        let before = self.phase;

        match event {
            Event::Start => self.enter(Phase::Start),
            Event::Stop => self.enter(Phase::Stop),
            Event::Resume => self.enter(Phase::Resume),
            Event::Restart => self.enter(Phase::Restart),
            Event::Cancel | Event::TimedOut => self.enter(Phase::Cancel),
            Event::Kill => self.enter(Phase::None),
            Event::Stepped { epoch, step } => {
                if epoch != self.epoch {
                    return (self, vec![]);
                }
                self.complete(step);
            }
        }

        let actions = self.actions(before, Instant::now());
        (self, actions)
    }

    /// [`on_event`](Self::on_event) in place.
    pub fn apply(&mut self, event: Event) -> Vec<Action> {
        let machine = std::mem::take(self);
        let (machine, actions) = machine.on_event(event);
        *self = machine;
        actions
    }

    fn enter(&mut self, phase: Phase) {
        self.pending.clear();
        self.phase = phase;
        self.epoch += 1;
    }

    fn complete(&mut self, step: Step) {
        match step {
            Step::Stay => return,
            Step::Next => {}
            Step::Then(phases) => {
                for phase in phases {
                    self.schedule(phase);
                }
            }
            Step::SleepThen(phase, delay) => self.sleep(phase, delay),
        }
        self.advance();
    }

    fn advance(&mut self) {
        self.phase = match self.pending.pop_front() {
            Some(next) => next,
            None if self.phase == Phase::None => Phase::None,
            None => Phase::Idle,
        };
    }

    fn actions(&self, before: Phase, now: Instant) -> Vec<Action> {
        if self.phase == Phase::None {
            return vec![Action::Halt];
        }

        let mut actions = Vec::with_capacity(2);
        if self.phase != before {
            actions.push(Action::Enter(self.phase));
        }
        actions.push(Action::Wait(self.poll_delay_at(now)));
        actions
    }

    /// How long the runner should wait before the next tick.
    pub fn poll_delay_at(&self, now: Instant) -> Duration {
        match self.phase {
            Phase::Sleep => self
                .sleep_clock
                .remaining_at(self.sleep_delay, now)
                .min(SLEEP_POLL),
            Phase::Idle if self.pending.is_empty() => IDLE_POLL,
            _ => YIELD,
        }
    }

    /// Built-in behaviour of `phase`, used when a handler has nothing
    /// specific to do.
    pub fn default_step(&self, phase: Phase) -> Step {
        self.default_step_at(phase, Instant::now())
    }

    /// [`default_step`](Self::default_step) at `now`.
    pub fn default_step_at(&self, phase: Phase, now: Instant) -> Step {
        match phase {
            Phase::None | Phase::Run => Step::Stay,
            Phase::Idle if self.pending.is_empty() => Step::Stay,
            Phase::Sleep if !self.sleep_clock.expired_at(self.sleep_delay, now) => Step::Stay,
            Phase::Resume | Phase::Restart => Step::Then(vec![Phase::Start]),
            Phase::Cancel => Step::Then(vec![Phase::Stop]),
            Phase::Stop => Step::Then(vec![Phase::Idle]),
            _ => Step::Next,
        }
    }

    /// Begin a run.
    pub fn start(&mut self) -> Vec<Action> {
        self.apply(Event::Start)
    }

    /// Wind down to idle.
    pub fn stop(&mut self) -> Vec<Action> {
        self.apply(Event::Stop)
    }

    /// Resume (re-enters start).
    pub fn resume(&mut self) -> Vec<Action> {
        self.apply(Event::Resume)
    }

    /// Restart (re-enters start).
    pub fn restart(&mut self) -> Vec<Action> {
        self.apply(Event::Restart)
    }

    /// Abort (moves to stop, then idle).
    pub fn cancel(&mut self) -> Vec<Action> {
        self.apply(Event::Cancel)
    }

    /// Become inactive immediately.
    pub fn kill(&mut self) -> Vec<Action> {
        self.apply(Event::Kill)
    }

    /// Sleep for `delay` once the current phase completes, then enter
    /// `next`. The sleep clock starts now.
    pub fn sleep(&mut self, next: Phase, delay: Duration) {
        self.pending.push_front(next);
        self.pending.push_front(Phase::Sleep);
        self.sleep_delay = delay;
        self.sleep_clock.restart();
    }

    /// Queue `phase` behind everything already pending. The current phase
    /// is left alone; use [`start`](Self::start) or
    /// [`cancel`](Self::cancel) to jump.
    ///
    /// No-op while ignoring.
    pub fn schedule(&mut self, phase: Phase) {
        if !self.ignore {
            self.pending.push_back(phase);
        }
    }

    /// Record an outcome. No-op while ignoring.
    pub fn set_status(&mut self, status: Status) {
        if !self.ignore {
            self.status = status;
        }
    }

    /// Freeze (or unfreeze) `schedule` and `set_status`.
    pub fn set_ignore(&mut self, ignore: bool) {
        self.ignore = ignore;
    }

    /// Whether state and status are frozen.
    pub fn is_ignoring(&self) -> bool {
        self.ignore
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Outcome of the last phase.
    pub fn status(&self) -> Status {
        self.status
    }

    /// `status().is_valid()`.
    pub fn is_valid(&self) -> bool {
        self.status.is_valid()
    }

    /// Pending phases, next first.
    pub fn pending(&self) -> impl Iterator<Item = Phase> + '_ {
        self.pending.iter().copied()
    }

    /// Control generation; bumped by every control transition.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Not [`Phase::None`].
    pub fn is_active(&self) -> bool {
        self.phase != Phase::None
    }

    /// Resting in idle.
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    /// Waiting for the sleep clock.
    pub fn is_sleeping(&self) -> bool {
        self.phase == Phase::Sleep
    }

    /// In a run (not idle, stopping, cancelling or inactive).
    pub fn is_running(&self) -> bool {
        !matches!(
            self.phase,
            Phase::None | Phase::Idle | Phase::Stop | Phase::Cancel
        )
    }

    /// Stopping, idle or inactive.
    pub fn is_stopped(&self) -> bool {
        matches!(self.phase, Phase::None | Phase::Idle | Phase::Stop)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Complete the current phase with its built-in behaviour.
    fn tick(machine: &mut Machine) -> Vec<Action> {
        let step = machine.default_step(machine.phase());
        let epoch = machine.epoch();
        machine.apply(Event::Stepped { epoch, step })
    }

    #[test]
    fn new_machine_is_idle() {
        let machine = Machine::new();
        assert_eq!(machine.phase(), Phase::Idle);
        assert_eq!(machine.status(), Status::None);
        assert!(machine.is_valid());
    }

    #[test]
    fn start_enters_start_and_clears_pending() {
        let mut machine = Machine::new();
        machine.schedule(Phase::Chat);

        let actions = machine.start();

        assert_eq!(machine.phase(), Phase::Start);
        assert_eq!(machine.pending().count(), 0);
        assert!(actions.contains(&Action::Enter(Phase::Start)));
    }

    #[test]
    fn schedule_queues_behind_pending() {
        let mut machine = Machine::new();
        machine.start();
        let epoch = machine.epoch();
        machine.apply(Event::Stepped {
            epoch,
            step: Step::Then(vec![Phase::Handshake, Phase::Join]),
        });

        machine.schedule(Phase::Chat);

        assert_eq!(machine.phase(), Phase::Handshake);
        assert_eq!(
            machine.pending().collect::<Vec<_>>(),
            vec![Phase::Join, Phase::Chat]
        );
    }

    #[test]
    fn phases_run_in_scheduled_order() {
        let mut machine = Machine::new();
        machine.start();
        let epoch = machine.epoch();
        machine.apply(Event::Stepped {
            epoch,
            step: Step::Then(vec![Phase::Handshake, Phase::Join, Phase::Group]),
        });

        let mut visited = vec![machine.phase()];
        while machine.phase() != Phase::Idle {
            tick(&mut machine);
            visited.push(machine.phase());
        }

        assert_eq!(
            visited,
            vec![Phase::Handshake, Phase::Join, Phase::Group, Phase::Idle]
        );
    }

    #[test]
    fn stay_repeats_phase() {
        let mut machine = Machine::new();
        machine.start();
        let epoch = machine.epoch();

        let actions = machine.apply(Event::Stepped {
            epoch,
            step: Step::Stay,
        });

        assert_eq!(machine.phase(), Phase::Start);
        assert_eq!(actions, vec![Action::Wait(YIELD)]);
    }

    #[test]
    fn empty_deque_falls_back_to_idle() {
        let mut machine = Machine::new();
        machine.start();
        tick(&mut machine);
        assert_eq!(machine.phase(), Phase::Idle);
    }

    #[test]
    fn stop_goes_idle() {
        let mut machine = Machine::new();
        machine.stop();
        assert_eq!(machine.phase(), Phase::Stop);

        tick(&mut machine);
        assert_eq!(machine.phase(), Phase::Idle);
    }

    #[test]
    fn resume_and_restart_reenter_start() {
        for control in [Machine::resume as fn(&mut Machine) -> Vec<Action>, Machine::restart] {
            let mut machine = Machine::new();
            control(&mut machine);
            tick(&mut machine);
            assert_eq!(machine.phase(), Phase::Start);
        }
    }

    #[test]
    fn cancel_goes_through_stop() {
        let mut machine = Machine::new();
        machine.start();
        machine.schedule(Phase::Transfer);

        machine.cancel();
        assert_eq!(machine.phase(), Phase::Cancel);
        assert_eq!(machine.pending().count(), 0);

        tick(&mut machine);
        assert_eq!(machine.phase(), Phase::Stop);
        tick(&mut machine);
        assert_eq!(machine.phase(), Phase::Idle);
    }

    #[test]
    fn timeout_cancels() {
        let mut machine = Machine::new();
        machine.start();
        machine.apply(Event::TimedOut);
        assert_eq!(machine.phase(), Phase::Cancel);
    }

    #[test]
    fn kill_halts() {
        let mut machine = Machine::new();
        machine.start();
        machine.schedule(Phase::Join);

        let actions = machine.kill();

        assert_eq!(actions, vec![Action::Halt]);
        assert!(!machine.is_active());
        tick(&mut machine);
        assert_eq!(machine.phase(), Phase::None);
    }

    #[test]
    fn stale_step_is_discarded() {
        let mut machine = Machine::new();
        machine.start();
        let stale = machine.epoch();

        machine.stop();
        let actions = machine.apply(Event::Stepped {
            epoch: stale,
            step: Step::Then(vec![Phase::Upload]),
        });

        assert!(actions.is_empty());
        assert_eq!(machine.phase(), Phase::Stop);
        assert_eq!(machine.pending().count(), 0);
    }

    #[test]
    fn sleep_pushes_to_front() {
        let mut machine = Machine::new();
        machine.start();
        machine.schedule(Phase::Chat);
        machine.sleep(Phase::Transfer, Duration::from_millis(100));

        assert_eq!(
            machine.pending().collect::<Vec<_>>(),
            vec![Phase::Sleep, Phase::Transfer, Phase::Chat]
        );
    }

    #[test]
    fn sleep_then_wakes_into_next_phase() {
        let mut machine = Machine::new();
        machine.sleep(Phase::Transfer, Duration::from_millis(100));

        tick(&mut machine);
        assert_eq!(machine.phase(), Phase::Sleep);

        std::thread::sleep(Duration::from_millis(150));
        tick(&mut machine);

        assert_eq!(machine.phase(), Phase::Transfer);
    }

    #[test]
    fn sleep_stays_until_clock_expires() {
        let mut machine = Machine::new();
        machine.sleep(Phase::Transfer, Duration::from_secs(60));
        tick(&mut machine);

        let now = Instant::now();
        assert_eq!(machine.default_step_at(Phase::Sleep, now), Step::Stay);
        assert_eq!(
            machine.default_step_at(Phase::Sleep, now + Duration::from_secs(61)),
            Step::Next
        );
        assert_eq!(machine.poll_delay_at(now), SLEEP_POLL);
    }

    #[test]
    fn sleep_then_step() {
        let mut machine = Machine::new();
        machine.start();
        let epoch = machine.epoch();

        machine.apply(Event::Stepped {
            epoch,
            step: Step::SleepThen(Phase::Upload, Duration::ZERO),
        });
        assert_eq!(machine.phase(), Phase::Sleep);

        tick(&mut machine);
        assert_eq!(machine.phase(), Phase::Upload);
    }

    #[test]
    fn idle_advances_only_when_something_pending() {
        let mut machine = Machine::new();
        assert_eq!(machine.default_step(Phase::Idle), Step::Stay);
        assert_eq!(machine.poll_delay_at(Instant::now()), IDLE_POLL);

        machine.schedule(Phase::Ping);
        tick(&mut machine);
        assert_eq!(machine.phase(), Phase::Ping);
    }

    #[test]
    fn ignore_freezes_state_and_status() {
        let mut machine = Machine::new();
        machine.set_status(Status::Success);
        machine.set_ignore(true);

        machine.schedule(Phase::Chat);
        machine.set_status(Status::Error);

        assert_eq!(machine.pending().count(), 0);
        assert_eq!(machine.status(), Status::Success);

        machine.set_ignore(false);
        machine.set_status(Status::Error);
        assert_eq!(machine.status(), Status::Error);
        assert!(!machine.is_valid());
    }

    #[test]
    fn status_validity() {
        assert!(Status::None.is_valid());
        assert!(Status::Success.is_valid());
        assert!(Status::Info.is_valid());
        assert!(Status::Pending.is_valid());
        assert!(!Status::Warning.is_valid());
        assert!(!Status::Error.is_valid());
        assert!(!Status::Cancelled.is_valid());
        assert!(!Status::Unknown.is_valid());
    }

    #[test]
    fn response_status_maps_to_status() {
        assert_eq!(Status::from(ResponseStatus::Ok), Status::Success);
        assert_eq!(Status::from(ResponseStatus::Busy), Status::Pending);
        assert_eq!(Status::from(ResponseStatus::NotFound), Status::Warning);
        assert_eq!(Status::from(ResponseStatus::InternalError), Status::Error);
    }

    #[test]
    fn running_predicates() {
        let mut machine = Machine::new();
        assert!(machine.is_stopped());
        assert!(!machine.is_running());

        machine.start();
        assert!(machine.is_running());

        machine.cancel();
        assert!(!machine.is_running());
    }
}
