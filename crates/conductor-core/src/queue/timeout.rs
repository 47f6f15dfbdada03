//! Timeout phase controller.
//!
//! One controller watches one running attempt. It tracks two budgets at the
//! same time:
//! - the budget of the current phase (setup, execution, cleanup), restarted
//!   on every phase transition
//! - the total budget, which phase transitions never touch
//!
//! Each budget warns once at `warning_threshold` of its limit and times out
//! once. Under [`TimeoutBehavior::Hard`] the first timeout ends the attempt.
//! Under [`TimeoutBehavior::Soft`] the controller moves to the cleanup phase
//! and the attempt gets the cleanup budget as a grace period; when that runs
//! out too, [`TimeoutSignal::GraceExpired`] is delivered.
//!
//! Signals go to the callback given to [`TimeoutController::start`]. The
//! callback runs on the timer task while the controller state is locked, so
//! it must not block and must not call back into the controller. Once
//! [`TimeoutController::dispose`] returns, the callback is never invoked
//! again. Dropping the controller disposes it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::config::{Phase, TimeoutBehavior, TimeoutConfig};
use crate::domain::ExecutionError;

/// Which budget a signal is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutScope {
    Phase,
    Total,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutScope::Phase => f.write_str("phase"),
            TimeoutScope::Total => f.write_str("total"),
        }
    }
}

/// A budget was exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "{scope} timeout in {phase} phase: {}ms elapsed, limit {}ms",
    .elapsed.as_millis(),
    .limit.as_millis()
)]
pub struct TimeoutError {
    pub scope: TimeoutScope,
    pub phase: Phase,
    pub elapsed: Duration,
    pub limit: Duration,
    pub behavior: TimeoutBehavior,
}

impl From<&TimeoutError> for ExecutionError {
    fn from(err: &TimeoutError) -> Self {
        ExecutionError::new(err.to_string()).with_code(ExecutionError::TIMEOUT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutSignal {
    /// `warning_threshold` of a budget has elapsed.
    Warning {
        scope: TimeoutScope,
        phase: Phase,
        elapsed: Duration,
        limit: Duration,
    },
    /// A budget ran out. Under hard behavior this is the last signal.
    TimedOut(TimeoutError),
    /// Soft behavior only: the cleanup grace period ran out as well.
    GraceExpired(TimeoutError),
}

pub type TimeoutCallback = Arc<dyn Fn(TimeoutSignal) + Send + Sync>;

/// Per-attempt timeout state machine.
pub struct TimeoutController {
    shared: Arc<Shared>,
    timer: JoinHandle<()>,
}

struct Shared {
    behavior: TimeoutBehavior,
    warning_threshold: f64,
    state: Mutex<State>,
    rearm: Notify,
    callback: TimeoutCallback,
}

struct State {
    phase: Phase,
    total_started: Instant,
    phase_started: Instant,
    total_budget: Duration,
    phase_budgets: [Duration; 3],
    phase_warned: bool,
    total_warned: bool,
    /// Set once a soft timeout has moved the attempt into cleanup.
    grace: Option<Grace>,
    terminated: bool,
    disposed: bool,
}

struct Grace {
    deadline: Instant,
    cause: TimeoutScope,
}

impl TimeoutController {
    /// Start both clocks in the setup phase and arm the timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &TimeoutConfig, callback: TimeoutCallback) -> Self {
        let now = Instant::now();
        let shared = Arc::new(Shared {
            behavior: config.behavior,
            warning_threshold: config.warning_threshold,
            state: Mutex::new(State {
                phase: Phase::Setup,
                total_started: now,
                phase_started: now,
                total_budget: config.total(),
                phase_budgets: [
                    config.phase_budget(Phase::Setup),
                    config.phase_budget(Phase::Execution),
                    config.phase_budget(Phase::Cleanup),
                ],
                phase_warned: false,
                total_warned: false,
                grace: None,
                terminated: false,
                disposed: false,
            }),
            rearm: Notify::new(),
            callback,
        });
        let timer = tokio::spawn(run_timer(Arc::clone(&shared)));
        Self { shared, timer }
    }

    /// Handle for the executor; stops working once the controller is gone.
    pub fn handle(&self) -> TimeoutHandle {
        TimeoutHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Enter `phase`: restart the phase clock and its warning.
    ///
    /// Ignored once a soft timeout has forced the cleanup phase, or after
    /// the controller terminated.
    pub fn transition_to_phase(&self, phase: Phase) {
        let mut state = self.shared.lock();
        if state.disposed || state.terminated || state.grace.is_some() {
            return;
        }
        state.phase = phase;
        state.phase_started = Instant::now();
        state.phase_warned = false;
        drop(state);
        self.shared.rearm.notify_one();
    }

    pub fn extend_phase_timeout(&self, by: Duration) {
        self.shared.extend(TimeoutScope::Phase, by);
    }

    pub fn extend_total_timeout(&self, by: Duration) {
        self.shared.extend(TimeoutScope::Total, by);
    }

    pub fn current_phase(&self) -> Phase {
        self.shared.lock().phase
    }

    pub fn phase_remaining(&self) -> Duration {
        self.shared.lock().phase_remaining(Instant::now())
    }

    pub fn total_remaining(&self) -> Duration {
        self.shared.lock().total_remaining(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.shared.lock().total_started)
    }

    /// Zero under hard behavior, the cleanup budget under soft behavior.
    pub fn grace_period(&self) -> Duration {
        match self.shared.behavior {
            TimeoutBehavior::Hard => Duration::ZERO,
            TimeoutBehavior::Soft => self.shared.lock().phase_budgets[slot(Phase::Cleanup)],
        }
    }

    /// Stop the timer. No callback fires after this returns.
    pub fn dispose(&self) {
        self.shared.lock().disposed = true;
        self.timer.abort();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }
}

impl Drop for TimeoutController {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for TimeoutController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("TimeoutController")
            .field("behavior", &self.shared.behavior)
            .field("phase", &state.phase)
            .field("terminated", &state.terminated)
            .field("disposed", &state.disposed)
            .finish()
    }
}

/// Executor-side view of a running attempt's controller.
///
/// Every method is a no-op (or returns `None`) once the controller has
/// been disposed, and for a [`detached`](TimeoutHandle::detached) handle.
#[derive(Clone, Default)]
pub struct TimeoutHandle {
    shared: Weak<Shared>,
}

impl TimeoutHandle {
    /// Handle not bound to any controller.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn extend_phase_timeout(&self, by: Duration) {
        if let Some(shared) = self.live() {
            shared.extend(TimeoutScope::Phase, by);
        }
    }

    pub fn extend_total_timeout(&self, by: Duration) {
        if let Some(shared) = self.live() {
            shared.extend(TimeoutScope::Total, by);
        }
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.live().map(|shared| shared.lock().phase)
    }

    pub fn phase_remaining(&self) -> Option<Duration> {
        self.live()
            .map(|shared| shared.lock().phase_remaining(Instant::now()))
    }

    pub fn total_remaining(&self) -> Option<Duration> {
        self.live()
            .map(|shared| shared.lock().total_remaining(Instant::now()))
    }

    fn live(&self) -> Option<Arc<Shared>> {
        let shared = self.shared.upgrade()?;
        let disposed = shared.lock().disposed;
        (!disposed).then_some(shared)
    }
}

impl fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutHandle")
            .field("live", &self.live().is_some())
            .finish()
    }
}

fn slot(phase: Phase) -> usize {
    match phase {
        Phase::Setup => 0,
        Phase::Execution => 1,
        Phase::Cleanup => 2,
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn warn_after(&self, budget: Duration) -> Duration {
        Duration::try_from_secs_f64(budget.as_secs_f64() * self.warning_threshold)
            .unwrap_or(budget)
    }

    /// Additive. A warning that already fired is re-armed when the new
    /// warning point still lies ahead; a fired timeout stays fired.
    fn extend(&self, scope: TimeoutScope, by: Duration) {
        let now = Instant::now();
        let mut state = self.lock();
        if state.disposed || state.terminated {
            return;
        }
        match scope {
            TimeoutScope::Phase => {
                let phase = slot(state.phase);
                state.phase_budgets[phase] = state.phase_budgets[phase].saturating_add(by);
                if let Some(grace) = state.grace.as_mut() {
                    grace.deadline += by;
                }
                let elapsed = now.saturating_duration_since(state.phase_started);
                if elapsed < self.warn_after(state.phase_budgets[phase]) {
                    state.phase_warned = false;
                }
            }
            TimeoutScope::Total => {
                state.total_budget = state.total_budget.saturating_add(by);
                let elapsed = now.saturating_duration_since(state.total_started);
                if elapsed < self.warn_after(state.total_budget) {
                    state.total_warned = false;
                }
            }
        }
        drop(state);
        self.rearm.notify_one();
    }

    /// Deliver every signal due at `now`.
    fn fire_due(&self, state: &mut State, now: Instant) {
        if let Some(grace) = &state.grace {
            if now >= grace.deadline {
                let err = TimeoutError {
                    scope: grace.cause,
                    phase: Phase::Cleanup,
                    elapsed: now.saturating_duration_since(state.phase_started),
                    limit: state.phase_budgets[slot(Phase::Cleanup)],
                    behavior: self.behavior,
                };
                state.terminated = true;
                (self.callback)(TimeoutSignal::GraceExpired(err));
            }
            return;
        }

        let phase_budget = state.phase_budgets[slot(state.phase)];
        let phase_elapsed = now.saturating_duration_since(state.phase_started);
        let total_elapsed = now.saturating_duration_since(state.total_started);

        if !state.phase_warned && phase_elapsed >= self.warn_after(phase_budget) {
            state.phase_warned = true;
            (self.callback)(TimeoutSignal::Warning {
                scope: TimeoutScope::Phase,
                phase: state.phase,
                elapsed: phase_elapsed,
                limit: phase_budget,
            });
        }
        if !state.total_warned && total_elapsed >= self.warn_after(state.total_budget) {
            state.total_warned = true;
            (self.callback)(TimeoutSignal::Warning {
                scope: TimeoutScope::Total,
                phase: state.phase,
                elapsed: total_elapsed,
                limit: state.total_budget,
            });
        }

        let expired = if total_elapsed >= state.total_budget {
            Some((TimeoutScope::Total, total_elapsed, state.total_budget))
        } else if phase_elapsed >= phase_budget {
            Some((TimeoutScope::Phase, phase_elapsed, phase_budget))
        } else {
            None
        };
        let Some((scope, elapsed, limit)) = expired else {
            return;
        };

        let err = TimeoutError {
            scope,
            phase: state.phase,
            elapsed,
            limit,
            behavior: self.behavior,
        };
        match self.behavior {
            TimeoutBehavior::Hard => state.terminated = true,
            TimeoutBehavior::Soft => {
                state.phase = Phase::Cleanup;
                state.phase_started = now;
                state.phase_warned = true;
                state.grace = Some(Grace {
                    deadline: now + state.phase_budgets[slot(Phase::Cleanup)],
                    cause: scope,
                });
            }
        }
        (self.callback)(TimeoutSignal::TimedOut(err));
    }
}

impl State {
    fn phase_remaining(&self, now: Instant) -> Duration {
        match &self.grace {
            Some(grace) => grace.deadline.saturating_duration_since(now),
            None => (self.phase_started + self.phase_budgets[slot(self.phase)])
                .saturating_duration_since(now),
        }
    }

    fn total_remaining(&self, now: Instant) -> Duration {
        (self.total_started + self.total_budget).saturating_duration_since(now)
    }

    fn next_deadline(&self, shared: &Shared) -> Instant {
        if let Some(grace) = &self.grace {
            return grace.deadline;
        }
        let phase_budget = self.phase_budgets[slot(self.phase)];
        let mut next = (self.phase_started + phase_budget).min(self.total_started + self.total_budget);
        if !self.phase_warned {
            next = next.min(self.phase_started + shared.warn_after(phase_budget));
        }
        if !self.total_warned {
            next = next.min(self.total_started + shared.warn_after(self.total_budget));
        }
        next
    }
}

async fn run_timer(shared: Arc<Shared>) {
    loop {
        let deadline = {
            let mut state = shared.lock();
            if state.disposed || state.terminated {
                return;
            }
            shared.fire_due(&mut state, Instant::now());
            if state.terminated {
                return;
            }
            state.next_deadline(&shared)
        };
        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = shared.rearm.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    struct Recorder {
        signals: Arc<Mutex<Vec<TimeoutSignal>>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                signals: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn callback(&self) -> TimeoutCallback {
            let signals = Arc::clone(&self.signals);
            Arc::new(move |signal| signals.lock().unwrap().push(signal))
        }

        fn all(&self) -> Vec<TimeoutSignal> {
            self.signals.lock().unwrap().clone()
        }

        fn timeouts(&self) -> usize {
            self.all()
                .iter()
                .filter(|s| matches!(s, TimeoutSignal::TimedOut(_)))
                .count()
        }

        fn warnings(&self, scope: TimeoutScope) -> usize {
            self.all()
                .iter()
                .filter(|s| matches!(s, TimeoutSignal::Warning { scope: sc, .. } if *sc == scope))
                .count()
        }
    }

    fn config(f: impl FnOnce(&mut TimeoutConfig)) -> TimeoutConfig {
        let mut c = TimeoutConfig::default();
        f(&mut c);
        c
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn hard_total_timeout_fires_once_and_not_after_dispose() {
        let rec = Recorder::new();
        let cfg = config(|c| {
            c.total_ms = 5_000;
            c.behavior = TimeoutBehavior::Hard;
        });
        let controller = TimeoutController::start(&cfg, rec.callback());

        sleep(ms(4_999)).await;
        assert_eq!(rec.timeouts(), 0);

        sleep(ms(2)).await;
        assert_eq!(rec.timeouts(), 1);
        let Some(TimeoutSignal::TimedOut(err)) = rec.all().into_iter().last() else {
            panic!("expected a timeout");
        };
        assert_eq!(err.scope, TimeoutScope::Total);
        assert_eq!(err.limit, ms(5_000));
        assert_eq!(err.behavior, TimeoutBehavior::Hard);

        controller.dispose();
        let before = rec.all().len();
        sleep(ms(60_000)).await;
        assert_eq!(rec.all().len(), before);
        assert_eq!(controller.total_remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn warning_fires_once_at_threshold() {
        let rec = Recorder::new();
        let cfg = config(|c| {
            c.total_ms = 10_000;
            c.warning_threshold = 0.8;
        });
        let _controller = TimeoutController::start(&cfg, rec.callback());

        sleep(ms(7_999)).await;
        assert!(rec.all().is_empty());

        sleep(ms(2)).await;
        assert_eq!(rec.warnings(TimeoutScope::Total), 1);

        sleep(ms(1_900)).await;
        assert_eq!(rec.warnings(TimeoutScope::Total), 1);
        assert_eq!(rec.timeouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_before_deadline_suppresses_everything() {
        let rec = Recorder::new();
        let cfg = config(|c| c.total_ms = 2_000);
        let controller = TimeoutController::start(&cfg, rec.callback());

        sleep(ms(500)).await;
        controller.dispose();
        assert!(controller.is_disposed());

        sleep(ms(120_000)).await;
        assert!(rec.all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_disposes() {
        let rec = Recorder::new();
        let cfg = config(|c| c.total_ms = 1_000);
        drop(TimeoutController::start(&cfg, rec.callback()));

        sleep(ms(5_000)).await;
        assert!(rec.all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn phase_transition_rearms_phase_warning_only() {
        let rec = Recorder::new();
        let cfg = config(|c| {
            c.setup_ms = 1_000;
            c.execution_ms = 1_000;
            c.total_ms = 100_000;
            c.warning_threshold = 0.5;
        });
        let controller = TimeoutController::start(&cfg, rec.callback());

        sleep(ms(501)).await;
        assert_eq!(rec.warnings(TimeoutScope::Phase), 1);

        controller.transition_to_phase(Phase::Execution);
        assert_eq!(controller.current_phase(), Phase::Execution);
        assert_eq!(controller.phase_remaining(), ms(1_000));
        assert_eq!(controller.total_remaining(), ms(100_000 - 501));

        sleep(ms(501)).await;
        let phases: Vec<Phase> = rec
            .all()
            .iter()
            .filter_map(|s| match s {
                TimeoutSignal::Warning {
                    scope: TimeoutScope::Phase,
                    phase,
                    ..
                } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![Phase::Setup, Phase::Execution]);
        assert_eq!(rec.warnings(TimeoutScope::Total), 0);
        assert_eq!(rec.timeouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn soft_timeout_enters_cleanup_then_grace_expires() {
        let rec = Recorder::new();
        let cfg = config(|c| {
            c.setup_ms = 1_000;
            c.cleanup_ms = 2_000;
            c.behavior = TimeoutBehavior::Soft;
        });
        let controller = TimeoutController::start(&cfg, rec.callback());
        assert_eq!(controller.grace_period(), ms(2_000));

        sleep(ms(1_001)).await;
        assert_eq!(rec.timeouts(), 1);
        assert_eq!(controller.current_phase(), Phase::Cleanup);

        // forced cleanup cannot be left
        controller.transition_to_phase(Phase::Execution);
        assert_eq!(controller.current_phase(), Phase::Cleanup);

        sleep(ms(2_000)).await;
        let last = rec.all().into_iter().last();
        assert!(
            matches!(
                last,
                Some(TimeoutSignal::GraceExpired(TimeoutError {
                    scope: TimeoutScope::Phase,
                    phase: Phase::Cleanup,
                    ..
                }))
            ),
            "{last:?}"
        );

        let count = rec.all().len();
        sleep(ms(60_000)).await;
        assert_eq!(rec.all().len(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_behavior_has_no_grace_period() {
        let cfg = config(|c| c.behavior = TimeoutBehavior::Hard);
        let controller = TimeoutController::start(&cfg, Arc::new(|_| {}));
        assert_eq!(controller.grace_period(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn extension_postpones_timeout() {
        let rec = Recorder::new();
        let cfg = config(|c| {
            c.total_ms = 5_000;
            c.behavior = TimeoutBehavior::Hard;
        });
        let controller = TimeoutController::start(&cfg, rec.callback());

        sleep(ms(3_000)).await;
        controller.handle().extend_total_timeout(ms(5_000));
        assert_eq!(controller.total_remaining(), ms(7_000));

        sleep(ms(2_500)).await;
        assert_eq!(rec.timeouts(), 0);

        sleep(ms(4_501)).await;
        assert_eq!(rec.timeouts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_goes_dead_after_dispose() {
        let cfg = config(|c| c.total_ms = 5_000);
        let controller = TimeoutController::start(&cfg, Arc::new(|_| {}));
        let handle = controller.handle();
        assert_eq!(handle.current_phase(), Some(Phase::Setup));

        controller.dispose();
        assert_eq!(handle.total_remaining(), None);
        handle.extend_total_timeout(ms(1_000));
        assert_eq!(TimeoutHandle::detached().phase_remaining(), None);
    }

    #[test]
    fn timeout_error_becomes_timeout_execution_error() {
        let err = TimeoutError {
            scope: TimeoutScope::Total,
            phase: Phase::Execution,
            elapsed: ms(5_001),
            limit: ms(5_000),
            behavior: TimeoutBehavior::Hard,
        };
        let exec = ExecutionError::from(&err);
        assert!(exec.is_timeout());
        assert!(exec.message.contains("total timeout in execution phase"));
    }
}
