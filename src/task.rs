//! Task definition — scheduled work items and their trigger logic
//!
//! A `ScheduleBuilder` describes a one-shot, fixed-delay or fixed-rate task,
//! optionally time-sharing under a `TimeBudget`. The loop turns it into a
//! `ScheduledTask`: a promise plus the body plus a small atomic header that the
//! timer heap orders and indexes.
//!
//! Period encoding inside the header:
//! - `0`: one-shot
//! - `< 0`: fixed delay of `-period`, measured from the end of the last run
//! - `> 0`: fixed rate, next logical trigger is `last trigger + period`
//!
//! Author: Moroya Sakamoto

use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::budget::TimeBudget;
use crate::clock::Clock;
use crate::error::{catch_panic, FutureError, LoopError, TaskError};
use crate::event_loop::{loop_guard, LoopHandle, Shared};
use crate::policy::{Completion, CompletionPolicy, FutureView, LoopGuard};
use crate::promise::Promise;
use crate::scheduler::{HeapNode, TaskKey, INDEX_NOT_IN_QUEUE};

/// Scheduling hints attached to a task (bit set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TaskFeatures(pub u8);

impl TaskFeatures {
    pub const NONE: TaskFeatures = TaskFeatures(0);
    /// Yields to immediate work that shares its trigger time
    pub const LOW_PRIORITY: TaskFeatures = TaskFeatures(1);
    /// Periodic task that drops to low priority after its first run
    pub const PRIORITY_DECREASABLE: TaskFeatures = TaskFeatures(1 << 1);
    /// Caller relies on FIFO order with other tasks it submitted
    pub const LOCAL_ORDER: TaskFeatures = TaskFeatures(1 << 2);
    /// A failing periodic run is logged and the task keeps its schedule
    pub const CONTINUE_ON_ERROR: TaskFeatures = TaskFeatures(1 << 3);
    /// Immediate job that runs only after every due timer has fired
    pub const DRAIN_TIMERS_FIRST: TaskFeatures = TaskFeatures(1 << 4);

    pub const fn contains(self, other: TaskFeatures) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: TaskFeatures) -> TaskFeatures {
        TaskFeatures(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TaskFeatures {
    type Output = TaskFeatures;

    fn bitor(self, rhs: TaskFeatures) -> TaskFeatures {
        self.union(rhs)
    }
}

impl BitOrAssign for TaskFeatures {
    fn bitor_assign(&mut self, rhs: TaskFeatures) {
        *self = self.union(rhs);
    }
}

/// Outcome of one time-sharing invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// Not finished, call again at the next trigger
    Continue,
    /// Finished with a result
    Done(T),
}

/// What a task body can see about the invocation it is running in
#[derive(Clone, Copy)]
pub struct TaskContext<'a> {
    handle: &'a LoopHandle,
    clock: &'a dyn Clock,
    tick_time: i64,
    trigger_time: i64,
    run_count: u64,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(handle: &'a LoopHandle, clock: &'a dyn Clock, tick_time: i64) -> Self {
        Self {
            handle,
            clock,
            tick_time,
            trigger_time: tick_time,
            run_count: 0,
        }
    }

    pub(crate) fn with_trigger(self, trigger_time: i64, run_count: u64) -> Self {
        Self {
            trigger_time,
            run_count,
            ..self
        }
    }

    /// Loop running this task
    pub fn handle(&self) -> &'a LoopHandle {
        self.handle
    }

    /// Clock reading taken once at the start of the current tick
    pub fn tick_time(&self) -> i64 {
        self.tick_time
    }

    /// Logical trigger time of this invocation
    pub fn trigger_time(&self) -> i64 {
        self.trigger_time
    }

    /// Live clock reading
    pub fn now(&self) -> i64 {
        self.clock.now_nanos()
    }

    /// 1 for the first invocation
    pub fn run_count(&self) -> u64 {
        self.run_count
    }
}

type Body<T> = Box<dyn FnMut(&TaskContext<'_>) -> Result<Step<T>, FutureError> + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduleKind {
    Once,
    FixedDelay,
    FixedRate,
}

/// Description of a task to schedule on a loop
pub struct ScheduleBuilder<T> {
    body: Body<T>,
    /// Built from a runnable that never finishes on its own
    repeating: bool,
    kind: ScheduleKind,
    initial_delay: i64,
    interval: i64,
    timeout: Option<i64>,
    features: TaskFeatures,
}

/// Validated schedule, ready to become a `ScheduledTask`
pub(crate) struct Plan<T> {
    body: Body<T>,
    initial_delay: i64,
    period: i64,
    timeout: Option<i64>,
    features: TaskFeatures,
}

impl<T: Clone + Send + 'static> ScheduleBuilder<T> {
    fn from_body(body: Body<T>, repeating: bool) -> Self {
        Self {
            body,
            repeating,
            kind: ScheduleKind::Once,
            initial_delay: 0,
            interval: 0,
            timeout: None,
            features: TaskFeatures::NONE,
        }
    }

    /// One-shot task producing a value
    pub fn once<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::once_result(move || Ok::<T, TaskError>(f()))
    }

    /// One-shot task that may fail
    pub fn once_result<F, E>(f: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<TaskError>,
    {
        let mut f = Some(f);
        Self::from_body(
            Box::new(move |_ctx: &TaskContext<'_>| match f.take() {
                Some(f) => f().map(Step::Done).map_err(FutureError::failed),
                None => Err(FutureError::Cancelled),
            }),
            false,
        )
    }

    /// Task that may need several invocations to produce its value
    pub fn time_sharing<F>(mut f: F) -> Self
    where
        F: FnMut(&TaskContext<'_>) -> Result<Step<T>, TaskError> + Send + 'static,
    {
        Self::from_body(Box::new(move |ctx: &TaskContext<'_>| f(ctx).map_err(FutureError::failed)), false)
    }

    /// Run once after `delay` (negative delays run immediately)
    pub fn delay(mut self, delay: i64) -> Self {
        self.kind = ScheduleKind::Once;
        self.initial_delay = delay;
        self.interval = 0;
        self
    }

    /// Repeat with `delay` between the end of one run and the next trigger
    pub fn fixed_delay(mut self, initial_delay: i64, delay: i64) -> Self {
        self.kind = ScheduleKind::FixedDelay;
        self.initial_delay = initial_delay;
        self.interval = delay;
        self
    }

    /// Repeat on the logical grid `initial_delay + k * period`
    pub fn fixed_rate(mut self, initial_delay: i64, period: i64) -> Self {
        self.kind = ScheduleKind::FixedRate;
        self.initial_delay = initial_delay;
        self.interval = period;
        self
    }

    /// Total time budget for a periodic task, counted from its first trigger
    pub fn timeout(mut self, total: i64) -> Self {
        self.timeout = Some(total);
        self
    }

    pub fn features(mut self, features: TaskFeatures) -> Self {
        self.features |= features;
        self
    }

    pub(crate) fn plan(self) -> Result<Plan<T>, LoopError> {
        let (initial_delay, period) = match self.kind {
            ScheduleKind::Once => {
                if self.repeating {
                    return Err(LoopError::InvalidPeriod(0));
                }
                (self.initial_delay.max(0), 0)
            }
            ScheduleKind::FixedDelay => {
                if self.interval <= 0 {
                    return Err(LoopError::InvalidPeriod(self.interval));
                }
                (self.initial_delay.max(0), -self.interval)
            }
            ScheduleKind::FixedRate => {
                if self.initial_delay < 0 {
                    return Err(LoopError::NegativeInitialDelay(self.initial_delay));
                }
                if self.interval <= 0 {
                    return Err(LoopError::InvalidPeriod(self.interval));
                }
                (self.initial_delay, self.interval)
            }
        };
        if let Some(total) = self.timeout {
            if total <= 0 {
                return Err(LoopError::InvalidTimeout(total));
            }
        }
        Ok(Plan {
            body: self.body,
            initial_delay,
            period,
            timeout: self.timeout,
            features: self.features,
        })
    }
}

impl ScheduleBuilder<()> {
    /// Runnable repeated until cancelled; needs `fixed_delay` or `fixed_rate`
    pub fn periodic<F>(mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::from_body(
            Box::new(move |_ctx: &TaskContext<'_>| {
                f();
                Ok(Step::Continue)
            }),
            true,
        )
    }

    /// Fallible runnable repeated until cancelled or until it fails
    pub fn periodic_result<F, E>(mut f: F) -> Self
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: Into<TaskError>,
    {
        Self::from_body(
            Box::new(move |_ctx: &TaskContext<'_>| f().map(|()| Step::Continue).map_err(FutureError::failed)),
            true,
        )
    }
}

const PHASE_SCHEDULED: u8 = 0;
/// One-shot body is executing; cancellation is no longer possible
const PHASE_RUNNING: u8 = 1;
const PHASE_CANCELLED: u8 = 2;

/// Heap-facing part of a scheduled task
pub(crate) struct TaskHeader {
    id: AtomicU64,
    next_trigger_time: AtomicI64,
    queue_index: AtomicUsize,
    phase: AtomicU8,
    demoted: AtomicBool,
    queue_id: u32,
    period: i64,
    initial_delay: i64,
    features: TaskFeatures,
}

impl TaskHeader {
    fn new(period: i64, initial_delay: i64, features: TaskFeatures) -> Self {
        Self {
            id: AtomicU64::new(0),
            next_trigger_time: AtomicI64::new(0),
            queue_index: AtomicUsize::new(INDEX_NOT_IN_QUEUE),
            phase: AtomicU8::new(PHASE_SCHEDULED),
            demoted: AtomicBool::new(false),
            queue_id: 0,
            period,
            initial_delay,
            features,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn next_trigger_time(&self) -> i64 {
        self.next_trigger_time.load(Ordering::Relaxed)
    }

    /// Low priority now, either by flag or by demotion
    pub(crate) fn is_low_priority(&self) -> bool {
        self.features.contains(TaskFeatures::LOW_PRIORITY) || self.demoted.load(Ordering::Relaxed)
    }

    pub(crate) fn key(&self) -> TaskKey {
        TaskKey {
            queue_id: self.queue_id,
            trigger_time: self.next_trigger_time(),
            id: self.id(),
        }
    }

    fn try_mark_running(&self) -> bool {
        self.phase
            .compare_exchange(PHASE_SCHEDULED, PHASE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_mark_cancelled(&self) -> bool {
        self.phase
            .compare_exchange(PHASE_SCHEDULED, PHASE_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Result of offering a tick to a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fired {
    /// Promise settled, drop the task
    Finished,
    /// Next trigger updated, push it back
    Reschedule,
    /// Trigger time not reached
    NotDue,
}

/// Type-erased scheduled task as seen by the loop and the timer heap
pub(crate) trait Trigger: Send + Sync {
    fn header(&self) -> &TaskHeader;

    /// Assign the loop id and first trigger time; false if already settled
    fn accept(&self, id: u64, tick_time: i64) -> bool;

    fn fire(&self, ctx: &TaskContext<'_>) -> Fired;

    /// Settle as cancelled, bypassing the policy
    fn cancel_on_shutdown(&self);
}

pub(crate) type TimerRef = Arc<dyn Trigger>;

impl HeapNode for TimerRef {
    fn key(&self) -> TaskKey {
        self.header().key()
    }

    fn queue_index(&self) -> usize {
        self.header().queue_index.load(Ordering::Relaxed)
    }

    fn set_queue_index(&self, index: usize) {
        self.header().queue_index.store(index, Ordering::Relaxed);
    }

    fn is_same(&self, other: &Self) -> bool {
        Arc::as_ptr(self) as *const () == Arc::as_ptr(other) as *const ()
    }
}

struct RunState<T> {
    body: Body<T>,
    timeout: Option<i64>,
    budget: Option<TimeBudget>,
    runs: u64,
}

/// Policy of a scheduled task's promise.
///
/// Settling from outside the loop takes the task out of its loop's heap (via
/// the intake, since the heap is loop-owned). Cancelling is refused once a
/// one-shot body has started. The loop itself settles unguarded.
struct TaskPolicy {
    guard: LoopGuard,
    task: Weak<dyn Trigger>,
    owner: Weak<Shared>,
}

impl TaskPolicy {
    fn retire(&self, task: TimerRef) {
        if let Some(owner) = self.owner.upgrade() {
            owner.request_removal(task);
        }
    }
}

impl CompletionPolicy for TaskPolicy {
    fn derive_child_policy(&self, parent: &Arc<dyn FutureView>) -> Option<Arc<dyn CompletionPolicy>> {
        self.guard.derive_child_policy(parent)
    }

    fn may_block(&self, future: &dyn FutureView) -> bool {
        self.guard.may_block(future)
    }

    fn complete(&self, _future: &dyn FutureView, _kind: Completion, apply: &mut dyn FnMut() -> bool) -> bool {
        let completed = apply();
        if completed {
            if let Some(task) = self.task.upgrade() {
                self.retire(task);
            }
        }
        completed
    }

    fn cancel(&self, _future: &dyn FutureView, apply: &mut dyn FnMut() -> bool) -> bool {
        let Some(task) = self.task.upgrade() else {
            return apply();
        };
        if !task.header().try_mark_cancelled() {
            return false;
        }
        let cancelled = apply();
        if cancelled {
            self.retire(task);
        }
        cancelled
    }
}

/// A task owned by a loop's timer heap
pub(crate) struct ScheduledTask<T> {
    header: TaskHeader,
    promise: Promise<T>,
    run: Mutex<RunState<T>>,
}

impl<T: Clone + Send + 'static> ScheduledTask<T> {
    pub(crate) fn create(plan: Plan<T>, shared: &Arc<Shared>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let task: Weak<dyn Trigger> = me.clone();
            let policy = TaskPolicy {
                guard: loop_guard(shared),
                task,
                owner: Arc::downgrade(shared),
            };
            ScheduledTask {
                header: TaskHeader::new(plan.period, plan.initial_delay, plan.features),
                promise: Promise::with_policy(Some(Arc::new(policy))),
                run: Mutex::new(RunState {
                    body: plan.body,
                    timeout: plan.timeout,
                    budget: None,
                    runs: 0,
                }),
            }
        })
    }

    pub(crate) fn promise(&self) -> &Promise<T> {
        &self.promise
    }

    fn fire_once(&self, run: &mut RunState<T>, ctx: &TaskContext<'_>) -> Fired {
        if !self.header.try_mark_running() {
            return Fired::Finished;
        }
        let outcome = match catch_panic(|| (run.body)(ctx)) {
            Ok(Step::Done(value)) => Ok(value),
            Ok(Step::Continue) => Err(FutureError::TimeSharingTimeout),
            Err(cause) => Err(cause),
        };
        self.promise.settle_unguarded(outcome);
        Fired::Finished
    }

    fn fire_periodic(&self, run: &mut RunState<T>, ctx: &TaskContext<'_>) -> Fired {
        let header = &self.header;
        let trigger_time = ctx.trigger_time();
        if let Some(budget) = run.budget.as_mut() {
            budget.before_call(ctx.tick_time(), trigger_time, header.period);
            if !budget.covers(header.period.abs()) {
                self.promise.settle_unguarded(Err(FutureError::TimeSharingTimeout));
                return Fired::Finished;
            }
        }

        match catch_panic(|| (run.body)(ctx)) {
            Ok(Step::Done(value)) => {
                self.promise.settle_unguarded(Ok(value));
                return Fired::Finished;
            }
            Ok(Step::Continue) => {}
            Err(cause) if header.features.contains(TaskFeatures::CONTINUE_ON_ERROR) => {
                tracing::warn!(task_id = header.id(), error = %cause, "periodic run failed, keeping schedule");
            }
            Err(cause) => {
                self.promise.settle_unguarded(Err(cause));
                return Fired::Finished;
            }
        }
        // cancelled from inside the body
        if self.promise.is_done() {
            return Fired::Finished;
        }

        let mut interval = header.period.abs();
        if let Some(budget) = run.budget.as_ref() {
            interval = budget.clamp_interval(interval);
        }
        let next = if header.period > 0 {
            trigger_time.saturating_add(interval)
        } else {
            ctx.now().saturating_add(interval)
        };
        header.next_trigger_time.store(next, Ordering::Relaxed);
        if header.features.contains(TaskFeatures::PRIORITY_DECREASABLE) {
            header.demoted.store(true, Ordering::Relaxed);
        }
        Fired::Reschedule
    }
}

impl<T: Clone + Send + 'static> Trigger for ScheduledTask<T> {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn accept(&self, id: u64, tick_time: i64) -> bool {
        if self.promise.is_done() {
            return false;
        }
        let first = tick_time.saturating_add(self.header.initial_delay);
        self.header.id.store(id, Ordering::Relaxed);
        self.header.next_trigger_time.store(first, Ordering::Relaxed);
        let mut run = self.run.lock();
        if let Some(total) = run.timeout {
            run.budget = Some(TimeBudget::new(total, first));
        }
        true
    }

    fn fire(&self, ctx: &TaskContext<'_>) -> Fired {
        if self.promise.is_done() {
            return Fired::Finished;
        }
        let trigger_time = self.header.next_trigger_time();
        if ctx.tick_time() < trigger_time {
            return Fired::NotDue;
        }
        let mut run = self.run.lock();
        run.runs += 1;
        let ctx = ctx.with_trigger(trigger_time, run.runs);
        if self.header.period == 0 {
            self.fire_once(&mut run, &ctx)
        } else {
            self.fire_periodic(&mut run, &ctx)
        }
    }

    fn cancel_on_shutdown(&self) {
        self.promise.cancel_unguarded();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_bits() {
        let f = TaskFeatures::LOW_PRIORITY | TaskFeatures::CONTINUE_ON_ERROR;
        assert!(f.contains(TaskFeatures::LOW_PRIORITY));
        assert!(f.contains(TaskFeatures::CONTINUE_ON_ERROR));
        assert!(!f.contains(TaskFeatures::LOCAL_ORDER));
        assert!(f.contains(TaskFeatures::NONE));
        assert!(TaskFeatures::default().is_empty());
    }

    #[test]
    fn test_once_clamps_negative_delay() {
        let plan = ScheduleBuilder::once(|| 1).delay(-50).plan().unwrap();
        assert_eq!(plan.initial_delay, 0);
        assert_eq!(plan.period, 0);
    }

    #[test]
    fn test_fixed_delay_encoding() {
        let plan = ScheduleBuilder::periodic(|| {}).fixed_delay(-5, 20).plan().unwrap();
        assert_eq!(plan.initial_delay, 0);
        assert_eq!(plan.period, -20);
    }

    #[test]
    fn test_fixed_rate_rejects_negative_initial_delay() {
        let err = ScheduleBuilder::periodic(|| {}).fixed_rate(-1, 10).plan();
        assert!(matches!(err, Err(LoopError::NegativeInitialDelay(-1))));
    }

    #[test]
    fn test_non_positive_period_rejected() {
        assert!(matches!(
            ScheduleBuilder::periodic(|| {}).fixed_rate(0, 0).plan(),
            Err(LoopError::InvalidPeriod(0))
        ));
        assert!(matches!(
            ScheduleBuilder::periodic(|| {}).fixed_delay(0, -3).plan(),
            Err(LoopError::InvalidPeriod(-3))
        ));
    }

    #[test]
    fn test_periodic_runnable_needs_a_period() {
        assert!(matches!(
            ScheduleBuilder::periodic(|| {}).plan(),
            Err(LoopError::InvalidPeriod(0))
        ));
    }

    #[test]
    fn test_timeout_must_be_positive() {
        assert!(matches!(
            ScheduleBuilder::periodic(|| {}).fixed_rate(0, 10).timeout(0).plan(),
            Err(LoopError::InvalidTimeout(0))
        ));
    }

    #[test]
    fn test_features_accumulate() {
        let plan = ScheduleBuilder::periodic(|| {})
            .fixed_rate(0, 10)
            .features(TaskFeatures::LOW_PRIORITY)
            .features(TaskFeatures::CONTINUE_ON_ERROR)
            .plan()
            .unwrap();
        assert!(plan.features.contains(TaskFeatures::LOW_PRIORITY | TaskFeatures::CONTINUE_ON_ERROR));
    }
}
