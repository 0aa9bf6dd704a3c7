//! Event loop — single-threaded executor for immediate and scheduled work
//!
//! One `EventLoop` owns a timer heap and a run queue and is driven by exactly
//! one thread. Every other thread talks to it through a cloneable
//! `LoopHandle`, whose submissions travel through the intake queue.
//!
//! Each tick:
//! 1. Read the clock once (`tick_time`)
//! 2. Accept up to `batch_size` intake messages, assigning monotonic ids
//! 3. Run immediate jobs and due timers merged by `(trigger_time, id)`
//!
//! Author: Moroya Sakamoto

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, Thread, ThreadId};
use std::time::Duration;

use parking_lot::RwLock;

use crate::clock::{self, Clock, SystemClock};
use crate::combiner::FutureCombiner;
use crate::config::LoopConfig;
use crate::error::{catch_panic, FutureError, LoopError, TaskError};
use crate::intake::{BoundedIntake, Intake, UnboundedIntake};
use crate::policy::{LoopAffinity, LoopGuard};
use crate::promise::Promise;
use crate::scheduler::{HeapNode, Scheduler, TaskKey};
use crate::task::{Fired, ScheduleBuilder, ScheduledTask, TaskContext, TaskFeatures, TimerRef, Trigger};

const STATE_RUNNING: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;
const STATE_TERMINATED: u8 = 2;

type JobBody = Box<dyn FnOnce(&TaskContext<'_>) + Send + 'static>;

/// Intake message
pub(crate) enum Message {
    Run { features: TaskFeatures, body: JobBody },
    Schedule(TimerRef),
    Remove(TimerRef),
}

/// State shared by a loop and all of its handles
pub(crate) struct Shared {
    config: LoopConfig,
    intake: Box<dyn Intake<Message>>,
    owner: OnceLock<Thread>,
    state: AtomicU8,
    /// Held shared by submitters, exclusively by the shutdown transition
    gate: RwLock<()>,
    parked: AtomicBool,
    clock: Arc<dyn Clock>,
    termination: Promise<()>,
}

impl Shared {
    fn new(config: LoopConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let intake: Box<dyn Intake<Message>> = match config.intake_capacity {
            Some(capacity) => Box::new(BoundedIntake::new(capacity)),
            None => Box::new(UnboundedIntake::new()),
        };
        Arc::new_cyclic(|me: &Weak<Shared>| {
            let owner: Weak<dyn LoopAffinity> = me.clone();
            Shared {
                config,
                intake,
                owner: OnceLock::new(),
                state: AtomicU8::new(STATE_RUNNING),
                gate: RwLock::new(()),
                parked: AtomicBool::new(false),
                clock,
                termination: Promise::with_policy(Some(Arc::new(LoopGuard::new(owner, false)))),
            }
        })
    }

    fn bind_current_thread(&self) {
        if self.owner.set(thread::current()).is_err() {
            tracing::warn!(loop_name = %self.config.name, "loop thread already bound");
        }
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn is_running(&self) -> bool {
        self.state() == STATE_RUNNING
    }

    fn submit(&self, message: Message) -> Result<(), LoopError> {
        {
            let _gate = self.gate.read();
            if !self.is_running() {
                return Err(LoopError::Shutdown);
            }
            if self.intake.push(message).is_err() {
                tracing::warn!(loop_name = %self.config.name, "intake full, submission rejected");
                return Err(LoopError::QueueFull);
            }
        }
        self.wake();
        Ok(())
    }

    /// Ask the loop thread to drop a cancelled task from its heap
    pub(crate) fn request_removal(&self, task: TimerRef) {
        if self.intake.push(Message::Remove(task)).is_err() {
            // the task still leaves the heap when its trigger comes up
            tracing::debug!(loop_name = %self.config.name, "intake full, deferred timer removal");
            return;
        }
        self.wake();
    }

    /// RUNNING -> SHUTTING_DOWN; true for the caller that made the transition
    fn begin_shutdown(&self) -> bool {
        let _gate = self.gate.write();
        self.state
            .compare_exchange(STATE_RUNNING, STATE_SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn wake(&self) {
        if self.parked.load(Ordering::SeqCst) {
            if let Some(thread) = self.owner.get() {
                thread.unpark();
            }
        }
    }
}

impl LoopAffinity for Shared {
    fn in_loop(&self) -> bool {
        self.owner
            .get()
            .is_some_and(|owner| owner.id() == thread::current().id())
    }
}

/// Blocking guard bound to the loop behind `shared`
pub(crate) fn loop_guard(shared: &Arc<Shared>) -> LoopGuard {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let owner: Weak<dyn LoopAffinity> = weak;
    LoopGuard::new(owner, shared.config.propagate_cancel)
}

/// Cloneable, thread-safe handle to an event loop
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Current reading of the loop clock
    pub fn now(&self) -> i64 {
        self.shared.clock.now_nanos()
    }

    /// Is the calling thread this loop's thread?
    pub fn in_loop(&self) -> bool {
        self.shared.in_loop()
    }

    pub fn in_loop_thread(&self, thread: ThreadId) -> bool {
        self.shared.owner.get().is_some_and(|owner| owner.id() == thread)
    }

    pub fn ensure_in_loop(&self) -> Result<(), LoopError> {
        if self.in_loop() {
            Ok(())
        } else {
            Err(LoopError::NotInLoop)
        }
    }

    /// Refuse blocking operations from the loop's own thread
    pub fn throw_if_in_loop(&self) -> Result<(), LoopError> {
        if self.in_loop() {
            Err(LoopError::BlockingInOwnLoop)
        } else {
            Ok(())
        }
    }

    /// Pending promise guarded against blocking on this loop's thread
    pub fn new_promise<T: Clone + Send + 'static>(&self) -> Promise<T> {
        Promise::with_policy(Some(Arc::new(loop_guard(&self.shared))))
    }

    /// Combiner whose aggregate promise carries this loop's guard
    pub fn new_combiner<T: Clone + Send + Sync + 'static>(&self) -> FutureCombiner<T> {
        FutureCombiner::with_policy(Some(Arc::new(loop_guard(&self.shared))))
    }

    /// Run `f` on the loop as soon as possible
    pub fn execute<F>(&self, f: F) -> Result<(), LoopError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_with(f, TaskFeatures::NONE)
    }

    pub fn execute_with<F>(&self, f: F, features: TaskFeatures) -> Result<(), LoopError>
    where
        F: FnOnce() + Send + 'static,
    {
        let body: JobBody = Box::new(move |_ctx: &TaskContext<'_>| {
            // panics are logged by catch_panic and go nowhere else
            let _ = catch_panic(move || {
                f();
                Ok(())
            });
        });
        self.shared.submit(Message::Run { features, body })
    }

    /// Run `f` on the loop and deliver its value through a promise
    pub fn submit<T, F>(&self, f: F) -> Result<Promise<T>, LoopError>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_result(move || Ok::<T, TaskError>(f()))
    }

    /// Like `submit`, for bodies that can fail
    pub fn submit_result<T, E, F>(&self, f: F) -> Result<Promise<T>, LoopError>
    where
        T: Clone + Send + 'static,
        E: Into<TaskError>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let promise = self.new_promise::<T>();
        let target = promise.clone();
        let body: JobBody = Box::new(move |_ctx: &TaskContext<'_>| {
            if target.is_done() {
                return;
            }
            target.complete_with(catch_panic(move || f().map_err(FutureError::failed)));
        });
        self.shared.submit(Message::Run {
            features: TaskFeatures::NONE,
            body,
        })?;
        Ok(promise)
    }

    /// Run `f` once after `delay` nanoseconds (negative delays are clamped to 0)
    pub fn schedule_once<T, F>(&self, f: F, delay: i64) -> Result<Promise<T>, LoopError>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.schedule(ScheduleBuilder::once(f).delay(delay))
    }

    /// Repeat `f` with `delay` between the end of one run and the next start
    pub fn schedule_fixed_delay<F>(&self, f: F, initial_delay: i64, delay: i64) -> Result<Promise<()>, LoopError>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(ScheduleBuilder::periodic(f).fixed_delay(initial_delay, delay))
    }

    /// Repeat `f` every `period` nanoseconds on a drift-free grid
    pub fn schedule_fixed_rate<F>(&self, f: F, initial_delay: i64, period: i64) -> Result<Promise<()>, LoopError>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(ScheduleBuilder::periodic(f).fixed_rate(initial_delay, period))
    }

    /// Schedule a fully described task
    pub fn schedule<T>(&self, builder: ScheduleBuilder<T>) -> Result<Promise<T>, LoopError>
    where
        T: Clone + Send + 'static,
    {
        let plan = builder.plan()?;
        let task = ScheduledTask::create(plan, &self.shared);
        let promise = task.promise().clone();
        self.shared.submit(Message::Schedule(task))?;
        Ok(promise)
    }

    /// Submit every task and wait for all of them
    pub fn invoke_all<T, F, I>(&self, tasks: I) -> Result<Vec<Promise<T>>, LoopError>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        self.throw_if_in_loop()?;
        let promises = tasks
            .into_iter()
            .map(|task| self.submit(task))
            .collect::<Result<Vec<_>, _>>()?;
        for promise in &promises {
            promise.join()?;
        }
        Ok(promises)
    }

    /// Submit every task, return the first success and cancel the rest
    pub fn invoke_any<T, F, I>(&self, tasks: I) -> Result<T, LoopError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        self.throw_if_in_loop()?;
        let promises = tasks
            .into_iter()
            .map(|task| self.submit(task))
            .collect::<Result<Vec<_>, _>>()?;
        if promises.is_empty() {
            return Err(LoopError::EmptyInvocation);
        }
        let mut combiner = FutureCombiner::new();
        for promise in &promises {
            combiner.add(promise)?;
        }
        let outcome = combiner.any_of()?.get();
        for promise in &promises {
            promise.cancel();
        }
        outcome?.ok_or(LoopError::EmptyInvocation)
    }

    /// Stop accepting work; the loop terminates after its current tick.
    ///
    /// Returns false if shutdown was already requested.
    pub fn shutdown(&self) -> bool {
        let initiated = self.shared.begin_shutdown();
        if initiated {
            tracing::debug!(loop_name = %self.name(), "shutdown requested");
            if let Some(thread) = self.shared.owner.get() {
                thread.unpark();
            }
        }
        initiated
    }

    pub fn is_shutdown(&self) -> bool {
        !self.shared.is_running()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.state() == STATE_TERMINATED
    }

    /// Completes once the loop has terminated
    pub fn termination_future(&self) -> Promise<()> {
        self.shared.termination.clone()
    }

    /// Wait up to `timeout` for termination; returns whether it terminated
    pub fn await_termination(&self, timeout: Duration) -> Result<bool, FutureError> {
        self.shared.termination.await_for(timeout)
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.name())
            .field("shutdown", &self.is_shutdown())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Immediate job waiting in the run queue
struct Job {
    id: u64,
    trigger_time: i64,
    features: TaskFeatures,
    body: JobBody,
}

/// Does the due timer `key` run before `job`?
fn timer_precedes(key: TaskKey, low_priority: bool, job: &Job) -> bool {
    if job.features.contains(TaskFeatures::DRAIN_TIMERS_FIRST) {
        return true;
    }
    if low_priority && key.trigger_time == job.trigger_time {
        return false;
    }
    (key.trigger_time, key.id) < (job.trigger_time, job.id)
}

/// Loop execution statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Ticks executed
    pub ticks: u64,
    /// Immediate jobs run
    pub jobs_run: u64,
    /// Timer firings (including periodic re-runs)
    pub timers_fired: u64,
    /// Timers in the heap after the last tick
    pub pending_timers: usize,
}

/// The loop itself; lives on, and never leaves, its thread
pub struct EventLoop {
    handle: LoopHandle,
    scheduler: Scheduler<TimerRef>,
    run_queue: VecDeque<Job>,
    next_id: u64,
    tick_time: i64,
    stats: LoopStats,
    _not_send: PhantomData<Rc<()>>,
}

impl EventLoop {
    /// Loop bound to the calling thread, driven with `tick` or `run`
    pub fn new(config: LoopConfig, clock: Arc<dyn Clock>) -> Result<Self, LoopError> {
        config.validate()?;
        let shared = Shared::new(config, clock);
        shared.bind_current_thread();
        Ok(Self::from_shared(shared))
    }

    /// Start a loop on its own named thread with the system clock
    pub fn spawn(config: LoopConfig) -> Result<LoopHandle, LoopError> {
        Self::spawn_with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn spawn_with_clock(config: LoopConfig, clock: Arc<dyn Clock>) -> Result<LoopHandle, LoopError> {
        config.validate()?;
        let shared = Shared::new(config, clock);
        let handle = LoopHandle {
            shared: Arc::clone(&shared),
        };
        thread::Builder::new()
            .name(shared.config.name.clone())
            .spawn(move || {
                shared.bind_current_thread();
                let mut event_loop = EventLoop::from_shared(shared);
                event_loop.run();
            })?;
        Ok(handle)
    }

    fn from_shared(shared: Arc<Shared>) -> Self {
        Self {
            handle: LoopHandle { shared },
            scheduler: Scheduler::with_capacity(64),
            run_queue: VecDeque::new(),
            next_id: 0,
            tick_time: 0,
            stats: LoopStats::default(),
            _not_send: PhantomData,
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn pending_timers(&self) -> usize {
        self.scheduler.len()
    }

    /// One loop iteration; returns the number of task executions
    pub fn tick(&mut self) -> usize {
        self.tick_time = self.handle.shared.clock.now_nanos();
        self.stats.ticks += 1;
        self.accept_batch();
        let executed = self.run_due();
        self.stats.pending_timers = self.scheduler.len();
        executed
    }

    /// Tick until a tick finds nothing to do
    pub fn run_until_idle(&mut self) -> usize {
        let mut executed = 0;
        loop {
            let ran = self.tick();
            executed += ran;
            if ran == 0 && self.handle.shared.intake.is_empty() {
                return executed;
            }
        }
    }

    /// Drive the loop until shutdown, then terminate
    pub fn run(&mut self) {
        let span = tracing::info_span!("event_loop", name = %self.handle.name());
        let _entered = span.enter();
        tracing::debug!("event loop started");
        while self.handle.shared.is_running() {
            if self.tick() == 0 {
                self.park();
            }
        }
        self.terminate();
    }

    /// Shut down and terminate on the calling thread
    pub fn close(mut self) {
        self.handle.shutdown();
        self.terminate();
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn accept_batch(&mut self) {
        let limit = self.handle.shared.config.batch_size;
        let mut accepted = 0;
        while accepted < limit {
            let Some(message) = self.handle.shared.intake.pop() else {
                break;
            };
            self.accept(message);
            accepted += 1;
        }
        if accepted > 0 {
            tracing::trace!(accepted, tick_time = self.tick_time, "accepted intake batch");
        }
    }

    fn accept(&mut self, message: Message) {
        match message {
            Message::Run { features, body } => {
                let id = self.next_id();
                self.run_queue.push_back(Job {
                    id,
                    trigger_time: self.tick_time,
                    features,
                    body,
                });
            }
            Message::Schedule(task) => {
                let id = self.next_id();
                if task.accept(id, self.tick_time) {
                    self.scheduler.push(task);
                }
            }
            Message::Remove(task) => {
                self.scheduler.remove(&task);
            }
        }
    }

    fn due_timer(&self) -> Option<(TaskKey, bool)> {
        let task = self.scheduler.peek()?;
        let key = task.key();
        (key.trigger_time <= self.tick_time).then(|| (key, task.header().is_low_priority()))
    }

    fn run_due(&mut self) -> usize {
        let mut executed = 0;
        loop {
            let timer_first = match (self.run_queue.front(), self.due_timer()) {
                (None, None) => break,
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (Some(job), Some((key, low_priority))) => timer_precedes(key, low_priority, job),
            };
            if timer_first {
                self.fire_next_timer();
            } else {
                self.run_next_job();
            }
            executed += 1;
        }
        executed
    }

    fn fire_next_timer(&mut self) {
        let Some(task) = self.scheduler.pop() else {
            return;
        };
        let fired = {
            let ctx = TaskContext::new(&self.handle, self.handle.shared.clock.as_ref(), self.tick_time);
            task.fire(&ctx)
        };
        self.stats.timers_fired += 1;
        match fired {
            Fired::Finished => {}
            Fired::Reschedule | Fired::NotDue => self.scheduler.push(task),
        }
    }

    fn run_next_job(&mut self) {
        let Some(job) = self.run_queue.pop_front() else {
            return;
        };
        let ctx = TaskContext::new(&self.handle, self.handle.shared.clock.as_ref(), self.tick_time)
            .with_trigger(job.trigger_time, 1);
        (job.body)(&ctx);
        self.stats.jobs_run += 1;
    }

    fn park(&self) {
        let shared = &self.handle.shared;
        let idle = clock::millis(i64::try_from(shared.config.idle_park_ms).unwrap_or(i64::MAX));
        let wait = match self.scheduler.peek() {
            Some(next) => idle.min(next.key().trigger_time.saturating_sub(shared.clock.now_nanos())),
            None => idle,
        };
        if wait <= 0 {
            return;
        }
        shared.parked.store(true, Ordering::SeqCst);
        if shared.intake.is_empty() && shared.is_running() {
            thread::park_timeout(clock::to_duration(wait));
        }
        shared.parked.store(false, Ordering::SeqCst);
    }

    /// Run accepted jobs, cancel every timer, complete the termination future
    fn terminate(&mut self) {
        let shared = Arc::clone(&self.handle.shared);
        if shared.state() == STATE_TERMINATED {
            return;
        }
        shared.begin_shutdown();
        self.tick_time = shared.clock.now_nanos();

        let mut cancelled = 0usize;
        loop {
            while let Some(message) = shared.intake.pop() {
                match message {
                    Message::Schedule(task) => {
                        task.cancel_on_shutdown();
                        cancelled += 1;
                    }
                    other => self.accept(other),
                }
            }
            if self.run_queue.is_empty() {
                break;
            }
            while !self.run_queue.is_empty() {
                self.run_next_job();
            }
        }
        for task in self.scheduler.drain() {
            task.cancel_on_shutdown();
            cancelled += 1;
        }
        self.stats.pending_timers = 0;

        shared.state.store(STATE_TERMINATED, Ordering::Release);
        tracing::debug!(loop_name = %shared.config.name, cancelled, "event loop terminated");
        shared.termination.complete(());
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.handle.name())
            .field("tick_time", &self.tick_time)
            .field("stats", &self.stats)
            .finish()
    }
}
