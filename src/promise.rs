//! Promise — single-assignment completion cell
//!
//! A `Promise<T>` starts `Pending` and settles exactly once into
//! `Succeeded`, `Failed` or `Cancelled`. Handles are cheap clones of one shared
//! cell. Mutations go through the bound `CompletionPolicy`; blocking accessors
//! ask the policy first and fail fast with `FutureError::BlockingGuard` instead
//! of deadlocking a loop on its own work.
//!
//! Listeners registered with `on_complete` run on the thread that settles the
//! promise, or immediately on the registering thread if it already settled.
//!
//! Author: Moroya Sakamoto

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{catch_panic, panic_message, FutureError, LoopError};
use crate::event_loop::LoopHandle;
use crate::policy::{Completion, CompletionPolicy, FutureView, ObtrudeClosed, Unguarded};

/// Promise lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

type Listener<T> = Box<dyn FnOnce(&Result<T, FutureError>) + Send + 'static>;

enum Slot<T> {
    Pending(Vec<Listener<T>>),
    Done(Result<T, FutureError>),
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    settled: Condvar,
    policy: Option<Arc<dyn CompletionPolicy>>,
}

/// Shared handle to a completion cell
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn state_of<T>(outcome: &Result<T, FutureError>) -> PromiseState {
    match outcome {
        Ok(_) => PromiseState::Succeeded,
        Err(FutureError::Cancelled) => PromiseState::Cancelled,
        Err(_) => PromiseState::Failed,
    }
}

fn notify<T>(listeners: Vec<Listener<T>>, outcome: &Result<T, FutureError>) {
    for listener in listeners {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(outcome))) {
            tracing::error!(panic = %panic_message(payload.as_ref()), "promise listener panicked");
        }
    }
}

impl<T: Clone + Send + 'static> Inner<T> {
    /// Single dispatch point: a missing policy behaves as `Unguarded`
    fn policy(&self) -> &dyn CompletionPolicy {
        match &self.policy {
            Some(policy) => policy.as_ref(),
            None => &Unguarded,
        }
    }

    /// Raw transition out of `Pending`; false if already settled
    fn settle(&self, outcome: Result<T, FutureError>) -> bool {
        let listeners = {
            let mut slot = self.slot.lock();
            let listeners = match &mut *slot {
                Slot::Done(_) => return false,
                Slot::Pending(listeners) => mem::take(listeners),
            };
            if listeners.is_empty() {
                *slot = Slot::Done(outcome);
                drop(slot);
                self.settled.notify_all();
                return true;
            }
            *slot = Slot::Done(outcome.clone());
            listeners
        };
        self.settled.notify_all();
        notify(listeners, &outcome);
        true
    }

    /// Raw overwrite, settled or not
    fn overwrite(&self, outcome: Result<T, FutureError>) {
        let previous = mem::replace(&mut *self.slot.lock(), Slot::Done(outcome.clone()));
        self.settled.notify_all();
        if let Slot::Pending(listeners) = previous {
            notify(listeners, &outcome);
        }
    }

    fn complete(&self, value: T) -> bool {
        let mut value = Some(value);
        self.policy().complete(self, Completion::Value, &mut || match value.take() {
            Some(value) => self.settle(Ok(value)),
            None => false,
        })
    }

    fn complete_exceptionally(&self, cause: FutureError) -> bool {
        let mut cause = Some(cause);
        self.policy().complete(self, Completion::Failure, &mut || match cause.take() {
            Some(cause) => self.settle(Err(cause)),
            None => false,
        })
    }

    fn obtrude(&self, outcome: Result<T, FutureError>) -> Result<(), LoopError> {
        let mut outcome = Some(outcome);
        self.policy().obtrude(self, &mut || {
            if let Some(outcome) = outcome.take() {
                self.overwrite(outcome);
            }
        })
    }

    /// Wait until settled or `deadline` passes; returns whether settled
    fn wait(&self, deadline: Option<Instant>) -> Result<bool, FutureError> {
        if self.is_done() {
            return Ok(true);
        }
        if self.policy().may_block(self) {
            return Err(FutureError::BlockingGuard);
        }
        let mut slot = self.slot.lock();
        loop {
            if matches!(*slot, Slot::Done(_)) {
                return Ok(true);
            }
            match deadline {
                None => self.settled.wait(&mut slot),
                Some(deadline) => {
                    if self.settled.wait_until(&mut slot, deadline).timed_out() {
                        return Ok(matches!(*slot, Slot::Done(_)));
                    }
                }
            }
        }
    }

    fn outcome(&self) -> Option<Result<T, FutureError>> {
        match &*self.slot.lock() {
            Slot::Pending(_) => None,
            Slot::Done(outcome) => Some(outcome.clone()),
        }
    }
}

impl<T: Clone + Send + 'static> FutureView for Inner<T> {
    fn state(&self) -> PromiseState {
        match &*self.slot.lock() {
            Slot::Pending(_) => PromiseState::Pending,
            Slot::Done(outcome) => state_of(outcome),
        }
    }

    fn cancel(&self) -> bool {
        self.policy()
            .cancel(self, &mut || self.settle(Err(FutureError::Cancelled)))
    }
}

fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Unguarded pending promise
    pub fn new() -> Self {
        Self::with_policy(None)
    }

    /// Pending promise bound to `policy`
    pub fn with_policy(policy: Option<Arc<dyn CompletionPolicy>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Pending(Vec::new())),
                settled: Condvar::new(),
                policy,
            }),
        }
    }

    /// Sentinel that already succeeded and rejects further mutation
    pub fn completed(value: T) -> Self {
        Self::sentinel(Ok(value))
    }

    /// Sentinel that already failed and rejects further mutation
    pub fn failed(cause: FutureError) -> Self {
        Self::sentinel(Err(cause))
    }

    fn sentinel(outcome: Result<T, FutureError>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Done(outcome)),
                settled: Condvar::new(),
                policy: Some(Arc::new(ObtrudeClosed)),
            }),
        }
    }

    pub fn policy(&self) -> Option<&Arc<dyn CompletionPolicy>> {
        self.inner.policy.as_ref()
    }

    pub fn state(&self) -> PromiseState {
        self.inner.state()
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn is_succeeded(&self) -> bool {
        self.state() == PromiseState::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        self.state() == PromiseState::Failed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == PromiseState::Cancelled
    }

    /// Outcome if settled, without blocking
    pub fn try_get(&self) -> Option<Result<T, FutureError>> {
        self.inner.outcome()
    }

    /// Settle with `value`; false if already settled or the policy refused
    pub fn complete(&self, value: T) -> bool {
        self.inner.complete(value)
    }

    /// Settle with `cause`; false if already settled or the policy refused
    pub fn complete_exceptionally(&self, cause: FutureError) -> bool {
        self.inner.complete_exceptionally(cause)
    }

    /// Settle from a `Result`
    pub fn complete_with(&self, outcome: Result<T, FutureError>) -> bool {
        match outcome {
            Ok(value) => self.complete(value),
            Err(cause) => self.complete_exceptionally(cause),
        }
    }

    /// Cancel; false if already settled or the policy refused
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Forcibly overwrite the outcome with `value`.
    ///
    /// Only for futures no other completion path can reach.
    pub fn obtrude_value(&self, value: T) -> Result<(), LoopError> {
        self.inner.obtrude(Ok(value))
    }

    /// Forcibly overwrite the outcome with `cause`
    pub fn obtrude_error(&self, cause: FutureError) -> Result<(), LoopError> {
        self.inner.obtrude(Err(cause))
    }

    /// Settle bypassing the policy (loop-internal shutdown path)
    pub(crate) fn cancel_unguarded(&self) -> bool {
        self.settle_unguarded(Err(FutureError::Cancelled))
    }

    /// Settle bypassing the policy; for the owner of the work itself
    pub(crate) fn settle_unguarded(&self, outcome: Result<T, FutureError>) -> bool {
        self.inner.settle(outcome)
    }

    /// Block until settled and return the outcome
    pub fn get(&self) -> Result<T, FutureError> {
        self.inner.wait(None)?;
        self.inner.outcome().unwrap_or(Err(FutureError::WaitTimeout))
    }

    /// Block at most `timeout`; `FutureError::WaitTimeout` if still pending
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, FutureError> {
        if !self.inner.wait(deadline_after(timeout))? {
            return Err(FutureError::WaitTimeout);
        }
        self.inner.outcome().unwrap_or(Err(FutureError::WaitTimeout))
    }

    /// Block until settled, ignoring the outcome
    pub fn join(&self) -> Result<(), FutureError> {
        self.inner.wait(None).map(|_| ())
    }

    /// Block at most `timeout`; returns whether the promise settled
    pub fn await_for(&self, timeout: Duration) -> Result<bool, FutureError> {
        self.inner.wait(deadline_after(timeout))
    }

    /// Register a listener for the outcome
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T, FutureError>) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.inner.slot.lock();
            match &mut *slot {
                Slot::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                }
                Slot::Done(outcome) => outcome.clone(),
            }
        };
        notify(vec![Box::new(listener) as Listener<T>], &outcome);
    }

    /// New pending promise whose policy is derived from this one
    fn derive<U: Clone + Send + 'static>(&self) -> Promise<U> {
        let parent: Arc<dyn FutureView> = self.inner.clone();
        Promise::with_policy(self.inner.policy().derive_child_policy(&parent))
    }

    /// Transform a success; failures pass through unchanged
    pub fn then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let child = self.derive::<U>();
        let target = child.clone();
        self.on_complete(move |outcome| {
            let mapped = match outcome {
                Ok(value) => {
                    let value = value.clone();
                    catch_panic(move || Ok(f(value)))
                }
                Err(cause) => Err(cause.clone()),
            };
            target.complete_with(mapped);
        });
        child
    }

    /// Transform the whole outcome, success or failure
    pub fn handle<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, FutureError>) -> U + Send + 'static,
    {
        let child = self.derive::<U>();
        let target = child.clone();
        self.on_complete(move |outcome| {
            let outcome = outcome.clone();
            target.complete_with(catch_panic(move || Ok(f(outcome))));
        });
        child
    }

    /// Observe the outcome and pass it on unchanged
    pub fn when_complete<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(&Result<T, FutureError>) + Send + 'static,
    {
        let child = self.derive::<T>();
        let target = child.clone();
        self.on_complete(move |outcome| {
            let observed = outcome.clone();
            let passed = catch_panic(move || {
                f(&observed);
                observed
            });
            target.complete_with(passed);
        });
        child
    }

    /// Like `then`, but `f` runs on `event_loop`
    pub fn then_on<U, F>(&self, event_loop: &LoopHandle, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let child = event_loop.new_promise::<U>();
        let target = child.clone();
        let event_loop = event_loop.clone();
        self.on_complete(move |outcome| match outcome {
            Ok(value) => {
                let value = value.clone();
                let job_target = target.clone();
                let submitted = event_loop.execute(move || {
                    job_target.complete_with(catch_panic(move || Ok(f(value))));
                });
                if submitted.is_err() {
                    target.complete_exceptionally(FutureError::Rejected);
                }
            }
            Err(cause) => {
                target.complete_exceptionally(cause.clone());
            }
        });
        child
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .field("guarded", &self.inner.policy.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_complete_once() {
        let promise = Promise::new();
        assert_eq!(promise.state(), PromiseState::Pending);
        assert!(promise.complete(7));
        assert!(!promise.complete(8));
        assert!(!promise.cancel());
        assert_eq!(promise.get().unwrap(), 7);
        assert!(promise.is_succeeded());
    }

    #[test]
    fn test_fail_and_cancel_states() {
        let failed: Promise<u32> = Promise::new();
        assert!(failed.complete_exceptionally(FutureError::failed("nope")));
        assert_eq!(failed.state(), PromiseState::Failed);
        assert!(matches!(failed.get(), Err(FutureError::Failed(_))));

        let cancelled: Promise<u32> = Promise::new();
        assert!(cancelled.cancel());
        assert_eq!(cancelled.state(), PromiseState::Cancelled);
        assert!(cancelled.get().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_sentinels_reject_mutation() {
        let done = Promise::completed(1);
        assert!(!done.complete(2));
        assert!(!done.cancel());
        assert!(matches!(done.obtrude_value(3), Err(LoopError::ObtrudeForbidden)));
        assert_eq!(done.get().unwrap(), 1);

        let failed: Promise<u8> = Promise::failed(FutureError::Cancelled);
        assert!(failed.is_cancelled());
        assert!(!failed.complete(1));
    }

    #[test]
    fn test_obtrude_overwrites_bare_promise() {
        let promise = Promise::new();
        promise.complete(1);
        promise.obtrude_value(2).unwrap();
        assert_eq!(promise.get().unwrap(), 2);
        promise.obtrude_error(FutureError::Cancelled).unwrap();
        assert!(promise.is_cancelled());
    }

    #[test]
    fn test_listener_runs_once_after_completion() {
        let promise = Promise::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        promise.on_complete(move |outcome: &Result<u32, FutureError>| {
            assert_eq!(*outcome.as_ref().unwrap(), 5);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        promise.complete(5);
        promise.complete(6);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_on_settled_promise_runs_immediately() {
        let promise = Promise::completed("ready");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        promise.on_complete(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_then_chain() {
        let source = Promise::new();
        let doubled = source.then(|v: u32| v * 2);
        let text = doubled.then(|v| format!("value={v}"));
        source.complete(21);
        assert_eq!(doubled.get().unwrap(), 42);
        assert_eq!(text.get().unwrap(), "value=42");
    }

    #[test]
    fn test_then_propagates_failure() {
        let source: Promise<u32> = Promise::new();
        let mapped = source.then(|v| v + 1);
        source.complete_exceptionally(FutureError::TimeSharingTimeout);
        assert!(matches!(mapped.get(), Err(FutureError::TimeSharingTimeout)));
    }

    #[test]
    fn test_then_panic_fails_child() {
        let source: Promise<u32> = Promise::new();
        let mapped: Promise<u32> = source.then(|_| panic!("mapper broke"));
        source.complete(1);
        match mapped.get() {
            Err(FutureError::Panicked(msg)) => assert_eq!(msg, "mapper broke"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_handle_recovers() {
        let source: Promise<u32> = Promise::new();
        let recovered = source.handle(|outcome| outcome.unwrap_or(0));
        source.cancel();
        assert_eq!(recovered.get().unwrap(), 0);
    }

    #[test]
    fn test_when_complete_passes_through() {
        let source: Promise<u32> = Promise::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&seen);
        let passed = source.when_complete(move |outcome| {
            observer.store(*outcome.as_ref().unwrap() as usize, Ordering::SeqCst);
        });
        source.complete(9);
        assert_eq!(passed.get().unwrap(), 9);
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_unguarded_children_have_no_policy() {
        let source: Promise<u32> = Promise::new();
        let child = source.then(|v| v);
        assert!(child.policy().is_none());
    }

    #[test]
    fn test_get_from_other_thread() {
        let promise = Promise::new();
        let producer = promise.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.complete(String::from("hello"));
        });
        assert_eq!(promise.get_timeout(Duration::from_secs(5)).unwrap(), "hello");
        handle.join().unwrap();
    }

    #[test]
    fn test_get_timeout_expires() {
        let promise: Promise<u32> = Promise::new();
        assert!(matches!(
            promise.get_timeout(Duration::from_millis(10)),
            Err(FutureError::WaitTimeout)
        ));
        assert!(!promise.await_for(Duration::from_millis(1)).unwrap());
        promise.complete(3);
        assert!(promise.await_for(Duration::from_millis(1)).unwrap());
        promise.join().unwrap();
    }

    struct AlwaysGuarded;

    impl CompletionPolicy for AlwaysGuarded {
        fn may_block(&self, future: &dyn FutureView) -> bool {
            !future.is_done()
        }
    }

    #[test]
    fn test_policy_guards_blocking() {
        let promise: Promise<u32> = Promise::with_policy(Some(Arc::new(AlwaysGuarded)));
        assert!(matches!(promise.get(), Err(FutureError::BlockingGuard)));
        assert!(matches!(promise.join(), Err(FutureError::BlockingGuard)));
        promise.complete(4);
        assert_eq!(promise.get().unwrap(), 4);
    }

    struct CountingPolicy {
        completions: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl CompletionPolicy for CountingPolicy {
        fn complete(&self, _future: &dyn FutureView, _kind: Completion, apply: &mut dyn FnMut() -> bool) -> bool {
            self.completions.fetch_add(1, Ordering::SeqCst);
            apply()
        }

        fn cancel(&self, _future: &dyn FutureView, apply: &mut dyn FnMut() -> bool) -> bool {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            apply()
        }
    }

    #[test]
    fn test_mutations_route_through_policy() {
        let policy = Arc::new(CountingPolicy {
            completions: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        });
        let promise: Promise<u32> = Promise::with_policy(Some(policy.clone()));
        promise.complete(1);
        promise.complete_exceptionally(FutureError::Cancelled);
        promise.cancel();
        assert_eq!(policy.completions.load(Ordering::SeqCst), 2);
        assert_eq!(policy.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(promise.get().unwrap(), 1);
    }
}
