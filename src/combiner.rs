//! Future combiner — aggregate many promises into one
//!
//! Children are registered with `add`; a terminal call (`any_of`,
//! `select_n`, `aggregate`) fixes the child count and returns the aggregate
//! promise. Children report through one shared listener that counts
//! successes and completions with atomics, so they may settle on any thread,
//! before or after the terminal call.
//!
//! The aggregate carries the value of the most recent successful child, or
//! `None` when no child succeeded (zero children under `any_of`).
//!
//! Author: Moroya Sakamoto

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;

use crate::error::{FutureError, LoopError};
use crate::policy::CompletionPolicy;
use crate::promise::Promise;

/// Resolution rule of an aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOptions {
    /// First success wins; fails only once every child failed
    pub any_of: bool,
    /// Successes needed
    pub success_require: usize,
    /// Decide only after every child completed
    pub lazy: bool,
}

impl AggregateOptions {
    /// Successes that decide the aggregate; `any_of` always needs one
    pub const fn required(&self) -> usize {
        if self.any_of {
            1
        } else {
            self.success_require
        }
    }

    pub const fn any_of() -> Self {
        Self {
            any_of: true,
            success_require: 1,
            lazy: false,
        }
    }

    pub const fn select_n(n: usize, lazy: bool) -> Self {
        Self {
            any_of: false,
            success_require: n,
            lazy,
        }
    }
}

struct Target<T> {
    promise: Promise<Option<T>>,
    options: AggregateOptions,
    total: usize,
}

/// Shared sink of every child's completion
struct ChildListener<T> {
    done: AtomicUsize,
    succeeded: AtomicUsize,
    last_value: ArcSwapOption<T>,
    last_cause: ArcSwapOption<FutureError>,
    target: OnceLock<Target<T>>,
}

impl<T: Clone + Send + Sync + 'static> ChildListener<T> {
    fn new() -> Self {
        Self {
            done: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            last_value: ArcSwapOption::empty(),
            last_cause: ArcSwapOption::empty(),
            target: OnceLock::new(),
        }
    }

    fn on_child(&self, outcome: &Result<T, FutureError>) {
        match outcome {
            Ok(value) => {
                // value is visible before the count that announces it
                self.last_value.store(Some(Arc::new(value.clone())));
                self.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            Err(cause) => self.last_cause.store(Some(Arc::new(cause.clone()))),
        }
        self.done.fetch_add(1, Ordering::SeqCst);
        self.try_resolve();
    }

    fn try_resolve(&self) {
        let Some(target) = self.target.get() else {
            return;
        };
        if target.promise.is_done() {
            return;
        }
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        let done = self.done.load(Ordering::SeqCst).min(target.total);
        let required = target.options.required();

        if target.total == 0 && target.options.any_of {
            target.promise.complete(None);
            return;
        }
        if target.options.lazy && done < target.total {
            return;
        }
        if succeeded >= required {
            let value = self.last_value.load_full().map(|value| (*value).clone());
            target.promise.complete(value);
        } else if succeeded + (target.total - done) < required {
            let cause = self
                .last_cause
                .load_full()
                .map(|cause| (*cause).clone())
                .unwrap_or(FutureError::InsufficientSuccesses {
                    required,
                    achieved: succeeded,
                });
            target.promise.complete_exceptionally(cause);
        }
    }
}

/// Builder that aggregates promises of the same type
pub struct FutureCombiner<T> {
    listener: Arc<ChildListener<T>>,
    children: usize,
    finished: bool,
    policy: Option<Arc<dyn CompletionPolicy>>,
}

impl<T: Clone + Send + Sync + 'static> FutureCombiner<T> {
    /// Combiner with an unguarded aggregate
    pub fn new() -> Self {
        Self::with_policy(None)
    }

    /// Combiner whose aggregate promise is bound to `policy`
    pub fn with_policy(policy: Option<Arc<dyn CompletionPolicy>>) -> Self {
        Self {
            listener: Arc::new(ChildListener::new()),
            children: 0,
            finished: false,
            policy,
        }
    }

    /// Register a child; fails once a terminal call was made
    pub fn add(&mut self, future: &Promise<T>) -> Result<&mut Self, LoopError> {
        if self.finished {
            return Err(LoopError::CombinerFinished);
        }
        self.children += 1;
        let listener = Arc::clone(&self.listener);
        future.on_complete(move |outcome| listener.on_child(outcome));
        Ok(self)
    }

    pub fn add_all<'a, I>(&mut self, futures: I) -> Result<&mut Self, LoopError>
    where
        I: IntoIterator<Item = &'a Promise<T>>,
    {
        for future in futures {
            self.add(future)?;
        }
        Ok(self)
    }

    /// Children registered so far
    pub fn len(&self) -> usize {
        self.children
    }

    pub fn is_empty(&self) -> bool {
        self.children == 0
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Succeeds with the first success, fails only if every child fails
    pub fn any_of(&mut self) -> Result<Promise<Option<T>>, LoopError> {
        self.aggregate(AggregateOptions::any_of())
    }

    /// Succeeds once `n` children succeeded, fails once that is unreachable.
    /// A lazy aggregate waits for every child before deciding.
    pub fn select_n(&mut self, n: usize, lazy: bool) -> Result<Promise<Option<T>>, LoopError> {
        self.aggregate(AggregateOptions::select_n(n, lazy))
    }

    pub fn aggregate(&mut self, options: AggregateOptions) -> Result<Promise<Option<T>>, LoopError> {
        if self.finished {
            return Err(LoopError::CombinerFinished);
        }
        self.finished = true;
        let promise = Promise::with_policy(self.policy.clone());
        let target = Target {
            promise: promise.clone(),
            options,
            total: self.children,
        };
        if self.listener.target.set(target).is_err() {
            return Err(LoopError::CombinerFinished);
        }
        self.listener.try_resolve();
        Ok(promise)
    }

    /// Forget all children and allow reuse.
    ///
    /// Previously returned aggregates keep resolving from their own children.
    pub fn clear(&mut self) {
        self.listener = Arc::new(ChildListener::new());
        self.children = 0;
        self.finished = false;
    }
}

impl<T: Clone + Send + Sync + 'static> Default for FutureCombiner<T> {
    fn default() -> Self {
        Self::new()
    }
}
