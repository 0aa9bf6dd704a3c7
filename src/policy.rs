//! Completion policies — pluggable gatekeepers for promise mutation
//!
//! Every mutation of a policy-bound promise (complete, fail, cancel, obtrude)
//! is routed through its policy, and every blocking accessor asks the policy
//! whether blocking is safe. Derived futures get their policy from the
//! parent's `derive_child_policy`, so one deadlock-detection strategy covers a
//! whole chain.
//!
//! Author: Moroya Sakamoto

use std::sync::{Arc, Weak};

use crate::error::LoopError;
use crate::promise::PromiseState;

/// Type-erased view of a promise, handed to policies
pub trait FutureView: Send + Sync {
    /// Current state
    fn state(&self) -> PromiseState;

    /// Left `Pending`?
    fn is_done(&self) -> bool {
        self.state() != PromiseState::Pending
    }

    /// Cancel through the promise's own policy
    fn cancel(&self) -> bool;
}

/// Kind of completion being attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// `complete(value)`
    Value,
    /// `complete_exceptionally(cause)`
    Failure,
}

/// Capability object governing a promise's mutations and blocking safety.
///
/// Each gate receives an `apply` closure that performs the raw state change
/// and reports whether it happened. A policy may call it, skip it (forbid the
/// mutation) or wrap it with bookkeeping. The defaults apply unconditionally.
pub trait CompletionPolicy: Send + Sync {
    /// Policy for a future derived from `parent`; `None` means unguarded
    fn derive_child_policy(&self, parent: &Arc<dyn FutureView>) -> Option<Arc<dyn CompletionPolicy>> {
        let _ = parent;
        None
    }

    /// Would blocking the calling thread on `future` risk a deadlock?
    fn may_block(&self, future: &dyn FutureView) -> bool {
        let _ = future;
        false
    }

    fn complete(&self, future: &dyn FutureView, kind: Completion, apply: &mut dyn FnMut() -> bool) -> bool {
        let _ = (future, kind);
        apply()
    }

    fn cancel(&self, future: &dyn FutureView, apply: &mut dyn FnMut() -> bool) -> bool {
        let _ = future;
        apply()
    }

    fn obtrude(&self, future: &dyn FutureView, apply: &mut dyn FnMut()) -> Result<(), LoopError> {
        let _ = future;
        apply();
        Ok(())
    }
}

/// The "no policy" policy
#[derive(Debug, Clone, Copy, Default)]
pub struct Unguarded;

impl CompletionPolicy for Unguarded {}

/// Policy of pre-resolved sentinel futures: nothing may change them
#[derive(Debug, Clone, Copy, Default)]
pub struct ObtrudeClosed;

impl CompletionPolicy for ObtrudeClosed {
    fn complete(&self, _future: &dyn FutureView, _kind: Completion, _apply: &mut dyn FnMut() -> bool) -> bool {
        false
    }

    fn cancel(&self, _future: &dyn FutureView, _apply: &mut dyn FnMut() -> bool) -> bool {
        false
    }

    fn obtrude(&self, _future: &dyn FutureView, _apply: &mut dyn FnMut()) -> Result<(), LoopError> {
        Err(LoopError::ObtrudeForbidden)
    }
}

/// Thread identity of a loop
pub trait LoopAffinity: Send + Sync {
    /// Is the calling thread the loop thread?
    fn in_loop(&self) -> bool;
}

/// Blocking-safety policy of a loop.
///
/// Forbids blocking on an unfinished future from the loop's own thread and
/// hands itself down to every derived future. With `propagate_cancel`,
/// cancelling a derived future also cancels the future it was derived from.
pub struct LoopGuard {
    owner: Weak<dyn LoopAffinity>,
    propagate_cancel: bool,
    upstream: Option<Weak<dyn FutureView>>,
}

impl LoopGuard {
    pub fn new(owner: Weak<dyn LoopAffinity>, propagate_cancel: bool) -> Self {
        Self {
            owner,
            propagate_cancel,
            upstream: None,
        }
    }

    /// Caller is on the owning loop's thread (false once the loop is gone)
    pub fn owner_in_loop(&self) -> bool {
        self.owner.upgrade().is_some_and(|owner| owner.in_loop())
    }

    pub fn propagates_cancel(&self) -> bool {
        self.propagate_cancel
    }
}

impl CompletionPolicy for LoopGuard {
    fn derive_child_policy(&self, parent: &Arc<dyn FutureView>) -> Option<Arc<dyn CompletionPolicy>> {
        Some(Arc::new(LoopGuard {
            owner: self.owner.clone(),
            propagate_cancel: self.propagate_cancel,
            upstream: self.propagate_cancel.then(|| Arc::downgrade(parent)),
        }))
    }

    fn may_block(&self, future: &dyn FutureView) -> bool {
        !future.is_done() && self.owner_in_loop()
    }

    fn cancel(&self, _future: &dyn FutureView, apply: &mut dyn FnMut() -> bool) -> bool {
        let cancelled = apply();
        if cancelled {
            if let Some(upstream) = self.upstream.as_ref().and_then(Weak::upgrade) {
                upstream.cancel();
            }
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

    struct FakeLoop(AtomicBool);

    impl LoopAffinity for FakeLoop {
        fn in_loop(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// 0 = pending, 1 = succeeded, 3 = cancelled
    struct FakeFuture(AtomicU8);

    impl FutureView for FakeFuture {
        fn state(&self) -> PromiseState {
            match self.0.load(Ordering::SeqCst) {
                0 => PromiseState::Pending,
                1 => PromiseState::Succeeded,
                _ => PromiseState::Cancelled,
            }
        }

        fn cancel(&self) -> bool {
            self.0.compare_exchange(0, 3, Ordering::SeqCst, Ordering::SeqCst).is_ok()
        }
    }

    fn fake_loop(in_loop: bool) -> Arc<FakeLoop> {
        Arc::new(FakeLoop(AtomicBool::new(in_loop)))
    }

    fn weak_owner(owner: &Arc<FakeLoop>) -> Weak<dyn LoopAffinity> {
        let owner: Arc<dyn LoopAffinity> = owner.clone();
        Arc::downgrade(&owner)
    }

    #[test]
    fn test_unguarded_applies() {
        let future = FakeFuture(AtomicU8::new(0));
        let mut calls = 0;
        assert!(Unguarded.complete(&future, Completion::Value, &mut || {
            calls += 1;
            true
        }));
        assert_eq!(calls, 1);
        assert!(!Unguarded.may_block(&future));
    }

    #[test]
    fn test_obtrude_closed_forbids_everything() {
        let future = FakeFuture(AtomicU8::new(1));
        let mut applied = false;
        assert!(!ObtrudeClosed.cancel(&future, &mut || {
            applied = true;
            true
        }));
        assert!(!applied);
        assert!(matches!(
            ObtrudeClosed.obtrude(&future, &mut || {}),
            Err(LoopError::ObtrudeForbidden)
        ));
    }

    #[test]
    fn test_loop_guard_may_block_only_in_loop() {
        let owner = fake_loop(true);
        let guard = LoopGuard::new(weak_owner(&owner), false);
        let pending = FakeFuture(AtomicU8::new(0));
        let done = FakeFuture(AtomicU8::new(1));

        assert!(guard.may_block(&pending));
        assert!(!guard.may_block(&done));

        owner.0.store(false, Ordering::SeqCst);
        assert!(!guard.may_block(&pending));
    }

    #[test]
    fn test_loop_guard_dead_owner_never_blocks() {
        let guard = {
            let owner = fake_loop(true);
            LoopGuard::new(weak_owner(&owner), false)
        };
        assert!(!guard.may_block(&FakeFuture(AtomicU8::new(0))));
    }

    #[test]
    fn test_loop_guard_propagates_cancel_upstream() {
        let owner = fake_loop(false);
        let guard = LoopGuard::new(weak_owner(&owner), true);
        let parent: Arc<dyn FutureView> = Arc::new(FakeFuture(AtomicU8::new(0)));
        let child_policy = guard.derive_child_policy(&parent).expect("loop guard derives");

        let child = FakeFuture(AtomicU8::new(0));
        assert!(child_policy.cancel(&child, &mut || child.cancel()));
        assert_eq!(parent.state(), PromiseState::Cancelled);
    }

    #[test]
    fn test_loop_guard_without_propagation_leaves_upstream() {
        let owner = fake_loop(false);
        let guard = LoopGuard::new(weak_owner(&owner), false);
        let parent: Arc<dyn FutureView> = Arc::new(FakeFuture(AtomicU8::new(0)));
        let child_policy = guard.derive_child_policy(&parent).expect("loop guard derives");

        let child = FakeFuture(AtomicU8::new(0));
        assert!(child_policy.cancel(&child, &mut || child.cancel()));
        assert_eq!(parent.state(), PromiseState::Pending);
    }
}
