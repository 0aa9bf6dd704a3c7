//! ALICE-Loop — single-threaded event loop with timers and promises
//!
//! Don't share the state, share the loop.
//!
//! Deterministic task execution on one thread per loop:
//! - Indexed timer heap with O(log n) cancellation
//! - One-shot, fixed-delay and drift-free fixed-rate scheduling
//! - Time-sharing tasks bounded by a time budget
//! - Promises with pluggable completion policies and deadlock detection
//! - Any-of / select-n aggregation of promises
//!
//! Author: Moroya Sakamoto

pub mod budget;
pub mod clock;
pub mod combiner;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod intake;
pub mod policy;
pub mod promise;
pub mod scheduler;
pub mod task;

pub use budget::TimeBudget;
pub use clock::{Clock, ManualClock, SystemClock};
pub use combiner::{AggregateOptions, FutureCombiner};
pub use config::LoopConfig;
pub use error::{FutureError, LoopError, TaskError};
pub use event_loop::{EventLoop, LoopHandle, LoopStats};
pub use intake::{BoundedIntake, Intake, UnboundedIntake};
pub use policy::{Completion, CompletionPolicy, FutureView, LoopAffinity, LoopGuard, ObtrudeClosed, Unguarded};
pub use promise::{Promise, PromiseState};
pub use scheduler::{HeapNode, Scheduler, TaskKey};
pub use task::{ScheduleBuilder, Step, TaskContext, TaskFeatures};
