//! Work-stealing fork-join task scheduler.
//!
//! A [`Scheduler`] owns a fixed set of [`TaskPool`](task_pool::TaskPool)s —
//! some used by producer threads to define and publish work, some bound
//! one-per-worker-thread to actually run it — plus a pool of OS worker
//! threads (built on [`oslayer_workerpool`]) that pull ready tasks off their
//! own pool's deque or steal from another pool's when idle.
//!
//! A task is declared with [`Scheduler::define_task`], optionally as the
//! child of another task already in flight. Root tasks (no parent) only
//! become runnable once [`Scheduler::finish_task_definition`] is called;
//! non-root tasks become runnable as soon as [`Scheduler::publish`] (or the
//! combined [`Scheduler::spawn_child_task`]) is called for them. A
//! [`Fence`](fence::Fence) lets a producer block until a declared set of
//! roots — and everything they transitively spawned — has completed.

pub mod env;
pub mod error;
pub mod events;
pub mod fence;
pub mod log;
pub mod scheduler;
pub mod task;
pub mod task_id;
pub mod task_pool;

pub use env::{HostCpuInfo, TaskEnvironment};
pub use error::{Error, Result};
pub use events::{Clock, Event, EventSink, NullEventSink, RingEventSink};
pub use fence::Fence;
pub use log::{LogLevel, LogSink, NullSink, StderrSink};
pub use scheduler::{PoolTypeInit, Scheduler, SchedulerInit};
pub use task::{TaskArgs, TaskEntry, TaskSlot, TaskState, TASK_ARGS_SIZE};
pub use task_id::{TaskId, INVALID_TASK_ID, MAX_TASKS_PER_POOL, MIN_TASKS_PER_POOL};
pub use task_pool::{PoolUsage, TaskPool};
