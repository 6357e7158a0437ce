//! The environment passed to every task entry point: who is running it,
//! where its scratch memory lives, and a handle back to the scheduler for
//! spawning children.

use crate::scheduler::Scheduler;
use oslayer_arena::LinearArena;
use std::cell::RefCell;

/// Host CPU topology hint. The scheduler only needs a worker count and an
/// optional NUMA-group affinity; full topology discovery is out of scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCpuInfo {
    pub worker_thread_count: usize,
    pub numa_group: u32,
}

/// Passed by reference to every `TaskEntry` invocation.
pub struct TaskEnvironment<'a> {
    pub thread_id: std::thread::ThreadId,
    pub pool_id: u8,
    /// Per-worker scratch arena, reset before each task runs.
    pub local_arena: &'a RefCell<LinearArena>,
    /// Read-only view of scheduler-lifetime global scratch.
    pub global_arena: &'a LinearArena,
    pub scheduler: &'a Scheduler,
    pub host_cpu_info: &'a HostCpuInfo,
}
