//! Construction, the worker dispatch loop, and the parent/child completion
//! cascade — the part of the system that needs to see every pool at once.

use crate::env::{HostCpuInfo, TaskEnvironment};
use crate::error::{Error, Result};
use crate::events::{Clock, Event, EventSink, NullEventSink};
use crate::fence::Fence;
use crate::log::{LogLevel, LogSink, StderrSink};
use crate::task::{TaskArgs, TaskEntry, TaskSlot, TaskState};
use crate::task_id::{TaskId, MAX_TASKS_PER_POOL, MIN_TASKS_PER_POOL};
use crate::task_pool::{PoolUsage, TaskPool};
use oslayer_arena::LinearArena;
use oslayer_workerpool::{WorkerHandle, WorkerPool, WorkerPoolInit};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

/// Name reported in every worker's `Launch`/`Finish` event pair. Workers are
/// distinguished by the `worker_index` the event sink is called with, not by
/// this name, so one shared name for all of them is sufficient.
const WORKER_EVENT_NAME: &str = "scheduler-worker";

/// One distinct pool configuration; `pool_count` pools of this shape are
/// created, except for `WORKER`-usage types, where one pool is created per
/// worker thread regardless of the requested count (each worker is bound to
/// exactly one `EXECUTE|WORKER` pool).
pub struct PoolTypeInit {
    pub usage: PoolUsage,
    pub pool_count: usize,
    pub max_active_tasks: usize,
    pub local_memory_size: usize,
    pub max_io_requests: usize,
}

impl Default for PoolTypeInit {
    fn default() -> Self {
        Self {
            usage: PoolUsage::empty(),
            pool_count: 1,
            max_active_tasks: MIN_TASKS_PER_POOL,
            local_memory_size: 64 * 1024,
            max_io_requests: 0,
        }
    }
}

pub struct SchedulerInit {
    pub worker_thread_count: usize,
    pub global_memory_size: usize,
    pub pool_types: Vec<PoolTypeInit>,
    pub task_context_data: Option<Arc<dyn Any + Send + Sync>>,
    pub log_sink: Arc<dyn LogSink>,
    pub event_sink: Arc<dyn EventSink>,
}

impl Default for SchedulerInit {
    fn default() -> Self {
        Self {
            worker_thread_count: 0,
            global_memory_size: 1024 * 1024,
            pool_types: vec![PoolTypeInit {
                usage: PoolUsage::EXECUTE | PoolUsage::PUBLISH | PoolUsage::WORKER,
                ..Default::default()
            }],
            task_context_data: None,
            log_sink: Arc::new(StderrSink),
            event_sink: Arc::new(NullEventSink),
        }
    }
}

/// Read-only after construction; workers read from it but nothing mutates
/// it once the scheduler is live, so sharing it across threads is safe even
/// though `LinearArena` itself opts out of `Sync`.
struct GlobalArena(LinearArena);

// SAFETY: only `Scheduler::create` and `Scheduler::destroy` touch this
// arena's allocator state, and both run before/after worker threads are
// live. Every other access is a read of `capacity`/`used`, never a mutation.
unsafe impl Sync for GlobalArena {}
unsafe impl Send for GlobalArena {}

pub struct Scheduler {
    pools: Vec<TaskPool>,
    worker_pool_ids: Vec<u8>,
    worker_pool: Mutex<Option<WorkerPool>>,
    global_arena: GlobalArena,
    host_cpu_info: HostCpuInfo,
    log_sink: Arc<dyn LogSink>,
    event_sink: Arc<dyn EventSink>,
    clock: Clock,
    fences: Mutex<Vec<Arc<Fence>>>,
    shutting_down: AtomicBool,
    context: Option<Arc<dyn Any + Send + Sync>>,
    producer_pool_assignment: Mutex<HashMap<ThreadId, u8>>,
    rng_state: Vec<AtomicU32>,
    /// `clock.now_nanos()` at each worker's `Launch`, read back at `Finish`
    /// to report that worker's total elapsed lifetime.
    worker_launch_ns: Vec<AtomicU64>,
}

impl Scheduler {
    /// Reserve the global arena, instantiate every pool, and spawn the
    /// worker threads. If any worker's init callback fails, every
    /// already-spawned worker is signaled `EXIT` and joined before this
    /// returns `InitFailed`.
    pub fn create(init: SchedulerInit) -> Result<Arc<Scheduler>> {
        let worker_thread_count = if init.worker_thread_count == 0 {
            num_cpus::get()
        } else {
            init.worker_thread_count
        };
        if worker_thread_count == 0 {
            return Err(Error::InvalidArg("worker_thread_count resolved to zero"));
        }

        let global_arena = LinearArena::create(init.global_memory_size.max(4096), true, true)
            .map_err(|_| Error::OutOfMemory)?;

        let mut pools = Vec::new();
        let mut worker_pool_ids = Vec::new();
        for pool_type in &init.pool_types {
            let count = if pool_type.usage.contains(PoolUsage::WORKER) {
                worker_thread_count
            } else {
                pool_type.pool_count
            };
            for _ in 0..count {
                let pool_id = pools.len();
                if pool_id > u8::MAX as usize {
                    return Err(Error::InvalidArg("too many pools for an 8-bit pool id"));
                }
                if !(MIN_TASKS_PER_POOL..=MAX_TASKS_PER_POOL).contains(&pool_type.max_active_tasks) {
                    return Err(Error::InvalidArg("max_active_tasks out of range"));
                }
                let pool = TaskPool::new(
                    pool_id as u8,
                    pool_type.usage,
                    pool_type.max_active_tasks,
                    pool_type.local_memory_size,
                    pool_type.max_io_requests,
                )?;
                if pool_type.usage.contains(PoolUsage::WORKER) {
                    worker_pool_ids.push(pool_id as u8);
                }
                pools.push(pool);
            }
        }
        if worker_pool_ids.len() != worker_thread_count {
            return Err(Error::InvalidArg(
                "no WORKER-usage pool type configured one-per-worker-thread",
            ));
        }

        let rng_state = (0..worker_thread_count)
            .map(|i| AtomicU32::new(0x9E37_79B9 ^ (i as u32 + 1)))
            .collect();
        let worker_launch_ns = (0..worker_thread_count).map(|_| AtomicU64::new(0)).collect();

        let scheduler = Arc::new(Scheduler {
            pools,
            worker_pool_ids,
            worker_pool: Mutex::new(None),
            global_arena: GlobalArena(global_arena),
            host_cpu_info: HostCpuInfo { worker_thread_count, numa_group: 0 },
            log_sink: init.log_sink,
            event_sink: init.event_sink,
            clock: Clock::start(),
            fences: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            context: init.task_context_data,
            producer_pool_assignment: Mutex::new(HashMap::new()),
            rng_state,
            worker_launch_ns,
        });

        let init_scheduler = Arc::clone(&scheduler);
        let main_scheduler = Arc::clone(&scheduler);
        let worker_pool = WorkerPool::create(WorkerPoolInit {
            thread_count: worker_thread_count,
            stack_size: 0,
            arena_size: 4096,
            numa_group: 0,
            pool_context: (),
            init: move |handle: &WorkerHandle<()>| {
                let pool_id = init_scheduler.worker_pool_ids[handle.index];
                init_scheduler.pools[pool_id as usize].assign_owner(handle.thread_id);
                init_scheduler.worker_launch_ns[handle.index]
                    .store(init_scheduler.clock.now_nanos(), Ordering::Relaxed);
                init_scheduler
                    .event_sink
                    .record(handle.index, Event::Launch { name: WORKER_EVENT_NAME });
                Ok(())
            },
            main: move |handle: &WorkerHandle<()>, reason| {
                main_scheduler.worker_main(handle.index, reason);
            },
        })
        .map_err(|_| Error::InitFailed)?;
        worker_pool.launch();

        *scheduler.worker_pool.lock().unwrap() = Some(worker_pool);
        Ok(scheduler)
    }

    pub fn host_cpu_info(&self) -> &HostCpuInfo {
        &self.host_cpu_info
    }

    pub fn context<T: 'static>(&self) -> Option<&T> {
        self.context.as_ref()?.downcast_ref::<T>()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.log_sink.log(level, message);
    }

    pub fn pool(&self, pool_id: u8) -> Option<&TaskPool> {
        self.pools.get(pool_id as usize)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Assign the calling thread a producer pool matching `required` usage
    /// (e.g. `DEFINE | PUBLISH`), on first call; later calls from the same
    /// thread return the same pool.
    pub fn allocate_pool_for_thread(&self, required: PoolUsage) -> Result<u8> {
        let current = thread::current().id();
        let mut assignment = self.producer_pool_assignment.lock().unwrap();
        if let Some(&pool_id) = assignment.get(&current) {
            return Ok(pool_id);
        }
        for pool in &self.pools {
            if pool.usage().contains(required) && pool.owner_thread_id().is_none() {
                pool.assign_owner(current);
                assignment.insert(current, pool.pool_id());
                return Ok(pool.pool_id());
            }
        }
        Err(Error::InvalidArg("no pool of the requested usage is available for this thread"))
    }

    /// Define a task in `pool_id`. `parent == INVALID_TASK_ID` defines a
    /// root; roots only become dispatchable through
    /// [`finish_task_definition`](Self::finish_task_definition), never
    /// through [`publish`](Self::publish).
    pub fn define_task(
        &self,
        pool_id: u8,
        entry: TaskEntry,
        args: TaskArgs,
        parent: TaskId,
    ) -> Result<TaskId> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let pool = self.pools.get(pool_id as usize).ok_or(Error::InvalidArg("unknown pool id"))?;
        if !parent.is_invalid() {
            let parent_pool =
                self.pools.get(parent.pool_id() as usize).ok_or(Error::InvalidId)?;
            if parent_pool.resolve(parent).is_none() {
                pool.set_pool_error(Error::InvalidId);
                return Err(Error::InvalidId);
            }
        }
        let extra_hold = parent.is_invalid();
        let id = pool.define_task_slot(entry, args, parent, extra_hold)?;
        if !parent.is_invalid() {
            let parent_pool = &self.pools[parent.pool_id() as usize];
            if let Some(parent_slot) = parent_pool.resolve(parent) {
                parent_slot.inc_work_count();
            }
        }
        Ok(id)
    }

    /// `define_task` immediately followed by `publish(1)`. Legal for
    /// children spawned from within a currently-running task.
    pub fn spawn_child_task(
        &self,
        pool_id: u8,
        entry: TaskEntry,
        args: TaskArgs,
        parent: TaskId,
    ) -> Result<TaskId> {
        let id = self.define_task(pool_id, entry, args, parent)?;
        self.publish(pool_id, 1)?;
        Ok(id)
    }

    /// Publish the `n` most recently defined, still-unpublished tasks in
    /// `pool_id`. `n == 0` is a no-op; `n` greater than the number pending
    /// is `InvalidArg`.
    pub fn publish(&self, pool_id: u8, n: usize) -> Result<usize> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let pool = self.pools.get(pool_id as usize).ok_or(Error::InvalidArg("unknown pool id"))?;
        let indices = pool.take_pending_for_publish(n)?;
        for idx in &indices {
            let slot = pool.slot(*idx);
            slot.set_published(true);
            let id = TaskId::new(pool.pool_id(), slot.generation(), *idx);
            self.try_make_ready(pool, slot, id);
        }
        Ok(indices.len())
    }

    /// Called by the producer once every child of `root_id` has been
    /// declared. Releases the defining hold taken at `define_task` time and
    /// publishes the root.
    pub fn finish_task_definition(&self, root_id: TaskId) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let pool = self.pools.get(root_id.pool_id() as usize).ok_or(Error::InvalidId)?;
        let slot = pool.resolve(root_id).ok_or(Error::InvalidId)?;
        if !slot.parent().is_invalid() {
            return Err(Error::InvalidArg("finish_task_definition is only valid for root tasks"));
        }
        slot.set_published(true);
        self.release(root_id);
        Ok(())
    }

    pub fn get_pool_error(&self, pool_id: u8) -> Option<Error> {
        self.pools.get(pool_id as usize).and_then(TaskPool::get_pool_error)
    }

    pub fn create_fence(&self, root_ids: Vec<TaskId>) -> Arc<Fence> {
        let fence = Arc::new(Fence::new(root_ids));
        self.fences.lock().unwrap().push(Arc::clone(&fence));
        fence
    }

    /// Legal only after `fence.wait()` has returned.
    pub fn destroy_fence(&self, fence: &Arc<Fence>) {
        debug_assert!(fence.is_signaled(), "destroying a fence before wait() returned");
        self.fences.lock().unwrap().retain(|f| !Arc::ptr_eq(f, fence));
    }

    pub fn emit_task_event(&self, worker_index: usize, task_id: TaskId, message: String) {
        self.event_sink.record(worker_index, Event::TaskEvent { task_id, message });
    }

    pub fn drain_events(&self, worker_index: usize) -> Vec<Event> {
        self.event_sink.drain(worker_index)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Broadcast `EXIT` to every worker and join them. Logs a watchdog
    /// warning for any pool that still has tasks in flight (a missing
    /// `finish_task_definition` for some root, most likely).
    pub fn destroy(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for pool in &self.pools {
            if pool.in_use() > 0 {
                self.log(
                    LogLevel::Warn,
                    &format!(
                        "pool {} destroyed with {} task(s) still in flight",
                        pool.pool_id(),
                        pool.in_use()
                    ),
                );
            }
        }
        if let Some(worker_pool) = self.worker_pool.lock().unwrap().as_mut() {
            worker_pool.destroy();
        }
    }

    fn wake_workers(&self) {
        if let Some(worker_pool) = self.worker_pool.lock().unwrap().as_ref() {
            worker_pool.signal_all(1);
        }
    }

    fn next_random(&self, worker_index: usize) -> u32 {
        let cell = &self.rng_state[worker_index];
        let mut x = cell.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        cell.store(x, Ordering::Relaxed);
        x
    }

    /// One worker's response to being woken: drain ready work until both its
    /// own pool and every victim pool come up empty, then return (which, in
    /// the worker-pool abstraction, is what puts the thread back to sleep on
    /// its wake channel — the "park on a scheduler-wide condition" in spirit).
    fn worker_main(&self, worker_index: usize, reason: oslayer_workerpool::WakeReason) {
        use oslayer_workerpool::WakeReason;
        if reason == WakeReason::Exit {
            let launched_at = self.worker_launch_ns[worker_index].load(Ordering::Relaxed);
            let elapsed = self.clock.now_nanos().saturating_sub(launched_at);
            self.event_sink.record(
                worker_index,
                Event::Finish { name: WORKER_EVENT_NAME, ns: elapsed },
            );
            return;
        }
        if reason == WakeReason::Error {
            return;
        }
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            match self.acquire_ready_task(worker_index) {
                Some(task_id) => self.dispatch(task_id, worker_index),
                None => return,
            }
        }
    }

    fn acquire_ready_task(&self, worker_index: usize) -> Option<TaskId> {
        let own_pool_id = self.worker_pool_ids[worker_index];
        let own_pool = &self.pools[own_pool_id as usize];
        if let Some(id) = own_pool.pop_local() {
            return Some(id);
        }
        let n = self.pools.len();
        if n <= 1 {
            return None;
        }
        let start = (self.next_random(worker_index) as usize) % n;
        for offset in 0..n {
            let victim_id = (start + offset) % n;
            if victim_id == own_pool_id as usize {
                continue;
            }
            let victim = &self.pools[victim_id];
            if !victim.usage().contains(PoolUsage::PUBLISH) {
                continue;
            }
            if let Some(id) = victim.steal() {
                return Some(id);
            }
        }
        None
    }

    fn dispatch(&self, id: TaskId, worker_index: usize) {
        // The slot lives wherever the task was defined — possibly a
        // DEFINE-only producer pool with no worker bound to it at all. The
        // environment handed to the task body, in particular its scratch
        // arena, must instead come from the pool *this worker owns*: that is
        // the only pool whose `local_arena` this thread is allowed to touch.
        let defining_pool = &self.pools[id.pool_id() as usize];
        let Some(slot) = defining_pool.resolve(id) else {
            // Should be unreachable: nothing pops a stale id off a deque.
            // Defensive no-op rather than a panic on a worker thread.
            return;
        };
        let executing_pool = &self.pools[self.worker_pool_ids[worker_index] as usize];

        slot.set_state(TaskState::Running);
        let begin_ns = self.clock.now_nanos();
        self.event_sink.record(worker_index, Event::TaskBegin { task_id: id, ns: begin_ns });

        executing_pool.local_arena().borrow_mut().reset();
        let env = TaskEnvironment {
            thread_id: thread::current().id(),
            pool_id: executing_pool.pool_id(),
            local_arena: executing_pool.local_arena(),
            global_arena: &self.global_arena.0,
            scheduler: self,
            host_cpu_info: &self.host_cpu_info,
        };
        (slot.entry())(id, slot.args(), &env);

        let end_ns = self.clock.now_nanos();
        self.event_sink.record(worker_index, Event::TaskEnd { task_id: id, ns: end_ns });
        slot.set_state(TaskState::Completing);
        self.release(id);
    }

    /// The one function that decrements a `work_count`: a task's own
    /// dispatch loop finishing its body, a child's completion cascading
    /// into its parent, and `finish_task_definition`'s hold release all
    /// route through here.
    fn release(&self, id: TaskId) {
        let Some(pool) = self.pools.get(id.pool_id() as usize) else { return };
        let Some(slot) = pool.resolve(id) else {
            // Stale id: the slot was already freed by an earlier completion
            // (can legitimately happen if a parent was already torn down).
            return;
        };
        let new_count = slot.dec_work_count();
        debug_assert!(new_count >= 0, "work_count underflowed for {id:?}");
        if new_count == 1 {
            self.try_make_ready(pool, slot, id);
        } else if new_count <= 0 {
            self.complete(pool, slot, id);
        }
    }

    fn try_make_ready(&self, pool: &TaskPool, slot: &TaskSlot, id: TaskId) {
        if slot.published()
            && slot.work_count() == 1
            && slot.cas_state(TaskState::Unpublished, TaskState::Ready)
        {
            pool.push_ready(id);
            self.wake_workers();
        }
    }

    fn complete(&self, pool: &TaskPool, slot: &TaskSlot, id: TaskId) {
        slot.set_state(TaskState::Completed);

        // SAFETY: the slot is Completed; nothing else reads `permits` after
        // this point (it is cleared again on recycle).
        let permits = unsafe { slot.take_permits() };
        for successor in permits {
            if let Some(successor_pool) = self.pools.get(successor.pool_id() as usize) {
                if let Some(successor_slot) = successor_pool.resolve(successor) {
                    self.try_make_ready(successor_pool, successor_slot, successor);
                }
            }
        }

        self.notify_fences(id);

        let parent = slot.parent();
        pool.recycle(id.slot_index());
        if !parent.is_invalid() {
            self.release(parent);
        }
    }

    fn notify_fences(&self, id: TaskId) {
        let fences = self.fences.lock().unwrap();
        for fence in fences.iter() {
            if fence.contains_root(id) {
                fence.mark_root_done();
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.shutting_down.load(Ordering::Acquire) {
            self.destroy();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pools", &self.pools.len())
            .field("worker_thread_count", &self.host_cpu_info.worker_thread_count)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_id::INVALID_TASK_ID;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn wait_for<F: Fn() -> bool>(pred: F, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while !pred() {
            if std::time::Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    fn tiny_scheduler(worker_thread_count: usize) -> Arc<Scheduler> {
        Scheduler::create(SchedulerInit {
            worker_thread_count,
            global_memory_size: 64 * 1024,
            pool_types: vec![
                PoolTypeInit {
                    usage: PoolUsage::DEFINE | PoolUsage::PUBLISH,
                    pool_count: 1,
                    max_active_tasks: 256,
                    local_memory_size: 4096,
                    max_io_requests: 0,
                },
                PoolTypeInit {
                    usage: PoolUsage::EXECUTE | PoolUsage::PUBLISH | PoolUsage::WORKER,
                    max_active_tasks: 256,
                    local_memory_size: 4096,
                    ..Default::default()
                },
            ],
            ..Default::default()
        })
        .unwrap()
    }

    static SUCCEEDED: AtomicBool = AtomicBool::new(false);

    fn mark_succeeded(_id: TaskId, _args: &TaskArgs, _env: &TaskEnvironment) {
        SUCCEEDED.store(true, Ordering::SeqCst);
    }

    #[test]
    fn empty_root_completes_and_signals_fence() {
        SUCCEEDED.store(false, Ordering::SeqCst);
        let scheduler = tiny_scheduler(2);
        let producer_pool = scheduler.allocate_pool_for_thread(PoolUsage::DEFINE).unwrap();
        let root = scheduler
            .define_task(producer_pool, mark_succeeded, TaskArgs::empty(), INVALID_TASK_ID)
            .unwrap();
        let fence = scheduler.create_fence(vec![root]);
        scheduler.finish_task_definition(root).unwrap();
        fence.wait();
        assert!(SUCCEEDED.load(Ordering::SeqCst));
        scheduler.destroy_fence(&fence);
    }

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn increment(_id: TaskId, _args: &TaskArgs, _env: &TaskEnvironment) {
        COUNTER.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn independent_tasks_never_run_on_the_producer_thread() {
        COUNTER.store(0, Ordering::SeqCst);
        let scheduler = tiny_scheduler(4);
        let producer_pool = scheduler.allocate_pool_for_thread(PoolUsage::DEFINE).unwrap();
        let mut roots = Vec::new();
        for _ in 0..200 {
            let id = scheduler
                .define_task(producer_pool, increment, TaskArgs::empty(), INVALID_TASK_ID)
                .unwrap();
            scheduler.finish_task_definition(id).unwrap();
            roots.push(id);
        }
        let fence = scheduler.create_fence(roots);
        fence.wait();
        assert_eq!(COUNTER.load(Ordering::SeqCst), 200);
        scheduler.destroy_fence(&fence);
    }

    #[test]
    fn pool_full_then_recovers_after_completion() {
        let scheduler = tiny_scheduler(1);
        let producer_pool = scheduler.allocate_pool_for_thread(PoolUsage::DEFINE).unwrap();
        let mut roots = Vec::new();
        for _ in 0..256 {
            roots.push(
                scheduler
                    .define_task(producer_pool, mark_succeeded, TaskArgs::empty(), INVALID_TASK_ID)
                    .unwrap(),
            );
        }
        let overflow = scheduler.define_task(
            producer_pool,
            mark_succeeded,
            TaskArgs::empty(),
            INVALID_TASK_ID,
        );
        assert!(matches!(overflow, Err(Error::PoolFull)));
        assert_eq!(scheduler.get_pool_error(producer_pool), Some(Error::PoolFull));

        let fence = scheduler.create_fence(roots.clone());
        for root in &roots {
            scheduler.finish_task_definition(*root).unwrap();
        }
        fence.wait();
        scheduler.destroy_fence(&fence);

        let after = scheduler.define_task(
            producer_pool,
            mark_succeeded,
            TaskArgs::empty(),
            INVALID_TASK_ID,
        );
        assert!(after.is_ok());
    }

    #[test]
    fn generation_bump_rejects_the_stale_id() {
        let scheduler = tiny_scheduler(1);
        let producer_pool = scheduler.allocate_pool_for_thread(PoolUsage::DEFINE).unwrap();
        let first = scheduler
            .define_task(producer_pool, mark_succeeded, TaskArgs::empty(), INVALID_TASK_ID)
            .unwrap();
        let fence = scheduler.create_fence(vec![first]);
        scheduler.finish_task_definition(first).unwrap();
        fence.wait();
        scheduler.destroy_fence(&fence);

        assert!(wait_for(
            || scheduler.pool(producer_pool).unwrap().resolve(first).is_none(),
            Duration::from_secs(1)
        ));

        let second = scheduler
            .define_task(producer_pool, mark_succeeded, TaskArgs::empty(), INVALID_TASK_ID)
            .unwrap();
        assert_eq!(first.slot_index(), second.slot_index());
        assert_ne!(first, second);
        assert!(scheduler.pool(producer_pool).unwrap().resolve(first).is_none());
        let fence2 = scheduler.create_fence(vec![second]);
        scheduler.finish_task_definition(second).unwrap();
        fence2.wait();
        scheduler.destroy_fence(&fence2);
    }

    static GRANDCHILD_DONE: AtomicBool = AtomicBool::new(false);
    static CHILD_RAN_TOO_EARLY: AtomicBool = AtomicBool::new(false);

    fn noop_root(_id: TaskId, _args: &TaskArgs, _env: &TaskEnvironment) {}

    fn grandchild_entry(_id: TaskId, _args: &TaskArgs, _env: &TaskEnvironment) {
        thread::sleep(Duration::from_millis(30));
        GRANDCHILD_DONE.store(true, Ordering::SeqCst);
    }

    fn child_entry(_id: TaskId, _args: &TaskArgs, _env: &TaskEnvironment) {
        if !GRANDCHILD_DONE.load(Ordering::SeqCst) {
            CHILD_RAN_TOO_EARLY.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn publish_does_not_make_a_task_ready_while_its_own_child_is_outstanding() {
        GRANDCHILD_DONE.store(false, Ordering::SeqCst);
        CHILD_RAN_TOO_EARLY.store(false, Ordering::SeqCst);
        let scheduler = tiny_scheduler(4);
        let producer_pool = scheduler.allocate_pool_for_thread(PoolUsage::DEFINE).unwrap();

        let root = scheduler
            .define_task(producer_pool, noop_root, TaskArgs::empty(), INVALID_TASK_ID)
            .unwrap();
        let child = scheduler
            .define_task(producer_pool, child_entry, TaskArgs::empty(), root)
            .unwrap();
        let _grandchild = scheduler
            .define_task(producer_pool, grandchild_entry, TaskArgs::empty(), child)
            .unwrap();
        assert_eq!(
            scheduler.pool(producer_pool).unwrap().resolve(child).unwrap().work_count(),
            2
        );

        // Publishing the child while its own child (the grandchild) is still
        // outstanding must not make it ready: work_count is 2, not 1.
        scheduler.publish(producer_pool, 2).unwrap();
        scheduler.finish_task_definition(root).unwrap();

        let fence = scheduler.create_fence(vec![root]);
        fence.wait();
        assert!(GRANDCHILD_DONE.load(Ordering::SeqCst));
        assert!(!CHILD_RAN_TOO_EARLY.load(Ordering::SeqCst));
        scheduler.destroy_fence(&fence);
    }

    #[test]
    fn shutdown_joins_workers_in_bounded_time() {
        let scheduler = tiny_scheduler(2);
        let start = std::time::Instant::now();
        scheduler.destroy();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(scheduler.is_shutting_down());
    }
}
