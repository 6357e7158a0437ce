//! Fixed-capacity container of task slots owned by one thread, plus its
//! Chase-Lev-style work-stealing deque.
//!
//! This module deliberately stays low-level: slot storage, the free list,
//! the pending-unpublished stack, and the deque. The cross-pool bookkeeping
//! (parent/child completion cascade, fence notification) needs visibility
//! into every pool at once and lives on [`crate::scheduler::Scheduler`]
//! instead.

use crate::error::{Error, Result};
use crate::task::{TaskArgs, TaskEntry, TaskSlot, TaskState};
use crate::task_id::{TaskId, INVALID_TASK_ID, MAX_TASKS_PER_POOL, MIN_TASKS_PER_POOL};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use oslayer_arena::LinearArena;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage(u8);

impl PoolUsage {
    pub const DEFINE: PoolUsage = PoolUsage(1);
    pub const EXECUTE: PoolUsage = PoolUsage(2);
    pub const PUBLISH: PoolUsage = PoolUsage(4);
    pub const WORKER: PoolUsage = PoolUsage(8);

    pub const fn empty() -> Self {
        PoolUsage(0)
    }

    pub const fn contains(self, other: PoolUsage) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PoolUsage {
    type Output = PoolUsage;
    fn bitor(self, rhs: PoolUsage) -> PoolUsage {
        PoolUsage(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PoolUsage {
    fn bitor_assign(&mut self, rhs: PoolUsage) {
        self.0 |= rhs.0;
    }
}

/// One pool-type's worth of task storage: a fixed array of slots, a free
/// list, a pending-unpublished stack, and the steal deque.
pub struct TaskPool {
    pool_id: u8,
    usage: PoolUsage,
    owner_thread_id: Mutex<Option<ThreadId>>,
    slots: Box<[TaskSlot]>,
    free_list: Mutex<VecDeque<u16>>,
    /// Slots defined but not yet published, most-recent last, so `publish(n)`
    /// can pop the `n` most recently defined.
    pending_unpublished: Mutex<Vec<u16>>,
    worker: Worker<TaskId>,
    stealer: Stealer<TaskId>,
    injector: Injector<TaskId>,
    local_arena: RefCell<LinearArena>,
    max_io_requests: usize,
    pool_error: Mutex<Option<Error>>,
}

// SAFETY: `local_arena` is only ever touched by whichever single worker
// thread owns this pool (see `with_local_arena`); `worker`/`pending_unpublished`/
// `free_list` are likewise only mutated by the owner thread. Every other
// field is either atomic or a `Mutex`/`Stealer`/`Injector`, all `Sync` on
// their own. The `RefCell` is the one field that would otherwise block
// `Sync`; it is safe here because cross-thread access to a pool never
// reaches into another pool's arena — dispatch always uses the *dispatching*
// worker's own bound pool.
unsafe impl Sync for TaskPool {}

// SAFETY: a `TaskPool` is built once on the thread that calls
// `Scheduler::create` and from then on is only ever reached through a
// shared `&TaskPool` behind the scheduler's `Arc` — it is never actually
// moved to another thread while live, only dropped from whichever thread
// releases the last `Arc`. `LinearArena`'s `!Send` exists to stop a single
// arena being handed between threads while still in use, which never
// happens here.
unsafe impl Send for TaskPool {}

impl TaskPool {
    pub fn new(
        pool_id: u8,
        usage: PoolUsage,
        capacity: usize,
        local_memory_size: usize,
        max_io_requests: usize,
    ) -> Result<Self> {
        if !(MIN_TASKS_PER_POOL..=MAX_TASKS_PER_POOL).contains(&capacity) || !capacity.is_power_of_two()
        {
            return Err(Error::InvalidArg("pool capacity must be a power of two in range"));
        }
        let slots = (0..capacity).map(|_| TaskSlot::new()).collect();
        let free_list = (0..capacity as u16).collect();
        let worker = Worker::new_lifo();
        let stealer = worker.stealer();
        let local_arena = LinearArena::create(local_memory_size.max(4096), true, true)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(Self {
            pool_id,
            usage,
            owner_thread_id: Mutex::new(None),
            slots,
            free_list: Mutex::new(free_list),
            pending_unpublished: Mutex::new(Vec::new()),
            worker,
            stealer,
            injector: Injector::new(),
            local_arena: RefCell::new(local_arena),
            max_io_requests,
            pool_error: Mutex::new(None),
        })
    }

    pub fn pool_id(&self) -> u8 {
        self.pool_id
    }

    pub fn usage(&self) -> PoolUsage {
        self.usage
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free_list.lock().unwrap().len()
    }

    pub fn max_io_requests(&self) -> usize {
        self.max_io_requests
    }

    pub fn assign_owner(&self, thread_id: ThreadId) {
        *self.owner_thread_id.lock().unwrap() = Some(thread_id);
    }

    pub fn owner_thread_id(&self) -> Option<ThreadId> {
        *self.owner_thread_id.lock().unwrap()
    }

    fn is_owner_thread(&self) -> bool {
        self.owner_thread_id() == Some(std::thread::current().id())
    }

    pub fn stealer(&self) -> Stealer<TaskId> {
        self.stealer.clone()
    }

    pub fn get_pool_error(&self) -> Option<Error> {
        *self.pool_error.lock().unwrap()
    }

    pub(crate) fn set_pool_error(&self, error: Error) {
        *self.pool_error.lock().unwrap() = Some(error);
    }

    pub fn slot(&self, slot_index: u16) -> &TaskSlot {
        &self.slots[slot_index as usize]
    }

    /// Resolve a task id against this pool, rejecting stale generations.
    pub fn resolve(&self, id: TaskId) -> Option<&TaskSlot> {
        if id.is_invalid() || id.pool_id() != self.pool_id {
            return None;
        }
        let slot = self.slots.get(id.slot_index() as usize)?;
        if slot.generation() == id.generation() {
            Some(slot)
        } else {
            None
        }
    }

    /// This pool's local scratch arena. Only ever touched from the owning
    /// worker thread, which is the only thread ever given a
    /// `TaskEnvironment` pointing at this pool.
    pub fn local_arena(&self) -> &RefCell<LinearArena> {
        &self.local_arena
    }

    /// Allocate a free slot and move it into `Defining`. Internal: callers
    /// must finish populating the slot's fields before moving it onward.
    fn allocate_slot(&self) -> Option<(u16, u8)> {
        let idx = self.free_list.lock().unwrap().pop_front()?;
        let slot = &self.slots[idx as usize];
        let ok = slot.cas_state(TaskState::Free, TaskState::Defining);
        debug_assert!(ok, "slot popped from the free list was not actually Free");
        let generation = slot.bump_generation();
        Some((idx, generation))
    }

    /// Define a task in this slot array. Does not touch the parent's
    /// `work_count` or validate the parent id — that cross-pool bookkeeping
    /// is the scheduler's job.
    ///
    /// `extra_hold` is `true` for root (parentless) tasks: their initial
    /// `work_count` carries one additional unit beyond the normal "self"
    /// credit, released by `finish_task_definition` rather than `publish`.
    pub(crate) fn define_task_slot(
        &self,
        entry: TaskEntry,
        args: TaskArgs,
        parent: TaskId,
        extra_hold: bool,
    ) -> Result<TaskId> {
        debug_assert!(
            self.owner_thread_id().is_none() || self.is_owner_thread(),
            "define_task called from a thread that does not own this pool"
        );
        let Some((idx, generation)) = self.allocate_slot() else {
            self.set_pool_error(Error::PoolFull);
            return Err(Error::PoolFull);
        };
        let slot = &self.slots[idx as usize];
        // SAFETY: the slot is `Defining` and only this (owner) thread writes
        // to it, per `TaskSlot`'s documented contract.
        unsafe {
            slot.set_entry(entry);
            slot.write_args(args);
            slot.set_parent(parent);
            slot.set_pool_id(self.pool_id);
            slot.clear_permits();
            slot.set_io_request_slot(None);
        }
        slot.set_work_count(if extra_hold { 2 } else { 1 });
        slot.set_state(TaskState::Unpublished);
        if !extra_hold {
            self.pending_unpublished.lock().unwrap().push(idx);
        }
        Ok(TaskId::new(self.pool_id, generation, idx))
    }

    /// Pop up to `n` of the most recently defined, still-unpublished task
    /// ids (for `publish`). Returns fewer than `n` only if fewer are
    /// pending, in which case the caller should treat it as an error.
    pub(crate) fn take_pending_for_publish(&self, n: usize) -> Result<Vec<u16>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut pending = self.pending_unpublished.lock().unwrap();
        if n > pending.len() {
            self.set_pool_error(Error::InvalidArg("publish count exceeds pending tasks"));
            return Err(Error::InvalidArg("publish count exceeds pending tasks"));
        }
        Ok(pending.split_off(pending.len() - n))
    }

    /// Push a ready task id onto this pool's deque, from whichever thread is
    /// currently calling in — the owner pushes directly onto its local LIFO
    /// end, any other thread goes through the pool's `Injector` (the only
    /// part of a `crossbeam_deque` pool that is safe to push into
    /// concurrently from threads that don't own the `Worker`).
    pub(crate) fn push_ready(&self, id: TaskId) {
        if self.is_owner_thread() {
            self.worker.push(id);
        } else {
            self.injector.push(id);
        }
    }

    /// Pop this pool's own next ready task: local LIFO first, falling back
    /// to anything routed through the injector by another thread.
    pub(crate) fn pop_local(&self) -> Option<TaskId> {
        if let Some(id) = self.worker.pop() {
            return Some(id);
        }
        loop {
            match self.injector.steal_batch_and_pop(&self.worker) {
                Steal::Success(id) => return Some(id),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Steal one ready task id from this pool's deque (FIFO, the opposite
    /// end from the owner's LIFO pop).
    pub(crate) fn steal(&self) -> Option<TaskId> {
        loop {
            match self.stealer.steal() {
                Steal::Success(id) => return Some(id),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Return a completed slot's index to the free list. The generation is
    /// bumped lazily on the *next* `define_task_slot`, not here.
    pub(crate) fn recycle(&self, slot_index: u16) {
        self.slots[slot_index as usize].recycle();
        self.free_list.lock().unwrap().push_back(slot_index);
    }

}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("pool_id", &self.pool_id)
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

pub(crate) const NO_PARENT: TaskId = INVALID_TASK_ID;
