//! The task descriptor: entry point, inline argument payload, completion
//! counter, and the slot state machine
//! `FREE -> DEFINING -> UNPUBLISHED -> READY -> RUNNING -> COMPLETING -> COMPLETED -> FREE`.

use crate::env::TaskEnvironment;
use crate::task_id::TaskId;
use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};

/// Size of the inline argument payload. The original interface's
/// `task_args` is a fixed buffer rather than a heap allocation so that
/// `define_task` never allocates on the hot path; 48 bytes covers the
/// handful of pointer/index-sized fields every scenario in this crate's
/// tests needs.
pub const TASK_ARGS_SIZE: usize = 48;

/// Fixed-size inline argument buffer, written once by the defining thread
/// and read by whichever worker later dispatches the task.
#[repr(align(8))]
pub struct TaskArgs {
    bytes: [u8; TASK_ARGS_SIZE],
}

impl TaskArgs {
    pub const fn empty() -> Self {
        Self { bytes: [0u8; TASK_ARGS_SIZE] }
    }

    /// Write `value` into the inline buffer.
    ///
    /// # Panics
    /// If `T` does not fit, or needs stricter alignment than the buffer
    /// provides.
    pub fn write<T: Copy>(&mut self, value: T) {
        assert!(
            mem::size_of::<T>() <= TASK_ARGS_SIZE,
            "task argument type is larger than the inline payload"
        );
        assert!(
            mem::align_of::<T>() <= mem::align_of::<Self>(),
            "task argument type needs stricter alignment than the inline payload"
        );
        // SAFETY: the size/align asserts above guarantee `value` fits
        // entirely within `self.bytes` at the required alignment.
        unsafe {
            (self.bytes.as_mut_ptr() as *mut T).write(value);
        }
    }

    /// Read a `T` previously written with [`write`](Self::write).
    ///
    /// # Safety
    /// The caller must read the same `T` that was last written; the buffer
    /// carries no type tag.
    pub unsafe fn read<T: Copy>(&self) -> T {
        (self.bytes.as_ptr() as *const T).read()
    }
}

impl std::fmt::Debug for TaskArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskArgs").field("size", &TASK_ARGS_SIZE).finish()
    }
}

/// A task's entry point: given its own id, its argument payload, and the
/// environment of the worker dispatching it, run to completion.
pub type TaskEntry = fn(TaskId, &TaskArgs, &TaskEnvironment);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Free = 0,
    Defining = 1,
    Unpublished = 2,
    Ready = 3,
    Running = 4,
    Completing = 5,
    Completed = 6,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Free,
            1 => TaskState::Defining,
            2 => TaskState::Unpublished,
            3 => TaskState::Ready,
            4 => TaskState::Running,
            5 => TaskState::Completing,
            _ => TaskState::Completed,
        }
    }
}

/// One slot in a task pool's descriptor array.
///
/// Fields other than `state` and `work_count` are written exactly once by
/// the owning pool's thread while the slot is `DEFINING`, then frozen until
/// the slot returns to `FREE`. A worker on a different thread only ever
/// observes them after popping the task's id off a `crossbeam-deque` steal
/// queue, and that queue's own push(Release)/pop(Acquire) synchronization is
/// what makes the cross-thread read safe — see the `unsafe impl Sync` below.
pub struct TaskSlot {
    state: AtomicU8,
    generation: AtomicU8,
    work_count: AtomicI64,
    /// Set by `publish`/`finish_task_definition`; a task only moves
    /// `Unpublished -> Ready` once this is true *and* `work_count == 1`,
    /// whichever of the two happens last.
    published: AtomicBool,
    entry: UnsafeCell<Option<TaskEntry>>,
    args: UnsafeCell<TaskArgs>,
    parent: UnsafeCell<TaskId>,
    permits: UnsafeCell<Vec<TaskId>>,
    pool_id: UnsafeCell<u8>,
    io_request_slot: UnsafeCell<Option<u32>>,
}

// SAFETY: every `UnsafeCell` field above is written only by the defining
// thread, and only while the slot is in the `Defining` state (reachable
// exclusively through that same thread via `TaskPool::define_task`, never
// concurrently). By the time any other thread can observe the slot's
// `TaskId` — via a steal-deque pop or the parent/child `permits` list — the
// defining thread has already finished writing and published it, and the
// deque's pop carries an acquire fence paired with publish's release fence.
// After that point every other thread only reads these fields.
unsafe impl Sync for TaskSlot {}

impl TaskSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(TaskState::Free as u8),
            generation: AtomicU8::new(0),
            work_count: AtomicI64::new(0),
            published: AtomicBool::new(false),
            entry: UnsafeCell::new(None),
            args: UnsafeCell::new(TaskArgs::empty()),
            parent: UnsafeCell::new(crate::task_id::INVALID_TASK_ID),
            permits: UnsafeCell::new(Vec::new()),
            pool_id: UnsafeCell::new(0),
            io_request_slot: UnsafeCell::new(None),
        }
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically move the slot from `expected` to `new`; returns whether it
    /// succeeded.
    pub(crate) fn cas_state(&self, expected: TaskState, new: TaskState) -> bool {
        self.state
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn generation(&self) -> u8 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u8 {
        // Wrapping add: generation reuse after 256 cycles of the same slot
        // is an accepted, documented limitation of a one-byte counter, not a
        // correctness bug this crate needs to close.
        self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    pub(crate) fn set_published(&self, published: bool) {
        self.published.store(published, Ordering::Release);
    }

    pub fn work_count(&self) -> i64 {
        self.work_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_work_count(&self, n: i64) {
        self.work_count.store(n, Ordering::Release);
    }

    /// Decrement `work_count` by one, returning the new value.
    pub(crate) fn dec_work_count(&self) -> i64 {
        self.work_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn inc_work_count(&self) -> i64 {
        self.work_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// # Safety
    /// Only the defining thread may call this, and only while the slot is
    /// `Defining`.
    pub(crate) unsafe fn set_entry(&self, entry: TaskEntry) {
        *self.entry.get() = Some(entry);
    }

    pub fn entry(&self) -> TaskEntry {
        // SAFETY: by the time a task is dispatched, it has been published,
        // which can only happen after `set_entry` ran on the defining
        // thread.
        unsafe { (*self.entry.get()).expect("dispatched task has no entry point") }
    }

    /// # Safety
    /// Only the defining thread may call this, and only while the slot is
    /// `Defining`.
    pub(crate) unsafe fn write_args(&self, args: TaskArgs) {
        *self.args.get() = args;
    }

    pub fn args(&self) -> &TaskArgs {
        // SAFETY: frozen after publish, see the struct-level comment.
        unsafe { &*self.args.get() }
    }

    pub(crate) unsafe fn set_parent(&self, parent: TaskId) {
        *self.parent.get() = parent;
    }

    pub fn parent(&self) -> TaskId {
        unsafe { *self.parent.get() }
    }

    pub(crate) unsafe fn set_pool_id(&self, pool_id: u8) {
        *self.pool_id.get() = pool_id;
    }

    pub fn pool_id(&self) -> u8 {
        unsafe { *self.pool_id.get() }
    }

    pub(crate) unsafe fn set_io_request_slot(&self, slot: Option<u32>) {
        *self.io_request_slot.get() = slot;
    }

    pub fn io_request_slot(&self) -> Option<u32> {
        unsafe { *self.io_request_slot.get() }
    }

    pub(crate) unsafe fn clear_permits(&self) {
        (*self.permits.get()).clear();
    }

    /// Take the permits list, leaving it empty. Called exactly once by the
    /// completion cascade.
    pub(crate) unsafe fn take_permits(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.permits.get())
    }

    /// Reset a slot back to its pristine, reusable state. Called by the
    /// completion cascade right before the slot returns to the free list.
    pub(crate) fn recycle(&self) {
        // SAFETY: the slot is `Completed` and no other thread holds a live
        // TaskId referencing the current generation anymore.
        unsafe {
            *self.entry.get() = None;
            *self.parent.get() = crate::task_id::INVALID_TASK_ID;
            (*self.permits.get()).clear();
            *self.io_request_slot.get() = None;
        }
        self.set_published(false);
        self.set_state(TaskState::Free);
    }
}

impl std::fmt::Debug for TaskSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSlot")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("work_count", &self.work_count())
            .finish()
    }
}
