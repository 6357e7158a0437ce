//! OS worker-thread pool with an explicit wake/signal protocol.
//!
//! A fixed set of named `thread::Builder` threads, each blocking on its own
//! channel until woken with a [`WakeReason`], running a caller-supplied
//! `main` callback, then going back to waiting. Teardown signals every
//! thread and joins them all. The scheduler crate binds one [`WorkerPool`]
//! worker to each `EXECUTE | WORKER` task pool.

use crossbeam_channel::{Receiver, Sender};
use oslayer_arena::LinearArena;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Default per-worker OS thread stack size (1 MiB).
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("invalid configuration: {0}")]
    InvalidArg(&'static str),
    #[error("worker {index} failed to initialize")]
    InitFailed { index: usize },
}

/// Why a worker thread was woken from its parked wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The pool is shutting down; the worker should clean up and return.
    Exit,
    /// A generic "go check your state" wakeup. The payload is always 0.
    Signal,
    /// An explicit wakeup carrying a caller-defined non-zero payload.
    Explicit(u64),
    /// The worker's `init` callback reported failure; `main` is invoked once
    /// more with this reason so the callback can log/clean up before the
    /// thread unwinds.
    Error,
}

/// Per-thread handle passed to the `init` and `main` callbacks.
///
/// Exposes the fields the original `OS_WORKER_THREAD` carries: the worker's
/// index within the pool, its OS thread id, a private scratch arena, and the
/// opaque pool context shared by every worker.
pub struct WorkerHandle<C> {
    pub index: usize,
    pub thread_id: thread::ThreadId,
    pub pool_context: Arc<C>,
    /// Private per-worker scratch arena, sized by `arena_size` at creation.
    /// `!Send`/`!Sync` by construction, so it is wrapped in a `RefCell`
    /// rather than requiring external synchronization — only this worker's
    /// own thread ever touches it.
    pub arena: RefCell<LinearArena>,
}

struct ThreadSlot {
    sender: Sender<WakeReason>,
    join_handle: Option<JoinHandle<()>>,
}

/// Configuration for [`WorkerPool::create`].
pub struct WorkerPoolInit<C, Init, Main>
where
    C: Send + Sync + 'static,
    Init: Fn(&WorkerHandle<C>) -> Result<(), WorkerPoolError> + Send + Sync + 'static,
    Main: Fn(&WorkerHandle<C>, WakeReason) + Send + Sync + 'static,
{
    pub thread_count: usize,
    pub stack_size: usize,
    pub arena_size: usize,
    pub numa_group: u32,
    pub pool_context: C,
    pub init: Init,
    pub main: Main,
}

/// A fixed pool of OS worker threads, each woken by an explicit signal.
pub struct WorkerPool {
    threads: Vec<ThreadSlot>,
    shutdown: Arc<AtomicBool>,
    launched: AtomicBool,
}

impl WorkerPool {
    /// Spawn `init.thread_count` worker threads.
    ///
    /// Threads are spawned one at a time; each must complete its `init`
    /// callback successfully before the next is spawned. If a worker's
    /// `init` fails, every already-spawned worker is signaled
    /// [`WakeReason::Exit`] and joined before this returns
    /// [`WorkerPoolError::InitFailed`]: an aborted pool never leaves threads
    /// running or unjoined.
    ///
    /// Workers begin life blocked on their wake channel: there is no
    /// separate "suspended, not yet waiting" state to model in a
    /// channel-based design, since nothing can be signaled to them before
    /// the caller holds a handle back from this function anyway. `launch`
    /// therefore only flips a diagnostic flag; the actual suspension is the
    /// blocking `recv`.
    pub fn create<C, Init, Main>(
        init: WorkerPoolInit<C, Init, Main>,
    ) -> Result<Self, WorkerPoolError>
    where
        C: Send + Sync + 'static,
        Init: Fn(&WorkerHandle<C>) -> Result<(), WorkerPoolError> + Send + Sync + 'static,
        Main: Fn(&WorkerHandle<C>, WakeReason) + Send + Sync + 'static,
    {
        if init.thread_count == 0 {
            return Err(WorkerPoolError::InvalidArg("thread_count must be >= 1"));
        }
        let stack_size = if init.stack_size > 0 {
            init.stack_size
        } else {
            DEFAULT_STACK_SIZE
        };
        let arena_size = init.arena_size.max(4096);

        let pool_context = Arc::new(init.pool_context);
        let init_fn = Arc::new(init.init);
        let main_fn = Arc::new(init.main);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::with_capacity(init.thread_count);
        for index in 0..init.thread_count {
            let (tx, rx) = crossbeam_channel::unbounded::<WakeReason>();
            let (init_tx, init_rx) = crossbeam_channel::bounded::<Result<(), WorkerPoolError>>(1);
            let pool_context = Arc::clone(&pool_context);
            let init_fn = Arc::clone(&init_fn);
            let main_fn = Arc::clone(&main_fn);

            let spawn_result = thread::Builder::new()
                .name(format!("oslayer-worker-{index}"))
                .stack_size(stack_size)
                .spawn(move || worker_loop(index, pool_context, arena_size, init_fn, main_fn, rx, init_tx));

            let join_handle = match spawn_result {
                Ok(jh) => jh,
                Err(_) => {
                    shutdown_and_join(&mut threads);
                    return Err(WorkerPoolError::InitFailed { index });
                }
            };

            match init_rx.recv() {
                Ok(Ok(())) => {
                    threads.push(ThreadSlot {
                        sender: tx,
                        join_handle: Some(join_handle),
                    });
                }
                _ => {
                    // The failing worker already returned on its own after
                    // reporting failure; it needs no Exit signal. Everyone
                    // spawned before it does.
                    let _ = join_handle.join();
                    shutdown_and_join(&mut threads);
                    return Err(WorkerPoolError::InitFailed { index });
                }
            }
        }

        Ok(Self {
            threads,
            shutdown,
            launched: AtomicBool::new(false),
        })
    }

    /// Number of worker threads in the pool.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Mark the pool as launched. Workers are already blocked waiting for a
    /// signal by the time `create` returns; this only records intent for
    /// diagnostics and debug assertions in callers that gate `signal_workers`
    /// on it.
    pub fn launch(&self) {
        self.launched.store(true, Ordering::Release);
    }

    /// Whether [`launch`](Self::launch) has been called.
    pub fn is_launched(&self) -> bool {
        self.launched.load(Ordering::Acquire)
    }

    /// Wake up to `n` workers with `signal`.
    ///
    /// `signal == 0` wakes workers with [`WakeReason::Signal`] (a generic
    /// "check your state" nudge); a non-zero `signal` wakes them with
    /// [`WakeReason::Explicit`] carrying that payload. Which `n` workers are
    /// chosen is unspecified.
    pub fn signal_workers(&self, signal: u64, n: usize) {
        let reason = if signal == 0 {
            WakeReason::Signal
        } else {
            WakeReason::Explicit(signal)
        };
        for slot in self.threads.iter().take(n) {
            let _ = slot.sender.send(reason);
        }
    }

    /// Wake every worker with the same reason.
    pub fn signal_all(&self, signal: u64) {
        self.signal_workers(signal, self.threads.len());
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Broadcast [`WakeReason::Exit`] to every worker and join all threads.
    ///
    /// Idempotent: calling `destroy` twice is a no-op the second time.
    pub fn destroy(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.threads {
            let _ = slot.sender.send(WakeReason::Exit);
        }
        for slot in &mut self.threads {
            if let Some(jh) = slot.join_handle.take() {
                let _ = jh.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            self.destroy();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("thread_count", &self.thread_count())
            .field("launched", &self.is_launched())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn shutdown_and_join(threads: &mut Vec<ThreadSlot>) {
    for slot in threads.iter() {
        let _ = slot.sender.send(WakeReason::Exit);
    }
    for slot in threads.iter_mut() {
        if let Some(jh) = slot.join_handle.take() {
            let _ = jh.join();
        }
    }
    threads.clear();
}

#[allow(clippy::too_many_arguments)]
fn worker_loop<C, Init, Main>(
    index: usize,
    pool_context: Arc<C>,
    arena_size: usize,
    init_fn: Arc<Init>,
    main_fn: Arc<Main>,
    rx: Receiver<WakeReason>,
    init_tx: Sender<Result<(), WorkerPoolError>>,
) where
    C: Send + Sync + 'static,
    Init: Fn(&WorkerHandle<C>) -> Result<(), WorkerPoolError> + Send + Sync + 'static,
    Main: Fn(&WorkerHandle<C>, WakeReason) + Send + Sync + 'static,
{
    let arena = LinearArena::create(arena_size, true, true)
        .expect("worker arena size must be nonzero");
    let worker = WorkerHandle {
        index,
        thread_id: thread::current().id(),
        pool_context,
        arena: RefCell::new(arena),
    };

    match init_fn(&worker) {
        Ok(()) => {
            let _ = init_tx.send(Ok(()));
        }
        Err(e) => {
            main_fn(&worker, WakeReason::Error);
            let _ = init_tx.send(Err(e));
            return;
        }
    }
    drop(init_tx);

    loop {
        match rx.recv() {
            Ok(WakeReason::Exit) => {
                main_fn(&worker, WakeReason::Exit);
                return;
            }
            Ok(reason) => main_fn(&worker, reason),
            Err(_) => return, // every sender dropped: pool is gone
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_for<F: Fn() -> bool>(pred: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !pred() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn spawns_requested_thread_count() {
        let pool = WorkerPool::create(WorkerPoolInit {
            thread_count: 3,
            stack_size: 0,
            arena_size: 4096,
            numa_group: 0,
            pool_context: (),
            init: |_w| Ok(()),
            main: |_w, _r| {},
        })
        .unwrap();
        assert_eq!(pool.thread_count(), 3);
    }

    #[test]
    fn zero_threads_is_invalid_arg() {
        let result = WorkerPool::create(WorkerPoolInit {
            thread_count: 0,
            stack_size: 0,
            arena_size: 4096,
            numa_group: 0,
            pool_context: (),
            init: |_w| Ok(()),
            main: |_w, _r| {},
        });
        assert!(matches!(result, Err(WorkerPoolError::InvalidArg(_))));
    }

    #[test]
    fn signal_workers_invokes_main_with_explicit_payload() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_main = Arc::clone(&seen);
        let pool = WorkerPool::create(WorkerPoolInit {
            thread_count: 1,
            stack_size: 0,
            arena_size: 4096,
            numa_group: 0,
            pool_context: (),
            init: |_w| Ok(()),
            main: move |_w, reason| {
                if let WakeReason::Explicit(payload) = reason {
                    seen_in_main.store(payload as usize, Ordering::SeqCst);
                }
            },
        })
        .unwrap();
        pool.launch();
        pool.signal_workers(42, 1);
        assert!(wait_for(|| seen.load(Ordering::SeqCst) == 42, Duration::from_secs(2)));
    }

    #[test]
    fn destroy_joins_all_threads_and_is_idempotent() {
        let mut pool = WorkerPool::create(WorkerPoolInit {
            thread_count: 4,
            stack_size: 0,
            arena_size: 4096,
            numa_group: 0,
            pool_context: (),
            init: |_w| Ok(()),
            main: |_w, _r| {},
        })
        .unwrap();
        pool.launch();
        pool.destroy();
        assert!(pool.is_shutdown());
        pool.destroy();
        assert!(pool.is_shutdown());
    }

    #[test]
    fn init_failure_aborts_and_signals_already_spawned_workers() {
        let failures_at = 2usize;
        let exited = Arc::new(AtomicUsize::new(0));
        let exited_in_main = Arc::clone(&exited);
        let result = WorkerPool::create(WorkerPoolInit {
            thread_count: 5,
            stack_size: 0,
            arena_size: 4096,
            numa_group: 0,
            pool_context: (),
            init: move |w| {
                if w.index == failures_at {
                    Err(WorkerPoolError::InitFailed { index: w.index })
                } else {
                    Ok(())
                }
            },
            main: move |_w, reason| {
                if reason == WakeReason::Exit {
                    exited_in_main.fetch_add(1, Ordering::SeqCst);
                }
            },
        });
        assert!(matches!(
            result,
            Err(WorkerPoolError::InitFailed { index }) if index == failures_at
        ));
        // Workers 0 and 1 were spawned successfully before worker 2 failed,
        // and must have been signaled Exit.
        assert!(wait_for(|| exited.load(Ordering::SeqCst) == failures_at, Duration::from_secs(2)));
    }

    #[test]
    fn worker_handle_exposes_scratch_arena() {
        let allocated = Arc::new(AtomicUsize::new(0));
        let allocated_in_main = Arc::clone(&allocated);
        let pool = WorkerPool::create(WorkerPoolInit {
            thread_count: 1,
            stack_size: 0,
            arena_size: 4096,
            numa_group: 0,
            pool_context: (),
            init: |_w| Ok(()),
            main: move |w, _reason| {
                let mut arena = w.arena.borrow_mut();
                let _ = arena.allocate(64, 8);
                allocated_in_main.store(arena.used(), Ordering::SeqCst);
            },
        })
        .unwrap();
        pool.launch();
        pool.signal_workers(1, 1);
        assert!(wait_for(|| allocated.load(Ordering::SeqCst) == 64, Duration::from_secs(2)));
    }
}
