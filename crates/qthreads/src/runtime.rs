// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime state and the public entry points.
//!
//! [`Runtime`] owns the shepherd threads; [`Handle`] is the cloneable
//! reference tasks capture to fork, synchronize and lock. Operations that
//! may block a task are bridged when called from an ordinary thread: a
//! proxy task performs them and the calling thread waits for it.

use std::fmt;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::alloc::TaskAllocator;
use crate::config::RuntimeConfig;
use crate::error::{fatal, LockStatus, RuntimeError, UnlockStatus};
use crate::feb::{Aligned, FebStatus, FebTable, Word};
use crate::future::FutureBookkeeping;
use crate::lock::LockTable;
use crate::shepherd::{self, Shepherd};
use crate::task::{PreparedTask, Task, TaskBody, TaskHandle, TaskRef};

/// State shared by every shepherd and every handle.
pub(crate) struct Shared {
    pub shepherds: Vec<Shepherd>,
    pub feb: FebTable,
    pub locks: LockTable,
    next_id: AtomicU64,
    /// Round-robin cursor for forks from outside the runtime.
    cursor: Mutex<usize>,
    pub allocator: Arc<dyn TaskAllocator>,
    pub stack_size: usize,
    pub future_bookkeeping: Option<Arc<dyn FutureBookkeeping>>,
    /// Activated tasks that have not terminated, parked ones included.
    active_tasks: AtomicUsize,
    all_done: (Mutex<()>, Condvar),
}

impl Shared {
    /// Put a woken task back on its shepherd's queue.
    pub fn reschedule(&self, task: TaskRef) {
        match task.shepherd() {
            Some(index) => self.shepherds[index].ready.enqueue(task),
            None => fatal("woke a task with no shepherd"),
        }
    }

    /// Called by a shepherd once a task's resources are released.
    pub fn task_finished(&self) {
        if self.active_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            let (lock, cvar) = &self.all_done;
            let _held = lock.lock().unwrap();
            cvar.notify_all();
        }
    }

    /// Block until no activated task is left, wherever it is parked.
    fn wait_idle(&self) {
        let (lock, cvar) = &self.all_done;
        let mut held = lock.lock().unwrap();
        while self.active_tasks.load(Ordering::Acquire) > 0 {
            held = cvar.wait(held).unwrap();
        }
    }

    fn new_task(&self, body: TaskBody, slot: Option<Arc<Word>>, future: bool) -> TaskRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Task::new(id, body, slot, future))
    }

    fn claim_slot(&self, task: &TaskRef) {
        if let Some(slot) = task.result_slot() {
            self.feb.empty(self, std::slice::from_ref(&**slot));
        }
    }
}

/// Pick the next round-robin target for a fork made from the calling
/// thread.
fn next_target(shared: &Arc<Shared>) -> usize {
    let n = shared.shepherds.len();
    match shepherd::current_shepherd(shared) {
        Some(index) => shared.shepherds[index].next_target(n),
        None => {
            let mut cursor = shared.cursor.lock().unwrap();
            let target = *cursor;
            *cursor = (target + 1) % n;
            target
        }
    }
}

/// Attach a stack and context to `task` and queue it on `target`.
fn activate(shared: &Arc<Shared>, task: TaskRef, target: usize) {
    debug_assert!(!task.is_attached(), "task {} activated twice", task.id());
    let pool = shepherd::current_pool(shared);
    let Some(stack) = shared.allocator.alloc_stack(pool, shared.stack_size) else {
        fatal("out of memory allocating a task stack");
    };
    let Some(context) = shared.allocator.alloc_context(pool) else {
        fatal("out of memory allocating a task context");
    };
    task.attach(stack, context);
    task.set_shepherd(target);
    shared.active_tasks.fetch_add(1, Ordering::AcqRel);
    tracing::trace!(task = task.id(), shepherd = target, "fork");
    shared.shepherds[target].ready.enqueue(task);
}

/// One-shot hand-off from a proxy task to the thread that forked it.
struct Completion<R> {
    value: Mutex<Option<R>>,
    ready: Condvar,
}

impl<R> Completion<R> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, value: R) {
        *self.value.lock().unwrap() = Some(value);
        self.ready.notify_one();
    }

    fn wait(&self) -> R {
        let mut value = self.value.lock().unwrap();
        loop {
            if let Some(v) = value.take() {
                return v;
            }
            value = self.ready.wait(value).unwrap();
        }
    }
}

fn address<T: ?Sized>(target: &T) -> usize {
    target as *const T as *const u8 as usize
}

/// Cloneable reference to a running runtime.
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

impl Handle {
    fn in_task(&self) -> Option<TaskRef> {
        shepherd::current_task(&self.shared)
    }

    /// Run `op` on a task: the current one if there is one, otherwise a
    /// proxy task while this thread waits for it.
    fn on_task<'a, R, F>(&self, op: F) -> R
    where
        F: FnOnce(&TaskRef) -> R + Send + 'a,
        R: Send + 'a,
    {
        if let Some(task) = self.in_task() {
            return op(&task);
        }
        let done = Arc::new(Completion::new());
        let signal = done.clone();
        let body: Box<dyn FnOnce(&TaskHandle) -> Aligned + Send + 'a> = Box::new(move |me: &TaskHandle| {
            signal.complete(op(&me.task));
            0
        });
        // SAFETY: this thread does not return until the proxy has consumed
        // `op` and signalled, so nothing borrowed by `op` dies early.
        let body: TaskBody = unsafe { mem::transmute(body) };
        let proxy = self.shared.new_task(body, None, false);
        activate(&self.shared, proxy, next_target(&self.shared));
        done.wait()
    }

    /// The task calling this, if it is one of this runtime's.
    pub fn current(&self) -> Option<TaskHandle> {
        self.in_task().map(TaskHandle::new)
    }

    /// Shepherd index of the calling thread.
    pub fn current_shepherd(&self) -> Option<usize> {
        shepherd::current_shepherd(&self.shared)
    }

    pub fn shepherd_count(&self) -> usize {
        self.shared.shepherds.len()
    }

    /// Fork `f` onto the next shepherd in round-robin order.
    pub fn fork<F>(&self, f: F)
    where
        F: FnOnce(&TaskHandle) -> Aligned + Send + 'static,
    {
        self.fork_with(f, None);
    }

    /// Fork `f`, full-writing its return value into `slot` on completion.
    /// The slot is marked empty before the task is queued.
    pub fn fork_with<F>(&self, f: F, slot: Option<Arc<Word>>)
    where
        F: FnOnce(&TaskHandle) -> Aligned + Send + 'static,
    {
        let task = self.shared.new_task(Box::new(f), slot, false);
        self.shared.claim_slot(&task);
        activate(&self.shared, task, next_target(&self.shared));
    }

    /// Fork onto a specific shepherd. `false`, with nothing forked, if
    /// `shepherd` is out of range.
    pub fn fork_to<F>(&self, f: F, slot: Option<Arc<Word>>, shepherd: usize) -> bool
    where
        F: FnOnce(&TaskHandle) -> Aligned + Send + 'static,
    {
        self.fork_targeted(Box::new(f), slot, shepherd, false)
    }

    /// Like [`fork_to`](Self::fork_to), tagging the task as a future.
    pub fn fork_future_to<F>(&self, f: F, slot: Option<Arc<Word>>, shepherd: usize) -> bool
    where
        F: FnOnce(&TaskHandle) -> Aligned + Send + 'static,
    {
        self.fork_targeted(Box::new(f), slot, shepherd, true)
    }

    fn fork_targeted(
        &self,
        body: TaskBody,
        slot: Option<Arc<Word>>,
        shepherd: usize,
        future: bool,
    ) -> bool {
        if shepherd >= self.shared.shepherds.len() {
            return false;
        }
        let task = self.shared.new_task(body, slot, future);
        self.shared.claim_slot(&task);
        activate(&self.shared, task, shepherd);
        true
    }

    /// Build a task without giving it a stack or queueing it.
    pub fn prepare<F>(&self, f: F, slot: Option<Arc<Word>>) -> PreparedTask
    where
        F: FnOnce(&TaskHandle) -> Aligned + Send + 'static,
    {
        let task = self.shared.new_task(Box::new(f), slot, false);
        self.shared.claim_slot(&task);
        PreparedTask { task }
    }

    /// Build a task bound for `shepherd`. `None` if out of range.
    pub fn prepare_for<F>(&self, f: F, slot: Option<Arc<Word>>, shepherd: usize) -> Option<PreparedTask>
    where
        F: FnOnce(&TaskHandle) -> Aligned + Send + 'static,
    {
        if shepherd >= self.shared.shepherds.len() {
            return None;
        }
        let prepared = self.prepare(f, slot);
        prepared.task.set_shepherd(shepherd);
        Some(prepared)
    }

    /// Activate a prepared task on the shepherd it was prepared for, or on
    /// the next round-robin target.
    pub fn schedule(&self, prepared: PreparedTask) {
        let target = prepared
            .task
            .shepherd()
            .unwrap_or_else(|| next_target(&self.shared));
        activate(&self.shared, prepared.task, target);
    }

    /// Activate a prepared task on `shepherd`, handing it back if the
    /// index is out of range.
    pub fn schedule_on(&self, prepared: PreparedTask, shepherd: usize) -> Result<(), PreparedTask> {
        if shepherd >= self.shared.shepherds.len() {
            return Err(prepared);
        }
        activate(&self.shared, prepared.task, shepherd);
        Ok(())
    }

    /// Mark every word empty.
    pub fn empty(&self, words: &[Word]) {
        self.shared.feb.empty(&self.shared, words);
    }

    /// Mark every word full, waking whoever waits on it.
    pub fn fill(&self, words: &[Word]) {
        self.shared.feb.fill(&self.shared, words);
    }

    /// Store `value` and mark the word full, whatever its current state.
    pub fn write_full(&self, word: &Word, value: Aligned) {
        self.shared.feb.write_full(&self.shared, word, value);
    }

    /// Wait until the word is empty, then store `value` and mark it full.
    pub fn write_empty_full(&self, word: &Word, value: Aligned) {
        let shared = &self.shared;
        self.on_task(|task| shared.feb.write_empty_full(shared, task, word, value));
    }

    /// Wait until the word is full and read it, leaving it full.
    pub fn read_full_full(&self, word: &Word) -> Aligned {
        let shared = &self.shared;
        self.on_task(|task| shared.feb.read_full_full(task, word))
    }

    /// Wait until the word is full, read it and mark it empty.
    pub fn read_full_empty(&self, word: &Word) -> Aligned {
        let shared = &self.shared;
        self.on_task(|task| shared.feb.read_full_empty(shared, task, word))
    }

    pub fn status(&self, word: &Word) -> FebStatus {
        self.shared.feb.status(word)
    }

    /// Lock the address of `target`, waiting behind the current holder.
    ///
    /// From outside any task a proxy takes the lock on the caller's
    /// behalf and the result is [`LockStatus::Deferred`].
    pub fn lock<T: ?Sized>(&self, target: &T) -> LockStatus {
        let addr = address(target);
        if let Some(task) = self.in_task() {
            self.shared.locks.lock(&task, addr);
            return LockStatus::Acquired;
        }
        let shared = &self.shared;
        self.on_task(|task| shared.locks.lock(task, addr));
        LockStatus::Deferred
    }

    /// Unlock the address of `target`, handing it to the next waiter.
    pub fn unlock<T: ?Sized>(&self, target: &T) -> UnlockStatus {
        self.shared.locks.unlock(&self.shared, address(target))
    }

    pub fn is_locked<T: ?Sized>(&self, target: &T) -> bool {
        self.shared.locks.is_locked(address(target))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("shepherds", &self.shared.shepherds.len())
            .field("stack_size", &self.shared.stack_size)
            .finish()
    }
}

/// A started runtime. Dereferences to its [`Handle`].
///
/// Dropping it finalizes. Finalizing from inside one of its own tasks
/// deadlocks, as does finalizing while a task waits on a word or lock
/// nobody will release.
pub struct Runtime {
    handle: Handle,
    finalized: bool,
}

impl Runtime {
    /// Start the shepherds described by `config`.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let (count, stack_size) = config.resolve()?;
        let shared = Arc::new(Shared {
            shepherds: (0..count).map(Shepherd::new).collect(),
            feb: FebTable::new(),
            locks: LockTable::new(),
            next_id: AtomicU64::new(1),
            cursor: Mutex::new(0),
            allocator: config.build_allocator(count),
            stack_size,
            future_bookkeeping: config.future_bookkeeping.clone(),
            active_tasks: AtomicUsize::new(0),
            all_done: (Mutex::new(()), Condvar::new()),
        });
        // Built first so a failed spawn shuts down the ones already running.
        let runtime = Self {
            handle: Handle { shared },
            finalized: false,
        };

        for index in 0..count {
            let shared = runtime.handle.shared.clone();
            let thread = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, index))
                .spawn(move || shepherd::run(shared, index))
                .map_err(|source| RuntimeError::SpawnShepherd { index, source })?;
            *runtime.handle.shared.shepherds[index].thread.lock().unwrap() = Some(thread);
        }

        tracing::info!(shepherds = count, stack_size, "runtime started");
        Ok(runtime)
    }

    /// Start `n` shepherds with default settings.
    pub fn with_shepherds(n: usize) -> Result<Self, RuntimeError> {
        Self::new(RuntimeConfig::default().shepherds(n))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Wait for every task to terminate, then stop the shepherds and join
    /// them. A task parked on a word or lock counts until it finishes.
    pub fn finalize(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        // A parked task may be woken onto any shepherd's queue, so no
        // shepherd can stop while one is outstanding.
        self.handle.shared.wait_idle();
        let shepherds = &self.handle.shared.shepherds;
        for shepherd in shepherds {
            tracing::debug!(shepherd = shepherd.index, queued = shepherd.ready.len(), "stopping shepherd");
            shepherd.ready.enqueue(Arc::new(Task::sentinel()));
        }
        for shepherd in shepherds {
            let thread = shepherd.thread.lock().unwrap().take();
            if let Some(thread) = thread {
                if thread.join().is_err() {
                    tracing::warn!(shepherd = shepherd.index, "shepherd thread panicked");
                }
            }
        }
        tracing::info!(shepherds = shepherds.len(), "runtime finalized");
    }
}

impl Deref for Runtime {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("handle", &self.handle)
            .field("finalized", &self.finalized)
            .finish()
    }
}
