// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task descriptors and the handles user code sees.
//!
//! A [`Task`] is shared by `Arc` between the ready queue it sits on, the
//! FEB or lock waiter list it is parked on, and any [`TaskHandle`] held
//! by user code. Its stack and execution context are attached when it is
//! activated and released by its shepherd once the body has returned.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::alloc::Stack;
use crate::context::ExecContext;
use crate::feb::{Aligned, FebGuard, Word};
use crate::lock::LockGuard;
use crate::shepherd;

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, never run. The context is bound on first dispatch.
    New = 0,
    /// Executing on its shepherd.
    Running = 1,
    /// Gave up the processor; goes to the back of its shepherd's queue.
    Yielded = 2,
    /// Parked on a waiter list, waiting for another task to wake it.
    Blocked = 3,
    /// Parked on a FEB waiter list with the entry lock still held.
    /// The shepherd releases the lock and moves the task to `Blocked`.
    FebBlocked = 4,
    /// Body returned; stack and context are about to be released.
    Terminated = 5,
    /// Resources released.
    Done = 6,
    /// Shutdown sentinel. Never a real task.
    TermShep = 255,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Running,
            2 => Self::Yielded,
            3 => Self::Blocked,
            4 => Self::FebBlocked,
            5 => Self::Terminated,
            6 => Self::Done,
            _ => Self::TermShep,
        }
    }
}

/// Type-erased task body.
pub(crate) type TaskBody = Box<dyn FnOnce(&TaskHandle) -> Aligned + Send + 'static>;

pub(crate) type TaskRef = Arc<Task>;

/// Entry lock a task holds while it switches out to park.
///
/// The shepherd drops it once the task's context is saved, so no waker
/// can resume a half-suspended task.
// Never read; held for its Drop.
#[allow(dead_code)]
pub(crate) enum Parked {
    Feb(FebGuard),
    Lock(LockGuard),
}

/// Stack, context and return address. Only touched by the thread that
/// runs the task, or by whoever owns the task while it is off every queue.
struct Exec {
    context: Option<ExecContext>,
    stack: Option<Stack>,
    home: *mut libc::ucontext_t,
}

const UNASSIGNED: usize = usize::MAX;

pub(crate) struct Task {
    id: u64,
    state: AtomicU8,
    shepherd: AtomicUsize,
    body: Mutex<Option<TaskBody>>,
    result_slot: Option<Arc<Word>>,
    future: AtomicBool,
    parked: Mutex<Option<Parked>>,
    /// Value handed over by a FEB release to a parked reader.
    delivered: AtomicU64,
    stack_low: AtomicUsize,
    stack_high: AtomicUsize,
    exec: UnsafeCell<Exec>,
}

// `exec` is only accessed by the shepherd running the task, and queue
// hand-offs order those accesses. Everything else is atomic or locked.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub fn new(id: u64, body: TaskBody, result_slot: Option<Arc<Word>>, future: bool) -> Self {
        Self {
            id,
            state: AtomicU8::new(TaskState::New as u8),
            shepherd: AtomicUsize::new(UNASSIGNED),
            body: Mutex::new(Some(body)),
            result_slot,
            future: AtomicBool::new(future),
            parked: Mutex::new(None),
            delivered: AtomicU64::new(0),
            stack_low: AtomicUsize::new(0),
            stack_high: AtomicUsize::new(0),
            exec: UnsafeCell::new(Exec {
                context: None,
                stack: None,
                home: ptr::null_mut(),
            }),
        }
    }

    /// Termination sentinel. Carries no body and is never executed.
    pub fn sentinel() -> Self {
        let task = Self::new(u64::MAX, Box::new(|_: &TaskHandle| 0), None, false);
        task.set_state(TaskState::TermShep);
        task
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn shepherd(&self) -> Option<usize> {
        match self.shepherd.load(Ordering::Acquire) {
            UNASSIGNED => None,
            index => Some(index),
        }
    }

    pub fn set_shepherd(&self, index: usize) {
        self.shepherd.store(index, Ordering::Release);
    }

    pub fn result_slot(&self) -> Option<&Arc<Word>> {
        self.result_slot.as_ref()
    }

    pub fn is_future(&self) -> bool {
        self.future.load(Ordering::Relaxed)
    }

    pub fn set_future(&self, future: bool) {
        self.future.store(future, Ordering::Relaxed);
    }

    pub fn take_body(&self) -> Option<TaskBody> {
        self.body.lock().unwrap().take()
    }

    pub fn is_attached(&self) -> bool {
        self.stack_high.load(Ordering::Acquire) != 0
    }

    /// Give the task its stack and context. Must happen before the first
    /// enqueue, while no other thread can reach the task.
    pub fn attach(&self, stack: Stack, context: ExecContext) {
        let (low, high) = stack.bounds();
        // SAFETY: the task is not yet on any queue.
        let exec = unsafe { &mut *self.exec.get() };
        exec.stack = Some(stack);
        exec.context = Some(context);
        self.stack_low.store(low, Ordering::Release);
        self.stack_high.store(high, Ordering::Release);
    }

    /// Take back stack and context after the body has returned.
    pub fn detach(&self) -> (Option<Stack>, Option<ExecContext>) {
        self.stack_low.store(0, Ordering::Release);
        self.stack_high.store(0, Ordering::Release);
        // SAFETY: called by the shepherd after the task switched out for good.
        let exec = unsafe { &mut *self.exec.get() };
        (exec.stack.take(), exec.context.take())
    }

    pub fn stack_bounds(&self) -> (usize, usize) {
        (
            self.stack_low.load(Ordering::Acquire),
            self.stack_high.load(Ordering::Acquire),
        )
    }

    /// Prepare the context for a switch from `home`. Binds the context to
    /// the stack on first run.
    ///
    /// # Safety
    /// Must be called by the shepherd that is about to run the task, and
    /// `home` must be that shepherd's scheduling context.
    pub(crate) unsafe fn enter(
        &self,
        home: *mut libc::ucontext_t,
        entry: extern "C" fn(),
    ) -> *mut libc::ucontext_t {
        let exec = &mut *self.exec.get();
        exec.home = home;
        let context = match exec.context.as_mut() {
            Some(context) => context,
            None => crate::error::fatal("task dispatched without a context"),
        };
        if self.state() == TaskState::New {
            match exec.stack.as_ref() {
                Some(stack) => context.bind(stack, entry),
                None => crate::error::fatal("task dispatched without a stack"),
            }
        }
        context.as_mut_ptr()
    }

    /// `(own context, shepherd context)` for switching out of the task.
    ///
    /// # Safety
    /// Only valid on the task's own stack while it is running.
    pub(crate) unsafe fn exit_pair(&self) -> (*mut libc::ucontext_t, *mut libc::ucontext_t) {
        let exec = &mut *self.exec.get();
        let own = match exec.context.as_mut() {
            Some(context) => context.as_mut_ptr(),
            None => crate::error::fatal("running task lost its context"),
        };
        (own, exec.home)
    }

    pub fn park(&self, parked: Parked) {
        *self.parked.lock().unwrap() = Some(parked);
    }

    pub fn take_parked(&self) -> Option<Parked> {
        self.parked.lock().unwrap().take()
    }

    pub fn deliver(&self, value: Aligned) {
        self.delivered.store(value, Ordering::Release);
    }

    pub fn take_delivered(&self) -> Aligned {
        self.delivered.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("shepherd", &self.shepherd())
            .field("future", &self.is_future())
            .finish()
    }
}

/// Reference to a task, passed to its body and returned by
/// [`Handle::current`](crate::Handle::current).
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) task: TaskRef,
}

impl TaskHandle {
    pub(crate) fn new(task: TaskRef) -> Self {
        Self { task }
    }

    /// Runtime-unique id. Ids increase in creation order.
    pub fn id(&self) -> u64 {
        self.task.id()
    }

    /// Shepherd the task is (or will be) queued on. `None` for a prepared
    /// task with no target yet.
    pub fn shepherd(&self) -> Option<usize> {
        self.task.shepherd()
    }

    /// Bytes left between the current stack pointer and the bottom of the
    /// task's stack. Zero unless called from the task itself.
    pub fn stack_remaining(&self) -> usize {
        let marker = 0u8;
        let sp = std::hint::black_box(&marker) as *const u8 as usize;
        let (low, high) = self.task.stack_bounds();
        if low <= sp && sp < high {
            sp - low
        } else {
            0
        }
    }

    /// Move to the back of the shepherd's ready queue and let the tasks
    /// ahead of it run. Does nothing unless called by the task itself.
    pub fn yield_now(&self) {
        if !shepherd::is_running(&self.task) {
            return;
        }
        self.task.set_state(TaskState::Yielded);
        tracing::trace!(task = self.task.id(), "yield");
        shepherd::switch_out(&self.task);
    }

    /// The word this task full-writes its return value into on completion.
    pub fn result_slot(&self) -> Option<&Arc<Word>> {
        self.task.result_slot()
    }

    pub fn is_future(&self) -> bool {
        self.task.is_future()
    }

    /// Tag or untag the task as a future. Only affects the bookkeeping
    /// hook if set before the task first runs.
    pub fn set_future(&self, future: bool) {
        self.task.set_future(future);
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskHandle").field(&self.task).finish()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.task, &other.task)
    }
}

impl Eq for TaskHandle {}

/// A task built by [`Handle::prepare`](crate::Handle::prepare) and not yet
/// scheduled. It owns no stack or context until it is.
///
/// Dropping it discards the task without running it.
#[must_use = "a prepared task does nothing until it is scheduled"]
pub struct PreparedTask {
    pub(crate) task: TaskRef,
}

impl PreparedTask {
    pub fn id(&self) -> u64 {
        self.task.id()
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle::new(self.task.clone())
    }
}

impl fmt::Debug for PreparedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PreparedTask").field(&self.task).finish()
    }
}
