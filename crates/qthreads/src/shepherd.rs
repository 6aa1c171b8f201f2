// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shepherd worker loop and the task entry trampoline.
//!
//! Each shepherd is one OS thread that pulls tasks off its own ready
//! queue, switches into them, and on return decides what happens next
//! from the state the task left itself in. Tasks never migrate: a woken
//! task goes back to the queue of the shepherd it was assigned to.

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::alloc::Pool;
use crate::context::{self, ExecContext};
use crate::error::fatal;
use crate::queue::ReadyQueue;
use crate::runtime::Shared;
use crate::task::{Parked, TaskHandle, TaskRef, TaskState};

pub(crate) struct Shepherd {
    pub index: usize,
    pub ready: ReadyQueue<TaskRef>,
    /// Round-robin cursor for forks made by tasks running here. Only this
    /// shepherd's thread touches it.
    cursor: AtomicUsize,
    pub thread: Mutex<Option<JoinHandle<()>>>,
}

impl Shepherd {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ready: ReadyQueue::new(),
            cursor: AtomicUsize::new(0),
            thread: Mutex::new(None),
        }
    }

    /// Next fork target out of `n` shepherds.
    pub fn next_target(&self, n: usize) -> usize {
        let target = self.cursor.load(Ordering::Relaxed) % n;
        self.cursor.store((target + 1) % n, Ordering::Relaxed);
        target
    }
}

/// Per-thread scheduling state. Lives on the shepherd's own stack for the
/// duration of [`run`].
struct WorkerLocal {
    shared: Arc<Shared>,
    index: usize,
    current: RefCell<Option<TaskRef>>,
    home: UnsafeCell<ExecContext>,
}

thread_local! {
    static WORKER: Cell<*const WorkerLocal> = const { Cell::new(ptr::null()) };
}

fn with_worker<R>(f: impl FnOnce(&WorkerLocal) -> R) -> Option<R> {
    let worker = WORKER.with(|w| w.get());
    if worker.is_null() {
        return None;
    }
    // SAFETY: set by `run` for exactly the lifetime of its WorkerLocal.
    Some(f(unsafe { &*worker }))
}

/// Task running on the calling thread, if the thread is one of `shared`'s
/// shepherds.
pub(crate) fn current_task(shared: &Arc<Shared>) -> Option<TaskRef> {
    with_worker(|w| {
        if Arc::ptr_eq(&w.shared, shared) {
            w.current.borrow().clone()
        } else {
            None
        }
    })
    .flatten()
}

/// Index of the calling thread if it is one of `shared`'s shepherds.
pub(crate) fn current_shepherd(shared: &Arc<Shared>) -> Option<usize> {
    with_worker(|w| Arc::ptr_eq(&w.shared, shared).then_some(w.index)).flatten()
}

/// Allocation pool for the calling thread.
pub(crate) fn current_pool(shared: &Arc<Shared>) -> Pool {
    match current_shepherd(shared) {
        Some(index) => Pool::Shepherd(index),
        None => Pool::Shared,
    }
}

/// True if `task` is the one executing on this thread.
pub(crate) fn is_running(task: &TaskRef) -> bool {
    with_worker(|w| {
        w.current
            .borrow()
            .as_ref()
            .is_some_and(|cur| Arc::ptr_eq(cur, task))
    })
    .unwrap_or(false)
}

/// Shepherd thread body.
pub(crate) fn run(shared: Arc<Shared>, index: usize) {
    let worker = WorkerLocal {
        shared: shared.clone(),
        index,
        current: RefCell::new(None),
        home: UnsafeCell::new(ExecContext::new()),
    };
    WORKER.with(|w| w.set(&worker));
    tracing::debug!(shepherd = index, "shepherd started");

    let me = &shared.shepherds[index];
    loop {
        let task = me.ready.dequeue();
        if task.state() == TaskState::TermShep {
            if me.ready.is_empty() {
                break;
            }
            // Tasks still queued behind the sentinel run first.
            me.ready.enqueue(task);
            continue;
        }

        *worker.current.borrow_mut() = Some(task.clone());
        exec(&worker, &task);
        worker.current.borrow_mut().take();
        dispatch(&worker, task);
    }

    WORKER.with(|w| w.set(ptr::null()));
    tracing::debug!(shepherd = index, "shepherd exiting");
}

fn exec(worker: &WorkerLocal, task: &TaskRef) {
    tracing::trace!(shepherd = worker.index, task = task.id(), state = ?task.state(), "exec");
    let home = worker.home.get();
    // SAFETY: `home` is this thread's scheduling context and the task is
    // dispatched on no other thread.
    unsafe {
        let home = (*home).as_mut_ptr();
        let target = task.enter(home, trampoline);
        task.set_state(TaskState::Running);
        context::switch(home, target);
    }
}

fn dispatch(worker: &WorkerLocal, task: TaskRef) {
    match task.state() {
        TaskState::Yielded => {
            tracing::trace!(shepherd = worker.index, task = task.id(), "requeue yielded");
            worker.shared.shepherds[worker.index].ready.enqueue(task);
        }
        TaskState::FebBlocked => {
            // Wakers are held off by the entry lock until the task reads
            // as Blocked and its context is saved.
            let parked = task.take_parked();
            task.set_state(TaskState::Blocked);
            tracing::trace!(shepherd = worker.index, task = task.id(), "parked on FEB");
            drop(parked);
        }
        TaskState::Blocked => {
            let parked = task.take_parked();
            tracing::trace!(shepherd = worker.index, task = task.id(), "parked on lock");
            drop(parked);
        }
        TaskState::Terminated => {
            let pool = Pool::Shepherd(worker.index);
            let (stack, context) = task.detach();
            if let Some(stack) = stack {
                worker.shared.allocator.free_stack(pool, stack);
            }
            if let Some(context) = context {
                worker.shared.allocator.free_context(pool, context);
            }
            task.set_state(TaskState::Done);
            tracing::trace!(shepherd = worker.index, task = task.id(), "task done");
            worker.shared.task_finished();
        }
        state => fatal(&format!("task {} returned to shepherd in state {:?}", task.id(), state)),
    }
}

/// Save the running task and resume its shepherd. Returns when the task
/// is dispatched again.
pub(crate) fn switch_out(task: &TaskRef) {
    // SAFETY: only reached from code running on `task`'s own stack.
    unsafe {
        let (own, home) = task.exit_pair();
        context::switch(own, home);
    }
}

/// Park the running task on a waiter list. `parked` is the entry lock
/// guarding that list; it stays held until the shepherd has the task's
/// context saved.
pub(crate) fn park(task: &TaskRef, state: TaskState, parked: Parked) {
    task.park(parked);
    task.set_state(state);
    switch_out(task);
}

extern "C" fn trampoline() {
    let task = match with_worker(|w| (w.shared.clone(), w.current.borrow().clone())) {
        Some((shared, Some(task))) => {
            execute(&shared, &task);
            task
        }
        _ => fatal("trampoline entered outside a shepherd"),
    };

    // Nothing owned may stay on this stack past the final switch.
    let raw: *const crate::task::Task = Arc::as_ptr(&task);
    drop(task);
    // SAFETY: the shepherd's `current` slot keeps the task alive until
    // this switch lands, and the context is never resumed afterwards.
    unsafe {
        let (own, home) = (*raw).exit_pair();
        context::switch(own, home);
    }
    fatal("terminated task resumed");
}

fn execute(shared: &Arc<Shared>, task: &TaskRef) {
    let handle = TaskHandle::new(task.clone());
    if task.is_future() {
        match shared.future_bookkeeping.as_ref() {
            Some(bookkeeping) => bookkeeping.task_started(&handle),
            None => fatal("future task started without a bookkeeping collaborator"),
        }
    }

    let value = match task.take_body() {
        Some(body) => match panic::catch_unwind(AssertUnwindSafe(|| body(&handle))) {
            Ok(value) => value,
            Err(payload) => fatal(&format!(
                "task {} panicked: {}",
                task.id(),
                panic_message(&*payload)
            )),
        },
        None => fatal("task body already consumed"),
    };

    if let Some(slot) = task.result_slot() {
        shared.feb.write_full(shared, slot, value);
    }
    task.set_state(TaskState::Terminated);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_wraps() {
        let shep = Shepherd::new(0);
        let picks: Vec<_> = (0..7).map(|_| shep.next_target(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn panic_message_extracts_strings() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }

    #[test]
    fn no_worker_outside_shepherds() {
        assert!(with_worker(|w| w.index).is_none());
    }
}
