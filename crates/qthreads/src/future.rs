// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Hook for future-task accounting.
//!
//! Tasks forked with [`Handle::fork_future_to`](crate::Handle::fork_future_to)
//! are tagged as futures. The runtime does no accounting of its own; it
//! calls the collaborator installed through
//! [`RuntimeConfig::future_bookkeeping`](crate::RuntimeConfig::future_bookkeeping)
//! from the task's own stack, before its body runs.

use crate::task::TaskHandle;

/// Per-location bookkeeping for future tasks.
pub trait FutureBookkeeping: Send + Sync {
    /// Called on `task`'s shepherd right before the body starts.
    fn task_started(&self, task: &TaskHandle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Runtime, RuntimeConfig, Word};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct PerShepherd {
        started: [AtomicUsize; 2],
        /// Calls for untagged tasks or with no shepherd assigned.
        misfired: AtomicUsize,
    }

    impl FutureBookkeeping for PerShepherd {
        fn task_started(&self, task: &TaskHandle) {
            match task.shepherd() {
                Some(shep) if task.is_future() && shep < 2 => {
                    self.started[shep].fetch_add(1, Ordering::SeqCst);
                }
                _ => {
                    self.misfired.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    #[test]
    fn hook_runs_for_future_tasks_only() {
        let book = Arc::new(PerShepherd::default());
        let rt = Runtime::new(
            RuntimeConfig::default()
                .shepherds(2)
                .future_bookkeeping(book.clone()),
        )
        .unwrap();

        let slots: Vec<Arc<Word>> = (0..3).map(|_| Arc::new(Word::new(0))).collect();
        assert!(rt.fork_future_to(|_| 1, Some(slots[0].clone()), 1));
        assert!(rt.fork_future_to(|_| 2, Some(slots[1].clone()), 1));
        rt.fork_with(|_| 3, Some(slots[2].clone()));
        for slot in &slots {
            rt.read_full_full(slot);
        }
        rt.finalize();

        assert_eq!(book.started[0].load(Ordering::SeqCst), 0);
        assert_eq!(book.started[1].load(Ordering::SeqCst), 2);
        assert_eq!(book.misfired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn future_flag_can_be_toggled_before_start() {
        let book = Arc::new(PerShepherd::default());
        let rt = Runtime::new(
            RuntimeConfig::default()
                .shepherds(2)
                .future_bookkeeping(book.clone()),
        )
        .unwrap();

        let slot = Arc::new(Word::new(0));
        let prepared = rt.prepare(|me| me.is_future() as u64, Some(slot.clone()));
        prepared.handle().set_future(true);
        rt.schedule_on(prepared, 0).unwrap();
        assert_eq!(rt.read_full_full(&slot), 1);
        rt.finalize();
        assert_eq!(book.started[0].load(Ordering::SeqCst), 1);
        assert_eq!(book.misfired.load(Ordering::SeqCst), 0);
    }
}
