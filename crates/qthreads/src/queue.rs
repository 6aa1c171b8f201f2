// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking FIFO of runnable tasks.
//!
//! Each shepherd owns one and is its only blocking consumer; any thread
//! may append. Address locks reuse the same shape for their waiter list,
//! drained with [`ReadyQueueGuard::dequeue_nonblocking`] instead of the
//! blocking path.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Mutex-protected VecDeque plus a not-empty condition.
///
/// Strict FIFO: no priorities, no stealing.
pub(crate) struct ReadyQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> ReadyQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Append at the tail. Wakes the consumer if the queue was empty.
    pub fn enqueue(&self, item: T) {
        let mut q = self.items.lock().unwrap();
        let was_empty = q.is_empty();
        q.push_back(item);
        if was_empty {
            self.not_empty.notify_one();
        }
    }

    /// Pop the head, parking the calling thread until one is available.
    pub fn dequeue(&self) -> T {
        let mut q = self.items.lock().unwrap();
        loop {
            if let Some(item) = q.pop_front() {
                return item;
            }
            q = self.not_empty.wait(q).unwrap();
        }
    }

    /// Take the queue lock for a sequence of non-blocking operations.
    pub fn lock(&self) -> ReadyQueueGuard<'_, T> {
        ReadyQueueGuard {
            items: self.items.lock().unwrap(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Held queue lock.
pub(crate) struct ReadyQueueGuard<'a, T> {
    items: MutexGuard<'a, VecDeque<T>>,
}

impl<T> ReadyQueueGuard<'_, T> {
    /// Pop the head if there is one. Never waits.
    pub fn dequeue_nonblocking(&mut self) -> Option<T> {
        self.items.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn enqueue_dequeue() {
        let q = ReadyQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue(), 1);
        assert_eq!(q.dequeue(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn nonblocking_on_empty_returns_none() {
        let q: ReadyQueue<u32> = ReadyQueue::new();
        assert_eq!(q.lock().dequeue_nonblocking(), None);
        q.enqueue(7);
        let mut guard = q.lock();
        assert_eq!(guard.dequeue_nonblocking(), Some(7));
        assert_eq!(guard.dequeue_nonblocking(), None);
    }

    #[test]
    fn dequeue_waits_for_producer() {
        let q = Arc::new(ReadyQueue::new());
        let consumer = {
            let q = q.clone();
            thread::spawn(move || (0..100).map(|_| q.dequeue()).collect::<Vec<u32>>())
        };
        for i in 0..100 {
            q.enqueue(i);
        }
        let got = consumer.join().unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn many_producers_one_consumer() {
        let q = Arc::new(ReadyQueue::new());
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        q.enqueue((p, i));
                    }
                })
            })
            .collect();
        let mut last = [None::<u32>; 4];
        for _ in 0..1000 {
            let (p, i) = q.dequeue();
            // Per-producer order survives interleaving.
            if let Some(prev) = last[p as usize] {
                assert!(i > prev);
            }
            last[p as usize] = Some(i);
        }
        for p in producers {
            p.join().unwrap();
        }
        assert!(q.is_empty());
    }

    proptest! {
        #[test]
        fn dequeue_order_matches_enqueue_order(items in proptest::collection::vec(any::<u32>(), 0..256)) {
            let q = ReadyQueue::new();
            for &item in &items {
                q.enqueue(item);
            }
            let out: Vec<u32> = (0..items.len()).map(|_| q.dequeue()).collect();
            prop_assert_eq!(out, items);
            prop_assert!(q.is_empty());
        }
    }
}
