// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Full/empty bits.
//!
//! Every aligned word carries a full/empty tag. Words the table does not
//! track are implicitly full with nobody waiting, so an entry exists only
//! while it says something else: the word is empty, or some task is
//! parked on it. Entries go away as soon as a release path finds them
//! back in that default state.
//!
//! Lock order: table, then entry, then the table is released. Nothing
//! takes the table lock while it holds an entry lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::runtime::Shared;
use crate::shepherd;
use crate::task::{Parked, TaskRef, TaskState};

/// The value type moved through FEB operations and returned by task bodies.
pub type Aligned = u64;

/// A word that can carry a full/empty tag.
pub type Word = AtomicU64;

/// Snapshot of a word's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FebStatus {
    Full,
    Empty,
}

/// A writer parked until the word empties, with the value it will store.
struct Writer {
    task: TaskRef,
    value: Aligned,
}

pub(crate) struct FebState {
    /// The tag. Shared with the table entry so `status` can read it
    /// without the entry lock; only written with that lock held.
    full: Arc<AtomicBool>,
    /// `write_empty_full` callers waiting for the word to empty.
    empty_to_full: VecDeque<Writer>,
    /// `read_full_empty` callers waiting for the word to fill.
    full_to_empty: VecDeque<TaskRef>,
    /// `read_full_full` callers waiting for the word to fill.
    full_readers: VecDeque<TaskRef>,
}

impl FebState {
    fn new(full: Arc<AtomicBool>) -> Self {
        Self {
            full,
            empty_to_full: VecDeque::new(),
            full_to_empty: VecDeque::new(),
            full_readers: VecDeque::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::Release);
    }

    /// Indistinguishable from an untracked word.
    fn is_default(&self) -> bool {
        self.is_full()
            && self.empty_to_full.is_empty()
            && self.full_to_empty.is_empty()
            && self.full_readers.is_empty()
    }
}

pub(crate) type FebGuard = ArcMutexGuard<RawMutex, FebState>;

#[derive(Clone)]
struct Entry {
    full: Arc<AtomicBool>,
    state: Arc<Mutex<FebState>>,
}

impl Entry {
    fn new(full: bool) -> Self {
        let full = Arc::new(AtomicBool::new(full));
        Self {
            state: Arc::new(Mutex::new(FebState::new(full.clone()))),
            full,
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Full,
    Empty,
}

fn address(word: &Word) -> usize {
    word as *const Word as usize
}

pub(crate) struct FebTable {
    entries: RwLock<HashMap<usize, Entry>>,
}

impl FebTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Lock the entry for `addr` if there is one.
    fn lookup(&self, addr: usize) -> Option<FebGuard> {
        let entries = self.entries.read();
        entries.get(&addr).map(|entry| entry.state.lock_arc())
    }

    /// Lock the entry for `addr`, creating it with tag `full` if absent.
    fn lock_or_insert(&self, addr: usize, full: bool) -> FebGuard {
        if let Some(guard) = self.lookup(addr) {
            return guard;
        }
        let mut entries = self.entries.write();
        let entry = entries
            .entry(addr)
            .or_insert_with(|| Entry::new(full))
            .clone();
        let guard = entry.state.lock_arc();
        drop(entries);
        guard
    }

    /// Release the entry lock and drop the entry if it is back to default.
    fn finish(&self, addr: usize, guard: FebGuard) {
        let removable = guard.is_default();
        drop(guard);
        if removable {
            self.remove_if_default(addr);
        }
    }

    fn remove_if_default(&self, addr: usize) {
        let mut entries = self.entries.write();
        let still_default = entries
            .get(&addr)
            .is_some_and(|entry| entry.state.lock().is_default());
        if still_default {
            entries.remove(&addr);
            tracing::trace!(addr, "FEB entry removed");
        }
    }

    /// Wake waiters after the word changed sides, following the cascade
    /// until no waiter can make progress.
    ///
    /// Full: every plain reader gets a copy, then one consuming reader
    /// takes the value and empties the word. Empty: one parked writer
    /// stores its value and fills the word.
    fn release(&self, shared: &Shared, state: &mut FebState, word: &Word, mut side: Side) {
        loop {
            match side {
                Side::Full => {
                    while let Some(reader) = state.full_readers.pop_front() {
                        reader.deliver(word.load(Ordering::Acquire));
                        shared.reschedule(reader);
                    }
                    match state.full_to_empty.pop_front() {
                        Some(consumer) => {
                            consumer.deliver(word.load(Ordering::Acquire));
                            state.set_full(false);
                            shared.reschedule(consumer);
                            side = Side::Empty;
                        }
                        None => return,
                    }
                }
                Side::Empty => match state.empty_to_full.pop_front() {
                    Some(Writer { task, value }) => {
                        word.store(value, Ordering::Release);
                        state.set_full(true);
                        shared.reschedule(task);
                        side = Side::Full;
                    }
                    None => return,
                },
            }
        }
    }

    /// Mark each word empty. Untracked words get an entry recording it.
    pub fn empty(&self, shared: &Shared, words: &[Word]) {
        for word in words {
            let addr = address(word);
            let mut guard = self.lock_or_insert(addr, false);
            if guard.is_full() {
                guard.set_full(false);
                self.release(shared, &mut guard, word, Side::Empty);
            }
            self.finish(addr, guard);
        }
    }

    /// Mark each tracked word full. Untracked words already are.
    pub fn fill(&self, shared: &Shared, words: &[Word]) {
        for word in words {
            let addr = address(word);
            if let Some(mut guard) = self.lookup(addr) {
                guard.set_full(true);
                self.release(shared, &mut guard, word, Side::Full);
                self.finish(addr, guard);
            }
        }
    }

    /// Store `value` and fill, whatever the current tag.
    pub fn write_full(&self, shared: &Shared, word: &Word, value: Aligned) {
        let addr = address(word);
        let entries = self.entries.read();
        let Some(entry) = entries.get(&addr).cloned() else {
            // Untracked: already full, nobody to wake. The read lock keeps
            // an `empty` from slipping in between.
            word.store(value, Ordering::Release);
            return;
        };
        let mut guard = entry.state.lock_arc();
        drop(entries);
        word.store(value, Ordering::Release);
        guard.set_full(true);
        self.release(shared, &mut guard, word, Side::Full);
        self.finish(addr, guard);
    }

    /// Wait for the word to be empty, then store `value` and fill.
    pub fn write_empty_full(&self, shared: &Shared, task: &TaskRef, word: &Word, value: Aligned) {
        let addr = address(word);
        let mut guard = self.lock_or_insert(addr, true);
        if guard.is_full() {
            tracing::trace!(addr, task = task.id(), "writer parked");
            guard.empty_to_full.push_back(Writer {
                task: task.clone(),
                value,
            });
            shepherd::park(task, TaskState::FebBlocked, Parked::Feb(guard));
            return;
        }
        word.store(value, Ordering::Release);
        guard.set_full(true);
        self.release(shared, &mut guard, word, Side::Full);
        self.finish(addr, guard);
    }

    /// Wait for the word to be full and return it, leaving it full.
    pub fn read_full_full(&self, task: &TaskRef, word: &Word) -> Aligned {
        let addr = address(word);
        let Some(mut guard) = self.lookup(addr) else {
            return word.load(Ordering::Acquire);
        };
        if guard.is_full() {
            let value = word.load(Ordering::Acquire);
            self.finish(addr, guard);
            return value;
        }
        tracing::trace!(addr, task = task.id(), "reader parked");
        guard.full_readers.push_back(task.clone());
        shepherd::park(task, TaskState::FebBlocked, Parked::Feb(guard));
        task.take_delivered()
    }

    /// Wait for the word to be full, return it and leave the word empty.
    pub fn read_full_empty(&self, shared: &Shared, task: &TaskRef, word: &Word) -> Aligned {
        let addr = address(word);
        let mut guard = self.lock_or_insert(addr, true);
        if guard.is_full() {
            let value = word.load(Ordering::Acquire);
            guard.set_full(false);
            self.release(shared, &mut guard, word, Side::Empty);
            self.finish(addr, guard);
            return value;
        }
        tracing::trace!(addr, task = task.id(), "consumer parked");
        guard.full_to_empty.push_back(task.clone());
        shepherd::park(task, TaskState::FebBlocked, Parked::Feb(guard));
        task.take_delivered()
    }

    /// Snapshot of the tag. Never waits on an entry lock, so it does not
    /// block behind a task that is mid-park.
    pub fn status(&self, word: &Word) -> FebStatus {
        let entries = self.entries.read();
        match entries.get(&address(word)) {
            Some(entry) if !entry.full.load(Ordering::Acquire) => FebStatus::Empty,
            _ => FebStatus::Full,
        }
    }

    /// Number of words with an entry.
    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.entries.read().len()
    }
}

impl Default for FebTable {
    fn default() -> Self {
        Self::new()
    }
}
