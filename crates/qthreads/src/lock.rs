// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Address-keyed mutual exclusion.
//!
//! Any address can be locked. An address with no entry is unlocked; an
//! entry exists while the lock is held and carries the queue of tasks
//! waiting for it. Unlock hands the lock straight to the next waiter, so
//! a woken task already owns it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::error::UnlockStatus;
use crate::queue::ReadyQueue;
use crate::runtime::Shared;
use crate::shepherd;
use crate::task::{Parked, TaskRef, TaskState};

/// Number of independently locked shards.
pub const LOCK_SHARDS: usize = 32;

pub(crate) struct LockState {
    /// Id of the holder. Informational only; unlock does not check it.
    owner: u64,
    waiting: ReadyQueue<TaskRef>,
}

pub(crate) type LockGuard = ArcMutexGuard<RawMutex, LockState>;

type Shard = RwLock<HashMap<usize, Arc<Mutex<LockState>>>>;

fn shard_of(addr: usize) -> usize {
    (addr >> 5) & (LOCK_SHARDS - 1)
}

pub(crate) struct LockTable {
    shards: Vec<Shard>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            shards: (0..LOCK_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, addr: usize) -> &Shard {
        &self.shards[shard_of(addr)]
    }

    /// Acquire `addr` for `task`, parking it behind the current holder if
    /// there is one.
    pub fn lock(&self, task: &TaskRef, addr: usize) {
        let mut map = self.shard(addr).write();
        if let Some(entry) = map.get(&addr).cloned() {
            let guard = entry.lock_arc();
            drop(map);
            tracing::trace!(addr, task = task.id(), owner = guard.owner, "lock contended");
            guard.waiting.enqueue(task.clone());
            shepherd::park(task, TaskState::Blocked, Parked::Lock(guard));
            return;
        }
        map.insert(
            addr,
            Arc::new(Mutex::new(LockState {
                owner: task.id(),
                waiting: ReadyQueue::new(),
            })),
        );
    }

    /// Release `addr`, handing it to the longest waiter if any.
    pub fn unlock(&self, shared: &Shared, addr: usize) -> UnlockStatus {
        let mut map = self.shard(addr).write();
        let Some(entry) = map.get(&addr).cloned() else {
            return UnlockStatus::NotLocked;
        };
        let mut state = entry.lock();
        let next = state.waiting.lock().dequeue_nonblocking();
        match next {
            Some(next) => {
                state.owner = next.id();
                drop(state);
                drop(map);
                tracing::trace!(addr, task = next.id(), "lock handed off");
                shared.reschedule(next);
            }
            None => {
                drop(state);
                map.remove(&addr);
            }
        }
        UnlockStatus::Released
    }

    pub fn is_locked(&self, addr: usize) -> bool {
        self.shard(addr).read().contains_key(&addr)
    }

    /// Id of the task holding `addr`.
    #[cfg(test)]
    pub fn owner_of(&self, addr: usize) -> Option<u64> {
        self.shard(addr)
            .read()
            .get(&addr)
            .map(|entry| entry.lock().owner)
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}
