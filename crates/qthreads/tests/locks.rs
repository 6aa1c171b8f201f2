// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Address locks: exclusion, hand-off order and misuse reporting.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use qthreads::{LockStatus, Runtime, UnlockStatus, Word};

#[test]
fn outside_lock_is_deferred() {
    let rt = Runtime::with_shepherds(2).unwrap();
    let key = Box::new([0u8; 3]);
    assert!(!rt.is_locked(&*key));
    assert_eq!(rt.lock(&*key), LockStatus::Deferred);
    assert!(rt.is_locked(&*key));
    assert_eq!(rt.unlock(&*key), UnlockStatus::Released);
    assert!(!rt.is_locked(&*key));
    assert_eq!(rt.unlock(&*key), UnlockStatus::NotLocked);
}

#[test]
fn lock_inside_task_is_acquired() {
    let rt = Runtime::with_shepherds(2).unwrap();
    let key = Arc::new(0u32);
    let slot = Arc::new(Word::new(0));
    {
        let h = rt.handle().clone();
        let key = key.clone();
        rt.fork_with(
            move |_| {
                let status = h.lock(&*key);
                let held = h.is_locked(&*key);
                h.unlock(&*key);
                (status == LockStatus::Acquired && held) as u64
            },
            Some(slot.clone()),
        );
    }
    assert_eq!(rt.read_full_full(&slot), 1);
    assert!(!rt.is_locked(&*key));
}

#[test]
fn at_most_one_holder() {
    const TASKS: usize = 16;
    const ROUNDS: u64 = 50;

    let rt = Runtime::with_shepherds(4).unwrap();
    let key = Arc::new(0u64);
    let inside = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicU64::new(0));
    let slots: Vec<Arc<Word>> = (0..TASKS).map(|_| Arc::new(Word::new(0))).collect();

    for slot in &slots {
        let h = rt.handle().clone();
        let key = key.clone();
        let inside = inside.clone();
        let total = total.clone();
        rt.fork_with(
            move |me| {
                // Rounds that saw another holder or failed to release.
                let mut bad = 0;
                for _ in 0..ROUNDS {
                    h.lock(&*key);
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        bad += 1;
                    }
                    // Split read-modify-write with a yield in the middle.
                    let seen = total.load(Ordering::SeqCst);
                    me.yield_now();
                    total.store(seen + 1, Ordering::SeqCst);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    if h.unlock(&*key) != UnlockStatus::Released {
                        bad += 1;
                    }
                }
                bad
            },
            Some(slot.clone()),
        );
    }

    for slot in &slots {
        assert_eq!(rt.read_full_full(slot), 0);
    }
    assert_eq!(total.load(Ordering::SeqCst), TASKS as u64 * ROUNDS);
    assert!(!rt.is_locked(&*key));
}

#[test]
fn waiters_get_the_lock_in_arrival_order() {
    let rt = Runtime::with_shepherds(1).unwrap();
    let key = Arc::new(0u8);
    assert_eq!(rt.lock(&*key), LockStatus::Deferred);

    let order = Arc::new(Mutex::new(Vec::new()));
    let slots: Vec<Arc<Word>> = (0..5).map(|_| Arc::new(Word::new(0))).collect();
    for (i, slot) in slots[..4].iter().enumerate() {
        let h = rt.handle().clone();
        let key = key.clone();
        let order = order.clone();
        rt.fork_with(
            move |_| {
                h.lock(&*key);
                order.lock().unwrap().push(i);
                h.unlock(&*key);
                0
            },
            Some(slot.clone()),
        );
    }
    // Queued behind the four lockers on the only shepherd, so they are all
    // parked by the time this releases the proxy's hold.
    {
        let h = rt.handle().clone();
        let key = key.clone();
        rt.fork_with(
            move |_| {
                let still_held = h.unlock(&*key) == UnlockStatus::Released && h.is_locked(&*key);
                still_held as u64
            },
            Some(slots[4].clone()),
        );
    }

    assert_eq!(rt.read_full_full(&slots[4]), 1);
    for slot in &slots[..4] {
        rt.read_full_full(slot);
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    assert!(!rt.is_locked(&*key));
}

#[test]
fn distinct_addresses_do_not_contend() {
    let rt = Runtime::with_shepherds(2).unwrap();
    let keys = [0u64; 2];
    assert_eq!(rt.lock(&keys[0]), LockStatus::Deferred);
    assert_eq!(rt.lock(&keys[1]), LockStatus::Deferred);
    assert_eq!(rt.unlock(&keys[1]), UnlockStatus::Released);
    assert!(rt.is_locked(&keys[0]));
    assert_eq!(rt.unlock(&keys[0]), UnlockStatus::Released);
}
