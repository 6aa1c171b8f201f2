// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Full/empty-bit laws, checked against a live runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use qthreads::{FebStatus, Runtime, Word};

fn word(value: u64) -> Arc<Word> {
    Arc::new(Word::new(value))
}

#[test]
fn untracked_word_reads_immediately() {
    let rt = Runtime::with_shepherds(2).unwrap();
    let w = word(13);
    assert_eq!(rt.status(&w), FebStatus::Full);
    assert_eq!(rt.read_full_full(&w), 13);
    assert_eq!(rt.status(&w), FebStatus::Full);
}

#[test]
fn non_destructive_read() {
    let rt = Runtime::with_shepherds(2).unwrap();
    let w = word(0);
    rt.write_full(&w, 21);
    let b1 = rt.read_full_full(&w);
    let b2 = rt.read_full_full(&w);
    assert_eq!((b1, b2), (21, 21));
    assert_eq!(rt.status(&w), FebStatus::Full);
}

#[test]
fn destructive_read_then_blocking_read() {
    let rt = Runtime::with_shepherds(2).unwrap();
    let a = word(0);
    rt.empty(std::slice::from_ref(&*a));
    rt.write_empty_full(&a, 5);
    assert_eq!(rt.status(&a), FebStatus::Full);

    assert_eq!(rt.read_full_empty(&a), 5);
    assert_eq!(rt.status(&a), FebStatus::Empty);

    // The word still holds 5, but a full-read must wait for the next write.
    let seen = word(0);
    {
        let h = rt.handle().clone();
        let a = a.clone();
        rt.fork_with(move |_| h.read_full_full(&a), Some(seen.clone()));
    }
    rt.write_full(&a, 99);
    assert_eq!(rt.read_full_full(&seen), 99);
}

#[test]
fn fill_releases_readers_then_one_consumer() {
    let rt = Runtime::with_shepherds(1).unwrap();
    let w = word(0);
    rt.empty(std::slice::from_ref(&*w));

    let order = Arc::new(Mutex::new(Vec::new()));
    let done: Vec<Arc<Word>> = (0..4).map(|_| word(0)).collect();

    // One shepherd runs these in order: three park, then the writer fills.
    let waiters: [(&'static str, bool); 3] = [("r1", false), ("c1", true), ("r2", false)];
    for (i, (name, consume)) in waiters.into_iter().enumerate() {
        let h = rt.handle().clone();
        let w = w.clone();
        let order = order.clone();
        rt.fork_with(
            move |_| {
                let v = if consume {
                    h.read_full_empty(&w)
                } else {
                    h.read_full_full(&w)
                };
                order.lock().unwrap().push(name);
                v
            },
            Some(done[i].clone()),
        );
    }
    {
        let h = rt.handle().clone();
        let w = w.clone();
        rt.fork_with(
            move |_| {
                h.write_full(&w, 7);
                0
            },
            Some(done[3].clone()),
        );
    }

    for slot in &done[..3] {
        assert_eq!(rt.read_full_full(slot), 7);
    }
    rt.read_full_full(&done[3]);
    assert_eq!(*order.lock().unwrap(), vec!["r1", "r2", "c1"]);
    // The consumer took the value and left the word empty.
    assert_eq!(rt.status(&w), FebStatus::Empty);
}

#[test]
fn parked_writers_fill_in_arrival_order() {
    let rt = Runtime::with_shepherds(1).unwrap();
    let w = word(0);
    let slots: Vec<Arc<Word>> = (0..3).map(|_| word(0)).collect();

    for (i, value) in [1u64, 2].into_iter().enumerate() {
        let h = rt.handle().clone();
        let w = w.clone();
        rt.fork_with(
            move |_| {
                h.write_empty_full(&w, value);
                value
            },
            Some(slots[i].clone()),
        );
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let h = rt.handle().clone();
        let w = w.clone();
        let seen = seen.clone();
        rt.fork_with(
            move |_| {
                for _ in 0..3 {
                    let v = h.read_full_empty(&w);
                    seen.lock().unwrap().push(v);
                }
                0
            },
            Some(slots[2].clone()),
        );
    }

    for slot in &slots {
        rt.read_full_full(slot);
    }
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(rt.status(&w), FebStatus::Empty);
}

#[test]
fn multi_word_empty_and_fill() {
    let rt = Runtime::with_shepherds(2).unwrap();
    let words: Arc<[Word]> = (0..4).map(|i| Word::new(i)).collect();
    rt.empty(&words);
    for w in words.iter() {
        assert_eq!(rt.status(w), FebStatus::Empty);
    }

    let got = word(0);
    {
        let h = rt.handle().clone();
        let words = words.clone();
        rt.fork_with(move |_| h.read_full_full(&words[2]), Some(got.clone()));
    }
    rt.fill(&words);
    for w in words.iter() {
        assert_eq!(rt.status(w), FebStatus::Full);
    }
    assert_eq!(rt.read_full_full(&got), 2);
}

#[test]
fn producers_and_consumers_balance() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 250;
    const CONSUMERS: u64 = 5;
    const PER_CONSUMER: u64 = PRODUCERS * PER_PRODUCER / CONSUMERS;

    let rt = Runtime::with_shepherds(4).unwrap();
    let mailbox = word(0);
    rt.empty(std::slice::from_ref(&*mailbox));

    let mut slots = Vec::new();
    for p in 0..PRODUCERS {
        let h = rt.handle().clone();
        let mailbox = mailbox.clone();
        let slot = word(0);
        slots.push(slot.clone());
        rt.fork_with(
            move |_| {
                for i in 0..PER_PRODUCER {
                    h.write_empty_full(&mailbox, p * PER_PRODUCER + i + 1);
                }
                0
            },
            Some(slot),
        );
    }

    let mut sums = Vec::new();
    for _ in 0..CONSUMERS {
        let h = rt.handle().clone();
        let mailbox = mailbox.clone();
        let slot = word(0);
        sums.push(slot.clone());
        rt.fork_with(
            move |_| (0..PER_CONSUMER).map(|_| h.read_full_empty(&mailbox)).sum(),
            Some(slot),
        );
    }

    for slot in &slots {
        rt.read_full_full(slot);
    }
    let total: u64 = sums.iter().map(|s| rt.read_full_full(s)).sum();
    let n = PRODUCERS * PER_PRODUCER;
    assert_eq!(total, n * (n + 1) / 2);
    assert_eq!(rt.status(&mailbox), FebStatus::Empty);
}

#[test]
fn result_slot_rendezvous() {
    let rt = Runtime::with_shepherds(3).unwrap();
    let slots: Vec<Arc<Word>> = (0..32).map(|_| word(0)).collect();
    for (i, slot) in slots.iter().enumerate() {
        rt.fork_with(move |_| i as u64 * 3, Some(slot.clone()));
    }
    for (i, slot) in slots.iter().enumerate() {
        assert_eq!(rt.read_full_full(slot), i as u64 * 3);
        assert_eq!(rt.status(slot), FebStatus::Full);
    }
}

#[test]
fn full_read_never_sees_a_value_older_than_a_finished_write() {
    const WRITES: u64 = 20_000;
    const READERS: usize = 3;

    let rt = Runtime::with_shepherds(1 + READERS).unwrap();
    let w = word(0);
    // Last value whose write has returned.
    let published = Arc::new(AtomicU64::new(0));

    let writer_done = word(0);
    {
        let h = rt.handle().clone();
        let w = w.clone();
        let published = published.clone();
        assert!(rt.fork_to(
            move |_| {
                for i in 1..=WRITES {
                    if i % 2 == 0 {
                        h.empty(std::slice::from_ref(&*w));
                        h.write_empty_full(&w, i);
                    } else {
                        h.write_full(&w, i);
                    }
                    published.store(i, Ordering::SeqCst);
                }
                0
            },
            Some(writer_done.clone()),
            0,
        ));
    }

    let stale: Vec<Arc<Word>> = (0..READERS).map(|_| word(0)).collect();
    for (i, slot) in stale.iter().enumerate() {
        let h = rt.handle().clone();
        let w = w.clone();
        let published = published.clone();
        assert!(rt.fork_to(
            move |_| {
                let mut stale = 0;
                loop {
                    let floor = published.load(Ordering::SeqCst);
                    if h.read_full_full(&w) < floor {
                        stale += 1;
                    }
                    if floor == WRITES {
                        return stale;
                    }
                }
            },
            Some(slot.clone()),
            1 + i,
        ));
    }

    rt.read_full_full(&writer_done);
    for slot in &stale {
        assert_eq!(rt.read_full_full(slot), 0);
    }
    assert_eq!(rt.read_full_full(&w), WRITES);
}
