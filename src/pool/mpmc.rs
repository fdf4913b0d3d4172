//! Bounded multi-producer multi-consumer queue.
//!
//! The classic sequence-counter design: each cell carries a ticket; a
//! producer claims a cell by CASing the tail when the ticket matches, a
//! consumer by CASing the head when the ticket is one ahead. Contended
//! retries back off exponentially around a pause hint.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, Ordering};

struct Slot<T> {
    seq: AtomicI64,
    data: UnsafeCell<Option<T>>,
}

pub struct Mpmc<T> {
    buf: Box<[Slot<T>]>,
    mask: i64,
    tail: AtomicI64,
    head: AtomicI64,
}

unsafe impl<T: Send> Send for Mpmc<T> {}
unsafe impl<T: Send> Sync for Mpmc<T> {}

#[inline(always)]
pub fn backoff_spin(rounds: &mut u32) {
    let spins = 1u32 << (*rounds).min(6);
    for _ in 0..spins {
        std::hint::spin_loop();
    }
    *rounds += 1;
}

impl<T> Mpmc<T> {
    pub fn new(size: usize) -> Self {
        let size = size.next_power_of_two().max(2);
        let buf = (0..size)
            .map(|i| Slot { seq: AtomicI64::new(i as i64), data: UnsafeCell::new(None) })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buf,
            mask: size as i64 - 1,
            tail: AtomicI64::new(0),
            head: AtomicI64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    /// Enqueue; `Err(v)` when the queue is full.
    pub fn push(&self, v: T) -> Result<(), T> {
        let mut rounds = 0u32;
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.buf[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq - pos;
            if dif == 0 {
                if self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe { *slot.data.get() = Some(v) };
                    slot.seq.store(pos + 1, Ordering::Release);
                    return Ok(());
                }
            } else if dif < 0 {
                return Err(v);
            } else {
                backoff_spin(&mut rounds);
                pos = self.tail.load(Ordering::Relaxed);
                continue;
            }
            pos = self.tail.load(Ordering::Relaxed);
        }
    }

    /// Dequeue; `None` when the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let mut rounds = 0u32;
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.buf[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq - (pos + 1);
            if dif == 0 {
                if self
                    .head
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let v = unsafe { (*slot.data.get()).take() };
                    slot.seq.store(pos + self.mask + 1, Ordering::Release);
                    return v;
                }
            } else if dif < 0 {
                return None;
            } else {
                backoff_spin(&mut rounds);
                pos = self.head.load(Ordering::Relaxed);
                continue;
            }
            pos = self.head.load(Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> i64 {
        self.tail.load(Ordering::SeqCst) - self.head.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_pop_order() {
        let q = Mpmc::new(8);
        for i in 0..8 {
            q.push(i).unwrap();
        }
        assert!(q.push(99).is_err());
        for i in 0..8 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        let q = Arc::new(Mpmc::new(1024));
        let total = 4 * 10_000;

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..10_000u64 {
                        let mut v = p * 10_000 + i;
                        loop {
                            match q.push(v) {
                                Ok(()) => break,
                                Err(back) => v = back,
                            }
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while got.len() < total / 4 {
                        if let Some(v) = q.pop() {
                            got.push(v);
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                    got
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let mut all: Vec<u64> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all.len(), total);
        for (i, v) in all.iter().enumerate() {
            assert_eq!(*v, i as u64);
        }
    }
}
