//! Bounded concurrency with a priority hook.
//!
//! `ocidist_cache.rs` bounds its layer-fetch fan-out with a bare
//! `tokio::sync::Semaphore` (`connection_semaphore`). That's enough for
//! uniform-priority bounded concurrency but has no ordering hook and no way
//! to acquire a slot in more than one queue atomically. This hand-rolls
//! both on top of `tokio::sync::Notify`, in the same spirit as
//! `blobcache.rs`'s hand-rolled `FileGuard`: a small synchronization
//! primitive built from primitives rather than pulled in as a dependency.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::reghttp::CancelToken;

/// Picks which queued waiter runs next given how many are queued and how
/// many slots are active. The default is FIFO; a caller may supply e.g.
/// "largest-blob-first" by sorting on `Entry`'s priority.
pub trait Next: Send + Sync {
    fn pick(&self, queued: &[Entry], active: usize) -> usize;
}

/// FIFO: oldest waiter (lowest sequence number) goes first.
pub struct Fifo;

impl Next for Fifo {
    fn pick(&self, queued: &[Entry], _active: usize) -> usize {
        queued
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.sequence)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// A queued waiter: its priority (higher runs first under a priority-aware
/// `Next`) and a stable sequence number for FIFO tie-breaking.
#[derive(Clone, Copy, Debug)]
pub struct Entry {
    pub priority: i64,
    sequence: u64,
}

struct Inner {
    max_concurrency: usize,
    active: Mutex<usize>,
    waiters: Mutex<BinaryHeap<Reverse<(i64, u64)>>>,
    sequence: AtomicU64,
    notify: Notify,
    next: Box<dyn Next>,
}

/// A slot released on `Drop`, mirroring the release-on-drop discipline
/// `blobcache::FileGuard` uses for its write guards.
pub struct Permit {
    queue: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        {
            let mut active = self.queue.active.lock().unwrap();
            *active = active.saturating_sub(1);
        }
        self.queue.notify.notify_waiters();
    }
}

/// A priority-aware bounded-concurrency gate. Cloning shares the same
/// underlying state (all clones draw from the same pool of slots).
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl Queue {
    pub fn new(max_concurrency: usize) -> Self {
        Self::with_policy(max_concurrency, Fifo)
    }

    pub fn with_policy(max_concurrency: usize, next: impl Next + 'static) -> Self {
        Queue {
            inner: Arc::new(Inner {
                max_concurrency,
                active: Mutex::new(0),
                waiters: Mutex::new(BinaryHeap::new()),
                sequence: AtomicU64::new(0),
                notify: Notify::new(),
                next: Box::new(next),
            }),
        }
    }

    /// A queue with `max_concurrency == 0` never blocks: every `acquire`
    /// succeeds immediately. Used where a caller wants the queue API
    /// without any actual concurrency limit.
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    fn is_noop(&self) -> bool {
        self.inner.max_concurrency == 0
    }

    /// Blocks until a slot is free or `cancel` fires.
    pub async fn acquire(&self, priority: i64, cancel: &CancelToken) -> Result<Permit> {
        if self.is_noop() {
            return Ok(Permit {
                queue: self.inner.clone(),
            });
        }
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        loop {
            if cancel.is_canceled() {
                let mut waiters = self.inner.waiters.lock().unwrap();
                waiters.retain(|Reverse((_, s))| *s != sequence);
                return Err(Error::Canceled);
            }
            {
                let mut active = self.inner.active.lock().unwrap();
                if *active < self.inner.max_concurrency && self.is_next_turn(sequence, priority) {
                    *active += 1;
                    self.remove_waiter(sequence);
                    return Ok(Permit {
                        queue: self.inner.clone(),
                    });
                }
            }
            self.ensure_waiting(sequence, priority);
            self.inner.notify.notified().await;
        }
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        if self.is_noop() {
            return Some(Permit {
                queue: self.inner.clone(),
            });
        }
        let mut active = self.inner.active.lock().unwrap();
        if *active < self.inner.max_concurrency {
            *active += 1;
            Some(Permit {
                queue: self.inner.clone(),
            })
        } else {
            None
        }
    }

    /// Atomically acquires one slot in each listed queue, or none at all,
    /// in a stable order (by `Arc` pointer identity) so that concurrent
    /// multi-acquires over overlapping queue sets can't deadlock each other.
    pub async fn acquire_multi(
        queues: &[&Queue],
        priority: i64,
        cancel: &CancelToken,
    ) -> Result<Vec<Permit>> {
        let mut ordered: Vec<&Queue> = queues.to_vec();
        ordered.sort_by_key(|q| Arc::as_ptr(&q.inner) as usize);
        let mut permits = Vec::with_capacity(ordered.len());
        for queue in ordered {
            permits.push(queue.acquire(priority, cancel).await?);
        }
        Ok(permits)
    }

    fn ensure_waiting(&self, sequence: u64, priority: i64) {
        let mut waiters = self.inner.waiters.lock().unwrap();
        if !waiters.iter().any(|Reverse((_, s))| *s == sequence) {
            waiters.push(Reverse((priority, sequence)));
        }
    }

    fn remove_waiter(&self, sequence: u64) {
        let mut waiters = self.inner.waiters.lock().unwrap();
        waiters.retain(|Reverse((_, s))| *s != sequence);
    }

    /// Whether `sequence` is the waiter the `Next` policy would pick right
    /// now. The default `Fifo` policy picks the lowest sequence number;
    /// custom policies consult the full snapshot of queued entries.
    fn is_next_turn(&self, sequence: u64, priority: i64) -> bool {
        let waiters = self.inner.waiters.lock().unwrap();
        if waiters.is_empty() {
            return true;
        }
        let entries: Vec<Entry> = waiters
            .iter()
            .map(|Reverse((p, s))| Entry {
                priority: *p,
                sequence: *s,
            })
            .chain(std::iter::once(Entry { priority, sequence }))
            .collect();
        let active = *self.inner.active.lock().unwrap();
        let picked = self.inner.next.pick(&entries, active);
        entries.get(picked).map(|e| e.sequence) == Some(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_max_concurrency() {
        let queue = Queue::new(2);
        let cancel = CancelToken::new();
        let p1 = queue.acquire(0, &cancel).await.unwrap();
        let p2 = queue.acquire(0, &cancel).await.unwrap();
        assert!(queue.try_acquire().is_none());
        drop(p1);
        let p3 = queue.try_acquire();
        assert!(p3.is_some());
        drop(p2);
        drop(p3);
    }

    #[tokio::test]
    async fn unbounded_queue_never_blocks() {
        let queue = Queue::unbounded();
        let cancel = CancelToken::new();
        let permits: Vec<_> = futures::future::join_all(
            (0..50).map(|_| queue.acquire(0, &cancel)),
        )
        .await;
        assert!(permits.into_iter().all(|p| p.is_ok()));
    }

    #[tokio::test]
    async fn canceled_acquire_returns_error() {
        let queue = Queue::new(1);
        let cancel = CancelToken::new();
        let _held = queue.acquire(0, &cancel).await.unwrap();
        cancel.cancel();
        assert!(queue.acquire(0, &cancel).await.is_err());
    }

    #[tokio::test]
    async fn acquire_multi_grabs_all_or_blocks() {
        let a = Queue::new(1);
        let b = Queue::new(1);
        let cancel = CancelToken::new();
        let permits = Queue::acquire_multi(&[&a, &b], 0, &cancel).await.unwrap();
        assert_eq!(permits.len(), 2);
        assert!(a.try_acquire().is_none());
        assert!(b.try_acquire().is_none());
    }

    #[tokio::test]
    async fn released_slot_unblocks_waiter() {
        let queue = Queue::new(1);
        let cancel = CancelToken::new();
        let permit = queue.acquire(0, &cancel).await.unwrap();
        let queue2 = queue.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { queue2.acquire(0, &cancel2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(permit);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete")
            .unwrap();
        assert!(result.is_ok());
    }
}
