//! Serialization of everything that mutates the cluster list.
//!
//! [`RemoteMessagePaginator`] runs at most one unit of work at a time and
//! queues the rest in arrival order. [`PaginationGate`] tracks manual
//! pagination so listener-driven work can wait for it to settle first.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{watch, Mutex};
use tracing::trace;

pub struct RemoteMessagePaginator {
    // tokio's mutex hands out the lock in FIFO order.
    lock: Mutex<()>,
    closed: AtomicBool,
}

impl RemoteMessagePaginator {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Run `work` once every earlier call has finished.
    ///
    /// Returns `None` without running `work` if the paginator was closed
    /// before its turn came.
    pub async fn perform<F: Future>(&self, work: F) -> Option<F::Output> {
        if self.is_closed() {
            return None;
        }
        let _turn = self.lock.lock().await;
        if self.is_closed() {
            trace!("Paginator closed, dropping queued work");
            return None;
        }
        Some(work.await)
    }

    /// Work already running finishes; queued and future work is dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

impl Default for RemoteMessagePaginator {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts manual paginations in progress.
pub struct PaginationGate {
    active: watch::Sender<usize>,
}

/// Marks one pagination as in progress until dropped.
pub struct PaginationGuard<'a> {
    gate: &'a PaginationGate,
}

impl PaginationGate {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self { active }
    }

    pub fn begin(&self) -> PaginationGuard<'_> {
        self.active.send_modify(|n| *n += 1);
        PaginationGuard { gate: self }
    }

    pub fn is_paginating(&self) -> bool {
        *self.active.borrow() > 0
    }

    /// Resolve once no pagination is in progress.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for PaginationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PaginationGuard<'_> {
    fn drop(&mut self) {
        self.gate.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn perform_never_overlaps_and_keeps_order() {
        let paginator = RemoteMessagePaginator::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let work = |n: usize| {
            let active = active.clone();
            let peak = peak.clone();
            let order = order.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().unwrap().push(n);
                active.fetch_sub(1, Ordering::SeqCst);
            }
        };

        let (a, b) = tokio::join!(paginator.perform(work(1)), paginator.perform(work(2)));
        assert!(a.is_some() && b.is_some());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_lets_running_work_finish_and_drops_the_queue() {
        let paginator = RemoteMessagePaginator::new();

        let (first, queued, _) = tokio::join!(
            paginator.perform(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                1
            }),
            paginator.perform(async { 2 }),
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert!(paginator.is_busy());
                paginator.close();
            }
        );

        assert_eq!(first, Some(1));
        assert_eq!(queued, None);
        assert_eq!(paginator.perform(async { 3 }).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_releases_waiters_when_pagination_ends() {
        let gate = PaginationGate::new();
        gate.wait_until_idle().await;

        let guard = gate.begin();
        assert!(gate.is_paginating());

        let released = AtomicBool::new(false);
        tokio::join!(
            async {
                gate.wait_until_idle().await;
                released.store(true, Ordering::SeqCst);
            },
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert!(!released.load(Ordering::SeqCst));
                drop(guard);
            }
        );
        assert!(released.load(Ordering::SeqCst));
        assert!(!gate.is_paginating());
    }
}
