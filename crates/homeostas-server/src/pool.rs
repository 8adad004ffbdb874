// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded, self-sizing worker pool (C14, §5 "Scheduling model").

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Idle timeout before a worker above the minimum exits (§5).
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    count: AtomicUsize,
    min: usize,
    max: usize,
}

/// Grows workers on demand up to `max` (hardware concurrency by default),
/// never below `min`. Workers idle for [`IDLE_TIMEOUT`] above `min` exit;
/// their handles are joined lazily by a later `submit` call, not inside the
/// submitting call's own critical section (§5).
pub struct WorkerPool {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(min: usize, max: usize) -> Self {
        let max = max.max(min).max(1);
        let (sender, receiver) = channel::unbounded::<Job>();
        let inner = Arc::new(Inner {
            sender,
            receiver,
            count: AtomicUsize::new(0),
            min,
            max,
        });
        let handles = (0..min).map(|_| spawn_worker(inner.clone())).collect();
        WorkerPool {
            inner,
            handles: Mutex::new(handles),
        }
    }

    /// Size the pool to the machine's hardware concurrency, with a minimum
    /// of 1 (§5: "Grows on demand up to `hardware_concurrency()` by default").
    pub fn with_default_max(min: usize) -> Self {
        let max = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        WorkerPool::new(min, max)
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reap_graveyard();
        if self.inner.count.load(Ordering::Relaxed) < self.inner.max && !self.inner.sender.is_empty()
        {
            self.handles.lock().push(spawn_worker(self.inner.clone()));
        }
        let _ = self.inner.sender.send(Box::new(job));
    }

    fn reap_graveyard(&self) {
        let mut handles = self.handles.lock();
        let mut i = 0;
        while i < handles.len() {
            if handles[i].is_finished() {
                let handle = handles.remove(i);
                let _ = handle.join();
            } else {
                i += 1;
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.count.load(Ordering::Relaxed)
    }
}

fn spawn_worker(inner: Arc<Inner>) -> JoinHandle<()> {
    inner.count.fetch_add(1, Ordering::Relaxed);
    thread::spawn(move || loop {
        match inner.receiver.recv_timeout(IDLE_TIMEOUT) {
            Ok(job) => job(),
            Err(RecvTimeoutError::Timeout) => {
                if inner.count.load(Ordering::Relaxed) > inner.min {
                    inner.count.fetch_sub(1, Ordering::Relaxed);
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                inner.count.fetch_sub(1, Ordering::Relaxed);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    #[test]
    fn submitted_jobs_all_run() {
        let pool = WorkerPool::new(2, 4);
        let done = Arc::new(AtomicU32::new(0));
        for _ in 0..20 {
            let done = done.clone();
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        thread::sleep(StdDuration::from_millis(200));
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn never_shrinks_below_minimum() {
        let pool = WorkerPool::new(2, 4);
        thread::sleep(StdDuration::from_millis(50));
        assert!(pool.worker_count() >= 2);
    }
}
