// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded worker pool for the staging transport.
//!
//! Jobs enter a bounded FIFO and are run by `min..=max` worker threads.
//! Idle workers above the minimum linger for a configurable window and
//! then exit; the pool grows again on demand. `wait` is a barrier until
//! the queue is drained and no job is running. `destroy` cancels
//! cooperatively: the cancel token trips at the dequeue wait, and job
//! bodies are expected to poll it at their own suspension points and
//! leave shared state consistent when it is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

/// Cooperative cancellation flag handed to every job.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

type Job = Box<dyn FnOnce(&CancelToken) + Send + 'static>;

/// Pool sizing knobs.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub linger: Duration,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_workers: 0,
            max_workers: 4,
            linger: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }
}

#[derive(Default)]
struct PoolState {
    queued: usize,
    active: usize,
    workers: usize,
    idle: usize,
    destroying: bool,
    handles: Vec<thread::JoinHandle<()>>,
}

struct PoolInner {
    jobs: ArrayQueue<Job>,
    state: Mutex<PoolState>,
    // Workers sleep on `work`, producers on `space`, wait()/destroy() on
    // `done`.
    work: Condvar,
    space: Condvar,
    done: Condvar,
    cancel: CancelToken,
    cfg: PoolConfig,
}

/// See the module docs.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(cfg: PoolConfig) -> WorkerPool {
        assert!(cfg.max_workers >= 1, "pool needs at least one worker");
        assert!(
            cfg.min_workers <= cfg.max_workers,
            "min_workers must not exceed max_workers"
        );
        assert!(cfg.queue_capacity >= 1);
        let inner = Arc::new(PoolInner {
            jobs: ArrayQueue::new(cfg.queue_capacity),
            state: Mutex::new(PoolState::default()),
            work: Condvar::new(),
            space: Condvar::new(),
            done: Condvar::new(),
            cancel: CancelToken::default(),
            cfg: cfg.clone(),
        });
        let pool = WorkerPool { inner };
        {
            let mut state = pool.inner.state.lock().unwrap();
            for _ in 0..cfg.min_workers {
                spawn_worker(&pool.inner, &mut state);
            }
        }
        pool
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    /// Enqueue a job, blocking while the FIFO is full. Returns false when
    /// the pool is being destroyed.
    pub fn queue(&self, job: impl FnOnce(&CancelToken) + Send + 'static) -> bool {
        let mut job: Job = Box::new(job);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.destroying {
                return false;
            }
            match self.inner.jobs.push(job) {
                Ok(()) => break,
                Err(back) => {
                    job = back;
                    state = self.inner.space.wait(state).unwrap();
                }
            }
        }
        state.queued += 1;
        if state.idle > 0 {
            self.inner.work.notify_one();
        } else if state.workers < self.inner.cfg.max_workers {
            spawn_worker(&self.inner, &mut state);
        }
        true
    }

    /// Block until the queue is drained and no job is running.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.queued > 0 || state.active > 0 {
            state = self.inner.done.wait(state).unwrap();
        }
    }

    /// Cancel active jobs, wait for every worker to exit, and reclaim the
    /// pool. Pending jobs that never started are discarded.
    pub fn destroy(self) {
        self.inner.cancel.flag.store(true, Ordering::Relaxed);
        let handles = {
            let mut state = self.inner.state.lock().unwrap();
            state.destroying = true;
            self.inner.work.notify_all();
            self.inner.space.notify_all();
            while state.workers > 0 {
                state = self.inner.done.wait(state).unwrap();
            }
            std::mem::take(&mut state.handles)
        };
        for handle in handles {
            let _ = handle.join();
        }
        while self.inner.jobs.pop().is_some() {}
        tracing::debug!("staging worker pool destroyed");
    }
}

fn spawn_worker(inner: &Arc<PoolInner>, state: &mut PoolState) {
    let inner = Arc::clone(inner);
    let name = format!("staging-worker-{}", state.workers);
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(inner))
        .expect("spawn staging worker");
    state.workers += 1;
    state.handles.push(handle);
}

fn worker_loop(inner: Arc<PoolInner>) {
    let mut state = inner.state.lock().unwrap();
    loop {
        // Dequeue wait: the first cancellation point.
        while state.queued == 0 && !state.destroying {
            state.idle += 1;
            if state.workers > inner.cfg.min_workers {
                let (next, timeout) = inner.work.wait_timeout(state, inner.cfg.linger).unwrap();
                state = next;
                state.idle -= 1;
                if timeout.timed_out()
                    && state.queued == 0
                    && state.workers > inner.cfg.min_workers
                {
                    // Lingered with nothing to do; shrink the pool.
                    state.workers -= 1;
                    inner.done.notify_all();
                    return;
                }
            } else {
                state = inner.work.wait(state).unwrap();
                state.idle -= 1;
            }
        }
        if state.destroying {
            state.workers -= 1;
            inner.done.notify_all();
            return;
        }

        state.queued -= 1;
        state.active += 1;
        drop(state);

        // The queued counter is only decremented after a matching push, so
        // the pop cannot come up empty.
        let job = inner.jobs.pop().expect("queued counter out of sync");
        inner.space.notify_one();
        job(&inner.cancel);

        state = inner.state.lock().unwrap();
        state.active -= 1;
        if state.queued == 0 && state.active == 0 {
            inner.done.notify_all();
        }
    }
}
