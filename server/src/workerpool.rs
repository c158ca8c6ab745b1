// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-size worker pool consuming a bounded FIFO task queue.
//!
//! `crossbeam-channel`'s bounded channel already gives us the not-empty/not-full discipline
//! spec.md describes by hand with a mutex and two condvars, so the pool is built directly on top
//! of it rather than reimplementing that queue.

use crossbeam_channel::{bounded, Receiver, SendError, Sender};
use std::thread::{self, JoinHandle};
use tracing::warn;

/// An opaque unit of work: a closure capturing whatever connection reference it needs.
pub type Task = Box<dyn FnOnce() + Send>;

/// Fixed-size pool of worker threads draining a bounded FIFO queue.
#[derive(Debug)]
pub struct WorkerPool {
    sender: Sender<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `num_workers` threads, each pulling from a queue bounded at `queue_capacity`.
    pub fn new(num_workers: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = bounded::<Task>(queue_capacity);
        let mut workers = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let receiver: Receiver<Task> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || {
                    // `recv()` blocks on not-empty; returns Err once every sender has dropped,
                    // i.e. the pool has been destroyed and all senders released.
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self { sender, workers }
    }

    /// Enqueues `task`. Blocks the caller until space is available if the queue is full. Fails
    /// immediately if the pool has already been stopped.
    pub fn enqueue(&self, task: Task) -> Result<(), ()> {
        self.sender.send(task).map_err(|SendError(_)| {
            warn!("enqueue on stopped worker pool");
        })
    }

    /// Stops accepting new work and blocks until every worker thread has drained its current task
    /// and exited. In-flight tasks run to completion; nothing queued behind them does.
    pub fn shutdown(self) {
        // Dropping the sender (not a clone of it) closes the channel once this is the last
        // reference; `recv()` in each worker then returns `Err` and the thread exits after
        // finishing whatever it is currently running.
        let WorkerPool { sender, mut workers } = self;
        drop(sender);
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    #[test]
    fn runs_enqueued_tasks() {
        let pool = WorkerPool::new(2, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let c = Arc::clone(&counter);
            pool.enqueue(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.shutdown();
    }

    #[test]
    fn enqueue_blocks_when_queue_is_full_then_drains() {
        let pool = WorkerPool::new(1, 1);
        let started = Arc::new(std::sync::Barrier::new(2));
        let s1 = Arc::clone(&started);

        // Occupy the single worker so the queue backs up.
        pool.enqueue(Box::new(move || {
            s1.wait();
        }))
        .unwrap();

        pool.enqueue(Box::new(|| {})).unwrap();
        started.wait();
        pool.shutdown();
    }
}
