// SPDX-License-Identifier: GPL-3.0-or-later
//! Worker pool for (de)compression jobs
//!
//! A fixed set of worker threads drains a FIFO of jobs. Each job is a codec
//! routine plus the source and destination files it moves data between; the
//! result is delivered through the job's completion sink, which for
//! table-bound jobs stores the error in the entry and broadcasts its signal.
//!
//! Jobs are run strictly in submission order, but no cross-job ordering is
//! enforced beyond that; a caller that needs one must chain through the
//! entry signals. Keeping at most one in-flight job per entry is the
//! dispatcher's responsibility, not the pool's.

use std::collections::VecDeque;
use std::fs::File;
use std::sync::Arc;
use std::thread::JoinHandle;

use lazfs_core::error::Errno;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// A codec routine: pure data motion between two open files.
pub type JobRoutine = fn(&File, &File) -> Result<(), Errno>;

type CompletionFn = Box<dyn FnOnce(Result<(), Errno>) + Send>;

/// One queued unit of (de)compression work.
pub struct Job {
    routine: JobRoutine,
    src: Arc<File>,
    dst: Arc<File>,
    complete: CompletionFn,
}

impl Job {
    pub fn new(
        routine: JobRoutine,
        src: Arc<File>,
        dst: Arc<File>,
        complete: impl FnOnce(Result<(), Errno>) + Send + 'static,
    ) -> Self {
        Job {
            routine,
            src,
            dst,
            complete: Box::new(complete),
        }
    }
}

struct QueueState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    available: Condvar,
}

/// Fixed-size pool of worker threads consuming a FIFO job queue.
pub struct WorkQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new(workers: usize) -> Self {
        assert!(workers >= 1, "worker pool needs at least one thread");

        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let workers = (0..workers)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("lazfs-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        WorkQueue { shared, workers }
    }

    /// Enqueue a job at the tail and wake a worker. Never blocks.
    pub fn run(&self, job: Job) {
        let mut queue = self.shared.queue.lock();
        assert!(!queue.shutdown, "job submitted to a pool being torn down");
        queue.jobs.push_back(job);
        self.shared.available.notify_one();
    }
}

impl Drop for WorkQueue {
    // Tearing the pool down with jobs still queued is a bug in the caller;
    // the queue must have been drained first.
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            assert!(
                queue.jobs.is_empty(),
                "worker pool destroyed with jobs still queued"
            );
            queue.shutdown = true;
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };

        let result = (job.routine)(&job.src, &job.dst);
        if let Err(err) = result {
            debug!(?err, "codec job failed");
        }
        (job.complete)(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn shared_file() -> Arc<File> {
        Arc::new(tempfile::tempfile().unwrap())
    }

    fn noop(_: &File, _: &File) -> Result<(), Errno> {
        Ok(())
    }

    fn failing(_: &File, _: &File) -> Result<(), Errno> {
        Err(Errno::EIO)
    }

    #[test]
    fn jobs_complete_in_fifo_order() {
        let pool = WorkQueue::new(1);
        let (tx, rx) = mpsc::channel();

        for i in 0..4u32 {
            let tx = tx.clone();
            pool.run(Job::new(noop, shared_file(), shared_file(), move |res| {
                res.unwrap();
                tx.send(i).unwrap();
            }));
        }

        let order: Vec<u32> = (0..4).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn routine_errors_reach_the_completion_sink() {
        let pool = WorkQueue::new(2);
        let (tx, rx) = mpsc::channel();

        pool.run(Job::new(failing, shared_file(), shared_file(), move |res| {
            tx.send(res).unwrap();
        }));

        assert_eq!(rx.recv().unwrap(), Err(Errno::EIO));
    }

    #[test]
    fn teardown_joins_idle_workers() {
        let pool = WorkQueue::new(3);
        drop(pool);
    }
}
