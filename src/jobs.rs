//! Minimal job-system surface the scheduler runs on.
//!
//! The core only needs submit and wait; tasks are non-reentrant and run to
//! completion on one worker. [`RayonJobs`] backs the interface with a rayon
//! thread pool (work-stealing continues around blocked access waits);
//! [`ImmediateJobs`] runs tasks inline for deterministic tests and tools.

use crossbeam_channel::{bounded, Receiver};

/// Completion handle of a submitted task. Dropping the handle releases it
/// without waiting.
pub struct JobHandle {
    done: Option<Receiver<()>>,
}

impl JobHandle {
    fn completed() -> JobHandle {
        JobHandle { done: None }
    }

    fn pending(done: Receiver<()>) -> JobHandle {
        JobHandle { done: Some(done) }
    }

    /// Blocks until the task finished.
    pub fn wait(self) {
        if let Some(done) = self.done {
            let _ = done.recv();
        }
    }
}

pub trait JobSystem: Send + Sync {
    fn submit(&self, task: Box<dyn FnOnce() + Send>) -> JobHandle;
}

/// Rayon-backed job system.
pub struct RayonJobs {
    pool: rayon::ThreadPool,
}

impl RayonJobs {
    pub fn new(threads: usize) -> Result<RayonJobs, rayon::ThreadPoolBuildError> {
        Ok(RayonJobs {
            pool: rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()?,
        })
    }
}

impl JobSystem for RayonJobs {
    fn submit(&self, task: Box<dyn FnOnce() + Send>) -> JobHandle {
        let (sender, receiver) = bounded(1);
        self.pool.spawn(move || {
            task();
            let _ = sender.send(());
        });
        JobHandle::pending(receiver)
    }
}

/// Runs every task inline on the submitting thread.
#[derive(Default)]
pub struct ImmediateJobs;

impl JobSystem for ImmediateJobs {
    fn submit(&self, task: Box<dyn FnOnce() + Send>) -> JobHandle {
        task();
        JobHandle::completed()
    }
}
