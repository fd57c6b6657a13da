//! Background executor for flush, close and merge work.

use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of worker threads fed over a channel. Dropping the executor
/// closes the channel and joins the workers after they drain it.
pub struct FlushExecutor {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl FlushExecutor {
    pub fn new(workers: usize, name: &str) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..workers.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawn background worker")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            // Send only fails when the receiver side is gone, which means
            // the executor is already shutting down.
            let _ = tx.send(Box::new(job));
        }
    }
}

impl Drop for FlushExecutor {
    fn drop(&mut self) {
        self.tx.take();
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            // A worker can hold the last owner handle and end up dropping
            // the executor itself; it must not join its own thread.
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_and_drain_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let executor = FlushExecutor::new(2, "test-worker");
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            executor.submit(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            });
        }
        drop(executor);
        assert_eq!(counter.load(Ordering::Acquire), 16);
    }
}
