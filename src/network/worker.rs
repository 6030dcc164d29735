//! Worker Pool
//!
//! Fixed set of threads pulling jobs off a bounded crossbeam channel. Submitting blocks
//! while the queue is full, which pushes back on the connection reader that submitted.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

use crate::error::{HotRodError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers sharing a queue of `queue_capacity` jobs
    pub fn new(threads: usize, queue_capacity: usize) -> Result<Self> {
        let (tx, rx) = channel::bounded::<Job>(queue_capacity.max(1));
        let mut workers = Vec::with_capacity(threads.max(1));
        for idx in 0..threads.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("hotrod-worker-{}", idx))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    tracing::trace!("Worker {} exiting", idx);
                })?;
            workers.push(handle);
        }
        tracing::debug!("Started {} workers (queue {})", workers.len(), queue_capacity);
        Ok(Self { tx: Some(tx), workers })
    }

    /// Queue a job, waiting for room
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| HotRodError::Network("worker pool is shut down".to_string()))?;
        tx.send(Box::new(job))
            .map_err(|_| HotRodError::Network("worker pool is shut down".to_string()))
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.tx.as_ref().map_or(0, |tx| tx.len())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets workers finish what is queued and exit
        self.tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("Worker thread panicked");
            }
        }
    }
}
