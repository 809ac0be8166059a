//! Bounded worker pool
//!
//! A fixed number of workers drain a bounded job queue. Submitting awaits
//! queue space, so a saturated pool pushes back on its producer. A pool with
//! one worker runs jobs strictly in submission order.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::{Error, Result};

type Job = BoxFuture<'static, ()>;

pub struct WorkerPool {
    name: String,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks sharing a queue of `queue` pending jobs
    pub fn new(name: impl Into<String>, workers: usize, queue: usize) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>(queue.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|i| {
                let rx = Arc::clone(&rx);
                let name = name.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };

                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!("Worker {}#{} recovered from a panicking job", name, i);
                        }
                    }
                    debug!("Worker {}#{} stopped", name, i);
                })
            })
            .collect();

        Self {
            name,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job, waiting for space
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| Error::PoolClosed(self.name.clone()))?;

        tx.send(job.boxed())
            .await
            .map_err(|_| Error::PoolClosed(self.name.clone()))
    }

    /// Queue a job without waiting
    pub fn try_submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::PoolClosed(self.name.clone()))?;

        tx.try_send(job.boxed()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::PoolFull(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => Error::PoolClosed(self.name.clone()),
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Stop accepting jobs. Queued jobs still run.
    pub fn shutdown(&self) {
        self.tx.lock().take();
    }

    /// Stop accepting jobs and wait for the workers to drain the queue
    pub async fn join(&self) {
        self.shutdown();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.lock().take();
    }
}
