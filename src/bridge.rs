//! Synchronous bridge onto a dedicated async worker.
//!
//! All BLE I/O runs on one background thread hosting a single-threaded tokio
//! runtime. Other threads submit futures over a channel and block on a
//! per-request oneshot until the worker has driven them to completion.

use std::future::Future;
use std::pin::Pin;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{Error, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct EventLoop {
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Start the worker thread and its runtime
    pub fn start(name: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        tokio::spawn(job);
                    }
                });
                // Dropping the runtime cancels whatever is still spawned,
                // notification pumps included.
                drop(runtime);
                debug!("BLE thread ended.");
            })?;
        debug!("BLE thread started.");
        Ok(EventLoop {
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Run `fut` on the worker and block until it yields.
    ///
    /// Must not be called from the worker itself.
    pub fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = reply_tx.send(fut.await);
        });
        {
            let jobs = self.jobs.lock();
            let sender = jobs.as_ref().ok_or(Error::LoopStopped)?;
            sender.send(job).map_err(|_| Error::LoopStopped)?;
        }
        let result = reply_rx.blocking_recv().map_err(|_| Error::LoopStopped)?;
        if let Err(Error::Ble(e)) = &result {
            error!("BLE stack error: {}. Try restarting the Bluetooth service.", e);
        }
        result
    }

    /// Spawn a background task on the worker without waiting for it
    pub fn spawn<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let jobs = self.jobs.lock();
        let sender = jobs.as_ref().ok_or(Error::LoopStopped)?;
        sender.send(Box::pin(fut)).map_err(|_| Error::LoopStopped)
    }

    pub fn is_running(&self) -> bool {
        self.jobs.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Stop the worker and join it. Idempotent.
    pub fn stop(&self) {
        self.jobs.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("BLE thread panicked");
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
