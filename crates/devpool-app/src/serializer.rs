//! FIFO execution of mutating pool operations
//!
//! Every job submitted here runs to completion before the next one starts,
//! in submission order. A job that fails or panics does not stop the queue;
//! its outcome is handed back to the submitter and the worker moves on.

use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use devpool_core::prelude::*;

type Job = BoxFuture<'static, ()>;

/// Handle for submitting jobs to the serializer worker
#[derive(Debug, Clone)]
pub struct OperationSerializer {
    tx: mpsc::UnboundedSender<Job>,
}

impl OperationSerializer {
    /// Spawn the worker task
    ///
    /// The worker exits once every `OperationSerializer` clone is dropped
    /// and the queue is drained.
    pub fn start() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(rx));
        (Self { tx }, worker)
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            // Run on its own task so a panic is contained
            if let Err(e) = tokio::spawn(job).await {
                error!("Serialized operation panicked: {}", e);
            }
        }
        debug!("Operation serializer stopped");
    }

    /// Queue `operation` and wait for its result
    ///
    /// Dropping the returned future does not cancel the queued job.
    pub async fn submit<T, F>(&self, name: &'static str, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = async move {
            let result = operation.await;
            if let Err(ref e) = result {
                log_failure(name, e);
            }
            let _ = reply_tx.send(result);
        }
        .boxed();

        self.tx.send(job).map_err(|_| Error::ChannelClosed)?;

        reply_rx
            .await
            .map_err(|_| Error::operation_aborted(name))?
    }

    /// Queue `operation` without waiting; failures are only logged
    pub fn submit_detached<F>(&self, name: &'static str, operation: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let job = async move {
            if let Err(e) = operation.await {
                log_failure(name, &e);
            }
        }
        .boxed();

        self.tx.send(job).map_err(|_| Error::ChannelClosed)
    }
}

fn log_failure(name: &str, e: &Error) {
    if e.is_fatal() {
        error!("Operation {} failed: {}", name, e);
    } else {
        warn!(recoverable = e.is_recoverable(), "Operation {} failed: {}", name, e);
    }
}
