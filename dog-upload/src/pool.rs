use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

use crate::{UploadConfig, UploadError, UploadResult};

type Task = BoxFuture<'static, ()>;

/// Fixed set of workers draining one bounded task queue
///
/// A pool is an ordinary value: build one per upload, or wrap it in an `Arc` and hand it to
/// several uploaders to share the workers. Must be created inside a Tokio runtime.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
    queue_depth: usize,
}

impl WorkerPool {
    /// Spawn `workers` workers behind a queue of `queue_depth` pending tasks
    ///
    /// Both values are raised to at least 1, and the queue is never smaller than the worker
    /// count.
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let size = workers.max(1);
        let queue_depth = queue_depth.max(size);
        let (sender, receiver) = mpsc::channel::<Task>(queue_depth);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..size)
            .map(|index| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let task = { receiver.lock().await.recv().await };
                        let Some(task) = task else { break };
                        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                            error!("Upload worker {} recovered from a panicking task", index);
                        }
                    }
                    debug!("Upload worker {} stopped", index);
                })
            })
            .collect();

        debug!("Started worker pool with {} workers, queue depth {}", size, queue_depth);

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            size,
            queue_depth,
        }
    }

    /// Pool sized from normalized upload settings
    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.effective_workers(), config.effective_queue_depth())
    }

    /// Enqueue a task, waiting while the queue is full
    ///
    /// The task runs inside the caller's current span.
    pub async fn submit<F>(&self, task: F) -> UploadResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| UploadError::invalid("Worker pool is shut down"))?;
        sender
            .send(task.in_current_span().boxed())
            .await
            .map_err(|_| UploadError::invalid("Worker pool is shut down"))
    }

    /// Stop accepting tasks, let queued ones finish and wait for the workers to exit
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!("Upload worker ended abnormally: {}", err);
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}
