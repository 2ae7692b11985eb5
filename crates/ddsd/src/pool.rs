//! Bounded worker pool shared by notification delivery and peer audits

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Caps the number of concurrently running network tasks
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Spawn `task`; it starts running once a worker slot is free
    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // closed only on shutdown
            let _permit = permits.acquire_owned().await.ok()?;
            Some(task.await)
        })
    }

    /// Stop handing out slots; queued tasks finish with `None`
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently holding a slot
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }
}
