//! Fixed-size pool of delivery workers.

use tokio::task::JoinSet;

use crate::worker::{DeliveryServices, DeliveryWorker, WorkerError};

pub struct WorkerPool {
    workers: JoinSet<Result<(), WorkerError>>,
}

impl WorkerPool {
    /// Spawn `count` workers sharing `services`. Worker ids are
    /// `{prefix}-{n}`; the prefix should be unique per process so leases
    /// from different instances never collide.
    pub fn start(count: usize, prefix: &str, services: DeliveryServices) -> Self {
        let mut workers = JoinSet::new();
        for n in 0..count {
            let worker = DeliveryWorker::new(format!("{prefix}-{n}"), services.clone());
            workers.spawn(worker.run());
        }

        tracing::info!(count, prefix, "Worker pool started");
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Resolve when the first worker stops. Workers only stop on a fatal
    /// storage error, so this is an error in practice.
    pub async fn wait(&mut self) -> anyhow::Result<()> {
        match self.workers.join_next().await {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(e))) => Err(e.into()),
            Some(Err(e)) => Err(anyhow::anyhow!("worker task failed: {e}")),
        }
    }

    pub async fn shutdown(mut self) {
        self.workers.shutdown().await;
        tracing::info!("Worker pool stopped");
    }
}
