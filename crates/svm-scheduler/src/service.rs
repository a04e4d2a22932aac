//! VmService — async handle to a shared scheduler.
//!
//! Wraps the scheduler in a `tokio` mutex so request handlers and tasks can
//! submit concurrently. Draining runs kernels, so it happens on the blocking
//! pool with the lock held for the whole drain.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use svm_core::{InstructionId, StreamId};

use crate::error::{SchedulerError, SchedulerResult};
use crate::instruction::VmInstructionMsg;
use crate::registry::RegistrySnapshot;
use crate::report::DrainReport;
use crate::scheduler::VpuScheduler;

#[derive(Clone)]
pub struct VmService {
    inner: Arc<Mutex<VpuScheduler>>,
}

impl VmService {
    pub fn new(scheduler: VpuScheduler) -> Self {
        Self {
            inner: Arc::new(Mutex::new(scheduler)),
        }
    }

    pub async fn submit(&self, stream: StreamId, msg: VmInstructionMsg) -> SchedulerResult<InstructionId> {
        self.inner.lock().await.submit(stream, msg)
    }

    /// Submit a batch in order, stopping at the first rejection.
    pub async fn submit_all(
        &self,
        batch: impl IntoIterator<Item = (StreamId, VmInstructionMsg)>,
    ) -> SchedulerResult<Vec<InstructionId>> {
        let mut scheduler = self.inner.lock().await;
        batch
            .into_iter()
            .map(|(stream, msg)| scheduler.submit(stream, msg))
            .collect()
    }

    pub async fn drain_all(&self) -> SchedulerResult<DrainReport> {
        let mut scheduler = self.inner.clone().lock_owned().await;
        debug!(queued = scheduler.queued_instructions(), "draining on blocking pool");
        tokio::task::spawn_blocking(move || scheduler.drain_all())
            .await
            .map_err(|e| SchedulerError::Worker(e.to_string()))?
    }

    pub async fn shutdown(&self) -> SchedulerResult<RegistrySnapshot> {
        self.inner.lock().await.shutdown()
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.inner.lock().await.snapshot()
    }

    /// Run `f` with exclusive access to the scheduler.
    pub async fn with<R>(&self, f: impl FnOnce(&mut VpuScheduler) -> R) -> R {
        let mut scheduler = self.inner.lock().await;
        f(&mut scheduler)
    }
}
