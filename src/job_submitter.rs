//! C6 — Job Submitter: runs the three-step `createJob`/`uploadPayload`/`startJob` sequence
//! against bounded concurrency, with a per-step timeout (§4.6).
use crate::error::SubmissionError;
use crate::platform_client::{JobsService, PayloadsService};
use crate::storage_gate::StorageGate;
use crate::types::{JobReceipt, Priority};
use camino::Utf8Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Stateless C6 front (§4.6: "C6 is stateless; concurrency = bounded worker pool"). The
/// `Semaphore` is the pool: at most `submission_workers` calls to [`JobSubmitter::submit`] are
/// mid-flight across the whole process at once.
pub struct JobSubmitter {
    jobs: Arc<dyn JobsService>,
    payloads: Arc<dyn PayloadsService>,
    storage_gate: Arc<dyn StorageGate>,
    permits: Arc<Semaphore>,
    rpc_timeout: Duration,
}

impl JobSubmitter {
    pub fn new(
        jobs: Arc<dyn JobsService>,
        payloads: Arc<dyn PayloadsService>,
        storage_gate: Arc<dyn StorageGate>,
        worker_count: std::num::NonZeroUsize,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            payloads,
            storage_gate,
            permits: Arc::new(Semaphore::new(worker_count.get())),
            rpc_timeout,
        }
    }

    /// Runs one attempt of the three steps for `(pipeline_id, job_name)` against `files`.
    /// Acquires a worker-pool permit for the whole attempt (§4.6). `createJob` is not retried
    /// within this call — a failure here is a single failed attempt, never resubmitted with
    /// the same receipt (§4.6: "the core treats step 1 as not retryable within one attempt").
    pub async fn submit(
        &self,
        pipeline_id: &str,
        job_name: &str,
        priority: Priority,
        files: &[&Utf8Path],
    ) -> Result<JobReceipt, SubmissionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("submitter semaphore is never closed");

        let receipt = self
            .with_timeout(self.jobs.create_job(pipeline_id, job_name, priority))
            .await
            .map_err(SubmissionError::CreateJob)?;

        // C1 is queried again here, not just at association accept (§2): storage may have
        // crossed the watermark in the time since the instances backing this batch were
        // received.
        if !self.storage_gate.can_export() {
            return Err(SubmissionError::ExportDenied);
        }

        self.with_timeout(self.payloads.upload_payload(&receipt.payload_id, files))
            .await
            .map_err(SubmissionError::UploadPayload)?;

        self.with_timeout(self.jobs.start_job(&receipt))
            .await
            .map_err(SubmissionError::StartJob)?;

        Ok(receipt)
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "RPC exceeded timeout of {:?}",
                self.rpc_timeout
            )),
        }
    }
}
