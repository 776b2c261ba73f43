use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use foil_kernel::Kernel;

use crate::queue::QueueSignals;

#[derive(Debug, thiserror::Error)]
pub enum FacilityError {
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Receipt for submitted work. `reused` means an idempotency key matched an
/// earlier submission and no new job was enqueued.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: String,
    pub reused: bool,
}

/// Seam between the engine and whatever executes durable work. The local
/// implementation runs jobs in-process; a hosted runner would submit to an
/// external workflow service behind the same trait.
#[async_trait]
pub trait ExecutionFacility: Send + Sync {
    async fn submit(
        &self,
        kind: &str,
        payload: Value,
        idem_key: Option<String>,
    ) -> Result<JobHandle, FacilityError>;

    /// Signal a suspended workflow that its decision arrived. Best-effort:
    /// callers log failures and move on.
    async fn complete_waitpoint(&self, token: &str, signal: Value) -> Result<(), FacilityError>;
}

/// Facility backed by the kernel job table and the in-process worker.
pub struct LocalFacility {
    kernel: Kernel,
    bus: foil_events::Bus,
    queue: Arc<QueueSignals>,
}

impl LocalFacility {
    pub(crate) fn new(kernel: Kernel, bus: foil_events::Bus, queue: Arc<QueueSignals>) -> Self {
        Self { kernel, bus, queue }
    }
}

#[async_trait]
impl ExecutionFacility for LocalFacility {
    async fn submit(
        &self,
        kind: &str,
        payload: Value,
        idem_key: Option<String>,
    ) -> Result<JobHandle, FacilityError> {
        if let Some(key) = idem_key.as_deref() {
            if let Some(existing) = self
                .kernel
                .find_job_by_idem_async(key.to_string())
                .await
                .map_err(FacilityError::Internal)?
            {
                return Ok(JobHandle {
                    job_id: existing,
                    reused: true,
                });
            }
        }
        let id = uuid::Uuid::new_v4().to_string();
        let inserted = self
            .kernel
            .insert_job_async(id.clone(), kind.to_string(), payload, idem_key.clone())
            .await
            .map_err(FacilityError::Internal)?;
        if !inserted {
            // Lost an idem-key race; the earlier submission wins.
            if let Some(key) = idem_key.as_deref() {
                if let Some(existing) = self
                    .kernel
                    .find_job_by_idem_async(key.to_string())
                    .await
                    .map_err(FacilityError::Internal)?
                {
                    return Ok(JobHandle {
                        job_id: existing,
                        reused: true,
                    });
                }
            }
            return Err(FacilityError::Rejected("duplicate job id".into()));
        }
        self.bus.publish(
            foil_topics::TOPIC_JOBS_SUBMITTED,
            &json!({"job_id": id, "kind": kind}),
        );
        self.queue.wake();
        Ok(JobHandle {
            job_id: id,
            reused: false,
        })
    }

    async fn complete_waitpoint(&self, token: &str, signal: Value) -> Result<(), FacilityError> {
        // Local runs never actually suspend; the token is bookkeeping.
        tracing::debug!(%token, %signal, "waitpoint completion (local no-op)");
        Ok(())
    }
}
