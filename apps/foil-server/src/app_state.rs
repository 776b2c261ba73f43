use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use foil_events::Bus;
use foil_kernel::Kernel;
use foil_policy::PolicyEngine;
use foil_providers::ProviderHost;

use crate::engine::coordinator::CaseLocks;
use crate::engine::reaper::ReaperStatus;
use crate::facility::ExecutionFacility;
use crate::queue::QueueSignals;

#[derive(Clone)]
pub(crate) struct AppState {
    bus: Bus,
    kernel: Kernel,
    policy: Arc<Mutex<PolicyEngine>>,
    host: Arc<dyn ProviderHost>,
    facility: Arc<dyn ExecutionFacility>,
    locks: Arc<CaseLocks>,
    queue: Arc<QueueSignals>,
    reaper: Arc<ReaperStatus>,
}

impl AppState {
    pub fn new(
        bus: Bus,
        kernel: Kernel,
        policy: Arc<Mutex<PolicyEngine>>,
        host: Arc<dyn ProviderHost>,
        facility: Arc<dyn ExecutionFacility>,
        queue: Arc<QueueSignals>,
    ) -> Self {
        Self {
            bus,
            kernel,
            policy,
            host,
            facility,
            locks: Arc::new(CaseLocks::default()),
            queue,
            reaper: Arc::new(ReaperStatus::default()),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn policy(&self) -> Arc<Mutex<PolicyEngine>> {
        self.policy.clone()
    }

    pub fn host(&self) -> Arc<dyn ProviderHost> {
        self.host.clone()
    }

    pub fn facility(&self) -> Arc<dyn ExecutionFacility> {
        self.facility.clone()
    }

    pub fn locks(&self) -> Arc<CaseLocks> {
        self.locks.clone()
    }

    pub fn queue(&self) -> Arc<QueueSignals> {
        self.queue.clone()
    }

    pub fn reaper_status(&self) -> Arc<ReaperStatus> {
        self.reaper.clone()
    }

    /// Publish on the live bus and append to the durable event ledger.
    pub async fn publish(&self, kind: &str, payload: &Value) {
        let env = self.bus.publish(kind, payload);
        if let Err(e) = self.kernel.append_event_async(env).await {
            tracing::warn!(%kind, error = %e, "failed to persist event");
        }
    }
}
