//! Shared fixtures for engine and API tests: a fully wired `AppState` over a
//! temp-dir kernel, plus facility/host wrappers with failure injection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;

use foil_events::Bus;
use foil_kernel::{Kernel, NewProposal};
use foil_policy::{PolicyConfig, PolicyEngine};
use foil_providers::{LocalStubHost, ProviderError, ProviderHost};

use crate::app_state::AppState;
use crate::facility::{ExecutionFacility, FacilityError, JobHandle, LocalFacility};
use crate::queue::QueueSignals;

/// Facility that records every submission and can be told to fail the next
/// one, while delegating real work to the local kernel-backed facility.
pub(crate) struct RecordingFacility {
    inner: LocalFacility,
    submissions: Mutex<Vec<(String, Value)>>,
    fail_next: AtomicBool,
}

impl RecordingFacility {
    fn new(inner: LocalFacility) -> Self {
        Self {
            inner,
            submissions: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn fail_next_submit(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn submissions(&self, kind: &str) -> Vec<Value> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == kind)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl ExecutionFacility for RecordingFacility {
    async fn submit(
        &self,
        kind: &str,
        payload: Value,
        idem_key: Option<String>,
    ) -> Result<JobHandle, FacilityError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(FacilityError::Rejected("injected submit failure".into()));
        }
        let handle = self.inner.submit(kind, payload.clone(), idem_key).await?;
        self.submissions
            .lock()
            .unwrap()
            .push((kind.to_string(), payload));
        Ok(handle)
    }

    async fn complete_waitpoint(&self, token: &str, signal: Value) -> Result<(), FacilityError> {
        self.inner.complete_waitpoint(token, signal).await
    }
}

/// Stub provider host with per-capability failure injection.
pub(crate) struct RecordingHost {
    inner: LocalStubHost,
    failing: Mutex<HashSet<String>>,
}

impl RecordingHost {
    fn new() -> Self {
        Self {
            inner: LocalStubHost,
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_capability(&self, capability: &str) {
        self.failing.lock().unwrap().insert(capability.to_string());
    }
}

#[async_trait]
impl ProviderHost for RecordingHost {
    async fn invoke(&self, capability: &str, input: &Value) -> Result<Value, ProviderError> {
        if self.failing.lock().unwrap().contains(capability) {
            return Err(ProviderError::Runtime(format!(
                "injected failure for {capability}"
            )));
        }
        self.inner.invoke(capability, input).await
    }
}

pub(crate) struct TestHarness {
    pub state: AppState,
    pub facility: Arc<RecordingFacility>,
    pub host: Arc<RecordingHost>,
    _dir: tempfile::TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_policy(PolicyConfig::default()).await
    }

    pub async fn with_policy(policy: PolicyConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let bus = Bus::new(64);
        let queue = Arc::new(QueueSignals::default());
        let facility = Arc::new(RecordingFacility::new(LocalFacility::new(
            kernel.clone(),
            bus.clone(),
            queue.clone(),
        )));
        let host = Arc::new(RecordingHost::new());
        let state = AppState::new(
            bus,
            kernel,
            Arc::new(AsyncMutex::new(PolicyEngine::with_config(policy))),
            host.clone(),
            facility.clone(),
            queue,
        );
        Self {
            state,
            facility,
            host,
            _dir: dir,
        }
    }

    pub async fn seed_case(&self, id: &str, autopilot_mode: &str) {
        self.state
            .kernel()
            .insert_case_async(
                id.to_string(),
                format!("Case {id}"),
                "active".to_string(),
                autopilot_mode.to_string(),
            )
            .await
            .expect("seed case");
    }

    pub async fn seed_pending_proposal(&self, id: &str, case_id: &str) {
        let inserted = self
            .state
            .kernel()
            .insert_proposal_async(NewProposal {
                id: id.to_string(),
                case_id: case_id.to_string(),
                trigger_message_id: None,
                action_type: "send_followup".to_string(),
                draft_subject: Some("Re: records request".to_string()),
                draft_body: Some("Following up on the status of this request.".to_string()),
                fee_amount: None,
                reasoning: json!(["no agency reply within the follow-up window"]),
                confidence: 0.8,
                risk_flags: json!([]),
                warnings: json!([]),
                can_auto_execute: false,
                requires_human: true,
                pause_reason: Some("awaiting_approval".to_string()),
                waitpoint_token: Some(format!("wp-{id}")),
                status: "pending_approval".to_string(),
                adjustment_count: 0,
            })
            .await
            .expect("seed proposal");
        assert!(inserted, "seed proposal collided with an open one");
    }

    pub async fn seed_paused_run(&self, id: &str, case_id: &str, proposal_id: &str) {
        let k = self.state.kernel();
        k.insert_run_async(
            id.to_string(),
            case_id.to_string(),
            "followup_trigger".to_string(),
            false,
            None,
            false,
            None,
            json!({}),
        )
        .await
        .expect("seed run");
        k.set_run_status_async(id.to_string(), "paused".to_string(), None)
            .await
            .expect("pause run");
        k.set_run_proposal_async(id.to_string(), proposal_id.to_string())
            .await
            .expect("link proposal");
    }

    /// Shift a run's `updated` timestamp into the past, for staleness tests.
    pub async fn backdate_run(&self, id: &str, secs: u64) {
        let past = (chrono::Utc::now() - chrono::Duration::seconds(secs as i64))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let conn = rusqlite::Connection::open(self.state.kernel().db_path()).expect("db");
        conn.execute(
            "UPDATE runs SET updated=?1 WHERE id=?2",
            rusqlite::params![past, id],
        )
        .expect("backdate");
    }
}
