use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::sync::Mutex;

use foil_events::Bus;
use foil_kernel::Kernel;
use foil_policy::PolicyEngine;
use foil_providers::{LocalStubHost, NoopHost, ProviderHost};

use crate::app_state::AppState;
use crate::engine::reaper;
use crate::facility::LocalFacility;
use crate::queue::QueueSignals;
use crate::tasks::TaskManager;
use crate::util::{env_bool, state_dir};
use crate::{crashguard, router, worker};

/// Wire the service: kernel, bus, policy, providers, facility, background
/// tasks, HTTP router.
pub(crate) async fn build() -> Result<(Router, AppState, TaskManager)> {
    let dir = state_dir();
    let kernel = Kernel::open(&dir)?;
    tracing::info!(state_dir = %dir.display(), "kernel opened");

    let bus = Bus::new(256);
    let queue = Arc::new(QueueSignals::default());
    let policy = Arc::new(Mutex::new(PolicyEngine::load_from_env()));
    let host: Arc<dyn ProviderHost> = if env_bool("FOIL_PROVIDERS_NOOP") {
        Arc::new(NoopHost)
    } else {
        Arc::new(LocalStubHost)
    };
    let facility = Arc::new(LocalFacility::new(
        kernel.clone(),
        bus.clone(),
        queue.clone(),
    ));
    let state = AppState::new(bus, kernel, policy, host, facility, queue);

    crashguard::sweep_on_start(&state).await;

    let mut tasks = TaskManager::default();
    tasks.push(worker::start_local_worker(state.clone()));
    let reaper_interval = reaper::interval_secs();
    if reaper_interval > 0 {
        tasks.push(reaper::start(state.clone(), reaper_interval));
    } else {
        tracing::info!("periodic reaper disabled; manual sweeps only");
    }

    let app = router::build(state.clone()).layer(tower_http::trace::TraceLayer::new_for_http());
    Ok((app, state, tasks))
}
