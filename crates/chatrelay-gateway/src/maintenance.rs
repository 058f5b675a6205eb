//! Background maintenance: session reaping, idle slot sweeping, session flush

use chatrelay_core::AppConfig;
use chatrelay_router::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run `tick` every `period` until cancelled. The first tick is skipped.
fn periodic<F, Fut>(period: Duration, cancel: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
    })
}

pub fn spawn_maintenance(
    orchestrator: Arc<Orchestrator>,
    config: &AppConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    let ttl = Duration::from_secs(config.sessions.ttl_secs);
    let orch = orchestrator.clone();
    tasks.push(periodic(
        Duration::from_secs(config.sessions.reap_interval_secs.max(1)),
        cancel.clone(),
        move || {
            let orch = orch.clone();
            async move {
                orch.sessions().reap_expired(ttl);
            }
        },
    ));

    if let Some(idle_secs) = config.residency.idle_unload_secs {
        let idle = Duration::from_secs(idle_secs);
        let orch = orchestrator.clone();
        tasks.push(periodic(
            Duration::from_secs(config.residency.sweep_interval_secs.max(1)),
            cancel.clone(),
            move || {
                let orch = orch.clone();
                async move {
                    orch.slots().sweep_idle(idle).await;
                }
            },
        ));
    }

    if config.sessions.persist_dir.is_some() {
        let orch = orchestrator;
        tasks.push(periodic(
            Duration::from_secs(config.sessions.flush_interval_secs.max(1)),
            cancel,
            move || {
                let orch = orch.clone();
                async move {
                    if let Err(e) = orch.sessions().flush().await {
                        warn!("Session flush failed: {}", e);
                    }
                }
            },
        ));
    }

    debug!("Started {} maintenance task(s)", tasks.len());
    tasks
}
