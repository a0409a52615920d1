/// Background workers: the small fixed set of tokio tasks that drive the
/// processes of a running vault.
///
/// - bleed consumer (queue driven)
/// - archival, compaction, GC and coherence, each on its own interval
///
/// File work runs under `spawn_blocking`. Shutdown sets a flag, wakes every
/// task through a shared `Notify`, cancels in-progress passes and joins the
/// handles.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::core::VaultInner;
use crate::error::{VaultError, VaultResult};
use crate::types::now_nanos;

type Pass = fn(&VaultInner) -> VaultResult<()>;

#[derive(Debug, Clone)]
struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Handles of the running background tasks.
#[derive(Debug)]
pub struct BackgroundWorkers {
    shutdown: Shutdown,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundWorkers {
    /// Spawn every worker on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when called outside a tokio runtime.
    pub(crate) fn spawn(vault: Arc<VaultInner>) -> VaultResult<Self> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| VaultError::InvalidConfig(format!("background workers need a tokio runtime: {}", e)))?;

        let shutdown = Shutdown {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        };
        let workers = &vault.config.workers;
        let schedule: [(&'static str, u64, Pass); 4] = [
            ("archival", workers.archival_interval_secs, |v| {
                v.archive_pass_at(now_nanos()).map(|_| ())
            }),
            ("compaction", workers.compaction_interval_secs, |v| v.compact().map(|_| ())),
            ("gc", workers.gc_interval_secs, |v| {
                v.collect_garbage_at(now_nanos()).map(|_| ())
            }),
            ("coherence", workers.coherence_interval_secs, |v| v.coherence_pass().map(|_| ())),
        ];

        let mut handles = vec![spawn_bleed_consumer(Arc::clone(&vault), shutdown.clone())];
        for (name, secs, pass) in schedule {
            handles.push(spawn_periodic(
                Arc::clone(&vault),
                shutdown.clone(),
                name,
                Duration::from_secs(secs.max(1)),
                pass,
            ));
        }
        info!(tasks = handles.len(), "background workers started");
        Ok(Self { shutdown, handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every task and wait for it to finish.
    pub(crate) async fn shutdown(self, vault: &VaultInner) {
        self.shutdown.flag.store(true, Ordering::Release);
        vault.cancel.cancel();
        self.shutdown.notify.notify_waiters();

        for result in join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "background worker panicked");
            }
        }
        vault.cancel.reset();
        info!("background workers stopped");
    }
}

fn spawn_bleed_consumer(vault: Arc<VaultInner>, shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let notified = shutdown.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if shutdown.is_set() {
                break;
            }

            let job = tokio::select! {
                job = vault.processes.bleed.next_job() => job,
                _ = &mut notified => break,
            };
            let Some(job) = job else { break };

            let inner = Arc::clone(&vault);
            let handled = tokio::task::spawn_blocking(move || inner.processes.bleed.handle(&inner, job)).await;
            if let Err(e) = handled {
                warn!(error = %e, "bleed job panicked");
            }
        }
        debug!(task = "bleed", "worker stopped");
    })
}

fn spawn_periodic(
    vault: Arc<VaultInner>,
    shutdown: Shutdown,
    name: &'static str,
    period: Duration,
    pass: Pass,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            let notified = shutdown.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if shutdown.is_set() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut notified => break,
            }

            let inner = Arc::clone(&vault);
            match tokio::task::spawn_blocking(move || pass(&inner)).await {
                Ok(Ok(())) => debug!(task = name, "pass complete"),
                Ok(Err(e)) => warn!(task = name, error = %e, "background pass failed"),
                Err(e) => warn!(task = name, error = %e, "background pass panicked"),
            }
        }
        debug!(task = name, "worker stopped");
    })
}
