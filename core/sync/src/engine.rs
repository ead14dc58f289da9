//! Core sync engine: fetch remote data, replace local rows, record success.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use waypoint_common::{Error, News, Result, Step, StepLink, SyncRecord};
use waypoint_storage::{Database, Filter, Query, WriteTx};

use crate::remote::{NewsRecord, RemoteSource, StepRecord};
use crate::retry::{describe, RetryConfig, RetryExecutor};
use crate::scheduler::SyncRunner;
use crate::state::{KindOutcome, SyncKind, SyncPhase, SyncReport, SyncStats};

/// How long past the deadline a replace is still waited for.
const REPLACE_GRACE: Duration = Duration::from_secs(1);

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound for replacing one kind's local rows.
    pub replace_timeout: Duration,
    /// Delay reported to the scheduler after a network failure.
    pub retry_delay: Duration,
    /// Retries of a failed fetch within one run.
    pub fetch_retries: u32,
    /// Backoff before the first in-run fetch retry.
    pub retry_initial_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            replace_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(30),
            fetch_retries: 2,
            retry_initial_delay: Duration::from_secs(1),
        }
    }
}

impl SyncConfig {
    fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.fetch_retries).with_initial_delay(self.retry_initial_delay)
    }
}

/// Replaces local steps and news with the remote's, then marks pending
/// sync records as succeeded when nothing failed.
///
/// Runs are serialized; a run requested while another is in progress starts
/// after it.
pub struct SyncEngine<R: RemoteSource + ?Sized> {
    db: Database,
    remote: Arc<R>,
    retry_executor: RetryExecutor,
    config: SyncConfig,
    phase: watch::Sender<SyncPhase>,
    stats: RwLock<SyncStats>,
    run_lock: Mutex<()>,
}

impl<R: RemoteSource + 'static> SyncEngine<R> {
    /// Create a new sync engine.
    pub fn new(db: Database, remote: R, config: SyncConfig) -> Self {
        Self::from_arc(db, Arc::new(remote), config)
    }
}

impl<R: RemoteSource + ?Sized + 'static> SyncEngine<R> {
    /// Create a new sync engine from an Arc-wrapped remote.
    pub fn from_arc(db: Database, remote: Arc<R>, config: SyncConfig) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            db,
            remote,
            retry_executor: RetryExecutor::new(config.retry_config()),
            config,
            phase,
            stats: RwLock::new(SyncStats::default()),
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Watch the current phase.
    pub fn phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub async fn stats(&self) -> SyncStats {
        self.stats.read().await.clone()
    }

    fn set_phase(&self, phase: SyncPhase) {
        debug!("Sync phase: {}", phase);
        self.phase.send_replace(phase);
    }

    /// Run one sync.
    ///
    /// Steps and news are fetched concurrently and replaced independently:
    /// a failure of one kind leaves the other's fresh data in place. Pending
    /// sync records are finalized only when neither kind failed.
    pub async fn run(&self, forced: bool) -> SyncReport {
        let _guard = self.run_lock.lock().await;
        let started_at = Utc::now();
        let start = Instant::now();

        info!("Starting sync from {} (forced: {})", self.remote.name(), forced);

        self.set_phase(SyncPhase::Fetching);
        let (steps, news) = tokio::join!(self.fetch_steps(), self.fetch_news());

        self.set_phase(SyncPhase::ReplacingLocal);
        let steps = match steps {
            Ok(records) => self.replace_steps(records).await,
            Err(e) => Self::fetch_failed(SyncKind::Steps, e),
        };
        let news = match news {
            Ok(records) => self.replace_news(records).await,
            Err(e) => Self::fetch_failed(SyncKind::News, e),
        };

        let network_errors = [&steps, &news]
            .iter()
            .filter(|o| o.is_network_failure())
            .count();
        let mut persistence_failed =
            steps.is_persistence_failure() || news.is_persistence_failure();

        let mut finalized = Vec::new();
        if network_errors == 0 && !persistence_failed {
            self.set_phase(SyncPhase::FinalizingSyncRecord);
            match self.finalize().await {
                Ok(rows) => finalized = rows,
                Err(e) => {
                    error!("Failed to finalize sync records: {}", e);
                    persistence_failed = true;
                }
            }
        } else {
            debug!("Leaving pending sync records untouched");
        }

        let retry_after = (network_errors > 0).then_some(self.config.retry_delay);

        let report = SyncReport {
            forced,
            steps,
            news,
            network_errors,
            persistence_failed,
            retry_after,
            finalized,
            started_at,
            duration: start.elapsed(),
        };

        if report.is_success() {
            info!(
                "Sync completed in {:?}: {} sync record(s) finalized",
                report.duration,
                report.finalized.len()
            );
        } else {
            warn!(
                "Sync finished with errors in {:?}: {} network, persistence failed: {}",
                report.duration, report.network_errors, report.persistence_failed
            );
        }

        self.stats.write().await.record(&report);
        self.set_phase(SyncPhase::Idle);
        report
    }

    async fn fetch_steps(&self) -> Result<Vec<StepRecord>> {
        self.retry_executor
            .execute("Fetch steps", || self.remote.fetch_steps())
            .await
    }

    async fn fetch_news(&self) -> Result<Vec<NewsRecord>> {
        self.retry_executor
            .execute("Fetch news", || self.remote.fetch_news())
            .await
    }

    fn fetch_failed(kind: SyncKind, err: Error) -> KindOutcome {
        warn!("Network error fetching {}: {}", kind, describe(&err));
        KindOutcome::NetworkFailed(err.to_string())
    }

    /// Clear steps and links, then insert each step followed by its links
    /// under the step's new id. All of it commits together or not at all.
    async fn replace_steps(&self, records: Vec<StepRecord>) -> KindOutcome {
        self.replace(SyncKind::Steps, move |tx| {
            tx.clear::<StepLink>()?;
            tx.clear::<Step>()?;

            let count = records.len();
            for record in records {
                let (step, links) = record.into_parts();
                let step = tx
                    .upsert(vec![step])?
                    .pop()
                    .ok_or_else(|| Error::Persistence("Step insert wrote nothing".to_string()))?;
                let steps_id = step
                    .id
                    .ok_or_else(|| Error::Persistence("Stored step has no id".to_string()))?;

                let links: Vec<StepLink> = links.into_iter().map(|l| l.into_link(&steps_id)).collect();
                tx.upsert(links)?;
            }
            Ok(count)
        })
        .await
    }

    async fn replace_news(&self, records: Vec<NewsRecord>) -> KindOutcome {
        self.replace(SyncKind::News, move |tx| {
            tx.clear::<News>()?;
            let news: Vec<News> = records.into_iter().map(News::from).collect();
            Ok(tx.upsert(news)?.len())
        })
        .await
    }

    async fn replace<F>(&self, kind: SyncKind, write: F) -> KindOutcome
    where
        F: FnOnce(&mut WriteTx<'_>) -> Result<usize> + Send + 'static,
    {
        let db = self.db.clone();
        let timeout = self.config.replace_timeout;
        let deadline = Instant::now() + timeout;
        let mut task = tokio::task::spawn_blocking(move || db.write_until(Some(deadline), write));

        // The deadline inside the write decides the outcome. Waiting longer
        // than that only covers a write stuck before it can check it.
        let outcome = match tokio::time::timeout(timeout + REPLACE_GRACE, &mut task).await {
            Ok(Ok(Ok(count))) => KindOutcome::Replaced { count },
            Ok(Ok(Err(Error::Timeout(_)))) => KindOutcome::TimedOut,
            Ok(Ok(Err(e))) => KindOutcome::PersistenceFailed(e.to_string()),
            Ok(Err(e)) => KindOutcome::PersistenceFailed(format!("Replace task failed: {}", e)),
            Err(_) => {
                tokio::spawn(async move {
                    if let Ok(Ok(count)) = task.await {
                        warn!("Replacing {} committed {} row(s) after it was reported timed out", kind, count);
                    }
                });
                KindOutcome::TimedOut
            }
        };

        match &outcome {
            KindOutcome::Replaced { count } => info!("Replaced local {} with {} row(s)", kind, count),
            KindOutcome::TimedOut => error!("Replacing {} exceeded {:?}", kind, timeout),
            KindOutcome::PersistenceFailed(e) => error!("Database error replacing {}: {}", kind, e),
            KindOutcome::NetworkFailed(_) => {}
        }
        outcome
    }

    /// Mark every pending sync record as succeeded, creating one first when
    /// none is pending.
    async fn finalize(&self) -> Result<Vec<SyncRecord>> {
        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || {
            db.write(|tx| {
                let mut pending =
                    tx.query::<SyncRecord>(&Query::filter(Filter::eq("pending", true)))?;
                if pending.is_empty() {
                    debug!("No pending sync record; creating one");
                    pending = tx.upsert(vec![SyncRecord::pending(tx.now())])?;
                }

                let now = tx.now();
                tx.upsert(pending.into_iter().map(|s| s.succeeded(now)).collect())
            })
        });

        task.await
            .map_err(|e| Error::Persistence(format!("Finalize task failed: {}", e)))?
    }
}

#[async_trait]
impl<R: RemoteSource + ?Sized + 'static> SyncRunner for SyncEngine<R> {
    async fn run_sync(&self, forced: bool) -> SyncReport {
        self.run(forced).await
    }
}
