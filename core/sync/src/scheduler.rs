//! Sync scheduling: immediate runs and a jittered, coalesced delayed trigger.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use waypoint_common::{Error, Result};

use crate::state::SyncReport;

/// Something that can perform a sync run.
#[async_trait]
pub trait SyncRunner: Send + Sync + 'static {
    async fn run_sync(&self, forced: bool) -> SyncReport;
}

/// Entry point for requesting syncs.
pub trait SyncTrigger: Send + Sync {
    /// Request a sync. See [`SyncScheduler::enqueue_sync`].
    fn enqueue_sync(&self, force_now: bool) -> Enqueued;
}

/// What a call to `enqueue_sync` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A run was started right away.
    Started,
    /// A delayed trigger was armed to fire after the given delay.
    Armed(Duration),
    /// A delayed trigger was already armed; nothing changed.
    Coalesced,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delayed triggers fire after a uniformly random delay in `[0, max_jitter)`.
    pub max_jitter: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jitter: Duration::from_secs(10 * 60),
        }
    }
}

impl SchedulerConfig {
    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }
}

struct Armed {
    generation: u64,
    task: JoinHandle<()>,
}

struct Inner<R: SyncRunner> {
    runner: Arc<R>,
    config: SchedulerConfig,
    runtime: Handle,
    armed: Mutex<Option<Armed>>,
    next_generation: AtomicU64,
}

/// Decides when the sync runner runs.
///
/// Forced requests start a run at once. Unforced requests arm one delayed
/// trigger with random jitter; further unforced requests are absorbed until
/// it fires. A run that asks for a retry arms the delayed trigger for the
/// requested delay. Nothing survives a restart.
pub struct SyncScheduler<R: SyncRunner> {
    inner: Arc<Inner<R>>,
}

impl<R: SyncRunner> Clone for SyncScheduler<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: SyncRunner> SyncScheduler<R> {
    /// Create a scheduler spawning onto the current tokio runtime.
    ///
    /// # Errors
    /// - `InvalidInput` when called outside a tokio runtime
    pub fn new(runner: Arc<R>, config: SchedulerConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::InvalidInput(format!("Scheduler needs a tokio runtime: {}", e)))?;
        Ok(Self::with_runtime(runner, config, runtime))
    }

    /// Create a scheduler spawning onto `runtime`.
    pub fn with_runtime(runner: Arc<R>, config: SchedulerConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                config,
                runtime,
                armed: Mutex::new(None),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.inner.runner
    }

    /// Request a sync.
    ///
    /// With `force_now` the runner starts immediately, whether or not a
    /// delayed trigger is armed; the armed trigger stays armed. Without it,
    /// an armed trigger absorbs the request, and otherwise one is armed with
    /// a random delay below `max_jitter`.
    pub fn enqueue_sync(&self, force_now: bool) -> Enqueued {
        if force_now {
            info!("Starting forced sync");
            Self::spawn_run(&self.inner, true);
            Enqueued::Started
        } else {
            Self::arm(&self.inner, self.inner.config.jitter())
        }
    }

    /// Run the runner now and wait for its report.
    ///
    /// A report asking for a retry arms the delayed trigger, as for runs
    /// started by [`SyncScheduler::enqueue_sync`].
    pub async fn run_now(&self, forced: bool) -> SyncReport {
        Self::run(&self.inner, forced).await
    }

    /// Whether a delayed trigger is armed and has not fired yet.
    pub fn is_armed(&self) -> bool {
        self.inner
            .armed
            .lock()
            .map(|armed| armed.as_ref().is_some_and(|a| !a.task.is_finished()))
            .unwrap_or(false)
    }

    /// Disarm the delayed trigger. Runs already started are not affected.
    pub fn shutdown(&self) {
        if let Ok(mut armed) = self.inner.armed.lock() {
            if let Some(armed) = armed.take() {
                armed.task.abort();
                info!("Sync scheduler stopped; delayed trigger disarmed");
            }
        }
    }

    async fn run(inner: &Arc<Inner<R>>, forced: bool) -> SyncReport {
        let report = inner.runner.run_sync(forced).await;
        if let Some(delay) = report.retry_after {
            debug!("Sync asked for a retry in {:?}", delay);
            Self::arm(inner, delay);
        }
        report
    }

    fn spawn_run(inner: &Arc<Inner<R>>, forced: bool) {
        let inner = inner.clone();
        inner.runtime.clone().spawn(async move {
            Self::run(&inner, forced).await;
        });
    }

    fn arm(inner: &Arc<Inner<R>>, delay: Duration) -> Enqueued {
        let Ok(mut armed) = inner.armed.lock() else {
            warn!("Scheduler state poisoned; starting sync without delay");
            Self::spawn_run(inner, false);
            return Enqueued::Started;
        };

        if armed.as_ref().is_some_and(|a| !a.task.is_finished()) {
            debug!("Delayed sync already armed; coalescing request");
            return Enqueued::Coalesced;
        }

        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);

        let task_inner = inner.clone();
        let task = inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // Disarm before running so requests made during the run arm anew.
            if let Ok(mut armed) = task_inner.armed.lock() {
                if armed.as_ref().is_some_and(|a| a.generation == generation) {
                    *armed = None;
                }
            }
            debug!("Delayed sync trigger fired");
            Self::run(&task_inner, false).await;
        });

        info!("Delayed sync armed to fire in {:?}", delay);
        *armed = Some(Armed { generation, task });
        Enqueued::Armed(delay)
    }
}

impl<R: SyncRunner> SyncTrigger for SyncScheduler<R> {
    fn enqueue_sync(&self, force_now: bool) -> Enqueued {
        SyncScheduler::enqueue_sync(self, force_now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::KindOutcome;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;

    /// Counts runs; reports a retry while `fail_runs` is positive.
    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicU32,
        forced_runs: AtomicU32,
        fail_runs: AtomicU32,
    }

    #[async_trait]
    impl SyncRunner for CountingRunner {
        async fn run_sync(&self, forced: bool) -> SyncReport {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if forced {
                self.forced_runs.fetch_add(1, Ordering::SeqCst);
            }
            let failing = self
                .fail_runs
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            let outcome = if failing {
                KindOutcome::NetworkFailed("down".to_string())
            } else {
                KindOutcome::Replaced { count: 0 }
            };
            SyncReport {
                forced,
                steps: outcome.clone(),
                news: KindOutcome::Replaced { count: 0 },
                network_errors: usize::from(failing),
                persistence_failed: false,
                retry_after: failing.then_some(Duration::from_secs(30)),
                finalized: Vec::new(),
                started_at: Utc::now(),
                duration: Duration::ZERO,
            }
        }
    }

    fn scheduler() -> (Arc<CountingRunner>, SyncScheduler<CountingRunner>) {
        let runner = Arc::new(CountingRunner::default());
        let scheduler = SyncScheduler::new(runner.clone(), SchedulerConfig::default()).unwrap();
        (runner, scheduler)
    }

    async fn advance(duration: Duration) {
        tokio::time::sleep(duration).await;
        // Let spawned runs finish.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_now_runs_immediately() {
        let (runner, scheduler) = scheduler();

        assert_eq!(scheduler.enqueue_sync(true), Enqueued::Started);
        advance(Duration::from_millis(1)).await;

        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.forced_runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unforced_requests_coalesce() {
        let (runner, scheduler) = scheduler();

        let first = scheduler.enqueue_sync(false);
        assert!(matches!(first, Enqueued::Armed(d) if d < Duration::from_secs(600)));
        assert_eq!(scheduler.enqueue_sync(false), Enqueued::Coalesced);
        assert!(scheduler.is_armed());

        advance(Duration::from_secs(601)).await;

        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.forced_runs.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearms_after_firing() {
        let (runner, scheduler) = scheduler();

        scheduler.enqueue_sync(false);
        advance(Duration::from_secs(601)).await;
        assert!(matches!(scheduler.enqueue_sync(false), Enqueued::Armed(_)));
        advance(Duration::from_secs(601)).await;

        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_bypasses_armed_trigger() {
        let (runner, scheduler) = scheduler();

        scheduler.enqueue_sync(false);
        scheduler.enqueue_sync(true);
        advance(Duration::from_millis(1)).await;
        assert_eq!(runner.forced_runs.load(Ordering::SeqCst), 1);

        advance(Duration::from_secs(601)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_arms_retry() {
        let (runner, scheduler) = scheduler();
        runner.fail_runs.store(1, Ordering::SeqCst);

        let report = scheduler.run_now(true).await;
        assert_eq!(report.retry_after, Some(Duration::from_secs(30)));
        assert!(scheduler.is_armed());

        advance(Duration::from_secs(31)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disarms() {
        let (runner, scheduler) = scheduler();

        scheduler.enqueue_sync(false);
        scheduler.shutdown();
        advance(Duration::from_secs(601)).await;

        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_jitter_bounds() {
        let config = SchedulerConfig {
            max_jitter: Duration::from_secs(5),
        };
        for _ in 0..100 {
            assert!(config.jitter() < Duration::from_secs(5));
        }

        let none = SchedulerConfig {
            max_jitter: Duration::ZERO,
        };
        assert_eq!(none.jitter(), Duration::ZERO);
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let runner = Arc::new(CountingRunner::default());
        let result = SyncScheduler::new(runner, SchedulerConfig::default());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
