//! Sync run state: phases, per-kind outcomes and run reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use waypoint_common::SyncRecord;

/// Where a sync run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// No run in progress.
    Idle,
    /// Fetching steps and news from the remote.
    Fetching,
    /// Replacing local steps and news with fetched data.
    ReplacingLocal,
    /// Marking pending sync records as succeeded.
    FinalizingSyncRecord,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Fetching => write!(f, "fetching"),
            SyncPhase::ReplacingLocal => write!(f, "replacing local data"),
            SyncPhase::FinalizingSyncRecord => write!(f, "finalizing sync record"),
        }
    }
}

/// Data kinds refreshed by a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncKind {
    Steps,
    News,
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncKind::Steps => write!(f, "steps"),
            SyncKind::News => write!(f, "news"),
        }
    }
}

/// What happened to one kind during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KindOutcome {
    /// Local rows were replaced with `count` fetched rows.
    Replaced { count: usize },
    /// The fetch did not complete. Local rows are untouched.
    NetworkFailed(String),
    /// The store rejected the replace. Local rows are untouched.
    PersistenceFailed(String),
    /// The replace did not finish in time and was rolled back.
    TimedOut,
}

impl KindOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, KindOutcome::Replaced { .. })
    }

    pub fn is_network_failure(&self) -> bool {
        matches!(self, KindOutcome::NetworkFailed(_))
    }

    /// Store-side failure. A replace that timed out counts as one.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(
            self,
            KindOutcome::PersistenceFailed(_) | KindOutcome::TimedOut
        )
    }
}

/// Result of one sync run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Whether the run was requested as forced.
    pub forced: bool,
    pub steps: KindOutcome,
    pub news: KindOutcome,
    /// Kinds whose fetch did not complete.
    pub network_errors: usize,
    /// Whether the store rejected any write of this run.
    pub persistence_failed: bool,
    /// When set, the run should be retried after this delay.
    pub retry_after: Option<Duration>,
    /// Sync records marked as succeeded. Empty unless the run succeeded.
    pub finalized: Vec<SyncRecord>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl SyncReport {
    /// Whether both kinds were replaced and the run was finalized.
    pub fn is_success(&self) -> bool {
        self.network_errors == 0 && !self.persistence_failed && !self.finalized.is_empty()
    }

    /// Outcome for `kind`.
    pub fn outcome(&self, kind: SyncKind) -> &KindOutcome {
        match kind {
            SyncKind::Steps => &self.steps,
            SyncKind::News => &self.news,
        }
    }
}

/// Running totals across sync runs.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_report: Option<SyncReport>,
}

impl SyncStats {
    pub(crate) fn record(&mut self, report: &SyncReport) {
        self.runs += 1;
        if report.is_success() {
            self.successes += 1;
            self.last_success = Some(report.started_at);
        } else {
            self.failures += 1;
        }
        self.last_report = Some(report.clone());
    }
}
