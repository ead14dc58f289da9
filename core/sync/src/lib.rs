//! Waypoint Sync Engine
//!
//! This module keeps the local store in step with the remote service:
//! - Remote source abstraction with in-memory and file-backed sources
//! - Sync engine replacing local steps and news and recording success
//! - Scheduler with immediate runs and a jittered, coalesced delayed trigger
//! - Retry strategy with exponential backoff for transient failures
//! - Push registration and push-message handling

pub mod engine;
pub mod registration;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use engine::{SyncConfig, SyncEngine};
pub use registration::{PushHandler, RegistrationService, NEWS_TOPIC, SYNC_TOPIC};
pub use remote::{
    FailureMode, FileRemote, MemoryRemote, NewsRecord, RemoteSource, StepLinkRecord, StepRecord,
};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{Enqueued, SchedulerConfig, SyncRunner, SyncScheduler, SyncTrigger};
pub use state::{KindOutcome, SyncKind, SyncPhase, SyncReport, SyncStats};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let sync = SyncConfig::default();
        assert_eq!(sync.replace_timeout, std::time::Duration::from_secs(10));
        assert_eq!(sync.retry_delay, std::time::Duration::from_secs(30));

        let scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.max_jitter, std::time::Duration::from_secs(600));
    }
}
