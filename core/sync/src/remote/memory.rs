//! In-memory remote for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use waypoint_common::{Error, Result};

use super::{NewsRecord, RemoteSource, StepRecord};

/// When an endpoint of [`MemoryRemote`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Always succeed.
    #[default]
    Never,
    /// Fail the next `n` calls, then succeed.
    Times(u32),
    /// Always fail.
    Always,
}

impl FailureMode {
    /// Consume one call, returning whether it fails.
    fn consume(&mut self) -> bool {
        match *self {
            FailureMode::Never => false,
            FailureMode::Always => true,
            FailureMode::Times(0) => {
                *self = FailureMode::Never;
                false
            }
            FailureMode::Times(n) => {
                *self = FailureMode::Times(n - 1);
                true
            }
        }
    }
}

#[derive(Default)]
struct State {
    steps: Vec<StepRecord>,
    news: Vec<NewsRecord>,
    steps_failure: FailureMode,
    news_failure: FailureMode,
    registration_failure: FailureMode,
    posted_tokens: Vec<String>,
}

/// Scriptable remote.
///
/// Serves whatever steps and news were last set, fails endpoints on demand
/// with `Error::Network`, and counts calls.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
    steps_calls: AtomicUsize,
    news_calls: AtomicUsize,
    registration_calls: AtomicUsize,
}

impl MemoryRemote {
    /// Create a remote serving nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a remote serving `steps` and `news`.
    pub fn with_content(steps: Vec<StepRecord>, news: Vec<NewsRecord>) -> Self {
        let remote = Self::new();
        remote.set_steps(steps);
        remote.set_news(news);
        remote
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Network("Remote state poisoned".to_string()))
    }

    fn update(&self, f: impl FnOnce(&mut State)) {
        if let Ok(mut state) = self.lock() {
            f(&mut state);
        }
    }

    pub fn set_steps(&self, steps: Vec<StepRecord>) {
        self.update(|s| s.steps = steps);
    }

    pub fn set_news(&self, news: Vec<NewsRecord>) {
        self.update(|s| s.news = news);
    }

    pub fn fail_steps(&self, mode: FailureMode) {
        self.update(|s| s.steps_failure = mode);
    }

    pub fn fail_news(&self, mode: FailureMode) {
        self.update(|s| s.news_failure = mode);
    }

    pub fn fail_registration(&self, mode: FailureMode) {
        self.update(|s| s.registration_failure = mode);
    }

    pub fn steps_calls(&self) -> usize {
        self.steps_calls.load(Ordering::SeqCst)
    }

    pub fn news_calls(&self) -> usize {
        self.news_calls.load(Ordering::SeqCst)
    }

    pub fn registration_calls(&self) -> usize {
        self.registration_calls.load(Ordering::SeqCst)
    }

    /// Tokens accepted by [`RemoteSource::post_registration_token`].
    pub fn posted_tokens(&self) -> Vec<String> {
        self.lock().map(|s| s.posted_tokens.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RemoteSource for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_steps(&self) -> Result<Vec<StepRecord>> {
        self.steps_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock()?;
        if state.steps_failure.consume() {
            return Err(Error::Network("Steps endpoint unreachable".to_string()));
        }
        Ok(state.steps.clone())
    }

    async fn fetch_news(&self) -> Result<Vec<NewsRecord>> {
        self.news_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock()?;
        if state.news_failure.consume() {
            return Err(Error::Network("News endpoint unreachable".to_string()));
        }
        Ok(state.news.clone())
    }

    async fn post_registration_token(&self, token: &str) -> Result<()> {
        self.registration_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock()?;
        if state.registration_failure.consume() {
            return Err(Error::Network("Registration endpoint unreachable".to_string()));
        }
        state.posted_tokens.push(token.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_serves_content() {
        let remote = MemoryRemote::with_content(
            vec![StepRecord::new("A", 1)],
            vec![NewsRecord::new("N", "https://n", Utc::now())],
        );

        assert_eq!(remote.fetch_steps().await.unwrap().len(), 1);
        assert_eq!(remote.fetch_news().await.unwrap().len(), 1);
        assert_eq!(remote.steps_calls(), 1);
        assert_eq!(remote.news_calls(), 1);
    }

    #[tokio::test]
    async fn test_fails_then_recovers() {
        let remote = MemoryRemote::new();
        remote.fail_steps(FailureMode::Times(2));

        assert!(matches!(remote.fetch_steps().await, Err(Error::Network(_))));
        assert!(matches!(remote.fetch_steps().await, Err(Error::Network(_))));
        assert!(remote.fetch_steps().await.is_ok());
        assert_eq!(remote.steps_calls(), 3);
    }

    #[tokio::test]
    async fn test_records_tokens() {
        let remote = MemoryRemote::new();
        remote.post_registration_token("abc").await.unwrap();

        remote.fail_registration(FailureMode::Always);
        assert!(remote.post_registration_token("def").await.is_err());

        assert_eq!(remote.posted_tokens(), vec!["abc".to_string()]);
        assert_eq!(remote.registration_calls(), 2);
    }
}
