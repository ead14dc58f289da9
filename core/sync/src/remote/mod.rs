//! Remote source trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waypoint_common::{News, Result, Step, StepLink};

pub mod file;
pub mod memory;

pub use file::FileRemote;
pub use memory::{FailureMode, MemoryRemote};

/// A link as delivered by the remote, before it is tied to a stored step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLinkRecord {
    pub title: String,
    pub url: String,
}

/// A step as delivered by the remote, with its links inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub possible_date: String,
    pub position: i32,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub links: Vec<StepLinkRecord>,
}

impl StepRecord {
    /// A record with no links and empty free-text fields.
    pub fn new(title: impl Into<String>, position: i32) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            possible_date: String::new(),
            position,
            completed: false,
            links: Vec::new(),
        }
    }

    /// Add a link.
    pub fn with_link(mut self, title: impl Into<String>, url: impl Into<String>) -> Self {
        self.links.push(StepLinkRecord {
            title: title.into(),
            url: url.into(),
        });
        self
    }

    /// Split into an unsaved step and its link records.
    pub fn into_parts(self) -> (Step, Vec<StepLinkRecord>) {
        let step = Step::new(
            self.position,
            self.title,
            self.description,
            self.completed,
            self.possible_date,
        );
        (step, self.links)
    }
}

impl StepLinkRecord {
    /// A link owned by the stored step with id `steps_id`.
    pub fn into_link(self, steps_id: &str) -> StepLink {
        StepLink::new(steps_id, self.title, self.url)
    }
}

/// A news item as delivered by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsRecord {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub tldr: Option<String>,
    pub date: DateTime<Utc>,
}

impl NewsRecord {
    pub fn new(title: impl Into<String>, url: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            tldr: None,
            date,
        }
    }
}

impl From<NewsRecord> for News {
    fn from(record: NewsRecord) -> Self {
        News {
            id: None,
            title: record.title,
            url: record.url,
            date: record.date,
            tldr: record.tldr,
        }
    }
}

/// The remote service the app syncs from.
///
/// Every call may fail with `Error::Network`. Implementations handle their
/// own transport and authentication.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Source name, for logs.
    fn name(&self) -> &str;

    /// Fetch the full list of steps.
    async fn fetch_steps(&self) -> Result<Vec<StepRecord>>;

    /// Fetch the full list of news.
    async fn fetch_news(&self) -> Result<Vec<NewsRecord>>;

    /// Register this device's push token with the remote.
    async fn post_registration_token(&self, token: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_record_defaults() {
        let json = r#"{"title": "A", "position": 1}"#;
        let record: StepRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record, StepRecord::new("A", 1));
    }

    #[test]
    fn test_into_parts() {
        let record = StepRecord::new("Apply", 3).with_link("Form", "https://form");
        let (step, links) = record.into_parts();

        assert!(step.id.is_none());
        assert_eq!(step.position, 3);
        assert_eq!(links.len(), 1);

        let link = links.into_iter().next().unwrap().into_link("s1");
        assert_eq!(link.steps_id, "s1");
        assert!(link.id.is_none());
    }

    #[test]
    fn test_news_record_parses_rfc3339() {
        let json = r#"{"title": "N", "url": "https://n", "date": "2024-03-01T10:00:00Z"}"#;
        let record: NewsRecord = serde_json::from_str(json).unwrap();
        let news = News::from(record);
        assert!(news.tldr.is_none());
        assert_eq!(news.date.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }
}
