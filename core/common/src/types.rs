//! Entity value types shared by the store, the sync engine and the app layer.
//!
//! Entities are plain values. The store replaces whole rows; nothing outside
//! the store mutates a persisted row field by field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the tracked process, displayed in `position` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Identifier, assigned by the store on first write when absent.
    pub id: Option<String>,
    /// Display and sort order.
    pub position: i32,
    pub title: String,
    pub description: String,
    pub completed: bool,
    /// Free-form estimate of when the step may happen.
    pub possible_date: String,
}

impl Step {
    /// Create a step that has not been persisted yet.
    pub fn new(
        position: i32,
        title: impl Into<String>,
        description: impl Into<String>,
        completed: bool,
        possible_date: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            position,
            title: title.into(),
            description: description.into(),
            completed,
            possible_date: possible_date.into(),
        }
    }

    /// Same step with the given id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A link attached to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLink {
    pub id: Option<String>,
    /// Id of the owning [`Step`]. Must exist when the link is written.
    pub steps_id: String,
    pub title: String,
    pub url: String,
}

impl StepLink {
    /// Create a link for the step with id `steps_id`.
    pub fn new(steps_id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: None,
            steps_id: steps_id.into(),
            title: title.into(),
            url: url.into(),
        }
    }
}

/// A step together with its links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepWithLinks {
    pub step: Option<Step>,
    pub links: Vec<StepLink>,
}

/// A news item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct News {
    pub id: Option<String>,
    pub title: String,
    pub url: String,
    pub date: DateTime<Utc>,
    /// Optional short summary.
    pub tldr: Option<String>,
}

impl News {
    /// Create a news item that has not been persisted yet.
    pub fn new(title: impl Into<String>, url: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            id: None,
            title: title.into(),
            url: url.into(),
            date,
            tldr: None,
        }
    }

    /// Same item with a summary.
    pub fn with_tldr(mut self, tldr: impl Into<String>) -> Self {
        self.tldr = Some(tldr.into());
        self
    }
}

/// One sync attempt and its outcome.
///
/// `pending == false` means the sync succeeded, and such a row always
/// carries `time_synced` once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: Option<String>,
    pub pending: bool,
    /// When the sync was requested, if known.
    pub pending_time: Option<DateTime<Utc>>,
    /// When the sync completed successfully.
    pub time_synced: Option<DateTime<Utc>>,
    /// Filled with the write time by the store when absent.
    pub time_created: Option<DateTime<Utc>>,
}

impl SyncRecord {
    /// A new sync request waiting to be fulfilled.
    pub fn pending(requested_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            pending: true,
            pending_time: Some(requested_at),
            time_synced: None,
            time_created: None,
        }
    }

    /// This sync marked as successful at `at`.
    pub fn succeeded(self, at: DateTime<Utc>) -> Self {
        Self {
            pending: false,
            time_synced: Some(at),
            ..self
        }
    }
}

/// Push registration for this device. Keyed by `token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcmRegistration {
    pub token: String,
    pub time_created: Option<DateTime<Utc>>,
}

impl GcmRegistration {
    /// Create a registration for `token` that has not been persisted yet.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            time_created: None,
        }
    }
}

/// Kind of push message received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GcmMessageType {
    /// Request for a full sync.
    Sync,
    /// A news notification, which also triggers a sync.
    NewsNotification,
}

impl GcmMessageType {
    /// Stable numeric value used for persistence.
    pub fn value(self) -> i64 {
        match self {
            GcmMessageType::Sync => 1,
            GcmMessageType::NewsNotification => 2,
        }
    }

    /// Parse a persisted numeric value.
    pub fn from_value(value: i64) -> crate::Result<Self> {
        match value {
            1 => Ok(GcmMessageType::Sync),
            2 => Ok(GcmMessageType::NewsNotification),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown message type {}",
                other
            ))),
        }
    }
}

impl fmt::Display for GcmMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcmMessageType::Sync => write!(f, "sync"),
            GcmMessageType::NewsNotification => write!(f, "news-notification"),
        }
    }
}

/// A received push message, optionally tied to the sync it requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcmMessage {
    pub id: Option<String>,
    /// Id of the [`SyncRecord`] this message caused, if any. Must exist when set.
    pub syncs_id: Option<String>,
    pub message_type: GcmMessageType,
    pub data: String,
    pub time_created: Option<DateTime<Utc>>,
}

impl GcmMessage {
    /// Create a message that has not been persisted yet.
    pub fn new(message_type: GcmMessageType, data: impl Into<String>) -> Self {
        Self {
            id: None,
            syncs_id: None,
            message_type,
            data: data.into(),
            time_created: None,
        }
    }

    /// Same message linked to the sync with id `syncs_id`.
    pub fn for_sync(mut self, syncs_id: impl Into<String>) -> Self {
        self.syncs_id = Some(syncs_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_values() {
        for t in [GcmMessageType::Sync, GcmMessageType::NewsNotification] {
            assert_eq!(GcmMessageType::from_value(t.value()).unwrap(), t);
        }
        assert!(GcmMessageType::from_value(7).is_err());
    }

    #[test]
    fn test_sync_succeeded_sets_time() {
        let now = Utc::now();
        let sync = SyncRecord::pending(now).succeeded(now);
        assert!(!sync.pending);
        assert_eq!(sync.time_synced, Some(now));
        assert_eq!(sync.pending_time, Some(now));
    }

    #[test]
    fn test_step_builder() {
        let step = Step::new(1, "A", "first", false, "soon").with_id("s1");
        assert_eq!(step.id.as_deref(), Some("s1"));
        assert_eq!(step.position, 1);
    }
}
