//! Push registration and incoming push messages.

use std::sync::Arc;
use tracing::{info, warn};

use waypoint_common::{Error, GcmMessage, GcmMessageType, GcmRegistration, Result, SyncRecord};
use waypoint_storage::Database;

use crate::remote::RemoteSource;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::scheduler::SyncTrigger;

/// Topic of push messages requesting a full sync.
pub const SYNC_TOPIC: &str = "/topics/sync";
/// Topic of push messages announcing news.
pub const NEWS_TOPIC: &str = "/topics/news";

/// Registers this device's push token with the remote once.
pub struct RegistrationService<R: RemoteSource + ?Sized> {
    db: Database,
    remote: Arc<R>,
    trigger: Arc<dyn SyncTrigger>,
    retry_executor: RetryExecutor,
}

impl<R: RemoteSource + ?Sized> RegistrationService<R> {
    pub fn new(db: Database, remote: Arc<R>, trigger: Arc<dyn SyncTrigger>) -> Self {
        Self {
            db,
            remote,
            trigger,
            retry_executor: RetryExecutor::default(),
        }
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry_executor = RetryExecutor::new(config);
        self
    }

    /// Register `token`.
    ///
    /// A token already on record is not posted again and yields `false`.
    /// Otherwise the token is posted, recorded, and a forced sync is
    /// requested; the call yields `true`.
    ///
    /// # Errors
    /// - `InvalidInput` if `token` is empty
    /// - `Network` if the remote could not be reached after retries
    pub async fn register(&self, token: &str) -> Result<bool> {
        if token.is_empty() {
            return Err(Error::InvalidInput(
                "Registration token cannot be empty".to_string(),
            ));
        }

        if self.db.registrations().by_token(token)?.is_some() {
            info!("Push token already registered");
            return Ok(false);
        }

        self.retry_executor
            .execute("Post registration token", || {
                self.remote.post_registration_token(token)
            })
            .await
            .inspect_err(|e| warn!("Failed to post registration token: {}", e))?;

        let inserted = self.db.registrations().add(GcmRegistration::new(token))?;
        info!("Push token registered with {}", self.remote.name());

        self.trigger.enqueue_sync(true);
        Ok(inserted)
    }
}

/// Turns incoming push messages into pending syncs.
pub struct PushHandler {
    db: Database,
    trigger: Arc<dyn SyncTrigger>,
}

impl PushHandler {
    pub fn new(db: Database, trigger: Arc<dyn SyncTrigger>) -> Self {
        Self { db, trigger }
    }

    /// Handle a push message received on `topic`.
    ///
    /// Records a pending sync and the message linked to it in one
    /// transaction, then requests a forced sync. Returns the stored message.
    ///
    /// # Errors
    /// - `InvalidInput` for an unknown topic
    pub fn on_message(&self, topic: &str, data: &str) -> Result<GcmMessage> {
        let message_type = match topic {
            SYNC_TOPIC => GcmMessageType::Sync,
            NEWS_TOPIC => GcmMessageType::NewsNotification,
            other => {
                warn!("Ignoring push message on unknown topic {}", other);
                return Err(Error::InvalidInput(format!("Unknown topic: {}", other)));
            }
        };

        let message = self.db.write(|tx| {
            let sync = tx
                .upsert(vec![SyncRecord::pending(tx.now())])?
                .pop()
                .ok_or_else(|| Error::Persistence("Sync insert wrote nothing".to_string()))?;
            let sync_id = sync
                .id
                .ok_or_else(|| Error::Persistence("Stored sync has no id".to_string()))?;

            tx.upsert(vec![GcmMessage::new(message_type, data).for_sync(sync_id)])?
                .pop()
                .ok_or_else(|| Error::Persistence("Message insert wrote nothing".to_string()))
        })?;

        info!("Received {} push message; requesting sync", message_type);
        self.trigger.enqueue_sync(true);
        Ok(message)
    }
}
