//! Change bus: live query subscriptions for one entity kind.
//!
//! A subscription holds the latest result of its query. After every
//! committed write the store recomputes each live query and publishes the
//! fresh result, so a subscriber always observes the newest committed state
//! and never an older one after a newer one.

use futures::stream::{self, BoxStream};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

use waypoint_common::{Error, Result};

use crate::database::select;
use crate::entity::Entity;
use crate::query::Query;

struct Entry<E> {
    query: Query,
    sender: watch::Sender<Vec<E>>,
}

struct Registry<E> {
    next_id: u64,
    entries: HashMap<u64, Entry<E>>,
}

/// Registry of live subscriptions for one entity kind.
pub struct ChangeBus<E: Entity> {
    registry: Mutex<Registry<E>>,
}

impl<E: Entity> ChangeBus<E> {
    pub(crate) fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 0,
                entries: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Registry<E>>> {
        self.registry
            .lock()
            .map_err(|_| Error::Persistence("Subscription registry lock poisoned".to_string()))
    }

    /// Register a subscription whose first emission is `initial`.
    ///
    /// Callers must hold the connection lock while computing `initial` and
    /// registering, so that no commit falls between the two.
    pub(crate) fn register(self: &Arc<Self>, query: Query, initial: Vec<E>) -> Result<Subscription<E>> {
        let (sender, receiver) = watch::channel(initial);
        let mut registry = self.lock()?;
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.insert(id, Entry { query, sender });
        debug!("Subscribed #{} to {}", id, E::TABLE);

        Ok(Subscription {
            id,
            bus: Arc::downgrade(self),
            receiver,
            delivered_initial: false,
        })
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut registry) = self.lock() {
            if registry.entries.remove(&id).is_some() {
                debug!("Unsubscribed #{} from {}", id, E::TABLE);
            }
        }
    }

    /// Recompute every live query against `conn` and publish the results.
    ///
    /// Subscriptions whose receiver is gone are dropped. A query that fails
    /// to run is logged and skipped; the subscriber keeps its last result.
    pub(crate) fn notify(&self, conn: &Connection) {
        let Ok(mut registry) = self.lock() else {
            warn!("Skipping notification for {}: registry unavailable", E::TABLE);
            return;
        };

        registry.entries.retain(|id, entry| {
            if entry.sender.is_closed() {
                return false;
            }
            match select::<E>(conn, &entry.query) {
                Ok(rows) => entry.sender.send(rows).is_ok(),
                Err(e) => {
                    warn!("Failed to refresh subscription #{} on {}: {}", id, E::TABLE, e);
                    true
                }
            }
        });
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.lock().map(|r| r.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live query. Yields the current result first, then a fresh result after
/// each committed write to its kind. Dropping it unsubscribes.
pub struct Subscription<E: Entity> {
    id: u64,
    bus: Weak<ChangeBus<E>>,
    receiver: watch::Receiver<Vec<E>>,
    delivered_initial: bool,
}

impl<E: Entity> Subscription<E> {
    /// Registration id, unique within its bus.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The most recent result without waiting.
    pub fn latest(&self) -> Vec<E> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next result.
    ///
    /// Returns `None` once the store has been dropped.
    pub async fn next(&mut self) -> Option<Vec<E>> {
        if !self.delivered_initial {
            self.delivered_initial = true;
            return Some(self.receiver.borrow_and_update().clone());
        }
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Stop receiving results.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Convert into a stream of results.
    pub fn into_stream(self) -> BoxStream<'static, Vec<E>> {
        Box::pin(stream::unfold(self, |mut sub| async move {
            let rows = sub.next().await?;
            Some((rows, sub))
        }))
    }
}

impl<E: Entity> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}
