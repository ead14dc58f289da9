//! Sync bookkeeping: sync records, push messages and registrations.

use rusqlite::types::Value;

use waypoint_common::{GcmMessage, GcmMessageType, GcmRegistration, Result, SyncRecord};

use crate::bus::Subscription;
use crate::query::{Filter, Order, Query};
use crate::store::EntityStore;

fn pending() -> Filter {
    Filter::eq("pending", true)
}

fn successful() -> Filter {
    Filter::eq("pending", false)
}

fn latest_success() -> Query {
    Query::filter(successful())
        .order_by(Order::desc("time_synced"))
        .limit(1)
}

impl EntityStore<SyncRecord> {
    /// Syncs requested but not yet fulfilled, oldest first.
    pub fn pending(&self) -> Result<Vec<SyncRecord>> {
        self.query(Query::filter(pending()))
    }

    pub fn subscribe_pending(&self) -> Result<Subscription<SyncRecord>> {
        self.subscribe(Query::filter(pending()))
    }

    /// Successful syncs in completion order.
    pub fn successful(&self) -> Result<Vec<SyncRecord>> {
        self.query(Query::filter(successful()).order_by(Order::asc("time_synced")))
    }

    /// The most recent successful sync, or `None` if there never was one.
    pub fn last_successful(&self) -> Result<Option<SyncRecord>> {
        self.query_one(latest_success())
    }

    /// Live view of the most recent successful sync. Emits an empty list
    /// while no sync has succeeded.
    pub fn subscribe_last_successful(&self) -> Result<Subscription<SyncRecord>> {
        self.subscribe(latest_success())
    }
}

impl EntityStore<GcmMessage> {
    pub fn by_type(&self, message_type: GcmMessageType) -> Result<Vec<GcmMessage>> {
        self.query(Query::filter(Filter::Eq(
            "type",
            Value::Integer(message_type.value()),
        )))
    }

    /// Messages that caused the sync with id `syncs_id`.
    pub fn by_sync(&self, syncs_id: &str) -> Result<Vec<GcmMessage>> {
        self.query(Query::filter(Filter::eq("syncs_id", syncs_id.to_string())))
    }
}

impl EntityStore<GcmRegistration> {
    pub fn by_token(&self, token: &str) -> Result<Option<GcmRegistration>> {
        self.query_one(Query::filter(Filter::eq("token", token.to_string())))
    }

    /// Store `registration` unless its token is already known.
    ///
    /// Returns `true` when a new row was written.
    pub fn add(&self, registration: GcmRegistration) -> Result<bool> {
        let (_, inserted) = self.insert_if_absent(registration)?;
        Ok(inserted)
    }
}
