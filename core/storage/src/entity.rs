//! Table mappings for each entity kind.

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::Row;

use waypoint_common::{
    id, Error, GcmMessage, GcmMessageType, GcmRegistration, News, Result, Step, StepLink,
    SyncRecord,
};

use crate::bus::ChangeBus;
use crate::database::Buses;
use crate::query::{Order, Query};

/// Identifies a table and its change bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Step,
    StepLink,
    News,
    Sync,
    GcmMessage,
    GcmRegistration,
}

/// A value type persisted in its own table.
///
/// `COLUMNS` lists every persisted column with the key first; `to_row` and
/// `from_row` use the same order.
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;
    const TABLE: &'static str;
    const KEY: &'static str;
    const COLUMNS: &'static [&'static str];

    /// Ordering used when the caller does not give one.
    fn default_order() -> Option<Order> {
        None
    }

    /// The key, if one has been assigned.
    fn key(&self) -> Option<&str>;

    /// Fill in the key and write-time defaults before the row is written.
    fn resolve(self, now: DateTime<Utc>) -> Result<Self>;

    fn to_row(&self) -> Vec<Value>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// The change bus that carries this kind's subscriptions.
    fn bus(buses: &Buses) -> &std::sync::Arc<ChangeBus<Self>>;

    /// `query` with the default ordering applied when it has none.
    fn with_default_order(mut query: Query) -> Query {
        if query.order.is_none() {
            query.order = Self::default_order();
        }
        query
    }
}

/// Cut `time` to the precision the tables store.
pub(crate) fn stored_precision(time: DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(3)
}

fn opt_stored_precision(time: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    time.map(stored_precision)
}

pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn opt_millis(time: Option<DateTime<Utc>>) -> Value {
    match time {
        Some(t) => Value::Integer(to_millis(t)),
        None => Value::Null,
    }
}

fn from_millis(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            Box::new(Error::InvalidInput(format!("Timestamp out of range: {}", millis))),
        )
    })
}

fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(idx, row.get(idx)?)
}

fn get_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(millis) => from_millis(idx, millis).map(Some),
        None => Ok(None),
    }
}

fn get_key(row: &Row<'_>) -> rusqlite::Result<Option<String>> {
    row.get::<_, String>(0).map(Some)
}

impl Entity for Step {
    const KIND: EntityKind = EntityKind::Step;
    const TABLE: &'static str = "steps";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "position",
        "title",
        "description",
        "completed",
        "possible_date",
    ];

    fn default_order() -> Option<Order> {
        Some(Order::asc("position"))
    }

    fn key(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn resolve(mut self, _now: DateTime<Utc>) -> Result<Self> {
        self.id = Some(id::ensure(self.id));
        Ok(self)
    }

    fn to_row(&self) -> Vec<Value> {
        vec![
            self.id.clone().into(),
            Value::Integer(self.position.into()),
            self.title.clone().into(),
            self.description.clone().into(),
            self.completed.into(),
            self.possible_date.clone().into(),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Step {
            id: get_key(row)?,
            position: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            completed: row.get(4)?,
            possible_date: row.get(5)?,
        })
    }

    fn bus(buses: &Buses) -> &std::sync::Arc<ChangeBus<Self>> {
        &buses.steps
    }
}

impl Entity for StepLink {
    const KIND: EntityKind = EntityKind::StepLink;
    const TABLE: &'static str = "links";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["id", "steps_id", "title", "url"];

    fn key(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn resolve(mut self, _now: DateTime<Utc>) -> Result<Self> {
        self.id = Some(id::ensure(self.id));
        Ok(self)
    }

    fn to_row(&self) -> Vec<Value> {
        vec![
            self.id.clone().into(),
            self.steps_id.clone().into(),
            self.title.clone().into(),
            self.url.clone().into(),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(StepLink {
            id: get_key(row)?,
            steps_id: row.get(1)?,
            title: row.get(2)?,
            url: row.get(3)?,
        })
    }

    fn bus(buses: &Buses) -> &std::sync::Arc<ChangeBus<Self>> {
        &buses.links
    }
}

impl Entity for News {
    const KIND: EntityKind = EntityKind::News;
    const TABLE: &'static str = "news";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["id", "title", "url", "date", "tldr"];

    fn default_order() -> Option<Order> {
        Some(Order::desc("date"))
    }

    fn key(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn resolve(mut self, _now: DateTime<Utc>) -> Result<Self> {
        self.id = Some(id::ensure(self.id));
        self.date = stored_precision(self.date);
        Ok(self)
    }

    fn to_row(&self) -> Vec<Value> {
        vec![
            self.id.clone().into(),
            self.title.clone().into(),
            self.url.clone().into(),
            Value::Integer(to_millis(self.date)),
            self.tldr.clone().into(),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(News {
            id: get_key(row)?,
            title: row.get(1)?,
            url: row.get(2)?,
            date: get_time(row, 3)?,
            tldr: row.get(4)?,
        })
    }

    fn bus(buses: &Buses) -> &std::sync::Arc<ChangeBus<Self>> {
        &buses.news
    }
}

impl Entity for SyncRecord {
    const KIND: EntityKind = EntityKind::Sync;
    const TABLE: &'static str = "syncs";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] =
        &["id", "pending", "pending_time", "time_synced", "time_created"];

    fn default_order() -> Option<Order> {
        Some(Order::asc("time_created"))
    }

    fn key(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn resolve(mut self, now: DateTime<Utc>) -> Result<Self> {
        let now = stored_precision(now);
        self.id = Some(id::ensure(self.id));
        self.pending_time = opt_stored_precision(self.pending_time);
        self.time_synced = opt_stored_precision(self.time_synced);
        self.time_created = Some(self.time_created.map_or(now, stored_precision));
        if !self.pending && self.time_synced.is_none() {
            self.time_synced = Some(now);
        }
        Ok(self)
    }

    fn to_row(&self) -> Vec<Value> {
        vec![
            self.id.clone().into(),
            self.pending.into(),
            opt_millis(self.pending_time),
            opt_millis(self.time_synced),
            opt_millis(self.time_created),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(SyncRecord {
            id: get_key(row)?,
            pending: row.get(1)?,
            pending_time: get_opt_time(row, 2)?,
            time_synced: get_opt_time(row, 3)?,
            time_created: get_opt_time(row, 4)?,
        })
    }

    fn bus(buses: &Buses) -> &std::sync::Arc<ChangeBus<Self>> {
        &buses.syncs
    }
}

impl Entity for GcmMessage {
    const KIND: EntityKind = EntityKind::GcmMessage;
    const TABLE: &'static str = "gcm_messages";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["id", "syncs_id", "type", "data", "time_created"];

    fn default_order() -> Option<Order> {
        Some(Order::asc("time_created"))
    }

    fn key(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn resolve(mut self, now: DateTime<Utc>) -> Result<Self> {
        self.id = Some(id::ensure(self.id));
        self.time_created = Some(stored_precision(self.time_created.unwrap_or(now)));
        Ok(self)
    }

    fn to_row(&self) -> Vec<Value> {
        vec![
            self.id.clone().into(),
            self.syncs_id.clone().into(),
            Value::Integer(self.message_type.value()),
            self.data.clone().into(),
            opt_millis(self.time_created),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let raw_type: i64 = row.get(2)?;
        let message_type = GcmMessageType::from_value(raw_type)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Integer, Box::new(e)))?;

        Ok(GcmMessage {
            id: get_key(row)?,
            syncs_id: row.get(1)?,
            message_type,
            data: row.get(3)?,
            time_created: get_opt_time(row, 4)?,
        })
    }

    fn bus(buses: &Buses) -> &std::sync::Arc<ChangeBus<Self>> {
        &buses.messages
    }
}

impl Entity for GcmRegistration {
    const KIND: EntityKind = EntityKind::GcmRegistration;
    const TABLE: &'static str = "gcm_registrations";
    const KEY: &'static str = "token";
    const COLUMNS: &'static [&'static str] = &["token", "time_created"];

    fn default_order() -> Option<Order> {
        Some(Order::asc("time_created"))
    }

    fn key(&self) -> Option<&str> {
        Some(self.token.as_str())
    }

    fn resolve(mut self, now: DateTime<Utc>) -> Result<Self> {
        if self.token.is_empty() {
            return Err(Error::InvalidInput(
                "Registration token cannot be empty".to_string(),
            ));
        }
        self.time_created = Some(stored_precision(self.time_created.unwrap_or(now)));
        Ok(self)
    }

    fn to_row(&self) -> Vec<Value> {
        vec![self.token.clone().into(), opt_millis(self.time_created)]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(GcmRegistration {
            token: row.get(0)?,
            time_created: get_opt_time(row, 1)?,
        })
    }

    fn bus(buses: &Buses) -> &std::sync::Arc<ChangeBus<Self>> {
        &buses.registrations
    }
}
