//! Typed access to one entity kind.

use std::marker::PhantomData;

use waypoint_common::{Error, Result};

use crate::bus::Subscription;
use crate::database::Database;
use crate::entity::Entity;
use crate::query::{Filter, Query};

/// Store for one entity kind.
///
/// Every write runs in its own transaction and refreshes the kind's live
/// subscriptions after commit. Use [`Database::write`] to group writes across
/// kinds.
pub struct EntityStore<E: Entity> {
    db: Database,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for EntityStore<E> {
    fn clone(&self) -> Self {
        Self::new(self.db.clone())
    }
}

impl<E: Entity> EntityStore<E> {
    pub(crate) fn new(db: Database) -> Self {
        Self {
            db,
            _marker: PhantomData,
        }
    }

    /// The database this store writes to.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Insert-or-update `entities` by key, assigning ids where absent.
    ///
    /// All rows commit together or none do. Upserting the same entities
    /// twice leaves the store as after the first call.
    ///
    /// # Errors
    /// - `Integrity` if a reference does not resolve
    /// - `Persistence` on storage failure
    pub fn upsert(&self, entities: Vec<E>) -> Result<Vec<E>> {
        self.db.write(|tx| tx.upsert(entities))
    }

    /// Upsert a single entity.
    pub fn upsert_one(&self, entity: E) -> Result<E> {
        let mut written = self.upsert(vec![entity])?;
        written
            .pop()
            .ok_or_else(|| Error::Persistence(format!("Upsert into {} wrote nothing", E::TABLE)))
    }

    /// Insert `entity` unless its key already exists.
    ///
    /// Returns the stored row and whether it was inserted.
    pub fn insert_if_absent(&self, entity: E) -> Result<(E, bool)> {
        self.db.write(|tx| tx.insert_if_absent(entity))
    }

    /// Rows matching `query`, in the kind's default order when none is given.
    pub fn query(&self, query: Query) -> Result<Vec<E>> {
        let query = E::with_default_order(query);
        self.db.read(|tx| tx.query::<E>(&query))
    }

    /// First row matching `query`.
    pub fn query_one(&self, query: Query) -> Result<Option<E>> {
        Ok(self.query(query.limit(1))?.into_iter().next())
    }

    /// Every row.
    pub fn all(&self) -> Result<Vec<E>> {
        self.query(Query::all())
    }

    /// Live `query`. The subscription yields the current result first and a
    /// fresh result after every committed write to this kind.
    pub fn subscribe(&self, query: Query) -> Result<Subscription<E>> {
        self.db.subscribe(E::with_default_order(query))
    }

    /// Live view of every row.
    pub fn subscribe_all(&self) -> Result<Subscription<E>> {
        self.subscribe(Query::all())
    }

    /// Delete rows matching `filter`.
    pub fn delete(&self, filter: Filter) -> Result<usize> {
        self.db.write(|tx| tx.delete::<E>(&filter))
    }

    /// Delete every row.
    pub fn clear(&self) -> Result<usize> {
        self.db.write(|tx| tx.clear::<E>())
    }

    pub fn count(&self, filter: Filter) -> Result<usize> {
        self.db.read(|tx| tx.count::<E>(&filter))
    }

    /// Re-emit every live query of this kind without writing.
    pub fn notify_change(&self) -> Result<()> {
        self.db.notify::<E>()
    }

    /// Number of live subscriptions on this kind.
    pub fn subscriber_count(&self) -> usize {
        self.db.subscriber_count::<E>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;
    use std::thread;
    use waypoint_common::{GcmMessage, GcmMessageType, GcmRegistration, News, Step, StepLink, SyncRecord};

    fn steps() -> Vec<Step> {
        vec![
            Step::new(2, "Second", "b", false, "later").with_id("s2"),
            Step::new(1, "First", "a", true, "soon").with_id("s1"),
        ]
    }

    #[test]
    fn test_upsert_assigns_ids() {
        let db = Database::in_memory().unwrap();
        let written = db
            .steps()
            .upsert(vec![Step::new(1, "A", "", false, "")])
            .unwrap();

        assert!(written[0].id.is_some());
        assert_eq!(db.steps().all().unwrap(), written);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let db = Database::in_memory().unwrap();
        db.steps().upsert(steps()).unwrap();
        let first = db.steps().all().unwrap();

        db.steps().upsert(steps()).unwrap();
        let second = db.steps().all().unwrap();

        assert_eq!(first, second);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_upsert_replaces_by_key() {
        let db = Database::in_memory().unwrap();
        db.steps().upsert(steps()).unwrap();

        let mut changed = Step::new(1, "Renamed", "a", false, "soon").with_id("s1");
        changed.completed = true;
        db.steps().upsert_one(changed).unwrap();

        let all = db.steps().all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].title, "Renamed");
    }

    #[test]
    fn test_upsert_returns_what_reads_return() {
        let db = Database::in_memory().unwrap();
        let date = DateTime::<Utc>::from_timestamp(1_700_000_000, 987_654_321).unwrap();

        let written = db.news().upsert_one(News::new("t", "u", date)).unwrap();

        assert_eq!(db.news().all().unwrap(), vec![written.clone()]);
        assert_eq!(written.date.timestamp_subsec_nanos(), 987_000_000);
    }

    #[test]
    fn test_update_in_place_every_kind() {
        let db = Database::in_memory().unwrap();

        let mut step = db.steps().upsert_one(Step::new(1, "A", "", false, "")).unwrap();
        step.title = "A2".to_string();
        step.completed = true;
        db.steps().upsert_one(step.clone()).unwrap();
        assert_eq!(db.steps().all().unwrap(), vec![step.clone()]);

        let step_id = step.id.clone().unwrap();
        let mut link = db
            .step_links()
            .upsert_one(StepLink::new(step_id, "L", "https://a"))
            .unwrap();
        link.url = "https://b".to_string();
        db.step_links().upsert_one(link.clone()).unwrap();
        assert_eq!(db.step_links().all().unwrap(), vec![link]);

        let mut news = db.news().upsert_one(News::new("N", "u", Utc::now())).unwrap();
        news.tldr = Some("short".to_string());
        db.news().upsert_one(news.clone()).unwrap();
        assert_eq!(db.news().all().unwrap(), vec![news]);

        let mut sync = db.syncs().upsert_one(SyncRecord::pending(Utc::now())).unwrap();
        sync.pending = false;
        let sync = db.syncs().upsert_one(sync).unwrap();
        assert_eq!(db.syncs().all().unwrap(), vec![sync.clone()]);
        assert!(sync.time_synced.is_some());

        let mut message = db
            .messages()
            .upsert_one(GcmMessage::new(GcmMessageType::Sync, "a"))
            .unwrap();
        message.data = "b".to_string();
        message.syncs_id = sync.id.clone();
        db.messages().upsert_one(message.clone()).unwrap();
        assert_eq!(db.messages().all().unwrap(), vec![message]);

        let mut registration = db.registrations().upsert_one(GcmRegistration::new("tok")).unwrap();
        registration.time_created = Some(Utc::now() + Duration::days(1));
        let registration = db.registrations().upsert_one(registration).unwrap();
        assert_eq!(db.registrations().all().unwrap(), vec![registration]);
    }

    #[test]
    fn test_default_order_applied() {
        let db = Database::in_memory().unwrap();
        db.steps().upsert(steps()).unwrap();

        let positions: Vec<i32> = db.steps().all().unwrap().iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![1, 2]);

        let now = Utc::now();
        db.news()
            .upsert(vec![
                News::new("old", "u1", now - Duration::days(2)),
                News::new("new", "u2", now),
            ])
            .unwrap();
        let titles: Vec<String> = db.news().all().unwrap().into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["new", "old"]);
    }

    #[test]
    fn test_dangling_link_is_integrity_error() {
        let db = Database::in_memory().unwrap();
        db.steps().upsert(steps()).unwrap();

        let err = db
            .step_links()
            .upsert(vec![
                StepLink::new("s1", "ok", "https://a"),
                StepLink::new("missing", "bad", "https://b"),
            ])
            .unwrap_err();

        assert!(matches!(err, Error::Integrity(_)));
        // The valid link in the same batch was rolled back too.
        assert!(db.step_links().all().unwrap().is_empty());
    }

    #[test]
    fn test_clear_and_count() {
        let db = Database::in_memory().unwrap();
        db.steps().upsert(steps()).unwrap();
        assert_eq!(db.steps().count(Filter::All).unwrap(), 2);
        assert_eq!(db.steps().count(Filter::eq("completed", true)).unwrap(), 1);

        assert_eq!(db.steps().clear().unwrap(), 2);
        assert_eq!(db.steps().count(Filter::All).unwrap(), 0);
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let db = Database::in_memory().unwrap();
        let store = db.registrations();

        let (first, inserted) = store.insert_if_absent(GcmRegistration::new("tok")).unwrap();
        assert!(inserted);
        assert_eq!(store.all().unwrap(), vec![first.clone()]);

        let mut later = GcmRegistration::new("tok");
        later.time_created = Some(Utc::now() + Duration::days(1));
        let (again, inserted) = store.insert_if_absent(later).unwrap();
        assert!(!inserted);
        assert_eq!(again, first);
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_sees_initial_then_commits() {
        let db = Database::in_memory().unwrap();
        let store = db.steps();
        let mut sub = store.subscribe_all().unwrap();

        assert!(sub.next().await.unwrap().is_empty());

        store.upsert(steps()).unwrap();
        assert_eq!(sub.next().await.unwrap().len(), 2);

        store.delete(Filter::eq("id", "s2".to_string())).unwrap();
        let rows = sub.next().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_subscription_never_goes_stale() {
        let db = Database::in_memory().unwrap();
        let store = db.steps();
        let mut sub = store.subscribe_all().unwrap();
        sub.next().await.unwrap();

        // Several commits before the subscriber looks: it sees the newest.
        for i in 0..5 {
            store
                .upsert_one(Step::new(i, "S", "", false, "").with_id(format!("s{}", i)))
                .unwrap();
        }
        assert_eq!(sub.next().await.unwrap().len(), 5);
        assert_eq!(sub.latest().len(), 5);
    }

    #[tokio::test]
    async fn test_writes_to_other_kinds_do_not_wake() {
        let db = Database::in_memory().unwrap();
        let mut sub = db.steps().subscribe_all().unwrap();
        sub.next().await.unwrap();

        db.news().upsert_one(News::new("n", "u", Utc::now())).unwrap();

        let woke = tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await;
        assert!(woke.is_err());
    }

    #[tokio::test]
    async fn test_notify_change_reemits() {
        let db = Database::in_memory().unwrap();
        let store = db.syncs();
        let mut sub = store.subscribe_all().unwrap();
        sub.next().await.unwrap();

        store.notify_change().unwrap();
        assert!(sub.next().await.unwrap().is_empty());
    }

    #[test]
    fn test_subscribe_and_drop_while_writing() {
        let db = Database::in_memory().unwrap();
        let writes = 200;

        let writer = {
            let db = db.clone();
            thread::spawn(move || {
                for i in 0..writes {
                    db.steps()
                        .upsert_one(Step::new(i, "S", "", false, "").with_id(format!("s{}", i)))
                        .unwrap();
                }
            })
        };

        let subscribers: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let sub = db.steps().subscribe_all().unwrap();
                        let seen = sub.latest().len();
                        assert!(seen <= writes as usize);
                        drop(sub);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for handle in subscribers {
            handle.join().unwrap();
        }

        assert_eq!(db.steps().subscriber_count(), 0);
        let sub = db.steps().subscribe_all().unwrap();
        assert_eq!(sub.latest().len(), writes as usize);
    }

    #[tokio::test]
    async fn test_live_subscription_tracks_concurrent_writer() {
        let db = Database::in_memory().unwrap();
        let mut sub = db.steps().subscribe_all().unwrap();
        sub.next().await.unwrap();

        let writer = {
            let db = db.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    db.steps()
                        .upsert_one(Step::new(i, "S", "", false, "").with_id(format!("s{}", i)))
                        .unwrap();
                }
            })
        };

        let mut last = 0;
        while last < 50 {
            let rows = sub.next().await.unwrap();
            assert!(rows.len() >= last);
            last = rows.len();
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_drop_unsubscribes() {
        let db = Database::in_memory().unwrap();
        let store = db.steps();
        let sub = store.subscribe_all().unwrap();
        let other = store.subscribe_all().unwrap();
        assert_eq!(store.subscriber_count(), 2);

        drop(sub);
        assert_eq!(store.subscriber_count(), 1);

        other.unsubscribe();
        assert_eq!(store.subscriber_count(), 0);
    }

    proptest! {
        #[test]
        fn test_repeated_upsert_converges(
            titles in prop::collection::vec("[a-z ]{0,12}", 1..8),
            repeats in 1usize..4,
        ) {
            let db = Database::in_memory().unwrap();
            let batch: Vec<Step> = titles
                .iter()
                .enumerate()
                .map(|(i, title)| {
                    Step::new(i as i32, title.clone(), "", i % 2 == 0, "").with_id(format!("s{}", i))
                })
                .collect();

            db.steps().upsert(batch.clone()).unwrap();
            let first = db.steps().all().unwrap();
            for _ in 0..repeats {
                db.steps().upsert(batch.clone()).unwrap();
            }

            prop_assert_eq!(db.steps().all().unwrap(), first);
            prop_assert_eq!(db.steps().count(Filter::All).unwrap(), titles.len());
        }
    }
}
