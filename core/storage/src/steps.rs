//! Step and link queries.

use waypoint_common::{Result, Step, StepLink, StepWithLinks};

use crate::bus::Subscription;
use crate::database::Database;
use crate::query::{Filter, Query};
use crate::store::EntityStore;

fn by_position(position: i32) -> Filter {
    Filter::eq("position", i64::from(position))
}

fn links_of_position(position: i32) -> Filter {
    Filter::InSubquery {
        column: "steps_id",
        table: "steps",
        select: "id",
        filter: Box::new(by_position(position)),
    }
}

impl EntityStore<Step> {
    pub fn by_id(&self, id: &str) -> Result<Option<Step>> {
        self.query_one(Query::filter(Filter::eq("id", id.to_string())))
    }

    /// The step at `position`, if any.
    pub fn by_position(&self, position: i32) -> Result<Option<Step>> {
        self.query_one(Query::filter(by_position(position)))
    }

    /// Live view of the step at `position`. Emits an empty list while no
    /// such step exists.
    pub fn subscribe_by_position(&self, position: i32) -> Result<Subscription<Step>> {
        self.subscribe(Query::filter(by_position(position)).limit(1))
    }

    /// Live view of the completed steps.
    pub fn subscribe_completed(&self) -> Result<Subscription<Step>> {
        self.subscribe(Query::filter(Filter::eq("completed", true)))
    }

    pub fn count_completed(&self) -> Result<usize> {
        self.count(Filter::eq("completed", true))
    }
}

impl EntityStore<StepLink> {
    /// Links of the step with id `steps_id`.
    pub fn by_step_id(&self, steps_id: &str) -> Result<Vec<StepLink>> {
        self.query(Query::filter(Filter::eq("steps_id", steps_id.to_string())))
    }

    /// Links of the step at `position`.
    pub fn by_step_position(&self, position: i32) -> Result<Vec<StepLink>> {
        self.query(Query::filter(links_of_position(position)))
    }

    pub fn subscribe_by_step_position(&self, position: i32) -> Result<Subscription<StepLink>> {
        self.subscribe(Query::filter(links_of_position(position)))
    }
}

impl Database {
    /// The step at `position` together with its links, read consistently.
    pub fn step_with_links_by_position(&self, position: i32) -> Result<StepWithLinks> {
        self.read(|tx| {
            let step = tx
                .query::<Step>(&Query::filter(by_position(position)).limit(1))?
                .into_iter()
                .next();
            let links = tx.query::<StepLink>(&Query::filter(links_of_position(position)))?;
            Ok(StepWithLinks { step, links })
        })
    }

    /// Remove every link and then every step in one transaction.
    ///
    /// Links reference steps, so they must go first.
    pub fn clear_steps(&self) -> Result<()> {
        self.write(|tx| {
            tx.clear::<StepLink>()?;
            tx.clear::<Step>()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_common::Error;

    fn seed(db: &Database) {
        db.write(|tx| {
            tx.upsert(vec![
                Step::new(1, "Apply", "", true, "").with_id("a"),
                Step::new(2, "Interview", "", false, "").with_id("b"),
            ])?;
            tx.upsert(vec![
                StepLink::new("a", "Form", "https://form"),
                StepLink::new("b", "Guide", "https://guide"),
                StepLink::new("b", "Map", "https://map"),
            ])?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_step_lookups() {
        let db = Database::in_memory().unwrap();
        seed(&db);

        assert_eq!(db.steps().by_position(2).unwrap().unwrap().title, "Interview");
        assert!(db.steps().by_position(9).unwrap().is_none());
        assert_eq!(db.steps().by_id("a").unwrap().unwrap().position, 1);
        assert_eq!(db.steps().count_completed().unwrap(), 1);
    }

    #[test]
    fn test_link_lookups() {
        let db = Database::in_memory().unwrap();
        seed(&db);

        assert_eq!(db.step_links().by_step_id("b").unwrap().len(), 2);
        assert_eq!(db.step_links().by_step_position(1).unwrap().len(), 1);
        assert!(db.step_links().by_step_position(5).unwrap().is_empty());
    }

    #[test]
    fn test_step_with_links() {
        let db = Database::in_memory().unwrap();
        seed(&db);

        let combined = db.step_with_links_by_position(2).unwrap();
        assert_eq!(combined.step.unwrap().id.as_deref(), Some("b"));
        assert_eq!(combined.links.len(), 2);

        let missing = db.step_with_links_by_position(7).unwrap();
        assert!(missing.step.is_none());
        assert!(missing.links.is_empty());
    }

    #[test]
    fn test_clearing_steps_with_links_requires_links_first() {
        let db = Database::in_memory().unwrap();
        seed(&db);

        let err = db.steps().clear().unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert_eq!(db.steps().all().unwrap().len(), 2);

        db.clear_steps().unwrap();
        assert!(db.steps().all().unwrap().is_empty());
        assert!(db.step_links().all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_by_position_follows_changes() {
        let db = Database::in_memory().unwrap();
        let mut sub = db.steps().subscribe_by_position(1).unwrap();
        assert!(sub.next().await.unwrap().is_empty());

        seed(&db);
        let rows = sub.next().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Apply");
    }
}
