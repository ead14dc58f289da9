//! Use cases backing the app's screens and background flows.
//!
//! Reactive use cases subscribe to the store and yield a fresh result after
//! every committed change. One-shot use cases yield once and end.

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use waypoint_common::{Error, News, Result, Step, StepLink, StepWithLinks, SyncRecord};
use waypoint_storage::{Database, Entity, Subscription};
use waypoint_sync::{RegistrationService, RemoteSource, SyncTrigger};

use crate::pipeline::UseCase;

/// Stream the results of a subscription, mapped through `f`.
fn live<E, T, F>(subscription: Result<Subscription<E>>, f: F) -> BoxStream<'static, Result<T>>
where
    E: Entity,
    T: Send + 'static,
    F: Fn(Vec<E>) -> T + Send + 'static,
{
    match subscription {
        Ok(sub) => sub.into_stream().map(move |rows| Ok(f(rows))).boxed(),
        Err(e) => stream::once(async move { Err(e) }).boxed(),
    }
}

/// All steps, by position.
pub struct GetSteps {
    db: Database,
}

impl GetSteps {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl UseCase for GetSteps {
    type Output = Vec<Step>;

    fn build(&self) -> BoxStream<'static, Result<Vec<Step>>> {
        live(self.db.steps().subscribe_all(), |steps| steps)
    }
}

/// The step at one position. Yields `None` while there is none.
pub struct GetStepByPosition {
    db: Database,
    position: i32,
}

impl GetStepByPosition {
    pub fn new(db: Database, position: i32) -> Self {
        Self { db, position }
    }
}

impl UseCase for GetStepByPosition {
    type Output = Option<Step>;

    fn build(&self) -> BoxStream<'static, Result<Option<Step>>> {
        live(self.db.steps().subscribe_by_position(self.position), |steps| {
            steps.into_iter().next()
        })
    }
}

/// Links of the step at one position.
pub struct GetStepLinksByStepPosition {
    db: Database,
    position: i32,
}

impl GetStepLinksByStepPosition {
    pub fn new(db: Database, position: i32) -> Self {
        Self { db, position }
    }
}

impl UseCase for GetStepLinksByStepPosition {
    type Output = Vec<StepLink>;

    fn build(&self) -> BoxStream<'static, Result<Vec<StepLink>>> {
        live(
            self.db.step_links().subscribe_by_step_position(self.position),
            |links| links,
        )
    }
}

/// The step at one position together with its links.
///
/// Both are read in one transaction, first right away and then again
/// whenever either kind changes, so a step is never paired with links from
/// another commit.
pub struct GetStepWithLinksByPosition {
    db: Database,
    position: i32,
}

impl GetStepWithLinksByPosition {
    pub fn new(db: Database, position: i32) -> Self {
        Self { db, position }
    }
}

struct Combined {
    db: Database,
    position: i32,
    steps: Subscription<Step>,
    links: Subscription<StepLink>,
    last: Option<StepWithLinks>,
    done: bool,
}

impl Combined {
    async fn read(&self) -> Result<StepWithLinks> {
        let db = self.db.clone();
        let position = self.position;
        tokio::task::spawn_blocking(move || db.step_with_links_by_position(position))
            .await
            .map_err(|e| Error::Persistence(format!("Step read task failed: {}", e)))?
    }

    /// Wait until either kind commits. `false` once the store is gone.
    async fn changed(&mut self) -> bool {
        tokio::select! {
            rows = self.steps.next() => rows.is_some(),
            rows = self.links.next() => rows.is_some(),
        }
    }
}

impl UseCase for GetStepWithLinksByPosition {
    type Output = StepWithLinks;

    fn build(&self) -> BoxStream<'static, Result<StepWithLinks>> {
        let steps = match self.db.steps().subscribe_by_position(self.position) {
            Ok(sub) => sub,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let links = match self
            .db
            .step_links()
            .subscribe_by_step_position(self.position)
        {
            Ok(sub) => sub,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        let state = Combined {
            db: self.db.clone(),
            position: self.position,
            steps,
            links,
            last: None,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            if state.last.is_none() {
                // Take the initial results; the read below supersedes them.
                state.steps.next().await;
                state.links.next().await;
            } else if !state.changed().await {
                return None;
            }
            loop {
                match state.read().await {
                    Ok(item) if state.last.as_ref() == Some(&item) => {
                        // One commit touching both kinds wakes us twice.
                        if !state.changed().await {
                            return None;
                        }
                    }
                    Ok(item) => {
                        state.last = Some(item.clone());
                        return Some((Ok(item), state));
                    }
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
        .boxed()
    }
}

/// Number of completed steps.
pub struct GetNumStepsCompleted {
    db: Database,
}

impl GetNumStepsCompleted {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl UseCase for GetNumStepsCompleted {
    type Output = usize;

    fn build(&self) -> BoxStream<'static, Result<usize>> {
        live(self.db.steps().subscribe_completed(), |steps| steps.len())
    }
}

/// Completed and total step counts, taken from the same snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumCompletedAndTotal {
    pub completed: usize,
    pub total: usize,
}

pub struct GetNumStepsTotalCompleted {
    db: Database,
}

impl GetNumStepsTotalCompleted {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl UseCase for GetNumStepsTotalCompleted {
    type Output = NumCompletedAndTotal;

    fn build(&self) -> BoxStream<'static, Result<NumCompletedAndTotal>> {
        live(self.db.steps().subscribe_all(), |steps| NumCompletedAndTotal {
            completed: steps.iter().filter(|s| s.completed).count(),
            total: steps.len(),
        })
    }
}

/// All news, newest first.
pub struct GetNews {
    db: Database,
}

impl GetNews {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl UseCase for GetNews {
    type Output = Vec<News>;

    fn build(&self) -> BoxStream<'static, Result<Vec<News>>> {
        live(self.db.news().subscribe_all(), |news| news)
    }
}

/// The most recent successful sync. `None` means the app never synced.
pub struct GetLastSuccessfulSync {
    db: Database,
}

impl GetLastSuccessfulSync {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl UseCase for GetLastSuccessfulSync {
    type Output = Option<SyncRecord>;

    fn build(&self) -> BoxStream<'static, Result<Option<SyncRecord>>> {
        live(self.db.syncs().subscribe_last_successful(), |syncs| {
            syncs.into_iter().next()
        })
    }
}

/// Request a sync if one is owed.
///
/// Pending syncs get a jittered request. An app that never synced gets an
/// immediate one. Yields whether a sync was requested.
pub struct SyncIfNecessary {
    db: Database,
    trigger: Arc<dyn SyncTrigger>,
}

impl SyncIfNecessary {
    pub fn new(db: Database, trigger: Arc<dyn SyncTrigger>) -> Self {
        Self { db, trigger }
    }

    fn check(&self) -> Result<bool> {
        let syncs = self.db.syncs();

        if !syncs.pending()?.is_empty() {
            debug!("Pending syncs found; requesting sync");
            self.trigger.enqueue_sync(false);
            return Ok(true);
        }

        if syncs.last_successful()?.is_none() {
            debug!("Never synced; requesting sync now");
            self.trigger.enqueue_sync(true);
            return Ok(true);
        }

        Ok(false)
    }
}

impl UseCase for SyncIfNecessary {
    type Output = bool;

    fn build(&self) -> BoxStream<'static, Result<bool>> {
        let this = SyncIfNecessary {
            db: self.db.clone(),
            trigger: self.trigger.clone(),
        };
        stream::once(async move { this.check() }).boxed()
    }
}

/// Register a push token. Yields whether it was new.
pub struct PostRegistration {
    service: Arc<RegistrationService<dyn RemoteSource>>,
    token: String,
}

impl PostRegistration {
    pub fn new(service: Arc<RegistrationService<dyn RemoteSource>>, token: impl Into<String>) -> Self {
        Self {
            service,
            token: token.into(),
        }
    }
}

impl UseCase for PostRegistration {
    type Output = bool;

    fn build(&self) -> BoxStream<'static, Result<bool>> {
        let service = self.service.clone();
        let token = self.token.clone();
        stream::once(async move { service.register(&token).await }).boxed()
    }
}
