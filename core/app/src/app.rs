//! Application facade wiring the store, sync engine, scheduler and pipelines.

use std::sync::Arc;
use tokio::runtime;
use tracing::info;

use waypoint_common::{GcmMessage, Result};
use waypoint_storage::Database;
use waypoint_sync::{
    Enqueued, PushHandler, RegistrationService, RemoteSource, SyncEngine, SyncReport,
    SyncScheduler, SyncTrigger,
};

use crate::config::AppConfig;
use crate::pipeline::{BackgroundContext, CompletionContext, Pipeline, UseCase};
use crate::usecases::{
    GetLastSuccessfulSync, GetNews, GetNumStepsCompleted, GetNumStepsTotalCompleted,
    GetStepByPosition, GetStepLinksByStepPosition, GetStepWithLinksByPosition, GetSteps,
    PostRegistration, SyncIfNecessary,
};

type Engine = SyncEngine<dyn RemoteSource>;

/// Everything the app needs, built from one [`AppConfig`] and a remote.
pub struct App {
    config: AppConfig,
    db: Database,
    engine: Arc<Engine>,
    scheduler: SyncScheduler<Engine>,
    registration: Arc<RegistrationService<dyn RemoteSource>>,
    push: PushHandler,
    background: BackgroundContext,
    completion: CompletionContext,
}

impl App {
    /// Open the database and wire the app on the current tokio runtime.
    ///
    /// # Errors
    /// - `InvalidInput` when called outside a tokio runtime
    /// - `Persistence` if the database cannot be opened
    pub fn open(config: AppConfig, remote: Arc<dyn RemoteSource>) -> Result<Self> {
        let background = BackgroundContext::current()?;
        let completion = CompletionContext::spawn(background.runtime());
        Self::with_contexts(config, remote, background, completion)
    }

    /// Like [`App::open`], with explicit execution contexts.
    pub fn with_contexts(
        config: AppConfig,
        remote: Arc<dyn RemoteSource>,
        background: BackgroundContext,
        completion: CompletionContext,
    ) -> Result<Self> {
        let db = Database::open(&config.store_config())?;

        let engine: Arc<Engine> = Arc::new(SyncEngine::from_arc(
            db.clone(),
            remote.clone(),
            config.sync.clone(),
        ));
        let scheduler = SyncScheduler::with_runtime(
            engine.clone(),
            config.scheduler.clone(),
            background.runtime().clone(),
        );
        let trigger: Arc<dyn SyncTrigger> = Arc::new(scheduler.clone());

        let registration = Arc::new(RegistrationService::new(
            db.clone(),
            remote.clone(),
            trigger.clone(),
        ));
        let push = PushHandler::new(db.clone(), trigger);

        info!("App ready with remote {}", remote.name());
        Ok(Self {
            config,
            db,
            engine,
            scheduler,
            registration,
            push,
            background,
            completion,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &SyncScheduler<Engine> {
        &self.scheduler
    }

    /// A new pipeline for use case `U` on this app's contexts.
    pub fn pipeline<U: UseCase>(&self) -> Pipeline<U> {
        Pipeline::new(self.background.clone(), self.completion.clone())
    }

    /// Request a sync. See [`SyncScheduler::enqueue_sync`].
    pub fn enqueue_sync(&self, force_now: bool) -> Enqueued {
        self.scheduler.enqueue_sync(force_now)
    }

    /// Run a forced sync and wait for its report.
    pub async fn sync_now(&self) -> SyncReport {
        self.scheduler.run_now(true).await
    }

    /// Register a push token. See [`RegistrationService::register`].
    pub async fn register(&self, token: &str) -> Result<bool> {
        self.registration.register(token).await
    }

    /// Handle an incoming push message. See [`PushHandler::on_message`].
    pub fn on_push_message(&self, topic: &str, data: &str) -> Result<GcmMessage> {
        self.push.on_message(topic, data)
    }

    pub fn get_steps(&self) -> GetSteps {
        GetSteps::new(self.db.clone())
    }

    pub fn get_step_by_position(&self, position: i32) -> GetStepByPosition {
        GetStepByPosition::new(self.db.clone(), position)
    }

    pub fn get_step_with_links_by_position(&self, position: i32) -> GetStepWithLinksByPosition {
        GetStepWithLinksByPosition::new(self.db.clone(), position)
    }

    pub fn get_step_links_by_step_position(&self, position: i32) -> GetStepLinksByStepPosition {
        GetStepLinksByStepPosition::new(self.db.clone(), position)
    }

    pub fn get_num_steps_completed(&self) -> GetNumStepsCompleted {
        GetNumStepsCompleted::new(self.db.clone())
    }

    pub fn get_num_steps_total_completed(&self) -> GetNumStepsTotalCompleted {
        GetNumStepsTotalCompleted::new(self.db.clone())
    }

    pub fn get_news(&self) -> GetNews {
        GetNews::new(self.db.clone())
    }

    pub fn get_last_successful_sync(&self) -> GetLastSuccessfulSync {
        GetLastSuccessfulSync::new(self.db.clone())
    }

    pub fn sync_if_necessary(&self) -> SyncIfNecessary {
        SyncIfNecessary::new(self.db.clone(), Arc::new(self.scheduler.clone()))
    }

    /// Like [`App::sync_if_necessary`], but a requested sync always starts
    /// right away instead of arming the jittered trigger. For hosts that
    /// exit once the sync is done.
    pub fn sync_if_necessary_now(&self) -> SyncIfNecessary {
        SyncIfNecessary::new(self.db.clone(), Arc::new(RunNow(self.scheduler.clone())))
    }

    pub fn post_registration(&self, token: impl Into<String>) -> PostRegistration {
        PostRegistration::new(self.registration.clone(), token)
    }

    /// Disarm the delayed sync trigger.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

/// Turns every sync request into an immediate run.
struct RunNow<T>(T);

impl<T: SyncTrigger> SyncTrigger for RunNow<T> {
    fn enqueue_sync(&self, _force_now: bool) -> Enqueued {
        self.0.enqueue_sync(true)
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

/// Build a multi-threaded runtime for hosts that do not run one.
pub fn build_runtime() -> Result<runtime::Runtime> {
    runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("waypoint-worker")
        .build()
        .map_err(Into::into)
}
