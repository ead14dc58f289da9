//! Application layer for Waypoint.
//!
//! Wires the entity store, the sync engine and the scheduler behind one
//! [`App`], and exposes the screens' data as use cases run through
//! cancellable [`Pipeline`]s.

pub mod app;
pub mod config;
pub mod pipeline;
pub mod usecases;

pub use app::{build_runtime, App};
pub use config::AppConfig;
pub use pipeline::{
    BackgroundContext, Callbacks, CompletionContext, Handle, Observer, Pipeline, UseCase,
};
pub use usecases::{
    GetLastSuccessfulSync, GetNews, GetNumStepsCompleted, GetNumStepsTotalCompleted,
    GetStepByPosition, GetStepLinksByStepPosition, GetStepWithLinksByPosition, GetSteps,
    NumCompletedAndTotal, PostRegistration, SyncIfNecessary,
};
