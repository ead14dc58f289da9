//! Common utilities and types shared across Waypoint modules.
//!
//! This module provides the error taxonomy, identifier generation and the
//! entity value types used by the store, the sync engine and the app layer.

pub mod error;
pub mod id;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    GcmMessage, GcmMessageType, GcmRegistration, News, Step, StepLink, StepWithLinks, SyncRecord,
};
