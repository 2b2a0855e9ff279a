//! Typed client for the media manager's HTTP API: models, errors, retry
//! policy, score computation, and the client itself.

pub mod client;
pub mod error;
pub mod models;
pub mod retry;
pub mod score;

pub use client::{ManagerClient, ManagerClientConfig};
pub use error::ManagerError;
pub use models::{
    CustomFormatScore, EpisodeFile, HistoryEvent, HistoryEventType, ManualImportCommand,
    ManualImportFile, QualityProfile, QueueItem, QueueStatus, RemoveQueueItemRequest, Series,
    TrackedState,
};
pub use retry::{FailureClass, RetryDecision, RetryPolicy};
