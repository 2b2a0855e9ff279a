//! Decision and reconciliation engine for a media manager's download queue.
//!
//! This library reconciles grab-time custom-format scoring against what
//! actually imported, so a release that looked best at grab time but lost a
//! scoring race to a later import (or got stuck entirely) is force-imported,
//! removed, or left alone according to its tracker class and the configured
//! thresholds.
//!
//! # Architecture
//!
//! - [`analyzer`] - pure scoring comparison and the decision table
//! - [`cache`] - TTL-based read-through cache used by the manager client
//! - [`config`] - typed configuration, loaded from TOML plus env overlay
//! - [`engine`] - the reconciliation routine and periodic scan loop
//! - [`manager`] - HTTP client, wire types, and retry policy for the manager API
//! - [`metrics`] - counters exposed over `/metrics`
//! - [`scheduler`] - delayed post-grab check tasks
//! - [`webhook`] - authenticated event receiver plus `/health` and `/metrics`

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod analyzer;
pub mod cache;
pub mod config;
pub mod engine;
pub mod manager;
pub mod metrics;
pub mod scheduler;
pub mod webhook;

// Re-export the types most callers reach for first.
pub use analyzer::{Decision, Thresholds, TrackerClass, analyze, classify_tracker};
pub use config::Config;
pub use engine::{ReconcileError, ReconcileOutcome, ReconciliationEngine, TrackerLists};
pub use manager::{ManagerClient, ManagerClientConfig, ManagerError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use scheduler::{DelayedTaskScheduler, Fingerprint, Trigger};
