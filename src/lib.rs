//! Tasklane: task coordination core.
//!
//! Submission, queue routing, status tracking with queue-timeout detection,
//! subtask fan-out, admin alerting and per-task scratch storage, plus the
//! worker pool and image super-resolution stages that run on top of it.

pub mod api;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod pipeline;
pub mod registry;
pub mod routing;
pub mod scratch;
pub mod task;
pub mod tracker;
pub mod worker;
