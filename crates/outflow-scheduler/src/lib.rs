//! # Outflow Scheduler
//!
//! Durable delayed-job queue. No Redis, no broker — SQLite persistence,
//! tokio timers, and deterministic job ids.
//!
//! ## Guarantees
//! - **At-most-once enqueue**: job ids derive deterministically from
//!   `(kind, conversation_id[, node_id])`; duplicate enqueue attempts from
//!   at-least-once upstream delivery collapse into one row.
//! - **At-least-once execution**: a claimed job that crashes mid-flight is
//!   retried up to its attempt limit, then parked for manual inspection.
//!   Consumers are expected to be idempotent.
//! - **Introspection**: waiting/delayed/failed sets are queryable, and
//!   delayed jobs can be cancelled by conversation id.
//!
//! ```text
//! enqueue(job) ──▶ [queued] ──claim──▶ [running] ──ok──▶ [completed | queued(repeat)]
//!                     ▲                    │err
//!                     └──── backoff ◀──────┤
//!                                          └─ attempts exhausted ──▶ [parked]
//! ```

pub mod engine;
pub mod jobs;
pub mod persistence;

pub use engine::{JobHandler, SchedulerEngine, spawn_scheduler};
pub use jobs::{Job, JobKind, JobState, RetryPolicy};
pub use persistence::{JobStore, QueueStats};
