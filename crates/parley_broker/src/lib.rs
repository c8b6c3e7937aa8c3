//! Parley review broker.
//!
//! A coordination service mediating proposer/reviewer exchanges over
//! proposed code changes. Proposers submit reviews; reviewers (humans or
//! spawned worker subprocesses) claim them, exchange threaded messages,
//! and submit verdicts. The broker persists the full lifecycle in SQLite,
//! guarantees at-most-one active reviewer per review via fenced claims,
//! fans out long-poll notifications, and operates a reviewer worker pool
//! that scales against queue pressure.

pub mod audit;
pub mod bindings;
pub mod broker;
pub mod config;
pub mod diff;
pub mod error;
pub mod notify;
pub mod ops;
pub mod pool;
pub mod priority;
pub mod queries;
pub mod reapers;
pub mod spawn;
pub mod state_machine;
pub mod store;

pub use broker::Broker;
pub use error::OpError;
pub use notify::{NotificationBus, QUEUE_TOPIC};
pub use store::Store;
