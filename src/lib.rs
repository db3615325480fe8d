//! binlog - a crash-recoverable binary log
//!
//! Records every committed change in an append-only sequence of files,
//! groups concurrent commits into shared fsyncs, coordinates two-phase
//! commit with recoverable storage engines and reconciles them after a
//! crash.
//!
//! Entry point for embedders is [`service::BinlogService`].

pub mod binlog;
pub mod cache;
pub mod cli;
pub mod config;
pub mod crash_point;
pub mod engine;
pub mod group_commit;
pub mod gtid;
pub mod observability;
pub mod recovery;
pub mod service;
pub mod tc;

pub use config::BinlogConfig;
pub use service::{BinlogService, ServiceError, ServiceResult, Session};
