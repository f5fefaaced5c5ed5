//! `tabledex` server: keeps per-table index databases in step with the
//! authoritative table data and answers paged, faceted and streamed queries
//! against them.
//!
//! The service holds no transport. Callers wire a [`service::TableContext`]
//! from implementations of the seams in [`traits`], start the rebuild worker
//! with [`service::spawn_rebuild_worker`] and call the managers directly.

pub mod config;
pub mod error;
pub mod observability;
pub mod service;
pub mod storage;
pub mod traits;

#[cfg(test)]
mod testing;

pub use config::TableServiceConfig;
pub use error::{StatusUpdateError, TableError};
pub use traits::{
    BenefactorAuthorizer, ChangeSet, ChangeType, RebuildNotifier, TableChangeMessage,
    TableIndexConnection, TableStatusStore, TableTruth, UserInfo, ViewScopeStore,
};
