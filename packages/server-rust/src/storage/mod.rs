//! Persistence behind the status and view-scope seams.
//!
//! - [`InMemoryStatusStore`] and [`InMemoryViewScopeStore`]: process-local
//!   stores for tests and single-node deployments.
//! - `mysql` (feature `mysql`): the relational backend, including the
//!   [`TableIndexConnection`](crate::traits::TableIndexConnection) that runs
//!   the generated SQL.

#[cfg(feature = "mysql")]
pub mod mysql;
pub mod scope;
pub mod status;

pub use scope::InMemoryViewScopeStore;
pub use status::InMemoryStatusStore;
