//! Table services.
//!
//! 1. **Context** (`context`): shared collaborators, config and lock registry
//! 2. **Availability** (`availability`): status lifecycle and truth sync checks
//! 3. **Index manager** (`index_manager`): physical schema and row writes
//! 4. **Views** (`views`): view scopes and view population
//! 5. **Query** (`query`): paged, bundled and streamed queries
//! 6. **Rebuild** (`rebuild`): the background worker that builds indexes

pub mod availability;
pub mod context;
pub mod index_manager;
pub mod lock;
pub mod query;
pub mod rebuild;
pub mod views;
pub mod worker;

pub use availability::AvailabilityCoordinator;
pub use context::TableContext;
pub use index_manager::TableIndexManager;
pub use lock::TableLockRegistry;
pub use query::{
    QueryBundleRequest, QueryParts, QueryResult, QueryResultBundle, Row, RowHandler, RowSet,
    StreamedQuery, TableQueryManager,
};
pub use rebuild::{spawn_rebuild_worker, ChannelNotifier, RebuildRunnable};
pub use views::ViewMaterializer;
pub use worker::{BackgroundRunnable, BackgroundWorker};
