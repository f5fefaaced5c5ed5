use std::sync::Arc;

use tabledex_core::{ClockSource, SystemClock};

use super::lock::TableLockRegistry;
use crate::config::TableServiceConfig;
use crate::storage::{InMemoryStatusStore, InMemoryViewScopeStore};
use crate::traits::{
    BenefactorAuthorizer, RebuildNotifier, TableIndexConnection, TableStatusStore, TableTruth,
    ViewScopeStore,
};

// ---------------------------------------------------------------------------
// TableContext
// ---------------------------------------------------------------------------

/// Collaborators and settings shared by the table services.
///
/// Passed down explicitly instead of living in globals. Cloning is cheap:
/// every field is reference counted.
#[derive(Clone)]
pub struct TableContext {
    pub config: Arc<TableServiceConfig>,
    pub index: Arc<dyn TableIndexConnection>,
    pub truth: Arc<dyn TableTruth>,
    pub status_store: Arc<dyn TableStatusStore>,
    pub scope_store: Arc<dyn ViewScopeStore>,
    pub notifier: Arc<dyn RebuildNotifier>,
    pub authorizer: Arc<dyn BenefactorAuthorizer>,
    pub locks: Arc<TableLockRegistry>,
    pub clock: Arc<dyn ClockSource>,
}

impl TableContext {
    /// Context with in-memory status and scope stores, the system clock and
    /// default settings.
    #[must_use]
    pub fn new(
        index: Arc<dyn TableIndexConnection>,
        truth: Arc<dyn TableTruth>,
        notifier: Arc<dyn RebuildNotifier>,
        authorizer: Arc<dyn BenefactorAuthorizer>,
    ) -> Self {
        Self {
            config: Arc::new(TableServiceConfig::default()),
            index,
            truth,
            status_store: Arc::new(InMemoryStatusStore::new()),
            scope_store: Arc::new(InMemoryViewScopeStore::new()),
            notifier,
            authorizer,
            locks: Arc::new(TableLockRegistry::new()),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: TableServiceConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    #[must_use]
    pub fn with_status_store(mut self, store: Arc<dyn TableStatusStore>) -> Self {
        self.status_store = store;
        self
    }

    #[must_use]
    pub fn with_scope_store(mut self, store: Arc<dyn ViewScopeStore>) -> Self {
        self.scope_store = store;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn RebuildNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }
}
