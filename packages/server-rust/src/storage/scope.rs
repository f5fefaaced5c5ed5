//! In-memory [`ViewScopeStore`].

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use tabledex_core::ViewTypeMask;

use crate::traits::ViewScopeStore;

#[derive(Default)]
struct Scopes {
    types: HashMap<i64, ViewTypeMask>,
    containers: HashMap<i64, BTreeSet<i64>>,
}

/// View scopes kept in process memory. A single lock covers both maps so a
/// reader never sees a type paired with another call's scope.
#[derive(Default)]
pub struct InMemoryViewScopeStore {
    inner: RwLock<Scopes>,
}

impl InMemoryViewScopeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ViewScopeStore for InMemoryViewScopeStore {
    async fn set_view_scope_and_type(
        &self,
        view_id: i64,
        container_ids: &BTreeSet<i64>,
        view_type: ViewTypeMask,
    ) -> anyhow::Result<()> {
        let mut scopes = self.inner.write();
        scopes.types.insert(view_id, view_type);
        if container_ids.is_empty() {
            scopes.containers.remove(&view_id);
        } else {
            scopes.containers.insert(view_id, container_ids.clone());
        }
        Ok(())
    }

    async fn get_view_scope(&self, view_id: i64) -> anyhow::Result<BTreeSet<i64>> {
        Ok(self
            .inner
            .read()
            .containers
            .get(&view_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_view_type(&self, view_id: i64) -> anyhow::Result<Option<ViewTypeMask>> {
        Ok(self.inner.read().types.get(&view_id).copied())
    }

    async fn find_view_scope_intersection_with_path(
        &self,
        path_ids: &BTreeSet<i64>,
    ) -> anyhow::Result<BTreeSet<i64>> {
        Ok(self
            .inner
            .read()
            .containers
            .iter()
            .filter(|(_, scope)| !scope.is_disjoint(path_ids))
            .map(|(view_id, _)| *view_id)
            .collect())
    }

    async fn truncate_all(&self) -> anyhow::Result<()> {
        let mut scopes = self.inner.write();
        scopes.types.clear();
        scopes.containers.clear();
        Ok(())
    }
}
