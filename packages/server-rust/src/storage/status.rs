//! In-memory [`TableStatusStore`] backed by [`DashMap`].
//!
//! Token checks and the transitions they guard run under the map's shard
//! lock for the entry, so each attempt is a single compare-and-swap.

use async_trait::async_trait;
use dashmap::DashMap;
use tabledex_core::{TableState, TableStatus};
use uuid::Uuid;

use crate::error::StatusUpdateError;
use crate::traits::TableStatusStore;

/// Status rows kept in process memory.
pub struct InMemoryStatusStore {
    statuses: DashMap<i64, TableStatus>,
}

impl InMemoryStatusStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            statuses: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Applies `change` when `reset_token` matches the stored token.
    fn compare_and_set(
        &self,
        table_id: i64,
        reset_token: &str,
        change: impl FnOnce(&mut TableStatus),
    ) -> Result<(), StatusUpdateError> {
        let mut status = self
            .statuses
            .get_mut(&table_id)
            .ok_or(StatusUpdateError::NotFound { table_id })?;
        if status.reset_token != reset_token {
            return Err(StatusUpdateError::Conflict { table_id });
        }
        change(&mut *status);
        Ok(())
    }
}

impl Default for InMemoryStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TableStatusStore for InMemoryStatusStore {
    async fn get_status(&self, table_id: i64) -> anyhow::Result<Option<TableStatus>> {
        Ok(self.statuses.get(&table_id).map(|s| s.clone()))
    }

    async fn reset_to_processing(&self, table_id: i64, now: u64) -> anyhow::Result<String> {
        let token = Uuid::new_v4().to_string();
        self.statuses
            .insert(table_id, TableStatus::processing(table_id, token.clone(), now));
        Ok(token)
    }

    async fn attempt_set_available(
        &self,
        table_id: i64,
        reset_token: &str,
        etag: Option<&str>,
        now: u64,
    ) -> Result<(), StatusUpdateError> {
        self.compare_and_set(table_id, reset_token, |status| {
            status.state = TableState::Available;
            status.changed_on = now;
            status.last_table_change_etag = etag.map(str::to_string);
            status.total_time_ms = Some(now.saturating_sub(status.started_on));
            status.error_message = None;
            status.error_details = None;
        })
    }

    async fn attempt_set_failed(
        &self,
        table_id: i64,
        reset_token: &str,
        error_message: &str,
        error_details: Option<&str>,
        now: u64,
    ) -> Result<(), StatusUpdateError> {
        self.compare_and_set(table_id, reset_token, |status| {
            status.state = TableState::ProcessingFailed;
            status.changed_on = now;
            status.error_message = Some(error_message.to_string());
            status.error_details = error_details.map(str::to_string);
        })
    }

    async fn attempt_update_progress(
        &self,
        table_id: i64,
        reset_token: &str,
        message: &str,
        current: u64,
        total: u64,
        now: u64,
    ) -> Result<(), StatusUpdateError> {
        self.compare_and_set(table_id, reset_token, |status| {
            status.changed_on = now;
            status.progress_message = Some(message.to_string());
            status.progress_current = Some(current);
            status.progress_total = Some(total);
        })
    }

    async fn delete_status(&self, table_id: i64) -> anyhow::Result<()> {
        self.statuses.remove(&table_id);
        Ok(())
    }
}
