//! Availability state machine of table indices.
//!
//! A table is `Available` while its physical index matches the truth. Drift
//! moves it to `Processing` under a fresh reset token and signals a rebuild;
//! the rebuild finishes by moving it to `Available` or `ProcessingFailed`,
//! which only succeeds while it still holds the current token. A status
//! that has not changed for longer than the processing timeout is treated
//! as abandoned and reset.

use std::collections::BTreeSet;

use tabledex_core::hash::schema_hash;
use tabledex_core::view::{calculate_crc32_sql, SCOPE_PARAMETER};
use tabledex_core::{DbValue, ObjectType, TableState, TableStatus};

use super::context::TableContext;
use super::index_manager::TableIndexManager;
use crate::error::{StatusUpdateError, TableError};
use crate::observability;
use crate::traits::{ChangeType, Params, TableChangeMessage};

/// Drives table status transitions and answers whether an index is current.
#[derive(Clone)]
pub struct AvailabilityCoordinator {
    ctx: TableContext,
    index_manager: TableIndexManager,
}

impl AvailabilityCoordinator {
    #[must_use]
    pub fn new(ctx: TableContext) -> Self {
        let index_manager = TableIndexManager::new(&ctx);
        Self { ctx, index_manager }
    }

    #[must_use]
    pub fn context(&self) -> &TableContext {
        &self.ctx
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Current status of a table, starting a build when there is none, when
    /// the last build stalled, or when an available index has drifted from
    /// the truth.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NotFound`] when neither a status nor the table
    /// exists.
    pub async fn get_table_status_or_create_if_not_exists(
        &self,
        table_id: i64,
    ) -> Result<TableStatus, TableError> {
        let Some(status) = self.ctx.status_store.get_status(table_id).await? else {
            if !self.is_table_available(table_id).await? {
                return Err(TableError::NotFound { table_id });
            }
            return self.set_table_to_processing_and_trigger_update(table_id).await;
        };

        if status.state != TableState::Available {
            let idle_ms = self.ctx.clock.now().saturating_sub(status.changed_on);
            if idle_ms > self.ctx.config.processing_timeout_ms {
                tracing::info!(table_id, idle_ms, state = %status.state, "table build stalled, restarting");
                return self.set_table_to_processing_and_trigger_update(table_id).await;
            }
            return Ok(status);
        }

        if self.is_index_synchronized_with_truth(table_id).await? {
            Ok(status)
        } else {
            tracing::info!(table_id, "table index out of date");
            self.set_table_to_processing_and_trigger_update(table_id).await
        }
    }

    /// Resets the status to `Processing` under a new token and signals a
    /// rebuild carrying that token.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NotFound`] for an unknown table.
    pub async fn set_table_to_processing_and_trigger_update(
        &self,
        table_id: i64,
    ) -> Result<TableStatus, TableError> {
        let object_type = self.get_table_type(table_id).await?;
        let token = self
            .ctx
            .status_store
            .reset_to_processing(table_id, self.ctx.clock.now())
            .await?;
        tracing::info!(table_id, token = %token, "table set to processing");

        self.ctx
            .notifier
            .notify(TableChangeMessage {
                table_id,
                object_type,
                change_type: ChangeType::Update,
                token: Some(token),
            })
            .await?;
        observability::record_rebuild_signalled();
        tracing::debug!(table_id, "rebuild signalled");

        self.ctx
            .status_store
            .get_status(table_id)
            .await?
            .ok_or(TableError::NotFound { table_id })
    }

    /// Starts a processing attempt without signalling a rebuild and returns
    /// its token.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when the status cannot be written.
    pub async fn start_table_processing(&self, table_id: i64) -> Result<String, TableError> {
        let token = self
            .ctx
            .status_store
            .reset_to_processing(table_id, self.ctx.clock.now())
            .await?;
        tracing::info!(table_id, token = %token, "table processing started");
        Ok(token)
    }

    /// # Errors
    ///
    /// Returns [`TableError::ConflictingUpdate`] when `reset_token` is no
    /// longer current.
    pub async fn attempt_set_available(
        &self,
        table_id: i64,
        reset_token: &str,
        etag: Option<&str>,
    ) -> Result<(), TableError> {
        let result = self
            .ctx
            .status_store
            .attempt_set_available(table_id, reset_token, etag, self.ctx.clock.now())
            .await;
        guarded(table_id, result)?;
        tracing::info!(table_id, etag, "table set to available");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`TableError::ConflictingUpdate`] when `reset_token` is no
    /// longer current.
    pub async fn attempt_set_failed(
        &self,
        table_id: i64,
        reset_token: &str,
        error_message: &str,
        error_details: Option<&str>,
    ) -> Result<(), TableError> {
        let result = self
            .ctx
            .status_store
            .attempt_set_failed(
                table_id,
                reset_token,
                error_message,
                error_details,
                self.ctx.clock.now(),
            )
            .await;
        guarded(table_id, result)?;
        tracing::warn!(table_id, error_message, "table set to failed");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`TableError::ConflictingUpdate`] when `reset_token` is no
    /// longer current.
    pub async fn attempt_update_progress(
        &self,
        table_id: i64,
        reset_token: &str,
        message: &str,
        current: u64,
        total: u64,
    ) -> Result<(), TableError> {
        let result = self
            .ctx
            .status_store
            .attempt_update_progress(
                table_id,
                reset_token,
                message,
                current,
                total,
                self.ctx.clock.now(),
            )
            .await;
        guarded(table_id, result)
    }

    /// Status of an available table.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Unavailable`] while the table is processing and
    /// [`TableError::Failed`] after a failed build, each carrying the status.
    pub async fn validate_table_is_available(&self, table_id: i64) -> Result<TableStatus, TableError> {
        let status = self.get_table_status_or_create_if_not_exists(table_id).await?;
        match status.state {
            TableState::Available => Ok(status),
            TableState::Processing => Err(TableError::Unavailable(Box::new(status))),
            TableState::ProcessingFailed => Err(TableError::Failed(Box::new(status))),
        }
    }

    /// Signals that the index of a deleted table should be dropped.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when the signal cannot be sent.
    pub async fn set_table_deleted(&self, table_id: i64, object_type: ObjectType) -> Result<(), TableError> {
        self.ctx
            .notifier
            .notify(TableChangeMessage {
                table_id,
                object_type,
                change_type: ChangeType::Delete,
                token: None,
            })
            .await?;
        tracing::info!(table_id, "table deletion signalled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Synchronization
    // -----------------------------------------------------------------------

    /// Whether the physical index was built from the current schema and
    /// version of the truth.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NotFound`] for an unknown table.
    pub async fn is_index_synchronized_with_truth(&self, table_id: i64) -> Result<bool, TableError> {
        let truth_hash = self.get_schema_hash(table_id).await?;
        let truth_version = self.get_table_version(table_id).await?;
        Ok(self
            .index_manager
            .does_index_state_match(table_id, truth_version, &truth_hash)
            .await)
    }

    /// Whether a build of this table still has work to do.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when a collaborator fails.
    pub async fn is_index_work_required(&self, table_id: i64) -> Result<bool, TableError> {
        if !self.is_table_available(table_id).await? {
            return Ok(false);
        }
        if !self.is_index_synchronized_with_truth(table_id).await? {
            return Ok(true);
        }
        let status = self.ctx.status_store.get_status(table_id).await?;
        Ok(status.is_some_and(|s| s.state == TableState::Processing))
    }

    /// Hex SHA-256 over the ids of the table's current columns.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when the truth cannot be read.
    pub async fn get_schema_hash(&self, table_id: i64) -> Result<String, TableError> {
        let schema = self.ctx.truth.column_models(table_id).await?;
        Ok(schema_hash(&schema))
    }

    /// Version of the truth: the last change number of a table (-1 before
    /// the first change), or the replication checksum of a view.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NotFound`] for an unknown table.
    pub async fn get_table_version(&self, table_id: i64) -> Result<i64, TableError> {
        match self.get_table_type(table_id).await? {
            ObjectType::Table => Ok(self
                .ctx
                .truth
                .last_change_version(table_id)
                .await?
                .unwrap_or(-1)),
            ObjectType::EntityView => self.calculate_view_crc32(table_id).await,
        }
    }

    /// Checksum of the replicated rows within a view's expanded scope; -1
    /// for a view with no scope or no rows.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when the checksum query fails.
    pub async fn calculate_view_crc32(&self, view_id: i64) -> Result<i64, TableError> {
        let Some(view_type) = self.ctx.scope_store.get_view_type(view_id).await? else {
            return Ok(-1);
        };
        let containers = self.get_all_container_ids_for_view_scope(view_id).await?;
        if containers.is_empty() {
            return Ok(-1);
        }
        let params = Params::from([(
            SCOPE_PARAMETER.to_string(),
            DbValue::LongList(containers.into_iter().collect()),
        )]);
        Ok(self
            .ctx
            .index
            .query_long(&calculate_crc32_sql(view_type), &params)
            .await?
            .unwrap_or(-1))
    }

    /// The view's scope plus every container below each scoped container.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when a collaborator fails.
    pub async fn get_all_container_ids_for_view_scope(
        &self,
        view_id: i64,
    ) -> Result<BTreeSet<i64>, TableError> {
        let scope = self.ctx.scope_store.get_view_scope(view_id).await?;
        let mut all = scope.clone();
        for container_id in scope {
            all.extend(self.ctx.truth.child_container_ids(container_id).await?);
        }
        Ok(all)
    }

    /// Whether the table exists and is not in the trash.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when the truth cannot be read.
    pub async fn is_table_available(&self, table_id: i64) -> Result<bool, TableError> {
        Ok(self.ctx.truth.object_type(table_id).await?.is_some())
    }

    /// # Errors
    ///
    /// Returns [`TableError::NotFound`] for an unknown table.
    pub async fn get_table_type(&self, table_id: i64) -> Result<ObjectType, TableError> {
        self.ctx
            .truth
            .object_type(table_id)
            .await?
            .ok_or(TableError::NotFound { table_id })
    }
}

/// Counts and logs a rejected stale token before converting the error.
fn guarded(table_id: i64, result: Result<(), StatusUpdateError>) -> Result<(), TableError> {
    if let Err(StatusUpdateError::Conflict { .. }) = &result {
        observability::record_status_conflict();
        tracing::warn!(table_id, "stale reset token rejected");
    }
    result.map_err(TableError::from)
}

#[cfg(test)]
mod tests {
    use tabledex_core::{ColumnModel, ColumnType, ViewTypeMask};

    use super::*;
    use crate::testing::Harness;
    use crate::traits::ChangeSet;

    fn schema() -> Vec<ColumnModel> {
        vec![ColumnModel::new(1, "name", ColumnType::String)]
    }

    fn change_set(version: i64) -> ChangeSet {
        ChangeSet {
            version,
            etag: format!("etag-{version}"),
            rows: vec![],
            deleted_row_ids: vec![],
        }
    }

    #[tokio::test]
    async fn missing_status_of_unknown_table_is_not_found() {
        let h = Harness::new();
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());

        let err = coordinator
            .get_table_status_or_create_if_not_exists(5)
            .await
            .unwrap_err();

        assert!(matches!(err, TableError::NotFound { table_id: 5 }));
        assert!(h.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn missing_status_starts_a_build() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());

        let status = coordinator
            .get_table_status_or_create_if_not_exists(5)
            .await
            .unwrap();

        assert_eq!(status.state, TableState::Processing);
        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].change_type, ChangeType::Update);
        assert_eq!(messages[0].object_type, ObjectType::Table);
        assert_eq!(messages[0].token.as_deref(), Some(status.reset_token.as_str()));
    }

    #[tokio::test]
    async fn processing_status_within_timeout_is_left_alone() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());
        let first = coordinator
            .set_table_to_processing_and_trigger_update(5)
            .await
            .unwrap();

        h.clock.advance(h.ctx.config.processing_timeout_ms);
        let status = coordinator
            .get_table_status_or_create_if_not_exists(5)
            .await
            .unwrap();

        assert_eq!(status.reset_token, first.reset_token);
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn stalled_build_is_restarted() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());
        let first = coordinator
            .set_table_to_processing_and_trigger_update(5)
            .await
            .unwrap();

        h.clock.advance(h.ctx.config.processing_timeout_ms + 1);
        let status = coordinator
            .get_table_status_or_create_if_not_exists(5)
            .await
            .unwrap();

        assert_ne!(status.reset_token, first.reset_token);
        assert_eq!(h.notifier.messages().len(), 2);
    }

    #[tokio::test]
    async fn available_and_synchronized_stays_available() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        h.truth.append_change_set(5, change_set(3));
        h.index.set_index_state(5, 3, &schema_hash(&schema()));
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());
        let token = coordinator.start_table_processing(5).await.unwrap();
        coordinator
            .attempt_set_available(5, &token, Some("etag-3"))
            .await
            .unwrap();

        let status = coordinator.validate_table_is_available(5).await.unwrap();

        assert_eq!(status.state, TableState::Available);
        assert_eq!(status.last_table_change_etag.as_deref(), Some("etag-3"));
        assert!(h.notifier.messages().is_empty());
        assert!(!coordinator.is_index_work_required(5).await.unwrap());
    }

    #[tokio::test]
    async fn drift_moves_available_table_to_processing() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        h.truth.append_change_set(5, change_set(3));
        h.index.set_index_state(5, 3, &schema_hash(&schema()));
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());
        let token = coordinator.start_table_processing(5).await.unwrap();
        coordinator
            .attempt_set_available(5, &token, None)
            .await
            .unwrap();

        h.truth.append_change_set(5, change_set(4));
        assert!(coordinator.is_index_work_required(5).await.unwrap());
        let err = coordinator.validate_table_is_available(5).await.unwrap_err();

        assert!(matches!(err, TableError::Unavailable(ref s) if s.state == TableState::Processing));
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn schema_change_is_drift() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        h.index.set_index_state(5, -1, &schema_hash(&schema()));
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());
        assert!(coordinator.is_index_synchronized_with_truth(5).await.unwrap());

        h.truth.set_schema(
            5,
            vec![
                ColumnModel::new(1, "name", ColumnType::String),
                ColumnModel::new(2, "age", ColumnType::Integer),
            ],
        );
        assert!(!coordinator.is_index_synchronized_with_truth(5).await.unwrap());
    }

    #[tokio::test]
    async fn superseded_token_cannot_finish() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());
        let t1 = coordinator
            .set_table_to_processing_and_trigger_update(5)
            .await
            .unwrap()
            .reset_token;
        let t2 = coordinator
            .set_table_to_processing_and_trigger_update(5)
            .await
            .unwrap()
            .reset_token;

        let err = coordinator
            .attempt_set_available(5, &t1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::ConflictingUpdate { table_id: 5 }));
        let err = coordinator
            .attempt_update_progress(5, &t1, "rows", 1, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::ConflictingUpdate { table_id: 5 }));

        coordinator
            .attempt_set_failed(5, &t2, "bad schema", Some("details"))
            .await
            .unwrap();
        let err = coordinator.validate_table_is_available(5).await.unwrap_err();
        assert!(
            matches!(err, TableError::Failed(ref s) if s.error_message.as_deref() == Some("bad schema"))
        );
    }

    #[tokio::test]
    async fn view_version_is_the_scope_checksum() {
        let h = Harness::new();
        h.truth.add_table(9, ObjectType::EntityView, schema());
        h.truth.set_children(100, vec![101, 102]);
        h.ctx
            .scope_store
            .set_view_scope_and_type(9, &BTreeSet::from([100]), ViewTypeMask::FILE)
            .await
            .unwrap();
        h.index
            .respond_long(&calculate_crc32_sql(ViewTypeMask::FILE), Some(777));
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());

        assert_eq!(
            coordinator.get_all_container_ids_for_view_scope(9).await.unwrap(),
            BTreeSet::from([100, 101, 102])
        );
        assert_eq!(coordinator.get_table_version(9).await.unwrap(), 777);
        let params = h
            .index
            .params_for(&calculate_crc32_sql(ViewTypeMask::FILE))
            .unwrap();
        assert_eq!(
            params.get(SCOPE_PARAMETER),
            Some(&DbValue::LongList(vec![100, 101, 102]))
        );
    }

    #[tokio::test]
    async fn unscoped_view_has_no_version() {
        let h = Harness::new();
        h.truth.add_table(9, ObjectType::EntityView, schema());
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());
        assert_eq!(coordinator.get_table_version(9).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn deletion_is_signalled_without_a_token() {
        let h = Harness::new();
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());
        coordinator
            .set_table_deleted(5, ObjectType::Table)
            .await
            .unwrap();
        let messages = h.notifier.messages();
        assert_eq!(messages[0].change_type, ChangeType::Delete);
        assert!(messages[0].token.is_none());
    }

    #[tokio::test]
    async fn trashed_table_needs_no_work() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        h.truth.remove_table(5);
        let coordinator = AvailabilityCoordinator::new(h.ctx.clone());
        assert!(!coordinator.is_index_work_required(5).await.unwrap());
    }
}
