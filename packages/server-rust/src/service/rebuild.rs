//! Rebuild worker.
//!
//! Consumes [`TableChangeMessage`]s and brings each table index up to date
//! under the table's exclusive lock: schema first, then rows, then the
//! recorded schema hash, and finally the status. Only the attempt holding
//! the current reset token may finish; a superseded attempt stops quietly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tabledex_core::{ColumnModel, ObjectType};
use tokio::sync::mpsc;

use super::availability::AvailabilityCoordinator;
use super::context::TableContext;
use super::index_manager::TableIndexManager;
use super::views::ViewMaterializer;
use super::worker::{BackgroundRunnable, BackgroundWorker};
use crate::error::TableError;
use crate::traits::{ChangeType, RebuildNotifier, TableChangeMessage};

// ---------------------------------------------------------------------------
// ChannelNotifier
// ---------------------------------------------------------------------------

/// [`RebuildNotifier`] feeding an in-process rebuild worker.
pub struct ChannelNotifier {
    tx: mpsc::Sender<TableChangeMessage>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new(tx: mpsc::Sender<TableChangeMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl RebuildNotifier for ChannelNotifier {
    async fn notify(&self, message: TableChangeMessage) -> anyhow::Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("rebuild channel closed"))
    }
}

// ---------------------------------------------------------------------------
// RebuildRunnable
// ---------------------------------------------------------------------------

/// Applies one change message at a time.
pub struct RebuildRunnable {
    ctx: TableContext,
    availability: AvailabilityCoordinator,
    index_manager: TableIndexManager,
    views: ViewMaterializer,
}

impl RebuildRunnable {
    #[must_use]
    pub fn new(ctx: TableContext) -> Self {
        Self {
            availability: AvailabilityCoordinator::new(ctx.clone()),
            index_manager: TableIndexManager::new(&ctx),
            views: ViewMaterializer::new(ctx.clone()),
            ctx,
        }
    }

    /// Handles one message.
    ///
    /// # Errors
    ///
    /// Returns the error that failed the build; the table's status then
    /// records it. A superseded attempt is not an error.
    pub async fn handle(&self, message: TableChangeMessage) -> Result<(), TableError> {
        match message.change_type {
            ChangeType::Update => match message.token {
                Some(token) => self.update(message.table_id, message.object_type, &token).await,
                None => {
                    tracing::warn!(table_id = message.table_id, "update without a reset token ignored");
                    Ok(())
                }
            },
            ChangeType::Delete => self.delete(message.table_id).await,
        }
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.ctx.config.read_lock_timeout_ms)
    }

    async fn update(&self, table_id: i64, object_type: ObjectType, token: &str) -> Result<(), TableError> {
        if !self.availability.is_index_work_required(table_id).await? {
            tracing::debug!(table_id, "index already current");
            return Ok(());
        }

        let result = self
            .ctx
            .locks
            .run_with_exclusive_lock(table_id, self.lock_timeout(), move || async move {
                self.build(table_id, object_type, token).await
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(TableError::ConflictingUpdate { .. }) => {
                tracing::info!(table_id, token = %token, "rebuild superseded by a newer attempt");
                Ok(())
            }
            Err(e @ TableError::LockUnavailable { .. }) => Err(e),
            Err(e) => {
                let message = e.to_string();
                let details = format!("{e:?}");
                match self
                    .availability
                    .attempt_set_failed(table_id, token, &message, Some(&details))
                    .await
                {
                    Ok(()) | Err(TableError::ConflictingUpdate { .. }) => {}
                    Err(status_error) => {
                        tracing::error!(table_id, error = %status_error, "could not record failed build");
                    }
                }
                Err(e)
            }
        }
    }

    async fn build(&self, table_id: i64, object_type: ObjectType, token: &str) -> Result<(), TableError> {
        let started = Instant::now();
        self.availability
            .attempt_update_progress(table_id, token, "Updating schema", 0, 1)
            .await?;

        let schema = self.ctx.truth.column_models(table_id).await?;
        self.index_manager
            .update_table_schema(table_id, object_type.is_view(), &schema)
            .await?;
        self.index_manager.optimize_table_indices(table_id).await?;

        let etag = match object_type {
            ObjectType::Table => self.apply_change_sets(table_id, &schema, token).await?,
            ObjectType::EntityView => Some(self.rebuild_view(table_id, &schema, token).await?),
        };

        self.index_manager.set_index_schema(table_id, &schema).await?;
        self.availability
            .attempt_set_available(table_id, token, etag.as_deref())
            .await?;
        tracing::info!(
            table_id,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "table index rebuilt"
        );
        Ok(())
    }

    /// Applies the change sets the index has not seen and returns the etag
    /// of the newest one.
    async fn apply_change_sets(
        &self,
        table_id: i64,
        schema: &[ColumnModel],
        token: &str,
    ) -> Result<Option<String>, TableError> {
        let index_version = self
            .index_manager
            .get_index_version(table_id)
            .await?
            .unwrap_or(-1);
        let change_sets = self.ctx.truth.change_sets_after(table_id, index_version).await?;
        let total = u64::try_from(change_sets.len()).unwrap_or(u64::MAX);

        let mut etag = None;
        for (applied, change_set) in (0_u64..).zip(change_sets.iter()) {
            self.availability
                .attempt_update_progress(
                    table_id,
                    token,
                    &format!("Applying change set {}", change_set.version),
                    applied,
                    total,
                )
                .await?;
            self.index_manager
                .apply_change_set(table_id, schema, change_set)
                .await?;
            etag = Some(change_set.etag.clone());
        }

        if etag.is_none() && index_version >= 0 {
            etag = self
                .ctx
                .truth
                .change_sets_after(table_id, index_version - 1)
                .await?
                .into_iter()
                .next()
                .map(|change_set| change_set.etag);
        }
        tracing::debug!(table_id, applied = total, "change sets applied");
        Ok(etag)
    }

    /// Re-populates a view and records the replication checksum it was
    /// built from, which is also its etag.
    async fn rebuild_view(
        &self,
        view_id: i64,
        schema: &[ColumnModel],
        token: &str,
    ) -> Result<String, TableError> {
        let checksum = self.availability.calculate_view_crc32(view_id).await?;
        self.availability
            .attempt_update_progress(view_id, token, "Populating view", 0, 1)
            .await?;
        self.views.populate_view(view_id, schema).await?;
        self.index_manager.set_index_version(view_id, checksum).await?;
        Ok(checksum.to_string())
    }

    async fn delete(&self, table_id: i64) -> Result<(), TableError> {
        self.ctx
            .locks
            .run_with_exclusive_lock(table_id, self.lock_timeout(), move || async move {
                self.index_manager.delete_table_index(table_id).await?;
                self.ctx.status_store.delete_status(table_id).await?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl BackgroundRunnable for RebuildRunnable {
    type Task = TableChangeMessage;

    async fn run(&mut self, task: TableChangeMessage) {
        let table_id = task.table_id;
        if let Err(e) = self.handle(task).await {
            tracing::warn!(table_id, error = %e, "table rebuild failed");
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("rebuild worker stopped");
    }
}

/// Starts a rebuild worker for `ctx` and returns the context whose notifier
/// feeds it, together with the worker handle.
#[must_use]
pub fn spawn_rebuild_worker(ctx: TableContext) -> (TableContext, BackgroundWorker<RebuildRunnable>) {
    let worker = BackgroundWorker::start(
        RebuildRunnable::new(ctx.clone()),
        ctx.config.rebuild_tick_interval_ms,
        ctx.config.rebuild_channel_capacity,
    );
    let ctx = match worker.sender() {
        Some(tx) => ctx.with_notifier(Arc::new(ChannelNotifier::new(tx))),
        None => ctx,
    };
    (ctx, worker)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use tabledex_core::ddl;
    use tabledex_core::hash::schema_hash;
    use tabledex_core::view::calculate_crc32_sql;
    use tabledex_core::{ColumnType, RowWrite, TableState, ViewTypeMask};

    use super::*;
    use crate::testing::Harness;
    use crate::traits::ChangeSet;

    fn schema() -> Vec<ColumnModel> {
        vec![ColumnModel::new(1, "foo", ColumnType::String).with_maximum_size(50)]
    }

    fn change_set(version: i64, etag: &str) -> ChangeSet {
        ChangeSet {
            version,
            etag: etag.to_string(),
            rows: vec![RowWrite {
                row_id: version + 100,
                version,
                values: BTreeMap::from([(1, format!("v{version}"))]),
            }],
            deleted_row_ids: Vec::new(),
        }
    }

    fn update(table_id: i64, object_type: ObjectType, token: &str) -> TableChangeMessage {
        TableChangeMessage {
            table_id,
            object_type,
            change_type: ChangeType::Update,
            token: Some(token.to_string()),
        }
    }

    #[tokio::test]
    async fn table_rebuild_applies_change_sets() {
        let h = Harness::new();
        h.truth.add_table(7, ObjectType::Table, schema());
        h.truth.append_change_set(7, change_set(0, "e0"));
        h.truth.append_change_set(7, change_set(1, "e1"));
        let token = h.ctx.status_store.reset_to_processing(7, 1_000).await.unwrap();
        let rebuild = RebuildRunnable::new(h.ctx.clone());

        rebuild.handle(update(7, ObjectType::Table, &token)).await.unwrap();

        assert!(h.index.executed(&ddl::create_table_if_does_not_exist_sql(7, false)));
        assert_eq!(h.index.index_version(7), Some(1));
        assert_eq!(h.index.index_schema_hash(7), Some(schema_hash(&schema())));
        let status = h.ctx.status_store.get_status(7).await.unwrap().unwrap();
        assert_eq!(status.state, TableState::Available);
        assert_eq!(status.last_table_change_etag.as_deref(), Some("e1"));
        assert!(AvailabilityCoordinator::new(h.ctx.clone())
            .is_index_synchronized_with_truth(7)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn second_rebuild_only_applies_new_change_sets() {
        let h = Harness::new();
        h.truth.add_table(7, ObjectType::Table, schema());
        h.truth.append_change_set(7, change_set(0, "e0"));
        let rebuild = RebuildRunnable::new(h.ctx.clone());
        let token = h.ctx.status_store.reset_to_processing(7, 1_000).await.unwrap();
        rebuild.handle(update(7, ObjectType::Table, &token)).await.unwrap();

        h.truth.append_change_set(7, change_set(1, "e1"));
        let token = h.ctx.status_store.reset_to_processing(7, 2_000).await.unwrap();
        rebuild.handle(update(7, ObjectType::Table, &token)).await.unwrap();

        assert_eq!(h.index.count_starting_with("INSERT INTO T7("), 2);
        assert_eq!(h.index.index_version(7), Some(1));
    }

    #[tokio::test]
    async fn unchanged_rows_keep_the_last_etag() {
        let h = Harness::new();
        h.truth.add_table(7, ObjectType::Table, schema());
        h.truth.append_change_set(7, change_set(0, "e0"));
        let rebuild = RebuildRunnable::new(h.ctx.clone());
        let token = h.ctx.status_store.reset_to_processing(7, 1_000).await.unwrap();
        rebuild.handle(update(7, ObjectType::Table, &token)).await.unwrap();

        // Schema change only: the rows are already current.
        h.truth.set_schema(7, vec![ColumnModel::new(2, "bar", ColumnType::Integer)]);
        let token = h.ctx.status_store.reset_to_processing(7, 2_000).await.unwrap();
        rebuild.handle(update(7, ObjectType::Table, &token)).await.unwrap();

        let status = h.ctx.status_store.get_status(7).await.unwrap().unwrap();
        assert_eq!(status.state, TableState::Available);
        assert_eq!(status.last_table_change_etag.as_deref(), Some("e0"));
    }

    #[tokio::test]
    async fn view_rebuild_records_the_checksum() {
        let h = Harness::new();
        h.truth.add_table(9, ObjectType::EntityView, schema());
        h.ctx
            .scope_store
            .set_view_scope_and_type(9, &BTreeSet::from([100]), ViewTypeMask::FILE)
            .await
            .unwrap();
        h.index
            .respond_long(&calculate_crc32_sql(ViewTypeMask::FILE), Some(4242));
        let token = h.ctx.status_store.reset_to_processing(9, 1_000).await.unwrap();
        let rebuild = RebuildRunnable::new(h.ctx.clone());

        rebuild
            .handle(update(9, ObjectType::EntityView, &token))
            .await
            .unwrap();

        assert!(h.index.executed(&ddl::create_table_if_does_not_exist_sql(9, true)));
        assert_eq!(h.index.count_starting_with("INSERT INTO T9("), 1);
        assert_eq!(h.index.index_version(9), Some(4242));
        let status = h.ctx.status_store.get_status(9).await.unwrap().unwrap();
        assert_eq!(status.state, TableState::Available);
        assert_eq!(status.last_table_change_etag.as_deref(), Some("4242"));
    }

    #[tokio::test]
    async fn superseded_attempt_changes_nothing() {
        let h = Harness::new();
        h.truth.add_table(7, ObjectType::Table, schema());
        let stale = h.ctx.status_store.reset_to_processing(7, 1_000).await.unwrap();
        let current = h.ctx.status_store.reset_to_processing(7, 1_000).await.unwrap();
        let rebuild = RebuildRunnable::new(h.ctx.clone());

        rebuild.handle(update(7, ObjectType::Table, &stale)).await.unwrap();

        assert!(h.index.executed_starting_with("CREATE TABLE").is_empty());
        let status = h.ctx.status_store.get_status(7).await.unwrap().unwrap();
        assert_eq!(status.state, TableState::Processing);
        assert_eq!(status.reset_token, current);
    }

    #[tokio::test]
    async fn failed_build_is_recorded() {
        let h = Harness::new();
        h.truth.add_table(7, ObjectType::Table, schema());
        h.index.fail_on("CREATE TABLE IF NOT EXISTS T7(", "disk full");
        let token = h.ctx.status_store.reset_to_processing(7, 1_000).await.unwrap();
        let rebuild = RebuildRunnable::new(h.ctx.clone());

        let err = rebuild
            .handle(update(7, ObjectType::Table, &token))
            .await
            .unwrap_err();

        assert!(matches!(err, TableError::Internal(_)));
        let status = h.ctx.status_store.get_status(7).await.unwrap().unwrap();
        assert_eq!(status.state, TableState::ProcessingFailed);
        assert!(status.error_message.unwrap().contains("disk full"));
        assert!(status.error_details.is_some());
    }

    #[tokio::test]
    async fn delete_drops_the_index_and_status() {
        let h = Harness::new();
        h.ctx.status_store.reset_to_processing(7, 1_000).await.unwrap();
        let rebuild = RebuildRunnable::new(h.ctx.clone());

        rebuild
            .handle(TableChangeMessage {
                table_id: 7,
                object_type: ObjectType::Table,
                change_type: ChangeType::Delete,
                token: None,
            })
            .await
            .unwrap();

        assert!(h.index.executed(&ddl::drop_table_sql(7)));
        assert!(h.ctx.status_store.get_status(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rebuild_waits_for_readers() {
        let h = Harness::new();
        h.truth.add_table(7, ObjectType::Table, schema());
        let token = h.ctx.status_store.reset_to_processing(7, 1_000).await.unwrap();
        let rebuild = RebuildRunnable::new(h.ctx.clone().with_config(crate::config::TableServiceConfig {
            read_lock_timeout_ms: 20,
            ..crate::config::TableServiceConfig::default()
        }));
        let rebuild = &rebuild;
        let message = update(7, ObjectType::Table, &token);

        let err = h
            .ctx
            .locks
            .run_with_read_lock(7, Duration::from_millis(50), move || async move {
                Ok(rebuild.handle(message).await.unwrap_err())
            })
            .await
            .unwrap();

        assert!(matches!(err, TableError::LockUnavailable { table_id: 7, .. }));
        let status = h.ctx.status_store.get_status(7).await.unwrap().unwrap();
        assert_eq!(status.state, TableState::Processing);
    }

    #[tokio::test]
    async fn worker_brings_a_new_table_online() {
        let h = Harness::new();
        h.truth.add_table(7, ObjectType::Table, schema());
        h.truth.append_change_set(7, change_set(0, "e0"));
        let (ctx, mut worker) = spawn_rebuild_worker(h.ctx.clone());
        let availability = AvailabilityCoordinator::new(ctx);

        let first = availability
            .get_table_status_or_create_if_not_exists(7)
            .await
            .unwrap();
        assert_eq!(first.state, TableState::Processing);

        let mut state = first.state;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = availability
                .get_table_status_or_create_if_not_exists(7)
                .await
                .unwrap()
                .state;
            if state == TableState::Available {
                break;
            }
        }
        assert_eq!(state, TableState::Available);
        worker.stop().await;
    }

    #[tokio::test]
    async fn closed_channel_fails_to_notify() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let notifier = ChannelNotifier::new(tx);
        let result = notifier.notify(update(1, ObjectType::Table, "t")).await;
        assert!(result.is_err());
    }
}
