use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tabledex_core::{
    ColumnModel, DatabaseColumnInfo, DbValue, ObjectType, RowWrite, TableStatus, ViewTypeMask,
};
use tokio_util::sync::CancellationToken;

use crate::error::StatusUpdateError;

/// Named statement parameters, keyed without the leading `:`.
pub type Params = BTreeMap<String, DbValue>;

/// One result row as raw column text, in select order.
pub type RawRow = Vec<Option<String>>;

/// Receives rows streamed from the index database.
pub type RawRowSink<'a> = dyn FnMut(RawRow) -> anyhow::Result<()> + Send + 'a;

/// Caller identity used for row-level filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
}

impl UserInfo {
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self { id }
    }
}

/// Connection to the relational database holding the physical tables.
///
/// SQL uses `:name` placeholders bound from [`Params`]. Used as
/// `Arc<dyn TableIndexConnection>`.
#[async_trait]
pub trait TableIndexConnection: Send + Sync {
    /// Runs one statement and returns the number of affected rows.
    async fn update(&self, sql: &str, params: &Params) -> anyhow::Result<u64>;

    /// Runs `sql` once per parameter set inside a single transaction.
    async fn update_batch(&self, sql: &str, batch: &[Params]) -> anyhow::Result<()>;

    /// First column of the first row, as a long. `None` for no row or NULL.
    async fn query_long(&self, sql: &str, params: &Params) -> anyhow::Result<Option<i64>>;

    /// First column of every row, as longs. NULLs are skipped.
    async fn query_longs(&self, sql: &str, params: &Params) -> anyhow::Result<Vec<i64>>;

    /// First column of the first row, as text.
    async fn query_string(&self, sql: &str, params: &Params) -> anyhow::Result<Option<String>>;

    /// Reflects the columns of `T<id>`, with their index names and types.
    /// Empty when the table does not exist.
    async fn column_info(&self, table_id: i64) -> anyhow::Result<Vec<DatabaseColumnInfo>>;

    /// Streams every row of a query into `sink`, checking `cancel` between
    /// batches. A cancelled stream ends with an error.
    async fn query_rows(
        &self,
        sql: &str,
        params: &Params,
        cancel: &CancellationToken,
        sink: &mut RawRowSink<'_>,
    ) -> anyhow::Result<()>;
}

/// Persistence of [`TableStatus`] rows.
///
/// Transitions that finish a processing attempt are conditional on the
/// caller's reset token and must be atomic at the storage layer, since the
/// attempt may run in another process.
#[async_trait]
pub trait TableStatusStore: Send + Sync {
    async fn get_status(&self, table_id: i64) -> anyhow::Result<Option<TableStatus>>;

    /// Creates or replaces the status as `Processing` under a fresh token
    /// and returns that token.
    async fn reset_to_processing(&self, table_id: i64, now: u64) -> anyhow::Result<String>;

    async fn attempt_set_available(
        &self,
        table_id: i64,
        reset_token: &str,
        etag: Option<&str>,
        now: u64,
    ) -> Result<(), StatusUpdateError>;

    async fn attempt_set_failed(
        &self,
        table_id: i64,
        reset_token: &str,
        error_message: &str,
        error_details: Option<&str>,
        now: u64,
    ) -> Result<(), StatusUpdateError>;

    /// Records progress. Also refreshes `changed_on`, which keeps a live
    /// attempt from looking stalled.
    async fn attempt_update_progress(
        &self,
        table_id: i64,
        reset_token: &str,
        message: &str,
        current: u64,
        total: u64,
        now: u64,
    ) -> Result<(), StatusUpdateError>;

    async fn delete_status(&self, table_id: i64) -> anyhow::Result<()>;
}

/// Scope and type of each view.
#[async_trait]
pub trait ViewScopeStore: Send + Sync {
    /// Replaces the whole scope and the type of a view in one transaction.
    async fn set_view_scope_and_type(
        &self,
        view_id: i64,
        container_ids: &BTreeSet<i64>,
        view_type: ViewTypeMask,
    ) -> anyhow::Result<()>;

    /// Empty for an unknown view.
    async fn get_view_scope(&self, view_id: i64) -> anyhow::Result<BTreeSet<i64>>;

    async fn get_view_type(&self, view_id: i64) -> anyhow::Result<Option<ViewTypeMask>>;

    /// Views whose scope contains any of `path_ids`.
    async fn find_view_scope_intersection_with_path(
        &self,
        path_ids: &BTreeSet<i64>,
    ) -> anyhow::Result<BTreeSet<i64>>;

    async fn truncate_all(&self) -> anyhow::Result<()>;
}

/// Ordered batch of row changes appended to a plain table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub version: i64,
    pub etag: String,
    pub rows: Vec<RowWrite>,
    pub deleted_row_ids: Vec<i64>,
}

/// Source of truth for table schemas, table rows and the container tree.
#[async_trait]
pub trait TableTruth: Send + Sync {
    /// `None` when the table does not exist or is in the trash.
    async fn object_type(&self, table_id: i64) -> anyhow::Result<Option<ObjectType>>;

    async fn column_models(&self, table_id: i64) -> anyhow::Result<Vec<ColumnModel>>;

    /// Last change number of a plain table; `None` before the first change.
    async fn last_change_version(&self, table_id: i64) -> anyhow::Result<Option<i64>>;

    /// Change sets of a plain table newer than `after_version`, oldest first.
    async fn change_sets_after(
        &self,
        table_id: i64,
        after_version: i64,
    ) -> anyhow::Result<Vec<ChangeSet>>;

    /// Every container below `container_id`, at any depth.
    async fn child_container_ids(&self, container_id: i64) -> anyhow::Result<Vec<i64>>;

    /// Name, type and largest value size of each annotation found under the
    /// given containers.
    async fn annotation_columns(
        &self,
        view_type: ViewTypeMask,
        container_ids: &BTreeSet<i64>,
    ) -> anyhow::Result<Vec<ColumnModel>>;
}

/// Row-level authorization oracle.
#[async_trait]
pub trait BenefactorAuthorizer: Send + Sync {
    /// The subset of `benefactor_ids` whose rows `user` may read.
    async fn accessible_benefactors(
        &self,
        user: &UserInfo,
        benefactor_ids: &BTreeSet<i64>,
    ) -> anyhow::Result<BTreeSet<i64>>;
}

/// What happened to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Update,
    Delete,
}

/// Request to bring a table index up to date, or to drop it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableChangeMessage {
    pub table_id: i64,
    pub object_type: ObjectType,
    pub change_type: ChangeType,
    /// Reset token of the processing attempt; absent for deletes.
    pub token: Option<String>,
}

/// Fire-and-forget channel to the rebuild consumer. Delivery may repeat,
/// since a rebuild is idempotent per token.
#[async_trait]
pub trait RebuildNotifier: Send + Sync {
    async fn notify(&self, message: TableChangeMessage) -> anyhow::Result<()>;
}
