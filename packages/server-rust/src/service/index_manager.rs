//! Keeps the physical table of a table or view in line with its truth.
//!
//! Runs the statements generated by `tabledex_core::ddl` and
//! `tabledex_core::index` against the index database: table creation,
//! column changes (validated on a scratch copy first), index optimization,
//! row changes, and the per-table status row holding the applied version
//! and schema hash.

use std::sync::Arc;

use tabledex_core::ddl::{
    self, bind_row_parameters, build_create_or_update_row_sql, build_delete_rows_sql,
    create_alter_table_sql, create_replace_schema_change, extract_schema_from_info,
    match_changes_to_current_info, ROW_ID_BIND, SCHEMA_HASH_BIND, VERSION_BIND,
};
use tabledex_core::hash::schema_hash;
use tabledex_core::index::{create_cardinality_sql, create_optimized_alter_indices};
use tabledex_core::{ColumnChangeDetails, ColumnModel, DatabaseColumnInfo, DbValue};
use tokio_util::sync::CancellationToken;

use super::context::TableContext;
use crate::error::TableError;
use crate::traits::{ChangeSet, Params, RawRow, TableIndexConnection};

/// Schema, index and row maintenance for physical tables.
#[derive(Clone)]
pub struct TableIndexManager {
    index: Arc<dyn TableIndexConnection>,
    max_index_count: usize,
}

impl TableIndexManager {
    #[must_use]
    pub fn new(ctx: &TableContext) -> Self {
        Self {
            index: ctx.index.clone(),
            max_index_count: ctx.config.max_index_count,
        }
    }

    async fn execute(&self, sql: &str, params: &Params) -> anyhow::Result<u64> {
        tracing::debug!(sql, "applying statement");
        self.index.update(sql, params).await
    }

    /// Creates `T<id>` and its status table when missing.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when a statement fails.
    pub async fn create_table_if_does_not_exist(
        &self,
        table_id: i64,
        is_view: bool,
    ) -> Result<(), TableError> {
        let params = Params::new();
        self.execute(&ddl::create_table_if_does_not_exist_sql(table_id, is_view), &params)
            .await?;
        self.execute(&ddl::create_status_table_if_does_not_exist_sql(table_id), &params)
            .await?;
        Ok(())
    }

    /// Brings the physical columns of `T<id>` in line with `schema`,
    /// creating the table first when needed.
    ///
    /// Returns the `ALTER TABLE` that was applied, or `None` when the
    /// columns already match.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Validation`] when the change cannot be applied
    /// to the existing rows.
    pub async fn update_table_schema(
        &self,
        table_id: i64,
        is_view: bool,
        schema: &[ColumnModel],
    ) -> Result<Option<String>, TableError> {
        self.create_table_if_does_not_exist(table_id, is_view).await?;
        let current_info = self.index.column_info(table_id).await?;
        let current_schema = extract_schema_from_info(&current_info);
        let changes = create_replace_schema_change(&current_schema, schema);
        self.apply_column_changes(table_id, changes, &current_info)
            .await
    }

    /// Applies explicit column changes to an existing table.
    ///
    /// # Errors
    ///
    /// See [`TableIndexManager::update_table_schema`].
    pub async fn update_table_schema_with_changes(
        &self,
        table_id: i64,
        changes: Vec<ColumnChangeDetails>,
    ) -> Result<Option<String>, TableError> {
        let current_info = self.index.column_info(table_id).await?;
        self.apply_column_changes(table_id, changes, &current_info)
            .await
    }

    async fn apply_column_changes(
        &self,
        table_id: i64,
        changes: Vec<ColumnChangeDetails>,
        current_info: &[DatabaseColumnInfo],
    ) -> Result<Option<String>, TableError> {
        let changes = match_changes_to_current_info(changes, current_info);
        let Some(alter_temp) = create_alter_table_sql(&changes, table_id, true)? else {
            return Ok(None);
        };
        self.validate_on_temp_table(table_id, &alter_temp).await?;
        let Some(alter) = create_alter_table_sql(&changes, table_id, false)? else {
            return Ok(None);
        };
        self.execute(&alter, &Params::new()).await?;
        tracing::info!(table_id, "table schema altered");
        Ok(Some(alter))
    }

    /// Runs the alteration against a copy of the table so that a change the
    /// existing rows cannot hold fails before the real table is touched.
    async fn validate_on_temp_table(&self, table_id: i64, alter_temp: &str) -> Result<(), TableError> {
        let params = Params::new();
        self.execute(&ddl::delete_temp_table_sql(table_id), &params)
            .await?;
        self.execute(&ddl::create_temp_table_sql(table_id), &params)
            .await?;
        let result = async {
            self.execute(&ddl::copy_table_to_temp_sql(table_id), &params)
                .await?;
            self.execute(alter_temp, &params).await
        }
        .await;
        self.execute(&ddl::delete_temp_table_sql(table_id), &params)
            .await?;
        result.map_err(|e| {
            TableError::Validation(format!(
                "Cannot apply the schema change to table {table_id}: {e}"
            ))
        })?;
        Ok(())
    }

    /// Moves indices onto the highest-cardinality columns, keeping at most
    /// the configured number. Returns the statement applied, if any.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when a statement fails.
    pub async fn optimize_table_indices(&self, table_id: i64) -> Result<Option<String>, TableError> {
        let mut candidates: Vec<DatabaseColumnInfo> = self
            .index
            .column_info(table_id)
            .await?
            .into_iter()
            .filter(|info| !info.is_reserved() && !info.is_double_companion())
            .collect();
        let Some(cardinality_sql) = create_cardinality_sql(&candidates, table_id) else {
            return Ok(None);
        };

        let mut counts: RawRow = Vec::new();
        let mut sink = |row: RawRow| -> anyhow::Result<()> {
            counts = row;
            Ok(())
        };
        self.index
            .query_rows(
                &cardinality_sql,
                &Params::new(),
                &CancellationToken::new(),
                &mut sink,
            )
            .await?;
        for (info, count) in candidates.iter_mut().zip(counts) {
            info.cardinality = count.and_then(|c| c.parse().ok()).unwrap_or(0);
        }

        let Some(sql) = create_optimized_alter_indices(&candidates, table_id, self.max_index_count)
        else {
            return Ok(None);
        };
        self.execute(&sql, &Params::new()).await?;
        Ok(Some(sql))
    }

    /// Version recorded by the last completed build; `None` before the first.
    ///
    /// # Errors
    ///
    /// Fails when the status table does not exist.
    pub async fn get_index_version(&self, table_id: i64) -> anyhow::Result<Option<i64>> {
        self.index
            .query_long(&ddl::get_max_version_sql(table_id), &Params::new())
            .await
    }

    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when the statement fails.
    pub async fn set_index_version(&self, table_id: i64, version: i64) -> Result<(), TableError> {
        let params = Params::from([(VERSION_BIND.to_string(), DbValue::Long(version))]);
        self.index
            .update(&ddl::set_max_version_sql(table_id), &params)
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails when the status table does not exist.
    pub async fn get_index_schema_hash(&self, table_id: i64) -> anyhow::Result<Option<String>> {
        self.index
            .query_string(&ddl::get_schema_hash_sql(table_id), &Params::new())
            .await
    }

    /// Records the hash of the schema the table now has.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when the statement fails.
    pub async fn set_index_schema(&self, table_id: i64, schema: &[ColumnModel]) -> Result<(), TableError> {
        let params = Params::from([(
            SCHEMA_HASH_BIND.to_string(),
            DbValue::String(schema_hash(schema)),
        )]);
        self.index
            .update(&ddl::set_schema_hash_sql(table_id), &params)
            .await?;
        Ok(())
    }

    /// Whether the physical table was built from `version` of the truth
    /// under `schema_hash`. A missing status table does not match.
    pub async fn does_index_state_match(&self, table_id: i64, version: i64, schema_hash: &str) -> bool {
        let state = async {
            let index_version = self.get_index_version(table_id).await?;
            let index_hash = self.get_index_schema_hash(table_id).await?;
            anyhow::Ok((index_version, index_hash))
        }
        .await;
        match state {
            Ok((index_version, index_hash)) => {
                index_version == Some(version) && index_hash.as_deref() == Some(schema_hash)
            }
            Err(e) => {
                tracing::debug!(table_id, error = %e, "index state unreadable");
                false
            }
        }
    }

    /// Writes one change set and records its version.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Validation`] when a value does not fit its
    /// column, otherwise [`TableError::Internal`] for a failed statement.
    pub async fn apply_change_set(
        &self,
        table_id: i64,
        schema: &[ColumnModel],
        change_set: &ChangeSet,
    ) -> Result<(), TableError> {
        if !change_set.rows.is_empty() {
            let sql = build_create_or_update_row_sql(table_id, schema);
            let batch = change_set
                .rows
                .iter()
                .map(|row| bind_row_parameters(schema, row))
                .collect::<Result<Vec<_>, _>>()?;
            tracing::debug!(table_id, rows = batch.len(), sql = %sql, "writing rows");
            self.index.update_batch(&sql, &batch).await?;
        }
        if !change_set.deleted_row_ids.is_empty() {
            let params = Params::from([(
                ROW_ID_BIND.to_string(),
                DbValue::LongList(change_set.deleted_row_ids.clone()),
            )]);
            self.execute(&build_delete_rows_sql(table_id), &params)
                .await?;
        }
        self.set_index_version(table_id, change_set.version).await
    }

    /// Drops `T<id>` and its status table.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when a statement fails.
    pub async fn delete_table_index(&self, table_id: i64) -> Result<(), TableError> {
        let params = Params::new();
        self.execute(&ddl::drop_table_sql(table_id), &params).await?;
        self.execute(&ddl::drop_status_table_sql(table_id), &params)
            .await?;
        tracing::info!(table_id, "table index deleted");
        Ok(())
    }
}
