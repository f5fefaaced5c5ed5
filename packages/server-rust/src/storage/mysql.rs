//! MySQL implementations of the storage seams (`mysql` feature).
//!
//! Statements keep the `:name` placeholders used everywhere else and are
//! expanded to positional `?` parameters just before execution.

use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::mysql::{MySql, MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::Row;
use tabledex_core::codec::MySqlColumnType;
use tabledex_core::ddl;
use tabledex_core::query::expand_named_parameters;
use tabledex_core::{
    ColumnType, DatabaseColumnInfo, DbValue, TableState, TableStatus, ViewTypeMask,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::StatusUpdateError;
use crate::traits::{Params, RawRow, RawRowSink, TableIndexConnection, TableStatusStore, ViewScopeStore};

type MySqlQuery<'q> = Query<'q, MySql, MySqlArguments>;

/// Rows streamed between two cancellation checks.
const STREAM_BATCH_SIZE: usize = 100;

/// Opens a pool against `url`.
///
/// # Errors
///
/// Returns an error if the database cannot be reached.
pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<MySqlPool> {
    MySqlPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to MySQL")
}

fn bind_values<'q>(mut query: MySqlQuery<'q>, values: &[DbValue]) -> MySqlQuery<'q> {
    for value in values {
        query = match value {
            DbValue::Null => query.bind(None::<String>),
            DbValue::Long(v) => query.bind(*v),
            DbValue::Double(v) => query.bind(*v),
            DbValue::Bool(v) => query.bind(*v),
            DbValue::String(v) => query.bind(v.clone()),
            // Lists are expanded into scalars before binding.
            DbValue::LongList(ids) => ids.iter().fold(query, |q, id| q.bind(*id)),
        };
    }
    query
}

/// Reads any scalar column as text, the way the JDBC-style `getString`
/// would render it.
fn column_text(row: &MySqlRow, index: usize) -> anyhow::Result<Option<String>> {
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return Ok(value);
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return Ok(value.map(|v| v.to_string()));
    }
    if let Ok(value) = row.try_get::<Option<u64>, _>(index) {
        return Ok(value.map(|v| v.to_string()));
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return Ok(value.map(|v| v.to_string()));
    }
    // DECIMAL results such as SUM(CRC32(...)) arrive as text on the wire.
    row.try_get_unchecked::<Option<String>, _>(index)
        .with_context(|| format!("unsupported column type at position {index}"))
}

fn column_long(row: &MySqlRow, index: usize) -> anyhow::Result<Option<i64>> {
    column_text(row, index)?
        .map(|text| {
            let text = text.trim();
            text.parse::<i64>()
                .or_else(|_| text.split('.').next().unwrap_or_default().parse::<i64>())
                .with_context(|| format!("expected an integer but found {text:?}"))
        })
        .transpose()
}

// ---------------------------------------------------------------------------
// Index connection
// ---------------------------------------------------------------------------

/// [`TableIndexConnection`] over a MySQL pool.
pub struct MySqlIndexConnection {
    pool: MySqlPool,
}

impl MySqlIndexConnection {
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn fetch_all(&self, sql: &str, params: &Params) -> anyhow::Result<Vec<MySqlRow>> {
        let (sql, values) = expand_named_parameters(sql, params)?;
        Ok(bind_values(sqlx::query(&sql), &values)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn fetch_optional(&self, sql: &str, params: &Params) -> anyhow::Result<Option<MySqlRow>> {
        let (sql, values) = expand_named_parameters(sql, params)?;
        Ok(bind_values(sqlx::query(&sql), &values)
            .fetch_optional(&self.pool)
            .await?)
    }
}

#[async_trait]
impl TableIndexConnection for MySqlIndexConnection {
    async fn update(&self, sql: &str, params: &Params) -> anyhow::Result<u64> {
        let (sql, values) = expand_named_parameters(sql, params)?;
        let result = bind_values(sqlx::query(&sql), &values)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update_batch(&self, sql: &str, batch: &[Params]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for params in batch {
            let (expanded, values) = expand_named_parameters(sql, params)?;
            bind_values(sqlx::query(&expanded), &values)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query_long(&self, sql: &str, params: &Params) -> anyhow::Result<Option<i64>> {
        match self.fetch_optional(sql, params).await? {
            Some(row) => column_long(&row, 0),
            None => Ok(None),
        }
    }

    async fn query_longs(&self, sql: &str, params: &Params) -> anyhow::Result<Vec<i64>> {
        let mut values = Vec::new();
        for row in self.fetch_all(sql, params).await? {
            if let Some(value) = column_long(&row, 0)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    async fn query_string(&self, sql: &str, params: &Params) -> anyhow::Result<Option<String>> {
        match self.fetch_optional(sql, params).await? {
            Some(row) => column_text(&row, 0),
            None => Ok(None),
        }
    }

    async fn column_info(&self, table_id: i64) -> anyhow::Result<Vec<DatabaseColumnInfo>> {
        let mut params = Params::new();
        params.insert("table".to_string(), DbValue::String(ddl::table_name(table_id)));

        let columns = self
            .fetch_all(
                "SELECT COLUMN_NAME, COLUMN_TYPE, COLUMN_COMMENT, CHARACTER_MAXIMUM_LENGTH \
                 FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = :table ORDER BY ORDINAL_POSITION",
                &params,
            )
            .await?;
        let indexes = self
            .fetch_all(
                "SELECT COLUMN_NAME, INDEX_NAME FROM information_schema.STATISTICS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = :table AND SEQ_IN_INDEX = 1 \
                 AND INDEX_NAME <> 'PRIMARY'",
                &params,
            )
            .await?;

        let mut infos = Vec::with_capacity(columns.len());
        for row in &columns {
            let Some(name) = column_text(row, 0)? else {
                continue;
            };
            let mut info = DatabaseColumnInfo::new(name.clone());
            info.mysql_type = column_text(row, 1)?.as_deref().and_then(MySqlColumnType::parse);
            info.column_type = column_text(row, 2)?.as_deref().and_then(ColumnType::from_name);
            info.max_size = column_long(row, 3)?.and_then(|size| u32::try_from(size).ok());
            for index in &indexes {
                if column_text(index, 0)?.as_deref() == Some(name.as_str()) {
                    if let Some(index_name) = column_text(index, 1)? {
                        info = info.with_index(index_name);
                    }
                }
            }
            infos.push(info);
        }
        Ok(infos)
    }

    async fn query_rows(
        &self,
        sql: &str,
        params: &Params,
        cancel: &CancellationToken,
        sink: &mut RawRowSink<'_>,
    ) -> anyhow::Result<()> {
        let (sql, values) = expand_named_parameters(sql, params)?;
        let mut rows = bind_values(sqlx::query(&sql), &values).fetch(&self.pool);
        let mut in_batch = 0usize;
        while let Some(row) = rows.try_next().await? {
            if in_batch == 0 && cancel.is_cancelled() {
                anyhow::bail!("query cancelled");
            }
            let mut raw: RawRow = Vec::with_capacity(row.len());
            for index in 0..row.len() {
                raw.push(column_text(&row, index)?);
            }
            sink(raw)?;
            in_batch = (in_batch + 1) % STREAM_BATCH_SIZE;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Status store
// ---------------------------------------------------------------------------

const STATUS_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS TABLE_STATUS ( \
    TABLE_ID BIGINT NOT NULL, STATE ENUM('AVAILABLE','PROCESSING','PROCESSING_FAILED') NOT NULL, \
    RESET_TOKEN CHAR(36) NOT NULL, STARTED_ON BIGINT NOT NULL, CHANGED_ON BIGINT NOT NULL, \
    LAST_TABLE_CHANGE_ETAG VARCHAR(256), PROGRESS_MESSAGE VARCHAR(1000), \
    PROGRESS_CURRENT BIGINT, PROGRESS_TOTAL BIGINT, ERROR_MESSAGE VARCHAR(1000), \
    ERROR_DETAILS MEDIUMTEXT, TOTAL_RUN_TIME_MS BIGINT, PRIMARY KEY (TABLE_ID))";

/// [`TableStatusStore`] over the `TABLE_STATUS` table. Every token-guarded
/// transition is a single `UPDATE ... WHERE RESET_TOKEN = ?`.
pub struct MySqlStatusStore {
    pool: MySqlPool,
}

impl MySqlStatusStore {
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Creates the status table if needed.
    ///
    /// # Errors
    ///
    /// Returns the database error.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(STATUS_TABLE_DDL).execute(&self.pool).await?;
        Ok(())
    }

    /// Tells a stale token apart from a missing row after an update matched
    /// nothing.
    async fn explain_miss(&self, table_id: i64) -> StatusUpdateError {
        match sqlx::query("SELECT 1 FROM TABLE_STATUS WHERE TABLE_ID = ?")
            .bind(table_id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(_)) => StatusUpdateError::Conflict { table_id },
            Ok(None) => StatusUpdateError::NotFound { table_id },
            Err(e) => StatusUpdateError::Storage(e.into()),
        }
    }

    async fn guarded(
        &self,
        table_id: i64,
        query: MySqlQuery<'_>,
    ) -> Result<(), StatusUpdateError> {
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| StatusUpdateError::Storage(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(self.explain_miss(table_id).await);
        }
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn status_from_row(row: &MySqlRow) -> anyhow::Result<TableStatus> {
    let state: String = row.try_get("STATE")?;
    let optional_u64 = |name: &str| -> anyhow::Result<Option<u64>> {
        Ok(row.try_get::<Option<i64>, _>(name)?.map(to_u64))
    };
    Ok(TableStatus {
        table_id: row.try_get("TABLE_ID")?,
        state: TableState::from_name(&state)
            .with_context(|| format!("unknown table state {state:?}"))?,
        reset_token: row.try_get("RESET_TOKEN")?,
        started_on: to_u64(row.try_get("STARTED_ON")?),
        changed_on: to_u64(row.try_get("CHANGED_ON")?),
        last_table_change_etag: row.try_get("LAST_TABLE_CHANGE_ETAG")?,
        progress_message: row.try_get("PROGRESS_MESSAGE")?,
        progress_current: optional_u64("PROGRESS_CURRENT")?,
        progress_total: optional_u64("PROGRESS_TOTAL")?,
        error_message: row.try_get("ERROR_MESSAGE")?,
        error_details: row.try_get("ERROR_DETAILS")?,
        total_time_ms: optional_u64("TOTAL_RUN_TIME_MS")?,
    })
}

#[async_trait]
impl TableStatusStore for MySqlStatusStore {
    async fn get_status(&self, table_id: i64) -> anyhow::Result<Option<TableStatus>> {
        let row = sqlx::query("SELECT * FROM TABLE_STATUS WHERE TABLE_ID = ?")
            .bind(table_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(status_from_row).transpose()
    }

    async fn reset_to_processing(&self, table_id: i64, now: u64) -> anyhow::Result<String> {
        let token = Uuid::new_v4().to_string();
        let now = to_i64(now);
        sqlx::query(
            "INSERT INTO TABLE_STATUS (TABLE_ID, STATE, RESET_TOKEN, STARTED_ON, CHANGED_ON) \
             VALUES (?, 'PROCESSING', ?, ?, ?) ON DUPLICATE KEY UPDATE STATE = 'PROCESSING', \
             RESET_TOKEN = VALUES(RESET_TOKEN), STARTED_ON = VALUES(STARTED_ON), \
             CHANGED_ON = VALUES(CHANGED_ON), LAST_TABLE_CHANGE_ETAG = NULL, \
             PROGRESS_MESSAGE = NULL, PROGRESS_CURRENT = NULL, PROGRESS_TOTAL = NULL, \
             ERROR_MESSAGE = NULL, ERROR_DETAILS = NULL, TOTAL_RUN_TIME_MS = NULL",
        )
        .bind(table_id)
        .bind(token.clone())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(token)
    }

    async fn attempt_set_available(
        &self,
        table_id: i64,
        reset_token: &str,
        etag: Option<&str>,
        now: u64,
    ) -> Result<(), StatusUpdateError> {
        let now = to_i64(now);
        let query = sqlx::query(
            "UPDATE TABLE_STATUS SET STATE = 'AVAILABLE', CHANGED_ON = ?, LAST_TABLE_CHANGE_ETAG = ?, \
             TOTAL_RUN_TIME_MS = ? - STARTED_ON, ERROR_MESSAGE = NULL, ERROR_DETAILS = NULL \
             WHERE TABLE_ID = ? AND RESET_TOKEN = ?",
        )
        .bind(now)
        .bind(etag.map(str::to_string))
        .bind(now)
        .bind(table_id)
        .bind(reset_token.to_string());
        self.guarded(table_id, query).await
    }

    async fn attempt_set_failed(
        &self,
        table_id: i64,
        reset_token: &str,
        error_message: &str,
        error_details: Option<&str>,
        now: u64,
    ) -> Result<(), StatusUpdateError> {
        let query = sqlx::query(
            "UPDATE TABLE_STATUS SET STATE = 'PROCESSING_FAILED', CHANGED_ON = ?, \
             ERROR_MESSAGE = ?, ERROR_DETAILS = ? WHERE TABLE_ID = ? AND RESET_TOKEN = ?",
        )
        .bind(to_i64(now))
        .bind(error_message.to_string())
        .bind(error_details.map(str::to_string))
        .bind(table_id)
        .bind(reset_token.to_string());
        self.guarded(table_id, query).await
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
        let query = sqlx::query(
            "UPDATE TABLE_STATUS SET CHANGED_ON = ?, PROGRESS_MESSAGE = ?, PROGRESS_CURRENT = ?, \
             PROGRESS_TOTAL = ? WHERE TABLE_ID = ? AND RESET_TOKEN = ?",
        )
        .bind(to_i64(now))
        .bind(message.to_string())
        .bind(to_i64(current))
        .bind(to_i64(total))
        .bind(table_id)
        .bind(reset_token.to_string());
        self.guarded(table_id, query).await
    }

    async fn delete_status(&self, table_id: i64) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM TABLE_STATUS WHERE TABLE_ID = ?")
            .bind(table_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// View scope store
// ---------------------------------------------------------------------------

const VIEW_TYPE_DDL: &str = "CREATE TABLE IF NOT EXISTS VIEW_TYPE ( \
    VIEW_ID BIGINT NOT NULL, VIEW_TYPE TINYINT NOT NULL, ETAG CHAR(36) NOT NULL, \
    PRIMARY KEY (VIEW_ID))";

const VIEW_SCOPE_DDL: &str = "CREATE TABLE IF NOT EXISTS VIEW_SCOPE ( \
    VIEW_ID BIGINT NOT NULL, CONTAINER_ID BIGINT NOT NULL, \
    PRIMARY KEY (VIEW_ID, CONTAINER_ID), KEY IDX_CONTAINER (CONTAINER_ID))";

/// [`ViewScopeStore`] over the `VIEW_TYPE` and `VIEW_SCOPE` tables.
pub struct MySqlViewScopeStore {
    pool: MySqlPool,
}

impl MySqlViewScopeStore {
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Creates both tables if needed.
    ///
    /// # Errors
    ///
    /// Returns the database error.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(VIEW_TYPE_DDL).execute(&self.pool).await?;
        sqlx::query(VIEW_SCOPE_DDL).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ViewScopeStore for MySqlViewScopeStore {
    async fn set_view_scope_and_type(
        &self,
        view_id: i64,
        container_ids: &BTreeSet<i64>,
        view_type: ViewTypeMask,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO VIEW_TYPE (VIEW_ID, VIEW_TYPE, ETAG) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE VIEW_TYPE = VALUES(VIEW_TYPE), ETAG = VALUES(ETAG)",
        )
        .bind(view_id)
        .bind(view_type.bits())
        .bind(Uuid::new_v4().to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM VIEW_SCOPE WHERE VIEW_ID = ?")
            .bind(view_id)
            .execute(&mut *tx)
            .await?;
        for container_id in container_ids {
            sqlx::query("INSERT INTO VIEW_SCOPE (VIEW_ID, CONTAINER_ID) VALUES (?, ?)")
                .bind(view_id)
                .bind(*container_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_view_scope(&self, view_id: i64) -> anyhow::Result<BTreeSet<i64>> {
        let rows = sqlx::query("SELECT CONTAINER_ID FROM VIEW_SCOPE WHERE VIEW_ID = ?")
            .bind(view_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>(0).map_err(anyhow::Error::from))
            .collect()
    }

    async fn get_view_type(&self, view_id: i64) -> anyhow::Result<Option<ViewTypeMask>> {
        let row = sqlx::query("SELECT VIEW_TYPE FROM VIEW_TYPE WHERE VIEW_ID = ?")
            .bind(view_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let bits = column_long(&row, 0)?.unwrap_or_default();
                u8::try_from(bits)
                    .ok()
                    .and_then(ViewTypeMask::from_bits)
                    .map(Some)
                    .with_context(|| format!("unknown view type mask {bits}"))
            }
            None => Ok(None),
        }
    }

    async fn find_view_scope_intersection_with_path(
        &self,
        path_ids: &BTreeSet<i64>,
    ) -> anyhow::Result<BTreeSet<i64>> {
        if path_ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut params = Params::new();
        params.insert(
            "pathIds".to_string(),
            DbValue::LongList(path_ids.iter().copied().collect()),
        );
        let (sql, values) = expand_named_parameters(
            "SELECT DISTINCT VIEW_ID FROM VIEW_SCOPE WHERE CONTAINER_ID IN (:pathIds)",
            &params,
        )?;
        let rows = bind_values(sqlx::query(&sql), &values)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>(0).map_err(anyhow::Error::from))
            .collect()
    }

    async fn truncate_all(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM VIEW_SCOPE").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM VIEW_TYPE").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
