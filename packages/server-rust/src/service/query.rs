//! Query execution against table indices.
//!
//! A request is compiled against the current schema, restricted to the
//! caller's benefactors when the table is a view, narrowed by the selected
//! facets, and then run as up to three parts: the page of rows, the total
//! count and the facet summaries. Consistent requests hold the table's read
//! lock and only run while the table is available.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use tabledex_core::ddl;
use tabledex_core::query::bind::{convert_to_sorted_query, parse_table_id, QueryOptions};
use tabledex_core::query::page_token::{self, Query};
use tabledex_core::query::{
    parse_query, validate_facet_list, FacetRange, SortItem, SqlQuery, ValidatedFacetColumn,
};
use tabledex_core::{type_info, ColumnModel, FacetType, SelectColumn};
use tokio_util::sync::CancellationToken;

use super::availability::AvailabilityCoordinator;
use super::context::TableContext;
use crate::error::TableError;
use crate::observability;
use crate::traits::{Params, RawRow, UserInfo};

// ---------------------------------------------------------------------------
// Bundle part masks
// ---------------------------------------------------------------------------

pub const BUNDLE_MASK_QUERY_RESULTS: u64 = 0x1;
pub const BUNDLE_MASK_QUERY_COUNT: u64 = 0x2;
pub const BUNDLE_MASK_QUERY_SELECT_COLUMNS: u64 = 0x4;
pub const BUNDLE_MASK_QUERY_MAX_ROWS_PER_PAGE: u64 = 0x8;
pub const BUNDLE_MASK_QUERY_COLUMN_MODELS: u64 = 0x10;
pub const BUNDLE_MASK_QUERY_FACETS: u64 = 0x20;
pub const BUNDLE_MASK_ALL: u64 = 0x3f;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// One result row. Values follow the select columns; row id and version are
/// absent for aggregate queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_number: Option<i64>,
    pub values: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowSet {
    pub table_id: i64,
    pub headers: Vec<SelectColumn>,
    pub rows: Vec<Row>,
    /// Etag of the table at read time; set for consistent reads only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub query_results: RowSet,
    /// Present when the page was full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetValueCount {
    /// `None` counts the rows where the column is null.
    pub value: Option<String>,
    pub count: u64,
    pub is_selected: bool,
}

/// Summary of one faceted column: the most frequent values of an
/// enumeration facet, or the range the caller selected on a range facet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetResult {
    pub column_name: String,
    pub facet_type: FacetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet_values: Option<Vec<FacetValueCount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_range: Option<FacetRange>,
}

/// Parts of a query answer. Each part is present only when requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResultBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_result: Option<QueryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select_columns: Option<Vec<SelectColumn>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows_per_page: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_models: Option<Vec<ColumnModel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facets: Option<Vec<FacetResult>>,
}

/// A query plus the bundle parts to return (`BUNDLE_MASK_*`, default all).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBundleRequest {
    pub query: Query,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_mask: Option<u64>,
}

/// Outcome of streaming a whole query to a [`RowHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedQuery {
    pub table_id: i64,
    pub headers: Vec<SelectColumn>,
    pub include_row_id_and_version: bool,
    pub etag: Option<String>,
    pub row_count: u64,
}

/// Which parts of a single page to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryParts {
    pub run_query: bool,
    pub run_count: bool,
    pub return_facets: bool,
}

impl QueryParts {
    pub const RESULTS_ONLY: QueryParts = QueryParts {
        run_query: true,
        run_count: false,
        return_facets: false,
    };

    #[must_use]
    pub fn from_mask(mask: u64) -> Self {
        Self {
            run_query: mask & BUNDLE_MASK_QUERY_RESULTS != 0,
            run_count: mask & BUNDLE_MASK_QUERY_COUNT != 0,
            return_facets: mask & BUNDLE_MASK_QUERY_FACETS != 0,
        }
    }
}

/// Receives streamed rows, e.g. to write a download. An error stops the
/// stream.
pub trait RowHandler: Send {
    /// # Errors
    ///
    /// Any error aborts the query.
    fn next_row(&mut self, row: Row) -> anyhow::Result<()>;
}

impl RowHandler for Vec<Row> {
    fn next_row(&mut self, row: Row) -> anyhow::Result<()> {
        self.push(row);
        Ok(())
    }
}

/// Parts computed for one page, before paging metadata is attached.
struct QueryOutcome {
    rows: Option<Vec<Row>>,
    count: Option<u64>,
    facets: Option<Vec<FacetResult>>,
    etag: Option<String>,
}

// ---------------------------------------------------------------------------
// TableQueryManager
// ---------------------------------------------------------------------------

/// Compiles and runs queries against table indices.
#[derive(Clone)]
pub struct TableQueryManager {
    ctx: TableContext,
    availability: AvailabilityCoordinator,
}

impl TableQueryManager {
    #[must_use]
    pub fn new(ctx: TableContext) -> Self {
        let availability = AvailabilityCoordinator::new(ctx.clone());
        Self { ctx, availability }
    }

    /// Parses `query.sql`, applies the caller's sort and binds the result to
    /// the table's current schema. `max_bytes_per_page` caps the page size.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::InvalidQuery`] for SQL outside the dialect and
    /// [`TableError::EmptyResult`] when the table has no columns.
    pub async fn create_query(
        &self,
        query: &Query,
        max_bytes_per_page: Option<u64>,
    ) -> Result<SqlQuery, TableError> {
        let model = parse_query(&query.sql)?;
        let table_id = parse_table_id(&model.table_name)?;
        let model = match query.sort.as_deref() {
            Some(sort) if !sort.is_empty() => convert_to_sorted_query(&model, sort),
            _ => model,
        };
        let schema = self.ctx.truth.column_models(table_id).await?;
        let options = QueryOptions {
            offset: query.offset,
            limit: query.limit,
            max_bytes_per_page,
        };
        Ok(SqlQuery::with_options(model, schema, options)?)
    }

    /// Runs one page of a query. A query that can only return zero rows
    /// yields an empty bundle rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::InvalidQuery`] or [`TableError::InvalidArgument`]
    /// for a bad request, and for consistent queries
    /// [`TableError::Unavailable`], [`TableError::Failed`] or
    /// [`TableError::LockUnavailable`].
    pub async fn query_single_page(
        &self,
        user: &UserInfo,
        query: &Query,
        parts: QueryParts,
        cancel: &CancellationToken,
    ) -> Result<QueryResultBundle, TableError> {
        let started = Instant::now();
        let sql_query = match self
            .create_query(query, Some(self.ctx.config.max_bytes_per_request))
            .await
        {
            Ok(sql_query) => sql_query,
            Err(TableError::EmptyResult { table_id, message }) => {
                tracing::debug!(table_id, message = %message, "query has an empty result");
                return Ok(empty_bundle(table_id, parts));
            }
            Err(e) => return Err(e),
        };
        let table_id = sql_query.table_id();
        let facets = validate_facet_list(
            query.selected_facets.as_deref(),
            sql_query.table_schema(),
            parts.return_facets,
        )?;

        let outcome = match self
            .query_as_stream(user, &sql_query, &facets, parts, query.is_consistent, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(TableError::EmptyResult { table_id, message }) => {
                tracing::debug!(table_id, message = %message, "query has an empty result");
                return Ok(empty_bundle(table_id, parts));
            }
            Err(e) => return Err(e),
        };

        let query_result = match outcome.rows {
            Some(rows) => {
                let row_count = u64::try_from(rows.len()).unwrap_or(u64::MAX);
                let next_page_token = match sql_query.limit() {
                    Some(limit) if limit > 0 && row_count == limit => {
                        Some(page_token::next_page_token(
                            &query.sql,
                            query.sort.clone(),
                            sql_query.offset() + limit,
                            query.limit,
                            query.is_consistent,
                            query.selected_facets.clone(),
                        )?)
                    }
                    _ => None,
                };
                Some(QueryResult {
                    query_results: RowSet {
                        table_id,
                        headers: sql_query.select_columns().to_vec(),
                        rows,
                        etag: outcome.etag,
                    },
                    next_page_token,
                })
            }
            None => None,
        };

        let elapsed = started.elapsed();
        observability::record_query(query.is_consistent, elapsed);
        tracing::info!(
            table_id,
            consistent = query.is_consistent,
            rows = query_result.as_ref().map(|r| r.query_results.rows.len()),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "query executed"
        );

        Ok(QueryResultBundle {
            query_result,
            query_count: outcome.count,
            select_columns: Some(sql_query.select_columns().to_vec()),
            max_rows_per_page: sql_query.max_rows_per_page(),
            column_models: None,
            facets: outcome.facets,
        })
    }

    /// Runs a query and returns the bundle parts selected by the request's
    /// mask.
    ///
    /// # Errors
    ///
    /// See [`TableQueryManager::query_single_page`].
    pub async fn query_bundle(
        &self,
        user: &UserInfo,
        request: &QueryBundleRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResultBundle, TableError> {
        let mask = request.part_mask.unwrap_or(BUNDLE_MASK_ALL);
        let mut bundle = self
            .query_single_page(user, &request.query, QueryParts::from_mask(mask), cancel)
            .await?;
        if mask & BUNDLE_MASK_QUERY_SELECT_COLUMNS == 0 {
            bundle.select_columns = None;
        }
        if mask & BUNDLE_MASK_QUERY_MAX_ROWS_PER_PAGE == 0 {
            bundle.max_rows_per_page = None;
        }
        if mask & BUNDLE_MASK_QUERY_COLUMN_MODELS != 0 {
            let table_id = parse_table_id(&parse_query(&request.query.sql)?.table_name)?;
            bundle.column_models = Some(self.ctx.truth.column_models(table_id).await?);
        }
        Ok(bundle)
    }

    /// Runs the page described by a token from an earlier result. Only the
    /// rows are computed.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::InvalidArgument`] for an empty or undecodable
    /// token, otherwise see [`TableQueryManager::query_single_page`].
    pub async fn query_next_page(
        &self,
        user: &UserInfo,
        next_page_token: &str,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, TableError> {
        let query = page_token::decode(next_page_token)?;
        let bundle = self
            .query_single_page(user, &query, QueryParts::RESULTS_ONLY, cancel)
            .await?;
        bundle
            .query_result
            .ok_or_else(|| TableError::Internal(anyhow::anyhow!("query produced no result page")))
    }

    /// Streams every row of a query to `handler` under the table's read
    /// lock, with no paging.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::InvalidArgument`] when the table has no
    /// columns or its row filter leaves nothing to read, and the errors of a
    /// consistent query otherwise.
    pub async fn run_consistent_query_as_stream(
        &self,
        user: &UserInfo,
        sql: &str,
        sort: &[SortItem],
        handler: &mut dyn RowHandler,
        cancel: &CancellationToken,
    ) -> Result<StreamedQuery, TableError> {
        let query = Query {
            sort: (!sort.is_empty()).then(|| sort.to_vec()),
            ..Query::new(sql)
        };
        let sql_query = match self.create_query(&query, None).await {
            Ok(sql_query) => sql_query,
            Err(TableError::EmptyResult { table_id, .. }) => {
                return Err(TableError::InvalidArgument(format!(
                    "Table {table_id} has an empty schema"
                )));
            }
            Err(e) => return Err(e),
        };
        let table_id = sql_query.table_id();
        let timeout = Duration::from_millis(self.ctx.config.read_lock_timeout_ms);
        let sql_query = &sql_query;

        self.ctx
            .locks
            .run_with_read_lock(table_id, timeout, move || async move {
                let status = self.availability.validate_table_is_available(table_id).await?;
                let filtered = match self.add_row_level_filter(user, sql_query).await {
                    Err(TableError::EmptyResult { message, .. }) => {
                        return Err(TableError::InvalidArgument(message));
                    }
                    other => other?,
                };
                let row_count = self.stream_rows(&filtered, handler, cancel).await?;
                tracing::info!(table_id, row_count, "query streamed");
                Ok(StreamedQuery {
                    table_id,
                    headers: filtered.select_columns().to_vec(),
                    include_row_id_and_version: filtered.includes_row_id_and_version(),
                    etag: status.last_table_change_etag,
                    row_count,
                })
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn query_as_stream(
        &self,
        user: &UserInfo,
        query: &SqlQuery,
        facets: &[ValidatedFacetColumn],
        parts: QueryParts,
        is_consistent: bool,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, TableError> {
        if !is_consistent {
            return self.run_parts(user, query, facets, parts, cancel).await;
        }
        let table_id = query.table_id();
        let timeout = Duration::from_millis(self.ctx.config.read_lock_timeout_ms);
        self.ctx
            .locks
            .run_with_read_lock(table_id, timeout, move || async move {
                let status = self.availability.validate_table_is_available(table_id).await?;
                let mut outcome = self.run_parts(user, query, facets, parts, cancel).await?;
                outcome.etag = status.last_table_change_etag;
                Ok(outcome)
            })
            .await
    }

    async fn run_parts(
        &self,
        user: &UserInfo,
        query: &SqlQuery,
        facets: &[ValidatedFacetColumn],
        parts: QueryParts,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, TableError> {
        let filtered = self.add_row_level_filter(user, query).await?;
        let faceted = filtered.with_facet_condition(facets)?;

        let rows = if parts.run_query {
            let mut rows = Vec::new();
            self.stream_rows(&faceted, &mut rows, cancel).await?;
            Some(rows)
        } else {
            None
        };
        let count = if parts.run_count {
            Some(self.count_rows(&faceted).await?)
        } else {
            None
        };
        let facet_results = if parts.return_facets {
            Some(
                try_join_all(
                    facets
                        .iter()
                        .map(|facet| self.facet_result(&filtered, facet, facets, cancel)),
                )
                .await?,
            )
        } else {
            None
        };

        Ok(QueryOutcome {
            rows,
            count,
            facets: facet_results,
            etag: None,
        })
    }

    /// Restricts a view query to the benefactors the user may read. Plain
    /// tables are returned unchanged.
    async fn add_row_level_filter(
        &self,
        user: &UserInfo,
        query: &SqlQuery,
    ) -> Result<SqlQuery, TableError> {
        let table_id = query.table_id();
        if !self.availability.get_table_type(table_id).await?.is_view() {
            return Ok(query.clone());
        }
        let benefactors: BTreeSet<i64> = self
            .ctx
            .index
            .query_longs(&ddl::distinct_benefactors_sql(table_id), &Params::new())
            .await?
            .into_iter()
            .collect();
        if benefactors.is_empty() {
            return Err(TableError::EmptyResult {
                table_id,
                message: "Table has no benefactors".to_string(),
            });
        }
        let accessible = self
            .ctx
            .authorizer
            .accessible_benefactors(user, &benefactors)
            .await?;
        tracing::debug!(
            table_id,
            benefactors = benefactors.len(),
            accessible = accessible.len(),
            "row filter applied"
        );
        Ok(query.with_benefactor_filter(&accessible)?)
    }

    /// Feeds every row of `query` to `handler` and returns the row count.
    async fn stream_rows(
        &self,
        query: &SqlQuery,
        handler: &mut dyn RowHandler,
        cancel: &CancellationToken,
    ) -> Result<u64, TableError> {
        let headers = query.select_columns();
        let with_row_ids = query.includes_row_id_and_version();
        let mut row_count = 0_u64;
        let mut sink = |raw: RawRow| -> anyhow::Result<()> {
            handler.next_row(to_row(headers, with_row_ids, raw)?)?;
            row_count += 1;
            Ok(())
        };
        self.ctx
            .index
            .query_rows(query.output_sql(), query.parameters(), cancel, &mut sink)
            .await?;
        Ok(row_count)
    }

    async fn count_rows(&self, query: &SqlQuery) -> Result<u64, TableError> {
        let Some(count_sql) = query.count_sql() else {
            return Ok(query.adjust_count(1));
        };
        let raw = self
            .ctx
            .index
            .query_long(count_sql, query.parameters())
            .await?
            .unwrap_or(0);
        Ok(query.adjust_count(u64::try_from(raw).unwrap_or(0)))
    }

    async fn facet_result(
        &self,
        query: &SqlQuery,
        facet: &ValidatedFacetColumn,
        all: &[ValidatedFacetColumn],
        cancel: &CancellationToken,
    ) -> Result<FacetResult, TableError> {
        if facet.facet_type == FacetType::Range {
            return Ok(FacetResult {
                column_name: facet.column_name.clone(),
                facet_type: FacetType::Range,
                facet_values: None,
                selected_range: facet.facet_range.clone(),
            });
        }

        let count_query = query.facet_count_query(
            &facet.column_name,
            all,
            self.ctx.config.facet_value_limit,
        )?;
        let value_type = count_query
            .select_columns()
            .first()
            .and_then(|column| column.column_type);
        let selected = facet.facet_values.as_ref();
        let mut values = Vec::new();
        let mut sink = |raw: RawRow| -> anyhow::Result<()> {
            let mut cells = raw.into_iter();
            let value = cells.next().flatten();
            let value = match value_type {
                Some(column_type) => type_info(column_type).decode_from_db(value.as_deref()),
                None => value,
            };
            let count = cells
                .next()
                .flatten()
                .map(|c| c.parse::<u64>())
                .transpose()
                .context("invalid facet frequency")?
                .unwrap_or(0);
            let is_selected = matches!((&value, selected), (Some(v), Some(s)) if s.contains(v));
            values.push(FacetValueCount {
                value,
                count,
                is_selected,
            });
            Ok(())
        };
        self.ctx
            .index
            .query_rows(
                count_query.output_sql(),
                count_query.parameters(),
                cancel,
                &mut sink,
            )
            .await?;

        Ok(FacetResult {
            column_name: facet.column_name.clone(),
            facet_type: FacetType::Enumeration,
            facet_values: Some(values),
            selected_range: None,
        })
    }
}

/// Splits the trailing `ROW_ID, ROW_VERSION` off a raw row and decodes the
/// remaining values by their column type.
fn to_row(headers: &[SelectColumn], with_row_ids: bool, mut raw: RawRow) -> anyhow::Result<Row> {
    let (row_id, version_number) = if with_row_ids {
        let version = raw.pop().flatten();
        let row_id = raw.pop().flatten();
        (parse_long(row_id.as_deref())?, parse_long(version.as_deref())?)
    } else {
        (None, None)
    };
    let values = raw
        .into_iter()
        .enumerate()
        .map(|(i, value)| match headers.get(i).and_then(|h| h.column_type) {
            Some(column_type) => type_info(column_type).decode_from_db(value.as_deref()),
            None => value,
        })
        .collect();
    Ok(Row {
        row_id,
        version_number,
        values,
    })
}

fn parse_long(raw: Option<&str>) -> anyhow::Result<Option<i64>> {
    raw.map(|v| {
        v.parse::<i64>()
            .with_context(|| format!("invalid row number {v:?}"))
    })
    .transpose()
}

fn empty_bundle(table_id: i64, parts: QueryParts) -> QueryResultBundle {
    QueryResultBundle {
        query_result: parts.run_query.then(|| QueryResult {
            query_results: RowSet {
                table_id,
                headers: Vec::new(),
                rows: Vec::new(),
                etag: None,
            },
            next_page_token: None,
        }),
        query_count: parts.run_count.then_some(0),
        select_columns: Some(Vec::new()),
        max_rows_per_page: Some(1),
        column_models: None,
        facets: parts.return_facets.then(Vec::new),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tabledex_core::hash::schema_hash;
    use tabledex_core::query::FacetColumnRequest;
    use tabledex_core::{ColumnType, ObjectType};

    use super::*;
    use crate::config::TableServiceConfig;
    use crate::testing::Harness;

    fn schema() -> Vec<ColumnModel> {
        vec![
            ColumnModel::new(1, "foo", ColumnType::String).with_maximum_size(50),
            ColumnModel::new(2, "bar", ColumnType::Integer),
        ]
    }

    fn faceted_schema() -> Vec<ColumnModel> {
        let mut schema = schema();
        schema.push(
            ColumnModel::new(3, "species", ColumnType::String)
                .with_maximum_size(20)
                .with_facet_type(FacetType::Enumeration),
        );
        schema.push(ColumnModel::new(4, "age", ColumnType::Integer).with_facet_type(FacetType::Range));
        schema
    }

    fn raw(cells: &[&str]) -> RawRow {
        cells.iter().map(|c| Some((*c).to_string())).collect()
    }

    fn user() -> UserInfo {
        UserInfo::new(42)
    }

    fn page_query(sql: &str, limit: u64, consistent: bool) -> Query {
        Query {
            limit: Some(limit),
            is_consistent: consistent,
            ..Query::new(sql)
        }
    }

    async fn available_table(h: &Harness, table_id: i64, object_type: ObjectType, schema: Vec<ColumnModel>) {
        h.index.set_index_state(table_id, -1, &schema_hash(&schema));
        h.truth.add_table(table_id, object_type, schema);
        let token = h.ctx.status_store.reset_to_processing(table_id, 1_000).await.unwrap();
        h.ctx
            .status_store
            .attempt_set_available(table_id, &token, Some("etag-1"), 1_000)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn full_page_carries_a_token_to_the_next_page() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        h.index.respond_rows(
            "SELECT _C1_, _C2_, ROW_ID",
            vec![raw(&["a", "1", "10", "3"]), raw(&["b", "2", "11", "3"])],
        );
        h.index.respond_long("SELECT COUNT(*) FROM T5", Some(7));
        let manager = TableQueryManager::new(h.ctx.clone());
        let cancel = CancellationToken::new();

        let bundle = manager
            .query_single_page(
                &user(),
                &page_query("select foo, bar from syn5", 2, false),
                QueryParts::from_mask(BUNDLE_MASK_ALL),
                &cancel,
            )
            .await
            .unwrap();

        let result = bundle.query_result.unwrap();
        assert_eq!(result.query_results.table_id, 5);
        assert_eq!(result.query_results.rows.len(), 2);
        assert_eq!(
            result.query_results.rows[0],
            Row {
                row_id: Some(10),
                version_number: Some(3),
                values: vec![Some("a".to_string()), Some("1".to_string())],
            }
        );
        assert_eq!(result.query_results.etag, None);
        assert_eq!(bundle.query_count, Some(7));
        assert_eq!(bundle.select_columns.unwrap().len(), 2);

        let token = result.next_page_token.unwrap();
        let next = manager.query_next_page(&user(), &token, &cancel).await.unwrap();
        assert_eq!(next.query_results.rows.len(), 2);
        let statements = h.index.executed_starting_with("SELECT _C1_, _C2_, ROW_ID");
        assert!(statements[0].ends_with("LIMIT 2 OFFSET 0"));
        assert!(statements[1].ends_with("LIMIT 2 OFFSET 2"));
        assert_eq!(h.index.count_starting_with("SELECT COUNT(*)"), 1);
    }

    #[tokio::test]
    async fn short_page_has_no_token() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        h.index
            .respond_rows("SELECT _C1_", vec![raw(&["a", "1", "10", "3"])]);
        let manager = TableQueryManager::new(h.ctx.clone());

        let bundle = manager
            .query_single_page(
                &user(),
                &page_query("select foo, bar from syn5", 2, false),
                QueryParts::RESULTS_ONLY,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let result = bundle.query_result.unwrap();
        assert_eq!(result.query_results.rows.len(), 1);
        assert_eq!(result.next_page_token, None);
        assert_eq!(bundle.query_count, None);
        assert_eq!(bundle.facets, None);
    }

    #[tokio::test]
    async fn consistent_query_returns_the_table_etag() {
        let h = Harness::new();
        available_table(&h, 5, ObjectType::Table, schema()).await;
        h.index
            .respond_rows("SELECT _C1_", vec![raw(&["a", "1", "10", "3"])]);
        let manager = TableQueryManager::new(h.ctx.clone());

        let bundle = manager
            .query_single_page(
                &user(),
                &page_query("select foo, bar from syn5", 10, true),
                QueryParts::RESULTS_ONLY,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let result = bundle.query_result.unwrap();
        assert_eq!(result.query_results.etag.as_deref(), Some("etag-1"));
        assert!(h.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn consistent_query_of_processing_table_is_unavailable() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        h.ctx.status_store.reset_to_processing(5, 1_000).await.unwrap();
        let manager = TableQueryManager::new(h.ctx.clone());

        let err = manager
            .query_single_page(
                &user(),
                &page_query("select foo from syn5", 10, true),
                QueryParts::RESULTS_ONLY,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TableError::Unavailable(ref status) if status.table_id == 5));
        assert!(err.is_retryable());
        assert!(h.index.executed_starting_with("SELECT _C1_").is_empty());
    }

    #[tokio::test]
    async fn inconsistent_query_skips_the_status_check() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        h.ctx.status_store.reset_to_processing(5, 1_000).await.unwrap();
        let manager = TableQueryManager::new(h.ctx.clone());

        let bundle = manager
            .query_single_page(
                &user(),
                &page_query("select foo from syn5", 10, false),
                QueryParts::RESULTS_ONLY,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(bundle.query_result.is_some());
    }

    #[tokio::test]
    async fn empty_schema_yields_an_empty_bundle() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, Vec::new());
        let manager = TableQueryManager::new(h.ctx.clone());

        let bundle = manager
            .query_single_page(
                &user(),
                &Query::new("select * from syn5"),
                QueryParts::from_mask(BUNDLE_MASK_ALL),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let result = bundle.query_result.unwrap();
        assert_eq!(result.query_results.table_id, 5);
        assert!(result.query_results.rows.is_empty());
        assert_eq!(bundle.query_count, Some(0));
        assert_eq!(bundle.max_rows_per_page, Some(1));
        assert_eq!(bundle.select_columns, Some(Vec::new()));
        assert_eq!(bundle.facets, Some(Vec::new()));
        assert!(h.index.statements().is_empty());
    }

    #[tokio::test]
    async fn invalid_sql_is_rejected() {
        let h = Harness::new();
        let manager = TableQueryManager::new(h.ctx.clone());
        let err = manager
            .query_single_page(
                &user(),
                &Query::new("delete from syn5"),
                QueryParts::RESULTS_ONLY,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn view_rows_are_filtered_by_benefactor() {
        let h = Harness::new();
        h.truth.add_table(6, ObjectType::EntityView, schema());
        h.index
            .respond_longs(&ddl::distinct_benefactors_sql(6), vec![1, 2]);
        h.authorizer.set_visible([2]);
        let manager = TableQueryManager::new(h.ctx.clone());

        manager
            .query_single_page(
                &user(),
                &page_query("select foo from syn6", 10, false),
                QueryParts::RESULTS_ONLY,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let statements = h.index.executed_starting_with("SELECT _C1_");
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("ROW_BENEFACTOR IN"));
    }

    #[tokio::test]
    async fn view_with_no_visible_benefactors_runs_nothing() {
        let h = Harness::new();
        h.truth.add_table(6, ObjectType::EntityView, schema());
        h.index
            .respond_longs(&ddl::distinct_benefactors_sql(6), vec![1, 2]);
        h.authorizer.set_visible([]);
        let manager = TableQueryManager::new(h.ctx.clone());

        let bundle = manager
            .query_single_page(
                &user(),
                &page_query("select foo from syn6", 10, false),
                QueryParts::from_mask(BUNDLE_MASK_QUERY_RESULTS | BUNDLE_MASK_QUERY_COUNT),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(bundle.query_result.unwrap().query_results.rows.is_empty());
        assert_eq!(bundle.query_count, Some(0));
        assert!(h.index.executed_starting_with("SELECT _C1_").is_empty());
        assert!(h.index.executed_starting_with("SELECT COUNT").is_empty());
    }

    #[tokio::test]
    async fn view_without_benefactors_is_empty() {
        let h = Harness::new();
        h.truth.add_table(6, ObjectType::EntityView, schema());
        let manager = TableQueryManager::new(h.ctx.clone());

        let bundle = manager
            .query_single_page(
                &user(),
                &page_query("select foo from syn6", 10, false),
                QueryParts::RESULTS_ONLY,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(bundle.query_result.unwrap().query_results.table_id, 6);
    }

    #[tokio::test]
    async fn facets_report_value_counts_and_selected_range() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, faceted_schema());
        h.index.respond_rows(
            "SELECT _C3_, COUNT(*)",
            vec![raw(&["cat", "3"]), raw(&["dog", "2"])],
        );
        let manager = TableQueryManager::new(h.ctx.clone());
        let query = Query {
            selected_facets: Some(vec![
                FacetColumnRequest::values("species", ["cat"]),
                FacetColumnRequest::range("age", Some("1"), None),
            ]),
            is_consistent: false,
            ..Query::new("select * from syn5")
        };

        let bundle = manager
            .query_bundle(
                &user(),
                &QueryBundleRequest {
                    query,
                    part_mask: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let facets = bundle.facets.unwrap();
        assert_eq!(facets.len(), 2);
        assert_eq!(facets[0].column_name, "species");
        assert_eq!(
            facets[0].facet_values.as_deref(),
            Some(
                &[
                    FacetValueCount {
                        value: Some("cat".to_string()),
                        count: 3,
                        is_selected: true,
                    },
                    FacetValueCount {
                        value: Some("dog".to_string()),
                        count: 2,
                        is_selected: false,
                    },
                ][..]
            )
        );
        assert_eq!(facets[1].facet_type, FacetType::Range);
        assert_eq!(
            facets[1].selected_range,
            Some(FacetRange {
                min: Some("1".to_string()),
                max: None,
            })
        );

        let rows_sql = &h.index.executed_starting_with("SELECT _C1_, _C2_, _C3_")[0];
        assert!(rows_sql.contains("WHERE"));
        let facet_sql = &h.index.executed_starting_with("SELECT _C3_, COUNT(*)")[0];
        assert!(facet_sql.ends_with(&format!("LIMIT {} OFFSET 0", h.ctx.config.facet_value_limit)));
        assert_eq!(bundle.column_models, Some(faceted_schema()));
    }

    #[tokio::test]
    async fn bundle_mask_selects_parts() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        h.index.respond_long("SELECT COUNT(*) FROM T5", Some(4));
        let manager = TableQueryManager::new(h.ctx.clone());
        let request = QueryBundleRequest {
            query: page_query("select foo from syn5", 10, false),
            part_mask: Some(BUNDLE_MASK_QUERY_COUNT | BUNDLE_MASK_QUERY_MAX_ROWS_PER_PAGE),
        };

        let bundle = manager
            .query_bundle(&user(), &request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bundle.query_result, None);
        assert_eq!(bundle.query_count, Some(4));
        assert_eq!(bundle.select_columns, None);
        assert!(bundle.max_rows_per_page.is_some_and(|rows| rows > 0));
        assert_eq!(bundle.column_models, None);
        assert_eq!(bundle.facets, None);
        assert!(h.index.executed_starting_with("SELECT _C1_").is_empty());
    }

    #[tokio::test]
    async fn count_respects_the_query_limit() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, schema());
        h.index.respond_long("SELECT COUNT(*) FROM T5", Some(25));
        let manager = TableQueryManager::new(h.ctx.clone());

        let bundle = manager
            .query_single_page(
                &user(),
                &Query {
                    is_consistent: false,
                    ..Query::new("select foo from syn5 limit 10 offset 20")
                },
                QueryParts::from_mask(BUNDLE_MASK_QUERY_COUNT),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(bundle.query_count, Some(5));
    }

    #[tokio::test]
    async fn bad_token_is_an_invalid_argument() {
        let h = Harness::new();
        let manager = TableQueryManager::new(h.ctx.clone());
        let err = manager
            .query_next_page(&user(), "not a token", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn stream_hands_every_row_to_the_handler() {
        let h = Harness::new();
        available_table(&h, 5, ObjectType::Table, schema()).await;
        h.index.respond_rows(
            "SELECT _C1_",
            vec![raw(&["a", "10", "3"]), raw(&["b", "11", "3"]), raw(&["c", "12", "4"])],
        );
        let manager = TableQueryManager::new(h.ctx.clone());
        let mut rows: Vec<Row> = Vec::new();

        let streamed = manager
            .run_consistent_query_as_stream(
                &user(),
                "select foo from syn5",
                &[SortItem::new("foo", None)],
                &mut rows,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(streamed.table_id, 5);
        assert_eq!(streamed.row_count, 3);
        assert_eq!(streamed.etag.as_deref(), Some("etag-1"));
        assert!(streamed.include_row_id_and_version);
        assert_eq!(streamed.headers.len(), 1);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].row_id, Some(12));
        let sql = &h.index.executed_starting_with("SELECT _C1_")[0];
        assert!(sql.contains("ORDER BY _C1_"));
        assert!(!sql.contains("LIMIT"));
    }

    #[tokio::test]
    async fn stream_of_empty_schema_is_an_invalid_argument() {
        let h = Harness::new();
        h.truth.add_table(5, ObjectType::Table, Vec::new());
        let manager = TableQueryManager::new(h.ctx.clone());
        let mut rows: Vec<Row> = Vec::new();

        let err = manager
            .run_consistent_query_as_stream(
                &user(),
                "select * from syn5",
                &[],
                &mut rows,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Table 5 has an empty schema");
    }

    #[tokio::test]
    async fn cancelled_stream_stops() {
        let h = Harness::new();
        available_table(&h, 5, ObjectType::Table, schema()).await;
        h.index
            .respond_rows("SELECT _C1_", vec![raw(&["a", "10", "3"])]);
        let manager = TableQueryManager::new(h.ctx.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut rows: Vec<Row> = Vec::new();

        let err = manager
            .run_consistent_query_as_stream(&user(), "select foo from syn5", &[], &mut rows, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::Internal(_)));
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn consistent_read_waits_behind_a_rebuild() {
        let h = Harness::new();
        available_table(&h, 5, ObjectType::Table, schema()).await;
        let ctx = h.ctx.clone().with_config(TableServiceConfig {
            read_lock_timeout_ms: 20,
            ..TableServiceConfig::default()
        });
        let manager = TableQueryManager::new(ctx.clone());
        let manager = &manager;

        let err = ctx
            .locks
            .run_with_exclusive_lock(5, Duration::from_millis(50), move || async move {
                Ok(manager
                    .query_single_page(
                        &user(),
                        &page_query("select foo from syn5", 10, true),
                        QueryParts::RESULTS_ONLY,
                        &CancellationToken::new(),
                    )
                    .await
                    .unwrap_err())
            })
            .await
            .unwrap();
        assert!(matches!(err, TableError::LockUnavailable { table_id: 5, .. }));
    }

    #[test]
    fn bundle_serializes_in_camel_case() {
        let bundle = empty_bundle(
            5,
            QueryParts {
                run_query: true,
                run_count: true,
                return_facets: false,
            },
        );
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["queryCount"], 0);
        assert_eq!(json["maxRowsPerPage"], 1);
        assert_eq!(json["queryResult"]["queryResults"]["tableId"], 5);
        assert!(json.get("facets").is_none());
        assert!(json["queryResult"].get("nextPageToken").is_none());

        let back: QueryResultBundle = serde_json::from_value(json).unwrap();
        assert_eq!(back, bundle);
    }
}
