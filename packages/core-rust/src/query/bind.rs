//! Binds a parsed query to a table schema and renders the physical SQL.
//!
//! User column names become `_C<id>_`, the table becomes `T<id>` and every
//! literal becomes a named parameter typed by the column it is compared
//! with. A [`SqlQuery`] is immutable: the sort, row-filter and facet
//! rewrites each return a freshly bound copy.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::ast::{
    AggregateFunction, ColumnReference, ComparisonOperator, DerivedColumn, Literal, Pagination,
    Predicate, QuerySpecification, SearchCondition, SelectList, SortDirection, SortSpecification,
    TruthValue, ValueExpression,
};
use super::facet::{concat_facet_search_conditions, ValidatedFacetColumn};
use super::QueryError;
use crate::codec::{self, AbstractDouble, DbValue};
use crate::ddl::{
    column_id_from_name, column_name_for_id, double_case_expression, double_column_name,
    table_name, ROW_BENEFACTOR, ROW_ID, ROW_VERSION,
};
use crate::types::{ColumnModel, ColumnType, SelectColumn, DEFAULT_MAX_STRING_SIZE};

/// Columns every table carries, addressable by name in a query.
const RESERVED_COLUMNS: [&str; 3] = [ROW_ID, ROW_VERSION, ROW_BENEFACTOR];

/// Row size charged for a select column with no declared type.
const UNTYPED_COLUMN_BYTES: u64 = DEFAULT_MAX_STRING_SIZE as u64 * codec::MAX_BYTES_PER_CHAR as u64;

/// LIMIT used when only an offset is requested.
const NO_LIMIT: u64 = u64::MAX;

/// Caller-supplied sort on one column, applied ahead of the query's own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortItem {
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<SortDirection>,
}

impl SortItem {
    #[must_use]
    pub fn new(column: impl Into<String>, direction: Option<SortDirection>) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }
}

/// Puts `sort` ahead of the query's own ORDER BY. Original items naming a
/// column already in `sort` are dropped.
#[must_use]
pub fn convert_to_sorted_query(model: &QuerySpecification, sort: &[SortItem]) -> QuerySpecification {
    let mut order_by: Vec<SortSpecification> = sort
        .iter()
        .map(|item| SortSpecification {
            key: ValueExpression::column(item.column.clone()),
            direction: item.direction,
        })
        .collect();
    order_by.extend(
        model
            .order_by
            .iter()
            .filter(|spec| {
                spec.key
                    .as_column()
                    .map_or(true, |c| !sort.iter().any(|item| item.column == c.name))
            })
            .cloned(),
    );
    QuerySpecification {
        order_by,
        ..model.clone()
    }
}

/// Table id named by the FROM clause: `syn123` or `123`.
///
/// # Errors
///
/// Returns [`QueryError::InvalidQuery`] for any other table name.
pub fn parse_table_id(table_name: &str) -> Result<i64, QueryError> {
    let digits = match table_name.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("syn") => &table_name[3..],
        _ => table_name,
    };
    digits
        .parse::<i64>()
        .ok()
        .filter(|id| *id >= 0)
        .ok_or_else(|| QueryError::InvalidQuery(format!("Invalid table name: {table_name}")))
}

/// Paging inputs that survive every rewrite of a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Replaces the query's own OFFSET.
    pub offset: Option<u64>,
    /// Replaces the query's own LIMIT.
    pub limit: Option<u64>,
    /// Byte budget of one page; caps the LIMIT when set.
    pub max_bytes_per_page: Option<u64>,
}

/// A query bound to a table schema, ready to execute.
#[derive(Debug, Clone)]
pub struct SqlQuery {
    table_id: i64,
    table_schema: Vec<ColumnModel>,
    model: QuerySpecification,
    options: QueryOptions,
    output_sql: String,
    count_sql: Option<String>,
    parameters: BTreeMap<String, DbValue>,
    select_columns: Vec<SelectColumn>,
    is_aggregated: bool,
    max_rows_per_page: Option<u64>,
    offset: u64,
    limit: Option<u64>,
}

impl SqlQuery {
    /// Binds `model` to `schema` with no paging overrides.
    ///
    /// # Errors
    ///
    /// See [`SqlQuery::with_options`].
    pub fn new(model: QuerySpecification, schema: Vec<ColumnModel>) -> Result<Self, QueryError> {
        Self::with_options(model, schema, QueryOptions::default())
    }

    /// Binds `model` to `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::EmptyResult`] for an empty schema and
    /// [`QueryError::InvalidQuery`] for an invalid table name, an unknown
    /// column or a literal that does not fit its column's type.
    pub fn with_options(
        model: QuerySpecification,
        schema: Vec<ColumnModel>,
        options: QueryOptions,
    ) -> Result<Self, QueryError> {
        let table_id = parse_table_id(&model.table_name)?;
        if schema.is_empty() {
            return Err(QueryError::empty_result(
                table_id,
                format!("Table schema is empty for: {}", model.table_name),
            ));
        }

        let mut binder = Binder::new(&schema, &model);
        let select = binder.select_list(&model.select_list)?;
        let where_sql = model
            .where_clause
            .as_ref()
            .map(|condition| binder.condition(condition))
            .transpose()?;
        let group_by = model
            .group_by
            .iter()
            .map(|column| binder.sort_key(&ValueExpression::Column(column.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let order_by = model
            .order_by
            .iter()
            .map(|spec| {
                let key = binder.sort_key(&spec.key)?;
                Ok(match spec.direction {
                    Some(direction) => format!("{key} {}", direction.as_str()),
                    None => key,
                })
            })
            .collect::<Result<Vec<_>, QueryError>>()?;

        let is_aggregated = model.is_aggregated();
        let max_rows_per_page = options
            .max_bytes_per_page
            .and_then(|max_bytes| max_rows_per_page(max_bytes, &select));
        let sql_pagination = model.pagination;
        let mut limit = options.limit.or(sql_pagination.map(|p| p.limit));
        let offset = options
            .offset
            .or(sql_pagination.and_then(|p| p.offset))
            .unwrap_or(0);
        if let Some(max_rows) = max_rows_per_page {
            limit = Some(limit.map_or(max_rows, |l| l.min(max_rows)));
        }

        let table = table_name(table_id);
        let mut sql = String::from("SELECT ");
        if model.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(
            &select
                .iter()
                .map(|c| c.sql.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        );
        if !is_aggregated {
            sql.push_str(&format!(", {ROW_ID}, {ROW_VERSION}"));
        }
        sql.push_str(&format!(" FROM {table}"));
        if let Some(where_sql) = &where_sql {
            sql.push_str(&format!(" WHERE {where_sql}"));
        }
        if !group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", group_by.join(", ")));
        }
        if !order_by.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order_by.join(", ")));
        }
        match limit {
            Some(limit) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            None if offset > 0 => sql.push_str(&format!(" LIMIT {NO_LIMIT} OFFSET {offset}")),
            None => {}
        }

        let count_sql = if model.is_simple_aggregate() {
            None
        } else {
            let counted = if !group_by.is_empty() {
                format!("COUNT(DISTINCT {})", group_by.join(", "))
            } else if model.distinct {
                format!("COUNT(DISTINCT {})", binder.distinct_list(&model.select_list)?.join(", "))
            } else {
                "COUNT(*)".to_string()
            };
            let mut count = format!("SELECT {counted} FROM {table}");
            if let Some(where_sql) = &where_sql {
                count.push_str(&format!(" WHERE {where_sql}"));
            }
            Some(count)
        };

        let parameters = binder.into_parameters();
        Ok(Self {
            table_id,
            table_schema: schema,
            model,
            options,
            output_sql: sql,
            count_sql,
            parameters,
            select_columns: select.into_iter().map(|c| c.header).collect(),
            is_aggregated,
            max_rows_per_page,
            offset,
            limit,
        })
    }

    fn rebind(&self, model: QuerySpecification) -> Result<Self, QueryError> {
        Self::with_options(model, self.table_schema.clone(), self.options)
    }

    #[must_use]
    pub fn table_id(&self) -> i64 {
        self.table_id
    }

    #[must_use]
    pub fn table_schema(&self) -> &[ColumnModel] {
        &self.table_schema
    }

    /// The query as the caller wrote it, after any rewrites.
    #[must_use]
    pub fn model(&self) -> &QuerySpecification {
        &self.model
    }

    #[must_use]
    pub fn options(&self) -> QueryOptions {
        self.options
    }

    /// Physical SQL with named parameters.
    #[must_use]
    pub fn output_sql(&self) -> &str {
        &self.output_sql
    }

    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, DbValue> {
        &self.parameters
    }

    #[must_use]
    pub fn select_columns(&self) -> &[SelectColumn] {
        &self.select_columns
    }

    #[must_use]
    pub fn is_aggregated(&self) -> bool {
        self.is_aggregated
    }

    /// Non-aggregated rows carry `ROW_ID` and `ROW_VERSION` after the
    /// selected columns.
    #[must_use]
    pub fn includes_row_id_and_version(&self) -> bool {
        !self.is_aggregated
    }

    #[must_use]
    pub fn max_rows_per_page(&self) -> Option<u64> {
        self.max_rows_per_page
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Effective LIMIT, capped by [`SqlQuery::max_rows_per_page`].
    #[must_use]
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Counts every row the query could page through, ignoring LIMIT and
    /// OFFSET. `None` for aggregates without GROUP BY, which are always one
    /// row.
    #[must_use]
    pub fn count_sql(&self) -> Option<&str> {
        self.count_sql.as_deref()
    }

    /// Applies the query's own LIMIT and OFFSET to a raw count.
    #[must_use]
    pub fn adjust_count(&self, raw_count: u64) -> u64 {
        if self.model.is_simple_aggregate() {
            return 1;
        }
        match self.model.pagination {
            Some(Pagination { limit, offset }) => {
                raw_count.saturating_sub(offset.unwrap_or(0)).min(limit)
            }
            None => raw_count,
        }
    }

    /// Restricts rows to the given benefactors:
    /// `(<where>) AND ROW_BENEFACTOR IN (...)`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::EmptyResult`] when `accessible` is empty.
    pub fn with_benefactor_filter(&self, accessible: &BTreeSet<i64>) -> Result<Self, QueryError> {
        if accessible.is_empty() {
            return Err(QueryError::empty_result(
                self.table_id,
                "User does not have access to any benefactors in the table.",
            ));
        }
        let filter = SearchCondition::Predicate(Predicate::In {
            expression: ValueExpression::column(ROW_BENEFACTOR),
            not: false,
            values: accessible
                .iter()
                .map(|id| ValueExpression::Literal(Literal::Number(id.to_string())))
                .collect(),
        });
        self.rebind(self.model.with_appended_condition(filter))
    }

    /// Appends the combined facet filters; unchanged when none apply.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidQuery`] when a selected facet value does
    /// not fit its column's type.
    pub fn with_facet_condition(&self, facets: &[ValidatedFacetColumn]) -> Result<Self, QueryError> {
        match concat_facet_search_conditions(facets, None) {
            Some(condition) => self.rebind(self.model.with_appended_condition(condition)),
            None => Ok(self.clone()),
        }
    }

    /// Value frequencies of one facet column, filtered by this query and by
    /// every other facet's selection:
    ///
    /// `SELECT c AS value, COUNT(*) AS frequency ... GROUP BY c
    /// ORDER BY frequency DESC, value ASC LIMIT <limit>`
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidQuery`] for an unknown column or a
    /// selected facet value that does not fit its column's type.
    pub fn facet_count_query(
        &self,
        column_name: &str,
        facets: &[ValidatedFacetColumn],
        limit: u64,
    ) -> Result<Self, QueryError> {
        let mut where_clause = self.model.where_clause.clone();
        if let Some(others) = concat_facet_search_conditions(facets, Some(column_name)) {
            where_clause = Some(match where_clause {
                Some(existing) => SearchCondition::And(
                    Box::new(existing.nested()),
                    Box::new(others),
                ),
                None => others,
            });
        }
        let model = QuerySpecification {
            distinct: false,
            select_list: SelectList::Columns(vec![
                DerivedColumn {
                    expression: ValueExpression::column(column_name),
                    alias: Some("value".to_string()),
                },
                DerivedColumn {
                    expression: ValueExpression::Aggregate {
                        function: AggregateFunction::Count,
                        distinct: false,
                        argument: None,
                    },
                    alias: Some("frequency".to_string()),
                },
            ]),
            table_name: self.model.table_name.clone(),
            where_clause,
            group_by: vec![ColumnReference::new(column_name)],
            order_by: vec![
                SortSpecification {
                    key: ValueExpression::column("frequency"),
                    direction: Some(SortDirection::Desc),
                },
                SortSpecification {
                    key: ValueExpression::column("value"),
                    direction: Some(SortDirection::Asc),
                },
            ],
            pagination: Some(Pagination {
                limit,
                offset: None,
            }),
        };
        Self::new(model, self.table_schema.clone())
    }
}

/// One bound select item.
struct BoundSelect {
    sql: String,
    header: SelectColumn,
    maximum_size: Option<u32>,
}

fn max_rows_per_page(max_bytes: u64, select: &[BoundSelect]) -> Option<u64> {
    let row_size: u64 = select
        .iter()
        .map(|column| match column.header.column_type {
            Some(column_type) => {
                u64::from(codec::type_info(column_type).max_value_bytes(column.maximum_size))
            }
            None => UNTYPED_COLUMN_BYTES,
        })
        .sum();
    // A row wider than the budget still comes back one per page.
    (row_size >= 1).then(|| (max_bytes / row_size).max(1))
}

// ---------------------------------------------------------------------------
// Binder
// ---------------------------------------------------------------------------

/// A column a query may name.
#[derive(Clone, Copy)]
enum Resolved<'a> {
    User(&'a ColumnModel),
    Reserved(&'static str),
}

impl Resolved<'_> {
    fn column_type(self) -> ColumnType {
        match self {
            Resolved::User(column) => column.column_type,
            Resolved::Reserved(_) => ColumnType::Integer,
        }
    }

    fn maximum_size(self) -> Option<u32> {
        match self {
            Resolved::User(column) => column.maximum_size,
            Resolved::Reserved(_) => None,
        }
    }

    fn physical_name(self) -> String {
        match self {
            Resolved::User(column) => column_name_for_id(column.id),
            Resolved::Reserved(name) => name.to_string(),
        }
    }
}

/// Where a value expression appears; doubles read through their sentinel
/// only at the top of the select list.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Position {
    Select,
    Nested,
}

struct Binder<'a> {
    schema: &'a [ColumnModel],
    by_name: HashMap<&'a str, &'a ColumnModel>,
    by_id: HashMap<i64, &'a ColumnModel>,
    aliases: HashMap<&'a str, &'a ValueExpression>,
    parameters: BTreeMap<String, DbValue>,
}

impl<'a> Binder<'a> {
    fn new(schema: &'a [ColumnModel], model: &'a QuerySpecification) -> Self {
        let aliases = match &model.select_list {
            SelectList::Star => HashMap::new(),
            SelectList::Columns(columns) => columns
                .iter()
                .filter_map(|c| c.alias.as_deref().map(|alias| (alias, &c.expression)))
                .collect(),
        };
        Self {
            schema,
            by_name: schema.iter().map(|c| (c.name.as_str(), c)).collect(),
            by_id: schema.iter().map(|c| (c.id, c)).collect(),
            aliases,
            parameters: BTreeMap::new(),
        }
    }

    fn into_parameters(self) -> BTreeMap<String, DbValue> {
        self.parameters
    }

    fn resolve(&self, name: &str) -> Result<Resolved<'a>, QueryError> {
        if let Some(column) = self.by_name.get(name) {
            return Ok(Resolved::User(*column));
        }
        if let Some(reserved) = RESERVED_COLUMNS
            .iter()
            .find(|reserved| reserved.eq_ignore_ascii_case(name))
        {
            return Ok(Resolved::Reserved(*reserved));
        }
        column_id_from_name(name)
            .ok()
            .and_then(|id| self.by_id.get(&id))
            .map(|column| Resolved::User(*column))
            .ok_or_else(|| QueryError::InvalidQuery(format!("Unknown column name: {name}")))
    }

    fn column_type_of(&self, expression: &ValueExpression) -> Option<ColumnType> {
        let column = expression.as_column()?;
        self.resolve(&column.name).ok().map(Resolved::column_type)
    }

    fn bind_parameter(&mut self, value: DbValue) -> String {
        let name = format!("b{}", self.parameters.len());
        let placeholder = format!(":{name}");
        self.parameters.insert(name, value);
        placeholder
    }

    fn literal(&mut self, literal: &Literal, hint: Option<ColumnType>) -> Result<String, QueryError> {
        let value = match (literal, hint) {
            (Literal::Null, _) => return Ok("NULL".to_string()),
            (literal, Some(column_type)) => {
                let text = literal.text().unwrap_or_default();
                codec::type_info(column_type)
                    .parse_value_for_db(&text)
                    .map_err(|e| QueryError::InvalidQuery(e.to_string()))?
            }
            (Literal::String(s), None) => DbValue::String(s.clone()),
            (Literal::Boolean(b), None) => DbValue::Bool(*b),
            (Literal::Number(n), None) => untyped_number(n),
        };
        Ok(self.bind_parameter(value))
    }

    fn value(
        &mut self,
        expression: &ValueExpression,
        position: Position,
        hint: Option<ColumnType>,
    ) -> Result<String, QueryError> {
        match expression {
            ValueExpression::Column(column) => {
                let resolved = self.resolve(&column.name)?;
                Ok(match resolved {
                    Resolved::User(model)
                        if position == Position::Select && model.column_type.is_double() =>
                    {
                        double_case_expression(model.id)
                    }
                    other => other.physical_name(),
                })
            }
            ValueExpression::Literal(literal) => self.literal(literal, hint),
            ValueExpression::Aggregate {
                function,
                distinct,
                argument,
            } => {
                let Some(argument) = argument else {
                    return Ok(format!("{}(*)", function.as_str()));
                };
                let argument = self.value(argument, Position::Nested, None)?;
                let distinct = if *distinct { "DISTINCT " } else { "" };
                Ok(format!("{}({distinct}{argument})", function.as_str()))
            }
            ValueExpression::Function {
                function,
                arguments,
                bare,
            } => {
                if *bare {
                    return Ok(function.as_str().to_string());
                }
                let arguments = arguments
                    .iter()
                    .map(|a| self.value(a, Position::Nested, None))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("{}({})", function.as_str(), arguments.join(", ")))
            }
        }
    }

    fn select_list(&mut self, select: &SelectList) -> Result<Vec<BoundSelect>, QueryError> {
        match select {
            SelectList::Star => Ok(self
                .schema
                .iter()
                .map(|column| BoundSelect {
                    sql: if column.column_type.is_double() {
                        double_case_expression(column.id)
                    } else {
                        column_name_for_id(column.id)
                    },
                    header: SelectColumn {
                        name: column.name.clone(),
                        column_type: Some(column.column_type),
                        id: Some(column.id),
                    },
                    maximum_size: column.maximum_size,
                })
                .collect()),
            SelectList::Columns(columns) => columns.iter().map(|c| self.derived(c)).collect(),
        }
    }

    fn derived(&mut self, column: &DerivedColumn) -> Result<BoundSelect, QueryError> {
        let sql = self.value(&column.expression, Position::Select, None)?;
        let (column_type, id, maximum_size) = self.select_type(&column.expression)?;
        Ok(BoundSelect {
            sql,
            header: SelectColumn {
                name: column.display_name(),
                column_type,
                id,
            },
            maximum_size,
        })
    }

    fn select_type(
        &self,
        expression: &ValueExpression,
    ) -> Result<(Option<ColumnType>, Option<i64>, Option<u32>), QueryError> {
        Ok(match expression {
            ValueExpression::Column(column) => {
                let resolved = self.resolve(&column.name)?;
                let id = match resolved {
                    Resolved::User(model) => Some(model.id),
                    Resolved::Reserved(_) => None,
                };
                (Some(resolved.column_type()), id, resolved.maximum_size())
            }
            ValueExpression::Aggregate {
                function, argument, ..
            } => match function {
                AggregateFunction::Count => (Some(ColumnType::Integer), None, None),
                AggregateFunction::Avg => (Some(ColumnType::Double), None, None),
                AggregateFunction::Min | AggregateFunction::Max | AggregateFunction::Sum => {
                    match argument.as_deref().and_then(ValueExpression::as_column) {
                        Some(column) => {
                            let resolved = self.resolve(&column.name)?;
                            (Some(resolved.column_type()), None, resolved.maximum_size())
                        }
                        None => (None, None, None),
                    }
                }
            },
            ValueExpression::Literal(_) | ValueExpression::Function { .. } => (None, None, None),
        })
    }

    /// GROUP BY and ORDER BY keys, which may also name a select alias.
    fn sort_key(&mut self, key: &ValueExpression) -> Result<String, QueryError> {
        if let Some(column) = key.as_column() {
            if let Some(aliased) = self.aliases.get(column.name.as_str()).copied() {
                return self.value(aliased, Position::Nested, None);
            }
        }
        self.value(key, Position::Nested, None)
    }

    /// Select items as arguments of `COUNT(DISTINCT ...)`.
    fn distinct_list(&mut self, select: &SelectList) -> Result<Vec<String>, QueryError> {
        match select {
            SelectList::Star => Ok(self
                .schema
                .iter()
                .map(|c| column_name_for_id(c.id))
                .collect()),
            SelectList::Columns(columns) => columns
                .iter()
                .map(|c| self.value(&c.expression, Position::Nested, None))
                .collect(),
        }
    }

    fn condition(&mut self, condition: &SearchCondition) -> Result<String, QueryError> {
        Ok(match condition {
            SearchCondition::Or(a, b) => format!("{} OR {}", self.condition(a)?, self.condition(b)?),
            SearchCondition::And(a, b) => {
                format!("{} AND {}", self.condition(a)?, self.condition(b)?)
            }
            SearchCondition::Not(inner) => format!("NOT {}", self.condition(inner)?),
            SearchCondition::Nested(inner) => format!("( {} )", self.condition(inner)?),
            SearchCondition::Predicate(predicate) => self.predicate(predicate)?,
        })
    }

    fn predicate(&mut self, predicate: &Predicate) -> Result<String, QueryError> {
        match predicate {
            Predicate::Comparison {
                left,
                operator,
                right,
            } => {
                if let Some(sql) = self.non_finite_comparison(left, *operator, right)? {
                    return Ok(sql);
                }
                let hint = self.column_type_of(left).or_else(|| self.column_type_of(right));
                let left = self.value(left, Position::Nested, hint)?;
                let right = self.value(right, Position::Nested, hint)?;
                Ok(format!("{left} {} {right}", operator.as_str()))
            }
            Predicate::Between {
                expression,
                not,
                low,
                high,
            } => {
                let hint = self.column_type_of(expression);
                let expression = self.value(expression, Position::Nested, hint)?;
                let low = self.value(low, Position::Nested, hint)?;
                let high = self.value(high, Position::Nested, hint)?;
                Ok(format!("{expression} {}BETWEEN {low} AND {high}", not_keyword(*not)))
            }
            Predicate::In {
                expression,
                not,
                values,
            } => {
                let hint = self.column_type_of(expression);
                let expression = self.value(expression, Position::Nested, hint)?;
                let values = values
                    .iter()
                    .map(|v| self.value(v, Position::Nested, hint))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!(
                    "{expression} {}IN ( {} )",
                    not_keyword(*not),
                    values.join(", ")
                ))
            }
            Predicate::Like {
                expression,
                not,
                pattern,
            } => {
                let expression = self.value(expression, Position::Nested, None)?;
                let pattern = self.value(pattern, Position::Nested, None)?;
                Ok(format!("{expression} {}LIKE {pattern}", not_keyword(*not)))
            }
            Predicate::Is {
                expression,
                not,
                value,
            } => {
                let expression = self.value(expression, Position::Nested, None)?;
                let value = match value {
                    TruthValue::Null => "NULL",
                    TruthValue::True => "TRUE",
                    TruthValue::False => "FALSE",
                };
                Ok(format!("{expression} IS {}{value}", not_keyword(*not)))
            }
        }
    }

    /// `dbl = 'NaN'` compares the sentinel column, since the primary column
    /// cannot hold non-finite values.
    fn non_finite_comparison(
        &mut self,
        left: &ValueExpression,
        operator: ComparisonOperator,
        right: &ValueExpression,
    ) -> Result<Option<String>, QueryError> {
        if !matches!(operator, ComparisonOperator::Eq | ComparisonOperator::Ne) {
            return Ok(None);
        }
        let (Some(column), ValueExpression::Literal(literal)) = (left.as_column(), right) else {
            return Ok(None);
        };
        let Resolved::User(model) = self.resolve(&column.name)? else {
            return Ok(None);
        };
        if !model.column_type.is_double() {
            return Ok(None);
        }
        let Some(sentinel) = literal.text().as_deref().and_then(AbstractDouble::lookup) else {
            return Ok(None);
        };
        let placeholder = self.bind_parameter(DbValue::String(sentinel.enum_value().to_string()));
        Ok(Some(format!(
            "{} {} {placeholder}",
            double_column_name(model.id),
            operator.as_str()
        )))
    }
}

fn untyped_number(text: &str) -> DbValue {
    if let Ok(value) = text.parse::<i64>() {
        DbValue::Long(value)
    } else if let Ok(value) = text.parse::<f64>() {
        DbValue::Double(value)
    } else {
        DbValue::String(text.to_string())
    }
}

fn not_keyword(not: bool) -> &'static str {
    if not {
        "NOT "
    } else {
        ""
    }
}
