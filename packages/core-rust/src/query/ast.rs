//! Statement tree of the restricted SQL dialect.
//!
//! Every node renders back to SQL through [`fmt::Display`]; re-parsing the
//! rendered text yields an equal tree.

use std::fmt;

use super::token::Keyword;
use crate::codec::quote_string;

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpecification {
    pub distinct: bool,
    pub select_list: SelectList,
    pub table_name: String,
    pub where_clause: Option<SearchCondition>,
    pub group_by: Vec<ColumnReference>,
    pub order_by: Vec<SortSpecification>,
    pub pagination: Option<Pagination>,
}

impl QuerySpecification {
    /// Whether rows are grouped or aggregated, in which case they carry no
    /// row id or version.
    #[must_use]
    pub fn is_aggregated(&self) -> bool {
        self.distinct || !self.group_by.is_empty() || self.has_aggregate_function()
    }

    /// Aggregated without `GROUP BY` or `DISTINCT`: always one row.
    #[must_use]
    pub fn is_simple_aggregate(&self) -> bool {
        !self.distinct && self.group_by.is_empty() && self.has_aggregate_function()
    }

    fn has_aggregate_function(&self) -> bool {
        match &self.select_list {
            SelectList::Star => false,
            SelectList::Columns(columns) => columns.iter().any(|c| c.expression.has_aggregate()),
        }
    }

    /// Copy with `where_clause` replaced.
    #[must_use]
    pub fn with_where(&self, where_clause: Option<SearchCondition>) -> Self {
        Self {
            where_clause,
            ..self.clone()
        }
    }

    /// `(<where>) AND <condition>`, or just the condition without a where.
    #[must_use]
    pub fn with_appended_condition(&self, condition: SearchCondition) -> Self {
        let combined = match &self.where_clause {
            Some(existing) => SearchCondition::And(
                Box::new(SearchCondition::Nested(Box::new(existing.clone()))),
                Box::new(condition),
            ),
            None => condition,
        };
        self.with_where(Some(combined))
    }
}

impl fmt::Display for QuerySpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        if self.distinct {
            f.write_str("DISTINCT ")?;
        }
        write!(f, "{} FROM {}", self.select_list, self.table_name)?;
        if let Some(condition) = &self.where_clause {
            write!(f, " WHERE {condition}")?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", join(&self.group_by))?;
        }
        if !self.order_by.is_empty() {
            write!(f, " ORDER BY {}", join(&self.order_by))?;
        }
        if let Some(pagination) = &self.pagination {
            write!(f, " {pagination}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectList {
    Star,
    Columns(Vec<DerivedColumn>),
}

impl fmt::Display for SelectList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectList::Star => f.write_str("*"),
            SelectList::Columns(columns) => f.write_str(&join(columns)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedColumn {
    pub expression: ValueExpression,
    pub alias: Option<String>,
}

impl DerivedColumn {
    /// Header name: the alias, or the expression as written.
    #[must_use]
    pub fn display_name(&self) -> String {
        match (&self.alias, &self.expression) {
            (Some(alias), _) => alias.clone(),
            (None, ValueExpression::Column(column)) => column.name.clone(),
            (None, expression) => expression.to_string(),
        }
    }
}

impl fmt::Display for DerivedColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {}", Identifier(alias))?;
        }
        Ok(())
    }
}

/// Reference to a column by its user-facing name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnReference {
    pub name: String,
}

impl ColumnReference {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for ColumnReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Identifier(&self.name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Count,
    Min,
    Max,
    Sum,
    Avg,
}

impl AggregateFunction {
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateFunction::Count),
            "MIN" => Some(AggregateFunction::Min),
            "MAX" => Some(AggregateFunction::Max),
            "SUM" => Some(AggregateFunction::Sum),
            "AVG" => Some(AggregateFunction::Avg),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
        }
    }
}

/// Whitelisted scalar functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarFunction {
    CurrentTimestamp,
    CurrentDate,
    CurrentTime,
    Now,
    UnixTimestamp,
    FromUnixtime,
    Concat,
    Replace,
    Upper,
    Lower,
    Trim,
}

impl ScalarFunction {
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        let function = match name.to_ascii_uppercase().as_str() {
            "CURRENT_TIMESTAMP" => ScalarFunction::CurrentTimestamp,
            "CURRENT_DATE" => ScalarFunction::CurrentDate,
            "CURRENT_TIME" => ScalarFunction::CurrentTime,
            "NOW" => ScalarFunction::Now,
            "UNIX_TIMESTAMP" => ScalarFunction::UnixTimestamp,
            "FROM_UNIXTIME" => ScalarFunction::FromUnixtime,
            "CONCAT" => ScalarFunction::Concat,
            "REPLACE" => ScalarFunction::Replace,
            "UPPER" => ScalarFunction::Upper,
            "LOWER" => ScalarFunction::Lower,
            "TRIM" => ScalarFunction::Trim,
            _ => return None,
        };
        Some(function)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ScalarFunction::CurrentTimestamp => "CURRENT_TIMESTAMP",
            ScalarFunction::CurrentDate => "CURRENT_DATE",
            ScalarFunction::CurrentTime => "CURRENT_TIME",
            ScalarFunction::Now => "NOW",
            ScalarFunction::UnixTimestamp => "UNIX_TIMESTAMP",
            ScalarFunction::FromUnixtime => "FROM_UNIXTIME",
            ScalarFunction::Concat => "CONCAT",
            ScalarFunction::Replace => "REPLACE",
            ScalarFunction::Upper => "UPPER",
            ScalarFunction::Lower => "LOWER",
            ScalarFunction::Trim => "TRIM",
        }
    }

    /// The date-time constants may be written without parentheses.
    #[must_use]
    pub fn allows_bare_form(self) -> bool {
        matches!(
            self,
            ScalarFunction::CurrentTimestamp
                | ScalarFunction::CurrentDate
                | ScalarFunction::CurrentTime
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    /// Numeric literal as written, sign included.
    Number(String),
    Null,
    Boolean(bool),
}

impl Literal {
    /// Literal text as a source value for the codec.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        match self {
            Literal::String(s) | Literal::Number(s) => Some(s.clone()),
            Literal::Boolean(b) => Some(b.to_string()),
            Literal::Null => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => f.write_str(&quote_string(s)),
            Literal::Number(n) => f.write_str(n),
            Literal::Null => f.write_str("NULL"),
            Literal::Boolean(true) => f.write_str("TRUE"),
            Literal::Boolean(false) => f.write_str("FALSE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpression {
    Column(ColumnReference),
    Literal(Literal),
    /// `argument` is `None` only for `COUNT(*)`.
    Aggregate {
        function: AggregateFunction,
        distinct: bool,
        argument: Option<Box<ValueExpression>>,
    },
    Function {
        function: ScalarFunction,
        arguments: Vec<ValueExpression>,
        bare: bool,
    },
}

impl ValueExpression {
    #[must_use]
    pub fn column(name: impl Into<String>) -> Self {
        ValueExpression::Column(ColumnReference::new(name))
    }

    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        ValueExpression::Literal(Literal::String(value.into()))
    }

    #[must_use]
    pub fn has_aggregate(&self) -> bool {
        match self {
            ValueExpression::Aggregate { .. } => true,
            ValueExpression::Function { arguments, .. } => {
                arguments.iter().any(ValueExpression::has_aggregate)
            }
            ValueExpression::Column(_) | ValueExpression::Literal(_) => false,
        }
    }

    /// Column named directly by this expression, if any.
    #[must_use]
    pub fn as_column(&self) -> Option<&ColumnReference> {
        match self {
            ValueExpression::Column(column) => Some(column),
            _ => None,
        }
    }
}

impl fmt::Display for ValueExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueExpression::Column(column) => write!(f, "{column}"),
            ValueExpression::Literal(literal) => write!(f, "{literal}"),
            ValueExpression::Aggregate {
                function,
                distinct,
                argument,
            } => {
                write!(f, "{}(", function.as_str())?;
                if *distinct {
                    f.write_str("DISTINCT ")?;
                }
                match argument {
                    Some(argument) => write!(f, "{argument})"),
                    None => f.write_str("*)"),
                }
            }
            ValueExpression::Function {
                function,
                arguments,
                bare,
            } => {
                if *bare {
                    f.write_str(function.as_str())
                } else {
                    write!(f, "{}({})", function.as_str(), join(arguments))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl ComparisonOperator {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "=",
            ComparisonOperator::Ne => "<>",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Le => "<=",
            ComparisonOperator::Ge => ">=",
        }
    }
}

/// Right-hand side of `IS [NOT]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TruthValue {
    Null,
    True,
    False,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Comparison {
        left: ValueExpression,
        operator: ComparisonOperator,
        right: ValueExpression,
    },
    Between {
        expression: ValueExpression,
        not: bool,
        low: ValueExpression,
        high: ValueExpression,
    },
    In {
        expression: ValueExpression,
        not: bool,
        values: Vec<ValueExpression>,
    },
    Like {
        expression: ValueExpression,
        not: bool,
        pattern: ValueExpression,
    },
    Is {
        expression: ValueExpression,
        not: bool,
        value: TruthValue,
    },
}

fn not_keyword(not: bool) -> &'static str {
    if not {
        "NOT "
    } else {
        ""
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Comparison {
                left,
                operator,
                right,
            } => write!(f, "{left} {} {right}", operator.as_str()),
            Predicate::Between {
                expression,
                not,
                low,
                high,
            } => write!(f, "{expression} {}BETWEEN {low} AND {high}", not_keyword(*not)),
            Predicate::In {
                expression,
                not,
                values,
            } => write!(f, "{expression} {}IN ( {} )", not_keyword(*not), join(values)),
            Predicate::Like {
                expression,
                not,
                pattern,
            } => write!(f, "{expression} {}LIKE {pattern}", not_keyword(*not)),
            Predicate::Is {
                expression,
                not,
                value,
            } => {
                let value = match value {
                    TruthValue::Null => "NULL",
                    TruthValue::True => "TRUE",
                    TruthValue::False => "FALSE",
                };
                write!(f, "{expression} IS {}{value}", not_keyword(*not))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchCondition {
    Or(Box<SearchCondition>, Box<SearchCondition>),
    And(Box<SearchCondition>, Box<SearchCondition>),
    Not(Box<SearchCondition>),
    Nested(Box<SearchCondition>),
    Predicate(Predicate),
}

impl SearchCondition {
    /// Joins conditions with `OR`; `None` for an empty list.
    #[must_use]
    pub fn any_of(conditions: Vec<SearchCondition>) -> Option<SearchCondition> {
        conditions
            .into_iter()
            .reduce(|a, b| SearchCondition::Or(Box::new(a), Box::new(b)))
    }

    /// Joins conditions with `AND`; `None` for an empty list.
    #[must_use]
    pub fn all_of(conditions: Vec<SearchCondition>) -> Option<SearchCondition> {
        conditions
            .into_iter()
            .reduce(|a, b| SearchCondition::And(Box::new(a), Box::new(b)))
    }

    #[must_use]
    pub fn nested(self) -> SearchCondition {
        SearchCondition::Nested(Box::new(self))
    }
}

impl fmt::Display for SearchCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchCondition::Or(a, b) => write!(f, "{a} OR {b}"),
            SearchCondition::And(a, b) => write!(f, "{a} AND {b}"),
            SearchCondition::Not(inner) => write!(f, "NOT {inner}"),
            SearchCondition::Nested(inner) => write!(f, "( {inner} )"),
            SearchCondition::Predicate(p) => write!(f, "{p}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpecification {
    pub key: ValueExpression,
    pub direction: Option<SortDirection>,
}

impl fmt::Display for SortSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if let Some(direction) = self.direction {
            write!(f, " {}", direction.as_str())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pagination {
    pub limit: u64,
    pub offset: Option<u64>,
}

impl fmt::Display for Pagination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LIMIT {}", self.limit)?;
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {offset}")?;
        }
        Ok(())
    }
}

/// Renders a name bare when the lexer would read it back as the same
/// identifier, double-quoted otherwise.
struct Identifier<'a>(&'a str);

impl fmt::Display for Identifier<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.0;
        let mut chars = name.chars();
        let bare = chars
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_')
            && chars.all(|c| c.is_alphanumeric() || c == '_')
            && Keyword::lookup(name).is_none()
            && !matches!(ScalarFunction::lookup(name), Some(func) if func.allows_bare_form());
        if bare {
            f.write_str(name)
        } else {
            write!(f, "\"{}\"", name.replace('"', "\"\""))
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
