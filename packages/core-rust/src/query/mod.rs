//! Restricted SQL dialect: lexing, parsing, binding to a table schema, and
//! the rewrites applied before execution (sorting, row filtering, facets).

pub mod ast;
pub mod bind;
pub mod facet;
pub mod lexer;
pub mod page_token;
pub mod params;
pub mod parser;
pub mod token;

pub use ast::{QuerySpecification, SearchCondition, SortDirection};
pub use bind::{SortItem, SqlQuery};
pub use facet::{
    concat_facet_search_conditions, validate_facet_list, FacetColumnRequest, FacetRange,
    ValidatedFacetColumn,
};
pub use page_token::{Query, TokenError};
pub use params::expand_named_parameters;
pub use parser::{parse_query, parse_search_condition};

/// Failures while compiling a query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// Malformed SQL or a reference to an unknown table or column.
    #[error("{0}")]
    InvalidQuery(String),
    /// A request parameter is malformed.
    #[error("{0}")]
    InvalidArgument(String),
    /// The query can only return zero rows; not a caller error.
    #[error("{message}")]
    EmptyResult { table_id: i64, message: String },
}

impl QueryError {
    #[must_use]
    pub fn empty_result(table_id: i64, message: impl Into<String>) -> Self {
        QueryError::EmptyResult {
            table_id,
            message: message.into(),
        }
    }
}
