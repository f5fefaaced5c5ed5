//! Opaque continuation tokens for paginated queries.
//!
//! A token is the JSON form of [`Query`] encoded with URL-safe base64, so
//! callers can pass it back verbatim in a URL or request body.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::bind::SortItem;
use super::facet::FacetColumnRequest;

/// Everything needed to run a query again from a later offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default = "default_consistent")]
    pub is_consistent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_facets: Option<Vec<FacetColumnRequest>>,
}

fn default_consistent() -> bool {
    true
}

impl Query {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            is_consistent: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("Next page token cannot be empty")]
    Empty,
    #[error("Invalid next page token: {0}")]
    Invalid(String),
    #[error("Failed to encode next page token: {0}")]
    Encode(String),
}

/// Encodes `query` as an opaque token.
///
/// # Errors
///
/// Returns [`TokenError::Encode`] if the query cannot be serialized.
pub fn encode(query: &Query) -> Result<String, TokenError> {
    let json = serde_json::to_vec(query).map_err(|e| TokenError::Encode(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decodes a token produced by [`encode`].
///
/// # Errors
///
/// Returns [`TokenError::Empty`] for a blank token and
/// [`TokenError::Invalid`] for anything that does not decode to a query.
pub fn decode(token: &str) -> Result<Query, TokenError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| TokenError::Invalid(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| TokenError::Invalid(e.to_string()))
}

/// Token for the page after the current one.
///
/// # Errors
///
/// Returns [`TokenError::Encode`] if the query cannot be serialized.
pub fn next_page_token(
    sql: &str,
    sort: Option<Vec<SortItem>>,
    next_offset: u64,
    limit: Option<u64>,
    is_consistent: bool,
    selected_facets: Option<Vec<FacetColumnRequest>>,
) -> Result<String, TokenError> {
    encode(&Query {
        sql: sql.to_string(),
        sort,
        offset: Some(next_offset),
        limit,
        is_consistent,
        selected_facets,
    })
}
