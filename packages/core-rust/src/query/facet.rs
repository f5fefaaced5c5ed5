//! Facet selection: which faceted columns take part in a request, and the
//! search condition each caller selection contributes.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::ast::{ComparisonOperator, Predicate, SearchCondition, ValueExpression};
use super::QueryError;
use crate::types::{ColumnModel, FacetType};

/// Inclusive bounds chosen for a range facet. Either side may be open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

/// Caller selection on one faceted column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetColumnRequest {
    pub column_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet_values: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet_range: Option<FacetRange>,
}

impl FacetColumnRequest {
    #[must_use]
    pub fn values<I, S>(column_name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            column_name: column_name.into(),
            facet_values: Some(values.into_iter().map(Into::into).collect()),
            facet_range: None,
        }
    }

    #[must_use]
    pub fn range(column_name: impl Into<String>, min: Option<&str>, max: Option<&str>) -> Self {
        Self {
            column_name: column_name.into(),
            facet_values: None,
            facet_range: Some(FacetRange {
                min: min.map(str::to_string),
                max: max.map(str::to_string),
            }),
        }
    }
}

/// A faceted schema column that takes part in the request.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedFacetColumn {
    pub column_name: String,
    pub facet_type: FacetType,
    pub facet_values: Option<BTreeSet<String>>,
    pub facet_range: Option<FacetRange>,
    /// Filter contributed by the caller's selection, if any.
    pub search_condition: Option<SearchCondition>,
}

impl ValidatedFacetColumn {
    #[must_use]
    pub fn new(
        column_name: impl Into<String>,
        facet_type: FacetType,
        facet_values: Option<BTreeSet<String>>,
        facet_range: Option<FacetRange>,
    ) -> Self {
        let column_name = column_name.into();
        let search_condition = match facet_type {
            FacetType::Enumeration => facet_values
                .as_ref()
                .and_then(|values| enumeration_condition(&column_name, values)),
            FacetType::Range => facet_range
                .as_ref()
                .and_then(|range| range_condition(&column_name, range)),
        };
        Self {
            column_name,
            facet_type,
            facet_values,
            facet_range,
            search_condition,
        }
    }
}

/// `(col = 'a' OR col = 'b')`; `None` when no values were selected.
fn enumeration_condition(column_name: &str, values: &BTreeSet<String>) -> Option<SearchCondition> {
    let equalities = values
        .iter()
        .map(|value| {
            SearchCondition::Predicate(Predicate::Comparison {
                left: ValueExpression::column(column_name),
                operator: ComparisonOperator::Eq,
                right: ValueExpression::string(value.clone()),
            })
        })
        .collect();
    SearchCondition::any_of(equalities).map(SearchCondition::nested)
}

fn range_condition(column_name: &str, range: &FacetRange) -> Option<SearchCondition> {
    let column = ValueExpression::column(column_name);
    let predicate = match (&range.min, &range.max) {
        (Some(min), Some(max)) => Predicate::Between {
            expression: column,
            not: false,
            low: ValueExpression::string(min.clone()),
            high: ValueExpression::string(max.clone()),
        },
        (Some(min), None) => Predicate::Comparison {
            left: column,
            operator: ComparisonOperator::Ge,
            right: ValueExpression::string(min.clone()),
        },
        (None, Some(max)) => Predicate::Comparison {
            left: column,
            operator: ComparisonOperator::Le,
            right: ValueExpression::string(max.clone()),
        },
        (None, None) => return None,
    };
    Some(SearchCondition::Predicate(predicate))
}

/// Selects the faceted schema columns that take part in a request.
///
/// A faceted column is kept when facets are returned or when the caller
/// selected values on it. Selections on unknown or non-faceted columns are
/// ignored.
///
/// # Errors
///
/// Returns [`QueryError::InvalidArgument`] when two selections name the same
/// column.
pub fn validate_facet_list(
    selected: Option<&[FacetColumnRequest]>,
    schema: &[ColumnModel],
    return_facets: bool,
) -> Result<Vec<ValidatedFacetColumn>, QueryError> {
    let mut by_name: HashMap<&str, &FacetColumnRequest> = HashMap::new();
    for request in selected.unwrap_or_default() {
        if by_name.insert(&request.column_name, request).is_some() {
            return Err(QueryError::InvalidArgument(
                "Request contains QueryRequestFacetColumn with a duplicate column name".to_string(),
            ));
        }
    }

    let mut validated = Vec::new();
    for column in schema {
        let Some(facet_type) = column.facet_type else {
            continue;
        };
        let request = by_name.get(column.name.as_str());
        if !return_facets && request.is_none() {
            continue;
        }
        validated.push(ValidatedFacetColumn::new(
            column.name.clone(),
            facet_type,
            request.and_then(|r| r.facet_values.clone()),
            request.and_then(|r| r.facet_range.clone()),
        ));
    }
    Ok(validated)
}

/// `AND`-joins every facet filter, each wrapped in parentheses, skipping
/// `ignored_column`. `None` when nothing remains.
#[must_use]
pub fn concat_facet_search_conditions(
    facets: &[ValidatedFacetColumn],
    ignored_column: Option<&str>,
) -> Option<SearchCondition> {
    let conditions = facets
        .iter()
        .filter(|facet| Some(facet.column_name.as_str()) != ignored_column)
        .filter_map(|facet| facet.search_condition.clone())
        .map(SearchCondition::nested)
        .collect();
    SearchCondition::all_of(conditions).map(SearchCondition::nested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnType;

    fn schema() -> Vec<ColumnModel> {
        vec![
            ColumnModel::new(1, "species", ColumnType::String).with_facet_type(FacetType::Enumeration),
            ColumnModel::new(2, "age", ColumnType::Integer).with_facet_type(FacetType::Range),
            ColumnModel::new(3, "notes", ColumnType::String),
        ]
    }

    #[test]
    fn enumeration_condition_quotes_values() {
        let facet = ValidatedFacetColumn::new(
            "species",
            FacetType::Enumeration,
            Some(["cat".to_string(), "it's".to_string()].into()),
            None,
        );
        assert_eq!(
            facet.search_condition.unwrap().to_string(),
            "( species = 'cat' OR species = 'it''s' )"
        );
    }

    #[test]
    fn empty_enumeration_has_no_condition() {
        let facet =
            ValidatedFacetColumn::new("species", FacetType::Enumeration, Some(BTreeSet::new()), None);
        assert!(facet.search_condition.is_none());
    }

    #[test]
    fn range_conditions() {
        let both = ValidatedFacetColumn::new(
            "age",
            FacetType::Range,
            None,
            FacetColumnRequest::range("age", Some("1"), Some("5")).facet_range,
        );
        assert_eq!(both.search_condition.unwrap().to_string(), "age BETWEEN '1' AND '5'");

        let min = FacetColumnRequest::range("age", Some("1"), None);
        let min = ValidatedFacetColumn::new("age", FacetType::Range, None, min.facet_range);
        assert_eq!(min.search_condition.unwrap().to_string(), "age >= '1'");

        let max = FacetColumnRequest::range("age", None, Some("9"));
        let max = ValidatedFacetColumn::new("age", FacetType::Range, None, max.facet_range);
        assert_eq!(max.search_condition.unwrap().to_string(), "age <= '9'");

        let open = ValidatedFacetColumn::new("age", FacetType::Range, None, Some(FacetRange::default()));
        assert!(open.search_condition.is_none());
    }

    #[test]
    fn duplicate_selection_is_rejected() {
        let selected = vec![
            FacetColumnRequest::values("species", ["cat"]),
            FacetColumnRequest::values("species", ["dog"]),
        ];
        let err = validate_facet_list(Some(&selected), &schema(), true).unwrap_err();
        assert_eq!(
            err,
            QueryError::InvalidArgument(
                "Request contains QueryRequestFacetColumn with a duplicate column name".to_string()
            )
        );
    }

    #[test]
    fn return_facets_keeps_every_faceted_column() {
        let validated = validate_facet_list(None, &schema(), true).unwrap();
        let names: Vec<_> = validated.iter().map(|f| f.column_name.as_str()).collect();
        assert_eq!(names, vec!["species", "age"]);
        assert!(validated.iter().all(|f| f.search_condition.is_none()));
    }

    #[test]
    fn without_return_facets_only_selected_columns_are_kept() {
        let selected = vec![
            FacetColumnRequest::values("species", ["cat"]),
            FacetColumnRequest::values("notes", ["ignored"]),
        ];
        let validated = validate_facet_list(Some(&selected), &schema(), false).unwrap();
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].column_name, "species");
        assert!(validated[0].search_condition.is_some());
    }

    #[test]
    fn concat_skips_ignored_column() {
        let facets = vec![
            ValidatedFacetColumn::new(
                "species",
                FacetType::Enumeration,
                Some(["cat".to_string()].into()),
                None,
            ),
            ValidatedFacetColumn::new(
                "age",
                FacetType::Range,
                None,
                Some(FacetRange {
                    min: Some("2".to_string()),
                    max: None,
                }),
            ),
        ];
        assert_eq!(
            concat_facet_search_conditions(&facets, None).unwrap().to_string(),
            "( ( ( species = 'cat' ) ) AND ( age >= '2' ) )"
        );
        assert_eq!(
            concat_facet_search_conditions(&facets, Some("species"))
                .unwrap()
                .to_string(),
            "( ( age >= '2' ) )"
        );
        assert!(concat_facet_search_conditions(&facets[..1], Some("species")).is_none());
    }
}
