//! Column model and table metadata types shared by every layer.
//!
//! A [`ColumnModel`] is immutable once a physical column refers to it: a
//! schema edit is expressed as `(old, new)` pairs, never by mutating a model
//! in place.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default `maximum_size` for string columns that do not declare one.
pub const DEFAULT_MAX_STRING_SIZE: u32 = 50;

/// Declared type of a user-defined column.
///
/// Variant order is significant: it matches the order used when generating
/// one column of every type (annotation aliases `A0..A9` follow it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    String,
    Double,
    Integer,
    Boolean,
    Date,
    #[serde(rename = "FILEHANDLEID")]
    FileHandleId,
    #[serde(rename = "ENTITYID")]
    EntityId,
    Link,
    #[serde(rename = "LARGETEXT")]
    LargeText,
    #[serde(rename = "USERID")]
    UserId,
}

impl ColumnType {
    /// Every declared type, in declaration order.
    pub const ALL: [ColumnType; 10] = [
        ColumnType::String,
        ColumnType::Double,
        ColumnType::Integer,
        ColumnType::Boolean,
        ColumnType::Date,
        ColumnType::FileHandleId,
        ColumnType::EntityId,
        ColumnType::Link,
        ColumnType::LargeText,
        ColumnType::UserId,
    ];

    /// Upper-case name, as written into the physical column comment.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ColumnType::String => "STRING",
            ColumnType::Double => "DOUBLE",
            ColumnType::Integer => "INTEGER",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::FileHandleId => "FILEHANDLEID",
            ColumnType::EntityId => "ENTITYID",
            ColumnType::Link => "LINK",
            ColumnType::LargeText => "LARGETEXT",
            ColumnType::UserId => "USERID",
        }
    }

    /// Case-insensitive inverse of [`ColumnType::name`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Doubles carry a companion column for non-finite values.
    #[must_use]
    pub fn is_double(self) -> bool {
        matches!(self, ColumnType::Double)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a column participates in faceted search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacetType {
    /// Discrete value counts.
    Enumeration,
    /// Min/max bounds supplied by the caller.
    Range,
}

/// A user-defined column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnModel {
    /// Stable numeric identity. Physical names are derived from it.
    pub id: i64,
    /// User-facing name, referenced from queries.
    pub name: String,
    pub column_type: ColumnType,
    /// Maximum number of characters for variable-length types.
    pub maximum_size: Option<u32>,
    pub default_value: Option<String>,
    pub facet_type: Option<FacetType>,
}

impl ColumnModel {
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            id,
            name: name.into(),
            column_type,
            maximum_size: None,
            default_value: None,
            facet_type: None,
        }
    }

    #[must_use]
    pub fn with_maximum_size(mut self, size: u32) -> Self {
        self.maximum_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_facet_type(mut self, facet_type: FacetType) -> Self {
        self.facet_type = Some(facet_type);
        self
    }

    /// Size used for `VARCHAR(n)`, falling back to [`DEFAULT_MAX_STRING_SIZE`].
    #[must_use]
    pub fn effective_maximum_size(&self) -> u32 {
        self.maximum_size.unwrap_or(DEFAULT_MAX_STRING_SIZE)
    }
}

/// Kind of object backing a table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
    /// A plain table whose rows come from an append-only change log.
    Table,
    /// A view materialized from entity replication.
    EntityView,
}

impl ObjectType {
    #[must_use]
    pub fn is_view(self) -> bool {
        matches!(self, ObjectType::EntityView)
    }
}

/// One entity subtype that a view may include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityTypeTag {
    File,
    Table,
    Project,
}

impl EntityTypeTag {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            EntityTypeTag::File => "file",
            EntityTypeTag::Table => "table",
            EntityTypeTag::Project => "project",
        }
    }

    const fn bit(self) -> u8 {
        match self {
            EntityTypeTag::File => 0x01,
            EntityTypeTag::Project => 0x02,
            EntityTypeTag::Table => 0x04,
        }
    }
}

/// Set of entity subtypes that populate a view, stored as a bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewTypeMask(u8);

impl ViewTypeMask {
    pub const FILE: ViewTypeMask = ViewTypeMask(EntityTypeTag::File.bit());
    pub const PROJECT: ViewTypeMask = ViewTypeMask(EntityTypeTag::Project.bit());
    pub const FILE_AND_TABLE: ViewTypeMask =
        ViewTypeMask(EntityTypeTag::File.bit() | EntityTypeTag::Table.bit());

    /// Builds a mask from its tags. Returns `None` for an empty set.
    #[must_use]
    pub fn from_tags(tags: &[EntityTypeTag]) -> Option<Self> {
        let bits = tags.iter().fold(0u8, |acc, t| acc | t.bit());
        (bits != 0).then_some(ViewTypeMask(bits))
    }

    /// Restores a mask from its persisted form.
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        let known = EntityTypeTag::File.bit() | EntityTypeTag::Project.bit() | EntityTypeTag::Table.bit();
        (bits != 0 && bits & !known == 0).then_some(ViewTypeMask(bits))
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Tags in the mask, in a stable order (`file`, `table`, `project`).
    #[must_use]
    pub fn tags(self) -> Vec<EntityTypeTag> {
        [EntityTypeTag::File, EntityTypeTag::Table, EntityTypeTag::Project]
            .into_iter()
            .filter(|t| self.0 & t.bit() != 0)
            .collect()
    }

    /// Project views scope on the entity's own id rather than its parent.
    #[must_use]
    pub fn is_project(self) -> bool {
        self == Self::PROJECT
    }
}

/// Processing state of a table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableState {
    Available,
    Processing,
    ProcessingFailed,
}

impl TableState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            TableState::Available => "AVAILABLE",
            TableState::Processing => "PROCESSING",
            TableState::ProcessingFailed => "PROCESSING_FAILED",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AVAILABLE" => Some(TableState::Available),
            "PROCESSING" => Some(TableState::Processing),
            "PROCESSING_FAILED" => Some(TableState::ProcessingFailed),
            _ => None,
        }
    }
}

impl fmt::Display for TableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Persisted status of one table index.
///
/// Only the processing attempt holding `reset_token` may move the status to
/// `Available` or `ProcessingFailed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStatus {
    pub table_id: i64,
    pub state: TableState,
    pub reset_token: String,
    /// Milliseconds since the Unix epoch.
    pub started_on: u64,
    /// Milliseconds since the Unix epoch.
    pub changed_on: u64,
    pub last_table_change_etag: Option<String>,
    pub progress_message: Option<String>,
    pub progress_current: Option<u64>,
    pub progress_total: Option<u64>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    /// Wall time of the last completed build, in milliseconds.
    pub total_time_ms: Option<u64>,
}

impl TableStatus {
    /// A freshly reset `Processing` status.
    #[must_use]
    pub fn processing(table_id: i64, reset_token: String, now: u64) -> Self {
        Self {
            table_id,
            state: TableState::Processing,
            reset_token,
            started_on: now,
            changed_on: now,
            last_table_change_etag: None,
            progress_message: None,
            progress_current: None,
            progress_total: None,
            error_message: None,
            error_details: None,
            total_time_ms: None,
        }
    }
}

/// Header describing one column of a query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectColumn {
    pub name: String,
    /// `None` for computed expressions with no declared type.
    pub column_type: Option<ColumnType>,
    /// Id of the referenced column when the select item is a bare column.
    pub id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_type_names_round_trip() {
        for t in ColumnType::ALL {
            assert_eq!(ColumnType::from_name(t.name()), Some(t));
        }
        assert_eq!(ColumnType::from_name("entityid"), Some(ColumnType::EntityId));
        assert_eq!(ColumnType::from_name("nope"), None);
    }

    #[test]
    fn column_type_serde_uses_upper_case_names() {
        let json = serde_json::to_string(&ColumnType::FileHandleId).unwrap();
        assert_eq!(json, "\"FILEHANDLEID\"");
        let back: ColumnType = serde_json::from_str("\"LARGETEXT\"").unwrap();
        assert_eq!(back, ColumnType::LargeText);
    }

    #[test]
    fn view_type_tags_are_ordered() {
        assert_eq!(
            ViewTypeMask::FILE_AND_TABLE.tags(),
            vec![EntityTypeTag::File, EntityTypeTag::Table]
        );
        assert_eq!(ViewTypeMask::PROJECT.tags(), vec![EntityTypeTag::Project]);
        assert!(ViewTypeMask::PROJECT.is_project());
        assert!(!ViewTypeMask::FILE.is_project());
    }

    #[test]
    fn view_type_from_bits_rejects_unknown() {
        assert_eq!(ViewTypeMask::from_bits(0), None);
        assert_eq!(ViewTypeMask::from_bits(0x80), None);
        assert_eq!(ViewTypeMask::from_bits(0x05), Some(ViewTypeMask::FILE_AND_TABLE));
        assert_eq!(ViewTypeMask::from_tags(&[]), None);
    }

    #[test]
    fn table_state_names_round_trip() {
        for s in [
            TableState::Available,
            TableState::Processing,
            TableState::ProcessingFailed,
        ] {
            assert_eq!(TableState::from_name(s.name()), Some(s));
        }
    }

    #[test]
    fn effective_size_defaults() {
        let cm = ColumnModel::new(1, "a", ColumnType::String);
        assert_eq!(cm.effective_maximum_size(), DEFAULT_MAX_STRING_SIZE);
        assert_eq!(cm.with_maximum_size(15).effective_maximum_size(), 15);
    }
}
