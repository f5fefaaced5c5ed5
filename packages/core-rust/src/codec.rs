//! Value codec: coerces string-encoded source values into physical column
//! values, one handler per [`ColumnType`].
//!
//! The same [`ColumnTypeInfo`] table drives the write path (`encode`), the
//! read path (`decode_from_db`) and column DDL, so the three can never
//! disagree about how a type is stored.
//!
//! Doubles need special care: the physical `DOUBLE` column cannot hold
//! `NaN` or infinities, so those are written as a sentinel into a companion
//! `ENUM` column while the primary column receives an approximation (or
//! null for `NaN`).

use chrono::{NaiveDate, NaiveDateTime};

use crate::types::{ColumnModel, ColumnType};

/// Upper bound on characters stored by a `LARGETEXT` column.
pub const LARGE_TEXT_MAX_CHARACTERS: u32 = 1000;

/// Worst-case bytes per character in the `utf8` character set.
pub const MAX_BYTES_PER_CHAR: u32 = 3;

/// Value bound into a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Long(i64),
    Double(f64),
    Bool(bool),
    String(String),
    /// Expanded into one placeholder per element (`IN (:ids)`).
    LongList(Vec<i64>),
}

impl DbValue {
    /// Renders the value as an inline SQL literal (used for `DEFAULT`).
    #[must_use]
    pub fn to_sql_literal(&self) -> String {
        match self {
            DbValue::Null => "NULL".to_string(),
            DbValue::Long(v) => v.to_string(),
            DbValue::Double(v) => v.to_string(),
            DbValue::Bool(v) => v.to_string(),
            DbValue::String(v) => quote_string(v),
            DbValue::LongList(values) => values
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }
}

/// Quotes a string as a SQL literal, doubling embedded single quotes.
#[must_use]
pub fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Errors raised while coercing a source value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("'{value}' is not a valid {column_type} value")]
    Unparsable { column_type: ColumnType, value: String },
    #[error("Value at column '{column}' is not a valid {column_type}: '{value}'")]
    InvalidColumnValue {
        column: String,
        column_type: ColumnType,
        value: String,
    },
    #[error("Value at column '{column}' exceeds the maximum size of {maximum_size} characters")]
    ValueTooLarge { column: String, maximum_size: u32 },
}

// ---------------------------------------------------------------------------
// Non-finite doubles
// ---------------------------------------------------------------------------

/// Non-finite double values, stored as a sentinel in the companion column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractDouble {
    NaN,
    PositiveInfinity,
    NegativeInfinity,
}

impl AbstractDouble {
    /// Sentinels accepted by the companion `ENUM` column.
    pub const ENUM_VALUES: [&'static str; 3] = ["NaN", "Infinity", "-Infinity"];

    /// Case-insensitive lookup of a textual non-finite value.
    #[must_use]
    pub fn lookup(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nan" => Some(AbstractDouble::NaN),
            "infinity" | "+infinity" | "inf" | "+inf" => Some(AbstractDouble::PositiveInfinity),
            "-infinity" | "-inf" => Some(AbstractDouble::NegativeInfinity),
            _ => None,
        }
    }

    /// Classifies an already-parsed double.
    #[must_use]
    pub fn from_f64(value: f64) -> Option<Self> {
        if value.is_nan() {
            Some(AbstractDouble::NaN)
        } else if value == f64::INFINITY {
            Some(AbstractDouble::PositiveInfinity)
        } else if value == f64::NEG_INFINITY {
            Some(AbstractDouble::NegativeInfinity)
        } else {
            None
        }
    }

    #[must_use]
    pub fn enum_value(self) -> &'static str {
        match self {
            AbstractDouble::NaN => Self::ENUM_VALUES[0],
            AbstractDouble::PositiveInfinity => Self::ENUM_VALUES[1],
            AbstractDouble::NegativeInfinity => Self::ENUM_VALUES[2],
        }
    }

    /// Representative value for the primary column. `NaN` has none.
    #[must_use]
    pub fn approximate_value(self) -> Option<f64> {
        match self {
            AbstractDouble::NaN => None,
            AbstractDouble::PositiveInfinity => Some(f64::MAX),
            AbstractDouble::NegativeInfinity => Some(-f64::MAX),
        }
    }
}

// ---------------------------------------------------------------------------
// Physical types
// ---------------------------------------------------------------------------

/// Physical MySQL column types produced by the DDL generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MySqlColumnType {
    Bigint,
    Varchar,
    Double,
    Boolean,
    MediumText,
}

impl MySqlColumnType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            MySqlColumnType::Bigint => "BIGINT",
            MySqlColumnType::Varchar => "VARCHAR",
            MySqlColumnType::Double => "DOUBLE",
            MySqlColumnType::Boolean => "BOOLEAN",
            MySqlColumnType::MediumText => "MEDIUMTEXT",
        }
    }

    /// Parses a reflected type such as `bigint(20)` or `tinyint(1)`.
    #[must_use]
    pub fn parse(type_name: &str) -> Option<Self> {
        let base = type_name
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match base.as_str() {
            "bigint" => Some(MySqlColumnType::Bigint),
            "varchar" => Some(MySqlColumnType::Varchar),
            "double" => Some(MySqlColumnType::Double),
            "boolean" | "bool" | "tinyint" => Some(MySqlColumnType::Boolean),
            "mediumtext" => Some(MySqlColumnType::MediumText),
            _ => None,
        }
    }

    /// Text columns need a prefix length when indexed.
    #[must_use]
    pub fn requires_index_prefix(self) -> bool {
        matches!(self, MySqlColumnType::MediumText)
    }
}

/// Annotation value type recorded in the replication source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnnotationType {
    String,
    Long,
    Double,
    Date,
}

impl AnnotationType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AnnotationType::String => "STRING",
            AnnotationType::Long => "LONG",
            AnnotationType::Double => "DOUBLE",
            AnnotationType::Date => "DATE",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "STRING" => Some(AnnotationType::String),
            "LONG" => Some(AnnotationType::Long),
            "DOUBLE" => Some(AnnotationType::Double),
            "DATE" => Some(AnnotationType::Date),
            _ => None,
        }
    }
}

pub const ANNOTATION_STRING_VALUE: &str = "STRING_VALUE";
pub const ANNOTATION_LONG_VALUE: &str = "LONG_VALUE";
pub const ANNOTATION_DOUBLE_VALUE: &str = "DOUBLE_VALUE";
pub const ANNOTATION_BOOLEAN_VALUE: &str = "BOOLEAN_VALUE";
pub const ANNOTATION_DOUBLE_ABSTRACT: &str = "DOUBLE_ABSTRACT";

// ---------------------------------------------------------------------------
// Handler table
// ---------------------------------------------------------------------------

/// Storage rules for one declared column type.
#[derive(Debug)]
pub struct ColumnTypeInfo {
    pub column_type: ColumnType,
    pub mysql_type: MySqlColumnType,
    /// Fixed display width, e.g. `BIGINT(20)`.
    pub fixed_size: Option<u32>,
    /// Whether `VARCHAR(n)` takes the column's maximum size.
    pub uses_maximum_size: bool,
    pub annotation_type: AnnotationType,
    /// Column of the annotation replication table holding this type.
    pub annotation_value_column: &'static str,
    /// Widest value rendered as a string, for non-text types.
    pub max_characters: Option<u32>,
}

const LONG_CHARACTERS: u32 = 20;

static INFO_STRING: ColumnTypeInfo = ColumnTypeInfo {
    column_type: ColumnType::String,
    mysql_type: MySqlColumnType::Varchar,
    fixed_size: None,
    uses_maximum_size: true,
    annotation_type: AnnotationType::String,
    annotation_value_column: ANNOTATION_STRING_VALUE,
    max_characters: None,
};
static INFO_DOUBLE: ColumnTypeInfo = ColumnTypeInfo {
    column_type: ColumnType::Double,
    mysql_type: MySqlColumnType::Double,
    fixed_size: None,
    uses_maximum_size: false,
    annotation_type: AnnotationType::Double,
    annotation_value_column: ANNOTATION_DOUBLE_VALUE,
    max_characters: Some(24),
};
static INFO_INTEGER: ColumnTypeInfo = ColumnTypeInfo {
    column_type: ColumnType::Integer,
    mysql_type: MySqlColumnType::Bigint,
    fixed_size: Some(20),
    uses_maximum_size: false,
    annotation_type: AnnotationType::Long,
    annotation_value_column: ANNOTATION_LONG_VALUE,
    max_characters: Some(LONG_CHARACTERS),
};
static INFO_BOOLEAN: ColumnTypeInfo = ColumnTypeInfo {
    column_type: ColumnType::Boolean,
    mysql_type: MySqlColumnType::Boolean,
    fixed_size: None,
    uses_maximum_size: false,
    annotation_type: AnnotationType::String,
    annotation_value_column: ANNOTATION_BOOLEAN_VALUE,
    max_characters: Some(5),
};
static INFO_DATE: ColumnTypeInfo = ColumnTypeInfo {
    column_type: ColumnType::Date,
    mysql_type: MySqlColumnType::Bigint,
    fixed_size: Some(20),
    uses_maximum_size: false,
    annotation_type: AnnotationType::Date,
    annotation_value_column: ANNOTATION_LONG_VALUE,
    max_characters: Some(LONG_CHARACTERS),
};
static INFO_FILE_HANDLE_ID: ColumnTypeInfo = ColumnTypeInfo {
    column_type: ColumnType::FileHandleId,
    mysql_type: MySqlColumnType::Bigint,
    fixed_size: Some(20),
    uses_maximum_size: false,
    annotation_type: AnnotationType::String,
    annotation_value_column: ANNOTATION_LONG_VALUE,
    max_characters: Some(LONG_CHARACTERS),
};
static INFO_ENTITY_ID: ColumnTypeInfo = ColumnTypeInfo {
    column_type: ColumnType::EntityId,
    mysql_type: MySqlColumnType::Bigint,
    fixed_size: Some(20),
    uses_maximum_size: false,
    annotation_type: AnnotationType::String,
    annotation_value_column: ANNOTATION_LONG_VALUE,
    max_characters: Some(LONG_CHARACTERS),
};
static INFO_LINK: ColumnTypeInfo = ColumnTypeInfo {
    column_type: ColumnType::Link,
    mysql_type: MySqlColumnType::Varchar,
    fixed_size: None,
    uses_maximum_size: true,
    annotation_type: AnnotationType::String,
    annotation_value_column: ANNOTATION_STRING_VALUE,
    max_characters: None,
};
static INFO_LARGE_TEXT: ColumnTypeInfo = ColumnTypeInfo {
    column_type: ColumnType::LargeText,
    mysql_type: MySqlColumnType::MediumText,
    fixed_size: None,
    uses_maximum_size: false,
    annotation_type: AnnotationType::String,
    annotation_value_column: ANNOTATION_STRING_VALUE,
    max_characters: Some(LARGE_TEXT_MAX_CHARACTERS),
};
static INFO_USER_ID: ColumnTypeInfo = ColumnTypeInfo {
    column_type: ColumnType::UserId,
    mysql_type: MySqlColumnType::Bigint,
    fixed_size: Some(20),
    uses_maximum_size: false,
    annotation_type: AnnotationType::String,
    annotation_value_column: ANNOTATION_LONG_VALUE,
    max_characters: Some(LONG_CHARACTERS),
};

/// Looks up the storage rules for a declared type.
#[must_use]
pub fn type_info(column_type: ColumnType) -> &'static ColumnTypeInfo {
    match column_type {
        ColumnType::String => &INFO_STRING,
        ColumnType::Double => &INFO_DOUBLE,
        ColumnType::Integer => &INFO_INTEGER,
        ColumnType::Boolean => &INFO_BOOLEAN,
        ColumnType::Date => &INFO_DATE,
        ColumnType::FileHandleId => &INFO_FILE_HANDLE_ID,
        ColumnType::EntityId => &INFO_ENTITY_ID,
        ColumnType::Link => &INFO_LINK,
        ColumnType::LargeText => &INFO_LARGE_TEXT,
        ColumnType::UserId => &INFO_USER_ID,
    }
}

/// Primary and (for doubles) companion values for one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedValue {
    pub primary: DbValue,
    /// `Some` only for double columns: null or a non-finite sentinel.
    pub companion: Option<DbValue>,
}

impl ColumnTypeInfo {
    /// Parses a source value into the value bound to the primary column.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unparsable`] for content that does not fit the
    /// declared type.
    pub fn parse_value_for_db(&self, value: &str) -> Result<DbValue, CodecError> {
        let unparsable = || CodecError::Unparsable {
            column_type: self.column_type,
            value: value.to_string(),
        };
        match self.column_type {
            ColumnType::String | ColumnType::Link | ColumnType::LargeText => {
                Ok(DbValue::String(value.to_string()))
            }
            ColumnType::Integer | ColumnType::FileHandleId | ColumnType::UserId => value
                .trim()
                .parse::<i64>()
                .map(DbValue::Long)
                .map_err(|_| unparsable()),
            ColumnType::EntityId => parse_entity_id(value).map(DbValue::Long).ok_or_else(unparsable),
            ColumnType::Date => parse_date(value).map(DbValue::Long).ok_or_else(unparsable),
            ColumnType::Boolean => parse_boolean(value).map(DbValue::Bool).ok_or_else(unparsable),
            ColumnType::Double => match parse_double(value) {
                Some(Ok(v)) => Ok(DbValue::Double(v)),
                Some(Err(abstract_value)) => Ok(abstract_value
                    .approximate_value()
                    .map_or(DbValue::Null, DbValue::Double)),
                None => Err(unparsable()),
            },
        }
    }

    /// Encodes a nullable source value into primary and companion values.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unparsable`] for content that does not fit the
    /// declared type.
    pub fn encode(&self, value: Option<&str>) -> Result<EncodedValue, CodecError> {
        let Some(value) = value else {
            return Ok(EncodedValue {
                primary: DbValue::Null,
                companion: self.column_type.is_double().then_some(DbValue::Null),
            });
        };
        if !self.column_type.is_double() {
            return Ok(EncodedValue {
                primary: self.parse_value_for_db(value)?,
                companion: None,
            });
        }
        match parse_double(value) {
            Some(Ok(v)) => Ok(EncodedValue {
                primary: DbValue::Double(v),
                companion: Some(DbValue::Null),
            }),
            Some(Err(abstract_value)) => Ok(EncodedValue {
                primary: abstract_value
                    .approximate_value()
                    .map_or(DbValue::Null, DbValue::Double),
                companion: Some(DbValue::String(abstract_value.enum_value().to_string())),
            }),
            None => Err(CodecError::Unparsable {
                column_type: self.column_type,
                value: value.to_string(),
            }),
        }
    }

    /// Converts a raw value read from the physical column into its
    /// user-facing string form.
    #[must_use]
    pub fn decode_from_db(&self, raw: Option<&str>) -> Option<String> {
        let raw = raw?;
        match self.column_type {
            ColumnType::Boolean => Some(
                match raw {
                    "1" => "true",
                    "0" => "false",
                    other => return parse_boolean(other).map(|b| b.to_string()),
                }
                .to_string(),
            ),
            _ => Some(raw.to_string()),
        }
    }

    /// Physical type plus default and comment, without the column name.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unparsable`] when the default value does not
    /// fit the declared type.
    pub fn sql_definition(
        &self,
        maximum_size: Option<u32>,
        default_value: Option<&str>,
    ) -> Result<String, CodecError> {
        let mut sql = String::from(self.mysql_type.name());
        if let Some(size) = self.fixed_size {
            sql.push_str(&format!("({size})"));
        } else if self.uses_maximum_size {
            let size = maximum_size.unwrap_or(crate::types::DEFAULT_MAX_STRING_SIZE);
            sql.push_str(&format!("({size})"));
        }
        if matches!(
            self.mysql_type,
            MySqlColumnType::Varchar | MySqlColumnType::MediumText
        ) {
            sql.push_str(" CHARACTER SET utf8 COLLATE utf8_general_ci");
        }
        let default = match default_value {
            Some(v) => self.parse_value_for_db(v)?.to_sql_literal(),
            None => "NULL".to_string(),
        };
        sql.push_str(&format!(" DEFAULT {default} COMMENT '{}'", self.column_type.name()));
        Ok(sql)
    }

    /// Worst-case size of one value in bytes, as returned to a caller.
    #[must_use]
    pub fn max_value_bytes(&self, maximum_size: Option<u32>) -> u32 {
        let characters = self
            .max_characters
            .unwrap_or_else(|| maximum_size.unwrap_or(crate::types::DEFAULT_MAX_STRING_SIZE));
        characters.saturating_mul(MAX_BYTES_PER_CHAR)
    }
}

/// Encodes one cell of a user column, naming the column on failure.
///
/// # Errors
///
/// Returns [`CodecError::InvalidColumnValue`] for unparsable content and
/// [`CodecError::ValueTooLarge`] for strings longer than the column allows.
pub fn encode_column_value(
    column: &ColumnModel,
    value: Option<&str>,
) -> Result<EncodedValue, CodecError> {
    if let (Some(v), true) = (
        value,
        matches!(column.column_type, ColumnType::String | ColumnType::Link),
    ) {
        let maximum_size = column.effective_maximum_size();
        if v.chars().count() > maximum_size as usize {
            return Err(CodecError::ValueTooLarge {
                column: column.name.clone(),
                maximum_size,
            });
        }
    }
    type_info(column.column_type)
        .encode(value)
        .map_err(|e| match e {
            CodecError::Unparsable { column_type, value } => CodecError::InvalidColumnValue {
                column: column.name.clone(),
                column_type,
                value,
            },
            other => other,
        })
}

/// Accepts `123` or `syn123` (any case).
fn parse_entity_id(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    let digits = match trimmed.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("syn") => &trimmed[3..],
        _ => trimmed,
    };
    digits.parse::<i64>().ok()
}

/// Accepts epoch milliseconds or `yyyy-M-d H:m:s[.SSS]` in UTC.
fn parse_date(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Ok(millis) = trimmed.parse::<i64>() {
        return Some(millis);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn parse_boolean(value: &str) -> Option<bool> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        Some(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// `Some(Ok)` for finite doubles, `Some(Err)` for non-finite ones.
fn parse_double(value: &str) -> Option<Result<f64, AbstractDouble>> {
    if let Some(abstract_value) = AbstractDouble::lookup(value) {
        return Some(Err(abstract_value));
    }
    let parsed = value.trim().parse::<f64>().ok()?;
    Some(AbstractDouble::from_f64(parsed).map_or(Ok(parsed), Err))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
