//! Physical naming and DDL/DML generation for table indexes.
//!
//! Every user column `n` lives in `_Cn_` of table `T<id>`; double columns
//! also own `_DBL_Cn_`, an `ENUM` holding the non-finite sentinel.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::codec::{self, AbstractDouble, CodecError, DbValue};
use crate::index::DatabaseColumnInfo;
use crate::types::ColumnModel;

pub const ROW_ID: &str = "ROW_ID";
pub const ROW_VERSION: &str = "ROW_VERSION";
pub const ROW_ETAG: &str = "ROW_ETAG";
pub const ROW_BENEFACTOR: &str = "ROW_BENEFACTOR";
pub const SCHEMA_HASH: &str = "SCHEMA_HASH";

pub const TABLE_PREFIX: &str = "T";
pub const TEMP_TABLE_PREFIX: &str = "TEMP";
pub const STATUS_TABLE_POSTFIX: &str = "S";
pub const COLUMN_PREFIX: &str = "_C";
pub const COLUMN_POSTFIX: &str = "_";
pub const DOUBLE_PREFIX: &str = "_DBL";
pub const INDEX_POSTFIX: &str = "idx_";

/// Parameter bound to `ROW_ID` in row writes.
pub const ROW_ID_BIND: &str = "bRI";
/// Parameter bound to `ROW_VERSION` in row writes.
pub const ROW_VERSION_BIND: &str = "bRV";

/// Errors raised while generating DDL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("Column info for column {column_id} is required to change it")]
    MissingColumnInfo { column_id: i64 },
    #[error("Index name is required for column {column_id} which has an index")]
    MissingIndexName { column_id: i64 },
    #[error("Not a valid column name: '{name}'")]
    InvalidColumnName { name: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

#[must_use]
pub fn table_name(table_id: i64) -> String {
    format!("{TABLE_PREFIX}{table_id}")
}

#[must_use]
pub fn temp_table_name(table_id: i64) -> String {
    format!("{TEMP_TABLE_PREFIX}{table_id}")
}

/// Secondary table holding the applied version and schema hash.
#[must_use]
pub fn status_table_name(table_id: i64) -> String {
    format!("{TABLE_PREFIX}{table_id}{STATUS_TABLE_POSTFIX}")
}

#[must_use]
pub fn column_name_for_id(column_id: i64) -> String {
    format!("{COLUMN_PREFIX}{column_id}{COLUMN_POSTFIX}")
}

#[must_use]
pub fn double_column_name(column_id: i64) -> String {
    format!("{DOUBLE_PREFIX}{}", column_name_for_id(column_id))
}

#[must_use]
pub fn index_name_for_column(column_name: &str) -> String {
    format!("{column_name}{INDEX_POSTFIX}")
}

/// Recovers the column id from `_C<id>_`.
///
/// # Errors
///
/// Returns [`SchemaError::InvalidColumnName`] for any other shape.
pub fn column_id_from_name(name: &str) -> Result<i64, SchemaError> {
    name.strip_prefix(COLUMN_PREFIX)
        .and_then(|rest| rest.strip_suffix(COLUMN_POSTFIX))
        .and_then(|digits| digits.parse::<i64>().ok())
        .ok_or_else(|| SchemaError::InvalidColumnName {
            name: name.to_string(),
        })
}

/// Read-side projection of a double: the sentinel when set, else the value.
#[must_use]
pub fn double_case_expression(column_id: i64) -> String {
    let dbl = double_column_name(column_id);
    format!(
        "CASE WHEN {dbl} IS NULL THEN {} ELSE {dbl} END",
        column_name_for_id(column_id)
    )
}

fn double_enum_definition() -> String {
    let values = AbstractDouble::ENUM_VALUES
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("ENUM ({values}) DEFAULT null")
}

/// `_C<id>_ <type> DEFAULT <v> COMMENT '<TYPE>'`.
///
/// # Errors
///
/// Returns [`SchemaError::Codec`] when the default does not fit the type.
pub fn column_definition(column: &ColumnModel) -> Result<String, SchemaError> {
    let definition = codec::type_info(column.column_type)
        .sql_definition(column.maximum_size, column.default_value.as_deref())?;
    Ok(format!("{} {definition}", column_name_for_id(column.id)))
}

// ---------------------------------------------------------------------------
// Column changes
// ---------------------------------------------------------------------------

/// One column-level schema change. At least one side is always present.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnChangeDetails {
    old_column: Option<ColumnModel>,
    old_column_info: Option<DatabaseColumnInfo>,
    new_column: Option<ColumnModel>,
}

impl ColumnChangeDetails {
    #[must_use]
    pub fn add(new_column: ColumnModel) -> Self {
        Self {
            old_column: None,
            old_column_info: None,
            new_column: Some(new_column),
        }
    }

    #[must_use]
    pub fn remove(old_column: ColumnModel) -> Self {
        Self {
            old_column: Some(old_column),
            old_column_info: None,
            new_column: None,
        }
    }

    #[must_use]
    pub fn update(
        old_column: ColumnModel,
        old_column_info: Option<DatabaseColumnInfo>,
        new_column: ColumnModel,
    ) -> Self {
        Self {
            old_column: Some(old_column),
            old_column_info,
            new_column: Some(new_column),
        }
    }

    #[must_use]
    pub fn old_column(&self) -> Option<&ColumnModel> {
        self.old_column.as_ref()
    }

    #[must_use]
    pub fn old_column_info(&self) -> Option<&DatabaseColumnInfo> {
        self.old_column_info.as_ref()
    }

    #[must_use]
    pub fn new_column(&self) -> Option<&ColumnModel> {
        self.new_column.as_ref()
    }

    #[must_use]
    pub fn with_old_column_info(mut self, info: DatabaseColumnInfo) -> Self {
        self.old_column_info = Some(info);
        self
    }
}

/// Whether two models map to the same physical column definition.
fn is_same_physical_column(old: &ColumnModel, new: &ColumnModel) -> bool {
    old.id == new.id
        && old.column_type == new.column_type
        && old.maximum_size == new.maximum_size
        && old.default_value == new.default_value
}

/// DDL fragment for one change, or `None` for a no-op.
///
/// # Errors
///
/// Returns [`SchemaError`] when an update lacks physical column info, an
/// indexed column has no index name, or a default value is unparsable.
pub fn alter_table_fragment(change: &ColumnChangeDetails) -> Result<Option<String>, SchemaError> {
    match (&change.old_column, &change.new_column) {
        (None, Some(new)) => add_column_fragment(new).map(Some),
        (Some(old), None) => Ok(Some(drop_column_fragment(old))),
        (Some(old), Some(new)) => {
            if is_same_physical_column(old, new) {
                return Ok(None);
            }
            update_column_fragment(old, change.old_column_info.as_ref(), new).map(Some)
        }
        (None, None) => Ok(None),
    }
}

fn add_column_fragment(new: &ColumnModel) -> Result<String, SchemaError> {
    let mut sql = format!("ADD COLUMN {}", column_definition(new)?);
    if new.column_type.is_double() {
        sql.push_str(&format!(
            ", ADD COLUMN {} {}",
            double_column_name(new.id),
            double_enum_definition()
        ));
    }
    Ok(sql)
}

fn drop_column_fragment(old: &ColumnModel) -> String {
    let mut sql = format!("DROP COLUMN {}", column_name_for_id(old.id));
    if old.column_type.is_double() {
        sql.push_str(&format!(", DROP COLUMN {}", double_column_name(old.id)));
    }
    sql
}

fn update_column_fragment(
    old: &ColumnModel,
    old_info: Option<&DatabaseColumnInfo>,
    new: &ColumnModel,
) -> Result<String, SchemaError> {
    let info = old_info.ok_or(SchemaError::MissingColumnInfo { column_id: old.id })?;
    let mut sql = String::new();
    if info.has_index {
        let index_name = info
            .index_name
            .as_deref()
            .ok_or(SchemaError::MissingIndexName { column_id: old.id })?;
        sql.push_str(&format!("DROP INDEX {index_name}, "));
    }
    sql.push_str(&format!(
        "CHANGE COLUMN {} {}",
        column_name_for_id(old.id),
        column_definition(new)?
    ));
    match (old.column_type.is_double(), new.column_type.is_double()) {
        (true, false) => {
            sql.push_str(&format!(", DROP COLUMN {}", double_column_name(old.id)));
        }
        (false, true) => {
            sql.push_str(&format!(
                ", ADD COLUMN {} {}",
                double_column_name(new.id),
                double_enum_definition()
            ));
        }
        (true, true) => {
            sql.push_str(&format!(
                ", CHANGE COLUMN {} {} {}",
                double_column_name(old.id),
                double_column_name(new.id),
                double_enum_definition()
            ));
        }
        (false, false) => {}
    }
    Ok(sql)
}

/// One `ALTER TABLE` joining every non-empty fragment with `", "`.
///
/// Returns `Ok(None)` when no change produces a fragment. No-op entries may
/// appear anywhere in `changes` without leaving a stray separator.
///
/// # Errors
///
/// Propagates [`alter_table_fragment`] errors.
pub fn create_alter_table_sql(
    changes: &[ColumnChangeDetails],
    table_id: i64,
    alter_temp: bool,
) -> Result<Option<String>, SchemaError> {
    let mut fragments = Vec::with_capacity(changes.len());
    for change in changes {
        if let Some(fragment) = alter_table_fragment(change)? {
            fragments.push(fragment);
        }
    }
    if fragments.is_empty() {
        return Ok(None);
    }
    let table = if alter_temp {
        temp_table_name(table_id)
    } else {
        table_name(table_id)
    };
    Ok(Some(format!("ALTER TABLE {table} {}", fragments.join(", "))))
}

/// Removals for ids only in `old`, then additions for ids only in `new`.
/// Reordering alone produces no change.
#[must_use]
pub fn create_replace_schema_change(
    old_schema: &[ColumnModel],
    new_schema: &[ColumnModel],
) -> Vec<ColumnChangeDetails> {
    let old_ids: BTreeSet<i64> = old_schema.iter().map(|c| c.id).collect();
    let new_ids: BTreeSet<i64> = new_schema.iter().map(|c| c.id).collect();
    let removals = old_schema
        .iter()
        .filter(|c| !new_ids.contains(&c.id))
        .cloned()
        .map(ColumnChangeDetails::remove);
    let additions = new_schema
        .iter()
        .filter(|c| !old_ids.contains(&c.id))
        .cloned()
        .map(ColumnChangeDetails::add);
    removals.chain(additions).collect()
}

/// Attaches live column info to each change. A change whose old column is
/// not physically present turns into an add of the new column (or nothing).
#[must_use]
pub fn match_changes_to_current_info(
    changes: Vec<ColumnChangeDetails>,
    current_info: &[DatabaseColumnInfo],
) -> Vec<ColumnChangeDetails> {
    let by_name: HashMap<&str, &DatabaseColumnInfo> = current_info
        .iter()
        .map(|i| (i.column_name.as_str(), i))
        .collect();
    changes
        .into_iter()
        .filter_map(|change| {
            let Some(old) = change.old_column.as_ref() else {
                return Some(change);
            };
            match by_name.get(column_name_for_id(old.id).as_str()) {
                Some(info) => {
                    let info = (*info).clone();
                    Some(change.with_old_column_info(info))
                }
                None => change.new_column.map(ColumnChangeDetails::add),
            }
        })
        .collect()
}

/// Reflects the user columns of a physical table back into models.
///
/// Reserved columns, companions and columns with no recoverable type are
/// skipped.
#[must_use]
pub fn extract_schema_from_info(info: &[DatabaseColumnInfo]) -> Vec<ColumnModel> {
    info.iter()
        .filter(|i| !i.is_reserved() && !i.is_double_companion())
        .filter_map(|i| {
            let column_type = i.column_type?;
            let id = column_id_from_name(&i.column_name).ok()?;
            let mut model = ColumnModel::new(id, i.column_name.clone(), column_type);
            model.maximum_size = i.max_size;
            Some(model)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Table statements
// ---------------------------------------------------------------------------

#[must_use]
pub fn create_table_if_does_not_exist_sql(table_id: i64, is_view: bool) -> String {
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {}( {ROW_ID} bigint(20) NOT NULL, {ROW_VERSION} bigint(20) NOT NULL, ",
        table_name(table_id)
    );
    if is_view {
        sql.push_str(&format!(
            "{ROW_ETAG} varchar(36) NOT NULL, {ROW_BENEFACTOR} bigint(20) NOT NULL, "
        ));
    }
    sql.push_str(&format!("PRIMARY KEY ({ROW_ID})"));
    if is_view {
        sql.push_str(&format!(
            ", KEY `IDX_ETAG` ({ROW_ETAG}), KEY `IDX_BENEFACTOR` ({ROW_BENEFACTOR})"
        ));
    }
    sql.push(')');
    sql
}

/// Single-row table recording the applied version and schema hash.
#[must_use]
pub fn create_status_table_if_does_not_exist_sql(table_id: i64) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {}( SINGLE_KEY ENUM('PK') NOT NULL, \
         {ROW_VERSION} bigint(20) NOT NULL, {SCHEMA_HASH} CHAR(64) NOT NULL, \
         PRIMARY KEY (SINGLE_KEY))",
        status_table_name(table_id)
    )
}

/// Bind name of the version written by [`set_max_version_sql`].
pub const VERSION_BIND: &str = "version";
/// Bind name of the hash written by [`set_schema_hash_sql`].
pub const SCHEMA_HASH_BIND: &str = "schemaHash";

/// Sentinel hash stored until the first schema is applied.
const DEFAULT_SCHEMA_HASH: &str = "DEFAULT";

#[must_use]
pub fn get_max_version_sql(table_id: i64) -> String {
    format!(
        "SELECT {ROW_VERSION} FROM {} WHERE SINGLE_KEY = 'PK'",
        status_table_name(table_id)
    )
}

/// Records the applied version, keeping any stored schema hash.
#[must_use]
pub fn set_max_version_sql(table_id: i64) -> String {
    format!(
        "INSERT INTO {} (SINGLE_KEY, {ROW_VERSION}, {SCHEMA_HASH}) VALUES ('PK', :{VERSION_BIND}, '{DEFAULT_SCHEMA_HASH}') \
         ON DUPLICATE KEY UPDATE {ROW_VERSION} = :{VERSION_BIND}",
        status_table_name(table_id)
    )
}

#[must_use]
pub fn get_schema_hash_sql(table_id: i64) -> String {
    format!(
        "SELECT {SCHEMA_HASH} FROM {} WHERE SINGLE_KEY = 'PK'",
        status_table_name(table_id)
    )
}

/// Records the applied schema hash, keeping any stored version.
#[must_use]
pub fn set_schema_hash_sql(table_id: i64) -> String {
    format!(
        "INSERT INTO {} (SINGLE_KEY, {ROW_VERSION}, {SCHEMA_HASH}) VALUES ('PK', -1, :{SCHEMA_HASH_BIND}) \
         ON DUPLICATE KEY UPDATE {SCHEMA_HASH} = :{SCHEMA_HASH_BIND}",
        status_table_name(table_id)
    )
}

#[must_use]
pub fn truncate_table_sql(table_id: i64) -> String {
    format!("TRUNCATE TABLE {}", table_name(table_id))
}

#[must_use]
pub fn drop_table_sql(table_id: i64) -> String {
    format!("DROP TABLE IF EXISTS {}", table_name(table_id))
}

#[must_use]
pub fn drop_status_table_sql(table_id: i64) -> String {
    format!("DROP TABLE IF EXISTS {}", status_table_name(table_id))
}

#[must_use]
pub fn create_temp_table_sql(table_id: i64) -> String {
    format!(
        "CREATE TABLE {} LIKE {}",
        temp_table_name(table_id),
        table_name(table_id)
    )
}

#[must_use]
pub fn copy_table_to_temp_sql(table_id: i64) -> String {
    format!(
        "INSERT INTO {} SELECT * FROM {} ORDER BY {ROW_ID}",
        temp_table_name(table_id),
        table_name(table_id)
    )
}

#[must_use]
pub fn delete_temp_table_sql(table_id: i64) -> String {
    format!("DROP TABLE IF EXISTS {}", temp_table_name(table_id))
}

#[must_use]
pub fn distinct_benefactors_sql(table_id: i64) -> String {
    format!("SELECT DISTINCT {ROW_BENEFACTOR} FROM {}", table_name(table_id))
}

// ---------------------------------------------------------------------------
// Row writes
// ---------------------------------------------------------------------------

/// One row to create or update in a plain table. Columns absent from
/// `values` are written as null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWrite {
    pub row_id: i64,
    pub version: i64,
    pub values: BTreeMap<i64, String>,
}

/// Physical columns written for `schema`, companions after their primary.
#[must_use]
pub fn write_column_names(schema: &[ColumnModel]) -> Vec<String> {
    let mut names = Vec::with_capacity(schema.len());
    for column in schema {
        names.push(column_name_for_id(column.id));
        if column.column_type.is_double() {
            names.push(double_column_name(column.id));
        }
    }
    names
}

/// Upsert statement with one named parameter per physical column.
#[must_use]
pub fn build_create_or_update_row_sql(table_id: i64, schema: &[ColumnModel]) -> String {
    let columns = write_column_names(schema);
    let mut names = vec![ROW_ID.to_string(), ROW_VERSION.to_string()];
    names.extend(columns.iter().cloned());
    let mut binds = vec![format!(":{ROW_ID_BIND}"), format!(":{ROW_VERSION_BIND}")];
    binds.extend(columns.iter().map(|c| format!(":{c}")));
    let mut updates = vec![format!("{ROW_VERSION} = VALUES({ROW_VERSION})")];
    updates.extend(columns.iter().map(|c| format!("{c} = VALUES({c})")));
    format!(
        "INSERT INTO {} ({}) VALUES ( {}) ON DUPLICATE KEY UPDATE {}",
        table_name(table_id),
        names.join(", "),
        binds.join(", "),
        updates.join(", ")
    )
}

#[must_use]
pub fn build_delete_rows_sql(table_id: i64) -> String {
    format!(
        "DELETE FROM {} WHERE {ROW_ID} IN ( :{ROW_ID_BIND})",
        table_name(table_id)
    )
}

/// Parameters for one upsert built by [`build_create_or_update_row_sql`].
///
/// # Errors
///
/// Returns the [`CodecError`] of the first cell that fails to encode.
pub fn bind_row_parameters(
    schema: &[ColumnModel],
    row: &RowWrite,
) -> Result<BTreeMap<String, DbValue>, CodecError> {
    let mut params = BTreeMap::new();
    params.insert(ROW_ID_BIND.to_string(), DbValue::Long(row.row_id));
    params.insert(ROW_VERSION_BIND.to_string(), DbValue::Long(row.version));
    for column in schema {
        let encoded =
            codec::encode_column_value(column, row.values.get(&column.id).map(String::as_str))?;
        params.insert(column_name_for_id(column.id), encoded.primary);
        if let Some(companion) = encoded.companion {
            params.insert(double_column_name(column.id), companion);
        }
    }
    Ok(params)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
