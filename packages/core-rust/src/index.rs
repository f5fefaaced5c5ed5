//! Index optimization for physical tables.
//!
//! MySQL caps the number of secondary indexes per table, so only the
//! highest-cardinality user columns carry one. Each pass reflects the live
//! table into [`DatabaseColumnInfo`], ranks it, and emits a single
//! `ALTER TABLE` that converges the indexes onto the ranking.

use std::cmp::Ordering;

use crate::codec::MySqlColumnType;
use crate::ddl::{self, ROW_BENEFACTOR, ROW_ETAG, ROW_ID, ROW_VERSION};
use crate::types::ColumnType;

/// Prefix length used when indexing text columns.
pub const TEXT_INDEX_PREFIX_LENGTH: u32 = 255;

/// Reflection of one physical column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatabaseColumnInfo {
    pub column_name: String,
    pub has_index: bool,
    pub index_name: Option<String>,
    /// Distinct-value count, used only to rank index desirability.
    pub cardinality: i64,
    pub mysql_type: Option<MySqlColumnType>,
    pub max_size: Option<u32>,
    /// Declared type recovered from the column comment.
    pub column_type: Option<ColumnType>,
}

impl DatabaseColumnInfo {
    #[must_use]
    pub fn new(column_name: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_index(mut self, index_name: impl Into<String>) -> Self {
        self.has_index = true;
        self.index_name = Some(index_name.into());
        self
    }

    #[must_use]
    pub fn with_cardinality(mut self, cardinality: i64) -> Self {
        self.cardinality = cardinality;
        self
    }

    #[must_use]
    pub fn with_mysql_type(mut self, mysql_type: MySqlColumnType) -> Self {
        self.mysql_type = Some(mysql_type);
        self
    }

    /// Row bookkeeping columns carry fixed keys and never compete for the cap.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        matches!(
            self.column_name.as_str(),
            ROW_ID | ROW_VERSION | ROW_ETAG | ROW_BENEFACTOR
        )
    }

    /// Whether this is the non-finite companion of a double column.
    #[must_use]
    pub fn is_double_companion(&self) -> bool {
        self.column_name.starts_with(ddl::DOUBLE_PREFIX)
    }

    /// `_C1_idx_ (_C1_)`, with a prefix length for text columns.
    #[must_use]
    pub fn index_definition(&self) -> String {
        let index_name = ddl::index_name_for_column(&self.column_name);
        let prefix = if self
            .mysql_type
            .is_some_and(MySqlColumnType::requires_index_prefix)
        {
            format!("({TEXT_INDEX_PREFIX_LENGTH})")
        } else {
            String::new()
        };
        format!("{index_name} ({}{prefix})", self.column_name)
    }
}

/// Index alterations needed to match the cardinality ranking.
///
/// A column appears in at most one of the three lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexChange {
    pub to_add: Vec<DatabaseColumnInfo>,
    pub to_remove: Vec<DatabaseColumnInfo>,
    /// Indexed under a non-canonical name.
    pub to_rename: Vec<DatabaseColumnInfo>,
}

impl IndexChange {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_rename.is_empty()
    }
}

/// Ranks user columns by descending cardinality (ties by column id) and
/// splits them into add/remove/rename lists so that at most
/// `max_number_of_index` columns end up indexed.
#[must_use]
pub fn calculate_index_optimization(
    current_info: &[DatabaseColumnInfo],
    max_number_of_index: usize,
) -> IndexChange {
    let mut ranked: Vec<&DatabaseColumnInfo> = current_info
        .iter()
        .filter(|info| !info.is_reserved() && !info.is_double_companion())
        .collect();
    ranked.sort_by(|a, b| compare_rank(a, b));

    let mut changes = IndexChange::default();
    for (position, info) in ranked.into_iter().enumerate() {
        if position < max_number_of_index {
            if !info.has_index {
                changes.to_add.push(info.clone());
            } else if info.index_name.as_deref()
                != Some(ddl::index_name_for_column(&info.column_name).as_str())
            {
                changes.to_rename.push(info.clone());
            }
        } else if info.has_index {
            changes.to_remove.push(info.clone());
        }
    }
    changes
}

fn compare_rank(a: &DatabaseColumnInfo, b: &DatabaseColumnInfo) -> Ordering {
    let id = |info: &DatabaseColumnInfo| ddl::column_id_from_name(&info.column_name).unwrap_or(i64::MAX);
    b.cardinality
        .cmp(&a.cardinality)
        .then_with(|| id(a).cmp(&id(b)))
        .then_with(|| a.column_name.cmp(&b.column_name))
}

/// Single `ALTER TABLE` applying `changes`: drops, then renames (as drop and
/// re-add), then additions. `None` when nothing changes.
#[must_use]
pub fn create_alter_indices(changes: &IndexChange, table_id: i64) -> Option<String> {
    if changes.is_empty() {
        return None;
    }
    let existing_name = |info: &DatabaseColumnInfo| {
        info.index_name
            .clone()
            .unwrap_or_else(|| ddl::index_name_for_column(&info.column_name))
    };
    let mut fragments = Vec::new();
    for info in &changes.to_remove {
        fragments.push(format!("DROP INDEX {}", existing_name(info)));
    }
    for info in &changes.to_rename {
        fragments.push(format!("DROP INDEX {}", existing_name(info)));
        fragments.push(format!("ADD INDEX {}", info.index_definition()));
    }
    for info in &changes.to_add {
        fragments.push(format!("ADD INDEX {}", info.index_definition()));
    }
    Some(format!(
        "ALTER TABLE {} {}",
        ddl::table_name(table_id),
        fragments.join(", ")
    ))
}

/// Ranking and statement generation in one step.
#[must_use]
pub fn create_optimized_alter_indices(
    current_info: &[DatabaseColumnInfo],
    table_id: i64,
    max_number_of_index: usize,
) -> Option<String> {
    create_alter_indices(
        &calculate_index_optimization(current_info, max_number_of_index),
        table_id,
    )
}

/// `SELECT COUNT(DISTINCT c) AS c, ... FROM T<id>`; `None` for no columns.
#[must_use]
pub fn create_cardinality_sql(info: &[DatabaseColumnInfo], table_id: i64) -> Option<String> {
    if info.is_empty() {
        return None;
    }
    let counts = info
        .iter()
        .map(|i| format!("COUNT(DISTINCT {0}) AS {0}", i.column_name))
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!("SELECT {counts} FROM {}", ddl::table_name(table_id)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
