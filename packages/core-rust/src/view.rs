//! SQL that materializes a view table from entity replication.
//!
//! Entity-field columns read straight from the replication alias `R`; every
//! other column becomes a `LEFT OUTER JOIN` on the annotation replication
//! table, aliased `A<i>` by column position.

use crate::codec;
use crate::ddl::{self, ROW_BENEFACTOR, ROW_ETAG, ROW_ID, ROW_VERSION};
use crate::types::{ColumnModel, ColumnType, ViewTypeMask};

pub const ENTITY_REPLICATION_TABLE: &str = "ENTITY_REPLICATION";
pub const ENTITY_REPLICATION_ALIAS: &str = "R";
pub const ANNOTATION_REPLICATION_TABLE: &str = "ANNOTATION_REPLICATION";
pub const ANNOTATION_ALIAS_PREFIX: &str = "A";

pub const ENTITY_REPLICATION_COL_ID: &str = "ID";
pub const ENTITY_REPLICATION_COL_VERSION: &str = "CURRENT_VERSION";
pub const ENTITY_REPLICATION_COL_ETAG: &str = "ETAG";
pub const ENTITY_REPLICATION_COL_BENEFACTOR_ID: &str = "BENEFACTOR_ID";
pub const ENTITY_REPLICATION_COL_PARENT_ID: &str = "PARENT_ID";
pub const ENTITY_REPLICATION_COL_TYPE: &str = "TYPE";
pub const ANNOTATION_REPLICATION_COL_ENTITY_ID: &str = "ENTITY_ID";
pub const ANNOTATION_REPLICATION_COL_KEY: &str = "ANNO_KEY";

/// Named parameter carrying the expanded container ids.
pub const SCOPE_PARAMETER: &str = "parentIds";

/// Entity attributes available to every view without an annotation join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityField {
    Id,
    Name,
    CreatedOn,
    CreatedBy,
    Etag,
    Type,
    CurrentVersion,
    ParentId,
    BenefactorId,
    ProjectId,
    ModifiedOn,
    ModifiedBy,
    DataFileHandleId,
}

impl EntityField {
    pub const ALL: [EntityField; 13] = [
        EntityField::Id,
        EntityField::Name,
        EntityField::CreatedOn,
        EntityField::CreatedBy,
        EntityField::Etag,
        EntityField::Type,
        EntityField::CurrentVersion,
        EntityField::ParentId,
        EntityField::BenefactorId,
        EntityField::ProjectId,
        EntityField::ModifiedOn,
        EntityField::ModifiedBy,
        EntityField::DataFileHandleId,
    ];

    /// Column name as seen by users.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            EntityField::Id => "id",
            EntityField::Name => "name",
            EntityField::CreatedOn => "createdOn",
            EntityField::CreatedBy => "createdBy",
            EntityField::Etag => "etag",
            EntityField::Type => "type",
            EntityField::CurrentVersion => "currentVersion",
            EntityField::ParentId => "parentId",
            EntityField::BenefactorId => "benefactorId",
            EntityField::ProjectId => "projectId",
            EntityField::ModifiedOn => "modifiedOn",
            EntityField::ModifiedBy => "modifiedBy",
            EntityField::DataFileHandleId => "dataFileHandleId",
        }
    }

    /// Column of the entity replication table.
    #[must_use]
    pub fn database_column_name(self) -> &'static str {
        match self {
            EntityField::Id => ENTITY_REPLICATION_COL_ID,
            EntityField::Name => "NAME",
            EntityField::CreatedOn => "CREATED_ON",
            EntityField::CreatedBy => "CREATED_BY",
            EntityField::Etag => ENTITY_REPLICATION_COL_ETAG,
            EntityField::Type => ENTITY_REPLICATION_COL_TYPE,
            EntityField::CurrentVersion => ENTITY_REPLICATION_COL_VERSION,
            EntityField::ParentId => ENTITY_REPLICATION_COL_PARENT_ID,
            EntityField::BenefactorId => ENTITY_REPLICATION_COL_BENEFACTOR_ID,
            EntityField::ProjectId => "PROJECT_ID",
            EntityField::ModifiedOn => "MODIFIED_ON",
            EntityField::ModifiedBy => "MODIFIED_BY",
            EntityField::DataFileHandleId => "FILE_ID",
        }
    }

    #[must_use]
    pub fn column_type(self) -> ColumnType {
        match self {
            EntityField::Id
            | EntityField::ParentId
            | EntityField::BenefactorId
            | EntityField::ProjectId => ColumnType::EntityId,
            EntityField::Name | EntityField::Etag | EntityField::Type => ColumnType::String,
            EntityField::CreatedOn | EntityField::ModifiedOn => ColumnType::Date,
            EntityField::CreatedBy | EntityField::ModifiedBy => ColumnType::UserId,
            EntityField::CurrentVersion => ColumnType::Integer,
            EntityField::DataFileHandleId => ColumnType::FileHandleId,
        }
    }

    #[must_use]
    pub fn maximum_size(self) -> Option<u32> {
        match self {
            EntityField::Name => Some(256),
            EntityField::Etag => Some(36),
            EntityField::Type => Some(20),
            _ => None,
        }
    }

    /// Column model for this field. The id is left at zero for the caller
    /// to assign.
    #[must_use]
    pub fn column_model(self) -> ColumnModel {
        let model = ColumnModel::new(0, self.name(), self.column_type());
        match self.maximum_size() {
            Some(size) => model.with_maximum_size(size),
            None => model,
        }
    }

    /// Field whose name and type both match `column`.
    #[must_use]
    pub fn find_match(column: &ColumnModel) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name() == column.name && f.column_type() == column.column_type)
    }
}

/// Where one view column is selected from.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMetadata {
    pub column: ColumnModel,
    pub entity_field: Option<EntityField>,
    pub table_alias: String,
    pub select_column_name: &'static str,
    pub column_name_for_id: String,
    pub column_index: usize,
}

impl ColumnMetadata {
    #[must_use]
    pub fn is_annotation(&self) -> bool {
        self.entity_field.is_none()
    }
}

#[must_use]
pub fn translate_column(column: &ColumnModel, index: usize) -> ColumnMetadata {
    let entity_field = EntityField::find_match(column);
    let (table_alias, select_column_name) = match entity_field {
        Some(field) => (
            ENTITY_REPLICATION_ALIAS.to_string(),
            field.database_column_name(),
        ),
        None => (
            format!("{ANNOTATION_ALIAS_PREFIX}{index}"),
            codec::type_info(column.column_type).annotation_value_column,
        ),
    };
    ColumnMetadata {
        column: column.clone(),
        entity_field,
        table_alias,
        select_column_name,
        column_name_for_id: ddl::column_name_for_id(column.id),
        column_index: index,
    }
}

#[must_use]
pub fn translate_columns(schema: &[ColumnModel]) -> Vec<ColumnMetadata> {
    schema
        .iter()
        .enumerate()
        .map(|(i, c)| translate_column(c, i))
        .collect()
}

/// `ROW_ID, ROW_VERSION, ROW_ETAG, ROW_BENEFACTOR, ...` with each double's
/// companion ahead of its primary column.
#[must_use]
pub fn build_insert_values(meta: &[ColumnMetadata]) -> String {
    let mut names = vec![ROW_ID, ROW_VERSION, ROW_ETAG, ROW_BENEFACTOR]
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    for m in meta {
        if m.column.column_type.is_double() {
            names.push(ddl::double_column_name(m.column.id));
        }
        names.push(m.column_name_for_id.clone());
    }
    names.join(", ")
}

#[must_use]
pub fn build_select(meta: &[ColumnMetadata]) -> String {
    let r = ENTITY_REPLICATION_ALIAS;
    let mut items = vec![
        format!("{r}.{ENTITY_REPLICATION_COL_ID}"),
        format!("{r}.{ENTITY_REPLICATION_COL_VERSION}"),
        format!("{r}.{ENTITY_REPLICATION_COL_ETAG}"),
        format!("{r}.{ENTITY_REPLICATION_COL_BENEFACTOR_ID}"),
    ];
    for m in meta {
        if m.is_annotation() && m.column.column_type.is_double() {
            items.push(format!(
                "{}.{} AS {}",
                m.table_alias,
                codec::ANNOTATION_DOUBLE_ABSTRACT,
                ddl::double_column_name(m.column.id)
            ));
        }
        items.push(format!(
            "{}.{} AS {}",
            m.table_alias, m.select_column_name, m.column_name_for_id
        ));
    }
    items.join(", ")
}

/// One `LEFT OUTER JOIN` per annotation column; empty without annotations.
#[must_use]
pub fn build_joins(meta: &[ColumnMetadata]) -> String {
    let mut sql = String::new();
    for m in meta.iter().filter(|m| m.is_annotation()) {
        let alias = &m.table_alias;
        sql.push_str(&format!(
            " LEFT OUTER JOIN {ANNOTATION_REPLICATION_TABLE} {alias} ON ({ENTITY_REPLICATION_ALIAS}.{ENTITY_REPLICATION_COL_ID} = {alias}.{ANNOTATION_REPLICATION_COL_ENTITY_ID} AND {alias}.{ANNOTATION_REPLICATION_COL_KEY} = {})",
            codec::quote_string(&m.column.name)
        ));
    }
    sql
}

/// `TYPE IN ('file','table')`.
#[must_use]
pub fn create_view_type_filter(view_type: ViewTypeMask) -> String {
    let tags = view_type
        .tags()
        .iter()
        .map(|t| format!("'{}'", t.name()))
        .collect::<Vec<_>>()
        .join(",");
    format!("{ENTITY_REPLICATION_COL_TYPE} IN ({tags})")
}

/// Project views match on the entity's own id, every other view on its
/// parent container.
#[must_use]
pub fn view_scope_filter_column(view_type: ViewTypeMask) -> &'static str {
    if view_type.is_project() {
        ENTITY_REPLICATION_COL_ID
    } else {
        ENTITY_REPLICATION_COL_PARENT_ID
    }
}

/// `INSERT INTO T<id>(...) SELECT ... FROM ENTITY_REPLICATION R ...` binding
/// the expanded scope to `:parentIds`.
#[must_use]
pub fn create_select_insert_from_entity_replication(
    view_id: i64,
    view_type: ViewTypeMask,
    schema: &[ColumnModel],
) -> String {
    let meta = translate_columns(schema);
    format!(
        "INSERT INTO {}({}) SELECT {} FROM {ENTITY_REPLICATION_TABLE} {ENTITY_REPLICATION_ALIAS}{} WHERE {ENTITY_REPLICATION_ALIAS}.{} IN (:{SCOPE_PARAMETER}) AND {}",
        ddl::table_name(view_id),
        build_insert_values(&meta),
        build_select(&meta),
        build_joins(&meta),
        view_scope_filter_column(view_type),
        create_view_type_filter(view_type)
    )
}

/// Checksum of the materialized view table.
#[must_use]
pub fn build_table_view_crc32_sql(view_id: i64) -> String {
    format!(
        "SELECT SUM(CRC32(CONCAT({ROW_ID}, '-', {ROW_ETAG}, '-', {ROW_BENEFACTOR}))) FROM {}",
        ddl::table_name(view_id)
    )
}

/// Checksum of the replicated rows a view would be built from.
#[must_use]
pub fn calculate_crc32_sql(view_type: ViewTypeMask) -> String {
    format!(
        "SELECT SUM(CRC32(CONCAT({ENTITY_REPLICATION_COL_ID}, '-',{ENTITY_REPLICATION_COL_ETAG}, '-', {ENTITY_REPLICATION_COL_BENEFACTOR_ID}))) FROM {ENTITY_REPLICATION_TABLE} WHERE {} AND {} IN (:{SCOPE_PARAMETER})",
        create_view_type_filter(view_type),
        view_scope_filter_column(view_type)
    )
}

/// Actionable explanation for a failed view population.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViewPopulationError {
    #[error(
        "The size of the column '{column}' is too small.  The column size needs to be at least {minimum_size} characters."
    )]
    ColumnTooSmall { column: String, minimum_size: u32 },
    #[error(
        "Cannot insert an annotation value of type {annotation_type} into column '{column}' which is of type {column_type}."
    )]
    TypeMismatch {
        column: String,
        annotation_type: ColumnType,
        column_type: ColumnType,
    },
}

/// Compares one view column against the shape of an annotation with the
/// same name. `Ok` means this pair does not explain the failure.
///
/// # Errors
///
/// Returns the [`ViewPopulationError`] the pair explains.
pub fn determine_cause(
    column: &ColumnModel,
    annotation: &ColumnModel,
) -> Result<(), ViewPopulationError> {
    if column.name != annotation.name {
        return Ok(());
    }
    if column.column_type == ColumnType::Boolean && annotation.column_type != ColumnType::Boolean {
        return Err(ViewPopulationError::TypeMismatch {
            column: column.name.clone(),
            annotation_type: annotation.column_type,
            column_type: column.column_type,
        });
    }
    if column.column_type != annotation.column_type {
        return Ok(());
    }
    if let (Some(size), Some(needed)) = (column.maximum_size, annotation.maximum_size) {
        if needed > size {
            return Err(ViewPopulationError::ColumnTooSmall {
                column: column.name.clone(),
                minimum_size: needed,
            });
        }
    }
    Ok(())
}

/// First explanation found across every column and annotation pair.
///
/// # Errors
///
/// Returns the first [`ViewPopulationError`] found.
pub fn determine_cause_of_exception(
    columns: &[ColumnModel],
    annotations: &[ColumnModel],
) -> Result<(), ViewPopulationError> {
    for column in columns {
        for annotation in annotations {
            determine_cause(column, annotation)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn create_column(id: i64) -> ColumnModel {
        ColumnModel::new(id, format!("col_{id}"), ColumnType::String).with_maximum_size(50)
    }

    fn field(f: EntityField, id: i64) -> ColumnModel {
        let mut cm = f.column_model();
        cm.id = id;
        cm
    }

    #[test]
    fn translate_entity_field() {
        let cm = field(EntityField::BenefactorId, 123);
        let meta = translate_column(&cm, 4);
        assert_eq!(meta.column_index, 4);
        assert_eq!(meta.column_name_for_id, "_C123_");
        assert_eq!(meta.entity_field, Some(EntityField::BenefactorId));
        assert_eq!(meta.table_alias, "R");
        assert_eq!(meta.select_column_name, "BENEFACTOR_ID");
    }

    #[test]
    fn translate_annotation() {
        let cm = ColumnModel::new(123, "foo", ColumnType::String).with_maximum_size(50);
        let meta = translate_column(&cm, 4);
        assert_eq!(meta.entity_field, None);
        assert_eq!(meta.table_alias, "A4");
        assert_eq!(meta.select_column_name, "STRING_VALUE");
    }

    #[test]
    fn name_match_alone_is_not_an_entity_field() {
        let cm = ColumnModel::new(1, "id", ColumnType::String);
        assert_eq!(EntityField::find_match(&cm), None);
    }

    #[test]
    fn insert_values_put_companion_first() {
        let three = ColumnModel::new(3, "three", ColumnType::Double);
        let schema = vec![field(EntityField::BenefactorId, 1), create_column(2), three];
        assert_eq!(
            build_insert_values(&translate_columns(&schema)),
            "ROW_ID, ROW_VERSION, ROW_ETAG, ROW_BENEFACTOR, _C1_, _C2_, _DBL_C3_, _C3_"
        );
    }

    #[test]
    fn select_each_column_type() {
        let schema: Vec<ColumnModel> = ColumnType::ALL
            .iter()
            .zip(0..)
            .map(|(t, i)| ColumnModel::new(i, t.name().to_lowercase(), *t))
            .collect();
        assert_eq!(
            build_select(&translate_columns(&schema)),
            "R.ID, R.CURRENT_VERSION, R.ETAG, R.BENEFACTOR_ID, \
             A0.STRING_VALUE AS _C0_, \
             A1.DOUBLE_ABSTRACT AS _DBL_C1_, A1.DOUBLE_VALUE AS _C1_, \
             A2.LONG_VALUE AS _C2_, \
             A3.BOOLEAN_VALUE AS _C3_, \
             A4.LONG_VALUE AS _C4_, \
             A5.LONG_VALUE AS _C5_, \
             A6.LONG_VALUE AS _C6_, \
             A7.STRING_VALUE AS _C7_, \
             A8.STRING_VALUE AS _C8_, \
             A9.LONG_VALUE AS _C9_"
        );
    }

    #[test]
    fn select_each_entity_field() {
        let schema: Vec<ColumnModel> = EntityField::ALL
            .iter()
            .zip(0..)
            .map(|(f, i)| field(*f, i))
            .collect();
        assert_eq!(
            build_select(&translate_columns(&schema)),
            "R.ID, R.CURRENT_VERSION, R.ETAG, R.BENEFACTOR_ID, \
             R.ID AS _C0_, R.NAME AS _C1_, R.CREATED_ON AS _C2_, R.CREATED_BY AS _C3_, \
             R.ETAG AS _C4_, R.TYPE AS _C5_, R.CURRENT_VERSION AS _C6_, R.PARENT_ID AS _C7_, \
             R.BENEFACTOR_ID AS _C8_, R.PROJECT_ID AS _C9_, R.MODIFIED_ON AS _C10_, \
             R.MODIFIED_BY AS _C11_, R.FILE_ID AS _C12_"
        );
    }

    #[test]
    fn joins() {
        let none = vec![field(EntityField::BenefactorId, 1), field(EntityField::Id, 2)];
        assert_eq!(build_joins(&translate_columns(&none)), "");

        let one = vec![field(EntityField::BenefactorId, 1), create_column(2)];
        assert_eq!(
            build_joins(&translate_columns(&one)),
            " LEFT OUTER JOIN ANNOTATION_REPLICATION A1 ON (R.ID = A1.ENTITY_ID AND A1.ANNO_KEY = 'col_2')"
        );

        let two = vec![
            create_column(1),
            ColumnModel::new(2, "col_2", ColumnType::Integer),
        ];
        assert_eq!(
            build_joins(&translate_columns(&two)),
            " LEFT OUTER JOIN ANNOTATION_REPLICATION A0 ON (R.ID = A0.ENTITY_ID AND A0.ANNO_KEY = 'col_1') \
             LEFT OUTER JOIN ANNOTATION_REPLICATION A1 ON (R.ID = A1.ENTITY_ID AND A1.ANNO_KEY = 'col_2')"
        );
    }

    #[test]
    fn view_type_filter() {
        assert_eq!(create_view_type_filter(ViewTypeMask::FILE), "TYPE IN ('file')");
        assert_eq!(create_view_type_filter(ViewTypeMask::PROJECT), "TYPE IN ('project')");
        assert_eq!(
            create_view_type_filter(ViewTypeMask::FILE_AND_TABLE),
            "TYPE IN ('file','table')"
        );
        assert_eq!(view_scope_filter_column(ViewTypeMask::PROJECT), "ID");
        assert_eq!(view_scope_filter_column(ViewTypeMask::FILE), "PARENT_ID");
        assert_eq!(view_scope_filter_column(ViewTypeMask::FILE_AND_TABLE), "PARENT_ID");
    }

    #[test]
    fn select_insert_file_view() {
        let schema = vec![create_column(1), field(EntityField::Id, 2)];
        assert_eq!(
            create_select_insert_from_entity_replication(123, ViewTypeMask::FILE, &schema),
            "INSERT INTO T123(ROW_ID, ROW_VERSION, ROW_ETAG, ROW_BENEFACTOR, _C1_, _C2_) \
             SELECT R.ID, R.CURRENT_VERSION, R.ETAG, R.BENEFACTOR_ID, A0.STRING_VALUE AS _C1_, R.ID AS _C2_ \
             FROM ENTITY_REPLICATION R \
             LEFT OUTER JOIN ANNOTATION_REPLICATION A0 ON (R.ID = A0.ENTITY_ID AND A0.ANNO_KEY = 'col_1') \
             WHERE R.PARENT_ID IN (:parentIds) AND TYPE IN ('file')"
        );
    }

    #[test]
    fn select_insert_project_view_scopes_on_id() {
        let schema = vec![create_column(1), field(EntityField::Id, 2)];
        let sql = create_select_insert_from_entity_replication(123, ViewTypeMask::PROJECT, &schema);
        assert!(sql.ends_with("WHERE R.ID IN (:parentIds) AND TYPE IN ('project')"));
    }

    #[test]
    fn select_insert_with_double() {
        let schema = vec![ColumnModel::new(3, "doubleAnnotation", ColumnType::Double)];
        assert_eq!(
            create_select_insert_from_entity_replication(123, ViewTypeMask::FILE, &schema),
            "INSERT INTO T123(ROW_ID, ROW_VERSION, ROW_ETAG, ROW_BENEFACTOR, _DBL_C3_, _C3_) \
             SELECT R.ID, R.CURRENT_VERSION, R.ETAG, R.BENEFACTOR_ID, \
             A0.DOUBLE_ABSTRACT AS _DBL_C3_, A0.DOUBLE_VALUE AS _C3_ \
             FROM ENTITY_REPLICATION R \
             LEFT OUTER JOIN ANNOTATION_REPLICATION A0 ON (R.ID = A0.ENTITY_ID AND A0.ANNO_KEY = 'doubleAnnotation') \
             WHERE R.PARENT_ID IN (:parentIds) AND TYPE IN ('file')"
        );
    }

    #[test]
    fn crc_statements() {
        assert_eq!(
            build_table_view_crc32_sql(123),
            "SELECT SUM(CRC32(CONCAT(ROW_ID, '-', ROW_ETAG, '-', ROW_BENEFACTOR))) FROM T123"
        );
        assert_eq!(
            calculate_crc32_sql(ViewTypeMask::PROJECT),
            "SELECT SUM(CRC32(CONCAT(ID, '-',ETAG, '-', BENEFACTOR_ID))) \
             FROM ENTITY_REPLICATION WHERE TYPE IN ('project') AND ID IN (:parentIds)"
        );
        assert_eq!(
            calculate_crc32_sql(ViewTypeMask::FILE_AND_TABLE),
            "SELECT SUM(CRC32(CONCAT(ID, '-',ETAG, '-', BENEFACTOR_ID))) \
             FROM ENTITY_REPLICATION WHERE TYPE IN ('file','table') AND PARENT_ID IN (:parentIds)"
        );
    }

    fn sized(name: &str, column_type: ColumnType, size: Option<u32>) -> ColumnModel {
        let cm = ColumnModel::new(1, name, column_type);
        match size {
            Some(s) => cm.with_maximum_size(s),
            None => cm,
        }
    }

    #[test]
    fn cause_column_too_small() {
        let err = determine_cause(
            &sized("foo", ColumnType::String, Some(10)),
            &sized("foo", ColumnType::String, Some(11)),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The size of the column 'foo' is too small.  The column size needs to be at least 11 characters."
        );
    }

    #[test]
    fn cause_not_found_for_unrelated_pairs() {
        let column = sized("foo", ColumnType::String, Some(10));
        assert!(determine_cause(&column, &sized("foo", ColumnType::String, Some(10))).is_ok());
        assert!(determine_cause(&column, &sized("bar", ColumnType::String, Some(11))).is_ok());
        assert!(determine_cause(&column, &sized("foo", ColumnType::Integer, Some(11))).is_ok());
    }

    #[test]
    fn cause_boolean_from_string() {
        let err = determine_cause(
            &sized("foo", ColumnType::Boolean, None),
            &sized("foo", ColumnType::String, Some(11)),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot insert an annotation value of type STRING into column 'foo' which is of type BOOLEAN."
        );
    }

    #[test]
    fn cause_searches_all_annotations() {
        let columns = vec![sized("foo", ColumnType::String, Some(10))];
        let annotations = vec![
            sized("foo", ColumnType::Integer, None),
            sized("foo", ColumnType::String, Some(11)),
        ];
        assert!(matches!(
            determine_cause_of_exception(&columns, &annotations),
            Err(ViewPopulationError::ColumnTooSmall { minimum_size: 11, .. })
        ));
    }
}
