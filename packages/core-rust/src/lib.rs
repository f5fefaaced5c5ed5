//! `tabledex` core: column model, value codec, physical DDL, index
//! optimization, view materialization SQL and the restricted SQL dialect.
//!
//! Everything here is synchronous and free of I/O; the server crate runs
//! the generated SQL.

pub mod clock;
pub mod codec;
pub mod ddl;
pub mod hash;
pub mod index;
pub mod query;
pub mod types;
pub mod view;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use codec::{type_info, CodecError, DbValue};
pub use ddl::{ColumnChangeDetails, RowWrite, SchemaError};
pub use index::{DatabaseColumnInfo, IndexChange};
pub use query::{QueryError, SqlQuery};
pub use types::{
    ColumnModel, ColumnType, EntityTypeTag, FacetType, ObjectType, SelectColumn, TableState,
    TableStatus, ViewTypeMask,
};
