//! SQLite-backed tables for BioStatA projects.
//!
//! This crate executes the model from `biostata-model` against an embedded
//! SQLite connection. It exposes:
//! - the project meta schema (tables, column info, dictionaries, named filters)
//! - custom SQL functions (`category_group`, `bs_safe_int`, `bs_<function>`)
//! - the table/query compiler ([`DataTable`]) with grouping and drill-down
//! - the schema converter ([`TableConversion`]) with staging-table rebuilds
//! - the [`Project`] facade owning the connection

mod config;
pub mod convert;
pub mod functions;
pub mod project;
mod schema;
pub mod source;
pub mod table;

pub use config::ProjectConfig;
pub use convert::{
    dictionary_prototype, internal_repr_change_line, possible_conversions, ColumnConversion,
    ConversionMode, ConversionReport, DictionaryProposal, TableConversion,
};
pub use project::{Project, Result, StorageError};
pub use source::{PersistedTable, RawColumn, RawTable, TableSource};
pub use table::{
    CompiledQuery, DataTable, DistinctScope, Grouping, Ordering, QueryOptions, Row, RowLayout,
};
