//! Core data model for BioStatA tables.
//!
//! Everything here is database-free: column definitions and their SQL
//! projections, value dictionaries, the filter DSL and the `SELECT` builder.
//! `biostata-storage` executes the generated SQL against SQLite.

pub mod column;
pub mod dictionary;
mod error;
pub mod filter;
pub mod functions;
pub mod names;
pub mod query;
mod types;
mod value;

pub use column::{
    Column, ColumnKind, ColumnSet, ColumnState, ComputedColumn, GroupFunction, Representation,
    StoredColumn,
};
pub use dictionary::{Dictionary, DictionaryState, DictionaryStore, DictionaryType};
pub use error::{ModelError, ModelResult};
pub use filter::{
    compile_where_clause, filter_by_data_list, filter_by_values, simplify_integer_list,
    CloseParen, ColumnDescriptor, Concat, Filter, FilterBody, FilterEntry, FilterKey, IdItem,
    OpenParen, Operand, Operator, DEFAULT_MIN_RUN_LENGTH,
};
pub use functions::{FunctionId, Kwargs};
pub use names::{quote_ident, validate_name, ID_COLUMN};
pub use query::{SelectQuery, SortDirection};
pub use types::{PhysicalType, StorageType};
pub use value::{quote_literal, Value};
