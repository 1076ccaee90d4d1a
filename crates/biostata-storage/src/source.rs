//! Table sources: where a new table's columns and rows come from.
use crate::project::{Result, StorageError};
use crate::table::DataTable;
use biostata_model::{
    quote_ident, Column, ColumnSet, ColumnState, DictionaryStore, PhysicalType, Representation,
    Value,
};
use rusqlite::Connection;

/// Populates a freshly created table.
///
/// `init_columns` runs first and returns the full column set (`ColumnSet::new`
/// already holds `id`); `fill` then loads rows into the table's staging table.
pub trait TableSource {
    fn init_columns(&self, dictionaries: &DictionaryStore) -> Result<ColumnSet>;
    fn fill(&self, conn: &Connection, table: &DataTable) -> Result<()>;
}

/// Column format handed over by an import adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct RawColumn {
    pub name: String,
    pub physical_type: PhysicalType,
    pub dict: Option<String>,
    pub shortname: String,
    pub dim: String,
    pub comment: String,
}

impl RawColumn {
    pub fn new(name: impl Into<String>, physical_type: PhysicalType) -> Self {
        Self {
            name: name.into(),
            physical_type,
            dict: None,
            shortname: String::new(),
            dim: String::new(),
            comment: String::new(),
        }
    }

    pub fn with_dictionary(mut self, dict: impl Into<String>) -> Self {
        self.dict = Some(dict.into());
        self
    }

    /// Display label; defaults to the column name.
    pub fn with_shortname(mut self, shortname: impl Into<String>) -> Self {
        self.shortname = shortname.into();
        self
    }

    pub fn with_dim(mut self, dim: impl Into<String>) -> Self {
        self.dim = dim.into();
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

/// Rows × columns of raw values. Ids are assigned `1..=n` in row order and
/// every value is coerced through its column's representation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawTable {
    columns: Vec<RawColumn>,
    rows: Vec<Vec<Value>>,
}

impl RawTable {
    pub fn new(columns: Vec<RawColumn>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Vec<Value>>) -> Self {
        self.rows = rows;
        self
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[RawColumn] {
        &self.columns
    }
}

impl TableSource for RawTable {
    fn init_columns(&self, dictionaries: &DictionaryStore) -> Result<ColumnSet> {
        let mut set = ColumnSet::new();
        for raw in &self.columns {
            let dictionary = match (&raw.dict, raw.physical_type.uses_dictionary()) {
                (Some(name), true) => Some(dictionaries.require(name)?),
                _ => None,
            };
            let repr = Representation::for_type(raw.physical_type, dictionary)?;
            let mut column = Column::stored(raw.name.clone(), repr)
                .with_dim(raw.dim.clone())
                .with_comment(raw.comment.clone());
            if !raw.shortname.is_empty() {
                column.set_shortname(raw.shortname.clone());
            }
            set.add(column)?;
        }
        Ok(set)
    }

    fn fill(&self, conn: &Connection, table: &DataTable) -> Result<()> {
        for (i, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(StorageError::RowShape {
                    row: i,
                    expected: self.columns.len(),
                    actual: row.len(),
                });
            }
        }
        // Map the import column order onto the table's stored order.
        let order: Vec<Option<usize>> = table
            .columns()
            .stored()
            .map(|c| self.columns.iter().position(|r| r.name == c.name()))
            .collect();
        let rows = self.rows.iter().enumerate().map(|(i, row)| {
            let values = order
                .iter()
                .map(|idx| match idx {
                    Some(j) => row[*j].clone(),
                    None => Value::Integer(i as i64 + 1),
                })
                .collect();
            (values, Vec::new())
        });
        let n = table.insert_rows(conn, rows)?;
        log::debug!("imported {n} rows into {}", table.name());
        Ok(())
    }
}

/// A table previously written by `DataTable::write_to_original`.
#[derive(Clone, Debug)]
pub struct PersistedTable {
    pub name: String,
    pub states: Vec<ColumnState>,
}

impl TableSource for PersistedTable {
    fn init_columns(&self, dictionaries: &DictionaryStore) -> Result<ColumnSet> {
        Ok(ColumnSet::restore(&self.states, dictionaries)?)
    }

    fn fill(&self, conn: &Connection, table: &DataTable) -> Result<()> {
        let cols = DataTable::stored_column_list(table.columns()).join(", ");
        conn.execute(
            &format!(
                "INSERT INTO {} ({cols}) SELECT {cols} FROM {}",
                quote_ident(table.staging_name()),
                quote_ident(&self.name)
            ),
            [],
        )?;
        Ok(())
    }
}

/// Snapshot of another table's view, materialized as stored columns.
#[derive(Clone, Debug)]
pub(crate) struct DerivedTable {
    pub columns: Vec<Column>,
    /// Values and status flags per row, aligned with `columns`.
    pub rows: Vec<(Vec<Value>, Vec<bool>)>,
}

impl TableSource for DerivedTable {
    fn init_columns(&self, _dictionaries: &DictionaryStore) -> Result<ColumnSet> {
        let mut set = ColumnSet::new();
        for column in &self.columns {
            set.add(column.clone())?;
        }
        Ok(set)
    }

    fn fill(&self, conn: &Connection, table: &DataTable) -> Result<()> {
        let order: Vec<Option<usize>> = table
            .columns()
            .stored()
            .map(|c| self.columns.iter().position(|d| d.name() == c.name()))
            .collect();
        let rows = self.rows.iter().enumerate().map(|(i, (values, status))| {
            let mut out_values = Vec::with_capacity(order.len());
            let mut out_status = Vec::with_capacity(order.len());
            for idx in &order {
                match idx {
                    Some(j) => {
                        out_values.push(values[*j].clone());
                        out_status.push(status.get(*j).copied().unwrap_or(false));
                    }
                    None => {
                        out_values.push(Value::Integer(i as i64 + 1));
                        out_status.push(false);
                    }
                }
            }
            (out_values, out_status)
        });
        table.insert_rows(conn, rows)?;
        Ok(())
    }
}
