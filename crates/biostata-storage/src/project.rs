use crate::config::ProjectConfig;
use crate::convert::{ConversionMode, ConversionReport, TableConversion};
use crate::functions;
use crate::schema;
use crate::source::{DerivedTable, PersistedTable, TableSource};
use crate::table::{DataTable, QueryOptions, TableViewState};
use biostata_model::names::validate_unique;
use biostata_model::{
    Column, ColumnState, Dictionary, DictionaryState, DictionaryStore, DictionaryType, Filter,
    FilterKey, ModelError, PhysicalType,
};
use rusqlite::config::DbConfig;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("table not found: {0}")]
    UnknownTable(String),
    #[error("filter not found: {0}")]
    UnknownFilter(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("invalid column: {0}")]
    InvalidColumn(String),
    #[error("dictionary {dictionary} is used by column {column} of table {table}")]
    DictionaryInUse {
        dictionary: String,
        table: String,
        column: String,
    },
    #[error("no conversion from {from} to {to} in {mode} mode")]
    UnmappedConversion {
        from: PhysicalType,
        to: PhysicalType,
        mode: ConversionMode,
    },
    #[error("row {row} has {actual} values, expected {expected}")]
    RowShape {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("row index {0} out of range")]
    RowOutOfRange(usize),
    #[error("column index {0} out of range")]
    ColumnOutOfRange(usize),
    #[error("no row with id {0}")]
    UnknownRow(i64),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A BioStatA project: one SQLite connection holding every table, dictionary
/// and named filter.
///
/// Custom SQL functions are registered on the connection when it is opened.
pub struct Project {
    conn: Connection,
    config: ProjectConfig,
    dictionaries: DictionaryStore,
    tables: Vec<DataTable>,
    named_filters: BTreeMap<String, Filter>,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("tables", &self.tables)
            .field("dictionaries", &self.dictionaries.names().collect::<Vec<_>>())
            .field("named_filters", &self.named_filters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Project {
    fn from_connection(conn: Connection, config: ProjectConfig) -> Result<Self> {
        conn.busy_timeout(config.busy_timeout)?;
        // A misspelled "identifier" must fail instead of reading as a text literal.
        conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DML, false)?;
        conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DDL, false)?;
        schema::init(&conn)?;
        functions::register(&conn)?;
        Ok(Self {
            conn,
            config,
            dictionaries: DictionaryStore::new(),
            tables: Vec::new(),
            named_filters: BTreeMap::new(),
        })
    }

    pub fn open_in_memory(config: ProjectConfig) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    /// Open (or create) a project file and restore whatever it holds.
    pub fn open_path(path: impl AsRef<Path>, config: ProjectConfig) -> Result<Self> {
        let mut project = Self::from_connection(Connection::open(path)?, config)?;
        project.restore()?;
        Ok(project)
    }

    /// Load an existing project file. Fails if the file does not exist.
    pub fn load(path: impl AsRef<Path>, config: ProjectConfig) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        let mut project = Self::from_connection(conn, config)?;
        project.restore()?;
        Ok(project)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn dictionaries(&self) -> &DictionaryStore {
        &self.dictionaries
    }

    pub fn dictionary(&self, name: &str) -> Option<&Arc<Dictionary>> {
        self.dictionaries.get(name)
    }

    pub fn add_dictionary(&mut self, dictionary: Dictionary) -> Result<Arc<Dictionary>> {
        validate_unique(dictionary.name(), self.dictionaries.names())?;
        Ok(self.dictionaries.insert(dictionary))
    }

    /// Replace a dictionary and re-point every column using it.
    pub fn replace_dictionary(&mut self, dictionary: Dictionary) -> Result<Arc<Dictionary>> {
        let current = self.dictionaries.require(dictionary.name())?;
        if current.dict_type() != dictionary.dict_type() {
            return Err(ModelError::DictionaryMismatch {
                column: current.physical_type().to_string(),
                dictionary: dictionary.name().to_string(),
            }
            .into());
        }
        let replacement = self.dictionaries.insert(dictionary);
        for table in &mut self.tables {
            table.columns_mut().rebind_dictionary(&replacement);
            table.update(&self.conn)?;
        }
        Ok(replacement)
    }

    /// Remove a dictionary no column refers to.
    pub fn remove_dictionary(&mut self, name: &str) -> Result<Arc<Dictionary>> {
        for table in &self.tables {
            if let Some(column) = table
                .columns()
                .iter()
                .find(|c| c.dictionary_name() == Some(name))
            {
                return Err(StorageError::DictionaryInUse {
                    dictionary: name.to_string(),
                    table: table.name().to_string(),
                    column: column.name().to_string(),
                });
            }
        }
        self.dictionaries
            .remove(name)
            .ok_or_else(|| ModelError::UnknownDictionary(name.to_string()).into())
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.tables.iter().map(DataTable::name)
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.tables
            .iter()
            .position(|t| t.name() == name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
    }

    pub fn table(&self, name: &str) -> Result<&DataTable> {
        Ok(&self.tables[self.position(name)?])
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut DataTable> {
        let idx = self.position(name)?;
        Ok(&mut self.tables[idx])
    }

    /// Run `f` with a table and the project connection.
    pub fn with_table<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut DataTable, &Connection) -> Result<R>,
    ) -> Result<R> {
        let idx = self.position(name)?;
        f(&mut self.tables[idx], &self.conn)
    }

    /// Re-run a table's view query.
    pub fn update(&mut self, name: &str) -> Result<()> {
        self.with_table(name, |table, conn| table.update(conn))
    }

    pub fn create_table(&mut self, name: &str, source: &dyn TableSource) -> Result<&mut DataTable> {
        validate_unique(name, self.table_names())?;
        let table = DataTable::create(&self.conn, name, source, &self.dictionaries, &self.config)?;
        self.tables.push(table);
        let idx = self.tables.len() - 1;
        Ok(&mut self.tables[idx])
    }

    /// Materialize the current (filtered, grouped) view of `source` as a new table.
    pub fn derive_table(&mut self, source: &str, new_name: &str) -> Result<&mut DataTable> {
        validate_unique(new_name, self.table_names())?;
        let src = self.table(source)?;
        let names: Vec<String> = src
            .visible_columns()
            .iter()
            .filter(|n| n.as_str() != biostata_model::ID_COLUMN)
            .cloned()
            .collect();
        let columns: Vec<Column> = names
            .iter()
            .map(|n| {
                let c = src.columns().require(n)?;
                Ok(Column::stored(c.name(), c.representation().clone())
                    .with_shortname(c.shortname())
                    .with_dim(c.dim())
                    .with_comment(c.comment()))
            })
            .collect::<std::result::Result<_, ModelError>>()?;
        let options = QueryOptions {
            columns: Some(names.clone()),
            ..QueryOptions::default()
        };
        let rows = src
            .query(&self.conn, &options)?
            .into_iter()
            .map(|row| {
                // A merged cell whose members disagreed is flagged.
                let status = (0..names.len())
                    .map(|i| {
                        row.status().get(i).copied().unwrap_or(false)
                            || row.distinct_counts().get(i).copied().flatten().unwrap_or(1) > 1
                    })
                    .collect();
                (row.values().to_vec(), status)
            })
            .collect();
        let derived = DerivedTable { columns, rows };
        self.create_table(new_name, &derived)
    }

    pub fn remove_table(&mut self, name: &str) -> Result<()> {
        let idx = self.position(name)?;
        self.tables[idx].drop_tables(&self.conn)?;
        self.tables.remove(idx);
        log::info!("removed table {name}");
        Ok(())
    }

    /// Apply a schema conversion. A conversion marking its table for removal
    /// removes the table.
    pub fn convert(&mut self, conversion: &TableConversion) -> Result<ConversionReport> {
        let idx = self.position(conversion.table())?;
        if conversion.is_table_removed() {
            self.remove_table(conversion.table())?;
            return Ok(ConversionReport::default());
        }
        let others: Vec<String> = self
            .tables
            .iter()
            .filter(|t| t.name() != conversion.table())
            .map(|t| t.name().to_string())
            .collect();
        conversion.validate(others.iter().map(String::as_str))?;
        conversion.apply(&self.conn, &mut self.tables[idx])
    }

    pub fn named_filter(&self, name: &str) -> Option<&Filter> {
        self.named_filters.get(name)
    }

    pub fn named_filter_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.named_filters.keys().map(String::as_str)
    }

    pub fn add_named_filter(&mut self, filter: Filter) -> Result<()> {
        let name = filter
            .name()
            .ok_or_else(|| StorageError::InvalidFilter(format!("{} has no name", filter.key())))?
            .to_string();
        validate_unique(&name, self.named_filters.keys().map(String::as_str))?;
        self.named_filters.insert(name, filter);
        Ok(())
    }

    /// Redefine a named filter; tables applying it pick up the new definition.
    pub fn replace_named_filter(&mut self, filter: Filter) -> Result<()> {
        let name = filter
            .name()
            .ok_or_else(|| StorageError::InvalidFilter(format!("{} has no name", filter.key())))?
            .to_string();
        if !self.named_filters.contains_key(&name) {
            return Err(StorageError::UnknownFilter(name));
        }
        for table in &mut self.tables {
            table.refresh_named_filter(&filter);
        }
        self.named_filters.insert(name, filter);
        Ok(())
    }

    /// Remove a named filter from the project and from every table applying it.
    pub fn remove_named_filter(&mut self, name: &str) -> Result<Filter> {
        let filter = self
            .named_filters
            .remove(name)
            .ok_or_else(|| StorageError::UnknownFilter(name.to_string()))?;
        let key = FilterKey::Named(name.to_string());
        for table in &mut self.tables {
            table.unapply_filter(&key);
        }
        Ok(filter)
    }

    pub fn apply_named_filter(&mut self, table: &str, name: &str) -> Result<()> {
        let filter = self
            .named_filters
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownFilter(name.to_string()))?;
        let table = self.table_mut(table)?;
        if !filter.is_applicable(table.columns()) {
            log::warn!("filter {name} does not apply to table {}", table.name());
        }
        table.apply_named_filter(filter);
        Ok(())
    }

    /// Write dirty tables and all metadata to the project database.
    pub fn save(&mut self) -> Result<()> {
        // Renamed tables may have swapped names; every old copy goes before
        // any new one is written.
        for table in &mut self.tables {
            table.drop_stale_persisted(&self.conn)?;
        }
        for table in &mut self.tables {
            if table.needs_full_rewrite() || table.persisted_name() != Some(table.name()) {
                table.write_to_original(&self.conn)?;
            }
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM _tables", [])?;
        tx.execute("DELETE FROM _columns", [])?;
        tx.execute("DELETE FROM _dictionaries", [])?;
        tx.execute("DELETE FROM _filters", [])?;

        for dictionary in self.dictionaries.iter() {
            tx.execute(
                "INSERT INTO _dictionaries (name, type, keys, vals, comments) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    dictionary.name(),
                    dictionary.physical_type().as_str(),
                    serde_json::to_value(dictionary.keys())?,
                    serde_json::to_value(dictionary.values())?,
                    serde_json::to_value(dictionary.comments())?,
                ],
            )?;
        }
        for (name, filter) in &self.named_filters {
            tx.execute(
                "INSERT INTO _filters (name, definition) VALUES (?1, ?2)",
                params![name, serde_json::to_value(filter)?],
            )?;
        }
        for (position, table) in self.tables.iter().enumerate() {
            tx.execute(
                "INSERT INTO _tables (name, position, comment, state) VALUES (?1, ?2, ?3, ?4)",
                params![
                    table.name(),
                    position as i64,
                    table.comment(),
                    serde_json::to_value(table.view_state())?,
                ],
            )?;
            for (position, state) in table.columns().states().iter().enumerate() {
                tx.execute(
                    "INSERT INTO _columns (table_name, position, name, type, dict, dim, shortname, comment, is_original, state)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        table.name(),
                        position as i64,
                        &state.name,
                        &state.physical_type,
                        &state.dict,
                        &state.dim,
                        &state.shortname,
                        &state.comment,
                        state.is_original,
                        serde_json::to_value(state)?,
                    ],
                )?;
            }
        }
        tx.commit()?;
        log::info!("saved project with {} tables", self.tables.len());
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        // Staging tables of a previous session are rebuilt from persisted tables.
        schema::drop_staging_tables(&self.conn)?;
        let dictionaries = {
            let mut stmt = self
                .conn
                .prepare("SELECT name, type, keys, vals, comments FROM _dictionaries ORDER BY name")?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, serde_json::Value>(2)?,
                    r.get::<_, serde_json::Value>(3)?,
                    r.get::<_, serde_json::Value>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (name, dict_type, keys, values, comments) = row?;
                let state = DictionaryState {
                    name,
                    dict_type: DictionaryType::for_physical(dict_type.parse()?)?,
                    keys: serde_json::from_value(keys)?,
                    values: serde_json::from_value(values)?,
                    comments: serde_json::from_value(comments)?,
                };
                out.push(Dictionary::try_from(state)?);
            }
            out
        };
        for dictionary in dictionaries {
            self.dictionaries.insert(dictionary);
        }

        let filters: Vec<(String, serde_json::Value)> = {
            let mut stmt = self.conn.prepare("SELECT name, definition FROM _filters ORDER BY name")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (name, definition) in filters {
            self.named_filters.insert(name, serde_json::from_value(definition)?);
        }

        let tables: Vec<(String, String, Option<serde_json::Value>)> = {
            let mut stmt = self
                .conn
                .prepare("SELECT name, comment, state FROM _tables ORDER BY position")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (name, comment, state) in tables {
            let states: Vec<ColumnState> = {
                let mut stmt = self
                    .conn
                    .prepare("SELECT state FROM _columns WHERE table_name = ?1 ORDER BY position")?;
                let rows = stmt.query_map([&name], |r| r.get::<_, serde_json::Value>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(serde_json::from_value(row?)?);
                }
                out
            };
            let source = PersistedTable {
                name: name.clone(),
                states,
            };
            let mut table =
                DataTable::create(&self.conn, &name, &source, &self.dictionaries, &self.config)?;
            table.set_comment(comment);
            if let Some(state) = state {
                let view: TableViewState = serde_json::from_value(state)?;
                table.restore_view_state(view);
            }
            table.set_persisted(Some(name.clone()), false);
            table.update(&self.conn)?;
            self.tables.push(table);
        }
        log::info!("loaded project with {} tables", self.tables.len());
        Ok(())
    }
}
