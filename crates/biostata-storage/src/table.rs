//! Table/query compiler.
//!
//! A [`DataTable`] owns the column collection, the view configuration
//! (visible columns, grouping, ordering, filters) and the staging table that
//! holds the stored columns. Every read goes through [`DataTable::compile_query`];
//! [`DataTable::update`] is the only place materialized rows change.
use crate::config::ProjectConfig;
use crate::functions::{from_value_ref, to_sql_value};
use crate::project::{Result, StorageError};
use crate::schema;
use crate::source::TableSource;
use biostata_model::filter::where_condition;
use biostata_model::{
    filter_by_data_list, filter_by_values, quote_ident, validate_name, Column, ColumnDescriptor,
    ColumnSet, Concat, DictionaryStore, Filter, FilterKey, SelectQuery, SortDirection, Value,
    ID_COLUMN,
};
use lru::LruCache;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
    /// One row per table row.
    #[default]
    None,
    /// A single group holding every (filtered) row.
    All,
    /// Group by the listed columns.
    Columns(Vec<String>),
}

impl Grouping {
    pub fn is_grouped(&self) -> bool {
        !matches!(self, Grouping::None)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ordering {
    pub column: String,
    pub direction: SortDirection,
}

/// Knobs of [`DataTable::compile_query`]. `None` fields fall back to the
/// table's own configuration.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub columns: Option<Vec<String>>,
    /// Add one status projection per column.
    pub status_adds: bool,
    pub filters: Option<Vec<Filter>>,
    pub grouping: Option<Grouping>,
    /// Add the distinct counts, the representative id and the member count.
    pub group_adds: bool,
    /// Alias every column projection as `<prefix><column name>` when non-empty.
    pub auto_alias: String,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            columns: None,
            status_adds: true,
            filters: None,
            grouping: None,
            group_adds: true,
            auto_alias: String::new(),
        }
    }
}

/// Where each part of a result row lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowLayout {
    pub columns: Vec<String>,
    pub status: bool,
    /// Result offset of the `COUNT(DISTINCT ...)` of each category column.
    pub distinct: Vec<Option<usize>>,
    /// Result offset of the representative id; the member count follows it.
    pub group: Option<usize>,
}

/// A compiled query together with the layout needed to decode its rows.
#[derive(Clone, Debug)]
pub struct CompiledQuery {
    pub query: SelectQuery,
    pub layout: RowLayout,
}

impl CompiledQuery {
    pub fn sql(&self) -> String {
        self.query.to_sql()
    }
}

/// One materialized result row.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    status: Vec<bool>,
    distinct: Vec<Option<i64>>,
    id: Option<i64>,
    members: i64,
}

impl Row {
    fn decode(row: &rusqlite::Row<'_>, layout: &RowLayout) -> rusqlite::Result<Self> {
        let n = layout.columns.len();
        let mut values = Vec::with_capacity(n);
        for i in 0..n {
            values.push(from_value_ref(row.get_ref(i)?));
        }
        let mut status = Vec::new();
        if layout.status {
            for i in n..2 * n {
                status.push(from_value_ref(row.get_ref(i)?).as_i64().unwrap_or(0) != 0);
            }
        }
        let mut distinct = Vec::with_capacity(n);
        for offset in &layout.distinct {
            distinct.push(match offset {
                Some(i) => from_value_ref(row.get_ref(*i)?).as_i64(),
                None => None,
            });
        }
        let (id, members) = match layout.group {
            Some(i) => (
                from_value_ref(row.get_ref(i)?).as_i64(),
                from_value_ref(row.get_ref(i + 1)?).as_i64().unwrap_or(0),
            ),
            None => (None, 1),
        };
        Ok(Self {
            values,
            status,
            distinct,
            id,
            members,
        })
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Status flags aligned with [`Row::values`]; empty without status columns.
    pub fn status(&self) -> &[bool] {
        &self.status
    }

    /// `COUNT(DISTINCT ...)` per value; `None` for data columns and ungrouped rows.
    pub fn distinct_counts(&self) -> &[Option<i64>] {
        &self.distinct
    }

    /// Representative id (the smallest member id for groups).
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    /// Number of table rows merged into this row.
    pub fn n_sub_values(&self) -> i64 {
        self.members
    }
}

/// Which rows [`DataTable::distinct_values`] looks at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistinctScope {
    /// Every row of the staging table.
    Global,
    /// Only rows passing the active filters.
    Filtered,
    /// The values shown by the current (filtered, grouped) view.
    View,
}

/// Grouping and filters the materialized rows were computed with.
#[derive(Clone, Debug)]
struct ShownView {
    grouping: Grouping,
    filters: Vec<Filter>,
}

pub struct DataTable {
    name: String,
    comment: String,
    staging: String,
    columns: ColumnSet,
    visible: Vec<String>,
    grouping: Grouping,
    ordering: Option<Ordering>,
    anonymous_filters: Vec<Filter>,
    /// Copies of the project-wide filters applied to this table.
    named_filters: Vec<Filter>,
    used_filters: Vec<FilterKey>,
    rows: Vec<Row>,
    layout: Option<RowLayout>,
    shown: ShownView,
    sub_values: LruCache<(usize, String), Vec<Value>>,
    needs_full_rewrite: bool,
    persisted_name: Option<String>,
    id_run_length: usize,
}

impl std::fmt::Debug for DataTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTable")
            .field("name", &self.name)
            .field("staging", &self.staging)
            .field("columns", &self.columns.names().collect::<Vec<_>>())
            .field("grouping", &self.grouping)
            .field("ordering", &self.ordering)
            .field("rows", &self.rows.len())
            .finish()
    }
}

impl DataTable {
    /// Build a table: columns from `source.init_columns`, a fresh staging
    /// table, then `source.fill`. Rows are materialized before returning.
    pub fn create(
        conn: &Connection,
        name: &str,
        source: &dyn TableSource,
        dictionaries: &DictionaryStore,
        config: &ProjectConfig,
    ) -> Result<Self> {
        validate_name(name)?;
        let columns = source.init_columns(dictionaries)?;
        let staging = schema::free_table_name(conn, &format!("_staging_{name}"))?;
        let cap = NonZeroUsize::new(config.sub_value_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let mut table = Self {
            name: name.to_string(),
            comment: String::new(),
            staging,
            visible: columns.names().map(str::to_string).collect(),
            columns,
            grouping: Grouping::None,
            ordering: None,
            anonymous_filters: Vec::new(),
            named_filters: Vec::new(),
            used_filters: Vec::new(),
            rows: Vec::new(),
            layout: None,
            shown: ShownView {
                grouping: Grouping::None,
                filters: Vec::new(),
            },
            sub_values: LruCache::new(cap),
            needs_full_rewrite: true,
            persisted_name: None,
            id_run_length: config.id_run_length,
        };
        table.create_staging_table(conn)?;
        source.fill(conn, &table)?;
        table.update(conn)?;
        log::debug!("created table {} (staging {})", table.name, table.staging);
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    /// Name of the live staging table.
    pub fn staging_name(&self) -> &str {
        &self.staging
    }

    pub fn columns(&self) -> &ColumnSet {
        &self.columns
    }

    pub fn visible_columns(&self) -> &[String] {
        &self.visible
    }

    pub fn grouping(&self) -> &Grouping {
        &self.grouping
    }

    pub fn ordering(&self) -> Option<&Ordering> {
        self.ordering.as_ref()
    }

    pub fn anonymous_filters(&self) -> &[Filter] {
        &self.anonymous_filters
    }

    pub fn named_filters(&self) -> &[Filter] {
        &self.named_filters
    }

    pub fn used_filters(&self) -> &[FilterKey] {
        &self.used_filters
    }

    pub fn needs_full_rewrite(&self) -> bool {
        self.needs_full_rewrite
    }

    pub fn persisted_name(&self) -> Option<&str> {
        self.persisted_name.as_deref()
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted_name = Some(self.name.clone());
        self.needs_full_rewrite = false;
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.needs_full_rewrite = true;
    }

    fn invalidate(&mut self) {
        self.sub_values.clear();
    }

    pub fn set_visible_columns(&mut self, names: Vec<String>) -> Result<()> {
        for name in &names {
            self.columns.require(name)?;
        }
        self.visible = names;
        self.invalidate();
        Ok(())
    }

    pub fn set_grouping(&mut self, grouping: Grouping) -> Result<()> {
        if let Grouping::Columns(names) = &grouping {
            for name in names {
                self.columns.require(name)?;
            }
        }
        self.grouping = grouping;
        self.invalidate();
        Ok(())
    }

    pub fn set_ordering(&mut self, ordering: Option<Ordering>) -> Result<()> {
        if let Some(o) = &ordering {
            self.columns.require(&o.column)?;
        }
        self.ordering = ordering;
        self.invalidate();
        Ok(())
    }

    /// Register an anonymous filter owned by this table and apply it.
    pub fn add_anonymous_filter(&mut self, filter: Filter) -> Result<FilterKey> {
        if filter.name().is_some() {
            return Err(StorageError::InvalidFilter(format!(
                "{} is a named filter",
                filter.key()
            )));
        }
        let key = filter.key().clone();
        self.anonymous_filters.push(filter);
        self.used_filters.push(key.clone());
        self.invalidate();
        Ok(key)
    }

    /// Build and apply an id/value-list filter over `column`.
    pub fn filter_by_data_list(
        &mut self,
        column: &str,
        values: &[Value],
        do_remove: bool,
    ) -> Result<FilterKey> {
        let filter = filter_by_data_list(
            self.columns.require(column)?,
            values,
            do_remove,
            self.id_run_length,
        );
        self.add_anonymous_filter(filter)
    }

    /// Re-apply an anonymous filter this table already owns.
    pub fn apply_filter(&mut self, key: &FilterKey) -> Result<()> {
        let known = self
            .anonymous_filters
            .iter()
            .chain(&self.named_filters)
            .any(|f| f.key() == key);
        if !known {
            return Err(StorageError::UnknownFilter(key.to_string()));
        }
        if !self.used_filters.contains(key) {
            self.used_filters.push(key.clone());
        }
        self.invalidate();
        Ok(())
    }

    /// Stop applying a filter. Named filter copies are dropped; anonymous
    /// filters stay owned by the table.
    pub fn unapply_filter(&mut self, key: &FilterKey) {
        self.used_filters.retain(|k| k != key);
        self.named_filters.retain(|f| f.key() != key);
        self.invalidate();
    }

    /// Forget an anonymous filter entirely.
    pub fn remove_anonymous_filter(&mut self, key: &FilterKey) {
        self.used_filters.retain(|k| k != key);
        self.anonymous_filters.retain(|f| f.key() != key);
        self.invalidate();
    }

    pub(crate) fn apply_named_filter(&mut self, filter: Filter) {
        let key = filter.key().clone();
        self.named_filters.retain(|f| f.key() != &key);
        self.named_filters.push(filter);
        if !self.used_filters.contains(&key) {
            self.used_filters.push(key);
        }
        self.invalidate();
    }

    /// Replace the local copy of a redefined project filter, if applied here.
    pub(crate) fn refresh_named_filter(&mut self, filter: &Filter) {
        if let Some(copy) = self.named_filters.iter_mut().find(|f| f.key() == filter.key()) {
            *copy = filter.clone();
            self.invalidate();
        }
    }

    fn filter(&self, key: &FilterKey) -> Option<&Filter> {
        self.anonymous_filters
            .iter()
            .chain(&self.named_filters)
            .find(|f| f.key() == key)
    }

    /// Applied filters that still resolve against the live columns.
    pub fn active_filters(&self) -> Vec<&Filter> {
        self.used_filters
            .iter()
            .filter_map(|k| self.filter(k))
            .filter(|f| f.is_applicable(&self.columns))
            .collect()
    }

    /// Drop references left dangling by schema edits: inapplicable filters,
    /// missing visible/grouping columns and a dangling ordering.
    pub fn prune_stale(&mut self) {
        let columns = &self.columns;
        let mut stale = Vec::new();
        for filter in self.anonymous_filters.iter().chain(&self.named_filters) {
            if !filter.is_applicable(columns) {
                stale.push(filter.key().clone());
            }
        }
        for key in stale {
            log::warn!("table {}: dropping stale filter {key}", self.name);
            self.used_filters.retain(|k| k != &key);
            self.anonymous_filters.retain(|f| f.key() != &key);
            self.named_filters.retain(|f| f.key() != &key);
        }
        let named = &self.named_filters;
        let anonymous = &self.anonymous_filters;
        self.used_filters
            .retain(|k| named.iter().chain(anonymous).any(|f| f.key() == k));

        self.visible.retain(|n| self.columns.contains(n));
        if let Grouping::Columns(names) = &mut self.grouping {
            names.retain(|n| self.columns.contains(n));
            if names.is_empty() {
                self.grouping = Grouping::None;
            }
        }
        if let Some(o) = &self.ordering {
            if !self.columns.contains(&o.column) {
                log::warn!("table {}: clearing ordering on missing column {}", self.name, o.column);
                self.ordering = None;
            }
        }
    }

    fn sort_key(&self, grouped: bool) -> Option<(String, SortDirection)> {
        let ordering = self.ordering.as_ref()?;
        let Some(column) = self.columns.get(&ordering.column) else {
            log::debug!("ordering column {} is gone; ignoring", ordering.column);
            return None;
        };
        let expr = if grouped && column.is_category() {
            let plain = column.sql_projection(false, &self.columns).ok()?;
            match ordering.direction {
                SortDirection::Asc => format!("MIN({plain})"),
                SortDirection::Desc => format!("MAX({plain})"),
            }
        } else {
            column.sql_projection(grouped, &self.columns).ok()?
        };
        Some((expr, ordering.direction))
    }

    /// Compile a `SELECT` against the staging table.
    pub fn compile_query(&self, options: &QueryOptions) -> Result<CompiledQuery> {
        let names = options.columns.clone().unwrap_or_else(|| self.visible.clone());
        let columns: Vec<&Column> = names
            .iter()
            .map(|n| self.columns.require(n))
            .collect::<std::result::Result<_, _>>()?;
        let grouping = options.grouping.as_ref().unwrap_or(&self.grouping);
        let grouped = grouping.is_grouped();

        let filters: Vec<&Filter> = match &options.filters {
            Some(filters) => filters.iter().collect(),
            None => self.active_filters(),
        };

        let mut query =
            SelectQuery::from(&self.staging).filter(where_condition(&filters, &self.columns)?);
        for column in &columns {
            let alias = (!options.auto_alias.is_empty())
                .then(|| format!("{}{}", options.auto_alias, column.name()));
            query.push_column(column.sql_projection(grouped, &self.columns)?, alias);
        }
        if options.status_adds {
            for column in &columns {
                query.push_column(column.status_projection(grouped), None);
            }
        }

        let mut distinct = vec![None; columns.len()];
        let mut group = None;
        let id = quote_ident(ID_COLUMN);
        if options.group_adds {
            if grouped {
                for (i, column) in columns.iter().enumerate() {
                    if column.is_category() {
                        distinct[i] = Some(query.column_count());
                        let plain = column.sql_projection(false, &self.columns)?;
                        query.push_column(format!("COUNT(DISTINCT {plain})"), None);
                    }
                }
                group = Some(query.column_count());
                query.push_column(format!("MIN({id})"), None);
                query.push_column(format!("COUNT({id})"), None);
            } else {
                // Ungrouped rows are single-member groups of themselves.
                group = Some(query.column_count());
                query.push_column(id.clone(), None);
                query.push_column("1", None);
            }
        }

        if let Grouping::Columns(keys) = grouping {
            for key in keys {
                query = query.group_by(self.columns.require(key)?.sql_projection(false, &self.columns)?);
            }
        }
        if let Some((expr, direction)) = self.sort_key(grouped) {
            query.push_order(expr, direction);
        }
        if grouped {
            query.push_order(format!("MIN({id})"), SortDirection::Asc);
        } else {
            query.push_order(id, SortDirection::Asc);
        }

        Ok(CompiledQuery {
            query,
            layout: RowLayout {
                columns: names,
                status: options.status_adds,
                distinct,
                group,
            },
        })
    }

    fn run(&self, conn: &Connection, compiled: &CompiledQuery) -> Result<Vec<Row>> {
        let sql = compiled.sql();
        log::debug!("{sql}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |r| Row::decode(r, &compiled.layout))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        // Aggregating an empty selection still yields one row; it is not a group.
        Ok(rows.into_iter().filter(|r| r.members > 0).collect())
    }

    /// Re-run the view query and replace the materialized rows.
    pub fn update(&mut self, conn: &Connection) -> Result<()> {
        self.prune_stale();
        let compiled = self.compile_query(&QueryOptions::default())?;
        self.rows = self.run(conn, &compiled)?;
        self.layout = Some(compiled.layout);
        self.shown = ShownView {
            grouping: self.grouping.clone(),
            filters: self.active_filters().into_iter().cloned().collect(),
        };
        self.invalidate();
        Ok(())
    }

    /// Run an arbitrary compiled query without touching the materialized rows.
    pub fn query(&self, conn: &Connection, options: &QueryOptions) -> Result<Vec<Row>> {
        let compiled = self.compile_query(options)?;
        self.run(conn, &compiled)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn row(&self, row: usize) -> Result<&Row> {
        self.rows.get(row).ok_or(StorageError::RowOutOfRange(row))
    }

    fn layout_column(&self, col: usize) -> Result<&str> {
        self.layout
            .as_ref()
            .and_then(|l| l.columns.get(col))
            .map(String::as_str)
            .ok_or(StorageError::ColumnOutOfRange(col))
    }

    /// Raw value at (row, visible column).
    pub fn value(&self, row: usize, col: usize) -> Result<&Value> {
        self.layout_column(col)?;
        Ok(&self.row(row)?.values[col])
    }

    /// User-facing value at (row, visible column).
    pub fn represented(&self, row: usize, col: usize) -> Result<Value> {
        let column = self.columns.require(self.layout_column(col)?)?;
        Ok(column.represent(self.value(row, col)?))
    }

    pub fn status(&self, row: usize, col: usize) -> Result<bool> {
        self.layout_column(col)?;
        Ok(self.row(row)?.status.get(col).copied().unwrap_or(false))
    }

    /// Number of distinct values merged into a grouped category cell (1 when ungrouped).
    pub fn distinct_count(&self, row: usize, col: usize) -> Result<i64> {
        self.layout_column(col)?;
        Ok(self.row(row)?.distinct.get(col).copied().flatten().unwrap_or(1))
    }

    pub fn n_sub_values(&self, row: usize) -> Result<i64> {
        Ok(self.row(row)?.members)
    }

    /// Raw values of `column` for every member of the group shown at `row`.
    ///
    /// Groups are resolved against the view of the last [`DataTable::update`],
    /// so pending view edits do not change what a row expands to. Expansions
    /// are cached until the next view change or update.
    pub fn sub_values(&mut self, conn: &Connection, row: usize, column: &str) -> Result<Vec<Value>> {
        let current = self.row(row)?.clone();
        let target = self.columns.require(column)?;
        if current.members <= 1 {
            let layout_idx = self
                .layout
                .as_ref()
                .and_then(|l| l.columns.iter().position(|c| c == column));
            if let Some(i) = layout_idx {
                return Ok(vec![current.values[i].clone()]);
            }
        }
        let cache_key = (row, column.to_string());
        if let Some(hit) = self.sub_values.get(&cache_key) {
            return Ok(hit.clone());
        }

        let projection = target.sql_projection(false, &self.columns)?;
        let mut filters = self.shown.filters.clone();
        if let (Grouping::Columns(keys), Some(rep)) = (&self.shown.grouping, current.id) {
            filters.push(self.group_filter(conn, keys, rep)?);
        } else if let (Grouping::None, Some(rep)) = (&self.shown.grouping, current.id) {
            let id = self.columns.require(ID_COLUMN)?;
            filters.push(filter_by_values(
                &[(ColumnDescriptor::of(id), Value::Integer(rep))],
                Concat::And,
                false,
            ));
        }
        let refs: Vec<&Filter> = filters.iter().collect();
        let query = SelectQuery::from(&self.staging)
            .column(projection)
            .filter(where_condition(&refs, &self.columns)?)
            .order_by(quote_ident(ID_COLUMN), SortDirection::Asc);
        let sql = query.to_sql();
        log::debug!("{sql}");
        let mut stmt = conn.prepare(&sql)?;
        let values = stmt
            .query_map([], |r| Ok(from_value_ref(r.get_ref(0)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        self.sub_values.put(cache_key, values.clone());
        Ok(values)
    }

    /// Equality filter selecting the members of the group whose
    /// representative row is `rep`.
    fn group_filter(&self, conn: &Connection, keys: &[String], rep: i64) -> Result<Filter> {
        let mut query = SelectQuery::from(&self.staging)
            .filter(Some(format!("{} = {rep}", quote_ident(ID_COLUMN))));
        let mut descriptors = Vec::with_capacity(keys.len());
        for key in keys {
            let column = self.columns.require(key)?;
            query.push_column(column.sql_projection(false, &self.columns)?, None);
            descriptors.push(ColumnDescriptor::of(column));
        }
        let sql = query.to_sql();
        let key_values: Vec<Value> = conn.query_row(&sql, [], |r| {
            (0..descriptors.len())
                .map(|i| Ok(from_value_ref(r.get_ref(i)?)))
                .collect::<rusqlite::Result<Vec<Value>>>()
        })?;
        let pairs: Vec<(ColumnDescriptor, Value)> = descriptors.into_iter().zip(key_values).collect();
        Ok(filter_by_values(&pairs, Concat::And, false))
    }

    /// Distinct raw values of `column`, sorted by SQLite's ordering.
    pub fn distinct_values(
        &self,
        conn: &Connection,
        column: &str,
        scope: DistinctScope,
    ) -> Result<Vec<Value>> {
        let target = self.columns.require(column)?;
        let filters = match scope {
            DistinctScope::Global => Vec::new(),
            DistinctScope::Filtered | DistinctScope::View => self.active_filters(),
        };
        let condition = where_condition(&filters, &self.columns)?;

        let sql = if scope == DistinctScope::View && self.grouping.is_grouped() {
            // Distinct over the grouped projection of the current view.
            let mut inner = SelectQuery::from(&self.staging)
                .filter(condition)
                .column(target.sql_projection(true, &self.columns)?);
            if let Grouping::Columns(keys) = &self.grouping {
                for key in keys {
                    inner = inner.group_by(self.columns.require(key)?.sql_projection(false, &self.columns)?);
                }
            }
            format!("SELECT DISTINCT * FROM ({}) ORDER BY 1", inner.to_sql())
        } else {
            let expr = target.sql_projection(false, &self.columns)?;
            SelectQuery::from(&self.staging)
                .distinct()
                .column(expr.clone())
                .filter(condition)
                .order_by(expr, SortDirection::Asc)
                .to_sql()
        };
        log::debug!("{sql}");
        let mut stmt = conn.prepare(&sql)?;
        let values = stmt
            .query_map([], |r| Ok(from_value_ref(r.get_ref(0)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(values)
    }

    pub(crate) fn create_table_sql(name: &str, columns: &ColumnSet) -> String {
        let defs: Vec<String> = columns
            .stored()
            .map(|c| {
                format!(
                    "{} {}, {} INTEGER NOT NULL DEFAULT 0",
                    quote_ident(c.name()),
                    c.storage_type().sql_name(),
                    quote_ident(&c.status_name())
                )
            })
            .collect();
        format!("CREATE TABLE {} ({})", quote_ident(name), defs.join(", "))
    }

    /// Value and status column names of every stored column, quoted, in order.
    pub(crate) fn stored_column_list(columns: &ColumnSet) -> Vec<String> {
        columns
            .stored()
            .flat_map(|c| [quote_ident(c.name()), quote_ident(&c.status_name())])
            .collect()
    }

    fn create_staging_table(&self, conn: &Connection) -> Result<()> {
        conn.execute(&Self::create_table_sql(&self.staging, &self.columns), [])?;
        Ok(())
    }

    /// Insert rows given as raw values of the stored columns (in stored order,
    /// `id` first) plus optional status flags.
    pub(crate) fn insert_rows(
        &self,
        conn: &Connection,
        rows: impl IntoIterator<Item = (Vec<Value>, Vec<bool>)>,
    ) -> Result<usize> {
        let stored: Vec<&Column> = self.columns.stored().collect();
        let placeholders = vec!["?"; stored.len() * 2].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote_ident(&self.staging),
            Self::stored_column_list(&self.columns).join(", ")
        );
        let tx = conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(&sql)?;
            for (i, (values, status)) in rows.into_iter().enumerate() {
                if values.len() != stored.len() {
                    return Err(StorageError::RowShape {
                        row: i,
                        expected: stored.len(),
                        actual: values.len(),
                    });
                }
                let mut params = Vec::with_capacity(stored.len() * 2);
                for (j, (column, value)) in stored.iter().zip(&values).enumerate() {
                    params.push(to_sql_value(&column.representation().coerce(value)));
                    let flag = status.get(j).copied().unwrap_or(false);
                    params.push(rusqlite::types::Value::Integer(i64::from(flag)));
                }
                stmt.execute(params_from_iter(params))?;
                count += 1;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// Drop and recreate the persisted table from the staging table.
    /// Drop the persisted copy written under an earlier name, if any.
    pub(crate) fn drop_stale_persisted(&mut self, conn: &Connection) -> Result<()> {
        if let Some(old) = self.persisted_name.take() {
            if old != self.name {
                conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&old)), [])?;
                self.needs_full_rewrite = true;
            } else {
                self.persisted_name = Some(old);
            }
        }
        Ok(())
    }

    pub fn write_to_original(&mut self, conn: &Connection) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        if let Some(old) = &self.persisted_name {
            tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(old)), [])?;
        }
        tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&self.name)), [])?;
        tx.execute(&Self::create_table_sql(&self.name, &self.columns), [])?;
        let cols = Self::stored_column_list(&self.columns).join(", ");
        tx.execute(
            &format!(
                "INSERT INTO {} ({cols}) SELECT {cols} FROM {}",
                quote_ident(&self.name),
                quote_ident(&self.staging)
            ),
            [],
        )?;
        tx.commit()?;
        self.mark_persisted();
        log::debug!("wrote table {} from {}", self.name, self.staging);
        Ok(())
    }

    /// Drop the staging table and the persisted copy, if any.
    pub(crate) fn drop_tables(&self, conn: &Connection) -> Result<()> {
        conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&self.staging)), [])?;
        if let Some(persisted) = &self.persisted_name {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(persisted)), [])?;
        }
        Ok(())
    }

    /// Add a computed column. No SQL changes; the column is evaluated at query time.
    pub fn add_computed_column(&mut self, column: Column) -> Result<()> {
        if column.is_stored() {
            return Err(StorageError::InvalidColumn(format!(
                "{} is a stored column",
                column.name()
            )));
        }
        let name = column.name().to_string();
        self.columns.add(column)?;
        self.visible.push(name);
        self.needs_full_rewrite = true;
        self.invalidate();
        Ok(())
    }

    /// Add an empty stored column to the staging table.
    pub fn add_stored_column(&mut self, conn: &Connection, column: Column) -> Result<()> {
        if !column.is_stored() {
            return Err(StorageError::InvalidColumn(format!(
                "{} is a computed column",
                column.name()
            )));
        }
        let mut columns = self.columns.clone();
        columns.add(column.clone())?;
        let staging = quote_ident(&self.staging);
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                "ALTER TABLE {staging} ADD COLUMN {} {}",
                quote_ident(column.name()),
                column.storage_type().sql_name()
            ),
            [],
        )?;
        tx.execute(
            &format!(
                "ALTER TABLE {staging} ADD COLUMN {} INTEGER NOT NULL DEFAULT 0",
                quote_ident(&column.status_name())
            ),
            [],
        )?;
        tx.commit()?;
        self.columns = columns;
        self.visible.push(column.name().to_string());
        self.needs_full_rewrite = true;
        self.invalidate();
        Ok(())
    }

    /// Overwrite one stored cell (addressed by `id`) and flag its status column.
    pub fn set_raw_value(&mut self, conn: &Connection, id: i64, column: &str, value: &Value) -> Result<()> {
        let target = self.columns.require(column)?;
        if !target.is_stored() || target.is_id() {
            return Err(StorageError::InvalidColumn(format!("{column} is not editable")));
        }
        let raw = target.representation().coerce(value);
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET {} = ?1, {} = 1 WHERE {} = ?2",
                quote_ident(&self.staging),
                quote_ident(target.name()),
                quote_ident(&target.status_name()),
                quote_ident(ID_COLUMN)
            ),
            rusqlite::params![to_sql_value(&raw), id],
        )?;
        if changed == 0 {
            return Err(StorageError::UnknownRow(id));
        }
        self.needs_full_rewrite = true;
        self.invalidate();
        Ok(())
    }

    /// Renumber `id` densely from 1 in current id order and remap id-set
    /// filters. Filters left without members are dropped.
    pub fn reset_id(&mut self, conn: &Connection) -> Result<()> {
        let staging = quote_ident(&self.staging);
        let id = quote_ident(ID_COLUMN);
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS temp._id_map;
             CREATE TEMP TABLE _id_map AS
               SELECT rowid AS rid, {id} AS old_id,
                      ROW_NUMBER() OVER (ORDER BY {id}, rowid) AS new_id
               FROM {staging};"
        ))?;
        let mapping: HashMap<i64, i64> = {
            let mut stmt = tx.prepare("SELECT old_id, new_id FROM temp._id_map ORDER BY new_id")?;
            let pairs = stmt
                .query_map([], |r| Ok((r.get::<_, Option<i64>>(0)?, r.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut mapping = HashMap::with_capacity(pairs.len());
            for (old, new) in pairs {
                if let Some(old) = old {
                    // Duplicate ids keep the first new number.
                    mapping.entry(old).or_insert(new);
                }
            }
            mapping
        };
        tx.execute(
            &format!(
                "UPDATE {staging} SET {id} = (SELECT new_id FROM temp._id_map WHERE rid = {staging}.rowid)"
            ),
            [],
        )?;
        tx.execute("DROP TABLE temp._id_map", [])?;
        tx.commit()?;

        let run = self.id_run_length;
        let mut emptied = Vec::new();
        for filter in self.anonymous_filters.iter_mut().chain(self.named_filters.iter_mut()) {
            if !filter.remap_ids(&mapping, run) {
                emptied.push(filter.key().clone());
            }
        }
        for key in emptied {
            log::info!("table {}: filter {key} lost all ids and was removed", self.name);
            self.used_filters.retain(|k| k != &key);
            self.anonymous_filters.retain(|f| f.key() != &key);
            self.named_filters.retain(|f| f.key() != &key);
        }
        self.needs_full_rewrite = true;
        self.invalidate();
        Ok(())
    }

    pub(crate) fn columns_mut(&mut self) -> &mut ColumnSet {
        &mut self.columns
    }

    pub(crate) fn replace_columns(&mut self, columns: ColumnSet) {
        self.columns = columns;
        self.invalidate();
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn filters_mut(&mut self) -> impl Iterator<Item = &mut Filter> + '_ {
        self.anonymous_filters.iter_mut().chain(self.named_filters.iter_mut())
    }

    /// Drop every owned filter matching `pred`; returns the dropped keys.
    pub(crate) fn drop_filters_where(&mut self, pred: impl Fn(&Filter) -> bool) -> Vec<FilterKey> {
        let dropped: Vec<FilterKey> = self
            .anonymous_filters
            .iter()
            .chain(&self.named_filters)
            .filter(|f| pred(*f))
            .map(|f| f.key().clone())
            .collect();
        self.anonymous_filters.retain(|f| !pred(f));
        self.named_filters.retain(|f| !pred(f));
        self.used_filters.retain(|k| !dropped.contains(k));
        dropped
    }

    pub(crate) fn rename_view_columns(&mut self, renames: &HashMap<String, String>) {
        let rename = |n: &mut String| {
            if let Some(new) = renames.get(n.as_str()) {
                *n = new.clone();
            }
        };
        self.visible.iter_mut().for_each(rename);
        if let Grouping::Columns(names) = &mut self.grouping {
            names.iter_mut().for_each(rename);
        }
        if let Some(o) = &mut self.ordering {
            rename(&mut o.column);
        }
    }

    pub(crate) fn view_state(&self) -> TableViewState {
        TableViewState {
            visible: self.visible.clone(),
            grouping: self.grouping.clone(),
            ordering: self.ordering.clone(),
            anonymous_filters: self.anonymous_filters.clone(),
            named_filters: self.named_filters.clone(),
            used_filters: self.used_filters.clone(),
        }
    }

    pub(crate) fn restore_view_state(&mut self, state: TableViewState) {
        self.visible = state.visible;
        self.grouping = state.grouping;
        self.ordering = state.ordering;
        self.anonymous_filters = state.anonymous_filters;
        self.named_filters = state.named_filters;
        self.used_filters = state.used_filters;
        self.invalidate();
    }

    pub(crate) fn set_persisted(&mut self, name: Option<String>, dirty: bool) {
        self.persisted_name = name;
        self.needs_full_rewrite = dirty;
    }
}

/// Per-table view configuration persisted in `_tables.state`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TableViewState {
    pub visible: Vec<String>,
    #[serde(default)]
    pub grouping: Grouping,
    #[serde(default)]
    pub ordering: Option<Ordering>,
    #[serde(default)]
    pub anonymous_filters: Vec<Filter>,
    #[serde(default)]
    pub named_filters: Vec<Filter>,
    #[serde(default)]
    pub used_filters: Vec<FilterKey>,
}
