//! Schema converter.
//!
//! A [`TableConversion`] collects proposed edits (renames, retypes, removals)
//! against a table's current columns and applies them in one go. When a stored
//! column changes shape, the staging table is rebuilt with the rename-swap
//! protocol inside a transaction, so a failure leaves the original table in place.
use crate::functions::{from_value_ref, SAFE_INT};
use crate::project::{Result, StorageError};
use crate::schema;
use crate::table::DataTable;
use biostata_model::names::{name_key, validate_unique};
use biostata_model::{
    quote_ident, quote_literal, validate_name, Column, ColumnSet, Dictionary, DictionaryType,
    FilterKey, ModelResult, PhysicalType, Representation, SelectQuery, SortDirection, Value,
    ID_COLUMN,
};
use rusqlite::Connection;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// How values are carried across a representation change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConversionMode {
    /// Plain SQL cast.
    Cast,
    /// Raw integers are kept as dictionary keys.
    Keys,
    /// Values are matched by their display text.
    Values,
}

impl fmt::Display for ConversionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConversionMode::Cast => "cast",
            ConversionMode::Keys => "keys",
            ConversionMode::Values => "values",
        })
    }
}

/// Every `(target type, mode)` a column of type `from` can be converted to.
pub fn possible_conversions(from: PhysicalType) -> Vec<(PhysicalType, ConversionMode)> {
    use ConversionMode::*;
    use PhysicalType::*;
    match from {
        Int => vec![
            (Real, Cast),
            (Text, Cast),
            (Enum, Keys),
            (Enum, Values),
            (Bool, Keys),
            (Bool, Values),
        ],
        Real => vec![(Int, Cast), (Text, Cast)],
        Text => vec![(Int, Cast), (Enum, Values), (Bool, Values)],
        Enum | Bool => vec![
            (Int, Cast),
            (Text, Values),
            (Enum, Keys),
            (Enum, Values),
            (Bool, Keys),
            (Bool, Values),
        ],
    }
}

fn key_list(dictionary: &Dictionary) -> String {
    dictionary
        .keys()
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn case_expr(arms: Vec<String>) -> String {
    if arms.is_empty() {
        "NULL".to_string()
    } else {
        format!("CASE {} ELSE NULL END", arms.join(" "))
    }
}

/// SQL expression turning `x` (a column of representation `from`) into a
/// value of representation `to`.
pub fn internal_repr_change_line(
    x: &str,
    from: &Representation,
    to: &Representation,
    mode: ConversionMode,
) -> Result<String> {
    use ConversionMode::*;
    use PhysicalType::*;
    let unmapped = || StorageError::UnmappedConversion {
        from: from.physical_type(),
        to: to.physical_type(),
        mode,
    };
    if from.same_as(to) {
        return Ok(x.to_string());
    }
    let line = match (from.physical_type(), to.physical_type(), mode) {
        (Int, Real, Cast) => format!("CAST({x} AS REAL)"),
        (Int | Real, Text, Cast) => format!("CAST({x} AS TEXT)"),
        (Real, Int, Cast) => format!("CAST(ROUND({x}) AS INTEGER)"),
        (Text, Int, Cast) => format!("{SAFE_INT}({x})"),
        // Dictionary keys already are integers.
        (Enum | Bool, Int, Cast) => x.to_string(),
        (Int | Enum | Bool, Enum | Bool, Keys) => {
            let target = to.dictionary().ok_or_else(unmapped)?;
            if target.is_empty() {
                "NULL".to_string()
            } else {
                format!("CASE WHEN {x} IN ({}) THEN {x} ELSE NULL END", key_list(target))
            }
        }
        (Int, Enum | Bool, Values) => {
            let target = to.dictionary().ok_or_else(unmapped)?;
            case_expr(
                target
                    .entries()
                    .map(|(k, v)| format!("WHEN CAST({x} AS TEXT) = {} THEN {k}", quote_literal(v)))
                    .collect(),
            )
        }
        (Text, Enum | Bool, Values) => {
            let target = to.dictionary().ok_or_else(unmapped)?;
            case_expr(
                target
                    .entries()
                    .map(|(k, v)| format!("WHEN {x} = {} THEN {k}", quote_literal(v)))
                    .collect(),
            )
        }
        (Enum | Bool, Enum | Bool, Values) => {
            let source = from.dictionary().ok_or_else(unmapped)?;
            let target = to.dictionary().ok_or_else(unmapped)?;
            case_expr(
                source
                    .entries()
                    .filter_map(|(k1, v)| target.key_of(v).map(|k2| format!("WHEN {x} = {k1} THEN {k2}")))
                    .collect(),
            )
        }
        (Enum | Bool, Text, Values) => {
            let source = from.dictionary().ok_or_else(unmapped)?;
            case_expr(
                source
                    .entries()
                    .map(|(k, v)| format!("WHEN {x} = {k} THEN {}", quote_literal(v)))
                    .collect(),
            )
        }
        _ => return Err(unmapped()),
    };
    Ok(line)
}

/// Proposed edits to one column.
#[derive(Clone, Debug)]
pub struct ColumnConversion {
    current: Column,
    name: String,
    shortname: String,
    dim: String,
    comment: String,
    repr: Representation,
    mode: ConversionMode,
    remove: bool,
}

impl ColumnConversion {
    pub fn new(column: &Column) -> Self {
        Self {
            current: column.clone(),
            name: column.name().to_string(),
            shortname: column.shortname().to_string(),
            dim: column.dim().to_string(),
            comment: column.comment().to_string(),
            repr: column.representation().clone(),
            mode: ConversionMode::Cast,
            remove: false,
        }
    }

    pub fn current(&self) -> &Column {
        &self.current
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    pub fn set_shortname(&mut self, shortname: impl Into<String>) -> &mut Self {
        self.shortname = shortname.into();
        self
    }

    pub fn set_dim(&mut self, dim: impl Into<String>) -> &mut Self {
        self.dim = dim.into();
        self
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) -> &mut Self {
        self.comment = comment.into();
        self
    }

    pub fn retype(&mut self, repr: Representation, mode: ConversionMode) -> &mut Self {
        self.repr = repr;
        self.mode = mode;
        self
    }

    pub fn remove(&mut self) -> &mut Self {
        self.remove = true;
        self
    }

    pub fn is_removed(&self) -> bool {
        self.remove
    }

    pub fn representation(&self) -> &Representation {
        &self.repr
    }

    pub fn mode(&self) -> ConversionMode {
        self.mode
    }

    pub fn repr_changed(&self) -> bool {
        !self.repr.same_as(self.current.representation())
    }

    pub fn is_renamed(&self) -> bool {
        self.name != self.current.name()
    }

    pub fn has_changes(&self) -> bool {
        self.remove
            || self.is_renamed()
            || self.repr_changed()
            || self.shortname != self.current.shortname()
            || self.dim != self.current.dim()
            || self.comment != self.current.comment()
    }

    /// The staging table must be rebuilt for this column.
    pub fn needs_alter(&self) -> bool {
        self.current.is_stored() && (self.repr_changed() || self.remove || self.is_renamed())
    }

    /// Dependents and filters of this column cannot survive the change.
    pub fn blocks_promotion(&self) -> bool {
        self.repr_changed() || self.remove
    }
}

/// What [`TableConversion::apply`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversionReport {
    pub removed_columns: Vec<String>,
    pub renamed_columns: Vec<(String, String)>,
    pub retyped_columns: Vec<String>,
    pub dropped_filters: Vec<FilterKey>,
    pub rebuilt: bool,
}

/// Proposed edits to one table.
#[derive(Clone, Debug)]
pub struct TableConversion {
    table: String,
    name: String,
    comment: String,
    remove: bool,
    columns: Vec<ColumnConversion>,
}

impl TableConversion {
    /// One column conversion per column except `id`.
    pub fn for_table(table: &DataTable) -> Self {
        Self {
            table: table.name().to_string(),
            name: table.name().to_string(),
            comment: table.comment().to_string(),
            remove: false,
            columns: table
                .columns()
                .iter()
                .filter(|c| !c.is_id())
                .map(ColumnConversion::new)
                .collect(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn new_name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) -> &mut Self {
        self.comment = comment.into();
        self
    }

    pub fn remove_table(&mut self) -> &mut Self {
        self.remove = true;
        self
    }

    pub fn is_table_removed(&self) -> bool {
        self.remove
    }

    pub fn column(&self, name: &str) -> Option<&ColumnConversion> {
        self.columns.iter().find(|c| c.current.name() == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnConversion> {
        self.columns.iter_mut().find(|c| c.current.name() == name)
    }

    pub fn columns(&self) -> &[ColumnConversion] {
        &self.columns
    }

    pub fn has_changes(&self) -> bool {
        self.remove
            || self.name != self.table
            || self.columns.iter().any(ColumnConversion::has_changes)
    }

    /// Computed columns that must go because something they (transitively)
    /// depend on blocks promotion. Columns marked for removal themselves are
    /// not included.
    pub fn implicit_removes(&self) -> BTreeSet<String> {
        let mut blocked: BTreeSet<&str> = self
            .columns
            .iter()
            .filter(|c| c.blocks_promotion())
            .map(|c| c.current.name())
            .collect();
        let mut implicit = BTreeSet::new();
        loop {
            let mut grew = false;
            for conversion in &self.columns {
                let column = &conversion.current;
                if blocked.contains(column.name()) {
                    continue;
                }
                if column.deps().iter().any(|d| blocked.contains(d.as_str())) {
                    blocked.insert(column.name());
                    implicit.insert(column.name().to_string());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        implicit
    }

    /// Every column that disappears: explicit removals plus the implicit closure.
    pub fn removed_columns(&self) -> BTreeSet<String> {
        let mut removed = self.implicit_removes();
        removed.extend(
            self.columns
                .iter()
                .filter(|c| c.remove)
                .map(|c| c.current.name().to_string()),
        );
        removed
    }

    /// Check names and conversion modes. `other_tables` holds the names of
    /// every other table in the project.
    pub fn validate<'a>(&self, other_tables: impl IntoIterator<Item = &'a str>) -> Result<()> {
        if self.remove {
            return Ok(());
        }
        if self.name != self.table {
            validate_name(&self.name)?;
            validate_unique(&self.name, other_tables)?;
        }
        let removed = self.removed_columns();
        let mut final_names = vec![ID_COLUMN.to_string()];
        for conversion in &self.columns {
            if removed.contains(conversion.current.name()) {
                continue;
            }
            if conversion.is_renamed() {
                validate_name(&conversion.name)?;
            }
            if conversion.repr_changed() {
                let to = (conversion.repr.physical_type(), conversion.mode);
                if !possible_conversions(conversion.current.physical_type()).contains(&to) {
                    return Err(StorageError::UnmappedConversion {
                        from: conversion.current.physical_type(),
                        to: to.0,
                        mode: to.1,
                    });
                }
            }
            final_names.push(conversion.name.clone());
        }
        let mut seen = BTreeSet::new();
        for name in &final_names {
            if !seen.insert(name_key(name)) {
                return Err(StorageError::Model(biostata_model::ModelError::InvalidName {
                    name: name.clone(),
                    reason: "name is already in use",
                }));
            }
        }
        Ok(())
    }

    fn renames(&self, removed: &BTreeSet<String>) -> HashMap<String, String> {
        self.columns
            .iter()
            .filter(|c| c.is_renamed() && !removed.contains(c.current.name()))
            .map(|c| (c.current.name().to_string(), c.name.clone()))
            .collect()
    }

    /// The column set after the conversion, built off to the side.
    fn converted_columns(
        &self,
        current: &ColumnSet,
        removed: &BTreeSet<String>,
        renames: &HashMap<String, String>,
    ) -> ModelResult<ColumnSet> {
        let mut columns = current.clone();
        columns.remove_all(removed)?;
        columns.rename_all(renames)?;
        for conversion in &self.columns {
            if removed.contains(conversion.current.name()) {
                continue;
            }
            if conversion.repr_changed() {
                columns.set_representation(&conversion.name, conversion.repr.clone())?;
            }
            if let Some(column) = columns.get_mut(&conversion.name) {
                column.set_shortname(conversion.shortname.clone());
                column.set_dim(conversion.dim.clone());
                column.set_comment(conversion.comment.clone());
            }
        }
        columns.restore_partition();
        Ok(columns)
    }

    /// Rename-swap rebuild of the staging table into the shape of `columns`.
    fn rebuild(
        &self,
        conn: &Connection,
        table: &DataTable,
        columns: &ColumnSet,
        removed: &BTreeSet<String>,
    ) -> Result<()> {
        let staging = table.staging_name();
        let scratch = schema::free_table_name(conn, &format!("{staging}_old"))?;
        log::info!("rebuilding staging table {staging} of {}", self.table);

        // Only surviving stored columns carry data over. A removed column's
        // name may have been taken over by a renamed one.
        let survivors: Vec<&ColumnConversion> = self
            .columns
            .iter()
            .filter(|c| c.current.is_stored() && !removed.contains(c.current.name()))
            .collect();
        let mut targets = Vec::new();
        let mut sources = Vec::new();
        for column in columns.stored() {
            let conversion = survivors.iter().find(|c| c.name == column.name());
            let (old_name, expr) = match conversion {
                Some(c) => {
                    let old = quote_ident(c.current.name());
                    let expr = if c.repr_changed() {
                        internal_repr_change_line(&old, c.current.representation(), &c.repr, c.mode)?
                    } else {
                        old
                    };
                    (c.current.name().to_string(), expr)
                }
                None => (column.name().to_string(), quote_ident(column.name())),
            };
            targets.push(quote_ident(column.name()));
            targets.push(quote_ident(&column.status_name()));
            sources.push(expr);
            sources.push(quote_ident(&biostata_model::column::status_column_name(&old_name)));
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            &format!("ALTER TABLE {} RENAME TO {}", quote_ident(staging), quote_ident(&scratch)),
            [],
        )?;
        tx.execute(&DataTable::create_table_sql(staging, columns), [])?;
        let insert = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote_ident(staging),
            targets.join(", "),
            sources.join(", "),
            quote_ident(&scratch)
        );
        log::debug!("{insert}");
        tx.execute(&insert, [])?;
        tx.execute(&format!("DROP TABLE {}", quote_ident(&scratch)), [])?;
        tx.commit()?;
        log::info!("rebuilt staging table {staging}");
        Ok(())
    }

    /// Apply the conversion to `table`. Table removal is handled by the project.
    pub fn apply(&self, conn: &Connection, table: &mut DataTable) -> Result<ConversionReport> {
        let removed = self.removed_columns();
        let renames = self.renames(&removed);
        let retyped: BTreeSet<String> = self
            .columns
            .iter()
            .filter(|c| c.repr_changed() && !removed.contains(c.current.name()))
            .map(|c| c.current.name().to_string())
            .collect();

        let columns = self.converted_columns(table.columns(), &removed, &renames)?;
        let rebuilt = self.columns.iter().any(ColumnConversion::needs_alter);
        if rebuilt {
            self.rebuild(conn, table, &columns, &removed)?;
        }

        // Filters over removed or retyped columns go; the rest follow renames.
        let dropped = table.drop_filters_where(|f| {
            removed.iter().chain(&retyped).any(|n| f.references_column(n))
        });
        for key in &dropped {
            log::info!("table {}: dropped filter {key} after conversion", self.table);
        }
        for filter in table.filters_mut() {
            filter.rename_columns(&renames);
        }

        table.replace_columns(columns);
        table.rename_view_columns(&renames);
        if self.name != self.table {
            table.set_name(self.name.clone());
        }
        table.set_comment(self.comment.clone());
        table.mark_dirty();
        table.update(conn)?;

        let mut renamed_columns: Vec<(String, String)> = renames.into_iter().collect();
        renamed_columns.sort();
        Ok(ConversionReport {
            removed_columns: removed.into_iter().collect(),
            renamed_columns,
            retyped_columns: retyped.into_iter().collect(),
            dropped_filters: dropped,
            rebuilt,
        })
    }
}

/// Editable seed for a new dictionary; never committed automatically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DictionaryProposal {
    pub keys: Vec<i64>,
    pub values: Vec<String>,
    pub comments: Vec<String>,
}

impl DictionaryProposal {
    pub fn into_dictionary(self, name: &str, dict_type: DictionaryType) -> ModelResult<Dictionary> {
        Dictionary::new(name, dict_type, self.keys, self.values, self.comments)
    }
}

/// Derive a dictionary proposal from the distinct values of `column`.
///
/// `Keys`: distinct raw values coerced to integers (others discarded), with
/// empty display values. `Values`: distinct represented values, keyed `0..n`.
pub fn dictionary_prototype(
    conn: &Connection,
    table: &DataTable,
    column: &str,
    mode: ConversionMode,
) -> Result<DictionaryProposal> {
    let target = table.columns().require(column)?;
    let expr = target.sql_projection(false, table.columns())?;
    let sql = SelectQuery::from(table.staging_name())
        .distinct()
        .column(expr.clone())
        .order_by(expr, SortDirection::Asc)
        .to_sql();
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map([], |r| Ok(from_value_ref(r.get_ref(0)?)))?
        .collect::<rusqlite::Result<Vec<Value>>>()?;

    match mode {
        ConversionMode::Keys => {
            let keys: BTreeSet<i64> = raw
                .iter()
                .filter_map(|v| match v {
                    // Fractional keys truncate toward zero.
                    Value::Real(r) if r.is_finite() => Some(r.trunc() as i64),
                    _ => v.as_i64(),
                })
                .collect();
            let n = keys.len();
            Ok(DictionaryProposal {
                keys: keys.into_iter().collect(),
                values: vec![String::new(); n],
                comments: vec![String::new(); n],
            })
        }
        ConversionMode::Values | ConversionMode::Cast => {
            let values: BTreeSet<String> = raw
                .iter()
                .map(|v| target.represent(v))
                .filter_map(|v| v.as_text())
                .collect();
            let n = values.len();
            Ok(DictionaryProposal {
                keys: (0..n as i64).collect(),
                values: values.into_iter().collect(),
                comments: vec![String::new(); n],
            })
        }
    }
}
