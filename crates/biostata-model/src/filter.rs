//! Filter DSL.
//!
//! A [`Filter`] is an immutable description compiled fresh into a `WHERE`
//! condition for every query. Entries reference columns through
//! [`ColumnDescriptor`]s (name + type + dictionary name) rather than by identity,
//! so a filter survives schema edits that leave its columns intact and is
//! silently dropped (see [`Filter::is_applicable`]) when they do not.
use crate::column::{Column, ColumnSet};
use crate::error::{ModelError, ModelResult};
use crate::names::ID_COLUMN;
use crate::types::PhysicalType;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// Default minimum run length collapsed into a range by [`simplify_integer_list`].
pub const DEFAULT_MIN_RUN_LENGTH: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Concat {
    #[default]
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

impl Concat {
    pub fn keyword(self) -> &'static str {
        match self {
            Concat::And => "AND",
            Concat::Or => "OR",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpenParen {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "(")]
    One,
    #[serde(rename = "((")]
    Two,
    #[serde(rename = "(((")]
    Three,
}

impl OpenParen {
    fn count(self) -> usize {
        match self {
            OpenParen::None => 0,
            OpenParen::One => 1,
            OpenParen::Two => 2,
            OpenParen::Three => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CloseParen {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = ")")]
    One,
    #[serde(rename = "))")]
    Two,
    #[serde(rename = ")))")]
    Three,
    /// Close everything opened so far in the filter.
    #[serde(rename = ")*")]
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "one of")]
    OneOf,
    #[serde(rename = "NULL")]
    IsNull,
    #[serde(rename = "not NULL")]
    NotNull,
}

impl Operator {
    fn sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::OneOf => "IN",
            Operator::IsNull => "IS NULL",
            Operator::NotNull => "IS NOT NULL",
        }
    }
}

/// Structural reference to a column.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub physical_type: PhysicalType,
    #[serde(default)]
    pub dict: Option<String>,
}

impl ColumnDescriptor {
    pub fn of(column: &Column) -> Self {
        Self {
            name: column.name().to_string(),
            physical_type: column.physical_type(),
            dict: column.dictionary_name().map(str::to_string),
        }
    }

    /// Find the live column this descriptor refers to, if it still matches.
    pub fn resolve<'a>(&self, columns: &'a ColumnSet) -> Option<&'a Column> {
        columns.get(&self.name).filter(|c| {
            c.physical_type() == self.physical_type && c.dictionary_name() == self.dict.as_deref()
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    None,
    Value(Value),
    Values(Vec<Value>),
    Column(ColumnDescriptor),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterEntry {
    #[serde(default)]
    pub concat: Concat,
    #[serde(default)]
    pub open: OpenParen,
    #[serde(default)]
    pub close: CloseParen,
    pub column: ColumnDescriptor,
    pub operator: Operator,
    pub value: Operand,
}

impl FilterEntry {
    pub fn new(column: ColumnDescriptor, operator: Operator, value: Operand) -> Self {
        Self {
            concat: Concat::And,
            open: OpenParen::None,
            close: CloseParen::None,
            column,
            operator,
            value,
        }
    }

    pub fn with_concat(mut self, concat: Concat) -> Self {
        self.concat = concat;
        self
    }

    pub fn with_parens(mut self, open: OpenParen, close: CloseParen) -> Self {
        self.open = open;
        self.close = close;
        self
    }

    fn descriptors(&self) -> impl Iterator<Item = &ColumnDescriptor> + '_ {
        let right = match &self.value {
            Operand::Column(d) => Some(d),
            _ => None,
        };
        std::iter::once(&self.column).chain(right)
    }

    fn descriptors_mut(&mut self) -> impl Iterator<Item = &mut ColumnDescriptor> + '_ {
        let right = match &mut self.value {
            Operand::Column(d) => Some(d),
            _ => None,
        };
        std::iter::once(&mut self.column).chain(right)
    }

    fn compile_condition(&self, columns: &ColumnSet) -> ModelResult<String> {
        let left = projection(&self.column, columns)?;
        let condition = match (&self.operator, &self.value) {
            (Operator::IsNull | Operator::NotNull, _) => format!("{left} {}", self.operator.sql()),
            (Operator::Eq, Operand::Value(Value::Null)) => format!("{left} IS NULL"),
            (Operator::Ne, Operand::Value(Value::Null)) => format!("{left} IS NOT NULL"),
            (Operator::OneOf, Operand::Values(vs)) => format!("{left} IN ({})", literal_list(vs)),
            (Operator::OneOf, Operand::Value(v)) => format!("{left} IN ({})", v.sql_literal()),
            (op, Operand::Value(v)) => format!("{left} {} {}", op.sql(), v.sql_literal()),
            (op, Operand::Values(vs)) => {
                // Comparing against a list only makes sense as membership.
                log::debug!("operator {op:?} used with a value list; compiling as IN");
                format!("{left} IN ({})", literal_list(vs))
            }
            (op, Operand::Column(d)) => format!("{left} {} {}", op.sql(), projection(d, columns)?),
            (op, Operand::None) => {
                return Err(ModelError::MalformedState(format!(
                    "filter on {} uses {op:?} without an operand",
                    self.column.name
                )))
            }
        };
        Ok(condition)
    }
}

fn projection(descriptor: &ColumnDescriptor, columns: &ColumnSet) -> ModelResult<String> {
    let column = descriptor
        .resolve(columns)
        .ok_or_else(|| ModelError::UnknownColumn(descriptor.name.clone()))?;
    column.sql_projection(false, columns)
}

fn literal_list(values: &[Value]) -> String {
    values
        .iter()
        .map(Value::sql_literal)
        .collect::<Vec<_>>()
        .join(", ")
}

/// One element of a compact integer set: a single value or a closed range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdItem {
    Single(i64),
    Range(i64, i64),
}

/// Sort and dedupe `values`, then collapse every maximal run of consecutive
/// integers of length `>= min_run_length` into a closed range.
pub fn simplify_integer_list(values: &[i64], min_run_length: usize) -> Vec<IdItem> {
    let sorted: Vec<i64> = values.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    let mut out = Vec::new();
    let mut start = 0;
    while start < sorted.len() {
        let mut end = start;
        while end + 1 < sorted.len() && sorted[end + 1] == sorted[end] + 1 {
            end += 1;
        }
        let run = end - start + 1;
        if run >= min_run_length.max(2) {
            out.push(IdItem::Range(sorted[start], sorted[end]));
        } else {
            out.extend(sorted[start..=end].iter().copied().map(IdItem::Single));
        }
        start = end + 1;
    }
    out
}

/// Inverse of [`simplify_integer_list`].
pub fn expand_id_items(items: &[IdItem]) -> Vec<i64> {
    let mut out = Vec::new();
    for item in items {
        match *item {
            IdItem::Single(v) => out.push(v),
            IdItem::Range(a, b) => out.extend(a..=b),
        }
    }
    out
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKey {
    /// Shared project-wide, identified by its unique name.
    Named(String),
    /// Owned by exactly one table.
    Anonymous(Uuid),
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterKey::Named(name) => f.write_str(name),
            FilterKey::Anonymous(id) => write!(f, "<anonymous {id}>"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterBody {
    Entries(Vec<FilterEntry>),
    /// Membership of `column` in a compact integer set.
    Ids {
        column: ColumnDescriptor,
        items: Vec<IdItem>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    key: FilterKey,
    /// `true`: exclude matching rows; `false`: keep only matching rows.
    do_remove: bool,
    body: FilterBody,
}

impl Filter {
    pub fn anonymous(do_remove: bool, body: FilterBody) -> Self {
        Self {
            key: FilterKey::Anonymous(Uuid::new_v4()),
            do_remove,
            body,
        }
    }

    pub fn named(name: impl Into<String>, do_remove: bool, body: FilterBody) -> ModelResult<Self> {
        let name = name.into();
        crate::names::validate_name(&name)?;
        Ok(Self {
            key: FilterKey::Named(name),
            do_remove,
            body,
        })
    }

    /// Same description under a different key.
    pub fn with_key(mut self, key: FilterKey) -> Self {
        self.key = key;
        self
    }

    pub fn key(&self) -> &FilterKey {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        match &self.key {
            FilterKey::Named(name) => Some(name),
            FilterKey::Anonymous(_) => None,
        }
    }

    pub fn do_remove(&self) -> bool {
        self.do_remove
    }

    pub fn body(&self) -> &FilterBody {
        &self.body
    }

    pub fn descriptors(&self) -> Vec<&ColumnDescriptor> {
        match &self.body {
            FilterBody::Entries(entries) => entries.iter().flat_map(FilterEntry::descriptors).collect(),
            FilterBody::Ids { column, .. } => vec![column],
        }
    }

    fn descriptors_mut(&mut self) -> Vec<&mut ColumnDescriptor> {
        match &mut self.body {
            FilterBody::Entries(entries) => entries
                .iter_mut()
                .flat_map(FilterEntry::descriptors_mut)
                .collect(),
            FilterBody::Ids { column, .. } => vec![column],
        }
    }

    pub fn references_column(&self, name: &str) -> bool {
        self.descriptors().iter().any(|d| d.name == name)
    }

    /// Every referenced column still exists with the same type and dictionary.
    pub fn is_applicable(&self, columns: &ColumnSet) -> bool {
        let descriptors = self.descriptors();
        !descriptors.is_empty() && descriptors.iter().all(|d| d.resolve(columns).is_some())
    }

    /// Apply a set of column renames (`old -> new`) simultaneously.
    pub fn rename_columns(&mut self, renames: &HashMap<String, String>) {
        for descriptor in self.descriptors_mut() {
            if let Some(new) = renames.get(&descriptor.name) {
                descriptor.name = new.clone();
            }
        }
    }

    /// Compile to a parenthesized condition (`NOT (...)` for remove filters).
    pub fn compile(&self, columns: &ColumnSet) -> ModelResult<String> {
        let body = match &self.body {
            FilterBody::Entries(entries) => self.compile_entries(entries, columns)?,
            FilterBody::Ids { column, items } => compile_ids(column, items, columns)?,
        };
        if self.do_remove {
            Ok(format!("NOT ({body})"))
        } else {
            Ok(format!("({body})"))
        }
    }

    fn compile_entries(&self, entries: &[FilterEntry], columns: &ColumnSet) -> ModelResult<String> {
        let mut out = String::new();
        let mut depth = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            if i > 0 {
                out.push(' ');
                out.push_str(entry.concat.keyword());
                out.push(' ');
            }
            let open = entry.open.count();
            depth += open;
            out.push_str(&"(".repeat(open));
            out.push_str(&entry.compile_condition(columns)?);
            let close = match entry.close {
                CloseParen::None => 0,
                CloseParen::One => 1,
                CloseParen::Two => 2,
                CloseParen::Three => 3,
                CloseParen::All => depth,
            };
            if close > depth {
                return Err(ModelError::UnbalancedParens(self.key.to_string()));
            }
            depth -= close;
            out.push_str(&")".repeat(close));
        }
        // Parens left open at the end close implicitly.
        out.push_str(&")".repeat(depth));
        if out.is_empty() {
            // An empty filter matches everything.
            out.push('1');
        }
        Ok(out)
    }

    /// Remap an id-set filter through `mapping`, dropping unmapped members.
    ///
    /// Returns `false` when nothing is left and the filter should be discarded.
    /// Filters that are not id sets over the `id` column are left untouched.
    pub fn remap_ids(&mut self, mapping: &HashMap<i64, i64>, min_run_length: usize) -> bool {
        let FilterBody::Ids { column, items } = &mut self.body else {
            return true;
        };
        if column.name != ID_COLUMN {
            return true;
        }
        let remapped: Vec<i64> = expand_id_items(items)
            .into_iter()
            .filter_map(|old| mapping.get(&old).copied())
            .collect();
        *items = simplify_integer_list(&remapped, min_run_length);
        !items.is_empty()
    }
}

fn compile_ids(column: &ColumnDescriptor, items: &[IdItem], columns: &ColumnSet) -> ModelResult<String> {
    let target = projection(column, columns)?;
    let singles: Vec<String> = items
        .iter()
        .filter_map(|item| match item {
            IdItem::Single(v) => Some(v.to_string()),
            IdItem::Range(..) => None,
        })
        .collect();
    let mut parts = Vec::new();
    if !singles.is_empty() {
        parts.push(format!("{target} IN ({})", singles.join(", ")));
    }
    for item in items {
        if let IdItem::Range(a, b) = item {
            parts.push(format!("{target} BETWEEN {a} AND {b}"));
        }
    }
    if parts.is_empty() {
        return Ok("0".to_string());
    }
    Ok(parts.join(" OR "))
}

/// `WHERE` condition for a filter set, without the keyword. `None` if no filters.
pub fn where_condition(filters: &[&Filter], columns: &ColumnSet) -> ModelResult<Option<String>> {
    if filters.is_empty() {
        return Ok(None);
    }
    let parts = filters
        .iter()
        .map(|f| f.compile(columns))
        .collect::<ModelResult<Vec<_>>>()?;
    Ok(Some(parts.join(" AND ")))
}

/// Full `WHERE ...` clause, or an empty string when there are no filters.
pub fn compile_where_clause(filters: &[&Filter], columns: &ColumnSet) -> ModelResult<String> {
    Ok(where_condition(filters, columns)?
        .map(|c| format!("WHERE {c}"))
        .unwrap_or_default())
}

/// Equality chain over column/value pairs, joined with `concat`.
///
/// NULL values compile to `IS NULL`, so a filter built from a group's key
/// values also matches the group of NULLs.
pub fn filter_by_values(pairs: &[(ColumnDescriptor, Value)], concat: Concat, do_remove: bool) -> Filter {
    let entries = pairs
        .iter()
        .map(|(descriptor, value)| {
            let entry = if value.is_null() {
                FilterEntry::new(descriptor.clone(), Operator::IsNull, Operand::None)
            } else {
                FilterEntry::new(descriptor.clone(), Operator::Eq, Operand::Value(value.clone()))
            };
            entry.with_concat(concat)
        })
        .collect();
    Filter::anonymous(do_remove, FilterBody::Entries(entries))
}

/// Membership filter for a list of raw values of `column`.
///
/// Integer columns produce a compact id-set filter; everything else a `one of`
/// value list.
pub fn filter_by_data_list(
    column: &Column,
    values: &[Value],
    do_remove: bool,
    min_run_length: usize,
) -> Filter {
    let descriptor = ColumnDescriptor::of(column);
    if column.physical_type() == PhysicalType::Int {
        let ints: Vec<i64> = values.iter().filter_map(Value::as_i64).collect();
        return Filter::anonymous(
            do_remove,
            FilterBody::Ids {
                column: descriptor,
                items: simplify_integer_list(&ints, min_run_length),
            },
        );
    }

    let mut unique: Vec<Value> = Vec::new();
    for value in values.iter().filter(|v| !v.is_null()) {
        if !unique.contains(value) {
            unique.push(value.clone());
        }
    }
    let entry = FilterEntry::new(descriptor, Operator::OneOf, Operand::Values(unique));
    Filter::anonymous(do_remove, FilterBody::Entries(vec![entry]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Representation;
    use pretty_assertions::assert_eq;

    fn columns() -> ColumnSet {
        let mut set = ColumnSet::new();
        set.add(Column::stored("a", Representation::Int)).unwrap();
        set.add(Column::stored("v", Representation::Real)).unwrap();
        set
    }

    fn desc(set: &ColumnSet, name: &str) -> ColumnDescriptor {
        ColumnDescriptor::of(set.require(name).unwrap())
    }

    #[test]
    fn simplify_collapses_runs_of_min_length() {
        assert_eq!(
            simplify_integer_list(&[1, 2, 3, 4, 5, 8, 12, 13, 14], 4),
            vec![
                IdItem::Range(1, 5),
                IdItem::Single(8),
                IdItem::Single(12),
                IdItem::Single(13),
                IdItem::Single(14),
            ]
        );
        assert_eq!(
            simplify_integer_list(&[12, 13, 14, 15], 4),
            vec![IdItem::Range(12, 15)]
        );
        assert_eq!(simplify_integer_list(&[], 4), vec![]);
    }

    #[test]
    fn parens_and_close_all() {
        let set = columns();
        let entries = vec![
            FilterEntry::new(desc(&set, "a"), Operator::Eq, Operand::Value(1.into()))
                .with_parens(OpenParen::Two, CloseParen::None),
            FilterEntry::new(desc(&set, "v"), Operator::Gt, Operand::Value(2.5.into()))
                .with_concat(Concat::Or)
                .with_parens(OpenParen::None, CloseParen::One),
            FilterEntry::new(desc(&set, "a"), Operator::IsNull, Operand::None)
                .with_concat(Concat::And)
                .with_parens(OpenParen::None, CloseParen::All),
            FilterEntry::new(
                desc(&set, "a"),
                Operator::OneOf,
                Operand::Values(vec![1.into(), 2.into()]),
            )
            .with_concat(Concat::Or),
        ];
        let filter = Filter::anonymous(false, FilterBody::Entries(entries));
        assert_eq!(
            filter.compile(&set).unwrap(),
            "(((\"a\" = 1 OR \"v\" > 2.5) AND \"a\" IS NULL) OR \"a\" IN (1, 2))"
        );
    }

    #[test]
    fn closing_more_than_opened_is_an_error() {
        let set = columns();
        let entries = vec![FilterEntry::new(desc(&set, "a"), Operator::NotNull, Operand::None)
            .with_parens(OpenParen::None, CloseParen::One)];
        let filter = Filter::anonymous(false, FilterBody::Entries(entries));
        assert!(matches!(filter.compile(&set), Err(ModelError::UnbalancedParens(_))));
    }

    #[test]
    fn comparison_without_operand_is_an_error() {
        let set = columns();
        let entries = vec![FilterEntry::new(desc(&set, "a"), Operator::Eq, Operand::None)];
        let filter = Filter::anonymous(false, FilterBody::Entries(entries));
        assert!(matches!(filter.compile(&set), Err(ModelError::MalformedState(_))));
    }

    #[test]
    fn where_clause_conjoins_filters() {
        let set = columns();
        assert_eq!(compile_where_clause(&[], &set).unwrap(), "");

        let keep = filter_by_data_list(set.require("id").unwrap(), &[1.into()], false, 4);
        let drop = filter_by_values(&[(desc(&set, "v"), Value::Null)], Concat::And, true);
        assert_eq!(
            compile_where_clause(&[&keep, &drop], &set).unwrap(),
            "WHERE (\"id\" IN (1)) AND NOT (\"v\" IS NULL)"
        );
    }

    #[test]
    fn compile_is_deterministic() {
        let set = columns();
        let f = filter_by_data_list(
            set.require("id").unwrap(),
            &[9.into(), 1.into(), 2.into(), 3.into(), 4.into()],
            true,
            4,
        );
        let first = f.compile(&set).unwrap();
        assert_eq!(first, "NOT (\"id\" IN (9) OR \"id\" BETWEEN 1 AND 4)");
        assert_eq!(f.compile(&set).unwrap(), first);
    }

    #[test]
    fn applicability_follows_type_changes() {
        let mut set = columns();
        let f = filter_by_values(&[(desc(&set, "a"), 3.into())], Concat::And, false);
        assert!(f.is_applicable(&set));
        set.set_representation("a", Representation::Text).unwrap();
        assert!(!f.is_applicable(&set));
    }

    #[test]
    fn remap_drops_missing_ids() {
        let set = columns();
        let mut f = filter_by_data_list(set.require("id").unwrap(), &[2.into(), 5.into()], false, 4);
        let mapping = HashMap::from([(2, 1)]);
        assert!(f.remap_ids(&mapping, 4));
        assert_eq!(
            f.body(),
            &FilterBody::Ids {
                column: desc(&set, "id"),
                items: vec![IdItem::Single(1)],
            }
        );
        assert!(!f.remap_ids(&HashMap::new(), 4));
    }

    #[test]
    fn descriptor_format_round_trips() {
        let set = columns();
        let f = filter_by_values(&[(desc(&set, "a"), 3.into())], Concat::Or, false);
        let text = serde_json::to_string(&f).unwrap();
        assert!(text.contains("\"operator\":\"==\""), "{text}");
        let back: Filter = serde_json::from_str(&text).unwrap();
        assert_eq!(back, f);
    }
}
