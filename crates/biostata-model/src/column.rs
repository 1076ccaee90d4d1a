//! Column model.
//!
//! A [`Column`] is either *stored* (materialized in the staging table together
//! with a status column) or *computed* (a registry function over other columns,
//! evaluated at query time). Both carry a [`Representation`] that maps between
//! the raw stored value and the value shown to users.
use crate::dictionary::{Dictionary, DictionaryStore};
use crate::error::{ModelError, ModelResult};
use crate::functions::{FunctionId, Kwargs, FUNC_NAME_KEY};
use crate::names::{quote_ident, ID_COLUMN};
use crate::types::{PhysicalType, StorageType};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Raw ↔ display mapping of a column.
#[derive(Clone, Debug)]
pub enum Representation {
    Int,
    Real,
    Text,
    Dictionary(Arc<Dictionary>),
}

impl Representation {
    /// Build the representation for a physical type. `ENUM`/`BOOL` need a
    /// dictionary of the matching kind; other types ignore it.
    pub fn for_type(
        physical_type: PhysicalType,
        dictionary: Option<Arc<Dictionary>>,
    ) -> ModelResult<Self> {
        match physical_type {
            PhysicalType::Int => Ok(Representation::Int),
            PhysicalType::Real => Ok(Representation::Real),
            PhysicalType::Text => Ok(Representation::Text),
            PhysicalType::Enum | PhysicalType::Bool => {
                let dictionary = dictionary.ok_or_else(|| {
                    ModelError::MalformedState(format!(
                        "{physical_type} column needs a dictionary"
                    ))
                })?;
                if dictionary.physical_type() != physical_type {
                    return Err(ModelError::DictionaryMismatch {
                        column: physical_type.to_string(),
                        dictionary: dictionary.name().to_string(),
                    });
                }
                Ok(Representation::Dictionary(dictionary))
            }
        }
    }

    pub fn physical_type(&self) -> PhysicalType {
        match self {
            Representation::Int => PhysicalType::Int,
            Representation::Real => PhysicalType::Real,
            Representation::Text => PhysicalType::Text,
            Representation::Dictionary(d) => d.physical_type(),
        }
    }

    pub fn dictionary(&self) -> Option<&Arc<Dictionary>> {
        match self {
            Representation::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn dictionary_name(&self) -> Option<&str> {
        self.dictionary().map(|d| d.name())
    }

    /// Same physical type and, for dictionary columns, the same dictionary.
    pub fn same_as(&self, other: &Representation) -> bool {
        self.physical_type() == other.physical_type()
            && self.dictionary_name() == other.dictionary_name()
    }

    /// Raw → display. Dictionary misses map to NULL.
    pub fn represent(&self, raw: &Value) -> Value {
        match self {
            Representation::Dictionary(d) => raw
                .as_i64()
                .and_then(|k| d.value_of(k))
                .map(|v| Value::Text(v.to_string()))
                .unwrap_or(Value::Null),
            _ => self.cast(raw),
        }
    }

    /// Display → raw. Dictionary misses map to NULL.
    pub fn dematerialize(&self, display: &Value) -> Value {
        match self {
            Representation::Dictionary(d) => display
                .as_text()
                .and_then(|v| d.key_of(&v))
                .map(Value::Integer)
                .unwrap_or(Value::Null),
            _ => self.cast(display),
        }
    }

    /// Coerce an imported value into raw storage form.
    ///
    /// Dictionary columns accept either a valid key or a display string.
    pub fn coerce(&self, value: &Value) -> Value {
        match self {
            Representation::Dictionary(d) => {
                if let Value::Text(s) = value {
                    if let Some(k) = d.key_of(s) {
                        return Value::Integer(k);
                    }
                }
                value
                    .as_i64()
                    .filter(|k| d.contains_key(*k))
                    .map(Value::Integer)
                    .unwrap_or(Value::Null)
            }
            _ => self.cast(value),
        }
    }

    fn cast(&self, value: &Value) -> Value {
        match self {
            Representation::Int => match value {
                Value::Real(r) if r.is_finite() => Value::Integer(r.round() as i64),
                other => other.as_i64().map(Value::Integer).unwrap_or(Value::Null),
            },
            Representation::Real => value.as_f64().map(Value::Real).unwrap_or(Value::Null),
            Representation::Text => value.as_text().map(Value::Text).unwrap_or(Value::Null),
            Representation::Dictionary(_) => value.clone(),
        }
    }
}

/// Aggregate applied to a column in grouped display mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupFunction {
    Avg,
    /// Common value of the group, or NULL on disagreement.
    CategoryGroup,
}

impl GroupFunction {
    pub fn for_type(physical_type: PhysicalType) -> Self {
        if physical_type.is_category() {
            GroupFunction::CategoryGroup
        } else {
            GroupFunction::Avg
        }
    }

    pub fn sql_name(self) -> &'static str {
        match self {
            GroupFunction::Avg => "AVG",
            GroupFunction::CategoryGroup => "category_group",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct StoredColumn;

#[derive(Clone, Debug)]
pub struct ComputedColumn {
    function: FunctionId,
    deps: Vec<String>,
    use_before_grouping: bool,
    kwargs: Kwargs,
}

impl ComputedColumn {
    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn deps(&self) -> &[String] {
        &self.deps
    }

    pub fn use_before_grouping(&self) -> bool {
        self.use_before_grouping
    }

    pub fn kwargs(&self) -> &Kwargs {
        &self.kwargs
    }
}

#[derive(Clone, Debug)]
pub enum ColumnKind {
    Stored(StoredColumn),
    Computed(ComputedColumn),
}

#[derive(Clone, Debug)]
pub struct Column {
    name: String,
    shortname: String,
    dim: String,
    comment: String,
    repr: Representation,
    kind: ColumnKind,
}

impl Column {
    pub fn stored(name: impl Into<String>, repr: Representation) -> Self {
        let name = name.into();
        Self {
            shortname: name.clone(),
            name,
            dim: String::new(),
            comment: String::new(),
            repr,
            kind: ColumnKind::Stored(StoredColumn),
        }
    }

    /// The mandatory first column.
    pub fn id() -> Self {
        Self::stored(ID_COLUMN, Representation::Int)
    }

    /// Build a computed column. `func_name` is added to `kwargs` so the bag
    /// alone is enough to rebuild the function.
    pub fn computed(
        name: impl Into<String>,
        repr: Representation,
        function: FunctionId,
        deps: Vec<String>,
        use_before_grouping: bool,
        mut kwargs: Kwargs,
    ) -> ModelResult<Self> {
        function.check(deps.len(), &kwargs)?;
        kwargs.insert(
            FUNC_NAME_KEY.to_string(),
            JsonValue::String(function.name().to_string()),
        );
        let name = name.into();
        Ok(Self {
            shortname: name.clone(),
            name,
            dim: String::new(),
            comment: String::new(),
            repr,
            kind: ColumnKind::Computed(ComputedColumn {
                function,
                deps,
                use_before_grouping,
                kwargs,
            }),
        })
    }

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

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shortname(&self) -> &str {
        &self.shortname
    }

    pub fn dim(&self) -> &str {
        &self.dim
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn set_shortname(&mut self, shortname: impl Into<String>) {
        self.shortname = shortname.into();
    }

    pub fn set_dim(&mut self, dim: impl Into<String>) {
        self.dim = dim.into();
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    pub fn representation(&self) -> &Representation {
        &self.repr
    }

    pub fn kind(&self) -> &ColumnKind {
        &self.kind
    }

    pub fn computed_spec(&self) -> Option<&ComputedColumn> {
        match &self.kind {
            ColumnKind::Computed(c) => Some(c),
            ColumnKind::Stored(_) => None,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self.kind, ColumnKind::Stored(_))
    }

    pub fn is_id(&self) -> bool {
        self.name == ID_COLUMN && self.is_stored()
    }

    pub fn physical_type(&self) -> PhysicalType {
        self.repr.physical_type()
    }

    pub fn storage_type(&self) -> StorageType {
        self.physical_type().storage_type()
    }

    pub fn dictionary(&self) -> Option<&Arc<Dictionary>> {
        self.repr.dictionary()
    }

    pub fn dictionary_name(&self) -> Option<&str> {
        self.repr.dictionary_name()
    }

    pub fn is_category(&self) -> bool {
        self.physical_type().is_category()
    }

    pub fn group_function(&self) -> GroupFunction {
        GroupFunction::for_type(self.physical_type())
    }

    pub fn same_representation(&self, other: &Column) -> bool {
        self.repr.same_as(&other.repr)
    }

    pub fn represent(&self, raw: &Value) -> Value {
        self.repr.represent(raw)
    }

    pub fn dematerialize(&self, display: &Value) -> Value {
        self.repr.dematerialize(display)
    }

    /// Direct dependencies (empty for stored columns).
    pub fn deps(&self) -> &[String] {
        self.computed_spec().map(ComputedColumn::deps).unwrap_or(&[])
    }

    /// Name of the companion status column in the staging table.
    pub fn status_name(&self) -> String {
        status_column_name(&self.name)
    }

    /// SQL expression for this column, optionally in grouped form.
    ///
    /// Computed columns resolve their dependencies through `columns`.
    pub fn sql_projection(&self, use_grouping: bool, columns: &ColumnSet) -> ModelResult<String> {
        let group_fn = self.group_function().sql_name();
        match &self.kind {
            ColumnKind::Stored(_) => {
                let quoted = quote_ident(&self.name);
                if use_grouping {
                    Ok(format!("{group_fn}({quoted})"))
                } else {
                    Ok(quoted)
                }
            }
            ColumnKind::Computed(spec) => {
                // Applied per row first, then aggregated as a whole.
                let per_row = !use_grouping || spec.use_before_grouping;
                let mut args = Vec::with_capacity(spec.deps.len() + 2);
                for dep in &spec.deps {
                    args.push(columns.require(dep)?.sql_projection(!per_row, columns)?);
                }
                args.extend(spec.function.param_literals(&spec.kwargs)?);
                let call = format!("{}({})", spec.function.sql_name(), args.join(", "));
                if use_grouping && spec.use_before_grouping {
                    Ok(format!("{group_fn}({call})"))
                } else {
                    Ok(call)
                }
            }
        }
    }

    /// SQL expression for the status flag of this column.
    ///
    /// Computed columns have no status of their own and report `0`.
    pub fn status_projection(&self, use_grouping: bool) -> String {
        if !self.is_stored() {
            return "0".to_string();
        }
        let quoted = quote_ident(&self.status_name());
        if use_grouping {
            format!("MAX({quoted})")
        } else {
            quoted
        }
    }

    pub fn to_state(&self) -> ColumnState {
        let (deps, use_before_grouping, kwargs) = match &self.kind {
            ColumnKind::Stored(_) => (Vec::new(), false, Kwargs::new()),
            ColumnKind::Computed(c) => (c.deps.clone(), c.use_before_grouping, c.kwargs.clone()),
        };
        ColumnState {
            name: self.name.clone(),
            physical_type: self.physical_type().to_string(),
            dict: self.dictionary_name().map(str::to_string),
            shortname: self.shortname.clone(),
            dim: self.dim.clone(),
            comment: self.comment.clone(),
            is_original: self.is_stored(),
            group_fn: self.group_function().sql_name().to_string(),
            deps,
            use_before_grouping,
            kwargs,
        }
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn set_representation(&mut self, repr: Representation) {
        self.repr = repr;
    }

    pub(crate) fn rename_dependency(&mut self, old: &str, new: &str) {
        if let ColumnKind::Computed(spec) = &mut self.kind {
            for dep in spec.deps.iter_mut().filter(|d| d.as_str() == old) {
                *dep = new.to_string();
            }
        }
    }
}

pub fn status_column_name(column: &str) -> String {
    format!("_status_{column}")
}

/// Persisted description of a column (the `state` blob of a column-info row).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnState {
    pub name: String,
    #[serde(rename = "type")]
    pub physical_type: String,
    #[serde(default)]
    pub dict: Option<String>,
    #[serde(default)]
    pub shortname: String,
    #[serde(default)]
    pub dim: String,
    #[serde(default)]
    pub comment: String,
    pub is_original: bool,
    pub group_fn: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,
    #[serde(default)]
    pub use_before_grouping: bool,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub kwargs: Kwargs,
}

impl ColumnState {
    fn representation(&self, dictionaries: &DictionaryStore) -> ModelResult<Representation> {
        let physical_type: PhysicalType = self.physical_type.parse()?;
        let dictionary = match (&self.dict, physical_type.uses_dictionary()) {
            (Some(name), true) => Some(dictionaries.require(name)?),
            (None, true) => {
                return Err(ModelError::MalformedState(format!(
                    "column {} of type {physical_type} has no dictionary",
                    self.name
                )))
            }
            (_, false) => None,
        };
        Representation::for_type(physical_type, dictionary)
    }

    fn function(&self) -> ModelResult<FunctionId> {
        let name = self
            .kwargs
            .get(FUNC_NAME_KEY)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                ModelError::MalformedState(format!(
                    "computed column {} has no {FUNC_NAME_KEY}",
                    self.name
                ))
            })?;
        name.parse()
    }

    /// Rebuild the column. Dependencies of computed columns must already be in `columns`.
    pub fn build(&self, dictionaries: &DictionaryStore, columns: &ColumnSet) -> ModelResult<Column> {
        let repr = self.representation(dictionaries)?;
        let column = if self.is_original {
            Column::stored(self.name.clone(), repr)
        } else {
            let function = self.function()?;
            for dep in &self.deps {
                columns.require(dep)?;
            }
            Column::computed(
                self.name.clone(),
                repr,
                function,
                self.deps.clone(),
                self.use_before_grouping,
                self.kwargs.clone(),
            )?
        };
        Ok(column
            .with_shortname(self.shortname.clone())
            .with_dim(self.dim.clone())
            .with_comment(self.comment.clone()))
    }
}

/// Ordered column collection of a table.
///
/// Invariants: `id` is first; all category columns precede all data columns;
/// computed columns only reference columns of the same set.
#[derive(Clone, Debug)]
pub struct ColumnSet {
    columns: Vec<Column>,
}

impl Default for ColumnSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ColumnSet {
    /// A set holding only the `id` column.
    pub fn new() -> Self {
        Self {
            columns: vec![Column::id()],
        }
    }

    /// Rebuild from persisted states, building dependencies first.
    pub fn restore(states: &[ColumnState], dictionaries: &DictionaryStore) -> ModelResult<Self> {
        let mut set = ColumnSet { columns: Vec::new() };
        let mut in_progress = Vec::new();
        for state in states {
            set.restore_one(state, states, dictionaries, &mut in_progress)?;
        }
        match set.columns.first() {
            Some(first) if first.is_id() && first.physical_type() == PhysicalType::Int => {}
            _ => {
                return Err(ModelError::MalformedState(
                    "first column must be the integer id column".into(),
                ))
            }
        }
        set.restore_partition();
        Ok(set)
    }

    fn restore_one(
        &mut self,
        state: &ColumnState,
        all: &[ColumnState],
        dictionaries: &DictionaryStore,
        in_progress: &mut Vec<String>,
    ) -> ModelResult<()> {
        if self.contains(&state.name) {
            return Ok(());
        }
        if in_progress.contains(&state.name) {
            return Err(ModelError::DependencyCycle(state.name.clone()));
        }
        in_progress.push(state.name.clone());
        for dep in &state.deps {
            if self.contains(dep) {
                continue;
            }
            let dep_state = all
                .iter()
                .find(|s| &s.name == dep)
                .ok_or_else(|| ModelError::UnknownColumn(dep.clone()))?;
            self.restore_one(dep_state, all, dictionaries, in_progress)?;
        }
        let column = state.build(dictionaries, self)?;
        in_progress.retain(|n| n != &state.name);
        self.columns.push(column);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> + '_ {
        self.columns.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(Column::name)
    }

    pub fn stored(&self) -> impl Iterator<Item = &Column> + '_ {
        self.columns.iter().filter(|c| c.is_stored())
    }

    pub fn at(&self, idx: usize) -> Option<&Column> {
        self.columns.get(idx)
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn require(&self, name: &str) -> ModelResult<&Column> {
        self.get(name)
            .ok_or_else(|| ModelError::UnknownColumn(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Add a column after the last column of its partition.
    pub fn add(&mut self, column: Column) -> ModelResult<()> {
        crate::names::validate_unique(&column.name, self.names())?;
        for dep in column.deps() {
            self.require(dep)?;
        }
        let idx = if column.is_category() {
            self.columns
                .iter()
                .rposition(Column::is_category)
                .map(|i| i + 1)
                .unwrap_or(0)
        } else {
            self.columns.len()
        };
        self.columns.insert(idx, column);
        Ok(())
    }

    /// Computed columns that directly depend on `name`.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.deps().iter().any(|d| d == name))
            .map(Column::name)
            .collect()
    }

    /// Remove a column nothing else depends on.
    pub fn remove(&mut self, name: &str) -> ModelResult<Column> {
        let idx = self
            .position(name)
            .ok_or_else(|| ModelError::UnknownColumn(name.to_string()))?;
        if self.columns[idx].is_id() {
            return Err(ModelError::IdColumn("removed"));
        }
        if let Some(dependent) = self.dependents(name).first() {
            return Err(ModelError::ColumnInUse {
                column: name.to_string(),
                dependent: dependent.to_string(),
            });
        }
        Ok(self.columns.remove(idx))
    }

    /// Rename a column and every dependency reference to it.
    pub fn rename(&mut self, old: &str, new: &str) -> ModelResult<()> {
        if old == new {
            return Ok(());
        }
        let idx = self
            .position(old)
            .ok_or_else(|| ModelError::UnknownColumn(old.to_string()))?;
        if self.columns[idx].is_id() {
            return Err(ModelError::IdColumn("renamed"));
        }
        crate::names::validate_unique(new, self.names().filter(|n| *n != old))?;
        self.columns[idx].set_name(new.to_string());
        for column in &mut self.columns {
            column.rename_dependency(old, new);
        }
        Ok(())
    }

    /// Apply several renames at once, so swaps like `a -> b, b -> a` work.
    pub fn rename_all(&mut self, renames: &HashMap<String, String>) -> ModelResult<()> {
        let renames: HashMap<&str, &str> = renames
            .iter()
            .filter(|(old, new)| old != new)
            .map(|(old, new)| (old.as_str(), new.as_str()))
            .collect();
        for old in renames.keys() {
            let column = self.require(old)?;
            if column.is_id() {
                return Err(ModelError::IdColumn("renamed"));
            }
        }
        let final_names: Vec<&str> = self
            .names()
            .map(|n| renames.get(n).copied().unwrap_or(n))
            .collect();
        for (i, name) in final_names.iter().enumerate() {
            if renames.values().any(|new| new == name) {
                crate::names::validate_unique(
                    name,
                    final_names
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, n)| *n),
                )?;
            }
        }

        let renames: HashMap<String, String> = renames
            .into_iter()
            .map(|(old, new)| (old.to_string(), new.to_string()))
            .collect();
        for column in &mut self.columns {
            if let Some(new) = renames.get(&column.name) {
                column.set_name(new.clone());
            }
            if let ColumnKind::Computed(spec) = &mut column.kind {
                for dep in &mut spec.deps {
                    if let Some(new) = renames.get(dep) {
                        *dep = new.clone();
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove a group of columns at once. No remaining column may depend on
    /// any of them.
    pub fn remove_all(&mut self, names: &BTreeSet<String>) -> ModelResult<Vec<Column>> {
        for name in names {
            if self.require(name)?.is_id() {
                return Err(ModelError::IdColumn("removed"));
            }
        }
        for column in self.columns.iter().filter(|c| !names.contains(&c.name)) {
            if let Some(dep) = column.deps().iter().find(|d| names.contains(*d)) {
                return Err(ModelError::ColumnInUse {
                    column: dep.clone(),
                    dependent: column.name.clone(),
                });
            }
        }
        let (removed, kept): (Vec<Column>, Vec<Column>) = std::mem::take(&mut self.columns)
            .into_iter()
            .partition(|c| names.contains(&c.name));
        self.columns = kept;
        Ok(removed)
    }

    /// Swap a column's representation and restore the partition order.
    pub fn set_representation(&mut self, name: &str, repr: Representation) -> ModelResult<()> {
        let column = self
            .get_mut(name)
            .ok_or_else(|| ModelError::UnknownColumn(name.to_string()))?;
        if column.is_id() && !repr.same_as(&Representation::Int) {
            return Err(ModelError::IdColumn("retyped"));
        }
        column.set_representation(repr);
        self.restore_partition();
        Ok(())
    }

    /// Stable partition: category columns first, data columns after.
    pub fn restore_partition(&mut self) {
        self.columns.sort_by_key(|c| !c.is_category());
    }

    pub fn is_partitioned(&self) -> bool {
        let first_data = self
            .columns
            .iter()
            .position(|c| !c.is_category())
            .unwrap_or(self.columns.len());
        self.columns[first_data..].iter().all(|c| !c.is_category())
    }

    /// Re-point dictionary columns at a replacement dictionary with the same name.
    pub fn rebind_dictionary(&mut self, dictionary: &Arc<Dictionary>) {
        for column in &mut self.columns {
            if column.dictionary_name() == Some(dictionary.name()) {
                column.set_representation(Representation::Dictionary(Arc::clone(dictionary)));
            }
        }
    }

    pub fn states(&self) -> Vec<ColumnState> {
        self.columns.iter().map(Column::to_state).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::DictionaryType;
    use pretty_assertions::assert_eq;

    fn kwargs(json: serde_json::Value) -> Kwargs {
        json.as_object().cloned().unwrap_or_default()
    }

    fn sample() -> ColumnSet {
        let mut set = ColumnSet::new();
        set.add(Column::stored("a", Representation::Real)).unwrap();
        set.add(Column::stored("b", Representation::Real)).unwrap();
        set
    }

    #[test]
    fn stored_projection() {
        let set = sample();
        let a = set.require("a").unwrap();
        assert_eq!(a.sql_projection(false, &set).unwrap(), "\"a\"");
        assert_eq!(a.sql_projection(true, &set).unwrap(), "AVG(\"a\")");
        let id = set.require("id").unwrap();
        assert_eq!(id.sql_projection(true, &set).unwrap(), "category_group(\"id\")");
    }

    #[test]
    fn computed_projection_respects_use_before_grouping() {
        let mut set = sample();
        let deps = vec!["a".to_string(), "b".to_string()];
        set.add(
            Column::computed("s", Representation::Real, FunctionId::Add, deps.clone(), true, Kwargs::new())
                .unwrap(),
        )
        .unwrap();
        set.add(
            Column::computed("t", Representation::Real, FunctionId::Add, deps, false, Kwargs::new())
                .unwrap(),
        )
        .unwrap();

        let s = set.require("s").unwrap();
        let t = set.require("t").unwrap();
        assert_eq!(s.sql_projection(false, &set).unwrap(), "bs_add(\"a\", \"b\")");
        assert_eq!(s.sql_projection(true, &set).unwrap(), "AVG(bs_add(\"a\", \"b\"))");
        assert_eq!(
            t.sql_projection(true, &set).unwrap(),
            "bs_add(AVG(\"a\"), AVG(\"b\"))"
        );
    }

    #[test]
    fn kwargs_become_trailing_literals() {
        let mut set = sample();
        let col = Column::computed(
            "fit",
            Representation::Real,
            FunctionId::Linear,
            vec!["a".into()],
            false,
            kwargs(serde_json::json!({"slope": 2.0, "intercept": 1})),
        )
        .unwrap();
        set.add(col).unwrap();
        let fit = set.require("fit").unwrap();
        assert_eq!(fit.sql_projection(false, &set).unwrap(), "bs_linear(\"a\", 2.0, 1)");
        assert_eq!(fit.computed_spec().unwrap().kwargs()["func_name"], "linear");
    }

    #[test]
    fn partition_is_kept_on_add_and_retype() {
        let mut set = sample();
        set.add(Column::stored("label", Representation::Text)).unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), ["id", "label", "a", "b"]);

        set.set_representation("b", Representation::Int).unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), ["id", "label", "b", "a"]);
        assert!(set.is_partitioned());
    }

    #[test]
    fn id_column_is_protected() {
        let mut set = sample();
        assert!(matches!(set.remove("id"), Err(ModelError::IdColumn(_))));
        assert!(matches!(
            set.set_representation("id", Representation::Real),
            Err(ModelError::IdColumn(_))
        ));
    }

    #[test]
    fn dictionary_lookup_miss_is_null() {
        let dict = Arc::new(
            Dictionary::from_pairs("bt", DictionaryType::Enum, [(0, "no"), (1, "b4p")]).unwrap(),
        );
        let repr = Representation::Dictionary(dict);
        assert_eq!(repr.represent(&Value::Integer(1)), Value::from("b4p"));
        assert_eq!(repr.represent(&Value::Integer(7)), Value::Null);
        assert_eq!(repr.dematerialize(&Value::from("zzz")), Value::Null);
        assert_eq!(repr.coerce(&Value::from("no")), Value::Integer(0));
    }

    #[test]
    fn restore_builds_dependencies_first() {
        let mut set = sample();
        set.add(
            Column::computed("c1", Representation::Real, FunctionId::Abs, vec!["a".into()], false, Kwargs::new())
                .unwrap(),
        )
        .unwrap();
        set.add(
            Column::computed("c2", Representation::Real, FunctionId::Exp, vec!["c1".into()], false, Kwargs::new())
                .unwrap(),
        )
        .unwrap();

        let mut states = set.states();
        // Put the dependent column before its dependency.
        let c2 = states.pop().unwrap();
        states.insert(1, c2);

        let restored = ColumnSet::restore(&states, &DictionaryStore::new()).unwrap();
        assert_eq!(restored.len(), 5);
        assert_eq!(restored.require("c2").unwrap().deps(), ["c1"]);
    }

    #[test]
    fn restore_rejects_unknown_function() {
        let mut states = ColumnSet::new().states();
        states.push(ColumnState {
            name: "x".into(),
            physical_type: "REAL".into(),
            dict: None,
            shortname: String::new(),
            dim: String::new(),
            comment: String::new(),
            is_original: false,
            group_fn: "AVG".into(),
            deps: vec!["id".into()],
            use_before_grouping: false,
            kwargs: kwargs(serde_json::json!({"func_name": "median"})),
        });
        let err = ColumnSet::restore(&states, &DictionaryStore::new()).unwrap_err();
        assert!(matches!(err, ModelError::UnknownFunction(f) if f == "median"));
    }

    #[test]
    fn state_without_required_field_fails_to_parse() {
        let json = r#"{"name":"a","type":"REAL","group_fn":"AVG"}"#;
        assert!(serde_json::from_str::<ColumnState>(json).is_err());
    }
}
