//! Value dictionaries for `ENUM` and `BOOL` columns.
//!
//! A dictionary is an ordered bijection between integer keys (what the staging
//! table stores) and display strings (what users see). Columns and filters refer
//! to dictionaries by name so that references survive persistence.
use crate::error::{ModelError, ModelResult};
use crate::types::PhysicalType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DictionaryType {
    Enum,
    Bool,
}

impl DictionaryType {
    pub fn physical_type(self) -> PhysicalType {
        match self {
            DictionaryType::Enum => PhysicalType::Enum,
            DictionaryType::Bool => PhysicalType::Bool,
        }
    }

    /// Inverse of [`DictionaryType::physical_type`].
    pub fn for_physical(physical_type: PhysicalType) -> ModelResult<Self> {
        match physical_type {
            PhysicalType::Enum => Ok(DictionaryType::Enum),
            PhysicalType::Bool => Ok(DictionaryType::Bool),
            other => Err(ModelError::UnknownType(format!("{other} has no dictionary"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DictionaryState", into = "DictionaryState")]
pub struct Dictionary {
    name: String,
    dict_type: DictionaryType,
    keys: Vec<i64>,
    values: Vec<String>,
    comments: Vec<String>,
}

/// Persisted layout: parallel key/value/comment lists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DictionaryState {
    pub name: String,
    #[serde(rename = "type")]
    pub dict_type: DictionaryType,
    pub keys: Vec<i64>,
    pub values: Vec<String>,
    #[serde(default)]
    pub comments: Vec<String>,
}

impl Dictionary {
    /// Build a dictionary, checking the bijection.
    ///
    /// `comments` may be empty, in which case every entry gets an empty comment.
    pub fn new(
        name: impl Into<String>,
        dict_type: DictionaryType,
        keys: Vec<i64>,
        values: Vec<String>,
        comments: Vec<String>,
    ) -> ModelResult<Self> {
        let name = name.into();
        let invalid = |reason: String| ModelError::InvalidDictionary {
            name: name.clone(),
            reason,
        };

        if keys.len() != values.len() {
            return Err(invalid(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
        let comments = if comments.is_empty() {
            vec![String::new(); keys.len()]
        } else if comments.len() == keys.len() {
            comments
        } else {
            return Err(invalid(format!(
                "{} keys but {} comments",
                keys.len(),
                comments.len()
            )));
        };

        let mut seen_keys = HashSet::new();
        if let Some(dup) = keys.iter().find(|k| !seen_keys.insert(**k)) {
            return Err(invalid(format!("duplicate key {dup}")));
        }
        let mut seen_values = HashSet::new();
        if let Some(dup) = values.iter().find(|v| !seen_values.insert(v.as_str())) {
            return Err(invalid(format!("duplicate value {dup:?}")));
        }

        if dict_type == DictionaryType::Bool {
            let mut sorted = keys.clone();
            sorted.sort_unstable();
            if sorted != [0, 1] {
                return Err(invalid("boolean dictionaries need exactly the keys 0 and 1".into()));
            }
        }

        Ok(Self {
            name,
            dict_type,
            keys,
            values,
            comments,
        })
    }

    /// Convenience constructor from `(key, value)` pairs without comments.
    pub fn from_pairs<V: Into<String>>(
        name: impl Into<String>,
        dict_type: DictionaryType,
        pairs: impl IntoIterator<Item = (i64, V)>,
    ) -> ModelResult<Self> {
        let (keys, values): (Vec<i64>, Vec<String>) =
            pairs.into_iter().map(|(k, v)| (k, v.into())).unzip();
        Self::new(name, dict_type, keys, values, Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dict_type(&self) -> DictionaryType {
        self.dict_type
    }

    pub fn physical_type(&self) -> PhysicalType {
        self.dict_type.physical_type()
    }

    pub fn keys(&self) -> &[i64] {
        &self.keys
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (i64, &str)> + '_ {
        self.keys
            .iter()
            .copied()
            .zip(self.values.iter().map(String::as_str))
    }

    pub fn value_of(&self, key: i64) -> Option<&str> {
        let idx = self.keys.iter().position(|k| *k == key)?;
        Some(self.values[idx].as_str())
    }

    pub fn key_of(&self, value: &str) -> Option<i64> {
        let idx = self.values.iter().position(|v| v == value)?;
        Some(self.keys[idx])
    }

    pub fn contains_key(&self, key: i64) -> bool {
        self.keys.contains(&key)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl TryFrom<DictionaryState> for Dictionary {
    type Error = ModelError;

    fn try_from(s: DictionaryState) -> ModelResult<Self> {
        Dictionary::new(s.name, s.dict_type, s.keys, s.values, s.comments)
    }
}

impl From<Dictionary> for DictionaryState {
    fn from(d: Dictionary) -> Self {
        DictionaryState {
            name: d.name,
            dict_type: d.dict_type,
            keys: d.keys,
            values: d.values,
            comments: d.comments,
        }
    }
}

/// Project-wide dictionary registry, keyed by dictionary name.
#[derive(Clone, Debug, Default)]
pub struct DictionaryStore {
    dictionaries: BTreeMap<String, Arc<Dictionary>>,
}

impl DictionaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Dictionary>> {
        self.dictionaries.get(name)
    }

    pub fn require(&self, name: &str) -> ModelResult<Arc<Dictionary>> {
        self.get(name)
            .cloned()
            .ok_or_else(|| ModelError::UnknownDictionary(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dictionaries.contains_key(name)
    }

    /// Insert or replace a dictionary, returning the shared handle.
    pub fn insert(&mut self, dictionary: Dictionary) -> Arc<Dictionary> {
        let dictionary = Arc::new(dictionary);
        self.dictionaries
            .insert(dictionary.name().to_string(), Arc::clone(&dictionary));
        dictionary
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<Dictionary>> {
        self.dictionaries.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.dictionaries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Dictionary>> + '_ {
        self.dictionaries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_dictionary_requires_zero_and_one() {
        let err = Dictionary::from_pairs("yn", DictionaryType::Bool, [(1, "yes"), (2, "no")])
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidDictionary { .. }));

        let ok = Dictionary::from_pairs("yn", DictionaryType::Bool, [(1, "yes"), (0, "no")])
            .unwrap();
        assert_eq!(ok.value_of(0), Some("no"));
        assert_eq!(ok.key_of("yes"), Some(1));
    }

    #[test]
    fn duplicate_display_values_are_rejected() {
        let err = Dictionary::from_pairs("d", DictionaryType::Enum, [(1, "a"), (2, "a")])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate value"), "{err}");
    }

    #[test]
    fn state_round_trip_revalidates() {
        let json = r#"{"name":"d","type":"bool","keys":[0,5],"values":["a","b"]}"#;
        assert!(serde_json::from_str::<Dictionary>(json).is_err());
    }
}
