use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User-facing column type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PhysicalType {
    Int,
    Real,
    Text,
    Enum,
    Bool,
}

/// SQLite storage class backing a [`PhysicalType`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageType {
    Integer,
    Real,
    Text,
}

impl PhysicalType {
    pub const ALL: [PhysicalType; 5] = [
        PhysicalType::Int,
        PhysicalType::Real,
        PhysicalType::Text,
        PhysicalType::Enum,
        PhysicalType::Bool,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhysicalType::Int => "INT",
            PhysicalType::Real => "REAL",
            PhysicalType::Text => "TEXT",
            PhysicalType::Enum => "ENUM",
            PhysicalType::Bool => "BOOL",
        }
    }

    pub fn storage_type(self) -> StorageType {
        match self {
            PhysicalType::Int | PhysicalType::Enum | PhysicalType::Bool => StorageType::Integer,
            PhysicalType::Real => StorageType::Real,
            PhysicalType::Text => StorageType::Text,
        }
    }

    /// Category columns are everything but `REAL`; they can be grouped on.
    pub fn is_category(self) -> bool {
        self != PhysicalType::Real
    }

    /// Whether values of this type are looked up through a dictionary.
    pub fn uses_dictionary(self) -> bool {
        matches!(self, PhysicalType::Enum | PhysicalType::Bool)
    }
}

impl StorageType {
    pub fn sql_name(self) -> &'static str {
        match self {
            StorageType::Integer => "INTEGER",
            StorageType::Real => "REAL",
            StorageType::Text => "TEXT",
        }
    }
}

impl FromStr for PhysicalType {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INT" | "INTEGER" => Ok(PhysicalType::Int),
            "REAL" => Ok(PhysicalType::Real),
            "TEXT" => Ok(PhysicalType::Text),
            "ENUM" => Ok(PhysicalType::Enum),
            "BOOL" | "BOOLEAN" => Ok(PhysicalType::Bool),
            _ => Err(ModelError::UnknownType(s.to_string())),
        }
    }
}

impl TryFrom<String> for PhysicalType {
    type Error = ModelError;

    fn try_from(s: String) -> ModelResult<Self> {
        s.parse()
    }
}

impl From<PhysicalType> for String {
    fn from(t: PhysicalType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for PhysicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_types_store_as_integer() {
        assert_eq!(PhysicalType::Bool.storage_type(), StorageType::Integer);
        assert_eq!(PhysicalType::Enum.storage_type(), StorageType::Integer);
        assert_eq!(PhysicalType::Int.storage_type().sql_name(), "INTEGER");
    }

    #[test]
    fn unknown_type_string_is_rejected() {
        assert!(matches!(
            "DATE".parse::<PhysicalType>(),
            Err(ModelError::UnknownType(t)) if t == "DATE"
        ));
        assert_eq!("enum".parse::<PhysicalType>().unwrap(), PhysicalType::Enum);
    }
}
