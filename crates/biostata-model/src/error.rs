pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown physical type: {0}")]
    UnknownType(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("unknown dictionary: {0}")]
    UnknownDictionary(String),

    #[error("column {column} is used by computed column {dependent}")]
    ColumnInUse { column: String, dependent: String },

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid dictionary {name}: {reason}")]
    InvalidDictionary { name: String, reason: String },

    #[error("column {column} is not compatible with dictionary {dictionary}")]
    DictionaryMismatch { column: String, dictionary: String },

    #[error("function {function} expects {expected} dependencies, got {actual}")]
    Arity {
        function: &'static str,
        expected: String,
        actual: usize,
    },

    #[error("missing function argument {argument} for {function}")]
    MissingArgument {
        function: &'static str,
        argument: &'static str,
    },

    #[error("dependency cycle while restoring column {0}")]
    DependencyCycle(String),

    #[error("malformed column state: {0}")]
    MalformedState(String),

    #[error("unbalanced parentheses in filter {0}")]
    UnbalancedParens(String),

    #[error("the id column cannot be {0}")]
    IdColumn(&'static str),
}
