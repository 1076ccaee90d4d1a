//! Registry of functions available to computed columns.
//!
//! Every function is identified by a stable string (`func_name` in a computed
//! column's kwargs). The SQL side calls it as `bs_<func_name>(deps..., params...)`
//! where `params` are the function's kwargs rendered as literals in declaration
//! order. The database layer registers [`FunctionId::evaluate`] under that name.
use crate::error::{ModelError, ModelResult};
use crate::value::Value;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

pub type Kwargs = JsonMap<String, JsonValue>;

/// Key inside kwargs that names the function.
pub const FUNC_NAME_KEY: &str = "func_name";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FunctionId {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Log,
    Exp,
    Abs,
    Linear,
    Concat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(k) => write!(f, "{k}"),
            Arity::AtLeast(k) => write!(f, "at least {k}"),
        }
    }
}

impl FunctionId {
    pub const ALL: [FunctionId; 10] = [
        FunctionId::Add,
        FunctionId::Subtract,
        FunctionId::Multiply,
        FunctionId::Divide,
        FunctionId::Power,
        FunctionId::Log,
        FunctionId::Exp,
        FunctionId::Abs,
        FunctionId::Linear,
        FunctionId::Concat,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FunctionId::Add => "add",
            FunctionId::Subtract => "subtract",
            FunctionId::Multiply => "multiply",
            FunctionId::Divide => "divide",
            FunctionId::Power => "power",
            FunctionId::Log => "log",
            FunctionId::Exp => "exp",
            FunctionId::Abs => "abs",
            FunctionId::Linear => "linear",
            FunctionId::Concat => "concat",
        }
    }

    /// Name the function is registered under on a connection.
    pub fn sql_name(self) -> String {
        format!("bs_{}", self.name())
    }

    /// Number of column dependencies accepted.
    pub fn arity(self) -> Arity {
        match self {
            FunctionId::Add | FunctionId::Multiply => Arity::AtLeast(1),
            FunctionId::Concat => Arity::AtLeast(1),
            FunctionId::Subtract | FunctionId::Divide => Arity::Exactly(2),
            FunctionId::Power
            | FunctionId::Log
            | FunctionId::Exp
            | FunctionId::Abs
            | FunctionId::Linear => Arity::Exactly(1),
        }
    }

    /// Kwargs appended after the dependencies, in call order.
    pub fn params(self) -> &'static [&'static str] {
        match self {
            FunctionId::Power => &["exponent"],
            FunctionId::Log => &["base"],
            FunctionId::Linear => &["slope", "intercept"],
            FunctionId::Concat => &["separator"],
            _ => &[],
        }
    }

    /// Check a dependency count and kwargs bag before building a column.
    pub fn check(self, deps: usize, kwargs: &Kwargs) -> ModelResult<()> {
        if !self.arity().accepts(deps) {
            return Err(ModelError::Arity {
                function: self.name(),
                expected: self.arity().to_string(),
                actual: deps,
            });
        }
        for param in self.params() {
            if !kwargs.contains_key(*param) {
                return Err(ModelError::MissingArgument {
                    function: self.name(),
                    argument: *param,
                });
            }
        }
        Ok(())
    }

    /// SQL literals for the kwargs parameters, in call order.
    pub fn param_literals(self, kwargs: &Kwargs) -> ModelResult<Vec<String>> {
        self.params()
            .iter()
            .map(|param| {
                let value = kwargs.get(*param).ok_or(ModelError::MissingArgument {
                    function: self.name(),
                    argument: *param,
                })?;
                Ok(json_to_value(value).sql_literal())
            })
            .collect()
    }

    /// Evaluate on one row. `args` holds the dependency values followed by
    /// the parameter values.
    ///
    /// NULL inputs and out-of-domain arguments yield NULL.
    pub fn evaluate(self, args: &[Value]) -> Value {
        let n_params = self.params().len();
        if args.len() < n_params {
            return Value::Null;
        }
        let (deps, params) = args.split_at(args.len() - n_params);
        if !self.arity().accepts(deps.len()) {
            return Value::Null;
        }
        if self == FunctionId::Concat {
            return concat(deps, params.first());
        }

        let Some(xs) = deps.iter().map(Value::as_f64).collect::<Option<Vec<f64>>>() else {
            return Value::Null;
        };
        let Some(ps) = params.iter().map(Value::as_f64).collect::<Option<Vec<f64>>>() else {
            return Value::Null;
        };

        let out = match self {
            FunctionId::Add => xs.iter().sum(),
            FunctionId::Multiply => xs.iter().product(),
            FunctionId::Subtract => xs[0] - xs[1],
            FunctionId::Divide => {
                if xs[1] == 0.0 {
                    return Value::Null;
                }
                xs[0] / xs[1]
            }
            FunctionId::Power => xs[0].powf(ps[0]),
            FunctionId::Log => {
                if xs[0] <= 0.0 || ps[0] <= 0.0 || ps[0] == 1.0 {
                    return Value::Null;
                }
                xs[0].log(ps[0])
            }
            FunctionId::Exp => xs[0].exp(),
            FunctionId::Abs => xs[0].abs(),
            FunctionId::Linear => ps[0] * xs[0] + ps[1],
            FunctionId::Concat => return Value::Null,
        };

        if out.is_finite() {
            Value::Real(out)
        } else {
            Value::Null
        }
    }
}

fn concat(deps: &[Value], separator: Option<&Value>) -> Value {
    let separator = separator.and_then(Value::as_text).unwrap_or_default();
    let Some(parts) = deps.iter().map(Value::as_text).collect::<Option<Vec<_>>>() else {
        return Value::Null;
    };
    Value::Text(parts.join(&separator))
}

/// Map a kwargs JSON value onto a scalar.
pub fn json_to_value(v: &JsonValue) -> Value {
    match v {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::from(*b),
        JsonValue::Number(n) => n
            .as_i64()
            .map(Value::Integer)
            .or_else(|| n.as_f64().map(Value::Real))
            .unwrap_or(Value::Null),
        JsonValue::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

impl FromStr for FunctionId {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        FunctionId::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| ModelError::UnknownFunction(s.to_string()))
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
