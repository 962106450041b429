//! Stage gates and success criteria
//!
//! Both are evaluated against the value a worker returned. Result fields are
//! looked up by their snake_case key first and then by the camelCase form, so
//! `all_tests_pass` also matches `allTestsPass`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

static COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(<=|>=|==|!=|<|>)\s*(-?\d+(?:\.\d+)?)\s*$")
        .expect("comparison pattern is a valid regex")
});

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*$").expect("identifier pattern is a valid regex")
});

/// Comparison operator in a gate expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    fn apply(self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }
}

/// A parsed gate
#[derive(Debug, Clone, PartialEq)]
pub enum Gate {
    /// `critical_issues` is absent, null or empty
    NoCriticalIssues,
    /// `<field> <op> <number>`
    Compare {
        field: String,
        op: CompareOp,
        threshold: f64,
    },
    /// A predicate registered by name
    Named(String),
}

impl FromStr for Gate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();

        if trimmed == "no_critical_issues" {
            return Ok(Gate::NoCriticalIssues);
        }

        if let Some(captures) = COMPARISON.captures(trimmed) {
            let op = match &captures[2] {
                "<" => CompareOp::Lt,
                "<=" => CompareOp::Le,
                ">" => CompareOp::Gt,
                ">=" => CompareOp::Ge,
                "==" => CompareOp::Eq,
                _ => CompareOp::Ne,
            };
            let threshold = captures[3]
                .parse::<f64>()
                .map_err(|e| format!("invalid threshold in gate '{}': {}", trimmed, e))?;

            return Ok(Gate::Compare {
                field: captures[1].to_string(),
                op,
                threshold,
            });
        }

        if IDENTIFIER.is_match(trimmed) {
            return Ok(Gate::Named(trimmed.to_string()));
        }

        Err(format!("unparsable gate expression: '{}'", s))
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gate::NoCriticalIssues => write!(f, "no_critical_issues"),
            Gate::Compare {
                field,
                op,
                threshold,
            } => write!(f, "{} {} {}", field, op.symbol(), threshold),
            Gate::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Named gate predicate over a stage result
pub type GatePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Registry of named gate predicates
#[derive(Clone, Default)]
pub struct GateRegistry {
    predicates: HashMap<String, GatePredicate>,
}

impl fmt::Debug for GateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.predicates.keys().collect();
        names.sort();
        f.debug_struct("GateRegistry").field("predicates", &names).finish()
    }
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    /// Parse `expression`, rejecting names nobody registered
    pub fn parse(&self, expression: &str) -> Result<Gate, String> {
        let gate: Gate = expression.parse()?;
        if let Gate::Named(name) = &gate {
            if !self.contains(name) {
                return Err(format!("unknown gate: '{}'", name));
            }
        }
        Ok(gate)
    }

    /// Evaluate a gate against a stage result
    pub fn evaluate(&self, gate: &Gate, result: &Value) -> bool {
        match gate {
            Gate::NoCriticalIssues => match lookup_field(result, "critical_issues") {
                None | Some(Value::Null) => true,
                Some(Value::Array(items)) => items.is_empty(),
                Some(Value::Object(map)) => map.is_empty(),
                Some(Value::Number(n)) => n.as_f64() == Some(0.0),
                Some(Value::Bool(b)) => !b,
                Some(Value::String(s)) => s.is_empty(),
            },
            Gate::Compare {
                field,
                op,
                threshold,
            } => lookup_field(result, field)
                .and_then(Value::as_f64)
                .map_or(false, |value| op.apply(value, *threshold)),
            Gate::Named(name) => self
                .predicates
                .get(name)
                .map_or(false, |predicate| predicate(result)),
        }
    }
}

/// Find a result field by its snake_case key or camelCase form
pub fn lookup_field<'a>(result: &'a Value, key: &str) -> Option<&'a Value> {
    let object = result.as_object()?;
    object
        .get(key)
        .or_else(|| object.get(&to_camel_case(key)))
}

fn to_camel_case(key: &str) -> String {
    let mut camel = String::with_capacity(key.len());
    let mut upper = false;

    for c in key.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            camel.extend(c.to_uppercase());
            upper = false;
        } else {
            camel.push(c);
        }
    }

    camel
}

/// Check success criteria; returns the first unmet criterion.
///
/// A number requires the field to be at least that value, a bool requires
/// the field to equal it, anything else requires equality. A missing field
/// fails the criterion.
pub fn check_criteria(criteria: &BTreeMap<String, Value>, result: &Value) -> Result<(), String> {
    for (key, expected) in criteria {
        let actual = lookup_field(result, key);

        let met = match (expected, actual) {
            (_, None) => false,
            (Value::Number(min), Some(value)) => match (min.as_f64(), value.as_f64()) {
                (Some(min), Some(value)) => value >= min,
                _ => false,
            },
            (Value::Bool(flag), Some(value)) => value.as_bool() == Some(*flag),
            (expected, Some(value)) => expected == value,
        };

        if !met {
            return Err(match (expected, actual) {
                (_, None) => format!("{} missing from result", key),
                (Value::Number(min), Some(value)) => format!("{} {} < {}", key, value, min),
                (_, Some(value)) => format!("{} is {}, expected {}", key, value, expected),
            });
        }
    }

    Ok(())
}
