//! Concrete attribute values.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A resolved attribute value: no expressions, no references.
///
/// Serializes as plain JSON, so a state file reads like the attributes the
/// provider saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
  Null,
  Bool(bool),
  Number(f64),
  String(String),
  List(Vec<Value>),
  Map(BTreeMap<String, Value>),
}

/// Attribute name → concrete value.
pub type Attributes = BTreeMap<String, Value>;

impl Value {
  /// Render the value for interpolation into a string template.
  ///
  /// Strings are inserted verbatim, integral numbers without a fraction,
  /// null as the empty string, and collections as compact JSON.
  pub fn render(&self) -> String {
    match self {
      Value::Null => String::new(),
      Value::Bool(b) => b.to_string(),
      Value::Number(n) => render_number(*n),
      Value::String(s) => s.clone(),
      Value::List(_) | Value::Map(_) => serde_json::to_string(self).unwrap_or_default(),
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  /// Short name of the variant, used in error messages.
  pub fn type_name(&self) -> &'static str {
    match self {
      Value::Null => "null",
      Value::Bool(_) => "bool",
      Value::Number(_) => "number",
      Value::String(_) => "string",
      Value::List(_) => "list",
      Value::Map(_) => "map",
    }
  }
}

fn render_number(n: f64) -> String {
  if n.fract() == 0.0 && n.abs() < 1e15 {
    format!("{}", n as i64)
  } else {
    n.to_string()
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::String(s) => write!(f, "\"{}\"", s),
      other => write!(f, "{}", serde_json::to_string(other).unwrap_or_default()),
    }
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::String(s.to_string())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::String(s)
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

impl From<f64> for Value {
  fn from(n: f64) -> Self {
    Value::Number(n)
  }
}

impl From<i64> for Value {
  fn from(n: i64) -> Self {
    Value::Number(n as f64)
  }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
  fn from(items: Vec<T>) -> Self {
    Value::List(items.into_iter().map(Into::into).collect())
  }
}
