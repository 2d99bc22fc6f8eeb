//! Attribute expressions and reference parsing.
//!
//! Declared attributes are expressions: literals, collections of expressions,
//! or references to another resource's attribute. References are written as
//! placeholders inside strings.
//!
//! # Reference Formats
//!
//! - `"${db_instance.main.address}"` - the whole string is one reference; the
//!   resolved value keeps its own type (a number stays a number)
//! - `"postgres://${db_instance.main.address}:5432"` - a template; references
//!   are rendered into the surrounding text and the result is a string
//!
//! # Escaping
//!
//! `$$` produces one literal `$`, so `$${` gives a literal `${`. A lone `$`
//! that is not followed by `$` or `{` passes through unchanged. The source
//! form written back by [`Expr::to_source`] doubles every literal `$`.
//!
//! # Example
//!
//! ```
//! use converge_lib::resource::{Expr, Segment};
//!
//! let expr = Expr::parse_str("http://${web.main.address}/").unwrap();
//! let Expr::Template(segments) = expr else { panic!("expected template") };
//! assert_eq!(segments.len(), 3);
//! assert!(matches!(&segments[0], Segment::Literal(s) if s == "http://"));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::key::{ResourceKey, validate_identifier};
use super::value::Value;

/// A reference to one attribute of another resource: `type.name.attribute`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttrRef {
  pub key: ResourceKey,
  pub attribute: String,
}

impl AttrRef {
  pub fn new(key: ResourceKey, attribute: impl Into<String>) -> Self {
    Self {
      key,
      attribute: attribute.into(),
    }
  }

  /// Parse the content between `${` and `}`.
  pub fn parse(content: &str) -> Result<Self, ExprError> {
    let malformed = || ExprError::MalformedReference(content.to_string());

    let mut parts = content.trim().split('.');
    let (Some(resource_type), Some(name), Some(attribute), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
      return Err(malformed());
    };

    let key = ResourceKey::parse_parts(resource_type, name).map_err(|_| malformed())?;
    validate_identifier(attribute).map_err(|_| malformed())?;
    Ok(Self::new(key, attribute))
  }
}

impl fmt::Display for AttrRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.key, self.attribute)
  }
}

/// A segment of a string template.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
  /// Literal text (no references)
  Literal(String),

  /// A reference to be resolved and rendered
  Ref(AttrRef),
}

/// Errors that can occur while parsing expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
  #[error("unclosed reference at position {0}")]
  Unclosed(usize),

  #[error("malformed reference '${{{0}}}': expected '${{type.name.attribute}}'")]
  MalformedReference(String),
}

/// An attribute expression as declared.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  Null,
  Bool(bool),
  Number(f64),
  String(String),
  List(Vec<Expr>),
  Map(BTreeMap<String, Expr>),
  /// A whole-value reference to another resource's attribute.
  Ref(AttrRef),
  /// A string interpolating one or more references.
  Template(Vec<Segment>),
}

/// Outcome of resolving an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
  Known(Value),
  /// The value depends on something that only exists after apply.
  Unknown,
}

impl Resolved {
  pub fn known(self) -> Option<Value> {
    match self {
      Resolved::Known(v) => Some(v),
      Resolved::Unknown => None,
    }
  }
}

/// Errors that can occur while resolving references.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
  #[error("reference to '{0}': resource has no recorded state")]
  MissingResource(AttrRef),

  #[error("reference to '{0}': attribute is not set on the resource")]
  MissingAttribute(AttrRef),

  #[error("reference to '{0}' is still unknown")]
  StillUnknown(AttrRef),
}

/// Supplies values for references during resolution.
pub trait ReferenceResolver {
  fn resolve_ref(&self, reference: &AttrRef) -> Result<Resolved, ResolveError>;
}

impl Expr {
  /// Parse a string literal, turning `${...}` placeholders into references.
  pub fn parse_str(input: &str) -> Result<Expr, ExprError> {
    let mut segments = parse_segments(input)?;
    if segments.len() > 1 {
      return Ok(Expr::Template(segments));
    }

    Ok(match segments.pop() {
      None => Expr::String(String::new()),
      Some(Segment::Literal(s)) => Expr::String(s),
      Some(Segment::Ref(r)) => Expr::Ref(r),
    })
  }

  /// Convert a plain value into an expression, parsing references in strings.
  pub fn from_value(value: Value) -> Result<Expr, ExprError> {
    Ok(match value {
      Value::Null => Expr::Null,
      Value::Bool(b) => Expr::Bool(b),
      Value::Number(n) => Expr::Number(n),
      Value::String(s) => Expr::parse_str(&s)?,
      Value::List(items) => Expr::List(items.into_iter().map(Expr::from_value).collect::<Result<_, _>>()?),
      Value::Map(map) => Expr::Map(
        map
          .into_iter()
          .map(|(k, v)| Ok((k, Expr::from_value(v)?)))
          .collect::<Result<_, ExprError>>()?,
      ),
    })
  }

  /// Literal expression for a concrete value. Strings are kept verbatim.
  pub fn literal(value: Value) -> Expr {
    match value {
      Value::Null => Expr::Null,
      Value::Bool(b) => Expr::Bool(b),
      Value::Number(n) => Expr::Number(n),
      Value::String(s) => Expr::String(s),
      Value::List(items) => Expr::List(items.into_iter().map(Expr::literal).collect()),
      Value::Map(map) => Expr::Map(map.into_iter().map(|(k, v)| (k, Expr::literal(v))).collect()),
    }
  }

  /// Convert back to the source form, re-escaping literal `${` sequences.
  pub fn to_source(&self) -> Value {
    match self {
      Expr::Null => Value::Null,
      Expr::Bool(b) => Value::Bool(*b),
      Expr::Number(n) => Value::Number(*n),
      Expr::String(s) => Value::String(escape(s)),
      Expr::List(items) => Value::List(items.iter().map(Expr::to_source).collect()),
      Expr::Map(map) => Value::Map(map.iter().map(|(k, v)| (k.clone(), v.to_source())).collect()),
      Expr::Ref(r) => Value::String(format!("${{{}}}", r)),
      Expr::Template(segments) => {
        let mut out = String::new();
        for segment in segments {
          match segment {
            Segment::Literal(s) => out.push_str(&escape(s)),
            Segment::Ref(r) => out.push_str(&format!("${{{}}}", r)),
          }
        }
        Value::String(out)
      }
    }
  }

  /// All references in this expression, in source order.
  pub fn references(&self) -> Vec<&AttrRef> {
    let mut refs = Vec::new();
    collect_references(self, &mut refs);
    refs
  }

  /// Resolve the expression to a concrete value.
  ///
  /// Any unknown part makes the whole expression unknown.
  pub fn resolve(&self, resolver: &impl ReferenceResolver) -> Result<Resolved, ResolveError> {
    Ok(match self {
      Expr::Null => Resolved::Known(Value::Null),
      Expr::Bool(b) => Resolved::Known(Value::Bool(*b)),
      Expr::Number(n) => Resolved::Known(Value::Number(*n)),
      Expr::String(s) => Resolved::Known(Value::String(s.clone())),
      Expr::Ref(r) => resolver.resolve_ref(r)?,
      Expr::List(items) => {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
          match item.resolve(resolver)? {
            Resolved::Known(v) => values.push(v),
            Resolved::Unknown => return Ok(Resolved::Unknown),
          }
        }
        Resolved::Known(Value::List(values))
      }
      Expr::Map(map) => {
        let mut values = BTreeMap::new();
        for (k, item) in map {
          match item.resolve(resolver)? {
            Resolved::Known(v) => {
              values.insert(k.clone(), v);
            }
            Resolved::Unknown => return Ok(Resolved::Unknown),
          }
        }
        Resolved::Known(Value::Map(values))
      }
      Expr::Template(segments) => {
        let mut out = String::new();
        for segment in segments {
          match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Ref(r) => match resolver.resolve_ref(r)? {
              Resolved::Known(v) => out.push_str(&v.render()),
              Resolved::Unknown => return Ok(Resolved::Unknown),
            },
          }
        }
        Resolved::Known(Value::String(out))
      }
    })
  }
}

fn collect_references<'a>(expr: &'a Expr, refs: &mut Vec<&'a AttrRef>) {
  match expr {
    Expr::Ref(r) => refs.push(r),
    Expr::Template(segments) => {
      for segment in segments {
        if let Segment::Ref(r) = segment {
          refs.push(r);
        }
      }
    }
    Expr::List(items) => {
      for item in items {
        collect_references(item, refs);
      }
    }
    Expr::Map(map) => {
      for item in map.values() {
        collect_references(item, refs);
      }
    }
    Expr::Null | Expr::Bool(_) | Expr::Number(_) | Expr::String(_) => {}
  }
}

fn escape(s: &str) -> String {
  s.replace('$', "$$")
}

/// Split a string into literal and reference segments.
fn parse_segments(input: &str) -> Result<Vec<Segment>, ExprError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        // Escaped: $$ -> $
        chars.next();
        literal.push('$');
      }
      Some((_, '{')) => {
        chars.next(); // consume the {

        if !literal.is_empty() {
          segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }

        let mut content = String::new();
        let mut found_close = false;
        for (_, c) in chars.by_ref() {
          if c == '}' {
            found_close = true;
            break;
          }
          content.push(c);
        }

        if !found_close {
          return Err(ExprError::Unclosed(pos));
        }

        segments.push(Segment::Ref(AttrRef::parse(&content)?));
      }
      _ => {
        // Lone $, treat as literal
        literal.push('$');
      }
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

impl Serialize for Expr {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.to_source().serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for Expr {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Expr::from_value(value).map_err(serde::de::Error::custom)
  }
}

impl From<&str> for Expr {
  fn from(s: &str) -> Self {
    Expr::String(s.to_string())
  }
}

impl From<f64> for Expr {
  fn from(n: f64) -> Self {
    Expr::Number(n)
  }
}

impl From<bool> for Expr {
  fn from(b: bool) -> Self {
    Expr::Bool(b)
  }
}

impl From<AttrRef> for Expr {
  fn from(r: AttrRef) -> Self {
    Expr::Ref(r)
  }
}
