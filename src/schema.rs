//! Field schemas: the decode/encode capability the parser and encoder consume.
//!
//! A [`Schema`] turns one raw value into a typed value (`decode`) and checks a
//! typed value on its way out (`encode`). Everything is expressed over
//! [`serde_json::Value`] so any validation library can sit behind the trait;
//! the constructors below cover the common scalar, array and object shapes,
//! and [`json_schema`] accepts a full JSON Schema document.
//!
//! Path, query, header and cookie values always arrive as strings, so the
//! scalar schemas accept their string spelling too:
//!
//! ```rust
//! use serde_json::json;
//! use sluice::schema::{self, Schema};
//!
//! assert_eq!(schema::integer().decode(&json!("42")).unwrap(), json!(42));
//! assert!(schema::integer().decode(&json!("forty-two")).is_err());
//! ```

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Error;

/// Where a request field is read from. A field belongs to exactly one.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Path,
    Query,
    Body,
    Header,
    Cookie,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Body => "body",
            Self::Header => "header",
            Self::Cookie => "cookie",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One problem found while decoding or encoding a value.
///
/// `at` is the dotted location inside the value (empty for the value itself).
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Issue {
    pub at: String,
    pub message: String,
}

impl Issue {
    pub fn new(message: impl Into<String>) -> Self {
        Self { at: String::new(), message: message.into() }
    }

    fn nested(mut self, key: &str) -> Self {
        self.at = if self.at.is_empty() { key.to_owned() } else { format!("{key}.{}", self.at) };
        self
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.at.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.at, self.message)
        }
    }
}

/// The decode/encode capability for one field or one response body.
pub trait Schema: fmt::Debug + Send + Sync + 'static {
    /// Validate and convert a raw value. Reports every problem it finds.
    fn decode(&self, raw: &Value) -> Result<Value, Vec<Issue>>;

    /// Check a typed value against the schema and produce its wire form.
    fn encode(&self, value: &Value) -> Result<Value, Issue>;

    /// Whether an absent field is acceptable.
    fn is_optional(&self) -> bool {
        false
    }

    /// Value to use when the field is absent. Implies optional.
    fn default_value(&self) -> Option<Value> {
        None
    }
}

/// Shared, type-erased schema.
pub type SchemaRef = Arc<dyn Schema>;

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn expected(what: &str, got: &Value) -> Issue {
    Issue::new(format!("expected {what}, got {}", kind(got)))
}

// ── Scalars ───────────────────────────────────────────────────────────────────

/// A string, optionally bounded in length (counted in characters).
#[derive(Clone, Debug, Default)]
pub struct Str {
    min_len: Option<usize>,
    max_len: Option<usize>,
}

impl Str {
    pub fn min_len(mut self, n: usize) -> Self {
        self.min_len = Some(n);
        self
    }

    pub fn max_len(mut self, n: usize) -> Self {
        self.max_len = Some(n);
        self
    }

    fn check(&self, s: &str) -> Result<(), Issue> {
        let len = s.chars().count();
        if let Some(min) = self.min_len
            && len < min
        {
            return Err(Issue::new(format!("expected at least {min} characters, got {len}")));
        }
        if let Some(max) = self.max_len
            && len > max
        {
            return Err(Issue::new(format!("expected at most {max} characters, got {len}")));
        }
        Ok(())
    }
}

impl Schema for Str {
    fn decode(&self, raw: &Value) -> Result<Value, Vec<Issue>> {
        match raw {
            Value::String(s) => self.check(s).map(|()| raw.clone()).map_err(|i| vec![i]),
            other => Err(vec![expected("string", other)]),
        }
    }

    fn encode(&self, value: &Value) -> Result<Value, Issue> {
        match value {
            Value::String(s) => self.check(s).map(|()| value.clone()),
            other => Err(expected("string", other)),
        }
    }
}

/// Any JSON number. Accepts a numeric string.
#[derive(Clone, Copy, Debug, Default)]
pub struct Number;

impl Schema for Number {
    fn decode(&self, raw: &Value) -> Result<Value, Vec<Issue>> {
        match raw {
            Value::Number(_) => Ok(raw.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .and_then(|n| serde_json::Number::from_f64(n).map(normalize))
                .map(Value::Number)
                .ok_or_else(|| vec![Issue::new(format!("expected number, got {s:?}"))]),
            other => Err(vec![expected("number", other)]),
        }
    }

    fn encode(&self, value: &Value) -> Result<Value, Issue> {
        match value {
            Value::Number(_) => Ok(value.clone()),
            other => Err(expected("number", other)),
        }
    }
}

/// `42.0` decodes to `42` so integral path params compare equal to integers.
fn normalize(n: serde_json::Number) -> serde_json::Number {
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => (f as i64).into(),
        _ => n,
    }
}

/// A whole number that fits in `i64`. Accepts an integer string.
#[derive(Clone, Copy, Debug, Default)]
pub struct Integer;

impl Schema for Integer {
    fn decode(&self, raw: &Value) -> Result<Value, Vec<Issue>> {
        match raw {
            Value::Number(n) if n.is_i64() => Ok(raw.clone()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| vec![Issue::new(format!("expected integer, got {s:?}"))]),
            other => Err(vec![expected("integer", other)]),
        }
    }

    fn encode(&self, value: &Value) -> Result<Value, Issue> {
        match value {
            Value::Number(n) if n.is_i64() => Ok(value.clone()),
            other => Err(expected("integer", other)),
        }
    }
}

/// `true`/`false`, or their string spelling.
#[derive(Clone, Copy, Debug, Default)]
pub struct Boolean;

impl Schema for Boolean {
    fn decode(&self, raw: &Value) -> Result<Value, Vec<Issue>> {
        match raw {
            Value::Bool(_) => Ok(raw.clone()),
            Value::String(s) if s == "true" => Ok(Value::Bool(true)),
            Value::String(s) if s == "false" => Ok(Value::Bool(false)),
            Value::String(_) => Err(vec![Issue::new("expected boolean, got a non-boolean string")]),
            other => Err(vec![expected("boolean", other)]),
        }
    }

    fn encode(&self, value: &Value) -> Result<Value, Issue> {
        match value {
            Value::Bool(_) => Ok(value.clone()),
            other => Err(expected("boolean", other)),
        }
    }
}

/// Any JSON value, passed through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct Json;

impl Schema for Json {
    fn decode(&self, raw: &Value) -> Result<Value, Vec<Issue>> {
        Ok(raw.clone())
    }

    fn encode(&self, value: &Value) -> Result<Value, Issue> {
        Ok(value.clone())
    }
}

// ── Composites ────────────────────────────────────────────────────────────────

/// A homogeneous array.
#[derive(Clone, Debug)]
pub struct Array {
    item: SchemaRef,
}

impl Schema for Array {
    fn decode(&self, raw: &Value) -> Result<Value, Vec<Issue>> {
        let Value::Array(items) = raw else {
            return Err(vec![expected("array", raw)]);
        };
        let mut out = Vec::with_capacity(items.len());
        let mut issues = Vec::new();
        for (i, item) in items.iter().enumerate() {
            match self.item.decode(item) {
                Ok(v) => out.push(v),
                Err(errs) => issues.extend(errs.into_iter().map(|e| e.nested(&i.to_string()))),
            }
        }
        if issues.is_empty() { Ok(Value::Array(out)) } else { Err(issues) }
    }

    fn encode(&self, value: &Value) -> Result<Value, Issue> {
        let Value::Array(items) = value else {
            return Err(expected("array", value));
        };
        items
            .iter()
            .enumerate()
            .map(|(i, item)| self.item.encode(item).map_err(|e| e.nested(&i.to_string())))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    }
}

/// An object with declared fields. Undeclared keys are dropped on both
/// decode and encode.
#[derive(Clone, Debug, Default)]
pub struct Object {
    fields: Vec<(String, SchemaRef)>,
}

impl Object {
    pub fn field(mut self, name: impl Into<String>, schema: impl Schema) -> Self {
        self.fields.push((name.into(), Arc::new(schema)));
        self
    }
}

impl Schema for Object {
    fn decode(&self, raw: &Value) -> Result<Value, Vec<Issue>> {
        let Value::Object(map) = raw else {
            return Err(vec![expected("object", raw)]);
        };
        let mut out = Map::new();
        let mut issues = Vec::new();
        for (name, schema) in &self.fields {
            match map.get(name) {
                Some(v) => match schema.decode(v) {
                    Ok(v) => {
                        out.insert(name.clone(), v);
                    }
                    Err(errs) => issues.extend(errs.into_iter().map(|e| e.nested(name))),
                },
                None => {
                    if let Some(default) = schema.default_value() {
                        out.insert(name.clone(), default);
                    } else if !schema.is_optional() {
                        issues.push(Issue::new("missing").nested(name));
                    }
                }
            }
        }
        if issues.is_empty() { Ok(Value::Object(out)) } else { Err(issues) }
    }

    fn encode(&self, value: &Value) -> Result<Value, Issue> {
        let Value::Object(map) = value else {
            return Err(expected("object", value));
        };
        let mut out = Map::new();
        for (name, schema) in &self.fields {
            match map.get(name) {
                Some(Value::Null) | None if schema.is_optional() => {}
                Some(v) => {
                    out.insert(name.clone(), schema.encode(v).map_err(|e| e.nested(name))?);
                }
                None => return Err(Issue::new("missing").nested(name)),
            }
        }
        Ok(Value::Object(out))
    }
}

// ── Modifiers ─────────────────────────────────────────────────────────────────

/// May be absent. Explicit `null` is accepted as "absent" on encode only.
#[derive(Clone, Debug)]
pub struct Optional {
    inner: SchemaRef,
}

impl Schema for Optional {
    fn decode(&self, raw: &Value) -> Result<Value, Vec<Issue>> {
        self.inner.decode(raw)
    }

    fn encode(&self, value: &Value) -> Result<Value, Issue> {
        self.inner.encode(value)
    }

    fn is_optional(&self) -> bool {
        true
    }
}

/// May be absent, in which case `default` is used.
#[derive(Clone, Debug)]
pub struct WithDefault {
    inner: SchemaRef,
    default: Value,
}

impl Schema for WithDefault {
    fn decode(&self, raw: &Value) -> Result<Value, Vec<Issue>> {
        self.inner.decode(raw)
    }

    fn encode(&self, value: &Value) -> Result<Value, Issue> {
        self.inner.encode(value)
    }

    fn is_optional(&self) -> bool {
        true
    }

    fn default_value(&self) -> Option<Value> {
        Some(self.default.clone())
    }
}

// ── JSON Schema documents ─────────────────────────────────────────────────────

/// A value checked against a compiled JSON Schema document.
///
/// No string coercion happens here, so this suits body fields and response
/// bodies better than path or query fields. Issue messages come from the
/// validator and may quote the offending value.
pub struct JsonSchema {
    document: Value,
    validator: jsonschema::Validator,
}

impl fmt::Debug for JsonSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSchema").field("document", &self.document).finish_non_exhaustive()
    }
}

impl Schema for JsonSchema {
    fn decode(&self, raw: &Value) -> Result<Value, Vec<Issue>> {
        let issues: Vec<Issue> = self.validator.iter_errors(raw).map(|e| Issue::new(e.to_string())).collect();
        if issues.is_empty() { Ok(raw.clone()) } else { Err(issues) }
    }

    fn encode(&self, value: &Value) -> Result<Value, Issue> {
        match self.validator.iter_errors(value).next() {
            Some(e) => Err(Issue::new(e.to_string())),
            None => Ok(value.clone()),
        }
    }
}

// ── Constructors ──────────────────────────────────────────────────────────────

pub fn string() -> Str {
    Str::default()
}

pub fn number() -> Number {
    Number
}

pub fn integer() -> Integer {
    Integer
}

pub fn boolean() -> Boolean {
    Boolean
}

pub fn json() -> Json {
    Json
}

pub fn array(item: impl Schema) -> Array {
    Array { item: Arc::new(item) }
}

pub fn object() -> Object {
    Object::default()
}

pub fn optional(inner: impl Schema) -> Optional {
    Optional { inner: Arc::new(inner) }
}

pub fn with_default(inner: impl Schema, default: Value) -> WithDefault {
    WithDefault { inner: Arc::new(inner), default }
}

/// Compiles `document`. Fails when it is not a valid JSON Schema.
pub fn json_schema(document: Value) -> Result<JsonSchema, Error> {
    let validator =
        jsonschema::validator_for(&document).map_err(|e| Error::InvalidSchema { reason: e.to_string() })?;
    Ok(JsonSchema { document, validator })
}
