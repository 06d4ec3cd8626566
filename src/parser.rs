//! Request parameter parsing.
//!
//! A [`RequestSchema`] lists the fields an endpoint accepts and the namespace
//! each one is read from. [`parse`] decodes every namespace independently and
//! reports *all* failing fields at once, so a client fixing a request sees the
//! full list instead of discovering problems one round-trip at a time.
//!
//! Ownership conflicts are a registration problem, not a request problem:
//! [`RequestSchemaBuilder::build`] refuses a field declared in two namespaces
//! before any request can reach it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::Error;
use crate::request::{Body, RawRequest};
use crate::schema::{Namespace, Schema, SchemaRef};

#[derive(Clone, Debug)]
struct FieldDef {
    name: String,
    namespace: Namespace,
    schema: SchemaRef,
}

/// Per-endpoint field declarations, grouped by namespace.
#[derive(Clone, Debug, Default)]
pub struct RequestSchema {
    fields: Vec<FieldDef>,
}

impl RequestSchema {
    pub fn builder() -> RequestSchemaBuilder {
        RequestSchemaBuilder::default()
    }

    /// Whether any field is read from `namespace`.
    pub fn reads(&self, namespace: Namespace) -> bool {
        self.fields.iter().any(|f| f.namespace == namespace)
    }

    fn in_namespace(&self, namespace: Namespace) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(move |f| f.namespace == namespace)
    }
}

#[derive(Default)]
pub struct RequestSchemaBuilder {
    fields: Vec<FieldDef>,
}

impl RequestSchemaBuilder {
    pub fn field(mut self, namespace: Namespace, name: &str, schema: impl Schema) -> Self {
        // Header names are case-insensitive on the wire.
        let name = match namespace {
            Namespace::Header => name.to_ascii_lowercase(),
            _ => name.to_owned(),
        };
        self.fields.push(FieldDef { name, namespace, schema: Arc::new(schema) });
        self
    }

    pub fn path(self, name: &str, schema: impl Schema) -> Self {
        self.field(Namespace::Path, name, schema)
    }

    pub fn query(self, name: &str, schema: impl Schema) -> Self {
        self.field(Namespace::Query, name, schema)
    }

    pub fn body(self, name: &str, schema: impl Schema) -> Self {
        self.field(Namespace::Body, name, schema)
    }

    pub fn header(self, name: &str, schema: impl Schema) -> Self {
        self.field(Namespace::Header, name, schema)
    }

    pub fn cookie(self, name: &str, schema: impl Schema) -> Self {
        self.field(Namespace::Cookie, name, schema)
    }

    /// Fails with [`Error::DuplicateField`] if a name is owned twice.
    pub fn build(self) -> Result<RequestSchema, Error> {
        let mut owners: HashMap<&str, Namespace> = HashMap::new();
        for f in &self.fields {
            if let Some(first) = owners.insert(&f.name, f.namespace) {
                return Err(Error::DuplicateField {
                    field: f.name.clone(),
                    first,
                    second: f.namespace,
                });
            }
        }
        Ok(RequestSchema { fields: self.fields })
    }
}

/// One field that failed to decode.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FieldIssue {
    pub namespace: Namespace,
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.namespace, self.field, self.message)
    }
}

/// Every field that failed to decode, across all namespaces.
#[derive(Clone, Debug, Error, Serialize)]
#[error("validation failed: {}", join(.issues))]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

fn join(issues: &[FieldIssue]) -> String {
    issues.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

impl ValidationError {
    /// Whether `field` is among the failures.
    pub fn mentions(&self, field: &str) -> bool {
        self.issues.iter().any(|i| i.field == field)
    }
}

/// The decoded request.
///
/// Body, query and path values are merged into one map (path wins over query,
/// query over body); header and cookie values stay separate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedRequest {
    fields: Map<String, Value>,
    headers: Map<String, Value>,
    cookies: Map<String, Value>,
}

impl ParsedRequest {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    pub fn headers(&self) -> &Map<String, Value> {
        &self.headers
    }

    pub fn cookie(&self, name: &str) -> Option<&Value> {
        self.cookies.get(name)
    }

    pub fn cookies(&self) -> &Map<String, Value> {
        &self.cookies
    }

    /// Deserializes the merged fields into a typed request.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

/// Decodes `raw` against `schema`.
pub fn parse(schema: &RequestSchema, raw: &RawRequest) -> Result<ParsedRequest, ValidationError> {
    let mut issues = Vec::new();

    let strings = |map: &HashMap<String, String>, name: &str| map.get(name).cloned().map(Value::String);
    let path = decode_namespace(schema, Namespace::Path, |n| strings(&raw.params, n), &mut issues);
    let query = decode_namespace(schema, Namespace::Query, |n| strings(&raw.query, n), &mut issues);
    let headers = decode_namespace(
        schema,
        Namespace::Header,
        |n| raw.header(n).map(|v| Value::String(v.to_owned())),
        &mut issues,
    );
    let cookies = decode_namespace(schema, Namespace::Cookie, |n| strings(&raw.cookies, n), &mut issues);
    let body = decode_body(schema, &raw.body, &mut issues);

    if !issues.is_empty() {
        return Err(ValidationError { issues });
    }

    let mut fields = body;
    fields.extend(query);
    fields.extend(path);
    Ok(ParsedRequest { fields, headers, cookies })
}

fn decode_namespace(
    schema: &RequestSchema,
    namespace: Namespace,
    lookup: impl Fn(&str) -> Option<Value>,
    issues: &mut Vec<FieldIssue>,
) -> Map<String, Value> {
    let mut out = Map::new();
    for def in schema.in_namespace(namespace) {
        match lookup(&def.name) {
            Some(raw) => match def.schema.decode(&raw) {
                Ok(v) => {
                    out.insert(def.name.clone(), v);
                }
                Err(errs) => issues.extend(errs.into_iter().map(|e| FieldIssue {
                    namespace,
                    field: if e.at.is_empty() { def.name.clone() } else { format!("{}.{}", def.name, e.at) },
                    message: e.message,
                })),
            },
            None => {
                if let Some(default) = def.schema.default_value() {
                    out.insert(def.name.clone(), default);
                } else if !def.schema.is_optional() {
                    issues.push(FieldIssue {
                        namespace,
                        field: def.name.clone(),
                        message: "missing".to_owned(),
                    });
                }
            }
        }
    }
    out
}

fn decode_body(schema: &RequestSchema, body: &Body, issues: &mut Vec<FieldIssue>) -> Map<String, Value> {
    if !schema.reads(Namespace::Body) {
        return Map::new();
    }
    let empty = Map::new();
    let object = match body {
        Body::Empty => &empty,
        Body::Json(Value::Object(map)) => map,
        Body::Json(other) => {
            issues.push(body_issue(format!("expected a JSON object, got {}", kind(other))));
            return Map::new();
        }
        Body::Invalid(reason) => {
            issues.push(body_issue(reason.clone()));
            return Map::new();
        }
    };
    decode_namespace(schema, Namespace::Body, |n| object.get(n).cloned(), issues)
}

fn body_issue(message: String) -> FieldIssue {
    FieldIssue { namespace: Namespace::Body, field: "body".to_owned(), message }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::method::Method;
    use crate::schema::{boolean, integer, object, optional, string, with_default};

    fn user_schema() -> RequestSchema {
        RequestSchema::builder()
            .path("id", integer())
            .query("q", string())
            .query("limit", with_default(integer(), json!(20)))
            .query("verbose", optional(boolean()))
            .body("name", string())
            .header("X-Tenant", string())
            .build()
            .unwrap()
    }

    #[test]
    fn merges_namespaces() {
        let raw = RawRequest::builder(Method::Post, "/users/42?q=ann")
            .param("id", "42")
            .header("x-tenant", "acme")
            .json(json!({ "name": "Ann", "ignored": true }))
            .build();

        let parsed = parse(&user_schema(), &raw).unwrap();

        assert_eq!(
            Value::Object(parsed.fields().clone()),
            json!({ "id": 42, "q": "ann", "limit": 20, "name": "Ann" })
        );
        assert_eq!(parsed.header("X-Tenant"), Some(&json!("acme")));
        assert!(parsed.get("verbose").is_none());
    }

    #[test]
    fn reports_every_failing_field() {
        let raw = RawRequest::builder(Method::Post, "/users/abc?verbose=maybe")
            .param("id", "abc")
            .json(json!({ "name": 7 }))
            .build();

        let err = parse(&user_schema(), &raw).unwrap_err();

        let failing: Vec<_> = err.issues.iter().map(|i| (i.namespace, i.field.as_str())).collect();
        assert_eq!(
            failing,
            [
                (Namespace::Path, "id"),
                (Namespace::Query, "q"),
                (Namespace::Query, "verbose"),
                (Namespace::Header, "x-tenant"),
                (Namespace::Body, "name"),
            ]
        );
        assert!(err.to_string().starts_with("validation failed: path.id: expected integer"));
    }

    #[test]
    fn missing_required_query_field() {
        let schema = RequestSchema::builder().query("q", string()).build().unwrap();
        let raw = RawRequest::builder(Method::Get, "/search").build();

        let err = parse(&schema, &raw).unwrap_err();

        assert_eq!(
            err.issues,
            [FieldIssue { namespace: Namespace::Query, field: "q".into(), message: "missing".into() }]
        );
    }

    #[test]
    fn nested_body_issues_are_qualified() {
        let schema = RequestSchema::builder()
            .body("address", object().field("zip", integer()))
            .build()
            .unwrap();
        let raw = RawRequest::builder(Method::Post, "/")
            .json(json!({ "address": { "zip": "x1" } }))
            .build();

        let err = parse(&schema, &raw).unwrap_err();
        assert!(err.mentions("address.zip"));
    }

    #[test]
    fn malformed_body_is_a_validation_error() {
        let raw = RawRequest::builder(Method::Post, "/users/1?q=a")
            .param("id", "1")
            .header("x-tenant", "t")
            .bytes(b"{not json")
            .build();

        let err = parse(&user_schema(), &raw).unwrap_err();
        assert!(err.mentions("body"));
    }

    #[test]
    fn body_ignored_when_no_body_fields() {
        let schema = RequestSchema::builder().path("id", integer()).build().unwrap();
        let raw = RawRequest::builder(Method::Get, "/1").param("id", "1").bytes(b"garbage").build();
        assert!(parse(&schema, &raw).is_ok());
    }

    #[test]
    fn duplicate_ownership_rejected_at_build() {
        let err = RequestSchema::builder()
            .path("id", integer())
            .body("id", integer())
            .build()
            .unwrap_err();

        assert!(matches!(
            err,
            Error::DuplicateField { ref field, first: Namespace::Path, second: Namespace::Body } if field == "id"
        ));
    }
}
