//! Encoding of handler results.
//!
//! A handler's output is checked against the endpoint's response schema on
//! the way out. A value that does not fit is the handler breaking its own
//! contract, so it surfaces as a [`Fault`], never as a client error.

use http::StatusCode;
use serde_json::Value;

use crate::classify::Fault;
use crate::schema::{Schema, SchemaRef};

/// What an endpoint answers with on success.
#[derive(Clone, Debug)]
pub enum ResponseSchema {
    /// `204 No Content`. The handler must return `()`.
    NoBody,
    /// `200 OK` with the encoded value.
    Json(SchemaRef),
}

impl ResponseSchema {
    pub fn json(schema: impl Schema) -> Self {
        Self::Json(std::sync::Arc::new(schema))
    }
}

/// Status and body of a successful response.
#[derive(Clone, Debug, PartialEq)]
pub struct Encoded {
    pub status: StatusCode,
    pub body: Option<Value>,
}

pub fn encode(schema: &ResponseSchema, value: Value) -> Result<Encoded, Fault> {
    match schema {
        ResponseSchema::NoBody if value.is_null() => Ok(Encoded { status: StatusCode::NO_CONTENT, body: None }),
        ResponseSchema::NoBody => Err(Fault::new("endpoint declares no body but the handler returned a value")),
        ResponseSchema::Json(schema) => schema
            .encode(&value)
            .map(|body| Encoded { status: StatusCode::OK, body: Some(body) })
            .map_err(|issue| Fault::new(format!("response does not match its schema: {issue}"))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema;

    #[test]
    fn no_body_is_204() {
        let encoded = encode(&ResponseSchema::NoBody, Value::Null).unwrap();
        assert_eq!(encoded, Encoded { status: StatusCode::NO_CONTENT, body: None });
    }

    #[test]
    fn json_body_is_encoded_through_schema() {
        let schema = ResponseSchema::json(schema::object().field("name", schema::string()));
        let encoded = encode(&schema, json!({ "name": "Ann", "internal": true })).unwrap();
        assert_eq!(encoded.status, StatusCode::OK);
        assert_eq!(encoded.body, Some(json!({ "name": "Ann" })));
    }

    #[test]
    fn mismatch_is_a_fault() {
        let schema = ResponseSchema::json(schema::object().field("name", schema::string()));
        let fault = encode(&schema, json!({ "name": 3 })).unwrap_err();
        assert!(fault.to_string().contains("name"));

        assert!(encode(&ResponseSchema::NoBody, json!({ "x": 1 })).is_err());
    }
}
