//! Request logging and span annotation.
//!
//! Each request produces exactly two events, in this order, inside its
//! `request` span:
//!
//! - `Incoming request` at info level, before anything else runs.
//! - `Finished request` after everything else, at info level on success or
//!   interruption and at error level on failure.
//!
//! Snapshots of request data go through [`redact`] first, so a field named
//! `password` never reaches a log line or a span field, whatever the
//! verbosity.

use serde_json::{Map, Value};
use tracing::{Span, error, field, info, info_span};

use crate::classify::ClassifiedError;
use crate::context::{RequestContext, RequestSettings};
use crate::parser::ParsedRequest;
use crate::request::{Body, RawRequest};
use crate::response::Response;

const MAX_STRING: usize = 256;
const REDACTED: &str = "<redacted>";
const SNIPPED: &str = "<snipped>";
const SENSITIVE_HEADERS: &[&str] = &["authorization", "proxy-authorization", "cookie", "set-cookie", "x-api-key"];

/// The span every event of one request is recorded in.
pub(crate) fn request_span(ctx: &RequestContext) -> Span {
    info_span!(
        "request",
        endpoint = %ctx.name(),
        request_id = %ctx.request_id(),
        http.method = %ctx.method(),
        url.path = %redact_url(ctx.url()),
        request_input = field::Empty,
        http.status_code = field::Empty,
        interrupted = field::Empty,
        exception.escaped = field::Empty,
        exception.message = field::Empty,
        exception.stacktrace = field::Empty,
        "exception.type" = field::Empty,
        "error.type" = field::Empty,
    )
}

fn truncate(s: &str) -> String {
    if s.chars().count() > MAX_STRING {
        let mut out: String = s.chars().take(MAX_STRING - 3).collect();
        out.push_str("...");
        out
    } else {
        s.to_owned()
    }
}

fn is_password(key: &str) -> bool {
    key.eq_ignore_ascii_case("password")
}

/// Copy of `value` safe to log: `password` keys redacted at every depth, long
/// strings truncated.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_password(k) { Value::String(REDACTED.to_owned()) } else { redact(v) };
                    (k.clone(), v)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// One-line summary of each top-level field: scalars as-is (strings
/// truncated), containers by size.
pub fn summarize(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| {
            let summary = if is_password(k) {
                Value::String(REDACTED.to_owned())
            } else {
                match v {
                    Value::String(s) => Value::String(truncate(s)),
                    Value::Array(items) => Value::String(format!("Array[{}]", items.len())),
                    Value::Object(map) => Value::String(format!("Object[{}]", map.len())),
                    Value::Null => Value::String("null".to_owned()),
                    scalar => scalar.clone(),
                }
            };
            (k.clone(), summary)
        })
        .collect()
}

/// URL safe to log: the values of `password` query parameters are redacted.
pub fn redact_url(url: &str) -> String {
    let Some((path, query)) = url.split_once('?') else {
        return truncate(url);
    };
    let mut out = url::form_urlencoded::Serializer::new(format!("{path}?"));
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        let v = if is_password(&k) { REDACTED.into() } else { v };
        out.append_pair(&k, &v);
    }
    truncate(&out.finish())
}

/// Header value safe to log.
pub fn snip_header(name: &str, value: &str) -> String {
    if SENSITIVE_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
        SNIPPED.to_owned()
    } else {
        truncate(value)
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn strings<'a>(pairs: impl Iterator<Item = (&'a String, &'a String)>) -> Value {
    let map: Map<String, Value> = pairs.map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
    redact(&Value::Object(map))
}

/// Redacted, pretty-printed copy of everything the client sent.
pub(crate) struct Snapshot {
    path: String,
    query: String,
    body: String,
    cookies: String,
    headers: String,
}

impl Snapshot {
    pub(crate) fn of(raw: &RawRequest) -> Self {
        let body = match raw.body() {
            Body::Empty => Value::Null,
            Body::Json(v) => redact(v),
            Body::Invalid(reason) => Value::String(format!("<invalid: {reason}>")),
        };
        let cookies: Map<String, Value> = raw
            .cookies()
            .keys()
            .map(|k| (k.clone(), Value::String(SNIPPED.to_owned())))
            .collect();
        let headers: Map<String, Value> = raw
            .headers()
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(snip_header(k, v))))
            .collect();
        Self {
            path: pretty(&strings(raw.params().iter())),
            query: pretty(&strings(raw.query().iter())),
            body: pretty(&body),
            cookies: pretty(&Value::Object(cookies)),
            headers: pretty(&Value::Object(headers)),
        }
    }
}

pub(crate) fn incoming(raw: &RawRequest, settings: RequestSettings, snapshot: &Snapshot) {
    if settings.verbose {
        info!(
            method = %raw.method(),
            path = %redact_url(raw.url()),
            req_path = %snapshot.path,
            req_query = %snapshot.query,
            req_body = %snapshot.body,
            req_cookies = %snapshot.cookies,
            req_headers = %snapshot.headers,
            "Incoming request",
        );
    } else {
        info!(method = %raw.method(), path = %redact_url(raw.url()), "Incoming request");
    }
}

pub(crate) fn annotate_request_input(span: &Span, parsed: &ParsedRequest) {
    let summary = Value::Object(summarize(parsed.fields()));
    span.record("request_input", summary.to_string().as_str());
}

pub(crate) fn annotate_error(span: &Span, error: &ClassifiedError) {
    span.record("exception.escaped", true);
    span.record("exception.message", truncate(&error.to_string()).as_str());
    span.record("exception.stacktrace", error.pretty().as_str());
    span.record("exception.type", error.tag());
    span.record("error.type", error.kind().as_str());
}

/// How a dispatch ended, for the closing event.
pub(crate) enum Finish<'a> {
    Completed,
    Failed(&'a ClassifiedError),
    Interrupted,
}

fn response_headers(response: &Response) -> String {
    let headers: Map<String, Value> = response
        .headers()
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(snip_header(k, v))))
        .collect();
    pretty(&Value::Object(headers))
}

pub(crate) fn finished(
    raw: &RawRequest,
    settings: RequestSettings,
    snapshot: &Snapshot,
    response: &Response,
    finish: Finish<'_>,
) {
    let status = response.status_code().as_u16();
    Span::current().record("http.status_code", status);

    match finish {
        Finish::Failed(cause) => error!(
            method = %raw.method(),
            path = %redact_url(raw.url()),
            status_code = status,
            cause = %cause.pretty(),
            req_path = %snapshot.path,
            req_query = %snapshot.query,
            req_body = %snapshot.body,
            req_cookies = %snapshot.cookies,
            req_headers = %snapshot.headers,
            res_headers = %response_headers(response),
            "Finished request",
        ),
        Finish::Interrupted => {
            Span::current().record("interrupted", true);
            info!(method = %raw.method(), path = %redact_url(raw.url()), status_code = status, interrupted = true, "Finished request");
        }
        Finish::Completed if settings.verbose => info!(
            method = %raw.method(),
            path = %redact_url(raw.url()),
            status_code = status,
            res_headers = %response_headers(response),
            "Finished request",
        ),
        Finish::Completed => info!(method = %raw.method(), path = %redact_url(raw.url()), status_code = status, "Finished request"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn summary_rules() {
        let long = "x".repeat(300);
        let fields = json!({
            "name": "Ann",
            "bio": long,
            "tags": ["a", "b"],
            "address": { "city": "Oslo", "zip": "0150" },
            "nickname": null,
            "age": 40,
            "Password": "hunter2",
        });
        let Value::Object(fields) = fields else { unreachable!() };

        let summary = summarize(&fields);

        assert_eq!(summary["name"], "Ann");
        assert_eq!(summary["bio"].as_str().unwrap().chars().count(), 256);
        assert!(summary["bio"].as_str().unwrap().ends_with("..."));
        assert_eq!(summary["tags"], "Array[2]");
        assert_eq!(summary["address"], "Object[2]");
        assert_eq!(summary["nickname"], "null");
        assert_eq!(summary["age"], 40);
        assert_eq!(summary["Password"], "<redacted>");
    }

    #[test]
    fn redaction_reaches_nested_passwords() {
        let redacted = redact(&json!({ "user": { "login": "ann", "password": "hunter2" }, "list": [{ "password": 1 }] }));
        assert!(!redacted.to_string().contains("hunter2"));
        assert_eq!(redacted["list"][0]["password"], "<redacted>");
        assert_eq!(redacted["user"]["login"], "ann");
    }

    #[test]
    fn password_query_values_are_redacted_in_urls() {
        let url = redact_url("/login?user=ann&Password=hunter2&next=%2Fhome");
        assert!(!url.contains("hunter2"));
        assert!(url.starts_with("/login?user=ann&Password="));
        assert!(url.ends_with("&next=%2Fhome"));
        assert_eq!(redact_url("/users/42"), "/users/42");
    }

    #[test]
    fn sensitive_headers_are_snipped() {
        assert_eq!(snip_header("Authorization", "Bearer abc"), "<snipped>");
        assert_eq!(snip_header("content-type", "application/json"), "application/json");
        assert_eq!(snip_header("x-long", &"y".repeat(400)).len(), 256);
    }

    #[test]
    fn snapshot_hides_cookie_values_and_passwords() {
        let raw = RawRequest::builder(crate::method::Method::Post, "/login")
            .header("cookie", "session=s3cret")
            .json(json!({ "user": "ann", "password": "hunter2" }))
            .build();
        let snap = Snapshot::of(&raw);
        for text in [&snap.body, &snap.cookies, &snap.headers] {
            assert!(!text.contains("hunter2"));
            assert!(!text.contains("s3cret"));
        }
    }
}
