//! Failure taxonomy, classification and reporting.
//!
//! Everything that can go wrong inside one request ends up as a
//! [`ClassifiedError`]:
//!
//! | Variant      | Raised by                           | Response                  |
//! |--------------|-------------------------------------|---------------------------|
//! | `Validation` | the parser                          | [`ErrorHandler`] decides  |
//! | `Business`   | the handler, as a [`DeclaredError`] | [`ErrorHandler`] decides  |
//! | `Middleware` | a capability [`Layer`] build        | [`ErrorHandler`] decides  |
//! | `Fault`      | defects: panics, contract breaches  | always 500, generic body  |
//!
//! Every failure is also sent to the [`ErrorReporter`]. Reporting is fallible
//! and isolated: a reporter that errors or panics is logged once and otherwise
//! ignored, and the response that was already computed goes out unchanged.
//!
//! Interruption is not an error and never reaches this module.
//!
//! [`Layer`]: crate::capability::Layer

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;
use http::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{Span, error};

use crate::context::RequestContext;
use crate::observe;
use crate::parser::ValidationError;
use crate::response::Response;

/// An expected, caller-facing failure identified by a tag.
#[derive(Clone, Debug, Error, PartialEq, Serialize)]
#[error("{tag}: {message}")]
pub struct DeclaredError {
    tag: String,
    message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    details: Value,
}

impl DeclaredError {
    pub fn new(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self { tag: tag.into(), message: message.into(), details: Value::Null }
    }

    /// Structured data the error handler may pass on to the client.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn tag(&self) -> &str { &self.tag }
    pub fn message(&self) -> &str { &self.message }
    pub fn details(&self) -> &Value { &self.details }

    pub fn not_found(kind: &str, id: &Value) -> Self {
        Self::new("NotFoundError", format!("Didn't find {kind}#{id}"))
            .with_details(json!({ "type": kind, "id": id }))
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new("InvalidStateError", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new("ServiceUnavailableError", message)
    }

    pub fn not_logged_in(message: impl Into<String>) -> Self {
        Self::new("NotLoggedInError", message)
    }

    /// The user is known, but the login is unusable.
    pub fn login(message: impl Into<String>) -> Self {
        Self::new("LoginError", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UnauthorizedError", message)
    }

    pub fn optimistic_concurrency(kind: &str, id: &str) -> Self {
        Self::new("OptimisticConcurrencyException", format!("Existing {kind} {id} record changed"))
            .with_details(json!({ "type": kind, "id": id }))
    }
}

/// A defect: something that should not happen whatever the input.
#[derive(Clone, Debug, Error)]
#[error("{cause}")]
pub struct Fault {
    cause: String,
}

impl Fault {
    pub fn new(cause: impl Into<String>) -> Self {
        Self { cause: cause.into() }
    }

    /// Captures an error together with its `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut cause = err.to_string();
        let mut source = err.source();
        while let Some(inner) = source {
            cause.push_str(&format!("\n  caused by: {inner}"));
            source = inner.source();
        }
        Self { cause }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_owned());
        Self { cause: format!("panicked: {message}") }
    }
}

/// What a business handler may fail with.
#[derive(Clone, Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Declared(#[from] DeclaredError),
    #[error(transparent)]
    Fault(#[from] Fault),
}

/// Coarse failure category, as reported and logged.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    Business,
    Middleware,
    Fault,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Business => "business",
            Self::Middleware => "middleware",
            Self::Fault => "fault",
        }
    }
}

/// The terminal failure of one request.
#[derive(Clone, Debug, Error)]
pub enum ClassifiedError {
    #[error(transparent)]
    Validation(ValidationError),
    #[error(transparent)]
    Business(DeclaredError),
    #[error("middleware: {0}")]
    Middleware(DeclaredError),
    #[error("fault: {0}")]
    Fault(Fault),
}

impl From<HandlerError> for ClassifiedError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Declared(e) => Self::Business(e),
            HandlerError::Fault(f) => Self::Fault(f),
        }
    }
}

impl ClassifiedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Business(_) => ErrorKind::Business,
            Self::Middleware(_) => ErrorKind::Middleware,
            Self::Fault(_) => ErrorKind::Fault,
        }
    }

    /// Tag used for status mapping and `exception.type`.
    pub fn tag(&self) -> &str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Business(e) | Self::Middleware(e) => e.tag(),
            Self::Fault(_) => "UnclassifiedFault",
        }
    }

    /// Full, multi-line description for logs and traces. Never sent to clients.
    pub fn pretty(&self) -> String {
        match self {
            Self::Validation(e) => {
                let mut out = format!("[ValidationError] {} field(s) failed", e.issues.len());
                for issue in &e.issues {
                    out.push_str(&format!("\n  {issue}"));
                }
                out
            }
            Self::Business(e) => format!("[{}] {}", e.tag(), e.message()),
            Self::Middleware(e) => format!("[{}] (middleware) {}", e.tag(), e.message()),
            Self::Fault(f) => format!("[UnclassifiedFault] {f}"),
        }
    }
}

// ── Error handler ─────────────────────────────────────────────────────────────

/// Turns a non-fault failure into the client response.
///
/// Faults never reach the handler: they are always answered with a generic
/// 500 so no internal detail can leak.
pub trait ErrorHandler: Send + Sync + 'static {
    fn respond(&self, ctx: &RequestContext, error: &ClassifiedError) -> Response;
}

/// Structured client payload for a non-fault failure.
pub fn error_body(error: &ClassifiedError) -> Value {
    match error {
        ClassifiedError::Validation(e) => json!({
            "_tag": "ValidationError",
            "message": e.to_string(),
            "errors": e.issues,
        }),
        ClassifiedError::Business(e) | ClassifiedError::Middleware(e) => {
            let mut body = json!({ "_tag": e.tag(), "message": e.message() });
            if !e.details().is_null() {
                body["details"] = e.details().clone();
            }
            body
        }
        ClassifiedError::Fault(_) => fault_body(),
    }
}

fn fault_body() -> Value {
    json!({ "_tag": "InternalError", "message": "internal server error" })
}

/// Answers every failure with `500` and the structured payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn respond(&self, _ctx: &RequestContext, error: &ClassifiedError) -> Response {
        Response::json(StatusCode::INTERNAL_SERVER_ERROR, &error_body(error))
    }
}

/// Maps failure tags to statuses; unmapped tags get `500`.
///
/// Starts with the conventional table for the supported errors:
///
/// | Tag                              | Status |
/// |----------------------------------|--------|
/// | `ValidationError`                | 400    |
/// | `InvalidStateError`              | 400    |
/// | `NotLoggedInError`, `LoginError` | 401    |
/// | `UnauthorizedError`              | 403    |
/// | `NotFoundError`                  | 404    |
/// | `OptimisticConcurrencyException` | 409    |
/// | `ServiceUnavailableError`        | 503    |
#[derive(Clone, Debug)]
pub struct StatusMapping {
    statuses: HashMap<String, StatusCode>,
}

impl Default for StatusMapping {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMapping {
    pub fn new() -> Self {
        let statuses = [
            ("ValidationError", StatusCode::BAD_REQUEST),
            ("InvalidStateError", StatusCode::BAD_REQUEST),
            ("NotLoggedInError", StatusCode::UNAUTHORIZED),
            ("LoginError", StatusCode::UNAUTHORIZED),
            ("UnauthorizedError", StatusCode::FORBIDDEN),
            ("NotFoundError", StatusCode::NOT_FOUND),
            ("OptimisticConcurrencyException", StatusCode::CONFLICT),
            ("ServiceUnavailableError", StatusCode::SERVICE_UNAVAILABLE),
        ]
        .into_iter()
        .map(|(tag, status)| (tag.to_owned(), status))
        .collect();
        Self { statuses }
    }

    /// Adds or replaces the status for `tag`.
    pub fn map(mut self, tag: &str, status: StatusCode) -> Self {
        self.statuses.insert(tag.to_owned(), status);
        self
    }

    pub fn status_for(&self, tag: &str) -> StatusCode {
        self.statuses.get(tag).copied().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl ErrorHandler for StatusMapping {
    fn respond(&self, _ctx: &RequestContext, error: &ClassifiedError) -> Response {
        Response::json(self.status_for(error.tag()), &error_body(error))
    }
}

// ── Error reporting ───────────────────────────────────────────────────────────

/// What the reporter receives for one failure.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub tag: String,
    pub cause: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub request_id: String,
}

impl ErrorReport {
    fn new(error: &ClassifiedError, ctx: &RequestContext) -> Self {
        Self {
            kind: error.kind(),
            tag: error.tag().to_owned(),
            cause: error.pretty(),
            endpoint: ctx.name().to_owned(),
            method: ctx.method().to_string(),
            path: observe::redact_url(ctx.url()),
            request_id: ctx.request_id().to_owned(),
        }
    }
}

#[derive(Debug, Error)]
#[error("error report failed: {0}")]
pub struct ReportError(pub String);

/// Sends failures somewhere an operator will see them.
pub trait ErrorReporter: Send + Sync + 'static {
    fn report<'a>(&'a self, report: &'a ErrorReport) -> BoxFuture<'a, Result<(), ReportError>>;
}

/// Reports by logging at error level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report<'a>(&'a self, report: &'a ErrorReport) -> BoxFuture<'a, Result<(), ReportError>> {
        Box::pin(async move {
            error!(
                kind = report.kind.as_str(),
                tag = %report.tag,
                endpoint = %report.endpoint,
                method = %report.method,
                path = %report.path,
                request_id = %report.request_id,
                cause = %report.cause,
                "Reported error",
            );
            Ok(())
        })
    }
}

/// Produces the response for `error`, annotates the current span and awaits
/// the report.
pub(crate) async fn handle_failure(
    error: &ClassifiedError,
    ctx: &RequestContext,
    handler: &dyn ErrorHandler,
    reporter: &dyn ErrorReporter,
) -> Response {
    let response = match error {
        ClassifiedError::Fault(_) => Response::json(StatusCode::INTERNAL_SERVER_ERROR, &fault_body()),
        other => handler.respond(ctx, other),
    };
    observe::annotate_error(&Span::current(), error);
    report_isolated(reporter, ErrorReport::new(error, ctx)).await;
    response
}

async fn report_isolated(reporter: &dyn ErrorReporter, report: ErrorReport) {
    let outcome = AssertUnwindSafe(async { reporter.report(&report).await })
        .catch_unwind()
        .await;
    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => Fault::from_panic(panic).to_string(),
    };
    error!(cause = %failure, tag = %report.tag, "Error occurred while reporting error");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::method::Method;
    use crate::parser::FieldIssue;
    use crate::request::RawRequest;
    use crate::schema::Namespace;

    fn ctx() -> RequestContext {
        RequestContext::for_request("getThing", &RawRequest::builder(Method::Get, "/things/1").build())
    }

    fn validation() -> ClassifiedError {
        ClassifiedError::Validation(ValidationError {
            issues: vec![FieldIssue {
                namespace: Namespace::Query,
                field: "q".into(),
                message: "missing".into(),
            }],
        })
    }

    struct Failing {
        calls: AtomicUsize,
        panic: bool,
    }

    impl ErrorReporter for Failing {
        fn report<'a>(&'a self, _report: &'a ErrorReport) -> BoxFuture<'a, Result<(), ReportError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let panic = self.panic;
            Box::pin(async move {
                if panic {
                    panic!("reporter exploded");
                }
                Err(ReportError("collector unreachable".into()))
            })
        }
    }

    #[test]
    fn default_handler_answers_500_with_payload() {
        let res = DefaultErrorHandler.respond(&ctx(), &validation());
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = res.json_body().unwrap();
        assert_eq!(body["_tag"], "ValidationError");
        assert_eq!(body["errors"][0]["field"], "q");
    }

    #[test]
    fn status_mapping_table() {
        let mapping = StatusMapping::new().map("TeapotError", StatusCode::IM_A_TEAPOT);
        let respond = |e: DeclaredError| mapping.respond(&ctx(), &ClassifiedError::Business(e)).status_code();

        assert_eq!(mapping.respond(&ctx(), &validation()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(respond(DeclaredError::not_found("User", &json!(1))), StatusCode::NOT_FOUND);
        assert_eq!(respond(DeclaredError::optimistic_concurrency("User", "1")), StatusCode::CONFLICT);
        assert_eq!(respond(DeclaredError::new("TeapotError", "short")), StatusCode::IM_A_TEAPOT);
        assert_eq!(respond(DeclaredError::new("Unknown", "?")), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn declared_error_payload() {
        let body = error_body(&ClassifiedError::Business(DeclaredError::not_found("User", &json!(7))));
        assert_eq!(
            body,
            json!({
                "_tag": "NotFoundError",
                "message": "Didn't find User#7",
                "details": { "type": "User", "id": 7 },
            })
        );
    }

    #[tokio::test]
    async fn faults_bypass_the_handler() {
        let mapping = StatusMapping::new().map("UnclassifiedFault", StatusCode::OK);
        let fault = ClassifiedError::Fault(Fault::new("db password is hunter2"));

        let res = handle_failure(&fault, &ctx(), &mapping, &LogReporter).await;

        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(!body.contains("hunter2"));
    }

    #[tokio::test]
    async fn failing_reporter_does_not_change_response() {
        for panic in [false, true] {
            let reporter = Failing { calls: AtomicUsize::new(0), panic };
            let res = handle_failure(&validation(), &ctx(), &StatusMapping::new(), &reporter).await;
            assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
            assert_eq!(reporter.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn fault_captures_source_chain() {
        let io = std::io::Error::other("disk on fire");
        let json = serde_json::Error::io(io);
        let fault = Fault::from_error(&json);
        assert!(fault.to_string().contains("disk on fire"));
    }
}
