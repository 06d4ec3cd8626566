//! # sluice
//!
//! Schema-driven request dispatch for hyper services.
//!
//! An [`Endpoint`] is declared once: which fields it reads from the path,
//! query, body, headers and cookies, what it answers with, which capabilities
//! its business function needs. sluice turns it into a handler that, for
//! every request:
//!
//! - validates every field and reports all failures at once,
//! - injects the capabilities, built per request by an optional [`Layer`],
//! - runs the business function to completion even if shutdown interrupts
//!   the request,
//! - encodes the result against the response schema,
//! - classifies, reports and answers any failure,
//! - logs exactly one `Incoming request` and one `Finished request` event,
//!   with passwords redacted.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use serde::Deserialize;
//! use serde_json::{Value, json};
//! use sluice::{AppState, Ctx, DeclaredError, Endpoint, HandlerError, Method, Router, Server,
//!              StatusMapping, schema};
//!
//! #[derive(Deserialize)]
//! struct GetUser { id: i64 }
//!
//! async fn get_user(ctx: Ctx) -> Result<Value, HandlerError> {
//!     let GetUser { id } = ctx.parse()?;
//!     if id != 42 {
//!         return Err(DeclaredError::not_found("User", &json!(id)).into());
//!     }
//!     Ok(json!({ "name": "Ann" }))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sluice::Error> {
//!     let get_user = Endpoint::builder("getUser")
//!         .path("id", schema::integer())
//!         .response(schema::object().field("name", schema::string()))
//!         .handler(get_user)?;
//!
//!     let app = Router::new(AppState::new().error_handler(StatusMapping::new()))
//!         .route(Method::Get, "/users/{id}", get_user)?;
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await
//! }
//! ```

mod context;
mod dispatcher;
mod encoder;
mod error;
mod handler;
mod method;
mod request;
mod response;
mod router;
mod server;

pub mod capability;
pub mod classify;
pub mod config;
pub mod fiber;
pub mod health;
pub mod logging;
pub mod observe;
pub mod parser;
pub mod schema;

pub use capability::{Capabilities, Layer, Requirements, SharedLayer};
pub use classify::{
    ClassifiedError, DeclaredError, DefaultErrorHandler, ErrorHandler, ErrorKind, ErrorReport, ErrorReporter,
    Fault, HandlerError, LogReporter, ReportError, StatusMapping,
};
pub use context::{Ctx, RequestContext, RequestSettings};
pub use dispatcher::{AppState, Dispatcher, Endpoint, EndpointBuilder};
pub use encoder::{Encoded, ResponseSchema, encode};
pub use error::Error;
pub use fiber::{FiberGuard, FiberSet, Joined};
pub use handler::Handler;
pub use method::{Method, UnsupportedMethod};
pub use parser::{FieldIssue, ParsedRequest, RequestSchema, ValidationError};
pub use request::{Body, RawRequest, RawRequestBuilder};
pub use response::{Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
