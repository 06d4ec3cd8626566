//! Per-request orchestration.
//!
//! A [`Dispatcher`] turns one [`Endpoint`] definition into something that
//! answers requests. For each request it:
//!
//! 1. registers the execution in the [`FiberSet`],
//! 2. logs `Incoming request`,
//! 3. parses the request against the endpoint's schema,
//! 4. records the redacted input on the span and builds the capability set,
//! 5. forks the business function and joins it,
//! 6. encodes the result,
//! 7. on any failure classifies it, reports it and builds the error response,
//! 8. logs `Finished request`.
//!
//! Exactly one response comes out, and the closing event is emitted on every
//! path, including interruption.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use http::StatusCode;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, Span};

use crate::capability::{self, Capabilities, CapabilityId, Layer, LayerFailure, Requirements};
use crate::classify::{
    self, ClassifiedError, DefaultErrorHandler, ErrorHandler, ErrorReporter, Fault, HandlerError, LogReporter,
};
use crate::context::{Ctx, RequestContext, RequestSettings};
use crate::encoder::{self, ResponseSchema};
use crate::error::Error;
use crate::fiber::{self, FiberSet, Joined};
use crate::handler::{BoxedHandler, Handler};
use crate::method::Method;
use crate::observe::{self, Finish, Snapshot};
use crate::parser::{self, RequestSchema, RequestSchemaBuilder};
use crate::request::RawRequest;
use crate::response::Response;
use crate::schema::Schema;

/// Immutable description of one endpoint, shared by every request it serves.
pub struct Endpoint {
    name: String,
    request: RequestSchema,
    response: ResponseSchema,
    requires: Requirements,
    layer: Option<Arc<dyn Layer>>,
    handler: BoxedHandler,
}

impl Endpoint {
    /// ```rust
    /// use sluice::{Ctx, Endpoint, HandlerError, schema};
    /// use serde_json::{Value, json};
    ///
    /// async fn get_user(ctx: Ctx) -> Result<Value, HandlerError> {
    ///     let id = ctx.input().get("id").cloned().unwrap_or_default();
    ///     Ok(json!({ "id": id, "name": "Ann" }))
    /// }
    ///
    /// let endpoint = Endpoint::builder("getUser")
    ///     .path("id", schema::integer())
    ///     .response(schema::object().field("id", schema::integer()).field("name", schema::string()))
    ///     .handler(get_user)
    ///     .unwrap();
    /// assert_eq!(endpoint.name(), "getUser");
    /// ```
    pub fn builder(name: &str) -> EndpointBuilder {
        EndpointBuilder {
            name: name.to_owned(),
            request: RequestSchema::builder(),
            response: ResponseSchema::NoBody,
            requires: Requirements::new(),
            layer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the application must provide for this endpoint to run.
    pub fn requirements(&self) -> Requirements {
        capability::compose(&self.requires, self.layer.as_deref())
    }
}

pub struct EndpointBuilder {
    name: String,
    request: RequestSchemaBuilder,
    response: ResponseSchema,
    requires: Requirements,
    layer: Option<Arc<dyn Layer>>,
}

impl EndpointBuilder {
    pub fn path(mut self, name: &str, schema: impl Schema) -> Self {
        self.request = self.request.path(name, schema);
        self
    }

    pub fn query(mut self, name: &str, schema: impl Schema) -> Self {
        self.request = self.request.query(name, schema);
        self
    }

    pub fn body(mut self, name: &str, schema: impl Schema) -> Self {
        self.request = self.request.body(name, schema);
        self
    }

    pub fn header(mut self, name: &str, schema: impl Schema) -> Self {
        self.request = self.request.header(name, schema);
        self
    }

    pub fn cookie(mut self, name: &str, schema: impl Schema) -> Self {
        self.request = self.request.cookie(name, schema);
        self
    }

    /// Answer `200` with a body encoded through `schema`.
    pub fn response(mut self, schema: impl Schema) -> Self {
        self.response = ResponseSchema::json(schema);
        self
    }

    /// Answer `204` with no body. This is the default.
    pub fn no_body(mut self) -> Self {
        self.response = ResponseSchema::NoBody;
        self
    }

    /// Declares that the business function reads capability `T`.
    pub fn requires<T: ?Sized + 'static>(mut self) -> Self {
        self.requires.insert(CapabilityId::of::<T>());
        self
    }

    /// Builds part of the capability set per dispatch.
    pub fn layer(mut self, layer: impl Layer) -> Self {
        self.layer = Some(Arc::new(layer));
        self
    }

    /// Finishes the definition. Fails when a field is declared twice.
    pub fn handler(self, handler: impl Handler) -> Result<Endpoint, Error> {
        Ok(Endpoint {
            name: self.name,
            request: self.request.build()?,
            response: self.response,
            requires: self.requires,
            layer: self.layer,
            handler: handler.into_boxed_handler(),
        })
    }
}

/// Process-wide collaborators every dispatcher shares.
#[derive(Clone)]
pub struct AppState {
    capabilities: Capabilities,
    error_handler: Arc<dyn ErrorHandler>,
    reporter: Arc<dyn ErrorReporter>,
    fibers: FiberSet,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    /// No capabilities, [`DefaultErrorHandler`], [`LogReporter`] and a fresh
    /// [`FiberSet`].
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new(),
            error_handler: Arc::new(DefaultErrorHandler),
            reporter: Arc::new(LogReporter),
            fibers: FiberSet::new(),
        }
    }

    /// Registers an application-wide capability.
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.capabilities.insert(Arc::new(value));
        self
    }

    /// Registers an application-wide capability behind a shared pointer,
    /// which lets `T` be a trait object.
    pub fn provide<T: ?Sized + Send + Sync + 'static>(mut self, value: Arc<T>) -> Self {
        self.capabilities.insert(value);
        self
    }

    pub fn error_handler(mut self, handler: impl ErrorHandler) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    pub fn reporter(mut self, reporter: impl ErrorReporter) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn fibers(&self) -> &FiberSet {
        &self.fibers
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }
}

enum Outcome {
    Completed(Response),
    Failed(ClassifiedError),
    Interrupted,
}

/// An endpoint bound to the application state.
pub struct Dispatcher {
    endpoint: Endpoint,
    state: AppState,
}

impl Dispatcher {
    /// Binds `endpoint`. Fails if a capability it requires is not registered.
    pub fn new(endpoint: Endpoint, state: &AppState) -> Result<Self, Error> {
        if let Some(missing) = endpoint.requirements().first_missing(&state.capabilities) {
            return Err(Error::MissingCapability {
                endpoint: endpoint.name.clone(),
                capability: missing.name(),
            });
        }
        Ok(Self { endpoint, state: state.clone() })
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    /// Handles one request from start to finish.
    pub async fn dispatch(&self, raw: RawRequest, settings: RequestSettings) -> Response {
        let ctx = Arc::new(RequestContext::for_request(&self.endpoint.name, &raw));
        let span = observe::request_span(&ctx);
        self.run(raw, settings, ctx).instrument(span).await
    }

    /// Runs [`dispatch`](Self::dispatch) as its own task.
    ///
    /// Dropping the returned handle does not stop the request: it still
    /// reports its failure and logs `Finished request`.
    pub fn spawn(self: &Arc<Self>, raw: RawRequest, settings: RequestSettings) -> JoinHandle<Response> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.dispatch(raw, settings).await }.with_current_subscriber())
    }

    async fn run(&self, raw: RawRequest, settings: RequestSettings, ctx: Arc<RequestContext>) -> Response {
        let snapshot = Snapshot::of(&raw);
        observe::incoming(&raw, settings, &snapshot);

        let mut failure = None;
        let mut interrupted = false;
        let mut response = match self.execute(&raw, &ctx).await {
            Outcome::Completed(response) => response,
            Outcome::Failed(error) => {
                let response = classify::handle_failure(
                    &error,
                    &ctx,
                    self.state.error_handler.as_ref(),
                    self.state.reporter.as_ref(),
                )
                .await;
                failure = Some(error);
                response
            }
            Outcome::Interrupted => {
                interrupted = true;
                Response::json(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &json!({ "_tag": "InterruptedError", "message": "request interrupted" }),
                )
            }
        };

        if raw.method() == Method::Get {
            response.set_header("cache-control", "no-store");
        }

        let finish = match &failure {
            Some(error) => Finish::Failed(error),
            None if interrupted => Finish::Interrupted,
            None => Finish::Completed,
        };
        observe::finished(&raw, settings, &snapshot, &response, finish);
        response
    }

    async fn execute(&self, raw: &RawRequest, ctx: &Arc<RequestContext>) -> Outcome {
        let guard = Arc::new(self.state.fibers.register(ctx.name()));

        let parsed = match parser::parse(&self.endpoint.request, raw) {
            Ok(parsed) => parsed,
            Err(e) => return Outcome::Failed(ClassifiedError::Validation(e)),
        };
        observe::annotate_request_input(&Span::current(), &parsed);

        if guard.is_interrupted() {
            return Outcome::Interrupted;
        }

        let mut base = self.state.capabilities.clone();
        base.insert(Arc::clone(ctx));
        base.insert(Arc::new(self.state.fibers.clone()));

        let built = AssertUnwindSafe(capability::materialize(self.endpoint.layer.as_deref(), &base))
            .catch_unwind()
            .await;
        let capabilities = match built {
            Ok(Ok(capabilities)) => capabilities,
            Ok(Err(LayerFailure::Declared(e))) => return Outcome::Failed(ClassifiedError::Middleware(e)),
            Ok(Err(LayerFailure::Broken(fault))) => return Outcome::Failed(ClassifiedError::Fault(fault)),
            Err(panic) => return Outcome::Failed(ClassifiedError::Fault(Fault::from_panic(panic))),
        };

        let handler = Arc::clone(&self.endpoint.handler);
        let schema = self.endpoint.response.clone();
        let input = Ctx::new(parsed, capabilities, Arc::clone(ctx), guard.token().clone());

        let joined = fiber::fork_join(guard, async move {
            let value = handler.call(input).await?;
            Ok::<_, HandlerError>(encoder::encode(&schema, value)?)
        })
        .await;

        match joined {
            Joined::Completed(encoded) => Outcome::Completed(match encoded.body {
                Some(body) => Response::json(encoded.status, &body),
                None => Response::status(encoded.status),
            }),
            Joined::Failed(e) => Outcome::Failed(ClassifiedError::from(e)),
            Joined::Cancelled => Outcome::Interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::classify::{DeclaredError, StatusMapping};
    use crate::schema;

    async fn ok(_ctx: Ctx) -> Result<Value, HandlerError> {
        Ok(json!({ "name": "Ann" }))
    }

    struct Database;

    #[test]
    fn missing_capability_is_rejected_at_registration() {
        let endpoint = Endpoint::builder("needsDb").requires::<Database>().handler(ok).unwrap();
        let err = Dispatcher::new(endpoint, &AppState::new()).err().unwrap();
        assert!(matches!(err, Error::MissingCapability { capability, .. } if capability.contains("Database")));

        let endpoint = Endpoint::builder("needsDb").requires::<Database>().handler(ok).unwrap();
        assert!(Dispatcher::new(endpoint, &AppState::new().with(Database)).is_ok());
    }

    #[test]
    fn framework_capabilities_need_no_registration() {
        let endpoint = Endpoint::builder("ctx")
            .requires::<RequestContext>()
            .requires::<FiberSet>()
            .handler(ok)
            .unwrap();
        assert!(endpoint.requirements().is_empty());
    }

    #[tokio::test]
    async fn get_gets_no_store() {
        let endpoint = Endpoint::builder("getUser")
            .path("id", schema::number())
            .response(schema::object().field("name", schema::string()))
            .handler(ok)
            .unwrap();
        let dispatcher = Dispatcher::new(endpoint, &AppState::new()).unwrap();

        let raw = RawRequest::builder(Method::Get, "/users/42").param("id", "42").build();
        let res = dispatcher.dispatch(raw, RequestSettings::default()).await;

        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.json_body(), Some(json!({ "name": "Ann" })));
        assert_eq!(res.header("cache-control"), Some("no-store"));
        assert!(dispatcher.state.fibers.is_empty());
    }

    #[tokio::test]
    async fn declared_errors_go_through_the_error_handler() {
        async fn missing(_ctx: Ctx) -> Result<(), DeclaredError> {
            Err(DeclaredError::not_found("User", &json!(3)))
        }
        let endpoint = Endpoint::builder("deleteUser").handler(missing).unwrap();
        let state = AppState::new().error_handler(StatusMapping::new());
        let dispatcher = Dispatcher::new(endpoint, &state).unwrap();

        let res = dispatcher
            .dispatch(RawRequest::builder(Method::Delete, "/users/3").build(), RequestSettings::default())
            .await;

        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        assert!(res.header("cache-control").is_none());
    }

    #[tokio::test]
    async fn interrupted_requests_never_start() {
        let endpoint = Endpoint::builder("late").handler(ok).unwrap();
        let state = AppState::new();
        state.fibers().interrupt_all();
        let dispatcher = Dispatcher::new(endpoint, &state).unwrap();

        let res = dispatcher
            .dispatch(RawRequest::builder(Method::Post, "/late").build(), RequestSettings::default())
            .await;

        assert_eq!(res.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.fibers().is_empty());
    }
}
