//! Per-request context values.
//!
//! Nothing here is global: the dispatcher builds these once per request and
//! passes them explicitly down the call chain.
//!
//! - [`RequestSettings`]: flags read at dispatch start (verbosity).
//! - [`RequestContext`]: identity of the request: endpoint name, request id,
//!   method, URL. Also injected as a capability.
//! - [`Ctx`]: what a business handler receives: the parsed input, the
//!   composed capabilities and the request context.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::capability::Capabilities;
use crate::classify::{Fault, HandlerError};
use crate::method::Method;
use crate::parser::ParsedRequest;
use crate::request::RawRequest;

/// Flags for one request execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestSettings {
    /// Log full request and response snapshots.
    pub verbose: bool,
}

impl RequestSettings {
    pub fn verbose() -> Self {
        Self { verbose: true }
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one request.
#[derive(Clone, Debug)]
pub struct RequestContext {
    name: String,
    request_id: String,
    method: Method,
    url: String,
}

impl RequestContext {
    /// Takes the request id from `x-request-id` when the client sent one.
    pub(crate) fn for_request(name: &str, raw: &RawRequest) -> Self {
        let request_id = raw
            .header("x-request-id")
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{:016x}", NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)));
        Self {
            name: name.to_owned(),
            request_id,
            method: raw.method(),
            url: raw.url().to_owned(),
        }
    }

    /// Name of the endpoint handling the request.
    pub fn name(&self) -> &str { &self.name }
    pub fn request_id(&self) -> &str { &self.request_id }
    pub fn method(&self) -> Method { self.method }
    /// Original URL, query string included.
    pub fn url(&self) -> &str { &self.url }
}

/// The handler's view of one request.
pub struct Ctx {
    input: ParsedRequest,
    capabilities: Capabilities,
    context: Arc<RequestContext>,
    token: CancellationToken,
}

impl Ctx {
    pub(crate) fn new(
        input: ParsedRequest,
        capabilities: Capabilities,
        context: Arc<RequestContext>,
        token: CancellationToken,
    ) -> Self {
        Self { input, capabilities, context, token }
    }

    pub fn input(&self) -> &ParsedRequest {
        &self.input
    }

    /// Deserializes the validated input into `T`.
    ///
    /// The input already passed schema validation, so a mismatch here means
    /// `T` and the endpoint's schema disagree: that is a fault.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        self.input
            .deserialize()
            .map_err(|e| Fault::new(format!("request does not fit handler input type: {e}")).into())
    }

    /// Looks up a capability. A missing one is a fault: registration already
    /// checked that everything the endpoint declared is present.
    pub fn get<T: ?Sized + 'static>(&self) -> Result<Arc<T>, HandlerError> {
        self.capabilities.get::<T>().ok_or_else(|| {
            Fault::new(format!("capability `{}` is not available", std::any::type_name::<T>())).into()
        })
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Whether shutdown asked this request to stop. Handlers run to completion
    /// regardless; long ones may check this at safe points.
    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_from_header_or_generated() {
        let raw = RawRequest::builder(Method::Get, "/a?b=1").header("X-Request-Id", "abc").build();
        let ctx = RequestContext::for_request("getA", &raw);
        assert_eq!(ctx.request_id(), "abc");
        assert_eq!(ctx.url(), "/a?b=1");

        let raw = RawRequest::builder(Method::Get, "/a").build();
        let one = RequestContext::for_request("getA", &raw);
        let two = RequestContext::for_request("getA", &raw);
        assert_ne!(one.request_id(), two.request_id());
    }
}
