//! Built-in Kubernetes health-check endpoints.
//!
//! | Probe | Question | Answer |
//! |---|---|---|
//! | **Liveness** | Is the process alive? | Always `"ok"`. |
//! | **Readiness** | Can the pod take traffic? | `"ready"`, or `503` once shutdown started draining. |
//!
//! ```rust,no_run
//! use sluice::{AppState, Method, Router, StatusMapping, health};
//!
//! # fn main() -> Result<(), sluice::Error> {
//! let app = Router::new(AppState::new().error_handler(StatusMapping::new()))
//!     .route(Method::Get, "/healthz", health::liveness()?)?
//!     .route(Method::Get, "/readyz", health::readiness()?)?;
//! # let _ = app;
//! # Ok(())
//! # }
//! ```
//!
//! The readiness failure is a declared `ServiceUnavailableError`; map it with
//! [`StatusMapping`](crate::StatusMapping) to get the `503`.

use crate::classify::{DeclaredError, HandlerError};
use crate::context::Ctx;
use crate::dispatcher::Endpoint;
use crate::error::Error;
use crate::fiber::FiberSet;
use crate::schema;

pub fn liveness() -> Result<Endpoint, Error> {
    Endpoint::builder("liveness")
        .response(schema::string())
        .handler(|_ctx: Ctx| async { Ok::<_, HandlerError>("ok") })
}

pub fn readiness() -> Result<Endpoint, Error> {
    Endpoint::builder("readiness")
        .requires::<FiberSet>()
        .response(schema::string())
        .handler(|ctx: Ctx| async move {
            if ctx.get::<FiberSet>()?.is_draining() {
                return Err(DeclaredError::service_unavailable("draining in-flight requests").into());
            }
            Ok::<_, HandlerError>("ready")
        })
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;
    use crate::classify::StatusMapping;
    use crate::context::RequestSettings;
    use crate::dispatcher::{AppState, Dispatcher};
    use crate::method::Method;
    use crate::request::RawRequest;

    #[tokio::test]
    async fn readiness_flips_when_draining() {
        let state = AppState::new().error_handler(StatusMapping::new());
        let ready = Dispatcher::new(readiness().unwrap(), &state).unwrap();
        let request = || RawRequest::builder(Method::Get, "/readyz").build();

        let res = ready.dispatch(request(), RequestSettings::default()).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.json_body(), Some(serde_json::json!("ready")));

        assert_eq!(state.fibers().drain(std::time::Duration::from_millis(10)).await, 0);
        let res = ready.dispatch(request(), RequestSettings::default()).await;
        assert_eq!(res.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
