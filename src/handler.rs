//! Handler trait and type erasure.
//!
//! # How business functions are stored
//!
//! Every endpoint carries a business function of its own concrete type, but
//! the dispatcher needs to hold them uniformly. Handlers are erased behind
//! `dyn ErasedHandler`, and their typed output is serialized into a
//! [`Value`] on the way out so the response encoder can check it against the
//! endpoint's schema.
//!
//! ```text
//! async fn get_user(ctx: Ctx) -> Result<User, HandlerError>   ← user writes this
//!        ↓ Endpoint::builder("getUser").handler(get_user)
//! get_user.into_boxed_handler()                               ← Handler blanket impl
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(ctx)  at request time                          ← one vtable dispatch
//!        ↓
//! Box::pin(async { serde_json::to_value(get_user(ctx).await?) })
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::classify::{Fault, HandlerError};
use crate::context::Ctx;

/// Future returned by an erased handler.
pub(crate) type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler: Send + Sync + 'static {
    fn call(&self, ctx: Ctx) -> HandlerFuture;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler>;

/// Implemented for every valid business function.
///
/// You never implement this yourself. It is satisfied by any async function
/// or closure of the shape
///
/// ```text
/// async fn name(ctx: Ctx) -> Result<impl Serialize, impl Into<HandlerError>>
/// ```
///
/// Return `()` from endpoints declared with no body.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, T, E> private::Sealed for F
where
    F: Fn(Ctx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize + Send + 'static,
    E: Into<HandlerError> + Send + 'static,
{
}

impl<F, Fut, T, E> Handler for F
where
    F: Fn(Ctx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize + Send + 'static,
    E: Into<HandlerError> + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

struct FnHandler<F>(F);

impl<F, Fut, T, E> ErasedHandler for FnHandler<F>
where
    F: Fn(Ctx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize + Send + 'static,
    E: Into<HandlerError> + Send + 'static,
{
    fn call(&self, ctx: Ctx) -> HandlerFuture {
        let fut = (self.0)(ctx);
        Box::pin(async move {
            let value = fut.await.map_err(Into::into)?;
            serde_json::to_value(value)
                .map_err(|e| Fault::new(format!("handler output is not serializable: {e}")).into())
        })
    }
}
