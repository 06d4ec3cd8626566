//! Capability injection.
//!
//! A capability is any shared service a handler needs: a repository, a clock,
//! an HTTP client. Capabilities live in a [`Capabilities`] registry keyed by
//! type identity, so a handler asks for `ctx.get::<dyn UserRepo>()` and never
//! names a concrete type.
//!
//! # Layers
//!
//! An endpoint may carry a middleware [`Layer`] that builds extra capabilities
//! out of ones the application already has (say, a per-request unit of work
//! out of a connection pool). Composition is plain set arithmetic over
//! [`Requirements`]:
//!
//! ```text
//! caller must supply = (handler.requires - layer.provides) ∪ layer.requires
//!                      - framework-injected
//! ```
//!
//! The result is checked against the application registry when the route is
//! registered, so a missing dependency fails at startup rather than on the
//! first request. At dispatch the layer is built once per request; wrap it in
//! [`SharedLayer`] to build once per process instead.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::classify::{DeclaredError, Fault};
use crate::context::RequestContext;
use crate::fiber::FiberSet;

/// Type-erased value stored in the registry. The concrete type is always
/// `Arc<T>` for the capability type `T`, which lets `T` be a trait object.
type Stored = Arc<dyn Any + Send + Sync>;

/// Identity of a capability type.
#[derive(Clone, Copy)]
pub struct CapabilityId {
    type_id: TypeId,
    name: &'static str,
}

impl CapabilityId {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self { type_id: TypeId::of::<T>(), name: type_name::<T>() }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for CapabilityId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for CapabilityId {}

impl fmt::Debug for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A set of capability identities, in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Requirements(Vec<CapabilityId>);

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: ?Sized + 'static>(mut self) -> Self {
        self.insert(CapabilityId::of::<T>());
        self
    }

    pub fn insert(&mut self, id: CapabilityId) {
        if !self.0.contains(&id) {
            self.0.push(id);
        }
    }

    pub fn contains(&self, id: CapabilityId) -> bool {
        self.0.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = CapabilityId> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn minus(&self, other: &Requirements) -> Requirements {
        Requirements(self.iter().filter(|id| !other.contains(*id)).collect())
    }

    pub fn union(&self, other: &Requirements) -> Requirements {
        let mut out = self.clone();
        for id in other.iter() {
            out.insert(id);
        }
        out
    }

    /// First requirement `available` cannot satisfy.
    pub fn first_missing(&self, available: &Capabilities) -> Option<CapabilityId> {
        self.iter().find(|id| !available.contains(*id))
    }

    /// Capabilities the dispatcher injects into every request.
    pub fn framework() -> Self {
        Self::new().with::<RequestContext>().with::<FiberSet>()
    }
}

/// Registry of capability values keyed by type identity.
#[derive(Clone, Default)]
pub struct Capabilities {
    services: HashMap<TypeId, (&'static str, Stored)>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a concrete value. Returns `self` for chaining.
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.insert::<T>(Arc::new(value));
        self
    }

    /// Adds a shared value, possibly a trait object:
    /// `caps.insert::<dyn Repo>(Arc::new(PgRepo::new()))`.
    pub fn insert<T: ?Sized + Send + Sync + 'static>(&mut self, value: Arc<T>) {
        self.services.insert(TypeId::of::<T>(), (type_name::<T>(), Arc::new(value) as Stored));
    }

    pub fn get<T: ?Sized + 'static>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .and_then(|(_, stored)| stored.downcast_ref::<Arc<T>>().map(Arc::clone))
    }

    pub fn contains(&self, id: CapabilityId) -> bool {
        self.services.contains_key(&id.type_id)
    }

    /// Copy of `self` with every entry of `overlay` added, replacing clashes.
    pub fn overlay(&self, overlay: &Capabilities) -> Capabilities {
        let mut services = self.services.clone();
        services.extend(overlay.services.iter().map(|(k, v)| (*k, v.clone())));
        Capabilities { services }
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.services.values().map(|(name, _)| name)).finish()
    }
}

/// Future returned by [`Layer::build`].
pub type LayerFuture<'a> = Pin<Box<dyn Future<Output = Result<Capabilities, DeclaredError>> + Send + 'a>>;

/// Builds capabilities out of other capabilities.
///
/// A build failure is a middleware error: it is classified and reported like a
/// declared business error, never as a fault.
pub trait Layer: Send + Sync + 'static {
    /// Capabilities `build` reads from its input.
    fn requires(&self) -> Requirements;

    /// Capabilities `build` is guaranteed to return.
    fn provides(&self) -> Requirements;

    fn build<'a>(&'a self, input: &'a Capabilities) -> LayerFuture<'a>;
}

/// A [`Layer`] backed by an async closure.
pub struct FnLayer<F> {
    requires: Requirements,
    provides: Requirements,
    build: F,
}

/// Creates a layer from its declared requirements and an async builder.
///
/// ```rust
/// use sluice::capability::{self, Capabilities, Requirements};
///
/// struct Pool;
/// struct Tx;
///
/// let layer = capability::layer_fn(
///     Requirements::new().with::<Pool>(),
///     Requirements::new().with::<Tx>(),
///     |caps: Capabilities| async move {
///         let _pool = caps.get::<Pool>();
///         Ok(Capabilities::new().with(Tx))
///     },
/// );
/// # let _ = layer;
/// ```
pub fn layer_fn<F, Fut>(requires: Requirements, provides: Requirements, build: F) -> FnLayer<F>
where
    F: Fn(Capabilities) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Capabilities, DeclaredError>> + Send + 'static,
{
    FnLayer { requires, provides, build }
}

impl<F, Fut> Layer for FnLayer<F>
where
    F: Fn(Capabilities) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Capabilities, DeclaredError>> + Send + 'static,
{
    fn requires(&self) -> Requirements {
        self.requires.clone()
    }

    fn provides(&self) -> Requirements {
        self.provides.clone()
    }

    fn build<'a>(&'a self, input: &'a Capabilities) -> LayerFuture<'a> {
        Box::pin((self.build)(input.clone()))
    }
}

/// Memoizes the first successful build of `L` for the life of the process.
///
/// Failed builds are not cached; the next dispatch retries.
pub struct SharedLayer<L> {
    inner: L,
    built: OnceCell<Capabilities>,
}

impl<L: Layer> SharedLayer<L> {
    pub fn new(inner: L) -> Self {
        Self { inner, built: OnceCell::new() }
    }
}

impl<L: Layer> Layer for SharedLayer<L> {
    fn requires(&self) -> Requirements {
        self.inner.requires()
    }

    fn provides(&self) -> Requirements {
        self.inner.provides()
    }

    fn build<'a>(&'a self, input: &'a Capabilities) -> LayerFuture<'a> {
        Box::pin(async move {
            self.built
                .get_or_try_init(|| self.inner.build(input))
                .await
                .cloned()
        })
    }
}

/// What a handler with `requires` asks of its caller once `layer` and the
/// framework have done their part.
pub fn compose(requires: &Requirements, layer: Option<&dyn Layer>) -> Requirements {
    let needed = match layer {
        Some(layer) => requires.minus(&layer.provides()).union(&layer.requires()),
        None => requires.clone(),
    };
    needed.minus(&Requirements::framework())
}

/// Failure to materialize a layer.
#[derive(Debug)]
pub(crate) enum LayerFailure {
    /// The layer reported an error.
    Declared(DeclaredError),
    /// The layer returned without something it promised.
    Broken(Fault),
}

/// Builds the capability set one dispatch runs with: `base` plus whatever the
/// layer provides.
pub(crate) async fn materialize(
    layer: Option<&dyn Layer>,
    base: &Capabilities,
) -> Result<Capabilities, LayerFailure> {
    let Some(layer) = layer else {
        return Ok(base.clone());
    };
    let built = layer.build(base).await.map_err(LayerFailure::Declared)?;
    if let Some(missing) = layer.provides().first_missing(&built) {
        return Err(LayerFailure::Broken(Fault::new(format!(
            "middleware layer did not provide `{}`",
            missing.name()
        ))));
    }
    Ok(base.overlay(&built))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    struct Pool;
    struct Tx(usize);
    struct Clock;

    fn counting_layer(count: Arc<AtomicUsize>) -> impl Layer {
        layer_fn(
            Requirements::new().with::<Pool>(),
            Requirements::new().with::<Tx>(),
            move |_caps: Capabilities| {
                let n = count.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Capabilities::new().with(Tx(n))) }
            },
        )
    }

    #[test]
    fn registry_holds_trait_objects() {
        let mut caps = Capabilities::new().with(Pool);
        caps.insert::<dyn Greeter>(Arc::new(English));

        assert_eq!(caps.get::<dyn Greeter>().unwrap().greet(), "hello");
        assert!(caps.get::<Pool>().is_some());
        assert!(caps.get::<Clock>().is_none());
        assert!(caps.contains(CapabilityId::of::<dyn Greeter>()));
    }

    #[test]
    fn composition_subtracts_what_the_layer_provides() {
        let count = Arc::new(AtomicUsize::new(0));
        let layer = counting_layer(count);
        let requires = Requirements::new().with::<Tx>().with::<Clock>().with::<RequestContext>();

        let needed = compose(&requires, Some(&layer));

        assert_eq!(needed, Requirements::new().with::<Clock>().with::<Pool>());
    }

    #[test]
    fn composition_without_layer_passes_through() {
        let requires = Requirements::new().with::<Clock>().with::<FiberSet>();
        assert_eq!(compose(&requires, None), Requirements::new().with::<Clock>());
    }

    #[tokio::test]
    async fn layer_builds_once_per_dispatch() {
        let count = Arc::new(AtomicUsize::new(0));
        let layer = counting_layer(count.clone());
        let base = Capabilities::new().with(Pool);

        let first = materialize(Some(&layer), &base).await.unwrap();
        let second = materialize(Some(&layer), &base).await.unwrap();

        assert_eq!(first.get::<Tx>().unwrap().0, 0);
        assert_eq!(second.get::<Tx>().unwrap().0, 1);
        assert!(second.get::<Pool>().is_some());
    }

    #[tokio::test]
    async fn shared_layer_builds_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let layer = SharedLayer::new(counting_layer(count.clone()));
        let base = Capabilities::new().with(Pool);

        for _ in 0..3 {
            let caps = materialize(Some(&layer), &base).await.unwrap();
            assert_eq!(caps.get::<Tx>().unwrap().0, 0);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broken_layer_is_a_fault() {
        let layer = layer_fn(
            Requirements::new(),
            Requirements::new().with::<Tx>(),
            |_caps: Capabilities| async { Ok(Capabilities::new()) },
        );

        let err = materialize(Some(&layer), &Capabilities::new()).await.unwrap_err();
        assert!(matches!(err, LayerFailure::Broken(_)));
    }

    #[tokio::test]
    async fn layer_error_is_declared() {
        let layer = layer_fn(Requirements::new(), Requirements::new(), |_caps: Capabilities| async {
            Err(DeclaredError::unauthorized("no token"))
        });

        let err = materialize(Some(&layer), &Capabilities::new()).await.unwrap_err();
        assert!(matches!(err, LayerFailure::Declared(e) if e.tag() == "UnauthorizedError"));
    }
}
