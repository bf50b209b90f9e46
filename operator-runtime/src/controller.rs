//! Controller registrations for a [`Manager`](crate::Manager)
//!
//! A registration declares which kinds a controller reacts to before it runs,
//! so the manager can reject conflicting watch sets and index ownership, and
//! carries the closure that builds and drives the controller once started.

use std::{
    collections::BTreeMap,
    future::Future,
    hash::Hash,
};

use futures::{future::BoxFuture, FutureExt};
use kube::{
    core::{ApiResource, GroupVersionKind},
    runtime::reflector::ObjectRef,
    Resource, ResourceExt,
};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{gvk_of, gvk_of_dynamic, Client},
    metrics::ControllerMetrics,
};

/// Error type controllers report back to the manager
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Runner = Box<dyn FnOnce(Context) -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// Everything a running controller gets from the manager
#[derive(Clone, Debug)]
pub struct Context {
    name: String,
    client: Client,
    shutdown: CancellationToken,
    metrics: ControllerMetrics,
}

impl Context {
    pub(crate) fn new(name: String, client: Client, shutdown: CancellationToken, metrics: ControllerMetrics) -> Self {
        Self {
            name,
            client,
            shutdown,
            metrics,
        }
    }

    /// Name the controller was registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The manager's cache-aware client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Reconcile counters of this controller.
    #[must_use]
    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    /// Resolves once the manager is asked to stop.
    ///
    /// Suitable for `Controller::graceful_shutdown_on`.
    pub fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + Sync + 'static {
        self.shutdown.clone().cancelled_owned()
    }

    /// Whether the manager has been asked to stop.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Declared watch set of one controller plus the closure running it
pub struct ControllerRegistration {
    name: String,
    primary: GroupVersionKind,
    owns: Vec<GroupVersionKind>,
    watches: Vec<GroupVersionKind>,
    runner: Runner,
}

impl ControllerRegistration {
    /// Register a controller whose primary kind is `K`.
    pub fn new<K, F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        K: Resource<DynamicType = ()>,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::new_with(name, gvk_of::<K>(), run)
    }

    /// Register a controller whose primary kind is only known at runtime.
    pub fn new_with<F, Fut>(name: impl Into<String>, primary: GroupVersionKind, run: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            primary,
            owns: Vec::new(),
            watches: Vec::new(),
            runner: Box::new(move |ctx| run(ctx).boxed()),
        }
    }

    /// Declare that changes to `Child` re-trigger the owning primary object.
    #[must_use]
    pub fn owns<Child: Resource<DynamicType = ()>>(mut self) -> Self {
        self.owns.push(gvk_of::<Child>());
        self
    }

    /// Declare a secondary kind mapped onto primary objects by the controller.
    #[must_use]
    pub fn watches<Other: Resource<DynamicType = ()>>(mut self) -> Self {
        self.watches.push(gvk_of::<Other>());
        self
    }

    /// [`ControllerRegistration::watches`] for a discovered kind.
    #[must_use]
    pub fn watches_dynamic(mut self, ar: &ApiResource) -> Self {
        self.watches.push(gvk_of_dynamic(ar));
        self
    }

    /// Registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary kind.
    #[must_use]
    pub fn primary(&self) -> &GroupVersionKind {
        &self.primary
    }

    /// Kinds owned by the primary kind.
    #[must_use]
    pub fn owned(&self) -> &[GroupVersionKind] {
        &self.owns
    }

    /// Every kind this controller watches, primary first.
    pub fn kinds(&self) -> impl Iterator<Item = &GroupVersionKind> {
        std::iter::once(&self.primary)
            .chain(&self.owns)
            .chain(&self.watches)
    }

    pub(crate) fn run(self, ctx: Context) -> BoxFuture<'static, Result<(), BoxError>> {
        (self.runner)(ctx)
    }
}

impl std::fmt::Debug for ControllerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerRegistration")
            .field("name", &self.name)
            .field("primary", &self.primary)
            .field("owns", &self.owns)
            .field("watches", &self.watches)
            .finish_non_exhaustive()
    }
}

/// Map an object to its owner through a pair of labels naming it.
///
/// For ownership that can not be expressed with `ownerReferences`, e.g. children
/// living in a different namespace than their owner.
pub fn owner_from_labels<K, Owner>(obj: &K, name_label: &str, namespace_label: &str) -> Option<ObjectRef<Owner>>
where
    K: Resource,
    Owner: Resource,
    Owner::DynamicType: Default + Eq + Hash,
{
    let labels: &BTreeMap<String, String> = obj.labels();
    let name = labels.get(name_label)?;
    let namespace = labels.get(namespace_label)?;
    Some(ObjectRef::new(name).within(namespace))
}
