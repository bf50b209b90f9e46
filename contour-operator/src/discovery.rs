//! Resolving the watch set against what the cluster actually serves
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
};

use kube::core::{ApiResource, GroupVersionKind};
use thiserror::Error;
use tracing::debug;

use crate::catalog::{self, ResourceDescriptor};

/// Errors resolving kinds against the api server
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The api server could not be queried.
    #[error("api discovery failed: {0}")]
    Api(#[source] kube::Error),

    /// The api server does not serve a required resource.
    #[error("{0} is not served by the cluster")]
    Unresolved(ResourceDescriptor),
}

/// Kinds known to the operator
///
/// Everything the catalog does not name explicitly is carried as an [`Kind::Extension`]
/// so the set stays open to kinds added later.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// `operator.projectcontour.io/v1alpha1` Contour
    Contour,
    /// Gateway API GatewayClass
    GatewayClass,
    /// Gateway API Gateway
    Gateway,
    /// Gateway API HTTPRoute
    HttpRoute,
    /// Gateway API TLSRoute
    TlsRoute,
    /// Any other resource
    Extension(ResourceDescriptor),
}

impl Kind {
    const KNOWN: [Kind; 5] = [
        Kind::Contour,
        Kind::GatewayClass,
        Kind::Gateway,
        Kind::HttpRoute,
        Kind::TlsRoute,
    ];

    /// The resource backing this kind.
    #[must_use]
    pub fn descriptor(&self) -> ResourceDescriptor {
        let gateway = |resource: &str| {
            ResourceDescriptor::new(catalog::GATEWAY_API_GROUP, catalog::GATEWAY_API_VERSION, resource)
        };
        match self {
            Kind::Contour => catalog::operator_resource(),
            Kind::GatewayClass => gateway("gatewayclasses"),
            Kind::Gateway => gateway("gateways"),
            Kind::HttpRoute => gateway("httproutes"),
            Kind::TlsRoute => gateway("tlsroutes"),
            Kind::Extension(descriptor) => descriptor.clone(),
        }
    }

    /// Map a resource onto the kind it backs.
    #[must_use]
    pub fn from_descriptor(descriptor: ResourceDescriptor) -> Kind {
        Kind::KNOWN
            .into_iter()
            .find(|kind| kind.descriptor() == descriptor)
            .unwrap_or(Kind::Extension(descriptor))
    }

    /// Every kind the operator watches: its own resource followed by the catalog.
    #[must_use]
    pub fn watch_set() -> Vec<Kind> {
        std::iter::once(Kind::Contour)
            .chain(catalog::managed_resource_types().into_iter().map(Kind::from_descriptor))
            .collect()
    }
}

/// Resolved type information keyed by [`Kind`]
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    resources: HashMap<Kind, ApiResource>,
    order: Vec<Kind>,
}

impl TypeRegistry {
    /// Record the resolved type of `kind`, replacing an earlier one.
    pub fn insert(&mut self, kind: Kind, resource: ApiResource) {
        if self.resources.insert(kind.clone(), resource).is_none() {
            self.order.push(kind);
        }
    }

    /// Resolved type of `kind`.
    #[must_use]
    pub fn get(&self, kind: &Kind) -> Option<&ApiResource> {
        self.resources.get(kind)
    }

    /// Group/version/kind of `kind`.
    #[must_use]
    pub fn gvk(&self, kind: &Kind) -> Option<GroupVersionKind> {
        self.get(kind)
            .map(|ar| GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind))
    }

    /// Whether `kind` was resolved.
    #[must_use]
    pub fn contains(&self, kind: &Kind) -> bool {
        self.resources.contains_key(kind)
    }

    /// Resolved kinds in insertion order.
    pub fn kinds(&self) -> impl Iterator<Item = &Kind> {
        self.order.iter()
    }

    /// Number of resolved kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Resolves kinds into concrete type information
pub trait TypeResolver {
    /// Resolve every kind in `kinds`, failing if any of them is not served.
    fn resolve(&self, kinds: &[Kind]) -> impl Future<Output = Result<TypeRegistry, DiscoveryError>> + Send;
}

/// [`TypeResolver`] querying the api server's discovery endpoints
#[derive(Clone)]
pub struct ClusterDiscovery {
    client: kube::Client,
}

impl ClusterDiscovery {
    /// Resolve through `client`.
    #[must_use]
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

impl TypeResolver for ClusterDiscovery {
    async fn resolve(&self, kinds: &[Kind]) -> Result<TypeRegistry, DiscoveryError> {
        // one discovery round trip per group version
        let mut by_version: BTreeMap<String, Vec<(&Kind, ResourceDescriptor)>> = BTreeMap::new();
        for kind in kinds {
            let descriptor = kind.descriptor();
            by_version
                .entry(descriptor.api_version())
                .or_default()
                .push((kind, descriptor));
        }

        let mut served = HashMap::new();
        for (api_version, wanted) in &by_version {
            let list = if wanted.iter().all(|(_, d)| d.group.is_empty()) {
                self.client.list_core_api_resources(api_version).await
            } else {
                self.client.list_api_group_resources(api_version).await
            };
            match list {
                Ok(list) => {
                    debug!(%api_version, resources = list.resources.len(), "discovered group version");
                    for resource in list.resources {
                        served.insert((api_version.clone(), resource.name.clone()), resource);
                    }
                }
                // group version not served at all, reported per kind below
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                Err(err) => return Err(DiscoveryError::Api(err)),
            }
        }

        let mut registry = TypeRegistry::default();
        for kind in kinds {
            let descriptor = kind.descriptor();
            let resource = served
                .get(&(descriptor.api_version(), descriptor.resource.clone()))
                .ok_or_else(|| DiscoveryError::Unresolved(descriptor.clone()))?;
            let gvk = GroupVersionKind::gvk(&descriptor.group, &descriptor.version, &resource.kind);
            registry.insert(kind.clone(), ApiResource::from_gvk_with_plural(&gvk, &resource.name));
        }
        Ok(registry)
    }
}

impl std::fmt::Debug for ClusterDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterDiscovery").finish_non_exhaustive()
    }
}
