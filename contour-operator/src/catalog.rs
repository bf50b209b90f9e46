//! The resource types this operator reacts to
use std::fmt;

use kube::core::GroupVersionResource;

/// Api group of the Gateway API resources.
pub const GATEWAY_API_GROUP: &str = "networking.x-k8s.io";
/// Served version of the Gateway API resources.
pub const GATEWAY_API_VERSION: &str = "v1alpha1";

/// Api group of the operator's own resources.
pub const OPERATOR_GROUP: &str = "operator.projectcontour.io";
/// Served version of the operator's own resources.
pub const OPERATOR_VERSION: &str = "v1alpha1";

/// Resources the Gateway API group exposes.
const GATEWAY_API_RESOURCES: &[&str] = &[
    "gatewayclasses",
    "gateways",
    "httproutes",
    "tlsroutes",
    "tcproutes",
    "udproutes",
];

/// Gateway API resources the operator does not support yet.
///
/// This list is the single place deciding what is left out of the watch set.
pub const UNSUPPORTED_RESOURCES: &[&str] = &["tcproutes", "udproutes"];

/// A group/version/resource triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceDescriptor {
    /// Api group, empty for the core group.
    pub group: String,
    /// Api version within the group.
    pub version: String,
    /// Plural resource name.
    pub resource: String,
}

impl ResourceDescriptor {
    /// Describe `resource` served at `group/version`.
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// The `apiVersion` objects of this resource carry.
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Convert into kube's representation.
    #[must_use]
    pub fn gvr(&self) -> GroupVersionResource {
        GroupVersionResource::gvr(&self.group, &self.version, &self.resource)
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.resource, self.version)
        } else {
            write!(f, "{}.{}.{}", self.resource, self.version, self.group)
        }
    }
}

/// Whether the operator supports a Gateway API resource.
#[must_use]
pub fn is_supported(resource: &str) -> bool {
    GATEWAY_API_RESOURCES.contains(&resource) && !UNSUPPORTED_RESOURCES.contains(&resource)
}

/// Gateway API resources the operator watches, in a stable order.
#[must_use]
pub fn managed_resource_types() -> Vec<ResourceDescriptor> {
    GATEWAY_API_RESOURCES
        .iter()
        .filter(|resource| is_supported(resource))
        .map(|resource| ResourceDescriptor::new(GATEWAY_API_GROUP, GATEWAY_API_VERSION, *resource))
        .collect()
}

/// The operator's own `Contour` resource.
#[must_use]
pub fn operator_resource() -> ResourceDescriptor {
    ResourceDescriptor::new(OPERATOR_GROUP, OPERATOR_VERSION, "contours")
}
