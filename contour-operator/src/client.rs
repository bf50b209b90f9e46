//! The client handed to controllers
use std::{ops::Deref, sync::Arc};

use kube::core::{ApiResource, GroupVersionKind};

use crate::discovery::{Kind, TypeRegistry};

/// The manager's cache-aware client together with the resolved [`TypeRegistry`]
///
/// Cloning shares the underlying caches and registry.
#[derive(Clone, Debug)]
pub struct ClientFacade {
    client: operator_runtime::Client,
    registry: Arc<TypeRegistry>,
}

impl ClientFacade {
    /// Combine a runtime client with the registry discovery produced.
    #[must_use]
    pub fn new(client: operator_runtime::Client, registry: TypeRegistry) -> Self {
        Self {
            client,
            registry: Arc::new(registry),
        }
    }

    /// The cache-aware client.
    #[must_use]
    pub fn client(&self) -> &operator_runtime::Client {
        &self.client
    }

    /// Resolved types.
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Resolved type of `kind`.
    #[must_use]
    pub fn resource(&self, kind: &Kind) -> Option<&ApiResource> {
        self.registry.get(kind)
    }

    /// Group/version/kind of `kind`.
    #[must_use]
    pub fn gvk(&self, kind: &Kind) -> Option<GroupVersionKind> {
        self.registry.gvk(kind)
    }
}

impl Deref for ClientFacade {
    type Target = operator_runtime::Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
