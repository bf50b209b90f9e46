//! Cache-aware access to the kubernetes api
//!
//! Reads are served from the reflector [`Store`]s that running controllers register,
//! unless the kind was excluded from caching, in which case they always go to the api
//! server. Writes always go to the api server.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    fmt::Debug,
    hash::Hash,
    sync::Arc,
};

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams},
    core::{ApiResource, GroupVersionKind},
    runtime::reflector::{ObjectRef, Store},
    Resource,
};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

/// Group/version/kind of a statically typed resource.
#[must_use]
pub fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// Group/version/kind of a discovered resource.
#[must_use]
pub fn gvk_of_dynamic(ar: &ApiResource) -> GroupVersionKind {
    GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind)
}

type ErasedStore = Box<dyn Any + Send + Sync>;

/// A typed client that prefers watch-fed caches for reads
#[derive(Clone)]
pub struct Client {
    inner: kube::Client,
    stores: Arc<RwLock<HashMap<GroupVersionKind, ErasedStore>>>,
    uncached: Arc<HashSet<GroupVersionKind>>,
}

impl Client {
    /// Wrap a [`kube::Client`], never caching the kinds in `uncached`.
    #[must_use]
    pub fn new(client: kube::Client, uncached: impl IntoIterator<Item = GroupVersionKind>) -> Self {
        Self {
            inner: client,
            stores: Arc::default(),
            uncached: Arc::new(uncached.into_iter().collect()),
        }
    }

    /// The underlying api client.
    #[must_use]
    pub fn kube(&self) -> &kube::Client {
        &self.inner
    }

    /// Whether reads of `gvk` bypass the cache.
    #[must_use]
    pub fn is_uncached(&self, gvk: &GroupVersionKind) -> bool {
        self.uncached.contains(gvk)
    }

    /// Kinds that are always read live.
    pub fn uncached(&self) -> impl Iterator<Item = &GroupVersionKind> {
        self.uncached.iter()
    }

    /// Make a reflector store available for reads of `K`.
    ///
    /// Ignored for kinds excluded from caching. A later store for the same kind replaces
    /// the earlier one.
    pub fn register_store<K>(&self, store: Store<K>)
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    {
        self.insert_store(gvk_of::<K>(), store);
    }

    /// Make a reflector store of discovered objects available for reads of `ar`.
    pub fn register_dynamic_store(&self, ar: &ApiResource, store: Store<DynamicObject>) {
        self.insert_store(gvk_of_dynamic(ar), store);
    }

    fn insert_store<K>(&self, gvk: GroupVersionKind, store: Store<K>)
    where
        K: Resource + Clone + Send + Sync + 'static,
        K::DynamicType: Eq + Hash + Clone + Send + Sync + 'static,
    {
        if self.is_uncached(&gvk) {
            tracing::debug!(kind = %gvk.kind, "not caching excluded kind");
            return;
        }
        self.stores.write().insert(gvk, Box::new(store));
    }

    fn store<K>(&self, gvk: &GroupVersionKind) -> Option<Store<K>>
    where
        K: Resource + Clone + 'static,
        K::DynamicType: Eq + Hash + Clone + 'static,
    {
        if self.is_uncached(gvk) {
            return None;
        }
        self.stores
            .read()
            .get(gvk)
            .and_then(|store| store.downcast_ref::<Store<K>>())
            .cloned()
    }

    /// Get a namespaced object.
    ///
    /// # Errors
    /// Fails when a live read is needed and the api call fails.
    pub async fn get<K>(&self, namespace: &str, name: &str) -> kube::Result<Option<Arc<K>>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        if let Some(store) = self.store::<K>(&gvk_of::<K>()) {
            return Ok(store.get(&ObjectRef::new(name).within(namespace)));
        }
        let api: Api<K> = Api::namespaced(self.inner.clone(), namespace);
        Ok(api.get_opt(name).await?.map(Arc::new))
    }

    /// Get a cluster scoped object.
    ///
    /// # Errors
    /// Fails when a live read is needed and the api call fails.
    pub async fn get_cluster<K>(&self, name: &str) -> kube::Result<Option<Arc<K>>>
    where
        K: Resource<DynamicType = (), Scope = ClusterResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        if let Some(store) = self.store::<K>(&gvk_of::<K>()) {
            return Ok(store.get(&ObjectRef::new(name)));
        }
        let api: Api<K> = Api::all(self.inner.clone());
        Ok(api.get_opt(name).await?.map(Arc::new))
    }

    /// List `K` across all namespaces.
    ///
    /// # Errors
    /// Fails when a live read is needed and the api call fails.
    pub async fn list<K>(&self) -> kube::Result<Vec<Arc<K>>>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        if let Some(store) = self.store::<K>(&gvk_of::<K>()) {
            return Ok(store.state());
        }
        let api: Api<K> = Api::all(self.inner.clone());
        Ok(api.list(&ListParams::default()).await?.into_iter().map(Arc::new).collect())
    }

    /// Get a discovered object, `namespace` being `None` for cluster scoped kinds.
    ///
    /// # Errors
    /// Fails when a live read is needed and the api call fails.
    pub async fn get_dynamic(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> kube::Result<Option<Arc<DynamicObject>>> {
        if let Some(store) = self.store::<DynamicObject>(&gvk_of_dynamic(ar)) {
            let mut obj_ref = ObjectRef::new_with(name, ar.clone());
            if let Some(ns) = namespace {
                obj_ref = obj_ref.within(ns);
            }
            return Ok(store.get(&obj_ref));
        }
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.inner.clone(), ns, ar),
            None => Api::all_with(self.inner.clone(), ar),
        };
        Ok(api.get_opt(name).await?.map(Arc::new))
    }

    /// Server-side apply a namespaced object.
    ///
    /// # Errors
    /// Fails when the object has no name or the api call fails.
    pub async fn apply<K>(&self, namespace: &str, obj: &K, field_manager: &str) -> kube::Result<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.inner.clone(), namespace);
        let name = obj.meta().name.clone().unwrap_or_default();
        api.patch(&name, &PatchParams::apply(field_manager).force(), &Patch::Apply(obj))
            .await
    }

    /// Server-side apply a cluster scoped object.
    ///
    /// # Errors
    /// Fails when the api call fails.
    pub async fn apply_cluster<K>(&self, obj: &K, field_manager: &str) -> kube::Result<K>
    where
        K: Resource<DynamicType = (), Scope = ClusterResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let api: Api<K> = Api::all(self.inner.clone());
        let name = obj.meta().name.clone().unwrap_or_default();
        api.patch(&name, &PatchParams::apply(field_manager).force(), &Patch::Apply(obj))
            .await
    }

    /// Merge patch the status subresource of a namespaced object.
    ///
    /// # Errors
    /// Fails when the api call fails.
    pub async fn patch_status<K>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> kube::Result<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    {
        let api: Api<K> = Api::namespaced(self.inner.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
    }

    /// Delete a namespaced object, treating an already missing object as deleted.
    ///
    /// # Errors
    /// Fails when the api call fails for any reason other than a 404.
    pub async fn delete<K>(&self, namespace: &str, name: &str) -> kube::Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    {
        let api: Api<K> = Api::namespaced(self.inner.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// [`Client::delete`] for a cluster scoped object.
    ///
    /// # Errors
    /// Fails when the api call fails for any reason other than a 404.
    pub async fn delete_cluster<K>(&self, name: &str) -> kube::Result<()>
    where
        K: Resource<DynamicType = (), Scope = ClusterResourceScope> + Clone + DeserializeOwned + Debug,
    {
        let api: Api<K> = Api::all(self.inner.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cached", &self.stores.read().len())
            .field("uncached", &self.uncached.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request, Response};
    use k8s_openapi::api::{apps::v1::Deployment, core::v1::ConfigMap};
    use kube::{
        api::ObjectMeta,
        client::Body,
        runtime::{reflector, watcher},
    };

    fn mock_client() -> (kube::Client, tower_test::mock::Handle<Request<Body>, Response<Body>>) {
        let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        (kube::Client::new(service, "default"), handle)
    }

    fn configmap(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("projectcontour".into()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[test]
    fn gvk_of_core_and_grouped_kinds() {
        assert_eq!(gvk_of::<ConfigMap>(), GroupVersionKind::gvk("", "v1", "ConfigMap"));
        assert_eq!(gvk_of::<Deployment>(), GroupVersionKind::gvk("apps", "v1", "Deployment"));
    }

    #[tokio::test]
    async fn reads_cached_kinds_from_the_store() {
        let (kube, _handle) = mock_client();
        let client = Client::new(kube, []);
        let (reader, mut writer) = reflector::store::<ConfigMap>();
        writer.apply_watcher_event(&watcher::Event::Apply(configmap("envoy")));
        client.register_store(reader);

        let cm = client.get::<ConfigMap>("projectcontour", "envoy").await.unwrap();
        assert_eq!(cm.unwrap().metadata.name.as_deref(), Some("envoy"));
        assert_eq!(client.list::<ConfigMap>().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn excluded_kinds_are_never_cached() {
        let (kube, mut handle) = mock_client();
        let client = Client::new(kube, [gvk_of::<ConfigMap>()]);
        let (reader, mut writer) = reflector::store::<ConfigMap>();
        writer.apply_watcher_event(&watcher::Event::Apply(configmap("stale")));
        client.register_store(reader);

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("live read expected");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/projectcontour/configmaps/stale"
            );
            let body = serde_json::to_vec(&configmap("stale")).unwrap();
            send.send_response(Response::builder().body(Body::from(body)).unwrap());
        });

        let cm = client.get::<ConfigMap>("projectcontour", "stale").await.unwrap();
        assert!(cm.is_some());
        server.await.unwrap();
    }
}
