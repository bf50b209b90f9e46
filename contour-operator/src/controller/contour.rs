//! Reconciles `Contour` objects into the workloads running contour and envoy
use std::{sync::Arc, time::Duration};

use futures::{future, StreamExt};
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    core::v1::Namespace,
};
use kube::{
    api::{Api, DynamicObject},
    core::ApiResource,
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as Finalizer},
        reflector::{ObjectRef, Store},
        watcher, Controller,
    },
    ResourceExt,
};
use operator_runtime::{controller::owner_from_labels, BoxError, Context, ControllerRegistration};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
    objects::{self, OWNING_CONTOUR_NAME_LABEL, OWNING_CONTOUR_NS_LABEL},
    ControllerConfig, RegistrationError,
};
use crate::{
    catalog::{self, ResourceDescriptor},
    client::ClientFacade,
    crd::Contour,
    discovery::Kind,
};

/// Name the controller registers under.
pub const CONTROLLER_NAME: &str = "contour";
/// Finalizer guarding cleanup of the rendered workloads.
pub const FINALIZER: &str = "contour.operator.projectcontour.io/finalizer";

const REQUEUE: Duration = Duration::from_secs(5 * 60);
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Errors reconciling a single Contour
#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("contour has no namespace")]
    MissingNamespace,

    #[error("failed to apply {kind}: {source}")]
    Apply {
        kind: &'static str,
        #[source]
        source: kube::Error,
    },

    #[error("failed to delete {kind}: {source}")]
    Delete {
        kind: &'static str,
        #[source]
        source: kube::Error,
    },

    #[error("failed to read gateway class: {0}")]
    ReadGatewayClass(#[source] kube::Error),

    #[error("{0} was not resolved by discovery")]
    Unresolved(ResourceDescriptor),

    #[error("failed to serialize status: {0}")]
    SerializeStatus(#[source] serde_json::Error),

    #[error("failed to update status: {0}")]
    UpdateStatus(#[source] kube::Error),

    #[error(transparent)]
    Finalizer(Box<kube::runtime::finalizer::Error<Error>>),
}

struct State {
    client: ClientFacade,
    config: ControllerConfig,
}

/// Registration of the contour controller.
///
/// Every catalog kind must be resolved in the registry of `client`.
pub(crate) fn registration(
    config: ControllerConfig,
    client: ClientFacade,
) -> Result<ControllerRegistration, RegistrationError> {
    let mut gateway_kinds = Vec::new();
    for descriptor in catalog::managed_resource_types() {
        let kind = Kind::from_descriptor(descriptor.clone());
        let ar = client
            .resource(&kind)
            .cloned()
            .ok_or(RegistrationError::Unresolved(descriptor))?;
        gateway_kinds.push((kind, ar));
    }

    let watched: Vec<ApiResource> = gateway_kinds.iter().map(|(_, ar)| ar.clone()).collect();
    let mut registration = ControllerRegistration::new::<Contour, _, _>(CONTROLLER_NAME, move |ctx| {
        run(ctx, config, client, gateway_kinds)
    })
    .owns::<Deployment>()
    .owns::<DaemonSet>();
    for ar in &watched {
        registration = registration.watches_dynamic(ar);
    }
    Ok(registration)
}

async fn run(
    ctx: Context,
    config: ControllerConfig,
    client: ClientFacade,
    gateway_kinds: Vec<(Kind, ApiResource)>,
) -> Result<(), BoxError> {
    let kube = ctx.client().kube().clone();
    let owned = watcher::Config::default().labels(OWNING_CONTOUR_NAME_LABEL);

    // workloads may live outside the contour's namespace, so ownership goes through labels
    let mut controller = Controller::new(Api::<Contour>::all(kube.clone()), watcher::Config::default())
        .watches(Api::<Deployment>::all(kube.clone()), owned.clone(), |deploy| {
            owner_from_labels::<_, Contour>(&deploy, OWNING_CONTOUR_NAME_LABEL, OWNING_CONTOUR_NS_LABEL)
        })
        .watches(Api::<DaemonSet>::all(kube.clone()), owned, |ds| {
            owner_from_labels::<_, Contour>(&ds, OWNING_CONTOUR_NAME_LABEL, OWNING_CONTOUR_NS_LABEL)
        });
    let contours = controller.store();
    ctx.client().register_store(contours.clone());

    for (kind, ar) in gateway_kinds {
        let api = Api::<DynamicObject>::all_with(kube.clone(), &ar);
        let contours = contours.clone();
        controller = controller.watches_with(api, ar, watcher::Config::default(), move |obj| {
            contours_for(&contours, &kind, &obj)
        });
    }

    info!(controller = ctx.name(), "starting controller");
    let metrics = ctx.metrics().clone();
    controller
        .graceful_shutdown_on(ctx.shutdown_signal())
        .run(reconcile, error_policy, Arc::new(State { client, config }))
        .for_each(|res| {
            match res {
                Ok((contour, _)) => {
                    metrics.reconciled();
                    debug!(%contour, "reconciled");
                }
                Err(error) => {
                    metrics.failed();
                    warn!(%error, "reconcile failed");
                }
            }
            future::ready(())
        })
        .await;
    info!(controller = ctx.name(), "controller stopped");
    Ok(())
}

/// Contours affected by a change to a gateway api object.
///
/// A GatewayClass only concerns the contours referencing it by name, any other
/// gateway kind concerns every contour serving a gateway class.
fn contours_for(contours: &Store<Contour>, kind: &Kind, obj: &DynamicObject) -> Vec<ObjectRef<Contour>> {
    contours
        .state()
        .into_iter()
        .filter(|contour| match (&contour.spec.gateway_class_ref, kind) {
            (Some(class), Kind::GatewayClass) => obj.metadata.name.as_deref() == Some(class.as_str()),
            (Some(_), _) => true,
            (None, _) => false,
        })
        .map(|contour| ObjectRef::from_obj(&*contour))
        .collect()
}

async fn reconcile(contour: Arc<Contour>, state: Arc<State>) -> Result<Action, Error> {
    let ns = contour.namespace().ok_or(Error::MissingNamespace)?;
    let api: Api<Contour> = Api::namespaced(state.client.kube().clone(), &ns);
    finalizer(&api, FINALIZER, contour, |event| async {
        match event {
            Finalizer::Apply(contour) => apply(&contour, &state).await,
            Finalizer::Cleanup(contour) => cleanup(&contour, &state).await,
        }
    })
    .await
    .map_err(|err| Error::Finalizer(Box::new(err)))
}

async fn apply(contour: &Contour, state: &State) -> Result<Action, Error> {
    let client = &state.client;
    let manager = &state.config.operator_name;
    let target = &contour.spec.namespace.name;

    client
        .apply_cluster(&objects::namespace(contour), manager)
        .await
        .map_err(|source| Error::Apply { kind: "Namespace", source })?;
    let deployment = client
        .apply(target, &objects::contour_deployment(contour, &state.config.contour_image), manager)
        .await
        .map_err(|source| Error::Apply { kind: "Deployment", source })?;
    let daemonset = client
        .apply(target, &objects::envoy_daemonset(contour, &state.config.envoy_image), manager)
        .await
        .map_err(|source| Error::Apply { kind: "DaemonSet", source })?;

    let class_found = match &contour.spec.gateway_class_ref {
        Some(class) => gateway_class_exists(client, class).await?,
        None => true,
    };
    if !class_found {
        warn!(contour = %contour.name_any(), class = ?contour.spec.gateway_class_ref, "gateway class not found");
    }

    let status = objects::status(contour, &deployment, &daemonset, class_found);
    if contour.status.as_ref() != Some(&status) {
        let ns = contour.namespace().ok_or(Error::MissingNamespace)?;
        let value = serde_json::to_value(&status).map_err(Error::SerializeStatus)?;
        client
            .patch_status::<Contour>(&ns, &contour.name_any(), value)
            .await
            .map_err(Error::UpdateStatus)?;
    }
    Ok(Action::requeue(REQUEUE))
}

async fn gateway_class_exists(client: &ClientFacade, class: &str) -> Result<bool, Error> {
    let ar = client
        .resource(&Kind::GatewayClass)
        .ok_or_else(|| Error::Unresolved(Kind::GatewayClass.descriptor()))?;
    let found = client
        .get_dynamic(ar, None, class)
        .await
        .map_err(Error::ReadGatewayClass)?;
    Ok(found.is_some())
}

async fn cleanup(contour: &Contour, state: &State) -> Result<Action, Error> {
    let client = &state.client;
    let target = &contour.spec.namespace.name;
    client
        .delete::<DaemonSet>(target, objects::ENVOY_DAEMONSET_NAME)
        .await
        .map_err(|source| Error::Delete { kind: "DaemonSet", source })?;
    client
        .delete::<Deployment>(target, objects::CONTOUR_DEPLOYMENT_NAME)
        .await
        .map_err(|source| Error::Delete { kind: "Deployment", source })?;
    if contour.spec.namespace.remove_on_deletion {
        client
            .delete_cluster::<Namespace>(target)
            .await
            .map_err(|source| Error::Delete { kind: "Namespace", source })?;
    }
    info!(contour = %contour.name_any(), "cleaned up");
    Ok(Action::await_change())
}

#[allow(clippy::needless_pass_by_value)]
fn error_policy(contour: Arc<Contour>, error: &Error, _state: Arc<State>) -> Action {
    warn!(contour = %contour.name_any(), %error, "reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{mock_facade, resolved_registry};
    use kube::runtime::reflector;

    fn contour(name: &str, class: Option<&str>) -> Contour {
        let mut contour: Contour = serde_json::from_value(serde_json::json!({
            "apiVersion": "operator.projectcontour.io/v1alpha1",
            "kind": "Contour",
            "metadata": { "name": name, "namespace": "default" },
            "spec": {}
        }))
        .unwrap();
        contour.spec.gateway_class_ref = class.map(String::from);
        contour
    }

    fn gateway_object(ar: &ApiResource, name: &str) -> DynamicObject {
        DynamicObject::new(name, ar)
    }

    #[test]
    fn gateway_changes_map_to_referencing_contours() {
        let (store, mut writer) = reflector::store::<Contour>();
        for c in [
            contour("one", Some("contour")),
            contour("two", Some("other")),
            contour("three", None),
        ] {
            writer.apply_watcher_event(&watcher::Event::Apply(c));
        }
        let registry = resolved_registry();

        let class = gateway_object(registry.get(&Kind::GatewayClass).unwrap(), "contour");
        let hit: Vec<_> = contours_for(&store, &Kind::GatewayClass, &class)
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(hit, ["one"]);

        let route = gateway_object(registry.get(&Kind::HttpRoute).unwrap(), "route");
        let mut hit: Vec<_> = contours_for(&store, &Kind::HttpRoute, &route)
            .into_iter()
            .map(|r| r.name)
            .collect();
        hit.sort();
        assert_eq!(hit, ["one", "two"]);
    }

    #[tokio::test]
    async fn registration_watches_the_catalog() {
        let facade = mock_facade(resolved_registry());
        let config = ControllerConfig {
            contour_image: "contour:test".into(),
            envoy_image: "envoy:test".into(),
            operator_name: "contour_operator".into(),
        };
        let registration = registration(config, facade).unwrap();
        let kinds: Vec<_> = registration.kinds().map(|gvk| gvk.kind.clone()).collect();
        assert_eq!(kinds, [
            "Contour",
            "Deployment",
            "DaemonSet",
            "GatewayClass",
            "Gateway",
            "HTTPRoute",
            "TLSRoute"
        ]);
        assert_eq!(registration.name(), CONTROLLER_NAME);
    }

    #[tokio::test]
    async fn registration_requires_resolved_gateway_kinds() {
        let mut registry = crate::discovery::TypeRegistry::default();
        registry.insert(Kind::Contour, resolved_registry().get(&Kind::Contour).unwrap().clone());
        let facade = mock_facade(registry);
        let config = ControllerConfig {
            contour_image: String::new(),
            envoy_image: String::new(),
            operator_name: String::new(),
        };
        let err = registration(config, facade).unwrap_err();
        assert!(matches!(err, RegistrationError::Unresolved(d) if d.resource == "gatewayclasses"));
    }
}
