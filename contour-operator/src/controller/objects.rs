//! Objects the contour controller renders for a Contour
use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec},
        core::v1::{Container, ContainerPort, Namespace, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time},
    chrono::Utc,
};
use kube::{api::ObjectMeta, ResourceExt};

use crate::crd::{Contour, ContourStatus};

/// Label naming the Contour that owns an object.
pub const OWNING_CONTOUR_NAME_LABEL: &str = "contour.operator.projectcontour.io/owning-contour-name";
/// Label naming the namespace of the Contour that owns an object.
pub const OWNING_CONTOUR_NS_LABEL: &str = "contour.operator.projectcontour.io/owning-contour-namespace";

/// Name of the contour deployment.
pub const CONTOUR_DEPLOYMENT_NAME: &str = "contour";
/// Name of the envoy daemonset.
pub const ENVOY_DAEMONSET_NAME: &str = "envoy";

/// Type of the condition the operator maintains on a Contour.
pub const AVAILABLE_CONDITION: &str = "Available";

const APP_LABEL: &str = "app.kubernetes.io/name";
const XDS_PORT: i32 = 8001;

/// Labels marking an object as owned by `contour`.
pub fn owning_labels(contour: &Contour) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNING_CONTOUR_NAME_LABEL.to_string(), contour.name_any()),
        (
            OWNING_CONTOUR_NS_LABEL.to_string(),
            contour.namespace().unwrap_or_default(),
        ),
    ])
}

fn meta(name: &str, contour: &Contour, app: Option<&str>) -> ObjectMeta {
    let mut labels = owning_labels(contour);
    if let Some(app) = app {
        labels.insert(APP_LABEL.into(), app.into());
    }
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(contour.spec.namespace.name.clone()),
        labels: Some(labels),
        ..ObjectMeta::default()
    }
}

fn selector(contour: &Contour, app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), app.to_string()),
        (OWNING_CONTOUR_NAME_LABEL.to_string(), contour.name_any()),
    ])
}

/// The namespace the workloads of `contour` run in.
pub fn namespace(contour: &Contour) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            namespace: None,
            ..meta(&contour.spec.namespace.name, contour, None)
        },
        ..Namespace::default()
    }
}

/// The contour control plane deployment.
pub fn contour_deployment(contour: &Contour, image: &str) -> Deployment {
    let mut args = vec![
        "serve".to_string(),
        "--incluster".to_string(),
        "--xds-address=0.0.0.0".to_string(),
        format!("--xds-port={XDS_PORT}"),
    ];
    if let Some(class) = &contour.spec.ingress_class_name {
        args.push(format!("--ingress-class-name={class}"));
    }
    let labels = selector(contour, CONTOUR_DEPLOYMENT_NAME);
    Deployment {
        metadata: meta(CONTOUR_DEPLOYMENT_NAME, contour, Some(CONTOUR_DEPLOYMENT_NAME)),
        spec: Some(DeploymentSpec {
            replicas: Some(contour.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTOUR_DEPLOYMENT_NAME.into(),
                        image: Some(image.into()),
                        command: Some(vec!["contour".into()]),
                        args: Some(args),
                        ports: Some(vec![ContainerPort {
                            name: Some("xds".into()),
                            container_port: XDS_PORT,
                            ..ContainerPort::default()
                        }]),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// The envoy data plane daemonset.
pub fn envoy_daemonset(contour: &Contour, image: &str) -> DaemonSet {
    let labels = selector(contour, ENVOY_DAEMONSET_NAME);
    DaemonSet {
        metadata: meta(ENVOY_DAEMONSET_NAME, contour, Some(ENVOY_DAEMONSET_NAME)),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: ENVOY_DAEMONSET_NAME.into(),
                        image: Some(image.into()),
                        command: Some(vec!["envoy".into()]),
                        args: Some(vec![
                            "-c".into(),
                            "/config/envoy.json".into(),
                            "--log-level".into(),
                            "info".into(),
                        ]),
                        ports: Some(vec![
                            ContainerPort {
                                name: Some("http".into()),
                                container_port: 8080,
                                host_port: Some(80),
                                ..ContainerPort::default()
                            },
                            ContainerPort {
                                name: Some("https".into()),
                                container_port: 8443,
                                host_port: Some(443),
                                ..ContainerPort::default()
                            },
                        ]),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DaemonSetSpec::default()
        }),
        ..DaemonSet::default()
    }
}

/// Why a Contour is or is not available
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Availability {
    /// Both contour and envoy have ready pods.
    Available,
    /// Some workload has no ready pods yet.
    Unavailable,
    /// The referenced GatewayClass does not exist.
    GatewayClassNotFound,
}

impl Availability {
    fn reason(self) -> &'static str {
        match self {
            Availability::Available => "ContourAvailable",
            Availability::Unavailable => "ContourUnavailable",
            Availability::GatewayClassNotFound => "GatewayClassNotFound",
        }
    }

    fn message(self) -> &'static str {
        match self {
            Availability::Available => "Contour has minimum availability.",
            Availability::Unavailable => "Contour or Envoy does not have minimum availability.",
            Availability::GatewayClassNotFound => "The referenced GatewayClass does not exist.",
        }
    }
}

/// Compute the status of `contour` from its observed workloads.
///
/// The transition time of the `Available` condition only moves when its status changes.
pub fn status(contour: &Contour, deployment: &Deployment, daemonset: &DaemonSet, class_found: bool) -> ContourStatus {
    let available_contours = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    let available_envoys = daemonset
        .status
        .as_ref()
        .and_then(|s| s.number_available)
        .unwrap_or(0);
    let availability = if !class_found {
        Availability::GatewayClassNotFound
    } else if available_contours > 0 && available_envoys > 0 {
        Availability::Available
    } else {
        Availability::Unavailable
    };

    let previous = contour.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default();
    let mut conditions: Vec<Condition> = previous
        .iter()
        .filter(|c| c.type_ != AVAILABLE_CONDITION)
        .cloned()
        .collect();
    conditions.push(available_condition(previous, availability, contour.metadata.generation));

    ContourStatus {
        available_contours,
        available_envoys,
        conditions,
    }
}

fn available_condition(previous: &[Condition], availability: Availability, generation: Option<i64>) -> Condition {
    let status = if availability == Availability::Available { "True" } else { "False" };
    let last_transition_time = previous
        .iter()
        .find(|c| c.type_ == AVAILABLE_CONDITION && c.status == status)
        .map_or_else(|| Time(Utc::now()), |c| c.last_transition_time.clone());
    Condition {
        type_: AVAILABLE_CONDITION.into(),
        status: status.into(),
        reason: availability.reason().into(),
        message: availability.message().into(),
        observed_generation: generation,
        last_transition_time,
    }
}
