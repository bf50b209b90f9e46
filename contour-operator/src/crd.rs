//! The `Contour` custom resource
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Desired state of a Contour deployment
///
/// Declared without a generated schema; the CRD manifest is maintained separately.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[kube(
    group = "operator.projectcontour.io",
    version = "v1alpha1",
    kind = "Contour",
    namespaced,
    status = "ContourStatus",
    shortname = "contour",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ContourSpec {
    /// Desired number of contour replicas.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Namespace the contour and envoy workloads run in.
    #[serde(default)]
    pub namespace: NamespaceSpec,

    /// Name of the GatewayClass this contour serves, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_class_ref: Option<String>,

    /// Ingress class contour should process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
}

fn default_replicas() -> i32 {
    2
}

/// Namespace settings of a Contour
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSpec {
    /// Namespace name.
    #[serde(default = "default_namespace")]
    pub name: String,

    /// Delete the namespace when the Contour is deleted.
    #[serde(default)]
    pub remove_on_deletion: bool,
}

fn default_namespace() -> String {
    "projectcontour".into()
}

impl Default for NamespaceSpec {
    fn default() -> Self {
        Self {
            name: default_namespace(),
            remove_on_deletion: false,
        }
    }
}

/// Observed state of a Contour
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContourStatus {
    /// Ready contour replicas.
    #[serde(default)]
    pub available_contours: i32,

    /// Ready envoy pods.
    #[serde(default)]
    pub available_envoys: i32,

    /// Current conditions, `Available` being the one the operator maintains.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn contour_is_a_namespaced_custom_resource() {
        assert_eq!(Contour::group(&()), "operator.projectcontour.io");
        assert_eq!(Contour::version(&()), "v1alpha1");
        assert_eq!(Contour::kind(&()), "Contour");
        assert_eq!(Contour::plural(&()), "contours");
    }

    #[test]
    fn spec_defaults_apply_to_sparse_objects() {
        let contour: Contour = serde_json::from_value(serde_json::json!({
            "apiVersion": "operator.projectcontour.io/v1alpha1",
            "kind": "Contour",
            "metadata": { "name": "contour-sample", "namespace": "default" },
            "spec": {}
        }))
        .unwrap();
        assert_eq!(contour.spec.replicas, 2);
        assert_eq!(contour.spec.namespace.name, "projectcontour");
        assert!(!contour.spec.namespace.remove_on_deletion);
        assert!(contour.spec.gateway_class_ref.is_none());
        assert!(contour.status.is_none());
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = ContourStatus {
            available_contours: 2,
            available_envoys: 1,
            conditions: vec![],
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({ "availableContours": 2, "availableEnvoys": 1 })
        );
    }
}
