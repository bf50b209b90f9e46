use contour_operator::{ClusterDiscovery, DiscoveryError, Kind, TypeResolver};
use http::{Request, Response, StatusCode};
use kube::client::Body;
use serde_json::{json, Value};

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

enum Scenario {
    /// Every watched kind is served.
    Served,
    /// The gateway api group version is served without tlsroutes.
    MissingTlsRoutes,
    /// The Contour CRD is not installed.
    MissingCrd,
    /// The api server fails the first discovery request.
    Unavailable,
}

fn resource(name: &str, kind: &str, namespaced: bool) -> Value {
    json!({
        "name": name,
        "singularName": kind.to_lowercase(),
        "namespaced": namespaced,
        "kind": kind,
        "verbs": ["create", "delete", "get", "list", "patch", "update", "watch"]
    })
}

fn resource_list(group_version: &str, resources: Vec<Value>) -> Value {
    json!({
        "kind": "APIResourceList",
        "apiVersion": "v1",
        "groupVersion": group_version,
        "resources": resources
    })
}

fn status(code: u16, reason: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": reason.to_lowercase(),
        "reason": reason,
        "code": code
    })
}

fn gateway_resources(with_tls: bool) -> Value {
    let mut resources = vec![
        resource("gatewayclasses", "GatewayClass", false),
        resource("gatewayclasses/status", "GatewayClass", false),
        resource("gateways", "Gateway", true),
        resource("httproutes", "HTTPRoute", true),
        resource("tcproutes", "TCPRoute", true),
        resource("udproutes", "UDPRoute", true),
    ];
    if with_tls {
        resources.push(resource("tlsroutes", "TLSRoute", true));
    }
    resource_list("networking.x-k8s.io/v1alpha1", resources)
}

fn respond(scenario: &Scenario, path: &str) -> (StatusCode, Value) {
    match (scenario, path) {
        (Scenario::Unavailable, _) => (StatusCode::SERVICE_UNAVAILABLE, status(503, "ServiceUnavailable")),
        (Scenario::MissingTlsRoutes, "/apis/networking.x-k8s.io/v1alpha1") => (StatusCode::OK, gateway_resources(false)),
        (_, "/apis/networking.x-k8s.io/v1alpha1") => (StatusCode::OK, gateway_resources(true)),
        (Scenario::MissingCrd, "/apis/operator.projectcontour.io/v1alpha1") => (StatusCode::NOT_FOUND, status(404, "NotFound")),
        (_, "/apis/operator.projectcontour.io/v1alpha1") => (
            StatusCode::OK,
            resource_list("operator.projectcontour.io/v1alpha1", vec![
                resource("contours", "Contour", true),
                resource("contours/status", "Contour", true),
            ]),
        ),
        (_, other) => panic!("unexpected discovery request {other}"),
    }
}

fn testcontext(scenario: Scenario) -> (ClusterDiscovery, tokio::task::JoinHandle<()>) {
    let (mock_service, mut handle): (_, ApiServerHandle) =
        tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let server = tokio::spawn(async move {
        while let Some((request, send)) = handle.next_request().await {
            assert_eq!(request.method(), http::Method::GET);
            let (code, body) = respond(&scenario, request.uri().path());
            let response = serde_json::to_vec(&body).unwrap();
            send.send_response(Response::builder().status(code).body(Body::from(response)).unwrap());
        }
    });
    let client = kube::Client::new(mock_service, "default");
    (ClusterDiscovery::new(client), server)
}

#[tokio::test]
async fn resolves_every_watched_kind() {
    let (discovery, _server) = testcontext(Scenario::Served);
    let registry = discovery.resolve(&Kind::watch_set()).await.unwrap();

    assert_eq!(registry.len(), 5);
    assert_eq!(registry.kinds().cloned().collect::<Vec<_>>(), Kind::watch_set());
    let routes = registry.get(&Kind::HttpRoute).unwrap();
    assert_eq!(routes.kind, "HTTPRoute");
    assert_eq!(routes.plural, "httproutes");
    assert_eq!(routes.api_version, "networking.x-k8s.io/v1alpha1");
    assert_eq!(registry.gvk(&Kind::Contour).unwrap().group, "operator.projectcontour.io");
}

#[tokio::test]
async fn unsupported_kinds_are_served_but_not_resolved() {
    let (discovery, _server) = testcontext(Scenario::Served);
    let registry = discovery.resolve(&Kind::watch_set()).await.unwrap();
    assert!(registry
        .kinds()
        .all(|kind| !matches!(kind, Kind::Extension(_))));
}

#[tokio::test]
async fn missing_resource_is_unresolved() {
    let (discovery, _server) = testcontext(Scenario::MissingTlsRoutes);
    let err = discovery.resolve(&Kind::watch_set()).await.unwrap_err();
    match err {
        DiscoveryError::Unresolved(descriptor) => assert_eq!(descriptor.resource, "tlsroutes"),
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn missing_crd_is_unresolved() {
    let (discovery, _server) = testcontext(Scenario::MissingCrd);
    let err = discovery.resolve(&Kind::watch_set()).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Unresolved(d) if d.resource == "contours"));
}

#[tokio::test]
async fn unavailable_api_server_is_an_api_error() {
    let (discovery, _server) = testcontext(Scenario::Unavailable);
    let err = discovery.resolve(&Kind::watch_set()).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Api(_)), "{err}");
    assert!(err.to_string().starts_with("api discovery failed"));
}
