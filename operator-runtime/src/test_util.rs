//! In-memory lease api served through a mocked kube client
use std::sync::Arc;

use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use kube::{api::ObjectMeta, client::Body};
use parking_lot::Mutex;
use serde_json::{json, Value};

struct Store {
    lease: Option<Lease>,
    version: u64,
    creates: usize,
}

impl Store {
    fn bump(&mut self, mut lease: Lease) -> Lease {
        self.version += 1;
        lease.metadata.resource_version = Some(self.version.to_string());
        self.lease = Some(lease.clone());
        lease
    }

    fn handle(&mut self, method: &Method, path: &str, body: &[u8]) -> (StatusCode, Value) {
        match (method.as_str(), path.ends_with("/leases")) {
            ("POST", true) => {
                if self.lease.is_some() {
                    return status(StatusCode::CONFLICT, "AlreadyExists");
                }
                self.creates += 1;
                let lease = self.bump(serde_json::from_slice(body).unwrap());
                (StatusCode::CREATED, serde_json::to_value(lease).unwrap())
            }
            ("GET", false) => match &self.lease {
                Some(lease) => (StatusCode::OK, serde_json::to_value(lease).unwrap()),
                None => status(StatusCode::NOT_FOUND, "NotFound"),
            },
            ("PUT", false) => {
                let lease: Lease = serde_json::from_slice(body).unwrap();
                let Some(stored) = &self.lease else {
                    return status(StatusCode::NOT_FOUND, "NotFound");
                };
                if lease.metadata.resource_version != stored.metadata.resource_version {
                    return status(StatusCode::CONFLICT, "Conflict");
                }
                let lease = self.bump(lease);
                (StatusCode::OK, serde_json::to_value(lease).unwrap())
            }
            _ => panic!("unexpected lease request {method} {path}"),
        }
    }
}

fn status(code: StatusCode, reason: &str) -> (StatusCode, Value) {
    let body = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": reason.to_lowercase(),
        "reason": reason,
        "code": code.as_u16()
    });
    (code, body)
}

/// Serves GET, POST and PUT of a single lease, checking resource versions on PUT
/// the way the api server does.
#[derive(Clone)]
pub(crate) struct LeaseServer {
    store: Arc<Mutex<Store>>,
    client: kube::Client,
}

impl LeaseServer {
    pub(crate) fn start(initial: Option<Lease>) -> Self {
        let version = initial
            .as_ref()
            .and_then(|lease| lease.metadata.resource_version.as_deref())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let store = Arc::new(Mutex::new(Store {
            lease: initial,
            version,
            creates: 0,
        }));

        let (service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let shared = store.clone();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                let (parts, body) = request.into_parts();
                let body = body.collect().await.unwrap().to_bytes();
                let (code, value) = shared.lock().handle(&parts.method, parts.uri.path(), &body);
                let response = serde_json::to_vec(&value).unwrap();
                send.send_response(Response::builder().status(code).body(Body::from(response)).unwrap());
            }
        });
        Self {
            store,
            client: kube::Client::new(service, "default"),
        }
    }

    pub(crate) fn lease(name: &str, holder: Option<&str>, version: u64) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("contour-operator".into()),
                resource_version: Some(version.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(Into::into),
                lease_duration_seconds: Some(15),
                ..LeaseSpec::default()
            }),
        }
    }

    pub(crate) fn client(&self) -> kube::Client {
        self.client.clone()
    }

    pub(crate) fn current(&self) -> Option<Lease> {
        self.store.lock().lease.clone()
    }

    pub(crate) fn holder(&self) -> Option<String> {
        self.current()
            .and_then(|lease| lease.spec)
            .and_then(|spec| spec.holder_identity)
    }

    pub(crate) fn creates(&self) -> usize {
        self.store.lock().creates
    }

    /// Hand the lease to `identity`, as another replica would.
    pub(crate) fn take_over(&self, identity: &str) {
        let mut store = self.store.lock();
        let mut lease = store.lease.clone().unwrap_or_default();
        lease.spec.get_or_insert_with(LeaseSpec::default).holder_identity = Some(identity.into());
        store.bump(lease);
    }

    /// Clear the holder, as a stopping leader does.
    pub(crate) fn vacate(&self) {
        let mut store = self.store.lock();
        if let Some(mut lease) = store.lease.clone() {
            if let Some(spec) = lease.spec.as_mut() {
                spec.holder_identity = None;
            }
            store.bump(lease);
        }
    }
}
