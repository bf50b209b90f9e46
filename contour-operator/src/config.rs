//! Command line and environment configuration
use std::time::Duration;

use clap::Parser;
use operator_runtime::{leader_election, ManagerOptions};

use crate::controller::ControllerConfig;

/// Image the contour deployment runs by default.
pub const DEFAULT_CONTOUR_IMAGE: &str = "docker.io/projectcontour/contour:main";
/// Image the envoy daemonset runs by default.
pub const DEFAULT_ENVOY_IMAGE: &str = "docker.io/envoyproxy/envoy:v1.19.1";
/// Address the metrics endpoint binds to by default.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";
/// Name of the Lease used for leader election.
pub const DEFAULT_LEADER_ELECTION_ID: &str = "0d879e31.projectcontour.io";
/// Namespace holding the leader election Lease.
pub const DEFAULT_LEADER_ELECTION_NAMESPACE: &str = "contour-operator";
/// Name the operator identifies itself with.
pub const DEFAULT_OPERATOR_NAME: &str = "contour_operator";

/// Operator configuration
#[derive(Parser, Clone, Debug, PartialEq, Eq)]
#[command(name = "contour-operator", version, about = "Manages Contour deployments from Contour custom resources")]
pub struct Config {
    /// Contour container image.
    #[arg(long, env = "CONTOUR_IMAGE", default_value = DEFAULT_CONTOUR_IMAGE)]
    pub contour_image: String,

    /// Envoy container image.
    #[arg(long, env = "ENVOY_IMAGE", default_value = DEFAULT_ENVOY_IMAGE)]
    pub envoy_image: String,

    /// Address the metrics endpoint binds to, "0" disables it.
    #[arg(long = "metrics-addr", env = "METRICS_ADDR", default_value = DEFAULT_METRICS_ADDR)]
    pub metrics_bind_address: String,

    /// Run only while holding the leader election lease.
    #[arg(long = "enable-leader-election", env = "ENABLE_LEADER_ELECTION")]
    pub leader_election: bool,

    /// Name of the leader election lease.
    #[arg(long, default_value = DEFAULT_LEADER_ELECTION_ID)]
    pub leader_election_id: String,

    /// Namespace of the leader election lease.
    #[arg(long, env = "POD_NAMESPACE", default_value = DEFAULT_LEADER_ELECTION_NAMESPACE)]
    pub leader_election_namespace: String,

    /// Identity held in the lease, defaults to the host name.
    #[arg(long, env = "POD_NAME")]
    pub leader_election_identity: Option<String>,

    /// Name used for logging and as the server-side apply field manager.
    #[arg(long, default_value = DEFAULT_OPERATOR_NAME)]
    pub operator_name: String,

    /// Seconds to wait for controllers to drain after a stop was requested.
    #[arg(long = "shutdown-timeout", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Log as json lines.
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            contour_image: DEFAULT_CONTOUR_IMAGE.into(),
            envoy_image: DEFAULT_ENVOY_IMAGE.into(),
            metrics_bind_address: DEFAULT_METRICS_ADDR.into(),
            leader_election: false,
            leader_election_id: DEFAULT_LEADER_ELECTION_ID.into(),
            leader_election_namespace: DEFAULT_LEADER_ELECTION_NAMESPACE.into(),
            leader_election_identity: None,
            operator_name: DEFAULT_OPERATOR_NAME.into(),
            shutdown_timeout_secs: 30,
            log_json: false,
        }
    }
}

impl Config {
    /// How long to wait for controllers to drain.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Identity used in the leader election lease.
    #[must_use]
    pub fn identity(&self) -> String {
        self.identity_or(std::env::var("HOSTNAME").ok())
    }

    /// First non-empty of the configured identity and `hostname`, else `<operator-name>-<pid>`.
    fn identity_or(&self, hostname: Option<String>) -> String {
        [self.leader_election_identity.clone(), hostname]
            .into_iter()
            .flatten()
            .find(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}-{}", self.operator_name, std::process::id()))
    }

    /// Options for the runtime manager.
    ///
    /// The cache exclusions are filled in by the operator once discovery resolved them.
    #[must_use]
    pub fn manager_options(&self) -> ManagerOptions {
        let leader_election = self.leader_election.then(|| {
            leader_election::ConfigBuilder::new(
                &self.leader_election_id,
                &self.leader_election_namespace,
                self.identity(),
            )
        });
        ManagerOptions {
            leader_election,
            metrics_bind_address: self.metrics_bind_address.clone(),
            uncached: Vec::new(),
        }
    }

    /// Settings handed to the contour controller.
    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            contour_image: self.contour_image.clone(),
            envoy_image: self.envoy_image.clone(),
            operator_name: self.operator_name.clone(),
        }
    }
}
