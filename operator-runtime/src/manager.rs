//! The manager hosting a set of controllers
use std::{net::SocketAddr, sync::Arc};

use kube::core::GroupVersionKind;
use thiserror::Error;
use tokio::{
    sync::watch,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    client::Client,
    controller::{BoxError, Context, ControllerRegistration},
    leader_election::{self, LeaderElector, LeaderState},
    metrics::{self, Metrics},
};

/// Errors of the manager and the controllers it runs
#[derive(Debug, Error)]
pub enum Error {
    /// The metrics bind address does not parse.
    #[error("invalid metrics bind address {0:?}")]
    InvalidMetricsAddress(String),
    /// Leader election settings were invalid or the elector failed.
    #[error("leader election failed: {0}")]
    LeaderElection(#[from] leader_election::Error),
    /// The metrics endpoint failed.
    #[error(transparent)]
    Metrics(#[from] metrics::Error),
    /// A controller was registered without a name.
    #[error("controller name may not be empty")]
    EmptyName,
    /// A controller name was registered twice.
    #[error("controller {0:?} is already registered")]
    DuplicateController(String),
    /// Two controllers declared the same primary kind.
    #[error("controller {name:?} can not watch {kind}: already the primary kind of controller {existing:?}")]
    DuplicateWatch {
        /// Controller being registered.
        name: String,
        /// The contested primary kind.
        kind: String,
        /// Controller that already has `kind` as its primary.
        existing: String,
    },
    /// A kind excluded from caching is not watched by any controller.
    #[error("{0} is excluded from the cache but no controller watches it")]
    UnwatchedCacheExclusion(String),
    /// Another replica took over the lease.
    #[error("leadership lost")]
    LeadershipLost,
    /// A controller stopped although no shutdown was requested.
    #[error("controller {0:?} exited before shutdown was requested")]
    ControllerExited(String),
    /// A controller failed.
    #[error("controller {name:?} failed: {source}")]
    ControllerFailed {
        /// Registered name of the controller.
        name: String,
        /// What the controller failed with.
        #[source]
        source: BoxError,
    },
    /// A task of the manager panicked.
    #[error("manager task panicked: {0}")]
    TaskPanicked(String),
}

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

fn describe(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Settings of a [`Manager`]
#[derive(Clone, Debug, Default)]
pub struct ManagerOptions {
    /// Leader election settings; `None` runs controllers unconditionally.
    pub leader_election: Option<leader_election::ConfigBuilder>,
    /// Address of the metrics endpoint. `"0"` or empty disables it, a leading `:`
    /// binds all interfaces.
    pub metrics_bind_address: String,
    /// Kinds always read from the api server.
    pub uncached: Vec<GroupVersionKind>,
}

/// Owns the shared client, metrics and leader election of a set of controllers
/// and runs them until shutdown.
pub struct Manager {
    client: Client,
    leader_election: Option<leader_election::Config>,
    metrics_addr: Option<SocketAddr>,
    metrics: Arc<Metrics>,
    controllers: Vec<ControllerRegistration>,
}

impl Manager {
    /// Validate `options` and build a manager around `client`.
    ///
    /// # Errors
    /// Fails on an unparsable metrics address or invalid leader election settings.
    pub fn new(client: kube::Client, options: ManagerOptions) -> Result<Self> {
        let metrics_addr = parse_metrics_address(&options.metrics_bind_address)?;
        let leader_election = options
            .leader_election
            .map(leader_election::ConfigBuilder::finish)
            .transpose()?;
        Ok(Self {
            client: Client::new(client, options.uncached),
            leader_election,
            metrics_addr,
            metrics: Arc::new(Metrics::new()?),
            controllers: Vec::new(),
        })
    }

    /// The cache-aware client shared with every controller.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Metrics of this manager.
    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Bound metrics address, if serving metrics.
    #[must_use]
    pub fn metrics_address(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    /// Whether controllers wait for the leader lease.
    #[must_use]
    pub fn leader_election_enabled(&self) -> bool {
        self.leader_election.is_some()
    }

    /// Names of registered controllers, in registration order.
    pub fn controllers(&self) -> impl Iterator<Item = &str> {
        self.controllers.iter().map(ControllerRegistration::name)
    }

    /// Attach a controller.
    ///
    /// # Errors
    /// Fails when the name is empty or taken, or when another controller already
    /// has the same primary kind. Nothing is registered on failure.
    pub fn add_controller(&mut self, registration: ControllerRegistration) -> Result<()> {
        if registration.name().is_empty() {
            return Err(Error::EmptyName);
        }
        if self.controllers.iter().any(|c| c.name() == registration.name()) {
            return Err(Error::DuplicateController(registration.name().to_string()));
        }
        if let Some(existing) = self
            .controllers
            .iter()
            .find(|c| c.primary() == registration.primary())
        {
            return Err(Error::DuplicateWatch {
                name: registration.name().to_string(),
                kind: describe(registration.primary()),
                existing: existing.name().to_string(),
            });
        }
        tracing::debug!(
            controller = registration.name(),
            primary = %describe(registration.primary()),
            "registered controller"
        );
        self.controllers.push(registration);
        Ok(())
    }

    /// Primary kinds re-triggered by changes to objects of kind `child`.
    #[must_use]
    pub fn owners_of(&self, child: &GroupVersionKind) -> Vec<&GroupVersionKind> {
        self.controllers
            .iter()
            .filter(|c| c.owned().contains(child))
            .map(ControllerRegistration::primary)
            .collect()
    }

    /// Check that every kind excluded from the cache is watched by a controller.
    ///
    /// # Errors
    /// [`Error::UnwatchedCacheExclusion`] naming the first unwatched kind.
    pub fn check_cache_exclusions(&self) -> Result<()> {
        let mut uncached: Vec<_> = self.client.uncached().collect();
        uncached.sort_by_key(|gvk| describe(gvk));
        for gvk in uncached {
            if !self.controllers.iter().any(|c| c.kinds().any(|k| k == gvk)) {
                return Err(Error::UnwatchedCacheExclusion(describe(gvk)));
            }
        }
        Ok(())
    }

    /// Run every registered controller until `shutdown` fires.
    ///
    /// With leader election enabled, controllers are only started once this replica
    /// holds the lease, and losing the lease afterwards ends the run with
    /// [`Error::LeadershipLost`]. The first failing task ends the run; the remaining
    /// tasks are aborted.
    ///
    /// # Errors
    /// The first error of any controller, the metrics endpoint or leader election.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let Manager {
            client,
            leader_election,
            metrics_addr,
            metrics,
            controllers,
        } = self;
        let mut tasks = JoinSet::new();

        if let Some(addr) = metrics_addr {
            let (metrics, shutdown) = (metrics.clone(), shutdown.clone());
            tasks.spawn(async move { Ok(metrics::serve(addr, metrics, shutdown).await?) });
        }

        let elector = match leader_election {
            None => None,
            Some(config) => {
                tracing::info!(lease = config.name(), identity = config.identity(), "waiting for leadership");
                let elector = LeaderElector::spawn(config, client.kube().clone());
                let mut state = elector.state();
                let leading = loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break false,
                        acquired = wait_for_leadership(&mut state, true) => break acquired,
                        Some(joined) = tasks.join_next() => {
                            // the metrics endpoint runs on followers too
                            if let Err(err) = task_result(joined) {
                                tasks.shutdown().await;
                                release(elector).await;
                                return Err(err);
                            }
                        }
                    }
                };
                if !leading {
                    let result = if shutdown.is_cancelled() {
                        drain(&mut tasks, &shutdown).await
                    } else {
                        Err(Error::LeadershipLost)
                    };
                    tasks.shutdown().await;
                    release(elector).await;
                    return result;
                }
                tracing::info!("acquired leadership");
                metrics.set_leader(true);
                let (metrics, shutdown) = (metrics.clone(), shutdown.clone());
                tasks.spawn(async move {
                    tokio::select! {
                        () = shutdown.cancelled() => Ok(()),
                        _ = wait_for_leadership(&mut state, false) => {
                            metrics.set_leader(false);
                            Err(Error::LeadershipLost)
                        }
                    }
                });
                Some(elector)
            }
        };

        for registration in controllers {
            let name = registration.name().to_string();
            let ctx = Context::new(
                name.clone(),
                client.clone(),
                shutdown.clone(),
                metrics.controller(&name),
            );
            let shutdown = shutdown.clone();
            let run = registration.run(ctx);
            tasks.spawn(async move {
                tracing::info!(controller = %name, "starting controller");
                run.await.map_err(|source| Error::ControllerFailed {
                    name: name.clone(),
                    source,
                })?;
                if !shutdown.is_cancelled() {
                    return Err(Error::ControllerExited(name));
                }
                tracing::info!(controller = %name, "controller stopped");
                Ok(())
            });
        }

        let result = drain(&mut tasks, &shutdown).await;
        if let Err(err) = &result {
            tracing::error!(error = %err, "manager stopping");
            tasks.shutdown().await;
        }
        if let Some(elector) = elector {
            release(elector).await;
        }
        result
    }
}

/// Wait until every task finished or one of them failed.
async fn drain(tasks: &mut JoinSet<Result<()>>, shutdown: &CancellationToken) -> Result<()> {
    while let Some(joined) = tasks.join_next().await {
        task_result(joined)?;
    }
    // a manager without tasks still runs until asked to stop
    shutdown.cancelled().await;
    Ok(())
}

fn task_result(joined: Result<Result<()>, JoinError>) -> Result<()> {
    joined.unwrap_or_else(|err| Err(Error::TaskPanicked(err.to_string())))
}

/// Resolves `true` once leadership equals `leading`, `false` when the elector is gone.
async fn wait_for_leadership(state: &mut watch::Receiver<LeaderState>, leading: bool) -> bool {
    state.wait_for(|s| s.is_leader() == leading).await.is_ok()
}

async fn release(elector: leader_election::LeaderElectorHandle) {
    if let Err(err) = elector.shutdown().await {
        tracing::warn!(error = %err, "leader elector did not stop cleanly");
    }
}

fn parse_metrics_address(addr: &str) -> Result<Option<SocketAddr>> {
    match addr {
        "" | "0" => Ok(None),
        port if port.starts_with(':') => format!("0.0.0.0{port}")
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidMetricsAddress(addr.to_string())),
        _ => addr
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidMetricsAddress(addr.to_string())),
    }
}
