//! Bootstrapping and supervising the operator runtime
use std::future::Future;

use kube::core::GroupVersionKind;
use operator_runtime::Manager;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    client::ClientFacade,
    config::Config,
    controller::{ContourRegistrar, Registrar},
    discovery::{ClusterDiscovery, Kind, TypeRegistry, TypeResolver},
    error::{Error, Result},
};

/// Kinds always read from the api server rather than a cache.
pub const UNCACHED_KINDS: [Kind; 3] = [Kind::Contour, Kind::GatewayClass, Kind::Gateway];

/// Group/version/kinds of [`UNCACHED_KINDS`] as resolved by discovery.
#[must_use]
pub fn cache_exclusions(registry: &TypeRegistry) -> Vec<GroupVersionKind> {
    UNCACHED_KINDS.iter().filter_map(|kind| registry.gvk(kind)).collect()
}

/// Something that runs controllers until asked to stop
pub trait Runtime: Send + 'static {
    /// Run until `shutdown` is cancelled or a fatal error occurs.
    fn run(
        self,
        shutdown: CancellationToken,
    ) -> impl Future<Output = Result<(), operator_runtime::Error>> + Send + 'static;
}

impl Runtime for Manager {
    fn run(
        self,
        shutdown: CancellationToken,
    ) -> impl Future<Output = Result<(), operator_runtime::Error>> + Send + 'static {
        self.start(shutdown)
    }
}

/// Lifecycle state of an [`Operator`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Bootstrapped, not started.
    Idle,
    /// The runtime is running.
    Running,
    /// Stopped on request or because the runtime finished cleanly.
    StoppedClean,
    /// Stopped because the runtime failed.
    StoppedError,
}

type Completion = oneshot::Receiver<Result<(), operator_runtime::Error>>;

/// A bootstrapped operator, runnable exactly once
pub struct Operator<R = Manager> {
    name: String,
    client: ClientFacade,
    runtime: Option<R>,
    phase: Phase,
    completion: Option<Completion>,
}

impl Operator<Manager> {
    /// Bootstrap against the cluster behind `client`.
    ///
    /// # Errors
    /// See [`Operator::bootstrap`].
    pub async fn new(client: kube::Client, config: &Config) -> Result<Self> {
        let resolver = ClusterDiscovery::new(client.clone());
        let registrar = ContourRegistrar::new(config.controller_config());
        Self::bootstrap(client, config, &resolver, &registrar).await
    }

    /// Resolve the watched kinds, build the manager and register controllers, in that order.
    ///
    /// # Errors
    /// The first failing step is reported; later steps are not attempted.
    pub async fn bootstrap(
        client: kube::Client,
        config: &Config,
        resolver: &impl TypeResolver,
        registrar: &impl Registrar,
    ) -> Result<Self> {
        let span = info_span!("operator", name = %config.operator_name);
        async move {
            let registry = resolver
                .resolve(&Kind::watch_set())
                .await
                .map_err(Error::Discovery)?;
            debug!(kinds = registry.len(), "resolved watched kinds");

            let mut options = config.manager_options();
            options.uncached = cache_exclusions(&registry);
            let mut manager = Manager::new(client, options).map_err(Error::CreateManager)?;

            let client = ClientFacade::new(manager.client().clone(), registry);
            let registered = registrar
                .register(&mut manager, &client)
                .map_err(Error::CreateController)?;
            manager.check_cache_exclusions().map_err(Error::CacheExclusion)?;

            info!(controllers = ?registered.controllers, "operator bootstrapped");
            Ok(Operator::with_runtime(config.operator_name.clone(), client, manager))
        }
        .instrument(span)
        .await
    }
}

impl<R: Runtime> Operator<R> {
    /// Wrap an already assembled runtime.
    pub fn with_runtime(name: impl Into<String>, client: ClientFacade, runtime: R) -> Self {
        Self {
            name: name.into(),
            client,
            runtime: Some(runtime),
            phase: Phase::Idle,
            completion: None,
        }
    }

    /// Name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The client shared with the controllers.
    #[must_use]
    pub fn client(&self) -> &ClientFacade {
        &self.client
    }

    /// Run until `shutdown` is cancelled or the runtime stops.
    ///
    /// The runtime observes the same `shutdown` token. A requested stop returns `Ok(())`
    /// without waiting for the runtime to drain, see [`Operator::wait_for_shutdown`].
    ///
    /// # Errors
    /// Returns the runtime's error unchanged, [`Error::RuntimeAborted`] if it died
    /// without reporting, and [`Error::AlreadyStarted`] on a second call.
    pub async fn start(&mut self, shutdown: CancellationToken) -> Result<()> {
        let Some(runtime) = self.runtime.take() else {
            return Err(Error::AlreadyStarted);
        };
        let span = info_span!("operator", name = %self.name);
        self.phase = Phase::Running;

        let (tx, mut completion) = oneshot::channel();
        let token = shutdown.clone();
        tokio::spawn(
            async move {
                let result = runtime.run(token).await;
                // receiver is gone once the supervisor stopped waiting
                let _ = tx.send(result);
            }
            .instrument(span.clone()),
        );

        async {
            info!("operator started");
            let outcome = tokio::select! {
                () = shutdown.cancelled() => None,
                result = &mut completion => Some(result),
            };
            match outcome {
                None => {
                    info!("stop requested");
                    self.completion = Some(completion);
                    self.phase = Phase::StoppedClean;
                    Ok(())
                }
                Some(Ok(Ok(()))) => {
                    info!("runtime finished");
                    self.phase = Phase::StoppedClean;
                    Ok(())
                }
                Some(Ok(Err(err))) => {
                    warn!(error = %err, "runtime failed");
                    self.phase = Phase::StoppedError;
                    Err(Error::Runtime(err))
                }
                Some(Err(_)) => {
                    warn!("runtime exited without reporting a result");
                    self.phase = Phase::StoppedError;
                    Err(Error::RuntimeAborted)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Wait for the runtime to drain after a requested stop.
    ///
    /// Returns immediately when the runtime's result was already observed by `start`
    /// or the operator was never started.
    ///
    /// # Errors
    /// Reports an error the runtime hit while draining.
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        let Some(completion) = self.completion.take() else {
            return Ok(());
        };
        match completion.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Error::Runtime(err)),
            Err(_) => Err(Error::RuntimeAborted),
        }
    }
}

impl<R> std::fmt::Debug for Operator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}
