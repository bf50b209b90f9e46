//! Lease based leader election for a [`Manager`](crate::Manager).
//!
//! Every replica runs a [`LeaderElector`] polling the same
//! `coordination.k8s.io/v1` `Lease` once per retry period. A replica leads while
//! its identity is the lease holder and it keeps renewing. Writes are plain
//! `create`/`replace` calls, so the resource version carried by the observed
//! lease decides between two replicas racing for it.
//!
//! A stopping leader clears the holder instead of letting the lease run out,
//! which lets the next replica take over on its next poll. Expiry of a foreign
//! lease is judged by how long its resource version stays unchanged on the local
//! clock, never by timestamps written by other replicas.

use std::{future::Future, time::Duration};

use futures::TryFutureExt;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
    chrono::Utc,
};
use kube::{
    api::{Api, PostParams},
    Client, Resource,
};
use rand::Rng;
use thiserror::Error;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{timeout, Instant},
};

/// Upper bound of the random stretch applied to follower polls.
const JITTER_FACTOR: f64 = 1.2;

/// Errors of leader election
#[derive(Debug, Error)]
pub enum Error {
    /// Settings rejected by [`ConfigBuilder::finish`].
    #[error("invalid leader election config: {0}")]
    Config(String),
    /// A lease api call exceeded `api_timeout`.
    #[error("timeout while talking to the lease api")]
    Timeout,
    /// A lease api call failed.
    #[error("lease api call failed: {0}")]
    Client(#[source] kube::Error),
    /// The elector task panicked or was cancelled.
    #[error("leader elector task failed: {0}")]
    Task(String),
}

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Validated leader election settings, built by [`ConfigBuilder::finish`].
#[derive(Clone, Debug)]
pub struct Config(ConfigBuilder);

impl Config {
    /// Name of the lease object.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Identity written into the lease while leading.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.0.identity
    }
}

/// Leader election settings prior to validation.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    /// Name of the lease object.
    pub name: String,
    /// Namespace of the lease object.
    pub namespace: String,
    /// Holder identity of this replica, typically the pod name.
    pub identity: String,
    /// How long a foreign lease may stay unchanged before it is taken over.
    pub lease_duration: Duration,
    /// How long a leader keeps leading while its renewals fail.
    pub renew_deadline: Duration,
    /// Interval between polls, and between renewals while leading.
    pub retry_period: Duration,
    /// Timeout for each call against the lease api.
    pub api_timeout: Duration,
}

impl ConfigBuilder {
    /// Defaults used by controller-runtime based operators: 15s / 10s / 2s.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            api_timeout: Duration::from_secs(5),
        }
    }

    /// Validate the settings.
    ///
    /// # Errors
    /// [`Error::Config`] when:
    /// - `name`, `namespace` or `identity` is empty;
    /// - any duration is below one second;
    /// - `lease_duration` is not greater than `renew_deadline`;
    /// - `renew_deadline` is not greater than `retry_period * 1.2`.
    pub fn finish(self) -> Result<Config> {
        let empty = [
            ("name", &self.name),
            ("namespace", &self.namespace),
            ("identity", &self.identity),
        ]
        .into_iter()
        .find(|(_, value)| value.is_empty());
        if let Some((field, _)) = empty {
            return Err(Error::Config(format!("{field} may not be empty")));
        }
        let short = [
            ("lease_duration", self.lease_duration),
            ("renew_deadline", self.renew_deadline),
            ("retry_period", self.retry_period),
            ("api_timeout", self.api_timeout),
        ]
        .into_iter()
        .find(|(_, value)| value.as_secs() < 1);
        if let Some((field, _)) = short {
            return Err(Error::Config(format!("{field} must be at least 1 second")));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::Config(
                "lease_duration must be greater than renew_deadline".into(),
            ));
        }
        // a leader polls at most retry_period * JITTER_FACTOR apart
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(Error::Config(format!(
                "renew_deadline must be greater than retry_period*{JITTER_FACTOR}"
            )));
        }
        Ok(Config(self))
    }
}

/// Observable leadership of this replica.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaderState {
    /// This replica holds the lease.
    Leading,
    /// Another replica holds the lease.
    Following,
    /// The lease is unknown, vacant, or the task is starting/stopping.
    Standby,
}

impl LeaderState {
    /// Whether this replica currently holds the lease.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leading)
    }
}

/// What one poll of the lease found.
#[derive(Debug)]
enum Observed {
    /// No lease object exists yet.
    Missing,
    /// The lease exists without a holder, e.g. after a leader released it.
    Vacant(Lease),
    /// This replica is the holder.
    Ours(Lease),
    /// Another replica is the holder.
    Foreign { holder: String, lease: Lease },
}

impl Observed {
    fn classify(lease: Option<Lease>, identity: &str) -> Self {
        let Some(lease) = lease else {
            return Self::Missing;
        };
        match lease.spec.as_ref().and_then(|spec| spec.holder_identity.as_deref()) {
            None | Some("") => Self::Vacant(lease),
            Some(holder) if holder == identity => Self::Ours(lease),
            Some(holder) => Self::Foreign {
                holder: holder.to_string(),
                lease,
            },
        }
    }
}

/// Task acquiring, renewing and releasing the lease.
pub struct LeaderElector {
    api: Api<Lease>,
    config: ConfigBuilder,
    state_tx: watch::Sender<LeaderState>,
    shutdown: oneshot::Receiver<()>,
    /// The lease as last written by this replica while leading.
    held: Option<Lease>,
    /// When `held` was last written.
    renewed_at: Option<Instant>,
    /// Resource version of the foreign lease and when it was first seen.
    foreign: Option<(String, Instant)>,
}

impl LeaderElector {
    /// Spawn an elector onto the current runtime.
    #[must_use = "the handle is needed to observe leadership and to release the lease"]
    pub fn spawn(config: Config, client: Client) -> LeaderElectorHandle {
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let elector = LeaderElector {
            api: Api::namespaced(client, &config.0.namespace),
            config: config.0,
            state_tx,
            shutdown: shutdown_rx,
            held: None,
            renewed_at: None,
            foreign: None,
        };
        LeaderElectorHandle {
            shutdown: shutdown_tx,
            state: state_rx,
            handle: tokio::spawn(elector.run()),
        }
    }

    async fn run(mut self) {
        tracing::info!(lease = %self.config.name, identity = %self.config.identity, "leader elector started");
        loop {
            let wait = match self.poll().await {
                Ok(wait) => wait,
                Err(err) => {
                    tracing::warn!(error = %err, "lease poll failed");
                    self.poll_failed();
                    self.config.retry_period
                }
            };
            tokio::select! {
                _ = &mut self.shutdown => break,
                () = tokio::time::sleep(wait) => {}
            }
        }

        let leading = self.state_tx.borrow().is_leader();
        if leading {
            match self.release().await {
                Ok(()) => tracing::info!(lease = %self.config.name, "released lease"),
                Err(err) => tracing::warn!(error = %err, "failed to release lease"),
            }
        }
        self.publish(LeaderState::Standby);
        tracing::info!("leader elector stopped");
    }

    /// Read the lease and act on it. Returns the delay until the next poll.
    async fn poll(&mut self) -> Result<Duration> {
        let name = self.config.name.clone();
        let current = self.call(self.api.get_opt(&name)).await?;
        match Observed::classify(current, &self.config.identity) {
            Observed::Missing => {
                let lease = self.claim(Lease::default());
                let created = self.call(self.api.create(&PostParams::default(), &lease)).await?;
                self.lead(created, true);
            }
            Observed::Vacant(lease) => {
                let claimed = self.claim(lease);
                let replaced = self.call(self.api.replace(&name, &PostParams::default(), &claimed)).await?;
                self.lead(replaced, true);
            }
            Observed::Ours(lease) => {
                let renewed = self.renew(lease);
                let replaced = self.call(self.api.replace(&name, &PostParams::default(), &renewed)).await?;
                self.lead(replaced, false);
            }
            Observed::Foreign { holder, lease } => {
                if self.foreign_expired(&lease) {
                    tracing::info!(%holder, "lease expired, taking over");
                    let claimed = self.claim(lease);
                    let replaced = self.call(self.api.replace(&name, &PostParams::default(), &claimed)).await?;
                    self.lead(replaced, true);
                } else {
                    tracing::debug!(%holder, "following");
                    self.held = None;
                    self.renewed_at = None;
                    self.publish(LeaderState::Following);
                    let jitter = rand::rng().random_range(1.0..JITTER_FACTOR);
                    return Ok(self.config.retry_period.mul_f64(jitter));
                }
            }
        }
        Ok(self.config.retry_period)
    }

    /// A leader keeps leading through failed renewals until `renew_deadline`.
    fn poll_failed(&mut self) {
        let Some(renewed_at) = self.renewed_at else {
            return;
        };
        if renewed_at + self.config.renew_deadline <= Instant::now() {
            tracing::warn!(lease = %self.config.name, "renew deadline exceeded");
            self.held = None;
            self.renewed_at = None;
            self.publish(LeaderState::Standby);
        }
    }

    fn lead(&mut self, lease: Lease, acquired: bool) {
        if acquired {
            tracing::info!(lease = %self.config.name, identity = %self.config.identity, "acquired lease");
        }
        self.held = Some(lease);
        self.renewed_at = Some(Instant::now());
        self.foreign = None;
        self.publish(LeaderState::Leading);
    }

    fn foreign_expired(&mut self, lease: &Lease) -> bool {
        let version = lease.metadata.resource_version.clone().unwrap_or_default();
        let duration = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.lease_duration_seconds)
            .and_then(|secs| u64::try_from(secs).ok())
            .filter(|secs| *secs > 0)
            .map_or(self.config.lease_duration, Duration::from_secs);
        match &self.foreign {
            Some((seen, since)) if *seen == version => *since + duration <= Instant::now(),
            _ => {
                self.foreign = Some((version, Instant::now()));
                false
            }
        }
    }

    /// `lease` with this replica as a freshly acquired holder.
    fn claim(&self, mut lease: Lease) -> Lease {
        let now = MicroTime(Utc::now());
        let meta = lease.meta_mut();
        meta.name.get_or_insert_with(|| self.config.name.clone());
        meta.namespace.get_or_insert_with(|| self.config.namespace.clone());
        meta.managed_fields = None;
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec.holder_identity = Some(self.config.identity.clone());
        spec.acquire_time = Some(now.clone());
        spec.renew_time = Some(now);
        spec.lease_duration_seconds = Some(self.lease_seconds());
        spec.lease_transitions = Some(spec.lease_transitions.map_or(0, |n| n + 1));
        lease
    }

    fn renew(&self, mut lease: Lease) -> Lease {
        lease.metadata.managed_fields = None;
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec.renew_time = Some(MicroTime(Utc::now()));
        spec.lease_duration_seconds = Some(self.lease_seconds());
        lease
    }

    /// Clear the holder of the lease last written, so the next replica takes over
    /// without waiting for expiry.
    async fn release(&mut self) -> Result<()> {
        let Some(mut lease) = self.held.take() else {
            return Ok(());
        };
        lease.metadata.managed_fields = None;
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.acquire_time = None;
            spec.renew_time = None;
        }
        let name = self.config.name.clone();
        // rejected with a conflict if another replica already took the lease
        self.call(self.api.replace(&name, &PostParams::default(), &lease)).await?;
        Ok(())
    }

    async fn call<T>(&self, request: impl Future<Output = kube::Result<T>>) -> Result<T> {
        timeout(self.config.api_timeout, request)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::Client)
    }

    fn lease_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn publish(&self, next: LeaderState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::info!(from = ?current, to = ?next, "leadership changed");
            *current = next;
            true
        });
    }
}

/// Handle to a spawned [`LeaderElector`].
pub struct LeaderElectorHandle {
    shutdown: oneshot::Sender<()>,
    state: watch::Receiver<LeaderState>,
    handle: JoinHandle<()>,
}

impl LeaderElectorHandle {
    /// Receiver over the observed leadership.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LeaderState> {
        self.state.clone()
    }

    /// Stop the elector, releasing the lease if held, and wait for the task.
    pub fn shutdown(self) -> impl Future<Output = Result<()>> {
        let _ = self.shutdown.send(());
        self.handle.map_err(|err| Error::Task(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::LeaseServer;

    fn builder() -> ConfigBuilder {
        ConfigBuilder::new("0d879e31.projectcontour.io", "contour-operator", "replica-a")
    }

    async fn wait_for(state: &mut watch::Receiver<LeaderState>, want: LeaderState) {
        tokio::time::timeout(Duration::from_secs(120), state.wait_for(|s| *s == want))
            .await
            .unwrap_or_else(|_| panic!("never reached {want:?}"))
            .unwrap();
    }

    #[test]
    fn defaults_are_valid() {
        let config = builder().finish().unwrap();
        assert_eq!(config.name(), "0d879e31.projectcontour.io");
        assert_eq!(config.identity(), "replica-a");
    }

    #[test]
    fn rejects_empty_identity() {
        let mut b = builder();
        b.identity = String::new();
        let err = b.finish().unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg == "identity may not be empty"));
    }

    #[test]
    fn rejects_lease_shorter_than_renew_deadline() {
        let mut b = builder();
        b.lease_duration = Duration::from_secs(10);
        assert!(matches!(b.finish(), Err(Error::Config(msg)) if msg.starts_with("lease_duration")));
    }

    #[test]
    fn rejects_renew_deadline_within_retry_jitter() {
        let mut b = builder();
        b.retry_period = Duration::from_secs(9);
        assert!(matches!(b.finish(), Err(Error::Config(msg)) if msg.starts_with("renew_deadline")));
    }

    #[test]
    fn rejects_sub_second_api_timeout() {
        let mut b = builder();
        b.api_timeout = Duration::from_millis(500);
        assert!(matches!(b.finish(), Err(Error::Config(msg)) if msg.starts_with("api_timeout")));
    }

    #[test]
    fn leader_state_reports_leadership() {
        assert!(LeaderState::Leading.is_leader());
        assert!(!LeaderState::Following.is_leader());
        assert!(!LeaderState::Standby.is_leader());
    }

    #[test]
    fn classifies_observed_leases() {
        assert!(matches!(Observed::classify(None, "me"), Observed::Missing));
        assert!(matches!(
            Observed::classify(Some(LeaseServer::lease("lease", None, 3)), "me"),
            Observed::Vacant(_)
        ));
        assert!(matches!(
            Observed::classify(Some(LeaseServer::lease("lease", Some(""), 3)), "me"),
            Observed::Vacant(_)
        ));
        assert!(matches!(
            Observed::classify(Some(LeaseServer::lease("lease", Some("me"), 3)), "me"),
            Observed::Ours(_)
        ));
        assert!(matches!(
            Observed::classify(Some(LeaseServer::lease("lease", Some("other"), 3)), "me"),
            Observed::Foreign { holder, .. } if holder == "other"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn creates_missing_lease() {
        let server = LeaseServer::start(None);
        let elector = LeaderElector::spawn(builder().finish().unwrap(), server.client());
        wait_for(&mut elector.state(), LeaderState::Leading).await;

        let lease = server.current().unwrap();
        let spec = lease.spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("replica-a"));
        assert_eq!(spec.lease_duration_seconds, Some(15));
        assert_eq!(server.creates(), 1);
        elector.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reacquires_released_lease() {
        let server = LeaseServer::start(Some(LeaseServer::lease("0d879e31.projectcontour.io", None, 7)));
        let elector = LeaderElector::spawn(builder().finish().unwrap(), server.client());
        wait_for(&mut elector.state(), LeaderState::Leading).await;

        assert_eq!(server.creates(), 0);
        let lease = server.current().unwrap();
        assert_eq!(lease.spec.unwrap().holder_identity.as_deref(), Some("replica-a"));
        elector.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_lease_for_the_next_replica() {
        let server = LeaseServer::start(None);
        let first = LeaderElector::spawn(builder().finish().unwrap(), server.client());
        wait_for(&mut first.state(), LeaderState::Leading).await;

        let mut b = builder();
        b.identity = "replica-b".into();
        let second = LeaderElector::spawn(b.finish().unwrap(), server.client());
        wait_for(&mut second.state(), LeaderState::Following).await;

        first.shutdown().await.unwrap();
        let released = server.current().unwrap();
        assert_eq!(released.spec.unwrap().holder_identity, None);

        // well before the 15s lease duration would let it expire
        let started = Instant::now();
        wait_for(&mut second.state(), LeaderState::Leading).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(server.holder().as_deref(), Some("replica-b"));
        second.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn takes_over_lease_that_stopped_changing() {
        let server = LeaseServer::start(Some(LeaseServer::lease(
            "0d879e31.projectcontour.io",
            Some("crashed"),
            4,
        )));
        let elector = LeaderElector::spawn(builder().finish().unwrap(), server.client());
        let mut state = elector.state();
        wait_for(&mut state, LeaderState::Following).await;

        let started = Instant::now();
        wait_for(&mut state, LeaderState::Leading).await;
        assert!(started.elapsed() >= Duration::from_secs(13));
        assert_eq!(server.holder().as_deref(), Some("replica-a"));
        elector.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn follows_when_lease_is_taken() {
        let server = LeaseServer::start(None);
        let elector = LeaderElector::spawn(builder().finish().unwrap(), server.client());
        let mut state = elector.state();
        wait_for(&mut state, LeaderState::Leading).await;

        server.take_over("replica-b");
        wait_for(&mut state, LeaderState::Following).await;
        elector.shutdown().await.unwrap();
        // not ours anymore, so not released
        assert_eq!(server.holder().as_deref(), Some("replica-b"));
    }
}
