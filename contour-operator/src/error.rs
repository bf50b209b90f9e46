use thiserror::Error;

use crate::{controller::RegistrationError, discovery::DiscoveryError};

/// Errors of the operator lifecycle
#[derive(Debug, Error)]
pub enum Error {
    /// Resolving the watched kinds against the cluster failed.
    #[error("failed to create manager/discovery: {0}")]
    Discovery(#[source] DiscoveryError),

    /// The runtime refused its options.
    #[error("failed to create manager: {0}")]
    CreateManager(#[source] operator_runtime::Error),

    /// A controller could not be registered.
    #[error("failed to create contour controller: {0}")]
    CreateController(#[source] RegistrationError),

    /// A kind excluded from caching is not watched by any controller.
    #[error("invalid cache exclusions: {0}")]
    CacheExclusion(#[source] operator_runtime::Error),

    /// The runtime stopped with an error.
    #[error(transparent)]
    Runtime(operator_runtime::Error),

    /// The runtime task ended without reporting a result.
    #[error("operator runtime exited without reporting a result")]
    RuntimeAborted,

    /// `start` was called more than once.
    #[error("operator was already started")]
    AlreadyStarted,
}

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
