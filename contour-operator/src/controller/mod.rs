//! Controllers of the operator and their registration with the runtime
use operator_runtime::Manager;
use thiserror::Error;
use tracing::info;

use crate::{catalog::ResourceDescriptor, client::ClientFacade};

pub mod contour;
pub mod objects;

/// Settings passed through to the contour controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Image of the contour deployment.
    pub contour_image: String,
    /// Image of the envoy daemonset.
    pub envoy_image: String,
    /// Field manager used for server-side apply.
    pub operator_name: String,
}

/// Errors attaching controllers to the runtime
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The runtime refused the registration.
    #[error("failed to register controller {name:?}: {source}")]
    Attach {
        /// Controller name.
        name: String,
        /// Underlying runtime error.
        #[source]
        source: operator_runtime::Error,
    },

    /// A kind the controller watches was not resolved by discovery.
    #[error("{0} was not resolved by discovery")]
    Unresolved(ResourceDescriptor),
}

/// Names of the controllers a [`Registrar`] attached
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisteredSet {
    /// Controller names in registration order.
    pub controllers: Vec<String>,
}

/// Attaches controllers to a [`Manager`]
pub trait Registrar {
    /// Register every controller with `manager`, sharing `client` with them.
    ///
    /// # Errors
    /// Fails on the first controller the manager refuses.
    fn register(&self, manager: &mut Manager, client: &ClientFacade) -> Result<RegisteredSet, RegistrationError>;
}

/// Registers the contour controller
#[derive(Clone, Debug)]
pub struct ContourRegistrar {
    config: ControllerConfig,
}

impl ContourRegistrar {
    /// Register with `config` passed through to the controller.
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }
}

impl Registrar for ContourRegistrar {
    fn register(&self, manager: &mut Manager, client: &ClientFacade) -> Result<RegisteredSet, RegistrationError> {
        let registration = contour::registration(self.config.clone(), client.clone())?;
        manager
            .add_controller(registration)
            .map_err(|source| RegistrationError::Attach {
                name: contour::CONTROLLER_NAME.into(),
                source,
            })?;
        info!(controller = contour::CONTROLLER_NAME, "registered controller");
        Ok(RegisteredSet {
            controllers: vec![contour::CONTROLLER_NAME.into()],
        })
    }
}
