//! Operator managing Contour from `Contour` custom resources
//!
//! The [`Operator`] resolves the kinds it watches against the cluster, assembles an
//! [`operator_runtime::Manager`] with the contour controller and supervises it:
//!
//! ```no_run
//! use contour_operator::{Config, Operator};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let mut operator = Operator::new(client, &Config::default()).await?;
//! let shutdown = CancellationToken::new();
//! operator.start(shutdown).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod discovery;
mod error;
pub mod operator;

pub use catalog::{managed_resource_types, ResourceDescriptor};
pub use client::ClientFacade;
pub use config::Config;
pub use crd::{Contour, ContourSpec, ContourStatus};
pub use discovery::{ClusterDiscovery, DiscoveryError, Kind, TypeRegistry, TypeResolver};
pub use error::{Error, Result};
pub use operator::{Operator, Phase, Runtime};
