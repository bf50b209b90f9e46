//! Runtime hosting kubernetes controllers inside one operator process
//!
//! A [`Manager`] owns what its controllers share: a cache-aware [`Client`],
//! leader election and a metrics endpoint. Controllers are attached as
//! [`ControllerRegistration`]s declaring the kinds they watch, which lets the
//! manager reject conflicting watch sets before anything runs.
//!
//! Controllers themselves are built with [`kube::runtime::Controller`] inside the
//! registration closure and receive a [`Context`] once the manager starts.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod controller;
pub mod leader_election;
pub mod manager;
pub mod metrics;

#[cfg(test)]
mod test_util;

pub use client::Client;
pub use controller::{BoxError, Context, ControllerRegistration};
pub use leader_election::{LeaderElector, LeaderState};
pub use manager::{Error, Manager, ManagerOptions};
pub use metrics::Metrics;
