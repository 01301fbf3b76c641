//! Extension actuators for the registry cache extension
//!
//! - [`actuator::CacheActuator`] provisions one pull-through cache per
//!   configured upstream inside the shoot and publishes their endpoints
//! - [`mesh::MeshActuator`] owns the control plane side of the mirror mesh
//! - [`controller`] drives either actuator through the Extension lifecycle
//!
//! Shoot objects are shipped as a ManagedResource bundle; cluster access goes
//! through the [`client::ClusterClient`] seam.

#![deny(missing_docs)]

pub mod actuator;
pub mod bundle;
pub mod client;
pub mod controller;
pub mod mesh;
pub mod monitoring;
pub mod registry;
pub mod status;

pub use actuator::{Actuator, ActuatorConfig, CacheActuator};
pub use client::{ClusterClient, KubeClusterClient};
pub use controller::{error_policy, reconcile, Context};
pub use mesh::MeshActuator;
