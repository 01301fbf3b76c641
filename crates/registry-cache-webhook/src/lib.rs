//! Node configuration ensurers and shoot admission validation
//!
//! The ensurers mutate the in-memory node configuration (files, units, CRI
//! settings) handed to them by the node provisioning webhook; the validators
//! check a shoot's extension configuration before it is admitted. Neither
//! carries any HTTP transport.

#![deny(missing_docs)]

pub mod admission;
pub mod mesh;
pub mod pull_through;
pub mod reader;

pub use mesh::{MeshEnsurer, MeshEnsurerConfig};
pub use pull_through::PullThroughEnsurer;
pub use reader::{ExtensionReader, KubeExtensionReader};
