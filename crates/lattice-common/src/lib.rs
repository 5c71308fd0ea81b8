//! Common types for Lattice federation: errors, audit, configuration and utilities

#![deny(missing_docs)]

pub mod audit;
pub mod config;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use config::{DetachPolicy, FederationConfig};
pub use error::{Error, ErrorKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Controller name reported on federation Kubernetes events
pub const FEDERATION_CONTROLLER_NAME: &str = "lattice-federation-controller";

/// Namespace for Lattice system resources (audit events land here)
pub const LATTICE_SYSTEM_NAMESPACE: &str = "lattice-system";
