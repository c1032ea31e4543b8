//! Strata - CRD-driven Kubernetes operator for control-plane lifecycle management
//!
//! Strata drives a `ControlPlane` resource through its lifecycle and ships the
//! per-member bootstrap protocol that lets the backing etcd cluster seed, grow
//! and shrink itself without an external coordinator.
//!
//! # Architecture
//!
//! - The controller reconciles `ControlPlane` objects: it registers a finalizer,
//!   runs the init planner, and on deletion runs the deinit planner before
//!   releasing the finalizer.
//! - The init planner renders etcd manifests and applies them.
//! - Every etcd pod runs `strata etcd start` (and `strata etcd stop` as its
//!   preStop hook), which joins or leaves the quorum through etcd's own
//!   membership API.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (ControlPlane)
//! - [`controller`] - Lifecycle reconciliation logic
//! - [`planner`] - Ordered install/uninstall task execution
//! - [`template`] - Deterministic manifest rendering
//! - [`bootstrap`] - etcd member bootstrap/scaling protocol
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod bootstrap;
pub mod controller;
pub mod crd;
pub mod error;
pub mod planner;
pub mod telemetry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Field manager name used for server-side apply and patches
pub const FIELD_MANAGER: &str = "strata-controller";

/// Finalizer token owned by the ControlPlane controller
pub const CONTROLLER_FINALIZER: &str = "operator.strata.dev/finalizer";

/// Default etcd client port
pub const DEFAULT_ETCD_CLIENT_PORT: u16 = 2379;

/// Default etcd peer port
pub const DEFAULT_ETCD_PEER_PORT: u16 = 2380;

/// Default cluster DNS domain
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Label selecting every etcd object managed by Strata
pub const LABEL_APP: &str = "strata.dev/app";

/// Label carrying the owning etcd StatefulSet name
pub const LABEL_ETCD: &str = "strata.dev/etcd";

/// Standard managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard managed-by label value
pub const LABEL_MANAGED_BY_STRATA: &str = "strata-operator";
