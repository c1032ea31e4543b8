//! Custom Resource Definitions for Strata
//!
//! This module contains all CRD definitions used by the Strata operator.

mod control_plane;
mod types;

pub use control_plane::{ControlPlane, ControlPlaneSpec, ControlPlaneStatus};
pub use types::{ControlPlanePhase, EtcdSpec, EtcdStorage, DEFAULT_ETCD_IMAGE};
