//! Controller implementations for Strata CRDs
//!
//! Controllers follow the Kubernetes controller pattern with observe-diff-act
//! loops driven by `kube::runtime::Controller`.

mod control_plane;

pub use control_plane::{
    error_policy, reconcile, Context, ContextBuilder, ControlPlaneClient, KubeControlPlaneClient,
    DEFAULT_BOOTSTRAP_IMAGE,
};
