//! ControlPlane Custom Resource Definition
//!
//! A ControlPlane describes one control-plane deployment and its backing etcd
//! cluster. The controller owns `status.phase` and the controller finalizer.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ControlPlanePhase, EtcdSpec};
use crate::{CONTROLLER_FINALIZER, DEFAULT_CLUSTER_DOMAIN};

/// Specification for a ControlPlane
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.strata.dev",
    version = "v1alpha1",
    kind = "ControlPlane",
    plural = "controlplanes",
    shortname = "cp",
    status = "ControlPlaneStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Etcd","type":"integer","jsonPath":".spec.etcd.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Backing etcd cluster
    #[serde(default)]
    pub etcd: EtcdSpec,

    /// Cluster DNS domain used to build member addresses
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,
}

impl ControlPlaneSpec {
    /// Validate the control plane specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.cluster_domain.is_empty() {
            return Err(crate::Error::validation("clusterDomain must not be empty"));
        }
        self.etcd.validate()
    }
}

fn default_cluster_domain() -> String {
    DEFAULT_CLUSTER_DOMAIN.to_string()
}

/// Status for a ControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    /// Current lifecycle phase; unset until the controller registers the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ControlPlanePhase>,
}

impl ControlPlaneStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ControlPlanePhase) -> Self {
        Self { phase: Some(phase) }
    }
}

impl ControlPlane {
    /// Current phase, if the controller has set one
    pub fn phase(&self) -> Option<ControlPlanePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Returns true if deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns true if the controller finalizer is present
    pub fn has_controller_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CONTROLLER_FINALIZER)
    }

    /// Finalizer list with the controller finalizer appended (if missing)
    pub fn finalizers_with_controller(&self) -> Vec<String> {
        let mut finalizers = self.finalizers().to_vec();
        if !finalizers.iter().any(|f| f == CONTROLLER_FINALIZER) {
            finalizers.push(CONTROLLER_FINALIZER.to_string());
        }
        finalizers
    }

    /// Finalizer list with the controller finalizer removed
    ///
    /// Finalizers owned by other controllers are preserved.
    pub fn finalizers_without_controller(&self) -> Vec<String> {
        self.finalizers()
            .iter()
            .filter(|f| *f != CONTROLLER_FINALIZER)
            .cloned()
            .collect()
    }

    /// Status with the phase replaced
    pub fn status_with_phase(&self, phase: ControlPlanePhase) -> ControlPlaneStatus {
        let mut status = self.status.clone().unwrap_or_default();
        status.phase = Some(phase);
        status
    }
}
