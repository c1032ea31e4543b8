//! Supporting types for the ControlPlane CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_ETCD_CLIENT_PORT, DEFAULT_ETCD_PEER_PORT};

/// etcd image used when `spec.etcd.image` is omitted
pub const DEFAULT_ETCD_IMAGE: &str = "registry.k8s.io/etcd:3.5.16-0";

/// Lifecycle phase of a ControlPlane
///
/// The phase only moves forward: Initializing -> Running on a successful
/// init run, and to Terminating once deletion has been requested.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ControlPlanePhase {
    /// Finalizer registered, install has not completed yet
    Initializing,
    /// Install completed successfully
    Running,
    /// Deletion requested, teardown in progress
    Terminating,
}

impl std::fmt::Display for ControlPlanePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Running => write!(f, "Running"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// etcd cluster configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSpec {
    /// etcd container image
    #[serde(default = "default_etcd_image")]
    pub image: String,

    /// Desired number of etcd members
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Port serving client traffic
    #[serde(default = "default_client_port")]
    pub client_port: u16,

    /// Port serving member-to-member traffic
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    /// Persistent storage for member data
    #[serde(default)]
    pub storage: EtcdStorage,
}

impl Default for EtcdSpec {
    fn default() -> Self {
        Self {
            image: default_etcd_image(),
            replicas: default_replicas(),
            client_port: default_client_port(),
            peer_port: default_peer_port(),
            storage: EtcdStorage::default(),
        }
    }
}

impl EtcdSpec {
    /// Validate the etcd specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.image.trim().is_empty() {
            return Err(crate::Error::validation("etcd image must not be empty"));
        }
        if self.replicas < 1 {
            return Err(crate::Error::validation(format!(
                "etcd replicas must be at least 1, got {}",
                self.replicas
            )));
        }
        if self.client_port == 0 || self.peer_port == 0 {
            return Err(crate::Error::validation("etcd ports must be non-zero"));
        }
        if self.client_port == self.peer_port {
            return Err(crate::Error::validation(format!(
                "etcd client and peer ports must differ, both are {}",
                self.client_port
            )));
        }
        self.storage.validate()
    }
}

/// Volume claim settings for etcd members
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdStorage {
    /// Name of the volume claim template
    #[serde(default = "default_volume_name")]
    pub volume_name: String,

    /// Storage class; the cluster default is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Volume access modes
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,

    /// Requested volume size (e.g. "1Gi")
    #[serde(default = "default_storage_size")]
    pub size: String,
}

impl Default for EtcdStorage {
    fn default() -> Self {
        Self {
            volume_name: default_volume_name(),
            storage_class_name: None,
            access_modes: default_access_modes(),
            size: default_storage_size(),
        }
    }
}

impl EtcdStorage {
    /// Validate the storage specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.volume_name.is_empty() {
            return Err(crate::Error::validation("storage volumeName must not be empty"));
        }
        if self.access_modes.is_empty() {
            return Err(crate::Error::validation(
                "storage accessModes must list at least one mode",
            ));
        }
        if self.size.is_empty() {
            return Err(crate::Error::validation("storage size must not be empty"));
        }
        Ok(())
    }
}

fn default_etcd_image() -> String {
    DEFAULT_ETCD_IMAGE.to_string()
}

fn default_replicas() -> i32 {
    3
}

fn default_client_port() -> u16 {
    DEFAULT_ETCD_CLIENT_PORT
}

fn default_peer_port() -> u16 {
    DEFAULT_ETCD_PEER_PORT
}

fn default_volume_name() -> String {
    "etcd-data".to_string()
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

fn default_storage_size() -> String {
    "1Gi".to_string()
}
