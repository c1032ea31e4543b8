//! Bootstrap settings read from the pod environment

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use super::topology::ClusterTopology;
use super::BootstrapError;
use crate::template::{ETCD_PKI_DIR, ETCD_VOLUME_DIR};
use crate::{DEFAULT_CLUSTER_DOMAIN, DEFAULT_ETCD_CLIENT_PORT, DEFAULT_ETCD_PEER_PORT};

/// Settings for `strata etcd start|stop`
///
/// Every field can be set by flag or by the environment the etcd
/// StatefulSet template provides.
#[derive(Args, Clone, Debug)]
pub struct BootstrapConfig {
    /// Pod name `<set>-<ordinal>`
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Fallback for the pod name
    #[arg(long, env = "HOSTNAME", hide_env_values = true)]
    pub hostname: Option<String>,

    /// Initial cluster size N
    #[arg(long, env = "INITIAL_CLUSTER_SIZE")]
    pub initial_cluster_size: u32,

    /// Namespace of the StatefulSet
    #[arg(long, env = "MY_NAMESPACE")]
    pub namespace: String,

    /// IP address of this pod
    #[arg(long, env = "POD_IP")]
    pub pod_ip: String,

    /// StatefulSet name; also the headless peer Service name
    #[arg(long, env = "SET_NAME")]
    pub set_name: String,

    /// Cluster DNS domain
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    pub cluster_domain: String,

    /// etcd client port
    #[arg(long, env = "ETCD_CLIENT_PORT", default_value_t = DEFAULT_ETCD_CLIENT_PORT)]
    pub client_port: u16,

    /// etcd peer port
    #[arg(long, env = "ETCD_PEER_PORT", default_value_t = DEFAULT_ETCD_PEER_PORT)]
    pub peer_port: u16,

    /// Mount point of the member volume
    #[arg(long, env = "ETCD_VOLUME_DIR", default_value = ETCD_VOLUME_DIR)]
    pub volume_dir: PathBuf,

    /// Directory holding ca.crt, server.crt and server.key
    #[arg(long, env = "ETCD_PKI_DIR", default_value = ETCD_PKI_DIR)]
    pub pki_dir: PathBuf,

    /// etcd binary to exec
    #[arg(long, env = "ETCD_BINARY", default_value = "etcd")]
    pub etcd_binary: PathBuf,

    /// Seconds between DNS checks while waiting for seed peers
    #[arg(long, env = "PEER_WAIT_INTERVAL_SECS", default_value_t = 1)]
    pub peer_wait_interval_secs: u64,
}

impl BootstrapConfig {
    /// This member's name
    pub fn member_name(&self) -> Result<&str, BootstrapError> {
        self.pod_name
            .as_deref()
            .or(self.hostname.as_deref())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                BootstrapError::InvalidIdentity("neither POD_NAME nor HOSTNAME is set".to_string())
            })
    }

    /// Topology snapshot for this run
    pub fn topology(&self) -> Result<ClusterTopology, BootstrapError> {
        ClusterTopology::new(
            self.set_name.clone(),
            self.namespace.clone(),
            self.cluster_domain.clone(),
            self.initial_cluster_size,
            self.client_port,
            self.peer_port,
        )
    }

    /// etcd data directory inside the member volume
    pub fn data_dir(&self) -> PathBuf {
        self.volume_dir.join("default.etcd")
    }

    /// Interval between seed DNS checks
    pub fn peer_wait_interval(&self) -> Duration {
        Duration::from_secs(self.peer_wait_interval_secs)
    }
}
