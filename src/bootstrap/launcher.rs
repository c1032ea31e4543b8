//! etcd process launch

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

#[cfg(test)]
use mockall::automock;

use super::BootstrapError;

/// Token shared by every member of a freshly seeded cluster
pub const INITIAL_CLUSTER_TOKEN: &str = "etcd-cluster-1";

/// `--initial-cluster-state`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterState {
    /// Members form a brand new cluster together
    New,
    /// The member joins a cluster that is already running
    Existing,
}

impl ClusterState {
    fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Existing => "existing",
        }
    }
}

/// Cluster-formation flags; absent when restarting on existing data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitialCluster {
    /// Comma-separated `name=peerURL` pairs
    pub members: String,
    /// New or existing
    pub state: ClusterState,
    /// Only passed when seeding a new cluster
    pub token: Option<String>,
}

/// Everything needed to start one etcd member
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EtcdInvocation {
    /// Member name
    pub name: String,
    /// etcd data directory
    pub data_dir: PathBuf,
    /// Directory with `ca.crt`, `server.crt` and `server.key`
    pub pki_dir: PathBuf,
    /// Peer URL advertised to the cluster
    pub advertise_peer_url: String,
    /// Client URL advertised to clients
    pub advertise_client_url: String,
    /// Address the peer listener binds
    pub listen_peer_url: String,
    /// Addresses the client listener binds
    pub listen_client_urls: Vec<String>,
    /// Formation flags
    pub initial_cluster: Option<InitialCluster>,
}

impl EtcdInvocation {
    /// Command-line arguments for the etcd binary
    pub fn args(&self) -> Vec<String> {
        let pki = |file: &str| self.pki_dir.join(file).display().to_string();

        let mut args = vec![
            format!("--name={}", self.name),
            format!("--data-dir={}", self.data_dir.display()),
            format!("--initial-advertise-peer-urls={}", self.advertise_peer_url),
            format!("--listen-peer-urls={}", self.listen_peer_url),
            format!("--listen-client-urls={}", self.listen_client_urls.join(",")),
            format!("--advertise-client-urls={}", self.advertise_client_url),
            "--client-cert-auth=true".to_string(),
            format!("--trusted-ca-file={}", pki("ca.crt")),
            format!("--cert-file={}", pki("server.crt")),
            format!("--key-file={}", pki("server.key")),
            "--peer-client-cert-auth=true".to_string(),
            format!("--peer-trusted-ca-file={}", pki("ca.crt")),
            format!("--peer-cert-file={}", pki("server.crt")),
            format!("--peer-key-file={}", pki("server.key")),
        ];

        if let Some(initial) = &self.initial_cluster {
            args.push(format!("--initial-cluster={}", initial.members));
            args.push(format!("--initial-cluster-state={}", initial.state.as_str()));
            if let Some(token) = &initial.token {
                args.push(format!("--initial-cluster-token={}", token));
            }
        }
        args
    }
}

/// Starts the etcd process
#[cfg_attr(test, automock)]
pub trait EtcdLauncher: Send + Sync {
    /// Start etcd
    ///
    /// The production launcher replaces the current process and only
    /// returns on failure.
    fn launch(&self, invocation: &EtcdInvocation) -> Result<(), BootstrapError>;
}

/// Launcher that `exec`s the etcd binary in place of the current process
pub struct ExecLauncher {
    binary: PathBuf,
}

impl ExecLauncher {
    /// Create a launcher for the given etcd binary
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
        }
    }
}

impl EtcdLauncher for ExecLauncher {
    fn launch(&self, invocation: &EtcdInvocation) -> Result<(), BootstrapError> {
        let args = invocation.args();
        info!(binary = %self.binary.display(), ?args, "exec etcd");

        let err = Command::new(&self.binary).args(&args).exec();
        Err(BootstrapError::Launch(format!(
            "failed to exec {}: {}",
            self.binary.display(),
            err
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(initial_cluster: Option<InitialCluster>) -> EtcdInvocation {
        EtcdInvocation {
            name: "demo-etcd-3".to_string(),
            data_dir: PathBuf::from("/var/run/etcd/default.etcd"),
            pki_dir: PathBuf::from("/etc/strata/pki/etcd"),
            advertise_peer_url: "https://demo-etcd-3.demo-etcd:2380".to_string(),
            advertise_client_url: "https://demo-etcd-3.demo-etcd:2379".to_string(),
            listen_peer_url: "https://10.0.0.7:2380".to_string(),
            listen_client_urls: vec![
                "https://10.0.0.7:2379".to_string(),
                "https://127.0.0.1:2379".to_string(),
            ],
            initial_cluster,
        }
    }

    #[test]
    fn test_seed_args_carry_token_and_new_state() {
        let args = invocation(Some(InitialCluster {
            members: "a=https://a:2380,b=https://b:2380".to_string(),
            state: ClusterState::New,
            token: Some(INITIAL_CLUSTER_TOKEN.to_string()),
        }))
        .args();

        assert!(args.contains(&"--initial-cluster=a=https://a:2380,b=https://b:2380".to_string()));
        assert!(args.contains(&"--initial-cluster-state=new".to_string()));
        assert!(args.contains(&"--initial-cluster-token=etcd-cluster-1".to_string()));
    }

    #[test]
    fn test_join_args_use_existing_state_without_token() {
        let args = invocation(Some(InitialCluster {
            members: "a=https://a:2380".to_string(),
            state: ClusterState::Existing,
            token: None,
        }))
        .args();

        assert!(args.contains(&"--initial-cluster-state=existing".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--initial-cluster-token")));
        assert!(args.contains(
            &"--listen-client-urls=https://10.0.0.7:2379,https://127.0.0.1:2379".to_string()
        ));
    }

    #[test]
    fn test_restart_args_omit_formation_flags() {
        let args = invocation(None).args();
        assert!(!args.iter().any(|a| a.starts_with("--initial-cluster")));
        assert!(args.contains(&"--data-dir=/var/run/etcd/default.etcd".to_string()));
        assert!(args.contains(&"--trusted-ca-file=/etc/strata/pki/etcd/ca.crt".to_string()));
    }

    #[test]
    fn test_exec_of_missing_binary_fails() {
        let launcher = ExecLauncher::new("/nonexistent/strata-test/etcd");
        let err = launcher.launch(&invocation(None)).unwrap_err();
        assert!(matches!(err, BootstrapError::Launch(_)));
    }
}
