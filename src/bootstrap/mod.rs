//! etcd member bootstrap protocol
//!
//! Every pod of the etcd StatefulSet runs `strata etcd start` as its
//! entrypoint and `strata etcd stop` as its preStop hook. Members seed, grow
//! and shrink the cluster through etcd's own membership API; there is no
//! external coordinator.
//!
//! The protocol is a typed state machine ([`MemberBootstrap`]) over four
//! collaborators: [`MembershipAdmin`], [`PeerResolver`], [`EtcdLauncher`] and
//! [`LocalState`].

mod admin;
mod config;
mod launcher;
mod local_state;
mod protocol;
mod resolver;
mod topology;

use std::sync::Arc;

use thiserror::Error;

pub use admin::{AddedMember, ClientTls, HttpMembershipAdmin, MemberInfo, MembershipAdmin};
pub use config::BootstrapConfig;
pub use launcher::{
    ClusterState, EtcdInvocation, EtcdLauncher, ExecLauncher, InitialCluster,
    INITIAL_CLUSTER_TOKEN,
};
pub use local_state::{DataDir, LocalState};
pub use protocol::{Collaborators, LaunchSettings, MemberBootstrap, ShutdownOutcome, StartMode};
pub use resolver::{DnsResolver, PeerResolver};
pub use topology::{parse_ordinal, ClusterMember, ClusterTopology, MemberRole};

/// Bootstrap protocol errors
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Pod name is missing or not `<set>-<ordinal>`
    #[error("invalid member identity: {0}")]
    InvalidIdentity(String),

    /// Bad or missing settings
    #[error("configuration error: {0}")]
    Config(String),

    /// A membership API call failed
    #[error("membership admin error: {0}")]
    Admin(String),

    /// A member the protocol relies on is missing from the membership list
    #[error("member not found: {0}")]
    MemberNotFound(String),

    /// etcd could not be started
    #[error("launch failed: {0}")]
    Launch(String),

    /// Local data could not be read or removed
    #[error("local state error: {0}")]
    LocalState(#[from] std::io::Error),
}

/// Wire the protocol to the real etcd cluster, DNS, process and volume
///
/// The admin client targets the seed members' client URLs.
pub async fn member_bootstrap(config: &BootstrapConfig) -> Result<MemberBootstrap, BootstrapError> {
    let topology = config.topology()?;
    let ordinal = topology.ordinal_of(config.member_name()?)?;

    let tls = ClientTls::from_dir(&config.pki_dir).await?;
    let admin = HttpMembershipAdmin::new(topology.seed_client_urls(), &tls)?;

    let settings = LaunchSettings {
        pod_ip: config.pod_ip.clone(),
        data_dir: config.data_dir(),
        pki_dir: config.pki_dir.clone(),
        peer_wait_interval: config.peer_wait_interval(),
    };
    let deps = Collaborators {
        admin: Arc::new(admin),
        resolver: Arc::new(DnsResolver),
        launcher: Arc::new(ExecLauncher::new(&config.etcd_binary)),
        state: Arc::new(DataDir::new(&config.volume_dir, config.data_dir())),
    };

    Ok(MemberBootstrap::new(topology, ordinal, settings, deps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = BootstrapError::InvalidIdentity("hostname 'x' is not a member".to_string());
        assert!(err.to_string().starts_with("invalid member identity"));

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: BootstrapError = io.into();
        assert!(matches!(err, BootstrapError::LocalState(_)));
    }
}
