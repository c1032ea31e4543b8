//! Member identity and role derivation
//!
//! Everything here is a pure function of the StatefulSet name, namespace,
//! cluster domain, ports and the initial cluster size N read once at the start
//! of a protocol run.

use std::ops::Range;

use super::BootstrapError;

/// Part a member plays in forming the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberRole {
    /// One of the N initial members (ordinal < N)
    Seed,
    /// A member added by scaling beyond N (ordinal >= N)
    Joining,
}

/// Identity of one etcd member
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterMember {
    /// Zero-based StatefulSet ordinal
    pub ordinal: u32,
    /// Pod hostname `<set>-<ordinal>`, also the etcd member name
    pub name: String,
    /// Stable DNS name through the headless peer Service
    pub fqdn: String,
    /// URL other members use to reach this one
    pub peer_url: String,
    /// URL clients use to reach this member
    pub client_url: String,
    /// Seed or joining
    pub role: MemberRole,
}

/// The expected initial cluster: ordinals `[0, N)` of one StatefulSet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTopology {
    set_name: String,
    namespace: String,
    cluster_domain: String,
    initial_size: u32,
    client_port: u16,
    peer_port: u16,
}

impl ClusterTopology {
    /// Create a topology
    ///
    /// # Errors
    ///
    /// Returns `BootstrapError::Config` if `initial_size` is zero or a name is
    /// empty.
    pub fn new(
        set_name: impl Into<String>,
        namespace: impl Into<String>,
        cluster_domain: impl Into<String>,
        initial_size: u32,
        client_port: u16,
        peer_port: u16,
    ) -> Result<Self, BootstrapError> {
        let topology = Self {
            set_name: set_name.into(),
            namespace: namespace.into(),
            cluster_domain: cluster_domain.into(),
            initial_size,
            client_port,
            peer_port,
        };

        if topology.initial_size == 0 {
            return Err(BootstrapError::Config(
                "initial cluster size must be at least 1".to_string(),
            ));
        }
        for (field, value) in [
            ("set name", &topology.set_name),
            ("namespace", &topology.namespace),
            ("cluster domain", &topology.cluster_domain),
        ] {
            if value.is_empty() {
                return Err(BootstrapError::Config(format!("{} must not be empty", field)));
            }
        }
        Ok(topology)
    }

    /// Initial cluster size N
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Client port
    pub fn client_port(&self) -> u16 {
        self.client_port
    }

    /// Peer port
    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    /// Ordinals of the initial cluster
    pub fn seed_ordinals(&self) -> Range<u32> {
        0..self.initial_size
    }

    /// Member name for an ordinal
    pub fn hostname(&self, ordinal: u32) -> String {
        format!("{}-{}", self.set_name, ordinal)
    }

    /// Fully qualified DNS name for an ordinal
    pub fn fqdn(&self, ordinal: u32) -> String {
        format!(
            "{}.{}.{}.svc.{}",
            self.hostname(ordinal),
            self.set_name,
            self.namespace,
            self.cluster_domain
        )
    }

    /// Peer URL for an ordinal
    pub fn peer_url(&self, ordinal: u32) -> String {
        format!("https://{}:{}", self.fqdn(ordinal), self.peer_port)
    }

    /// Client URL for an ordinal
    pub fn client_url(&self, ordinal: u32) -> String {
        format!("https://{}:{}", self.fqdn(ordinal), self.client_port)
    }

    /// Role of an ordinal under this snapshot of N
    pub fn role(&self, ordinal: u32) -> MemberRole {
        if ordinal < self.initial_size {
            MemberRole::Seed
        } else {
            MemberRole::Joining
        }
    }

    /// Full identity of an ordinal
    pub fn member(&self, ordinal: u32) -> ClusterMember {
        ClusterMember {
            ordinal,
            name: self.hostname(ordinal),
            fqdn: self.fqdn(ordinal),
            peer_url: self.peer_url(ordinal),
            client_url: self.client_url(ordinal),
            role: self.role(ordinal),
        }
    }

    /// Client URLs of the initial cluster, used as admin endpoints
    pub fn seed_client_urls(&self) -> Vec<String> {
        self.seed_ordinals().map(|i| self.client_url(i)).collect()
    }

    /// `--initial-cluster` value for a freshly seeded cluster
    pub fn initial_cluster(&self) -> String {
        self.seed_ordinals()
            .map(|i| format!("{}={}", self.hostname(i), self.peer_url(i)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse the ordinal out of a pod hostname of this StatefulSet
    ///
    /// # Errors
    ///
    /// Returns `BootstrapError::InvalidIdentity` unless `hostname` is exactly
    /// `<set>-<digits>`.
    pub fn ordinal_of(&self, hostname: &str) -> Result<u32, BootstrapError> {
        parse_ordinal(hostname, &self.set_name)
    }
}

/// Parse `<set>-<ordinal>` into the ordinal
pub fn parse_ordinal(hostname: &str, set_name: &str) -> Result<u32, BootstrapError> {
    let invalid = || {
        BootstrapError::InvalidIdentity(format!(
            "hostname '{}' is not a member of StatefulSet '{}'",
            hostname, set_name
        ))
    };

    let suffix = hostname
        .strip_prefix(set_name)
        .and_then(|rest| rest.strip_prefix('-'))
        .ok_or_else(invalid)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    suffix.parse().map_err(|_| invalid())
}
