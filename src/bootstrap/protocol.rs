//! Per-member startup and shutdown state machine
//!
//! Startup:
//! - restart: data dir already holds a member, start on it with no admin calls
//! - seed (ordinal < N): wait for every seed name to resolve, then form the
//!   cluster with `--initial-cluster-state new`
//! - joining (ordinal >= N): drop any stale registration of ourselves, add
//!   ourselves, start with the membership returned by the add
//!
//! Shutdown only acts for joining members: remove ourselves from the cluster,
//! and purge local data only once the removal is confirmed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::admin::{MemberInfo, MembershipAdmin};
use super::launcher::{
    ClusterState, EtcdInvocation, EtcdLauncher, InitialCluster, INITIAL_CLUSTER_TOKEN,
};
use super::local_state::LocalState;
use super::resolver::PeerResolver;
use super::topology::{ClusterMember, ClusterTopology, MemberRole};
use super::BootstrapError;

/// How `startup` brought etcd up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// Existing member data was reused
    Restart,
    /// Formed a new cluster with the other seeds
    Seed,
    /// Joined a running cluster
    Join,
}

/// What `shutdown` did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Seed member; membership is kept across restarts
    Retained,
    /// No entry for this member was found; nothing was touched
    NotRegistered,
    /// Removed from the cluster and local data purged
    Removed,
}

/// Host-side launch settings
#[derive(Clone, Debug)]
pub struct LaunchSettings {
    /// Pod IP the listeners bind
    pub pod_ip: String,
    /// etcd data directory
    pub data_dir: PathBuf,
    /// TLS material directory
    pub pki_dir: PathBuf,
    /// Sleep between seed DNS checks
    pub peer_wait_interval: Duration,
}

/// External systems the protocol talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Cluster membership API
    pub admin: Arc<dyn MembershipAdmin>,
    /// Peer DNS
    pub resolver: Arc<dyn PeerResolver>,
    /// etcd process launcher
    pub launcher: Arc<dyn EtcdLauncher>,
    /// Local member data
    pub state: Arc<dyn LocalState>,
}

/// Bootstrap protocol for one member
pub struct MemberBootstrap {
    topology: ClusterTopology,
    member: ClusterMember,
    settings: LaunchSettings,
    deps: Collaborators,
}

impl MemberBootstrap {
    /// Create the protocol for `ordinal`
    pub fn new(
        topology: ClusterTopology,
        ordinal: u32,
        settings: LaunchSettings,
        deps: Collaborators,
    ) -> Self {
        let member = topology.member(ordinal);
        Self {
            topology,
            member,
            settings,
            deps,
        }
    }

    /// This member's identity
    pub fn member(&self) -> &ClusterMember {
        &self.member
    }

    /// Bring etcd up for this member
    ///
    /// Returns after the launcher returns; the production launcher replaces
    /// the process, so in practice this only returns on error.
    pub async fn startup(&self) -> Result<StartMode, BootstrapError> {
        info!(
            member = %self.member.name,
            ordinal = self.member.ordinal,
            initial_size = self.topology.initial_size(),
            role = ?self.member.role,
            "starting etcd member"
        );

        if self.deps.state.is_initialized().await? {
            info!(data_dir = %self.settings.data_dir.display(), "existing member data found, restarting");
            self.deps.launcher.launch(&self.invocation(None))?;
            return Ok(StartMode::Restart);
        }

        match self.member.role {
            MemberRole::Seed => {
                self.seed().await?;
                Ok(StartMode::Seed)
            }
            MemberRole::Joining => {
                self.join().await?;
                Ok(StartMode::Join)
            }
        }
    }

    async fn seed(&self) -> Result<(), BootstrapError> {
        for ordinal in self.topology.seed_ordinals() {
            let fqdn = self.topology.fqdn(ordinal);
            while !self.deps.resolver.resolves(&fqdn).await {
                info!(peer = %fqdn, "waiting for peer to come up");
                tokio::time::sleep(self.settings.peer_wait_interval).await;
            }
            debug!(peer = %fqdn, "peer resolves");
        }

        info!(member = %self.member.name, "forming new cluster");
        self.deps.launcher.launch(&self.invocation(Some(InitialCluster {
            members: self.topology.initial_cluster(),
            state: ClusterState::New,
            token: Some(INITIAL_CLUSTER_TOKEN.to_string()),
        })))
    }

    async fn join(&self) -> Result<(), BootstrapError> {
        let members = self.deps.admin.list().await?;

        // A registration left behind by an earlier attempt that never got
        // data on disk; etcd refuses to add the same peer URL twice.
        for stale in members.iter().filter(|m| self.is_own_entry(m)) {
            info!(member_id = stale.id, name = %stale.name, "removing stale registration");
            self.deps.admin.remove(stale.id).await?;
        }

        info!(member = %self.member.name, peer_url = %self.member.peer_url, "adding member");
        let added = self
            .deps
            .admin
            .add(&self.member.name, vec![self.member.peer_url.clone()])
            .await?;

        if !added.members.iter().any(|m| m.id == added.member.id) {
            return Err(BootstrapError::MemberNotFound(format!(
                "added member {} missing from the returned member list",
                added.member.id
            )));
        }

        let initial_cluster = added.initial_cluster();
        info!(member_id = added.member.id, %initial_cluster, "joining existing cluster");

        self.deps.launcher.launch(&self.invocation(Some(InitialCluster {
            members: initial_cluster,
            state: ClusterState::Existing,
            token: None,
        })))
    }

    /// Leave the cluster if this member was added by scaling
    pub async fn shutdown(&self) -> Result<ShutdownOutcome, BootstrapError> {
        if self.member.role == MemberRole::Seed {
            info!(
                member = %self.member.name,
                initial_size = self.topology.initial_size(),
                "seed member, keeping membership"
            );
            return Ok(ShutdownOutcome::Retained);
        }

        let members = self.deps.admin.list().await?;
        let Some(own) = members.iter().find(|m| self.is_own_entry(m)) else {
            warn!(member = %self.member.name, "no membership entry found, leaving local data alone");
            return Ok(ShutdownOutcome::NotRegistered);
        };

        info!(member = %self.member.name, member_id = own.id, "removing member from cluster");
        self.deps.admin.remove(own.id).await?;

        self.deps.state.purge().await?;
        Ok(ShutdownOutcome::Removed)
    }

    /// Exact identity match: our name, or an unstarted entry registered
    /// under our peer URL
    fn is_own_entry(&self, m: &MemberInfo) -> bool {
        if m.is_started() {
            m.name == self.member.name
        } else {
            m.peer_urls.iter().any(|url| *url == self.member.peer_url)
        }
    }

    fn invocation(&self, initial_cluster: Option<InitialCluster>) -> EtcdInvocation {
        let ip = &self.settings.pod_ip;
        EtcdInvocation {
            name: self.member.name.clone(),
            data_dir: self.settings.data_dir.clone(),
            pki_dir: self.settings.pki_dir.clone(),
            advertise_peer_url: self.member.peer_url.clone(),
            advertise_client_url: self.member.client_url.clone(),
            listen_peer_url: format!("https://{}:{}", ip, self.topology.peer_port()),
            listen_client_urls: vec![
                format!("https://{}:{}", ip, self.topology.client_port()),
                format!("https://127.0.0.1:{}", self.topology.client_port()),
            ],
            initial_cluster,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::admin::{AddedMember, MockMembershipAdmin};
    use crate::bootstrap::launcher::MockEtcdLauncher;
    use crate::bootstrap::local_state::MockLocalState;
    use crate::bootstrap::resolver::MockPeerResolver;
    use mockall::Sequence;
    use std::sync::Mutex;

    const PEER3: &str = "https://demo-etcd-3.demo-etcd.strata-system.svc.cluster.local:2380";

    fn topology() -> ClusterTopology {
        ClusterTopology::new("demo-etcd", "strata-system", "cluster.local", 3, 2379, 2380).unwrap()
    }

    fn settings() -> LaunchSettings {
        LaunchSettings {
            pod_ip: "10.0.0.7".to_string(),
            data_dir: PathBuf::from("/var/run/etcd/default.etcd"),
            pki_dir: PathBuf::from("/etc/strata/pki/etcd"),
            peer_wait_interval: Duration::from_secs(1),
        }
    }

    fn started(id: u64, ordinal: u32) -> MemberInfo {
        let t = topology();
        MemberInfo {
            id,
            name: t.hostname(ordinal),
            peer_urls: vec![t.peer_url(ordinal)],
            client_urls: vec![t.client_url(ordinal)],
        }
    }

    fn unstarted(id: u64, peer_url: &str) -> MemberInfo {
        MemberInfo {
            id,
            name: String::new(),
            peer_urls: vec![peer_url.to_string()],
            client_urls: vec![],
        }
    }

    fn seeds() -> Vec<MemberInfo> {
        vec![started(1, 0), started(2, 1), started(3, 2)]
    }

    struct Mocks {
        admin: MockMembershipAdmin,
        resolver: MockPeerResolver,
        launcher: MockEtcdLauncher,
        state: MockLocalState,
    }

    impl Mocks {
        /// Fresh volume, nothing else expected
        fn fresh() -> Self {
            let mut state = MockLocalState::new();
            state.expect_is_initialized().returning(|| Ok(false));
            Self {
                admin: MockMembershipAdmin::new(),
                resolver: MockPeerResolver::new(),
                launcher: MockEtcdLauncher::new(),
                state,
            }
        }

        fn build(self, ordinal: u32) -> MemberBootstrap {
            MemberBootstrap::new(
                topology(),
                ordinal,
                settings(),
                Collaborators {
                    admin: Arc::new(self.admin),
                    resolver: Arc::new(self.resolver),
                    launcher: Arc::new(self.launcher),
                    state: Arc::new(self.state),
                },
            )
        }
    }

    /// Records every invocation handed to the launcher
    fn capture_launch(launcher: &mut MockEtcdLauncher) -> Arc<Mutex<Vec<EtcdInvocation>>> {
        let launched = Arc::new(Mutex::new(Vec::new()));
        let sink = launched.clone();
        launcher.expect_launch().returning(move |inv| {
            sink.lock().unwrap().push(inv.clone());
            Ok(())
        });
        launched
    }

    // =========================================================================
    // Seed Stories
    // =========================================================================

    /// Story: a seed waits for every seed name, then forms a new cluster
    #[tokio::test(start_paused = true)]
    async fn story_seed_waits_for_peers_then_forms_cluster() {
        let mut mocks = Mocks::fresh();
        let lookups = Arc::new(Mutex::new(Vec::new()));
        let seen = lookups.clone();
        // demo-etcd-2 needs two attempts before it resolves
        let misses = Arc::new(Mutex::new(2));
        mocks.resolver.expect_resolves().returning(move |host| {
            seen.lock().unwrap().push(host.to_string());
            if host.starts_with("demo-etcd-2.") {
                let mut left = misses.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return false;
                }
            }
            true
        });
        mocks.admin.expect_add().never();
        mocks.admin.expect_list().never();
        let launched = capture_launch(&mut mocks.launcher);

        let mode = mocks.build(1).startup().await.unwrap();
        assert_eq!(mode, StartMode::Seed);

        assert_eq!(lookups.lock().unwrap().len(), 5);
        let inv = launched.lock().unwrap()[0].clone();
        let initial = inv.initial_cluster.unwrap();
        assert_eq!(initial.state, ClusterState::New);
        assert_eq!(initial.members, topology().initial_cluster());
        assert_eq!(initial.token.as_deref(), Some(INITIAL_CLUSTER_TOKEN));
        assert_eq!(inv.name, "demo-etcd-1");
    }

    // =========================================================================
    // Join Stories
    // =========================================================================

    /// Story: ordinal 3 of N=3 adds itself and starts with state existing
    #[tokio::test]
    async fn story_joining_member_adds_itself() {
        let mut mocks = Mocks::fresh();
        mocks.admin.expect_list().times(1).returning(|| Ok(seeds()));
        mocks.admin.expect_remove().never();
        mocks
            .admin
            .expect_add()
            .times(1)
            .withf(|name, urls| {
                name.to_string() == "demo-etcd-3" && urls == &vec![PEER3.to_string()]
            })
            .returning(|name, urls| {
                let new = unstarted(4, &urls[0]);
                let mut members = seeds();
                members.push(new.clone());
                Ok(AddedMember {
                    name: name.to_string(),
                    member: new,
                    members,
                })
            });
        mocks.resolver.expect_resolves().never();
        let launched = capture_launch(&mut mocks.launcher);

        let mode = mocks.build(3).startup().await.unwrap();
        assert_eq!(mode, StartMode::Join);

        let inv = launched.lock().unwrap()[0].clone();
        let initial = inv.initial_cluster.unwrap();
        assert_eq!(initial.state, ClusterState::Existing);
        assert_eq!(initial.token, None);
        assert!(initial.members.ends_with(&format!("demo-etcd-3={}", PEER3)));
        assert_eq!(
            inv.listen_client_urls,
            vec!["https://10.0.0.7:2379", "https://127.0.0.1:2379"]
        );
    }

    /// Story: a stale registration of ourselves is removed before the add
    #[tokio::test]
    async fn story_stale_registration_is_removed_before_add() {
        let mut mocks = Mocks::fresh();
        let mut seq = Sequence::new();
        mocks
            .admin
            .expect_list()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                let mut members = seeds();
                members.push(unstarted(99, PEER3));
                Ok(members)
            });
        mocks
            .admin
            .expect_remove()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|id| *id == 99)
            .returning(|_| Ok(()));
        mocks
            .admin
            .expect_add()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, urls| {
                let new = unstarted(100, &urls[0]);
                Ok(AddedMember {
                    name: name.to_string(),
                    member: new.clone(),
                    members: vec![new],
                })
            });
        capture_launch(&mut mocks.launcher);

        assert_eq!(mocks.build(3).startup().await.unwrap(), StartMode::Join);
    }

    /// Story: another member's unstarted entry is not mistaken for ours
    #[tokio::test]
    async fn story_foreign_unstarted_entry_is_left_alone() {
        let mut mocks = Mocks::fresh();
        let t = topology();
        let other_peer = t.peer_url(4);
        mocks.admin.expect_list().returning(move || {
            let mut members = seeds();
            members.push(unstarted(50, &other_peer));
            Ok(members)
        });
        mocks.admin.expect_remove().never();
        mocks.admin.expect_add().times(1).returning(|name, urls| {
            let new = unstarted(51, &urls[0]);
            Ok(AddedMember {
                name: name.to_string(),
                member: new.clone(),
                members: vec![new],
            })
        });
        capture_launch(&mut mocks.launcher);

        mocks.build(3).startup().await.unwrap();
    }

    /// Story: a failed add aborts without launching etcd
    #[tokio::test]
    async fn story_failed_add_aborts() {
        let mut mocks = Mocks::fresh();
        mocks.admin.expect_list().returning(|| Ok(seeds()));
        mocks
            .admin
            .expect_add()
            .times(1)
            .returning(|_, _| Err(BootstrapError::Admin("unhealthy cluster".to_string())));
        mocks.launcher.expect_launch().never();

        let err = mocks.build(3).startup().await.unwrap_err();
        assert!(matches!(err, BootstrapError::Admin(_)));
    }

    /// Story: an add response that omits the new member is rejected
    #[tokio::test]
    async fn story_add_response_without_new_member_aborts() {
        let mut mocks = Mocks::fresh();
        mocks.admin.expect_list().returning(|| Ok(seeds()));
        mocks.admin.expect_add().times(1).returning(|name, _| {
            Ok(AddedMember {
                name: name.to_string(),
                member: unstarted(9, PEER3),
                members: seeds(),
            })
        });
        mocks.launcher.expect_launch().never();

        let err = mocks.build(3).startup().await.unwrap_err();
        assert!(matches!(err, BootstrapError::MemberNotFound(_)));
    }

    // =========================================================================
    // Restart Stories
    // =========================================================================

    /// Story: existing member data restarts etcd without touching membership
    #[tokio::test]
    async fn story_restart_reuses_data_without_admin_calls() {
        let mut mocks = Mocks::fresh();
        mocks.state = MockLocalState::new();
        mocks.state.expect_is_initialized().returning(|| Ok(true));
        mocks.admin.expect_list().never();
        mocks.admin.expect_add().never();
        mocks.resolver.expect_resolves().never();
        let launched = capture_launch(&mut mocks.launcher);

        assert_eq!(mocks.build(4).startup().await.unwrap(), StartMode::Restart);
        assert_eq!(launched.lock().unwrap()[0].initial_cluster, None);
    }

    // =========================================================================
    // Shutdown Stories
    // =========================================================================

    /// Story: a seed keeps its membership on shutdown
    #[tokio::test]
    async fn story_seed_shutdown_is_noop() {
        let mut mocks = Mocks::fresh();
        mocks.admin.expect_list().never();
        mocks.admin.expect_remove().never();
        mocks.state.expect_purge().never();

        assert_eq!(
            mocks.build(2).shutdown().await.unwrap(),
            ShutdownOutcome::Retained
        );
    }

    /// Story: scale-down removes the member first, then purges
    #[tokio::test]
    async fn story_scale_down_removes_then_purges() {
        let mut mocks = Mocks::fresh();
        let mut seq = Sequence::new();
        mocks
            .admin
            .expect_list()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                let mut members = seeds();
                members.push(started(4, 3));
                Ok(members)
            });
        mocks
            .admin
            .expect_remove()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|id| *id == 4)
            .returning(|_| Ok(()));
        mocks
            .state
            .expect_purge()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        assert_eq!(
            mocks.build(3).shutdown().await.unwrap(),
            ShutdownOutcome::Removed
        );
    }

    /// Story: a failed removal leaves local data intact
    #[tokio::test]
    async fn story_failed_remove_keeps_local_data() {
        let mut mocks = Mocks::fresh();
        mocks.admin.expect_list().returning(|| {
            let mut members = seeds();
            members.push(started(4, 3));
            Ok(members)
        });
        mocks
            .admin
            .expect_remove()
            .returning(|_| Err(BootstrapError::Admin("quorum lost".to_string())));
        mocks.state.expect_purge().never();

        let err = mocks.build(3).shutdown().await.unwrap_err();
        assert!(matches!(err, BootstrapError::Admin(_)));
    }

    /// Story: shutdown without a registration touches nothing
    #[tokio::test]
    async fn story_unregistered_shutdown_touches_nothing() {
        let mut mocks = Mocks::fresh();
        mocks.admin.expect_list().returning(|| Ok(seeds()));
        mocks.admin.expect_remove().never();
        mocks.state.expect_purge().never();

        assert_eq!(
            mocks.build(3).shutdown().await.unwrap(),
            ShutdownOutcome::NotRegistered
        );
    }
}
