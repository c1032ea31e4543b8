//! etcd install and uninstall tasks
//!
//! Init: `apply-etcd` then `wait-etcd`. Deinit: `delete-etcd`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use super::client::{ManagedKind, ManifestClient};
use super::{Planner, PlannerAction, PlannerFactory, Task, TaskPlanner};
use crate::crd::ControlPlane;
use crate::template::{
    etcd_client_service_name, etcd_label_selector, etcd_name, EtcdManifestContext,
    ManifestRenderer, TemplateId,
};
use crate::Error;

/// Renders the etcd manifests and server-side applies them
pub struct ApplyEtcdTask {
    client: Arc<dyn ManifestClient>,
    renderer: Arc<ManifestRenderer>,
    context: EtcdManifestContext,
}

impl ApplyEtcdTask {
    /// Create the task for an already-validated render context
    pub fn new(
        client: Arc<dyn ManifestClient>,
        renderer: Arc<ManifestRenderer>,
        context: EtcdManifestContext,
    ) -> Self {
        Self {
            client,
            renderer,
            context,
        }
    }
}

#[async_trait]
impl Task for ApplyEtcdTask {
    fn name(&self) -> &str {
        "apply-etcd"
    }

    async fn run(&self) -> Result<(), Error> {
        // Render everything before the first write so a template error never
        // leaves a partial install behind.
        let rendered = TemplateId::ALL
            .iter()
            .map(|id| self.renderer.render(*id, &self.context))
            .collect::<Result<Vec<_>, _>>()?;

        for (id, manifest) in TemplateId::ALL.iter().zip(rendered) {
            self.client.apply(&manifest).await?;
            debug!(template = %id, namespace = %self.context.namespace, "applied etcd manifest");
        }

        info!(
            statefulset = %self.context.statefulset_name,
            namespace = %self.context.namespace,
            replicas = self.context.replicas,
            "etcd manifests applied"
        );
        Ok(())
    }
}

/// Polls the etcd StatefulSet until every replica is ready
pub struct WaitEtcdTask {
    client: Arc<dyn ManifestClient>,
    namespace: String,
    statefulset: String,
    timeout: Duration,
    interval: Duration,
}

impl WaitEtcdTask {
    /// Create the task; `timeout` bounds the whole wait
    pub fn new(
        client: Arc<dyn ManifestClient>,
        namespace: impl Into<String>,
        statefulset: impl Into<String>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            statefulset: statefulset.into(),
            timeout,
            interval,
        }
    }
}

#[async_trait]
impl Task for WaitEtcdTask {
    fn name(&self) -> &str {
        "wait-etcd"
    }

    async fn run(&self) -> Result<(), Error> {
        let poll = async {
            loop {
                if self
                    .client
                    .statefulset_ready(&self.namespace, &self.statefulset)
                    .await?
                {
                    return Ok::<(), Error>(());
                }
                debug!(
                    statefulset = %self.statefulset,
                    namespace = %self.namespace,
                    "etcd not ready yet"
                );
                tokio::time::sleep(self.interval).await;
            }
        };

        match tokio::time::timeout(self.timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "statefulset {}/{} not ready after {}s",
                self.namespace,
                self.statefulset,
                self.timeout.as_secs()
            ))),
        }
    }
}

/// Deletes the etcd StatefulSet, both Services and the member volume claims
pub struct DeleteEtcdTask {
    client: Arc<dyn ManifestClient>,
    namespace: String,
    control_plane: String,
}

impl DeleteEtcdTask {
    /// Create the task for the named control plane
    pub fn new(
        client: Arc<dyn ManifestClient>,
        namespace: impl Into<String>,
        control_plane: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            control_plane: control_plane.into(),
        }
    }
}

#[async_trait]
impl Task for DeleteEtcdTask {
    fn name(&self) -> &str {
        "delete-etcd"
    }

    async fn run(&self) -> Result<(), Error> {
        let statefulset = etcd_name(&self.control_plane);
        let targets = [
            (ManagedKind::StatefulSet, statefulset.clone()),
            (ManagedKind::Service, etcd_client_service_name(&self.control_plane)),
            (ManagedKind::Service, statefulset),
        ];

        for (kind, name) in &targets {
            self.client.delete(*kind, &self.namespace, name).await?;
        }

        // Claims survive where the retention policy is not enforced
        self.client
            .delete_labelled(
                ManagedKind::PersistentVolumeClaim,
                &self.namespace,
                &etcd_label_selector(&self.control_plane),
            )
            .await?;

        info!(control_plane = %self.control_plane, namespace = %self.namespace, "etcd removed");
        Ok(())
    }
}

/// Builds the etcd init and deinit planners
pub struct EtcdPlannerFactory {
    client: Arc<dyn ManifestClient>,
    renderer: Arc<ManifestRenderer>,
    bootstrap_image: String,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl EtcdPlannerFactory {
    /// Create a factory
    ///
    /// `bootstrap_image` is the image carrying the strata binary that etcd
    /// pods run as their entrypoint.
    pub fn new(
        client: Arc<dyn ManifestClient>,
        renderer: Arc<ManifestRenderer>,
        bootstrap_image: impl Into<String>,
        ready_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            renderer,
            bootstrap_image: bootstrap_image.into(),
            ready_timeout,
            poll_interval,
        }
    }

    fn namespace(cp: &ControlPlane) -> Result<String, Error> {
        cp.namespace()
            .ok_or_else(|| Error::validation("ControlPlane must be namespaced"))
    }

    fn build_init(&self, cp: &ControlPlane) -> Result<TaskPlanner, Error> {
        cp.spec.validate()?;
        let namespace = Self::namespace(cp)?;
        let context = EtcdManifestContext::for_control_plane(cp, &self.bootstrap_image)?;
        let statefulset = context.statefulset_name.clone();

        Ok(
            TaskPlanner::new(PlannerAction::Init, format!("{}/{}", namespace, cp.name_any()))
                .with_task(ApplyEtcdTask::new(
                    self.client.clone(),
                    self.renderer.clone(),
                    context,
                ))
                .with_task(WaitEtcdTask::new(
                    self.client.clone(),
                    namespace,
                    statefulset,
                    self.ready_timeout,
                    self.poll_interval,
                )),
        )
    }

    fn build_deinit(&self, cp: &ControlPlane) -> Result<TaskPlanner, Error> {
        let namespace = Self::namespace(cp)?;
        let name = cp.name_any();
        Ok(
            TaskPlanner::new(PlannerAction::DeInit, format!("{}/{}", namespace, name))
                .with_task(DeleteEtcdTask::new(self.client.clone(), namespace, name)),
        )
    }
}

impl PlannerFactory for EtcdPlannerFactory {
    fn init(&self, cp: &ControlPlane) -> Result<Box<dyn Planner>, Error> {
        Ok(Box::new(self.build_init(cp)?))
    }

    fn deinit(&self, cp: &ControlPlane) -> Result<Box<dyn Planner>, Error> {
        Ok(Box::new(self.build_deinit(cp)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ControlPlaneSpec, EtcdSpec};
    use crate::planner::MockManifestClient;
    use crate::template::TemplateError;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Mutex;

    fn sample_cp(replicas: i32) -> ControlPlane {
        ControlPlane {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("strata-system".to_string()),
                ..Default::default()
            },
            spec: ControlPlaneSpec {
                etcd: EtcdSpec {
                    replicas,
                    ..Default::default()
                },
                cluster_domain: "cluster.local".to_string(),
            },
            status: None,
        }
    }

    fn factory(client: MockManifestClient) -> EtcdPlannerFactory {
        EtcdPlannerFactory::new(
            Arc::new(client),
            Arc::new(ManifestRenderer::new().unwrap()),
            "ghcr.io/strata/strata:test",
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
    }

    // =========================================================================
    // Init Stories
    // =========================================================================

    /// Story: init applies the Services before the StatefulSet, then waits
    #[tokio::test]
    async fn story_init_applies_services_then_statefulset() {
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let kinds_clone = kinds.clone();

        let mut client = MockManifestClient::new();
        client.expect_apply().times(3).returning(move |manifest| {
            let obj: serde_json::Value = serde_yaml::from_slice(manifest).unwrap();
            kinds_clone.lock().unwrap().push(format!(
                "{}/{}",
                obj["kind"].as_str().unwrap(),
                obj["metadata"]["name"].as_str().unwrap()
            ));
            Ok(())
        });
        client
            .expect_statefulset_ready()
            .times(1)
            .returning(|_, _| Ok(true));

        let planner = factory(client).build_init(&sample_cp(3)).unwrap();
        assert_eq!(planner.task_names(), vec!["apply-etcd", "wait-etcd"]);
        planner.execute().await.unwrap();

        assert_eq!(
            *kinds.lock().unwrap(),
            vec![
                "Service/demo-etcd",
                "Service/demo-etcd-client",
                "StatefulSet/demo-etcd"
            ]
        );
    }

    /// Story: an invalid spec never produces a planner
    #[test]
    fn story_invalid_spec_is_rejected_before_planning() {
        let result = factory(MockManifestClient::new()).init(&sample_cp(0));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    /// Story: a value that would break the rendered YAML never produces a planner
    #[test]
    fn story_unsafe_cluster_domain_is_rejected_before_planning() {
        let mut cp = sample_cp(3);
        cp.spec.cluster_domain = "cluster.local\"".to_string();

        let result = factory(MockManifestClient::new()).init(&cp);
        assert!(matches!(
            result,
            Err(Error::Template(TemplateError::InvalidField { field: "cluster_domain", .. }))
        ));
    }

    /// Story: a failed apply stops the plan before the readiness wait
    #[tokio::test]
    async fn story_apply_failure_skips_wait() {
        let mut client = MockManifestClient::new();
        client
            .expect_apply()
            .times(1)
            .returning(|_| Err(Error::internal("apiserver unavailable")));
        client.expect_statefulset_ready().never();

        let err = factory(client).init(&sample_cp(3)).unwrap().execute().await.unwrap_err();
        assert!(matches!(err, Error::Planner { ref task, .. } if task == "apply-etcd"));
    }

    // =========================================================================
    // Readiness Stories
    // =========================================================================

    /// Story: the wait polls until the StatefulSet reports ready
    #[tokio::test(start_paused = true)]
    async fn story_wait_polls_until_ready() {
        let calls = Arc::new(Mutex::new(0));
        let calls_clone = calls.clone();

        let mut client = MockManifestClient::new();
        client.expect_statefulset_ready().returning(move |_, _| {
            let mut n = calls_clone.lock().unwrap();
            *n += 1;
            Ok(*n >= 3)
        });

        let task = WaitEtcdTask::new(
            Arc::new(client),
            "strata-system",
            "demo-etcd",
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        task.run().await.unwrap();
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    /// Story: a StatefulSet that never becomes ready times out
    #[tokio::test(start_paused = true)]
    async fn story_wait_times_out() {
        let mut client = MockManifestClient::new();
        client.expect_statefulset_ready().returning(|_, _| Ok(false));

        let task = WaitEtcdTask::new(
            Arc::new(client),
            "strata-system",
            "demo-etcd",
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        let err = task.run().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.to_string().contains("strata-system/demo-etcd"));
    }

    // =========================================================================
    // Deinit Stories
    // =========================================================================

    /// Story: deinit deletes the StatefulSet, both Services and the claims
    #[tokio::test]
    async fn story_deinit_deletes_every_etcd_object() {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let deleted_clone = deleted.clone();
        let claims_clone = deleted.clone();

        let mut client = MockManifestClient::new();
        client.expect_delete().times(3).returning(move |kind, ns, name| {
            assert_eq!(ns, "strata-system");
            deleted_clone
                .lock()
                .unwrap()
                .push(format!("{}/{}", kind, name));
            Ok(())
        });
        client
            .expect_delete_labelled()
            .times(1)
            .returning(move |kind, ns, selector| {
                assert_eq!(ns, "strata-system");
                claims_clone
                    .lock()
                    .unwrap()
                    .push(format!("{}?{}", kind, selector));
                Ok(())
            });

        factory(client)
            .deinit(&sample_cp(3))
            .unwrap()
            .execute()
            .await
            .unwrap();

        assert_eq!(
            *deleted.lock().unwrap(),
            vec![
                "StatefulSet/demo-etcd",
                "Service/demo-etcd-client",
                "Service/demo-etcd",
                "PersistentVolumeClaim?strata.dev/app=etcd,strata.dev/etcd=demo-etcd"
            ]
        );
    }

    /// Story: a failed claim cleanup fails the plan so the finalizer stays
    #[tokio::test]
    async fn story_claim_cleanup_failure_fails_deinit() {
        let mut client = MockManifestClient::new();
        client.expect_delete().times(3).returning(|_, _, _| Ok(()));
        client
            .expect_delete_labelled()
            .times(1)
            .returning(|_, _, _| Err(Error::internal("apiserver unavailable")));

        let err = factory(client)
            .deinit(&sample_cp(3))
            .unwrap()
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Planner { ref task, .. } if task == "delete-etcd"));
    }

    /// Story: deinit skips resource validation, so a broken resource can
    /// still be deleted
    #[test]
    fn story_deinit_ignores_invalid_spec() {
        assert!(factory(MockManifestClient::new())
            .deinit(&sample_cp(0))
            .is_ok());
    }
}
