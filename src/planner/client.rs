//! Kubernetes access for planner tasks

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
};
use kube::discovery::ApiResource;
use kube::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, FIELD_MANAGER};

/// Kinds of object the etcd tasks delete
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagedKind {
    /// apps/v1 StatefulSet
    StatefulSet,
    /// v1 Service
    Service,
    /// v1 PersistentVolumeClaim
    PersistentVolumeClaim,
}

impl std::fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StatefulSet => write!(f, "StatefulSet"),
            Self::Service => write!(f, "Service"),
            Self::PersistentVolumeClaim => write!(f, "PersistentVolumeClaim"),
        }
    }
}

/// Trait abstracting the cluster writes planner tasks perform
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestClient: Send + Sync {
    /// Server-side apply a rendered YAML manifest
    async fn apply(&self, manifest: &[u8]) -> Result<(), Error>;

    /// Delete an object; an object that is already gone counts as deleted
    async fn delete(&self, kind: ManagedKind, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete every object of `kind` matching `label_selector`
    async fn delete_labelled(
        &self,
        kind: ManagedKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<(), Error>;

    /// Returns true once every desired replica of the StatefulSet is ready
    ///
    /// A StatefulSet that does not exist yet is not ready.
    async fn statefulset_ready(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeManifestClient {
    client: Client,
}

impl KubeManifestClient {
    /// Create a new KubeManifestClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManifestClient for KubeManifestClient {
    async fn apply(&self, manifest: &[u8]) -> Result<(), Error> {
        let obj: serde_json::Value = serde_yaml::from_slice(manifest)
            .map_err(|e| Error::serialization(format!("invalid manifest YAML: {}", e)))?;
        let id = ManifestIdentity::from_value(&obj)?;

        let api_resource = ApiResource::from_gvk(&id.gvk);
        let api: Api<DynamicObject> = match &id.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &api_resource),
            None => Api::all_with(self.client.clone(), &api_resource),
        };

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&id.name, &params, &Patch::Apply(&obj)).await?;

        debug!(kind = %id.gvk.kind, name = %id.name, "applied manifest");
        Ok(())
    }

    async fn delete(&self, kind: ManagedKind, namespace: &str, name: &str) -> Result<(), Error> {
        let deleted = match kind {
            ManagedKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                delete_if_present(api, name).await?
            }
            ManagedKind::Service => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                delete_if_present(api, name).await?
            }
            ManagedKind::PersistentVolumeClaim => {
                let api: Api<PersistentVolumeClaim> =
                    Api::namespaced(self.client.clone(), namespace);
                delete_if_present(api, name).await?
            }
        };

        if deleted {
            debug!(%kind, namespace, name, "deleted object");
        } else {
            debug!(%kind, namespace, name, "object already absent");
        }
        Ok(())
    }

    async fn delete_labelled(
        &self,
        kind: ManagedKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<(), Error> {
        let lp = ListParams::default().labels(label_selector);
        match kind {
            ManagedKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                delete_matching(api, &lp).await?;
            }
            ManagedKind::Service => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                delete_matching(api, &lp).await?;
            }
            ManagedKind::PersistentVolumeClaim => {
                let api: Api<PersistentVolumeClaim> =
                    Api::namespaced(self.client.clone(), namespace);
                delete_matching(api, &lp).await?;
            }
        }

        debug!(%kind, namespace, label_selector, "deleted matching objects");
        Ok(())
    }

    async fn statefulset_ready(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(name)
            .await?
            .map(|sts| is_statefulset_ready(&sts))
            .unwrap_or(false))
    }
}

async fn delete_if_present<K>(api: Api<K>, name: &str) -> Result<bool, Error>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn delete_matching<K>(api: Api<K>, lp: &ListParams) -> Result<(), Error>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete_collection(&DeleteParams::background(), lp).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Ready once the controller has observed the latest spec and every desired
/// replica reports ready
pub(crate) fn is_statefulset_ready(sts: &StatefulSet) -> bool {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = sts.status.as_ref() else {
        return false;
    };

    let observed_current = match (sts.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        _ => true,
    };

    observed_current && status.ready_replicas.unwrap_or(0) >= desired
}

/// Identity of a manifest needed to route a server-side apply
#[derive(Debug, PartialEq)]
struct ManifestIdentity {
    gvk: GroupVersionKind,
    name: String,
    namespace: Option<String>,
}

impl ManifestIdentity {
    fn from_value(obj: &serde_json::Value) -> Result<Self, Error> {
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization("manifest is missing kind"))?;
        let api_version = obj
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization("manifest is missing apiVersion"))?;
        let name = obj
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization("manifest is missing metadata.name"))?;
        let namespace = obj
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), api_version.to_string()),
        };

        Ok(Self {
            gvk: GroupVersionKind {
                group,
                version,
                kind: kind.to_string(),
            },
            name: name.to_string(),
            namespace,
        })
    }
}
