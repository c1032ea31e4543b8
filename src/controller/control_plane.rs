//! ControlPlane controller implementation
//!
//! Level-triggered: every pass re-reads the live object and derives its
//! actions from what it observes, so a pass that fails half way is simply
//! repeated. The controller finalizer is the only gate on deletion; it is
//! released once the deinit planner has finished.
//!
//! Lifecycle: (unset) -> Initializing -> Running, and Terminating once
//! deletion has been requested.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{ControlPlane, ControlPlanePhase, ControlPlaneStatus};
use crate::planner::{EtcdPlannerFactory, KubeManifestClient, PlannerFactory};
use crate::template::ManifestRenderer;
use crate::{Error, FIELD_MANAGER};

/// Delay before re-checking a freshly registered resource
const REGISTER_REQUEUE: Duration = Duration::from_secs(1);

/// Delay before retrying a failed reconcile
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Default image for the etcd init container that ships the strata binary
pub const DEFAULT_BOOTSTRAP_IMAGE: &str = "ghcr.io/strata-dev/strata:latest";

/// Trait abstracting Kubernetes client operations for ControlPlane
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production. Both writes return the object as stored
/// by the API server so the next write carries a fresh resourceVersion.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Fetch the live object; `None` once it is gone
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ControlPlane>, Error>;

    /// Replace `metadata.finalizers`
    ///
    /// The patch carries the observed resourceVersion, so a concurrent
    /// writer surfaces as a 409 conflict.
    async fn update_finalizers(
        &self,
        cp: &ControlPlane,
        finalizers: Vec<String>,
    ) -> Result<ControlPlane, Error>;

    /// Write the status subresource
    async fn patch_status(
        &self,
        cp: &ControlPlane,
        status: &ControlPlaneStatus,
    ) -> Result<ControlPlane, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeControlPlaneClient {
    client: Client,
}

impl KubeControlPlaneClient {
    /// Create a new KubeControlPlaneClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, cp: &ControlPlane) -> Result<Api<ControlPlane>, Error> {
        let namespace = cp
            .namespace()
            .ok_or_else(|| Error::validation("ControlPlane must be namespaced"))?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

#[async_trait]
impl ControlPlaneClient for KubeControlPlaneClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ControlPlane>, Error> {
        let api: Api<ControlPlane> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_finalizers(
        &self,
        cp: &ControlPlane,
        finalizers: Vec<String>,
    ) -> Result<ControlPlane, Error> {
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": cp.resource_version(),
                "finalizers": finalizers
            }
        });

        let updated = self
            .api(cp)?
            .patch(
                &cp.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(updated)
    }

    async fn patch_status(
        &self,
        cp: &ControlPlane,
        status: &ControlPlaneStatus,
    ) -> Result<ControlPlane, Error> {
        let patch = serde_json::json!({ "status": status });

        let updated = self
            .api(cp)?
            .patch_status(
                &cp.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(updated)
    }
}

/// Controller context containing shared state and clients
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .bootstrap_image("ghcr.io/strata-dev/strata:v0.1.0")
///     .build()?;
/// ```
pub struct Context {
    /// ControlPlane reads and writes (trait object for testability)
    pub control_planes: Arc<dyn ControlPlaneClient>,
    /// Builds the init and deinit planners
    pub planners: Arc<dyn PlannerFactory>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom mock clients
    ///
    /// For production code, use [`Context::builder`].
    #[cfg(test)]
    pub fn for_testing(
        control_planes: Arc<dyn ControlPlaneClient>,
        planners: Arc<dyn PlannerFactory>,
    ) -> Self {
        Self {
            control_planes,
            planners,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    control_planes: Option<Arc<dyn ControlPlaneClient>>,
    planners: Option<Arc<dyn PlannerFactory>>,
    bootstrap_image: String,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            control_planes: None,
            planners: None,
            bootstrap_image: DEFAULT_BOOTSTRAP_IMAGE.to_string(),
            ready_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Image shipping the strata binary into etcd pods
    pub fn bootstrap_image(mut self, image: impl Into<String>) -> Self {
        self.bootstrap_image = image.into();
        self
    }

    /// Upper bound on waiting for etcd readiness during init
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Interval between etcd readiness checks
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the ControlPlane client (primarily for testing)
    pub fn control_plane_client(mut self, client: Arc<dyn ControlPlaneClient>) -> Self {
        self.control_planes = Some(client);
        self
    }

    /// Override the planner factory (primarily for testing)
    pub fn planner_factory(mut self, planners: Arc<dyn PlannerFactory>) -> Self {
        self.planners = Some(planners);
        self
    }

    /// Build the Context
    ///
    /// # Errors
    ///
    /// Fails if the embedded manifest templates do not parse.
    pub fn build(self) -> Result<Context, Error> {
        let planners: Arc<dyn PlannerFactory> = match self.planners {
            Some(planners) => planners,
            None => Arc::new(EtcdPlannerFactory::new(
                Arc::new(KubeManifestClient::new(self.client.clone())),
                Arc::new(ManifestRenderer::new()?),
                self.bootstrap_image,
                self.ready_timeout,
                self.poll_interval,
            )),
        };

        Ok(Context {
            control_planes: self
                .control_planes
                .unwrap_or_else(|| Arc::new(KubeControlPlaneClient::new(self.client.clone()))),
            planners,
        })
    }
}

/// Reconcile a ControlPlane resource
///
/// The object passed in identifies which resource to look at; its contents
/// are ignored in favour of a fresh read.
#[instrument(
    skip(cp, ctx),
    fields(control_plane = %cp.name_any(), namespace = %cp.namespace().unwrap_or_default())
)]
pub async fn reconcile(cp: Arc<ControlPlane>, ctx: Arc<Context>) -> Result<Action, Error> {
    let started = Instant::now();
    debug!("started syncing");

    let namespace = cp
        .namespace()
        .ok_or_else(|| Error::validation("ControlPlane must be namespaced"))?;
    let result = sync(&namespace, &cp.name_any(), &ctx).await;

    debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "finished syncing"
    );
    result
}

async fn sync(namespace: &str, name: &str, ctx: &Context) -> Result<Action, Error> {
    let Some(cp) = ctx.control_planes.get(namespace, name).await? else {
        debug!("resource no longer exists");
        return Ok(Action::await_change());
    };

    if cp.is_deleting() {
        return finalize(cp, ctx).await;
    }

    match (cp.has_controller_finalizer(), cp.phase()) {
        (false, _) | (_, None) => register(cp, ctx).await,
        (true, Some(ControlPlanePhase::Initializing)) => initialize(cp, ctx).await,
        (true, Some(ControlPlanePhase::Running)) => Ok(Action::await_change()),
        (true, Some(ControlPlanePhase::Terminating)) => {
            warn!("terminating phase without a deletion request");
            Ok(Action::await_change())
        }
    }
}

/// Add the finalizer and the initial phase, whichever is missing
async fn register(cp: ControlPlane, ctx: &Context) -> Result<Action, Error> {
    let mut cp = cp;

    if !cp.has_controller_finalizer() {
        info!("adding finalizer");
        cp = ctx
            .control_planes
            .update_finalizers(&cp, cp.finalizers_with_controller())
            .await?;
    }

    if cp.phase().is_none() {
        set_phase(ctx, cp, ControlPlanePhase::Initializing).await?;
    }

    Ok(Action::requeue(REGISTER_REQUEUE))
}

async fn initialize(cp: ControlPlane, ctx: &Context) -> Result<Action, Error> {
    info!("running init planner");
    ctx.planners.init(&cp)?.execute().await?;

    set_phase(ctx, cp, ControlPlanePhase::Running).await?;
    info!("control plane running");
    Ok(Action::await_change())
}

async fn finalize(cp: ControlPlane, ctx: &Context) -> Result<Action, Error> {
    if !cp.has_controller_finalizer() {
        debug!("deleting without our finalizer, nothing to do");
        return Ok(Action::await_change());
    }

    let cp = set_phase(ctx, cp, ControlPlanePhase::Terminating).await?;

    info!("running deinit planner");
    ctx.planners.deinit(&cp)?.execute().await?;

    info!("removing finalizer");
    ctx.control_planes
        .update_finalizers(&cp, cp.finalizers_without_controller())
        .await?;
    Ok(Action::await_change())
}

/// Write `phase` unless it is already the observed phase
async fn set_phase(
    ctx: &Context,
    cp: ControlPlane,
    phase: ControlPlanePhase,
) -> Result<ControlPlane, Error> {
    if cp.phase() == Some(phase) {
        return Ok(cp);
    }

    info!(from = ?cp.phase(), to = %phase, "updating phase");
    ctx.control_planes
        .patch_status(&cp, &cp.status_with_phase(phase))
        .await
}

/// Error policy for the controller
///
/// Failures are retried after a fixed delay; the runtime owns the retry.
pub fn error_policy(cp: Arc<ControlPlane>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        control_plane = %cp.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}
