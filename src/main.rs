//! Strata Operator - ControlPlane lifecycle and etcd membership bootstrap

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use strata::bootstrap::{member_bootstrap, BootstrapConfig};
use strata::controller::{error_policy, reconcile, Context, DEFAULT_BOOTSTRAP_IMAGE};
use strata::crd::ControlPlane;
use strata::telemetry::{init_tracing, LogFormat};
use strata::FIELD_MANAGER;

/// Strata - CRD-driven operator for control planes backed by etcd
#[derive(Parser, Debug)]
#[command(name = "strata", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches ControlPlane resources in all namespaces and drives each one
    /// through registration, etcd initialization and teardown.
    Controller(ControllerArgs),

    /// etcd member lifecycle, run inside the etcd StatefulSet pods
    #[command(subcommand)]
    Etcd(EtcdCommands),

    /// Copy this binary to a path (used by the etcd init container)
    InstallBinary {
        /// Destination path
        #[arg(long)]
        dest: PathBuf,
    },
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Image the etcd init container copies the strata binary from
    #[arg(long, env = "STRATA_BOOTSTRAP_IMAGE", default_value = DEFAULT_BOOTSTRAP_IMAGE)]
    bootstrap_image: String,

    /// Seconds to wait for the etcd StatefulSet to become ready
    #[arg(long, env = "STRATA_READY_TIMEOUT_SECS", default_value_t = 300)]
    ready_timeout_secs: u64,

    /// Seconds between etcd readiness checks
    #[arg(long, env = "STRATA_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,
}

#[derive(Subcommand, Debug)]
enum EtcdCommands {
    /// Container entrypoint: seed, join or restart, then exec etcd
    Start(BootstrapConfig),

    /// preStop hook: leave the cluster if this member was added by scaling
    Stop(BootstrapConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_format);

    if cli.crd {
        let crd = serde_yaml::to_string(&ControlPlane::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Etcd(EtcdCommands::Start(config))) => run_etcd_start(config).await,
        Some(Commands::Etcd(EtcdCommands::Stop(config))) => run_etcd_stop(config).await,
        Some(Commands::InstallBinary { dest }) => install_binary(dest).await,
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => {
            run_controller(ControllerArgs {
                bootstrap_image: DEFAULT_BOOTSTRAP_IMAGE.to_string(),
                ready_timeout_secs: 300,
                poll_interval_secs: 5,
            })
            .await
        }
    }
}

/// Ensure the ControlPlane CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so
/// the schema always matches the running version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing ControlPlane CRD...");
    crds.patch(
        "controlplanes.operator.strata.dev",
        &params,
        &Patch::Apply(&ControlPlane::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ControlPlane CRD: {}", e))?;

    tracing::info!("ControlPlane CRD installed/updated");
    Ok(())
}

/// Run the ControlPlane controller until a shutdown signal arrives
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!(
        bootstrap_image = %args.bootstrap_image,
        ready_timeout_secs = args.ready_timeout_secs,
        poll_interval_secs = args.poll_interval_secs,
        "Starting Strata controller..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let ctx = Arc::new(
        Context::builder(client.clone())
            .bootstrap_image(args.bootstrap_image)
            .ready_timeout(Duration::from_secs(args.ready_timeout_secs))
            .poll_interval(Duration::from_secs(args.poll_interval_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build controller context: {}", e))?,
    );

    let control_planes: Api<ControlPlane> = Api::all(client);

    Controller::new(control_planes, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "ControlPlane reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "ControlPlane reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Strata controller shutting down");
    Ok(())
}

async fn run_etcd_start(config: BootstrapConfig) -> anyhow::Result<()> {
    let member = member_bootstrap(&config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to prepare etcd member: {}", e))?;
    let mode = member
        .startup()
        .await
        .map_err(|e| anyhow::anyhow!("etcd member {} failed to start: {}", member.member().name, e))?;

    // Only reached when the launcher returns instead of replacing the process
    tracing::info!(?mode, "etcd launcher returned");
    Ok(())
}

async fn run_etcd_stop(config: BootstrapConfig) -> anyhow::Result<()> {
    let member = member_bootstrap(&config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to prepare etcd member: {}", e))?;
    let outcome = member
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("etcd member {} failed to leave: {}", member.member().name, e))?;

    tracing::info!(member = %member.member().name, ?outcome, "etcd member shutdown complete");
    Ok(())
}

/// Copy the running executable to `dest` and make it executable
async fn install_binary(dest: PathBuf) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let source = std::env::current_exe()
        .map_err(|e| anyhow::anyhow!("Failed to locate running executable: {}", e))?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", parent.display(), e))?;
    }

    tokio::fs::copy(&source, &dest).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to copy {} to {}: {}",
            source.display(),
            dest.display(),
            e
        )
    })?;
    tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to mark {} executable: {}", dest.display(), e))?;

    tracing::info!(source = %source.display(), dest = %dest.display(), "strata binary installed");
    Ok(())
}
