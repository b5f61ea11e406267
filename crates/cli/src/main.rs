#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skiff_core::Identity;
use skiff_imagehub::{DockerDaemon, ImageDaemon, RegistryAuth};
use skiff_kubehub::{ClusterOps, KubeCluster};
use skiff_up::{PushImages, UpConfig};
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "skiff", version, about = "Deploy a compose file onto a Kubernetes cluster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create services and pods for every service in the composition and wait
    /// until all of them report ready.
    Up {
        /// Compose file (default: discovered in the current directory)
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,

        /// Target namespace
        #[arg(short = 'n', long = "namespace", default_value = "default")]
        namespace: String,

        /// Deployment identity: the value of the environment label on every
        /// created resource, and the suffix of every resource name
        #[arg(long = "env-id")]
        env_id: String,

        /// Label key carrying the deployment identity
        #[arg(long = "env-label", default_value = "skiff.io/environment")]
        env_label: String,

        /// Push resolved images into this registry (under the namespace) and
        /// pin pods to the pushed digests
        #[arg(long = "push-registry")]
        push_registry: Option<String>,

        /// Registry username for pushes (or SKIFF_REGISTRY_USERNAME)
        #[arg(long = "registry-username")]
        registry_username: Option<String>,

        /// Registry password for pushes (or SKIFF_REGISTRY_PASSWORD)
        #[arg(long = "registry-password")]
        registry_password: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("SKIFF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SKIFF_METRICS_ADDR; metrics disabled");
        }
    }
}

fn registry_auth(
    registry: &str,
    username: Option<String>,
    password: Option<String>,
) -> Option<RegistryAuth> {
    let username = username.or_else(|| std::env::var("SKIFF_REGISTRY_USERNAME").ok());
    let password = password.or_else(|| std::env::var("SKIFF_REGISTRY_PASSWORD").ok());
    if username.is_none() && password.is_none() {
        return None;
    }
    Some(RegistryAuth {
        username,
        password,
        server_address: Some(registry.to_string()),
        identity_token: None,
    })
}

async fn run_up(
    file: Option<PathBuf>,
    namespace: String,
    env_id: String,
    env_label: String,
    push_registry: Option<String>,
    registry_username: Option<String>,
    registry_password: Option<String>,
) -> Result<()> {
    let file = match file {
        Some(file) => file,
        None => skiff_compose::find_compose_file(&std::env::current_dir()?)?,
    };
    debug!(file = %file.display(), "loading composition");
    let composition = skiff_compose::load_file(&file)?;

    let identity = Identity {
        namespace: namespace.clone(),
        environment_label: env_label,
        environment_id: env_id,
    };
    let registry_auth = push_registry
        .as_deref()
        .and_then(|registry| registry_auth(registry, registry_username, registry_password));
    let cfg = UpConfig {
        identity,
        push_images: push_registry.map(|docker_registry| PushImages { docker_registry }),
        registry_auth,
    };

    let cluster = KubeCluster::connect(&namespace).await?;
    let daemon = DockerDaemon::connect()?;
    skiff_up::up(
        cfg,
        composition,
        Arc::new(cluster) as Arc<dyn ClusterOps>,
        Arc::new(daemon) as Arc<dyn ImageDaemon>,
    )
    .await
    .context("deployment failed")
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Up {
            file,
            namespace,
            env_id,
            env_label,
            push_registry,
            registry_username,
            registry_password,
        } => {
            run_up(
                file,
                namespace,
                env_id,
                env_label,
                push_registry,
                registry_username,
                registry_password,
            )
            .await
        }
    };
    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
