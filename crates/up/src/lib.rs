//! Skiff up: the orchestration engine behind `skiff up`.
//!
//! Given a canonical composition and a deployment identity, the engine
//! materializes one pod per service and one ClusterIP service per
//! port-exposing service, resolving images concurrently, gating pod creation
//! on inter-service dependencies, and driving a watch loop until every
//! service reports readiness. Cluster and image-daemon access go through the
//! capability traits in `skiff_kubehub` and `skiff_imagehub`, so the engine
//! runs identically against a real cluster or the scripted doubles in
//! [`testkit`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use skiff_core::{Composition, Identity};
use skiff_imagehub::{ImageDaemon, RegistryAuth};
use skiff_kubehub::ClusterOps;

mod app;
mod error;
mod images;
mod pods;
mod runner;
mod services;
mod status;
pub mod testkit;

pub use error::UpError;
pub use status::classify_pod;

/// Push-mode configuration: when set, every resolved image is re-tagged into
/// this registry under the deployment namespace and pushed, and pods are
/// pinned to the pushed content digest.
#[derive(Debug, Clone)]
pub struct PushImages {
    pub docker_registry: String,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct UpConfig {
    pub identity: Identity,
    pub push_images: Option<PushImages>,
    /// Credentials forwarded to the registry on push; where they come from is
    /// the caller's concern.
    pub registry_auth: Option<RegistryAuth>,
}

/// Run an operation similar to `docker-compose up` against a cluster: create
/// services and pods for every service in the composition and block until all
/// of them report ready, or the first error.
pub async fn up(
    cfg: UpConfig,
    composition: Composition,
    cluster: Arc<dyn ClusterOps>,
    daemon: Arc<dyn ImageDaemon>,
) -> Result<(), UpError> {
    runner::UpRunner::new(cfg, composition, cluster, daemon)?
        .run()
        .await
}
