//! Skiff imagehub: the image-daemon capability surface and its Docker-backed
//! implementation, plus image reference parsing and local index resolution.

#![forbid(unsafe_code)]

use anyhow::Result;
use skiff_core::Healthcheck;

mod docker;
pub mod refs;

pub use docker::DockerDaemon;
pub use refs::{normalize_reference, parse_any_reference, ImageRef, LocalImages};

/// One local image as reported by the daemon's image list.
#[derive(Debug, Clone, Default)]
pub struct ImageSummary {
    /// Content-addressed image ID (`sha256:...`).
    pub id: String,
    /// Familiar `repo:tag` names pointing at this image.
    pub repo_tags: Vec<String>,
    /// `repo@sha256:...` digest names pointing at this image.
    pub repo_digests: Vec<String>,
}

/// Result of inspecting a single image.
#[derive(Debug, Clone)]
pub struct ImageDetails {
    pub id: String,
    /// Healthcheck embedded in the image config, normalized.
    pub healthcheck: Option<Healthcheck>,
}

/// Credentials forwarded to the registry on push. The source is the caller's
/// concern; nothing here reads cluster configuration.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub server_address: Option<String>,
    pub identity_token: Option<String>,
}

/// Capabilities the engine consumes from the container image daemon.
#[async_trait::async_trait]
pub trait ImageDaemon: Send + Sync {
    /// List all local images.
    async fn list_images(&self) -> Result<Vec<ImageSummary>>;

    /// Inspect an image by ID or reference.
    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails>;

    /// Pull a named reference; returns the content digest of the pulled image.
    async fn pull_image(&self, reference: &str) -> Result<String>;

    /// Tag an image ID with a new reference.
    async fn tag_image(&self, id: &str, reference: &str) -> Result<()>;

    /// Push a reference; returns the content digest reported by the registry.
    async fn push_image(&self, reference: &str, auth: Option<&RegistryAuth>) -> Result<String>;
}
