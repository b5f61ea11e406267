//! Docker Engine backed implementation of [`ImageDaemon`].

use anyhow::{anyhow, Context, Result};
use bollard::auth::DockerCredentials;
use bollard::image::{CreateImageOptions, ListImagesOptions, PushImageOptions, TagImageOptions};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, warn};

use crate::{ImageDaemon, ImageDetails, ImageSummary, RegistryAuth};

/// Talks to the local Docker daemon over its default socket.
pub struct DockerDaemon {
    docker: Docker,
}

impl DockerDaemon {
    /// Connect using the environment's default daemon endpoint.
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("connecting to the docker daemon")?;
        Ok(Self { docker })
    }
}

/// Extract a `sha256:...` digest from a progress status line such as
/// `Digest: sha256:...` (pull) or `latest: digest: sha256:... size: 123` (push).
fn digest_from_status(status: &str) -> Option<String> {
    let idx = status.find("sha256:")?;
    let digest: String = status[idx..]
        .chars()
        .take_while(|c| !c.is_whitespace())
        .collect();
    Some(digest)
}

#[async_trait::async_trait]
impl ImageDaemon for DockerDaemon {
    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let options = ListImagesOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_images(Some(options))
            .await
            .context("listing local images")?;
        Ok(summaries
            .into_iter()
            .map(|s| ImageSummary {
                id: s.id,
                repo_tags: s.repo_tags,
                repo_digests: s.repo_digests,
            })
            .collect())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails> {
        let inspect = self
            .docker
            .inspect_image(reference)
            .await
            .with_context(|| format!("inspecting image {reference}"))?;
        let id = inspect
            .id
            .ok_or_else(|| anyhow!("image {reference} has no ID"))?;
        let healthcheck = inspect.config.and_then(|c| c.healthcheck).and_then(|hc| {
            skiff_core::healthcheck::from_image_config(
                &hc.test.unwrap_or_default(),
                hc.interval.unwrap_or(0),
                hc.timeout.unwrap_or(0),
                hc.retries.unwrap_or(0),
            )
        });
        Ok(ImageDetails { id, healthcheck })
    }

    async fn pull_image(&self, reference: &str) -> Result<String> {
        let options = CreateImageOptions::<String> {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None).boxed();
        let mut digest = None;
        while let Some(info) = stream
            .try_next()
            .await
            .with_context(|| format!("pulling image {reference}"))?
        {
            if let Some(error) = info.error {
                return Err(anyhow!("pulling image {reference}: {error}"));
            }
            if let Some(status) = info.status {
                debug!(image = reference, status = %status, "pull progress");
                if status.starts_with("Digest:") {
                    digest = digest_from_status(&status);
                }
            }
        }
        digest.ok_or_else(|| anyhow!("pull of {reference} reported no digest"))
    }

    async fn tag_image(&self, id: &str, reference: &str) -> Result<()> {
        let (repo, tag) = reference
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("tag target {reference} has no tag"))?;
        let options = TagImageOptions {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        self.docker
            .tag_image(id, Some(options))
            .await
            .with_context(|| format!("tagging {id} as {reference}"))
    }

    async fn push_image(&self, reference: &str, auth: Option<&RegistryAuth>) -> Result<String> {
        let (repo, tag) = reference
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("push target {reference} has no tag"))?;
        let credentials = auth.map(|a| DockerCredentials {
            username: a.username.clone(),
            password: a.password.clone(),
            serveraddress: a.server_address.clone(),
            identitytoken: a.identity_token.clone(),
            ..Default::default()
        });
        let options = PushImageOptions {
            tag: tag.to_string(),
        };
        let mut stream = self
            .docker
            .push_image(repo, Some(options), credentials)
            .boxed();
        let mut digest = None;
        while let Some(info) = stream
            .try_next()
            .await
            .with_context(|| format!("pushing image {reference}"))?
        {
            if let Some(error) = info.error {
                return Err(anyhow!("pushing image {reference}: {error}"));
            }
            if let Some(status) = info.status {
                debug!(image = reference, status = %status, "push progress");
                if status.contains("digest:") || status.starts_with("Digest:") {
                    if let Some(d) = digest_from_status(&status) {
                        digest = Some(d);
                    }
                }
            }
        }
        digest.ok_or_else(|| {
            warn!(image = reference, "push stream ended without a digest line");
            anyhow!("push of {reference} reported no digest")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::digest_from_status;

    #[test]
    fn digest_lines_parse() {
        assert_eq!(
            digest_from_status("Digest: sha256:abc123").as_deref(),
            Some("sha256:abc123")
        );
        assert_eq!(
            digest_from_status("latest: digest: sha256:def456 size: 1234").as_deref(),
            Some("sha256:def456")
        );
        assert_eq!(digest_from_status("Pulling fs layer"), None);
    }
}
