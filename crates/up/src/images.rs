//! Image resolution: produce the pod-visible image reference and the image's
//! embedded healthcheck for each service, pulling, tagging, and pushing as
//! needed. Resolution is memoized per app; the local image index is acquired
//! once per run and shared by every resolver.

use std::sync::Arc;

use skiff_core::ServiceDef;
use skiff_imagehub::{refs, ImageDaemon, ImageRef, LocalImages};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::app::{App, ResolvedImage};
use crate::{UpConfig, UpError};

pub(crate) struct ImageResolver {
    daemon: Arc<dyn ImageDaemon>,
    cfg: Arc<UpConfig>,
    local: OnceCell<Result<Arc<LocalImages>, UpError>>,
}

impl ImageResolver {
    pub fn new(daemon: Arc<dyn ImageDaemon>, cfg: Arc<UpConfig>) -> Self {
        Self {
            daemon,
            cfg,
            local: OnceCell::new(),
        }
    }

    /// The local image index, acquired once per run. Errors are cached so
    /// every resolver observes the same result.
    async fn local_images(&self) -> Result<Arc<LocalImages>, UpError> {
        self.local
            .get_or_init(|| async {
                self.daemon
                    .list_images()
                    .await
                    .map(|summaries| Arc::new(LocalImages::from_summaries(summaries)))
                    .map_err(UpError::from)
            })
            .await
            .clone()
    }

    /// Resolve one service's image. See [`resolve_once`] for the memoized
    /// entry point.
    async fn resolve(&self, app: &App, service: &ServiceDef) -> Result<ResolvedImage, UpError> {
        let source_image = service.image.as_str();
        if source_image.is_empty() {
            return Err(UpError::Validation(format!(
                "service {} has no image or image is the empty string, and building images is not supported",
                app.name
            )));
        }
        let local = self.local_images().await?;
        let reference = refs::parse_any_reference(source_image, &local)?;
        let mut source_id = refs::resolve_local_image_id(&reference, &local);
        let mut pod_image: Option<String> = None;

        if source_id.is_none() {
            let Some(named) = reference.named() else {
                return Err(UpError::Validation(format!(
                    "could not find image {source_image} locally, and building images is not supported"
                )));
            };
            println!("app {}: pulling image {}", app.name, named.whole());
            let digest = self.daemon.pull_image(&named.whole()).await?;
            debug!(app = %app.name, digest = %digest, "pull complete");
            let fresh = self.daemon.list_images().await?;
            let (id, canonical) = refs::resolve_after_pull(named, &digest, &fresh);
            if id.is_none() {
                return Err(UpError::Upstream(format!(
                    "could not get id of pulled image {source_image}, this is either a bug or images were removed by an external process (please try again)"
                )));
            }
            source_id = id;
            pod_image = Some(canonical);
        }
        let source_id = source_id.unwrap_or_default();
        let details = self.daemon.inspect_image(&source_id).await?;

        let pod_image = if let Some(push) = &self.cfg.push_images {
            let destination = format!(
                "{}/{}/{}",
                push.docker_registry, self.cfg.identity.namespace, app.name_encoded
            );
            let push_reference = format!("{destination}:latest");
            self.daemon.tag_image(&source_id, &push_reference).await?;
            println!("app {}: pushing image {push_reference}", app.name);
            let digest = self
                .daemon
                .push_image(&push_reference, self.cfg.registry_auth.as_ref())
                .await?;
            // Pin to the pushed content digest, never the :latest tag, so
            // concurrent pod creations cannot resolve to different images.
            format!("{destination}@{digest}")
        } else if let Some(canonical) = pod_image {
            canonical
        } else if matches!(reference, ImageRef::Named(_)) {
            source_image.to_string()
        } else {
            return Err(UpError::Validation(format!(
                "image reference {source_image} is likely unstable, please enable pushing of images or use named image references to improve reliability"
            )));
        };

        Ok(ResolvedImage {
            healthcheck: details.healthcheck,
            pod_image,
        })
    }
}

/// Memoized image resolution: the first caller computes, every later caller
/// (including concurrent background tasks) observes the same result, errors
/// included.
pub(crate) async fn resolve_once(
    resolver: &ImageResolver,
    app: &App,
    service: &ServiceDef,
) -> Result<ResolvedImage, UpError> {
    app.image
        .get_or_init(|| resolver.resolve(app, service))
        .await
        .clone()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use skiff_core::{Composition, Identity, ServiceDef};

    use super::*;
    use crate::app::AppTable;
    use crate::testkit::FakeDaemon;

    const DIGEST: &str =
        "sha256:1111111111111111111111111111111111111111111111111111111111111111";

    fn cfg() -> Arc<UpConfig> {
        Arc::new(UpConfig {
            identity: Identity {
                namespace: "demo".into(),
                environment_label: "skiff.io/environment".into(),
                environment_id: "env1".into(),
            },
            push_images: None,
            registry_auth: None,
        })
    }

    fn table_for(name: &str, image: &str) -> (AppTable, ServiceDef) {
        let service = ServiceDef {
            image: image.to_string(),
            ..Default::default()
        };
        let mut composition = Composition::default();
        composition
            .services
            .insert(name.to_string(), service.clone());
        (
            AppTable::build(&cfg().identity, &composition).unwrap(),
            service,
        )
    }

    #[tokio::test]
    async fn resolution_is_memoized_including_the_local_index() {
        let daemon = Arc::new(FakeDaemon::new());
        daemon.add_local_image("busybox:1.36", "sha256:aaaa", None);
        let resolver = ImageResolver::new(daemon.clone(), cfg());
        let (table, service) = table_for("worker", "busybox:1.36");
        let app = table.get("worker").unwrap();

        let first = resolve_once(&resolver, app, &service).await.unwrap();
        let second = resolve_once(&resolver, app, &service).await.unwrap();
        assert_eq!(first.pod_image, "busybox:1.36");
        assert_eq!(first.pod_image, second.pod_image);
        assert_eq!(daemon.list_calls(), 1);
        assert_eq!(daemon.pulled(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn missing_image_is_pulled_once_and_pinned() {
        let daemon = Arc::new(FakeDaemon::new());
        daemon.add_pullable("busybox:1.36", DIGEST, "sha256:bbbb", None);
        let resolver = ImageResolver::new(daemon.clone(), cfg());
        let (table, service) = table_for("worker", "busybox:1.36");
        let app = table.get("worker").unwrap();

        let first = resolve_once(&resolver, app, &service).await.unwrap();
        assert_eq!(first.pod_image, format!("busybox@{DIGEST}"));
        let second = resolve_once(&resolver, app, &service).await.unwrap();
        assert_eq!(second.pod_image, first.pod_image);
        // Exactly one pull, whatever qualified form the daemon was handed.
        let pulled = daemon.pulled();
        assert_eq!(pulled.len(), 1);
        assert!(pulled[0].ends_with("busybox:1.36"));
    }

    #[tokio::test]
    async fn errors_are_memoized_too() {
        let daemon = Arc::new(FakeDaemon::new());
        let resolver = ImageResolver::new(daemon.clone(), cfg());
        let (table, service) = table_for("worker", "");
        let app = table.get("worker").unwrap();

        let first = resolve_once(&resolver, app, &service).await.unwrap_err();
        let second = resolve_once(&resolver, app, &service).await.unwrap_err();
        assert_eq!(first, second);
        assert!(matches!(first, UpError::Validation(_)));
    }

    #[tokio::test]
    async fn bare_local_id_without_push_is_unstable() {
        let daemon = Arc::new(FakeDaemon::new());
        daemon.add_local_image("busybox:1.36", "sha256:abcd1234", None);
        let resolver = ImageResolver::new(daemon.clone(), cfg());
        let (table, service) = table_for("worker", "abcd1234");
        let app = table.get("worker").unwrap();

        let err = resolve_once(&resolver, app, &service).await.unwrap_err();
        assert!(err.to_string().contains("likely unstable"));
    }

    #[tokio::test]
    async fn push_mode_tags_pushes_and_pins_to_the_push_digest() {
        let daemon = Arc::new(FakeDaemon::new());
        daemon.add_local_image("busybox:1.36", "sha256:aaaa", None);
        daemon.set_push_digest(DIGEST);
        let cfg = Arc::new(UpConfig {
            push_images: Some(crate::PushImages {
                docker_registry: "registry.local:5000".into(),
            }),
            ..(*cfg()).clone()
        });
        let resolver = ImageResolver::new(daemon.clone(), cfg);
        let (table, service) = table_for("worker", "busybox:1.36");
        let app = table.get("worker").unwrap();

        let resolved = resolve_once(&resolver, app, &service).await.unwrap();
        assert_eq!(
            resolved.pod_image,
            format!("registry.local:5000/demo/worker@{DIGEST}")
        );
        assert_eq!(
            daemon.tagged(),
            vec![(
                "sha256:aaaa".to_string(),
                "registry.local:5000/demo/worker:latest".to_string()
            )]
        );
        assert_eq!(
            daemon.pushed(),
            vec!["registry.local:5000/demo/worker:latest".to_string()]
        );
    }
}
