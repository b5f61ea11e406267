//! The convergence loop: bootstrap, concurrent image resolution and service
//! materialization, dependency-gated pod creation, and the watch-driven
//! readiness loop.

use std::collections::HashSet;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{HostAlias, Pod};
use kube::core::WatchEvent;
use skiff_core::{Composition, DependsOnCondition, PodStatusLevel};
use skiff_imagehub::ImageDaemon;
use skiff_kubehub::{ClusterOps, StreamHandle};
use tracing::debug;

use crate::app::{App, AppTable};
use crate::images::{self, ImageResolver};
use crate::services::create_services_and_collect_host_aliases;
use crate::status::classify_pod;
use crate::{pods, UpConfig, UpError};

type HostAliasCell = tokio::sync::OnceCell<Result<Arc<Vec<HostAlias>>, UpError>>;

pub(crate) struct UpRunner {
    cfg: Arc<UpConfig>,
    composition: Arc<Composition>,
    cluster: Arc<dyn ClusterOps>,
    apps: Arc<AppTable>,
    resolver: Arc<ImageResolver>,
    host_aliases: Arc<HostAliasCell>,
    /// Apps that have not been given a pod yet.
    without_pods: HashSet<String>,
}

/// Host-alias memoization: services are created and their IPs collected
/// exactly once per run; every caller, background or loop, observes the same
/// table or the same error.
async fn host_aliases_once(
    cell: &HostAliasCell,
    cluster: &Arc<dyn ClusterOps>,
    cfg: &UpConfig,
    apps: &AppTable,
    composition: &Composition,
) -> Result<Arc<Vec<HostAlias>>, UpError> {
    cell.get_or_init(|| async {
        create_services_and_collect_host_aliases(&**cluster, &cfg.identity, apps, composition)
            .await
            .map(Arc::new)
    })
    .await
    .clone()
}

impl UpRunner {
    pub fn new(
        cfg: UpConfig,
        composition: Composition,
        cluster: Arc<dyn ClusterOps>,
        daemon: Arc<dyn ImageDaemon>,
    ) -> Result<Self, UpError> {
        let cfg = Arc::new(cfg);
        let apps = Arc::new(AppTable::build(&cfg.identity, &composition)?);
        let without_pods = composition.services.keys().cloned().collect();
        Ok(Self {
            resolver: Arc::new(ImageResolver::new(daemon, cfg.clone())),
            cfg,
            composition: Arc::new(composition),
            cluster,
            apps,
            host_aliases: Arc::new(HostAliasCell::new()),
            without_pods,
        })
    }

    pub async fn run(mut self) -> Result<(), UpError> {
        // Begin pulling and pushing images immediately, one task per app.
        for app in self.apps.iter() {
            let resolver = self.resolver.clone();
            let app = app.clone();
            let service = self.composition.services[&app.name].clone();
            tokio::spawn(async move {
                let _ = images::resolve_once(&resolver, &app, &service).await;
            });
        }
        // Begin creating services and collecting their cluster IPs; pods need
        // them for their host aliases.
        {
            let cell = self.host_aliases.clone();
            let cluster = self.cluster.clone();
            let cfg = self.cfg.clone();
            let apps = self.apps.clone();
            let composition = self.composition.clone();
            tokio::spawn(async move {
                let _ = host_aliases_once(&cell, &cluster, &cfg, &apps, &composition).await;
            });
        }

        // Seed pods for apps without predecessors. This implicitly awaits the
        // app's image resolution and the host-alias table.
        for name in self.apps.names_sorted() {
            if !self.composition.services[&name].depends_on.is_empty() {
                continue;
            }
            let app = self.apps.get(&name).cloned().ok_or_else(|| {
                UpError::Validation(format!("unknown service {name}"))
            })?;
            let pod = self.create_pod(&app).await?;
            println!(
                "app {}: created pod {} because all its dependency conditions are met",
                app.name,
                pod.metadata.name.as_deref().unwrap_or(&app.resource_name)
            );
            self.without_pods.remove(&name);
        }

        // Catch up on pods that already exist under our environment label.
        let selector = self.cfg.identity.label_selector();
        let list = self.cluster.list_pods(&selector).await?;
        for pod in &list.items {
            self.observe_pod(pod)?;
        }
        self.create_pods_if_needed().await?;

        if !self.all_ready() {
            let handle = self
                .cluster
                .watch_pods(&selector, &list.resource_version)
                .await?;
            let StreamHandle { mut rx, cancel } = handle;
            let _cancel = cancel;
            loop {
                let Some(event) = rx.recv().await else {
                    return Err(UpError::WatchClosed);
                };
                match event {
                    WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                        self.observe_pod(&pod)?;
                    }
                    WatchEvent::Deleted(pod) => {
                        if self.apps.find_by_meta(&pod.metadata)?.is_some() {
                            return Err(UpError::ModifiedExternally);
                        }
                    }
                    other => return Err(UpError::Protocol(format!("{other:?}"))),
                }
                self.create_pods_if_needed().await?;
                if self.all_ready() {
                    break;
                }
            }
        }
        println!("pods ready ({}/{})", self.apps.len(), self.apps.len());
        Ok(())
    }

    /// Classify a pod event and raise the owning app's observed status.
    /// Downgrades are ignored; every raise prints a progress line.
    fn observe_pod(&self, pod: &Pod) -> Result<(), UpError> {
        let Some(app) = self.apps.find_by_meta(&pod.metadata)? else {
            return Ok(());
        };
        let level = classify_pod(pod)?;
        if app.raise_observed(level) {
            println!("app {}: pod status {}", app.name, level);
        }
        Ok(())
    }

    fn all_ready(&self) -> bool {
        self.apps
            .iter()
            .all(|app| app.observed() == PodStatusLevel::Ready)
    }

    /// The dependency gate: an app may launch once every predecessor has
    /// reached at least its required status. The check is `>=`, not `==`, so
    /// a predecessor that jumped straight to ready still satisfies a
    /// `service_started` condition.
    fn dependencies_met(&self, name: &str) -> bool {
        self.composition.services[name]
            .depends_on
            .iter()
            .all(|(dep, condition)| {
                let Some(dep_app) = self.apps.get(dep) else {
                    return false;
                };
                let required = match condition {
                    DependsOnCondition::Healthy => PodStatusLevel::Ready,
                    DependsOnCondition::Started => PodStatusLevel::Started,
                };
                dep_app.observed() >= required
            })
    }

    /// Create pods for every pending app whose dependency gate is open.
    async fn create_pods_if_needed(&mut self) -> Result<(), UpError> {
        let mut pending: Vec<String> = self.without_pods.iter().cloned().collect();
        pending.sort();
        for name in pending {
            if !self.dependencies_met(&name) {
                continue;
            }
            let app = self.apps.get(&name).cloned().ok_or_else(|| {
                UpError::Validation(format!("unknown service {name}"))
            })?;
            let pod = self.create_pod(&app).await?;
            let mut conditions: Vec<String> = self.composition.services[&name]
                .depends_on
                .iter()
                .map(|(dep, condition)| match condition {
                    DependsOnCondition::Healthy => format!("{dep}: ready"),
                    DependsOnCondition::Started => format!("{dep}: running"),
                })
                .collect();
            conditions.sort();
            println!(
                "app {}: created pod {} because its dependency conditions are met ({})",
                app.name,
                pod.metadata.name.as_deref().unwrap_or(&app.resource_name),
                conditions.join(", ")
            );
            self.without_pods.remove(&name);
        }
        Ok(())
    }

    /// Build and submit one pod. Blocks on the app's image resolution and on
    /// the host-alias table; both must have succeeded.
    async fn create_pod(&self, app: &Arc<App>) -> Result<Pod, UpError> {
        let service = &self.composition.services[&app.name];
        let resolved = images::resolve_once(&self.resolver, app, service).await?;
        let aliases = host_aliases_once(
            &self.host_aliases,
            &self.cluster,
            &self.cfg,
            &self.apps,
            &self.composition,
        )
        .await?;
        let pod = pods::build_pod(&self.cfg.identity, app, service, &resolved, &aliases);
        debug!(app = %app.name, pod = ?pod.metadata.name, "submitting pod");
        let created = self.cluster.create_pod(&pod).await?;
        Ok(created)
    }
}
