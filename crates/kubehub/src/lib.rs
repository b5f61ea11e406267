//! Skiff kubehub: the cluster capability surface and its kube-backed
//! implementation. The engine consumes per-namespace create/list/watch on
//! Services and Pods; watches are raw streams anchored at a list's resource
//! version so the caller sees every event type, including deletions.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams, PostParams, WatchParams};
use kube::core::WatchEvent;
use kube::Client;
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const WATCH_QUEUE_CAP: usize = 64;

/// Cancellation handle for an in-flight watch.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }

    /// A handle with nothing to cancel, for streams that end on their own.
    pub fn noop() -> Self {
        Self { tx: None }
    }
}

/// A watch stream: receive events from `rx`, stop early via `cancel`.
/// Dropping the handle stops the underlying watch.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// A list result: the items plus the resource version anchoring a subsequent
/// watch.
#[derive(Debug, Clone)]
pub struct ResourceList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// Capabilities the engine consumes from the cluster API.
#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync {
    async fn create_service(&self, service: &Service) -> Result<Service>;
    async fn list_services(&self, label_selector: &str) -> Result<ResourceList<Service>>;
    async fn watch_services(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<StreamHandle<WatchEvent<Service>>>;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;
    async fn list_pods(&self, label_selector: &str) -> Result<ResourceList<Pod>>;
    async fn watch_pods(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<StreamHandle<WatchEvent<Pod>>>;
}

/// Kube-backed [`ClusterOps`] scoped to one namespace.
pub struct KubeCluster {
    services: Api<Service>,
    pods: Api<Pod>,
}

impl KubeCluster {
    /// Connect using the ambient kubeconfig / in-cluster environment.
    pub async fn connect(namespace: &str) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("initializing kubernetes client")?;
        Ok(Self::with_client(client, namespace))
    }

    pub fn with_client(client: Client, namespace: &str) -> Self {
        Self {
            services: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
        }
    }
}

async fn list<K>(api: &Api<K>, label_selector: &str) -> Result<ResourceList<K>>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let lp = ListParams::default().labels(label_selector);
    let list = api.list(&lp).await?;
    Ok(ResourceList {
        resource_version: list.metadata.resource_version.unwrap_or_default(),
        items: list.items,
    })
}

async fn watch<K>(
    api: &Api<K>,
    label_selector: &str,
    resource_version: &str,
) -> Result<StreamHandle<WatchEvent<K>>>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let wp = WatchParams::default().labels(label_selector);
    let stream = api.watch(&wp, resource_version).await?.boxed();
    Ok(forward(stream))
}

/// Pump a raw watch stream into a bounded channel. Transport errors end the
/// stream (the consumer observes a closed channel); event payloads, including
/// server-sent error events, pass through untouched.
pub fn forward<K: Send + 'static>(
    mut stream: BoxStream<'static, kube::Result<WatchEvent<K>>>,
) -> StreamHandle<WatchEvent<K>> {
    let (tx, rx) = mpsc::channel(WATCH_QUEUE_CAP);
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    debug!("watch cancelled");
                    break;
                }
                next = stream.try_next() => match next {
                    Ok(Some(event)) => {
                        counter!("skiff_watch_events_total", 1u64);
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("watch stream ended");
                        break;
                    }
                    Err(e) => {
                        counter!("skiff_watch_errors_total", 1u64);
                        warn!(error = %e, "watch stream error");
                        break;
                    }
                },
            }
        }
    });
    StreamHandle {
        rx,
        cancel: CancelHandle {
            tx: Some(cancel_tx),
        },
    }
}

#[async_trait::async_trait]
impl ClusterOps for KubeCluster {
    async fn create_service(&self, service: &Service) -> Result<Service> {
        Ok(self
            .services
            .create(&PostParams::default(), service)
            .await
            .context("creating service")?)
    }

    async fn list_services(&self, label_selector: &str) -> Result<ResourceList<Service>> {
        list(&self.services, label_selector).await
    }

    async fn watch_services(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<StreamHandle<WatchEvent<Service>>> {
        watch(&self.services, label_selector, resource_version).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        Ok(self
            .pods
            .create(&PostParams::default(), pod)
            .await
            .context("creating pod")?)
    }

    async fn list_pods(&self, label_selector: &str) -> Result<ResourceList<Pod>> {
        list(&self.pods, label_selector).await
    }

    async fn watch_pods(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<StreamHandle<WatchEvent<Pod>>> {
        watch(&self.pods, label_selector, resource_version).await
    }
}
