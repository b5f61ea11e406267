//! Scripted in-memory doubles for the cluster and image-daemon capability
//! traits. Deterministic: a created pod walks its scripted status sequence as
//! watch events, a created service gets a cluster IP either immediately or
//! once the service watch opens. Used by the engine's own tests; exposed so
//! downstream crates can exercise the engine without a cluster.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, Pod, PodCondition, PodStatus, Service,
};
use kube::core::WatchEvent;
use skiff_core::SERVICE_ANNOTATION;
use skiff_imagehub::{ImageDaemon, ImageDetails, ImageSummary, RegistryAuth};
use skiff_kubehub::{forward, ClusterOps, ResourceList, StreamHandle};
use tokio::sync::mpsc;

const QUEUE_CAP: usize = 256;

/// One step of a pod's scripted lifecycle, emitted as a `MODIFIED` event.
#[derive(Debug, Clone)]
pub enum PodScriptStep {
    Started,
    Ready,
    Terminated {
        exit_code: i32,
        reason: String,
        message: String,
    },
    ImagePullError {
        message: String,
    },
}

fn pod_with_step(pod: &Pod, step: &PodScriptStep) -> Pod {
    let mut pod = pod.clone();
    let container = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "main".to_string());
    pod.status = Some(match step {
        PodScriptStep::Started => PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: container,
                state: Some(ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        },
        PodScriptStep::Ready => PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        },
        PodScriptStep::Terminated {
            exit_code,
            reason,
            message,
        } => PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: container,
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: *exit_code,
                        reason: Some(reason.clone()),
                        message: Some(message.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        },
        PodScriptStep::ImagePullError { message } => PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: container,
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ErrImagePull".into()),
                        message: Some(message.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        },
    });
    pod
}

fn annotation_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> String {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(SERVICE_ANNOTATION))
        .cloned()
        .unwrap_or_default()
}

#[derive(Default)]
struct ClusterState {
    services: Vec<Service>,
    pods: Vec<Pod>,
    next_ip: u8,
    defer_ips: bool,
    delete_service_on_watch: Option<String>,
    pod_scripts: HashMap<String, Vec<PodScriptStep>>,
    pod_tx: Option<mpsc::Sender<WatchEvent<Pod>>>,
    pod_pending: VecDeque<WatchEvent<Pod>>,
    created_pod_order: Vec<String>,
    pod_create_counts: HashMap<String, usize>,
}

/// Scripted in-memory cluster.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave created services without a cluster IP until the service watch
    /// opens; IPs are then assigned via `MODIFIED` events.
    pub fn defer_ips(&self) {
        self.state.lock().unwrap().defer_ips = true;
    }

    /// When the service watch opens, emit a `DELETED` event for the named
    /// app's service instead of assigning it an IP. Implies nothing unless
    /// IPs are deferred.
    pub fn delete_service_on_watch(&self, app_name: &str) {
        self.state.lock().unwrap().delete_service_on_watch = Some(app_name.to_string());
    }

    /// Script the status sequence a created pod walks through. Unscripted
    /// pods go `Started` then `Ready`.
    pub fn script_pod(&self, app_name: &str, steps: Vec<PodScriptStep>) {
        self.state
            .lock()
            .unwrap()
            .pod_scripts
            .insert(app_name.to_string(), steps);
    }

    /// Inject an arbitrary pod watch event (delivered after any pending
    /// scripted events).
    pub fn queue_pod_event(&self, event: WatchEvent<Pod>) {
        let mut state = self.state.lock().unwrap();
        match &state.pod_tx {
            Some(tx) => {
                let _ = tx.try_send(event);
            }
            None => state.pod_pending.push_back(event),
        }
    }

    /// App names in pod creation order.
    pub fn created_pods(&self) -> Vec<String> {
        self.state.lock().unwrap().created_pod_order.clone()
    }

    pub fn pod_create_count(&self, app_name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .pod_create_counts
            .get(app_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn services(&self) -> Vec<Service> {
        self.state.lock().unwrap().services.clone()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.state.lock().unwrap().pods.clone()
    }

    pub fn pod_for(&self, app_name: &str) -> Option<Pod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .iter()
            .find(|p| annotation_name(&p.metadata) == app_name)
            .cloned()
    }
}

#[async_trait::async_trait]
impl ClusterOps for FakeCluster {
    async fn create_service(&self, service: &Service) -> Result<Service> {
        let mut state = self.state.lock().unwrap();
        let mut service = service.clone();
        if let Some(spec) = service.spec.as_mut() {
            spec.type_ = Some("ClusterIP".to_string());
            if !state.defer_ips {
                state.next_ip += 1;
                spec.cluster_ip = Some(format!("10.96.0.{}", state.next_ip));
            }
        }
        state.services.push(service.clone());
        Ok(service)
    }

    async fn list_services(&self, _label_selector: &str) -> Result<ResourceList<Service>> {
        let state = self.state.lock().unwrap();
        Ok(ResourceList {
            items: state.services.clone(),
            resource_version: "1".to_string(),
        })
    }

    async fn watch_services(
        &self,
        _label_selector: &str,
        _resource_version: &str,
    ) -> Result<StreamHandle<WatchEvent<Service>>> {
        let mut state = self.state.lock().unwrap();
        let mut events: Vec<kube::Result<WatchEvent<Service>>> = Vec::new();
        let delete_target = state.delete_service_on_watch.clone();
        let mut next_ip = state.next_ip;
        for service in state.services.iter_mut() {
            let unassigned = service
                .spec
                .as_ref()
                .map(|s| s.cluster_ip.is_none())
                .unwrap_or(true);
            if !unassigned {
                continue;
            }
            if delete_target.as_deref() == Some(annotation_name(&service.metadata).as_str()) {
                events.push(Ok(WatchEvent::Deleted(service.clone())));
                continue;
            }
            if let Some(spec) = service.spec.as_mut() {
                next_ip += 1;
                spec.cluster_ip = Some(format!("10.96.0.{next_ip}"));
            }
            events.push(Ok(WatchEvent::Modified(service.clone())));
        }
        state.next_ip = next_ip;
        Ok(forward(futures::stream::iter(events).boxed()))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let mut state = self.state.lock().unwrap();
        let pod = pod.clone();
        let app_name = annotation_name(&pod.metadata);
        state.created_pod_order.push(app_name.clone());
        *state.pod_create_counts.entry(app_name.clone()).or_insert(0) += 1;
        state.pods.push(pod.clone());

        let steps = state
            .pod_scripts
            .get(&app_name)
            .cloned()
            .unwrap_or_else(|| vec![PodScriptStep::Started, PodScriptStep::Ready]);
        let mut events = VecDeque::new();
        events.push_back(WatchEvent::Added(pod.clone()));
        for step in &steps {
            events.push_back(WatchEvent::Modified(pod_with_step(&pod, step)));
        }
        match &state.pod_tx {
            Some(tx) => {
                for event in events {
                    let _ = tx.try_send(event);
                }
            }
            None => state.pod_pending.extend(events),
        }
        Ok(pod)
    }

    async fn list_pods(&self, _label_selector: &str) -> Result<ResourceList<Pod>> {
        let state = self.state.lock().unwrap();
        Ok(ResourceList {
            items: state.pods.clone(),
            resource_version: "1".to_string(),
        })
    }

    async fn watch_pods(
        &self,
        _label_selector: &str,
        _resource_version: &str,
    ) -> Result<StreamHandle<WatchEvent<Pod>>> {
        let mut state = self.state.lock().unwrap();
        let (tx, rx) = mpsc::channel(QUEUE_CAP);
        for event in state.pod_pending.drain(..) {
            let _ = tx.try_send(event);
        }
        state.pod_tx = Some(tx);
        Ok(StreamHandle {
            rx,
            cancel: skiff_kubehub::CancelHandle::noop(),
        })
    }
}

#[derive(Clone)]
struct PullableImage {
    digest: String,
    id: String,
    healthcheck: Option<skiff_core::Healthcheck>,
}

#[derive(Default)]
struct DaemonState {
    images: Vec<ImageSummary>,
    inspects: HashMap<String, ImageDetails>,
    pullable: HashMap<String, PullableImage>,
    push_digest: String,
    list_calls: usize,
    pulled: Vec<String>,
    tagged: Vec<(String, String)>,
    pushed: Vec<String>,
    pushed_auth: Vec<Option<RegistryAuth>>,
}

/// Scripted in-memory image daemon.
pub struct FakeDaemon {
    state: Mutex<DaemonState>,
}

/// Drop the tag from a familiar reference: `busybox:1.36` -> `busybox`.
fn without_tag(reference: &str) -> &str {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => reference,
    }
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DaemonState {
                push_digest:
                    "sha256:9999999999999999999999999999999999999999999999999999999999999999"
                        .to_string(),
                ..Default::default()
            }),
        }
    }

    /// Register an image as already present locally under the given tag.
    pub fn add_local_image(
        &self,
        reference: &str,
        id: &str,
        healthcheck: Option<skiff_core::Healthcheck>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.images.push(ImageSummary {
            id: id.to_string(),
            repo_tags: vec![reference.to_string()],
            repo_digests: Vec::new(),
        });
        state.inspects.insert(
            id.to_string(),
            ImageDetails {
                id: id.to_string(),
                healthcheck,
            },
        );
    }

    /// Register an image as pullable: absent locally until `pull_image` runs.
    /// Keys are normalized so `busybox:1.36` matches a pull of the
    /// fully-qualified `docker.io/library/busybox:1.36`.
    pub fn add_pullable(
        &self,
        reference: &str,
        digest: &str,
        id: &str,
        healthcheck: Option<skiff_core::Healthcheck>,
    ) {
        self.state.lock().unwrap().pullable.insert(
            skiff_imagehub::normalize_reference(reference),
            PullableImage {
                digest: digest.to_string(),
                id: id.to_string(),
                healthcheck,
            },
        );
    }

    pub fn set_push_digest(&self, digest: &str) {
        self.state.lock().unwrap().push_digest = digest.to_string();
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state.lock().unwrap().pulled.clone()
    }

    pub fn tagged(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().tagged.clone()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub fn pushed_auth(&self) -> Vec<Option<RegistryAuth>> {
        self.state.lock().unwrap().pushed_auth.clone()
    }
}

impl Default for FakeDaemon {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ImageDaemon for FakeDaemon {
    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        Ok(state.images.clone())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails> {
        let state = self.state.lock().unwrap();
        state
            .inspects
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow!("no such image: {reference}"))
    }

    async fn pull_image(&self, reference: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.pulled.push(reference.to_string());
        let key = skiff_imagehub::normalize_reference(reference);
        let Some(pullable) = state.pullable.get(&key).cloned() else {
            return Err(anyhow!("pull access denied for {reference}"));
        };
        state.images.push(ImageSummary {
            id: pullable.id.clone(),
            repo_tags: vec![reference.to_string()],
            repo_digests: vec![format!("{}@{}", without_tag(reference), pullable.digest)],
        });
        state.inspects.insert(
            pullable.id.clone(),
            ImageDetails {
                id: pullable.id.clone(),
                healthcheck: pullable.healthcheck.clone(),
            },
        );
        Ok(pullable.digest)
    }

    async fn tag_image(&self, id: &str, reference: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .tagged
            .push((id.to_string(), reference.to_string()));
        Ok(())
    }

    async fn push_image(&self, reference: &str, auth: Option<&RegistryAuth>) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.pushed.push(reference.to_string());
        state.pushed_auth.push(auth.cloned());
        Ok(state.push_digest.clone())
    }
}
