//! Per-service runtime records and the ownership table used to map cluster
//! objects back to services.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use skiff_core::{
    encode_name, Composition, Healthcheck, Identity, PodStatusLevel, SERVICE_ANNOTATION,
};
use tokio::sync::OnceCell;

use crate::UpError;

/// Outcome of resolving a service's image: the pod-visible reference plus the
/// healthcheck embedded in the image, if any.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedImage {
    pub healthcheck: Option<Healthcheck>,
    pub pod_image: String,
}

/// Per-service runtime record. Image resolution is write-once; the observed
/// pod status only ever goes up, and only the convergence loop raises it.
#[derive(Debug)]
pub(crate) struct App {
    pub name: String,
    pub name_encoded: String,
    pub resource_name: String,
    pub has_service: bool,
    pub image: OnceCell<Result<ResolvedImage, UpError>>,
    observed: RwLock<PodStatusLevel>,
}

impl App {
    fn new(name: &str, identity: &Identity, has_service: bool) -> Self {
        let name_encoded = encode_name(name);
        let resource_name = identity.resource_name(&name_encoded);
        Self {
            name: name.to_string(),
            name_encoded,
            resource_name,
            has_service,
            image: OnceCell::new(),
            observed: RwLock::new(PodStatusLevel::Other),
        }
    }

    pub fn observed(&self) -> PodStatusLevel {
        *self.observed.read().unwrap()
    }

    /// Raise the observed status; downgrades are ignored. Returns true when
    /// the level actually changed.
    pub fn raise_observed(&self, level: PodStatusLevel) -> bool {
        let mut observed = self.observed.write().unwrap();
        if level > *observed {
            *observed = level;
            true
        } else {
            false
        }
    }
}

/// The immutable app table: service name -> record, plus reverse lookup from
/// cluster object metadata.
#[derive(Debug)]
pub(crate) struct AppTable {
    apps: HashMap<String, Arc<App>>,
}

impl AppTable {
    pub fn build(identity: &Identity, composition: &Composition) -> Result<Self, UpError> {
        let mut apps = HashMap::with_capacity(composition.services.len());
        let mut encoded_owners: HashMap<String, String> = HashMap::new();
        for (name, service) in &composition.services {
            for dep in service.depends_on.keys() {
                if !composition.services.contains_key(dep) {
                    return Err(UpError::Validation(format!(
                        "service {name} depends on unknown service {dep}"
                    )));
                }
            }
            let app = App::new(name, identity, !service.ports.is_empty());
            if let Some(other) = encoded_owners.insert(app.name_encoded.clone(), name.clone()) {
                return Err(UpError::Validation(format!(
                    "services {other} and {name} both map to the encoded name {}",
                    app.name_encoded
                )));
            }
            apps.insert(name.clone(), Arc::new(app));
        }
        Ok(Self { apps })
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<App>> {
        self.apps.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<App>> {
        self.apps.values()
    }

    /// Service names in deterministic order.
    pub fn names_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.keys().cloned().collect();
        names.sort();
        names
    }

    /// Map a cluster object back to the owning app via its annotation. An
    /// object without a recognized annotation whose name collides with our
    /// naming scheme was created or mutated by someone else.
    pub fn find_by_meta(&self, meta: &ObjectMeta) -> Result<Option<Arc<App>>, UpError> {
        if let Some(annotations) = &meta.annotations {
            if let Some(name) = annotations.get(SERVICE_ANNOTATION) {
                if let Some(app) = self.apps.get(name) {
                    return Ok(Some(app.clone()));
                }
            }
        }
        if let Some(name) = &meta.name {
            if self.apps.values().any(|app| &app.resource_name == name) {
                return Err(UpError::ModifiedExternally);
            }
        }
        Ok(None)
    }
}

/// Object metadata for a resource of this deployment: the encoded-name based
/// resource name, the ownership labels, and the service annotation.
pub(crate) fn resource_meta(identity: &Identity, app: &App) -> ObjectMeta {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), app.name_encoded.clone());
    labels.insert(
        identity.environment_label.clone(),
        identity.environment_id.clone(),
    );
    let mut annotations = BTreeMap::new();
    annotations.insert(SERVICE_ANNOTATION.to_string(), app.name.clone());
    ObjectMeta {
        name: Some(app.resource_name.clone()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}
