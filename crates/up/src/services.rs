//! Service materialization: create one ClusterIP service per port-exposing
//! app, wait until every expected service has a cluster IP, and build the
//! host-alias table installed into every pod.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{HostAlias, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::WatchEvent;
use skiff_core::{Composition, Identity};
use skiff_kubehub::{ClusterOps, StreamHandle};
use tracing::debug;

use crate::app::{resource_meta, AppTable};
use crate::UpError;

/// Create cluster services for every port-exposing app and block until each
/// has an assigned cluster IP, then return the host-alias table: one entry
/// per app, mapping the original composition service name to the service's
/// cluster IP. A composition without port-exposing services yields an empty
/// table without touching the cluster.
pub(crate) async fn create_services_and_collect_host_aliases(
    cluster: &dyn ClusterOps,
    identity: &Identity,
    apps: &AppTable,
    composition: &Composition,
) -> Result<Vec<HostAlias>, UpError> {
    let mut expected = 0;
    for name in apps.names_sorted() {
        let app = apps.get(&name).unwrap();
        if !app.has_service {
            continue;
        }
        expected += 1;
        let service_def = &composition.services[&app.name];
        let ports: Vec<ServicePort> = service_def
            .ports
            .iter()
            .map(|p| ServicePort {
                name: Some(format!("{}-{}", p.protocol.as_str_lower(), p.container_port)),
                port: i32::from(p.container_port),
                protocol: Some(p.protocol.as_str().to_string()),
                target_port: Some(IntOrString::Int(i32::from(p.container_port))),
                ..Default::default()
            })
            .collect();
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), app.name_encoded.clone());
        selector.insert(
            identity.environment_label.clone(),
            identity.environment_id.clone(),
        );
        let service = Service {
            metadata: resource_meta(identity, app),
            spec: Some(ServiceSpec {
                ports: Some(ports),
                selector: Some(selector),
                // Type is left unset: ClusterIP is the default.
                ..Default::default()
            }),
            ..Default::default()
        };
        cluster.create_service(&service).await?;
        println!("app {}: created service {}", app.name, app.resource_name);
    }
    if expected == 0 {
        return Ok(Vec::new());
    }

    // Collect assigned cluster IPs, first from a list, then from a watch
    // anchored at the list's resource version.
    let mut ips: HashMap<String, String> = HashMap::new();
    let selector = identity.label_selector();
    let list = cluster.list_services(&selector).await?;
    if list.items.len() < expected {
        return Err(UpError::ModifiedExternally);
    }
    for service in &list.items {
        record_cluster_ip(apps, service, &mut ips)?;
    }
    let mut remaining = remaining_ips(apps, &ips);
    println!(
        "waiting for cluster IP assignment ({}/{})",
        expected - remaining,
        expected
    );
    if remaining > 0 {
        let handle = cluster
            .watch_services(&selector, &list.resource_version)
            .await?;
        let StreamHandle { mut rx, cancel } = handle;
        let _cancel = cancel;
        loop {
            let Some(event) = rx.recv().await else {
                return Err(UpError::WatchClosed);
            };
            match event {
                WatchEvent::Added(service) | WatchEvent::Modified(service) => {
                    record_cluster_ip(apps, &service, &mut ips)?;
                }
                WatchEvent::Deleted(service) => {
                    if apps.find_by_meta(&service.metadata)?.is_some() {
                        return Err(UpError::ModifiedExternally);
                    }
                }
                other => return Err(UpError::Protocol(format!("{other:?}"))),
            }
            let remaining_now = remaining_ips(apps, &ips);
            if remaining_now != remaining {
                remaining = remaining_now;
                println!(
                    "waiting for cluster IP assignment ({}/{})",
                    expected - remaining,
                    expected
                );
                if remaining == 0 {
                    break;
                }
            }
        }
    }

    let mut entries: Vec<(String, String)> = ips.into_iter().collect();
    entries.sort();
    debug!(count = entries.len(), "host alias table complete");
    Ok(entries
        .into_iter()
        .map(|(name, ip)| HostAlias {
            ip: Some(ip),
            hostnames: Some(vec![name]),
        })
        .collect())
}

/// Port-exposing apps still waiting for a cluster IP.
fn remaining_ips(apps: &AppTable, ips: &HashMap<String, String>) -> usize {
    apps.iter()
        .filter(|app| app.has_service && !ips.contains_key(&app.name))
        .count()
}

/// Record the cluster IP of a listed or watched service. Services that do not
/// map back to one of our apps are ignored; a matching service of the wrong
/// type means someone mutated it.
fn record_cluster_ip(
    apps: &AppTable,
    service: &Service,
    ips: &mut HashMap<String, String>,
) -> Result<(), UpError> {
    let Some(app) = apps.find_by_meta(&service.metadata)? else {
        return Ok(());
    };
    if !app.has_service {
        return Ok(());
    }
    let spec = service.spec.as_ref();
    let service_type = spec
        .and_then(|s| s.type_.as_deref())
        .unwrap_or("ClusterIP");
    if service_type != "ClusterIP" {
        return Err(UpError::ModifiedExternally);
    }
    if let Some(ip) = spec.and_then(|s| s.cluster_ip.as_deref()) {
        if !ip.is_empty() {
            ips.insert(app.name.clone(), ip.to_string());
        }
    }
    Ok(())
}
