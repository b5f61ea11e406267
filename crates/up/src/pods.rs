//! Pod manifest construction: one single-container pod per service, with the
//! resolved image, the composition's entrypoint/environment/ports, a
//! readiness probe derived from the healthcheck, and the full host-alias
//! table.

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ExecAction, HostAlias, Pod, PodSpec, Probe,
};
use skiff_core::{Healthcheck, Identity, ServiceDef};

use crate::app::{resource_meta, App, ResolvedImage};

/// Convert a healthcheck descriptor into a cluster readiness probe. The test
/// command follows the docker convention: exit 0 means healthy. Readiness
/// (rather than liveness) is what implements `service_healthy` gating;
/// a failing probe keeps dependents unlaunched instead of restarting the pod.
fn probe_from_healthcheck(healthcheck: &Healthcheck) -> Probe {
    let seconds = |d: std::time::Duration| (d.as_secs().max(1)) as i32;
    Probe {
        exec: Some(ExecAction {
            command: Some(healthcheck.command()),
        }),
        period_seconds: Some(seconds(healthcheck.interval)),
        timeout_seconds: Some(seconds(healthcheck.timeout)),
        failure_threshold: Some(healthcheck.retries as i32),
        ..Default::default()
    }
}

/// Build the pod manifest for an app. The composition healthcheck wins over
/// the image healthcheck; `healthcheck_disabled` suppresses both.
pub(crate) fn build_pod(
    identity: &Identity,
    app: &App,
    service: &ServiceDef,
    resolved: &ResolvedImage,
    host_aliases: &[HostAlias],
) -> Pod {
    let readiness_probe = if service.healthcheck_disabled {
        None
    } else {
        service
            .healthcheck
            .as_ref()
            .or(resolved.healthcheck.as_ref())
            .map(probe_from_healthcheck)
    };

    let ports: Vec<ContainerPort> = service
        .ports
        .iter()
        .map(|p| ContainerPort {
            container_port: i32::from(p.container_port),
            protocol: Some(p.protocol.as_str().to_string()),
            ..Default::default()
        })
        .collect();

    // Sorted for deterministic manifests; consumers treat env as a set.
    let mut env: Vec<EnvVar> = service
        .environment
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    env.sort_by(|a, b| a.name.cmp(&b.name));

    let container = Container {
        name: app.name_encoded.clone(),
        image: Some(resolved.pod_image.clone()),
        image_pull_policy: Some("Always".to_string()),
        command: (!service.entrypoint.is_empty()).then(|| service.entrypoint.clone()),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        readiness_probe,
        working_dir: service.working_dir.clone(),
        ..Default::default()
    };

    Pod {
        metadata: resource_meta(identity, app),
        spec: Some(PodSpec {
            automount_service_account_token: Some(false),
            containers: vec![container],
            host_aliases: (!host_aliases.is_empty()).then(|| host_aliases.to_vec()),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
