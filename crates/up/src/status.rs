//! Pod status classification: reduce a pod's status payload to one of three
//! levels and surface terminal container failures.

use k8s_openapi::api::core::v1::Pod;
use skiff_core::PodStatusLevel;

use crate::UpError;

/// Classify a pod's status. A pod-condition `Ready=True` wins outright; a
/// terminated container or an `ErrImagePull` wait is a fatal error; otherwise
/// the pod is `started` once every container (at least one) is running.
/// Pure function of its input.
pub fn classify_pod(pod: &Pod) -> Result<PodStatusLevel, UpError> {
    let Some(status) = &pod.status else {
        return Ok(PodStatusLevel::Other);
    };
    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    if ready {
        return Ok(PodStatusLevel::Ready);
    }
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    let container_statuses = status.container_statuses.as_deref().unwrap_or(&[]);
    let mut running = 0;
    for container_status in container_statuses {
        let Some(state) = &container_status.state else {
            continue;
        };
        if let Some(terminated) = &state.terminated {
            return Err(UpError::ContainerTerminated {
                container: container_status.name.clone(),
                pod: pod_name.to_string(),
                code: terminated.exit_code,
                signal: terminated.signal.unwrap_or(0),
                reason: terminated.reason.clone().unwrap_or_default(),
                message: terminated.message.clone().unwrap_or_default(),
            });
        }
        if let Some(waiting) = &state.waiting {
            if waiting.reason.as_deref() == Some("ErrImagePull") {
                return Err(UpError::ContainerImagePull {
                    container: container_status.name.clone(),
                    pod: pod_name.to_string(),
                    message: waiting.message.clone().unwrap_or_default(),
                });
            }
        }
        if state.running.is_some() {
            running += 1;
        }
    }
    // An empty status list is not "all running": something must actually be
    // running before dependents gated on service_started may launch.
    if !container_statuses.is_empty() && running == container_statuses.len() {
        Ok(PodStatusLevel::Started)
    } else {
        Ok(PodStatusLevel::Other)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        ContainerStatus, PodCondition, PodStatus,
    };

    use super::*;

    fn pod_with(status: PodStatus) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some("flaky-env1".to_string());
        pod.status = Some(status);
        pod
    }

    fn running_container(name: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn no_status_is_other() {
        assert_eq!(
            classify_pod(&Pod::default()).unwrap(),
            PodStatusLevel::Other
        );
    }

    #[test]
    fn ready_condition_wins() {
        let pod = pod_with(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(classify_pod(&pod).unwrap(), PodStatusLevel::Ready);
    }

    #[test]
    fn all_containers_running_is_started() {
        let pod = pod_with(PodStatus {
            container_statuses: Some(vec![running_container("main")]),
            ..Default::default()
        });
        assert_eq!(classify_pod(&pod).unwrap(), PodStatusLevel::Started);
    }

    #[test]
    fn empty_container_statuses_is_other() {
        let pod = pod_with(PodStatus::default());
        assert_eq!(classify_pod(&pod).unwrap(), PodStatusLevel::Other);
    }

    #[test]
    fn a_waiting_container_holds_the_pod_at_other() {
        let pod = pod_with(PodStatus {
            container_statuses: Some(vec![
                running_container("main"),
                ContainerStatus {
                    name: "sidecar".into(),
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("ContainerCreating".into()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        });
        assert_eq!(classify_pod(&pod).unwrap(), PodStatusLevel::Other);
    }

    #[test]
    fn terminated_container_is_fatal_with_details() {
        let pod = pod_with(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "flaky".into(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 1,
                        reason: Some("Error".into()),
                        message: Some("boom".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let err = classify_pod(&pod).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("flaky"));
        assert!(text.contains("code=1"));
        assert!(text.contains("reason=Error"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn err_image_pull_is_fatal() {
        let pod = pod_with(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "main".into(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ErrImagePull".into()),
                        message: Some("manifest unknown".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let err = classify_pod(&pod).unwrap_err();
        assert!(err.to_string().contains("could not pull image"));
        assert!(err.to_string().contains("manifest unknown"));
    }
}
