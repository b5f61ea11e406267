//! Skiff core types: the canonical composition model and deployment identity.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod healthcheck;
pub mod names;

pub use healthcheck::Healthcheck;
pub use names::encode_name;

/// Annotation carrying the original (unencoded) service name on every
/// resource the operator creates.
pub const SERVICE_ANNOTATION: &str = "kube-compose/service";

/// Transport protocol of an exposed container port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Wire form used by the cluster API ("TCP"/"UDP").
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }

    /// Lowercase form used in service port names.
    pub fn as_str_lower(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A single exposed container port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortSpec {
    pub container_port: u16,
    pub protocol: Protocol,
}

/// Inter-service dependency predicate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DependsOnCondition {
    /// Predecessor's pod has all containers running (`service_started`).
    Started,
    /// Predecessor's pod reports Ready (`service_healthy`).
    Healthy,
}

/// Canonical definition of one service in the composition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDef {
    pub image: String,
    /// Entrypoint override, passed to the container verbatim (no shell splitting).
    pub entrypoint: Vec<String>,
    pub working_dir: Option<String>,
    /// Environment variables; null values in the input are represented as "".
    pub environment: HashMap<String, String>,
    pub ports: Vec<PortSpec>,
    pub healthcheck: Option<Healthcheck>,
    pub healthcheck_disabled: bool,
    /// Service name -> required predecessor condition.
    pub depends_on: HashMap<String, DependsOnCondition>,
}

/// The immutable canonical composition: service name -> definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Composition {
    pub services: HashMap<String, ServiceDef>,
}

/// The `(namespace, environment_label, environment_id)` tuple under which all
/// created resources are grouped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub namespace: String,
    pub environment_label: String,
    pub environment_id: String,
}

impl Identity {
    /// Label selector matching every resource of this deployment.
    pub fn label_selector(&self) -> String {
        format!("{}={}", self.environment_label, self.environment_id)
    }

    /// Cluster resource name for a service of this deployment.
    pub fn resource_name(&self, name_encoded: &str) -> String {
        format!("{}-{}", name_encoded, self.environment_id)
    }
}

/// Observed pod status, reduced to the three levels the engine cares about.
/// Ordered: `Other < Started < Ready`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum PodStatusLevel {
    Other,
    Started,
    Ready,
}

impl std::fmt::Display for PodStatusLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PodStatusLevel::Other => "other",
            PodStatusLevel::Started => "started",
            PodStatusLevel::Ready => "ready",
        };
        f.write_str(s)
    }
}

pub mod prelude {
    pub use super::{
        Composition, DependsOnCondition, Healthcheck, Identity, PodStatusLevel, PortSpec,
        Protocol, ServiceDef,
    };
}
