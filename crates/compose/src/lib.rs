//! Compose-file loading: parse a docker-compose style YAML file into the
//! canonical [`skiff_core::Composition`] model.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use skiff_core::{
    healthcheck, Composition, DependsOnCondition, Healthcheck, PortSpec, Protocol, ServiceDef,
};

/// Default compose file names, tried in order.
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse compose file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("service {service}: {reason}")]
    Invalid { service: String, reason: String },
    #[error("no compose file found in {0}")]
    NotFound(PathBuf),
}

/// Locate a compose file in `dir` by the standard names.
pub fn find_compose_file(dir: &Path) -> Result<PathBuf, ComposeError> {
    for name in DEFAULT_COMPOSE_FILES {
        let path = dir.join(name);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(ComposeError::NotFound(dir.to_path_buf()))
}

/// Load and canonicalize a compose file from disk.
pub fn load_file(path: &Path) -> Result<Composition, ComposeError> {
    let content = std::fs::read_to_string(path).map_err(|source| ComposeError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    load_str(&content)
}

/// Parse and canonicalize compose YAML.
pub fn load_str(content: &str) -> Result<Composition, ComposeError> {
    let raw: RawComposeFile = serde_yaml::from_str(content)?;
    canonicalize(raw)
}

// ---------------- raw (wire) shapes ----------------

#[derive(Debug, Deserialize)]
struct RawComposeFile {
    #[serde(default)]
    services: HashMap<String, RawService>,
}

#[derive(Debug, Default, Deserialize)]
struct RawService {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    entrypoint: Option<StringOrList>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    environment: Option<EnvBlock>,
    #[serde(default)]
    ports: Option<Vec<PortEntry>>,
    #[serde(default)]
    healthcheck: Option<RawHealthcheck>,
    #[serde(default)]
    depends_on: Option<DependsBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(s) => vec![s],
            StringOrList::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvBlock {
    Map(HashMap<String, Option<EnvScalar>>),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvScalar {
    Text(String),
    Number(serde_yaml::Number),
    Flag(bool),
}

impl EnvScalar {
    fn into_string(self) -> String {
        match self {
            EnvScalar::Text(s) => s,
            EnvScalar::Number(n) => n.to_string(),
            EnvScalar::Flag(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortEntry {
    Number(u16),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawHealthcheck {
    #[serde(default)]
    test: Option<StringOrList>,
    #[serde(default)]
    interval: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    disable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependsBlock {
    List(Vec<String>),
    Map(HashMap<String, DependsDetail>),
}

#[derive(Debug, Deserialize)]
struct DependsDetail {
    #[serde(default)]
    condition: Option<String>,
}

// ---------------- canonicalization ----------------

fn canonicalize(raw: RawComposeFile) -> Result<Composition, ComposeError> {
    let mut services = HashMap::with_capacity(raw.services.len());
    let names: Vec<String> = raw.services.keys().cloned().collect();
    for (name, raw_service) in raw.services {
        let service = canonicalize_service(&name, raw_service, &names)?;
        services.insert(name, service);
    }
    Ok(Composition { services })
}

fn canonicalize_service(
    name: &str,
    raw: RawService,
    all_names: &[String],
) -> Result<ServiceDef, ComposeError> {
    let invalid = |reason: String| ComposeError::Invalid {
        service: name.to_string(),
        reason,
    };

    let environment = match raw.environment {
        None => HashMap::new(),
        Some(EnvBlock::Map(m)) => m
            .into_iter()
            .map(|(k, v)| (k, v.map(EnvScalar::into_string).unwrap_or_default()))
            .collect(),
        Some(EnvBlock::List(entries)) => {
            let mut m = HashMap::with_capacity(entries.len());
            for entry in entries {
                match entry.split_once('=') {
                    Some((k, v)) => m.insert(k.to_string(), v.to_string()),
                    None => m.insert(entry, String::new()),
                };
            }
            m
        }
    };

    let mut ports = Vec::new();
    for entry in raw.ports.unwrap_or_default() {
        ports.push(parse_port(&entry).map_err(&invalid)?);
    }

    let (healthcheck_def, healthcheck_disabled) = match raw.healthcheck {
        None => (None, false),
        Some(hc) if hc.disable => (None, true),
        Some(hc) => (canonicalize_healthcheck(hc).map_err(&invalid)?, false),
    };

    let mut depends_on = HashMap::new();
    match raw.depends_on {
        None => {}
        Some(DependsBlock::List(names)) => {
            for dep in names {
                depends_on.insert(dep, DependsOnCondition::Started);
            }
        }
        Some(DependsBlock::Map(m)) => {
            for (dep, detail) in m {
                let condition = match detail.condition.as_deref() {
                    None | Some("service_started") => DependsOnCondition::Started,
                    Some("service_healthy") => DependsOnCondition::Healthy,
                    Some(other) => {
                        return Err(invalid(format!(
                            "depends_on {dep}: unsupported condition {other}"
                        )))
                    }
                };
                depends_on.insert(dep, condition);
            }
        }
    }
    for dep in depends_on.keys() {
        if !all_names.iter().any(|n| n == dep) {
            return Err(invalid(format!("depends_on references unknown service {dep}")));
        }
    }

    Ok(ServiceDef {
        image: raw.image.unwrap_or_default(),
        entrypoint: raw.entrypoint.map(StringOrList::into_vec).unwrap_or_default(),
        working_dir: raw.working_dir,
        environment,
        ports,
        healthcheck: healthcheck_def,
        healthcheck_disabled,
        depends_on,
    })
}

fn canonicalize_healthcheck(raw: RawHealthcheck) -> Result<Option<Healthcheck>, String> {
    let test = match raw.test {
        None => return Ok(None),
        // A plain string test is a shell command line.
        Some(StringOrList::One(s)) => vec![healthcheck::TEST_CMD_SHELL.to_string(), s],
        Some(StringOrList::Many(v)) => v,
    };
    match test.first().map(String::as_str) {
        None | Some(healthcheck::TEST_NONE) => return Ok(None),
        Some(healthcheck::TEST_CMD) | Some(healthcheck::TEST_CMD_SHELL) => {}
        Some(other) => return Err(format!("healthcheck: unsupported test kind {other}")),
    }
    if test.len() < 2 {
        return Ok(None);
    }
    let interval = match raw.interval.as_deref() {
        Some(s) => parse_duration(s).map_err(|e| format!("healthcheck interval: {e}"))?,
        None => healthcheck::DEFAULT_INTERVAL,
    };
    let timeout = match raw.timeout.as_deref() {
        Some(s) => parse_duration(s).map_err(|e| format!("healthcheck timeout: {e}"))?,
        None => healthcheck::DEFAULT_TIMEOUT,
    };
    Ok(Some(Healthcheck {
        test,
        interval,
        timeout,
        retries: raw.retries.unwrap_or(healthcheck::DEFAULT_RETRIES),
    }))
}

/// Parse a compose port entry down to the container port and protocol. The
/// published side of `host:container` mappings is dropped: cluster services
/// expose the container port directly.
fn parse_port(entry: &PortEntry) -> Result<PortSpec, String> {
    let text = match entry {
        PortEntry::Number(n) => {
            return Ok(PortSpec {
                container_port: *n,
                protocol: Protocol::Tcp,
            })
        }
        PortEntry::Text(s) => s.trim(),
    };
    let (spec, protocol) = match text.split_once('/') {
        Some((spec, proto)) => {
            let protocol = match proto.to_ascii_lowercase().as_str() {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                other => return Err(format!("port {text}: unsupported protocol {other}")),
            };
            (spec, protocol)
        }
        None => (text, Protocol::Tcp),
    };
    // "p", "host:container", or "ip:host:container"; the container port is last.
    let container = spec.rsplit(':').next().unwrap_or(spec);
    let container_port: u16 = container
        .parse()
        .map_err(|_| format!("port {text}: invalid container port {container}"))?;
    Ok(PortSpec {
        container_port,
        protocol,
    })
}

/// Parse a docker-style duration string: a sequence of `<number><unit>`
/// groups, e.g. `90s`, `1m30s`, `500ms`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() || *c == '.' {
                number.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration {s}"))?;
        let unit_secs = match unit.as_str() {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("invalid duration unit in {s}")),
        };
        total += Duration::from_secs_f64(value * unit_secs);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_docker_style() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10 parsecs").is_err());
    }

    #[test]
    fn ports_parse_all_forms() {
        assert_eq!(
            parse_port(&PortEntry::Number(8080)).unwrap(),
            PortSpec { container_port: 8080, protocol: Protocol::Tcp }
        );
        assert_eq!(
            parse_port(&PortEntry::Text("5432:5432".into())).unwrap().container_port,
            5432
        );
        assert_eq!(
            parse_port(&PortEntry::Text("127.0.0.1:80:8080/udp".into())).unwrap(),
            PortSpec { container_port: 8080, protocol: Protocol::Udp }
        );
        assert!(parse_port(&PortEntry::Text("80/sctp".into())).is_err());
    }
}
