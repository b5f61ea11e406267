//! Image reference parsing and resolution against the local image index.
//!
//! A reference is either `Named` (registry/repo[:tag|@digest]) or an opaque
//! local image ID. Short hex IDs are disambiguated against the local index,
//! the same interpretation docker-compose applies.

use std::collections::HashSet;
use std::fmt;

use anyhow::{anyhow, Result};
use oci_distribution::Reference;

use crate::ImageSummary;

/// Parsed image reference.
#[derive(Debug, Clone)]
pub enum ImageRef {
    Named(Reference),
    /// A content-addressed local image ID (`sha256:...`), not pullable.
    Id(String),
}

impl ImageRef {
    pub fn named(&self) -> Option<&Reference> {
        match self {
            ImageRef::Named(r) => Some(r),
            ImageRef::Id(_) => None,
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Named(r) => f.write_str(&r.whole()),
            ImageRef::Id(id) => f.write_str(id),
        }
    }
}

/// Snapshot of the daemon's local images: the digest set plus the summaries.
#[derive(Debug, Clone, Default)]
pub struct LocalImages {
    ids: HashSet<String>,
    pub images: Vec<ImageSummary>,
}

impl LocalImages {
    pub fn from_summaries(images: Vec<ImageSummary>) -> Self {
        let ids = images.iter().map(|s| s.id.clone()).collect();
        Self { ids, images }
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Resolve a possibly-short hex ID against the index. `Ok(Some(full_id))`
    /// on a unique match, `Ok(None)` when nothing matches, error when the
    /// prefix is ambiguous.
    pub fn lookup_id(&self, candidate: &str) -> Result<Option<String>> {
        let hex = candidate.strip_prefix("sha256:").unwrap_or(candidate);
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(None);
        }
        let mut found: Option<&str> = None;
        for id in &self.ids {
            let id_hex = id.strip_prefix("sha256:").unwrap_or(id);
            if id_hex.starts_with(hex) {
                if found.is_some() {
                    return Err(anyhow!("ambiguous image ID prefix {candidate}"));
                }
                found = Some(id);
            }
        }
        Ok(found.map(str::to_string))
    }
}

/// Parse an image string the way docker-compose does: first as a (possibly
/// short) local image ID against the local index, then as a named reference.
pub fn parse_any_reference(image: &str, local: &LocalImages) -> Result<ImageRef> {
    if let Some(id) = local.lookup_id(image)? {
        return Ok(ImageRef::Id(id));
    }
    let named: Reference = image
        .parse()
        .map_err(|e| anyhow!("invalid image reference {image}: {e}"))?;
    Ok(ImageRef::Named(named))
}

/// The fully-qualified form of a reference string (`busybox:1.36` becomes
/// `docker.io/library/busybox:1.36`); unparseable input is returned as-is.
pub fn normalize_reference(reference: &str) -> String {
    reference
        .parse::<Reference>()
        .map(|r| r.whole())
        .unwrap_or_else(|_| reference.to_string())
}

/// Registry/repository key used to compare references against daemon-reported
/// familiar names, normalizing the default registry and `library/` namespace.
fn repo_key(reference: &Reference) -> String {
    let registry = match reference.registry() {
        "" | "docker.io" | "index.docker.io" | "registry-1.docker.io" => "docker.io",
        other => other,
    };
    let repository = reference.repository();
    if registry == "docker.io" && !repository.contains('/') {
        format!("{registry}/library/{repository}")
    } else {
        format!("{registry}/{repository}")
    }
}

/// The user-facing name of a reference without tag or digest: short form for
/// default-registry images (`busybox`), full form otherwise
/// (`registry.local:5000/demo/app`).
pub fn familiar_name(reference: &Reference) -> String {
    let registry = reference.registry();
    let repository = reference.repository();
    if matches!(registry, "" | "docker.io" | "index.docker.io") {
        repository
            .strip_prefix("library/")
            .unwrap_or(repository)
            .to_string()
    } else {
        format!("{registry}/{repository}")
    }
}

/// Resolve a parsed reference to a local image ID, if present: exact ID for
/// opaque references, digest match against `repo@digest` names, tag match
/// against `repo:tag` names.
pub fn resolve_local_image_id(reference: &ImageRef, local: &LocalImages) -> Option<String> {
    match reference {
        ImageRef::Id(id) => local.contains_id(id).then(|| id.clone()),
        ImageRef::Named(named) => {
            let key = repo_key(named);
            if let Some(digest) = named.digest() {
                return find_by_digest(&key, digest, &local.images);
            }
            let tag = named.tag().unwrap_or("latest");
            for summary in &local.images {
                for repo_tag in &summary.repo_tags {
                    let Ok(parsed) = repo_tag.parse::<Reference>() else {
                        continue;
                    };
                    if repo_key(&parsed) == key && parsed.tag().unwrap_or("latest") == tag {
                        return Some(summary.id.clone());
                    }
                }
            }
            None
        }
    }
}

fn find_by_digest(key: &str, digest: &str, images: &[ImageSummary]) -> Option<String> {
    for summary in images {
        for repo_digest in &summary.repo_digests {
            let Ok(parsed) = repo_digest.parse::<Reference>() else {
                continue;
            };
            if repo_key(&parsed) == key && parsed.digest() == Some(digest) {
                return Some(summary.id.clone());
            }
        }
    }
    None
}

/// After a successful pull of `named` returning `digest`, locate the local ID
/// via a fresh image list and produce the canonical pod-visible reference
/// (`name@digest`). The ID is `None` if the image vanished between the pull
/// and the list.
pub fn resolve_after_pull(
    named: &Reference,
    digest: &str,
    fresh: &[ImageSummary],
) -> (Option<String>, String) {
    let pod_image = format!("{}@{}", familiar_name(named), digest);
    let id = find_by_digest(&repo_key(named), digest, fresh);
    (id, pod_image)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Digest strings must carry full 64-hex digests to satisfy reference
    // parsing; IDs can stay short since they are never parsed as references.
    const DIGEST_A: &str =
        "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const DIGEST_B: &str =
        "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const DIGEST_C: &str =
        "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

    fn local() -> LocalImages {
        LocalImages::from_summaries(vec![
            ImageSummary {
                id: "sha256:aaaa1111".into(),
                repo_tags: vec!["busybox:1.36".into()],
                repo_digests: vec![format!("busybox@{DIGEST_A}")],
            },
            ImageSummary {
                id: "sha256:bbbb2222".into(),
                repo_tags: vec!["registry.local:5000/demo/app:latest".into()],
                repo_digests: vec![format!("registry.local:5000/demo/app@{DIGEST_B}")],
            },
        ])
    }

    #[test]
    fn short_ids_resolve_uniquely() {
        let local = local();
        let parsed = parse_any_reference("aaaa", &local).unwrap();
        match parsed {
            ImageRef::Id(id) => assert_eq!(id, "sha256:aaaa1111"),
            other => panic!("expected Id, got {other}"),
        }
    }

    #[test]
    fn ambiguous_prefix_is_an_error() {
        let local = LocalImages::from_summaries(vec![
            ImageSummary { id: "sha256:abc1".into(), ..Default::default() },
            ImageSummary { id: "sha256:abc2".into(), ..Default::default() },
        ]);
        assert!(parse_any_reference("abc", &local).is_err());
    }

    #[test]
    fn non_hex_parses_as_named() {
        let parsed = parse_any_reference("busybox:1.36", &local()).unwrap();
        assert!(parsed.named().is_some());
    }

    #[test]
    fn tag_match_finds_local_id() {
        let local = local();
        let parsed = parse_any_reference("busybox:1.36", &local).unwrap();
        assert_eq!(
            resolve_local_image_id(&parsed, &local).as_deref(),
            Some("sha256:aaaa1111")
        );
        let missing = parse_any_reference("busybox:1.35", &local).unwrap();
        assert_eq!(resolve_local_image_id(&missing, &local), None);
    }

    #[test]
    fn digest_match_finds_local_id() {
        let local = local();
        let reference = format!("registry.local:5000/demo/app@{DIGEST_B}");
        let parsed = parse_any_reference(&reference, &local).unwrap();
        assert_eq!(
            resolve_local_image_id(&parsed, &local).as_deref(),
            Some("sha256:bbbb2222")
        );
    }

    #[test]
    fn familiar_names_shorten_default_registry() {
        let named = "busybox:1.36".parse::<Reference>().unwrap();
        assert_eq!(familiar_name(&named), "busybox");
        let named = "registry.local:5000/demo/app:latest".parse::<Reference>().unwrap();
        assert_eq!(familiar_name(&named), "registry.local:5000/demo/app");
    }

    #[test]
    fn resolve_after_pull_builds_canonical_reference() {
        let named = "busybox:1.36".parse::<Reference>().unwrap();
        let fresh = vec![ImageSummary {
            id: "sha256:aaaa1111".into(),
            repo_tags: vec!["busybox:1.36".into()],
            repo_digests: vec![format!("busybox@{DIGEST_A}")],
        }];
        let (id, pod_image) = resolve_after_pull(&named, DIGEST_A, &fresh);
        assert_eq!(id.as_deref(), Some("sha256:aaaa1111"));
        assert_eq!(pod_image, format!("busybox@{DIGEST_A}"));
        let (id, pod_image) = resolve_after_pull(&named, DIGEST_C, &fresh);
        assert_eq!(id, None);
        assert_eq!(pod_image, format!("busybox@{DIGEST_C}"));
    }
}
