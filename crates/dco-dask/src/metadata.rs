//! Naming, labels and image references for DaskCluster objects

use std::sync::Arc;

use dco_common::{Error, MetadataProvider, Result};
use kube::ResourceExt;

use crate::crd::{DaskCluster, ImageDefinition};

/// Application name carried in names and labels
pub const APPLICATION_NAME: &str = "dask";
/// Scheduler component
pub const COMPONENT_SCHEDULER: &str = "scheduler";
/// Worker component
pub const COMPONENT_WORKER: &str = "worker";
/// Client-facing proxy
pub const COMPONENT_PROXY: &str = "proxy";

const DEFAULT_REGISTRY: &str = "docker.io";

/// Metadata rules shared by every DaskCluster component
pub fn provider() -> Arc<MetadataProvider<DaskCluster>> {
    Arc::new(MetadataProvider::new(
        APPLICATION_NAME,
        |dc: &DaskCluster| dc.spec.image.tag.clone().unwrap_or_default(),
        |dc: &DaskCluster| dc.spec.global_labels.clone(),
    ))
}

/// Fully qualified reference of an image, e.g. `docker.io/daskdev/dask:2021.6.1`.
///
/// Images without a registry resolve to Docker Hub, single-segment Docker Hub
/// repositories to `library/`, and a missing tag to `latest`.
pub fn image_reference(dc: &DaskCluster) -> Result<String> {
    let image = &dc.spec.image;
    let invalid = |message: &str| {
        Error::validation(
            format!("{}/{}", dc.namespace().unwrap_or_default(), dc.name_any()),
            format!("invalid image {}: {message}", display(image)),
        )
    };

    let repository = image.repository.trim();
    if repository.is_empty() {
        return Err(invalid("repository is empty"));
    }
    if repository.chars().any(|c| c.is_whitespace() || c.is_ascii_uppercase()) {
        return Err(invalid("repository must be lowercase without whitespace"));
    }
    let tag = image.tag.as_deref().map(str::trim).filter(|t| !t.is_empty());
    if tag.is_some_and(|t| t.contains(|c: char| c.is_whitespace() || c == ':' || c == '/')) {
        return Err(invalid("malformed tag"));
    }

    let registry = image
        .registry
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    let (registry, path) = match registry {
        Some(registry) => (registry, repository.to_string()),
        None => split_registry(repository),
    };
    let path = if registry == DEFAULT_REGISTRY && !path.contains('/') {
        format!("library/{path}")
    } else {
        path
    };

    Ok(format!("{registry}/{path}:{}", tag.unwrap_or("latest")))
}

/// Separate a leading registry host from a repository path
fn split_registry(repository: &str) -> (String, String) {
    match repository.split_once('/') {
        Some((host, rest))
            if host.contains('.') || host.contains(':') || host == "localhost" =>
        {
            (host.to_string(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), repository.to_string()),
    }
}

fn display(image: &ImageDefinition) -> String {
    let mut out = String::new();
    if let Some(registry) = image.registry.as_deref().filter(|r| !r.is_empty()) {
        out.push_str(registry);
        out.push('/');
    }
    out.push_str(&image.repository);
    if let Some(tag) = image.tag.as_deref().filter(|t| !t.is_empty()) {
        out.push(':');
        out.push_str(tag);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DaskClusterSpec;

    fn cluster(image: ImageDefinition) -> DaskCluster {
        let mut dc = DaskCluster::new(
            "analytics",
            DaskClusterSpec {
                image,
                ..Default::default()
            },
        );
        dc.metadata.namespace = Some("team-a".to_string());
        dc
    }

    fn image(registry: Option<&str>, repository: &str, tag: Option<&str>) -> ImageDefinition {
        ImageDefinition {
            registry: registry.map(str::to_string),
            repository: repository.to_string(),
            tag: tag.map(str::to_string),
            pull_policy: None,
        }
    }

    #[test]
    fn references_are_fully_qualified() {
        let cases = [
            (image(None, "daskdev/dask", Some("2021.6.1")), "docker.io/daskdev/dask:2021.6.1"),
            (image(None, "python", None), "docker.io/library/python:latest"),
            (image(Some("test-reg:5000"), "test-repo", Some("test-tag")), "test-reg:5000/test-repo:test-tag"),
            (image(None, "quay.io/org/dask", Some("v1")), "quay.io/org/dask:v1"),
            (image(None, "localhost/dask", Some("")), "localhost/dask:latest"),
        ];
        for (input, expected) in cases {
            assert_eq!(image_reference(&cluster(input)).expect("valid"), expected);
        }
    }

    #[test]
    fn malformed_images_are_rejected() {
        for input in [
            image(None, "", Some("v1")),
            image(None, "Dask", None),
            image(None, "dask", Some("v1:oops")),
        ] {
            let err = image_reference(&cluster(input)).expect_err("invalid");
            assert!(matches!(err, Error::Validation { .. }));
        }
    }

    #[test]
    fn names_and_labels_follow_the_application() {
        let meta = provider();
        let dc = cluster(ImageDefinition::default());
        assert_eq!(meta.instance_name(&dc, None), "analytics-dask");
        assert_eq!(
            meta.instance_name(&dc, Some(COMPONENT_WORKER)),
            "analytics-dask-worker"
        );
        let labels = meta.standard_labels(&dc);
        assert_eq!(labels["app.kubernetes.io/version"], "2021.6.1");
        assert_eq!(labels["app.kubernetes.io/name"], "dask");
    }
}
