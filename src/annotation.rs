use crate::error::{Error, Result};
use crate::image_reference::is_digest_pinned;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub static CONFIG_ANNOTATION: &str = "kube-digestpin/config";

/// Image a container is meant to track, as recorded in the config annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerImage {
    pub name: String,
    pub image: String,
}

impl ContainerImage {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }
}

/// Value of the `kube-digestpin/config` annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigAnnotation {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub containers: Vec<ContainerImage>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub init_containers: Vec<ContainerImage>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<ContainerImage>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

impl ConfigAnnotation {
    pub fn decode(raw: Option<&str>) -> Result<Self> {
        match raw.filter(|raw| !raw.trim().is_empty()) {
            Some(raw) => serde_json::from_str(raw).map_err(|source| Error::AnnotationDecode {
                annotation: CONFIG_ANNOTATION,
                source,
            }),
            None => Ok(Self::default()),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Merges the stored annotation with the live pod spec, independently for
    /// containers and init containers.
    pub fn merge(existing: Option<&str>, pod_spec: &PodSpec) -> Result<Self> {
        let stored = Self::decode(existing)?;
        Ok(Self {
            containers: merge_containers(&stored.containers, &pod_spec.containers),
            init_containers: merge_containers(
                &stored.init_containers,
                pod_spec.init_containers.as_deref().unwrap_or_default(),
            ),
        })
    }
}

/// - in the live spec only: tracked with the live image
/// - in both, live image pinned to a digest: stored image is kept, the digest
///   is most likely our own earlier write
/// - in both, live image not pinned: the live image wins
/// - stored only: dropped
fn merge_containers(stored: &[ContainerImage], live: &[Container]) -> Vec<ContainerImage> {
    let live_images: BTreeMap<&str, &str> = live
        .iter()
        .filter_map(|c| Some((c.name.as_str(), c.image.as_deref()?)))
        .filter(|(_, image)| !image.is_empty())
        .collect();

    let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
    // an entry without image is treated as untracked
    for entry in stored.iter().filter(|entry| !entry.image.is_empty()) {
        let Some(&live_image) = live_images.get(entry.name.as_str()) else {
            continue;
        };
        let image = if is_digest_pinned(live_image) {
            entry.image.as_str()
        } else {
            live_image
        };
        merged.insert(&entry.name, image);
    }
    for (&name, &image) in &live_images {
        merged.entry(name).or_insert(image);
    }

    merged
        .into_iter()
        .map(|(name, image)| ContainerImage::new(name, image))
        .collect()
}
