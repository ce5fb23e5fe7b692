//! Manifests pulled from registries and the synthesized App documents
//!
//! Pulled manifests are only inspected, never mutated; the documents this
//! tool uploads are built from scratch so their byte form is part of the
//! wire contract.

use crate::{error::*, media_types, Digest};
use oci_spec::image::{ImageIndex, ImageManifest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SCHEMA_VERSION: u32 = 2;

pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// A registry object pointer
///
/// Two descriptors are equal iff their digests are equal.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    media_type: String,
    digest: Digest,
    size: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    annotations: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    platform: Option<Platform>,
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Descriptor {
    pub fn new(media_type: String, digest: Digest, size: i64) -> Self {
        Self {
            media_type,
            digest,
            size,
            annotations: None,
            platform: None,
        }
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn annotate(&mut self, key: &str, value: &str) {
        self.annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_platform(&mut self, platform: Platform) {
        self.platform = Some(platform);
    }
}

impl TryFrom<&oci_spec::image::Descriptor> for Descriptor {
    type Error = Error;

    fn try_from(desc: &oci_spec::image::Descriptor) -> Result<Self> {
        Ok(Self {
            media_type: desc.media_type().to_string(),
            digest: Digest::new(desc.digest())?,
            size: desc.size(),
            annotations: desc
                .annotations()
                .as_ref()
                .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            platform: None,
        })
    }
}

/// Platform of a single-architecture manifest
///
/// `os` stays out of the layers manifests to keep them small for the
/// device-side consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub variant: Option<String>,
}

impl Platform {
    pub fn arch(architecture: &str) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: None,
            variant: None,
        }
    }
}

/// Kind of a manifest pulled from a registry
///
/// Either an index of per-platform child manifests or a single-architecture
/// schema-2 manifest.
pub enum ManifestKind {
    Index(ImageIndex),
    SingleArch(ImageManifest),
}

impl ManifestKind {
    /// Classify raw manifest bytes, by media type first, structure second
    pub fn from_slice(bytes: &[u8], image: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let media_type = value.get("mediaType").and_then(|v| v.as_str());
        let is_index = match media_type {
            Some(OCI_INDEX) | Some(DOCKER_LIST) => true,
            Some(OCI_MANIFEST) | Some(DOCKER_MANIFEST) => false,
            Some(_) => return Err(Error::UnexpectedManifestKind(image.to_string())),
            None if value.get("manifests").is_some() => true,
            None if value.get("layers").is_some() => false,
            None => return Err(Error::UnexpectedManifestKind(image.to_string())),
        };
        if is_index {
            Ok(Self::Index(ImageIndex::from_reader(bytes)?))
        } else {
            Ok(Self::SingleArch(ImageManifest::from_reader(bytes)?))
        }
    }
}

/// The per-architecture layers manifest
///
/// Lists exactly the layer descriptors the App needs for one architecture.
/// Serialized with two-space indentation; those bytes are the manifest's
/// identity.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayersManifest {
    schema_version: u32,
    media_type: String,
    platform: Platform,
    layers: Vec<Descriptor>,
    annotations: BTreeMap<String, String>,
}

impl LayersManifest {
    pub fn new(arch: &str, layers: Vec<Descriptor>) -> Self {
        let (key, value) = media_types::LAYERS_ANNOTATION;
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: OCI_INDEX.to_string(),
            platform: Platform::arch(arch),
            layers,
            annotations: BTreeMap::from([(key.to_string(), value.to_string())]),
        }
    }

    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Descriptor of the serialized manifest, carrying the platform
    pub fn descriptor(&self) -> Result<Descriptor> {
        let bytes = self.to_canonical_json()?;
        let mut desc = Descriptor::new(
            OCI_INDEX.to_string(),
            Digest::from_buf_sha256(&bytes),
            bytes.len() as i64,
        );
        desc.set_platform(self.platform.clone());
        Ok(desc)
    }
}

/// The top-level App manifest
///
/// A standard OCI manifest whose `layers` reference the Compose bundle and
/// optional metadata blob, extended with a non-standard `manifests` field
/// carrying the per-architecture layers-manifest descriptors.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppManifest {
    schema_version: u32,
    media_type: String,
    config: Descriptor,
    layers: Vec<Descriptor>,
    annotations: BTreeMap<String, String>,
}

impl AppManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        let (key, value) = media_types::APP_ANNOTATION;
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: OCI_MANIFEST.to_string(),
            config,
            layers,
            annotations: BTreeMap::from([(key.to_string(), value.to_string())]),
        }
    }

    /// Serialize with the `manifests` field injected after the standard keys
    ///
    /// Key order is insertion order and the indent is three spaces; the size
    /// cap downstream is enforced on exactly these bytes.
    pub fn render(&self, layer_manifests: &[Descriptor]) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        value
            .as_object_mut()
            .expect("a serialized struct is always a JSON object")
            .insert(
                "manifests".to_string(),
                serde_json::to_value(layer_manifests)?,
            );

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"   ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        value.serialize(&mut ser)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(byte: u8) -> Descriptor {
        Descriptor::new(
            "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
            Digest::from_buf_sha256(&[byte]),
            1,
        )
    }

    #[test]
    fn descriptor_equality_is_digest_equality() {
        let mut a = desc(1);
        let b = desc(1);
        a.annotate("k", "v");
        assert_eq!(a, b);
        assert_ne!(desc(1), desc(2));
    }

    #[test]
    fn classify_index() {
        let bytes = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": []
        }"#;
        assert!(matches!(
            ManifestKind::from_slice(bytes, "img").unwrap(),
            ManifestKind::Index(_)
        ));
    }

    #[test]
    fn classify_single_arch() {
        let bytes = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                "size": 0
            },
            "layers": []
        }"#;
        assert!(matches!(
            ManifestKind::from_slice(bytes, "img").unwrap(),
            ManifestKind::SingleArch(_)
        ));
    }

    #[test]
    fn classify_without_media_type_by_structure() {
        let bytes = br#"{"schemaVersion": 2, "manifests": []}"#;
        assert!(matches!(
            ManifestKind::from_slice(bytes, "img").unwrap(),
            ManifestKind::Index(_)
        ));
    }

    #[test]
    fn classify_unknown_kind() {
        let bytes = br#"{"schemaVersion": 1, "fsLayers": []}"#;
        assert!(matches!(
            ManifestKind::from_slice(bytes, "img"),
            Err(Error::UnexpectedManifestKind(_))
        ));
    }

    #[test]
    fn layers_manifest_form() {
        let manifest = LayersManifest::new("amd64", vec![desc(1), desc(2)]);
        let json = String::from_utf8(manifest.to_canonical_json().unwrap()).unwrap();
        assert!(json.contains("\"compose-app-layers\": \"v1\""));
        assert!(json.contains("\"architecture\": \"amd64\""));
        // os is omitted from the platform
        assert!(!json.contains("\"os\""));

        let descriptor = manifest.descriptor().unwrap();
        assert_eq!(descriptor.media_type(), OCI_INDEX);
        assert_eq!(descriptor.size() as usize, json.len());
    }

    #[test]
    fn layers_manifest_digest_matches_bytes() {
        let manifest = LayersManifest::new("arm64", vec![desc(3)]);
        let bytes = manifest.to_canonical_json().unwrap();
        assert_eq!(
            *manifest.descriptor().unwrap().digest(),
            Digest::from_buf_sha256(&bytes)
        );
    }

    #[test]
    fn app_manifest_key_order_and_injection() {
        let config = Descriptor::new(OCI_CONFIG.to_string(), Digest::from_buf_sha256(b""), 0);
        let manifest = AppManifest::new(config, vec![desc(1)]);
        let rendered = manifest.render(&[desc(2)]).unwrap();
        let json = String::from_utf8(rendered).unwrap();

        let order = [
            "schemaVersion",
            "mediaType",
            "config",
            "layers",
            "annotations",
            "manifests",
        ];
        let positions: Vec<_> = order
            .iter()
            .map(|key| json.find(&format!("\"{}\"", key)).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted, "keys must keep insertion order");

        assert!(json.contains("\"compose-app\": \"v1\""));
        // Three-space indentation at the top level
        assert!(json.contains("\n   \"schemaVersion\""));
    }
}
