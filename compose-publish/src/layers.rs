//! Expand service images into per-architecture layer sets
//!
//! An architecture survives only when every service image has a manifest
//! for it; the surviving layer sets are deduplicated across services and
//! ordered by digest so equal inputs produce equal outputs.

use crate::{
    cancel::CancelToken,
    compose,
    distribution::{Client, Gateway},
    error::*,
    manifest::{Descriptor, ManifestKind},
    Digest, ImageName,
};
use oci_spec::image::ImageManifest;
use serde_yaml::Mapping;
use std::collections::BTreeMap;

/// Default cap on the number of architectures one App may carry
///
/// The device-side consumer bounds the App manifest size; more
/// architectures would overflow it.
pub const MAX_ARCH_NUMB: usize = 6;

/// Architecture name to its ordered, deduplicated layer descriptors
pub type ArchToLayers = BTreeMap<String, Vec<Descriptor>>;

pub struct LayerCollector<'a> {
    gateway: &'a Gateway,
    arch_list: Vec<String>,
    max_archs: usize,
    cancel: CancelToken,
}

impl<'a> LayerCollector<'a> {
    pub fn new(gateway: &'a Gateway, arch_list: Vec<String>, cancel: CancelToken) -> Self {
        Self {
            gateway,
            arch_list,
            max_archs: MAX_ARCH_NUMB,
            cancel,
        }
    }

    /// Collect the per-architecture layer sets of the pinned services
    pub fn collect(&self, services: &Mapping) -> Result<ArchToLayers> {
        let mut repos: BTreeMap<String, (ImageName, Client)> = BTreeMap::new();
        let mut table = ArchTable::default();

        for (name, entry) in services.iter() {
            let service = name.as_str().unwrap_or_default().to_string();
            let entry = entry
                .as_mapping()
                .ok_or_else(|| Error::InvalidService(service.clone()))?;
            let image = compose::image_of(&service, entry)?;
            let image_name = ImageName::parse(&image)?;
            let digest = image_name
                .digest
                .clone()
                .ok_or_else(|| Error::UnpinnedReference(image.clone()))?;

            let client = self.gateway.repository(&image_name, &self.cancel)?;
            let bytes = client.get_manifest(&digest)?;
            match ManifestKind::from_slice(&bytes, &image)? {
                ManifestKind::Index(index) => {
                    // An image may announce one arch more than once; keying
                    // by (arch, service) collapses the duplicates
                    for child in index.manifests() {
                        if let Some(platform) = child.platform().as_ref() {
                            table.record(
                                platform.architecture().to_string(),
                                &service,
                                Digest::new(child.digest())?,
                            );
                        }
                    }
                }
                ManifestKind::SingleArch(manifest) => {
                    let config = client.get_blob(&Digest::new(manifest.config().digest())?)?;
                    let arch = image_config_arch(&config)
                        .ok_or_else(|| Error::UnexpectedManifestKind(image.clone()))?;
                    table.record(arch, &service, digest.clone());
                }
            }
            repos.insert(service, (image_name, client));
        }

        let surviving = table.intersect(repos.len(), &self.arch_list, self.max_archs)?;

        let mut app_layers = ArchToLayers::new();
        for (arch, per_service) in surviving {
            self.cancel.check()?;
            log::info!("  |-> getting app layers for architecture: {}", arch);
            let mut manifests = Vec::with_capacity(per_service.len());
            for (service, digest) in &per_service {
                let (image_name, client) = repos
                    .get(service)
                    .ok_or_else(|| Error::InvalidService(service.clone()))?;
                let bytes = client.get_manifest(digest)?;
                match ManifestKind::from_slice(&bytes, &image_name.to_string())? {
                    ManifestKind::SingleArch(manifest) => manifests.push(manifest),
                    ManifestKind::Index(_) => {
                        return Err(Error::UnexpectedManifestKind(image_name.to_string()))
                    }
                }
            }
            app_layers.insert(arch, union_layers(manifests.iter())?);
        }
        Ok(app_layers)
    }
}

/// `architecture` field of an image config blob
fn image_config_arch(config: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(config)
        .ok()?
        .get("architecture")?
        .as_str()
        .map(str::to_string)
}

/// Union the layers of several manifests, deduplicated by digest and sorted
/// ascending by digest hex
fn union_layers<'m>(manifests: impl Iterator<Item = &'m ImageManifest>) -> Result<Vec<Descriptor>> {
    let mut layers: BTreeMap<String, Descriptor> = BTreeMap::new();
    for manifest in manifests {
        for layer in manifest.layers() {
            let descriptor = Descriptor::try_from(layer)?;
            layers.insert(descriptor.digest().encoded.clone(), descriptor);
        }
    }
    Ok(layers.into_values().collect())
}

/// Architecture to (service to manifest digest)
#[derive(Default)]
struct ArchTable {
    entries: BTreeMap<String, BTreeMap<String, Digest>>,
}

impl ArchTable {
    fn record(&mut self, arch: String, service: &str, digest: Digest) {
        self.entries
            .entry(arch)
            .or_default()
            .insert(service.to_string(), digest);
    }

    /// Keep only architectures covered by every service and allowed by the
    /// caller, bounded by `max`
    fn intersect(
        self,
        quorum: usize,
        allow: &[String],
        max: usize,
    ) -> Result<BTreeMap<String, BTreeMap<String, Digest>>> {
        let mut surviving = BTreeMap::new();
        for (arch, per_service) in self.entries {
            if per_service.len() != quorum {
                log::info!(
                    "  |-> exclude {} architecture, some of the app images ({} images) don't have manifest for it",
                    arch,
                    quorum - per_service.len()
                );
                continue;
            }
            if !allow.is_empty() && !allow.iter().any(|allowed| allowed == &arch) {
                log::info!(
                    "  |-> exclude {} architecture since it's not in a list of the supported architectures: {:?}",
                    arch,
                    allow
                );
                continue;
            }
            surviving.insert(arch, per_service);
        }
        if surviving.is_empty() {
            return Err(Error::NoCommonArchitecture);
        }
        if surviving.len() > max {
            return Err(Error::TooManyArchitectures {
                found: surviving.len(),
                max,
            });
        }
        Ok(surviving)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(byte: u8) -> Digest {
        Digest::from_buf_sha256(&[byte])
    }

    fn table(records: &[(&str, &str)]) -> ArchTable {
        let mut table = ArchTable::default();
        for (i, (arch, service)) in records.iter().enumerate() {
            table.record(arch.to_string(), service, digest(i as u8));
        }
        table
    }

    #[test]
    fn asymmetric_archs_are_excluded() {
        // Service a supports amd64, arm64 and arm; service b only the first two
        let table = table(&[
            ("amd64", "a"),
            ("arm64", "a"),
            ("arm", "a"),
            ("amd64", "b"),
            ("arm64", "b"),
        ]);
        let surviving = table.intersect(2, &[], MAX_ARCH_NUMB).unwrap();
        assert_eq!(
            surviving.keys().map(String::as_str).collect::<Vec<_>>(),
            ["amd64", "arm64"]
        );
    }

    #[test]
    fn allow_list_filters_surviving_set() {
        let table = table(&[
            ("amd64", "a"),
            ("arm64", "a"),
            ("amd64", "b"),
            ("arm64", "b"),
        ]);
        let surviving = table
            .intersect(2, &["amd64".to_string()], MAX_ARCH_NUMB)
            .unwrap();
        assert_eq!(
            surviving.keys().map(String::as_str).collect::<Vec<_>>(),
            ["amd64"]
        );
    }

    #[test]
    fn duplicate_children_collapse_per_service() {
        // One image announcing amd64 twice counts once toward the quorum
        let mut table = ArchTable::default();
        table.record("amd64".to_string(), "a", digest(1));
        table.record("amd64".to_string(), "a", digest(2));
        table.record("amd64".to_string(), "b", digest(3));
        let surviving = table.intersect(2, &[], MAX_ARCH_NUMB).unwrap();
        assert_eq!(surviving["amd64"].len(), 2);
    }

    #[test]
    fn no_common_architecture() {
        let table = table(&[("amd64", "a"), ("arm64", "b")]);
        assert!(matches!(
            table.intersect(2, &[], MAX_ARCH_NUMB),
            Err(Error::NoCommonArchitecture)
        ));
    }

    #[test]
    fn allow_list_can_empty_the_set() {
        let table = table(&[("amd64", "a")]);
        assert!(matches!(
            table.intersect(1, &["riscv64".to_string()], MAX_ARCH_NUMB),
            Err(Error::NoCommonArchitecture)
        ));
    }

    #[test]
    fn too_many_architectures() {
        let archs = ["amd64", "arm", "arm64", "i386", "ppc64le", "riscv64", "s390x"];
        let mut table = ArchTable::default();
        for (i, arch) in archs.iter().enumerate() {
            table.record(arch.to_string(), "a", digest(i as u8));
        }
        assert!(matches!(
            table.intersect(1, &[], MAX_ARCH_NUMB),
            Err(Error::TooManyArchitectures { found: 7, max: MAX_ARCH_NUMB })
        ));
    }

    fn manifest_with_layers(digests: &[&Digest]) -> ImageManifest {
        let layers: Vec<serde_json::Value> = digests
            .iter()
            .map(|digest| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": digest.to_string(),
                    "size": 1
                })
            })
            .collect();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": digest(0).to_string(),
                "size": 2
            },
            "layers": layers
        });
        ImageManifest::from_reader(manifest.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn layers_deduplicate_and_sort_by_digest_hex() {
        let (a, b, shared) = (digest(1), digest(2), digest(3));
        let first = manifest_with_layers(&[&a, &shared]);
        let second = manifest_with_layers(&[&shared, &b]);

        let union = union_layers([first, second].iter()).unwrap();
        let hexes: Vec<&str> = union
            .iter()
            .map(|layer| layer.digest().encoded.as_str())
            .collect();

        assert_eq!(union.len(), 3);
        let mut sorted = hexes.clone();
        sorted.sort_unstable();
        assert_eq!(hexes, sorted, "layers must be hex-ascending");
        assert_eq!(
            hexes.iter().collect::<std::collections::HashSet<_>>().len(),
            3,
            "no duplicate digests"
        );
    }

    #[test]
    fn image_config_arch_field() {
        let config = br#"{"architecture": "arm64", "os": "linux"}"#;
        assert_eq!(image_config_arch(config).as_deref(), Some("arm64"));
        assert_eq!(image_config_arch(br#"{"os": "linux"}"#), None);
    }
}
