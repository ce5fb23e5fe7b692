//! Pin every service image to an immutable content digest

use crate::{
    cancel::CancelToken,
    compose,
    distribution::Gateway,
    error::*,
    manifest::ManifestKind,
    Digest, ImageName,
};
use oci_spec::image::ImageIndex;
use serde_yaml::Mapping;
use std::collections::HashMap;

/// Resolves tag, digest and externally pinned image references
///
/// After [Resolver::pin_services] every service's `image` attribute carries
/// the `<domain>/<path>@<digest>` form and `build` stanzas are gone.
pub struct Resolver<'a> {
    gateway: &'a Gateway,
    /// Repository (`<domain>/<path>`) to externally supplied digest
    pins: HashMap<String, Digest>,
    cancel: CancelToken,
}

impl<'a> Resolver<'a> {
    /// `pinned_images` entries must be digest-bearing image URIs
    pub fn new(
        gateway: &'a Gateway,
        pinned_images: &[String],
        cancel: CancelToken,
    ) -> Result<Self> {
        let mut pins = HashMap::new();
        for image in pinned_images {
            let name = ImageName::parse(image)?;
            let digest = name
                .digest
                .clone()
                .ok_or_else(|| Error::UnpinnedReference(image.clone()))?;
            pins.insert(name.repository(), digest);
        }
        Ok(Self {
            gateway,
            pins,
            cancel,
        })
    }

    /// Pin all services in place, preserving their order
    pub fn pin_services(&self, services: &mut Mapping) -> Result<()> {
        for (name, entry) in services.iter_mut() {
            let (name, entry) = compose::as_service_entry(name, entry)?;
            self.pin_service(&name, entry)?;
        }
        Ok(())
    }

    fn pin_service(&self, name: &str, entry: &mut Mapping) -> Result<()> {
        let image = compose::image_of(name, entry)?;
        if compose::strip_build(entry) {
            log::info!("Removing service({}) 'build' stanza", name);
        }

        log::info!("Pinning {}({})", name, image);
        let image_name = ImageName::parse(&image)?;
        let repo = self.gateway.repository(&image_name, &self.cancel)?;

        let digest = if let Some(digest) = &image_name.digest {
            digest.clone()
        } else if let Some(tag) = &image_name.tag {
            repo.resolve_tag(tag.as_str())?.digest().clone()
        } else if let Some(digest) = self.pins.get(&image_name.repository()) {
            digest.clone()
        } else {
            return Err(Error::UnpinnedReference(image.clone()));
        };

        let bytes = repo.get_manifest(&digest)?;
        match ManifestKind::from_slice(&bytes, &image)? {
            ManifestKind::Index(index) => log::info!("  | {}", arch_summary(&index)),
            ManifestKind::SingleArch(_) => {}
        }

        let pinned = image_name.pinned_with(&digest);
        log::info!("  |-> {}", pinned);
        compose::set_image(entry, &pinned);
        Ok(())
    }
}

/// Architectures announced by an index, `arm` with its variant appended
fn arch_summary(index: &ImageIndex) -> String {
    let archs: Vec<String> = index
        .manifests()
        .iter()
        .filter_map(|child| child.platform().as_ref())
        .map(|platform| {
            let arch = platform.architecture().to_string();
            match platform.variant() {
                Some(variant) if arch == "arm" => format!("{}{}", arch, variant),
                _ => arch,
            }
        })
        .collect();
    archs.join(", ")
}
