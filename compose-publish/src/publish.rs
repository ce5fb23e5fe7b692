//! The publish pipeline
//!
//! Stages run in a fixed order, each consuming the previous stage's output:
//! pin images, hash configurations, collect layers, post the per-arch
//! layers manifests, pack the bundle and push the App manifest.

use crate::{
    archive,
    cancel::CancelToken,
    compose,
    digest::sha256_hex,
    distribution::{Client, Gateway},
    error::*,
    layers::{ArchToLayers, LayerCollector},
    manifest::{AppManifest, Descriptor, LayersManifest, OCI_CONFIG, OCI_INDEX, OCI_MANIFEST},
    media_types,
    resolver::Resolver,
    Digest, ImageName,
};
use serde_yaml::Value;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// The device-side consumer rejects App manifests of 2048 bytes and more;
/// stay below it with a reserve
pub const MAX_MANIFEST_BODY_SIZE: usize = 2010;

/// Name of the bundle written to the temp directory on a dry run
pub const DRY_RUN_BUNDLE: &str = "compose-bundle.tgz";

#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Path of the Compose document; its directory is the App directory
    pub file: PathBuf,
    /// Target repository reference, `target[:tag]`
    pub target: String,
    /// Write the digest of the published manifest here
    pub digest_file: Option<PathBuf>,
    /// Perform reads and computation only; no uploads
    pub dry_run: bool,
    /// Architecture allow-list; empty keeps every common architecture
    pub arch_list: Vec<String>,
    /// Out-of-band pins, each a digest-bearing image URI
    pub pinned_images: Vec<String>,
    /// Path of a JSON file embedded as the App layers metadata blob
    pub layers_meta: Option<PathBuf>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            file: PathBuf::from(archive::COMPOSE_FILE),
            target: String::new(),
            digest_file: None,
            dry_run: false,
            arch_list: Vec::new(),
            pinned_images: Vec::new(),
            layers_meta: None,
        }
    }
}

/// Run the whole publish pipeline and return the App manifest digest
pub fn publish(gateway: &Gateway, opts: &PublishOptions, cancel: &CancelToken) -> Result<Digest> {
    cancel.check()?;
    let content = fs::read_to_string(&opts.file)?;
    let mut config: Value = serde_yaml::from_str(&content)?;
    let app_dir = match opts.file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let target = ImageName::parse(&opts.target)?;

    log::info!("= Pinning service images...");
    let resolver = Resolver::new(gateway, &opts.pinned_images, cancel.clone())?;
    resolver.pin_services(compose::services(&mut config)?)?;

    cancel.check()?;
    log::info!("== Hashing services...");
    compose::hash_services(compose::services(&mut config)?)?;

    cancel.check()?;
    log::info!("= Getting app layers metadata...");
    let collector = LayerCollector::new(gateway, opts.arch_list.clone(), cancel.clone());
    let app_layers = collector.collect(compose::services(&mut config)?)?;

    cancel.check()?;
    log::info!("= Posting app layers manifests...");
    let repo = gateway.repository(&target, cancel)?;
    let layer_manifests = post_layers_manifests(&repo, &app_layers, opts.dry_run)?;

    cancel.check()?;
    log::info!("= Publishing app...");
    let digest = create_app(&repo, &target, &config, &app_dir, opts, &layer_manifests)?;

    if let Some(path) = &opts.digest_file {
        fs::write(path, digest.to_string().as_bytes())?;
    }
    Ok(digest)
}

/// Compose one layers manifest per architecture, in ascending arch order
fn compose_layers_manifests(
    layers: &ArchToLayers,
) -> Result<Vec<(String, LayersManifest, Descriptor)>> {
    layers
        .iter()
        .map(|(arch, arch_layers)| {
            let manifest = LayersManifest::new(arch, arch_layers.clone());
            let descriptor = manifest.descriptor()?;
            Ok((arch.clone(), manifest, descriptor))
        })
        .collect()
}

/// Serialize and upload one manifest per architecture
///
/// The server-assigned digest must equal the client-computed one; a
/// mismatch means the canonical byte form diverged and is fatal. On a dry
/// run the upload is skipped but the descriptor is still emitted so
/// downstream assembly can proceed.
pub fn post_layers_manifests(
    repo: &Client,
    layers: &ArchToLayers,
    dry_run: bool,
) -> Result<Vec<Descriptor>> {
    let mut descriptors = Vec::with_capacity(layers.len());
    for (arch, manifest, descriptor) in compose_layers_manifests(layers)? {
        if dry_run {
            log::info!("  |-> skipping layer manifest publishing for dryrun");
        } else {
            log::info!("  |-> posting a layer manifest for architecture: {}...", arch);
            let bytes = manifest.to_canonical_json()?;
            let posted = repo.put_manifest(&descriptor.digest().to_string(), &bytes, OCI_INDEX)?;
            if posted != *descriptor.digest() {
                return Err(Error::DigestMismatch);
            }
            log::info!("OK |-> digest: {}", posted);
        }
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}

/// Render the App manifest and enforce the size limit
fn render_app_manifest(
    config_desc: Descriptor,
    archive_desc: Descriptor,
    meta_desc: Option<Descriptor>,
    layer_manifests: &[Descriptor],
) -> Result<Vec<u8>> {
    let mut blobs = vec![archive_desc];
    blobs.extend(meta_desc);
    let manifest = AppManifest::new(config_desc, blobs);
    let body = manifest.render(layer_manifests)?;

    log::info!("  |-> manifest size: {}", body.len());
    if body.len() >= MAX_MANIFEST_BODY_SIZE {
        return Err(Error::ManifestTooLarge {
            size: body.len(),
            max: MAX_MANIFEST_BODY_SIZE,
        });
    }
    Ok(body)
}

/// Pack the App directory, upload the blobs and push the tagged manifest
fn create_app(
    repo: &Client,
    target: &ImageName,
    config: &Value,
    app_dir: &Path,
    opts: &PublishOptions,
    layer_manifests: &[Descriptor],
) -> Result<Digest> {
    let pinned = serde_yaml::to_string(config)?;
    log::info!("  |-> pinned content hash: {}", sha256_hex(pinned.as_bytes()));

    let bundle = archive::pack_app_dir(app_dir, pinned.as_bytes())?;
    log::info!("  |-> app archive hash: {}", sha256_hex(&bundle));

    let layers_meta = match &opts.layers_meta {
        Some(path) => Some(fs::read(path)?),
        None => None,
    };

    if opts.dry_run {
        log::info!("Pinned compose:\n{}", pinned);
        log::info!("Skipping publishing for dryrun");
        let out = std::env::temp_dir().join(DRY_RUN_BUNDLE);
        fs::write(&out, &bundle)?;
        log::info!("  |-> app archive: {}", out.display());

        let config_desc =
            Descriptor::new(OCI_CONFIG.to_string(), Digest::from_buf_sha256(b""), 0);
        let archive_desc = Descriptor::new(
            media_types::APP_ARCHIVE.to_string(),
            Digest::from_buf_sha256(&bundle),
            bundle.len() as i64,
        );
        let meta_desc = layers_meta.map(|meta| {
            let mut desc = Descriptor::new(
                media_types::LAYERS_META.to_string(),
                Digest::from_buf_sha256(&meta),
                meta.len() as i64,
            );
            let (key, value) = media_types::LAYERS_META_ANNOTATION;
            desc.annotate(key, value);
            desc
        });
        let body = render_app_manifest(config_desc, archive_desc, meta_desc, layer_manifests)?;
        return Ok(Digest::from_buf_sha256(&body));
    }

    let archive_desc = repo.push_blob(&bundle, media_types::APP_ARCHIVE)?;
    log::info!("  |-> app blob: {}", archive_desc.digest());

    let meta_desc = match layers_meta {
        Some(meta) => {
            let mut desc = repo.push_blob(&meta, media_types::LAYERS_META)?;
            let (key, value) = media_types::LAYERS_META_ANNOTATION;
            desc.annotate(key, value);
            log::info!("  |-> app layers meta: {}", desc.digest());
            Some(desc)
        }
        None => None,
    };

    // The manifest's config points at the empty blob
    let config_desc = repo.push_blob(b"", OCI_CONFIG)?;

    let body = render_app_manifest(config_desc, archive_desc, meta_desc, layer_manifests)?;
    let tag = target.tag_or_latest();
    let digest = repo.put_manifest(tag.as_str(), &body, OCI_MANIFEST)?;
    log::info!("  |-> manifest: {}", digest);
    Ok(digest)
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

    fn config_desc() -> Descriptor {
        Descriptor::new(OCI_CONFIG.to_string(), Digest::from_buf_sha256(b""), 0)
    }

    fn archive_desc() -> Descriptor {
        Descriptor::new(
            media_types::APP_ARCHIVE.to_string(),
            Digest::from_buf_sha256(b"tgz"),
            3,
        )
    }

    #[test]
    fn layers_manifests_come_in_arch_order() {
        let mut layers = ArchToLayers::new();
        layers.insert("arm64".to_string(), vec![desc(1)]);
        layers.insert("amd64".to_string(), vec![desc(2)]);

        let composed = compose_layers_manifests(&layers).unwrap();
        let archs: Vec<&str> = composed.iter().map(|(arch, _, _)| arch.as_str()).collect();
        assert_eq!(archs, ["amd64", "arm64"]);
    }

    #[test]
    fn app_manifest_orders_archive_before_meta() {
        let mut meta = Descriptor::new(
            media_types::LAYERS_META.to_string(),
            Digest::from_buf_sha256(b"meta"),
            4,
        );
        let (key, value) = media_types::LAYERS_META_ANNOTATION;
        meta.annotate(key, value);

        let body =
            render_app_manifest(config_desc(), archive_desc(), Some(meta), &[desc(1)]).unwrap();
        let json = String::from_utf8(body).unwrap();
        let archive_at = json.find(media_types::APP_ARCHIVE).unwrap();
        let meta_at = json.find(media_types::LAYERS_META).unwrap();
        assert!(archive_at < meta_at);
        assert!(json.contains("\"layers-meta\": \"v1\""));
    }

    #[test]
    fn size_limit_is_enforced() {
        // Enough per-arch descriptors to overflow the byte limit
        let many: Vec<Descriptor> = (0..12).map(desc).collect();
        let result = render_app_manifest(config_desc(), archive_desc(), None, &many);
        assert!(matches!(
            result,
            Err(Error::ManifestTooLarge { size, max })
                if size >= MAX_MANIFEST_BODY_SIZE && max == MAX_MANIFEST_BODY_SIZE
        ));
    }

    #[test]
    fn two_architectures_fit_the_limit() {
        let descriptors: Vec<Descriptor> = ["amd64", "arm64"]
            .iter()
            .enumerate()
            .map(|(i, arch)| {
                let mut desc = Descriptor::new(
                    OCI_INDEX.to_string(),
                    Digest::from_buf_sha256(&[i as u8]),
                    512,
                );
                desc.set_platform(crate::manifest::Platform::arch(arch));
                desc
            })
            .collect();
        let body =
            render_app_manifest(config_desc(), archive_desc(), None, &descriptors).unwrap();
        assert!(body.len() < MAX_MANIFEST_BODY_SIZE);
    }
}
