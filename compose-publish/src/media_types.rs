//! Media types and annotation keys used by the published App artifact

/// The media type of the compressed Compose bundle blob
pub const APP_ARCHIVE: &str = "application/tar+gzip";

/// The media type of the optional App layers metadata blob
pub const LAYERS_META: &str = "application/json";

/// Annotation marking the top-level App manifest
pub const APP_ANNOTATION: (&str, &str) = ("compose-app", "v1");

/// Annotation marking every per-architecture layers manifest
pub const LAYERS_ANNOTATION: (&str, &str) = ("compose-app-layers", "v1");

/// Annotation on the layers-metadata blob descriptor
pub const LAYERS_META_ANNOTATION: (&str, &str) = ("layers-meta", "v1");

/// Label injected into every pinned service configuration
pub const CONFIG_HASH_LABEL: &str = "io.compose-spec.config-hash";
