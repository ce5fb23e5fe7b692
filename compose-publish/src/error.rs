use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Invalid user input
    //
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
    #[error("Invalid name for repository: {0}")]
    InvalidName(String),
    #[error(transparent)]
    InvalidPort(#[from] std::num::ParseIntError),
    #[error("Invalid reference to image: {0}")]
    InvalidReference(String),
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unable to find 'services' section of compose file")]
    MissingServices,
    #[error("Service({0}) has invalid format")]
    InvalidService(String),

    //
    // Pinning and layer collection
    //
    #[error("Service({0}) missing 'image' attribute")]
    MissingImage(String),
    #[error("Invalid reference type for {0}: images must be pinned to a `:<tag>` or `@sha256:<hash>`")]
    UnpinnedReference(String),
    #[error("Unexpected kind of manifest for image: {0}")]
    UnexpectedManifestKind(String),
    #[error("No architecture is supported by every app image")]
    NoCommonArchitecture,
    #[error("Number of app architectures ({found}) exceeds the maximum ({max})")]
    TooManyArchitectures { found: usize, max: usize },

    //
    // Archive
    //
    #[error("A .composeappignores rule is discarding docker-compose.yml")]
    ComposeExcluded,
    #[error("Unsupported kind of file in the app directory: {0}")]
    UnsupportedFileKind(PathBuf),

    //
    // Manifest assembly and upload
    //
    #[error("Digest of the posted manifest doesn't match to the composed manifest digest")]
    DigestMismatch,
    #[error("App manifest size ({size}) exceeds the maximum size limit ({max})")]
    ManifestTooLarge { size: usize, max: usize },
    #[error("Fetch from repository '{repo}' failed: HTTP {status}")]
    RegistryFetchFailed { repo: String, status: u16 },
    #[error("Push to repository '{repo}' failed: HTTP {status}")]
    RegistryPutFailed { repo: String, status: u16 },

    //
    // Error from OCI registry transport
    //
    #[error(transparent)]
    NetworkError(Box<ureq::Transport>),
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(url::Url),
    #[error("Unsupported WWW-Authenticate header: {0}")]
    UnsupportedAuthHeader(String),

    //
    // System error
    //
    #[error("Operation cancelled")]
    Cancelled,
    #[error(transparent)]
    InvalidJson(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    UnknownIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<oci_spec::OciSpecError> for Error {
    fn from(e: oci_spec::OciSpecError) -> Self {
        match e {
            oci_spec::OciSpecError::SerDe(e) => Error::InvalidJson(e),
            oci_spec::OciSpecError::Io(e) => Error::UnknownIo(e),
            other => Error::UnknownIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                other.to_string(),
            )),
        }
    }
}

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        Self::UnknownIo(e.into())
    }
}

impl From<globset::Error> for Error {
    fn from(e: globset::Error) -> Self {
        Self::UnknownIo(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    }
}
