use crate::{
    distribution::{Name, Reference},
    error::*,
    Digest,
};
use std::fmt;
use url::Url;

/// Image name
///
/// Terminology
/// ------------
/// We call each component of an image name to match OCI distribution spec:
///
/// ```text
/// ghcr.io/foundriesio/app:latest
/// ^^^^^^^------------------------ hostname
///         ^^^^^^^^^^^^^^^-------- name
///                         ^^^^^^- tag
/// ```
///
/// A reference may instead be pinned to a content digest:
///
/// ```text
/// ghcr.io/foundriesio/app@sha256:a3ed95ca...
/// ```
///
/// or carry neither, in which case only an external pin can resolve it.
///
/// Default values
/// ---------------
/// If `hostname` is absent, `registry-1.docker.io` is used for docker
/// compatibility, and a bare single-component name gains the `library/`
/// namespace:
///
/// ```
/// use compose_publish::ImageName;
/// let name = ImageName::parse("nginx:1.25")?;
/// assert_eq!(name.hostname, "registry-1.docker.io");
/// assert_eq!(name.name.as_str(), "library/nginx");
/// assert_eq!(name.tag.unwrap().as_str(), "1.25");
/// # Ok::<(), compose_publish::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    pub hostname: String,
    pub port: Option<u16>,
    pub name: Name,
    pub tag: Option<Reference>,
    pub digest: Option<Digest>,
}

pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository())?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        } else if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        Ok(())
    }
}

impl ImageName {
    pub fn parse(name: &str) -> Result<Self> {
        let (rest, digest) = match name.split_once('@') {
            Some((rest, digest)) => (rest, Some(Digest::new(digest)?)),
            None => (name, None),
        };

        // The first component is a registry host only if it can be one;
        // otherwise the whole reference lives on the default registry.
        let (host, path) = match rest.split_once('/') {
            Some((host, path))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (Some(host), path)
            }
            _ => (None, rest),
        };

        let (hostname, port) = match host {
            Some(host) => match host.split_once(':') {
                Some((hostname, port)) => (hostname.to_string(), Some(str::parse(port)?)),
                None => (host.to_string(), None),
            },
            None => (DEFAULT_REGISTRY.to_string(), None),
        };

        let (path, tag) = match path.split_once(':') {
            // A digest pins the reference; any tag next to it is ignored
            Some((path, _)) if digest.is_some() => (path, None),
            Some((path, tag)) => (path, Some(Reference::new(tag)?)),
            None => (path, None),
        };

        let path = if host.is_none() && !path.contains('/') {
            format!("library/{}", path)
        } else {
            path.to_string()
        };

        Ok(ImageName {
            hostname,
            port,
            name: Name::new(&path)?,
            tag,
            digest,
        })
    }

    /// The repository part, `<domain>/<path>`, without tag or digest
    pub fn repository(&self) -> String {
        if let Some(port) = self.port {
            format!("{}:{}/{}", self.hostname, port, self.name)
        } else {
            format!("{}/{}", self.hostname, self.name)
        }
    }

    /// The digest-pinned form, `<domain>/<path>@<digest>`
    pub fn pinned_with(&self, digest: &Digest) -> String {
        format!("{}@{}", self.repository(), digest)
    }

    /// Tag to publish under; `latest` when the reference has no tag
    pub fn tag_or_latest(&self) -> Reference {
        self.tag.clone().unwrap_or_else(Reference::latest)
    }

    /// URL for OCI distribution API endpoint
    ///
    /// Insecure HTTP is used only for localhost and domains explicitly
    /// configured as insecure.
    pub fn registry_url(&self, insecure: bool) -> Result<Url> {
        let hostname = if let Some(port) = self.port {
            format!("{}:{}", self.hostname, port)
        } else {
            self.hostname.clone()
        };
        let url = if insecure || self.hostname.starts_with("localhost") {
            format!("http://{}", hostname)
        } else {
            format!("https://{}", hostname)
        };
        Ok(Url::parse(&url)?)
    }
}
