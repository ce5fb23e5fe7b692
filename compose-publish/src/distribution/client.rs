use crate::{
    cancel::CancelToken,
    distribution::{AuthChallenge, Name, StoredAuth},
    error::*,
    manifest::Descriptor,
    Digest, ImageName,
};
use std::{collections::HashSet, io::Read, time::Duration};
use url::Url;

/// User agent attached to every outgoing request
pub const USER_AGENT: &str = concat!("compose-publish/", env!("CARGO_PKG_VERSION"));

/// Accept header offered when fetching manifests: both OCI and docker
/// schema-2 forms, index and single-arch
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Hands out per-repository [Client] handles
///
/// Credentials are loaded from the ambient docker/podman configuration once
/// at construction; the proxy comes from the ambient HTTP proxy environment.
pub struct Gateway {
    agent: ureq::Agent,
    auth: StoredAuth,
    insecure_domains: HashSet<String>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    pub fn new() -> Self {
        let mut builder = ureq::builder()
            .timeout_connect(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT);
        if let Some(proxy) = proxy_from_env() {
            builder = builder.proxy(proxy);
        }
        Gateway {
            agent: builder.build(),
            auth: StoredAuth::load_all(),
            insecure_domains: HashSet::new(),
        }
    }

    pub fn add_basic_auth(&mut self, domain: &str, username: &str, password: &str) {
        self.auth.add(domain, username, password);
    }

    /// Mark a registry domain as reachable over plain HTTP
    pub fn add_insecure_domain(&mut self, domain: &str) {
        self.insecure_domains.insert(domain.to_string());
    }

    /// Resolve an image reference to a repository handle
    ///
    /// Pings `/v2/` and answers the challenge before returning; ping,
    /// authentication and transport failures are fatal here. The caller may
    /// reissue by constructing a fresh handle.
    pub fn repository(&self, image: &ImageName, cancel: &CancelToken) -> Result<Client> {
        cancel.check()?;
        let insecure = self.insecure_domains.contains(&image.hostname);
        let url = image.registry_url(insecure)?;
        let ping = url.join("/v2/")?;
        log::info!("GET {}", ping);

        let authorization = match self.agent.get(ping.as_str()).call() {
            Ok(_) => None,
            Err(ureq::Error::Status(401, res)) => {
                let header = res
                    .header("www-authenticate")
                    .ok_or_else(|| Error::AuthorizationFailed(url.clone()))?
                    .to_string();
                match AuthChallenge::from_header(&header)? {
                    AuthChallenge::Bearer(challenge) => {
                        let scope = image.name.auth_scope();
                        let token = self.auth.challenge(&self.agent, &challenge, &scope)?;
                        Some(format!("Bearer {}", token))
                    }
                    AuthChallenge::Basic => {
                        let octet = self
                            .auth
                            .basic_octet(&image.hostname)
                            .ok_or_else(|| Error::AuthorizationFailed(url.clone()))?;
                        Some(format!("Basic {}", octet))
                    }
                }
            }
            Err(ureq::Error::Status(status, _)) => {
                return Err(Error::RegistryFetchFailed {
                    repo: image.repository(),
                    status,
                })
            }
            Err(ureq::Error::Transport(e)) => return Err(Error::NetworkError(e.into())),
        };

        Ok(Client {
            agent: self.agent.clone(),
            url,
            name: image.name.clone(),
            repo: image.repository(),
            authorization,
            cancel: cancel.clone(),
        })
    }
}

/// A client for one `/v2/<name>/` repository
///
/// Bundles the blob, manifest and tag operations the publish pipeline needs.
pub struct Client {
    agent: ureq::Agent,
    /// URL to registry server
    url: Url,
    /// Name of repository
    name: Name,
    /// `<domain>/<path>` form, used in error reports
    repo: String,
    /// Authorization header value negotiated at construction
    authorization: Option<String>,
    cancel: CancelToken,
}

impl Client {
    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn get(&self, url: &Url) -> ureq::Request {
        log::info!("GET {}", url);
        self.authorize(self.agent.get(url.as_str()))
    }

    fn put(&self, url: &Url) -> ureq::Request {
        log::info!("PUT {}", url);
        self.authorize(self.agent.put(url.as_str()))
    }

    fn post(&self, url: &Url) -> ureq::Request {
        log::info!("POST {}", url);
        self.authorize(self.agent.post(url.as_str()))
    }

    fn authorize(&self, req: ureq::Request) -> ureq::Request {
        if let Some(authorization) = &self.authorization {
            req.set("Authorization", authorization)
        } else {
            req
        }
    }

    fn fetch_failed(&self, err: ureq::Error) -> Error {
        match err {
            ureq::Error::Status(status, _) => Error::RegistryFetchFailed {
                repo: self.repo.clone(),
                status,
            },
            ureq::Error::Transport(e) => Error::NetworkError(e.into()),
        }
    }

    fn put_failed(&self, err: ureq::Error) -> Error {
        match err {
            ureq::Error::Status(status, _) => Error::RegistryPutFailed {
                repo: self.repo.clone(),
                status,
            },
            ureq::Error::Transport(e) => Error::NetworkError(e.into()),
        }
    }

    /// Look up a tag and return a descriptor for the manifest behind it
    ///
    /// ```text
    /// GET /v2/<name>/manifests/<tag>
    /// ```
    pub fn resolve_tag(&self, tag: &str) -> Result<Descriptor> {
        self.cancel.check()?;
        let url = self
            .url
            .join(&format!("/v2/{}/manifests/{}", self.name, tag))?;
        let res = self
            .get(&url)
            .set("Accept", MANIFEST_ACCEPT)
            .call()
            .map_err(|e| self.fetch_failed(e))?;
        let media_type = res
            .header("Content-Type")
            .unwrap_or("application/vnd.oci.image.manifest.v1+json")
            .to_string();
        let server_digest = res.header("Docker-Content-Digest").map(str::to_string);
        let mut bytes = Vec::new();
        res.into_reader().read_to_end(&mut bytes)?;
        let digest = match server_digest {
            Some(digest) => Digest::new(&digest)?,
            None => Digest::from_buf_sha256(&bytes),
        };
        Ok(Descriptor::new(media_type, digest, bytes.len() as i64))
    }

    /// Get raw manifest bytes for a given digest
    ///
    /// ```text
    /// GET /v2/<name>/manifests/<digest>
    /// ```
    pub fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.cancel.check()?;
        let url = self
            .url
            .join(&format!("/v2/{}/manifests/{}", self.name, digest))?;
        let res = self
            .get(&url)
            .set("Accept", MANIFEST_ACCEPT)
            .call()
            .map_err(|e| self.fetch_failed(e))?;
        let mut bytes = Vec::new();
        res.into_reader().read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Get blob for given digest
    ///
    /// ```text
    /// GET /v2/<name>/blobs/<digest>
    /// ```
    pub fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.cancel.check()?;
        let url = self
            .url
            .join(&format!("/v2/{}/blobs/{}", self.name.as_str(), digest))?;
        let res = self.get(&url).call().map_err(|e| self.fetch_failed(e))?;
        let mut bytes = Vec::new();
        res.into_reader().read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Push blob to registry
    ///
    /// ```text
    /// POST /v2/<name>/blobs/uploads/
    /// ```
    ///
    /// and following `PUT` to URL obtained by `POST`.
    pub fn push_blob(&self, blob: &[u8], media_type: &str) -> Result<Descriptor> {
        self.cancel.check()?;
        let url = self
            .url
            .join(&format!("/v2/{}/blobs/uploads/", self.name))?;
        let res = self.post(&url).call().map_err(|e| self.put_failed(e))?;
        let loc = res
            .header("Location")
            .ok_or_else(|| Error::RegistryPutFailed {
                repo: self.repo.clone(),
                status: res.status(),
            })?;
        let url = Url::parse(loc).or_else(|_| self.url.join(loc))?;

        let digest = Digest::from_buf_sha256(blob);
        self.put(&url)
            .query("digest", &digest.to_string())
            .set("Content-Length", &blob.len().to_string())
            .set("Content-Type", "application/octet-stream")
            .send_bytes(blob)
            .map_err(|e| self.put_failed(e))?;
        Ok(Descriptor::new(
            media_type.to_string(),
            digest,
            blob.len() as i64,
        ))
    }

    /// Push manifest bytes under a digest or tag reference
    ///
    /// ```text
    /// PUT /v2/<name>/manifests/<reference>
    /// ```
    ///
    /// Manifest must be pushed after blobs are updated. Returns the
    /// server-assigned digest.
    pub fn put_manifest(
        &self,
        reference: &str,
        manifest: &[u8],
        content_type: &str,
    ) -> Result<Digest> {
        self.cancel.check()?;
        let url = self
            .url
            .join(&format!("/v2/{}/manifests/{}", self.name, reference))?;
        let res = self
            .put(&url)
            .set("Content-Type", content_type)
            .send_bytes(manifest)
            .map_err(|e| self.put_failed(e))?;
        match res.header("Docker-Content-Digest") {
            Some(digest) => Digest::new(digest),
            None => Ok(Digest::from_buf_sha256(manifest)),
        }
    }
}

fn proxy_from_env() -> Option<ureq::Proxy> {
    ["https_proxy", "HTTPS_PROXY", "http_proxy", "HTTP_PROXY"]
        .iter()
        .find_map(|key| std::env::var(key).ok())
        .and_then(|url| ureq::Proxy::new(url).ok())
}
