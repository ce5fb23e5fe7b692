use crate::error::*;
use base64::engine::{general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, io, path::*};
use url::Url;

/// Authentication info stored by the ambient container tooling
///
/// Credentials are read once, at gateway construction, from the standard
/// docker and podman configuration files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredAuth {
    auths: HashMap<String, Auth>,
}

impl StoredAuth {
    /// Load authentication info with docker and podman setting
    pub fn load_all() -> Self {
        let mut auth = StoredAuth::default();
        if let Some(path) = docker_auth_path() {
            if let Ok(new) = Self::from_path(&path) {
                auth.append(new);
            }
        }
        if let Some(path) = podman_auth_path() {
            if let Ok(new) = Self::from_path(&path) {
                auth.append(new);
            }
        }
        auth
    }

    pub fn add(&mut self, domain: &str, username: &str, password: &str) {
        self.auths
            .insert(domain.to_string(), Auth::new(username, password));
    }

    /// base64-encoded `username:password` for a registry domain
    pub fn basic_octet(&self, domain: &str) -> Option<&str> {
        self.auths.get(domain).map(|auth| auth.auth.as_str())
    }

    /// Get token based on WWW-Authenticate header
    ///
    /// The requested scope grants pull and push on the repository being
    /// published, as the pipeline both reads image manifests and uploads
    /// blobs.
    pub fn challenge(
        &self,
        agent: &ureq::Agent,
        challenge: &BearerChallenge,
        scope: &str,
    ) -> Result<String> {
        let token_url = Url::parse(&challenge.realm)?;
        let domain = token_url
            .domain()
            .ok_or_else(|| Error::UnsupportedAuthHeader(challenge.realm.clone()))?;

        let mut req = agent
            .get(token_url.as_str())
            .set("Accept", "application/json");
        if let Some(octet) = self.basic_octet(domain) {
            req = req.set("Authorization", &format!("Basic {}", octet));
        }
        req = req
            .query("scope", scope)
            .query("service", &challenge.service);
        let res = req.call().map_err(|_| {
            Error::AuthorizationFailed(token_url.clone())
        })?;
        let token = res.into_json::<Token>()?;
        Ok(token.token)
    }

    pub fn append(&mut self, other: Self) {
        for (key, value) in other.auths.into_iter() {
            if value.is_valid() {
                self.auths.insert(key, value);
            }
        }
    }

    fn from_path(path: &Path) -> Result<Self> {
        if path.is_file() {
            let f = fs::File::open(path)?;
            Ok(serde_json::from_reader(io::BufReader::new(f))?)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Auth {
    // base64 encoded username:password
    auth: String,
}

impl Auth {
    fn new(username: &str, password: &str) -> Self {
        let auth = format!("{}:{}", username, password);
        let auth = STANDARD.encode(auth.as_bytes());
        Self { auth }
    }

    fn is_valid(&self) -> bool {
        let Ok(decoded) = STANDARD.decode(&self.auth) else {
            return false;
        };
        decoded.split(|b| *b == b':').count() == 2
    }
}

fn docker_auth_path() -> Option<PathBuf> {
    let dirs = directories::BaseDirs::new()?;
    Some(dirs.home_dir().join(".docker/config.json"))
}

fn podman_auth_path() -> Option<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "containers")?;
    Some(dirs.runtime_dir()?.join("auth.json"))
}

/// WWW-Authenticate challenge returned by the registry ping
///
/// ```
/// use compose_publish::distribution::{AuthChallenge, BearerChallenge};
///
/// let auth = AuthChallenge::from_header(
///   r#"Bearer realm="https://hub.foundries.io/token-auth/",service="registry""#,
/// ).unwrap();
///
/// assert_eq!(auth, AuthChallenge::Bearer(BearerChallenge {
///   realm: "https://hub.foundries.io/token-auth/".to_string(),
///   service: "registry".to_string(),
/// }));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Bearer(BearerChallenge),
    Basic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: String,
}

impl AuthChallenge {
    pub fn from_header(header: &str) -> Result<Self> {
        let err = || Error::UnsupportedAuthHeader(header.to_string());
        let (ty, params) = header.split_once(' ').unwrap_or((header, ""));
        if ty.eq_ignore_ascii_case("basic") {
            return Ok(Self::Basic);
        }
        if !ty.eq_ignore_ascii_case("bearer") {
            return Err(err());
        }

        let mut realm = None;
        let mut service = None;
        for param in params.split(',') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                _ => continue,
            }
        }
        Ok(Self::Bearer(BearerChallenge {
            realm: realm.ok_or_else(err)?,
            service: service.ok_or_else(err)?,
        }))
    }
}

#[derive(Deserialize)]
struct Token {
    token: String,
}
