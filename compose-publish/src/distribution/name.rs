use crate::error::*;
use regex::Regex;
use std::fmt;

/// Repository namespace of a service image or of the published App
///
/// Everything the pipeline touches sits under a `/v2/<name>/` route:
/// service manifests and config blobs are fetched from the image
/// repositories, and the App manifest with its layers manifests and blobs
/// is pushed to the target repository. The distribution protocol limits
/// `<name>` to lower-case path components:
///
/// ```text
/// [a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*(\/[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*)*
/// ```
///
/// The grammar is checked at construction, so a `Name` can be spliced into
/// request paths and token scopes without further validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name(String);

lazy_static::lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"^[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*(\/[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*)*$").unwrap();
}

impl Name {
    pub fn new(name: &str) -> Result<Self> {
        if NAME_RE.is_match(name) {
            Ok(Name(name.to_string()))
        } else {
            Err(Error::InvalidName(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Token scope for this repository
    ///
    /// The pipeline both reads image manifests and uploads blobs, so the
    /// bearer token is requested for pull and push at once.
    pub fn auth_scope(&self) -> String {
        format!("repository:{}:pull,push", self.0)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
