use crate::error::*;
use regex::Regex;
use std::fmt;

/// Tag component of an image or target reference
///
/// The publish target takes the form `target[:tag]`, and a missing tag
/// falls back to [Reference::latest]. A tag is at most 128 characters
/// matching `[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}`; the check runs at
/// construction so a malformed target fails before any registry round
/// trip. A digest can never pass for a tag here because the grammar has no
/// colon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference(String);

lazy_static::lazy_static! {
    static ref REF_RE: Regex = Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap();
}

impl Reference {
    pub fn new(tag: &str) -> Result<Self> {
        if REF_RE.is_match(tag) {
            Ok(Reference(tag.to_string()))
        } else {
            Err(Error::InvalidReference(tag.to_string()))
        }
    }

    /// The default tag the App is published under
    pub fn latest() -> Self {
        Reference("latest".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_publish_tags() {
        for tag in ["latest", "v1.2.3", "2024-06-01_rc1", "main"] {
            assert!(Reference::new(tag).is_ok(), "{} must be a valid tag", tag);
        }
    }

    #[test]
    fn rejects_digests_and_malformed_tags() {
        assert!(Reference::new("sha256:abcd").is_err());
        assert!(Reference::new("").is_err());
        assert!(Reference::new(".hidden").is_err());
        assert!(Reference::new("-leading-dash").is_err());
        assert!(Reference::new(&"a".repeat(129)).is_err());
    }

    #[test]
    fn default_tag_is_latest() {
        assert_eq!(Reference::latest().as_str(), "latest");
    }
}
