//! Pull and push manifests and blobs based on [OCI distribution specification](https://github.com/opencontainers/distribution-spec)

mod auth;
mod client;
mod name;
mod reference;

pub use auth::{AuthChallenge, BearerChallenge, StoredAuth};
pub use client::{Client, Gateway, USER_AGENT};
pub use name::Name;
pub use reference::Reference;
