//! Publish a Compose app as a single content-addressed artifact in an
//! OCI-compliant registry.
//!
//! The pipeline pins every service image to an immutable digest and stamps
//! each service with a configuration hash. It then intersects the supported
//! architectures across all images and posts one layers manifest per
//! architecture. Finally the pinned Compose document is packed into a
//! reproducible bundle and the App manifest that ties it all together is
//! pushed under a tag. See [publish::publish] for the entry point.

pub mod archive;
pub mod cancel;
pub mod compose;
pub mod distribution;
pub mod error;
pub mod layers;
pub mod manifest;
pub mod media_types;
pub mod publish;
pub mod resolver;

mod digest;
mod image_name;

pub use digest::Digest;
pub use error::{Error, Result};
pub use image_name::ImageName;
