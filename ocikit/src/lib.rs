pub mod authn;
pub mod digest;
pub mod error;
pub mod image;
pub mod layer;
pub mod layout;
pub mod mediatype;
pub mod mutate;
pub mod ops;
pub mod reference;
pub mod remote;
pub mod tarball;
pub mod transport;
pub mod types;
pub mod validate;

// Re-export the types most callers need.
pub use digest::Digest;
pub use error::{Error, Result};
pub use image::{Image, ImageIndex};
pub use layer::Layer;
pub use mediatype::MediaType;
pub use reference::{Reference, Repository};
pub use types::{ConfigFile, Descriptor, IndexManifest, Manifest, Platform};
