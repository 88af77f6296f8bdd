//! Shared frame manifest protocol.
//!
//! Every publisher (capture producers and the broker itself) advertises its
//! latest frame through a fixed-layout [`FrameManifest`] placed in named shared
//! memory. The manifest carries the frame counter (the fence value to wait for),
//! the surface description, the GPU adapter identity and the names of the shared
//! texture and fence.
//!
//! This crate owns:
//! - the byte layout of the manifest and of the color-controls block
//! - the naming convention (`<prefix><pid>`, `<prefix>Texture_<pid>`, ...)
//! - the shared-memory namespaces the records live in

mod error;
pub mod layout;
pub mod namespace;
pub mod naming;

#[cfg(windows)]
pub mod security;

pub use error::{ManifestError, ManifestResult};
pub use layout::{
    AdapterId, ControlsBlock, FrameManifest, PixelFormat, MANIFEST_SIZE, NAME_CAPACITY,
};
pub use namespace::{
    FileNamespace, ManifestReader, ManifestWriter, MappedRegion, SharedMemory, SharedRecord,
};
pub use naming::{ProtocolNames, PublishedNames};

#[cfg(windows)]
pub use namespace::win32::{GlobalNamespace, OwnedHandle};
