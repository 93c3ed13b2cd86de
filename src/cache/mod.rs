pub mod fileitem;
pub mod holder;
pub mod registry;
pub mod store;

pub use fileitem::{DestroyMode, FileItem, FileItemKind, FiStatus, SpecialAttrs};
pub use holder::FileItemHolder;
pub use registry::{Registry, SharingHow};
pub use store::{CacheStore, HeadMeta};
