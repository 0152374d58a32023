//! Module caching.
//!
//! - [`ttl`]: expiring in-memory map used for version lists.
//! - [`sweeper`]: background task that evicts expired entries.
//! - [`archives`]: storage capability for immutable archive blobs.
//! - [`decorator`]: read-through repository wrapper tying the two together.

pub mod archives;
pub mod decorator;
mod lock;
pub mod sweeper;
pub mod ttl;

pub use archives::{ArchiveReader, ArchiveStore, PendingArchive};
pub use decorator::CachedRepository;
pub use sweeper::{CleanupHandle, spawn_cleanup};
pub use ttl::{Expiration, TtlCache, VersionStore};
