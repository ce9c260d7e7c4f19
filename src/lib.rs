//! Read-only APFS object resolution and B-tree traversal engine.
//!
//! This crate decodes container/volume superblocks, resolves virtual
//! oids to physical addresses through an object map, and walks the
//! on-disk B-tree families (object map, catalog, extent-ref, space
//! manager free queues) with an iterative, cancellable, cached
//! traversal engine. It intentionally stops at the record layer: path
//! resolution, directory listing, and file-data streaming are callers'
//! concerns built on top of [`session::Session`] and [`records`].

pub mod block;
pub mod cache;
pub mod checkpoint;
pub mod error;
pub mod families;
pub mod fletcher;
pub mod header;
pub mod navigator;
pub mod node;
pub mod records;
pub mod resolver;
pub mod session;
pub mod superblock;

pub use error::{Error, Result};
pub use session::Session;
