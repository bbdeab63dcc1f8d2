//! # Squall - MPQ Archive Engine
//!
//! A safe Rust engine for MPQ (Mo'PaQ) archives, the container format
//! of classic Blizzard Entertainment games: reading, writing, by-name
//! search, wildcard enumeration, and in-place rebuild.
//!
//! ## Features
//!
//! - Every archive format version (v1-v4), including headers embedded
//!   in larger container files
//! - Sector-level compression (zlib, bzip2, LZMA, sparse) and
//!   encryption with name-derived keys
//! - Streamed reads and writes through handles, plus one-shot helpers
//! - Wildcard enumeration over the archive tables or the listfile
//! - Removal, rename, limit growth, and gap-free compaction
//! - Patch chains layering override archives over a base
//!
//! ## Example
//!
//! ```no_run
//! use squall::{Archive, CreateOptions, FileOptions};
//!
//! # fn main() -> Result<(), squall::Error> {
//! // Build an archive.
//! let mut archive = Archive::create("game.mpq", CreateOptions::new())?;
//! archive.add_file("units\\footman.txt", b"stats", &FileOptions::new())?;
//! archive.close()?;
//!
//! // Read it back.
//! let mut archive = Archive::open("game.mpq")?;
//! for name in archive.list()? {
//!     println!("{name}");
//! }
//! let data = archive.read_file("units\\footman.txt")?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod archive;
pub mod compression;
pub mod crypto;
pub mod error;
mod file;
pub mod finder;
pub mod header;
pub mod patch;
pub mod special_files;
pub mod tables;

// Re-export commonly used types
pub use archive::{
    Archive, CreateOptions, FileHandle, FileOptions, FinderHandle, OpenOptions,
};
pub use compression::CompressionMethod;
pub use error::{Error, Result};
pub use finder::FindData;
pub use header::FormatVersion;
pub use patch::PatchChain;
pub use tables::BlockFlags;
