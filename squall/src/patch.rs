//! Layered patch archives
//!
//! A patch chain stacks archives over a base: lookups try the most
//! recently added layer first and fall back towards the base. A layer
//! may carry a path prefix restricting which names it is consulted
//! for, and a layer can mask a base file with a delete marker so the
//! name resolves to nothing at all.

use std::fmt;

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::tables::BlockFlags;

/// Case-folded path components with both separator spellings accepted
fn path_components(name: &str) -> Vec<String> {
    name.split(['\\', '/'])
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_uppercase)
        .collect()
}

struct Layer {
    archive: Archive,
    /// Normalized prefix components, empty for an unscoped layer
    prefix: Vec<String>,
}

impl Layer {
    fn sees(&self, name: &str) -> bool {
        if self.prefix.is_empty() {
            return true;
        }
        let mut components = path_components(name);
        // The last component is the file name itself; only directory
        // components count towards the prefix.
        components.pop();
        components.len() >= self.prefix.len()
            && components
                .iter()
                .zip(&self.prefix)
                .all(|(part, want)| part == want)
    }
}

enum Resolution {
    /// Index of the layer holding current data for the name
    Found(usize),
    /// A delete marker masks the name for every older layer
    Deleted,
    /// No layer knows the name
    Missing,
}

/// A base archive with patch archives stacked over it
pub struct PatchChain {
    layers: Vec<Layer>,
}

impl fmt::Debug for PatchChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchChain")
            .field("archive_count", &self.layers.len())
            .finish()
    }
}

impl PatchChain {
    /// Starts a chain from its base archive
    pub fn new(base: Archive) -> Self {
        PatchChain {
            layers: vec![Layer {
                archive: base,
                prefix: Vec::new(),
            }],
        }
    }

    /// Stacks a patch archive over everything added so far.
    ///
    /// With a prefix, the layer is only consulted for names under that
    /// path; other names skip straight past it.
    pub fn add_patch(&mut self, archive: Archive, prefix: Option<&str>) {
        self.layers.push(Layer {
            archive,
            prefix: prefix.map(path_components).unwrap_or_default(),
        });
    }

    /// Number of archives in the chain, the base included
    pub fn archive_count(&self) -> usize {
        self.layers.len()
    }

    /// True if the chain resolves `name` to current file data
    pub fn has_file(&self, name: &str) -> bool {
        matches!(self.resolve(name), Resolution::Found(_))
    }

    /// Reads `name` from the newest layer that knows it.
    ///
    /// A patch-flagged entry is returned as stored; applying
    /// incremental patch data against the layer below is up to the
    /// caller.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        match self.resolve(name) {
            Resolution::Found(index) => self.layers[index].archive.read_file(name),
            Resolution::Deleted | Resolution::Missing => Err(Error::NotFound(name.to_string())),
        }
    }

    fn resolve(&self, name: &str) -> Resolution {
        for (index, layer) in self.layers.iter().enumerate().rev() {
            if !layer.sees(name) {
                continue;
            }
            let Some(entry) = layer.archive.resolve_block(name) else {
                continue;
            };
            if entry.flags.contains(BlockFlags::DELETE_MARKER) {
                return Resolution::Deleted;
            }
            if entry.exists() {
                return Resolution::Found(index);
            }
        }
        Resolution::Missing
    }
}
