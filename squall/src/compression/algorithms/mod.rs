//! Individual compression codecs

#[cfg(feature = "compression-bzip2")]
pub(crate) mod bzip2;
#[cfg(feature = "compression-lzma")]
pub(crate) mod lzma;
pub(crate) mod sparse;
pub(crate) mod zlib;
