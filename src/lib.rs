//! Merge single-channel extended-focus microscopy TIFFs into one
//! multi-channel, tiled, pyramidal OME-TIFF.
//!
//! Multi-band sources are reduced to one band by a per-pixel maximum across
//! bands. Channels are written as consecutive BigTIFF pages with reduced
//! resolutions in SubIFDs, and the first page carries the OME-XML.

pub mod cli;
pub mod discover;
pub mod error;
pub mod load;
pub mod merge;
pub mod meta;
pub mod ome;
pub mod pixel;
pub mod pyramid;
pub mod tiff_writer;

pub use cli::Cli;
pub use error::MergeError;
pub use merge::run;
