//! ntfs-mft-search — ultra-fast NTFS file search via direct MFT reads,
//! bypassing the filesystem API.
//!
//! Reads `$MFT::$DATA` straight off the volume, skipping whole clusters
//! `$MFT::$BITMAP` proves free, and builds an in-memory index of every
//! record, name, stream and directory link. Searches compile a pattern
//! (verbatim, glob, globstar or regex) and drive a callback over the index
//! without ever touching the filesystem API again.
//!
//! # Example
//!
//! ```no_run
//! use ntfs_mft_search::{NtfsIndex, SearchConfig, Matcher, PatternKind};
//!
//! fn main() -> ntfs_mft_search::Result<()> {
//!     let index = NtfsIndex::new("C", SearchConfig::default())?;
//!     index.init()?;
//!     index.finished_event().unwrap().wait();
//!
//!     let matcher = Matcher::compile(PatternKind::Glob, "*.log", false).unwrap();
//!     index.matches(&matcher, true, &mut |name, _ascii, _key, _depth| {
//!         println!("{name}");
//!         1
//!     })?;
//!     Ok(())
//! }
//! ```

#![cfg(windows)]

pub mod config;
pub mod error;
pub mod index;
pub mod io_engine;
pub mod logging;
pub mod ntfs;
mod ntfs_index;
pub mod parser;
pub mod pattern;
pub mod postprocess;
pub mod scheduler;
mod traversal;
pub mod volume;

pub use config::{IndexConfig, IoEngineConfig, ParserConfig, SearchConfig, TraversalConfig};
pub use error::{NtfsIndexError, Result};
pub use index::{Index, Key, SizeInfo, StandardInfo};
pub use ntfs_index::NtfsIndex;
pub use pattern::{HighWaterMark, Matcher, PatternKind};
pub use scheduler::FinishedEvent;
pub use volume::VolumeDescriptor;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Format bytes as a human-readable string, e.g. `"1.50 MB"`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let exp = (bytes as f64).log(1024.0).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);
    let size = bytes as f64 / 1024_f64.powi(exp as i32);

    if exp == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.2} {}", UNITS[exp])
    }
}

/// Format a Windows FILETIME as a human-readable date string.
pub fn format_filetime(filetime: u64) -> String {
    ntfs::structs::filetime_to_datetime(filetime).format("%Y-%m-%d %H:%M:%S").to_string()
}
