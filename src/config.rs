//! Tunable knobs for the index pipeline.
//!
//! Mirrors the teacher's `ScanConfig`/`AppConfig` shape: small `Copy`/`Clone`
//! plain-data structs with `Default` impls, composed into one top-level
//! config rather than a file-backed configuration layer (there is nothing to
//! persist — see the "Persisted state: None" contract in `lib.rs`).

/// I/O completion engine and read-scheduling knobs (§4.2, §4.3).
#[derive(Debug, Clone, Copy)]
pub struct IoEngineConfig {
    /// Worker thread count. `None` resolves to the logical CPU count at
    /// engine startup (one thread in debug builds, matching the source's
    /// `OMP_NUM_THREADS`-or-CPU-count policy).
    pub worker_threads: Option<usize>,
    /// Reads kept in flight before the scheduler starts reacting to
    /// completions.
    pub initial_concurrency: usize,
    /// Maximum bytes per scheduled read, floored to whole FRSs.
    pub block_size: usize,
}

impl Default for IoEngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            initial_concurrency: 2,
            block_size: 1024 * 1024,
        }
    }
}

/// Record-parser knobs (§4.4, §9).
#[derive(Debug, Clone, Copy, Default)]
pub struct ParserConfig {
    /// Retain DOS short-name (`FileNameAttribute.Flags == 0x02`) entries as
    /// a separate, display-suppressed name instead of silently dropping
    /// them. Default `false` matches the literal source behavior.
    pub retain_dos_names: bool,
}

/// Post-processor knobs (§4.6, §9).
#[derive(Debug, Clone, Copy)]
pub struct IndexConfig {
    /// Whether the reserved MFT-zone byte count is folded into the root
    /// directory's allocated total during post-processing.
    pub account_mft_zone: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            account_mft_zone: true,
        }
    }
}

/// Traversal/match-driver knobs (§4.8, §9).
#[derive(Debug, Clone, Copy, Default)]
pub struct TraversalConfig {
    /// Surface FRS 6 a second time as a top-level root entry, in addition
    /// to its substitution as a synthetic child of FRS 5 at depth 1.
    pub expose_frs6_as_root: bool,
    /// Emit matches in reverse depth order (deepest first) instead of
    /// insertion order.
    pub reverse_depth_order: bool,
    /// Include named/alternate attribute streams in callbacks, not just
    /// the default data stream and directory stream.
    pub include_attributes: bool,
}

/// Top-level configuration threaded through `NtfsIndex::new`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchConfig {
    pub io: IoEngineConfig,
    pub parser: ParserConfig,
    pub index: IndexConfig,
    pub traversal: TraversalConfig,
}
