//! Top-level entry point (§6): wires volume, scheduler, parser, index and
//! post-processor together behind the external-interface shape the spec
//! names (`NtfsIndex::new`, `Index::init`, `Index::finished_event`).
//!
//! Grounded on the teacher's `VolumeScanner`/`MultiVolumeScanner`
//! (`scanner.rs`) for the "open volume, own a background pipeline, expose a
//! waitable completion" shape, generalized from its USN-journal-plus-MFT
//! dual pipeline down to the MFT-only one this crate implements.

use crate::config::SearchConfig;
use crate::error::{NtfsIndexError, Result};
use crate::index::Index;
use crate::pattern::Matcher;
use crate::scheduler::{FinishedEvent, MftScheduler};
use crate::volume::VolumeDescriptor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{info, instrument};

/// Owns one volume's index and the background pipeline that fills it.
/// Cheap to clone-by-reference: callers typically keep this around for the
/// lifetime of one search session against one volume.
pub struct NtfsIndex {
    index: Arc<Index>,
    volume: Arc<VolumeDescriptor>,
    config: SearchConfig,
    cancelled: Arc<AtomicBool>,
    ready: OnceLock<FinishedEvent>,
}

impl NtfsIndex {
    /// Open `root_path` and build an empty index. Nothing is read from disk
    /// until `init()` is called.
    pub fn new(root_path: &str, config: SearchConfig) -> Result<Self> {
        let volume = Arc::new(VolumeDescriptor::open(root_path)?);
        let index = Arc::new(Index::new(root_path));
        Ok(Self { index, volume, config, cancelled: Arc::new(AtomicBool::new(false)), ready: OnceLock::new() })
    }

    /// Dispatch the bitmap-then-data read pipeline (§4.3) and, once it
    /// completes, the post-processor (§4.6) — both running on background
    /// threads. Returns immediately; wait on `finished_event()` for
    /// completion. Calling this twice is a logic error the second call
    /// reports as `Cancelled`-shaped: callers should call it exactly once
    /// per `NtfsIndex`.
    #[instrument(skip_all, fields(root = %self.volume.root_path()))]
    pub fn init(&self) -> Result<()> {
        let scheduler = Arc::new(MftScheduler::new(Arc::clone(&self.volume), self.config.io));
        let scan_finished = scheduler.run(Arc::clone(&self.index), self.config.parser, Arc::clone(&self.cancelled))?;

        let ready = FinishedEvent::new();
        self.ready.set(ready.clone()).map_err(|_| NtfsIndexError::OutOfMemory)?;

        let index = Arc::clone(&self.index);
        let volume = Arc::clone(&self.volume);
        let post_config = self.config.index;
        std::thread::Builder::new()
            .name("ntfs-mft-search-postprocess".into())
            .spawn(move || {
                scan_finished.wait();
                if index.finish_outcome() == Some(crate::index::FinishOutcome::Done) {
                    crate::postprocess::run(&index, post_config, volume);
                }
                ready.signal();
            })
            .expect("failed to spawn post-processing thread");

        info!("indexing started");
        Ok(())
    }

    pub fn root_path(&self) -> &str {
        self.index.root_path()
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The waitable the caller blocks on until indexing (scan + post-
    /// processing) has completed, matching §6's `Index::finished_event()`.
    /// Returns `None` before `init()` has been called.
    pub fn finished_event(&self) -> Option<FinishedEvent> {
        self.ready.get().cloned()
    }

    /// Request cancellation; observed at each record boundary and before
    /// each traversal callback (§5).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Query the index with a compiled pattern (§4.8). Returns `Cancelled`
    /// if a cancellation was requested mid-traversal; the driver absorbs it
    /// at this boundary per §4.8's failure semantics, and callers should
    /// treat it as "stop, whatever was already delivered through `callback`
    /// stands."
    pub fn matches(&self, matcher: &Matcher, name_only: bool, callback: &mut dyn FnMut(&str, bool, crate::index::Key, usize) -> i32) -> Result<()> {
        self.index.matches(matcher, name_only, self.config.traversal, &self.cancelled, callback)
    }
}
