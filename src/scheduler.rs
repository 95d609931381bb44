//! MFT read scheduler (§4.3): drives `$MFT::$BITMAP` and `$MFT::$DATA`
//! through the I/O engine into the parser while skipping regions the
//! bitmap proves are free.
//!
//! Bitmap extents are read to completion before any data extent's
//! `skip_begin`/`skip_end` is computed — stronger than the source's
//! concurrent-with-a-happens-before-edge guarantee, but it satisfies the
//! same ordering invariant (§5) with a simpler, sequential phase split that
//! reads more naturally in Rust than chained overlapped completions.

use crate::config::IoEngineConfig;
use crate::error::{NtfsIndexError, Result};
use crate::index::{FinishOutcome, Index};
use crate::io_engine::{Action, IoEngine, ReadTask};
use crate::parser::RecordParser;
use crate::volume::{MftStream, Run, VolumeDescriptor};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, info, instrument};

/// A data extent run augmented with the whole-cluster skip counts the
/// bitmap pass proved safe to drop from the head/tail.
#[derive(Debug, Clone, Copy)]
struct SkippableRun {
    run: Run,
    skip_begin: u64,
    skip_end: u64,
}

/// Blocking handle the caller waits on for `finished_event` (§6's
/// `Index::finished_event() -> Waitable`).
#[derive(Clone)]
pub struct FinishedEvent {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl FinishedEvent {
    pub(crate) fn new() -> Self {
        Self { inner: Arc::new((Mutex::new(false), Condvar::new())) }
    }

    pub(crate) fn signal(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cvar.wait(done).unwrap();
        }
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }
}

pub struct MftScheduler {
    volume: Arc<VolumeDescriptor>,
    config: IoEngineConfig,
}

/// State shared by every in-flight `$MFT::$DATA` read once the bitmap pass
/// is complete. `remaining` is the not-yet-dispatched tail of the run list;
/// each completion pulls the next run off it, so at most
/// `initial_concurrency` reads are ever outstanding at once (§4.3 step 3-4).
struct Pipeline {
    engine: Arc<IoEngine>,
    remaining: Mutex<VecDeque<SkippableRun>>,
    index: Arc<Index>,
    parser: Arc<RecordParser>,
    outstanding: AtomicUsize,
    finished: FinishedEvent,
    cancelled: Arc<AtomicBool>,
    errored: AtomicBool,
    record_size: u64,
}

/// Account `delta` completed-or-discarded runs against `outstanding`; when
/// this decrement is the one that drains it to zero, resolve the pipeline's
/// final outcome (cancelled takes precedence, then a sibling's I/O error,
/// else plain completion) and signal `finished` exactly once.
fn finish_step(pipeline: &Arc<Pipeline>, delta: usize) {
    if pipeline.outstanding.fetch_sub(delta, Ordering::AcqRel) != delta {
        return;
    }
    let outcome = if pipeline.cancelled.load(Ordering::Acquire) {
        FinishOutcome::Cancelled
    } else if pipeline.errored.load(Ordering::Acquire) {
        FinishOutcome::Error
    } else {
        FinishOutcome::Done
    };
    pipeline.index.set_finished(outcome);
    pipeline.finished.signal();
}

/// Handle a failed read for `run` (§7): the whole scan is torn down
/// immediately — no further run is picked up from `remaining`, and the
/// already-queued tail is discarded rather than waited out, so a failed
/// volume doesn't keep reading on regardless. Discarded runs are folded
/// into this one decrement so `outstanding` still reaches zero and
/// `finished` still fires. The record span is still accounted for so
/// `records_so_far` stays monotonic. Factored out of `queue_next`'s
/// `on_complete` closure so it can be driven directly from a test without a
/// real failing disk read.
fn report_io_error(pipeline: &Arc<Pipeline>, run: &SkippableRun, error: NtfsIndexError) -> Action {
    let frs_count = run.run.length / pipeline.record_size;
    pipeline.index.add_records_so_far(frs_count);
    if let NtfsIndexError::IoFailed(status) = error {
        pipeline.index.set_error_status(status);
    }
    let discarded = {
        let mut remaining = pipeline.remaining.lock().unwrap();
        let discarded = remaining.len();
        remaining.clear();
        discarded
    };
    pipeline.errored.store(true, Ordering::Release);
    finish_step(pipeline, 1 + discarded);
    Action::Destroy
}

/// Pop the next run off `pipeline.remaining` and dispatch it, wiring its
/// `on_complete` to account the result and then call `queue_next` again —
/// this is what keeps `initial_concurrency` reads in flight throughout the
/// scan rather than only at startup. A no-op once `remaining` is drained,
/// or once a sibling read has already failed this volume's scan.
fn queue_next(pipeline: &Arc<Pipeline>) {
    if pipeline.errored.load(Ordering::Acquire) {
        return;
    }
    let run = { pipeline.remaining.lock().unwrap().pop_front() };
    let Some(run) = run else { return };

    let pipeline = Arc::clone(pipeline);
    let skip_begin_bytes = run.skip_begin * pipeline.record_size;
    let skip_end_bytes = run.skip_end * pipeline.record_size;
    let read_offset = run.run.physical_offset + skip_begin_bytes;
    let read_length = run.run.length.saturating_sub(skip_begin_bytes + skip_end_bytes);
    let read_virtual_offset = run.run.virtual_offset + skip_begin_bytes;

    let task = ReadTask {
        offset: read_offset,
        buffer: vec![0u8; read_length as usize],
        priority: -(run.run.virtual_offset as i64), // lower virtual offset = earlier = higher priority
        on_complete: Box::new(move |result| {
            if pipeline.cancelled.load(Ordering::Acquire) {
                finish_step(&pipeline, 1);
                return Action::Destroy;
            }

            if pipeline.errored.load(Ordering::Acquire) {
                // A sibling read already failed this volume's scan; nothing
                // left to account for or dispatch.
                finish_step(&pipeline, 1);
                return Action::Destroy;
            }

            match result {
                Ok((_, mut buffer)) => {
                    // The read was already shrunk to the allocated span, so
                    // there is nothing left for the parser to skip at either
                    // end; only the skipped record count still needs
                    // accounting, which it does directly below.
                    pipeline.parser.parse_buffer(&pipeline.index, read_virtual_offset, &mut buffer, 0, 0);
                    pipeline.index.add_bytes_read(buffer.len() as u64);
                    pipeline.index.add_records_so_far(run.skip_begin + run.skip_end);
                    queue_next(&pipeline);
                    finish_step(&pipeline, 1);
                    Action::Done
                }
                Err(e) => report_io_error(&pipeline, &run, e),
            }
        }),
    };

    if read_length == 0 {
        // The whole run was trimmed away by the bitmap skip (§4.2's
        // "zero-length events"): nothing to read, so synthesize the
        // completion directly rather than issuing a no-op disk read.
        let ReadTask { offset, buffer, on_complete, .. } = task;
        pipeline.engine.post(buffer, offset, on_complete);
    } else {
        // The engine only errors once its worker pool has been torn down;
        // there is nothing left to accept the task in that case, so the run
        // is simply dropped rather than re-queued.
        let _ = pipeline.engine.read_file(task);
    }
}

impl MftScheduler {
    pub fn new(volume: Arc<VolumeDescriptor>, config: IoEngineConfig) -> Self {
        Self { volume, config }
    }

    /// Run the full bitmap-then-data pipeline against `index`, returning a
    /// `FinishedEvent` the caller can wait on. Parsing happens inline on
    /// whichever I/O worker received the buffer, matching §5's "no
    /// asynchronous suspension in the indexer" scheduling model. Data runs
    /// are ramped up `initial_concurrency` at a time rather than dispatched
    /// all at once, per §4.3.
    #[instrument(skip_all, fields(root = %self.volume.root_path()))]
    pub fn run(self: Arc<Self>, index: Arc<Index>, parser_config: crate::config::ParserConfig, cancelled: Arc<std::sync::atomic::AtomicBool>) -> Result<FinishedEvent> {
        let geometry = *self.volume.geometry();
        index.reserve(geometry.estimated_mft_records());

        let data_runs = self.volume.enumerate_extents(MftStream::Data, self.config.block_size)?;
        let bitmap_runs = self.volume.enumerate_extents(MftStream::Bitmap, self.config.block_size)?;

        let engine = Arc::new(IoEngine::start(self.volume.handle_arc(), self.config.worker_threads));

        let bitmap = self.read_bitmap(&engine, &bitmap_runs, geometry.estimated_mft_records());
        let runs = self.compute_skips(&data_runs, bitmap.as_deref(), &geometry);

        let finished = FinishedEvent::new();
        if runs.is_empty() {
            finished.signal();
            index.set_finished(FinishOutcome::Done);
            engine.close();
            return Ok(finished);
        }

        let total = runs.len();
        let parser = Arc::new(RecordParser::new(parser_config, Arc::clone(&self.volume)));
        let pipeline = Arc::new(Pipeline {
            engine: Arc::clone(&engine),
            remaining: Mutex::new(VecDeque::from(runs)),
            index,
            parser,
            outstanding: AtomicUsize::new(total),
            finished: finished.clone(),
            cancelled,
            errored: AtomicBool::new(false),
            record_size: geometry.bytes_per_file_record_segment as u64,
        });

        let initial = self.config.initial_concurrency.max(1).min(total);
        for _ in 0..initial {
            queue_next(&pipeline);
        }

        // `close()` posts the sentinel completions (§4.2) and joins every
        // worker; run it from a thread of its own so it never blocks inside
        // one of the very worker threads it is joining. It only needs a
        // shared reference, so it is safe to call regardless of how many
        // `Pipeline` clones are still alive on the I/O workers.
        let shutdown_finished = finished.clone();
        std::thread::Builder::new()
            .name("ntfs-mft-search-io-shutdown".into())
            .spawn(move || {
                shutdown_finished.wait();
                engine.close();
            })
            .expect("failed to spawn io engine shutdown thread");

        info!(runs = total, initial_concurrency = initial, "mft scheduler dispatched");
        Ok(finished)
    }

    /// Read every bitmap extent synchronously (small relative to `$DATA`)
    /// into one dense bit array, and return it — `None` if there is no
    /// bitmap to consult, in which case every FRS slot is read.
    fn read_bitmap(&self, _engine: &IoEngine, bitmap_runs: &[Run], mft_capacity: u64) -> Option<Vec<u8>> {
        if bitmap_runs.is_empty() {
            return None;
        }
        let max_bytes = ((mft_capacity + 7) / 8) as usize;
        let mut dense = vec![0u8; max_bytes];

        for run in bitmap_runs {
            let start = (run.virtual_offset as usize).min(dense.len());
            let want = (run.length as usize).min(dense.len().saturating_sub(start));
            if want == 0 {
                continue;
            }
            let mut buf = vec![0u8; want];
            if crate::ntfs::winapi::read_volume_at(self.volume.handle(), run.physical_offset, &mut buf).is_ok() {
                dense[start..start + want].copy_from_slice(&buf);
            }
        }

        let valid_records: u64 = dense.iter().map(|b| b.count_ones() as u64).sum();
        debug!(valid_records, "bitmap scan complete");
        Some(dense)
    }

    /// For each data run, count whole leading/trailing clusters whose FRS
    /// slots are entirely free per the bitmap.
    fn compute_skips(&self, data_runs: &[Run], bitmap: Option<&[u8]>, geometry: &crate::ntfs::structs::NtfsVolumeData) -> Vec<SkippableRun> {
        let Some(bitmap) = bitmap else {
            return data_runs.iter().map(|&run| SkippableRun { run, skip_begin: 0, skip_end: 0 }).collect();
        };

        let record_size = geometry.bytes_per_file_record_segment as u64;
        data_runs
            .iter()
            .map(|&run| {
                let first_frs = run.virtual_offset / record_size;
                let frs_count = run.length / record_size;

                let mut skip_begin = 0u64;
                for i in 0..frs_count {
                    if bit_is_set(bitmap, first_frs + i) {
                        break;
                    }
                    skip_begin += 1;
                }

                let mut skip_end = 0u64;
                for i in (skip_begin..frs_count).rev() {
                    if bit_is_set(bitmap, first_frs + i) {
                        break;
                    }
                    skip_end += 1;
                }

                SkippableRun { run, skip_begin, skip_end }
            })
            .collect()
    }
}

fn bit_is_set(bitmap: &[u8], index: u64) -> bool {
    let byte = (index / 8) as usize;
    let bit = (index % 8) as u8;
    bitmap.get(byte).map(|b| b & (1 << bit) != 0).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::structs::NtfsVolumeData;

    #[test]
    fn bit_is_set_reads_little_endian_bit_order() {
        let bitmap = vec![0b0000_0010u8, 0b0000_0001];
        assert!(bit_is_set(&bitmap, 1));
        assert!(!bit_is_set(&bitmap, 0));
        assert!(bit_is_set(&bitmap, 8));
        assert!(!bit_is_set(&bitmap, 9));
    }

    #[test]
    fn bit_is_set_treats_out_of_range_as_allocated() {
        let bitmap = vec![0u8; 1];
        assert!(bit_is_set(&bitmap, 100));
    }

    /// A 4-FRS-slot run with the first and last slots free per the bitmap:
    /// `compute_skips` should trim exactly one whole cluster off each end and
    /// leave the two allocated slots in the middle untouched.
    #[test]
    fn compute_skips_trims_free_clusters_off_both_ends() {
        let volume = Arc::new(VolumeDescriptor::for_test(NtfsVolumeData {
            bytes_per_cluster: 1024,
            bytes_per_file_record_segment: 1024,
            ..Default::default()
        }));
        let scheduler = MftScheduler::new(Arc::clone(&volume), IoEngineConfig::default());

        let run = Run { virtual_offset: 0, physical_offset: 0, length: 4096, skip_begin: 0, skip_end: 0 };
        // bit0 (slot 0) free, bit1/bit2 (slots 1-2) allocated, bit3 (slot 3) free.
        let bitmap = vec![0b0000_0110u8];

        let skips = scheduler.compute_skips(&[run], Some(&bitmap), volume.geometry());

        assert_eq!(skips.len(), 1);
        assert_eq!(skips[0].skip_begin, 1);
        assert_eq!(skips[0].skip_end, 1);
    }

    /// With no bitmap at all, every run is read in full (no skip computed).
    #[test]
    fn compute_skips_reads_everything_without_a_bitmap() {
        let volume = Arc::new(VolumeDescriptor::for_test(NtfsVolumeData {
            bytes_per_cluster: 1024,
            bytes_per_file_record_segment: 1024,
            ..Default::default()
        }));
        let scheduler = MftScheduler::new(Arc::clone(&volume), IoEngineConfig::default());

        let run = Run { virtual_offset: 0, physical_offset: 0, length: 4096, skip_begin: 0, skip_end: 0 };
        let skips = scheduler.compute_skips(&[run], None, volume.geometry());

        assert_eq!(skips[0].skip_begin, 0);
        assert_eq!(skips[0].skip_end, 0);
    }

    /// A fully-allocated run (no free bits at all) keeps both ends at zero.
    #[test]
    fn compute_skips_leaves_fully_allocated_run_untrimmed() {
        let volume = Arc::new(VolumeDescriptor::for_test(NtfsVolumeData {
            bytes_per_cluster: 1024,
            bytes_per_file_record_segment: 1024,
            ..Default::default()
        }));
        let scheduler = MftScheduler::new(Arc::clone(&volume), IoEngineConfig::default());

        let run = Run { virtual_offset: 0, physical_offset: 0, length: 2048, skip_begin: 0, skip_end: 0 };
        let bitmap = vec![0b0000_0011u8];

        let skips = scheduler.compute_skips(&[run], Some(&bitmap), volume.geometry());

        assert_eq!(skips[0].skip_begin, 0);
        assert_eq!(skips[0].skip_end, 0);
    }

    /// §7's fatal-per-volume path: a failed read must set `FinishOutcome::Error`,
    /// discard whatever runs were still queued, signal `finished`, and leave the
    /// index rejecting subsequent queries rather than answering from a partial
    /// tree.
    #[test]
    fn report_io_error_sets_error_outcome_and_index_rejects_queries() {
        let volume = Arc::new(VolumeDescriptor::for_test(NtfsVolumeData {
            bytes_per_cluster: 1024,
            bytes_per_file_record_segment: 1024,
            ..Default::default()
        }));
        let engine = Arc::new(IoEngine::start(volume.handle_arc(), Some(0)));
        let index = Arc::new(Index::new("C:"));
        let parser = Arc::new(RecordParser::new(crate::config::ParserConfig::default(), Arc::clone(&volume)));
        let finished = FinishedEvent::new();

        let failing_run = SkippableRun {
            run: Run { virtual_offset: 0, physical_offset: 0, length: 1024, skip_begin: 0, skip_end: 0 },
            skip_begin: 0,
            skip_end: 0,
        };
        let queued_run = SkippableRun {
            run: Run { virtual_offset: 1024, physical_offset: 1024, length: 1024, skip_begin: 0, skip_end: 0 },
            skip_begin: 0,
            skip_end: 0,
        };

        let pipeline = Arc::new(Pipeline {
            engine,
            remaining: Mutex::new(VecDeque::from(vec![queued_run])),
            index: Arc::clone(&index),
            parser,
            outstanding: AtomicUsize::new(2),
            finished: finished.clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
            errored: AtomicBool::new(false),
            record_size: 1024,
        });

        let action = report_io_error(&pipeline, &failing_run, NtfsIndexError::IoFailed(0x57));

        assert_eq!(action, Action::Destroy);
        assert_eq!(index.finish_outcome(), Some(FinishOutcome::Error));
        assert_eq!(index.error_status(), 0x57);
        assert!(finished.is_set());
        assert!(pipeline.remaining.lock().unwrap().is_empty());
        assert_eq!(pipeline.outstanding.load(Ordering::Acquire), 0);

        let matcher = crate::pattern::Matcher::compile(crate::pattern::PatternKind::Anything, "", false).unwrap();
        let cancelled = AtomicBool::new(false);
        let result = index.matches(&matcher, false, crate::config::TraversalConfig::default(), &cancelled, &mut |_, _, _, _| 1);
        assert!(matches!(result, Err(NtfsIndexError::IoFailed(0x57))));
    }
}
