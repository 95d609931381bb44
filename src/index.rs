//! The index store: typed, append-only arenas tying records, names, streams
//! and children together with stable 32-bit indices.
//!
//! Nothing here chases pointers or reference-counts. A `Record` refers to
//! other records only through FRS numbers; everything else is an index into
//! one of the arenas below. Once `push_back`-ed an entry never moves and its
//! index never dangles — growth is append-only, matching the lifecycle
//! contract that nothing is mutated after its owning record is complete.

use crate::error::{NtfsIndexError, Result};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Sentinel meaning "no index" for `Option<u32>`-shaped arena links. Kept as
/// a real constant (rather than relying purely on `Option::None`) because
/// the wire-level packed representation in `records_lookup` uses it too.
pub const NONE_INDEX: u32 = u32::MAX;

/// 10-bit "first name" and 13-bit "default stream" sentinels (all-ones).
pub const FIRST_NAME: u16 = 0x3FF;
pub const DEFAULT_STREAM: u16 = 0x1FFF;

/// Identifies an observable entity at `(FRS, name-index, stream-index)`,
/// plus a transient index into whatever result list produced it.
///
/// Layout (low to high bit): FRS (32), name index (10), stream index (13),
/// transient result index (9). `name_index == FIRST_NAME` means "the
/// record's in-place first name"; `stream_index == DEFAULT_STREAM` means
/// "the default (unnamed) data stream".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(u64);

impl Key {
    pub fn new(frs: u32, name_index: u16, stream_index: u16) -> Self {
        let name_index = (name_index & 0x3FF) as u64;
        let stream_index = (stream_index & 0x1FFF) as u64;
        Key(frs as u64 | (name_index << 32) | (stream_index << 42))
    }

    pub fn with_result_index(self, result_index: u32) -> Self {
        let result_index = (result_index as u64 & 0x1FF) << 55;
        Key((self.0 & ((1 << 55) - 1)) | result_index)
    }

    pub fn frs(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn name_index(self) -> u16 {
        ((self.0 >> 32) & 0x3FF) as u16
    }

    pub fn stream_index(self) -> u16 {
        ((self.0 >> 42) & 0x1FFF) as u16
    }

    pub fn result_index(self) -> u32 {
        ((self.0 >> 55) & 0x1FF) as u32
    }

    pub fn is_first_name(self) -> bool {
        self.name_index() == FIRST_NAME
    }

    pub fn is_default_stream(self) -> bool {
        self.stream_index() == DEFAULT_STREAM
    }
}

/// `(offset into the names arena, length, ascii?)`, packed so the offset
/// occupies the high bits and the ascii flag the low bit — offsets never
/// need the full 64 bits, and the boundary case in §8 ("name offsets do not
/// exceed 2^31") leaves room to spare.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameInfo {
    offset_and_ascii: u64,
    pub length: u32,
}

impl NameInfo {
    pub fn new(offset: u64, length: u32, ascii: bool) -> Self {
        debug_assert!(offset < (1 << 63), "name offset overflowed packed field");
        Self { offset_and_ascii: (offset << 1) | (ascii as u64), length }
    }

    pub fn offset(self) -> u64 {
        self.offset_and_ascii >> 1
    }

    pub fn ascii(self) -> bool {
        self.offset_and_ascii & 1 != 0
    }

    pub fn is_empty(self) -> bool {
        self.length == 0
    }
}

/// 15 boolean attribute flags packed into one bitfield, per the source's
/// `$STANDARD_INFORMATION` layout, plus the three timestamps we keep.
pub mod stdinfo_flags {
    pub const READONLY: u16 = 1 << 0;
    pub const ARCHIVE: u16 = 1 << 1;
    pub const SYSTEM: u16 = 1 << 2;
    pub const HIDDEN: u16 = 1 << 3;
    pub const OFFLINE: u16 = 1 << 4;
    pub const NOT_CONTENT_INDEXED: u16 = 1 << 5;
    pub const NO_SCRUB_DATA: u16 = 1 << 6;
    pub const INTEGRITY_STREAM: u16 = 1 << 7;
    pub const PINNED: u16 = 1 << 8;
    pub const UNPINNED: u16 = 1 << 9;
    pub const DIRECTORY: u16 = 1 << 10;
    pub const COMPRESSED: u16 = 1 << 11;
    pub const ENCRYPTED: u16 = 1 << 12;
    pub const SPARSE: u16 = 1 << 13;
    pub const REPARSE_POINT: u16 = 1 << 14;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardInfo {
    pub created: u64,
    pub written: u64,
    pub accessed: u64,
    flags: u16,
}

impl StandardInfo {
    pub fn attributes(&self) -> u16 {
        self.flags
    }

    pub fn set_flag(&mut self, flag: u16, value: bool) {
        if value {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn is_directory(&self) -> bool {
        self.has_flag(stdinfo_flags::DIRECTORY)
    }
}

/// One node of the reversed-insertion-order singly-linked name list. The
/// record's `first_name` field holds the most recently inserted name
/// in-place; everything before it lives in the `nameinfos` arena.
#[derive(Debug, Clone, Copy)]
pub struct LinkInfo {
    pub parent: u32,
    pub name: NameInfo,
    pub next_entry: u32,
}

impl Default for LinkInfo {
    fn default() -> Self {
        Self { parent: 0, name: NameInfo::default(), next_entry: NONE_INDEX }
    }
}

/// Stream "type name" codes used by stream folding (§4.4) and the fixed
/// attribute-name table consulted during path rendering (§4.8).
pub mod stream_type {
    pub const DIRECTORY: u16 = 0;
    pub const DATA: u16 = 1;
    pub const REPARSE: u16 = 2;
    pub const EA: u16 = 3;
    pub const OBJECT_ID: u16 = 4;
}

pub fn stream_type_name(type_name_id: u16) -> &'static str {
    match type_name_id {
        stream_type::DIRECTORY => "",
        stream_type::DATA => "$DATA",
        stream_type::REPARSE => "$REPARSE_POINT",
        stream_type::EA => "$EA",
        stream_type::OBJECT_ID => "$OBJECT_ID",
        _ => "$DATA",
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SizeInfo {
    pub length: u64,
    pub allocated: u64,
    pub bulkiness: u64,
    pub treesize: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub type_name_id: u16,
    pub name: NameInfo,
    pub size: SizeInfo,
    pub sparse: bool,
    /// Set on the WOF `WofCompressedData` stream; its allocation is folded
    /// into the default stream by the post-processor instead of counted here.
    pub merged_into_default: bool,
    pub next_entry: u32,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            type_name_id: stream_type::DATA,
            name: NameInfo::default(),
            size: SizeInfo::default(),
            sparse: false,
            merged_into_default: false,
            next_entry: NONE_INDEX,
        }
    }
}

/// A linked-list entry in the parent's child chain: `(next, record_number,
/// name_index)`. Insertion order within a directory is preserved (unlike
/// the name/stream lists, which are LIFO).
#[derive(Debug, Clone, Copy)]
pub struct ChildInfo {
    pub record_number: u32,
    pub name_index: u16,
    pub next_entry: u32,
}

/// One File Record Segment's worth of decoded state.
#[derive(Debug, Clone)]
pub struct Record {
    pub frs: u32,
    pub stdinfo: StandardInfo,
    pub name_count: u16,
    pub stream_count: u16,
    pub first_child: u32,
    pub first_name: LinkInfo,
    pub first_stream: StreamInfo,
}

impl Record {
    fn new(frs: u32) -> Self {
        Self {
            frs,
            stdinfo: StandardInfo::default(),
            name_count: 0,
            stream_count: 0,
            first_child: NONE_INDEX,
            first_name: LinkInfo::default(),
            first_stream: StreamInfo::default(),
        }
    }
}

/// The mutable state behind `Index`'s reentrant lock. Plain data; all the
/// invariants live in `Index`'s methods, not here.
#[derive(Default)]
struct IndexInner {
    records_lookup: Vec<u32>,
    records_data: Vec<Record>,
    names: Vec<u8>,
    nameinfos: Vec<LinkInfo>,
    streaminfos: Vec<StreamInfo>,
    childinfos: Vec<ChildInfo>,
    sealed: bool,
}

/// Append-only index of every record, name, stream and child link found
/// while parsing one volume.
///
/// Mutation is serialized by a recursive mutex: parser workers lock it once
/// per record to append; traversal holds it for the whole callback-driven
/// walk so that reads never race a (by then finished) writer. Because
/// `parking_lot::ReentrantMutex` only ever hands back shared access, the
/// actual field mutation goes through a `RefCell` — this also means a
/// traversal callback that tried to mutate the index while it's being
/// walked would panic on the inner `borrow_mut`, which is the behaviour we
/// want: once sealed, nothing should be appending.
pub struct Index {
    inner: ReentrantMutex<RefCell<IndexInner>>,
    root_path: String,
    pub(crate) reserved_clusters: AtomicU64,
    records_so_far: AtomicU64,
    valid_records: AtomicU64,
    mft_capacity: AtomicU64,
    bytes_read: AtomicU64,
    finished: AtomicU64, // 0 = running, 1 = done, 2 = cancelled, 3 = error
    error_status: AtomicU32,
}

const FINISHED_RUNNING: u64 = 0;
const FINISHED_DONE: u64 = 1;
const FINISHED_CANCELLED: u64 = 2;
const FINISHED_ERROR: u64 = 3;

impl Index {
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(IndexInner::default())),
            root_path: root_path.into(),
            reserved_clusters: AtomicU64::new(0),
            records_so_far: AtomicU64::new(0),
            valid_records: AtomicU64::new(0),
            mft_capacity: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            finished: AtomicU64::new(FINISHED_RUNNING),
            error_status: AtomicU32::new(0),
        }
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Pre-size the arenas for an expected MFT capacity. Matches the
    /// source's `reserve` contract: callers may call this once they know
    /// `mft_capacity` from `query_geometry`, before any `load`.
    pub fn reserve(&self, mft_capacity: u64) {
        self.mft_capacity.store(mft_capacity, Ordering::Relaxed);
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.records_lookup.len() < mft_capacity as usize {
            inner.records_lookup.resize(mft_capacity as usize, NONE_INDEX);
        }
        inner.records_data.reserve(mft_capacity as usize);
    }

    /// Fetch or create the record for `frs`, growing `records_lookup` and
    /// `records_data` on demand. Returns the record's index into
    /// `records_data`, not the record itself — callers re-borrow to avoid
    /// holding a reference across a nested `at`/`push_back` call.
    pub fn at(&self, frs: u32) -> Result<u32> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.sealed {
            return Err(NtfsIndexError::Corrupt(frs as u64));
        }

        if (frs as usize) >= inner.records_lookup.len() {
            inner.records_lookup.resize(frs as usize + 1, NONE_INDEX);
        }

        let existing = inner.records_lookup[frs as usize];
        if existing != NONE_INDEX {
            return Ok(existing);
        }

        let new_index = inner.records_data.len() as u32;
        inner.records_data.push(Record::new(frs));
        inner.records_lookup[frs as usize] = new_index;
        Ok(new_index)
    }

    /// Look up an already-created record's arena index without creating one.
    pub fn find(&self, frs: u32) -> Option<u32> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .records_lookup
            .get(frs as usize)
            .copied()
            .filter(|&idx| idx != NONE_INDEX)
    }

    pub fn with_record<R>(&self, idx: u32, f: impl FnOnce(&Record) -> R) -> R {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        f(&inner.records_data[idx as usize])
    }

    pub fn with_record_mut<R>(&self, idx: u32, f: impl FnOnce(&mut Record) -> R) -> R {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        f(&mut inner.records_data[idx as usize])
    }

    /// Append raw name bytes, returning the `(offset, length, ascii)` triple
    /// ready to pack into a `NameInfo`. ASCII names are stored as bytes,
    /// non-ASCII as little-endian UTF-16 code units reinterpreted as bytes.
    pub fn push_name(&self, name: &str) -> NameInfo {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let ascii = name.is_ascii();
        let offset = inner.names.len() as u64;
        if ascii {
            inner.names.extend_from_slice(name.as_bytes());
            NameInfo::new(offset, name.len() as u32, true)
        } else {
            let wide: Vec<u16> = name.encode_utf16().collect();
            inner.names.extend(wide.iter().flat_map(|c| c.to_le_bytes()));
            NameInfo::new(offset, wide.len() as u32, false)
        }
    }

    pub fn read_name(&self, info: NameInfo) -> String {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let start = info.offset() as usize;
        if info.ascii() {
            let end = start + info.length as usize;
            String::from_utf8_lossy(&inner.names[start..end]).into_owned()
        } else {
            let end = start + info.length as usize * 2;
            let units: Vec<u16> = inner.names[start..end]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
    }

    /// Push a new name onto a record's name chain. The first call for a
    /// record fills `first_name` in place; later calls push the previous
    /// `first_name` into the `nameinfos` arena and prepend the new one —
    /// LIFO order, so `name_index = name_count - 1 - insertion_index`.
    pub fn push_name_link(&self, record_idx: u32, parent: u32, name: NameInfo) -> u16 {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let record = &mut inner.records_data[record_idx as usize];
        let new_name_index = record.name_count;

        if record.name_count == 0 {
            record.first_name = LinkInfo { parent, name, next_entry: NONE_INDEX };
        } else {
            let displaced = record.first_name;
            let arena_idx = inner.nameinfos.len() as u32;
            inner.nameinfos.push(displaced);
            let record = &mut inner.records_data[record_idx as usize];
            record.first_name = LinkInfo { parent, name, next_entry: arena_idx };
        }

        inner.records_data[record_idx as usize].name_count += 1;
        new_name_index
    }

    /// Append a `ChildInfo` to `parent`'s child chain (insertion order).
    pub fn push_child(&self, parent_idx: u32, record_number: u32, name_index: u16) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let new_idx = inner.childinfos.len() as u32;
        let head = inner.records_data[parent_idx as usize].first_child;

        // Insertion order is observable (§3), so walk to the tail instead of
        // prepending. Directories are shallow enough in practice that this
        // linear walk is cheaper than maintaining a separate tail pointer
        // per record just for this one append path.
        if head == NONE_INDEX {
            inner.childinfos.push(ChildInfo { record_number, name_index, next_entry: NONE_INDEX });
            inner.records_data[parent_idx as usize].first_child = new_idx;
        } else {
            let mut cursor = head;
            loop {
                let next = inner.childinfos[cursor as usize].next_entry;
                if next == NONE_INDEX {
                    break;
                }
                cursor = next;
            }
            inner.childinfos.push(ChildInfo { record_number, name_index, next_entry: NONE_INDEX });
            inner.childinfos[cursor as usize].next_entry = new_idx;
        }
    }

    /// Find or push a stream matching `(type_name_id, name)`, folding
    /// directory-structure attributes (`$I30`, index root/allocation) into
    /// one synthetic directory stream per §4.4.
    pub fn find_or_push_stream(&self, record_idx: u32, type_name_id: u16, name: NameInfo) -> u16 {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        // Walk the existing chain looking for a match.
        let mut cursor = Some(record_idx);
        let mut stream_index: u16 = 0;
        let mut in_place = true;
        loop {
            let (matches, next) = if in_place {
                let s = &inner.records_data[record_idx as usize].first_stream;
                (s.type_name_id == type_name_id && names_equal(&inner.names, s.name, name), s.next_entry)
            } else {
                let s = &inner.streaminfos[cursor.unwrap() as usize];
                (s.type_name_id == type_name_id && names_equal(&inner.names, s.name, name), s.next_entry)
            };

            if matches {
                // An untouched record's `first_stream` is `StreamInfo::default()`,
                // which reads identically to an already-pushed unnamed `$DATA`
                // stream. The first real lookup for that stream "matches" here
                // without ever having been counted; claim the slot now so a
                // later, distinct stream push (e.g. a WOF shadow stream) sees a
                // nonzero `stream_count` and chains instead of overwriting it.
                if in_place {
                    let rec = &mut inner.records_data[record_idx as usize];
                    if rec.stream_count == 0 {
                        rec.stream_count = 1;
                    }
                }
                return stream_index;
            }
            if next == NONE_INDEX {
                break;
            }
            cursor = Some(next);
            in_place = false;
            stream_index += 1;
        }

        // No match: push a new stream onto the front, LIFO, same as names.
        // The new entry always lands in `first_stream` itself, so it is
        // always at physical index 0 regardless of how many streams already
        // existed.
        let record = &mut inner.records_data[record_idx as usize];
        if record.stream_count == 0 {
            record.first_stream = StreamInfo { type_name_id, name, next_entry: NONE_INDEX, ..StreamInfo::default() };
        } else {
            let displaced = record.first_stream;
            let arena_idx = inner.streaminfos.len() as u32;
            inner.streaminfos.push(displaced);
            let record = &mut inner.records_data[record_idx as usize];
            record.first_stream = StreamInfo { type_name_id, name, next_entry: arena_idx, ..StreamInfo::default() };
        }
        inner.records_data[record_idx as usize].stream_count += 1;
        0
    }

    pub fn with_stream_mut<R>(&self, record_idx: u32, stream_index: u16, f: impl FnOnce(&mut StreamInfo) -> R) -> R {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if stream_index == 0 {
            return f(&mut inner.records_data[record_idx as usize].first_stream);
        }
        let mut cursor = inner.records_data[record_idx as usize].first_stream.next_entry;
        for _ in 1..stream_index {
            cursor = inner.streaminfos[cursor as usize].next_entry;
        }
        f(&mut inner.streaminfos[cursor as usize])
    }

    /// Read-only counterpart to `with_stream_mut`, same front-is-index-0
    /// chain walk.
    pub fn with_stream<R>(&self, record_idx: u32, stream_index: u16, f: impl FnOnce(&StreamInfo) -> R) -> R {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        if stream_index == 0 {
            return f(&inner.records_data[record_idx as usize].first_stream);
        }
        let mut cursor = inner.records_data[record_idx as usize].first_stream.next_entry;
        for _ in 1..stream_index {
            cursor = inner.streaminfos[cursor as usize].next_entry;
        }
        f(&inner.streaminfos[cursor as usize])
    }

    pub fn stream_count(&self, record_idx: u32) -> u16 {
        self.with_record(record_idx, |r| r.stream_count)
    }

    pub fn name_count(&self, record_idx: u32) -> u16 {
        self.with_record(record_idx, |r| r.name_count)
    }

    /// Resolve a name link by the *insertion* index `push_name_link`
    /// returned (the value `ChildInfo::name_index` and `Key::name_index`
    /// both carry), converting it to the current front-is-0 storage
    /// position. Only meaningful once the record's name chain is complete —
    /// i.e. at query time, after parsing, since the conversion depends on
    /// the record's final `name_count`.
    pub(crate) fn name_link_by_insertion(&self, record_idx: u32, insertion_index: u16) -> LinkInfo {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let count = inner.records_data[record_idx as usize].name_count;
        let display = count.saturating_sub(1).saturating_sub(insertion_index);
        if display == 0 {
            return inner.records_data[record_idx as usize].first_name;
        }
        let mut cursor = inner.records_data[record_idx as usize].first_name.next_entry;
        for _ in 1..display {
            cursor = inner.nameinfos[cursor as usize].next_entry;
        }
        inner.nameinfos[cursor as usize]
    }

    /// Split a stream's stored totals across hardlinks via the delta rule
    /// (§4.6): the i-th of n shares is `value*(i+1)/n - value*i/n`, summing
    /// to exactly `value` with no rounding drift.
    pub fn get_sizes(&self, key: Key) -> SizeInfo {
        let Some(record_idx) = self.find(key.frs()) else { return SizeInfo::default() };
        let stream_index = if key.is_default_stream() { 0 } else { key.stream_index() };
        if stream_index >= self.stream_count(record_idx).max(1) {
            return SizeInfo::default();
        }
        let raw = self.with_stream(record_idx, stream_index, |s| s.size);
        let name_count = self.name_count(record_idx).max(1);
        let display_index = if key.is_first_name() {
            0
        } else {
            name_count.saturating_sub(1).saturating_sub(key.name_index())
        };
        SizeInfo {
            length: crate::postprocess::delta_share(raw.length, display_index, name_count),
            allocated: crate::postprocess::delta_share(raw.allocated, display_index, name_count),
            bulkiness: raw.bulkiness,
            treesize: raw.treesize,
        }
    }

    /// Reconstruct the `\`-separated path (or just the leaf name in
    /// name-only mode) for `key`, returning `(path, all_ascii)`. Ancestors
    /// above the specific occurrence named by `key` are rendered via their
    /// own in-place (most recently inserted) name, matching the teacher's
    /// `build_path` convention of always walking "the" parent name rather
    /// than tracking which link led there.
    pub fn get_path(&self, key: Key, name_only: bool) -> (String, bool) {
        let Some(record_idx) = self.find(key.frs()) else { return (String::new(), true) };

        let link = if key.is_first_name() {
            self.with_record(record_idx, |r| r.first_name)
        } else {
            self.name_link_by_insertion(record_idx, key.name_index())
        };
        let leaf = self.read_name(link.name);
        let mut ascii_all = link.name.ascii();

        if name_only {
            return (leaf, ascii_all);
        }

        let mut components = vec![leaf];
        let mut current_frs = key.frs();
        let mut parent_frs = link.parent;
        while parent_frs != current_frs {
            let Some(parent_idx) = self.find(parent_frs) else { break };
            let parent_link = self.with_record(parent_idx, |r| r.first_name);
            ascii_all &= parent_link.name.ascii();
            components.push(self.read_name(parent_link.name));
            current_frs = parent_frs;
            parent_frs = parent_link.parent;
        }
        components.reverse();
        (components.join("\\"), ascii_all)
    }

    pub fn get_stdinfo(&self, frs: u32) -> Option<StandardInfo> {
        self.find(frs).map(|idx| self.with_record(idx, |r| r.stdinfo))
    }

    /// Drive `callback` over every matching stream in the tree (§4.8),
    /// holding this index's lock for the duration so traversal never races
    /// a still-running parser worker.
    /// Run a traversal query against this index. A scan that ended with
    /// `FinishOutcome::Error` (§7, "a mid-scan failure ... discards that
    /// volume's partial index") never reaches the traversal driver at all —
    /// the partial data is discarded by refusing the query outright rather
    /// than answering from an incomplete tree.
    pub fn matches(
        &self,
        matcher: &crate::pattern::Matcher,
        name_only: bool,
        config: crate::config::TraversalConfig,
        cancelled: &std::sync::atomic::AtomicBool,
        callback: &mut dyn FnMut(&str, bool, Key, usize) -> i32,
    ) -> Result<()> {
        if self.finish_outcome() == Some(FinishOutcome::Error) {
            return Err(NtfsIndexError::IoFailed(self.error_status()));
        }
        crate::traversal::run(self, matcher, name_only, config, cancelled, callback)
    }

    pub fn total_names_and_streams(&self) -> (u64, u64) {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        (inner.nameinfos.len() as u64, inner.streaminfos.len() as u64)
    }

    pub fn seal(&self) {
        let guard = self.inner.lock();
        guard.borrow_mut().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        let guard = self.inner.lock();
        guard.borrow().sealed
    }

    pub fn add_records_so_far(&self, n: u64) -> u64 {
        self.records_so_far.fetch_add(n, Ordering::AcqRel) + n
    }

    pub fn records_so_far(&self) -> u64 {
        self.records_so_far.load(Ordering::Acquire)
    }

    pub fn add_valid_records(&self, n: u64) {
        self.valid_records.fetch_add(n, Ordering::Relaxed);
    }

    pub fn valid_records(&self) -> u64 {
        self.valid_records.load(Ordering::Relaxed)
    }

    pub fn mft_capacity(&self) -> u64 {
        self.mft_capacity.load(Ordering::Relaxed)
    }

    pub fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn speed(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn set_finished(&self, outcome: FinishOutcome) {
        let code = match outcome {
            FinishOutcome::Done => FINISHED_DONE,
            FinishOutcome::Cancelled => FINISHED_CANCELLED,
            FinishOutcome::Error => FINISHED_ERROR,
        };
        self.finished.store(code, Ordering::Release);
        self.seal();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire) != FINISHED_RUNNING
    }

    pub fn finish_outcome(&self) -> Option<FinishOutcome> {
        match self.finished.load(Ordering::Acquire) {
            FINISHED_DONE => Some(FinishOutcome::Done),
            FINISHED_CANCELLED => Some(FinishOutcome::Cancelled),
            FINISHED_ERROR => Some(FinishOutcome::Error),
            _ => None,
        }
    }

    /// Record the Win32 status of the read that triggered `FinishOutcome::Error`,
    /// surfaced back to callers that query an errored index (see `matches`).
    pub fn set_error_status(&self, status: u32) {
        self.error_status.store(status, Ordering::Release);
    }

    pub fn error_status(&self) -> u32 {
        self.error_status.load(Ordering::Acquire)
    }

    pub fn record_count(&self) -> u32 {
        let guard = self.inner.lock();
        guard.borrow().records_data.len() as u32
    }

    pub(crate) fn childinfo(&self, idx: u32) -> ChildInfo {
        let guard = self.inner.lock();
        guard.borrow().childinfos[idx as usize]
    }

    pub(crate) fn nameinfo(&self, idx: u32) -> LinkInfo {
        let guard = self.inner.lock();
        guard.borrow().nameinfos[idx as usize]
    }

    pub(crate) fn streaminfo(&self, idx: u32) -> StreamInfo {
        let guard = self.inner.lock();
        guard.borrow().streaminfos[idx as usize]
    }
}

/// Byte-identical comparison of two names already stored in `names`, used by
/// `find_or_push_stream` to match the full (type, name) pair rather than
/// just name length — two alternate streams of equal name length but
/// different content must not be folded into one.
fn names_equal(names: &[u8], a: NameInfo, b: NameInfo) -> bool {
    if a.ascii() != b.ascii() || a.length != b.length {
        return false;
    }
    let byte_len = if a.ascii() { a.length as usize } else { a.length as usize * 2 };
    let a_start = a.offset() as usize;
    let b_start = b.offset() as usize;
    names[a_start..a_start + byte_len] == names[b_start..b_start + byte_len]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Done,
    Cancelled,
    Error,
}
