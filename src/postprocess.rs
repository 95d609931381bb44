//! Subtree size aggregator (§4.6): a single-threaded post-order walk from
//! FRS 5 that computes `children_size`, trims the bulkiness figure against
//! the allocated-space threshold, folds the WOF compressed stream's
//! allocation into the default stream, and leaves the hardlink split to be
//! computed lazily at query time (`Index::get_sizes`) via the same
//! [`delta_share`] this module exposes.
//!
//! Grounded on the teacher's `calculate_sizes` (`file_tree.rs`) for the
//! post-order accumulation shape — recurse into children first, then fold
//! each child's totals into the parent's running sum. The bulkiness
//! heap-threshold trim, the delta-rule hardlink split and the WOF merge have
//! no teacher precedent; they are built directly from §4.6 of the
//! specification.

use crate::config::IndexConfig;
use crate::index::{stream_type, Index, NONE_INDEX};
use crate::volume::VolumeDescriptor;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Split `value` proportionally across `total_n` hardlinks so the shares
/// sum to exactly `value` with no rounding drift: the i-th (0-based) share
/// is `value*(i+1)/n - value*i/n`.
pub(crate) fn delta_share(value: u64, index_i: u16, total_n: u16) -> u64 {
    if total_n <= 1 {
        return value;
    }
    let n = total_n as u128;
    let i = index_i as u128;
    let v = value as u128;
    (v * (i + 1) / n - v * i / n) as u64
}

struct Aggregate {
    length: u64,
    allocated: u64,
    bulkiness: u64,
    treesize: u64,
}

/// Walk the whole tree rooted at FRS 5, aggregating subtree sizes into each
/// directory's default stream, then drop `volume` — closing the underlying
/// handle once this is the last outstanding reference (the scheduler's
/// `IoEngine` must already have joined its workers, releasing theirs, by
/// the time this runs).
#[instrument(skip_all)]
pub fn run(index: &Index, config: IndexConfig, volume: Arc<VolumeDescriptor>) {
    let Some(root_idx) = index.find(5) else {
        debug!("no root record found, nothing to post-process");
        return;
    };

    // `ancestors` tracks only the current root-to-here path, not every record
    // visited overall — a file hardlinked under two different directories
    // must be aggregated once per parent (§8's delta-rule property sums
    // contributions across all of a hardlink's occurrences), and only a
    // record recurring along its own path (the root's self-cycle) is a true
    // cycle. Mirrors `traversal::visit`'s `ancestors` guard.
    let mut ancestors = vec![root_idx];
    let root = visit(index, root_idx, 0, config, &volume, &mut ancestors);
    debug!(treesize = root.treesize, allocated = root.allocated, "post-processing complete");

    drop(volume);
}

fn visit(
    index: &Index,
    record_idx: u32,
    depth: usize,
    config: IndexConfig,
    volume: &VolumeDescriptor,
    ancestors: &mut Vec<u32>,
) -> Aggregate {
    let is_directory = index.with_record(record_idx, |r| r.stdinfo.is_directory());

    let mut children_length = 0u64;
    let mut children_allocated = 0u64;
    let mut bulkiness_heap: BinaryHeap<u64> = BinaryHeap::new();
    let mut bulkiness_sum = 0u64;
    let mut treesize_sum = 0u64;

    if is_directory {
        let mut cursor = index.with_record(record_idx, |r| r.first_child);
        while cursor != NONE_INDEX {
            let child = index.childinfo(cursor);
            cursor = child.next_entry;

            let Some(child_idx) = index.find(child.record_number) else { continue };

            // The root's own self-cycle (FRS 5 listed as its own child) is
            // the only case this can trip: a real hardlink never points back
            // up its own ancestor chain. Contribute nothing further so the
            // walk terminates instead of recursing forever.
            if ancestors.contains(&child_idx) {
                continue;
            }

            ancestors.push(child_idx);
            let child_aggregate = visit(index, child_idx, depth + 1, config, volume, ancestors);
            ancestors.pop();

            let child_name_count = index.name_count(child_idx).max(1);
            let display_index = child_name_count.saturating_sub(1).saturating_sub(child.name_index);

            children_length += delta_share(child_aggregate.length, display_index, child_name_count);
            children_allocated += delta_share(child_aggregate.allocated, display_index, child_name_count);
            bulkiness_heap.push(child_aggregate.allocated);
            bulkiness_sum += child_aggregate.allocated;
            treesize_sum += child_aggregate.treesize;
        }
    }

    // Step 2: pop the "big" children off the heap while they dominate the
    // threshold, leaving only small children's allocated space in bulkiness.
    let threshold = children_allocated / 100;
    let mut bulkiness = bulkiness_sum;
    while let Some(&top) = bulkiness_heap.peek() {
        if top < threshold {
            break;
        }
        bulkiness_heap.pop();
        bulkiness = bulkiness.saturating_sub(top);
    }

    // Step 3: the root absorbs the still-reserved MFT zone into its
    // allocated total, if the caller opted in.
    if depth == 0 && config.account_mft_zone {
        children_allocated = children_allocated.saturating_add(volume.reserved_clusters());
    }

    let default_type = if is_directory { stream_type::DIRECTORY } else { stream_type::DATA };
    let stream_count = index.stream_count(record_idx);

    let mut default_stream_index = None;
    let mut wof_stream_index = None;
    for i in 0..stream_count {
        let (type_name_id, name_len, merged) =
            index.with_stream(record_idx, i, |s| (s.type_name_id, s.name.length, s.merged_into_default));
        if type_name_id == default_type && name_len == 0 {
            default_stream_index = Some(i);
        }
        if merged {
            wof_stream_index = Some(i);
        }
    }

    // Step 5: fold the WOF stream's allocation into the default stream, then
    // zero it out — its bytes are now accounted for in one place.
    if let (Some(wof_i), Some(default_i)) = (wof_stream_index, default_stream_index) {
        let wof_allocated = index.with_stream(record_idx, wof_i, |s| s.size.allocated);
        index.with_stream_mut(record_idx, default_i, |s| s.size.allocated += wof_allocated);
        index.with_stream_mut(record_idx, wof_i, |s| {
            s.size.allocated = 0;
            s.size.length = 0;
        });
    }

    // Step 4 (directory half): the default stream absorbs children_size.
    if is_directory {
        if let Some(default_i) = default_stream_index {
            index.with_stream_mut(record_idx, default_i, |s| {
                s.size.allocated += children_allocated;
                s.size.length += children_length;
                s.size.bulkiness = bulkiness;
                s.size.treesize = treesize_sum + 1;
            });
        }
    }

    let (own_length, own_allocated, own_treesize) = match default_stream_index {
        Some(default_i) => index.with_stream(record_idx, default_i, |s| (s.size.length, s.size.allocated, s.size.treesize)),
        None => (children_length, children_allocated, treesize_sum + 1),
    };

    Aggregate { length: own_length, allocated: own_allocated, bulkiness, treesize: own_treesize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{stdinfo_flags, NameInfo, SizeInfo};
    use crate::ntfs::structs::NtfsVolumeData;

    fn test_volume() -> VolumeDescriptor {
        VolumeDescriptor::for_test(NtfsVolumeData { bytes_per_cluster: 4096, bytes_per_file_record_segment: 1024, ..Default::default() })
    }

    /// One file hardlinked under two separate directories: each parent must
    /// see the file's full contribution via its own delta-rule share, not
    /// have it silently dropped because the other parent reached it first.
    #[test]
    fn hardlinked_file_contributes_to_both_parent_directories() {
        let index = Index::new("C:");
        let root = index.at(5).unwrap();
        let root_name = index.push_name("C:");
        index.push_name_link(root, 5, root_name);
        index.with_record_mut(root, |r| r.stdinfo.set_flag(stdinfo_flags::DIRECTORY, true));
        index.find_or_push_stream(root, stream_type::DIRECTORY, NameInfo::default());

        let dir_a = index.at(10).unwrap();
        let dir_a_name = index.push_name("a");
        let dir_a_insertion = index.push_name_link(dir_a, 5, dir_a_name);
        index.push_child(root, 10, dir_a_insertion);
        index.with_record_mut(dir_a, |r| r.stdinfo.set_flag(stdinfo_flags::DIRECTORY, true));
        index.find_or_push_stream(dir_a, stream_type::DIRECTORY, NameInfo::default());

        let dir_b = index.at(11).unwrap();
        let dir_b_name = index.push_name("b");
        let dir_b_insertion = index.push_name_link(dir_b, 5, dir_b_name);
        index.push_child(root, 11, dir_b_insertion);
        index.with_record_mut(dir_b, |r| r.stdinfo.set_flag(stdinfo_flags::DIRECTORY, true));
        index.find_or_push_stream(dir_b, stream_type::DIRECTORY, NameInfo::default());

        let file = index.at(20).unwrap();
        let name_in_a = index.push_name("shared.txt");
        let insertion_in_a = index.push_name_link(file, 10, name_in_a);
        index.push_child(dir_a, 20, insertion_in_a);
        let name_in_b = index.push_name("shared.txt");
        let insertion_in_b = index.push_name_link(file, 11, name_in_b);
        index.push_child(dir_b, 20, insertion_in_b);
        index.find_or_push_stream(file, stream_type::DATA, NameInfo::default());
        index.with_stream_mut(file, 0, |s| s.size = SizeInfo { length: 200, allocated: 4096, bulkiness: 0, treesize: 0 });

        let volume = Arc::new(test_volume());
        run(&index, IndexConfig { account_mft_zone: false, ..IndexConfig::default() }, volume);

        let dir_a_default = index.find_or_push_stream(dir_a, stream_type::DIRECTORY, NameInfo::default());
        let dir_b_default = index.find_or_push_stream(dir_b, stream_type::DIRECTORY, NameInfo::default());
        let dir_a_sizes = index.with_stream(dir_a, dir_a_default, |s| s.size);
        let dir_b_sizes = index.with_stream(dir_b, dir_b_default, |s| s.size);

        // The file has two names total, so each parent's share is half —
        // both parents see it, neither is starved by the other reaching the
        // file first in the walk.
        assert_eq!(dir_a_sizes.length, 100);
        assert_eq!(dir_a_sizes.allocated, 2048);
        assert_eq!(dir_b_sizes.length, 100);
        assert_eq!(dir_b_sizes.allocated, 2048);
    }

    #[test]
    fn delta_share_sums_exactly_to_value_for_odd_splits() {
        let n = 3u16;
        let value = 100u64;
        let total: u64 = (0..n).map(|i| delta_share(value, i, n)).sum();
        assert_eq!(total, value);
    }

    #[test]
    fn delta_share_splits_evenly_when_it_divides() {
        assert_eq!(delta_share(100, 0, 2), 50);
        assert_eq!(delta_share(100, 1, 2), 50);
    }

    #[test]
    fn delta_share_single_link_keeps_the_whole_value() {
        assert_eq!(delta_share(4096, 0, 1), 4096);
        assert_eq!(delta_share(4096, 0, 0), 4096);
    }
}
