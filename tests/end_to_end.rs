//! End-to-end coverage for the scenarios the core's contract is built
//! around: a literal search, a globstar search that prunes an unrelated
//! subtree, hardlink size accounting, WOF allocation folding, and
//! cancellation partway through a walk. The bitmap-skip and fatal-I/O-error
//! scenarios live as unit tests in `scheduler.rs` instead, since both need
//! `MftScheduler`'s internals directly rather than a parser/index fixture.
//!
//! Every test drives the real parser and index together rather than mocking
//! either — FRS buffers are synthesized by hand the same way `parser`'s own
//! unit tests do (see its `build_record` helper), just assembled here from
//! smaller attribute-builder pieces since some scenarios need more than one
//! `$FILE_NAME` or `$DATA` attribute per record. `VolumeDescriptor::for_test`
//! stands in for a real volume handle; nothing here touches the filesystem.

use ntfs_mft_search::config::TraversalConfig;
use ntfs_mft_search::error::NtfsIndexError;
use ntfs_mft_search::index::{stdinfo_flags, Index, DEFAULT_STREAM, FIRST_NAME};
use ntfs_mft_search::ntfs::structs::{NtfsVolumeData, MFT_RECORD_IN_USE, MFT_RECORD_IS_DIRECTORY, MFT_RECORD_SIGNATURE};
use ntfs_mft_search::parser::{ParseOutcome, RecordParser};
use ntfs_mft_search::pattern::{Matcher, PatternKind};
use ntfs_mft_search::volume::VolumeDescriptor;
use ntfs_mft_search::{ParserConfig, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const RECORD_SIZE: usize = 1024;
const ATTR_OFFSET: usize = 56;

fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}
fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}
fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}
fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn new_record_header(is_directory: bool) -> Vec<u8> {
    let mut buf = vec![0u8; RECORD_SIZE];
    put_u32(&mut buf, 0, MFT_RECORD_SIGNATURE);
    put_u16(&mut buf, 4, 48); // update_sequence_offset
    put_u16(&mut buf, 6, 1); // update_sequence_size: 1 == no fixups to apply
    put_u16(&mut buf, 20, ATTR_OFFSET as u16);
    let mut flags = MFT_RECORD_IN_USE;
    if is_directory {
        flags |= MFT_RECORD_IS_DIRECTORY;
    }
    put_u16(&mut buf, 22, flags);
    buf
}

fn build_filename_attr(parent_frs: u64, name: &str) -> Vec<u8> {
    let name_wide: Vec<u8> = name.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    let content_len = 66 + name_wide.len();
    let attr_len = align4(16 + 8 + content_len);
    let mut attr = vec![0u8; attr_len];
    put_u32(&mut attr, 0, 0x30); // type: $FILE_NAME
    put_u32(&mut attr, 4, attr_len as u32);
    attr[8] = 0; // non_resident = false
    put_u16(&mut attr, 10, 0); // name_offset (unnamed attribute)
    put_u32(&mut attr, 16, content_len as u32); // value_length
    put_u16(&mut attr, 20, 24); // value_offset

    let c = 24;
    put_u64(&mut attr, c, parent_frs);
    attr[c + 64] = name.encode_utf16().count() as u8;
    attr[c + 65] = 1; // namespace: Win32
    attr[c + 66..c + 66 + name_wide.len()].copy_from_slice(&name_wide);
    attr
}

fn build_resident_data_attr(data_len: u32) -> Vec<u8> {
    let attr_len = align4(16 + 8 + data_len as usize);
    let mut attr = vec![0u8; attr_len];
    put_u32(&mut attr, 0, 0x80); // type: $DATA
    put_u32(&mut attr, 4, attr_len as u32);
    attr[8] = 0;
    put_u16(&mut attr, 10, 0);
    put_u32(&mut attr, 16, data_len);
    put_u16(&mut attr, 20, 24);
    attr
}

/// A non-resident `$DATA` (or named alternate data stream) attribute with no
/// real mapping pairs — `data_runs_offset` points past the end of the
/// buffer, so the parser's run-accounting walk sees nothing to decode.
fn build_non_resident_data_attr(stream_name: Option<&str>, data_size: u64, allocated_size: u64) -> Vec<u8> {
    let name_wide: Vec<u8> = stream_name.map(|n| n.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()).unwrap_or_default();
    let name_units = stream_name.map(|n| n.encode_utf16().count()).unwrap_or(0) as u8;

    let name_offset = 16 + 48; // fixed non-resident fields, no compression_unit
    let data_runs_offset = name_offset + name_wide.len();
    let attr_len = align4(data_runs_offset);

    let mut attr = vec![0u8; attr_len];
    put_u32(&mut attr, 0, 0x80);
    put_u32(&mut attr, 4, attr_len as u32);
    attr[8] = 1; // non_resident = true
    attr[9] = name_units;
    put_u16(&mut attr, 10, name_offset as u16);

    put_u64(&mut attr, 16, 0); // lowest_vcn
    put_u64(&mut attr, 24, 0); // highest_vcn
    put_u16(&mut attr, 32, data_runs_offset as u16);
    put_u16(&mut attr, 34, 0); // compression_unit
    put_u64(&mut attr, 40, allocated_size);
    put_u64(&mut attr, 48, data_size);
    put_u64(&mut attr, 56, data_size); // initialized_size

    if !name_wide.is_empty() {
        attr[name_offset..name_offset + name_wide.len()].copy_from_slice(&name_wide);
    }
    attr
}

fn finish_record(mut buf: Vec<u8>, attrs: &[Vec<u8>]) -> Vec<u8> {
    let mut offset = ATTR_OFFSET;
    for attr in attrs {
        buf[offset..offset + attr.len()].copy_from_slice(attr);
        offset += attr.len();
    }
    put_u32(&mut buf, offset, 0xFFFF_FFFF); // end marker
    buf
}

fn test_volume() -> Arc<VolumeDescriptor> {
    let geometry = NtfsVolumeData {
        bytes_per_cluster: 4096,
        bytes_per_file_record_segment: RECORD_SIZE as u32,
        mft_start_lcn: 0,
        mft_zone_start: 0,
        mft_zone_end: 0,
        ..Default::default()
    };
    Arc::new(VolumeDescriptor::for_test(geometry))
}

fn parse_into(parser: &RecordParser, index: &Index, frs: u32, mut buf: Vec<u8>) -> ParseOutcome {
    parser.parse_record(index, frs, &mut buf)
}

#[test]
fn trivial_literal_search_finds_exact_file() -> Result<()> {
    let volume = test_volume();
    let parser = RecordParser::new(ParserConfig::default(), Arc::clone(&volume));
    let index = Index::new("C:");

    index.at(5)?;
    let root = finish_record(new_record_header(true), &[build_filename_attr(5, "C:")]);
    assert_eq!(parse_into(&parser, &index, 5, root), ParseOutcome::Valid);

    let file = finish_record(new_record_header(false), &[build_filename_attr(5, "b.txt"), build_resident_data_attr(123)]);
    assert_eq!(parse_into(&parser, &index, 42, file), ParseOutcome::Valid);

    let matcher = Matcher::compile(PatternKind::Verbatim, "C:\\b.txt", false).unwrap();
    let cancelled = AtomicBool::new(false);
    let mut hits = Vec::new();
    index.matches(&matcher, false, TraversalConfig::default(), &cancelled, &mut |text, _ascii, key, _depth| {
        hits.push((text.to_string(), key));
        1
    })?;

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, "C:\\b.txt");
    assert_eq!(hits[0].1.frs(), 42);
    assert_eq!(index.get_sizes(hits[0].1).length, 123);
    Ok(())
}

#[test]
fn globstar_search_matches_nested_file_and_excludes_sibling_subtree() -> Result<()> {
    let volume = test_volume();
    let parser = RecordParser::new(ParserConfig::default(), Arc::clone(&volume));
    let index = Index::new("C:");

    index.at(5)?;
    let root = finish_record(new_record_header(true), &[build_filename_attr(5, "C:")]);
    parse_into(&parser, &index, 5, root);

    let foo = finish_record(new_record_header(true), &[build_filename_attr(5, "foo")]);
    parse_into(&parser, &index, 10, foo);

    let bar = finish_record(new_record_header(true), &[build_filename_attr(10, "bar")]);
    parse_into(&parser, &index, 11, bar);

    let baz = finish_record(new_record_header(false), &[build_filename_attr(11, "baz.log"), build_resident_data_attr(7)]);
    parse_into(&parser, &index, 12, baz);

    let other = finish_record(new_record_header(true), &[build_filename_attr(5, "other")]);
    parse_into(&parser, &index, 20, other);

    let x_log = finish_record(new_record_header(false), &[build_filename_attr(20, "x.log"), build_resident_data_attr(3)]);
    parse_into(&parser, &index, 21, x_log);

    let matcher = Matcher::compile(PatternKind::Glob, "C:\\foo\\*\\*.log", false).unwrap();
    let cancelled = AtomicBool::new(false);
    let mut hits = Vec::new();
    index.matches(&matcher, false, TraversalConfig::default(), &cancelled, &mut |text, _ascii, _key, _depth| {
        hits.push(text.to_string());
        1
    })?;

    assert_eq!(hits, vec!["C:\\foo\\bar\\baz.log".to_string()]);
    Ok(())
}

#[test]
fn hardlink_sizes_split_evenly_across_both_names() -> Result<()> {
    let volume = test_volume();
    let parser = RecordParser::new(ParserConfig::default(), Arc::clone(&volume));
    let index = Index::new("C:");

    index.at(5)?;
    let root = finish_record(new_record_header(true), &[build_filename_attr(5, "C:")]);
    parse_into(&parser, &index, 5, root);

    // Two $FILE_NAME attributes under the same parent model two hardlinked
    // directory entries for one base record.
    let file = finish_record(
        new_record_header(false),
        &[
            build_filename_attr(5, "link1.txt"),
            build_filename_attr(5, "link2.txt"),
            build_non_resident_data_attr(None, 100, 4096),
        ],
    );
    assert_eq!(parse_into(&parser, &index, 50, file), ParseOutcome::Valid);
    assert_eq!(index.name_count(index.find(50).unwrap()), 2);

    // Insertion index 0 is the first-pushed name ("link1.txt"), displaced
    // out of first_name's slot by the second push; FIRST_NAME always reads
    // back the most recently pushed one ("link2.txt").
    let oldest = ntfs_mft_search::index::Key::new(50, 0, DEFAULT_STREAM);
    let newest = ntfs_mft_search::index::Key::new(50, FIRST_NAME, DEFAULT_STREAM);

    let oldest_sizes = index.get_sizes(oldest);
    let newest_sizes = index.get_sizes(newest);

    assert_eq!(oldest_sizes.length + newest_sizes.length, 100);
    assert_eq!(oldest_sizes.allocated + newest_sizes.allocated, 4096);
    assert_eq!(oldest_sizes.length, 50);
    assert_eq!(newest_sizes.length, 50);
    assert_eq!(oldest_sizes.allocated, 2048);
    assert_eq!(newest_sizes.allocated, 2048);
    Ok(())
}

#[test]
fn wof_stream_allocation_folds_into_default_stream() -> Result<()> {
    let volume = test_volume();
    let parser = RecordParser::new(ParserConfig::default(), Arc::clone(&volume));
    let index = Index::new("C:");

    index.at(5)?;
    let root = finish_record(new_record_header(true), &[build_filename_attr(5, "C:")]);
    parse_into(&parser, &index, 5, root);
    index.with_record_mut(index.find(5).unwrap(), |r| r.stdinfo.set_flag(stdinfo_flags::DIRECTORY, true));

    let file = finish_record(
        new_record_header(false),
        &[
            build_filename_attr(5, "compressed.bin"),
            build_non_resident_data_attr(None, 1000, 0),
            build_non_resident_data_attr(Some("WofCompressedData"), 1000, 300),
        ],
    );
    assert_eq!(parse_into(&parser, &index, 60, file), ParseOutcome::Valid);

    let file_idx = index.find(60).unwrap();
    assert_eq!(index.stream_count(file_idx), 2);

    ntfs_mft_search::postprocess::run(&index, ntfs_mft_search::IndexConfig::default(), Arc::clone(&volume));

    // Streams chain LIFO, same as names: the named WOF stream was pushed
    // second, so it displaced the default stream out of slot 0. Stream 0 is
    // the WOF stream; stream 1 is the unnamed default. The fold adds the WOF
    // stream's allocation onto the default stream's and zeroes the WOF
    // stream out.
    let wof_sizes = index.with_stream(file_idx, 0, |s| s.size);
    let default_sizes = index.with_stream(file_idx, 1, |s| s.size);

    assert_eq!(default_sizes.length, 1000);
    assert_eq!(default_sizes.allocated, 300);
    assert_eq!(wof_sizes.length, 0);
    assert_eq!(wof_sizes.allocated, 0);
    Ok(())
}

#[test]
fn cancelling_mid_walk_stops_further_siblings_from_being_visited() {
    let index = Index::new("C:");
    let root = index.at(5).unwrap();
    let root_name = index.push_name("C:");
    index.push_name_link(root, 5, root_name);
    index.with_record_mut(root, |r| r.stdinfo.set_flag(stdinfo_flags::DIRECTORY, true));

    let file1 = index.at(10).unwrap();
    let file1_name = index.push_name("a.txt");
    let file1_insertion = index.push_name_link(file1, 5, file1_name);
    index.push_child(root, 10, file1_insertion);

    let file2 = index.at(11).unwrap();
    let file2_name = index.push_name("b.txt");
    let file2_insertion = index.push_name_link(file2, 5, file2_name);
    index.push_child(root, 11, file2_insertion);

    let matcher = Matcher::compile(PatternKind::Anything, "", false).unwrap();
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancelled_in_callback = Arc::clone(&cancelled);

    let mut hits = Vec::new();
    let result = index.matches(&matcher, true, TraversalConfig::default(), &cancelled, &mut |text, _ascii, _key, _depth| {
        hits.push(text.to_string());
        cancelled_in_callback.store(true, Ordering::Release);
        1
    });

    assert!(matches!(result, Err(NtfsIndexError::Cancelled)));
    assert_eq!(hits, vec!["a.txt".to_string()]);
}
