//! Traversal / match driver (§4.8): walks the index from FRS 5, testing
//! every visited entity against a compiled pattern and invoking the
//! caller's callback with `(name_or_path, ascii, key, depth)`.
//!
//! Grounded on the teacher's `file_tree.rs` `build_path`/`search`: parent-
//! link path reconstruction and a flat scan-and-test loop. Per-stream
//! iteration, the FRS 6→5 substitution, include-attributes gating and
//! high-water-mark-based ancestor pruning have no teacher precedent and are
//! built directly from §4.8.
//!
//! The callback contract mirrors §6's `Index::matches`: a return `> 0`
//! keeps recursing past the current node, `<= 0` stops descent into its
//! children (siblings are unaffected). This driver additionally prunes a
//! subtree *before* calling the callback at all, whenever the pattern's
//! compiled literal prefix proves no path under the current directory could
//! match (§8 scenario 2) — that decision is ours to make, not the
//! callback's, since it never sees the pruned subtree.

use crate::config::TraversalConfig;
use crate::error::{NtfsIndexError, Result};
use crate::index::{stream_type, stream_type_name, Index, Key, DEFAULT_STREAM, FIRST_NAME, NONE_INDEX};
use crate::pattern::{HighWaterMark, Matcher};
use std::sync::atomic::{AtomicBool, Ordering};

/// `(name_or_path, ascii, key, depth) -> i32`. Positive recurses, `<= 0`
/// stops descent into this node's children.
pub type Callback<'a> = dyn FnMut(&str, bool, Key, usize) -> i32 + 'a;

struct Emitted {
    text: String,
    ascii: bool,
    key: Key,
    depth: usize,
}

/// Walk the tree rooted at FRS 5, calling `callback` for every stream of
/// every matching entity. `name_only` selects the zero-copy leaf-name mode
/// over path-buffered matching (the caller decides this from the pattern's
/// shape — presence of `\`, `:` or `**`).
pub fn run(
    index: &Index,
    matcher: &Matcher,
    name_only: bool,
    config: TraversalConfig,
    cancelled: &AtomicBool,
    callback: &mut Callback,
) -> Result<()> {
    let Some(root_idx) = index.find(5) else { return Ok(()) };

    if config.reverse_depth_order {
        let mut emitted = Vec::new();
        {
            let mut sink = |text: &str, ascii: bool, key: Key, depth: usize| -> i32 {
                emitted.push(Emitted { text: text.to_string(), ascii, key, depth });
                1
            };
            let mut ancestors = vec![5u32];
            visit(index, root_idx, 5, "", None, 0, matcher, name_only, config, cancelled, &mut ancestors, false, &mut sink)?;
        }
        // Deepest first; insertion order is preserved among equal depths
        // because `sort_by` is stable.
        emitted.sort_by(|a, b| b.depth.cmp(&a.depth));
        for e in &emitted {
            callback(&e.text, e.ascii, e.key, e.depth);
        }
    } else {
        let mut ancestors = vec![5u32];
        visit(index, root_idx, 5, "", None, 0, matcher, name_only, config, cancelled, &mut ancestors, false, callback)?;
    }

    if config.expose_frs6_as_root {
        if let Some(frs6_idx) = index.find(6) {
            let mut ancestors = vec![6u32];
            visit(index, frs6_idx, 6, "", None, 0, matcher, name_only, config, cancelled, &mut ancestors, false, callback)?;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn visit(
    index: &Index,
    record_idx: u32,
    frs: u32,
    path_so_far: &str,
    current_name_index: Option<u16>,
    depth: usize,
    matcher: &Matcher,
    name_only: bool,
    config: TraversalConfig,
    cancelled: &AtomicBool,
    ancestors: &mut Vec<u32>,
    suppress_recursion: bool,
    callback: &mut Callback,
) -> Result<()> {
    if cancelled.load(Ordering::Acquire) {
        return Err(NtfsIndexError::Cancelled);
    }

    let (leaf_name, leaf_ascii) = match current_name_index {
        None => index.with_record(record_idx, |r| (index.read_name(r.first_name.name), r.first_name.name.ascii())),
        Some(insertion_idx) => {
            let link = index.name_link_by_insertion(record_idx, insertion_idx);
            (index.read_name(link.name), link.name.ascii())
        }
    };

    let path = if path_so_far.is_empty() {
        leaf_name.clone()
    } else {
        format!("{path_so_far}\\{leaf_name}")
    };

    let is_directory = index.with_record(record_idx, |r| r.stdinfo.is_directory());
    let default_type = if is_directory { stream_type::DIRECTORY } else { stream_type::DATA };
    let stream_count = index.stream_count(record_idx).max(1);
    let name_index_field = current_name_index.unwrap_or(FIRST_NAME);

    // Recursion is a per-record decision, but the callback fires once per
    // matching stream: if any one of them says "positive", the directory is
    // still worth descending into, even if a sibling stream of the same
    // record said otherwise. Only vetoed by *every* invoked stream's
    // callback; a record none of whose streams matched the pattern (no
    // callback fired at all) still recurses, unchanged from before there
    // was more than one stream to consider.
    let mut should_recurse = true;
    let mut any_callback_invoked = false;

    for stream_idx in 0..stream_count {
        let (type_name_id, name_info, merged) =
            index.with_stream(record_idx, stream_idx, |s| (s.type_name_id, s.name, s.merged_into_default));

        if merged {
            // Folded into the default stream by post-processing (§4.6 step
            // 5); not separately observable.
            continue;
        }

        let is_default = type_name_id == default_type && name_info.length == 0;
        if !is_default && !config.include_attributes {
            continue;
        }
        if depth == 0 && is_default && type_name_id == stream_type::DIRECTORY {
            // Suppress the root's own directory-stream name (§4.8 step 1).
            continue;
        }

        let candidate: &str = if name_only { leaf_name.as_str() } else { path.as_str() };

        let mut hwm = HighWaterMark::default();
        if !matcher.is_match(candidate, Some(&mut hwm)) {
            continue;
        }

        let text = if is_default {
            candidate.to_string()
        } else {
            let stream_name = if name_info.length > 0 { index.read_name(name_info) } else { String::new() };
            format!("{candidate}:{stream_name}:{}", stream_type_name(type_name_id))
        };

        let stream_key_index = if is_default { DEFAULT_STREAM } else { stream_idx };
        let key = Key::new(frs, name_index_field, stream_key_index);

        let ret = callback(&text, leaf_ascii, key, depth);
        should_recurse = if any_callback_invoked { should_recurse || ret > 0 } else { ret > 0 };
        any_callback_invoked = true;
    }

    if suppress_recursion || !is_directory || !should_recurse {
        return Ok(());
    }

    if !name_only && !matcher.could_match_prefix(&path) {
        // No descendant path can extend `path` into a match; prune the
        // subtree without visiting a single child (§8 scenario 2).
        return Ok(());
    }

    let mut cursor = index.with_record(record_idx, |r| r.first_child);
    while cursor != NONE_INDEX {
        if cancelled.load(Ordering::Acquire) {
            return Err(NtfsIndexError::Cancelled);
        }

        let child = index.childinfo(cursor);
        cursor = child.next_entry;

        let mut child_frs = child.record_number;
        let mut force_leaf = false;
        if depth == 0 && child_frs == 6 {
            // Substitute the shell's virtual root (§4.8 step 2). Recursing
            // into FRS 5's own children again here would duplicate the
            // whole tree under this slot forever, so this one occurrence
            // is rendered as a leaf: its own streams are emitted under the
            // substitute name, but it does not recurse further.
            child_frs = 5;
            force_leaf = true;
        }

        if !force_leaf && ancestors.contains(&child_frs) {
            // Cycle guard: the root's own self-loop child entry (§8
            // boundary behaviour) and any other accidental cycle stop here.
            continue;
        }

        let Some(child_idx) = index.find(child_frs) else { continue };

        ancestors.push(child_frs);
        visit(
            index,
            child_idx,
            child_frs,
            &path,
            Some(child.name_index),
            depth + 1,
            matcher,
            name_only,
            config,
            cancelled,
            ancestors,
            force_leaf,
            callback,
        )?;
        ancestors.pop();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraversalConfig;
    use crate::index::{NameInfo, SizeInfo};
    use crate::pattern::PatternKind;
    use std::sync::atomic::AtomicBool;

    fn build_simple_tree() -> Index {
        let index = Index::new("C:");
        let root = index.at(5).unwrap();
        let root_name = index.push_name("C:");
        index.push_name_link(root, 5, root_name);
        index.with_record_mut(root, |r| r.stdinfo.set_flag(crate::index::stdinfo_flags::DIRECTORY, true));
        index.find_or_push_stream(root, crate::index::stream_type::DIRECTORY, NameInfo::default());

        let dir = index.at(10).unwrap();
        let dir_name = index.push_name("foo");
        let dir_insertion = index.push_name_link(dir, 5, dir_name);
        index.push_child(root, 10, dir_insertion);
        index.with_record_mut(dir, |r| r.stdinfo.set_flag(crate::index::stdinfo_flags::DIRECTORY, true));
        index.find_or_push_stream(dir, crate::index::stream_type::DIRECTORY, NameInfo::default());

        let file = index.at(11).unwrap();
        let file_name = index.push_name("bar.txt");
        let file_insertion = index.push_name_link(file, 10, file_name);
        index.push_child(dir, 11, file_insertion);
        index.find_or_push_stream(file, crate::index::stream_type::DATA, NameInfo::default());
        index.with_stream_mut(file, 0, |s| s.size = SizeInfo { length: 5, allocated: 4096, bulkiness: 0, treesize: 0 });

        index
    }

    #[test]
    fn path_buffered_search_finds_nested_file() {
        let index = build_simple_tree();
        let matcher = Matcher::compile(PatternKind::Verbatim, "C:\\foo\\bar.txt", false).unwrap();
        let cancelled = AtomicBool::new(false);

        let mut hits = Vec::new();
        run(&index, &matcher, false, TraversalConfig::default(), &cancelled, &mut |text, _ascii, key, depth| {
            hits.push((text.to_string(), key.frs(), depth));
            1
        })
        .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "C:\\foo\\bar.txt");
        assert_eq!(hits[0].1, 11);
        assert_eq!(hits[0].2, 2);
    }

    #[test]
    fn name_only_search_matches_leaf_name() {
        let index = build_simple_tree();
        let matcher = Matcher::compile(PatternKind::Verbatim, "bar.txt", false).unwrap();
        let cancelled = AtomicBool::new(false);

        let mut hits = Vec::new();
        run(&index, &matcher, true, TraversalConfig::default(), &cancelled, &mut |text, _ascii, _key, _depth| {
            hits.push(text.to_string());
            1
        })
        .unwrap();

        assert_eq!(hits, vec!["bar.txt".to_string()]);
    }

    #[test]
    fn prefix_pruning_skips_unrelated_subtree() {
        let index = build_simple_tree();
        let other_dir = index.at(20).unwrap();
        let other_name = index.push_name("other");
        let other_insertion = index.push_name_link(other_dir, 5, other_name);
        index.push_child(index.find(5).unwrap(), 20, other_insertion);
        index.with_record_mut(other_dir, |r| r.stdinfo.set_flag(crate::index::stdinfo_flags::DIRECTORY, true));
        index.find_or_push_stream(other_dir, crate::index::stream_type::DIRECTORY, NameInfo::default());

        let matcher = Matcher::compile(PatternKind::Glob, "C:\\foo\\*.txt", false).unwrap();
        let cancelled = AtomicBool::new(false);

        let mut visited_dirs = Vec::new();
        run(&index, &matcher, false, TraversalConfig::default(), &cancelled, &mut |text, _ascii, key, _depth| {
            visited_dirs.push((text.to_string(), key.frs()));
            1
        })
        .unwrap();

        assert!(visited_dirs.iter().any(|(t, _)| t == "C:\\foo\\bar.txt"));
        assert!(!visited_dirs.iter().any(|(_, frs)| *frs == 20));
    }
}
