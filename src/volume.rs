//! Volume descriptor and extent enumerator (§4.1).
//!
//! Opens a raw `\\.\<root>` handle, queries its NTFS geometry, and resolves
//! the on-disk runs of `$MFT::$DATA` and `$MFT::$BITMAP` so the scheduler
//! can read the MFT as a stream of physical blocks without ever going
//! through the filesystem API.

use crate::error::{NtfsIndexError, Result};
use crate::ntfs::structs::{DataRun, NtfsVolumeData};
use crate::ntfs::winapi::{self, Extent, SafeHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Which stream of `$MFT` an extent run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MftStream {
    Data,
    Bitmap,
}

/// One physical run: a virtual offset into the stream, its physical offset
/// on the volume, and a length — always a whole number of clusters, split
/// at `block_size_max` boundaries before the scheduler sees it.
#[derive(Debug, Clone, Copy)]
pub struct Run {
    pub virtual_offset: u64,
    pub physical_offset: u64,
    pub length: u64,
    /// Clusters proved free by the bitmap pass, trimmed from the head.
    pub skip_begin: u64,
    /// Clusters proved free by the bitmap pass, trimmed from the tail.
    pub skip_end: u64,
}

pub struct VolumeDescriptor {
    handle: Arc<SafeHandle>,
    root_path: String,
    geometry: NtfsVolumeData,
    /// Counts down as non-resident runs are discovered to overlap the MFT
    /// zone; starts at the zone's byte size (§3, §4.4).
    pub(crate) reserved_clusters: AtomicU64,
}

impl VolumeDescriptor {
    /// Open `\\.\<root>:` for unbuffered, synchronous read access and query
    /// its geometry. `root_path` is a drive letter (`'C'`) or a full
    /// `\\.\X:`-style path.
    pub fn open(root_path: &str) -> Result<Self> {
        let handle = if root_path.len() == 1 {
            winapi::open_volume(root_path.chars().next().unwrap())?
        } else {
            winapi::open_volume_path(root_path)?
        };

        let geometry = winapi::get_ntfs_volume_data(&handle)?;

        if geometry.bytes_per_file_record_segment > geometry.bytes_per_cluster {
            return Err(NtfsIndexError::VolumeUnrecognised(format!(
                "{root_path}: FRS size {} exceeds cluster size {}, which the reader cannot grant at least one FRS per read granularity",
                geometry.bytes_per_file_record_segment, geometry.bytes_per_cluster
            )));
        }

        let zone_bytes = geometry
            .mft_zone_end
            .saturating_sub(geometry.mft_zone_start)
            * geometry.bytes_per_cluster as u64;

        Ok(Self {
            handle: Arc::new(handle),
            root_path: root_path.to_string(),
            geometry,
            reserved_clusters: AtomicU64::new(zone_bytes),
        })
    }

    /// Build a descriptor around a caller-supplied geometry with no real
    /// volume handle behind it, for parser/scheduler tests that synthesize
    /// FRS buffers directly and never issue an actual read through `self`.
    ///
    /// Public (rather than `#[cfg(test)]`) so the integration tests under
    /// `tests/`, which compile against the crate as an ordinary dependency,
    /// can build fixtures the same way the in-crate unit tests do.
    #[doc(hidden)]
    pub fn for_test(geometry: NtfsVolumeData) -> Self {
        // Not a real handle: valid per `SafeHandle::new`'s is-zero/-1 check,
        // but any attempt to actually read or IOCTL through it will fail at
        // the Win32 call, not panic here.
        let handle = winapi::SafeHandle::new(0xDEAD_BEEFusize as isize).expect("sentinel handle value");
        let zone_bytes = geometry.mft_zone_end.saturating_sub(geometry.mft_zone_start) * geometry.bytes_per_cluster as u64;
        Self { handle: Arc::new(handle), root_path: "T".to_string(), geometry, reserved_clusters: AtomicU64::new(zone_bytes) }
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn geometry(&self) -> &NtfsVolumeData {
        &self.geometry
    }

    pub fn handle(&self) -> &SafeHandle {
        &self.handle
    }

    /// A shared handle to the same open volume, for engines/workers that
    /// need ownership rather than a borrow.
    pub fn handle_arc(&self) -> Arc<SafeHandle> {
        Arc::clone(&self.handle)
    }

    pub fn reserved_clusters(&self) -> u64 {
        self.reserved_clusters.load(Ordering::Acquire)
    }

    /// Subtract `bytes` from the reserved-cluster counter for a non-resident
    /// run that intersected `[mft_zone_start, mft_zone_end)`. Saturating:
    /// the counter only ever tracks how much of the zone is still unclaimed.
    pub fn account_zone_overlap(&self, bytes: u64) {
        self.reserved_clusters.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(bytes))).ok();
    }

    /// Resolve the runs of one `$MFT` stream, split at `block_size_max`
    /// boundaries (1 MiB worth of clusters, floored to whole FRSs).
    ///
    /// Zone-overlap accounting is *not* done here even though these runs can
    /// themselves land inside the MFT zone: `$MFT`'s own FRS (record 0, plus
    /// any extension records holding continuation runs) is parsed like any
    /// other record during the normal scan, and the parser's non-resident-run
    /// walk (§4.4) already subtracts that overlap once. Doing it again here
    /// from the raw extent map would double-count the same bytes.
    pub fn enumerate_extents(&self, stream: MftStream, block_size_max_bytes: usize) -> Result<Vec<Run>> {
        let extents = self.load_mft_extents(stream)?;
        Ok(split_into_blocks(&self.geometry, &extents, block_size_max_bytes))
    }

    fn load_mft_extents(&self, stream: MftStream) -> Result<Vec<Extent>> {
        // Prefer asking the filesystem for the retrieval pointers of the
        // named stream directly — this is how the source resolves
        // `$MFT::$DATA` and is the only path that also reaches `$BITMAP`,
        // which record zero's own attribute list does not carry resident.
        let path = match stream {
            MftStream::Data => format!("{}\\$MFT", self.root_path_for_paths()),
            MftStream::Bitmap => format!("{}\\$MFT:$BITMAP", self.root_path_for_paths()),
        };

        if let Ok(handle) = winapi::open_volume_path(&path) {
            if let Ok(extents) = self.walk_retrieval_pointers(&handle) {
                if !extents.is_empty() {
                    return Ok(extents);
                }
            }
        }

        if stream == MftStream::Data {
            return self.load_data_extents_from_record_zero();
        }

        // No `$BITMAP` path and no record-zero fallback (the attribute
        // rarely stays resident) — treat as "nothing known to be free",
        // i.e. the scheduler will read every FRS slot.
        Ok(Vec::new())
    }

    fn root_path_for_paths(&self) -> String {
        if self.root_path.len() == 1 {
            format!("\\\\.\\{}:", self.root_path)
        } else {
            self.root_path.clone()
        }
    }

    fn walk_retrieval_pointers(&self, handle: &SafeHandle) -> Result<Vec<Extent>> {
        let mut all = Vec::new();
        let mut start_vcn = 0u64;
        loop {
            let batch = winapi::get_retrieval_pointers(handle, start_vcn)?;
            if batch.is_empty() {
                break;
            }
            let last = batch.last().unwrap();
            start_vcn = last.vcn + last.cluster_count;
            all.extend(batch);
        }
        Ok(all)
    }

    /// Fallback used when `$MFT` cannot be opened as a named path (e.g. a
    /// locked-down volume): parse record 0's own `$DATA` attribute runs.
    fn load_data_extents_from_record_zero(&self) -> Result<Vec<Extent>> {
        let record_size = self.geometry.bytes_per_file_record_segment;
        let offset = self.geometry.mft_byte_offset();
        let mut buffer = vec![0u8; record_size as usize];
        winapi::read_volume_at(&self.handle, offset, &mut buffer)?;

        let header = crate::ntfs::structs::MftRecordHeader::from_bytes(&buffer)
            .ok_or_else(|| NtfsIndexError::Corrupt(0))?;
        if !header.is_valid() {
            return Err(NtfsIndexError::Corrupt(0));
        }

        let mut attr_offset = header.first_attribute_offset as usize;
        while attr_offset + 16 <= buffer.len() {
            let attr_header = match crate::ntfs::structs::AttributeHeader::from_bytes(&buffer[attr_offset..]) {
                Some(h) => h,
                None => break,
            };
            if attr_header.attribute_type == crate::ntfs::structs::ATTRIBUTE_END_MARKER || attr_header.length == 0 {
                break;
            }
            if attr_offset + attr_header.length as usize > buffer.len() {
                break;
            }

            if attr_header.attribute_type == 0x80 && attr_header.non_resident && attr_header.name_length == 0 {
                let attr_data = &buffer[attr_offset..attr_offset + attr_header.length as usize];
                if let Some(nr) = crate::ntfs::structs::NonResidentAttributeHeader::from_bytes(attr_data) {
                    let runs_offset = nr.data_runs_offset as usize;
                    if runs_offset < attr_data.len() {
                        let (runs, _) = DataRun::decode_runs(&attr_data[runs_offset..]);
                        return Ok(self.data_runs_to_extents(&runs));
                    }
                }
            }

            attr_offset += attr_header.length as usize;
        }

        Err(NtfsIndexError::DataRunError("record 0 has no non-resident $DATA attribute".into()))
    }

    fn data_runs_to_extents(&self, runs: &[DataRun]) -> Vec<Extent> {
        let mut extents = Vec::with_capacity(runs.len());
        let mut vcn = 0u64;
        for run in runs {
            // Zero-length runs are skipped per §4.1; sparse runs carry no
            // physical backing and are skipped too (nothing to schedule).
            if run.cluster_count > 0 && !run.is_sparse {
                extents.push(Extent { vcn, lcn: run.lcn_offset as u64, cluster_count: run.cluster_count });
            }
            vcn += run.cluster_count;
        }
        extents
    }

}

fn split_into_blocks(geometry: &NtfsVolumeData, extents: &[Extent], block_size_max_bytes: usize) -> Vec<Run> {
    let cluster_size = geometry.bytes_per_cluster as u64;
    let max_clusters = (block_size_max_bytes as u64 / cluster_size).max(1);

    let mut runs = Vec::new();
    for extent in extents {
        if extent.cluster_count == 0 {
            continue;
        }
        let mut remaining = extent.cluster_count;
        let mut vcn = extent.vcn;
        let mut lcn = extent.lcn;
        while remaining > 0 {
            let chunk = remaining.min(max_clusters);
            let virtual_offset = vcn * cluster_size;
            let physical_offset = lcn * cluster_size;
            let length = chunk * cluster_size;

            runs.push(Run { virtual_offset, physical_offset, length, skip_begin: 0, skip_end: 0 });
            vcn += chunk;
            lcn += chunk;
            remaining -= chunk;
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(zone_start: u64, zone_end: u64) -> NtfsVolumeData {
        NtfsVolumeData {
            bytes_per_cluster: 4096,
            bytes_per_file_record_segment: 1024,
            mft_zone_start: zone_start,
            mft_zone_end: zone_end,
            ..Default::default()
        }
    }

    #[test]
    fn split_into_blocks_floors_to_whole_frs_and_respects_max() {
        let geometry = geometry(0, 0);
        let extents = vec![Extent { vcn: 0, lcn: 100, cluster_count: 1000 }];
        let runs = split_into_blocks(&geometry, &extents, 1024 * 1024);
        // max_clusters = 1 MiB / 4096 = 256
        assert_eq!(runs.len(), 4);
        assert_eq!(runs[0].length, 256 * 4096);
        assert_eq!(runs[3].length, (1000 - 3 * 256) * 4096);
    }

    #[test]
    fn account_zone_overlap_saturates_at_zero() {
        let geometry = geometry(100, 200);
        let volume = VolumeDescriptor::for_test(geometry);
        assert_eq!(volume.reserved_clusters(), 100 * 4096);
        volume.account_zone_overlap(50 * 4096);
        assert_eq!(volume.reserved_clusters(), 50 * 4096);
        volume.account_zone_overlap(1_000_000);
        assert_eq!(volume.reserved_clusters(), 0);
    }
}
