//! Windows API bindings for NTFS volume access.
//!
//! Safe wrappers around the Win32 calls the volume reader needs: opening a
//! volume handle, issuing IOCTLs for geometry/retrieval-pointers/file-record
//! fetches, and reading raw bytes at an offset. None of these wrappers
//! interpret or mutate NTFS bytes — see `ntfs::structs` for that.

use crate::error::{NtfsIndexError, Result};
use crate::ntfs::structs::*;
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::ptr;

// ============================================================================
// IOCTL Control Codes
// ============================================================================

pub const FSCTL_GET_NTFS_VOLUME_DATA: u32 = 0x00090064;
pub const FSCTL_GET_NTFS_FILE_RECORD: u32 = 0x00090068;
pub const FSCTL_GET_RETRIEVAL_POINTERS: u32 = 0x00090073;

pub const GENERIC_READ: u32 = 0x80000000;
pub const FILE_SHARE_READ: u32 = 0x00000001;
pub const FILE_SHARE_WRITE: u32 = 0x00000002;
pub const FILE_FLAG_NO_BUFFERING: u32 = 0x20000000;

pub const INVALID_HANDLE_VALUE: isize = -1;

// ============================================================================
// Safe Handle Wrapper
// ============================================================================

/// RAII wrapper for a Windows `HANDLE`.
pub struct SafeHandle {
    handle: isize,
}

impl SafeHandle {
    pub fn new(handle: isize) -> Option<Self> {
        if handle == INVALID_HANDLE_VALUE || handle == 0 {
            None
        } else {
            Some(Self { handle })
        }
    }

    pub fn as_raw(&self) -> isize {
        self.handle
    }

    pub fn is_valid(&self) -> bool {
        self.handle != INVALID_HANDLE_VALUE && self.handle != 0
    }
}

// SAFETY: the handle is only ever used for reads and IOCTLs issued through
// this module's functions, all of which take `&SafeHandle`; Win32 permits
// concurrent reads against one handle from multiple threads.
unsafe impl Send for SafeHandle {}
unsafe impl Sync for SafeHandle {}

impl Drop for SafeHandle {
    fn drop(&mut self) {
        if self.is_valid() {
            unsafe {
                let _ = windows::Win32::Foundation::CloseHandle(windows::Win32::Foundation::HANDLE(
                    self.handle as *mut std::ffi::c_void,
                ));
            }
        }
    }
}

// ============================================================================
// Volume Operations
// ============================================================================

/// Open `\\.\<drive>:` for unbuffered, synchronous read access.
pub fn open_volume(drive_letter: char) -> Result<SafeHandle> {
    let path = format!("\\\\.\\{}:", drive_letter);
    open_volume_path(&path)
}

pub fn open_volume_path(path: &str) -> Result<SafeHandle> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_MODE};
    use windows::core::PCWSTR;

    let wide_path: Vec<u16> = OsStr::new(path).encode_wide().chain(std::iter::once(0)).collect();

    let handle = unsafe {
        CreateFileW(
            PCWSTR::from_raw(wide_path.as_ptr()),
            GENERIC_READ,
            FILE_SHARE_MODE(FILE_SHARE_READ | FILE_SHARE_WRITE),
            None,
            windows::Win32::Storage::FileSystem::OPEN_EXISTING,
            FILE_FLAGS_AND_ATTRIBUTES(FILE_FLAG_NO_BUFFERING),
            HANDLE::default(),
        )
    };

    match handle {
        Ok(h) => SafeHandle::new(h.0 as isize)
            .ok_or_else(|| NtfsIndexError::VolumeInaccessible(path.to_string(), std::io::Error::last_os_error())),
        Err(e) => Err(NtfsIndexError::VolumeInaccessible(
            path.to_string(),
            std::io::Error::from_raw_os_error(e.code().0),
        )),
    }
}

// ============================================================================
// IOCTL Operations
// ============================================================================

pub fn device_io_control(
    handle: &SafeHandle,
    control_code: u32,
    in_buffer: Option<&[u8]>,
    out_buffer: &mut [u8],
) -> Result<u32> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::IO::DeviceIoControl;

    let mut bytes_returned: u32 = 0;

    let (in_ptr, in_size) = match in_buffer {
        Some(buf) => (buf.as_ptr() as *const std::ffi::c_void, buf.len() as u32),
        None => (ptr::null(), 0),
    };

    let result = unsafe {
        DeviceIoControl(
            HANDLE(handle.as_raw() as *mut std::ffi::c_void),
            control_code,
            Some(in_ptr),
            in_size,
            Some(out_buffer.as_mut_ptr() as *mut std::ffi::c_void),
            out_buffer.len() as u32,
            Some(&mut bytes_returned),
            None,
        )
    };

    if result.is_ok() {
        Ok(bytes_returned)
    } else {
        let error = std::io::Error::last_os_error();
        Err(NtfsIndexError::WindowsError(format!(
            "DeviceIoControl(0x{control_code:08X}) failed: {error}"
        )))
    }
}

/// Query `FSCTL_GET_NTFS_VOLUME_DATA` — cluster/FRS geometry and MFT zone.
pub fn get_ntfs_volume_data(handle: &SafeHandle) -> Result<NtfsVolumeData> {
    let mut buffer = [0u8; 0x60];
    device_io_control(handle, FSCTL_GET_NTFS_VOLUME_DATA, None, &mut buffer)?;

    NtfsVolumeData::from_bytes(&buffer)
        .ok_or_else(|| NtfsIndexError::VolumeUnrecognised("failed to parse NTFS volume data".to_string()))
}

/// Fetch a single MFT record by FRS number via `FSCTL_GET_NTFS_FILE_RECORD`.
/// Used by the path builder to resolve a parent that the index has not
/// loaded yet (on-demand, outside the bulk parse pipeline).
pub fn get_ntfs_file_record(handle: &SafeHandle, record_number: u64, bytes_per_record: u32) -> Result<Vec<u8>> {
    let input = record_number.to_le_bytes();
    let buffer_size = 12 + bytes_per_record as usize;
    let mut buffer = vec![0u8; buffer_size];

    let bytes_returned = device_io_control(handle, FSCTL_GET_NTFS_FILE_RECORD, Some(&input), &mut buffer)?;

    if bytes_returned < 12 {
        return Err(NtfsIndexError::IoFailed(0));
    }

    let returned_frn = u64::from_le_bytes(buffer[0..8].try_into().unwrap());
    let returned_record = returned_frn & 0x0000_FFFF_FFFF_FFFF;
    if returned_record != record_number {
        return Err(NtfsIndexError::OrphanedRecord(record_number, returned_record));
    }

    let record_length = u32::from_le_bytes(buffer[8..12].try_into().unwrap()) as usize;
    if record_length == 0 || 12 + record_length > buffer.len() {
        return Err(NtfsIndexError::DataRunError(format!(
            "invalid record length {record_length} for record {record_number}"
        )));
    }

    Ok(buffer[12..12 + record_length].to_vec())
}

/// Read raw bytes from the volume at `offset`. The scheduler's worker
/// threads call this synchronously per task; concurrency comes from
/// multiple workers dispatching in parallel (see `io_engine`), not from a
/// true Windows completion port — an acceptable, idiomatic substitution for
/// the overlapped-I/O model the source uses.
pub fn read_volume_at(handle: &SafeHandle, offset: u64, buffer: &mut [u8]) -> Result<usize> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{ReadFile, SetFilePointerEx};

    let mut new_pos: i64 = 0;
    let seek_result = unsafe {
        SetFilePointerEx(
            HANDLE(handle.as_raw() as *mut std::ffi::c_void),
            offset as i64,
            Some(&mut new_pos),
            windows::Win32::Storage::FileSystem::FILE_BEGIN,
        )
    };
    if seek_result.is_err() {
        return Err(NtfsIndexError::IoFailed(windows::Win32::Foundation::GetLastError().0));
    }

    let mut bytes_read: u32 = 0;
    let read_result =
        unsafe { ReadFile(HANDLE(handle.as_raw() as *mut std::ffi::c_void), Some(buffer), Some(&mut bytes_read), None) };

    if read_result.is_ok() {
        Ok(bytes_read as usize)
    } else {
        Err(NtfsIndexError::IoFailed(windows::Win32::Foundation::GetLastError().0))
    }
}

// ============================================================================
// Retrieval Pointers (MFT extent map)
// ============================================================================

#[derive(Debug, Clone)]
pub struct Extent {
    pub vcn: u64,
    pub lcn: u64,
    pub cluster_count: u64,
}

/// Walk `FSCTL_GET_RETRIEVAL_POINTERS` to get the `(vcn, lcn, cluster_count)`
/// runs of a stream, starting from `start_vcn`. Callers loop this, feeding
/// the last returned `vcn + cluster_count` back in as `start_vcn`, until the
/// IOCTL reports no further extents.
pub fn get_retrieval_pointers(handle: &SafeHandle, start_vcn: u64) -> Result<Vec<Extent>> {
    let mut buffer = vec![0u8; 64 * 1024];
    let input = start_vcn.to_le_bytes();

    let bytes_returned = device_io_control(handle, FSCTL_GET_RETRIEVAL_POINTERS, Some(&input), &mut buffer)?;

    if bytes_returned < 16 {
        return Ok(Vec::new());
    }

    let extent_count = u32::from_le_bytes(buffer[0..4].try_into().unwrap()) as usize;
    let _starting_vcn = u64::from_le_bytes(buffer[8..16].try_into().unwrap());

    let mut extents = Vec::with_capacity(extent_count);
    let mut pos = 16;
    let mut prev_vcn = start_vcn;

    for _ in 0..extent_count {
        if pos + 16 > bytes_returned as usize {
            break;
        }

        let next_vcn = u64::from_le_bytes(buffer[pos..pos + 8].try_into().unwrap());
        let lcn = u64::from_le_bytes(buffer[pos + 8..pos + 16].try_into().unwrap());

        // LCN u64::MAX marks a sparse run (no physical backing); skip it
        // along with zero-length runs per §4.1.
        if next_vcn > prev_vcn && lcn != u64::MAX {
            extents.push(Extent {
                vcn: prev_vcn,
                lcn,
                cluster_count: next_vcn - prev_vcn,
            });
        }

        prev_vcn = next_vcn;
        pos += 16;
    }

    Ok(extents)
}
