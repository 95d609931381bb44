//! NTFS on-disk format support: bit-exact structure parsing (File Record
//! Segment headers, attribute headers, mapping pairs) and the raw Win32
//! volume-access primitives the rest of the crate is built on.

pub mod structs;
pub mod winapi;

pub use structs::{
    file_attributes, filetime_to_datetime, filetime_to_unix, AttributeHeader, AttributeType, DataRun,
    FileNameAttribute, FilenameNamespace, MftRecordHeader, NonResidentAttributeHeader, NtfsVolumeData,
    ResidentAttributeHeader, StandardInformation,
};
pub use winapi::{
    get_ntfs_volume_data, get_retrieval_pointers, open_volume, open_volume_path, read_volume_at, Extent,
    SafeHandle,
};
