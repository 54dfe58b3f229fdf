//! Shared file mappings with two distinct lifetimes.
//!
//! - [`ConfinedMapping`] borrows the file it maps and is unmapped when dropped,
//!   so it can never outlive the handle that created it.
//! - [`AutoMapping`] stays mapped until the process exits, independent of the
//!   file handle.
//!
//! Both accept arbitrary 64-bit offsets. The offset is aligned down to the
//! mapping granularity internally and the views start at the requested byte.

use std::fs::File;
use std::marker::PhantomData;
use std::os::fd::AsRawFd;
use std::ptr::null_mut;

use log::{debug, trace, warn};
use serde::Serialize;
use thiserror::Error;

use crate::block_size::DescriptorProbe;
use crate::util::system_page_size;

/// Access mode of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MapMode {
    /// `PROT_READ`
    ReadOnly,
    /// `PROT_READ | PROT_WRITE`, file must be opened for reading and writing
    ReadWrite,
}

impl MapMode {
    fn prot(self) -> libc::c_int {
        match self {
            MapMode::ReadOnly => libc::PROT_READ,
            MapMode::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// A byte range of a file to map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MappingRequest {
    /// File offset of the first mapped byte
    pub offset: u64,
    /// Number of bytes to map
    pub len: u64,
    /// Access mode
    pub mode: MapMode,
}

impl MappingRequest {
    /// Requests `[offset, offset + len)` with `mode`.
    pub fn new(offset: u64, len: u64, mode: MapMode) -> Self {
        MappingRequest { offset, len, mode }
    }

    /// Requests the whole of a file of `len` bytes.
    pub fn whole(len: u64, mode: MapMode) -> Self {
        Self::new(0, len, mode)
    }

    /// File offset one past the last requested byte.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.len)
    }
}

/// Errors that can occur while mapping a file.
#[derive(Debug, Error)]
pub enum MappingError {
    /// A system call failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The request is empty.
    #[error("Cannot map an empty range")]
    Empty,
    /// The request does not fit the address space or `off_t`.
    #[error("Range [{offset}, {offset} + {len}) does not fit the address space")]
    TooLarge {
        /// Requested offset
        offset: u64,
        /// Requested length
        len: u64,
    },
    /// A sub-view exceeds the mapping.
    #[error("Slice [{offset}, {offset} + {len}) out of bounds for a mapping of {mapped} bytes")]
    OutOfBounds {
        /// Requested view offset
        offset: u64,
        /// Requested view length
        len: usize,
        /// Length of the mapping
        mapped: usize,
    },
    /// A write view was requested from a read-only mapping.
    #[error("Mapping is read-only")]
    ReadOnly,
}

/// Result type for mapping operations.
pub type Result<T> = std::result::Result<T, MappingError>;

/// Offset alignment required by `mmap` for `file`.
///
/// hugetlbfs reports the huge page size as block size and refuses offsets
/// that are not aligned to it.
fn granularity(file: &File) -> usize {
    let page_size = system_page_size();
    match DescriptorProbe::of_file(file) {
        Ok(block_size) if block_size as usize > page_size
            && (block_size as usize).is_multiple_of(page_size) =>
        {
            block_size as usize
        }
        Ok(_) => page_size,
        Err(e) => {
            debug!("Block size unknown, aligning to page size: {}", e);
            page_size
        }
    }
}

/// Extends `file` so a writable mapping of `[.., end)` is backed by the file.
///
/// hugetlbfs only accepts huge page aligned truncation and instead grows the
/// file on `mmap`, so a failure here is not fatal.
fn ensure_len(file: &File, end: u64) -> Result<()> {
    let len = file.metadata()?.len();
    if len >= end {
        return Ok(());
    }
    if let Err(e) = file.set_len(end) {
        debug!(
            "Could not extend file from {} to {} bytes, leaving it to mmap: {}",
            len, end, e
        );
    }
    Ok(())
}

#[derive(Debug)]
struct RawMapping {
    base: *mut u8,
    map_len: usize,
    delta: usize,
    len: usize,
    mode: MapMode,
}

impl RawMapping {
    fn map(file: &File, request: MappingRequest) -> Result<Self> {
        if request.len == 0 {
            return Err(MappingError::Empty);
        }
        let too_large = || MappingError::TooLarge {
            offset: request.offset,
            len: request.len,
        };
        let end = request.end().ok_or_else(too_large)?;
        let granularity = granularity(file);
        let aligned = request.offset - request.offset % granularity as u64;
        let delta = (request.offset - aligned) as usize;
        let len = usize::try_from(request.len).map_err(|_| too_large())?;
        let map_len = delta
            .checked_add(len)
            .and_then(|l| l.checked_next_multiple_of(granularity))
            .ok_or_else(too_large)?;
        let file_offset = libc::off_t::try_from(aligned).map_err(|_| too_large())?;

        if request.mode == MapMode::ReadWrite {
            ensure_len(file, end)?;
        }

        trace!(
            "mmap [0x{:x}, 0x{:x}) aligned to 0x{:x} (granularity 0x{:x})",
            request.offset, end, aligned, granularity
        );
        let p = unsafe {
            libc::mmap(
                null_mut(),
                map_len,
                request.mode.prot(),
                libc::MAP_SHARED,
                file.as_raw_fd(),
                file_offset,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(RawMapping {
            base: p as *mut u8,
            map_len,
            delta,
            len,
            mode: request.mode,
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.add(self.delta), self.len) }
    }

    fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if self.mode != MapMode::ReadWrite {
            return Err(MappingError::ReadOnly);
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(self.delta), self.len) })
    }

    fn unmap(&mut self) -> std::io::Result<()> {
        if unsafe { libc::munmap(self.base as *mut libc::c_void, self.map_len) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Read access to a mapped byte range.
#[allow(clippy::len_without_is_empty)]
pub trait MappedView {
    /// The mapped bytes, starting at the requested file offset.
    fn as_slice(&self) -> &[u8];

    /// Number of mapped bytes.
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// A sub-view of `len` bytes starting `offset` bytes into the mapping.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::OutOfBounds`] if the range exceeds the mapping.
    fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let bytes = self.as_slice();
        let out_of_bounds = MappingError::OutOfBounds {
            offset,
            len,
            mapped: bytes.len(),
        };
        let Ok(start) = usize::try_from(offset) else {
            return Err(out_of_bounds);
        };
        match start.checked_add(len) {
            Some(end) if end <= bytes.len() => Ok(&bytes[start..end]),
            _ => Err(out_of_bounds),
        }
    }
}

/// A mapping owned by a single scope.
///
/// Borrows the file handle, so the handle cannot be closed or reused while the
/// mapping exists. Unmapped on drop.
#[derive(Debug)]
pub struct ConfinedMapping<'f> {
    raw: RawMapping,
    _file: PhantomData<&'f File>,
}

impl<'f> ConfinedMapping<'f> {
    /// Maps `request` of `file`.
    ///
    /// Read-write requests extend the file if it is shorter than the end of
    /// the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is empty, too large, or `mmap` fails.
    pub fn map(file: &'f File, request: MappingRequest) -> Result<Self> {
        Ok(ConfinedMapping {
            raw: RawMapping::map(file, request)?,
            _file: PhantomData,
        })
    }

    /// Mutable access to the mapped bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::ReadOnly`] for read-only mappings.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        self.raw.as_mut_slice()
    }
}

impl MappedView for ConfinedMapping<'_> {
    fn as_slice(&self) -> &[u8] {
        self.raw.as_slice()
    }
}

impl Drop for ConfinedMapping<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.raw.unmap() {
            warn!("munmap of {} bytes failed: {}", self.raw.map_len, e);
        }
    }
}

/// A mapping released by process teardown.
///
/// Does not borrow the file; closing the handle leaves the mapping intact.
#[derive(Debug)]
pub struct AutoMapping {
    raw: RawMapping,
}

impl AutoMapping {
    /// Maps `request` of `file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is empty, too large, or `mmap` fails.
    pub fn map(file: &File, request: MappingRequest) -> Result<Self> {
        Ok(AutoMapping {
            raw: RawMapping::map(file, request)?,
        })
    }
}

impl MappedView for AutoMapping {
    fn as_slice(&self) -> &[u8] {
        self.raw.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::PAGE_SIZE;
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::PathBuf;

    struct ScratchFile(PathBuf);

    impl ScratchFile {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "hugemap-mapping-{}-{}",
                name,
                std::process::id()
            ));
            let _ = std::fs::remove_file(&path);
            ScratchFile(path)
        }

        fn open(&self) -> std::io::Result<File> {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.0)
        }
    }

    impl Drop for ScratchFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_confined_write_at_unaligned_offset() -> anyhow::Result<()> {
        let scratch = ScratchFile::new("confined");
        let file = scratch.open()?;
        let offset = 3 * PAGE_SIZE as u64 + 100;
        {
            let mut mapping =
                ConfinedMapping::map(&file, MappingRequest::new(offset, 16, MapMode::ReadWrite))?;
            assert_eq!(mapping.len(), 16);
            mapping.as_mut_slice()?.copy_from_slice(b"0123456789abcdef");
        }
        assert_eq!(file.metadata()?.len(), offset + 16);

        let mut read_back = [0u8; 16];
        let mut reader = File::open(&scratch.0)?;
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(&mut read_back)?;
        assert_eq!(&read_back, b"0123456789abcdef");
        Ok(())
    }

    #[test]
    fn test_auto_mapping_outlives_file_handle() -> anyhow::Result<()> {
        let scratch = ScratchFile::new("auto");
        let mut file = scratch.open()?;
        file.write_all(&[0xAA; 2 * PAGE_SIZE])?;
        let mapping = {
            let file = File::open(&scratch.0)?;
            AutoMapping::map(&file, MappingRequest::whole(2 * PAGE_SIZE as u64, MapMode::ReadOnly))?
        };
        assert_eq!(mapping.len(), 2 * PAGE_SIZE);
        assert!(mapping.slice(PAGE_SIZE as u64 - 8, 16)?.iter().all(|b| *b == 0xAA));
        Ok(())
    }

    #[test]
    fn test_slice_bounds() -> anyhow::Result<()> {
        let scratch = ScratchFile::new("bounds");
        let file = scratch.open()?;
        let mapping = ConfinedMapping::map(&file, MappingRequest::whole(64, MapMode::ReadWrite))?;
        assert_eq!(mapping.slice(0, 64)?.len(), 64);
        assert_eq!(mapping.slice(63, 1)?.len(), 1);
        assert!(matches!(
            mapping.slice(60, 8),
            Err(MappingError::OutOfBounds { mapped: 64, .. })
        ));
        assert!(matches!(
            mapping.slice(u64::MAX, 1),
            Err(MappingError::OutOfBounds { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_read_only_mapping_rejects_writes() -> anyhow::Result<()> {
        let scratch = ScratchFile::new("readonly");
        let mut file = scratch.open()?;
        file.write_all(&[1; 32])?;
        let mut mapping = ConfinedMapping::map(&file, MappingRequest::whole(32, MapMode::ReadOnly))?;
        assert!(matches!(mapping.as_mut_slice(), Err(MappingError::ReadOnly)));
        Ok(())
    }

    #[test]
    fn test_invalid_requests() -> anyhow::Result<()> {
        let scratch = ScratchFile::new("invalid");
        let file = scratch.open()?;
        assert!(matches!(
            ConfinedMapping::map(&file, MappingRequest::whole(0, MapMode::ReadOnly)),
            Err(MappingError::Empty)
        ));
        assert!(matches!(
            AutoMapping::map(&file, MappingRequest::new(u64::MAX, 2, MapMode::ReadOnly)),
            Err(MappingError::TooLarge { .. })
        ));
        Ok(())
    }
}
