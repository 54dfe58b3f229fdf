//! Block size detection for files.
//!
//! A file on hugetlbfs reports the huge page size as its block size, which is
//! how we tell that a file is really backed by huge pages. Two strategies are
//! available behind [`BlockSizeProbe`]:
//!
//! - [`DescriptorProbe`] asks the open file descriptor (`fstat(2)`, `st_blksize`)
//! - [`FileStoreProbe`] asks the mounted filesystem (`statfs(2)`, `f_bsize`)
//!
//! [`ProbeChain`] tries them in order and reports the first answer.

use std::ffi::CString;
use std::fs::File;
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while probing a block size.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The underlying system call failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The probe cannot be used on this platform.
    #[error("{0} probe is not available on this platform")]
    Unsupported(&'static str),
    /// The system reported a nonsensical value.
    #[error("Invalid block size {0}")]
    InvalidBlockSize(i64),
}

/// A strategy for determining the block size backing a file.
pub trait BlockSizeProbe {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;

    /// Whether this probe can work on the running platform at all.
    fn is_available(&self) -> bool {
        true
    }

    /// Returns the block size in bytes of the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProbeError`] if the block size cannot be determined.
    fn block_size(&self, path: &Path) -> Result<u64, ProbeError>;
}

fn positive(value: i64) -> Result<u64, ProbeError> {
    if value > 0 {
        Ok(value as u64)
    } else {
        Err(ProbeError::InvalidBlockSize(value))
    }
}

/// Queries `st_blksize` of an open descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorProbe;

impl DescriptorProbe {
    /// Block size of an already open file.
    ///
    /// # Errors
    ///
    /// Returns an error if `fstat` fails.
    pub fn of_file(file: &File) -> Result<u64, ProbeError> {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(file.as_raw_fd(), stat.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let stat = unsafe { stat.assume_init() };
        positive(stat.st_blksize as i64)
    }
}

impl BlockSizeProbe for DescriptorProbe {
    fn name(&self) -> &'static str {
        "descriptor"
    }

    fn is_available(&self) -> bool {
        cfg!(unix)
    }

    fn block_size(&self, path: &Path) -> Result<u64, ProbeError> {
        let file = File::open(path)?;
        Self::of_file(&file)
    }
}

/// Queries `f_bsize` of the filesystem holding a path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStoreProbe;

impl BlockSizeProbe for FileStoreProbe {
    fn name(&self) -> &'static str {
        "file store"
    }

    fn is_available(&self) -> bool {
        cfg!(target_os = "linux")
    }

    #[cfg(target_os = "linux")]
    fn block_size(&self, path: &Path) -> Result<u64, ProbeError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut fs = MaybeUninit::<libc::statfs>::uninit();
        if unsafe { libc::statfs(c_path.as_ptr(), fs.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let fs = unsafe { fs.assume_init() };
        positive(fs.f_bsize as i64)
    }

    #[cfg(not(target_os = "linux"))]
    fn block_size(&self, _path: &Path) -> Result<u64, ProbeError> {
        Err(ProbeError::Unsupported(self.name()))
    }
}

/// Ordered list of probes; the first successful one wins.
pub struct ProbeChain {
    probes: Vec<Box<dyn BlockSizeProbe>>,
}

impl Default for ProbeChain {
    /// [`DescriptorProbe`] first, [`FileStoreProbe`] as fallback.
    fn default() -> Self {
        ProbeChain::new(vec![Box::new(DescriptorProbe), Box::new(FileStoreProbe)])
    }
}

impl ProbeChain {
    /// Creates a chain trying `probes` in order.
    pub fn new(probes: Vec<Box<dyn BlockSizeProbe>>) -> Self {
        ProbeChain { probes }
    }

    /// Returns the block size reported by the first probe that succeeds, or
    /// `None` if all of them fail.
    pub fn detect(&self, path: &Path) -> Option<u64> {
        for probe in &self.probes {
            if !probe.is_available() {
                debug!("Skipping unavailable {} probe", probe.name());
                continue;
            }
            match probe.block_size(path) {
                Ok(size) => {
                    debug!("{} probe: {} => {}", probe.name(), path.display(), size);
                    return Some(size);
                }
                Err(e) => debug!("{} probe failed for {}: {}", probe.name(), path.display(), e),
            }
        }
        None
    }

    /// Compares the block size of the file at `path` with `expected`.
    pub fn check(&self, path: &Path, expected: u64) -> BlockSizeCheck {
        let check = match self.detect(path) {
            Some(size) if size == expected => BlockSizeCheck::Matches(size),
            Some(size) => BlockSizeCheck::Differs(size),
            None => BlockSizeCheck::Unknown,
        };
        info!("  BlockSize: {}. Proceed: {}", check, check.matches());
        check
    }

    /// Whether the file at `path` is backed by blocks of `expected` bytes.
    ///
    /// An undeterminable block size counts as "no".
    pub fn uses_huge_blocks(&self, path: &Path, expected: u64) -> bool {
        self.check(path, expected).matches()
    }
}

/// Result of comparing a detected block size with the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockSizeCheck {
    /// The block size equals the expected size.
    Matches(u64),
    /// The file is backed by blocks of a different size.
    Differs(u64),
    /// No probe could determine the block size.
    Unknown,
}

impl BlockSizeCheck {
    /// Whether the expected block size was detected.
    pub fn matches(&self) -> bool {
        matches!(self, BlockSizeCheck::Matches(_))
    }

    /// The detected block size, if any.
    pub fn block_size(&self) -> Option<u64> {
        match self {
            BlockSizeCheck::Matches(size) | BlockSizeCheck::Differs(size) => Some(*size),
            BlockSizeCheck::Unknown => None,
        }
    }
}

impl std::fmt::Display for BlockSizeCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.block_size() {
            Some(size) => write!(f, "{}", size),
            None => write!(f, "unknown"),
        }
    }
}

/// Checks the file at `path` against `expected` with the default [`ProbeChain`].
pub fn uses_huge_blocks(path: impl AsRef<Path>, expected: u64) -> bool {
    ProbeChain::default().uses_huge_blocks(path.as_ref(), expected)
}
