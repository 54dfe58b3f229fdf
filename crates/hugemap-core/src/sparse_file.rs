use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};

const MAX_NAME_ATTEMPTS: usize = 16;

/// A uniquely named file created empty, with a logical length set by truncation.
///
/// Nothing is allocated until the file is written, so the file can be far
/// larger than the memory backing it. The file is removed on drop unless
/// [`keep`](SparseFile::keep) was called.
#[derive(Debug)]
pub struct SparseFile {
    path: PathBuf,
    logical_len: u64,
    keep: bool,
}

impl SparseFile {
    /// Creates `<prefix><random><suffix>` in `dir` with `O_CREAT | O_EXCL` and
    /// truncates it to `len` bytes.
    ///
    /// Exclusive creation guarantees the file starts without allocated blocks.
    /// The handle is closed before returning. A failed truncation is logged and
    /// left to the first writable mapping, since hugetlbfs only accepts huge
    /// page aligned lengths.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created or no unused name
    /// was found.
    pub fn create(dir: &Path, prefix: &str, suffix: &str, len: u64) -> std::io::Result<Self> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = dir.join(format!("{}{}{}", prefix, rand::random::<u64>(), suffix));
            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("{} exists, picking another name", path.display());
                    continue;
                }
                Err(e) => return Err(e),
            };
            let sparse = SparseFile {
                path,
                logical_len: len,
                keep: false,
            };
            if let Err(e) = file.set_len(len) {
                warn!(
                    "Could not truncate {} to {} bytes: {}",
                    sparse.path.display(),
                    len,
                    e
                );
            }
            return Ok(sparse);
        }
        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no unused file name in {}", dir.display()),
        ))
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length requested at creation.
    pub fn logical_len(&self) -> u64 {
        self.logical_len
    }

    /// Current length as reported by the filesystem.
    pub fn len(&self) -> std::io::Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Whether the file currently has zero length.
    pub fn is_empty(&self) -> std::io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Opens the file for reading and writing.
    pub fn open_rw(&self) -> std::io::Result<File> {
        OpenOptions::new().read(true).write(true).open(&self.path)
    }

    /// Leaves the file in place when dropped.
    pub fn keep(&mut self) {
        self.keep = true;
    }

    /// Removes the file now.
    pub fn remove(mut self) -> std::io::Result<()> {
        self.keep = true;
        fs::remove_file(&self.path)
    }
}

impl Drop for SparseFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_create_is_sparse() -> anyhow::Result<()> {
        let len = 1 << 30;
        let file = SparseFile::create(&std::env::temp_dir(), "hugemap-sparse", ".dat", len)?;
        let name = file.path().file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with("hugemap-sparse"));
        assert!(name.ends_with(".dat"));
        assert_eq!(file.logical_len(), len);
        assert_eq!(file.len()?, len);
        let meta = fs::metadata(file.path())?;
        assert!(meta.blocks() * 512 < len);
        Ok(())
    }

    #[test]
    fn test_dropped_file_is_removed() -> anyhow::Result<()> {
        let file = SparseFile::create(&std::env::temp_dir(), "hugemap-drop", ".dat", 0)?;
        let path = file.path().to_path_buf();
        assert!(path.exists());
        assert!(file.is_empty()?);
        drop(file);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_kept_file_survives() -> anyhow::Result<()> {
        let mut file = SparseFile::create(&std::env::temp_dir(), "hugemap-keep", ".dat", 16)?;
        file.keep();
        let path = file.path().to_path_buf();
        drop(file);
        assert!(path.exists());
        fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn test_names_are_unique() -> anyhow::Result<()> {
        let dir = std::env::temp_dir();
        let a = SparseFile::create(&dir, "hugemap-uniq", ".dat", 0)?;
        let b = SparseFile::create(&dir, "hugemap-uniq", ".dat", 0)?;
        assert_ne!(a.path(), b.path());
        a.remove()?;
        b.remove()?;
        Ok(())
    }

    #[test]
    fn test_missing_dir_fails() {
        let dir = Path::new("/nonexistent/hugemap");
        assert!(SparseFile::create(dir, "test", ".dat", 16).is_err());
    }
}
