//! End-to-end check of a mapping beyond the 4 GiB file offset.
//!
//! [`MappingVerifier`] writes random bytes just below the end of a sparse file
//! of `2^32 + 512` bytes through a [`ConfinedMapping`], then maps the whole
//! file with an [`AutoMapping`] and compares the window. It advances through
//! [`VerifierState`]s:
//!
//! ```text
//! Idle -> EnvironmentChecked -> FileCreated -> WindowWritten -> WindowVerified -> Done
//!   \            \
//!    `------------`--> Aborted
//! ```
//!
//! A missing or misconfigured hugetlbfs volume leads to [`Outcome::Aborted`],
//! which is not a failure. A byte mismatch or an I/O error after the file was
//! set up is returned as [`VerifyError`].

use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::block_size::{BlockSizeCheck, ProbeChain};
use crate::mapping::{AutoMapping, ConfinedMapping, MapMode, MappedView, MappingError, MappingRequest};
use crate::meminfo::{HugePageInfo, HugePageShortfall, HugePageStats};
use crate::sparse_file::SparseFile;
use crate::util::{
    DEFAULT_HUGETLBFS_DIR, DEFAULT_REQUIRED_PAGES, HUGE_PAGE_SIZE_2M, LARGE_MAP_LENGTH,
    NamedProgress, Rng, WINDOW_LEN,
};

const FILE_PREFIX: &str = "test";
const FILE_SUFFIX: &str = ".dat";

/// Parameters of a verification run.
#[derive(Debug, Clone, Serialize)]
pub struct VerifierConfig {
    /// Directory on the hugetlbfs volume
    pub dir: PathBuf,
    /// Required huge page size in bytes
    pub page_size: u64,
    /// Required number of free huge pages
    pub required_pages: u64,
    /// Logical length of the sparse file
    pub length: u64,
    /// Number of bytes written at the end of the file
    pub window_len: usize,
    /// Seed for the written bytes (random if `None`)
    pub seed: Option<u64>,
    /// Leave the file in place after the run
    pub keep_file: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_HUGETLBFS_DIR),
            page_size: HUGE_PAGE_SIZE_2M.bytes() as u64,
            required_pages: DEFAULT_REQUIRED_PAGES,
            length: LARGE_MAP_LENGTH,
            window_len: WINDOW_LEN,
            seed: None,
            keep_file: false,
        }
    }
}

impl VerifierConfig {
    /// File offset of the written window.
    pub fn base(&self) -> Option<u64> {
        self.length.checked_sub(self.window_len as u64)
    }

    fn validate(&self) -> Result<u64, VerifyError> {
        if self.window_len == 0 {
            return Err(VerifyError::InvalidConfig("window length must not be zero".into()));
        }
        self.base().ok_or_else(|| {
            VerifyError::InvalidConfig(format!(
                "window of {} bytes does not fit a file of {} bytes",
                self.window_len, self.length
            ))
        })
    }
}

/// Progress of a [`MappingVerifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerifierState {
    /// Nothing checked yet
    Idle,
    /// Volume and huge page pool are usable
    EnvironmentChecked,
    /// The sparse file exists and is huge page backed
    FileCreated,
    /// Random bytes were written through the confined mapping
    WindowWritten,
    /// The whole-file mapping shows the written bytes
    WindowVerified,
    /// Finished successfully
    Done,
    /// A precondition does not hold, nothing was verified
    Aborted,
}

/// Why a run was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum AbortReason {
    /// Large offsets need a 64-bit address space.
    #[error("Unsupported platform: {arch} with {pointer_width}-bit pointers")]
    UnsupportedPlatform {
        /// Target architecture
        arch: &'static str,
        /// Pointer width in bits
        pointer_width: u32,
    },
    /// The configured directory is missing or not a directory.
    #[error("hugetlbfs volume {} does not exist", .0.display())]
    MissingVolume(PathBuf),
    /// The huge page pool cannot back the file.
    #[error(transparent)]
    HugePages(#[from] HugePageShortfall),
    /// The file could not be created on the volume.
    #[error("Could not create a file in {}: {reason}", .dir.display())]
    FileSetup {
        /// Target directory
        dir: PathBuf,
        /// Underlying error message
        reason: String,
    },
    /// The created file is not backed by blocks of the huge page size.
    #[error("{} does not use huge blocks (block size {check}, expected {expected})", .path.display())]
    NotHugePageBacked {
        /// The rejected file
        path: PathBuf,
        /// Detected block size
        check: BlockSizeCheck,
        /// Required block size
        expected: u64,
    },
}

/// Final result of a run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// The window read back through the whole-file mapping matched.
    Done,
    /// The environment does not support the check.
    Aborted(AbortReason),
}

/// Errors that fail a run.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// A file operation failed after the environment was accepted.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Mapping the file failed.
    #[error(transparent)]
    Mapping(#[from] MappingError),
    /// The bytes seen through the whole-file mapping differ from the written ones.
    #[error(
        "Expected buffers to be equal: first difference at file offset {offset} (expected 0x{expected:02x}, found 0x{actual:02x})"
    )]
    Mismatch {
        /// File offset of the first differing byte
        offset: u64,
        /// Written byte
        expected: u8,
        /// Byte read back
        actual: u8,
    },
    /// The configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// The sparse file disappeared between phases.
    #[error("No sparse file in state {0:?}")]
    MissingFile(VerifierState),
}

/// Build and platform information recorded with each run.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformInfo {
    /// Target architecture
    pub arch: &'static str,
    /// Target operating system
    pub os: &'static str,
    /// Pointer width in bits
    pub pointer_width: u32,
    /// Version of this crate
    pub version: &'static str,
}

impl PlatformInfo {
    /// Describes the running binary.
    pub fn current() -> Self {
        Self {
            arch: std::env::consts::ARCH,
            os: std::env::consts::OS,
            pointer_width: usize::BITS,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Everything observed during a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// RFC 3339 timestamp of the start of the run
    pub date: String,
    /// Platform the run executed on
    pub platform: PlatformInfo,
    /// Run parameters
    pub config: VerifierConfig,
    /// Seed of the written bytes
    pub seed: u64,
    /// Huge page statistics used for the environment check
    pub stats: HugePageStats,
    /// The sparse file, once created
    pub file: Option<PathBuf>,
    /// Block size check of the sparse file
    pub block_size: Option<BlockSizeCheck>,
    /// Time from file creation to the release of the write mapping
    pub write_duration_ns: Option<u64>,
    /// Length of the whole-file mapping
    pub mapped_len: Option<u64>,
    /// Last state reached
    pub state: VerifierState,
    /// Why the run was skipped
    pub abort: Option<AbortReason>,
}

impl RunReport {
    /// Writes the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        info!("Report saved to {}", path.display());
        Ok(())
    }
}

/// Drives one large-offset mapping check.
///
/// # Examples
///
/// ```no_run
/// use hugemap_core::{HugePageInfo, MappingVerifier, Outcome, VerifierConfig};
///
/// let info = HugePageInfo::load();
/// let mut verifier = MappingVerifier::new(VerifierConfig::default(), &info);
/// match verifier.run()? {
///     Outcome::Done => println!("mapping verified"),
///     Outcome::Aborted(reason) => println!("skipped: {}", reason),
/// }
/// # Ok::<(), hugemap_core::VerifyError>(())
/// ```
pub struct MappingVerifier<'a> {
    config: VerifierConfig,
    info: &'a HugePageInfo,
    probe: ProbeChain,
    state: VerifierState,
    rng: Rng,
    file: Option<SparseFile>,
    pattern: Vec<u8>,
    started: Option<Instant>,
    report: RunReport,
    progress: Option<ProgressBar>,
}

impl<'a> MappingVerifier<'a> {
    /// Creates a verifier in state [`VerifierState::Idle`].
    pub fn new(config: VerifierConfig, info: &'a HugePageInfo) -> Self {
        let rng = config.seed.map_or_else(Rng::from_entropy, Rng::from_seed);
        let report = RunReport {
            date: chrono::Local::now().to_rfc3339(),
            platform: PlatformInfo::current(),
            config: config.clone(),
            seed: rng.seed(),
            stats: info.stats(),
            file: None,
            block_size: None,
            write_duration_ns: None,
            mapped_len: None,
            state: VerifierState::Idle,
            abort: None,
        };
        MappingVerifier {
            config,
            info,
            probe: ProbeChain::default(),
            state: VerifierState::Idle,
            rng,
            file: None,
            pattern: Vec::new(),
            started: None,
            report,
            progress: None,
        }
    }

    /// Replaces the default block size probes.
    pub fn with_probe(mut self, probe: ProbeChain) -> Self {
        self.probe = probe;
        self
    }

    /// Shows the phases as a progress bar.
    pub fn with_progress(mut self, progress: &MultiProgress) -> Self {
        let bar = progress.add(
            ProgressBar::new(5).with_style(ProgressStyle::named_bar("Verifying large mapping")),
        );
        self.progress = Some(bar);
        self
    }

    /// Current state.
    pub fn state(&self) -> VerifierState {
        self.state
    }

    /// What has been observed so far.
    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Path of the sparse file, while it exists.
    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_ref().map(SparseFile::path)
    }

    /// Runs all remaining transitions.
    ///
    /// # Errors
    ///
    /// Returns a [`VerifyError`] on a byte mismatch or an unexpected I/O or
    /// mapping failure after the environment was accepted.
    pub fn run(&mut self) -> Result<Outcome, VerifyError> {
        loop {
            self.step()?;
            if let Some(outcome) = self.outcome() {
                return Ok(outcome);
            }
        }
    }

    /// The outcome once a terminal state was reached.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.state {
            VerifierState::Done => Some(Outcome::Done),
            VerifierState::Aborted => self.report.abort.clone().map(Outcome::Aborted),
            _ => None,
        }
    }

    /// Performs the next transition and returns the new state.
    ///
    /// Terminal states are left unchanged.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn step(&mut self) -> Result<VerifierState, VerifyError> {
        let next = match self.state {
            VerifierState::Idle => self.check_environment()?,
            VerifierState::EnvironmentChecked => self.create_file()?,
            VerifierState::FileCreated => self.write_window()?,
            VerifierState::WindowWritten => self.verify_window()?,
            VerifierState::WindowVerified => {
                info!("Mapping beyond the 32-bit range verified");
                VerifierState::Done
            }
            terminal => return Ok(terminal),
        };
        self.enter(next);
        Ok(next)
    }

    fn enter(&mut self, state: VerifierState) {
        debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
        self.report.state = state;
        if let Some(bar) = &self.progress {
            match state {
                VerifierState::Done | VerifierState::Aborted => bar.finish_and_clear(),
                _ => {
                    bar.inc(1);
                    bar.set_message(format!("{:?}", state));
                }
            }
        }
    }

    fn abort(&mut self, reason: AbortReason) -> VerifierState {
        warn!("{}. Aborting test.", reason);
        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.remove() {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
        self.report.abort = Some(reason);
        VerifierState::Aborted
    }

    fn check_environment(&mut self) -> Result<VerifierState, VerifyError> {
        let platform = &self.report.platform;
        info!(
            "hugemap {} on {}/{} ({}-bit)",
            platform.version, platform.os, platform.arch, platform.pointer_width
        );
        if platform.pointer_width < 64 {
            let reason = AbortReason::UnsupportedPlatform {
                arch: platform.arch,
                pointer_width: platform.pointer_width,
            };
            return Ok(self.abort(reason));
        }

        let base = self.config.validate()?;
        if base <= u32::MAX as u64 {
            warn!(
                "Window at 0x{:x} does not lie beyond the 32-bit range",
                base
            );
        }

        let is_dir = fs::metadata(&self.config.dir)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Ok(self.abort(AbortReason::MissingVolume(self.config.dir.clone())));
        }

        if let Err(shortfall) = self
            .info
            .check_logged(self.config.page_size, self.config.required_pages)
        {
            return Ok(self.abort(shortfall.into()));
        }
        Ok(VerifierState::EnvironmentChecked)
    }

    fn create_file(&mut self) -> Result<VerifierState, VerifyError> {
        info!("  Writing large file...");
        self.started = Some(Instant::now());
        let file = match SparseFile::create(
            &self.config.dir,
            FILE_PREFIX,
            FILE_SUFFIX,
            self.config.length,
        ) {
            Ok(file) => file,
            Err(e) => {
                let reason = AbortReason::FileSetup {
                    dir: self.config.dir.clone(),
                    reason: e.to_string(),
                };
                return Ok(self.abort(reason));
            }
        };
        let path = file.path().to_path_buf();
        debug!("Created {}", path.display());
        self.report.file = Some(path.clone());
        self.file = Some(file);

        let check = self.probe.check(&path, self.config.page_size);
        self.report.block_size = Some(check);
        if !check.matches() {
            let reason = AbortReason::NotHugePageBacked {
                path,
                check,
                expected: self.config.page_size,
            };
            return Ok(self.abort(reason));
        }

        if self.config.keep_file
            && let Some(file) = self.file.as_mut()
        {
            file.keep();
        }
        Ok(VerifierState::FileCreated)
    }

    fn write_window(&mut self) -> Result<VerifierState, VerifyError> {
        let file = self
            .file
            .as_ref()
            .ok_or(VerifyError::MissingFile(self.state))?;
        let base = self.config.validate()?;
        let mut handle = file.open_rw()?;
        let position = handle.seek(SeekFrom::Start(base))?;
        self.pattern = self.rng.bytes(self.config.window_len);
        debug!("Writing {} bytes with seed {}", self.pattern.len(), self.rng.seed());
        {
            let request = MappingRequest::new(position, self.pattern.len() as u64, MapMode::ReadWrite);
            let mut mapping = ConfinedMapping::map(&handle, request)?;
            mapping.as_mut_slice()?.copy_from_slice(&self.pattern);
        }
        drop(handle);

        let elapsed = self.started.map(|t| t.elapsed()).unwrap_or_default();
        info!(
            "  Wrote large file in {} ns ({} ms)",
            elapsed.as_nanos(),
            elapsed.as_millis()
        );
        self.report.write_duration_ns = Some(elapsed.as_nanos() as u64);
        Ok(VerifierState::WindowWritten)
    }

    fn verify_window(&mut self) -> Result<VerifierState, VerifyError> {
        let file = self
            .file
            .as_ref()
            .ok_or(VerifyError::MissingFile(self.state))?;
        let base = self.config.validate()?;
        let handle = file.open_rw()?;
        let len = handle.metadata()?.len();
        info!("  Mapping [0, {})", len);
        let mapping = AutoMapping::map(&handle, MappingRequest::whole(len, MapMode::ReadWrite))?;
        drop(handle);
        self.report.mapped_len = Some(len);

        let target = mapping.slice(base, self.pattern.len())?;
        if let Some((i, (expected, actual))) = self
            .pattern
            .iter()
            .zip(target)
            .enumerate()
            .find(|(_, (a, b))| a != b)
        {
            return Err(VerifyError::Mismatch {
                offset: base + i as u64,
                expected: *expected,
                actual: *actual,
            });
        }
        Ok(VerifierState::WindowVerified)
    }
}
