use std::fs;
use std::path::PathBuf;

use hugemap::util::{HUGE_PAGE_SIZE_2M, LARGE_MAP_LENGTH, MEMINFO_PATH, WINDOW_LEN};
use hugemap::{
    AbortReason, AutoMapping, ConfinedMapping, HugePageInfo, HugePageStats, MapMode, MappedView,
    MappingRequest, MappingVerifier, Outcome, ProbeChain, SparseFile, VerifierConfig,
};
use rand::RngCore;

struct ScratchDir(PathBuf);

impl ScratchDir {
    fn new(name: &str) -> std::io::Result<Self> {
        let dir = std::env::temp_dir().join(format!("hugemap-it-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir)?;
        Ok(ScratchDir(dir))
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

#[test]
fn test_meminfo_from_file() -> anyhow::Result<()> {
    let scratch = ScratchDir::new("meminfo")?;
    let path = scratch.0.join("meminfo");
    fs::write(
        &path,
        "HugePages_Total:    2200\nHugePages_Free:     2010\nHugepagesize:       2048 kB\n",
    )?;
    let info = HugePageInfo::from_path(&path);
    assert_eq!(info.huge_page_size(), 2097152);
    assert_eq!(info.free_pages(), 2010);
    assert!(info.supports(HUGE_PAGE_SIZE_2M.bytes() as u64, 2010));
    assert!(!info.supports(HUGE_PAGE_SIZE_2M.bytes() as u64, 2011));
    Ok(())
}

#[test]
fn test_missing_volume_creates_nothing() -> anyhow::Result<()> {
    let scratch = ScratchDir::new("missing")?;
    let dir = scratch.0.join("not-mounted");
    let info = HugePageInfo::from_stats(HugePageStats {
        page_size_bytes: 2097152,
        free_pages: 4096,
    });
    let config = VerifierConfig {
        dir: dir.clone(),
        ..Default::default()
    };
    let outcome = MappingVerifier::new(config, &info).run()?;
    assert_eq!(outcome, Outcome::Aborted(AbortReason::MissingVolume(dir.clone())));
    assert!(!dir.exists());
    assert_eq!(fs::read_dir(&scratch.0)?.count(), 0);
    Ok(())
}

#[test]
fn test_regular_file_is_not_huge_page_backed() -> anyhow::Result<()> {
    let scratch = ScratchDir::new("regular")?;
    let file = SparseFile::create(&scratch.0, "test", ".dat", 1 << 20)?;
    assert!(!hugemap::uses_huge_blocks(file.path(), 1 << 30));
    Ok(())
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_independent_mappings_see_same_bytes_beyond_4gib() -> anyhow::Result<()> {
    let scratch = ScratchDir::new("independent")?;
    let file = SparseFile::create(&scratch.0, "test", ".dat", LARGE_MAP_LENGTH)?;
    let base = LARGE_MAP_LENGTH - WINDOW_LEN as u64;
    let mut written = vec![0u8; WINDOW_LEN];
    rand::rng().fill_bytes(&mut written);

    {
        let handle = file.open_rw()?;
        let mut window =
            ConfinedMapping::map(&handle, MappingRequest::new(base, WINDOW_LEN as u64, MapMode::ReadWrite))?;
        window.as_mut_slice()?.copy_from_slice(&written);
    }

    let handle = file.open_rw()?;
    let whole = AutoMapping::map(&handle, MappingRequest::whole(file.len()?, MapMode::ReadOnly))?;
    drop(handle);
    assert_eq!(whole.slice(base, WINDOW_LEN)?, written.as_slice());
    assert!(whole.slice(0, 4096)?.iter().all(|b| *b == 0));
    Ok(())
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_verifier_round_trip_on_scratch_fs() -> anyhow::Result<()> {
    let scratch = ScratchDir::new("verifier")?;
    let block_size = ProbeChain::default()
        .detect(&scratch.0)
        .ok_or_else(|| anyhow::anyhow!("block size of {} unknown", scratch.0.display()))?;
    let info = HugePageInfo::from_stats(HugePageStats {
        page_size_bytes: block_size,
        free_pages: 1,
    });
    let config = VerifierConfig {
        dir: scratch.0.clone(),
        page_size: block_size,
        required_pages: 1,
        seed: Some(8286637),
        ..Default::default()
    };
    let mut verifier = MappingVerifier::new(config, &info);
    assert_eq!(verifier.run()?, Outcome::Done);
    let report = verifier.report();
    assert_eq!(report.seed, 8286637);
    assert!(report.mapped_len.is_some_and(|len| len >= LARGE_MAP_LENGTH));
    Ok(())
}

/// Needs a hugetlbfs volume with 2 MiB pages at the default location and at
/// least 2010 free pages.
#[test]
#[ignore]
fn test_large_map_on_hugetlbfs() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let info = HugePageInfo::from_path(MEMINFO_PATH);
    let mut verifier = MappingVerifier::new(VerifierConfig::default(), &info);
    let outcome = verifier.run()?;
    assert_eq!(outcome, Outcome::Done);
    let report = verifier.report();
    assert_eq!(
        report.block_size.and_then(|check| check.block_size()),
        Some(HUGE_PAGE_SIZE_2M.bytes() as u64)
    );
    Ok(())
}
