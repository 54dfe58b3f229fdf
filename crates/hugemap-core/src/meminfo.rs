//! Huge page availability as reported by the kernel.
//!
//! The statistics are read once into a [`HugePageInfo`] snapshot which is then
//! passed by reference to whoever needs to check the environment.
//!
// https://www.kernel.org/doc/Documentation/vm/hugetlbpage.txt
//
// The output of "cat /proc/meminfo" will include lines like:
// ...
// HugePages_Total: uuu
// HugePages_Free:  vvv
// HugePages_Rsvd:  www
// HugePages_Surp:  xxx
// Hugepagesize:    yyy kB
// Hugetlb:         zzz kB

use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::util::{MEMINFO_PATH, Size};

const FREE_LABEL: &str = "HugePages_Free";
const SIZE_LABEL: &str = "Hugepagesize";
const KB_SUFFIX: &str = "kB";

/// Snapshot of the huge page statistics.
///
/// A value of `0` means "not available": either the kernel reported zero or the
/// line was missing or malformed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HugePageStats {
    /// Default huge page size in bytes
    pub page_size_bytes: u64,
    /// Number of huge pages currently free in the pool
    pub free_pages: u64,
}

impl HugePageStats {
    /// Parses meminfo-formatted text.
    ///
    /// Lines are `<Label>: <value> [unit]`. Unknown labels are ignored.
    /// A page size without the `kB` unit is reported as `0`. A malformed or
    /// overflowing number zeroes the whole snapshot. Both log a warning.
    pub fn parse(s: &str) -> Self {
        let mut stats = HugePageStats::default();
        let mut seen_free = false;
        let mut seen_size = false;
        for line in s.lines() {
            let Some((label, value)) = line.split_once(':') else {
                continue;
            };
            let parsed = match label.trim() {
                FREE_LABEL => {
                    seen_free = true;
                    parse_count(value).map(|free| stats.free_pages = free)
                }
                SIZE_LABEL => {
                    seen_size = true;
                    parse_page_size(value).map(|size| stats.page_size_bytes = size)
                }
                _ => Some(()),
            };
            if parsed.is_none() {
                return HugePageStats::default();
            }
        }
        if !seen_free {
            warn!("No {} line found", FREE_LABEL);
        }
        if !seen_size {
            warn!("No {} line found", SIZE_LABEL);
        }
        stats
    }
}

fn parse_count(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.parse::<u64>() {
        Ok(count) => Some(count),
        Err(e) => {
            warn!("Unexpected format for free pages '{}': {}", value, e);
            None
        }
    }
}

/// `Some(0)` for an unrecognized unit, `None` for a malformed number.
fn parse_page_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let Some(kb) = value.strip_suffix(KB_SUFFIX) else {
        warn!("Unexpected format for pagesize: {}", value);
        return Some(0);
    };
    let bytes = kb.trim().parse::<u64>().ok().and_then(|kb| kb.checked_mul(1024));
    if bytes.is_none() {
        warn!("Unexpected format for pagesize: {}", value);
    }
    bytes
}

/// Reasons why the huge page pool cannot serve a request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HugePageShortfall {
    /// The default huge page size differs from the requested one.
    #[error("Unsupported page size. Expected: {expected}, Detected: {detected}")]
    PageSize {
        /// Requested page size in bytes
        expected: u64,
        /// Page size reported by the kernel
        detected: u64,
    },
    /// The pool has fewer free pages than requested.
    #[error("Not enough free pages. Required: {required}, Available: {available}")]
    FreePages {
        /// Requested number of pages
        required: u64,
        /// Free pages reported by the kernel
        available: u64,
    },
}

/// Huge page capability probe over a [`HugePageStats`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HugePageInfo {
    stats: HugePageStats,
}

impl HugePageInfo {
    /// Reads `/proc/meminfo`.
    pub fn load() -> Self {
        Self::from_path(MEMINFO_PATH)
    }

    /// Reads meminfo-formatted statistics from `path`.
    ///
    /// An unreadable file yields a zeroed snapshot and a warning.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(s) => {
                let info = Self::parse(&s);
                info!(
                    "{} => HugePageSize: {}. FreePages: {}",
                    path.display(),
                    info.stats.page_size_bytes,
                    info.stats.free_pages
                );
                info
            }
            Err(e) => {
                warn!("Error reading {}: {}", path.display(), e);
                Self::from_stats(HugePageStats::default())
            }
        }
    }

    /// Parses meminfo-formatted text.
    pub fn parse(s: &str) -> Self {
        Self::from_stats(HugePageStats::parse(s))
    }

    /// Wraps an existing snapshot.
    pub fn from_stats(stats: HugePageStats) -> Self {
        HugePageInfo { stats }
    }

    /// The underlying snapshot.
    pub fn stats(&self) -> HugePageStats {
        self.stats
    }

    /// Number of free huge pages, `0` if unknown.
    pub fn free_pages(&self) -> u64 {
        self.stats.free_pages
    }

    /// Default huge page size in bytes, `0` if unknown.
    pub fn huge_page_size(&self) -> u64 {
        self.stats.page_size_bytes
    }

    /// Checks that the default huge page size is `page_size` and that at least
    /// `pages` of them are free.
    ///
    /// The page size is checked first.
    ///
    /// # Errors
    ///
    /// Returns the first [`HugePageShortfall`] found.
    pub fn check(&self, page_size: u64, pages: u64) -> Result<(), HugePageShortfall> {
        if page_size != self.huge_page_size() {
            return Err(HugePageShortfall::PageSize {
                expected: page_size,
                detected: self.huge_page_size(),
            });
        }
        if pages > self.free_pages() {
            return Err(HugePageShortfall::FreePages {
                required: pages,
                available: self.free_pages(),
            });
        }
        Ok(())
    }

    /// Like [`check`](Self::check), but logs the outcome.
    pub fn check_logged(&self, page_size: u64, pages: u64) -> Result<(), HugePageShortfall> {
        let result = self.check(page_size, pages);
        match &result {
            Ok(()) => info!(
                "Correct page size: {}. Enough free pages: required {}, available {}",
                Size::from_bytes(page_size as usize),
                pages,
                self.free_pages()
            ),
            Err(e) => warn!("{}", e),
        }
        result
    }

    /// Like [`check_logged`](Self::check_logged), but returns a plain bool.
    pub fn supports(&self, page_size: u64, pages: u64) -> bool {
        self.check_logged(page_size, pages).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       32572568 kB
MemFree:         1234567 kB
HugePages_Total:    2200
HugePages_Free:     2150
HugePages_Rsvd:        0
HugePages_Surp:        0
Hugepagesize:       2048 kB
Hugetlb:         4505600 kB
";

    #[test]
    fn test_parse_meminfo() {
        let info = HugePageInfo::parse(MEMINFO);
        assert_eq!(info.huge_page_size(), 2097152);
        assert_eq!(info.free_pages(), 2150);
    }

    #[test]
    fn test_parse_page_size() {
        // correct.
        assert_eq!(parse_page_size("  2048 kB"), Some(2097152));
        assert_eq!(parse_page_size("1048576 kB"), Some(1 << 30));
        assert_eq!(parse_page_size("2048kB"), Some(2097152));

        // unknown unit.
        assert_eq!(parse_page_size("2048"), Some(0));
        assert_eq!(parse_page_size("2048 MB"), Some(0));

        // malformed.
        assert_eq!(parse_page_size("two kB"), None);
        assert_eq!(parse_page_size("18446744073709551615 kB"), None);
    }

    #[test]
    fn test_missing_unit_yields_zero_size() {
        let info = HugePageInfo::parse("HugePages_Free: 10\nHugepagesize: 2048\n");
        assert_eq!(info.huge_page_size(), 0);
        assert_eq!(info.free_pages(), 10);
    }

    #[test]
    fn test_overflowing_page_size_yields_zeroed_stats() {
        let stats = HugePageStats::parse("HugePages_Free: 10\nHugepagesize: 18446744073709551615 kB\n");
        assert_eq!(stats, HugePageStats::default());
    }

    #[test]
    fn test_malformed_input_yields_zeroed_stats() {
        assert_eq!(
            HugePageStats::parse("HugePages_Free: lots\nHugepagesize: ? kB"),
            HugePageStats::default()
        );
        assert_eq!(
            HugePageStats::parse("HugePages_Free: lots\nHugepagesize: 2048 kB"),
            HugePageStats::default()
        );
        assert_eq!(
            HugePageStats::parse("Hugepagesize: 2048 kB\nHugePages_Free: -1"),
            HugePageStats::default()
        );
        assert_eq!(HugePageStats::parse(""), HugePageStats::default());
        assert_eq!(HugePageStats::parse("garbage"), HugePageStats::default());
    }

    #[test]
    fn test_unreadable_source_yields_zeroed_stats() {
        let info = HugePageInfo::from_path("/nonexistent/hugemap/meminfo");
        assert_eq!(info.stats(), HugePageStats::default());
        assert!(!info.supports(2097152, 0));
    }

    #[test]
    fn test_supports_quadrants() {
        let info = HugePageInfo::from_stats(HugePageStats {
            page_size_bytes: 2097152,
            free_pages: 2010,
        });
        // size matches, enough pages.
        assert!(info.supports(2097152, 2010));
        assert!(info.supports(2097152, 0));
        // size matches, too few pages.
        assert!(!info.supports(2097152, 2011));
        // size differs, enough pages.
        assert!(!info.supports(1 << 30, 1));
        // size differs, too few pages.
        assert!(!info.supports(1 << 30, 5000));
    }

    #[test]
    fn test_check_reports_page_size_first() {
        let info = HugePageInfo::from_stats(HugePageStats {
            page_size_bytes: 2097152,
            free_pages: 3,
        });
        assert_eq!(
            info.check(4096, 10),
            Err(HugePageShortfall::PageSize {
                expected: 4096,
                detected: 2097152
            })
        );
        assert_eq!(
            info.check(2097152, 10),
            Err(HugePageShortfall::FreePages {
                required: 10,
                available: 3
            })
        );
    }

    #[test]
    fn test_check_logged_matches_check() {
        let info = HugePageInfo::parse(MEMINFO);
        for (size, pages) in [(2097152, 2150), (2097152, 2151), (1 << 30, 1)] {
            assert_eq!(info.check_logged(size, pages), info.check(size, pages));
            assert_eq!(info.supports(size, pages), info.check(size, pages).is_ok());
        }
    }
}
