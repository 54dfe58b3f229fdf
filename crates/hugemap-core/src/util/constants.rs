use super::Size;

/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Default huge page size (2 MiB) on x86_64
pub const HUGE_PAGE_SIZE_2M: Size = Size::MB(2);

/// Logical length of the sparse file: 512 bytes past the 4 GiB boundary.
pub const LARGE_MAP_LENGTH: u64 = (1 << 32) + 512;

/// Length of the window written through the confined mapping.
pub const WINDOW_LEN: usize = 1024;

/// Minimum number of free 2 MiB pages before a large mapping run is attempted.
///
/// This is an admission threshold, not the page count of the whole file:
/// only the pages actually written get allocated.
pub const DEFAULT_REQUIRED_PAGES: u64 = 2010;

/// Global hugetlbfs mount as created by `hugeadm --create-global-mounts`.
///
/// It can be set up with, e.g.:
///
/// ```sh
/// sudo hugeadm --create-global-mounts
/// sudo mount -t hugetlbfs -o uid=$(id -u),gid=$(id -g),mode=0777,pagesize=2M \
///     none /var/lib/hugetlbfs/global/pagesize-2MB
/// sudo sysctl vm.nr_hugepages=2200
/// ```
pub const DEFAULT_HUGETLBFS_DIR: &str = "/var/lib/hugetlbfs/global/pagesize-2MB";

/// Kernel memory statistics.
pub const MEMINFO_PATH: &str = "/proc/meminfo";
