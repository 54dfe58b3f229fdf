//! # Hugemap
//!
//! Regression check for memory mappings of hugetlbfs-backed files beyond the
//! 4 GiB file offset.
//!
//! This crate re-exports [`hugemap_core`]. The `large_map` binary in
//! `hugemap-bin` runs the check from the command line.
//!
//! ## Environment
//!
//! A hugetlbfs volume with 2 MiB pages and enough free pages must exist, e.g.:
//!
//! ```sh
//! sudo hugeadm --create-global-mounts
//! sudo mount -t hugetlbfs -o uid=$(id -u),gid=$(id -g),mode=0777,pagesize=2M \
//!     none /var/lib/hugetlbfs/global/pagesize-2MB
//! sudo sysctl vm.nr_hugepages=2200
//! ```
//!
//! Without it the check is skipped.

pub use hugemap_core::*;
