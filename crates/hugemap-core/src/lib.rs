//! # Hugemap Core
//!
//! `hugemap-core` checks that files on a hugetlbfs volume can be memory mapped
//! at offsets beyond the 32-bit range, and that bytes written through one
//! mapping are visible through an independent one.
//!
//! ## Main Components
//!
//! - [`meminfo`] - [`HugePageInfo`], a snapshot of the huge page pool parsed from
//!   `/proc/meminfo`, with a capability check.
//!
//! - [`block_size`] - [`BlockSizeProbe`] strategies that tell the block size
//!   backing a file, used to confirm that a file really lives on huge pages.
//!
//! - [`mapping`] - [`ConfinedMapping`] and [`AutoMapping`], shared file mappings
//!   with scoped and process-long lifetimes.
//!
//! - [`MappingVerifier`] - The state machine that creates a sparse file of
//!   `2^32 + 512` bytes, writes a random window at its end and reads it back.
//!
//! - [`util`] module - [`util::Size`], constants and the seedable [`util::Rng`].
//!
//! ## Platform Support
//!
//! The verifier needs 64-bit Linux with a mounted hugetlbfs volume and enough
//! free huge pages. Without them a run ends in [`Outcome::Aborted`], not in an error.

#![warn(missing_docs)]

pub mod block_size;
pub mod mapping;
pub mod meminfo;
mod sparse_file;
pub mod util;
mod verifier;

pub use crate::block_size::{BlockSizeCheck, BlockSizeProbe, ProbeChain, uses_huge_blocks};
pub use crate::mapping::{AutoMapping, ConfinedMapping, MapMode, MappedView, MappingRequest};
pub use crate::meminfo::{HugePageInfo, HugePageShortfall, HugePageStats};
pub use crate::sparse_file::SparseFile;

pub use verifier::{
    AbortReason, MappingVerifier, Outcome, PlatformInfo, RunReport, VerifierConfig,
    VerifierState, VerifyError,
};
