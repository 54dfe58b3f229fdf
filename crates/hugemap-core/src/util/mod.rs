//! Utility types and constants shared by the verifier components.
//!
//! - [`Size`] - Memory size representation
//! - Constants describing the large-offset mapping scenario ([`LARGE_MAP_LENGTH`], [`WINDOW_LEN`], ...)
//! - Progress bar styling ([`NamedProgress`])
//! - Random number generation ([`Rng`])

mod constants;
mod named_progress;
mod rng;
mod size;

pub use self::constants::*;
pub use self::named_progress::NamedProgress;
pub use self::rng::Rng;
pub use self::size::Size;

/// Returns the system page size in bytes.
///
/// Falls back to [`PAGE_SIZE`] if `sysconf` cannot report it.
pub fn system_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        PAGE_SIZE
    } else {
        size as usize
    }
}
