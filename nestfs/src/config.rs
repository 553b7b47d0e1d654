//! Runtime configuration for [`crate::Filesystem::format`] and
//! [`crate::Filesystem::open`] (§4.5's ambient configuration layer).
//!
//! Scaled down from the teacher's build-time `config/` + `kernel/build/main.rs`
//! feature matrix to a runtime struct: this crate has no analogous build-time
//! configuration surface, just a couple of knobs a caller may want to flip
//! per-image.

/// Block size the caller expects the image to use, and how hard `open`
/// should work to validate an existing image before trusting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// If `Some`, `format`/`open` fail unless it matches [`crate::layout::BLOCK_SIZE`].
    /// `BLOCK_SIZE` is a compile-time constant, so this is a validation hook
    /// for callers that want to assert their expectation rather than a knob
    /// that actually changes the on-storage block size.
    pub block_size: Option<u64>,
    /// When true, `open` additionally walks the whole occupancy hierarchy
    /// via [`crate::alloc::BlockAllocator::check`] before returning, instead
    /// of trusting the stored header on the fast path.
    pub strict_format_validation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: None,
            strict_format_validation: false,
        }
    }
}

impl Config {
    pub(crate) fn validate_block_size(&self) -> crate::error::Result<()> {
        if let Some(requested) = self.block_size {
            if requested != crate::layout::BLOCK_SIZE as u64 {
                return Err(crate::error::Error::InvalidStorageFormat(format!(
                    "requested block size {requested} does not match the fixed block size {}",
                    crate::layout::BLOCK_SIZE
                )));
            }
        }
        Ok(())
    }
}
