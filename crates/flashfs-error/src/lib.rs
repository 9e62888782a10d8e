//! Error taxonomy for the flashfs workspace.
//!
//! Every fallible operation in the nucleus returns [`FlashError`]. Variants are
//! grouped the same way callers react to them:
//! - media I/O failures propagated verbatim from the HAL,
//! - structural validation failures raised when a page header does not match
//!   the id/span/flag contract the caller expected,
//! - consistency-checker internal failures that make the checker fall back to
//!   deleting a whole object,
//! - capacity failures (no free page, no free object id),
//! - probe/mount failures,
//! - file-handle level failures.
//!
//! Filesystem-level callers see a small closed set of negated POSIX errno
//! values through [`FlashError::errno`].

use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T, E = FlashError> = std::result::Result<T, E>;

/// Page index as stored on media (u16, `0xFFFF` means "no page").
pub type PageIx = u16;

/// Errors produced by the flash filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    // ── media ───────────────────────────────────────────────────────────
    /// The HAL rejected a read, write or erase.
    #[error("media error at {addr:#010x}: {detail}")]
    Media { addr: u32, detail: String },

    // ── structural validation ───────────────────────────────────────────
    /// The page is still erased.
    #[error("page {pix} is free")]
    IsFree { pix: PageIx },

    /// The page has been deleted.
    #[error("page {pix} is deleted")]
    Deleted { pix: PageIx },

    /// The page was allocated but never finalized.
    #[error("page {pix} is not finalized")]
    NotFinalized { pix: PageIx },

    /// An index page was expected but a data page was found.
    #[error("page {pix} is not an index page")]
    NotIndex { pix: PageIx },

    /// A data page was expected but an index page was found.
    #[error("page {pix} is an index page")]
    IsIndex { pix: PageIx },

    /// Index page span does not match the expected span.
    #[error("index page {pix} has span {found}, expected {expected}")]
    IndexSpanMismatch {
        pix: PageIx,
        expected: u16,
        found: u16,
    },

    /// Data page span does not match the expected span.
    #[error("data page {pix} has span {found}, expected {expected}")]
    DataSpanMismatch {
        pix: PageIx,
        expected: u16,
        found: u16,
    },

    /// Page header id does not belong to the expected object.
    #[error("page {pix} belongs to object {found:#06x}, expected {expected:#06x}")]
    ObjectIdMismatch {
        pix: PageIx,
        expected: u16,
        found: u16,
    },

    /// An index pointer refers to a page whose lookup entry is free.
    #[error("index pointer refers to free page {pix}")]
    IndexRefFree { pix: PageIx },

    /// An index pointer refers to a lookup page.
    #[error("index pointer refers to lookup page {pix}")]
    IndexRefLookup { pix: PageIx },

    /// An index pointer is outside the page range.
    #[error("index pointer {pix} is out of range")]
    IndexRefInvalid { pix: PageIx },

    // ── consistency checker internal ────────────────────────────────────
    /// Rewriting an index found a page owned by another object.
    #[error("check: index page {pix} owned by {found:#06x}, expected {expected:#06x}")]
    CheckObjIdMismatch {
        pix: PageIx,
        expected: u16,
        found: u16,
    },

    /// Rewriting an index found a page with another span.
    #[error("check: index page {pix} has span {found}, expected {expected}")]
    CheckSpanMismatch {
        pix: PageIx,
        expected: u16,
        found: u16,
    },

    /// Rewriting an index found a page whose flags are not a live index.
    #[error("check: index page {pix} has bad flags {flags:#04x}")]
    CheckFlagsBad { pix: PageIx, flags: u8 },

    /// A page-check window kept needing repairs without settling.
    #[error("check: pages from {offset} did not converge after {restarts} rescans")]
    CheckDiverged { offset: u32, restarts: u32 },

    // ── capacity ────────────────────────────────────────────────────────
    /// No free page could be allocated.
    #[error("volume is full")]
    Full,

    /// Object-id space is exhausted.
    #[error("no free object id")]
    NoFreeObjectId,

    /// Quick garbage collection found no fully deleted block.
    #[error("no fully deleted block to reclaim")]
    NoDeletedBlocks,

    // ── probe / mount / config ──────────────────────────────────────────
    /// Media does not carry a formatted volume.
    #[error("media does not contain a formatted volume")]
    NotAFilesystem,

    /// Probing could not agree on the volume geometry.
    #[error("probe failed: {detail}")]
    Probe { detail: String },

    /// Configuration is not usable.
    #[error("invalid configuration: {detail}")]
    Config { detail: String },

    /// Operation requires a mounted volume.
    #[error("volume not mounted")]
    NotMounted,

    // ── objects and handles ─────────────────────────────────────────────
    /// Object or name not found.
    #[error("not found")]
    NotFound,

    /// Another object already carries this name.
    #[error("name already in use")]
    ConflictingName,

    /// Name longer than the on-disk name field.
    #[error("name is {len} bytes, max {max}")]
    NameTooLong { len: usize, max: usize },

    /// Read or seek at or past the end of an object.
    #[error("end of object")]
    EndOfObject,

    /// Descriptor is not open.
    #[error("bad file descriptor {fd}")]
    BadDescriptor { fd: u16 },

    /// Handle was not opened for writing.
    #[error("descriptor {fd} is read-only")]
    ReadOnly { fd: u16 },

    /// Handle was not opened for reading.
    #[error("descriptor {fd} is write-only")]
    WriteOnly { fd: u16 },

    /// Handle table is full.
    #[error("too many open files")]
    TooManyOpenFiles,

    /// Catch-all for invariant violations that should not happen.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FlashError {
    /// Build an [`FlashError::Internal`] from any displayable message.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Build a media error.
    #[must_use]
    pub fn media(addr: u32, detail: impl Into<String>) -> Self {
        Self::Media {
            addr,
            detail: detail.into(),
        }
    }

    /// Build a configuration error.
    #[must_use]
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }

    /// True for errors raised when a page header fails validation.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::IsFree { .. }
                | Self::Deleted { .. }
                | Self::NotFinalized { .. }
                | Self::NotIndex { .. }
                | Self::IsIndex { .. }
                | Self::IndexSpanMismatch { .. }
                | Self::DataSpanMismatch { .. }
                | Self::ObjectIdMismatch { .. }
                | Self::IndexRefFree { .. }
                | Self::IndexRefLookup { .. }
                | Self::IndexRefInvalid { .. }
        )
    }

    /// True for the checker-internal errors that demote a repair to an
    /// object deletion.
    #[must_use]
    pub const fn is_check_error(&self) -> bool {
        matches!(
            self,
            Self::CheckObjIdMismatch { .. }
                | Self::CheckSpanMismatch { .. }
                | Self::CheckFlagsBad { .. }
        )
    }

    /// True for capacity exhaustion; the caller may retry after GC.
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::Full | Self::NoFreeObjectId)
    }

    /// Negated POSIX errno for filesystem-level callers.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        const EPERM: i32 = 1;
        const ENOENT: i32 = 2;
        const EIO: i32 = 5;
        const EBADF: i32 = 9;
        const EEXIST: i32 = 17;
        const ENODEV: i32 = 19;
        const EINVAL: i32 = 22;
        const EMFILE: i32 = 24;
        const ENOSPC: i32 = 28;
        const ENAMETOOLONG: i32 = 36;
        const ENODATA: i32 = 61;

        let code = match self {
            Self::Media { .. } | Self::Internal(_) => EIO,
            Self::IsFree { .. }
            | Self::Deleted { .. }
            | Self::NotFinalized { .. }
            | Self::NotIndex { .. }
            | Self::IsIndex { .. }
            | Self::IndexSpanMismatch { .. }
            | Self::DataSpanMismatch { .. }
            | Self::ObjectIdMismatch { .. }
            | Self::IndexRefFree { .. }
            | Self::IndexRefLookup { .. }
            | Self::IndexRefInvalid { .. }
            | Self::CheckObjIdMismatch { .. }
            | Self::CheckSpanMismatch { .. }
            | Self::CheckFlagsBad { .. }
            | Self::CheckDiverged { .. } => EIO,
            Self::Full | Self::NoFreeObjectId | Self::NoDeletedBlocks => ENOSPC,
            Self::NotAFilesystem | Self::Probe { .. } | Self::NotMounted => ENODEV,
            Self::Config { .. } => EINVAL,
            Self::NotFound => ENOENT,
            Self::ConflictingName => EEXIST,
            Self::NameTooLong { .. } => ENAMETOOLONG,
            Self::EndOfObject => ENODATA,
            Self::BadDescriptor { .. } => EBADF,
            Self::ReadOnly { .. } | Self::WriteOnly { .. } => EPERM,
            Self::TooManyOpenFiles => EMFILE,
        };
        -code
    }
}
