//! On-disk vocabulary shared by the flashfs nucleus.
//!
//! Layout of one erase block:
//!
//! ```text
//! +-------------------------+  block start
//! | lookup page 0           |  u16 slot per data page (LE)
//! | ...                     |
//! | lookup page N-1         |  last two slots: magic, erase count
//! +-------------------------+
//! | data page 0             |  PageHeader (5 bytes) + body
//! | ...                     |
//! +-------------------------+  block end
//! ```
//!
//! Raw object ids are 16 bits on disk. The top bit marks index pages, the
//! remaining 15 bits name the object. `0xFFFF` is an erased (free) slot and
//! `0x0000` a deleted one.

pub mod config;
pub mod geometry;
pub mod index;
pub mod page;

pub use config::VolumeConfig;
pub use geometry::Geometry;
pub use index::{IndexKind, IndexView, ObjType};
pub use page::{PageFlags, PageHeader};

pub use flashfs_error::PageIx;

use serde::Serialize;

/// Block index.
pub type BlockIx = u16;
/// Span index: data-page ordinal or index-page ordinal within an object.
pub type SpanIx = u16;

/// Top bit of a raw id marks an index page.
pub const OBJ_ID_IX_FLAG: u16 = 0x8000;
/// Raw id of an erased lookup slot.
pub const OBJ_ID_FREE: u16 = 0xFFFF;
/// Raw id of a deleted lookup slot.
pub const OBJ_ID_DELETED: u16 = 0x0000;
/// Index pointer value meaning "no data page".
pub const PIX_NONE: PageIx = 0xFFFF;
/// Object size sentinel for an object that was never written.
pub const UNDEFINED_LEN: u32 = u32::MAX;
/// Fixed on-disk name field length.
pub const NAME_MAX: usize = 32;
/// Base value mixed into the per-block magic.
pub const MAGIC_BASE: u32 = 0x2014_0529;

/// A 15-bit object identifier (`1..=0x7FFE` for live objects).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ObjId(u16);

impl ObjId {
    /// Wrap a raw value, stripping the index bit.
    #[inline]
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw & !OBJ_ID_IX_FLAG)
    }

    /// The 15-bit value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Raw tag naming this object's data pages.
    #[inline]
    #[must_use]
    pub const fn data_tag(self) -> ObjTag {
        ObjTag(self.0)
    }

    /// Raw tag naming this object's index pages.
    #[inline]
    #[must_use]
    pub const fn index_tag(self) -> ObjTag {
        ObjTag(self.0 | OBJ_ID_IX_FLAG)
    }
}

impl std::fmt::Display for ObjId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// A raw on-disk object id including the index bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjTag(u16);

impl ObjTag {
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn id(self) -> ObjId {
        ObjId::new(self.0)
    }

    /// True when the tag names an index page.
    #[inline]
    #[must_use]
    pub const fn is_index(self) -> bool {
        self.0 & OBJ_ID_IX_FLAG != 0
    }

    /// Same object, index flavour.
    #[inline]
    #[must_use]
    pub const fn as_index(self) -> Self {
        Self(self.0 | OBJ_ID_IX_FLAG)
    }

    /// Same object, data flavour.
    #[inline]
    #[must_use]
    pub const fn as_data(self) -> Self {
        Self(self.0 & !OBJ_ID_IX_FLAG)
    }
}

/// Decoded lookup-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupEntry {
    /// Erased slot, the data page is free.
    Free,
    /// The data page was deleted and awaits garbage collection.
    Deleted,
    /// The data page belongs to this object (index bit included).
    Object(ObjTag),
}

impl LookupEntry {
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        match raw {
            OBJ_ID_FREE => Self::Free,
            OBJ_ID_DELETED => Self::Deleted,
            other => Self::Object(ObjTag::from_raw(other)),
        }
    }

    #[must_use]
    pub const fn to_raw(self) -> u16 {
        match self {
            Self::Free => OBJ_ID_FREE,
            Self::Deleted => OBJ_ID_DELETED,
            Self::Object(tag) => tag.raw(),
        }
    }

    /// The object tag when the slot is busy.
    #[must_use]
    pub const fn tag(self) -> Option<ObjTag> {
        match self {
            Self::Object(tag) => Some(tag),
            Self::Free | Self::Deleted => None,
        }
    }
}
