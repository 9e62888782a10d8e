//! Page header and flag bits.
//!
//! Flags use erase logic: a set bit means "not yet in this state". Writing a
//! state therefore only ever clears bits, which NOR media allows without an
//! erase.

use bitflags::bitflags;
use flashfs_error::{FlashError, Result};

use crate::{OBJ_ID_IX_FLAG, ObjId, ObjTag, PageIx, SpanIx};

/// Encoded size of [`PageHeader`].
pub const PAGE_HEADER_SIZE: usize = 5;
/// Byte offset of the flags field inside the header.
pub const PAGE_FLAGS_OFFSET: usize = 4;

bitflags! {
    /// Page header flags. A *set* bit means the state has not been reached.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u8 {
        /// Cleared once the page is in use.
        const USED = 1 << 0;
        /// Cleared once the page content is final.
        const FINAL = 1 << 1;
        /// Cleared on index pages.
        const INDEX = 1 << 2;
        /// Cleared on an index header whose object deletion has begun.
        const IXDELETE = 1 << 6;
        /// Cleared once the page is deleted.
        const DELETED = 1 << 7;
    }
}

impl PageFlags {
    /// Flags of an erased page.
    pub const ERASED: Self = Self::from_bits_retain(0xFF);

    /// Flags with the given states reached (bits cleared).
    #[must_use]
    pub const fn reached(states: Self) -> Self {
        Self::from_bits_retain(0xFF & !states.bits())
    }

    #[must_use]
    pub const fn is_used(self) -> bool {
        !self.contains(Self::USED)
    }

    #[must_use]
    pub const fn is_final(self) -> bool {
        !self.contains(Self::FINAL)
    }

    #[must_use]
    pub const fn is_index(self) -> bool {
        !self.contains(Self::INDEX)
    }

    #[must_use]
    pub const fn is_deleted(self) -> bool {
        !self.contains(Self::DELETED)
    }

    #[must_use]
    pub const fn is_ix_deleted(self) -> bool {
        !self.contains(Self::IXDELETE)
    }

    /// Used, finalized and not deleted.
    #[must_use]
    pub const fn is_live_final(self) -> bool {
        self.is_used() && self.is_final() && !self.is_deleted()
    }

    /// Return a copy with `states` reached.
    #[must_use]
    pub const fn reach(self, states: Self) -> Self {
        Self::from_bits_retain(self.bits() & !states.bits())
    }
}

/// Header at the start of every non-lookup page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHeader {
    /// Raw object id including the index bit.
    pub obj_id: u16,
    /// Span index (data ordinal for data pages, index ordinal for index pages).
    pub span_ix: SpanIx,
    pub flags: PageFlags,
}

impl PageHeader {
    #[must_use]
    pub const fn new(tag: ObjTag, span_ix: SpanIx, flags: PageFlags) -> Self {
        Self {
            obj_id: tag.raw(),
            span_ix,
            flags,
        }
    }

    /// Header of an erased page.
    #[must_use]
    pub const fn erased() -> Self {
        Self {
            obj_id: 0xFFFF,
            span_ix: 0xFFFF,
            flags: PageFlags::ERASED,
        }
    }

    #[must_use]
    pub const fn tag(&self) -> ObjTag {
        ObjTag::from_raw(self.obj_id)
    }

    #[must_use]
    pub const fn id(&self) -> ObjId {
        ObjId::new(self.obj_id)
    }

    /// Little-endian wire encoding.
    #[must_use]
    pub fn encode(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut out = [0_u8; PAGE_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.obj_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.span_ix.to_le_bytes());
        out[PAGE_FLAGS_OFFSET] = self.flags.bits();
        out
    }

    /// Decode from at least [`PAGE_HEADER_SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(FlashError::internal(format!(
                "page header needs {PAGE_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            obj_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            span_ix: u16::from_le_bytes([bytes[2], bytes[3]]),
            flags: PageFlags::from_bits_retain(bytes[PAGE_FLAGS_OFFSET]),
        })
    }

    /// Validate this header as a live, final index page of `id` at `span_ix`.
    pub fn validate_index(&self, pix: PageIx, id: ObjId, span_ix: SpanIx) -> Result<()> {
        let flags = self.flags;
        if !flags.is_used() {
            return Err(FlashError::IsFree { pix });
        }
        if flags.is_deleted() {
            return Err(FlashError::Deleted { pix });
        }
        if !flags.is_final() {
            return Err(FlashError::NotFinalized { pix });
        }
        if !flags.is_index() || self.obj_id & OBJ_ID_IX_FLAG == 0 {
            return Err(FlashError::NotIndex { pix });
        }
        if self.id() != id {
            return Err(FlashError::ObjectIdMismatch {
                pix,
                expected: id.get(),
                found: self.id().get(),
            });
        }
        if self.span_ix != span_ix {
            return Err(FlashError::IndexSpanMismatch {
                pix,
                expected: span_ix,
                found: self.span_ix,
            });
        }
        Ok(())
    }

    /// Validate this header as a live, final data page of `id` at `span_ix`.
    pub fn validate_data(&self, pix: PageIx, id: ObjId, span_ix: SpanIx) -> Result<()> {
        let flags = self.flags;
        if !flags.is_used() {
            return Err(FlashError::IsFree { pix });
        }
        if flags.is_deleted() {
            return Err(FlashError::Deleted { pix });
        }
        if !flags.is_final() {
            return Err(FlashError::NotFinalized { pix });
        }
        if flags.is_index() || self.obj_id & OBJ_ID_IX_FLAG != 0 {
            return Err(FlashError::IsIndex { pix });
        }
        if self.id() != id {
            return Err(FlashError::ObjectIdMismatch {
                pix,
                expected: id.get(),
                found: self.id().get(),
            });
        }
        if self.span_ix != span_ix {
            return Err(FlashError::DataSpanMismatch {
                pix,
                expected: span_ix,
                found: self.span_ix,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_wire_layout() {
        let hdr = PageHeader::new(
            ObjId::new(0x0102).index_tag(),
            0x0304,
            PageFlags::reached(PageFlags::USED | PageFlags::INDEX),
        );
        let bytes = hdr.encode();
        assert_eq!(bytes, [0x02, 0x81, 0x04, 0x03, 0b1111_1010]);
        assert_eq!(PageHeader::decode(&bytes).expect("decode"), hdr);
    }

    #[test]
    fn erased_header_is_free() {
        let hdr = PageHeader::decode(&[0xFF; 5]).expect("decode");
        assert_eq!(hdr, PageHeader::erased());
        assert!(!hdr.flags.is_used());
        assert!(matches!(
            hdr.validate_data(7, ObjId::new(1), 0),
            Err(FlashError::IsFree { pix: 7 })
        ));
    }

    #[test]
    fn validation_order() {
        let id = ObjId::new(3);
        let live = PageFlags::reached(PageFlags::USED | PageFlags::FINAL);
        let data = PageHeader::new(id.data_tag(), 2, live);
        assert!(data.validate_data(1, id, 2).is_ok());
        assert!(matches!(
            data.validate_data(1, id, 1),
            Err(FlashError::DataSpanMismatch { expected: 1, found: 2, .. })
        ));
        assert!(matches!(
            data.validate_index(1, id, 2),
            Err(FlashError::NotIndex { .. })
        ));

        let unfinished = PageHeader::new(id.data_tag(), 2, PageFlags::reached(PageFlags::USED));
        assert!(matches!(
            unfinished.validate_data(1, id, 2),
            Err(FlashError::NotFinalized { .. })
        ));

        let deleted = PageHeader::new(id.data_tag(), 2, live.reach(PageFlags::DELETED));
        assert!(matches!(
            deleted.validate_data(1, id, 2),
            Err(FlashError::Deleted { .. })
        ));
    }
}
