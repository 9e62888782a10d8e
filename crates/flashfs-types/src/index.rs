//! Typed views over object index pages.
//!
//! Header page body (offsets from page start):
//!
//! ```text
//!  0  PageHeader (5 bytes)      5  padding (3)
//!  8  size: u32 LE             12  type: u8
//! 13  name: [u8; NAME_MAX]     45  padding (1)
//! 46  data page pointers: u16 LE ...
//! ```
//!
//! A plain index page carries the header, three padding bytes and the pointer
//! array from offset 8.

use flashfs_error::{FlashError, Result};
use serde::Serialize;

use crate::page::{PAGE_HEADER_SIZE, PageHeader};
use crate::{NAME_MAX, PIX_NONE, PageIx, SpanIx, UNDEFINED_LEN};

pub const SIZE_OFFSET: usize = 8;
pub const TYPE_OFFSET: usize = 12;
pub const NAME_OFFSET: usize = 13;
/// First pointer of an index header page.
pub const HEADER_PTR_OFFSET: usize = 46;
/// First pointer of a plain index page.
pub const PLAIN_PTR_OFFSET: usize = 8;
/// Longest storable name; the field keeps room for a terminating NUL.
pub const NAME_LEN_MAX: usize = NAME_MAX - 1;

/// Which layout an index page uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Span 0: metadata plus the first pointers.
    Header,
    /// Spans 1..: pointers only.
    Plain,
}

impl IndexKind {
    #[must_use]
    pub const fn for_span(span_ix: SpanIx) -> Self {
        if span_ix == 0 { Self::Header } else { Self::Plain }
    }

    #[must_use]
    pub const fn ptr_offset(self) -> usize {
        match self {
            Self::Header => HEADER_PTR_OFFSET,
            Self::Plain => PLAIN_PTR_OFFSET,
        }
    }
}

/// Object type tag stored in the index header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ObjType {
    File,
    Other(u8),
}

impl ObjType {
    #[must_use]
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::File,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::File => 1,
            Self::Other(raw) => raw,
        }
    }
}

/// Bounds-checked accessors over one index page buffer.
///
/// `B` is `&[u8]` for read-only inspection or `&mut [u8]`/`Vec<u8>` when the
/// page is being built in a work buffer.
#[derive(Debug, Clone)]
pub struct IndexView<B> {
    kind: IndexKind,
    buf: B,
}

impl<B: AsRef<[u8]>> IndexView<B> {
    /// Wrap `buf`, which must hold at least the fixed part of `kind`.
    pub fn new(kind: IndexKind, buf: B) -> Result<Self> {
        let len = buf.as_ref().len();
        if len < kind.ptr_offset() + 2 {
            return Err(FlashError::internal(format!(
                "index buffer of {len} bytes too small for {kind:?}"
            )));
        }
        Ok(Self { kind, buf })
    }

    #[must_use]
    pub const fn kind(&self) -> IndexKind {
        self.kind
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    pub fn into_inner(self) -> B {
        self.buf
    }

    pub fn header(&self) -> Result<PageHeader> {
        PageHeader::decode(self.bytes())
    }

    /// Pointer slots available on this page.
    #[must_use]
    pub fn ptr_count(&self) -> usize {
        (self.bytes().len() - self.kind.ptr_offset()) / 2
    }

    /// Data page at `slot`, `None` when unset.
    #[must_use]
    pub fn ptr(&self, slot: usize) -> Option<PageIx> {
        let at = self.kind.ptr_offset() + slot * 2;
        let raw = self.bytes().get(at..at + 2)?;
        match u16::from_le_bytes([raw[0], raw[1]]) {
            PIX_NONE => None,
            pix => Some(pix),
        }
    }

    /// Iterate `(slot, page)` over every set pointer.
    pub fn ptrs(&self) -> impl Iterator<Item = (usize, PageIx)> + '_ {
        (0..self.ptr_count()).filter_map(|slot| self.ptr(slot).map(|pix| (slot, pix)))
    }

    /// Object size; [`UNDEFINED_LEN`] while never written. Header pages only.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.read_u32(SIZE_OFFSET)
    }

    /// `None` for an object that was never written.
    #[must_use]
    pub fn defined_size(&self) -> Option<u32> {
        match self.size() {
            UNDEFINED_LEN => None,
            n => Some(n),
        }
    }

    #[must_use]
    pub fn obj_type(&self) -> ObjType {
        ObjType::from_u8(self.bytes()[TYPE_OFFSET])
    }

    /// Stored name, up to the first NUL or erased byte.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        let field = &self.bytes()[NAME_OFFSET..NAME_OFFSET + NAME_MAX];
        let end = field
            .iter()
            .position(|&b| b == 0 || b == 0xFF)
            .unwrap_or(NAME_MAX);
        &field[..end]
    }

    fn read_u32(&self, at: usize) -> u32 {
        let b = &self.bytes()[at..at + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> IndexView<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Reset to an erased page with `hdr`.
    pub fn init(&mut self, hdr: PageHeader) {
        let bytes = self.bytes_mut();
        bytes.fill(0xFF);
        bytes[..PAGE_HEADER_SIZE].copy_from_slice(&hdr.encode());
    }

    pub fn set_header(&mut self, hdr: PageHeader) {
        self.bytes_mut()[..PAGE_HEADER_SIZE].copy_from_slice(&hdr.encode());
    }

    pub fn set_ptr(&mut self, slot: usize, pix: Option<PageIx>) -> Result<()> {
        let at = self.kind.ptr_offset() + slot * 2;
        let raw = pix.unwrap_or(PIX_NONE).to_le_bytes();
        let dst = self.bytes_mut().get_mut(at..at + 2).ok_or_else(|| {
            FlashError::internal(format!("index slot {slot} out of range"))
        })?;
        dst.copy_from_slice(&raw);
        Ok(())
    }

    /// Clear every pointer from `slot` onwards.
    pub fn clear_ptrs_from(&mut self, slot: usize) {
        let at = self.kind.ptr_offset() + slot * 2;
        if let Some(tail) = self.bytes_mut().get_mut(at..) {
            tail.fill(0xFF);
        }
    }

    pub fn set_size(&mut self, size: u32) {
        self.bytes_mut()[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&size.to_le_bytes());
    }

    pub fn set_obj_type(&mut self, ty: ObjType) {
        self.bytes_mut()[TYPE_OFFSET] = ty.to_u8();
    }

    /// Store `name`, NUL padded.
    pub fn set_name(&mut self, name: &[u8]) -> Result<()> {
        check_name(name)?;
        let field = &mut self.bytes_mut()[NAME_OFFSET..NAME_OFFSET + NAME_MAX];
        field.fill(0);
        field[..name.len()].copy_from_slice(name);
        Ok(())
    }
}

/// Reject names that do not fit the on-disk field.
pub fn check_name(name: &[u8]) -> Result<()> {
    if name.len() > NAME_LEN_MAX {
        return Err(FlashError::NameTooLong {
            len: name.len(),
            max: NAME_LEN_MAX,
        });
    }
    if name.contains(&0) {
        return Err(FlashError::config("name contains a NUL byte"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageFlags;
    use crate::ObjId;

    #[test]
    fn header_fields_land_at_fixed_offsets() {
        let mut view = IndexView::new(IndexKind::Header, vec![0_u8; 256]).expect("view");
        let hdr = PageHeader::new(
            ObjId::new(7).index_tag(),
            0,
            PageFlags::reached(PageFlags::USED | PageFlags::INDEX),
        );
        view.init(hdr);
        view.set_size(UNDEFINED_LEN);
        view.set_obj_type(ObjType::File);
        view.set_name(b"a.txt").expect("name fits");
        view.set_ptr(2, Some(0x0123)).expect("slot");

        let bytes = view.bytes();
        assert_eq!(&bytes[SIZE_OFFSET..SIZE_OFFSET + 4], &[0xFF; 4]);
        assert_eq!(bytes[TYPE_OFFSET], 1);
        assert_eq!(&bytes[NAME_OFFSET..NAME_OFFSET + 6], b"a.txt\0");
        assert_eq!(&bytes[HEADER_PTR_OFFSET + 4..HEADER_PTR_OFFSET + 6], &[0x23, 0x01]);
        assert_eq!(view.name(), b"a.txt");
        assert_eq!(view.defined_size(), None);
        assert_eq!(view.ptr(0), None);
        assert_eq!(view.ptr(2), Some(0x0123));
        assert_eq!(view.ptrs().collect::<Vec<_>>(), vec![(2, 0x0123)]);
        assert_eq!(view.ptr_count(), (256 - 46) / 2);
    }

    #[test]
    fn plain_pointers_start_after_padding() {
        let mut buf = [0xFF_u8; 64];
        let mut view = IndexView::new(IndexKind::Plain, &mut buf[..]).expect("view");
        view.set_ptr(0, Some(9)).expect("slot");
        assert_eq!(view.ptr_count(), 28);
        assert!(view.set_ptr(28, Some(1)).is_err());
        view.clear_ptrs_from(0);
        assert_eq!(view.ptr(0), None);
        assert_eq!(&buf[PLAIN_PTR_OFFSET..PLAIN_PTR_OFFSET + 2], &[0xFF, 0xFF]);
    }

    #[test]
    fn overlong_name_is_rejected() {
        let mut view = IndexView::new(IndexKind::Header, vec![0xFF_u8; 256]).expect("view");
        let long = [b'x'; NAME_MAX];
        assert!(matches!(
            view.set_name(&long),
            Err(FlashError::NameTooLong { len: 32, max: 31 })
        ));
        assert!(view.set_name(&long[..NAME_LEN_MAX]).is_ok());
        assert_eq!(view.name().len(), NAME_LEN_MAX);
    }
}
