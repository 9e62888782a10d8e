//! Object index engine.
//!
//! An object is an index header page (span 0), zero or more plain index pages
//! (spans 1..) and its data pages. The header holds the first `H` data
//! pointers, every plain page `L` more; see [`Geometry::index_span_for`].
//!
//! Flash pages are never rewritten with different content. An index page
//! either gains pointers in slots that are still erased, which can be
//! programmed in place, or it is moved: the patched copy is written and
//! finalized on a fresh page before the old one is deleted.
//!
//! [`Geometry::index_span_for`]: flashfs_types::Geometry::index_span_for

use flashfs_error::{FlashError, Result};
use flashfs_hal::Flash;
use flashfs_types::page::PAGE_HEADER_SIZE;
use flashfs_types::{
    IndexKind, IndexView, ObjId, ObjType, PIX_NONE, PageFlags, PageHeader, PageIx, SpanIx,
    UNDEFINED_LEN,
};
use tracing::{debug, debug_span, warn};

use crate::instrumentation::IoTag;
use crate::volume::Volume;

/// Where an object's index currently lives, as known to one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectCursor {
    pub id: ObjId,
    /// Page of the index header.
    pub hdr_pix: PageIx,
    /// Last plain index page visited, as `(span, page)`.
    pub ix_cache: Option<(SpanIx, PageIx)>,
    /// Size recorded in the header; [`UNDEFINED_LEN`] until first written.
    pub size: u32,
}

impl ObjectCursor {
    #[must_use]
    pub const fn new(id: ObjId, hdr_pix: PageIx, size: u32) -> Self {
        Self {
            id,
            hdr_pix,
            ix_cache: None,
            size,
        }
    }

    /// Logical length in bytes.
    #[must_use]
    pub const fn len(&self) -> u32 {
        if self.size == UNDEFINED_LEN { 0 } else { self.size }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Follow `ev`. Returns `false` when the object is gone.
    pub(crate) fn apply(&mut self, ev: &IndexEvent) -> bool {
        match *ev {
            IndexEvent::Updated { id, span, pix, size } if id == self.id => {
                if span == 0 {
                    self.hdr_pix = pix;
                    if let Some(size) = size {
                        self.size = size;
                    }
                } else if self.ix_cache.is_some_and(|(s, _)| s == span) {
                    self.ix_cache = Some((span, pix));
                }
                true
            }
            IndexEvent::Removed { id, span } if id == self.id => {
                if span == 0 {
                    return false;
                }
                if self.ix_cache.is_some_and(|(s, _)| s == span) {
                    self.ix_cache = None;
                }
                true
            }
            _ => true,
        }
    }
}

/// Structural change broadcast to every handle of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexEvent {
    /// Index page `span` of `id` was created, moved or updated and now lives
    /// at `pix`. Header events may carry the new size.
    Updated {
        id: ObjId,
        span: SpanIx,
        pix: PageIx,
        size: Option<u32>,
    },
    /// Index page `span` of `id` was deleted; span 0 means the object is gone.
    Removed { id: ObjId, span: SpanIx },
}

/// Index page currently held in the work buffer.
#[derive(Debug, Clone, Copy)]
struct IxPage {
    span: SpanIx,
    pix: PageIx,
    /// Pointers changed since load.
    dirty: bool,
    /// A pointer that was already programmed changed; in-place writing is
    /// no longer possible.
    needs_move: bool,
}

impl IxPage {
    const fn loaded(span: SpanIx, pix: PageIx) -> Self {
        Self {
            span,
            pix,
            dirty: false,
            needs_move: false,
        }
    }
}

impl<F: Flash> Volume<F> {
    /// Read and validate the header at `pix`.
    pub(crate) fn open_cursor(&mut self, pix: PageIx) -> Result<(ObjectCursor, ObjType)> {
        if self.geo.is_out_of_range(pix) {
            return Err(FlashError::IndexRefInvalid { pix });
        }
        if self.geo.is_lookup_page(pix) {
            return Err(FlashError::IndexRefLookup { pix });
        }
        let mut buf = self.take_work();
        let res = self.open_cursor_with(pix, &mut buf);
        self.restore_work(buf);
        res
    }

    fn open_cursor_with(&mut self, pix: PageIx, buf: &mut [u8]) -> Result<(ObjectCursor, ObjType)> {
        self.store.read_page(IoTag::IX_READ, pix, buf)?;
        let hdr = PageHeader::decode(buf)?;
        let id = hdr.id();
        hdr.validate_index(pix, id, 0)?;
        if hdr.flags.is_ix_deleted() {
            return Err(FlashError::Deleted { pix });
        }
        let view = IndexView::new(IndexKind::Header, &*buf)?;
        Ok((ObjectCursor::new(id, pix, view.size()), view.obj_type()))
    }

    /// Apply `ev` to `cur` and to every open handle of the object.
    pub(crate) fn publish(&mut self, cur: &mut ObjectCursor, ev: IndexEvent) {
        cur.apply(&ev);
        self.notify(&ev);
    }

    /// Validate that `pix` is a live data page of `id` at `span_ix`.
    pub(crate) fn check_data_ref(&mut self, pix: PageIx, id: ObjId, span_ix: SpanIx) -> Result<()> {
        if pix == PIX_NONE || self.geo.is_out_of_range(pix) {
            return Err(FlashError::IndexRefInvalid { pix });
        }
        if self.geo.is_lookup_page(pix) {
            return Err(FlashError::IndexRefLookup { pix });
        }
        let hdr = self.store.read_header(IoTag::DA_READ, pix)?;
        hdr.validate_data(pix, id, span_ix)
    }

    /// Load index page `span` of `cur` into `buf` and validate it.
    fn load_index(&mut self, cur: &mut ObjectCursor, span: SpanIx, buf: &mut [u8]) -> Result<PageIx> {
        let pix = if span == 0 {
            cur.hdr_pix
        } else {
            match cur.ix_cache {
                Some((s, pix)) if s == span => pix,
                _ => self.find_by_tag_and_span(cur.id.index_tag(), span, None)?,
            }
        };
        self.store.read_page(IoTag::IX_READ, pix, buf)?;
        PageHeader::decode(buf)?.validate_index(pix, cur.id, span)?;
        if span > 0 {
            cur.ix_cache = Some((span, pix));
        }
        Ok(pix)
    }

    /// Write a new object index header with no data.
    pub(crate) fn create_object(&mut self, id: ObjId, name: &[u8], ty: ObjType) -> Result<PageIx> {
        let _span = debug_span!("create", %id).entered();
        self.gc_check(self.geo.data_page_size())?;
        let mut buf = self.take_work();
        let res = self.create_object_with(id, name, ty, &mut buf);
        self.restore_work(buf);
        let pix = res?;
        debug!(%id, pix, "created object");
        Ok(pix)
    }

    fn create_object_with(&mut self, id: ObjId, name: &[u8], ty: ObjType, buf: &mut [u8]) -> Result<PageIx> {
        let mut view = IndexView::new(IndexKind::Header, &mut *buf)?;
        view.init(PageHeader::new(id.index_tag(), 0, PageFlags::ERASED));
        view.set_size(UNDEFINED_LEN);
        view.set_obj_type(ty);
        view.set_name(name)?;
        self.alloc_full_page(buf)
    }

    /// Move the index header of `cur` to a fresh page, patching the fields
    /// given. `src` supplies the full header page (pointers included);
    /// without it the current header is loaded from media.
    pub(crate) fn update_index_header(
        &mut self,
        cur: &mut ObjectCursor,
        src: Option<&[u8]>,
        name: Option<&[u8]>,
        size: Option<u32>,
    ) -> Result<PageIx> {
        let mut buf = self.take_work();
        let res = self.update_index_header_with(cur, &mut buf, src, name, size);
        self.restore_work(buf);
        res
    }

    fn update_index_header_with(
        &mut self,
        cur: &mut ObjectCursor,
        buf: &mut [u8],
        src: Option<&[u8]>,
        name: Option<&[u8]>,
        size: Option<u32>,
    ) -> Result<PageIx> {
        let old = cur.hdr_pix;
        match src {
            Some(page) => buf.copy_from_slice(page),
            None => self.store.read_page(IoTag::IX_READ, old, buf)?,
        }
        PageHeader::decode(buf)?.validate_index(old, cur.id, 0)?;
        let mut view = IndexView::new(IndexKind::Header, &mut *buf)?;
        if let Some(name) = name {
            view.set_name(name)?;
        }
        if let Some(size) = size {
            view.set_size(size);
        }
        let new_size = view.size();
        view.set_header(PageHeader::new(cur.id.index_tag(), 0, PageFlags::ERASED));
        let new = self.alloc_full_page(buf)?;
        self.delete_page(old)?;
        debug!(id = %cur.id, old, new, size = new_size, "moved index header");
        self.publish(
            cur,
            IndexEvent::Updated {
                id: cur.id,
                span: 0,
                pix: new,
                size: Some(new_size),
            },
        );
        Ok(new)
    }

    /// Move plain index page `ix` (content in `buf`) to a fresh page.
    fn move_index_page(&mut self, cur: &mut ObjectCursor, ix: IxPage, buf: &mut [u8]) -> Result<PageIx> {
        let new = self.commit_moved_index(cur.id, ix.span, ix.pix, buf)?;
        cur.apply(&IndexEvent::Updated {
            id: cur.id,
            span: ix.span,
            pix: new,
            size: None,
        });
        Ok(new)
    }

    /// Write index page `span` of `id`, held in `buf`, to a fresh page and
    /// delete `old`. Open handles are told where it went.
    pub(crate) fn commit_moved_index(
        &mut self,
        id: ObjId,
        span: SpanIx,
        old: PageIx,
        buf: &mut [u8],
    ) -> Result<PageIx> {
        IndexView::new(IndexKind::for_span(span), &mut *buf)?
            .set_header(PageHeader::new(id.index_tag(), span, PageFlags::ERASED));
        let new = self.alloc_full_page(buf)?;
        self.delete_page(old)?;
        let size = if span == 0 {
            Some(IndexView::new(IndexKind::Header, &*buf)?.size())
        } else {
            None
        };
        self.notify(&IndexEvent::Updated {
            id,
            span,
            pix: new,
            size,
        });
        Ok(new)
    }

    /// Persist the pointer changes of `ix` without touching the size.
    fn commit_index(&mut self, cur: &mut ObjectCursor, ix: IxPage, buf: &mut [u8]) -> Result<()> {
        if !ix.dirty {
            return Ok(());
        }
        if ix.needs_move {
            if ix.span == 0 {
                self.update_index_header(cur, Some(buf), None, None)?;
            } else {
                self.move_index_page(cur, ix, buf)?;
            }
            return Ok(());
        }
        self.store.write_page(IoTag::IX_UPDATE, ix.pix, buf)?;
        self.publish(
            cur,
            IndexEvent::Updated {
                id: cur.id,
                span: ix.span,
                pix: ix.pix,
                size: None,
            },
        );
        Ok(())
    }

    fn check_extent(&self, offset: u32, len: usize) -> Result<()> {
        let max = u64::from(self.geo.data_page_size()) * u64::from(SpanIx::MAX);
        if u64::from(offset) + len as u64 > max {
            return Err(FlashError::Full);
        }
        Ok(())
    }

    // ── append ──────────────────────────────────────────────────────────

    /// Append `data` at `offset`, which must be the current end of object.
    pub(crate) fn append(&mut self, cur: &mut ObjectCursor, offset: u32, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if offset != cur.len() {
            return Err(FlashError::internal(format!(
                "append at {offset} but object {} ends at {}",
                cur.id,
                cur.len()
            )));
        }
        self.check_extent(offset, data.len())?;
        let _span = debug_span!("append", id = %cur.id, offset, len = data.len()).entered();
        let mut work = self.take_work();
        let res = self.append_with(cur, offset, data, &mut work);
        self.restore_work(work);
        res
    }

    fn append_with(
        &mut self,
        cur: &mut ObjectCursor,
        offset: u32,
        data: &[u8],
        work: &mut [u8],
    ) -> Result<usize> {
        let geo = self.geo;
        let dps = geo.data_page_size();
        let was_undefined = cur.size == UNDEFINED_LEN;
        let last_span = (!cur.is_empty()).then(|| geo.index_span_for(((cur.len() - 1) / dps) as SpanIx));

        let mut loaded: Option<IxPage> = None;
        let mut written = 0_usize;
        while written < data.len() {
            let pos = offset + written as u32;
            let spix = (pos / dps) as SpanIx;
            let page_offs = pos % dps;
            let ix_span = geo.index_span_for(spix);

            if loaded.map(|ix| ix.span) != Some(ix_span) {
                if let Some(prev) = loaded.take() {
                    self.commit_index(cur, prev, work)?;
                }
                let exists = ix_span == 0 || last_span.is_some_and(|last| ix_span <= last);
                loaded = Some(if exists {
                    let pix = self.load_index(cur, ix_span, work)?;
                    IxPage::loaded(ix_span, pix)
                } else {
                    let hdr = PageHeader::new(cur.id.index_tag(), ix_span, PageFlags::ERASED);
                    let pix = self.alloc_page(hdr, None, true)?;
                    let mut view = IndexView::new(IndexKind::Plain, &mut *work)?;
                    view.init(PageHeader::new(
                        cur.id.index_tag(),
                        ix_span,
                        PageFlags::reached(PageFlags::USED | PageFlags::INDEX | PageFlags::FINAL),
                    ));
                    cur.ix_cache = Some((ix_span, pix));
                    self.publish(
                        cur,
                        IndexEvent::Updated {
                            id: cur.id,
                            span: ix_span,
                            pix,
                            size: None,
                        },
                    );
                    IxPage::loaded(ix_span, pix)
                });
            }
            let ix = loaded
                .as_mut()
                .ok_or_else(|| FlashError::internal("no index page loaded"))?;

            let slot = geo.index_slot_for(spix);
            let chunk = ((dps - page_offs) as usize).min(data.len() - written);
            let bytes = &data[written..written + chunk];
            let mut view = IndexView::new(IndexKind::for_span(ix_span), &mut *work)?;
            if page_offs == 0 {
                let hdr = PageHeader::new(cur.id.data_tag(), spix, PageFlags::ERASED);
                let pix = self.alloc_page(hdr, Some((0, bytes)), true)?;
                if view.ptr(slot).is_some() {
                    ix.needs_move = true;
                }
                view.set_ptr(slot, Some(pix))?;
                ix.dirty = true;
            } else {
                let pix = view.ptr(slot).ok_or(FlashError::IndexRefInvalid { pix: PIX_NONE })?;
                self.check_data_ref(pix, cur.id, spix)?;
                let addr = geo.page_addr(pix) + PAGE_HEADER_SIZE as u32 + page_offs;
                self.store.write(IoTag::DA_UPDATE, addr, bytes)?;
            }
            written += chunk;
        }

        let new_len = offset + written as u32;
        let ix = loaded.ok_or_else(|| FlashError::internal("append loaded no index page"))?;
        if ix.span == 0 {
            IndexView::new(IndexKind::Header, &mut *work)?.set_size(new_len);
            if was_undefined && !ix.needs_move {
                // Size and pointers were still erased: program them in place.
                self.store.write_page(IoTag::IX_UPDATE, ix.pix, work)?;
                self.publish(
                    cur,
                    IndexEvent::Updated {
                        id: cur.id,
                        span: 0,
                        pix: ix.pix,
                        size: Some(new_len),
                    },
                );
            } else {
                self.update_index_header(cur, Some(work), None, Some(new_len))?;
            }
        } else {
            self.commit_index(cur, ix, work)?;
            self.update_index_header(cur, None, None, Some(new_len))?;
        }
        Ok(written)
    }

    // ── modify ──────────────────────────────────────────────────────────

    /// Overwrite `data` at `offset`; the range must lie within the object.
    pub(crate) fn modify(&mut self, cur: &mut ObjectCursor, offset: u32, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if u64::from(offset) + data.len() as u64 > u64::from(cur.len()) {
            return Err(FlashError::internal(format!(
                "modify of {} bytes at {offset} overruns object {} of {} bytes",
                data.len(),
                cur.id,
                cur.len()
            )));
        }
        let _span = debug_span!("modify", id = %cur.id, offset, len = data.len()).entered();
        let mut work = self.take_work();
        let res = self.modify_with(cur, offset, data, &mut work);
        self.restore_work(work);
        res
    }

    fn modify_with(
        &mut self,
        cur: &mut ObjectCursor,
        offset: u32,
        data: &[u8],
        work: &mut [u8],
    ) -> Result<usize> {
        let geo = self.geo;
        let dps = geo.data_page_size();
        let hs = PAGE_HEADER_SIZE as u32;

        let mut loaded: Option<IxPage> = None;
        let mut written = 0_usize;
        while written < data.len() {
            let pos = offset + written as u32;
            let spix = (pos / dps) as SpanIx;
            let page_offs = pos % dps;
            let ix_span = geo.index_span_for(spix);

            if loaded.map(|ix| ix.span) != Some(ix_span) {
                if let Some(prev) = loaded.take() {
                    self.commit_index(cur, prev, work)?;
                }
                let pix = self.load_index(cur, ix_span, work)?;
                loaded = Some(IxPage::loaded(ix_span, pix));
            }
            let ix = loaded
                .as_mut()
                .ok_or_else(|| FlashError::internal("no index page loaded"))?;

            let slot = geo.index_slot_for(spix);
            let chunk = ((dps - page_offs) as usize).min(data.len() - written);
            let bytes = &data[written..written + chunk];
            let mut view = IndexView::new(IndexKind::for_span(ix_span), &mut *work)?;
            let orig = view.ptr(slot).ok_or(FlashError::IndexRefInvalid { pix: PIX_NONE })?;
            self.check_data_ref(orig, cur.id, spix)?;

            let hdr = PageHeader::new(cur.id.data_tag(), spix, PageFlags::ERASED);
            let new = if page_offs == 0 && chunk == dps as usize {
                self.alloc_page(hdr, Some((0, bytes)), true)?
            } else {
                let new = self.alloc_page(hdr, None, false)?;
                let (src, dst) = (geo.page_addr(orig) + hs, geo.page_addr(new) + hs);
                if page_offs > 0 {
                    self.store.copy(IoTag::DA_MOVE, dst, src, page_offs)?;
                }
                self.store.write(IoTag::DA_UPDATE, dst + page_offs, bytes)?;
                let tail = page_offs + chunk as u32;
                if tail < dps {
                    self.store.copy(IoTag::DA_MOVE, dst + tail, src + tail, dps - tail)?;
                }
                self.store
                    .reach_flags(IoTag::DA_UPDATE, new, PageFlags::FINAL)?;
                new
            };
            self.delete_page(orig)?;
            view.set_ptr(slot, Some(new))?;
            ix.dirty = true;
            ix.needs_move = true;
            written += chunk;
        }
        if let Some(ix) = loaded {
            self.commit_index(cur, ix, work)?;
        }
        Ok(written)
    }

    // ── read ────────────────────────────────────────────────────────────

    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at or past the end.
    pub(crate) fn read_object(&mut self, cur: &mut ObjectCursor, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let len = cur.len();
        if buf.is_empty() {
            return if len == 0 { Err(FlashError::EndOfObject) } else { Ok(0) };
        }
        if offset >= len {
            return Ok(0);
        }
        let n = buf.len().min((len - offset) as usize);
        let mut work = self.take_work();
        let res = self.read_with(cur, offset, &mut buf[..n], &mut work);
        self.restore_work(work);
        res.map(|()| n)
    }

    fn read_with(&mut self, cur: &mut ObjectCursor, offset: u32, dst: &mut [u8], work: &mut [u8]) -> Result<()> {
        let geo = self.geo;
        let dps = geo.data_page_size();
        let mut loaded: Option<SpanIx> = None;
        let mut done = 0_usize;
        while done < dst.len() {
            let pos = offset + done as u32;
            let spix = (pos / dps) as SpanIx;
            let page_offs = pos % dps;
            let ix_span = geo.index_span_for(spix);
            if loaded != Some(ix_span) {
                self.load_index(cur, ix_span, work)?;
                loaded = Some(ix_span);
            }
            let view = IndexView::new(IndexKind::for_span(ix_span), &*work)?;
            let pix = view
                .ptr(geo.index_slot_for(spix))
                .ok_or(FlashError::IndexRefInvalid { pix: PIX_NONE })?;
            self.check_data_ref(pix, cur.id, spix)?;
            let chunk = ((dps - page_offs) as usize).min(dst.len() - done);
            let addr = geo.page_addr(pix) + PAGE_HEADER_SIZE as u32 + page_offs;
            self.store
                .read(IoTag::DA_READ, addr, &mut dst[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    // ── truncate ────────────────────────────────────────────────────────

    /// Shrink `cur` to `new_size`. With `remove_fully` the whole object is
    /// deleted, header included.
    pub(crate) fn truncate_object(&mut self, cur: &mut ObjectCursor, new_size: u32, remove_fully: bool) -> Result<()> {
        if !remove_fully && new_size >= cur.len() {
            return Ok(());
        }
        let _span = debug_span!("truncate", id = %cur.id, new_size, remove_fully).entered();
        if !remove_fully {
            // boundary page rewrite plus header move
            self.gc_for_cursor(cur, 2 * self.geo.data_page_size())?;
        }
        let mut work = self.take_work();
        let res = self.truncate_with(cur, new_size, remove_fully, &mut work);
        self.restore_work(work);
        res
    }

    /// Make room for `len` bytes on behalf of `cur`. Cleaning may move its
    /// index pages, so the cursor is resolved again when a block was erased.
    fn gc_for_cursor(&mut self, cur: &mut ObjectCursor, len: u32) -> Result<()> {
        let erases = self.store.metrics().erases;
        self.gc_check(len)?;
        if self.store.metrics().erases != erases {
            cur.hdr_pix = self.find_by_tag_and_span(cur.id.index_tag(), 0, None)?;
            cur.ix_cache = None;
        }
        Ok(())
    }

    fn truncate_with(
        &mut self,
        cur: &mut ObjectCursor,
        new_size: u32,
        remove_fully: bool,
        work: &mut [u8],
    ) -> Result<()> {
        let geo = self.geo;
        let dps = geo.data_page_size();
        let hs = PAGE_HEADER_SIZE as u32;
        if remove_fully {
            self.store
                .reach_flags(IoTag::IX_UPDATE, cur.hdr_pix, PageFlags::IXDELETE)?;
        }
        let target = if remove_fully { 0 } else { new_size };

        let mut cur_size = cur.len();
        let mut loaded: Option<IxPage> = None;
        while cur_size > target {
            let spix = ((cur_size - 1) / dps) as SpanIx;
            let ix_span = geo.index_span_for(spix);

            if loaded.map(|ix| ix.span) != Some(ix_span) {
                if let Some(prev) = loaded.take() {
                    // Walking backwards past a plain page means all of its
                    // pointers were cleared.
                    self.delete_page(prev.pix)?;
                    self.publish(cur, IndexEvent::Removed { id: cur.id, span: prev.span });
                    if !remove_fully {
                        self.update_index_header(cur, None, None, Some(cur_size))?;
                    }
                }
                match self.load_index(cur, ix_span, work) {
                    Ok(pix) => loaded = Some(IxPage::loaded(ix_span, pix)),
                    Err(FlashError::NotFound) if remove_fully && ix_span > 0 => {
                        warn!(id = %cur.id, span = ix_span, "index page missing while removing object");
                        cur_size = geo.first_data_span(ix_span) * dps;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            let ix = loaded
                .as_mut()
                .ok_or_else(|| FlashError::internal("no index page loaded"))?;

            let slot = geo.index_slot_for(spix);
            let page_start = u32::from(spix) * dps;
            let mut view = IndexView::new(IndexKind::for_span(ix_span), &mut *work)?;
            let data_pix = view.ptr(slot);
            if target <= page_start {
                if let Some(pix) = data_pix {
                    match self.check_data_ref(pix, cur.id, spix) {
                        Ok(()) => self.delete_page(pix)?,
                        Err(err) if err.is_structural() => {
                            warn!(pix, %err, "dropping reference to invalid data page");
                        }
                        Err(err) => return Err(err),
                    }
                }
                view.set_ptr(slot, None)?;
                cur_size = page_start;
            } else {
                let keep = target - page_start;
                let orig = data_pix.ok_or(FlashError::IndexRefInvalid { pix: PIX_NONE })?;
                self.check_data_ref(orig, cur.id, spix)?;
                let hdr = PageHeader::new(cur.id.data_tag(), spix, PageFlags::ERASED);
                let new = self.alloc_page(hdr, None, false)?;
                self.store.copy(
                    IoTag::DA_MOVE,
                    geo.page_addr(new) + hs,
                    geo.page_addr(orig) + hs,
                    keep,
                )?;
                self.store
                    .reach_flags(IoTag::DA_UPDATE, new, PageFlags::FINAL)?;
                self.delete_page(orig)?;
                view.set_ptr(slot, Some(new))?;
                cur_size = target;
            }
            ix.dirty = true;
            ix.needs_move = true;
        }

        let header_in_work = loaded.is_some_and(|ix| ix.span == 0);
        if let Some(ix) = loaded.filter(|ix| ix.span > 0) {
            if cur_size <= geo.first_data_span(ix.span) * dps {
                self.delete_page(ix.pix)?;
                self.publish(cur, IndexEvent::Removed { id: cur.id, span: ix.span });
            } else {
                self.move_index_page(cur, ix, work)?;
            }
        }

        if remove_fully {
            let hdr_pix = cur.hdr_pix;
            self.delete_page(hdr_pix)?;
            debug!(id = %cur.id, hdr_pix, "removed object");
            self.publish(cur, IndexEvent::Removed { id: cur.id, span: 0 });
            return Ok(());
        }
        let stored = if cur_size == 0 { UNDEFINED_LEN } else { cur_size };
        let src = if header_in_work { Some(&*work) } else { None };
        self.update_index_header(cur, src, None, Some(stored))?;
        Ok(())
    }
}
