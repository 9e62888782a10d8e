//! Object lookup table: scanning, searching and the two-step page
//! claim/release discipline.
//!
//! Claiming a page writes the lookup entry first and the page header second;
//! releasing marks the lookup entry deleted first and the header second. A
//! crash between the two steps leaves a disagreement the checker repairs.

use flashfs_error::{FlashError, Result};
use flashfs_hal::Flash;
use flashfs_types::page::PAGE_HEADER_SIZE;
use flashfs_types::{BlockIx, LookupEntry, ObjTag, PageFlags, PageHeader, PageIx, SpanIx};
use tracing::{debug, trace};

use crate::instrumentation::{IoCmd, IoTag};
use crate::volume::Volume;

/// Position of one lookup entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LookupPos {
    pub(crate) bix: BlockIx,
    pub(crate) entry: u32,
}

impl LookupPos {
    pub(crate) const START: Self = Self { bix: 0, entry: 0 };
}

/// Verdict of a lookup visitor.
pub(crate) enum Visit<T> {
    Continue,
    /// Continue, but reread the lookup page first; the visitor wrote to it.
    Reload,
    Stop(T),
}

impl<F: Flash> Volume<F> {
    /// Visit lookup entries from `start` onwards.
    ///
    /// Without `wrap` the scan ends after the last block; with it the scan
    /// continues from block 0 until every entry has been visited exactly once.
    pub(crate) fn scan_lookup<T>(
        &mut self,
        start: LookupPos,
        wrap: bool,
        mut visit: impl FnMut(&mut Self, LookupPos, LookupEntry) -> Result<Visit<T>>,
    ) -> Result<Option<T>> {
        let mut buf = self.take_lu_work();
        let out = self.scan_lookup_with(&mut buf, start, wrap, &mut visit);
        self.restore_lu_work(buf);
        out
    }

    fn scan_lookup_with<T>(
        &mut self,
        buf: &mut [u8],
        start: LookupPos,
        wrap: bool,
        visit: &mut impl FnMut(&mut Self, LookupPos, LookupEntry) -> Result<Visit<T>>,
    ) -> Result<Option<T>> {
        let blocks = self.geo.block_count();
        let epb = self.geo.entries_per_block();
        let epp = self.geo.entries_per_lookup_page();
        let start_bix = u32::from(start.bix).min(blocks - 1);
        let start_entry = start.entry.min(epb);

        let steps = if wrap { blocks + 1 } else { blocks - start_bix };
        for step in 0..steps {
            let bix = ((start_bix + step) % blocks) as BlockIx;
            let (from, to) = match step {
                0 => (start_entry, epb),
                s if s == blocks => (0, start_entry),
                _ => (0, epb),
            };
            let mut loaded: Option<u32> = None;
            for entry in from..to {
                let lpage = entry / epp;
                if loaded != Some(lpage) {
                    self.store.read_lookup_page(bix, lpage, buf)?;
                    loaded = Some(lpage);
                }
                let at = ((entry % epp) * 2) as usize;
                let raw = u16::from_le_bytes([buf[at], buf[at + 1]]);
                let pos = LookupPos { bix, entry };
                match visit(self, pos, LookupEntry::from_raw(raw))? {
                    Visit::Continue => {}
                    Visit::Reload => loaded = None,
                    Visit::Stop(found) => return Ok(Some(found)),
                }
            }
        }
        Ok(None)
    }

    /// Find a free lookup entry, starting at the free cursor.
    ///
    /// Runs a quick GC first when fewer than two free blocks remain outside
    /// of garbage collection.
    pub(crate) fn find_free_entry(&mut self) -> Result<LookupPos> {
        if !self.cleaning && self.stats.free_blocks < 2 {
            match self.gc_quick(0) {
                Ok(()) | Err(FlashError::NoDeletedBlocks) => {}
                Err(err) => return Err(err),
            }
            if self.stats.free_blocks < 2 {
                return Err(FlashError::Full);
            }
        }
        let skip = self.gc_block;
        let found = self.scan_lookup(self.free_cursor, true, |_, pos, entry| {
            Ok(if entry == LookupEntry::Free && Some(pos.bix) != skip {
                Visit::Stop(pos)
            } else {
                Visit::Continue
            })
        })?;
        found.ok_or(FlashError::Full)
    }

    /// First lookup entry carrying `tag`.
    pub(crate) fn find_by_tag(&mut self, tag: ObjTag, start: LookupPos) -> Result<LookupPos> {
        self.scan_lookup(start, true, |_, pos, entry| {
            Ok(if entry == LookupEntry::Object(tag) {
                Visit::Stop(pos)
            } else {
                Visit::Continue
            })
        })?
        .ok_or(FlashError::NotFound)
    }

    /// Live, final page of `tag` at `span_ix`, skipping `exclude`.
    ///
    /// The lookup entry selects candidates, the page header confirms them.
    /// Index headers whose deletion has begun do not count.
    pub(crate) fn find_by_tag_and_span(
        &mut self,
        tag: ObjTag,
        span_ix: SpanIx,
        exclude: Option<PageIx>,
    ) -> Result<PageIx> {
        let geo = self.geo;
        self.scan_lookup(LookupPos::START, false, |vol, pos, entry| {
            if entry != LookupEntry::Object(tag) {
                return Ok(Visit::Continue);
            }
            let pix = geo.entry_to_page(pos.bix, pos.entry);
            if Some(pix) == exclude {
                return Ok(Visit::Continue);
            }
            let hdr = vol
                .store
                .read_header(IoTag::for_page(tag.is_index(), IoCmd::Read), pix)?;
            Ok(if header_matches(&hdr, tag, span_ix) {
                Visit::Stop(pix)
            } else {
                Visit::Continue
            })
        })?
        .ok_or(FlashError::NotFound)
    }

    /// Like [`Self::find_by_tag_and_span`] but reads every page header and
    /// ignores the lookup table, for when the table itself is suspect.
    pub(crate) fn find_by_header(
        &mut self,
        tag: ObjTag,
        span_ix: SpanIx,
        exclude: Option<PageIx>,
    ) -> Result<PageIx> {
        let geo = self.geo;
        for bix in 0..geo.block_count() as BlockIx {
            for entry in 0..geo.entries_per_block() {
                let pix = geo.entry_to_page(bix, entry);
                if Some(pix) == exclude {
                    continue;
                }
                let hdr = self.store.read_header(IoTag::for_page(tag.is_index(), IoCmd::Read), pix)?;
                if header_matches(&hdr, tag, span_ix) {
                    return Ok(pix);
                }
            }
        }
        Err(FlashError::NotFound)
    }

    /// Claim a free page for `hdr` and write it.
    ///
    /// `body` is written right after the header. The page is finalized when
    /// `finalize` is set.
    pub(crate) fn alloc_page(
        &mut self,
        hdr: PageHeader,
        body: Option<(u32, &[u8])>,
        finalize: bool,
    ) -> Result<PageIx> {
        let pos = self.find_free_entry()?;
        let pix = self.geo.entry_to_page(pos.bix, pos.entry);
        let is_index = hdr.tag().is_index();

        self.store
            .write_lookup(IoTag::LU_ALLOC, pos.bix, pos.entry, LookupEntry::Object(hdr.tag()))?;
        self.claimed(pos);

        let mut hdr = hdr;
        hdr.flags = hdr.flags.reach(claim_states(is_index));
        self.store
            .write_header(IoTag::for_page(is_index, IoCmd::Alloc), pix, hdr)?;
        if let Some((offset, data)) = body {
            let addr = self.geo.page_addr(pix) + PAGE_HEADER_SIZE as u32 + offset;
            self.store
                .write(IoTag::for_page(is_index, IoCmd::Update), addr, data)?;
        }
        if finalize && !hdr.flags.is_final() {
            self.store
                .reach_flags(IoTag::for_page(is_index, IoCmd::Finalize), pix, PageFlags::FINAL)?;
        }
        trace!(pix, tag = hdr.obj_id, span = hdr.span_ix, "allocated page");
        Ok(pix)
    }

    /// Claim a free page and write the whole of `page`, whose first bytes are
    /// the header. The page is finalized once the body has landed and the
    /// final flags are mirrored back into `page`.
    pub(crate) fn alloc_full_page(&mut self, page: &mut [u8]) -> Result<PageIx> {
        let mut hdr = PageHeader::decode(page)?;
        let is_index = hdr.tag().is_index();
        let pos = self.find_free_entry()?;
        let pix = self.geo.entry_to_page(pos.bix, pos.entry);

        self.store
            .write_lookup(IoTag::LU_ALLOC, pos.bix, pos.entry, LookupEntry::Object(hdr.tag()))?;
        self.claimed(pos);

        hdr.flags = (hdr.flags | PageFlags::FINAL).reach(claim_states(is_index));
        page[..PAGE_HEADER_SIZE].copy_from_slice(&hdr.encode());
        self.store
            .write_page(IoTag::for_page(is_index, IoCmd::Alloc), pix, page)?;
        self.store
            .reach_flags(IoTag::for_page(is_index, IoCmd::Finalize), pix, PageFlags::FINAL)?;
        hdr.flags = hdr.flags.reach(PageFlags::FINAL);
        page[..PAGE_HEADER_SIZE].copy_from_slice(&hdr.encode());
        Ok(pix)
    }

    fn claimed(&mut self, pos: LookupPos) {
        if pos.entry == 0 {
            self.stats.free_blocks = self.stats.free_blocks.saturating_sub(1);
        }
        self.stats.allocated += 1;
        let next = pos.entry + 1;
        self.free_cursor = if next >= self.geo.entries_per_block() {
            LookupPos {
                bix: ((u32::from(pos.bix) + 1) % self.geo.block_count()) as BlockIx,
                entry: 0,
            }
        } else {
            LookupPos { bix: pos.bix, entry: next }
        };
    }

    /// Two-step release of `pix`: lookup entry first, then the header flag.
    pub(crate) fn delete_page(&mut self, pix: PageIx) -> Result<()> {
        if self.geo.is_out_of_range(pix) || self.geo.is_lookup_page(pix) {
            return Err(FlashError::IndexRefInvalid { pix });
        }
        let (bix, entry) = self.geo.page_to_entry(pix);
        let before = self.store.read_lookup(bix, entry)?;
        let is_index = match before {
            LookupEntry::Object(tag) => tag.is_index(),
            LookupEntry::Free | LookupEntry::Deleted => {
                self.store.read_header(IoTag::DA_READ, pix)?.flags.is_index()
            }
        };
        self.store
            .write_lookup(IoTag::LU_DELETE, bix, entry, LookupEntry::Deleted)?;
        self.store
            .reach_flags(IoTag::for_page(is_index, IoCmd::Delete), pix, PageFlags::DELETED)?;
        match before {
            LookupEntry::Object(_) => {
                self.stats.allocated = self.stats.allocated.saturating_sub(1);
                self.stats.deleted += 1;
            }
            LookupEntry::Free => self.stats.deleted += 1,
            LookupEntry::Deleted => {}
        }
        trace!(pix, "deleted page");
        Ok(())
    }

    /// Copy `src` verbatim (header included) to a fresh page, then delete
    /// `src`. The copy keeps the source lookup tag.
    pub(crate) fn move_page_raw(&mut self, src: PageIx, tag: ObjTag) -> Result<PageIx> {
        let pos = self.find_free_entry()?;
        let dst = self.geo.entry_to_page(pos.bix, pos.entry);
        self.store
            .write_lookup(IoTag::LU_ALLOC, pos.bix, pos.entry, LookupEntry::Object(tag))?;
        self.claimed(pos);
        let cmd = IoTag::for_page(tag.is_index(), IoCmd::Move);
        let ps = self.geo.page_size();
        self.store
            .copy(cmd, self.geo.page_addr(dst), self.geo.page_addr(src), ps)?;
        self.delete_page(src)?;
        debug!(src, dst, tag = tag.raw(), "moved page");
        Ok(dst)
    }

    /// Write `hdr` to a fresh page, copy the body of `src` behind it and
    /// finalize. `src` is left untouched.
    pub(crate) fn rewrite_page(&mut self, src: PageIx, hdr: PageHeader) -> Result<PageIx> {
        let mut hdr = hdr;
        hdr.flags = PageFlags::ERASED;
        let dst = self.alloc_page(hdr, None, false)?;
        self.store
            .copy_body(IoTag::for_page(hdr.tag().is_index(), IoCmd::Move), dst, src)?;
        self.store.reach_flags(
            IoTag::for_page(hdr.tag().is_index(), IoCmd::Finalize),
            dst,
            PageFlags::FINAL,
        )?;
        Ok(dst)
    }
}

/// Flags a freshly claimed page reaches immediately.
const fn claim_states(is_index: bool) -> PageFlags {
    if is_index {
        PageFlags::USED.union(PageFlags::INDEX)
    } else {
        PageFlags::USED
    }
}

/// Header is a live final page of `tag` at `span_ix`.
pub(crate) fn header_matches(hdr: &PageHeader, tag: ObjTag, span_ix: SpanIx) -> bool {
    if hdr.obj_id != tag.raw() || hdr.span_ix != span_ix || !hdr.flags.is_live_final() {
        return false;
    }
    if hdr.flags.is_index() != tag.is_index() {
        return false;
    }
    !(tag.is_index() && span_ix == 0 && hdr.flags.is_ix_deleted())
}
