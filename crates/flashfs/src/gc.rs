//! Garbage collection.
//!
//! A block can only be erased as a whole, so reclaiming deleted pages means
//! first moving every live page out of the block. Candidates are scored by
//! deleted pages (good), live pages (cost of moving) and erase age (wear
//! levelling).

use flashfs_error::{FlashError, Result};
use flashfs_hal::Flash;
use flashfs_types::{BlockIx, IndexKind, IndexView, LookupEntry, ObjTag, PageIx, SpanIx};
use tracing::{debug, debug_span, warn};

use crate::instrumentation::{IoCmd, IoTag};
use crate::lookup::{LookupPos, Visit};
use crate::object::IndexEvent;
use crate::volume::Volume;

/// Blocks cleaned by one [`Volume::gc_check`] call at most.
const GC_MAX_RUNS: u32 = 5;
const WEIGHT_DELETED: i64 = 5;
const WEIGHT_USED: i64 = -1;
const WEIGHT_ERASE_AGE: i64 = 50;

/// Page census of one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BlockCensus {
    live: u32,
    deleted: u32,
    free: u32,
}

impl<F: Flash> Volume<F> {
    fn block_census(&mut self) -> Result<Vec<BlockCensus>> {
        let mut out = vec![BlockCensus::default(); self.geo.block_count() as usize];
        self.scan_lookup::<()>(LookupPos::START, false, |_, pos, entry| {
            let c = &mut out[usize::from(pos.bix)];
            match entry {
                LookupEntry::Free => c.free += 1,
                LookupEntry::Deleted => c.deleted += 1,
                LookupEntry::Object(_) => c.live += 1,
            }
            Ok(Visit::Continue)
        })?;
        Ok(out)
    }

    /// Erase the first block holding deleted pages, no live pages and at most
    /// `max_free_pages` free ones.
    pub(crate) fn gc_quick(&mut self, max_free_pages: u32) -> Result<()> {
        let census = self.block_census()?;
        let found = census
            .iter()
            .position(|c| c.live == 0 && c.deleted > 0 && c.free <= max_free_pages);
        let Some(bix) = found else {
            return Err(FlashError::NoDeletedBlocks);
        };
        let bix = bix as BlockIx;
        debug!(block = bix, deleted = census[usize::from(bix)].deleted, "quick gc");
        self.erase_block(bix)?;
        self.rebuild_stats()
    }

    /// Make room for `len` more bytes, cleaning blocks when free space is
    /// tight. Fails with [`FlashError::Full`] when the space cannot be found.
    pub(crate) fn gc_check(&mut self, len: u32) -> Result<()> {
        let dps = i64::from(self.geo.data_page_size());
        let len = i64::from(len);
        if self.stats.free_blocks > 3 && len < self.free_pages() * dps {
            return Ok(());
        }
        let needed = len.div_euclid(dps) + i64::from(len % dps != 0);
        if needed > self.free_pages() + i64::from(self.stats.deleted) {
            debug!(needed, free = self.free_pages(), deleted = self.stats.deleted, "no room even after gc");
            return Err(FlashError::Full);
        }
        let _span = debug_span!("gc_check", len).entered();
        let mut runs = 0;
        loop {
            let Some(bix) = self.gc_candidates()?.first().copied() else {
                debug!("no gc candidate");
                break;
            };
            self.gc_clean(bix)?;
            runs += 1;
            let tight = self.stats.free_blocks <= 2 || len > self.free_pages() * dps;
            if runs >= GC_MAX_RUNS || !tight {
                break;
            }
        }
        if len > self.free_pages() * dps {
            return Err(FlashError::Full);
        }
        Ok(())
    }

    /// Pages free for objects, keeping two blocks in reserve for GC.
    fn free_pages(&self) -> i64 {
        let epb = i64::from(self.geo.entries_per_block());
        let blocks = i64::from(self.geo.block_count());
        epb * (blocks - 2) - i64::from(self.stats.allocated) - i64::from(self.stats.deleted)
    }

    /// Blocks worth cleaning, best first.
    fn gc_candidates(&mut self) -> Result<Vec<BlockIx>> {
        let census = self.block_census()?;
        let epb = self.geo.entries_per_block();
        let crammed = self.stats.free_blocks <= 2;
        let mut scored: Vec<(i64, BlockIx)> = Vec::new();
        for (bix, c) in census.iter().enumerate() {
            let bix = bix as BlockIx;
            if c.free == epb {
                continue;
            }
            let ec = self.store.read_erase_count(bix)?;
            let ec = if ec == u16::MAX { 0 } else { ec };
            let age = i64::from(self.stats.max_erase_count.wrapping_sub(ec));
            if c.deleted == 0 && (crammed || age == 0) {
                continue;
            }
            let age_weight = if crammed { 0 } else { WEIGHT_ERASE_AGE };
            let score = i64::from(c.deleted) * WEIGHT_DELETED
                + i64::from(c.live) * WEIGHT_USED
                + age * age_weight;
            scored.push((score, bix));
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(scored.into_iter().map(|(_, bix)| bix).collect())
    }

    /// Move every live page out of `bix` and erase it.
    pub(crate) fn gc_clean(&mut self, bix: BlockIx) -> Result<()> {
        let _span = debug_span!("gc_clean", block = bix).entered();
        self.cleaning = true;
        self.gc_block = Some(bix);
        let res = self.gc_clean_inner(bix);
        self.cleaning = false;
        self.gc_block = None;
        res?;
        self.erase_block(bix)?;
        self.rebuild_stats()?;
        debug!(block = bix, free_blocks = self.stats.free_blocks, "cleaned block");
        Ok(())
    }

    fn gc_clean_inner(&mut self, bix: BlockIx) -> Result<()> {
        let epb = self.geo.entries_per_block();
        // Data pages first: re-pointing them moves index pages, which may
        // live in this block too.
        for entry in 0..epb {
            if let LookupEntry::Object(tag) = self.store.read_lookup(bix, entry)? {
                if !tag.is_index() {
                    self.gc_move_data(self.geo.entry_to_page(bix, entry), tag)?;
                }
            }
        }
        for entry in 0..epb {
            if let LookupEntry::Object(tag) = self.store.read_lookup(bix, entry)? {
                if tag.is_index() {
                    self.gc_move_index(self.geo.entry_to_page(bix, entry), tag)?;
                }
            }
        }
        Ok(())
    }

    fn gc_move_data(&mut self, pix: PageIx, tag: ObjTag) -> Result<()> {
        let hdr = self.store.read_header(IoTag::DA_READ, pix)?;
        if !hdr.flags.is_live_final() || hdr.obj_id != tag.raw() || hdr.flags.is_index() {
            warn!(pix, obj = tag.raw(), "gc dropping stale data page");
            return self.delete_page(pix);
        }
        let id = tag.id();
        let ix_span = self.geo.index_span_for(hdr.span_ix);
        let slot = self.geo.index_slot_for(hdr.span_ix);
        let ix_pix = match self.find_by_tag_and_span(id.index_tag(), ix_span, None) {
            Ok(ix_pix) => ix_pix,
            Err(FlashError::NotFound) => {
                warn!(pix, %id, span = hdr.span_ix, "gc dropping unindexed data page");
                return self.delete_page(pix);
            }
            Err(err) => return Err(err),
        };

        let mut work = self.take_work();
        let res = self.gc_repoint(pix, tag, ix_span, ix_pix, slot, &mut work);
        self.restore_work(work);
        res
    }

    fn gc_repoint(
        &mut self,
        pix: PageIx,
        tag: ObjTag,
        ix_span: SpanIx,
        ix_pix: PageIx,
        slot: usize,
        work: &mut [u8],
    ) -> Result<()> {
        let id = tag.id();
        self.store.read_page(IoTag::IX_READ, ix_pix, work)?;
        let mut view = IndexView::new(IndexKind::for_span(ix_span), &mut *work)?;
        if view.ptr(slot) != Some(pix) {
            warn!(pix, %id, "gc dropping data page its index does not reference");
            return self.delete_page(pix);
        }
        let new = self.move_page_raw(pix, tag)?;
        view.set_ptr(slot, Some(new))?;
        self.commit_moved_index(id, ix_span, ix_pix, work)?;
        Ok(())
    }

    fn gc_move_index(&mut self, pix: PageIx, tag: ObjTag) -> Result<()> {
        let hdr = self
            .store
            .read_header(IoTag::for_page(true, IoCmd::Read), pix)?;
        if !hdr.flags.is_live_final() || hdr.obj_id != tag.raw() || !hdr.flags.is_index() {
            warn!(pix, obj = tag.raw(), "gc dropping stale index page");
            return self.delete_page(pix);
        }
        let new = self.move_page_raw(pix, tag)?;
        self.notify(&IndexEvent::Updated {
            id: tag.id(),
            span: hdr.span_ix,
            pix: new,
            size: None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mounted;
    use flashfs_types::{ObjId, ObjType, PageFlags, PageHeader};

    #[test]
    fn quick_gc_needs_a_dead_block() {
        let mut vol = mounted(4);
        assert_eq!(vol.gc_quick(0), Err(FlashError::NoDeletedBlocks));

        let epb = vol.geo.entries_per_block();
        let id = ObjId::new(1);
        let mut pages = Vec::new();
        for span in 0..epb as u16 {
            let hdr = PageHeader::new(id.data_tag(), span, PageFlags::ERASED);
            pages.push(vol.alloc_page(hdr, None, true).expect("alloc"));
        }
        assert!(pages.iter().all(|&p| vol.geo.block_of_page(p) == 0));
        for pix in pages {
            vol.delete_page(pix).expect("delete");
        }
        assert_eq!(vol.stats().free_blocks, 3);
        vol.gc_quick(0).expect("quick gc");
        assert_eq!(vol.stats().free_blocks, 4);
        assert_eq!(vol.stats().deleted, 0);
        assert_eq!(vol.stats().max_erase_count, 1);
    }

    #[test]
    fn clean_relocates_live_pages() {
        let mut vol = mounted(8);
        let id = vol.alloc_obj_id(b"keep").expect("id");
        let hdr_pix = vol.create_object(id, b"keep", ObjType::File).expect("create");
        let (mut cur, _) = vol.open_cursor(hdr_pix).expect("open");
        let data: Vec<u8> = (0..900_u32).map(|i| (i * 7) as u8).collect();
        vol.append(&mut cur, 0, &data).expect("append");
        vol.modify(&mut cur, 0, &[1, 2, 3]).expect("modify");

        let bix = vol.geo.block_of_page(hdr_pix);
        vol.gc_clean(bix).expect("clean");
        for entry in 0..vol.geo.entries_per_block() {
            assert_eq!(vol.store.read_lookup(bix, entry), Ok(LookupEntry::Free));
        }

        let (_, live_hdr) = vol.find_by_name(b"keep").expect("scan").expect("still there");
        let (mut cur, _) = vol.open_cursor(live_hdr).expect("reopen");
        let mut out = vec![0_u8; 900];
        assert_eq!(vol.read_object(&mut cur, 0, &mut out), Ok(900));
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert_eq!(&out[3..], &data[3..]);
    }

    #[test]
    fn gc_check_reclaims_churn() {
        let mut vol = mounted(4);
        let id = vol.alloc_obj_id(b"churn").expect("id");
        let pix = vol.create_object(id, b"churn", ObjType::File).expect("create");
        let (mut cur, _) = vol.open_cursor(pix).expect("open");
        vol.append(&mut cur, 0, &[0x11; 500]).expect("append");
        for round in 0..40_u8 {
            vol.gc_check(500).expect("gc");
            vol.modify(&mut cur, 0, &[round; 500]).expect("modify");
        }
        let mut out = [0_u8; 500];
        vol.read_object(&mut cur, 0, &mut out).expect("read");
        assert!(out.iter().all(|&b| b == 39));
        assert!(vol.stats().max_erase_count > 0);
    }

    #[test]
    fn gc_check_refuses_impossible_requests() {
        let mut vol = mounted(4);
        let total = vol.geo.total_data_pages() * vol.geo.data_page_size();
        assert_eq!(vol.gc_check(total), Err(FlashError::Full));
    }
}
