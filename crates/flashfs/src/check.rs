//! Consistency checker.
//!
//! Three re-runnable passes restore the on-media invariants after an
//! interrupted operation:
//!
//! 1. **lookup**: every lookup entry agrees with its page header;
//! 2. **page**: every index pointer is valid and every live data page is
//!    referenced exactly once;
//! 3. **index**: plain index pages without a header are purged and
//!    interrupted removals are finished.
//!
//! Each repair is reported to the installed [`CheckListener`] and logged.
//! Media errors abort the running pass.

use std::collections::VecDeque;

use flashfs_error::{FlashError, Result};
use flashfs_hal::Flash;
use flashfs_types::{
    IndexKind, IndexView, LookupEntry, ObjId, ObjTag, PIX_NONE, PageFlags, PageHeader, PageIx,
    SpanIx,
};
use serde::Serialize;
use tracing::{debug, debug_span, error, info, warn};

use crate::instrumentation::IoTag;
use crate::lookup::{LookupPos, Visit};
use crate::object::IndexEvent;
use crate::volume::Volume;

/// Progress value reported when a pass completes.
pub const PROGRESS_DONE: u16 = 256;
/// Rescans of one page-pass window before giving up on convergence.
const MAX_WINDOW_RESTARTS: u32 = 256;

const BIT_USED: u8 = 1;
const BIT_REFERENCED: u8 = 2;
const BIT_INDEX: u8 = 4;

/// Which pass produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckKind {
    Lookup,
    Page,
    Index,
}

/// What the checker is about to do. Repairs are reported before any media
/// is touched, so a listener sees the action even when it fails halfway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckAction {
    /// Pass progress on a 0..=256 scale.
    Progress(u16),
    /// A stray or broken page is deleted.
    DeletePage { pix: PageIx },
    /// Page `pix` is moved or cleared so its lookup entry matches its header.
    FixLookup { pix: PageIx },
    /// A referenced but unfinished data page is finalized in place.
    FinalizePage { pix: PageIx },
    /// An index pointer is redirected to `pix`.
    FixIndex { id: ObjId, span: SpanIx, pix: PageIx },
    /// A plain index page has no header; its object is purged.
    DeleteOrphanedIndex { id: ObjId, pix: PageIx },
    /// An object that cannot be repaired is deleted.
    DeleteBadFile { id: ObjId },
    /// The pass aborted with this errno.
    Error { errno: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub kind: CheckKind,
    pub action: CheckAction,
}

/// Receives every check report as it happens.
pub type CheckListener = Box<dyn FnMut(&CheckReport) + Send>;

/// Repairs performed by one [`Volume::check`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    pub pages_deleted: u32,
    pub lookup_fixes: u32,
    pub pages_finalized: u32,
    pub index_fixes: u32,
    pub orphans_deleted: u32,
    pub objects_deleted: u32,
}

impl CheckSummary {
    #[must_use]
    pub const fn repairs(&self) -> u32 {
        self.pages_deleted
            + self.lookup_fixes
            + self.pages_finalized
            + self.index_fixes
            + self.orphans_deleted
            + self.objects_deleted
    }

    fn tally(&mut self, action: CheckAction) {
        match action {
            CheckAction::DeletePage { .. } => self.pages_deleted += 1,
            CheckAction::FixLookup { .. } => self.lookup_fixes += 1,
            CheckAction::FinalizePage { .. } => self.pages_finalized += 1,
            CheckAction::FixIndex { .. } => self.index_fixes += 1,
            CheckAction::DeleteOrphanedIndex { .. } => self.orphans_deleted += 1,
            CheckAction::DeleteBadFile { .. } => self.objects_deleted += 1,
            CheckAction::Progress(_) | CheckAction::Error { .. } => {}
        }
    }
}

/// Where the index says data span `span` of an object lives.
#[derive(Debug, Clone, Copy)]
struct IndexRef {
    /// Page pointed at, `None` when the slot is empty.
    target: Option<PageIx>,
}

fn progress(done: u32, total: u32) -> u16 {
    ((done * u32::from(PROGRESS_DONE)) / total.max(1)) as u16
}

fn bits_get(map: &[u8], rel: u32) -> u8 {
    (map[(rel / 2) as usize] >> ((rel % 2) * 4)) & 0x0F
}

fn bits_set(map: &mut [u8], rel: u32, bits: u8) {
    map[(rel / 2) as usize] |= bits << ((rel % 2) * 4);
}

impl<F: Flash> Volume<F> {
    /// Install or remove the repair listener.
    pub fn set_check_listener(&mut self, listener: Option<CheckListener>) {
        self.check_listener = listener;
    }

    /// Run the lookup, page and index passes in that order.
    pub fn check(&mut self) -> Result<CheckSummary> {
        self.ensure_mounted()?;
        let _span = debug_span!("check").entered();
        self.check_tally = CheckSummary::default();
        self.rebuild_stats()?;
        for kind in [CheckKind::Lookup, CheckKind::Page, CheckKind::Index] {
            self.report(kind, CheckAction::Progress(0));
            let res = match kind {
                CheckKind::Lookup => self.check_lookup(),
                CheckKind::Page => self.check_pages(),
                CheckKind::Index => self.check_index(),
            };
            if let Err(err) = res {
                error!(?kind, %err, "check pass aborted");
                self.report(kind, CheckAction::Error { errno: err.errno() });
                if let Err(again) = self.rebuild_stats() {
                    warn!(%again, "could not recount pages after aborted check");
                }
                return Err(err);
            }
            self.report(kind, CheckAction::Progress(PROGRESS_DONE));
        }
        self.rebuild_stats()?;
        let summary = self.check_tally;
        info!(
            repairs = summary.repairs(),
            pages_deleted = summary.pages_deleted,
            index_fixes = summary.index_fixes,
            objects_deleted = summary.objects_deleted,
            "check complete"
        );
        Ok(summary)
    }

    fn report(&mut self, kind: CheckKind, action: CheckAction) {
        self.check_tally.tally(action);
        if let Some(listener) = self.check_listener.as_mut() {
            listener(&CheckReport { kind, action });
        }
    }

    // ── shared repair helpers ───────────────────────────────────────────

    /// Delete every page carrying `id`, index and data alike.
    pub(crate) fn purge_object(&mut self, id: ObjId) -> Result<u32> {
        let geo = self.geo;
        let mut victims = Vec::new();
        self.scan_lookup::<()>(LookupPos::START, false, |_, pos, entry| {
            if entry.tag().is_some_and(|t| t.id() == id) {
                victims.push(geo.entry_to_page(pos.bix, pos.entry));
            }
            Ok(Visit::Continue)
        })?;
        for &pix in &victims {
            self.delete_page(pix)?;
        }
        self.notify(&IndexEvent::Removed { id, span: 0 });
        debug!(%id, pages = victims.len(), "purged object");
        Ok(victims.len() as u32)
    }

    fn drop_page(&mut self, kind: CheckKind, pix: PageIx) -> Result<()> {
        self.report(kind, CheckAction::DeletePage { pix });
        self.delete_page(pix)
    }

    /// Report and delete an object nothing can repair.
    fn drop_object(&mut self, kind: CheckKind, id: ObjId) -> Result<u32> {
        self.report(kind, CheckAction::DeleteBadFile { id });
        self.purge_object(id)
    }

    /// Index pointer for data span `span` of `id`; `None` when there is no
    /// index page for that span.
    fn index_reference(&mut self, id: ObjId, span: SpanIx) -> Result<Option<IndexRef>> {
        let ix_span = self.geo.index_span_for(span);
        let ix_pix = match self.find_by_tag_and_span(id.index_tag(), ix_span, None) {
            Ok(pix) => pix,
            Err(FlashError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        let at = IndexKind::for_span(ix_span).ptr_offset() + self.geo.index_slot_for(span) * 2;
        let raw = self
            .store
            .read_u16(IoTag::IX_READ, self.geo.page_addr(ix_pix) + at as u32)?;
        Ok(Some(IndexRef {
            target: (raw != PIX_NONE).then_some(raw),
        }))
    }

    fn is_referenced(&mut self, pix: PageIx, id: ObjId, span: SpanIx) -> Result<bool> {
        Ok(self
            .index_reference(id, span)?
            .and_then(|r| r.target)
            == Some(pix))
    }

    /// Point data span `span` of `id` at `new` by moving its index page.
    /// The index page is validated before the fix is reported.
    fn rewrite_index(&mut self, kind: CheckKind, id: ObjId, span: SpanIx, new: PageIx) -> Result<()> {
        let ix_span = self.geo.index_span_for(span);
        let ix_pix = self.find_by_tag_and_span(id.index_tag(), ix_span, None)?;
        let mut work = self.take_work();
        let res = self.rewrite_index_with(kind, id, span, (ix_span, ix_pix), new, &mut work);
        self.restore_work(work);
        res
    }

    fn rewrite_index_with(
        &mut self,
        kind: CheckKind,
        id: ObjId,
        span: SpanIx,
        (ix_span, ix_pix): (SpanIx, PageIx),
        new: PageIx,
        work: &mut [u8],
    ) -> Result<()> {
        self.store.read_page(IoTag::IX_READ, ix_pix, work)?;
        let hdr = PageHeader::decode(work)?;
        if hdr.id() != id {
            return Err(FlashError::CheckObjIdMismatch {
                pix: ix_pix,
                expected: id.get(),
                found: hdr.id().get(),
            });
        }
        if hdr.span_ix != ix_span {
            return Err(FlashError::CheckSpanMismatch {
                pix: ix_pix,
                expected: ix_span,
                found: hdr.span_ix,
            });
        }
        if !hdr.flags.is_live_final() || !hdr.flags.is_index() {
            return Err(FlashError::CheckFlagsBad {
                pix: ix_pix,
                flags: hdr.flags.bits(),
            });
        }
        IndexView::new(IndexKind::for_span(ix_span), &mut *work)?
            .set_ptr(self.geo.index_slot_for(span), Some(new))?;
        self.report(kind, CheckAction::FixIndex { id, span, pix: new });
        self.commit_moved_index(id, ix_span, ix_pix, work)?;
        Ok(())
    }

    /// Repoint the index at `target`; an index that cannot be trusted gets
    /// its whole object deleted instead.
    fn fix_pointer(&mut self, kind: CheckKind, id: ObjId, span: SpanIx, target: PageIx) -> Result<()> {
        match self.rewrite_index(kind, id, span, target) {
            Ok(()) => Ok(()),
            Err(err) if err.is_check_error() || err == FlashError::NotFound => {
                warn!(%id, span, %err, "index cannot be repaired, deleting object");
                self.drop_object(kind, id)?;
                if let Err(again) = self.delete_page(target) {
                    debug!(target, %again, "repair target already gone");
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Copy data page `pix` under `hdr` to a fresh page, repoint the index
    /// and delete the original.
    fn relocate_data(&mut self, kind: CheckKind, pix: PageIx, hdr: PageHeader) -> Result<()> {
        let new = self.rewrite_page(pix, hdr)?;
        self.fix_pointer(kind, hdr.id(), hdr.span_ix, new)?;
        self.delete_page(pix)
    }

    /// Copy index page `pix` to a fresh page so a correct lookup entry
    /// names it, then delete the original.
    fn relocate_index(&mut self, kind: CheckKind, pix: PageIx, hdr: PageHeader) -> Result<()> {
        self.report(kind, CheckAction::FixLookup { pix });
        let new = self.rewrite_page(pix, hdr)?;
        if hdr.flags.is_ix_deleted() {
            self.store
                .reach_flags(IoTag::IX_UPDATE, new, PageFlags::IXDELETE)?;
        }
        self.delete_page(pix)?;
        let size = if hdr.span_ix == 0 {
            let mut page = self.take_work();
            let res = self
                .store
                .read_page(IoTag::IX_READ, new, &mut page)
                .and_then(|()| IndexView::new(IndexKind::Header, &page[..]).map(|v| v.size()));
            self.restore_work(page);
            Some(res?)
        } else {
            None
        };
        self.notify(&IndexEvent::Updated {
            id: hdr.id(),
            span: hdr.span_ix,
            pix: new,
            size,
        });
        Ok(())
    }

    fn competitor(&mut self, tag: ObjTag, span: SpanIx, exclude: PageIx) -> Result<bool> {
        match self.find_by_tag_and_span(tag, span, Some(exclude)) {
            Ok(_) => Ok(true),
            Err(FlashError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    // ── pass 1: lookup entries ──────────────────────────────────────────

    fn check_lookup(&mut self) -> Result<()> {
        let geo = self.geo;
        let blocks = geo.block_count();
        let mut last_bix = None;
        self.scan_lookup::<()>(LookupPos::START, false, |vol, pos, entry| {
            if last_bix != Some(pos.bix) {
                last_bix = Some(pos.bix);
                vol.report(
                    CheckKind::Lookup,
                    CheckAction::Progress(progress(u32::from(pos.bix), blocks)),
                );
            }
            let pix = geo.entry_to_page(pos.bix, pos.entry);
            let hdr = vol.store.read_header(IoTag::DA_READ, pix)?;
            Ok(if vol.check_lookup_entry(pix, entry, hdr)? {
                Visit::Reload
            } else {
                Visit::Continue
            })
        })?;
        Ok(())
    }

    /// Returns `true` after a repair.
    fn check_lookup_entry(&mut self, pix: PageIx, entry: LookupEntry, hdr: PageHeader) -> Result<bool> {
        const KIND: CheckKind = CheckKind::Lookup;
        let page_live = hdr.flags.is_used() && !hdr.flags.is_deleted();
        let tag = match entry {
            LookupEntry::Free | LookupEntry::Deleted => {
                if !page_live {
                    return Ok(false);
                }
                warn!(pix, ?entry, obj = hdr.obj_id, "lookup entry unset but page in use");
                self.salvage_unlisted(pix, hdr)?;
                return Ok(true);
            }
            LookupEntry::Object(tag) => tag,
        };

        if !page_live {
            warn!(pix, tag = tag.raw(), "lookup entry busy but page not in use");
            let action = if hdr.flags.is_deleted() {
                CheckAction::FixLookup { pix }
            } else {
                CheckAction::DeletePage { pix }
            };
            self.report(KIND, action);
            self.delete_page(pix)?;
            return Ok(true);
        }
        if hdr.tag().is_index() != hdr.flags.is_index() {
            warn!(pix, obj = hdr.obj_id, "page header contradicts itself");
            self.drop_page(KIND, pix)?;
            return Ok(true);
        }
        if hdr.id() != tag.id() {
            warn!(pix, lookup = tag.raw(), header = hdr.obj_id, "lookup and header ids differ");
            self.resolve_id_mismatch(pix, tag, hdr)?;
            return Ok(true);
        }
        if tag.is_index() != hdr.flags.is_index() {
            warn!(pix, lookup = tag.raw(), "lookup and header disagree on index marking");
            self.resolve_kind_mismatch(pix, hdr)?;
            return Ok(true);
        }
        if !hdr.flags.is_final() {
            warn!(pix, obj = hdr.obj_id, span = hdr.span_ix, "page never finalized");
            if !hdr.flags.is_index() && self.is_referenced(pix, hdr.id(), hdr.span_ix)? {
                self.report(KIND, CheckAction::FinalizePage { pix });
                self.store
                    .reach_flags(IoTag::DA_UPDATE, pix, PageFlags::FINAL)?;
            } else {
                self.drop_page(KIND, pix)?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// The lookup entry is free or deleted yet the header is in use.
    fn salvage_unlisted(&mut self, pix: PageIx, hdr: PageHeader) -> Result<()> {
        const KIND: CheckKind = CheckKind::Lookup;
        if hdr.tag().is_index() != hdr.flags.is_index() {
            return self.drop_page(KIND, pix);
        }
        if hdr.flags.is_index() {
            if !hdr.flags.is_final() || self.competitor(hdr.tag(), hdr.span_ix, pix)? {
                return self.drop_page(KIND, pix);
            }
            return self.relocate_index(KIND, pix, hdr);
        }
        if self.is_referenced(pix, hdr.id(), hdr.span_ix)? {
            return self.relocate_data(KIND, pix, hdr);
        }
        self.drop_page(KIND, pix)
    }

    /// Lookup entry and header name different objects. The side whose index
    /// corroborates the page wins.
    fn resolve_id_mismatch(&mut self, pix: PageIx, tag: ObjTag, hdr: PageHeader) -> Result<()> {
        const KIND: CheckKind = CheckKind::Lookup;
        if hdr.flags.is_index() {
            if !hdr.flags.is_final() || self.competitor(hdr.tag(), hdr.span_ix, pix)? {
                return self.drop_page(KIND, pix);
            }
            return self.relocate_index(KIND, pix, hdr);
        }
        let span = hdr.span_ix;
        let lu_id = tag.id();
        if self.is_referenced(pix, lu_id, span)? {
            let relabeled = PageHeader::new(lu_id.data_tag(), span, PageFlags::ERASED);
            return self.relocate_data(KIND, pix, relabeled);
        }
        if self.is_referenced(pix, hdr.id(), span)? {
            return self.relocate_data(KIND, pix, hdr);
        }
        self.drop_page(KIND, pix)
    }

    /// Same object, but lookup and header disagree on index versus data.
    /// A page is kept only when nothing else fills its role.
    fn resolve_kind_mismatch(&mut self, pix: PageIx, hdr: PageHeader) -> Result<()> {
        const KIND: CheckKind = CheckKind::Lookup;
        let id = hdr.id();
        let span = hdr.span_ix;
        let other_index = self.competitor(id.index_tag(), span, pix)?;
        let other_data = self.competitor(id.data_tag(), span, pix)?;
        if hdr.flags.is_index() {
            if !other_index && hdr.flags.is_final() {
                return self.relocate_index(KIND, pix, hdr);
            }
        } else if !other_data && self.is_referenced(pix, id, span)? {
            return self.relocate_data(KIND, pix, hdr);
        }
        self.drop_page(KIND, pix)
    }

    // ── pass 2: pages ───────────────────────────────────────────────────

    fn check_pages(&mut self) -> Result<()> {
        let total = self.geo.total_pages();
        let window = self.geo.page_len() as u32 * 2;
        let mut map = self.take_work();
        let res = self.check_pages_with(total, window, &mut map);
        self.restore_work(map);
        res
    }

    fn check_pages_with(&mut self, total: u32, window: u32, map: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        while offset < total {
            let end = (offset + window).min(total);
            let mut restarts = 0;
            loop {
                map.fill(0);
                let repaired = self.mark_pages(offset, end, map)? || self.adopt_strays(offset, end, map)?;
                if !repaired {
                    break;
                }
                restarts += 1;
                if restarts >= MAX_WINDOW_RESTARTS {
                    return Err(FlashError::CheckDiverged { offset, restarts });
                }
            }
            offset = end;
            self.report(CheckKind::Page, CheckAction::Progress(progress(offset, total)));
        }
        Ok(())
    }

    /// Fill the bitmap for pages `offset..end` and validate every pointer
    /// of every live index page. Returns `true` after a repair.
    fn mark_pages(&mut self, offset: u32, end: u32, map: &mut [u8]) -> Result<bool> {
        let geo = self.geo;
        let window = offset..end;
        let validate = offset == 0;
        let mut page = vec![0_u8; geo.page_len()];
        for bix in 0..geo.block_count() as u16 {
            for entry in 0..geo.entries_per_block() {
                let pix = geo.entry_to_page(bix, entry);
                let hdr = self.store.read_header(IoTag::DA_READ, pix)?;
                if !hdr.flags.is_used() || hdr.flags.is_deleted() {
                    continue;
                }
                if window.contains(&u32::from(pix)) {
                    let bits = if hdr.flags.is_index() { BIT_USED | BIT_INDEX } else { BIT_USED };
                    bits_set(map, u32::from(pix) - offset, bits);
                }
                if !(hdr.flags.is_index() && hdr.tag().is_index() && hdr.flags.is_final()) {
                    continue;
                }
                self.store.read_page(IoTag::IX_READ, pix, &mut page)?;
                let id = hdr.id();
                let kind = IndexKind::for_span(hdr.span_ix);
                let view = IndexView::new(kind, &page[..])?;
                let base = geo.first_data_span(hdr.span_ix);
                for slot in 0..geo.ix_len_for_span(hdr.span_ix) {
                    let Some(target) = view.ptr(slot as usize) else {
                        continue;
                    };
                    let Ok(span) = SpanIx::try_from(base + slot) else {
                        continue;
                    };
                    if validate {
                        if let Err(err) = self.check_data_ref(target, id, span) {
                            if !err.is_structural() {
                                return Err(err);
                            }
                            warn!(%id, span, target, %err, "invalid index pointer");
                            self.repair_pointer(id, span)?;
                            return Ok(true);
                        }
                    }
                    if !window.contains(&u32::from(target)) {
                        continue;
                    }
                    let rel = u32::from(target) - offset;
                    if bits_get(map, rel) & BIT_REFERENCED != 0 {
                        warn!(%id, target, pix, "data page referenced twice");
                        if self.competitor(hdr.tag(), hdr.span_ix, pix)? {
                            self.drop_page(CheckKind::Page, pix)?;
                        } else {
                            self.drop_object(CheckKind::Page, id)?;
                        }
                        return Ok(true);
                    }
                    bits_set(map, rel, BIT_REFERENCED);
                }
            }
        }
        Ok(false)
    }

    /// The pointer for `span` of `id` is bad: point it at a live page for
    /// that span, or at a fresh empty one when none exists.
    fn repair_pointer(&mut self, id: ObjId, span: SpanIx) -> Result<()> {
        let target = match self.find_by_tag_and_span(id.data_tag(), span, None) {
            Ok(pix) => pix,
            Err(FlashError::NotFound) => {
                let hdr = PageHeader::new(id.data_tag(), span, PageFlags::ERASED);
                self.alloc_page(hdr, None, true)?
            }
            Err(err) => return Err(err),
        };
        self.fix_pointer(CheckKind::Page, id, span, target)
    }

    /// Resolve live data pages nothing references. Deleting a stray leaves
    /// the bitmap valid, so the sweep goes on; returns `true` when an index
    /// was repointed and the window has to be marked again.
    fn adopt_strays(&mut self, offset: u32, end: u32, map: &[u8]) -> Result<bool> {
        const KIND: CheckKind = CheckKind::Page;
        let mut repointed = false;
        for raw in offset..end {
            let pix = raw as PageIx;
            if self.geo.is_lookup_page(pix)
                || bits_get(map, raw - offset) & (BIT_USED | BIT_REFERENCED | BIT_INDEX) != BIT_USED
            {
                continue;
            }
            let hdr = self.store.read_header(IoTag::DA_READ, pix)?;
            if !hdr.flags.is_used() || hdr.flags.is_deleted() {
                // purged along with its object earlier in this sweep
                continue;
            }
            let (id, span) = (hdr.id(), hdr.span_ix);
            if hdr.tag().is_index() || !hdr.flags.is_final() {
                warn!(pix, obj = hdr.obj_id, "unreferenced broken data page");
                self.drop_page(KIND, pix)?;
                continue;
            }
            let Some(reference) = self.index_reference(id, span)? else {
                warn!(pix, %id, span, "data page without index");
                self.drop_page(KIND, pix)?;
                continue;
            };
            match reference.target {
                Some(target) if target == pix => {}
                Some(target) if self.holds_data(target, id, span)? => {
                    debug!(pix, %id, span, target, "stray copy of referenced data page");
                    self.drop_page(KIND, pix)?;
                }
                _ => {
                    warn!(pix, %id, span, "adopting unreferenced data page");
                    self.fix_pointer(KIND, id, span, pix)?;
                    repointed = true;
                }
            }
        }
        Ok(repointed)
    }

    fn holds_data(&mut self, pix: PageIx, id: ObjId, span: SpanIx) -> Result<bool> {
        match self.check_data_ref(pix, id, span) {
            Ok(()) => Ok(true),
            Err(err) if err.is_structural() => Ok(false),
            Err(err) => Err(err),
        }
    }

    // ── pass 3: object index ────────────────────────────────────────────

    fn check_index(&mut self) -> Result<()> {
        let geo = self.geo;
        let blocks = geo.block_count();
        let cap = (geo.page_len() / 2).max(4);
        let mut seen: VecDeque<(ObjId, bool)> = VecDeque::with_capacity(cap);
        let mut last_bix = None;
        self.scan_lookup::<()>(LookupPos::START, false, |vol, pos, entry| {
            if last_bix != Some(pos.bix) {
                last_bix = Some(pos.bix);
                vol.report(
                    CheckKind::Index,
                    CheckAction::Progress(progress(u32::from(pos.bix), blocks)),
                );
            }
            let Some(tag) = entry.tag().filter(|t| t.is_index()) else {
                return Ok(Visit::Continue);
            };
            let pix = geo.entry_to_page(pos.bix, pos.entry);
            let hdr = vol.store.read_header(IoTag::IX_READ, pix)?;
            if !hdr.flags.is_live_final() || !hdr.flags.is_index() || hdr.obj_id != tag.raw() {
                return Ok(Visit::Continue);
            }
            let id = tag.id();
            if hdr.span_ix == 0 {
                if hdr.flags.is_ix_deleted() {
                    warn!(%id, pix, "finishing interrupted removal");
                    seen.retain(|(s, _)| *s != id);
                    vol.drop_object(CheckKind::Index, id)?;
                    return Ok(Visit::Reload);
                }
                remember(&mut seen, cap, id, true);
                return Ok(Visit::Continue);
            }
            let reachable = match seen.iter().find(|(s, _)| *s == id) {
                Some(&(_, reachable)) => reachable,
                None => {
                    let reachable = match vol.find_by_tag_and_span(id.index_tag(), 0, None) {
                        Ok(_) => true,
                        Err(FlashError::NotFound) => false,
                        Err(err) => return Err(err),
                    };
                    remember(&mut seen, cap, id, reachable);
                    reachable
                }
            };
            if reachable {
                return Ok(Visit::Continue);
            }
            warn!(%id, pix, span = hdr.span_ix, "orphaned index page");
            vol.report(CheckKind::Index, CheckAction::DeleteOrphanedIndex { id, pix });
            vol.purge_object(id)?;
            Ok(Visit::Reload)
        })?;
        Ok(())
    }
}

/// Record `id` in the bounded ring, evicting the oldest entry when full.
fn remember(seen: &mut VecDeque<(ObjId, bool)>, cap: usize, id: ObjId, reachable: bool) {
    if let Some(slot) = seen.iter_mut().find(|(s, _)| *s == id) {
        slot.1 = reachable;
        return;
    }
    if seen.len() == cap {
        seen.pop_front();
    }
    seen.push_back((id, reachable));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectCursor;
    use crate::testutil::mounted;
    use flashfs_hal::RamFlash;
    use flashfs_types::{ObjType, UNDEFINED_LEN};
    use std::sync::{Arc, Mutex};

    fn object_with(vol: &mut Volume<RamFlash>, name: &[u8], data: &[u8]) -> ObjectCursor {
        let id = vol.alloc_obj_id(name).expect("id");
        let pix = vol.create_object(id, name, ObjType::File).expect("create");
        let (mut cur, _) = vol.open_cursor(pix).expect("open");
        vol.append(&mut cur, 0, data).expect("append");
        cur
    }

    fn reread(vol: &mut Volume<RamFlash>, name: &[u8]) -> Vec<u8> {
        let (_, pix) = vol.find_by_name(name).expect("scan").expect("object present");
        let (mut cur, _) = vol.open_cursor(pix).expect("open");
        let mut out = vec![0_u8; cur.len() as usize];
        vol.read_object(&mut cur, 0, &mut out).expect("read");
        out
    }

    fn data_page(vol: &mut Volume<RamFlash>, cur: &ObjectCursor, span: SpanIx) -> PageIx {
        vol.find_by_tag_and_span(cur.id.data_tag(), span, None)
            .expect("data page")
    }

    #[test]
    fn clean_volume_needs_no_repair() {
        let mut vol = mounted(8);
        object_with(&mut vol, b"a", &[7; 700]);
        let summary = vol.check().expect("check");
        assert_eq!(summary.repairs(), 0);
    }

    #[test]
    fn deleted_lookup_entry_is_relocated() {
        let mut vol = mounted(8);
        let data: Vec<u8> = (0..600_u32).map(|i| i as u8).collect();
        let cur = object_with(&mut vol, b"f", &data);
        let victim = data_page(&mut vol, &cur, 1);
        let (bix, entry) = vol.geo.page_to_entry(victim);
        vol.store
            .write_lookup(IoTag::LU_DELETE, bix, entry, LookupEntry::Deleted)
            .expect("corrupt");

        let summary = vol.check().expect("check");
        assert!(summary.index_fixes >= 1);
        let moved = data_page(&mut vol, &cur, 1);
        assert_ne!(moved, victim);
        assert_eq!(reread(&mut vol, b"f"), data);
        assert_eq!(vol.check().expect("second check").repairs(), 0);
    }

    #[test]
    fn unfinished_claim_is_deleted() {
        let mut vol = mounted(8);
        let hdr = PageHeader::new(ObjId::new(9).data_tag(), 0, PageFlags::ERASED);
        let pix = vol.alloc_page(hdr, Some((0, b"junk")), false).expect("alloc");
        let summary = vol.check().expect("check");
        assert_eq!(summary.pages_deleted, 1);
        let back = vol.store.read_header(IoTag::DA_READ, pix).expect("hdr");
        assert!(back.flags.is_deleted());
        assert_eq!(vol.stats().allocated, 0);
    }

    #[test]
    fn orphaned_plain_index_is_purged() {
        let mut vol = mounted(16);
        let dps = vol.geo.data_page_size() as usize;
        let big = vec![0x42_u8; vol.geo.header_ix_len() as usize * dps + dps];
        let cur = object_with(&mut vol, b"orphan", &big);
        vol.delete_page(cur.hdr_pix).expect("drop header");

        let summary = vol.check().expect("check");
        assert_eq!(summary.orphans_deleted, 1);
        assert_eq!(vol.stats().allocated, 0);
        assert_eq!(vol.check().expect("again").repairs(), 0);
    }

    #[test]
    fn interrupted_removal_is_finished() {
        let mut vol = mounted(8);
        let cur = object_with(&mut vol, b"half", &[1; 300]);
        vol.store
            .reach_flags(IoTag::IX_UPDATE, cur.hdr_pix, PageFlags::IXDELETE)
            .expect("flag");
        let summary = vol.check().expect("check");
        assert_eq!(summary.objects_deleted, 1);
        assert_eq!(vol.find_by_name(b"half"), Ok(None));
        assert_eq!(vol.stats().allocated, 0);
    }

    #[test]
    fn dangling_pointer_gets_a_fresh_page() {
        let mut vol = mounted(8);
        let cur = object_with(&mut vol, b"hole", &[5; 600]);
        let victim = data_page(&mut vol, &cur, 1);
        vol.delete_page(victim).expect("delete");

        let summary = vol.check().expect("check");
        assert_eq!(summary.index_fixes, 1);
        let out = reread(&mut vol, b"hole");
        assert_eq!(out.len(), 600);
        assert!(out[..251].iter().all(|&b| b == 5));
        assert!(out[251..502].iter().all(|&b| b == 0xFF));
        assert!(out[502..].iter().all(|&b| b == 5));
    }

    #[test]
    fn stray_data_copy_is_deleted() {
        let mut vol = mounted(8);
        let cur = object_with(&mut vol, b"s", &[3; 100]);
        let hdr = PageHeader::new(cur.id.data_tag(), 0, PageFlags::ERASED);
        vol.alloc_page(hdr, Some((0, &[9; 100])), true).expect("stray");
        let summary = vol.check().expect("check");
        assert_eq!(summary.pages_deleted, 1);
        assert_eq!(reread(&mut vol, b"s"), vec![3; 100]);
    }

    #[test]
    fn listener_sees_progress_and_repairs() {
        let mut vol = mounted(8);
        let cur = object_with(&mut vol, b"l", &[1; 10]);
        assert_ne!(cur.size, UNDEFINED_LEN);
        let hdr = PageHeader::new(ObjId::new(77).data_tag(), 0, PageFlags::ERASED);
        vol.alloc_page(hdr, None, false).expect("alloc");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        vol.set_check_listener(Some(Box::new(move |r: &CheckReport| {
            sink.lock().expect("lock").push(*r);
        })));
        vol.check().expect("check");
        let seen = seen.lock().expect("lock");
        for kind in [CheckKind::Lookup, CheckKind::Page, CheckKind::Index] {
            assert!(seen.contains(&CheckReport {
                kind,
                action: CheckAction::Progress(PROGRESS_DONE)
            }));
        }
        assert!(seen.iter().any(|r| matches!(r.action, CheckAction::DeletePage { .. })));
    }

    #[test]
    fn repair_is_reported_before_media_is_touched() {
        let mut vol = mounted(8);
        let hdr = PageHeader::new(ObjId::new(9).data_tag(), 0, PageFlags::ERASED);
        let pix = vol.alloc_page(hdr, Some((0, b"junk")), false).expect("alloc");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        vol.set_check_listener(Some(Box::new(move |r: &CheckReport| {
            sink.lock().expect("lock").push(r.action);
        })));
        vol.flash_mut().arm_power_cut(0);
        let err = vol.check().expect_err("delete must fail without power");
        assert!(matches!(err, FlashError::Media { .. }), "{err:?}");

        let seen = seen.lock().expect("lock");
        let delete = seen
            .iter()
            .position(|a| *a == CheckAction::DeletePage { pix })
            .expect("delete reported");
        let failed = seen
            .iter()
            .position(|a| matches!(a, CheckAction::Error { .. }))
            .expect("error reported");
        assert!(delete < failed);
    }

    #[test]
    fn many_stray_copies_settle_in_one_check() {
        let mut vol = mounted(32);
        let cur = object_with(&mut vol, b"s", &[3; 100]);
        let hdr = PageHeader::new(cur.id.data_tag(), 0, PageFlags::ERASED);
        for _ in 0..300 {
            vol.alloc_page(hdr, Some((0, &[9; 100])), true).expect("stray");
        }
        let first = vol.check().expect("check");
        assert_eq!(first.pages_deleted, 300);
        assert_eq!(vol.check().expect("second check").repairs(), 0);
        assert_eq!(reread(&mut vol, b"s"), vec![3; 100]);
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut seen = VecDeque::new();
        for id in 1..=5 {
            remember(&mut seen, 4, ObjId::new(id), true);
        }
        assert_eq!(seen.len(), 4);
        assert!(!seen.iter().any(|(id, _)| *id == ObjId::new(1)));
        remember(&mut seen, 4, ObjId::new(3), false);
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn summary_serializes() {
        let summary = CheckSummary {
            index_fixes: 2,
            ..CheckSummary::default()
        };
        let json = serde_json::to_value(summary).expect("json");
        assert_eq!(json["index_fixes"], 2);
        assert_eq!(summary.repairs(), 2);
    }
}
