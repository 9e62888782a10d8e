//! Object-id allocation and name lookup.
//!
//! Free ids are found with a two-phase search. While the candidate range is
//! wider than the scratch buffer can bitmap, ids are counted into buckets and
//! the range narrows to the bucket with the most free capacity. Once the
//! range fits, one bitmap pass over every lookup entry pins down a free id.

use flashfs_error::{FlashError, Result};
use flashfs_hal::Flash;
use flashfs_types::index::{NAME_OFFSET, check_name};
use flashfs_types::{LookupEntry, NAME_MAX, OBJ_ID_IX_FLAG, ObjId, PageIx};
use tracing::debug;

use crate::instrumentation::IoTag;
use crate::lookup::{LookupPos, Visit};
use crate::volume::Volume;

/// Feeds every id present on the media to a sink, flagged `true` when the
/// sighting is a live index header.
pub(crate) type Census<'a> = &'a mut dyn FnMut(u16, bool);

/// Find an id in `lo..hi` absent from the census.
///
/// `scratch` bounds the memory used: `scratch.len() * 8` ids fit a bitmap,
/// `scratch.len() / 2` buckets of `u16` counters are used while compacting.
/// Only header sightings are counted while compacting, so each object is
/// counted once; the final bitmap pass marks every sighting.
pub(crate) fn search_free_id(
    lo: u32,
    hi: u32,
    scratch: &mut [u8],
    mut census: impl FnMut(Census<'_>) -> Result<()>,
) -> Result<ObjId> {
    let bitmap_bits = scratch.len() * 8;
    let buckets = (scratch.len() / 2).max(2) as u32;
    let (mut lo, mut hi) = (lo, hi);
    loop {
        if hi <= lo {
            return Err(FlashError::NoFreeObjectId);
        }
        let width = hi - lo;
        if width as usize <= bitmap_bits {
            scratch.fill(0);
            census(&mut |id, _| {
                let id = u32::from(id);
                if (lo..hi).contains(&id) {
                    let bit = (id - lo) as usize;
                    scratch[bit / 8] |= 1 << (bit % 8);
                }
            })?;
            return (0..width)
                .find(|&i| scratch[i as usize / 8] & (1 << (i % 8)) == 0)
                .map(|i| ObjId::new((lo + i) as u16))
                .ok_or(FlashError::NoFreeObjectId);
        }

        let bucket_w = width.div_ceil(buckets);
        let n_buckets = width.div_ceil(bucket_w);
        let mut counts = vec![0_u16; n_buckets as usize];
        census(&mut |id, is_header| {
            let id = u32::from(id);
            if is_header && (lo..hi).contains(&id) {
                let b = ((id - lo) / bucket_w) as usize;
                counts[b] = counts[b].saturating_add(1);
            }
        })?;
        let mut best: Option<(u32, u32)> = None;
        for (b, &count) in counts.iter().enumerate() {
            let start = lo + b as u32 * bucket_w;
            let cap = bucket_w.min(hi - start);
            let free = cap.saturating_sub(u32::from(count));
            if free > best.map_or(0, |(_, f)| f) {
                best = Some((b as u32, free));
            }
        }
        let Some((b, _)) = best else {
            return Err(FlashError::NoFreeObjectId);
        };
        let start = lo + b * bucket_w;
        hi = start + bucket_w.min(hi - start);
        lo = start;
    }
}

impl<F: Flash> Volume<F> {
    /// Allocate an id for a new object called `name`.
    pub(crate) fn alloc_obj_id(&mut self, name: &[u8]) -> Result<ObjId> {
        check_name(name)?;
        if self.find_by_name(name)?.is_some() {
            return Err(FlashError::ConflictingName);
        }
        let hi = (self.geo.max_objects() + 1).min(u32::from(OBJ_ID_IX_FLAG - 1));
        let geo = self.geo;
        let mut scratch = self.take_work();
        let found = search_free_id(1, hi, &mut scratch, |sink| {
            self.scan_lookup::<()>(LookupPos::START, false, |vol, pos, entry| {
                if let LookupEntry::Object(tag) = entry {
                    let is_header = tag.is_index() && {
                        let pix = geo.entry_to_page(pos.bix, pos.entry);
                        let hdr = vol.store.read_header(IoTag::IX_READ, pix)?;
                        hdr.span_ix == 0 && hdr.flags.is_used() && !hdr.flags.is_deleted()
                    };
                    sink(tag.id().get(), is_header);
                }
                Ok(Visit::Continue)
            })?;
            Ok(())
        });
        self.restore_work(scratch);
        let id = found?;
        debug!(%id, "allocated object id");
        Ok(id)
    }

    /// Every live object index header, in media order.
    pub(crate) fn live_headers(&mut self) -> Result<Vec<(ObjId, PageIx)>> {
        let geo = self.geo;
        let mut out = Vec::new();
        self.scan_lookup::<()>(LookupPos::START, false, |vol, pos, entry| {
            let Some(tag) = entry.tag().filter(|t| t.is_index()) else {
                return Ok(Visit::Continue);
            };
            let pix = geo.entry_to_page(pos.bix, pos.entry);
            let hdr = vol.store.read_header(IoTag::IX_READ, pix)?;
            if hdr.span_ix == 0
                && hdr.obj_id == tag.raw()
                && hdr.flags.is_live_final()
                && hdr.flags.is_index()
                && !hdr.flags.is_ix_deleted()
            {
                out.push((tag.id(), pix));
            }
            Ok(Visit::Continue)
        })?;
        Ok(out)
    }

    /// Header page of the visible object called `name`.
    pub(crate) fn find_by_name(&mut self, name: &[u8]) -> Result<Option<(ObjId, PageIx)>> {
        for (id, pix) in self.live_headers()? {
            if self.unlinked.contains(&id) {
                continue;
            }
            if self.read_name(pix)? == name {
                return Ok(Some((id, pix)));
            }
        }
        Ok(None)
    }

    /// Name stored in the header at `pix`.
    pub(crate) fn read_name(&mut self, pix: PageIx) -> Result<Vec<u8>> {
        let mut field = [0_u8; NAME_MAX];
        let addr = self.geo.page_addr(pix) + NAME_OFFSET as u32;
        self.store.read(IoTag::IX_READ, addr, &mut field)?;
        let end = field
            .iter()
            .position(|&b| b == 0 || b == 0xFF)
            .unwrap_or(NAME_MAX);
        Ok(field[..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn search(lo: u32, hi: u32, scratch_len: usize, used: &BTreeSet<u16>) -> Result<ObjId> {
        let mut scratch = vec![0_u8; scratch_len];
        search_free_id(lo, hi, &mut scratch, |sink| {
            for &id in used {
                sink(id, true);
            }
            Ok(())
        })
    }

    #[test]
    fn empty_census_yields_lowest_id() {
        assert_eq!(search(1, 100, 64, &BTreeSet::new()), Ok(ObjId::new(1)));
    }

    #[test]
    fn bitmap_finds_gap() {
        let used: BTreeSet<u16> = (1..50).filter(|&i| i != 33).collect();
        assert_eq!(search(1, 50, 64, &used), Ok(ObjId::new(33)));
    }

    #[test]
    fn full_range_is_reported() {
        let used: BTreeSet<u16> = (1..600).collect();
        assert_eq!(search(1, 600, 8, &used), Err(FlashError::NoFreeObjectId));
    }

    #[test]
    fn compaction_narrows_to_sparse_bucket() {
        // 8 bytes of scratch: 64-id bitmap, 4 buckets while compacting.
        let used: BTreeSet<u16> = (1..1000).filter(|&i| i != 777).collect();
        assert_eq!(search(1, 1000, 8, &used), Ok(ObjId::new(777)));
    }

    #[test]
    fn last_short_bucket_capacity_is_respected() {
        // Width 130 with 4 buckets of 33: the last bucket holds only 31 ids.
        let used: BTreeSet<u16> = (1..131).filter(|&i| i != 130).collect();
        assert_eq!(search(1, 131, 8, &used), Ok(ObjId::new(130)));
    }

    #[test]
    fn non_header_sightings_mark_the_bitmap() {
        let mut scratch = vec![0_u8; 8];
        let found = search_free_id(1, 40, &mut scratch, |sink| {
            for id in 1..20 {
                sink(id, false);
            }
            Ok(())
        });
        assert_eq!(found, Ok(ObjId::new(20)));
    }

    proptest! {
        #[test]
        fn search_matches_brute_force(
            used in proptest::collection::btree_set(1_u16..400, 0..400),
            hi in 2_u32..400,
            scratch_len in 2_usize..40,
        ) {
            let found = search(1, hi, scratch_len, &used);
            let any_free = (1..hi).any(|i| !used.contains(&(i as u16)));
            match found {
                Ok(id) => {
                    prop_assert!(u32::from(id.get()) >= 1 && u32::from(id.get()) < hi);
                    prop_assert!(!used.contains(&id.get()));
                }
                Err(err) => {
                    prop_assert_eq!(err, FlashError::NoFreeObjectId);
                    prop_assert!(!any_free);
                }
            }
        }
    }
}
