//! Page store: tagged byte-range access to the media.
//!
//! Owns the HAL, the read cache and the I/O counters. Knows page and lookup
//! addressing but no object structure.

use flashfs_error::{FlashError, Result};
use flashfs_hal::Flash;
use flashfs_types::page::{PAGE_FLAGS_OFFSET, PAGE_HEADER_SIZE};
use flashfs_types::{BlockIx, Geometry, LookupEntry, PageFlags, PageHeader, PageIx};
use tracing::trace;

use crate::cache::PageCache;
use crate::instrumentation::{IoMetrics, IoMetricsSnapshot, IoTag};

/// Stack chunk used by [`PageStore::copy`].
const COPY_CHUNK: usize = 32;

pub(crate) struct PageStore<F> {
    flash: F,
    geo: Geometry,
    cache: PageCache,
    metrics: IoMetrics,
}

impl<F: Flash> PageStore<F> {
    pub(crate) fn new(flash: F, geo: Geometry, cache_pages: usize) -> Self {
        Self {
            flash,
            geo,
            cache: PageCache::new(cache_pages),
            metrics: IoMetrics::default(),
        }
    }

    pub(crate) fn into_flash(self) -> F {
        self.flash
    }

    pub(crate) const fn flash(&self) -> &F {
        &self.flash
    }

    pub(crate) fn flash_mut(&mut self) -> &mut F {
        self.cache.clear();
        &mut self.flash
    }

    pub(crate) const fn metrics(&self) -> IoMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    fn page_span(&self, addr: u32, len: usize) -> (PageIx, PageIx) {
        let rel = addr.saturating_sub(self.geo.phys_addr());
        let ps = self.geo.page_size();
        let first = rel / ps;
        let last = (rel + (len.max(1) as u32) - 1) / ps;
        (first as PageIx, last.min(u32::from(PageIx::MAX)) as PageIx)
    }

    /// Read `buf.len()` bytes at `addr`.
    pub(crate) fn read(&mut self, tag: IoTag, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.metrics.record_read(tag, buf.len());
        if tag.is_cacheable() && self.cache.is_enabled() {
            let (first, last) = self.page_span(addr, buf.len());
            if first == last {
                let page_start = self.geo.page_addr(first);
                let at = (addr - page_start) as usize;
                if let Some(page) = self.cache.get(first) {
                    buf.copy_from_slice(&page[at..at + buf.len()]);
                    self.metrics.record_cache(true);
                    return Ok(());
                }
                self.metrics.record_cache(false);
                let mut page = vec![0_u8; self.geo.page_len()].into_boxed_slice();
                self.flash.read(page_start, &mut page)?;
                buf.copy_from_slice(&page[at..at + buf.len()]);
                self.cache.insert(first, page);
                return Ok(());
            }
        }
        self.flash.read(addr, buf)
    }

    /// Program `data` at `addr`.
    pub(crate) fn write(&mut self, tag: IoTag, addr: u32, data: &[u8]) -> Result<()> {
        self.metrics.record_write(tag, data.len());
        let (first, last) = self.page_span(addr, data.len());
        self.cache.invalidate(first, last);
        trace!(?tag, addr, len = data.len(), "write");
        self.flash.write(addr, data)
    }

    pub(crate) fn erase_block(&mut self, tag: IoTag, bix: BlockIx) -> Result<()> {
        self.metrics.record_erase(tag);
        trace!(?tag, block = bix, "erase");
        let first = self.geo.first_page_of_block(bix);
        let last = first + (self.geo.pages_per_block() - 1) as PageIx;
        self.cache.invalidate(first, last);
        self.flash
            .erase(self.geo.block_addr(bix), self.geo.block_size())
    }

    /// Copy `len` bytes from `src` to `dst` through a small stack buffer.
    pub(crate) fn copy(&mut self, tag: IoTag, dst: u32, src: u32, len: u32) -> Result<()> {
        let mut chunk = [0_u8; COPY_CHUNK];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(COPY_CHUNK as u32) as usize;
            self.flash.read(src + done, &mut chunk[..n])?;
            self.metrics.record_read(tag, n);
            self.write(tag, dst + done, &chunk[..n])?;
            done += n as u32;
        }
        Ok(())
    }

    // ── pages ───────────────────────────────────────────────────────────

    pub(crate) fn read_header(&mut self, tag: IoTag, pix: PageIx) -> Result<PageHeader> {
        let mut raw = [0_u8; PAGE_HEADER_SIZE];
        self.read(tag, self.geo.page_addr(pix), &mut raw)?;
        PageHeader::decode(&raw)
    }

    pub(crate) fn write_header(&mut self, tag: IoTag, pix: PageIx, hdr: PageHeader) -> Result<()> {
        self.write(tag, self.geo.page_addr(pix), &hdr.encode())
    }

    /// Mark `states` reached on `pix` by clearing their flag bits.
    pub(crate) fn reach_flags(&mut self, tag: IoTag, pix: PageIx, states: PageFlags) -> Result<()> {
        let addr = self.geo.page_addr(pix) + PAGE_FLAGS_OFFSET as u32;
        self.write(tag, addr, &[PageFlags::reached(states).bits()])
    }

    pub(crate) fn read_page(&mut self, tag: IoTag, pix: PageIx, buf: &mut [u8]) -> Result<()> {
        self.read(tag, self.geo.page_addr(pix), buf)
    }

    pub(crate) fn write_page(&mut self, tag: IoTag, pix: PageIx, buf: &[u8]) -> Result<()> {
        self.write(tag, self.geo.page_addr(pix), buf)
    }

    /// Copy the body of `src` (everything after the header) into `dst`.
    pub(crate) fn copy_body(&mut self, tag: IoTag, dst: PageIx, src: PageIx) -> Result<()> {
        let hs = PAGE_HEADER_SIZE as u32;
        self.copy(
            tag,
            self.geo.page_addr(dst) + hs,
            self.geo.page_addr(src) + hs,
            self.geo.page_size() - hs,
        )
    }

    // ── lookup ──────────────────────────────────────────────────────────

    pub(crate) fn read_lookup_page(&mut self, bix: BlockIx, lpage: u32, buf: &mut [u8]) -> Result<()> {
        let addr = self.geo.lookup_page_addr(bix, lpage);
        self.read(IoTag::LU_READ, addr, buf)
    }

    pub(crate) fn read_lookup(&mut self, bix: BlockIx, entry: u32) -> Result<LookupEntry> {
        let mut raw = [0_u8; 2];
        self.read(IoTag::LU_READ, self.geo.lookup_entry_addr(bix, entry), &mut raw)?;
        Ok(LookupEntry::from_raw(u16::from_le_bytes(raw)))
    }

    pub(crate) fn write_lookup(
        &mut self,
        tag: IoTag,
        bix: BlockIx,
        entry: u32,
        value: LookupEntry,
    ) -> Result<()> {
        if entry >= self.geo.entries_per_block() {
            return Err(FlashError::internal(format!(
                "lookup entry {entry} out of range in block {bix}"
            )));
        }
        let addr = self.geo.lookup_entry_addr(bix, entry);
        self.write(tag, addr, &value.to_raw().to_le_bytes())
    }

    // ── block trailer ───────────────────────────────────────────────────

    pub(crate) fn read_u16(&mut self, tag: IoTag, addr: u32) -> Result<u16> {
        let mut raw = [0_u8; 2];
        self.read(tag, addr, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    pub(crate) fn read_erase_count(&mut self, bix: BlockIx) -> Result<u16> {
        self.read_u16(IoTag::META_READ, self.geo.erase_count_addr(bix))
    }

    pub(crate) fn read_magic(&mut self, bix: BlockIx) -> Result<u16> {
        self.read_u16(IoTag::META_READ, self.geo.magic_addr(bix))
    }

    /// Stamp a freshly erased block with its erase count and, when enabled,
    /// its magic.
    pub(crate) fn stamp_block(&mut self, bix: BlockIx, erase_count: u16) -> Result<()> {
        let ec_addr = self.geo.erase_count_addr(bix);
        self.write(IoTag::META_UPDATE, ec_addr, &erase_count.to_le_bytes())?;
        if self.geo.use_magic() {
            let magic = self.geo.magic(bix);
            self.write(IoTag::META_UPDATE, self.geo.magic_addr(bix), &magic.to_le_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::IoCmd;
    use flashfs_hal::RamFlash;
    use flashfs_types::{ObjId, VolumeConfig};

    fn store(cache: usize) -> PageStore<RamFlash> {
        let cfg = VolumeConfig::with_geometry(4, 4096, 256);
        let geo = Geometry::new(&cfg).expect("geometry");
        PageStore::new(RamFlash::new(cfg.phys_size, 4096), geo, cache)
    }

    #[test]
    fn cached_reads_see_later_writes() {
        let mut s = store(4);
        let mut buf = [0_u8; 4];
        s.read(IoTag::DA_READ, 256 + 10, &mut buf).expect("read");
        assert_eq!(buf, [0xFF; 4]);
        s.write(IoTag::DA_UPDATE, 256 + 10, &[1, 2, 3, 4]).expect("write");
        s.read(IoTag::DA_READ, 256 + 10, &mut buf).expect("read");
        assert_eq!(buf, [1, 2, 3, 4]);
        s.read(IoTag::DA_READ, 256 + 12, &mut buf[..2]).expect("read");
        let m = s.metrics();
        assert_eq!(m.cache_misses, 2);
        assert_eq!(m.cache_hits, 1);
    }

    #[test]
    fn copy_streams_in_chunks() {
        let mut s = store(0);
        let src: Vec<u8> = (0..100).collect();
        s.write(IoTag::DA_UPDATE, 300, &src).expect("write");
        s.copy(IoTag::DA_MOVE, 1000, 300, 100).expect("copy");
        let mut out = vec![0_u8; 100];
        s.read(IoTag::DA_READ, 1000, &mut out).expect("read");
        assert_eq!(out, src);
    }

    #[test]
    fn flags_only_clear_bits() {
        let mut s = store(0);
        let hdr = PageHeader::new(
            ObjId::new(1).data_tag(),
            0,
            PageFlags::reached(PageFlags::USED),
        );
        s.write_header(IoTag::for_page(false, IoCmd::Alloc), 1, hdr).expect("header");
        s.reach_flags(IoTag::DA_UPDATE, 1, PageFlags::FINAL).expect("finalize");
        let back = s.read_header(IoTag::DA_READ, 1).expect("read");
        assert!(back.flags.is_live_final());
        assert_eq!(back.tag(), ObjId::new(1).data_tag());
    }

    #[test]
    fn lookup_entries_round_trip_and_erase() {
        let mut s = store(0);
        let tag = ObjId::new(9).index_tag();
        s.write_lookup(IoTag::LU_ALLOC, 1, 3, LookupEntry::Object(tag)).expect("lu");
        assert_eq!(s.read_lookup(1, 3).expect("lu"), LookupEntry::Object(tag));
        s.write_lookup(IoTag::LU_DELETE, 1, 3, LookupEntry::Deleted).expect("lu");
        assert_eq!(s.read_lookup(1, 3).expect("lu"), LookupEntry::Deleted);
        s.erase_block(IoTag::META_ERASE, 1).expect("erase");
        assert_eq!(s.read_lookup(1, 3).expect("lu"), LookupEntry::Free);
        s.stamp_block(1, 7).expect("stamp");
        assert_eq!(s.read_erase_count(1).expect("ec"), 7);
        assert_eq!(s.read_magic(1).expect("magic"), s.geo.magic(1));
        assert!(s.write_lookup(IoTag::LU_ALLOC, 1, 15, LookupEntry::Deleted).is_err());
    }
}
