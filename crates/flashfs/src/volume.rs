//! Per-mount volume state and lifecycle: format, probe, mount, unmount.
//!
//! A [`Volume`] owns the page store, both scratch buffers, the open handle
//! table, the free-page cursor and the running page counters. Every nucleus
//! operation is a method on it; nothing is process global.

use flashfs_error::{FlashError, Result};
use flashfs_hal::Flash;
use flashfs_types::geometry::block_count_from_magic;
use flashfs_types::{BlockIx, Geometry, LookupEntry, ObjId, VolumeConfig};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::check::{CheckListener, CheckSummary};
use crate::file::FileObject;
use crate::instrumentation::{IoMetricsSnapshot, IoTag};
use crate::lookup::{LookupPos, Visit};
use crate::store::PageStore;

/// Running page counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VolumeStats {
    /// Pages claimed by live objects.
    pub allocated: u32,
    /// Pages deleted and waiting for GC.
    pub deleted: u32,
    /// Blocks whose every data page is free.
    pub free_blocks: u32,
    /// Highest erase count seen on any block.
    pub max_erase_count: u16,
}

/// One mounted (or mountable) flash volume.
pub struct Volume<F> {
    pub(crate) cfg: VolumeConfig,
    pub(crate) geo: Geometry,
    pub(crate) store: PageStore<F>,
    lu_work: Vec<u8>,
    work: Vec<u8>,
    pub(crate) free_cursor: LookupPos,
    pub(crate) stats: VolumeStats,
    pub(crate) files: Vec<Option<FileObject>>,
    /// Objects removed by name while handles were still open.
    pub(crate) unlinked: SmallVec<[ObjId; 4]>,
    /// Set while GC runs so its own allocations do not recurse into it.
    pub(crate) cleaning: bool,
    /// Block being cleaned; never handed out by the free-page search.
    pub(crate) gc_block: Option<BlockIx>,
    pub(crate) check_listener: Option<CheckListener>,
    /// Repairs counted by the running check.
    pub(crate) check_tally: CheckSummary,
    mounted: bool,
}

impl<F> std::fmt::Debug for Volume<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("geo", &self.geo)
            .field("stats", &self.stats)
            .field("mounted", &self.mounted)
            .field("open_files", &self.files.iter().flatten().count())
            .finish_non_exhaustive()
    }
}

impl<F: Flash> Volume<F> {
    /// Wrap `flash` with the given configuration. The volume starts unmounted.
    pub fn new(flash: F, cfg: VolumeConfig) -> Result<Self> {
        let geo = Geometry::new(&cfg)?;
        if cfg.max_open_files == 0 {
            return Err(FlashError::config("max_open_files must be at least 1"));
        }
        let page_len = geo.page_len();
        Ok(Self {
            store: PageStore::new(flash, geo, cfg.cache_pages),
            lu_work: vec![0xFF; page_len],
            work: vec![0xFF; page_len],
            free_cursor: LookupPos::START,
            stats: VolumeStats::default(),
            files: Vec::new(),
            unlinked: SmallVec::new(),
            cleaning: false,
            gc_block: None,
            check_listener: None,
            check_tally: CheckSummary::default(),
            mounted: false,
            cfg,
            geo,
        })
    }

    /// Derive the volume size from the block magics of `flash`.
    ///
    /// Reads the magic of the first three blocks and succeeds when at least
    /// two imply the same block count. `cfg.phys_size` is ignored.
    pub fn probe(flash: &mut F, cfg: &VolumeConfig) -> Result<u32> {
        let mut probe_cfg = cfg.clone();
        probe_cfg.phys_size = cfg.block_size * 4;
        let geo = Geometry::new(&probe_cfg)?;
        let mut counts = [0_u32; 3];
        for (bix, count) in counts.iter_mut().enumerate() {
            let mut raw = [0_u8; 2];
            flash.read(geo.magic_addr(bix as BlockIx), &mut raw)?;
            *count = block_count_from_magic(cfg.page_size, u16::from_le_bytes(raw), bix as BlockIx);
        }
        let agreed = if counts[0] == counts[1] || counts[0] == counts[2] {
            counts[0]
        } else if counts[1] == counts[2] {
            counts[1]
        } else {
            return Err(FlashError::Probe {
                detail: format!("block magics disagree: {counts:?}"),
            });
        };
        if agreed < 4 {
            return Err(FlashError::Probe {
                detail: format!("implausible block count {agreed}"),
            });
        }
        debug!(blocks = agreed, "probed volume");
        Ok(agreed * cfg.block_size)
    }

    /// Erase and stamp every block. The volume must be unmounted.
    pub fn format(&mut self) -> Result<()> {
        if self.mounted {
            return Err(FlashError::config("cannot format a mounted volume"));
        }
        for bix in 0..self.geo.block_count() as BlockIx {
            self.store.erase_block(IoTag::META_ERASE, bix)?;
            self.store.stamp_block(bix, 0)?;
        }
        info!(
            blocks = self.geo.block_count(),
            block_size = self.geo.block_size(),
            page_size = self.geo.page_size(),
            "formatted volume"
        );
        Ok(())
    }

    /// Validate block magics, remedy one interrupted erase and rebuild the
    /// page counters from the lookup tables.
    pub fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Ok(());
        }
        let mut bad: SmallVec<[BlockIx; 2]> = SmallVec::new();
        if self.geo.use_magic() {
            for bix in 0..self.geo.block_count() as BlockIx {
                if self.store.read_magic(bix)? != self.geo.magic(bix) {
                    bad.push(bix);
                    if bad.len() > 1 {
                        return Err(FlashError::NotAFilesystem);
                    }
                }
            }
        }
        self.rebuild_stats()?;
        if let Some(&bix) = bad.first() {
            warn!(block = bix, "block magic invalid, assuming interrupted erase");
            self.erase_block(bix)?;
            self.rebuild_stats()?;
        }
        self.free_cursor = LookupPos::START;
        self.mounted = true;
        info!(
            allocated = self.stats.allocated,
            deleted = self.stats.deleted,
            free_blocks = self.stats.free_blocks,
            "mounted volume"
        );
        Ok(())
    }

    /// Flush and close every handle, then mark the volume unmounted.
    pub fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        let fds: Vec<u16> = self.open_fds().collect();
        for fd in fds {
            self.close(fd)?;
        }
        self.files.clear();
        self.unlinked.clear();
        self.mounted = false;
        info!("unmounted volume");
        Ok(())
    }

    /// Release the media.
    pub fn into_flash(self) -> F {
        self.store.into_flash()
    }

    #[must_use]
    pub const fn is_mounted(&self) -> bool {
        self.mounted
    }

    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geo
    }

    #[must_use]
    pub const fn config(&self) -> &VolumeConfig {
        &self.cfg
    }

    #[must_use]
    pub const fn stats(&self) -> VolumeStats {
        self.stats
    }

    #[must_use]
    pub const fn metrics(&self) -> IoMetricsSnapshot {
        self.store.metrics()
    }

    pub fn reset_metrics(&mut self) {
        self.store.reset_metrics();
    }

    #[must_use]
    pub const fn flash(&self) -> &F {
        self.store.flash()
    }

    /// Raw media access; drops the read cache.
    pub fn flash_mut(&mut self) -> &mut F {
        self.store.flash_mut()
    }

    pub(crate) fn ensure_mounted(&self) -> Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(FlashError::NotMounted)
        }
    }

    // ── scratch buffers ─────────────────────────────────────────────────

    /// Borrow the work buffer. A nested borrower gets a fresh allocation.
    pub(crate) fn take_work(&mut self) -> Vec<u8> {
        let mut buf = std::mem::take(&mut self.work);
        buf.resize(self.geo.page_len(), 0xFF);
        buf
    }

    pub(crate) fn restore_work(&mut self, buf: Vec<u8>) {
        self.work = buf;
    }

    pub(crate) fn take_lu_work(&mut self) -> Vec<u8> {
        let mut buf = std::mem::take(&mut self.lu_work);
        buf.resize(self.geo.page_len(), 0xFF);
        buf
    }

    pub(crate) fn restore_lu_work(&mut self, buf: Vec<u8>) {
        self.lu_work = buf;
    }

    // ── counters and blocks ─────────────────────────────────────────────

    /// Recount allocated/deleted pages and free blocks from the lookup tables.
    pub(crate) fn rebuild_stats(&mut self) -> Result<()> {
        let blocks = self.geo.block_count() as usize;
        let mut free_per_block = vec![0_u32; blocks];
        let mut stats = VolumeStats::default();
        self.scan_lookup::<()>(LookupPos::START, false, |_, pos, entry| {
            match entry {
                LookupEntry::Free => free_per_block[usize::from(pos.bix)] += 1,
                LookupEntry::Deleted => stats.deleted += 1,
                LookupEntry::Object(_) => stats.allocated += 1,
            }
            Ok(Visit::Continue)
        })?;
        let epb = self.geo.entries_per_block();
        stats.free_blocks = free_per_block.iter().filter(|&&n| n == epb).count() as u32;
        for bix in 0..blocks as BlockIx {
            let ec = self.store.read_erase_count(bix)?;
            if ec != u16::MAX {
                stats.max_erase_count = stats.max_erase_count.max(ec);
            }
        }
        self.stats = stats;
        Ok(())
    }

    /// Erase `bix` and stamp it with the next erase count.
    pub(crate) fn erase_block(&mut self, bix: BlockIx) -> Result<()> {
        let next = self.stats.max_erase_count.wrapping_add(1);
        let next = if next == u16::MAX { 0 } else { next };
        self.store.erase_block(IoTag::META_ERASE, bix)?;
        self.store.stamp_block(bix, next)?;
        self.stats.max_erase_count = self.stats.max_erase_count.max(next);
        if self.free_cursor.bix == bix {
            self.free_cursor.entry = 0;
        }
        debug!(block = bix, erase_count = next, "erased block");
        Ok(())
    }
}
