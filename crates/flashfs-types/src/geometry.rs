//! Pure addressing math.
//!
//! Converts between block index, page index, lookup-entry index and absolute
//! media address. Holds no state beyond the validated configuration.

use flashfs_error::{FlashError, Result};

use crate::index::{HEADER_PTR_OFFSET, PLAIN_PTR_OFFSET};
use crate::page::PAGE_HEADER_SIZE;
use crate::{BlockIx, MAGIC_BASE, PIX_NONE, PageIx, SpanIx, VolumeConfig};

const MIN_PAGE_SIZE: u32 = 64;
const MIN_BLOCKS: u32 = 4;
/// Trailer slots reserved at the tail of the last lookup page.
const TRAILER_SLOTS: u32 = 2;

/// Validated volume geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    phys_addr: u32,
    block_size: u32,
    page_size: u32,
    block_count: u32,
    pages_per_block: u32,
    lookup_pages: u32,
    use_magic: bool,
}

impl Geometry {
    /// Validate `cfg` and derive the geometry.
    pub fn new(cfg: &VolumeConfig) -> Result<Self> {
        let page_size = cfg.page_size;
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(FlashError::config(format!(
                "page size {page_size} must be a power of two >= {MIN_PAGE_SIZE}"
            )));
        }
        if cfg.block_size == 0 || cfg.block_size % page_size != 0 {
            return Err(FlashError::config(format!(
                "block size {} is not a multiple of page size {page_size}",
                cfg.block_size
            )));
        }
        if cfg.phys_size % cfg.block_size != 0 {
            return Err(FlashError::config(format!(
                "volume size {} is not a multiple of block size {}",
                cfg.phys_size, cfg.block_size
            )));
        }
        let block_count = cfg.phys_size / cfg.block_size;
        if block_count < MIN_BLOCKS {
            return Err(FlashError::config(format!(
                "volume needs at least {MIN_BLOCKS} blocks, has {block_count}"
            )));
        }
        let pages_per_block = cfg.block_size / page_size;
        let total_pages = u64::from(block_count) * u64::from(pages_per_block);
        if total_pages >= u64::from(PIX_NONE) {
            return Err(FlashError::config(format!(
                "{total_pages} pages do not fit a 16-bit page index"
            )));
        }

        let slots_per_page = page_size / 2;
        let mut lookup_pages = (pages_per_block * 2).div_ceil(page_size).max(1);
        if lookup_pages * slots_per_page < pages_per_block - lookup_pages + TRAILER_SLOTS {
            lookup_pages += 1;
        }
        if lookup_pages + 1 >= pages_per_block {
            return Err(FlashError::config(format!(
                "block of {pages_per_block} pages leaves no room for data pages"
            )));
        }

        Ok(Self {
            phys_addr: cfg.phys_addr,
            block_size: cfg.block_size,
            page_size,
            block_count,
            pages_per_block,
            lookup_pages,
            use_magic: cfg.use_magic,
        })
    }

    #[inline]
    #[must_use]
    pub const fn phys_addr(&self) -> u32 {
        self.phys_addr
    }

    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Page size as `usize` for buffer sizing.
    #[inline]
    #[must_use]
    pub const fn page_len(&self) -> usize {
        self.page_size as usize
    }

    #[inline]
    #[must_use]
    pub const fn block_count(&self) -> u32 {
        self.block_count
    }

    #[inline]
    #[must_use]
    pub const fn pages_per_block(&self) -> u32 {
        self.pages_per_block
    }

    /// Lookup pages at the head of each block.
    #[inline]
    #[must_use]
    pub const fn lookup_pages(&self) -> u32 {
        self.lookup_pages
    }

    /// Data pages (and lookup entries) per block.
    #[inline]
    #[must_use]
    pub const fn entries_per_block(&self) -> u32 {
        self.pages_per_block - self.lookup_pages
    }

    /// Lookup slots held by one lookup page.
    #[inline]
    #[must_use]
    pub const fn entries_per_lookup_page(&self) -> u32 {
        self.page_size / 2
    }

    #[inline]
    #[must_use]
    pub const fn total_pages(&self) -> u32 {
        self.block_count * self.pages_per_block
    }

    /// Data pages across the volume.
    #[inline]
    #[must_use]
    pub const fn total_data_pages(&self) -> u32 {
        self.block_count * self.entries_per_block()
    }

    #[inline]
    #[must_use]
    pub const fn use_magic(&self) -> bool {
        self.use_magic
    }

    /// Payload bytes carried by one data page.
    #[inline]
    #[must_use]
    pub const fn data_page_size(&self) -> u32 {
        self.page_size - PAGE_HEADER_SIZE as u32
    }

    /// Data pointers held by the object index header page.
    #[inline]
    #[must_use]
    pub const fn header_ix_len(&self) -> u32 {
        (self.page_size - HEADER_PTR_OFFSET as u32) / 2
    }

    /// Data pointers held by a plain object index page.
    #[inline]
    #[must_use]
    pub const fn page_ix_len(&self) -> u32 {
        (self.page_size - PLAIN_PTR_OFFSET as u32) / 2
    }

    /// Upper bound on concurrently existing objects.
    #[inline]
    #[must_use]
    pub const fn max_objects(&self) -> u32 {
        self.total_data_pages() / 2
    }

    // ── span arithmetic ────────────────────────────────────────────────

    /// Index-page span holding the pointer for data span `data_spix`.
    #[must_use]
    pub const fn index_span_for(&self, data_spix: SpanIx) -> SpanIx {
        let h = self.header_ix_len();
        let s = data_spix as u32;
        if s < h {
            0
        } else {
            (1 + (s - h) / self.page_ix_len()) as SpanIx
        }
    }

    /// Slot within its index page holding the pointer for `data_spix`.
    #[must_use]
    pub const fn index_slot_for(&self, data_spix: SpanIx) -> usize {
        let h = self.header_ix_len();
        let s = data_spix as u32;
        if s < h {
            s as usize
        } else {
            ((s - h) % self.page_ix_len()) as usize
        }
    }

    /// First data span covered by index page `ix_spix`.
    #[must_use]
    pub const fn first_data_span(&self, ix_spix: SpanIx) -> u32 {
        if ix_spix == 0 {
            0
        } else {
            self.header_ix_len() + (ix_spix as u32 - 1) * self.page_ix_len()
        }
    }

    /// Pointer capacity of index page `ix_spix`.
    #[must_use]
    pub const fn ix_len_for_span(&self, ix_spix: SpanIx) -> u32 {
        if ix_spix == 0 {
            self.header_ix_len()
        } else {
            self.page_ix_len()
        }
    }

    // ── addressing ──────────────────────────────────────────────────────

    #[inline]
    #[must_use]
    pub const fn block_addr(&self, bix: BlockIx) -> u32 {
        self.phys_addr + bix as u32 * self.block_size
    }

    #[inline]
    #[must_use]
    pub const fn page_addr(&self, pix: PageIx) -> u32 {
        self.phys_addr + pix as u32 * self.page_size
    }

    #[inline]
    #[must_use]
    pub const fn block_of_page(&self, pix: PageIx) -> BlockIx {
        (pix as u32 / self.pages_per_block) as BlockIx
    }

    #[inline]
    #[must_use]
    pub const fn first_page_of_block(&self, bix: BlockIx) -> PageIx {
        (bix as u32 * self.pages_per_block) as PageIx
    }

    /// True when `pix` lies outside the volume.
    #[inline]
    #[must_use]
    pub const fn is_out_of_range(&self, pix: PageIx) -> bool {
        pix as u32 >= self.total_pages()
    }

    #[inline]
    #[must_use]
    pub const fn is_lookup_page(&self, pix: PageIx) -> bool {
        pix as u32 % self.pages_per_block < self.lookup_pages
    }

    /// Page described by lookup entry `entry` of block `bix`.
    #[inline]
    #[must_use]
    pub const fn entry_to_page(&self, bix: BlockIx, entry: u32) -> PageIx {
        (bix as u32 * self.pages_per_block + self.lookup_pages + entry) as PageIx
    }

    /// Lookup coordinates of a data page.
    #[must_use]
    pub const fn page_to_entry(&self, pix: PageIx) -> (BlockIx, u32) {
        let bix = pix as u32 / self.pages_per_block;
        let entry = pix as u32 % self.pages_per_block - self.lookup_pages;
        (bix as BlockIx, entry)
    }

    /// Media address of a lookup slot.
    #[inline]
    #[must_use]
    pub const fn lookup_entry_addr(&self, bix: BlockIx, entry: u32) -> u32 {
        self.block_addr(bix) + entry * 2
    }

    /// Address of lookup page `lpage` of block `bix`.
    #[inline]
    #[must_use]
    pub const fn lookup_page_addr(&self, bix: BlockIx, lpage: u32) -> u32 {
        self.block_addr(bix) + lpage * self.page_size
    }

    /// Address of the erase-count trailer slot.
    #[inline]
    #[must_use]
    pub const fn erase_count_addr(&self, bix: BlockIx) -> u32 {
        self.block_addr(bix) + self.lookup_pages * self.page_size - 2
    }

    /// Address of the magic trailer slot.
    #[inline]
    #[must_use]
    pub const fn magic_addr(&self, bix: BlockIx) -> u32 {
        self.block_addr(bix) + self.lookup_pages * self.page_size - 4
    }

    /// Expected magic of block `bix`.
    #[must_use]
    pub const fn magic(&self, bix: BlockIx) -> u16 {
        magic_for(self.page_size, self.block_count, bix)
    }
}

/// Magic stamped on block `bix` of a volume with `block_count` blocks.
///
/// Encodes the distance to the end of the volume so a probe can recover the
/// block count from the first blocks alone.
#[must_use]
pub const fn magic_for(page_size: u32, block_count: u32, bix: BlockIx) -> u16 {
    ((MAGIC_BASE ^ page_size ^ (block_count - bix as u32)) & 0xFFFF) as u16
}

/// Inverse of [`magic_for`]: the block count implied by `magic` read at `bix`.
#[must_use]
pub const fn block_count_from_magic(page_size: u32, magic: u16, bix: BlockIx) -> u32 {
    ((magic as u32 ^ MAGIC_BASE ^ page_size) & 0xFFFF) + bix as u32
}
