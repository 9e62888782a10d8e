//! Page store I/O counters.
//!
//! Every read, write and erase that reaches the page store is tagged with an
//! [`IoTag`]. The tag decides cacheability and is the dimension the counters
//! are kept under.

use serde::Serialize;

/// Which structure an access touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IoKind {
    /// Lookup pages.
    Lookup,
    /// Object index header and plain index pages.
    Index,
    /// Object data pages.
    Data,
    /// Block trailers and whole-block operations.
    Meta,
}

/// What the access does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IoCmd {
    Read,
    /// Claiming a fresh page.
    Alloc,
    /// Programming more bits of an already claimed page.
    Update,
    Finalize,
    Delete,
    /// Copying a page to a new location.
    Move,
    Erase,
}

/// Operation tag passed with every page store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IoTag {
    pub kind: IoKind,
    pub cmd: IoCmd,
}

impl IoTag {
    pub const LU_READ: Self = Self::new(IoKind::Lookup, IoCmd::Read);
    pub const LU_ALLOC: Self = Self::new(IoKind::Lookup, IoCmd::Alloc);
    pub const LU_DELETE: Self = Self::new(IoKind::Lookup, IoCmd::Delete);
    pub const IX_READ: Self = Self::new(IoKind::Index, IoCmd::Read);
    pub const IX_UPDATE: Self = Self::new(IoKind::Index, IoCmd::Update);
    pub const DA_READ: Self = Self::new(IoKind::Data, IoCmd::Read);
    pub const DA_UPDATE: Self = Self::new(IoKind::Data, IoCmd::Update);
    pub const DA_MOVE: Self = Self::new(IoKind::Data, IoCmd::Move);
    pub const META_READ: Self = Self::new(IoKind::Meta, IoCmd::Read);
    pub const META_UPDATE: Self = Self::new(IoKind::Meta, IoCmd::Update);
    pub const META_ERASE: Self = Self::new(IoKind::Meta, IoCmd::Erase);

    #[must_use]
    pub const fn new(kind: IoKind, cmd: IoCmd) -> Self {
        Self { kind, cmd }
    }

    /// Tag for a page whose header says index or data.
    #[must_use]
    pub const fn for_page(is_index: bool, cmd: IoCmd) -> Self {
        Self::new(if is_index { IoKind::Index } else { IoKind::Data }, cmd)
    }

    /// Reads of index and data pages go through the read cache.
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        matches!(self.cmd, IoCmd::Read) && matches!(self.kind, IoKind::Index | IoKind::Data)
    }
}

/// Per-kind totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IoKindTotals {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub erases: u64,
}

/// Snapshot of a volume's I/O counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IoMetricsSnapshot {
    pub lookup: IoKindTotals,
    pub index: IoKindTotals,
    pub data: IoKindTotals,
    pub meta: IoKindTotals,
    pub erases: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl IoMetricsSnapshot {
    /// Reads summed over every kind.
    #[must_use]
    pub const fn total_reads(&self) -> u64 {
        self.lookup.reads + self.index.reads + self.data.reads + self.meta.reads
    }

    /// Writes summed over every kind.
    #[must_use]
    pub const fn total_writes(&self) -> u64 {
        self.lookup.writes + self.index.writes + self.data.writes + self.meta.writes
    }
}

/// Live counters owned by the page store.
#[derive(Debug, Default)]
pub(crate) struct IoMetrics {
    snap: IoMetricsSnapshot,
}

impl IoMetrics {
    fn totals(&mut self, kind: IoKind) -> &mut IoKindTotals {
        match kind {
            IoKind::Lookup => &mut self.snap.lookup,
            IoKind::Index => &mut self.snap.index,
            IoKind::Data => &mut self.snap.data,
            IoKind::Meta => &mut self.snap.meta,
        }
    }

    pub(crate) fn record_read(&mut self, tag: IoTag, len: usize) {
        let t = self.totals(tag.kind);
        t.reads = t.reads.saturating_add(1);
        t.bytes_read = t.bytes_read.saturating_add(len as u64);
    }

    pub(crate) fn record_write(&mut self, tag: IoTag, len: usize) {
        let t = self.totals(tag.kind);
        t.writes = t.writes.saturating_add(1);
        t.bytes_written = t.bytes_written.saturating_add(len as u64);
    }

    pub(crate) fn record_erase(&mut self, tag: IoTag) {
        let t = self.totals(tag.kind);
        t.erases = t.erases.saturating_add(1);
        self.snap.erases = self.snap.erases.saturating_add(1);
    }

    pub(crate) fn record_cache(&mut self, hit: bool) {
        if hit {
            self.snap.cache_hits = self.snap.cache_hits.saturating_add(1);
        } else {
            self.snap.cache_misses = self.snap.cache_misses.saturating_add(1);
        }
    }

    pub(crate) const fn snapshot(&self) -> IoMetricsSnapshot {
        self.snap
    }

    pub(crate) fn reset(&mut self) {
        self.snap = IoMetricsSnapshot::default();
    }
}
