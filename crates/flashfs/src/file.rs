//! File handles on top of the object index engine.
//!
//! A handle pairs an [`ObjectCursor`] with a byte offset, its open flags and
//! an optional write cache that gathers small sequential writes into one
//! page worth of data. Every structural change to an object is broadcast to
//! all handles of that object through [`Volume::notify`].

use std::io::SeekFrom;

use bitflags::bitflags;
use flashfs_error::{FlashError, Result};
use flashfs_hal::Flash;
use flashfs_types::index::check_name;
use flashfs_types::{ObjId, ObjType, PageIx};
use serde::Serialize;
use tracing::{debug, debug_span, trace, warn};

use crate::object::{IndexEvent, ObjectCursor};
use crate::volume::Volume;

/// File descriptor; slot index plus one.
pub type Fd = u16;

bitflags! {
    /// Flags accepted by [`Volume::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct OpenFlags: u16 {
        /// Create the object when no object carries the name.
        const CREATE = 1 << 0;
        /// Truncate an existing object to zero length.
        const TRUNC = 1 << 1;
        /// With `CREATE`, fail when the name already exists.
        const EXCL = 1 << 2;
        /// Every write goes to the end of the object.
        const APPEND = 1 << 3;
        const RDONLY = 1 << 4;
        const WRONLY = 1 << 5;
        const RDWR = Self::RDONLY.bits() | Self::WRONLY.bits();
        /// Bypass the write cache.
        const DIRECT = 1 << 6;
    }
}

/// Metadata of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub id: ObjId,
    pub name: Vec<u8>,
    pub size: u32,
    pub obj_type: ObjType,
    /// Page currently holding the index header.
    pub hdr_pix: PageIx,
}

impl Stat {
    /// Name as text, replacing invalid UTF-8.
    #[must_use]
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Volume capacity in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsInfo {
    pub total: u32,
    pub used: u32,
}

/// Bytes written by a handle but not yet committed to media.
#[derive(Debug, Clone)]
struct WriteCache {
    start: u32,
    buf: Vec<u8>,
}

impl WriteCache {
    fn end(&self) -> u32 {
        self.start + self.buf.len() as u32
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FileObject {
    fd: Fd,
    cur: ObjectCursor,
    offset: u32,
    flags: OpenFlags,
    obj_type: ObjType,
    cache: Option<WriteCache>,
}

impl FileObject {
    /// End of the object as this handle sees it, pending bytes included.
    fn visible_len(&self) -> u32 {
        let len = self.cur.len();
        self.cache.as_ref().map_or(len, |c| c.end().max(len))
    }
}

const fn slot_of(fd: Fd) -> usize {
    fd as usize - 1
}

impl<F: Flash> Volume<F> {
    // ── handle table ────────────────────────────────────────────────────

    /// Follow a structural change in every handle of the object.
    pub(crate) fn notify(&mut self, ev: &IndexEvent) {
        let (IndexEvent::Updated { id, .. } | IndexEvent::Removed { id, .. }) = *ev;
        let resized = matches!(ev, IndexEvent::Updated { size: Some(_), .. });
        for slot in &mut self.files {
            let Some(file) = slot.as_mut() else {
                continue;
            };
            if file.cur.id != id {
                continue;
            }
            if !file.cur.apply(ev) {
                trace!(fd = file.fd, %id, "handle released with its object");
                *slot = None;
                continue;
            }
            if !resized {
                continue;
            }
            let len = file.cur.len();
            if file.cache.as_ref().is_some_and(|c| c.start > len) {
                debug!(fd = file.fd, %id, len, "dropping write cache beyond end of object");
                file.cache = None;
            }
            file.offset = file.offset.min(file.visible_len());
        }
        if let IndexEvent::Removed { id, span: 0 } = *ev {
            self.unlinked.retain(|u| *u != id);
        }
    }

    /// Descriptors currently open.
    pub(crate) fn open_fds(&self) -> impl Iterator<Item = Fd> + '_ {
        self.files.iter().flatten().map(|f| f.fd)
    }

    fn handle(&self, fd: Fd) -> Result<&FileObject> {
        if fd == 0 {
            return Err(FlashError::BadDescriptor { fd });
        }
        self.files
            .get(slot_of(fd))
            .and_then(Option::as_ref)
            .ok_or(FlashError::BadDescriptor { fd })
    }

    fn handle_mut(&mut self, fd: Fd) -> Result<&mut FileObject> {
        if fd == 0 {
            return Err(FlashError::BadDescriptor { fd });
        }
        self.files
            .get_mut(slot_of(fd))
            .and_then(Option::as_mut)
            .ok_or(FlashError::BadDescriptor { fd })
    }

    /// Store `cur` back into `fd` unless the handle went away meanwhile.
    fn store_cursor(&mut self, fd: Fd, cur: ObjectCursor) {
        if let Ok(file) = self.handle_mut(fd) {
            file.cur = cur;
        }
    }

    fn open_page(&mut self, pix: PageIx, flags: OpenFlags) -> Result<Fd> {
        let (cur, obj_type) = self.open_cursor(pix)?;
        let slot = match self.files.iter().position(Option::is_none) {
            Some(slot) => slot,
            None if self.files.len() < self.cfg.max_open_files => {
                self.files.push(None);
                self.files.len() - 1
            }
            None => return Err(FlashError::TooManyOpenFiles),
        };
        let fd = (slot + 1) as Fd;
        let flags = if flags.intersects(OpenFlags::RDWR) {
            flags
        } else {
            flags | OpenFlags::RDONLY
        };
        self.files[slot] = Some(FileObject {
            fd,
            cur,
            offset: 0,
            flags,
            obj_type,
            cache: None,
        });
        debug!(fd, id = %cur.id, pix, ?flags, "opened");
        Ok(fd)
    }

    // ── open / create ───────────────────────────────────────────────────

    /// Create an empty file called `name`.
    pub fn create(&mut self, name: &[u8]) -> Result<ObjId> {
        self.ensure_mounted()?;
        let _span = debug_span!("create_file").entered();
        let id = self.alloc_obj_id(name)?;
        self.create_object(id, name, ObjType::File)?;
        Ok(id)
    }

    /// Open the object called `name`.
    pub fn open(&mut self, name: &[u8], flags: OpenFlags) -> Result<Fd> {
        self.ensure_mounted()?;
        check_name(name)?;
        let _span = debug_span!("open", ?flags).entered();
        let pix = match self.find_by_name(name)? {
            Some(_) if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) => {
                return Err(FlashError::ConflictingName);
            }
            Some((_, pix)) => pix,
            None if flags.contains(OpenFlags::CREATE) => {
                let id = self.alloc_obj_id(name)?;
                self.create_object(id, name, ObjType::File)?
            }
            None => return Err(FlashError::NotFound),
        };
        let fd = self.open_page(pix, flags)?;
        if flags.contains(OpenFlags::TRUNC) {
            if let Err(err) = self.truncate(fd, 0) {
                self.release(fd);
                return Err(err);
            }
        }
        Ok(fd)
    }

    /// Open the object with id `id`.
    pub fn open_by_id(&mut self, id: ObjId, flags: OpenFlags) -> Result<Fd> {
        self.ensure_mounted()?;
        let pix = self.find_by_tag_and_span(id.index_tag(), 0, None)?;
        self.open_page(pix, flags)
    }

    /// Open the object whose index header lives at `pix`.
    pub fn open_by_page(&mut self, pix: PageIx, flags: OpenFlags) -> Result<Fd> {
        self.ensure_mounted()?;
        self.open_page(pix, flags)
    }

    // ── read / write ────────────────────────────────────────────────────

    /// Read at the handle offset. Returns the byte count, 0 at end of object.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.ensure_mounted()?;
        let file = self.handle(fd)?;
        if !file.flags.contains(OpenFlags::RDONLY) {
            return Err(FlashError::WriteOnly { fd });
        }
        let id = file.cur.id;
        let _span = debug_span!("read", fd, len = buf.len()).entered();
        self.flush_object(id)?;

        let file = self.handle(fd)?;
        let (mut cur, offset) = (file.cur, file.offset);
        if offset >= cur.len() && !buf.is_empty() {
            return Err(FlashError::EndOfObject);
        }
        let res = self.read_object(&mut cur, offset, buf);
        self.store_cursor(fd, cur);
        let n = res?;
        self.handle_mut(fd)?.offset = offset + n as u32;
        Ok(n)
    }

    /// Write at the handle offset, or at the end with `APPEND`.
    pub fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize> {
        self.ensure_mounted()?;
        let dps = self.geo.data_page_size() as usize;
        let cache_on = self.cfg.write_cache;
        let file = self.handle_mut(fd)?;
        if !file.flags.contains(OpenFlags::WRONLY) {
            return Err(FlashError::ReadOnly { fd });
        }
        if data.is_empty() {
            return Ok(0);
        }
        if file.flags.contains(OpenFlags::APPEND) {
            file.offset = file.visible_len();
        }
        let offset = file.offset;
        let _span = debug_span!("write", fd, offset, len = data.len()).entered();

        if cache_on && !file.flags.contains(OpenFlags::DIRECT) && data.len() < dps {
            if let Some(cache) = file.cache.as_mut() {
                if cache.end() == offset && cache.buf.len() + data.len() <= dps {
                    cache.buf.extend_from_slice(data);
                    file.offset += data.len() as u32;
                    return Ok(data.len());
                }
            }
            self.flush_handle(fd)?;
            let file = self.handle_mut(fd)?;
            if offset > file.cur.len() {
                return Err(FlashError::EndOfObject);
            }
            file.cache = Some(WriteCache {
                start: offset,
                buf: data.to_vec(),
            });
            file.offset = offset + data.len() as u32;
            trace!(fd, offset, len = data.len(), "write cached");
            return Ok(data.len());
        }

        self.flush_handle(fd)?;
        let n = self.write_at(fd, offset, data)?;
        if let Ok(file) = self.handle_mut(fd) {
            file.offset = offset + n as u32;
        }
        Ok(n)
    }

    /// Commit `data` at `offset`: the part overlapping the object is
    /// modified, the rest appended.
    fn write_at(&mut self, fd: Fd, offset: u32, data: &[u8]) -> Result<usize> {
        self.gc_check(data.len() as u32)?;
        let mut cur = self.handle(fd)?.cur;
        let len = cur.len();
        if offset > len {
            return Err(FlashError::EndOfObject);
        }
        let overlap = ((len - offset) as usize).min(data.len());
        let mut res = if overlap > 0 {
            self.modify(&mut cur, offset, &data[..overlap])
        } else {
            Ok(0)
        };
        if overlap < data.len() {
            res = res.and_then(|n| {
                self.append(&mut cur, len, &data[overlap..])
                    .map(|m| n + m)
            });
        }
        self.store_cursor(fd, cur);
        res
    }

    fn flush_handle(&mut self, fd: Fd) -> Result<()> {
        let file = self.handle_mut(fd)?;
        let Some(cache) = file.cache.take() else {
            return Ok(());
        };
        let offset = file.offset;
        trace!(fd, start = cache.start, len = cache.buf.len(), "flushing write cache");
        self.write_at(fd, cache.start, &cache.buf)?;
        if let Ok(file) = self.handle_mut(fd) {
            file.offset = offset.min(file.visible_len());
        }
        Ok(())
    }

    /// Flush every handle of `id` so reads see pending bytes.
    fn flush_object(&mut self, id: ObjId) -> Result<()> {
        let fds: Vec<Fd> = self
            .files
            .iter()
            .flatten()
            .filter(|f| f.cur.id == id && f.cache.is_some())
            .map(|f| f.fd)
            .collect();
        for fd in fds {
            self.flush_handle(fd)?;
        }
        Ok(())
    }

    /// Commit the handle's write cache.
    pub fn flush(&mut self, fd: Fd) -> Result<()> {
        self.ensure_mounted()?;
        self.flush_handle(fd)
    }

    /// Move the handle offset. Seeking past the end clamps to the end and
    /// reports [`FlashError::EndOfObject`].
    pub fn seek(&mut self, fd: Fd, pos: SeekFrom) -> Result<u32> {
        self.ensure_mounted()?;
        self.flush_handle(fd)?;
        let file = self.handle_mut(fd)?;
        let len = i64::from(file.cur.len());
        let target = match pos {
            SeekFrom::Start(n) => i64::try_from(n).unwrap_or(i64::MAX),
            SeekFrom::Current(delta) => i64::from(file.offset).saturating_add(delta),
            SeekFrom::End(delta) => len.saturating_add(delta),
        };
        if target < 0 {
            return Err(FlashError::config(format!("seek to negative offset {target}")));
        }
        if target > len {
            file.offset = len as u32;
            return Err(FlashError::EndOfObject);
        }
        file.offset = target as u32;
        Ok(file.offset)
    }

    /// Current offset of the handle.
    pub fn tell(&self, fd: Fd) -> Result<u32> {
        Ok(self.handle(fd)?.offset)
    }

    /// Shrink the object behind `fd` to `size` bytes. Growing is a no-op.
    pub fn truncate(&mut self, fd: Fd, size: u32) -> Result<()> {
        self.ensure_mounted()?;
        if !self.handle(fd)?.flags.contains(OpenFlags::WRONLY) {
            return Err(FlashError::ReadOnly { fd });
        }
        self.flush_handle(fd)?;
        let mut cur = self.handle(fd)?.cur;
        let res = self.truncate_object(&mut cur, size, false);
        self.store_cursor(fd, cur);
        res
    }

    // ── close / remove ──────────────────────────────────────────────────

    fn release(&mut self, fd: Fd) -> Option<FileObject> {
        self.files.get_mut(slot_of(fd)).and_then(Option::take)
    }

    /// Flush and release `fd`. The last close of an unlinked object
    /// deletes it; if that deletion fails the handle stays open and the
    /// close can be retried.
    pub fn close(&mut self, fd: Fd) -> Result<()> {
        let id = self.handle(fd)?.cur.id;
        let _span = debug_span!("close", fd).entered();
        let flushed = if self.is_mounted() { self.flush_handle(fd) } else { Ok(()) };
        if let Err(err) = &flushed {
            warn!(fd, %err, "write cache lost on close");
        }
        let last = !self
            .files
            .iter()
            .flatten()
            .any(|f| f.cur.id == id && f.fd != fd);
        if last && self.unlinked.contains(&id) {
            let mut cur = self.handle(fd)?.cur;
            // drops every handle of the object and its unlinked mark
            self.truncate_object(&mut cur, 0, true)?;
            debug!(%id, "removed unlinked object on last close");
        }
        self.release(fd);
        debug!(fd, %id, "closed");
        flushed
    }

    /// Remove the object called `name`. While handles are open the object
    /// stays readable through them and is deleted on the last close.
    pub fn remove(&mut self, name: &[u8]) -> Result<()> {
        self.ensure_mounted()?;
        let _span = debug_span!("remove").entered();
        let (id, pix) = self.find_by_name(name)?.ok_or(FlashError::NotFound)?;
        if self.files.iter().flatten().any(|f| f.cur.id == id) {
            self.unlinked.push(id);
            debug!(%id, "object unlinked, removal deferred to last close");
            return Ok(());
        }
        let (mut cur, _) = self.open_cursor(pix)?;
        self.truncate_object(&mut cur, 0, true)
    }

    /// Remove the object behind `fd` now. Every handle of it is released.
    pub fn fremove(&mut self, fd: Fd) -> Result<()> {
        self.ensure_mounted()?;
        let file = self.handle(fd)?;
        if !file.flags.contains(OpenFlags::WRONLY) {
            return Err(FlashError::ReadOnly { fd });
        }
        let mut cur = file.cur;
        let _span = debug_span!("fremove", fd, id = %cur.id).entered();
        for file in self.files.iter_mut().flatten() {
            if file.cur.id == cur.id {
                file.cache = None;
            }
        }
        self.truncate_object(&mut cur, 0, true)
    }

    /// Give the object called `old` the name `new`.
    pub fn rename(&mut self, old: &[u8], new: &[u8]) -> Result<()> {
        self.ensure_mounted()?;
        check_name(new)?;
        let _span = debug_span!("rename").entered();
        self.gc_check(self.geo.data_page_size())?;
        let (_, pix) = self.find_by_name(old)?.ok_or(FlashError::NotFound)?;
        if self.find_by_name(new)?.is_some() {
            return Err(FlashError::ConflictingName);
        }
        let (mut cur, _) = self.open_cursor(pix)?;
        self.update_index_header(&mut cur, None, Some(new), None)?;
        Ok(())
    }

    // ── metadata ────────────────────────────────────────────────────────

    fn stat_page(&mut self, pix: PageIx) -> Result<Stat> {
        let (cur, obj_type) = self.open_cursor(pix)?;
        Ok(Stat {
            id: cur.id,
            name: self.read_name(pix)?,
            size: cur.len(),
            obj_type,
            hdr_pix: pix,
        })
    }

    pub fn stat(&mut self, name: &[u8]) -> Result<Stat> {
        self.ensure_mounted()?;
        let (_, pix) = self.find_by_name(name)?.ok_or(FlashError::NotFound)?;
        self.stat_page(pix)
    }

    pub fn fstat(&mut self, fd: Fd) -> Result<Stat> {
        self.ensure_mounted()?;
        self.flush_handle(fd)?;
        let file = self.handle(fd)?;
        let (cur, obj_type) = (file.cur, file.obj_type);
        Ok(Stat {
            id: cur.id,
            name: self.read_name(cur.hdr_pix)?,
            size: cur.len(),
            obj_type,
            hdr_pix: cur.hdr_pix,
        })
    }

    /// Every visible object in media order.
    pub fn list(&mut self) -> Result<Vec<Stat>> {
        self.ensure_mounted()?;
        let mut out = Vec::new();
        for (id, pix) in self.live_headers()? {
            if !self.unlinked.contains(&id) {
                out.push(self.stat_page(pix)?);
            }
        }
        Ok(out)
    }

    /// Usable and used bytes. One block is held back for GC.
    pub fn info(&self) -> Result<FsInfo> {
        self.ensure_mounted()?;
        let geo = &self.geo;
        let dps = geo.data_page_size();
        let total = geo.entries_per_block() * (geo.block_count() - 1) * dps;
        Ok(FsInfo {
            total,
            used: self.stats.allocated * dps,
        })
    }
}
