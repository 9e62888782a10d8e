//! Shared filesystem handle.
//!
//! [`Filesystem`] owns a [`Volume`] behind one exclusive lock. Each public
//! call holds the lock for its whole duration, so operations never
//! interleave and the volume's scratch buffers have a single owner.

use std::io::SeekFrom;

use flashfs_error::Result;
use flashfs_hal::Flash;
use flashfs_types::{ObjId, VolumeConfig};
use parking_lot::Mutex;
use tracing::debug_span;

use crate::check::{CheckListener, CheckSummary};
use crate::file::{Fd, FsInfo, OpenFlags, Stat};
use crate::instrumentation::IoMetricsSnapshot;
use crate::volume::{Volume, VolumeStats};

pub struct Filesystem<F> {
    vol: Mutex<Volume<F>>,
}

impl<F> std::fmt::Debug for Filesystem<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem").finish_non_exhaustive()
    }
}

impl<F: Flash> Filesystem<F> {
    /// Mount the volume on `flash`.
    pub fn mount(flash: F, cfg: VolumeConfig) -> Result<Self> {
        let mut vol = Volume::new(flash, cfg)?;
        vol.mount()?;
        Ok(Self::from_volume(vol))
    }

    /// Format `flash`, then mount it.
    pub fn format(flash: F, cfg: VolumeConfig) -> Result<Self> {
        let mut vol = Volume::new(flash, cfg)?;
        vol.format()?;
        vol.mount()?;
        Ok(Self::from_volume(vol))
    }

    pub fn from_volume(vol: Volume<F>) -> Self {
        Self {
            vol: Mutex::new(vol),
        }
    }

    /// Run `op` with exclusive access to the volume.
    pub fn with<T>(&self, op: impl FnOnce(&mut Volume<F>) -> Result<T>) -> Result<T> {
        op(&mut self.vol.lock())
    }

    /// Unmount and hand back the volume.
    pub fn into_volume(self) -> Result<Volume<F>> {
        let mut vol = self.vol.into_inner();
        vol.unmount()?;
        Ok(vol)
    }

    pub fn create(&self, name: &str) -> Result<ObjId> {
        let _span = debug_span!("fs_create", name).entered();
        self.vol.lock().create(name.as_bytes())
    }

    pub fn open(&self, name: &str, flags: OpenFlags) -> Result<Fd> {
        let _span = debug_span!("fs_open", name).entered();
        self.vol.lock().open(name.as_bytes(), flags)
    }

    pub fn open_by_id(&self, id: ObjId, flags: OpenFlags) -> Result<Fd> {
        self.vol.lock().open_by_id(id, flags)
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.vol.lock().read(fd, buf)
    }

    pub fn write(&self, fd: Fd, data: &[u8]) -> Result<usize> {
        self.vol.lock().write(fd, data)
    }

    pub fn seek(&self, fd: Fd, pos: SeekFrom) -> Result<u32> {
        self.vol.lock().seek(fd, pos)
    }

    pub fn tell(&self, fd: Fd) -> Result<u32> {
        self.vol.lock().tell(fd)
    }

    pub fn truncate(&self, fd: Fd, size: u32) -> Result<()> {
        self.vol.lock().truncate(fd, size)
    }

    pub fn flush(&self, fd: Fd) -> Result<()> {
        self.vol.lock().flush(fd)
    }

    pub fn close(&self, fd: Fd) -> Result<()> {
        self.vol.lock().close(fd)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let _span = debug_span!("fs_remove", name).entered();
        self.vol.lock().remove(name.as_bytes())
    }

    pub fn fremove(&self, fd: Fd) -> Result<()> {
        self.vol.lock().fremove(fd)
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let _span = debug_span!("fs_rename", old, new).entered();
        self.vol.lock().rename(old.as_bytes(), new.as_bytes())
    }

    pub fn stat(&self, name: &str) -> Result<Stat> {
        self.vol.lock().stat(name.as_bytes())
    }

    pub fn fstat(&self, fd: Fd) -> Result<Stat> {
        self.vol.lock().fstat(fd)
    }

    pub fn list(&self) -> Result<Vec<Stat>> {
        self.vol.lock().list()
    }

    pub fn info(&self) -> Result<FsInfo> {
        self.vol.lock().info()
    }

    /// Run the consistency checker.
    pub fn check(&self) -> Result<CheckSummary> {
        self.vol.lock().check()
    }

    pub fn set_check_listener(&self, listener: Option<CheckListener>) {
        self.vol.lock().set_check_listener(listener);
    }

    pub fn stats(&self) -> VolumeStats {
        self.vol.lock().stats()
    }

    pub fn metrics(&self) -> IoMetricsSnapshot {
        self.vol.lock().metrics()
    }

    /// Read a whole file by name.
    pub fn read_to_vec(&self, name: &str) -> Result<Vec<u8>> {
        let mut vol = self.vol.lock();
        let st = vol.stat(name.as_bytes())?;
        let fd = vol.open_by_page(st.hdr_pix, OpenFlags::RDONLY)?;
        let mut out = vec![0_u8; st.size as usize];
        let res = if out.is_empty() { Ok(0) } else { vol.read(fd, &mut out) };
        vol.close(fd)?;
        out.truncate(res?);
        Ok(out)
    }

    /// Create or replace `name` with `data`.
    pub fn write_all(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut vol = self.vol.lock();
        let fd = vol.open(
            name.as_bytes(),
            OpenFlags::CREATE | OpenFlags::TRUNC | OpenFlags::WRONLY | OpenFlags::DIRECT,
        )?;
        let res = vol.write(fd, data);
        vol.close(fd)?;
        res.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::config;
    use flashfs_error::FlashError;
    use flashfs_hal::RamFlash;
    use std::sync::Arc;

    fn fresh(blocks: u32) -> Filesystem<RamFlash> {
        let cfg = config(blocks);
        Filesystem::format(RamFlash::new(cfg.phys_size, cfg.block_size), cfg).expect("format")
    }

    #[test]
    fn whole_file_helpers() {
        let fs = fresh(8);
        fs.write_all("cfg.json", b"{\"a\":1}").expect("write");
        assert_eq!(fs.read_to_vec("cfg.json").expect("read"), b"{\"a\":1}");
        fs.write_all("cfg.json", b"{}").expect("rewrite");
        assert_eq!(fs.read_to_vec("cfg.json").expect("read"), b"{}");
        assert_eq!(fs.list().expect("list").len(), 1);
        fs.write_all("empty", b"").expect("empty");
        assert_eq!(fs.read_to_vec("empty").expect("read"), b"");
    }

    #[test]
    fn threads_share_one_volume() {
        let fs = Arc::new(fresh(16));
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let fs = Arc::clone(&fs);
                std::thread::spawn(move || {
                    let name = format!("t{t}");
                    let payload = vec![t as u8; 300 + t * 50];
                    fs.write_all(&name, &payload).expect("write");
                    assert_eq!(fs.read_to_vec(&name).expect("read"), payload);
                })
            })
            .collect();
        for w in workers {
            w.join().expect("worker");
        }
        assert_eq!(fs.list().expect("list").len(), 4);
        assert_eq!(fs.check().expect("check").repairs(), 0);
    }

    #[test]
    fn remount_after_into_volume() {
        let fs = fresh(8);
        fs.write_all("keep", b"data").expect("write");
        let vol = fs.into_volume().expect("unmount");
        let cfg = vol.config().clone();
        let fs = Filesystem::mount(vol.into_flash(), cfg).expect("mount");
        assert_eq!(fs.read_to_vec("keep").expect("read"), b"data");
        assert_eq!(fs.stat("missing"), Err(FlashError::NotFound));
    }
}
