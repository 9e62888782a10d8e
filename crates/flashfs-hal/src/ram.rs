//! In-memory NOR flash with power-loss injection.

use flashfs_error::{FlashError, Result};
use tracing::trace;

use crate::Flash;

/// Operation counters of a [`RamFlash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HalStats {
    pub reads: u64,
    pub writes: u64,
    pub erases: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// RAM-backed NOR model.
///
/// Writes AND into the existing content, erases reset whole erase units to
/// `0xFF`. A power cut can be armed so that the device accepts a given number
/// of further writes/erases and then fails every mutation until power is
/// restored, which leaves the image exactly as an interrupted device would.
#[derive(Debug, Clone)]
pub struct RamFlash {
    mem: Vec<u8>,
    erase_size: u32,
    stats: HalStats,
    /// Mutations left before the armed power cut; `None` when disarmed.
    cut_after: Option<u64>,
    powered: bool,
}

impl RamFlash {
    /// An erased device of `size` bytes with `erase_size` erase units.
    #[must_use]
    pub fn new(size: u32, erase_size: u32) -> Self {
        Self {
            mem: vec![0xFF; size as usize],
            erase_size: erase_size.max(1),
            stats: HalStats::default(),
            cut_after: None,
            powered: true,
        }
    }

    /// A device whose content is `image`, as if read back after a reboot.
    #[must_use]
    pub fn from_image(image: Vec<u8>, erase_size: u32) -> Self {
        Self {
            mem: image,
            erase_size: erase_size.max(1),
            stats: HalStats::default(),
            cut_after: None,
            powered: true,
        }
    }

    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.mem
    }

    #[must_use]
    pub const fn stats(&self) -> HalStats {
        self.stats
    }

    /// Overwrite raw bytes, bypassing NOR semantics. Used to plant corruption.
    pub fn poke(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let range = self.range(addr, data.len())?;
        self.mem[range].copy_from_slice(data);
        Ok(())
    }

    /// Accept `mutations` more writes/erases, then lose power.
    pub fn arm_power_cut(&mut self, mutations: u64) {
        self.cut_after = Some(mutations);
    }

    /// Disarm any pending cut and power the device back on.
    pub fn restore_power(&mut self) {
        self.cut_after = None;
        self.powered = true;
    }

    #[must_use]
    pub const fn is_powered(&self) -> bool {
        self.powered
    }

    fn range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>> {
        let start = addr as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.mem.len())
            .ok_or_else(|| {
                FlashError::media(addr, format!("{len} bytes past end of {}-byte device", self.mem.len()))
            })?;
        Ok(start..end)
    }

    fn consume_power(&mut self, addr: u32) -> Result<()> {
        if !self.powered {
            return Err(FlashError::media(addr, "device is powered off"));
        }
        if let Some(left) = self.cut_after.as_mut() {
            if *left == 0 {
                self.powered = false;
                trace!(addr, "injected power cut");
                return Err(FlashError::media(addr, "power lost"));
            }
            *left -= 1;
        }
        Ok(())
    }
}

impl Flash for RamFlash {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.mem[range]);
        self.stats.reads += 1;
        self.stats.bytes_read += buf.len() as u64;
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let range = self.range(addr, data.len())?;
        self.consume_power(addr)?;
        for (dst, src) in self.mem[range].iter_mut().zip(data) {
            *dst &= *src;
        }
        self.stats.writes += 1;
        self.stats.bytes_written += data.len() as u64;
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<()> {
        if addr % self.erase_size != 0 || len % self.erase_size != 0 {
            return Err(FlashError::media(
                addr,
                format!("erase of {len} bytes not aligned to {}", self.erase_size),
            ));
        }
        let range = self.range(addr, len as usize)?;
        self.consume_power(addr)?;
        self.mem[range].fill(0xFF);
        self.stats.erases += 1;
        Ok(())
    }
}
