//! Media HAL consumed by the flashfs nucleus.
//!
//! Addresses are absolute physical byte offsets. Implementations follow NOR
//! semantics: `erase` sets every bit of the range to 1 and `write` can only
//! clear bits.

mod ram;

pub use ram::{HalStats, RamFlash};

use flashfs_error::Result;

/// Byte-level flash driver.
pub trait Flash {
    /// Fill `buf` from `addr`.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `data` at `addr`.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Erase `len` bytes from `addr`; both are erase-unit aligned.
    fn erase(&mut self, addr: u32, len: u32) -> Result<()>;
}

impl<F: Flash + ?Sized> Flash for &mut F {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        (**self).write(addr, data)
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<()> {
        (**self).erase(addr, len)
    }
}

impl<F: Flash + ?Sized> Flash for Box<F> {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        (**self).write(addr, data)
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<()> {
        (**self).erase(addr, len)
    }
}
