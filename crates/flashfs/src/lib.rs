//! Log-structured filesystem nucleus for small NOR flash parts.
//!
//! [`Volume`] holds every piece of mount state and implements the object
//! index engine, the consistency checker, garbage collection and the file
//! handle API. [`Filesystem`] wraps a volume behind a mutex for shared use.

mod cache;
pub mod check;
pub mod file;
pub mod fs;
mod gc;
pub mod instrumentation;
mod lookup;
pub mod object;
mod objid;
mod store;
pub mod volume;

pub use check::{CheckAction, CheckKind, CheckListener, CheckReport, CheckSummary};
pub use file::{Fd, FsInfo, OpenFlags, Stat};
pub use fs::Filesystem;
pub use instrumentation::{IoKind, IoKindTotals, IoMetricsSnapshot};
pub use object::ObjectCursor;
pub use volume::{Volume, VolumeStats};

pub use flashfs_error::{FlashError, Result};
pub use flashfs_hal::{Flash, RamFlash};
pub use flashfs_types::{Geometry, ObjId, ObjType, VolumeConfig};
