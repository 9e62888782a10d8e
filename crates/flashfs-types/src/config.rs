//! Volume configuration.

use serde::{Deserialize, Serialize};

/// Static description of a flash volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Absolute media address of the first block.
    pub phys_addr: u32,
    /// Volume size in bytes.
    pub phys_size: u32,
    /// Logical block size (erase unit) in bytes.
    pub block_size: u32,
    /// Logical page size in bytes.
    pub page_size: u32,
    /// Stamp and verify a per-block magic.
    pub use_magic: bool,
    /// Pages held by the read cache; 0 disables it.
    pub cache_pages: usize,
    /// Buffer small writes per handle until a page worth accumulates.
    pub write_cache: bool,
    /// Handle table capacity.
    pub max_open_files: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            phys_addr: 0,
            phys_size: 256 * 1024,
            block_size: 64 * 1024,
            page_size: 256,
            use_magic: true,
            cache_pages: 8,
            write_cache: true,
            max_open_files: 16,
        }
    }
}

impl VolumeConfig {
    /// Config for a volume of `blocks` blocks with the given sizes.
    #[must_use]
    pub fn with_geometry(blocks: u32, block_size: u32, page_size: u32) -> Self {
        Self {
            phys_size: blocks * block_size,
            block_size,
            page_size,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::VolumeConfig;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: VolumeConfig =
            serde_json::from_str(r#"{"phys_size": 65536, "block_size": 4096}"#)
                .expect("valid config json");
        assert_eq!(cfg.phys_size, 65536);
        assert_eq!(cfg.block_size, 4096);
        assert_eq!(cfg.page_size, 256);
        assert!(cfg.use_magic);
        assert_eq!(cfg.max_open_files, 16);
    }

    #[test]
    fn with_geometry_sets_size() {
        let cfg = VolumeConfig::with_geometry(16, 4096, 256);
        assert_eq!(cfg.phys_size, 16 * 4096);
    }
}
