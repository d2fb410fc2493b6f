use crate::error::Result;
use crate::errcontract;
use crate::record::{FILE_HEADER_LEN, MAX_BLOCK_LEN};

/// Configuration for a table writer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target block size in bytes (default: 4096).
    pub block_size: usize,

    /// Records between restart points within a block (default: 16).
    pub restart_interval: usize,

    /// Maximum index pyramid height per section. Zero means unlimited; when
    /// the cap is reached the top level is written as a single oversized
    /// flat index block (default: 0).
    pub max_index_levels: usize,

    /// Pad every non-terminal block to the block size (default: false).
    pub align_blocks: bool,

    /// Deflate log block payloads (default: true).
    pub compress_logs: bool,

    /// Build the object-id to ref back-index (default: true).
    pub index_objects: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 4096,
            restart_interval: 16,
            max_index_levels: 0,
            align_blocks: false,
            compress_logs: true,
            index_objects: true,
        }
    }
}

impl Config {
    /// Set the target block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the restart interval.
    pub fn restart_interval(mut self, interval: usize) -> Self {
        self.restart_interval = interval;
        self
    }

    /// Cap the index pyramid height.
    pub fn max_index_levels(mut self, levels: usize) -> Self {
        self.max_index_levels = levels;
        self
    }

    /// Pad non-terminal blocks to the block size.
    pub fn align_blocks(mut self, align: bool) -> Self {
        self.align_blocks = align;
        self
    }

    /// Enable or disable log block compression.
    pub fn compress_logs(mut self, compress: bool) -> Self {
        self.compress_logs = compress;
        self
    }

    /// Enable or disable the object back-index.
    pub fn index_objects(mut self, index: bool) -> Self {
        self.index_objects = index;
        self
    }

    /// Checks the configuration is usable before any bytes are written.
    pub fn validate(&self) -> Result<()> {
        if self.block_size <= FILE_HEADER_LEN {
            return errcontract!(
                "block size {} cannot hold the {FILE_HEADER_LEN}-byte file header",
                self.block_size
            );
        }
        if self.block_size > MAX_BLOCK_LEN {
            return errcontract!(
                "block size {} exceeds the 24-bit block length limit",
                self.block_size
            );
        }
        if self.restart_interval == 0 {
            return errcontract!("restart interval must be at least 1");
        }
        Ok(())
    }
}
