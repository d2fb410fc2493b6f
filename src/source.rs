//! Read abstraction over a sealed table: random access to a byte range with
//! a known size. The in-memory source is safe for concurrent reads and is
//! what cloned readers share; the file source serializes access to a single
//! descriptor behind a mutex.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Random access over the bytes of one table.
pub trait BlockSource {
    /// Total size of the table in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `len` bytes starting at `offset`. A read past the end
    /// of the table is an IO error.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

/// An in-memory table. Cloning shares the underlying buffer.
#[derive(Clone)]
pub struct BufSource {
    data: Arc<[u8]>,
}

impl BufSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl From<Vec<u8>> for BufSource {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl BlockSource for BufSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start.checked_add(len).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => Ok(self.data[start..end].to_vec()),
            None => Err(Error::IO(format!(
                "read of {len} bytes at {offset} past end of {}-byte table",
                self.data.len()
            ))),
        }
    }
}

/// A file-backed table. Reads seek and read under a mutex, so a single
/// source may serve multiple cursors.
pub struct FileSource {
    file: Mutex<File>,
    size: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(file)
    }

    pub fn new(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl BlockSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}
