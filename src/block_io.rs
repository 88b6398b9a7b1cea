use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;

/// Fixed unit of addressing for every [`BlockDevice`], regardless of how the
/// underlying storage is actually laid out.
pub const HD_SECTOR_SIZE: u64 = 512;

/// A capability surface satisfied by anything that can stand in for the
/// container's backing storage: a raw partition/device handle, or the
/// multi-file split backend. Mirrors the source's read/write callback pair
/// plus a disposer, recast as a trait instead of function pointers.
pub trait BlockDevice {
    /// Reads `count` 512-byte sectors starting at `lba` into `buf`.
    /// `buf` must be at least `count * HD_SECTOR_SIZE` bytes.
    fn read_sectors(&mut self, lba: u64, count: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `count` 512-byte sectors starting at `lba` from `buf`.
    fn write_sectors(&mut self, lba: u64, count: u64, buf: &[u8]) -> Result<()>;

    /// Total addressable size in 512-byte sectors, if known up front.
    fn total_sectors(&self) -> u64;

    /// Flushes and releases any resources held by this device. Called
    /// exactly once, at container close.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Adapts any seekable stream (a partition node, a plain file, an in-memory
/// cursor) into a [`BlockDevice`] by multiplying sector indices through to
/// byte offsets, the same arithmetic as the platform shim's
/// `wbfs_fread_sector`/`wbfs_fwrite_sector`.
pub struct RawHandle<H: Read + Write + Seek> {
    handle: H,
    total_sectors: u64,
}

impl<H: Read + Write + Seek> RawHandle<H> {
    pub fn new(handle: H, total_sectors: u64) -> Self {
        RawHandle {
            handle,
            total_sectors,
        }
    }

    pub fn into_inner(self) -> H {
        self.handle
    }
}

impl<H: Read + Write + Seek> BlockDevice for RawHandle<H> {
    fn read_sectors(&mut self, lba: u64, count: u64, buf: &mut [u8]) -> Result<()> {
        let len = (count * HD_SECTOR_SIZE) as usize;
        self.handle.seek(SeekFrom::Start(lba * HD_SECTOR_SIZE))?;
        self.handle.read_exact(&mut buf[..len])?;
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, count: u64, buf: &[u8]) -> Result<()> {
        let len = (count * HD_SECTOR_SIZE) as usize;
        self.handle.seek(SeekFrom::Start(lba * HD_SECTOR_SIZE))?;
        self.handle.write_all(&buf[..len])?;
        Ok(())
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn close(&mut self) -> Result<()> {
        self.handle.flush()?;
        Ok(())
    }
}
