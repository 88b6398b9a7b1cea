//! Multi-file backend presenting a single logical 512-byte-sector address
//! space across up to [`MAX_SPLIT`] files, named `<base>.wbfs`,
//! `<base>.wbf1` .. `<base>.wbf9`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::block_io::{BlockDevice, HD_SECTOR_SIZE};
use crate::error::{Result, WbfsError};

pub const MAX_SPLIT: usize = 10;

/// 4 GiB minus 32 KiB, the crate's default split size.
pub const SPLIT_SIZE_4G: u64 = 4 * 1024 * 1024 * 1024 - 32 * 1024;
/// 2 GiB minus 32 KiB.
pub const SPLIT_SIZE_2G: u64 = 2 * 1024 * 1024 * 1024 - 32 * 1024;
/// Large enough that no disc this engine addresses ever grows a sibling split.
pub const SPLIT_SIZE_UNSPLIT: u64 = 10_000_000_000;

struct Split {
    file: Option<File>,
    path: PathBuf,
    /// Physical size on disk the last time we checked/extended it.
    size: u64,
}

/// Lazily-opened, lazily-extended multi-file block device.
pub struct SplitBackend {
    base_name: PathBuf,
    splits: Vec<Split>,
    split_size: u64,
    split_sectors: u64,
    total_sectors: u64,
    max_split: usize,
    create_mode: bool,
    finished: bool,
}

fn split_file_name(base: &Path, index: usize, create_mode: bool) -> PathBuf {
    let base_str = base.to_string_lossy();
    if index == 0 {
        if create_mode {
            PathBuf::from(format!("{base_str}.tmp"))
        } else {
            base.to_path_buf()
        }
    } else {
        // base ends in ".wbfs"; replace the trailing digit-equivalent
        // character the way the source does, i.e. ".wbf<digit>"
        let s = base_str.to_string();
        let stem = s.strip_suffix("s").unwrap_or(&s);
        PathBuf::from(format!("{stem}{index}"))
    }
}

fn is_unsplit_extension(base: &Path) -> bool {
    base.extension()
        .map(|e| e.eq_ignore_ascii_case("wbfs"))
        .unwrap_or(false)
}

impl SplitBackend {
    /// Opens an existing split set. The first file establishes `split_size`;
    /// every subsequent file but the last must match it exactly.
    pub fn open(base_name: impl Into<PathBuf>) -> Result<Self> {
        let base_name = base_name.into();
        let max_split = if is_unsplit_extension(&base_name) {
            MAX_SPLIT
        } else {
            1
        };

        let mut splits = Vec::new();
        let mut split_size = 0u64;
        for idx in 0..max_split {
            let path = split_file_name(&base_name, idx, false);
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            };
            let size = file.metadata()?.len();
            if idx == 0 {
                split_size = size;
            }
            splits.push(Split {
                file: Some(file),
                path,
                size,
            });
        }

        if splits.is_empty() {
            return Err(WbfsError::Format(format!(
                "no split files found for {}",
                base_name.display()
            )));
        }

        // every split but the last must be exactly split_size
        let last = splits.len() - 1;
        for (idx, s) in splits.iter().enumerate() {
            if idx != last && s.size != split_size {
                return Err(WbfsError::Format(format!(
                    "split {} has size {} but expected {}",
                    s.path.display(),
                    s.size,
                    split_size
                )));
            }
        }

        let total_size = splits[..last].iter().map(|s| s.size).sum::<u64>() + splits[last].size;
        let split_sectors = split_size / HD_SECTOR_SIZE;

        Ok(SplitBackend {
            base_name,
            splits,
            split_size,
            split_sectors,
            total_sectors: total_size / HD_SECTOR_SIZE,
            max_split,
            create_mode: false,
            finished: false,
        })
    }

    /// Creates a fresh split set. Refuses if any target file, including the
    /// temporary first-file name, already exists.
    pub fn create(
        base_name: impl Into<PathBuf>,
        split_size: u64,
        total_size: u64,
    ) -> Result<Self> {
        let base_name = base_name.into();
        let max_split = if is_unsplit_extension(&base_name) {
            MAX_SPLIT
        } else {
            1
        };

        for idx in 0..max_split {
            let candidate = split_file_name(&base_name, idx, idx == 0);
            if candidate.exists() {
                return Err(WbfsError::Format(format!(
                    "refusing to create over existing file {}",
                    candidate.display()
                )));
            }
            // also probe the non-tmp first name; original tool checks both
            if idx == 0 {
                let non_tmp = split_file_name(&base_name, 0, false);
                if non_tmp.exists() {
                    return Err(WbfsError::Format(format!(
                        "refusing to create over existing file {}",
                        non_tmp.display()
                    )));
                }
            }
        }

        let path = split_file_name(&base_name, 0, true);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        debug!(path = %path.display(), "created split file 0");

        Ok(SplitBackend {
            base_name,
            splits: vec![Split {
                file: Some(file),
                path,
                size: 0,
            }],
            split_size,
            split_sectors: split_size / HD_SECTOR_SIZE,
            total_sectors: total_size / HD_SECTOR_SIZE,
            max_split,
            create_mode: true,
            finished: false,
        })
    }

    fn ensure_split_open(&mut self, idx: usize) -> Result<()> {
        if idx >= self.max_split {
            return Err(WbfsError::Format(format!(
                "split index {idx} exceeds max_split {}",
                self.max_split
            )));
        }
        while self.splits.len() <= idx {
            // opening a new split for the first time: fill every earlier
            // split up to split_size first.
            let prior = self.splits.len() - 1;
            self.fill_split(prior, self.split_size)?;

            let next_idx = self.splits.len();
            let path = split_file_name(&self.base_name, next_idx, self.create_mode);
            let file = if self.create_mode {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?
            } else {
                OpenOptions::new().read(true).write(true).open(&path)?
            };
            let size = file.metadata()?.len();
            debug!(path = %path.display(), "opened split file {next_idx}");
            self.splits.push(Split {
                file: Some(file),
                path,
                size,
            });
        }
        Ok(())
    }

    fn fill_split(&mut self, idx: usize, target_size: u64) -> Result<()> {
        let split = &mut self.splits[idx];
        if split.size < target_size {
            let file = split.file.as_mut().expect("split file always open");
            file.set_len(target_size)?;
            split.size = target_size;
        }
        Ok(())
    }

    /// Returns (split_index, byte_offset, sectors_to_end_of_this_split).
    fn locate(&self, lba: u64, requested_count: u64) -> Result<(usize, u64, u64)> {
        if lba >= self.total_sectors {
            return Err(WbfsError::Format(format!(
                "lba {lba} past end of volume ({})",
                self.total_sectors
            )));
        }
        let idx = (lba / self.split_sectors) as usize;
        if idx >= self.max_split {
            return Err(WbfsError::Format(format!(
                "lba {lba} maps to split {idx} but max_split is {}",
                self.max_split
            )));
        }
        let sector_in_split = lba % self.split_sectors;
        let to_end = self.split_sectors - sector_in_split;
        let count = requested_count.min(to_end);
        Ok((idx, sector_in_split * HD_SECTOR_SIZE, count))
    }

    fn read_chunk(&mut self, idx: usize, byte_off: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_split_open(idx)?;
        let split = &mut self.splits[idx];
        let needed_end = byte_off + buf.len() as u64;
        if needed_end > split.size && self.create_mode {
            let file = split.file.as_mut().unwrap();
            file.set_len(needed_end)?;
            split.size = needed_end;
        }
        let file = split.file.as_mut().unwrap();
        file.seek(SeekFrom::Start(byte_off))?;
        // reads past the written prefix of a file sparsely extended above
        // simply return zeros, matching a freshly-extended region.
        let read = file.read(buf)?;
        if read < buf.len() {
            buf[read..].fill(0);
        }
        Ok(())
    }

    fn write_chunk(&mut self, idx: usize, byte_off: u64, buf: &[u8]) -> Result<()> {
        self.ensure_split_open(idx)?;
        let split = &mut self.splits[idx];
        let file = split.file.as_mut().unwrap();
        file.seek(SeekFrom::Start(byte_off))?;
        file.write_all(buf)?;
        let end = byte_off + buf.len() as u64;
        if end > split.size {
            split.size = end;
        }
        Ok(())
    }

    /// Truncates the logical volume to `full_size` bytes, dropping any
    /// split files whose allotment falls to zero.
    pub fn truncate(&mut self, full_size: u64) -> Result<()> {
        let mut remaining = full_size;
        for (idx, split) in self.splits.iter_mut().enumerate() {
            let this_size = remaining.min(self.split_size);
            remaining = remaining.saturating_sub(this_size);
            if this_size == 0 {
                if let Some(file) = split.file.take() {
                    drop(file);
                }
                std::fs::remove_file(&split.path).ok();
                debug!(path = %split.path.display(), "removed empty split {idx}");
            } else {
                let file = split.file.as_mut().expect("split file always open");
                file.set_len(this_size)?;
                split.size = this_size;
            }
        }
        self.splits.retain(|s| s.file.is_some());
        self.total_sectors = full_size / HD_SECTOR_SIZE;
        Ok(())
    }

    pub fn split_size(&self) -> u64 {
        self.split_size
    }
}

impl BlockDevice for SplitBackend {
    fn read_sectors(&mut self, lba: u64, count: u64, buf: &mut [u8]) -> Result<()> {
        let mut remaining = count;
        let mut lba = lba;
        let mut buf_off = 0usize;
        while remaining > 0 {
            let (idx, byte_off, chunk_sectors) = self.locate(lba, remaining)?;
            let chunk_len = (chunk_sectors * HD_SECTOR_SIZE) as usize;
            self.read_chunk(idx, byte_off, &mut buf[buf_off..buf_off + chunk_len])?;
            lba += chunk_sectors;
            remaining -= chunk_sectors;
            buf_off += chunk_len;
        }
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, count: u64, buf: &[u8]) -> Result<()> {
        let mut remaining = count;
        let mut lba = lba;
        let mut buf_off = 0usize;
        while remaining > 0 {
            let (idx, byte_off, chunk_sectors) = self.locate(lba, remaining)?;
            let chunk_len = (chunk_sectors * HD_SECTOR_SIZE) as usize;
            self.write_chunk(idx, byte_off, &buf[buf_off..buf_off + chunk_len])?;
            lba += chunk_sectors;
            remaining -= chunk_sectors;
            buf_off += chunk_len;
        }
        Ok(())
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn close(&mut self) -> Result<()> {
        for split in &mut self.splits {
            if let Some(file) = split.file.as_mut() {
                file.flush()?;
            }
        }
        if self.create_mode && !self.finished {
            let tmp_name = split_file_name(&self.base_name, 0, true);
            let final_name = split_file_name(&self.base_name, 0, false);
            std::fs::rename(&tmp_name, &final_name)?;
            debug!(from = %tmp_name.display(), to = %final_name.display(), "finalized split 0");
            self.finished = true;
        }
        Ok(())
    }
}

impl Drop for SplitBackend {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_write_read_close_reopen_roundtrip() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("game.wbfs");
        let split_size = 64 * HD_SECTOR_SIZE; // tiny split for the test
        let total = split_size * 3;

        {
            let mut backend = SplitBackend::create(&base, split_size, total).unwrap();
            let pattern = vec![0xABu8; HD_SECTOR_SIZE as usize];
            backend.write_sectors(0, 1, &pattern).unwrap();
            // write past the first split boundary to force lazy extension
            backend.write_sectors(64, 1, &pattern).unwrap();
            backend.close().unwrap();
        }

        assert!(base.exists());
        assert!(!dir.path().join("game.wbfs.tmp").exists());

        let mut reopened = SplitBackend::open(&base).unwrap();
        let mut out = vec![0u8; HD_SECTOR_SIZE as usize];
        reopened.read_sectors(0, 1, &mut out).unwrap();
        assert_eq!(out, vec![0xABu8; HD_SECTOR_SIZE as usize]);
        reopened.read_sectors(64, 1, &mut out).unwrap();
        assert_eq!(out, vec![0xABu8; HD_SECTOR_SIZE as usize]);
    }

    #[test]
    fn truncate_drops_empty_tail_splits() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("game.wbfs");
        let split_size = 64 * HD_SECTOR_SIZE;
        let total = split_size * 3;
        let mut backend = SplitBackend::create(&base, split_size, total).unwrap();
        backend.write_sectors(64, 1, &vec![1u8; HD_SECTOR_SIZE as usize]).unwrap();
        backend.truncate(split_size + HD_SECTOR_SIZE).unwrap();
        assert_eq!(backend.splits.len(), 2);
    }
}
