use binrw::{BinRead, BinWrite};

use crate::error::{Result, WbfsError};

pub const WBFS_MAGIC: u32 = 0x5742_4653; // "WBFS"
pub const HD_SECTOR_SIZE_LOG2_DEFAULT: u8 = 9; // 512 bytes
pub const DEFAULT_DISC_SLOTS: usize = 500;

/// The fixed 12-byte header at HD sector 0 of a container, followed
/// on-disk by the disc slot table.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(big, magic = b"WBFS")]
pub struct WbfsSuperblock {
    pub n_hd_sec: u32,
    pub hd_sec_sz_s: u8,
    pub wbfs_sec_sz_s: u8,
    pub version: u8,
    pub padding: u8,
}

/// Geometry derived from a superblock: everything downstream code needs to
/// address slots, block maps, and the free bitmap.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub hd_sec_sz: u64,
    pub wbfs_sec_sz: u64,
    pub n_hd_sec: u64,
    pub n_wbfs_sec: u64,
    pub n_wbfs_sec_per_disc: u64,
    pub disc_info_sz: u64,
    pub n_disc_slots: usize,
    pub freeblks_lba: u64,
    pub freeblks_sz_hd_sec: u64,
}

impl Geometry {
    pub fn new(
        n_hd_sec: u32,
        hd_sec_sz_s: u8,
        wbfs_sec_sz_s: u8,
        n_disc_slots: usize,
    ) -> Result<Self> {
        let hd_sec_sz = 1u64 << hd_sec_sz_s;
        let wbfs_sec_sz = 1u64 << wbfs_sec_sz_s;
        if wbfs_sec_sz < hd_sec_sz || wbfs_sec_sz % hd_sec_sz != 0 {
            return Err(WbfsError::Format(
                "wbfs block size must be a multiple of the HD sector size".into(),
            ));
        }
        let n_hd_sec = n_hd_sec as u64;
        let hd_sec_per_wbfs_sec = wbfs_sec_sz / hd_sec_sz;
        let n_wbfs_sec = n_hd_sec / hd_sec_per_wbfs_sec;
        if n_wbfs_sec > 65_535 {
            return Err(WbfsError::Format(format!(
                "{n_wbfs_sec} wbfs blocks exceeds the 16-bit block map limit"
            )));
        }
        // 4.7GiB single-layer disc worth of wbfs blocks, rounded up.
        let disc_capacity_bytes = crate::wii::WII_SECTORS_DOUBLE_LAYER * crate::wii::WII_SECTOR_SIZE;
        let n_wbfs_sec_per_disc = disc_capacity_bytes.div_ceil(wbfs_sec_sz);

        let disc_header_and_map = 256 + 2 * n_wbfs_sec_per_disc;
        let disc_info_sz = disc_header_and_map.div_ceil(hd_sec_sz) * hd_sec_sz;

        let slot_table_hd_sectors = (disc_info_sz * n_disc_slots as u64) / hd_sec_sz;
        // the superblock occupies the first wbfs block; the slot table
        // starts immediately after it, and the free bitmap starts
        // immediately after the slot table.
        let header_hd_sectors = wbfs_sec_sz / hd_sec_sz;
        let freeblks_lba = header_hd_sectors + slot_table_hd_sectors;
        let freeblks_bytes = (n_wbfs_sec as u64).div_ceil(32) * 4;
        let freeblks_sz_hd_sec = freeblks_bytes.div_ceil(hd_sec_sz);

        Ok(Geometry {
            hd_sec_sz,
            wbfs_sec_sz,
            n_hd_sec,
            n_wbfs_sec,
            n_wbfs_sec_per_disc,
            disc_info_sz,
            n_disc_slots,
            freeblks_lba,
            freeblks_sz_hd_sec,
        })
    }

    /// Smallest `wbfs_sec_sz_s` (block size log2) that keeps `n_wbfs_sec`
    /// within the 16-bit block map limit for a device of `n_hd_sec`
    /// 512-byte sectors.
    pub fn pick_block_size_log2(n_hd_sec: u64, hd_sec_sz_s: u8) -> u8 {
        let hd_sec_sz = 1u64 << hd_sec_sz_s;
        let mut wbfs_sec_sz_s = hd_sec_sz_s;
        loop {
            let wbfs_sec_sz = 1u64 << wbfs_sec_sz_s;
            let n_wbfs_sec = n_hd_sec / (wbfs_sec_sz / hd_sec_sz);
            if n_wbfs_sec <= 65_535 {
                return wbfs_sec_sz_s;
            }
            wbfs_sec_sz_s += 1;
        }
    }

    pub fn slot_lba(&self, slot_index: usize) -> u64 {
        let header_hd_sectors = self.wbfs_sec_sz / self.hd_sec_sz;
        header_hd_sectors + (self.disc_info_sz / self.hd_sec_sz) * slot_index as u64
    }

    /// Number of leading WBFS blocks the header, slot table and free bitmap
    /// together occupy. The superblock alone always fills exactly one
    /// block; a large enough slot table or free bitmap spills into the
    /// blocks that follow, and those must stay out of the allocator's reach
    /// too.
    pub fn reserved_blocks(&self) -> u64 {
        let hd_sectors_per_block = self.wbfs_sec_sz / self.hd_sec_sz;
        (self.freeblks_lba + self.freeblks_sz_hd_sec).div_ceil(hd_sectors_per_block)
    }
}
