pub mod bitmap;
pub mod disc_slot;
pub mod superblock;

use tracing::{debug, info, warn};

use crate::block_io::{BlockDevice, HD_SECTOR_SIZE};
use crate::error::{Result, WbfsError};
use crate::wii::walker::{DiscWalker, PartitionSelector, UsageBitmap};
use crate::wii::WII_SECTOR_SIZE;

use bitmap::FreeBitmap;
use disc_slot::DiscSlot;
use superblock::{Geometry, WbfsSuperblock, DEFAULT_DISC_SLOTS, HD_SECTOR_SIZE_LOG2_DEFAULT};

/// Called between blocks of a long-running operation. Returning `false`
/// requests cooperative cancellation.
pub type ProgressCallback<'a> = &'a mut dyn FnMut(u64, u64) -> bool;

/// A report of occupied/free space, in WBFS blocks converted to bytes.
#[derive(Debug, Clone, Copy)]
pub struct FreeSpaceReport {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// Summary returned by `size_disc`: how many WBFS blocks an add would
/// consume, and the index of the highest one used.
#[derive(Debug, Clone, Copy)]
pub struct DiscSizeEstimate {
    pub used_blocks: u64,
    pub last_used_block: u64,
}

/// A WBFS container living atop any [`BlockDevice`]: the split backend or
/// a raw partition/device handle.
pub struct Wbfs<D: BlockDevice> {
    device: D,
    superblock: WbfsSuperblock,
    geometry: Geometry,
    free_bitmap: FreeBitmap,
    slots: Vec<DiscSlot>,
}

impl<D: BlockDevice> Wbfs<D> {
    /// Formats a fresh container over `device`, which must already report
    /// its true capacity via [`BlockDevice::total_sectors`]. Picks the
    /// smallest WBFS block size that keeps the free bitmap within 16 bits
    /// and uses the default disc slot count.
    pub fn format(device: D) -> Result<Self> {
        let n_hd_sec = device.total_sectors();
        let wbfs_sec_sz_s = Geometry::pick_block_size_log2(n_hd_sec, HD_SECTOR_SIZE_LOG2_DEFAULT);
        Self::format_with_geometry(device, wbfs_sec_sz_s, DEFAULT_DISC_SLOTS)
    }

    /// Formats a fresh container with an explicit block size and slot
    /// count, for callers (tests, or tools replicating another
    /// implementation's layout) that need to override the defaults
    /// [`Self::format`] would otherwise pick.
    pub fn format_with_geometry(
        mut device: D,
        wbfs_sec_sz_s: u8,
        n_disc_slots: usize,
    ) -> Result<Self> {
        let n_hd_sec = device.total_sectors();
        let geometry = Geometry::new(
            n_hd_sec as u32,
            HD_SECTOR_SIZE_LOG2_DEFAULT,
            wbfs_sec_sz_s,
            n_disc_slots,
        )?;
        let superblock = WbfsSuperblock {
            n_hd_sec: n_hd_sec as u32,
            hd_sec_sz_s: HD_SECTOR_SIZE_LOG2_DEFAULT,
            wbfs_sec_sz_s,
            version: 1,
            padding: 0,
        };
        let mut free_bitmap = FreeBitmap::new_all_free(geometry.n_wbfs_sec);
        for b in 1..geometry.reserved_blocks() {
            free_bitmap.mark_used(b);
        }
        let slots = (0..geometry.n_disc_slots)
            .map(|_| DiscSlot::free(geometry.n_wbfs_sec_per_disc))
            .collect();

        let mut wbfs = Wbfs {
            device,
            superblock,
            geometry,
            free_bitmap,
            slots,
        };
        wbfs.write_superblock()?;
        wbfs.write_all_slots()?;
        wbfs.write_free_bitmap()?;
        info!(n_wbfs_sec = wbfs.geometry.n_wbfs_sec, "formatted new container");
        Ok(wbfs)
    }

    /// Opens an existing container. In strict mode (`force = false`), a
    /// mismatch between the stored and device-reported geometry is an
    /// [`WbfsError::Integrity`] error.
    pub fn open(mut device: D, force: bool) -> Result<Self> {
        let mut header_buf = vec![0u8; HD_SECTOR_SIZE as usize];
        device.read_sectors(0, 1, &mut header_buf)?;
        let mut cursor = std::io::Cursor::new(&header_buf);
        let superblock: WbfsSuperblock = binrw::BinRead::read_be(&mut cursor)
            .map_err(|e| WbfsError::Format(format!("invalid superblock: {e}")))?;

        let device_sectors = device.total_sectors();
        if !force && device_sectors != superblock.n_hd_sec as u64 {
            return Err(WbfsError::Integrity(format!(
                "device reports {device_sectors} sectors, superblock declares {}",
                superblock.n_hd_sec
            )));
        }
        if force {
            warn!("force mode: skipping geometry validation on open");
        }

        let geometry = Geometry::new(
            superblock.n_hd_sec,
            superblock.hd_sec_sz_s,
            superblock.wbfs_sec_sz_s,
            DEFAULT_DISC_SLOTS,
        )?;

        let mut wbfs = Wbfs {
            device,
            superblock,
            geometry,
            free_bitmap: FreeBitmap::new_all_free(0),
            slots: Vec::new(),
        };
        wbfs.read_all_slots()?;
        wbfs.read_free_bitmap()?;
        Ok(wbfs)
    }

    fn write_superblock(&mut self) -> Result<()> {
        let mut buf = vec![0u8; HD_SECTOR_SIZE as usize];
        let mut cursor = std::io::Cursor::new(&mut buf);
        binrw::BinWrite::write_be(&self.superblock, &mut cursor)?;
        self.device.write_sectors(0, 1, &buf)
    }

    fn write_all_slots(&mut self) -> Result<()> {
        for i in 0..self.slots.len() {
            self.write_slot(i)?;
        }
        Ok(())
    }

    fn write_slot(&mut self, index: usize) -> Result<()> {
        let lba = self.geometry.slot_lba(index);
        let mut bytes = self.slots[index].to_bytes();
        let padded_len = self.geometry.disc_info_sz as usize;
        bytes.resize(padded_len, 0);
        let sectors = self.geometry.disc_info_sz / self.geometry.hd_sec_sz;
        self.device.write_sectors(lba, sectors, &bytes)
    }

    fn read_all_slots(&mut self) -> Result<()> {
        self.slots.clear();
        for i in 0..self.geometry.n_disc_slots {
            let lba = self.geometry.slot_lba(i);
            let sectors = self.geometry.disc_info_sz / self.geometry.hd_sec_sz;
            let mut buf = vec![0u8; self.geometry.disc_info_sz as usize];
            self.device.read_sectors(lba, sectors, &mut buf)?;
            self.slots
                .push(DiscSlot::from_bytes(&buf, self.geometry.n_wbfs_sec_per_disc)?);
        }
        Ok(())
    }

    fn write_free_bitmap(&mut self) -> Result<()> {
        let mut bytes = self.free_bitmap.to_be_bytes();
        bytes.resize((self.geometry.freeblks_sz_hd_sec * self.geometry.hd_sec_sz) as usize, 0);
        self.device
            .write_sectors(self.geometry.freeblks_lba, self.geometry.freeblks_sz_hd_sec, &bytes)
    }

    fn read_free_bitmap(&mut self) -> Result<()> {
        let mut buf = vec![0u8; (self.geometry.freeblks_sz_hd_sec * self.geometry.hd_sec_sz) as usize];
        self.device
            .read_sectors(self.geometry.freeblks_lba, self.geometry.freeblks_sz_hd_sec, &mut buf)?;
        self.free_bitmap = FreeBitmap::from_le_bytes(&buf, self.geometry.n_wbfs_sec);
        Ok(())
    }

    fn find_slot_by_id(&self, game_id: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.is_occupied() && s.game_id() == game_id)
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.is_occupied())
    }

    pub fn count_discs(&self) -> usize {
        self.slots.iter().filter(|s| s.is_occupied()).count()
    }

    pub fn get_disc_info(&self, index: usize) -> Option<(&DiscSlot, u64)> {
        let occupied: Vec<&DiscSlot> = self.slots.iter().filter(|s| s.is_occupied()).collect();
        occupied.get(index).map(|slot| {
            let out_size = slot.used_block_count() * self.geometry.wbfs_sec_sz;
            (*slot, out_size)
        })
    }

    /// Non-trim extraction size for `game_id`: the fixed single-layer disc
    /// size, or the dual-layer size when the disc's real extent exceeds
    /// single-layer capacity. Mirrors an original Wii disc's fixed media
    /// size rather than just how much of it is actually live.
    pub fn disc_logical_size(&self, game_id: &str) -> Option<u64> {
        let index = self.find_slot_by_id(game_id)?;
        let last = self.slots[index].last_used_index();
        let real_size = last
            .map(|l| (l as u64 + 1) * self.geometry.wbfs_sec_sz)
            .unwrap_or(0);
        let single_layer_size = crate::wii::WII_SECTORS_SINGLE_LAYER * WII_SECTOR_SIZE;
        let dual_layer_size = crate::wii::WII_SECTORS_DOUBLE_LAYER * WII_SECTOR_SIZE;
        Some(if real_size > single_layer_size {
            dual_layer_size
        } else {
            single_layer_size
        })
    }

    /// Size of `game_id` trimmed to its last live block, or `None` if the
    /// disc is absent or empty.
    pub fn disc_trim_size(&self, game_id: &str) -> Option<u64> {
        let index = self.find_slot_by_id(game_id)?;
        let last = self.slots[index].last_used_index()?;
        Some((last as u64 + 1) * self.geometry.wbfs_sec_sz)
    }

    /// The WBFS block size this container was formatted with, in bytes.
    pub fn wbfs_block_size(&self) -> u64 {
        self.geometry.wbfs_sec_sz
    }

    /// Direct access to the backing device, for callers that need to
    /// resize a freshly formatted, not-yet-populated container (e.g.
    /// shrinking a split file down to the capacity a [`Self::size_disc`]
    /// estimate actually calls for) before adding any discs to it.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn free_space_report(&self) -> FreeSpaceReport {
        let total = self.geometry.n_wbfs_sec * self.geometry.wbfs_sec_sz;
        let free = self.free_bitmap.count_free() * self.geometry.wbfs_sec_sz;
        FreeSpaceReport {
            total_bytes: total,
            used_bytes: total - free,
            free_bytes: free,
        }
    }

    fn compute_usage<RS: std::io::Read + std::io::Seek>(
        &self,
        source: RS,
        selector: PartitionSelector,
        copy_1_1: bool,
    ) -> Result<UsageBitmap> {
        if copy_1_1 {
            let mut walker = DiscWalker::open(source)?;
            walker.build_disc_usage_undecrypted(selector)
        } else {
            let mut walker = DiscWalker::open(source)?;
            walker.build_disc_usage(selector)
        }
    }

    /// Simulates an add without mutating the container: how many blocks it
    /// would use and the highest block index touched.
    pub fn size_disc<RS: std::io::Read + std::io::Seek>(
        &self,
        source: RS,
        selector: PartitionSelector,
        copy_1_1: bool,
    ) -> Result<DiscSizeEstimate> {
        let usage = self.compute_usage(source, selector, copy_1_1)?;
        let used_groups = self.group_indices(&usage);
        Ok(DiscSizeEstimate {
            used_blocks: used_groups.len() as u64,
            last_used_block: used_groups.last().copied().unwrap_or(0),
        })
    }

    /// The Wii-sector-group indices (at WBFS-block granularity) that are
    /// live according to `usage`.
    fn group_indices(&self, usage: &UsageBitmap) -> Vec<u64> {
        let sectors_per_block = self.geometry.wbfs_sec_sz / WII_SECTOR_SIZE;
        let n_groups = self.geometry.n_wbfs_sec_per_disc;
        let mut groups = Vec::new();
        for g in 0..n_groups {
            let start = g * sectors_per_block;
            let end = start + sectors_per_block;
            if (start..end).any(|s| usage.is_used(s)) {
                groups.push(g);
            }
        }
        groups
    }

    /// Adds a disc read from `source` via `read_src`, allocating one WBFS
    /// block per live Wii-sector-group.
    pub fn add_disc<RS: std::io::Read + std::io::Seek>(
        &mut self,
        mut source: RS,
        disc_header: crate::wii::DiscHeader,
        selector: PartitionSelector,
        copy_1_1: bool,
        mut progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let game_id = disc_header.game_id_str();
        if self.find_slot_by_id(&game_id).is_some() {
            return Err(WbfsError::Duplicate(game_id));
        }
        let slot_index = self
            .find_free_slot()
            .ok_or_else(|| WbfsError::Full)?;

        let usage = {
            use std::io::{Read, Seek, SeekFrom};
            source.seek(SeekFrom::Start(0))?;
            if copy_1_1 {
                let mut walker = DiscWalker::open(&mut source)?;
                walker.build_disc_usage_undecrypted(selector)?
            } else {
                let mut walker = DiscWalker::open(&mut source)?;
                walker.build_disc_usage(selector)?
            }
        };
        let groups = self.group_indices(&usage);

        let sectors_per_block = self.geometry.wbfs_sec_sz / WII_SECTOR_SIZE;
        let hd_sectors_per_block = self.geometry.wbfs_sec_sz / HD_SECTOR_SIZE;
        let mut allocated = Vec::new();
        let mut block_map = vec![0u16; self.geometry.n_wbfs_sec_per_disc as usize];

        let rollback = |bitmap: &mut FreeBitmap, allocated: &[u64]| {
            for &b in allocated {
                bitmap.mark_free(b);
            }
        };

        for (i, &group) in groups.iter().enumerate() {
            let block = match self.free_bitmap.allocate() {
                Some(b) => b,
                None => {
                    rollback(&mut self.free_bitmap, &allocated);
                    return Err(WbfsError::Full);
                }
            };
            allocated.push(block);
            block_map[group as usize] = block as u16;

            let byte_off = group * sectors_per_block * WII_SECTOR_SIZE;
            let mut buf = vec![0u8; self.geometry.wbfs_sec_sz as usize];
            use std::io::{Read, Seek, SeekFrom};
            source.seek(SeekFrom::Start(byte_off))?;
            // source may be shorter than a full group near the disc's end.
            let read = source.read(&mut buf)?;
            if read < buf.len() {
                buf[read..].fill(0);
            }
            self.device
                .write_sectors(block * hd_sectors_per_block, hd_sectors_per_block, &buf)?;

            if let Some(cb) = progress.as_deref_mut() {
                if !cb(i as u64 + 1, groups.len() as u64) {
                    rollback(&mut self.free_bitmap, &allocated);
                    return Err(WbfsError::Abort);
                }
            }
        }

        self.slots[slot_index] = DiscSlot {
            header: disc_header,
            block_map,
        };
        self.write_slot(slot_index)?;
        self.write_free_bitmap()?;
        info!(game_id = %game_id, blocks = allocated.len(), "added disc");
        Ok(())
    }

    /// Clears a disc slot and reclaims its blocks. Idempotent: removing a
    /// game id that is not present succeeds without error.
    pub fn remove_disc(&mut self, game_id: &str) -> Result<()> {
        let Some(index) = self.find_slot_by_id(game_id) else {
            debug!(game_id, "remove_disc: no such disc, treating as success");
            return Ok(());
        };
        let slot = std::mem::replace(
            &mut self.slots[index],
            DiscSlot::free(self.geometry.n_wbfs_sec_per_disc),
        );
        for &b in &slot.block_map {
            if b != 0 {
                self.free_bitmap.mark_free(b as u64);
            }
        }
        self.write_slot(index)?;
        self.write_free_bitmap()?;
        info!(game_id, "removed disc");
        Ok(())
    }

    /// Writes every mapped block of `game_id` to `dest` at its natural
    /// disc offset. Entries with no mapped block are left untouched in
    /// `dest` (the caller pre-sizes/zeroes the destination).
    pub fn extract_disc<WS: std::io::Write + std::io::Seek>(
        &mut self,
        game_id: &str,
        mut dest: WS,
        trim: bool,
        mut progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let index = self
            .find_slot_by_id(game_id)
            .ok_or_else(|| WbfsError::NotFound(game_id.to_string()))?;
        let slot = self.slots[index].clone();
        slot.check_magic().ok(); // tolerate non-magic headers from older tools

        let hd_sectors_per_block = self.geometry.wbfs_sec_sz / HD_SECTOR_SIZE;
        let last_used = slot.last_used_index();
        let total = slot.used_block_count();
        let mut done = 0u64;

        for (j, &block) in slot.block_map.iter().enumerate() {
            if trim {
                if let Some(last) = last_used {
                    if j > last {
                        break;
                    }
                } else {
                    break;
                }
            }
            if block == 0 {
                continue;
            }
            let mut buf = vec![0u8; self.geometry.wbfs_sec_sz as usize];
            self.device
                .read_sectors(block as u64 * hd_sectors_per_block, hd_sectors_per_block, &mut buf)?;
            use std::io::{Seek, SeekFrom, Write};
            dest.seek(SeekFrom::Start(j as u64 * self.geometry.wbfs_sec_sz))?;
            dest.write_all(&buf)?;
            done += 1;
            if let Some(cb) = progress.as_deref_mut() {
                if !cb(done, total) {
                    return Err(WbfsError::Abort);
                }
            }
        }
        Ok(())
    }

    /// Recomputes the smallest `n_hd_sec` that still covers the highest
    /// used WBFS block across every occupied slot, rewrites the
    /// superblock, and returns the new HD sector count.
    pub fn trim(&mut self) -> Result<u64> {
        let highest_block = self
            .slots
            .iter()
            .flat_map(|s| s.block_map.iter().copied())
            .map(|b| b as u64)
            .max()
            .unwrap_or(0);
        let sectors_per_block = self.geometry.wbfs_sec_sz / HD_SECTOR_SIZE;
        let new_n_hd_sec = (highest_block + 1) * sectors_per_block;
        self.superblock.n_hd_sec = new_n_hd_sec as u32;
        self.geometry.n_hd_sec = new_n_hd_sec;
        self.write_superblock()?;
        info!(new_n_hd_sec, "trimmed container");
        Ok(new_n_hd_sec)
    }

    pub fn close(mut self) -> Result<()> {
        self.device.close()
    }

    /// Recomputes the set of blocks referenced by occupied slots and
    /// compares it against the free bitmap. Returns the blocks the bitmap
    /// marks used but no slot references — a leak a crash mid-`add_disc`
    /// can leave behind. An empty result means the bitmap is consistent.
    pub fn check_consistency(&self) -> Vec<u64> {
        let referenced = self.referenced_blocks();
        let reserved = self.geometry.reserved_blocks();
        (reserved..self.geometry.n_wbfs_sec)
            .filter(|b| !self.free_bitmap.is_free(*b) && !referenced.contains(b))
            .collect()
    }

    fn referenced_blocks(&self) -> std::collections::HashSet<u64> {
        self.slots
            .iter()
            .flat_map(|s| s.block_map.iter().copied())
            .filter(|&b| b != 0)
            .map(|b| b as u64)
            .collect()
    }

    /// Rebuilds the free bitmap as the bitwise-NOT of every occupied slot's
    /// block map, reclaiming blocks [`Self::check_consistency`] reports as
    /// leaked. Not run implicitly on open.
    pub fn defragment(&mut self) -> Result<u64> {
        let referenced = self.referenced_blocks();
        let reserved = self.geometry.reserved_blocks();
        let mut rebuilt = FreeBitmap::new_all_free(self.geometry.n_wbfs_sec);
        let mut reclaimed = 0u64;
        for b in 1..reserved {
            rebuilt.mark_used(b);
        }
        for b in reserved..self.geometry.n_wbfs_sec {
            if referenced.contains(&b) {
                rebuilt.mark_used(b);
            } else if !self.free_bitmap.is_free(b) {
                reclaimed += 1;
            }
        }
        self.free_bitmap = rebuilt;
        self.write_free_bitmap()?;
        if reclaimed > 0 {
            warn!(reclaimed, "defragment reclaimed leaked blocks");
        } else {
            info!("defragment found no leaked blocks");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;
    use crate::block_io::RawHandle;
    use crate::wii::structs::DiscHeader;
    use crate::wii::WII_DISC_MAGIC;

    fn cursor_device(n_hd_sec: u64) -> RawHandle<Cursor<Vec<u8>>> {
        let buf = vec![0u8; (n_hd_sec * HD_SECTOR_SIZE) as usize];
        RawHandle::new(Cursor::new(buf), n_hd_sec)
    }

    fn minimal_disc(game_id: &[u8; 6], total_size: u64) -> Cursor<Vec<u8>> {
        let mut buf = vec![0u8; total_size as usize];
        buf[0..6].copy_from_slice(game_id);
        buf[0x18..0x1C].copy_from_slice(&WII_DISC_MAGIC.to_be_bytes());
        Cursor::new(buf)
    }

    fn disc_header(game_id: &[u8; 6]) -> DiscHeader {
        DiscHeader {
            game_id: *game_id,
            disc_number: 0,
            disc_version: 0,
            audio_streaming: 0,
            stream_buffer_size: 0,
            wii_magic: WII_DISC_MAGIC,
            gc_magic: 0,
            game_title: [0; 64],
            disable_hash_verif: 0,
            disable_disc_enc: 0,
        }
    }

    #[test]
    fn open_after_fresh_format_recovers_geometry_and_slots() {
        let device = cursor_device(64 * 1024 * 2);
        let wbfs = Wbfs::format_with_geometry(device, 16, 4).unwrap();
        assert_eq!(wbfs.count_discs(), 0);
        let n_wbfs_sec = wbfs.geometry.n_wbfs_sec;
        let n_disc_slots = wbfs.geometry.n_disc_slots;
        let raw = wbfs.device; // same backing buffer, no close() round trip needed
        let reopened = Wbfs::open(raw, false).unwrap();
        assert_eq!(reopened.count_discs(), 0);
        assert_eq!(reopened.geometry.n_wbfs_sec, n_wbfs_sec);
        assert_eq!(reopened.geometry.n_disc_slots, n_disc_slots);
    }

    #[test]
    fn reserved_blocks_are_never_handed_out_by_the_allocator() {
        let device = cursor_device(64 * 1024 * 2);
        let mut wbfs = Wbfs::format_with_geometry(device, 16, 4).unwrap();
        let reserved = wbfs.geometry.reserved_blocks();
        assert!(reserved > 1, "this geometry should need more than the superblock alone");

        let disc_size = 256 * 1024u64;
        loop {
            let id = format!("G{:05}", wbfs.count_discs());
            let game_id: [u8; 6] = id.as_bytes().try_into().unwrap();
            let source = minimal_disc(&game_id, disc_size);
            if wbfs
                .add_disc(source, disc_header(&game_id), PartitionSelector::AllPartitions, true, None)
                .is_err()
            {
                break;
            }
        }
        for slot in &wbfs.slots {
            for &b in &slot.block_map {
                if b != 0 {
                    assert!(b as u64 >= reserved, "block {b} below reserved range {reserved} was allocated");
                }
            }
        }
        assert!(wbfs.check_consistency().is_empty());
    }

    #[test]
    fn add_disc_rolls_back_allocation_when_the_container_is_full() {
        // 20 blocks total; the header/slot-table/bitmap reservation at this
        // slot count eats 19 of them, leaving exactly one free block. A
        // no-partition disc still needs two blocks (one for the disc header
        // group, one for the partition table group), so the add allocates
        // the lone free block, fails to find a second, and must roll the
        // first one back.
        let device = cursor_device(20 * 128);
        let mut wbfs = Wbfs::format_with_geometry(device, 16, 4).unwrap();
        assert_eq!(wbfs.geometry.n_wbfs_sec - wbfs.geometry.reserved_blocks(), 1);
        let free_before = wbfs.free_space_report().free_bytes;

        let disc_size = 1024 * 1024u64;
        let source = minimal_disc(b"GFULL1", disc_size);
        let err = wbfs
            .add_disc(source, disc_header(b"GFULL1"), PartitionSelector::AllPartitions, true, None)
            .unwrap_err();
        assert!(matches!(err, WbfsError::Full));
        assert_eq!(wbfs.free_space_report().free_bytes, free_before);
        assert_eq!(wbfs.count_discs(), 0);
        assert!(wbfs.check_consistency().is_empty());
    }
}
