//! Selective reader over a Wii disc image: walks the partition table and
//! each selected partition's filesystem to mark which 32 KiB Wii sectors
//! actually hold live data, and can pull a single file's bytes out by path.

use std::io::{Read, Seek, SeekFrom};

use binrw::BinReaderExt;
use tracing::{debug, warn};

use crate::error::{Result, WbfsError};
use crate::wii::crypto::{decrypt_cluster_payload, decrypt_title_key};
use crate::wii::fst::{self, FstNode};
use crate::wii::structs::{
    DiscHeader, PartitionTableHeader, WiiPartTableEntry, WiiPartitionHeader, PART_TYPE_GAME,
    PART_TYPE_OTHER, PART_TYPE_UPDATE,
};
use crate::wii::{
    WII_MAX_PART_INFO, WII_MAX_SECTORS, WII_PART_INFO_OFF, WII_SECTOR_SIZE,
};

/// Which partitions a walk should treat as live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSelector {
    Update,
    Game,
    Other,
    AllPartitions,
    /// Keeps everything except the update partition (game + channel installers).
    RemoveUpdate,
    OnlyGame,
    /// Matches a specific raw partition type value.
    TypeEquals(u32),
}

impl PartitionSelector {
    fn matches(&self, part_type: u32) -> bool {
        match self {
            PartitionSelector::Update => part_type == PART_TYPE_UPDATE,
            PartitionSelector::Game => part_type == PART_TYPE_GAME,
            PartitionSelector::Other => part_type == PART_TYPE_OTHER,
            PartitionSelector::AllPartitions => true,
            PartitionSelector::RemoveUpdate => part_type != PART_TYPE_UPDATE,
            PartitionSelector::OnlyGame => part_type == PART_TYPE_GAME,
            PartitionSelector::TypeEquals(t) => part_type == *t,
        }
    }
}

/// A usage bitmap, one bit per Wii sector, sized for a dual-layer disc.
pub struct UsageBitmap {
    bits: Vec<u8>,
}

impl UsageBitmap {
    fn new() -> Self {
        UsageBitmap {
            bits: vec![0u8; (WII_MAX_SECTORS as usize + 7) / 8],
        }
    }

    fn mark(&mut self, sector: u64) {
        let idx = (sector / 8) as usize;
        let bit = (sector % 8) as u8;
        if idx < self.bits.len() {
            self.bits[idx] |= 1 << bit;
        }
    }

    pub fn is_used(&self, sector: u64) -> bool {
        let idx = (sector / 8) as usize;
        let bit = (sector % 8) as u8;
        idx < self.bits.len() && (self.bits[idx] >> bit) & 1 == 1
    }

    pub fn last_used_sector(&self) -> Option<u64> {
        (0..WII_MAX_SECTORS).rev().find(|&s| self.is_used(s))
    }

    pub fn count_used(&self) -> u64 {
        (0..WII_MAX_SECTORS).filter(|&s| self.is_used(s)).count() as u64
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

struct OpenPartition {
    entry: WiiPartTableEntry,
    header: WiiPartitionHeader,
    title_key: [u8; 16],
}

/// Reads partition metadata and walks filesystem extents to determine disc
/// usage, without mutating the underlying stream.
pub struct DiscWalker<RS: Read + Seek> {
    stream: RS,
    pub header: DiscHeader,
    partitions: Vec<WiiPartTableEntry>,
}

impl<RS: Read + Seek> DiscWalker<RS> {
    pub fn open(mut stream: RS) -> Result<Self> {
        stream.seek(SeekFrom::Start(0))?;
        let header: DiscHeader = stream.read_be()?;
        let partitions = read_partition_table(&mut stream)?;
        Ok(DiscWalker {
            stream,
            header,
            partitions,
        })
    }

    fn open_partition(&mut self, entry: &WiiPartTableEntry) -> Result<OpenPartition> {
        self.stream.seek(SeekFrom::Start(*entry.part_data_off))?;
        let header: WiiPartitionHeader = self.stream.read_be()?;
        let iv = header.ticket.title_key_iv();
        let title_key = decrypt_title_key(&header.ticket.encrypted_title_key, &iv);
        Ok(OpenPartition {
            entry: *entry,
            header,
            title_key,
        })
    }

    /// Reads and decrypts `length` bytes of partition-relative payload
    /// starting at `offset`, growing `buf` to exactly that size.
    fn read_partition_range(
        &mut self,
        part: &OpenPartition,
        offset: u64,
        length: u64,
        buf: &mut Vec<u8>,
    ) -> Result<()> {
        buf.clear();
        buf.reserve(length as usize);
        let data_off = *part.entry.part_data_off + *part.header.data_off;
        let mut remaining_off = offset;
        let mut remaining_len = length;
        while remaining_len > 0 {
            let cluster_index = remaining_off / crate::wii::WII_SECTOR_DATA_SIZE;
            let in_cluster = remaining_off % crate::wii::WII_SECTOR_DATA_SIZE;
            let mut raw = vec![0u8; WII_SECTOR_SIZE as usize];
            self.stream
                .seek(SeekFrom::Start(data_off + cluster_index * WII_SECTOR_SIZE))?;
            self.stream.read_exact(&mut raw)?;
            decrypt_cluster_payload(&part.title_key, &mut raw)?;
            let payload = &raw[crate::wii::WII_SECTOR_DATA_OFFSET as usize..];
            let take = (crate::wii::WII_SECTOR_DATA_SIZE - in_cluster).min(remaining_len);
            buf.extend_from_slice(&payload[in_cluster as usize..][..take as usize]);
            remaining_off += take;
            remaining_len -= take;
        }
        Ok(())
    }

    /// Marks every Wii sector spanned by partition-relative `[offset, offset+length)`
    /// as used, in terms of absolute disc sector numbers.
    fn mark_partition_range(
        &self,
        part: &OpenPartition,
        offset: u64,
        length: u64,
        usage: &mut UsageBitmap,
    ) {
        if length == 0 {
            return;
        }
        let data_off = *part.entry.part_data_off + *part.header.data_off;
        let cluster_data_size = crate::wii::WII_SECTOR_DATA_SIZE;
        let first_cluster = offset / cluster_data_size;
        let last_cluster = (offset + length - 1) / cluster_data_size;
        for cluster in first_cluster..=last_cluster {
            let raw_byte_off = data_off + cluster * WII_SECTOR_SIZE;
            let sector = raw_byte_off / WII_SECTOR_SIZE;
            usage.mark(sector);
        }
    }

    fn read_fst(&mut self, part: &OpenPartition) -> Result<FstNode> {
        // boot.bin sits at partition-relative offset 0 and contains (among
        // other things) the fst offset/size at 0x424/0x428, in 4-byte words.
        let mut boot = Vec::new();
        self.read_partition_range(part, 0, 0x480, &mut boot)?;
        let fst_off = u32::from_be_bytes(boot[0x424..0x428].try_into().unwrap()) as u64 * 4;
        let fst_size = u32::from_be_bytes(boot[0x428..0x42C].try_into().unwrap()) as u64 * 4;
        if fst_size == 0 || fst_size > 64 * 1024 * 1024 {
            return Err(WbfsError::Format(format!(
                "implausible fst size {fst_size}"
            )));
        }
        let mut fst_buf = Vec::new();
        self.read_partition_range(part, fst_off, fst_size, &mut fst_buf)?;
        fst::parse_fst(&fst_buf)
    }

    /// Builds a usage bitmap for the partitions matching `selector`,
    /// marking partition headers, boot info, and every file extent found
    /// by walking each matching partition's filesystem table.
    pub fn build_disc_usage(&mut self, selector: PartitionSelector) -> Result<UsageBitmap> {
        let mut usage = UsageBitmap::new();
        // the disc header and partition table itself always count as used.
        usage.mark(0);
        usage.mark(WII_PART_INFO_OFF / WII_SECTOR_SIZE);

        let entries: Vec<WiiPartTableEntry> = self
            .partitions
            .iter()
            .filter(|e| selector.matches(e.part_type))
            .cloned()
            .collect();

        for entry in &entries {
            let part = self.open_partition(entry)?;
            // partition header + ticket + tmd + cert chain + h3 table
            let header_span = (*part.header.data_off).max(0x2A4 + 0x2C0);
            let header_sector_start = *entry.part_data_off / WII_SECTOR_SIZE;
            let header_sector_end = (*entry.part_data_off + header_span) / WII_SECTOR_SIZE;
            for s in header_sector_start..=header_sector_end {
                usage.mark(s);
            }

            let fst = match self.read_fst(&part) {
                Ok(fst) => fst,
                Err(e) => {
                    warn!(error = %e, "failed to parse filesystem table for partition, marking header only");
                    continue;
                }
            };
            let mut extents = Vec::new();
            fst::for_each_file(&fst, &mut |off, len| extents.push((off, len)));
            debug!(count = extents.len(), "marking file extents as used");
            for (off, len) in extents {
                self.mark_partition_range(&part, off, len, &mut usage);
            }
        }

        Ok(usage)
    }

    /// Marks every Wii sector belonging to a selected partition's data
    /// region as used without running AES, for callers that must keep the
    /// encrypted payload byte-identical.
    pub fn build_disc_usage_undecrypted(&mut self, selector: PartitionSelector) -> Result<UsageBitmap> {
        let mut usage = UsageBitmap::new();
        usage.mark(0);
        usage.mark(WII_PART_INFO_OFF / WII_SECTOR_SIZE);
        for entry in self.partitions.clone() {
            if !selector.matches(entry.part_type) {
                continue;
            }
            let part = self.open_partition(&entry)?;
            let data_off = *entry.part_data_off + *part.header.data_off;
            let data_size = *part.header.data_size;
            let start_sector = data_off / WII_SECTOR_SIZE;
            let end_sector = (data_off + data_size).div_ceil(WII_SECTOR_SIZE);
            for s in start_sector..end_sector {
                usage.mark(s);
            }
        }
        Ok(usage)
    }

    /// Returns the raw decrypted bytes of a single file found by path in
    /// any partition matching `selector`.
    pub fn extract_file(&mut self, selector: PartitionSelector, path: &str) -> Result<Vec<u8>> {
        let entries: Vec<WiiPartTableEntry> = self
            .partitions
            .iter()
            .filter(|e| selector.matches(e.part_type))
            .cloned()
            .collect();
        for entry in &entries {
            let part = self.open_partition(entry)?;
            let fst = self.read_fst(&part)?;
            if let Some(FstNode::File { offset, length, .. }) = fst::find_file(&fst, path) {
                let (offset, length) = (*offset, *length);
                let mut buf = Vec::new();
                self.read_partition_range(&part, offset, length, &mut buf)?;
                return Ok(buf);
            }
        }
        Err(WbfsError::NotFound(path.to_string()))
    }
}

fn read_partition_table<RS: Read + Seek>(stream: &mut RS) -> Result<Vec<WiiPartTableEntry>> {
    stream.seek(SeekFrom::Start(WII_PART_INFO_OFF))?;
    let mut table_headers = Vec::with_capacity(WII_MAX_PART_INFO);
    for _ in 0..WII_MAX_PART_INFO {
        table_headers.push(stream.read_be::<PartitionTableHeader>()?);
    }

    let mut entries = Vec::new();
    for table in table_headers {
        if table.count == 0 {
            continue;
        }
        stream.seek(SeekFrom::Start(*table.offset))?;
        for _ in 0..table.count {
            entries.push(stream.read_be::<WiiPartTableEntry>()?);
        }
    }
    Ok(entries)
}

/// Standalone convenience wrapper matching the capability described for
/// computing a usage bitmap without keeping a [`DiscWalker`] around.
pub fn build_disc_usage<RS: Read + Seek>(
    stream: RS,
    selector: PartitionSelector,
) -> Result<UsageBitmap> {
    DiscWalker::open(stream)?.build_disc_usage(selector)
}

/// Standalone convenience wrapper for single-file extraction.
pub fn extract_file<RS: Read + Seek>(
    stream: RS,
    selector: PartitionSelector,
    path: &str,
) -> Result<Vec<u8>> {
    DiscWalker::open(stream)?.extract_file(selector, path)
}

#[cfg(test)]
mod test {
    use aes::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
    use aes::Aes128;
    use binrw::BinWrite;

    use super::*;
    use crate::wii::structs::{PartitionTableHeader, Ticket, WiiPartTableEntry, WordOffset, PART_TYPE_GAME};
    use crate::wii::{WII_COMMON_KEY, WII_DISC_MAGIC, WII_PART_INFO_OFF, WII_SECTOR_DATA_SIZE};

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn pack_fst_entry(is_dir: bool, name_off: u32, data: u32, len: u32) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0] = is_dir as u8;
        buf[1..4].copy_from_slice(&name_off.to_be_bytes()[1..]);
        buf[4..8].copy_from_slice(&data.to_be_bytes());
        buf[8..12].copy_from_slice(&len.to_be_bytes());
        buf
    }

    /// Builds a minimal disc image with one encrypted game partition
    /// holding a single file, the way a real retail disc's ticket/FST/data
    /// region are laid out, so [`DiscWalker`] can be exercised without a
    /// real disc image on hand.
    fn synthetic_disc_with_encrypted_partition() -> Vec<u8> {
        const PART_DATA_OFF: u64 = 0x50000;
        const CLUSTER_OFF: u64 = 0x8000; // partition-relative; past the header
        let mut buf = vec![0u8; (PART_DATA_OFF + CLUSTER_OFF + WII_SECTOR_SIZE) as usize];
        let mut w = std::io::Cursor::new(&mut buf);

        let header = DiscHeader {
            game_id: *b"GSYNC1",
            disc_number: 0,
            disc_version: 0,
            audio_streaming: 0,
            stream_buffer_size: 0,
            wii_magic: WII_DISC_MAGIC,
            gc_magic: 0,
            game_title: [0; 64],
            disable_hash_verif: 0,
            disable_disc_enc: 0,
        };
        w.set_position(0);
        header.write_be(&mut w).unwrap();

        w.set_position(WII_PART_INFO_OFF);
        PartitionTableHeader {
            count: 1,
            offset: WordOffset(WII_PART_INFO_OFF + 0x20),
        }
        .write_be(&mut w)
        .unwrap();

        w.set_position(WII_PART_INFO_OFF + 0x20);
        WiiPartTableEntry {
            part_data_off: WordOffset(PART_DATA_OFF),
            part_type: PART_TYPE_GAME,
        }
        .write_be(&mut w)
        .unwrap();

        let title_key = [0x11u8; 16];
        let title_id: [u8; 8] = [0, 0, 0, 1, 0, 0, 0, 0];
        let mut title_key_iv = [0u8; 16];
        title_key_iv[..8].copy_from_slice(&title_id);
        let mut encrypted_title_key = title_key;
        Aes128CbcEnc::new(WII_COMMON_KEY.as_ref().into(), title_key_iv.as_ref().into())
            .encrypt_padded_mut::<NoPadding>(&mut encrypted_title_key, 16)
            .unwrap();

        let ticket = Ticket {
            signature_type: 0,
            signature: [0; 256],
            issuer: [0; 64],
            ecdh_data: [0; 60],
            encrypted_title_key,
            ticket_id: [0; 8],
            console_id: 0,
            title_id,
            ticket_version: 0,
            permitted_titles_mask: 0,
            permit_mask: 0,
            title_export_allowed: 0,
            common_key_index: 0,
            content_access_permissions: [0; 64],
            time_limits: [0; 64],
        };
        w.set_position(PART_DATA_OFF);
        WiiPartitionHeader {
            ticket,
            tmd_size: 0,
            tmd_off: WordOffset(0),
            cert_chain_size: 0,
            cert_chain_off: WordOffset(0),
            h3_off: WordOffset(0),
            data_off: WordOffset(CLUSTER_OFF),
            data_size: WordOffset(WII_SECTOR_SIZE),
        }
        .write_be(&mut w)
        .unwrap();

        // boot.bin: fst offset/size live at 0x424/0x428 as 4-byte word counts.
        let mut payload = vec![0u8; WII_SECTOR_DATA_SIZE as usize];
        let fst_off_bytes = 0x480u32;
        let fst_size_bytes = 48u32;
        payload[0x424..0x428].copy_from_slice(&(fst_off_bytes / 4).to_be_bytes());
        payload[0x428..0x42C].copy_from_slice(&(fst_size_bytes / 4).to_be_bytes());

        let fst_start = fst_off_bytes as usize;
        payload[fst_start..fst_start + 12].copy_from_slice(&pack_fst_entry(true, 0, 0, 2));
        payload[fst_start + 12..fst_start + 24].copy_from_slice(&pack_fst_entry(false, 0, 0x2000, 0x1000));
        payload[fst_start + 24..fst_start + 24 + 9].copy_from_slice(b"test.bin\0");

        payload[0x2000..0x3000].fill(0xCD);

        Aes128CbcEnc::new(title_key.as_ref().into(), [0x42u8; 16].as_ref().into())
            .encrypt_padded_mut::<NoPadding>(&mut payload, payload.len())
            .unwrap();

        let mut raw_cluster = vec![0u8; WII_SECTOR_SIZE as usize];
        raw_cluster[0x3D0..0x3E0].copy_from_slice(&[0x42u8; 16]);
        raw_cluster[0x400..].copy_from_slice(&payload);

        let cluster_abs_off = PART_DATA_OFF + CLUSTER_OFF;
        w.set_position(cluster_abs_off);
        std::io::Write::write_all(&mut w, &raw_cluster).unwrap();

        buf
    }

    #[test]
    fn build_disc_usage_marks_encrypted_partition_header_and_file_sectors() {
        let disc = synthetic_disc_with_encrypted_partition();
        let mut walker = DiscWalker::open(std::io::Cursor::new(disc)).unwrap();
        let usage = walker.build_disc_usage(PartitionSelector::AllPartitions).unwrap();

        // the partition header starts at sector 10 (0x50000) and, since its
        // span is set by data_off itself, its inclusive range reaches sector
        // 11 (0x58000) where the lone data cluster also lives.
        assert!(usage.is_used(0), "disc header sector");
        assert!(usage.is_used(WII_PART_INFO_OFF / WII_SECTOR_SIZE), "partition table sector");
        assert!(usage.is_used(10), "partition header start sector");
        assert!(usage.is_used(11), "partition header end / data cluster sector");
        assert!(!usage.is_used(12), "nothing lives past the single data cluster");
        assert_eq!(usage.last_used_sector(), Some(11));
    }

    #[test]
    fn extract_file_decrypts_and_returns_exact_bytes() {
        let disc = synthetic_disc_with_encrypted_partition();
        let mut walker = DiscWalker::open(std::io::Cursor::new(disc)).unwrap();
        let data = walker.extract_file(PartitionSelector::AllPartitions, "test.bin").unwrap();
        assert_eq!(data.len(), 0x1000);
        assert!(data.iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn extract_file_missing_path_is_not_found() {
        let disc = synthetic_disc_with_encrypted_partition();
        let mut walker = DiscWalker::open(std::io::Cursor::new(disc)).unwrap();
        let err = walker.extract_file(PartitionSelector::AllPartitions, "nope.bin").unwrap_err();
        assert!(matches!(err, WbfsError::NotFound(_)));
    }
}
