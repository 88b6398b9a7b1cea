//! A single disc slot: the 256-byte Wii disc header (occupancy marker +
//! game id) followed by a big-endian block map of `u16` WBFS-block
//! indices, one per potential Wii-sector group of that disc.

use crate::error::{Result, WbfsError};
use crate::wii::structs::DiscHeader;
use crate::wii::WII_DISC_MAGIC;

#[derive(Debug, Clone)]
pub struct DiscSlot {
    pub header: DiscHeader,
    /// `block_map[j]` is the WBFS block storing Wii-sector-group `j` of
    /// this disc, or 0 if that region is unused padding.
    pub block_map: Vec<u16>,
}

impl DiscSlot {
    pub fn is_occupied(&self) -> bool {
        self.header.game_id[0] != 0
    }

    pub fn game_id(&self) -> String {
        self.header.game_id_str()
    }

    /// Verifies the Wii disc magic at the header's fixed offset; callers
    /// recovering a header from a container slot (as opposed to reading it
    /// live off an ISO being walked) should call this before trusting the
    /// slot further.
    pub fn check_magic(&self) -> Result<()> {
        if self.header.wii_magic != WII_DISC_MAGIC {
            return Err(WbfsError::Format(format!(
                "disc slot magic {:#x} does not match expected {:#x}",
                self.header.wii_magic, WII_DISC_MAGIC
            )));
        }
        Ok(())
    }

    pub fn free(n_wbfs_sec_per_disc: u64) -> Self {
        DiscSlot {
            header: zeroed_header(),
            block_map: vec![0; n_wbfs_sec_per_disc as usize],
        }
    }

    pub fn last_used_index(&self) -> Option<usize> {
        self.block_map.iter().rposition(|&b| b != 0)
    }

    pub fn used_block_count(&self) -> u64 {
        self.block_map.iter().filter(|&&b| b != 0).count() as u64
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut out);
        binrw::BinWrite::write_be(&self.header, &mut cursor).expect("in-memory write cannot fail");
        for &b in &self.block_map {
            out.extend_from_slice(&b.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8], n_wbfs_sec_per_disc: u64) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(bytes);
        let header: DiscHeader = binrw::BinRead::read_be(&mut cursor)?;
        let map_start = 256;
        let mut block_map = Vec::with_capacity(n_wbfs_sec_per_disc as usize);
        for i in 0..n_wbfs_sec_per_disc as usize {
            let off = map_start + i * 2;
            let b = u16::from_be_bytes(
                bytes
                    .get(off..off + 2)
                    .ok_or_else(|| WbfsError::Format("disc slot block map truncated".into()))?
                    .try_into()
                    .unwrap(),
            );
            block_map.push(b);
        }
        Ok(DiscSlot { header, block_map })
    }
}

fn zeroed_header() -> DiscHeader {
    DiscHeader {
        game_id: [0; 6],
        disc_number: 0,
        disc_version: 0,
        audio_streaming: 0,
        stream_buffer_size: 0,
        wii_magic: 0,
        gc_magic: 0,
        game_title: [0; 64],
        disable_hash_verif: 0,
        disable_disc_enc: 0,
    }
}
