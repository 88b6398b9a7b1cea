//! Big-endian, word-offset-heavy on-disk structures for a Wii optical disc
//! image. Field shapes follow the format's own convention of addressing
//! almost everything in 4-byte words; [`WordOffset`] carries that
//! conversion so callers work in bytes.

use std::io::{Read, Seek, Write};

use binrw::{BinRead, BinResult, BinWrite, Endian};

/// A big-endian `u32` that addresses 4-byte words; transparently exposed
/// as a byte offset via `Deref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WordOffset(pub u64);

impl std::ops::Deref for WordOffset {
    type Target = u64;
    fn deref(&self) -> &u64 {
        &self.0
    }
}

impl BinRead for WordOffset {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let raw = u32::read_options(reader, endian, ())?;
        Ok(WordOffset(raw as u64 * 4))
    }
}

impl BinWrite for WordOffset {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<()> {
        let raw = (self.0 / 4) as u32;
        raw.write_options(writer, endian, ())
    }
}

/// The first 256 bytes of every Wii disc and every disc-slot entry in a
/// container: game id, region/version markers, and the human-readable
/// title. Byte 0 of the id being `0` marks a container slot as free.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(big)]
pub struct DiscHeader {
    pub game_id: [u8; 6],
    pub disc_number: u8,
    pub disc_version: u8,
    pub audio_streaming: u8,
    pub stream_buffer_size: u8,
    #[brw(pad_before = 14)]
    pub wii_magic: u32,
    pub gc_magic: u32,
    pub game_title: [u8; 64],
    pub disable_hash_verif: u8,
    #[brw(pad_after = 158)]
    pub disable_disc_enc: u8,
}

impl DiscHeader {
    pub fn game_id_str(&self) -> String {
        String::from_utf8_lossy(&self.game_id).into_owned()
    }
}

/// One entry in the 4-byte-word addressed partition info table at
/// `WII_PART_INFO_OFF`.
#[derive(BinRead, BinWrite, Debug, Clone, Copy)]
#[brw(big)]
pub struct PartitionTableHeader {
    pub count: u32,
    pub offset: WordOffset,
}

/// Partition type is a plain `u32`, not a closed enum: discs may carry
/// values outside {0,1,2} and a selector may match on the raw number.
pub const PART_TYPE_UPDATE: u32 = 0;
pub const PART_TYPE_GAME: u32 = 1;
pub const PART_TYPE_OTHER: u32 = 2;

#[derive(BinRead, BinWrite, Debug, Clone, Copy)]
#[brw(big)]
pub struct WiiPartTableEntry {
    pub part_data_off: WordOffset,
    pub part_type: u32,
}

/// The Wii retail ticket, 0x2A4 bytes. Only the fields this crate actually
/// consumes (`title_key`, `title_id`, `common_key_index`) are given
/// meaningful names; the rest are kept as correctly-sized padding so the
/// structure round-trips byte for byte.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(big)]
pub struct Ticket {
    pub signature_type: u32,
    pub signature: [u8; 256],
    #[brw(pad_before = 60)]
    pub issuer: [u8; 64],
    pub ecdh_data: [u8; 60],
    #[brw(pad_before = 3)]
    pub encrypted_title_key: [u8; 16],
    #[brw(pad_before = 1)]
    pub ticket_id: [u8; 8],
    pub console_id: u32,
    pub title_id: [u8; 8],
    #[brw(pad_before = 2)]
    pub ticket_version: u16,
    pub permitted_titles_mask: u32,
    pub permit_mask: u32,
    pub title_export_allowed: u8,
    pub common_key_index: u8,
    #[brw(pad_before = 48)]
    pub content_access_permissions: [u8; 64],
    #[brw(pad_before = 2)]
    pub time_limits: [u8; 64],
}

impl Ticket {
    /// The partition id used as the AES-CBC IV when decrypting
    /// [`Self::encrypted_title_key`]: the first 8 bytes of `title_id`
    /// followed by 8 zero bytes.
    pub fn title_key_iv(&self) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&self.title_id);
        iv
    }
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(big)]
pub struct TmdContentEntry {
    pub content_id: u32,
    pub index: u16,
    pub flags: u16,
    pub size: u64,
    pub hash: [u8; 20],
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(big)]
pub struct TmdHeader {
    pub signature_type: u32,
    pub signature: [u8; 256],
    #[brw(pad_before = 60)]
    pub issuer: [u8; 64],
    pub version: u8,
    pub ca_crl_version: u8,
    pub signer_crl_version: u8,
    pub is_vwii: u8,
    pub system_version: u64,
    pub title_id: u64,
    pub title_type: u32,
    pub group_id: u16,
    #[brw(pad_before = 62)]
    pub access_rights: u32,
    pub title_version: u16,
    pub num_contents: u16,
    pub boot_index: u16,
    #[brw(pad_before = 2)]
    pub main_content: TmdContentEntry,
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(big)]
pub struct Certificate {
    pub signature_type: u32,
    #[brw(pad_size_to = 0x240)]
    pub signature: [u8; 0x3C],
    pub issuer: [u8; 64],
    pub key_type: u32,
    pub child_cert_identity: [u8; 64],
    pub public_key: [u8; 0x23C],
}

/// Header located at a partition's own offset 0: ticket, tmd/cert/h3
/// pointers, and the decrypted data's offset and size.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(big)]
pub struct WiiPartitionHeader {
    pub ticket: Ticket,
    pub tmd_size: u32,
    pub tmd_off: WordOffset,
    pub cert_chain_size: u32,
    pub cert_chain_off: WordOffset,
    pub h3_off: WordOffset,
    pub data_off: WordOffset,
    pub data_size: WordOffset,
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(big)]
pub struct ApploaderHeader {
    pub date: [u8; 16],
    pub entry_point: u32,
    pub size1: u32,
    pub size2: u32,
    pub _pad: u32,
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(big)]
pub struct DolHeader {
    pub text_off: [u32; 7],
    pub data_off: [u32; 11],
    pub text_addr: [u32; 7],
    pub data_addr: [u32; 11],
    pub text_sizes: [u32; 7],
    pub data_sizes: [u32; 11],
    pub bss_addr: u32,
    pub bss_size: u32,
    pub entry_point: u32,
}

/// One 12-byte file-system-table entry: a file or directory node.
#[derive(BinRead, BinWrite, Debug, Clone, Copy)]
#[brw(big)]
pub struct FstEntry {
    pub type_and_name_off: u32,
    pub data_offset: u32,
    pub length: u32,
}

impl FstEntry {
    pub fn is_dir(&self) -> bool {
        (self.type_and_name_off >> 24) == 1
    }

    pub fn name_offset(&self) -> u32 {
        self.type_and_name_off & 0x00FF_FFFF
    }
}
