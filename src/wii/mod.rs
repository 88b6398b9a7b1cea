pub mod crypto;
pub mod fst;
pub mod structs;
pub mod walker;

pub use structs::DiscHeader;
pub use walker::{build_disc_usage, extract_file, DiscWalker, PartitionSelector};

/// Bytes per optical-disc hashing unit.
pub const WII_SECTOR_SIZE: u64 = 0x8000;
/// Usable payload bytes per Wii sector once the 0x400-byte hash prefix of
/// each 0x8000-byte cluster is stripped.
pub const WII_SECTOR_DATA_SIZE: u64 = 0x7C00;
pub const WII_SECTOR_DATA_OFFSET: u64 = 0x400;

pub const WII_SECTORS_SINGLE_LAYER: u64 = 143_432;
pub const WII_SECTORS_DOUBLE_LAYER: u64 = 2 * WII_SECTORS_SINGLE_LAYER;
pub const WII_MAX_SECTORS: u64 = WII_SECTORS_DOUBLE_LAYER;

pub const WII_TITLE_OFF: u64 = 0x20;
pub const WII_TITLE_SIZE: usize = 0x40;

pub const WII_MAX_PART_INFO: usize = 4;
pub const WII_PART_INFO_OFF: u64 = 0x40000;
pub const WII_REGION_OFF: u64 = 0x4E000;
pub const WII_H3_SIZE: usize = 0x18000;

/// Sanity magic at offset 0x18 of a valid Wii disc header.
pub const WII_DISC_MAGIC: u32 = 0x5D1C_9EA3;

/// The common key used to decrypt every retail title's ticket-embedded key.
/// This is not a secret kept by this crate for any purpose beyond reading
/// discs this engine is handed; it does not sign or re-encrypt anything.
pub const WII_COMMON_KEY: [u8; 16] = [
    0xEB, 0xE4, 0x2A, 0x22, 0x5E, 0x85, 0x93, 0xE4, 0x48, 0xD9, 0xC5, 0x45, 0x73, 0x81, 0xAA, 0xF7,
];
