//! AES-128-CBC primitives for reading (never re-signing) Wii disc content.
//!
//! Mirrors the block-cache-then-decrypt pattern used throughout the
//! teacher crate's partition reader: a whole 0x8000-byte cluster is read
//! and decrypted at once, keyed by the title key and the IV embedded in
//! the cluster's own hash prefix.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use aes::Aes128;

use crate::error::{Result, WbfsError};
use crate::wii::{WII_COMMON_KEY, WII_SECTOR_DATA_OFFSET};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Decrypts a ticket's embedded title key using the Wii common key, with
/// the partition's title id (zero-extended to 16 bytes) as IV.
pub fn decrypt_title_key(encrypted_title_key: &[u8; 16], title_id_iv: &[u8; 16]) -> [u8; 16] {
    let mut buf = *encrypted_title_key;
    let crypto = Aes128CbcDec::new(WII_COMMON_KEY.as_ref().into(), title_id_iv.as_ref().into());
    crypto
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .expect("title key block is exactly one AES block");
    buf
}

/// Decrypts one 0x8000-byte raw cluster's 0x7C00-byte payload in place,
/// using the bytes at `0x3d0..0x3e0` of the cluster itself as the IV (the
/// convention every Wii disc partition follows).
pub fn decrypt_cluster_payload(title_key: &[u8; 16], raw_cluster: &mut [u8]) -> Result<()> {
    if raw_cluster.len() != crate::wii::WII_SECTOR_SIZE as usize {
        return Err(WbfsError::Format(format!(
            "cluster length {} is not {}",
            raw_cluster.len(),
            crate::wii::WII_SECTOR_SIZE
        )));
    }
    let iv: [u8; 16] = raw_cluster[0x3D0..0x3E0]
        .try_into()
        .expect("slice is exactly 16 bytes");
    let crypto = Aes128CbcDec::new(title_key.into(), &iv.into());
    let payload = &mut raw_cluster[WII_SECTOR_DATA_OFFSET as usize..];
    crypto
        .decrypt_padded_mut::<NoPadding>(payload)
        .map_err(|_| WbfsError::Format("cluster payload decryption failed".into()))?;
    Ok(())
}
