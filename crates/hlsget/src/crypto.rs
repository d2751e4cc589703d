// AES-128-CBC segment decryption and MPEG-TS sync-byte recovery.

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockModeDecrypt, KeyIvInit, block_padding::Pkcs7};

use crate::config::IvPolicy;
use crate::error::DownloadError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// First byte of every MPEG-TS packet.
pub const TS_SYNC_BYTE: u8 = 0x47;

pub const AES_BLOCK_LEN: usize = 16;

/// Derive the CBC IV for one segment.
pub fn derive_iv(policy: IvPolicy, key: &[u8; 16], index: u64) -> [u8; 16] {
    match policy {
        IvPolicy::KeyAsIv => *key,
        IvPolicy::SequenceNumber => {
            let mut iv = [0u8; 16];
            iv[8..].copy_from_slice(&index.to_be_bytes());
            iv
        }
    }
}

/// AES-128-CBC decrypt with PKCS#7 unpadding.
///
/// The ciphertext must be a whole number of AES blocks; a violation usually
/// means a torn download and surfaces as a retryable error.
pub fn decrypt(data: Bytes, key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes, DownloadError> {
    if data.is_empty() || data.len() % AES_BLOCK_LEN != 0 {
        return Err(DownloadError::decryption(format!(
            "ciphertext length {} is not a positive multiple of {AES_BLOCK_LEN}",
            data.len()
        )));
    }

    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
        DownloadError::decryption(format!("failed to initialize AES decryptor: {e}"))
    })?;
    let plaintext_len = cipher
        .decrypt_padded::<Pkcs7>(&mut buffer)
        .map_err(|e| DownloadError::decryption(format!("bad PKCS#7 padding: {e}")))?
        .len();
    buffer.truncate(plaintext_len);
    Ok(Bytes::from(buffer))
}

/// Drop any leading bytes before the first TS sync byte.
///
/// Some servers prepend junk that breaks playback of the merged stream.
/// Payloads without a sync byte pass through unmodified.
pub fn trim_to_sync_byte(data: Bytes) -> Bytes {
    match memchr::memchr(TS_SYNC_BYTE, &data) {
        Some(0) | None => data,
        Some(at) => data.slice(at..),
    }
}
