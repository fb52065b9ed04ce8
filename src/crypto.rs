//! Symmetric-key cryptography for the Tuya LAN protocol.
//! AES-128-ECB with PKCS#7 padding (v3.1 - v3.4) and AES-128-GCM (v3.5),
//! plus key preparation and the shared UDP broadcast key.

use crate::error::{Result, TuyaError};
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use cipher::{BlockDecryptMut, BlockEncryptMut};
use ecb::{Decryptor, Encryptor};
use md5::{Digest, Md5};
use std::sync::OnceLock;

const BLOCK_LEN: usize = 16;
/// GCM nonce length on the wire (v3.5 frames).
pub const GCM_NONCE_LEN: usize = 12;
/// GCM authentication tag length on the wire (v3.5 frames).
pub const GCM_TAG_LEN: usize = 16;

/// Seed for the shared broadcast secret; every device on the LAN uses its MD5.
const UDP_KEY_SEED: &[u8] = b"yGAdlopoPVldABfn";

static UDP_KEY: OnceLock<[u8; 16]> = OnceLock::new();

/// The fixed key used to decrypt UDP device announcements: MD5 of `yGAdlopoPVldABfn`.
pub fn udp_key() -> &'static [u8; 16] {
    UDP_KEY.get_or_init(|| {
        let digest = Md5::digest(UDP_KEY_SEED);
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest);
        key
    })
}

/// Prepares a local key for AES-128: raw bytes, right-padded with zeros or
/// truncated to exactly 16 bytes. No text transcoding is applied.
pub fn prepare_key(raw: &[u8]) -> [u8; 16] {
    let mut key = [0u8; 16];
    let n = raw.len().min(16);
    key[..n].copy_from_slice(&raw[..n]);
    key
}

/// Appends PKCS#7 padding up to the next 16-byte boundary.
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_LEN - data.len() % BLOCK_LEN;
    let mut padded = data.to_vec();
    padded.resize(data.len() + pad_len, pad_len as u8);
    padded
}

/// Strips PKCS#7 padding. The final byte must name a pad length in 1..=16 that
/// fits the buffer; with `verify` set, every padding byte is checked as well.
pub fn pkcs7_unpad(mut data: Vec<u8>, verify: bool) -> Result<Vec<u8>> {
    let pad_len = *data.last().ok_or(TuyaError::DecryptionFailed)? as usize;
    if pad_len == 0 || pad_len > BLOCK_LEN || pad_len > data.len() {
        return Err(TuyaError::DecryptionFailed);
    }
    if verify
        && data[data.len() - pad_len..]
            .iter()
            .any(|&b| b as usize != pad_len)
    {
        return Err(TuyaError::DecryptionFailed);
    }
    data.truncate(data.len() - pad_len);
    Ok(data)
}

/// AES-128 wrapper sitting between the message codec and the cipher primitives.
pub struct TuyaCipher {
    key: [u8; 16],
    gcm: Aes128Gcm,
}

impl TuyaCipher {
    /// Create a cipher from a prepared 16-byte key.
    pub fn new(key: &[u8; 16]) -> Self {
        Self {
            key: *key,
            gcm: Aes128Gcm::new(&(*key).into()),
        }
    }

    /// ECB encryption. With `pad` set the input is PKCS#7-padded first;
    /// otherwise its length must already be a block multiple.
    pub fn encrypt_ecb(&self, data: &[u8], pad: bool) -> Result<Vec<u8>> {
        let mut buf = if pad {
            pkcs7_pad(data)
        } else {
            if !data.len().is_multiple_of(BLOCK_LEN) {
                return Err(TuyaError::EncryptionFailed);
            }
            data.to_vec()
        };

        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(BLOCK_LEN) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }
        Ok(buf)
    }

    /// ECB decryption followed by PKCS#7 strip.
    pub fn decrypt_ecb(&self, data: &[u8], verify_padding: bool) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(BLOCK_LEN) {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut buf = data.to_vec();
        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(BLOCK_LEN) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }
        pkcs7_unpad(buf, verify_padding)
    }

    /// GCM encryption with a 12-byte nonce and optional AAD.
    /// Returns `nonce || ciphertext || tag`. A fresh random nonce is generated
    /// when `iv` is not supplied; nonces must never repeat under one key.
    pub fn encrypt_gcm(
        &self,
        data: &[u8],
        iv: Option<&[u8]>,
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; GCM_NONCE_LEN] = match iv {
            Some(iv) => iv
                .get(..GCM_NONCE_LEN)
                .and_then(|s| s.try_into().ok())
                .ok_or(TuyaError::EncryptionFailed)?,
            None => {
                let mut nonce = [0u8; GCM_NONCE_LEN];
                rand::RngCore::fill_bytes(&mut rand::rng(), &mut nonce);
                nonce
            }
        };

        let payload = Payload {
            msg: data,
            aad: aad.unwrap_or(&[]),
        };
        let mut ciphertext = self
            .gcm
            .encrypt(Nonce::from_slice(&nonce_bytes), payload)
            .map_err(|_| TuyaError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.append(&mut ciphertext);
        Ok(out)
    }

    /// GCM decryption. Accepts `nonce || ciphertext || tag` when `iv` is not
    /// supplied, or a caller-supplied nonce with `ciphertext || tag` input.
    /// Fails on tag mismatch.
    pub fn decrypt_gcm(
        &self,
        data: &[u8],
        iv: Option<&[u8]>,
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let (nonce, ciphertext) = match iv {
            Some(iv) => (
                iv.get(..GCM_NONCE_LEN).ok_or(TuyaError::DecryptionFailed)?,
                data,
            ),
            None => {
                if data.len() < GCM_NONCE_LEN + GCM_TAG_LEN {
                    return Err(TuyaError::DecryptionFailed);
                }
                data.split_at(GCM_NONCE_LEN)
            }
        };

        let payload = Payload {
            msg: ciphertext,
            aad: aad.unwrap_or(&[]),
        };
        self.gcm
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| TuyaError::DecryptionFailed)
    }

    /// ECB encryption rendered as Base64, as used by v3.1 control payloads.
    pub fn encrypt_ecb_b64(&self, data: &[u8]) -> Result<Vec<u8>> {
        use base64::{Engine as _, engine::general_purpose};
        let encrypted = self.encrypt_ecb(data, true)?;
        Ok(general_purpose::STANDARD.encode(encrypted).into_bytes())
    }

    /// Base64 decode followed by ECB decryption (v3.1 inbound payloads).
    pub fn decrypt_ecb_b64(&self, data: &[u8]) -> Result<Vec<u8>> {
        use base64::{Engine as _, engine::general_purpose};
        let raw = general_purpose::STANDARD
            .decode(data)
            .map_err(|_| TuyaError::DecryptionFailed)?;
        self.decrypt_ecb(&raw, false)
    }

    /// The v3.1 payload signature: hex MD5 of `data=<b64>||lpv=3.1||<key>`,
    /// bytes 8..24 of the digest string.
    pub fn md5_signature(&self, b64_payload: &[u8]) -> Vec<u8> {
        let mut hasher = Md5::new();
        hasher.update(b"data=");
        hasher.update(b64_payload);
        hasher.update(b"||lpv=3.1||");
        hasher.update(self.key);
        let hexdigest = hex::encode(hasher.finalize());
        hexdigest.as_bytes()[8..24].to_vec()
    }
}
