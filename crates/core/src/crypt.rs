//! Block encryption with an externally supplied key/iv pair.
//!
//! Encrypted repos store ciphertext blocks; the key oracle hands the
//! data plane a raw AES-256 key and a 16-byte iv as hex strings. Key
//! derivation and password handling live outside this crate.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// An AES-256-CBC key/iv pair.
#[derive(Clone)]
pub struct CryptKey {
    key: [u8; 32],
    iv: [u8; 16],
}

impl CryptKey {
    /// Parse a key/iv pair from the hex strings the key oracle returns.
    pub fn from_hex(key: &str, iv: &str) -> crate::Result<Self> {
        let key_bytes = decode_hex(key)?;
        let iv_bytes = decode_hex(iv)?;
        let key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| crate::Error::InvalidCryptKey("key must be 32 bytes".to_string()))?;
        let iv: [u8; 16] = iv_bytes
            .try_into()
            .map_err(|_| crate::Error::InvalidCryptKey("iv must be 16 bytes".to_string()))?;
        Ok(Self { key, iv })
    }

    /// Encrypt a block payload (PKCS#7 padded).
    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plain)
    }

    /// Decrypt a block payload.
    pub fn decrypt(&self, cipher: &[u8]) -> crate::Result<Vec<u8>> {
        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(cipher)
            .map_err(|_| crate::Error::Decrypt)
    }
}

impl std::fmt::Debug for CryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptKey").finish_non_exhaustive()
    }
}

fn decode_hex(s: &str) -> crate::Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(crate::Error::InvalidCryptKey("odd hex length".to_string()));
    }
    s.as_bytes()
        .chunks(2)
        .map(|chunk| {
            let hex_str = std::str::from_utf8(chunk)
                .map_err(|e| crate::Error::InvalidCryptKey(e.to_string()))?;
            u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidCryptKey(e.to_string()))
        })
        .collect()
}
