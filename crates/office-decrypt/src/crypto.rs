//! Crypto primitives for MS-OFFCRYPTO "Agile Encryption".
//!
//! Password hashing, key/IV derivation, raw AES-CBC and HMAC helpers. The Agile cipher in
//! [`crate::agile`] composes these; nothing here knows about descriptors or containers.
//!
//! References:
//! - MS-OFFCRYPTO: https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-offcrypto/

use aes::{Aes128, Aes192, Aes256};
use cbc::Decryptor;
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Digest as _;
use subtle::ConstantTimeEq as _;
use zeroize::Zeroizing;

use crate::error::{CryptoError, DescriptorError};

pub const AES_BLOCK_SIZE: usize = 16;

/// MS-OFFCRYPTO Agile: block key used for deriving the "verifierHashInput" key.
pub const VERIFIER_HASH_INPUT_BLOCK: [u8; 8] = [0xFE, 0xA7, 0xD2, 0x76, 0x3B, 0x4B, 0x9E, 0x79];
/// MS-OFFCRYPTO Agile: block key used for deriving the "verifierHashValue" key.
pub const VERIFIER_HASH_VALUE_BLOCK: [u8; 8] = [0xD7, 0xAA, 0x0F, 0x6D, 0x30, 0x61, 0x34, 0x4E];
/// MS-OFFCRYPTO Agile: block key used for deriving the "keyValue" key.
pub const KEY_VALUE_BLOCK: [u8; 8] = [0x14, 0x6E, 0x0B, 0xE7, 0xAB, 0xAC, 0xD0, 0xD6];
/// MS-OFFCRYPTO Agile: block key used for deriving the HMAC key IV.
pub const HMAC_KEY_BLOCK: [u8; 8] = [0x5F, 0xB2, 0xAD, 0x01, 0x0C, 0xB9, 0xE1, 0xF6];
/// MS-OFFCRYPTO Agile: block key used for deriving the HMAC value IV.
pub const HMAC_VALUE_BLOCK: [u8; 8] = [0xA0, 0x67, 0x7F, 0x02, 0xB2, 0x2C, 0x84, 0x33];

/// Hash algorithm identifiers used by MS-OFFCRYPTO Agile encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Parse a hash algorithm name as used in the `EncryptionInfo` XML.
    ///
    /// Names are case-insensitive and tolerate `-`/`_` separators (`SHA512`, `sha-256`).
    pub fn parse_offcrypto_name(name: &str) -> Result<Self, DescriptorError> {
        let normalized = name
            .trim()
            .to_ascii_lowercase()
            .replace(['-', '_'], "");
        match normalized.as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(DescriptorError::UnsupportedHashAlgorithm(name.trim().to_string())),
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        self.hash_two(data, &[])
    }

    fn hash_two(self, a: &[u8], b: &[u8]) -> Vec<u8> {
        fn run<D: sha2::Digest>(a: &[u8], b: &[u8]) -> Vec<u8> {
            let mut h = D::new();
            h.update(a);
            h.update(b);
            h.finalize().to_vec()
        }

        match self {
            HashAlgorithm::Sha1 => run::<sha1::Sha1>(a, b),
            HashAlgorithm::Sha256 => run::<sha2::Sha256>(a, b),
            HashAlgorithm::Sha384 => run::<sha2::Sha384>(a, b),
            HashAlgorithm::Sha512 => run::<sha2::Sha512>(a, b),
        }
    }

    fn hash_into(self, data: &[u8], out: &mut [u8]) {
        match self {
            HashAlgorithm::Sha1 => out.copy_from_slice(&sha1::Sha1::digest(data)),
            HashAlgorithm::Sha256 => out.copy_from_slice(&sha2::Sha256::digest(data)),
            HashAlgorithm::Sha384 => out.copy_from_slice(&sha2::Sha384::digest(data)),
            HashAlgorithm::Sha512 => out.copy_from_slice(&sha2::Sha512::digest(data)),
        }
    }
}

/// UTF-16LE with no BOM and no terminator.
pub(crate) fn password_utf16le_bytes(password: &str) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(password.len().saturating_mul(2)));
    for unit in password.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Hash an Agile encryption password.
///
/// 1. `H = Hash(salt || UTF-16LE(password))`
/// 2. For `i in 0..spin_count`: `H = Hash(LE32(i) || H)`
pub fn hash_password(
    password: &str,
    salt: &[u8],
    spin_count: u32,
    hash_alg: HashAlgorithm,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if salt.is_empty() {
        return Err(CryptoError::InvalidParameter("salt must be non-empty"));
    }

    let pw = password_utf16le_bytes(password);
    let digest_len = hash_alg.digest_len();
    let mut h = Zeroizing::new(hash_alg.hash_two(salt, &pw));

    // Reuse one buffer for every round instead of allocating per iteration.
    let mut round = Zeroizing::new(vec![0u8; 4 + digest_len]);
    for i in 0..spin_count {
        round[..4].copy_from_slice(&i.to_le_bytes());
        round[4..].copy_from_slice(&h);
        hash_alg.hash_into(&round, &mut h);
    }

    Ok(h)
}

fn truncate_or_pad(mut out: Vec<u8>, len: usize) -> Vec<u8> {
    // Shorter outputs are padded with 0x00, longer ones truncated.
    out.resize(len, 0u8);
    out
}

/// Derive a key of `key_len` bytes: `Hash(H || blockKey)`, truncated or zero-padded.
pub fn derive_key(
    h: &[u8],
    block_key: &[u8],
    key_len: usize,
    hash_alg: HashAlgorithm,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if h.is_empty() {
        return Err(CryptoError::InvalidParameter("password hash must be non-empty"));
    }
    if block_key.is_empty() {
        return Err(CryptoError::InvalidParameter("block key must be non-empty"));
    }
    Ok(Zeroizing::new(truncate_or_pad(
        hash_alg.hash_two(h, block_key),
        key_len,
    )))
}

/// Derive an IV of `iv_len` bytes: `Hash(salt || blockKey)`, truncated or zero-padded.
pub fn derive_iv(
    salt: &[u8],
    block_key: &[u8],
    iv_len: usize,
    hash_alg: HashAlgorithm,
) -> Result<Vec<u8>, CryptoError> {
    if salt.is_empty() {
        return Err(CryptoError::InvalidParameter("salt must be non-empty"));
    }
    if block_key.is_empty() {
        return Err(CryptoError::InvalidParameter("block key must be non-empty"));
    }
    Ok(truncate_or_pad(hash_alg.hash_two(salt, block_key), iv_len))
}

/// IV for `EncryptedPackage` segment `segment_index` (block key `LE32(segment_index)`).
pub fn segment_iv(
    salt: &[u8],
    segment_index: u32,
    iv_len: usize,
    hash_alg: HashAlgorithm,
) -> Result<Vec<u8>, CryptoError> {
    derive_iv(salt, &segment_index.to_le_bytes(), iv_len, hash_alg)
}

/// In-place AES-CBC decryption without padding removal.
///
/// Agile ciphertexts are always whole blocks; callers truncate to the semantic length stored
/// elsewhere in the format.
pub fn aes_cbc_decrypt_in_place(
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
    field: &'static str,
) -> Result<(), CryptoError> {
    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::InvalidIvLength(iv.len()));
    }
    if buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::CiphertextNotBlockAligned {
            field,
            len: buf.len(),
        });
    }
    if buf.is_empty() {
        return Ok(());
    }

    let len = buf.len();
    let not_aligned = |_| CryptoError::CiphertextNotBlockAligned { field, len };
    match key.len() {
        16 => {
            Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::UnsupportedKeyLength(key.len()))?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(not_aligned)?;
        }
        24 => {
            Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::UnsupportedKeyLength(key.len()))?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(not_aligned)?;
        }
        32 => {
            Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::UnsupportedKeyLength(key.len()))?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(not_aligned)?;
        }
        other => return Err(CryptoError::UnsupportedKeyLength(other)),
    }

    Ok(())
}

/// Copying variant of [`aes_cbc_decrypt_in_place`].
pub fn aes_cbc_decrypt(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    field: &'static str,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mut out = Zeroizing::new(ciphertext.to_vec());
    aes_cbc_decrypt_in_place(key, iv, &mut out, field)?;
    Ok(out)
}

pub fn hmac(alg: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    fn run<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidParameter("invalid HMAC key"))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    match alg {
        HashAlgorithm::Sha1 => run::<Hmac<sha1::Sha1>>(key, data),
        HashAlgorithm::Sha256 => run::<Hmac<sha2::Sha256>>(key, data),
        HashAlgorithm::Sha384 => run::<Hmac<sha2::Sha384>>(key, data),
        HashAlgorithm::Sha512 => run::<Hmac<sha2::Sha512>>(key, data),
    }
}

/// Constant-time equality; slices of different length compare unequal.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}
