//! MS-OFFCRYPTO Agile key unwrapping and `EncryptedPackage` decryption.
//!
//! The password KDF ([`crate::crypto::hash_password`]) is computed once per attempt and reused for
//! the three password-encryptor blocks:
//! - block 1: `encryptedVerifierHashInput`
//! - block 2: `encryptedVerifierHashValue`
//! - block 3: `encryptedKeyValue` (the package key)

use zeroize::Zeroizing;

use crate::crypto::{
    aes_cbc_decrypt, aes_cbc_decrypt_in_place, ct_eq, derive_iv, derive_key, hash_password, hmac,
    segment_iv, AES_BLOCK_SIZE, HMAC_KEY_BLOCK, HMAC_VALUE_BLOCK, KEY_VALUE_BLOCK,
    VERIFIER_HASH_INPUT_BLOCK, VERIFIER_HASH_VALUE_BLOCK,
};
use crate::decryptor::DecryptOptions;
use crate::descriptor::{AgileParameters, DataIntegrity};
use crate::error::{ContainerError, ContainerErrorKind, CryptoError};

/// `EncryptedPackage` ciphertext is split into independently-IV'd segments of this size.
pub const SEGMENT_SIZE: usize = 4096;

/// Length of the little-endian plaintext size prefix of `EncryptedPackage`.
pub const SIZE_PREFIX_LEN: usize = 8;

/// Key derivation and payload decryption for Agile encryption.
pub trait AgileCrypto {
    /// Verify `password` and unwrap the package key.
    ///
    /// A wrong password is reported as [`CryptoError::VerifierMismatch`].
    fn derive_key(
        &self,
        password: &str,
        params: &AgileParameters,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    /// Decrypt a whole `EncryptedPackage` stream (size prefix included).
    fn decrypt(
        &self,
        key: &[u8],
        params: &AgileParameters,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Default [`AgileCrypto`] implementation (AES-CBC, SHA-1/SHA-2).
#[derive(Debug, Clone, Default)]
pub struct AgileCipher {
    /// Check the `dataIntegrity` HMAC when the descriptor carries one.
    pub verify_integrity: bool,
    /// Refuse payloads whose declared plaintext size exceeds this many bytes.
    pub max_output_size: Option<u64>,
}

/// How the AES-CBC IV of the password-encryptor blobs is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PasswordIv {
    /// The encryptor's `saltValue`, truncated to the block size.
    Salt,
    /// `Hash(saltValue || blockKey)`, truncated to the block size. Used by some producers.
    Derived,
}

fn key_len_bytes(bits: usize) -> Result<usize, CryptoError> {
    match bits {
        128 | 192 | 256 => Ok(bits / 8),
        _ => Err(CryptoError::InvalidKeyBits { bits }),
    }
}

impl AgileCipher {
    /// Cipher configured from the payload-related [`DecryptOptions`].
    pub fn from_options(options: &DecryptOptions) -> Self {
        Self {
            verify_integrity: options.verify_integrity,
            max_output_size: options.max_output_size,
        }
    }

    fn unwrap_package_key(
        params: &AgileParameters,
        password_hash: &[u8],
        iv_mode: PasswordIv,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let hash_alg = params.password_hash_algorithm;
        let key_encrypt_key_len = key_len_bytes(params.password_key_bits)?;
        let package_key_len =
            key_len_bytes(params.key_data_key_bits.unwrap_or(params.password_key_bits))?;

        let iv_for = |block_key: &[u8]| -> Result<Vec<u8>, CryptoError> {
            match iv_mode {
                PasswordIv::Salt => params
                    .password_salt
                    .get(..AES_BLOCK_SIZE)
                    .map(<[u8]>::to_vec)
                    .ok_or(CryptoError::InvalidIvLength(params.password_salt.len())),
                PasswordIv::Derived => {
                    derive_iv(&params.password_salt, block_key, AES_BLOCK_SIZE, hash_alg)
                }
            }
        };
        let decrypt_block = |block_key: &[u8; 8],
                             ciphertext: &[u8],
                             field: &'static str|
         -> Result<Zeroizing<Vec<u8>>, CryptoError> {
            let key = derive_key(password_hash, block_key, key_encrypt_key_len, hash_alg)?;
            aes_cbc_decrypt(&key, &iv_for(block_key)?, ciphertext, field)
        };

        let verifier_input = decrypt_block(
            &VERIFIER_HASH_INPUT_BLOCK,
            &params.encrypted_verifier_hash_input,
            "encryptedVerifierHashInput",
        )?;
        let verifier_value = decrypt_block(
            &VERIFIER_HASH_VALUE_BLOCK,
            &params.encrypted_verifier_hash_value,
            "encryptedVerifierHashValue",
        )?;

        let verifier_input = verifier_input
            .get(..AES_BLOCK_SIZE)
            .ok_or(CryptoError::VerifierMismatch)?;
        let computed = hash_alg.digest(verifier_input);
        // The decrypted value may carry AES padding past the digest.
        let expected = verifier_value
            .get(..computed.len())
            .ok_or(CryptoError::VerifierMismatch)?;
        if !ct_eq(&computed, expected) {
            return Err(CryptoError::VerifierMismatch);
        }

        let key_value = decrypt_block(
            &KEY_VALUE_BLOCK,
            &params.encrypted_key_value,
            "encryptedKeyValue",
        )?;
        let key = key_value
            .get(..package_key_len)
            .ok_or(CryptoError::InvalidParameter(
                "decrypted keyValue shorter than the package key",
            ))?;
        Ok(Zeroizing::new(key.to_vec()))
    }

    /// Decrypt the HMAC key and expected HMAC value from `<dataIntegrity>`.
    fn integrity_secrets(
        key: &[u8],
        params: &AgileParameters,
        integrity: &DataIntegrity,
    ) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), CryptoError> {
        let hash_alg = params.key_data_hash_algorithm;
        let digest_len = hash_alg.digest_len();

        let iv = derive_iv(
            &params.key_data_salt,
            &HMAC_KEY_BLOCK,
            params.key_data_block_size,
            hash_alg,
        )?;
        let hmac_key = aes_cbc_decrypt(key, &iv, &integrity.encrypted_hmac_key, "encryptedHmacKey")?;
        let hmac_key = hmac_key
            .get(..digest_len)
            .ok_or(CryptoError::InvalidParameter("decrypted HMAC key is too short"))?;

        let iv = derive_iv(
            &params.key_data_salt,
            &HMAC_VALUE_BLOCK,
            params.key_data_block_size,
            hash_alg,
        )?;
        let hmac_value =
            aes_cbc_decrypt(key, &iv, &integrity.encrypted_hmac_value, "encryptedHmacValue")?;
        let hmac_value = hmac_value
            .get(..digest_len)
            .ok_or(CryptoError::InvalidParameter("decrypted HMAC value is too short"))?;

        Ok((Zeroizing::new(hmac_key.to_vec()), hmac_value.to_vec()))
    }
}

impl AgileCrypto for AgileCipher {
    fn derive_key(
        &self,
        password: &str,
        params: &AgileParameters,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let password_hash = hash_password(
            password,
            &params.password_salt,
            params.spin_count,
            params.password_hash_algorithm,
        )?;

        match Self::unwrap_package_key(params, &password_hash, PasswordIv::Salt) {
            Err(CryptoError::VerifierMismatch) => {
                log::debug!("verifier mismatch with salt IV; retrying with derived IVs");
                Self::unwrap_package_key(params, &password_hash, PasswordIv::Derived)
            }
            other => other,
        }
    }

    fn decrypt(
        &self,
        key: &[u8],
        params: &AgileParameters,
        mut payload: Vec<u8>,
    ) -> Result<Vec<u8>, CryptoError> {
        let prefix = payload.get(..SIZE_PREFIX_LEN).ok_or_else(|| {
            CryptoError::Container(ContainerError::new(
                ContainerErrorKind::Truncated,
                format!(
                    "EncryptedPackage is {} bytes, shorter than its size prefix",
                    payload.len()
                ),
            ))
        })?;
        let mut size_bytes = [0u8; SIZE_PREFIX_LEN];
        size_bytes.copy_from_slice(prefix);
        let declared = u64::from_le_bytes(size_bytes);

        if let Some(max) = self.max_output_size {
            if declared > max {
                return Err(CryptoError::PayloadTooLarge {
                    size: declared,
                    max,
                });
            }
        }

        let available = payload.len() - SIZE_PREFIX_LEN;
        let declared_len = usize::try_from(declared)
            .ok()
            .filter(|len| *len <= available)
            .ok_or_else(|| {
                CryptoError::Container(ContainerError::new(
                    ContainerErrorKind::Truncated,
                    format!(
                        "EncryptedPackage declares {declared} bytes but holds {available} bytes of ciphertext"
                    ),
                ))
            })?;

        // Only the blocks covering the declared size are decrypted; trailing padding is ignored.
        let cipher_len = declared_len.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
        if cipher_len > available {
            return Err(CryptoError::CiphertextNotBlockAligned {
                field: "EncryptedPackage",
                len: available,
            });
        }

        let integrity = match (&params.data_integrity, self.verify_integrity) {
            (Some(integrity), true) => {
                let (hmac_key, expected) = Self::integrity_secrets(key, params, integrity)?;
                let over_stream = hmac(params.key_data_hash_algorithm, &hmac_key, &payload)?;
                Some((hmac_key, expected, over_stream))
            }
            (None, true) => {
                log::warn!("integrity verification requested but descriptor has no dataIntegrity");
                None
            }
            _ => None,
        };

        let ciphertext = &mut payload[SIZE_PREFIX_LEN..SIZE_PREFIX_LEN + cipher_len];
        for (idx, segment) in ciphertext.chunks_mut(SEGMENT_SIZE).enumerate() {
            let idx = u32::try_from(idx)
                .map_err(|_| CryptoError::InvalidParameter("too many EncryptedPackage segments"))?;
            let iv = segment_iv(
                &params.key_data_salt,
                idx,
                params.key_data_block_size,
                params.key_data_hash_algorithm,
            )?;
            aes_cbc_decrypt_in_place(key, &iv, segment, "EncryptedPackage")?;
        }

        payload.drain(..SIZE_PREFIX_LEN);
        payload.truncate(declared_len);

        if let Some((hmac_key, expected, over_stream)) = integrity {
            // Most producers MAC the whole stream; some MAC the plaintext instead.
            if !ct_eq(&over_stream, &expected) {
                let over_plaintext = hmac(params.key_data_hash_algorithm, &hmac_key, &payload)?;
                if !ct_eq(&over_plaintext, &expected) {
                    return Err(CryptoError::IntegrityMismatch);
                }
            }
        }

        Ok(payload)
    }
}
