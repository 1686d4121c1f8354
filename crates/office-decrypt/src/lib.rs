//! Decryption of password-protected Office documents.
//!
//! Encrypted `.docx`/`.xlsx`/`.pptx` files are OLE/CFB compound files holding two streams:
//! - `EncryptionInfo`: the encryption descriptor
//! - `EncryptedPackage`: the size-prefixed, AES-CBC encrypted OOXML package
//!
//! This crate supports MS-OFFCRYPTO "Agile Encryption" (descriptor version 4.4, Office 2010+)
//! with the password key encryptor. Other schemes are detected and rejected.
//!
//! ```no_run
//! # async fn run(bytes: &[u8]) -> Result<(), office_decrypt::DecryptError> {
//! use office_decrypt::{decrypt_office_file, FixedPassword};
//!
//! let zip = decrypt_office_file(bytes, FixedPassword::new("password")).await?;
//! assert!(office_decrypt::is_archive(&zip));
//! # Ok(())
//! # }
//! ```
//!
//! The container driver and the key-derivation/decryption step sit behind the
//! [`ContainerDriver`] and [`AgileCrypto`] traits; [`Decryptor::with_collaborators`] accepts
//! substitutes.

pub mod agile;
pub mod container;
pub mod crypto;
pub mod decryptor;
pub mod descriptor;
pub mod error;
pub mod password;
pub mod sniff;


pub use crate::agile::{AgileCipher, AgileCrypto};
pub use crate::container::{
    is_encrypted_office_file, CfbDriver, ContainerDriver, ENCRYPTED_PACKAGE_STREAM,
    ENCRYPTION_INFO_STREAM,
};
pub use crate::crypto::HashAlgorithm;
pub use crate::decryptor::{DecryptOptions, Decryptor, DEFAULT_MAX_SPIN_COUNT};
pub use crate::descriptor::{
    parse_agile_parameters, read_version, resolve_scheme, AgileParameters, DataIntegrity,
    EncryptionScheme, EncryptionVersion,
};
pub use crate::error::{
    BoxError, ContainerError, ContainerErrorKind, CryptoError, DecryptError, DescriptorError,
    ErrorKind, InvalidDecryptedFile, UnsupportedEncryption,
};
pub use crate::password::{FixedPassword, PasswordProvider};
pub use crate::sniff::{find_archive_trailer, is_archive, is_container, ArchiveTrailer};

/// Decrypt an Agile-encrypted Office file with the default options and collaborators.
///
/// Returns the plaintext OOXML package, which is guaranteed to end with a valid ZIP
/// End-Of-Central-Directory record. `provider` is asked for the password at most once.
///
/// Descriptors with a `spinCount` above [`DEFAULT_MAX_SPIN_COUNT`] are refused as
/// [`ErrorKind::UnsupportedEncryption`] even though MS-OFFCRYPTO permits up to 10,000,000; use
/// [`Decryptor::with_options`] to accept them.
pub async fn decrypt_office_file<P: PasswordProvider>(
    bytes: &[u8],
    provider: P,
) -> Result<Vec<u8>, DecryptError> {
    Decryptor::new().decrypt(bytes, provider).await
}
