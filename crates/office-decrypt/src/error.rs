//! Error types.
//!
//! Each layer has its own error enum (`ContainerError`, `DescriptorError`, `CryptoError`). The
//! orchestrator folds them into [`DecryptError`], whose [`ErrorKind`] is the closed set callers
//! branch on. Classification only ever matches on variants and kinds, never on message text.

use thiserror::Error;

/// Boxed error returned verbatim from a password provider.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Structural classification of a container failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerErrorKind {
    /// The input does not start with the compound-file signature.
    BadSignature,
    /// Header, directory or allocation tables are malformed.
    InvalidStructure,
    /// The container (or one of its streams) ends early.
    Truncated,
    /// A required stream is absent.
    MissingStream,
    /// Any other I/O failure reported by the driver.
    Io,
}

impl ContainerErrorKind {
    /// Whether this failure describes the byte layout of the container itself.
    pub fn is_structural(self) -> bool {
        !matches!(self, ContainerErrorKind::Io)
    }
}

/// Failure reported by a [`ContainerDriver`](crate::ContainerDriver).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ContainerError {
    kind: ContainerErrorKind,
    message: String,
}

impl ContainerError {
    pub fn new(kind: ContainerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ContainerErrorKind {
        self.kind
    }

    /// Classify an I/O error coming out of the `cfb` crate.
    pub(crate) fn from_io(context: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;

        let kind = match err.kind() {
            IoKind::NotFound => ContainerErrorKind::MissingStream,
            IoKind::UnexpectedEof => ContainerErrorKind::Truncated,
            IoKind::InvalidData | IoKind::InvalidInput => ContainerErrorKind::InvalidStructure,
            _ => ContainerErrorKind::Io,
        };
        Self::new(kind, format!("{context}: {err}"))
    }
}

/// Errors produced while parsing an Agile `EncryptionInfo` descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("EncryptionInfo is truncated ({len} bytes)")]
    Truncated { len: usize },
    #[error("EncryptionInfo XML is not valid UTF-8")]
    XmlNotUtf8,
    #[error("failed to parse EncryptionInfo XML: {0}")]
    Xml(String),
    #[error("missing required element <{element}>")]
    MissingElement { element: &'static str },
    #[error("missing required attribute `{element}.{attr}`")]
    MissingAttribute {
        element: &'static str,
        attr: &'static str,
    },
    #[error("invalid attribute `{element}.{attr}`: {reason}")]
    InvalidAttribute {
        element: &'static str,
        attr: &'static str,
        reason: &'static str,
    },
    #[error("unsupported hash algorithm `{0}`")]
    UnsupportedHashAlgorithm(String),
    #[error("unsupported cipher `{element}.{attr}={value}`")]
    UnsupportedCipher {
        element: &'static str,
        attr: &'static str,
        value: String,
    },
}

/// Errors produced by an [`AgileCrypto`](crate::AgileCrypto) implementation.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The decrypted password verifier did not match: almost always a wrong password.
    #[error("password verifier mismatch")]
    VerifierMismatch,
    /// The `dataIntegrity` HMAC did not match the encrypted package.
    #[error("dataIntegrity HMAC mismatch")]
    IntegrityMismatch,
    #[error("invalid key size {bits} bits")]
    InvalidKeyBits { bits: usize },
    #[error("unsupported AES key length: {0} bytes (expected 16, 24, or 32)")]
    UnsupportedKeyLength(usize),
    #[error("invalid AES-CBC IV length: {0} bytes (expected 16)")]
    InvalidIvLength(usize),
    #[error("`{field}` ciphertext length {len} is not a multiple of 16 bytes")]
    CiphertextNotBlockAligned { field: &'static str, len: usize },
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("decrypted package size {size} exceeds the limit of {max} bytes")]
    PayloadTooLarge { size: u64, max: u64 },
    /// The payload stream itself is damaged (e.g. shorter than its size prefix).
    #[error("encrypted payload: {0}")]
    Container(#[source] ContainerError),
}

/// Reasons an `EncryptionInfo` descriptor is rejected.
#[derive(Debug, Error)]
pub enum UnsupportedEncryption {
    #[error("EncryptionInfo version {major}.{minor} is not Agile encryption (4.4)")]
    Version { major: u16, minor: u16 },
    #[error("EncryptionInfo is too short to hold a version header ({len} bytes)")]
    MissingVersion { len: usize },
    #[error("malformed Agile descriptor: {0}")]
    Descriptor(#[source] DescriptorError),
    #[error("spinCount {spin_count} exceeds the limit of {max}")]
    SpinCountTooLarge { spin_count: u32, max: u32 },
}

/// Reasons a decryption result is rejected.
#[derive(Debug, Error)]
pub enum InvalidDecryptedFile {
    #[error("decrypted payload ({len} bytes) is not a ZIP archive")]
    NotAnArchive { len: usize },
    #[error(transparent)]
    Crypto(CryptoError),
}

/// The closed set of failure kinds surfaced by [`decrypt_office_file`](crate::decrypt_office_file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidContainer,
    UnsupportedEncryption,
    InvalidDecryptedFile,
    /// The password provider failed; its error is carried unchanged.
    PasswordProvider,
}

/// Terminal error of a decryption attempt.
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("invalid container: {0}")]
    InvalidContainer(#[source] ContainerError),
    #[error("unsupported encryption: {0}")]
    UnsupportedEncryption(#[source] UnsupportedEncryption),
    #[error("invalid decrypted file: {0}")]
    InvalidDecryptedFile(#[source] InvalidDecryptedFile),
    #[error(transparent)]
    PasswordProvider(BoxError),
}

impl DecryptError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecryptError::InvalidContainer(_) => ErrorKind::InvalidContainer,
            DecryptError::UnsupportedEncryption(_) => ErrorKind::UnsupportedEncryption,
            DecryptError::InvalidDecryptedFile(_) => ErrorKind::InvalidDecryptedFile,
            DecryptError::PasswordProvider(_) => ErrorKind::PasswordProvider,
        }
    }

    /// Translate a key-derivation/decryption failure.
    ///
    /// Structural container failures keep their kind; everything else means the attempt produced
    /// no usable plaintext.
    pub(crate) fn from_collaborator(err: CryptoError) -> Self {
        match err {
            CryptoError::Container(inner) if inner.kind().is_structural() => {
                DecryptError::InvalidContainer(inner)
            }
            other => DecryptError::InvalidDecryptedFile(InvalidDecryptedFile::Crypto(other)),
        }
    }
}

impl From<DescriptorError> for DecryptError {
    fn from(err: DescriptorError) -> Self {
        DecryptError::UnsupportedEncryption(UnsupportedEncryption::Descriptor(err))
    }
}
