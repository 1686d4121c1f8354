//! The decryption pipeline.
//!
//! An attempt walks a fixed sequence of stages and stops at the first failure:
//!
//! ```text
//! Start -> ContainerValidated -> DescriptorRead -> SchemeResolved -> ParametersParsed
//!       -> PasswordAcquired -> KeyDerived -> PayloadDecrypted -> ResultValidated
//! ```
//!
//! The password provider is the only suspension point. Everything before it runs without asking
//! for a password, so broken or unsupported files are rejected before the user is prompted.

use std::fmt;

use zeroize::Zeroizing;

use crate::agile::{AgileCipher, AgileCrypto};
use crate::container::{CfbDriver, ContainerDriver, ENCRYPTED_PACKAGE_STREAM, ENCRYPTION_INFO_STREAM};
use crate::descriptor::{parse_agile_parameters, read_version, resolve_scheme, EncryptionScheme};
use crate::error::{
    ContainerError, ContainerErrorKind, DecryptError, InvalidDecryptedFile, UnsupportedEncryption,
};
use crate::password::PasswordProvider;
use crate::sniff::{is_archive, is_container};

/// Default maximum `spinCount` accepted from a descriptor.
///
/// Excel writes 100000. The limit leaves headroom while refusing descriptors that ask for billions
/// of hash rounds. MS-OFFCRYPTO allows up to 10,000,000, so conforming files above this limit are
/// refused unless [`DecryptOptions::max_spin_count`] is raised.
pub const DEFAULT_MAX_SPIN_COUNT: u32 = 1_000_000;

/// Options controlling a decryption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptOptions {
    /// Maximum accepted `spinCount` for the password KDF.
    pub max_spin_count: u32,
    /// Verify the `dataIntegrity` HMAC when present.
    pub verify_integrity: bool,
    /// Maximum declared plaintext size, in bytes.
    pub max_output_size: Option<u64>,
}

impl Default for DecryptOptions {
    fn default() -> Self {
        Self {
            max_spin_count: DEFAULT_MAX_SPIN_COUNT,
            verify_integrity: false,
            max_output_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    ContainerValidated,
    DescriptorRead,
    SchemeResolved,
    ParametersParsed,
    PasswordAcquired,
    KeyDerived,
    PayloadDecrypted,
    ResultValidated,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Start => "start",
            Stage::ContainerValidated => "container validated",
            Stage::DescriptorRead => "descriptor read",
            Stage::SchemeResolved => "scheme resolved",
            Stage::ParametersParsed => "parameters parsed",
            Stage::PasswordAcquired => "password acquired",
            Stage::KeyDerived => "key derived",
            Stage::PayloadDecrypted => "payload decrypted",
            Stage::ResultValidated => "result validated",
        };
        f.write_str(name)
    }
}

/// Progress of one attempt. Never outlives the `decrypt` call.
struct Attempt {
    stage: Stage,
}

impl Attempt {
    fn new() -> Self {
        Self {
            stage: Stage::Start,
        }
    }

    fn advance(&mut self, next: Stage) {
        log::debug!("office decrypt: {} -> {}", self.stage, next);
        self.stage = next;
    }

    fn fail(self, err: DecryptError) -> DecryptError {
        log::debug!(
            "office decrypt: failed after {} ({:?}): {}",
            self.stage,
            err.kind(),
            err
        );
        err
    }
}

/// Configurable decryption pipeline.
///
/// `C` opens the container and `K` derives keys and decrypts; both default to the implementations
/// shipped with this crate.
#[derive(Debug, Clone)]
pub struct Decryptor<C = CfbDriver, K = AgileCipher> {
    container: C,
    crypto: K,
    options: DecryptOptions,
}

impl Decryptor {
    pub fn new() -> Self {
        Self::with_options(DecryptOptions::default())
    }

    pub fn with_options(options: DecryptOptions) -> Self {
        Self {
            container: CfbDriver,
            crypto: AgileCipher::from_options(&options),
            options,
        }
    }
}

impl Default for Decryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ContainerDriver, K: AgileCrypto> Decryptor<C, K> {
    /// Build a pipeline over substitute collaborators.
    ///
    /// `options.max_spin_count` is enforced by the pipeline; the other options are only honored
    /// to the extent `crypto` reads them.
    pub fn with_collaborators(container: C, crypto: K, options: DecryptOptions) -> Self {
        Self {
            container,
            crypto,
            options,
        }
    }

    pub fn options(&self) -> &DecryptOptions {
        &self.options
    }

    /// Decrypt an encrypted Office file and return the plaintext package (a ZIP archive).
    ///
    /// `provider` is asked for the password at most once, and only after the container and
    /// descriptor have been validated.
    pub async fn decrypt<P: PasswordProvider>(
        &self,
        bytes: &[u8],
        provider: P,
    ) -> Result<Vec<u8>, DecryptError> {
        let mut attempt = Attempt::new();
        match self.run(&mut attempt, bytes, provider).await {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => Err(attempt.fail(err)),
        }
    }

    async fn run<P: PasswordProvider>(
        &self,
        attempt: &mut Attempt,
        bytes: &[u8],
        provider: P,
    ) -> Result<Vec<u8>, DecryptError> {
        if !is_container(bytes) {
            return Err(DecryptError::InvalidContainer(ContainerError::new(
                ContainerErrorKind::BadSignature,
                "input is not an OLE/CFB compound file",
            )));
        }

        // The handle borrows `bytes` and is dropped before the provider is awaited.
        let (descriptor, payload) = {
            let mut handle = self
                .container
                .open(bytes)
                .map_err(DecryptError::InvalidContainer)?;
            attempt.advance(Stage::ContainerValidated);

            let descriptor = self
                .container
                .read_stream(&mut handle, ENCRYPTION_INFO_STREAM)
                .map_err(DecryptError::InvalidContainer)?;
            let payload = self
                .container
                .read_stream(&mut handle, ENCRYPTED_PACKAGE_STREAM)
                .map_err(DecryptError::InvalidContainer)?;
            (descriptor, payload)
        };
        attempt.advance(Stage::DescriptorRead);

        if resolve_scheme(&descriptor) != EncryptionScheme::Agile {
            let reason = match read_version(&descriptor) {
                Some(version) => UnsupportedEncryption::Version {
                    major: version.major,
                    minor: version.minor,
                },
                None => UnsupportedEncryption::MissingVersion {
                    len: descriptor.len(),
                },
            };
            return Err(DecryptError::UnsupportedEncryption(reason));
        }
        attempt.advance(Stage::SchemeResolved);

        let params = parse_agile_parameters(&descriptor)?;
        if params.spin_count > self.options.max_spin_count {
            return Err(DecryptError::UnsupportedEncryption(
                UnsupportedEncryption::SpinCountTooLarge {
                    spin_count: params.spin_count,
                    max: self.options.max_spin_count,
                },
            ));
        }
        attempt.advance(Stage::ParametersParsed);

        let password = Zeroizing::new(
            provider
                .password()
                .await
                .map_err(|err| DecryptError::PasswordProvider(Box::new(err)))?,
        );
        attempt.advance(Stage::PasswordAcquired);

        let key = self
            .crypto
            .derive_key(&password, &params)
            .map_err(DecryptError::from_collaborator)?;
        drop(password);
        attempt.advance(Stage::KeyDerived);

        let plaintext = self
            .crypto
            .decrypt(&key, &params, payload)
            .map_err(DecryptError::from_collaborator)?;
        attempt.advance(Stage::PayloadDecrypted);

        if !is_archive(&plaintext) {
            return Err(DecryptError::InvalidDecryptedFile(
                InvalidDecryptedFile::NotAnArchive {
                    len: plaintext.len(),
                },
            ));
        }
        attempt.advance(Stage::ResultValidated);

        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AgileParameters;
    use crate::error::{CryptoError, DescriptorError, ErrorKind};
    use crate::sniff::{CONTAINER_SIGNATURE, EOCD_SIGNATURE};
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::rc::Rc;

    const AGILE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption"
    xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
  <keyData blockSize="16" keyBits="128" hashAlgorithm="SHA1" saltValue="AAECAwQFBgcICQoLDA0ODw=="/>
  <keyEncryptors>
    <keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
      <p:encryptedKey spinCount="SPIN" keyBits="128" hashAlgorithm="SHA1"
          saltValue="AAECAwQFBgcICQoLDA0ODw=="
          encryptedVerifierHashInput="AAAAAAAAAAAAAAAAAAAAAA=="
          encryptedVerifierHashValue="AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
          encryptedKeyValue="AAAAAAAAAAAAAAAAAAAAAA=="/>
    </keyEncryptor>
  </keyEncryptors>
</encryption>"#;

    fn agile_descriptor(spin_count: u32) -> Vec<u8> {
        let mut bytes = vec![4, 0, 4, 0, 0x40, 0, 0, 0];
        bytes.extend_from_slice(AGILE_XML.replace("SPIN", &spin_count.to_string()).as_bytes());
        bytes
    }

    fn archive() -> Vec<u8> {
        let mut bytes = EOCD_SIGNATURE.to_vec();
        bytes.extend_from_slice(&[0u8; 18]);
        bytes
    }

    #[derive(Default)]
    struct MockContainer {
        open_error: Option<ContainerErrorKind>,
        streams: HashMap<&'static str, Vec<u8>>,
    }

    impl MockContainer {
        fn with_streams(descriptor: Vec<u8>) -> Self {
            let mut streams = HashMap::new();
            streams.insert(ENCRYPTION_INFO_STREAM, descriptor);
            streams.insert(ENCRYPTED_PACKAGE_STREAM, vec![0u8; 24]);
            Self {
                open_error: None,
                streams,
            }
        }
    }

    impl ContainerDriver for MockContainer {
        type Handle<'a> = ();

        fn open<'a>(&self, _bytes: &'a [u8]) -> Result<(), ContainerError> {
            match self.open_error {
                Some(kind) => Err(ContainerError::new(kind, "mock open failure")),
                None => Ok(()),
            }
        }

        fn read_stream(&self, _handle: &mut (), name: &str) -> Result<Vec<u8>, ContainerError> {
            self.streams.get(name).cloned().ok_or_else(|| {
                ContainerError::new(ContainerErrorKind::MissingStream, name.to_string())
            })
        }
    }

    enum Outcome {
        Plaintext(Vec<u8>),
        VerifierMismatch,
        Truncated,
    }

    struct MockCrypto {
        outcome: Outcome,
        seen_password: Rc<std::cell::RefCell<Option<String>>>,
    }

    impl MockCrypto {
        fn new(outcome: Outcome) -> Self {
            Self {
                outcome,
                seen_password: Rc::default(),
            }
        }
    }

    impl AgileCrypto for MockCrypto {
        fn derive_key(
            &self,
            password: &str,
            _params: &AgileParameters,
        ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
            *self.seen_password.borrow_mut() = Some(password.to_string());
            match self.outcome {
                Outcome::VerifierMismatch => Err(CryptoError::VerifierMismatch),
                _ => Ok(Zeroizing::new(vec![0u8; 16])),
            }
        }

        fn decrypt(
            &self,
            _key: &[u8],
            _params: &AgileParameters,
            _payload: Vec<u8>,
        ) -> Result<Vec<u8>, CryptoError> {
            match &self.outcome {
                Outcome::Plaintext(bytes) => Ok(bytes.clone()),
                Outcome::Truncated => Err(CryptoError::Container(ContainerError::new(
                    ContainerErrorKind::Truncated,
                    "short payload",
                ))),
                Outcome::VerifierMismatch => unreachable!("decrypt after failed key derivation"),
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("user cancelled")]
    struct Cancelled;

    fn counting_provider(
        calls: &Rc<Cell<usize>>,
        result: Result<&'static str, ()>,
    ) -> impl PasswordProvider<Error = Cancelled> {
        let calls = Rc::clone(calls);
        move || async move {
            calls.set(calls.get() + 1);
            result.map(str::to_string).map_err(|()| Cancelled)
        }
    }

    fn run<C: ContainerDriver, K: AgileCrypto>(
        decryptor: &Decryptor<C, K>,
        provider: impl PasswordProvider,
    ) -> Result<Vec<u8>, DecryptError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        rt.block_on(decryptor.decrypt(&CONTAINER_SIGNATURE, provider))
    }

    #[test]
    fn success_calls_provider_once_and_returns_plaintext() {
        let calls = Rc::new(Cell::new(0));
        let crypto = MockCrypto::new(Outcome::Plaintext(archive()));
        let seen = Rc::clone(&crypto.seen_password);
        let decryptor = Decryptor::with_collaborators(
            MockContainer::with_streams(agile_descriptor(100_000)),
            crypto,
            DecryptOptions::default(),
        );

        let out = run(&decryptor, counting_provider(&calls, Ok("pw"))).expect("decrypt");
        assert_eq!(out, archive());
        assert_eq!(calls.get(), 1);
        assert_eq!(seen.borrow().as_deref(), Some("pw"));
    }

    #[test]
    fn bad_signature_never_prompts() {
        let calls = Rc::new(Cell::new(0));
        let decryptor = Decryptor::with_collaborators(
            MockContainer::with_streams(agile_descriptor(1)),
            MockCrypto::new(Outcome::Plaintext(archive())),
            DecryptOptions::default(),
        );
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let err = rt
            .block_on(decryptor.decrypt(b"PK\x03\x04", counting_provider(&calls, Ok("pw"))))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidContainer);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn container_failures_never_prompt() {
        for kind in [
            ContainerErrorKind::InvalidStructure,
            ContainerErrorKind::Truncated,
            ContainerErrorKind::Io,
        ] {
            let calls = Rc::new(Cell::new(0));
            let container = MockContainer {
                open_error: Some(kind),
                ..MockContainer::default()
            };
            let decryptor = Decryptor::with_collaborators(
                container,
                MockCrypto::new(Outcome::Plaintext(archive())),
                DecryptOptions::default(),
            );
            let err = run(&decryptor, counting_provider(&calls, Ok("pw"))).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidContainer, "{kind:?}");
            assert_eq!(calls.get(), 0);
        }
    }

    #[test]
    fn missing_payload_stream_never_prompts() {
        let calls = Rc::new(Cell::new(0));
        let mut container = MockContainer::with_streams(agile_descriptor(1));
        container.streams.remove(ENCRYPTED_PACKAGE_STREAM);
        let decryptor = Decryptor::with_collaborators(
            container,
            MockCrypto::new(Outcome::Plaintext(archive())),
            DecryptOptions::default(),
        );
        let err = run(&decryptor, counting_provider(&calls, Ok("pw"))).unwrap_err();
        match err {
            DecryptError::InvalidContainer(inner) => {
                assert_eq!(inner.kind(), ContainerErrorKind::MissingStream)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn unsupported_versions_never_prompt() {
        let cases: [(Vec<u8>, fn(&UnsupportedEncryption) -> bool); 3] = [
            (vec![3, 0, 2, 0, 0x24, 0, 0, 0], |e| {
                matches!(e, UnsupportedEncryption::Version { major: 3, minor: 2 })
            }),
            (vec![4, 0, 2, 0], |e| {
                matches!(e, UnsupportedEncryption::Version { major: 4, minor: 2 })
            }),
            (vec![4, 0], |e| {
                matches!(e, UnsupportedEncryption::MissingVersion { len: 2 })
            }),
        ];
        for (descriptor, check) in cases {
            let calls = Rc::new(Cell::new(0));
            let decryptor = Decryptor::with_collaborators(
                MockContainer::with_streams(descriptor),
                MockCrypto::new(Outcome::Plaintext(archive())),
                DecryptOptions::default(),
            );
            let err = run(&decryptor, counting_provider(&calls, Ok("pw"))).unwrap_err();
            match &err {
                DecryptError::UnsupportedEncryption(reason) => assert!(check(reason), "{reason:?}"),
                other => panic!("unexpected error: {other:?}"),
            }
            assert_eq!(calls.get(), 0);
        }
    }

    #[test]
    fn malformed_descriptor_and_excessive_spin_count_never_prompt() {
        let mut malformed = vec![4, 0, 4, 0, 0x40, 0, 0, 0];
        malformed.extend_from_slice(b"<encryption><keyData");

        for descriptor in [malformed, agile_descriptor(DEFAULT_MAX_SPIN_COUNT + 1)] {
            let calls = Rc::new(Cell::new(0));
            let decryptor = Decryptor::with_collaborators(
                MockContainer::with_streams(descriptor),
                MockCrypto::new(Outcome::Plaintext(archive())),
                DecryptOptions::default(),
            );
            let err = run(&decryptor, counting_provider(&calls, Ok("pw"))).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnsupportedEncryption);
            assert_eq!(calls.get(), 0);
        }
    }

    #[test]
    fn non_aes_key_sizes_and_misshapen_blobs_never_prompt() {
        fn replace_last(xml: &str, from: &str, to: &str) -> String {
            let idx = xml.rfind(from).expect("fixture attribute");
            format!("{}{}{}", &xml[..idx], to, &xml[idx + from.len()..])
        }

        let cases = [
            ("keyBits", AGILE_XML.replacen(r#"keyBits="128""#, r#"keyBits="512""#, 1)),
            ("keyBits", replace_last(AGILE_XML, r#"keyBits="128""#, r#"keyBits="100""#)),
            (
                "saltValue",
                replace_last(
                    AGILE_XML,
                    r#"saltValue="AAECAwQFBgcICQoLDA0ODw==""#,
                    r#"saltValue="AAECAw==""#,
                ),
            ),
            (
                "encryptedKeyValue",
                AGILE_XML.replace(
                    r#"encryptedKeyValue="AAAAAAAAAAAAAAAAAAAAAA==""#,
                    r#"encryptedKeyValue="AAAAAAAAAAAAAAAAAAAAAAAAAAA=""#,
                ),
            ),
            (
                "encryptedVerifierHashInput",
                AGILE_XML.replace(
                    r#"encryptedVerifierHashInput="AAAAAAAAAAAAAAAAAAAAAA==""#,
                    r#"encryptedVerifierHashInput="""#,
                ),
            ),
            (
                "encryptedVerifierHashValue",
                AGILE_XML.replace(
                    r#"encryptedVerifierHashValue="AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=""#,
                    r#"encryptedVerifierHashValue="AAAAAAAAAAAAAAAAAAAAAAAAAAA=""#,
                ),
            ),
        ];

        for (expected_attr, xml) in cases {
            assert_ne!(xml, AGILE_XML, "{expected_attr}: fixture not patched");
            let mut descriptor = vec![4, 0, 4, 0, 0x40, 0, 0, 0];
            descriptor.extend_from_slice(xml.replace("SPIN", "1").as_bytes());

            let calls = Rc::new(Cell::new(0));
            let decryptor = Decryptor::with_collaborators(
                MockContainer::with_streams(descriptor),
                AgileCipher::default(),
                DecryptOptions::default(),
            );
            let err = run(&decryptor, counting_provider(&calls, Ok("pw"))).unwrap_err();
            match &err {
                DecryptError::UnsupportedEncryption(UnsupportedEncryption::Descriptor(
                    DescriptorError::InvalidAttribute { attr, .. },
                )) => assert_eq!(*attr, expected_attr),
                other => panic!("{expected_attr}: unexpected error: {other:?}"),
            }
            assert_eq!(calls.get(), 0, "{expected_attr}");
        }
    }

    #[test]
    fn provider_error_is_passed_through_unchanged() {
        let calls = Rc::new(Cell::new(0));
        let decryptor = Decryptor::with_collaborators(
            MockContainer::with_streams(agile_descriptor(1)),
            MockCrypto::new(Outcome::Plaintext(archive())),
            DecryptOptions::default(),
        );
        let err = run(&decryptor, counting_provider(&calls, Err(()))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PasswordProvider);
        assert_eq!(calls.get(), 1);
        match err {
            DecryptError::PasswordProvider(inner) => assert!(inner.downcast_ref::<Cancelled>().is_some()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn collaborator_errors_are_classified() {
        let cases = [
            (Outcome::VerifierMismatch, ErrorKind::InvalidDecryptedFile),
            (Outcome::Truncated, ErrorKind::InvalidContainer),
            (Outcome::Plaintext(b"not a zip".to_vec()), ErrorKind::InvalidDecryptedFile),
        ];
        for (outcome, expected) in cases {
            let calls = Rc::new(Cell::new(0));
            let decryptor = Decryptor::with_collaborators(
                MockContainer::with_streams(agile_descriptor(1)),
                MockCrypto::new(outcome),
                DecryptOptions::default(),
            );
            let err = run(&decryptor, counting_provider(&calls, Ok("pw"))).unwrap_err();
            assert_eq!(err.kind(), expected);
            assert_eq!(calls.get(), 1);
        }
    }

    #[test]
    fn default_options() {
        let options = DecryptOptions::default();
        assert_eq!(options.max_spin_count, 1_000_000);
        assert!(!options.verify_integrity);
        assert_eq!(options.max_output_size, None);
        assert_eq!(Decryptor::new().options(), &options);
    }
}
