//! `EncryptionInfo` descriptor resolution.
//!
//! The stream starts with a little-endian `(major: u16, minor: u16)` version header. Agile
//! encryption (4.4) follows it with a 4-byte reserved field and a UTF-8 XML document describing
//! the key-data and key-encryptor parameters.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader as XmlReader;

use crate::crypto::{HashAlgorithm, AES_BLOCK_SIZE};
use crate::error::DescriptorError;

const PASSWORD_KEY_ENCRYPTOR_NS: &[u8] =
    b"http://schemas.microsoft.com/office/2006/keyEncryptor/password";

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// `EncryptionInfo` version header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionVersion {
    pub major: u16,
    pub minor: u16,
}

impl EncryptionVersion {
    pub const AGILE: EncryptionVersion = EncryptionVersion { major: 4, minor: 4 };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionScheme {
    Agile,
    Unsupported,
}

/// Optional `<dataIntegrity>` HMAC parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataIntegrity {
    pub encrypted_hmac_key: Vec<u8>,
    pub encrypted_hmac_value: Vec<u8>,
}

/// Agile parameters needed for password-based decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileParameters {
    // <keyData>
    pub key_data_salt: Vec<u8>,
    pub key_data_hash_algorithm: HashAlgorithm,
    pub key_data_block_size: usize,
    pub key_data_key_bits: Option<usize>,

    pub data_integrity: Option<DataIntegrity>,

    // Password key encryptor (<p:encryptedKey>).
    pub spin_count: u32,
    pub password_salt: Vec<u8>,
    pub password_hash_algorithm: HashAlgorithm,
    pub password_key_bits: usize,
    pub encrypted_key_value: Vec<u8>,
    pub encrypted_verifier_hash_input: Vec<u8>,
    pub encrypted_verifier_hash_value: Vec<u8>,
}

/// Read the version header, or `None` if fewer than 4 bytes are available.
pub fn read_version(bytes: &[u8]) -> Option<EncryptionVersion> {
    match bytes {
        [a, b, c, d, ..] => Some(EncryptionVersion {
            major: u16::from_le_bytes([*a, *b]),
            minor: u16::from_le_bytes([*c, *d]),
        }),
        _ => None,
    }
}

/// Classify a descriptor by its version header. Only the first 4 bytes are inspected.
pub fn resolve_scheme(bytes: &[u8]) -> EncryptionScheme {
    match read_version(bytes) {
        Some(EncryptionVersion::AGILE) => EncryptionScheme::Agile,
        _ => EncryptionScheme::Unsupported,
    }
}

/// Parse the Agile XML descriptor that follows the version header.
pub fn parse_agile_parameters(bytes: &[u8]) -> Result<AgileParameters, DescriptorError> {
    let xml = agile_xml_bytes(bytes)?;
    let xml = std::str::from_utf8(xml).map_err(|_| DescriptorError::XmlNotUtf8)?;

    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut ns_stack: Vec<NamespaceFrame> = Vec::new();
    let mut found = FoundElements::default();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| DescriptorError::Xml(err.to_string()))?;

        match event {
            XmlEvent::Start(e) => {
                push_namespace_frame(&mut ns_stack, &e)?;
                found.visit(&ns_stack, &e)?;
            }
            XmlEvent::Empty(e) => {
                push_namespace_frame(&mut ns_stack, &e)?;
                found.visit(&ns_stack, &e)?;
                ns_stack.pop();
            }
            XmlEvent::End(_) => {
                ns_stack.pop();
            }
            XmlEvent::Eof => break,
            _ => {}
        }

        buf.clear();
    }

    found.finish()
}

/// Slice out the XML document: skip the version header, the reserved field (when present), a
/// UTF-8 BOM and leading whitespace.
fn agile_xml_bytes(bytes: &[u8]) -> Result<&[u8], DescriptorError> {
    let mut rest = bytes
        .get(4..)
        .ok_or(DescriptorError::Truncated { len: bytes.len() })?;

    if !starts_xml(rest) {
        rest = rest
            .get(4..)
            .ok_or(DescriptorError::Truncated { len: bytes.len() })?;
    }

    let rest = rest.strip_prefix(UTF8_BOM).unwrap_or(rest);
    let start = rest
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(rest.len());
    Ok(&rest[start..])
}

fn starts_xml(bytes: &[u8]) -> bool {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<')
}

#[derive(Debug)]
struct NamespaceFrame {
    decls: Vec<(Vec<u8> /* prefix */, Vec<u8> /* uri */)>,
}

fn push_namespace_frame(
    stack: &mut Vec<NamespaceFrame>,
    elem: &BytesStart<'_>,
) -> Result<(), DescriptorError> {
    let mut frame = NamespaceFrame { decls: Vec::new() };

    for attr in elem.attributes().with_checks(false) {
        let attr = attr.map_err(|err| DescriptorError::Xml(err.to_string()))?;
        let key = attr.key.as_ref();
        if key == b"xmlns" {
            frame.decls.push((Vec::new(), attr.value.to_vec()));
        } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            frame.decls.push((prefix.to_vec(), attr.value.to_vec()));
        }
    }

    stack.push(frame);
    Ok(())
}

fn resolve_namespace_uri<'a>(stack: &'a [NamespaceFrame], prefix: &[u8]) -> Option<&'a [u8]> {
    stack
        .iter()
        .rev()
        .flat_map(|frame| frame.decls.iter())
        .find(|(p, _)| p.as_slice() == prefix)
        .map(|(_, uri)| uri.as_slice())
}

fn element_prefix(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|b| *b == b':')
        .map(|idx| &name[..idx])
        .unwrap_or(&[])
}

fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|b| *b == b':')
        .map(|idx| &name[idx + 1..])
        .unwrap_or(name)
}

struct KeyData {
    salt: Vec<u8>,
    hash_algorithm: HashAlgorithm,
    block_size: usize,
    key_bits: Option<usize>,
}

struct PasswordKeyEncryptor {
    spin_count: u32,
    salt: Vec<u8>,
    hash_algorithm: HashAlgorithm,
    key_bits: usize,
    encrypted_key_value: Vec<u8>,
    encrypted_verifier_hash_input: Vec<u8>,
    encrypted_verifier_hash_value: Vec<u8>,
}

#[derive(Default)]
struct FoundElements {
    key_data: Option<KeyData>,
    data_integrity: Option<DataIntegrity>,
    password: Option<PasswordKeyEncryptor>,
}

impl FoundElements {
    fn visit(&mut self, ns_stack: &[NamespaceFrame], e: &BytesStart<'_>) -> Result<(), DescriptorError> {
        match e.local_name().as_ref() {
            b"keyData" if self.key_data.is_none() => {
                self.key_data = Some(parse_key_data(e)?);
            }
            b"dataIntegrity" if self.data_integrity.is_none() => {
                self.data_integrity = Some(parse_data_integrity(e)?);
            }
            b"encryptedKey" if self.password.is_none() => {
                let name = e.name();
                let ns_uri = resolve_namespace_uri(ns_stack, element_prefix(name.as_ref()));
                // Certificate key encryptors share the local name; skip them.
                if ns_uri == Some(PASSWORD_KEY_ENCRYPTOR_NS) {
                    self.password = Some(parse_password_key_encryptor(e)?);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<AgileParameters, DescriptorError> {
        let key_data = self.key_data.ok_or(DescriptorError::MissingElement {
            element: "keyData",
        })?;
        let password = self.password.ok_or(DescriptorError::MissingElement {
            element: "encryptedKey",
        })?;

        Ok(AgileParameters {
            key_data_salt: key_data.salt,
            key_data_hash_algorithm: key_data.hash_algorithm,
            key_data_block_size: key_data.block_size,
            key_data_key_bits: key_data.key_bits,
            data_integrity: self.data_integrity,
            spin_count: password.spin_count,
            password_salt: password.salt,
            password_hash_algorithm: password.hash_algorithm,
            password_key_bits: password.key_bits,
            encrypted_key_value: password.encrypted_key_value,
            encrypted_verifier_hash_input: password.encrypted_verifier_hash_input,
            encrypted_verifier_hash_value: password.encrypted_verifier_hash_value,
        })
    }
}

/// Attribute values of one element, keyed by local name.
struct Attrs<'e> {
    element: &'static str,
    values: Vec<(Vec<u8>, std::borrow::Cow<'e, [u8]>)>,
}

impl<'e> Attrs<'e> {
    fn collect(element: &'static str, e: &'e BytesStart<'_>) -> Result<Self, DescriptorError> {
        let mut values = Vec::new();
        for attr in e.attributes().with_checks(false) {
            let attr = attr.map_err(|err| DescriptorError::Xml(err.to_string()))?;
            values.push((local_name(attr.key.as_ref()).to_vec(), attr.value));
        }
        Ok(Self { element, values })
    }

    fn get(&self, attr: &'static str) -> Option<&[u8]> {
        self.values
            .iter()
            .find(|(key, _)| key.as_slice() == attr.as_bytes())
            .map(|(_, value)| value.as_ref())
    }

    fn required(&self, attr: &'static str) -> Result<&[u8], DescriptorError> {
        self.get(attr).ok_or(DescriptorError::MissingAttribute {
            element: self.element,
            attr,
        })
    }

    fn str_value<'v>(&self, attr: &'static str, value: &'v [u8]) -> Result<&'v str, DescriptorError> {
        std::str::from_utf8(value).map_err(|_| DescriptorError::InvalidAttribute {
            element: self.element,
            attr,
            reason: "not valid UTF-8",
        })
    }

    fn base64(&self, attr: &'static str) -> Result<Vec<u8>, DescriptorError> {
        let value = self.required(attr)?;
        decode_b64_attr(value).ok_or(DescriptorError::InvalidAttribute {
            element: self.element,
            attr,
            reason: "invalid base64",
        })
    }

    fn salt(&self, attr: &'static str) -> Result<Vec<u8>, DescriptorError> {
        let salt = self.base64(attr)?;
        if salt.is_empty() {
            return Err(DescriptorError::InvalidAttribute {
                element: self.element,
                attr,
                reason: "must not be empty",
            });
        }
        Ok(salt)
    }

    /// A salt that doubles as an AES-CBC IV, so it must cover at least one block.
    fn iv_salt(&self, attr: &'static str) -> Result<Vec<u8>, DescriptorError> {
        let salt = self.base64(attr)?;
        if salt.len() < AES_BLOCK_SIZE {
            return Err(DescriptorError::InvalidAttribute {
                element: self.element,
                attr,
                reason: "shorter than the AES block size",
            });
        }
        Ok(salt)
    }

    /// A CBC-encrypted blob: non-empty and block aligned.
    fn ciphertext(&self, attr: &'static str) -> Result<Vec<u8>, DescriptorError> {
        let bytes = self.base64(attr)?;
        if bytes.is_empty() || bytes.len() % AES_BLOCK_SIZE != 0 {
            return Err(DescriptorError::InvalidAttribute {
                element: self.element,
                attr,
                reason: "not a whole number of AES blocks",
            });
        }
        Ok(bytes)
    }

    fn key_bits(&self) -> Result<Option<usize>, DescriptorError> {
        match self.decimal::<usize>("keyBits")? {
            None => Ok(None),
            Some(bits @ (128 | 192 | 256)) => Ok(Some(bits)),
            Some(_) => Err(DescriptorError::InvalidAttribute {
                element: self.element,
                attr: "keyBits",
                reason: "AES key size must be 128, 192 or 256 bits",
            }),
        }
    }

    fn decimal<T: std::str::FromStr>(&self, attr: &'static str) -> Result<Option<T>, DescriptorError> {
        let Some(value) = self.get(attr) else {
            return Ok(None);
        };
        let invalid = DescriptorError::InvalidAttribute {
            element: self.element,
            attr,
            reason: "invalid decimal number",
        };
        let s = std::str::from_utf8(value).map_err(|_| invalid.clone())?;
        s.trim().parse::<T>().map(Some).map_err(|_| invalid)
    }

    fn required_decimal<T: std::str::FromStr>(&self, attr: &'static str) -> Result<T, DescriptorError> {
        self.decimal(attr)?.ok_or(DescriptorError::MissingAttribute {
            element: self.element,
            attr,
        })
    }

    fn hash_algorithm(&self) -> Result<HashAlgorithm, DescriptorError> {
        let value = self.required("hashAlgorithm")?;
        let name = self.str_value("hashAlgorithm", value)?;
        HashAlgorithm::parse_offcrypto_name(name)
    }

    /// `cipherAlgorithm`/`cipherChaining` are optional but must name AES-CBC when present.
    fn check_cipher(&self) -> Result<(), DescriptorError> {
        for (attr, expected) in [
            ("cipherAlgorithm", "AES"),
            ("cipherChaining", "ChainingModeCBC"),
        ] {
            if let Some(value) = self.get(attr) {
                let value = String::from_utf8_lossy(value);
                if !value.trim().eq_ignore_ascii_case(expected) {
                    return Err(DescriptorError::UnsupportedCipher {
                        element: self.element,
                        attr,
                        value: value.into_owned(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn parse_key_data(e: &BytesStart<'_>) -> Result<KeyData, DescriptorError> {
    let attrs = Attrs::collect("keyData", e)?;
    attrs.check_cipher()?;

    let block_size = attrs.decimal::<usize>("blockSize")?.unwrap_or(AES_BLOCK_SIZE);
    if block_size != AES_BLOCK_SIZE {
        return Err(DescriptorError::InvalidAttribute {
            element: "keyData",
            attr: "blockSize",
            reason: "AES block size must be 16",
        });
    }

    Ok(KeyData {
        salt: attrs.salt("saltValue")?,
        hash_algorithm: attrs.hash_algorithm()?,
        block_size,
        key_bits: attrs.key_bits()?,
    })
}

fn parse_data_integrity(e: &BytesStart<'_>) -> Result<DataIntegrity, DescriptorError> {
    let attrs = Attrs::collect("dataIntegrity", e)?;
    Ok(DataIntegrity {
        encrypted_hmac_key: attrs.base64("encryptedHmacKey")?,
        encrypted_hmac_value: attrs.base64("encryptedHmacValue")?,
    })
}

fn parse_password_key_encryptor(e: &BytesStart<'_>) -> Result<PasswordKeyEncryptor, DescriptorError> {
    let attrs = Attrs::collect("encryptedKey", e)?;
    attrs.check_cipher()?;

    Ok(PasswordKeyEncryptor {
        spin_count: attrs.required_decimal("spinCount")?,
        salt: attrs.iv_salt("saltValue")?,
        hash_algorithm: attrs.hash_algorithm()?,
        key_bits: attrs.key_bits()?.ok_or(DescriptorError::MissingAttribute {
            element: "encryptedKey",
            attr: "keyBits",
        })?,
        encrypted_key_value: attrs.ciphertext("encryptedKeyValue")?,
        encrypted_verifier_hash_input: attrs.ciphertext("encryptedVerifierHashInput")?,
        encrypted_verifier_hash_value: attrs.ciphertext("encryptedVerifierHashValue")?,
    })
}

/// Decode a base64 attribute value.
///
/// Pretty-printed descriptors may wrap long values across lines, and some producers omit `=`
/// padding. Both are accepted.
fn decode_b64_attr(value: &[u8]) -> Option<Vec<u8>> {
    let is_ws = |b: &u8| matches!(b, b'\r' | b'\n' | b'\t' | b' ');

    let cleaned;
    let input = if value.iter().any(is_ws) {
        cleaned = value.iter().copied().filter(|b| !is_ws(b)).collect::<Vec<u8>>();
        cleaned.as_slice()
    } else {
        value
    };

    STANDARD
        .decode(input)
        .or_else(|_| STANDARD_NO_PAD.decode(input))
        .ok()
}
