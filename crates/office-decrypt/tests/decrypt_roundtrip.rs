#![cfg(not(target_arch = "wasm32"))]

use std::cell::Cell;
use std::io::{Cursor, Read, Write};
use std::rc::Rc;

use cfb::CompoundFile;
use ms_offcrypto_writer::Ecma376AgileWriter;
use rand::{rngs::StdRng, SeedableRng as _};
use zip::write::FileOptions;

use office_decrypt::{
    decrypt_office_file, is_archive, is_encrypted_office_file, CryptoError, DecryptError,
    DecryptOptions, Decryptor, ErrorKind, FixedPassword, InvalidDecryptedFile,
    UnsupportedEncryption,
};

const PASSWORD: &str = "correct horse battery staple";

fn build_tiny_zip() -> Vec<u8> {
    let cursor = Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(cursor);
    writer
        .start_file("hello.txt", FileOptions::<()>::default())
        .expect("start zip file");
    writer.write_all(b"hello").expect("write zip contents");
    writer.finish().expect("finish zip").into_inner()
}

fn encrypt_with_password_agile(plaintext: &[u8], password: &str) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let mut rng = StdRng::from_seed([0u8; 32]);
    let mut agile =
        Ecma376AgileWriter::create(&mut rng, password, &mut cursor).expect("create agile");
    agile
        .write_all(plaintext)
        .expect("write plaintext to agile writer");
    agile.finalize().expect("finalize agile writer");
    cursor.into_inner()
}

fn extract_stream_bytes(cfb_bytes: &[u8], stream_name: &str) -> Vec<u8> {
    let mut ole = CompoundFile::open(Cursor::new(cfb_bytes)).expect("open cfb");
    let mut stream = ole.open_stream(stream_name).expect("open stream");
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("read stream");
    buf
}

fn build_ole(encryption_info: &[u8], encrypted_package: &[u8]) -> Vec<u8> {
    let mut ole = CompoundFile::create(Cursor::new(Vec::new())).expect("create cfb");
    ole.create_stream("EncryptionInfo")
        .expect("create EncryptionInfo")
        .write_all(encryption_info)
        .expect("write EncryptionInfo");
    ole.create_stream("EncryptedPackage")
        .expect("create EncryptedPackage")
        .write_all(encrypted_package)
        .expect("write EncryptedPackage");
    ole.flush().expect("flush cfb");
    ole.into_inner().into_inner()
}

/// Provider that records how often it was asked.
fn counting(
    calls: &Rc<Cell<usize>>,
    password: &'static str,
) -> impl FnOnce() -> std::future::Ready<Result<String, std::io::Error>> {
    let calls = Rc::clone(calls);
    move || {
        calls.set(calls.get() + 1);
        std::future::ready(Ok(password.to_string()))
    }
}

#[tokio::test(flavor = "current_thread")]
async fn decrypt_agile_roundtrip_matches_plain_zip() {
    let plain_zip = build_tiny_zip();
    let encrypted = encrypt_with_password_agile(&plain_zip, PASSWORD);
    assert!(is_encrypted_office_file(&encrypted));
    assert!(!is_archive(&encrypted));

    let decrypted = decrypt_office_file(&encrypted, FixedPassword::new(PASSWORD))
        .await
        .expect("decrypt agile package");
    assert_eq!(decrypted, plain_zip);

    let mut archive = zip::ZipArchive::new(Cursor::new(decrypted)).expect("open zip");
    let mut contents = String::new();
    archive
        .by_name("hello.txt")
        .expect("hello.txt")
        .read_to_string(&mut contents)
        .expect("read zip entry");
    assert_eq!(contents, "hello");
}

#[tokio::test(flavor = "current_thread")]
async fn provider_is_called_exactly_once() {
    let encrypted = encrypt_with_password_agile(&build_tiny_zip(), PASSWORD);
    let calls = Rc::new(Cell::new(0));

    let decrypted = Decryptor::new()
        .decrypt(&encrypted, counting(&calls, PASSWORD))
        .await
        .expect("decrypt");
    assert!(is_archive(&decrypted));
    assert_eq!(calls.get(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn wrong_password_is_invalid_decrypted_file() {
    let encrypted = encrypt_with_password_agile(&build_tiny_zip(), PASSWORD);
    let calls = Rc::new(Cell::new(0));

    let err = Decryptor::new()
        .decrypt(&encrypted, counting(&calls, "wrong password"))
        .await
        .expect_err("wrong password must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidDecryptedFile);
    assert!(matches!(
        err,
        DecryptError::InvalidDecryptedFile(InvalidDecryptedFile::Crypto(
            CryptoError::VerifierMismatch
        ))
    ));
    assert_eq!(calls.get(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn integrity_check_rejects_tampered_payload() {
    let encrypted = encrypt_with_password_agile(&build_tiny_zip(), PASSWORD);
    let info = extract_stream_bytes(&encrypted, "EncryptionInfo");
    let mut package = extract_stream_bytes(&encrypted, "EncryptedPackage");

    // First ciphertext byte: garbles the local file header but leaves the EOCD intact.
    package[8] ^= 0x01;
    let tampered = build_ole(&info, &package);

    let lenient = Decryptor::new()
        .decrypt(&tampered, FixedPassword::new(PASSWORD))
        .await
        .expect("without integrity checks the trailer still validates");
    assert!(is_archive(&lenient));

    let strict = Decryptor::with_options(DecryptOptions {
        verify_integrity: true,
        ..DecryptOptions::default()
    });
    let err = strict
        .decrypt(&tampered, FixedPassword::new(PASSWORD))
        .await
        .expect_err("integrity mismatch");
    assert!(matches!(
        err,
        DecryptError::InvalidDecryptedFile(InvalidDecryptedFile::Crypto(
            CryptoError::IntegrityMismatch
        ))
    ));

    // The untouched file passes the same check.
    let decrypted = strict
        .decrypt(&encrypted, FixedPassword::new(PASSWORD))
        .await
        .expect("verified decrypt");
    assert!(is_archive(&decrypted));
}

#[tokio::test(flavor = "current_thread")]
async fn non_archive_plaintext_is_rejected() {
    let encrypted = encrypt_with_password_agile(b"this is not a zip archive at all", PASSWORD);

    let err = decrypt_office_file(&encrypted, FixedPassword::new(PASSWORD))
        .await
        .expect_err("plaintext is not a ZIP");
    assert!(matches!(
        err,
        DecryptError::InvalidDecryptedFile(InvalidDecryptedFile::NotAnArchive { .. })
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn spin_count_above_limit_is_rejected_before_prompting() {
    let encrypted = encrypt_with_password_agile(&build_tiny_zip(), PASSWORD);
    let calls = Rc::new(Cell::new(0));

    let decryptor = Decryptor::with_options(DecryptOptions {
        max_spin_count: 10,
        ..DecryptOptions::default()
    });
    let err = decryptor
        .decrypt(&encrypted, counting(&calls, PASSWORD))
        .await
        .expect_err("spin count limit");
    assert!(matches!(
        err,
        DecryptError::UnsupportedEncryption(UnsupportedEncryption::SpinCountTooLarge {
            max: 10,
            ..
        })
    ));
    assert_eq!(calls.get(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn output_size_limit_is_enforced() {
    let plain_zip = build_tiny_zip();
    let encrypted = encrypt_with_password_agile(&plain_zip, PASSWORD);

    let decryptor = Decryptor::with_options(DecryptOptions {
        max_output_size: Some(plain_zip.len() as u64 - 1),
        ..DecryptOptions::default()
    });
    let err = decryptor
        .decrypt(&encrypted, FixedPassword::new(PASSWORD))
        .await
        .expect_err("output limit");
    assert!(matches!(
        err,
        DecryptError::InvalidDecryptedFile(InvalidDecryptedFile::Crypto(
            CryptoError::PayloadTooLarge { .. }
        ))
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn integrity_covers_trailing_ciphertext() {
    let encrypted = encrypt_with_password_agile(&build_tiny_zip(), PASSWORD);
    let info = extract_stream_bytes(&encrypted, "EncryptionInfo");
    let mut package = extract_stream_bytes(&encrypted, "EncryptedPackage");
    package.extend_from_slice(&[0xA5; 16]);
    let padded = build_ole(&info, &package);

    // Blocks past the declared size are never decrypted.
    let plain = decrypt_office_file(&padded, FixedPassword::new(PASSWORD))
        .await
        .expect("trailing block is ignored");
    assert_eq!(plain, build_tiny_zip());

    let err = Decryptor::with_options(DecryptOptions {
        verify_integrity: true,
        ..DecryptOptions::default()
    })
    .decrypt(&padded, FixedPassword::new(PASSWORD))
    .await
    .expect_err("HMAC covers the whole stream");
    assert_eq!(err.kind(), ErrorKind::InvalidDecryptedFile);
}
