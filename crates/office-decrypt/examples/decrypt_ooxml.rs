//! Decrypt a password-protected OOXML file (`.docx` / `.xlsx` / `.pptx`).
//!
//! Encrypted OOXML files are **not ZIP files on disk** even if they keep their usual extension.
//! The real ZIP/OPC package is wrapped in an OLE/CFB container holding `EncryptionInfo` and
//! `EncryptedPackage` streams. This example unwraps it and writes the decrypted ZIP to a file or
//! stdout.
//!
//! ## Usage
//!
//! ```bash
//! # Decrypt to a file
//! cargo run -p office-decrypt --example decrypt_ooxml -- \
//!   --input book.xlsx --password 'correct horse battery staple' --output book.zip
//!
//! # Prompt for the password on stdin and write to stdout
//! cargo run -p office-decrypt --example decrypt_ooxml -- --input book.xlsx > book.zip
//!
//! # Verify the `dataIntegrity` HMAC as well
//! cargo run -p office-decrypt --example decrypt_ooxml -- \
//!   --input book.xlsx --password 'pw' --verify-integrity > book.zip
//! ```

use std::ffi::OsString;
use std::io::{BufRead, Write};
use std::path::PathBuf;

use office_decrypt::{DecryptError, DecryptOptions, Decryptor, ErrorKind, FixedPassword};

#[derive(Debug, thiserror::Error)]
#[error("failed to read password from stdin: {0}")]
struct PromptError(#[from] std::io::Error);

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(ParseOutcome::Help(msg)) => {
            print!("{msg}");
            return;
        }
        Err(ParseOutcome::Error(msg)) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let bytes = match std::fs::read(&args.input) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error: failed to read {}: {err}", args.input.display());
            std::process::exit(1);
        }
    };

    if !office_decrypt::is_encrypted_office_file(&bytes) {
        eprintln!(
            "warning: {} does not look like an encrypted Office file",
            args.input.display()
        );
    }

    let decryptor = Decryptor::with_options(DecryptOptions {
        verify_integrity: args.verify_integrity,
        ..DecryptOptions::default()
    });

    let result = match args.password {
        Some(password) => decryptor.decrypt(&bytes, FixedPassword::new(password)).await,
        None => decryptor.decrypt(&bytes, prompt_password).await,
    };

    let decrypted_zip = match result {
        Ok(zip) => zip,
        Err(err) => {
            report(&err);
            std::process::exit(1);
        }
    };

    let written = match &args.output {
        Some(path) => std::fs::write(path, &decrypted_zip),
        None => std::io::stdout().lock().write_all(&decrypted_zip),
    };
    if let Err(err) = written {
        eprintln!("error: failed to write output: {err}");
        std::process::exit(1);
    }
}

async fn prompt_password() -> Result<String, PromptError> {
    eprint!("password: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn report(err: &DecryptError) {
    let hint = match err.kind() {
        ErrorKind::InvalidContainer => "the file is not a valid encrypted Office container",
        ErrorKind::UnsupportedEncryption => "only Agile (Office 2010+) password encryption is supported",
        ErrorKind::InvalidDecryptedFile => "wrong password, or the file is damaged",
        ErrorKind::PasswordProvider => "no password was provided",
    };
    eprintln!("error: {err}\n  hint: {hint}");
}

struct Args {
    input: PathBuf,
    password: Option<String>,
    verify_integrity: bool,
    output: Option<PathBuf>,
}

enum ParseOutcome {
    Help(String),
    Error(String),
}

impl Args {
    fn parse() -> Result<Self, ParseOutcome> {
        let mut input: Option<PathBuf> = None;
        let mut password: Option<String> = None;
        let mut verify_integrity = false;
        let mut output: Option<PathBuf> = None;

        let mut argv = std::env::args_os();
        let exe = argv
            .next()
            .unwrap_or_else(|| OsString::from("decrypt_ooxml"));

        let missing_value = |flag: &str, exe: &OsString| {
            ParseOutcome::Error(format!(
                "error: {flag} requires a value\n\n{}",
                Self::help(exe)
            ))
        };

        while let Some(arg) = argv.next() {
            match arg.to_string_lossy().as_ref() {
                "-h" | "--help" => return Err(ParseOutcome::Help(Self::help(&exe))),
                "--input" => {
                    let v = argv.next().ok_or_else(|| missing_value("--input", &exe))?;
                    input = Some(PathBuf::from(v));
                }
                "--password" => {
                    let v = argv
                        .next()
                        .ok_or_else(|| missing_value("--password", &exe))?;
                    password = Some(v.to_string_lossy().into_owned());
                }
                "--verify-integrity" => verify_integrity = true,
                "--output" => {
                    let v = argv.next().ok_or_else(|| missing_value("--output", &exe))?;
                    output = Some(PathBuf::from(v));
                }
                other => {
                    return Err(ParseOutcome::Error(format!(
                        "error: unrecognized argument `{other}`\n\n{}",
                        Self::help(&exe)
                    )));
                }
            }
        }

        let input = input.ok_or_else(|| {
            ParseOutcome::Error(format!(
                "error: missing required --input\n\n{}",
                Self::help(&exe)
            ))
        })?;

        Ok(Self {
            input,
            password,
            verify_integrity,
            output,
        })
    }

    fn help(exe: &OsString) -> String {
        let exe = exe.to_string_lossy();
        format!(
            "Usage: {exe} --input <path> [--password <pw>] [--output <path>] [--verify-integrity]\n\
             \n\
             Decrypts an Agile-encrypted OOXML file and writes the ZIP package.\n\
             \n\
             Options:\n\
             \x20 --input <path>        encrypted OLE/CFB file\n\
             \x20 --password <pw>       password (prompted on stdin when omitted)\n\
             \x20 --output <path>       output file (default: stdout)\n\
             \x20 --verify-integrity    verify the dataIntegrity HMAC\n\
             \x20 -h, --help            print this help\n"
        )
    }
}
