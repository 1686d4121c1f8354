//! Access to the streams of an OLE/CFB compound file.

use std::io::{Cursor, Read};

use crate::error::{ContainerError, ContainerErrorKind};
use crate::sniff::is_container;

/// Stream holding the encryption descriptor.
pub const ENCRYPTION_INFO_STREAM: &str = "EncryptionInfo";
/// Stream holding the size-prefixed ciphertext.
pub const ENCRYPTED_PACKAGE_STREAM: &str = "EncryptedPackage";

/// Opens a container and reads named streams out of it.
///
/// Implementations classify their failures into [`ContainerErrorKind`] so the orchestrator never
/// has to look at messages.
pub trait ContainerDriver {
    type Handle<'a>;

    fn open<'a>(&self, bytes: &'a [u8]) -> Result<Self::Handle<'a>, ContainerError>;

    /// Read a whole stream.
    fn read_stream(
        &self,
        handle: &mut Self::Handle<'_>,
        name: &str,
    ) -> Result<Vec<u8>, ContainerError>;
}

/// [`ContainerDriver`] backed by the `cfb` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CfbDriver;

impl ContainerDriver for CfbDriver {
    type Handle<'a> = cfb::CompoundFile<Cursor<&'a [u8]>>;

    fn open<'a>(&self, bytes: &'a [u8]) -> Result<Self::Handle<'a>, ContainerError> {
        if !is_container(bytes) {
            return Err(ContainerError::new(
                ContainerErrorKind::BadSignature,
                "missing OLE/CFB signature",
            ));
        }
        cfb::CompoundFile::open(Cursor::new(bytes))
            .map_err(|err| ContainerError::from_io("failed to open OLE container", err))
    }

    fn read_stream(
        &self,
        handle: &mut Self::Handle<'_>,
        name: &str,
    ) -> Result<Vec<u8>, ContainerError> {
        if !handle.is_stream(name) {
            return Err(ContainerError::new(
                ContainerErrorKind::MissingStream,
                format!("missing `{name}` stream"),
            ));
        }

        let mut stream = handle
            .open_stream(name)
            .map_err(|err| ContainerError::from_io(&format!("failed to open `{name}`"), err))?;
        let mut out = Vec::new();
        stream
            .read_to_end(&mut out)
            .map_err(|err| ContainerError::from_io(&format!("failed to read `{name}`"), err))?;
        Ok(out)
    }
}

/// Returns true if `bytes` is a compound file holding both encryption streams.
pub fn is_encrypted_office_file(bytes: &[u8]) -> bool {
    let Ok(ole) = CfbDriver.open(bytes) else {
        return false;
    };
    ole.is_stream(ENCRYPTION_INFO_STREAM) && ole.is_stream(ENCRYPTED_PACKAGE_STREAM)
}
