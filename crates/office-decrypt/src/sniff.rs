//! Byte-level format detection.
//!
//! Both predicates are pure and never fail: malformed or short input simply yields `false`.

/// Signature at offset 0 of every OLE/CFB compound file.
pub const CONTAINER_SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// ZIP End-Of-Central-Directory signature.
pub const EOCD_SIGNATURE: [u8; 4] = *b"PK\x05\x06";

/// Size of the fixed EOCD record (signature, 4x u16, 2x u32, comment length).
pub const EOCD_FIXED_SIZE: usize = 22;

/// Largest comment an EOCD record can declare.
const MAX_COMMENT_LEN: usize = 0xFFFF;

/// Offset of the comment-length field inside the fixed record.
const COMMENT_LEN_OFFSET: usize = 20;

/// Returns true if `bytes` starts with the compound-file signature.
pub fn is_container(bytes: &[u8]) -> bool {
    bytes.get(..CONTAINER_SIGNATURE.len()) == Some(&CONTAINER_SIGNATURE[..])
}

/// Location of a validated ZIP End-Of-Central-Directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveTrailer<'a> {
    /// Offset of the `PK\x05\x06` signature.
    pub record_offset: usize,
    /// Offset of the first comment byte (directly after the fixed record).
    pub comment_offset: usize,
    /// The declared comment.
    pub comment: &'a [u8],
}

/// Returns true if `bytes` ends with a valid ZIP End-Of-Central-Directory record.
pub fn is_archive(bytes: &[u8]) -> bool {
    find_archive_trailer(bytes).is_some()
}

/// Locate the End-Of-Central-Directory record of a ZIP archive.
///
/// The record may be followed by up to 65535 bytes of comment, so the signature is searched for
/// in the last `65536 + 22` bytes only. Comment data can itself contain the signature bytes; the
/// rightmost candidate whose declared comment fits in the remaining input wins.
pub fn find_archive_trailer(bytes: &[u8]) -> Option<ArchiveTrailer<'_>> {
    let last_record = bytes.len().checked_sub(EOCD_FIXED_SIZE)?;

    // Common case: no trailing comment.
    if let Some(trailer) = trailer_at(bytes, last_record) {
        if trailer.comment.is_empty() {
            return Some(trailer);
        }
    }

    let window_start = bytes
        .len()
        .saturating_sub(MAX_COMMENT_LEN + 1 + EOCD_FIXED_SIZE);
    (window_start..=last_record)
        .rev()
        .find_map(|offset| trailer_at(bytes, offset))
}

fn trailer_at(bytes: &[u8], offset: usize) -> Option<ArchiveTrailer<'_>> {
    let record = bytes.get(offset..offset.checked_add(EOCD_FIXED_SIZE)?)?;
    if record[..EOCD_SIGNATURE.len()] != EOCD_SIGNATURE {
        return None;
    }

    let comment_len = usize::from(u16::from_le_bytes([
        record[COMMENT_LEN_OFFSET],
        record[COMMENT_LEN_OFFSET + 1],
    ]));
    let comment_offset = offset + EOCD_FIXED_SIZE;
    let comment = bytes.get(comment_offset..comment_offset.checked_add(comment_len)?)?;

    Some(ArchiveTrailer {
        record_offset: offset,
        comment_offset,
        comment,
    })
}
