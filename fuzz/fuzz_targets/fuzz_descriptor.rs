#![no_main]

use libfuzzer_sys::fuzz_target;

/// Real descriptors are a few KiB; larger inputs only slow the XML reader down.
const MAX_INPUT_BYTES: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    let data = &data[..data.len().min(MAX_INPUT_BYTES)];

    let _ = office_decrypt::is_container(data);
    let _ = office_decrypt::find_archive_trailer(data);

    // Parse the input both as-is and behind an Agile version header so the XML path is always
    // reachable.
    let _ = office_decrypt::resolve_scheme(data);
    let _ = office_decrypt::parse_agile_parameters(data);

    let mut prefixed = Vec::with_capacity(data.len() + 8);
    prefixed.extend_from_slice(&[4, 0, 4, 0, 0x40, 0, 0, 0]);
    prefixed.extend_from_slice(data);
    if let Ok(params) = office_decrypt::parse_agile_parameters(&prefixed) {
        assert!(!params.password_salt.is_empty());
        assert!(!params.key_data_salt.is_empty());
    }
});
