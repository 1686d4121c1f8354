#![no_main]

use libfuzzer_sys::fuzz_target;
use office_decrypt::{DecryptOptions, Decryptor, FixedPassword};

const MAX_INPUT_BYTES: usize = 1024 * 1024;

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_INPUT_BYTES {
        return;
    }

    // Keep each iteration cheap: inputs with large spin counts are rejected before hashing.
    let decryptor = Decryptor::with_options(DecryptOptions {
        max_spin_count: 1_000,
        verify_integrity: true,
        max_output_size: Some(MAX_INPUT_BYTES as u64),
    });

    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };
    if let Ok(plaintext) = runtime.block_on(decryptor.decrypt(data, FixedPassword::new("password")))
    {
        assert!(office_decrypt::is_archive(&plaintext));
    }
});
