#![no_main]

use libfuzzer_sys::fuzz_target;

use confidential_tts_transport::crypto::seal::OpeningContext;
use confidential_tts_transport::crypto::SymmetricKey;

/// Sequence, header bytes and ciphertext carved out of the fuzz input.
struct AeadInput<'a> {
    ciphertext: &'a [u8],
    sequence: u32,
    msg_type: u8,
    flags: u8,
}

fn parse_input(data: &[u8]) -> Option<AeadInput<'_>> {
    if data.len() < 6 {
        return None;
    }
    Some(AeadInput {
        sequence: u32::from_be_bytes(data[0..4].try_into().ok()?),
        msg_type: data[4],
        flags: data[5],
        ciphertext: &data[6..],
    })
}

fuzz_target!(|data: &[u8]| {
    let Some(input) = parse_input(data) else {
        return;
    };

    let key = SymmetricKey::from([0x42; 32]);
    let mut opener = OpeningContext::new(&key, [0xAA; 32], 0);

    // Exact, replayed, and skipped sequence paths must all fail cleanly.
    let _ = opener.open(input.ciphertext, 0, input.msg_type, input.flags);
    let _ = opener.open(input.ciphertext, input.sequence, input.msg_type, input.flags);
    if let Some(next) = input.sequence.checked_add(1) {
        let _ = opener.open(input.ciphertext, next, input.msg_type, input.flags);
    }
});
