#![no_main]

use libfuzzer_sys::fuzz_target;

use confidential_tts_transport::ratchet::Role;
use confidential_tts_transport::stream::StreamCodec;

fuzz_target!(|data: &[u8]| {
    // Length-prefixed chunks (u8 length) fed to a small reassembly buffer.
    let mut codec = StreamCodec::new(Role::Responder, 4096);
    let mut rest = data;
    while let Some((&len, tail)) = rest.split_first() {
        let len = (len as usize).min(tail.len());
        let (chunk, tail) = tail.split_at(len);
        rest = tail;
        match codec.decode_request(chunk) {
            Ok(Some(_)) => {
                let _ = codec.finish();
            }
            Ok(None) => {}
            Err(_) => {
                codec.abandon();
            }
        }
    }
});
