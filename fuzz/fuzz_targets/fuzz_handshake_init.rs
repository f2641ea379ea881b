#![no_main]

use libfuzzer_sys::fuzz_target;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use confidential_tts_transport::session::handshake;
use confidential_tts_transport::{MockPlatform, SessionConfig};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes stand in for the enclave's attestation reply. The
    // client must reject them without panicking.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let owned_data = data.to_vec();

    rt.block_on(async {
        let platform = MockPlatform::new([0x5A; 32]);
        let log = platform.approved_log();
        let verifier = platform.verifier();
        let (mut client, mut enclave) = tokio::io::duplex(64 * 1024);

        let write_handle = tokio::spawn(async move {
            let mut discard = vec![0u8; 4096];
            let _ = enclave.read(&mut discard).await;
            let _ = enclave.write_all(&owned_data).await;
            let _ = enclave.shutdown().await;
        });

        let _ = handshake::initiate(&mut client, &verifier, &log, &SessionConfig::default()).await;

        let _ = write_handle.await;
    });
});
