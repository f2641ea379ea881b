#![no_main]

use libfuzzer_sys::fuzz_target;
use tokio::io::AsyncWriteExt;

use confidential_tts_transport::session::handshake;
use confidential_tts_transport::{EnclaveConfig, MockPlatform};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes stand in for the client's challenge and key exchange.
    // The enclave must reject them without panicking.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let owned_data = data.to_vec();

    rt.block_on(async {
        let platform = MockPlatform::new([0x5A; 32]);
        let (mut enclave, mut client) = tokio::io::duplex(64 * 1024);

        let write_handle = tokio::spawn(async move {
            let _ = client.write_all(&owned_data).await;
            let _ = client.shutdown().await;
        });

        let _ = handshake::respond(&mut enclave, &platform, &EnclaveConfig::default()).await;

        let _ = write_handle.await;
    });
});
