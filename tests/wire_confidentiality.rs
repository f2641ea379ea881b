#![cfg(feature = "mock")]
//! What an observer between client and enclave actually sees.
//!
//! A relay copies bytes in both directions and records them, then the
//! captured streams are decoded frame by frame.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};

use confidential_tts_transport::frame::codec::FrameCodec;
use confidential_tts_transport::frame::{Frame, FrameType};
use confidential_tts_transport::{
    ClientSession, EnclaveConfig, EnclaveSession, ErrorKind, InMemoryBillingLedger, MockPlatform,
    SessionConfig, ToneSynthesizer,
};

const SECRET_TEXT: &str = "The vault code is swordfish";

type Capture = Arc<Mutex<Vec<u8>>>;

fn pump(
    mut from: ReadHalf<DuplexStream>,
    mut to: WriteHalf<DuplexStream>,
    capture: Capture,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let n = match from.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            capture.lock().unwrap().extend_from_slice(&buf[..n]);
            if to.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = to.shutdown().await;
    })
}

fn frames(capture: &Capture) -> Vec<Frame> {
    let mut buf = BytesMut::from(&capture.lock().unwrap()[..]);
    let mut codec = FrameCodec::new();
    let mut out = Vec::new();
    while let Some(frame) = codec.decode(&mut buf).unwrap() {
        out.push(frame);
    }
    assert!(buf.is_empty(), "capture ended mid-frame");
    out
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Within each epoch, sequences run 0, 1, 2, ... and epochs never go back.
fn assert_sequences(frames: &[Frame]) {
    let mut epoch = 0;
    let mut next = 0;
    for frame in frames {
        let header = &frame.header;
        assert!(header.epoch >= epoch, "epoch went backwards");
        if header.epoch != epoch {
            epoch = header.epoch;
            next = 0;
        }
        assert_eq!(header.sequence, next, "gap in epoch {epoch}");
        next += 1;
    }
}

/// Runs one request plus a heartbeat through a recording relay and returns
/// the (client to enclave, enclave to client) captures.
async fn observed_session() -> (Capture, Capture) {
    let platform = MockPlatform::new([0x77; 32]);
    let log = platform.approved_log();
    let verifier = platform.verifier();

    let (client_end, relay_client) = tokio::io::duplex(64 * 1024);
    let (relay_enclave, enclave_end) = tokio::io::duplex(64 * 1024);
    let upstream = Capture::default();
    let downstream = Capture::default();
    let (client_read, client_write) = tokio::io::split(relay_client);
    let (enclave_read, enclave_write) = tokio::io::split(relay_enclave);
    let up = pump(client_read, enclave_write, upstream.clone());
    let down = pump(enclave_read, client_write, downstream.clone());

    let server = tokio::spawn(async move {
        let enclave = EnclaveSession::accept(enclave_end, &platform, EnclaveConfig::default())
            .await
            .unwrap();
        enclave
            .serve(&ToneSynthesizer::new(), &InMemoryBillingLedger::new())
            .await
            .unwrap()
    });

    let mut client = ClientSession::connect(client_end, &verifier, &log, SessionConfig::default())
        .await
        .unwrap();
    let mut request = client.begin_request("af_bella", 1.0).unwrap();
    request.send_text(&SECRET_TEXT[..10], false).await.unwrap();
    request.send_text(&SECRET_TEXT[10..], true).await.unwrap();
    request.receive_audio(&mut Vec::new()).await.unwrap();
    drop(request);
    client.heartbeat().await.unwrap();
    client.close().await.unwrap();

    assert_eq!(server.await.unwrap().completed, 1);
    up.await.unwrap();
    down.await.unwrap();
    (upstream, downstream)
}

#[tokio::test]
async fn request_text_never_crosses_the_wire_in_clear() {
    let (upstream, _) = observed_session().await;
    let raw = upstream.lock().unwrap().clone();
    assert!(!contains(&raw, b"swordfish"));
    assert!(!contains(&raw, b"af_bella"));
}

#[tokio::test]
async fn audio_never_crosses_the_wire_in_clear() {
    let (_, downstream) = observed_session().await;
    let raw = downstream.lock().unwrap().clone();
    assert!(!contains(&raw, b"RIFF"));
    assert!(!contains(&raw, b"WAVE"));
}

#[tokio::test]
async fn every_post_handshake_frame_is_sealed() {
    let (upstream, downstream) = observed_session().await;

    let up = frames(&upstream);
    let hellos = up
        .iter()
        .take_while(|f| f.header.msg_type == FrameType::Hello)
        .count();
    assert_eq!(hellos, 2);
    for frame in &up[hellos..] {
        assert!(frame.header.flags.is_encrypted(), "{:?}", frame.header);
    }

    // Control frames carry an empty plaintext: only the AEAD tag is on the wire.
    let control: Vec<_> = up[hellos..]
        .iter()
        .filter(|f| matches!(f.header.msg_type, FrameType::Heartbeat | FrameType::Shutdown))
        .collect();
    assert_eq!(control.len(), 2);
    for frame in control {
        assert_eq!(frame.payload.len(), 16);
    }

    let down = frames(&downstream);
    assert_eq!(down[0].header.msg_type, FrameType::Hello);
    for frame in &down[1..] {
        assert!(frame.header.flags.is_encrypted());
        assert_eq!(frame.header.msg_type, FrameType::Response);
    }
    assert!(down.last().unwrap().header.flags.is_final());
}

#[tokio::test]
async fn sequences_are_gapless_per_epoch() {
    let (upstream, downstream) = observed_session().await;

    let up = frames(&upstream);
    let sealed: Vec<_> = up.into_iter().filter(|f| f.header.flags.is_encrypted()).collect();
    assert_sequences(&sealed);
    // Two request chunks in epoch 0, then heartbeat and shutdown in epoch 1.
    let epochs: Vec<_> = sealed.iter().map(|f| f.header.epoch).collect();
    assert_eq!(epochs, vec![0, 0, 1, 1]);

    let down = frames(&downstream);
    let sealed: Vec<_> = down.into_iter().filter(|f| f.header.flags.is_encrypted()).collect();
    assert_sequences(&sealed);
}

#[tokio::test]
async fn misnumbered_hello_rejected_by_enclave() {
    let platform = MockPlatform::new([0x78; 32]);
    let (mut raw, enclave_end) = tokio::io::duplex(16 * 1024);
    let config = EnclaveConfig::builder()
        .handshake_timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let server =
        tokio::spawn(async move { EnclaveSession::accept(enclave_end, &platform, config).await });

    let challenge =
        confidential_tts_transport::frame::message::ClientChallenge { nonce: [0xAA; 32] }.encode();
    let mut buf = BytesMut::new();
    FrameCodec::new()
        .encode(Frame::hello(99, challenge), &mut buf)
        .unwrap();
    raw.write_all(&buf).await.unwrap();

    let err = server.await.unwrap().err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Handshake);
}
