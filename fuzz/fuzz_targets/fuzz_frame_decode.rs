#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

use confidential_tts_transport::frame::codec::FrameCodec;
use confidential_tts_transport::frame::message::{
    AttestationResponse, CancelNotice, ClientChallenge, ErrorNotice, InferenceRequest,
    InferenceResponse, KeyExchange,
};
use confidential_tts_transport::frame::FrameType;

fuzz_target!(|data: &[u8]| {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(data);

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(frame)) => {
                let payload = &frame.payload[..];
                match frame.header.msg_type {
                    FrameType::Hello => {
                        let _ = ClientChallenge::decode(payload);
                        let _ = AttestationResponse::decode(payload);
                        let _ = KeyExchange::decode(payload);
                    }
                    FrameType::Request => {
                        let _ = InferenceRequest::decode(payload);
                    }
                    FrameType::Response => {
                        let _ = InferenceResponse::decode(payload);
                    }
                    FrameType::Cancel => {
                        let _ = CancelNotice::decode(payload);
                    }
                    FrameType::Error => {
                        let _ = ErrorNotice::decode(payload);
                    }
                    FrameType::Heartbeat | FrameType::Shutdown => {}
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
});
