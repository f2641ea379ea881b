#![cfg(feature = "mock")]
//! Tests for retry policy and connect_with_retry.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::DuplexStream;

use confidential_tts_transport::error::{AttestError, ErrorKind, SessionError};
use confidential_tts_transport::session::retry::{with_retry, RetryPolicy};
use confidential_tts_transport::{
    ClientSession, EnclaveConfig, EnclaveSession, Error, InMemoryBillingLedger, MockPlatform,
    SessionConfig, ToneSynthesizer,
};

fn quick(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        backoff_multiplier: 1.0,
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[test]
fn retry_policy_default_values() {
    let p = RetryPolicy::default();
    assert_eq!(p.max_retries, 3);
    assert_eq!(p.initial_delay, Duration::from_secs(1));
    assert_eq!(p.max_delay, Duration::from_secs(30));
    assert!((p.backoff_multiplier - 2.0).abs() < f64::EPSILON);
}

#[test]
fn retry_policy_none_has_zero_retries() {
    assert_eq!(RetryPolicy::none().max_retries, 0);
}

#[test]
fn delay_for_attempt_increases() {
    let p = RetryPolicy {
        max_retries: 5,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
        backoff_multiplier: 2.0,
    };

    // Jitter keeps each delay within [0.5, 1.0] of the exponential base.
    let d0 = p.delay_for_attempt(0);
    assert!(d0 >= Duration::from_millis(50));
    assert!(d0 <= Duration::from_millis(100));

    let d2 = p.delay_for_attempt(2);
    assert!(d2 >= Duration::from_millis(200));
    assert!(d2 <= Duration::from_millis(400));
}

#[test]
fn delay_capped_at_max() {
    let p = RetryPolicy {
        max_retries: 10,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_millis(500),
        backoff_multiplier: 10.0,
    };
    let d = p.delay_for_attempt(5);
    assert!(d <= Duration::from_millis(500));
    assert!(d >= Duration::from_millis(250));
}

// ---------------------------------------------------------------------------
// with_retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_succeeds_after_transient_failures() {
    let counter = AtomicU32::new(0);
    let result = with_retry(&quick(3), || async {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            Err(Error::from(io::Error::from(io::ErrorKind::ConnectionRefused)))
        } else {
            Ok("connected")
        }
    })
    .await;

    assert_eq!(result.unwrap(), "connected");
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_exhausted_returns_last_error() {
    let counter = AtomicU32::new(0);
    let result: Result<(), Error> = with_retry(&quick(2), || async {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(SessionError::ChunkTimeout.into())
    })
    .await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::ChunkTimeout);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let permanent: [fn() -> Error; 3] = [
        || AttestError::InvalidSignature.into(),
        || AttestError::ExpiredOrMismatchedNonce.into(),
        || SessionError::InvalidConfig("bad").into(),
    ];
    for make in permanent {
        let counter = AtomicU32::new(0);
        let result: Result<(), Error> = with_retry(&quick(4), || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(make())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

// ---------------------------------------------------------------------------
// connect_with_retry
// ---------------------------------------------------------------------------

fn spawn_enclave(platform: &MockPlatform, transport: DuplexStream) {
    let platform = platform.clone();
    tokio::spawn(async move {
        let enclave = EnclaveSession::accept(transport, &platform, EnclaveConfig::default()).await?;
        enclave
            .serve(&ToneSynthesizer::new(), &InMemoryBillingLedger::new())
            .await
    });
}

#[tokio::test]
async fn connect_with_retry_recovers_from_refused_dial() {
    let platform = MockPlatform::new([0x21; 32]);
    let log = platform.approved_log();
    let verifier = platform.verifier();
    let config = SessionConfig::builder()
        .retry_policy(quick(2))
        .build()
        .unwrap();

    let attempts = AtomicU32::new(0);
    let mut session = ClientSession::connect_with_retry(
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let dialled = if attempt == 0 {
                None
            } else {
                let (a, b) = tokio::io::duplex(64 * 1024);
                spawn_enclave(&platform, b);
                Some(a)
            };
            async move {
                dialled.ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
            }
        },
        &verifier,
        &log,
        config,
    )
    .await
    .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let audio = session.synthesize("af_bella", 1.0, "retry").await.unwrap();
    assert!(!audio.is_empty());
    session.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connect_with_retry_recovers_from_silent_peer() {
    let platform = MockPlatform::new([0x22; 32]);
    let log = platform.approved_log();
    let verifier = platform.verifier();
    let config = SessionConfig::builder()
        .handshake_timeout(Duration::from_secs(2))
        .retry_policy(quick(1))
        .build()
        .unwrap();

    // The first peer accepts the connection but never answers.
    let mut silent = Vec::new();
    let attempts = AtomicU32::new(0);
    let session = ClientSession::connect_with_retry(
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let (a, b) = tokio::io::duplex(64 * 1024);
            if attempt == 0 {
                silent.push(b);
            } else {
                spawn_enclave(&platform, b);
            }
            async move { Ok::<_, io::Error>(a) }
        },
        &verifier,
        &log,
        config,
    )
    .await
    .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(session.is_open());
}

#[tokio::test]
async fn connect_without_policy_fails_once() {
    let platform = MockPlatform::new([0x23; 32]);
    let log = platform.approved_log();
    let verifier = platform.verifier();

    let attempts = AtomicU32::new(0);
    let result = ClientSession::<DuplexStream>::connect_with_retry(
        || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(io::Error::from(io::ErrorKind::ConnectionRefused)) }
        },
        &verifier,
        &log,
        SessionConfig::default(),
    )
    .await;

    assert_eq!(result.err().unwrap().kind(), ErrorKind::Transport);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
