pub mod attestation;
pub mod billing;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod ratchet;
#[cfg(feature = "tcp")]
pub mod server;
pub mod session;
pub mod stream;
pub mod synthesis;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use error::{Error, ErrorKind, Result};
pub use frame::message::RequestId;
pub use frame::{Flags, Frame, FrameType};
pub use ratchet::{GroupRatchet, Role, RotationPolicy};
pub use session::channel::{Message, SecureChannel};
pub use session::client::{AudioSink, ClientSession, InFlightRequest, ResponseSummary};
pub use session::enclave::{EnclaveSession, ServeSummary};
pub use session::{EnclaveConfig, SessionConfig};
pub use stream::StreamCodec;

pub use attestation::log::InMemoryTransparencyLog;
pub use attestation::{AttestationProvider, AttestationVerifier, TransparencyLog};
pub use billing::{BillingMode, BillingReporter, InMemoryBillingLedger};
pub use synthesis::{AudioFormat, SpeechSynthesizer};

#[cfg(feature = "mock")]
pub use attestation::mock::MockPlatform;
#[cfg(feature = "mock")]
pub use synthesis::ToneSynthesizer;
