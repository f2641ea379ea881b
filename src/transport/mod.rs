/// TCP transport helpers (connect, accept, attested client sessions).
#[cfg(feature = "tcp")]
pub mod tcp;
