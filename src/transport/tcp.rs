use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::attestation::{AttestationVerifier, TransparencyLog};
use crate::error::Error;
use crate::session::client::ClientSession;
use crate::session::SessionConfig;

/// Bind a TCP listener.
pub async fn listen(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP endpoint with Nagle disabled.
pub async fn connect(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Accept a single connection from a listener.
pub async fn accept(listener: &TcpListener) -> std::io::Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept().await?;
    stream.set_nodelay(true)?;
    Ok((stream, addr))
}

/// Open an attested session to the enclave at `addr`.
///
/// Each attempt dials a fresh connection; transient failures are retried per
/// `config.retry_policy`.
pub async fn connect_session(
    addr: SocketAddr,
    verifier: &AttestationVerifier,
    log: &dyn TransparencyLog,
    config: SessionConfig,
) -> Result<ClientSession<TcpStream>, Error> {
    ClientSession::connect_with_retry(|| connect(addr), verifier, log, config).await
}
