//! TCP accept loop for the enclave side.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::attestation::AttestationProvider;
use crate::billing::BillingReporter;
use crate::error::Error;
use crate::session::enclave::EnclaveSession;
use crate::session::EnclaveConfig;
use crate::synthesis::SpeechSynthesizer;
use crate::transport::tcp;

/// Collaborators shared by every session the server accepts.
#[derive(Clone)]
pub struct EnclaveServices {
    pub provider: Arc<dyn AttestationProvider>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub billing: Arc<dyn BillingReporter>,
}

/// Accept client connections on `listener` until `shutdown` fires.
///
/// Each connection runs its own handshake and session on a separate task;
/// no cryptographic or sequencing state is shared between them. On shutdown
/// the live sessions are aborted and awaited, so their keys are gone when
/// this returns.
pub async fn run(
    listener: TcpListener,
    services: EnclaveServices,
    config: EnclaveConfig,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "enclave server listening");
    }

    let mut connections = JoinSet::new();
    let result = loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            accepted = tcp::accept(&listener) => match accepted {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            },
        };

        let services = services.clone();
        let config = config.clone();
        connections.spawn(async move {
            tracing::debug!(%peer_addr, "accepted connection");
            if let Err(e) = handle_connection(stream, &services, config).await {
                tracing::warn!(%peer_addr, kind = ?e.kind(), "session ended with error");
            }
        });
    };

    tracing::info!(live = connections.len(), "enclave server stopping");
    connections.shutdown().await;
    result
}

async fn handle_connection(
    stream: TcpStream,
    services: &EnclaveServices,
    config: EnclaveConfig,
) -> Result<(), Error> {
    let session = EnclaveSession::accept(stream, services.provider.as_ref(), config).await?;
    let summary = session
        .serve(services.synthesizer.as_ref(), services.billing.as_ref())
        .await?;
    tracing::debug!(
        completed = summary.completed,
        characters = summary.characters_billed,
        "connection closed"
    );
    Ok(())
}

/// Bind `addr` and run the server on it.
pub async fn bind_and_run(
    addr: SocketAddr,
    services: EnclaveServices,
    config: EnclaveConfig,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let listener = tcp::listen(addr).await?;
    run(listener, services, config, shutdown).await
}
