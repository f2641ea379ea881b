//! Usage metering reported from inside the enclave.
//!
//! The operator only ever learns a request id and a character count, never
//! the text itself.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::frame::message::RequestId;

/// Receives trusted usage figures from the enclave controller.
#[async_trait]
pub trait BillingReporter: Send + Sync {
    /// Called once per completed request, after its final response chunk.
    async fn report(&self, request_id: RequestId, character_count: u64);
}

/// How much usage metadata leaves the enclave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BillingMode {
    /// Report the character count of every completed request.
    #[default]
    PerRequest,
    /// Report nothing; the account is billed a flat subscription.
    FlatSubscription,
}

/// Number of billable characters in a request's text.
pub fn billable_characters(text: &str) -> u64 {
    text.chars().count() as u64
}

/// One reported usage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecord {
    pub request_id: RequestId,
    pub character_count: u64,
}

/// Reporter that keeps every record in memory.
#[derive(Debug, Default)]
pub struct InMemoryBillingLedger {
    records: Mutex<Vec<UsageRecord>>,
}

impl InMemoryBillingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn total_characters(&self) -> u64 {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.character_count)
            .sum()
    }
}

#[async_trait]
impl BillingReporter for InMemoryBillingLedger {
    async fn report(&self, request_id: RequestId, character_count: u64) {
        tracing::debug!(%request_id, character_count, "usage reported");
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(UsageRecord {
                request_id,
                character_count,
            });
    }
}
