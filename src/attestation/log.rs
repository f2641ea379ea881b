use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{MeasurementDigest, MeasurementRecord};
use super::TransparencyLog;
use crate::error::AttestError;

/// Serialized form of a log snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    records: Vec<MeasurementRecord>,
}

/// Append-only in-memory transparency log.
///
/// Records are never edited; a revocation is a newer record for the same
/// digest. [`history`](TransparencyLog::history) returns every record for a
/// digest in append order.
#[derive(Debug, Default)]
pub struct InMemoryTransparencyLog {
    records: RwLock<Vec<MeasurementRecord>>,
}

impl InMemoryTransparencyLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot of the form `{"records": [...]}`.
    pub fn from_json(json: &str) -> Result<Self, AttestError> {
        let snapshot: Snapshot = serde_json::from_str(json)
            .map_err(|_| AttestError::Malformed("transparency log snapshot"))?;
        Ok(Self {
            records: RwLock::new(snapshot.records),
        })
    }

    /// Serialize the full log as a snapshot.
    pub fn to_json(&self) -> String {
        let snapshot = Snapshot {
            records: self.entries(),
        };
        // Records contain only strings, byte arrays, and enums.
        serde_json::to_string_pretty(&snapshot).unwrap_or_default()
    }

    pub fn append(&self, record: MeasurementRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(version = %record.version, status = ?record.status, "log record appended");
        records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Vec<MeasurementRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl TransparencyLog for InMemoryTransparencyLog {
    async fn history(&self, measurement: &MeasurementDigest) -> Vec<MeasurementRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| &r.measurement == measurement)
            .cloned()
            .collect()
    }
}
