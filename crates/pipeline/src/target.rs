//! Target records and the "already enriched" evidence check.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use enrichq_core::TargetId;

use crate::outcome::PipelineError;

/// The slice of a target record the controller needs to decide whether
/// enrichment already happened out-of-band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: TargetId,
    /// Set by the pipeline when it finishes a target.
    pub enriched_at: Option<DateTime<Utc>>,
    /// Content fields the pipeline populates.
    pub fields: BTreeMap<String, JsonValue>,
}

impl TargetRecord {
    pub fn new(id: TargetId) -> Self {
        Self {
            id,
            enriched_at: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_enriched_at(mut self, at: DateTime<Utc>) -> Self {
        self.enriched_at = Some(at);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Timestamp marker *and* at least one populated content field.
    ///
    /// A partially-failed earlier run can leave the timestamp set with no
    /// content, so the timestamp alone is not evidence.
    pub fn has_enrichment_evidence(&self) -> bool {
        self.enriched_at.is_some() && self.fields.values().any(is_populated)
    }
}

fn is_populated(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::String(s) => !s.trim().is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
        JsonValue::Bool(_) | JsonValue::Number(_) => true,
    }
}

/// Read access to target records.
#[async_trait::async_trait]
pub trait TargetLookup: Send + Sync + 'static {
    /// Load the records for `ids`. Missing ids are simply absent from the result.
    async fn load_targets(&self, ids: &[TargetId]) -> Result<Vec<TargetRecord>, PipelineError>;
}

/// In-memory target records for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTargets {
    records: RwLock<HashMap<TargetId, TargetRecord>>,
}

impl InMemoryTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: TargetRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(record.id, record);
    }

    pub fn get(&self, id: TargetId) -> Option<TargetRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(&id).cloned()
    }
}

#[async_trait::async_trait]
impl TargetLookup for InMemoryTargets {
    async fn load_targets(&self, ids: &[TargetId]) -> Result<Vec<TargetRecord>, PipelineError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }
}
