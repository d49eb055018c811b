use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::FetchAttempt;

/// Which stage of the pipeline produced a successful payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTier {
    /// Payload was already present in the sink
    Cache,
    Primary,
    AlternateServer,
    Sequential,
}

impl RecoveryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryTier::Cache => "cache",
            RecoveryTier::Primary => "primary",
            RecoveryTier::AlternateServer => "alternate_server",
            RecoveryTier::Sequential => "sequential",
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, RecoveryTier::AlternateServer | RecoveryTier::Sequential)
    }
}

/// Final state of one input URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// 1-based position in the submitted list
    pub index: usize,
    pub url: String,
    pub success: bool,
    pub payload_ref: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
    pub tier: Option<RecoveryTier>,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<FetchAttempt>,
}

impl BatchItemResult {
    pub fn pending(index: usize, url: impl Into<String>) -> Self {
        Self {
            index,
            url: url.into(),
            success: false,
            payload_ref: None,
            attempts: 0,
            error: None,
            tier: None,
            bytes: 0,
            history: Vec::new(),
        }
    }

    /// Slot for an item that was never dispatched
    pub fn cancelled(index: usize, url: impl Into<String>) -> Self {
        let mut item = Self::pending(index, url);
        item.error = Some("cancelled before dispatch".to_string());
        item
    }

    pub fn mark_success(&mut self, payload_ref: String, bytes: u64, tier: RecoveryTier) {
        self.success = true;
        self.payload_ref = Some(payload_ref);
        self.bytes = bytes;
        self.tier = Some(tier);
        self.error = None;
    }
}

/// Aggregate numbers for a finished batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub recovered_by_fallback: usize,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
    pub items_per_sec: f64,
    pub bytes_per_sec: Option<f64>,
}

/// Order-preserving result of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub items: Vec<BatchItemResult>,
    pub cancelled: bool,
    pub summary: BatchSummary,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn failed(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.items.iter().filter(|item| !item.success)
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    pub fn succeeded_count(&self) -> usize {
        self.items.iter().filter(|item| item.success).count()
    }

    /// Payload refs in input order, `None` where the item failed
    pub fn payload_refs(&self) -> Vec<Option<&str>> {
        self.items
            .iter()
            .map(|item| item.payload_ref.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_lifecycle() {
        let mut item = BatchItemResult::pending(3, "https://img.example/3.jpg");
        assert!(!item.success);
        item.error = Some("HTTP 503".to_string());

        item.mark_success("3.jpg".to_string(), 2048, RecoveryTier::AlternateServer);
        assert!(item.success);
        assert!(item.error.is_none());
        assert_eq!(item.payload_ref.as_deref(), Some("3.jpg"));
        assert!(item.tier.unwrap().is_fallback());
    }

    #[test]
    fn test_result_helpers() {
        let mut ok = BatchItemResult::pending(1, "a");
        ok.mark_success("a".to_string(), 1, RecoveryTier::Primary);
        let failed = BatchItemResult::cancelled(2, "b");

        let result = BatchResult {
            batch_id: Uuid::new_v4(),
            items: vec![ok, failed],
            cancelled: true,
            summary: BatchSummary::default(),
        };

        assert_eq!(result.len(), 2);
        assert_eq!(result.succeeded_count(), 1);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.payload_refs(), vec![Some("a"), None]);
    }

    #[test]
    fn test_tier_serialization() {
        let json = serde_json::to_string(&RecoveryTier::AlternateServer).unwrap();
        assert_eq!(json, "\"alternate_server\"");
        assert_eq!(RecoveryTier::Sequential.as_str(), "sequential");
    }
}
