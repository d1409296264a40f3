//! Usage ledger.
//!
//! Every settled exchange leaves one entry: what was asked, how it ended,
//! and what the host billed. Callers pay per token, so this is where
//! per-session spend is read back.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::correlator::Outcome;
use crate::error::ErrorCategory;
use crate::types::{BillingMetrics, ExchangeKind};

/// Which binding carried the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Encrypted,
    Http,
}

/// An entry in the ledger.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub request_id: String,
    pub kind: ExchangeKind,
    pub channel: Channel,
    /// `None` on success, the failure category otherwise
    pub failure: Option<ErrorCategory>,
    pub billing: Option<BillingMetrics>,
    pub requested_at: DateTime<Utc>,
    pub settled_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl LedgerEntry {
    pub fn new(
        request_id: impl Into<String>,
        kind: ExchangeKind,
        channel: Channel,
        requested_at: DateTime<Utc>,
        outcome: &Outcome,
    ) -> Self {
        let settled_at = Utc::now();
        let (failure, billing) = match outcome {
            Ok(result) => (None, result.billing.clone()),
            Err(err) => (Some(err.category()), None),
        };

        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            kind,
            channel,
            failure,
            billing,
            requested_at,
            settled_at,
            duration_ms: (settled_at - requested_at).num_milliseconds().max(0) as u64,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Bounded settlement log, newest first.
#[derive(Clone)]
pub struct UsageLedger {
    entries: Arc<RwLock<VecDeque<LedgerEntry>>>,
    max_entries: usize,
}

impl UsageLedger {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            max_entries,
        }
    }

    pub async fn record(&self, entry: LedgerEntry) {
        let mut entries = self.entries.write().await;
        entries.push_front(entry);

        while entries.len() > self.max_entries {
            entries.pop_back();
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<LedgerEntry> {
        let entries = self.entries.read().await;
        entries.iter().take(limit).cloned().collect()
    }

    pub async fn get_by_request(&self, request_id: &str) -> Option<LedgerEntry> {
        let entries = self.entries.read().await;
        entries.iter().find(|e| e.request_id == request_id).cloned()
    }

    pub async fn get_by_kind(&self, kind: ExchangeKind, limit: usize) -> Vec<LedgerEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.kind == kind)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Totals over the retained entries.
    pub async fn summary(&self) -> LedgerSummary {
        let entries = self.entries.read().await;

        let exchanges = entries.len();
        let failed = entries.iter().filter(|e| !e.succeeded()).count();
        let billed = entries.iter().filter_map(|e| e.billing.as_ref());

        let (tokens_used, generation_units) = billed.fold((0u64, 0f64), |(tokens, units), b| {
            (tokens + b.tokens_used, units + b.generation_units.unwrap_or(0.0))
        });

        let avg_duration_ms = if exchanges > 0 {
            entries.iter().map(|e| e.duration_ms).sum::<u64>() / exchanges as u64
        } else {
            0
        };

        LedgerSummary {
            exchanges,
            succeeded: exchanges - failed,
            failed,
            tokens_used,
            generation_units,
            avg_duration_ms,
        }
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new(crate::config::LedgerConfig::default().max_entries)
    }
}

/// Aggregates from the ledger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSummary {
    pub exchanges: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Tokens billed across successful exchanges
    pub tokens_used: u64,
    /// Generation units billed across successful exchanges
    pub generation_units: f64,
    pub avg_duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::types::{GenerationResult, ResultContent};

    fn success(tokens: u64) -> Outcome {
        Ok(GenerationResult {
            request_id: "r".into(),
            kind: ExchangeKind::ChatStream,
            content: ResultContent::Text { text: "ok".into() },
            safety: None,
            billing: Some(BillingMetrics {
                tokens_used: tokens,
                ..Default::default()
            }),
            provider: None,
        })
    }

    #[tokio::test]
    async fn test_ledger_summary() {
        let ledger = UsageLedger::new(100);
        let now = Utc::now();

        ledger
            .record(LedgerEntry::new("r1", ExchangeKind::ChatStream, Channel::Encrypted, now, &success(10)))
            .await;
        ledger
            .record(LedgerEntry::new("r2", ExchangeKind::ChatStream, Channel::Http, now, &success(32)))
            .await;
        ledger
            .record(LedgerEntry::new(
                "r3",
                ExchangeKind::ImageGeneration,
                Channel::Encrypted,
                now,
                &Err(ProtocolError::Cancelled),
            ))
            .await;

        let summary = ledger.summary().await;
        assert_eq!(summary.exchanges, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.tokens_used, 42);

        let failed = ledger.get_by_request("r3").await.unwrap();
        assert_eq!(failed.failure, Some(ErrorCategory::Cancelled));
        assert_eq!(ledger.get_by_kind(ExchangeKind::ChatStream, 10).await.len(), 2);
    }

    #[tokio::test]
    async fn test_ledger_bounded_newest_first() {
        let ledger = UsageLedger::new(2);
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            ledger
                .record(LedgerEntry::new(id, ExchangeKind::VectorSearch, Channel::Encrypted, now, &success(1)))
                .await;
        }

        assert_eq!(ledger.count().await, 2);
        let recent = ledger.recent(10).await;
        assert_eq!(recent[0].request_id, "c");
        assert_eq!(recent[1].request_id, "b");

        ledger.clear().await;
        assert_eq!(ledger.summary().await, LedgerSummary::default());
    }
}
