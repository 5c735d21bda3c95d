//! Usage meter (component C9)
//!
//! Append-only, bounded-retention usage events per identity. Writes are
//! best-effort: a metering failure is logged and dropped, never surfaced
//! as an HTTP error — a caller's compute succeeded regardless of whether
//! the service managed to bill for it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub key_id: String,
    pub endpoint: String,
    pub cost: u64,
    pub params_summary: String,
    pub at: DateTime<Utc>,
}

pub struct UsageMeter {
    events: DashMap<String, Vec<UsageEvent>>,
    retention: chrono::Duration,
}

impl UsageMeter {
    pub fn new(retention_days: u32) -> Self {
        Self {
            events: DashMap::new(),
            retention: chrono::Duration::days(retention_days as i64),
        }
    }

    /// Record a usage event. Never returns an error to the caller —
    /// metering problems are an operational concern, not a request
    /// failure. An empty `key_id` is not a malformed event: it is how a
    /// session-authenticated browser request (billed against nothing, per
    /// the identity model) reaches this function, so it is skipped
    /// silently rather than logged as a problem.
    pub fn record(&self, event: UsageEvent) {
        if event.key_id.is_empty() {
            tracing::debug!("skipping usage event for session-authenticated caller");
            return;
        }
        self.events.entry(event.key_id.clone()).or_default().push(event);
    }

    /// Return all live (within retention) events for one identity, oldest
    /// first.
    pub fn events_for(&self, key_id: &str) -> Vec<UsageEvent> {
        let cutoff = Utc::now() - self.retention;
        self.events
            .get(key_id)
            .map(|events| events.iter().filter(|e| e.at >= cutoff).cloned().collect())
            .unwrap_or_default()
    }

    /// Drop events older than the retention window across every identity.
    /// Called periodically from a background task, never inline with a
    /// request.
    pub fn sweep_expired(&self) {
        let cutoff = Utc::now() - self.retention;
        for mut entry in self.events.iter_mut() {
            entry.value_mut().retain(|e| e.at >= cutoff);
        }
    }

    pub fn total_cost(&self, key_id: &str) -> u64 {
        self.events_for(key_id).iter().map(|e| e.cost).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key_id: &str, cost: u64) -> UsageEvent {
        UsageEvent {
            key_id: key_id.to_string(),
            endpoint: "/api/v1/compute/standard".to_string(),
            cost,
            params_summary: "SNR x 10".to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn recorded_events_are_retrievable() {
        let meter = UsageMeter::new(90);
        meter.record(event("key-1", 5));
        meter.record(event("key-1", 3));
        let events = meter.events_for("key-1");
        assert_eq!(events.len(), 2);
        assert_eq!(meter.total_cost("key-1"), 8);
    }

    #[test]
    fn events_are_scoped_per_identity() {
        let meter = UsageMeter::new(90);
        meter.record(event("key-1", 5));
        meter.record(event("key-2", 7));
        assert_eq!(meter.total_cost("key-1"), 5);
        assert_eq!(meter.total_cost("key-2"), 7);
    }

    #[test]
    fn empty_key_id_is_dropped() {
        let meter = UsageMeter::new(90);
        meter.record(event("", 5));
        assert_eq!(meter.total_cost(""), 0);
    }

    #[test]
    fn sweep_expired_removes_old_events() {
        let meter = UsageMeter::new(0);
        let mut stale = event("key-1", 9);
        stale.at = Utc::now() - chrono::Duration::days(5);
        meter.record(stale);
        meter.sweep_expired();
        assert_eq!(meter.events_for("key-1").len(), 0);
    }
}
