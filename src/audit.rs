//! Per-request audit trail
//!
//! Every protocol request leaves exactly one record: what the client asked,
//! from where, and how it went. Records live in a bounded ring so an
//! unattended server cannot grow without limit; each one is also emitted as
//! JSON through the log stream, which is the durable copy. Offline
//! diagnosis of tracker misbehavior works from these records alone; there
//! is no alerting on top.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 1024;

/// Structured record of one handled request.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    /// Declared protocol command, absent when the request never got that far.
    pub command: Option<String>,
    pub sender: IpAddr,
    pub fields: HashMap<String, String>,
    pub response_status: u16,
    /// Response payload on success, error reason otherwise.
    pub outcome: String,
}

/// Bounded, append-only ring of audit records.
///
/// The lock is held only to push or snapshot, never across awaits.
pub struct AuditLog {
    records: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> AuditLog {
        AuditLog {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, record: AuditRecord) {
        match serde_json::to_string(&record) {
            Ok(json) => tracing::info!(target: "trackrelay::audit", "{}", json),
            Err(err) => tracing::error!(error = %err, "audit record did not serialize"),
        }
        let mut records = self.records.lock().unwrap();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Copy of the retained records, oldest first.
    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(command: &str, status: u16) -> AuditRecord {
        AuditRecord {
            timestamp: Utc::now(),
            command: Some(command.to_string()),
            sender: IpAddr::from([10, 0, 0, 1]),
            fields: HashMap::from([("request".to_string(), command.to_string())]),
            response_status: status,
            outcome: "<type>time</type>".to_string(),
        }
    }

    #[test]
    fn test_records_append_in_order() {
        let log = AuditLog::new(8);
        log.record(record("get_time", 200));
        log.record(record("stop_activity", 200));
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].command.as_deref(), Some("get_time"));
        assert_eq!(snapshot[1].command.as_deref(), Some("stop_activity"));
    }

    #[test]
    fn test_ring_drops_oldest_at_capacity() {
        let log = AuditLog::new(3);
        for status in [200, 200, 400, 401] {
            log.record(record("get_time", status));
        }
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].response_status, 200);
        assert_eq!(snapshot[2].response_status, 401);
    }

    #[test]
    fn test_capacity_of_zero_still_keeps_one() {
        let log = AuditLog::new(0);
        log.record(record("get_time", 200));
        log.record(record("get_activities", 200));
        assert_eq!(log.len(), 1);
        assert_eq!(log.snapshot()[0].command.as_deref(), Some("get_activities"));
    }

    #[test]
    fn test_records_serialize_to_json() {
        let json = serde_json::to_string(&record("start_activity", 200)).unwrap();
        assert!(json.contains("\"command\":\"start_activity\""));
        assert!(json.contains("\"response_status\":200"));
    }
}
