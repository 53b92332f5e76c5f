//! health check records published over the admin API

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_derive::Serialize;

/// Severity of a check, juggler style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckCode {
    Ok = 0,
    Warn = 1,
    Crit = 2,
}

/// One published health check; consumers treat a check older than its
/// ttl as stale.
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub id: String,
    pub class: String,
    pub timestamp: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub code: CheckCode,
    pub message: String,
}

/// In-memory check store, one slot per check id.
#[derive(Default)]
pub struct Monitor {
    checks: Mutex<HashMap<String, Check>>,
}

impl Monitor {
    pub fn new() -> Monitor {
        Monitor::default()
    }

    pub fn publish(&self, id: &str, class: &str, ttl_seconds: u64, code: CheckCode, message: &str) {
        let check = Check {
            id: id.to_string(),
            class: class.to_string(),
            timestamp: Utc::now(),
            ttl_seconds,
            code,
            message: message.to_string(),
        };

        log::debug!(
            "(monitor) check id:'{}' code:'{:?}' message:'{}'",
            id,
            code,
            message
        );

        self.checks.lock().insert(id.to_string(), check);
    }

    pub fn get(&self, id: &str) -> Option<Check> {
        self.checks.lock().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Check> {
        let mut checks: Vec<Check> = self.checks.lock().values().cloned().collect();
        checks.sort_by(|a, b| a.id.cmp(&b.id));
        checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_overwrites_by_id() {
        let monitor = Monitor::new();

        monitor.publish("receiver-alive", "xdpdns", 300, CheckCode::Ok, "alive");
        monitor.publish("receiver-alive", "xdpdns", 300, CheckCode::Crit, "stale");

        let check = monitor.get("receiver-alive").unwrap();
        assert_eq!(check.code, CheckCode::Crit);
        assert_eq!(monitor.all().len(), 1);
    }
}
