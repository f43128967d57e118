//! Alert event emitted once an exec event matches a rule.

use serde_json::Value;
use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::event::ExecEvent;
use crate::rules::{Rule, Severity};

#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    pub kind: &'static str,
    pub rule_name: String,
    pub severity: Severity,
    pub timestamp: SystemTime,
    pub detail: BTreeMap<String, Value>,
}

impl AlertEvent {
    /// Builds an alert for a `PROCESS` rule match (§3, §4.9). `detail`
    /// always carries `pid, ppid, uid, gid, comm, exe`, plus `cmdline` when
    /// the decoded argv string is non-empty.
    pub fn for_process_match(rule: &Rule, event: &ExecEvent) -> Self {
        let mut detail = BTreeMap::new();
        detail.insert("pid".to_string(), Value::from(event.pid));
        detail.insert("ppid".to_string(), Value::from(event.ppid));
        detail.insert("uid".to_string(), Value::from(event.uid));
        detail.insert("gid".to_string(), Value::from(event.gid));
        detail.insert("comm".to_string(), Value::from(event.comm.clone()));
        detail.insert("exe".to_string(), Value::from(event.filename.clone()));
        if !event.argv.is_empty() {
            detail.insert("cmdline".to_string(), Value::from(event.argv.clone()));
        }

        AlertEvent {
            kind: "PROCESS",
            rule_name: rule.name.clone(),
            severity: rule.severity,
            timestamp: SystemTime::now(),
            detail,
        }
    }
}
