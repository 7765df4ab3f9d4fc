use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogMode {
    Full,
    /// First poll body per device in full, then only the changed paths.
    Diffed,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    pub path: String,
    pub old: Value,
    pub new: Value,
}

/// NDJSON log of the traffic with the cloud API. Never records the api key.
pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
    previous: HashMap<String, Value>,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            mode,
            file,
            previous: HashMap::new(),
        })
    }

    pub fn log_request(&mut self, method: &str, path: &str, body: Option<&Value>) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "req",
            "method": method,
            "path": path,
            "body": body,
        });
        self.write_line(&entry);
    }

    pub fn log_command(&mut self, action: &str, device_id: &str, body: &Value) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "cmd",
            "action": action,
            "device": device_id,
            "body": body,
        });
        self.write_line(&entry);
    }

    /// `key` identifies the polled resource (a device id, or `fleet`).
    pub fn log_poll(&mut self, key: &str, status: u16, body: &Value) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "poll",
            "key": key,
            "status": status,
        });

        match (self.mode, self.previous.get(key)) {
            (MessageLogMode::Diffed, Some(prev)) => {
                let mut changes = Vec::new();
                diff_json(prev, body, "", &mut changes);
                let changes: Vec<Value> = changes
                    .into_iter()
                    .map(|c| json!({ "path": c.path, "old": c.old, "new": c.new }))
                    .collect();
                entry["changes"] = Value::Array(changes);
            }
            (MessageLogMode::Diffed, None) => {
                entry["full"] = Value::Bool(true);
                entry["body"] = body.clone();
            }
            (MessageLogMode::Full, _) => {
                entry["body"] = body.clone();
            }
        }

        self.write_line(&entry);
        if self.mode == MessageLogMode::Diffed {
            self.previous.insert(key.to_string(), body.clone());
        }
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write log entry: {e}");
        }
    }
}

/// Collect leaf changes between two JSON documents. Keys that disappeared
/// are not reported, matching the "absent means unreported" rule of polls.
pub(crate) fn diff_json(previous: &Value, current: &Value, prefix: &str, changes: &mut Vec<Change>) {
    match (previous, current) {
        (Value::Object(prev), Value::Object(curr)) => {
            for (key, value) in curr {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match prev.get(key) {
                    Some(old) => diff_json(old, value, &path, changes),
                    None if value.is_object() => {
                        diff_json(&Value::Object(Map::new()), value, &path, changes);
                    }
                    None => changes.push(Change {
                        path,
                        old: Value::Null,
                        new: value.clone(),
                    }),
                }
            }
        }
        (old, new) if old != new => changes.push(Change {
            path: prefix.to_string(),
            old: old.clone(),
            new: new.clone(),
        }),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn log_request_writes_ndjson() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Full, tmp.path()).unwrap();
        logger.log_request("GET", "/v2/pods/abc", None);

        let lines = read_lines(tmp.path());
        assert_eq!(lines[0]["dir"], "req");
        assert_eq!(lines[0]["method"], "GET");
        assert!(lines[0]["ts"].as_str().is_some());
    }

    #[test]
    fn log_command_captures_device() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Full, tmp.path()).unwrap();
        logger.log_command("push_ac_state", "abc", &json!({"acState": {"on": true}}));

        let lines = read_lines(tmp.path());
        assert_eq!(lines[0]["dir"], "cmd");
        assert_eq!(lines[0]["action"], "push_ac_state");
        assert_eq!(lines[0]["device"], "abc");
    }

    #[test]
    fn diffed_mode_logs_full_first_then_changes() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Diffed, tmp.path()).unwrap();

        logger.log_poll("abc", 200, &json!({"measurements": {"temperature": 24.0}}));
        logger.log_poll("abc", 200, &json!({"measurements": {"temperature": 24.5}}));
        logger.log_poll("abc", 200, &json!({"measurements": {"temperature": 24.5}}));

        let lines = read_lines(tmp.path());
        assert_eq!(lines[0]["full"], true);
        assert!(lines[0]["body"].is_object());
        let changes = lines[1]["changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["path"], "measurements.temperature");
        assert_eq!(lines[2]["changes"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn diffed_mode_tracks_devices_separately() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Diffed, tmp.path()).unwrap();

        logger.log_poll("abc", 200, &json!({"acState": {"on": true}}));
        logger.log_poll("def", 200, &json!({"acState": {"on": false}}));

        let lines = read_lines(tmp.path());
        assert_eq!(lines[0]["full"], true);
        assert_eq!(lines[1]["full"], true);
    }

    #[test]
    fn diff_detects_leaf_change_and_new_key() {
        let prev = json!({"acState": {"on": false}});
        let curr = json!({"acState": {"on": true, "mode": "cool"}});
        let mut changes = vec![];
        diff_json(&prev, &curr, "", &mut changes);
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&Change {
            path: "acState.on".into(),
            old: json!(false),
            new: json!(true),
        }));
        assert!(changes.iter().any(|c| c.path == "acState.mode" && c.old.is_null()));
    }

    #[test]
    fn diff_ignores_removed_keys() {
        let prev = json!({"measurements": {"temperature": 24.0, "humidity": 40}});
        let curr = json!({"measurements": {"temperature": 24.0}});
        let mut changes = vec![];
        diff_json(&prev, &curr, "", &mut changes);
        assert!(changes.is_empty());
    }
}
