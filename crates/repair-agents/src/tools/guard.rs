//! Per-iteration repeat guard and result cache for query tools.

use std::collections::HashMap;

use serde_json::Value;

/// Canonical key for a call: tool name plus arguments with sorted keys.
pub fn call_key(tool: &str, args: &Value) -> String {
    format!("{tool}:{}", canonical(args))
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    /// The same call was already made `count` times this iteration.
    Blocked { count: u32 },
}

#[derive(Debug, Default)]
pub struct ToolCallGuard {
    max_repeat: u32,
    counts: HashMap<String, u32>,
    cache: HashMap<(String, u64), String>,
}

impl ToolCallGuard {
    pub fn new(max_repeat: u32) -> Self {
        Self {
            max_repeat,
            ..Default::default()
        }
    }

    /// Count the call and decide whether it may run.
    pub fn check(&mut self, key: &str) -> GuardDecision {
        let count = self.counts.entry(key.to_string()).or_insert(0);
        if *count >= self.max_repeat {
            return GuardDecision::Blocked { count: *count };
        }
        *count += 1;
        GuardDecision::Allow
    }

    pub fn cached(&self, key: &str, revision: u64) -> Option<&str> {
        self.cache
            .get(&(key.to_string(), revision))
            .map(String::as_str)
    }

    pub fn remember(&mut self, key: &str, revision: u64, result: String) {
        self.cache.insert((key.to_string(), revision), result);
    }

    /// Forget counts and cached results at the start of an iteration.
    pub fn reset(&mut self) {
        self.counts.clear();
        self.cache.clear();
    }
}
