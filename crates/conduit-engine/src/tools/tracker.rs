use std::collections::VecDeque;

use serde_json::Value;

/// Inspects the last `window_size` invocations and rejects any invocation
/// whose `(tool_name, canonical(args))` key matches `max_repeats` or more
/// times within that window — an explicit component with a bounded ring
/// buffer of keys, no reliance on ambient structure.
pub struct ToolCallTracker {
    window_size: usize,
    max_repeats: usize,
    history: VecDeque<String>,
}

impl Default for ToolCallTracker {
    fn default() -> Self {
        Self::new(10, 3)
    }
}

impl ToolCallTracker {
    pub fn new(window_size: usize, max_repeats: usize) -> Self {
        Self { window_size, max_repeats, history: VecDeque::with_capacity(window_size) }
    }

    /// Canonical form: tool name plus JSON value re-serialised with sorted
    /// object keys, so argument-order differences don't evade detection.
    pub fn canonical_key(tool_name: &str, args: &Value) -> String {
        format!("{tool_name}:{}", canonicalize(args))
    }

    /// Returns true (and does NOT record the call) if invoking `tool_name`
    /// with `args` would exceed the repeat bound within the current window.
    pub fn would_loop(&self, tool_name: &str, args: &Value) -> bool {
        let key = Self::canonical_key(tool_name, args);
        let count = self.history.iter().filter(|k| **k == key).count();
        count + 1 >= self.max_repeats
    }

    /// Records a call regardless of outcome (loop-detected calls are not
    /// executed, but are still tracked since they count toward the window).
    pub fn record(&mut self, tool_name: &str, args: &Value) {
        let key = Self::canonical_key(tool_name, args);
        self.history.push_back(key);
        while self.history.len() > self.window_size {
            self.history.pop_front();
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

fn canonicalize(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body = entries.iter().map(|(k, v)| format!("{k:?}:{}", canonicalize(v))).collect::<Vec<_>>().join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items.iter().map(canonicalize).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}
