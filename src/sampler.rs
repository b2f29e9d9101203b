//! Keyed log sampling.
//!
//! High-volume messages (health checks, access logs) can be thinned before
//! they reach the sink. Rules pair a key with a regex; a message matching a
//! rule is kept one time in `ratio`, counted per key so the decision is
//! deterministic and survives neither randomness nor clock skew. Messages
//! matching no rule always pass.

use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;
use serde_json::{json, Map, Value};

pub struct SampleRule {
    key: String,
    pattern: Regex,
    seen: AtomicU64,
}

pub struct Sampler {
    ratio: u64,
    rules: Vec<SampleRule>,
}

impl Sampler {
    /// A sampler that passes everything untouched.
    pub fn passthrough() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn new(ratio: u64, rules: Vec<(String, Regex)>) -> Self {
        Self {
            ratio: ratio.max(1),
            rules: rules
                .into_iter()
                .map(|(key, pattern)| SampleRule {
                    key,
                    pattern,
                    seen: AtomicU64::new(0),
                })
                .collect(),
        }
    }

    /// Decide whether `message` is kept. `None` means drop; `Some(map)` is
    /// the sampling metadata to merge into the event, empty when no rule
    /// applied.
    pub fn sample(&self, message: &str) -> Option<Map<String, Value>> {
        let rule = self.rules.iter().find(|r| r.pattern.is_match(message))?;

        let seen = rule.seen.fetch_add(1, Ordering::Relaxed);
        if seen % self.ratio != 0 {
            return None;
        }

        let mut sample = Map::new();
        sample.insert("key".into(), json!(rule.key));
        sample.insert("ratio".into(), json!(self.ratio));

        let mut metadata = Map::new();
        metadata.insert("sample".into(), Value::Object(sample));
        Some(metadata)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::passthrough()
    }
}
