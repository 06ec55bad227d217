//! Execution contexts and isolated records

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Suffix alphabet for context ids
const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 9;

/// Disambiguator minted for one test-data initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// `<unix-millis>_<9 lower-case alphanumerics>`
    pub context_id: String,
    pub test_id: String,
    pub start_time: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(test_id: &str) -> Self {
        let start_time = Utc::now();
        Self {
            context_id: mint_context_id(start_time, &mut rand::thread_rng()),
            test_id: test_id.to_string(),
            start_time,
        }
    }
}

/// Build a context id from `now` and a random suffix drawn from `rng`
pub fn mint_context_id(now: DateTime<Utc>, rng: &mut impl Rng) -> String {
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{}_{}", now.timestamp_millis(), suffix)
}

/// A test's private copy of fixture data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolatedRecord {
    /// Owning context; `None` for the empty record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl IsolatedRecord {
    pub fn is_empty(&self) -> bool {
        self.context_id.is_none() && self.data.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// String field shortcut, e.g. `record.get_str("email")`
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}
