//! Per-test data isolation
//!
//! Each test gets a deep copy of its base fixture with identity fields
//! tagged by a freshly minted context id, so parallel tests never register
//! the same email address or username.

use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::context::{ExecutionContext, IsolatedRecord};
use crate::config::FixturesConfig;

/// Which keys carry identities, matched at any depth
#[derive(Debug, Clone)]
pub struct IdentityFields {
    /// Rewritten as `local+ctx@domain`
    pub email: HashSet<String>,
    /// Rewritten as `value_ctx`
    pub identifier: HashSet<String>,
}

impl Default for IdentityFields {
    fn default() -> Self {
        Self {
            email: HashSet::from(["email".to_string()]),
            identifier: HashSet::from(["username".to_string()]),
        }
    }
}

impl IdentityFields {
    pub fn new<E, I>(email: E, identifier: I) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            email: email.into_iter().map(Into::into).collect(),
            identifier: identifier.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&FixturesConfig> for IdentityFields {
    fn from(config: &FixturesConfig) -> Self {
        Self::new(config.email_fields.clone(), config.identifier_fields.clone())
    }
}

/// Store of isolated records, keyed by test id
#[derive(Debug, Default)]
pub struct IsolationEngine {
    fields: IdentityFields,
    records: DashMap<String, IsolatedRecord>,
    contexts: DashMap<String, ExecutionContext>,
}

impl IsolationEngine {
    pub fn new(fields: IdentityFields) -> Self {
        Self {
            fields,
            records: DashMap::new(),
            contexts: DashMap::new(),
        }
    }

    /// Mint a context for `test_id` and store an isolated copy of `base`.
    ///
    /// Re-initializing a live test id replaces its record and context.
    pub fn initialize_test_data(&self, test_id: &str, base: &Map<String, Value>) -> IsolatedRecord {
        let context = self.mint_context(test_id);

        let mut data = base.clone();
        for (key, value) in data.iter_mut() {
            self.isolate(key, value, &context.context_id);
        }

        let record = IsolatedRecord {
            context_id: Some(context.context_id.clone()),
            data,
        };

        info!(test_id = %test_id, context_id = %context.context_id, "Initialized isolated test data");
        self.contexts.insert(test_id.to_string(), context);
        self.records.insert(test_id.to_string(), record.clone());

        record
    }

    /// Stored record for `test_id`, or the empty record
    pub fn get_test_data(&self, test_id: &str) -> IsolatedRecord {
        self.records
            .get(test_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Merge `new_data` over the top-level fields of `test_id`'s record.
    ///
    /// Returns the merged record, or `None` if `test_id` was never
    /// initialized (logged, not an error: teardown races are expected).
    pub fn update_test_data(
        &self,
        test_id: &str,
        new_data: Map<String, Value>,
    ) -> Option<IsolatedRecord> {
        let Some(mut record) = self.records.get_mut(test_id) else {
            warn!(test_id = %test_id, "No isolated data to update");
            return None;
        };

        let updated: Vec<&str> = new_data.keys().map(String::as_str).collect();
        debug!(test_id = %test_id, fields = ?updated, "Updating isolated test data");
        for (key, value) in new_data {
            record.data.insert(key, value);
        }

        Some(record.clone())
    }

    /// Drop `test_id`'s record and context binding. Idempotent.
    pub fn cleanup_test_data(&self, test_id: &str) {
        let had_record = self.records.remove(test_id).is_some();
        let context = self.contexts.remove(test_id);

        match context {
            Some((_, context)) => {
                info!(test_id = %test_id, context_id = %context.context_id, "Cleaned up isolated test data");
            }
            None if had_record => {
                info!(test_id = %test_id, "Cleaned up isolated test data");
            }
            None => {
                debug!(test_id = %test_id, "No isolated data to clean up");
            }
        }
    }

    pub fn context(&self, test_id: &str) -> Option<ExecutionContext> {
        self.contexts.get(test_id).map(|c| c.clone())
    }

    /// Number of tests holding isolated data
    pub fn active_count(&self) -> usize {
        self.records.len()
    }

    fn mint_context(&self, test_id: &str) -> ExecutionContext {
        loop {
            let context = ExecutionContext::new(test_id);
            let collides = self.contexts.iter().any(|entry| {
                entry.key() != test_id && entry.value().context_id == context.context_id
            });
            if !collides {
                return context;
            }
            warn!(context_id = %context.context_id, "Context id collision, minting another");
        }
    }

    fn isolate(&self, key: &str, value: &mut Value, context_id: &str) {
        match value {
            Value::String(s) if self.fields.email.contains(key) => {
                *s = tag_address(s, context_id);
            }
            Value::String(s) if self.fields.identifier.contains(key) => {
                *s = tag_identifier(s, context_id);
            }
            Value::Object(map) => {
                for (child_key, child) in map.iter_mut() {
                    self.isolate(child_key, child, context_id);
                }
            }
            // Array items inherit the key they are listed under
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.isolate(key, item, context_id);
                }
            }
            _ => {}
        }
    }
}

/// `local@domain` → `local+ctx@domain`; values without `@` get the
/// identifier suffix instead
fn tag_address(value: &str, context_id: &str) -> String {
    match value.rsplit_once('@') {
        Some((local, domain)) => format!("{}+{}@{}", local, context_id, domain),
        None => tag_identifier(value, context_id),
    }
}

fn tag_identifier(value: &str, context_id: &str) -> String {
    format!("{}_{}", value, context_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Map<String, Value> {
        json!({
            "username": "alice",
            "email": "alice@example.com",
            "password": "s3cret",
            "age": 30,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_identity_fields_tagged() {
        let engine = IsolationEngine::default();
        let record = engine.initialize_test_data("t1", &base());
        let ctx = record.context_id.clone().unwrap();

        assert_eq!(record.get_str("username").unwrap(), format!("alice_{}", ctx));
        assert_eq!(
            record.get_str("email").unwrap(),
            format!("alice+{}@example.com", ctx)
        );
        assert_eq!(record.get_str("password"), Some("s3cret"));
        assert_eq!(record.get("age"), Some(&json!(30)));
    }

    #[test]
    fn test_context_inserted_before_last_at() {
        assert_eq!(tag_address("a@b@c.org", "x"), "a@b+x@c.org");
        assert_eq!(tag_address("nobody", "x"), "nobody_x");
    }

    #[test]
    fn test_nested_fields_tagged() {
        let engine = IsolationEngine::default();
        let base = json!({
            "account": {"username": "bob", "contacts": [{"email": "c@d.io"}, {"email": "e@f.io"}]},
            "email": ["one@x.com", "two@x.com"],
        });
        let record = engine.initialize_test_data("t1", base.as_object().unwrap());
        let ctx = record.context_id.clone().unwrap();

        assert_eq!(
            record.data["account"]["username"],
            json!(format!("bob_{}", ctx))
        );
        assert_eq!(
            record.data["account"]["contacts"][1]["email"],
            json!(format!("e+{}@f.io", ctx))
        );
        assert_eq!(record.data["email"][0], json!(format!("one+{}@x.com", ctx)));
    }

    #[test]
    fn test_custom_fields() {
        let engine = IsolationEngine::new(IdentityFields::new(["login_email"], ["handle"]));
        let base = json!({"login_email": "q@r.st", "handle": "qq", "username": "kept"});
        let record = engine.initialize_test_data("t1", base.as_object().unwrap());

        assert!(record.get_str("login_email").unwrap().starts_with("q+"));
        assert!(record.get_str("handle").unwrap().starts_with("qq_"));
        assert_eq!(record.get_str("username"), Some("kept"));
    }

    #[test]
    fn test_base_data_untouched() {
        let engine = IsolationEngine::default();
        let base = base();
        engine.initialize_test_data("t1", &base);
        assert_eq!(base["username"], json!("alice"));
    }

    #[test]
    fn test_parallel_tests_get_distinct_identities() {
        let engine = IsolationEngine::default();
        let a = engine.initialize_test_data("t1", &base());
        let b = engine.initialize_test_data("t2", &base());

        assert_ne!(a.context_id, b.context_id);
        assert_ne!(a.get_str("email"), b.get_str("email"));
        assert_ne!(a.get_str("username"), b.get_str("username"));

        let mut patch = Map::new();
        patch.insert("password".into(), json!("changed"));
        engine.update_test_data("t1", patch).unwrap();

        assert_eq!(engine.get_test_data("t1").get_str("password"), Some("changed"));
        assert_eq!(engine.get_test_data("t2").get_str("password"), Some("s3cret"));
    }

    #[test]
    fn test_update_is_shallow_merge() {
        let engine = IsolationEngine::default();
        engine.initialize_test_data("t1", &base());

        let mut patch = Map::new();
        patch.insert("age".into(), json!(31));
        patch.insert("role".into(), json!("admin"));
        let merged = engine.update_test_data("t1", patch).unwrap();

        assert_eq!(merged.get("age"), Some(&json!(31)));
        assert_eq!(merged.get_str("role"), Some("admin"));
        assert!(merged.get_str("username").unwrap().starts_with("alice_"));
    }

    #[test]
    fn test_update_unknown_test_is_soft() {
        let engine = IsolationEngine::default();
        assert!(engine.update_test_data("ghost", Map::new()).is_none());
        assert!(engine.get_test_data("ghost").is_empty());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let engine = IsolationEngine::default();
        engine.initialize_test_data("t1", &base());
        assert_eq!(engine.active_count(), 1);
        assert!(engine.context("t1").is_some());

        engine.cleanup_test_data("t1");
        engine.cleanup_test_data("t1");

        assert_eq!(engine.active_count(), 0);
        assert!(engine.context("t1").is_none());
        assert!(engine.get_test_data("t1").is_empty());
    }

    #[test]
    fn test_reinitialize_replaces_record() {
        let engine = IsolationEngine::default();
        let first = engine.initialize_test_data("t1", &base());
        let second = engine.initialize_test_data("t1", &base());

        assert_eq!(engine.active_count(), 1);
        assert_eq!(engine.get_test_data("t1"), second);
        assert_eq!(
            engine.context("t1").map(|c| c.context_id),
            second.context_id
        );
        // Same millisecond is possible; the suffix still differs.
        assert_ne!(first.context_id, second.context_id);
    }
}
