//! Read-through cache over categorized fixture documents
//!
//! A source document for type `users` is `<root>/users.json` (or `.yaml` /
//! `.yml`) shaped like:
//!
//! ```json
//! { "users": { "valid": [ {"username": "alice"} ], "locked": [ .. ] } }
//! ```
//!
//! Missing or unparseable sources yield empty results. Only successful reads
//! are cached, so a fixed file is picked up on the next call.

use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A single fixture record
pub type Record = Map<String, Value>;

/// One loaded fixture type: category → ordered records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fixture {
    pub fixture_type: String,
    pub categories: BTreeMap<String, Vec<Record>>,
}

impl Fixture {
    pub fn category(&self, category: &str) -> &[Record] {
        self.categories
            .get(category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

const EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

pub struct FixtureStore {
    root: PathBuf,
    cache: DashMap<String, Arc<Fixture>>,
}

impl FixtureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All categories of `fixture_type`
    pub fn load(&self, fixture_type: &str) -> Arc<Fixture> {
        if let Some(cached) = self.cache.get(fixture_type) {
            return Arc::clone(&cached);
        }

        match self.read_source(fixture_type) {
            Some(fixture) => {
                let fixture = Arc::new(fixture);
                self.cache
                    .insert(fixture_type.to_string(), Arc::clone(&fixture));
                fixture
            }
            None => Arc::new(Fixture {
                fixture_type: fixture_type.to_string(),
                categories: BTreeMap::new(),
            }),
        }
    }

    /// Records of `category`, empty when the type or category is unknown
    pub fn load_category(&self, fixture_type: &str, category: &str) -> Vec<Record> {
        self.load(fixture_type).category(category).to_vec()
    }

    /// Record `index` (default 0) of `category`.
    ///
    /// An out-of-range index falls back to the first record; an empty
    /// category yields an empty record.
    pub fn load_record(&self, fixture_type: &str, category: &str, index: Option<usize>) -> Record {
        let fixture = self.load(fixture_type);
        let records = fixture.category(category);
        let index = index.unwrap_or(0);

        match records.get(index) {
            Some(record) => record.clone(),
            None => {
                if !records.is_empty() {
                    warn!(
                        fixture_type = %fixture_type,
                        category = %category,
                        index,
                        available = records.len(),
                        "Fixture index out of range, using the first record"
                    );
                }
                records.first().cloned().unwrap_or_default()
            }
        }
    }

    /// Forget cached fixtures
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn source_path(&self, fixture_type: &str) -> Option<PathBuf> {
        EXTENSIONS
            .iter()
            .map(|ext| self.root.join(format!("{}.{}", fixture_type, ext)))
            .find(|path| path.is_file())
    }

    fn read_source(&self, fixture_type: &str) -> Option<Fixture> {
        let Some(path) = self.source_path(fixture_type) else {
            warn!(fixture_type = %fixture_type, root = %self.root.display(), "No fixture source found");
            return None;
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read fixture source");
                return None;
            }
        };

        let document = match parse_document(&path, &content) {
            Ok(document) => document,
            Err(reason) => {
                warn!(path = %path.display(), error = %reason, "Could not parse fixture source");
                return None;
            }
        };

        let Some(Value::Object(by_category)) = document.get(fixture_type) else {
            warn!(path = %path.display(), fixture_type = %fixture_type, "Fixture source has no object for its type");
            return None;
        };

        let mut categories = BTreeMap::new();
        for (category, records) in by_category {
            let Value::Array(records) = records else {
                warn!(fixture_type = %fixture_type, category = %category, "Fixture category is not a list, skipping");
                continue;
            };
            // Non-object entries become empty records so indices stay put
            let records: Vec<Record> = records
                .iter()
                .enumerate()
                .map(|(index, record)| match record {
                    Value::Object(record) => record.clone(),
                    _ => {
                        warn!(
                            fixture_type = %fixture_type,
                            category = %category,
                            index,
                            "Fixture record is not an object, treating it as empty"
                        );
                        Record::new()
                    }
                })
                .collect();
            categories.insert(category.clone(), records);
        }

        debug!(
            path = %path.display(),
            categories = categories.len(),
            "Loaded fixture source"
        );

        Some(Fixture {
            fixture_type: fixture_type.to_string(),
            categories,
        })
    }
}

fn parse_document(path: &Path, content: &str) -> Result<Value, String> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(content).map_err(|e| e.to_string()),
        _ => serde_yaml::from_str(content).map_err(|e| e.to_string()),
    }
}
