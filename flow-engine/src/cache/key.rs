// Cache keys
// Structural hashing: per-input hashes through a pluggable provider
// registry, plus canonical-JSON parameters and extra hash expressions

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::defs::DataItem;
use crate::error::CacheError;
use crate::value::Value;

/// Content-addressed cache key: task name plus structural hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub task: String,
    pub hash: String,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task, self.hash)
    }
}

/// Hashes one input data item. Providers are selected per item by priority;
/// the highest-priority matching provider wins.
pub trait HashProvider: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn matches(&self, item: &DataItem) -> bool;
    fn hash(&self, item: &DataItem) -> Result<String, CacheError>;
}

/// Default provider: matches everything, hashes member file contents plus
/// the item's structural metadata
pub struct DefaultHashProvider;

impl HashProvider for DefaultHashProvider {
    fn name(&self) -> &str {
        "default"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn matches(&self, _item: &DataItem) -> bool {
        true
    }

    fn hash(&self, item: &DataItem) -> Result<String, CacheError> {
        let mut hasher = Sha256::new();
        hasher.update(Value::Map(item.shape()).canonical_json().as_bytes());

        if let Some(basedir) = &item.basedir {
            for file in &item.files {
                hasher.update(file.as_bytes());
                let path = basedir.join(file);
                let bytes = std::fs::read(&path)?;
                hasher.update(&bytes);
            }
        }

        Ok(hex(&hasher.finalize()))
    }
}

/// Priority-ordered provider registry
pub struct HashRegistry {
    providers: Vec<Arc<dyn HashProvider>>,
}

impl Default for HashRegistry {
    fn default() -> Self {
        Self {
            providers: vec![Arc::new(DefaultHashProvider)],
        }
    }
}

impl HashRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn HashProvider>) {
        self.providers.push(provider);
        self.providers.sort_by_key(|p| std::cmp::Reverse(p.priority()));
    }

    /// Hash one item with the highest-priority matching provider
    pub fn hash_item(&self, item: &DataItem) -> Result<String, CacheError> {
        for provider in &self.providers {
            if provider.matches(item) {
                return provider.hash(item);
            }
        }
        DefaultHashProvider.hash(item)
    }
}

/// Compute the key for one task instantiation:
/// `task-name : sha256(input-hashes ++ canonical-json(params) ++ extras)`
pub fn compute_key(
    task_name: &str,
    inputs: &[DataItem],
    params: &BTreeMap<String, Value>,
    extra: &[Value],
    registry: &HashRegistry,
) -> Result<CacheKey, CacheError> {
    let mut hasher = Sha256::new();

    for item in inputs {
        hasher.update(registry.hash_item(item)?.as_bytes());
    }
    hasher.update(Value::Map(params.clone()).canonical_json().as_bytes());
    for value in extra {
        hasher.update(value.canonical_json().as_bytes());
    }

    Ok(CacheKey {
        task: task_name.to_string(),
        hash: hex(&hasher.finalize()),
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
