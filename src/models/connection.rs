use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::RandomState;
use std::collections::BTreeMap;
use std::hash::BuildHasher;
use std::sync::LazyLock;

/// Parameters that decide which pool a descriptor maps to
const IDENTITY_PARAMS: [&str; 9] = ["host", "port", "database", "user", "username", "password", "path", "format", "table"];

/// Per-process hash keys for log fingerprints
static FINGERPRINT_KEYS: LazyLock<RandomState> = LazyLock::new(RandomState::new);

/// Exact identity of a pool: kind plus every identity parameter.
///
/// Holds credentials, so it has no `Debug`; log a fingerprint instead.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    kind: String,
    params: Vec<(&'static str, String)>,
}

/// Typed description of a backing store, resolved by the caller from
/// stored data-source metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// postgresql, mysql, embedded (DataFusion) or file
    pub kind: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl ConnectionDescriptor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// String view of a parameter; numbers are rendered, empty strings are absent
    pub fn param(&self, key: &str) -> Option<String> {
        match self.parameters.get(key)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Identity used to key pools: kind, endpoint, database and credentials
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            kind: self.kind.trim().to_lowercase(),
            params: IDENTITY_PARAMS
                .iter()
                .filter_map(|key| self.param(key).map(|value| (*key, value)))
                .collect(),
        }
    }

    /// Short, log-safe label for the pool key. Stable within a process only.
    pub fn fingerprint(&self) -> String {
        let key = self.pool_key();
        format!("{}:{:016x}", key.kind, FINGERPRINT_KEYS.hash_one(&key))
    }
}
