//! Remembered permission decisions.
//!
//! Keys are `<tool>:<digest>` where the digest is a SHA-256 over the
//! canonical JSON rendering of the input map. Canonical means object keys
//! are sorted at every depth, so two maps that differ only in key order
//! share a key.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_MEMORY_CAPACITY: usize = 100;
pub const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(60 * 60);

/// Builds the memory key for a tool invocation.
pub fn memory_key(tool_name: &str, inputs: &Map<String, Value>) -> String {
    let mut canonical = String::new();
    write_canonical_object(inputs, &mut canonical);

    let digest = Sha256::digest(canonical.as_bytes());
    let hex = format!("{:x}", digest);
    format!("{}:{}", tool_name, &hex[..16])
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars have a single JSON rendering.
        scalar => {
            let _ = write!(out, "{}", scalar);
        }
    }
}

fn write_canonical_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}:", Value::String(key.clone()));
        write_canonical(&map[key.as_str()], out);
    }
    out.push('}');
}

#[derive(Debug, Clone, Copy)]
struct MemoryEntry {
    allow: bool,
    stored_at: Instant,
}

/// Bounded, expiring map from memory key to allow/deny.
///
/// When full, the oldest entry is evicted first.
#[derive(Debug)]
pub struct PermissionMemory {
    entries: HashMap<String, MemoryEntry>,
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

impl Default for PermissionMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY, DEFAULT_MEMORY_TTL)
    }
}

impl PermissionMemory {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Looks up a remembered decision, dropping it if it has expired.
    pub fn lookup(&mut self, key: &str) -> Option<bool> {
        self.lookup_at(key, Instant::now())
    }

    pub fn remember(&mut self, key: impl Into<String>, allow: bool) {
        self.remember_at(key.into(), allow, Instant::now());
    }

    fn lookup_at(&mut self, key: &str, now: Instant) -> Option<bool> {
        let entry = *self.entries.get(key)?;
        if now.saturating_duration_since(entry.stored_at) >= self.ttl {
            self.remove(key);
            return None;
        }
        Some(entry.allow)
    }

    fn remember_at(&mut self, key: String, allow: bool, now: Instant) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        while self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            MemoryEntry {
                allow,
                stored_at: now,
            },
        );
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }

    /// Forgets every decision. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.order.clear();
        count
    }

    /// Forgets every decision recorded for `tool_name`.
    pub fn clear_tool(&mut self, tool_name: &str) -> usize {
        let prefix = format!("{}:", tool_name);
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(&prefix));
        self.order.retain(|k| !k.starts_with(&prefix));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
