//! Persistence for operator-managed rules.
//!
//! Rules are kept as raw JSON documents so that one undecodable entry
//! (unknown scope, unknown algorithm) can be skipped by the reader instead
//! of poisoning the whole collection. Every write is a read-modify-write of
//! the full list followed by a whole-list replace.

use std::sync::Arc;

use async_trait::async_trait;
use ratewarden_common::{Clock, RateLimitRule};
use ratewarden_store::AtomicCounter;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::RuleError;

/// Store key holding the rule collection in the shared counter store.
pub const RULES_KEY: &str = "rules";

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// All stored rule documents, undecoded.
    async fn load(&self) -> Result<Vec<Value>, RuleError>;

    /// Insert the rule, replacing any stored rule with the same key.
    async fn save(&self, rule: &RateLimitRule) -> Result<(), RuleError>;

    /// Returns whether a rule with that key was stored.
    async fn delete(&self, key: &str) -> Result<bool, RuleError>;
}

fn document_key(doc: &Value) -> Option<&str> {
    doc.get("key").and_then(Value::as_str)
}

fn upsert(docs: &mut Vec<Value>, rule: &RateLimitRule) -> Result<(), RuleError> {
    let doc = serde_json::to_value(rule)?;
    match docs
        .iter_mut()
        .find(|d| document_key(d) == Some(rule.key.as_str()))
    {
        Some(existing) => *existing = doc,
        None => docs.push(doc),
    }
    Ok(())
}

fn remove(docs: &mut Vec<Value>, key: &str) -> bool {
    let before = docs.len();
    docs.retain(|d| document_key(d) != Some(key));
    docs.len() != before
}

/// Process-local rule store.
#[derive(Default)]
pub struct MemoryRuleStore {
    docs: Mutex<Vec<Value>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with raw documents, valid or not.
    pub fn with_documents(docs: Vec<Value>) -> Self {
        Self {
            docs: Mutex::new(docs),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn load(&self) -> Result<Vec<Value>, RuleError> {
        Ok(self.docs.lock().await.clone())
    }

    async fn save(&self, rule: &RateLimitRule) -> Result<(), RuleError> {
        let mut docs = self.docs.lock().await;
        upsert(&mut docs, rule)
    }

    async fn delete(&self, key: &str) -> Result<bool, RuleError> {
        let mut docs = self.docs.lock().await;
        Ok(remove(&mut docs, key))
    }
}

/// Rule store kept as a single JSON array in the shared counter store, so
/// every gateway instance sees the same operator rules.
///
/// Concurrent writers may lose each other's updates; the collection itself
/// is always replaced whole and never left half-written.
pub struct SharedRuleStore {
    store: Arc<dyn AtomicCounter>,
    clock: Arc<dyn Clock>,
}

impl SharedRuleStore {
    pub fn new(store: Arc<dyn AtomicCounter>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn write(&self, docs: &[Value]) -> Result<(), RuleError> {
        let raw = serde_json::to_string(docs)?;
        self.store
            .set(RULES_KEY, &raw, None, self.clock.now_ms())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RuleStore for SharedRuleStore {
    async fn load(&self) -> Result<Vec<Value>, RuleError> {
        match self.store.get(RULES_KEY, self.clock.now_ms()).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, rule: &RateLimitRule) -> Result<(), RuleError> {
        let mut docs = self.load().await?;
        upsert(&mut docs, rule)?;
        self.write(&docs).await
    }

    async fn delete(&self, key: &str) -> Result<bool, RuleError> {
        let mut docs = self.load().await?;
        if !remove(&mut docs, key) {
            return Ok(false);
        }
        self.write(&docs).await?;
        Ok(true)
    }
}
