// Storage abstraction for the orchestration engine
// Defines the key-value contract durable backends must satisfy

//! # Storage Abstraction Layer
//!
//! The engine persists every durable entity (tasks, checkpoints, context
//! snapshots, outbox entries, coordination progress) through one narrow
//! contract: a key-value store with composite keys, conditional writes,
//! and ordered prefix queries.
//!
//! ## Key scheme
//!
//! Keys are composite: a partition key naming the owning entity
//! (`AGENT#<id>`, `COORDINATION#<id>`, `ROUTER`) and a sort key naming
//! the item within it (`TASK#<id>`, `CONTEXT#<version>`,
//! `OUTBOX#<seq>`). Sort keys order sub-items, so prefix queries return
//! them oldest-first without a secondary index.
//!
//! ## Conditional writes
//!
//! `put` with [`PutCondition::IfNotExists`] is the concurrency primitive:
//! two writers racing on the same key see exactly one succeed, the other
//! failing with `ConditionalCheck`. Callers map that onto their own
//! conflict handling (reload and retry for context saves).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::{ConductorError, Result};

pub mod tasks;

pub use tasks::TaskStore;

/// Composite key prefixes shared across the engine
pub mod keys {
    use crate::models::{AgentId, TaskId};

    pub const PK_AGENT: &str = "AGENT#";
    pub const PK_COORDINATION: &str = "COORDINATION#";
    /// Single partition holding the event outbox and dead-letter log
    pub const PK_ROUTER: &str = "ROUTER";

    pub const SK_TASK: &str = "TASK#";
    pub const SK_CONTEXT: &str = "CONTEXT#";
    pub const SK_OUTBOX: &str = "OUTBOX#";
    pub const SK_DEADLETTER: &str = "DEADLETTER#";
    pub const SK_PROGRESS: &str = "PROGRESS";

    pub fn agent_pk(agent_id: &AgentId) -> String {
        format!("{PK_AGENT}{agent_id}")
    }

    pub fn task_sk(task_id: &TaskId) -> String {
        format!("{SK_TASK}{task_id}")
    }

    /// Zero-padded so lexicographic sort-key order equals numeric order
    pub fn context_sk(version: u64) -> String {
        format!("{SK_CONTEXT}{version:020}")
    }

    pub fn outbox_sk(sequence: u64) -> String {
        format!("{SK_OUTBOX}{sequence:020}")
    }

    pub fn deadletter_sk(sequence: u64) -> String {
        format!("{SK_DEADLETTER}{sequence:020}")
    }

    pub fn coordination_pk(coordination_id: &str) -> String {
        format!("{PK_COORDINATION}{coordination_id}")
    }
}

/// A stored record: composite key plus JSON body
#[derive(Debug, Clone)]
pub struct StoredItem {
    pub pk: String,
    pub sk: String,
    pub body: Value,
}

impl StoredItem {
    pub fn new(pk: String, sk: String, body: Value) -> Self {
        Self { pk, sk, body }
    }

    /// Serialize an entity into a stored record
    pub fn encode<T: Serialize>(pk: String, sk: String, entity: &T) -> Result<Self> {
        Ok(Self {
            pk,
            sk,
            body: serde_json::to_value(entity)?,
        })
    }

    /// Deserialize the record body back into an entity
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Write condition for `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional upsert
    None,
    /// Fail with `ConditionalCheck` when the key already exists
    IfNotExists,
}

/// Sort-key scan direction for prefix queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Ascending,
    Descending,
}

/// Contract every durable backend must satisfy.
///
/// All operations are async and fallible; `get` distinguishes "missing"
/// (`Ok(None)`) from "operation failed" (`Err`).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a single item by its composite key
    async fn get(&self, pk: &str, sk: &str) -> Result<Option<StoredItem>>;

    /// Put an item, optionally guarded by a write condition
    async fn put(&self, item: StoredItem, condition: PutCondition) -> Result<()>;

    /// Query items under one partition key whose sort key starts with
    /// `sk_prefix`, ordered by sort key
    async fn query_prefix(
        &self,
        pk: &str,
        sk_prefix: &str,
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<StoredItem>>;

    /// Delete an item by its composite key
    async fn delete(&self, pk: &str, sk: &str) -> Result<()>;
}

/// In-memory store for development and tests.
///
/// A `BTreeMap` keyed by `(pk, sk)` keeps items in sort-key order, so
/// prefix queries behave like the real backend's ordered scans. Not
/// persistent across restarts; checkpoint/resume tests share one
/// instance to model durability.
#[derive(Default)]
pub struct InMemoryStore {
    items: RwLock<BTreeMap<(String, String), Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items, for test assertions
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, pk: &str, sk: &str) -> Result<Option<StoredItem>> {
        let items = self.items.read().await;
        Ok(items
            .get(&(pk.to_string(), sk.to_string()))
            .map(|body| StoredItem::new(pk.to_string(), sk.to_string(), body.clone())))
    }

    async fn put(&self, item: StoredItem, condition: PutCondition) -> Result<()> {
        let mut items = self.items.write().await;
        let key = (item.pk.clone(), item.sk.clone());
        if condition == PutCondition::IfNotExists && items.contains_key(&key) {
            return Err(ConductorError::ConditionalCheck {
                pk: item.pk,
                sk: item.sk,
            });
        }
        items.insert(key, item.body);
        Ok(())
    }

    async fn query_prefix(
        &self,
        pk: &str,
        sk_prefix: &str,
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<StoredItem>> {
        let items = self.items.read().await;
        let mut matched: Vec<StoredItem> = items
            .range((pk.to_string(), sk_prefix.to_string())..)
            .take_while(|((item_pk, item_sk), _)| item_pk == pk && item_sk.starts_with(sk_prefix))
            .map(|((item_pk, item_sk), body)| {
                StoredItem::new(item_pk.clone(), item_sk.clone(), body.clone())
            })
            .collect();

        if order == ScanOrder::Descending {
            matched.reverse();
        }
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn delete(&self, pk: &str, sk: &str) -> Result<()> {
        let mut items = self.items.write().await;
        items.remove(&(pk.to_string(), sk.to_string()));
        Ok(())
    }
}
