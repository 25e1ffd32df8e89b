// Context store adapter with a cache-aside layer over durable storage

//! # Context Store Adapter
//!
//! Owns all reads and writes of per-agent conversation context. No other
//! component touches context records directly.
//!
//! ## Cache-aside
//!
//! `load` checks a bounded-TTL in-memory cache first and falls back to
//! the durable store on a miss. Writes (`save`, `append_turn`) go
//! through to the store synchronously and then **invalidate** the cache
//! entry rather than updating it, so the next `load` always observes
//! what was durably written.
//!
//! ## Versioned snapshots
//!
//! Context is stored as append-only versioned snapshots
//! (`CONTEXT#<version>`). A save writes version `n+1` with an
//! if-not-exists condition: two writers racing from the same base
//! version see exactly one succeed, the other failing with
//! `ConcurrentModification` so it can reload and retry. A per-agent
//! write lock serializes writers within this process for the duration
//! of the save.
//!
//! ## Summarization
//!
//! When a loaded context's turn count exceeds the configured threshold,
//! `load` condenses the oldest turns through the breaker-guarded
//! reasoning client before returning. Summarization failure never fails
//! the load; the unsummarized context is returned and a warning logged.

use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ContextSettings;
use crate::models::{AgentId, Context, Turn};
use crate::provider::{BreakerClient, ReasoningRequest};
use crate::storage::{keys, KeyValueStore, PutCondition, ScanOrder, StoredItem};
use crate::{ConductorError, Result};

struct CachedContext {
    context: Context,
    cached_at: Instant,
}

/// Cache-aside adapter over the durable context snapshots
pub struct ContextStore {
    store: Arc<dyn KeyValueStore>,
    settings: ContextSettings,
    cache: DashMap<AgentId, CachedContext>,
    write_locks: DashMap<AgentId, Arc<Mutex<()>>>,
    summarizer: Option<Arc<BreakerClient>>,
}

impl ContextStore {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: ContextSettings) -> Self {
        Self {
            store,
            settings,
            cache: DashMap::new(),
            write_locks: DashMap::new(),
            summarizer: None,
        }
    }

    /// Attach the breaker-guarded client used for summarization
    pub fn with_summarizer(mut self, client: Arc<BreakerClient>) -> Self {
        self.summarizer = Some(client);
        self
    }

    /// Load the agent's context, from cache when fresh.
    ///
    /// An agent without any stored context gets an empty one.
    pub async fn load(&self, agent_id: &AgentId) -> Result<Context> {
        if let Some(entry) = self.cache.get(agent_id) {
            if entry.cached_at.elapsed() < std::time::Duration::from_secs(self.settings.cache_ttl_secs)
            {
                debug!(agent_id = %agent_id, "context cache hit");
                return Ok(entry.context.clone());
            }
        }

        let context = self
            .load_latest(agent_id)
            .await?
            .unwrap_or_else(|| Context::new(agent_id.clone()));

        let context = if context.size_metric() > self.settings.summary_threshold {
            self.condense(context).await
        } else {
            context
        };

        self.cache.insert(
            agent_id.clone(),
            CachedContext {
                context: context.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(context)
    }

    /// Persist a new context version, then invalidate the cache entry.
    ///
    /// Returns the stored context carrying its assigned version. Fails
    /// with `ConcurrentModification` when another writer saved from the
    /// same base version first; the caller should reload and retry.
    pub async fn save(&self, context: &Context) -> Result<Context> {
        let agent_id = context.agent_id.clone();
        let lock = self.write_lock_for(&agent_id);
        let _guard = lock.lock().await;

        let stored = self.put_next_version(context).await?;
        self.cache.remove(&agent_id);
        Ok(stored)
    }

    /// Append one turn to the agent's durable context.
    ///
    /// Loads the latest snapshot (bypassing the cache so the write is
    /// based on durable state), extends it, and writes a new version.
    pub async fn append_turn(&self, agent_id: &AgentId, turn: Turn) -> Result<Context> {
        let lock = self.write_lock_for(agent_id);
        let _guard = lock.lock().await;

        let mut context = self
            .load_latest(agent_id)
            .await?
            .unwrap_or_else(|| Context::new(agent_id.clone()));
        context.push_turn(turn);

        let stored = self.put_next_version(&context).await?;
        self.cache.remove(agent_id);
        Ok(stored)
    }

    /// Drop the cached entry for an agent, if any
    pub fn invalidate(&self, agent_id: &AgentId) {
        self.cache.remove(agent_id);
    }

    fn write_lock_for(&self, agent_id: &AgentId) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(agent_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_latest(&self, agent_id: &AgentId) -> Result<Option<Context>> {
        let items = self
            .store
            .query_prefix(
                &keys::agent_pk(agent_id),
                keys::SK_CONTEXT,
                ScanOrder::Descending,
                Some(1),
            )
            .await?;
        items.first().map(|item| item.decode()).transpose()
    }

    async fn put_next_version(&self, context: &Context) -> Result<Context> {
        let mut next = context.clone();
        next.version = context.version + 1;

        let item = StoredItem::encode(
            keys::agent_pk(&next.agent_id),
            keys::context_sk(next.version),
            &next,
        )?;
        match self.store.put(item, PutCondition::IfNotExists).await {
            Ok(()) => Ok(next),
            Err(ConductorError::ConditionalCheck { .. }) => Err(
                ConductorError::ConcurrentModification(next.agent_id.to_string()),
            ),
            Err(other) => Err(other),
        }
    }

    /// Summarize the oldest turns through the reasoning client. Any
    /// failure degrades to returning the context unsummarized.
    async fn condense(&self, context: Context) -> Context {
        let Some(client) = &self.summarizer else {
            debug!(
                agent_id = %context.agent_id,
                turns = context.size_metric(),
                "context over threshold but no summarizer configured"
            );
            return context;
        };

        let split = context
            .turns
            .len()
            .saturating_sub(self.settings.retain_recent);
        let mut prompt = String::from(
            "Summarize the following conversation history into key facts, \
             decisions, and context that should be remembered. \
             Return a concise summary.\n\n",
        );
        for turn in &context.turns[..split] {
            let _ = writeln!(prompt, "{:?}: {}", turn.role, turn.content);
        }

        match client.call(&ReasoningRequest::from_prompt(&prompt)).await {
            Ok(response) => {
                let condensed = context.summarized(&response.content, self.settings.retain_recent);
                match self.put_next_version(&condensed).await {
                    Ok(stored) => stored,
                    Err(error) => {
                        warn!(
                            agent_id = %context.agent_id,
                            %error,
                            "failed to persist summarized context, returning unsummarized"
                        );
                        context
                    }
                }
            }
            Err(error) => {
                warn!(
                    agent_id = %context.agent_id,
                    %error,
                    "context summarization failed, returning unsummarized"
                );
                context
            }
        }
    }
}
