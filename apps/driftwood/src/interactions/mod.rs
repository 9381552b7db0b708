//! Bulk loader and cache for per-entity engagement state.
//!
//! The visible set (discussion + topics on screen + their sample ideas)
//! changes constantly; the cache keys each load by a canonical serialization
//! of the requested set so an unchanged set never re-triggers the network.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::api::ApiError;
use crate::model::{EntityRef, InteractionState, Topic};

#[derive(Debug, Clone, Deserialize)]
pub struct InteractionEntry {
    pub entity: EntityRef,
    pub state: InteractionState,
}

/// Seam to the engagement service; mocked in tests.
#[async_trait]
pub trait InteractionBackend: Send + Sync {
    async fn fetch_bulk(
        &self,
        base_url: &Url,
        refs: &[EntityRef],
    ) -> Result<Vec<InteractionEntry>, ApiError>;
}

pub struct ReqwestInteractionBackend {
    client: reqwest::Client,
}

impl ReqwestInteractionBackend {
    pub fn new() -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl InteractionBackend for ReqwestInteractionBackend {
    async fn fetch_bulk(
        &self,
        base_url: &Url,
        refs: &[EntityRef],
    ) -> Result<Vec<InteractionEntry>, ApiError> {
        let url = base_url
            .join("interactions/bulk")
            .map_err(|err| ApiError::InvalidConfig(format!("invalid interactions endpoint: {err}")))?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "entities": refs }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(response.status()));
        }
        #[derive(Deserialize)]
        struct BulkResponse {
            #[serde(default)]
            entries: Vec<InteractionEntry>,
        }
        Ok(response.json::<BulkResponse>().await?.entries)
    }
}

/// Compute the entity set a view needs: the discussion itself, every visible
/// topic, and every idea nested under a visible topic, deduplicated.
pub fn required_refs(discussion_id: &str, visible_topics: &[Arc<Topic>]) -> Vec<EntityRef> {
    let mut refs = Vec::with_capacity(1 + visible_topics.len() * 4);
    refs.push(EntityRef::discussion(discussion_id));
    for topic in visible_topics {
        refs.push(EntityRef::topic(topic.id.clone()));
        for idea in &topic.sample_ideas {
            refs.push(EntityRef::idea(idea.id.clone()));
        }
    }
    refs.sort();
    refs.dedup();
    refs
}

fn set_key(refs: &[EntityRef]) -> String {
    // Called with the canonical (sorted, deduplicated) set.
    let mut key = String::with_capacity(refs.len() * 12);
    for entity in refs {
        key.push_str(&entity.to_string());
        key.push('|');
    }
    key
}

/// Keys guarding bulk-load dedup: a set equal to the one currently on the
/// wire, or to the last one loaded, never re-triggers the network.
#[derive(Default)]
struct LoadKeys {
    in_flight: Option<String>,
    loaded: Option<String>,
}

pub struct InteractionStateCache {
    base_url: Url,
    backend: Arc<dyn InteractionBackend>,
    entries: RwLock<HashMap<EntityRef, InteractionState>>,
    keys: Mutex<LoadKeys>,
}

impl InteractionStateCache {
    pub fn new(base_url: Url, backend: Arc<dyn InteractionBackend>) -> Self {
        Self {
            base_url,
            backend,
            entries: RwLock::new(HashMap::new()),
            keys: Mutex::new(LoadKeys::default()),
        }
    }

    /// Fetch engagement state for the given set in one batched request.
    ///
    /// The set is canonicalized (sorted, deduplicated) first; a set equal to
    /// the one currently in flight or to the last successfully loaded one is
    /// an idempotent no-op. Failures are swallowed (warn log only):
    /// consumers fall back to the zero-state and may retry per entity on
    /// their own.
    pub async fn load_bulk(&self, mut refs: Vec<EntityRef>) {
        if refs.is_empty() {
            return;
        }
        refs.sort();
        refs.dedup();
        let key = set_key(&refs);
        {
            let mut keys = self.keys.lock();
            if keys.loaded.as_deref() == Some(key.as_str())
                || keys.in_flight.as_deref() == Some(key.as_str())
            {
                return;
            }
            keys.in_flight = Some(key.clone());
        }

        let result = self.backend.fetch_bulk(&self.base_url, &refs).await;

        let mut keys = self.keys.lock();
        // A clear() while the request was on the wire drops the result.
        let current = keys.in_flight.as_deref() == Some(key.as_str());
        if current {
            keys.in_flight = None;
        }
        match result {
            Ok(loaded) if current => {
                let mut entries = self.entries.write();
                for entry in loaded {
                    entries.insert(entry.entity, entry.state);
                }
                keys.loaded = Some(key);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    target = "driftwood::interactions",
                    error = %err,
                    refs = refs.len(),
                    "bulk interaction load failed; keeping prior state"
                );
            }
        }
    }

    pub fn get(&self, entity: &EntityRef) -> Option<InteractionState> {
        self.entries.read().get(entity).cloned()
    }

    /// Optimistic local toggle from the UI action layer: the snapshot for
    /// the entity is replaced wholesale.
    pub fn apply_local(&self, entity: EntityRef, state: InteractionState) {
        self.entries.write().insert(entity, state);
    }

    pub fn is_loading(&self) -> bool {
        self.keys.lock().in_flight.is_some()
    }

    /// Drop everything tied to the current view, including any in-flight
    /// load's claim to commit.
    pub fn clear(&self) {
        self.entries.write().clear();
        *self.keys.lock() = LoadKeys::default();
    }
}
