//! embedrec: item embeddings and exact nearest-neighbour recommendation.
//!
//! Items are encoded from their declared text and numeric attributes
//! (TF-IDF + min-max scaling), compressed with a principal-component
//! projection, and L2-normalised into a flat [`VectorIndex`]. Queries are
//! exact k-nearest-neighbour scans over that index.
//!
//! A run is two-phase: the [`Pipeline`] is fit **once** on the full item
//! corpus, then every item is transformed with the same fitted state so all
//! embeddings share one vector space. The resulting index is immutable; a
//! rebuild replaces it wholesale through [`Recommender::install`].
//!
//! # Quick start
//!
//! ```rust
//! use embedrec::{ItemRecord, ItemSchema, Pipeline, PipelineConfig, Recommender};
//!
//! let schema = ItemSchema::new(["title"], ["price"]);
//! let corpus = vec![
//!     ItemRecord::new("1").with_text("title", "red trail running shoe").with_number("price", 40.0),
//!     ItemRecord::new("2").with_text("title", "blue trail running shoe").with_number("price", 45.0),
//!     ItemRecord::new("3").with_text("title", "cast iron frying pan").with_number("price", 30.0),
//! ];
//!
//! let mut pipeline = Pipeline::new(PipelineConfig::default(), schema);
//! pipeline.fit(&corpus).unwrap();
//! let index = pipeline.build_index(&corpus).unwrap();
//!
//! let recommender = Recommender::new();
//! recommender.install(index).unwrap();
//!
//! let similar = recommender.similar_items("1", 1).unwrap();
//! assert_eq!(similar[0].as_str(), "2");
//! ```

pub mod encoder;
pub mod evaluate;
pub mod pipeline;
pub mod recommend;
pub mod reducer;
pub mod store;
pub mod vector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

pub use encoder::{EncoderConfig, FeatureEncoder, FittedEncoder, ItemSchema, UnknownFieldPolicy};
pub use evaluate::{EvaluationReport, OfflineEvaluator, TrainTestSplit};
pub use pipeline::{EmbeddingModel, Pipeline, PipelineConfig};
pub use recommend::RecommendationEngine;
pub use reducer::{DimensionalityReducer, FittedReducer, ReducerConfig};
pub use store::ModelStore;
pub use vector::{Neighbor, VectorIndex};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EmbedRecError {
    #[error("not fitted: {0}")]
    NotFitted(String),
    #[error("empty corpus: {0}")]
    EmptyCorpus(String),
    #[error("duplicate identifier: {0}")]
    DuplicateIdentifier(ItemId),
    #[error("degenerate vector: {0}")]
    DegenerateVector(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("unknown field `{field}` on item {item}")]
    UnknownField { item: ItemId, field: String },
    #[error("numeric column `{field}` on item {item} was absent when the encoder was fit")]
    UnseenNumericColumn { item: ItemId, field: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EmbedRecError>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Opaque item identifier.
///
/// Identifiers are compared as strings and never reinterpreted: `"007"` and
/// `"7"` are different items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for ItemId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One item of the training corpus.
///
/// Field names are matched against an [`ItemSchema`]; a record may omit any
/// declared field. Records are read-only once handed to [`Pipeline::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    /// Textual attributes, keyed by field name.
    #[serde(default)]
    pub text: BTreeMap<String, String>,
    /// Numeric attributes, keyed by field name.
    #[serde(default)]
    pub numeric: BTreeMap<String, f64>,
}

impl ItemRecord {
    pub fn new(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            text: BTreeMap::new(),
            numeric: BTreeMap::new(),
        }
    }

    pub fn with_text(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.text.insert(field.into(), value.into());
        self
    }

    pub fn with_number(mut self, field: impl Into<String>, value: f64) -> Self {
        self.numeric.insert(field.into(), value);
        self
    }
}

/// A timestamped user → item interaction from the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub user_id: String,
    pub item_id: ItemId,
    /// Event time. Serialised as epoch milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Interaction {
    pub fn new(
        user_id: impl Into<String>,
        item_id: impl Into<ItemId>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            timestamp,
        }
    }
}

/// One user's interactions, kept in chronological order.
///
/// Serving reads it most-recent-first ([`UserHistory::most_recent_first`]);
/// evaluation reads it chronologically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserHistory {
    user_id: String,
    events: Vec<(ItemId, DateTime<Utc>)>,
}

impl UserHistory {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            events: Vec::new(),
        }
    }

    /// Collect the history of `user_id` out of a mixed interaction log.
    pub fn from_interactions(user_id: &str, interactions: &[Interaction]) -> Self {
        let mut history = Self::new(user_id);
        for interaction in interactions.iter().filter(|i| i.user_id == user_id) {
            history.push(interaction.item_id.clone(), interaction.timestamp);
        }
        history
    }

    /// Record an event. Events with equal timestamps keep insertion order.
    pub fn push(&mut self, item_id: impl Into<ItemId>, at: DateTime<Utc>) {
        let pos = self.events.partition_point(|(_, t)| *t <= at);
        self.events.insert(pos, (item_id.into(), at));
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Item ids oldest first.
    pub fn chronological(&self) -> impl Iterator<Item = &ItemId> {
        self.events.iter().map(|(id, _)| id)
    }

    /// The `limit` most recent item ids, newest first.
    pub fn most_recent_first(&self, limit: usize) -> Vec<ItemId> {
        self.events
            .iter()
            .rev()
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Serving handle
// ---------------------------------------------------------------------------

/// Number of recent interactions used to build a user query by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Shared, swappable front door for recommendation queries.
///
/// Holds the current [`RecommendationEngine`] generation behind an `Arc`.
/// Queries clone the `Arc` and run without holding the lock, so a concurrent
/// [`install`] never disturbs a query already in flight: it finishes against
/// the generation it started with.
///
/// [`install`]: Recommender::install
pub struct Recommender {
    engine: RwLock<Option<Arc<RecommendationEngine>>>,
    history_limit: usize,
}

impl Default for Recommender {
    fn default() -> Self {
        Self::new()
    }
}

impl Recommender {
    /// Create a handle with no index installed yet.
    pub fn new() -> Self {
        Self {
            engine: RwLock::new(None),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Limit user queries to the `limit` most recent interactions.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Atomically replace the served index with `index`.
    pub fn install(&self, index: VectorIndex) -> Result<()> {
        let (items, dim) = (index.len(), index.dim());
        let engine = Arc::new(RecommendationEngine::new(index));
        *self
            .engine
            .write()
            .map_err(|_| EmbedRecError::Internal("recommender lock poisoned".into()))? =
            Some(engine);
        tracing::info!(items, dim, "installed index generation");
        Ok(())
    }

    /// The engine currently being served.
    ///
    /// Returns [`EmbedRecError::NotFitted`] until an index has been installed.
    pub fn snapshot(&self) -> Result<Arc<RecommendationEngine>> {
        self.engine
            .read()
            .map_err(|_| EmbedRecError::Internal("recommender lock poisoned".into()))?
            .clone()
            .ok_or_else(|| EmbedRecError::NotFitted("no index has been installed".into()))
    }

    /// Items most similar to `item_id`, excluding the item itself.
    pub fn similar_items(&self, item_id: &str, k: usize) -> Result<Vec<ItemId>> {
        self.snapshot()?.similar_items(item_id, k)
    }

    /// Recommendations for an explicit list of interacted item ids.
    pub fn recommend_for_user<I: AsRef<str>>(&self, history: &[I], k: usize) -> Result<Vec<ItemId>> {
        self.snapshot()?.recommend_for_user(history, k)
    }

    /// Recommendations from the most recent part of a [`UserHistory`].
    pub fn recommend_for_history(&self, history: &UserHistory, k: usize) -> Result<Vec<ItemId>> {
        let recent = history.most_recent_first(self.history_limit);
        tracing::debug!(
            user = history.user_id(),
            events = history.len(),
            used = recent.len(),
            "building user query"
        );
        self.recommend_for_user(&recent, k)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
