//! Run configuration and the fit-once, transform-many pipeline.
//!
//! [`Pipeline::fit`] learns the vocabulary, the numeric ranges and the
//! projection from the complete item corpus in one pass. Everything after
//! that (single records, later batches, the index build) is a pure transform
//! through the same [`EmbeddingModel`], which keeps all embeddings in one
//! vector space.

use crate::encoder::{EncoderConfig, FeatureEncoder, FittedEncoder, ItemSchema};
use crate::reducer::{DimensionalityReducer, FittedReducer, ReducerConfig};
use crate::vector::VectorIndex;
use crate::{EmbedRecError, ItemRecord, Result, DEFAULT_HISTORY_LIMIT};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const ENV_MAX_FEATURES: &str = "EMBEDREC_TFIDF_MAX_FEATURES";
pub const ENV_PCA_COMPONENTS: &str = "EMBEDREC_PCA_COMPONENTS";
pub const ENV_TOP_K: &str = "EMBEDREC_TOP_K";
pub const ENV_HISTORY_LIMIT: &str = "EMBEDREC_HISTORY_LIMIT";
pub const ENV_SPLIT_RATIO: &str = "EMBEDREC_TRAIN_SPLIT_RATIO";
pub const ENV_EVAL_K: &str = "EMBEDREC_EVAL_K";

/// Every tunable of a build, serve and evaluate run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub encoder: EncoderConfig,
    pub reducer: ReducerConfig,
    /// Result count for serving queries.
    pub top_k: usize,
    /// Most recent interactions used to form a user query.
    pub history_limit: usize,
    /// Fraction of interactions (by time) assigned to training.
    pub split_ratio: f64,
    /// K for Precision@K / Recall@K.
    pub eval_k: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::default(),
            reducer: ReducerConfig::default(),
            top_k: 5,
            history_limit: DEFAULT_HISTORY_LIMIT,
            split_ratio: 0.8,
            eval_k: 10,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by any `EMBEDREC_*` variable that is set.
    ///
    /// # Errors
    /// [`EmbedRecError::InvalidConfig`] if a variable is set but does not
    /// parse, or the resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, ENV_MAX_FEATURES)? {
            config.encoder.max_features = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_PCA_COMPONENTS)? {
            config.reducer.n_components = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_TOP_K)? {
            config.top_k = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_HISTORY_LIMIT)? {
            config.history_limit = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_SPLIT_RATIO)? {
            config.split_ratio = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_EVAL_K)? {
            config.eval_k = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.encoder.validate()?;
        if self.reducer.n_components == 0 {
            return Err(EmbedRecError::InvalidConfig(
                "`n_components` must be >= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.split_ratio) {
            return Err(EmbedRecError::InvalidConfig(format!(
                "`split_ratio` must lie in [0, 1], got {}",
                self.split_ratio
            )));
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| EmbedRecError::InvalidConfig(format!("{key}={raw:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Fitted model
// ---------------------------------------------------------------------------

/// A fitted encoder and reducer: everything needed to embed an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub encoder: FittedEncoder,
    pub reducer: FittedReducer,
}

impl EmbeddingModel {
    /// Embedding dimension `D`.
    pub fn dim(&self) -> usize {
        self.reducer.output_dim()
    }

    /// Embed one record. The result is not normalised; the index does that.
    pub fn embed(&self, record: &ItemRecord) -> Result<Vec<f32>> {
        let features = self.encoder.transform(record)?;
        self.reducer.transform(&features)
    }

    /// Embed many records, preserving input order.
    pub fn embed_all(&self, records: &[ItemRecord]) -> Result<Vec<Vec<f32>>> {
        let features = self.encoder.transform_all(records)?;
        self.reducer.transform_all(&features)
    }

    /// Embed `records` and index them by their ids.
    pub fn build_index(&self, records: &[ItemRecord]) -> Result<VectorIndex> {
        let vectors = self.embed_all(records)?;
        let ids = records.iter().map(|r| r.id.clone()).collect();
        VectorIndex::build(ids, vectors)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Stateful wrapper that refuses to transform before it has been fit.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    schema: ItemSchema,
    model: Option<EmbeddingModel>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, schema: ItemSchema) -> Self {
        Self {
            config,
            schema,
            model: None,
        }
    }

    /// Resume from a previously fitted (e.g. stored) model.
    pub fn from_model(config: PipelineConfig, model: EmbeddingModel) -> Self {
        Self {
            config,
            schema: model.encoder.schema().clone(),
            model: Some(model),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn schema(&self) -> &ItemSchema {
        &self.schema
    }

    /// Fit the encoder and then the reducer on the whole corpus.
    ///
    /// Refitting replaces the previous model entirely.
    pub fn fit(&mut self, corpus: &[ItemRecord]) -> Result<&EmbeddingModel> {
        self.config.validate()?;
        let encoder =
            FeatureEncoder::new(self.config.encoder.clone(), self.schema.clone()).fit(corpus)?;
        let features = encoder.transform_all(corpus)?;
        let reducer = DimensionalityReducer::new(self.config.reducer).fit(&features)?;
        tracing::info!(
            items = corpus.len(),
            width = encoder.width(),
            dim = reducer.output_dim(),
            "pipeline fitted"
        );
        Ok(self.model.insert(EmbeddingModel { encoder, reducer }))
    }

    /// The fitted model.
    ///
    /// # Errors
    /// [`EmbedRecError::NotFitted`] before [`fit`](Self::fit).
    pub fn model(&self) -> Result<&EmbeddingModel> {
        self.model
            .as_ref()
            .ok_or_else(|| EmbedRecError::NotFitted("pipeline has not been fit".into()))
    }

    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    pub fn transform(&self, record: &ItemRecord) -> Result<Vec<f32>> {
        self.model()?.embed(record)
    }

    pub fn transform_all(&self, records: &[ItemRecord]) -> Result<Vec<Vec<f32>>> {
        self.model()?.embed_all(records)
    }

    pub fn build_index(&self, records: &[ItemRecord]) -> Result<VectorIndex> {
        self.model()?.build_index(records)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
