//! Offline retrieval evaluation: Precision@K / Recall@K on a temporal split.
//!
//! All interactions are sorted by time and cut once, globally, at
//! `floor(ratio * N)`. Users are scored only when they appear on both sides
//! of the cut; a user whose training history yields no recommendation is
//! counted as skipped rather than scored as zero, so the skip count reports
//! coverage separately from ranking quality.

use crate::recommend::RecommendationEngine;
use crate::{EmbedRecError, Interaction, ItemId, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Interactions partitioned at one global time cutoff.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainTestSplit {
    /// The earliest `floor(ratio * N)` interactions, oldest first.
    pub train: Vec<Interaction>,
    /// The remaining interactions, oldest first.
    pub test: Vec<Interaction>,
    /// Timestamp of the last training interaction; `None` if `train` is empty.
    pub cutoff: Option<DateTime<Utc>>,
}

/// Aggregate evaluation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub skipped_users: usize,
    pub k: usize,
    pub evaluated_users: usize,
    /// Users present in both training and test histories.
    pub candidate_users: usize,
}

/// Split `interactions` by time. Equal timestamps keep their input order.
///
/// # Errors
/// [`EmbedRecError::InvalidConfig`] if `ratio` is not within `[0, 1]`.
pub fn temporal_split(interactions: &[Interaction], ratio: f64) -> Result<TrainTestSplit> {
    if !(0.0..=1.0).contains(&ratio) {
        return Err(EmbedRecError::InvalidConfig(format!(
            "split ratio must lie in [0, 1], got {ratio}"
        )));
    }
    let mut train = interactions.to_vec();
    train.sort_by_key(|i| i.timestamp);
    let split_at = ((ratio * train.len() as f64).floor() as usize).min(train.len());
    let test = train.split_off(split_at);
    let cutoff = train.last().map(|i| i.timestamp);
    tracing::info!(
        train = train.len(),
        test = test.len(),
        cutoff = ?cutoff,
        "temporal split"
    );
    Ok(TrainTestSplit {
        train,
        test,
        cutoff,
    })
}

/// Group item ids by user, preserving each user's interaction order.
pub fn per_user_history(interactions: &[Interaction]) -> BTreeMap<String, Vec<ItemId>> {
    let mut histories: BTreeMap<String, Vec<ItemId>> = BTreeMap::new();
    for interaction in interactions {
        histories
            .entry(interaction.user_id.clone())
            .or_default()
            .push(interaction.item_id.clone());
    }
    histories
}

/// Fraction of the `k` recommendation slots that hit a relevant item.
/// Defined as 0 when `k == 0`.
pub fn precision_at_k(recommended: &[ItemId], relevant: &HashSet<&ItemId>, k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    hits(recommended, relevant) as f64 / k as f64
}

/// Fraction of relevant items that were recommended. Defined as 0 when there
/// is nothing relevant.
pub fn recall_at_k(recommended: &[ItemId], relevant: &HashSet<&ItemId>) -> f64 {
    if relevant.is_empty() {
        return 0.0;
    }
    hits(recommended, relevant) as f64 / relevant.len() as f64
}

fn hits(recommended: &[ItemId], relevant: &HashSet<&ItemId>) -> usize {
    let unique: HashSet<&ItemId> = recommended.iter().collect();
    unique.iter().filter(|id| relevant.contains(*id)).count()
}

enum UserOutcome {
    Scored { precision: f64, recall: f64 },
    Skipped,
}

/// Batch scorer running user queries through a [`RecommendationEngine`].
pub struct OfflineEvaluator<'a> {
    engine: &'a RecommendationEngine,
}

impl<'a> OfflineEvaluator<'a> {
    pub fn new(engine: &'a RecommendationEngine) -> Self {
        Self { engine }
    }

    /// Split, group by user, and evaluate in one call.
    pub fn run(&self, interactions: &[Interaction], ratio: f64, k: usize) -> Result<EvaluationReport> {
        let split = temporal_split(interactions, ratio)?;
        let train = per_user_history(&split.train);
        let test = per_user_history(&split.test);
        self.evaluate(&train, &test, k)
    }

    /// Score every user present in both `train` and `test`.
    ///
    /// Users are scored in parallel; the per-user results are aggregated in
    /// user order with sequential summation, so the report is reproducible.
    ///
    /// # Errors
    /// Propagates any engine error other than the "no usable signal" cases
    /// ([`EmbedRecError::NotFound`], [`EmbedRecError::DegenerateVector`]),
    /// which count as skips.
    pub fn evaluate(
        &self,
        train: &BTreeMap<String, Vec<ItemId>>,
        test: &BTreeMap<String, Vec<ItemId>>,
        k: usize,
    ) -> Result<EvaluationReport> {
        let users: Vec<(&String, &Vec<ItemId>, &Vec<ItemId>)> = train
            .iter()
            .filter_map(|(user, history)| test.get(user).map(|truth| (user, history, truth)))
            .collect();
        tracing::info!(users = users.len(), k, "evaluating users present in train and test");

        let outcomes: Vec<Result<UserOutcome>> = users
            .par_iter()
            .map(|&(user, history, truth)| self.score_user(user, history, truth, k))
            .collect();

        let mut precision_sum = 0.0;
        let mut recall_sum = 0.0;
        let mut evaluated = 0usize;
        let mut skipped = 0usize;
        for outcome in outcomes {
            match outcome? {
                UserOutcome::Scored { precision, recall } => {
                    precision_sum += precision;
                    recall_sum += recall;
                    evaluated += 1;
                }
                UserOutcome::Skipped => skipped += 1,
            }
        }

        let mean = |sum: f64| if evaluated > 0 { sum / evaluated as f64 } else { 0.0 };
        let report = EvaluationReport {
            precision_at_k: mean(precision_sum),
            recall_at_k: mean(recall_sum),
            skipped_users: skipped,
            k,
            evaluated_users: evaluated,
            candidate_users: users.len(),
        };
        tracing::info!(
            precision = report.precision_at_k,
            recall = report.recall_at_k,
            evaluated = report.evaluated_users,
            skipped = report.skipped_users,
            k,
            "offline evaluation complete"
        );
        Ok(report)
    }

    fn score_user(
        &self,
        user: &str,
        history: &[ItemId],
        truth: &[ItemId],
        k: usize,
    ) -> Result<UserOutcome> {
        let recommended = match self.engine.recommend_for_user(history, k) {
            Ok(recs) => recs,
            Err(EmbedRecError::NotFound(reason) | EmbedRecError::DegenerateVector(reason)) => {
                tracing::debug!(user, %reason, "skipping user");
                return Ok(UserOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };
        if recommended.is_empty() {
            tracing::debug!(user, "skipping user with no recommendations");
            return Ok(UserOutcome::Skipped);
        }

        let relevant: HashSet<&ItemId> = truth.iter().collect();
        Ok(UserOutcome::Scored {
            precision: precision_at_k(&recommended, &relevant, k),
            recall: recall_at_k(&recommended, &relevant),
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
