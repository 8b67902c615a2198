//! Item-to-item and user-to-item queries over a built [`VectorIndex`].
//!
//! Both queries over-fetch from the index by exactly the number of ids they
//! must exclude (the query item itself, or the user's seen items), then
//! filter. That always leaves at least `k` candidates when the index is large
//! enough, without any retry loop.

use crate::vector::{normalize, VectorIndex};
use crate::{EmbedRecError, ItemId, Result};
use std::collections::HashSet;

/// Stateless query layer over one immutable index generation.
#[derive(Debug, Clone)]
pub struct RecommendationEngine {
    index: VectorIndex,
}

impl RecommendationEngine {
    pub fn new(index: VectorIndex) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// The `k` items nearest to `item_id`, nearest first, never including
    /// `item_id` itself.
    ///
    /// # Errors
    /// [`EmbedRecError::NotFound`] if `item_id` is not indexed.
    pub fn similar_items(&self, item_id: &str, k: usize) -> Result<Vec<ItemId>> {
        let query = self.index.reconstruct(item_id)?;
        let hits = self.index.search(query, k.saturating_add(1))?;
        let similar: Vec<ItemId> = hits
            .into_iter()
            .filter(|hit| hit.id.as_str() != item_id)
            .take(k)
            .map(|hit| hit.id)
            .collect();
        tracing::debug!(item = item_id, k, found = similar.len(), "similar items");
        Ok(similar)
    }

    /// The `k` items nearest to the mean of the user's history vectors,
    /// excluding every history item.
    ///
    /// History ids that are not indexed are ignored. Repeated ids weigh into
    /// the mean once per occurrence.
    ///
    /// # Errors
    /// - [`EmbedRecError::NotFound`] if no history id is indexed (cold start).
    /// - [`EmbedRecError::DegenerateVector`] if the history vectors cancel
    ///   out to a zero mean.
    pub fn recommend_for_user<I: AsRef<str>>(&self, history: &[I], k: usize) -> Result<Vec<ItemId>> {
        let positions: Vec<usize> = history
            .iter()
            .filter_map(|id| self.index.position(id.as_ref()))
            .collect();
        if positions.is_empty() {
            return Err(EmbedRecError::NotFound(format!(
                "none of the {} history items are indexed",
                history.len()
            )));
        }

        let mut query = vec![0.0f32; self.index.dim()];
        for &pos in &positions {
            if let Some(vector) = self.index.vector_at(pos) {
                for (q, v) in query.iter_mut().zip(vector) {
                    *q += v;
                }
            }
        }
        let count = positions.len() as f32;
        query.iter_mut().for_each(|q| *q /= count);
        if !normalize(&mut query) {
            return Err(EmbedRecError::DegenerateVector(
                "user history vectors average to zero".into(),
            ));
        }

        let seen: HashSet<&str> = positions
            .iter()
            .filter_map(|&pos| self.index.id_at(pos))
            .map(ItemId::as_str)
            .collect();
        let hits = self
            .index
            .search(&query, k.saturating_add(positions.len()))?;

        Ok(hits
            .into_iter()
            .filter(|hit| !seen.contains(hit.id.as_str()))
            .take(k)
            .map(|hit| hit.id)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RecommendationEngine {
        let index = VectorIndex::build(
            vec!["1".into(), "2".into(), "3".into()],
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.9, 0.1]],
        )
        .unwrap();
        RecommendationEngine::new(index)
    }

    fn grid_engine(n: usize) -> RecommendationEngine {
        let ids: Vec<ItemId> = (0..n).map(|i| ItemId::new(format!("item-{i}"))).collect();
        let vectors: Vec<Vec<f32>> = (0..n)
            .map(|i| {
                let angle = i as f32 * 0.37;
                vec![angle.cos(), angle.sin(), 0.5]
            })
            .collect();
        RecommendationEngine::new(VectorIndex::build(ids, vectors).unwrap())
    }

    // ------------------------------------------------------------------
    // similar_items
    // ------------------------------------------------------------------

    #[test]
    fn similar_items_prefers_closer_vector() {
        assert_eq!(engine().similar_items("1", 1).unwrap(), vec![ItemId::from("3")]);
    }

    #[test]
    fn similar_items_never_returns_query_item() {
        let engine = grid_engine(30);
        for id in engine.index().ids().to_vec() {
            let similar = engine.similar_items(id.as_str(), 5).unwrap();
            assert_eq!(similar.len(), 5);
            assert!(!similar.contains(&id));
            assert!(similar.iter().all(|s| engine.index().contains(s.as_str())));
        }
    }

    #[test]
    fn similar_items_caps_at_index_size() {
        let similar = engine().similar_items("2", 10).unwrap();
        assert_eq!(similar.len(), 2);
    }

    #[test]
    fn similar_items_unknown_id_is_not_found() {
        let err = engine().similar_items("404", 3).unwrap_err();
        assert!(matches!(err, EmbedRecError::NotFound(_)));
    }

    // ------------------------------------------------------------------
    // recommend_for_user
    // ------------------------------------------------------------------

    #[test]
    fn recommend_for_user_excludes_history() {
        let recs = engine().recommend_for_user(&["1", "3"], 1).unwrap();
        assert_eq!(recs, vec![ItemId::from("2")]);
    }

    #[test]
    fn recommend_for_user_ignores_unindexed_history() {
        let recs = engine().recommend_for_user(&["ghost", "1"], 2).unwrap();
        assert_eq!(recs, vec![ItemId::from("3"), ItemId::from("2")]);
    }

    #[test]
    fn recommend_for_user_cold_start_is_not_found() {
        let err = engine().recommend_for_user(&["ghost"], 2).unwrap_err();
        assert!(matches!(err, EmbedRecError::NotFound(_)));

        let empty: [&str; 0] = [];
        let err = engine().recommend_for_user(&empty, 2).unwrap_err();
        assert!(matches!(err, EmbedRecError::NotFound(_)));
    }

    #[test]
    fn recommend_for_user_cancelling_history_is_degenerate() {
        let index = VectorIndex::build(
            vec!["a".into(), "b".into(), "c".into()],
            vec![vec![1.0, 0.0], vec![-1.0, 0.0], vec![0.0, 1.0]],
        )
        .unwrap();
        let err = RecommendationEngine::new(index)
            .recommend_for_user(&["a", "b"], 1)
            .unwrap_err();
        assert!(matches!(err, EmbedRecError::DegenerateVector(_)));
    }

    #[test]
    fn recommend_for_user_fills_k_despite_exclusions() {
        let engine = grid_engine(40);
        let history: Vec<String> = (0..10).map(|i| format!("item-{i}")).collect();
        let recs = engine.recommend_for_user(&history, 8).unwrap();
        assert_eq!(recs.len(), 8);
        assert!(recs.iter().all(|r| !history.contains(&r.0)));
    }

    #[test]
    fn recommend_for_user_duplicate_history_still_excluded() {
        let recs = engine().recommend_for_user(&["1", "1", "1"], 3).unwrap();
        assert_eq!(recs, vec![ItemId::from("3"), ItemId::from("2")]);
    }
}
