//! In-memory vector index for exact nearest-neighbour search.
//!
//! Flat (brute-force) squared-Euclidean search over L2-normalised embeddings.
//! Every query scans every stored vector, so results are exact and identical
//! from run to run. Distance computation is spread across `rayon` workers;
//! the ranking step uses a total order (distance, then stored position), so
//! the output never depends on scheduling.
//!
//! The index is built once from a complete set of embeddings and never
//! mutated afterwards. A rebuild produces a new `VectorIndex`.
//!
//! # Complexity
//! - `build`: O(n·d)
//! - `reconstruct`: O(1) average (hash lookup)
//! - `search`: O(n·d) distance scan + O(n) selection + O(k log k) sort

use crate::{EmbedRecError, ItemId, Result};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: ItemId,
    /// Dense position of the hit inside the index.
    pub position: usize,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
}

/// Flat vector index keyed by [`ItemId`].
///
/// Positions `0..len` and item ids are in bijection: `ids[p]` is the item at
/// position `p` and `positions[ids[p]] == p`. Vectors are stored row-major in
/// one contiguous buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    ids: Vec<ItemId>,
    positions: HashMap<ItemId, usize>,
    data: Vec<f32>,
    dim: usize,
}

impl VectorIndex {
    /// Build an index, L2-normalising every vector before storage.
    ///
    /// # Errors
    /// - [`EmbedRecError::DimensionMismatch`] if `ids` and `vectors` differ in
    ///   length, or vectors differ in width.
    /// - [`EmbedRecError::EmptyCorpus`] if there are no vectors.
    /// - [`EmbedRecError::DuplicateIdentifier`] if an id repeats.
    /// - [`EmbedRecError::DegenerateVector`] for a zero-norm or non-finite
    ///   vector.
    pub fn build(ids: Vec<ItemId>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if ids.len() != vectors.len() {
            return Err(EmbedRecError::DimensionMismatch {
                expected: ids.len(),
                actual: vectors.len(),
            });
        }
        let Some(dim) = vectors.first().map(Vec::len) else {
            return Err(EmbedRecError::EmptyCorpus(
                "cannot build an index from zero vectors".into(),
            ));
        };

        let mut data = Vec::with_capacity(vectors.len() * dim);
        for (id, mut vector) in ids.iter().zip(vectors) {
            if vector.len() != dim {
                return Err(EmbedRecError::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                });
            }
            if !normalize(&mut vector) {
                return Err(EmbedRecError::DegenerateVector(format!(
                    "item {id} has a zero or non-finite norm"
                )));
            }
            data.extend_from_slice(&vector);
        }

        let index = Self::assemble(ids, data, dim)?;
        tracing::info!(items = index.len(), dim, "built vector index");
        Ok(index)
    }

    /// Reassemble an index from vectors that were already normalised, e.g.
    /// when loading a stored generation. Values are kept bit-for-bit.
    ///
    /// # Errors
    /// - [`EmbedRecError::DimensionMismatch`] if `data.len() != ids.len() * dim`.
    /// - [`EmbedRecError::DuplicateIdentifier`] if an id repeats.
    /// - [`EmbedRecError::DegenerateVector`] if `dim` is zero or a value is
    ///   non-finite.
    pub fn from_normalized(ids: Vec<ItemId>, data: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(EmbedRecError::DegenerateVector(
                "index dimension must be >= 1".into(),
            ));
        }
        if data.len() != ids.len() * dim {
            return Err(EmbedRecError::DimensionMismatch {
                expected: ids.len() * dim,
                actual: data.len(),
            });
        }
        if data.iter().any(|x| !x.is_finite()) {
            return Err(EmbedRecError::DegenerateVector(
                "stored vector contains non-finite values".into(),
            ));
        }
        Self::assemble(ids, data, dim)
    }

    fn assemble(ids: Vec<ItemId>, data: Vec<f32>, dim: usize) -> Result<Self> {
        let mut positions = HashMap::with_capacity(ids.len());
        for (pos, id) in ids.iter().enumerate() {
            if positions.insert(id.clone(), pos).is_some() {
                return Err(EmbedRecError::DuplicateIdentifier(id.clone()));
            }
        }
        Ok(Self {
            ids,
            positions,
            data,
            dim,
        })
    }

    /// The stored (normalised) vector for `id`.
    pub fn reconstruct(&self, id: &str) -> Result<&[f32]> {
        self.position(id)
            .map(|pos| self.row(pos))
            .ok_or_else(|| EmbedRecError::NotFound(format!("item id {id}")))
    }

    /// Return the `k` stored vectors closest to `query`, nearest first.
    ///
    /// Distance is squared Euclidean; ties go to the lower stored position.
    /// If `k` exceeds the index size every entry is returned. `k == 0`
    /// returns an empty `Vec`.
    ///
    /// # Errors
    /// - [`EmbedRecError::DimensionMismatch`] if `query.len() != dim`.
    /// - [`EmbedRecError::DegenerateVector`] if `query` has non-finite values.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dim {
            return Err(EmbedRecError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        if query.iter().any(|x| !x.is_finite()) {
            return Err(EmbedRecError::DegenerateVector(
                "query contains non-finite values".into(),
            ));
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .data
            .par_chunks_exact(self.dim)
            .map(|row| squared_l2(query, row))
            .enumerate()
            .collect();

        let by_rank =
            |a: &(usize, f32), b: &(usize, f32)| -> Ordering { a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)) };
        if k < scored.len() {
            scored.select_nth_unstable_by(k, by_rank);
            scored.truncate(k);
        }
        scored.sort_by(by_rank);

        Ok(scored
            .into_iter()
            .map(|(position, distance)| Neighbor {
                id: self.ids[position].clone(),
                position,
                distance,
            })
            .collect())
    }

    /// Dense position of `id`, if indexed.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Item at `position`, if in range.
    pub fn id_at(&self, position: usize) -> Option<&ItemId> {
        self.ids.get(position)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Stored vector at `position`, if in range.
    pub fn vector_at(&self, position: usize) -> Option<&[f32]> {
        (position < self.len()).then(|| self.row(position))
    }

    /// All ids in position order.
    pub fn ids(&self) -> &[ItemId] {
        &self.ids
    }

    /// Row-major vector buffer, `len() * dim()` values.
    pub fn as_flat(&self) -> &[f32] {
        &self.data
    }

    /// Embedding dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of entries in the index.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True if the index contains no entries.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn row(&self, position: usize) -> &[f32] {
        &self.data[position * self.dim..(position + 1) * self.dim]
    }
}

// ---------------------------------------------------------------------------
// Math helpers
// ---------------------------------------------------------------------------

/// Euclidean (L2) norm of `v`.
pub(crate) fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length in place. Returns `false` (leaving `v` untouched)
/// when the norm is zero or non-finite.
pub(crate) fn normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    true
}

/// Squared Euclidean distance between `a` and `b`, summed in index order.
fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ids(names: &[&str]) -> Vec<ItemId> {
        names.iter().map(|&n| ItemId::from(n)).collect()
    }

    fn scenario() -> VectorIndex {
        VectorIndex::build(
            ids(&["1", "2", "3"]),
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.9, 0.1]],
        )
        .unwrap()
    }

    // ------------------------------------------------------------------
    // l2_norm / normalize / squared_l2
    // ------------------------------------------------------------------

    #[test]
    fn test_l2_norm_unit_vector() {
        let v = vec![1.0f32, 0.0, 0.0];
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_scales_to_unit_length() {
        let mut v = vec![3.0f32, 4.0];
        assert!(normalize(&mut v));
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_rejects_zero_vector() {
        let mut v = vec![0.0f32, 0.0];
        assert!(!normalize(&mut v));
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn test_squared_l2_opposite_unit_vectors() {
        assert!((squared_l2(&[1.0, 0.0], &[-1.0, 0.0]) - 4.0).abs() < 1e-6);
    }

    // ------------------------------------------------------------------
    // VectorIndex::build
    // ------------------------------------------------------------------

    #[test]
    fn test_build_normalizes_every_vector() {
        let idx = VectorIndex::build(
            ids(&["a", "b"]),
            vec![vec![3.0, 4.0], vec![0.0, -2.0]],
        )
        .unwrap();
        for id in idx.ids() {
            let v = idx.reconstruct(id.as_str()).unwrap();
            assert!((l2_norm(v) - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_build_positions_are_a_bijection() {
        let idx = scenario();
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.as_flat().len(), idx.len() * idx.dim());
        for pos in 0..idx.len() {
            let id = idx.id_at(pos).unwrap();
            assert_eq!(idx.position(id.as_str()), Some(pos));
        }
        let unique: HashSet<&ItemId> = idx.ids().iter().collect();
        assert_eq!(unique.len(), idx.len());
    }

    #[test]
    fn test_build_rejects_duplicate_id() {
        let err = VectorIndex::build(ids(&["a", "a"]), vec![vec![1.0], vec![2.0]]).unwrap_err();
        assert!(matches!(err, EmbedRecError::DuplicateIdentifier(ref id) if id.as_str() == "a"));
    }

    #[test]
    fn test_build_rejects_zero_vector() {
        let err =
            VectorIndex::build(ids(&["a", "b"]), vec![vec![1.0, 0.0], vec![0.0, 0.0]]).unwrap_err();
        assert!(matches!(err, EmbedRecError::DegenerateVector(_)));
    }

    #[test]
    fn test_build_rejects_length_mismatch() {
        let err = VectorIndex::build(ids(&["a", "b"]), vec![vec![1.0]]).unwrap_err();
        assert!(matches!(err, EmbedRecError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_build_rejects_ragged_vectors() {
        let err =
            VectorIndex::build(ids(&["a", "b"]), vec![vec![1.0, 0.0], vec![1.0]]).unwrap_err();
        assert!(matches!(
            err,
            EmbedRecError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_build_rejects_empty() {
        let err = VectorIndex::build(Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, EmbedRecError::EmptyCorpus(_)));
    }

    #[test]
    fn test_numeric_looking_ids_are_not_coerced() {
        let idx = VectorIndex::build(ids(&["1.0", "1"]), vec![vec![1.0], vec![-1.0]]).unwrap();
        assert_eq!(idx.position("1.0"), Some(0));
        assert_eq!(idx.position("1"), Some(1));
    }

    // ------------------------------------------------------------------
    // VectorIndex::reconstruct
    // ------------------------------------------------------------------

    #[test]
    fn test_reconstruct_unknown_id_is_not_found() {
        let err = scenario().reconstruct("missing").unwrap_err();
        assert!(matches!(err, EmbedRecError::NotFound(_)));
    }

    // ------------------------------------------------------------------
    // VectorIndex::search
    // ------------------------------------------------------------------

    #[test]
    fn test_search_returns_nearest_first() {
        let idx = scenario();
        let hits = idx.search(&[1.0, 0.0], 3).unwrap();
        let order: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(order, ["1", "3", "2"]);
        assert!(hits[0].distance.abs() < 1e-6);
        assert!((hits[2].distance - 2.0).abs() < 1e-6);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_search_truncates_to_k() {
        let hits = scenario().search(&[0.0, 1.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id.as_str(), "2");
    }

    #[test]
    fn test_search_k_larger_than_index_returns_all() {
        let hits = scenario().search(&[0.0, 1.0], 10).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_search_k_zero_returns_empty() {
        assert!(scenario().search(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_search_ties_broken_by_position() {
        let idx = VectorIndex::build(
            ids(&["c", "a", "b", "d"]),
            vec![vec![0.0, 1.0], vec![0.0, 1.0], vec![1.0, 0.0], vec![0.0, 1.0]],
        )
        .unwrap();
        let hits = idx.search(&[0.0, 1.0], 3).unwrap();
        let positions: Vec<usize> = hits.iter().map(|h| h.position).collect();
        assert_eq!(positions, [0, 1, 3]);
    }

    #[test]
    fn test_search_is_deterministic() {
        let vectors: Vec<Vec<f32>> = (0..200)
            .map(|i| vec![(i % 7) as f32 + 1.0, (i % 5) as f32, (i % 3) as f32])
            .collect();
        let names: Vec<ItemId> = (0..200).map(|i| ItemId::new(i.to_string())).collect();
        let idx = VectorIndex::build(names, vectors).unwrap();
        let query = [0.3, 0.5, 0.8];
        assert_eq!(idx.search(&query, 25).unwrap(), idx.search(&query, 25).unwrap());
    }

    #[test]
    fn test_search_wrong_query_dim_is_error() {
        let err = scenario().search(&[1.0, 0.0, 0.0], 1).unwrap_err();
        assert!(matches!(
            err,
            EmbedRecError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_search_nan_query_is_error() {
        let err = scenario().search(&[f32::NAN, 0.0], 1).unwrap_err();
        assert!(matches!(err, EmbedRecError::DegenerateVector(_)));
    }

    // ------------------------------------------------------------------
    // VectorIndex::from_normalized
    // ------------------------------------------------------------------

    #[test]
    fn test_from_normalized_keeps_values_exactly() {
        let idx = scenario();
        let restored =
            VectorIndex::from_normalized(idx.ids().to_vec(), idx.as_flat().to_vec(), idx.dim())
                .unwrap();
        assert_eq!(restored, idx);
    }

    #[test]
    fn test_from_normalized_rejects_short_buffer() {
        let err = VectorIndex::from_normalized(ids(&["a", "b"]), vec![1.0, 0.0, 1.0], 2).unwrap_err();
        assert!(matches!(err, EmbedRecError::DimensionMismatch { .. }));
    }
}
