//! Nearest-neighbour search over stored embeddings.

use crate::similarity::cosine_similarity;

use super::{FaceRecord, FaceStore, StoreError};

impl FaceStore {
    /// The `limit` stored faces most similar to `target`, best first.
    /// The target itself is excluded by id; ties keep insertion order.
    pub fn find_similar(
        &self,
        target: &FaceRecord,
        limit: usize,
    ) -> Result<Vec<(FaceRecord, f32)>, StoreError> {
        let mut results: Vec<(FaceRecord, f32)> = self
            .list_all()?
            .into_iter()
            .filter(|record| record.id != target.id)
            .map(|record| {
                let similarity = cosine_similarity(&target.embedding, &record.embedding);
                (record, similarity)
            })
            .collect();

        // Sort by similarity (descending)
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);

        Ok(results)
    }
}
