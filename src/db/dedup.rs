//! Duplicate detection and resolution.
//!
//! A face counts as a duplicate when its image path is already stored,
//! when its perceptual hash matches a stored one, or when its embedding
//! is close enough to a stored embedding. Checks run in that order,
//! cheapest first.

use std::collections::HashSet;

use rusqlite::Connection;

use crate::similarity::cosine_similarity;

use super::{
    execute_insert, query_exists_by_hash, query_exists_by_path, query_list_all, FaceRecord,
    FaceStore, NewFaceRecord, StoreError,
};

/// Result of a duplicate-checked insert.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Inserted(i64),
    DuplicatePath,
    DuplicateHash,
    DuplicateEmbedding { similarity: f32 },
}

impl IngestOutcome {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, IngestOutcome::Inserted(_))
    }
}

/// Two stored records judged to show the same face. `first` always has
/// the lower id.
#[derive(Debug, Clone)]
pub struct DuplicatePair {
    pub first: FaceRecord,
    pub second: FaceRecord,
    pub similarity: f32,
}

impl FaceStore {
    /// Whether `record` duplicates something already stored. Embeddings
    /// at or above `threshold` count as matches.
    pub fn is_duplicate(
        &self,
        record: &NewFaceRecord,
        threshold: f32,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        Ok(check_duplicate(&conn, record, threshold)?.is_some())
    }

    /// Insert `record` unless it duplicates an existing one. The check
    /// and the insert share one transaction, so concurrent callers cannot
    /// both pass the check and store the same face twice.
    pub fn insert_unless_duplicate(
        &self,
        record: &NewFaceRecord,
        threshold: f32,
    ) -> Result<IngestOutcome, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let outcome = match check_duplicate(&tx, record, threshold)? {
            Some(duplicate) => duplicate,
            None => IngestOutcome::Inserted(execute_insert(&tx, record)?),
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// All pairs of stored records that look like duplicates of each
    /// other. Identical paths or identical non-empty hashes score 1.0;
    /// otherwise the pair is reported only when cosine similarity is
    /// strictly above `threshold`, and scores as that similarity.
    pub fn find_duplicate_pairs(&self, threshold: f32) -> Result<Vec<DuplicatePair>, StoreError> {
        let records = self.list_all()?;

        let mut pairs = Vec::new();
        for i in 0..records.len() {
            for j in (i + 1)..records.len() {
                let a = &records[i];
                let b = &records[j];

                let similarity = if a.image_path == b.image_path {
                    1.0
                } else if !a.image_hash.is_empty() && a.image_hash == b.image_hash {
                    1.0
                } else {
                    let score = cosine_similarity(&a.embedding, &b.embedding);
                    if score > threshold {
                        score
                    } else {
                        continue;
                    }
                };

                pairs.push(DuplicatePair {
                    first: a.clone(),
                    second: b.clone(),
                    similarity,
                });
            }
        }

        Ok(pairs)
    }

    /// Delete the older member of every duplicate pair and return how
    /// many records were removed.
    ///
    /// Pairs are taken from one snapshot. A pair is skipped when either
    /// member was already removed for an earlier pair, so in a chain
    /// A~B~C where only B bridges the ends, removing B keeps both A
    /// and C.
    pub fn remove_duplicates(&self, threshold: f32) -> Result<usize, StoreError> {
        let pairs = self.find_duplicate_pairs(threshold)?;

        let mut removed: HashSet<i64> = HashSet::new();
        for pair in &pairs {
            if removed.contains(&pair.first.id) || removed.contains(&pair.second.id) {
                continue;
            }

            // on equal timestamps the lower id loses, i.e. the earlier insert
            let victim = if pair.first.timestamp <= pair.second.timestamp {
                &pair.first
            } else {
                &pair.second
            };

            if self.delete_by_id(victim.id)? {
                tracing::info!(
                    id = victim.id,
                    name = %victim.name,
                    similarity = pair.similarity,
                    "removed duplicate face"
                );
                removed.insert(victim.id);
            }
        }

        Ok(removed.len())
    }
}

fn check_duplicate(
    conn: &Connection,
    record: &NewFaceRecord,
    threshold: f32,
) -> Result<Option<IngestOutcome>, StoreError> {
    if query_exists_by_path(conn, &record.image_path)? {
        return Ok(Some(IngestOutcome::DuplicatePath));
    }

    if !record.image_hash.is_empty() && query_exists_by_hash(conn, &record.image_hash)? {
        return Ok(Some(IngestOutcome::DuplicateHash));
    }

    for existing in query_list_all(conn)? {
        let similarity = cosine_similarity(&record.embedding, &existing.embedding);
        if similarity >= threshold {
            return Ok(Some(IngestOutcome::DuplicateEmbedding { similarity }));
        }
    }

    Ok(None)
}
