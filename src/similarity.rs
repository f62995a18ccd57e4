//! Similarity scoring for embeddings and perceptual hashes.
//!
//! All comparison math lives here so the duplicate detector and the
//! search path agree on the numbers.

/// Calculate cosine similarity between two vectors
///
/// Returns 0.0 when the vectors differ in length or either has zero norm,
/// so records embedded by different models compare as unrelated instead
/// of erroring.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Character-level similarity between two perceptual hashes
///
/// Score is the fraction of character positions where the strings agree.
/// Hashes with different character counts score 0.0.
pub fn hash_similarity(a: &str, b: &str) -> f32 {
    let len = a.chars().count();
    if len != b.chars().count() {
        return 0.0;
    }
    if len == 0 {
        return 1.0;
    }

    let differing = a.chars().zip(b.chars()).filter(|(x, y)| x != y).count();

    1.0 - differing as f32 / len as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) - (-1.0)).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_is_symmetric() {
        let a = vec![0.3, -1.2, 4.5, 0.01];
        let b = vec![2.2, 0.4, -0.9, 1.7];
        assert!((cosine_similarity(&a, &b) - cosine_similarity(&b, &a)).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_mismatched_lengths() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = vec![0.0, 0.0, 0.0];
        let b = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
        assert_eq!(cosine_similarity(&b, &a), 0.0);
    }

    #[test]
    fn test_hash_similarity() {
        let a = "a".repeat(32);
        assert!((hash_similarity(&a, &a) - 1.0).abs() < 0.0001);

        let mut one_off = a.clone().into_bytes();
        one_off[0] = b'b';
        let one_off = String::from_utf8(one_off).unwrap();
        let expected = 1.0 - 1.0 / 32.0;
        assert!((hash_similarity(&a, &one_off) - expected).abs() < 0.0001);
    }

    #[test]
    fn test_hash_similarity_mismatched_lengths() {
        assert_eq!(hash_similarity("abcd", "abc"), 0.0);
        assert_eq!(hash_similarity("", "abc"), 0.0);
    }

    #[test]
    fn test_hash_similarity_empty() {
        assert_eq!(hash_similarity("", ""), 1.0);
    }

    #[test]
    fn test_hash_similarity_counts_chars_not_bytes() {
        // "é" is two bytes but one character
        assert!((hash_similarity("éa", "éb") - 0.5).abs() < 0.0001);
        // same byte length, different character counts
        assert_eq!(hash_similarity("éé", "aéa"), 0.0);
    }
}
