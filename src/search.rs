//! Hybrid ranking: fusing vector similarity with keyword BM25 ranks
//!
//! Both legs are normalized into [0, 1] before fusion: cosine similarity via
//! an affine map from [-1, 1], keyword hits via their BM25 rank position.
//! Fusion is a weighted union keyed by chunk id; a chunk missing from one leg
//! contributes 0 from that side.

use std::collections::HashMap;

/// Cap on the candidate pool handed to either search leg.
pub const MAX_CANDIDATES: usize = 200;

/// Candidate pool size for one leg: `max_results` scaled by the configured
/// multiplier, clamped to [1, 200].
pub fn candidate_limit(max_results: usize, multiplier: f32) -> usize {
    let scaled = (max_results as f32 * multiplier).floor() as usize;
    scaled.max(1).min(MAX_CANDIDATES)
}

/// Map cosine similarity from [-1, 1] into [0, 1].
pub fn normalize_cosine(similarity: f32) -> f32 {
    ((similarity + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Map a BM25 rank position (0 = best) into (0, 1].
pub fn bm25_rank_to_score(rank: usize) -> f32 {
    1.0 / (1.0 + rank as f32)
}

/// Weighted union of two scored id lists. Scores must already be normalized
/// into [0, 1]; a missing side counts as 0. Results are sorted descending by
/// combined score.
pub fn merge_hybrid(
    vector: &[(String, f32)],
    keyword: &[(String, f32)],
    vector_weight: f32,
    text_weight: f32,
) -> Vec<(String, f32)> {
    let mut combined: HashMap<&str, f32> = HashMap::new();
    for (id, score) in vector {
        *combined.entry(id.as_str()).or_insert(0.0) += vector_weight * score;
    }
    for (id, score) in keyword {
        *combined.entry(id.as_str()).or_insert(0.0) += text_weight * score;
    }

    let mut merged: Vec<(String, f32)> = combined
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    merged.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(pairs: &[(&str, f32)]) -> Vec<(String, f32)> {
        pairs.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn test_candidate_limit() {
        assert_eq!(candidate_limit(10, 4.0), 40);
        assert_eq!(candidate_limit(100, 4.0), 200); // capped
        assert_eq!(candidate_limit(0, 4.0), 1); // floor
        assert_eq!(candidate_limit(3, 0.1), 1);
    }

    #[test]
    fn test_normalize_cosine() {
        assert!((normalize_cosine(1.0) - 1.0).abs() < 1e-6);
        assert!((normalize_cosine(-1.0)).abs() < 1e-6);
        assert!((normalize_cosine(0.0) - 0.5).abs() < 1e-6);
        // Out-of-range similarity (float drift) clamps.
        assert_eq!(normalize_cosine(1.2), 1.0);
    }

    #[test]
    fn test_bm25_rank_to_score() {
        assert!((bm25_rank_to_score(0) - 1.0).abs() < 1e-6);
        assert!((bm25_rank_to_score(1) - 0.5).abs() < 1e-6);
        assert!(bm25_rank_to_score(9) < bm25_rank_to_score(8));
    }

    #[test]
    fn test_merge_weighted_union() {
        // Vector [(A,0.9),(B,0.5)], keyword [(B,0.7),(C,0.4)], weights 0.6/0.4:
        // A = 0.54, B = 0.58, C = 0.16, so the order is [B, A, C].
        let merged = merge_hybrid(
            &scored(&[("A", 0.9), ("B", 0.5)]),
            &scored(&[("B", 0.7), ("C", 0.4)]),
            0.6,
            0.4,
        );
        let ids: Vec<&str> = merged.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A", "C"]);
        assert!((merged[0].1 - 0.58).abs() < 1e-5);
        assert!((merged[1].1 - 0.54).abs() < 1e-5);
        assert!((merged[2].1 - 0.16).abs() < 1e-5);

        // With a 0.5 score floor only B and A survive.
        let kept: Vec<&str> = merged
            .iter()
            .filter(|(_, s)| *s >= 0.5)
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(kept, vec!["B", "A"]);
    }

    #[test]
    fn test_merge_single_sided() {
        let merged = merge_hybrid(&scored(&[("A", 1.0)]), &[], 0.7, 0.3);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].1 - 0.7).abs() < 1e-6);

        let merged = merge_hybrid(&[], &scored(&[("K", 1.0)]), 0.7, 0.3);
        assert!((merged[0].1 - 0.3).abs() < 1e-6);
    }
}
