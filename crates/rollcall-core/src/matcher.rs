//! Best-match selection over a snapshot of enrolled records.
//!
//! Every function here is pure: candidates are read, never mutated, and
//! nothing is retained between calls. Incomparable candidates are skipped and
//! reported to the caller instead of failing the whole match.

use crate::types::{format_percentage, Embedding, EnrolledRecord, MatchResult, SkipReason};
use serde::{Deserialize, Serialize};

/// Distance scale for gallery matching by Euclidean distance.
pub const GALLERY_MAX_DISTANCE: f32 = 50.0;
/// Distance scale used when comparing two embeddings directly.
pub const PAIR_MAX_DISTANCE: f32 = 30.0;

/// A candidate excluded from selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    /// Position of the candidate in the input slice.
    pub index: usize,
    pub identity: String,
    pub reason: SkipReason,
}

/// Strategy for comparing a query embedding against enrolled records.
pub trait Matcher {
    fn compare(
        &self,
        query: &Embedding,
        candidates: &[EnrolledRecord],
        threshold: f32,
    ) -> MatchResult;
}

/// Cosine similarity matcher. See [`find_best_match`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        query: &Embedding,
        candidates: &[EnrolledRecord],
        threshold: f32,
    ) -> MatchResult {
        find_best_match(query, candidates, threshold)
    }
}

/// Euclidean distance matcher.
///
/// Picks the candidate at the smallest distance (first one wins ties) and
/// scores it as `clamp(1 - distance / max_distance, 0, 1)`. A candidate
/// farther than `max_distance` never matches, whatever the threshold.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub max_distance: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            max_distance: GALLERY_MAX_DISTANCE,
        }
    }
}

impl EuclideanMatcher {
    /// Matcher scaled for comparing two captures directly.
    pub fn for_pairs() -> Self {
        Self {
            max_distance: PAIR_MAX_DISTANCE,
        }
    }

    /// Map a distance onto [0, 1]. A non-positive scale only accepts distance 0.
    pub fn score(&self, distance: f32) -> f32 {
        if self.max_distance <= 0.0 {
            return if distance == 0.0 { 1.0 } else { 0.0 };
        }
        (1.0 - distance / self.max_distance).clamp(0.0, 1.0)
    }

    fn within_range(&self, distance: f32) -> bool {
        distance <= self.max_distance.max(0.0)
    }

    /// Decide whether two embeddings are within `max_distance` of each other.
    pub fn compare_pair(&self, a: &Embedding, b: &Embedding) -> PairComparison {
        if let Err(reason) = a.check_comparable(b) {
            return PairComparison {
                similar: false,
                similarity: None,
                message: format!("cannot compare: {reason}"),
            };
        }
        let distance = a.euclidean_distance(b).unwrap_or(f32::INFINITY);
        let sim = self.score(distance);
        let similar = self.within_range(distance);
        let message = if similar {
            format!("similar ({}, distance {distance:.3})", format_percentage(sim))
        } else {
            format!("not similar (distance {distance:.3})")
        };
        PairComparison {
            similar,
            similarity: Some(sim),
            message,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        query: &Embedding,
        candidates: &[EnrolledRecord],
        threshold: f32,
    ) -> MatchResult {
        if candidates.is_empty() {
            return MatchResult::no_candidates();
        }

        let mut best: Option<(usize, f32)> = None;
        let mut skipped = 0;
        for (index, candidate) in candidates.iter().enumerate() {
            match query.euclidean_distance(&candidate.embedding) {
                Some(d) => {
                    if best.map_or(true, |(_, best_d)| d < best_d) {
                        best = Some((index, d));
                    }
                }
                None => skipped += 1,
            }
        }

        let Some((idx, distance)) = best else {
            return MatchResult::nothing_comparable(skipped);
        };

        let sim = self.score(distance);
        let matched = self.within_range(distance) && sim >= threshold;
        let message = if matched {
            format!("matched with {}", format_percentage(sim))
        } else {
            format!("no match (closest at distance {distance:.3})")
        };
        MatchResult {
            matched,
            best_identity: Some(candidates[idx].identity.clone()),
            similarity: sim,
            message,
            skipped,
        }
    }
}

/// Find the enrolled record most similar to `query` by cosine similarity.
///
/// Ties go to the earliest candidate. `matched` is `similarity >= threshold`;
/// the closest comparable candidate is reported as `best_identity` whether or
/// not it matched.
pub fn find_best_match(
    query: &Embedding,
    candidates: &[EnrolledRecord],
    threshold: f32,
) -> MatchResult {
    find_best_match_with(query, candidates, threshold, |_| {})
}

/// Like [`find_best_match`], reporting every skipped candidate to `on_skip`.
pub fn find_best_match_with<F>(
    query: &Embedding,
    candidates: &[EnrolledRecord],
    threshold: f32,
    on_skip: F,
) -> MatchResult
where
    F: FnMut(SkippedCandidate),
{
    select_best(
        candidates,
        threshold,
        |c| {
            query.check_comparable(&c.embedding)?;
            query.similarity(&c.embedding).ok_or(SkipReason::NonFinite)
        },
        on_skip,
    )
}

fn select_best<S, F>(
    candidates: &[EnrolledRecord],
    threshold: f32,
    mut score: S,
    mut on_skip: F,
) -> MatchResult
where
    S: FnMut(&EnrolledRecord) -> Result<f32, SkipReason>,
    F: FnMut(SkippedCandidate),
{
    if candidates.is_empty() {
        return MatchResult::no_candidates();
    }

    let mut best: Option<(usize, f32)> = None;
    let mut skipped = 0;

    for (index, candidate) in candidates.iter().enumerate() {
        match score(candidate) {
            Ok(sim) => {
                // Strictly greater: the first candidate keeps a tie.
                if best.map_or(true, |(_, best_sim)| sim > best_sim) {
                    best = Some((index, sim));
                }
            }
            Err(reason) => {
                skipped += 1;
                on_skip(SkippedCandidate {
                    index,
                    identity: candidate.identity.clone(),
                    reason,
                });
            }
        }
    }

    match best {
        Some((idx, sim)) => {
            let matched = sim >= threshold;
            let message = if matched {
                format!("matched with {}", format_percentage(sim))
            } else {
                format!("no match (best {})", format_percentage(sim))
            };
            MatchResult {
                matched,
                best_identity: Some(candidates[idx].identity.clone()),
                similarity: sim,
                message,
                skipped,
            }
        }
        None => MatchResult::nothing_comparable(skipped),
    }
}

/// A candidate and its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub index: usize,
    pub identity: String,
    pub similarity: f32,
}

/// Rank comparable candidates by descending cosine similarity.
///
/// Equal similarities keep input order. At most `limit` entries are returned.
pub fn rank_candidates(
    query: &Embedding,
    candidates: &[EnrolledRecord],
    limit: usize,
) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .iter()
        .enumerate()
        .filter_map(|(index, c)| {
            query.similarity(&c.embedding).map(|similarity| RankedCandidate {
                index,
                identity: c.identity.clone(),
                similarity,
            })
        })
        .collect();

    // Stable sort: equal scores keep input order.
    ranked.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    ranked.truncate(limit);
    ranked
}

/// Outcome of comparing two captures directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairComparison {
    pub similar: bool,
    /// `None` when the embeddings could not be compared.
    pub similarity: Option<f32>,
    pub message: String,
}

/// Decide whether two embeddings belong to the same face.
pub fn compare_pair(a: &Embedding, b: &Embedding, threshold: f32) -> PairComparison {
    match a.check_comparable(b) {
        Err(reason) => PairComparison {
            similar: false,
            similarity: None,
            message: format!("cannot compare: {reason}"),
        },
        Ok(()) => {
            let sim = a.similarity(b).unwrap_or(0.0);
            let similar = sim >= threshold;
            let message = if similar {
                format!("similar ({})", format_percentage(sim))
            } else {
                format!("not similar ({})", format_percentage(sim))
            };
            PairComparison {
                similar,
                similarity: Some(sim),
                message,
            }
        }
    }
}

/// Find an enrolled record of another identity that looks like `embedding`.
///
/// Returns the highest-scoring record whose identity differs from
/// `exclude_identity` and whose similarity reaches `threshold`.
pub fn find_duplicate<'a>(
    embedding: &Embedding,
    candidates: &'a [EnrolledRecord],
    threshold: f32,
    exclude_identity: Option<&str>,
) -> Option<(&'a EnrolledRecord, f32)> {
    let mut best: Option<(&EnrolledRecord, f32)> = None;
    for candidate in candidates {
        if exclude_identity == Some(candidate.identity.as_str()) {
            continue;
        }
        let Some(sim) = embedding.similarity(&candidate.embedding) else {
            continue;
        };
        if sim >= threshold && best.map_or(true, |(_, b)| sim > b) {
            best = Some((candidate, sim));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, values: &[f32]) -> EnrolledRecord {
        EnrolledRecord::new(id, values.to_vec())
    }

    fn query(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn ab_candidates() -> Vec<EnrolledRecord> {
        vec![
            record("A", &[1.0, 0.0, 0.0, 0.0]),
            record("B", &[0.0, 1.0, 0.0, 0.0]),
        ]
    }

    #[test]
    fn test_exact_match_scenario() {
        let result = find_best_match(&query(&[1.0, 0.0, 0.0, 0.0]), &ab_candidates(), 0.6);
        assert!(result.matched);
        assert_eq!(result.best_identity.as_deref(), Some("A"));
        assert_eq!(result.similarity, 1.0);
        assert_eq!(result.message, "matched with 100.00%");
    }

    #[test]
    fn test_near_match_scenario() {
        let q = query(&[0.9, 0.1, 0.0, 0.0]);
        let candidates = ab_candidates();

        let to_a = q.similarity(&candidates[0].embedding).unwrap();
        let to_b = q.similarity(&candidates[1].embedding).unwrap();
        assert!((to_a - 0.9939).abs() < 1e-3, "got {to_a}");
        assert!((to_b - 0.1104).abs() < 1e-3, "got {to_b}");

        let result = find_best_match(&q, &candidates, 0.99);
        assert!(result.matched);
        assert_eq!(result.best_identity.as_deref(), Some("A"));
        assert_eq!(result.message, "matched with 99.39%");
    }

    #[test]
    fn test_empty_candidates_never_match() {
        for threshold in [0.0, 0.5, 1.0] {
            let result = find_best_match(&query(&[1.0, 2.0]), &[], threshold);
            assert!(!result.matched);
            assert_eq!(result.best_identity, None);
            assert_eq!(result.message, "no candidates");
        }
        let result = find_best_match(&query(&[]), &[], 0.0);
        assert!(!result.matched);
    }

    #[test]
    fn test_below_threshold_still_reports_closest() {
        let result = find_best_match(&query(&[0.0, 0.0, 1.0, 0.0]), &ab_candidates(), 0.5);
        assert!(!result.matched);
        assert_eq!(result.best_identity.as_deref(), Some("A"));
        assert_eq!(result.similarity, 0.0);
        assert_eq!(result.message, "no match (best 0.00%)");
    }

    #[test]
    fn test_first_candidate_wins_ties() {
        let candidates = vec![
            record("first", &[1.0, 0.0]),
            record("second", &[2.0, 0.0]),
        ];
        let result = find_best_match(&query(&[1.0, 0.0]), &candidates, 0.5);
        assert_eq!(result.best_identity.as_deref(), Some("first"));
    }

    #[test]
    fn test_best_match_found_at_end() {
        let candidates = vec![
            record("decoy1", &[0.0, 1.0, 0.0]),
            record("decoy2", &[0.0, 0.0, 1.0]),
            record("match", &[1.0, 0.0, 0.0]),
        ];
        let result = find_best_match(&query(&[1.0, 0.0, 0.0]), &candidates, 0.5);
        assert!(result.matched);
        assert_eq!(result.best_identity.as_deref(), Some("match"));
    }

    #[test]
    fn test_malformed_candidates_are_skipped_and_reported() {
        let candidates = vec![
            record("short", &[1.0, 0.0]),
            record("nan", &[f32::NAN, 0.0, 0.0, 0.0]),
            record("ok", &[0.0, 1.0, 0.0, 0.0]),
        ];
        let mut reported = Vec::new();
        let result = find_best_match_with(
            &query(&[0.0, 1.0, 0.0, 0.0]),
            &candidates,
            0.6,
            |s| reported.push(s),
        );
        assert!(result.matched);
        assert_eq!(result.best_identity.as_deref(), Some("ok"));
        assert_eq!(result.skipped, 2);
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].index, 0);
        assert_eq!(
            reported[0].reason,
            SkipReason::LengthMismatch { expected: 4, actual: 2 }
        );
        assert_eq!(reported[1].identity, "nan");
        assert_eq!(reported[1].reason, SkipReason::NonFinite);
    }

    #[test]
    fn test_all_candidates_incomparable() {
        let candidates = vec![record("short", &[1.0])];
        let result = find_best_match(&query(&[1.0, 0.0]), &candidates, 0.0);
        assert!(!result.matched);
        assert_eq!(result.best_identity, None);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_match_is_monotonic_in_threshold() {
        let q = query(&[0.6, 0.3, 0.1, 0.0]);
        let candidates = ab_candidates();
        let mut seen_match = false;
        // Walk thresholds from high to low: once matched, stays matched.
        for step in (0..=100).rev() {
            let t = step as f32 / 100.0;
            let result = find_best_match(&q, &candidates, t);
            if seen_match {
                assert!(result.matched, "lost match at threshold {t}");
            }
            seen_match |= result.matched;
        }
        assert!(seen_match);
    }

    #[test]
    fn test_negative_similarity_can_be_best() {
        let candidates = vec![record("opposite", &[-1.0, 0.0])];
        let result = find_best_match(&query(&[1.0, 0.0]), &candidates, 0.0);
        assert!(!result.matched);
        assert_eq!(result.similarity, -1.0);
        assert_eq!(result.best_identity.as_deref(), Some("opposite"));
    }

    #[test]
    fn test_cosine_matcher_delegates() {
        let result = CosineMatcher.compare(&query(&[0.0, 1.0, 0.0, 0.0]), &ab_candidates(), 0.6);
        assert_eq!(result.best_identity.as_deref(), Some("B"));
    }

    #[test]
    fn test_euclidean_matcher_scores_by_distance() {
        let matcher = EuclideanMatcher { max_distance: 10.0 };
        let candidates = vec![
            record("far", &[6.0, 8.0]),
            record("near", &[0.0, 2.0]),
        ];
        let result = matcher.compare(&query(&[0.0, 0.0]), &candidates, 0.5);
        assert!(result.matched);
        assert_eq!(result.best_identity.as_deref(), Some("near"));
        assert!((result.similarity - 0.8).abs() < 1e-6);
        assert_eq!(matcher.score(25.0), 0.0);
        assert_eq!(EuclideanMatcher::default().max_distance, GALLERY_MAX_DISTANCE);
    }

    #[test]
    fn test_euclidean_matcher_out_of_range_never_matches() {
        let candidates = vec![
            record("far", &[1000.0, 0.0]),
            record("near", &[60.0, 0.0]),
            record("short", &[1.0]),
        ];
        let result = EuclideanMatcher::default().compare(&query(&[0.0, 0.0]), &candidates, 0.0);
        assert!(!result.matched);
        assert_eq!(result.best_identity.as_deref(), Some("near"));
        assert_eq!(result.similarity, 0.0);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.message, "no match (closest at distance 60.000)");
    }

    #[test]
    fn test_euclidean_matcher_first_wins_ties_and_empty() {
        let candidates = vec![record("first", &[3.0, 4.0]), record("second", &[-3.0, -4.0])];
        let result = EuclideanMatcher::default().compare(&query(&[0.0, 0.0]), &candidates, 0.5);
        assert!(result.matched);
        assert_eq!(result.best_identity.as_deref(), Some("first"));
        assert!((result.similarity - 0.9).abs() < 1e-6);

        let empty = EuclideanMatcher::default().compare(&query(&[0.0, 0.0]), &[], 0.0);
        assert!(!empty.matched);
        assert_eq!(empty.message, "no candidates");
    }

    #[test]
    fn test_euclidean_pair_comparison() {
        let pairs = EuclideanMatcher::for_pairs();
        assert_eq!(pairs.max_distance, PAIR_MAX_DISTANCE);

        let close = pairs.compare_pair(&query(&[0.0, 0.0]), &query(&[9.0, 12.0]));
        assert!(close.similar);
        assert!((close.similarity.unwrap() - 0.5).abs() < 1e-6);

        let apart = pairs.compare_pair(&query(&[0.0, 0.0]), &query(&[30.0, 40.0]));
        assert!(!apart.similar);
        assert_eq!(apart.similarity, Some(0.0));

        let broken = pairs.compare_pair(&query(&[0.0, 0.0]), &query(&[1.0]));
        assert!(!broken.similar);
        assert_eq!(broken.similarity, None);
    }

    #[test]
    fn test_rank_candidates_orders_and_truncates() {
        let candidates = vec![
            record("low", &[0.0, 1.0]),
            record("bad", &[1.0]),
            record("high", &[1.0, 0.0]),
            record("mid", &[1.0, 1.0]),
            record("high-again", &[3.0, 0.0]),
        ];
        let ranked = rank_candidates(&query(&[1.0, 0.0]), &candidates, 3);
        let ids: Vec<&str> = ranked.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(ids, ["high", "high-again", "mid"]);
        assert_eq!(ranked[0].index, 2);
    }

    #[test]
    fn test_compare_pair() {
        let a = query(&[1.0, 0.0]);
        let same = compare_pair(&a, &query(&[2.0, 0.0]), 0.9);
        assert!(same.similar);
        assert_eq!(same.similarity, Some(1.0));
        assert_eq!(same.message, "similar (100.00%)");

        let other = compare_pair(&a, &query(&[0.0, 1.0]), 0.9);
        assert!(!other.similar);

        let broken = compare_pair(&a, &query(&[1.0]), 0.0);
        assert!(!broken.similar);
        assert_eq!(broken.similarity, None);
        assert!(broken.message.contains("length mismatch"));
    }

    #[test]
    fn test_find_duplicate_ignores_same_identity() {
        let candidates = vec![
            record("s-1", &[1.0, 0.0]),
            record("s-2", &[0.99, 0.05]),
        ];
        let capture = query(&[1.0, 0.0]);

        let (dup, sim) = find_duplicate(&capture, &candidates, 0.9, Some("s-1")).unwrap();
        assert_eq!(dup.identity, "s-2");
        assert!(sim > 0.99);

        let (dup, _) = find_duplicate(&capture, &candidates, 0.9, None).unwrap();
        assert_eq!(dup.identity, "s-1");

        assert!(find_duplicate(&query(&[0.0, 1.0]), &candidates, 0.9, None).is_none());
    }
}
