//! rollcall-core — Face embedding matching for attendance check-in.
//!
//! Scores a captured embedding against enrolled records by cosine
//! similarity, picks the best candidate above a threshold, and bounds the
//! enrolled set with oldest-first eviction.

pub mod gallery;
pub mod matcher;
pub mod types;

pub use gallery::{enroll, EnrollmentStore, Gallery, DEFAULT_CAPACITY};
pub use matcher::{
    compare_pair, find_best_match, find_best_match_with, find_duplicate, rank_candidates,
    CosineMatcher, EuclideanMatcher, Matcher, PairComparison, RankedCandidate, SkippedCandidate,
};
pub use types::{Embedding, EnrolledRecord, MatchResult, RecordMetadata, SkipReason};
