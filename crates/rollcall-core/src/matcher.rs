//! Gallery matching by cosine similarity.

use crate::types::{Embedding, GalleryEntry};

/// Default cosine similarity a candidate must strictly exceed.
pub const DEFAULT_THRESHOLD: f32 = 0.7;

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    /// No gallery entry scored above the threshold.
    NoMatch,
    /// The best-scoring entry, which cleared the threshold.
    Matched {
        student_id: String,
        display_name: String,
        /// Cosine similarity of the match, in [-1, 1].
        similarity: f32,
    },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher.
///
/// Visits every gallery entry. A candidate replaces the current best only if
/// its similarity is strictly greater than the best so far and strictly
/// greater than `threshold`, so the first of several exactly tied entries
/// wins. Zero-norm entries are never selected; entries whose dimension
/// differs from the probe are skipped with a warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        if probe.is_zero() {
            tracing::warn!(dim = probe.dim(), "probe embedding has zero norm; nothing can match");
            return MatchResult::NoMatch;
        }

        let mut best: Option<(usize, f32)> = None;
        let mut skipped = 0usize;

        for (i, entry) in gallery.iter().enumerate() {
            if entry.embedding.is_zero() {
                tracing::debug!(student_id = %entry.student_id, "zero-norm gallery embedding skipped");
                skipped += 1;
                continue;
            }

            let sim = match probe.similarity(&entry.embedding) {
                Ok(sim) => sim,
                Err(mismatch) => {
                    tracing::warn!(
                        student_id = %entry.student_id,
                        expected = mismatch.expected,
                        actual = mismatch.actual,
                        "gallery embedding dimension mismatch; skipping entry"
                    );
                    skipped += 1;
                    continue;
                }
            };

            // NaN compares false on both sides and is never selected.
            let beats_best = best.map_or(true, |(_, best_sim)| sim > best_sim);
            if sim > threshold && beats_best {
                best = Some((i, sim));
            }
        }

        tracing::debug!(
            gallery = gallery.len(),
            skipped,
            best = ?best.map(|(_, sim)| sim),
            threshold,
            "gallery scan complete"
        );

        match best {
            Some((idx, similarity)) => MatchResult::Matched {
                student_id: gallery[idx].student_id.clone(),
                display_name: gallery[idx].display_name.clone(),
                similarity,
            },
            None => MatchResult::NoMatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry {
            student_id: id.into(),
            display_name: format!("Student {id}"),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    fn probe(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn matched_id(result: &MatchResult) -> Option<&str> {
        match result {
            MatchResult::Matched { student_id, .. } => Some(student_id),
            MatchResult::NoMatch => None,
        }
    }

    #[test]
    fn test_exact_match_selected() {
        let gallery = vec![entry("A", &[1.0, 0.0, 0.0]), entry("B", &[0.0, 1.0, 0.0])];
        let result = CosineMatcher.compare(&probe(&[1.0, 0.0, 0.0]), &gallery, 0.7);
        match result {
            MatchResult::Matched { student_id, display_name, similarity } => {
                assert_eq!(student_id, "A");
                assert_eq!(display_name, "Student A");
                assert!((similarity - 1.0).abs() < 1e-6);
            }
            MatchResult::NoMatch => panic!("expected a match"),
        }
    }

    #[test]
    fn test_orthogonal_is_no_match() {
        let gallery = vec![entry("A", &[0.0, 1.0, 0.0])];
        let result = CosineMatcher.compare(&probe(&[1.0, 0.0, 0.0]), &gallery, 0.7);
        assert_eq!(result, MatchResult::NoMatch);
    }

    #[test]
    fn test_empty_gallery_is_no_match() {
        for threshold in [-1.0, -0.5, 0.0, 0.7, 1.0] {
            let result = CosineMatcher.compare(&probe(&[1.0, 0.0]), &[], threshold);
            assert_eq!(result, MatchResult::NoMatch);
        }
    }

    #[test]
    fn test_single_entry_threshold_is_strict() {
        // similarity([1, 1], [1, 0]) = 1/sqrt(2)
        let gallery = vec![entry("A", &[1.0, 0.0])];
        let query = probe(&[1.0, 1.0]);
        let s = query.similarity(&gallery[0].embedding).unwrap();

        assert!(CosineMatcher.compare(&query, &gallery, s - 0.01).is_match());
        assert!(!CosineMatcher.compare(&query, &gallery, s).is_match());
        assert!(!CosineMatcher.compare(&query, &gallery, s + 0.01).is_match());
    }

    #[test]
    fn test_best_of_several_is_selected() {
        let gallery = vec![
            entry("decoy", &[0.8, 0.6, 0.0]),
            entry("best", &[0.99, 0.1, 0.0]),
            entry("other", &[0.0, 0.0, 1.0]),
        ];
        let result = CosineMatcher.compare(&probe(&[1.0, 0.0, 0.0]), &gallery, 0.5);
        assert_eq!(matched_id(&result), Some("best"));
    }

    #[test]
    fn test_best_match_last_entry() {
        // Every entry is visited; the match sits at the end.
        let gallery = vec![
            entry("1", &[0.0, 1.0, 0.0]),
            entry("2", &[0.0, 0.0, 1.0]),
            entry("3", &[1.0, 0.0, 0.0]),
        ];
        let result = CosineMatcher.compare(&probe(&[1.0, 0.0, 0.0]), &gallery, 0.5);
        assert_eq!(matched_id(&result), Some("3"));
    }

    #[test]
    fn test_exact_tie_first_entry_wins() {
        // Callers must not rely on which tied entry wins; this pins the
        // current stable behaviour.
        let gallery = vec![entry("first", &[2.0, 0.0]), entry("second", &[5.0, 0.0])];
        let result = CosineMatcher.compare(&probe(&[1.0, 0.0]), &gallery, 0.7);
        assert_eq!(matched_id(&result), Some("first"));
    }

    #[test]
    fn test_zero_vector_entry_never_selected() {
        let gallery = vec![entry("zero", &[0.0, 0.0, 0.0])];
        for threshold in [-1.0, -0.1, 0.0, 0.7] {
            let result = CosineMatcher.compare(&probe(&[1.0, 2.0, 3.0]), &gallery, threshold);
            assert_eq!(result, MatchResult::NoMatch);
        }

        let gallery = vec![entry("zero", &[0.0, 0.0, 0.0]), entry("real", &[1.0, 2.0, 3.0])];
        let result = CosineMatcher.compare(&probe(&[1.0, 2.0, 3.0]), &gallery, 0.7);
        assert_eq!(matched_id(&result), Some("real"));
    }

    #[test]
    fn test_zero_probe_is_no_match() {
        let gallery = vec![entry("A", &[1.0, 0.0])];
        let result = CosineMatcher.compare(&probe(&[0.0, 0.0]), &gallery, -1.0);
        assert_eq!(result, MatchResult::NoMatch);
    }

    #[test]
    fn test_mismatched_dimension_skipped() {
        let gallery = vec![
            entry("short", &[1.0, 0.0]),
            entry("long", &[1.0, 0.0, 0.0, 0.0]),
            entry("ok", &[1.0, 0.0, 0.0]),
        ];
        let result = CosineMatcher.compare(&probe(&[1.0, 0.0, 0.0]), &gallery, 0.7);
        assert_eq!(matched_id(&result), Some("ok"));
    }

    #[test]
    fn test_nan_entry_never_selected() {
        let gallery = vec![entry("nan", &[f32::NAN, 1.0]), entry("ok", &[0.0, 1.0])];
        let result = CosineMatcher.compare(&probe(&[0.0, 1.0]), &gallery, 0.7);
        assert_eq!(matched_id(&result), Some("ok"));
    }

    #[test]
    fn test_negative_threshold_still_requires_strictly_greater() {
        let gallery = vec![entry("opposite", &[-1.0, 0.0])];
        assert!(!CosineMatcher.compare(&probe(&[1.0, 0.0]), &gallery, -1.0).is_match());
        assert!(CosineMatcher.compare(&probe(&[1.0, 0.0]), &gallery, -1.01).is_match());
    }
}
