//! Merges adjacent fused candidates within the same document into single
//! spans so a result doesn't fragment one idea into several near-duplicate
//! excerpts.

#[derive(Debug, Clone)]
pub struct SpanCandidate {
    pub doc_uri: String,
    pub heading_path: String,
    pub start_char: usize,
    pub end_char: usize,
    pub score: f32,
    pub leaf_ids: Vec<String>,
}

/// Groups by `doc_uri`, sorts by `start_char`, and merges runs where
/// `next.start_char <= current.end_char + gap_threshold`. Merged span takes
/// the union of ranges, `score = max`, union of `leaf_ids`. Result is sorted
/// by score descending across documents.
pub fn merge_spans(mut candidates: Vec<SpanCandidate>, gap_threshold: usize) -> Vec<SpanCandidate> {
    candidates.sort_by(|a, b| a.doc_uri.cmp(&b.doc_uri).then(a.start_char.cmp(&b.start_char)));

    let mut merged: Vec<SpanCandidate> = Vec::new();
    for candidate in candidates {
        if let Some(last) = merged.last_mut() {
            if last.doc_uri == candidate.doc_uri && candidate.start_char <= last.end_char + gap_threshold {
                last.end_char = last.end_char.max(candidate.end_char);
                last.score = last.score.max(candidate.score);
                last.leaf_ids.extend(candidate.leaf_ids);
                if candidate.heading_path.len() > last.heading_path.len() {
                    last.heading_path = candidate.heading_path;
                }
                continue;
            }
        }
        merged.push(candidate);
    }

    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(doc: &str, start: usize, end: usize, score: f32, leaf: &str) -> SpanCandidate {
        SpanCandidate {
            doc_uri: doc.to_string(),
            heading_path: "H".to_string(),
            start_char: start,
            end_char: end,
            score,
            leaf_ids: vec![leaf.to_string()],
        }
    }

    #[test]
    fn adjacent_spans_merge_within_gap_threshold() {
        let candidates = vec![candidate("a.md", 0, 100, 0.5, "l1"), candidate("a.md", 120, 200, 0.8, "l2")];
        let merged = merge_spans(candidates, 50);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start_char, 0);
        assert_eq!(merged[0].end_char, 200);
        assert_eq!(merged[0].score, 0.8);
        assert_eq!(merged[0].leaf_ids.len(), 2);
    }

    #[test]
    fn spans_beyond_gap_threshold_stay_separate() {
        let candidates = vec![candidate("a.md", 0, 100, 0.5, "l1"), candidate("a.md", 400, 500, 0.8, "l2")];
        let merged = merge_spans(candidates, 50);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn different_documents_never_merge() {
        let candidates = vec![candidate("a.md", 0, 100, 0.5, "l1"), candidate("b.md", 50, 150, 0.8, "l2")];
        let merged = merge_spans(candidates, 1000);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn results_sorted_by_score_descending() {
        let candidates = vec![candidate("a.md", 0, 10, 0.2, "l1"), candidate("b.md", 0, 10, 0.9, "l2")];
        let merged = merge_spans(candidates, 0);
        assert_eq!(merged[0].doc_uri, "b.md");
    }
}
