//! Citation marker accounting.
//!
//! Drafts cite sources inline with `[S#]` markers. The polish stage is
//! required not to reduce the marker count relative to the draft it
//! received, so the orchestrator compares counts before and after.

use regex::Regex;
use std::collections::BTreeSet;

use super::types::Citation;

/// Count `[S#]` markers in `text`, repeats included.
pub fn marker_count(text: &str) -> u32 {
    match Regex::new(r"\[S\d+\]") {
        Ok(re) => re.find_iter(text).count() as u32,
        Err(_) => 0,
    }
}

/// Guarantee `S0` (the source document) is present, prepending it when
/// the model omitted it. Later duplicates of an already seen id are
/// dropped; order is otherwise preserved.
pub fn ensure_source_document(mut citations: Vec<Citation>) -> Vec<Citation> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(citations.len() + 1);

    if !citations.iter().any(|c| c.id == "S0") {
        out.push(Citation::source_document());
        seen.insert("S0".to_string());
    }
    for citation in citations.drain(..) {
        if seen.insert(citation.id.clone()) {
            out.push(citation);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_markers_including_repeats() {
        let text = "Claim one [S1]. Claim two [S1]. Background [S0].";
        assert_eq!(marker_count(text), 3);
    }

    #[test]
    fn ignores_non_marker_brackets() {
        assert_eq!(marker_count("[link] [Section 2] [s1] [S]"), 0);
    }

    #[test]
    fn ensure_source_document_prepends_s0() {
        let out = ensure_source_document(vec![Citation {
            id: "S1".to_string(),
            title: "External".to_string(),
            url: Some("https://example.com".to_string()),
            snippet: None,
        }]);
        assert_eq!(out[0].id, "S0");
        assert_eq!(out[1].id, "S1");
    }

    #[test]
    fn ensure_source_document_dedupes_by_id() {
        let dup = Citation {
            id: "S1".to_string(),
            title: "same id twice".to_string(),
            url: None,
            snippet: None,
        };
        let out = ensure_source_document(vec![
            Citation::source_document(),
            dup.clone(),
            dup,
        ]);
        assert_eq!(out.len(), 2);
    }
}
