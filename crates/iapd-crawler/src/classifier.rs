use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::extract::TextExtractor;
use crate::patterns::{NamedPattern, PatternCatalog, DOES_NOT_VOTE_MARKER, PATTERN_CATALOG};
use iapd_core::models::BrochureAnalysis;
use iapd_core::PipelineError;

/// **Brochure Classifier**
///
/// Runs the pattern battery over one brochure's extracted text and produces
/// a [`BrochureAnalysis`]. The pass is deterministic: identical text and an
/// identical catalog always yield byte-identical output. Missing files,
/// extraction failures, and empty text surface as `ClassificationSkipped`,
/// which joins into the output with empty analysis fields rather than
/// dropping the row.
pub struct BrochureClassifier {
    extractor: Arc<dyn TextExtractor>,
}

impl BrochureClassifier {
    pub fn new(extractor: Arc<dyn TextExtractor>) -> Self {
        Self { extractor }
    }

    /// Extract text from `path` and classify it.
    pub fn classify_file(
        &self,
        path: &Path,
        version_id: &str,
    ) -> Result<BrochureAnalysis, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::ClassificationSkipped {
                version_id: version_id.to_string(),
                reason: format!("file {} is absent", path.display()),
            });
        }
        let text = self.extractor.extract_text(path).map_err(|err| {
            PipelineError::ClassificationSkipped {
                version_id: version_id.to_string(),
                reason: format!("text extraction failed: {err}"),
            }
        })?;
        if text.trim().is_empty() {
            return Err(PipelineError::ClassificationSkipped {
                version_id: version_id.to_string(),
                reason: "extracted text is empty".to_string(),
            });
        }
        Ok(classify_text(&text, &PATTERN_CATALOG))
    }
}

/// Classify already-extracted text against a catalog. Pure in both inputs.
pub fn classify_text(text: &str, catalog: &PatternCatalog) -> BrochureAnalysis {
    let spans = sentence_spans(text);

    let mut analysis = BrochureAnalysis {
        proxy_providers: match_tags(&catalog.proxy_providers, text),
        class_action_providers: match_tags(&catalog.class_action_providers, text),
        esg_providers: match_tags(&catalog.esg_providers, text),
        ..BrochureAnalysis::default()
    };

    analysis.esg_language_excerpt = esg_excerpt(text, catalog, &spans);

    for found in catalog.email.find_iter(text) {
        push_unique(&mut analysis.email_all, found.as_str());
    }

    for (start, end) in &spans {
        let sentence = &text[*start..*end];
        let emails: Vec<&str> = catalog
            .email
            .find_iter(sentence)
            .map(|m| m.as_str())
            .collect();
        if emails.is_empty() {
            continue;
        }
        if catalog.email_context_compliance.is_match(sentence) {
            for email in &emails {
                push_unique(&mut analysis.email_compliance, email);
            }
        }
        if catalog.email_context_proxy.is_match(sentence) {
            for email in &emails {
                push_unique(&mut analysis.email_proxy, email);
            }
        }
        if catalog.email_context_brochure.is_match(sentence) {
            for email in &emails {
                push_unique(&mut analysis.email_brochure, email);
            }
        }
        if catalog.email_context_item17.is_match(sentence) {
            for email in &emails {
                push_unique(&mut analysis.email_item17, email);
            }
        }
    }

    if catalog
        .does_not_vote
        .iter()
        .any(|pattern| pattern.regex.is_match(text))
    {
        analysis.does_not_vote_marker = DOES_NOT_VOTE_MARKER.to_string();
    }

    let custodians = match_tags(&catalog.custodians, text);
    if !custodians.is_empty() {
        // Matched for operators only; the output column set is fixed.
        debug!("Custodians mentioned: {}", custodians.join(", "));
    }

    analysis
}

/// Tags of every matching pattern, deduplicated, ordered by position of
/// first match (catalog order breaks ties).
fn match_tags(patterns: &[NamedPattern], text: &str) -> Vec<String> {
    let mut found: Vec<(usize, usize, &str)> = Vec::new();
    for (index, pattern) in patterns.iter().enumerate() {
        if let Some(m) = pattern.regex.find(text) {
            found.push((m.start(), index, pattern.tag));
        }
    }
    found.sort_by_key(|(position, index, _)| (*position, *index));

    let mut tags: Vec<String> = Vec::new();
    for (_, _, tag) in found {
        if !tags.iter().any(|existing| existing == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

/// Sentence byte spans: a sentence ends at a run of `.!?` followed by
/// whitespace or end-of-text. Single left-to-right pass; terminators and the
/// whitespace that follows are ASCII, so every boundary is a char boundary.
fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            let mut end = i + 1;
            while end < bytes.len() && matches!(bytes[end], b'.' | b'!' | b'?') {
                end += 1;
            }
            if end >= bytes.len() || bytes[end].is_ascii_whitespace() {
                spans.push((start, end));
                let mut next = end;
                while next < bytes.len() && bytes[next].is_ascii_whitespace() {
                    next += 1;
                }
                start = next;
                i = next;
                continue;
            }
            i = end;
        } else {
            i += 1;
        }
    }

    if start < bytes.len() {
        spans.push((start, bytes.len()));
    }
    spans
}

/// Sentence surrounding the first ESG-language match, bounded to 500 chars.
fn esg_excerpt(text: &str, catalog: &PatternCatalog, spans: &[(usize, usize)]) -> String {
    let first_match = catalog
        .esg_language
        .iter()
        .filter_map(|pattern| pattern.regex.find(text))
        .min_by_key(|m| m.start());
    let Some(found) = first_match else {
        return String::new();
    };

    let (start, end) = spans
        .iter()
        .find(|(start, end)| *start <= found.start() && found.start() < *end)
        .copied()
        .unwrap_or((0, text.len()));
    truncate_chars(text[start..end].trim(), 500)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((boundary, _)) => text[..boundary].to_string(),
        None => text.to_string(),
    }
}

fn push_unique(values: &mut Vec<String>, candidate: &str) {
    if !values.iter().any(|existing| existing == candidate) {
        values.push(candidate.to_string());
    }
}
