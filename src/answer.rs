//! Extractive answer synthesis.
//!
//! The answer is assembled strictly from retrieved chunk text: per source,
//! the sentences with the highest query-term overlap are lifted verbatim and
//! tagged with a `[n]` marker whose number is the 1-based rank of that source
//! in the result list. Because nothing is generated, every marker sits next
//! to text that its source actually contains.
//!
//! A remote fallback exists for queries the local corpus cannot answer; its
//! output carries no citation markers and the response flags it as fallback.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::collections::HashSet;

use crate::embedding::tokenize;
use crate::models::{Citation, SearchResult};

/// Sources consulted per answer; more than this adds noise, not grounding.
const MAX_SOURCES: usize = 3;
/// Sentences lifted per source.
const MAX_SENTENCES_PER_SOURCE: usize = 2;

#[derive(Debug, Clone)]
pub struct SynthesizedAnswer {
    pub text: String,
    /// Citation `[n]` maps to `citations[n-1]`.
    pub citations: Vec<Citation>,
}

/// Compose a cited answer from ranked results. Returns `None` when there is
/// nothing to cite.
pub fn synthesize(query: &str, results: &[SearchResult]) -> Option<SynthesizedAnswer> {
    if results.is_empty() {
        return None;
    }

    let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
    let mut parts: Vec<String> = Vec::new();

    for (rank, result) in results.iter().take(MAX_SOURCES).enumerate() {
        let marker = rank + 1;
        let sentences = split_sentences(&result.text);
        if sentences.is_empty() {
            continue;
        }

        let mut scored: Vec<(usize, f64)> = sentences
            .iter()
            .enumerate()
            .map(|(i, s)| (i, overlap_score(s, &query_terms)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut picked: Vec<usize> = scored
            .iter()
            .take_while(|(_, score)| *score > 0.0)
            .take(MAX_SENTENCES_PER_SOURCE)
            .map(|(i, _)| *i)
            .collect();
        // The top source always contributes, even without term overlap:
        // it earned its rank on the dense channel.
        if picked.is_empty() && rank == 0 {
            picked.push(0);
        }
        if picked.is_empty() {
            continue;
        }
        // Emit in document order so the span reads naturally.
        picked.sort_unstable();

        let span = picked
            .iter()
            .map(|&i| sentences[i].trim())
            .collect::<Vec<_>>()
            .join(" ");
        parts.push(format!("{} [{}]", span, marker));
    }

    if parts.is_empty() {
        return None;
    }

    Some(SynthesizedAnswer {
        text: parts.join(" "),
        citations: results
            .iter()
            .take(MAX_SOURCES)
            .map(|r| r.citation.clone())
            .collect(),
    })
}

fn overlap_score(sentence: &str, query_terms: &HashSet<String>) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let terms = tokenize(sentence);
    if terms.is_empty() {
        return 0.0;
    }
    let hits = terms.iter().filter(|t| query_terms.contains(*t)).count();
    hits as f64 / query_terms.len() as f64
}

/// Split on sentence-ending punctuation followed by whitespace. Abbreviation
/// false positives are tolerable here; spans are cited verbatim either way.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            if chars.peek().map_or(true, |n| n.is_whitespace()) {
                let s = current.trim();
                if !s.is_empty() {
                    out.push(s.to_string());
                }
                current.clear();
            }
        }
    }
    let s = current.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
    out
}

/// Ask a remote chat model directly when local retrieval is too thin.
/// Requires `OPENAI_API_KEY`; the caller flags the response as fallback.
pub async fn remote_fallback_answer(
    client: &reqwest::Client,
    model: &str,
    query: &str,
) -> Result<String> {
    let api_key =
        std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

    let body = json!({
        "model": model,
        "messages": [
            {
                "role": "system",
                "content": "You are a clinical reference assistant. Answer concisely. \
                            If you are not confident, say so explicitly."
            },
            { "role": "user", "content": query }
        ],
        "temperature": 0.2,
    });

    let response = client
        .post("https://api.openai.com/v1/chat/completions")
        .header("Authorization", format!("Bearer {}", api_key))
        .json(&body)
        .send()
        .await
        .context("remote answer request failed")?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        bail!("remote answer API error {}: {}", status, text);
    }

    let parsed: serde_json::Value = response.json().await?;
    let answer = parsed["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("remote answer response missing content"))?
        .trim()
        .to_string();
    if answer.is_empty() {
        bail!("remote answer response was empty");
    }
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Citation;

    fn result(rank: usize, text: &str) -> SearchResult {
        SearchResult {
            chunk_id: format!("c{}", rank),
            score: 1.0 - rank as f64 * 0.1,
            dense_score: 0.8,
            lexical_score: 0.6,
            text: text.to_string(),
            citation: Citation {
                document_id: format!("d{}", rank),
                filename: format!("doc{}.txt", rank),
                section: None,
                category: Some("cardiology".to_string()),
                year: Some(2023),
                chunk_index: 0,
            },
        }
    }

    #[test]
    fn test_empty_results_yield_no_answer() {
        assert!(synthesize("chest pain", &[]).is_none());
    }

    #[test]
    fn test_markers_map_to_rank_order() {
        let results = vec![
            result(0, "Aspirin is indicated for chest pain. Dosage varies."),
            result(1, "Nitroglycerin relieves chest pain in angina."),
        ];
        let answer = synthesize("chest pain treatment", &results).unwrap();
        assert!(answer.text.contains("[1]"));
        assert!(answer.text.contains("[2]"));
        let one = answer.text.find("[1]").unwrap();
        let two = answer.text.find("[2]").unwrap();
        assert!(one < two);
        assert_eq!(answer.citations.len(), 2);
        assert_eq!(answer.citations[0].document_id, "d0");
    }

    #[test]
    fn test_markers_follow_supporting_text() {
        let results = vec![result(
            0,
            "Beta blockers reduce mortality after infarction. Unrelated trivia here.",
        )];
        let answer = synthesize("beta blockers infarction", &results).unwrap();
        assert!(answer
            .text
            .starts_with("Beta blockers reduce mortality after infarction."));
        assert!(answer.text.contains("[1]"));
        assert!(!answer.text.contains("Unrelated trivia"));
    }

    #[test]
    fn test_top_source_used_even_without_overlap() {
        let results = vec![result(0, "Semantically relevant but different wording.")];
        let answer = synthesize("cardiac arrest protocol", &results).unwrap();
        assert!(answer.text.contains("[1]"));
    }

    #[test]
    fn test_sentence_split_handles_trailing_fragment() {
        let sentences = split_sentences("First point. Second point without period");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[1], "Second point without period");
    }
}
