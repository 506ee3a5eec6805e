//! External literature cross-check for synthesized answers.
//!
//! Advisory only: the verifier reads nothing from the store and writes
//! nothing anywhere. Any failure (disabled, network error, rate limit,
//! unparseable response) degrades to `None`, reported to the caller as
//! "verification skipped", never as a failed search.

use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::config::VerifierConfig;
use crate::embedding::tokenize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub verified: bool,
    pub confidence: Confidence,
    pub concerns: Vec<String>,
    pub suggested_followup_queries: Vec<String>,
}

pub struct Verifier {
    enabled: bool,
    endpoint: String,
    client: reqwest::Client,
}

impl Verifier {
    pub fn new(config: &VerifierConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            enabled: config.enabled,
            endpoint: config.endpoint.clone(),
            client,
        }
    }

    /// Cross-check an answer against the literature index. `None` means
    /// skipped, not failed.
    pub async fn verify(&self, query: &str, answer: &str) -> Option<VerificationReport> {
        if !self.enabled {
            return None;
        }
        let term = search_term(query, answer);
        if term.is_empty() {
            return None;
        }

        let count = match self.literature_hits(&term).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "literature lookup failed; verification skipped");
                return None;
            }
        };

        let (verified, confidence) = match count {
            0 => (false, Confidence::Low),
            1..=9 => (true, Confidence::Low),
            10..=99 => (true, Confidence::Medium),
            _ => (true, Confidence::High),
        };
        let mut concerns = Vec::new();
        if count == 0 {
            concerns.push(format!(
                "no literature results found for '{}'; the answer may rest on local sources only",
                term
            ));
        } else if count < 10 {
            concerns.push(format!("only {} literature results for '{}'", count, term));
        }

        Some(VerificationReport {
            verified,
            confidence,
            concerns,
            suggested_followup_queries: followup_queries(query, answer),
        })
    }

    /// esearch-style JSON: `{"esearchresult": {"count": "123", ...}}`.
    async fn literature_hits(&self, term: &str) -> anyhow::Result<u64> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("db", "pubmed"), ("retmode", "json"), ("term", term)])
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("literature API returned {}", response.status());
        }
        let body: serde_json::Value = response.json().await?;
        let count = body["esearchresult"]["count"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing esearchresult.count"))?
            .parse::<u64>()?;
        Ok(count)
    }
}

/// Distinctive terms shared by query and answer, longest first, capped so
/// the external query stays selective.
fn search_term(query: &str, answer: &str) -> String {
    let answer_terms: HashSet<String> = tokenize(answer).into_iter().collect();
    let mut terms: Vec<String> = tokenize(query)
        .into_iter()
        .filter(|t| t.len() > 3 && answer_terms.contains(t))
        .collect();
    if terms.is_empty() {
        terms = tokenize(query).into_iter().filter(|t| t.len() > 3).collect();
    }
    terms.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    terms.dedup();
    terms.truncate(5);
    terms.join(" AND ")
}

fn followup_queries(query: &str, answer: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for term in tokenize(answer) {
        if term.len() > 6 && seen.insert(term.clone()) {
            out.push(format!("{} {}", query.trim(), term));
        }
        if out.len() == 3 {
            break;
        }
    }
    out
}
