//! Unsupervised statistical keyword extraction
//!
//! A YAKE-style extractor: every term gets a score from local features
//! (casing, position, frequency, relatedness to context, spread across
//! sentences) and candidate phrases combine the scores of their words.
//! Lower scores are better. No corpus or training data is involved.

use super::stopwords::is_stopword;
use crate::config::KeywordConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\p{L}\p{N}](?:[\p{L}\p{N}_'’\-]*[\p{L}\p{N}])?").expect("valid token regex")
});

/// A scored keyword
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub text: String,
    pub score: f64,
}

#[derive(Debug)]
struct Token {
    lower: String,
    sentence: usize,
    chunk: usize,
    sentence_start: bool,
    uppercase: bool,
    acronym: bool,
}

#[derive(Debug, Default)]
struct TermStats {
    tf: usize,
    tf_upper: usize,
    tf_acronym: usize,
    sentence_hits: Vec<usize>,
    left: HashMap<String, usize>,
    right: HashMap<String, usize>,
}

#[derive(Debug)]
struct Candidate {
    terms: Vec<String>,
    count: usize,
}

/// Keyword extractor configured once, used for every message
#[derive(Debug, Clone)]
pub struct KeywordExtractor {
    config: KeywordConfig,
}

impl Default for KeywordExtractor {
    fn default() -> Self {
        Self::new(KeywordConfig::default())
    }
}

impl KeywordExtractor {
    pub fn new(config: KeywordConfig) -> Self {
        Self { config }
    }

    /// Keywords as lowercase strings, best first
    pub fn extract_keywords(&self, text: &str, max_keywords: usize) -> Vec<String> {
        self.extract(text)
            .into_iter()
            .take(max_keywords)
            .map(|k| k.text)
            .collect()
    }

    /// Scored keywords, best (lowest score) first, at most `top_n`
    pub fn extract(&self, text: &str) -> Vec<Keyword> {
        if text.trim().chars().count() < 3 {
            return Vec::new();
        }

        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }
        let sentence_count = tokens.last().map(|t| t.sentence + 1).unwrap_or(1);

        let stats = self.term_stats(&tokens);
        let term_scores = score_terms(&stats, sentence_count);
        if term_scores.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<Keyword> = self
            .candidates(&tokens)
            .into_iter()
            .filter_map(|(text, candidate)| {
                score_candidate(&candidate, &term_scores).map(|score| Keyword { text, score })
            })
            .collect();
        scored.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.text.cmp(&b.text))
        });

        let mut selected: Vec<Keyword> = Vec::new();
        for keyword in scored {
            if selected.len() >= self.config.top_n {
                break;
            }
            if keyword.score > self.config.score_cutoff
                || keyword.text.chars().count() < self.config.min_length
                || keyword.text.chars().all(|c| c.is_ascii_digit())
            {
                continue;
            }
            let duplicate = selected.iter().any(|kept| {
                edit_similarity(&kept.text, &keyword.text) >= self.config.dedup_threshold
            });
            if !duplicate {
                selected.push(keyword);
            }
        }

        debug!(
            keyword_count = selected.len(),
            text_length = text.len(),
            "Extracted keywords"
        );
        selected
    }

    fn term_stats(&self, tokens: &[Token]) -> HashMap<String, TermStats> {
        let mut stats: HashMap<String, TermStats> = HashMap::new();

        for (i, token) in tokens.iter().enumerate() {
            let entry = stats.entry(token.lower.clone()).or_default();
            entry.tf += 1;
            if token.acronym {
                entry.tf_acronym += 1;
            } else if token.uppercase && !token.sentence_start {
                entry.tf_upper += 1;
            }
            entry.sentence_hits.push(token.sentence);

            // Co-occurrence within the window, inside the same punctuation chunk
            let window_start = i.saturating_sub(self.config.window_size);
            for other in &tokens[window_start..i] {
                if other.chunk != token.chunk {
                    continue;
                }
                *stats
                    .entry(token.lower.clone())
                    .or_default()
                    .left
                    .entry(other.lower.clone())
                    .or_default() += 1;
                *stats
                    .entry(other.lower.clone())
                    .or_default()
                    .right
                    .entry(token.lower.clone())
                    .or_default() += 1;
            }
        }

        stats
    }

    fn candidates(&self, tokens: &[Token]) -> HashMap<String, Candidate> {
        let mut candidates: HashMap<String, Candidate> = HashMap::new();

        for start in 0..tokens.len() {
            for len in 1..=self.config.max_ngram {
                let end = start + len;
                if end > tokens.len() {
                    break;
                }
                let span = &tokens[start..end];
                if span.iter().any(|t| t.chunk != span[0].chunk) {
                    break;
                }
                if is_stopword(&span[0].lower) || is_stopword(&span[len - 1].lower) {
                    continue;
                }

                let terms: Vec<String> = span.iter().map(|t| t.lower.clone()).collect();
                let key = terms.join(" ");
                candidates
                    .entry(key)
                    .and_modify(|c| c.count += 1)
                    .or_insert(Candidate { terms, count: 1 });
            }
        }

        candidates
    }
}

/// Split text into tokens, tracking sentence and punctuation-chunk boundaries
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut sentence = 0;
    let mut chunk = 0;
    let mut sentence_start = true;
    let mut last_end = 0;

    for m in TOKEN.find_iter(text) {
        let gap = &text[last_end..m.start()];
        if !tokens.is_empty() {
            if gap.contains(['.', '!', '?', '\n']) {
                sentence += 1;
                chunk += 1;
                sentence_start = true;
            } else if gap
                .chars()
                .any(|c| !c.is_whitespace() && c != '@' && c != '#')
            {
                chunk += 1;
            }
        }

        let raw = m.as_str();
        let letters: Vec<char> = raw.chars().filter(|c| c.is_alphabetic()).collect();
        let acronym = letters.len() > 1 && letters.iter().all(|c| c.is_uppercase());
        let uppercase = raw.chars().next().map(char::is_uppercase).unwrap_or(false);

        tokens.push(Token {
            lower: raw.to_lowercase(),
            sentence,
            chunk,
            sentence_start,
            uppercase,
            acronym,
        });
        sentence_start = false;
        last_end = m.end();
    }

    tokens
}

/// Per-term score H(t); stopwords are left out
fn score_terms(stats: &HashMap<String, TermStats>, sentence_count: usize) -> HashMap<String, f64> {
    let content: Vec<(&String, &TermStats)> = stats
        .iter()
        .filter(|(term, _)| !is_stopword(term))
        .collect();
    if content.is_empty() {
        return HashMap::new();
    }

    let frequencies: Vec<f64> = content.iter().map(|(_, s)| s.tf as f64).collect();
    let n = frequencies.len() as f64;
    let mean = frequencies.iter().sum::<f64>() / n;
    let std = (frequencies.iter().map(|f| (f - mean).powi(2)).sum::<f64>() / n).sqrt();
    let max_tf = frequencies.iter().cloned().fold(1.0, f64::max);

    content
        .into_iter()
        .map(|(term, s)| {
            let tf = s.tf as f64;

            let casing = (s.tf_upper.max(s.tf_acronym) as f64) / (1.0 + tf.ln());
            let position = (3.0 + median(&s.sentence_hits)).ln().ln();
            let frequency = tf / (mean + std);
            let dl = dispersion(&s.left);
            let dr = dispersion(&s.right);
            let relatedness = 1.0 + (dl + dr) * (tf / max_tf);
            let distinct: HashSet<usize> = s.sentence_hits.iter().copied().collect();
            let spread = distinct.len() as f64 / sentence_count as f64;

            let score = (relatedness * position)
                / (casing + frequency / relatedness + spread / relatedness);
            (term.clone(), score)
        })
        .collect()
}

fn score_candidate(candidate: &Candidate, term_scores: &HashMap<String, f64>) -> Option<f64> {
    let mut product = 1.0;
    let mut sum = 0.0;
    let mut scored_terms = 0;
    for term in &candidate.terms {
        // Stopwords inside a phrase contribute nothing
        if let Some(h) = term_scores.get(term) {
            product *= h;
            sum += h;
            scored_terms += 1;
        }
    }
    if scored_terms == 0 {
        return None;
    }
    Some(product / (candidate.count as f64 * (1.0 + sum)))
}

/// Distinct neighbours over total co-occurrences
fn dispersion(neighbours: &HashMap<String, usize>) -> f64 {
    let total: usize = neighbours.values().sum();
    if total == 0 {
        0.0
    } else {
        neighbours.len() as f64 / total as f64
    }
}

fn median(values: &[usize]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    }
}

/// Normalized Levenshtein similarity in [0, 1]
pub fn edit_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (previous[j] + cost)
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    1.0 - previous[b.len()] as f64 / longest as f64
}
