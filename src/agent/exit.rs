//! Loop-exit heuristics: response stability and completion signals.

use std::collections::HashSet;

/// Pairwise similarity above this means the conversation has stabilized.
pub const SIMILARITY_EXIT_THRESHOLD: f64 = 0.8;

/// Stock sign-off phrases that indicate the model considers the query
/// answered. Matched case-insensitively as substrings.
const COMPLETION_SIGNALS: [&str; 9] = [
    "i hope this helps",
    "let me know if",
    "is there anything else",
    "does this answer",
    "please let me know",
    "i've provided",
    "here's the information",
    "that's all",
    "i'm done",
];

pub fn indicates_completion(content: &str) -> bool {
    let lower = content.to_lowercase();
    COMPLETION_SIGNALS.iter().any(|signal| lower.contains(signal))
}

/// Stability score over recent response bodies: the mean of a word-count
/// ratio, the Jaccard index of lower-cased word sets, a half-weighted
/// sentence-count ratio, and a 0.8 term when every response ends with
/// the same terminal-punctuation class.
pub fn response_similarity(responses: &[String]) -> f64 {
    if responses.len() < 2 {
        return 0.0;
    }

    let mut scores: Vec<f64> = Vec::new();

    let lengths: Vec<usize> = responses.iter().map(|r| r.split_whitespace().count()).collect();
    let max_len = lengths.iter().copied().max().unwrap_or(0);
    let min_len = lengths.iter().copied().min().unwrap_or(0);
    if max_len > 0 {
        scores.push(1.0 - (max_len - min_len) as f64 / max_len as f64);
    }

    let word_sets: Vec<HashSet<String>> = responses
        .iter()
        .map(|r| r.to_lowercase().split_whitespace().map(str::to_string).collect())
        .collect();
    let union: HashSet<&String> = word_sets.iter().flatten().collect();
    if !union.is_empty() {
        let common = word_sets[0]
            .iter()
            .filter(|word| word_sets.iter().all(|set| set.contains(*word)))
            .count();
        scores.push(common as f64 / union.len() as f64);
    }

    let sentence_counts: Vec<usize> = responses.iter().map(|r| sentence_count(r)).collect();
    let max_sentences = sentence_counts.iter().copied().max().unwrap_or(0);
    let min_sentences = sentence_counts.iter().copied().min().unwrap_or(0);
    if max_sentences > 0 {
        scores.push((1.0 - (max_sentences - min_sentences) as f64 / max_sentences as f64) * 0.5);
    }

    let endings: Vec<char> = responses
        .iter()
        .map(|r| match r.trim_end().chars().last() {
            Some(c @ ('.' | '!' | '?')) => c,
            _ => ' ',
        })
        .collect();
    if endings.windows(2).all(|pair| pair[0] == pair[1]) {
        scores.push(0.8);
    }

    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// Segments produced by splitting on runs of `.`, `!`, `?` (a trailing
/// separator still yields an empty final segment).
fn sentence_count(text: &str) -> usize {
    let mut count = 1usize;
    let mut in_separator = false;
    for c in text.chars() {
        if matches!(c, '.' | '!' | '?') {
            if !in_separator {
                count += 1;
                in_separator = true;
            }
        } else {
            in_separator = false;
        }
    }
    count
}
