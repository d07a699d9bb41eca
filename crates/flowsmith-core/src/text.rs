//! Small string helpers shared by the pipeline, loop and orchestrator

use std::collections::HashSet;

/// Drop empty entries and repeats, keeping first-seen order
pub fn dedupe_strings<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in values {
        let value: String = value.into();
        if value.is_empty() || !seen.insert(value.clone()) {
            continue;
        }
        out.push(value);
    }
    out
}

/// Trim every question and drop blanks and repeats
pub fn normalize_questions<I, S>(questions: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    dedupe_strings(
        questions
            .into_iter()
            .map(|q| q.as_ref().trim().to_string())
            .filter(|q| !q.is_empty()),
    )
}

/// Append incoming questions to existing ones, normalized
pub fn merge_questions(existing: &[String], incoming: &[String]) -> Vec<String> {
    normalize_questions(existing.iter().chain(incoming.iter()))
}

/// The last `n` entries of a slice
pub fn tail_strings(values: &[String], n: usize) -> Vec<String> {
    let start = values.len().saturating_sub(n);
    values[start..].to_vec()
}

/// Truncate to at most `max` characters, marking the cut with `...`
pub fn truncate_chars(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max).collect();
    out.push_str("...");
    out
}
