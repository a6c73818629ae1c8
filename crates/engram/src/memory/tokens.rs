//! Token-count unit shared by filtering and usage accounting.
//!
//! A token is a whitespace-separated word. This is an approximation, but it
//! is the same unit everywhere (length filter, capacity, usage ratio), which
//! is what the policy depends on.

/// Count whitespace-separated words
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Truncate to at most `max_chars` characters, appending "..." when cut
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
