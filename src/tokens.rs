//! Advisory token estimation.
//!
//! Estimates are displayed to the user and never used to truncate or reject
//! a request.

/// Characters per token for the fixed-ratio heuristic.
pub const CHARS_PER_TOKEN: usize = 4;

/// Fixed overhead added to every estimated text (role markers, separators).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 5;

/// Structural overhead for a file entry on top of its content and label.
pub const FILE_STRUCTURE_OVERHEAD_TOKENS: usize = 10;

/// `ceil(chars / 4) + MESSAGE_OVERHEAD_TOKENS`. Counts chars, not bytes.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) + MESSAGE_OVERHEAD_TOKENS
}

/// Content tokens plus the synthesized `File: <name>` label and structural overhead.
pub fn estimate_file_tokens(display_name: &str, content: &str) -> usize {
    estimate_tokens(content)
        + estimate_tokens(&format!("File: {display_name}"))
        + FILE_STRUCTURE_OVERHEAD_TOKENS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_costs_only_overhead() {
        assert_eq!(estimate_tokens(""), MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn rounds_up_partial_tokens() {
        assert_eq!(estimate_tokens("a"), 1 + MESSAGE_OVERHEAD_TOKENS);
        assert_eq!(estimate_tokens("abcd"), 1 + MESSAGE_OVERHEAD_TOKENS);
        assert_eq!(estimate_tokens("abcde"), 2 + MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn monotonic_in_length() {
        let mut prev = estimate_tokens("");
        let mut s = String::new();
        for _ in 0..64 {
            s.push('x');
            let cur = estimate_tokens(&s);
            assert!(cur >= prev);
            prev = cur;
        }
    }

    #[test]
    fn counts_chars_not_bytes() {
        assert_eq!(estimate_tokens("éééé"), estimate_tokens("eeee"));
    }

    #[test]
    fn file_estimate_includes_label_and_structure() {
        let content = "x".repeat(40);
        let expected = 10 + MESSAGE_OVERHEAD_TOKENS
            + estimate_tokens("File: notes.txt")
            + FILE_STRUCTURE_OVERHEAD_TOKENS;
        assert_eq!(estimate_file_tokens("notes.txt", &content), expected);
    }
}
