/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Returns the byte offset of the first `[` or `{`, skipping leading noise
/// such as `,`, `:` or stray quotes that precede an embedded payload.
pub fn first_bracket_offset(s: &str) -> Option<usize> {
    s.find(|c: char| c == '[' || c == '{')
}
