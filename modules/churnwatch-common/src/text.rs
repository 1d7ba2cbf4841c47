/// Truncate to at most `max_chars` characters. Free text is clamped, never rejected.
pub fn clamp_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

/// Clamp an optional field, treating blank strings as absent.
pub fn clamp_opt(s: Option<String>, max_chars: usize) -> Option<String> {
    s.map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(|v| clamp_chars(&v, max_chars).to_string())
}
