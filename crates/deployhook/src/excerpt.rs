/// Collapses `raw` onto a single line and caps it at `max_chars`, appending `...` when
/// anything was cut. Empty input renders as `-`.
pub fn shorten(raw: &str, max_chars: usize) -> String {
    let single_line = raw
        .replace(['\r', '\n', '\t'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if single_line.is_empty() {
        return "-".to_string();
    }

    if single_line.chars().count() <= max_chars {
        return single_line;
    }

    let mut shortened = single_line.chars().take(max_chars).collect::<String>();
    shortened.push_str("...");
    shortened
}

/// Keeps the last `max_chars` characters of `raw` on one line. Command failures put the
/// useful part of their output at the end.
pub fn tail(raw: &str, max_chars: usize) -> String {
    let single_line = shorten(raw, usize::MAX);
    let count = single_line.chars().count();
    if count <= max_chars {
        return single_line;
    }

    let kept = single_line.chars().skip(count - max_chars).collect::<String>();
    format!("...{kept}")
}
