//! Name similarity scoring

/// Lower-case, trim, and collapse internal whitespace.
pub fn normalize(name: &str) -> String {
    name.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized Levenshtein similarity in `[0, 1]`.
pub fn ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

/// Best `ratio` of the shorter string against every same-length window of
/// the longer one. A surname alone scores 1.0 against the full name.
pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    let short_len = short.chars().count();
    if short_len == 0 {
        return if long.is_empty() { 1.0 } else { 0.0 };
    }

    let long_chars: Vec<char> = long.chars().collect();
    long_chars
        .windows(short_len)
        .map(|window| {
            let window: String = window.iter().collect();
            ratio(short, &window)
        })
        .fold(0.0, f64::max)
}

/// `ratio` after sorting whitespace-separated tokens, so word order does
/// not matter ("Levi Dana" vs "Dana Levi").
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    ratio(&sorted_tokens(a), &sorted_tokens(b))
}

fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Combined similarity of two names: the best of the three measures on
/// normalized input.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    ratio(&a, &b)
        .max(partial_ratio(&a, &b))
        .max(token_sort_ratio(&a, &b))
}
