//! Normalized text similarity.

/// Lowercase and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity in `[0, 1]`; 1.0 means identical after normalization.
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize(a), &normalize(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_is_case_insensitive() {
        assert_eq!(similarity("Hello World", "hello   world"), 1.0);
        assert_eq!(similarity("", "   "), 1.0);
    }

    #[test]
    fn test_similarity_range() {
        let s = similarity("buy cheap tokens now", "buy cheap tokens now!");
        assert!(s > 0.9 && s < 1.0);
        assert!(similarity("abc", "xyz") < 0.1);
    }
}
