//! Token Counting Utility
//!
//! Heuristic token estimation for UI progress counters. Authoritative usage
//! reported by the upstream always overrides these estimates.

/// Estimator for token counts without a real tokenizer.
pub struct TokenEstimator;

impl TokenEstimator {
    /// Estimate token count for a text fragment.
    ///
    /// Every character counts as 1; CJK ideographs count as 2. This is a
    /// display heuristic, not a billing-accurate count. O(n), pure.
    pub fn estimate_text_tokens(text: &str) -> usize {
        text.chars()
            .map(|c| if Self::is_cjk(c) { 2 } else { 1 })
            .sum()
    }

    // Core CJK ideograph range, matching the weighting the UI has always used.
    fn is_cjk(c: char) -> bool {
        ('\u{4e00}'..='\u{9fa5}').contains(&c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(TokenEstimator::estimate_text_tokens(""), 0);
    }

    #[test]
    fn test_ascii_counts_per_char() {
        assert_eq!(TokenEstimator::estimate_text_tokens("hello"), 5);
        assert_eq!(TokenEstimator::estimate_text_tokens("a b,c"), 5);
    }

    #[test]
    fn test_cjk_counts_double() {
        assert_eq!(TokenEstimator::estimate_text_tokens("知识"), 4);
        // Mixed: 2 CJK chars (4) + "ab" (2) + space (1)
        assert_eq!(TokenEstimator::estimate_text_tokens("知识 ab"), 7);
    }

    #[test]
    fn test_monotonic_under_append() {
        let mut s = String::new();
        let mut last = 0;
        for c in ['x', '图', ' ', '\n', '!', '片'] {
            s.push(c);
            let est = TokenEstimator::estimate_text_tokens(&s);
            assert!(est >= last);
            last = est;
        }
    }

    #[test]
    fn test_fragment_sums_equal_whole() {
        let a = "SVG 封面";
        let b = "卡片 body";
        let whole = format!("{}{}", a, b);
        assert_eq!(
            TokenEstimator::estimate_text_tokens(a) + TokenEstimator::estimate_text_tokens(b),
            TokenEstimator::estimate_text_tokens(&whole)
        );
    }
}
