//! Fuzzy string-similarity capability
//!
//! Both column-header matching and company/location deduplication go
//! through this trait so the concrete algorithm can be swapped without
//! touching resolution logic.

/// Normalized string similarity in `[0, 1]` (1 = identical).
pub trait Similarity: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Jaro-Winkler similarity, case-insensitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct JaroWinkler;

impl Similarity for JaroWinkler {
    fn score(&self, a: &str, b: &str) -> f64 {
        strsim::jaro_winkler(&a.to_lowercase(), &b.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_score_one() {
        assert_eq!(JaroWinkler.score("acme", "ACME"), 1.0);
    }

    #[test]
    fn near_matches_score_high() {
        assert!(JaroWinkler.score("company_name", "company name") > 0.9);
        assert!(JaroWinkler.score("walmart", "wal-mart") > 0.9);
    }

    #[test]
    fn unrelated_strings_score_low() {
        assert!(JaroWinkler.score("acme widgets", "zebra logistics") < 0.6);
    }
}
