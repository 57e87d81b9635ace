//! Cache revalidation paths for public pages touched by a job.
//!
//! The pipeline only collects paths; actually invalidating an edge or
//! page cache belongs to the embedding application. Paths are reported
//! on small imports and skipped on big ones, where revalidating
//! thousands of pages one by one would cost more than letting caches
//! expire naturally.

/// Maps changed entities to the public page paths that show them.
pub trait Revalidator: Send + Sync {
    fn company_page(&self, place: &str) -> String;
    fn location_page(&self, location_id: &str) -> String;
}

/// Default path scheme of the public site.
pub struct SummaryPages;

impl Revalidator for SummaryPages {
    fn company_page(&self, place: &str) -> String {
        format!("/summary/{place}")
    }

    fn location_page(&self, location_id: &str) -> String {
        format!("/location/{location_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths() {
        assert_eq!(SummaryPages.company_page("acme-steel"), "/summary/acme-steel");
        assert_eq!(SummaryPages.location_page("abc-123"), "/location/abc-123");
    }
}
