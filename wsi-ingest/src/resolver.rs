//! Entity resolution: which establishment and which company a row is.
//!
//! A row resolves to a stable `location_id` through its archive
//! establishment id when present, a tokenized match against previously
//! stored locations otherwise, and a fresh UUID as a last resort.
//! Companies resolve through an in-batch directory keyed by EIN and by
//! lowercased name, falling back to fuzzy matching against companies
//! already in the store. Directory creation is re-checked after every
//! await, since twenty workers race to claim the same employer.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use wsi_common::models::Location;
use wsi_common::text::{slugify, tokenize_location, tokenize_string};
use wsi_common::{Result, Similarity};

use crate::aggregate::CompanyEmbryo;
use crate::history::HistoryRecord;
use crate::store::{query_typed, Collection, Filter, Order, Query};

/// A stored location for the same identity, with its lineage fields.
#[derive(Debug, Clone, Deserialize)]
pub struct SameLocation {
    #[serde(flatten)]
    pub record: HistoryRecord,
    #[serde(default)]
    pub place: String,
    #[serde(default)]
    pub parent: String,
}

/// Shared handle to a company still being assembled.
pub type EmbryoHandle = Arc<Mutex<CompanyEmbryo>>;

/// In-batch companies, reachable by EIN key and by name key.
///
/// Keys are `{ein}-{year}` and `{lowercased name}-{year}`, so the same
/// employer filing under two spellings of its name still meets at its
/// EIN. The name-key insertion order doubles as the work list for the
/// company phase.
#[derive(Default)]
pub struct CompanyDirectory {
    inner: Mutex<DirectoryInner>,
}

#[derive(Default)]
struct DirectoryInner {
    by_key: HashMap<String, EmbryoHandle>,
    /// place slug -> lowercased company name that owns it
    slug_owner: HashMap<String, String>,
    name_keys: Vec<String>,
}

impl CompanyDirectory {
    pub fn new() -> Self {
        CompanyDirectory::default()
    }

    pub fn ein_key(ein: Option<&str>, year: i32) -> Option<String> {
        ein.map(|e| format!("{e}-{year}"))
    }

    pub fn name_key(company_name: &str, year: i32) -> String {
        format!("{}-{year}", company_name.to_lowercase())
    }

    /// EIN key wins over name key, matching resolution priority.
    pub fn lookup(&self, ein_key: Option<&str>, name_key: &str) -> Option<EmbryoHandle> {
        let inner = self.inner.lock().expect("directory poisoned");
        ein_key
            .and_then(|k| inner.by_key.get(k))
            .or_else(|| inner.by_key.get(name_key))
            .cloned()
    }

    /// True when the slug is already claimed by a different company name.
    pub fn slug_conflicts(&self, slug: &str, company_name_lower: &str) -> bool {
        let inner = self.inner.lock().expect("directory poisoned");
        inner
            .slug_owner
            .get(slug)
            .is_some_and(|owner| owner != company_name_lower)
    }

    /// Final atomic check-and-insert. Returns the embryo and whether
    /// this call created it.
    pub fn get_or_create(
        &self,
        ein_key: Option<&str>,
        name_key: &str,
        place: &str,
        company_name_lower: &str,
        year: i32,
    ) -> (EmbryoHandle, bool) {
        let mut inner = self.inner.lock().expect("directory poisoned");
        if let Some(existing) = ein_key
            .and_then(|k| inner.by_key.get(k))
            .or_else(|| inner.by_key.get(name_key))
        {
            return (Arc::clone(existing), false);
        }
        let embryo: EmbryoHandle = Arc::new(Mutex::new(CompanyEmbryo::new(place.to_owned(), year)));
        inner.by_key.insert(name_key.to_owned(), Arc::clone(&embryo));
        if let Some(k) = ein_key {
            inner.by_key.insert(k.to_owned(), Arc::clone(&embryo));
        }
        inner
            .slug_owner
            .insert(place.to_owned(), company_name_lower.to_owned());
        inner.name_keys.push(name_key.to_owned());
        (embryo, true)
    }

    /// Number of distinct companies discovered so far.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("directory poisoned").name_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key_at(&self, idx: usize) -> Option<String> {
        self.inner
            .lock()
            .expect("directory poisoned")
            .name_keys
            .get(idx)
            .cloned()
    }

    pub fn embryo_for_key(&self, key: &str) -> Option<EmbryoHandle> {
        self.inner
            .lock()
            .expect("directory poisoned")
            .by_key
            .get(key)
            .cloned()
    }

    /// All embryos, for cross-referencing years within the same batch.
    pub fn all_embryos(&self) -> Vec<EmbryoHandle> {
        let inner = self.inner.lock().expect("directory poisoned");
        inner
            .name_keys
            .iter()
            .filter_map(|k| inner.by_key.get(k))
            .cloned()
            .collect()
    }
}

/// Queries that tie a parsed row to existing identities.
pub struct EntityResolver {
    pub locations: Arc<dyn Collection>,
    pub companies: Arc<dyn Collection>,
    pub similarity: Arc<dyn Similarity>,
    pub company_threshold: f64,
    pub years_back: usize,
}

impl EntityResolver {
    /// Stable identity for this establishment.
    ///
    /// Priority: the government's own establishment id, then the oldest
    /// stored location matching every search token, then a new UUID.
    pub async fn resolve_location_id(&self, loc: &Location) -> Result<String> {
        if let Some(id) = loc
            .archive
            .as_ref()
            .and_then(|a| a.establishment_id.as_deref())
        {
            return Ok(id.to_owned());
        }

        // The first token is the full joined string; match on the rest.
        let tokens = tokenize_location(loc);
        let mut query = Query::new()
            .order_by("year_filing_for", Order::Desc)
            .limit(1);
        for token in tokens.iter().skip(1) {
            query = query.filter(Filter::array_contains("tokenized", token.as_str()));
        }
        if query.filters.is_empty() {
            return Ok(Uuid::new_v4().to_string());
        }

        #[derive(Deserialize)]
        struct Slim {
            #[serde(rename = "locationId")]
            location_id: String,
        }
        let hits: Vec<Slim> = query_typed(self.locations.as_ref(), &query).await?;
        match hits.into_iter().next() {
            Some(hit) => {
                debug!(location_id = %hit.location_id, "matched existing location by tokens");
                Ok(hit.location_id)
            }
            None => Ok(Uuid::new_v4().to_string()),
        }
    }

    /// Stored filing years for this identity, newest first.
    pub async fn location_history(&self, location_id: &str) -> Result<Vec<SameLocation>> {
        let query = Query::new()
            .filter(Filter::eq("locationId", location_id))
            .order_by("year_filing_for", Order::Desc)
            .limit(self.years_back);
        query_typed(self.locations.as_ref(), &query).await
    }

    /// Place slug of a stored company matching this row by EIN or by
    /// fuzzy company name.
    pub async fn find_existing_place(&self, loc: &Location) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct Slim {
            place: String,
            #[serde(default)]
            company_name: String,
            #[serde(default)]
            eins: Vec<String>,
        }

        let name_tokens = tokenize_string(&loc.company_name);
        let token_match = Filter::And(
            name_tokens
                .iter()
                .map(|t| Filter::array_contains("tokenized", t.as_str()))
                .collect(),
        );
        let filter = match &loc.ein {
            Some(ein) => Filter::Or(vec![Filter::eq("ein", ein.as_str()), token_match]),
            None => token_match,
        };
        let query = Query::new().filter(filter).limit(self.years_back);
        let candidates: Vec<Slim> = query_typed(self.companies.as_ref(), &query).await?;

        for candidate in candidates {
            let ein_match = loc
                .ein
                .as_ref()
                .is_some_and(|ein| candidate.eins.contains(ein));
            if ein_match
                || self
                    .similarity
                    .score(&loc.company_name, &candidate.company_name)
                    >= self.company_threshold
            {
                return Ok(Some(candidate.place));
            }
        }
        Ok(None)
    }

    /// Slug no stored or in-batch company owns yet; a numeric suffix
    /// resolves collisions between distinct employers with the same name.
    pub async fn unique_slug(
        &self,
        company_name: &str,
        directory: &CompanyDirectory,
    ) -> Result<String> {
        let name_lower = company_name.to_lowercase();
        let mut suffix = 0;
        loop {
            let slug = slugify(company_name, suffix);
            let taken_in_batch = directory.slug_conflicts(&slug, &name_lower);
            let taken_in_store = !taken_in_batch
                && self
                    .companies
                    .count(&Query::new().filter(Filter::eq("place", slug.as_str())))
                    .await?
                    > 0;
            if !taken_in_batch && !taken_in_store {
                return Ok(slug);
            }
            suffix += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCollection;
    use serde_json::json;
    use wsi_common::JaroWinkler;

    fn resolver(
        locations: Arc<MemoryCollection>,
        companies: Arc<MemoryCollection>,
    ) -> EntityResolver {
        EntityResolver {
            locations,
            companies,
            similarity: Arc::new(JaroWinkler),
            company_threshold: 0.9,
            years_back: 20,
        }
    }

    fn loc(name: &str, ein: Option<&str>) -> Location {
        let mut l = Location::new();
        l.company_name = name.into();
        l.year_filing_for = 2022;
        l.ein = ein.map(str::to_owned);
        l.tokenized = tokenize_location(&l);
        l
    }

    #[tokio::test]
    async fn establishment_id_short_circuits() {
        let resolver = resolver(
            Arc::new(MemoryCollection::new("locations")),
            Arc::new(MemoryCollection::new("companies")),
        );
        let mut l = loc("Acme Steel", None);
        l.archive = Some(wsi_common::models::Archive {
            establishment_id: Some("555001".into()),
            ..Default::default()
        });
        assert_eq!(resolver.resolve_location_id(&l).await.unwrap(), "555001");
    }

    #[tokio::test]
    async fn token_match_reuses_stored_identity() {
        let locations = Arc::new(MemoryCollection::new("locations"));
        let mut stored = loc("Acme Steel", None);
        stored.location_id = "est-777".into();
        locations
            .upsert(serde_json::to_value(&stored).unwrap())
            .await
            .unwrap();
        let resolver = resolver(locations, Arc::new(MemoryCollection::new("companies")));
        let incoming = loc("Acme Steel", None);
        assert_eq!(
            resolver.resolve_location_id(&incoming).await.unwrap(),
            stored.location_id
        );
    }

    #[tokio::test]
    async fn no_match_mints_fresh_identity() {
        let resolver = resolver(
            Arc::new(MemoryCollection::new("locations")),
            Arc::new(MemoryCollection::new("companies")),
        );
        let a = resolver
            .resolve_location_id(&loc("Acme Steel", None))
            .await
            .unwrap();
        let b = resolver
            .resolve_location_id(&loc("Acme Steel", None))
            .await
            .unwrap();
        // Nothing got stored in between, so ids are independent UUIDs.
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn fuzzy_company_match_finds_place() {
        let companies = Arc::new(MemoryCollection::new("companies"));
        companies
            .upsert(json!({
                "id": "company-acme-steel-2021",
                "place": "acme-steel",
                "company_name": "Acme Steel Inc",
                "ein": "12-3456",
                "eins": ["12-3456"],
                "tokenized": ["acme steel inc", "acme", "steel", "inc"],
            }))
            .await
            .unwrap();
        let resolver = resolver(Arc::new(MemoryCollection::new("locations")), companies);
        let by_ein = resolver
            .find_existing_place(&loc("Totally Different", Some("12-3456")))
            .await
            .unwrap();
        assert_eq!(by_ein.as_deref(), Some("acme-steel"));
        let by_name = resolver
            .find_existing_place(&loc("Acme Steel Inc", None))
            .await
            .unwrap();
        assert_eq!(by_name.as_deref(), Some("acme-steel"));
        let miss = resolver
            .find_existing_place(&loc("Bravo Concrete", None))
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn slug_suffixes_resolve_collisions() {
        let companies = Arc::new(MemoryCollection::new("companies"));
        companies
            .upsert(json!({"id": "company-acme-steel-2021", "place": "acme-steel"}))
            .await
            .unwrap();
        let resolver = resolver(Arc::new(MemoryCollection::new("locations")), companies);
        let directory = CompanyDirectory::new();
        let slug = resolver
            .unique_slug("Acme Steel", &directory)
            .await
            .unwrap();
        assert_eq!(slug, "acme-steel-1");
    }

    #[tokio::test]
    async fn same_name_reuses_batch_slug() {
        let resolver = resolver(
            Arc::new(MemoryCollection::new("locations")),
            Arc::new(MemoryCollection::new("companies")),
        );
        let directory = CompanyDirectory::new();
        directory.get_or_create(None, "acme steel-2022", "acme-steel", "acme steel", 2022);
        // Identical name is not a conflict: both rows belong to the
        // same employer and land on the same slug.
        let slug = resolver
            .unique_slug("Acme Steel", &directory)
            .await
            .unwrap();
        assert_eq!(slug, "acme-steel");
    }

    #[test]
    fn directory_create_is_idempotent() {
        let directory = CompanyDirectory::new();
        let (a, created_a) =
            directory.get_or_create(Some("12-3456-2022"), "acme-2022", "acme", "acme", 2022);
        let (b, created_b) =
            directory.get_or_create(Some("12-3456-2022"), "acme alt-2022", "acme", "acme alt", 2022);
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(directory.len(), 1);
    }
}
