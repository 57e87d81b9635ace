//! Collapsing duplicate Location records into one.
//!
//! Same-year duplicates have their metrics summed into the primary
//! record; duplicates from other filing years keep their metrics but
//! have their identity fields forced to match the primary. The
//! non-primary documents are deleted and the surviving records are
//! flattened back into rows and re-imported, which rebuilds history,
//! companies, and scores from scratch.

use std::sync::Arc;
use tracing::{info, warn};

use wsi_common::models::{CsvSheet, Location, Metric, RawRecord};
use wsi_common::{Error, Result};

use crate::fieldmap::{ARCHIVE_FIELDS, INDUSTRY_FIELDS, MAIN_FIELDS};
use crate::pipeline::{ImportPipeline, RunOptions};
use crate::progress::ImportProgress;
use crate::store::{query_typed, BulkOp, Filter, Query};

/// What a merge hands back: the re-import to poll and the pages whose
/// caches are now stale.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub progress: ImportProgress,
    pub revalidate_urls: Vec<String>,
}

impl ImportPipeline {
    /// Merge the given Location documents. The first id is the primary
    /// record; everything else is folded into it and deleted.
    pub async fn merge_locations(self: &Arc<Self>, ids: &[String]) -> Result<MergeOutcome> {
        if ids.len() < 2 {
            return Err(Error::InvalidInput(
                "merge requires at least two location ids".into(),
            ));
        }

        let query = Query::new().filter(Filter::Or(
            ids.iter().map(|id| Filter::eq("id", id.as_str())).collect(),
        ));
        let mut locs: Vec<Location> =
            query_typed(self.store.locations.as_ref(), &query).await?;
        // Store order is arbitrary; the caller's first id is the primary.
        locs.sort_by_key(|l| ids.iter().position(|id| *id == l.id).unwrap_or(usize::MAX));
        if locs.len() < 2 {
            return Err(Error::NotFound(format!(
                "found {} of {} locations to merge",
                locs.len(),
                ids.len()
            )));
        }
        info!(primary = %locs[0].id, count = locs.len(), "merging locations");

        let mut deletes = Vec::new();
        let mut revalidate_urls = Vec::new();
        let (primary, rest) = locs.split_at_mut(1);
        let primary = &mut primary[0];
        for loc in rest.iter_mut() {
            if loc.year_filing_for == primary.year_filing_for {
                for m in Metric::ALL {
                    primary.metrics.add(m, loc.metrics.get(m));
                }
                primary.annual_average_employees += loc.annual_average_employees;
                primary.total_hours_worked += loc.total_hours_worked;
                let archive = primary.archive.get_or_insert_with(Default::default);
                if let Some(other) = &loc.archive {
                    *archive.no_injuries_illnesses.get_or_insert(0.0) +=
                        other.no_injuries_illnesses.unwrap_or(0.0);
                    *archive.total_other_cases.get_or_insert(0.0) +=
                        other.total_other_cases.unwrap_or(0.0);
                }
            } else {
                loc.industry = primary.industry.clone();
                loc.ein = primary.ein.clone();
                loc.establishment_name = primary.establishment_name.clone();
                loc.street_address = primary.street_address.clone();
                loc.city = primary.city.clone();
                loc.state = primary.state.clone();
                loc.zip_code = primary.zip_code;
                let archive = loc.archive.get_or_insert_with(Default::default);
                archive.establishment_id = primary
                    .archive
                    .as_ref()
                    .and_then(|a| a.establishment_id.clone());
            }

            deletes.push(BulkOp::Delete { id: loc.id.clone() });
            revalidate_urls.push(self.revalidator.company_page(&loc.place));
            revalidate_urls.push(self.revalidator.location_page(&loc.location_id));
        }

        // Re-import only the survivors: the primary plus duplicates
        // whose year differs. Re-importing an absorbed same-year row
        // would just recreate the document we are deleting.
        let primary_year = primary.year_filing_for;
        let survivors: Vec<&Location> = locs
            .iter()
            .enumerate()
            .filter(|(i, l)| *i == 0 || l.year_filing_for != primary_year)
            .map(|(_, l)| l)
            .collect();
        let sheet = flatten_locations(&survivors)?;

        let results = self.store.locations.bulk(&deletes).await?;
        for (op, result) in deletes.iter().zip(results) {
            if !result.is_success() {
                warn!(
                    id = op.target_id().unwrap_or_default(),
                    status = result.status,
                    "merged location delete failed"
                );
            }
        }

        let progress = self
            .begin_import(
                sheet,
                RunOptions {
                    filename: Some("merge".to_owned()),
                    check_input_for_latest: true,
                    ..RunOptions::default()
                },
            )
            .await?;
        Ok(MergeOutcome {
            progress,
            revalidate_urls,
        })
    }
}

/// Flatten stored documents back into canonical-header CSV rows that
/// field mapping will recognize verbatim.
fn flatten_locations(locs: &[&Location]) -> Result<CsvSheet> {
    let mut headers: Vec<String> = vec!["place".to_owned()];
    headers.extend(MAIN_FIELDS.iter().map(|f| (*f).to_owned()));
    headers.extend(INDUSTRY_FIELDS.iter().map(|f| (*f).to_owned()));
    headers.extend(ARCHIVE_FIELDS.iter().map(|f| (*f).to_owned()));

    let mut rows = Vec::with_capacity(locs.len());
    for loc in locs {
        let doc = serde_json::to_value(loc)?;
        let mut row = RawRecord::new();
        row.insert("place".to_owned(), loc.place.clone());
        for field in MAIN_FIELDS {
            if let Some(cell) = cell_text(doc.get(*field)) {
                row.insert((*field).to_owned(), cell);
            }
        }
        if let Some(industry) = &loc.industry {
            if let Some(code) = industry.naics_code {
                row.insert("naics_code".to_owned(), code.to_string());
            }
            if let Some(caption) = &industry.caption {
                row.insert("industry_description".to_owned(), caption.clone());
            }
        }
        if let Some(archive) = doc.get("archive") {
            for field in ARCHIVE_FIELDS {
                if let Some(cell) = cell_text(archive.get(*field)) {
                    row.insert((*field).to_owned(), cell);
                }
            }
        }
        rows.push(row);
    }
    Ok(CsvSheet { headers, rows })
}

fn cell_text(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else {
                n.as_f64().map(|f| {
                    if f.fract() == 0.0 {
                        format!("{}", f as i64)
                    } else {
                        f.to_string()
                    }
                })
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(id: &str, place: &str, year: i32, injuries: f64) -> Location {
        let mut l = Location::new();
        l.id = id.to_owned();
        l.location_id = format!("est-{id}");
        l.place = place.to_owned();
        l.company_name = "Acme".to_owned();
        l.year_filing_for = year;
        l.annual_average_employees = 10.0;
        l.total_hours_worked = 20_000.0;
        l.metrics.total_injuries = injuries;
        l
    }

    #[test]
    fn flatten_emits_canonical_headers() {
        let a = loc("a", "acme", 2023, 2.0);
        let sheet = flatten_locations(&[&a]).unwrap();
        assert_eq!(sheet.rows.len(), 1);
        let row = &sheet.rows[0];
        assert_eq!(row.get("place").unwrap(), "acme");
        assert_eq!(row.get("company_name").unwrap(), "Acme");
        assert_eq!(row.get("year_filing_for").unwrap(), "2023");
        assert_eq!(row.get("total_injuries").unwrap(), "2");
        assert_eq!(row.get("total_hours_worked").unwrap(), "20000");
    }

    #[test]
    fn cell_text_strips_integral_fractions() {
        use serde_json::json;
        assert_eq!(cell_text(Some(&json!(12.0))), Some("12".to_owned()));
        assert_eq!(cell_text(Some(&json!(12.5))), Some("12.5".to_owned()));
        assert_eq!(cell_text(Some(&json!("x"))), Some("x".to_owned()));
        assert_eq!(cell_text(Some(&json!(null))), None);
        assert_eq!(cell_text(None), None);
    }
}
