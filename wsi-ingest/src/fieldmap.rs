//! Fuzzy mapping of sheet headers onto canonical OSHA field names.
//!
//! Government exports rename columns between years ("Total DAFW Cases",
//! "total_dafw_cases", "Annual average employees"), so headers are
//! normalized and then matched against the canonical lists by string
//! similarity. A header claims the best-scoring unclaimed field at or
//! above the threshold, trying the main list first, then industry, then
//! archive; anything unmatched is reported back so the operator can see
//! what the import ignored.

use std::collections::HashMap;

use wsi_common::models::{CsvSheet, RawRecord};
use wsi_common::text::{coerce_number, coerce_string};
use wsi_common::{Error, Result, Similarity};

/// Canonical location-level fields, in match priority order.
pub const MAIN_FIELDS: &[&str] = &[
    "ein",
    "year_filing_for",
    "company_name",
    "establishment_name",
    "street_address",
    "city",
    "state",
    "zip_code",
    "annual_average_employees",
    "total_hours_worked",
    "total_deaths",
    "total_dafw_cases",
    "total_dafw_days",
    "total_djtr_cases",
    "total_djtr_days",
    "total_injuries",
    "total_poisonings",
    "total_respiratory_conditions",
    "total_skin_disorders",
    "total_hearing_loss",
    "total_other_illnesses",
];

pub const INDUSTRY_FIELDS: &[&str] = &["naics_code", "industry_description"];

pub const ARCHIVE_FIELDS: &[&str] = &[
    "id",
    "no_injuries_illnesses",
    "total_other_cases",
    "establishment_id",
    "establishment_type",
    "size",
    "created_timestamp",
    "change_reason",
];

/// Canonical field -> source header, per field group, for one sheet.
#[derive(Debug, Clone, Default)]
pub struct FieldMap {
    pub main: HashMap<&'static str, String>,
    pub industry: HashMap<&'static str, String>,
    pub archive: HashMap<&'static str, String>,
    pub unused_fields: Vec<String>,
}

impl FieldMap {
    /// Build the map for a sheet's headers.
    ///
    /// Deterministic for a given header set: headers are considered in
    /// sheet order and each canonical field is claimed at most once.
    pub fn generate(sheet: &CsvSheet, sim: &dyn Similarity, threshold: f64) -> Result<FieldMap> {
        if sheet.rows.is_empty() {
            return Err(Error::InvalidInput("no rows in csv worksheet".into()));
        }

        let mut map = FieldMap::default();
        for header in &sheet.headers {
            let normalized = normalize_header(header);
            if let Some(field) = best_match(&normalized, MAIN_FIELDS, &map.main, sim, threshold) {
                map.main.insert(field, header.clone());
            } else if let Some(field) =
                best_match(&normalized, INDUSTRY_FIELDS, &map.industry, sim, threshold)
            {
                map.industry.insert(field, header.clone());
            } else if let Some(field) =
                best_match(&normalized, ARCHIVE_FIELDS, &map.archive, sim, threshold)
            {
                map.archive.insert(field, header.clone());
            } else {
                map.unused_fields.push(header.clone());
            }
        }
        Ok(map)
    }

    pub fn main_str(&self, row: &RawRecord, field: &str) -> Option<String> {
        coerce_string(cell(&self.main, row, field))
    }

    pub fn main_num(&self, row: &RawRecord, field: &str) -> Option<f64> {
        coerce_number(cell(&self.main, row, field))
    }

    pub fn industry_str(&self, row: &RawRecord, field: &str) -> Option<String> {
        coerce_string(cell(&self.industry, row, field))
    }

    pub fn industry_num(&self, row: &RawRecord, field: &str) -> Option<f64> {
        coerce_number(cell(&self.industry, row, field))
    }

    pub fn archive_str(&self, row: &RawRecord, field: &str) -> Option<String> {
        coerce_string(cell(&self.archive, row, field))
    }

    pub fn archive_num(&self, row: &RawRecord, field: &str) -> Option<f64> {
        coerce_number(cell(&self.archive, row, field))
    }
}

fn cell<'a>(
    group: &HashMap<&'static str, String>,
    row: &'a RawRecord,
    field: &str,
) -> Option<&'a str> {
    let header = group.get(field)?;
    row.get(header).map(String::as_str)
}

/// Lowercase and collapse every non-alphanumeric run to an underscore,
/// so "Total Hours Worked" compares against "total_hours_worked".
pub fn normalize_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut pending_sep = false;
    for ch in header.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

fn best_match(
    normalized: &str,
    fields: &[&'static str],
    claimed: &HashMap<&'static str, String>,
    sim: &dyn Similarity,
    threshold: f64,
) -> Option<&'static str> {
    fields
        .iter()
        .filter(|f| !claimed.contains_key(*f))
        .map(|f| (*f, sim.score(f, normalized)))
        .filter(|(_, score)| *score >= threshold)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(f, _)| f)
}
