//! Persisted document models shared across WSI services
//!
//! `Location` is one establishment's safety record for one filing year;
//! `Company` is the umbrella aggregate of all Locations sharing a `place`
//! for one filing year. Among documents sharing an identity
//! (`location_id` or `place`), at most one carries `is_latest = true` and
//! it is the one with the maximum `year_filing_for`.
//!
//! Serde renames preserve the wire-format field names used by the public
//! directory (`isLatest`, `locationId`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One raw CSV row: cell text keyed by original column header.
pub type RawRecord = std::collections::HashMap<String, String>;

/// A parsed CSV file: ordered headers plus its rows.
///
/// Header order is preserved from the source file so field-map generation
/// is deterministic for a given file.
#[derive(Debug, Clone, Default)]
pub struct CsvSheet {
    pub headers: Vec<String>,
    pub rows: Vec<RawRecord>,
}

/// The 14 per-year safety metrics tracked on every Location and Company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TotalIncidents,
    TotalDeaths,
    TotalInjuries,
    TotalDafwCases,
    TotalDafwDays,
    TotalDjtrCases,
    TotalDjtrDays,
    TotalPoisonings,
    TotalRespiratoryConditions,
    TotalSkinDisorders,
    TotalHearingLoss,
    TotalOtherIllnesses,
    Trir,
    Dart,
}

impl Metric {
    pub const ALL: [Metric; 14] = [
        Metric::TotalIncidents,
        Metric::TotalDeaths,
        Metric::TotalInjuries,
        Metric::TotalDafwCases,
        Metric::TotalDafwDays,
        Metric::TotalDjtrCases,
        Metric::TotalDjtrDays,
        Metric::TotalPoisonings,
        Metric::TotalRespiratoryConditions,
        Metric::TotalSkinDisorders,
        Metric::TotalHearingLoss,
        Metric::TotalOtherIllnesses,
        Metric::Trir,
        Metric::Dart,
    ];

    /// Canonical snake_case field name (matches the CSV schema and the
    /// persisted document keys).
    pub fn name(self) -> &'static str {
        match self {
            Metric::TotalIncidents => "total_incidents",
            Metric::TotalDeaths => "total_deaths",
            Metric::TotalInjuries => "total_injuries",
            Metric::TotalDafwCases => "total_dafw_cases",
            Metric::TotalDafwDays => "total_dafw_days",
            Metric::TotalDjtrCases => "total_djtr_cases",
            Metric::TotalDjtrDays => "total_djtr_days",
            Metric::TotalPoisonings => "total_poisonings",
            Metric::TotalRespiratoryConditions => "total_respiratory_conditions",
            Metric::TotalSkinDisorders => "total_skin_disorders",
            Metric::TotalHearingLoss => "total_hearing_loss",
            Metric::TotalOtherIllnesses => "total_other_illnesses",
            Metric::Trir => "trir",
            Metric::Dart => "dart",
        }
    }
}

/// All 14 metric values for one entity-year.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricSet {
    pub total_incidents: f64,
    pub total_deaths: f64,
    pub total_injuries: f64,
    pub total_dafw_cases: f64,
    pub total_dafw_days: f64,
    pub total_djtr_cases: f64,
    pub total_djtr_days: f64,
    pub total_poisonings: f64,
    pub total_respiratory_conditions: f64,
    pub total_skin_disorders: f64,
    pub total_hearing_loss: f64,
    pub total_other_illnesses: f64,
    pub trir: f64,
    pub dart: f64,
}

impl MetricSet {
    pub fn get(&self, m: Metric) -> f64 {
        match m {
            Metric::TotalIncidents => self.total_incidents,
            Metric::TotalDeaths => self.total_deaths,
            Metric::TotalInjuries => self.total_injuries,
            Metric::TotalDafwCases => self.total_dafw_cases,
            Metric::TotalDafwDays => self.total_dafw_days,
            Metric::TotalDjtrCases => self.total_djtr_cases,
            Metric::TotalDjtrDays => self.total_djtr_days,
            Metric::TotalPoisonings => self.total_poisonings,
            Metric::TotalRespiratoryConditions => self.total_respiratory_conditions,
            Metric::TotalSkinDisorders => self.total_skin_disorders,
            Metric::TotalHearingLoss => self.total_hearing_loss,
            Metric::TotalOtherIllnesses => self.total_other_illnesses,
            Metric::Trir => self.trir,
            Metric::Dart => self.dart,
        }
    }

    pub fn set(&mut self, m: Metric, v: f64) {
        match m {
            Metric::TotalIncidents => self.total_incidents = v,
            Metric::TotalDeaths => self.total_deaths = v,
            Metric::TotalInjuries => self.total_injuries = v,
            Metric::TotalDafwCases => self.total_dafw_cases = v,
            Metric::TotalDafwDays => self.total_dafw_days = v,
            Metric::TotalDjtrCases => self.total_djtr_cases = v,
            Metric::TotalDjtrDays => self.total_djtr_days = v,
            Metric::TotalPoisonings => self.total_poisonings = v,
            Metric::TotalRespiratoryConditions => self.total_respiratory_conditions = v,
            Metric::TotalSkinDisorders => self.total_skin_disorders = v,
            Metric::TotalHearingLoss => self.total_hearing_loss = v,
            Metric::TotalOtherIllnesses => self.total_other_illnesses = v,
            Metric::Trir => self.trir = v,
            Metric::Dart => self.dart = v,
        }
    }

    pub fn add(&mut self, m: Metric, v: f64) {
        self.set(m, self.get(m) + v);
    }

    /// Element-wise accumulate another set into this one.
    pub fn add_all(&mut self, other: &MetricSet) {
        for m in Metric::ALL {
            self.add(m, other.get(m));
        }
    }
}

/// NAICS industry classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Industry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub naics_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// One industry's share of a Company, weighted by employees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndustryShare {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub naics_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub annual_average_employees: f64,
}

/// Legacy / optional fields carried through import without interpretation.
///
/// Unexpected CSV columns land in `extra` so no source data is dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Archive {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_injuries_illnesses: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_other_cases: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub establishment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub establishment_type: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_reason: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl Archive {
    pub fn is_empty(&self) -> bool {
        *self == Archive::default()
    }
}

/// A single establishment's safety record for one filing year.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    /// Per-year document id: `loc-{location_id}-{year_filing_for}`
    pub id: String,
    /// Stable identity across filing years for this physical establishment
    #[serde(rename = "locationId")]
    pub location_id: String,
    /// Owning Company document id
    pub parent: String,
    /// Owning Company place slug
    pub place: String,
    /// Schema version for tracking what fields this document carries
    pub version: u32,
    pub created: DateTime<Utc>,
    #[serde(rename = "isLatest")]
    pub is_latest: bool,

    pub year_filing_for: i32,
    pub company_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub establishment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ein: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<Industry>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<u32>,

    pub annual_average_employees: f64,
    pub total_hours_worked: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_work_week: Option<f64>,

    #[serde(flatten)]
    pub metrics: MetricSet,
    /// Average of all years leading up to (but not including) this year
    #[serde(skip_serializing_if = "Option::is_none")]
    pub past_averages: Option<MetricSet>,

    // Search fields
    pub tokenized: Vec<String>,
    #[serde(rename = "tokenizedCompanyName")]
    pub tokenized_company_name: Vec<String>,
    #[serde(rename = "charCount")]
    pub char_count: BTreeMap<char, u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<Archive>,
}

impl Location {
    /// Empty record with a fresh random document id (replaced once the
    /// `location_id` and year are known).
    pub fn new() -> Self {
        Location {
            id: Uuid::new_v4().to_string(),
            location_id: String::new(),
            parent: String::new(),
            place: String::new(),
            version: 1,
            created: Utc::now(),
            is_latest: true,
            year_filing_for: 0,
            company_name: String::new(),
            establishment_name: None,
            ein: None,
            industry: None,
            street_address: None,
            city: None,
            state: None,
            zip_code: None,
            annual_average_employees: 0.0,
            total_hours_worked: 0.0,
            avg_work_week: None,
            metrics: MetricSet::default(),
            past_averages: None,
            tokenized: Vec::new(),
            tokenized_company_name: Vec::new(),
            char_count: BTreeMap::new(),
            archive: None,
        }
    }

    pub fn doc_id(location_id: &str, year: i32) -> String {
        format!("loc-{}-{}", location_id, year)
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::new()
    }
}

/// Umbrella aggregate of all Locations sharing a `place` for one year.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    /// Per-year document id: `company-{place}-{year_filing_for}`
    pub id: String,
    /// Human-readable slug shared by all years of this business
    pub place: String,
    pub version: u32,
    pub created: DateTime<Utc>,
    #[serde(rename = "isLatest")]
    pub is_latest: bool,

    pub year_filing_for: i32,
    pub company_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ein: Option<String>,
    /// All distinct EINs seen across child Locations
    pub eins: Vec<String>,
    /// Employee-weighted-dominant industry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<Industry>,
    /// All represented industries, sorted by summed employees descending
    pub industries: Vec<IndustryShare>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<u32>,

    pub num_locations: u32,
    pub annual_average_employees: f64,
    pub total_hours_worked: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_work_week: Option<f64>,

    #[serde(flatten)]
    pub metrics: MetricSet,
    pub averages_per_loc: MetricSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub past_averages: Option<MetricSet>,

    // Presentational fields carried forward from the prior year
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(rename = "headerImg", skip_serializing_if = "Option::is_none")]
    pub header_img: Option<String>,
    pub num_reviews: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_review: Option<f64>,
    pub popularity: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wsi_score: Option<WsiScore>,

    // Search fields
    pub tokenized: Vec<String>,
    #[serde(rename = "tokenizedCompanyName")]
    pub tokenized_company_name: Vec<String>,
    #[serde(rename = "charCount")]
    pub char_count: BTreeMap<char, u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<Archive>,
}

impl Company {
    pub fn new(place: String, year_filing_for: i32) -> Self {
        let mut company = Company {
            id: String::new(),
            place,
            version: 1,
            created: Utc::now(),
            is_latest: true,
            year_filing_for,
            company_name: String::new(),
            ein: None,
            eins: Vec::new(),
            industry: None,
            industries: Vec::new(),
            street_address: None,
            city: None,
            state: None,
            zip_code: None,
            num_locations: 0,
            annual_average_employees: 0.0,
            total_hours_worked: 0.0,
            avg_work_week: None,
            metrics: MetricSet::default(),
            averages_per_loc: MetricSet::default(),
            past_averages: None,
            website: None,
            logo: None,
            header_img: None,
            num_reviews: 0,
            average_review: None,
            popularity: 0.0,
            wsi_score: None,
            tokenized: Vec::new(),
            tokenized_company_name: Vec::new(),
            char_count: BTreeMap::new(),
            archive: None,
        };
        company.id = Company::doc_id(&company.place, company.year_filing_for);
        company
    }

    pub fn doc_id(place: &str, year: i32) -> String {
        format!("company-{}-{}", place, year)
    }
}

/// Per (NAICS code, filing year) aggregate across all imported Locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndustryInfo {
    /// `ind-{naics_code}-{year_filing_for}`
    pub id: String,
    pub naics_code: u32,
    /// All captions observed for this code
    pub captions: Vec<String>,
    pub year_filing_for: i32,
    /// Total number of locations in this industry-year
    pub num_locations: u32,
    /// Employee-weighted metric averages (sums until finalized at upload)
    pub averages: MetricSet,
    /// Average composite score across scored companies in this industry-year
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_score: Option<f64>,
    pub version: u32,
}

impl IndustryInfo {
    pub fn new(naics_code: u32, year_filing_for: i32) -> Self {
        IndustryInfo {
            id: format!("ind-{}-{}", naics_code, year_filing_for),
            naics_code,
            captions: Vec::new(),
            year_filing_for,
            num_locations: 0,
            averages: MetricSet::default(),
            average_score: None,
            version: 1,
        }
    }
}

/// One factor of the composite safety score. Positive impact is good.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreFactor {
    pub key: FactorKey,
    pub impact: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKey {
    Trir,
    TrirForecast,
    TrirDiffAvg,
    Dart,
    DartDiffAvg,
    AvgDeathRate,
    UserReviews,
}

/// Explainable composite safety score, 4..=100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsiScore {
    pub score: i32,
    pub positives: Vec<ScoreFactor>,
    pub negatives: Vec<ScoreFactor>,
    /// Raw untruncated impacts, present only in editor/preview mode
    #[serde(rename = "allFactors", skip_serializing_if = "Option::is_none")]
    pub all_factors: Option<BTreeMap<FactorKey, f64>>,
}

/// Tunable factor weights for the score engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub trir: f64,
    pub trir_forecast: f64,
    pub trir_diff_avg: f64,
    pub dart: f64,
    pub dart_diff_avg: f64,
    pub avg_death_rate: f64,
    pub user_reviews: f64,
    /// Each factor's impact magnitude is capped at `weight * max_multiplier`
    #[serde(rename = "maxMultiplier")]
    pub max_multiplier: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        ScoreWeights {
            trir: 2.0,
            trir_forecast: 2.0,
            trir_diff_avg: 2.0,
            dart: 2.0,
            dart_diff_avg: 2.0,
            avg_death_rate: 4.0,
            user_reviews: 2.0,
            max_multiplier: 8.0,
        }
    }
}

/// Row-level import error, persisted to the errors collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub task: ErrorTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub col: Option<String>,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub filename: String,
    pub nonce: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorTask {
    ParseLocation,
    ParseCompany,
    UploadLocation,
    UploadCompany,
    PatchLocation,
    PatchCompany,
    UploadIndustry,
}

/// Static NAICS reference entry for one (code, year).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NaicsInfo {
    pub year_filing_for: i32,
    pub caption: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trir: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dart: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_roundtrip_all_fields() {
        let mut set = MetricSet::default();
        for (i, m) in Metric::ALL.iter().enumerate() {
            set.set(*m, i as f64);
        }
        for (i, m) in Metric::ALL.iter().enumerate() {
            assert_eq!(set.get(*m), i as f64, "{}", m.name());
        }
    }

    #[test]
    fn location_doc_id_is_stable() {
        assert_eq!(Location::doc_id("abc", 2021), "loc-abc-2021");
        assert_eq!(Company::doc_id("target", 2021), "company-target-2021");
    }

    #[test]
    fn location_serializes_wire_names() {
        let loc = Location::new();
        let v = serde_json::to_value(&loc).unwrap();
        assert!(v.get("isLatest").is_some());
        assert!(v.get("locationId").is_some());
        assert!(v.get("tokenizedCompanyName").is_some());
        // Metric fields are flattened to top level
        assert!(v.get("total_injuries").is_some());
    }

    #[test]
    fn archive_extra_fields_flatten() {
        let mut archive = Archive::default();
        archive
            .extra
            .insert("some_unknown_column".to_string(), "x".to_string());
        let v = serde_json::to_value(&archive).unwrap();
        assert_eq!(v.get("some_unknown_column").unwrap(), "x");
    }
}
