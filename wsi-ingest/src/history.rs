//! Rolling history across filing years for one identity.
//!
//! Locations share a `location_id` and companies a `place` across
//! years. When a new year's record arrives, its `past_averages` extends
//! the prior year's running mean, and exactly one record per identity
//! keeps `isLatest` set.

use wsi_common::models::{Metric, MetricSet};

/// Slim view of an already-persisted record for the same identity.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    #[serde(default)]
    pub year_filing_for: i32,
    #[serde(rename = "isLatest")]
    pub is_latest: Option<bool>,
    #[serde(flatten)]
    pub metrics: MetricSet,
    pub past_averages: Option<MetricSet>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryOutcome {
    /// Running mean of all prior years, when the immediately preceding
    /// year exists; `None` leaves the field unset.
    pub past_averages: Option<MetricSet>,
    pub is_latest: bool,
    /// Ids of older records whose `isLatest` flag must be cleared.
    /// Empty unless the new record is itself the latest.
    pub demote_ids: Vec<String>,
}

/// Fold a new filing year into the identity's history.
///
/// **Algorithm:** with `prev` the record for `year - 1` and `n` the
/// count of records strictly before `year`, each past-average metric is
/// `(prev_past_avg * (n - 1) + prev_raw) / n`, seeding the mean from
/// zeros when `prev` carries no averages of its own. A gap at `year -
/// 1` produces no averages at all, so a sparse history never mixes
/// non-adjacent years.
pub fn evaluate(year: i32, history: &[HistoryRecord]) -> HistoryOutcome {
    let (is_latest, demote_ids) = latest_and_demotions(year, history);
    let mut outcome = HistoryOutcome {
        is_latest,
        demote_ids,
        ..HistoryOutcome::default()
    };

    if let Some(prev) = history.iter().find(|h| h.year_filing_for == year - 1) {
        let n = history.iter().filter(|h| h.year_filing_for < year).count();
        outcome.past_averages = Some(fold_past_averages(
            prev.past_averages.as_ref(),
            &prev.metrics,
            n,
        ));
    }
    outcome
}

/// Extend a prior year's running mean by one more year of raw metrics.
pub fn fold_past_averages(
    prev_past: Option<&MetricSet>,
    prev_metrics: &MetricSet,
    num_older: usize,
) -> MetricSet {
    let n = num_older as f64;
    let mut averages = prev_past.cloned().unwrap_or_default();
    for m in Metric::ALL {
        let folded = (averages.get(m) * (n - 1.0) + prev_metrics.get(m)) / n;
        averages.set(m, folded);
    }
    averages
}

/// Whether `year` is the newest on record, and which older records
/// still wrongly carry the latest flag.
pub fn latest_and_demotions(year: i32, history: &[HistoryRecord]) -> (bool, Vec<String>) {
    if history.iter().any(|h| h.year_filing_for > year) {
        return (false, Vec::new());
    }
    let demote = history
        .iter()
        .filter(|h| h.is_latest != Some(false) && h.year_filing_for < year)
        .map(|h| h.id.clone())
        .collect();
    (true, demote)
}

/// Batch-local latest check: rows in the same input claiming a later
/// year for this identity also strip the flag, even before they are
/// persisted.
pub fn input_claims_later_year(year: i32, input_years: &[i32]) -> bool {
    input_years.iter().any(|y| *y > year)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, year: i32, trir: f64, past_trir: Option<f64>) -> HistoryRecord {
        let mut metrics = MetricSet::default();
        metrics.set(Metric::Trir, trir);
        HistoryRecord {
            id: id.into(),
            year_filing_for: year,
            is_latest: None,
            metrics,
            past_averages: past_trir.map(|t| {
                let mut m = MetricSet::default();
                m.set(Metric::Trir, t);
                m
            }),
        }
    }

    #[test]
    fn first_year_has_no_averages_and_is_latest() {
        let outcome = evaluate(2020, &[]);
        assert!(outcome.past_averages.is_none());
        assert!(outcome.is_latest);
        assert!(outcome.demote_ids.is_empty());
    }

    #[test]
    fn past_average_is_running_mean_of_prior_years() {
        // 2020: trir 2.0, 2021: trir 4.0 (past avg 2.0), now 2022.
        let history = vec![
            record("loc-a-2021", 2021, 4.0, Some(2.0)),
            record("loc-a-2020", 2020, 2.0, None),
        ];
        let outcome = evaluate(2022, &history);
        let averages = outcome.past_averages.unwrap();
        // Mean of the two prior raw values: (2.0 + 4.0) / 2.
        assert!((averages.trir - 3.0).abs() < 1e-9);
    }

    #[test]
    fn missing_previous_year_leaves_averages_unset() {
        let history = vec![record("loc-a-2019", 2019, 2.0, None)];
        let outcome = evaluate(2022, &history);
        assert!(outcome.past_averages.is_none());
        assert!(outcome.is_latest);
    }

    #[test]
    fn newer_record_in_store_wins_latest() {
        let history = vec![record("loc-a-2023", 2023, 1.0, None)];
        let outcome = evaluate(2022, &history);
        assert!(!outcome.is_latest);
        assert!(outcome.demote_ids.is_empty());
    }

    #[test]
    fn older_latest_records_are_demoted() {
        let mut stale = record("loc-a-2021", 2021, 1.0, None);
        stale.is_latest = Some(true);
        let mut already_cleared = record("loc-a-2020", 2020, 1.0, None);
        already_cleared.is_latest = Some(false);
        let outcome = evaluate(2022, &[stale, already_cleared]);
        assert!(outcome.is_latest);
        assert_eq!(outcome.demote_ids, vec!["loc-a-2021".to_string()]);
    }

    #[test]
    fn input_rows_can_strip_latest() {
        assert!(input_claims_later_year(2021, &[2020, 2022]));
        assert!(!input_claims_later_year(2022, &[2020, 2021, 2022]));
    }
}
