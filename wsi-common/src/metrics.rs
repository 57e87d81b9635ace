//! Pure safety-metric calculators
//!
//! OSHA-standard normalizations: incident rates are per 200,000 hours
//! worked (~100 full-time employees per year), fatality rates per
//! 2,000,000 hours. No I/O, no side effects.

use crate::models::{Metric, MetricSet};

/// Hours basis for TRIR and DART.
pub const OSHA_RATE_HOURS: f64 = 200_000.0;
/// Hours basis for the fatality rate used by the score engine.
pub const DEATH_RATE_HOURS: f64 = 2_000_000.0;
/// Average weeks worked per year.
pub const WEEKS_PER_YEAR: f64 = 52.14;

/// Metrics that do not contribute to `total_incidents`: the derived rates
/// and the DAFW/DJTR entries (day-counts never count as incidents, and the
/// corresponding case-counts are excluded with them).
pub const INCIDENT_EXCLUDED: [Metric; 6] = [
    Metric::Trir,
    Metric::Dart,
    Metric::TotalDafwCases,
    Metric::TotalDafwDays,
    Metric::TotalDjtrCases,
    Metric::TotalDjtrDays,
];

/// Total Recordable Incident Rate. Zero when no hours were worked.
pub fn trir(total_injuries: f64, total_hours_worked: f64) -> f64 {
    if total_hours_worked > 0.0 {
        total_injuries * OSHA_RATE_HOURS / total_hours_worked
    } else {
        0.0
    }
}

/// Days Away, Restricted, or Transferred rate. Zero when no hours were
/// worked.
pub fn dart(total_dafw_cases: f64, total_djtr_cases: f64, total_hours_worked: f64) -> f64 {
    if total_hours_worked > 0.0 {
        (total_dafw_cases + total_djtr_cases) * OSHA_RATE_HOURS / total_hours_worked
    } else {
        0.0
    }
}

/// Average hours worked per employee-week, rounded to the nearest whole
/// hour. Undefined when either input is zero or missing.
pub fn avg_work_week(total_hours_worked: f64, annual_average_employees: f64) -> Option<f64> {
    if total_hours_worked > 0.0 && annual_average_employees > 0.0 {
        Some((total_hours_worked / annual_average_employees / WEEKS_PER_YEAR).round())
    } else {
        None
    }
}

/// Sum of the case-count metrics (day-counts and derived rates excluded).
pub fn total_incidents(metrics: &MetricSet) -> f64 {
    Metric::ALL
        .iter()
        .filter(|m| **m != Metric::TotalIncidents && !INCIDENT_EXCLUDED.contains(m))
        .map(|m| metrics.get(*m))
        .sum()
}

/// Recompute the derived fields (`trir`, `dart`, `total_incidents`) from
/// the raw counts in `metrics`.
pub fn recalc_derived(metrics: &mut MetricSet, total_hours_worked: f64) {
    metrics.trir = trir(metrics.total_injuries, total_hours_worked);
    metrics.dart = dart(
        metrics.total_dafw_cases,
        metrics.total_djtr_cases,
        total_hours_worked,
    );
    metrics.total_incidents = total_incidents(metrics);
}

/// Least-squares linear regression through `points`, evaluated at `x`.
///
/// A single point forecasts itself (flat line).
pub fn forecast_linear_regression(points: &[(f64, f64)], x: f64) -> f64 {
    if points.len() == 1 {
        return points[0].1;
    }

    let n = points.len() as f64;
    let mut sum_x = 0.0;
    let mut sum_x2 = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_y = 0.0;
    for (px, py) in points {
        sum_x += px;
        sum_x2 += px * px;
        sum_xy += px * py;
        sum_y += py;
    }

    let denom = n * sum_x2 - sum_x * sum_x;
    let m = (n * sum_xy - sum_x * sum_y) / denom;
    let b = (sum_y * sum_x2 - sum_x * sum_xy) / denom;
    m * x + b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trir_standard_case() {
        // 10 injuries over 100k hours = 20 per 200k hours
        assert_eq!(trir(10.0, 100_000.0), 20.0);
    }

    #[test]
    fn trir_zero_hours_is_zero() {
        assert_eq!(trir(10.0, 0.0), 0.0);
    }

    #[test]
    fn dart_combines_dafw_and_djtr() {
        assert_eq!(dart(3.0, 2.0, 200_000.0), 5.0);
        assert_eq!(dart(3.0, 2.0, 0.0), 0.0);
    }

    #[test]
    fn avg_work_week_rounds() {
        // 104_280 hours / 50 employees / 52.14 = 40.0
        assert_eq!(avg_work_week(104_280.0, 50.0), Some(40.0));
        assert_eq!(avg_work_week(0.0, 50.0), None);
        assert_eq!(avg_work_week(104_280.0, 0.0), None);
    }

    #[test]
    fn total_incidents_excludes_day_counts_and_rates() {
        let mut m = MetricSet::default();
        m.total_injuries = 2.0;
        m.total_deaths = 1.0;
        m.total_poisonings = 1.0;
        // None of these should count
        m.total_dafw_cases = 5.0;
        m.total_dafw_days = 40.0;
        m.total_djtr_cases = 3.0;
        m.total_djtr_days = 12.0;
        m.trir = 99.0;
        m.dart = 99.0;
        assert_eq!(total_incidents(&m), 4.0);
    }

    #[test]
    fn forecast_two_points_extrapolates() {
        // Through (0, 1) and (1, 3): y = 2x + 1, so y(2) = 5
        let f = forecast_linear_regression(&[(0.0, 1.0), (1.0, 3.0)], 2.0);
        assert!((f - 5.0).abs() < 1e-9);
    }

    #[test]
    fn forecast_single_point_is_flat() {
        assert_eq!(forecast_linear_regression(&[(0.0, 7.0)], 2.0), 7.0);
    }
}
