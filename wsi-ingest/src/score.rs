//! Composite safety score for a Company.
//!
//! Every factor contributes a signed impact (positive is good), capped
//! in magnitude at `weight * max_multiplier`. The final score is
//! `floor(100 + sum_of_impacts)` clamped to 4..=100, and the factor
//! lists shown to readers are truncated by score band so a strong score
//! leads with its strengths and a weak one with its problems.

use std::collections::BTreeMap;

use wsi_common::metrics::{forecast_linear_regression, DEATH_RATE_HOURS};
use wsi_common::models::{Company, FactorKey, NaicsInfo, ScoreFactor, ScoreWeights, WsiScore};

const TRIR_NO_OVERLAP: [FactorKey; 2] = [FactorKey::Trir, FactorKey::TrirDiffAvg];
const DART_NO_OVERLAP: [FactorKey; 2] = [FactorKey::Dart, FactorKey::DartDiffAvg];

/// Compute the score for a company.
///
/// `naics_history` is this company's industry average TRIR/DART over
/// recent years; the relative factors are skipped when it is empty or
/// has gaps. `include_all_factors` additionally returns the raw,
/// untruncated impact of every factor (preview/editor mode).
pub fn calc_score(
    company: &Company,
    weights: &ScoreWeights,
    naics_history: &[NaicsInfo],
    include_all_factors: bool,
) -> WsiScore {
    let mut factors: Vec<ScoreFactor> = Vec::new();
    let push = |factors: &mut Vec<ScoreFactor>, key: FactorKey, weight: f64, raw: f64| {
        let cap = (weight * weights.max_multiplier).abs();
        factors.push(ScoreFactor {
            key,
            impact: -raw.clamp(-cap, cap),
        });
    };

    push(
        &mut factors,
        FactorKey::Trir,
        weights.trir,
        weights.trir * company.metrics.trir,
    );
    push(
        &mut factors,
        FactorKey::Dart,
        weights.dart,
        weights.dart * company.metrics.dart,
    );

    if let Some(past) = &company.past_averages {
        // Extrapolate one year past the current one from the two points
        // we always have, then judge the trend against their midpoint.
        let forecast = forecast_linear_regression(
            &[(0.0, past.trir), (1.0, company.metrics.trir)],
            2.0,
        );
        push(
            &mut factors,
            FactorKey::TrirForecast,
            weights.trir_forecast,
            weights.trir_forecast * forecast - (past.trir + company.metrics.trir) / 2.0,
        );

        let has_industry = company
            .industry
            .as_ref()
            .and_then(|i| i.naics_code)
            .is_some();
        if has_industry && !naics_history.is_empty() {
            if naics_history.iter().all(|n| n.trir.is_some()) {
                let industry_avg = naics_history
                    .iter()
                    .filter_map(|n| n.trir)
                    .sum::<f64>()
                    / naics_history.len() as f64;
                let blended = (past.trir * 2.0 + company.metrics.trir) / 3.0;
                push(
                    &mut factors,
                    FactorKey::TrirDiffAvg,
                    weights.trir_diff_avg,
                    weights.trir_diff_avg * (blended - industry_avg),
                );
            }
            if naics_history.iter().all(|n| n.dart.is_some()) {
                let industry_avg = naics_history
                    .iter()
                    .filter_map(|n| n.dart)
                    .sum::<f64>()
                    / naics_history.len() as f64;
                let blended = (past.dart * 2.0 + company.metrics.dart) / 3.0;
                push(
                    &mut factors,
                    FactorKey::DartDiffAvg,
                    weights.dart_diff_avg,
                    weights.dart_diff_avg * (blended - industry_avg),
                );
            }
        }
    }

    let past_deaths = company
        .past_averages
        .as_ref()
        .map(|p| p.total_deaths)
        .unwrap_or(company.metrics.total_deaths);
    let death_rate = if company.total_hours_worked > 0.0 {
        (past_deaths * 2.0 + company.metrics.total_deaths) / 3.0 * DEATH_RATE_HOURS
            / company.total_hours_worked
    } else {
        0.0
    };
    push(
        &mut factors,
        FactorKey::AvgDeathRate,
        weights.avg_death_rate,
        weights.avg_death_rate * death_rate,
    );

    if let Some(average_review) = company.average_review {
        // 4.0 is treated as the neutral review rating.
        push(
            &mut factors,
            FactorKey::UserReviews,
            weights.user_reviews,
            weights.user_reviews * (4.0 - average_review),
        );
    }

    let sum: f64 = factors.iter().map(|f| f.impact).sum();
    let score = (100.0 + sum).floor().clamp(4.0, 100.0) as i32;

    let mut positives: Vec<ScoreFactor> = factors.iter().copied().filter(|f| f.impact > 0.0).collect();
    let mut negatives: Vec<ScoreFactor> = factors.iter().copied().filter(|f| f.impact < 0.0).collect();
    positives.sort_by(|a, b| {
        b.impact
            .abs()
            .partial_cmp(&a.impact.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    negatives.sort_by(|a, b| {
        b.impact
            .abs()
            .partial_cmp(&a.impact.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // A metric cannot count both for and against the company: if its
    // absolute or industry-relative reading is a strength, drop the
    // sibling reading from the weaknesses.
    if positives.iter().any(|p| TRIR_NO_OVERLAP.contains(&p.key)) {
        negatives.retain(|n| !TRIR_NO_OVERLAP.contains(&n.key));
    }
    if positives.iter().any(|p| DART_NO_OVERLAP.contains(&p.key)) {
        negatives.retain(|n| !DART_NO_OVERLAP.contains(&n.key));
    }

    let (keep_pos, keep_neg) = match score {
        s if s >= 90 => (4, 0),
        s if s >= 80 => (3, 1),
        s if s >= 70 => (2, 2),
        s if s >= 50 => (1, 3),
        _ => (0, 4),
    };
    positives.truncate(keep_pos);
    negatives.truncate(keep_neg);

    let all_factors = include_all_factors.then(|| {
        factors
            .iter()
            .map(|f| (f.key, f.impact))
            .collect::<BTreeMap<FactorKey, f64>>()
    });

    WsiScore {
        score,
        positives,
        negatives,
        all_factors,
    }
}
