//! Company aggregation, history, and scoring.

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use wsi_common::models::{Company, ErrorRecord, ErrorTask, Location};
use wsi_common::{Error, Result};

use crate::aggregate;
use crate::history::{self, HistoryRecord};
use crate::score::calc_score;
use crate::store::{BulkOp, Filter, Order, PatchOp, Query};

use super::{ImportPipeline, ProcessingState};

pub(super) async fn process_company(p: &ImportPipeline, state: &ProcessingState, idx: usize) {
    if let Err(e) = build_company(p, state, idx).await {
        debug!(company = idx, error = %e, "company failed to build");
        state.company_channel.record_error();
        state.progress.add_both(1);
        state.errors.lock().expect("error list poisoned").push(ErrorRecord {
            id: Uuid::new_v4().to_string(),
            task: ErrorTask::ParseCompany,
            col: None,
            msg: e.to_string(),
            data: None,
            filename: state.progress.filename().to_owned(),
            nonce: state.progress.nonce().to_owned(),
            created: Utc::now(),
        });
    }
}

async fn build_company(p: &ImportPipeline, state: &ProcessingState, idx: usize) -> Result<()> {
    let key = state
        .directory
        .key_at(idx)
        .ok_or_else(|| Error::Internal(format!("no company at index {idx}")))?;
    let embryo_handle = state
        .directory
        .embryo_for_key(&key)
        .ok_or_else(|| Error::Internal(format!("no embryo for key {key}")))?;
    let mut embryo = embryo_handle.lock().expect("embryo poisoned").clone();

    // Child locations were uploaded in the previous phase; page through
    // the store rather than holding them all in memory.
    let parent_id = embryo.company.id.clone();
    let query = Query::new().filter(Filter::eq("parent", parent_id.as_str()));
    let mut offset = 0usize;
    loop {
        let page = self_page(p, &query, offset).await?;
        for value in &page.items {
            let loc: Location = serde_json::from_value(value.clone())?;
            embryo.add_location(&loc);
        }
        match page.continuation {
            Some(next) => offset = next,
            None => break,
        }
    }

    let mut company = embryo.finalize();

    let mut same_companies = stored_same_place(p, &company.place).await?;
    // Multi-year sheets can carry this company's other years in the
    // same batch; those take precedence over whatever is stored.
    if state.multiple_years() {
        for other in state.directory.all_embryos() {
            let snapshot = other.lock().expect("embryo poisoned").company.clone();
            if snapshot.place == company.place
                && snapshot.year_filing_for < company.year_filing_for
            {
                match same_companies
                    .iter()
                    .position(|c| c.year_filing_for == snapshot.year_filing_for)
                {
                    Some(i) => same_companies[i] = snapshot,
                    None => same_companies.push(snapshot),
                }
            }
        }
        same_companies.sort_by(|a, b| b.year_filing_for.cmp(&a.year_filing_for));
    }

    if let Some(prev) = same_companies
        .iter()
        .find(|c| c.year_filing_for < company.year_filing_for)
    {
        company.website = prev.website.clone();
        company.logo = prev.logo.clone();
        company.header_img = prev.header_img.clone();
        company.num_reviews = prev.num_reviews;
        company.average_review = prev.average_review;
        company.popularity = prev.popularity;

        let num_older = same_companies
            .iter()
            .filter(|c| c.year_filing_for < company.year_filing_for)
            .count();
        company.past_averages = Some(history::fold_past_averages(
            prev.past_averages.as_ref(),
            &prev.metrics,
            num_older,
        ));
    }

    let records: Vec<HistoryRecord> = same_companies
        .iter()
        .map(|c| HistoryRecord {
            id: c.id.clone(),
            year_filing_for: c.year_filing_for,
            is_latest: Some(c.is_latest),
            metrics: c.metrics.clone(),
            past_averages: c.past_averages.clone(),
        })
        .collect();
    let (is_latest, demote_ids) =
        history::latest_and_demotions(company.year_filing_for, &records);
    company.is_latest = is_latest;
    for id in demote_ids {
        state.progress.add_total(1);
        state.company_channel.push_patch(BulkOp::Patch {
            id,
            ops: vec![PatchOp::set("isLatest", false)],
        });
    }

    company.popularity =
        aggregate::popularity(company.popularity, company.annual_average_employees);

    let naics_history = match company.industry.as_ref().and_then(|i| i.naics_code) {
        Some(code) => p.naics.lookup(code, 3).await?,
        None => Vec::new(),
    };
    let weights = p.weights.get().await?;
    let score = calc_score(&company, &weights, &naics_history, false);
    if let Some(code) = company.industry.as_ref().and_then(|i| i.naics_code) {
        let mut map = state.industry_map.lock().expect("industry map poisoned");
        if let Some(entry) = map.get_mut(&code) {
            entry.average_score =
                Some(entry.average_score.unwrap_or(0.0) + score.score as f64);
        }
    }
    company.wsi_score = Some(score);

    state
        .company_channel
        .push_upsert(serde_json::to_value(&company)?);
    Ok(())
}

async fn self_page(
    p: &ImportPipeline,
    query: &Query,
    offset: usize,
) -> Result<crate::store::Page> {
    let mut q = query.clone();
    q.offset = offset;
    p.store.locations.query_page(&q, 50).await
}

async fn stored_same_place(p: &ImportPipeline, place: &str) -> Result<Vec<Company>> {
    let query = Query::new()
        .filter(Filter::eq("place", place))
        .order_by("year_filing_for", Order::Desc)
        .limit(p.config.import.years_back);
    let values: Vec<Value> = p.store.companies.query(&query).await?;
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(Error::from))
        .collect()
}
