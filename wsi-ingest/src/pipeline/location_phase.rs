//! Row parsing and location resolution.

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use wsi_common::metrics::{avg_work_week, recalc_derived, total_incidents};
use wsi_common::models::{
    Archive, ErrorRecord, ErrorTask, Industry, IndustryInfo, Location, Metric,
};
use wsi_common::text::{char_count, tokenize_location, tokenize_string};
use wsi_common::Result;

use crate::history;
use crate::store::{BulkOp, PatchOp};

use super::{ImportPipeline, ProcessingState};

/// Parse one row into a Location, resolve its identities, and queue it
/// for upload. A failure anywhere records which field was being handled.
pub(super) async fn process_location(p: &ImportPipeline, state: &ProcessingState, idx: usize) {
    let mut col = "";
    if let Err(e) = build_location(p, state, idx, &mut col).await {
        debug!(row = idx, col, error = %e, "row failed to parse");
        state.loc_channel.record_error();
        state.progress.add_both(1);
        state.errors.lock().expect("error list poisoned").push(ErrorRecord {
            id: Uuid::new_v4().to_string(),
            task: ErrorTask::ParseLocation,
            col: Some(col.to_owned()),
            msg: e.to_string(),
            data: serde_json::to_value(&state.rows[idx]).ok(),
            filename: state.progress.filename().to_owned(),
            nonce: state.progress.nonce().to_owned(),
            created: Utc::now(),
        });
    }
}

async fn build_location(
    p: &ImportPipeline,
    state: &ProcessingState,
    idx: usize,
    col: &mut &'static str,
) -> Result<()> {
    let row = &state.rows[idx];
    let maps = &state.maps;
    let mut loc = Location::new();

    *col = "naics_code";
    let mut industry = Industry {
        naics_code: maps.industry_num(row, "naics_code").map(|n| n as u32),
        caption: maps.industry_str(row, "industry_description"),
    };
    if let (Some(code), None) = (industry.naics_code, &industry.caption) {
        industry.caption = p.naics.caption(code).await?;
    }
    if industry.naics_code.is_some() || industry.caption.is_some() {
        loc.industry = Some(industry.clone());
    }

    *col = "ein";
    loc.ein = maps.main_str(row, "ein");
    *col = "year_filing_for";
    if let Some(year) = maps.main_num(row, "year_filing_for") {
        loc.year_filing_for = year as i32;
    }
    state.note_year(loc.year_filing_for);

    *col = "establishment_name";
    loc.establishment_name = maps.main_str(row, "establishment_name");
    *col = "company_name";
    loc.company_name = maps.main_str(row, "company_name").unwrap_or_default();
    *col = "street_address";
    loc.street_address = maps.main_str(row, "street_address");
    *col = "city";
    loc.city = maps.main_str(row, "city");
    *col = "state";
    loc.state = maps.main_str(row, "state");
    *col = "zip_code";
    // Nine-digit zips keep only their first five digits.
    loc.zip_code = maps
        .main_num(row, "zip_code")
        .map(|z| format!("{}", z as u64))
        .map(|z| z[..z.len().min(5)].parse().unwrap_or(0))
        .filter(|z| *z > 0);

    *col = "annual_average_employees";
    loc.annual_average_employees = maps.main_num(row, "annual_average_employees").unwrap_or(0.0);
    *col = "total_hours_worked";
    loc.total_hours_worked = maps.main_num(row, "total_hours_worked").unwrap_or(0.0);
    loc.avg_work_week = avg_work_week(loc.total_hours_worked, loc.annual_average_employees);

    for m in Metric::ALL {
        *col = m.name();
        let value = maps.main_num(row, m.name()).unwrap_or(0.0);
        loc.metrics.set(m, value);
    }
    *col = "total_incidents";
    loc.metrics.total_incidents = total_incidents(&loc.metrics);
    recalc_derived(&mut loc.metrics, loc.total_hours_worked);

    *col = "archive";
    let mut archive = Archive {
        id: maps.archive_num(row, "id").map(|n| format!("{}", n as i64)),
        no_injuries_illnesses: maps.archive_num(row, "no_injuries_illnesses"),
        total_other_cases: maps.archive_num(row, "total_other_cases"),
        // Some files append .00, so parse as a number first.
        establishment_id: maps
            .archive_num(row, "establishment_id")
            .map(|n| format!("{}", n as i64)),
        establishment_type: maps.archive_num(row, "establishment_type").map(|n| n as u32),
        size: maps.archive_num(row, "size").map(|n| n as u32),
        created_timestamp: maps.archive_str(row, "created_timestamp"),
        change_reason: maps.archive_str(row, "change_reason"),
        ..Archive::default()
    };
    // Unexpected columns ride along rather than being dropped.
    for key in &maps.unused_fields {
        if let Some(value) = row.get(key) {
            if !value.trim().is_empty() {
                archive.extra.insert(key.clone(), value.trim().to_owned());
            }
        }
    }
    if !archive.is_empty() {
        loc.archive = Some(archive);
    }

    *col = "locationId";
    loc.location_id = p.resolver.resolve_location_id(&loc).await?;

    let same_locations = p.resolver.location_history(&loc.location_id).await?;
    let records: Vec<history::HistoryRecord> =
        same_locations.iter().map(|s| s.record.clone()).collect();

    *col = "past_averages";
    let outcome = history::evaluate(loc.year_filing_for, &records);
    loc.past_averages = outcome.past_averages;

    *col = "isLatest";
    loc.is_latest = outcome.is_latest;
    if !state.ops.skip_locations {
        for id in outcome.demote_ids {
            state.progress.add_total(1);
            state.loc_channel.push_patch(BulkOp::Patch {
                id,
                ops: vec![PatchOp::set("isLatest", false)],
            });
        }
    }
    if state.ops.check_input_for_latest {
        let input_years: Vec<i32> = state
            .rows
            .iter()
            .filter(|r| {
                maps.archive_num(r, "establishment_id")
                    .map(|n| format!("{}", n as i64))
                    .as_deref()
                    == Some(loc.location_id.as_str())
            })
            .filter_map(|r| maps.main_num(r, "year_filing_for"))
            .map(|y| y as i32)
            .collect();
        if history::input_claims_later_year(loc.year_filing_for, &input_years) {
            loc.is_latest = false;
        }
    }

    *col = "parent";
    resolve_parent(p, state, &mut loc, row, &same_locations).await?;

    if let Some(code) = industry.naics_code {
        tally_industry(state, code, &industry, &loc);
    }

    loc.id = Location::doc_id(&loc.location_id, loc.year_filing_for);
    *col = "tokenized";
    loc.tokenized = tokenize_location(&loc);
    loc.tokenized_company_name = tokenize_string(&loc.company_name);
    let char_source = match &loc.establishment_name {
        Some(est) => format!("{} {}", loc.company_name, est),
        None => loc.company_name.clone(),
    };
    loc.char_count = char_count(&char_source);

    if state.ops.skip_locations {
        state.progress.add_completed(1);
    } else {
        state.loc_channel.push_upsert(serde_json::to_value(&loc)?);
    }
    Ok(())
}

/// Attach the row to its company embryo, creating one if no worker got
/// there first. Every lookup is repeated after each await: another row
/// for the same employer may have raced ahead.
async fn resolve_parent(
    p: &ImportPipeline,
    state: &ProcessingState,
    loc: &mut Location,
    row: &wsi_common::models::RawRecord,
    same_locations: &[crate::resolver::SameLocation],
) -> Result<()> {
    let name_key = crate::resolver::CompanyDirectory::name_key(&loc.company_name, loc.year_filing_for);
    let ein_key =
        crate::resolver::CompanyDirectory::ein_key(loc.ein.as_deref(), loc.year_filing_for);

    let embryo = match state.directory.lookup(ein_key.as_deref(), &name_key) {
        Some(embryo) => embryo,
        None => {
            let mut place = if state.ops.preserve_place_name {
                row.get("place").cloned().unwrap_or_default()
            } else if let Some(same) = same_locations.first() {
                same.place.clone()
            } else {
                p.resolver
                    .find_existing_place(loc)
                    .await?
                    .unwrap_or_default()
            };

            // Re-check before minting a slug; the query above awaited.
            match state.directory.lookup(ein_key.as_deref(), &name_key) {
                Some(embryo) => embryo,
                None => {
                    if place.is_empty() {
                        place = p
                            .resolver
                            .unique_slug(&loc.company_name, &state.directory)
                            .await?;
                    }
                    let (embryo, created) = state.directory.get_or_create(
                        ein_key.as_deref(),
                        &name_key,
                        &place,
                        &loc.company_name.to_lowercase(),
                        loc.year_filing_for,
                    );
                    if created {
                        state.progress.add_total(1);
                    }
                    embryo
                }
            }
        }
    };

    let (parent_id, place) = {
        let embryo = embryo.lock().expect("embryo poisoned");
        (embryo.company.id.clone(), embryo.company.place.clone())
    };
    loc.parent = parent_id;
    loc.place = place;
    Ok(())
}

fn tally_industry(state: &ProcessingState, code: u32, industry: &Industry, loc: &Location) {
    let mut map = state.industry_map.lock().expect("industry map poisoned");
    let entry = map.entry(code).or_insert_with(|| {
        state.progress.add_total(1);
        IndustryInfo::new(code, loc.year_filing_for)
    });
    entry.num_locations += 1;
    if let Some(caption) = &industry.caption {
        if !entry.captions.contains(caption) {
            entry.captions.push(caption.clone());
        }
    }
    entry.averages.add_all(&loc.metrics);
}
