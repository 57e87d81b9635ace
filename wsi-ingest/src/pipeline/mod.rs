//! The import pipeline: rows in, scored documents out.
//!
//! An import runs in two phases. The location phase parses rows with a
//! worker pool, resolves identities, and streams Location upserts and
//! history patches to an uploader. The company phase then aggregates
//! each discovered company from its stored child locations, folds in
//! prior-year history, scores it, and uploads the results, followed by
//! industry averages and any accumulated error records. The caller gets
//! a nonce immediately and polls progress while all of this continues
//! in the background.

mod company_phase;
mod location_phase;
mod uploads;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

use wsi_common::config::TomlConfig;
use wsi_common::models::{CsvSheet, ErrorRecord, IndustryInfo, RawRecord};
use wsi_common::{Error, JaroWinkler, Result};

use crate::fieldmap::FieldMap;
use crate::naics::NaicsCatalog;
use crate::progress::{ImportProgress, JobRegistry, ProgressHandle};
use crate::resolver::{CompanyDirectory, EntityResolver};
use crate::revalidate::Revalidator;
use crate::scheduler::{run_claimed, BatchTuner, UploadChannel, Uploader};
use crate::store::Store;
use crate::weights::WeightsCache;

/// Caller-selected behavior for one import run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub filename: Option<String>,
    /// Parse rows and rebuild companies without re-uploading locations.
    pub skip_locations: bool,
    /// Trust the `place` column in the input instead of re-resolving.
    pub preserve_place_name: bool,
    /// Also weigh other input rows when deciding the latest flag. Slow
    /// on large sheets; used when re-importing merged records.
    pub check_input_for_latest: bool,
}

/// Everything one import run's tasks share.
pub(crate) struct ProcessingState {
    pub ops: RunOptions,
    pub maps: FieldMap,
    pub rows: Vec<RawRecord>,
    pub years_represented: Mutex<Vec<i32>>,
    pub directory: CompanyDirectory,
    pub loc_channel: Arc<UploadChannel>,
    pub company_channel: Arc<UploadChannel>,
    pub industry_map: Mutex<HashMap<u32, IndustryInfo>>,
    pub errors: Arc<Mutex<Vec<ErrorRecord>>>,
    pub progress: Arc<ProgressHandle>,
}

impl ProcessingState {
    pub fn note_year(&self, year: i32) {
        let mut years = self.years_represented.lock().expect("years poisoned");
        if !years.contains(&year) {
            years.push(year);
        }
    }

    pub fn multiple_years(&self) -> bool {
        self.years_represented.lock().expect("years poisoned").len() > 1
    }
}

pub struct ImportPipeline {
    pub(crate) store: Store,
    pub(crate) registry: JobRegistry,
    pub(crate) weights: Arc<WeightsCache>,
    pub(crate) naics: Arc<NaicsCatalog>,
    pub(crate) resolver: EntityResolver,
    pub(crate) revalidator: Arc<dyn Revalidator>,
    pub(crate) config: TomlConfig,
}

impl ImportPipeline {
    pub fn new(
        store: Store,
        revalidator: Arc<dyn Revalidator>,
        config: TomlConfig,
    ) -> Arc<Self> {
        let registry = JobRegistry::new(Duration::from_secs(config.import.progress_gc_secs));
        let weights = Arc::new(WeightsCache::new(
            Arc::clone(&store.statics),
            Duration::from_secs(config.import.weights_ttl_secs),
        ));
        let naics = Arc::new(NaicsCatalog::new(
            Arc::clone(&store.statics),
            config.import.years_back,
        ));
        let resolver = EntityResolver {
            locations: Arc::clone(&store.locations),
            companies: Arc::clone(&store.companies),
            similarity: Arc::new(JaroWinkler),
            company_threshold: config.matching.company_similarity_threshold,
            years_back: config.import.years_back,
        };
        Arc::new(ImportPipeline {
            store,
            registry,
            weights,
            naics,
            resolver,
            revalidator,
            config,
        })
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub(crate) fn tuner(&self) -> Arc<BatchTuner> {
        Arc::new(BatchTuner::new(
            self.config.import.batch_save_start,
            self.config.import.batch_save_min,
            self.config.import.batch_save_max,
        ))
    }

    pub(crate) fn idle(&self) -> Duration {
        Duration::from_millis(self.config.import.uploader_idle_ms)
    }

    /// Validate the sheet, kick off the background run, and return the
    /// initial progress snapshot for polling.
    pub async fn begin_import(
        self: &Arc<Self>,
        sheet: CsvSheet,
        ops: RunOptions,
    ) -> Result<ImportProgress> {
        if sheet.rows.is_empty() {
            return Err(Error::InvalidInput("no rows in csv worksheet".into()));
        }

        let mut maps = FieldMap::generate(
            &sheet,
            self.resolver.similarity.as_ref(),
            self.config.matching.column_similarity_threshold,
        )?;
        let mut rows = sheet.rows;
        normalize_company_names(&mut maps, &mut rows);
        sort_by_company_name(&maps, &mut rows);

        let progress = ProgressHandle::new(
            ops.filename.clone().unwrap_or_default(),
            "Initializing",
        );
        progress.add_total(rows.len());
        if rows.len() < self.config.import.revalidate_row_cap {
            collect_revalidate_urls(&progress, self.revalidator.as_ref(), &maps, &rows);
        }
        self.registry.insert(Arc::clone(&progress));

        let state = Arc::new(ProcessingState {
            ops,
            maps,
            rows,
            years_represented: Mutex::new(Vec::new()),
            directory: CompanyDirectory::new(),
            loc_channel: Arc::new(UploadChannel::new()),
            company_channel: Arc::new(UploadChannel::new()),
            industry_map: Mutex::new(HashMap::new()),
            errors: Arc::new(Mutex::new(Vec::new())),
            progress: Arc::clone(&progress),
        });

        let pipeline = Arc::clone(self);
        let snapshot = progress.snapshot();
        tokio::spawn(async move {
            pipeline.run(state).await;
        });
        Ok(snapshot)
    }

    async fn run(self: Arc<Self>, state: Arc<ProcessingState>) {
        let nonce = state.progress.nonce().to_owned();
        info!(
            nonce = %nonce,
            rows = state.rows.len(),
            skip_locations = state.ops.skip_locations,
            "import started"
        );

        if let Err(e) = self.run_phases(&state).await {
            error!(nonce = %nonce, error = %e, "import failed");
            state.progress.set_task("Failed");
        } else {
            info!(
                nonce = %nonce,
                companies = state.directory.len(),
                "import finished"
            );
            state.progress.set_task("Done!");
        }
        self.registry.finish(&nonce);
    }

    async fn run_phases(&self, state: &Arc<ProcessingState>) -> Result<()> {
        state.progress.set_task("Processing locations");
        let total_rows = state.rows.len();
        let workers = self.config.import.max_concurrent_rows;

        let parse = run_claimed(workers, total_rows, |idx| async move {
            location_phase::process_location(self, state, idx).await;
        });
        if state.ops.skip_locations {
            parse.await;
        } else {
            let uploader = Uploader {
                col: Arc::clone(&self.store.locations),
                channel: Arc::clone(&state.loc_channel),
                tuner: self.tuner(),
                progress: Arc::clone(&state.progress),
                errors: Arc::clone(&state.errors),
                upsert_task: wsi_common::models::ErrorTask::UploadLocation,
                patch_task: wsi_common::models::ErrorTask::PatchLocation,
                idle: self.idle(),
                label: "locations",
            };
            let (_, upload) = tokio::join!(parse, uploader.run(total_rows));
            upload?;
        }

        state.progress.set_task("Processing companies");
        let total_companies = state.directory.len();
        let parse = run_claimed(workers, total_companies, |idx| async move {
            company_phase::process_company(self, state, idx).await;
        });
        let uploader = Uploader {
            col: Arc::clone(&self.store.companies),
            channel: Arc::clone(&state.company_channel),
            tuner: self.tuner(),
            progress: Arc::clone(&state.progress),
            errors: Arc::clone(&state.errors),
            upsert_task: wsi_common::models::ErrorTask::UploadCompany,
            patch_task: wsi_common::models::ErrorTask::PatchCompany,
            idle: self.idle(),
            label: "companies",
        };
        let (_, upload) = tokio::join!(parse, uploader.run(total_companies));
        upload?;

        uploads::upload_industries(self, state).await?;
        uploads::upload_errors(self, state).await?;
        Ok(())
    }
}

/// Backfill missing or non-alphabetic company names from the
/// establishment name, and trim everything.
fn normalize_company_names(maps: &mut FieldMap, rows: &mut [RawRecord]) {
    let name_header = maps
        .main
        .entry("company_name")
        .or_insert_with(|| "company_name".to_owned())
        .clone();
    let est_header = maps.main.get("establishment_name").cloned();
    for row in rows.iter_mut() {
        let current = row.get(&name_header).cloned().unwrap_or_default();
        let has_alpha = current.chars().any(|c| c.is_ascii_alphabetic());
        let name = if !has_alpha {
            est_header
                .as_ref()
                .and_then(|h| row.get(h))
                .cloned()
                .unwrap_or(current)
        } else {
            current
        };
        row.insert(name_header.clone(), name.trim().to_owned());
    }
}

/// Group rows by company so one worker tends to see one employer.
fn sort_by_company_name(maps: &FieldMap, rows: &mut [RawRecord]) {
    if let Some(header) = maps.main.get("company_name") {
        rows.sort_by(|a, b| {
            a.get(header)
                .map(String::as_str)
                .unwrap_or_default()
                .cmp(b.get(header).map(String::as_str).unwrap_or_default())
        });
    }
}

fn collect_revalidate_urls(
    progress: &ProgressHandle,
    revalidator: &dyn Revalidator,
    maps: &FieldMap,
    rows: &[RawRecord],
) {
    for row in rows {
        if let Some(place) = row.get("place") {
            if !place.is_empty() {
                progress.push_revalidate_url(revalidator.company_page(place));
            }
        }
        if let Some(est_id) = maps.archive_str(row, "establishment_id") {
            progress.push_revalidate_url(revalidator.location_page(&est_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn establishment_name_backfills_missing_company() {
        let mut maps = FieldMap::default();
        maps.main
            .insert("company_name", "Company Name".to_owned());
        maps.main
            .insert("establishment_name", "Establishment".to_owned());
        let mut rows = vec![
            row(&[("Establishment", "Acme Plant 3")]),
            row(&[("Company Name", "  Bravo Inc "), ("Establishment", "Bravo Yard")]),
            row(&[("Company Name", "123"), ("Establishment", "Charlie Mill")]),
        ];
        normalize_company_names(&mut maps, &mut rows);
        assert_eq!(rows[0].get("Company Name").unwrap(), "Acme Plant 3");
        assert_eq!(rows[1].get("Company Name").unwrap(), "Bravo Inc");
        // A purely numeric name is treated as missing.
        assert_eq!(rows[2].get("Company Name").unwrap(), "Charlie Mill");
    }

    #[test]
    fn rows_sort_by_mapped_company_name() {
        let mut maps = FieldMap::default();
        maps.main.insert("company_name", "name".to_owned());
        let mut rows = vec![
            row(&[("name", "zulu")]),
            row(&[("name", "alpha")]),
            row(&[("name", "mike")]),
        ];
        sort_by_company_name(&maps, &mut rows);
        let names: Vec<&str> = rows.iter().map(|r| r.get("name").unwrap().as_str()).collect();
        assert_eq!(names, vec!["alpha", "mike", "zulu"]);
    }
}
