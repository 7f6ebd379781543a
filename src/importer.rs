use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::{
    CatalogLookup, CatalogPlace, CatalogPlaceSummary, CatalogStore, Coordinate, NewCatalogPlace,
    OwnershipStatus, PlaceFields, PlaceSource,
};
use crate::config::{AppConfig, DuplicateMergePolicy};
use crate::errors::{AppError, AppResult};
use crate::jobs::{ImportJob, ImportJobStore, ImportRequest, JobCounts, JobStatus};
use crate::matcher::{MatchDecision, MatchSettings, Matcher};
use crate::provider::{PlaceDirectory, PlaceSearch, ProviderPlace, ProviderRecord, RawPlace};
use crate::telemetry::TelemetryClient;

/// Finalized job plus the catalog records it created. In a dry run the
/// summaries describe would-be inserts and carry provisional ids.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub job: ImportJob,
    pub inserted: Vec<CatalogPlaceSummary>,
}

#[derive(Debug)]
enum Applied {
    Inserted(CatalogPlaceSummary),
    Updated,
    Unchanged,
    Skipped,
}

pub struct Importer {
    directory: Arc<dyn PlaceDirectory>,
    catalog: CatalogStore,
    jobs: ImportJobStore,
    matcher: Matcher,
    merge_policy: DuplicateMergePolicy,
    max_results_cap: usize,
    telemetry: Option<TelemetryClient>,
}

impl Importer {
    pub fn new(
        directory: Arc<dyn PlaceDirectory>,
        catalog: CatalogStore,
        jobs: ImportJobStore,
        config: &AppConfig,
    ) -> Self {
        Self {
            directory,
            catalog,
            jobs,
            matcher: Matcher::new(MatchSettings::from(config)),
            merge_policy: config.duplicate_merge_policy,
            max_results_cap: config.import_max_results_cap,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryClient) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Runs one import to a terminal job. Provider failures and cancellation
    /// finish the job as failed and keep every write already committed; only
    /// an invalid request or a job store failure is returned as `Err`.
    pub async fn run(
        &self,
        request: ImportRequest,
        cancel: Option<Arc<AtomicBool>>,
    ) -> AppResult<ImportReport> {
        request.validate()?;
        let provider = self.directory.provider_name().to_string();
        let mut staged = (request.dry_run)
            .then(|| self.catalog.max_id().map(StagedCatalog::new))
            .transpose()?;
        let job_id = self.jobs.create(&request, &provider)?;
        let query = request.search_query(self.max_results_cap);
        info!(
            job_id,
            provider = %provider,
            location = %query.location,
            radius = query.radius_meters,
            max_results = query.max_results,
            dry_run = request.dry_run,
            "import run started"
        );

        let mut counts = JobCounts::default();
        let mut inserted = Vec::new();
        let mut search = PlaceSearch::new(Arc::clone(&self.directory), query);

        let cancelled = || cancel.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst));
        // Set when the job store itself rejects a write; the run still ends
        // in a terminal status before that error is returned.
        let mut job_store_failed = false;

        let outcome: AppResult<()> = loop {
            if cancelled() {
                break Err(AppError::Cancelled);
            }
            let next = search.next().await;
            // A cancel that lands during a page fetch must not let that page in.
            if cancelled() {
                break Err(AppError::Cancelled);
            }
            let record = match next {
                None => break Ok(()),
                Some(Err(err)) => break Err(err),
                Some(Ok(record)) => record,
            };
            counts.total_found += 1;

            let applied = record.parse().and_then(|raw| match staged.as_mut() {
                Some(staged) => self.stage_record(&provider, &raw, staged),
                None => self.apply_record(&provider, &raw),
            });
            match applied {
                Ok(Applied::Inserted(summary)) => {
                    counts.new_places += 1;
                    inserted.push(summary);
                }
                Ok(Applied::Updated) => counts.updated_places += 1,
                Ok(Applied::Unchanged | Applied::Skipped) => counts.skipped_places += 1,
                Err(err) if err.is_record_level() => {
                    let message = record_error_message(&record, &err);
                    warn!(job_id, error = %message, "provider record skipped");
                    if let Err(store_err) = self.jobs.append_error(job_id, &message) {
                        job_store_failed = true;
                        break Err(store_err);
                    }
                }
                Err(err) => break Err(err),
            }
        };
        drop(search);

        let mut job_store_error = None;
        let status = match outcome {
            Ok(()) => JobStatus::Completed,
            Err(err) if job_store_failed => {
                job_store_error = Some(err);
                JobStatus::Failed
            }
            Err(err) => {
                warn!(
                    job_id,
                    error = %err,
                    retryable = err.is_retryable(),
                    "import run failed"
                );
                if let Err(store_err) = self.jobs.append_error(job_id, &err.to_string()) {
                    job_store_error = Some(store_err);
                }
                JobStatus::Failed
            }
        };
        let finalized = self.jobs.finalize(job_id, status, counts);
        if let Some(err) = job_store_error {
            error!(
                job_id,
                error = %err,
                finalized = finalized.is_ok(),
                "job store rejected a write; run aborted"
            );
            return Err(err);
        }
        finalized?;
        let job = self.jobs.get(job_id)?;
        info!(
            job_id,
            status = %job.status,
            total_found = counts.total_found,
            new_places = counts.new_places,
            updated_places = counts.updated_places,
            skipped_places = counts.skipped_places,
            errors = job.errors.len(),
            "import run finished"
        );
        if let Some(telemetry) = &self.telemetry {
            telemetry.import_finished(&job, inserted.len());
        }
        Ok(ImportReport { job, inserted })
    }

    /// Match and write for one record in a single catalog transaction, so no
    /// other writer sees a half-applied decision.
    fn apply_record(&self, provider: &str, raw: &RawPlace) -> AppResult<Applied> {
        let place = raw.normalize()?;
        let fields = place.to_fields(self.directory.as_ref());
        self.catalog.write(|writer| {
            let outcome = self.matcher.decide(provider, &place, writer)?;
            debug!(
                external_id = %place.external_id,
                decision = ?outcome.decision,
                score = ?outcome.score,
                "match decided"
            );
            match (outcome.decision, outcome.existing) {
                (MatchDecision::New, _) => {
                    let id = writer.insert(&NewCatalogPlace {
                        provider: Some(provider.to_string()),
                        external_id: Some(place.external_id.clone()),
                        fields,
                        source: PlaceSource::ProviderImport,
                    })?;
                    Ok(Applied::Inserted(writer.get(id)?.summary()))
                }
                (MatchDecision::UpdateExisting { target_id }, Some(existing)) => {
                    if existing.fields == fields {
                        return Ok(Applied::Unchanged);
                    }
                    writer.refresh(target_id, &fields)?;
                    Ok(Applied::Updated)
                }
                (MatchDecision::SkipDuplicate { existing_id }, Some(existing)) => {
                    if let Some(merged) = self.merged_fields(&existing, &fields) {
                        writer.refresh(existing_id, &merged)?;
                    }
                    Ok(Applied::Skipped)
                }
                (_, None) => Err(AppError::NotFound(format!(
                    "match target for {}",
                    place.external_id
                ))),
            }
        })
    }

    /// Same decisions as [`Importer::apply_record`] against the catalog plus
    /// this run's would-be inserts; nothing is written.
    fn stage_record(
        &self,
        provider: &str,
        raw: &RawPlace,
        staged: &mut StagedCatalog,
    ) -> AppResult<Applied> {
        let place = raw.normalize()?;
        let fields = place.to_fields(self.directory.as_ref());
        let outcome = self.matcher.decide(
            provider,
            &place,
            &StagedLookup {
                catalog: &self.catalog,
                staged: &*staged,
            },
        )?;
        Ok(match (outcome.decision, outcome.existing) {
            (MatchDecision::New, _) => {
                Applied::Inserted(staged.stage(provider, &place, fields).summary())
            }
            (MatchDecision::UpdateExisting { .. }, Some(existing)) if existing.fields == fields => {
                Applied::Unchanged
            }
            (MatchDecision::UpdateExisting { .. }, _) => Applied::Updated,
            (MatchDecision::SkipDuplicate { .. }, _) => Applied::Skipped,
        })
    }

    fn merged_fields(&self, existing: &CatalogPlace, incoming: &PlaceFields) -> Option<PlaceFields> {
        match self.merge_policy {
            DuplicateMergePolicy::Ignore => None,
            DuplicateMergePolicy::FillMissing => {
                let mut merged = existing.fields.clone();
                merged.fill_missing_from(incoming).then_some(merged)
            }
        }
    }
}

fn record_error_message(record: &ProviderRecord, err: &AppError) -> String {
    match err {
        AppError::MalformedRecord {
            external_id,
            reason,
        } => format!("{external_id}: {reason}"),
        AppError::DuplicateExternalId { external_id, .. } => {
            format!("{external_id}: external id already present in catalog")
        }
        other => format!("{}: {other}", record.external_id().unwrap_or("<missing>")),
    }
}

/// Would-be inserts of a dry run, numbered after the catalog's current ids.
struct StagedCatalog {
    next_id: i64,
    places: Vec<CatalogPlace>,
}

impl StagedCatalog {
    fn new(max_id: i64) -> Self {
        Self {
            next_id: max_id + 1,
            places: Vec::new(),
        }
    }

    fn stage(&mut self, provider: &str, place: &ProviderPlace, fields: PlaceFields) -> &CatalogPlace {
        let now = Utc::now();
        let staged = CatalogPlace {
            id: self.next_id,
            provider: Some(provider.to_string()),
            external_id: Some(place.external_id.clone()),
            fields,
            source: PlaceSource::ProviderImport,
            imported_at: now,
            updated_at: now,
            status: OwnershipStatus::Imported,
            claim: None,
            verification: None,
            version: 0,
        };
        self.next_id += 1;
        self.places.push(staged);
        &self.places[self.places.len() - 1]
    }
}

struct StagedLookup<'a> {
    catalog: &'a CatalogStore,
    staged: &'a StagedCatalog,
}

impl CatalogLookup for StagedLookup<'_> {
    fn find_by_external_id(
        &self,
        provider: &str,
        external_id: &str,
    ) -> AppResult<Option<CatalogPlace>> {
        if let Some(found) = self.catalog.find_by_external_id(provider, external_id)? {
            return Ok(Some(found));
        }
        Ok(self
            .staged
            .places
            .iter()
            .find(|p| {
                p.provider.as_deref() == Some(provider)
                    && p.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    fn find_near(&self, center: Coordinate, radius_meters: f64) -> AppResult<Vec<CatalogPlace>> {
        let mut near = self.catalog.find_near(center, radius_meters)?;
        near.extend(
            self.staged
                .places
                .iter()
                .filter(|p| p.fields.coordinate.distance_meters(&center) <= radius_meters)
                .cloned(),
        );
        Ok(near)
    }
}
