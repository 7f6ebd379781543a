use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogPlace, ClaimEvent, Coordinate, PlaceFields};
use crate::claims::{ClaimRequest, DecisionRequest};
use crate::errors::AppResult;
use crate::importer::ImportReport;
use crate::jobs::{ImportJob, ImportRequest};
use crate::{AppState, EngineHealth};

const DEFAULT_JOB_PAGE: usize = 20;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualPlaceRequest {
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl ManualPlaceRequest {
    fn into_fields(self) -> AppResult<PlaceFields> {
        Ok(PlaceFields {
            name: self.name.trim().to_string(),
            formatted_address: self
                .formatted_address
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            coordinate: Coordinate::new(self.lat, self.lng)?,
            categories: self
                .categories
                .iter()
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty())
                .collect::<BTreeSet<_>>(),
            rating: None,
            rating_count: 0,
            price_level: None,
            operational_status: None,
            photo_urls: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub place_id: i64,
    #[serde(default)]
    pub operator_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceDetail {
    pub place: CatalogPlace,
    pub history: Vec<ClaimEvent>,
}

pub async fn run_import(
    state: &AppState,
    request: ImportRequest,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<ImportReport, String> {
    let importer = state.importer().map_err(|err| err.to_string())?;
    importer
        .run(request, cancel)
        .await
        .map_err(|err| err.to_string())
}

pub fn add_place(state: &AppState, request: ManualPlaceRequest) -> Result<CatalogPlace, String> {
    request
        .into_fields()
        .and_then(|fields| state.catalog().create_manual(fields))
        .map_err(|err| err.to_string())
}

pub fn submit_claim(state: &AppState, request: ClaimRequest) -> Result<CatalogPlace, String> {
    state
        .claims()
        .submit_claim(&request)
        .map_err(|err| err.to_string())
}

pub fn begin_verification(
    state: &AppState,
    request: ReviewRequest,
) -> Result<CatalogPlace, String> {
    state
        .claims()
        .begin_verification(request.place_id, request.operator_id.as_deref())
        .map_err(|err| err.to_string())
}

pub fn decide_claim(state: &AppState, request: DecisionRequest) -> Result<CatalogPlace, String> {
    state
        .claims()
        .decide(&request)
        .map_err(|err| err.to_string())
}

pub fn import_job(state: &AppState, job_id: i64) -> Result<ImportJob, String> {
    state.jobs().get(job_id).map_err(|err| err.to_string())
}

pub fn recent_jobs(state: &AppState, limit: Option<usize>) -> Result<Vec<ImportJob>, String> {
    state
        .jobs()
        .list_recent(limit.unwrap_or(DEFAULT_JOB_PAGE))
        .map_err(|err| err.to_string())
}

pub fn place_detail(state: &AppState, place_id: i64) -> Result<PlaceDetail, String> {
    let load = || -> AppResult<PlaceDetail> {
        Ok(PlaceDetail {
            place: state.catalog().get(place_id)?,
            history: state.catalog().claim_history(place_id)?,
        })
    };
    load().map_err(|err| err.to_string())
}

pub fn claim_history(state: &AppState, place_id: i64) -> Result<Vec<ClaimEvent>, String> {
    state
        .claims()
        .history(place_id)
        .map_err(|err| err.to_string())
}

pub fn engine_health(state: &AppState) -> Result<EngineHealth, String> {
    state.health().map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::OwnershipStatus;
    use crate::claims::Decision;
    use crate::config::AppConfig;
    use tempfile::tempdir;

    #[test]
    fn manual_place_then_claim_round_trip() {
        let dir = tempdir().unwrap();
        let state = AppState::initialize(dir.path(), AppConfig::default()).unwrap();
        let request: ManualPlaceRequest = serde_json::from_str(
            r#"{"name":" Maquis Tantie ","lat":5.35,"lng":-4.02,"categories":["Restaurant",""]}"#,
        )
        .unwrap();
        let place = add_place(&state, request).unwrap();
        assert_eq!(place.fields.name, "Maquis Tantie");
        assert_eq!(place.external_id, None);
        assert!(place.fields.categories.contains("restaurant"));

        submit_claim(
            &state,
            ClaimRequest {
                place_id: place.id,
                contact_email: "tantie@maquis.ci".into(),
                contact_phone: "0700000000".into(),
                justification: "family business".into(),
            },
        )
        .unwrap();
        begin_verification(
            &state,
            ReviewRequest {
                place_id: place.id,
                operator_id: None,
            },
        )
        .unwrap();
        let decided = decide_claim(
            &state,
            DecisionRequest {
                place_id: place.id,
                operator_id: "op-7".into(),
                outcome: Decision::Rejected,
                notes: None,
            },
        )
        .unwrap();
        assert_eq!(decided.status, OwnershipStatus::Rejected);

        let detail = place_detail(&state, place.id).unwrap();
        assert_eq!(detail.history.len(), 3);
        assert_eq!(claim_history(&state, place.id).unwrap().len(), 3);
    }

    #[test]
    fn surfaces_errors_as_messages() {
        let dir = tempdir().unwrap();
        let state = AppState::initialize(dir.path(), AppConfig::default()).unwrap();
        let err = add_place(
            &state,
            ManualPlaceRequest {
                name: "Bar".into(),
                lat: 123.0,
                lng: 0.0,
                formatted_address: None,
                categories: Vec::new(),
            },
        )
        .unwrap_err();
        assert!(err.contains("coordinate out of range"), "{err}");
        assert!(import_job(&state, 42).unwrap_err().contains("not found"));
        assert!(recent_jobs(&state, None).unwrap().is_empty());
    }
}
