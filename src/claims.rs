use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{
    CatalogPlace, CatalogStore, ClaimDetails, ClaimEvent, OwnershipStatus, StatusWrite,
    VerificationDetails,
};
use crate::errors::{AppError, AppResult};
use crate::telemetry::TelemetryClient;

const MAX_SWAP_ATTEMPTS: usize = 8;
const DEFAULT_REVIEWER: &str = "operator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Verified,
    Rejected,
}

impl Decision {
    pub fn status(&self) -> OwnershipStatus {
        match self {
            Decision::Verified => OwnershipStatus::Verified,
            Decision::Rejected => OwnershipStatus::Rejected,
        }
    }
}

/// One requested edge of the ownership lifecycle.
#[derive(Debug, Clone, Copy)]
pub enum Transition {
    Submit,
    BeginVerification,
    Decide(Decision),
}

impl Transition {
    fn action(&self) -> &'static str {
        match self {
            Transition::Submit => "submit a claim",
            Transition::BeginVerification => "begin verification",
            Transition::Decide(Decision::Verified) => "verify",
            Transition::Decide(Decision::Rejected) => "reject",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Advance(OwnershipStatus),
    /// Already where the transition leads; nothing to write.
    Unchanged,
}

/// The only place legal ownership edges are defined.
pub fn next_status(
    place_id: i64,
    current: OwnershipStatus,
    transition: Transition,
) -> AppResult<Step> {
    use OwnershipStatus::*;

    match (transition, current) {
        (Transition::Submit, Imported | Rejected) => Ok(Step::Advance(Claimed)),
        (Transition::Submit, Claimed | PendingVerification | Verified) => {
            Err(AppError::AlreadyClaimed {
                place_id,
                status: current.to_string(),
            })
        }
        (Transition::BeginVerification, Claimed) => Ok(Step::Advance(PendingVerification)),
        (Transition::BeginVerification, PendingVerification) => Ok(Step::Unchanged),
        (Transition::Decide(decision), Claimed | PendingVerification) => {
            Ok(Step::Advance(decision.status()))
        }
        (transition, _) => Err(AppError::InvalidState {
            place_id,
            status: current.to_string(),
            action: transition.action(),
        }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub place_id: i64,
    pub contact_email: String,
    pub contact_phone: String,
    pub justification: String,
}

impl ClaimRequest {
    fn validate(&self) -> AppResult<()> {
        let email = self.contact_email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
            _ => {
                return Err(AppError::Validation(format!(
                    "invalid contact email: {email}"
                )))
            }
        }
        if self.contact_phone.trim().is_empty() {
            return Err(AppError::Validation("contact phone is required".into()));
        }
        if self.justification.trim().is_empty() {
            return Err(AppError::Validation("justification is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub place_id: i64,
    pub operator_id: String,
    pub outcome: Decision,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Clone)]
pub struct ClaimService {
    catalog: CatalogStore,
    telemetry: Option<TelemetryClient>,
}

impl ClaimService {
    pub fn new(catalog: CatalogStore, telemetry: Option<TelemetryClient>) -> Self {
        Self { catalog, telemetry }
    }

    pub fn submit_claim(&self, request: &ClaimRequest) -> AppResult<CatalogPlace> {
        request.validate()?;
        let details = ClaimDetails {
            contact_email: request.contact_email.trim().to_string(),
            contact_phone: request.contact_phone.trim().to_string(),
            justification: request.justification.trim().to_string(),
            claimed_at: Utc::now(),
        };
        self.transition(
            request.place_id,
            Transition::Submit,
            StatusWrite::Claim(&details),
            &details.contact_email,
        )
    }

    pub fn begin_verification(
        &self,
        place_id: i64,
        operator_id: Option<&str>,
    ) -> AppResult<CatalogPlace> {
        let actor = operator_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_REVIEWER);
        self.transition(
            place_id,
            Transition::BeginVerification,
            StatusWrite::StatusOnly,
            actor,
        )
    }

    pub fn decide(&self, request: &DecisionRequest) -> AppResult<CatalogPlace> {
        let operator_id = request.operator_id.trim();
        if operator_id.is_empty() {
            return Err(AppError::Validation("operator id is required".into()));
        }
        let details = VerificationDetails {
            operator_id: operator_id.to_string(),
            notes: request
                .notes
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            decided_at: Utc::now(),
        };
        self.transition(
            request.place_id,
            Transition::Decide(request.outcome),
            StatusWrite::Decision(&details),
            operator_id,
        )
    }

    pub fn history(&self, place_id: i64) -> AppResult<Vec<ClaimEvent>> {
        self.catalog.get(place_id)?;
        self.catalog.claim_history(place_id)
    }

    /// Read, validate, then swap on (status, version). A lost race re-reads
    /// and re-validates, so the loser sees the winner's state.
    fn transition(
        &self,
        place_id: i64,
        transition: Transition,
        write: StatusWrite<'_>,
        actor: &str,
    ) -> AppResult<CatalogPlace> {
        for attempt in 0..MAX_SWAP_ATTEMPTS {
            let place = self.catalog.get(place_id)?;
            let next = match next_status(place_id, place.status, transition)? {
                Step::Unchanged => return Ok(place),
                Step::Advance(next) => next,
            };

            let swapped = self.catalog.compare_and_swap_status(
                place_id,
                place.status,
                place.version,
                next,
                write,
                actor,
            )?;
            if swapped {
                info!(
                    place_id,
                    from = %place.status,
                    to = %next,
                    actor,
                    "ownership transition applied"
                );
                if let Some(telemetry) = &self.telemetry {
                    telemetry.claim_transition(place_id, place.status, next, actor);
                }
                return self.catalog.get(place_id);
            }
            debug!(place_id, attempt, "ownership swap lost a race; retrying");
        }
        Err(AppError::ConcurrentModification(place_id))
    }
}
