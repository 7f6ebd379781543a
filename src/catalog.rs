use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::ffi::ErrorCode;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::{AppError, AppResult};

const EARTH_RADIUS_METERS: f64 = 6_371_008.8;
const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

const PLACE_COLUMNS: &str = "id, provider, external_id, name, formatted_address, lat, lng,
    categories, rating, rating_count, price_level, operational_status, photo_urls, source,
    imported_at, updated_at, ownership_status, claim_email, claim_phone, claim_justification,
    claimed_at, verified_by, decision_notes, decided_at, version";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> AppResult<Self> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(AppError::Validation("coordinate must be finite".into()));
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(AppError::Validation(format!(
                "coordinate out of range: {lat},{lng}"
            )));
        }
        Ok(Self { lat, lng })
    }

    /// Great-circle distance (haversine).
    pub fn distance_meters(&self, other: &Coordinate) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let d_lat = lat2 - lat1;
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().asin()
    }

    fn bounding_deltas(&self, radius_meters: f64) -> (f64, f64) {
        let lat_delta = radius_meters / METERS_PER_DEGREE_LAT;
        let cos_lat = self.lat.to_radians().cos().abs().max(0.01);
        let lng_delta = radius_meters / (METERS_PER_DEGREE_LAT * cos_lat);
        (lat_delta, lng_delta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipStatus {
    Imported,
    Claimed,
    PendingVerification,
    Verified,
    Rejected,
}

impl OwnershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnershipStatus::Imported => "imported",
            OwnershipStatus::Claimed => "claimed",
            OwnershipStatus::PendingVerification => "pending_verification",
            OwnershipStatus::Verified => "verified",
            OwnershipStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "imported" => Some(OwnershipStatus::Imported),
            "claimed" => Some(OwnershipStatus::Claimed),
            "pending_verification" => Some(OwnershipStatus::PendingVerification),
            "verified" => Some(OwnershipStatus::Verified),
            "rejected" => Some(OwnershipStatus::Rejected),
            _ => None,
        }
    }

    pub fn has_claim(&self) -> bool {
        !matches!(self, OwnershipStatus::Imported)
    }
}

impl fmt::Display for OwnershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for OwnershipStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OwnershipStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        OwnershipStatus::parse(text).ok_or_else(|| {
            FromSqlError::Other(Box::new(AppError::Config(format!(
                "unknown ownership status: {text}"
            ))))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceSource {
    ProviderImport,
    Manual,
}

impl PlaceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceSource::ProviderImport => "provider_import",
            PlaceSource::Manual => "manual",
        }
    }
}

impl ToSql for PlaceSource {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PlaceSource {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "provider_import" => Ok(PlaceSource::ProviderImport),
            "manual" => Ok(PlaceSource::Manual),
            other => Err(FromSqlError::Other(Box::new(AppError::Config(format!(
                "unknown place source: {other}"
            ))))),
        }
    }
}

/// Descriptive attributes refreshed by re-imports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceFields {
    pub name: String,
    pub formatted_address: Option<String>,
    pub coordinate: Coordinate,
    pub categories: BTreeSet<String>,
    pub rating: Option<f64>,
    pub rating_count: u32,
    pub price_level: Option<u8>,
    pub operational_status: Option<String>,
    pub photo_urls: Vec<String>,
}

impl PlaceFields {
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("place name is required".into()));
        }
        Coordinate::new(self.coordinate.lat, self.coordinate.lng)?;
        if let Some(rating) = self.rating {
            if !(0.0..=5.0).contains(&rating) {
                return Err(AppError::Validation(format!("rating out of range: {rating}")));
            }
        }
        if let Some(level) = self.price_level {
            if level > 4 {
                return Err(AppError::Validation(format!(
                    "price level out of range: {level}"
                )));
            }
        }
        Ok(())
    }

    /// Copies attributes this record lacks from `other`; identity and
    /// ownership data are not part of `PlaceFields` and stay untouched.
    pub fn fill_missing_from(&mut self, other: &PlaceFields) -> bool {
        let mut changed = false;
        if self.formatted_address.is_none() && other.formatted_address.is_some() {
            self.formatted_address = other.formatted_address.clone();
            changed = true;
        }
        if self.rating.is_none() && other.rating.is_some() {
            self.rating = other.rating;
            self.rating_count = other.rating_count;
            changed = true;
        }
        if self.price_level.is_none() && other.price_level.is_some() {
            self.price_level = other.price_level;
            changed = true;
        }
        if self.operational_status.is_none() && other.operational_status.is_some() {
            self.operational_status = other.operational_status.clone();
            changed = true;
        }
        if self.photo_urls.is_empty() && !other.photo_urls.is_empty() {
            self.photo_urls = other.photo_urls.clone();
            changed = true;
        }
        if !other.categories.is_subset(&self.categories) {
            self.categories.extend(other.categories.iter().cloned());
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimDetails {
    pub contact_email: String,
    pub contact_phone: String,
    pub justification: String,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationDetails {
    pub operator_id: String,
    pub notes: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogPlace {
    pub id: i64,
    pub provider: Option<String>,
    pub external_id: Option<String>,
    #[serde(flatten)]
    pub fields: PlaceFields,
    pub source: PlaceSource,
    pub imported_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: OwnershipStatus,
    pub claim: Option<ClaimDetails>,
    pub verification: Option<VerificationDetails>,
    pub version: i64,
}

impl CatalogPlace {
    pub fn summary(&self) -> CatalogPlaceSummary {
        CatalogPlaceSummary {
            id: self.id,
            external_id: self.external_id.clone(),
            name: self.fields.name.clone(),
            formatted_address: self.fields.formatted_address.clone(),
            coordinate: self.fields.coordinate,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPlaceSummary {
    pub id: i64,
    pub external_id: Option<String>,
    pub name: String,
    pub formatted_address: Option<String>,
    pub coordinate: Coordinate,
    pub status: OwnershipStatus,
}

#[derive(Debug, Clone)]
pub struct NewCatalogPlace {
    pub provider: Option<String>,
    pub external_id: Option<String>,
    pub fields: PlaceFields,
    pub source: PlaceSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimEvent {
    pub id: i64,
    pub place_id: i64,
    pub from_status: OwnershipStatus,
    pub to_status: OwnershipStatus,
    pub actor: String,
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// What a status swap writes alongside the new status.
#[derive(Debug, Clone, Copy)]
pub enum StatusWrite<'a> {
    /// Replaces claim metadata and clears any earlier decision.
    Claim(&'a ClaimDetails),
    StatusOnly,
    Decision(&'a VerificationDetails),
}

/// Read side the matcher needs.
pub trait CatalogLookup {
    fn find_by_external_id(
        &self,
        provider: &str,
        external_id: &str,
    ) -> AppResult<Option<CatalogPlace>>;

    fn find_near(&self, center: Coordinate, radius_meters: f64) -> AppResult<Vec<CatalogPlace>>;
}

#[derive(Clone)]
pub struct CatalogStore {
    db: Arc<Mutex<Connection>>,
}

impl CatalogStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Runs `op` inside one immediate transaction; every read and write it
    /// performs is atomic with respect to other writers of the catalog.
    pub fn write<T, F>(&self, op: F) -> AppResult<T>
    where
        F: FnOnce(&CatalogWriter<'_>) -> AppResult<T>,
    {
        let mut conn = self.db.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let writer = CatalogWriter { tx };
        let value = op(&writer)?;
        writer.tx.commit()?;
        Ok(value)
    }

    pub fn get(&self, id: i64) -> AppResult<CatalogPlace> {
        let conn = self.db.lock();
        load_place(&conn, id)?.ok_or_else(|| AppError::NotFound(format!("place {id}")))
    }

    pub fn count(&self) -> AppResult<i64> {
        let conn = self.db.lock();
        conn.query_row("SELECT COUNT(*) FROM catalog_places", [], |row| row.get(0))
            .map_err(AppError::from)
    }

    pub fn max_id(&self) -> AppResult<i64> {
        let conn = self.db.lock();
        conn.query_row("SELECT COALESCE(MAX(id), 0) FROM catalog_places", [], |row| {
            row.get(0)
        })
        .map_err(AppError::from)
    }

    pub fn create_manual(&self, fields: PlaceFields) -> AppResult<CatalogPlace> {
        fields.validate()?;
        self.write(|writer| {
            let id = writer.insert(&NewCatalogPlace {
                provider: None,
                external_id: None,
                fields,
                source: PlaceSource::Manual,
            })?;
            writer.get(id)
        })
    }

    /// Moves `id` from `expected` (at `expected_version`) to `next`, writing the
    /// metadata in `write` and an audit row. Returns false when the row changed
    /// underneath the caller.
    pub fn compare_and_swap_status(
        &self,
        id: i64,
        expected: OwnershipStatus,
        expected_version: i64,
        next: OwnershipStatus,
        write: StatusWrite<'_>,
        actor: &str,
    ) -> AppResult<bool> {
        self.write(|writer| {
            let now = Utc::now();
            let changed = match write {
                StatusWrite::Claim(claim) => writer.tx.execute(
                    "UPDATE catalog_places SET
                        ownership_status = ?1,
                        claim_email = ?2,
                        claim_phone = ?3,
                        claim_justification = ?4,
                        claimed_at = ?5,
                        verified_by = NULL,
                        decision_notes = NULL,
                        decided_at = NULL,
                        updated_at = ?6,
                        version = version + 1
                    WHERE id = ?7 AND ownership_status = ?8 AND version = ?9",
                    params![
                        next,
                        claim.contact_email,
                        claim.contact_phone,
                        claim.justification,
                        claim.claimed_at,
                        now,
                        id,
                        expected,
                        expected_version
                    ],
                )?,
                StatusWrite::StatusOnly => writer.tx.execute(
                    "UPDATE catalog_places SET
                        ownership_status = ?1,
                        updated_at = ?2,
                        version = version + 1
                    WHERE id = ?3 AND ownership_status = ?4 AND version = ?5",
                    params![next, now, id, expected, expected_version],
                )?,
                StatusWrite::Decision(decision) => writer.tx.execute(
                    "UPDATE catalog_places SET
                        ownership_status = ?1,
                        verified_by = ?2,
                        decision_notes = ?3,
                        decided_at = ?4,
                        updated_at = ?5,
                        version = version + 1
                    WHERE id = ?6 AND ownership_status = ?7 AND version = ?8",
                    params![
                        next,
                        decision.operator_id,
                        decision.notes,
                        decision.decided_at,
                        now,
                        id,
                        expected,
                        expected_version
                    ],
                )?,
            };
            if changed == 0 {
                return Ok(false);
            }

            let notes = match write {
                StatusWrite::Claim(claim) => Some(claim.justification.clone()),
                StatusWrite::Decision(decision) => decision.notes.clone(),
                StatusWrite::StatusOnly => None,
            };
            writer.tx.execute(
                "INSERT INTO claim_events (place_id, from_status, to_status, actor, notes, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, expected, next, actor, notes, now],
            )?;
            Ok(true)
        })
    }

    pub fn claim_history(&self, place_id: i64) -> AppResult<Vec<ClaimEvent>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, place_id, from_status, to_status, actor, notes, recorded_at
            FROM claim_events WHERE place_id = ?1 ORDER BY id ASC",
        )?;
        let events = stmt
            .query_map([place_id], |row| {
                Ok(ClaimEvent {
                    id: row.get(0)?,
                    place_id: row.get(1)?,
                    from_status: row.get(2)?,
                    to_status: row.get(3)?,
                    actor: row.get(4)?,
                    notes: row.get(5)?,
                    recorded_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

impl CatalogLookup for CatalogStore {
    fn find_by_external_id(
        &self,
        provider: &str,
        external_id: &str,
    ) -> AppResult<Option<CatalogPlace>> {
        let conn = self.db.lock();
        find_by_external_id(&conn, provider, external_id)
    }

    fn find_near(&self, center: Coordinate, radius_meters: f64) -> AppResult<Vec<CatalogPlace>> {
        let conn = self.db.lock();
        find_near(&conn, center, radius_meters)
    }
}

/// Transaction-scoped view handed out by [`CatalogStore::write`].
pub struct CatalogWriter<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl CatalogWriter<'_> {
    pub fn get(&self, id: i64) -> AppResult<CatalogPlace> {
        load_place(&self.tx, id)?.ok_or_else(|| AppError::NotFound(format!("place {id}")))
    }

    pub fn insert(&self, place: &NewCatalogPlace) -> AppResult<i64> {
        let now = Utc::now();
        let fields = &place.fields;
        let result = self.tx.execute(
            "INSERT INTO catalog_places (
                provider, external_id, name, formatted_address, lat, lng, categories,
                rating, rating_count, price_level, operational_status, photo_urls,
                source, imported_at, updated_at, ownership_status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14, ?15)",
            params![
                place.provider,
                place.external_id,
                fields.name,
                fields.formatted_address,
                fields.coordinate.lat,
                fields.coordinate.lng,
                serde_json::to_string(&fields.categories)?,
                fields.rating,
                fields.rating_count,
                fields.price_level,
                fields.operational_status,
                serde_json::to_string(&fields.photo_urls)?,
                place.source,
                now,
                OwnershipStatus::Imported
            ],
        );

        match result {
            Ok(_) => {
                let id = self.tx.last_insert_rowid();
                trace!(place_id = id, external_id = ?place.external_id, "catalog place inserted");
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(code, _))
                if code.code == ErrorCode::ConstraintViolation && place.external_id.is_some() =>
            {
                Err(AppError::DuplicateExternalId {
                    provider: place.provider.clone().unwrap_or_default(),
                    external_id: place.external_id.clone().unwrap_or_default(),
                })
            }
            Err(err) => Err(AppError::from(err)),
        }
    }

    /// Rewrites descriptive fields only; status, claim and verification
    /// columns are never part of this statement.
    pub fn refresh(&self, id: i64, fields: &PlaceFields) -> AppResult<()> {
        let changed = self.tx.execute(
            "UPDATE catalog_places SET
                name = ?1,
                formatted_address = ?2,
                lat = ?3,
                lng = ?4,
                categories = ?5,
                rating = ?6,
                rating_count = ?7,
                price_level = ?8,
                operational_status = ?9,
                photo_urls = ?10,
                updated_at = ?11,
                version = version + 1
            WHERE id = ?12",
            params![
                fields.name,
                fields.formatted_address,
                fields.coordinate.lat,
                fields.coordinate.lng,
                serde_json::to_string(&fields.categories)?,
                fields.rating,
                fields.rating_count,
                fields.price_level,
                fields.operational_status,
                serde_json::to_string(&fields.photo_urls)?,
                Utc::now(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("place {id}")));
        }
        Ok(())
    }
}

impl CatalogLookup for CatalogWriter<'_> {
    fn find_by_external_id(
        &self,
        provider: &str,
        external_id: &str,
    ) -> AppResult<Option<CatalogPlace>> {
        find_by_external_id(&self.tx, provider, external_id)
    }

    fn find_near(&self, center: Coordinate, radius_meters: f64) -> AppResult<Vec<CatalogPlace>> {
        find_near(&self.tx, center, radius_meters)
    }
}

fn load_place(conn: &Connection, id: i64) -> AppResult<Option<CatalogPlace>> {
    let sql = format!("SELECT {PLACE_COLUMNS} FROM catalog_places WHERE id = ?1");
    conn.query_row(&sql, [id], place_from_row)
        .optional()
        .map_err(AppError::from)
}

fn find_by_external_id(
    conn: &Connection,
    provider: &str,
    external_id: &str,
) -> AppResult<Option<CatalogPlace>> {
    let sql = format!(
        "SELECT {PLACE_COLUMNS} FROM catalog_places WHERE provider = ?1 AND external_id = ?2"
    );
    conn.query_row(&sql, (provider, external_id), place_from_row)
        .optional()
        .map_err(AppError::from)
}

// The longitude window wraps at the antimeridian.
fn find_near(conn: &Connection, center: Coordinate, radius_meters: f64) -> AppResult<Vec<CatalogPlace>> {
    let (lat_delta, lng_delta) = center.bounding_deltas(radius_meters);
    let sql = format!(
        "SELECT {PLACE_COLUMNS} FROM catalog_places
        WHERE ABS(lat - ?1) <= ?3
          AND (ABS(lng - ?2) <= ?4 OR 360.0 - ABS(lng - ?2) <= ?4)
        ORDER BY id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let places = stmt
        .query_map(
            (center.lat, center.lng, lat_delta, lng_delta),
            place_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(places
        .into_iter()
        .filter(|place| place.fields.coordinate.distance_meters(&center) <= radius_meters)
        .collect())
}

fn place_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogPlace> {
    let categories: String = row.get(7)?;
    let photo_urls: String = row.get(12)?;
    let status: OwnershipStatus = row.get(16)?;

    let claimed_at: Option<DateTime<Utc>> = row.get(20)?;
    let claim = match claimed_at {
        Some(claimed_at) => Some(ClaimDetails {
            contact_email: row.get::<_, Option<String>>(17)?.unwrap_or_default(),
            contact_phone: row.get::<_, Option<String>>(18)?.unwrap_or_default(),
            justification: row.get::<_, Option<String>>(19)?.unwrap_or_default(),
            claimed_at,
        }),
        None => None,
    };
    let decided_at: Option<DateTime<Utc>> = row.get(23)?;
    let verification = match decided_at {
        Some(decided_at) => Some(VerificationDetails {
            operator_id: row.get::<_, Option<String>>(21)?.unwrap_or_default(),
            notes: row.get(22)?,
            decided_at,
        }),
        None => None,
    };

    Ok(CatalogPlace {
        id: row.get(0)?,
        provider: row.get(1)?,
        external_id: row.get(2)?,
        fields: PlaceFields {
            name: row.get(3)?,
            formatted_address: row.get(4)?,
            coordinate: Coordinate {
                lat: row.get(5)?,
                lng: row.get(6)?,
            },
            categories: json_column(7, &categories)?,
            rating: row.get(8)?,
            rating_count: row.get(9)?,
            price_level: row.get(10)?,
            operational_status: row.get(11)?,
            photo_urls: json_column(12, &photo_urls)?,
        },
        source: row.get(13)?,
        imported_at: row.get(14)?,
        updated_at: row.get(15)?,
        status,
        claim,
        verification,
        version: row.get(24)?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(index: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::open_in_memory;

    pub(crate) fn memory_store() -> CatalogStore {
        CatalogStore::new(Arc::new(Mutex::new(open_in_memory().unwrap())))
    }

    pub(crate) fn fields(name: &str, lat: f64, lng: f64) -> PlaceFields {
        PlaceFields {
            name: name.into(),
            formatted_address: None,
            coordinate: Coordinate { lat, lng },
            categories: BTreeSet::new(),
            rating: None,
            rating_count: 0,
            price_level: None,
            operational_status: None,
            photo_urls: Vec::new(),
        }
    }

    fn imported(store: &CatalogStore, external_id: &str, name: &str, lat: f64, lng: f64) -> i64 {
        store
            .write(|writer| {
                writer.insert(&NewCatalogPlace {
                    provider: Some("google_places".into()),
                    external_id: Some(external_id.into()),
                    fields: fields(name, lat, lng),
                    source: PlaceSource::ProviderImport,
                })
            })
            .unwrap()
    }

    #[test]
    fn computes_short_distances() {
        let a = Coordinate::new(5.3600, -4.0083).unwrap();
        let b = Coordinate::new(5.3601, -4.0084).unwrap();
        let distance = a.distance_meters(&b);
        assert!(distance > 10.0 && distance < 20.0, "{distance}");
        assert!(Coordinate::new(91.0, 0.0).is_err());
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn inserts_and_reads_back_places() {
        let store = memory_store();
        let id = imported(&store, "A", "Bar X", 5.36, -4.0);
        let place = store.get(id).unwrap();
        assert_eq!(place.external_id.as_deref(), Some("A"));
        assert_eq!(place.status, OwnershipStatus::Imported);
        assert_eq!(place.source, PlaceSource::ProviderImport);
        assert!(place.claim.is_none());
        assert_eq!(place.version, 0);

        let found = store.find_by_external_id("google_places", "A").unwrap();
        assert_eq!(found.map(|p| p.id), Some(id));
        assert!(store.find_by_external_id("other", "A").unwrap().is_none());
    }

    #[test]
    fn duplicate_external_id_is_typed() {
        let store = memory_store();
        imported(&store, "A", "Bar X", 5.36, -4.0);
        let err = store
            .write(|writer| {
                writer.insert(&NewCatalogPlace {
                    provider: Some("google_places".into()),
                    external_id: Some("A".into()),
                    fields: fields("Bar X again", 5.36, -4.0),
                    source: PlaceSource::ProviderImport,
                })
            })
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateExternalId { .. }));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn finds_places_within_radius_only() {
        let store = memory_store();
        let near = imported(&store, "near", "Near", 5.3601, -4.0001);
        imported(&store, "far", "Far", 5.3700, -4.0000);
        let center = Coordinate::new(5.36, -4.0).unwrap();
        let found = store.find_near(center, 100.0).unwrap();
        assert_eq!(found.iter().map(|p| p.id).collect::<Vec<_>>(), vec![near]);
    }

    #[test]
    fn finds_neighbours_across_the_antimeridian() {
        let store = memory_store();
        let east = imported(&store, "east", "Fiji East", -16.5, 179.99995);
        let west = imported(&store, "west", "Fiji West", -16.5, -179.99995);
        let center = Coordinate::new(-16.5, 179.99995).unwrap();
        let found = store.find_near(center, 100.0).unwrap();
        assert_eq!(found.iter().map(|p| p.id).collect::<Vec<_>>(), vec![east, west]);
    }

    #[test]
    fn corrupt_json_columns_surface_as_errors() {
        let db = Arc::new(Mutex::new(open_in_memory().unwrap()));
        let store = CatalogStore::new(Arc::clone(&db));
        let id = imported(&store, "A", "Bar X", 5.36, -4.0);
        db.lock()
            .execute("UPDATE catalog_places SET categories = '{oops' WHERE id = ?1", [id])
            .unwrap();
        assert!(matches!(
            store.get(id),
            Err(AppError::Database(rusqlite::Error::FromSqlConversionFailure(7, Type::Text, _)))
        ));
    }

    #[test]
    fn refresh_keeps_ownership_data() {
        let store = memory_store();
        let id = imported(&store, "A", "Bar X", 5.36, -4.0);
        let claim = ClaimDetails {
            contact_email: "owner@example.com".into(),
            contact_phone: "+225 01 02".into(),
            justification: "I run it".into(),
            claimed_at: Utc::now(),
        };
        assert!(store
            .compare_and_swap_status(
                id,
                OwnershipStatus::Imported,
                0,
                OwnershipStatus::Claimed,
                StatusWrite::Claim(&claim),
                "owner@example.com",
            )
            .unwrap());

        let mut refreshed = fields("Bar X Lounge", 5.36, -4.0);
        refreshed.rating = Some(4.5);
        store.write(|writer| writer.refresh(id, &refreshed)).unwrap();

        let place = store.get(id).unwrap();
        assert_eq!(place.fields.name, "Bar X Lounge");
        assert_eq!(place.status, OwnershipStatus::Claimed);
        assert_eq!(place.claim.unwrap().contact_email, "owner@example.com");
        assert_eq!(place.version, 2);
    }

    #[test]
    fn stale_swap_is_rejected() {
        let store = memory_store();
        let id = imported(&store, "A", "Bar X", 5.36, -4.0);
        store
            .write(|writer| writer.refresh(id, &fields("Bar X", 5.36, -4.0)))
            .unwrap();
        let swapped = store
            .compare_and_swap_status(
                id,
                OwnershipStatus::Imported,
                0,
                OwnershipStatus::Claimed,
                StatusWrite::StatusOnly,
                "someone",
            )
            .unwrap();
        assert!(!swapped);
        assert!(store.claim_history(id).unwrap().is_empty());
    }

    #[test]
    fn manual_places_have_no_external_id() {
        let store = memory_store();
        let place = store.create_manual(fields("Chez Ama", 5.35, -4.01)).unwrap();
        assert_eq!(place.source, PlaceSource::Manual);
        assert!(place.external_id.is_none());
        assert!(store.create_manual(fields("  ", 5.35, -4.01)).is_err());
    }

    #[test]
    fn fill_missing_never_overwrites() {
        let mut retained = fields("Bar X", 5.36, -4.0);
        retained.rating = Some(3.0);
        let mut incoming = fields("Bar X", 5.36, -4.0);
        incoming.rating = Some(4.8);
        incoming.price_level = Some(2);
        assert!(retained.fill_missing_from(&incoming));
        assert_eq!(retained.rating, Some(3.0));
        assert_eq!(retained.price_level, Some(2));
        assert!(!retained.fill_missing_from(&incoming));
    }
}
