use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::catalog::{Coordinate, PlaceFields};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

// Upper bound on pages per search in case a provider keeps handing out tokens.
const MAX_PAGES_PER_SEARCH: usize = 50;
const MAX_BIAS_RADIUS_METERS: u32 = 50_000;
const FIELD_MASK: &str = "places.id,places.displayName,places.formattedAddress,places.location,\
places.types,places.rating,places.userRatingCount,places.priceLevel,places.businessStatus,\
places.photos,nextPageToken";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub location: String,
    pub radius_meters: u32,
    pub category: Option<String>,
    pub max_results: usize,
}

impl SearchQuery {
    /// `"lat,lng"` locations are searched around that point; anything else
    /// is treated as free text.
    pub fn center(&self) -> Option<Coordinate> {
        let (lat, lng) = self.location.split_once(',')?;
        let lat = lat.trim().parse().ok()?;
        let lng = lng.trim().parse().ok()?;
        Coordinate::new(lat, lng).ok()
    }

    fn text_query(&self) -> String {
        let subject = self
            .category
            .as_deref()
            .map(|c| c.replace('_', " "))
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| "places".to_string());
        if self.center().is_some() {
            subject
        } else {
            format!("{subject} in {}", self.location.trim())
        }
    }
}

/// A place as the provider returned it, before any validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlace {
    pub id: Option<String>,
    pub display_name: Option<LocalizedText>,
    pub formatted_address: Option<String>,
    pub location: Option<RawLocation>,
    #[serde(default)]
    pub types: Vec<String>,
    pub rating: Option<f64>,
    pub user_rating_count: Option<u32>,
    pub price_level: Option<serde_json::Value>,
    pub business_status: Option<String>,
    #[serde(default)]
    pub photos: Vec<RawPhoto>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalizedText {
    pub text: Option<String>,
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawLocation {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPhoto {
    pub name: Option<String>,
}

impl RawPlace {
    pub fn new(id: &str, name: &str, lat: f64, lng: f64) -> Self {
        Self {
            id: Some(id.to_string()),
            display_name: Some(LocalizedText {
                text: Some(name.to_string()),
                language_code: None,
            }),
            location: Some(RawLocation {
                latitude: Some(lat),
                longitude: Some(lng),
            }),
            ..Self::default()
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    pub fn normalize(&self) -> AppResult<ProviderPlace> {
        let malformed = |reason: &str| AppError::MalformedRecord {
            external_id: self.external_id().unwrap_or("<missing>").to_string(),
            reason: reason.to_string(),
        };

        let external_id = self
            .external_id()
            .ok_or_else(|| malformed("missing place id"))?
            .to_string();
        let name = self
            .display_name
            .as_ref()
            .and_then(|text| text.text.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| malformed("missing display name"))?
            .to_string();
        let location = self
            .location
            .as_ref()
            .ok_or_else(|| malformed("missing location"))?;
        let (lat, lng) = match (location.latitude, location.longitude) {
            (Some(lat), Some(lng)) => (lat, lng),
            _ => return Err(malformed("incomplete location")),
        };
        let coordinate =
            Coordinate::new(lat, lng).map_err(|_| malformed("location out of range"))?;

        let rating = match self.rating {
            Some(value) if !(0.0..=5.0).contains(&value) => {
                return Err(malformed(&format!("rating {value} outside 0-5")))
            }
            other => other,
        };

        Ok(ProviderPlace {
            external_id,
            name,
            formatted_address: self
                .formatted_address
                .as_deref()
                .map(str::trim)
                .filter(|address| !address.is_empty())
                .map(str::to_string),
            coordinate,
            categories: self
                .types
                .iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            rating,
            rating_count: self.user_rating_count.unwrap_or(0),
            price_level: self.price_level.as_ref().and_then(parse_price_level),
            operational_status: self.business_status.clone(),
            photo_refs: self.photos.iter().filter_map(|p| p.name.clone()).collect(),
        })
    }
}

fn parse_price_level(value: &serde_json::Value) -> Option<u8> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().filter(|v| *v <= 4).map(|v| v as u8),
        serde_json::Value::String(s) => match s.as_str() {
            "PRICE_LEVEL_FREE" => Some(0),
            "PRICE_LEVEL_INEXPENSIVE" => Some(1),
            "PRICE_LEVEL_MODERATE" => Some(2),
            "PRICE_LEVEL_EXPENSIVE" => Some(3),
            "PRICE_LEVEL_VERY_EXPENSIVE" => Some(4),
            _ => None,
        },
        _ => None,
    }
}

/// Canonical provider record consumed by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderPlace {
    pub external_id: String,
    pub name: String,
    pub formatted_address: Option<String>,
    pub coordinate: Coordinate,
    pub categories: BTreeSet<String>,
    pub rating: Option<f64>,
    pub rating_count: u32,
    pub price_level: Option<u8>,
    pub operational_status: Option<String>,
    pub photo_refs: Vec<String>,
}

impl ProviderPlace {
    pub fn to_fields(&self, directory: &dyn PlaceDirectory) -> PlaceFields {
        PlaceFields {
            name: self.name.clone(),
            formatted_address: self.formatted_address.clone(),
            coordinate: self.coordinate,
            categories: self.categories.clone(),
            rating: self.rating,
            rating_count: self.rating_count,
            price_level: self.price_level,
            operational_status: self.operational_status.clone(),
            photo_urls: self
                .photo_refs
                .iter()
                .map(|reference| directory.photo_url(reference))
                .collect(),
        }
    }
}

/// One entry of a provider page, left as JSON until the importer reaches it
/// so a badly typed field only fails its own record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderRecord(serde_json::Value);

impl ProviderRecord {
    pub fn from_place(place: &RawPlace) -> AppResult<Self> {
        Ok(Self(serde_json::to_value(place)?))
    }

    /// The `id` field when it is a non-blank string.
    pub fn external_id(&self) -> Option<&str> {
        self.0
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn parse(&self) -> AppResult<RawPlace> {
        RawPlace::deserialize(&self.0).map_err(|err| AppError::MalformedRecord {
            external_id: self.external_id().unwrap_or("<missing>").to_string(),
            reason: format!("unreadable record: {err}"),
        })
    }
}

impl From<serde_json::Value> for ProviderRecord {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPage {
    #[serde(default)]
    pub places: Vec<ProviderRecord>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait PlaceDirectory: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn fetch_page(
        &self,
        query: &SearchQuery,
        page_token: Option<String>,
    ) -> AppResult<ProviderPage>;

    fn photo_url(&self, reference: &str) -> String {
        reference.to_string()
    }
}

/// Lazily paginated results of one search. Not restartable: a new search
/// starts from the first page with no cursor carried over.
pub struct PlaceSearch {
    directory: Arc<dyn PlaceDirectory>,
    query: SearchQuery,
    buffer: VecDeque<ProviderRecord>,
    pending: Option<JoinHandle<AppResult<ProviderPage>>>,
    started: bool,
    yielded: usize,
    pages_fetched: usize,
}

impl PlaceSearch {
    pub fn new(directory: Arc<dyn PlaceDirectory>, query: SearchQuery) -> Self {
        Self {
            directory,
            query,
            buffer: VecDeque::new(),
            pending: None,
            started: false,
            yielded: 0,
            pages_fetched: 0,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Next unparsed record, or a page-level failure. After an error the
    /// search is finished.
    pub async fn next(&mut self) -> Option<AppResult<ProviderRecord>> {
        loop {
            if self.yielded >= self.query.max_results {
                self.stop_prefetch();
                return None;
            }
            if let Some(place) = self.buffer.pop_front() {
                self.yielded += 1;
                return Some(Ok(place));
            }

            let page = if let Some(handle) = self.pending.take() {
                match handle.await {
                    Ok(result) => result,
                    Err(err) => Err(AppError::ProviderUnavailable(format!(
                        "page fetch aborted: {err}"
                    ))),
                }
            } else if !self.started {
                self.started = true;
                self.directory.fetch_page(&self.query, None).await
            } else {
                return None;
            };

            match page {
                Ok(page) => {
                    self.pages_fetched += 1;
                    debug!(
                        page = self.pages_fetched,
                        records = page.places.len(),
                        has_more = page.next_page_token.is_some(),
                        "provider page received"
                    );
                    self.buffer.extend(page.places);
                    if let Some(token) = page.next_page_token {
                        let wanted = self.yielded + self.buffer.len() < self.query.max_results;
                        if wanted && self.pages_fetched < MAX_PAGES_PER_SEARCH {
                            self.prefetch(token);
                        }
                    }
                }
                Err(err) => {
                    self.buffer.clear();
                    return Some(Err(err));
                }
            }
        }
    }

    // The next page is requested while the caller works through this one.
    fn prefetch(&mut self, token: String) {
        let directory = Arc::clone(&self.directory);
        let query = self.query.clone();
        self.pending = Some(tokio::spawn(async move {
            directory.fetch_page(&query, Some(token)).await
        }));
    }

    fn stop_prefetch(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for PlaceSearch {
    fn drop(&mut self) {
        self.stop_prefetch();
    }
}

/// Picks the configured directory: fixture file first, then the HTTP API.
pub fn directory_from_config(config: &AppConfig) -> AppResult<Arc<dyn PlaceDirectory>> {
    if let Some(path) = &config.places_fixture_path {
        return Ok(Arc::new(StaticDirectory::from_json_file(
            path,
            &config.places_provider_name,
        )?));
    }
    let api_key = config.places_api_key.clone().ok_or_else(|| {
        AppError::Config("GOOGLE_PLACES_API_KEY or PLACES_FIXTURE_PATH must be set".into())
    })?;
    Ok(Arc::new(HttpPlacesDirectory::new(config, api_key)?))
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        let interval_ms = (1000_f64 / qps.max(1) as f64).ceil() as u64;
        Self {
            min_interval: Duration::from_millis(interval_ms.max(50)),
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

pub struct HttpPlacesDirectory {
    http: reqwest::Client,
    api_key: SecretString,
    api_base: String,
    provider_name: String,
    page_size: u32,
    rate_limiter: RateLimiter,
}

impl HttpPlacesDirectory {
    pub fn new(config: &AppConfig, api_key: SecretString) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("place-import/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.places_timeout_ms))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build places client: {err}")))?;
        Ok(Self {
            http,
            api_key,
            api_base: config.places_api_base.trim_end_matches('/').to_string(),
            provider_name: config.places_provider_name.clone(),
            page_size: config.places_page_size,
            rate_limiter: RateLimiter::new(config.places_rate_limit_qps),
        })
    }
}

#[async_trait]
impl PlaceDirectory for HttpPlacesDirectory {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn fetch_page(
        &self,
        query: &SearchQuery,
        page_token: Option<String>,
    ) -> AppResult<ProviderPage> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct RequestBody<'a> {
            text_query: String,
            page_size: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            page_token: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            location_bias: Option<LocationBias>,
        }

        #[derive(Serialize)]
        struct LocationBias {
            circle: BiasCircle,
        }

        #[derive(Serialize)]
        struct BiasCircle {
            center: BiasCenter,
            radius: f64,
        }

        #[derive(Serialize)]
        struct BiasCenter {
            latitude: f64,
            longitude: f64,
        }

        let body = RequestBody {
            text_query: query.text_query(),
            page_size: self.page_size,
            page_token: page_token.as_deref(),
            location_bias: query.center().map(|center| LocationBias {
                circle: BiasCircle {
                    center: BiasCenter {
                        latitude: center.lat,
                        longitude: center.lng,
                    },
                    radius: query.radius_meters.clamp(1, MAX_BIAS_RADIUS_METERS) as f64,
                },
            }),
        };

        self.rate_limiter.wait().await;
        let response = self
            .http
            .post(format!("{}/places:searchText", self.api_base))
            .header("X-Goog-Api-Key", self.api_key.expose_secret())
            .header("X-Goog-FieldMask", FIELD_MASK)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }

        serde_json::from_str::<ProviderPage>(&text).map_err(|err| {
            warn!(?err, "provider returned an unreadable page");
            AppError::ProviderUnavailable(format!("unreadable provider page: {err}"))
        })
    }

    fn photo_url(&self, reference: &str) -> String {
        format!("{}/{reference}/media?maxWidthPx=1200", self.api_base)
    }
}

fn classify_failure(status: StatusCode, body: &str) -> AppError {
    if status == StatusCode::TOO_MANY_REQUESTS || body.contains("RESOURCE_EXHAUSTED") {
        return AppError::ProviderQuotaExceeded(format!("provider responded {status}"));
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return AppError::ProviderUnavailable(format!("provider responded {status}"));
    }
    AppError::Config(format!("provider rejected the search ({status})"))
}

/// Failure a scripted page reports instead of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFailure {
    Unavailable,
    QuotaExceeded,
}

enum ScriptedPage {
    Places(Vec<RawPlace>),
    Records(Vec<ProviderRecord>),
    Failed(PageFailure),
}

/// Serves pre-recorded pages; used for offline runs and tests.
pub struct StaticDirectory {
    provider_name: String,
    pages: Vec<ScriptedPage>,
    requests: Mutex<Vec<Option<String>>>,
    fetches: AtomicUsize,
}

impl StaticDirectory {
    pub fn new(provider_name: &str, pages: Vec<Vec<RawPlace>>) -> Self {
        Self::scripted(provider_name, pages.into_iter().map(Ok).collect())
    }

    pub fn scripted(provider_name: &str, pages: Vec<Result<Vec<RawPlace>, PageFailure>>) -> Self {
        Self::with_pages(
            provider_name,
            pages
                .into_iter()
                .map(|page| match page {
                    Ok(places) => ScriptedPage::Places(places),
                    Err(failure) => ScriptedPage::Failed(failure),
                })
                .collect(),
        )
    }

    /// Pages of provider JSON served as-is, typed or not.
    pub fn from_records(provider_name: &str, pages: Vec<Vec<serde_json::Value>>) -> Self {
        Self::with_pages(
            provider_name,
            pages
                .into_iter()
                .map(|page| ScriptedPage::Records(page.into_iter().map(ProviderRecord::from).collect()))
                .collect(),
        )
    }

    fn with_pages(provider_name: &str, pages: Vec<ScriptedPage>) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            pages,
            requests: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Reads `{"pages": [{"places": [...]}, ...]}`.
    pub fn from_json_file(path: &Path, provider_name: &str) -> AppResult<Self> {
        #[derive(Deserialize)]
        struct Fixture {
            pages: Vec<ProviderPage>,
        }

        let contents = std::fs::read_to_string(path)?;
        let fixture: Fixture = serde_json::from_str(&contents)?;
        Ok(Self::with_pages(
            provider_name,
            fixture
                .pages
                .into_iter()
                .map(|page| ScriptedPage::Records(page.places))
                .collect(),
        ))
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Page tokens received, in order (`None` = first page).
    pub fn requested_tokens(&self) -> Vec<Option<String>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl PlaceDirectory for StaticDirectory {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn fetch_page(
        &self,
        _query: &SearchQuery,
        page_token: Option<String>,
    ) -> AppResult<ProviderPage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(page_token.clone());

        let index = match page_token.as_deref() {
            None => 0,
            Some(token) => token
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| AppError::ProviderUnavailable(format!("unknown page token {token}")))?,
        };
        let Some(page) = self.pages.get(index) else {
            return Ok(ProviderPage::default());
        };
        let places = match page {
            ScriptedPage::Places(places) => places
                .iter()
                .map(ProviderRecord::from_place)
                .collect::<AppResult<Vec<_>>>()?,
            ScriptedPage::Records(records) => records.clone(),
            ScriptedPage::Failed(failure) => return Err(scripted_failure(*failure, index)),
        };
        Ok(ProviderPage {
            places,
            next_page_token: (index + 1 < self.pages.len()).then(|| format!("page-{}", index + 1)),
        })
    }
}

fn scripted_failure(failure: PageFailure, index: usize) -> AppError {
    match failure {
        PageFailure::Unavailable => {
            AppError::ProviderUnavailable(format!("scripted outage on page {index}"))
        }
        PageFailure::QuotaExceeded => {
            AppError::ProviderQuotaExceeded(format!("scripted quota exhaustion on page {index}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(max_results: usize) -> SearchQuery {
        SearchQuery {
            location: "5.36,-4.00".into(),
            radius_meters: 1_000,
            category: Some("bar".into()),
            max_results,
        }
    }

    fn page(prefix: &str, count: usize) -> Vec<RawPlace> {
        (0..count)
            .map(|i| RawPlace::new(&format!("{prefix}{i}"), &format!("Place {prefix}{i}"), 5.36, -4.0))
            .collect()
    }

    async fn drain(search: &mut PlaceSearch) -> (Vec<String>, Option<AppError>) {
        let mut ids = Vec::new();
        while let Some(item) = search.next().await {
            match item {
                Ok(record) => ids.push(record.external_id().unwrap().to_string()),
                Err(err) => return (ids, Some(err)),
            }
        }
        (ids, None)
    }

    #[tokio::test]
    async fn walks_every_page_until_exhausted() {
        let directory = Arc::new(StaticDirectory::new("test", vec![page("a", 2), page("b", 2)]));
        let mut search = PlaceSearch::new(directory.clone(), query(10));
        let (ids, err) = drain(&mut search).await;
        assert!(err.is_none());
        assert_eq!(ids, vec!["a0", "a1", "b0", "b1"]);
        assert_eq!(directory.fetch_count(), 2);
        assert_eq!(search.pages_fetched(), 2);
    }

    #[tokio::test]
    async fn stops_at_result_cap_without_fetching_more() {
        let directory = Arc::new(StaticDirectory::new(
            "test",
            vec![page("a", 3), page("b", 3), page("c", 3)],
        ));
        let mut search = PlaceSearch::new(directory.clone(), query(3));
        let (ids, _) = drain(&mut search).await;
        assert_eq!(ids.len(), 3);
        assert_eq!(directory.fetch_count(), 1);
    }

    #[tokio::test]
    async fn surfaces_page_failures_after_partial_results() {
        let directory = Arc::new(StaticDirectory::scripted(
            "test",
            vec![Ok(page("a", 2)), Err(PageFailure::QuotaExceeded)],
        ));
        let mut search = PlaceSearch::new(directory, query(10));
        let (ids, err) = drain(&mut search).await;
        assert_eq!(ids.len(), 2);
        assert!(matches!(err, Some(AppError::ProviderQuotaExceeded(_))));
        assert!(search.next().await.is_none());
    }

    #[tokio::test]
    async fn each_search_starts_without_a_cursor() {
        let directory = Arc::new(StaticDirectory::new("test", vec![page("a", 1), page("b", 1)]));
        for _ in 0..2 {
            let mut search = PlaceSearch::new(directory.clone(), query(10));
            drain(&mut search).await;
        }
        assert_eq!(
            directory.requested_tokens(),
            vec![None, Some("page-1".into()), None, Some("page-1".into())]
        );
    }

    #[test]
    fn normalizes_provider_records() {
        let raw: RawPlace = serde_json::from_value(serde_json::json!({
            "id": "ChIJbaobab",
            "displayName": { "text": " Le Baobab ", "languageCode": "fr" },
            "formattedAddress": "Rue des Jardins, Abidjan",
            "location": { "latitude": 5.36, "longitude": -4.0083 },
            "types": ["Restaurant", "food"],
            "rating": 4.4,
            "userRatingCount": 120,
            "priceLevel": "PRICE_LEVEL_MODERATE",
            "businessStatus": "OPERATIONAL",
            "photos": [{ "name": "places/ChIJbaobab/photos/p1" }]
        }))
        .unwrap();
        let place = raw.normalize().unwrap();
        assert_eq!(place.name, "Le Baobab");
        assert_eq!(place.price_level, Some(2));
        assert!(place.categories.contains("restaurant"));
        assert_eq!(place.photo_refs.len(), 1);
    }

    #[test]
    fn rejects_records_missing_required_fields() {
        let mut raw = RawPlace::new("X1", "Nameless", 5.0, -4.0);
        raw.location = None;
        let err = raw.normalize().unwrap_err();
        assert!(err.to_string().contains("X1"));

        let mut raw = RawPlace::new("X2", "Bad rating", 5.0, -4.0);
        raw.rating = Some(9.0);
        assert!(matches!(raw.normalize(), Err(AppError::MalformedRecord { .. })));

        let raw = RawPlace::new(" ", "No id", 5.0, -4.0);
        assert!(raw.normalize().unwrap_err().to_string().contains("<missing>"));
    }

    #[test]
    fn builds_text_queries() {
        let mut q = query(5);
        assert_eq!(q.text_query(), "bar");
        q.location = "Cocody, Abidjan".into();
        q.category = Some("night_club".into());
        assert!(q.center().is_none());
        assert_eq!(q.text_query(), "night club in Cocody, Abidjan");
    }

    #[test]
    fn classifies_http_failures() {
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, ""),
            AppError::ProviderQuotaExceeded(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, ""),
            AppError::ProviderUnavailable(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::FORBIDDEN, "{\"status\":\"RESOURCE_EXHAUSTED\"}"),
            AppError::ProviderQuotaExceeded(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, ""),
            AppError::Config(_)
        ));
    }

    #[tokio::test]
    async fn serves_fixture_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.json");
        std::fs::write(
            &path,
            r#"{"pages":[
                {"places":[{"id":"f1","displayName":{"text":"Bar X"},"location":{"latitude":5.36,"longitude":-4.0}}]},
                {"places":[
                    {"id":"f2","displayName":{"text":"Chez Ambroise"},"location":{"latitude":5.37,"longitude":-4.01}},
                    {"id":"f3","displayName":{"text":"Le Pitch"},"rating":"4.5"}
                ]}
            ]}"#,
        )
        .unwrap();

        let mut config = AppConfig::default();
        config.places_fixture_path = Some(path);
        config.places_provider_name = "fixture".into();
        let directory = directory_from_config(&config).unwrap();
        assert_eq!(directory.provider_name(), "fixture");

        let mut search = PlaceSearch::new(directory, query(10));
        let mut records = Vec::new();
        while let Some(item) = search.next().await {
            records.push(item.unwrap());
        }
        let ids: Vec<_> = records.iter().filter_map(ProviderRecord::external_id).collect();
        assert_eq!(ids, vec!["f1", "f2", "f3"]);
        assert!(records[1].parse().is_ok());
        assert!(matches!(
            records[2].parse(),
            Err(AppError::MalformedRecord { external_id, .. }) if external_id == "f3"
        ));
    }

    #[test]
    fn badly_typed_fields_fail_only_their_record() {
        let page: ProviderPage = serde_json::from_value(serde_json::json!({
            "places": [
                { "id": "ok", "displayName": { "text": "Bar X" },
                  "location": { "latitude": 5.36, "longitude": -4.0 } },
                { "id": "null-types", "displayName": { "text": "Bar Y" }, "types": null },
                { "id": "bad-count", "userRatingCount": -1 },
                { "id": 123, "displayName": { "text": "Numbered" } }
            ]
        }))
        .unwrap();
        assert_eq!(page.places.len(), 4);

        assert_eq!(page.places[0].parse().unwrap().normalize().unwrap().name, "Bar X");
        for (record, id) in page.places[1..3].iter().zip(["null-types", "bad-count"]) {
            let err = record.parse().unwrap_err();
            assert!(err.is_record_level());
            assert!(err.to_string().contains(id), "{err}");
        }
        assert_eq!(page.places[3].external_id(), None);
        assert!(page.places[3].parse().unwrap_err().to_string().contains("<missing>"));
    }

    #[test]
    fn requires_credentials_without_fixture() {
        assert!(matches!(
            directory_from_config(&AppConfig::default()),
            Err(AppError::Config(_))
        ));
    }
}
