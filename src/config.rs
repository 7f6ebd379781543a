use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_TELEMETRY_BUFFER_MAX_FILES: usize = 5;
const DEFAULT_PLACES_API_BASE: &str = "https://places.googleapis.com/v1";
const DEFAULT_PROVIDER_NAME: &str = "google_places";
// Places text search never returns more than three pages of twenty.
const DEFAULT_MAX_RESULTS_CAP: usize = 60;

/// What to do with the retained record when a provider result is skipped as
/// a fuzzy duplicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateMergePolicy {
    Ignore,
    FillMissing,
}

impl DuplicateMergePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ignore" => Some(DuplicateMergePolicy::Ignore),
            "fill_missing" | "fill-missing" => Some(DuplicateMergePolicy::FillMissing),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
    pub places_api_base: String,
    pub places_api_key: Option<SecretString>,
    pub places_provider_name: String,
    pub places_rate_limit_qps: u32,
    pub places_timeout_ms: u64,
    pub places_page_size: u32,
    pub places_fixture_path: Option<PathBuf>,
    pub import_max_results_cap: usize,
    pub match_radius_meters: f64,
    pub match_threshold: f64,
    pub duplicate_merge_policy: DuplicateMergePolicy,
    pub database_file_name: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub places_api_base: String,
    pub places_provider_name: String,
    pub places_rate_limit_qps: u32,
    pub places_timeout_ms: u64,
    pub places_page_size: u32,
    pub import_max_results_cap: usize,
    pub match_radius_meters: f64,
    pub match_threshold: f64,
    pub duplicate_merge_policy: DuplicateMergePolicy,
    pub database_file_name: String,
    pub has_places_api_key: bool,
    pub uses_fixture_provider: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            telemetry_enabled_by_default: parse_bool("TELEMETRY_ENABLED", true),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", 25).max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
            telemetry_buffer_max_files: parse_usize(
                "TELEMETRY_BUFFER_MAX_FILES",
                DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
            )
            .max(1),
            places_api_base: env::var("PLACES_API_BASE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PLACES_API_BASE.to_string()),
            places_api_key: env::var("GOOGLE_PLACES_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            places_provider_name: env::var("PLACES_PROVIDER_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PROVIDER_NAME.to_string()),
            places_rate_limit_qps: parse_u32("PLACES_RATE_LIMIT_QPS", 3).max(1),
            places_timeout_ms: parse_u64("PLACES_TIMEOUT_MS", 10_000).max(100),
            places_page_size: parse_u32("PLACES_PAGE_SIZE", 20).clamp(1, 20),
            places_fixture_path: env::var("PLACES_FIXTURE_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            import_max_results_cap: parse_usize("IMPORT_MAX_RESULTS_CAP", DEFAULT_MAX_RESULTS_CAP)
                .max(1),
            match_radius_meters: parse_f64("MATCH_RADIUS_METERS", 100.0).max(1.0),
            match_threshold: parse_f64("MATCH_THRESHOLD", 0.85).clamp(0.0, 1.0),
            duplicate_merge_policy: parse_merge_policy("DUPLICATE_MERGE_POLICY"),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "place-catalog.db".to_string()),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
            telemetry_batch_size: self.telemetry_batch_size,
            places_api_base: self.places_api_base.clone(),
            places_provider_name: self.places_provider_name.clone(),
            places_rate_limit_qps: self.places_rate_limit_qps,
            places_timeout_ms: self.places_timeout_ms,
            places_page_size: self.places_page_size,
            import_max_results_cap: self.import_max_results_cap,
            match_radius_meters: self.match_radius_meters,
            match_threshold: self.match_threshold,
            duplicate_merge_policy: self.duplicate_merge_policy,
            database_file_name: self.database_file_name.clone(),
            has_places_api_key: self.places_api_key.is_some(),
            uses_fixture_provider: self.places_fixture_path.is_some(),
        }
    }
}

impl Default for AppConfig {
    /// Defaults without consulting the environment.
    fn default() -> Self {
        Self {
            telemetry_enabled_by_default: true,
            telemetry_batch_size: 25,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            telemetry_buffer_max_files: DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
            places_api_base: DEFAULT_PLACES_API_BASE.to_string(),
            places_api_key: None,
            places_provider_name: DEFAULT_PROVIDER_NAME.to_string(),
            places_rate_limit_qps: 3,
            places_timeout_ms: 10_000,
            places_page_size: 20,
            places_fixture_path: None,
            import_max_results_cap: DEFAULT_MAX_RESULTS_CAP,
            match_radius_meters: 100.0,
            match_threshold: 0.85,
            duplicate_merge_policy: DuplicateMergePolicy::Ignore,
            database_file_name: "place-catalog.db".to_string(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_merge_policy(key: &str) -> DuplicateMergePolicy {
    match env::var(key) {
        Ok(value) => DuplicateMergePolicy::parse(&value).unwrap_or_else(|| {
            warn!(%value, "unknown duplicate merge policy; falling back to ignore");
            DuplicateMergePolicy::Ignore
        }),
        Err(_) => DuplicateMergePolicy::Ignore,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
