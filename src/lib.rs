pub mod catalog;
pub mod claims;
pub mod commands;
pub mod config;
pub mod db;
pub mod errors;
pub mod importer;
pub mod jobs;
pub mod matcher;
pub mod provider;
pub mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::catalog::CatalogStore;
use crate::claims::ClaimService;
use crate::config::{AppConfig, PublicAppConfig};
use crate::db::{bootstrap, DatabaseContext};
use crate::errors::AppResult;
use crate::importer::Importer;
use crate::jobs::ImportJobStore;
use crate::provider::{directory_from_config, PlaceDirectory};
use crate::telemetry::TelemetryClient;

pub use crate::errors::AppError;

/// Everything one process needs: the catalog database, its stores and the
/// telemetry sink. The provider is resolved from config on first import
/// unless one was supplied.
pub struct AppState {
    db_path: PathBuf,
    config: AppConfig,
    catalog: CatalogStore,
    jobs: ImportJobStore,
    claims: ClaimService,
    telemetry: TelemetryClient,
    directory: OnceCell<Arc<dyn PlaceDirectory>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub db_path: String,
    pub telemetry_buffer_path: String,
    pub telemetry_queue_depth: usize,
    pub catalog_places: i64,
    pub config: PublicAppConfig,
}

impl AppState {
    pub fn initialize<P: AsRef<Path>>(data_dir: P, config: AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        let DatabaseContext { connection, path } =
            bootstrap(data_dir, &config.database_file_name)?;
        let telemetry = TelemetryClient::new(data_dir, &config)?;
        if let Err(err) = telemetry.record(
            "engine_start",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "provider": config.places_provider_name,
            }),
        ) {
            warn!(?err, "failed to queue telemetry bootstrap event");
        }

        let db = Arc::new(Mutex::new(connection));
        let catalog = CatalogStore::new(Arc::clone(&db));
        let claims = ClaimService::new(catalog.clone(), Some(telemetry.clone()));
        Ok(Self {
            db_path: path,
            config,
            jobs: ImportJobStore::new(db),
            catalog,
            claims,
            telemetry,
            directory: OnceCell::new(),
        })
    }

    /// Uses `directory` for every import instead of the configured provider.
    pub fn with_directory(self, directory: Arc<dyn PlaceDirectory>) -> Self {
        let _ = self.directory.set(directory);
        self
    }

    pub fn importer(&self) -> AppResult<Importer> {
        let directory = self
            .directory
            .get_or_try_init(|| directory_from_config(&self.config))?;
        Ok(Importer::new(
            Arc::clone(directory),
            self.catalog.clone(),
            self.jobs.clone(),
            &self.config,
        )
        .with_telemetry(self.telemetry.clone()))
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn jobs(&self) -> &ImportJobStore {
        &self.jobs
    }

    pub fn claims(&self) -> &ClaimService {
        &self.claims
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn health(&self) -> AppResult<EngineHealth> {
        Ok(EngineHealth {
            db_path: self.db_path.to_string_lossy().to_string(),
            telemetry_buffer_path: self.telemetry.buffer_path().to_string_lossy().to_string(),
            telemetry_queue_depth: self.telemetry.queue_depth(),
            catalog_places: self.catalog.count()?,
            config: self.config.public_profile(),
        })
    }

    /// Writes queued telemetry; call before the process exits.
    pub fn shutdown(&self) {
        if let Err(err) = self.telemetry.flush() {
            warn!(?err, "failed to flush telemetry queue");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,place_import=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
