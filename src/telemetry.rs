use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::catalog::OwnershipStatus;
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::jobs::ImportJob;

const BUFFER_FILE: &str = "telemetry-buffer.jsonl";

/// Batched JSONL event log with size-based rotation.
#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    queue: Arc<Mutex<Vec<TelemetryEvent>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

#[derive(Debug, Serialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let buffer_path = data_dir.join(BUFFER_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)?;

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled_by_default)),
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path,
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
            max_file_count: config.telemetry_buffer_max_files.max(1),
        })
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) -> AppResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut queue = self.queue.lock();
        queue.push(TelemetryEvent {
            name: name.into(),
            timestamp: Utc::now(),
            payload,
        });
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn import_finished(&self, job: &ImportJob, inserted: usize) {
        let payload = json!({
            "job_id": job.id,
            "provider": job.provider,
            "status": job.status,
            "dry_run": job.request.dry_run,
            "total_found": job.counts.total_found,
            "new_places": job.counts.new_places,
            "updated_places": job.counts.updated_places,
            "skipped_places": job.counts.skipped_places,
            "errors": job.errors.len(),
            "inserted": inserted,
            "duration_ms": job.duration_ms,
        });
        self.record_quietly("import_run_finished", payload);
    }

    pub fn claim_transition(
        &self,
        place_id: i64,
        from: OwnershipStatus,
        to: OwnershipStatus,
        actor: &str,
    ) {
        let payload = json!({
            "place_id": place_id,
            "from": from,
            "to": to,
            "actor": actor,
        });
        self.record_quietly("claim_transition", payload);
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    // Telemetry never fails the operation it describes.
    fn record_quietly(&self, name: &str, payload: serde_json::Value) {
        if let Err(err) = self.record(name, payload) {
            warn!(?err, event = name, "failed to queue telemetry event");
        }
    }

    fn persist_locked(&self, queue: &mut Vec<TelemetryEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::with_capacity(queue.len());
        let mut incoming = 0_u64;
        for event in queue.iter() {
            let line = serde_json::to_vec(event)?;
            incoming += line.len() as u64 + 1;
            lines.push(line);
        }

        self.rotate_if_needed(incoming)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        for line in &lines {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current = fs::metadata(&self.buffer_path)
            .map(|m| m.len())
            .unwrap_or(0);
        if current == 0 || current + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count > 1 {
            let rotated = self.buffer_dir().join(format!(
                "{}-{}.jsonl",
                self.buffer_stem(),
                Utc::now().format("%Y%m%d%H%M%S%3f")
            ));
            fs::rename(&self.buffer_path, rotated)?;
            self.prune_rotations()?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.buffer_path)?;
        Ok(())
    }

    /// Keeps at most `max_file_count - 1` rotated files, dropping the oldest.
    fn prune_rotations(&self) -> AppResult<()> {
        let prefix = format!("{}-", self.buffer_stem());
        let mut rotations: Vec<PathBuf> = fs::read_dir(self.buffer_dir())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".jsonl"))
            })
            .collect();
        // Timestamped names sort chronologically.
        rotations.sort();
        let allowed = self.max_file_count - 1;
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for path in rotations.into_iter().take(excess) {
                if let Err(err) = fs::remove_file(&path) {
                    warn!(?err, path = %path.display(), "failed to prune telemetry rotation");
                }
            }
        }
        Ok(())
    }

    fn buffer_dir(&self) -> &Path {
        self.buffer_path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn buffer_stem(&self) -> String {
        self.buffer_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "telemetry-buffer".into())
    }
}
