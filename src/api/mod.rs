use axum::{
    extract::{Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::backup::engine::BackupSource;
use crate::backup::manager::JobStatus;
use crate::backup::{BackupManager, JobKind, JobState};

pub fn routes() -> Router<BackupManager> {
    Router::new()
        .route("/status", get(get_status))
        .route("/backup", post(start_backup))
        .route("/restore", post(start_restore))
        .route("/cancel", post(cancel_job))
        .route("/logs", get(get_logs))
        .route("/backups", get(list_backups))
        .route("/backups/members", get(list_members))
}

#[derive(Serialize)]
struct StatusResponse {
    backup: JobView,
    restore: JobView,
    #[serde(rename = "backupDir")]
    backup_dir: PathBuf,
    #[serde(rename = "restoreDir")]
    restore_dir: PathBuf,
}

#[derive(Serialize)]
struct JobView {
    #[serde(flatten)]
    status: JobStatus,
    running: bool,
    elapsed: Option<String>,
}

impl From<JobStatus> for JobView {
    fn from(status: JobStatus) -> Self {
        let running = status.state == JobState::Running;
        // Only meaningful while the job is still going
        let elapsed = status.started_at.filter(|_| running).map(|started| {
            let secs = (Local::now() - started).num_seconds().max(0) as u64;
            humantime::format_duration(Duration::from_secs(secs)).to_string()
        });
        Self {
            status,
            running,
            elapsed,
        }
    }
}

async fn get_status(State(manager): State<BackupManager>) -> Json<StatusResponse> {
    let status = manager.get_status();
    Json(StatusResponse {
        backup: status.backup.into(),
        restore: status.restore.into(),
        backup_dir: status.backup_dir,
        restore_dir: status.restore_dir,
    })
}

#[derive(Deserialize)]
struct BackupRequest {
    #[serde(default = "default_source")]
    source: BackupSource,
}

fn default_source() -> BackupSource {
    BackupSource::Home
}

async fn start_backup(
    State(manager): State<BackupManager>,
    Json(req): Json<BackupRequest>,
) -> Json<serde_json::Value> {
    match manager.start_backup(&req.source) {
        Ok(id) => Json(serde_json::json!({"status": "started", "id": id})),
        Err(e) => Json(serde_json::json!({"error": e.to_string()})),
    }
}

#[derive(Deserialize)]
struct RestoreRequest {
    archive: PathBuf,
}

async fn start_restore(
    State(manager): State<BackupManager>,
    Json(req): Json<RestoreRequest>,
) -> Json<serde_json::Value> {
    match manager.start_restore(&req.archive) {
        Ok(id) => Json(serde_json::json!({"status": "started", "id": id})),
        Err(e) => Json(serde_json::json!({"error": e.to_string()})),
    }
}

#[derive(Deserialize)]
struct CancelRequest {
    kind: JobKind,
}

async fn cancel_job(
    State(manager): State<BackupManager>,
    Json(req): Json<CancelRequest>,
) -> Json<serde_json::Value> {
    match manager.cancel(req.kind) {
        Ok(()) => Json(serde_json::json!({"status": "cancelling"})),
        Err(e) => Json(serde_json::json!({"error": e.to_string()})),
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn get_logs(
    State(manager): State<BackupManager>,
    Query(query): Query<LogsQuery>,
) -> Json<serde_json::Value> {
    let logs = manager.get_logs(Some(query.limit.unwrap_or(100)));
    Json(serde_json::json!({"logs": logs}))
}

async fn list_backups(State(manager): State<BackupManager>) -> Json<serde_json::Value> {
    let result = tokio::task::spawn_blocking(move || manager.list_backups()).await;
    match result {
        Ok(Ok(backups)) => {
            let backups: Vec<_> = backups
                .into_iter()
                .map(|b| {
                    serde_json::json!({
                        "name": b.name,
                        "path": b.path,
                        "size": b.size,
                        "sizeHuman": format_bytes(b.size),
                        "modified": b.modified.map(|m| m.to_rfc3339()),
                    })
                })
                .collect();
            Json(serde_json::json!({"backups": backups}))
        }
        Ok(Err(e)) => Json(serde_json::json!({"error": e.to_string()})),
        Err(e) => {
            warn!("Backup listing task failed: {}", e);
            Json(serde_json::json!({"error": "Backup listing failed"}))
        }
    }
}

#[derive(Deserialize)]
struct MembersQuery {
    archive: PathBuf,
}

async fn list_members(
    State(manager): State<BackupManager>,
    Query(query): Query<MembersQuery>,
) -> Json<serde_json::Value> {
    let result = tokio::task::spawn_blocking(move || manager.list_members(&query.archive)).await;
    match result {
        Ok(Ok(members)) => Json(serde_json::json!({"count": members.len(), "members": members})),
        Ok(Err(e)) => Json(serde_json::json!({"error": e.to_string()})),
        Err(e) => {
            warn!("Member listing task failed: {}", e);
            Json(serde_json::json!({"error": "Member listing failed"}))
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1_048_576 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1_073_741_824 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    }
}
