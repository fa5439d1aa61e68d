use super::engine::{BackupEntry, BackupSource, Engine};
use super::error::EngineError;
use super::job::{CancelFlag, JobEvent, JobHandle, JobResult, JobState};
use super::reader::MemberInfo;
use super::JobKind;
use crate::utils::config::Config;
use crate::utils::log_buffer::{LogBuffer, LogEntry};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("A {0} is already running")]
    AlreadyRunning(JobKind),

    #[error("No {0} is running")]
    NotRunning(JobKind),

    #[error("Could not start {kind} job: {source}")]
    Spawn {
        kind: JobKind,
        #[source]
        source: io::Error,
    },
}

/// A job event tagged with the job it came from
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub job_id: Uuid,
    pub kind: JobKind,
    #[serde(flatten)]
    pub event: JobEvent,
}

/// Snapshot of one job slot
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: Option<Uuid>,
    pub state: JobState,
    pub progress: u8,
    pub target: Option<PathBuf>,
    pub started_at: Option<DateTime<Local>>,
    pub result: Option<JobResult>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            id: None,
            state: JobState::Idle,
            progress: 0,
            target: None,
            started_at: None,
            result: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub backup: JobStatus,
    pub restore: JobStatus,
    pub backup_dir: PathBuf,
    pub restore_dir: PathBuf,
}

#[derive(Default)]
struct Slot {
    status: JobStatus,
    cancel: Option<CancelFlag>,
}

#[derive(Default)]
struct Slots {
    backup: Slot,
    restore: Slot,
}

impl Slots {
    fn get_mut(&mut self, kind: JobKind) -> &mut Slot {
        match kind {
            JobKind::Backup => &mut self.backup,
            JobKind::Restore => &mut self.restore,
        }
    }
}

/// Owns at most one backup and one restore at a time and fans their
/// events out to any number of subscribers
#[derive(Clone)]
pub struct BackupManager {
    config: Arc<Config>,
    engine: Engine,
    slots: Arc<Mutex<Slots>>,
    event_tx: broadcast::Sender<Event>,
    log_buffer: LogBuffer,
}

impl BackupManager {
    pub fn new(config: Config) -> Self {
        let engine = Engine::new(&config);
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: Config, engine: Engine) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(16));
        let log_buffer = LogBuffer::new(config.log_entries);

        Self {
            config: Arc::new(config),
            engine,
            slots: Arc::new(Mutex::new(Slots::default())),
            event_tx,
            log_buffer,
        }
    }

    pub fn start_backup(&self, source: &BackupSource) -> Result<Uuid, ManagerError> {
        self.start(JobKind::Backup, |engine| engine.start_backup(source))
    }

    pub fn start_restore(&self, archive: &Path) -> Result<Uuid, ManagerError> {
        self.start(JobKind::Restore, |engine| engine.start_restore(archive, None))
    }

    fn start<F>(&self, kind: JobKind, launch: F) -> Result<Uuid, ManagerError>
    where
        F: FnOnce(&Engine) -> io::Result<JobHandle>,
    {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(kind);
        if slot.status.state == JobState::Running {
            return Err(ManagerError::AlreadyRunning(kind));
        }

        let handle = launch(&self.engine).map_err(|source| ManagerError::Spawn { kind, source })?;
        let id = handle.id();
        let cancel = handle.cancel_flag();
        slot.status = JobStatus {
            id: Some(id),
            state: JobState::Running,
            progress: 0,
            target: Some(handle.target().to_path_buf()),
            started_at: Some(Local::now()),
            result: None,
        };
        slot.cancel = Some(cancel.clone());
        drop(slots);

        info!("Started {} job {}", kind, id);

        let manager = self.clone();
        let forwarder = std::thread::Builder::new()
            .name(format!("{}-events", kind))
            .spawn(move || manager.forward(handle));

        if let Err(source) = forwarder {
            cancel.cancel();
            self.settle_slot(
                kind,
                id,
                JobResult::failed(format!("{} failed: event forwarding unavailable", kind.label()), source.to_string()),
            );
            return Err(ManagerError::Spawn { kind, source });
        }

        Ok(id)
    }

    /// Drain one job's events into the slot, the log tail and the broadcast
    fn forward(&self, handle: JobHandle) {
        let id = handle.id();
        let kind = handle.kind();

        for event in handle.events().iter() {
            let finished = match &event {
                JobEvent::Progress { percent } => {
                    self.update_slot(kind, id, |s| s.progress = *percent);
                    false
                }
                JobEvent::Log { line } => {
                    self.log_buffer.add_log(kind, line.clone());
                    false
                }
                JobEvent::Finished(result) => {
                    self.settle_slot(kind, id, result.clone());
                    true
                }
            };
            self.broadcast(id, kind, event);
            if finished {
                return;
            }
        }

        // Channel closed without a terminal event
        let result = handle.wait();
        warn!("{} job {} ended without a result event", kind, id);
        self.settle_slot(kind, id, result.clone());
        self.broadcast(id, kind, JobEvent::Finished(result));
    }

    fn update_slot(&self, kind: JobKind, id: Uuid, update: impl FnOnce(&mut JobStatus)) {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(kind);
        if slot.status.id == Some(id) {
            update(&mut slot.status);
        }
    }

    fn settle_slot(&self, kind: JobKind, id: Uuid, result: JobResult) {
        info!("{} job {} {:?}: {}", kind, id, result.state, result.message);
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(kind);
        if slot.status.id == Some(id) {
            slot.status.state = result.state;
            slot.status.result = Some(result);
            slot.cancel = None;
        }
    }

    fn broadcast(&self, job_id: Uuid, kind: JobKind, event: JobEvent) {
        // No subscribers is fine
        if self.event_tx.send(Event { job_id, kind, event }).is_err() {
            debug!("No event subscribers");
        }
    }

    pub fn cancel(&self, kind: JobKind) -> Result<(), ManagerError> {
        let slots = self.slots.lock();
        let slot = match kind {
            JobKind::Backup => &slots.backup,
            JobKind::Restore => &slots.restore,
        };
        match (&slot.cancel, slot.status.state) {
            (Some(flag), JobState::Running) => {
                info!("Cancelling {}", kind);
                flag.cancel();
                Ok(())
            }
            _ => Err(ManagerError::NotRunning(kind)),
        }
    }

    pub fn get_status(&self) -> ManagerStatus {
        let slots = self.slots.lock();
        ManagerStatus {
            backup: slots.backup.status.clone(),
            restore: slots.restore.status.clone(),
            backup_dir: self.config.backup_dir.clone(),
            restore_dir: self.config.restore_base_dir.clone(),
        }
    }

    /// Whether either slot still has a job running
    pub fn is_busy(&self) -> bool {
        let slots = self.slots.lock();
        slots.backup.status.state == JobState::Running || slots.restore.status.state == JobState::Running
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        self.log_buffer.get_logs(limit)
    }

    pub fn list_backups(&self) -> io::Result<Vec<BackupEntry>> {
        self.engine.list_backups()
    }

    pub fn list_members(&self, archive: &Path) -> Result<Vec<MemberInfo>, EngineError> {
        self.engine.list_members(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn manager(temp_dir: &TempDir) -> BackupManager {
        let config = Config {
            backup_dir: temp_dir.path().join("backups"),
            restore_base_dir: temp_dir.path().join("restores"),
            home_dir: temp_dir.path().join("home"),
            ..Config::default()
        };
        BackupManager::new(config)
    }

    fn wait_terminal(manager: &BackupManager, kind: JobKind) -> JobStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = manager.get_status();
            let slot = match kind {
                JobKind::Backup => status.backup,
                JobKind::Restore => status.restore,
            };
            if slot.state.is_terminal() || Instant::now() > deadline {
                return slot;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_idle_status_and_nothing_to_cancel() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let status = manager.get_status();
        assert_eq!(status.backup.state, JobState::Idle);
        assert_eq!(status.restore.state, JobState::Idle);
        assert!(!manager.is_busy());
        assert!(matches!(
            manager.cancel(JobKind::Backup),
            Err(ManagerError::NotRunning(JobKind::Backup))
        ));
    }

    #[test]
    fn test_backup_then_restore_through_manager() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let home = temp_dir.path().join("home");
        fs::create_dir_all(&home)?;
        fs::write(home.join("a.txt"), b"hi")?;
        let manager = manager(&temp_dir);

        manager.start_backup(&BackupSource::Home)?;
        let backup = wait_terminal(&manager, JobKind::Backup);
        assert_eq!(backup.state, JobState::Completed);
        assert_eq!(backup.progress, 100);

        let backups = manager.list_backups()?;
        assert_eq!(backups.len(), 1);
        assert!(backups[0].name.starts_with("home_backup_"));

        manager.start_restore(&backups[0].path)?;
        let restore = wait_terminal(&manager, JobKind::Restore);
        assert_eq!(restore.state, JobState::Completed);
        let restored = restore.target.expect("restore target");
        assert_eq!(fs::read_to_string(restored.join("a.txt"))?, "hi");

        assert!(manager
            .get_logs(None)
            .iter()
            .any(|e| e.job == JobKind::Restore && e.line.contains("Members in archive: 1")));
        Ok(())
    }

    #[test]
    fn test_failed_backup_settles_slot() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let manager = manager(&temp_dir);
        let mut events = manager.subscribe_events();

        // home dir was never created
        manager.start_backup(&BackupSource::Home)?;
        let status = wait_terminal(&manager, JobKind::Backup);
        assert_eq!(status.state, JobState::Failed);
        assert!(status.result.is_some_and(|r| !r.success));

        let finished = loop {
            let event = events.blocking_recv()?;
            if let JobEvent::Finished(result) = event.event {
                break result;
            }
        };
        assert_eq!(finished.state, JobState::Failed);
        assert!(finished.message.starts_with("Backup failed"));
        Ok(())
    }

    #[test]
    fn test_second_job_of_same_kind_is_rejected() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let home = temp_dir.path().join("home");
        fs::create_dir_all(&home)?;
        for i in 0..2000 {
            fs::write(home.join(format!("f{:04}.txt", i)), i.to_string())?;
        }
        let config = Config {
            backup_dir: temp_dir.path().join("backups"),
            restore_base_dir: temp_dir.path().join("restores"),
            home_dir: home,
            ..Config::default()
        };
        let engine = Engine::new(&config).with_event_capacity(1);
        let manager = BackupManager::with_engine(config, engine);

        let first = manager.start_backup(&BackupSource::Home)?;
        assert!(matches!(
            manager.start_backup(&BackupSource::Home),
            Err(ManagerError::AlreadyRunning(JobKind::Backup))
        ));
        assert_eq!(manager.get_status().backup.id, Some(first));

        // The other kind has its own slot
        manager.start_restore(&temp_dir.path().join("backups/missing.tar.gz"))?;

        manager.cancel(JobKind::Backup)?;
        assert_eq!(wait_terminal(&manager, JobKind::Backup).state, JobState::Cancelled);
        assert_eq!(wait_terminal(&manager, JobKind::Restore).state, JobState::Failed);
        assert!(!manager.is_busy());
        Ok(())
    }

    #[test]
    fn test_event_json_is_flat() {
        let event = Event {
            job_id: Uuid::nil(),
            kind: JobKind::Backup,
            event: JobEvent::Progress { percent: 7 },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["percent"], 7);
        assert_eq!(json["kind"], "backup");
    }
}
