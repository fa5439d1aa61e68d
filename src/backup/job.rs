//! Execution and cancellation contract shared by backup and restore.
//!
//! A job runs on its own OS thread and talks to its owner only through a
//! bounded channel of [`JobEvent`]s and a [`CancelFlag`]. Exactly one
//! [`JobEvent::Finished`] is sent, always last.

use super::progress::Reporter;
use super::JobKind;
use crate::utils::Clock;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info_span};
use uuid::Uuid;

/// Cooperative cancellation: written by the owner, polled by the worker
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Idle, JobState::Running)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
        )
    }
}

/// How an enumeration or archive pass ended. Cancellation carries the
/// partial result and is never an error.
#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled(T),
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Outcome::Completed(v) | Outcome::Cancelled(v) => v,
        }
    }
}

/// Terminal result of a job. Built once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResult {
    pub state: JobState,
    pub success: bool,
    pub message: String,
    pub detail: Option<String>,
}

impl JobResult {
    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Completed,
            success: true,
            message: message.into(),
            detail: None,
        }
    }

    pub fn failed(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            success: false,
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn cancelled(kind: JobKind) -> Self {
        Self {
            state: JobState::Cancelled,
            success: false,
            message: format!("{} cancelled", kind.label()),
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress { percent: u8 },
    Log { line: String },
    Finished(JobResult),
}

/// What a running job body can see
pub struct JobContext {
    pub cancel: CancelFlag,
    pub reporter: Reporter,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Context that is not attached to a worker thread; events pile up in
    /// the returned receiver
    pub fn detached(clock: Arc<dyn Clock>) -> (Self, Receiver<JobEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ctx = Self {
            cancel: CancelFlag::new(),
            reporter: Reporter::new(tx, clock),
        };
        (ctx, rx)
    }
}

/// A job that has not started yet. Starting consumes it, so a job object
/// can only ever be started once.
pub struct Job<F> {
    id: Uuid,
    kind: JobKind,
    target: PathBuf,
    clock: Arc<dyn Clock>,
    capacity: usize,
    body: F,
}

impl<F> Job<F>
where
    F: FnOnce(&JobContext) -> anyhow::Result<Outcome<String>> + Send + 'static,
{
    /// `target` is the artifact the job produces: archive or restore directory
    pub fn new(kind: JobKind, target: PathBuf, clock: Arc<dyn Clock>, capacity: usize, body: F) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target,
            clock,
            capacity: capacity.max(1),
            body,
        }
    }

    /// Idle -> Running: spawn the worker thread
    pub fn start(self) -> std::io::Result<JobHandle> {
        let (tx, rx) = bounded(self.capacity);
        let cancel = CancelFlag::new();
        let state = Arc::new(Mutex::new(JobState::Idle));
        let result = Arc::new(Mutex::new(None));

        let ctx = JobContext {
            cancel: cancel.clone(),
            reporter: Reporter::new(tx, self.clock),
        };

        let id = self.id;
        let kind = self.kind;
        let body = self.body;
        let worker_state = state.clone();
        let worker_result = result.clone();

        transition(&state, JobState::Running);
        let thread = std::thread::Builder::new()
            .name(format!("{}-{}", kind, &id.simple().to_string()[..8]))
            .spawn(move || {
                let span = info_span!("job", kind = %kind, id = %id);
                let _guard = span.enter();
                let started = Instant::now();

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&ctx)));
                let job_result = settle(kind, &ctx, outcome);

                debug!(
                    "{} job finished as {:?} after {}",
                    kind,
                    job_result.state,
                    humantime::format_duration(started.elapsed())
                );
                transition(&worker_state, job_result.state);
                *worker_result.lock() = Some(job_result.clone());
                ctx.reporter.finish(JobEvent::Finished(job_result));
            });

        let thread = match thread {
            Ok(handle) => handle,
            Err(e) => {
                *state.lock() = JobState::Failed;
                return Err(e);
            }
        };

        Ok(JobHandle {
            id,
            kind,
            target: self.target,
            cancel,
            events: rx,
            state,
            result,
            thread: Some(thread),
        })
    }
}

/// Turn the body's return (or panic) into the single terminal result,
/// logging it on the way out
fn settle(
    kind: JobKind,
    ctx: &JobContext,
    outcome: std::thread::Result<anyhow::Result<Outcome<String>>>,
) -> JobResult {
    let reporter = &ctx.reporter;
    match outcome {
        Ok(Ok(Outcome::Completed(message))) => JobResult::completed(message),
        Ok(Ok(Outcome::Cancelled(_))) => {
            let result = JobResult::cancelled(kind);
            reporter.log(&result.message);
            result
        }
        Ok(Err(err)) => {
            let detail = format!("{:?}", err);
            reporter.failure(format!("Critical error: {}", err));
            reporter.trace(detail.clone());
            JobResult::failed(format!("{} failed: {}", kind.label(), err), detail)
        }
        Err(payload) => {
            let detail = panic_message(payload.as_ref());
            reporter.failure(format!("Critical error: {}", detail));
            JobResult::failed(format!("{} failed: {}", kind.label(), detail), detail)
        }
    }
}

fn transition(state: &Mutex<JobState>, next: JobState) {
    let mut current = state.lock();
    debug_assert!(
        current.can_transition_to(next),
        "invalid job transition {:?} -> {:?}",
        *current,
        next
    );
    *current = next;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Owner's side of a running job
pub struct JobHandle {
    id: Uuid,
    kind: JobKind,
    target: PathBuf,
    cancel: CancelFlag,
    events: Receiver<JobEvent>,
    state: Arc<Mutex<JobState>>,
    result: Arc<Mutex<Option<JobResult>>>,
    thread: Option<JoinHandle<()>>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Ask the worker to stop at its next checkpoint
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Events in production order; ends after `Finished`
    pub fn events(&self) -> &Receiver<JobEvent> {
        &self.events
    }

    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    pub fn result(&self) -> Option<JobResult> {
        self.result.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Drain every event and return the terminal result
    pub fn wait(mut self) -> JobResult {
        let (_, result) = self.collect();
        result
    }

    /// Drain every event; returns all non-terminal events plus the result
    pub fn collect(&mut self) -> (Vec<JobEvent>, JobResult) {
        let mut events = Vec::new();
        let mut finished = None;
        for event in self.events.iter() {
            match event {
                JobEvent::Finished(result) => {
                    finished = Some(result);
                    break;
                }
                other => events.push(other),
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let kind = self.kind;
        let result = finished.or_else(|| self.result()).unwrap_or_else(|| {
            JobResult::failed(format!("{} worker vanished", kind.label()), "no terminal event")
        });
        (events, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::SystemClock;
    use std::time::Duration;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }

    #[test]
    fn test_state_machine_transitions() {
        assert!(JobState::Idle.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Idle.can_transition_to(JobState::Completed));
        assert!(!JobState::Completed.can_transition_to(JobState::Running));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Failed));
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_completed_job_emits_single_result_last() {
        let job = Job::new(JobKind::Backup, PathBuf::new(), clock(), 4, |ctx: &JobContext| {
            ctx.reporter.log("working");
            ctx.reporter.progress(100);
            Ok(Outcome::Completed("done".to_string()))
        });
        let mut handle = job.start().unwrap();
        let (events, result) = handle.collect();

        assert_eq!(result, JobResult::completed("done"));
        assert_eq!(events.len(), 2);
        assert_eq!(handle.state(), JobState::Completed);
        assert!(handle.is_finished());
    }

    #[test]
    fn test_cancelled_job_is_not_a_failure() {
        let job = Job::new(JobKind::Restore, PathBuf::new(), clock(), 4, |ctx: &JobContext| {
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(Outcome::Cancelled(String::new()))
        });
        let handle = job.start().unwrap();
        handle.cancel();
        let result = handle.wait();

        assert_eq!(result.state, JobState::Cancelled);
        assert!(!result.success);
        assert_eq!(result.message, "Restore cancelled");
    }

    #[test]
    fn test_error_is_reported_with_detail() {
        let job = Job::new(JobKind::Backup, PathBuf::new(), clock(), 4, |_: &JobContext| {
            Err(anyhow::anyhow!("disk on fire"))
        });
        let mut handle = job.start().unwrap();
        let (events, result) = handle.collect();

        assert_eq!(result.state, JobState::Failed);
        assert_eq!(result.message, "Backup failed: disk on fire");
        assert!(result.detail.is_some());
        assert!(events.iter().any(
            |e| matches!(e, JobEvent::Log { line } if line.contains("Critical error: disk on fire"))
        ));
    }

    #[test]
    fn test_panic_becomes_failed_result() {
        let job = Job::new(JobKind::Backup, PathBuf::new(), clock(), 4, |_: &JobContext| -> anyhow::Result<Outcome<String>> {
            panic!("boom")
        });
        let result = job.start().unwrap().wait();

        assert_eq!(result.state, JobState::Failed);
        assert_eq!(result.detail.as_deref(), Some("boom"));
    }

    #[test]
    fn test_event_serialization_shape() {
        let json = serde_json::to_value(JobEvent::Progress { percent: 42 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "progress", "percent": 42}));

        let json = serde_json::to_value(JobEvent::Finished(JobResult::cancelled(JobKind::Backup))).unwrap();
        assert_eq!(json["type"], "finished");
        assert_eq!(json["state"], "cancelled");
    }
}
