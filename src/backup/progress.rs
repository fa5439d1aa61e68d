//! Progress cadence and operator log lines.
//!
//! [`ProgressState`] is a pure counter that decides when a percentage is
//! worth emitting. [`Reporter`] turns those decisions, plus log events, into
//! [`JobEvent`]s on the job's channel.

use super::job::JobEvent;
use crate::utils::clock::{log_stamp, Clock};
use crossbeam_channel::Sender;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A percentage is emitted every this many processed items
pub const PROGRESS_EVERY: usize = 50;

/// `floor(processed * 100 / total)`, clamped to 100
pub fn percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (processed as u128 * 100 / total as u128).min(100);
    pct as u8
}

/// Emission rule: every [`PROGRESS_EVERY`] items and on the last one
pub fn cadence_percent(processed: usize, total: usize) -> Option<u8> {
    if processed == 0 || total == 0 {
        return None;
    }
    if processed % PROGRESS_EVERY == 0 || processed == total {
        Some(percent(processed, total))
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ProgressState {
    processed: usize,
    total: usize,
    last_emitted: Option<u8>,
}

impl ProgressState {
    pub fn new(total: usize) -> Self {
        Self {
            processed: 0,
            total,
            last_emitted: None,
        }
    }

    /// Count one item; returns a percentage when the cadence says so.
    /// Never returns a value lower than one already returned.
    pub fn advance(&mut self) -> Option<u8> {
        self.processed = (self.processed + 1).min(self.total);
        let pct = cadence_percent(self.processed, self.total)?;
        self.emit(pct)
    }

    /// Final 100, unless 100 was already emitted
    pub fn complete(&mut self) -> Option<u8> {
        self.processed = self.total;
        self.emit(100)
    }

    fn emit(&mut self, pct: u8) -> Option<u8> {
        match self.last_emitted {
            Some(last) if pct < last => None,
            Some(100) => None,
            _ => {
                self.last_emitted = Some(pct);
                Some(pct)
            }
        }
    }
}

/// `[YYYY-MM-DD HH:MM:SS] <event>`
pub fn log_line(clock: &dyn Clock, event: &str) -> String {
    format!("[{}] {}", log_stamp(clock.now()), event)
}

/// Delivers one job's events in production order.
///
/// Sends block while the channel is full. A dropped receiver is not an
/// error: the job keeps running and its events go nowhere.
#[derive(Clone)]
pub struct Reporter {
    tx: Sender<JobEvent>,
    clock: Arc<dyn Clock>,
}

impl Reporter {
    pub fn new(tx: Sender<JobEvent>, clock: Arc<dyn Clock>) -> Self {
        Self { tx, clock }
    }

    pub fn progress(&self, percent: u8) {
        let _ = self.tx.send(JobEvent::Progress { percent });
    }

    pub fn progress_from(&self, state: &mut ProgressState) {
        if let Some(pct) = state.advance() {
            self.progress(pct);
        }
    }

    pub fn complete(&self, state: &mut ProgressState) {
        if let Some(pct) = state.complete() {
            self.progress(pct);
        }
    }

    pub fn log(&self, event: impl AsRef<str>) {
        let event = event.as_ref();
        info!("{}", event);
        self.send_line(event);
    }

    pub fn skip(&self, item: impl std::fmt::Display, reason: &super::SkipReason) {
        let event = format!("Skipped ({}): {}", reason, item);
        warn!("{}", event);
        self.send_line(&event);
    }

    pub fn warning(&self, event: impl AsRef<str>) {
        let event = event.as_ref();
        warn!("{}", event);
        self.send_line(event);
    }

    pub fn failure(&self, event: impl AsRef<str>) {
        let event = event.as_ref();
        error!("{}", event);
        self.send_line(event);
    }

    /// Unstamped multi-line diagnostic, sent as-is after a failure line
    pub fn trace(&self, detail: impl Into<String>) {
        let _ = self.tx.send(JobEvent::Log { line: detail.into() });
    }

    pub(crate) fn finish(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    fn send_line(&self, event: &str) {
        let line = log_line(self.clock.as_ref(), event);
        let _ = self.tx.send(JobEvent::Log { line });
    }
}
