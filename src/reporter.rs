//! Process-wide event reporter on the driver.
//!
//! A lifecycle-managed single writer: [`EventReporter::init`] starts it,
//! [`EventReporter::stop`] flushes and stops it. All reports are serialized
//! through one lock, appended to the attached log writer, and fanned out to
//! live subscribers. Cross-node transport (master host and port in the
//! replay configuration) is a collaborator contract, not implemented here.

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{LinealError, Result};
use crate::event_log::{EventLogWriter, LogEntry};

type Subscriber = Box<dyn Fn(&LogEntry) + Send>;

#[derive(Default)]
struct ReporterState {
    running: bool,
    is_master: bool,
    writer: Option<EventLogWriter>,
    subscribers: Vec<Subscriber>,
    entries_reported: u64,
}

/// Driver-side event reporter.
pub struct EventReporter {
    state: Mutex<ReporterState>,
}

impl EventReporter {
    /// Creates a stopped reporter.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReporterState::default()),
        }
    }

    /// Starts the reporter, optionally attaching a log writer.
    pub fn init(&self, is_master: bool, writer: Option<EventLogWriter>) -> Result<()> {
        let mut state = self.state.lock();
        if state.running {
            return Err(LinealError::Engine(
                "event reporter already running".to_string(),
            ));
        }
        state.running = true;
        state.is_master = is_master;
        state.writer = writer;
        info!(is_master, "event reporter started");
        Ok(())
    }

    /// True between `init` and `stop`.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// True if initialized as the master-side reporter.
    pub fn is_master(&self) -> bool {
        self.state.lock().is_master
    }

    /// Reports one entry: appends it to the log writer (if any) and notifies
    /// subscribers. Reports before `init` are logged and dropped.
    pub fn report(&self, entry: &LogEntry) -> Result<()> {
        let mut state = self.state.lock();
        if !state.running {
            warn!("event reported before init, dropping");
            return Ok(());
        }
        if let Some(writer) = &state.writer {
            writer.append(entry)?;
        }
        for subscriber in &state.subscribers {
            subscriber(entry);
        }
        state.entries_reported += 1;
        Ok(())
    }

    /// Registers a live subscriber invoked for every subsequent report.
    pub fn subscribe(&self, f: impl Fn(&LogEntry) + Send + 'static) {
        self.state.lock().subscribers.push(Box::new(f));
    }

    /// Stops the reporter, flushing the log writer.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.running {
            return Ok(());
        }
        if let Some(writer) = &state.writer {
            writer.sync()?;
        }
        state.running = false;
        state.subscribers.clear();
        info!(entries = state.entries_reported, "event reporter stopped");
        Ok(())
    }

    /// Number of entries reported since creation.
    pub fn entries_reported(&self) -> u64 {
        self.state.lock().entries_reported
    }
}

impl Default for EventReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn exception(task_id: u64) -> LogEntry {
        LogEntry::LocalException {
            task_id,
            message: "test".to_string(),
        }
    }

    #[test]
    fn test_report_before_init_is_dropped() {
        let reporter = EventReporter::new();
        reporter.report(&exception(1)).unwrap();
        assert_eq!(reporter.entries_reported(), 0);
    }

    #[test]
    fn test_double_init_is_rejected() {
        let reporter = EventReporter::new();
        reporter.init(true, None).unwrap();
        assert!(reporter.init(true, None).is_err());
    }

    #[test]
    fn test_subscribers_see_reports() {
        let reporter = EventReporter::new();
        reporter.init(true, None).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_sub = seen.clone();
        reporter.subscribe(move |_| {
            seen_in_sub.fetch_add(1, Ordering::SeqCst);
        });
        reporter.report(&exception(1)).unwrap();
        reporter.report(&exception(2)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(reporter.entries_reported(), 2);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let reporter = EventReporter::new();
        reporter.init(false, None).unwrap();
        reporter.stop().unwrap();
        reporter.stop().unwrap();
        assert!(!reporter.is_running());
    }
}
