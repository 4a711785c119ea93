//! Progress events and cancellation.
//!
//! Long-running jobs report through a [`ProgressSink`]. The sink is the
//! only side channel to whoever drives the job; a `Sender<ProgressEvent>`
//! is a sink, so callers usually just hand over a channel and drain the
//! receiver on their own thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Status of a migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Applied,
    Verified,
    Failed,
    RolledBack,
}

/// Ordered events emitted by migration, backup and restore jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Nothing to migrate: `current >= target`.
    NoMigrationNeeded {
        current: Option<String>,
        target: String,
    },
    MigrationStarted {
        from: Option<String>,
        to: String,
        steps: usize,
    },
    BackupCreated {
        path: PathBuf,
    },
    Step {
        step_id: String,
        status: StepStatus,
    },
    VersionCommitted {
        version: String,
    },
    /// Corrupt store moved aside at startup.
    Quarantined {
        path: PathBuf,
    },
    TableStarted {
        table: String,
        rows: usize,
    },
    TableProgress {
        table: String,
        done: usize,
        total: usize,
    },
    TableFinished {
        table: String,
    },
}

/// Receiver of progress events.
///
/// Implementations must not block for long: the worker calls `emit`
/// inline between units of work.
pub trait ProgressSink: Send {
    fn emit(&self, event: ProgressEvent);
}

impl ProgressSink for Sender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver means nobody is watching; the job carries on.
        let _ = self.send(event);
    }
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Shared cancellation flag.
///
/// Jobs only look at it between units of work (before a step or table
/// starts applying), never while a transaction is mutating rows.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation at the next checkpoint.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled { phase }` when the flag is set.
    pub fn checkpoint(&self, phase: &str) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::Error::Cancelled {
                phase: phase.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Emits `TableProgress` at most once per interval, and always at the end.
pub(crate) struct TableTicker<'a> {
    sink: &'a dyn ProgressSink,
    table: String,
    total: usize,
    interval: Duration,
    last: Instant,
}

impl<'a> TableTicker<'a> {
    pub(crate) fn start(
        sink: &'a dyn ProgressSink,
        table: &str,
        total: usize,
        interval: Duration,
    ) -> Self {
        sink.emit(ProgressEvent::TableStarted {
            table: table.to_string(),
            rows: total,
        });
        Self {
            sink,
            table: table.to_string(),
            total,
            interval,
            last: Instant::now(),
        }
    }

    pub(crate) fn tick(&mut self, done: usize) {
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            self.sink.emit(ProgressEvent::TableProgress {
                table: self.table.clone(),
                done,
                total: self.total,
            });
        }
    }

    pub(crate) fn finish(self) {
        self.sink.emit(ProgressEvent::TableProgress {
            table: self.table.clone(),
            done: self.total,
            total: self.total,
        });
        self.sink.emit(ProgressEvent::TableFinished { table: self.table });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (tx, rx) = mpsc::channel();
        tx.emit(ProgressEvent::Step {
            step_id: "001".to_string(),
            status: StepStatus::Started,
        });
        tx.emit(ProgressEvent::Step {
            step_id: "001".to_string(),
            status: StepStatus::Applied,
        });

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            ProgressEvent::Step {
                status: StepStatus::Applied,
                ..
            }
        ));
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        tx.emit(ProgressEvent::TableFinished {
            table: "decks".to_string(),
        });
    }

    #[test]
    fn test_cancel_token_checkpoint() {
        let token = CancelToken::new();
        assert!(token.checkpoint("step 001").is_ok());

        token.clone().cancel();
        let err = token.checkpoint("step 001").unwrap_err();
        assert!(matches!(err, crate::Error::Cancelled { ref phase } if phase == "step 001"));
    }

    #[test]
    fn test_ticker_always_reports_completion() {
        let (tx, rx) = mpsc::channel();
        let mut ticker = TableTicker::start(&tx, "decks", 3, Duration::from_secs(3600));
        ticker.tick(1);
        ticker.tick(2);
        ticker.finish();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                ProgressEvent::TableStarted {
                    table: "decks".to_string(),
                    rows: 3
                },
                ProgressEvent::TableProgress {
                    table: "decks".to_string(),
                    done: 3,
                    total: 3
                },
                ProgressEvent::TableFinished {
                    table: "decks".to_string()
                },
            ]
        );
    }
}
