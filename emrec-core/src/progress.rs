//! Advisory progress reporting and cooperative cancellation for long conversions.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::info;

/// Snapshot handed to a [`ProgressSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate<'a> {
    pub label: &'a str,
    pub processed: usize,
    pub total: usize,
    pub kept: usize,
}

/// Receives progress updates. Implementations must tolerate calls from rayon workers.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: ProgressUpdate<'_>);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressUpdate<'_>) + Send + Sync,
{
    fn report(&self, update: ProgressUpdate<'_>) {
        self(update)
    }
}

/// Logs every `every` processed rows and once at completion.
#[derive(Debug, Clone, Copy)]
pub struct LogProgress {
    every: usize,
}

impl LogProgress {
    pub fn new(every: usize) -> Self {
        Self { every }
    }
}

impl ProgressSink for LogProgress {
    fn report(&self, update: ProgressUpdate<'_>) {
        let finished = update.processed == update.total;
        let on_step = self.every > 0 && update.processed.is_multiple_of(self.every);
        if finished || on_step {
            info!(
                "{}: {}/{} rows ({} kept)",
                update.label, update.processed, update.total, update.kept
            );
        }
    }
}

/// Discards all updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _update: ProgressUpdate<'_>) {}
}

/// Shared flag checked before every row.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
