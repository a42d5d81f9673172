//! Lightweight timing utilities for optional performance tracing.
//!
//! A [`TimingGuard`] records how long a scoped operation took and logs it under the
//! `emrec::telemetry` target when dropped. Guards can additionally carry an item count
//! (rows decoded, arrays written) so the log line reports throughput. Nothing is logged
//! unless telemetry was switched on through [`configure`] and the level passes the
//! global log filter.

use std::{
    borrow::Cow,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::{Duration, Instant},
};

use log::{Level, LevelFilter, log, log_enabled};

const TARGET: &str = "emrec::telemetry";

static TELEMETRY_ENABLED: AtomicBool = AtomicBool::new(false);
static TELEMETRY_LEVEL: AtomicU8 = AtomicU8::new(0);

/// RAII helper that logs how long an operation took when dropped.
pub struct TimingGuard {
    label: Cow<'static, str>,
    level: Level,
    start: Instant,
    items: Option<usize>,
    active: bool,
}

impl TimingGuard {
    /// Returns `true` when the guard will emit a log entry on drop.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Record how many items the timed operation handled.
    pub fn set_items(&mut self, items: usize) {
        self.items = Some(items);
    }

    /// Returns the elapsed duration since the guard was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Consume the guard and return the elapsed duration without logging.
    pub fn finish(mut self) -> Duration {
        self.active = false;
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let duration = self.start.elapsed();
        match self.items {
            Some(items) if duration.as_secs_f64() > 0.0 => log!(
                target: TARGET,
                self.level,
                "{} completed in {:.2?} ({} items, {:.1}/s)",
                self.label,
                duration,
                items,
                items as f64 / duration.as_secs_f64()
            ),
            _ => log!(
                target: TARGET,
                self.level,
                "{} completed in {:.2?}",
                self.label,
                duration
            ),
        }
    }
}

/// Create a timing guard that logs at `level` when telemetry allows it.
pub fn timing_guard(label: impl Into<Cow<'static, str>>, level: Level) -> TimingGuard {
    timing_guard_if(label, level, true)
}

/// Create a timing guard that also respects an explicit boolean flag.
pub fn timing_guard_if(
    label: impl Into<Cow<'static, str>>,
    level: Level,
    enabled: bool,
) -> TimingGuard {
    let active = enabled && telemetry_allows(level) && log_enabled!(target: TARGET, level);
    TimingGuard {
        label: label.into(),
        level,
        start: Instant::now(),
        items: None,
        active,
    }
}

/// Configure the global telemetry state.
pub fn configure(enabled: bool, level: LevelFilter) {
    TELEMETRY_ENABLED.store(enabled, Ordering::Relaxed);
    TELEMETRY_LEVEL.store(level as usize as u8, Ordering::Relaxed);
}

/// Returns whether telemetry logging is currently enabled.
pub fn telemetry_enabled() -> bool {
    TELEMETRY_ENABLED.load(Ordering::Relaxed)
}

/// Returns the maximum telemetry logging level.
pub fn telemetry_level() -> LevelFilter {
    LevelFilter::iter()
        .find(|filter| *filter as usize as u8 == TELEMETRY_LEVEL.load(Ordering::Relaxed))
        .unwrap_or(LevelFilter::Off)
}

/// Returns `true` when telemetry is enabled and `level` is within the configured threshold.
pub fn telemetry_allows(level: Level) -> bool {
    telemetry_enabled() && level <= telemetry_level()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_guard_is_inactive() {
        let mut guard = timing_guard_if("emrec::test", Level::Info, false);
        guard.set_items(10);
        assert!(!guard.is_active());
        let _ = guard.finish();
    }

    #[test]
    fn level_threshold_is_respected() {
        configure(true, LevelFilter::Info);
        assert_eq!(telemetry_level(), LevelFilter::Info);
        assert!(telemetry_allows(Level::Warn));
        assert!(!telemetry_allows(Level::Trace));

        configure(false, LevelFilter::Trace);
        assert!(!telemetry_allows(Level::Error));
    }
}
