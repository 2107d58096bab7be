//! Rate-limited progress reporting.
//!
//! Downloads, decompression and extraction all produce byte-level progress far
//! faster than any UI can render it. Producers feed a [`ThrottledProgress`], which
//! forwards events to a caller-supplied [`ProgressSink`] at most once per
//! [`PROGRESS_INTERVAL`](crate::constants::PROGRESS_INTERVAL) while always
//! delivering the first (0%) and the final (100%) event.
//!
//! The sink is called on whatever task performs the I/O. Embedders that own a
//! single-threaded UI context are expected to marshal the event themselves,
//! for example by sending it over a channel.
//!
//! # Examples
//!
//! ```rust
//! use app_updater::upgrade::progress::{ProgressEvent, ThrottledProgress};
//! use std::sync::Mutex;
//!
//! let seen = Mutex::new(Vec::new());
//! let sink = |event: ProgressEvent| seen.lock().unwrap().push(event);
//!
//! let mut progress = ThrottledProgress::new(&sink);
//! progress.start(Some(2048));
//! progress.update(1024, Some(2048));
//! progress.finish(2048, Some(2048));
//!
//! let seen = seen.lock().unwrap();
//! assert_eq!(seen.first().unwrap().percent, Some(0.0));
//! assert_eq!(seen.last().unwrap().percent, Some(100.0));
//! ```

use std::time::{Duration, Instant};

use crate::constants::PROGRESS_INTERVAL;

/// A single progress observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// Bytes processed so far.
    pub bytes_done: u64,
    /// Total bytes, when the producer knows it.
    pub bytes_total: Option<u64>,
    /// Completion percentage in `0.0..=100.0`, when the total is known.
    pub percent: Option<f32>,
}

impl ProgressEvent {
    /// Builds an event and derives the percentage from `bytes_total`.
    #[must_use]
    pub fn new(bytes_done: u64, bytes_total: Option<u64>) -> Self {
        let percent = bytes_total.map(|total| {
            if total == 0 {
                100.0
            } else {
                ((bytes_done as f64 / total as f64) * 100.0).min(100.0) as f32
            }
        });

        Self {
            bytes_done,
            bytes_total,
            percent,
        }
    }
}

/// Receiver of progress events.
///
/// Implemented for any `Fn(ProgressEvent) + Send + Sync` closure, so most callers
/// never name the trait.
pub trait ProgressSink: Send + Sync {
    /// Called with each event that passes the rate limiter.
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event);
    }
}

/// A sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _event: ProgressEvent) {}
}

/// Time-bucket gate admitting at most one event per interval.
#[derive(Debug, Clone)]
pub struct ProgressGate {
    interval: Duration,
    last_open: Option<Instant>,
}

impl ProgressGate {
    /// Creates a gate with the given minimum interval between events.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_open: None,
        }
    }

    /// Returns `true` and starts a new bucket if `now` is outside the current one.
    pub fn try_pass(&mut self, now: Instant) -> bool {
        match self.last_open {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_open = Some(now);
                true
            }
        }
    }

    /// Starts a new bucket unconditionally.
    pub fn force(&mut self, now: Instant) {
        self.last_open = Some(now);
    }
}

impl Default for ProgressGate {
    fn default() -> Self {
        Self::new(PROGRESS_INTERVAL)
    }
}

/// Throttled adapter in front of a [`ProgressSink`].
///
/// Guarantees for a single operation:
/// - the event emitted by [`start`](Self::start) is always delivered
/// - intermediate events are delivered at most once per gate interval
/// - `bytes_done` never decreases across delivered events
/// - the event emitted by [`finish`](Self::finish) is always delivered and
///   reports 100%
pub struct ThrottledProgress<'a> {
    sink: &'a dyn ProgressSink,
    gate: ProgressGate,
    last_done: u64,
    finished: bool,
}

impl<'a> ThrottledProgress<'a> {
    /// Wraps `sink` with the default ~60 Hz gate.
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self::with_gate(sink, ProgressGate::default())
    }

    /// Wraps `sink` with a custom gate.
    pub fn with_gate(sink: &'a dyn ProgressSink, gate: ProgressGate) -> Self {
        Self {
            sink,
            gate,
            last_done: 0,
            finished: false,
        }
    }

    /// Emits the mandatory 0% event.
    pub fn start(&mut self, total: Option<u64>) {
        self.gate.force(Instant::now());
        self.last_done = 0;
        self.finished = false;
        self.sink.on_progress(ProgressEvent::new(0, total));
    }

    /// Offers an intermediate event; it is dropped if the gate is closed.
    pub fn update(&mut self, bytes_done: u64, total: Option<u64>) {
        if self.finished || bytes_done < self.last_done {
            return;
        }

        if self.gate.try_pass(Instant::now()) {
            self.last_done = bytes_done;
            let mut event = ProgressEvent::new(bytes_done, total);
            // 100% is reserved for the final event.
            if let Some(percent) = event.percent.as_mut() {
                *percent = percent.min(99.99);
            }
            self.sink.on_progress(event);
        }
    }

    /// Emits the mandatory final event.
    ///
    /// Only call this once the operation has completed. The event reports 100%
    /// with `bytes_done == bytes_total`; with an unknown total the processed
    /// byte count becomes the total.
    pub fn finish(&mut self, bytes_done: u64, total: Option<u64>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let done = bytes_done.max(self.last_done);
        let total = total.unwrap_or(done).max(done);
        self.last_done = total;
        self.gate.force(Instant::now());
        self.sink.on_progress(ProgressEvent {
            bytes_done: total,
            bytes_total: Some(total),
            percent: Some(100.0),
        });
    }
}
