//! Progress and throughput telemetry.
//!
//! The pipeline never calls an observer directly. Events go through a bounded
//! queue to a dispatcher task that invokes the registered callbacks, and the
//! pipeline only ever uses `try_send`: when the queue is full the event is
//! dropped, so a slow observer cannot hold back compression or sink writes.
//! The latest state is also kept in a [`ProgressSnapshot`] that can be read
//! at any time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::config::ArchiveOptions;

/// Bytes moved over a span of time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Speed {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl Speed {
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Progress of a compress operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressProgress {
    pub entries_done: usize,
    pub entries_total: usize,
    /// Uncompressed bytes read from content streams so far.
    pub bytes_read: u64,
    /// Sum of declared sizes; entries without a declared size count as 0.
    pub bytes_total: u64,
}

/// Latest known state of the current or last operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub files_scanned: usize,
    pub scan_complete: bool,
    pub compress: CompressProgress,
    /// Bytes handed to the sink so far.
    pub bytes_written: u64,
    pub current_file: Option<String>,
    pub average_speed: Option<Speed>,
    pub current_speed: Option<Speed>,
}

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Observer slots, at most one per channel.
#[derive(Clone, Default)]
pub struct Observers {
    scan_progress: Option<Callback<usize>>,
    compress_progress: Option<Callback<CompressProgress>>,
    average_speed: Option<Callback<Speed>>,
    current_speed: Option<Callback<Speed>>,
    current_file: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl Observers {
    pub fn set_scan_progress(&mut self, f: impl Fn(usize) + Send + Sync + 'static) {
        self.scan_progress = Some(Arc::new(f));
    }

    pub fn set_compress_progress(&mut self, f: impl Fn(CompressProgress) + Send + Sync + 'static) {
        self.compress_progress = Some(Arc::new(f));
    }

    pub fn set_average_speed(&mut self, f: impl Fn(Speed) + Send + Sync + 'static) {
        self.average_speed = Some(Arc::new(f));
    }

    pub fn set_current_speed(&mut self, f: impl Fn(Speed) + Send + Sync + 'static) {
        self.current_speed = Some(Arc::new(f));
    }

    pub fn set_current_file(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.current_file = Some(Arc::new(f));
    }

    fn is_empty(&self) -> bool {
        self.scan_progress.is_none()
            && self.compress_progress.is_none()
            && self.average_speed.is_none()
            && self.current_speed.is_none()
            && self.current_file.is_none()
    }

    fn dispatch(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Scanned(files) => {
                if let Some(f) = &self.scan_progress {
                    f(files)
                }
            }
            ProgressEvent::Compressed(progress) => {
                if let Some(f) = &self.compress_progress {
                    f(progress)
                }
            }
            ProgressEvent::AverageSpeed(speed) => {
                if let Some(f) = &self.average_speed {
                    f(speed)
                }
            }
            ProgressEvent::CurrentSpeed(speed) => {
                if let Some(f) = &self.current_speed {
                    f(speed)
                }
            }
            ProgressEvent::CurrentFile(path) => {
                if let Some(f) = &self.current_file {
                    f(&path)
                }
            }
        }
    }
}

#[derive(Debug)]
enum ProgressEvent {
    Scanned(usize),
    Compressed(CompressProgress),
    AverageSpeed(Speed),
    CurrentSpeed(Speed),
    CurrentFile(String),
}

/// Per-operation tracker feeding the snapshot and the observers.
pub(crate) struct ProgressTracker {
    snapshot: Arc<Mutex<ProgressSnapshot>>,
    events: Option<mpsc::Sender<ProgressEvent>>,
    dispatcher: Option<JoinHandle<()>>,
    dropped: u64,
    speed_interval: Duration,
    started: Instant,
    window_start: Instant,
    window_bytes: u64,
}

impl ProgressTracker {
    /// Start tracking an operation. Spawns the dispatcher task when at least
    /// one observer is registered.
    pub fn start(
        observers: &Observers,
        snapshot: Arc<Mutex<ProgressSnapshot>>,
        options: &ArchiveOptions,
    ) -> Self {
        let (events, dispatcher) = if observers.is_empty() {
            (None, None)
        } else {
            let (tx, mut rx) = mpsc::channel(options.progress_queue.max(1));
            let observers = observers.clone();
            let handle = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    observers.dispatch(event);
                }
            });
            (Some(tx), Some(handle))
        };
        let now = Instant::now();
        Self {
            snapshot,
            events,
            dispatcher,
            dropped: 0,
            speed_interval: options.speed_interval,
            started: now,
            window_start: now,
            window_bytes: 0,
        }
    }

    fn update(&self, f: impl FnOnce(&mut ProgressSnapshot)) {
        let mut snapshot = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut snapshot);
    }

    fn emit(&mut self, event: ProgressEvent) {
        let Some(events) = &self.events else {
            return;
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped += 1;
                trace!(?event, "progress queue full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                // Dispatcher died (an observer panicked); stop sending.
                self.events = None;
            }
        }
    }

    pub fn begin_scan(&mut self) {
        self.update(|s| *s = ProgressSnapshot::default());
    }

    pub fn on_scanned(&mut self, files: usize) {
        self.update(|s| s.files_scanned = files);
        self.emit(ProgressEvent::Scanned(files));
    }

    pub fn scan_finished(&mut self, files: usize) {
        self.update(|s| {
            s.files_scanned = files;
            s.scan_complete = true;
        });
    }

    pub fn begin_compress(&mut self, entries_total: usize, bytes_total: u64) {
        let progress = CompressProgress {
            entries_total,
            bytes_total,
            ..CompressProgress::default()
        };
        self.update(|s| {
            s.compress = progress;
            s.bytes_written = 0;
            s.current_file = None;
            s.average_speed = None;
            s.current_speed = None;
        });
        self.started = Instant::now();
        self.window_start = self.started;
        self.window_bytes = 0;
        self.emit(ProgressEvent::Compressed(progress));
    }

    pub fn on_current_file(&mut self, path: &str) {
        self.update(|s| s.current_file = Some(path.to_string()));
        self.emit(ProgressEvent::CurrentFile(path.to_string()));
    }

    pub fn on_bytes_read(&mut self, bytes: u64) {
        let mut progress = CompressProgress::default();
        self.update(|s| {
            s.compress.bytes_read += bytes;
            progress = s.compress;
        });
        self.emit(ProgressEvent::Compressed(progress));
    }

    pub fn on_entry_done(&mut self) {
        let mut progress = CompressProgress::default();
        self.update(|s| {
            s.compress.entries_done += 1;
            progress = s.compress;
        });
        self.emit(ProgressEvent::Compressed(progress));
    }

    /// Record the running total of bytes handed to the sink and report
    /// speeds once per interval.
    pub fn on_bytes_written(&mut self, total: u64) {
        self.update(|s| s.bytes_written = total);
        if self.window_start.elapsed() >= self.speed_interval {
            self.report_speeds(total);
        }
    }

    /// Report average and current speed unconditionally and start a new
    /// window.
    pub fn report_speeds(&mut self, total: u64) {
        let now = Instant::now();
        let average = Speed {
            bytes: total,
            elapsed: now.duration_since(self.started),
        };
        let current = Speed {
            bytes: total.saturating_sub(self.window_bytes),
            elapsed: now.duration_since(self.window_start),
        };
        self.update(|s| {
            s.bytes_written = total;
            s.average_speed = Some(average);
            s.current_speed = Some(current);
        });
        self.emit(ProgressEvent::AverageSpeed(average));
        self.emit(ProgressEvent::CurrentSpeed(current));
        self.window_start = now;
        self.window_bytes = total;
    }

    /// Close the queue and wait until every queued event was delivered.
    pub async fn finish(mut self) {
        self.events = None;
        if self.dropped > 0 {
            warn!(dropped = self.dropped, "progress events dropped by a slow observer");
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                warn!(error = %e, "progress observer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_handles_zero_elapsed() {
        let speed = Speed {
            bytes: 1000,
            elapsed: Duration::ZERO,
        };
        assert_eq!(speed.bytes_per_second(), 0.0);

        let speed = Speed {
            bytes: 1000,
            elapsed: Duration::from_millis(500),
        };
        assert_eq!(speed.bytes_per_second(), 2000.0);
    }

    #[tokio::test]
    async fn observers_receive_events_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::default();
        let sink = Arc::clone(&seen);
        observers.set_scan_progress(move |n| sink.lock().unwrap().push(n));

        let snapshot = Arc::new(Mutex::new(ProgressSnapshot::default()));
        let mut tracker =
            ProgressTracker::start(&observers, Arc::clone(&snapshot), &ArchiveOptions::default());
        tracker.begin_scan();
        for n in 1..=3 {
            tracker.on_scanned(n);
        }
        tracker.scan_finished(3);
        tracker.finish().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        let snapshot = snapshot.lock().unwrap();
        assert_eq!(snapshot.files_scanned, 3);
        assert!(snapshot.scan_complete);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let delivered = Arc::new(Mutex::new(0usize));
        let mut observers = Observers::default();
        let sink = Arc::clone(&delivered);
        observers.set_scan_progress(move |_| *sink.lock().unwrap() += 1);

        // The dispatcher cannot run before the first await, so the queue
        // fills up after two events.
        let options = ArchiveOptions::default().progress_queue(2);
        let snapshot = Arc::new(Mutex::new(ProgressSnapshot::default()));
        let mut tracker = ProgressTracker::start(&observers, Arc::clone(&snapshot), &options);
        for n in 1..=100 {
            tracker.on_scanned(n);
        }
        assert_eq!(tracker.dropped, 98);
        tracker.finish().await;

        assert_eq!(*delivered.lock().unwrap(), 2);
        assert_eq!(snapshot.lock().unwrap().files_scanned, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn speeds_reported_once_per_interval() {
        let speeds = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::default();
        let sink = Arc::clone(&speeds);
        observers.set_current_speed(move |s| sink.lock().unwrap().push(s));

        let options = ArchiveOptions::default().speed_interval(Duration::from_secs(1));
        let snapshot = Arc::new(Mutex::new(ProgressSnapshot::default()));
        let mut tracker = ProgressTracker::start(&observers, Arc::clone(&snapshot), &options);
        tracker.begin_compress(1, 300);

        tracker.on_bytes_written(100);
        tokio::time::advance(Duration::from_millis(1500)).await;
        tracker.on_bytes_written(200);
        tracker.on_bytes_written(250);
        tracker.finish().await;

        let speeds = speeds.lock().unwrap();
        assert_eq!(speeds.len(), 1);
        assert_eq!(speeds[0].bytes, 200);
        assert_eq!(speeds[0].elapsed, Duration::from_millis(1500));
        assert_eq!(snapshot.lock().unwrap().bytes_written, 250);
    }
}
