//! Append-only event queue backed by a rotating JSONL log.
//!
//! Writers serialize through a process-wide advisory file lock with a bounded
//! wait; on contention the event lands in an overflow sidecar instead of
//! blocking the caller. Readers tail the log in chunks and never take the
//! lock. Rotation renames the active file to a timestamped archive and is
//! atomic with respect to concurrent readers.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::event::{Event, now_ms};
use crate::paths::SeshatPaths;
use crate::persist;

// ---------------------------------------------------------------------------
// Advisory lock
// ---------------------------------------------------------------------------

/// RAII guard over an exclusive `flock` on the queue lock file.
struct QueueLock {
    file: File,
}

impl QueueLock {
    /// Poll for the lock until `deadline` elapses. 1 ms between attempts.
    fn acquire(lock_path: &Path, deadline: Duration) -> Result<Self, QueueError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(lock_path)
            .map_err(|e| QueueError::Io {
                path: lock_path.display().to_string(),
                source: e,
            })?;
        let started = Instant::now();
        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                return Ok(Self { file });
            }
            if started.elapsed() >= deadline {
                return Err(QueueError::Contention {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

/// Logical cursor + counters, persisted as `queue/state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueState {
    /// Records of the active file already consumed by the bridge.
    pub head: u64,
    /// Cached record count of the active file.
    pub active_records: u64,
    /// Completed rotations.
    pub rotations: u64,
    /// Events diverted to the overflow sidecar.
    pub dropped: u64,
    /// Malformed lines skipped during reads.
    pub invalid: u64,
    /// Last state write (ms since epoch).
    pub updated_ms: u64,
}

/// Result of a capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Appended to the active log.
    Accepted,
    /// Diverted to the overflow sidecar (contention or I/O failure).
    Dropped,
}

// ---------------------------------------------------------------------------
// Event queue
// ---------------------------------------------------------------------------

/// Parameters for queue behavior, snapshot from the tuneables.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Capture path budget; lock polling stops here (ms).
    pub capture_budget_ms: u64,
    /// Bound for lock waits outside the capture hot path, e.g. rotation (ms).
    pub lock_wait_ms: u64,
    /// Record count that triggers rotation.
    pub rotate_threshold: u64,
    /// Tail-read chunk size (bytes).
    pub tail_chunk_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capture_budget_ms: 10,
            lock_wait_ms: 500,
            rotate_threshold: 10_000,
            tail_chunk_bytes: 64 * 1024,
        }
    }
}

/// Append-only rotating event log.
pub struct EventQueue {
    events_path: PathBuf,
    state_path: PathBuf,
    overflow_path: PathBuf,
    invalid_path: PathBuf,
    lock_path: PathBuf,
    archive_dir: PathBuf,
    config: QueueConfig,
    state: Mutex<QueueState>,
    dropped: AtomicU64,
    invalid: AtomicU64,
}

impl EventQueue {
    /// Open (or create) the queue under the given paths.
    pub fn open(paths: &SeshatPaths, config: QueueConfig) -> Result<Self, QueueError> {
        std::fs::create_dir_all(paths.queue_dir()).map_err(|e| QueueError::Io {
            path: paths.queue_dir().display().to_string(),
            source: e,
        })?;

        let state_path = paths.queue_state_file();
        let events_path = paths.events_file();
        let mut state: QueueState = persist::read_json(&state_path)
            .ok()
            .flatten()
            .unwrap_or_default();

        // Refresh the size cache when it is missing or stale.
        let on_disk = persist::count_lines(&events_path).unwrap_or(0);
        if state.active_records != on_disk {
            state.active_records = on_disk;
            state.head = state.head.min(on_disk);
        }

        let queue = Self {
            lock_path: paths.queue_dir().join(".lock"),
            archive_dir: paths.queue_dir(),
            overflow_path: paths.overflow_file(),
            invalid_path: paths.invalid_events_file(),
            dropped: AtomicU64::new(state.dropped),
            invalid: AtomicU64::new(state.invalid),
            state: Mutex::new(state),
            events_path,
            state_path,
            config,
        };
        Ok(queue)
    }

    /// Append an event to the log.
    ///
    /// Completes within the capture budget: if the lock is not acquired in
    /// time, or the write fails, the line goes to the overflow sidecar and
    /// the dropped counter increments. The caller is never blocked beyond
    /// the budget plus one write.
    pub fn capture(&self, event: &Event) -> CaptureOutcome {
        let line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "event serialization failed, dropping");
                return self.divert(None);
            }
        };

        let deadline = Duration::from_millis(self.config.capture_budget_ms);
        let guard = match QueueLock::acquire(&self.lock_path, deadline) {
            Ok(g) => g,
            Err(QueueError::Contention { waited_ms }) => {
                tracing::debug!(waited_ms, "queue lock contention, diverting to overflow");
                return self.divert(Some(&line));
            }
            Err(e) => {
                tracing::warn!(error = %e, "queue lock unavailable, diverting to overflow");
                return self.divert(Some(&line));
            }
        };

        if let Err(e) = persist::append_line(&self.events_path, &line) {
            tracing::warn!(error = %e, "event append failed, diverting to overflow");
            drop(guard);
            return self.divert(Some(&line));
        }
        drop(guard);

        let mut state = self.state.lock().unwrap();
        state.active_records += 1;
        CaptureOutcome::Accepted
    }

    /// Divert a line to the overflow sidecar and count the drop.
    fn divert(&self, line: Option<&str>) -> CaptureOutcome {
        if let Some(line) = line {
            if let Err(e) = persist::append_line(&self.overflow_path, line) {
                tracing::error!(error = %e, "overflow sidecar write failed, event lost");
            }
        }
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.lock().unwrap().dropped = dropped;
        CaptureOutcome::Dropped
    }

    /// Tail-read the most recent `n` events without loading the full log.
    ///
    /// Malformed lines are skipped, counted, and copied to the
    /// `invalid_events` sidecar.
    pub fn read_recent(&self, n: usize) -> Vec<Event> {
        // Over-read to compensate for lines that fail to parse.
        let lines = persist::tail_lines(&self.events_path, n.saturating_mul(2), self.config.tail_chunk_bytes)
            .unwrap_or_default();
        let mut events: Vec<Event> = Vec::with_capacity(n);
        for line in &lines {
            match serde_json::from_str::<Event>(line) {
                Ok(e) => events.push(e),
                Err(_) => self.record_invalid(line),
            }
        }
        if events.len() > n {
            events.drain(..events.len() - n);
        }
        events
    }

    /// Read up to `max` events past the logical head, advancing the head.
    ///
    /// This is the bridge cycle's consume cursor; invalid lines still advance
    /// the head so a corrupt record cannot wedge the consumer.
    pub fn read_from_head(&self, max: u64) -> Vec<Event> {
        let head = self.state.lock().unwrap().head;
        let file = match File::open(&self.events_path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut scanned = 0u64;
        for line in reader.lines().skip(head as usize) {
            if scanned >= max {
                break;
            }
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            scanned += 1;
            match serde_json::from_str::<Event>(&line) {
                Ok(e) => events.push(e),
                Err(_) => self.record_invalid(&line),
            }
        }
        if scanned > 0 {
            let mut state = self.state.lock().unwrap();
            state.head += scanned;
        }
        events
    }

    fn record_invalid(&self, line: &str) {
        let _ = persist::append_line(&self.invalid_path, line);
        let invalid = self.invalid.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.lock().unwrap().invalid = invalid;
    }

    /// Rotate when the active file exceeds the configured threshold.
    ///
    /// Renames the active log to a timestamped archive and starts a fresh
    /// one. Idempotent: below the threshold (or with no file) it is a no-op.
    /// Readers racing the rename simply finish against the archived file.
    pub fn rotate_if_needed(&self) -> Result<bool, QueueError> {
        let active = self.state.lock().unwrap().active_records;
        if active < self.config.rotate_threshold {
            return Ok(false);
        }
        let _guard = QueueLock::acquire(
            &self.lock_path,
            Duration::from_millis(self.config.lock_wait_ms),
        )?;

        if !self.events_path.exists() {
            return Ok(false);
        }
        let archive = self
            .archive_dir
            .join(format!("events-{}.jsonl", now_ms()));
        std::fs::rename(&self.events_path, &archive).map_err(|e| QueueError::RotateFailed {
            message: format!("{} -> {}: {e}", self.events_path.display(), archive.display()),
        })?;
        File::create(&self.events_path).map_err(|e| QueueError::Io {
            path: self.events_path.display().to_string(),
            source: e,
        })?;

        let mut state = self.state.lock().unwrap();
        state.head = 0;
        state.active_records = 0;
        state.rotations += 1;
        drop(state);
        self.compact_state()?;
        tracing::info!(archive = %archive.display(), "event log rotated");
        Ok(true)
    }

    /// Read every record, archives first (in rotation order), then the active
    /// file. Used by `status` and by backfill tooling.
    pub fn read_all(&self) -> Vec<Event> {
        let mut archives: Vec<PathBuf> = std::fs::read_dir(&self.archive_dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .map(|n| {
                                let n = n.to_string_lossy();
                                n.starts_with("events-") && n.ends_with(".jsonl")
                            })
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        archives.sort();

        let mut events = Vec::new();
        for path in archives.into_iter().chain(std::iter::once(self.events_path.clone())) {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(_) => continue,
            };
            for line in BufReader::new(file).lines().map_while(Result::ok) {
                match serde_json::from_str::<Event>(&line) {
                    Ok(e) => events.push(e),
                    Err(_) => self.record_invalid(&line),
                }
            }
        }
        events
    }

    /// Current logical state (head, sizes, counters).
    pub fn state(&self) -> QueueState {
        self.state.lock().unwrap().clone()
    }

    /// Rewrite `queue/state.json` from the in-memory state.
    pub fn compact_state(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.updated_ms = now_ms();
        let snapshot = state.clone();
        drop(state);
        persist::write_json_atomic(&self.state_path, &snapshot).map_err(|e| QueueError::Io {
            path: self.state_path.display().to_string(),
            source: e,
        })
    }
}
