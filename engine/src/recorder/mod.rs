//! Background task that drains the ring buffer into rotating CSV chunk
//! files plus a JSON session manifest (spec.md §4.5). Grounded on
//! `other_examples/eb24607a_aogaki-delila-rs__src-recorder-mod.rs`'s
//! `FileWriter`/`AtomicStats` split: atomics for the hot counters the
//! status verb reads, a lock-protected "current chunk" handle so a
//! concurrent status check never observes a half-closed file.

use crate::error::RecorderError;
use crate::reading::Reading;
use crate::ring_buffer::RingBuffer;
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default drain cadence (spec.md §4.5).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

const CSV_HEADER: &str = "timestamp,sensor_id,mode,value,TempC,Vin\n";

/// Caller-supplied session metadata (spec.md §6 `start(opts)`); `session_id`
/// and `poll_interval` are not part of this — the former is assigned by the
/// recorder, the latter is a drain-cadence tuning knob passed separately.
#[derive(Debug, Clone)]
pub struct RecorderOptions {
    pub mission: String,
    pub rate_hz: f64,
    pub schema_version: u32,
    pub roll_interval_s: u64,
}

/// One finalized chunk file (spec.md §3). Immutable once finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: usize,
    pub name: String,
    pub byte_size: u64,
    pub row_count: u64,
    pub sha256_hex: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
}

/// The recorder's terminal, serializable view of a session (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub mission: String,
    pub schema_version: u32,
    pub rate_hz: f64,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub roll_interval_s: u64,
    pub chunk_dir: PathBuf,
    pub chunks: Vec<ChunkRecord>,
}

/// On-disk manifest shape (spec.md §6). `chunk_dir` is not part of the
/// manifest file itself — it is implied by where the manifest lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    session_id: String,
    mission: String,
    schema_version: u32,
    rate_hz: f64,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    roll_interval_s: u64,
    chunks: Vec<ChunkRecord>,
}

impl Manifest {
    fn from_descriptor(d: &SessionDescriptor) -> Self {
        Self {
            session_id: d.session_id.clone(),
            mission: d.mission.clone(),
            schema_version: d.schema_version,
            rate_hz: d.rate_hz,
            started_at: d.started_at,
            stopped_at: d.stopped_at,
            roll_interval_s: d.roll_interval_s,
            chunks: d.chunks.clone(),
        }
    }
}

/// Mirrors `RecorderStats` in the `delila-rs` recorder; backs the `status()`
/// verb (spec.md §6). `state` reflects whether the background loop is still
/// running normally or has hit a storage error (spec.md §7: recorder I/O
/// errors move it to an internal failed state but it keeps accepting
/// `stop()`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RecorderState {
    Running,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecorderStatus {
    pub state: RecorderState,
    pub rows: u64,
    pub bytes: u64,
    pub chunks: u64,
    pub current_chunk_age_s: f64,
}

struct AtomicStats {
    rows: AtomicU64,
    bytes: AtomicU64,
    chunks_finalized: AtomicU64,
    failed: AtomicBool,
    stopped: AtomicBool,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            rows: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            chunks_finalized: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }
}

/// A sleep a waiting thread can be woken out of early, mirroring the
/// controller's `StopSignal` (spec.md §9: "single flag, two tasks" — the
/// recorder's stop-flag is independent of the acquisition reader's).
struct StopSignal {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn request(&self) {
        *self.flag.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    fn wait(&self, dur: Duration) -> bool {
        let flag = self.flag.lock().unwrap();
        let (flag, _) = self
            .condvar
            .wait_timeout_while(flag, dur, |stopped| !*stopped)
            .unwrap();
        *flag
    }
}

/// A chunk file currently being appended to. Owned exclusively through the
/// `current` mutex below; the only code that ever reads or writes its
/// fields is the recorder's own background thread (and `status()`'s brief
/// peek).
struct OpenChunk {
    file: BufWriter<File>,
    tmp_path: PathBuf,
    final_name: String,
    index: usize,
    row_count: u64,
    start_ts: Option<DateTime<Utc>>,
    end_ts: Option<DateTime<Utc>>,
    opened_at: Instant,
}

impl OpenChunk {
    fn append(&mut self, reading: &Reading) -> Result<(), RecorderError> {
        let row = reading.to_csv_row();
        self.file.write_all(row.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.row_count += 1;
        if self.start_ts.is_none() {
            self.start_ts = Some(reading.timestamp);
        }
        self.end_ts = Some(reading.timestamp);
        Ok(())
    }
}

/// Background recorder thread (spec.md §4.5, §5). A second task alongside
/// the controller's acquisition reader; it borrows a read-only handle on
/// the ring buffer and a write-only handle on `chunk_dir`, and never
/// touches the transport.
pub struct ChunkedRecorder {
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<AtomicStats>,
    current: Arc<Mutex<Option<CurrentChunkView>>>,
    chunks: Arc<Mutex<Vec<ChunkRecord>>>,
    final_descriptor: Arc<Mutex<Option<SessionDescriptor>>>,
    chunk_dir: PathBuf,
}

/// The subset of `OpenChunk` state `status()` needs, published under the
/// same lock `OpenChunk` rotation nulls first — see `rotate()`.
#[derive(Clone, Copy)]
struct CurrentChunkView {
    opened_at: Instant,
}

impl ChunkedRecorder {
    /// Starts the recorder. Requires the controller to be in an
    /// acquisition state (spec.md §4.5); the caller passes a snapshot of
    /// that state rather than the controller itself, since the recorder
    /// never touches the controller or transport afterward.
    pub fn start(
        ring: Arc<RingBuffer>,
        controller_is_acquiring: bool,
        chunk_root: impl AsRef<Path>,
        session_id: impl Into<String>,
        opts: RecorderOptions,
        poll_interval: Duration,
    ) -> Result<Self, RecorderError> {
        if !controller_is_acquiring {
            return Err(RecorderError::InvalidState);
        }

        let session_id = session_id.into();
        let chunk_dir = chunk_root.as_ref().join(&session_id);
        fs::create_dir_all(&chunk_dir)?;

        let started_at = Utc::now();
        let descriptor = SessionDescriptor {
            session_id: session_id.clone(),
            mission: opts.mission.clone(),
            schema_version: opts.schema_version,
            rate_hz: opts.rate_hz,
            started_at,
            stopped_at: None,
            roll_interval_s: opts.roll_interval_s,
            chunk_dir: chunk_dir.clone(),
            chunks: Vec::new(),
        };
        write_manifest_atomically(&chunk_dir, &Manifest::from_descriptor(&descriptor))?;

        let stop = Arc::new(StopSignal::new());
        let stats = Arc::new(AtomicStats::new());
        let current: Arc<Mutex<Option<CurrentChunkView>>> = Arc::new(Mutex::new(None));
        let chunks: Arc<Mutex<Vec<ChunkRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let final_descriptor: Arc<Mutex<Option<SessionDescriptor>>> = Arc::new(Mutex::new(None));

        let thread_stop = Arc::clone(&stop);
        let thread_stats = Arc::clone(&stats);
        let thread_current = Arc::clone(&current);
        let thread_chunks = Arc::clone(&chunks);
        let thread_final = Arc::clone(&final_descriptor);
        let thread_chunk_dir = chunk_dir.clone();
        let thread_descriptor = descriptor;
        let roll_interval = Duration::from_secs(opts.roll_interval_s.max(1));

        let handle = std::thread::spawn(move || {
            run_loop(
                ring,
                thread_stop,
                thread_stats,
                thread_current,
                thread_chunks,
                thread_final,
                thread_chunk_dir,
                thread_descriptor,
                roll_interval,
                poll_interval,
            )
        });

        Ok(Self {
            stop,
            handle: Some(handle),
            stats,
            current,
            chunks,
            final_descriptor,
            chunk_dir,
        })
    }

    /// Signals the drain loop to stop, finalizes the current (possibly
    /// partial) chunk, writes `stopped_at`, and returns the finalized
    /// session descriptor.
    pub fn stop(&mut self) -> SessionDescriptor {
        self.stop.request();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.stats.stopped.store(true, Ordering::Relaxed);
        self.final_descriptor
            .lock()
            .unwrap()
            .clone()
            .expect("recorder thread always publishes a final descriptor before exiting")
    }

    pub fn status(&self) -> RecorderStatus {
        let state = if self.stats.stopped.load(Ordering::Relaxed) {
            RecorderState::Stopped
        } else if self.stats.failed.load(Ordering::Relaxed) {
            RecorderState::Failed
        } else {
            RecorderState::Running
        };
        let current_chunk_age_s = self
            .current
            .lock()
            .unwrap()
            .map(|c| c.opened_at.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        RecorderStatus {
            state,
            rows: self.stats.rows.load(Ordering::Relaxed),
            bytes: self.stats.bytes.load(Ordering::Relaxed),
            chunks: self.stats.chunks_finalized.load(Ordering::Relaxed),
            current_chunk_age_s,
        }
    }

    /// Finalized chunks only (spec.md §6 `snapshots()`).
    pub fn snapshots(&self) -> Vec<ChunkRecord> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn chunk_dir(&self) -> &Path {
        &self.chunk_dir
    }
}

impl Drop for ChunkedRecorder {
    fn drop(&mut self) {
        self.stop.request();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    ring: Arc<RingBuffer>,
    stop: Arc<StopSignal>,
    stats: Arc<AtomicStats>,
    current: Arc<Mutex<Option<CurrentChunkView>>>,
    chunks: Arc<Mutex<Vec<ChunkRecord>>>,
    final_descriptor: Arc<Mutex<Option<SessionDescriptor>>>,
    chunk_dir: PathBuf,
    mut descriptor: SessionDescriptor,
    roll_interval: Duration,
    poll_interval: Duration,
) {
    let mut open: Option<OpenChunk> = None;
    let mut last_seen_ts: Option<DateTime<Utc>> = None;
    let mut next_index: usize = 0;

    loop {
        if let Err(e) = drain_once(
            &ring,
            &stats,
            &current,
            &chunks,
            &chunk_dir,
            &mut open,
            &mut last_seen_ts,
            &mut next_index,
            roll_interval,
        ) {
            error!("recorder storage error, marking failed and continuing: {e}");
            stats.failed.store(true, Ordering::Relaxed);
        }
        if stop.wait(poll_interval) {
            break;
        }
    }

    // Final drain to catch anything appended between the last iteration and
    // the stop signal, then finalize whatever chunk is open.
    if let Err(e) = drain_once(
        &ring,
        &stats,
        &current,
        &chunks,
        &chunk_dir,
        &mut open,
        &mut last_seen_ts,
        &mut next_index,
        Duration::from_secs(0),
    ) {
        error!("recorder storage error during final drain: {e}");
        stats.failed.store(true, Ordering::Relaxed);
    }
    if let Some(chunk) = open.take() {
        *current.lock().unwrap() = None;
        match finalize_chunk(&chunk_dir, chunk) {
            Ok(record) => {
                stats.chunks_finalized.fetch_add(1, Ordering::Relaxed);
                chunks.lock().unwrap().push(record);
            }
            Err(e) => {
                error!("failed to finalize final chunk at stop: {e}");
                stats.failed.store(true, Ordering::Relaxed);
            }
        }
    }

    descriptor.stopped_at = Some(Utc::now());
    descriptor.chunks = chunks.lock().unwrap().clone();
    if let Err(e) = write_manifest_atomically(&chunk_dir, &Manifest::from_descriptor(&descriptor)) {
        error!("failed to write final manifest: {e}");
    }
    *final_descriptor.lock().unwrap() = Some(descriptor);
}

#[allow(clippy::too_many_arguments)]
fn drain_once(
    ring: &RingBuffer,
    stats: &AtomicStats,
    current: &Mutex<Option<CurrentChunkView>>,
    chunks: &Mutex<Vec<ChunkRecord>>,
    chunk_dir: &Path,
    open: &mut Option<OpenChunk>,
    last_seen_ts: &mut Option<DateTime<Utc>>,
    next_index: &mut usize,
    roll_interval: Duration,
) -> Result<(), RecorderError> {
    let snapshot = ring.snapshot();
    let filtered: Vec<&Reading> = snapshot
        .iter()
        .filter(|r| last_seen_ts.is_none_or(|ts| r.timestamp > ts))
        .collect();
    if let Some(max_ts) = filtered.iter().map(|r| r.timestamp).max() {
        *last_seen_ts = Some(max_ts);
    }

    if !filtered.is_empty() && open.is_none() {
        let chunk = open_new_chunk(chunk_dir, *next_index)?;
        *next_index += 1;
        *current.lock().unwrap() = Some(CurrentChunkView {
            opened_at: chunk.opened_at,
        });
        *open = Some(chunk);
    }

    if let Some(chunk) = open.as_mut() {
        for reading in &filtered {
            chunk.append(reading)?;
            stats.rows.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes
                .fetch_add(reading.to_csv_row().len() as u64 + 1, Ordering::Relaxed);
        }

        if chunk.opened_at.elapsed() >= roll_interval {
            // Clear-before-close (spec.md §4.5a): null the published
            // "current chunk" state before doing the slow flush/fsync/
            // hash/rename below, so a concurrent `status()` call never
            // observes a non-null but already-closed chunk.
            *current.lock().unwrap() = None;
            let finished = open.take().expect("checked Some above");
            let record = finalize_chunk(chunk_dir, finished)?;
            stats.chunks_finalized.fetch_add(1, Ordering::Relaxed);
            chunks.lock().unwrap().push(record);
        }
    }

    Ok(())
}

fn open_new_chunk(chunk_dir: &Path, index: usize) -> Result<OpenChunk, RecorderError> {
    let final_name = format!("chunk_{index:05}.csv");
    let tmp_path = chunk_dir.join(format!("{final_name}.tmp"));
    let file = File::create(&tmp_path)?;
    let mut file = BufWriter::new(file);
    file.write_all(CSV_HEADER.as_bytes())?;
    Ok(OpenChunk {
        file,
        tmp_path,
        final_name,
        index,
        row_count: 0,
        start_ts: None,
        end_ts: None,
        opened_at: Instant::now(),
    })
}

/// Finalizes a chunk: flush, fsync, close, hash, then rename — the rename
/// is the publication point (spec.md §4.5b-c). The caller has already
/// nulled the shared "current chunk" state before calling this.
fn finalize_chunk(chunk_dir: &Path, mut chunk: OpenChunk) -> Result<ChunkRecord, RecorderError> {
    chunk.file.flush()?;
    chunk.file.get_ref().sync_all()?;
    drop(chunk.file);

    let bytes = fs::read(&chunk.tmp_path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256_hex = format!("{:x}", hasher.finalize());
    let byte_size = bytes.len() as u64;

    let final_path = chunk_dir.join(&chunk.final_name);
    fs::rename(&chunk.tmp_path, &final_path)?;

    let start_ts = chunk.start_ts.unwrap_or_else(Utc::now);
    let end_ts = chunk.end_ts.unwrap_or(start_ts);

    info!(
        "finalized {} ({} rows, {} bytes, sha256 {sha256_hex})",
        chunk.final_name, chunk.row_count, byte_size
    );

    Ok(ChunkRecord {
        index: chunk.index,
        name: chunk.final_name,
        byte_size,
        row_count: chunk.row_count,
        sha256_hex,
        start_ts,
        end_ts,
        finalized_at: Utc::now(),
    })
}

/// Write-temp-then-rename, fsyncing the temp before rename (spec.md §4.5d,
/// §6). `chunk_dir` is treated as a plain directory write target; the
/// recorder never reads it back except to finalize chunks.
fn write_manifest_atomically(chunk_dir: &Path, manifest: &Manifest) -> Result<(), RecorderError> {
    let final_path = chunk_dir.join("manifest.json");
    let tmp_path = chunk_dir.join("manifest.json.tmp");
    let json = serde_json::to_vec_pretty(manifest)?;
    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(&json)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Mode;
    use tempfile::tempdir;

    fn reading_at(secs: i64, value: f64) -> Reading {
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap();
        Reading::new(ts, "Q1", Mode::Freerun, value, None, None)
    }

    fn opts() -> RecorderOptions {
        RecorderOptions {
            mission: "m1".into(),
            rate_hz: 1.0,
            schema_version: 1,
            roll_interval_s: 3600,
        }
    }

    #[test]
    fn rejects_start_when_controller_not_acquiring() {
        let dir = tempdir().unwrap();
        let ring = Arc::new(RingBuffer::new(100));
        let err = ChunkedRecorder::start(ring, false, dir.path(), "s1", opts(), DEFAULT_POLL_INTERVAL)
            .unwrap_err();
        assert!(matches!(err, RecorderError::InvalidState));
    }

    #[test]
    fn stop_finalizes_partial_chunk_and_writes_manifest() {
        let dir = tempdir().unwrap();
        let ring = Arc::new(RingBuffer::new(100));
        ring.push(reading_at(0, 1.0));
        ring.push(reading_at(1, 2.0));
        ring.push(reading_at(2, 3.0));

        let mut rec = ChunkedRecorder::start(
            Arc::clone(&ring),
            true,
            dir.path(),
            "session-a",
            opts(),
            Duration::from_millis(20),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(150));
        let descriptor = rec.stop();

        assert_eq!(descriptor.chunks.len(), 1);
        let chunk = &descriptor.chunks[0];
        assert_eq!(chunk.row_count, 3);
        assert!(descriptor.stopped_at.is_some());

        let chunk_path = descriptor.chunk_dir.join(&chunk.name);
        let bytes = fs::read(&chunk_path).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        assert_eq!(format!("{:x}", hasher.finalize()), chunk.sha256_hex);
        assert_eq!(bytes.len() as u64, chunk.byte_size);

        assert!(!dir.path().join("session-a").join("chunk_00000.csv.tmp").exists());

        let manifest_bytes = fs::read(descriptor.chunk_dir.join("manifest.json")).unwrap();
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes).unwrap();
        assert_eq!(manifest.chunks.len(), 1);
        assert_eq!(manifest.session_id, "session-a");
    }

    #[test]
    fn rotation_produces_multiple_disjoint_chunks() {
        let dir = tempdir().unwrap();
        let ring = Arc::new(RingBuffer::new(1000));

        let mut rec = ChunkedRecorder::start(
            Arc::clone(&ring),
            true,
            dir.path(),
            "session-b",
            RecorderOptions {
                mission: "m".into(),
                rate_hz: 10.0,
                schema_version: 1,
                roll_interval_s: 1,
            },
            Duration::from_millis(20),
        )
        .unwrap();

        for i in 0..40 {
            ring.push(reading_at(i, i as f64));
            std::thread::sleep(Duration::from_millis(60));
        }

        let descriptor = rec.stop();
        assert!(descriptor.chunks.len() >= 2, "expected at least 2 rotations");

        let mut seen = std::collections::HashSet::new();
        let mut prev_end: Option<DateTime<Utc>> = None;
        for (i, chunk) in descriptor.chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            if let Some(prev) = prev_end {
                assert!(chunk.start_ts >= prev, "chunks must be time-ordered and disjoint");
            }
            prev_end = Some(chunk.end_ts);

            let bytes = fs::read(descriptor.chunk_dir.join(&chunk.name)).unwrap();
            for line in String::from_utf8(bytes).unwrap().lines().skip(1) {
                let ts = line.split(',').next().unwrap().to_string();
                assert!(seen.insert(ts), "row timestamp appeared in more than one chunk");
            }
        }
    }

    #[test]
    fn status_reports_running_then_stopped() {
        let dir = tempdir().unwrap();
        let ring = Arc::new(RingBuffer::new(10));
        let mut rec = ChunkedRecorder::start(ring, true, dir.path(), "s", opts(), Duration::from_millis(20))
            .unwrap();
        assert_eq!(rec.status().state, RecorderState::Running);
        rec.stop();
        assert_eq!(rec.status().state, RecorderState::Stopped);
    }
}
