// src/core/replay/journal.rs

//! The append-only replay journal.
//!
//! Every event-class message this peer emits or relays is appended to a
//! segment file under the log directory, one line per message, prefixed with
//! its original timestamp. Segments are named after their starting unix
//! timestamp in milliseconds, rotated by size, compacted on rotation and
//! pruned by retention. A single writer task owns the live segment; replay
//! readers open independent read-only descriptors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::{File as TokioFile, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::core::VigilError;
use crate::core::cluster::protocol::{Message, methods};
use crate::core::now_ts;

/// Work accepted by the journal writer task.
#[derive(Debug)]
pub enum JournalRequest {
    Append {
        message: Message,
        /// Reports whether the append reached disk; replication to peers is
        /// gated on it.
        ack: Option<oneshot::Sender<bool>>,
    },
}

/// Tracks the highest journaled timestamp as f64 bits.
#[derive(Debug, Default)]
pub struct JournalPosition(AtomicU64);

impl JournalPosition {
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn advance(&self, ts: f64) {
        // Non-negative f64 bit patterns order like the floats themselves.
        self.0.fetch_max(ts.max(0.0).to_bits(), Ordering::AcqRel);
    }
}

/// The single-writer journal task.
pub struct JournalWriterTask {
    dir: PathBuf,
    segment_max_bytes: u64,
    retention: Duration,
    rx: mpsc::Receiver<JournalRequest>,
    healthy: Arc<AtomicBool>,
    position: Arc<JournalPosition>,
    writer: Option<BufWriter<TokioFile>>,
    current_path: PathBuf,
    current_size: u64,
}

impl JournalWriterTask {
    pub fn new(
        dir: PathBuf,
        segment_max_bytes: u64,
        retention: Duration,
        rx: mpsc::Receiver<JournalRequest>,
        healthy: Arc<AtomicBool>,
        position: Arc<JournalPosition>,
    ) -> Self {
        Self {
            dir,
            segment_max_bytes,
            retention,
            rx,
            healthy,
            position,
            writer: None,
            current_path: PathBuf::new(),
            current_size: 0,
        }
    }

    /// The main run loop. Drains pending appends on shutdown, then syncs.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        if let Err(e) = self.open_current_segment().await {
            error!("Journal writer could not open a segment: {e}");
            self.healthy.store(false, Ordering::Release);
        }
        info!("Journal writer started in {}.", self.dir.display());
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    self.drain_and_sync().await;
                    return;
                }
                maybe_request = self.rx.recv() => {
                    match maybe_request {
                        Some(request) => self.handle(request).await,
                        None => {
                            self.drain_and_sync().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn drain_and_sync(&mut self) {
        self.rx.close();
        while let Some(request) = self.rx.recv().await {
            self.handle(request).await;
        }
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush().await {
                error!("Failed to flush journal on shutdown: {e}");
            }
            if let Err(e) = writer.get_ref().sync_all().await {
                error!("Failed to sync journal on shutdown: {e}");
            }
        }
        info!("Journal writer shut down.");
    }

    async fn handle(&mut self, request: JournalRequest) {
        match request {
            JournalRequest::Append { message, ack } => {
                let ok = match self.append(&message).await {
                    Ok(()) => {
                        self.healthy.store(true, Ordering::Release);
                        true
                    }
                    Err(e) => {
                        // Replication halts until the journal is writable
                        // again; local scheduling continues.
                        error!("Journal append failed: {e}");
                        self.healthy.store(false, Ordering::Release);
                        self.writer = None;
                        false
                    }
                };
                if let Some(ack) = ack {
                    let _ = ack.send(ok);
                }
            }
        }
    }

    async fn append(&mut self, message: &Message) -> Result<(), VigilError> {
        if self.writer.is_none() {
            self.open_current_segment().await?;
        }
        let line = format_entry(message)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| VigilError::StatePersist("journal segment unavailable".into()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| VigilError::StatePersist(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| VigilError::StatePersist(e.to_string()))?;
        self.current_size += line.len() as u64;
        self.position.advance(message.ts);
        if self.current_size >= self.segment_max_bytes {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn open_current_segment(&mut self) -> Result<(), VigilError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| VigilError::StatePersist(format!("create log dir: {e}")))?;
        // Resume the newest segment if it still has room, else start fresh.
        let resume = list_segments(&self.dir)?
            .into_iter()
            .next_back()
            .and_then(|path| {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                (size < self.segment_max_bytes).then_some((path, size))
            });
        let (path, size) = match resume {
            Some(existing) => existing,
            None => (fresh_segment_path(&self.dir), 0),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| VigilError::StatePersist(format!("open '{}': {e}", path.display())))?;
        debug!("Journal writing to {} ({} bytes).", path.display(), size);
        self.writer = Some(BufWriter::new(file));
        self.current_path = path;
        self.current_size = size;
        Ok(())
    }

    async fn rotate(&mut self) -> Result<(), VigilError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .await
                .map_err(|e| VigilError::StatePersist(e.to_string()))?;
            writer
                .get_ref()
                .sync_all()
                .await
                .map_err(|e| VigilError::StatePersist(e.to_string()))?;
        }
        let finished = self.current_path.clone();
        let compacted = tokio::task::spawn_blocking(move || compact_segment(&finished))
            .await
            .map_err(|e| VigilError::Internal(e.to_string()))?;
        if let Err(e) = compacted {
            warn!("Compaction of rotated segment failed: {e}");
        }
        if let Err(e) = prune_segments(&self.dir, self.retention) {
            warn!("Retention pruning failed: {e}");
        }

        let path = fresh_segment_path(&self.dir);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| VigilError::StatePersist(format!("open '{}': {e}", path.display())))?;
        info!("Journal rotated to {}.", path.display());
        self.writer = Some(BufWriter::new(file));
        self.current_path = path;
        self.current_size = 0;
        Ok(())
    }
}

fn segment_name(ts: f64) -> String {
    format!("{}.log", (ts * 1000.0) as u64)
}

/// A segment path that does not collide with an existing file; rotations
/// within the same millisecond bump the starting timestamp.
fn fresh_segment_path(dir: &Path) -> PathBuf {
    let mut start = now_ts();
    loop {
        let path = dir.join(segment_name(start));
        if !path.exists() {
            return path;
        }
        start += 0.001;
    }
}

fn segment_start_ms(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// One journal line: the original timestamp, a space, the wire JSON.
pub fn format_entry(message: &Message) -> Result<String, VigilError> {
    Ok(format!("{} {}\n", message.ts, serde_json::to_string(message)?))
}

fn parse_entry(line: &str) -> Option<(f64, Message)> {
    let (ts, json) = line.split_once(' ')?;
    let ts: f64 = ts.parse().ok()?;
    let message: Message = serde_json::from_str(json).ok()?;
    Some((ts, message))
}

/// Journal segments sorted by starting timestamp.
pub fn list_segments(dir: &Path) -> Result<Vec<PathBuf>, VigilError> {
    let mut segments = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
        Err(e) => return Err(e.into()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "log") && segment_start_ms(&path).is_some() {
            segments.push(path);
        }
    }
    segments.sort_by_key(|path| segment_start_ms(path).unwrap_or(0));
    Ok(segments)
}

/// Every journaled message with `ts > after`, in timestamp order.
pub fn read_entries_since(dir: &Path, after: f64) -> Result<Vec<Message>, VigilError> {
    let mut entries: Vec<(f64, Message)> = Vec::new();
    for segment in list_segments(dir)? {
        let contents = std::fs::read_to_string(&segment)?;
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_entry(line) {
                Some((ts, message)) if ts > after => entries.push((ts, message)),
                Some(_) => {}
                None => warn!("Skipping corrupt journal line in {}.", segment.display()),
            }
        }
    }
    entries.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(entries.into_iter().map(|(_, message)| message).collect())
}

/// The highest timestamp present in the journal.
pub fn last_position(dir: &Path) -> Result<f64, VigilError> {
    let mut last: f64 = 0.0;
    for segment in list_segments(dir)? {
        let contents = std::fs::read_to_string(&segment)?;
        for line in contents.lines() {
            if let Some((ts, _)) = parse_entry(line) {
                last = last.max(ts);
            }
        }
    }
    Ok(last)
}

/// The highest sequence number a source has recorded in the journal. Used to
/// seed the local counter so restarts never reuse a sequence.
pub fn max_sequence_for(dir: &Path, source: &str) -> Result<u64, VigilError> {
    let mut max = 0u64;
    for segment in list_segments(dir)? {
        let contents = std::fs::read_to_string(&segment)?;
        for line in contents.lines() {
            if let Some((_, message)) = parse_entry(line)
                && let Some((origin, sequence)) = message.envelope()
                && origin == source
            {
                max = max.max(sequence);
            }
        }
    }
    Ok(max)
}

/// Rewrites a finished segment, coalescing superseded `config::Update` lines
/// for the same `(type, name)`. Updates are idempotent object snapshots, so
/// keeping only the latest preserves the restored state.
pub fn compact_segment(path: &Path) -> Result<(), VigilError> {
    let contents = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();

    let mut last_update: HashMap<(String, String), usize> = HashMap::new();
    for (index, line) in lines.iter().enumerate() {
        if let Some((_, message)) = parse_entry(line)
            && message.method == methods::CONFIG_UPDATE
            && let (Some(kind), Some(name)) = (
                message.params.get("type").and_then(|v| v.as_str()),
                message.params.get("name").and_then(|v| v.as_str()),
            )
        {
            last_update.insert((kind.to_string(), name.to_string()), index);
        }
    }
    if last_update.is_empty() {
        return Ok(());
    }

    let mut kept = String::with_capacity(contents.len());
    let mut dropped = 0usize;
    for (index, line) in lines.iter().enumerate() {
        let superseded = parse_entry(line).is_some_and(|(_, message)| {
            message.method == methods::CONFIG_UPDATE
                && match (
                    message.params.get("type").and_then(|v| v.as_str()),
                    message.params.get("name").and_then(|v| v.as_str()),
                ) {
                    (Some(kind), Some(name)) => {
                        last_update.get(&(kind.to_string(), name.to_string())) != Some(&index)
                    }
                    _ => false,
                }
        });
        if superseded {
            dropped += 1;
        } else {
            kept.push_str(line);
            kept.push('\n');
        }
    }
    if dropped == 0 {
        return Ok(());
    }

    let tmp = path.with_extension("compact");
    std::fs::write(&tmp, kept)?;
    std::fs::rename(&tmp, path)?;
    debug!(
        "Compacted {}: dropped {dropped} superseded config updates.",
        path.display()
    );
    Ok(())
}

/// Deletes segments whose entire content is older than the retention cutoff:
/// a segment is removable once the next segment started before the cutoff.
pub fn prune_segments(dir: &Path, retention: Duration) -> Result<(), VigilError> {
    let cutoff_ms = ((now_ts() - retention.as_secs_f64()) * 1000.0).max(0.0) as u64;
    let segments = list_segments(dir)?;
    for window in segments.windows(2) {
        let next_start = segment_start_ms(&window[1]).unwrap_or(u64::MAX);
        if next_start < cutoff_ms {
            info!("Deleting expired journal segment {}.", window[0].display());
            std::fs::remove_file(&window[0])?;
        }
    }
    Ok(())
}
