//! Run ledger: an append-only record of what happened during each run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stageline_core::{RunIdentity, RunState};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run already exists: {0}")]
    RunExists(Uuid),

    #[error("run {0} is closed")]
    RunClosed(Uuid),

    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// A single event in a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    /// Monotonic sequence number within the run, starting at 1.
    pub seq: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn open_run(&self, identity: &RunIdentity) -> Result<()>;

    /// Fails with [`LedgerError::RunClosed`] once the run is closed.
    async fn append_event(&self, run_id: Uuid, event: RunEvent) -> Result<()>;

    async fn close_run(&self, run_id: Uuid, state: RunState) -> Result<()>;

    async fn get_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>>;

    /// Final state, or `None` while the run is open.
    async fn final_state(&self, run_id: Uuid) -> Result<Option<RunState>>;
}

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LedgerRun {
    events: Vec<RunEvent>,
    closed: Option<RunState>,
}

/// In-memory ledger (testing only).
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<Uuid, LedgerRun>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_ids(&self) -> Vec<Uuid> {
        self.runs.lock().unwrap().keys().copied().collect()
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn open_run(&self, identity: &RunIdentity) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(&identity.run_id) {
            return Err(LedgerError::RunExists(identity.run_id));
        }
        runs.insert(
            identity.run_id,
            LedgerRun {
                events: Vec::new(),
                closed: None,
            },
        );
        Ok(())
    }

    async fn append_event(&self, run_id: Uuid, event: RunEvent) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(&run_id).ok_or(LedgerError::RunNotFound(run_id))?;
        if run.closed.is_some() {
            return Err(LedgerError::RunClosed(run_id));
        }
        run.events.push(event);
        Ok(())
    }

    async fn close_run(&self, run_id: Uuid, state: RunState) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(&run_id).ok_or(LedgerError::RunNotFound(run_id))?;
        if run.closed.is_some() {
            return Err(LedgerError::RunClosed(run_id));
        }
        run.closed = Some(state);
        Ok(())
    }

    async fn get_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id)
            .map(|r| r.events.clone())
            .ok_or(LedgerError::RunNotFound(run_id))
    }

    async fn final_state(&self, run_id: Uuid) -> Result<Option<RunState>> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id)
            .map(|r| r.closed)
            .ok_or(LedgerError::RunNotFound(run_id))
    }
}

// ---------------------------------------------------------------------------
// JsonlRunLedger
// ---------------------------------------------------------------------------

/// One line of a `<run_id>.jsonl` file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LedgerLine {
    Opened { identity: RunIdentity },
    Event(RunEvent),
    Closed { state: RunState, at: DateTime<Utc> },
}

/// Bytes read per step when scanning a ledger file backwards.
const TAIL_CHUNK: u64 = 4096;

/// File-backed ledger: one JSON line per record in `<dir>/<run_id>.jsonl`.
pub struct JsonlRunLedger {
    dir: PathBuf,
}

impl JsonlRunLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.jsonl"))
    }

    async fn read_lines(&self, run_id: Uuid) -> Result<Vec<LedgerLine>> {
        let content = match tokio::fs::read_to_string(self.path(run_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LedgerError::RunNotFound(run_id))
            }
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(LedgerError::from))
            .collect()
    }

    async fn write_line(&self, run_id: Uuid, line: &LedgerLine, create: bool) -> Result<()> {
        let mut text = serde_json::to_string(line)?;
        text.push('\n');

        let mut options = tokio::fs::OpenOptions::new();
        options.append(true);
        if create {
            options.create_new(true);
        }
        let mut file = match options.open(self.path(run_id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(LedgerError::RunExists(run_id))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LedgerError::RunNotFound(run_id))
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// The final record of a run file, read from the end.
    async fn last_line(&self, run_id: Uuid) -> Result<Option<LedgerLine>> {
        let mut file = match tokio::fs::File::open(self.path(run_id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LedgerError::RunNotFound(run_id))
            }
            Err(e) => return Err(e.into()),
        };

        let mut pos = file.metadata().await?.len();
        let mut tail: Vec<u8> = Vec::new();
        loop {
            let step = TAIL_CHUNK.min(pos);
            pos -= step;
            file.seek(std::io::SeekFrom::Start(pos)).await?;
            let mut chunk = vec![0u8; step as usize];
            file.read_exact(&mut chunk).await?;
            chunk.extend_from_slice(&tail);
            tail = chunk;

            let end = tail
                .iter()
                .rposition(|b| !b.is_ascii_whitespace())
                .map_or(0, |i| i + 1);
            let body = &tail[..end];
            if let Some(newline) = body.iter().rposition(|b| *b == b'\n') {
                return Ok(Some(serde_json::from_slice(&body[newline + 1..])?));
            }
            if pos == 0 {
                if body.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(serde_json::from_slice(body)?));
            }
        }
    }

    /// A closed run always ends with its `closed` record.
    async fn ensure_open(&self, run_id: Uuid) -> Result<()> {
        if let Some(LedgerLine::Closed { .. }) = self.last_line(run_id).await? {
            return Err(LedgerError::RunClosed(run_id));
        }
        Ok(())
    }
}

#[async_trait]
impl RunLedger for JsonlRunLedger {
    async fn open_run(&self, identity: &RunIdentity) -> Result<()> {
        let line = LedgerLine::Opened {
            identity: identity.clone(),
        };
        self.write_line(identity.run_id, &line, true).await
    }

    async fn append_event(&self, run_id: Uuid, event: RunEvent) -> Result<()> {
        self.ensure_open(run_id).await?;
        self.write_line(run_id, &LedgerLine::Event(event), false).await
    }

    async fn close_run(&self, run_id: Uuid, state: RunState) -> Result<()> {
        self.ensure_open(run_id).await?;
        let line = LedgerLine::Closed {
            state,
            at: Utc::now(),
        };
        self.write_line(run_id, &line, false).await
    }

    async fn get_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>> {
        Ok(self
            .read_lines(run_id)
            .await?
            .into_iter()
            .filter_map(|l| match l {
                LedgerLine::Event(event) => Some(event),
                _ => None,
            })
            .collect())
    }

    async fn final_state(&self, run_id: Uuid) -> Result<Option<RunState>> {
        Ok(self
            .read_lines(run_id)
            .await?
            .into_iter()
            .find_map(|l| match l {
                LedgerLine::Closed { state, .. } => Some(state),
                _ => None,
            }))
    }
}

// ---------------------------------------------------------------------------
// RunRecorder
// ---------------------------------------------------------------------------

/// Appends sequenced events for one run.
pub struct RunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: Uuid,
    seq: AtomicU64,
}

impl RunRecorder {
    pub async fn start(ledger: Arc<dyn RunLedger>, identity: &RunIdentity) -> Result<Self> {
        ledger.open_run(identity).await?;
        Ok(Self {
            ledger,
            run_id: identity.run_id,
            seq: AtomicU64::new(0),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn record(&self, kind: &str, payload: serde_json::Value) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = RunEvent {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.ledger.append_event(self.run_id, event).await
    }

    /// Close the run; returns the number of events recorded.
    pub async fn finish(self, state: RunState) -> Result<u64> {
        self.ledger.close_run(self.run_id, state).await?;
        Ok(self.seq.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> RunIdentity {
        RunIdentity::new("b7", "master", "abc", "digest")
    }

    async fn exercise(ledger: Arc<dyn RunLedger>) {
        let id = identity();
        let recorder = RunRecorder::start(ledger.clone(), &id).await.unwrap();
        recorder
            .record("state_changed", json!({"from": "PENDING", "to": "FETCHING"}))
            .await
            .unwrap();
        recorder
            .record("stage_finished", json!({"stage": "build"}))
            .await
            .unwrap();
        assert_eq!(ledger.final_state(id.run_id).await.unwrap(), None);

        let count = recorder.finish(RunState::Succeeded).await.unwrap();
        assert_eq!(count, 2);

        let events = ledger.get_events(id.run_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].kind, "stage_finished");
        assert_eq!(
            ledger.final_state(id.run_id).await.unwrap(),
            Some(RunState::Succeeded)
        );

        let late = RunEvent {
            seq: 3,
            kind: "late".to_string(),
            payload: json!({}),
            timestamp: Utc::now(),
        };
        assert!(matches!(
            ledger.append_event(id.run_id, late).await,
            Err(LedgerError::RunClosed(_))
        ));
        assert!(matches!(
            ledger.open_run(&id).await,
            Err(LedgerError::RunExists(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_ledger_lifecycle() {
        exercise(Arc::new(MemoryRunLedger::new())).await;
    }

    #[tokio::test]
    async fn test_jsonl_ledger_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonlRunLedger::new(dir.path().join("runs")).unwrap();
        exercise(Arc::new(ledger)).await;
    }

    #[tokio::test]
    async fn test_jsonl_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonlRunLedger::new(dir.path()).unwrap();
        let id = identity();
        ledger.open_run(&id).await.unwrap();
        ledger.close_run(id.run_id, RunState::Failed).await.unwrap();

        let content =
            std::fs::read_to_string(dir.path().join(format!("{}.jsonl", id.run_id))).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "opened");
        assert_eq!(lines[1]["type"], "closed");
        assert_eq!(lines[1]["state"], "FAILED");
    }

    #[tokio::test]
    async fn test_jsonl_close_seen_across_instances_and_large_lines() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonlRunLedger::new(dir.path()).unwrap();
        let id = identity();
        let recorder = RunRecorder::start(Arc::new(writer), &id).await.unwrap();
        for i in 0..50 {
            recorder
                .record("output", json!({ "line": i, "text": "x".repeat(3000) }))
                .await
                .unwrap();
        }

        let other = JsonlRunLedger::new(dir.path()).unwrap();
        assert_eq!(other.final_state(id.run_id).await.unwrap(), None);
        recorder.finish(RunState::Failed).await.unwrap();

        let late = RunEvent {
            seq: 51,
            kind: "late".to_string(),
            payload: json!({ "text": "y".repeat(10_000) }),
            timestamp: Utc::now(),
        };
        assert!(matches!(
            other.append_event(id.run_id, late).await,
            Err(LedgerError::RunClosed(_))
        ));
        assert!(matches!(
            other.last_line(id.run_id).await.unwrap(),
            Some(LedgerLine::Closed { state: RunState::Failed, .. })
        ));
        assert_eq!(other.get_events(id.run_id).await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let ledger = MemoryRunLedger::new();
        assert!(matches!(
            ledger.get_events(Uuid::new_v4()).await,
            Err(LedgerError::RunNotFound(_))
        ));
    }
}
