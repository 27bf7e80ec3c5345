//! procflow snapshot storage
//!
//! One JSON envelope per stage boundary, written atomically into a run
//! directory:
//!
//! ```text
//! <state-dir>/
//!   0001-gather_evidence.json
//!   0002-gather_evidence.json
//!   0003-match_flows.json
//!   ...
//! ```
//!
//! Each envelope carries a sequence number, the stage, a timestamp, and the
//! SHA-256 of the embedded state text. [`SnapshotStore::latest`] returns the
//! newest snapshot whose digest still matches, so a torn or edited file is
//! skipped rather than resumed from.


use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use procflow_core::{DerivationState, Stage, StageObserver};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

// ============================================================================
// Envelope
// ============================================================================

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    sequence: u64,
    stage: Stage,
    saved_at: DateTime<Utc>,
    run_id: &'a str,
    digest: String,
    state: &'a RawValue,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    sequence: u64,
    stage: Stage,
    saved_at: DateTime<Utc>,
    digest: String,
    state: Box<RawValue>,
}

/// A verified snapshot read back from disk.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub sequence: u64,
    pub stage: Stage,
    pub saved_at: DateTime<Utc>,
    pub path: PathBuf,
    pub state: DerivationState,
}

/// File-name level view of a snapshot, no content read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub sequence: u64,
    pub stage: Stage,
    pub path: PathBuf,
}

fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn file_name(sequence: u64, stage: Stage) -> String {
    format!("{sequence:04}-{stage}.json")
}

fn parse_file_name(name: &str) -> Option<(u64, Stage)> {
    let stem = name.strip_suffix(".json")?;
    let (sequence, stage) = stem.split_once('-')?;
    Some((sequence.parse().ok()?, stage.parse().ok()?))
}

// ============================================================================
// SnapshotStore
// ============================================================================

pub struct SnapshotStore {
    dir: PathBuf,
    next_sequence: Mutex<u64>,
}

impl SnapshotStore {
    /// Open (creating if needed) a run directory. Numbering continues after
    /// the highest snapshot already present.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create state dir {}", dir.display()))?;
        let store = Self {
            dir,
            next_sequence: Mutex::new(1),
        };
        let highest = store.entries()?.last().map_or(0, |e| e.sequence);
        *store.next_sequence.lock() = highest + 1;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot files in sequence order.
    pub fn entries(&self) -> Result<Vec<SnapshotEntry>> {
        let mut entries = Vec::new();
        for item in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?
        {
            let item = item?;
            let name = item.file_name();
            let Some((sequence, stage)) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            entries.push(SnapshotEntry {
                sequence,
                stage,
                path: item.path(),
            });
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    /// Write `state` as the snapshot taken after `stage`. The file appears
    /// under its final name only once fully written.
    pub fn save(&self, state: &DerivationState, stage: Stage) -> Result<PathBuf> {
        let state_json = serde_json::to_string(state).context("failed to serialize state")?;
        let raw = RawValue::from_string(state_json).context("state is not valid JSON")?;

        let mut next = self.next_sequence.lock();
        let sequence = *next;
        let envelope = EnvelopeOut {
            sequence,
            stage,
            saved_at: Utc::now(),
            run_id: &state.run_id,
            digest: sha256_hex(raw.get()),
            state: &*raw,
        };
        let body = serde_json::to_vec_pretty(&envelope).context("failed to serialize envelope")?;

        let path = self.dir.join(file_name(sequence, stage));
        let tmp = self.dir.join(format!(".{}.tmp", file_name(sequence, stage)));
        std::fs::write(&tmp, &body).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move snapshot into place at {}", path.display()))?;
        *next += 1;

        tracing::debug!(sequence, stage = %stage, path = %path.display(), bytes = body.len(), "snapshot saved");
        Ok(path)
    }

    /// Read and verify one snapshot file.
    pub fn load(&self, path: &Path) -> Result<Snapshot> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let envelope: EnvelopeIn = serde_json::from_str(&text)
            .with_context(|| format!("malformed snapshot envelope {}", path.display()))?;

        let actual = sha256_hex(envelope.state.get());
        if actual != envelope.digest {
            bail!(
                "snapshot {} failed its digest check (expected {}, found {})",
                path.display(),
                envelope.digest,
                actual
            );
        }
        let state: DerivationState = serde_json::from_str(envelope.state.get())
            .with_context(|| format!("snapshot {} holds an unreadable state", path.display()))?;

        Ok(Snapshot {
            sequence: envelope.sequence,
            stage: envelope.stage,
            saved_at: envelope.saved_at,
            path: path.to_path_buf(),
            state,
        })
    }

    /// Newest snapshot that passes verification; corrupt ones are skipped
    /// with a warning.
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        for entry in self.entries()?.into_iter().rev() {
            match self.load(&entry.path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(err) => {
                    tracing::warn!(path = %entry.path.display(), error = %format!("{err:#}"), "skipping unusable snapshot");
                }
            }
        }
        Ok(None)
    }

    /// Remove the run directory and everything in it.
    pub fn cleanup(self) -> Result<()> {
        std::fs::remove_dir_all(&self.dir)
            .with_context(|| format!("failed to remove {}", self.dir.display()))?;
        tracing::info!(dir = %self.dir.display(), "state dir removed");
        Ok(())
    }
}

#[async_trait]
impl StageObserver for SnapshotStore {
    async fn on_stage(&self, state: &DerivationState, stage: Stage) -> Result<()> {
        self.save(state, stage).map(|_| ())
    }
}
