//! Recording manifests
//!
//! A bench "recording" leaves an inspectable artifact: one JSON manifest
//! per recording under the recording directory, written at start and
//! rewritten as comments arrive and when the recording stops. Tests and
//! humans read it back to see what the device was told.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spindleproto::{CommentCharset, PatientRecord, Tick};
use tracing::info;

use crate::instrument::CommentEvent;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Failed to create recording directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write manifest {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("A recording is already active")]
    AlreadyRecording,

    #[error("No recording is active")]
    NotRecording,
}

/// What one recording captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub file_name: String,
    pub comment: String,
    pub serial: u32,
    pub started_at: DateTime<Utc>,
    pub started_tick: Tick,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient: Option<PatientRecord>,
    pub comments: Vec<ManifestComment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_tick: Option<Tick>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestComment {
    pub tick: Tick,
    pub color: u32,
    pub charset: CommentCharset,
    pub text: String,
}

/// Accept names that stay inside the recording directory: short,
/// ASCII-alphanumeric plus `-`, `_`, `.`, no leading dot.
pub fn valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

struct ActiveRecording {
    path: PathBuf,
    manifest: Manifest,
}

/// Writes and maintains recording manifests.
pub struct Recorder {
    dir: PathBuf,
    active: Option<ActiveRecording>,
}

impl Recorder {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RecorderError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| RecorderError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir, active: None })
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Manifest path of the active recording, if one is running.
    pub fn manifest_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    pub fn start(
        &mut self,
        file_name: &str,
        comment: &str,
        serial: u32,
        tick: Tick,
        patient: Option<PatientRecord>,
    ) -> Result<(), RecorderError> {
        if self.active.is_some() {
            return Err(RecorderError::AlreadyRecording);
        }
        let manifest = Manifest {
            file_name: file_name.to_string(),
            comment: comment.to_string(),
            serial,
            started_at: Utc::now(),
            started_tick: tick,
            patient,
            comments: Vec::new(),
            stopped_at: None,
            stopped_tick: None,
        };
        let path = self.dir.join(format!("{file_name}.json"));
        write_manifest(&path, &manifest)?;
        info!(path = %path.display(), "recording manifest created");
        self.active = Some(ActiveRecording { path, manifest });
        Ok(())
    }

    pub fn add_comment(&mut self, event: &CommentEvent) -> Result<(), RecorderError> {
        let Some(active) = self.active.as_mut() else {
            return Err(RecorderError::NotRecording);
        };
        active.manifest.comments.push(ManifestComment {
            tick: event.tick,
            color: event.color,
            charset: event.charset,
            text: event.text.clone(),
        });
        write_manifest(&active.path, &active.manifest)
    }

    pub fn stop(&mut self, tick: Tick) -> Result<(), RecorderError> {
        let Some(mut active) = self.active.take() else {
            return Err(RecorderError::NotRecording);
        };
        active.manifest.stopped_at = Some(Utc::now());
        active.manifest.stopped_tick = Some(tick);
        write_manifest(&active.path, &active.manifest)?;
        info!(
            path = %active.path.display(),
            comments = active.manifest.comments.len(),
            "recording manifest finalized"
        );
        Ok(())
    }
}

fn write_manifest(path: &Path, manifest: &Manifest) -> Result<(), RecorderError> {
    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(path, json).map_err(|source| RecorderError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn patient() -> PatientRecord {
        PatientRecord {
            id: "p-1".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            dob_month: 12,
            dob_day: 10,
            dob_year: 1815,
        }
    }

    fn reload(path: &Path) -> Manifest {
        let json = fs::read_to_string(path).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn start_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path()).unwrap();

        recorder
            .start("run-1", "baseline", 7, Tick(100), Some(patient()))
            .unwrap();
        let path = recorder.manifest_path().unwrap().to_path_buf();
        assert_eq!(path, dir.path().join("run-1.json"));

        let manifest = reload(&path);
        assert_eq!(manifest.file_name, "run-1");
        assert_eq!(manifest.comment, "baseline");
        assert_eq!(manifest.serial, 7);
        assert_eq!(manifest.started_tick, Tick(100));
        assert_eq!(manifest.patient.unwrap().id, "p-1");
        assert!(manifest.comments.is_empty());
        assert!(manifest.stopped_at.is_none());
    }

    #[test]
    fn comments_and_stop_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path()).unwrap();
        recorder.start("run-2", "", 1, Tick(0), None).unwrap();
        let path = recorder.manifest_path().unwrap().to_path_buf();

        recorder
            .add_comment(&CommentEvent {
                tick: Tick(50),
                color: 0xFF,
                charset: CommentCharset::Ansi,
                text: "stim on".to_string(),
            })
            .unwrap();
        recorder
            .add_comment(&CommentEvent {
                tick: Tick(90),
                color: 0,
                charset: CommentCharset::Utf16,
                text: "stim off".to_string(),
            })
            .unwrap();
        recorder.stop(Tick(200)).unwrap();

        let manifest = reload(&path);
        assert_eq!(manifest.comments.len(), 2);
        assert_eq!(manifest.comments[0].text, "stim on");
        assert_eq!(manifest.comments[1].tick, Tick(90));
        assert_eq!(manifest.stopped_tick, Some(Tick(200)));
        assert!(manifest.stopped_at.is_some());
    }

    #[test]
    fn state_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path()).unwrap();

        assert!(matches!(
            recorder.stop(Tick(0)),
            Err(RecorderError::NotRecording)
        ));
        recorder.start("run-3", "", 1, Tick(0), None).unwrap();
        assert!(matches!(
            recorder.start("run-4", "", 1, Tick(0), None),
            Err(RecorderError::AlreadyRecording)
        ));
        recorder.stop(Tick(1)).unwrap();
        assert!(matches!(
            recorder.stop(Tick(2)),
            Err(RecorderError::NotRecording)
        ));
    }

    #[test]
    fn file_name_validation() {
        assert!(valid_file_name("run-1"));
        assert!(valid_file_name("session_2026.08"));
        assert!(!valid_file_name(""));
        assert!(!valid_file_name(".hidden"));
        assert!(!valid_file_name("a/b"));
        assert!(!valid_file_name("../escape"));
        assert!(!valid_file_name(&"x".repeat(65)));
    }
}
