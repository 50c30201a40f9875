// ABOUTME: Writes each routed event to disk as <dir>/<subdir>/<timestamp>-<type>.json.
// ABOUTME: Loads a recording back in timestamp order for replay.

use crate::envelope::{Envelope, Source};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Recorder {
    dir: PathBuf,
}

impl Recorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record(&self, envelope: &Envelope) -> Result<PathBuf> {
        let directory = self.dir.join(envelope.source.subdir());
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("Failed to create {}", directory.display()))?;

        let kind = sanitize(envelope.handler_name());
        let stamp = envelope.received_at.timestamp_micros();
        let mut path = directory.join(format!("{stamp:016}-{kind}.json"));
        let mut suffix = 1;
        while path.exists() {
            path = directory.join(format!("{stamp:016}-{kind}-{suffix}.json"));
            suffix += 1;
        }

        let content = serde_json::to_string(&envelope.to_record())?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::trace!(path = %path.display(), "Recorded event");
        Ok(path)
    }
}

fn sanitize(kind: &str) -> String {
    kind.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn source_for(subdir: &str) -> Source {
    match subdir {
        "websocket" => Source::Stream,
        "http" => Source::Http,
        _ => Source::Local,
    }
}

/// Every recorded envelope under `dir`, ordered by file name (timestamp first).
pub fn load_recording(dir: &Path, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<Envelope>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let source = source_for(&entry.file_name().to_string_lossy());
        for file in std::fs::read_dir(&path)? {
            let file = file?.path();
            if file.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push((file, source));
            }
        }
    }
    files.sort_by(|(a, _), (b, _)| a.file_name().cmp(&b.file_name()));

    let mut envelopes = Vec::with_capacity(files.len());
    for (path, source) in files {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match serde_json::from_str(&content) {
            Ok(record) => envelopes.push(Envelope::from_record(record, source, now)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable recording")
            }
        }
    }
    Ok(envelopes)
}
