use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::errors::AppResult;

const JOURNAL_FILE_NAME: &str = "sync-journal.jsonl";

/// Append-only JSONL record of sync sessions and update installs.
#[derive(Clone)]
pub struct SyncJournal {
    path: PathBuf,
    max_file_bytes: u64,
    max_file_count: usize,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl SyncJournal {
    pub fn new<P: AsRef<Path>>(logs_dir: P, config: &AppConfig) -> AppResult<Self> {
        let logs_dir = logs_dir.as_ref();
        fs::create_dir_all(logs_dir)?;
        let path = logs_dir.join(JOURNAL_FILE_NAME);
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            max_file_bytes: config.journal_max_bytes.max(1),
            max_file_count: config.journal_max_files.max(1),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, event: &str, payload: serde_json::Value) -> AppResult<()> {
        let entry = JournalEntry {
            event: event.to_string(),
            timestamp: Utc::now(),
            payload,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock();
        self.rotate_if_needed(line.len() as u64)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    /// Newest entries of the current file, oldest first. Unreadable lines are skipped.
    pub fn recent(&self, limit: usize) -> AppResult<Vec<JournalEntry>> {
        let _guard = self.write_lock.lock();
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries: Vec<JournalEntry> = BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current_size = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current_size == 0 || current_size + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count <= 1 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            return Ok(());
        }

        let rotated_path = self.parent().join(format!(
            "{}-{}.jsonl",
            self.stem(),
            Utc::now().format("%Y%m%d%H%M%S%3f")
        ));
        fs::rename(&self.path, &rotated_path)?;
        self.prune_rotations()?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let prefix = format!("{}-", self.stem());
        let mut rotations = fs::read_dir(self.parent())?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_string_lossy().to_string();
                (name.starts_with(&prefix) && name.ends_with(".jsonl")).then_some((entry.path(), name))
            })
            .collect::<Vec<_>>();

        // Timestamped names sort chronologically.
        rotations.sort_by(|a, b| a.1.cmp(&b.1));
        let allowed = self.max_file_count.saturating_sub(1);
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for (path, _) in rotations.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn parent(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "sync-journal".into())
    }
}
