//! # Delivery Journal
//!
//! Host-side JSONL record of what happened on the radio link. One JSON object
//! per line, rotated after `max_records_per_file` records; only the newest
//! `max_files_to_keep` files are retained.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::power::PowerTier;
use crate::sample::{Batch, BatchId, SequenceNumber};

const FILE_PREFIX: &str = "journal_";
const FILE_SUFFIX: &str = ".jsonl";

/// One journaled link or power event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    Delivered {
        batch_id: BatchId,
        emergency: bool,
        samples: usize,
        first_seq: Option<SequenceNumber>,
        last_seq: Option<SequenceNumber>,
    },
    Failed {
        batch_id: BatchId,
        emergency: bool,
        reason: String,
        backoff_ms: u64,
    },
    Aborted {
        batch_id: BatchId,
        samples: usize,
    },
    Dropped {
        reason: String,
        count: u64,
    },
    TierChanged {
        from: PowerTier,
        to: PowerTier,
    },
}

impl JournalEvent {
    pub fn delivered(batch: &Batch) -> Self {
        let range = batch.seq_range();
        JournalEvent::Delivered {
            batch_id: batch.id(),
            emergency: batch.is_emergency(),
            samples: batch.len(),
            first_seq: range.map(|(first, _)| first),
            last_seq: range.map(|(_, last)| last),
        }
    }
}

#[derive(Serialize)]
struct JournalRecord<'a> {
    timestamp: DateTime<Utc>,
    device_id: u32,
    #[serde(flatten)]
    event: &'a JournalEvent,
}

/// Rotating JSONL writer
pub struct DeliveryJournal {
    dir: PathBuf,
    device_id: u32,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    writer: Option<BufWriter<File>>,
    records_in_file: usize,
    files_opened: u64,
}

impl DeliveryJournal {
    /// Open a journal in `config.log_dir`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn open(config: &TelemetryConfig, device_id: u32) -> Result<Self> {
        let dir = PathBuf::from(&config.log_dir);
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            device_id,
            max_records_per_file: config.max_records_per_file.max(1),
            max_files_to_keep: config.max_files_to_keep.max(1),
            writer: None,
            records_in_file: 0,
            files_opened: 0,
        })
    }

    /// Append one event, rotating first if the current file is full
    pub fn record(&mut self, event: &JournalEvent) -> Result<()> {
        if self.writer.is_none() || self.records_in_file >= self.max_records_per_file {
            self.rotate()?;
        }

        let record = JournalRecord {
            timestamp: Utc::now(),
            device_id: self.device_id,
            event,
        };

        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, &record).map_err(std::io::Error::from)?;
            writer.write_all(b"\n")?;
            self.records_in_file += 1;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        let name = format!(
            "{}{}_{:06}{}",
            FILE_PREFIX,
            Utc::now().format("%Y%m%dT%H%M%S"),
            self.files_opened,
            FILE_SUFFIX
        );
        let path = self.dir.join(name);
        debug!("Opening journal file {:?}", path);

        self.writer = Some(BufWriter::new(File::create(&path)?));
        self.records_in_file = 0;
        self.files_opened += 1;

        self.prune()
    }

    /// Delete the oldest journal files beyond the retention limit
    fn prune(&self) -> Result<()> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
            })
            .collect();

        if files.len() <= self.max_files_to_keep {
            return Ok(());
        }

        files.sort();
        let excess = files.len() - self.max_files_to_keep;
        for path in &files[..excess] {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to remove old journal file {:?}: {}", path, e);
            }
        }

        Ok(())
    }
}

impl Drop for DeliveryJournal {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Reading, Sample, Battery};
    use tempfile::TempDir;

    fn journal_config(dir: &Path, per_file: usize, keep: usize) -> TelemetryConfig {
        TelemetryConfig {
            enabled: true,
            log_dir: dir.to_string_lossy().into_owned(),
            max_records_per_file: per_file,
            max_files_to_keep: keep,
        }
    }

    fn journal_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    fn dropped(count: u64) -> JournalEvent {
        JournalEvent::Dropped {
            reason: "buffer full".to_string(),
            count,
        }
    }

    #[test]
    fn test_record_writes_json_line() {
        let tmp = TempDir::new().unwrap();
        let mut journal = DeliveryJournal::open(&journal_config(tmp.path(), 100, 5), 77).unwrap();

        let batch = Batch::new(
            3,
            vec![Sample::new(
                10,
                0,
                Reading::Battery(Battery { percent: 50, millivolts: 3_800, charging: false, solar: false }),
            )],
        );
        journal.record(&JournalEvent::delivered(&batch)).unwrap();
        journal.flush().unwrap();

        let files = journal_files(tmp.path());
        assert_eq!(files.len(), 1);

        let contents = fs::read_to_string(&files[0]).unwrap();
        let line: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["event"], "delivered");
        assert_eq!(line["device_id"], 77);
        assert_eq!(line["batch_id"], 3);
        assert_eq!(line["first_seq"], 10);
        assert!(line["timestamp"].is_string());
    }

    #[test]
    fn test_tier_change_serialization() {
        let tmp = TempDir::new().unwrap();
        let mut journal = DeliveryJournal::open(&journal_config(tmp.path(), 100, 5), 1).unwrap();

        journal
            .record(&JournalEvent::TierChanged { from: PowerTier::Normal, to: PowerTier::Critical })
            .unwrap();
        journal.flush().unwrap();

        let contents = fs::read_to_string(&journal_files(tmp.path())[0]).unwrap();
        let line: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(line["event"], "tier_changed");
        assert_eq!(line["from"], "normal");
        assert_eq!(line["to"], "critical");
    }

    #[test]
    fn test_rotation_after_max_records() {
        let tmp = TempDir::new().unwrap();
        let mut journal = DeliveryJournal::open(&journal_config(tmp.path(), 2, 10), 1).unwrap();

        for i in 0..5 {
            journal.record(&dropped(i)).unwrap();
        }
        journal.flush().unwrap();

        let files = journal_files(tmp.path());
        assert_eq!(files.len(), 3);

        let line_counts: Vec<usize> = files
            .iter()
            .map(|f| fs::read_to_string(f).unwrap().lines().count())
            .collect();
        assert_eq!(line_counts, vec![2, 2, 1]);
    }

    #[test]
    fn test_old_files_pruned() {
        let tmp = TempDir::new().unwrap();
        let mut journal = DeliveryJournal::open(&journal_config(tmp.path(), 1, 2), 1).unwrap();

        for i in 0..6 {
            journal.record(&dropped(i)).unwrap();
        }
        journal.flush().unwrap();

        let files = journal_files(tmp.path());
        assert_eq!(files.len(), 2);

        // Newest two records survive
        let last = fs::read_to_string(&files[1]).unwrap();
        let line: serde_json::Value = serde_json::from_str(last.trim()).unwrap();
        assert_eq!(line["count"], 5);
    }

    #[test]
    fn test_prune_ignores_foreign_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("notes.txt"), "keep me").unwrap();

        let mut journal = DeliveryJournal::open(&journal_config(tmp.path(), 1, 1), 1).unwrap();
        for i in 0..3 {
            journal.record(&dropped(i)).unwrap();
        }

        assert!(tmp.path().join("notes.txt").exists());
    }

    #[test]
    fn test_open_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a").join("b");
        let journal = DeliveryJournal::open(&journal_config(&nested, 10, 1), 1).unwrap();
        assert!(journal.dir().is_dir());
    }
}
