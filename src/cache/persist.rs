use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use super::entry::PersistedEntry;
use super::store::ResponseStore;

impl ResponseStore {
    /// Write a snapshot of the fingerprint -> entry map next to `path` and
    /// atomically rename it into place. A failed write never disturbs an
    /// existing snapshot.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        }

        let snapshot: HashMap<String, PersistedEntry> = self
            .snapshot_entries()
            .iter()
            .map(|(fingerprint, entry)| (fingerprint.clone(), PersistedEntry::from_entry(entry)))
            .collect();

        let temp_path = path.with_file_name(format!(
            "{}.tmp-{}",
            path.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("cache"),
            Uuid::new_v4()
        ));

        let write_result = (|| -> Result<()> {
            let file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .with_context(|| format!("failed to create {}", temp_path.display()))?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, &snapshot)
                .with_context(|| format!("failed to encode cache snapshot {}", path.display()))?;
            let file = writer
                .into_inner()
                .context("failed to flush cache snapshot")?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", temp_path.display()))?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err)
                .with_context(|| format!("failed to move cache snapshot into {}", path.display()));
        }
        debug!(path = %path.display(), entries = snapshot.len(), "cache snapshot written");
        Ok(())
    }

    /// Replace the in-memory cache with a previously saved snapshot.
    /// Entries that expired while on disk, or that no longer fit the size
    /// ceiling, are dropped. Recency order after a load is arbitrary.
    pub fn load(&self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("failed to open cache snapshot {}", path.display()))?;
        let snapshot: HashMap<String, PersistedEntry> =
            bincode::deserialize_from(BufReader::new(file))
                .with_context(|| format!("failed to decode cache snapshot {}", path.display()))?;

        let now = SystemTime::now();
        let max_size = self.max_size();
        let total = snapshot.len();
        let entries: Vec<_> = snapshot
            .into_iter()
            .map(|(fingerprint, persisted)| (fingerprint, persisted.into_entry()))
            .filter(|(_, entry)| !entry.is_expired(now))
            .filter(|(_, entry)| max_size == 0 || entry.body_size <= max_size)
            .collect();

        let dropped = total - entries.len();
        if dropped > 0 {
            warn!(
                dropped,
                "dropped expired or oversized entries while loading cache snapshot"
            );
        }
        debug!(path = %path.display(), entries = entries.len(), "cache snapshot loaded");
        self.replace_entries(entries);
        Ok(())
    }
}
