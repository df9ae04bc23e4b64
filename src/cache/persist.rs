//! Append-only day files backing a [`CacheStore`](super::CacheStore).
//!
//! Layout: `<root>/<YYYY>/<MM-DD>/<device>`, one entry line per write in the
//! wire format. Lines starting with `#` are comments. On start the store replays
//! every file in date order.

use super::entry::CacheEntry;
use super::{device_of, wire};
use crate::error::AppResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Files kept open for appending before the handle table is flushed.
const MAX_OPEN_FILES: usize = 256;

pub struct DayFileStore {
    root: PathBuf,
    open: Mutex<HashMap<PathBuf, File>>,
}

impl DayFileStore {
    pub fn open(root: impl AsRef<Path>) -> AppResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, entry: &CacheEntry) -> PathBuf {
        let secs = entry.time.floor() as i64;
        let day = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default();
        self.root
            .join(day.format("%Y").to_string())
            .join(day.format("%m-%d").to_string())
            .join(device_of(&entry.key))
    }

    /// Append one entry to its day file.
    pub fn append(&self, entry: &CacheEntry) -> AppResult<()> {
        let path = self.path_for(entry);
        let mut open = self.open.lock();
        if !open.contains_key(&path) {
            if open.len() >= MAX_OPEN_FILES {
                open.clear();
            }
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let fresh = !path.exists();
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            if fresh {
                writeln!(file, "# {}", device_of(&entry.key))?;
            }
            open.insert(path.clone(), file);
        }
        if let Some(file) = open.get_mut(&path) {
            writeln!(file, "{}", wire::encode_entry(entry))?;
        }
        Ok(())
    }

    /// Every stored entry, day by day. Unparseable lines are skipped with a
    /// warning.
    pub fn load(&self) -> AppResult<Vec<CacheEntry>> {
        let mut files = Vec::new();
        for year in sorted_dirs(&self.root)? {
            for day in sorted_dirs(&year)? {
                let mut names: Vec<PathBuf> = fs::read_dir(&day)?
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.is_file())
                    .collect();
                names.sort();
                files.extend(names);
            }
        }

        let mut entries = Vec::new();
        for path in files {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                let line = line.trim_end_matches('\r');
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match wire::decode_entry(line) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => tracing::warn!(
                        file = %path.display(),
                        line = lineno + 1,
                        error = %err,
                        "skipping bad cache file line"
                    ),
                }
            }
        }
        Ok(entries)
    }
}

fn sorted_dirs(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DayFileStore::open(dir.path()).unwrap();
        // 2024-03-01 and 2024-03-02
        store
            .append(&CacheEntry::new("m1/value", json!(1.0), 1709294400.0, None))
            .unwrap();
        store
            .append(&CacheEntry::new("m1/value", json!(2.0), 1709380800.0, Some(5.0)))
            .unwrap();
        store
            .append(&CacheEntry::new("m2/status", json!([200, "ok"]), 1709294401.0, None))
            .unwrap();

        assert!(dir.path().join("2024").join("03-01").join("m1").is_file());
        assert!(dir.path().join("2024").join("03-02").join("m1").is_file());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].key, "m1/value");
        assert_eq!(loaded[2].value, json!(2.0));
        assert_eq!(loaded[2].ttl, Some(5.0));
    }

    #[test]
    fn test_comments_and_garbage_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("2024").join("01-01");
        fs::create_dir_all(&day).unwrap();
        fs::write(
            day.join("m1"),
            "# header\nm1/value\t1.0\t\t=3\nnot a line\n\nm1/value\t2.0\t\t!\n",
        )
        .unwrap();
        let loaded = DayFileStore::open(dir.path()).unwrap().load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[1].expired);
    }
}
