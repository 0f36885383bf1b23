//! Record storage
//!
//! Each collection is one pretty-printed JSON array on disk, e.g.
//! `/var/lib/sitectl/domains.json`. Writers take an exclusive `flock` on a
//! sibling `<file>.lock` for the whole load-mutate-save cycle and replace
//! the file through a rename, so concurrent invocations never interleave
//! and readers never see half-written JSON.

use std::fs::{self, File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{IoResultExt, Result, SiteError};
use crate::models::Record;

/// JSON-file-backed collection keyed by [`Record::key`]
#[derive(Debug, Clone)]
pub struct RecordStore<T> {
    path: PathBuf,
    _record: PhantomData<T>,
}

impl<T: Record> RecordStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    /// Path of the JSON file (for display purposes)
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, extension: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".");
        name.push(extension);
        PathBuf::from(name)
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).at(parent)?;
            }
        }
        Ok(())
    }

    /// Load every record; an absent file is an empty collection
    pub fn load(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let _lock = match StoreLock::acquire(&self.sibling("lock"), LockMode::Shared) {
            Ok(lock) => Some(lock),
            // Read-only users (e.g. `domain list` without root) can still read
            Err(SiteError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                debug!("Reading {} without a lock", self.path.display());
                None
            }
            Err(e) => return Err(e),
        };

        self.read_unlocked()
    }

    /// Overwrite the whole collection
    pub fn save(&self, records: &[T]) -> Result<()> {
        self.ensure_parent()?;
        let _lock = StoreLock::acquire(&self.sibling("lock"), LockMode::Exclusive)?;
        self.write_unlocked(records)
    }

    /// Run `mutate` against the current records under the exclusive lock
    ///
    /// The collection is written back only when `mutate` succeeds.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut Vec<T>) -> Result<R>) -> Result<R> {
        self.ensure_parent()?;
        let _lock = StoreLock::acquire(&self.sibling("lock"), LockMode::Exclusive)?;

        let mut records = self.read_unlocked()?;
        let result = mutate(&mut records)?;
        self.write_unlocked(&records)?;

        Ok(result)
    }

    /// Insert or replace the record with the same key
    pub fn upsert(&self, record: T) -> Result<()> {
        self.update(|records| {
            match records.iter_mut().find(|r| r.key() == record.key()) {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
            Ok(())
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<T>> {
        Ok(self.load()?.into_iter().find(|r| r.key() == key))
    }

    pub fn find(&self, key: &str) -> Result<T> {
        self.get(key)?
            .ok_or_else(|| SiteError::NotFound(format!("'{}' in {}", key, self.path.display())))
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Remove and return the record with `key`
    pub fn remove(&self, key: &str) -> Result<T> {
        let path = self.path.clone();
        self.update(|records| {
            let index = records
                .iter()
                .position(|r| r.key() == key)
                .ok_or_else(|| SiteError::NotFound(format!("'{}' in {}", key, path.display())))?;
            Ok(records.remove(index))
        })
    }

    fn read_unlocked(&self) -> Result<Vec<T>> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SiteError::io(&self.path, e)),
        };

        if json.trim().is_empty() {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_str(&json)?)
    }

    fn write_unlocked(&self, records: &[T]) -> Result<()> {
        let mut json = serde_json::to_string_pretty(records)?;
        json.push('\n');

        let tmp = self.sibling("tmp");
        fs::write(&tmp, json).at(&tmp)?;
        fs::rename(&tmp, &self.path).at(&self.path)?;

        debug!("Saved {} records to {}", records.len(), self.path.display());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory `flock` held until drop
#[derive(Debug)]
struct StoreLock {
    file: File,
}

impl StoreLock {
    fn acquire(path: &Path, mode: LockMode) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .at(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let operation = match mode {
                LockMode::Shared => libc::LOCK_SH,
                LockMode::Exclusive => libc::LOCK_EX,
            };
            // SAFETY: the descriptor is owned by `file`, which outlives the call
            if unsafe { libc::flock(file.as_raw_fd(), operation) } != 0 {
                return Err(SiteError::Lock(format!(
                    "{}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                )));
            }
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is still owned by `self.file`
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        name: String,
        #[serde(default)]
        enabled: bool,
    }

    impl Record for Entry {
        fn key(&self) -> &str {
            &self.name
        }
    }

    fn entry(name: &str, enabled: bool) -> Entry {
        Entry {
            name: name.to_string(),
            enabled,
        }
    }

    fn create_test_store() -> (RecordStore<Entry>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path().join("data").join("entries.json"));
        (store, temp_dir)
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let (store, _temp) = create_test_store();
        assert!(store.load().unwrap().is_empty());
        assert!(!store.path().parent().unwrap().exists());
    }

    #[test]
    fn test_upsert_creates_parent_and_loads() {
        let (store, _temp) = create_test_store();
        store.upsert(entry("alpha.test", true)).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, vec![entry("alpha.test", true)]);

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.starts_with("[\n"));
        assert!(!store.sibling("tmp").exists());
    }

    #[test]
    fn test_upsert_replaces_by_key() {
        let (store, _temp) = create_test_store();
        store.upsert(entry("alpha.test", true)).unwrap();
        store.upsert(entry("beta.test", true)).unwrap();
        store.upsert(entry("alpha.test", false)).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], entry("alpha.test", false));
        assert_eq!(loaded[1].name, "beta.test");
    }

    #[test]
    fn test_find_and_remove() {
        let (store, _temp) = create_test_store();
        store.upsert(entry("alpha.test", true)).unwrap();

        assert!(store.contains("alpha.test").unwrap());
        assert!(matches!(store.find("nope.test"), Err(SiteError::NotFound(_))));

        let removed = store.remove("alpha.test").unwrap();
        assert_eq!(removed.name, "alpha.test");
        assert!(!store.contains("alpha.test").unwrap());
        assert!(matches!(store.remove("alpha.test"), Err(SiteError::NotFound(_))));
    }

    #[test]
    fn test_unknown_and_missing_fields() {
        let (store, _temp) = create_test_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(
            store.path(),
            r#"[{"name": "alpha.test", "futureField": [1, 2]}]"#,
        )
        .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, vec![entry("alpha.test", false)]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let (store, _temp) = create_test_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{not json").unwrap();

        assert!(matches!(store.load(), Err(SiteError::Serialization(_))));
    }

    #[test]
    fn test_failed_update_writes_nothing() {
        let (store, _temp) = create_test_store();
        store.save(&[entry("alpha.test", true)]).unwrap();

        let result: Result<()> = store.update(|records| {
            records.clear();
            Err(SiteError::Validation("refused".to_string()))
        });
        assert!(result.is_err());

        // Lock released and data intact
        assert_eq!(store.load().unwrap().len(), 1);
        store.upsert(entry("beta.test", true)).unwrap();
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_upserts_are_serialized() {
        let (store, _temp) = create_test_store();
        let path = store.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store: RecordStore<Entry> = RecordStore::new(path);
                    store.upsert(entry(&format!("site{}.test", i), true)).unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut names: Vec<String> = store.load().unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names.len(), 8);
        assert_eq!(names[0], "site0.test");
        assert_eq!(names[7], "site7.test");
    }
}
