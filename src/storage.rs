//! Persistent query counter storage.
//!
//! Provides a thread-safe counter backed by a single text file:
//! - The file holds the decimal count and nothing else
//! - Every increment rewrites the file in place before returning
//! - A single mutex covers both the in-memory value and the file handle

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, trace};

/// Name of the counter file inside the work directory.
///
/// Fixed so that a restarted server finds the count of its predecessor.
pub const COUNTER_FILENAME: &str = "query_counters.txt";

/// Content of a freshly created counter file
const INITIAL_CONTENT: &[u8] = b"0";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Could not open the persistent storage file '{}': {}", .path.display(), .source)]
    Open { path: PathBuf, source: io::Error },

    #[error("Could not read the current query count from '{}': {}", .path.display(), .source)]
    Read { path: PathBuf, source: io::Error },

    #[error("Could not read the current query count from '{}': invalid content {:?}", .path.display(), .content)]
    Corrupt { path: PathBuf, content: String },

    #[error("Could not write the query count to '{}': {}", .path.display(), .source)]
    Write { path: PathBuf, source: io::Error },

    #[error("Query count cannot be incremented past {0}")]
    Exhausted(u64),
}

/// State guarded by the store's lock
struct CounterState {
    queries: u64,
    file: File,
}

/// Thread-safe persisted query counter
pub struct CounterStore {
    path: PathBuf,
    /// Sync file data to the device after every write
    fsync: bool,
    state: Mutex<CounterState>,
}

impl CounterStore {
    /// Open (or create) the counter file in `work_directory` and load the count.
    pub fn open(work_directory: impl AsRef<Path>, fsync: bool) -> Result<Self, StorageError> {
        let path = work_directory.as_ref().join(COUNTER_FILENAME);

        let mut file = match open_read_write(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Creating persistent storage file");
                create_initial(&path).map_err(|source| open_error(&path, source))?;
                open_read_write(&path).map_err(|source| open_error(&path, source))?
            }
            Err(source) => return Err(open_error(&path, source)),
        };

        let queries = read_count(&mut file, &path)?;
        info!(
            path = %path.display(),
            queries,
            "Query count was read from the persistent storage file"
        );

        Ok(Self {
            path,
            fsync,
            state: Mutex::new(CounterState { queries, file }),
        })
    }

    /// Increment the count, persist it, and return the new value.
    ///
    /// The lock is held across the write, so concurrent callers observe a
    /// total order of increments. If the write fails the in-memory count has
    /// already advanced and stays ahead of the file until the next restart.
    pub fn increment_and_get(&self) -> Result<u64, StorageError> {
        let mut state = self.lock();

        let queries = state
            .queries
            .checked_add(1)
            .ok_or(StorageError::Exhausted(state.queries))?;
        state.queries = queries;

        if let Err(source) = persist(&mut state.file, queries, self.fsync) {
            error!(path = %self.path.display(), queries, error = %source, "Failed to persist query count");
            return Err(StorageError::Write {
                path: self.path.clone(),
                source,
            });
        }

        trace!(queries, "Query count persisted");
        Ok(queries)
    }

    /// Current in-memory count
    pub fn current(&self) -> u64 {
        self.lock().queries
    }

    /// Location of the counter file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        // Poisoning is ignored: each increment rewrites the whole file.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swap the backing handle, e.g. for one that rejects writes
    #[cfg(test)]
    pub(crate) fn replace_file(&self, file: File) {
        self.lock().file = file;
    }
}

fn open_read_write(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

fn create_initial(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(INITIAL_CONTENT)?;
    file.flush()
}

fn open_error(path: &Path, source: io::Error) -> StorageError {
    StorageError::Open {
        path: path.to_path_buf(),
        source,
    }
}

/// Parse the stored count, tolerating surrounding whitespace
fn read_count(file: &mut File, path: &Path) -> Result<u64, StorageError> {
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    content
        .trim()
        .parse::<u64>()
        .map_err(|_| StorageError::Corrupt {
            path: path.to_path_buf(),
            content,
        })
}

/// Rewrite the file from offset 0 and cut off anything past the new digits
fn persist(file: &mut File, queries: u64, fsync: bool) -> io::Result<()> {
    let digits = queries.to_string();
    file.seek(SeekFrom::Start(0))?;
    file.write_all(digits.as_bytes())?;
    file.set_len(digits.len() as u64)?;
    file.flush()?;
    if fsync {
        file.sync_data()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn file_content(store: &CounterStore) -> String {
        std::fs::read_to_string(store.path()).unwrap()
    }

    #[test]
    fn test_open_creates_file_with_zero() {
        let dir = TempDir::new().unwrap();
        let store = CounterStore::open(dir.path(), false).unwrap();

        assert_eq!(store.current(), 0);
        assert_eq!(store.path(), dir.path().join(COUNTER_FILENAME));
        assert_eq!(file_content(&store), "0");
    }

    #[test]
    fn test_sequential_increments_persist() {
        let dir = TempDir::new().unwrap();
        let store = CounterStore::open(dir.path(), false).unwrap();

        for k in 1..=25u64 {
            assert_eq!(store.increment_and_get().unwrap(), k);
            assert_eq!(file_content(&store), k.to_string());
        }
    }

    #[test]
    fn test_restart_resumes_count() {
        let dir = TempDir::new().unwrap();
        {
            let store = CounterStore::open(dir.path(), true).unwrap();
            for _ in 0..7 {
                store.increment_and_get().unwrap();
            }
        }

        let store = CounterStore::open(dir.path(), false).unwrap();
        assert_eq!(store.current(), 7);
        assert_eq!(store.increment_and_get().unwrap(), 8);
    }

    #[test]
    fn test_reads_value_with_trailing_newline() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(COUNTER_FILENAME), "41\n").unwrap();

        let store = CounterStore::open(dir.path(), false).unwrap();
        assert_eq!(store.increment_and_get().unwrap(), 42);
        assert_eq!(file_content(&store), "42");
    }

    #[test]
    fn test_no_stale_digits_after_shorter_value() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(COUNTER_FILENAME), "99999").unwrap();
        let store = CounterStore::open(dir.path(), false).unwrap();

        // Simulate an operator resetting the count under a running store
        {
            let mut state = store.lock();
            state.queries = 4;
        }
        assert_eq!(store.increment_and_get().unwrap(), 5);
        assert_eq!(file_content(&store), "5");

        drop(store);
        let store = CounterStore::open(dir.path(), false).unwrap();
        assert_eq!(store.current(), 5);
    }

    #[test]
    fn test_corrupt_content_fails() {
        for content in ["abc", "", "-1", "12abc", "18446744073709551616"] {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join(COUNTER_FILENAME), content).unwrap();

            match CounterStore::open(dir.path(), false) {
                Err(StorageError::Corrupt { content: found, .. }) => assert_eq!(found, content),
                Err(other) => panic!("unexpected error for {content:?}: {other}"),
                Ok(_) => panic!("content {content:?} should not parse"),
            }
        }
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");

        assert!(matches!(
            CounterStore::open(&missing, false),
            Err(StorageError::Open { .. })
        ));
    }

    #[test]
    fn test_exhausted_counter() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(COUNTER_FILENAME), u64::MAX.to_string()).unwrap();
        let store = CounterStore::open(dir.path(), false).unwrap();

        assert!(matches!(
            store.increment_and_get(),
            Err(StorageError::Exhausted(u64::MAX))
        ));
        assert_eq!(store.current(), u64::MAX);
        assert_eq!(file_content(&store), u64::MAX.to_string());
    }

    #[test]
    fn test_write_failure_keeps_count_advanced() {
        let dir = TempDir::new().unwrap();
        let store = CounterStore::open(dir.path(), false).unwrap();
        assert_eq!(store.increment_and_get().unwrap(), 1);

        store.replace_file(File::open(store.path()).unwrap());

        match store.increment_and_get() {
            Err(StorageError::Write { path, .. }) => assert_eq!(path, store.path()),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(store.current(), 2);
        assert_eq!(file_content(&store), "1");

        // Writes resume once the file is writable again
        store.replace_file(open_read_write(store.path()).unwrap());
        assert_eq!(store.increment_and_get().unwrap(), 3);
        assert_eq!(file_content(&store), "3");
    }

    #[test]
    fn test_concurrent_increments_are_contiguous() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(COUNTER_FILENAME), "10").unwrap();
        let store = Arc::new(CounterStore::open(dir.path(), false).unwrap());

        let threads = 8;
        let per_thread = 50;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..per_thread)
                        .map(|_| store.increment_and_get().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "duplicate value {value}");
            }
        }

        let total = (threads * per_thread) as u64;
        let expected: HashSet<u64> = (11..=10 + total).collect();
        assert_eq!(seen, expected);
        assert_eq!(file_content(&store), (10 + total).to_string());
    }
}
