//! Durable lock table shared by every worker process
//!
//! The table is one JSON document mapping test id → lock entry. It is the
//! cross-process source of truth for device availability.
//!
//! ## Concurrency Control
//!
//! Every mutation runs as read-merge-write while holding an advisory
//! exclusive `flock` on a sidecar `<table>.lock` file. Writes are staged in a
//! temp file in the same directory and renamed over the table, so readers
//! never observe a partially written document.
//!
//! This holds for processes on one host whose filesystem honours `flock`.
//! On non-Unix targets only the atomic rename applies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::device::Platform;
use crate::error::LabError;

/// Poll interval while another process holds the table lock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Maximum random jitter added to each poll
const LOCK_POLL_JITTER_MS: u64 = 25;

/// One persisted allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    pub platform: Platform,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
}

/// test id → lock entry, ordered for stable on-disk output
pub type LockMap = BTreeMap<String, LockEntry>;

#[derive(Debug, thiserror::Error)]
pub enum LockTableError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Lock table {path} is not valid JSON: {reason}")]
    Parse { path: String, reason: String },

    #[error("Timed out after {elapsed_ms}ms waiting for lock on {path}")]
    Timeout { path: String, elapsed_ms: u128 },
}

impl LockTableError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<LockTableError> for LabError {
    fn from(err: LockTableError) -> Self {
        LabError::IoFailure(err.to_string())
    }
}

/// Handle on the lock table file
#[derive(Debug, Clone)]
pub struct LockTable {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl LockTable {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let mut lock_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "device-locks.json".into());
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);

        Self {
            path,
            lock_path,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the exclusive table lock, polling with jitter until the
    /// configured timeout elapses.
    pub fn lock(&self) -> Result<LockTableGuard<'_>, LockTableError> {
        ensure_parent_dir(&self.lock_path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| {
                LockTableError::io(
                    format!("opening lock file {}", self.lock_path.display()),
                    e,
                )
            })?;

        let start = Instant::now();
        loop {
            let acquired = try_flock_exclusive(&file).map_err(|e| {
                LockTableError::io(format!("locking {}", self.lock_path.display()), e)
            })?;
            if acquired {
                debug!(path = %self.path.display(), "Acquired lock table");
                return Ok(LockTableGuard {
                    table: self,
                    _lock_file: file,
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= self.lock_timeout {
                return Err(LockTableError::Timeout {
                    path: self.lock_path.display().to_string(),
                    elapsed_ms: elapsed.as_millis(),
                });
            }
            let jitter_ms = rand::random::<u64>() % (LOCK_POLL_JITTER_MS + 1);
            std::thread::sleep(LOCK_POLL_INTERVAL + Duration::from_millis(jitter_ms));
        }
    }

    /// Read the table without taking the lock (diagnostics only).
    ///
    /// A missing file is an empty table.
    pub fn snapshot(&self) -> Result<LockMap, LockTableError> {
        read_table(&self.path)
    }

    /// Remove entries older than `older_than`, or every entry when `None`.
    /// Returns the removed entries.
    pub fn clear(&self, older_than: Option<Duration>) -> Result<LockMap, LockTableError> {
        let guard = self.lock()?;
        let mut entries = guard.load()?;
        let removed = match older_than {
            Some(ttl) => take_stale(&mut entries, ttl, Utc::now()),
            None => std::mem::take(&mut entries),
        };
        if !removed.is_empty() {
            guard.store(&entries)?;
        }
        Ok(removed)
    }
}

/// Exclusive hold on the lock table; the `flock` is released on drop when
/// the lock file descriptor closes.
pub struct LockTableGuard<'a> {
    table: &'a LockTable,
    _lock_file: File,
}

impl LockTableGuard<'_> {
    /// Read the current table contents
    pub fn load(&self) -> Result<LockMap, LockTableError> {
        read_table(&self.table.path)
    }

    /// Replace the table contents
    pub fn store(&self, entries: &LockMap) -> Result<(), LockTableError> {
        let data = serde_json::to_vec_pretty(entries).map_err(|e| LockTableError::Parse {
            path: self.table.path.display().to_string(),
            reason: e.to_string(),
        })?;
        atomic_write(&self.table.path, &data)
    }
}

/// Split off entries whose timestamp is older than `ttl` relative to `now`
pub fn take_stale(entries: &mut LockMap, ttl: Duration, now: DateTime<Utc>) -> LockMap {
    // A TTL too large for chrono can never be exceeded
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return LockMap::new();
    };
    let stale_ids: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| now.signed_duration_since(entry.timestamp) > ttl)
        .map(|(test_id, _)| test_id.clone())
        .collect();

    stale_ids
        .into_iter()
        .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
        .collect()
}

fn read_table(path: &Path) -> Result<LockMap, LockTableError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockMap::new()),
        Err(e) => {
            return Err(LockTableError::io(
                format!("reading lock table {}", path.display()),
                e,
            ))
        }
    };

    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(LockMap::new());
    }

    serde_json::from_slice(&content).map_err(|e| LockTableError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), LockTableError> {
    let parent = parent_dir(path);
    fs::create_dir_all(parent)
        .map_err(|e| LockTableError::io(format!("creating directory {}", parent.display()), e))
}

/// Write to a temp file in the target's directory, then rename over the target
fn atomic_write(target: &Path, data: &[u8]) -> Result<(), LockTableError> {
    ensure_parent_dir(target)?;
    let parent = parent_dir(target);

    let temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        LockTableError::io(format!("creating temp file in {}", parent.display()), e)
    })?;

    let mut file = temp.as_file();
    file.write_all(data).map_err(|e| {
        LockTableError::io(format!("writing temp file for {}", target.display()), e)
    })?;
    file.sync_all().map_err(|e| {
        LockTableError::io(format!("syncing temp file for {}", target.display()), e)
    })?;

    temp.persist(target).map_err(|e| {
        LockTableError::io(format!("renaming temp file to {}", target.display()), e.error)
    })?;
    Ok(())
}

/// Try to take an exclusive `flock` without blocking.
///
/// `Ok(false)` means another process holds it.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file` for the duration of
        // the call; LOCK_EX | LOCK_NB never blocks.
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        tracing::warn!("Advisory file locks unavailable on this platform; relying on atomic writes only");
        Ok(true)
    }
}
