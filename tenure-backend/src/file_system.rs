use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tenure_core::{LockBackend, LockRecord, LockSpec, Result, TenureError, Version, WriteOutcome};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

const RECORD_EXTENSION: &str = "lease";
const GUARD_EXTENSION: &str = "guard";
const BREAKER_EXTENSION: &str = "guard.break";

/// On-disk envelope around a lock record.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    checksum: u32,
    record: LockRecord,
}

impl StoredRecord {
    fn seal(record: LockRecord) -> Result<Self> {
        let checksum = crc32fast::hash(&serde_json::to_vec(&record)?);
        Ok(Self { checksum, record })
    }

    fn open(self, lock: &str) -> Result<LockRecord> {
        let actual = crc32fast::hash(&serde_json::to_vec(&self.record)?);
        if actual != self.checksum {
            return Err(TenureError::malformed(
                lock,
                format!(
                    "checksum mismatch: expected {}, got {}",
                    self.checksum, actual
                ),
            ));
        }
        Ok(self.record)
    }
}

/// Exclusive guard file held for the duration of one conditional write.
///
/// The file carries a token unique to its holder and is only removed while
/// it still carries that token.
struct Guard {
    path: PathBuf,
    token: String,
}

impl Drop for Guard {
    fn drop(&mut self) {
        match std::fs::read(&self.path) {
            Ok(token) if token == self.token.as_bytes() => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!("Failed to remove guard file {}: {}", self.path.display(), e);
                }
            }
            Ok(_) => warn!("Guard file {} was replaced while held", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Guard file {} was broken while held", self.path.display())
            }
            Err(e) => warn!("Failed to read guard file {}: {}", self.path.display(), e),
        }
    }
}

/// What a writer can see of a guard file it does not hold.
#[derive(Debug, PartialEq, Eq)]
struct GuardStamp {
    token: Vec<u8>,
    modified: SystemTime,
}

/// File-based lock backend.
///
/// Each lock is a JSON document `<dir>/<lock>.lease` carrying a CRC32
/// checksum. Writes go to a temporary file that is then renamed over the
/// record, so readers never observe a torn record. Conditional writes are
/// serialized across processes sharing the directory with a guard file that
/// is linked into place only if absent; a guard older than the stale
/// threshold is assumed to belong to a crashed writer and is broken.
#[derive(Debug, Clone)]
pub struct FileSystemBackend {
    dir: PathBuf,
    guard_retry: Duration,
    guard_attempts: u32,
    stale_guard_after: Duration,
}

impl FileSystemBackend {
    /// Create a new file-based backend.
    ///
    /// # Arguments
    /// * `dir` - Directory holding the lock records, created if missing
    ///
    /// # Errors
    /// * Returns error if the directory cannot be created
    pub async fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();

        if !dir.exists() {
            fs::create_dir_all(dir).await.map_err(|e| {
                TenureError::backend(format!("Failed to create lock directory: {}", e))
            })?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            guard_retry: Duration::from_millis(10),
            guard_attempts: 50,
            stale_guard_after: Duration::from_secs(5),
        })
    }

    pub fn with_stale_guard_after(mut self, after: Duration) -> Self {
        self.stale_guard_after = after;
        self
    }

    pub fn with_guard_retry(mut self, interval: Duration, attempts: u32) -> Self {
        self.guard_retry = interval;
        self.guard_attempts = attempts.max(1);
        self
    }

    pub fn record_path(&self, lock: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_stem(lock), RECORD_EXTENSION))
    }

    fn guard_path(&self, lock: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_stem(lock), GUARD_EXTENSION))
    }

    fn breaker_path(&self, lock: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_stem(lock), BREAKER_EXTENSION))
    }

    async fn load(&self, lock: &str) -> Result<Option<LockRecord>> {
        let data = match fs::read(self.record_path(lock)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TenureError::backend(format!(
                    "Failed to read lock file: {}",
                    e
                )))
            }
        };

        let stored: StoredRecord = serde_json::from_slice(&data)
            .map_err(|e| TenureError::malformed(lock, format!("undecodable record: {}", e)))?;

        stored.open(lock).map(Some)
    }

    async fn store(&self, lock: &str, record: LockRecord) -> Result<()> {
        let path = self.record_path(lock);
        let temp_path = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(&StoredRecord::seal(record)?)?;

        fs::write(&temp_path, data).await.map_err(|e| {
            TenureError::backend(format!("Failed to write lock to temp file: {}", e))
        })?;

        fs::rename(&temp_path, &path).await.map_err(|e| {
            TenureError::backend(format!("Failed to rename temp file to lock file: {}", e))
        })?;

        Ok(())
    }

    async fn guard(&self, lock: &str) -> Result<Guard> {
        let path = self.guard_path(lock);

        for _ in 0..self.guard_attempts {
            if let Some(guard) = self.try_guard(&path).await? {
                return Ok(guard);
            }
            if !self.break_if_stale(lock).await? {
                tokio::time::sleep(self.guard_retry).await;
            }
        }

        Err(TenureError::unavailable(format!(
            "lock {} is busy: guard held by another writer",
            lock
        )))
    }

    /// Create the guard at `path`, or return `None` if one already exists.
    ///
    /// The token is written to a private file first and hard-linked into
    /// place, so a guard is never visible without its token.
    async fn try_guard(&self, path: &Path) -> Result<Option<Guard>> {
        let token = Uuid::new_v4().to_string();
        let mut staging = path.as_os_str().to_owned();
        staging.push(".");
        staging.push(&token);
        let staging = PathBuf::from(staging);

        fs::write(&staging, token.as_bytes()).await?;
        let linked = fs::hard_link(&staging, path).await;
        if let Err(e) = fs::remove_file(&staging).await {
            warn!("Failed to remove staging file {}: {}", staging.display(), e);
        }

        match linked {
            Ok(()) => Ok(Some(Guard {
                path: path.to_path_buf(),
                token,
            })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(TenureError::Io(e)),
        }
    }

    /// Remove the guard of `lock` if its holder looks crashed.
    ///
    /// Breakers take turns under a guard of their own and re-check the
    /// stamp under it, so a guard judged stale is never mistaken for the
    /// fresh guard of the writer that replaced it.
    async fn break_if_stale(&self, lock: &str) -> Result<bool> {
        let path = self.guard_path(lock);
        let observed = match self.stale_stamp(&path).await {
            Some(stamp) => stamp,
            None => return Ok(false),
        };

        let breaker_path = self.breaker_path(lock);
        let breaker = match self.try_guard(&breaker_path).await? {
            Some(breaker) => breaker,
            None => {
                // Left behind by a breaker that crashed mid-break
                if self.stale_stamp(&breaker_path).await.is_some() {
                    warn!("Removing stale breaker {}", breaker_path.display());
                    if let Err(e) = fs::remove_file(&breaker_path).await {
                        debug!("Stale breaker already gone: {}", e);
                    }
                }
                return Ok(false);
            }
        };

        let broken = if self.stale_stamp(&path).await.as_ref() == Some(&observed) {
            warn!("Breaking stale guard {}", path.display());
            match fs::remove_file(&path).await {
                Ok(()) => true,
                Err(e) if e.kind() == ErrorKind::NotFound => true,
                Err(e) => return Err(TenureError::Io(e)),
            }
        } else {
            false
        };

        drop(breaker);
        Ok(broken)
    }

    /// Stamp of the guard at `path` if it has outlived the stale threshold.
    async fn stale_stamp(&self, path: &Path) -> Option<GuardStamp> {
        let modified = fs::metadata(path)
            .await
            .and_then(|meta| meta.modified())
            .ok()?;
        let age = modified.elapsed().ok()?;
        if age <= self.stale_guard_after {
            return None;
        }

        let token = fs::read(path).await.ok()?;
        Some(GuardStamp { token, modified })
    }
}

#[async_trait]
impl LockBackend for FileSystemBackend {
    async fn read(&self, lock: &str) -> Result<Option<LockRecord>> {
        self.load(lock).await
    }

    async fn create_if_absent(&self, lock: &str, spec: LockSpec) -> Result<WriteOutcome> {
        let _guard = self.guard(lock).await?;

        if self.load(lock).await?.is_some() {
            return Ok(WriteOutcome::Conflict);
        }

        let version = Version::new(1);
        self.store(lock, LockRecord::new(spec, version)).await?;
        debug!("Created lock file for {} at {}", lock, version);
        Ok(WriteOutcome::Written(version))
    }

    async fn compare_and_swap(
        &self,
        lock: &str,
        spec: LockSpec,
        expected: Version,
    ) -> Result<WriteOutcome> {
        let _guard = self.guard(lock).await?;

        match self.load(lock).await? {
            Some(current) if current.version == expected => {
                let version = expected.next();
                self.store(lock, LockRecord::new(spec, version)).await?;
                Ok(WriteOutcome::Written(version))
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    fn describe(&self) -> String {
        format!("file backend at {}", self.dir.display())
    }
}

/// Map a lock name to a safe file name stem.
fn file_stem(lock: &str) -> String {
    lock.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
