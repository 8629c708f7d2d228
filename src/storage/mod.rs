//! Bounded on-disk spool of batches awaiting retry.

mod record;

use crate::{Batch, Destination, StorageConfig};
use record::{RecordKey, TEMP_EXTENSION};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, SystemTime},
};
use tracing::{debug, warn};

const STALE_TEMP_FILE_AGE: Duration = Duration::from_secs(5 * 60);

/// Errors reported by [`PersistedBatchStore`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// Storing the batch would exceed the configured quota.
    #[error("local storage is full ({max_bytes} bytes, {max_files} files)")]
    CapacityExceeded {
        /// Configured byte quota.
        max_bytes: u64,
        /// Configured file quota.
        max_files: usize,
    },

    /// Reading or writing a record failed.
    #[error("local storage i/o failed with {0}")]
    Io(#[from] io::Error),

    /// A record on disk could not be decoded.
    #[error("corrupt record {file_name}: {reason}")]
    CorruptRecord {
        /// Name of the record file.
        file_name: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Handle to a record file in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    key: RecordKey,
    path: PathBuf,
    size: u64,
}

impl PersistedRecord {
    /// Path of the record file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the record file in bytes.
    pub fn size_in_bytes(&self) -> u64 {
        self.size
    }

    /// Time the record was enqueued, in milliseconds since the Unix epoch.
    pub fn enqueued_at_millis(&self) -> i64 {
        self.key.millis
    }
}

/// A record claimed by [`PersistedBatchStore::dequeue_oldest`] together with its batch.
#[derive(Debug, Clone)]
pub struct PersistedBatch {
    /// Handle used to delete or release the record.
    pub record: PersistedRecord,
    /// Decoded batch.
    pub batch: Batch,
}

impl PersistedBatch {
    /// Split into record handle and batch.
    pub fn into_parts(self) -> (PersistedRecord, Batch) {
        (self.record, self.batch)
    }
}

/// Snapshot of the store's failure counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Records that could not be written.
    pub write_failures: u64,
    /// Records that could not be read.
    pub read_failures: u64,
    /// Records purged because they could not be decoded.
    pub corrupt_purged: u64,
    /// Records purged because they were older than the configured expiry.
    pub expired_purged: u64,
    /// Enqueue attempts rejected because the store was full.
    pub capacity_rejections: u64,
}

#[derive(Debug, Default)]
struct Counters {
    write_failures: AtomicU64,
    read_failures: AtomicU64,
    corrupt_purged: AtomicU64,
    expired_purged: AtomicU64,
    capacity_rejections: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Queue order. Records that were never requeued come first, by enqueue time. Requeued records
/// follow in the order they were requeued.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueuePosition {
    round: u64,
    key: RecordKey,
}

#[derive(Debug, Clone)]
struct Slot {
    size: u64,
    round: u64,
    /// Known once the record was written or read by this store.
    destination: Option<Destination>,
}

impl Slot {
    fn unread(size: u64) -> Self {
        Slot {
            size,
            round: 0,
            destination: None,
        }
    }
}

/// Tracks every record file known to the store. `bytes` and `files` include records that are
/// still being written, so concurrent producers can't overshoot the quota together.
#[derive(Debug, Default)]
struct Index {
    queued: BTreeMap<QueuePosition, Slot>,
    rounds: HashMap<RecordKey, u64>,
    leased: HashMap<RecordKey, Slot>,
    unreadable: HashMap<RecordKey, u64>,
    pending_writes: HashSet<String>,
    pending_deletions: BTreeMap<RecordKey, u64>,
    last_round: u64,
    bytes: u64,
    files: usize,
}

impl Index {
    fn contains(&self, key: &RecordKey) -> bool {
        self.rounds.contains_key(key)
            || self.leased.contains_key(key)
            || self.unreadable.contains_key(key)
            || self.pending_deletions.contains_key(key)
            || self.pending_writes.contains(&key.file_name)
    }

    fn queue(&mut self, key: RecordKey, slot: Slot) {
        let round = slot.round;
        self.rounds.insert(key.clone(), round);
        self.queued.insert(QueuePosition { round, key }, slot);
    }

    fn unqueue(&mut self, key: &RecordKey) -> Option<Slot> {
        let round = self.rounds.remove(key)?;
        self.queued.remove(&QueuePosition {
            round,
            key: key.clone(),
        })
    }

    /// Remove the first queued record whose destination is unknown or passes `ready`.
    fn pop_ready(
        &mut self,
        mut ready: impl FnMut(&Destination) -> bool,
    ) -> Option<(RecordKey, Slot)> {
        let position = self
            .queued
            .iter()
            .find(|(_, slot)| {
                slot.destination
                    .as_ref()
                    .map_or(true, |destination| ready(destination))
            })
            .map(|(position, _)| position.clone())?;
        let slot = self.queued.remove(&position)?;
        self.rounds.remove(&position.key);
        Some((position.key, slot))
    }

    fn take(&mut self, key: &RecordKey) -> Option<u64> {
        self.unqueue(key)
            .map(|slot| slot.size)
            .or_else(|| self.leased.remove(key).map(|slot| slot.size))
            .or_else(|| self.unreadable.remove(key))
            .or_else(|| self.pending_deletions.remove(key))
    }

    fn track(&mut self, size: u64) {
        self.bytes += size;
        self.files += 1;
    }

    fn untrack(&mut self, size: u64) {
        self.bytes = self.bytes.saturating_sub(size);
        self.files = self.files.saturating_sub(1);
    }
}

/// A bounded directory of immutable batch files.
///
/// Every batch is written to its own file, first under a temporary name and then renamed, so a
/// reader never observes a partially written record. An in-memory index orders records by enqueue
/// time and makes sure a record is handed out to at most one reader at a time.
///
/// Files that could not be deleted (e.g. because another process holds them open) are remembered
/// and removed later, at the latest when the store is dropped.
pub struct PersistedBatchStore {
    directory: PathBuf,
    max_bytes: u64,
    max_files: usize,
    expiry: Duration,
    sequence: AtomicU64,
    index: Mutex<Index>,
    counters: Counters,
}

impl fmt::Debug for PersistedBatchStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistedBatchStore")
            .field("directory", &self.directory)
            .field("max_bytes", &self.max_bytes)
            .field("max_files", &self.max_files)
            .finish()
    }
}

impl PersistedBatchStore {
    /// Open the store, creating its directory if needed, and pick up records left by earlier
    /// runs.
    pub fn open(config: StorageConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.directory)?;
        let store = PersistedBatchStore {
            directory: config.directory,
            max_bytes: config.max_bytes,
            max_files: config.max_files,
            expiry: config.expiry,
            sequence: AtomicU64::new(0),
            index: Mutex::new(Index::default()),
            counters: Counters::default(),
        };

        let recovered = store.reconcile()?;
        let next_sequence = store
            .lock()
            .rounds
            .keys()
            .map(|key| key.sequence + 1)
            .max()
            .unwrap_or(0);
        store.sequence.store(next_sequence, Ordering::Relaxed);
        if recovered > 0 {
            debug!(
                directory = %store.directory.display(),
                records = recovered,
                "recovered persisted telemetry"
            );
        }

        Ok(store)
    }

    /// Directory holding the record files.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write the batch to a new record file.
    pub fn enqueue(&self, batch: &Batch) -> Result<PersistedRecord, StoreError> {
        let encoded = record::encode(batch).map_err(|err| {
            Counters::bump(&self.counters.write_failures, 1);
            StoreError::Io(err.into())
        })?;
        let size = encoded.len() as u64;
        let key = RecordKey::new(
            now_millis(SystemTime::now()),
            self.sequence.fetch_add(1, Ordering::Relaxed),
            rand::random(),
        );

        {
            let mut index = self.lock();
            if index.bytes + size > self.max_bytes || index.files >= self.max_files {
                Counters::bump(&self.counters.capacity_rejections, 1);
                return Err(StoreError::CapacityExceeded {
                    max_bytes: self.max_bytes,
                    max_files: self.max_files,
                });
            }
            index.track(size);
            index.pending_writes.insert(key.file_name.clone());
        }

        let path = self.directory.join(&key.file_name);
        let written = self.write_atomically(&key, &path, &encoded);

        let mut index = self.lock();
        index.pending_writes.remove(&key.file_name);
        match written {
            Ok(()) => {
                let slot = Slot {
                    size,
                    round: 0,
                    destination: Some(batch.destination().clone()),
                };
                index.queue(key.clone(), slot);
                Ok(PersistedRecord { key, path, size })
            }
            Err(err) => {
                index.untrack(size);
                Counters::bump(&self.counters.write_failures, 1);
                Err(err.into())
            }
        }
    }

    fn write_atomically(&self, key: &RecordKey, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix(key.temp_prefix())
            .suffix(TEMP_EXTENSION)
            .tempfile_in(&self.directory)?;
        file.write_all(contents)?;
        file.as_file().sync_all()?;
        file.persist_noclobber(path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Claim the oldest record that is neither claimed nor being written.
    ///
    /// The record stays on disk until it is [deleted](Self::delete). Records that fail to decode
    /// are purged and skipped; records that can't be read are skipped until the next
    /// [`reconcile`](Self::reconcile).
    pub fn dequeue_oldest(&self) -> Option<PersistedBatch> {
        self.dequeue_oldest_where(|_| true)
    }

    /// Like [`dequeue_oldest`](Self::dequeue_oldest), but skips records whose destination
    /// doesn't pass `ready`.
    ///
    /// Destinations are remembered for records written or read through this store, so skipped
    /// records are not read from disk. Records picked up by [`reconcile`](Self::reconcile) and
    /// never read are always considered.
    pub fn dequeue_oldest_where(
        &self,
        mut ready: impl FnMut(&Destination) -> bool,
    ) -> Option<PersistedBatch> {
        loop {
            let (key, size) = {
                let mut index = self.lock();
                let (key, slot) = index.pop_ready(&mut ready)?;
                let size = slot.size;
                index.leased.insert(key.clone(), slot);
                (key, size)
            };
            let record = PersistedRecord {
                path: self.directory.join(&key.file_name),
                key,
                size,
            };

            match read_record(&record) {
                Ok(batch) => {
                    if let Some(slot) = self.lock().leased.get_mut(&record.key) {
                        slot.destination
                            .get_or_insert_with(|| batch.destination().clone());
                    }
                    return Some(PersistedBatch { record, batch });
                }
                Err(StoreError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %record.path.display(), "persisted record vanished");
                    let mut index = self.lock();
                    if let Some(slot) = index.leased.remove(&record.key) {
                        index.untrack(slot.size);
                    }
                }
                Err(err @ StoreError::CorruptRecord { .. }) => {
                    warn!(error = %err, "purging corrupt persisted record");
                    Counters::bump(&self.counters.corrupt_purged, 1);
                    // Failures are retried later through pending deletions.
                    let _ = self.delete(&record);
                }
                Err(err) => {
                    warn!(
                        path = %record.path.display(),
                        error = %err,
                        "reading persisted record failed"
                    );
                    Counters::bump(&self.counters.read_failures, 1);
                    let mut index = self.lock();
                    if let Some(slot) = index.leased.remove(&record.key) {
                        index.unreadable.insert(record.key, slot.size);
                    }
                }
            }
        }
    }

    /// Return a claimed record to its place in the queue, e.g. when it was not attempted.
    pub fn release(&self, record: &PersistedRecord) {
        let mut index = self.lock();
        if let Some(slot) = index.leased.remove(&record.key) {
            index.queue(record.key.clone(), slot);
        }
    }

    /// Return a claimed record to the back of the queue after a transient delivery failure.
    ///
    /// Every record that was never requeued is handed out before it, so a record that keeps
    /// failing can't hold up the others.
    pub fn requeue(&self, record: &PersistedRecord) {
        let mut index = self.lock();
        if let Some(mut slot) = index.leased.remove(&record.key) {
            index.last_round += 1;
            slot.round = index.last_round;
            index.queue(record.key.clone(), slot);
        }
    }

    /// Remove the record file and forget about it.
    ///
    /// Deleting a record that is already gone is not an error. If the file can't be removed, the
    /// deletion is retried later and the record is never handed out again.
    pub fn delete(&self, record: &PersistedRecord) -> Result<(), StoreError> {
        let mut index = self.lock();
        let size = index.take(&record.key);
        match remove_file(&record.path) {
            Ok(()) => {
                if let Some(size) = size {
                    index.untrack(size);
                }
                Ok(())
            }
            Err(err) => {
                warn!(
                    path = %record.path.display(),
                    error = %err,
                    "deleting persisted record failed"
                );
                index
                    .pending_deletions
                    .insert(record.key.clone(), size.unwrap_or(record.size));
                if size.is_none() {
                    index.track(record.size);
                }
                Err(err.into())
            }
        }
    }

    /// Bring the index in line with the directory.
    ///
    /// Adds record files the index doesn't know about (left over from an earlier process),
    /// forgets queued records whose file is gone, gives unreadable records another chance,
    /// retries failed deletions and removes stale temporary files. Returns the number of records
    /// added.
    pub fn reconcile(&self) -> Result<usize, StoreError> {
        let mut index = self.lock();
        self.retry_pending_deletions(&mut index);

        let now = SystemTime::now();
        let mut on_disk = HashMap::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };

            if is_temp_file(&path) {
                let age = metadata
                    .modified()
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or_default();
                if age > STALE_TEMP_FILE_AGE {
                    debug!(path = %path.display(), "removing stale temporary file");
                    if let Err(err) = remove_file(&path) {
                        warn!(
                            path = %path.display(),
                            error = %err,
                            "removing stale temporary file failed"
                        );
                    }
                }
                continue;
            }

            if let Some(key) = RecordKey::from_path(&path) {
                on_disk.insert(key, metadata.len());
            }
        }

        let unreadable: Vec<_> = index.unreadable.drain().collect();
        for (key, size) in unreadable {
            index.queue(key, Slot::unread(size));
        }

        let missing: Vec<_> = index
            .rounds
            .keys()
            .filter(|key| !on_disk.contains_key(*key))
            .cloned()
            .collect();
        for key in missing {
            if let Some(slot) = index.unqueue(&key) {
                index.untrack(slot.size);
            }
        }

        let mut added = 0;
        for (key, size) in on_disk {
            if !index.contains(&key) {
                index.queue(key, Slot::unread(size));
                index.track(size);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Delete queued records enqueued longer ago than the configured expiry. Returns the number
    /// of records purged.
    pub fn purge_expired(&self, now: SystemTime) -> usize {
        let cutoff = match now.checked_sub(self.expiry) {
            Some(cutoff) => now_millis(cutoff),
            None => return 0,
        };

        let mut index = self.lock();
        self.retry_pending_deletions(&mut index);

        let expired: Vec<_> = index
            .rounds
            .keys()
            .filter(|key| key.millis < cutoff)
            .cloned()
            .collect();
        for key in &expired {
            let size = index.unqueue(key).map_or(0, |slot| slot.size);
            let path = self.directory.join(&key.file_name);
            match remove_file(&path) {
                Ok(()) => index.untrack(size),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "deleting expired record failed");
                    index.pending_deletions.insert(key.clone(), size);
                }
            }
        }

        if !expired.is_empty() {
            debug!(records = expired.len(), "purged expired persisted telemetry");
        }
        Counters::bump(&self.counters.expired_purged, expired.len() as u64);
        expired.len()
    }

    fn retry_pending_deletions(&self, index: &mut Index) {
        let pending = std::mem::take(&mut index.pending_deletions);
        for (key, size) in pending {
            match remove_file(&self.directory.join(&key.file_name)) {
                Ok(()) => index.untrack(size),
                Err(_) => {
                    index.pending_deletions.insert(key, size);
                }
            }
        }
    }

    /// Number of records in the store, including claimed ones.
    pub fn len(&self) -> usize {
        let index = self.lock();
        index.rounds.len() + index.leased.len() + index.unreadable.len()
    }

    /// Number of unclaimed records whose destination is known and passes `filter`.
    pub fn count_queued_where(&self, mut filter: impl FnMut(&Destination) -> bool) -> usize {
        self.lock()
            .queued
            .values()
            .filter_map(|slot| slot.destination.as_ref())
            .filter(|&destination| filter(destination))
            .count()
    }

    /// Returns `true` if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes used by record files, including files that are still being written.
    pub fn size_in_bytes(&self) -> u64 {
        self.lock().bytes
    }

    /// Failure counters since the store was opened.
    pub fn stats(&self) -> StoreStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StoreStats {
            write_failures: load(&self.counters.write_failures),
            read_failures: load(&self.counters.read_failures),
            corrupt_purged: load(&self.counters.corrupt_purged),
            expired_purged: load(&self.counters.expired_purged),
            capacity_rejections: load(&self.counters.capacity_rejections),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PersistedBatchStore {
    fn drop(&mut self) {
        let mut index = self.lock();
        self.retry_pending_deletions(&mut index);
        for key in index.pending_deletions.keys() {
            warn!(file_name = %key.file_name, "persisted record could not be deleted");
        }
    }
}

fn read_record(record: &PersistedRecord) -> Result<Batch, StoreError> {
    let contents = fs::read(&record.path)?;
    record::decode(contents).map_err(|err| StoreError::CorruptRecord {
        file_name: record.key.file_name.clone(),
        reason: err.to_string(),
    })
}

fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.ends_with(TEMP_EXTENSION))
}

fn now_millis(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |since_epoch| since_epoch.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Destination;
    use tempfile::TempDir;

    fn batch(payload: &'static str) -> Batch {
        Batch::new(
            Destination::new(
                "0fdcec70-0ce5-4085-89d9-9ae8ead9af66",
                http::Uri::from_static("https://dc.services.visualstudio.com/v2/track"),
            ),
            payload,
        )
    }

    fn open(dir: &TempDir) -> PersistedBatchStore {
        PersistedBatchStore::open(StorageConfig::new(dir.path())).unwrap()
    }

    fn payload(persisted: &PersistedBatch) -> &[u8] {
        persisted.batch.payload()
    }

    fn files_in(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn dequeues_in_enqueue_order() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.enqueue(&batch("first")).unwrap();
        store.enqueue(&batch("second")).unwrap();

        let first = store.dequeue_oldest().unwrap();
        let second = store.dequeue_oldest().unwrap();

        assert_eq!(b"first", payload(&first));
        assert_eq!(b"second", payload(&second));
        assert!(store.dequeue_oldest().is_none());
        assert_eq!(2, store.len());
    }

    #[test]
    fn writes_no_temporary_files() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let record = store.enqueue(&batch("payload")).unwrap();

        let files = files_in(&dir);
        assert_eq!(1, files.len());
        assert!(files[0].ends_with(".trn"));
        assert_eq!(record.size_in_bytes(), store.size_in_bytes());
    }

    #[test]
    fn released_record_is_handed_out_again() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.enqueue(&batch("payload")).unwrap();

        let persisted = store.dequeue_oldest().unwrap();
        assert!(store.dequeue_oldest().is_none());
        store.release(&persisted.record);

        assert_eq!(b"payload", payload(&store.dequeue_oldest().unwrap()));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.enqueue(&batch("first")).unwrap();
        store.enqueue(&batch("second")).unwrap();

        let (record, _) = store.dequeue_oldest().unwrap().into_parts();
        store.delete(&record).unwrap();
        store.delete(&record).unwrap();

        assert_eq!(1, store.len());
        assert_eq!(1, files_in(&dir).len());
        assert_eq!(b"second", payload(&store.dequeue_oldest().unwrap()));
    }

    #[test]
    fn rejects_batches_over_file_quota() {
        let dir = TempDir::new().unwrap();
        let store =
            PersistedBatchStore::open(StorageConfig::new(dir.path()).with_max_files(2)).unwrap();
        store.enqueue(&batch("1")).unwrap();
        store.enqueue(&batch("2")).unwrap();

        let err = store.enqueue(&batch("3")).unwrap_err();

        assert!(matches!(err, StoreError::CapacityExceeded { .. }));
        assert_eq!(2, files_in(&dir).len());
        assert_eq!(1, store.stats().capacity_rejections);
    }

    #[test]
    fn deleting_frees_capacity() {
        let dir = TempDir::new().unwrap();
        let store =
            PersistedBatchStore::open(StorageConfig::new(dir.path()).with_max_files(1)).unwrap();
        store.enqueue(&batch("1")).unwrap();
        store.enqueue(&batch("2")).unwrap_err();

        let (record, _) = store.dequeue_oldest().unwrap().into_parts();
        store.delete(&record).unwrap();

        store.enqueue(&batch("2")).unwrap();
    }

    #[test]
    fn rejects_batches_over_byte_quota() {
        let dir = TempDir::new().unwrap();
        let record_size = {
            let store = open(&dir);
            let record = store.enqueue(&batch("payload")).unwrap();
            store.delete(&record).unwrap();
            record.size_in_bytes()
        };
        let store = PersistedBatchStore::open(
            StorageConfig::new(dir.path()).with_max_bytes(record_size * 2 + 1),
        )
        .unwrap();

        store.enqueue(&batch("payload")).unwrap();
        store.enqueue(&batch("payload")).unwrap();
        store.enqueue(&batch("payload")).unwrap_err();

        assert!(store.size_in_bytes() <= record_size * 2 + 1);
    }

    #[test]
    fn reconcile_recovers_records_after_crash() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            for payload in ["a", "b", "c"] {
                store.enqueue(&batch(payload)).unwrap();
            }
        }

        let store = open(&dir);
        let mut payloads = Vec::new();
        while let Some(persisted) = store.dequeue_oldest() {
            payloads.push(persisted.batch.payload().to_vec());
        }

        assert_eq!(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()], payloads);
        assert_eq!(0, store.reconcile().unwrap());
    }

    #[test]
    fn reconcile_forgets_missing_files() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let record = store.enqueue(&batch("payload")).unwrap();
        fs::remove_file(record.path()).unwrap();

        store.reconcile().unwrap();

        assert!(store.is_empty());
        assert_eq!(0, store.size_in_bytes());
    }

    #[test]
    fn reconcile_adds_files_written_by_others() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let other = open(&dir);
        other.enqueue(&batch("payload")).unwrap();

        assert_eq!(1, store.reconcile().unwrap());
        assert_eq!(b"payload", payload(&store.dequeue_oldest().unwrap()));
    }

    #[test]
    fn reconcile_keeps_fresh_temporary_files() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        fs::write(dir.path().join("1-2-3.abc.tmp"), b"partial").unwrap();

        assert_eq!(0, store.reconcile().unwrap());
        assert_eq!(vec!["1-2-3.abc.tmp"], files_in(&dir));
        assert!(store.dequeue_oldest().is_none());
    }

    #[test]
    fn purges_corrupt_records() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("Transmission-legacy.trn"),
            b"\x010fdcec70-0ce5-4085-89d9-9ae8ead9af66payload",
        )
        .unwrap();
        let store = open(&dir);
        assert_eq!(1, store.len());

        assert!(store.dequeue_oldest().is_none());

        assert!(store.is_empty());
        assert!(files_in(&dir).is_empty());
        assert_eq!(1, store.stats().corrupt_purged);
    }

    #[test]
    fn purges_expired_records() {
        let dir = TempDir::new().unwrap();
        let store = PersistedBatchStore::open(
            StorageConfig::new(dir.path()).with_expiry(Duration::from_secs(60)),
        )
        .unwrap();
        store.enqueue(&batch("old")).unwrap();

        assert_eq!(0, store.purge_expired(SystemTime::now()));
        let purged = store.purge_expired(SystemTime::now() + Duration::from_secs(120));

        assert_eq!(1, purged);
        assert!(store.is_empty());
        assert!(files_in(&dir).is_empty());
        assert_eq!(1, store.stats().expired_purged);
    }

    #[test]
    fn purge_skips_claimed_records() {
        let dir = TempDir::new().unwrap();
        let store = PersistedBatchStore::open(
            StorageConfig::new(dir.path()).with_expiry(Duration::from_secs(60)),
        )
        .unwrap();
        store.enqueue(&batch("old")).unwrap();
        let persisted = store.dequeue_oldest().unwrap();

        assert_eq!(0, store.purge_expired(SystemTime::now() + Duration::from_secs(120)));
        store.delete(&persisted.record).unwrap();
    }

    #[test]
    fn requeued_record_goes_behind_others() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.enqueue(&batch("a")).unwrap();
        store.enqueue(&batch("b")).unwrap();

        let (record, _) = store.dequeue_oldest().unwrap().into_parts();
        store.requeue(&record);
        store.enqueue(&batch("c")).unwrap();

        let mut payloads = Vec::new();
        while let Some(persisted) = store.dequeue_oldest() {
            payloads.push(persisted.batch.payload().to_vec());
        }
        assert_eq!(vec![b"b".to_vec(), b"c".to_vec(), b"a".to_vec()], payloads);
    }

    #[test]
    fn skipped_destinations_are_not_read() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let other = Destination::new(
            "4d1c2b3a-0ce5-4085-89d9-9ae8ead9af66",
            http::Uri::from_static("https://dc.services.visualstudio.com/v2/track"),
        );
        let skipped = store.enqueue(&batch("skipped")).unwrap();
        store.enqueue(&Batch::new(other.clone(), "wanted")).unwrap();
        fs::write(skipped.path(), b"garbage").unwrap();

        let persisted = store
            .dequeue_oldest_where(|destination| *destination == other)
            .unwrap();

        assert_eq!(b"wanted", payload(&persisted));
        assert!(store
            .dequeue_oldest_where(|destination| *destination == other)
            .is_none());
        assert_eq!(1, store.count_queued_where(|destination| *destination != other));
        assert_eq!(0, store.stats().corrupt_purged);
    }

    #[test]
    fn reconcile_removes_stale_temporary_files() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let path = dir.path().join("1-2-3.abc.tmp");
        fs::write(&path, b"partial").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(10 * 60))
            .unwrap();

        assert_eq!(0, store.reconcile().unwrap());
        assert!(files_in(&dir).is_empty());
    }

    #[test]
    fn failed_delete_is_retried_and_never_handed_out() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let first = store.enqueue(&batch("first")).unwrap();
        let second = store.enqueue(&batch("second")).unwrap();

        let (record, _) = store.dequeue_oldest().unwrap().into_parts();
        // A non-empty directory in place of the record file can't be removed.
        fs::remove_file(record.path()).unwrap();
        fs::create_dir(record.path()).unwrap();
        fs::write(record.path().join("blocker"), b"x").unwrap();
        assert!(store.delete(&record).is_err());

        assert_eq!(1, store.len());
        assert_eq!(
            first.size_in_bytes() + second.size_in_bytes(),
            store.size_in_bytes()
        );
        store.reconcile().unwrap();
        let persisted = store.dequeue_oldest().unwrap();
        assert_eq!(b"second", payload(&persisted));
        assert!(store.dequeue_oldest().is_none());
        store.release(&persisted.record);

        fs::remove_dir_all(record.path()).unwrap();
        store.reconcile().unwrap();

        assert_eq!(1, store.len());
        assert_eq!(second.size_in_bytes(), store.size_in_bytes());
        let second_name = second.path().file_name().unwrap().to_string_lossy();
        assert_eq!(vec![second_name.into_owned()], files_in(&dir));
    }
}
