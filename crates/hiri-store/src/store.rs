//! Main store implementation.
//!
//! Each partition key owns one directory holding one JSONL file per day:
//!
//! ```text
//! <root>/<project_id>/<tabla>/<device_code>/<YYYY-MM-DD>.jsonl
//! ```
//!
//! Files are append-only. All mutations of a partition (append, rebuild,
//! purge) and the snapshot capture of reads are serialized by that
//! partition's mutex; different partitions never contend. File contents are
//! read outside the lock, bounded by the record counts of the captured
//! [`DayIndex`] snapshot, so a concurrent append can never shift a result.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hiri_types::{Day, DedupKey, PartitionKey, Reading, Timestamp, validate_component};

use crate::error::{Error, Result};
use crate::index::{DayIndex, RebuildReport};

const DAY_FILE_EXT: &str = "jsonl";

/// Direction of a paged read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    /// Newest day first, newest row first.
    #[default]
    #[serde(rename = "desc")]
    Descending,
    /// Oldest day first, oldest row first.
    #[serde(rename = "asc")]
    Ascending,
}

impl FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "desc" | "descending" => Ok(Self::Descending),
            "asc" | "ascending" => Ok(Self::Ascending),
            other => Err(format!("invalid order '{}': expected 'asc' or 'desc'", other)),
        }
    }
}

/// Outcome of a CSV import.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportResult {
    /// Rows that were new and have been stored.
    pub imported: usize,
    /// Valid rows already present in the cache.
    pub duplicates: usize,
    /// Rows without a usable timestamp.
    pub skipped: usize,
    /// The stored rows in time order.
    #[serde(skip)]
    pub rows: Vec<Reading>,
}

#[derive(Default)]
struct PartitionState {
    loaded: bool,
    seen: HashMap<Day, HashSet<DedupKey>>,
}

struct Partition {
    key: PartitionKey,
    dir: PathBuf,
    state: Mutex<PartitionState>,
    index: RwLock<Arc<DayIndex>>,
    writing: AtomicBool,
}

impl Partition {
    fn lock(&self) -> MutexGuard<'_, PartitionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Arc<DayIndex> {
        Arc::clone(&self.index.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn publish(&self, index: DayIndex) {
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(index);
    }

    fn day_path(&self, day: Day) -> PathBuf {
        day_path(&self.dir, day)
    }
}

/// Marks a partition as being written; a second concurrent writer is a bug.
struct WriteGuard<'a>(&'a AtomicBool);

impl<'a> WriteGuard<'a> {
    fn acquire(partition: &'a Partition) -> Result<Self> {
        if partition.writing.swap(true, AtomicOrdering::AcqRel) {
            return Err(Error::WriteConflict(partition.key.to_string()));
        }
        Ok(Self(&partition.writing))
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

/// Day-partitioned, append-only reading cache.
pub struct DayStore {
    root: PathBuf,
    partitions: Mutex<HashMap<PartitionKey, Arc<Partition>>>,
}

impl std::fmt::Debug for DayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DayStore").field("root", &self.root).finish()
    }
}

impl DayStore {
    /// Open or create a cache rooted at `root`.
    ///
    /// Fails if the directory cannot be created or written to.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| Error::CreateDirectory {
            path: root.clone(),
            source: e,
        })?;

        let check = root.join(".write-check");
        File::create(&check)
            .and_then(|mut f| f.write_all(b"ok"))
            .and_then(|_| fs::remove_file(&check))
            .map_err(|e| Error::NotWritable {
                path: root.clone(),
                source: e,
            })?;

        info!("Opened day cache at {}", root.display());
        Ok(Self {
            root,
            partitions: Mutex::new(HashMap::new()),
        })
    }

    /// Open the default cache location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_cache_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a partition's day files.
    pub fn partition_dir(&self, key: &PartitionKey) -> PathBuf {
        self.root
            .join(&key.project_id)
            .join(&key.tabla)
            .join(&key.device_code)
    }

    fn partition(&self, key: &PartitionKey) -> Arc<Partition> {
        let mut partitions = self
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let partition = partitions.entry(key.clone()).or_insert_with(|| {
            Arc::new(Partition {
                key: key.clone(),
                dir: self.partition_dir(key),
                state: Mutex::new(PartitionState::default()),
                index: RwLock::new(Arc::new(DayIndex::default())),
                writing: AtomicBool::new(false),
            })
        });
        Arc::clone(partition)
    }

    /// The partition handle, or `None` if nothing is known about it.
    fn existing_partition(&self, key: &PartitionKey) -> Option<Arc<Partition>> {
        let known = self
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key);
        if known || self.partition_dir(key).is_dir() {
            Some(self.partition(key))
        } else {
            None
        }
    }

    /// Capture the current index, loading it from disk on first access.
    fn capture(&self, partition: &Partition) -> Result<Arc<DayIndex>> {
        let mut state = partition.lock();
        if !state.loaded {
            rebuild_locked(partition, &mut state)?;
        }
        Ok(partition.snapshot())
    }

    // === Writes ===

    /// Append readings of one day; returns how many were new.
    pub fn append(&self, key: &PartitionKey, day: Day, readings: &[Reading]) -> Result<usize> {
        self.append_new(key, day, readings).map(|rows| rows.len())
    }

    /// Append readings of one day; returns the rows that were new.
    ///
    /// Readings whose dedup key is already stored for the day, or repeated
    /// within the batch, are dropped. New rows are stably sorted by time and
    /// written with a single write.
    pub fn append_new(
        &self,
        key: &PartitionKey,
        day: Day,
        readings: &[Reading],
    ) -> Result<Vec<Reading>> {
        if let Some(r) = readings.iter().find(|r| r.day() != day) {
            return Err(Error::DayMismatch {
                expected: day,
                found: r.day(),
                time: r.time.to_string(),
            });
        }

        let partition = self.partition(key);
        let mut state = partition.lock();
        if !state.loaded {
            rebuild_locked(&partition, &mut state)?;
        }
        let _guard = WriteGuard::acquire(&partition)?;

        let seen = state.seen.entry(day).or_default();
        let mut batch_keys = HashSet::new();
        let mut fresh: Vec<Reading> = readings
            .iter()
            .filter(|r| {
                let k = r.dedup_key();
                !seen.contains(&k) && batch_keys.insert(k)
            })
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(fresh);
        }
        fresh.sort_by_key(|r| r.time);

        let mut buf = String::new();
        for r in &fresh {
            buf.push_str(&serde_json::to_string(r)?);
            buf.push('\n');
        }

        fs::create_dir_all(&partition.dir).map_err(|e| Error::CreateDirectory {
            path: partition.dir.clone(),
            source: e,
        })?;
        let path = partition.day_path(day);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let committed = drop_partial_tail(&mut file, &path)?;
        if let Err(e) = file.write_all(buf.as_bytes()).and_then(|()| file.flush()) {
            if let Err(undo) = file.set_len(committed) {
                warn!(
                    "Could not roll back failed append to {}: {}",
                    path.display(),
                    undo
                );
            }
            return Err(e.into());
        }

        seen.extend(batch_keys);
        partition.publish(partition.snapshot().with_appended(day, &fresh));

        debug!("Appended {} readings to {} on {}", fresh.len(), key, day);
        Ok(fresh)
    }

    /// Group readings by day and append each group.
    ///
    /// Returns every newly stored row in time order.
    pub fn ingest(&self, key: &PartitionKey, readings: &[Reading]) -> Result<Vec<Reading>> {
        let mut by_day: BTreeMap<Day, Vec<Reading>> = BTreeMap::new();
        for r in readings {
            by_day.entry(r.day()).or_default().push(r.clone());
        }

        let mut inserted = Vec::new();
        for (day, rows) in by_day {
            inserted.extend(self.append_new(key, day, &rows)?);
        }
        inserted.sort_by_key(|r| r.time);

        if !inserted.is_empty() {
            info!("Stored {} new readings for {}", inserted.len(), key);
        }
        Ok(inserted)
    }

    // === Reads ===

    /// All rows of a day, sorted by time, optionally only those after `since`.
    ///
    /// Unknown partitions and days yield an empty result.
    pub fn read_day(
        &self,
        key: &PartitionKey,
        day: Day,
        since: Option<Timestamp>,
    ) -> Result<Vec<Reading>> {
        let Some(partition) = self.existing_partition(key) else {
            return Ok(Vec::new());
        };
        let count = self.capture(&partition)?.count(day);

        let mut rows = read_day_file(&partition.day_path(day), count)?;
        if let Some(since) = since {
            rows.retain(|r| r.time > since);
        }
        Ok(rows)
    }

    /// A page of rows across days.
    ///
    /// Days are walked newest to oldest for [`Order::Descending`] and oldest
    /// to newest for [`Order::Ascending`], rows within a day in the same
    /// direction.
    pub fn read_page(
        &self,
        key: &PartitionKey,
        limit: usize,
        offset: usize,
        order: Order,
    ) -> Result<Vec<Reading>> {
        let Some(partition) = self.existing_partition(key) else {
            return Ok(Vec::new());
        };
        let index = self.capture(&partition)?;

        let summaries: Vec<_> = match order {
            Order::Descending => index.summaries().rev().copied().collect(),
            Order::Ascending => index.summaries().copied().collect(),
        };

        let mut skip = offset;
        let mut page = Vec::with_capacity(limit.min(1024));
        for summary in summaries {
            if page.len() >= limit {
                break;
            }
            if skip >= summary.count {
                skip -= summary.count;
                continue;
            }

            let mut rows = read_day_file(&partition.day_path(summary.day), summary.count)?;
            if order == Order::Descending {
                rows.reverse();
            }
            let wanted = limit - page.len();
            page.extend(rows.into_iter().skip(skip).take(wanted));
            skip = 0;
        }
        Ok(page)
    }

    /// Days with stored rows, ascending.
    pub fn list_days(&self, key: &PartitionKey) -> Result<Vec<Day>> {
        Ok(self.day_index(key)?.days())
    }

    /// The current index snapshot of a partition.
    pub fn day_index(&self, key: &PartitionKey) -> Result<Arc<DayIndex>> {
        match self.existing_partition(key) {
            Some(partition) => self.capture(&partition),
            None => Ok(Arc::new(DayIndex::default())),
        }
    }

    /// Device codes with a cache directory under `project_id`/`tabla`.
    pub fn list_devices(&self, project_id: &str, tabla: &str) -> Result<Vec<String>> {
        let dir = self.root.join(project_id).join(tabla);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str()
                && validate_component("device_code", name).is_ok()
            {
                devices.push(name.to_string());
            }
        }
        devices.sort();
        Ok(devices)
    }

    // === Maintenance ===

    /// Rescan a partition's files and republish its index.
    pub fn rebuild_index(&self, key: &PartitionKey) -> Result<RebuildReport> {
        let partition = self.partition(key);
        let mut state = partition.lock();
        rebuild_locked(&partition, &mut state)
    }

    /// Delete every stored row of a partition.
    pub fn purge(&self, key: &PartitionKey) -> Result<()> {
        let partition = self.partition(key);
        let mut state = partition.lock();
        let _guard = WriteGuard::acquire(&partition)?;

        match fs::remove_dir_all(&partition.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        state.seen.clear();
        state.loaded = true;
        partition.publish(DayIndex::default());

        info!("Purged cache for {}", key);
        Ok(())
    }
}

/// Cut an unterminated last line off a day file so the next write starts on
/// a fresh line. Returns the resulting length.
fn drop_partial_tail(file: &mut File, path: &Path) -> Result<u64> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let keep = contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos as u64 + 1);
    file.set_len(keep)?;
    warn!(
        "Dropped {} bytes of an unterminated record at the end of {}",
        len - keep,
        path.display()
    );
    Ok(keep)
}

fn day_path(dir: &Path, day: Day) -> PathBuf {
    dir.join(format!("{}.{}", day, DAY_FILE_EXT))
}

/// Read the first `count` rows of a day file, sorted by time.
fn read_day_file(path: &Path, count: usize) -> Result<Vec<Reading>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut rows = Vec::with_capacity(count);
    for line in BufReader::new(file).lines().take(count) {
        let line = line?;
        match serde_json::from_str::<Reading>(&line) {
            Ok(r) => rows.push(r),
            Err(e) => warn!("Undecodable line in {}: {}", path.display(), e),
        }
    }
    rows.sort_by_key(|r| r.time);
    Ok(rows)
}

/// Scan every day file of a partition and republish its index and dedup state.
///
/// Must be called with the partition mutex held.
fn rebuild_locked(partition: &Partition, state: &mut PartitionState) -> Result<RebuildReport> {
    let _guard = WriteGuard::acquire(partition)?;
    let mut report = RebuildReport::default();
    let mut index = DayIndex::default();
    let mut seen: HashMap<Day, HashSet<DedupKey>> = HashMap::new();

    let entries = match fs::read_dir(&partition.dir) {
        Ok(entries) => Some(entries),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    for entry in entries.into_iter().flatten() {
        let path = entry?.path();
        let Some(day) = day_of_file(&path) else {
            debug!("Ignoring {} in cache", path.display());
            continue;
        };

        let scan = scan_day_file(&path, day)?;
        report.skipped_lines += scan.skipped;
        if scan.truncated {
            report.truncated_files += 1;
        }

        if scan.rows.is_empty() {
            fs::remove_file(&path)?;
            report.removed_files += 1;
            continue;
        }
        if scan.skipped > 0 {
            rewrite_day_file(&path, &scan.rows)?;
            report.compacted_files += 1;
        }

        report.days += 1;
        report.records += scan.rows.len();
        index.record(day, &scan.rows);
        seen.insert(day, scan.keys);
    }

    state.seen = seen;
    state.loaded = true;
    partition.publish(index);

    info!(
        "Indexed {} records over {} days for {}",
        report.records, report.days, partition.key
    );
    Ok(report)
}

fn day_of_file(path: &Path) -> Option<Day> {
    if path.extension()?.to_str()? != DAY_FILE_EXT {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

struct DayScan {
    rows: Vec<Reading>,
    keys: HashSet<DedupKey>,
    skipped: usize,
    truncated: bool,
}

fn scan_day_file(path: &Path, day: Day) -> Result<DayScan> {
    let bytes = fs::read(path)?;
    let complete = match bytes.iter().rposition(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };

    let truncated = complete < bytes.len();
    if truncated {
        warn!(
            "Truncating partial record at end of {} ({} bytes)",
            path.display(),
            bytes.len() - complete
        );
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(complete as u64)?;
    }

    let mut scan = DayScan {
        rows: Vec::new(),
        keys: HashSet::new(),
        skipped: 0,
        truncated,
    };
    let body = &bytes[..complete];
    let body = body.strip_suffix(b"\n").unwrap_or(body);
    if body.is_empty() {
        return Ok(scan);
    }
    for line in body.split(|b| *b == b'\n') {
        // blank lines would throw off count-bounded reads
        if line.is_empty() {
            scan.skipped += 1;
            continue;
        }
        match serde_json::from_slice::<Reading>(line) {
            Ok(r) if r.day() == day && scan.keys.insert(r.dedup_key()) => scan.rows.push(r),
            Ok(r) => {
                debug!(
                    "Dropping duplicate or misplaced row at {} in {}",
                    r.time,
                    path.display()
                );
                scan.skipped += 1;
            }
            Err(e) => {
                warn!("Skipping undecodable line in {}: {}", path.display(), e);
                scan.skipped += 1;
            }
        }
    }
    Ok(scan)
}

/// Replace a day file with exactly `rows`, via a temporary file and rename.
fn rewrite_day_file(path: &Path, rows: &[Reading]) -> Result<()> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = File::create(&tmp)?;
        for r in rows {
            serde_json::to_writer(&mut file, r)?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
