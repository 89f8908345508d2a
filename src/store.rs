use crate::types::{DetectionRecord, RecordFilter};
use chrono::{Duration, Local, NaiveDateTime};
use failure::Error;
use log::{error, warn};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

const CSV_HEADER: &str = "timestamp,license_plate,image_path";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Current local time at the store's microsecond resolution, so a record
/// compares equal to its persisted form.
pub fn now_timestamp() -> NaiveDateTime {
    use chrono::Timelike;
    let now = Local::now().naive_local();
    now.with_nanosecond(now.nanosecond() / 1000 * 1000).unwrap_or(now)
}

/// Append-only detection record store. Implementations must serialize every
/// backing-medium access behind a single mutual-exclusion resource; the
/// duplicate check and the subsequent append for one detection event happen
/// under one acquisition via `record_if_fresh`.
pub trait RecordStore: Send + Sync {
    /// Creates the backing medium (with header) if absent. Idempotent. The
    /// only store operation whose failure is fatal to startup.
    fn ensure_initialized(&self) -> Result<(), Error>;

    /// True iff a record for `plate` exists with a timestamp inside the
    /// trailing `(now - window_secs, now]` interval. Read failures degrade
    /// to `false` and are logged.
    fn has_recent(&self, plate: &str, window_secs: i64) -> bool;

    /// Appends one record, creating the backing file if necessary. Existing
    /// rows are never rewritten.
    fn append(&self, record: &DetectionRecord) -> Result<(), Error>;

    /// The atomic check-and-append: under a single lock acquisition, checks
    /// the duplicate window and, only if no recent sighting exists, invokes
    /// `make` to produce the record (writing its artifact) and appends it.
    /// Returns `Ok(None)` for a suppressed duplicate.
    fn record_if_fresh(
        &self,
        plate: &str,
        window_secs: i64,
        make: &mut dyn FnMut() -> Result<DetectionRecord, Error>,
    ) -> Result<Option<DetectionRecord>, Error>;

    /// Full scan in insertion order. I/O failure yields an empty list.
    fn list_all(&self) -> Vec<DetectionRecord>;

    /// Conjunctive filtered scan in insertion order.
    fn list_filtered(&self, filter: &RecordFilter) -> Vec<DetectionRecord>;

    /// First record (insertion order) whose plate contains `fragment`,
    /// case-insensitively.
    fn find_first(&self, fragment: &str) -> Option<DetectionRecord>;
}

/// CSV-file-backed store: UTF-8, comma-separated, header first, one row per
/// record. Field values never contain commas or quotes by construction.
pub struct CsvStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CsvStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Callers below hold the lock for the full operation.

    fn read_records_locked(&self) -> Result<Vec<DetectionRecord>, Error> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for line in contents.lines() {
            if line.is_empty() || line == CSV_HEADER {
                continue;
            }
            match parse_row(line) {
                Some(record) => records.push(record),
                None => warn!("Skipping malformed store row: {}", line),
            }
        }
        Ok(records)
    }

    fn append_row_locked(&self, record: &DetectionRecord) -> Result<(), Error> {
        if !self.path.exists() {
            self.create_with_header_locked()?;
        }
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", format_row(record))?;
        Ok(())
    }

    fn create_with_header_locked(&self) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        writeln!(file, "{}", CSV_HEADER)?;
        Ok(())
    }

    fn has_recent_locked(&self, plate: &str, window_secs: i64) -> bool {
        let records = match self.read_records_locked() {
            Ok(records) => records,
            Err(e) => {
                // Fail open: an unreadable store must not drop detections.
                error!("Failed to read detection store for duplicate check: {}", e);
                return false;
            }
        };
        let now = Local::now().naive_local();
        let cutoff = now - Duration::seconds(window_secs);
        records
            .iter()
            .any(|r| r.plate_number == plate && r.timestamp > cutoff && r.timestamp <= now)
    }
}

impl RecordStore for CsvStore {
    fn ensure_initialized(&self) -> Result<(), Error> {
        let _guard = self.lock();
        if !self.path.exists() {
            self.create_with_header_locked()?;
        }
        Ok(())
    }

    fn has_recent(&self, plate: &str, window_secs: i64) -> bool {
        let _guard = self.lock();
        self.has_recent_locked(plate, window_secs)
    }

    fn append(&self, record: &DetectionRecord) -> Result<(), Error> {
        let _guard = self.lock();
        self.append_row_locked(record)
    }

    fn record_if_fresh(
        &self,
        plate: &str,
        window_secs: i64,
        make: &mut dyn FnMut() -> Result<DetectionRecord, Error>,
    ) -> Result<Option<DetectionRecord>, Error> {
        // One guard across check and append, so concurrent sightings of the
        // same plate serialize and exactly one of them writes a record.
        let _guard = self.lock();
        if self.has_recent_locked(plate, window_secs) {
            return Ok(None);
        }
        let record = make()?;
        self.append_row_locked(&record)?;
        Ok(Some(record))
    }

    fn list_all(&self) -> Vec<DetectionRecord> {
        let _guard = self.lock();
        self.read_records_locked().unwrap_or_else(|e| {
            error!("Failed to read detection store: {}", e);
            Vec::new()
        })
    }

    fn list_filtered(&self, filter: &RecordFilter) -> Vec<DetectionRecord> {
        let fragment = filter.plate_fragment.as_ref().map(|f| f.to_lowercase());
        self.list_all()
            .into_iter()
            .filter(|r| filter.start.map_or(true, |start| r.timestamp >= start))
            .filter(|r| filter.end.map_or(true, |end| r.timestamp <= end))
            .filter(|r| {
                fragment
                    .as_ref()
                    .map_or(true, |f| r.plate_number.to_lowercase().contains(f))
            })
            .collect()
    }

    fn find_first(&self, fragment: &str) -> Option<DetectionRecord> {
        let fragment = fragment.to_lowercase();
        self.list_all()
            .into_iter()
            .find(|r| r.plate_number.to_lowercase().contains(&fragment))
    }
}

fn format_row(record: &DetectionRecord) -> String {
    format!(
        "{},{},{}",
        record.timestamp.format(TIMESTAMP_FORMAT),
        record.plate_number,
        record.image_path
    )
}

fn parse_row(line: &str) -> Option<DetectionRecord> {
    let mut fields = line.splitn(3, ',');
    let timestamp = fields.next()?;
    let plate_number = fields.next()?;
    let image_path = fields.next()?;
    let timestamp = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Some(DetectionRecord {
        timestamp,
        plate_number: plate_number.to_string(),
        image_path: image_path.to_string(),
    })
}
