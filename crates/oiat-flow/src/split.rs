//! Date split and the spill store.
//!
//! A downloaded POS export can span several days. The splitter assigns
//! every raw row to exactly one business date and routes it to one of
//! three places: a per-date split file in staging (in-range), a spill
//! file (future dates, kept for a later run), or the past-drop counter
//! (dates before the requested window, which belong to prior runs).
//! Summary rows emitted by the POS ("Total:" lines) are dropped before
//! any accounting so totals are not double-counted.
//!
//! Row conservation holds by construction:
//! `total = in_range + future + past + null + summary_dropped`.
//!
//! Spill files are immutable once a split completes. When a later run
//! processes their date, the spill is concatenated after the day's split
//! file (header once) into a combined file; the spill itself is archived
//! only after that date succeeds.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tracing::{info, warn};

use oiat_core::business_date::{trading_date_for, Cutoff};
use oiat_core::paths::StateDir;
use oiat_core::{Error, Result};

/// Timestamp formats the POS export has been observed to use.
const TIMESTAMP_FORMATS: [&str; 2] = ["%d/%m/%Y %H:%M:%S", "%Y-%m-%d %H:%M:%S"];
const DATE_FORMATS: [&str; 2] = ["%d/%m/%Y", "%Y-%m-%d"];

/// Where split output goes and how dates are assigned.
#[derive(Debug, Clone)]
pub struct SplitPlan {
    /// First requested date, inclusive.
    pub from: NaiveDate,
    /// Last requested date, inclusive.
    pub to: NaiveDate,
    /// Staging directory for split and combined files.
    pub staging_dir: PathBuf,
    /// Spill directory for this tenant.
    pub spill_dir: PathBuf,
    /// Trading-day cutoff; `None` means calendar dates.
    pub trading_day: Option<Cutoff>,
}

impl SplitPlan {
    /// The inclusive list of requested dates.
    #[must_use]
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates = Vec::new();
        let mut current = self.from;
        while current <= self.to {
            dates.push(current);
            current += chrono::Duration::days(1);
        }
        dates
    }
}

/// Row counters for one split pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitStats {
    /// Rows read from the raw file (after summary-row drop).
    pub total_rows: u64,
    /// Rows written to in-range split files.
    pub in_range_rows: u64,
    /// Rows written to future spill files.
    pub future_rows: u64,
    /// Rows for dates before the window (logged, discarded).
    pub past_rows: u64,
    /// Rows with unparseable timestamps (logged, discarded).
    pub null_rows: u64,
    /// POS summary rows dropped before accounting.
    pub summary_rows_dropped: u64,
    /// Per-date in-range row counts.
    pub rows_by_date: BTreeMap<NaiveDate, u64>,
    /// Per-date spill row counts.
    pub spill_by_date: BTreeMap<NaiveDate, u64>,
    /// Distinct past dates observed.
    pub past_dates: BTreeSet<NaiveDate>,
    /// Rows reassigned backwards by the trading-day cutoff, per target date.
    pub pre_cutoff_reassigned: BTreeMap<NaiveDate, u64>,
}

/// Result of a split pass.
#[derive(Debug)]
pub struct SplitOutcome {
    /// Split file per in-range date that had rows.
    pub split_files: BTreeMap<NaiveDate, PathBuf>,
    /// Spill file per future date.
    pub spill_files: BTreeMap<NaiveDate, PathBuf>,
    /// Row counters.
    pub stats: SplitStats,
}

/// Statistics from merging a spill file into a split file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    /// Rows from the split file.
    pub base_rows: u64,
    /// Rows from the spill file.
    pub spill_rows: u64,
    /// Rows in the combined file.
    pub total_rows: u64,
}

/// Splits a raw multi-day CSV into per-date files plus future spills.
///
/// Pre-existing split/combined files for the requested dates are removed
/// first so a retried run cannot append duplicates.
///
/// # Errors
///
/// Returns `InvalidInput` when the CSV has no usable timestamp column,
/// `Io`/`Storage` on filesystem failures.
pub fn split_by_date(raw_csv: &Path, plan: &SplitPlan) -> Result<SplitOutcome> {
    fs::create_dir_all(&plan.staging_dir)
        .map_err(|e| Error::io(plan.staging_dir.display().to_string(), e))?;

    clear_existing_outputs(plan)?;

    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(raw_csv)
        .map_err(|e| Error::storage(format!("open raw csv {}: {e}", raw_csv.display())))?;

    let headers = reader
        .headers()
        .map_err(|e| Error::storage(format!("read csv headers: {e}")))?
        .clone();

    let date_col = ["Date/Time", "Date"]
        .iter()
        .find_map(|name| headers.iter().position(|h| h == *name))
        .ok_or_else(|| {
            Error::InvalidInput(
                "raw CSV must contain either a 'Date/Time' or a 'Date' column".to_string(),
            )
        })?;
    let staff_col = headers.iter().position(|h| h == "Staff");

    let mut stats = SplitStats::default();
    let mut writers = OutputWriters::new(&headers);

    for record in reader.records() {
        let record = record.map_err(|e| Error::storage(format!("read csv record: {e}")))?;

        if is_summary_row(&record, staff_col, date_col) {
            stats.summary_rows_dropped += 1;
            continue;
        }
        stats.total_rows += 1;

        let raw_value = record.get(date_col).unwrap_or("").trim();
        let Some(timestamp) = parse_timestamp(raw_value) else {
            stats.null_rows += 1;
            continue;
        };

        let (assigned, reassigned) = assign_date(timestamp, plan.trading_day);

        if assigned < plan.from {
            stats.past_rows += 1;
            stats.past_dates.insert(assigned);
        } else if assigned > plan.to {
            let path = plan
                .spill_dir
                .join(format!("BookKeeping_raw_spill_{assigned}.csv"));
            writers.append(&path, &plan.spill_dir, &record)?;
            stats.future_rows += 1;
            *stats.spill_by_date.entry(assigned).or_insert(0) += 1;
        } else {
            let path = plan.staging_dir.join(StateDir::split_file_name(assigned));
            writers.append(&path, &plan.staging_dir, &record)?;
            stats.in_range_rows += 1;
            *stats.rows_by_date.entry(assigned).or_insert(0) += 1;
            if reassigned {
                *stats.pre_cutoff_reassigned.entry(assigned).or_insert(0) += 1;
            }
        }
    }

    let (split_files, spill_files) = writers.finish(plan)?;

    if stats.summary_rows_dropped > 0 {
        info!(
            dropped = stats.summary_rows_dropped,
            "dropped POS summary rows from raw CSV"
        );
    }
    if stats.null_rows > 0 {
        warn!(rows = stats.null_rows, "rows with unparseable dates ignored");
    }
    if stats.past_rows > 0 {
        let dates: Vec<String> = stats.past_dates.iter().map(ToString::to_string).collect();
        info!(
            rows = stats.past_rows,
            dates = %dates.join(", "),
            "past drop: rows before the requested window discarded"
        );
    }
    for date in plan.dates() {
        match stats.rows_by_date.get(&date) {
            Some(count) => info!(%date, rows = count, "split file written"),
            None => warn!(%date, "no rows found for requested date"),
        }
    }
    for (date, count) in &stats.spill_by_date {
        info!(%date, rows = count, "raw spill file written for future date");
    }

    Ok(SplitOutcome {
        split_files,
        spill_files,
        stats,
    })
}

/// Concatenates a split file and its spill file into `combined_path`,
/// writing the header exactly once.
///
/// The spill file is read-only here; archival happens after the date
/// succeeds.
///
/// # Errors
///
/// Returns `SpillMerge` when either input cannot be read or the column
/// sets disagree.
pub fn merge_with_spill(
    split_file: &Path,
    spill_file: &Path,
    combined_path: &Path,
) -> Result<MergeStats> {
    let mut writer = WriterBuilder::new()
        .from_path(combined_path)
        .map_err(|e| Error::SpillMerge {
            message: format!("create combined file {}: {e}", combined_path.display()),
        })?;

    let mut header_written = false;
    let mut copy = |path: &Path| -> Result<u64> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| Error::SpillMerge {
                message: format!("open {}: {e}", path.display()),
            })?;
        if !header_written {
            let headers = reader.headers().map_err(|e| Error::SpillMerge {
                message: format!("read headers of {}: {e}", path.display()),
            })?;
            writer.write_record(headers).map_err(|e| Error::SpillMerge {
                message: format!("write combined header: {e}"),
            })?;
            header_written = true;
        }
        let mut rows = 0;
        for record in reader.records() {
            let record = record.map_err(|e| Error::SpillMerge {
                message: format!("read {}: {e}", path.display()),
            })?;
            writer.write_record(&record).map_err(|e| Error::SpillMerge {
                message: format!("write combined row: {e}"),
            })?;
            rows += 1;
        }
        Ok(rows)
    };

    let base_rows = copy(split_file)?;
    let spill_rows = copy(spill_file)?;
    writer.flush().map_err(|e| Error::SpillMerge {
        message: format!("flush combined file: {e}"),
    })?;

    Ok(MergeStats {
        base_rows,
        spill_rows,
        total_rows: base_rows + spill_rows,
    })
}

/// Counts the data rows of a CSV file.
///
/// # Errors
///
/// Returns `Storage` when the file cannot be read.
pub fn count_rows(path: &Path) -> Result<u64> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| Error::storage(format!("open {}: {e}", path.display())))?;
    let mut rows = 0;
    for record in reader.records() {
        record.map_err(|e| Error::storage(format!("read {}: {e}", path.display())))?;
        rows += 1;
    }
    Ok(rows)
}

fn clear_existing_outputs(plan: &SplitPlan) -> Result<()> {
    for date in plan.dates() {
        for name in [
            StateDir::split_file_name(date),
            StateDir::combined_file_name(date),
        ] {
            let path = plan.staging_dir.join(name);
            if path.is_file() {
                fs::remove_file(&path).map_err(|e| Error::io(path.display().to_string(), e))?;
                info!(file = %path.display(), "removed stale split file before write");
            }
        }
    }
    Ok(())
}

fn is_summary_row(record: &StringRecord, staff_col: Option<usize>, date_col: usize) -> bool {
    let Some(staff_col) = staff_col else {
        return false;
    };
    let staff = record
        .get(staff_col)
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if staff != "total:" && staff != "total" {
        return false;
    }
    record.get(date_col).unwrap_or("").trim().is_empty()
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    if value.is_empty() {
        return None;
    }
    for format in TIMESTAMP_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(12, 0, 0);
        }
    }
    None
}

/// Returns the assigned date and whether the cutoff reassigned it.
fn assign_date(timestamp: NaiveDateTime, trading_day: Option<Cutoff>) -> (NaiveDate, bool) {
    match trading_day {
        Some(cutoff) => {
            let assigned = trading_date_for(timestamp, cutoff);
            (assigned, assigned != timestamp.date())
        }
        None => (timestamp.date(), false),
    }
}

/// Lazily-created appenders, one per output file, header written once.
struct OutputWriters {
    headers: StringRecord,
    open: HashMap<PathBuf, csv::Writer<fs::File>>,
}

impl OutputWriters {
    fn new(headers: &StringRecord) -> Self {
        Self {
            headers: headers.clone(),
            open: HashMap::new(),
        }
    }

    fn append(&mut self, path: &Path, dir: &Path, record: &StringRecord) -> Result<()> {
        if !self.open.contains_key(path) {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir.display().to_string(), e))?;
            // First touch within this run truncates: a retried split must
            // replace leftovers from a failed attempt, never append to them.
            let file = fs::File::create(path)
                .map_err(|e| Error::io(path.display().to_string(), e))?;
            let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
            writer
                .write_record(&self.headers)
                .map_err(|e| Error::storage(format!("write header: {e}")))?;
            self.open.insert(path.to_path_buf(), writer);
        }
        self.open
            .get_mut(path)
            .expect("writer just inserted")
            .write_record(record)
            .map_err(|e| Error::storage(format!("write row to {}: {e}", path.display())))
    }

    fn finish(
        mut self,
        plan: &SplitPlan,
    ) -> Result<(BTreeMap<NaiveDate, PathBuf>, BTreeMap<NaiveDate, PathBuf>)> {
        for (path, writer) in &mut self.open {
            writer
                .flush()
                .map_err(|e| Error::storage(format!("flush {}: {e}", path.display())))?;
        }
        let mut split_files = BTreeMap::new();
        let mut spill_files = BTreeMap::new();
        for path in self.open.keys() {
            if path.starts_with(&plan.staging_dir) {
                if let Some(date) = date_from_name(path, "BookKeeping_") {
                    split_files.insert(date, path.clone());
                }
            } else if let Some(date) = date_from_name(path, "BookKeeping_raw_spill_") {
                spill_files.insert(date, path.clone());
            }
        }
        Ok((split_files, spill_files))
    }
}

fn date_from_name(path: &Path, prefix: &str) -> Option<NaiveDate> {
    let name = path.file_stem()?.to_str()?;
    name.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Date/Time,Staff,Item,TOTAL Sales\n";

    fn write_raw(dir: &Path, rows: &[&str]) -> PathBuf {
        let path = dir.join("BookKeeping_raw.csv");
        let mut contents = HEADER.to_string();
        for row in rows {
            contents.push_str(row);
            contents.push('\n');
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn plan(dir: &Path, from: &str, to: &str, trading: Option<Cutoff>) -> SplitPlan {
        SplitPlan {
            from: from.parse().unwrap(),
            to: to.parse().unwrap(),
            staging_dir: dir.join("staging"),
            spill_dir: dir.join("spill"),
            trading_day: trading,
        }
    }

    #[test]
    fn single_date_all_rows_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<String> = (0..500)
            .map(|i| format!("27/12/2025 {:02}:15:00,jane,Water,1000", i % 24))
            .collect();
        let row_refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let raw = write_raw(dir.path(), &row_refs);

        let outcome =
            split_by_date(&raw, &plan(dir.path(), "2025-12-27", "2025-12-27", None)).unwrap();

        assert_eq!(outcome.stats.total_rows, 500);
        assert_eq!(outcome.stats.in_range_rows, 500);
        assert_eq!(outcome.stats.future_rows, 0);
        assert_eq!(outcome.split_files.len(), 1);
        assert!(outcome.spill_files.is_empty());

        let split = &outcome.split_files[&"2025-12-27".parse().unwrap()];
        assert_eq!(count_rows(split).unwrap(), 500);
    }

    #[test]
    fn future_rows_become_spill() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows: Vec<String> = (0..500)
            .map(|_| "27/12/2025 13:00:00,jane,Water,1000".to_string())
            .collect();
        rows.extend((0..23).map(|_| "28/12/2025 09:00:00,jane,Water,1000".to_string()));
        let row_refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let raw = write_raw(dir.path(), &row_refs);

        let outcome =
            split_by_date(&raw, &plan(dir.path(), "2025-12-27", "2025-12-27", None)).unwrap();

        assert_eq!(outcome.stats.in_range_rows, 500);
        assert_eq!(outcome.stats.future_rows, 23);
        let spill_date: NaiveDate = "2025-12-28".parse().unwrap();
        let spill = &outcome.spill_files[&spill_date];
        assert!(spill
            .to_string_lossy()
            .ends_with("BookKeeping_raw_spill_2025-12-28.csv"));
        assert_eq!(count_rows(spill).unwrap(), 23);
    }

    #[test]
    fn past_rows_are_dropped_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_raw(
            dir.path(),
            &[
                "26/12/2025 10:00:00,jane,Water,1000",
                "27/12/2025 10:00:00,jane,Water,1000",
            ],
        );

        let outcome =
            split_by_date(&raw, &plan(dir.path(), "2025-12-27", "2025-12-27", None)).unwrap();

        assert_eq!(outcome.stats.past_rows, 1);
        assert_eq!(outcome.stats.in_range_rows, 1);
        assert!(outcome
            .stats
            .past_dates
            .contains(&"2025-12-26".parse().unwrap()));
    }

    #[test]
    fn summary_rows_are_dropped_before_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_raw(
            dir.path(),
            &[
                "27/12/2025 10:00:00,jane,Water,1000",
                ",Total:,,1000",
                "27/12/2025 11:00:00,joe,Bread,500",
            ],
        );

        let outcome =
            split_by_date(&raw, &plan(dir.path(), "2025-12-27", "2025-12-27", None)).unwrap();

        assert_eq!(outcome.stats.summary_rows_dropped, 1);
        assert_eq!(outcome.stats.total_rows, 2);
        assert_eq!(outcome.stats.in_range_rows, 2);
    }

    #[test]
    fn conservation_holds() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_raw(
            dir.path(),
            &[
                "26/12/2025 10:00:00,jane,Water,1000", // past
                "27/12/2025 10:00:00,jane,Water,1000", // in range
                "28/12/2025 10:00:00,jane,Water,1000", // future
                "garbage,jane,Water,1000",             // null
                ",Total:,,3000",                       // summary
            ],
        );

        let outcome =
            split_by_date(&raw, &plan(dir.path(), "2025-12-27", "2025-12-27", None)).unwrap();
        let s = &outcome.stats;
        assert_eq!(
            s.total_rows,
            s.in_range_rows + s.future_rows + s.past_rows + s.null_rows
        );
        assert_eq!(s.summary_rows_dropped, 1);
    }

    #[test]
    fn trading_day_cutoff_reassigns_pre_cutoff_rows() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_raw(
            dir.path(),
            &[
                "28/12/2025 04:59:00,jane,Water,1000", // before 05:00 -> 12-27
                "28/12/2025 05:00:00,jane,Water,1000", // at cutoff -> 12-28 (future)
                "27/12/2025 13:00:00,jane,Water,1000", // plain 12-27
            ],
        );

        let outcome = split_by_date(
            &raw,
            &plan(
                dir.path(),
                "2025-12-27",
                "2025-12-27",
                Some(Cutoff::new(5, 0)),
            ),
        )
        .unwrap();

        let target: NaiveDate = "2025-12-27".parse().unwrap();
        assert_eq!(outcome.stats.rows_by_date[&target], 2);
        assert_eq!(outcome.stats.pre_cutoff_reassigned[&target], 1);
        assert_eq!(outcome.stats.future_rows, 1);
    }

    #[test]
    fn merge_concatenates_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let split = dir.path().join("BookKeeping_2025-12-28.csv");
        let spill = dir.path().join("BookKeeping_raw_spill_2025-12-28.csv");
        fs::write(&split, format!("{HEADER}28/12/2025 10:00:00,jane,Water,1000\n")).unwrap();
        fs::write(
            &spill,
            format!("{HEADER}28/12/2025 09:00:00,joe,Bread,500\n28/12/2025 09:05:00,joe,Milk,700\n"),
        )
        .unwrap();

        let combined = dir.path().join("CombinedRaw_2025-12-28.csv");
        let stats = merge_with_spill(&split, &spill, &combined).unwrap();

        assert_eq!(
            stats,
            MergeStats {
                base_rows: 1,
                spill_rows: 2,
                total_rows: 3
            }
        );
        assert_eq!(count_rows(&combined).unwrap(), 3);
        // Spill remains untouched for a retry.
        assert!(spill.is_file());
        let contents = fs::read_to_string(&combined).unwrap();
        assert_eq!(contents.matches("Date/Time").count(), 1);
    }

    #[test]
    fn rerun_replaces_stale_split_files() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_raw(dir.path(), &["27/12/2025 10:00:00,jane,Water,1000"]);
        let p = plan(dir.path(), "2025-12-27", "2025-12-27", None);

        let first = split_by_date(&raw, &p).unwrap();
        let split = first.split_files[&"2025-12-27".parse().unwrap()].clone();
        assert_eq!(count_rows(&split).unwrap(), 1);

        // Second pass over the same raw file must not append.
        let second = split_by_date(&raw, &p).unwrap();
        assert_eq!(
            count_rows(&second.split_files[&"2025-12-27".parse().unwrap()]).unwrap(),
            1
        );
    }

    #[test]
    fn missing_date_column_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "Staff,Item\njane,Water\n").unwrap();
        let err = split_by_date(&path, &plan(dir.path(), "2025-12-27", "2025-12-27", None))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
