//! Per-run pipeline orchestrator.
//!
//! One run covers a (tenant, date-or-range) and walks an explicit state
//! machine:
//!
//! ```text
//! START → DOWNLOAD → SPLIT → per date: [MERGE → TRANSFORM → UPLOAD →
//!         RECONCILE → ARCHIVE] → END
//!                  ↘ SKIP_DOWNLOAD (reuse staged split files) ↗
//! ```
//!
//! Every transition emits a structured event. Range mode is fail-fast:
//! a date that fails aborts the remainder, but dates already archived
//! stay archived. Archival failures are warnings, not run failures,
//! because by that point the upload has already happened. Anything that
//! fails before archive leaves staging intact for inspection.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use tracing::{error, info, warn};

use oiat_core::business_date::Cutoff;
use oiat_core::{CompanyConfig, Error, Result, StateDir};
use oiat_qbo::QboClient;

use crate::download::PosDownloader;
use crate::events::{EventSink, PipelineEvent, PipelineEventData};
use crate::ledger::Ledger;
use crate::split::{self, SplitPlan};
use crate::transform::Transformer;
use crate::upload::{self, ReconcileOutcome, UploadOptions, UploadResult};

/// Soft per-phase duration budget; slower phases get a log warning.
const PHASE_SOFT_TIMEOUT_SECS: u64 = 600;

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Acquire the raw POS export.
    Download,
    /// Split the export into per-date files.
    Split,
    /// Merge carryover spill into the day's file.
    Merge,
    /// Normalize the raw rows into documents.
    Transform,
    /// Post documents to the remote service.
    Upload,
    /// Compare source and remote totals.
    Reconcile,
    /// Move processed files into the archive.
    Archive,
}

impl Phase {
    const fn label(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Split => "split",
            Self::Merge => "merge",
            Self::Transform => "transform",
            Self::Upload => "upload",
            Self::Reconcile => "reconcile",
            Self::Archive => "archive",
        }
    }
}

/// Requested processing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunScope {
    /// First date, inclusive.
    pub from: NaiveDate,
    /// Last date, inclusive.
    pub to: NaiveDate,
}

impl RunScope {
    /// Single-date scope.
    #[must_use]
    pub fn single(date: NaiveDate) -> Self {
        Self {
            from: date,
            to: date,
        }
    }

    /// Display form ("2025-12-27" or "2025-12-27..2025-12-29").
    #[must_use]
    pub fn display(&self) -> String {
        if self.from == self.to {
            self.from.to_string()
        } else {
            format!("{}..{}", self.from, self.to)
        }
    }
}

/// Operator-selectable behaviour for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reuse staged split files instead of downloading.
    pub skip_download: bool,
    /// Compute everything but issue no remote writes.
    pub dry_run: bool,
    /// Swap backdated-inventory lines to the fallback service item.
    pub bypass_inventory_start_date: bool,
    /// Reconciliation tolerance override (currency units).
    pub reconcile_tolerance: Option<f64>,
}

/// Per-date outcome.
#[derive(Debug, Clone)]
pub struct DateReport {
    /// The processed date.
    pub date: NaiveDate,
    /// Rows fed to the transformer.
    pub rows_in: u64,
    /// Upload counters and totals.
    pub upload: UploadResult,
}

/// Final outcome of one pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    /// Scope that was processed.
    pub scope: RunScope,
    /// Per-date results, in date order, for the dates that completed.
    pub dates: Vec<DateReport>,
    /// Whether a cancel request stopped the run early.
    pub cancelled: bool,
    /// Accumulated operator-facing warnings.
    pub warnings: Vec<String>,
}

/// Cooperative cancellation probe, checked between phases.
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Everything a run needs, wired once by the embedding process.
pub struct Pipeline {
    state: StateDir,
    config: CompanyConfig,
    downloader: Arc<dyn PosDownloader>,
    transformer: Arc<dyn Transformer>,
    client: QboClient,
    sink: Arc<dyn EventSink>,
    cancel: CancelCheck,
}

impl Pipeline {
    /// Builds a pipeline for one tenant.
    #[must_use]
    pub fn new(
        state: StateDir,
        config: CompanyConfig,
        downloader: Arc<dyn PosDownloader>,
        transformer: Arc<dyn Transformer>,
        client: QboClient,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            state,
            config,
            downloader,
            transformer,
            client,
            sink,
            cancel: Arc::new(|| false),
        }
    }

    /// Installs a cancellation probe.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelCheck) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the pipeline for one scope.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error; per-document failures and archive
    /// problems are reported through the result instead.
    pub async fn run(&self, scope: RunScope, options: &RunOptions) -> Result<PipelineReport> {
        let scope_str = scope.display();
        self.emit(&scope_str, PipelineEventData::PipelineStarted);
        info!(
            tenant = %self.config.company_key,
            scope = %scope_str,
            skip_download = options.skip_download,
            dry_run = options.dry_run,
            "pipeline started"
        );

        match self.run_inner(scope, options, &scope_str).await {
            Ok(report) => {
                if !report.cancelled {
                    self.emit(&scope_str, PipelineEventData::PipelineSucceeded);
                }
                Ok(report)
            }
            Err(e) => {
                let reason = e.failure_reason();
                error!(tenant = %self.config.company_key, scope = %scope_str, kind = e.kind(), "pipeline failed: {reason}");
                self.emit(&scope_str, PipelineEventData::PipelineFailed { reason });
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        scope: RunScope,
        options: &RunOptions,
        scope_str: &str,
    ) -> Result<PipelineReport> {
        let tenant_dir = self.config.dir_name();
        let staging_dir = self.state.staging_dir(&tenant_dir, scope.from, scope.to);
        let spill_dir = self.state.spill_dir(&tenant_dir);
        let trading = self.config.trading_day();
        let cutoff = trading
            .enabled
            .then(|| Cutoff::new(trading.start_hour, trading.start_minute));

        let mut report = PipelineReport {
            scope,
            dates: Vec::new(),
            cancelled: false,
            warnings: Vec::new(),
        };

        // DOWNLOAD + SPLIT (or discovery in skip-download mode).
        let mut original_download: Option<PathBuf> = None;
        let split_files: std::collections::BTreeMap<NaiveDate, PathBuf> = if options.skip_download
        {
            info!(staging = %staging_dir.display(), "skip-download: discovering staged split files");
            discover_staged_files(&staging_dir, scope)?
        } else {
            let started = Instant::now();
            let raw = self
                .downloader
                .download(
                    &self.config,
                    scope.from,
                    scope.to,
                    &self.state.downloads_dir(&tenant_dir),
                )
                .await?;
            self.phase_done(scope_str, Phase::Download, None, started);
            original_download = Some(raw.clone());

            let started = Instant::now();
            let plan = SplitPlan {
                from: scope.from,
                to: scope.to,
                staging_dir: staging_dir.clone(),
                spill_dir: spill_dir.clone(),
                trading_day: cutoff,
            };
            let outcome = split::split_by_date(&raw, &plan)?;
            self.phase_done(scope_str, Phase::Split, None, started);

            for (date, rows) in &outcome.stats.spill_by_date {
                self.emit(
                    scope_str,
                    PipelineEventData::SpillCreated {
                        date: *date,
                        rows: *rows,
                    },
                );
                report
                    .warnings
                    .push(format!("future raw spill: {date} ({rows} rows)"));
            }
            if outcome.stats.past_rows > 0 {
                self.emit(
                    scope_str,
                    PipelineEventData::PastRowsDropped {
                        rows: outcome.stats.past_rows,
                        dates: outcome.stats.past_dates.iter().copied().collect(),
                    },
                );
            }
            outcome.split_files
        };

        // Per-date inner sequence.
        for date in dates_of(scope) {
            if (self.cancel)() {
                warn!(tenant = %self.config.company_key, %date, "cancel requested; stopping before next date");
                report.cancelled = true;
                return Ok(report);
            }

            let date_report = self
                .process_date(
                    date,
                    scope_str,
                    split_files.get(&date).cloned(),
                    &staging_dir,
                    options,
                    &mut report.warnings,
                )
                .await?;
            match date_report {
                Some(date_report) => report.dates.push(date_report),
                None => {
                    // Cancelled mid-date: staging stays for the retry, the
                    // ledger was not touched past this point.
                    report.cancelled = true;
                    return Ok(report);
                }
            }
        }

        // Range archival of the original download happens only after every
        // date completed.
        if let Some(original) = original_download {
            if let Err(e) = self.archive_original(&original, scope) {
                warn!("could not archive original download: {e}");
                report
                    .warnings
                    .push(format!("original download not archived: {}", e.failure_reason()));
            }
        }
        remove_dir_if_empty(&staging_dir);

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_date(
        &self,
        date: NaiveDate,
        scope_str: &str,
        split_file: Option<PathBuf>,
        staging_dir: &Path,
        options: &RunOptions,
        warnings: &mut Vec<String>,
    ) -> Result<Option<DateReport>> {
        let spill_file = {
            let path = self.state.spill_file(&self.config.dir_name(), date);
            path.is_file().then_some(path)
        };

        // MERGE: combine the day's split file with carryover spill.
        let started = Instant::now();
        let (input_file, merged_spill) = match (split_file, spill_file) {
            (Some(split), Some(spill)) => {
                let combined = staging_dir.join(StateDir::combined_file_name(date));
                let stats = split::merge_with_spill(&split, &spill, &combined)?;
                self.emit(
                    scope_str,
                    PipelineEventData::SpillMerged {
                        date,
                        target_rows: stats.base_rows,
                        spill_rows: stats.spill_rows,
                        final_rows: stats.total_rows,
                    },
                );
                warnings.push(format!(
                    "{date}: merged split ({} rows) + raw spill ({} rows) -> {} rows",
                    stats.base_rows, stats.spill_rows, stats.total_rows
                ));
                (combined, Some(spill))
            }
            (Some(split), None) => (split, None),
            (None, Some(spill)) => {
                // The whole day's data arrived as spill from an earlier run.
                let combined = staging_dir.join(StateDir::combined_file_name(date));
                fs::create_dir_all(staging_dir)
                    .map_err(|e| Error::io(staging_dir.display().to_string(), e))?;
                fs::copy(&spill, &combined)
                    .map_err(|e| Error::io(spill.display().to_string(), e))?;
                let rows = split::count_rows(&combined)?;
                self.emit(
                    scope_str,
                    PipelineEventData::SpillMerged {
                        date,
                        target_rows: 0,
                        spill_rows: rows,
                        final_rows: rows,
                    },
                );
                (combined, Some(spill))
            }
            (None, None) => {
                // No data at all for this date: succeed with zero counts.
                warn!(tenant = %self.config.company_key, %date, "no rows for date; empty result");
                let upload = empty_upload_result();
                self.emit_upload_events(scope_str, date, &upload);
                return Ok(Some(DateReport {
                    date,
                    rows_in: 0,
                    upload,
                }));
            }
        };
        self.phase_done(scope_str, Phase::Merge, Some(date), started);

        if (self.cancel)() {
            warn!(tenant = %self.config.company_key, %date, "cancel requested; rolling back in-flight date");
            return Ok(None);
        }

        // TRANSFORM.
        let started = Instant::now();
        let transformer = Arc::clone(&self.transformer);
        let outcome = transformer.transform(&input_file, &self.config, date, staging_dir)?;
        self.phase_done(scope_str, Phase::Transform, Some(date), started);

        // UPLOAD.
        let started = Instant::now();
        let ledger_path = self
            .state
            .ledger_file(&self.config.dir_name(), &self.config.output.ledger_file);
        let mut ledger = Ledger::load(ledger_path)?;
        let upload_options = UploadOptions {
            dry_run: options.dry_run,
            trading_day_mode: self.config.trading_day().enabled,
            bypass_inventory_start_date: options.bypass_inventory_start_date,
            reconcile_tolerance: options.reconcile_tolerance.unwrap_or(1.0),
        };
        let upload_result = upload::upload(
            &self.client,
            &mut ledger,
            &outcome.normalized_path,
            &self.config,
            date,
            &upload_options,
        )
        .await?;
        self.phase_done(scope_str, Phase::Upload, Some(date), started);
        warnings.extend(upload_result.warnings.iter().cloned());
        self.emit_upload_events(scope_str, date, &upload_result);

        // ARCHIVE: failures are warnings, the upload already happened.
        if !options.dry_run {
            let started = Instant::now();
            if let Err(e) = self.archive_date(date, &outcome.normalized_path, merged_spill.as_deref(), staging_dir) {
                warn!(%date, "archive failed: {e}");
                warnings.push(format!("{date}: archive failed ({})", e.failure_reason()));
            } else {
                self.phase_done(scope_str, Phase::Archive, Some(date), started);
            }
        }

        info!(tenant = %self.config.company_key, %date, "date completed");
        Ok(Some(DateReport {
            date,
            rows_in: outcome.rows_in,
            upload: upload_result,
        }))
    }

    /// Moves a processed date's files into `Uploaded/<date>/`.
    fn archive_date(
        &self,
        date: NaiveDate,
        normalized: &Path,
        merged_spill: Option<&Path>,
        staging_dir: &Path,
    ) -> Result<()> {
        let archive_dir = self.state.archive_dir(date);
        fs::create_dir_all(&archive_dir)
            .map_err(|e| Error::Archive {
                message: format!("create {}: {e}", archive_dir.display()),
            })?;

        let mut move_in = |source: &Path, prefix: &str| -> Result<()> {
            if !source.is_file() {
                return Ok(());
            }
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let dest = archive_dir.join(format!("{prefix}{name}"));
            if dest.exists() {
                warn!(file = %dest.display(), "archive target already exists, leaving source");
                return Ok(());
            }
            fs::rename(source, &dest).map_err(|e| Error::Archive {
                message: format!("move {} -> {}: {e}", source.display(), dest.display()),
            })
        };

        let split_path = staging_dir.join(StateDir::split_file_name(date));
        move_in(&split_path, "RAW_SPLIT_")?;
        let combined_path = staging_dir.join(StateDir::combined_file_name(date));
        move_in(&combined_path, "RAW_COMBINED_")?;
        if let Some(spill) = merged_spill {
            move_in(spill, "RAW_SPILL_")?;
        }
        move_in(normalized, "")?;
        move_in(&staging_dir.join("transform_metadata.json"), "")?;
        Ok(())
    }

    fn archive_original(&self, original: &Path, scope: RunScope) -> Result<()> {
        let archive_dir = self.state.archive_dir(scope.to);
        fs::create_dir_all(&archive_dir).map_err(|e| Error::Archive {
            message: format!("create {}: {e}", archive_dir.display()),
        })?;
        if !original.is_file() {
            return Ok(());
        }
        let name = original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dest = archive_dir.join(format!("ORIGINAL_{name}"));
        if dest.exists() {
            return Ok(());
        }
        fs::rename(original, &dest).map_err(|e| Error::Archive {
            message: format!("move {} -> {}: {e}", original.display(), dest.display()),
        })
    }

    fn emit_upload_events(&self, scope_str: &str, date: NaiveDate, upload: &UploadResult) {
        self.emit(
            scope_str,
            PipelineEventData::UploadSummary {
                date,
                attempted: upload.attempted,
                created: upload.created,
                skipped: upload.skipped_dup,
                failed: upload.failed,
                source_total: upload.source_total,
            },
        );
        self.emit(
            scope_str,
            PipelineEventData::Reconcile {
                date,
                status: crate::notify::reconcile_label(upload.reconcile).to_string(),
                source_total: upload.source_total,
                remote_total: upload.remote_total,
                diff: upload.difference,
            },
        );
    }

    fn phase_done(&self, scope_str: &str, phase: Phase, date: Option<NaiveDate>, started: Instant) {
        let duration = started.elapsed();
        if duration.as_secs() > PHASE_SOFT_TIMEOUT_SECS {
            warn!(
                phase = phase.label(),
                secs = duration.as_secs(),
                "phase exceeded its soft time budget"
            );
        }
        self.emit(
            scope_str,
            PipelineEventData::PhaseCompleted {
                phase: phase.label().to_string(),
                date,
                duration_ms: duration.as_millis() as u64,
            },
        );
    }

    fn emit(&self, scope_str: &str, data: PipelineEventData) {
        let event = PipelineEvent::new(&self.config.company_key, scope_str, data);
        self.sink.emit(&event);
    }
}

fn dates_of(scope: RunScope) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut current = scope.from;
    while current <= scope.to {
        dates.push(current);
        current += chrono::Duration::days(1);
    }
    dates
}

fn empty_upload_result() -> UploadResult {
    UploadResult {
        attempted: 0,
        skipped_dup: 0,
        created: 0,
        failed: 0,
        created_doc_numbers: Vec::new(),
        source_total: 0.0,
        remote_total: 0.0,
        difference: 0.0,
        reconcile: ReconcileOutcome::Match,
        warnings: Vec::new(),
    }
}

fn remove_dir_if_empty(dir: &Path) {
    if fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(false) {
        let _ = fs::remove_dir(dir);
    }
}

/// Finds staged split files for skip-download mode, preferring combined
/// files over plain splits.
fn discover_staged_files(
    staging_dir: &Path,
    scope: RunScope,
) -> Result<std::collections::BTreeMap<NaiveDate, PathBuf>> {
    if !staging_dir.is_dir() {
        return Err(Error::InvalidInput(format!(
            "skip-download: staging directory {} does not exist",
            staging_dir.display()
        )));
    }
    let mut files = std::collections::BTreeMap::new();
    for date in dates_of(scope) {
        let combined = staging_dir.join(StateDir::combined_file_name(date));
        let split = staging_dir.join(StateDir::split_file_name(date));
        if combined.is_file() {
            files.insert(date, combined);
        } else if split.is_file() {
            files.insert(date, split);
        }
    }
    if files.is_empty() {
        return Err(Error::InvalidInput(format!(
            "skip-download: no staged split files for {} in {}",
            scope.display(),
            staging_dir.display()
        )));
    }
    Ok(files)
}
