//! POS export acquisition seam.
//!
//! The production downloader drives a headless browser against the POS
//! portal; that binary is an external collaborator. The orchestrator only
//! needs "produce a raw CSV for this tenant and window", so that is the
//! whole trait. Tests and skip-download mode use the filesystem-backed
//! implementations.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::info;

use oiat_core::{CompanyConfig, Error, Result};

/// Produces raw POS exports.
#[async_trait]
pub trait PosDownloader: Send + Sync {
    /// Downloads the raw CSV covering `[from, to]` for one tenant into
    /// `out_dir`, returning the file's path.
    ///
    /// # Errors
    ///
    /// Implementations fail the run when no export can be produced.
    async fn download(
        &self,
        config: &CompanyConfig,
        from: NaiveDate,
        to: NaiveDate,
        out_dir: &Path,
    ) -> Result<PathBuf>;
}

/// Runs an external downloader command (the headless-browser driver).
///
/// The command is invoked as:
/// `<program> --tenant <key> --from-date <from> --to-date <to>
///  --output-dir <dir> --output-filename <name>`
/// and must exit zero after writing the file. POS credentials reach the
/// child through its environment, resolved from the tenant's configured
/// key names.
pub struct CommandDownloader {
    program: PathBuf,
}

impl CommandDownloader {
    /// Creates a downloader that invokes `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl PosDownloader for CommandDownloader {
    async fn download(
        &self,
        config: &CompanyConfig,
        from: NaiveDate,
        to: NaiveDate,
        out_dir: &Path,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(out_dir)
            .map_err(|e| Error::io(out_dir.display().to_string(), e))?;

        let tag = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d-%H%M%S"),
            std::process::id()
        );
        let file_name = if from == to {
            format!("BookKeeping_{}_{from}_{tag}.csv", config.dir_name())
        } else {
            format!("BookKeeping_{}_{from}_to_{to}_{tag}.csv", config.dir_name())
        };

        let username = config.epos_username()?;
        let password = config.epos_password()?;

        let status = tokio::process::Command::new(&self.program)
            .arg("--tenant")
            .arg(config.company_key.as_str())
            .arg("--from-date")
            .arg(from.to_string())
            .arg("--to-date")
            .arg(to.to_string())
            .arg("--output-dir")
            .arg(out_dir)
            .arg("--output-filename")
            .arg(&file_name)
            .env("EPOS_USERNAME", username)
            .env("EPOS_PASSWORD", password)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| Error::storage_with_source("spawn downloader", e))?;

        if !status.success() {
            return Err(Error::storage(format!(
                "downloader exited with {}",
                status.code().map_or("signal".to_string(), |c| c.to_string())
            )));
        }

        let expected = out_dir.join(&file_name);
        if expected.is_file() {
            info!(file = %expected.display(), "POS export downloaded");
            return Ok(expected);
        }

        // The driver occasionally names the file itself; fall back to the
        // newest CSV in the download directory.
        let newest = newest_csv(out_dir)?;
        newest.ok_or_else(|| {
            Error::storage(format!(
                "no raw POS CSV appeared in {} after download",
                out_dir.display()
            ))
        })
    }
}

/// Serves a pre-existing file; used in tests and fixtures.
pub struct FixtureDownloader {
    source: PathBuf,
}

impl FixtureDownloader {
    /// Creates a downloader that copies `source` into the download dir.
    #[must_use]
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl PosDownloader for FixtureDownloader {
    async fn download(
        &self,
        config: &CompanyConfig,
        from: NaiveDate,
        to: NaiveDate,
        out_dir: &Path,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(out_dir)
            .map_err(|e| Error::io(out_dir.display().to_string(), e))?;
        let file_name = format!("BookKeeping_{}_{from}_to_{to}.csv", config.dir_name());
        let dest = out_dir.join(file_name);
        std::fs::copy(&self.source, &dest)
            .map_err(|e| Error::io(self.source.display().to_string(), e))?;
        Ok(dest)
    }
}

fn newest_csv(dir: &Path) -> Result<Option<PathBuf>> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir.display().to_string(), e))? {
        let entry = entry.map_err(|e| Error::io(dir.display().to_string(), e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}
