//! Per-tenant ledger of document numbers accepted by the remote service.
//!
//! The ledger is the first deduplication layer: a document number present
//! here is never re-posted. Writes go through a temp file in the same
//! directory followed by an atomic rename, so concurrent readers always
//! see either the old or the new complete file. A missing file reads as
//! an empty set.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use oiat_core::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    docnumbers: Vec<String>,
    last_updated: String,
}

/// The uploaded-document-number ledger for one tenant.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: BTreeSet<String>,
}

impl Ledger {
    /// Loads the ledger at `path`; a missing file is an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the file exists but cannot be parsed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => {
                let file: LedgerFile = serde_json::from_str(&raw).map_err(|e| {
                    Error::storage(format!("corrupt ledger at {}: {e}", path.display()))
                })?;
                file.docnumbers.into_iter().collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(Error::io(path.display().to_string(), e)),
        };
        Ok(Self { path, entries })
    }

    /// Returns whether a document number is present.
    #[must_use]
    pub fn contains(&self, doc_number: &str) -> bool {
        self.entries.contains(doc_number)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Adds one document number and persists.
    ///
    /// # Errors
    ///
    /// Returns `Storage`/`Io` when the write fails.
    pub fn add(&mut self, doc_number: impl Into<String>) -> Result<()> {
        self.entries.insert(doc_number.into());
        self.persist()
    }

    /// Adds many document numbers and persists once.
    ///
    /// # Errors
    ///
    /// Returns `Storage`/`Io` when the write fails.
    pub fn add_all<I>(&mut self, doc_numbers: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        for doc in doc_numbers {
            self.entries.insert(doc.into());
        }
        self.persist()
    }

    /// Removes entries absent from a freshly queried remote snapshot and
    /// returns the removed ("stale") document numbers.
    ///
    /// Only entries in `candidates` are considered: the snapshot is scoped
    /// to the documents the current run cares about, so entries for other
    /// dates must not be touched.
    ///
    /// # Errors
    ///
    /// Returns `Storage`/`Io` when the write fails.
    pub fn heal_stale(
        &mut self,
        candidates: &BTreeSet<String>,
        found_in_remote: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|doc| candidates.contains(*doc) && !found_in_remote.contains(*doc))
            .cloned()
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        for doc in &stale {
            self.entries.remove(doc);
        }
        self.persist()?;
        Ok(stale)
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io(parent.display().to_string(), e))?;
            }
        }
        let file = LedgerFile {
            docnumbers: self.entries.iter().cloned().collect(),
            last_updated: Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_vec_pretty(&file).map_err(|e| Error::Internal {
            message: format!("serialize ledger: {e}"),
        })?;

        let tmp = temp_path(&self.path);
        {
            let mut handle =
                fs::File::create(&tmp).map_err(|e| Error::io(tmp.display().to_string(), e))?;
            handle
                .write_all(&payload)
                .map_err(|e| Error::io(tmp.display().to_string(), e))?;
            handle
                .sync_all()
                .map_err(|e| Error::io(tmp.display().to_string(), e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| Error::io(self.path.display().to_string(), e))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger".to_string());
    name.push_str(&format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}
