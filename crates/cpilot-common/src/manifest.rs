//! ---
//! cpilot_section: "01-lifecycle-foundation"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Shared configuration, error, logging and manifest primitives."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

/// Bump when the on-disk record shape changes.
pub const MANIFEST_VERSION: u16 = 1;

/// Well-known record keys used across stages.
pub mod keys {
    /// Identifier of the control resource (stack id or instance name).
    pub const CONTROL_RESOURCES: &str = "control_resources";
    /// Domain name of the control plane endpoint.
    pub const CONTROL_DNS: &str = "control_dns";
    /// Effective (suffixed) environment name.
    pub const ENVIRONMENT_NAME: &str = "environment_name";
}

/// First line of every manifest file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestHeader {
    version: u16,
    created_at: DateTime<Utc>,
}

impl ManifestHeader {
    fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            created_at: Utc::now(),
        }
    }
}

/// One identifier written by a lifecycle stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub key: String,
    pub value: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only record of the identifiers a run creates.
///
/// The manifest is what `delete-from-manifest` recovery reads after a crashed
/// or interrupted run, so every record is flushed to disk as soon as it is
/// written. Re-recording a key appends a new line; readers take the last
/// occurrence.
pub struct RunManifest {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RunManifest {
    /// Open a manifest for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        if fresh {
            write_header(&mut writer)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// Truncate any previous run's records and start a fresh manifest.
    pub fn reset(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// Append one identifier record and flush it to disk.
    pub fn record(&mut self, key: &str, value: &str) -> Result<()> {
        let record = ManifestRecord {
            key: key.to_owned(),
            value: value.to_owned(),
            recorded_at: Utc::now(),
        };
        let line = serde_json::to_string(&record)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_header(writer: &mut BufWriter<File>) -> Result<()> {
    let line = serde_json::to_string(&ManifestHeader::new())?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Read-only view over a manifest with last-writer-wins semantics.
#[derive(Debug, Clone, Default)]
pub struct ManifestView {
    values: IndexMap<String, String>,
}

impl ManifestView {
    /// Load and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut first = String::new();
        reader.read_line(&mut first)?;
        let header: ManifestHeader = serde_json::from_str(first.trim()).map_err(|err| {
            LifecycleError::validation(format!(
                "{} is not a run manifest: {err}",
                path.display()
            ))
        })?;
        if header.version != MANIFEST_VERSION {
            return Err(LifecycleError::validation(format!(
                "unsupported manifest version {} in {}",
                header.version,
                path.display()
            )));
        }

        let mut values = IndexMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ManifestRecord = serde_json::from_str(&line)?;
            values.insert(record.key, record.value);
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
