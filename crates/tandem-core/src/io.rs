//! Serialization helpers for protocols and backend artifacts.
//!
//! JSON and CBOR read/write utilities with extension-based auto-detection.
//! Unknown/missing extensions are rejected for reads and default to JSON
//! for writes.
//!
//! Protocols are the compiler's input and artifacts its output; both
//! round-trip losslessly through either format.

use crate::{BackendArtifact, Protocol};
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Ensure the parent directory for a file exists (no-op if none).
pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating parent directory {}", display(path)))?;
        }
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let f = File::open(path).with_context(|| format!("open {}", display(path)))?;
    serde_json::from_reader(BufReader::new(f)).with_context(|| format!("deserialize JSON {what}"))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, v: &T, what: &str) -> Result<()> {
    ensure_parent_dir(path)?;
    let f = File::create(path).with_context(|| format!("create {}", display(path)))?;
    serde_json::to_writer_pretty(BufWriter::new(f), v).with_context(|| format!("serialize JSON {what}"))
}

fn read_cbor<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let f = File::open(path).with_context(|| format!("open {}", display(path)))?;
    let mut rdr = BufReader::new(f);
    ciborium::de::from_reader(&mut rdr).with_context(|| format!("deserialize CBOR {what}"))
}

fn write_cbor<T: Serialize + ?Sized>(path: &Path, v: &T, what: &str) -> Result<()> {
    ensure_parent_dir(path)?;
    let f = File::create(path).with_context(|| format!("create {}", display(path)))?;
    let mut w = BufWriter::new(f);
    ciborium::ser::into_writer(v, &mut w).with_context(|| format!("serialize CBOR {what}"))
}

fn read_auto<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    match ext_lower(path).as_deref() {
        Some("json") => read_json(path, what),
        Some("cbor") => read_cbor(path, what),
        Some(other) => Err(anyhow!(
            "unsupported {what} extension: {other} (supported: .json, .cbor)"
        )),
        None => Err(anyhow!("path has no extension (expected .json or .cbor)")),
    }
}

fn write_auto<T: Serialize + ?Sized>(path: &Path, v: &T, what: &str) -> Result<()> {
    match ext_lower(path).as_deref() {
        Some("cbor") => write_cbor(path, v, what),
        _ => write_json(path, v, what),
    }
}

/// ------------------------------
/// Protocol I/O
/// ------------------------------

/// Read a [`Protocol`] by extension (`.json` / `.cbor`, case-insensitive).
pub fn read_protocol_auto<P: AsRef<Path>>(path: P) -> Result<Protocol> {
    read_auto(path.as_ref(), "protocol")
}

/// Write a [`Protocol`] (defaults to **JSON** if the extension is unknown or missing).
pub fn write_protocol_auto<P: AsRef<Path>>(path: P, p: &Protocol) -> Result<()> {
    write_auto(path.as_ref(), p, "protocol")
}

/// ------------------------------
/// BackendArtifact I/O
/// ------------------------------

/// Read a [`BackendArtifact`] from **JSON**.
pub fn read_artifact_json<P: AsRef<Path>>(path: P) -> Result<BackendArtifact> {
    read_json(path.as_ref(), "artifact")
}

/// Write a [`BackendArtifact`] to **JSON** (pretty).
pub fn write_artifact_json<P: AsRef<Path>>(path: P, a: &BackendArtifact) -> Result<()> {
    write_json(path.as_ref(), a, "artifact")
}

/// Read a [`BackendArtifact`] from **CBOR**.
pub fn read_artifact_cbor<P: AsRef<Path>>(path: P) -> Result<BackendArtifact> {
    read_cbor(path.as_ref(), "artifact")
}

/// Write a [`BackendArtifact`] to **CBOR**.
pub fn write_artifact_cbor<P: AsRef<Path>>(path: P, a: &BackendArtifact) -> Result<()> {
    write_cbor(path.as_ref(), a, "artifact")
}

/// Auto-detect read by extension `.json` / `.cbor` (case-insensitive).
pub fn read_artifact_auto<P: AsRef<Path>>(path: P) -> Result<BackendArtifact> {
    read_auto(path.as_ref(), "artifact")
}

/// Auto-detect write (defaults to **JSON** if unknown or missing).
pub fn write_artifact_auto<P: AsRef<Path>>(path: P, a: &BackendArtifact) -> Result<()> {
    write_auto(path.as_ref(), a, "artifact")
}

/// Return the lowercase extension (without dot) if present.
pub(crate) fn ext_lower(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// Human-friendly path display for error messages.
pub(crate) fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
