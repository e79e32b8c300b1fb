//! Backend artifacts: the serialized boundary between the generator and a
//! deployment tool.
//!
//! A [`BackendArtifact`] pins the backend identity, the generated programs
//! (textual assembly or hex bytecode), an interface `manifest` (ABI JSON,
//! group layout, reason tables), and the set of deploy-time placeholders the
//! programs contain. Placeholders are *not* resolved here: see
//! [`crate::template`].
//!
//! ## Backward/forward compatibility
//! - No `#[serde(deny_unknown_fields)]`, so newer producers stay readable.
//! - Unknown backends decode as [`BackendKind::Unknown`].
//! - `meta` is free-form diagnostics; do not parse it in critical paths.

use crate::template;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Which lowering produced an artifact.
///
/// Marked `#[non_exhaustive]` so new backends can be added without forcing
/// exhaustive matches downstream; unknown serialized names decode as
/// [`BackendKind::Unknown`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Group-of-transactions stack machine with a global key/value store.
    StackMachine,
    /// Single contract account with storage and payable functions.
    AccountContract,
    /// Catch-all for newer/unknown backends when deserializing.
    #[serde(other)]
    Unknown,
}

/// A compiled protocol for one backend. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendArtifact {
    /// Backend that produced the programs.
    pub backend: BackendKind,
    /// Protocol name.
    pub protocol: String,
    /// Protocol IR version the artifact was generated from.
    #[serde(default)]
    pub version: u32,
    /// Program name → program text (assembly or hex bytecode).
    pub programs: BTreeMap<String, String>,
    /// Interface manifest (ABI, group layout, reason tables).
    #[serde(default)]
    pub manifest: serde_json::Value,
    /// Deploy-time placeholders appearing in `programs`.
    #[serde(default)]
    pub placeholders: BTreeSet<String>,
    /// Free-form diagnostics.
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl BackendArtifact {
    /// Build an artifact, scanning `programs` for placeholders.
    #[must_use]
    pub fn new(
        backend: BackendKind,
        protocol: &str,
        version: u32,
        programs: BTreeMap<String, String>,
        manifest: serde_json::Value,
        meta: serde_json::Value,
    ) -> Self {
        let placeholders = programs
            .values()
            .flat_map(|p| template::placeholders(p))
            .collect();
        Self {
            backend,
            protocol: protocol.to_owned(),
            version,
            programs,
            manifest,
            placeholders,
            meta,
        }
    }

    /// Program text by name.
    #[inline]
    #[must_use]
    pub fn program(&self, name: &str) -> Option<&str> {
        self.programs.get(name).map(String::as_str)
    }

    /// Returns the backend kind.
    #[inline]
    #[must_use]
    pub const fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Blake3 fingerprint over the canonical JSON of programs and manifest.
    ///
    /// Two generations of the same protocol with the same configuration
    /// fingerprint identically.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        let body = serde_json::json!({
            "backend": self.backend,
            "programs": self.programs,
            "manifest": self.manifest,
        });
        tandem_digest::fingerprint(body.to_string().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> BackendArtifact {
        let mut programs = BTreeMap::new();
        programs.insert("escrow".into(), "int {{ApplicationID}}\nreturn".into());
        programs.insert("m1".into(), "byte {{ContractAddr}}".into());
        BackendArtifact::new(
            BackendKind::StackMachine,
            "demo",
            1,
            programs,
            json!({"globals": ["s", "l", "h"]}),
            json!({"k": "v"}),
        )
    }

    #[test]
    fn placeholders_are_collected() {
        let a = sample();
        let names: Vec<_> = a.placeholders.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["ApplicationID", "ContractAddr"]);
    }

    #[test]
    fn serde_roundtrip_json() {
        let a = sample();
        let ser = serde_json::to_vec(&a).expect("serialize");
        let de: BackendArtifact = serde_json::from_slice(&ser).expect("deserialize");
        assert_eq!(de, a);
        assert_eq!(de.fingerprint(), a.fingerprint());
    }

    #[test]
    fn unknown_backend_is_tolerated() {
        let wire = json!({
            "backend": "quantum-ledger",
            "protocol": "demo",
            "programs": {},
        });
        let de: BackendArtifact = serde_json::from_value(wire).unwrap();
        assert_eq!(de.backend, BackendKind::Unknown);
        assert!(de.placeholders.is_empty());
        assert_eq!(de.meta, serde_json::Value::Null);
    }
}
