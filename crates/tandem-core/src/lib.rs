//! `tandem-core`: protocol IR, reference step semantics, and the lowering façade.
//!
//! This crate defines the **stable boundary** used across tandem crates:
//! - the protocol IR (`Protocol`, `Step`, `Tail`, …) and its validation,
//! - the reference verifier semantics every lowering must agree with,
//! - the [`Ledger`] trait clients drive and ledgers implement,
//! - backend artifacts, deploy-time templates, and JSON/CBOR I/O, and
//! - the **backend-agnostic** compiler façade.
//!
//! ```no_run
//! use tandem_core::{Compiler, LoweringBackend, Protocol};
//! # fn demo<B: LoweringBackend + std::fmt::Debug + Clone + Copy>(p: &Protocol) -> anyhow::Result<()> {
//! let artifact = Compiler::<B>::default().compile(p)?;
//! println!("{} programs", artifact.programs.len());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Small, explicit allowlist to keep docs readable and APIs ergonomic.
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::doc_markdown
)]

/// Backend artifacts (programs, manifest, placeholders, metadata).
pub mod artifact;
/// Minimal stateless lowering trait used by the compiler façade.
pub mod backend;
/// Compiler façade: validate, lower, package.
pub mod compiler;
/// Code generation knobs with environment overrides.
pub mod config;
/// Error taxonomy and rejection reasons.
pub mod error;
/// Reference step semantics.
pub mod eval;
/// JSON/CBOR helpers and auto-detecting read/write APIs.
pub mod io;
/// Streaming JSONL/NDJSON helpers for ledger transcripts.
pub mod io_jsonl;
/// Protocol intermediate representation.
pub mod ir;
/// The ledger boundary shared by clients and backends.
pub mod ledger;
/// Deploy-time `{{Name}}` placeholders.
pub mod template;
/// Generation-time validation.
pub mod validate;

// ---- Re-exports for workspace compatibility ----
pub use artifact::*;
pub use backend::*;
pub use compiler::*;
pub use config::*;
pub use error::*;
pub use eval::*;
pub use io::*;
pub use ir::*;
pub use ledger::*;
pub use template::{Bindings, TemplateError};
pub use validate::validate;

/// The digest engine every backend shares.
pub use tandem_digest;
pub use tandem_digest::{Address, Digest, Kind, StateDigest, Value};

/// Commonly-used items for quick imports.
///
/// ```rust
/// use tandem_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        artifact::{BackendArtifact, BackendKind},
        backend::LoweringBackend,
        compiler::Compiler,
        config::CompileConfig,
        error::{GenerationError, Reason, StepError},
        eval::{verify, Consensus, Snapshot, Submission},
        ir::*,
        ledger::{Ledger, Observed, Rejection, StepCall},
    };
    pub use tandem_digest::{Address, Digest, Kind, Value};
}
