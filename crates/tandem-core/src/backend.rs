//! Lowering abstraction: one IR, many ledgers.
//!
//! Implementors provide a *stateless* API (associated functions) that lower a
//! validated step into a backend-specific verifier procedure and package all
//! procedures into a [`BackendArtifact`]. The [`crate::Compiler`] façade drives
//! them; callers never invoke a lowering on unvalidated IR.
//!
//! ## Contracts implementors should uphold
//! - `lower_step` must emit the checks in the order documented in
//!   [`crate::eval`] and reject (never partially apply) on any failure.
//! - Accept/reject decisions must match [`crate::eval::verify`] for every
//!   submission, given equal logical variable values.
//! - Deploy-time values must appear as `{{Name}}` placeholders, never baked in.
//! - Neither function should panic on valid IR; return `Err` instead.

use crate::artifact::{BackendArtifact, BackendKind};
use crate::config::CompileConfig;
use crate::error::GenerationError;
use crate::ir::{Protocol, Step};

/// A lowering from the protocol IR to one ledger's execution model.
///
/// ```ignore
/// let artifact = Compiler::<StackMachine>::compile(&protocol, &CompileConfig::default())?;
/// ```
pub trait LoweringBackend {
    /// Backend-specific verifier procedure for one step.
    type Procedure;

    /// Backend identity stamped into artifacts.
    const KIND: BackendKind;

    /// Lower one validated step.
    ///
    /// # Errors
    /// Returns [`GenerationError::UnsupportedStep`] if the backend cannot
    /// express the step.
    fn lower_step(protocol: &Protocol, step: &Step, cfg: &CompileConfig) -> Result<Self::Procedure, GenerationError>;

    /// Package every step's procedure (in step order) with the backend's
    /// fixed programs into an artifact.
    ///
    /// # Errors
    /// Returns an error if the combined program exceeds backend limits.
    fn package(
        protocol: &Protocol,
        procedures: Vec<Self::Procedure>,
        cfg: &CompileConfig,
    ) -> Result<BackendArtifact, GenerationError>;
}
