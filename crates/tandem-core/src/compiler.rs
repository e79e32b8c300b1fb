//! Compiler façade: validate once, lower every step, package.
//!
//! Generation is a pure, single-threaded transformation. Any error is fatal
//! to the whole compilation; there is no per-step recovery.

use crate::artifact::BackendArtifact;
use crate::backend::LoweringBackend;
use crate::config::CompileConfig;
use crate::error::GenerationError;
use crate::ir::Protocol;
use crate::validate::validate;
use std::marker::PhantomData;
use tracing::{debug, info, info_span};

/// Generic compiler over a lowering backend.
#[derive(Debug, Clone, Copy)]
pub struct Compiler<B: LoweringBackend> {
    backend: PhantomData<B>,
    cfg: CompileConfig,
}

impl<B: LoweringBackend> Default for Compiler<B> {
    fn default() -> Self {
        Self::with_config(CompileConfig::default())
    }
}

impl<B: LoweringBackend> Compiler<B> {
    /// Construct with an explicit configuration.
    #[must_use]
    pub const fn with_config(cfg: CompileConfig) -> Self {
        Self {
            backend: PhantomData,
            cfg,
        }
    }

    /// The active configuration.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &CompileConfig {
        &self.cfg
    }

    /// Validate `protocol` and produce the backend artifact.
    ///
    /// # Errors
    /// Returns the first validation or lowering error.
    pub fn compile(&self, protocol: &Protocol) -> Result<BackendArtifact, GenerationError> {
        let span = info_span!("compile", protocol = %protocol.name, backend = ?B::KIND);
        let _enter = span.enter();

        validate(protocol)?;
        debug!(steps = protocol.len(), states = protocol.states.len(), "validated");

        let procs = protocol
            .steps
            .iter()
            .map(|s| {
                debug!(step = s.id, "lowering");
                B::lower_step(protocol, s, &self.cfg)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let artifact = B::package(protocol, procs, &self.cfg)?;
        info!(
            programs = artifact.programs.len(),
            placeholders = artifact.placeholders.len(),
            fingerprint = %hex::encode(&artifact.fingerprint()[..8]),
            "compiled"
        );
        Ok(artifact)
    }
}

/// Validate + compile with default configuration.
///
/// # Errors
/// See [`Compiler::compile`].
pub fn compile<B: LoweringBackend>(protocol: &Protocol) -> Result<BackendArtifact, GenerationError> {
    Compiler::<B>::default().compile(protocol)
}
