//! `tandem-teal`: the stack-machine lowering.
//!
//! [`StackMachine`] plugs into [`tandem_core::Compiler`] and turns every step
//! into a handler logic signature, plus four fixed programs per protocol:
//!
//! - **approval**: the application's program; checks and rotates the stored
//!   no-time digest and entry round,
//! - **init**: bootstrap program that seeds state 0 and lets the deployer
//!   install `approval`,
//! - **escrow**: releases funds only inside a call to the application,
//! - **clear**: clear-state program, accepted only once the protocol halted.
//!
//! [`StackLedger`] deploys and runs the result in memory.
//!
//! ```no_run
//! use tandem_core::{Compiler, Protocol};
//! use tandem_teal::StackMachine;
//! # fn demo(p: &Protocol) -> anyhow::Result<()> {
//! let artifact = Compiler::<StackMachine>::default().compile(p)?;
//! println!("{}", artifact.program("m1").unwrap_or_default());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::doc_markdown
)]

/// Textual assembly: instructions, rendering, parsing.
pub mod asm;
/// In-memory ledger executing deployed programs.
pub mod ledger;
/// Step → program lowering and packaging.
pub mod lower;
/// Interpreter.
pub mod vm;

pub use asm::{AsmError, Program};
pub use ledger::{program_address, Auth, DeployError, SignedTxn, StackLedger};
pub use lower::{handler_name, Handler};
pub use vm::{Fault, FaultKind, GroupTxn, StackValue, TxnBody};

use tandem_core::{BackendArtifact, BackendKind, CompileConfig, GenerationError, LoweringBackend, Protocol, Step};

/// Stack-machine backend marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackMachine;

impl LoweringBackend for StackMachine {
    type Procedure = Handler;
    const KIND: BackendKind = BackendKind::StackMachine;

    fn lower_step(protocol: &Protocol, step: &Step, cfg: &CompileConfig) -> Result<Handler, GenerationError> {
        lower::handler(protocol, step, cfg)
    }

    fn package(
        protocol: &Protocol,
        procedures: Vec<Handler>,
        cfg: &CompileConfig,
    ) -> Result<BackendArtifact, GenerationError> {
        lower::package(protocol, procedures, cfg)
    }
}
