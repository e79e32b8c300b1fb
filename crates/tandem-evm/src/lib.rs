//! `tandem-evm`: the account-contract lowering.
//!
//! [`AccountContract`] plugs into [`tandem_core::Compiler`] and emits one
//! contract per protocol: creation code guarded by a `{{Deployer}}`
//! placeholder, a selector dispatcher, one payable function and one event per
//! step, and shared revert blocks whose 32-byte code indexes the manifest's
//! `reasons` list.
//!
//! [`AccountLedger`] deploys and runs the result in memory.
//!
//! ```no_run
//! use tandem_core::{Compiler, Protocol};
//! use tandem_evm::AccountContract;
//! # fn demo(p: &Protocol) -> anyhow::Result<()> {
//! let artifact = Compiler::<AccountContract>::default().compile(p)?;
//! println!("{}", artifact.manifest["abi"]);
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

/// Function/event signatures, selectors and word codec.
pub mod abi;
/// Label-resolving bytecode assembler.
pub mod asm;
/// In-memory ledger executing the deployed contract.
pub mod ledger;
/// Step → function lowering and contract linking.
pub mod lower;
/// Opcode table.
pub mod opcode;
/// Interpreter.
pub mod vm;

pub use abi::{AbiError, EventData};
pub use asm::{AsmError, Instr};
pub use ledger::{contract_address, deployer_binding, AccountLedger, DeployError};
pub use lower::Function;
pub use vm::{Exit, VmError};

use tandem_core::{BackendArtifact, BackendKind, CompileConfig, GenerationError, LoweringBackend, Protocol, Step};

/// Account-contract backend marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountContract;

impl LoweringBackend for AccountContract {
    type Procedure = Function;
    const KIND: BackendKind = BackendKind::AccountContract;

    fn lower_step(protocol: &Protocol, step: &Step, cfg: &CompileConfig) -> Result<Function, GenerationError> {
        lower::function(protocol, step, cfg)
    }

    fn package(
        protocol: &Protocol,
        procedures: Vec<Function>,
        cfg: &CompileConfig,
    ) -> Result<BackendArtifact, GenerationError> {
        lower::package(protocol, procedures, cfg)
    }
}
