//! `tandem-protocols`: protocols built on the tandem IR, and hosts to run them.
//!
//! ```no_run
//! use tandem_core::compile;
//! use tandem_protocols::rps;
//! # fn demo<B: tandem_core::LoweringBackend>() -> Result<(), tandem_core::GenerationError> {
//! let artifact = compile::<B>(&rps::rock_paper_scissors(rps::DEADLINE))?;
//! println!("{}", artifact.fingerprint()[0]);
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

/// Scripted [`tandem_client::Interact`] hosts.
pub mod host;
/// Rock-paper-scissors with wager, commit/reveal and timeouts.
pub mod rps;

pub use host::ScriptedHost;

use std::sync::Arc;
use tandem_client::{run, ClientError, DriverOptions, Participant, Report};
use tandem_core::{Ledger, Protocol};
use tandem_digest::Address;
use tracing::info;

/// Run a two-party protocol to completion with Alice as role 0 and Bob as role 1.
///
/// Returns the driver report and both participants (hosts included) for
/// inspection.
pub fn play<L: Ledger + ?Sized>(
    protocol: Protocol,
    ledger: &mut L,
    alice: (Address, ScriptedHost),
    bob: (Address, ScriptedHost),
    opts: &DriverOptions,
) -> Result<(Report, Vec<Participant<ScriptedHost>>), ClientError> {
    let p = Arc::new(protocol);
    let at = ledger.deployed_at();
    let mut parts = vec![
        Participant::new(Arc::clone(&p), rps::ALICE, alice.0, alice.1, at),
        Participant::new(Arc::clone(&p), rps::BOB, bob.0, bob.1, at),
    ];
    let report = run(ledger, &mut parts, opts)?;
    info!(protocol = %p.name, outcome = ?report.outcome, submitted = report.submitted, "match over");
    Ok((report, parts))
}
