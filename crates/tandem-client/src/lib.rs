//! `tandem-client`: the client step interpreter.
//!
//! Each [`Participant`] walks the protocol in lockstep with the on-ledger
//! verifier: it replays accepted steps, picks the live arm of the current
//! state from ledger time, computes and fast-fails its own submissions, and
//! reports timeouts and the final outcome to its [`Interact`] host.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem_client::{run, DriverOptions, Interact, Participant};
//! use tandem_core::{Ledger, Protocol};
//! # fn demo<L: Ledger, H: Interact>(p: Protocol, ledger: &mut L, alice: H, bob: H) -> anyhow::Result<()> {
//! let p = Arc::new(p);
//! let at = ledger.deployed_at();
//! let mut parts = vec![
//!     Participant::new(Arc::clone(&p), 0, tandem_digest::Address::from_short([1; 20]), alice, at),
//!     Participant::new(Arc::clone(&p), 1, tandem_digest::Address::from_short([2; 20]), bob, at),
//! ];
//! let report = run(ledger, &mut parts, &DriverOptions::from_env())?;
//! println!("{:?}", report.outcome);
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

/// Round-robin driver and its options.
pub mod driver;
/// Host callback interface.
pub mod interact;
/// Per-participant state machine.
pub mod participant;

pub use driver::{run, DriverOptions, Report};
pub use interact::{HostError, Interact};
pub use participant::{ClientError, Participant, Poll, RunState};
