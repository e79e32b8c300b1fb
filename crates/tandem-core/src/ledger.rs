//! The ledger boundary the client interpreter drives.
//!
//! A [`Ledger`] is the sole source of truth shared by participants: it
//! executes the generated verifier for each submission, serializes accepted
//! steps into an append-only log of [`Observed`] entries, and rejects groups
//! atomically (no digest, escrow or balance change on rejection).
//!
//! Backends implement this with their own transaction shapes; the client only
//! ever sees [`StepCall`] going in and [`Observed`] / [`Rejection`] coming out.

use crate::artifact::BackendKind;
use crate::error::Reason;
use crate::eval::Submission;
use crate::ir::StepId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tandem_digest::{Address, Digest, Value};

/// What a participant submits for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCall {
    /// Step to execute.
    pub step: StepId,
    /// Claimed persistent variables of the `from` state.
    pub svs: Vec<Value>,
    /// Claimed entry time of the `from` state.
    pub prev_time: u64,
    /// Message values.
    pub msg: Vec<Value>,
    /// Payment into escrow.
    pub pay: u64,
}

/// One accepted step, as every participant observes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observed {
    /// Position in the ledger log (0-based).
    pub seq: u64,
    /// Executed step.
    pub step: StepId,
    /// Authenticated submitter.
    pub sender: Address,
    /// Payment into escrow.
    pub value: u64,
    /// Ledger time of execution.
    pub time: u64,
    /// Persistent variables the step was checked against.
    pub svs: Vec<Value>,
    /// Entry time of the `from` state.
    pub prev_time: u64,
    /// Message values.
    pub msg: Vec<Value>,
}

impl Observed {
    /// The verifier's view of this step.
    #[must_use]
    pub fn submission(&self) -> Submission {
        Submission {
            sender: self.sender,
            value: self.value,
            time: self.time,
            svs: self.svs.clone(),
            prev_time: self.prev_time,
            msg: self.msg.clone(),
        }
    }
}

/// A rejected submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Step that was attempted.
    pub step: StepId,
    /// Classified cause.
    pub reason: Reason,
    /// Backend-specific detail (program name, pc, revert code, …).
    #[serde(default)]
    pub detail: String,
}

impl Rejection {
    /// Convenience constructor.
    #[must_use]
    pub fn new(step: StepId, reason: Reason, detail: impl Into<String>) -> Self {
        Self {
            step,
            reason,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} rejected: {}", self.step, self.reason)?;
        if !self.detail.is_empty() {
            write!(f, " ({})", self.detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for Rejection {}

/// A ledger hosting one deployed protocol instance.
pub trait Ledger {
    /// Which lowering this ledger executes.
    fn backend(&self) -> BackendKind;

    /// Current ledger time (round / block number).
    fn now(&self) -> u64;

    /// Ledger time at which state 0 was entered.
    fn deployed_at(&self) -> u64;

    /// Let `by` units of ledger time pass.
    fn advance(&mut self, by: u64);

    /// The digest currently persisted by the verifier.
    ///
    /// The account backend stores the with-time digest; the stack machine
    /// stores the no-time digest next to the entry time. Both persist
    /// [`tandem_digest::empty_digest`] once halted.
    fn state_digest(&self) -> Digest;

    /// Balance of an account.
    fn balance(&self, who: &Address) -> u64;

    /// Funds held in escrow by the deployed protocol.
    fn escrow_balance(&self) -> u64;

    /// Assemble and execute `call` signed by `from` at the current time.
    ///
    /// # Errors
    /// Returns a [`Rejection`] if any check fails; the ledger is unchanged.
    fn submit(&mut self, from: &Address, call: &StepCall) -> Result<Observed, Rejection>;

    /// Accepted steps, oldest first.
    fn observed(&self) -> &[Observed];
}
