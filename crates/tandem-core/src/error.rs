//! Error taxonomy shared by the generator, the reference semantics, the
//! ledgers and the client.
//!
//! - [`GenerationError`]: fatal to a whole compilation.
//! - [`StepError`]: a step's checks failed (client-side or reference oracle).
//! - [`AssertionFailure`]: a named check with its source provenance.
//! - [`Reason`]: the compact, serializable class a ledger reports when it
//!   rejects a group. Verifier programs carry it as a *note*
//!   ([`Reason::note`] / [`Reason::from_note`]).
//!
//! A lapsed deadline is not an error: it selects [`crate::Branch::TimedOut`].

use crate::ir::{SrcLoc, StepId, VarId, Window};
use serde::{Deserialize, Serialize};
use std::fmt;
use tandem_digest::{Digest, ShapeMismatch};

/// Why a ledger rejected a transaction group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Malformed group, wrong arity or argument width, unknown step.
    Shape,
    /// A named assertion failed (`"sender correct"`, `"pay amount correct"`, …).
    Assertion(String),
    /// Previous-state digest does not match storage.
    Digest,
    /// Ledger time outside the step's window.
    Window,
    /// Checked arithmetic faulted.
    Arithmetic,
    /// An account could not cover a transfer.
    Funds,
    /// The protocol has already halted.
    Halted,
    /// Anything the ledger could not classify.
    Other(String),
}

/// Assertion names the verifier uses for its built-in checks.
pub mod names {
    /// Identity check.
    pub const SENDER: &str = "sender correct";
    /// Payment check.
    pub const PAY: &str = "pay amount correct";
}

impl Reason {
    /// Stable single-line form used in program comments and reason tables.
    #[must_use]
    pub fn note(&self) -> String {
        match self {
            Self::Shape => "shape".into(),
            Self::Assertion(m) => format!("assert: {m}"),
            Self::Digest => "digest".into(),
            Self::Window => "window".into(),
            Self::Arithmetic => "arith".into(),
            Self::Funds => "funds".into(),
            Self::Halted => "halted".into(),
            Self::Other(m) => m.clone(),
        }
    }

    /// Inverse of [`Reason::note`]. Unknown notes become [`Reason::Other`].
    #[must_use]
    pub fn from_note(s: &str) -> Self {
        let s = s.trim();
        match s {
            "shape" => Self::Shape,
            "digest" => Self::Digest,
            "window" => Self::Window,
            "arith" => Self::Arithmetic,
            "funds" => Self::Funds,
            "halted" => Self::Halted,
            _ => s
                .strip_prefix("assert: ")
                .map_or_else(|| Self::Other(s.to_owned()), |m| Self::Assertion(m.to_owned())),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shape => f.write_str("shape mismatch"),
            Self::Assertion(m) => write!(f, "assertion failed: {m}"),
            Self::Digest => f.write_str("digest mismatch"),
            Self::Window => f.write_str("outside time window"),
            Self::Arithmetic => f.write_str("arithmetic fault"),
            Self::Funds => f.write_str("insufficient funds"),
            Self::Halted => f.write_str("protocol halted"),
            Self::Other(m) => f.write_str(m),
        }
    }
}

/// A named check failed.
///
/// `Display` renders the message chain: the check, the step and submitter,
/// then every provenance frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionFailure {
    /// Step whose check failed.
    pub step: StepId,
    /// Submitting participant's name.
    pub who: String,
    /// Assertion message.
    pub msg: String,
    /// Where the assertion is written.
    pub at: SrcLoc,
    /// Call-site provenance, innermost first.
    pub frames: Vec<SrcLoc>,
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assertion failed: {}", self.msg)?;
        write!(f, "\n  at {} (step {}, {})", self.at, self.step, self.who)?;
        for fr in &self.frames {
            write!(f, "\n  from {fr}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AssertionFailure {}

/// A step's checks failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Arguments do not inhabit the step's shape.
    #[error("step {step}: {source}")]
    Shape {
        /// Offending step.
        step: StepId,
        /// Slot-level detail.
        #[source]
        source: ShapeMismatch,
    },
    /// An address has no 20-byte account form.
    #[error("step {step}: {slot} is not a 20-byte account")]
    WideAddress {
        /// Offending step.
        step: StepId,
        /// `sender`, `svs.<i>` or `msg.<i>`.
        slot: String,
    },
    /// The step id does not exist or is not enabled.
    #[error("step {step} is not a step of this protocol")]
    UnknownStep {
        /// Requested id.
        step: StepId,
    },
    /// A named check failed.
    #[error(transparent)]
    Assertion(#[from] Box<AssertionFailure>),
    /// Previous-state digest differs from the stored one.
    #[error("step {step}: previous-state digest mismatch (stored {stored}, computed {computed})")]
    DigestMismatch {
        /// Offending step.
        step: StepId,
        /// Persisted digest.
        stored: Digest,
        /// Digest of the submitted state.
        computed: Digest,
    },
    /// Ledger time outside the step's window.
    #[error("step {step}: time {time} outside {window} with t0 = {anchor}")]
    Window {
        /// Offending step.
        step: StepId,
        /// Window of the step.
        window: Window,
        /// State entry time.
        anchor: u64,
        /// Execution time.
        time: u64,
    },
    /// Checked arithmetic faulted.
    #[error("step {step}: arithmetic fault in `{op}`")]
    Arithmetic {
        /// Offending step.
        step: StepId,
        /// Operator.
        op: String,
    },
    /// A variable was read before being bound.
    #[error("step {step}: variable #{var} is unbound")]
    Unbound {
        /// Offending step.
        step: StepId,
        /// Variable.
        var: VarId,
    },
    /// A value had the wrong kind at runtime.
    #[error("step {step}: {detail}")]
    Type {
        /// Offending step.
        step: StepId,
        /// Detail.
        detail: String,
    },
    /// The protocol already halted.
    #[error("step {step}: protocol already halted")]
    Halted {
        /// Offending step.
        step: StepId,
    },
}

impl StepError {
    /// The ledger-facing class of this failure.
    #[must_use]
    pub fn reason(&self) -> Reason {
        match self {
            Self::Shape { .. }
            | Self::WideAddress { .. }
            | Self::UnknownStep { .. }
            | Self::Type { .. }
            | Self::Unbound { .. } => Reason::Shape,
            Self::Assertion(a) => Reason::Assertion(a.msg.clone()),
            Self::DigestMismatch { .. } => Reason::Digest,
            Self::Window { .. } => Reason::Window,
            Self::Arithmetic { .. } => Reason::Arithmetic,
            Self::Halted { .. } => Reason::Halted,
        }
    }

    /// Step the failure belongs to.
    #[must_use]
    pub fn step(&self) -> StepId {
        match self {
            Self::Shape { step, .. }
            | Self::WideAddress { step, .. }
            | Self::UnknownStep { step }
            | Self::DigestMismatch { step, .. }
            | Self::Window { step, .. }
            | Self::Arithmetic { step, .. }
            | Self::Unbound { step, .. }
            | Self::Type { step, .. }
            | Self::Halted { step } => *step,
            Self::Assertion(a) => a.step,
        }
    }
}

/// Fatal compile-time error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// The IR is structurally broken.
    #[error("malformed IR: {0}")]
    MalformedIr(String),
    /// An expression or binding is ill-typed.
    #[error("type error in step {step}: {detail}")]
    Type {
        /// Offending step.
        step: StepId,
        /// Detail.
        detail: String,
    },
    /// The backend cannot express this step.
    #[error("unsupported step {step}: {detail}")]
    UnsupportedStep {
        /// Offending step.
        step: StepId,
        /// Detail.
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_roundtrip() {
        for r in [
            Reason::Shape,
            Reason::Assertion("checkCommitment".into()),
            Reason::Digest,
            Reason::Window,
            Reason::Arithmetic,
            Reason::Funds,
            Reason::Halted,
        ] {
            assert_eq!(Reason::from_note(&r.note()), r);
        }
        assert_eq!(Reason::from_note("whatever"), Reason::Other("whatever".into()));
    }

    #[test]
    fn assertion_failure_renders_chain() {
        let a = AssertionFailure {
            step: 8,
            who: "Alice".into(),
            msg: "checkCommitment".into(),
            at: SrcLoc::new("rps.rsh", 80, 11, "application"),
            frames: vec![SrcLoc::new("rps.rsh", 74, 5, "function body")],
        };
        let s = a.to_string();
        assert!(s.starts_with("assertion failed: checkCommitment"));
        assert!(s.contains("at rps.rsh:80:11:application (step 8, Alice)"));
        assert!(s.contains("from rps.rsh:74:5:function body"));
        assert_eq!(
            StepError::from(Box::new(a)).reason(),
            Reason::Assertion("checkCommitment".into())
        );
    }
}
