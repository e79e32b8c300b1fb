//! Round-robin driver.
//!
//! Polls every participant in turn. Ledger time only moves when a full pass
//! makes no progress, so a counterpart that acts promptly always wins the
//! race against its deadline, and a silent one loses it once
//! `advance_by`-sized ticks carry the ledger past `t0 + δ`.
//!
//! | variable            | field       |
//! |---------------------|-------------|
//! | `TANDEM_MAX_TICKS`  | `max_ticks` |
//! | `TANDEM_ADVANCE_BY` | `advance_by`|

use crate::interact::Interact;
use crate::participant::{ClientError, Participant, Poll};
use tandem_core::{Branch, Ledger};
use tandem_digest::Value;
use tracing::{debug, info, info_span};

/// Driver knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    /// Idle passes tolerated before giving up.
    pub max_ticks: u64,
    /// Ledger time added per idle pass.
    pub advance_by: u64,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            max_ticks: 10_000,
            advance_by: 1,
        }
    }
}

impl DriverOptions {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut o = Self::default();
        if let Some(v) = std::env::var("TANDEM_MAX_TICKS").ok().and_then(|v| v.parse().ok()) {
            o.max_ticks = v;
        }
        if let Some(v) = std::env::var("TANDEM_ADVANCE_BY").ok().and_then(|v| v.parse().ok()) {
            o.advance_by = v;
        }
        o
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Outcome reported at halt.
    pub outcome: Option<Value>,
    /// Steps submitted by the driven participants.
    pub submitted: usize,
    /// Of those, timeout steps.
    pub timeouts: usize,
    /// Idle passes (each advanced the ledger).
    pub ticks: u64,
}

/// Drive `parts` against `ledger` until every participant sees the halt.
pub fn run<L, H>(ledger: &mut L, parts: &mut [Participant<H>], opts: &DriverOptions) -> Result<Report, ClientError>
where
    L: Ledger + ?Sized,
    H: Interact,
{
    let span = info_span!("run", backend = ?ledger.backend(), participants = parts.len());
    let _guard = span.enter();
    let mut report = Report {
        outcome: None,
        submitted: 0,
        timeouts: 0,
        ticks: 0,
    };
    loop {
        let mut progressed = false;
        let mut halted = 0;
        for p in parts.iter_mut() {
            match p.step(ledger)? {
                Poll::Progressed(branch) => {
                    progressed = true;
                    report.submitted += 1;
                    if matches!(branch, Branch::TimedOut(_)) {
                        report.timeouts += 1;
                    }
                }
                Poll::Waiting => {}
                Poll::Halted(outcome) => {
                    halted += 1;
                    report.outcome = outcome;
                }
            }
        }
        if halted == parts.len() {
            info!(submitted = report.submitted, ticks = report.ticks, "run complete");
            return Ok(report);
        }
        if !progressed {
            if report.ticks >= opts.max_ticks {
                return Err(ClientError::Stalled(report.ticks));
            }
            ledger.advance(opts.advance_by);
            report.ticks += 1;
            debug!(now = ledger.now(), "idle pass");
        }
    }
}
