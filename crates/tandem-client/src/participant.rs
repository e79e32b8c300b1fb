//! Per-participant step interpreter.
//!
//! A [`Participant`] mirrors the verifier: it replays every accepted step from
//! the ledger log through [`tandem_core::verify`] to keep its own copy of the
//! consensus state, then decides from ledger time which arm of the current
//! state is live. If that step is its own it computes the message locally,
//! checks the whole claim against the reference semantics, and submits.
//! Otherwise it waits.

use crate::interact::{HostError, Interact};
use std::sync::Arc;
use tandem_core::{
    eval_expr, verify, Branch, Call, Consensus, Env, Ledger, Local, Observed, ParticipantId,
    Protocol, Rejection, Snapshot, StateId, Step, StepCall, StepError, StepId, Submission,
    TxnCtx, VarId,
};
use tandem_digest::{Address, Digest, Kind, ShapeMismatch, Value};
use tracing::{debug, info};

/// Client-side failure, surfaced to the host.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The host failed a callback (other than declining).
    #[error("host: {0}")]
    Host(HostError),
    /// A local computation produced something unusable.
    #[error("step {step}: {detail}")]
    Local {
        /// Step being prepared.
        step: StepId,
        /// Detail.
        detail: String,
    },
    /// The claim fails the reference checks; nothing was submitted.
    #[error("local check failed: {0}")]
    Check(#[source] StepError),
    /// The ledger rejected the submission.
    #[error(transparent)]
    Rejected(#[from] Rejection),
    /// An accepted step does not replay under the reference semantics.
    #[error("ledger entry {seq} does not replay: {source}")]
    Diverged {
        /// Log position.
        seq: u64,
        /// Cause.
        #[source]
        source: StepError,
    },
    /// A running state has no outgoing step.
    #[error("state {0} has no outgoing step")]
    Stuck(StateId),
    /// Stored-digest computation failed.
    #[error(transparent)]
    Shape(#[from] ShapeMismatch),
    /// The driver ran out of ticks.
    #[error("no progress after {0} ticks")]
    Stalled(u64),
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    /// This participant submitted the live step.
    Progressed(Branch),
    /// The live step belongs to someone else, or the host declined.
    Waiting,
    /// The protocol is over.
    Halted(Option<Value>),
}

/// Everything a participant carries from one step (and loop round) to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    /// Replayed consensus.
    pub consensus: Consensus,
    /// Known values: consensus variables and this participant's private ones.
    pub env: Env,
    /// Ledger entries consumed.
    pub seen: usize,
    /// Back-edges taken (loop rounds completed).
    pub rounds: u64,
    /// Outcome once halted.
    pub outcome: Option<Value>,
    /// Ledger length and step at which the host last declined.
    declined: Option<(usize, StepId)>,
}

/// One role's interpreter.
#[derive(Debug)]
pub struct Participant<H> {
    protocol: Arc<Protocol>,
    who: ParticipantId,
    address: Address,
    host: H,
    run: RunState,
}

fn local_err(step: StepId, detail: impl Into<String>) -> ClientError {
    ClientError::Local {
        step,
        detail: detail.into(),
    }
}

impl<H: Interact> Participant<H> {
    /// Participant `who` acting as `address`, for a protocol deployed at `deployed_at`.
    pub fn new(protocol: Arc<Protocol>, who: ParticipantId, address: Address, host: H, deployed_at: u64) -> Self {
        let env = Env::new(&protocol);
        Self {
            protocol,
            who,
            address,
            host,
            run: RunState {
                consensus: Consensus::Running(Snapshot::initial(deployed_at)),
                env,
                seen: 0,
                rounds: 0,
                outcome: None,
                declined: None,
            },
        }
    }

    /// Role index.
    #[must_use]
    pub const fn who(&self) -> ParticipantId {
        self.who
    }

    /// Account this participant signs with.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Current run state.
    #[must_use]
    pub const fn state(&self) -> &RunState {
        &self.run
    }

    /// The host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Mutable host access.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    fn name(&self) -> &str {
        self.protocol.participants.get(self.who).map_or("?", |p| p.name.as_str())
    }

    /// Catch up with the ledger, then submit the live step if it is ours.
    pub fn step<L: Ledger + ?Sized>(&mut self, ledger: &mut L) -> Result<Poll, ClientError> {
        self.catch_up(ledger.observed())?;
        let Consensus::Running(snap) = &self.run.consensus else {
            return Ok(Poll::Halted(self.run.outcome.clone()));
        };
        let branch = self
            .protocol
            .select(snap.state, snap.time, ledger.now())
            .ok_or(ClientError::Stuck(snap.state))?;
        let protocol = Arc::clone(&self.protocol);
        let step = protocol
            .step(branch.step())
            .ok_or_else(|| local_err(branch.step(), "unknown step"))?;
        if step.who != self.who || self.run.declined == Some((ledger.observed().len(), step.id)) {
            return Ok(Poll::Waiting);
        }

        let call = match self.prepare(step, ledger.now()) {
            Ok(call) => call,
            Err(ClientError::Host(HostError::Declined(why))) => {
                debug!(who = self.name(), step = step.id, %why, "host declined");
                self.run.declined = Some((ledger.observed().len(), step.id));
                return Ok(Poll::Waiting);
            }
            Err(e) => return Err(e),
        };
        debug!(who = self.name(), step = step.id, ?branch, "submitting");
        ledger.submit(&self.address, &call)?;
        self.catch_up(ledger.observed())?;
        Ok(Poll::Progressed(branch))
    }

    /// Run the step's local computations and build a checked call.
    fn prepare(&mut self, step: &Step, now: u64) -> Result<StepCall, ClientError> {
        let (svs, prev_time) = match &self.run.consensus {
            Consensus::Running(snap) => (snap.svs.clone(), snap.time),
            Consensus::Halted => return Err(local_err(step.id, "protocol halted")),
        };
        let stored = self.run.consensus.stored_digest(&self.protocol)?;
        let txn = TxnCtx {
            sender: self.address,
            value: 0,
            time: now,
        };
        let mut env = self.run.env.clone();
        if let Some(v) = step.bind_sender {
            env.set(v, Value::Address(self.address));
        }
        for l in &step.local {
            match l {
                Local::Interact { bind, call } => {
                    let got = self.interact(step.id, &env, &txn, call, *bind)?;
                    if let (Some(v), Some(val)) = (bind, got) {
                        env.set(*v, val);
                    }
                }
                Local::Set { bind, expr } => {
                    let val = eval_expr(&env, &txn, step.id, expr).map_err(ClientError::Check)?;
                    env.set(*bind, val);
                }
            }
        }
        let msg = env
            .collect(&step.msg)
            .map_err(|v| local_err(step.id, format!("message variable #{v} was not computed")))?;
        let pay = eval_expr(&env, &txn, step.id, &step.pay)
            .map_err(ClientError::Check)?
            .as_uint()
            .ok_or_else(|| local_err(step.id, "payment is not a uint"))?;

        let sub = Submission {
            sender: self.address,
            value: pay,
            time: now,
            svs,
            prev_time,
            msg: msg.clone(),
        };
        verify(&self.protocol, step.id, Some(&stored), &sub).map_err(ClientError::Check)?;
        let call = StepCall {
            step: step.id,
            svs: sub.svs,
            prev_time: sub.prev_time,
            msg,
            pay,
        };
        self.run.env = env;
        Ok(call)
    }

    fn interact(
        &mut self,
        step: StepId,
        env: &Env,
        txn: &TxnCtx,
        call: &Call,
        bind: Option<VarId>,
    ) -> Result<Option<Value>, ClientError> {
        let want = bind.and_then(|v| self.protocol.var_kind(v).cloned());
        match call {
            Call::LocalChoice(name) => {
                let v = self.host.get_local_choice(name).map_err(ClientError::Host)?;
                if let Some(k) = &want {
                    if v.kind() != *k {
                        return Err(local_err(step, format!("choice `{name}` is {}, expected {k}", v.kind())));
                    }
                }
                Ok(Some(v))
            }
            Call::Randomness => {
                let bytes = self.host.get_randomness().map_err(ClientError::Host)?;
                Ok(match want {
                    Some(Kind::Digest) => Some(Value::Digest(Digest(bytes))),
                    Some(Kind::UInt) => {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(&bytes[..8]);
                        Some(Value::UInt(u64::from_be_bytes(b)))
                    }
                    Some(k) => return Err(local_err(step, format!("randomness bound to {k}"))),
                    None => None,
                })
            }
            Call::AcceptOffer(e) => {
                let offer = eval_expr(env, txn, step, e).map_err(ClientError::Check)?;
                self.host.accept_or_reject_offer(&offer).map_err(ClientError::Host)?;
                Ok(bind.map(|_| Value::Unit))
            }
        }
    }

    /// Replay ledger entries not yet seen.
    fn catch_up(&mut self, log: &[Observed]) -> Result<(), ClientError> {
        while let Some(obs) = log.get(self.run.seen) {
            self.apply(obs)?;
            self.run.seen += 1;
        }
        Ok(())
    }

    fn apply(&mut self, obs: &Observed) -> Result<(), ClientError> {
        let p = Arc::clone(&self.protocol);
        let stored = self.run.consensus.stored_digest(&p)?;
        let diverged = |source| ClientError::Diverged { seq: obs.seq, source };
        let fx = verify(&p, obs.step, Some(&stored), &obs.submission()).map_err(diverged)?;
        let step = p.step(obs.step).ok_or_else(|| local_err(obs.step, "unknown step"))?;

        if let Some(from) = p.states.get(step.from) {
            for (v, val) in from.vars.iter().zip(&obs.svs) {
                self.run.env.set(*v, val.clone());
            }
        }
        if let Some(v) = step.bind_sender {
            self.run.env.set(v, Value::Address(obs.sender));
        }
        for (v, val) in step.msg.iter().zip(&obs.msg) {
            self.run.env.set(*v, val.clone());
        }
        if p.timeout_owner(obs.step).is_some() {
            debug!(who = self.name(), step = obs.step, "timeout branch observed");
            self.host.on_timeout();
        }

        match &fx.next {
            Consensus::Running(snap) => {
                if let Some(def) = p.states.get(snap.state) {
                    for (v, val) in def.vars.iter().zip(&snap.svs) {
                        self.run.env.set(*v, val.clone());
                    }
                }
                if snap.state <= step.from {
                    self.run.rounds += 1;
                }
            }
            Consensus::Halted => {
                info!(who = self.name(), step = obs.step, outcome = ?fx.outcome, "halted");
                self.run.outcome = fx.outcome.clone();
                self.host.on_outcome(fx.outcome.as_ref());
            }
        }
        self.run.consensus = fx.next;
        Ok(())
    }
}
