//! Reference step semantics.
//!
//! [`verify`] runs the verifier checks of one step over plain values, in the
//! order every backend lowering follows:
//!
//! 1. shape (state and message arity/kinds),
//! 2. identity (`sender correct`),
//! 3. payment (`pay amount correct`, exact equality),
//! 4. previous-state digest against storage,
//! 5. body (`Let`s and named assertions, in order),
//! 6. time window,
//! 7. tail: next-state digest, or payouts and the empty-tuple digest.
//!
//! It is the oracle the lowerings are tested against, the client's fast-fail
//! check, and what group assemblers use to precompute next digests.

use crate::error::{names, AssertionFailure, StepError};
use crate::ir::{
    BinOp, Expr, Protocol, SenderCheck, SrcLoc, StateId, Step, StepId, Stmt, Tail, TxnField,
    VarId, Window,
};
use serde::{Deserialize, Serialize};
use tandem_digest::{
    digest_values, empty_digest, encode, state_digest, Address, Digest, StateDigest, Value,
};

/// Logical consensus state of a running protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current state.
    pub state: StateId,
    /// Values of the state's persistent variables, in digest order.
    pub svs: Vec<Value>,
    /// Entry time (`t0` of every window measured from this state).
    pub time: u64,
}

impl Snapshot {
    /// State 0 entered at deployment time `time`.
    #[must_use]
    pub const fn initial(time: u64) -> Self {
        Self {
            state: 0,
            svs: Vec::new(),
            time,
        }
    }

    /// Both digests of this snapshot.
    pub fn digest(&self, p: &Protocol) -> Result<StateDigest, tandem_digest::ShapeMismatch> {
        let label = p.states.get(self.state).map_or(0, |s| s.label);
        state_digest(label, &p.state_kinds(self.state), &self.svs, self.time)
    }
}

/// Running or halted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consensus {
    /// In some state.
    Running(Snapshot),
    /// Paid out and stopped.
    Halted,
}

impl Consensus {
    /// The digest a ledger persists for this consensus (with time).
    pub fn stored_digest(&self, p: &Protocol) -> Result<Digest, tandem_digest::ShapeMismatch> {
        match self {
            Self::Running(s) => Ok(s.digest(p)?.with_time),
            Self::Halted => Ok(empty_digest()),
        }
    }
}

/// Everything a verifier sees of one submitted step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Authenticated submitter.
    pub sender: Address,
    /// Attached payment.
    pub value: u64,
    /// Ledger time at execution.
    pub time: u64,
    /// Claimed persistent variables of the `from` state.
    pub svs: Vec<Value>,
    /// Claimed entry time of the `from` state.
    pub prev_time: u64,
    /// Message values.
    pub msg: Vec<Value>,
}

/// A payout with its operands evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPayout {
    /// Recipient.
    pub to: Address,
    /// Amount.
    pub amount: u64,
}

/// What a step does once all checks pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effects {
    /// Consensus after the step.
    pub next: Consensus,
    /// Digests of `next` (both are the empty-tuple digest once halted).
    pub next_digest: StateDigest,
    /// Transfers out of escrow, in order.
    pub payouts: Vec<ResolvedPayout>,
    /// Value reported to hosts on halt.
    pub outcome: Option<Value>,
}

impl Effects {
    /// Whether the step halted the protocol.
    #[inline]
    #[must_use]
    pub const fn halted(&self) -> bool {
        matches!(self.next, Consensus::Halted)
    }
}

/// Transaction facts available to expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnCtx {
    /// Submitter.
    pub sender: Address,
    /// Attached payment.
    pub value: u64,
    /// Ledger time.
    pub time: u64,
}

/// Variable bindings for one evaluation, indexed by [`VarId`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Env(Vec<Option<Value>>);

impl Env {
    /// All variables of `p`, unbound.
    #[must_use]
    pub fn new(p: &Protocol) -> Self {
        Self(vec![None; p.vars.len()])
    }

    /// Read a binding.
    #[must_use]
    pub fn get(&self, v: VarId) -> Option<&Value> {
        self.0.get(v).and_then(Option::as_ref)
    }

    /// Bind (or rebind) `v`.
    pub fn set(&mut self, v: VarId, value: Value) {
        if v >= self.0.len() {
            self.0.resize(v + 1, None);
        }
        self.0[v] = Some(value);
    }

    /// Copy every binding of `other` over this one.
    pub fn overlay(&mut self, other: &Self) {
        for (v, val) in other.0.iter().enumerate() {
            if let Some(val) = val {
                self.set(v, val.clone());
            }
        }
    }

    /// Values of `vars`, or the first unbound one.
    pub fn collect(&self, vars: &[VarId]) -> Result<Vec<Value>, VarId> {
        vars.iter()
            .map(|v| self.get(*v).cloned().ok_or(*v))
            .collect()
    }
}

/// Evaluate `e` under `env` for step `step`.
pub fn eval_expr(env: &Env, txn: &TxnCtx, step: StepId, e: &Expr) -> Result<Value, StepError> {
    match e {
        Expr::UInt(n) => Ok(Value::UInt(*n)),
        Expr::Var(v) => env
            .get(*v)
            .cloned()
            .ok_or(StepError::Unbound { step, var: *v }),
        Expr::Txn(TxnField::Sender) => Ok(Value::Address(txn.sender)),
        Expr::Txn(TxnField::Value) => Ok(Value::UInt(txn.value)),
        Expr::Txn(TxnField::Time) => Ok(Value::UInt(txn.time)),
        Expr::Not(inner) => {
            let v = uint_of(step, &eval_expr(env, txn, step, inner)?)?;
            Ok(Value::UInt(u64::from(v == 0)))
        }
        Expr::Bin(op, l, r) => {
            let lv = eval_expr(env, txn, step, l)?;
            let rv = eval_expr(env, txn, step, r)?;
            eval_bin(step, *op, &lv, &rv)
        }
        Expr::Digest(es) => {
            let vs = es
                .iter()
                .map(|x| eval_expr(env, txn, step, x))
                .collect::<Result<Vec<_>, _>>()?;
            digest_values(&vs)
                .map(Value::Digest)
                .map_err(|source| StepError::Shape { step, source })
        }
    }
}

/// First address of `sub` with no 20-byte form.
fn wide_address(sub: &Submission) -> Option<String> {
    if !sub.sender.is_short() {
        return Some("sender".into());
    }
    let wide = |v: &Value| matches!(v, Value::Address(a) if !a.is_short());
    sub.svs
        .iter()
        .position(wide)
        .map(|i| format!("svs.{i}"))
        .or_else(|| sub.msg.iter().position(wide).map(|i| format!("msg.{i}")))
}

fn uint_of(step: StepId, v: &Value) -> Result<u64, StepError> {
    v.as_uint().ok_or_else(|| StepError::Type {
        step,
        detail: format!("expected uint, found {}", v.kind()),
    })
}

fn eval_bin(step: StepId, op: BinOp, l: &Value, r: &Value) -> Result<Value, StepError> {
    if op.is_equality() {
        if l.kind() != r.kind() {
            return Err(StepError::Type {
                step,
                detail: format!("`{op}` on {} and {}", l.kind(), r.kind()),
            });
        }
        let same = l == r;
        return Ok(Value::UInt(u64::from(if op == BinOp::Eq { same } else { !same })));
    }
    let (a, b) = (uint_of(step, l)?, uint_of(step, r)?);
    let fault = || StepError::Arithmetic {
        step,
        op: op.symbol().to_owned(),
    };
    let n = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(fault)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(fault)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(fault)?,
        BinOp::Div => a.checked_div(b).ok_or_else(fault)?,
        BinOp::Mod => a.checked_rem(b).ok_or_else(fault)?,
        BinOp::Lt => u64::from(a < b),
        BinOp::Le => u64::from(a <= b),
        BinOp::Gt => u64::from(a > b),
        BinOp::Ge => u64::from(a >= b),
        BinOp::And => u64::from(a != 0 && b != 0),
        BinOp::Or => u64::from(a != 0 || b != 0),
        BinOp::Eq => u64::from(a == b),
        BinOp::Ne => u64::from(a != b),
    };
    Ok(Value::UInt(n))
}

fn who_name(p: &Protocol, step: &Step) -> String {
    p.participants
        .get(step.who)
        .map_or_else(|| format!("#{}", step.who), |x| x.name.clone())
}

fn fail(p: &Protocol, step: &Step, msg: &str, at: &SrcLoc, frames: &[SrcLoc]) -> StepError {
    StepError::Assertion(Box::new(AssertionFailure {
        step: step.id,
        who: who_name(p, step),
        msg: msg.to_owned(),
        at: at.clone(),
        frames: frames.to_vec(),
    }))
}

/// Run every check of step `id` against `sub`.
///
/// `stored` is the persisted digest (with time); `None` skips check 4, which
/// is what assemblers use to precompute effects of an unauthenticated claim.
pub fn verify(
    p: &Protocol,
    id: StepId,
    stored: Option<&Digest>,
    sub: &Submission,
) -> Result<Effects, StepError> {
    let step = p.step(id).ok_or(StepError::UnknownStep { step: id })?;
    if stored.is_some_and(|d| *d == empty_digest()) {
        return Err(StepError::Halted { step: id });
    }
    let from = p.states.get(step.from).ok_or(StepError::UnknownStep { step: id })?;

    // 1. shape
    let svs_kinds = p.state_kinds(step.from);
    encode(&svs_kinds, &sub.svs).map_err(|source| StepError::Shape { step: id, source })?;
    encode(&p.msg_kinds(step), &sub.msg).map_err(|source| StepError::Shape { step: id, source })?;
    if let Some(slot) = wide_address(sub) {
        return Err(StepError::WideAddress { step: id, slot });
    }

    let mut env = Env::new(p);
    for (v, val) in from.vars.iter().zip(&sub.svs) {
        env.set(*v, val.clone());
    }
    if let Some(v) = step.bind_sender {
        env.set(v, Value::Address(sub.sender));
    }
    for (v, val) in step.msg.iter().zip(&sub.msg) {
        env.set(*v, val.clone());
    }
    let txn = TxnCtx {
        sender: sub.sender,
        value: sub.value,
        time: sub.time,
    };

    // 2. identity
    if let SenderCheck::Is(v) = step.sender {
        let expected = eval_expr(&env, &txn, id, &Expr::Var(v))?;
        if expected != Value::Address(sub.sender) {
            return Err(fail(p, step, names::SENDER, &step.at, &[]));
        }
    }

    // 3. payment
    let pay = uint_of(id, &eval_expr(&env, &txn, id, &step.pay)?)?;
    if pay != sub.value {
        return Err(fail(p, step, names::PAY, &step.at, &[]));
    }

    // 4. previous state
    if let Some(stored) = stored {
        let computed = state_digest(from.label, &svs_kinds, &sub.svs, sub.prev_time)
            .map_err(|source| StepError::Shape { step: id, source })?
            .with_time;
        if computed != *stored {
            return Err(StepError::DigestMismatch {
                step: id,
                stored: *stored,
                computed,
            });
        }
    }

    // 5. body
    for stmt in &step.body {
        match stmt {
            Stmt::Let(v, e) => {
                let val = eval_expr(&env, &txn, id, e)?;
                env.set(*v, val);
            }
            Stmt::Assert(a) => {
                if !eval_expr(&env, &txn, id, &a.cond)?.is_truthy() {
                    return Err(fail(p, step, &a.msg, &a.at, &a.frames));
                }
            }
        }
    }

    // 6. window
    let window = p.window(id);
    if !window.admits(sub.prev_time, sub.time) {
        return Err(StepError::Window {
            step: id,
            window,
            anchor: sub.prev_time,
            time: sub.time,
        });
    }

    // 7. tail
    run_tail(p, step, &mut env, &txn, sub.time, &step.tail)
}

fn run_tail(
    p: &Protocol,
    step: &Step,
    env: &mut Env,
    txn: &TxnCtx,
    time: u64,
    tail: &Tail,
) -> Result<Effects, StepError> {
    let id = step.id;
    match tail {
        Tail::If {
            cond,
            then,
            otherwise,
        } => {
            let next = if eval_expr(env, txn, id, cond)?.is_truthy() {
                then
            } else {
                otherwise
            };
            run_tail(p, step, env, txn, time, next)
        }
        Tail::Goto { state, assigns } => {
            let updated = assigns
                .iter()
                .map(|(v, e)| eval_expr(env, txn, id, e).map(|val| (*v, val)))
                .collect::<Result<Vec<_>, _>>()?;
            for (v, val) in updated {
                env.set(v, val);
            }
            let def = p.states.get(*state).ok_or(StepError::UnknownStep { step: id })?;
            let svs = env
                .collect(&def.vars)
                .map_err(|var| StepError::Unbound { step: id, var })?;
            let snap = Snapshot {
                state: *state,
                svs,
                time,
            };
            let next_digest = snap
                .digest(p)
                .map_err(|source| StepError::Shape { step: id, source })?;
            Ok(Effects {
                next: Consensus::Running(snap),
                next_digest,
                payouts: Vec::new(),
                outcome: None,
            })
        }
        Tail::Halt { payouts, outcome } => {
            let mut resolved = Vec::with_capacity(payouts.len());
            for po in payouts {
                let to = eval_expr(env, txn, id, &po.to)?;
                let to = *to.as_address().ok_or_else(|| StepError::Type {
                    step: id,
                    detail: format!("payout recipient is {}", to.kind()),
                })?;
                let amount = uint_of(id, &eval_expr(env, txn, id, &po.amount)?)?;
                resolved.push(ResolvedPayout { to, amount });
            }
            let outcome = outcome
                .as_ref()
                .map(|e| eval_expr(env, txn, id, e))
                .transpose()?;
            let empty = empty_digest();
            Ok(Effects {
                next: Consensus::Halted,
                next_digest: StateDigest {
                    with_time: empty,
                    no_time: empty,
                },
                payouts: resolved,
                outcome,
            })
        }
    }
}

/// Whether `window` would admit a submission at `now` for a state entered at `anchor`.
#[must_use]
pub fn in_window(window: Window, anchor: u64, now: u64) -> bool {
    window.admits(anchor, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build::*;
    use crate::ir::{Participant, StateDef, VarDecl};
    use tandem_digest::Kind;

    fn addr(b: u8) -> Address {
        Address::from_short([b; 20])
    }

    /// Deposit `amt` from A, then A withdraws it.
    fn deposit() -> Protocol {
        Protocol {
            name: "deposit".into(),
            version: 1,
            participants: vec![Participant { name: "A".into() }],
            vars: vec![
                VarDecl { name: "a".into(), kind: Kind::Address },
                VarDecl { name: "amt".into(), kind: Kind::UInt },
            ],
            states: vec![
                StateDef { label: 0, vars: vec![] },
                StateDef { label: 1, vars: vec![0, 1] },
            ],
            steps: vec![
                Step {
                    id: 1,
                    from: 0,
                    who: 0,
                    sender: SenderCheck::Anyone,
                    bind_sender: Some(0),
                    msg: vec![1],
                    pay: var(1),
                    local: vec![],
                    body: vec![],
                    timeout: None,
                    tail: Tail::Goto { state: 1, assigns: vec![] },
                    at: SrcLoc::default(),
                },
                Step {
                    id: 2,
                    from: 1,
                    who: 0,
                    sender: SenderCheck::Is(0),
                    bind_sender: None,
                    msg: vec![],
                    pay: uint(0),
                    local: vec![],
                    body: vec![],
                    timeout: None,
                    tail: Tail::Halt {
                        payouts: vec![crate::ir::Payout { to: var(0), amount: var(1) }],
                        outcome: Some(uint(7)),
                    },
                    at: SrcLoc::default(),
                },
            ],
        }
    }

    #[test]
    fn deposit_then_withdraw() {
        let p = deposit();
        let s0 = Snapshot::initial(5);
        let stored = Consensus::Running(s0).stored_digest(&p).unwrap();
        let fx = verify(
            &p,
            1,
            Some(&stored),
            &Submission {
                sender: addr(1),
                value: 40,
                time: 6,
                svs: vec![],
                prev_time: 5,
                msg: vec![Value::UInt(40)],
            },
        )
        .unwrap();
        let Consensus::Running(s1) = fx.next.clone() else { panic!("halted") };
        assert_eq!(s1.svs, vec![Value::Address(addr(1)), Value::UInt(40)]);

        let fx2 = verify(
            &p,
            2,
            Some(&fx.next_digest.with_time),
            &Submission {
                sender: addr(1),
                value: 0,
                time: 9,
                svs: s1.svs.clone(),
                prev_time: 6,
                msg: vec![],
            },
        )
        .unwrap();
        assert!(fx2.halted());
        assert_eq!(fx2.payouts, vec![ResolvedPayout { to: addr(1), amount: 40 }]);
        assert_eq!(fx2.outcome, Some(Value::UInt(7)));
        assert_eq!(fx2.next_digest.with_time, empty_digest());
    }

    #[test]
    fn checks_fire_in_order() {
        let p = deposit();
        let stored = Consensus::Running(Snapshot::initial(5)).stored_digest(&p).unwrap();
        let sub = Submission {
            sender: addr(1),
            value: 39,
            time: 6,
            svs: vec![],
            prev_time: 4,
            msg: vec![Value::UInt(40)],
        };
        // Payment is checked before the (also wrong) previous time.
        let err = verify(&p, 1, Some(&stored), &sub).unwrap_err();
        assert_eq!(err.reason(), crate::Reason::Assertion(names::PAY.into()));

        let err = verify(&p, 1, Some(&stored), &Submission { value: 40, ..sub.clone() }).unwrap_err();
        assert!(matches!(err, StepError::DigestMismatch { .. }));

        let err = verify(&p, 1, Some(&stored), &Submission { msg: vec![], ..sub }).unwrap_err();
        assert!(matches!(err, StepError::Shape { .. }));
    }

    #[test]
    fn addresses_must_have_a_short_form() {
        let p = deposit();
        let mut wide = [0u8; 32];
        wide[0] = 1;
        let sub = Submission {
            sender: addr(1),
            value: 0,
            time: 9,
            svs: vec![Value::Address(Address(wide)), Value::UInt(0)],
            prev_time: 4,
            msg: vec![],
        };
        let err = verify(&p, 2, None, &sub).unwrap_err();
        assert_eq!(err, StepError::WideAddress { step: 2, slot: "svs.0".into() });
        assert_eq!(err.reason(), crate::Reason::Shape);

        let sub = Submission {
            sender: Address(wide),
            svs: vec![],
            msg: vec![Value::UInt(0)],
            ..sub
        };
        let err = verify(&p, 1, None, &sub).unwrap_err();
        assert_eq!(err, StepError::WideAddress { step: 1, slot: "sender".into() });
    }

    #[test]
    fn halted_rejects_everything() {
        let p = deposit();
        let sub = Submission {
            sender: addr(1),
            value: 0,
            time: 0,
            svs: vec![],
            prev_time: 0,
            msg: vec![Value::UInt(0)],
        };
        let err = verify(&p, 1, Some(&empty_digest()), &sub).unwrap_err();
        assert!(matches!(err, StepError::Halted { step: 1 }));
    }

    #[test]
    fn arithmetic_is_checked() {
        let env = Env::default();
        let txn = TxnCtx { sender: addr(0), value: 0, time: 0 };
        let e = sub(uint(1), uint(2));
        assert!(matches!(eval_expr(&env, &txn, 3, &e), Err(StepError::Arithmetic { step: 3, .. })));
        let e = rem(uint(1), uint(0));
        assert!(eval_expr(&env, &txn, 3, &e).is_err());
        let e = add(uint(u64::MAX), uint(1));
        assert!(eval_expr(&env, &txn, 3, &e).is_err());
        assert_eq!(eval_expr(&env, &txn, 3, &rem(uint(5), uint(3))), Ok(Value::UInt(2)));
    }
}
