//! Generation-time validation of a [`Protocol`].
//!
//! Every lowering runs this first; any failure aborts the whole compilation.
//! After validation a lowering may assume:
//! - ids, indices and timeout pairings are consistent,
//! - every state has at most one primary (non-timeout) step,
//! - state and message variables are scalar,
//! - every expression type-checks and only reads bound variables.

use crate::error::GenerationError;
use crate::ir::{Call, Expr, Local, Protocol, SenderCheck, Step, StepId, Stmt, Tail, VarId};
use std::collections::{BTreeMap, BTreeSet};
use tandem_digest::Kind;

fn malformed(msg: impl Into<String>) -> GenerationError {
    GenerationError::MalformedIr(msg.into())
}

fn type_err(step: StepId, detail: impl Into<String>) -> GenerationError {
    GenerationError::Type {
        step,
        detail: detail.into(),
    }
}

/// Validate the whole protocol.
pub fn validate(p: &Protocol) -> Result<(), GenerationError> {
    if p.participants.is_empty() {
        return Err(malformed("protocol has no participants"));
    }
    if p.states.is_empty() {
        return Err(malformed("protocol has no initial state"));
    }
    if p.steps.is_empty() {
        return Err(malformed("protocol has no steps"));
    }

    if !p.states[0].vars.is_empty() {
        return Err(malformed("initial state cannot carry variables"));
    }

    let mut labels = BTreeSet::new();
    for (i, st) in p.states.iter().enumerate() {
        if !labels.insert(st.label) {
            return Err(malformed(format!("state {i} reuses label {}", st.label)));
        }
        let mut seen = BTreeSet::new();
        for v in &st.vars {
            let kind = p
                .var_kind(*v)
                .ok_or_else(|| malformed(format!("state {i} names unknown variable #{v}")))?;
            if !kind.is_scalar() {
                return Err(malformed(format!("state {i} variable #{v} is not scalar ({kind})")));
            }
            if !seen.insert(*v) {
                return Err(malformed(format!("state {i} lists variable #{v} twice")));
            }
        }
    }

    for (i, s) in p.steps.iter().enumerate() {
        let expected = StepId::try_from(i + 1).map_err(|_| malformed("too many steps"))?;
        if s.id != expected {
            return Err(malformed(format!("step at index {i} has id {} (expected {expected})", s.id)));
        }
        if s.from >= p.states.len() {
            return Err(malformed(format!("step {} starts in unknown state {}", s.id, s.from)));
        }
        if s.who >= p.participants.len() {
            return Err(malformed(format!("step {} names unknown participant {}", s.id, s.who)));
        }
    }

    check_timeouts(p)?;
    check_locals(p)?;
    for s in &p.steps {
        check_step(p, s)?;
    }
    Ok(())
}

fn check_timeouts(p: &Protocol) -> Result<(), GenerationError> {
    let mut owners: BTreeMap<StepId, StepId> = BTreeMap::new();
    for s in &p.steps {
        let Some(t) = s.timeout else { continue };
        let target = p
            .step(t.on_timeout)
            .ok_or_else(|| malformed(format!("step {} times out to unknown step {}", s.id, t.on_timeout)))?;
        if target.id == s.id {
            return Err(malformed(format!("step {} times out to itself", s.id)));
        }
        if target.from != s.from {
            return Err(malformed(format!(
                "timeout step {} must start in state {} like step {}",
                target.id, s.from, s.id
            )));
        }
        if target.timeout.is_some() {
            return Err(malformed(format!("timeout step {} has its own deadline", target.id)));
        }
        if let Some(prev) = owners.insert(target.id, s.id) {
            return Err(malformed(format!(
                "step {} is the timeout of both step {prev} and step {}",
                target.id, s.id
            )));
        }
    }
    for st in 0..p.states.len() {
        let primaries = p
            .steps
            .iter()
            .filter(|s| s.from == st && !owners.contains_key(&s.id))
            .count();
        if primaries > 1 {
            return Err(malformed(format!("state {st} enables {primaries} primary steps")));
        }
    }
    Ok(())
}

/// Message variables must come from the submitter's own local computations.
fn check_locals(p: &Protocol) -> Result<(), GenerationError> {
    let mut produced: BTreeMap<usize, BTreeSet<VarId>> = BTreeMap::new();
    for s in &p.steps {
        let set = produced.entry(s.who).or_default();
        for l in &s.local {
            match l {
                Local::Interact { bind: Some(v), .. } | Local::Set { bind: v, .. } => {
                    set.insert(*v);
                }
                Local::Interact { bind: None, .. } => {}
            }
        }
    }
    for s in &p.steps {
        for v in &s.msg {
            if !produced.get(&s.who).is_some_and(|set| set.contains(v)) {
                return Err(type_err(
                    s.id,
                    format!("message variable #{v} is never computed by its submitter"),
                ));
            }
        }
    }
    Ok(())
}

fn check_expr(p: &Protocol, step: StepId, bound: &BTreeSet<VarId>, e: &Expr) -> Result<Kind, GenerationError> {
    fn reads(e: &Expr, out: &mut Vec<VarId>) {
        match e {
            Expr::Var(v) => out.push(*v),
            Expr::Bin(_, l, r) => {
                reads(l, out);
                reads(r, out);
            }
            Expr::Not(x) => reads(x, out),
            Expr::Digest(es) => es.iter().for_each(|x| reads(x, out)),
            Expr::UInt(_) | Expr::Txn(_) => {}
        }
    }
    let kind = p.kind_of(e).map_err(|d| type_err(step, d))?;
    let mut vs = Vec::new();
    reads(e, &mut vs);
    if let Some(v) = vs.into_iter().find(|v| !bound.contains(v)) {
        return Err(type_err(step, format!("variable #{v} read before it is bound")));
    }
    Ok(kind)
}

fn expect(p: &Protocol, step: StepId, bound: &BTreeSet<VarId>, e: &Expr, want: &Kind, what: &str) -> Result<(), GenerationError> {
    let k = check_expr(p, step, bound, e)?;
    if k == *want {
        Ok(())
    } else {
        Err(type_err(step, format!("{what} must be {want}, found {k}")))
    }
}

fn check_step(p: &Protocol, s: &Step) -> Result<(), GenerationError> {
    let id = s.id;
    let from = &p.states[s.from];
    let mut bound: BTreeSet<VarId> = from.vars.iter().copied().collect();

    if let Some(v) = s.bind_sender {
        if p.var_kind(v) != Some(&Kind::Address) {
            return Err(type_err(id, format!("sender binding #{v} must be an address")));
        }
        if !bound.insert(v) {
            return Err(type_err(id, format!("sender binding #{v} shadows a state variable")));
        }
    }
    for v in &s.msg {
        let k = p.var_kind(*v).ok_or_else(|| type_err(id, format!("unknown message variable #{v}")))?;
        if !k.is_scalar() {
            return Err(type_err(id, format!("message variable #{v} is not scalar")));
        }
        if !bound.insert(*v) {
            return Err(type_err(id, format!("message variable #{v} is already bound")));
        }
    }
    if let SenderCheck::Is(v) = s.sender {
        expect(p, id, &bound, &Expr::Var(v), &Kind::Address, "sender check")?;
    }
    expect(p, id, &bound, &s.pay, &Kind::UInt, "payment")?;

    // Locals see consensus state plus the submitter's earlier private values.
    let mut private: BTreeSet<VarId> = bound.clone();
    for l in &p.steps {
        if l.who == s.who && l.id < s.id {
            for x in &l.local {
                if let Local::Interact { bind: Some(v), .. } | Local::Set { bind: v, .. } = x {
                    private.insert(*v);
                }
            }
        }
    }
    for l in &s.local {
        match l {
            Local::Interact { bind, call } => {
                if let Call::AcceptOffer(e) = call {
                    check_expr(p, id, &private, e)?;
                }
                if let Some(v) = bind {
                    let k = p.var_kind(*v).ok_or_else(|| type_err(id, format!("unknown local #{v}")))?;
                    if matches!(call, Call::Randomness) && !matches!(k, Kind::UInt | Kind::Digest) {
                        return Err(type_err(id, format!("randomness bound to {k}")));
                    }
                    if matches!(call, Call::AcceptOffer(_)) && *k != Kind::Unit {
                        return Err(type_err(id, "offer result must be unit"));
                    }
                    private.insert(*v);
                }
            }
            Local::Set { bind, expr } => {
                let want = p.var_kind(*bind).cloned().ok_or_else(|| type_err(id, format!("unknown local #{bind}")))?;
                expect(p, id, &private, expr, &want, "local binding")?;
                private.insert(*bind);
            }
        }
    }

    for stmt in &s.body {
        match stmt {
            Stmt::Let(v, e) => {
                let want = p.var_kind(*v).cloned().ok_or_else(|| type_err(id, format!("unknown variable #{v}")))?;
                if !want.is_scalar() {
                    return Err(type_err(id, format!("let #{v} is not scalar")));
                }
                expect(p, id, &bound, e, &want, "let binding")?;
                if !bound.insert(*v) {
                    return Err(type_err(id, format!("let #{v} rebinds a variable")));
                }
            }
            Stmt::Assert(a) => expect(p, id, &bound, &a.cond, &Kind::UInt, &format!("assertion `{}`", a.msg))?,
        }
    }
    check_tail(p, id, &bound, &s.tail)
}

fn check_tail(p: &Protocol, id: StepId, bound: &BTreeSet<VarId>, tail: &Tail) -> Result<(), GenerationError> {
    match tail {
        Tail::If { cond, then, otherwise } => {
            expect(p, id, bound, cond, &Kind::UInt, "branch condition")?;
            check_tail(p, id, bound, then)?;
            check_tail(p, id, bound, otherwise)
        }
        Tail::Goto { state, assigns } => {
            let def = p
                .states
                .get(*state)
                .ok_or_else(|| malformed(format!("step {id} goes to unknown state {state}")))?;
            if *state == 0 {
                return Err(malformed(format!("step {id} re-enters the initial state")));
            }
            let mut after = bound.clone();
            for (v, e) in assigns {
                let want = p.var_kind(*v).cloned().ok_or_else(|| type_err(id, format!("unknown variable #{v}")))?;
                expect(p, id, bound, e, &want, "loop assignment")?;
                after.insert(*v);
            }
            if let Some(v) = def.vars.iter().find(|v| !after.contains(v)) {
                return Err(type_err(id, format!("state {state} needs variable #{v}, unbound here")));
            }
            Ok(())
        }
        Tail::Halt { payouts, outcome } => {
            for po in payouts {
                expect(p, id, bound, &po.to, &Kind::Address, "payout recipient")?;
                expect(p, id, bound, &po.amount, &Kind::UInt, "payout amount")?;
            }
            if let Some(o) = outcome {
                check_expr(p, id, bound, o)?;
            }
            Ok(())
        }
    }
}
