//! Lowering to the stack machine.
//!
//! Every step becomes a *handler* logic signature `m<id>` that approves
//! `gtxn 2` of a group laid out as:
//!
//! | index | transaction                                             |
//! |-------|---------------------------------------------------------|
//! | 0     | application call, args below                            |
//! | 1     | payment submitter → escrow (`{{ContractAddr}}`)         |
//! | 2     | zero-amount transaction signed by the handler           |
//! | 3…    | escrow → recipient payouts (halting steps only)         |
//!
//! Application arguments: `[prevSt_noTime, nextSt_noTime, halt (8 bytes),
//! lastTime (8 bytes), svs…, msg…]`. UInt arguments are 8-byte big-endian,
//! addresses and digests 32 bytes.
//!
//! The handler re-derives the previous and next digests from the arguments.
//! The application (`approval`) only compares `prevSt` and `lastTime` with
//! its globals `s`/`l`, refuses once `h` is set, and stores the new values;
//! it trusts any of the `{{m<i>}}` handlers to have checked the rest.
//! `escrow` releases funds only inside a group that calls the application.
//! `init` is the bootstrap approval program: it seeds state 0 and accepts the
//! deployer's update to `approval` once handler addresses are known.
//! `clear` is the clear-state program: a lone call, accepted only after the
//! halt.

use crate::asm::{Field, GlobalField, Imm, Line, Op, Program, ON_NOOP, ON_UPDATE, TYPE_APPL, TYPE_PAY};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tandem_core::{
    names, BackendArtifact, BackendKind, BinOp, CompileConfig, Expr, GenerationError, Protocol,
    Reason, SenderCheck, Step, StepId, Stmt, Tail, TxnField, VarId, Window,
};
use tandem_digest::{empty_digest, state_digest, tag, Kind};

/// `prevSt_noTime`
pub const ARG_PREV: u8 = 0;
/// `nextSt_noTime`
pub const ARG_NEXT: u8 = 1;
/// Halt flag.
pub const ARG_HALT: u8 = 2;
/// Entry time of the `from` state.
pub const ARG_LAST: u8 = 3;
/// First state variable.
pub const ARG_BASE: u8 = 4;
/// Application arguments a call may carry.
pub const MAX_APP_ARGS: usize = 16;

/// Group position of the application call.
pub const GTXN_APP: u8 = 0;
/// Group position of the payment into escrow.
pub const GTXN_PAY: u8 = 1;
/// Group position of the handler transaction.
pub const GTXN_HANDLER: u8 = 2;
/// Group position of the first payout.
pub const GTXN_PAYOUT: u8 = 3;

/// Placeholder for the application id.
pub const APP_ID: &str = "ApplicationID";
/// Placeholder for the escrow address.
pub const CONTRACT_ADDR: &str = "ContractAddr";
/// Placeholder for the deployer address.
pub const DEPLOYER: &str = "Deployer";

/// Global holding the no-time digest.
pub const GLOBAL_STATE: &str = "s";
/// Global holding the entry time.
pub const GLOBAL_LAST: &str = "l";
/// Global holding the halted flag.
pub const GLOBAL_HALTED: &str = "h";

/// Reason note of an opt-out before the halt.
pub const RUNNING: &str = "running";

/// Program (and placeholder) name of step `id`'s handler.
#[must_use]
pub fn handler_name(id: StepId) -> String {
    format!("m{id}")
}

/// A lowered step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    /// Step this handler approves.
    pub step: StepId,
    /// Handler program.
    pub program: Program,
    /// Largest number of payouts it emits.
    pub max_payouts: usize,
}

#[derive(Debug, Clone)]
enum Src {
    Arg(u8, Kind),
    Sender,
    Scratch(u8, Kind),
}

struct Emitter<'a> {
    p: &'a Protocol,
    step: &'a Step,
    lines: Vec<Line>,
    vars: BTreeMap<VarId, Src>,
    next_slot: u16,
    next_label: usize,
}

fn unsupported(step: StepId, detail: impl Into<String>) -> GenerationError {
    GenerationError::UnsupportedStep {
        step,
        detail: detail.into(),
    }
}

fn tag_of(step: StepId, k: &Kind) -> Result<u8, GenerationError> {
    match k {
        Kind::UInt => Ok(tag::UINT),
        Kind::Address => Ok(tag::ADDRESS),
        Kind::Digest => Ok(tag::DIGEST),
        other => Err(unsupported(step, format!("{other} is not a ledger scalar"))),
    }
}

fn width_of(step: StepId, k: &Kind) -> Result<u64, GenerationError> {
    k.arg_width()
        .and_then(|w| u64::try_from(w).ok())
        .ok_or_else(|| unsupported(step, format!("{k} has no argument encoding")))
}

impl<'a> Emitter<'a> {
    fn new(p: &'a Protocol, step: &'a Step) -> Self {
        Self {
            p,
            step,
            lines: Vec::new(),
            vars: BTreeMap::new(),
            next_slot: 0,
            next_label: 0,
        }
    }

    fn op(&mut self, op: Op) {
        self.lines.push(Line::bare(op));
    }

    fn int(&mut self, n: u64) {
        self.op(Op::Int(Imm::Int(n)));
    }

    /// `assert`, tagged with the reason a failure reports.
    fn check(&mut self, reason: &Reason) {
        self.lines.push(Line {
            op: Op::Assert,
            note: Some(reason.note()),
        });
    }

    /// `<top> == <pushed by f>; assert`
    fn check_eq(&mut self, reason: &Reason) {
        self.op(Op::Eq);
        self.check(reason);
    }

    fn alloc(&mut self) -> Result<u8, GenerationError> {
        let slot = u8::try_from(self.next_slot).map_err(|_| unsupported(self.step.id, "out of scratch slots"))?;
        self.next_slot += 1;
        Ok(slot)
    }

    fn label(&mut self, what: &str) -> String {
        self.next_label += 1;
        format!("{what}_{}", self.next_label)
    }

    fn kind_of(&self, e: &Expr) -> Result<Kind, GenerationError> {
        self.p.kind_of(e).map_err(|detail| GenerationError::Type {
            step: self.step.id,
            detail,
        })
    }

    /// Push `v` in native form (uint for `UInt`, bytes otherwise).
    fn var(&mut self, v: VarId) -> Result<(), GenerationError> {
        let src = self
            .vars
            .get(&v)
            .cloned()
            .ok_or_else(|| GenerationError::Type {
                step: self.step.id,
                detail: format!("variable #{v} is not available on-ledger"),
            })?;
        match src {
            Src::Arg(k, kind) => {
                self.op(Op::Gtxna(GTXN_APP, k));
                if kind == Kind::UInt {
                    self.op(Op::Btoi);
                }
            }
            Src::Sender => self.op(Op::Gtxn(GTXN_APP, Field::Sender)),
            Src::Scratch(s, _) => self.op(Op::Load(s)),
        }
        Ok(())
    }

    fn expr(&mut self, e: &Expr) -> Result<(), GenerationError> {
        match e {
            Expr::UInt(n) => self.int(*n),
            Expr::Var(v) => self.var(*v)?,
            Expr::Txn(TxnField::Sender) => self.op(Op::Gtxn(GTXN_APP, Field::Sender)),
            Expr::Txn(TxnField::Value) => self.op(Op::Gtxn(GTXN_PAY, Field::Amount)),
            Expr::Txn(TxnField::Time) => self.op(Op::Global(GlobalField::Round)),
            Expr::Not(x) => {
                self.expr(x)?;
                self.op(Op::Not);
            }
            Expr::Bin(op, l, r) => {
                self.expr(l)?;
                self.expr(r)?;
                self.op(match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Mod => Op::Mod,
                    BinOp::Eq => Op::Eq,
                    BinOp::Ne => Op::Ne,
                    BinOp::Lt => Op::Lt,
                    BinOp::Le => Op::Le,
                    BinOp::Gt => Op::Gt,
                    BinOp::Ge => Op::Ge,
                    BinOp::And => Op::And,
                    BinOp::Or => Op::Or,
                });
            }
            Expr::Digest(es) => {
                self.op(Op::Byte(Imm::Bytes(Vec::new())));
                for x in es {
                    let k = self.kind_of(x)?;
                    self.slot_begin(&k)?;
                    self.expr(x)?;
                    self.slot_end(&k, true);
                }
                self.op(Op::Keccak256);
            }
        }
        Ok(())
    }

    /// Push the tag of the next digest slot.
    fn slot_begin(&mut self, k: &Kind) -> Result<(), GenerationError> {
        let t = tag_of(self.step.id, k)?;
        self.op(Op::Byte(Imm::Bytes(vec![t])));
        Ok(())
    }

    /// Fold `tag ‖ value` into the accumulator below them.
    fn slot_end(&mut self, k: &Kind, native: bool) {
        if native && *k == Kind::UInt {
            self.op(Op::Itob);
        }
        self.op(Op::Concat);
        self.op(Op::Concat);
    }

    /// Accumulator seeded with the state label.
    fn digest_label(&mut self, label: u64) {
        self.op(Op::Byte(Imm::Bytes(Vec::new())));
        self.op(Op::Byte(Imm::Bytes(vec![tag::UINT])));
        self.int(label);
        self.slot_end(&Kind::UInt, true);
    }

    fn tail(&mut self, t: &Tail) -> Result<(), GenerationError> {
        match t {
            Tail::If {
                cond,
                then,
                otherwise,
            } => {
                let other = self.label("else");
                self.expr(cond)?;
                self.op(Op::Bz(other.clone()));
                self.tail(then)?;
                self.op(Op::Label(other));
                self.tail(otherwise)
            }
            Tail::Goto { state, assigns } => {
                let saved = self.vars.clone();
                let mut updated = Vec::with_capacity(assigns.len());
                for (v, e) in assigns {
                    let k = self.kind_of(e)?;
                    self.expr(e)?;
                    let slot = self.alloc()?;
                    self.op(Op::Store(slot));
                    updated.push((*v, Src::Scratch(slot, k)));
                }
                self.vars.extend(updated);

                let def = self
                    .p
                    .states
                    .get(*state)
                    .ok_or_else(|| GenerationError::MalformedIr(format!("unknown state {state}")))?;
                self.digest_label(def.label);
                for v in &def.vars {
                    let k = self.p.var_kind(*v).cloned().unwrap_or(Kind::Unit);
                    self.slot_begin(&k)?;
                    self.var(*v)?;
                    self.slot_end(&k, true);
                }
                self.op(Op::Keccak256);
                self.op(Op::Gtxna(GTXN_APP, ARG_NEXT));
                self.check_eq(&Reason::Digest);

                self.op(Op::Gtxna(GTXN_APP, ARG_HALT));
                self.op(Op::Btoi);
                self.int(0);
                self.check_eq(&Reason::Shape);
                self.op(Op::Global(GlobalField::GroupSize));
                self.int(u64::from(GTXN_PAYOUT));
                self.check_eq(&Reason::Shape);
                self.int(1);
                self.op(Op::Return);

                self.vars = saved;
                Ok(())
            }
            Tail::Halt { payouts, outcome } => {
                let mut resolved = Vec::with_capacity(payouts.len());
                for po in payouts {
                    self.expr(&po.to)?;
                    let to = self.alloc()?;
                    self.op(Op::Store(to));
                    self.expr(&po.amount)?;
                    let amount = self.alloc()?;
                    self.op(Op::Store(amount));
                    resolved.push((to, amount));
                }
                if let Some(o) = outcome {
                    self.expr(o)?;
                    self.op(Op::Pop);
                }

                self.op(Op::Gtxna(GTXN_APP, ARG_NEXT));
                self.op(Op::Byte(Imm::Bytes(empty_digest().0.to_vec())));
                self.check_eq(&Reason::Digest);
                self.op(Op::Gtxna(GTXN_APP, ARG_HALT));
                self.op(Op::Btoi);
                self.int(1);
                self.check_eq(&Reason::Shape);
                let n = u8::try_from(payouts.len())
                    .ok()
                    .and_then(|n| n.checked_add(GTXN_PAYOUT))
                    .ok_or_else(|| unsupported(self.step.id, "too many payouts"))?;
                self.op(Op::Global(GlobalField::GroupSize));
                self.int(u64::from(n));
                self.check_eq(&Reason::Shape);

                for (i, (to, amount)) in (GTXN_PAYOUT..).zip(resolved) {
                    self.op(Op::Gtxn(i, Field::TypeEnum));
                    self.int(TYPE_PAY);
                    self.check_eq(&Reason::Shape);
                    self.op(Op::Gtxn(i, Field::Sender));
                    self.op(Op::Byte(Imm::Template(CONTRACT_ADDR.into())));
                    self.check_eq(&Reason::Shape);
                    self.op(Op::Gtxn(i, Field::Receiver));
                    self.op(Op::Load(to));
                    self.check_eq(&Reason::Shape);
                    self.op(Op::Gtxn(i, Field::Amount));
                    self.op(Op::Load(amount));
                    self.check_eq(&Reason::Shape);
                }
                self.int(1);
                self.op(Op::Return);
                Ok(())
            }
        }
    }
}

/// Lower one validated step to its handler program.
pub fn handler(p: &Protocol, step: &Step, cfg: &CompileConfig) -> Result<Handler, GenerationError> {
    let id = step.id;
    let from = p
        .states
        .get(step.from)
        .ok_or_else(|| GenerationError::MalformedIr(format!("step {id} starts in unknown state")))?;
    let svs_kinds = p.state_kinds(step.from);
    let msg_kinds = p.msg_kinds(step);
    let nargs = usize::from(ARG_BASE) + svs_kinds.len() + msg_kinds.len();
    if nargs > MAX_APP_ARGS {
        return Err(unsupported(id, format!("{nargs} application arguments exceed {MAX_APP_ARGS}")));
    }
    let max_payouts = step.tail.max_payouts();
    if usize::from(GTXN_PAYOUT) + max_payouts > cfg.max_group_size {
        return Err(unsupported(
            id,
            format!("{max_payouts} payouts exceed a group of {}", cfg.max_group_size),
        ));
    }

    let mut e = Emitter::new(p, step);
    let mut widths = vec![32u64, 32, 8, 8];
    let mut k = ARG_BASE;
    for (v, kind) in from.vars.iter().zip(&svs_kinds) {
        e.vars.insert(*v, Src::Arg(k, kind.clone()));
        widths.push(width_of(id, kind)?);
        k += 1;
    }
    for (v, kind) in step.msg.iter().zip(&msg_kinds) {
        e.vars.insert(*v, Src::Arg(k, kind.clone()));
        widths.push(width_of(id, kind)?);
        k += 1;
    }
    if let Some(v) = step.bind_sender {
        e.vars.insert(v, Src::Sender);
    }

    // 1. group shape
    let shape = Reason::Shape;
    e.op(Op::Global(GlobalField::GroupSize));
    e.int(u64::from(GTXN_PAYOUT));
    e.op(Op::Ge);
    e.check(&shape);
    e.op(Op::Txn(Field::GroupIndex));
    e.int(u64::from(GTXN_HANDLER));
    e.check_eq(&shape);
    e.op(Op::Txn(Field::Amount));
    e.int(0);
    e.check_eq(&shape);
    e.op(Op::Gtxn(GTXN_APP, Field::TypeEnum));
    e.int(TYPE_APPL);
    e.check_eq(&shape);
    e.op(Op::Gtxn(GTXN_APP, Field::ApplicationID));
    e.op(Op::Int(Imm::Template(APP_ID.into())));
    e.check_eq(&shape);
    e.op(Op::Gtxn(GTXN_APP, Field::OnCompletion));
    e.int(ON_NOOP);
    e.check_eq(&shape);
    e.op(Op::Gtxn(GTXN_APP, Field::NumAppArgs));
    e.int(u64::try_from(nargs).unwrap_or(u64::MAX));
    e.check_eq(&shape);
    e.op(Op::Gtxn(GTXN_PAY, Field::TypeEnum));
    e.int(TYPE_PAY);
    e.check_eq(&shape);
    e.op(Op::Gtxn(GTXN_PAY, Field::Receiver));
    e.op(Op::Byte(Imm::Template(CONTRACT_ADDR.into())));
    e.check_eq(&shape);
    e.op(Op::Gtxn(GTXN_PAY, Field::Sender));
    e.op(Op::Gtxn(GTXN_APP, Field::Sender));
    e.check_eq(&shape);
    for (arg, w) in (0u8..).zip(&widths) {
        e.op(Op::Gtxna(GTXN_APP, arg));
        e.op(Op::Len);
        e.int(*w);
        e.check_eq(&shape);
    }
    // addresses must have a 20-byte account form
    let short = |e: &mut Emitter<'_>| {
        e.op(Op::Extract(0, 12));
        e.op(Op::Byte(Imm::Bytes(vec![0; 12])));
        e.check_eq(&shape);
    };
    e.op(Op::Gtxn(GTXN_APP, Field::Sender));
    short(&mut e);
    for (arg, kind) in (ARG_BASE..).zip(svs_kinds.iter().chain(&msg_kinds)) {
        if *kind == Kind::Address {
            e.op(Op::Gtxna(GTXN_APP, arg));
            short(&mut e);
        }
    }

    // 2. identity
    if let SenderCheck::Is(v) = step.sender {
        e.op(Op::Gtxn(GTXN_APP, Field::Sender));
        e.var(v)?;
        e.check_eq(&Reason::Assertion(names::SENDER.into()));
    }

    // 3. payment
    e.op(Op::Gtxn(GTXN_PAY, Field::Amount));
    e.expr(&step.pay)?;
    e.check_eq(&Reason::Assertion(names::PAY.into()));

    // 4. previous state
    e.digest_label(from.label);
    for (arg, kind) in (ARG_BASE..).zip(&svs_kinds) {
        e.slot_begin(kind)?;
        e.op(Op::Gtxna(GTXN_APP, arg));
        e.slot_end(kind, false);
    }
    e.op(Op::Keccak256);
    e.op(Op::Gtxna(GTXN_APP, ARG_PREV));
    e.check_eq(&Reason::Digest);

    // 5. body
    for stmt in &step.body {
        match stmt {
            Stmt::Let(v, x) => {
                let kind = e.kind_of(x)?;
                e.expr(x)?;
                let slot = e.alloc()?;
                e.op(Op::Store(slot));
                e.vars.insert(*v, Src::Scratch(slot, kind));
            }
            Stmt::Assert(a) => {
                e.expr(&a.cond)?;
                e.check(&Reason::Assertion(a.msg.clone()));
            }
        }
    }

    // 6. window
    let window = p.window(id);
    // `Round - l` against δ, so a deadline past the last round never faults.
    let elapsed = |e: &mut Emitter<'_>| {
        e.op(Op::Global(GlobalField::Round));
        e.op(Op::Gtxna(GTXN_APP, ARG_LAST));
        e.op(Op::Btoi);
    };
    match window {
        Window::Open => {}
        Window::Within(d) => {
            let open = e.label("in_time");
            elapsed(&mut e);
            e.op(Op::Lt);
            e.op(Op::Bnz(open.clone()));
            elapsed(&mut e);
            e.op(Op::Sub);
            e.int(d);
            e.op(Op::Le);
            e.check(&Reason::Window);
            e.op(Op::Label(open));
        }
        Window::After(d) => {
            elapsed(&mut e);
            e.op(Op::Ge);
            e.check(&Reason::Window);
            elapsed(&mut e);
            e.op(Op::Sub);
            e.int(d);
            e.op(Op::Gt);
            e.check(&Reason::Window);
        }
    }

    // 7. tail
    e.tail(&step.tail)?;

    let mut program = Program::new(cfg.pragma_version);
    program.lines = e.lines;
    Ok(Handler {
        step: id,
        program,
        max_payouts,
    })
}

fn global(name: &str) -> Op {
    Op::Byte(Imm::Str(name.to_owned()))
}

fn check_line(reason: &Reason) -> Line {
    Line {
        op: Op::Assert,
        note: Some(reason.note()),
    }
}

/// The application's steady-state approval program.
#[must_use]
pub fn approval(p: &Protocol, cfg: &CompileConfig) -> Program {
    let b = Line::bare;
    let mut prog = Program::new(cfg.pragma_version);
    let l = &mut prog.lines;
    l.extend([
        b(Op::Txn(Field::OnCompletion)),
        b(Op::Int(Imm::Int(ON_NOOP))),
        b(Op::Eq),
        check_line(&Reason::Shape),
        b(Op::Txn(Field::GroupIndex)),
        b(Op::Int(Imm::Int(u64::from(GTXN_APP)))),
        b(Op::Eq),
        check_line(&Reason::Shape),
    ]);
    for (i, s) in p.steps.iter().enumerate() {
        l.push(b(Op::Gtxn(GTXN_HANDLER, Field::Sender)));
        l.push(b(Op::Byte(Imm::Template(handler_name(s.id)))));
        l.push(b(Op::Eq));
        if i > 0 {
            l.push(b(Op::Or));
        }
    }
    l.extend([
        check_line(&Reason::Shape),
        b(global(GLOBAL_HALTED)),
        b(Op::AppGlobalGet),
        b(Op::Int(Imm::Int(0))),
        b(Op::Eq),
        check_line(&Reason::Halted),
        b(global(GLOBAL_STATE)),
        b(Op::AppGlobalGet),
        b(Op::Txna(ARG_PREV)),
        b(Op::Eq),
        check_line(&Reason::Digest),
        b(global(GLOBAL_LAST)),
        b(Op::AppGlobalGet),
        b(Op::Txna(ARG_LAST)),
        b(Op::Btoi),
        b(Op::Eq),
        check_line(&Reason::Digest),
        b(global(GLOBAL_STATE)),
        b(Op::Txna(ARG_NEXT)),
        b(Op::AppGlobalPut),
        b(global(GLOBAL_LAST)),
        b(Op::Global(GlobalField::Round)),
        b(Op::AppGlobalPut),
        b(global(GLOBAL_HALTED)),
        b(Op::Txna(ARG_HALT)),
        b(Op::Btoi),
        b(Op::AppGlobalPut),
        b(Op::Int(Imm::Int(1))),
        b(Op::Return),
    ]);
    prog
}

/// Bootstrap approval program: seeds state 0 on creation and lets the
/// deployer install [`approval`].
pub fn init(p: &Protocol, cfg: &CompileConfig) -> Result<Program, GenerationError> {
    let s0 = p
        .states
        .first()
        .ok_or_else(|| GenerationError::MalformedIr("protocol has no initial state".into()))?;
    let seed = state_digest(s0.label, &[], &[], 0)
        .map_err(|e| GenerationError::MalformedIr(e.to_string()))?
        .no_time;
    let b = Line::bare;
    let mut prog = Program::new(cfg.pragma_version);
    prog.lines.extend([
        b(Op::Txn(Field::Sender)),
        b(Op::Byte(Imm::Template(DEPLOYER.into()))),
        b(Op::Eq),
        check_line(&Reason::Assertion(names::SENDER.into())),
        b(Op::Txn(Field::OnCompletion)),
        b(Op::Int(Imm::Int(ON_UPDATE))),
        b(Op::Eq),
        b(Op::Bnz("update".into())),
        b(Op::Txn(Field::ApplicationID)),
        b(Op::Int(Imm::Int(0))),
        b(Op::Eq),
        check_line(&Reason::Shape),
        b(global(GLOBAL_STATE)),
        b(Op::Byte(Imm::Bytes(seed.0.to_vec()))),
        b(Op::AppGlobalPut),
        b(global(GLOBAL_LAST)),
        b(Op::Global(GlobalField::Round)),
        b(Op::AppGlobalPut),
        b(global(GLOBAL_HALTED)),
        b(Op::Int(Imm::Int(0))),
        b(Op::AppGlobalPut),
        b(Op::Int(Imm::Int(1))),
        b(Op::Return),
        b(Op::Label("update".into())),
        b(Op::Int(Imm::Int(1))),
        b(Op::Return),
    ]);
    Ok(prog)
}

/// Clear-state program: refuses opt-out while the protocol is running.
#[must_use]
pub fn clear(cfg: &CompileConfig) -> Program {
    let b = Line::bare;
    let mut prog = Program::new(cfg.pragma_version);
    prog.lines.extend([
        b(Op::Global(GlobalField::GroupSize)),
        b(Op::Int(Imm::Int(1))),
        b(Op::Eq),
        check_line(&Reason::Shape),
        b(global(GLOBAL_HALTED)),
        b(Op::AppGlobalGet),
        b(Op::Int(Imm::Int(1))),
        b(Op::Eq),
        check_line(&Reason::Other(RUNNING.into())),
        b(Op::Int(Imm::Int(1))),
        b(Op::Return),
    ]);
    prog
}

/// Escrow logic signature: pays out only alongside a call to the application.
#[must_use]
pub fn escrow(cfg: &CompileConfig) -> Program {
    let b = Line::bare;
    let mut prog = Program::new(cfg.pragma_version);
    prog.lines.extend([
        b(Op::Txn(Field::GroupIndex)),
        b(Op::Int(Imm::Int(u64::from(GTXN_PAYOUT)))),
        b(Op::Ge),
        check_line(&Reason::Shape),
        b(Op::Gtxn(GTXN_APP, Field::TypeEnum)),
        b(Op::Int(Imm::Int(TYPE_APPL))),
        b(Op::Eq),
        check_line(&Reason::Shape),
        b(Op::Gtxn(GTXN_APP, Field::ApplicationID)),
        b(Op::Int(Imm::Template(APP_ID.into()))),
        b(Op::Eq),
        check_line(&Reason::Shape),
        b(Op::Int(Imm::Int(1))),
        b(Op::Return),
    ]);
    prog
}

/// Render every program and describe the deployment in the manifest.
pub fn package(p: &Protocol, handlers: Vec<Handler>, cfg: &CompileConfig) -> Result<BackendArtifact, GenerationError> {
    let mut programs = BTreeMap::new();
    let mut reasons = BTreeSet::new();
    let mut steps = Vec::with_capacity(handlers.len());

    let mut add = |name: String, prog: &Program, programs: &mut BTreeMap<String, String>| {
        reasons.extend(prog.lines.iter().filter_map(|l| l.note.clone()));
        programs.insert(name, prog.render(cfg.emit_comments));
    };

    for h in &handlers {
        let s = p
            .step(h.step)
            .ok_or_else(|| GenerationError::MalformedIr(format!("handler for unknown step {}", h.step)))?;
        add(handler_name(h.step), &h.program, &mut programs);
        steps.push(json!({
            "id": h.step,
            "program": handler_name(h.step),
            "from": s.from,
            "who": p.participants.get(s.who).map(|x| x.name.clone()),
            "window": p.window(h.step),
            "svs": p.state_kinds(s.from),
            "msg": p.msg_kinds(s),
            "max_payouts": h.max_payouts,
            "lines": h.program.lines.len(),
        }));
    }
    add("approval".into(), &approval(p, cfg), &mut programs);
    add("init".into(), &init(p, cfg)?, &mut programs);
    add("escrow".into(), &escrow(cfg), &mut programs);
    add("clear".into(), &clear(cfg), &mut programs);

    let mut deploy = vec!["init".to_owned(), "escrow".to_owned()];
    deploy.extend(handlers.iter().map(|h| handler_name(h.step)));
    deploy.push("approval".into());
    deploy.push("clear".into());

    let manifest = json!({
        "pragma": cfg.pragma_version,
        "globals": {
            "s": "bytes",
            "l": "uint",
            "h": "uint",
        },
        "group": {
            "app_call": GTXN_APP,
            "payment": GTXN_PAY,
            "handler": GTXN_HANDLER,
            "first_payout": GTXN_PAYOUT,
            "max_size": cfg.max_group_size,
        },
        "args": ["prevSt_noTime", "nextSt_noTime", "halt", "lastTime", "svs...", "msg..."],
        "steps": steps,
        "deploy": deploy,
        "reasons": reasons,
    });
    let meta = json!({
        "generator": concat!("tandem-teal ", env!("CARGO_PKG_VERSION")),
        "comments": cfg.emit_comments,
    });
    Ok(BackendArtifact::new(
        BackendKind::StackMachine,
        &p.name,
        p.version,
        programs,
        manifest,
        meta,
    ))
}
