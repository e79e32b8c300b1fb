//! Lowering to a single EVM contract.
//!
//! Storage slot 0 holds the with-time digest of the current state, or
//! `keccak256("")` once halted. Each step becomes a payable function that
//! reloads its arguments into memory, runs the checks in reference order
//! and either rotates slot 0 or pays out and seals it.
//!
//! Memory: `0x00..0x20` revert word, `0x80 + 32·v` protocol variable `v`,
//! then per-function buffers (digest encodings, temporaries, log data).
//!
//! Every failed check jumps to a shared `fail:<note>` block that reverts with
//! one 32-byte word: the note's 1-based index in the manifest `reasons`.

use crate::abi;
use crate::asm::{self, Instr};
use crate::opcode::*;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tandem_core::{
    names, BackendArtifact, BackendKind, BinOp, CompileConfig, Expr, GenerationError, Protocol,
    Reason, SenderCheck, Step, StepId, Stmt, Tail, TxnField, VarId, Window,
};
use tandem_digest::{empty_digest, tag, Kind};

/// Placeholder for the deployer's address (64 hex digits, left-padded).
pub const DEPLOYER: &str = "Deployer";
/// Storage slot of the state digest.
pub const STATE_SLOT: u64 = 0;
/// First byte of variable memory.
pub const MEM_VARS: usize = 0x80;

/// A lowered step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Step this function executes.
    pub step: StepId,
    /// Canonical signature.
    pub signature: String,
    /// Dispatch selector.
    pub selector: [u8; 4],
    /// Event signature.
    pub event: String,
    /// Code, starting at its entry label.
    pub code: Vec<Instr>,
    /// Reason notes its checks may revert with.
    pub notes: BTreeSet<String>,
}

/// Label of the revert block for `note`.
#[must_use]
pub fn fail_label(note: &str) -> String {
    format!("fail:{note}")
}

fn entry_label(id: StepId) -> String {
    format!("fn:{}", abi::function_name(id))
}

const fn var_addr(v: VarId) -> usize {
    MEM_VARS + 32 * v
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

/// Where a state digest takes its time slot from.
#[derive(Clone, Copy)]
enum Time {
    Mem(usize),
    Number,
}

struct Emitter<'a> {
    p: &'a Protocol,
    step: StepId,
    code: Vec<Instr>,
    mem_top: usize,
    next_label: usize,
    notes: BTreeSet<String>,
}

impl<'a> Emitter<'a> {
    fn new(p: &'a Protocol, step: StepId) -> Self {
        Self {
            p,
            step,
            code: Vec::new(),
            mem_top: MEM_VARS + 32 * p.vars.len(),
            next_label: 0,
            notes: BTreeSet::new(),
        }
    }

    fn op(&mut self, b: u8) {
        self.code.push(Instr::Op(b));
    }

    fn ops(&mut self, bs: &[u8]) {
        self.code.extend(bs.iter().map(|b| Instr::Op(*b)));
    }

    fn push(&mut self, n: u64) {
        self.code.push(Instr::push_u64(n));
    }

    fn push_addr(&mut self, at: usize) {
        self.code.push(Instr::push_bytes(&at.to_be_bytes()));
    }

    fn label(&mut self, what: &str) -> String {
        self.next_label += 1;
        format!("m{}:{what}{}", self.step, self.next_label)
    }

    /// Revert with `reason` if the top of stack is non-zero.
    fn fail_if(&mut self, reason: &Reason) {
        let note = reason.note();
        self.code.push(Instr::PushLabel(fail_label(&note)));
        self.op(JUMPI);
        self.notes.insert(note);
    }

    fn alloc(&mut self, bytes: usize) -> usize {
        let at = self.mem_top;
        self.mem_top += bytes.div_ceil(32) * 32;
        at
    }

    fn load(&mut self, at: usize) {
        self.push_addr(at);
        self.op(MLOAD);
    }

    fn store(&mut self, at: usize) {
        self.push_addr(at);
        self.op(MSTORE);
    }

    /// Fault unless the top of stack fits in 64 bits.
    fn checked_u64(&mut self) {
        self.ops(&[DUP1]);
        self.push(64);
        self.op(SHR);
        self.fail_if(&Reason::Arithmetic);
    }

    fn range_check(&mut self, k: &Kind) {
        let bits = match k {
            Kind::UInt => 64,
            Kind::Address => 160,
            _ => return,
        };
        self.op(DUP1);
        self.push(bits);
        self.op(SHR);
        self.fail_if(&Reason::Shape);
    }

    fn kind_of(&self, e: &Expr) -> Result<Kind, GenerationError> {
        self.p.kind_of(e).map_err(|detail| GenerationError::Type {
            step: self.step,
            detail,
        })
    }

    /// Write the value on top of the stack as one tagged slot at `pos`.
    fn put_slot(&mut self, pos: usize, k: &Kind) -> Result<usize, GenerationError> {
        let t = tag_of(self.step, k)?;
        if *k == Kind::UInt {
            self.push(192);
            self.op(SHL);
        }
        self.store(pos + 1);
        self.push(u64::from(t));
        self.push_addr(pos);
        self.op(MSTORE8);
        Ok(pos + k.encoded_len())
    }

    fn expr(&mut self, e: &Expr) -> Result<(), GenerationError> {
        match e {
            Expr::UInt(n) => self.push(*n),
            Expr::Var(v) => self.load(var_addr(*v)),
            Expr::Txn(TxnField::Sender) => self.op(CALLER),
            Expr::Txn(TxnField::Value) => self.op(CALLVALUE),
            Expr::Txn(TxnField::Time) => self.op(NUMBER),
            Expr::Not(x) => {
                self.expr(x)?;
                self.op(ISZERO);
            }
            Expr::Bin(op, l, r) => {
                self.expr(l)?;
                self.expr(r)?;
                // stack: [l, r], r on top
                match op {
                    BinOp::Add => {
                        self.op(ADD);
                        self.checked_u64();
                    }
                    BinOp::Mul => {
                        self.op(MUL);
                        self.checked_u64();
                    }
                    BinOp::Sub => {
                        self.ops(&[DUP2, DUP2, GT]);
                        self.fail_if(&Reason::Arithmetic);
                        self.ops(&[SWAP1, SUB]);
                    }
                    BinOp::Div | BinOp::Mod => {
                        self.ops(&[DUP1, ISZERO]);
                        self.fail_if(&Reason::Arithmetic);
                        self.ops(&[SWAP1, if *op == BinOp::Div { DIV } else { MOD }]);
                    }
                    BinOp::Eq => self.op(EQ),
                    BinOp::Ne => self.ops(&[EQ, ISZERO]),
                    BinOp::Lt => self.op(GT),
                    BinOp::Gt => self.op(LT),
                    BinOp::Le => self.ops(&[LT, ISZERO]),
                    BinOp::Ge => self.ops(&[GT, ISZERO]),
                    BinOp::And => self.ops(&[ISZERO, ISZERO, SWAP1, ISZERO, ISZERO, AND]),
                    BinOp::Or => self.ops(&[OR, ISZERO, ISZERO]),
                }
            }
            Expr::Digest(es) => {
                let kinds = es.iter().map(|x| self.kind_of(x)).collect::<Result<Vec<_>, _>>()?;
                let len: usize = kinds.iter().map(Kind::encoded_len).sum();
                let base = self.alloc(len + 32);
                let mut pos = base;
                for (x, k) in es.iter().zip(&kinds) {
                    self.expr(x)?;
                    pos = self.put_slot(pos, k)?;
                }
                self.push_addr(len);
                self.push_addr(base);
                self.op(KECCAK256);
            }
        }
        Ok(())
    }

    /// Push the digest of `[UInt label, vars…, UInt time]`.
    fn state_digest(&mut self, label: u64, vars: &[VarId], time: Time) -> Result<(), GenerationError> {
        let kinds = vars
            .iter()
            .map(|v| self.p.var_kind(*v).cloned().ok_or_else(|| GenerationError::MalformedIr(format!("unknown variable #{v}"))))
            .collect::<Result<Vec<_>, _>>()?;
        let len = 2 * Kind::UInt.encoded_len() + kinds.iter().map(Kind::encoded_len).sum::<usize>();
        let base = self.alloc(len + 32);
        self.push(label);
        let mut pos = self.put_slot(base, &Kind::UInt)?;
        for (v, k) in vars.iter().zip(&kinds) {
            self.load(var_addr(*v));
            pos = self.put_slot(pos, k)?;
        }
        match time {
            Time::Mem(at) => self.load(at),
            Time::Number => self.op(NUMBER),
        }
        self.put_slot(pos, &Kind::UInt)?;
        self.push_addr(len);
        self.push_addr(base);
        self.op(KECCAK256);
        Ok(())
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
                self.op(ISZERO);
                self.code.push(Instr::PushLabel(other.clone()));
                self.op(JUMPI);
                self.tail(then)?;
                self.code.push(Instr::Label(other));
                self.tail(otherwise)
            }
            Tail::Goto { state, assigns } => {
                let mut tmps = Vec::with_capacity(assigns.len());
                for (v, e) in assigns {
                    self.expr(e)?;
                    let tmp = self.alloc(32);
                    self.store(tmp);
                    tmps.push((*v, tmp));
                }
                for (v, tmp) in tmps {
                    self.load(tmp);
                    self.store(var_addr(v));
                }
                let def = self
                    .p
                    .states
                    .get(*state)
                    .ok_or_else(|| GenerationError::MalformedIr(format!("unknown state {state}")))?;
                self.state_digest(def.label, &def.vars, Time::Number)?;
                self.push(STATE_SLOT);
                self.op(SSTORE);
                self.op(STOP);
                Ok(())
            }
            Tail::Halt { payouts, outcome } => {
                let mut resolved = Vec::with_capacity(payouts.len());
                for po in payouts {
                    self.expr(&po.to)?;
                    let to = self.alloc(32);
                    self.store(to);
                    self.expr(&po.amount)?;
                    let amount = self.alloc(32);
                    self.store(amount);
                    resolved.push((to, amount));
                }
                if let Some(o) = outcome {
                    self.expr(o)?;
                    self.op(POP);
                }
                self.code.push(Instr::push_bytes(&empty_digest().0));
                self.push(STATE_SLOT);
                self.op(SSTORE);
                for (to, amount) in resolved {
                    for _ in 0..4 {
                        self.push(0);
                    }
                    self.load(amount);
                    self.load(to);
                    self.ops(&[GAS, CALL, ISZERO]);
                    self.fail_if(&Reason::Funds);
                }
                self.op(STOP);
                Ok(())
            }
        }
    }
}

/// Lower one validated step to its contract function.
pub fn function(p: &Protocol, step: &Step, _cfg: &CompileConfig) -> Result<Function, GenerationError> {
    let id = step.id;
    let abi_err = |e: abi::AbiError| unsupported(id, e.to_string());
    let signature = abi::function_signature(p, step).map_err(abi_err)?;
    let event = abi::event_signature(p, step).map_err(abi_err)?;
    let from = p
        .states
        .get(step.from)
        .ok_or_else(|| GenerationError::MalformedIr(format!("step {id} starts in unknown state")))?;
    let svs_kinds = p.state_kinds(step.from);
    let msg_kinds = p.msg_kinds(step);
    let words = abi::data_words(p, step);

    let mut e = Emitter::new(p, id);
    e.code.push(Instr::Label(entry_label(id)));
    e.op(POP);

    // halted?
    e.push(STATE_SLOT);
    e.op(SLOAD);
    e.code.push(Instr::push_bytes(&empty_digest().0));
    e.op(EQ);
    e.fail_if(&Reason::Halted);

    // 1. shape
    e.op(CALLDATASIZE);
    e.push_addr(4 + 32 * words);
    e.ops(&[EQ, ISZERO]);
    e.fail_if(&Reason::Shape);
    let mut offset = 4usize;
    for (v, k) in from.vars.iter().zip(&svs_kinds) {
        e.push_addr(offset);
        e.op(CALLDATALOAD);
        e.range_check(k);
        e.store(var_addr(*v));
        offset += 32;
    }
    let prev_time = e.alloc(32);
    e.push_addr(offset);
    e.op(CALLDATALOAD);
    e.range_check(&Kind::UInt);
    e.store(prev_time);
    offset += 32;
    for (v, k) in step.msg.iter().zip(&msg_kinds) {
        e.push_addr(offset);
        e.op(CALLDATALOAD);
        e.range_check(k);
        e.store(var_addr(*v));
        offset += 32;
    }
    if let Some(v) = step.bind_sender {
        e.op(CALLER);
        e.store(var_addr(v));
    }

    // 2. identity
    if let SenderCheck::Is(v) = step.sender {
        e.op(CALLER);
        e.load(var_addr(v));
        e.ops(&[EQ, ISZERO]);
        e.fail_if(&Reason::Assertion(names::SENDER.into()));
    }

    // 3. payment
    e.op(CALLVALUE);
    e.expr(&step.pay)?;
    e.ops(&[EQ, ISZERO]);
    e.fail_if(&Reason::Assertion(names::PAY.into()));

    // 4. previous state
    e.state_digest(from.label, &from.vars, Time::Mem(prev_time))?;
    e.push(STATE_SLOT);
    e.op(SLOAD);
    e.ops(&[EQ, ISZERO]);
    e.fail_if(&Reason::Digest);

    // 5. body
    for stmt in &step.body {
        match stmt {
            Stmt::Let(v, x) => {
                e.expr(x)?;
                e.store(var_addr(*v));
            }
            Stmt::Assert(a) => {
                e.expr(&a.cond)?;
                e.op(ISZERO);
                e.fail_if(&Reason::Assertion(a.msg.clone()));
            }
        }
    }

    // 6. window
    let window = p.window(id);
    if let Window::Within(d) | Window::After(d) = window {
        e.load(prev_time);
        e.push(d);
        e.op(ADD);
        e.ops(&[NUMBER, GT]);
        if matches!(window, Window::After(_)) {
            e.op(ISZERO);
        }
        e.fail_if(&Reason::Window);
    }

    // event
    let data_len = 32 * words;
    let buf = e.alloc(data_len);
    e.push_addr(data_len);
    e.push(4);
    e.push_addr(buf);
    e.op(CALLDATACOPY);
    e.code.push(Instr::push_bytes(&abi::topic(&event)));
    e.push_addr(data_len);
    e.push_addr(buf);
    e.op(LOG1);

    // 7. tail
    e.tail(&step.tail)?;

    Ok(Function {
        step: id,
        selector: abi::selector(&signature),
        signature,
        event,
        code: e.code,
        notes: e.notes,
    })
}

fn fail_block(code: &mut Vec<Instr>, note: &str, index: usize) {
    code.push(Instr::Label(fail_label(note)));
    code.push(Instr::push_u64(index as u64 + 1));
    code.push(Instr::push_u64(0));
    code.push(Instr::Op(MSTORE));
    code.push(Instr::push_u64(32));
    code.push(Instr::push_u64(0));
    code.push(Instr::Op(REVERT));
}

/// Constructor: only `{{Deployer}}` may create; stores the digest of state 0
/// entered at the creation block, then returns the runtime.
fn constructor(p: &Protocol, runtime_len: usize, reasons: &[String]) -> Result<Vec<Instr>, GenerationError> {
    let s0 = p
        .states
        .first()
        .ok_or_else(|| GenerationError::MalformedIr("protocol has no initial state".into()))?;
    let sender = Reason::Assertion(names::SENDER.into()).note();
    let code_of = |note: &str| reasons.iter().position(|r| r == note).unwrap_or(0);

    let mut e = Emitter::new(p, 0);
    e.op(CALLER);
    e.code.push(Instr::PushTemplate(DEPLOYER.into()));
    e.ops(&[EQ, ISZERO]);
    e.code.push(Instr::PushLabel("init:fail".into()));
    e.op(JUMPI);
    e.state_digest(s0.label, &s0.vars, Time::Number)?;
    e.push(STATE_SLOT);
    e.op(SSTORE);
    e.push_addr(runtime_len);
    e.code.push(Instr::PushLabel("runtime".into()));
    e.push(0);
    e.op(CODECOPY);
    e.push_addr(runtime_len);
    e.push(0);
    e.op(RETURN);
    let mut code = e.code;
    code.push(Instr::Label("init:fail".into()));
    code.push(Instr::push_u64(code_of(&sender) as u64 + 1));
    code.extend([
        Instr::push_u64(0),
        Instr::Op(MSTORE),
        Instr::push_u64(32),
        Instr::push_u64(0),
        Instr::Op(REVERT),
        Instr::Mark("runtime".into()),
    ]);
    Ok(code)
}

fn asm_err(e: &asm::AsmError) -> GenerationError {
    GenerationError::MalformedIr(format!("assembly: {e}"))
}

/// Link every function behind a selector dispatcher and wrap the runtime in
/// its constructor.
pub fn package(p: &Protocol, functions: Vec<Function>, cfg: &CompileConfig) -> Result<BackendArtifact, GenerationError> {
    let mut notes: BTreeSet<String> = functions.iter().flat_map(|f| f.notes.iter().cloned()).collect();
    notes.insert(Reason::Shape.note());
    notes.insert(Reason::Assertion(names::SENDER.into()).note());
    let reasons: Vec<String> = notes.into_iter().collect();

    let mut runtime = vec![Instr::push_u64(0), Instr::Op(CALLDATALOAD), Instr::push_u64(224), Instr::Op(SHR)];
    let mut seen = BTreeMap::new();
    for f in &functions {
        if let Some(other) = seen.insert(f.selector, f.step) {
            return Err(unsupported(f.step, format!("selector clashes with step {other}")));
        }
        runtime.push(Instr::Op(DUP1));
        runtime.push(Instr::Push(f.selector.to_vec()));
        runtime.push(Instr::Op(EQ));
        runtime.push(Instr::PushLabel(entry_label(f.step)));
        runtime.push(Instr::Op(JUMPI));
    }
    runtime.push(Instr::PushLabel(fail_label(&Reason::Shape.note())));
    runtime.push(Instr::Op(JUMP));
    for f in &functions {
        runtime.extend(f.code.iter().cloned());
    }
    for (i, note) in reasons.iter().enumerate() {
        fail_block(&mut runtime, note, i);
    }

    let rt = asm::assemble(&runtime).map_err(|e| asm_err(&e))?;
    let init = constructor(p, rt.len, &reasons)?;
    let ctor = asm::assemble(&init).map_err(|e| asm_err(&e))?;

    let mut programs = BTreeMap::new();
    programs.insert("contract".to_owned(), format!("{}{}", ctor.to_hex(), rt.to_hex()));
    programs.insert("runtime".to_owned(), rt.to_hex());
    if cfg.emit_comments {
        let listing = format!(
            "; constructor\n{}; runtime\n{}",
            asm::listing(&init).map_err(|e| asm_err(&e))?,
            asm::listing(&runtime).map_err(|e| asm_err(&e))?
        );
        programs.insert("contract.asm".to_owned(), listing);
    }

    let selectors: BTreeMap<String, String> = functions
        .iter()
        .map(|f| (abi::function_name(f.step), format!("0x{}", hex::encode(f.selector))))
        .collect();
    let events: BTreeMap<String, String> = functions
        .iter()
        .map(|f| (abi::event_name(f.step), format!("0x{}", hex::encode(abi::topic(&f.event)))))
        .collect();
    let steps: Vec<_> = functions
        .iter()
        .map(|f| {
            json!({
                "id": f.step,
                "function": f.signature,
                "event": f.event,
                "window": p.window(f.step),
            })
        })
        .collect();
    let manifest = json!({
        "abi": abi::abi_json(p),
        "selectors": selectors,
        "events": events,
        "steps": steps,
        "storage": { "0": "state digest (with time)" },
        "reasons": reasons,
        "init_len": ctor.len,
        "runtime_len": rt.len,
    });
    let meta = json!({
        "generator": concat!("tandem-evm ", env!("CARGO_PKG_VERSION")),
        "comments": cfg.emit_comments,
    });
    Ok(BackendArtifact::new(
        BackendKind::AccountContract,
        &p.name,
        p.version,
        programs,
        manifest,
        meta,
    ))
}
