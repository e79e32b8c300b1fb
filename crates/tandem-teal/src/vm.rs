//! Stack-machine interpreter.
//!
//! Runs a parsed [`Program`] against one transaction of a group. Programs
//! either accept (`return` of a non-zero uint, or a single non-zero uint left
//! on the stack) or fail with a [`Fault`] that pins the failing line so the
//! ledger can classify the rejection from its note.
//!
//! Arithmetic follows the ledger's rules: `+`/`*` fault on overflow, `-` on
//! underflow, `/`/`%` on a zero divisor.

use crate::asm::{Field, GlobalField, Imm, Op, Program, TYPE_APPL, TYPE_PAY};
use std::collections::BTreeMap;
use tandem_digest::{keccak256, Address};

/// Instructions a single program may execute.
pub const STEP_BUDGET: usize = 20_000;
/// Maximum evaluation stack depth.
pub const MAX_STACK: usize = 1_000;

/// A stack slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackValue {
    /// Unsigned integer.
    Uint(u64),
    /// Byte string.
    Bytes(Vec<u8>),
}

/// Body of a group transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnBody {
    /// Payment.
    Pay {
        /// Credited account.
        receiver: Address,
        /// Amount moved.
        amount: u64,
    },
    /// Application call.
    AppCall {
        /// Called application (`0` creates).
        app_id: u64,
        /// Call kind.
        on_completion: u64,
        /// Arguments.
        args: Vec<Vec<u8>>,
    },
}

/// One transaction of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTxn {
    /// Signing account.
    pub sender: Address,
    /// What it does.
    pub body: TxnBody,
}

impl GroupTxn {
    fn field(&self, f: Field, index: usize) -> Option<StackValue> {
        use StackValue::{Bytes, Uint};
        Some(match (f, &self.body) {
            (Field::Sender, _) => Bytes(self.sender.0.to_vec()),
            (Field::GroupIndex, _) => Uint(u64::try_from(index).ok()?),
            (Field::TypeEnum, TxnBody::Pay { .. }) => Uint(TYPE_PAY),
            (Field::TypeEnum, TxnBody::AppCall { .. }) => Uint(TYPE_APPL),
            (Field::Receiver, TxnBody::Pay { receiver, .. }) => Bytes(receiver.0.to_vec()),
            (Field::Receiver, TxnBody::AppCall { .. }) => Bytes(vec![0; 32]),
            (Field::Amount, TxnBody::Pay { amount, .. }) => Uint(*amount),
            (Field::ApplicationID, TxnBody::AppCall { app_id, .. }) => Uint(*app_id),
            (Field::NumAppArgs, TxnBody::AppCall { args, .. }) => Uint(u64::try_from(args.len()).ok()?),
            (Field::OnCompletion, TxnBody::AppCall { on_completion, .. }) => Uint(*on_completion),
            (Field::ApplicationID | Field::NumAppArgs | Field::OnCompletion, TxnBody::Pay { .. })
            | (Field::Amount, TxnBody::AppCall { .. }) => Uint(0),
        })
    }

    fn arg(&self, k: u8) -> Option<StackValue> {
        match &self.body {
            TxnBody::AppCall { args, .. } => args.get(usize::from(k)).cloned().map(StackValue::Bytes),
            TxnBody::Pay { .. } => None,
        }
    }
}

/// Why a program did not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// `assert` on zero.
    Assert,
    /// `err`.
    Err,
    /// Finished with zero (or without a single uint on the stack).
    Rejected,
    /// Overflow, underflow or zero divisor.
    Arithmetic,
    /// Operand of the wrong type, bad index, stack misuse, missing field.
    Malformed,
    /// Ran out of budget.
    Budget,
}

/// A program did not accept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} at line {pc}{}", .note.as_ref().map(|n| format!(" ({n})")).unwrap_or_default())]
pub struct Fault {
    /// What went wrong.
    pub kind: FaultKind,
    /// Index of the failing instruction.
    pub pc: usize,
    /// Its note, if any.
    pub note: Option<String>,
}

/// What a program sees while it runs.
pub struct Ctx<'a> {
    /// The whole group.
    pub group: &'a [GroupTxn],
    /// Index of the transaction being approved.
    pub index: usize,
    /// Current round.
    pub round: u64,
    /// Application globals (`None` for logic signatures).
    pub globals: Option<&'a mut BTreeMap<Vec<u8>, StackValue>>,
}

struct Machine<'p> {
    prog: &'p Program,
    pc: usize,
    stack: Vec<StackValue>,
    scratch: Vec<StackValue>,
}

impl<'p> Machine<'p> {
    fn fault(&self, kind: FaultKind) -> Fault {
        Fault {
            kind,
            pc: self.pc,
            note: self.prog.lines.get(self.pc).and_then(|l| l.note.clone()),
        }
    }

    fn push(&mut self, v: StackValue) -> Result<(), Fault> {
        if self.stack.len() >= MAX_STACK {
            return Err(self.fault(FaultKind::Malformed));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<StackValue, Fault> {
        self.stack.pop().ok_or_else(|| self.fault(FaultKind::Malformed))
    }

    fn pop_uint(&mut self) -> Result<u64, Fault> {
        match self.pop()? {
            StackValue::Uint(n) => Ok(n),
            StackValue::Bytes(_) => Err(self.fault(FaultKind::Malformed)),
        }
    }

    fn pop_bytes(&mut self) -> Result<Vec<u8>, Fault> {
        match self.pop()? {
            StackValue::Bytes(b) => Ok(b),
            StackValue::Uint(_) => Err(self.fault(FaultKind::Malformed)),
        }
    }

    fn arith(&mut self, f: impl Fn(u64, u64) -> Option<u64>) -> Result<(), Fault> {
        let b = self.pop_uint()?;
        let a = self.pop_uint()?;
        let r = f(a, b).ok_or_else(|| self.fault(FaultKind::Arithmetic))?;
        self.push(StackValue::Uint(r))
    }

    fn cmp(&mut self, f: impl Fn(u64, u64) -> bool) -> Result<(), Fault> {
        let b = self.pop_uint()?;
        let a = self.pop_uint()?;
        self.push(StackValue::Uint(u64::from(f(a, b))))
    }

    fn jump(&mut self, label: &str) -> Result<(), Fault> {
        self.pc = self
            .prog
            .label_pc(label)
            .ok_or_else(|| self.fault(FaultKind::Malformed))?;
        Ok(())
    }
}

/// Run `prog` for `ctx.group[ctx.index]`.
///
/// # Errors
/// Returns the [`Fault`] of the first failing instruction.
pub fn run(prog: &Program, ctx: &mut Ctx<'_>) -> Result<(), Fault> {
    let mut m = Machine {
        prog,
        pc: 0,
        stack: Vec::with_capacity(64),
        scratch: vec![StackValue::Uint(0); 256],
    };
    let group = ctx.group;
    let me = group
        .get(ctx.index)
        .ok_or_else(|| m.fault(FaultKind::Malformed))?;
    let mut budget = STEP_BUDGET;

    while m.pc < prog.lines.len() {
        if budget == 0 {
            return Err(m.fault(FaultKind::Budget));
        }
        budget -= 1;
        let op = &prog.lines[m.pc].op;
        let mut next = m.pc + 1;
        match op {
            Op::Int(Imm::Int(n)) => m.push(StackValue::Uint(*n))?,
            Op::Byte(Imm::Bytes(b)) => m.push(StackValue::Bytes(b.clone()))?,
            Op::Byte(Imm::Str(s)) => m.push(StackValue::Bytes(s.as_bytes().to_vec()))?,
            Op::Int(_) | Op::Byte(_) => return Err(m.fault(FaultKind::Malformed)),
            Op::Txn(f) => {
                let v = me.field(*f, ctx.index).ok_or_else(|| m.fault(FaultKind::Malformed))?;
                m.push(v)?;
            }
            Op::Gtxn(i, f) => {
                let i = usize::from(*i);
                let v = group
                    .get(i)
                    .and_then(|t| t.field(*f, i))
                    .ok_or_else(|| m.fault(FaultKind::Malformed))?;
                m.push(v)?;
            }
            Op::Txna(k) => {
                let v = me.arg(*k).ok_or_else(|| m.fault(FaultKind::Malformed))?;
                m.push(v)?;
            }
            Op::Gtxna(i, k) => {
                let v = group
                    .get(usize::from(*i))
                    .and_then(|t| t.arg(*k))
                    .ok_or_else(|| m.fault(FaultKind::Malformed))?;
                m.push(v)?;
            }
            Op::Global(GlobalField::GroupSize) => {
                let n = u64::try_from(group.len()).map_err(|_| m.fault(FaultKind::Malformed))?;
                m.push(StackValue::Uint(n))?;
            }
            Op::Global(GlobalField::Round) => m.push(StackValue::Uint(ctx.round))?,
            Op::Add => m.arith(u64::checked_add)?,
            Op::Sub => m.arith(u64::checked_sub)?,
            Op::Mul => m.arith(u64::checked_mul)?,
            Op::Div => m.arith(u64::checked_div)?,
            Op::Mod => m.arith(u64::checked_rem)?,
            Op::Lt => m.cmp(|a, b| a < b)?,
            Op::Le => m.cmp(|a, b| a <= b)?,
            Op::Gt => m.cmp(|a, b| a > b)?,
            Op::Ge => m.cmp(|a, b| a >= b)?,
            Op::And => m.cmp(|a, b| a != 0 && b != 0)?,
            Op::Or => m.cmp(|a, b| a != 0 || b != 0)?,
            Op::Eq | Op::Ne => {
                let b = m.pop()?;
                let a = m.pop()?;
                if std::mem::discriminant(&a) != std::mem::discriminant(&b) {
                    return Err(m.fault(FaultKind::Malformed));
                }
                let same = a == b;
                m.push(StackValue::Uint(u64::from(if matches!(op, Op::Eq) { same } else { !same })))?;
            }
            Op::Not => {
                let a = m.pop_uint()?;
                m.push(StackValue::Uint(u64::from(a == 0)))?;
            }
            Op::Itob => {
                let a = m.pop_uint()?;
                m.push(StackValue::Bytes(a.to_be_bytes().to_vec()))?;
            }
            Op::Btoi => {
                let b = m.pop_bytes()?;
                if b.len() > 8 {
                    return Err(m.fault(FaultKind::Malformed));
                }
                let n = b.iter().fold(0u64, |acc, x| (acc << 8) | u64::from(*x));
                m.push(StackValue::Uint(n))?;
            }
            Op::Concat => {
                let b = m.pop_bytes()?;
                let mut a = m.pop_bytes()?;
                a.extend_from_slice(&b);
                m.push(StackValue::Bytes(a))?;
            }
            Op::Len => {
                let b = m.pop_bytes()?;
                let n = u64::try_from(b.len()).map_err(|_| m.fault(FaultKind::Malformed))?;
                m.push(StackValue::Uint(n))?;
            }
            Op::Extract(s, l) => {
                let b = m.pop_bytes()?;
                let (s, l) = (usize::from(*s), usize::from(*l));
                let part = b.get(s..s + l).ok_or_else(|| m.fault(FaultKind::Malformed))?.to_vec();
                m.push(StackValue::Bytes(part))?;
            }
            Op::Keccak256 => {
                let b = m.pop_bytes()?;
                m.push(StackValue::Bytes(keccak256(&b).to_vec()))?;
            }
            Op::Assert => {
                if m.pop_uint()? == 0 {
                    return Err(m.fault(FaultKind::Assert));
                }
            }
            Op::Err => return Err(m.fault(FaultKind::Err)),
            Op::Return => {
                return if m.pop_uint()? == 0 {
                    Err(m.fault(FaultKind::Rejected))
                } else {
                    Ok(())
                };
            }
            Op::Dup => {
                let a = m.pop()?;
                m.push(a.clone())?;
                m.push(a)?;
            }
            Op::Pop => {
                m.pop()?;
            }
            Op::Store(n) => {
                let a = m.pop()?;
                m.scratch[usize::from(*n)] = a;
            }
            Op::Load(n) => {
                let a = m.scratch[usize::from(*n)].clone();
                m.push(a)?;
            }
            Op::Bz(l) | Op::Bnz(l) => {
                let zero = m.pop_uint()? == 0;
                if zero == matches!(op, Op::Bz(_)) {
                    m.jump(l)?;
                    next = m.pc;
                }
            }
            Op::B(l) => {
                m.jump(l)?;
                next = m.pc;
            }
            Op::Label(_) => {}
            Op::AppGlobalGet => {
                let key = m.pop_bytes()?;
                let globals = ctx.globals.as_deref().ok_or_else(|| m.fault(FaultKind::Malformed))?;
                let v = globals.get(&key).cloned().unwrap_or(StackValue::Uint(0));
                m.push(v)?;
            }
            Op::AppGlobalPut => {
                let v = m.pop()?;
                let key = m.pop_bytes()?;
                let fault = m.fault(FaultKind::Malformed);
                ctx.globals.as_deref_mut().ok_or(fault)?.insert(key, v);
            }
        }
        m.pc = next;
    }

    match m.stack.as_slice() {
        [StackValue::Uint(n)] if *n != 0 => Ok(()),
        _ => Err(Fault {
            kind: FaultKind::Rejected,
            pc: prog.lines.len(),
            note: None,
        }),
    }
}
