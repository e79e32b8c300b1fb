//! Interpreter for the EVM subset the lowering emits.
//!
//! Words are [`U256`] with wrapping arithmetic, as on chain. There is no gas
//! schedule: an instruction budget bounds execution and `GAS` reports what is
//! left of it. `CALL` moves value only; the callee's code never runs.

use crate::opcode::*;
use revm_primitives::U256;
use std::collections::{BTreeMap, BTreeSet};
use tandem_digest::{keccak256, Address};

/// Instructions one call may execute.
pub const STEP_BUDGET: usize = 200_000;
/// Maximum stack depth.
pub const MAX_STACK: usize = 1024;
/// Maximum memory size in bytes.
pub const MAX_MEMORY: usize = 1 << 20;

/// Call context.
#[derive(Debug, Clone, Copy)]
pub struct Env<'a> {
    /// `CALLER`.
    pub caller: Address,
    /// `CALLVALUE`.
    pub value: u64,
    /// `NUMBER`.
    pub number: u64,
    /// Call data.
    pub calldata: &'a [u8],
    /// Contract balance available to `CALL` (after `value` is credited).
    pub balance: u64,
}

/// A `LOG1` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    /// Topic 0.
    pub topic: [u8; 32],
    /// Data.
    pub data: Vec<u8>,
}

/// A value transfer made by `CALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Recipient (left-padded word).
    pub to: Address,
    /// Amount.
    pub amount: u64,
}

/// How execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// `STOP` or end of code.
    Stop,
    /// `RETURN` with data.
    Return(Vec<u8>),
    /// `REVERT` with data.
    Revert(Vec<u8>),
}

/// Result of a call that did not fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Exit kind.
    pub exit: Exit,
    /// Logs in order.
    pub logs: Vec<Log>,
    /// Transfers in order.
    pub transfers: Vec<Transfer>,
    /// Instructions executed.
    pub steps: usize,
}

/// Exceptional halt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// Popped an empty stack.
    #[error("stack underflow at {pc:#06x}")]
    StackUnderflow {
        /// Program counter.
        pc: usize,
    },
    /// Pushed past [`MAX_STACK`].
    #[error("stack overflow at {pc:#06x}")]
    StackOverflow {
        /// Program counter.
        pc: usize,
    },
    /// Jump to a byte that is not a `JUMPDEST`.
    #[error("bad jump to {dest:#x} at {pc:#06x}")]
    BadJump {
        /// Program counter.
        pc: usize,
        /// Target.
        dest: U256,
    },
    /// Byte outside the subset.
    #[error("invalid opcode {op:#04x} at {pc:#06x}")]
    InvalidOpcode {
        /// Program counter.
        pc: usize,
        /// Opcode.
        op: u8,
    },
    /// Memory access beyond [`MAX_MEMORY`].
    #[error("memory limit exceeded at {pc:#06x}")]
    Memory {
        /// Program counter.
        pc: usize,
    },
    /// [`STEP_BUDGET`] exhausted.
    #[error("step budget exhausted")]
    Budget,
}

fn word(bytes: [u8; 32]) -> U256 {
    U256::from_be_bytes(bytes)
}

/// `v` as `u64`, if it fits.
#[must_use]
pub fn low_u64(v: &U256) -> Option<u64> {
    let l = v.as_limbs();
    (l[1] == 0 && l[2] == 0 && l[3] == 0).then_some(l[0])
}

fn jumpdests(code: &[u8]) -> BTreeSet<usize> {
    let mut out = BTreeSet::new();
    let mut pc = 0;
    while pc < code.len() {
        let op = code[pc];
        if op == JUMPDEST {
            out.insert(pc);
        }
        pc += 1 + info(op).map_or(0, |i| i.imm);
    }
    out
}

struct Machine<'a> {
    code: &'a [u8],
    env: Env<'a>,
    stack: Vec<U256>,
    memory: Vec<u8>,
    pc: usize,
    /// Offset of the instruction being executed.
    at: usize,
    balance: u64,
    logs: Vec<Log>,
    transfers: Vec<Transfer>,
}

impl Machine<'_> {
    fn pop(&mut self) -> Result<U256, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow { pc: self.at })
    }

    fn push(&mut self, v: U256) -> Result<(), VmError> {
        if self.stack.len() >= MAX_STACK {
            return Err(VmError::StackOverflow { pc: self.at });
        }
        self.stack.push(v);
        Ok(())
    }

    fn offset(&self, v: U256) -> Result<usize, VmError> {
        low_u64(&v)
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n <= MAX_MEMORY)
            .ok_or(VmError::Memory { pc: self.at })
    }

    /// Grow memory to cover `[at, at + len)`.
    fn touch(&mut self, at: usize, len: usize) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }
        let end = at.checked_add(len).filter(|e| *e <= MAX_MEMORY).ok_or(VmError::Memory { pc: self.at })?;
        let size = end.div_ceil(32) * 32;
        if self.memory.len() < size {
            self.memory.resize(size, 0);
        }
        Ok(())
    }

    fn range(&mut self) -> Result<(usize, usize), VmError> {
        let at = self.pop()?;
        let len = self.pop()?;
        let (at, len) = (self.offset(at)?, self.offset(len)?);
        self.touch(at, len)?;
        Ok((at, len))
    }

    fn slice(&mut self) -> Result<Vec<u8>, VmError> {
        let (at, len) = self.range()?;
        Ok(self.memory[at..at + len].to_vec())
    }

    /// `CALLDATACOPY` / `CODECOPY`: zero-fills past the end of `src`.
    fn copy_in(&mut self, src: &[u8]) -> Result<(), VmError> {
        let dest = self.pop()?;
        let from = self.pop()?;
        let len = self.pop()?;
        let (dest, len) = (self.offset(dest)?, self.offset(len)?);
        self.touch(dest, len)?;
        let from = low_u64(&from).and_then(|n| usize::try_from(n).ok()).unwrap_or(usize::MAX);
        for i in 0..len {
            self.memory[dest + i] = from.checked_add(i).and_then(|j| src.get(j)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn jump(&mut self, dest: U256, valid: &BTreeSet<usize>) -> Result<(), VmError> {
        match low_u64(&dest).and_then(|n| usize::try_from(n).ok()) {
            Some(d) if valid.contains(&d) => {
                self.pc = d;
                Ok(())
            }
            _ => Err(VmError::BadJump { pc: self.at, dest }),
        }
    }

    fn call(&mut self) -> Result<U256, VmError> {
        let _gas = self.pop()?;
        let to = self.pop()?;
        let value = self.pop()?;
        for _ in 0..4 {
            self.pop()?;
        }
        let Some(amount) = low_u64(&value) else {
            return Ok(U256::ZERO);
        };
        if amount > self.balance {
            return Ok(U256::ZERO);
        }
        self.balance -= amount;
        self.transfers.push(Transfer {
            to: Address(to.to_be_bytes::<32>()),
            amount,
        });
        Ok(U256::from(1u64))
    }
}

fn bool_word(b: bool) -> U256 {
    if b {
        U256::from(1u64)
    } else {
        U256::ZERO
    }
}

/// Execute `code` with `storage` as the contract's storage.
///
/// Storage writes are applied in place even when the call reverts; callers
/// run on a copy and keep it only on [`Exit::Stop`] or [`Exit::Return`].
pub fn run(code: &[u8], env: Env<'_>, storage: &mut BTreeMap<U256, U256>) -> Result<Outcome, VmError> {
    let valid = jumpdests(code);
    let mut m = Machine {
        code,
        env,
        stack: Vec::with_capacity(64),
        memory: Vec::new(),
        pc: 0,
        at: 0,
        balance: env.balance,
        logs: Vec::new(),
        transfers: Vec::new(),
    };
    let mut steps = 0usize;
    loop {
        let Some(&op) = m.code.get(m.pc) else {
            return Ok(finish(m, Exit::Stop, steps));
        };
        steps += 1;
        if steps > STEP_BUDGET {
            return Err(VmError::Budget);
        }
        let Some(meta) = info(op) else {
            return Err(VmError::InvalidOpcode { pc: m.pc, op });
        };
        let at = m.pc;
        m.at = at;
        m.pc += 1 + meta.imm;
        match op {
            STOP => return Ok(finish(m, Exit::Stop, steps)),
            ADD | MUL | SUB | DIV | MOD | LT | GT | EQ | AND | OR => {
                let a = m.pop()?;
                let b = m.pop()?;
                let r = match op {
                    ADD => a.wrapping_add(b),
                    MUL => a.wrapping_mul(b),
                    SUB => a.wrapping_sub(b),
                    DIV => a.checked_div(b).unwrap_or(U256::ZERO),
                    MOD => a.checked_rem(b).unwrap_or(U256::ZERO),
                    LT => bool_word(a < b),
                    GT => bool_word(a > b),
                    EQ => bool_word(a == b),
                    AND => a & b,
                    _ => a | b,
                };
                m.push(r)?;
            }
            ISZERO => {
                let a = m.pop()?;
                m.push(bool_word(a.is_zero()))?;
            }
            NOT => {
                let a = m.pop()?;
                m.push(!a)?;
            }
            SHL | SHR => {
                let shift = m.pop()?;
                let v = m.pop()?;
                let r = match low_u64(&shift).filter(|s| *s < 256).and_then(|s| usize::try_from(s).ok()) {
                    Some(s) if op == SHL => v << s,
                    Some(s) => v >> s,
                    None => U256::ZERO,
                };
                m.push(r)?;
            }
            KECCAK256 => {
                let data = m.slice()?;
                m.push(word(keccak256(&data)))?;
            }
            CALLER => m.push(word(m.env.caller.0))?,
            CALLVALUE => m.push(U256::from(m.env.value))?,
            NUMBER => m.push(U256::from(m.env.number))?,
            GAS => {
                let left = u64::try_from(STEP_BUDGET - steps).unwrap_or(0);
                m.push(U256::from(left))?;
            }
            CALLDATALOAD => {
                let i = m.pop()?;
                let mut w = [0u8; 32];
                if let Some(i) = low_u64(&i).and_then(|n| usize::try_from(n).ok()) {
                    for (k, b) in w.iter_mut().enumerate() {
                        *b = i.checked_add(k).and_then(|j| m.env.calldata.get(j)).copied().unwrap_or(0);
                    }
                }
                m.push(word(w))?;
            }
            CALLDATASIZE => {
                let n = u64::try_from(m.env.calldata.len()).unwrap_or(u64::MAX);
                m.push(U256::from(n))?;
            }
            CALLDATACOPY => {
                let src = m.env.calldata;
                m.copy_in(src)?;
            }
            CODECOPY => {
                let src = m.code;
                m.copy_in(src)?;
            }
            POP => {
                m.pop()?;
            }
            MLOAD => {
                let at = m.pop()?;
                let at = m.offset(at)?;
                m.touch(at, 32)?;
                let mut w = [0u8; 32];
                w.copy_from_slice(&m.memory[at..at + 32]);
                m.push(word(w))?;
            }
            MSTORE => {
                let at = m.pop()?;
                let v = m.pop()?;
                let at = m.offset(at)?;
                m.touch(at, 32)?;
                m.memory[at..at + 32].copy_from_slice(&v.to_be_bytes::<32>());
            }
            MSTORE8 => {
                let at = m.pop()?;
                let v = m.pop()?;
                let at = m.offset(at)?;
                m.touch(at, 1)?;
                m.memory[at] = v.to_be_bytes::<32>()[31];
            }
            SLOAD => {
                let k = m.pop()?;
                let v = storage.get(&k).copied().unwrap_or(U256::ZERO);
                m.push(v)?;
            }
            SSTORE => {
                let k = m.pop()?;
                let v = m.pop()?;
                if v.is_zero() {
                    storage.remove(&k);
                } else {
                    storage.insert(k, v);
                }
            }
            JUMP => {
                let dest = m.pop()?;
                m.jump(dest, &valid)?;
            }
            JUMPI => {
                let dest = m.pop()?;
                let cond = m.pop()?;
                if !cond.is_zero() {
                    m.jump(dest, &valid)?;
                }
            }
            JUMPDEST => {}
            0x60..=0x7f => {
                let mut w = [0u8; 32];
                let n = meta.imm;
                for k in 0..n {
                    w[32 - n + k] = m.code.get(at + 1 + k).copied().unwrap_or(0);
                }
                m.push(word(w))?;
            }
            0x80..=0x8f => {
                let n = usize::from(op - 0x7f);
                let v = m
                    .stack
                    .len()
                    .checked_sub(n)
                    .map(|i| m.stack[i])
                    .ok_or(VmError::StackUnderflow { pc: at })?;
                m.push(v)?;
            }
            0x90..=0x9f => {
                let n = usize::from(op - 0x8f);
                let top = m.stack.len().checked_sub(1).ok_or(VmError::StackUnderflow { pc: at })?;
                let other = top.checked_sub(n).ok_or(VmError::StackUnderflow { pc: at })?;
                m.stack.swap(top, other);
            }
            LOG1 => {
                let data = m.slice()?;
                let topic = m.pop()?.to_be_bytes::<32>();
                m.logs.push(Log { topic, data });
            }
            CALL => {
                let ok = m.call()?;
                m.push(ok)?;
            }
            RETURN => {
                let data = m.slice()?;
                return Ok(finish(m, Exit::Return(data), steps));
            }
            REVERT => {
                let data = m.slice()?;
                return Ok(finish(m, Exit::Revert(data), steps));
            }
            _ => return Err(VmError::InvalidOpcode { pc: at, op }),
        }
    }
}

fn finish(m: Machine<'_>, exit: Exit, steps: usize) -> Outcome {
    let (logs, transfers) = if matches!(exit, Exit::Revert(_)) {
        (Vec::new(), Vec::new())
    } else {
        (m.logs, m.transfers)
    };
    Outcome {
        exit,
        logs,
        transfers,
        steps,
    }
}
