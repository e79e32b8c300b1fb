//! Two-pass bytecode assembler.
//!
//! Code is built as a list of [`Instr`]. Jump targets are symbolic labels
//! resolved to `PUSH2` offsets; deploy-time constants are `PUSH32` with a
//! `{{Name}}` placeholder standing in for the 32 immediate bytes. The output
//! is lowercase hex with placeholders left verbatim, so the deployer splices
//! in exactly 64 hex digits per placeholder.

use crate::opcode::{self, JUMPDEST, PUSH2, PUSH32};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// One assembler item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    /// Opcode without immediate.
    Op(u8),
    /// `PUSHn` of these big-endian bytes (`1..=32`).
    Push(Vec<u8>),
    /// `PUSH2` of a label's offset.
    PushLabel(String),
    /// `PUSH32` of a deploy-time placeholder.
    PushTemplate(String),
    /// `JUMPDEST` named by a label.
    Label(String),
    /// Label without code (e.g. end of the init code).
    Mark(String),
}

impl Instr {
    /// Minimal-width push of `n`.
    #[must_use]
    pub fn push_u64(n: u64) -> Self {
        Self::push_bytes(&n.to_be_bytes())
    }

    /// Minimal-width push of a big-endian value.
    #[must_use]
    pub fn push_bytes(be: &[u8]) -> Self {
        let first = be.iter().position(|b| *b != 0).unwrap_or(be.len());
        let trimmed = &be[first..];
        if trimmed.is_empty() {
            Self::Push(vec![0])
        } else {
            Self::Push(trimmed.to_vec())
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Op(_) | Self::Label(_) => 1,
            Self::Push(b) => 1 + b.len(),
            Self::PushLabel(_) => 3,
            Self::PushTemplate(_) => 33,
            Self::Mark(_) => 0,
        }
    }
}

/// Assembly failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AsmError {
    /// A label is defined twice.
    #[error("label `{0}` defined twice")]
    Duplicate(String),
    /// A jump names a label that is never defined.
    #[error("undefined label `{0}`")]
    Undefined(String),
    /// A push immediate is empty or longer than 32 bytes.
    #[error("push immediate of {0} bytes")]
    Immediate(usize),
    /// Code exceeds what `PUSH2` can address.
    #[error("code of {0} bytes exceeds 65535")]
    TooLarge(usize),
    /// An opcode outside the supported subset.
    #[error("opcode 0x{0:02x} is not supported")]
    Opcode(u8),
}

/// A run of assembled output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Concrete bytes.
    Bytes(Vec<u8>),
    /// 32 bytes supplied at deployment.
    Template(String),
}

/// Assembled code with its label table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    /// Output in order.
    pub chunks: Vec<Chunk>,
    /// Length in bytes (placeholders count 32).
    pub len: usize,
    /// Label offsets.
    pub labels: BTreeMap<String, usize>,
}

impl Assembled {
    /// Hex text with `{{Name}}` placeholders.
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.len * 2);
        for c in &self.chunks {
            match c {
                Chunk::Bytes(b) => out.push_str(&hex::encode(b)),
                Chunk::Template(n) => {
                    let _ = write!(out, "{{{{{n}}}}}");
                }
            }
        }
        out
    }

    /// Raw bytes, if the code has no placeholders.
    #[must_use]
    pub fn bytes(&self) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len);
        for c in &self.chunks {
            match c {
                Chunk::Bytes(b) => out.extend_from_slice(b),
                Chunk::Template(_) => return None,
            }
        }
        Some(out)
    }
}

fn layout(code: &[Instr]) -> Result<(BTreeMap<String, usize>, usize), AsmError> {
    let mut labels = BTreeMap::new();
    let mut pc = 0usize;
    for i in code {
        if let Instr::Label(l) | Instr::Mark(l) = i {
            if labels.insert(l.clone(), pc).is_some() {
                return Err(AsmError::Duplicate(l.clone()));
            }
        }
        pc += i.size();
    }
    if pc > usize::from(u16::MAX) {
        return Err(AsmError::TooLarge(pc));
    }
    Ok((labels, pc))
}

/// Resolve labels and emit code.
pub fn assemble(code: &[Instr]) -> Result<Assembled, AsmError> {
    let (labels, len) = layout(code)?;
    let mut chunks = Vec::new();
    let mut cur = Vec::with_capacity(len);
    for i in code {
        match i {
            Instr::Op(b) => {
                if opcode::info(*b).map_or(true, |inf| inf.imm != 0) {
                    return Err(AsmError::Opcode(*b));
                }
                cur.push(*b);
            }
            Instr::Push(bytes) => {
                let op = opcode::push(bytes.len()).ok_or(AsmError::Immediate(bytes.len()))?;
                cur.push(op);
                cur.extend_from_slice(bytes);
            }
            Instr::PushLabel(l) => {
                let at = *labels.get(l).ok_or_else(|| AsmError::Undefined(l.clone()))?;
                let at = u16::try_from(at).map_err(|_| AsmError::TooLarge(at))?;
                cur.push(PUSH2);
                cur.extend_from_slice(&at.to_be_bytes());
            }
            Instr::PushTemplate(name) => {
                cur.push(PUSH32);
                chunks.push(Chunk::Bytes(std::mem::take(&mut cur)));
                chunks.push(Chunk::Template(name.clone()));
            }
            Instr::Label(_) => cur.push(JUMPDEST),
            Instr::Mark(_) => {}
        }
    }
    if !cur.is_empty() {
        chunks.push(Chunk::Bytes(cur));
    }
    Ok(Assembled { chunks, len, labels })
}

/// Human-readable listing: `offset  MNEMONIC immediate`.
pub fn listing(code: &[Instr]) -> Result<String, AsmError> {
    let (labels, _) = layout(code)?;
    let mut out = String::new();
    let mut pc = 0usize;
    for i in code {
        let _ = match i {
            Instr::Op(b) => {
                let name = opcode::info(*b).ok_or(AsmError::Opcode(*b))?.name;
                writeln!(out, "{pc:04x}  {name}")
            }
            Instr::Push(bytes) => {
                let name = opcode::push(bytes.len())
                    .and_then(opcode::info)
                    .ok_or(AsmError::Immediate(bytes.len()))?
                    .name;
                writeln!(out, "{pc:04x}  {name} 0x{}", hex::encode(bytes))
            }
            Instr::PushLabel(l) => {
                let at = labels.get(l).ok_or_else(|| AsmError::Undefined(l.clone()))?;
                writeln!(out, "{pc:04x}  PUSH2 0x{at:04x} ; @{l}")
            }
            Instr::PushTemplate(n) => writeln!(out, "{pc:04x}  PUSH32 {{{{{n}}}}}"),
            Instr::Label(l) => writeln!(out, "{pc:04x}  JUMPDEST ; {l}:"),
            Instr::Mark(l) => writeln!(out, "{pc:04x}  ; {l}:"),
        };
        pc += i.size();
    }
    Ok(out)
}
