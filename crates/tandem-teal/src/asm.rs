//! Textual stack-machine assembly.
//!
//! A [`Program`] is a `#pragma version N` header followed by one instruction
//! per line. A trailing `// note` on a checking instruction names the
//! rejection reason (see [`tandem_core::Reason::note`]); the ledger reads it
//! back when that instruction fails.
//!
//! Immediates may be deploy-time placeholders (`int {{ApplicationID}}`,
//! `byte {{ContractAddr}}`). They render verbatim and must be resolved
//! before [`Program::parse`] accepts the text.

use std::fmt;

/// Transaction fields readable with `txn` / `gtxn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Signing account.
    Sender,
    /// Payment receiver.
    Receiver,
    /// Payment amount.
    Amount,
    /// `1` for payments, `6` for application calls.
    TypeEnum,
    /// Called application (`0` on creation).
    ApplicationID,
    /// Number of application arguments.
    NumAppArgs,
    /// Application call kind (`0` no-op, `4` update).
    OnCompletion,
    /// Position in the group.
    GroupIndex,
}

impl Field {
    const ALL: [Self; 8] = [
        Self::Sender,
        Self::Receiver,
        Self::Amount,
        Self::TypeEnum,
        Self::ApplicationID,
        Self::NumAppArgs,
        Self::OnCompletion,
        Self::GroupIndex,
    ];

    /// Assembly name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sender => "Sender",
            Self::Receiver => "Receiver",
            Self::Amount => "Amount",
            Self::TypeEnum => "TypeEnum",
            Self::ApplicationID => "ApplicationID",
            Self::NumAppArgs => "NumAppArgs",
            Self::OnCompletion => "OnCompletion",
            Self::GroupIndex => "GroupIndex",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == s)
    }
}

/// `TypeEnum` of a payment.
pub const TYPE_PAY: u64 = 1;
/// `TypeEnum` of an application call.
pub const TYPE_APPL: u64 = 6;
/// `OnCompletion` of a plain call.
pub const ON_NOOP: u64 = 0;
/// `OnCompletion` of a clear-state call.
pub const ON_CLEAR: u64 = 3;
/// `OnCompletion` of a program update.
pub const ON_UPDATE: u64 = 4;

/// Ledger-wide fields readable with `global`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalField {
    /// Transactions in the current group.
    GroupSize,
    /// Current round (ledger time).
    Round,
}

impl GlobalField {
    /// Assembly name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GroupSize => "GroupSize",
            Self::Round => "Round",
        }
    }
}

/// An immediate operand of `int` / `byte`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Imm {
    /// Decimal integer.
    Int(u64),
    /// Raw bytes, rendered `0x…`.
    Bytes(Vec<u8>),
    /// ASCII string, rendered `"…"`.
    Str(String),
    /// Deploy-time placeholder, rendered `{{Name}}`.
    Template(String),
}

impl fmt::Display for Imm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Template(name) => write!(f, "{{{{{name}}}}}"),
        }
    }
}

/// One instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Push an integer.
    Int(Imm),
    /// Push a byte string.
    Byte(Imm),
    /// Field of the current transaction.
    Txn(Field),
    /// Field of group transaction `i`.
    Gtxn(u8, Field),
    /// Application argument `k` of the current transaction.
    Txna(u8),
    /// Application argument `k` of group transaction `i`.
    Gtxna(u8, u8),
    /// Ledger-wide field.
    Global(GlobalField),
    /// Checked `+`.
    Add,
    /// Checked `-`.
    Sub,
    /// Checked `*`.
    Mul,
    /// `/`, faults on zero.
    Div,
    /// `%`, faults on zero.
    Mod,
    /// Equality over two uints or two byte strings.
    Eq,
    /// Inequality.
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// Logical and.
    And,
    /// Logical or.
    Or,
    /// Logical not.
    Not,
    /// uint → 8-byte big-endian.
    Itob,
    /// ≤ 8 bytes big-endian → uint.
    Btoi,
    /// Byte concatenation.
    Concat,
    /// Byte length.
    Len,
    /// Bytes `[s, s + l)` of a byte string.
    Extract(u8, u8),
    /// Keccak-256.
    Keccak256,
    /// Fail unless the top of stack is non-zero.
    Assert,
    /// Fail immediately.
    Err,
    /// Stop; accept iff the top of stack is non-zero.
    Return,
    /// Duplicate the top of stack.
    Dup,
    /// Drop the top of stack.
    Pop,
    /// Pop into scratch slot.
    Store(u8),
    /// Push scratch slot.
    Load(u8),
    /// Branch if zero.
    Bz(String),
    /// Branch if non-zero.
    Bnz(String),
    /// Unconditional branch.
    B(String),
    /// Branch target.
    Label(String),
    /// Read an application global.
    AppGlobalGet,
    /// Write an application global.
    AppGlobalPut,
}

impl Op {
    /// Mnemonic of an operator without immediates.
    const fn bare(&self) -> Option<&'static str> {
        Some(match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
            Self::Not => "!",
            Self::Itob => "itob",
            Self::Btoi => "btoi",
            Self::Concat => "concat",
            Self::Len => "len",
            Self::Keccak256 => "keccak256",
            Self::Assert => "assert",
            Self::Err => "err",
            Self::Return => "return",
            Self::Dup => "dup",
            Self::Pop => "pop",
            Self::AppGlobalGet => "app_global_get",
            Self::AppGlobalPut => "app_global_put",
            _ => return None,
        })
    }

    const BARE: [Self; 26] = [
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Mod,
        Self::Eq,
        Self::Ne,
        Self::Lt,
        Self::Le,
        Self::Gt,
        Self::Ge,
        Self::And,
        Self::Or,
        Self::Not,
        Self::Itob,
        Self::Btoi,
        Self::Concat,
        Self::Len,
        Self::Keccak256,
        Self::Assert,
        Self::Err,
        Self::Return,
        Self::Dup,
        Self::Pop,
        Self::AppGlobalGet,
        Self::AppGlobalPut,
    ];
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(m) = self.bare() {
            return f.write_str(m);
        }
        match self {
            Self::Int(i) => write!(f, "int {i}"),
            Self::Byte(b) => write!(f, "byte {b}"),
            Self::Txn(fl) => write!(f, "txn {}", fl.name()),
            Self::Gtxn(i, fl) => write!(f, "gtxn {i} {}", fl.name()),
            Self::Txna(k) => write!(f, "txna ApplicationArgs {k}"),
            Self::Gtxna(i, k) => write!(f, "gtxna {i} ApplicationArgs {k}"),
            Self::Extract(s, l) => write!(f, "extract {s} {l}"),
            Self::Global(g) => write!(f, "global {}", g.name()),
            Self::Store(n) => write!(f, "store {n}"),
            Self::Load(n) => write!(f, "load {n}"),
            Self::Bz(l) => write!(f, "bz {l}"),
            Self::Bnz(l) => write!(f, "bnz {l}"),
            Self::B(l) => write!(f, "b {l}"),
            Self::Label(l) => write!(f, "{l}:"),
            _ => Ok(()),
        }
    }
}

/// An instruction with its optional trailing comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Instruction.
    pub op: Op,
    /// Comment text (a rejection note on checking instructions).
    pub note: Option<String>,
}

impl Line {
    /// Instruction without a comment.
    #[must_use]
    pub const fn bare(op: Op) -> Self {
        Self { op, note: None }
    }
}

/// Assembly text could not be read back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AsmError {
    /// Missing or malformed `#pragma version`.
    #[error("missing `#pragma version` header")]
    Pragma,
    /// A `{{Name}}` placeholder was never resolved.
    #[error("line {line}: unresolved placeholder")]
    Unresolved {
        /// 1-based line.
        line: usize,
    },
    /// Unknown mnemonic or bad immediate.
    #[error("line {line}: cannot parse `{text}`")]
    Syntax {
        /// 1-based line.
        line: usize,
        /// Offending text.
        text: String,
    },
    /// Branch to a label that is never defined.
    #[error("undefined label `{0}`")]
    Label(String),
}

/// A whole program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    /// `#pragma version`.
    pub version: u8,
    /// Instructions in order.
    pub lines: Vec<Line>,
}

impl Program {
    /// Empty program for `version`.
    #[must_use]
    pub const fn new(version: u8) -> Self {
        Self {
            version,
            lines: Vec::new(),
        }
    }

    /// Render as assembly text; notes are dropped unless `comments`.
    #[must_use]
    pub fn render(&self, comments: bool) -> String {
        let mut out = format!("#pragma version {}\n", self.version);
        for l in &self.lines {
            out.push_str(&l.op.to_string());
            if let (true, Some(n)) = (comments, &l.note) {
                out.push_str(" // ");
                out.push_str(n);
            }
            out.push('\n');
        }
        out
    }

    /// Parse resolved assembly text.
    ///
    /// # Errors
    /// Fails on a missing pragma, unresolved placeholders, unknown
    /// instructions, or branches to undefined labels.
    pub fn parse(text: &str) -> Result<Self, AsmError> {
        let mut lines = text.lines().enumerate();
        let version = lines
            .by_ref()
            .find(|(_, l)| !l.trim().is_empty())
            .and_then(|(_, l)| l.trim().strip_prefix("#pragma version "))
            .and_then(|v| v.trim().parse().ok())
            .ok_or(AsmError::Pragma)?;

        let mut prog = Self::new(version);
        for (i, raw) in lines {
            let line = i + 1;
            let (code, note) = match raw.split_once("//") {
                Some((c, n)) => (c.trim(), Some(n.trim().to_owned()).filter(|n| !n.is_empty())),
                None => (raw.trim(), None),
            };
            if code.is_empty() {
                continue;
            }
            if code.contains("{{") {
                return Err(AsmError::Unresolved { line });
            }
            let op = parse_op(code).ok_or_else(|| AsmError::Syntax {
                line,
                text: code.to_owned(),
            })?;
            prog.lines.push(Line { op, note });
        }

        for l in &prog.lines {
            if let Op::Bz(t) | Op::Bnz(t) | Op::B(t) = &l.op {
                if prog.label_pc(t).is_none() {
                    return Err(AsmError::Label(t.clone()));
                }
            }
        }
        Ok(prog)
    }

    /// Index of the line defining `label`.
    #[must_use]
    pub fn label_pc(&self, label: &str) -> Option<usize> {
        self.lines
            .iter()
            .position(|l| matches!(&l.op, Op::Label(x) if x == label))
    }
}

fn parse_imm_bytes(s: &str) -> Option<Imm> {
    if let Some(h) = s.strip_prefix("0x") {
        return hex::decode(h).ok().map(Imm::Bytes);
    }
    s.strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .map(|r| Imm::Str(r.to_owned()))
}

fn parse_op(code: &str) -> Option<Op> {
    if let Some(label) = code.strip_suffix(':') {
        return Some(Op::Label(label.to_owned()));
    }
    let toks: Vec<&str> = code.split_whitespace().collect();
    let arg = |i: usize| toks.get(i).copied();
    let small = |i: usize| arg(i).and_then(|t| t.parse::<u8>().ok());
    match (toks.first().copied()?, toks.len()) {
        ("int", 2) => arg(1)?.parse().ok().map(|n| Op::Int(Imm::Int(n))),
        ("byte", 2) => parse_imm_bytes(arg(1)?).map(Op::Byte),
        ("txn", 2) => Field::parse(arg(1)?).map(Op::Txn),
        ("gtxn", 3) => Some(Op::Gtxn(small(1)?, Field::parse(arg(2)?)?)),
        ("txna", 3) if arg(1) == Some("ApplicationArgs") => small(2).map(Op::Txna),
        ("gtxna", 4) if arg(2) == Some("ApplicationArgs") => Some(Op::Gtxna(small(1)?, small(3)?)),
        ("global", 2) => match arg(1)? {
            "GroupSize" => Some(Op::Global(GlobalField::GroupSize)),
            "Round" => Some(Op::Global(GlobalField::Round)),
            _ => None,
        },
        ("extract", 3) => Some(Op::Extract(small(1)?, small(2)?)),
        ("store", 2) => small(1).map(Op::Store),
        ("load", 2) => small(1).map(Op::Load),
        ("bz", 2) => arg(1).map(|l| Op::Bz(l.to_owned())),
        ("bnz", 2) => arg(1).map(|l| Op::Bnz(l.to_owned())),
        ("b", 2) => arg(1).map(|l| Op::B(l.to_owned())),
        (m, 1) => Op::BARE.into_iter().find(|op| op.bare() == Some(m)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Program {
        let mut p = Program::new(2);
        p.lines = vec![
            Line::bare(Op::Gtxn(0, Field::ApplicationID)),
            Line::bare(Op::Int(Imm::Template("ApplicationID".into()))),
            Line::bare(Op::Eq),
            Line {
                op: Op::Assert,
                note: Some("shape".into()),
            },
            Line::bare(Op::Byte(Imm::Str("s".into()))),
            Line::bare(Op::AppGlobalGet),
            Line::bare(Op::Gtxna(0, 4)),
            Line::bare(Op::Bz("done".into())),
            Line::bare(Op::Label("done".into())),
            Line::bare(Op::Int(Imm::Int(1))),
            Line::bare(Op::Return),
        ];
        p
    }

    #[test]
    fn renders_with_notes_and_placeholders() {
        let text = sample().render(true);
        assert!(text.starts_with("#pragma version 2\n"));
        assert!(text.contains("int {{ApplicationID}}\n"));
        assert!(text.contains("assert // shape\n"));
        assert!(text.contains("gtxna 0 ApplicationArgs 4\n"));
        assert!(!sample().render(false).contains("//"));
    }

    #[test]
    fn unresolved_text_is_refused() {
        let text = sample().render(true);
        assert_eq!(Program::parse(&text), Err(AsmError::Unresolved { line: 3 }));
    }

    #[test]
    fn resolved_text_parses_back() {
        let text = sample().render(true).replace("{{ApplicationID}}", "7");
        let p = Program::parse(&text).unwrap();
        let mut want = sample();
        want.lines[1].op = Op::Int(Imm::Int(7));
        assert_eq!(p, want);
        assert_eq!(p.label_pc("done"), Some(8));
    }

    #[test]
    fn rejects_unknown_label_and_mnemonic() {
        assert_eq!(
            Program::parse("#pragma version 2\nb nowhere\n"),
            Err(AsmError::Label("nowhere".into()))
        );
        assert!(matches!(
            Program::parse("#pragma version 2\nfrobnicate\n"),
            Err(AsmError::Syntax { line: 2, .. })
        ));
        assert_eq!(Program::parse("int 1\n"), Err(AsmError::Pragma));
    }

    #[test]
    fn extract_takes_two_small_immediates() {
        let p = Program::parse("#pragma version 2\nextract 0 12\n").unwrap();
        assert_eq!(p.lines[0].op, Op::Extract(0, 12));
        assert!(p.render(false).ends_with("extract 0 12\n"));
        assert!(Program::parse("#pragma version 2\nextract 0 300\n").is_err());
    }
}
