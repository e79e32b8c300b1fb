//! Protocol intermediate representation.
//!
//! A [`Protocol`] is a set of consensus states and the steps that move
//! between them. Every step is one authorised on-ledger transaction (group):
//!
//! - it is enabled in exactly one state (`from`),
//! - it names the participant who submits it (`who`) and how the verifier
//!   authenticates the submitter (`sender`),
//! - it carries a message (`msg`) and a payment (`pay`),
//! - it runs a straight-line body of `Let`s and `Assert`s, and
//! - it ends in a [`Tail`]: go to a state, halt with payouts, or branch.
//!
//! Timeouts pair two steps enabled in the same state: the *happy* step owns a
//! [`TimeoutBranch`] naming the step that becomes enabled once the deadline
//! lapses. Loops are plain back-edges (`Goto` an earlier state) guarded by an
//! `If` over the updated variables.
//!
//! The IR is produced once and read-only afterwards; backends and clients
//! only borrow it.

use serde::{Deserialize, Serialize};
use std::fmt;
use tandem_digest::Kind;

/// Index into [`Protocol::vars`].
pub type VarId = usize;
/// Index into [`Protocol::states`]; state `0` is entered at deployment.
pub type StateId = usize;
/// Index into [`Protocol::participants`].
pub type ParticipantId = usize;
/// 1-based step number (`steps[id - 1]`).
pub type StepId = u32;

/// Source location of a step or assertion in the surface description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SrcLoc {
    /// Source file.
    pub file: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub col: u32,
    /// What the location refers to (e.g. `"dot"`, `"application"`).
    #[serde(default)]
    pub what: String,
}

impl SrcLoc {
    /// Convenience constructor.
    #[must_use]
    pub fn new(file: &str, line: u32, col: u32, what: &str) -> Self {
        Self {
            file: file.to_owned(),
            line,
            col,
            what: what.to_owned(),
        }
    }
}

impl fmt::Display for SrcLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)?;
        if !self.what.is_empty() {
            write!(f, ":{}", self.what)?;
        }
        Ok(())
    }
}

/// A named role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Display name (e.g. `"Alice"`).
    pub name: String,
}

/// A protocol variable. On-ledger variables are scalar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarDecl {
    /// Display name.
    pub name: String,
    /// Kind of every value bound to it.
    pub kind: Kind,
}

/// A consensus state: the label committed into its digest and the
/// persistent variables it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDef {
    /// Label hashed as the first slot of the state digest.
    pub label: u64,
    /// Persistent variables, in digest order.
    pub vars: Vec<VarId>,
}

/// How the verifier authenticates a step's submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderCheck {
    /// Any account may submit (e.g. the first move of a role).
    Anyone,
    /// Must equal the address bound to this variable.
    Is(VarId),
}

/// Transaction-level facts readable in expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnField {
    /// Authenticated submitter (`Address`).
    Sender,
    /// Attached payment (`UInt`).
    Value,
    /// Ledger time at execution (`UInt`).
    Time,
}

/// Binary operators over checked `u64` arithmetic and scalar equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    /// Checked `+`.
    Add,
    /// Checked `-`.
    Sub,
    /// Checked `*`.
    Mul,
    /// `/`, division by zero faults.
    Div,
    /// `%`, modulo by zero faults.
    Mod,
    /// Scalar equality.
    Eq,
    /// Scalar inequality.
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// Logical and (operands are truthiness of `UInt`).
    And,
    /// Logical or.
    Or,
}

impl BinOp {
    /// Surface symbol (also the stack-machine mnemonic).
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
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
        }
    }

    /// Operators that can fault at runtime.
    #[must_use]
    pub const fn is_checked_arith(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod)
    }

    /// `==` / `!=`, the only operators defined on non-`UInt` scalars.
    #[must_use]
    pub const fn is_equality(self) -> bool {
        matches!(self, Self::Eq | Self::Ne)
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Consensus-side expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Literal.
    UInt(u64),
    /// Variable read.
    Var(VarId),
    /// Transaction field.
    Txn(TxnField),
    /// Binary operation.
    Bin(BinOp, Box<Expr>, Box<Expr>),
    /// Logical not.
    Not(Box<Expr>),
    /// Commitment: digest of the operands under their own kinds.
    Digest(Vec<Expr>),
}

/// Terse expression builders.
pub mod build {
    use super::{BinOp, Expr, TxnField, VarId};

    /// `UInt` literal.
    #[must_use]
    pub const fn uint(n: u64) -> Expr {
        Expr::UInt(n)
    }

    /// Variable read.
    #[must_use]
    pub const fn var(v: VarId) -> Expr {
        Expr::Var(v)
    }

    /// Submitter address.
    #[must_use]
    pub const fn sender() -> Expr {
        Expr::Txn(TxnField::Sender)
    }

    /// Attached payment.
    #[must_use]
    pub const fn value() -> Expr {
        Expr::Txn(TxnField::Value)
    }

    /// Ledger time.
    #[must_use]
    pub const fn now() -> Expr {
        Expr::Txn(TxnField::Time)
    }

    /// Binary operation.
    #[must_use]
    pub fn bin(op: BinOp, l: Expr, r: Expr) -> Expr {
        Expr::Bin(op, Box::new(l), Box::new(r))
    }

    /// `l + r`
    #[must_use]
    pub fn add(l: Expr, r: Expr) -> Expr {
        bin(BinOp::Add, l, r)
    }

    /// `l - r`
    #[must_use]
    pub fn sub(l: Expr, r: Expr) -> Expr {
        bin(BinOp::Sub, l, r)
    }

    /// `l * r`
    #[must_use]
    pub fn mul(l: Expr, r: Expr) -> Expr {
        bin(BinOp::Mul, l, r)
    }

    /// `l % r`
    #[must_use]
    pub fn rem(l: Expr, r: Expr) -> Expr {
        bin(BinOp::Mod, l, r)
    }

    /// `l == r`
    #[must_use]
    pub fn eq(l: Expr, r: Expr) -> Expr {
        bin(BinOp::Eq, l, r)
    }

    /// `l < r`
    #[must_use]
    pub fn lt(l: Expr, r: Expr) -> Expr {
        bin(BinOp::Lt, l, r)
    }

    /// `!e`
    #[must_use]
    pub fn not(e: Expr) -> Expr {
        Expr::Not(Box::new(e))
    }

    /// Commitment over `es`.
    #[must_use]
    pub fn digest(es: Vec<Expr>) -> Expr {
        Expr::Digest(es)
    }
}

/// Host callbacks a participant may invoke during a local computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    /// Ask the host for a named choice (wager, hand, …).
    LocalChoice(String),
    /// Ask the host for 32 random bytes. Bound `UInt` vars take the leading
    /// 8 bytes big-endian; `Digest` vars take all 32.
    Randomness,
    /// Show the host an offer; a host error declines it.
    AcceptOffer(Expr),
}

/// Off-chain computation run by the submitter before assembling its step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Local {
    /// Invoke a host callback, optionally binding its result.
    Interact {
        /// Variable receiving the result.
        bind: Option<VarId>,
        /// Callback to invoke.
        call: Call,
    },
    /// Bind a private variable from an expression over known values.
    Set {
        /// Variable receiving the result.
        bind: VarId,
        /// Expression (may read private and consensus variables).
        expr: Expr,
    },
}

/// A named business check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    /// Condition; holds when truthy.
    pub cond: Expr,
    /// Message reported on failure (e.g. `"checkCommitment"`).
    pub msg: String,
    /// Where the check is written.
    pub at: SrcLoc,
    /// Call-site provenance, innermost first.
    #[serde(default)]
    pub frames: Vec<SrcLoc>,
}

/// Straight-line consensus statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    /// Bind a fresh variable.
    Let(VarId, Expr),
    /// Reject unless the condition holds.
    Assert(Assertion),
}

/// Deadline attached to a happy step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutBranch {
    /// Ledger-time units after the state's entry time.
    pub delta: u64,
    /// Step enabled once `delta` has strictly elapsed.
    pub on_timeout: StepId,
}

/// A terminal transfer out of escrow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// Recipient (`Address`).
    pub to: Expr,
    /// Amount (`UInt`).
    pub amount: Expr,
}

/// What a step does after its body succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tail {
    /// Enter `state`, after simultaneously rebinding `assigns`.
    Goto {
        /// Next state.
        state: StateId,
        /// Loop-variable updates evaluated against the pre-assignment values.
        #[serde(default)]
        assigns: Vec<(VarId, Expr)>,
    },
    /// Pay out and stop; the stored digest becomes the empty-tuple digest.
    Halt {
        /// Transfers, in order.
        payouts: Vec<Payout>,
        /// Value reported to hosts.
        outcome: Option<Expr>,
    },
    /// Branch on a condition.
    If {
        /// Condition (truthy takes `then`).
        cond: Expr,
        /// Taken when truthy.
        then: Box<Tail>,
        /// Taken otherwise.
        otherwise: Box<Tail>,
    },
}

impl Tail {
    /// Upper bound on the payouts any path emits.
    #[must_use]
    pub fn max_payouts(&self) -> usize {
        match self {
            Self::Goto { .. } => 0,
            Self::Halt { payouts, .. } => payouts.len(),
            Self::If { then, otherwise, .. } => then.max_payouts().max(otherwise.max_payouts()),
        }
    }

    /// Whether some path halts.
    #[must_use]
    pub fn may_halt(&self) -> bool {
        match self {
            Self::Goto { .. } => false,
            Self::Halt { .. } => true,
            Self::If { then, otherwise, .. } => then.may_halt() || otherwise.may_halt(),
        }
    }
}

/// One authorised transaction (group).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based id; equals position in [`Protocol::steps`] plus one.
    pub id: StepId,
    /// State this step is enabled in.
    pub from: StateId,
    /// Participant whose client submits it.
    pub who: ParticipantId,
    /// Verifier-side identity check.
    pub sender: SenderCheck,
    /// Binds the authenticated submitter to this variable.
    #[serde(default)]
    pub bind_sender: Option<VarId>,
    /// Message variables, in argument order.
    #[serde(default)]
    pub msg: Vec<VarId>,
    /// Exact payment into escrow.
    pub pay: Expr,
    /// Submitter-side computations run before assembly.
    #[serde(default)]
    pub local: Vec<Local>,
    /// Consensus body.
    #[serde(default)]
    pub body: Vec<Stmt>,
    /// Deadline and its alternative step.
    #[serde(default)]
    pub timeout: Option<TimeoutBranch>,
    /// Continuation.
    pub tail: Tail,
    /// Source location.
    #[serde(default)]
    pub at: SrcLoc,
}

/// When a step may execute, relative to its state's entry time `t0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    /// Any time.
    Open,
    /// `t0 <= t <= t0 + δ` (happy path).
    Within(u64),
    /// `t > t0 + δ` (timeout path).
    After(u64),
}

impl Window {
    /// Whether `now` falls in the window anchored at `anchor`.
    ///
    /// A deadline past `u64::MAX` never lapses.
    #[must_use]
    pub const fn admits(self, anchor: u64, now: u64) -> bool {
        match self {
            Self::Open => true,
            Self::Within(d) => now <= anchor.saturating_add(d),
            Self::After(d) => now > anchor.saturating_add(d),
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Within(d) => write!(f, "[t0, t0+{d}]"),
            Self::After(d) => write!(f, "(t0+{d}, ∞)"),
        }
    }
}

/// Which arm of a state's timeout race is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Branch {
    /// The counterpart may still act in time.
    Happy(StepId),
    /// The deadline has lapsed; the timeout step is enabled.
    TimedOut(StepId),
}

impl Branch {
    /// The step this arm enables.
    #[inline]
    #[must_use]
    pub const fn step(self) -> StepId {
        match self {
            Self::Happy(s) | Self::TimedOut(s) => s,
        }
    }
}

/// A complete protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    /// Protocol name (used in artifact names and logs).
    pub name: String,
    /// IR format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Roles.
    pub participants: Vec<Participant>,
    /// All variables (consensus and private).
    pub vars: Vec<VarDecl>,
    /// Consensus states; `states[0]` is initial.
    pub states: Vec<StateDef>,
    /// Steps; `steps[i].id == i + 1`.
    pub steps: Vec<Step>,
}

const fn default_version() -> u32 {
    1
}

impl Protocol {
    /// Look up a step by id.
    #[must_use]
    pub fn step(&self, id: StepId) -> Option<&Step> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.steps.get(idx)
    }

    /// Number of steps.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the protocol has no steps.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Kind of variable `v`.
    #[must_use]
    pub fn var_kind(&self, v: VarId) -> Option<&Kind> {
        self.vars.get(v).map(|d| &d.kind)
    }

    /// Kinds of a state's persistent variables, in digest order.
    #[must_use]
    pub fn state_kinds(&self, s: StateId) -> Vec<Kind> {
        self.states
            .get(s)
            .map(|st| st.vars.iter().filter_map(|v| self.var_kind(*v).cloned()).collect())
            .unwrap_or_default()
    }

    /// Kinds of a step's message, in argument order.
    #[must_use]
    pub fn msg_kinds(&self, step: &Step) -> Vec<Kind> {
        step.msg.iter().filter_map(|v| self.var_kind(*v).cloned()).collect()
    }

    /// The happy step whose timeout enables `id`, if any.
    #[must_use]
    pub fn timeout_owner(&self, id: StepId) -> Option<&Step> {
        self.steps
            .iter()
            .find(|s| s.timeout.is_some_and(|t| t.on_timeout == id))
    }

    /// Execution window of step `id`.
    #[must_use]
    pub fn window(&self, id: StepId) -> Window {
        if let Some(t) = self.step(id).and_then(|s| s.timeout) {
            return Window::Within(t.delta);
        }
        self.timeout_owner(id)
            .and_then(|owner| owner.timeout)
            .map_or(Window::Open, |t| Window::After(t.delta))
    }

    /// The step a state enables before any deadline (not a timeout target).
    #[must_use]
    pub fn primary_step(&self, s: StateId) -> Option<&Step> {
        self.steps
            .iter()
            .find(|st| st.from == s && self.timeout_owner(st.id).is_none())
    }

    /// Which step is live in state `s`, entered at `anchor`, at time `now`.
    ///
    /// `None` for a state with no outgoing step.
    #[must_use]
    pub fn select(&self, s: StateId, anchor: u64, now: u64) -> Option<Branch> {
        let primary = self.primary_step(s)?;
        match primary.timeout {
            None => Some(Branch::Happy(primary.id)),
            Some(t) if Window::Within(t.delta).admits(anchor, now) => Some(Branch::Happy(primary.id)),
            Some(t) => Some(Branch::TimedOut(t.on_timeout)),
        }
    }

    /// Infer the kind of `e`, or explain why it is ill-typed.
    pub fn kind_of(&self, e: &Expr) -> Result<Kind, String> {
        match e {
            Expr::UInt(_) | Expr::Txn(TxnField::Value | TxnField::Time) => Ok(Kind::UInt),
            Expr::Txn(TxnField::Sender) => Ok(Kind::Address),
            Expr::Var(v) => self
                .var_kind(*v)
                .cloned()
                .ok_or_else(|| format!("unknown variable #{v}")),
            Expr::Not(inner) => match self.kind_of(inner)? {
                Kind::UInt => Ok(Kind::UInt),
                k => Err(format!("`!` expects uint, found {k}")),
            },
            Expr::Bin(op, l, r) => {
                let (kl, kr) = (self.kind_of(l)?, self.kind_of(r)?);
                if op.is_equality() {
                    if kl != kr || !kl.is_scalar() {
                        return Err(format!("`{op}` on {kl} and {kr}"));
                    }
                } else if kl != Kind::UInt || kr != Kind::UInt {
                    return Err(format!("`{op}` expects uint operands, found {kl} and {kr}"));
                }
                Ok(Kind::UInt)
            }
            Expr::Digest(es) => {
                for x in es {
                    let k = self.kind_of(x)?;
                    if !k.is_scalar() {
                        return Err(format!("cannot commit to {k}"));
                    }
                }
                Ok(Kind::Digest)
            }
        }
    }
}
