//! Rock-paper-scissors with a wager.
//!
//! Alice names and pays the wager, Bob matches it. Each round Alice commits
//! to `digest(salt, hand)`, Bob plays his hand in the clear, and Alice
//! reveals. A draw loops back to a fresh commitment; otherwise the winner
//! takes the pot. Every wait has a deadline: whoever fails to move in time
//! forfeits the pot to the other side.
//!
//! | state | carries                          | live step (timeout)  |
//! |-------|----------------------------------|----------------------|
//! | `S0`  | nothing                          | 1 wager              |
//! | `S1`  | A, wager, pot                    | 2 accept (3)         |
//! | `S4`  | A, wager, B, pot, outcome        | 4 commit (5)         |
//! | `S6`  | A, wager, B, pot, commitA        | 6 play (7)           |
//! | `S8`  | A, wager, B, pot, commitA, handB | 8 reveal (9)         |

use tandem_core::build::*;
use tandem_core::{
    Assertion, Call, Expr, Local, Participant, Payout, Protocol, SenderCheck, SrcLoc, StateDef, Step, StepId,
    Stmt, Tail, TimeoutBranch, VarDecl, VarId,
};
use tandem_digest::{digest_values, Digest, Kind, Value};

/// Default deadline, in ledger-time units.
pub const DEADLINE: u64 = 10;

/// Alice's role index.
pub const ALICE: usize = 0;
/// Bob's role index.
pub const BOB: usize = 1;

/// Variable ids.
pub mod vars {
    use tandem_core::VarId;

    /// Alice's address.
    pub const A: VarId = 0;
    /// Stake per side.
    pub const WAGER: VarId = 1;
    /// Bob's address.
    pub const B: VarId = 2;
    /// Escrowed total.
    pub const POT: VarId = 3;
    /// Last round's result.
    pub const OUTCOME: VarId = 4;
    /// Alice's commitment.
    pub const COMMIT_A: VarId = 5;
    /// Bob's hand.
    pub const HAND_B: VarId = 6;
    /// Alice's salt (private until reveal).
    pub const SALT: VarId = 7;
    /// Alice's hand (private until reveal).
    pub const HAND_A: VarId = 8;
}

/// State ids.
pub mod states {
    use tandem_core::StateId;

    /// Deployed, nothing staked.
    pub const S0: StateId = 0;
    /// Alice staked.
    pub const S1: StateId = 1;
    /// Loop head: Alice to commit.
    pub const S4: StateId = 2;
    /// Bob to play.
    pub const S6: StateId = 3;
    /// Alice to reveal.
    pub const S8: StateId = 4;
}

/// Hand values.
pub mod hand {
    /// Rock.
    pub const ROCK: u64 = 0;
    /// Paper.
    pub const PAPER: u64 = 1;
    /// Scissors.
    pub const SCISSORS: u64 = 2;
}

/// Round results, as computed by [`outcome`].
pub mod result {
    /// Bob wins.
    pub const B_WINS: u64 = 0;
    /// Draw; play again.
    pub const DRAW: u64 = 1;
    /// Alice wins.
    pub const A_WINS: u64 = 2;
}

/// Names used in assertions.
pub mod checks {
    /// Reveal matches the commitment.
    pub const COMMITMENT: &str = "checkCommitment";
    /// Hand is 0, 1 or 2.
    pub const HAND: &str = "isHand";
}

/// Step ids.
pub mod steps {
    use tandem_core::StepId;

    /// Alice names and pays the wager.
    pub const WAGER: StepId = 1;
    /// Bob matches it.
    pub const ACCEPT: StepId = 2;
    /// Bob never showed; Alice takes her stake back.
    pub const ACCEPT_TIMEOUT: StepId = 3;
    /// Alice commits.
    pub const COMMIT: StepId = 4;
    /// Alice never committed; Bob takes the pot.
    pub const COMMIT_TIMEOUT: StepId = 5;
    /// Bob plays.
    pub const PLAY: StepId = 6;
    /// Bob never played; Alice takes the pot.
    pub const PLAY_TIMEOUT: StepId = 7;
    /// Alice reveals.
    pub const REVEAL: StepId = 8;
    /// Alice never revealed; Bob takes the pot.
    pub const REVEAL_TIMEOUT: StepId = 9;
}

/// `(handA + (4 - handB)) % 3`.
#[must_use]
pub const fn outcome(hand_a: u64, hand_b: u64) -> u64 {
    (hand_a + (4 - hand_b)) % 3
}

/// The commitment Alice publishes for `(salt, hand)`.
#[must_use]
pub fn commitment(salt: u64, hand: u64) -> Digest {
    // Two uints always encode.
    digest_values(&[Value::UInt(salt), Value::UInt(hand)]).unwrap_or_else(|_| tandem_digest::empty_digest())
}

fn at(line: u32, col: u32, what: &str) -> SrcLoc {
    SrcLoc::new("rps.rsh", line, col, what)
}

fn assert(cond: Expr, msg: &str, loc: SrcLoc) -> Stmt {
    Stmt::Assert(Assertion {
        cond,
        msg: msg.to_owned(),
        frames: vec![loc.clone()],
        at: loc,
    })
}

fn pay_pot(to: VarId, outcome: Option<Expr>) -> Tail {
    Tail::Halt {
        payouts: vec![Payout {
            to: var(to),
            amount: var(vars::POT),
        }],
        outcome,
    }
}

struct StepBuilder(Step);

impl StepBuilder {
    fn new(id: StepId, from: usize, who: usize, sender: SenderCheck, tail: Tail, loc: SrcLoc) -> Self {
        Self(Step {
            id,
            from,
            who,
            sender,
            bind_sender: None,
            msg: vec![],
            pay: uint(0),
            local: vec![],
            body: vec![],
            timeout: None,
            tail,
            at: loc,
        })
    }

    fn bind_sender(mut self, v: VarId) -> Self {
        self.0.bind_sender = Some(v);
        self
    }

    fn msg(mut self, vs: &[VarId]) -> Self {
        self.0.msg = vs.to_vec();
        self
    }

    fn pay(mut self, e: Expr) -> Self {
        self.0.pay = e;
        self
    }

    fn local(mut self, l: Local) -> Self {
        self.0.local.push(l);
        self
    }

    fn body(mut self, s: Stmt) -> Self {
        self.0.body.push(s);
        self
    }

    fn deadline(mut self, delta: u64, on_timeout: StepId) -> Self {
        self.0.timeout = Some(TimeoutBranch { delta, on_timeout });
        self
    }
}

fn ask(bind: VarId, call: Call) -> Local {
    Local::Interact { bind: Some(bind), call }
}

/// The protocol, with every deadline set to `deadline`.
#[must_use]
pub fn rock_paper_scissors(deadline: u64) -> Protocol {
    use states::{S0, S1, S4, S6, S8};
    use vars::{A, B, COMMIT_A, HAND_A, HAND_B, OUTCOME, POT, SALT, WAGER};

    let loop_vars = vec![A, WAGER, B, POT];
    let wager = StepBuilder::new(
        steps::WAGER,
        S0,
        ALICE,
        SenderCheck::Anyone,
        Tail::Goto { state: S1, assigns: vec![] },
        at(44, 9, "dot"),
    )
    .bind_sender(A)
    .local(ask(WAGER, Call::LocalChoice("wager".into())))
    .msg(&[WAGER])
    .pay(var(WAGER))
    .body(Stmt::Let(POT, value()));

    let accept = StepBuilder::new(
        steps::ACCEPT,
        S1,
        BOB,
        SenderCheck::Anyone,
        Tail::Goto {
            state: S4,
            assigns: vec![(POT, add(var(POT), var(WAGER))), (OUTCOME, uint(result::DRAW))],
        },
        at(50, 9, "dot"),
    )
    .bind_sender(B)
    .local(Local::Interact {
        bind: None,
        call: Call::AcceptOffer(var(WAGER)),
    })
    .pay(var(WAGER))
    .deadline(deadline, steps::ACCEPT_TIMEOUT);

    let accept_timeout = StepBuilder::new(
        steps::ACCEPT_TIMEOUT,
        S1,
        ALICE,
        SenderCheck::Is(A),
        pay_pot(A, None),
        at(32, 18, "timeout"),
    );

    let commit = StepBuilder::new(
        steps::COMMIT,
        S4,
        ALICE,
        SenderCheck::Is(A),
        Tail::Goto { state: S6, assigns: vec![] },
        at(62, 11, "dot"),
    )
    .local(ask(HAND_A, Call::LocalChoice("hand".into())))
    .local(ask(SALT, Call::Randomness))
    .local(Local::Set {
        bind: COMMIT_A,
        expr: digest(vec![var(SALT), var(HAND_A)]),
    })
    .msg(&[COMMIT_A])
    .deadline(deadline, steps::COMMIT_TIMEOUT);

    let commit_timeout = StepBuilder::new(
        steps::COMMIT_TIMEOUT,
        S4,
        BOB,
        SenderCheck::Is(B),
        pay_pot(B, None),
        at(32, 18, "timeout"),
    );

    let play = StepBuilder::new(
        steps::PLAY,
        S6,
        BOB,
        SenderCheck::Is(B),
        Tail::Goto { state: S8, assigns: vec![] },
        at(68, 9, "dot"),
    )
    .local(ask(HAND_B, Call::LocalChoice("hand".into())))
    .msg(&[HAND_B])
    .body(assert(lt(var(HAND_B), uint(3)), checks::HAND, at(68, 9, "application")))
    .deadline(deadline, steps::PLAY_TIMEOUT);

    let play_timeout = StepBuilder::new(
        steps::PLAY_TIMEOUT,
        S6,
        ALICE,
        SenderCheck::Is(A),
        pay_pot(A, None),
        at(32, 18, "timeout"),
    );

    let settle = Tail::If {
        cond: eq(var(OUTCOME), uint(result::DRAW)),
        then: Box::new(Tail::Goto { state: S4, assigns: vec![] }),
        otherwise: Box::new(Tail::If {
            cond: eq(var(OUTCOME), uint(result::A_WINS)),
            then: Box::new(pay_pot(A, Some(var(OUTCOME)))),
            otherwise: Box::new(pay_pot(B, Some(var(OUTCOME)))),
        }),
    };
    let reveal = StepBuilder::new(steps::REVEAL, S8, ALICE, SenderCheck::Is(A), settle, at(75, 11, "dot"))
        .msg(&[SALT, HAND_A])
        .body(assert(
            eq(digest(vec![var(SALT), var(HAND_A)]), var(COMMIT_A)),
            checks::COMMITMENT,
            at(76, 16, "application"),
        ))
        .body(assert(lt(var(HAND_A), uint(3)), checks::HAND, at(77, 16, "application")))
        .body(Stmt::Let(
            OUTCOME,
            rem(add(var(HAND_A), sub(uint(4), var(HAND_B))), uint(3)),
        ))
        .deadline(deadline, steps::REVEAL_TIMEOUT);

    let reveal_timeout = StepBuilder::new(
        steps::REVEAL_TIMEOUT,
        S8,
        BOB,
        SenderCheck::Is(B),
        pay_pot(B, None),
        at(32, 18, "timeout"),
    );

    let decl = |name: &str, kind| VarDecl {
        name: name.to_owned(),
        kind,
    };
    let with = |extra: &[VarId]| {
        let mut v = loop_vars.clone();
        v.extend_from_slice(extra);
        v
    };
    Protocol {
        name: "rps".into(),
        version: 1,
        participants: vec![
            Participant { name: "Alice".into() },
            Participant { name: "Bob".into() },
        ],
        vars: vec![
            decl("A", Kind::Address),
            decl("wager", Kind::UInt),
            decl("B", Kind::Address),
            decl("pot", Kind::UInt),
            decl("outcome", Kind::UInt),
            decl("commitA", Kind::Digest),
            decl("handB", Kind::UInt),
            decl("salt", Kind::UInt),
            decl("handA", Kind::UInt),
        ],
        states: vec![
            StateDef { label: 0, vars: vec![] },
            StateDef { label: 1, vars: vec![A, WAGER, POT] },
            StateDef { label: 4, vars: with(&[OUTCOME]) },
            StateDef { label: 6, vars: with(&[COMMIT_A]) },
            StateDef { label: 8, vars: with(&[COMMIT_A, HAND_B]) },
        ],
        steps: vec![
            wager.0,
            accept.0,
            accept_timeout.0,
            commit.0,
            commit_timeout.0,
            play.0,
            play_timeout.0,
            reveal.0,
            reveal_timeout.0,
        ],
    }
}
