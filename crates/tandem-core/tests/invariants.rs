//! Invariants of the reference semantics over a small looping protocol.
//!
//! The protocol: a depositor names a counter `n` and pays `10·n` into escrow,
//! then ticks the counter down one step at a time. Each tick has a deadline;
//! once it lapses anyone may close the protocol and refund the depositor.
//!
//! These tests treat [`verify`] as authoritative and check that:
//! - accepted steps chain through the stored digest,
//! - the happy and timeout arms of a deadline are mutually exclusive and
//!   agree with [`Protocol::select`],
//! - tampered claims and wrong payments are always rejected.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use tandem_core::build::*;
use tandem_core::{
    names, validate, verify, Branch, Call, Consensus, Effects, Local, Participant, Payout,
    Protocol, Reason, SenderCheck, Snapshot, SrcLoc, StateDef, Step, StepError, Submission,
    Tail, TimeoutBranch, VarDecl,
};
use tandem_digest::{Address, Kind, Value};

const DELTA: u64 = 5;

fn countdown() -> Protocol {
    let refund = || Tail::Halt {
        payouts: vec![Payout { to: var(0), amount: var(2) }],
        outcome: Some(var(1)),
    };
    Protocol {
        name: "countdown".into(),
        version: 1,
        participants: vec![Participant { name: "Depositor".into() }],
        vars: vec![
            VarDecl { name: "a".into(), kind: Kind::Address },
            VarDecl { name: "n".into(), kind: Kind::UInt },
            VarDecl { name: "total".into(), kind: Kind::UInt },
        ],
        states: vec![
            StateDef { label: 0, vars: vec![] },
            StateDef { label: 1, vars: vec![0, 1, 2] },
        ],
        steps: vec![
            Step {
                id: 1,
                from: 0,
                who: 0,
                sender: SenderCheck::Anyone,
                bind_sender: Some(0),
                msg: vec![1],
                pay: mul(var(1), uint(10)),
                local: vec![Local::Interact {
                    bind: Some(1),
                    call: Call::LocalChoice("n".into()),
                }],
                body: vec![tandem_core::Stmt::Let(2, value())],
                timeout: None,
                tail: Tail::Goto { state: 1, assigns: vec![] },
                at: SrcLoc::new("countdown.rsh", 3, 1, "deposit"),
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
                timeout: Some(TimeoutBranch { delta: DELTA, on_timeout: 3 }),
                tail: Tail::If {
                    cond: eq(var(1), uint(0)),
                    then: Box::new(refund()),
                    otherwise: Box::new(Tail::Goto {
                        state: 1,
                        assigns: vec![(1, sub(var(1), uint(1)))],
                    }),
                },
                at: SrcLoc::new("countdown.rsh", 8, 1, "tick"),
            },
            Step {
                id: 3,
                from: 1,
                who: 0,
                sender: SenderCheck::Anyone,
                bind_sender: None,
                msg: vec![],
                pay: uint(0),
                local: vec![],
                body: vec![],
                timeout: None,
                tail: refund(),
                at: SrcLoc::new("countdown.rsh", 12, 1, "close"),
            },
        ],
    }
}

fn alice() -> Address {
    Address::from_short([0xa1; 20])
}

#[track_caller]
fn running(fx: &Effects) -> Snapshot {
    match &fx.next {
        Consensus::Running(s) => s.clone(),
        Consensus::Halted => panic!("unexpected halt"),
    }
}

fn deposit(p: &Protocol, n: u64, t0: u64) -> Effects {
    let stored = Consensus::Running(Snapshot::initial(t0)).stored_digest(p).unwrap();
    verify(
        p,
        1,
        Some(&stored),
        &Submission {
            sender: alice(),
            value: n * 10,
            time: t0 + 1,
            svs: vec![],
            prev_time: t0,
            msg: vec![Value::UInt(n)],
        },
    )
    .unwrap()
}

#[test]
fn countdown_validates() {
    validate(&countdown()).unwrap();
}

#[test]
fn self_timeout_is_malformed() {
    let mut p = countdown();
    p.steps[1].timeout = Some(TimeoutBranch { delta: 1, on_timeout: 2 });
    assert!(validate(&p).is_err());
}

proptest! {
    #[test]
    fn loop_chains_to_halt(n in 0u64..12, gaps in prop::collection::vec(0u64..=DELTA, 12)) {
        let p = countdown();
        let mut fx = deposit(&p, n, 100);
        let mut ticks = 0usize;
        while !fx.halted() {
            let snap = running(&fx);
            let now = snap.time + gaps[ticks];
            fx = verify(&p, 2, Some(&fx.next_digest.with_time), &Submission {
                sender: alice(),
                value: 0,
                time: now,
                svs: snap.svs.clone(),
                prev_time: snap.time,
                msg: vec![],
            }).unwrap();
            ticks += 1;
        }
        prop_assert_eq!(ticks as u64, n + 1);
        prop_assert_eq!(fx.payouts.len(), 1);
        prop_assert_eq!(fx.payouts[0].to, alice());
        prop_assert_eq!(fx.payouts[0].amount, n * 10);
        prop_assert_eq!(fx.outcome, Some(Value::UInt(0)));
    }

    #[test]
    fn deadline_arms_are_exclusive(gap in 0u64..(3 * DELTA), closer in any::<[u8; 20]>()) {
        let p = countdown();
        let fx = deposit(&p, 3, 50);
        let snap = running(&fx);
        let now = snap.time + gap;
        let stored = fx.next_digest.with_time;
        let mk = |sender| Submission {
            sender,
            value: 0,
            time: now,
            svs: snap.svs.clone(),
            prev_time: snap.time,
            msg: vec![],
        };
        let happy = verify(&p, 2, Some(&stored), &mk(alice()));
        let timed_out = verify(&p, 3, Some(&stored), &mk(Address::from_short(closer)));
        prop_assert!(happy.is_ok() != timed_out.is_ok());
        let expected = if gap <= DELTA { Branch::Happy(2) } else { Branch::TimedOut(3) };
        prop_assert_eq!(p.select(snap.state, snap.time, now), Some(expected));
        prop_assert_eq!(happy.is_ok(), gap <= DELTA);
        if let Err(e) = happy {
            prop_assert_eq!(e.reason(), Reason::Window);
        }
    }

    #[test]
    fn wrong_payment_is_rejected(n in 0u64..1000, value in any::<u64>()) {
        prop_assume!(value != n * 10);
        let p = countdown();
        let stored = Consensus::Running(Snapshot::initial(0)).stored_digest(&p).unwrap();
        let err = verify(&p, 1, Some(&stored), &Submission {
            sender: alice(),
            value,
            time: 1,
            svs: vec![],
            prev_time: 0,
            msg: vec![Value::UInt(n)],
        }).unwrap_err();
        prop_assert_eq!(err.reason(), Reason::Assertion(names::PAY.into()));
    }

    #[test]
    fn tampered_claims_miss_the_digest(n in 1u64..50, bump in 1u64..50) {
        let p = countdown();
        let fx = deposit(&p, n, 10);
        let snap = running(&fx);
        let mut svs = snap.svs.clone();
        svs[1] = Value::UInt(n + bump);
        let err = verify(&p, 2, Some(&fx.next_digest.with_time), &Submission {
            sender: alice(),
            value: 0,
            time: snap.time,
            svs,
            prev_time: snap.time,
            msg: vec![],
        }).unwrap_err();
        let missed = matches!(err, StepError::DigestMismatch { step: 2, .. });
        prop_assert!(missed);

        // A stale entry time is just as wrong.
        let err = verify(&p, 2, Some(&fx.next_digest.with_time), &Submission {
            sender: alice(),
            value: 0,
            time: snap.time,
            svs: snap.svs.clone(),
            prev_time: snap.time - 1,
            msg: vec![],
        }).unwrap_err();
        prop_assert_eq!(err.reason(), Reason::Digest);
    }
}

#[test]
fn impostor_fails_sender_check_before_digest() {
    let p = countdown();
    let fx = deposit(&p, 2, 0);
    let snap = running(&fx);
    let err = verify(
        &p,
        2,
        Some(&tandem_digest::Digest::ZERO),
        &Submission {
            sender: Address::from_short([0xee; 20]),
            value: 0,
            time: snap.time,
            svs: snap.svs,
            prev_time: snap.time,
            msg: vec![],
        },
    )
    .unwrap_err();
    assert_eq!(err.reason(), Reason::Assertion(names::SENDER.into()));
}
