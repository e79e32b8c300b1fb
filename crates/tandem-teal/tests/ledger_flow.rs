//! End-to-end runs of generated stack-machine programs on [`StackLedger`].
//!
//! Fixture: a depositor names `n`, pays `10·n`, then ticks the counter down
//! under a deadline; anyone may close once a tick is late.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use tandem_core::build::*;
use tandem_core::{
    compile, names, Call, Local, Ledger, Participant, Payout, Protocol, Reason, SenderCheck, SrcLoc, StateDef,
    Step, StepCall, Stmt, Tail, TimeoutBranch, VarDecl,
};
use tandem_digest::{empty_digest, Address, Kind, Value};
use tandem_teal::{Auth, StackLedger, StackMachine, TxnBody};

const DELTA: u64 = 5;

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .try_init();
}

fn countdown() -> Protocol {
    let refund = || Tail::Halt {
        payouts: vec![Payout { to: var(0), amount: var(2) }],
        outcome: Some(var(1)),
    };
    let step = |id, from, sender, tail, timeout| Step {
        id,
        from,
        who: 0,
        sender,
        bind_sender: None,
        msg: vec![],
        pay: uint(0),
        local: vec![],
        body: vec![],
        timeout,
        tail,
        at: SrcLoc::default(),
    };
    let mut deposit = step(1, 0, SenderCheck::Anyone, Tail::Goto { state: 1, assigns: vec![] }, None);
    deposit.bind_sender = Some(0);
    deposit.msg = vec![1];
    deposit.local = vec![Local::Interact {
        bind: Some(1),
        call: Call::LocalChoice("n".into()),
    }];
    deposit.pay = mul(var(1), uint(10));
    deposit.body = vec![Stmt::Let(2, value())];
    let tick = step(
        2,
        1,
        SenderCheck::Is(0),
        Tail::If {
            cond: eq(var(1), uint(0)),
            then: Box::new(refund()),
            otherwise: Box::new(Tail::Goto {
                state: 1,
                assigns: vec![(1, sub(var(1), uint(1)))],
            }),
        },
        Some(TimeoutBranch { delta: DELTA, on_timeout: 3 }),
    );
    let close = step(3, 1, SenderCheck::Anyone, refund(), None);
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
        steps: vec![deposit, tick, close],
    }
}

fn alice() -> Address {
    Address::from_short([0xa1; 20])
}

fn deployer() -> Address {
    Address::from_short([0xde; 20])
}

fn deployed() -> StackLedger {
    init_tracing();
    let p = countdown();
    let artifact = compile::<StackMachine>(&p).unwrap();
    let mut l = StackLedger::deploy(p, &artifact, deployer(), 100).unwrap();
    l.fund(alice(), 1_000);
    l
}

fn svs(n: u64, total: u64) -> Vec<Value> {
    vec![Value::Address(alice()), Value::UInt(n), Value::UInt(total)]
}

/// Deposit `n`; returns the entry round of state 1.
fn deposit(l: &mut StackLedger, n: u64) -> u64 {
    l.advance(1);
    let call = StepCall {
        step: 1,
        svs: vec![],
        prev_time: l.deployed_at(),
        msg: vec![Value::UInt(n)],
        pay: n * 10,
    };
    l.submit(&alice(), &call).unwrap().time
}

fn tick(n: u64, total: u64, prev_time: u64) -> StepCall {
    StepCall {
        step: 2,
        svs: svs(n, total),
        prev_time,
        msg: vec![],
        pay: 0,
    }
}

#[test]
fn countdown_runs_to_refund() {
    let mut l = deployed();
    let mut t = deposit(&mut l, 2);
    assert_eq!(l.escrow_balance(), 20);
    assert_eq!(l.balance(&alice()), 980);

    for n in (0..=2).rev() {
        l.advance(DELTA);
        t = l.submit(&alice(), &tick(n, 20, t)).unwrap().time;
    }
    assert_eq!(l.escrow_balance(), 0);
    assert_eq!(l.balance(&alice()), 1_000);
    assert_eq!(l.state_digest(), empty_digest());
    assert_eq!(l.observed().len(), 4);
    assert_eq!(l.observed()[2].svs, svs(1, 20));
}

#[test]
fn late_tick_is_outside_the_window_and_close_refunds() {
    let mut l = deployed();
    let t = deposit(&mut l, 3);
    l.advance(DELTA + 1);
    let err = l.submit(&alice(), &tick(3, 30, t)).unwrap_err();
    assert_eq!(err.reason, Reason::Window);

    let stranger = Address::from_short([0x99; 20]);
    let close = StepCall { step: 3, ..tick(3, 30, t) };
    l.submit(&stranger, &close).unwrap();
    assert_eq!(l.balance(&alice()), 1_000);

    let again = l.submit(&stranger, &close).unwrap_err();
    assert_eq!(again.reason, Reason::Halted);
}

#[test]
fn deadline_past_the_last_round_never_lapses() {
    init_tracing();
    let artifact = compile::<StackMachine>(&countdown()).unwrap();
    let mut l = StackLedger::deploy(countdown(), &artifact, deployer(), u64::MAX - 3).unwrap();
    l.fund(alice(), 1_000);
    let t = deposit(&mut l, 2);
    l.advance(1);

    let stranger = Address::from_short([0x99; 20]);
    let close = StepCall { step: 3, ..tick(2, 20, t) };
    let err = l.submit(&stranger, &close).unwrap_err();
    assert_eq!(err.reason, Reason::Window);

    let t = l.submit(&alice(), &tick(2, 20, t)).unwrap().time;
    l.advance(1);
    assert_eq!(l.now(), u64::MAX);
    let err = l.submit(&stranger, &StepCall { step: 3, ..tick(1, 20, t) }).unwrap_err();
    assert_eq!(err.reason, Reason::Window);
    l.submit(&alice(), &tick(1, 20, t)).unwrap();
    assert_eq!(l.observed().len(), 3);
}

#[test]
fn wide_addresses_are_a_shape_rejection() {
    let mut l = deployed();
    let t = deposit(&mut l, 2);
    let mut wide = [0u8; 32];
    wide[0] = 0xa1;
    wide[12..].copy_from_slice(&[0xa1; 20]);

    let mut call = tick(2, 20, t);
    call.svs[0] = Value::Address(Address(wide));
    assert_eq!(l.submit(&alice(), &call).unwrap_err().reason, Reason::Shape);

    let err = l.submit(&Address(wide), &tick(2, 20, t)).unwrap_err();
    assert_eq!(err.reason, Reason::Shape);
    assert_eq!(l.observed().len(), 1);
}

#[test]
fn impostor_and_tampered_claims_are_rejected_atomically() {
    let mut l = deployed();
    let t = deposit(&mut l, 2);
    let before = (l.state_digest(), l.escrow_balance(), l.observed().len());

    let mallory = Address::from_short([0x66; 20]);
    let err = l.submit(&mallory, &tick(2, 20, t)).unwrap_err();
    assert_eq!(err.reason, Reason::Assertion(names::SENDER.into()));

    let err = l.submit(&alice(), &tick(2, 25, t)).unwrap_err();
    assert_eq!(err.reason, Reason::Digest);

    let err = l.submit(&alice(), &tick(2, 20, t + 1)).unwrap_err();
    assert_eq!(err.reason, Reason::Digest);

    assert_eq!(before, (l.state_digest(), l.escrow_balance(), l.observed().len()));
}

#[test]
fn redirected_payout_is_refused_by_the_handler() {
    let mut l = deployed();
    let t = deposit(&mut l, 0);
    let call = tick(0, 0, t);
    let mut group = l.assemble(&alice(), &call).unwrap();
    assert_eq!(group.len(), 4);
    assert_eq!(group[3].auth, Auth::Escrow);
    group[3].txn.body = TxnBody::Pay {
        receiver: Address::from_short([0x66; 20]),
        amount: 0,
    };
    let err = l.submit_group(2, &group).unwrap_err();
    assert_eq!(err.reason, Reason::Shape);
    assert!(err.detail.starts_with("m2:"));

    let ok = l.assemble(&alice(), &call).unwrap();
    l.submit_group(2, &ok).unwrap();
    assert_eq!(l.state_digest(), empty_digest());
}

#[test]
fn key_signed_program_accounts_are_refused() {
    let mut l = deployed();
    let t = deposit(&mut l, 2);
    let mallory = Address::from_short([0x66; 20]);
    let before = (l.state_digest(), l.escrow_balance(), l.balance(&mallory), l.observed().len());

    let mut forged = l.assemble(&alice(), &tick(2, 20, t)).unwrap();
    if let TxnBody::AppCall { args, .. } = &mut forged[0].txn.body {
        args[1] = empty_digest().0.to_vec();
        args[2] = 1u64.to_be_bytes().to_vec();
    }
    forged[2].auth = Auth::Account;
    let mut drain = forged[1].clone();
    drain.txn.sender = l.escrow_address();
    drain.txn.body = TxnBody::Pay {
        receiver: mallory,
        amount: 20,
    };
    forged.push(drain);

    let err = l.submit_group(2, &forged).unwrap_err();
    assert_eq!(err.reason, Reason::Shape);
    assert!(err.detail.starts_with("txn 2:"), "{}", err.detail);

    forged[2].auth = Auth::Handler(2);
    let err = l.submit_group(2, &forged).unwrap_err();
    assert_eq!(err.reason, Reason::Shape);
    assert!(err.detail.starts_with("txn 3:"), "{}", err.detail);

    assert_eq!(before, (l.state_digest(), l.escrow_balance(), l.balance(&mallory), l.observed().len()));
}

#[test]
fn clear_state_waits_for_the_halt() {
    let mut l = deployed();
    let t = deposit(&mut l, 0);
    let err = l.clear_state(&alice()).unwrap_err();
    assert_eq!(err.reason, Reason::Other("running".into()));

    l.advance(1);
    l.submit(&alice(), &tick(0, 0, t)).unwrap();
    assert_eq!(l.state_digest(), empty_digest());
    l.clear_state(&alice()).unwrap();
}

#[test]
fn generated_text_is_deterministic() {
    let p = countdown();
    let a = compile::<StackMachine>(&p).unwrap();
    let b = compile::<StackMachine>(&p).unwrap();
    assert_eq!(a.fingerprint(), b.fingerprint());
    assert!(a.program("m2").unwrap().contains("assert // window\n"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn payment_must_match_exactly(n in 0u64..50, pay in 0u64..600) {
        prop_assume!(pay != n * 10);
        let mut l = deployed();
        l.advance(1);
        let call = StepCall {
            step: 1,
            svs: vec![],
            prev_time: l.deployed_at(),
            msg: vec![Value::UInt(n)],
            pay,
        };
        let err = l.submit(&alice(), &call).unwrap_err();
        prop_assert_eq!(err.reason, Reason::Assertion(names::PAY.into()));
        prop_assert_eq!(l.balance(&alice()), 1_000);
    }
}
