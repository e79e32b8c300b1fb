//! End-to-end runs of generated contracts on [`AccountLedger`].
//!
//! Same countdown fixture as the stack-machine suite: deposit `n` paying
//! `10·n`, tick down under a deadline, anyone may close once a tick is late.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use tandem_core::build::*;
use tandem_core::{
    compile, names, Call, Local, BackendArtifact, Ledger, Participant, Payout, Protocol, Reason, SenderCheck,
    SrcLoc, StateDef, Step, StepCall, Stmt, Tail, TimeoutBranch, VarDecl,
};
use tandem_digest::{empty_digest, state_digest, Address, Kind, Value};
use tandem_evm::{abi, AccountContract, AccountLedger, DeployError};

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .try_init();
}

const DELTA: u64 = 5;

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

fn artifact() -> BackendArtifact {
    compile::<AccountContract>(&countdown()).unwrap()
}

fn deployed() -> AccountLedger {
    init_tracing();
    let mut l = AccountLedger::deploy(countdown(), &artifact(), deployer(), 100).unwrap();
    l.fund(alice(), 1_000);
    l
}

fn svs(n: u64, total: u64) -> Vec<Value> {
    vec![Value::Address(alice()), Value::UInt(n), Value::UInt(total)]
}

/// Deposit `n`; returns the entry block of state 1.
fn deposit(l: &mut AccountLedger, n: u64) -> u64 {
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
fn constructor_stores_the_initial_digest() {
    let l = deployed();
    let expected = state_digest(0, &[], &[], 100).unwrap().with_time;
    assert_eq!(l.state_digest(), expected);
    assert!(!l.runtime().is_empty());
}

#[test]
fn countdown_runs_to_refund() {
    let mut l = deployed();
    let mut t = deposit(&mut l, 2);
    assert_eq!(l.escrow_balance(), 20);
    assert_eq!(l.balance(&alice()), 980);
    let running = state_digest(1, &[Kind::Address, Kind::UInt, Kind::UInt], &svs(2, 20), t).unwrap();
    assert_eq!(l.state_digest(), running.with_time);

    for n in (0..=2).rev() {
        l.advance(DELTA);
        t = l.submit(&alice(), &tick(n, 20, t)).unwrap().time;
    }
    assert_eq!(l.escrow_balance(), 0);
    assert_eq!(l.balance(&alice()), 1_000);
    assert_eq!(l.state_digest(), empty_digest());
    assert_eq!(l.observed().len(), 4);
    assert_eq!(l.observed()[2].svs, svs(1, 20));
    assert_eq!(l.observed()[0].msg, vec![Value::UInt(2)]);
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
    let artifact = artifact();
    let mut l = AccountLedger::deploy(countdown(), &artifact, deployer(), u64::MAX - 3).unwrap();
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
fn malformed_calldata_is_a_shape_rejection() {
    let mut l = deployed();
    let p = countdown();
    let good = abi::encode_call(&p, p.step(1).unwrap(), &[], 100, &[Value::UInt(1)]).unwrap();

    let err = l.submit_calldata(1, &alice(), 10, &good[..good.len() - 1]).unwrap_err();
    assert_eq!(err.reason, Reason::Shape);

    let mut unknown = good.clone();
    unknown[0] ^= 0xff;
    let err = l.submit_calldata(1, &alice(), 10, &unknown).unwrap_err();
    assert_eq!(err.reason, Reason::Shape);

    let mut wide = good;
    wide[4 + 32 + 3] = 1;
    let err = l.submit_calldata(1, &alice(), 10, &wide).unwrap_err();
    assert_eq!(err.reason, Reason::Shape);
    assert!(l.observed().is_empty());
}

#[test]
fn unfunded_caller_is_refused_before_execution() {
    let mut l = deployed();
    let poor = Address::from_short([0x01; 20]);
    let call = StepCall {
        step: 1,
        svs: vec![],
        prev_time: 100,
        msg: vec![Value::UInt(1)],
        pay: 10,
    };
    assert_eq!(l.submit(&poor, &call).unwrap_err().reason, Reason::Funds);
}

#[test]
fn artifact_carries_abi_and_deployer_slot() {
    let a = artifact();
    assert_eq!(a.placeholders.iter().collect::<Vec<_>>(), ["Deployer"]);
    assert!(a.program("contract").unwrap().contains("{{Deployer}}"));
    assert!(!a.program("runtime").unwrap().contains("{{"));
    let p = countdown();
    let sig = abi::function_signature(&p, p.step(2).unwrap()).unwrap();
    assert_eq!(sig, "m2(((address,uint256,uint256,uint256),()))");
    let sel = format!("0x{}", hex::encode(abi::selector(&sig)));
    assert_eq!(a.manifest["selectors"]["m2"], sel.as_str());
    assert_eq!(a.manifest["abi"].as_array().unwrap().len(), 6);
    assert_eq!(a.fingerprint(), artifact().fingerprint());
}

#[test]
fn wrong_backend_is_refused() {
    let mut a = artifact();
    a.backend = tandem_core::BackendKind::StackMachine;
    assert!(matches!(
        AccountLedger::deploy(countdown(), &a, deployer(), 1),
        Err(DeployError::Backend(_))
    ));
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
