//! Drives one interpreter against both generated ledgers.
//!
//! The countdown here asks its host to accept each tick, so a host that
//! refuses leaves the deadline to lapse and the close step takes over.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use std::sync::Arc;
use tandem_client::{run, ClientError, DriverOptions, HostError, Interact, Participant, Poll};
use tandem_core::build::*;
use tandem_core::{
    compile, Call, Ledger, Local, Payout, Protocol, SenderCheck, SrcLoc, StateDef, Step, StepError, Stmt, Tail,
    TimeoutBranch, VarDecl,
};
use tandem_digest::{empty_digest, Address, Kind, Value};
use tandem_evm::{AccountContract, AccountLedger};
use tandem_teal::{StackLedger, StackMachine};

const DELTA: u64 = 4;

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
    let mut tick = step(
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
    tick.local = vec![Local::Interact {
        bind: None,
        call: Call::AcceptOffer(var(1)),
    }];
    let close = step(3, 1, SenderCheck::Anyone, refund(), None);
    Protocol {
        name: "countdown".into(),
        version: 1,
        participants: vec![tandem_core::Participant { name: "Depositor".into() }],
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

/// Answers `n`, accepts ticks until `refuse_below`, records callbacks.
#[derive(Debug, Default)]
struct Host {
    n: Option<Value>,
    decline_choice: bool,
    refuse_below: Option<u64>,
    offers: Vec<Value>,
    timeouts: usize,
    outcomes: Vec<Option<Value>>,
}

impl Host {
    fn new(n: u64) -> Self {
        Self {
            n: Some(Value::UInt(n)),
            ..Self::default()
        }
    }
}

impl Interact for Host {
    fn get_local_choice(&mut self, name: &str) -> Result<Value, HostError> {
        if self.decline_choice {
            return Err(HostError::Declined(name.into()));
        }
        match name {
            "n" => self.n.clone().ok_or_else(|| HostError::Unavailable(name.into())),
            _ => Err(HostError::Unavailable(name.into())),
        }
    }

    fn get_randomness(&mut self) -> Result<[u8; 32], HostError> {
        Ok([7; 32])
    }

    fn accept_or_reject_offer(&mut self, offer: &Value) -> Result<(), HostError> {
        self.offers.push(offer.clone());
        match (self.refuse_below, offer.as_uint()) {
            (Some(limit), Some(n)) if n < limit => Err(HostError::Declined(format!("tick {n}"))),
            _ => Ok(()),
        }
    }

    fn on_timeout(&mut self) {
        self.timeouts += 1;
    }

    fn on_outcome(&mut self, outcome: Option<&Value>) {
        self.outcomes.push(outcome.cloned());
    }
}

fn alice() -> Address {
    Address::from_short([0xa1; 20])
}

fn deployer() -> Address {
    Address::from_short([0xde; 20])
}

fn stack_ledger() -> StackLedger {
    init_tracing();
    let p = countdown();
    let artifact = compile::<StackMachine>(&p).unwrap();
    let mut l = StackLedger::deploy(p, &artifact, deployer(), 50).unwrap();
    l.fund(alice(), 1_000);
    l
}

fn account_ledger() -> AccountLedger {
    init_tracing();
    let p = countdown();
    let artifact = compile::<AccountContract>(&p).unwrap();
    let mut l = AccountLedger::deploy(p, &artifact, deployer(), 50).unwrap();
    l.fund(alice(), 1_000);
    l
}

fn depositor<L: Ledger>(l: &L, host: Host) -> Participant<Host> {
    Participant::new(Arc::new(countdown()), 0, alice(), host, l.deployed_at())
}

fn opts() -> DriverOptions {
    DriverOptions {
        max_ticks: 50,
        advance_by: 1,
    }
}

fn drive_to_refund<L: Ledger>(mut l: L) {
    let mut parts = vec![depositor(&l, Host::new(3))];
    let report = run(&mut l, &mut parts, &opts()).unwrap();

    assert_eq!(report.outcome, Some(Value::UInt(0)));
    assert_eq!(report.submitted, 5);
    assert_eq!(report.timeouts, 0);
    assert_eq!(report.ticks, 0);
    assert_eq!(l.state_digest(), empty_digest());
    assert_eq!(l.balance(&alice()), 1_000);

    let p = &parts[0];
    assert_eq!(p.state().rounds, 3);
    assert_eq!(p.state().seen, 5);
    let host = p.host();
    assert_eq!(host.offers, vec![Value::UInt(3), Value::UInt(2), Value::UInt(1), Value::UInt(0)]);
    assert_eq!(host.outcomes, vec![Some(Value::UInt(0))]);
    assert_eq!(host.timeouts, 0);
}

#[test]
fn stack_ledger_runs_to_refund() {
    drive_to_refund(stack_ledger());
}

#[test]
fn account_ledger_runs_to_refund() {
    drive_to_refund(account_ledger());
}

fn drive_to_timeout<L: Ledger>(mut l: L) {
    let mut host = Host::new(3);
    host.refuse_below = Some(3);
    let mut parts = vec![depositor(&l, host)];
    let report = run(&mut l, &mut parts, &opts()).unwrap();

    // One accepted tick, then the refusal lets the deadline lapse.
    assert_eq!(report.submitted, 3);
    assert_eq!(report.timeouts, 1);
    assert_eq!(report.ticks, DELTA + 1);
    assert_eq!(report.outcome, Some(Value::UInt(2)));
    assert_eq!(l.balance(&alice()), 1_000);
    assert_eq!(l.escrow_balance(), 0);

    let host = parts[0].host();
    assert_eq!(host.timeouts, 1);
    assert_eq!(host.outcomes, vec![Some(Value::UInt(2))]);
    assert_eq!(host.offers, vec![Value::UInt(3), Value::UInt(2)]);
}

#[test]
fn stack_ledger_declined_tick_times_out() {
    drive_to_timeout(stack_ledger());
}

#[test]
fn account_ledger_declined_tick_times_out() {
    drive_to_timeout(account_ledger());
}

#[test]
fn missing_choice_surfaces_as_a_host_error() {
    let mut l = stack_ledger();
    let mut host = Host::new(0);
    host.n = None;
    let mut parts = vec![depositor(&l, host)];
    let err = run(&mut l, &mut parts, &opts()).unwrap_err();
    assert!(matches!(err, ClientError::Host(HostError::Unavailable(_))));
    assert!(l.observed().is_empty());
}

#[test]
fn mistyped_choice_is_caught_before_submission() {
    let mut l = account_ledger();
    let mut host = Host::new(0);
    host.n = Some(Value::Address(alice()));
    let mut p = depositor(&l, host);
    let err = p.step(&mut l).unwrap_err();
    assert!(matches!(err, ClientError::Local { step: 1, .. }));
    assert!(l.observed().is_empty());
}

#[test]
fn overflowing_payment_fails_the_local_check() {
    let mut l = stack_ledger();
    let mut p = depositor(&l, Host::new(u64::MAX));
    let err = p.step(&mut l).unwrap_err();
    assert!(matches!(err, ClientError::Check(StepError::Arithmetic { .. })), "{err}");
    assert!(l.observed().is_empty());
    assert_eq!(l.balance(&alice()), 1_000);
}

#[test]
fn unfunded_deposit_is_a_ledger_rejection() {
    let mut l = account_ledger();
    let mut p = depositor(&l, Host::new(200));
    let err = p.step(&mut l).unwrap_err();
    assert!(matches!(err, ClientError::Rejected(_)));
    assert!(l.observed().is_empty());
}

#[test]
fn a_stranger_only_waits_and_follows() {
    let mut l = stack_ledger();
    let mut owner = depositor(&l, Host::new(1));
    let mut watcher = Participant::new(Arc::new(countdown()), 1, Address::from_short([0x77; 20]), Host::new(9), 50);

    assert!(matches!(owner.step(&mut l).unwrap(), Poll::Progressed(_)));
    assert_eq!(watcher.step(&mut l).unwrap(), Poll::Waiting);
    assert_eq!(watcher.state().seen, 1);
    assert_eq!(watcher.state().env.get(1), Some(&Value::UInt(1)));

    while owner.step(&mut l).unwrap() != Poll::Halted(Some(Value::UInt(0))) {}
    assert_eq!(watcher.step(&mut l).unwrap(), Poll::Halted(Some(Value::UInt(0))));
    assert_eq!(watcher.host().outcomes, vec![Some(Value::UInt(0))]);
}

#[test]
fn declined_deposit_stalls_the_run() {
    let mut l = account_ledger();
    let mut host = Host::new(1);
    host.decline_choice = true;
    let mut parts = vec![depositor(&l, host)];
    let err = run(&mut l, &mut parts, &opts()).unwrap_err();
    assert!(matches!(err, ClientError::Stalled(50)));
    assert_eq!(l.now(), 100);
    assert!(l.observed().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn both_ledgers_agree_on_the_transcript(n in 0u64..6, refuse in proptest::option::of(0u64..6)) {
        let mut hs = Host::new(n);
        hs.refuse_below = refuse;
        let mut ha = Host::new(n);
        ha.refuse_below = refuse;

        let mut sl = stack_ledger();
        let mut al = account_ledger();
        let mut ps = vec![depositor(&sl, hs)];
        let mut pa = vec![depositor(&al, ha)];
        let rs = run(&mut sl, &mut ps, &opts()).unwrap();
        let ra = run(&mut al, &mut pa, &opts()).unwrap();

        prop_assert_eq!(&rs, &ra);
        let steps = |l: &[tandem_core::Observed]| l.iter().map(|o| (o.step, o.time, o.msg.clone())).collect::<Vec<_>>();
        prop_assert_eq!(steps(sl.observed()), steps(al.observed()));
        prop_assert_eq!(sl.balance(&alice()), al.balance(&alice()));
    }
}
