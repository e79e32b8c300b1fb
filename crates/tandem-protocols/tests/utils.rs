//! Shared fixtures: funded ledgers for both backends and hand-built calls.

#![allow(dead_code, clippy::unwrap_used)]

use tandem_client::DriverOptions;
use tandem_core::{compile, Ledger, Observed, StepCall};
use tandem_digest::{Address, Digest, Value};
use tandem_evm::{AccountContract, AccountLedger};
use tandem_protocols::rps::{self, result, steps};
use tandem_protocols::ScriptedHost;
use tandem_teal::{StackLedger, StackMachine};

pub const WAGER: u64 = 25;
pub const FUNDS: u64 = 1_000;
pub const DEADLINE: u64 = rps::DEADLINE;
pub const DEPLOYED_AT: u64 = 1_000;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .try_init();
}

pub fn alice() -> Address {
    Address::from_short([0xa1; 20])
}

pub fn bob() -> Address {
    Address::from_short([0xb0; 20])
}

pub fn deployer() -> Address {
    Address::from_short([0xde; 20])
}

pub fn teal() -> StackLedger {
    init_tracing();
    let p = rps::rock_paper_scissors(DEADLINE);
    let artifact = compile::<StackMachine>(&p).unwrap();
    let mut l = StackLedger::deploy(p, &artifact, deployer(), DEPLOYED_AT).unwrap();
    l.fund(alice(), FUNDS);
    l.fund(bob(), FUNDS);
    l
}

pub fn evm() -> AccountLedger {
    init_tracing();
    let p = rps::rock_paper_scissors(DEADLINE);
    let artifact = compile::<AccountContract>(&p).unwrap();
    let mut l = AccountLedger::deploy(p, &artifact, deployer(), DEPLOYED_AT).unwrap();
    l.fund(alice(), FUNDS);
    l.fund(bob(), FUNDS);
    l
}

pub fn opts() -> DriverOptions {
    DriverOptions {
        max_ticks: 200,
        advance_by: 1,
    }
}

pub fn alice_host(hands: &[u64]) -> (Address, ScriptedHost) {
    (alice(), ScriptedHost::new("alice", 7).choose("wager", [WAGER]).choose("hand", hands.iter().copied()))
}

pub fn bob_host(hands: &[u64]) -> (Address, ScriptedHost) {
    (bob(), ScriptedHost::new("bob", 11).choose("hand", hands.iter().copied()))
}

/// `(step, time, msg)` of every accepted step.
pub fn transcript(log: &[Observed]) -> Vec<(u32, u64, Vec<Value>)> {
    log.iter().map(|o| (o.step, o.time, o.msg.clone())).collect()
}

/// Persistent variables of the loop head and later states.
pub fn loop_svs(extra: &[Value]) -> Vec<Value> {
    let mut v = vec![
        Value::Address(alice()),
        Value::UInt(WAGER),
        Value::Address(bob()),
        Value::UInt(2 * WAGER),
    ];
    v.extend_from_slice(extra);
    v
}

fn call(step: u32, svs: Vec<Value>, prev_time: u64, msg: Vec<Value>, pay: u64) -> StepCall {
    StepCall {
        step,
        svs,
        prev_time,
        msg,
        pay,
    }
}

/// Stake both sides; returns the loop head's entry time.
pub fn stake<L: Ledger>(l: &mut L) -> u64 {
    let t0 = l.deployed_at();
    let c = call(steps::WAGER, vec![], t0, vec![Value::UInt(WAGER)], WAGER);
    let t1 = l.submit(&alice(), &c).unwrap().time;
    let s1 = vec![Value::Address(alice()), Value::UInt(WAGER), Value::UInt(WAGER)];
    l.submit(&bob(), &call(steps::ACCEPT, s1, t1, vec![], WAGER)).unwrap().time
}

/// Commit `commitment` and play `hand_b`; returns the reveal state's
/// variables and entry time.
pub fn to_reveal<L: Ledger>(l: &mut L, t4: u64, commitment: Digest, hand_b: u64) -> (Vec<Value>, u64) {
    let s4 = loop_svs(&[Value::UInt(result::DRAW)]);
    let t6 = l
        .submit(&alice(), &call(steps::COMMIT, s4, t4, vec![Value::Digest(commitment)], 0))
        .unwrap()
        .time;
    let s6 = loop_svs(&[Value::Digest(commitment)]);
    let t8 = l
        .submit(&bob(), &call(steps::PLAY, s6, t6, vec![Value::UInt(hand_b)], 0))
        .unwrap()
        .time;
    (loop_svs(&[Value::Digest(commitment), Value::UInt(hand_b)]), t8)
}

pub fn reveal(svs: &[Value], t8: u64, salt: u64, hand_a: u64) -> StepCall {
    call(steps::REVEAL, svs.to_vec(), t8, vec![Value::UInt(salt), Value::UInt(hand_a)], 0)
}

pub fn reveal_timeout(svs: &[Value], t8: u64) -> StepCall {
    call(steps::REVEAL_TIMEOUT, svs.to_vec(), t8, vec![], 0)
}
